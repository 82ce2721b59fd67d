pub mod robots;
pub mod throttle;

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use anyhow::Result;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use indicatif::{ProgressBar, ProgressStyle};
use reqwest::header::{HeaderMap, CONTENT_LANGUAGE, CONTENT_TYPE, LAST_MODIFIED};
use tokio::sync::{mpsc, Semaphore};
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};
use url::Url;

use crate::config::SeedSource;
use crate::error::FetchError;
use crate::manifest::{ManifestEntry, ManifestWriter};
use crate::store::{self, Layout, RawPageMeta};
use robots::RobotsCache;
use throttle::DomainThrottle;

/// Status line, final URL, the headers the pipeline cares about, and the body.
#[derive(Debug, Clone, Default)]
pub struct HttpResponse {
    pub status: u16,
    pub final_url: String,
    pub content_type: Option<String>,
    pub content_language: Option<String>,
    pub last_modified: Option<String>,
    pub body: Vec<u8>,
}

impl HttpResponse {
    pub fn is_success(&self) -> bool {
        (200..300).contains(&self.status)
    }

    /// Charset from `Content-Type`, defaulting to utf-8.
    pub fn encoding(&self) -> String {
        self.content_type
            .as_deref()
            .and_then(|ct| {
                ct.split(';')
                    .filter_map(|p| p.trim().strip_prefix("charset="))
                    .next()
            })
            .map(|c| c.trim_matches('"').to_lowercase())
            .unwrap_or_else(|| "utf-8".to_string())
    }
}

/// Single GET per call. Non-2xx statuses come back as `Ok`; only transport failures are errors.
#[async_trait]
pub trait Transport: Send + Sync {
    async fn get(&self, url: &Url) -> Result<HttpResponse, FetchError>;
}

pub struct HttpTransport {
    client: reqwest::Client,
}

impl HttpTransport {
    pub fn new(user_agent: &str, timeout: Duration) -> Result<Self> {
        let client = reqwest::Client::builder()
            .user_agent(user_agent)
            .timeout(timeout)
            .redirect(reqwest::redirect::Policy::limited(10))
            .build()?;
        Ok(Self { client })
    }
}

#[async_trait]
impl Transport for HttpTransport {
    async fn get(&self, url: &Url) -> Result<HttpResponse, FetchError> {
        let response = self.client.get(url.clone()).send().await?;
        let status = response.status().as_u16();
        let final_url = response.url().to_string();
        let headers = response.headers().clone();
        let body = response.bytes().await?.to_vec();
        Ok(HttpResponse {
            status,
            final_url,
            content_type: header(&headers, CONTENT_TYPE),
            content_language: header(&headers, CONTENT_LANGUAGE),
            last_modified: header(&headers, LAST_MODIFIED),
            body,
        })
    }
}

fn header(headers: &HeaderMap, name: reqwest::header::HeaderName) -> Option<String> {
    headers
        .get(name)
        .and_then(|v| v.to_str().ok())
        .map(|v| v.trim().to_string())
        .filter(|v| !v.is_empty())
}

#[derive(Debug, Clone)]
pub struct FetchOptions {
    pub delay: Duration,
    /// Domains fetched at once. Requests within a domain are always sequential.
    pub concurrency: usize,
    pub ignore_robots: bool,
}

impl Default for FetchOptions {
    fn default() -> Self {
        Self {
            delay: Duration::from_secs(2),
            concurrency: 1,
            ignore_robots: false,
        }
    }
}

#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct FetchStats {
    pub total: usize,
    pub ok: usize,
    pub errors: usize,
    pub disallowed: usize,
    pub cancelled: usize,
}

/// What a domain worker hands back to the writer loop for one seed.
struct Attempt {
    seed: SeedSource,
    domain: String,
    attempted_at: DateTime<Utc>,
    result: Result<HttpResponse, FetchError>,
}

struct FetchContext {
    transport: Arc<dyn Transport>,
    robots: RobotsCache,
    options: FetchOptions,
    cancel: CancellationToken,
    permits: Semaphore,
}

/// Fetch every seed once. Each seed yields exactly one manifest row; only a
/// failure to persist a row or a raw page aborts the run.
pub async fn fetch_sources(
    layout: &Layout,
    sources: &[SeedSource],
    transport: Arc<dyn Transport>,
    user_agent: &str,
    options: FetchOptions,
    cancel: CancellationToken,
) -> Result<FetchStats> {
    layout.ensure()?;
    let mut manifest = ManifestWriter::open(&layout.manifest_path())?;

    if options.ignore_robots {
        warn!("robots.txt checks disabled for this run (--ignore-robots)");
    }

    let total = sources.len();
    let mut stats = FetchStats {
        total,
        ..Default::default()
    };

    let pb = ProgressBar::new(total as u64);
    pb.set_style(
        ProgressStyle::default_bar()
            .template("[{elapsed_precise}] {bar:40} {pos}/{len} ({per_sec}, eta {eta})")?
            .progress_chars("=> "),
    );

    let (valid, invalid): (Vec<_>, Vec<_>) = sources
        .iter()
        .cloned()
        .partition(|s| s.parsed_url().is_some() && s.domain().is_some());

    for seed in invalid {
        let attempt = Attempt {
            domain: seed.domain().unwrap_or_default(),
            attempted_at: Utc::now(),
            result: Err(FetchError::InvalidUrl(seed.url.clone())),
            seed,
        };
        record(layout, &mut manifest, attempt, &mut stats)?;
        pb.inc(1);
    }

    let concurrency = options.concurrency.max(1);
    let ctx = Arc::new(FetchContext {
        transport,
        robots: RobotsCache::new(user_agent),
        options,
        cancel,
        permits: Semaphore::new(concurrency),
    });

    // Channel: domain workers send attempts, this loop persists them
    let (tx, mut rx) = mpsc::channel::<Attempt>(concurrency * 2);

    for (domain, seeds) in group_by_domain(valid) {
        let ctx = Arc::clone(&ctx);
        let tx = tx.clone();
        tokio::spawn(async move {
            run_domain(ctx, domain, seeds, tx).await;
        });
    }
    drop(tx);

    while let Some(attempt) = rx.recv().await {
        record(layout, &mut manifest, attempt, &mut stats)?;
        pb.inc(1);
    }

    pb.finish_and_clear();
    info!(
        total = stats.total,
        ok = stats.ok,
        errors = stats.errors,
        disallowed = stats.disallowed,
        cancelled = stats.cancelled,
        origins = ctx.robots.cached_origins(),
        "Fetch finished"
    );
    Ok(stats)
}

/// Domains in first-appearance order, seeds in configuration order.
fn group_by_domain(seeds: Vec<SeedSource>) -> Vec<(String, Vec<SeedSource>)> {
    let mut groups: Vec<(String, Vec<SeedSource>)> = Vec::new();
    let mut index: HashMap<String, usize> = HashMap::new();
    for seed in seeds {
        let domain = seed.domain().unwrap_or_default();
        match index.get(&domain) {
            Some(&i) => groups[i].1.push(seed),
            None => {
                index.insert(domain.clone(), groups.len());
                groups.push((domain, vec![seed]));
            }
        }
    }
    groups
}

async fn run_domain(
    ctx: Arc<FetchContext>,
    domain: String,
    seeds: Vec<SeedSource>,
    tx: mpsc::Sender<Attempt>,
) {
    let permit = tokio::select! {
        permit = ctx.permits.acquire() => permit.ok(),
        _ = ctx.cancel.cancelled() => None,
    };

    let mut throttle = DomainThrottle::new(ctx.options.delay);
    for seed in seeds {
        let result = if permit.is_none() || ctx.cancel.is_cancelled() {
            Err(FetchError::Cancelled)
        } else {
            fetch_one(&ctx, &seed, &mut throttle).await
        };
        let attempt = Attempt {
            seed,
            domain: domain.clone(),
            attempted_at: Utc::now(),
            result,
        };
        if tx.send(attempt).await.is_err() {
            // writer loop is gone (fatal error upstream)
            return;
        }
    }
}

async fn fetch_one(
    ctx: &FetchContext,
    seed: &SeedSource,
    throttle: &mut DomainThrottle,
) -> Result<HttpResponse, FetchError> {
    let url = seed
        .parsed_url()
        .ok_or_else(|| FetchError::InvalidUrl(seed.url.clone()))?;

    let seed_delay = seed.delay().unwrap_or_default();

    if !ctx.options.ignore_robots {
        let policy = match ctx.robots.cached(&url) {
            Some(policy) => policy,
            None => {
                // the robots.txt GET counts as a request to the domain
                pace(ctx, throttle, seed_delay).await?;
                ctx.robots.policy_for(ctx.transport.as_ref(), &url).await
            }
        };
        if let Some(delay) = policy.crawl_delay() {
            throttle.raise_to(delay);
        }
        if !policy.allows(&url) {
            return Err(FetchError::RobotsDisallowed);
        }
    }

    pace(ctx, throttle, seed_delay).await?;
    let response = ctx.transport.get(&url).await?;
    if !response.is_success() {
        return Err(FetchError::Status(response.status));
    }
    Ok(response)
}

async fn pace(ctx: &FetchContext, throttle: &mut DomainThrottle, at_least: Duration) -> Result<(), FetchError> {
    tokio::select! {
        _ = throttle.wait(at_least) => Ok(()),
        _ = ctx.cancel.cancelled() => Err(FetchError::Cancelled),
    }
}

/// Persist one attempt: raw page + sidecar on success, and always one manifest row.
fn record(
    layout: &Layout,
    manifest: &mut ManifestWriter,
    attempt: Attempt,
    stats: &mut FetchStats,
) -> Result<()> {
    let Attempt {
        seed,
        domain,
        attempted_at,
        result,
    } = attempt;

    let entry = match result {
        Ok(response) => {
            let stem = store::page_stem(&domain, &seed.url, attempted_at);
            let meta = RawPageMeta {
                url: seed.url.trim().to_string(),
                final_url: if response.final_url.is_empty() {
                    seed.url.trim().to_string()
                } else {
                    response.final_url.clone()
                },
                fetched_at: attempted_at,
                encoding: response.encoding(),
                http_status: response.status,
                content_type: response.content_type.clone(),
                content_language: response.content_language.clone(),
                last_modified: response.last_modified.clone(),
                source_name: seed.display_name().to_string(),
                language_hint: seed.language.clone(),
            };
            let path = store::write_raw_page(layout, &stem, &response.body, &meta)?;
            stats.ok += 1;
            info!(url = %seed.url, status = response.status, bytes = response.body.len(), "Fetched");
            ManifestEntry {
                url: seed.url.trim().to_string(),
                domain,
                fetched_at: attempted_at,
                status: response.status.to_string(),
                content_hash: store::content_hash(&response.body),
                local_path: path.to_string_lossy().to_string(),
            }
        }
        Err(err) => {
            match err {
                FetchError::RobotsDisallowed => stats.disallowed += 1,
                FetchError::Cancelled => stats.cancelled += 1,
                _ => stats.errors += 1,
            }
            warn!(url = %seed.url, stage = "fetch", reason = %err, "Fetch failed");
            ManifestEntry {
                url: seed.url.trim().to_string(),
                domain,
                fetched_at: attempted_at,
                status: err.manifest_status(),
                content_hash: String::new(),
                local_path: String::new(),
            }
        }
    };
    manifest.append(&entry)
}
