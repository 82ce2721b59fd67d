mod config;
mod error;
mod extract;
mod feeds;
mod fetcher;
mod manifest;
mod parser;
mod publish;
mod store;

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Instant;

use clap::{Args, Parser, Subcommand};
use tokio_util::sync::CancellationToken;
use tracing::warn;

use crate::config::{DuplicatePolicy, Settings};
use crate::extract::{ExtractOptions, ExtractionOutcome, ExtractionRecord};
use crate::feeds::FeedOptions;
use crate::fetcher::{FetchOptions, HttpTransport};
use crate::publish::PublishOptions;
use crate::store::Layout;

#[derive(Parser)]
#[command(name = "insight_scraper", about = "Polite article scraper: fetch, segment, extract, publish")]
struct Cli {
    /// Settings file (YAML, TOML or JSON); INSIGHT_* env vars override it
    #[arg(long, global = true)]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Args, Clone, Default)]
struct FetchArgs {
    /// Skip robots.txt checks (logged)
    #[arg(long)]
    ignore_robots: bool,
    /// Domains fetched at once
    #[arg(long)]
    concurrency: Option<usize>,
    /// Seconds between requests to the same domain
    #[arg(long)]
    delay: Option<f64>,
    /// Request timeout in seconds
    #[arg(long)]
    timeout: Option<f64>,
}

#[derive(Subcommand)]
enum Commands {
    /// Fetch every configured seed URL into data/raw
    Fetch {
        #[command(flatten)]
        args: FetchArgs,
    },
    /// Split raw pages into candidate blocks
    Segment {
        /// Re-segment pages that already have an interim record
        #[arg(long)]
        force: bool,
        /// Max pages to segment
        #[arg(short = 'n', long)]
        limit: Option<usize>,
    },
    /// Pick the best block per page and normalize it into an article
    Extract {
        /// Re-extract pages that already have a record
        #[arg(long)]
        force: bool,
        /// Max pages to extract
        #[arg(short = 'n', long)]
        limit: Option<usize>,
        /// Minimum words in the winning block
        #[arg(long)]
        min_words: Option<usize>,
    },
    /// Pull configured RSS/Atom feeds into an article batch
    Feeds {
        /// Look for a feed link on sources without one
        #[arg(long)]
        discover: bool,
    },
    /// Merge all batches into processed/latest/articles.csv
    Publish {
        /// Extra CSV batch to merge (repeatable)
        #[arg(long)]
        include: Vec<PathBuf>,
        /// Duplicate URL policy
        #[arg(long, value_enum)]
        policy: Option<DuplicatePolicy>,
    },
    /// Fetch + segment + extract + publish in one go
    Run {
        #[command(flatten)]
        args: FetchArgs,
        /// Also ingest feeds before publishing
        #[arg(long)]
        with_feeds: bool,
    },
    /// Show pipeline statistics
    Stats,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "info".into()),
        )
        .init();

    let t0 = Instant::now();
    let cli = Cli::parse();
    let mut settings = Settings::load(cli.config.as_deref())?;
    let layout = Layout::new(&settings.data_root);

    // only the network stages trap Ctrl-C; the rest keep the default exit
    let cancel = CancellationToken::new();
    if matches!(cli.command, Commands::Fetch { .. } | Commands::Run { .. }) {
        watch_interrupts(cancel.clone());
    }

    let result = match cli.command {
        Commands::Fetch { args } => run_fetch(&mut settings, &layout, &args, cancel).await,
        Commands::Segment { force, limit } => {
            let stats = parser::segment_pages(&layout, force, limit, &cancel)?;
            if stats.total == 0 {
                println!("No raw pages to segment. Run 'fetch' first or pass --force.");
            } else {
                stats.print();
            }
            Ok(())
        }
        Commands::Extract {
            force,
            limit,
            min_words,
        } => {
            if let Some(n) = min_words {
                settings.min_words = n;
            }
            run_extract(&settings, &layout, force, limit, &cancel)
        }
        Commands::Feeds { discover } => run_feeds(&settings, &layout, discover, false).await,
        Commands::Publish { include, policy } => {
            let options = PublishOptions {
                policy: policy.unwrap_or(settings.duplicate_policy),
                include,
            };
            let stats = publish::publish(&layout, &options)?;
            stats.print();
            println!("Dataset: {}", layout.dataset_path().display());
            Ok(())
        }
        Commands::Run { args, with_feeds } => {
            let t_fetch = Instant::now();
            run_fetch(&mut settings, &layout, &args, cancel.clone()).await?;
            println!("Fetched in {:.1}s", t_fetch.elapsed().as_secs_f64());
            if cancel.is_cancelled() {
                println!("Interrupted; later stages skipped. Re-run them with 'segment', 'extract' and 'publish'.");
                return Ok(());
            }

            let t_process = Instant::now();
            parser::segment_pages(&layout, false, None, &cancel)?.print();
            run_extract(&settings, &layout, false, None, &cancel)?;
            println!("Processed in {:.1}s", t_process.elapsed().as_secs_f64());
            if cancel.is_cancelled() {
                println!("Interrupted; publish skipped.");
                return Ok(());
            }

            if with_feeds {
                run_feeds(&settings, &layout, false, args.ignore_robots).await?;
            }

            let options = PublishOptions {
                policy: settings.duplicate_policy,
                include: Vec::new(),
            };
            publish::publish(&layout, &options)?.print();
            Ok(())
        }
        Commands::Stats => print_stats(&layout),
    };

    let elapsed = t0.elapsed();
    if elapsed.as_secs() >= 1 {
        println!("\nDone in {}", format_duration(elapsed));
    }

    result
}

/// First Ctrl-C cancels and lets in-flight work finish; a second one exits.
fn watch_interrupts(cancel: CancellationToken) {
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_err() {
            return;
        }
        warn!("Interrupted; finishing in-flight work (Ctrl-C again to quit)");
        cancel.cancel();
        if tokio::signal::ctrl_c().await.is_ok() {
            std::process::exit(130);
        }
    });
}

async fn run_fetch(
    settings: &mut Settings,
    layout: &Layout,
    args: &FetchArgs,
    cancel: CancellationToken,
) -> anyhow::Result<()> {
    if let Some(n) = args.concurrency {
        settings.concurrency = n;
    }
    if let Some(d) = args.delay {
        settings.delay_secs = d;
    }
    if let Some(t) = args.timeout {
        settings.timeout_secs = t;
    }
    if settings.sources.is_empty() {
        println!("No sources configured. Pass --config with a 'sources' list.");
        return Ok(());
    }

    let transport = Arc::new(HttpTransport::new(&settings.user_agent, settings.timeout())?);
    let options = FetchOptions {
        delay: settings.delay(),
        concurrency: settings.concurrency,
        ignore_robots: args.ignore_robots,
    };
    println!(
        "Fetching {} seed URLs ({} domain(s) at a time)...",
        settings.sources.len(),
        options.concurrency.max(1)
    );
    let stats = fetcher::fetch_sources(
        layout,
        &settings.sources,
        transport,
        &settings.user_agent,
        options,
        cancel,
    )
    .await?;
    println!(
        "Done: {} attempted ({} ok, {} errors, {} robots-disallowed, {} cancelled).",
        stats.total, stats.ok, stats.errors, stats.disallowed, stats.cancelled
    );
    Ok(())
}

fn run_extract(
    settings: &Settings,
    layout: &Layout,
    force: bool,
    limit: Option<usize>,
    cancel: &CancellationToken,
) -> anyhow::Result<()> {
    let options = ExtractOptions {
        min_words: settings.min_words,
        body_char_limit: settings.body_char_limit,
        ..Default::default()
    };
    let stats = extract::extract_pages(layout, &options, force, limit, cancel)?;
    if stats.total == 0 {
        println!("No interim records to extract. Run 'segment' first or pass --force.");
    } else {
        stats.print();
    }
    Ok(())
}

async fn run_feeds(settings: &Settings, layout: &Layout, discover: bool, ignore_robots: bool) -> anyhow::Result<()> {
    layout.ensure()?;
    let transport = Arc::new(HttpTransport::new(&settings.user_agent, settings.timeout())?);
    let options = FeedOptions {
        discover,
        items_per_source: settings.feed_items_per_source,
        default_language: settings.default_language.clone(),
        ignore_robots,
        delay: settings.delay(),
    };
    let stats = feeds::fetch_feeds(layout, &settings.sources, transport, &settings.user_agent, &options).await?;
    stats.print();
    Ok(())
}

fn print_stats(layout: &Layout) -> anyhow::Result<()> {
    let entries = manifest::read_manifest(&layout.manifest_path())?;
    println!("Manifest:  {} attempts", entries.len());
    for (status, count) in manifest::status_counts(&entries) {
        println!("  {:<20} {}", status, count);
    }

    let raw = store::list_stems(&layout.raw_dir(), "html")?.len();
    let interim = store::list_stems(&layout.interim_dir(), "json")?.len();
    println!("Raw pages: {}", raw);
    println!("Interim:   {}", interim);

    let (mut articles, mut no_content, mut failed, mut unreadable) = (0, 0, 0, 0);
    for stem in store::list_stems(&layout.extracted_dir(), "json")? {
        match store::read_json::<ExtractionRecord>(&layout.extracted_path(&stem)) {
            Ok(record) => match record.outcome {
                ExtractionOutcome::Article { .. } => articles += 1,
                ExtractionOutcome::NoContent { .. } => no_content += 1,
                ExtractionOutcome::ParseFailed { .. } => failed += 1,
            },
            Err(_) => unreadable += 1,
        }
    }
    println!(
        "Extracted: {} articles, {} no-content, {} parse failures, {} unreadable",
        articles, no_content, failed, unreadable
    );

    let feed_batches = store::list_stems(&layout.feeds_dir(), "jsonl")?.len();
    println!("Feeds:     {} batches", feed_batches);
    let rows = publish::read_dataset(&layout.dataset_path())?.len();
    println!("Dataset:   {} rows", rows);
    Ok(())
}

fn format_duration(d: std::time::Duration) -> String {
    let secs = d.as_secs();
    if secs < 60 {
        format!("{:.1}s", d.as_secs_f64())
    } else if secs < 3600 {
        format!("{}m {}s", secs / 60, secs % 60)
    } else {
        format!("{}h {}m {}s", secs / 3600, (secs % 3600) / 60, secs % 60)
    }
}
