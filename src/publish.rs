//! Merges every article batch into the one dataset the dashboard reads.
//! The dataset is rebuilt from scratch on every publish.

use std::collections::{BTreeMap, HashMap};
use std::fs::{self, OpenOptions};
use std::io::{ErrorKind, Write};
use std::path::{Path, PathBuf};

use anyhow::{bail, Context, Result};
use tracing::{debug, info, warn};

use crate::config::DuplicatePolicy;
use crate::error::MergeRejection;
use crate::extract::ExtractionRecord;
use crate::store::{self, ArticleRecord, ExtractedArticle, Layout, DATASET_COLUMNS};

/// Held for the duration of a publish; a second publish fails instead of racing.
#[derive(Debug)]
pub struct PublishLock {
    path: PathBuf,
}

impl PublishLock {
    pub fn acquire(path: &Path) -> Result<Self> {
        if let Some(dir) = path.parent() {
            fs::create_dir_all(dir).with_context(|| format!("Failed to create {:?}", dir))?;
        }
        match OpenOptions::new().write(true).create_new(true).open(path) {
            Ok(mut file) => {
                writeln!(file, "{}", std::process::id())?;
                Ok(Self {
                    path: path.to_path_buf(),
                })
            }
            Err(e) if e.kind() == ErrorKind::AlreadyExists => {
                bail!("Another publish is running (lock file {:?}); remove it if stale", path)
            }
            Err(e) => Err(e).with_context(|| format!("Failed to create lock {:?}", path)),
        }
    }
}

impl Drop for PublishLock {
    fn drop(&mut self) {
        if let Err(e) = fs::remove_file(&self.path) {
            warn!(path = ?self.path, error = %e, "Failed to remove publish lock");
        }
    }
}

#[derive(Debug, Clone, Default)]
pub struct PublishOptions {
    pub policy: DuplicatePolicy,
    /// Extra CSV batches with the six dataset columns.
    pub include: Vec<PathBuf>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct PublishStats {
    pub inputs: usize,
    pub rows: usize,
    pub duplicates: usize,
    pub rejected: BTreeMap<MergeRejection, usize>,
}

impl PublishStats {
    pub fn rejected_total(&self) -> usize {
        self.rejected.values().sum()
    }

    pub fn print(&self) {
        println!(
            "Published {} rows from {} inputs ({} duplicates merged, {} rejected).",
            self.rows,
            self.inputs,
            self.duplicates,
            self.rejected_total(),
        );
        for (reason, count) in &self.rejected {
            println!("  {:<14} {}", reason.to_string(), count);
        }
    }
}

pub type MergeInput = std::result::Result<ArticleRecord, MergeRejection>;

/// Every candidate row in processing order: extracted pages, then feed
/// batches, then `include` files. Files within a directory go by name.
pub fn collect_inputs(layout: &Layout, include: &[PathBuf]) -> Result<Vec<MergeInput>> {
    let mut inputs = Vec::new();

    for stem in store::list_stems(&layout.extracted_dir(), "json")? {
        let path = layout.extracted_path(&stem);
        match store::read_json::<ExtractionRecord>(&path) {
            Ok(record) => inputs.extend(record.to_article_record().map(Ok)),
            Err(e) => {
                warn!(stage = "publish", path = ?path, reason = %format!("{e:#}"), "malformed extraction record");
                inputs.push(Err(MergeRejection::Malformed));
            }
        }
    }

    for stem in store::list_stems(&layout.feeds_dir(), "jsonl")? {
        let path = layout.feeds_dir().join(format!("{stem}.jsonl"));
        // bytes, so one badly encoded line stays a single rejection
        let bytes = fs::read(&path).with_context(|| format!("Failed to read {:?}", path))?;
        for (line_no, line) in bytes.split(|&b| b == b'\n').enumerate() {
            if line.iter().all(u8::is_ascii_whitespace) {
                continue;
            }
            match serde_json::from_slice::<ArticleRecord>(line) {
                Ok(record) => inputs.push(Ok(record)),
                Err(e) => {
                    warn!(stage = "publish", path = ?path, line = line_no + 1, reason = %e, "malformed feed record");
                    inputs.push(Err(MergeRejection::Malformed));
                }
            }
        }
    }

    for path in include {
        let mut reader = csv::Reader::from_path(path)
            .with_context(|| format!("Failed to open include file {:?}", path))?;
        for row in reader.deserialize::<ExtractedArticle>() {
            match row {
                Ok(article) => inputs.push(Ok(ArticleRecord {
                    fetched_at: None,
                    article,
                })),
                Err(e) => {
                    warn!(stage = "publish", path = ?path, reason = %e, "malformed csv row");
                    inputs.push(Err(MergeRejection::Malformed));
                }
            }
        }
    }

    Ok(inputs)
}

fn validate(article: &ExtractedArticle) -> std::result::Result<(), MergeRejection> {
    if article.url.trim().is_empty() {
        return Err(MergeRejection::MissingUrl);
    }
    if article.body.trim().is_empty() {
        return Err(MergeRejection::MissingBody);
    }
    Ok(())
}

/// Whether `incoming` replaces `existing` under `policy`.
fn supersedes(policy: DuplicatePolicy, existing: &ArticleRecord, incoming: &ArticleRecord) -> bool {
    match policy {
        DuplicatePolicy::FirstSeen => false,
        // later fetch wins; unknown or equal times go to processing order
        DuplicatePolicy::Latest => match (existing.fetched_at, incoming.fetched_at) {
            (Some(old), Some(new)) => new >= old,
            _ => true,
        },
    }
}

/// Deduplicate by url and sort by date (newest first, undated last), then url.
pub fn merge<I>(inputs: I, policy: DuplicatePolicy) -> (Vec<ExtractedArticle>, PublishStats)
where
    I: IntoIterator<Item = MergeInput>,
{
    let mut stats = PublishStats::default();
    let mut by_url: HashMap<String, ArticleRecord> = HashMap::new();

    for input in inputs {
        stats.inputs += 1;
        let record = match input.and_then(|r| validate(&r.article).map(|_| r)) {
            Ok(record) => record,
            Err(reason) => {
                *stats.rejected.entry(reason).or_default() += 1;
                continue;
            }
        };
        let key = record.article.url.trim().to_string();
        match by_url.get_mut(&key) {
            Some(existing) => {
                stats.duplicates += 1;
                if supersedes(policy, existing, &record) {
                    *existing = record;
                }
            }
            None => {
                by_url.insert(key, record);
            }
        }
    }

    let mut rows: Vec<ExtractedArticle> = by_url.into_values().map(|r| r.article).collect();
    rows.sort_by(|a, b| {
        let by_date = match (a.date.is_empty(), b.date.is_empty()) {
            (false, false) => b.date.cmp(&a.date),
            (a_empty, b_empty) => a_empty.cmp(&b_empty),
        };
        by_date.then_with(|| a.url.cmp(&b.url))
    });
    stats.rows = rows.len();
    (rows, stats)
}

/// Atomically replace the dataset. The header is written even with zero rows.
pub fn write_dataset(path: &Path, rows: &[ExtractedArticle]) -> Result<()> {
    store::atomic_write(path, |w| {
        let mut writer = csv::WriterBuilder::new().has_headers(false).from_writer(w);
        writer.write_record(DATASET_COLUMNS)?;
        for row in rows {
            writer.serialize(row)?;
        }
        writer.flush()?;
        Ok(())
    })
    .with_context(|| format!("Failed to write dataset {:?}", path))
}

pub fn read_dataset(path: &Path) -> Result<Vec<ExtractedArticle>> {
    if !path.exists() {
        return Ok(Vec::new());
    }
    let mut reader = csv::Reader::from_path(path).with_context(|| format!("Failed to open {:?}", path))?;
    let mut rows = Vec::new();
    for row in reader.deserialize() {
        rows.push(row.with_context(|| format!("Corrupt row in {:?}", path))?);
    }
    Ok(rows)
}

pub fn publish(layout: &Layout, options: &PublishOptions) -> Result<PublishStats> {
    layout.ensure()?;
    let _lock = PublishLock::acquire(&layout.publish_lock_path())?;

    let inputs = collect_inputs(layout, &options.include)?;
    info!(stage = "publish", inputs = inputs.len(), policy = ?options.policy, "merging article batches");
    let (rows, stats) = merge(inputs, options.policy);
    for (reason, count) in &stats.rejected {
        debug!(stage = "publish", reason = %reason, count, "rows rejected");
    }

    let path = layout.dataset_path();
    write_dataset(&path, &rows)?;
    info!(stage = "publish", rows = rows.len(), path = ?path, "dataset published");
    Ok(stats)
}
