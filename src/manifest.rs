//! Append-only CSV log of fetch attempts. One row per attempt, never rewritten.

use std::collections::BTreeMap;
use std::fs::{self, OpenOptions};
use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ManifestEntry {
    pub url: String,
    pub domain: String,
    pub fetched_at: DateTime<Utc>,
    /// HTTP status code on success, otherwise a failure status such as `robots-disallowed`.
    pub status: String,
    /// Empty unless a body was stored.
    pub content_hash: String,
    /// Empty unless a body was stored.
    pub local_path: String,
}

pub struct ManifestWriter {
    path: PathBuf,
    writer: csv::Writer<fs::File>,
}

impl ManifestWriter {
    /// Opens `path` for appending, writing the header only when the file is new or empty.
    pub fn open(path: &Path) -> Result<Self> {
        if let Some(dir) = path.parent() {
            fs::create_dir_all(dir).with_context(|| format!("Failed to create {:?}", dir))?;
        }
        let needs_header = fs::metadata(path).map(|m| m.len() == 0).unwrap_or(true);
        let file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(path)
            .with_context(|| format!("Failed to open manifest {:?}", path))?;
        let writer = csv::WriterBuilder::new()
            .has_headers(needs_header)
            .from_writer(file);
        Ok(Self {
            path: path.to_path_buf(),
            writer,
        })
    }

    /// Appends and flushes one row so a crash never loses a recorded attempt.
    pub fn append(&mut self, entry: &ManifestEntry) -> Result<()> {
        self.writer
            .serialize(entry)
            .with_context(|| format!("Failed to append to manifest {:?}", self.path))?;
        self.writer
            .flush()
            .with_context(|| format!("Failed to flush manifest {:?}", self.path))
    }
}

pub fn read_manifest(path: &Path) -> Result<Vec<ManifestEntry>> {
    if !path.exists() {
        return Ok(Vec::new());
    }
    let mut reader = csv::Reader::from_path(path)
        .with_context(|| format!("Failed to open manifest {:?}", path))?;
    let mut entries = Vec::new();
    for row in reader.deserialize() {
        entries.push(row.with_context(|| format!("Corrupt row in manifest {:?}", path))?);
    }
    Ok(entries)
}

/// Count of manifest rows per status, sorted by status.
pub fn status_counts(entries: &[ManifestEntry]) -> BTreeMap<String, usize> {
    let mut counts = BTreeMap::new();
    for e in entries {
        *counts.entry(e.status.clone()).or_insert(0) += 1;
    }
    counts
}
