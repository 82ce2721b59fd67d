//! On-disk hand-off between stages. Every stage reads typed records from one
//! directory and writes typed records to the next, so each can be re-run alone.

use std::fs;
use std::io::{BufWriter, Write};
use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use tempfile::NamedTempFile;

pub const DATASET_COLUMNS: [&str; 6] = ["title", "body", "language", "date", "source", "url"];

/// Directory layout rooted at the configured data root.
#[derive(Debug, Clone)]
pub struct Layout {
    root: PathBuf,
}

impl Layout {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    pub fn raw_dir(&self) -> PathBuf {
        self.root.join("raw")
    }

    pub fn manifest_path(&self) -> PathBuf {
        self.raw_dir().join("_manifest.csv")
    }

    pub fn interim_dir(&self) -> PathBuf {
        self.root.join("interim")
    }

    pub fn extracted_dir(&self) -> PathBuf {
        self.root.join("extracted")
    }

    pub fn feeds_dir(&self) -> PathBuf {
        self.root.join("feeds")
    }

    pub fn latest_dir(&self) -> PathBuf {
        self.root.join("processed").join("latest")
    }

    pub fn dataset_path(&self) -> PathBuf {
        self.latest_dir().join("articles.csv")
    }

    pub fn publish_lock_path(&self) -> PathBuf {
        self.latest_dir().join(".publish.lock")
    }

    pub fn raw_html_path(&self, stem: &str) -> PathBuf {
        self.raw_dir().join(format!("{stem}.html"))
    }

    pub fn raw_meta_path(&self, stem: &str) -> PathBuf {
        self.raw_dir().join(format!("{stem}.html.meta.json"))
    }

    pub fn interim_path(&self, stem: &str) -> PathBuf {
        self.interim_dir().join(format!("{stem}.json"))
    }

    pub fn extracted_path(&self, stem: &str) -> PathBuf {
        self.extracted_dir().join(format!("{stem}.json"))
    }

    pub fn ensure(&self) -> Result<()> {
        for dir in [
            self.raw_dir(),
            self.interim_dir(),
            self.extracted_dir(),
            self.feeds_dir(),
            self.latest_dir(),
        ] {
            fs::create_dir_all(&dir).with_context(|| format!("Failed to create {:?}", dir))?;
        }
        Ok(())
    }
}

/// Sidecar written next to every raw HTML file.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RawPageMeta {
    pub url: String,
    pub final_url: String,
    pub fetched_at: DateTime<Utc>,
    pub encoding: String,
    pub http_status: u16,
    #[serde(default)]
    pub content_type: Option<String>,
    #[serde(default)]
    pub content_language: Option<String>,
    #[serde(default)]
    pub last_modified: Option<String>,
    #[serde(default)]
    pub source_name: String,
    #[serde(default)]
    pub language_hint: Option<String>,
}

/// A fetched document plus its sidecar. Read-only once written.
#[derive(Debug, Clone)]
pub struct RawPage {
    pub stem: String,
    pub html: Vec<u8>,
    pub meta: RawPageMeta,
}

/// One row of the published dataset.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ExtractedArticle {
    #[serde(default)]
    pub title: String,
    #[serde(default)]
    pub body: String,
    #[serde(default)]
    pub language: String,
    #[serde(default)]
    pub date: String,
    #[serde(default)]
    pub source: String,
    #[serde(default)]
    pub url: String,
}

/// An article plus the fetch time the publisher needs for precedence.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ArticleRecord {
    pub fetched_at: Option<DateTime<Utc>>,
    pub article: ExtractedArticle,
}

pub fn content_hash(bytes: &[u8]) -> String {
    hex::encode(Sha256::digest(bytes))
}

/// File stem unique per fetch: `<domain>_<url hash>_<timestamp>`.
pub fn page_stem(domain: &str, url: &str, fetched_at: DateTime<Utc>) -> String {
    let safe: String = domain
        .chars()
        .map(|c| if c.is_ascii_alphanumeric() || c == '.' || c == '-' { c } else { '_' })
        .collect();
    let safe = if safe.is_empty() { "unknown".to_string() } else { safe };
    let hash = content_hash(url.as_bytes());
    format!(
        "{}_{}_{}",
        safe,
        &hash[..8],
        fetched_at.format("%Y%m%dT%H%M%S%3fZ")
    )
}

pub fn write_raw_page(layout: &Layout, stem: &str, body: &[u8], meta: &RawPageMeta) -> Result<PathBuf> {
    let html_path = layout.raw_html_path(stem);
    atomic_write(&html_path, |w| {
        w.write_all(body)?;
        Ok(())
    })?;
    write_json(&layout.raw_meta_path(stem), meta)?;
    Ok(html_path)
}

pub fn read_raw_page(layout: &Layout, stem: &str) -> Result<RawPage> {
    let html_path = layout.raw_html_path(stem);
    let html = fs::read(&html_path).with_context(|| format!("Failed to read {:?}", html_path))?;
    let meta: RawPageMeta = read_json(&layout.raw_meta_path(stem))?;
    Ok(RawPage {
        stem: stem.to_string(),
        html,
        meta,
    })
}

/// Sorted stems of files in `dir` whose name ends with `.{ext}`.
pub fn list_stems(dir: &Path, ext: &str) -> Result<Vec<String>> {
    if !dir.exists() {
        return Ok(Vec::new());
    }
    let suffix = format!(".{ext}");
    let mut stems = Vec::new();
    for entry in fs::read_dir(dir).with_context(|| format!("Failed to list {:?}", dir))? {
        let entry = entry?;
        if !entry.file_type()?.is_file() {
            continue;
        }
        let name = entry.file_name().to_string_lossy().to_string();
        if name.starts_with('.') || name.starts_with('_') {
            continue;
        }
        // sidecars share the `.json` extension with stage records
        if name.ends_with(".meta.json") {
            continue;
        }
        if let Some(stem) = name.strip_suffix(&suffix) {
            stems.push(stem.to_string());
        }
    }
    stems.sort();
    Ok(stems)
}

pub fn write_json<T: Serialize>(path: &Path, value: &T) -> Result<()> {
    atomic_write(path, |w| {
        serde_json::to_writer_pretty(&mut *w, value)?;
        Ok(())
    })
}

pub fn read_json<T: DeserializeOwned>(path: &Path) -> Result<T> {
    let text = fs::read_to_string(path).with_context(|| format!("Failed to read {:?}", path))?;
    serde_json::from_str(&text).with_context(|| format!("Failed to decode {:?}", path))
}

/// Write to a temp file in the target directory, then rename over `path`.
/// Readers see either the old file or the complete new one.
pub fn atomic_write<F>(path: &Path, fill: F) -> Result<()>
where
    F: FnOnce(&mut dyn Write) -> Result<()>,
{
    let dir = path
        .parent()
        .filter(|p| !p.as_os_str().is_empty())
        .unwrap_or_else(|| Path::new("."));
    fs::create_dir_all(dir).with_context(|| format!("Failed to create {:?}", dir))?;

    let mut tmp = NamedTempFile::new_in(dir)
        .with_context(|| format!("Failed to create temp file in {:?}", dir))?;
    {
        let mut writer = BufWriter::new(tmp.as_file_mut());
        fill(&mut writer)?;
        writer.flush()?;
    }
    tmp.as_file().sync_all()?;
    tmp.persist(path)
        .map_err(|e| e.error)
        .with_context(|| format!("Failed to replace {:?}", path))?;
    Ok(())
}
