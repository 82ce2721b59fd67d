pub mod blocks;
pub mod meta;
pub mod text;

use anyhow::Result;
use indicatif::{ProgressBar, ProgressStyle};
use rayon::prelude::*;
use scraper::{Html, Selector};
use serde::{Deserialize, Serialize};
use std::sync::LazyLock;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};
use url::Url;

use crate::error::ParseError;
use crate::store::{self, Layout, RawPage, RawPageMeta};
use blocks::CandidateBlock;
use meta::PageMetadata;

static BODY: LazyLock<Selector> = LazyLock::new(|| Selector::parse("body").unwrap());

const CHUNK_SIZE: usize = 500;

/// Interim record for one raw page.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PageRecord {
    pub stem: String,
    pub page: RawPageMeta,
    pub domain: String,
    pub segmentation: Segmentation,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum Segmentation {
    Parsed {
        metadata: PageMetadata,
        candidates: Vec<CandidateBlock>,
    },
    Failed {
        reason: String,
    },
}

impl PageRecord {
    fn failed(stem: &str, page: RawPageMeta, err: ParseError) -> Self {
        Self {
            stem: stem.to_string(),
            domain: domain_of(&page.final_url),
            page,
            segmentation: Segmentation::Failed {
                reason: err.to_string(),
            },
        }
    }

    pub fn candidates(&self) -> &[CandidateBlock] {
        match &self.segmentation {
            Segmentation::Parsed { candidates, .. } => candidates,
            Segmentation::Failed { .. } => &[],
        }
    }
}

/// Lowercase host of `url`, empty when it has none.
pub fn domain_of(url: &str) -> String {
    Url::parse(url)
        .ok()
        .and_then(|u| u.host_str().map(str::to_lowercase))
        .unwrap_or_default()
}

/// Decode raw bytes to text, rejecting documents that cannot be HTML.
pub fn decode(bytes: &[u8], encoding: &str) -> Result<String, ParseError> {
    if bytes.iter().all(|b| b.is_ascii_whitespace()) {
        return Err(ParseError::Empty);
    }
    if bytes.contains(&0) {
        return Err(ParseError::Binary);
    }

    let text = match encoding.to_ascii_lowercase().as_str() {
        // single-byte Latin encodings map byte-for-codepoint
        "iso-8859-1" | "latin1" | "latin-1" | "windows-1252" | "cp1252" | "us-ascii" => {
            bytes.iter().map(|&b| b as char).collect()
        }
        _ => String::from_utf8_lossy(bytes).into_owned(),
    };

    let total = text.chars().count();
    let replaced = text.chars().filter(|&c| c == char::REPLACEMENT_CHARACTER).count();
    if replaced * 10 > total {
        return Err(ParseError::Binary);
    }
    if !has_markup(&text) {
        return Err(ParseError::NotMarkup);
    }
    Ok(text)
}

fn has_markup(text: &str) -> bool {
    text.as_bytes().windows(2).any(|w| {
        w[0] == b'<' && (w[1].is_ascii_alphabetic() || matches!(w[1], b'!' | b'/' | b'?'))
    })
}

/// Segment one raw page. Never fails; unparsable input becomes a failed record.
pub fn segment_page(page: &RawPage) -> PageRecord {
    let html = match decode(&page.html, &page.meta.encoding) {
        Ok(html) => html,
        Err(e) => return PageRecord::failed(&page.stem, page.meta.clone(), e),
    };

    let doc = Html::parse_document(&html);
    let base = Url::parse(&page.meta.final_url)
        .or_else(|_| Url::parse(&page.meta.url))
        .ok();
    let metadata = meta::read_metadata(&doc, base.as_ref());
    let root = doc
        .select(&BODY)
        .next()
        .unwrap_or_else(|| doc.root_element());
    let candidates = blocks::segment(root, &page.meta.final_url);

    PageRecord {
        stem: page.stem.clone(),
        domain: domain_of(&page.meta.final_url),
        page: page.meta.clone(),
        segmentation: Segmentation::Parsed {
            metadata,
            candidates,
        },
    }
}

#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct SegmentStats {
    pub total: usize,
    pub parsed: usize,
    pub failed: usize,
    pub unreadable: usize,
    pub skipped: usize,
}

impl SegmentStats {
    pub fn print(&self) {
        println!(
            "Segmented {} pages ({} parsed, {} failed, {} unreadable, {} already done).",
            self.total, self.parsed, self.failed, self.unreadable, self.skipped,
        );
    }
}

/// Segment every raw page that has no interim record yet (all of them with `force`).
/// Stops between chunks once `cancel` fires; finished chunks stay written.
pub fn segment_pages(
    layout: &Layout,
    force: bool,
    limit: Option<usize>,
    cancel: &CancellationToken,
) -> Result<SegmentStats> {
    let mut stats = SegmentStats::default();
    let mut stems = Vec::new();
    for stem in store::list_stems(&layout.raw_dir(), "html")? {
        if !force && layout.interim_path(&stem).exists() {
            stats.skipped += 1;
            continue;
        }
        stems.push(stem);
    }
    if let Some(n) = limit {
        stems.truncate(n);
    }
    if stems.is_empty() {
        return Ok(stats);
    }

    info!(stage = "segment", pages = stems.len(), "segmenting raw pages");
    let pb = ProgressBar::new(stems.len() as u64);
    pb.set_style(
        ProgressStyle::default_bar()
            .template("{spinner:.green} [{elapsed_precise}] [{bar:40.cyan/blue}] {pos}/{len} ({per_sec})")?
            .progress_chars("#>-"),
    );

    for chunk in stems.chunks(CHUNK_SIZE) {
        if cancel.is_cancelled() {
            warn!(stage = "segment", remaining = stems.len() - stats.total, "interrupted");
            break;
        }
        let results: Vec<_> = chunk.par_iter().map(|stem| load_and_segment(layout, stem)).collect();

        for (stem, record) in chunk.iter().zip(results) {
            stats.total += 1;
            let Some(record) = record else {
                stats.unreadable += 1;
                continue;
            };
            match &record.segmentation {
                Segmentation::Parsed { candidates, .. } => {
                    stats.parsed += 1;
                    debug!(stage = "segment", stem = %stem, candidates = candidates.len(), "segmented");
                }
                Segmentation::Failed { reason } => {
                    stats.failed += 1;
                    warn!(stage = "segment", url = %record.page.url, reason = %reason, "page not parsable");
                }
            }
            store::write_json(&layout.interim_path(stem), &record)?;
        }
        pb.inc(chunk.len() as u64);
    }

    pb.finish_and_clear();
    Ok(stats)
}

/// `None` when the sidecar itself is unreadable; nothing can be recorded then.
fn load_and_segment(layout: &Layout, stem: &str) -> Option<PageRecord> {
    match store::read_raw_page(layout, stem) {
        Ok(page) => Some(segment_page(&page)),
        Err(e) => match store::read_json::<RawPageMeta>(&layout.raw_meta_path(stem)) {
            Ok(meta) => Some(PageRecord::failed(
                stem,
                meta,
                ParseError::Unreadable(format!("{e:#}")),
            )),
            Err(sidecar_err) => {
                warn!(stage = "segment", stem = %stem, reason = %format!("{sidecar_err:#}"), "skipping page without sidecar");
                None
            }
        },
    }
}


#[cfg(test)]
mod tests {
    use super::testing::{fixture, raw_page};
    use super::*;
    use blocks::BlockKind;
    use tempfile::TempDir;

    #[test]
    fn rejects_empty_binary_and_plain_text() {
        assert_eq!(decode(b"  \n ", "utf-8"), Err(ParseError::Empty));
        assert_eq!(decode(b"<p>a\0b</p>", "utf-8"), Err(ParseError::Binary));
        assert_eq!(decode(&[0xff; 64], "utf-8"), Err(ParseError::Binary));
        assert_eq!(decode(b"just words, 3 < 4", "utf-8"), Err(ParseError::NotMarkup));
        assert!(decode(b"<p>ok</p>", "utf-8").is_ok());
    }

    #[test]
    fn decodes_latin1() {
        assert_eq!(decode(b"<p>caf\xe9</p>", "ISO-8859-1").unwrap(), "<p>café</p>");
    }

    #[test]
    fn failed_page_keeps_sidecar() {
        let record = segment_page(&raw_page("s", "http://news.example/a", ""));
        assert_eq!(record.domain, "news.example");
        assert!(matches!(record.segmentation, Segmentation::Failed { .. }));
        assert!(record.candidates().is_empty());
    }

    #[test]
    fn article_fixture_segments_nav_and_body() {
        let record = segment_page(&raw_page(
            "s",
            "http://news.example/2024/story",
            &fixture("article.html"),
        ));
        let Segmentation::Parsed { metadata, candidates } = &record.segmentation else {
            panic!("expected parsed page");
        };
        assert_eq!(metadata.title.as_deref(), Some("Harbour Expansion Approved | News Example"));

        let nav = candidates
            .iter()
            .find(|c| c.features.in_boilerplate && c.features.kind == BlockKind::List)
            .expect("nav block");
        assert_eq!(nav.features.word_count, 10);

        let body = candidates
            .iter()
            .max_by_key(|c| c.features.word_count)
            .unwrap();
        assert!(body.features.word_count >= 400);
        assert!(body.features.in_article);
        assert!(body.features.link_density < 0.05);

        let indices: Vec<usize> = candidates.iter().map(|c| c.block_index).collect();
        assert_eq!(indices, (0..candidates.len()).collect::<Vec<_>>());
    }

    #[test]
    fn segment_pages_writes_interim_and_skips_done() {
        let dir = TempDir::new().unwrap();
        let layout = Layout::new(dir.path());
        layout.ensure().unwrap();

        let good = raw_page("news.example_a", "http://news.example/a", "<html><body><p>Hello there world</p></body></html>");
        let bad = raw_page("news.example_b", "http://news.example/b", "");
        for page in [&good, &bad] {
            store::write_raw_page(&layout, &page.stem, &page.html, &page.meta).unwrap();
        }
        // html without sidecar
        std::fs::write(layout.raw_html_path("orphan"), "<p>x</p>").unwrap();

        let stats = segment_pages(&layout, false, None, &CancellationToken::new()).unwrap();
        assert_eq!(stats.total, 3);
        assert_eq!(stats.parsed, 1);
        assert_eq!(stats.failed, 1);
        assert_eq!(stats.unreadable, 1);

        let record: PageRecord = store::read_json(&layout.interim_path("news.example_a")).unwrap();
        assert_eq!(record.candidates()[0].raw_text, "Hello there world");

        let again = segment_pages(&layout, false, None, &CancellationToken::new()).unwrap();
        assert_eq!(again.skipped, 2);
        assert_eq!(again.total, 1);

        let forced = segment_pages(&layout, true, Some(1), &CancellationToken::new()).unwrap();
        assert_eq!(forced.total, 1);
    }

    #[test]
    fn cancelled_segment_writes_nothing() {
        let dir = TempDir::new().unwrap();
        let layout = Layout::new(dir.path());
        layout.ensure().unwrap();
        let page = raw_page("news.example_a", "http://news.example/a", "<p>Hello there world</p>");
        store::write_raw_page(&layout, &page.stem, &page.html, &page.meta).unwrap();

        let cancel = CancellationToken::new();
        cancel.cancel();
        let stats = segment_pages(&layout, false, None, &cancel).unwrap();
        assert_eq!(stats.total, 0);
        assert!(!layout.interim_path("news.example_a").exists());

        // the page is picked up by the next run
        let stats = segment_pages(&layout, false, None, &CancellationToken::new()).unwrap();
        assert_eq!(stats.parsed, 1);
    }

    #[test]
    fn missing_html_is_recorded_as_unreadable() {
        let dir = TempDir::new().unwrap();
        let layout = Layout::new(dir.path());
        layout.ensure().unwrap();
        let page = raw_page("gone", "http://news.example/gone", "<p>x</p>");
        store::write_raw_page(&layout, "gone", &page.html, &page.meta).unwrap();
        std::fs::remove_file(layout.raw_html_path("gone")).unwrap();
        // listing is driven by html files, so segment the stem directly
        let record = load_and_segment(&layout, "gone").unwrap();
        let Segmentation::Failed { reason } = record.segmentation else {
            panic!("expected failure");
        };
        assert!(reason.starts_with("raw page unreadable"));
    }
}
