pub mod dates;
pub mod language;
pub mod score;

use anyhow::Result;
use chrono::{DateTime, Utc};
use indicatif::{ProgressBar, ProgressStyle};
use rayon::prelude::*;
use serde::{Deserialize, Serialize};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::parser::text::truncate_chars;
use crate::parser::{domain_of, PageRecord, Segmentation};
use crate::store::{self, ArticleRecord, ExtractedArticle, Layout};
use score::ScoreWeights;

const CHUNK_SIZE: usize = 500;
const FALLBACK_TITLE_CHARS: usize = 140;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum ExtractionOutcome {
    Article {
        article: ExtractedArticle,
        winner_index: usize,
        score: f64,
    },
    /// Best block was under the word threshold, or the page had no blocks.
    NoContent {
        winner_index: Option<usize>,
        best_words: usize,
    },
    ParseFailed {
        reason: String,
    },
}

/// Selector output for one page. `scores` keeps every block's score.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ExtractionRecord {
    pub stem: String,
    pub url: String,
    pub fetched_at: DateTime<Utc>,
    pub outcome: ExtractionOutcome,
    #[serde(default)]
    pub scores: Vec<f64>,
}

impl ExtractionRecord {
    pub fn article(&self) -> Option<&ExtractedArticle> {
        match &self.outcome {
            ExtractionOutcome::Article { article, .. } => Some(article),
            _ => None,
        }
    }

    /// The article with its fetch time, ready for publishing.
    pub fn to_article_record(&self) -> Option<ArticleRecord> {
        self.article().map(|article| ArticleRecord {
            fetched_at: Some(self.fetched_at),
            article: article.clone(),
        })
    }
}

#[derive(Debug, Clone)]
pub struct ExtractOptions {
    pub min_words: usize,
    pub body_char_limit: Option<usize>,
    pub weights: ScoreWeights,
}

impl Default for ExtractOptions {
    fn default() -> Self {
        Self {
            min_words: 40,
            body_char_limit: None,
            weights: ScoreWeights::default(),
        }
    }
}

/// Pick the best block of one page and normalize it. Pure and deterministic.
pub fn extract_page(record: &PageRecord, options: &ExtractOptions) -> ExtractionRecord {
    let page = &record.page;
    let mut out = ExtractionRecord {
        stem: record.stem.clone(),
        url: page.final_url.clone(),
        fetched_at: page.fetched_at,
        outcome: ExtractionOutcome::NoContent {
            winner_index: None,
            best_words: 0,
        },
        scores: Vec::new(),
    };

    let (metadata, candidates) = match &record.segmentation {
        Segmentation::Parsed {
            metadata,
            candidates,
        } => (metadata, candidates),
        Segmentation::Failed { reason } => {
            out.outcome = ExtractionOutcome::ParseFailed {
                reason: reason.clone(),
            };
            return out;
        }
    };

    out.scores = score::score_candidates(candidates, &options.weights);
    let Some(winner) = score::select_best(&out.scores) else {
        return out;
    };
    let block = &candidates[winner];
    if block.features.word_count < options.min_words {
        out.outcome = ExtractionOutcome::NoContent {
            winner_index: Some(winner),
            best_words: block.features.word_count,
        };
        return out;
    }

    let body = match options.body_char_limit {
        Some(limit) => truncate_chars(&block.raw_text, limit),
        None => block.raw_text.clone(),
    };
    let title = metadata
        .title
        .clone()
        .or_else(|| metadata.first_heading.clone())
        .unwrap_or_else(|| first_sentence(&body));
    let url = metadata
        .canonical_url
        .clone()
        .unwrap_or_else(|| page.final_url.clone());
    let language = language::detect_language(
        metadata.declared_language.as_deref(),
        page.content_language.as_deref(),
        page.language_hint.as_deref(),
        &body,
    );
    let date = metadata
        .published
        .as_deref()
        .and_then(dates::normalize_date)
        .or_else(|| page.last_modified.as_deref().and_then(dates::normalize_date))
        .unwrap_or_default();

    out.url = url.clone();
    out.outcome = ExtractionOutcome::Article {
        article: ExtractedArticle {
            title,
            body,
            language,
            date,
            source: source_name(&record.domain, &page.final_url),
            url,
        },
        winner_index: winner,
        score: out.scores[winner],
    };
    out
}

/// Site host without a leading `www.`.
pub fn source_name(domain: &str, url: &str) -> String {
    let host = if domain.is_empty() {
        domain_of(url)
    } else {
        domain.to_lowercase()
    };
    host.strip_prefix("www.").map(str::to_string).unwrap_or(host)
}

fn first_sentence(body: &str) -> String {
    let first_line = body.lines().next().unwrap_or("");
    let end = first_line
        .char_indices()
        .find(|&(_, c)| matches!(c, '.' | '!' | '?'))
        .map_or(first_line.len(), |(i, c)| i + c.len_utf8());
    truncate_chars(first_line[..end].trim(), FALLBACK_TITLE_CHARS)
}

#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct ExtractStats {
    pub total: usize,
    pub articles: usize,
    pub no_content: usize,
    pub parse_failed: usize,
    pub unreadable: usize,
    pub skipped: usize,
}

impl ExtractStats {
    pub fn print(&self) {
        println!(
            "Extracted {} pages ({} articles, {} no-content, {} parse failures, {} unreadable, {} already done).",
            self.total, self.articles, self.no_content, self.parse_failed, self.unreadable, self.skipped,
        );
    }
}

/// Run the selector over every interim record without an extraction record yet.
pub fn extract_pages(
    layout: &Layout,
    options: &ExtractOptions,
    force: bool,
    limit: Option<usize>,
    cancel: &CancellationToken,
) -> Result<ExtractStats> {
    let mut stats = ExtractStats::default();
    let mut stems = Vec::new();
    for stem in store::list_stems(&layout.interim_dir(), "json")? {
        if !force && layout.extracted_path(&stem).exists() {
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

    info!(stage = "extract", pages = stems.len(), min_words = options.min_words, "selecting best blocks");
    let pb = ProgressBar::new(stems.len() as u64);
    pb.set_style(
        ProgressStyle::default_bar()
            .template("{spinner:.green} [{elapsed_precise}] [{bar:40.cyan/blue}] {pos}/{len} ({per_sec})")?
            .progress_chars("#>-"),
    );

    for chunk in stems.chunks(CHUNK_SIZE) {
        if cancel.is_cancelled() {
            warn!(stage = "extract", remaining = stems.len() - stats.total, "interrupted");
            break;
        }
        let results: Vec<_> = chunk
            .par_iter()
            .map(|stem| {
                store::read_json::<PageRecord>(&layout.interim_path(stem))
                    .map(|record| extract_page(&record, options))
            })
            .collect();

        for (stem, result) in chunk.iter().zip(results) {
            stats.total += 1;
            let record = match result {
                Ok(record) => record,
                Err(e) => {
                    stats.unreadable += 1;
                    warn!(stage = "extract", stem = %stem, reason = %format!("{e:#}"), "interim record unreadable");
                    continue;
                }
            };
            match &record.outcome {
                ExtractionOutcome::Article { winner_index, score, .. } => {
                    stats.articles += 1;
                    debug!(stage = "extract", url = %record.url, winner = winner_index, score, "article selected");
                }
                ExtractionOutcome::NoContent { best_words, .. } => {
                    stats.no_content += 1;
                    info!(stage = "extract", url = %record.url, reason = "no-content", best_words, "page excluded");
                }
                ExtractionOutcome::ParseFailed { reason } => {
                    stats.parse_failed += 1;
                    debug!(stage = "extract", url = %record.url, reason = %reason, "page was not parsable");
                }
            }
            store::write_json(&layout.extracted_path(stem), &record)?;
        }
        pb.inc(chunk.len() as u64);
    }

    pb.finish_and_clear();
    Ok(stats)
}
