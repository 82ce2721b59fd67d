use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::{Context, Result};
use clap::ValueEnum;
use serde::{Deserialize, Serialize};
use url::Url;

pub const DEFAULT_USER_AGENT: &str =
    "InsightBotCrawler/0.1 (+https://example.com; contact=admin@example.com)";

/// How the publisher resolves two records that share a URL.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Deserialize, Serialize, ValueEnum)]
#[serde(rename_all = "kebab-case")]
pub enum DuplicatePolicy {
    /// Most recent fetch wins; ties fall back to processing order.
    #[default]
    Latest,
    /// First record in processing order wins.
    FirstSeen,
}

/// A configured page to fetch. Immutable for the duration of a run.
#[derive(Debug, Clone, Default, Deserialize, Serialize)]
pub struct SeedSource {
    #[serde(default)]
    pub name: String,
    pub url: String,
    /// Explicit politeness key; derived from the URL host when absent.
    #[serde(default)]
    pub domain: Option<String>,
    #[serde(default)]
    pub language: Option<String>,
    /// RSS/Atom feed for the `feeds` stage.
    #[serde(default)]
    pub rss: Option<String>,
    #[serde(default)]
    pub delay_secs: Option<f64>,
}

impl SeedSource {
    #[cfg(test)]
    pub fn new(url: &str) -> Self {
        Self {
            url: url.to_string(),
            ..Default::default()
        }
    }

    pub fn parsed_url(&self) -> Option<Url> {
        let url = Url::parse(self.url.trim()).ok()?;
        matches!(url.scheme(), "http" | "https").then_some(url)
    }

    pub fn domain(&self) -> Option<String> {
        if let Some(d) = self.domain.as_deref().map(str::trim).filter(|d| !d.is_empty()) {
            return Some(d.to_lowercase());
        }
        self.parsed_url()
            .and_then(|u| u.host_str().map(|h| h.to_lowercase()))
    }

    pub fn display_name(&self) -> &str {
        if self.name.trim().is_empty() {
            self.url.trim()
        } else {
            self.name.trim()
        }
    }

    pub fn delay(&self) -> Option<Duration> {
        self.delay_secs
            .filter(|d| d.is_finite() && *d >= 0.0)
            .map(Duration::from_secs_f64)
    }
}

/// Runtime settings: defaults, then an optional config file, then `INSIGHT_*` env vars.
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct Settings {
    pub data_root: PathBuf,
    pub user_agent: String,
    pub timeout_secs: f64,
    pub delay_secs: f64,
    pub concurrency: usize,
    pub min_words: usize,
    pub body_char_limit: Option<usize>,
    pub duplicate_policy: DuplicatePolicy,
    pub default_language: String,
    pub feed_items_per_source: usize,
    pub sources: Vec<SeedSource>,
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            data_root: PathBuf::from("./data"),
            user_agent: DEFAULT_USER_AGENT.to_string(),
            timeout_secs: 12.0,
            delay_secs: 2.0,
            concurrency: 1,
            min_words: 40,
            body_char_limit: None,
            duplicate_policy: DuplicatePolicy::Latest,
            default_language: "English".to_string(),
            feed_items_per_source: 8,
            sources: Vec::new(),
        }
    }
}

impl Settings {
    pub fn load(path: Option<&Path>) -> Result<Self> {
        let mut builder = config::Config::builder();
        if let Some(p) = path {
            builder = builder.add_source(config::File::from(p).required(true));
        }
        builder = builder.add_source(
            config::Environment::with_prefix("INSIGHT")
                .try_parsing(true),
        );

        let settings: Settings = builder
            .build()
            .with_context(|| format!("Failed to load settings from {:?}", path))?
            .try_deserialize()
            .context("Invalid settings")?;
        Ok(settings)
    }

    pub fn timeout(&self) -> Duration {
        Duration::from_secs_f64(self.timeout_secs.max(0.1))
    }

    pub fn delay(&self) -> Duration {
        Duration::from_secs_f64(self.delay_secs.max(0.0))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn domain_derived_from_url() {
        let s = SeedSource::new("https://News.Example/a?b=1");
        assert_eq!(s.domain().as_deref(), Some("news.example"));
    }

    #[test]
    fn explicit_domain_wins() {
        let s = SeedSource {
            domain: Some("Example.org".into()),
            ..SeedSource::new("https://cdn.example.org/x")
        };
        assert_eq!(s.domain().as_deref(), Some("example.org"));
    }

    #[test]
    fn non_http_url_has_no_domain() {
        assert!(SeedSource::new("ftp://example.com/file").domain().is_none());
        assert!(SeedSource::new("not a url").parsed_url().is_none());
    }

    #[test]
    fn negative_delay_ignored() {
        let s = SeedSource {
            delay_secs: Some(-1.0),
            ..SeedSource::new("https://a.example/")
        };
        assert!(s.delay().is_none());
    }

    #[test]
    fn loads_yaml_sources() {
        let mut file = tempfile::Builder::new().suffix(".yaml").tempfile().unwrap();
        writeln!(
            file,
            "min_words: 25\nduplicate_policy: first-seen\nsources:\n  - name: Example News\n    url: https://news.example/\n    language: English\n    delay_secs: 1.5\n  - url: https://other.example/feed-home\n    rss: https://other.example/rss.xml"
        )
        .unwrap();

        let settings = Settings::load(Some(file.path())).unwrap();
        assert_eq!(settings.min_words, 25);
        assert_eq!(settings.duplicate_policy, DuplicatePolicy::FirstSeen);
        assert_eq!(settings.sources.len(), 2);
        assert_eq!(settings.sources[0].display_name(), "Example News");
        assert_eq!(settings.sources[0].delay(), Some(Duration::from_millis(1500)));
        assert_eq!(settings.sources[1].rss.as_deref(), Some("https://other.example/rss.xml"));
        assert_eq!(settings.timeout_secs, 12.0);
    }
}
