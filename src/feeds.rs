//! RSS/Atom ingestion. Each configured feed becomes a JSONL batch of articles
//! that the publisher merges alongside the extracted pages.

use std::collections::{HashMap, HashSet};
use std::sync::{Arc, LazyLock};
use std::time::Duration;

use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use quick_xml::events::{BytesStart, Event};
use regex::Regex;
use scraper::Html;
use tracing::{debug, info, warn};
use url::Url;

use crate::config::SeedSource;
use crate::error::FetchError;
use crate::extract::{dates, language, source_name};
use crate::fetcher::robots::RobotsCache;
use crate::fetcher::throttle::DomainThrottle;
use crate::fetcher::{HttpResponse, Transport};
use crate::parser::{self, meta};
use crate::parser::text::{collapse_whitespace, truncate_chars};
use crate::store::{self, ArticleRecord, ExtractedArticle, Layout};

const TITLE_CHARS: usize = 180;
const BODY_CHARS: usize = 800;

static XML_ENCODING: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r#"^\s*<\?xml[^>]*\bencoding\s*=\s*["']([A-Za-z0-9._-]+)["']"#).unwrap()
});

/// One `<item>` or `<entry>` as found in the feed.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct FeedItem {
    pub title: String,
    pub link: String,
    pub summary: String,
    pub content: String,
    pub published: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Field {
    Title,
    Link,
    Summary,
    Content,
    Published,
}

fn field_for(local: &[u8]) -> Option<Field> {
    match local {
        b"title" => Some(Field::Title),
        b"link" => Some(Field::Link),
        b"description" | b"summary" => Some(Field::Summary),
        b"encoded" | b"content" => Some(Field::Content),
        b"pubDate" | b"published" | b"updated" | b"date" => Some(Field::Published),
        _ => None,
    }
}

/// Parse RSS 2.0 `<item>`s and Atom `<entry>`s, in document order.
pub fn parse_feed(xml: &str) -> Result<Vec<FeedItem>> {
    let mut reader = quick_xml::Reader::from_str(xml);
    let mut items = Vec::new();
    let mut current: Option<FeedItem> = None;
    // (field, element name that closes it)
    let mut open: Option<(Field, Vec<u8>)> = None;
    let mut text = String::new();
    let mut buf = Vec::new();

    loop {
        match reader.read_event_into(&mut buf) {
            Ok(Event::Start(e)) => {
                let local = e.local_name();
                match local.as_ref() {
                    b"item" | b"entry" => current = Some(FeedItem::default()),
                    name if current.is_some() && open.is_none() => {
                        if let Some(field) = field_for(name) {
                            if field == Field::Link {
                                take_atom_link(&e, current.as_mut());
                            }
                            open = Some((field, name.to_vec()));
                            text.clear();
                        }
                    }
                    _ => {}
                }
            }
            Ok(Event::Empty(e)) if e.local_name().as_ref() == b"link" => {
                take_atom_link(&e, current.as_mut());
            }
            Ok(Event::Text(e)) if open.is_some() => {
                let chunk = e
                    .unescape()
                    .map(|c| c.into_owned())
                    .unwrap_or_else(|_| String::from_utf8_lossy(&e).into_owned());
                text.push_str(&chunk);
            }
            Ok(Event::CData(e)) if open.is_some() => {
                text.push_str(&String::from_utf8_lossy(&e));
            }
            Ok(Event::End(e)) => {
                let local = e.local_name();
                match local.as_ref() {
                    b"item" | b"entry" => {
                        if let Some(item) = current.take() {
                            items.push(item);
                        }
                        open = None;
                    }
                    name => {
                        let closes = matches!(&open, Some((_, tag)) if tag.as_slice() == name);
                        if let (true, Some((field, _)), Some(item)) = (closes, open.take(), current.as_mut()) {
                            let slot = match field {
                                Field::Title => &mut item.title,
                                Field::Link => &mut item.link,
                                Field::Summary => &mut item.summary,
                                Field::Content => &mut item.content,
                                Field::Published => &mut item.published,
                            };
                            if slot.is_empty() {
                                *slot = text.trim().to_string();
                            }
                        }
                    }
                }
            }
            Ok(Event::Eof) => break,
            Err(e) => {
                return Err(e).with_context(|| format!("Malformed feed at byte {}", reader.buffer_position()))
            }
            _ => {}
        }
        buf.clear();
    }
    Ok(items)
}

/// Atom links carry the URL in `href`; only `rel="alternate"` (or no rel) counts.
fn take_atom_link(e: &BytesStart<'_>, item: Option<&mut FeedItem>) {
    let Some(item) = item else { return };
    if !item.link.is_empty() {
        return;
    }
    let rel = e
        .try_get_attribute("rel")
        .ok()
        .flatten()
        .map(|a| String::from_utf8_lossy(&a.value).into_owned());
    if rel.as_deref().is_some_and(|r| r != "alternate") {
        return;
    }
    if let Ok(Some(href)) = e.try_get_attribute("href") {
        item.link = String::from_utf8_lossy(&href.value).trim().to_string();
    }
}

/// Plain text of an HTML fragment.
pub fn html_to_text(fragment: &str) -> String {
    if !fragment.contains('<') {
        return collapse_whitespace(fragment);
    }
    let doc = Html::parse_fragment(fragment);
    let mut text = String::new();
    for piece in doc.root_element().text() {
        text.push_str(piece);
        text.push(' ');
    }
    collapse_whitespace(&text)
}

/// Turn a feed item into a dataset row. `None` when its link is not http(s).
pub fn item_to_article(item: &FeedItem, source: &SeedSource, default_language: &str) -> Option<ExtractedArticle> {
    let link = Url::parse(item.link.trim()).ok()?;
    if !matches!(link.scheme(), "http" | "https") {
        return None;
    }
    let url = link.to_string();

    let title = truncate_chars(&html_to_text(&item.title), TITLE_CHARS);
    let summary = if item.summary.trim().is_empty() {
        &item.content
    } else {
        &item.summary
    };
    let mut body = truncate_chars(&html_to_text(summary), BODY_CHARS);
    if body.is_empty() {
        body = title.clone();
    }
    let language = source
        .language
        .as_deref()
        .and_then(language::normalize_language)
        .unwrap_or_else(|| default_language.to_string());

    Some(ExtractedArticle {
        title,
        body,
        language,
        date: dates::normalize_date(&item.published).unwrap_or_default(),
        source: source_name("", &url),
        url,
    })
}

/// Newest `limit` articles first; undated ones sort last, order otherwise kept.
pub fn newest(mut articles: Vec<ExtractedArticle>, limit: usize) -> Vec<ExtractedArticle> {
    articles.sort_by(|a, b| match (a.date.is_empty(), b.date.is_empty()) {
        (false, false) => b.date.cmp(&a.date),
        (a_empty, b_empty) => a_empty.cmp(&b_empty),
    });
    articles.truncate(limit);
    articles
}

#[derive(Debug, Clone)]
pub struct FeedOptions {
    pub discover: bool,
    pub items_per_source: usize,
    pub default_language: String,
    pub ignore_robots: bool,
    pub delay: Duration,
}

#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct FeedStats {
    pub sources: usize,
    pub feeds_ok: usize,
    pub feeds_failed: usize,
    pub items: usize,
}

impl FeedStats {
    pub fn print(&self) {
        println!(
            "Feeds: {} sources ({} ok, {} failed), {} articles.",
            self.sources, self.feeds_ok, self.feeds_failed, self.items,
        );
    }
}

struct FeedClient<'a> {
    transport: &'a dyn Transport,
    robots: RobotsCache,
    options: &'a FeedOptions,
    throttles: HashMap<String, DomainThrottle>,
}

impl FeedClient<'_> {
    async fn get(&mut self, url: &Url) -> Result<HttpResponse, FetchError> {
        let domain = url.host_str().unwrap_or_default().to_lowercase();
        let delay = self.options.delay;
        let throttle = self
            .throttles
            .entry(domain)
            .or_insert_with(|| DomainThrottle::new(delay));
        if !self.options.ignore_robots {
            let policy = match self.robots.cached(url) {
                Some(policy) => policy,
                None => {
                    throttle.wait(Duration::ZERO).await;
                    self.robots.policy_for(self.transport, url).await
                }
            };
            if let Some(crawl_delay) = policy.crawl_delay() {
                throttle.raise_to(crawl_delay);
            }
            if !policy.allows(url) {
                return Err(FetchError::RobotsDisallowed);
            }
        }
        throttle.wait(Duration::ZERO).await;
        let resp = self.transport.get(url).await?;
        if !resp.is_success() {
            return Err(FetchError::Status(resp.status));
        }
        Ok(resp)
    }

    async fn feed_url(&mut self, source: &SeedSource) -> Result<Option<Url>, FetchError> {
        if let Some(rss) = source.rss.as_deref().filter(|r| !r.trim().is_empty()) {
            return web_url(rss)
                .map(Some)
                .ok_or_else(|| FetchError::InvalidUrl(rss.to_string()));
        }
        if !self.options.discover {
            return Ok(None);
        }
        let Some(home) = source.parsed_url() else {
            return Err(FetchError::InvalidUrl(source.url.clone()));
        };
        let resp = self.get(&home).await?;
        let Ok(html) = parser::decode(&resp.body, &resp.encoding()) else {
            return Ok(None);
        };
        let base = Url::parse(&resp.final_url).unwrap_or(home);
        let found = meta::read_metadata(&Html::parse_document(&html), Some(&base)).feed_url;
        Ok(found.as_deref().and_then(web_url))
    }
}

fn web_url(raw: &str) -> Option<Url> {
    let url = Url::parse(raw.trim()).ok()?;
    matches!(url.scheme(), "http" | "https").then_some(url)
}

/// Charset from `Content-Type`, then the XML declaration, then utf-8.
fn feed_encoding(resp: &HttpResponse) -> String {
    let header_charset = resp
        .content_type
        .as_deref()
        .is_some_and(|ct| ct.to_ascii_lowercase().contains("charset="));
    if header_charset {
        return resp.encoding();
    }
    let head = String::from_utf8_lossy(&resp.body[..resp.body.len().min(256)]);
    XML_ENCODING
        .captures(&head)
        .map(|c| c[1].to_lowercase())
        .unwrap_or_else(|| "utf-8".to_string())
}

/// Fetch every source's feed and write one JSONL batch. Per-feed failures are
/// logged and skipped; only writing the batch can fail the stage.
pub async fn fetch_feeds(
    layout: &Layout,
    sources: &[SeedSource],
    transport: Arc<dyn Transport>,
    user_agent: &str,
    options: &FeedOptions,
) -> Result<FeedStats> {
    let mut client = FeedClient {
        transport: transport.as_ref(),
        robots: RobotsCache::new(user_agent),
        options,
        throttles: HashMap::new(),
    };
    let mut stats = FeedStats::default();
    let mut seen = HashSet::new();
    let mut batch = Vec::new();
    let fetched_at = Utc::now();

    for source in sources {
        let feed_url = match client.feed_url(source).await {
            Ok(Some(url)) => url,
            Ok(None) => continue,
            Err(e) => {
                stats.sources += 1;
                stats.feeds_failed += 1;
                warn!(stage = "feeds", url = %source.url, reason = %e, "no usable feed");
                continue;
            }
        };
        stats.sources += 1;

        let items = match client.get(&feed_url).await {
            Ok(resp) => parser::decode(&resp.body, &feed_encoding(&resp))
                .map_err(|e| e.to_string())
                .and_then(|xml| parse_feed(&xml).map_err(|e| format!("{e:#}"))),
            Err(e) => Err(e.to_string()),
        };
        let items = match items {
            Ok(items) => items,
            Err(reason) => {
                stats.feeds_failed += 1;
                warn!(stage = "feeds", url = %feed_url, reason = %reason, "feed skipped");
                continue;
            }
        };
        stats.feeds_ok += 1;

        let articles: Vec<_> = items
            .iter()
            .filter_map(|item| item_to_article(item, source, &options.default_language))
            .collect();
        let parsed = items.len();
        for article in newest(articles, options.items_per_source) {
            if seen.insert(article.url.clone()) {
                batch.push(ArticleRecord {
                    fetched_at: Some(fetched_at),
                    article,
                });
            }
        }
        debug!(stage = "feeds", url = %feed_url, items = parsed, "feed parsed");
    }

    stats.items = batch.len();
    if !batch.is_empty() {
        let path = write_batch(layout, fetched_at, &batch)?;
        info!(stage = "feeds", path = ?path, items = batch.len(), "feed batch written");
    }
    Ok(stats)
}

fn write_batch(layout: &Layout, stamp: DateTime<Utc>, batch: &[ArticleRecord]) -> Result<std::path::PathBuf> {
    let path = layout
        .feeds_dir()
        .join(format!("{}.jsonl", stamp.format("%Y%m%dT%H%M%S%3fZ")));
    store::atomic_write(&path, |w| {
        for record in batch {
            serde_json::to_writer(&mut *w, record)?;
            w.write_all(b"\n")?;
        }
        Ok(())
    })?;
    Ok(path)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::fetcher::testing::FakeTransport;
    use tempfile::TempDir;

    const RSS: &str = r#"<?xml version="1.0"?>
<rss version="2.0" xmlns:content="http://purl.org/rss/1.0/modules/content/">
  <channel>
    <title>News Example</title>
    <item>
      <title>Older story</title>
      <link>https://news.example/older</link>
      <description>&lt;p&gt;An &lt;b&gt;older&lt;/b&gt; summary.&lt;/p&gt;</description>
      <pubDate>Mon, 29 Apr 2024 09:00:00 GMT</pubDate>
    </item>
    <item>
      <title><![CDATA[Newer & better]]></title>
      <link>https://news.example/newer</link>
      <content:encoded><![CDATA[<p>Full <i>content</i> here.</p>]]></content:encoded>
      <pubDate>Tue, 30 Apr 2024 09:00:00 GMT</pubDate>
    </item>
    <item>
      <title>No link</title>
      <description>dropped</description>
    </item>
  </channel>
</rss>"#;

    const ATOM: &str = r#"<?xml version="1.0" encoding="utf-8"?>
<feed xmlns="http://www.w3.org/2005/Atom">
  <title>Blog</title>
  <link href="https://blog.example/"/>
  <entry>
    <title type="html">Entry one</title>
    <link rel="edit" href="https://blog.example/edit/1"/>
    <link rel="alternate" href="https://www.blog.example/posts/1"/>
    <updated>2024-05-02T10:00:00Z</updated>
    <summary>First entry summary.</summary>
  </entry>
</feed>"#;

    fn source(url: &str) -> SeedSource {
        SeedSource {
            name: "News".into(),
            language: Some("fr".into()),
            ..SeedSource::new(url)
        }
    }

    #[test]
    fn parses_rss_items() {
        let items = parse_feed(RSS).unwrap();
        assert_eq!(items.len(), 3);
        assert_eq!(items[0].title, "Older story");
        assert_eq!(items[0].summary, "<p>An <b>older</b> summary.</p>");
        assert_eq!(items[1].title, "Newer & better");
        assert_eq!(items[1].content, "<p>Full <i>content</i> here.</p>");
        assert_eq!(items[1].published, "Tue, 30 Apr 2024 09:00:00 GMT");
        assert!(items[2].link.is_empty());
    }

    #[test]
    fn parses_atom_entries() {
        let items = parse_feed(ATOM).unwrap();
        assert_eq!(items.len(), 1);
        assert_eq!(items[0].link, "https://www.blog.example/posts/1");
        assert_eq!(items[0].published, "2024-05-02T10:00:00Z");
        assert_eq!(items[0].summary, "First entry summary.");
    }

    #[test]
    fn converts_items_to_articles() {
        let items = parse_feed(RSS).unwrap();
        let s = source("https://news.example/");
        let older = item_to_article(&items[0], &s, "English").unwrap();
        assert_eq!(older.body, "An older summary.");
        assert_eq!(older.language, "French");
        assert_eq!(older.date, "2024-04-29T09:00:00Z");
        assert_eq!(older.source, "news.example");

        let newer = item_to_article(&items[1], &s, "English").unwrap();
        assert_eq!(newer.body, "Full content here.");
        assert!(item_to_article(&items[2], &s, "English").is_none());

        let atom = parse_feed(ATOM).unwrap();
        let entry = item_to_article(&atom[0], &SeedSource::new("https://blog.example/"), "English").unwrap();
        assert_eq!(entry.source, "blog.example");
        assert_eq!(entry.language, "English");
    }

    #[test]
    fn caps_title_and_body() {
        let item = FeedItem {
            title: "t".repeat(500),
            link: "https://news.example/long".into(),
            summary: "word ".repeat(1000),
            ..Default::default()
        };
        let a = item_to_article(&item, &SeedSource::new("https://news.example/"), "English").unwrap();
        assert_eq!(a.title.chars().count(), TITLE_CHARS);
        assert!(a.body.chars().count() <= BODY_CHARS);
    }

    #[test]
    fn newest_first_undated_last() {
        let mk = |url: &str, date: &str| ExtractedArticle {
            url: url.into(),
            date: date.into(),
            ..Default::default()
        };
        let sorted = newest(
            vec![mk("a", ""), mk("b", "2024-01-01"), mk("c", "2024-03-01T00:00:00Z"), mk("d", "")],
            3,
        );
        let urls: Vec<_> = sorted.iter().map(|a| a.url.as_str()).collect();
        assert_eq!(urls, vec!["c", "b", "a"]);
    }

    #[test]
    fn malformed_feed_is_an_error() {
        assert!(parse_feed("<rss><channel><item><title>x</item></rss>").is_err());
    }

    #[tokio::test]
    async fn fetch_feeds_writes_one_batch() {
        let dir = TempDir::new().unwrap();
        let layout = Layout::new(dir.path());
        layout.ensure().unwrap();

        let transport = FakeTransport::default()
            .page("https://news.example/robots.txt", 404, "")
            .page("https://news.example/feed.xml", 200, RSS)
            .page("https://blog.example/robots.txt", 200, "User-agent: *\nDisallow: /")
            .page("https://other.example/robots.txt", 404, "")
            .page(
                "https://other.example/",
                200,
                r#"<html><head><link rel="alternate" type="application/atom+xml" href="/atom.xml"></head></html>"#,
            )
            .page("https://other.example/atom.xml", 200, ATOM);
        let transport = Arc::new(transport);

        let sources = vec![
            SeedSource {
                rss: Some("https://news.example/feed.xml".into()),
                ..source("https://news.example/")
            },
            SeedSource {
                rss: Some("https://blog.example/feed.xml".into()),
                ..SeedSource::new("https://blog.example/")
            },
            SeedSource::new("https://other.example/"),
        ];
        let options = FeedOptions {
            discover: true,
            items_per_source: 1,
            default_language: "English".into(),
            ignore_robots: false,
            delay: Duration::ZERO,
        };

        let stats = fetch_feeds(&layout, &sources, transport.clone(), "InsightBot/0.1", &options)
            .await
            .unwrap();
        assert_eq!(stats.sources, 3);
        assert_eq!(stats.feeds_ok, 2);
        assert_eq!(stats.feeds_failed, 1);
        assert_eq!(stats.items, 2);
        assert_eq!(transport.hits("https://blog.example/feed.xml"), 0);

        let batches = store::list_stems(&layout.feeds_dir(), "jsonl").unwrap();
        assert_eq!(batches.len(), 1);
        let text = std::fs::read_to_string(layout.feeds_dir().join(format!("{}.jsonl", batches[0]))).unwrap();
        let records: Vec<ArticleRecord> = text
            .lines()
            .map(|l| serde_json::from_str(l).unwrap())
            .collect();
        assert_eq!(records[0].article.url, "https://news.example/newer");
        assert!(records[0].fetched_at.is_some());
    }

    #[test]
    fn encoding_falls_back_to_xml_declaration() {
        let resp = |content_type: Option<&str>, body: &str| HttpResponse {
            content_type: content_type.map(str::to_string),
            body: body.as_bytes().to_vec(),
            ..Default::default()
        };
        let latin = r#"<?xml version="1.0" encoding="ISO-8859-1"?><rss/>"#;
        assert_eq!(feed_encoding(&resp(Some("application/rss+xml"), latin)), "iso-8859-1");
        assert_eq!(feed_encoding(&resp(Some("text/xml; charset=utf-8"), latin)), "utf-8");
        assert_eq!(feed_encoding(&resp(None, "<rss/>")), "utf-8");
    }

    #[tokio::test]
    async fn latin1_feed_is_decoded() {
        let dir = TempDir::new().unwrap();
        let layout = Layout::new(dir.path());
        let mut body = br#"<?xml version="1.0" encoding="ISO-8859-1"?><rss><channel><item><title>Caf"#.to_vec();
        body.push(0xE9);
        body.extend_from_slice(b"</title><link>https://news.example/cafe</link></item></channel></rss>");

        let mut transport = FakeTransport::default().page("https://news.example/robots.txt", 404, "");
        transport.pages.insert(
            "https://news.example/feed.xml".into(),
            Ok(HttpResponse {
                status: 200,
                final_url: "https://news.example/feed.xml".into(),
                content_type: Some("application/rss+xml".into()),
                body,
                ..Default::default()
            }),
        );
        let sources = vec![SeedSource {
            rss: Some("https://news.example/feed.xml".into()),
            ..source("https://news.example/")
        }];
        let options = FeedOptions {
            discover: false,
            items_per_source: 5,
            default_language: "English".into(),
            ignore_robots: false,
            delay: Duration::ZERO,
        };

        let stats = fetch_feeds(&layout, &sources, Arc::new(transport), "InsightBot/0.1", &options)
            .await
            .unwrap();
        assert_eq!(stats.items, 1);
        let batches = store::list_stems(&layout.feeds_dir(), "jsonl").unwrap();
        let text = std::fs::read_to_string(layout.feeds_dir().join(format!("{}.jsonl", batches[0]))).unwrap();
        let record: ArticleRecord = serde_json::from_str(text.lines().next().unwrap()).unwrap();
        assert_eq!(record.article.title, "Café");
    }

    #[tokio::test]
    async fn non_web_feed_urls_are_rejected() {
        let dir = TempDir::new().unwrap();
        let layout = Layout::new(dir.path());
        let transport = Arc::new(FakeTransport::default());
        let sources = vec![SeedSource {
            rss: Some("file:///etc/passwd".into()),
            ..SeedSource::new("https://news.example/")
        }];
        let options = FeedOptions {
            discover: false,
            items_per_source: 5,
            default_language: "English".into(),
            ignore_robots: true,
            delay: Duration::ZERO,
        };
        let stats = fetch_feeds(&layout, &sources, transport.clone(), "bot", &options).await.unwrap();
        assert_eq!(stats.feeds_failed, 1);
        assert_eq!(transport.requests.load(std::sync::atomic::Ordering::SeqCst), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn feed_requests_honour_crawl_delay() {
        let dir = TempDir::new().unwrap();
        let layout = Layout::new(dir.path());
        let transport = Arc::new(
            FakeTransport::default()
                .page("https://news.example/robots.txt", 200, "User-agent: *\nDisallow: /private\nCrawl-delay: 4\n")
                .page("https://news.example/", 200, r#"<html><head><link rel="alternate" type="application/rss+xml" href="/feed.xml"></head></html>"#)
                .page("https://news.example/feed.xml", 200, RSS),
        );
        let sources = vec![SeedSource::new("https://news.example/")];
        let options = FeedOptions {
            discover: true,
            items_per_source: 5,
            default_language: "English".into(),
            ignore_robots: false,
            delay: Duration::from_secs(1),
        };
        let start = tokio::time::Instant::now();
        fetch_feeds(&layout, &sources, transport.clone(), "bot", &options).await.unwrap();

        let home = transport.requested_at("https://news.example/")[0] - start;
        let feed = transport.requested_at("https://news.example/feed.xml")[0] - start;
        assert!(home >= Duration::from_secs(4));
        assert!(feed - home >= Duration::from_secs(4));
    }
}
