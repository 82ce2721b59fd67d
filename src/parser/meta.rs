use std::sync::LazyLock;

use scraper::{Html, Selector};
use serde::{Deserialize, Serialize};
use url::Url;

use super::text::collapse_whitespace;

static TITLE: LazyLock<Selector> = LazyLock::new(|| Selector::parse("title").unwrap());
static H1: LazyLock<Selector> = LazyLock::new(|| Selector::parse("h1").unwrap());
static META: LazyLock<Selector> = LazyLock::new(|| Selector::parse("meta").unwrap());
static TIME: LazyLock<Selector> = LazyLock::new(|| Selector::parse("time[datetime]").unwrap());
static HTML_LANG: LazyLock<Selector> = LazyLock::new(|| Selector::parse("html[lang]").unwrap());
static LINK: LazyLock<Selector> = LazyLock::new(|| Selector::parse("link[rel][href]").unwrap());
static BYLINE: LazyLock<Selector> =
    LazyLock::new(|| Selector::parse(r#"a[rel~="author"], .byline, [itemprop="author"]"#).unwrap());

const PUBLISHED_KEYS: &[&str] = &[
    "article:published_time",
    "og:published_time",
    "datepublished",
    "pubdate",
    "publishdate",
    "date",
    "dc.date",
    "dc.date.issued",
    "dcterms.created",
    "sailthru.date",
    "parsely-pub-date",
];

/// Page-level hints read once per document, ahead of block selection.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct PageMetadata {
    pub title: Option<String>,
    pub first_heading: Option<String>,
    pub description: Option<String>,
    pub published: Option<String>,
    pub byline: Option<String>,
    pub canonical_url: Option<String>,
    pub declared_language: Option<String>,
    pub feed_url: Option<String>,
}

pub fn read_metadata(doc: &Html, base: Option<&Url>) -> PageMetadata {
    let mut meta = PageMetadata {
        title: doc.select(&TITLE).next().and_then(|t| non_empty(&t.text().collect::<String>())),
        first_heading: doc.select(&H1).next().and_then(|h| non_empty(&h.text().collect::<String>())),
        declared_language: doc
            .select(&HTML_LANG)
            .next()
            .and_then(|h| h.value().attr("lang"))
            .and_then(non_empty),
        ..Default::default()
    };

    let mut og_title = None;
    let mut og_locale = None;
    let mut http_language = None;
    for el in doc.select(&META) {
        let v = el.value();
        let Some(content) = v.attr("content").and_then(non_empty) else {
            continue;
        };
        if let Some(equiv) = v.attr("http-equiv") {
            if equiv.eq_ignore_ascii_case("content-language") && http_language.is_none() {
                http_language = Some(content.clone());
            }
            continue;
        }
        let Some(key) = v
            .attr("property")
            .or_else(|| v.attr("name"))
            .or_else(|| v.attr("itemprop"))
            .map(|k| k.trim().to_lowercase())
        else {
            continue;
        };
        match key.as_str() {
            "og:title" | "twitter:title" if og_title.is_none() => og_title = Some(content),
            "description" | "og:description" if meta.description.is_none() => {
                meta.description = Some(content)
            }
            "author" | "article:author" | "byl" if meta.byline.is_none() => {
                meta.byline = Some(content)
            }
            "og:locale" if og_locale.is_none() => og_locale = Some(content),
            k if PUBLISHED_KEYS.contains(&k) && meta.published.is_none() => {
                meta.published = Some(content)
            }
            _ => {}
        }
    }

    if meta.published.is_none() {
        meta.published = doc
            .select(&TIME)
            .next()
            .and_then(|t| t.value().attr("datetime"))
            .and_then(non_empty);
    }
    if meta.byline.is_none() {
        meta.byline = doc
            .select(&BYLINE)
            .next()
            .and_then(|b| non_empty(&b.text().collect::<String>()));
    }
    if meta.title.is_none() {
        meta.title = og_title;
    }
    if meta.declared_language.is_none() {
        meta.declared_language = http_language.or(og_locale);
    }

    for link in doc.select(&LINK) {
        let v = link.value();
        let rels: Vec<String> = v
            .attr("rel")
            .unwrap_or("")
            .split_ascii_whitespace()
            .map(str::to_lowercase)
            .collect();
        let Some(href) = v.attr("href") else { continue };
        if rels.iter().any(|r| r == "canonical") && meta.canonical_url.is_none() {
            meta.canonical_url = resolve(base, href);
        }
        let feed_type = v
            .attr("type")
            .map(|t| t.to_lowercase())
            .is_some_and(|t| t.contains("rss") || t.contains("atom"));
        if rels.iter().any(|r| r == "alternate") && feed_type && meta.feed_url.is_none() {
            meta.feed_url = resolve(base, href);
        }
    }

    meta
}

/// Absolute http(s) URL for `href`, or `None`.
fn resolve(base: Option<&Url>, href: &str) -> Option<String> {
    let href = href.trim();
    let url = match base {
        Some(base) => base.join(href).ok()?,
        None => Url::parse(href).ok()?,
    };
    matches!(url.scheme(), "http" | "https").then(|| url.to_string())
}

fn non_empty(s: &str) -> Option<String> {
    let s = collapse_whitespace(s);
    (!s.is_empty()).then_some(s)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn read(html: &str) -> PageMetadata {
        let base = Url::parse("http://news.example/2024/story").unwrap();
        read_metadata(&Html::parse_document(html), Some(&base))
    }

    #[test]
    fn reads_head_fields() {
        let m = read(
            r#"<html lang="fr"><head>
                <title>  Le   titre </title>
                <meta property="article:published_time" content="2024-03-05T10:00:00Z">
                <meta name="description" content="Résumé">
                <meta name="author" content="A. Writer">
                <link rel="canonical" href="/2024/story-canonical">
                <link rel="alternate" type="application/rss+xml" href="/feed.xml">
            </head><body><h1>Heading</h1></body></html>"#,
        );
        assert_eq!(m.title.as_deref(), Some("Le titre"));
        assert_eq!(m.first_heading.as_deref(), Some("Heading"));
        assert_eq!(m.published.as_deref(), Some("2024-03-05T10:00:00Z"));
        assert_eq!(m.description.as_deref(), Some("Résumé"));
        assert_eq!(m.byline.as_deref(), Some("A. Writer"));
        assert_eq!(m.declared_language.as_deref(), Some("fr"));
        assert_eq!(
            m.canonical_url.as_deref(),
            Some("http://news.example/2024/story-canonical")
        );
        assert_eq!(m.feed_url.as_deref(), Some("http://news.example/feed.xml"));
    }

    #[test]
    fn falls_back_to_time_element_and_og_title() {
        let m = read(
            r#"<html><head><meta property="og:title" content="OG title"></head>
               <body><time datetime="2023-12-01">Dec 1</time></body></html>"#,
        );
        assert_eq!(m.title.as_deref(), Some("OG title"));
        assert_eq!(m.published.as_deref(), Some("2023-12-01"));
        assert!(m.declared_language.is_none());
        assert!(m.byline.is_none());
    }

    #[test]
    fn byline_from_markup() {
        let m = read(r#"<html><body><p class="byline">By  Jo Reporter</p></body></html>"#);
        assert_eq!(m.byline.as_deref(), Some("By Jo Reporter"));
    }

    #[test]
    fn ignores_non_http_canonical() {
        let m = read(r#"<html><head><link rel="canonical" href="javascript:void(0)"></head></html>"#);
        assert!(m.canonical_url.is_none());
    }

    #[test]
    fn http_equiv_language() {
        let m = read(r#"<html><head><meta http-equiv="Content-Language" content="de"></head></html>"#);
        assert_eq!(m.declared_language.as_deref(), Some("de"));
    }
}
