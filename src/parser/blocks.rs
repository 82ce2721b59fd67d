use std::sync::LazyLock;

use regex::Regex;
use scraper::{ElementRef, Node};
use serde::{Deserialize, Serialize};

use super::text::{collapse_whitespace, truncate_chars, word_count};

pub const MAX_BLOCK_CHARS: usize = 20_000;
pub const MAX_BLOCKS: usize = 4096;
/// Elements nested deeper than this are flattened into their parent's run.
pub const MAX_DEPTH: usize = 256;

/// Subtrees never walked for text.
const SKIP_TAGS: &[&str] = &[
    "script", "style", "noscript", "template", "svg", "iframe", "form", "button", "select",
    "textarea", "head", "canvas", "object", "video", "audio", "math",
];

const BLOCK_TAGS: &[&str] = &[
    "address", "article", "aside", "blockquote", "dd", "details", "dialog", "div", "dl", "dt",
    "fieldset", "figcaption", "figure", "footer", "h1", "h2", "h3", "h4", "h5", "h6", "header",
    "hgroup", "hr", "li", "main", "nav", "ol", "p", "pre", "section", "table", "tbody", "td",
    "tfoot", "th", "thead", "tr", "ul",
];

const HEADING_TAGS: &[&str] = &["h1", "h2", "h3", "h4", "h5", "h6"];
const BOILERPLATE_TAGS: &[&str] = &["nav", "header", "footer", "aside"];
const BOILERPLATE_ROLES: &[&str] = &["navigation", "banner", "contentinfo", "complementary", "menu", "menubar"];

static BOILERPLATE_HINT: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"(?i)\b(nav|menu|footer|header|sidebar|breadcrumb|comment|cookie|share|social|promo|advert|related|newsletter|subscribe|masthead|widget)").unwrap()
});
static ARTICLE_HINT: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"(?i)\b(article|content|post|story|entry)").unwrap());

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BlockKind {
    Heading,
    Paragraph,
    List,
    Preformatted,
    Quote,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StructuralFeatures {
    /// Element the run of text sits directly under.
    pub tag_name: String,
    /// Child tag contributing the most words (`text` for bare text nodes).
    pub dominant_tag: String,
    pub kind: BlockKind,
    pub depth: usize,
    pub sibling_count: usize,
    pub word_count: usize,
    pub link_word_count: usize,
    pub link_density: f64,
    pub paragraph_count: usize,
    /// Inside nav/header/footer/aside or a container hinting at one.
    pub in_boilerplate: bool,
    /// Inside article/main or a container hinting at article content.
    pub in_article: bool,
}

/// A contiguous region of text that might be the article body.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CandidateBlock {
    pub page_url: String,
    /// Document order, starting at 0.
    pub block_index: usize,
    pub tag_path: String,
    pub raw_text: String,
    pub features: StructuralFeatures,
}

/// Walk `root` and return its candidate blocks in document order.
pub fn segment(root: ElementRef<'_>, page_url: &str) -> Vec<CandidateBlock> {
    let mut segmenter = Segmenter {
        page_url,
        blocks: Vec::new(),
    };
    segmenter.visit(root, &Scope::root(root));
    segmenter.blocks
}

#[derive(Debug, Clone, Default)]
struct Scope {
    path: Vec<String>,
    boilerplate: bool,
    article: bool,
}

impl Scope {
    /// Scope for `el` including everything its ancestors contribute.
    fn root(el: ElementRef<'_>) -> Self {
        let mut chain: Vec<ElementRef<'_>> = el.ancestors().filter_map(ElementRef::wrap).collect();
        chain.reverse();
        chain.push(el);
        chain
            .into_iter()
            .fold(Scope::default(), |scope, e| scope.child(e))
    }

    fn child(&self, el: ElementRef<'_>) -> Self {
        let mut path = self.path.clone();
        path.push(path_segment(el));
        Self {
            path,
            boilerplate: self.boilerplate || is_boilerplate(el),
            article: self.article || is_article(el),
        }
    }
}

struct Segmenter<'a> {
    page_url: &'a str,
    blocks: Vec<CandidateBlock>,
}

impl Segmenter<'_> {
    fn visit(&mut self, el: ElementRef<'_>, scope: &Scope) {
        let mut run = Run::default();
        for child in el.children() {
            if self.blocks.len() >= MAX_BLOCKS {
                return;
            }
            match child.value() {
                Node::Text(t) => run.inline.text.push_str(&**t),
                Node::Element(e) => {
                    if SKIP_TAGS.contains(&e.name()) {
                        continue;
                    }
                    let Some(child_el) = ElementRef::wrap(child) else {
                        continue;
                    };
                    let enters_region = BLOCK_TAGS.contains(&e.name())
                        && ((!scope.boilerplate && is_boilerplate(child_el))
                            || (!scope.article && is_article(child_el)));
                    if enters_region {
                        // a nav or article region never shares a run with its neighbours
                        if has_text(child_el) {
                            self.descend(&mut run, el, scope, child_el);
                        }
                    } else if let Some(leaf) = text_leaf(child_el) {
                        if BLOCK_TAGS.contains(&leaf.value().name()) {
                            run.push_block(leaf);
                        } else {
                            run.push_inline(leaf);
                        }
                    } else if has_text(child_el) {
                        self.descend(&mut run, el, scope, child_el);
                    }
                    // empty containers (images, spacers) do not break the run
                }
                _ => {}
            }
        }
        self.flush(&mut run, el, scope);
    }

    fn descend(&mut self, run: &mut Run, el: ElementRef<'_>, scope: &Scope, child: ElementRef<'_>) {
        if scope.path.len() >= MAX_DEPTH {
            run.push_block(child);
            return;
        }
        self.flush(run, el, scope);
        self.visit(child, &scope.child(child));
    }

    fn flush(&mut self, run: &mut Run, container: ElementRef<'_>, scope: &Scope) {
        run.end_inline();
        if run.parts.is_empty() {
            return;
        }
        let parts = std::mem::take(&mut run.parts);
        let link_words = std::mem::take(&mut run.link_words);

        let mut tag_words: Vec<(&str, usize)> = Vec::new();
        let mut total = 0;
        for (tag, text) in &parts {
            let words = word_count(text);
            total += words;
            match tag_words.iter_mut().find(|entry| entry.0 == tag.as_str()) {
                Some(entry) => entry.1 += words,
                None => tag_words.push((tag.as_str(), words)),
            }
        }
        if total == 0 {
            return;
        }

        // strict `>` keeps the first tag on ties
        let mut dominant = tag_words[0];
        for &(tag, words) in &tag_words[1..] {
            if words > dominant.1 {
                dominant = (tag, words);
            }
        }

        let container_tag = container.value().name().to_string();
        let kind = classify(&parts, dominant.0, &container_tag);
        let paragraph_count = parts.iter().filter(|(t, _)| t == "p").count();
        let link_word_count = link_words.min(total);
        let raw_text = truncate_chars(
            &parts
                .iter()
                .map(|(_, text)| text.as_str())
                .collect::<Vec<_>>()
                .join("\n\n"),
            MAX_BLOCK_CHARS,
        );

        let sibling_count = container
            .prev_siblings()
            .chain(container.next_siblings())
            .filter(|n| n.value().is_element())
            .count();

        self.blocks.push(CandidateBlock {
            page_url: self.page_url.to_string(),
            block_index: self.blocks.len(),
            tag_path: scope.path.join("/"),
            raw_text,
            features: StructuralFeatures {
                tag_name: container_tag,
                dominant_tag: dominant.0.to_string(),
                kind,
                depth: scope.path.len(),
                sibling_count,
                word_count: total,
                link_word_count,
                link_density: link_word_count as f64 / total as f64,
                paragraph_count,
                in_boilerplate: scope.boilerplate,
                in_article: scope.article,
            },
        });
    }
}

/// Text gathered from a subtree, with the share of words that sat inside links.
#[derive(Debug, Default)]
struct TextAcc {
    text: String,
    link_words: usize,
}

enum Step<'a> {
    Walk(ElementRef<'a>, bool),
    Text(&'a str, bool),
    Space,
}

impl TextAcc {
    fn collect<'a>(&mut self, el: ElementRef<'a>, in_link: bool) {
        let mut stack = vec![Step::Walk(el, in_link)];
        while let Some(step) = stack.pop() {
            match step {
                Step::Space => self.text.push(' '),
                Step::Text(t, link) => {
                    self.text.push_str(t);
                    if link {
                        self.link_words += word_count(t);
                    }
                }
                Step::Walk(el, link) => {
                    let mut steps = Vec::new();
                    for child in el.children() {
                        match child.value() {
                            Node::Text(t) => steps.push(Step::Text(&**t, link)),
                            Node::Element(e) => {
                                let name = e.name();
                                if SKIP_TAGS.contains(&name) {
                                    continue;
                                }
                                if name == "br" {
                                    steps.push(Step::Space);
                                }
                                if let Some(child_el) = ElementRef::wrap(child) {
                                    // block children still need a separator, e.g. <td> cells
                                    let block = BLOCK_TAGS.contains(&name);
                                    if block {
                                        steps.push(Step::Space);
                                    }
                                    steps.push(Step::Walk(child_el, link || name == "a"));
                                    if block {
                                        steps.push(Step::Space);
                                    }
                                }
                            }
                            _ => {}
                        }
                    }
                    // reversed so children pop in document order
                    stack.extend(steps.into_iter().rev());
                }
            }
        }
    }
}

#[derive(Debug, Default)]
struct Run {
    /// (tag, collapsed text) in document order.
    parts: Vec<(String, String)>,
    inline: TextAcc,
    link_words: usize,
}

impl Run {
    fn push_inline(&mut self, el: ElementRef<'_>) {
        let name = el.value().name();
        if name == "br" {
            self.inline.text.push(' ');
            return;
        }
        self.inline.collect(el, name == "a");
    }

    fn push_block(&mut self, el: ElementRef<'_>) {
        self.end_inline();
        let mut acc = TextAcc::default();
        acc.collect(el, el.value().name() == "a");
        let text = collapse_whitespace(&acc.text);
        if !text.is_empty() {
            self.link_words += acc.link_words;
            self.parts.push((el.value().name().to_string(), text));
        }
    }

    fn end_inline(&mut self) {
        let pending = std::mem::take(&mut self.inline);
        let text = collapse_whitespace(&pending.text);
        if !text.is_empty() {
            self.link_words += pending.link_words;
            self.parts.push(("text".to_string(), text));
        }
    }
}

fn classify(parts: &[(String, String)], dominant: &str, container: &str) -> BlockKind {
    if parts.iter().all(|(t, _)| HEADING_TAGS.contains(&t.as_str())) {
        return BlockKind::Heading;
    }
    match dominant {
        "li" | "dd" | "dt" => BlockKind::List,
        "pre" => BlockKind::Preformatted,
        "blockquote" => BlockKind::Quote,
        _ if matches!(container, "ul" | "ol" | "dl" | "menu") => BlockKind::List,
        _ => BlockKind::Paragraph,
    }
}

/// The element that carries `el`'s text if `el` holds no nested blocks,
/// looking through single-child wrappers like `<div><p>..</p></div>`.
fn text_leaf(el: ElementRef<'_>) -> Option<ElementRef<'_>> {
    let mut el = el;
    loop {
        if !has_block_descendant(el) {
            return Some(el);
        }
        let mut only_child = None;
        for child in el.children() {
            match child.value() {
                Node::Text(t) if !t.trim().is_empty() => return None,
                Node::Element(e) if !SKIP_TAGS.contains(&e.name()) => {
                    if only_child.is_some() {
                        return None;
                    }
                    only_child = ElementRef::wrap(child);
                }
                _ => {}
            }
        }
        el = only_child?;
    }
}

fn has_block_descendant(el: ElementRef<'_>) -> bool {
    el.descendants().skip(1).any(|n| {
        n.value()
            .as_element()
            .is_some_and(|e| BLOCK_TAGS.contains(&e.name()))
    })
}

fn has_text(el: ElementRef<'_>) -> bool {
    el.text().any(|t| !t.trim().is_empty())
}

fn path_segment(el: ElementRef<'_>) -> String {
    let v = el.value();
    match (v.id(), v.classes().next()) {
        (Some(id), _) => format!("{}#{}", v.name(), id),
        (None, Some(class)) => format!("{}.{}", v.name(), class),
        _ => v.name().to_string(),
    }
}

fn hint_text(el: ElementRef<'_>) -> Option<String> {
    let v = el.value();
    if matches!(v.name(), "html" | "body") {
        return None;
    }
    let hint = format!("{} {}", v.id().unwrap_or(""), v.attr("class").unwrap_or(""));
    (!hint.trim().is_empty()).then_some(hint)
}

fn is_boilerplate(el: ElementRef<'_>) -> bool {
    let v = el.value();
    BOILERPLATE_TAGS.contains(&v.name())
        || v.attr("role")
            .is_some_and(|r| BOILERPLATE_ROLES.contains(&r.trim().to_lowercase().as_str()))
        || hint_text(el).is_some_and(|h| BOILERPLATE_HINT.is_match(&h))
}

fn is_article(el: ElementRef<'_>) -> bool {
    let v = el.value();
    matches!(v.name(), "article" | "main")
        || v.attr("role").is_some_and(|r| r.trim().eq_ignore_ascii_case("main"))
        || v.attr("itemprop").is_some_and(|p| p.trim().eq_ignore_ascii_case("articleBody"))
        || hint_text(el).is_some_and(|h| ARTICLE_HINT.is_match(&h))
}
