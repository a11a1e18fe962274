//! Page text extraction.
//!
//! Turns a fetched HTML page into the plain-ish Markdown text handed to the
//! entity extractor. The main content container is located first, HTML
//! tables are flattened into Markdown tables, the result is converted with
//! `htmd`, and a series of cleanup passes strip links, images and page chrome.

mod cleanup;

use std::sync::LazyLock;

use scraper::{ElementRef, Html, Selector};
use tracing::{debug, instrument};

use topicdigest_shared::{DigestError, Result};

// ---------------------------------------------------------------------------
// Public types
// ---------------------------------------------------------------------------

/// Text extracted from one HTML page.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PageText {
    /// Page title from `og:title`, `<title>`, or the first `<h1>`.
    pub title: Option<String>,
    /// Cleaned Markdown body.
    pub text: String,
    /// Approximate word count of `text`.
    pub word_count: usize,
}

impl PageText {
    /// Whether the page produced any usable text.
    pub fn is_empty(&self) -> bool {
        self.word_count == 0
    }
}

/// Tags whose content never reaches the model.
const SKIP_TAGS: &[&str] = &[
    "script", "style", "nav", "header", "footer", "aside", "iframe", "noscript", "svg", "form",
];

/// Known article containers, tried in priority order before falling back to `<body>`.
const CONTENT_SELECTORS: &[&str] = &[
    "article",
    "[itemprop=\"articleBody\"]",
    "div[data-component=\"text-block\"]",
    "main",
    "[role=\"main\"]",
    ".story-body",
    ".article-body",
    "#content",
];

static OG_TITLE_SEL: LazyLock<Selector> = LazyLock::new(|| {
    Selector::parse("meta[property=\"og:title\"]").expect("og:title selector")
});
static TITLE_SEL: LazyLock<Selector> =
    LazyLock::new(|| Selector::parse("title").expect("title selector"));
static H1_SEL: LazyLock<Selector> = LazyLock::new(|| Selector::parse("h1").expect("h1 selector"));
static BODY_SEL: LazyLock<Selector> =
    LazyLock::new(|| Selector::parse("body").expect("body selector"));
static TABLE_SEL: LazyLock<Selector> =
    LazyLock::new(|| Selector::parse("table").expect("table selector"));
static TR_SEL: LazyLock<Selector> = LazyLock::new(|| Selector::parse("tr").expect("tr selector"));
static TH_SEL: LazyLock<Selector> = LazyLock::new(|| Selector::parse("th").expect("th selector"));
static TD_SEL: LazyLock<Selector> = LazyLock::new(|| Selector::parse("td").expect("td selector"));

// ---------------------------------------------------------------------------
// Extraction
// ---------------------------------------------------------------------------

/// Extract the readable text of an HTML page.
///
/// Returns a [`PageText`] with an empty `text` when the page has no
/// readable content; the caller decides whether to fall back to a snippet.
#[instrument(skip_all, fields(html_len = html.len()))]
pub fn page_text(html: &str) -> Result<PageText> {
    let doc = Html::parse_document(html);
    let title = extract_title(&doc);

    let content_html = extract_content_html(&doc, html);
    let content_html = preprocess_tables(&content_html);

    let converter = htmd::HtmlToMarkdown::builder()
        .skip_tags(SKIP_TAGS.to_vec())
        .build();

    let raw_markdown = converter
        .convert(&content_html)
        .map_err(|e| DigestError::parse(format!("htmd conversion failed: {e}")))?;

    let text = cleanup::run_pipeline(&raw_markdown);
    let word_count = count_words(&text);

    debug!(
        raw_len = raw_markdown.len(),
        text_len = text.len(),
        word_count,
        "page text extracted"
    );

    Ok(PageText {
        title,
        text,
        word_count,
    })
}

fn extract_title(doc: &Html) -> Option<String> {
    let og = doc
        .select(&OG_TITLE_SEL)
        .next()
        .and_then(|el| el.value().attr("content"))
        .map(collapse_whitespace);

    og.filter(|t| !t.is_empty())
        .or_else(|| first_text(doc, &TITLE_SEL))
        .or_else(|| first_text(doc, &H1_SEL))
}

fn first_text(doc: &Html, selector: &Selector) -> Option<String> {
    doc.select(selector)
        .next()
        .map(|el| collapse_whitespace(&el.text().collect::<String>()))
        .filter(|t| !t.is_empty())
}

fn collapse_whitespace(s: &str) -> String {
    s.split_whitespace().collect::<Vec<_>>().join(" ")
}

/// Inner HTML of the first matching content container, else `<body>`.
fn extract_content_html(doc: &Html, raw: &str) -> String {
    for sel_str in CONTENT_SELECTORS {
        let Ok(selector) = Selector::parse(sel_str) else {
            continue;
        };
        if let Some(el) = doc.select(&selector).next() {
            return el.inner_html();
        }
    }

    match doc.select(&BODY_SEL).next() {
        Some(body) => body.inner_html(),
        None => raw.to_string(),
    }
}

fn count_words(text: &str) -> usize {
    text.split_whitespace()
        .filter(|w| w.chars().any(char::is_alphanumeric))
        .count()
}

// ---------------------------------------------------------------------------
// Table pre-processing
// ---------------------------------------------------------------------------

/// Replace HTML `<table>` elements with Markdown tables; `htmd` drops them otherwise.
fn preprocess_tables(html: &str) -> String {
    let doc = Html::parse_fragment(html);
    let mut result = html.to_string();

    for table in doc.select(&TABLE_SEL) {
        let md_table = table_to_markdown(&table);
        result = result.replacen(&table.html(), &md_table, 1);
    }

    result
}

fn table_to_markdown(table: &ElementRef<'_>) -> String {
    let cell_text = |cell: ElementRef<'_>| collapse_whitespace(&cell.text().collect::<String>());

    let mut rows: Vec<Vec<String>> = Vec::new();
    let mut has_header = false;

    for tr in table.select(&TR_SEL) {
        let ths: Vec<String> = tr.select(&TH_SEL).map(cell_text).collect();
        if !ths.is_empty() {
            has_header = has_header || rows.is_empty();
            rows.push(ths);
            continue;
        }
        let tds: Vec<String> = tr.select(&TD_SEL).map(cell_text).collect();
        if !tds.is_empty() {
            rows.push(tds);
        }
    }

    let col_count = rows.iter().map(Vec::len).max().unwrap_or(0);
    if col_count == 0 {
        return String::new();
    }
    for row in &mut rows {
        row.resize(col_count, String::new());
    }

    let line = |cells: &[String]| format!("| {} |\n", cells.join(" | "));

    let mut md = String::from("\n\n");
    md.push_str(&line(&rows[0]));
    md.push_str(&line(&vec!["---".to_string(); col_count]));
    let data_start = usize::from(has_header);
    for row in &rows[data_start..] {
        md.push_str(&line(row));
    }
    md.push('\n');
    md
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
