//! Search results page parser.
//!
//! Parses the DuckDuckGo HTML results layout:
//! - each organic hit is a `div.result` (ads carry `result--ad`)
//! - the title link is `a.result__a`, usually a `/l/?uddg=<target>` redirect
//! - the snippet is `.result__snippet`

use std::collections::HashSet;
use std::sync::LazyLock;

use scraper::{ElementRef, Html, Selector};
use url::Url;

use topicdigest_shared::SearchHit;

static RESULT_SEL: LazyLock<Selector> =
    LazyLock::new(|| Selector::parse("div.result").expect("result selector"));
static TITLE_SEL: LazyLock<Selector> =
    LazyLock::new(|| Selector::parse("a.result__a").expect("title selector"));
static SNIPPET_SEL: LazyLock<Selector> =
    LazyLock::new(|| Selector::parse(".result__snippet").expect("snippet selector"));

/// Extract up to `limit` organic hits from a results page.
///
/// Hits are returned in page order with duplicate targets removed.
pub fn parse_results(html: &str, limit: usize) -> Vec<SearchHit> {
    let doc = Html::parse_document(html);
    let mut seen = HashSet::new();
    let mut hits = Vec::new();

    for result in doc.select(&RESULT_SEL) {
        if hits.len() >= limit {
            break;
        }
        if result.value().classes().any(|c| c == "result--ad") {
            continue;
        }

        let Some(link) = result.select(&TITLE_SEL).next() else {
            continue;
        };
        let Some(target) = link.value().attr("href").and_then(resolve_target) else {
            continue;
        };
        if !seen.insert(target.clone()) {
            continue;
        }

        hits.push(SearchHit {
            url: target,
            title: non_empty(element_text(&link)),
            snippet: result
                .select(&SNIPPET_SEL)
                .next()
                .and_then(|el| non_empty(element_text(&el))),
            published: None,
        });
    }

    hits
}

/// Turn a result href into the target page URL.
///
/// Redirect links (`//duckduckgo.com/l/?uddg=...`) are unwrapped; direct
/// http(s) links pass through. Anything else is rejected.
fn resolve_target(href: &str) -> Option<String> {
    let absolute = if href.starts_with("//") {
        format!("https:{href}")
    } else {
        href.to_string()
    };
    let url = Url::parse(&absolute).ok()?;

    if url.path().starts_with("/l/") {
        let (_, target) = url.query_pairs().find(|(k, _)| k == "uddg")?;
        let target = Url::parse(&target).ok()?;
        return is_web(&target).then(|| target.to_string());
    }

    is_web(&url).then(|| url.to_string())
}

fn is_web(url: &Url) -> bool {
    matches!(url.scheme(), "http" | "https")
}

fn element_text(el: &ElementRef<'_>) -> String {
    el.text()
        .collect::<String>()
        .split_whitespace()
        .collect::<Vec<_>>()
        .join(" ")
}

fn non_empty(s: String) -> Option<String> {
    (!s.is_empty()).then_some(s)
}
