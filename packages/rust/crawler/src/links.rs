//! Outbound link extraction.

use std::collections::HashSet;
use std::sync::LazyLock;

use scraper::{Html, Selector};
use url::Url;

static LINK_SEL: LazyLock<Selector> =
    LazyLock::new(|| Selector::parse("a[href]").expect("link selector"));

/// An outbound link and the text it was anchored on.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Link {
    pub url: Url,
    pub anchor: String,
}

/// Extract all links from `html`, resolved against `base_url`.
///
/// Fragment-only, `javascript:` and `mailto:` hrefs are skipped, fragments
/// are stripped, and each target appears once (first anchor wins).
pub fn extract_links(html: &str, base_url: &Url) -> Vec<Link> {
    let doc = Html::parse_document(html);
    let mut seen = HashSet::new();
    let mut links = Vec::new();

    for el in doc.select(&LINK_SEL) {
        let Some(href) = el.value().attr("href") else {
            continue;
        };
        let href = href.trim();
        if href.is_empty()
            || href.starts_with('#')
            || href.starts_with("javascript:")
            || href.starts_with("mailto:")
            || href.starts_with("tel:")
        {
            continue;
        }

        let Ok(mut resolved) = base_url.join(href) else {
            continue;
        };
        resolved.set_fragment(None);

        if !seen.insert(resolved.to_string()) {
            continue;
        }

        let anchor = el
            .text()
            .collect::<String>()
            .split_whitespace()
            .collect::<Vec<_>>()
            .join(" ");

        links.push(Link {
            url: resolved,
            anchor,
        });
    }

    links
}
