//! RSS/Atom feed reader.
//!
//! Feed entries become [`SearchHit`]s carrying their publish time, so the
//! retriever can seed the frontier from them and apply its publish window.

use std::collections::HashSet;
use std::time::Duration;

use reqwest::Client;
use scraper::Html;
use tracing::{debug, instrument};
use url::Url;

use topicdigest_shared::{DigestError, Result, SearchHit};

use crate::fetch::is_transient_status;
use crate::scope::is_ssrf_target;

const USER_AGENT: &str = concat!("topicdigest/", env!("CARGO_PKG_VERSION"));

/// Entries kept per feed, newest first.
const MAX_FEED_ENTRIES: usize = 50;

/// Fetches and parses RSS, Atom and JSON feeds.
#[derive(Debug, Clone)]
pub struct FeedReader {
    client: Client,
    allow_localhost: bool,
}

impl FeedReader {
    pub fn new(timeout: Duration) -> Result<Self> {
        let client = Client::builder()
            .user_agent(USER_AGENT)
            .timeout(timeout)
            .build()
            .map_err(|e| DigestError::config(format!("failed to build feed client: {e}")))?;

        Ok(Self {
            client,
            allow_localhost: false,
        })
    }

    #[cfg(test)]
    pub(crate) fn allow_localhost(mut self) -> Self {
        self.allow_localhost = true;
        self
    }

    /// Fetch one feed and turn its entries into hits.
    ///
    /// Status handling matches page fetches: 429, 5xx and network errors are
    /// transient, anything else (including an unparseable body) is permanent.
    #[instrument(skip(self))]
    pub async fn read(&self, url: &str) -> Result<Vec<SearchHit>> {
        let parsed = Url::parse(url)
            .map_err(|e| DigestError::fetch_permanent(url, format!("invalid URL: {e}")))?;
        if !self.allow_localhost && is_ssrf_target(&parsed) {
            return Err(DigestError::fetch_permanent(url, "blocked by SSRF guard"));
        }

        let response = self
            .client
            .get(parsed)
            .send()
            .await
            .map_err(|e| DigestError::fetch_transient(url, e.to_string()))?;

        let status = response.status();
        if !status.is_success() {
            let message = format!("HTTP {status}");
            return Err(if is_transient_status(status) {
                DigestError::fetch_transient(url, message)
            } else {
                DigestError::fetch_permanent(url, message)
            });
        }

        let bytes = response
            .bytes()
            .await
            .map_err(|e| DigestError::fetch_transient(url, format!("body read failed: {e}")))?;
        let feed = feed_rs::parser::parse(&bytes[..])
            .map_err(|e| DigestError::fetch_permanent(url, format!("not a valid feed: {e}")))?;

        let hits = feed_hits(feed);
        debug!(entries = hits.len(), "feed parsed");
        Ok(hits)
    }
}

/// Entries with a usable link, deduplicated, newest first. Undated entries
/// sort last.
fn feed_hits(feed: feed_rs::model::Feed) -> Vec<SearchHit> {
    let mut seen = HashSet::new();
    let mut hits: Vec<SearchHit> = feed
        .entries
        .into_iter()
        .filter_map(|entry| {
            let url = entry
                .links
                .first()
                .map(|link| link.href.clone())
                .or_else(|| entry.id.starts_with("http").then(|| entry.id.clone()))?;
            if !seen.insert(url.clone()) {
                return None;
            }
            Some(SearchHit {
                url,
                title: entry.title.map(|t| t.content.trim().to_string()),
                snippet: entry
                    .summary
                    .map(|t| fragment_text(&t.content))
                    .filter(|s| !s.is_empty()),
                published: entry.published.or(entry.updated),
            })
        })
        .collect();

    hits.sort_by(|a, b| b.published.cmp(&a.published));
    hits.truncate(MAX_FEED_ENTRIES);
    hits
}

/// Summaries are often HTML; keep the readable text only.
fn fragment_text(html: &str) -> String {
    Html::parse_fragment(html)
        .root_element()
        .text()
        .collect::<String>()
        .split_whitespace()
        .collect::<Vec<_>>()
        .join(" ")
}
