//! Topic search: turns a topic string into candidate page URLs.
//!
//! Queries an HTML search endpoint (DuckDuckGo's no-JS flavour by default)
//! and parses organic results into [`SearchHit`]s. The retriever seeds its
//! frontier from these hits; snippets double as fallback page text.

mod parser;

use std::time::Duration;

use reqwest::{Client, StatusCode};
use tracing::{debug, info, instrument};

use topicdigest_shared::{DigestError, Result, SearchConfig, SearchHit};

pub use parser::parse_results;

/// Maximum number of redirects to follow when querying the endpoint.
const MAX_REDIRECTS: usize = 3;

/// Browser-like User-Agent; the HTML endpoint rejects obvious bots.
const USER_AGENT: &str = concat!(
    "Mozilla/5.0 (X11; Linux x86_64) topicdigest/",
    env!("CARGO_PKG_VERSION")
);

// ---------------------------------------------------------------------------
// Searcher
// ---------------------------------------------------------------------------

/// HTML search client.
#[derive(Debug, Clone)]
pub struct Searcher {
    client: Client,
    endpoint: String,
    max_results: usize,
}

impl Searcher {
    /// Build a searcher from the `[search]` config section.
    pub fn new(config: &SearchConfig) -> Result<Self> {
        let client = Client::builder()
            .user_agent(USER_AGENT)
            .redirect(reqwest::redirect::Policy::limited(MAX_REDIRECTS))
            .timeout(Duration::from_secs(config.timeout_secs))
            .build()
            .map_err(|e| DigestError::config(format!("failed to build search client: {e}")))?;

        Ok(Self {
            client,
            endpoint: config.endpoint.clone(),
            max_results: config.max_results,
        })
    }

    /// Run one search for `topic`.
    ///
    /// Network failures, timeouts, 429 and 5xx are transient; any other
    /// non-success status is permanent.
    #[instrument(skip(self), fields(endpoint = %self.endpoint))]
    pub async fn search(&self, topic: &str) -> Result<Vec<SearchHit>> {
        let response = self
            .client
            .get(&self.endpoint)
            .query(&[("q", topic)])
            .send()
            .await
            .map_err(|e| DigestError::Search {
                message: format!("{}: {e}", self.endpoint),
                transient: true,
            })?;

        let status = response.status();
        if !status.is_success() {
            return Err(DigestError::Search {
                message: format!("{}: HTTP {status}", self.endpoint),
                transient: is_transient_status(status),
            });
        }

        let body = response.text().await.map_err(|e| DigestError::Search {
            message: format!("{}: failed to read body: {e}", self.endpoint),
            transient: true,
        })?;

        let hits = parse_results(&body, self.max_results);
        debug!(body_len = body.len(), "search page parsed");
        info!(hits = hits.len(), "search complete");

        Ok(hits)
    }
}

fn is_transient_status(status: StatusCode) -> bool {
    status == StatusCode::TOO_MANY_REQUESTS || status.is_server_error()
}
