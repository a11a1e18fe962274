//! HTTP page fetcher.

use std::time::Duration;

use reqwest::{Client, StatusCode, header};
use tracing::{debug, instrument};
use url::Url;

use topicdigest_shared::{DigestError, FetchedDocument, Result};

use crate::scope::is_ssrf_target;

/// User-Agent string for page requests.
const USER_AGENT: &str = concat!("topicdigest/", env!("CARGO_PKG_VERSION"));

/// Maximum number of redirects to follow per page.
const MAX_REDIRECTS: usize = 5;

/// Fetches single HTML pages and classifies failures as transient or permanent.
#[derive(Debug, Clone)]
pub struct HttpFetcher {
    client: Client,
    /// Allow localhost/private IPs (for integration tests with mock servers).
    allow_localhost: bool,
}

impl HttpFetcher {
    pub fn new(timeout: Duration) -> Result<Self> {
        let client = Client::builder()
            .user_agent(USER_AGENT)
            .redirect(reqwest::redirect::Policy::limited(MAX_REDIRECTS))
            .timeout(timeout)
            .build()
            .map_err(|e| DigestError::config(format!("failed to build HTTP client: {e}")))?;

        Ok(Self {
            client,
            allow_localhost: false,
        })
    }

    /// Allow fetching localhost/private IPs (for integration tests).
    #[cfg(test)]
    pub(crate) fn allow_localhost(mut self) -> Self {
        self.allow_localhost = true;
        self
    }

    /// Fetch one page.
    ///
    /// Network errors, timeouts, 429 and 5xx are transient. Other non-success
    /// statuses, SSRF-blocked targets and non-HTML bodies are permanent.
    #[instrument(skip(self))]
    pub async fn fetch(&self, url: &str) -> Result<FetchedDocument> {
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

        if let Some(content_type) = response
            .headers()
            .get(header::CONTENT_TYPE)
            .and_then(|v| v.to_str().ok())
        {
            if !is_textual(content_type) {
                return Err(DigestError::fetch_permanent(
                    url,
                    format!("unsupported content type '{content_type}'"),
                ));
            }
        }

        let final_url = response.url().to_string();
        let body = response
            .text()
            .await
            .map_err(|e| DigestError::fetch_transient(url, format!("body read failed: {e}")))?;

        debug!(status = status.as_u16(), body_len = body.len(), "page fetched");

        Ok(FetchedDocument {
            url: final_url,
            status_code: status.as_u16(),
            body,
        })
    }
}

pub(crate) fn is_transient_status(status: StatusCode) -> bool {
    status == StatusCode::TOO_MANY_REQUESTS || status.is_server_error()
}

fn is_textual(content_type: &str) -> bool {
    let mime = content_type.to_ascii_lowercase();
    mime.contains("html") || mime.starts_with("text/plain")
}
