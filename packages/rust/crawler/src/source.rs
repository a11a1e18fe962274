//! Production [`WebSource`]: topic search and feeds plus page fetching.

use std::time::Duration;

use async_trait::async_trait;

use topicdigest_discovery::Searcher;
use topicdigest_shared::{AppConfig, FetchedDocument, Result, SearchHit, WebSource};

use crate::feed::FeedReader;
use crate::fetch::HttpFetcher;

/// [`WebSource`] backed by the HTML search endpoint and [`HttpFetcher`].
#[derive(Debug, Clone)]
pub struct HttpWebSource {
    searcher: Searcher,
    fetcher: HttpFetcher,
    feeds: FeedReader,
}

impl HttpWebSource {
    pub fn new(config: &AppConfig) -> Result<Self> {
        let timeout = Duration::from_secs(config.crawl.fetch_timeout_secs);
        Ok(Self {
            searcher: Searcher::new(&config.search)?,
            fetcher: HttpFetcher::new(timeout)?,
            feeds: FeedReader::new(timeout)?,
        })
    }

    /// Assemble from pre-built parts.
    pub fn from_parts(searcher: Searcher, fetcher: HttpFetcher, feeds: FeedReader) -> Self {
        Self {
            searcher,
            fetcher,
            feeds,
        }
    }
}

#[async_trait]
impl WebSource for HttpWebSource {
    async fn discover(&self, topic: &str) -> Result<Vec<SearchHit>> {
        self.searcher.search(topic).await
    }

    async fn fetch(&self, url: &str) -> Result<FetchedDocument> {
        self.fetcher.fetch(url).await
    }

    async fn feed(&self, url: &str) -> Result<Vec<SearchHit>> {
        self.feeds.read(url).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use topicdigest_shared::SearchConfig;
    use wiremock::matchers::{path, query_param};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    #[tokio::test]
    async fn discovers_then_fetches() {
        let server = MockServer::start().await;
        let results = format!(
            r#"<html><body><div class="result">
                <a class="result__a" href="{}/article">Flood warning</a>
            </div></body></html>"#,
            server.uri()
        );

        Mock::given(path("/html/"))
            .and(query_param("q", "flood"))
            .respond_with(ResponseTemplate::new(200).set_body_string(results))
            .mount(&server)
            .await;
        Mock::given(path("/article"))
            .respond_with(
                ResponseTemplate::new(200)
                    .insert_header("content-type", "text/html")
                    .set_body_string("<html><body><article>River levels rose.</article></body></html>"),
            )
            .mount(&server)
            .await;

        let searcher = Searcher::new(&SearchConfig {
            endpoint: format!("{}/html/", server.uri()),
            max_results: 5,
            timeout_secs: 5,
        })
        .unwrap();
        let fetcher = HttpFetcher::new(Duration::from_secs(5))
            .unwrap()
            .allow_localhost();
        let feeds = FeedReader::new(Duration::from_secs(5))
            .unwrap()
            .allow_localhost();
        let source = HttpWebSource::from_parts(searcher, fetcher, feeds);

        let hits = source.discover("flood").await.unwrap();
        assert_eq!(hits.len(), 1);

        let doc = source.fetch(&hits[0].url).await.unwrap();
        assert!(doc.body.contains("River levels rose."));
    }
}
