//! Collaborator capability interfaces.
//!
//! The pipeline only ever talks to the web and the model through these two
//! traits, so concrete backends (HTTP + search endpoint, OpenAI-compatible
//! model, test mocks) are swappable behind `Arc<dyn …>`.

use async_trait::async_trait;

use crate::error::Result;
use crate::types::{
    EntityRecord, FetchedDocument, ModelReply, PageExtraction, PageInput, SearchHit, ThemeRecord,
};

/// Search + page retrieval.
#[async_trait]
pub trait WebSource: Send + Sync {
    /// Find candidate pages for a topic.
    async fn discover(&self, topic: &str) -> Result<Vec<SearchHit>>;

    /// Fetch one page. Non-success HTTP status is an `Err`.
    async fn fetch(&self, url: &str) -> Result<FetchedDocument>;

    /// Read an RSS/Atom feed into hits, newest first.
    ///
    /// Sources without feed support yield nothing.
    async fn feed(&self, _url: &str) -> Result<Vec<SearchHit>> {
        Ok(Vec::new())
    }
}

/// Entity extraction and theme synthesis.
#[async_trait]
pub trait LanguageModel: Send + Sync {
    /// Extract entities from every page of the batch.
    ///
    /// Implementations return one [`PageExtraction`] per input page; pages
    /// missing from the result are treated as failed by the caller.
    async fn extract(
        &self,
        topic: &str,
        pages: &[PageInput],
    ) -> Result<ModelReply<Vec<PageExtraction>>>;

    /// Group the batch's entities into themes.
    async fn synthesize(
        &self,
        topic: &str,
        records: &[EntityRecord],
    ) -> Result<ModelReply<Vec<ThemeRecord>>>;
}
