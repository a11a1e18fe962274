//! OpenAI-compatible chat-completions backend for entity extraction and
//! theme synthesis.
//!
//! Both calls use JSON mode at temperature 0 so replies are parseable and
//! repeatable. Failures are classified for the processor pools' retry
//! policy: 429, 5xx and timeouts are transient; 401/403 are configuration
//! errors that end the run; anything unparseable is a content error.

mod prompt;
mod wire;

use std::time::Duration;

use async_trait::async_trait;
use reqwest::header::{AUTHORIZATION, HeaderMap, HeaderValue};
use reqwest::{Client, StatusCode};
use tracing::{debug, instrument};

use topicdigest_shared::{
    DigestError, EntityRecord, LanguageModel, LlmConfig, ModelReply, PageExtraction, PageInput,
    Result, ThemeRecord, TokenUsage,
};

use crate::wire::{ChatMessage, ChatRequest, ChatResponse, ResponseFormat};

/// Longest slice of an error body kept in error messages.
const ERROR_BODY_LIMIT: usize = 300;

// ---------------------------------------------------------------------------
// OpenAiModel
// ---------------------------------------------------------------------------

/// [`LanguageModel`] over any OpenAI-compatible `/chat/completions` endpoint.
#[derive(Debug, Clone)]
pub struct OpenAiModel {
    http: Client,
    base_url: String,
    model: String,
    api_key: String,
}

impl OpenAiModel {
    /// Build a client from the `[llm]` config section and a resolved API key.
    pub fn new(config: &LlmConfig, api_key: impl Into<String>) -> Result<Self> {
        let http = Client::builder()
            .timeout(Duration::from_secs(config.request_timeout_secs))
            .build()
            .map_err(|e| DigestError::config(format!("failed to build LLM client: {e}")))?;

        Ok(Self {
            http,
            base_url: config.base_url.trim_end_matches('/').to_string(),
            model: config.model.clone(),
            api_key: api_key.into(),
        })
    }

    fn headers(&self) -> Result<HeaderMap> {
        let mut headers = HeaderMap::new();
        let bearer = HeaderValue::from_str(&format!("Bearer {}", self.api_key))
            .map_err(|_| DigestError::config("API key contains invalid header characters"))?;
        headers.insert(AUTHORIZATION, bearer);
        Ok(headers)
    }

    /// Send one JSON-mode chat request and return the first choice's content
    /// with the reported token usage.
    async fn complete(&self, system: &str, user: String) -> Result<(String, TokenUsage)> {
        let url = format!("{}/chat/completions", self.base_url);
        let request = ChatRequest {
            model: &self.model,
            messages: vec![ChatMessage::system(system), ChatMessage::user(user)],
            temperature: 0.0,
            response_format: ResponseFormat::JSON_OBJECT,
        };

        let response = self
            .http
            .post(&url)
            .headers(self.headers()?)
            .json(&request)
            .send()
            .await
            .map_err(|e| DigestError::llm_transient(format!("request to {url} failed: {e}")))?;

        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(classify_status(status, &body));
        }

        let chat: ChatResponse = response
            .json()
            .await
            .map_err(|e| DigestError::llm_content(format!("malformed completion response: {e}")))?;

        let usage = TokenUsage::from(chat.usage.unwrap_or_default());
        let content = chat
            .choices
            .into_iter()
            .next()
            .and_then(|c| c.message.content)
            .ok_or_else(|| DigestError::llm_content("completion has no content"))?;

        debug!(
            content_len = content.len(),
            tokens = usage.total(),
            "completion received"
        );
        Ok((content, usage))
    }
}

fn classify_status(status: StatusCode, body: &str) -> DigestError {
    let snippet: String = body.chars().take(ERROR_BODY_LIMIT).collect();
    let message = format!("model API returned {status}: {snippet}");
    match status {
        StatusCode::UNAUTHORIZED | StatusCode::FORBIDDEN => DigestError::config(message),
        StatusCode::TOO_MANY_REQUESTS | StatusCode::REQUEST_TIMEOUT => {
            DigestError::llm_transient(message)
        }
        s if s.is_server_error() => DigestError::llm_transient(message),
        _ => DigestError::llm_content(message),
    }
}

#[async_trait]
impl LanguageModel for OpenAiModel {
    #[instrument(skip_all, fields(model = %self.model, pages = pages.len()))]
    async fn extract(
        &self,
        topic: &str,
        pages: &[PageInput],
    ) -> Result<ModelReply<Vec<PageExtraction>>> {
        let (content, usage) = self
            .complete(prompt::EXTRACT_SYSTEM, prompt::extract_user(topic, pages))
            .await?;
        let extractions = prompt::parse_extraction(&content, pages)?;
        Ok(ModelReply::new(extractions, usage))
    }

    #[instrument(skip_all, fields(model = %self.model, records = records.len()))]
    async fn synthesize(
        &self,
        topic: &str,
        records: &[EntityRecord],
    ) -> Result<ModelReply<Vec<ThemeRecord>>> {
        let (content, usage) = self
            .complete(prompt::SYNTHESIZE_SYSTEM, prompt::synthesize_user(topic, records))
            .await?;
        let themes = prompt::parse_synthesis(&content)?;
        debug!(themes = themes.len(), "synthesis parsed");
        Ok(ModelReply::new(themes, usage))
    }
}
