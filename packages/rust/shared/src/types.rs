//! Core domain types flowing through the topic pipeline.

use std::collections::{BTreeMap, BTreeSet};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use uuid::Uuid;

// ---------------------------------------------------------------------------
// RunId
// ---------------------------------------------------------------------------

/// A UUID v7 wrapper identifying one pipeline run (time-sortable).
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct RunId(pub Uuid);

impl RunId {
    /// Generate a new time-sortable run identifier.
    pub fn new() -> Self {
        Self(Uuid::now_v7())
    }
}

impl Default for RunId {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Display for RunId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

// ---------------------------------------------------------------------------
// Discovery and fetch
// ---------------------------------------------------------------------------

/// A candidate page returned by the search collaborator.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SearchHit {
    pub url: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub title: Option<String>,
    /// Result snippet; used as page text when the page itself yields none.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub snippet: Option<String>,
    /// Publish time, when the source reports one (feed entries do).
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub published: Option<DateTime<Utc>>,
}

impl SearchHit {
    pub fn new(url: impl Into<String>) -> Self {
        Self {
            url: url.into(),
            title: None,
            snippet: None,
            published: None,
        }
    }

    /// Case-insensitive match of any keyword against title and snippet.
    /// An empty keyword list matches everything.
    pub fn mentions_any(&self, keywords: &[String]) -> bool {
        if keywords.is_empty() {
            return true;
        }
        let haystack = format!(
            "{} {}",
            self.title.as_deref().unwrap_or_default(),
            self.snippet.as_deref().unwrap_or_default()
        )
        .to_lowercase();
        keywords
            .iter()
            .any(|keyword| haystack.contains(&keyword.to_lowercase()))
    }
}

/// Inclusive publish-time bounds for seed hits.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct PublishWindow {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub since: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub until: Option<DateTime<Utc>>,
}

impl PublishWindow {
    pub fn is_unbounded(&self) -> bool {
        self.since.is_none() && self.until.is_none()
    }

    /// Undated hits always pass; dated ones must fall inside both bounds.
    pub fn contains(&self, published: Option<DateTime<Utc>>) -> bool {
        let Some(at) = published else {
            return true;
        };
        self.since.is_none_or(|since| at >= since) && self.until.is_none_or(|until| at <= until)
    }
}

/// A unit of retrieval work sitting in the frontier.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FetchTask {
    pub url: String,
    /// Link distance from a search seed (seeds are depth 0).
    pub depth: u32,
    pub topic: String,
    pub title: Option<String>,
    pub snippet: Option<String>,
}

/// Raw document returned by the fetch collaborator.
#[derive(Debug, Clone)]
pub struct FetchedDocument {
    /// Final URL after redirects.
    pub url: String,
    pub status_code: u16,
    pub body: String,
}

/// Terminal status of one fetch.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "status", content = "reason", rename_all = "snake_case")]
pub enum FetchStatus {
    Ok,
    Failed(String),
}

/// A fetch outcome travelling down the entity queue.
#[derive(Debug, Clone)]
pub struct FetchResult {
    pub url: String,
    pub depth: u32,
    pub title: Option<String>,
    pub raw_content: String,
    /// Readable text prepared for the model (empty when failed).
    pub text: String,
    pub content_hash: String,
    pub fetched_at: DateTime<Utc>,
    pub status: FetchStatus,
}

impl FetchResult {
    /// Successful fetch with prepared text.
    pub fn ok(task: &FetchTask, raw_content: String, title: Option<String>, text: String) -> Self {
        Self {
            url: task.url.clone(),
            depth: task.depth,
            title: title.or_else(|| task.title.clone()),
            content_hash: compute_hash(&raw_content),
            raw_content,
            text,
            fetched_at: Utc::now(),
            status: FetchStatus::Ok,
        }
    }

    /// Failed fetch; still travels downstream for accounting.
    pub fn failed(task: &FetchTask, reason: impl Into<String>) -> Self {
        Self {
            url: task.url.clone(),
            depth: task.depth,
            title: task.title.clone(),
            raw_content: String::new(),
            text: String::new(),
            content_hash: String::new(),
            fetched_at: Utc::now(),
            status: FetchStatus::Failed(reason.into()),
        }
    }

    pub fn is_ok(&self) -> bool {
        self.status == FetchStatus::Ok
    }
}

/// Compute the SHA-256 hex digest of content.
pub fn compute_hash(content: &str) -> String {
    let mut hasher = Sha256::new();
    hasher.update(content.as_bytes());
    format!("{:x}", hasher.finalize())
}

// ---------------------------------------------------------------------------
// Entities
// ---------------------------------------------------------------------------

/// One named thing the model found on a page.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Entity {
    pub name: String,
    /// Free-form category, e.g. `Person`, `Organization`, `Event`.
    pub kind: String,
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub attributes: BTreeMap<String, String>,
}

/// All entities extracted from a single source page.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EntityRecord {
    pub source_url: String,
    pub entities: Vec<Entity>,
    pub extracted_at: DateTime<Utc>,
}

/// Reference to an entity by its source page and name.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct EntityRef {
    pub source_url: String,
    pub name: String,
}

// ---------------------------------------------------------------------------
// Themes
// ---------------------------------------------------------------------------

/// A group of related entities with a synthesized summary.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ThemeRecord {
    pub theme_name: String,
    pub supporting_entities: BTreeSet<EntityRef>,
    pub summary_text: String,
}

// ---------------------------------------------------------------------------
// Model I/O
// ---------------------------------------------------------------------------

/// One page as handed to the extraction call.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct PageInput {
    pub url: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub title: Option<String>,
    pub text: String,
}

/// Token counts the model reported for one call.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct TokenUsage {
    pub prompt_tokens: u64,
    pub completion_tokens: u64,
}

impl TokenUsage {
    pub fn total(&self) -> u64 {
        self.prompt_tokens + self.completion_tokens
    }
}

/// A parsed model reply and the tokens it cost.
#[derive(Debug, Clone, PartialEq)]
pub struct ModelReply<T> {
    pub value: T,
    pub usage: TokenUsage,
}

impl<T> ModelReply<T> {
    pub fn new(value: T, usage: TokenUsage) -> Self {
        Self { value, usage }
    }

    /// Reply from a backend that does not report usage.
    pub fn unmetered(value: T) -> Self {
        Self::new(value, TokenUsage::default())
    }
}

/// Per-page extraction outcome, keyed by `source_url`.
///
/// `Err` marks a page the model could not handle; the rest of the batch is
/// unaffected.
#[derive(Debug, Clone, PartialEq)]
pub struct PageExtraction {
    pub source_url: String,
    pub outcome: std::result::Result<Vec<Entity>, String>,
}

// ---------------------------------------------------------------------------
// Failures
// ---------------------------------------------------------------------------

/// Pipeline stage an item failed in.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Stage {
    Fetch,
    Extraction,
    Theme,
}

/// A recorded, non-fatal per-item failure.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ItemFailure {
    pub url: String,
    pub stage: Stage,
    pub reason: String,
}
