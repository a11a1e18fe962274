//! Application configuration for topicdigest.
//!
//! User config lives at `~/.topicdigest/topicdigest.toml`.
//! CLI flags override config file values, which override defaults.

use std::path::{Path, PathBuf};
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::error::{DigestError, Result};
use crate::types::PublishWindow;

/// Default configuration file name.
const CONFIG_FILE_NAME: &str = "topicdigest.toml";

/// Default config directory name under the user's home.
const CONFIG_DIR_NAME: &str = ".topicdigest";

// ---------------------------------------------------------------------------
// Config structs (matching topicdigest.toml schema)
// ---------------------------------------------------------------------------

/// Top-level application config, deserialized from TOML.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct AppConfig {
    /// Search collaborator settings.
    #[serde(default)]
    pub search: SearchConfig,

    /// Crawl limits and link policies.
    #[serde(default)]
    pub crawl: CrawlSettings,

    /// Model endpoint settings.
    #[serde(default)]
    pub llm: LlmConfig,

    /// Queue, worker, and batching knobs.
    #[serde(default)]
    pub pipeline: PipelineSettings,
}

/// `[search]` section.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SearchConfig {
    /// HTML search endpoint (DuckDuckGo HTML flavour).
    #[serde(default = "default_search_endpoint")]
    pub endpoint: String,

    /// Maximum number of search hits used as seeds.
    #[serde(default = "default_max_results")]
    pub max_results: usize,

    /// Request timeout in seconds.
    #[serde(default = "default_search_timeout")]
    pub timeout_secs: u64,
}

impl Default for SearchConfig {
    fn default() -> Self {
        Self {
            endpoint: default_search_endpoint(),
            max_results: default_max_results(),
            timeout_secs: default_search_timeout(),
        }
    }
}

fn default_search_endpoint() -> String {
    "https://html.duckduckgo.com/html/".into()
}
fn default_max_results() -> usize {
    10
}
fn default_search_timeout() -> u64 {
    15
}

/// `[crawl]` section.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CrawlSettings {
    /// Maximum link depth from a search seed.
    #[serde(default = "default_max_depth")]
    pub max_depth: u32,

    /// Maximum number of pages admitted to the frontier.
    #[serde(default = "default_max_pages")]
    pub max_pages: usize,

    /// Maximum concurrent page fetches.
    #[serde(default = "default_fetch_concurrency")]
    pub fetch_concurrency: usize,

    /// Attempts per page before it is recorded as failed.
    #[serde(default = "default_attempts")]
    pub fetch_attempts: u32,

    /// Per-request timeout in seconds.
    #[serde(default = "default_fetch_timeout")]
    pub fetch_timeout_secs: u64,

    /// Pause after each fetch while still holding the fetch gate.
    #[serde(default = "default_politeness_delay")]
    pub politeness_delay_ms: u64,

    /// Maximum wait for a fetch gate permit.
    #[serde(default = "default_gate_timeout")]
    pub gate_timeout_ms: u64,

    /// Maximum links a single page may add to the frontier.
    #[serde(default = "default_max_links_per_page")]
    pub max_links_per_page: usize,

    /// URL include glob patterns.
    #[serde(default)]
    pub include_patterns: Vec<String>,

    /// URL exclude glob patterns.
    #[serde(default)]
    pub exclude_patterns: Vec<String>,

    /// Extra seed URLs fetched alongside search results.
    #[serde(default)]
    pub seed_urls: Vec<String>,

    /// RSS/Atom feeds whose entries are added as seeds.
    #[serde(default)]
    pub feed_urls: Vec<String>,

    /// Feed entries must mention one of these in title or summary.
    /// Empty keeps every entry.
    #[serde(default)]
    pub feed_keywords: Vec<String>,

    /// Drop dated seeds published before this instant (RFC 3339 string).
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub since: Option<DateTime<Utc>>,

    /// Drop dated seeds published after this instant (RFC 3339 string).
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub until: Option<DateTime<Utc>>,
}

impl Default for CrawlSettings {
    fn default() -> Self {
        Self {
            max_depth: default_max_depth(),
            max_pages: default_max_pages(),
            fetch_concurrency: default_fetch_concurrency(),
            fetch_attempts: default_attempts(),
            fetch_timeout_secs: default_fetch_timeout(),
            politeness_delay_ms: default_politeness_delay(),
            gate_timeout_ms: default_gate_timeout(),
            max_links_per_page: default_max_links_per_page(),
            include_patterns: Vec::new(),
            exclude_patterns: Vec::new(),
            seed_urls: Vec::new(),
            feed_urls: Vec::new(),
            feed_keywords: Vec::new(),
            since: None,
            until: None,
        }
    }
}

fn default_max_depth() -> u32 {
    1
}
fn default_max_pages() -> usize {
    30
}
fn default_fetch_concurrency() -> usize {
    4
}
fn default_attempts() -> u32 {
    3
}
fn default_fetch_timeout() -> u64 {
    20
}
fn default_politeness_delay() -> u64 {
    250
}
fn default_gate_timeout() -> u64 {
    60_000
}
fn default_max_links_per_page() -> usize {
    5
}

/// `[llm]` section.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LlmConfig {
    /// OpenAI-compatible API base URL.
    #[serde(default = "default_base_url")]
    pub base_url: String,

    /// Name of the env var holding the API key (never store the key itself).
    #[serde(default = "default_api_key_env")]
    pub api_key_env: String,

    /// Model identifier.
    #[serde(default = "default_model")]
    pub model: String,

    /// Maximum concurrent model calls across both stages.
    #[serde(default = "default_llm_concurrency")]
    pub concurrency: usize,

    /// Maximum wait for an LLM gate permit.
    #[serde(default = "default_gate_timeout")]
    pub gate_timeout_ms: u64,

    /// Per-request timeout in seconds.
    #[serde(default = "default_request_timeout")]
    pub request_timeout_secs: u64,

    /// Page text is truncated to this many characters before extraction.
    #[serde(default = "default_max_input_chars")]
    pub max_input_chars: usize,
}

impl Default for LlmConfig {
    fn default() -> Self {
        Self {
            base_url: default_base_url(),
            api_key_env: default_api_key_env(),
            model: default_model(),
            concurrency: default_llm_concurrency(),
            gate_timeout_ms: default_gate_timeout(),
            request_timeout_secs: default_request_timeout(),
            max_input_chars: default_max_input_chars(),
        }
    }
}

fn default_base_url() -> String {
    "https://api.openai.com/v1".into()
}
fn default_api_key_env() -> String {
    "OPENAI_API_KEY".into()
}
fn default_model() -> String {
    "gpt-4o-mini".into()
}
fn default_llm_concurrency() -> usize {
    2
}
fn default_request_timeout() -> u64 {
    120
}
fn default_max_input_chars() -> usize {
    12_000
}

/// `[pipeline]` section.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PipelineSettings {
    #[serde(default = "default_entity_capacity")]
    pub entity_queue_capacity: usize,

    #[serde(default = "default_theme_capacity")]
    pub theme_queue_capacity: usize,

    /// Parallel retriever workers sharing one frontier.
    #[serde(default = "default_retriever_workers")]
    pub retriever_workers: usize,

    /// Directory the digest JSON is written to.
    #[serde(default = "default_output_dir")]
    pub output_dir: String,

    /// Maximum wait for workers to unwind after cancellation.
    #[serde(default = "default_shutdown_grace")]
    pub shutdown_grace_ms: u64,

    /// First retry backoff; doubles per attempt.
    #[serde(default = "default_retry_base")]
    pub retry_base_delay_ms: u64,

    /// Backoff ceiling.
    #[serde(default = "default_retry_max")]
    pub retry_max_delay_ms: u64,

    /// `[pipeline.entity]` batching for extraction.
    #[serde(default = "StageSettings::entity_defaults")]
    pub entity: StageSettings,

    /// `[pipeline.theme]` batching for synthesis.
    #[serde(default = "StageSettings::theme_defaults")]
    pub theme: StageSettings,
}

impl Default for PipelineSettings {
    fn default() -> Self {
        Self {
            entity_queue_capacity: default_entity_capacity(),
            theme_queue_capacity: default_theme_capacity(),
            retriever_workers: default_retriever_workers(),
            output_dir: default_output_dir(),
            shutdown_grace_ms: default_shutdown_grace(),
            retry_base_delay_ms: default_retry_base(),
            retry_max_delay_ms: default_retry_max(),
            entity: StageSettings::entity_defaults(),
            theme: StageSettings::theme_defaults(),
        }
    }
}

fn default_entity_capacity() -> usize {
    16
}
fn default_theme_capacity() -> usize {
    64
}
fn default_retriever_workers() -> usize {
    2
}
fn default_output_dir() -> String {
    "data".into()
}
fn default_shutdown_grace() -> u64 {
    2_000
}
fn default_retry_base() -> u64 {
    500
}
fn default_retry_max() -> u64 {
    10_000
}

/// Batching knobs for one processing stage.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StageSettings {
    pub batch_size: usize,
    pub batch_timeout_ms: u64,
    pub workers: usize,
    pub max_attempts: u32,
}

impl StageSettings {
    fn entity_defaults() -> Self {
        Self {
            batch_size: 3,
            batch_timeout_ms: 2_000,
            workers: 2,
            max_attempts: 3,
        }
    }

    fn theme_defaults() -> Self {
        Self {
            batch_size: 12,
            batch_timeout_ms: 5_000,
            workers: 1,
            max_attempts: 3,
        }
    }
}

// ---------------------------------------------------------------------------
// Runtime config (merged from config + CLI flags)
// ---------------------------------------------------------------------------

/// Runtime crawl limits for the retriever.
#[derive(Debug, Clone)]
pub struct CrawlConfig {
    pub max_depth: u32,
    pub max_pages: usize,
    pub fetch_attempts: u32,
    pub politeness_delay: Duration,
    pub max_links_per_page: usize,
    pub include_patterns: Vec<String>,
    pub exclude_patterns: Vec<String>,
    pub seed_urls: Vec<String>,
    pub feed_urls: Vec<String>,
    pub feed_keywords: Vec<String>,
    pub window: PublishWindow,
}

/// Runtime batching policy for one processor pool.
#[derive(Debug, Clone)]
pub struct StageConfig {
    pub batch_size: usize,
    pub batch_timeout: Duration,
    pub workers: usize,
    pub max_attempts: u32,
}

impl From<&StageSettings> for StageConfig {
    fn from(s: &StageSettings) -> Self {
        Self {
            batch_size: s.batch_size.max(1),
            batch_timeout: Duration::from_millis(s.batch_timeout_ms),
            workers: s.workers.max(1),
            max_attempts: s.max_attempts.max(1),
        }
    }
}

/// Everything the pipeline coordinator needs for one run.
#[derive(Debug, Clone)]
pub struct PipelineConfig {
    pub crawl: CrawlConfig,
    pub entity: StageConfig,
    pub theme: StageConfig,
    pub entity_queue_capacity: usize,
    pub theme_queue_capacity: usize,
    pub retriever_workers: usize,
    pub fetch_concurrency: usize,
    pub fetch_gate_timeout: Duration,
    pub llm_concurrency: usize,
    pub llm_gate_timeout: Duration,
    pub retry_base_delay: Duration,
    pub retry_max_delay: Duration,
    pub shutdown_grace: Duration,
    pub max_input_chars: usize,
}

impl From<&AppConfig> for PipelineConfig {
    fn from(config: &AppConfig) -> Self {
        let crawl = &config.crawl;
        let pipeline = &config.pipeline;
        Self {
            crawl: CrawlConfig {
                max_depth: crawl.max_depth,
                max_pages: crawl.max_pages,
                fetch_attempts: crawl.fetch_attempts.max(1),
                politeness_delay: Duration::from_millis(crawl.politeness_delay_ms),
                max_links_per_page: crawl.max_links_per_page,
                include_patterns: crawl.include_patterns.clone(),
                exclude_patterns: crawl.exclude_patterns.clone(),
                seed_urls: crawl.seed_urls.clone(),
                feed_urls: crawl.feed_urls.clone(),
                feed_keywords: crawl.feed_keywords.clone(),
                window: PublishWindow {
                    since: crawl.since,
                    until: crawl.until,
                },
            },
            entity: StageConfig::from(&pipeline.entity),
            theme: StageConfig::from(&pipeline.theme),
            entity_queue_capacity: pipeline.entity_queue_capacity.max(1),
            theme_queue_capacity: pipeline.theme_queue_capacity.max(1),
            retriever_workers: pipeline.retriever_workers.max(1),
            fetch_concurrency: crawl.fetch_concurrency.max(1),
            fetch_gate_timeout: Duration::from_millis(crawl.gate_timeout_ms),
            llm_concurrency: config.llm.concurrency.max(1),
            llm_gate_timeout: Duration::from_millis(config.llm.gate_timeout_ms),
            retry_base_delay: Duration::from_millis(pipeline.retry_base_delay_ms),
            retry_max_delay: Duration::from_millis(pipeline.retry_max_delay_ms),
            shutdown_grace: Duration::from_millis(pipeline.shutdown_grace_ms),
            max_input_chars: config.llm.max_input_chars,
        }
    }
}

// ---------------------------------------------------------------------------
// Config loading
// ---------------------------------------------------------------------------

/// Get the path to the config directory (`~/.topicdigest/`).
pub fn config_dir() -> Result<PathBuf> {
    let home =
        dirs::home_dir().ok_or_else(|| DigestError::config("could not determine home directory"))?;
    Ok(home.join(CONFIG_DIR_NAME))
}

/// Get the path to the config file (`~/.topicdigest/topicdigest.toml`).
pub fn config_file_path() -> Result<PathBuf> {
    Ok(config_dir()?.join(CONFIG_FILE_NAME))
}

/// Load the application config from disk. Returns defaults if the file does not exist.
pub fn load_config() -> Result<AppConfig> {
    let path = config_file_path()?;

    if !path.exists() {
        tracing::debug!(?path, "config file not found, using defaults");
        return Ok(AppConfig::default());
    }

    load_config_from(&path)
}

/// Load the application config from a specific file path.
pub fn load_config_from(path: &Path) -> Result<AppConfig> {
    let content = std::fs::read_to_string(path).map_err(|e| DigestError::io(path, e))?;

    toml::from_str(&content)
        .map_err(|e| DigestError::config(format!("failed to parse {}: {e}", path.display())))
}

/// Create the config directory and write a default config file.
/// Returns the path to the created file.
pub fn init_config() -> Result<PathBuf> {
    let dir = config_dir()?;
    std::fs::create_dir_all(&dir).map_err(|e| DigestError::io(&dir, e))?;

    let path = dir.join(CONFIG_FILE_NAME);
    let config = AppConfig::default();
    let content =
        toml::to_string_pretty(&config).map_err(|e| DigestError::config(e.to_string()))?;

    std::fs::write(&path, content).map_err(|e| DigestError::io(&path, e))?;
    tracing::info!(?path, "created default config file");

    Ok(path)
}

/// Read the model API key from the env var named in the config.
pub fn resolve_api_key(config: &LlmConfig) -> Result<String> {
    let var_name = &config.api_key_env;
    match std::env::var(var_name) {
        Ok(val) if !val.trim().is_empty() => Ok(val),
        _ => Err(DigestError::config(format!(
            "model API key not found. Set the {var_name} environment variable."
        ))),
    }
}
