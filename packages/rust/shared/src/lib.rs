//! Shared types, error model, configuration, and collaborator traits for topicdigest.
//!
//! This crate is the foundation depended on by all other topicdigest crates.
//! It provides:
//! - [`DigestError`]: the unified error type
//! - Domain types ([`FetchTask`], [`FetchResult`], [`EntityRecord`], [`ThemeRecord`])
//! - Configuration ([`AppConfig`], [`PipelineConfig`], config loading)
//! - The [`WebSource`] and [`LanguageModel`] collaborator traits

pub mod backend;
pub mod config;
pub mod error;
pub mod types;

// Re-export public API at crate root for ergonomic imports.
pub use backend::{LanguageModel, WebSource};
pub use config::{
    AppConfig, CrawlConfig, CrawlSettings, LlmConfig, PipelineConfig, PipelineSettings,
    SearchConfig, StageConfig, StageSettings, config_dir, config_file_path, init_config,
    load_config, load_config_from, resolve_api_key,
};
pub use error::{DigestError, GateKind, Result};
pub use types::{
    Entity, EntityRecord, EntityRef, FetchResult, FetchStatus, FetchTask, FetchedDocument,
    ItemFailure, ModelReply, PageExtraction, PageInput, PublishWindow, RunId, SearchHit, Stage,
    ThemeRecord, TokenUsage, compute_hash,
};
