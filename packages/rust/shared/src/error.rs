//! Error types for topicdigest.
//!
//! Library crates use [`DigestError`] via `thiserror`.
//! The CLI wraps this with `color-eyre` for rich diagnostics.
//!
//! Per-item failures (a page that could not be fetched, a batch whose model
//! call kept failing) are *data*, not errors: they travel as
//! [`FetchStatus::Failed`](crate::FetchStatus) or
//! [`ItemFailure`](crate::ItemFailure). `DigestError` is what a worker
//! returns when it cannot continue, and [`DigestError::is_fatal`] decides
//! whether that ends the whole run.

use std::path::PathBuf;

/// Which admission gate a [`DigestError::GateTimeout`] came from.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, serde::Serialize, serde::Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum GateKind {
    Fetch,
    Llm,
}

impl std::fmt::Display for GateKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Fetch => f.write_str("fetch"),
            Self::Llm => f.write_str("llm"),
        }
    }
}

/// Top-level error type for all topicdigest operations.
#[derive(Debug, thiserror::Error)]
pub enum DigestError {
    /// Configuration or credential error. Always fatal to a run.
    #[error("config error: {message}")]
    Config { message: String },

    /// Page fetch failed.
    #[error("fetch error for {url}: {message}")]
    Fetch {
        url: String,
        message: String,
        transient: bool,
    },

    /// Search/discovery collaborator failed.
    #[error("search error: {message}")]
    Search { message: String, transient: bool },

    /// Model call failed (transport, rate limit, or unusable response).
    #[error("llm error: {message}")]
    Llm { message: String, transient: bool },

    /// A gate permit could not be acquired within the configured timeout.
    #[error("timed out waiting for the {gate} gate")]
    GateTimeout { gate: GateKind },

    /// Response or document parsing error.
    #[error("parse error: {message}")]
    Parse { message: String },

    /// Filesystem I/O error.
    #[error("I/O error at {path:?}: {source}")]
    Io {
        path: PathBuf,
        source: std::io::Error,
    },

    /// The run-wide cancellation token fired.
    #[error("run cancelled")]
    Cancelled,

    /// Push onto a queue whose producer side is already closed.
    #[error("queue '{queue}' is closed")]
    QueueClosed { queue: String },

    /// Accounting or queue invariant violated.
    #[error("invariant violated: {message}")]
    Invariant { message: String },
}

/// Convenience alias used throughout the codebase.
pub type Result<T> = std::result::Result<T, DigestError>;

impl DigestError {
    /// Create a config error from any displayable message.
    pub fn config(msg: impl Into<String>) -> Self {
        Self::Config {
            message: msg.into(),
        }
    }

    /// Create a parse error from any displayable message.
    pub fn parse(msg: impl Into<String>) -> Self {
        Self::Parse {
            message: msg.into(),
        }
    }

    /// Create an invariant error from any displayable message.
    pub fn invariant(msg: impl Into<String>) -> Self {
        Self::Invariant {
            message: msg.into(),
        }
    }

    /// Transient fetch failure (network, timeout, 429/5xx).
    pub fn fetch_transient(url: impl Into<String>, msg: impl Into<String>) -> Self {
        Self::Fetch {
            url: url.into(),
            message: msg.into(),
            transient: true,
        }
    }

    /// Permanent fetch failure (4xx, unsupported content).
    pub fn fetch_permanent(url: impl Into<String>, msg: impl Into<String>) -> Self {
        Self::Fetch {
            url: url.into(),
            message: msg.into(),
            transient: false,
        }
    }

    /// Transient model failure (rate limit, timeout, 5xx).
    pub fn llm_transient(msg: impl Into<String>) -> Self {
        Self::Llm {
            message: msg.into(),
            transient: true,
        }
    }

    /// Model returned something unusable.
    pub fn llm_content(msg: impl Into<String>) -> Self {
        Self::Llm {
            message: msg.into(),
            transient: false,
        }
    }

    /// Wrap a `std::io::Error` with a path for context.
    pub fn io(path: impl Into<PathBuf>, source: std::io::Error) -> Self {
        Self::Io {
            path: path.into(),
            source,
        }
    }

    /// Whether a retry of the same operation may succeed.
    pub fn is_transient(&self) -> bool {
        match self {
            Self::Fetch { transient, .. }
            | Self::Search { transient, .. }
            | Self::Llm { transient, .. } => *transient,
            Self::GateTimeout { .. } => true,
            _ => false,
        }
    }

    /// Whether this error ends the whole run instead of a single item.
    pub fn is_fatal(&self) -> bool {
        matches!(
            self,
            Self::Config { .. } | Self::Invariant { .. } | Self::QueueClosed { .. }
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn error_display_formatting() {
        let err = DigestError::config("missing API key");
        assert_eq!(err.to_string(), "config error: missing API key");

        let err = DigestError::GateTimeout {
            gate: GateKind::Llm,
        };
        assert_eq!(err.to_string(), "timed out waiting for the llm gate");
    }

    #[test]
    fn classification() {
        assert!(DigestError::fetch_transient("https://a.test", "timeout").is_transient());
        assert!(!DigestError::fetch_permanent("https://a.test", "HTTP 404").is_transient());
        assert!(DigestError::GateTimeout { gate: GateKind::Fetch }.is_transient());
        assert!(!DigestError::llm_content("bad json").is_transient());

        assert!(DigestError::config("no key").is_fatal());
        assert!(DigestError::invariant("lost item").is_fatal());
        assert!(!DigestError::llm_transient("429").is_fatal());
        assert!(!DigestError::Cancelled.is_fatal());
    }
}
