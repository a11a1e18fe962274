//! The digest: a run's final artifact and how it is written to disk.

use std::path::{Path, PathBuf};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tracing::{debug, info, instrument};

use topicdigest_shared::{DigestError, EntityRecord, ItemFailure, Result, RunId, ThemeRecord};

use crate::pipeline::RunReport;

/// Longest slug used for a digest filename.
const MAX_SLUG_LEN: usize = 80;

/// Everything a completed run produced.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Digest {
    pub run_id: RunId,
    pub topic: String,
    pub generated_at: DateTime<Utc>,
    pub entities: Vec<EntityRecord>,
    pub themes: Vec<ThemeRecord>,
    pub failures: Vec<ItemFailure>,
    pub report: RunReport,
}

/// Filesystem-safe name for a topic: lowercase ASCII alphanumeric words
/// joined by `-`.
pub fn topic_slug(topic: &str) -> String {
    let mut slug = String::new();
    for word in topic
        .split(|c: char| !c.is_ascii_alphanumeric())
        .filter(|w| !w.is_empty())
    {
        if slug.len() + word.len() + 1 > MAX_SLUG_LEN {
            break;
        }
        if !slug.is_empty() {
            slug.push('-');
        }
        slug.push_str(&word.to_ascii_lowercase());
    }
    if slug.is_empty() {
        slug.push_str("topic");
    }
    slug
}

/// Where the digest for `topic` lands inside `dir`: `<slug>.json`, so the
/// file stem is the slug itself.
pub fn digest_path(dir: &Path, topic: &str) -> PathBuf {
    dir.join(format!("{}.json", topic_slug(topic)))
}

/// Write `digest` as pretty JSON into `dir`, replacing any previous digest
/// for the same topic. The file is written to a temp name and renamed.
#[instrument(skip_all, fields(dir = %dir.display(), topic = %digest.topic))]
pub fn write_digest(digest: &Digest, dir: &Path) -> Result<PathBuf> {
    std::fs::create_dir_all(dir).map_err(|e| DigestError::io(dir, e))?;

    let json = serde_json::to_string_pretty(digest)
        .map_err(|e| DigestError::parse(format!("digest serialization failed: {e}")))?;

    let target = digest_path(dir, &digest.topic);
    let temp = dir.join(format!(".{}.{}.tmp", topic_slug(&digest.topic), digest.run_id));

    std::fs::write(&temp, &json).map_err(|e| DigestError::io(&temp, e))?;
    std::fs::rename(&temp, &target).map_err(|e| DigestError::io(&target, e))?;

    debug!(size = json.len(), "wrote digest");
    info!(path = %target.display(), themes = digest.themes.len(), "digest written");
    Ok(target)
}

/// Read a digest back from disk.
pub fn read_digest(path: &Path) -> Result<Digest> {
    let raw = std::fs::read_to_string(path).map_err(|e| DigestError::io(path, e))?;
    serde_json::from_str(&raw)
        .map_err(|e| DigestError::parse(format!("invalid digest {}: {e}", path.display())))
}
