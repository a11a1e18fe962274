//! Run-wide result store.
//!
//! Written by the theme pool under a single lock; read once, after the
//! run drains, via [`ResultStore::freeze`].

use std::collections::{BTreeMap, HashMap};
use std::sync::{Mutex, MutexGuard, PoisonError};

use serde::{Deserialize, Serialize};

use topicdigest_shared::{EntityRecord, EntityRef, ItemFailure, Stage, ThemeRecord};

#[derive(Debug, Default)]
struct StoreInner {
    entities: Vec<EntityRecord>,
    /// Keyed by [`theme_key`].
    themes: BTreeMap<String, ThemeRecord>,
    failures: Vec<ItemFailure>,
}

/// Append-only store of entity records, merged themes, and item failures.
#[derive(Debug, Default)]
pub struct ResultStore {
    inner: Mutex<StoreInner>,
}

/// Frozen store contents, sorted for stable output.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct StoreSnapshot {
    pub entities: Vec<EntityRecord>,
    pub themes: Vec<ThemeRecord>,
    pub failures: Vec<ItemFailure>,
}

impl StoreSnapshot {
    /// Failures recorded at `stage`.
    pub fn failed_at(&self, stage: Stage) -> usize {
        self.failures.iter().filter(|f| f.stage == stage).count()
    }
}

/// Merge key for a theme name: trimmed and lowercased.
pub fn theme_key(name: &str) -> String {
    name.trim().to_lowercase()
}

impl ResultStore {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> MutexGuard<'_, StoreInner> {
        self.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn record_failure(&self, url: impl Into<String>, stage: Stage, reason: impl Into<String>) {
        self.lock().failures.push(ItemFailure {
            url: url.into(),
            stage,
            reason: reason.into(),
        });
    }

    /// Store entity records without themes (their synthesis failed).
    pub fn add_entities(&self, records: Vec<EntityRecord>) {
        self.lock().entities.extend(records);
    }

    /// Store one synthesized batch: its entity records and its themes.
    ///
    /// Themes merge by [`theme_key`]; the first spelling is kept. Supporting
    /// entities are unioned, and references that do not name an entity of
    /// `records` are dropped. A summary is appended as a new paragraph
    /// unless the existing text already contains it.
    pub fn merge(&self, records: Vec<EntityRecord>, themes: Vec<ThemeRecord>) {
        let known = known_entities(&records);

        let mut guard = self.lock();
        let inner = &mut *guard;
        for theme in themes {
            let key = theme_key(&theme.theme_name);
            if key.is_empty() {
                continue;
            }
            let supporting = theme
                .supporting_entities
                .iter()
                .filter_map(|r| known.get(&ref_key(r)).cloned());
            let summary = theme.summary_text.trim();

            match inner.themes.get_mut(&key) {
                Some(existing) => {
                    existing.supporting_entities.extend(supporting);
                    if !summary.is_empty() && !existing.summary_text.contains(summary) {
                        if !existing.summary_text.is_empty() {
                            existing.summary_text.push_str("\n\n");
                        }
                        existing.summary_text.push_str(summary);
                    }
                }
                None => {
                    let record = ThemeRecord {
                        theme_name: theme.theme_name.trim().to_string(),
                        supporting_entities: supporting.collect(),
                        summary_text: summary.to_string(),
                    };
                    inner.themes.insert(key, record);
                }
            }
        }
        inner.entities.extend(records);
    }

    /// Take the contents out, sorted for stable output.
    pub fn freeze(&self) -> StoreSnapshot {
        let inner = std::mem::take(&mut *self.lock());

        let mut entities = inner.entities;
        entities.sort_by(|a, b| a.source_url.cmp(&b.source_url));
        let mut failures = inner.failures;
        failures.sort_by(|a, b| (&a.url, a.stage as u8).cmp(&(&b.url, b.stage as u8)));

        StoreSnapshot {
            entities,
            themes: inner.themes.into_values().collect(),
            failures,
        }
    }
}

/// Canonical refs of every entity in `records`, keyed case-insensitively.
fn known_entities(records: &[EntityRecord]) -> HashMap<(String, String), EntityRef> {
    records
        .iter()
        .flat_map(|record| {
            record.entities.iter().map(|entity| {
                let canonical = EntityRef {
                    source_url: record.source_url.clone(),
                    name: entity.name.clone(),
                };
                (ref_key(&canonical), canonical)
            })
        })
        .collect()
}

fn ref_key(r: &EntityRef) -> (String, String) {
    (r.source_url.trim().to_string(), r.name.trim().to_lowercase())
}
