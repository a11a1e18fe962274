//! Prompt construction and parsing of the model's JSON replies.

use std::collections::{BTreeMap, BTreeSet, HashSet};

use serde::Deserialize;
use serde_json::{Value, json};

use topicdigest_shared::{
    DigestError, Entity, EntityRecord, EntityRef, PageExtraction, PageInput, Result, ThemeRecord,
};

// ---------------------------------------------------------------------------
// Extraction
// ---------------------------------------------------------------------------

pub(crate) const EXTRACT_SYSTEM: &str = "\
You extract named entities from news and reference pages about a topic. \
Reply with a single JSON object of the form \
{\"pages\": [{\"url\": string, \"entities\": [{\"name\": string, \"kind\": string, \
\"attributes\": {string: string}}]}]}. \
Return exactly one entry per input page, using the page's url unchanged. \
`kind` is a short category such as Person, Organization, Location, Event, Product or Concept. \
Only include entities relevant to the topic. \
If a page cannot be processed, return {\"url\": string, \"error\": string} for it instead.";

pub(crate) fn extract_user(topic: &str, pages: &[PageInput]) -> String {
    let payload = json!({ "topic": topic, "pages": pages });
    payload.to_string()
}

#[derive(Debug, Deserialize)]
struct ExtractReply {
    #[serde(default)]
    pages: Vec<PageReply>,
}

#[derive(Debug, Deserialize)]
struct PageReply {
    url: Option<String>,
    #[serde(default)]
    entities: Vec<EntityReply>,
    error: Option<String>,
}

#[derive(Debug, Deserialize)]
struct EntityReply {
    name: String,
    #[serde(default)]
    kind: String,
    #[serde(default)]
    attributes: BTreeMap<String, Value>,
}

impl EntityReply {
    fn into_entity(self) -> Option<Entity> {
        let name = self.name.trim().to_string();
        if name.is_empty() {
            return None;
        }
        let kind = match self.kind.trim() {
            "" => "Other".to_string(),
            k => k.to_string(),
        };
        let attributes = self
            .attributes
            .into_iter()
            .filter_map(|(k, v)| match v {
                Value::Null => None,
                Value::String(s) => Some((k, s)),
                other => Some((k, other.to_string())),
            })
            .collect();
        Some(Entity {
            name,
            kind,
            attributes,
        })
    }
}

/// Parse an extraction reply.
///
/// Entries without a `url` are matched to the input page at the same
/// position. Input pages the model skipped are simply absent.
pub(crate) fn parse_extraction(content: &str, pages: &[PageInput]) -> Result<Vec<PageExtraction>> {
    let reply: ExtractReply = serde_json::from_str(content)
        .map_err(|e| DigestError::llm_content(format!("extraction reply is not valid JSON: {e}")))?;

    let extractions = reply
        .pages
        .into_iter()
        .enumerate()
        .filter_map(|(idx, page)| {
            let source_url = page
                .url
                .or_else(|| pages.get(idx).map(|p| p.url.clone()))?;
            let outcome = match page.error {
                Some(reason) => Err(reason),
                None => Ok(page
                    .entities
                    .into_iter()
                    .filter_map(EntityReply::into_entity)
                    .collect()),
            };
            Some(PageExtraction {
                source_url,
                outcome,
            })
        })
        .collect();

    Ok(extractions)
}

// ---------------------------------------------------------------------------
// Synthesis
// ---------------------------------------------------------------------------

pub(crate) const SYNTHESIZE_SYSTEM: &str = "\
You group entities extracted from several pages into themes about a topic. \
Reply with a single JSON object of the form \
{\"themes\": [{\"name\": string, \"summary\": string, \
\"entities\": [{\"source_url\": string, \"name\": string}]}]}. \
Each theme lists the entities that support it, copying source_url and name exactly from the input. \
Summaries are two to four sentences of plain prose.";

pub(crate) fn synthesize_user(topic: &str, records: &[EntityRecord]) -> String {
    let records: Vec<Value> = records
        .iter()
        .map(|r| {
            json!({
                "source_url": r.source_url,
                "entities": r.entities.iter().map(|e| json!({
                    "name": e.name,
                    "kind": e.kind,
                    "attributes": e.attributes,
                })).collect::<Vec<_>>(),
            })
        })
        .collect();
    json!({ "topic": topic, "records": records }).to_string()
}

#[derive(Debug, Deserialize)]
struct SynthesizeReply {
    #[serde(default)]
    themes: Vec<ThemeReply>,
}

#[derive(Debug, Deserialize)]
struct ThemeReply {
    name: String,
    #[serde(default)]
    summary: String,
    #[serde(default)]
    entities: Vec<EntityRef>,
}

/// Parse a synthesis reply, dropping unnamed themes.
pub(crate) fn parse_synthesis(content: &str) -> Result<Vec<ThemeRecord>> {
    let reply: SynthesizeReply = serde_json::from_str(content)
        .map_err(|e| DigestError::llm_content(format!("synthesis reply is not valid JSON: {e}")))?;

    let mut seen = HashSet::new();
    Ok(reply
        .themes
        .into_iter()
        .filter(|t| !t.name.trim().is_empty())
        .filter(|t| seen.insert(t.name.trim().to_lowercase()))
        .map(|t| ThemeRecord {
            theme_name: t.name.trim().to_string(),
            supporting_entities: t.entities.into_iter().collect::<BTreeSet<_>>(),
            summary_text: t.summary.trim().to_string(),
        })
        .collect())
}
