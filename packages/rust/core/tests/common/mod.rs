//! Scripted collaborators for pipeline tests.

#![allow(dead_code)]

use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::sync::Mutex;
use std::sync::atomic::{AtomicU32, AtomicUsize, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use tokio_util::sync::CancellationToken;

use topicdigest_shared::{
    CrawlConfig, DigestError, Entity, EntityRecord, EntityRef, FetchedDocument, LanguageModel,
    ModelReply, PageExtraction, PageInput, PipelineConfig, Result, SearchHit, StageConfig,
    ThemeRecord, TokenUsage, WebSource,
};

/// Small, fast configuration: one worker per stage, short waits.
pub fn test_config() -> PipelineConfig {
    let stage = StageConfig {
        batch_size: 3,
        batch_timeout: Duration::from_millis(200),
        workers: 1,
        max_attempts: 3,
    };
    PipelineConfig {
        crawl: CrawlConfig {
            max_depth: 0,
            max_pages: 100,
            fetch_attempts: 3,
            politeness_delay: Duration::ZERO,
            max_links_per_page: 10,
            include_patterns: vec![],
            exclude_patterns: vec![],
            seed_urls: vec![],
            feed_urls: vec![],
            feed_keywords: vec![],
            window: Default::default(),
        },
        entity: stage.clone(),
        theme: stage,
        entity_queue_capacity: 8,
        theme_queue_capacity: 8,
        retriever_workers: 1,
        fetch_concurrency: 2,
        fetch_gate_timeout: Duration::from_secs(10),
        llm_concurrency: 1,
        llm_gate_timeout: Duration::from_secs(10),
        retry_base_delay: Duration::from_millis(1),
        retry_max_delay: Duration::from_millis(5),
        shutdown_grace: Duration::from_secs(1),
        max_input_chars: 10_000,
    }
}

/// A page body with enough prose to survive text cleanup.
pub fn article(title: &str, links: &[(&str, &str)]) -> String {
    let anchors: String = links
        .iter()
        .map(|(href, text)| format!(r#"<p><a href="{href}">{text}</a></p>"#))
        .collect();
    format!(
        "<html><head><title>{title}</title></head><body><article>\
         <p>{title} is discussed at length here, with several sentences of detail.</p>\
         <p>Observers reported new developments, and the story continues to unfold.</p>\
         {anchors}</article></body></html>"
    )
}

pub fn hit(url: &str) -> SearchHit {
    SearchHit::new(url)
}

/// Tokens the mock model reports per extracted page.
pub const EXTRACT_TOKENS_PER_PAGE: u64 = 100;
/// Tokens the mock model reports per synthesis call.
pub const SYNTH_TOKENS: TokenUsage = TokenUsage {
    prompt_tokens: 50,
    completion_tokens: 20,
};

// ---------------------------------------------------------------------------
// Web source
// ---------------------------------------------------------------------------

/// In-memory web: known URLs serve their body, unknown ones are 404.
#[derive(Default)]
pub struct MockWeb {
    pub hits: Vec<SearchHit>,
    pub pages: HashMap<String, String>,
    /// Feed URL → entries.
    pub feeds: HashMap<String, Vec<SearchHit>>,
    /// Transient failures left per URL before it starts succeeding.
    pub flaky: Mutex<HashMap<String, u32>>,
    /// Fail discovery on every call.
    pub discovery_down: bool,
    /// Every fetch is rejected with a configuration error.
    pub revoked: bool,
    pub delay: Duration,
    /// Token the test cancels; calls made after it fired are counted.
    pub watch: Option<CancellationToken>,

    pub fetch_calls: AtomicUsize,
    pub calls_after_cancel: AtomicUsize,
    pub in_flight: AtomicUsize,
    pub peak_in_flight: AtomicUsize,
    pub fetched: Mutex<Vec<String>>,
}

impl MockWeb {
    pub fn with_pages(pages: &[(String, String)]) -> Self {
        Self {
            hits: pages.iter().map(|(url, _)| hit(url)).collect(),
            pages: pages.iter().cloned().collect(),
            ..Self::default()
        }
    }

    pub fn peak(&self) -> usize {
        self.peak_in_flight.load(Ordering::SeqCst)
    }

    pub fn fetched_urls(&self) -> Vec<String> {
        self.fetched.lock().unwrap().clone()
    }
}

#[async_trait]
impl WebSource for MockWeb {
    async fn discover(&self, _topic: &str) -> Result<Vec<SearchHit>> {
        if self.discovery_down {
            return Err(DigestError::Search {
                message: "search endpoint unavailable".into(),
                transient: true,
            });
        }
        Ok(self.hits.clone())
    }

    async fn fetch(&self, url: &str) -> Result<FetchedDocument> {
        if self.watch.as_ref().is_some_and(CancellationToken::is_cancelled) {
            self.calls_after_cancel.fetch_add(1, Ordering::SeqCst);
        }
        self.fetch_calls.fetch_add(1, Ordering::SeqCst);
        let now = self.in_flight.fetch_add(1, Ordering::SeqCst) + 1;
        self.peak_in_flight.fetch_max(now, Ordering::SeqCst);

        if !self.delay.is_zero() {
            tokio::time::sleep(self.delay).await;
        }
        self.in_flight.fetch_sub(1, Ordering::SeqCst);
        self.fetched.lock().unwrap().push(url.to_string());

        if self.revoked {
            return Err(DigestError::config("fetch credentials revoked"));
        }

        if let Some(left) = self.flaky.lock().unwrap().get_mut(url) {
            if *left > 0 {
                *left -= 1;
                return Err(DigestError::fetch_transient(url, "connection reset"));
            }
        }

        match self.pages.get(url) {
            Some(body) => Ok(FetchedDocument {
                url: url.to_string(),
                status_code: 200,
                body: body.clone(),
            }),
            None => Err(DigestError::fetch_permanent(url, "HTTP 404")),
        }
    }

    async fn feed(&self, url: &str) -> Result<Vec<SearchHit>> {
        self.feeds
            .get(url)
            .cloned()
            .ok_or_else(|| DigestError::fetch_permanent(url, "HTTP 404"))
    }
}

// ---------------------------------------------------------------------------
// Language model
// ---------------------------------------------------------------------------

/// How a model call should go wrong.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Fault {
    Transient,
    Fatal,
}

/// Deterministic model: one entity per page named after its URL, one theme
/// per synthesis batch covering every entity in it.
#[derive(Default)]
pub struct MockModel {
    /// Failures left before `extract` starts succeeding.
    pub extract_failures: AtomicU32,
    /// Failures left before `synthesize` starts succeeding.
    pub synth_failures: AtomicU32,
    pub fault: Option<Fault>,
    /// Pages whose extraction entry comes back malformed.
    pub malformed: BTreeSet<String>,
    /// Cancel this token when the Nth model call (1-based) starts.
    pub cancel_on_call: Option<(usize, CancellationToken)>,
    pub delay: Duration,

    pub calls: AtomicUsize,
    pub calls_after_cancel: AtomicUsize,
    pub extract_batches: Mutex<Vec<Vec<String>>>,
    pub synth_batches: Mutex<Vec<usize>>,
}

impl MockModel {
    pub fn extract_batches(&self) -> Vec<Vec<String>> {
        self.extract_batches.lock().unwrap().clone()
    }

    pub fn synth_calls(&self) -> usize {
        self.synth_batches.lock().unwrap().len()
    }

    fn begin_call(&self) {
        if let Some((_, token)) = &self.cancel_on_call {
            if token.is_cancelled() {
                self.calls_after_cancel.fetch_add(1, Ordering::SeqCst);
            }
        }
        let n = self.calls.fetch_add(1, Ordering::SeqCst) + 1;
        if let Some((at, token)) = &self.cancel_on_call {
            if n == *at {
                token.cancel();
            }
        }
    }

    fn maybe_fail(&self, budget: &AtomicU32) -> Result<()> {
        let left = budget.load(Ordering::SeqCst);
        if left == 0 {
            return Ok(());
        }
        budget.store(left - 1, Ordering::SeqCst);
        match self.fault.unwrap_or(Fault::Transient) {
            Fault::Transient => Err(DigestError::llm_transient("HTTP 429")),
            Fault::Fatal => Err(DigestError::config("model rejected credentials")),
        }
    }

    fn extract_one(&self, page: &PageInput) -> PageExtraction {
        let outcome = if self.malformed.contains(&page.url) {
            Err("malformed entity entry".to_string())
        } else {
            Ok(vec![Entity {
                name: entity_name(&page.url),
                kind: "Topic".into(),
                attributes: BTreeMap::from([(
                    "title".to_string(),
                    page.title.clone().unwrap_or_default(),
                )]),
            }])
        };
        PageExtraction {
            source_url: page.url.clone(),
            outcome,
        }
    }
}

pub fn entity_name(url: &str) -> String {
    format!("entity:{url}")
}

#[async_trait]
impl LanguageModel for MockModel {
    async fn extract(
        &self,
        _topic: &str,
        pages: &[PageInput],
    ) -> Result<ModelReply<Vec<PageExtraction>>> {
        self.begin_call();
        if !self.delay.is_zero() {
            tokio::time::sleep(self.delay).await;
        }
        self.extract_batches
            .lock()
            .unwrap()
            .push(pages.iter().map(|p| p.url.clone()).collect());
        self.maybe_fail(&self.extract_failures)?;

        let usage = TokenUsage {
            prompt_tokens: EXTRACT_TOKENS_PER_PAGE * pages.len() as u64,
            completion_tokens: 10,
        };
        let extractions = pages.iter().map(|page| self.extract_one(page)).collect();
        Ok(ModelReply::new(extractions, usage))
    }

    async fn synthesize(
        &self,
        topic: &str,
        records: &[EntityRecord],
    ) -> Result<ModelReply<Vec<ThemeRecord>>> {
        self.begin_call();
        if !self.delay.is_zero() {
            tokio::time::sleep(self.delay).await;
        }
        self.synth_batches.lock().unwrap().push(records.len());
        self.maybe_fail(&self.synth_failures)?;

        let supporting: BTreeSet<EntityRef> = records
            .iter()
            .flat_map(|r| {
                r.entities.iter().map(|e| EntityRef {
                    source_url: r.source_url.clone(),
                    name: e.name.clone(),
                })
            })
            .collect();
        let themes = vec![ThemeRecord {
            theme_name: format!("{topic} overview"),
            summary_text: format!("{} entities", supporting.len()),
            supporting_entities: supporting,
        }];
        Ok(ModelReply::new(themes, SYNTH_TOKENS))
    }
}
