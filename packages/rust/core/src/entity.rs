//! Entity processor pool: fetch results → batched extraction → theme queue.

use std::collections::HashMap;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, instrument, warn};

use topicdigest_shared::{
    DigestError, EntityRecord, FetchResult, FetchStatus, LanguageModel, PageExtraction, PageInput,
    Result, Stage, StageConfig,
};

use crate::gate::Gate;
use crate::progress::Progress;
use crate::queue::WorkQueue;
use crate::retry::{RetryPolicy, unless_fatal};
use crate::store::ResultStore;

/// Consumer 1 / producer 2.
pub(crate) struct EntityPool {
    pub topic: String,
    pub model: Arc<dyn LanguageModel>,
    pub gate: Arc<Gate>,
    pub input: Arc<WorkQueue<FetchResult>>,
    pub output: Arc<WorkQueue<EntityRecord>>,
    pub store: Arc<ResultStore>,
    pub progress: Arc<Progress>,
    pub stage: StageConfig,
    pub retry: RetryPolicy,
    pub max_input_chars: usize,
}

impl EntityPool {
    /// Run `stage.workers` batch loops until the entity queue drains, then
    /// close the theme queue.
    #[instrument(skip_all, fields(workers = self.stage.workers, batch_size = self.stage.batch_size))]
    pub async fn run(self: Arc<Self>, cancel: CancellationToken) -> Result<()> {
        let workers_cancel = cancel.child_token();
        let mut set = JoinSet::new();
        for worker in 0..self.stage.workers.max(1) {
            let this = Arc::clone(&self);
            let cancel = workers_cancel.clone();
            set.spawn(async move { this.worker(worker, &cancel).await });
        }

        let mut first_error = None;
        while let Some(joined) = set.join_next().await {
            let outcome = joined.unwrap_or_else(|e| {
                Err(DigestError::invariant(format!("entity worker panicked: {e}")))
            });
            if let Err(err) = outcome {
                workers_cancel.cancel();
                first_error.get_or_insert(err);
            }
        }

        self.output.close();
        match first_error {
            Some(err) => Err(err),
            None => {
                info!("entity queue drained");
                Ok(())
            }
        }
    }

    async fn worker(&self, worker: usize, cancel: &CancellationToken) -> Result<()> {
        loop {
            let batch = self
                .input
                .pop_batch(self.stage.batch_size, self.stage.batch_timeout, cancel)
                .await?;
            if batch.is_empty() {
                debug!(worker, "entity worker finished");
                return Ok(());
            }
            debug!(worker, size = batch.len(), "entity batch");
            self.process_batch(batch, cancel).await?;
        }
    }

    /// Settle every item of one batch: failed fetches are recorded, the Ok
    /// pages go to the model in one call, and each page's record is
    /// forwarded or recorded as an extraction failure.
    pub async fn process_batch(
        &self,
        batch: Vec<FetchResult>,
        cancel: &CancellationToken,
    ) -> Result<()> {
        let counters = &self.progress.entity;
        let (ok, failed): (Vec<_>, Vec<_>) = batch.into_iter().partition(FetchResult::is_ok);

        for result in &failed {
            let reason = match &result.status {
                FetchStatus::Failed(reason) => reason.clone(),
                FetchStatus::Ok => String::new(),
            };
            self.store.record_failure(&result.url, Stage::Fetch, reason);
        }
        counters.record_failed(failed.len());

        if ok.is_empty() {
            return Ok(());
        }

        let inputs: Vec<PageInput> = ok
            .iter()
            .map(|r| PageInput {
                url: r.url.clone(),
                title: r.title.clone(),
                text: truncate_chars(&r.text, self.max_input_chars),
            })
            .collect();

        let outcome = self
            .retry
            .run("extract", cancel, unless_fatal, |_| self.extract_gated(&inputs, cancel))
            .await;
        counters.record_retries(outcome.retries);

        let extractions = match outcome.result {
            Ok(extractions) => extractions,
            Err(err) if matches!(err, DigestError::Cancelled) || err.is_fatal() => return Err(err),
            Err(err) => {
                warn!(pages = ok.len(), error = %err, "extraction batch failed");
                let reason = format!("extraction failed after {} attempts: {err}", outcome.retries + 1);
                for r in &ok {
                    self.store.record_failure(&r.url, Stage::Extraction, reason.clone());
                }
                counters.record_failed(ok.len());
                return Ok(());
            }
        };

        let (records, failures) = assemble_records(&ok, extractions, Utc::now());
        for (url, reason) in failures {
            warn!(%url, %reason, "page extraction failed");
            self.store.record_failure(url, Stage::Extraction, reason);
            counters.record_failed(1);
        }
        for record in records {
            self.output.push(record, cancel).await?;
            counters.record_ok(1);
        }
        Ok(())
    }

    async fn extract_gated(
        &self,
        pages: &[PageInput],
        cancel: &CancellationToken,
    ) -> Result<Vec<PageExtraction>> {
        let _permit = self.gate.acquire(cancel).await?;
        if cancel.is_cancelled() {
            return Err(DigestError::Cancelled);
        }
        self.progress.record_llm_call();
        let reply = tokio::select! {
            biased;
            _ = cancel.cancelled() => return Err(DigestError::Cancelled),
            extracted = self.model.extract(&self.topic, pages) => extracted?,
        };
        self.progress.record_tokens(reply.usage);
        Ok(reply.value)
    }
}

/// Reason recorded for a page the model's reply did not mention.
pub const MISSING_FROM_RESPONSE: &str = "missing from extraction response";

/// Pair each Ok page with its extraction outcome.
///
/// Returns one [`EntityRecord`] per page whose outcome is a success, in
/// input order, and `(url, reason)` for pages whose outcome is an error or
/// is missing from `extractions`. Pure apart from the supplied timestamp,
/// so the same inputs always give the same records.
pub fn assemble_records(
    pages: &[FetchResult],
    extractions: Vec<PageExtraction>,
    extracted_at: DateTime<Utc>,
) -> (Vec<EntityRecord>, Vec<(String, String)>) {
    let mut by_url: HashMap<String, std::result::Result<Vec<_>, String>> = HashMap::new();
    for extraction in extractions {
        by_url
            .entry(extraction.source_url)
            .or_insert(extraction.outcome);
    }

    let mut records = Vec::with_capacity(pages.len());
    let mut failures = Vec::new();
    for page in pages {
        match by_url.remove(&page.url) {
            Some(Ok(entities)) => records.push(EntityRecord {
                source_url: page.url.clone(),
                entities,
                extracted_at,
            }),
            Some(Err(reason)) => failures.push((page.url.clone(), reason)),
            None => failures.push((page.url.clone(), MISSING_FROM_RESPONSE.to_string())),
        }
    }
    (records, failures)
}

/// First `max` characters of `text`.
fn truncate_chars(text: &str, max: usize) -> String {
    match text.char_indices().nth(max) {
        Some((idx, _)) => text[..idx].to_string(),
        None => text.to_string(),
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Mutex;
    use std::time::Duration;

    use async_trait::async_trait;
    use topicdigest_shared::{Entity, FetchTask, GateKind, ModelReply, ThemeRecord, TokenUsage};

    use super::*;

    fn fetch_ok(url: &str, text: &str) -> FetchResult {
        let task = FetchTask {
            url: url.into(),
            depth: 0,
            topic: "t".into(),
            title: None,
            snippet: None,
        };
        FetchResult::ok(&task, "<html></html>".into(), None, text.into())
    }

    fn entity(name: &str) -> Entity {
        Entity {
            name: name.into(),
            kind: "Thing".into(),
            attributes: Default::default(),
        }
    }

    /// Echoes one entity per page, except pages whose text says "reject".
    struct Echo {
        seen: Mutex<Vec<Vec<PageInput>>>,
    }

    #[async_trait]
    impl LanguageModel for Echo {
        async fn extract(
            &self,
            _topic: &str,
            pages: &[PageInput],
        ) -> Result<ModelReply<Vec<PageExtraction>>> {
            self.seen.lock().unwrap().push(pages.to_vec());
            let extractions = pages
                .iter()
                .map(|p| PageExtraction {
                    source_url: p.url.clone(),
                    outcome: if p.text.contains("reject") {
                        Err("unreadable".into())
                    } else {
                        Ok(vec![entity(&p.text)])
                    },
                })
                .collect();
            let usage = TokenUsage {
                prompt_tokens: 100 * pages.len() as u64,
                completion_tokens: 20,
            };
            Ok(ModelReply::new(extractions, usage))
        }

        async fn synthesize(
            &self,
            _topic: &str,
            _records: &[EntityRecord],
        ) -> Result<ModelReply<Vec<ThemeRecord>>> {
            Ok(ModelReply::unmetered(Vec::new()))
        }
    }

    fn pool(model: Arc<dyn LanguageModel>, max_input_chars: usize) -> EntityPool {
        let progress = Arc::new(Progress::new());
        EntityPool {
            topic: "t".into(),
            model,
            gate: Arc::new(Gate::new(GateKind::Llm, 1, Duration::from_secs(5))),
            input: Arc::new(WorkQueue::new("entity", 8, Arc::clone(&progress.entity))),
            output: Arc::new(WorkQueue::new("theme", 8, Arc::clone(&progress.theme))),
            store: Arc::new(ResultStore::new()),
            progress,
            stage: StageConfig {
                batch_size: 4,
                batch_timeout: Duration::from_millis(10),
                workers: 1,
                max_attempts: 2,
            },
            retry: RetryPolicy::new(2, Duration::from_millis(1), Duration::from_millis(2)),
            max_input_chars,
        }
    }

    #[test]
    fn truncation_respects_char_boundaries() {
        assert_eq!(truncate_chars("héllo wörld", 7), "héllo w");
        assert_eq!(truncate_chars("short", 100), "short");
    }

    #[test]
    fn assemble_marks_missing_and_errored_pages() {
        let pages = vec![
            fetch_ok("https://a.example.com", "a"),
            fetch_ok("https://b.example.com", "b"),
            fetch_ok("https://c.example.com", "c"),
        ];
        let extractions = vec![
            PageExtraction {
                source_url: "https://c.example.com".into(),
                outcome: Ok(vec![entity("C")]),
            },
            PageExtraction {
                source_url: "https://a.example.com".into(),
                outcome: Err("garbled".into()),
            },
        ];

        let (records, failures) = assemble_records(&pages, extractions, Utc::now());
        assert_eq!(records.len(), 1);
        assert_eq!(records[0].source_url, "https://c.example.com");
        assert_eq!(
            failures,
            vec![
                ("https://a.example.com".to_string(), "garbled".to_string()),
                (
                    "https://b.example.com".to_string(),
                    "missing from extraction response".to_string()
                ),
            ]
        );
    }

    #[tokio::test]
    async fn partial_failure_only_affects_that_page() {
        let echo = Arc::new(Echo { seen: Mutex::new(Vec::new()) });
        let pool = pool(echo.clone(), 1000);
        let cancel = CancellationToken::new();

        let batch = vec![
            fetch_ok("https://a.example.com", "alpha"),
            fetch_ok("https://b.example.com", "please reject"),
        ];
        for item in &batch {
            pool.input.push(item.clone(), &cancel).await.unwrap();
        }
        let popped = pool.input.pop_batch(4, Duration::ZERO, &cancel).await.unwrap();
        pool.process_batch(popped, &cancel).await.unwrap();

        let snap = pool.progress.snapshot();
        assert_eq!(snap.entity.completed_ok, 1);
        assert_eq!(snap.entity.completed_failed, 1);
        assert_eq!(snap.theme.enqueued, 1);
        assert_eq!(snap.tokens.prompt_tokens, 200);
        assert_eq!(snap.tokens.completion_tokens, 20);

        let frozen = pool.store.freeze();
        assert_eq!(frozen.failures.len(), 1);
        assert_eq!(frozen.failures[0].stage, Stage::Extraction);
        assert_eq!(frozen.failures[0].reason, "unreadable");
    }

    #[tokio::test]
    async fn page_text_is_truncated_before_the_call() {
        let echo = Arc::new(Echo { seen: Mutex::new(Vec::new()) });
        let pool = pool(echo.clone(), 5);

        pool.process_batch(
            vec![fetch_ok("https://a.example.com", "abcdefghij")],
            &CancellationToken::new(),
        )
        .await
        .unwrap();

        let seen = echo.seen.lock().unwrap();
        assert_eq!(seen[0][0].text, "abcde");
    }

    #[tokio::test]
    async fn fatal_model_error_propagates() {
        struct Unauthorized;

        #[async_trait]
        impl LanguageModel for Unauthorized {
            async fn extract(
                &self,
                _topic: &str,
                _pages: &[PageInput],
            ) -> Result<ModelReply<Vec<PageExtraction>>> {
                Err(DigestError::config("model API returned 401"))
            }

            async fn synthesize(
                &self,
                _topic: &str,
                _records: &[EntityRecord],
            ) -> Result<ModelReply<Vec<ThemeRecord>>> {
                Ok(ModelReply::unmetered(Vec::new()))
            }
        }

        let pool = pool(Arc::new(Unauthorized), 100);
        let err = pool
            .process_batch(
                vec![fetch_ok("https://a.example.com", "a")],
                &CancellationToken::new(),
            )
            .await
            .unwrap_err();
        assert!(err.is_fatal());
    }

    #[tokio::test]
    async fn fatal_error_stops_sibling_workers() {
        /// First call is rejected; later calls hang until cancelled.
        struct RevokedMidRun {
            calls: std::sync::atomic::AtomicUsize,
        }

        #[async_trait]
        impl LanguageModel for RevokedMidRun {
            async fn extract(
                &self,
                _topic: &str,
                _pages: &[PageInput],
            ) -> Result<ModelReply<Vec<PageExtraction>>> {
                let n = self.calls.fetch_add(1, std::sync::atomic::Ordering::SeqCst);
                if n == 0 {
                    tokio::time::sleep(Duration::from_millis(20)).await;
                    return Err(DigestError::config("model API returned 401"));
                }
                std::future::pending().await
            }

            async fn synthesize(
                &self,
                _topic: &str,
                _records: &[EntityRecord],
            ) -> Result<ModelReply<Vec<ThemeRecord>>> {
                Ok(ModelReply::unmetered(Vec::new()))
            }
        }

        let model = Arc::new(RevokedMidRun {
            calls: Default::default(),
        });
        let mut pool = pool(model.clone(), 100);
        pool.gate = Arc::new(Gate::new(GateKind::Llm, 2, Duration::from_secs(5)));
        pool.stage.workers = 2;
        pool.stage.batch_size = 1;
        let pool = Arc::new(pool);

        let cancel = CancellationToken::new();
        for i in 0..4 {
            pool.input
                .push(fetch_ok(&format!("https://{i}.example.com"), "text"), &cancel)
                .await
                .unwrap();
        }
        pool.input.close();

        let outcome = tokio::time::timeout(Duration::from_secs(5), Arc::clone(&pool).run(cancel))
            .await
            .expect("entity pool hung after a fatal model error");

        assert!(matches!(outcome, Err(DigestError::Config { .. })));
        assert_eq!(model.calls.load(std::sync::atomic::Ordering::SeqCst), 2);
        assert!(pool.output.is_closed());
    }

    #[tokio::test]
    async fn zero_workers_still_drains() {
        let echo = Arc::new(Echo { seen: Mutex::new(Vec::new()) });
        let mut pool = pool(echo, 100);
        pool.stage.workers = 0;
        let pool = Arc::new(pool);

        let cancel = CancellationToken::new();
        pool.input
            .push(fetch_ok("https://a.example.com", "alpha"), &cancel)
            .await
            .unwrap();
        pool.input.close();

        tokio::time::timeout(Duration::from_secs(5), Arc::clone(&pool).run(cancel))
            .await
            .expect("no consumer was started")
            .unwrap();
        assert_eq!(pool.progress.snapshot().entity.completed_ok, 1);
    }
}
