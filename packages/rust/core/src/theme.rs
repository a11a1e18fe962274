//! Theme processor pool: entity records → batched synthesis → result store.

use std::sync::Arc;

use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, instrument, warn};

use topicdigest_shared::{
    DigestError, EntityRecord, LanguageModel, Result, Stage, StageConfig, ThemeRecord,
};

use crate::gate::Gate;
use crate::progress::Progress;
use crate::queue::WorkQueue;
use crate::retry::{RetryPolicy, unless_fatal};
use crate::store::ResultStore;

/// Consumer 2.
pub(crate) struct ThemePool {
    pub topic: String,
    pub model: Arc<dyn LanguageModel>,
    pub gate: Arc<Gate>,
    pub input: Arc<WorkQueue<EntityRecord>>,
    pub store: Arc<ResultStore>,
    pub progress: Arc<Progress>,
    pub stage: StageConfig,
    pub retry: RetryPolicy,
}

impl ThemePool {
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
                Err(DigestError::invariant(format!("theme worker panicked: {e}")))
            });
            if let Err(err) = outcome {
                workers_cancel.cancel();
                first_error.get_or_insert(err);
            }
        }

        match first_error {
            Some(err) => Err(err),
            None => {
                info!("theme queue drained");
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
                debug!(worker, "theme worker finished");
                return Ok(());
            }
            debug!(worker, size = batch.len(), "theme batch");
            self.process_batch(batch, cancel).await?;
        }
    }

    /// Synthesize one batch and merge it into the store.
    ///
    /// The batch's entity records are stored either way; when synthesis
    /// keeps failing its items are recorded theme-failed.
    pub async fn process_batch(
        &self,
        batch: Vec<EntityRecord>,
        cancel: &CancellationToken,
    ) -> Result<()> {
        let counters = &self.progress.theme;
        let outcome = self
            .retry
            .run("synthesize", cancel, unless_fatal, |_| {
                self.synthesize_gated(&batch, cancel)
            })
            .await;
        counters.record_retries(outcome.retries);

        match outcome.result {
            Ok(themes) => {
                let n = batch.len();
                debug!(records = n, themes = themes.len(), "batch synthesized");
                self.store.merge(batch, themes);
                counters.record_ok(n);
                Ok(())
            }
            Err(err) if matches!(err, DigestError::Cancelled) || err.is_fatal() => Err(err),
            Err(err) => {
                warn!(records = batch.len(), error = %err, "synthesis batch failed");
                let reason = format!(
                    "synthesis failed after {} attempts: {err}",
                    outcome.retries + 1
                );
                for record in &batch {
                    self.store
                        .record_failure(&record.source_url, Stage::Theme, reason.clone());
                }
                let n = batch.len();
                self.store.add_entities(batch);
                counters.record_failed(n);
                Ok(())
            }
        }
    }

    async fn synthesize_gated(
        &self,
        records: &[EntityRecord],
        cancel: &CancellationToken,
    ) -> Result<Vec<ThemeRecord>> {
        let _permit = self.gate.acquire(cancel).await?;
        if cancel.is_cancelled() {
            return Err(DigestError::Cancelled);
        }
        self.progress.record_llm_call();
        let reply = tokio::select! {
            biased;
            _ = cancel.cancelled() => return Err(DigestError::Cancelled),
            themes = self.model.synthesize(&self.topic, records) => themes?,
        };
        self.progress.record_tokens(reply.usage);
        Ok(reply.value)
    }
}

#[cfg(test)]
mod tests {
    use std::collections::BTreeSet;
    use std::sync::atomic::{AtomicU32, Ordering};
    use std::time::Duration;

    use async_trait::async_trait;
    use chrono::Utc;
    use topicdigest_shared::{
        Entity, EntityRef, GateKind, ModelReply, PageExtraction, PageInput, TokenUsage,
    };

    use super::*;

    /// Fails `fail_first` synthesis calls, then returns one theme per call.
    struct Flaky {
        fail_first: u32,
        calls: AtomicU32,
    }

    #[async_trait]
    impl LanguageModel for Flaky {
        async fn extract(
            &self,
            _topic: &str,
            _pages: &[PageInput],
        ) -> Result<ModelReply<Vec<PageExtraction>>> {
            Ok(ModelReply::unmetered(Vec::new()))
        }

        async fn synthesize(
            &self,
            _topic: &str,
            records: &[EntityRecord],
        ) -> Result<ModelReply<Vec<ThemeRecord>>> {
            if self.calls.fetch_add(1, Ordering::SeqCst) < self.fail_first {
                return Err(DigestError::llm_transient("rate limited"));
            }
            let usage = TokenUsage {
                prompt_tokens: 40,
                completion_tokens: 15,
            };
            let themes = vec![ThemeRecord {
                theme_name: "Launches".into(),
                supporting_entities: records
                    .iter()
                    .flat_map(|r| {
                        r.entities.iter().map(|e| EntityRef {
                            source_url: r.source_url.clone(),
                            name: e.name.clone(),
                        })
                    })
                    .collect::<BTreeSet<_>>(),
                summary_text: "Rockets went up.".into(),
            }];
            Ok(ModelReply::new(themes, usage))
        }
    }

    fn record(url: &str) -> EntityRecord {
        EntityRecord {
            source_url: url.into(),
            entities: vec![Entity {
                name: "Falcon".into(),
                kind: "Product".into(),
                attributes: Default::default(),
            }],
            extracted_at: Utc::now(),
        }
    }

    fn pool(fail_first: u32, max_attempts: u32) -> ThemePool {
        let progress = Arc::new(Progress::new());
        ThemePool {
            topic: "launches".into(),
            model: Arc::new(Flaky {
                fail_first,
                calls: AtomicU32::new(0),
            }),
            gate: Arc::new(Gate::new(GateKind::Llm, 1, Duration::from_secs(5))),
            input: Arc::new(WorkQueue::new("theme", 8, Arc::clone(&progress.theme))),
            store: Arc::new(ResultStore::new()),
            progress,
            stage: StageConfig {
                batch_size: 8,
                batch_timeout: Duration::from_millis(10),
                workers: 1,
                max_attempts,
            },
            retry: RetryPolicy::new(max_attempts, Duration::from_millis(1), Duration::from_millis(2)),
        }
    }

    #[tokio::test]
    async fn retries_then_merges() {
        let pool = pool(2, 3);
        pool.process_batch(
            vec![record("https://a.example.com"), record("https://b.example.com")],
            &CancellationToken::new(),
        )
        .await
        .unwrap();

        let snap = pool.progress.snapshot();
        assert_eq!(snap.theme.retries, 2);
        assert_eq!(snap.theme.completed_ok, 2);
        // Only the successful call reports usage.
        assert_eq!(snap.tokens.total(), 55);

        let frozen = pool.store.freeze();
        assert_eq!(frozen.themes.len(), 1);
        assert_eq!(frozen.themes[0].supporting_entities.len(), 2);
        assert_eq!(frozen.entities.len(), 2);
    }

    #[tokio::test]
    async fn exhausted_retries_record_theme_failures() {
        let pool = pool(10, 3);
        pool.process_batch(vec![record("https://a.example.com")], &CancellationToken::new())
            .await
            .unwrap();

        let snap = pool.progress.snapshot();
        assert_eq!(snap.theme.completed_failed, 1);
        assert_eq!(snap.llm_calls, 3);

        let frozen = pool.store.freeze();
        assert!(frozen.themes.is_empty());
        assert_eq!(frozen.entities.len(), 1);
        assert_eq!(frozen.failed_at(Stage::Theme), 1);
    }

    #[tokio::test]
    async fn run_drains_queue_in_batches() {
        let pool = Arc::new(pool(0, 1));
        let cancel = CancellationToken::new();
        for i in 0..5 {
            pool.input
                .push(record(&format!("https://{i}.example.com")), &cancel)
                .await
                .unwrap();
        }
        pool.input.close();

        Arc::clone(&pool).run(cancel).await.unwrap();
        let snap = pool.progress.snapshot();
        assert!(snap.theme.is_balanced());
        assert_eq!(snap.theme.completed_ok, 5);
        assert_eq!(snap.llm_calls, 1);
    }

    #[tokio::test]
    async fn zero_workers_still_drains() {
        let mut pool = pool(0, 1);
        pool.stage.workers = 0;
        let pool = Arc::new(pool);
        let cancel = CancellationToken::new();
        pool.input
            .push(record("https://a.example.com"), &cancel)
            .await
            .unwrap();
        pool.input.close();

        tokio::time::timeout(Duration::from_secs(5), Arc::clone(&pool).run(cancel))
            .await
            .expect("no consumer was started")
            .unwrap();
        assert_eq!(pool.progress.snapshot().theme.completed_ok, 1);
    }
}
