//! Pipeline coordinator: one topic run from `Idle` to `Done` or `Failed`.
//!
//! Starts the retriever, the entity pool and the theme pool as tasks,
//! publishes [`RunState`] on a watch channel, cancels everything on the
//! first fatal error, and checks the accounting invariants before
//! declaring the run done.

use std::sync::Arc;
use std::time::Instant;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio::sync::watch;
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, instrument, warn};

use topicdigest_crawler::LinkPolicy;
use topicdigest_shared::{
    DigestError, GateKind, LanguageModel, PipelineConfig, Result, RunId, Stage, TokenUsage,
    WebSource,
};

use crate::entity::EntityPool;
use crate::frontier::Frontier;
use crate::gate::Gate;
use crate::output::Digest;
use crate::progress::{Progress, QueueSnapshot};
use crate::queue::WorkQueue;
use crate::retriever::Retriever;
use crate::retry::RetryPolicy;
use crate::store::{ResultStore, StoreSnapshot};
use crate::theme::ThemePool;

// ---------------------------------------------------------------------------
// Run state and report
// ---------------------------------------------------------------------------

/// Coordinator lifecycle.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RunState {
    Idle,
    Running,
    Draining,
    Done,
    Failed,
}

impl RunState {
    pub fn is_terminal(self) -> bool {
        matches!(self, Self::Done | Self::Failed)
    }
}

impl std::fmt::Display for RunState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            Self::Idle => "idle",
            Self::Running => "running",
            Self::Draining => "draining",
            Self::Done => "done",
            Self::Failed => "failed",
        };
        f.write_str(s)
    }
}

/// Summary of a finished run.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RunReport {
    pub run_id: RunId,
    pub topic: String,
    pub state: RunState,
    pub started_at: DateTime<Utc>,
    pub finished_at: DateTime<Utc>,
    pub elapsed_ms: u64,
    /// Fetch results produced (Ok and Failed).
    pub fetched: u64,
    /// Items the entity stage settled as failed, fetch-origin included.
    pub extraction_failed: usize,
    /// The fetch-origin share of `extraction_failed`.
    pub fetch_failed: usize,
    pub theme_failed: usize,
    pub entity_records: usize,
    pub entities: usize,
    pub themes: usize,
    pub fetch_retries: u64,
    pub llm_calls: u64,
    pub tokens: TokenUsage,
    pub peak_fetch_in_flight: usize,
    pub peak_llm_in_flight: usize,
    pub entity_queue: QueueSnapshot,
    pub theme_queue: QueueSnapshot,
}

/// What a successful run hands back.
#[derive(Debug, Clone)]
pub struct RunOutcome {
    pub report: RunReport,
    pub digest: Digest,
}

/// Which top-level task finished.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum StageTask {
    Retriever,
    Entity,
    Theme,
}

// ---------------------------------------------------------------------------
// Pipeline
// ---------------------------------------------------------------------------

/// One-shot coordinator for a single topic run.
pub struct Pipeline {
    config: PipelineConfig,
    source: Arc<dyn WebSource>,
    model: Arc<dyn LanguageModel>,
    progress: Arc<Progress>,
    state: watch::Sender<RunState>,
}

impl Pipeline {
    pub fn new(
        config: PipelineConfig,
        source: Arc<dyn WebSource>,
        model: Arc<dyn LanguageModel>,
    ) -> Self {
        let (state, _) = watch::channel(RunState::Idle);
        Self {
            config,
            source,
            model,
            progress: Arc::new(Progress::new()),
            state,
        }
    }

    /// Live counters for display; valid during and after the run.
    pub fn progress(&self) -> Arc<Progress> {
        Arc::clone(&self.progress)
    }

    /// Observe state transitions.
    pub fn subscribe(&self) -> watch::Receiver<RunState> {
        self.state.subscribe()
    }

    pub fn state(&self) -> RunState {
        *self.state.borrow()
    }

    fn transition(&self, next: RunState) {
        let prev = self.state.send_replace(next);
        info!(from = %prev, to = %next, "run state");
    }

    /// Run the pipeline for `topic` until it drains or fails.
    ///
    /// Cancelling `cancel` stops the run; it then ends `Failed` with
    /// [`DigestError::Cancelled`] unless a worker hit a fatal error first.
    /// A `Pipeline` runs once; later calls are rejected.
    #[instrument(skip_all, fields(topic = %topic))]
    pub async fn run(&self, topic: &str, cancel: CancellationToken) -> Result<RunOutcome> {
        if self.state() != RunState::Idle {
            return Err(DigestError::invariant("pipeline has already run"));
        }

        let run_id = RunId::new();
        let started_at = Utc::now();
        let clock = Instant::now();
        let token = cancel.child_token();
        let config = &self.config;

        let fetch_gate = Arc::new(Gate::new(
            GateKind::Fetch,
            config.fetch_concurrency,
            config.fetch_gate_timeout,
        ));
        let llm_gate = Arc::new(Gate::new(
            GateKind::Llm,
            config.llm_concurrency,
            config.llm_gate_timeout,
        ));
        let entity_queue = Arc::new(WorkQueue::new(
            "entity",
            config.entity_queue_capacity,
            Arc::clone(&self.progress.entity),
        ));
        let theme_queue = Arc::new(WorkQueue::new(
            "theme",
            config.theme_queue_capacity,
            Arc::clone(&self.progress.theme),
        ));
        let store = Arc::new(ResultStore::new());

        let retriever = Arc::new(Retriever {
            topic: topic.to_string(),
            source: Arc::clone(&self.source),
            gate: Arc::clone(&fetch_gate),
            frontier: Arc::new(Frontier::new(config.crawl.max_depth, config.crawl.max_pages)),
            output: Arc::clone(&entity_queue),
            policy: LinkPolicy::new(topic, &config.crawl),
            retry: RetryPolicy::new(
                config.crawl.fetch_attempts,
                config.retry_base_delay,
                config.retry_max_delay,
            ),
            crawl: config.crawl.clone(),
            progress: Arc::clone(&self.progress),
        });
        let entity_pool = Arc::new(EntityPool {
            topic: topic.to_string(),
            model: Arc::clone(&self.model),
            gate: Arc::clone(&llm_gate),
            input: Arc::clone(&entity_queue),
            output: Arc::clone(&theme_queue),
            store: Arc::clone(&store),
            progress: Arc::clone(&self.progress),
            stage: config.entity.clone(),
            retry: RetryPolicy::new(
                config.entity.max_attempts,
                config.retry_base_delay,
                config.retry_max_delay,
            ),
            max_input_chars: config.max_input_chars,
        });
        let theme_pool = Arc::new(ThemePool {
            topic: topic.to_string(),
            model: Arc::clone(&self.model),
            gate: Arc::clone(&llm_gate),
            input: Arc::clone(&theme_queue),
            store: Arc::clone(&store),
            progress: Arc::clone(&self.progress),
            stage: config.theme.clone(),
            retry: RetryPolicy::new(
                config.theme.max_attempts,
                config.retry_base_delay,
                config.retry_max_delay,
            ),
        });

        info!(%run_id, "starting run");
        self.transition(RunState::Running);

        let mut set = JoinSet::new();
        {
            let token = token.clone();
            let workers = config.retriever_workers;
            set.spawn(async move { (StageTask::Retriever, retriever.run(workers, token).await) });
        }
        {
            let token = token.clone();
            set.spawn(async move { (StageTask::Entity, entity_pool.run(token).await) });
        }
        {
            let token = token.clone();
            set.spawn(async move { (StageTask::Theme, theme_pool.run(token).await) });
        }

        let mut first_error: Option<DigestError> = None;
        let mut interrupted = false;
        loop {
            tokio::select! {
                biased;
                _ = token.cancelled() => {
                    interrupted = true;
                    break;
                }
                joined = set.join_next() => match joined {
                    None => break,
                    Some(joined) => self.settle(joined, &mut first_error, &token),
                },
            }
        }

        if interrupted {
            self.shut_down(&mut set, &mut first_error, &token).await;
        }

        let failure = first_error.or_else(|| interrupted.then_some(DigestError::Cancelled));
        if let Some(err) = failure {
            self.transition(RunState::Failed);
            error!(%run_id, error = %err, "run failed");
            return Err(err);
        }

        let snapshot = self.progress.snapshot();
        let drained = check_drained(
            &snapshot.entity,
            &snapshot.theme,
            &*entity_queue,
            &*theme_queue,
        );
        if let Err(err) = drained {
            self.transition(RunState::Failed);
            error!(%run_id, error = %err, "run failed accounting check");
            return Err(err);
        }

        self.transition(RunState::Done);
        let frozen = store.freeze();
        let finished_at = Utc::now();
        let report = RunReport::new(
            run_id.clone(),
            topic,
            RunState::Done,
            started_at,
            finished_at,
            clock.elapsed().as_millis() as u64,
            &frozen,
            &self.progress,
            (fetch_gate.peak(), llm_gate.peak()),
        );
        info!(
            %run_id,
            fetched = report.fetched,
            fetch_failed = report.fetch_failed,
            extraction_failed = report.extraction_failed,
            theme_failed = report.theme_failed,
            themes = report.themes,
            tokens = report.tokens.total(),
            elapsed_ms = report.elapsed_ms,
            "run complete"
        );

        let digest = Digest {
            run_id,
            topic: topic.to_string(),
            generated_at: finished_at,
            entities: frozen.entities,
            themes: frozen.themes,
            failures: frozen.failures,
            report: report.clone(),
        };
        Ok(RunOutcome { report, digest })
    }

    /// Handle one finished stage task.
    fn settle(
        &self,
        joined: std::result::Result<(StageTask, Result<()>), tokio::task::JoinError>,
        first_error: &mut Option<DigestError>,
        token: &CancellationToken,
    ) {
        match joined {
            Ok((StageTask::Retriever, Ok(()))) => {
                if first_error.is_none() && self.state() == RunState::Running {
                    self.transition(RunState::Draining);
                }
            }
            Ok((_, Ok(()))) => {}
            Ok((stage, Err(err))) => {
                if !matches!(err, DigestError::Cancelled) {
                    warn!(?stage, error = %err, "stage failed; cancelling run");
                    first_error.get_or_insert(err);
                }
                token.cancel();
            }
            Err(join_err) => {
                first_error.get_or_insert(DigestError::invariant(format!(
                    "pipeline task panicked: {join_err}"
                )));
                token.cancel();
            }
        }
    }

    /// Give stages `shutdown_grace` to unwind after cancellation, then abort.
    async fn shut_down(
        &self,
        set: &mut JoinSet<(StageTask, Result<()>)>,
        first_error: &mut Option<DigestError>,
        token: &CancellationToken,
    ) {
        let grace = self.config.shutdown_grace;
        let unwound = tokio::time::timeout(grace, async {
            while let Some(joined) = set.join_next().await {
                self.settle(joined, first_error, token);
            }
        })
        .await;

        if unwound.is_err() {
            warn!(grace_ms = grace.as_millis() as u64, "stages did not unwind in time; aborting");
            set.abort_all();
            while set.join_next().await.is_some() {}
        }
    }
}

/// Accounting check run before declaring `Done`.
fn check_drained<A, B>(
    entity: &QueueSnapshot,
    theme: &QueueSnapshot,
    entity_queue: &WorkQueue<A>,
    theme_queue: &WorkQueue<B>,
) -> Result<()> {
    for (name, snap) in [("entity", entity), ("theme", theme)] {
        if !snap.is_balanced() {
            return Err(DigestError::invariant(format!(
                "{name} queue accounting mismatch: enqueued {} != ok {} + failed {}",
                snap.enqueued, snap.completed_ok, snap.completed_failed
            )));
        }
    }
    if !entity_queue.is_empty() || !theme_queue.is_empty() {
        return Err(DigestError::invariant("queues not empty at drain"));
    }
    if !entity_queue.is_closed() || !theme_queue.is_closed() {
        return Err(DigestError::invariant("queues not closed at drain"));
    }
    Ok(())
}

impl RunReport {
    #[allow(clippy::too_many_arguments)]
    fn new(
        run_id: RunId,
        topic: &str,
        state: RunState,
        started_at: DateTime<Utc>,
        finished_at: DateTime<Utc>,
        elapsed_ms: u64,
        store: &StoreSnapshot,
        progress: &Progress,
        (peak_fetch_in_flight, peak_llm_in_flight): (usize, usize),
    ) -> Self {
        let snap = progress.snapshot();
        let fetch_failed = store.failed_at(Stage::Fetch);
        Self {
            run_id,
            topic: topic.to_string(),
            state,
            started_at,
            finished_at,
            elapsed_ms,
            fetched: snap.entity.enqueued,
            extraction_failed: fetch_failed + store.failed_at(Stage::Extraction),
            fetch_failed,
            theme_failed: store.failed_at(Stage::Theme),
            entity_records: store.entities.len(),
            entities: store.entities.iter().map(|r| r.entities.len()).sum(),
            themes: store.themes.len(),
            fetch_retries: snap.fetch_retries,
            llm_calls: snap.llm_calls,
            tokens: snap.tokens,
            peak_fetch_in_flight,
            peak_llm_in_flight,
            entity_queue: snap.entity,
            theme_queue: snap.theme,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn terminal_states() {
        assert!(RunState::Done.is_terminal());
        assert!(RunState::Failed.is_terminal());
        assert!(!RunState::Draining.is_terminal());
        assert_eq!(RunState::Draining.to_string(), "draining");
    }

    #[test]
    fn drain_check_catches_unbalanced_counts() {
        let counters = Arc::new(crate::progress::QueueCounters::default());
        let q: WorkQueue<u8> = WorkQueue::new("entity", 2, Arc::clone(&counters));
        q.close();

        let balanced = QueueSnapshot {
            enqueued: 3,
            completed_ok: 2,
            completed_failed: 1,
            ..QueueSnapshot::default()
        };
        assert!(check_drained(&balanced, &balanced, &q, &q).is_ok());

        let short = QueueSnapshot {
            enqueued: 3,
            completed_ok: 2,
            ..QueueSnapshot::default()
        };
        let err = check_drained(&short, &balanced, &q, &q).unwrap_err();
        assert!(matches!(err, DigestError::Invariant { .. }));
    }
}
