//! Run-scoped progress counters.
//!
//! One [`QueueCounters`] per queue, updated with relaxed atomics from any
//! worker and read by the CLI spinner and the coordinator's final
//! accounting check.

use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};

use serde::{Deserialize, Serialize};

use topicdigest_shared::TokenUsage;

/// Counters for one queue.
#[derive(Debug, Default)]
pub struct QueueCounters {
    enqueued: AtomicU64,
    dequeued: AtomicU64,
    completed_ok: AtomicU64,
    completed_failed: AtomicU64,
    retries: AtomicU64,
    peak_len: AtomicU64,
}

impl QueueCounters {
    /// One item pushed; `len_after` is the queue length including it.
    pub fn record_enqueue(&self, len_after: usize) {
        self.enqueued.fetch_add(1, Ordering::Relaxed);
        self.peak_len.fetch_max(len_after as u64, Ordering::Relaxed);
    }

    pub fn record_dequeue(&self, n: usize) {
        self.dequeued.fetch_add(n as u64, Ordering::Relaxed);
    }

    pub fn record_ok(&self, n: usize) {
        self.completed_ok.fetch_add(n as u64, Ordering::Relaxed);
    }

    pub fn record_failed(&self, n: usize) {
        self.completed_failed.fetch_add(n as u64, Ordering::Relaxed);
    }

    pub fn record_retries(&self, n: u32) {
        self.retries.fetch_add(u64::from(n), Ordering::Relaxed);
    }

    pub fn snapshot(&self) -> QueueSnapshot {
        QueueSnapshot {
            enqueued: self.enqueued.load(Ordering::Relaxed),
            dequeued: self.dequeued.load(Ordering::Relaxed),
            completed_ok: self.completed_ok.load(Ordering::Relaxed),
            completed_failed: self.completed_failed.load(Ordering::Relaxed),
            retries: self.retries.load(Ordering::Relaxed),
            peak_len: self.peak_len.load(Ordering::Relaxed),
        }
    }
}

/// Point-in-time copy of [`QueueCounters`].
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct QueueSnapshot {
    pub enqueued: u64,
    pub dequeued: u64,
    pub completed_ok: u64,
    pub completed_failed: u64,
    /// Retried batch calls for items of this queue.
    pub retries: u64,
    pub peak_len: u64,
}

impl QueueSnapshot {
    pub fn completed(&self) -> u64 {
        self.completed_ok + self.completed_failed
    }

    /// Items pushed but not yet terminal (queued or inside a batch).
    pub fn in_flight(&self) -> u64 {
        self.enqueued.saturating_sub(self.completed())
    }

    /// `enqueued == completed_ok + completed_failed`.
    pub fn is_balanced(&self) -> bool {
        self.enqueued == self.completed()
    }
}

/// All counters for one run.
#[derive(Debug, Default)]
pub struct Progress {
    pub entity: Arc<QueueCounters>,
    pub theme: Arc<QueueCounters>,
    fetches_started: AtomicU64,
    fetch_retries: AtomicU64,
    llm_calls: AtomicU64,
    prompt_tokens: AtomicU64,
    completion_tokens: AtomicU64,
}

impl Progress {
    pub fn new() -> Self {
        Self::default()
    }

    pub(crate) fn record_fetch_started(&self) {
        self.fetches_started.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn record_fetch_retries(&self, n: u32) {
        self.fetch_retries.fetch_add(u64::from(n), Ordering::Relaxed);
    }

    pub(crate) fn record_llm_call(&self) {
        self.llm_calls.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn record_tokens(&self, usage: TokenUsage) {
        self.prompt_tokens
            .fetch_add(usage.prompt_tokens, Ordering::Relaxed);
        self.completion_tokens
            .fetch_add(usage.completion_tokens, Ordering::Relaxed);
    }

    pub fn snapshot(&self) -> ProgressSnapshot {
        ProgressSnapshot {
            entity: self.entity.snapshot(),
            theme: self.theme.snapshot(),
            fetches_started: self.fetches_started.load(Ordering::Relaxed),
            fetch_retries: self.fetch_retries.load(Ordering::Relaxed),
            llm_calls: self.llm_calls.load(Ordering::Relaxed),
            tokens: TokenUsage {
                prompt_tokens: self.prompt_tokens.load(Ordering::Relaxed),
                completion_tokens: self.completion_tokens.load(Ordering::Relaxed),
            },
        }
    }
}

/// Point-in-time copy of [`Progress`], safe to display or serialize.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProgressSnapshot {
    pub entity: QueueSnapshot,
    pub theme: QueueSnapshot,
    /// Fetch attempts that went out (retries included).
    pub fetches_started: u64,
    pub fetch_retries: u64,
    /// Model calls issued (retries included).
    pub llm_calls: u64,
    /// Tokens reported by successful model replies.
    pub tokens: TokenUsage,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn snapshot_tracks_balance() {
        let counters = QueueCounters::default();
        counters.record_enqueue(1);
        counters.record_enqueue(2);
        counters.record_enqueue(1);
        counters.record_dequeue(3);
        counters.record_ok(2);

        let snap = counters.snapshot();
        assert_eq!(snap.peak_len, 2);
        assert_eq!(snap.in_flight(), 1);
        assert!(!snap.is_balanced());

        counters.record_failed(1);
        assert!(counters.snapshot().is_balanced());
    }

    #[test]
    fn counters_are_safe_across_threads() {
        let progress = Arc::new(Progress::new());
        let handles: Vec<_> = (0..8)
            .map(|_| {
                let p = Arc::clone(&progress);
                std::thread::spawn(move || {
                    for _ in 0..1000 {
                        p.entity.record_enqueue(1);
                        p.entity.record_ok(1);
                        p.record_llm_call();
                        p.record_tokens(TokenUsage {
                            prompt_tokens: 3,
                            completion_tokens: 1,
                        });
                    }
                })
            })
            .collect();
        for h in handles {
            h.join().unwrap();
        }

        let snap = progress.snapshot();
        assert_eq!(snap.entity.enqueued, 8000);
        assert!(snap.entity.is_balanced());
        assert_eq!(snap.llm_calls, 8000);
        assert_eq!(snap.tokens.prompt_tokens, 24_000);
        assert_eq!(snap.tokens.total(), 32_000);
    }
}
