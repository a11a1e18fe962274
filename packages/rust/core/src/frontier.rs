//! Shared crawl frontier: pending tasks, visited set, and in-flight count.
//!
//! Admission is check-and-mark under one lock, so a normalized URL is
//! fetched at most once per run no matter how many workers discover it.
//! Depth and total-page caps keep the crawl bounded.

use std::collections::{HashSet, VecDeque};
use std::sync::{Mutex, MutexGuard, PoisonError};

use tokio::sync::Notify;
use tokio_util::sync::CancellationToken;
use tracing::debug;

use topicdigest_crawler::normalize_str;
use topicdigest_shared::{DigestError, FetchTask, Result};

#[derive(Debug, Default)]
struct FrontierState {
    pending: VecDeque<FetchTask>,
    visited: HashSet<String>,
    in_flight: usize,
    admitted: usize,
}

/// Work list shared by all retriever workers.
#[derive(Debug)]
pub struct Frontier {
    max_depth: u32,
    max_pages: usize,
    state: Mutex<FrontierState>,
    changed: Notify,
}

impl Frontier {
    pub fn new(max_depth: u32, max_pages: usize) -> Self {
        Self {
            max_depth,
            max_pages,
            state: Mutex::new(FrontierState::default()),
            changed: Notify::new(),
        }
    }

    fn lock(&self) -> MutexGuard<'_, FrontierState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Admit tasks that are new, within depth, and under the page cap.
    ///
    /// Returns how many were admitted.
    pub fn extend(&self, tasks: impl IntoIterator<Item = FetchTask>) -> usize {
        let admitted = {
            let mut state = self.lock();
            tasks
                .into_iter()
                .map(|task| self.admit(&mut state, task))
                .filter(|admitted| *admitted)
                .count()
        };
        if admitted > 0 {
            self.changed.notify_waiters();
        }
        admitted
    }

    fn admit(&self, state: &mut FrontierState, mut task: FetchTask) -> bool {
        if task.depth > self.max_depth || state.admitted >= self.max_pages {
            return false;
        }
        let Some(key) = normalize_str(&task.url) else {
            debug!(url = %task.url, "unparseable URL dropped");
            return false;
        };
        if !state.visited.insert(key.clone()) {
            return false;
        }
        task.url = key;
        state.pending.push_back(task);
        state.admitted += 1;
        true
    }

    /// Take the next task, waiting while others are in flight.
    ///
    /// Returns `None` once nothing is pending and nothing is in flight:
    /// no worker can add more work, so the frontier is exhausted.
    pub async fn next(&self, cancel: &CancellationToken) -> Result<Option<FetchTask>> {
        loop {
            let notified = self.changed.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();

            {
                let mut state = self.lock();
                if let Some(task) = state.pending.pop_front() {
                    state.in_flight += 1;
                    return Ok(Some(task));
                }
                if state.in_flight == 0 {
                    return Ok(None);
                }
            }

            tokio::select! {
                biased;
                _ = cancel.cancelled() => return Err(DigestError::Cancelled),
                _ = &mut notified => {}
            }
        }
    }

    /// Mark one task taken by [`Frontier::next`] as finished and admit the
    /// links it produced. Returns how many links were admitted.
    pub fn complete(&self, links: impl IntoIterator<Item = FetchTask>) -> usize {
        let admitted = {
            let mut state = self.lock();
            state.in_flight = state.in_flight.saturating_sub(1);
            links
                .into_iter()
                .map(|task| self.admit(&mut state, task))
                .filter(|admitted| *admitted)
                .count()
        };
        self.changed.notify_waiters();
        admitted
    }

    /// Tasks admitted so far, seeds included.
    pub fn admitted(&self) -> usize {
        self.lock().admitted
    }
}
