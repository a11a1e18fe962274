//! Bounded, closable FIFO work queue with batch pops.
//!
//! Producers suspend in [`WorkQueue::push`] while the queue is full;
//! consumers suspend in [`WorkQueue::pop_batch`] while it is empty and still
//! open. A batch pop returns as soon as it holds `max` items, when the
//! queue is closed, or `wait` after its first item arrived, whichever comes
//! first. An empty batch means the queue is closed and drained.
//!
//! Every wait also observes the run's cancellation token.

use std::collections::VecDeque;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use tokio::sync::Notify;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;

use topicdigest_shared::{DigestError, Result};

use crate::progress::QueueCounters;

#[derive(Debug)]
struct QueueState<T> {
    items: VecDeque<T>,
    closed: bool,
}

/// Bounded multi-producer, multi-consumer queue.
#[derive(Debug)]
pub struct WorkQueue<T> {
    name: &'static str,
    capacity: usize,
    state: Mutex<QueueState<T>>,
    not_empty: Notify,
    not_full: Notify,
    counters: Arc<QueueCounters>,
}

impl<T> WorkQueue<T> {
    pub fn new(name: &'static str, capacity: usize, counters: Arc<QueueCounters>) -> Self {
        let capacity = capacity.max(1);
        Self {
            name,
            capacity,
            state: Mutex::new(QueueState {
                items: VecDeque::with_capacity(capacity),
                closed: false,
            }),
            not_empty: Notify::new(),
            not_full: Notify::new(),
            counters,
        }
    }

    fn lock(&self) -> MutexGuard<'_, QueueState<T>> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn name(&self) -> &'static str {
        self.name
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    pub fn len(&self) -> usize {
        self.lock().items.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn is_closed(&self) -> bool {
        self.lock().closed
    }

    /// Push one item, suspending while the queue is full.
    ///
    /// Fails with [`DigestError::QueueClosed`] once the producer side is
    /// closed and with [`DigestError::Cancelled`] if `cancel` fires first.
    pub async fn push(&self, item: T, cancel: &CancellationToken) -> Result<()> {
        loop {
            let notified = self.not_full.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();

            {
                let mut state = self.lock();
                if state.closed {
                    return Err(DigestError::QueueClosed {
                        queue: self.name.to_string(),
                    });
                }
                if state.items.len() < self.capacity {
                    state.items.push_back(item);
                    self.counters.record_enqueue(state.items.len());
                    drop(state);
                    self.not_empty.notify_one();
                    return Ok(());
                }
            }

            tokio::select! {
                biased;
                _ = cancel.cancelled() => return Err(DigestError::Cancelled),
                _ = &mut notified => {}
            }
        }
    }

    /// Pop up to `max` items.
    ///
    /// Blocks until at least one item is available, then keeps collecting
    /// for at most `wait`. Returns an empty `Vec` only when the queue is
    /// closed and empty.
    pub async fn pop_batch(
        &self,
        max: usize,
        wait: Duration,
        cancel: &CancellationToken,
    ) -> Result<Vec<T>> {
        let max = max.max(1);
        let mut batch = Vec::with_capacity(max);
        let mut deadline: Option<Instant> = None;

        loop {
            let notified = self.not_empty.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();

            let (taken, closed, remaining) = {
                let mut state = self.lock();
                let take = (max - batch.len()).min(state.items.len());
                batch.extend(state.items.drain(..take));
                if take > 0 {
                    self.counters.record_dequeue(take);
                }
                (take, state.closed, state.items.len())
            };

            for _ in 0..taken {
                self.not_full.notify_one();
            }

            if batch.len() == max || closed {
                if remaining > 0 {
                    self.not_empty.notify_one();
                }
                return Ok(batch);
            }

            if batch.is_empty() {
                tokio::select! {
                    biased;
                    _ = cancel.cancelled() => return Err(DigestError::Cancelled),
                    _ = &mut notified => {}
                }
                continue;
            }

            let deadline = *deadline.get_or_insert_with(|| Instant::now() + wait);
            tokio::select! {
                biased;
                _ = cancel.cancelled() => return Err(DigestError::Cancelled),
                _ = &mut notified => {}
                _ = tokio::time::sleep_until(deadline) => return Ok(batch),
            }
        }
    }

    /// Close the producer side. Items already queued can still be popped.
    pub fn close(&self) {
        self.lock().closed = true;
        self.not_empty.notify_waiters();
        self.not_full.notify_waiters();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn queue(capacity: usize) -> Arc<WorkQueue<u32>> {
        Arc::new(WorkQueue::new(
            "test",
            capacity,
            Arc::new(QueueCounters::default()),
        ))
    }

    /// Small deterministic xorshift generator.
    struct XorShift(u64);

    impl XorShift {
        fn next(&mut self) -> u64 {
            let mut x = self.0;
            x ^= x << 13;
            x ^= x >> 7;
            x ^= x << 17;
            self.0 = x;
            x
        }

        fn below(&mut self, n: u64) -> u64 {
            self.next() % n
        }
    }

    #[tokio::test]
    async fn fifo_order_and_full_batches() {
        let q = queue(8);
        let cancel = CancellationToken::new();
        for i in 0..5 {
            q.push(i, &cancel).await.unwrap();
        }

        let first = q.pop_batch(3, Duration::from_secs(5), &cancel).await.unwrap();
        assert_eq!(first, vec![0, 1, 2]);
        q.close();
        let rest = q.pop_batch(3, Duration::from_secs(5), &cancel).await.unwrap();
        assert_eq!(rest, vec![3, 4]);
        let drained = q.pop_batch(3, Duration::from_secs(5), &cancel).await.unwrap();
        assert!(drained.is_empty());
    }

    #[tokio::test]
    async fn partial_batch_returns_after_timeout() {
        let q = queue(8);
        let cancel = CancellationToken::new();
        q.push(7, &cancel).await.unwrap();

        let started = Instant::now();
        let batch = q.pop_batch(4, Duration::from_millis(40), &cancel).await.unwrap();
        assert_eq!(batch, vec![7]);
        assert!(started.elapsed() >= Duration::from_millis(40));
        assert!(started.elapsed() < Duration::from_secs(2));
    }

    #[tokio::test]
    async fn push_on_closed_queue_fails() {
        let q = queue(2);
        q.close();
        let err = q.push(1, &CancellationToken::new()).await.unwrap_err();
        assert!(matches!(err, DigestError::QueueClosed { .. }));
        assert!(err.is_fatal());
    }

    #[tokio::test]
    async fn full_queue_applies_backpressure() {
        let q = queue(1);
        let cancel = CancellationToken::new();
        q.push(1, &cancel).await.unwrap();

        let blocked = {
            let q = Arc::clone(&q);
            let cancel = cancel.clone();
            tokio::spawn(async move { q.push(2, &cancel).await })
        };
        tokio::time::sleep(Duration::from_millis(30)).await;
        assert!(!blocked.is_finished());
        assert_eq!(q.len(), 1);

        let batch = q.pop_batch(1, Duration::ZERO, &cancel).await.unwrap();
        assert_eq!(batch, vec![1]);
        blocked.await.unwrap().unwrap();
        assert_eq!(q.len(), 1);
    }

    #[tokio::test]
    async fn waits_observe_cancellation() {
        let q = queue(1);
        let cancel = CancellationToken::new();
        q.push(1, &cancel).await.unwrap();

        let pusher = {
            let q = Arc::clone(&q);
            let cancel = cancel.clone();
            tokio::spawn(async move { q.push(2, &cancel).await })
        };
        let empty = queue(1);
        let popper = {
            let empty = Arc::clone(&empty);
            let cancel = cancel.clone();
            tokio::spawn(async move { empty.pop_batch(1, Duration::from_secs(5), &cancel).await })
        };

        tokio::time::sleep(Duration::from_millis(20)).await;
        cancel.cancel();

        let pushed = tokio::time::timeout(Duration::from_secs(1), pusher).await.unwrap().unwrap();
        let popped = tokio::time::timeout(Duration::from_secs(1), popper).await.unwrap().unwrap();
        assert!(matches!(pushed, Err(DigestError::Cancelled)));
        assert!(matches!(popped, Err(DigestError::Cancelled)));
    }

    #[tokio::test]
    async fn close_wakes_blocked_consumers() {
        let q = queue(4);
        let cancel = CancellationToken::new();
        let consumer = {
            let q = Arc::clone(&q);
            let cancel = cancel.clone();
            tokio::spawn(async move { q.pop_batch(4, Duration::from_secs(5), &cancel).await })
        };
        tokio::time::sleep(Duration::from_millis(20)).await;
        q.close();

        let batch = tokio::time::timeout(Duration::from_secs(1), consumer)
            .await
            .unwrap()
            .unwrap()
            .unwrap();
        assert!(batch.is_empty());
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn randomized_interleavings_respect_capacity() {
        for seed in 1..=20u64 {
            let mut rng = XorShift(seed.wrapping_mul(0x9E37_79B9_7F4A_7C15) | 1);
            let capacity = 1 + rng.below(4) as usize;
            let producers = 1 + rng.below(3) as u32;
            let consumers = 1 + rng.below(3) as usize;
            let per_producer = 20 + rng.below(30) as u32;

            let counters = Arc::new(QueueCounters::default());
            let q = Arc::new(WorkQueue::new("rand", capacity, Arc::clone(&counters)));
            let cancel = CancellationToken::new();

            let mut producer_handles = Vec::new();
            for p in 0..producers {
                let q = Arc::clone(&q);
                let cancel = cancel.clone();
                let mut local = XorShift(rng.next() | 1);
                producer_handles.push(tokio::spawn(async move {
                    for i in 0..per_producer {
                        q.push(p * 1000 + i, &cancel).await.unwrap();
                        assert!(q.len() <= q.capacity());
                        if local.below(3) == 0 {
                            tokio::task::yield_now().await;
                        }
                    }
                }));
            }

            let mut consumer_handles = Vec::new();
            for _ in 0..consumers {
                let q = Arc::clone(&q);
                let cancel = cancel.clone();
                let max = 1 + rng.below(4) as usize;
                let mut local = XorShift(rng.next() | 1);
                consumer_handles.push(tokio::spawn(async move {
                    let mut got = Vec::new();
                    loop {
                        let batch = q
                            .pop_batch(max, Duration::from_millis(2), &cancel)
                            .await
                            .unwrap();
                        if batch.is_empty() {
                            return got;
                        }
                        assert!(batch.len() <= max);
                        got.extend(batch);
                        if local.below(2) == 0 {
                            tokio::task::yield_now().await;
                        }
                    }
                }));
            }

            for h in producer_handles {
                h.await.unwrap();
            }
            q.close();

            let mut all = Vec::new();
            for h in consumer_handles {
                all.extend(h.await.unwrap());
            }
            all.sort_unstable();
            let mut expected: Vec<u32> = (0..producers)
                .flat_map(|p| (0..per_producer).map(move |i| p * 1000 + i))
                .collect();
            expected.sort_unstable();

            assert_eq!(all, expected, "seed {seed}: every item delivered exactly once");
            let snap = counters.snapshot();
            assert!(snap.peak_len as usize <= capacity, "seed {seed}: capacity exceeded");
            assert_eq!(snap.enqueued, snap.dequeued);
        }
    }
}
