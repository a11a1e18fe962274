//! Admission gates bounding concurrent fetches and model calls.
//!
//! A [`Gate`] is a fair (FIFO) counting semaphore with an acquire timeout.
//! Releasing is dropping the [`GatePermit`]. Each gate tracks how many
//! permits are out and the highest that number has been, so tests and the
//! final report can check the bound held.

use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;

use tokio::sync::{OwnedSemaphorePermit, Semaphore};
use tokio_util::sync::CancellationToken;

use topicdigest_shared::{DigestError, GateKind, Result};

/// Bounded-concurrency admission control.
#[derive(Debug)]
pub struct Gate {
    kind: GateKind,
    capacity: usize,
    timeout: Duration,
    semaphore: Arc<Semaphore>,
    in_use: Arc<AtomicUsize>,
    peak: Arc<AtomicUsize>,
}

impl Gate {
    pub fn new(kind: GateKind, capacity: usize, timeout: Duration) -> Self {
        let capacity = capacity.max(1);
        Self {
            kind,
            capacity,
            timeout,
            semaphore: Arc::new(Semaphore::new(capacity)),
            in_use: Arc::new(AtomicUsize::new(0)),
            peak: Arc::new(AtomicUsize::new(0)),
        }
    }

    /// Wait for a permit.
    ///
    /// Fails with [`DigestError::GateTimeout`] after the configured timeout
    /// and with [`DigestError::Cancelled`] as soon as `cancel` fires.
    pub async fn acquire(&self, cancel: &CancellationToken) -> Result<GatePermit> {
        let waiting = tokio::time::timeout(self.timeout, Arc::clone(&self.semaphore).acquire_owned());

        let permit = tokio::select! {
            biased;
            _ = cancel.cancelled() => return Err(DigestError::Cancelled),
            acquired = waiting => match acquired {
                Err(_elapsed) => return Err(DigestError::GateTimeout { gate: self.kind }),
                Ok(Err(_closed)) => {
                    return Err(DigestError::invariant(format!("{} gate semaphore closed", self.kind)));
                }
                Ok(Ok(permit)) => permit,
            },
        };

        let now = self.in_use.fetch_add(1, Ordering::SeqCst) + 1;
        self.peak.fetch_max(now, Ordering::SeqCst);

        Ok(GatePermit {
            _permit: permit,
            in_use: Arc::clone(&self.in_use),
        })
    }

    pub fn kind(&self) -> GateKind {
        self.kind
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    /// Permits currently held.
    pub fn in_use(&self) -> usize {
        self.in_use.load(Ordering::SeqCst)
    }

    /// Highest number of permits ever held at once.
    pub fn peak(&self) -> usize {
        self.peak.load(Ordering::SeqCst)
    }
}

/// A held gate permit; dropping it releases the slot.
#[derive(Debug)]
pub struct GatePermit {
    _permit: OwnedSemaphorePermit,
    in_use: Arc<AtomicUsize>,
}

impl Drop for GatePermit {
    fn drop(&mut self) {
        self.in_use.fetch_sub(1, Ordering::SeqCst);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn permits_are_bounded_and_released_on_drop() {
        let gate = Gate::new(GateKind::Fetch, 2, Duration::from_secs(1));
        let cancel = CancellationToken::new();

        let a = gate.acquire(&cancel).await.unwrap();
        let b = gate.acquire(&cancel).await.unwrap();
        assert_eq!(gate.in_use(), 2);

        drop(a);
        assert_eq!(gate.in_use(), 1);
        let _c = gate.acquire(&cancel).await.unwrap();
        drop(b);

        assert_eq!(gate.in_use(), 1);
        assert_eq!(gate.peak(), 2);
    }

    #[tokio::test]
    async fn acquire_times_out_when_full() {
        let gate = Gate::new(GateKind::Llm, 1, Duration::from_millis(30));
        let cancel = CancellationToken::new();
        let _held = gate.acquire(&cancel).await.unwrap();

        let err = gate.acquire(&cancel).await.unwrap_err();
        assert!(matches!(err, DigestError::GateTimeout { gate: GateKind::Llm }));
        assert!(err.is_transient());
    }

    #[tokio::test]
    async fn acquire_observes_cancellation() {
        let gate = Arc::new(Gate::new(GateKind::Fetch, 1, Duration::from_secs(30)));
        let cancel = CancellationToken::new();
        let _held = gate.acquire(&cancel).await.unwrap();

        let waiter = {
            let gate = Arc::clone(&gate);
            let cancel = cancel.clone();
            tokio::spawn(async move { gate.acquire(&cancel).await })
        };
        tokio::time::sleep(Duration::from_millis(20)).await;
        cancel.cancel();

        let result = tokio::time::timeout(Duration::from_secs(1), waiter)
            .await
            .expect("waiter unwinds promptly")
            .unwrap();
        assert!(matches!(result, Err(DigestError::Cancelled)));
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn waiters_are_served_in_arrival_order() {
        let gate = Arc::new(Gate::new(GateKind::Fetch, 1, Duration::from_secs(5)));
        let cancel = CancellationToken::new();
        let order = Arc::new(std::sync::Mutex::new(Vec::new()));

        let first = gate.acquire(&cancel).await.unwrap();
        let mut handles = Vec::new();
        for i in 0..4 {
            let gate = Arc::clone(&gate);
            let cancel = cancel.clone();
            let order = Arc::clone(&order);
            handles.push(tokio::spawn(async move {
                let _permit = gate.acquire(&cancel).await.unwrap();
                order.lock().unwrap().push(i);
            }));
            // Let each waiter enqueue on the semaphore before the next.
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        drop(first);
        for h in handles {
            h.await.unwrap();
        }

        assert_eq!(*order.lock().unwrap(), vec![0, 1, 2, 3]);
    }
}
