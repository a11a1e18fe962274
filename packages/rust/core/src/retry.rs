//! Exponential backoff shared by fetches, discovery, and model batches.

use std::future::Future;
use std::time::Duration;

use tokio_util::sync::CancellationToken;
use tracing::warn;

use topicdigest_shared::{DigestError, Result};

/// Attempt cap and backoff curve.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    /// Total attempts, including the first.
    pub max_attempts: u32,
    pub base_delay: Duration,
    pub max_delay: Duration,
}

/// Outcome of [`RetryPolicy::run`].
#[derive(Debug)]
pub struct Retried<T> {
    pub result: Result<T>,
    /// Attempts beyond the first.
    pub retries: u32,
}

impl RetryPolicy {
    pub fn new(max_attempts: u32, base_delay: Duration, max_delay: Duration) -> Self {
        Self {
            max_attempts: max_attempts.max(1),
            base_delay,
            max_delay,
        }
    }

    /// Delay before retry number `retry` (1-based): `base * 2^(retry-1)`, capped.
    pub fn backoff(&self, retry: u32) -> Duration {
        let exp = retry.saturating_sub(1).min(16);
        self.base_delay
            .saturating_mul(1u32 << exp)
            .min(self.max_delay)
    }

    /// Run `op` until it succeeds, `retryable` rejects the error, attempts
    /// run out, or `cancel` fires.
    ///
    /// [`DigestError::Cancelled`] is never retried. Backoff sleeps observe
    /// `cancel`.
    pub async fn run<T, F, Fut>(
        &self,
        what: &str,
        cancel: &CancellationToken,
        retryable: impl Fn(&DigestError) -> bool,
        mut op: F,
    ) -> Retried<T>
    where
        F: FnMut(u32) -> Fut,
        Fut: Future<Output = Result<T>>,
    {
        let mut retries = 0;
        loop {
            let attempt = retries + 1;
            let err = match op(attempt).await {
                Ok(value) => {
                    return Retried {
                        result: Ok(value),
                        retries,
                    };
                }
                Err(err) => err,
            };

            let give_up = matches!(err, DigestError::Cancelled)
                || !retryable(&err)
                || attempt >= self.max_attempts;
            if give_up {
                return Retried {
                    result: Err(err),
                    retries,
                };
            }

            retries += 1;
            let delay = self.backoff(retries);
            warn!(
                what,
                attempt,
                max_attempts = self.max_attempts,
                delay_ms = delay.as_millis() as u64,
                error = %err,
                "retrying"
            );

            tokio::select! {
                biased;
                _ = cancel.cancelled() => {
                    return Retried {
                        result: Err(DigestError::Cancelled),
                        retries,
                    };
                }
                _ = tokio::time::sleep(delay) => {}
            }
        }
    }
}

/// Retry predicate for fetch and discovery: transient errors only.
pub fn transient_only(err: &DigestError) -> bool {
    err.is_transient()
}

/// Retry predicate for model batches: anything short of fatal.
///
/// Unparseable replies count as a failed attempt and are retried along
/// with rate limits and timeouts.
pub fn unless_fatal(err: &DigestError) -> bool {
    !err.is_fatal()
}
