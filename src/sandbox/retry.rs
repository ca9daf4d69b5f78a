//! Bounded retry with a fixed delay for cancellable operations.
//!
//! The policy knows nothing about containers; the lifecycle engine wraps
//! container removal with it, but any fallible async operation fits.

use std::fmt::Display;
use std::future::Future;
use std::time::Duration;

use thiserror::Error;
use tokio_util::sync::CancellationToken;
use tracing::debug;

/// Default number of attempts for teardown.
pub const DEFAULT_MAX_ATTEMPTS: u32 = 3;

/// Default delay between teardown attempts.
pub const DEFAULT_DELAY: Duration = Duration::from_millis(500);

/// Failure of a retried operation.
#[derive(Debug, Error)]
pub enum RetryError<E> {
    /// The cancellation token fired while waiting between attempts.
    #[error("cancelled while waiting to retry")]
    Cancelled,

    /// Every attempt failed; carries the last underlying error.
    #[error("after {attempts} attempts, last error: {last}")]
    Exhausted {
        attempts: u32,
        #[source]
        last: E,
    },
}

/// Fixed-delay retry policy.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    /// Maximum number of invocations. Zero behaves like one.
    pub max_attempts: u32,
    /// Wait between two consecutive attempts.
    pub delay: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: DEFAULT_MAX_ATTEMPTS,
            delay: DEFAULT_DELAY,
        }
    }
}

impl RetryPolicy {
    /// Creates a policy with the given attempt budget and delay.
    pub fn new(max_attempts: u32, delay: Duration) -> Self {
        Self {
            max_attempts,
            delay,
        }
    }

    /// Runs `op` until it succeeds, the attempt budget is spent, or `cancel`
    /// fires during a backoff wait.
    ///
    /// `op` receives the 1-based attempt number. There is no wait after the
    /// final attempt.
    pub async fn run<F, Fut, T, E>(
        &self,
        cancel: &CancellationToken,
        mut op: F,
    ) -> Result<T, RetryError<E>>
    where
        F: FnMut(u32) -> Fut,
        Fut: Future<Output = Result<T, E>>,
        E: Display,
    {
        let attempts = self.max_attempts.max(1);
        let mut attempt = 1;

        loop {
            match op(attempt).await {
                Ok(value) => return Ok(value),
                Err(last) if attempt >= attempts => {
                    return Err(RetryError::Exhausted { attempts, last });
                }
                Err(e) => {
                    debug!(attempt, max_attempts = attempts, error = %e, "Attempt failed, retrying");
                }
            }

            tokio::select! {
                biased;
                _ = cancel.cancelled() => return Err(RetryError::Cancelled),
                _ = tokio::time::sleep(self.delay) => {}
            }

            attempt += 1;
        }
    }
}
