//! Bounded retry for transient storage failures.

use std::future::Future;
use std::time::Duration;

use serde::{Deserialize, Serialize};

/// Backoff strategy for retries.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BackoffStrategy {
    /// Fixed delay between retries
    #[default]
    Fixed,
    /// Linear backoff: base * attempt
    Linear,
}

/// Retry policy configuration.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RetryPolicy {
    /// Maximum number of retries after the first attempt (0 = no retries)
    pub max_retries: u32,
    /// Base delay between retries
    pub base_delay: Duration,
    pub strategy: BackoffStrategy,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self::fixed(3, Duration::from_millis(50))
    }
}

impl RetryPolicy {
    /// Create a policy with no retries.
    pub fn no_retry() -> Self {
        Self {
            max_retries: 0,
            ..Default::default()
        }
    }

    /// Create a policy with fixed delays.
    pub fn fixed(max_retries: u32, delay: Duration) -> Self {
        Self {
            max_retries,
            base_delay: delay,
            strategy: BackoffStrategy::Fixed,
        }
    }

    pub fn linear(max_retries: u32, base_delay: Duration) -> Self {
        Self {
            max_retries,
            base_delay,
            strategy: BackoffStrategy::Linear,
        }
    }

    /// Delay before retry number `retry` (1-indexed).
    pub fn delay_for_retry(&self, retry: u32) -> Duration {
        match (self.strategy, retry) {
            (_, 0) => Duration::ZERO,
            (BackoffStrategy::Fixed, _) => self.base_delay,
            (BackoffStrategy::Linear, n) => self.base_delay.saturating_mul(n),
        }
    }

    /// Check if another retry is allowed after `retries_done` retries.
    pub fn should_retry(&self, retries_done: u32) -> bool {
        retries_done < self.max_retries
    }

    /// Run `op` until it succeeds, fails with a non-retryable error, or the
    /// policy is exhausted.
    ///
    /// On exhaustion, returns the last error together with the total number of
    /// attempts made.
    pub async fn run<T, E, F, Fut>(
        &self,
        is_retryable: impl Fn(&E) -> bool,
        mut op: F,
    ) -> Result<T, RetryError<E>>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<T, E>>,
    {
        let mut retries = 0;
        loop {
            match op().await {
                Ok(value) => return Ok(value),
                Err(err) if is_retryable(&err) => {
                    if !self.should_retry(retries) {
                        return Err(RetryError::Exhausted {
                            attempts: retries + 1,
                            last: err,
                        });
                    }
                    retries += 1;
                    tokio::time::sleep(self.delay_for_retry(retries)).await;
                }
                Err(err) => return Err(RetryError::Permanent(err)),
            }
        }
    }
}

/// Outcome of a failed [`RetryPolicy::run`].
#[derive(Debug)]
pub enum RetryError<E> {
    /// The error was not retryable.
    Permanent(E),
    /// Every allowed attempt failed with a retryable error.
    Exhausted { attempts: u32, last: E },
}
