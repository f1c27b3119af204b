//! Retry policy shared by RPC transports and off-chain fetches.
//!
//! Transports retry immediately against a freshly selected endpoint, so their
//! policy has zero backoff and a retry predicate that rejects deterministic
//! errors. Off-chain fetches use exponential backoff.

use std::fmt::Display;
use std::future::Future;
use std::time::Duration;
use tokio::time::sleep;

/// Retry policy configuration
#[derive(Debug, Clone)]
pub struct RetryPolicy {
    /// Maximum number of retry attempts (0 = no retries, just try once)
    pub max_retries: u32,

    /// Initial backoff duration
    pub initial_backoff: Duration,

    /// Maximum backoff duration
    pub max_backoff: Duration,

    /// Backoff multiplier (e.g., 2.0 for exponential backoff)
    pub backoff_multiplier: f64,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_retries: 5,
            initial_backoff: Duration::from_millis(100),
            max_backoff: Duration::from_secs(10),
            backoff_multiplier: 2.0,
        }
    }
}

impl RetryPolicy {
    /// Creates a new retry policy with custom configuration.
    pub fn new(
        max_retries: u32,
        initial_backoff: Duration,
        max_backoff: Duration,
        backoff_multiplier: f64,
    ) -> Self {
        Self {
            max_retries,
            initial_backoff,
            max_backoff,
            backoff_multiplier,
        }
    }

    /// Policy allowing `attempts` total tries with no delay between them.
    pub fn immediate(attempts: u32) -> Self {
        Self {
            max_retries: attempts.saturating_sub(1),
            initial_backoff: Duration::ZERO,
            max_backoff: Duration::ZERO,
            backoff_multiplier: 1.0,
        }
    }

    /// Creates a policy with no retries (fail immediately).
    pub fn no_retry() -> Self {
        Self::immediate(1)
    }

    /// Total number of attempts this policy makes.
    pub fn attempts(&self) -> u32 {
        self.max_retries.saturating_add(1)
    }

    /// Executes an operation, retrying every error.
    pub async fn execute<F, Fut, T>(&self, operation: F) -> anyhow::Result<T>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = anyhow::Result<T>>,
    {
        self.execute_when(operation, |_| true).await
    }

    /// Executes an operation, retrying only errors accepted by `retryable`.
    ///
    /// A rejected error is returned immediately without consuming the budget.
    pub async fn execute_when<F, Fut, T, E, P>(&self, mut operation: F, retryable: P) -> Result<T, E>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<T, E>>,
        E: Display,
        P: Fn(&E) -> bool,
    {
        let mut attempts = 0;
        let mut backoff = self.initial_backoff;

        loop {
            match operation().await {
                Ok(result) => {
                    if attempts > 0 {
                        tracing::debug!(
                            target: "shardex_common::retry",
                            "Operation succeeded after {} attempt(s)",
                            attempts + 1
                        );
                    }
                    return Ok(result);
                }
                Err(err) => {
                    if !retryable(&err) {
                        return Err(err);
                    }

                    attempts += 1;

                    if attempts > self.max_retries {
                        tracing::warn!(
                            target: "shardex_common::retry",
                            "Operation failed after {} attempts: {}",
                            attempts,
                            err
                        );
                        return Err(err);
                    }

                    tracing::debug!(
                        target: "shardex_common::retry",
                        "Operation failed (attempt {}/{}): {}. Retrying in {:?}...",
                        attempts,
                        self.max_retries + 1,
                        err,
                        backoff
                    );

                    if !backoff.is_zero() {
                        sleep(backoff).await;
                    }

                    backoff = Duration::from_secs_f64(
                        (backoff.as_secs_f64() * self.backoff_multiplier)
                            .min(self.max_backoff.as_secs_f64()),
                    );
                }
            }
        }
    }
}
