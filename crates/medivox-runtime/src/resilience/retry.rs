//! Bounded retry loop with backoff.
//!
//! Each attempt may carry a timeout. An attempt that times out is dropped,
//! which cancels the in-flight work, and counts as a retryable failure.

use super::{BackoffStrategy, CancelToken, FailureKind, RetryableError, TripsBreaker};
use crate::config::duration_opt_str;
use serde::{Deserialize, Serialize};
use std::future::Future;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;
use thiserror::Error;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RetryConfig {
    /// Attempts per call, including the first; at least 1
    pub max_attempts: u32,

    pub backoff: BackoffStrategy,

    /// Failure kinds worth retrying. Empty means every error the adapter
    /// flagged as retryable.
    pub retry_on: Vec<FailureKind>,

    #[serde(with = "duration_opt_str")]
    pub attempt_timeout: Option<Duration>,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            backoff: BackoffStrategy::exponential(Duration::from_secs(1), Duration::from_secs(10)),
            retry_on: vec![
                FailureKind::Timeout,
                FailureKind::Connection,
                FailureKind::Unavailable,
                FailureKind::RateLimited,
            ],
            attempt_timeout: Some(Duration::from_secs(30)),
        }
    }
}

impl RetryConfig {
    /// Single attempt, no timeout.
    pub fn no_retry() -> Self {
        Self {
            max_attempts: 1,
            attempt_timeout: None,
            ..Default::default()
        }
    }
}

/// Error returned by [`RetryPolicy::execute`].
#[derive(Error, Debug)]
pub enum RetryError<E> {
    #[error("retries exhausted after {attempts} attempts: {last_error}")]
    Exhausted { attempts: u32, last_error: E },

    #[error("non-retryable failure on attempt {attempts}: {error}")]
    Rejected { attempts: u32, error: E },

    #[error("cancelled during attempt {attempts}")]
    Cancelled { attempts: u32 },
}

impl<E> RetryError<E> {
    pub fn attempts(&self) -> u32 {
        match self {
            RetryError::Exhausted { attempts, .. }
            | RetryError::Rejected { attempts, .. }
            | RetryError::Cancelled { attempts } => *attempts,
        }
    }
}

/// Only exhausted retries count against a breaker. Rejected inputs and
/// cancellations say nothing about the dependency.
impl<E> TripsBreaker for RetryError<E> {
    fn trips_breaker(&self) -> bool {
        matches!(self, RetryError::Exhausted { .. })
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RetryStats {
    pub name: String,
    pub total_calls: u64,
    pub successful_calls: u64,
    pub failed_calls: u64,
    pub cancelled_calls: u64,
    pub total_attempts: u64,

    /// Percentage of calls that eventually succeeded
    pub success_rate: f64,

    pub average_attempts: f64,
    pub config: RetryConfig,
}

#[derive(Debug)]
pub struct RetryPolicy {
    name: String,
    config: RetryConfig,
    total_calls: AtomicU64,
    successful_calls: AtomicU64,
    failed_calls: AtomicU64,
    cancelled_calls: AtomicU64,
    total_attempts: AtomicU64,
}

impl RetryPolicy {
    /// Create a new retry policy. `max_attempts` below 1 is raised to 1.
    pub fn new(name: impl Into<String>, mut config: RetryConfig) -> Self {
        config.max_attempts = config.max_attempts.max(1);
        Self {
            name: name.into(),
            config,
            total_calls: AtomicU64::new(0),
            successful_calls: AtomicU64::new(0),
            failed_calls: AtomicU64::new(0),
            cancelled_calls: AtomicU64::new(0),
            total_attempts: AtomicU64::new(0),
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn config(&self) -> &RetryConfig {
        &self.config
    }

    fn should_retry<E: RetryableError>(&self, error: &E) -> bool {
        error.is_retryable()
            && (self.config.retry_on.is_empty() || self.config.retry_on.contains(&error.kind()))
    }

    /// Run `operation` with retries and no cancellation.
    pub async fn execute<F, Fut, T, E>(&self, operation: F) -> Result<T, RetryError<E>>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<T, E>>,
        E: RetryableError,
    {
        self.execute_with_cancel(operation, &CancelToken::new()).await
    }

    /// Run `operation` until it succeeds, fails permanently, runs out of
    /// attempts or `cancel` fires. Backoff sleeps are cancellable too.
    pub async fn execute_with_cancel<F, Fut, T, E>(
        &self,
        mut operation: F,
        cancel: &CancelToken,
    ) -> Result<T, RetryError<E>>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<T, E>>,
        E: RetryableError,
    {
        self.total_calls.fetch_add(1, Ordering::Relaxed);
        let max_attempts = self.config.max_attempts;
        let mut attempt = 0;

        loop {
            attempt += 1;
            self.total_attempts.fetch_add(1, Ordering::Relaxed);

            let outcome = tokio::select! {
                biased;
                _ = cancel.cancelled() => None,
                result = self.run_attempt(operation()) => Some(result),
            };
            let Some(outcome) = outcome else {
                return Err(self.cancelled(attempt));
            };

            let error = match outcome {
                Ok(value) => {
                    self.successful_calls.fetch_add(1, Ordering::Relaxed);
                    if attempt > 1 {
                        tracing::debug!(policy = %self.name, attempt, "Succeeded after retry");
                    }
                    return Ok(value);
                }
                Err(error) => error,
            };

            if !self.should_retry(&error) {
                self.failed_calls.fetch_add(1, Ordering::Relaxed);
                tracing::warn!(
                    policy = %self.name,
                    attempt,
                    kind = %error.kind(),
                    error = %error,
                    "Non-retryable failure"
                );
                return Err(RetryError::Rejected {
                    attempts: attempt,
                    error,
                });
            }

            if attempt >= max_attempts {
                self.failed_calls.fetch_add(1, Ordering::Relaxed);
                tracing::error!(
                    policy = %self.name,
                    attempts = attempt,
                    error = %error,
                    "Retries exhausted"
                );
                return Err(RetryError::Exhausted {
                    attempts: attempt,
                    last_error: error,
                });
            }

            let delay = self.config.backoff.delay(attempt);
            tracing::warn!(
                policy = %self.name,
                attempt,
                max_attempts,
                delay = ?delay,
                error = %error,
                "Attempt failed, backing off"
            );

            tokio::select! {
                biased;
                _ = cancel.cancelled() => return Err(self.cancelled(attempt)),
                _ = tokio::time::sleep(delay) => {}
            }
        }
    }

    async fn run_attempt<Fut, T, E>(&self, attempt: Fut) -> Result<T, E>
    where
        Fut: Future<Output = Result<T, E>>,
        E: RetryableError,
    {
        match self.config.attempt_timeout {
            Some(limit) => match tokio::time::timeout(limit, attempt).await {
                Ok(result) => result,
                Err(_) => Err(E::timed_out(limit)),
            },
            None => attempt.await,
        }
    }

    fn cancelled<E>(&self, attempts: u32) -> RetryError<E> {
        self.cancelled_calls.fetch_add(1, Ordering::Relaxed);
        tracing::info!(policy = %self.name, attempts, "Retry loop cancelled");
        RetryError::Cancelled { attempts }
    }

    /// Aggregated attempt counters since creation or the last reset.
    pub fn get_stats(&self) -> RetryStats {
        let total_calls = self.total_calls.load(Ordering::Relaxed);
        let successful_calls = self.successful_calls.load(Ordering::Relaxed);
        let total_attempts = self.total_attempts.load(Ordering::Relaxed);
        let (success_rate, average_attempts) = if total_calls == 0 {
            (0.0, 0.0)
        } else {
            (
                successful_calls as f64 / total_calls as f64 * 100.0,
                total_attempts as f64 / total_calls as f64,
            )
        };

        RetryStats {
            name: self.name.clone(),
            total_calls,
            successful_calls,
            failed_calls: self.failed_calls.load(Ordering::Relaxed),
            cancelled_calls: self.cancelled_calls.load(Ordering::Relaxed),
            total_attempts,
            success_rate,
            average_attempts,
            config: self.config.clone(),
        }
    }

    /// Zero every counter.
    pub fn reset_stats(&self) {
        self.total_calls.store(0, Ordering::Relaxed);
        self.successful_calls.store(0, Ordering::Relaxed);
        self.failed_calls.store(0, Ordering::Relaxed);
        self.cancelled_calls.store(0, Ordering::Relaxed);
        self.total_attempts.store(0, Ordering::Relaxed);
    }
}
