//! Resilience patterns for medivox-runtime.
//!
//! This module provides:
//! - Backoff strategies for spacing retries
//! - Circuit breaker to stop calling a failing dependency
//! - Retry policy with per-attempt timeouts and cancellation
//! - An explicit registry owning one breaker and policy per dependency
//!
//! Errors are classified by tag, not by type: an adapter decides whether a
//! failure is retryable when it constructs the error.

mod backoff;
mod cancel;
mod circuit_breaker;
mod registry;
mod retry;

pub use backoff::BackoffStrategy;
pub use cancel::CancelToken;
pub use circuit_breaker::{
    BreakerError, CircuitBreaker, CircuitBreakerConfig, CircuitBreakerStats, CircuitState,
};
pub use registry::ResilienceRegistry;
pub use retry::{RetryConfig, RetryError, RetryPolicy, RetryStats};

use serde::{Deserialize, Serialize};
use std::fmt;
use std::time::Duration;

/// Broad category of a dependency failure.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FailureKind {
    Timeout,
    Connection,
    Unavailable,
    RateLimited,
    InvalidInput,
    Quality,
    Internal,
}

impl FailureKind {
    /// Transient kinds are worth retrying by default.
    pub fn is_transient(&self) -> bool {
        matches!(
            self,
            FailureKind::Timeout
                | FailureKind::Connection
                | FailureKind::Unavailable
                | FailureKind::RateLimited
        )
    }
}

impl fmt::Display for FailureKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let label = match self {
            FailureKind::Timeout => "timeout",
            FailureKind::Connection => "connection",
            FailureKind::Unavailable => "unavailable",
            FailureKind::RateLimited => "rate_limited",
            FailureKind::InvalidInput => "invalid_input",
            FailureKind::Quality => "quality",
            FailureKind::Internal => "internal",
        };
        f.write_str(label)
    }
}

/// Errors the retry policy knows how to classify.
pub trait RetryableError: std::error::Error + Send + Sync + 'static {
    /// Set by the adapter that produced the error.
    fn is_retryable(&self) -> bool;

    fn kind(&self) -> FailureKind;

    /// Error reported when an attempt exceeds its timeout.
    fn timed_out(after: Duration) -> Self
    where
        Self: Sized;
}

/// Errors the circuit breaker counts as dependency failures.
pub trait TripsBreaker {
    fn trips_breaker(&self) -> bool;
}
