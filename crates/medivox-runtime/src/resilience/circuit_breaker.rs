//! Circuit breaker to prevent cascade failures.
//!
//! When a dependency fails repeatedly the circuit opens and calls are
//! rejected immediately until a cooldown passes. After the cooldown a
//! limited number of probe calls are let through; one successful probe
//! closes the circuit, one failing probe reopens it.
//!
//! The lock only guards breaker state. The wrapped operation runs outside
//! it, so concurrent callers are never serialized through the dependency.

use super::TripsBreaker;
use crate::config::duration_str;
use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::future::Future;
use std::time::Duration;
use thiserror::Error;
use tokio::time::Instant;

/// Circuit breaker configuration.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct CircuitBreakerConfig {
    /// Consecutive failures before opening the circuit
    pub failure_threshold: u32,

    /// Time after the last failure before probing again
    #[serde(with = "duration_str")]
    pub timeout: Duration,

    /// Probe calls allowed in flight while half-open
    pub half_open_max_calls: u32,
}

impl Default for CircuitBreakerConfig {
    fn default() -> Self {
        Self {
            failure_threshold: 5,
            timeout: Duration::from_secs(60),
            half_open_max_calls: 3,
        }
    }
}

impl CircuitBreakerConfig {
    /// Speech recognition and synthesis backends.
    pub fn speech() -> Self {
        Self {
            failure_threshold: 3,
            timeout: Duration::from_secs(30),
            half_open_max_calls: 2,
        }
    }

    /// Medical reasoning backends.
    pub fn reasoning() -> Self {
        Self::default()
    }
}

/// State of a circuit.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum CircuitState {
    /// Normal operation
    Closed,

    /// Calls are rejected
    Open,

    /// Probing whether the dependency recovered
    HalfOpen,
}

impl fmt::Display for CircuitState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            CircuitState::Closed => write!(f, "CLOSED"),
            CircuitState::Open => write!(f, "OPEN"),
            CircuitState::HalfOpen => write!(f, "HALF_OPEN"),
        }
    }
}

/// Error returned by [`CircuitBreaker::execute`].
#[derive(Error, Debug)]
pub enum BreakerError<E> {
    #[error("circuit breaker '{name}' is open")]
    Open { name: String },

    #[error(transparent)]
    Inner(E),
}

impl<E> BreakerError<E> {
    pub fn is_open(&self) -> bool {
        matches!(self, BreakerError::Open { .. })
    }

    pub fn into_inner(self) -> Option<E> {
        match self {
            BreakerError::Inner(e) => Some(e),
            BreakerError::Open { .. } => None,
        }
    }
}

/// Snapshot for status endpoints.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CircuitBreakerStats {
    pub name: String,
    pub state: CircuitState,
    pub total_calls: u64,
    pub successful_calls: u64,
    pub failed_calls: u64,
    pub rejected_calls: u64,
    pub failure_count: u32,

    /// Successful calls as a percentage of all calls
    pub success_rate: f64,

    pub last_failure_time: Option<DateTime<Utc>>,

    /// Seconds since the last counted failure
    pub last_failure_age_secs: Option<f64>,

    pub config: CircuitBreakerConfig,
}

#[derive(Debug)]
struct BreakerState {
    state: CircuitState,
    failure_count: u32,
    last_failure: Option<Instant>,
    last_failure_time: Option<DateTime<Utc>>,
    half_open_calls: u32,

    /// Bumped on every entry into half-open so stale probes cannot free
    /// slots of a later probing window
    half_open_epoch: u64,

    total_calls: u64,
    successful_calls: u64,
    failed_calls: u64,
    rejected_calls: u64,
}

pub struct CircuitBreaker {
    name: String,
    config: CircuitBreakerConfig,
    inner: Mutex<BreakerState>,
}

/// Admission ticket for one call. A probe ticket holds a half-open slot
/// until the call records an outcome or the ticket is dropped.
struct Ticket<'a> {
    breaker: &'a CircuitBreaker,
    probe_epoch: Option<u64>,
}

impl Ticket<'_> {
    fn settle(mut self) {
        self.probe_epoch = None;
    }
}

impl Drop for Ticket<'_> {
    fn drop(&mut self) {
        if let Some(epoch) = self.probe_epoch {
            self.breaker.release_probe(epoch);
        }
    }
}

impl CircuitBreaker {
    /// Create a new circuit breaker in the closed state.
    pub fn new(name: impl Into<String>, config: CircuitBreakerConfig) -> Self {
        Self {
            name: name.into(),
            config,
            inner: Mutex::new(BreakerState {
                state: CircuitState::Closed,
                failure_count: 0,
                last_failure: None,
                last_failure_time: None,
                half_open_calls: 0,
                half_open_epoch: 0,
                total_calls: 0,
                successful_calls: 0,
                failed_calls: 0,
                rejected_calls: 0,
            }),
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn config(&self) -> &CircuitBreakerConfig {
        &self.config
    }

    /// Stored state. Moving from open to half-open happens on admission.
    pub fn state(&self) -> CircuitState {
        self.inner.lock().state
    }

    /// Run `operation` through the breaker.
    ///
    /// Errors for which [`TripsBreaker::trips_breaker`] is false are handed
    /// back without touching breaker state.
    pub async fn execute<F, Fut, T, E>(&self, operation: F) -> Result<T, BreakerError<E>>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<T, E>>,
        E: TripsBreaker,
    {
        self.execute_with(operation, E::trips_breaker).await
    }

    /// Like [`execute`](Self::execute) with an explicit failure predicate.
    pub async fn execute_with<F, Fut, T, E, P>(
        &self,
        operation: F,
        is_failure: P,
    ) -> Result<T, BreakerError<E>>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<T, E>>,
        P: Fn(&E) -> bool,
    {
        let ticket = self.admit::<E>()?;

        match operation().await {
            Ok(value) => {
                self.on_success();
                ticket.settle();
                Ok(value)
            }
            Err(err) if is_failure(&err) => {
                self.on_failure();
                ticket.settle();
                Err(BreakerError::Inner(err))
            }
            // Ticket drop frees a probe slot; state is otherwise untouched.
            Err(err) => Err(BreakerError::Inner(err)),
        }
    }

    fn admit<E>(&self) -> Result<Ticket<'_>, BreakerError<E>> {
        let mut inner = self.inner.lock();
        inner.total_calls += 1;

        if inner.state == CircuitState::Open {
            let cooled = inner
                .last_failure
                .map_or(true, |at| at.elapsed() >= self.config.timeout);
            if !cooled {
                inner.rejected_calls += 1;
                return Err(self.open_error());
            }
            inner.state = CircuitState::HalfOpen;
            inner.half_open_calls = 0;
            inner.half_open_epoch += 1;
            tracing::info!(breaker = %self.name, "Circuit half-open, admitting probe calls");
        }

        match inner.state {
            CircuitState::HalfOpen => {
                if inner.half_open_calls >= self.config.half_open_max_calls {
                    inner.rejected_calls += 1;
                    return Err(self.open_error());
                }
                inner.half_open_calls += 1;
                Ok(Ticket {
                    breaker: self,
                    probe_epoch: Some(inner.half_open_epoch),
                })
            }
            _ => Ok(Ticket {
                breaker: self,
                probe_epoch: None,
            }),
        }
    }

    fn on_success(&self) {
        let mut inner = self.inner.lock();
        inner.successful_calls += 1;
        match inner.state {
            CircuitState::HalfOpen => {
                inner.state = CircuitState::Closed;
                inner.failure_count = 0;
                inner.last_failure = None;
                inner.half_open_calls = 0;
                tracing::info!(breaker = %self.name, "Circuit closed after successful probe");
            }
            CircuitState::Closed => inner.failure_count = 0,
            // A call admitted before the circuit opened; it proves nothing
            // about the probing window.
            CircuitState::Open => {}
        }
    }

    fn on_failure(&self) {
        let mut inner = self.inner.lock();
        inner.failed_calls += 1;
        inner.failure_count += 1;
        inner.last_failure = Some(Instant::now());
        inner.last_failure_time = Some(Utc::now());

        match inner.state {
            CircuitState::HalfOpen => {
                inner.state = CircuitState::Open;
                inner.half_open_calls = 0;
                tracing::warn!(breaker = %self.name, "Circuit reopened after failed probe");
            }
            CircuitState::Closed if inner.failure_count >= self.config.failure_threshold => {
                inner.state = CircuitState::Open;
                tracing::warn!(
                    breaker = %self.name,
                    failures = inner.failure_count,
                    "Circuit opened after repeated failures"
                );
            }
            _ => {}
        }
    }

    fn release_probe(&self, epoch: u64) {
        let mut inner = self.inner.lock();
        if inner.state == CircuitState::HalfOpen && inner.half_open_epoch == epoch {
            inner.half_open_calls = inner.half_open_calls.saturating_sub(1);
        }
    }

    fn open_error<E>(&self) -> BreakerError<E> {
        BreakerError::Open {
            name: self.name.clone(),
        }
    }

    /// Snapshot of state and call counters.
    pub fn get_stats(&self) -> CircuitBreakerStats {
        let inner = self.inner.lock();
        let success_rate = if inner.total_calls == 0 {
            0.0
        } else {
            inner.successful_calls as f64 / inner.total_calls as f64 * 100.0
        };

        CircuitBreakerStats {
            name: self.name.clone(),
            state: inner.state,
            total_calls: inner.total_calls,
            successful_calls: inner.successful_calls,
            failed_calls: inner.failed_calls,
            rejected_calls: inner.rejected_calls,
            failure_count: inner.failure_count,
            success_rate,
            last_failure_time: inner.last_failure_time,
            last_failure_age_secs: inner.last_failure.map(|at| at.elapsed().as_secs_f64()),
            config: self.config.clone(),
        }
    }

    /// Manually close the circuit. Counters are kept.
    pub fn reset(&self) {
        let mut inner = self.inner.lock();
        let previous = inner.state;
        inner.state = CircuitState::Closed;
        inner.failure_count = 0;
        inner.last_failure = None;
        inner.half_open_calls = 0;
        tracing::info!(breaker = %self.name, previous = %previous, "Circuit manually reset");
    }

    /// Manually open the circuit. The cooldown starts now.
    pub fn force_open(&self) {
        let mut inner = self.inner.lock();
        inner.state = CircuitState::Open;
        inner.last_failure = Some(Instant::now());
        inner.last_failure_time = Some(Utc::now());
        inner.half_open_calls = 0;
        tracing::warn!(breaker = %self.name, "Circuit manually forced open");
    }
}

impl fmt::Debug for CircuitBreaker {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CircuitBreaker")
            .field("name", &self.name)
            .field("state", &self.state())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU32, Ordering};
    use std::sync::Arc;

    #[derive(Debug, PartialEq)]
    enum TestError {
        Down,
        BadInput,
    }

    impl TripsBreaker for TestError {
        fn trips_breaker(&self) -> bool {
            matches!(self, TestError::Down)
        }
    }

    fn breaker(threshold: u32, timeout_secs: u64, probes: u32) -> CircuitBreaker {
        CircuitBreaker::new(
            "test",
            CircuitBreakerConfig {
                failure_threshold: threshold,
                timeout: Duration::from_secs(timeout_secs),
                half_open_max_calls: probes,
            },
        )
    }

    async fn fail(cb: &CircuitBreaker) -> Result<(), BreakerError<TestError>> {
        cb.execute(|| async { Err::<(), _>(TestError::Down) }).await
    }

    async fn succeed(cb: &CircuitBreaker) -> Result<u32, BreakerError<TestError>> {
        cb.execute(|| async { Ok::<_, TestError>(7) }).await
    }

    #[tokio::test]
    async fn test_circuit_starts_closed() {
        let cb = breaker(3, 30, 1);
        assert_eq!(cb.state(), CircuitState::Closed);
        assert_eq!(succeed(&cb).await.unwrap(), 7);
    }

    #[tokio::test(start_paused = true)]
    async fn test_open_then_probe_after_timeout() {
        let cb = breaker(3, 30, 1);
        for _ in 0..3 {
            assert!(matches!(fail(&cb).await, Err(BreakerError::Inner(TestError::Down))));
        }
        assert_eq!(cb.state(), CircuitState::Open);

        tokio::time::advance(Duration::from_secs(10)).await;
        let calls = AtomicU32::new(0);
        let rejected = cb
            .execute(|| async {
                calls.fetch_add(1, Ordering::SeqCst);
                Ok::<_, TestError>(())
            })
            .await;
        assert!(rejected.unwrap_err().is_open());
        assert_eq!(calls.load(Ordering::SeqCst), 0);

        tokio::time::advance(Duration::from_secs(21)).await;
        assert_eq!(succeed(&cb).await.unwrap(), 7);
        assert_eq!(cb.state(), CircuitState::Closed);
        assert_eq!(cb.get_stats().failure_count, 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_failed_probe_reopens() {
        let cb = breaker(2, 30, 1);
        fail(&cb).await.unwrap_err();
        fail(&cb).await.unwrap_err();
        tokio::time::advance(Duration::from_secs(30)).await;

        fail(&cb).await.unwrap_err();
        assert_eq!(cb.state(), CircuitState::Open);

        // cooldown restarts from the failed probe
        tokio::time::advance(Duration::from_secs(29)).await;
        assert!(succeed(&cb).await.unwrap_err().is_open());
    }

    #[tokio::test(start_paused = true)]
    async fn test_single_probe_admitted() {
        let cb = Arc::new(breaker(1, 5, 1));
        fail(&cb).await.unwrap_err();
        tokio::time::advance(Duration::from_secs(5)).await;

        let (release, hold) = tokio::sync::oneshot::channel::<()>();
        let probe = {
            let cb = cb.clone();
            tokio::spawn(async move {
                cb.execute(|| async move {
                    let _ = hold.await;
                    Ok::<_, TestError>(1)
                })
                .await
            })
        };
        tokio::task::yield_now().await;
        assert_eq!(cb.state(), CircuitState::HalfOpen);

        assert!(succeed(&cb).await.unwrap_err().is_open());

        release.send(()).unwrap();
        assert_eq!(probe.await.unwrap().unwrap(), 1);
        assert_eq!(cb.state(), CircuitState::Closed);
        assert_eq!(cb.get_stats().rejected_calls, 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_dropped_probe_frees_slot() {
        let cb = breaker(1, 5, 1);
        fail(&cb).await.unwrap_err();
        tokio::time::advance(Duration::from_secs(5)).await;

        let stalled = cb.execute(|| std::future::pending::<Result<(), TestError>>());
        let timed_out = tokio::time::timeout(Duration::from_millis(10), stalled).await;
        assert!(timed_out.is_err());
        assert_eq!(cb.state(), CircuitState::HalfOpen);

        assert_eq!(succeed(&cb).await.unwrap(), 7);
        assert_eq!(cb.state(), CircuitState::Closed);
    }

    #[tokio::test]
    async fn test_non_tripping_errors_pass_through() {
        let cb = breaker(1, 30, 1);
        let result = cb.execute(|| async { Err::<(), _>(TestError::BadInput) }).await;
        assert!(matches!(result, Err(BreakerError::Inner(TestError::BadInput))));
        assert_eq!(cb.state(), CircuitState::Closed);

        let stats = cb.get_stats();
        assert_eq!(stats.failed_calls, 0);
        assert_eq!(stats.failure_count, 0);
    }

    #[tokio::test]
    async fn test_success_resets_failures() {
        let cb = breaker(3, 30, 1);
        fail(&cb).await.unwrap_err();
        fail(&cb).await.unwrap_err();
        succeed(&cb).await.unwrap();
        fail(&cb).await.unwrap_err();
        fail(&cb).await.unwrap_err();
        assert_eq!(cb.state(), CircuitState::Closed);
    }

    #[tokio::test]
    async fn test_stats_and_manual_overrides() {
        let cb = breaker(3, 30, 1);
        succeed(&cb).await.unwrap();
        fail(&cb).await.unwrap_err();

        let stats = cb.get_stats();
        assert_eq!(stats.total_calls, 2);
        assert_eq!(stats.successful_calls, 1);
        assert_eq!(stats.success_rate, 50.0);
        assert!(stats.last_failure_time.is_some());

        cb.force_open();
        assert_eq!(cb.state(), CircuitState::Open);
        assert!(succeed(&cb).await.unwrap_err().is_open());

        cb.reset();
        assert_eq!(cb.state(), CircuitState::Closed);
        assert_eq!(cb.get_stats().total_calls, 3);
        assert_eq!(succeed(&cb).await.unwrap(), 7);
    }

    #[test]
    fn test_state_display() {
        assert_eq!(CircuitState::HalfOpen.to_string(), "HALF_OPEN");
        let json = serde_json::to_string(&CircuitState::HalfOpen).unwrap();
        assert_eq!(json, "\"HALF_OPEN\"");
    }
}
