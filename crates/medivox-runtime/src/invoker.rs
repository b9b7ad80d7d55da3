//! Resilient calls into external capabilities.
//!
//! Every call runs as `breaker.execute(|| retry.execute(|| adapter_call))`.
//! The breaker sees one logical call per invocation, so a retry loop that
//! runs out of attempts counts as a single failure against its threshold.

use crate::capabilities::CapabilityError;
use crate::config::CapabilityPolicy;
use crate::resilience::{
    BreakerError, CancelToken, CircuitBreaker, CircuitBreakerStats, ResilienceRegistry,
    RetryError, RetryPolicy, RetryStats,
};
use serde::{Deserialize, Serialize};
use std::future::Future;
use std::sync::Arc;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum InvokeError {
    #[error("{name} is unavailable: circuit open")]
    CircuitOpen { name: String },

    #[error("{capability} failed after {attempts} attempts: {last_error}")]
    RetryExhausted {
        capability: String,
        attempts: u32,
        last_error: CapabilityError,
    },

    /// The adapter's own error, passed through without retry accounting
    #[error(transparent)]
    Capability(#[from] CapabilityError),

    #[error("{capability} call cancelled after {attempts} attempts")]
    Cancelled { capability: String, attempts: u32 },
}

impl InvokeError {
    /// The dependency is struggling rather than the input being bad.
    pub fn is_degraded(&self) -> bool {
        matches!(
            self,
            InvokeError::CircuitOpen { .. } | InvokeError::RetryExhausted { .. }
        )
    }

    pub fn is_cancelled(&self) -> bool {
        matches!(self, InvokeError::Cancelled { .. })
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct InvokerStats {
    pub name: String,
    pub enabled: bool,
    pub breaker: CircuitBreakerStats,
    pub retry: RetryStats,
}

/// Breaker plus retry policy guarding one capability.
#[derive(Debug, Clone)]
pub struct ResilientInvoker {
    name: String,
    breaker: Arc<CircuitBreaker>,
    retry: Arc<RetryPolicy>,

    /// When false, calls go straight to the adapter
    enabled: bool,
}

impl ResilientInvoker {
    /// Create an invoker over an existing breaker and retry policy.
    pub fn new(name: impl Into<String>, breaker: Arc<CircuitBreaker>, retry: Arc<RetryPolicy>) -> Self {
        Self {
            name: name.into(),
            breaker,
            retry,
            enabled: true,
        }
    }

    /// Fetch or create the breaker and retry policy registered under `name`.
    pub fn from_registry(registry: &ResilienceRegistry, name: &str, policy: &CapabilityPolicy) -> Self {
        Self::new(
            name,
            registry.breaker(name, policy.breaker.clone()),
            registry.retry_policy(name, policy.retry.clone()),
        )
    }

    /// Turn resilience off to call the operation directly.
    pub fn with_enabled(mut self, enabled: bool) -> Self {
        self.enabled = enabled;
        self
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn is_enabled(&self) -> bool {
        self.enabled
    }

    pub fn breaker(&self) -> &Arc<CircuitBreaker> {
        &self.breaker
    }

    pub fn retry_policy(&self) -> &Arc<RetryPolicy> {
        &self.retry
    }

    /// Run `operation` through the breaker and the retry policy.
    pub async fn execute<F, Fut, T>(&self, operation: F, cancel: &CancelToken) -> Result<T, InvokeError>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<T, CapabilityError>>,
    {
        if !self.enabled {
            return self.pass_through(operation, cancel).await;
        }

        let result = self
            .breaker
            .execute(|| self.retry.execute_with_cancel(operation, cancel))
            .await;

        result.map_err(|err| match err {
            BreakerError::Open { name } => InvokeError::CircuitOpen { name },
            BreakerError::Inner(RetryError::Exhausted {
                attempts,
                last_error,
            }) => InvokeError::RetryExhausted {
                capability: self.name.clone(),
                attempts,
                last_error,
            },
            BreakerError::Inner(RetryError::Rejected { error, .. }) => InvokeError::Capability(error),
            BreakerError::Inner(RetryError::Cancelled { attempts }) => InvokeError::Cancelled {
                capability: self.name.clone(),
                attempts,
            },
        })
    }

    async fn pass_through<F, Fut, T>(&self, mut operation: F, cancel: &CancelToken) -> Result<T, InvokeError>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<T, CapabilityError>>,
    {
        tokio::select! {
            biased;
            _ = cancel.cancelled() => Err(InvokeError::Cancelled {
                capability: self.name.clone(),
                attempts: 1,
            }),
            result = operation() => result.map_err(InvokeError::Capability),
        }
    }

    /// Breaker and retry statistics for this capability.
    pub fn stats(&self) -> InvokerStats {
        InvokerStats {
            name: self.name.clone(),
            enabled: self.enabled,
            breaker: self.breaker.get_stats(),
            retry: self.retry.get_stats(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::resilience::{BackoffStrategy, CircuitBreakerConfig, CircuitState, RetryConfig};
    use std::sync::atomic::{AtomicU32, Ordering};
    use std::time::Duration;

    fn invoker(threshold: u32) -> ResilientInvoker {
        let policy = CapabilityPolicy {
            breaker: CircuitBreakerConfig {
                failure_threshold: threshold,
                timeout: Duration::from_secs(30),
                half_open_max_calls: 1,
            },
            retry: RetryConfig {
                max_attempts: 3,
                backoff: BackoffStrategy::fixed(Duration::from_millis(100)),
                ..Default::default()
            },
        };
        ResilientInvoker::from_registry(&ResilienceRegistry::new(), "speech_to_text", &policy)
    }

    #[tokio::test(start_paused = true)]
    async fn test_exhausted_retries_count_once() {
        let invoker = invoker(2);
        let calls = AtomicU32::new(0);
        let cancel = CancelToken::new();

        let err = invoker
            .execute(
                || async {
                    calls.fetch_add(1, Ordering::SeqCst);
                    Err::<(), _>(CapabilityError::connection("refused"))
                },
                &cancel,
            )
            .await
            .unwrap_err();

        assert!(matches!(err, InvokeError::RetryExhausted { attempts: 3, .. }));
        assert!(err.is_degraded());
        assert_eq!(calls.load(Ordering::SeqCst), 3);

        let stats = invoker.stats();
        assert_eq!(stats.breaker.failure_count, 1);
        assert_eq!(stats.breaker.state, CircuitState::Closed);
        assert_eq!(stats.retry.total_attempts, 3);
    }

    #[tokio::test(start_paused = true)]
    async fn test_open_circuit_skips_adapter() {
        let invoker = invoker(1);
        let cancel = CancelToken::new();
        let failing = || async { Err::<(), _>(CapabilityError::unavailable("503")) };

        invoker.execute(failing, &cancel).await.unwrap_err();
        assert_eq!(invoker.breaker().state(), CircuitState::Open);

        let calls = AtomicU32::new(0);
        let err = invoker
            .execute(
                || async {
                    calls.fetch_add(1, Ordering::SeqCst);
                    Ok::<_, CapabilityError>(())
                },
                &cancel,
            )
            .await
            .unwrap_err();
        assert!(matches!(err, InvokeError::CircuitOpen { ref name } if name == "speech_to_text"));
        assert_eq!(calls.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn test_non_retryable_passes_through() {
        let invoker = invoker(1);
        let cancel = CancelToken::new();

        let err = invoker
            .execute(
                || async { Err::<(), _>(CapabilityError::invalid_input("empty audio")) },
                &cancel,
            )
            .await
            .unwrap_err();

        assert!(matches!(err, InvokeError::Capability(ref e) if e.message == "empty audio"));
        assert!(!err.is_degraded());
        // input problems leave the breaker alone
        assert_eq!(invoker.breaker().state(), CircuitState::Closed);
    }

    #[tokio::test]
    async fn test_disabled_invoker_is_pass_through() {
        let invoker = invoker(1).with_enabled(false);
        let cancel = CancelToken::new();
        let calls = AtomicU32::new(0);

        let err = invoker
            .execute(
                || async {
                    calls.fetch_add(1, Ordering::SeqCst);
                    Err::<(), _>(CapabilityError::timeout(Duration::from_secs(1)))
                },
                &cancel,
            )
            .await
            .unwrap_err();

        assert!(matches!(err, InvokeError::Capability(_)));
        assert_eq!(calls.load(Ordering::SeqCst), 1);
        assert_eq!(invoker.stats().breaker.total_calls, 0);

        let value = invoker
            .execute(|| async { Ok::<_, CapabilityError>(7) }, &cancel)
            .await
            .unwrap();
        assert_eq!(value, 7);
    }

    #[tokio::test(start_paused = true)]
    async fn test_cancel_inside_retry_loop() {
        let invoker = invoker(5);
        let cancel = CancelToken::new();
        let trigger = cancel.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(150)).await;
            trigger.cancel();
        });

        let err = invoker
            .execute(
                || async { Err::<(), _>(CapabilityError::connection("reset")) },
                &cancel,
            )
            .await
            .unwrap_err();

        assert!(err.is_cancelled());
        assert_eq!(invoker.breaker().state(), CircuitState::Closed);
        assert_eq!(invoker.stats().breaker.failure_count, 0);
    }
}
