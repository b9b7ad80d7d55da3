//! Explicit owner of every breaker and retry policy in the process.
//!
//! Construct one at startup and pass it by `Arc` to whatever needs a
//! breaker. Nothing here is global.

use super::{
    CircuitBreaker, CircuitBreakerConfig, CircuitBreakerStats, RetryConfig, RetryPolicy,
    RetryStats,
};
use parking_lot::RwLock;
use std::collections::BTreeMap;
use std::sync::Arc;

#[derive(Debug, Default)]
pub struct ResilienceRegistry {
    breakers: RwLock<BTreeMap<String, Arc<CircuitBreaker>>>,
    policies: RwLock<BTreeMap<String, Arc<RetryPolicy>>>,
}

impl ResilienceRegistry {
    /// Create an empty registry.
    pub fn new() -> Self {
        Self::default()
    }

    /// Get the breaker registered under `name`, creating it if needed.
    ///
    /// An existing breaker is returned unchanged even if `config` differs.
    pub fn breaker(&self, name: &str, config: CircuitBreakerConfig) -> Arc<CircuitBreaker> {
        if let Some(existing) = self.breakers.read().get(name) {
            if existing.config() != &config {
                tracing::warn!(
                    breaker = name,
                    "Breaker already registered with a different config; keeping the original"
                );
            }
            return existing.clone();
        }

        self.breakers
            .write()
            .entry(name.to_string())
            .or_insert_with(|| {
                tracing::debug!(breaker = name, "Registering circuit breaker");
                Arc::new(CircuitBreaker::new(name, config))
            })
            .clone()
    }

    pub fn get_breaker(&self, name: &str) -> Option<Arc<CircuitBreaker>> {
        self.breakers.read().get(name).cloned()
    }

    pub fn remove_breaker(&self, name: &str) -> bool {
        self.breakers.write().remove(name).is_some()
    }

    /// Get the retry policy registered under `name`, creating it if needed.
    ///
    /// An existing policy is returned unchanged even if `config` differs.
    pub fn retry_policy(&self, name: &str, config: RetryConfig) -> Arc<RetryPolicy> {
        if let Some(existing) = self.policies.read().get(name) {
            if existing.config() != &config {
                tracing::warn!(
                    policy = name,
                    "Retry policy already registered with a different config; keeping the original"
                );
            }
            return existing.clone();
        }

        self.policies
            .write()
            .entry(name.to_string())
            .or_insert_with(|| {
                tracing::debug!(policy = name, "Registering retry policy");
                Arc::new(RetryPolicy::new(name, config))
            })
            .clone()
    }

    pub fn get_retry_policy(&self, name: &str) -> Option<Arc<RetryPolicy>> {
        self.policies.read().get(name).cloned()
    }

    /// Stats for every registered breaker.
    pub fn breaker_stats(&self) -> Vec<CircuitBreakerStats> {
        self.breakers.read().values().map(|b| b.get_stats()).collect()
    }

    pub fn retry_stats(&self) -> Vec<RetryStats> {
        self.policies.read().values().map(|p| p.get_stats()).collect()
    }

    /// Close every breaker and zero every retry counter.
    pub fn reset_all(&self) {
        for breaker in self.breakers.read().values() {
            breaker.reset();
        }
        for policy in self.policies.read().values() {
            policy.reset_stats();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::resilience::CircuitState;

    #[test]
    fn test_get_or_create_returns_same_instance() {
        let registry = ResilienceRegistry::new();
        let a = registry.breaker("speech_to_text", CircuitBreakerConfig::speech());
        let b = registry.breaker("speech_to_text", CircuitBreakerConfig::reasoning());

        assert!(Arc::ptr_eq(&a, &b));
        assert_eq!(b.config(), &CircuitBreakerConfig::speech());
        assert!(registry.get_breaker("text_to_speech").is_none());
    }

    #[test]
    fn test_retry_policy_keeps_first_config() {
        let registry = ResilienceRegistry::new();
        let first = RetryConfig::default();
        let other = RetryConfig {
            max_attempts: first.max_attempts + 2,
            ..RetryConfig::default()
        };

        let a = registry.retry_policy("text_to_speech", first.clone());
        let b = registry.retry_policy("text_to_speech", other);
        assert!(Arc::ptr_eq(&a, &b));
        assert_eq!(b.config(), &first);
        assert!(registry.get_retry_policy("speech_to_text").is_none());
    }

    #[test]
    fn test_stats_and_reset_all() {
        let registry = ResilienceRegistry::new();
        let breaker = registry.breaker("medical_reasoning", CircuitBreakerConfig::reasoning());
        registry.breaker("speech_to_text", CircuitBreakerConfig::speech());
        registry.retry_policy("medical_reasoning", RetryConfig::default());

        breaker.force_open();
        assert_eq!(registry.breaker_stats().len(), 2);
        assert_eq!(registry.retry_stats().len(), 1);

        registry.reset_all();
        assert_eq!(breaker.state(), CircuitState::Closed);

        assert!(registry.remove_breaker("speech_to_text"));
        assert!(!registry.remove_breaker("speech_to_text"));
        assert_eq!(registry.breaker_stats().len(), 1);
    }
}
