//! Runtime configuration.
//!
//! Loaded from YAML or JSON. Every field has a default, so an empty document
//! is a valid configuration. Durations are written the human way (`"30s"`,
//! `"2h"`, `"250ms"`).
//!
//! ```yaml
//! resilience:
//!   enabled: true
//!   speech_to_text:
//!     breaker: { failure_threshold: 3, timeout: 30s, half_open_max_calls: 2 }
//!     retry:
//!       max_attempts: 3
//!       backoff: { type: exponential, base: 1s, multiplier: 2.0, max_delay: 10s }
//!       attempt_timeout: 30s
//! sessions:
//!   max_age: 2h
//!   stop_policy: { kind: confidence_threshold, min_confidence: 0.7, max_answers: 8, honor_reasoner_hint: true }
//! ```

use crate::resilience::{BackoffStrategy, CircuitBreakerConfig, RetryConfig};
use medivox_core::StopRule;
use serde::{Deserialize, Serialize};
use std::path::Path;
use std::time::Duration;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("Failed to read config file: {0}")]
    Io(#[from] std::io::Error),

    #[error("Invalid YAML config: {0}")]
    Yaml(#[from] serde_yaml::Error),

    #[error("Invalid JSON config: {0}")]
    Json(#[from] serde_json::Error),

    #[error("Invalid config value for {field}: {reason}")]
    Invalid { field: String, reason: String },
}

/// Top-level runtime configuration.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RuntimeConfig {
    pub resilience: ResilienceConfig,
    pub sessions: SessionConfig,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ResilienceConfig {
    /// When false, capability calls bypass breakers and retries entirely
    pub enabled: bool,

    pub speech_to_text: CapabilityPolicy,
    pub text_to_speech: CapabilityPolicy,
    pub medical_reasoning: CapabilityPolicy,
}

impl Default for ResilienceConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            speech_to_text: CapabilityPolicy::speech(),
            text_to_speech: CapabilityPolicy::speech(),
            medical_reasoning: CapabilityPolicy::reasoning(),
        }
    }
}

/// Breaker and retry settings for one external capability.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct CapabilityPolicy {
    pub breaker: CircuitBreakerConfig,
    pub retry: RetryConfig,
}

impl CapabilityPolicy {
    pub fn speech() -> Self {
        Self {
            breaker: CircuitBreakerConfig::speech(),
            retry: RetryConfig::default(),
        }
    }

    pub fn reasoning() -> Self {
        Self {
            breaker: CircuitBreakerConfig::reasoning(),
            retry: RetryConfig::default(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SessionConfig {
    /// Interactive sessions older than this are swept
    #[serde(with = "duration_str")]
    pub max_age: Duration,

    pub stop_policy: StopRule,

    /// Upper bound on cached sessions when the cache-backed store is used
    pub max_sessions: u64,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            max_age: Duration::from_secs(2 * 60 * 60),
            stop_policy: StopRule::default(),
            max_sessions: 10_000,
        }
    }
}

impl RuntimeConfig {
    /// Parse and validate a YAML document.
    pub fn from_yaml_str(yaml: &str) -> Result<Self, ConfigError> {
        let config: Self = serde_yaml::from_str(yaml)?;
        config.validate()?;
        Ok(config)
    }

    /// Parse and validate a JSON document.
    pub fn from_json_str(json: &str) -> Result<Self, ConfigError> {
        let config: Self = serde_json::from_str(json)?;
        config.validate()?;
        Ok(config)
    }

    /// Load from a `.json` file, or YAML for any other extension.
    pub fn from_file(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let path = path.as_ref();
        let content = std::fs::read_to_string(path)?;
        match path.extension().and_then(|ext| ext.to_str()) {
            Some("json") => Self::from_json_str(&content),
            _ => Self::from_yaml_str(&content),
        }
    }

    /// Reject values the runtime cannot work with.
    pub fn validate(&self) -> Result<(), ConfigError> {
        let resilience = &self.resilience;
        for (name, policy) in [
            ("speech_to_text", &resilience.speech_to_text),
            ("text_to_speech", &resilience.text_to_speech),
            ("medical_reasoning", &resilience.medical_reasoning),
        ] {
            validate_policy(name, policy)?;
        }

        if let StopRule::ConfidenceThreshold { min_confidence, .. } = self.sessions.stop_policy {
            if !(0.0..=1.0).contains(&min_confidence) {
                return Err(invalid(
                    "sessions.stop_policy.min_confidence",
                    "must be between 0 and 1",
                ));
            }
        }
        if self.sessions.max_age.is_zero() {
            return Err(invalid("sessions.max_age", "must be greater than zero"));
        }
        Ok(())
    }
}

fn validate_policy(name: &str, policy: &CapabilityPolicy) -> Result<(), ConfigError> {
    if policy.breaker.failure_threshold == 0 {
        return Err(invalid(
            &format!("resilience.{}.breaker.failure_threshold", name),
            "must be at least 1",
        ));
    }
    if policy.breaker.half_open_max_calls == 0 {
        return Err(invalid(
            &format!("resilience.{}.breaker.half_open_max_calls", name),
            "must be at least 1",
        ));
    }
    if policy.retry.max_attempts == 0 {
        return Err(invalid(
            &format!("resilience.{}.retry.max_attempts", name),
            "must be at least 1",
        ));
    }
    if let BackoffStrategy::Exponential { multiplier, .. } = policy.retry.backoff {
        if !(multiplier >= 1.0 && multiplier.is_finite()) {
            return Err(invalid(
                &format!("resilience.{}.retry.backoff.multiplier", name),
                "must be a finite number >= 1",
            ));
        }
    }
    Ok(())
}

fn invalid(field: &str, reason: &str) -> ConfigError {
    ConfigError::Invalid {
        field: field.to_string(),
        reason: reason.to_string(),
    }
}

/// Serde helper for `Duration` fields written as `"30s"`.
pub(crate) mod duration_str {
    use serde::{Deserialize, Deserializer, Serializer};
    use std::time::Duration;

    pub fn serialize<S>(duration: &Duration, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        serializer.serialize_str(&humantime::format_duration(*duration).to_string())
    }

    pub fn deserialize<'de, D>(deserializer: D) -> Result<Duration, D::Error>
    where
        D: Deserializer<'de>,
    {
        let text = String::deserialize(deserializer)?;
        humantime::parse_duration(&text).map_err(serde::de::Error::custom)
    }
}

/// Same as [`duration_str`] for optional durations.
pub(crate) mod duration_opt_str {
    use serde::{Deserialize, Deserializer, Serializer};
    use std::time::Duration;

    pub fn serialize<S>(duration: &Option<Duration>, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        match duration {
            Some(d) => serializer.serialize_str(&humantime::format_duration(*d).to_string()),
            None => serializer.serialize_none(),
        }
    }

    pub fn deserialize<'de, D>(deserializer: D) -> Result<Option<Duration>, D::Error>
    where
        D: Deserializer<'de>,
    {
        Option::<String>::deserialize(deserializer)?
            .map(|text| humantime::parse_duration(&text).map_err(serde::de::Error::custom))
            .transpose()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        let config = RuntimeConfig::default();
        assert!(config.resilience.enabled);
        assert_eq!(config.resilience.speech_to_text.breaker.failure_threshold, 3);
        assert_eq!(config.resilience.medical_reasoning.breaker.timeout, Duration::from_secs(60));
        assert_eq!(config.resilience.text_to_speech.retry.attempt_timeout, Some(Duration::from_secs(30)));
        assert_eq!(config.sessions.max_age, Duration::from_secs(7200));
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_empty_yaml_uses_defaults() {
        let config = RuntimeConfig::from_yaml_str("{}").unwrap();
        assert_eq!(config, RuntimeConfig::default());
    }

    #[test]
    fn test_yaml_overrides() {
        let yaml = r#"
resilience:
  enabled: false
  speech_to_text:
    breaker:
      failure_threshold: 4
      timeout: 45s
      half_open_max_calls: 1
    retry:
      max_attempts: 5
      backoff:
        type: linear
        base: 100ms
        increment: 100ms
        max_delay: 1s
      attempt_timeout: null
sessions:
  max_age: 30m
  stop_policy:
    kind: answer_count
    answers: 4
"#;
        let config = RuntimeConfig::from_yaml_str(yaml).unwrap();
        let stt = &config.resilience.speech_to_text;
        assert!(!config.resilience.enabled);
        assert_eq!(stt.breaker.timeout, Duration::from_secs(45));
        assert_eq!(stt.retry.max_attempts, 5);
        assert_eq!(stt.retry.attempt_timeout, None);
        assert_eq!(stt.retry.retry_on, RetryConfig::default().retry_on);
        assert_eq!(config.sessions.max_age, Duration::from_secs(1800));
        assert_eq!(config.sessions.stop_policy, StopRule::AnswerCount { answers: 4 });
        // untouched sections keep their defaults
        assert_eq!(config.resilience.medical_reasoning, CapabilityPolicy::reasoning());
    }

    #[test]
    fn test_partial_breaker_block_keeps_defaults() {
        let yaml = "resilience:\n  medical_reasoning:\n    breaker:\n      failure_threshold: 7\n";
        let config = RuntimeConfig::from_yaml_str(yaml).unwrap();
        let breaker = &config.resilience.medical_reasoning.breaker;
        assert_eq!(breaker.failure_threshold, 7);
        assert_eq!(breaker.timeout, Duration::from_secs(60));
        assert_eq!(breaker.half_open_max_calls, 3);
    }

    #[test]
    fn test_json_round_trip_of_durations() {
        let json = serde_json::to_string(&RuntimeConfig::default()).unwrap();
        assert!(json.contains("\"30s\""));
        assert_eq!(RuntimeConfig::from_json_str(&json).unwrap(), RuntimeConfig::default());
    }

    #[test]
    fn test_validation_errors() {
        let err = RuntimeConfig::from_yaml_str(
            "resilience:\n  text_to_speech:\n    breaker:\n      failure_threshold: 0\n      timeout: 1s\n      half_open_max_calls: 1\n",
        )
        .unwrap_err();
        assert!(matches!(err, ConfigError::Invalid { ref field, .. } if field.contains("failure_threshold")));

        let mut config = RuntimeConfig::default();
        config.sessions.stop_policy = StopRule::ConfidenceThreshold {
            min_confidence: 1.5,
            max_answers: 3,
            honor_reasoner_hint: true,
        };
        assert!(config.validate().is_err());

        config.sessions.stop_policy = StopRule::default();
        config.resilience.medical_reasoning.retry.backoff = BackoffStrategy::Exponential {
            base: Duration::from_secs(1),
            multiplier: 0.5,
            max_delay: Duration::from_secs(5),
            jitter: false,
        };
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_bad_duration_rejected() {
        let err = RuntimeConfig::from_yaml_str("sessions:\n  max_age: soon\n").unwrap_err();
        assert!(matches!(err, ConfigError::Yaml(_)));
    }
}
