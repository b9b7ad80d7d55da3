//! External capability interfaces.
//!
//! Speech recognition, speech synthesis, medical reasoning and audio
//! persistence are consumed through these traits. Implementations own the
//! actual model or network calls and classify their own failures through
//! [`CapabilityError`].

use crate::resilience::{FailureKind, RetryableError, TripsBreaker};
use async_trait::async_trait;
use medivox_core::{AudioClip, MedicalResponse, PatientContext, Urgency};
use serde::{Deserialize, Serialize};
use std::time::Duration;
use thiserror::Error;

pub mod mock;

/// Failure reported by a capability adapter.
///
/// `retryable` is decided by the adapter; the retry policy never inspects
/// error types.
#[derive(Error, Debug, Clone, PartialEq)]
#[error("{kind} failure: {message}")]
pub struct CapabilityError {
    pub kind: FailureKind,
    pub message: String,
    pub retryable: bool,
}

impl CapabilityError {
    /// Retryability follows the kind's default.
    pub fn new(kind: FailureKind, message: impl Into<String>) -> Self {
        Self {
            kind,
            message: message.into(),
            retryable: kind.is_transient(),
        }
    }

    pub fn timeout(after: Duration) -> Self {
        Self::new(FailureKind::Timeout, format!("timed out after {:?}", after))
    }

    pub fn connection(message: impl Into<String>) -> Self {
        Self::new(FailureKind::Connection, message)
    }

    pub fn unavailable(message: impl Into<String>) -> Self {
        Self::new(FailureKind::Unavailable, message)
    }

    pub fn rate_limited(message: impl Into<String>) -> Self {
        Self::new(FailureKind::RateLimited, message)
    }

    pub fn invalid_input(message: impl Into<String>) -> Self {
        Self::new(FailureKind::InvalidInput, message)
    }

    pub fn quality(message: impl Into<String>) -> Self {
        Self::new(FailureKind::Quality, message)
    }

    pub fn internal(message: impl Into<String>) -> Self {
        Self::new(FailureKind::Internal, message)
    }

    /// Override the adapter's retry classification.
    pub fn with_retryable(mut self, retryable: bool) -> Self {
        self.retryable = retryable;
        self
    }
}

impl RetryableError for CapabilityError {
    fn is_retryable(&self) -> bool {
        self.retryable
    }

    fn kind(&self) -> FailureKind {
        self.kind
    }

    fn timed_out(after: Duration) -> Self {
        Self::timeout(after)
    }
}

/// Used when a breaker wraps an adapter directly, without a retry policy.
impl TripsBreaker for CapabilityError {
    fn trips_breaker(&self) -> bool {
        self.retryable
    }
}

/// Speech synthesis settings.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct VoiceConfig {
    pub voice: String,
    pub language: String,

    /// 1.0 is normal speed
    pub speed: f32,

    pub sample_rate: u32,
}

impl Default for VoiceConfig {
    fn default() -> Self {
        Self {
            voice: "default".to_string(),
            language: "en".to_string(),
            speed: 1.0,
            sample_rate: 16_000,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum HealthStatus {
    Healthy,
    Degraded,
    Unhealthy,
}

/// Self-reported health of one adapter.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct HealthReport {
    pub name: String,
    pub status: HealthStatus,
    pub detail: Option<String>,
}

impl HealthReport {
    pub fn healthy(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            status: HealthStatus::Healthy,
            detail: None,
        }
    }

    pub fn unhealthy(name: impl Into<String>, detail: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            status: HealthStatus::Unhealthy,
            detail: Some(detail.into()),
        }
    }
}

/// Reasoner feedback after an interactive answer.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct SessionSignal {
    /// Updated confidence in `[0, 1]`
    pub confidence: f64,

    /// Answers the reasoner considered informative so far
    pub evidence_count: usize,

    /// The reasoner has seen enough
    pub should_stop: bool,
}

#[async_trait]
pub trait SpeechToText: Send + Sync {
    async fn transcribe(&self, audio: &AudioClip) -> Result<String, CapabilityError>;

    async fn health(&self) -> HealthReport;

    fn name(&self) -> &str;
}

#[async_trait]
pub trait TextToSpeech: Send + Sync {
    async fn synthesize(&self, text: &str, voice: &VoiceConfig) -> Result<AudioClip, CapabilityError>;

    async fn health(&self) -> HealthReport;

    fn name(&self) -> &str;
}

/// Medical reasoning model.
///
/// Besides one-shot analysis it hosts interactive sessions whose internals
/// stay behind an opaque session handle.
#[async_trait]
pub trait MedicalReasoner: Send + Sync {
    async fn analyze(
        &self,
        symptoms: &str,
        patient: &PatientContext,
    ) -> Result<MedicalResponse, CapabilityError>;

    async fn assess_urgency(
        &self,
        symptoms: &str,
        patient: &PatientContext,
    ) -> Result<Urgency, CapabilityError>;

    /// Candidate diagnoses, most likely first.
    async fn differential_diagnosis(
        &self,
        symptoms: &str,
        patient: &PatientContext,
    ) -> Result<Vec<String>, CapabilityError>;

    async fn identify_red_flags(&self, symptoms: &str) -> Result<Vec<String>, CapabilityError>;

    /// Open an interactive session and return its handle.
    async fn start_session(
        &self,
        symptoms: &str,
        patient: &PatientContext,
    ) -> Result<String, CapabilityError>;

    async fn submit_answer(
        &self,
        session: &str,
        question_id: &str,
        answer: &str,
    ) -> Result<SessionSignal, CapabilityError>;

    /// Final assessment; the handle is invalid afterwards.
    async fn finish_session(&self, session: &str) -> Result<MedicalResponse, CapabilityError>;

    async fn health(&self) -> HealthReport;

    fn name(&self) -> &str;
}

/// Opaque audio persistence. Written as a side effect, never read back by
/// the pipeline.
#[async_trait]
pub trait AudioRepository: Send + Sync {
    async fn save(&self, audio: &AudioClip) -> Result<(), CapabilityError>;

    async fn load(&self, id: &str) -> Result<Option<AudioClip>, CapabilityError>;

    fn name(&self) -> &str;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_retryable_follows_kind() {
        assert!(CapabilityError::timeout(Duration::from_secs(1)).retryable);
        assert!(CapabilityError::rate_limited("slow down").retryable);
        assert!(!CapabilityError::invalid_input("empty audio").retryable);
        assert!(!CapabilityError::quality("low confidence").retryable);
        assert!(CapabilityError::internal("oops").with_retryable(true).is_retryable());
    }

    #[test]
    fn test_error_display() {
        let err = CapabilityError::connection("reset by peer");
        assert_eq!(err.to_string(), "connection failure: reset by peer");
    }

    #[test]
    fn test_health_ordering() {
        assert!(HealthStatus::Unhealthy > HealthStatus::Degraded);
        assert!(HealthStatus::Degraded > HealthStatus::Healthy);
    }
}
