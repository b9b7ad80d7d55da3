//! # medivox-runtime
//!
//! Async orchestration for voice medical consultations.
//!
//! Speech recognition, speech synthesis and medical reasoning are external
//! capabilities. Every call to them goes through a circuit breaker wrapping
//! a retry policy, so transient failures are absorbed and a failing
//! dependency is cut off instead of being hammered.
//!
//! On top of that sit:
//! - [`ConsultationService`] for the voice-to-voice and text-to-voice pipelines
//! - [`InteractiveDiagnosisService`] for question/answer sessions
//! - Health and statistics surfaces for operational status endpoints
//!
//! Breakers are owned by an explicit [`ResilienceRegistry`]; there is no
//! process-global state.
//!
//! ## Example
//!
//! ```rust,no_run
//! use std::sync::Arc;
//! use medivox_core::PatientContext;
//! use medivox_runtime::capabilities::mock::{KeywordReasoner, ScriptedSpeechToText, ToneSynthesizer};
//! use medivox_runtime::{CancelToken, ConsultationService, RuntimeConfig};
//!
//! # async fn run() -> Result<(), Box<dyn std::error::Error>> {
//! let service = ConsultationService::builder()
//!     .speech_to_text(Arc::new(ScriptedSpeechToText::new("I have a fever")))
//!     .text_to_speech(Arc::new(ToneSynthesizer::new()))
//!     .reasoner(Arc::new(KeywordReasoner::new()))
//!     .config(RuntimeConfig::from_yaml_str("resilience: { enabled: true }")?)
//!     .build()?;
//!
//! let output = service
//!     .run_text("fever and a sore throat", PatientContext::default(), &CancelToken::new())
//!     .await?;
//! println!("{}", output.response.patient_friendly_text());
//! # Ok(())
//! # }
//! ```

pub mod capabilities;
pub mod config;
pub mod gateway;
pub mod invoker;
pub mod orchestrator;
pub mod resilience;
pub mod sessions;
pub mod telemetry;

// Re-export main types at crate root
pub use capabilities::{
    AudioRepository, CapabilityError, HealthReport, HealthStatus, MedicalReasoner,
    SessionSignal, SpeechToText, TextToSpeech, VoiceConfig,
};
pub use config::{CapabilityPolicy, ConfigError, ResilienceConfig, RuntimeConfig, SessionConfig};
pub use gateway::{CompositeHealth, ReasoningGateway, VoiceGateway};
pub use invoker::{InvokeError, InvokerStats, ResilientInvoker};
pub use orchestrator::{
    ConsultationOutput, ConsultationService, ConsultationServiceBuilder, PipelineError,
    PipelineStep,
};
pub use resilience::{
    BackoffStrategy, BreakerError, CancelToken, CircuitBreaker, CircuitBreakerConfig,
    CircuitBreakerStats, CircuitState, FailureKind, ResilienceRegistry, RetryConfig, RetryError,
    RetryPolicy, RetryStats, RetryableError, TripsBreaker,
};
pub use sessions::{
    AnswerOutcome, CacheStore, InMemoryStore, InteractiveDiagnosisService, KeyedStore,
    SessionError, SessionHandle, SessionStart, SessionStatus,
};
pub use telemetry::init_tracing;
