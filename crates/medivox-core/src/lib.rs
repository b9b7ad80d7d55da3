//! # medivox-core
//!
//! Deterministic domain logic for voice medical consultations.
//!
//! This crate owns everything that does not need an async runtime:
//! - The consultation state machine and its append-only step log
//! - Interactive diagnosis question rules and per-session state
//! - Stop policies for ending a question/answer exchange
//! - Stage-based progress estimates
//!
//! Calls to external capabilities, resilience and storage live in
//! `medivox-runtime`.
//!
//! ## Example
//!
//! ```rust
//! use medivox_core::{Consultation, ConsultationStatus};
//!
//! let mut consultation = Consultation::voice(None);
//! consultation.set_transcription("I have had a fever since yesterday").unwrap();
//! consultation.fail("reasoning backend unavailable").unwrap();
//!
//! assert_eq!(consultation.status(), ConsultationStatus::Failed);
//! assert_eq!(consultation.log().len(), 3);
//! assert!(!consultation.is_in_progress());
//! ```

pub mod consultation;
pub mod diagnosis;
pub mod progress;
pub mod types;

// Re-export main types at crate root
pub use consultation::{
    Consultation, ConsultationError, ConsultationKind, ConsultationStatus, ConsultationSummary,
    StepEntry,
};
pub use diagnosis::{
    Answer, DiagnosisError, DiagnosisSession, Question, QuestionKind, StopContext, StopPolicy,
    StopRule,
};
pub use progress::{ProgressSnapshot, ProgressStage, ProgressState, ProgressTracker};
pub use types::{
    AudioClip, AudioRef, ConfidenceLevel, MedicalResponse, MedicalSummary, PatientContext,
    Urgency,
};
