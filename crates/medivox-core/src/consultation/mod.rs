//! Consultation state machine.
//!
//! A consultation moves forward along a fixed graph:
//!
//! ```text
//! created -> audio_captured -> transcribed -> analyzing -> analyzed
//!         \________________/                                 |
//!                                   response_generated <-----+
//!                                           |                |
//!                                       completed <----------+
//! ```
//!
//! `failed` and `cancelled` are reachable from every non-terminal state.
//! Text consultations start at `transcribed`.

mod entity;
mod status;

pub use entity::{Consultation, ConsultationSummary, StepEntry};
pub use status::ConsultationStatus;

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Errors raised by consultation transitions.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ConsultationError {
    #[error("consultation {id} cannot move from {from} to {to}")]
    InvalidTransition {
        id: String,
        from: ConsultationStatus,
        to: ConsultationStatus,
    },

    #[error("consultation {id} is already {status}")]
    Terminal {
        id: String,
        status: ConsultationStatus,
    },
}

/// Input/output modality of a consultation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ConsultationKind {
    VoiceToVoice,
    TextToVoice,
}
