//! Consultation lifecycle states and the transition graph between them.

use serde::{Deserialize, Serialize};
use std::fmt;

/// Where a consultation currently sits in the pipeline.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ConsultationStatus {
    Created,
    AudioCaptured,
    Transcribed,
    Analyzing,
    Analyzed,
    ResponseGenerated,
    Completed,
    Failed,
    Cancelled,
}

impl ConsultationStatus {
    /// Terminal states accept no further transitions.
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            ConsultationStatus::Completed | ConsultationStatus::Failed | ConsultationStatus::Cancelled
        )
    }

    /// Whether `next` is reachable from `self` in one step.
    pub fn can_transition_to(&self, next: ConsultationStatus) -> bool {
        use ConsultationStatus::*;

        if self.is_terminal() {
            return false;
        }
        if matches!(next, Failed | Cancelled) {
            return true;
        }
        matches!(
            (self, next),
            (Created, AudioCaptured)
                | (Created, Transcribed)
                | (AudioCaptured, Transcribed)
                | (Transcribed, Analyzing)
                | (Analyzing, Analyzed)
                | (Analyzed, ResponseGenerated)
                | (Analyzed, Completed)
                | (ResponseGenerated, Completed)
        )
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            ConsultationStatus::Created => "created",
            ConsultationStatus::AudioCaptured => "audio_captured",
            ConsultationStatus::Transcribed => "transcribed",
            ConsultationStatus::Analyzing => "analyzing",
            ConsultationStatus::Analyzed => "analyzed",
            ConsultationStatus::ResponseGenerated => "response_generated",
            ConsultationStatus::Completed => "completed",
            ConsultationStatus::Failed => "failed",
            ConsultationStatus::Cancelled => "cancelled",
        }
    }
}

impl fmt::Display for ConsultationStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}
