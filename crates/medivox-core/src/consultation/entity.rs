//! The consultation entity: one request tracked through the pipeline.
//!
//! Every transition stamps `updated_at` and appends exactly one entry to
//! the step log. Entries are never edited or removed.

use super::{ConsultationError, ConsultationKind, ConsultationStatus};
use crate::types::{AudioRef, MedicalResponse, MedicalSummary};
use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use uuid::Uuid;

/// One immutable record in the consultation audit trail.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StepEntry {
    /// Position in the log, starting at 0
    pub sequence: usize,
    pub step: String,
    pub description: String,
    pub status: ConsultationStatus,
    pub timestamp: DateTime<Utc>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Consultation {
    id: String,
    patient_id: Option<String>,
    kind: ConsultationKind,
    status: ConsultationStatus,
    log: Vec<StepEntry>,
    error: Option<String>,
    created_at: DateTime<Utc>,
    updated_at: DateTime<Utc>,
    completed_at: Option<DateTime<Utc>>,
    input_audio: Option<AudioRef>,
    transcript: Option<String>,
    medical_response: Option<MedicalResponse>,
    output_audio: Option<AudioRef>,

    /// Free-form annotations from callers
    pub metadata: BTreeMap<String, serde_json::Value>,
}

impl Consultation {
    /// Start a voice consultation awaiting captured audio.
    pub fn voice(patient_id: Option<String>) -> Self {
        Self::created(
            patient_id,
            ConsultationKind::VoiceToVoice,
            ConsultationStatus::Created,
            "Voice consultation created".to_string(),
        )
    }

    /// Start a text consultation. The text stands in for a transcript, so
    /// the consultation begins in `Transcribed`.
    pub fn text(patient_id: Option<String>, text: impl Into<String>) -> Self {
        let mut consultation = Self::created(
            patient_id,
            ConsultationKind::TextToVoice,
            ConsultationStatus::Transcribed,
            "Text consultation created".to_string(),
        );
        consultation.transcript = Some(text.into());
        consultation
    }

    fn created(
        patient_id: Option<String>,
        kind: ConsultationKind,
        status: ConsultationStatus,
        description: String,
    ) -> Self {
        let now = Utc::now();
        Self {
            id: Uuid::new_v4().to_string(),
            patient_id,
            kind,
            status,
            log: vec![StepEntry {
                sequence: 0,
                step: "created".to_string(),
                description,
                status,
                timestamp: now,
            }],
            error: None,
            created_at: now,
            updated_at: now,
            completed_at: None,
            input_audio: None,
            transcript: None,
            medical_response: None,
            output_audio: None,
            metadata: BTreeMap::new(),
        }
    }

    // ---------------------------------------------------------------------
    // Transitions
    // ---------------------------------------------------------------------

    /// Attach the caller audio. Only valid right after creation.
    pub fn set_audio_input(&mut self, audio: AudioRef) -> Result<(), ConsultationError> {
        let description = format!("Audio captured ({} bytes, {} ms)", audio.bytes, audio.duration_ms);
        self.transition(ConsultationStatus::AudioCaptured, "audio_captured", description)?;
        self.input_audio = Some(audio);
        Ok(())
    }

    /// Record the transcript and move to transcribed.
    pub fn set_transcription(&mut self, text: impl Into<String>) -> Result<(), ConsultationError> {
        let text = text.into();
        let preview: String = text.chars().take(50).collect();
        let description = format!("Audio transcribed: '{}...'", preview);
        self.transition(ConsultationStatus::Transcribed, "transcribed", description)?;
        self.transcript = Some(text);
        Ok(())
    }

    /// Move to analyzing.
    pub fn start_analysis(&mut self) -> Result<(), ConsultationError> {
        self.transition(
            ConsultationStatus::Analyzing,
            "analysis_started",
            "Medical analysis started".to_string(),
        )
    }

    /// Record the analysis result.
    pub fn set_medical_response(&mut self, response: MedicalResponse) -> Result<(), ConsultationError> {
        let description = format!("Medical analysis completed with {} urgency", response.urgency);
        self.transition(ConsultationStatus::Analyzed, "analysis_completed", description)?;
        self.medical_response = Some(response);
        Ok(())
    }

    pub fn set_audio_response(&mut self, audio: AudioRef) -> Result<(), ConsultationError> {
        let description = format!("Audio response generated ({} ms)", audio.duration_ms);
        self.transition(
            ConsultationStatus::ResponseGenerated,
            "audio_response_generated",
            description,
        )?;
        self.output_audio = Some(audio);
        Ok(())
    }

    pub fn complete(&mut self) -> Result<(), ConsultationError> {
        self.transition(
            ConsultationStatus::Completed,
            "completed",
            "Consultation completed".to_string(),
        )?;
        self.completed_at = Some(self.updated_at);
        Ok(())
    }

    /// Move to failed from any non-terminal state.
    pub fn fail(&mut self, reason: impl Into<String>) -> Result<(), ConsultationError> {
        let reason = reason.into();
        let description = format!("Consultation failed: {}", reason);
        self.transition(ConsultationStatus::Failed, "failed", description)?;
        self.error = Some(reason);
        Ok(())
    }

    /// Move to cancelled from any non-terminal state.
    pub fn cancel(&mut self, reason: impl Into<String>) -> Result<(), ConsultationError> {
        let description = format!("Consultation cancelled: {}", reason.into());
        self.transition(ConsultationStatus::Cancelled, "cancelled", description)
    }

    fn transition(
        &mut self,
        next: ConsultationStatus,
        step: &str,
        description: String,
    ) -> Result<(), ConsultationError> {
        if self.status.is_terminal() {
            return Err(ConsultationError::Terminal {
                id: self.id.clone(),
                status: self.status,
            });
        }
        if !self.status.can_transition_to(next) {
            return Err(ConsultationError::InvalidTransition {
                id: self.id.clone(),
                from: self.status,
                to: next,
            });
        }

        // Wall clocks can step backwards; the log must not.
        let now = Utc::now().max(self.updated_at);
        tracing::debug!(
            consultation = %self.id,
            from = %self.status,
            to = %next,
            step,
            "Consultation transition"
        );
        self.log.push(StepEntry {
            sequence: self.log.len(),
            step: step.to_string(),
            description,
            status: next,
            timestamp: now,
        });
        self.status = next;
        self.updated_at = now;
        Ok(())
    }

    // ---------------------------------------------------------------------
    // Queries
    // ---------------------------------------------------------------------

    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn patient_id(&self) -> Option<&str> {
        self.patient_id.as_deref()
    }

    pub fn kind(&self) -> ConsultationKind {
        self.kind
    }

    pub fn status(&self) -> ConsultationStatus {
        self.status
    }

    pub fn log(&self) -> &[StepEntry] {
        &self.log
    }

    pub fn error(&self) -> Option<&str> {
        self.error.as_deref()
    }

    pub fn created_at(&self) -> DateTime<Utc> {
        self.created_at
    }

    pub fn updated_at(&self) -> DateTime<Utc> {
        self.updated_at
    }

    pub fn completed_at(&self) -> Option<DateTime<Utc>> {
        self.completed_at
    }

    pub fn input_audio(&self) -> Option<&AudioRef> {
        self.input_audio.as_ref()
    }

    pub fn transcript(&self) -> Option<&str> {
        self.transcript.as_deref()
    }

    pub fn medical_response(&self) -> Option<&MedicalResponse> {
        self.medical_response.as_ref()
    }

    pub fn output_audio(&self) -> Option<&AudioRef> {
        self.output_audio.as_ref()
    }

    pub fn is_completed(&self) -> bool {
        self.status == ConsultationStatus::Completed
    }

    pub fn is_failed(&self) -> bool {
        self.status == ConsultationStatus::Failed
    }

    pub fn is_cancelled(&self) -> bool {
        self.status == ConsultationStatus::Cancelled
    }

    pub fn is_in_progress(&self) -> bool {
        !self.status.is_terminal()
    }

    /// Only defined once the consultation has completed.
    pub fn duration(&self) -> Option<Duration> {
        self.completed_at.map(|done| done - self.created_at)
    }

    pub fn requires_emergency_attention(&self) -> bool {
        self.medical_response
            .as_ref()
            .is_some_and(MedicalResponse::requires_immediate_attention)
    }

    /// Read-only view for status endpoints.
    pub fn summary(&self) -> ConsultationSummary {
        ConsultationSummary {
            id: self.id.clone(),
            patient_id: self.patient_id.clone(),
            kind: self.kind,
            status: self.status,
            created_at: self.created_at,
            updated_at: self.updated_at,
            completed_at: self.completed_at,
            duration_seconds: self
                .duration()
                .map(|d| d.num_milliseconds() as f64 / 1000.0),
            has_input_audio: self.input_audio.is_some(),
            has_transcript: self.transcript.is_some(),
            has_medical_response: self.medical_response.is_some(),
            has_output_audio: self.output_audio.is_some(),
            step_count: self.log.len(),
            error: self.error.clone(),
            medical_response: self.medical_response.as_ref().map(MedicalResponse::summary),
        }
    }
}

/// Read-only view of a consultation for status endpoints.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ConsultationSummary {
    pub id: String,
    pub patient_id: Option<String>,
    pub kind: ConsultationKind,
    pub status: ConsultationStatus,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    pub completed_at: Option<DateTime<Utc>>,
    pub duration_seconds: Option<f64>,
    pub has_input_audio: bool,
    pub has_transcript: bool,
    pub has_medical_response: bool,
    pub has_output_audio: bool,
    pub step_count: usize,
    pub error: Option<String>,
    pub medical_response: Option<MedicalSummary>,
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::{AudioClip, Urgency};
    use proptest::prelude::*;

    fn audio() -> AudioRef {
        AudioClip::new(vec![0; 3200], 16_000, 1).reference()
    }

    #[test]
    fn test_transcribe_then_fail_log() {
        let mut consultation = Consultation::voice(None);
        consultation.set_transcription("x").unwrap();
        consultation.fail("boom").unwrap();

        assert_eq!(consultation.status(), ConsultationStatus::Failed);
        assert_eq!(consultation.log().len(), 3);
        assert_eq!(consultation.log()[0].step, "created");
        assert_eq!(consultation.log()[1].step, "transcribed");
        assert_eq!(consultation.log()[2].description, "Consultation failed: boom");
        assert_eq!(consultation.error(), Some("boom"));
        assert!(!consultation.is_in_progress());
        assert!(consultation.is_failed());
    }

    #[test]
    fn test_full_voice_pipeline() {
        let mut consultation = Consultation::voice(Some("patient-1".into()));
        consultation.set_audio_input(audio()).unwrap();
        consultation.set_transcription("I have a headache").unwrap();
        consultation.start_analysis().unwrap();
        consultation
            .set_medical_response(MedicalResponse::new("Tension headache", 0.8, Urgency::Low))
            .unwrap();
        consultation.set_audio_response(audio()).unwrap();
        assert!(consultation.duration().is_none());
        consultation.complete().unwrap();

        assert!(consultation.is_completed());
        assert!(consultation.duration().is_some());
        assert_eq!(consultation.log().len(), 7);
        assert_eq!(
            consultation.log()[4].description,
            "Medical analysis completed with low urgency"
        );

        let summary = consultation.summary();
        assert!(summary.has_input_audio && summary.has_output_audio);
        assert_eq!(summary.step_count, 7);
        assert_eq!(summary.patient_id.as_deref(), Some("patient-1"));
    }

    #[test]
    fn test_text_consultation_starts_transcribed() {
        let consultation = Consultation::text(None, "sore throat");
        assert_eq!(consultation.status(), ConsultationStatus::Transcribed);
        assert_eq!(consultation.kind(), ConsultationKind::TextToVoice);
        assert_eq!(consultation.transcript(), Some("sore throat"));
        assert_eq!(consultation.log().len(), 1);
    }

    #[test]
    fn test_transcript_preview_truncated() {
        let mut consultation = Consultation::voice(None);
        let long = "a".repeat(80);
        consultation.set_transcription(long.clone()).unwrap();

        let description = &consultation.log()[1].description;
        assert_eq!(description, &format!("Audio transcribed: '{}...'", "a".repeat(50)));
        assert_eq!(consultation.transcript(), Some(long.as_str()));
    }

    #[test]
    fn test_terminal_rejects_transitions() {
        let mut consultation = Consultation::voice(None);
        consultation.cancel("caller went away").unwrap();

        let err = consultation.fail("late").unwrap_err();
        assert!(matches!(err, ConsultationError::Terminal { .. }));
        assert_eq!(consultation.log().len(), 2);
        assert!(consultation.error().is_none());
    }

    #[test]
    fn test_out_of_order_transition_rejected() {
        let mut consultation = Consultation::voice(None);
        let err = consultation.start_analysis().unwrap_err();
        assert!(matches!(
            err,
            ConsultationError::InvalidTransition {
                from: ConsultationStatus::Created,
                to: ConsultationStatus::Analyzing,
                ..
            }
        ));
        assert_eq!(consultation.log().len(), 1);
    }

    #[test]
    fn test_emergency_delegates_to_response() {
        let mut consultation = Consultation::text(None, "crushing chest pain");
        assert!(!consultation.requires_emergency_attention());
        consultation.start_analysis().unwrap();
        consultation
            .set_medical_response(MedicalResponse::new("Possible MI", 0.7, Urgency::Emergency))
            .unwrap();
        assert!(consultation.requires_emergency_attention());
    }

    fn apply(consultation: &mut Consultation, op: u8) -> Result<(), ConsultationError> {
        match op % 8 {
            0 => consultation.set_audio_input(audio()),
            1 => consultation.set_transcription("text"),
            2 => consultation.start_analysis(),
            3 => consultation.set_medical_response(MedicalResponse::new("d", 0.5, Urgency::Low)),
            4 => consultation.set_audio_response(audio()),
            5 => consultation.complete(),
            6 => consultation.fail("err"),
            _ => consultation.cancel("stop"),
        }
    }

    proptest! {
        #[test]
        fn prop_log_is_append_only(ops in proptest::collection::vec(any::<u8>(), 0..24)) {
            let mut consultation = Consultation::voice(None);
            let mut accepted = 0usize;
            let mut terminal_seen = 0usize;

            for op in ops {
                let before = consultation.status();
                if apply(&mut consultation, op).is_ok() {
                    accepted += 1;
                    prop_assert!(before.can_transition_to(consultation.status()));
                    if consultation.status().is_terminal() {
                        terminal_seen += 1;
                    }
                } else {
                    prop_assert_eq!(before, consultation.status());
                }
            }

            prop_assert_eq!(consultation.log().len(), accepted + 1);
            prop_assert!(terminal_seen <= 1);
            for (i, pair) in consultation.log().windows(2).enumerate() {
                prop_assert_eq!(pair[0].sequence, i);
                prop_assert!(pair[0].timestamp <= pair[1].timestamp);
            }
            prop_assert_eq!(
                consultation.log().last().map(|e| e.status),
                Some(consultation.status())
            );
        }
    }
}
