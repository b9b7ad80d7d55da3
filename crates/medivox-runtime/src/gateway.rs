//! Composite gateways over the capability adapters.
//!
//! [`VoiceGateway`] guards speech recognition and synthesis, each with its
//! own breaker. [`ReasoningGateway`] guards the medical reasoner and merges
//! the concurrent analysis calls into one response.

use crate::capabilities::{
    HealthReport, HealthStatus, MedicalReasoner, SessionSignal, SpeechToText, TextToSpeech,
    VoiceConfig,
};
use crate::config::ResilienceConfig;
use crate::invoker::{InvokeError, InvokerStats, ResilientInvoker};
use crate::resilience::{CancelToken, CircuitState, ResilienceRegistry};
use medivox_core::{AudioClip, MedicalResponse, PatientContext};
use serde::{Deserialize, Serialize};
use std::sync::Arc;

/// Differential diagnoses kept on a merged response.
const MAX_DIFFERENTIAL: usize = 3;

pub const SPEECH_TO_TEXT: &str = "speech_to_text";
pub const TEXT_TO_SPEECH: &str = "text_to_speech";
pub const MEDICAL_REASONING: &str = "medical_reasoning";

/// Adapter health merged with resilience statistics.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CompositeHealth {
    pub status: HealthStatus,
    pub components: Vec<HealthReport>,
    pub invokers: Vec<InvokerStats>,
}

impl CompositeHealth {
    /// Healthy only when every adapter is healthy and every breaker closed.
    /// Any unhealthy adapter makes the whole unhealthy.
    pub fn aggregate(components: Vec<HealthReport>, invokers: Vec<InvokerStats>) -> Self {
        let worst = components
            .iter()
            .map(|c| c.status)
            .max()
            .unwrap_or(HealthStatus::Healthy);
        let breakers_closed = invokers
            .iter()
            .all(|i| i.breaker.state == CircuitState::Closed);

        let status = match worst {
            HealthStatus::Unhealthy => HealthStatus::Unhealthy,
            HealthStatus::Healthy if breakers_closed => HealthStatus::Healthy,
            _ => HealthStatus::Degraded,
        };

        Self {
            status,
            components,
            invokers,
        }
    }

    pub fn is_healthy(&self) -> bool {
        self.status == HealthStatus::Healthy
    }
}

/// Speech recognition and synthesis behind their breakers.
pub struct VoiceGateway {
    stt: Arc<dyn SpeechToText>,
    tts: Arc<dyn TextToSpeech>,
    transcriber: ResilientInvoker,
    synthesizer: ResilientInvoker,
}

impl VoiceGateway {
    pub fn new(
        stt: Arc<dyn SpeechToText>,
        tts: Arc<dyn TextToSpeech>,
        registry: &ResilienceRegistry,
        config: &ResilienceConfig,
    ) -> Self {
        let transcriber = ResilientInvoker::from_registry(registry, SPEECH_TO_TEXT, &config.speech_to_text)
            .with_enabled(config.enabled);
        let synthesizer = ResilientInvoker::from_registry(registry, TEXT_TO_SPEECH, &config.text_to_speech)
            .with_enabled(config.enabled);

        Self {
            stt,
            tts,
            transcriber,
            synthesizer,
        }
    }

    /// Speech to text through the resilient invoker.
    pub async fn transcribe(&self, audio: &AudioClip, cancel: &CancelToken) -> Result<String, InvokeError> {
        let stt = &self.stt;
        self.transcriber
            .execute(|| stt.transcribe(audio), cancel)
            .await
    }

    /// Text to speech through the resilient invoker.
    pub async fn synthesize(
        &self,
        text: &str,
        voice: &VoiceConfig,
        cancel: &CancelToken,
    ) -> Result<AudioClip, InvokeError> {
        let tts = &self.tts;
        self.synthesizer
            .execute(|| tts.synthesize(text, voice), cancel)
            .await
    }

    pub fn stats(&self) -> Vec<InvokerStats> {
        vec![self.transcriber.stats(), self.synthesizer.stats()]
    }

    pub async fn health_status(&self) -> CompositeHealth {
        let (stt, tts) = tokio::join!(self.stt.health(), self.tts.health());
        CompositeHealth::aggregate(vec![stt, tts], self.stats())
    }
}

/// Medical reasoner behind one breaker shared by all its operations.
pub struct ReasoningGateway {
    reasoner: Arc<dyn MedicalReasoner>,
    invoker: ResilientInvoker,
}

impl ReasoningGateway {
    pub fn new(
        reasoner: Arc<dyn MedicalReasoner>,
        registry: &ResilienceRegistry,
        config: &ResilienceConfig,
    ) -> Self {
        let invoker =
            ResilientInvoker::from_registry(registry, MEDICAL_REASONING, &config.medical_reasoning)
                .with_enabled(config.enabled);
        Self { reasoner, invoker }
    }

    /// Run the primary analysis alongside urgency, differential and red-flag
    /// calls, then merge.
    ///
    /// Only the primary analysis is required. A failed auxiliary call is
    /// logged and its contribution skipped.
    pub async fn analyze(
        &self,
        symptoms: &str,
        patient: &PatientContext,
        cancel: &CancelToken,
    ) -> Result<MedicalResponse, InvokeError> {
        let reasoner = &self.reasoner;

        let (primary, urgency, differential, red_flags) = tokio::join!(
            self.invoker.execute(|| reasoner.analyze(symptoms, patient), cancel),
            self.invoker.execute(|| reasoner.assess_urgency(symptoms, patient), cancel),
            self.invoker.execute(|| reasoner.differential_diagnosis(symptoms, patient), cancel),
            self.invoker.execute(|| reasoner.identify_red_flags(symptoms), cancel),
        );

        let mut response = primary?;

        match urgency {
            Ok(urgency) => {
                if urgency != response.urgency {
                    tracing::debug!(
                        primary = %response.urgency,
                        assessed = %urgency,
                        "Urgency assessment overrides primary analysis"
                    );
                }
                response.urgency = urgency;
            }
            Err(e) => tracing::warn!(error = %e, "Urgency assessment failed, keeping primary urgency"),
        }

        match differential {
            Ok(candidates) => {
                response.differential = candidates.into_iter().take(MAX_DIFFERENTIAL).collect();
            }
            Err(e) => tracing::warn!(error = %e, "Differential diagnosis failed, skipping"),
        }

        match red_flags {
            Ok(flags) => {
                for flag in flags {
                    response.add_red_flag(flag);
                }
            }
            Err(e) => tracing::warn!(error = %e, "Red flag detection failed, skipping"),
        }

        Ok(response)
    }

    /// Open a reasoning session for interactive diagnosis.
    pub async fn start_session(
        &self,
        symptoms: &str,
        patient: &PatientContext,
        cancel: &CancelToken,
    ) -> Result<String, InvokeError> {
        let reasoner = &self.reasoner;
        self.invoker
            .execute(|| reasoner.start_session(symptoms, patient), cancel)
            .await
    }

    pub async fn submit_answer(
        &self,
        session: &str,
        question_id: &str,
        answer: &str,
        cancel: &CancelToken,
    ) -> Result<SessionSignal, InvokeError> {
        let reasoner = &self.reasoner;
        self.invoker
            .execute(|| reasoner.submit_answer(session, question_id, answer), cancel)
            .await
    }

    /// Final assessment for an interactive session.
    pub async fn finish_session(&self, session: &str, cancel: &CancelToken) -> Result<MedicalResponse, InvokeError> {
        let reasoner = &self.reasoner;
        self.invoker
            .execute(|| reasoner.finish_session(session), cancel)
            .await
    }

    pub fn stats(&self) -> InvokerStats {
        self.invoker.stats()
    }

    pub async fn health_status(&self) -> CompositeHealth {
        let report = self.reasoner.health().await;
        CompositeHealth::aggregate(vec![report], vec![self.stats()])
    }
}
