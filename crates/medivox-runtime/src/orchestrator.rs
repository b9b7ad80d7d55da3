//! Consultation pipelines.
//!
//! The service drives a [`Consultation`] through its state machine:
//! - Voice: audio → transcribe → analyze → synthesize → complete
//! - Text: text → analyze → synthesize → complete
//!
//! A snapshot is written to the consultation store after every transition.
//! A failing step records FAILED on the consultation before the error is
//! returned; a cancelled request records CANCELLED.

use backon::{ExponentialBuilder, Retryable};
use futures::future::join_all;
use parking_lot::RwLock;
use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;

use medivox_core::{
    AudioClip, Consultation, ConsultationError, ConsultationSummary, MedicalResponse,
    PatientContext, ProgressSnapshot, ProgressStage, ProgressTracker,
};

use crate::capabilities::{
    AudioRepository, CapabilityError, MedicalReasoner, SpeechToText, TextToSpeech, VoiceConfig,
};
use crate::config::RuntimeConfig;
use crate::gateway::{CompositeHealth, ReasoningGateway, VoiceGateway};
use crate::invoker::InvokeError;
use crate::resilience::{CancelToken, ResilienceRegistry};
use crate::sessions::{InMemoryStore, InteractiveDiagnosisService, KeyedStore};

/// Pipeline step that produced an error.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PipelineStep {
    Intake,
    Transcription,
    Analysis,
    Synthesis,
}

impl fmt::Display for PipelineStep {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            PipelineStep::Intake => write!(f, "intake"),
            PipelineStep::Transcription => write!(f, "transcription"),
            PipelineStep::Analysis => write!(f, "analysis"),
            PipelineStep::Synthesis => write!(f, "synthesis"),
        }
    }
}

/// Errors from the consultation service.
#[derive(Error, Debug)]
pub enum PipelineError {
    #[error("consultation {consultation_id} failed during {step}: {source}")]
    Step {
        consultation_id: String,
        step: PipelineStep,
        #[source]
        source: InvokeError,
    },

    #[error("consultation {consultation_id} cancelled during {step}")]
    Cancelled {
        consultation_id: String,
        step: PipelineStep,
    },

    #[error(transparent)]
    Transition(#[from] ConsultationError),

    #[error("Consultation service not configured: {0}")]
    NotConfigured(String),
}

impl PipelineError {
    /// True when the failure came from an unavailable dependency rather
    /// than from the request.
    pub fn is_degraded(&self) -> bool {
        matches!(self, PipelineError::Step { source, .. } if source.is_degraded())
    }
}

/// Result of a finished pipeline run.
#[derive(Debug, Clone)]
pub struct ConsultationOutput {
    pub consultation: Consultation,
    pub response: MedicalResponse,
    pub audio: AudioClip,
}

/// Runs consultations end to end.
pub struct ConsultationService {
    voice: Arc<VoiceGateway>,
    reasoning: Arc<ReasoningGateway>,
    audio_repository: Option<Arc<dyn AudioRepository>>,
    consultations: Arc<dyn KeyedStore<Consultation>>,
    progress: RwLock<HashMap<String, ProgressTracker>>,
    sessions: InteractiveDiagnosisService,
    registry: Arc<ResilienceRegistry>,
    voice_config: VoiceConfig,
}

impl ConsultationService {
    /// Start building a service.
    pub fn builder() -> ConsultationServiceBuilder {
        ConsultationServiceBuilder::new()
    }

    /// Interactive diagnosis sharing this service's reasoning gateway.
    pub fn sessions(&self) -> &InteractiveDiagnosisService {
        &self.sessions
    }

    pub fn registry(&self) -> &Arc<ResilienceRegistry> {
        &self.registry
    }

    /// Voice-to-voice consultation.
    pub async fn run_voice(
        &self,
        audio: AudioClip,
        patient: PatientContext,
        cancel: &CancelToken,
    ) -> Result<ConsultationOutput, PipelineError> {
        let mut consultation = Consultation::voice(patient.patient_id.clone());
        self.begin(&consultation, ProgressTracker::voice_consultation()).await;
        tracing::info!(
            consultation = %consultation.id(),
            bytes = audio.data.len(),
            "Voice consultation started"
        );

        consultation.set_audio_input(audio.reference())?;
        self.persist(&consultation).await;
        self.save_audio(&audio).await;

        self.enter(consultation.id(), ProgressStage::Transcribing);
        let transcript = self
            .voice
            .transcribe(&audio, cancel)
            .await
            .and_then(|text| {
                if text.trim().is_empty() {
                    Err(CapabilityError::invalid_input("transcript is empty").into())
                } else {
                    Ok(text)
                }
            });
        let transcript = match transcript {
            Ok(text) => text,
            Err(e) => return Err(self.abort(&mut consultation, PipelineStep::Transcription, e, cancel).await),
        };
        consultation.set_transcription(transcript.clone())?;
        self.persist(&consultation).await;

        self.respond(consultation, &transcript, &patient, cancel).await
    }

    /// Text-to-voice consultation. The text stands in for a transcript.
    pub async fn run_text(
        &self,
        text: &str,
        patient: PatientContext,
        cancel: &CancelToken,
    ) -> Result<ConsultationOutput, PipelineError> {
        let mut consultation = Consultation::text(patient.patient_id.clone(), text);
        self.begin(&consultation, ProgressTracker::text_consultation()).await;
        tracing::info!(consultation = %consultation.id(), "Text consultation started");

        if text.trim().is_empty() {
            let err = CapabilityError::invalid_input("consultation text is empty").into();
            return Err(self.abort(&mut consultation, PipelineStep::Intake, err, cancel).await);
        }

        self.respond(consultation, text, &patient, cancel).await
    }

    /// Shared tail of both pipelines: analyze, synthesize, complete.
    async fn respond(
        &self,
        mut consultation: Consultation,
        symptoms: &str,
        patient: &PatientContext,
        cancel: &CancelToken,
    ) -> Result<ConsultationOutput, PipelineError> {
        consultation.start_analysis()?;
        self.persist(&consultation).await;
        self.enter(consultation.id(), ProgressStage::AnalyzingSymptoms);

        let response = match self.reasoning.analyze(symptoms, patient, cancel).await {
            Ok(response) => response,
            Err(e) => return Err(self.abort(&mut consultation, PipelineStep::Analysis, e, cancel).await),
        };
        consultation.set_medical_response(response.clone())?;
        self.persist(&consultation).await;
        if response.requires_immediate_attention() {
            tracing::warn!(
                consultation = %consultation.id(),
                urgency = %response.urgency,
                red_flags = response.red_flags.len(),
                "Consultation requires immediate attention"
            );
        }

        self.enter(consultation.id(), ProgressStage::Synthesizing);
        let text = response.patient_friendly_text();
        let audio = match self.voice.synthesize(&text, &self.voice_config, cancel).await {
            Ok(audio) => audio,
            Err(e) => return Err(self.abort(&mut consultation, PipelineStep::Synthesis, e, cancel).await),
        };
        consultation.set_audio_response(audio.reference())?;
        self.persist(&consultation).await;
        self.save_audio(&audio).await;

        self.enter(consultation.id(), ProgressStage::Finalizing);
        consultation.complete()?;
        self.persist(&consultation).await;
        if let Some(tracker) = self.progress.write().get_mut(consultation.id()) {
            tracker.complete_at(now());
        }

        tracing::info!(
            consultation = %consultation.id(),
            urgency = %response.urgency,
            steps = consultation.log().len(),
            "Consultation completed"
        );

        Ok(ConsultationOutput {
            consultation,
            response,
            audio,
        })
    }

    /// Record FAILED or CANCELLED, persist, and build the caller's error.
    async fn abort(
        &self,
        consultation: &mut Consultation,
        step: PipelineStep,
        error: InvokeError,
        cancel: &CancelToken,
    ) -> PipelineError {
        let consultation_id = consultation.id().to_string();
        if let Some(tracker) = self.progress.write().get_mut(&consultation_id) {
            tracker.fail_at(now());
        }

        if error.is_cancelled() || cancel.is_cancelled() {
            if let Err(e) = consultation.cancel(format!("request cancelled during {}", step)) {
                tracing::warn!(consultation = %consultation_id, error = %e, "Could not record cancellation");
            }
            self.persist(consultation).await;
            tracing::info!(consultation = %consultation_id, step = %step, "Consultation cancelled");
            return PipelineError::Cancelled {
                consultation_id,
                step,
            };
        }

        if let Err(e) = consultation.fail(error.to_string()) {
            tracing::warn!(consultation = %consultation_id, error = %e, "Could not record failure");
        }
        self.persist(consultation).await;
        tracing::error!(
            consultation = %consultation_id,
            step = %step,
            degraded = error.is_degraded(),
            error = %error,
            "Consultation failed"
        );

        PipelineError::Step {
            consultation_id,
            step,
            source: error,
        }
    }

    async fn begin(&self, consultation: &Consultation, mut tracker: ProgressTracker) {
        tracker.enter_at(ProgressStage::Initializing, now());
        self.progress
            .write()
            .insert(consultation.id().to_string(), tracker);
        self.persist(consultation).await;
    }

    fn enter(&self, consultation_id: &str, stage: ProgressStage) {
        if let Some(tracker) = self.progress.write().get_mut(consultation_id) {
            tracker.enter_at(stage, now());
        }
    }

    async fn persist(&self, consultation: &Consultation) {
        self.consultations
            .put(consultation.id().to_string(), consultation.clone())
            .await;
    }

    /// Best effort; the pipeline never waits on a failed save.
    async fn save_audio(&self, audio: &AudioClip) {
        let Some(repository) = &self.audio_repository else {
            return;
        };

        let result = (|| repository.save(audio))
            .retry(
                ExponentialBuilder::default()
                    .with_min_delay(Duration::from_millis(50))
                    .with_max_times(2),
            )
            .when(|e: &CapabilityError| e.retryable)
            .notify(|e: &CapabilityError, delay: Duration| {
                tracing::debug!(audio = %audio.id, error = %e, delay = ?delay, "Retrying audio save");
            })
            .await;

        if let Err(e) = result {
            tracing::warn!(
                audio = %audio.id,
                repository = repository.name(),
                error = %e,
                "Failed to save audio"
            );
        }
    }

    pub async fn get(&self, consultation_id: &str) -> Option<Consultation> {
        self.consultations.get(consultation_id).await
    }

    /// Read-only summary of a stored consultation.
    pub async fn summary(&self, consultation_id: &str) -> Option<ConsultationSummary> {
        self.get(consultation_id).await.map(|c| c.summary())
    }

    /// Summaries of every stored consultation, oldest first.
    pub async fn summaries(&self) -> Vec<ConsultationSummary> {
        let keys = self.consultations.keys().await;
        let mut summaries: Vec<ConsultationSummary> =
            join_all(keys.iter().map(|id| self.consultations.get(id)))
                .await
                .into_iter()
                .flatten()
                .map(|c| c.summary())
                .collect();
        summaries.sort_by_key(|s| s.created_at);
        summaries
    }

    /// Latest progress snapshot for a consultation.
    pub fn progress(&self, consultation_id: &str) -> Option<ProgressSnapshot> {
        self.progress
            .read()
            .get(consultation_id)
            .map(|tracker| tracker.snapshot_at(now()))
    }

    /// Drop progress trackers and stored consultations that finished.
    pub async fn forget_finished(&self) -> usize {
        let removed = self
            .consultations
            .sweep(&|c: &Consultation| !c.is_in_progress())
            .await;
        let live = self.consultations.keys().await;
        self.progress.write().retain(|id, _| live.contains(id));
        removed
    }

    /// Aggregate health of every capability and breaker.
    pub async fn health_status(&self) -> CompositeHealth {
        let (voice, reasoning) = tokio::join!(self.voice.health_status(), self.reasoning.health_status());
        let mut components = voice.components;
        components.extend(reasoning.components);
        let mut invokers = voice.invokers;
        invokers.extend(reasoning.invokers);
        CompositeHealth::aggregate(components, invokers)
    }
}

/// Progress trackers use std instants; take them from tokio's clock so
/// paused-time tests see consistent values.
fn now() -> std::time::Instant {
    tokio::time::Instant::now().into_std()
}

/// Builder for ConsultationService.
pub struct ConsultationServiceBuilder {
    speech_to_text: Option<Arc<dyn SpeechToText>>,
    text_to_speech: Option<Arc<dyn TextToSpeech>>,
    reasoner: Option<Arc<dyn MedicalReasoner>>,
    audio_repository: Option<Arc<dyn AudioRepository>>,
    consultations: Option<Arc<dyn KeyedStore<Consultation>>>,
    registry: Option<Arc<ResilienceRegistry>>,
    config: RuntimeConfig,
    voice_config: VoiceConfig,
}

impl ConsultationServiceBuilder {
    pub fn new() -> Self {
        Self {
            speech_to_text: None,
            text_to_speech: None,
            reasoner: None,
            audio_repository: None,
            consultations: None,
            registry: None,
            config: RuntimeConfig::default(),
            voice_config: VoiceConfig::default(),
        }
    }

    pub fn speech_to_text(mut self, stt: Arc<dyn SpeechToText>) -> Self {
        self.speech_to_text = Some(stt);
        self
    }

    pub fn text_to_speech(mut self, tts: Arc<dyn TextToSpeech>) -> Self {
        self.text_to_speech = Some(tts);
        self
    }

    pub fn reasoner(mut self, reasoner: Arc<dyn MedicalReasoner>) -> Self {
        self.reasoner = Some(reasoner);
        self
    }

    pub fn audio_repository(mut self, repository: Arc<dyn AudioRepository>) -> Self {
        self.audio_repository = Some(repository);
        self
    }

    /// Defaults to an in-memory store.
    pub fn consultation_store(mut self, store: Arc<dyn KeyedStore<Consultation>>) -> Self {
        self.consultations = Some(store);
        self
    }

    /// Share breakers with other services. Defaults to a fresh registry.
    pub fn registry(mut self, registry: Arc<ResilienceRegistry>) -> Self {
        self.registry = Some(registry);
        self
    }

    pub fn config(mut self, config: RuntimeConfig) -> Self {
        self.config = config;
        self
    }

    pub fn voice(mut self, voice_config: VoiceConfig) -> Self {
        self.voice_config = voice_config;
        self
    }

    /// Build the service. Fails if an adapter is missing.
    pub fn build(self) -> Result<ConsultationService, PipelineError> {
        let stt = self
            .speech_to_text
            .ok_or_else(|| PipelineError::NotConfigured("no speech-to-text adapter".to_string()))?;
        let tts = self
            .text_to_speech
            .ok_or_else(|| PipelineError::NotConfigured("no text-to-speech adapter".to_string()))?;
        let reasoner = self
            .reasoner
            .ok_or_else(|| PipelineError::NotConfigured("no medical reasoner".to_string()))?;

        let registry = self.registry.unwrap_or_default();
        let voice = Arc::new(VoiceGateway::new(stt, tts, &registry, &self.config.resilience));
        let reasoning = Arc::new(ReasoningGateway::new(reasoner, &registry, &self.config.resilience));
        let sessions = InteractiveDiagnosisService::from_config(reasoning.clone(), &self.config.sessions);
        let consultations = self
            .consultations
            .unwrap_or_else(|| Arc::new(InMemoryStore::<Consultation>::new()));

        tracing::info!(
            resilience = self.config.resilience.enabled,
            audio_repository = self.audio_repository.is_some(),
            "Consultation service ready"
        );

        Ok(ConsultationService {
            voice,
            reasoning,
            audio_repository: self.audio_repository,
            consultations,
            progress: RwLock::new(HashMap::new()),
            sessions,
            registry,
            voice_config: self.voice_config,
        })
    }
}

impl Default for ConsultationServiceBuilder {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::capabilities::mock::{
        InMemoryAudioRepository, KeywordReasoner, ScriptedSpeechToText, ToneSynthesizer,
    };
    use crate::capabilities::HealthStatus;
    use crate::resilience::CircuitState;
    use medivox_core::{ConsultationStatus, ProgressState, Urgency};

    struct Fixture {
        stt: Arc<ScriptedSpeechToText>,
        tts: Arc<ToneSynthesizer>,
        reasoner: Arc<KeywordReasoner>,
        audio: Arc<InMemoryAudioRepository>,
    }

    impl Fixture {
        fn new(transcript: &str) -> Self {
            Self {
                stt: Arc::new(ScriptedSpeechToText::new(transcript)),
                tts: Arc::new(ToneSynthesizer::new()),
                reasoner: Arc::new(KeywordReasoner::new()),
                audio: Arc::new(InMemoryAudioRepository::new()),
            }
        }

        fn service(&self) -> ConsultationService {
            ConsultationService::builder()
                .speech_to_text(self.stt.clone())
                .text_to_speech(self.tts.clone())
                .reasoner(self.reasoner.clone())
                .audio_repository(self.audio.clone())
                .build()
                .unwrap()
        }
    }

    fn spoken() -> AudioClip {
        AudioClip::new(vec![1; 32_000], 16_000, 1)
    }

    #[tokio::test(start_paused = true)]
    async fn test_voice_pipeline_completes() {
        let fixture = Fixture::new("I have a fever and a cough");
        let service = fixture.service();

        let output = service
            .run_voice(spoken(), PatientContext::default(), &CancelToken::new())
            .await
            .unwrap();

        let consultation = &output.consultation;
        assert_eq!(consultation.status(), ConsultationStatus::Completed);
        let steps: Vec<&str> = consultation.log().iter().map(|e| e.step.as_str()).collect();
        assert_eq!(
            steps,
            vec![
                "created",
                "audio_captured",
                "transcribed",
                "analysis_started",
                "analysis_completed",
                "audio_response_generated",
                "completed"
            ]
        );
        assert_eq!(output.response.urgency, Urgency::Moderate);
        assert!(!output.audio.is_empty());
        // input and synthesized audio
        assert_eq!(fixture.audio.len(), 2);

        let summary = service.summary(consultation.id()).await.unwrap();
        assert!(summary.has_output_audio);
        assert_eq!(summary.step_count, 7);

        let progress = service.progress(consultation.id()).unwrap();
        assert_eq!(progress.state, ProgressState::Completed);
        assert_eq!(progress.percentage, 100.0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_text_pipeline_skips_transcription() {
        let fixture = Fixture::new("unused");
        let service = fixture.service();

        let output = service
            .run_text("Crushing chest pain", PatientContext::with_age(58), &CancelToken::new())
            .await
            .unwrap();

        assert_eq!(output.consultation.log().len(), 5);
        assert!(output.consultation.requires_emergency_attention());
        assert_eq!(fixture.stt.failures.calls(), 0);
        assert!(output.response.patient_friendly_text().starts_with("Please seek emergency care"));
    }

    #[tokio::test(start_paused = true)]
    async fn test_failure_recorded_before_error() {
        let fixture = Fixture::new("fever");
        fixture
            .reasoner
            .failures
            .fail_always(CapabilityError::unavailable("model offline"));
        let service = fixture.service();

        let err = service
            .run_text("fever", PatientContext::default(), &CancelToken::new())
            .await
            .unwrap_err();

        let PipelineError::Step {
            consultation_id,
            step,
            ..
        } = &err
        else {
            panic!("unexpected error: {err}");
        };
        assert_eq!(*step, PipelineStep::Analysis);
        assert!(err.is_degraded());

        let stored = service.get(consultation_id).await.unwrap();
        assert_eq!(stored.status(), ConsultationStatus::Failed);
        assert!(stored.error().unwrap().contains("model offline"));
        assert_eq!(
            service.progress(consultation_id).unwrap().state,
            ProgressState::Failed
        );
    }

    #[tokio::test(start_paused = true)]
    async fn test_empty_transcript_is_invalid_input() {
        let fixture = Fixture::new("   ");
        let service = fixture.service();

        let err = service
            .run_voice(spoken(), PatientContext::default(), &CancelToken::new())
            .await
            .unwrap_err();

        assert!(matches!(
            err,
            PipelineError::Step {
                step: PipelineStep::Transcription,
                source: InvokeError::Capability(_),
                ..
            }
        ));
        assert!(!err.is_degraded());
        // a bad transcript is the caller's problem, not the dependency's
        assert_eq!(fixture.stt.failures.calls(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_cancel_records_cancelled() {
        let fixture = Fixture::new("fever");
        let slow = Arc::new(KeywordReasoner::new().with_latency(Duration::from_secs(5)));
        let service = ConsultationService::builder()
            .speech_to_text(fixture.stt.clone())
            .text_to_speech(fixture.tts.clone())
            .reasoner(slow)
            .build()
            .unwrap();

        let cancel = CancelToken::new();
        let trigger = cancel.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_secs(1)).await;
            trigger.cancel();
        });

        let err = service
            .run_text("fever", PatientContext::default(), &cancel)
            .await
            .unwrap_err();
        let PipelineError::Cancelled {
            consultation_id,
            step,
        } = err
        else {
            panic!("expected cancellation");
        };
        assert_eq!(step, PipelineStep::Analysis);
        let stored = service.get(&consultation_id).await.unwrap();
        assert_eq!(stored.status(), ConsultationStatus::Cancelled);
    }

    #[tokio::test(start_paused = true)]
    async fn test_audio_save_failure_is_not_fatal() {
        let fixture = Fixture::new("headache");
        fixture
            .audio
            .failures
            .fail_always(CapabilityError::connection("disk offline"));
        let service = fixture.service();

        let output = service
            .run_voice(spoken(), PatientContext::default(), &CancelToken::new())
            .await
            .unwrap();

        assert!(output.consultation.is_completed());
        assert!(fixture.audio.is_empty());
        // first try plus two retries, for input and output audio
        assert_eq!(fixture.audio.failures.calls(), 6);
    }

    #[tokio::test(start_paused = true)]
    async fn test_open_breaker_reported_in_health() {
        let fixture = Fixture::new("fever");
        let service = fixture.service();
        assert_eq!(service.health_status().await.status, HealthStatus::Healthy);

        service
            .registry()
            .get_breaker(crate::gateway::SPEECH_TO_TEXT)
            .unwrap()
            .force_open();

        let err = service
            .run_voice(spoken(), PatientContext::default(), &CancelToken::new())
            .await
            .unwrap_err();
        assert!(matches!(
            err,
            PipelineError::Step {
                source: InvokeError::CircuitOpen { .. },
                ..
            }
        ));

        let health = service.health_status().await;
        assert_eq!(health.status, HealthStatus::Degraded);
        assert_eq!(health.invokers.len(), 3);
        assert_eq!(health.invokers[0].breaker.state, CircuitState::Open);
    }

    #[tokio::test]
    async fn test_builder_requires_adapters() {
        let result = ConsultationService::builder()
            .text_to_speech(Arc::new(ToneSynthesizer::new()))
            .build();
        assert!(matches!(result, Err(PipelineError::NotConfigured(_))));
    }

    #[tokio::test(start_paused = true)]
    async fn test_forget_finished() {
        let fixture = Fixture::new("fever");
        let service = fixture.service();
        let output = service
            .run_text("cough", PatientContext::default(), &CancelToken::new())
            .await
            .unwrap();
        let summaries = service.summaries().await;
        assert_eq!(summaries.len(), 1);
        assert_eq!(summaries[0].id, output.consultation.id());

        assert_eq!(service.forget_finished().await, 1);
        assert!(service.get(output.consultation.id()).await.is_none());
        assert!(service.progress(output.consultation.id()).is_none());
    }
}
