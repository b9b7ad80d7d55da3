//! In-memory adapters for lightweight deployments and tests.
//!
//! Each adapter can be scripted to fail, so resilience behavior can be
//! exercised without a network.

use super::{
    AudioRepository, CapabilityError, HealthReport, MedicalReasoner, SessionSignal, SpeechToText,
    TextToSpeech, VoiceConfig,
};
use async_trait::async_trait;
use medivox_core::{AudioClip, MedicalResponse, PatientContext, Urgency};
use parking_lot::{Mutex, RwLock};
use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicU32, Ordering};
use std::time::Duration;
use uuid::Uuid;

/// Queue of failures handed out one per call, plus an optional failure
/// returned forever once the queue is empty.
#[derive(Debug, Default)]
pub struct FailureScript {
    queued: Mutex<VecDeque<CapabilityError>>,
    permanent: Mutex<Option<CapabilityError>>,
    calls: AtomicU32,
}

impl FailureScript {
    pub fn fail_times(&self, times: u32, error: CapabilityError) {
        let mut queued = self.queued.lock();
        for _ in 0..times {
            queued.push_back(error.clone());
        }
    }

    pub fn fail_always(&self, error: CapabilityError) {
        *self.permanent.lock() = Some(error);
    }

    pub fn recover(&self) {
        self.queued.lock().clear();
        *self.permanent.lock() = None;
    }

    pub fn calls(&self) -> u32 {
        self.calls.load(Ordering::SeqCst)
    }

    /// Count a call and return the scripted failure for it, if any.
    pub fn check(&self) -> Result<(), CapabilityError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        if let Some(error) = self.queued.lock().pop_front() {
            return Err(error);
        }
        match self.permanent.lock().as_ref() {
            Some(error) => Err(error.clone()),
            None => Ok(()),
        }
    }
}

/// Returns a fixed transcript for any non-empty audio.
#[derive(Debug)]
pub struct ScriptedSpeechToText {
    transcript: RwLock<String>,
    latency: Option<Duration>,
    pub failures: FailureScript,
}

impl ScriptedSpeechToText {
    pub fn new(transcript: impl Into<String>) -> Self {
        Self {
            transcript: RwLock::new(transcript.into()),
            latency: None,
            failures: FailureScript::default(),
        }
    }

    pub fn with_latency(mut self, latency: Duration) -> Self {
        self.latency = Some(latency);
        self
    }

    pub fn set_transcript(&self, transcript: impl Into<String>) {
        *self.transcript.write() = transcript.into();
    }
}

#[async_trait]
impl SpeechToText for ScriptedSpeechToText {
    async fn transcribe(&self, audio: &AudioClip) -> Result<String, CapabilityError> {
        if let Some(latency) = self.latency {
            tokio::time::sleep(latency).await;
        }
        self.failures.check()?;
        if audio.is_empty() {
            return Err(CapabilityError::invalid_input("audio clip is empty"));
        }
        Ok(self.transcript.read().clone())
    }

    async fn health(&self) -> HealthReport {
        HealthReport::healthy(self.name())
    }

    fn name(&self) -> &str {
        "scripted-stt"
    }
}

/// Renders text as a sine tone, 10 ms per character.
#[derive(Debug, Default)]
pub struct ToneSynthesizer {
    pub failures: FailureScript,
}

impl ToneSynthesizer {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl TextToSpeech for ToneSynthesizer {
    async fn synthesize(&self, text: &str, voice: &VoiceConfig) -> Result<AudioClip, CapabilityError> {
        self.failures.check()?;
        if text.trim().is_empty() {
            return Err(CapabilityError::invalid_input("nothing to synthesize"));
        }

        let rate = voice.sample_rate.max(1);
        let samples = (text.chars().count() as u64 * u64::from(rate) / 100) as usize;
        let step = 2.0 * std::f32::consts::PI * 440.0 * voice.speed / rate as f32;
        let mut data = Vec::with_capacity(samples * 2);
        for n in 0..samples {
            let sample = ((n as f32 * step).sin() * 0.2 * f32::from(i16::MAX)) as i16;
            data.extend_from_slice(&sample.to_le_bytes());
        }
        Ok(AudioClip::new(data, rate, 1))
    }

    async fn health(&self) -> HealthReport {
        HealthReport::healthy(self.name())
    }

    fn name(&self) -> &str {
        "tone-tts"
    }
}

struct Finding {
    keyword: &'static str,
    diagnosis: &'static str,
    urgency: Urgency,
}

const FINDINGS: &[Finding] = &[
    Finding {
        keyword: "chest pain",
        diagnosis: "Possible acute coronary syndrome",
        urgency: Urgency::Emergency,
    },
    Finding {
        keyword: "shortness of breath",
        diagnosis: "Possible respiratory distress",
        urgency: Urgency::High,
    },
    Finding {
        keyword: "fever",
        diagnosis: "Likely viral infection",
        urgency: Urgency::Moderate,
    },
    Finding {
        keyword: "cough",
        diagnosis: "Upper respiratory tract infection",
        urgency: Urgency::Low,
    },
    Finding {
        keyword: "headache",
        diagnosis: "Tension-type headache",
        urgency: Urgency::Low,
    },
];

const RED_FLAGS: &[&str] = &[
    "chest pain",
    "shortness of breath",
    "confusion",
    "severe bleeding",
    "loss of consciousness",
];

#[derive(Debug)]
struct MockSession {
    symptoms: String,
    patient: PatientContext,
    answers: Vec<(String, String)>,
}

/// Keyword-table reasoner with interactive sessions.
///
/// Session confidence starts at 0.3 and rises by 0.1 per answer.
#[derive(Debug, Default)]
pub struct KeywordReasoner {
    sessions: RwLock<HashMap<String, MockSession>>,
    stop_after: Option<usize>,
    latency: Option<Duration>,

    /// Applies to `analyze` and the session calls
    pub failures: FailureScript,

    /// Applies to urgency, differential and red-flag calls
    pub auxiliary_failures: FailureScript,

    /// Applies to `finish_session` only, after `failures`
    pub finish_failures: FailureScript,
}

impl KeywordReasoner {
    pub fn new() -> Self {
        Self::default()
    }

    /// Raise the stop hint once this many answers were submitted.
    pub fn stop_after(mut self, answers: usize) -> Self {
        self.stop_after = Some(answers);
        self
    }

    pub fn with_latency(mut self, latency: Duration) -> Self {
        self.latency = Some(latency);
        self
    }

    pub fn open_sessions(&self) -> usize {
        self.sessions.read().len()
    }

    async fn think(&self) {
        if let Some(latency) = self.latency {
            tokio::time::sleep(latency).await;
        }
    }

    fn diagnose(symptoms: &str) -> MedicalResponse {
        let lower = symptoms.to_lowercase();
        let matched: Vec<&Finding> = FINDINGS.iter().filter(|f| lower.contains(f.keyword)).collect();

        let mut response = match matched.first() {
            Some(finding) => MedicalResponse::new(
                finding.diagnosis,
                0.5 + 0.1 * matched.len().min(4) as f64,
                matched.iter().map(|f| f.urgency).max().unwrap_or(Urgency::Low),
            ),
            None => MedicalResponse::new("Non-specific symptoms", 0.4, Urgency::Low),
        };

        for flag in RED_FLAGS.iter().filter(|flag| lower.contains(*flag)) {
            response.add_red_flag(*flag);
        }
        if response.urgency >= Urgency::High {
            response.add_recommendation("Seek medical care immediately");
        } else {
            response.add_recommendation("Rest and stay hydrated");
            response.add_recommendation("Monitor your symptoms");
            response.set_follow_up(if response.urgency == Urgency::Moderate { 2 } else { 7 });
        }
        response
    }
}

#[async_trait]
impl MedicalReasoner for KeywordReasoner {
    async fn analyze(
        &self,
        symptoms: &str,
        _patient: &PatientContext,
    ) -> Result<MedicalResponse, CapabilityError> {
        self.think().await;
        self.failures.check()?;
        Ok(Self::diagnose(symptoms))
    }

    async fn assess_urgency(
        &self,
        symptoms: &str,
        patient: &PatientContext,
    ) -> Result<Urgency, CapabilityError> {
        self.think().await;
        self.auxiliary_failures.check()?;
        let urgency = Self::diagnose(symptoms).urgency;
        // age bumps low urgency up one level
        if urgency == Urgency::Low && (patient.is_elderly() || patient.is_pediatric()) {
            return Ok(Urgency::Moderate);
        }
        Ok(urgency)
    }

    async fn differential_diagnosis(
        &self,
        symptoms: &str,
        _patient: &PatientContext,
    ) -> Result<Vec<String>, CapabilityError> {
        self.think().await;
        self.auxiliary_failures.check()?;
        let lower = symptoms.to_lowercase();
        let mut candidates: Vec<String> = FINDINGS
            .iter()
            .filter(|f| lower.contains(f.keyword))
            .map(|f| f.diagnosis.to_string())
            .collect();
        candidates.push("Viral syndrome".to_string());
        candidates.push("Stress-related symptoms".to_string());
        candidates.push("Dehydration".to_string());
        Ok(candidates)
    }

    async fn identify_red_flags(&self, symptoms: &str) -> Result<Vec<String>, CapabilityError> {
        self.think().await;
        self.auxiliary_failures.check()?;
        let lower = symptoms.to_lowercase();
        Ok(RED_FLAGS
            .iter()
            .filter(|flag| lower.contains(*flag))
            .map(|flag| flag.to_string())
            .collect())
    }

    async fn start_session(
        &self,
        symptoms: &str,
        patient: &PatientContext,
    ) -> Result<String, CapabilityError> {
        self.failures.check()?;
        let handle = Uuid::new_v4().to_string();
        self.sessions.write().insert(
            handle.clone(),
            MockSession {
                symptoms: symptoms.to_string(),
                patient: patient.clone(),
                answers: Vec::new(),
            },
        );
        Ok(handle)
    }

    async fn submit_answer(
        &self,
        session: &str,
        question_id: &str,
        answer: &str,
    ) -> Result<SessionSignal, CapabilityError> {
        self.failures.check()?;
        let mut sessions = self.sessions.write();
        let state = sessions
            .get_mut(session)
            .ok_or_else(|| CapabilityError::invalid_input(format!("unknown session {}", session)))?;
        state.answers.push((question_id.to_string(), answer.to_string()));

        let evidence_count = state.answers.len();
        Ok(SessionSignal {
            confidence: (0.3 + 0.1 * evidence_count as f64).min(0.95),
            evidence_count,
            should_stop: self.stop_after.is_some_and(|limit| evidence_count >= limit),
        })
    }

    async fn finish_session(&self, session: &str) -> Result<MedicalResponse, CapabilityError> {
        self.failures.check()?;
        self.finish_failures.check()?;
        let state = self
            .sessions
            .write()
            .remove(session)
            .ok_or_else(|| CapabilityError::invalid_input(format!("unknown session {}", session)))?;

        let mut response = Self::diagnose(&state.symptoms);
        response.confidence = (0.3 + 0.1 * state.answers.len() as f64).min(0.95);
        if state.patient.is_elderly() && response.urgency < Urgency::Moderate {
            response.urgency = Urgency::Moderate;
        }
        for (question, answer) in &state.answers {
            if question.starts_with("pain_severity_") && answer.parse::<u8>().is_ok_and(|s| s >= 7) {
                response.add_recommendation("Consider pain relief and an in-person assessment");
            }
        }
        Ok(response)
    }

    async fn health(&self) -> HealthReport {
        match self.failures.permanent.lock().as_ref() {
            Some(error) => HealthReport::unhealthy(self.name(), error.to_string()),
            None => HealthReport::healthy(self.name()),
        }
    }

    fn name(&self) -> &str {
        "keyword-reasoner"
    }
}

/// Audio repository backed by a map.
#[derive(Debug, Default)]
pub struct InMemoryAudioRepository {
    clips: RwLock<HashMap<String, AudioClip>>,
    pub failures: FailureScript,
}

impl InMemoryAudioRepository {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.clips.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.clips.read().is_empty()
    }
}

#[async_trait]
impl AudioRepository for InMemoryAudioRepository {
    async fn save(&self, audio: &AudioClip) -> Result<(), CapabilityError> {
        self.failures.check()?;
        self.clips.write().insert(audio.id.clone(), audio.clone());
        Ok(())
    }

    async fn load(&self, id: &str) -> Result<Option<AudioClip>, CapabilityError> {
        Ok(self.clips.read().get(id).cloned())
    }

    fn name(&self) -> &str {
        "in-memory-audio"
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_failure_script_order() {
        let script = FailureScript::default();
        script.fail_times(2, CapabilityError::connection("down"));
        assert!(script.check().is_err());
        assert!(script.check().is_err());
        assert!(script.check().is_ok());
        assert_eq!(script.calls(), 3);

        script.fail_always(CapabilityError::unavailable("gone"));
        assert!(script.check().is_err());
        script.recover();
        assert!(script.check().is_ok());
    }

    #[tokio::test]
    async fn test_tone_length_tracks_text() {
        let tts = ToneSynthesizer::new();
        let clip = tts.synthesize("hello", &VoiceConfig::default()).await.unwrap();
        // 5 chars * 10 ms at 16 kHz
        assert_eq!(clip.duration_ms(), 50);
        assert!(tts.synthesize("  ", &VoiceConfig::default()).await.is_err());
    }

    #[tokio::test]
    async fn test_reasoner_keywords() {
        let reasoner = KeywordReasoner::new();
        let patient = PatientContext::default();
        let response = reasoner.analyze("Sudden chest pain and fever", &patient).await.unwrap();
        assert_eq!(response.urgency, Urgency::Emergency);
        assert_eq!(response.red_flags, vec!["chest pain".to_string()]);

        let urgency = reasoner
            .assess_urgency("mild cough", &PatientContext::with_age(80))
            .await
            .unwrap();
        assert_eq!(urgency, Urgency::Moderate);
    }

    #[tokio::test]
    async fn test_reasoner_sessions() {
        let reasoner = KeywordReasoner::new().stop_after(2);
        let handle = reasoner.start_session("fever", &PatientContext::default()).await.unwrap();

        let first = reasoner.submit_answer(&handle, "fever_severity", "6").await.unwrap();
        assert!(!first.should_stop);
        let second = reasoner.submit_answer(&handle, "symptom_duration", "1-3 days").await.unwrap();
        assert!(second.should_stop);
        assert!((second.confidence - 0.5).abs() < 1e-9);

        reasoner.finish_session(&handle).await.unwrap();
        assert_eq!(reasoner.open_sessions(), 0);
        assert!(reasoner.finish_session(&handle).await.is_err());
    }
}
