//! Interactive diagnosis sessions over the reasoning gateway.
//!
//! Question rules and per-session state come from `medivox_core`. This
//! service stores sessions, forwards answers to the reasoner and applies the
//! stop policy. Every session has its own lock; the store itself is only
//! held for lookups.

use super::store::{CacheStore, KeyedStore};
use crate::config::SessionConfig;
use crate::gateway::ReasoningGateway;
use crate::invoker::InvokeError;
use crate::resilience::CancelToken;
use medivox_core::{
    DiagnosisError, DiagnosisSession, MedicalResponse, PatientContext, Question, StopContext,
    StopPolicy,
};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tokio::sync::Mutex;
use tokio::time::Instant;
use uuid::Uuid;

#[derive(Error, Debug)]
pub enum SessionError {
    #[error("session {0} not found")]
    NotFound(String),

    #[error(transparent)]
    Diagnosis(#[from] DiagnosisError),

    #[error(transparent)]
    Invoke(#[from] InvokeError),
}

/// Stored entry for one session.
#[derive(Debug, Clone)]
pub struct SessionHandle {
    pub created: Instant,
    pub session: Arc<Mutex<DiagnosisSession>>,
}

impl SessionHandle {
    fn new(session: DiagnosisSession) -> Self {
        Self {
            created: Instant::now(),
            session: Arc::new(Mutex::new(session)),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SessionStart {
    pub session_id: String,
    pub questions: Vec<Question>,
    pub progress: u8,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AnswerOutcome {
    pub next_questions: Vec<Question>,
    pub progress: u8,
    pub confidence: f64,
    pub is_complete: bool,
    pub time_remaining: String,

    /// Present when this answer ended the session
    pub final_response: Option<MedicalResponse>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SessionStatus {
    pub session_id: String,
    pub progress: u8,
    pub confidence: f64,
    pub answered: usize,
    pub pending: usize,
    pub current_batch: Vec<String>,
    pub time_remaining: String,
    pub age_secs: f64,
}

pub struct InteractiveDiagnosisService {
    reasoning: Arc<ReasoningGateway>,
    store: Arc<dyn KeyedStore<SessionHandle>>,
    stop_policy: Arc<dyn StopPolicy>,
    max_age: Duration,
}

impl InteractiveDiagnosisService {
    /// Create a service over an explicit store, using the default session age limit.
    pub fn new(
        reasoning: Arc<ReasoningGateway>,
        store: Arc<dyn KeyedStore<SessionHandle>>,
        stop_policy: Arc<dyn StopPolicy>,
    ) -> Self {
        Self {
            reasoning,
            store,
            stop_policy,
            max_age: SessionConfig::default().max_age,
        }
    }

    /// Cache-backed store bounded by `max_sessions` with `max_age` as its
    /// time-to-live, plus the configured stop rule.
    pub fn from_config(reasoning: Arc<ReasoningGateway>, config: &SessionConfig) -> Self {
        Self::new(
            reasoning,
            Arc::new(CacheStore::<SessionHandle>::new(config.max_sessions, config.max_age)),
            Arc::new(config.stop_policy.clone()),
        )
        .with_max_age(config.max_age)
    }

    /// Age after which [`sweep_expired`](Self::sweep_expired) drops a session.
    pub fn with_max_age(mut self, max_age: Duration) -> Self {
        self.max_age = max_age;
        self
    }

    pub fn max_age(&self) -> Duration {
        self.max_age
    }

    async fn handle(&self, session_id: &str) -> Result<SessionHandle, SessionError> {
        self.store
            .get(session_id)
            .await
            .ok_or_else(|| SessionError::NotFound(session_id.to_string()))
    }

    /// Open a reasoning session and return the first question batch.
    pub async fn start(
        &self,
        symptoms: &str,
        patient: PatientContext,
        cancel: &CancelToken,
    ) -> Result<SessionStart, SessionError> {
        let reasoning_session = self.reasoning.start_session(symptoms, &patient, cancel).await?;
        let session_id = Uuid::new_v4().to_string();

        let mut session = DiagnosisSession::new(&session_id, reasoning_session, symptoms, patient);
        let questions = session.issue_batch();
        let progress = session.progress();

        self.store
            .put(session_id.clone(), SessionHandle::new(session))
            .await;
        tracing::info!(
            session = %session_id,
            questions = questions.len(),
            "Interactive diagnosis started"
        );

        Ok(SessionStart {
            session_id,
            questions,
            progress,
        })
    }

    /// Record an answer, ask the reasoner for an updated signal and either
    /// issue the next batch or finish the session.
    ///
    /// Local state only changes once the reasoner accepted the answer. If
    /// the stop condition is reached but the final assessment fails, the
    /// answer stays recorded and the outcome reports the session as still
    /// open; [`complete`](Self::complete) can be retried.
    pub async fn answer(
        &self,
        session_id: &str,
        question_id: &str,
        answer: &str,
        cancel: &CancelToken,
    ) -> Result<AnswerOutcome, SessionError> {
        let handle = self.handle(session_id).await?;
        let mut session = handle.session.lock().await;

        let mut draft = session.clone();
        draft.record_answer(question_id, answer)?;
        let signal = self
            .reasoning
            .submit_answer(draft.reasoning_session(), question_id, answer, cancel)
            .await?;
        draft.update_confidence(signal.confidence);
        *session = draft;

        let ctx = StopContext {
            confidence: session.confidence(),
            answered: session.answers().len(),
            pending: session.pending_count(),
            reasoner_hint: signal.should_stop,
        };

        if self.stop_policy.should_stop(&ctx) {
            tracing::info!(
                session = %session_id,
                policy = self.stop_policy.name(),
                answered = ctx.answered,
                confidence = ctx.confidence,
                "Stop condition reached, completing session"
            );
            match self.finalize(session_id, &mut session, cancel).await {
                Ok(response) => {
                    return Ok(AnswerOutcome {
                        next_questions: Vec::new(),
                        progress: session.progress(),
                        confidence: session.confidence(),
                        is_complete: true,
                        time_remaining: session.time_remaining_label().to_string(),
                        final_response: Some(response),
                    });
                }
                Err(error) => {
                    tracing::warn!(
                        session = %session_id,
                        error = %error,
                        "Final assessment failed, session stays open"
                    );
                }
            }
        }

        let next_questions = session.issue_batch();
        Ok(AnswerOutcome {
            next_questions,
            progress: session.progress(),
            confidence: session.confidence(),
            is_complete: false,
            time_remaining: session.time_remaining_label().to_string(),
            final_response: None,
        })
    }

    /// Request the final assessment and drop the session.
    pub async fn complete(&self, session_id: &str, cancel: &CancelToken) -> Result<MedicalResponse, SessionError> {
        let handle = self.handle(session_id).await?;
        let mut session = handle.session.lock().await;
        if session.is_completed() {
            return Err(DiagnosisError::Completed(session_id.to_string()).into());
        }
        self.finalize(session_id, &mut session, cancel).await
    }

    async fn finalize(
        &self,
        session_id: &str,
        session: &mut DiagnosisSession,
        cancel: &CancelToken,
    ) -> Result<MedicalResponse, SessionError> {
        let response = self
            .reasoning
            .finish_session(session.reasoning_session(), cancel)
            .await?;
        session.finish();
        self.store.delete(session_id).await;

        tracing::info!(
            session = %session_id,
            answered = session.answers().len(),
            urgency = %response.urgency,
            "Interactive diagnosis completed"
        );
        Ok(response)
    }

    /// Drop a session without a final assessment.
    pub async fn cancel(&self, session_id: &str) -> Result<(), SessionError> {
        let handle = self
            .store
            .delete(session_id)
            .await
            .ok_or_else(|| SessionError::NotFound(session_id.to_string()))?;
        handle.session.lock().await.finish();
        tracing::info!(session = %session_id, "Interactive diagnosis cancelled");
        Ok(())
    }

    /// Current progress and batch for a session.
    pub async fn status(&self, session_id: &str) -> Result<SessionStatus, SessionError> {
        let handle = self.handle(session_id).await?;
        let session = handle.session.lock().await;
        Ok(SessionStatus {
            session_id: session_id.to_string(),
            progress: session.progress(),
            confidence: session.confidence(),
            answered: session.answers().len(),
            pending: session.pending_count(),
            current_batch: session.current_batch().to_vec(),
            time_remaining: session.time_remaining_label().to_string(),
            age_secs: handle.created.elapsed().as_secs_f64(),
        })
    }

    pub async fn insights(&self, session_id: &str) -> Result<Vec<String>, SessionError> {
        let handle = self.handle(session_id).await?;
        let insights = handle.session.lock().await.insights();
        Ok(insights)
    }

    /// Number of open sessions.
    pub async fn active_sessions(&self) -> usize {
        self.store.len().await
    }

    /// Remove sessions older than `max_age`; returns how many were removed.
    pub async fn cleanup_expired(&self, max_age: Duration) -> usize {
        let removed = self
            .store
            .sweep(&|handle: &SessionHandle| handle.created.elapsed() > max_age)
            .await;
        if removed > 0 {
            tracing::info!(removed, max_age = ?max_age, "Expired diagnosis sessions removed");
        }
        removed
    }

    /// [`cleanup_expired`](Self::cleanup_expired) with the configured age limit.
    pub async fn sweep_expired(&self) -> usize {
        self.cleanup_expired(self.max_age).await
    }
}
