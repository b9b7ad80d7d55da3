//! Per-session question/answer state.

use super::questions::{self, Question};
use super::DiagnosisError;
use crate::types::PatientContext;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::VecDeque;

/// Questions handed to the caller at once.
pub const BATCH_SIZE: usize = 2;

/// Confidence before the reasoner has seen any answers.
pub const INITIAL_CONFIDENCE: f64 = 0.3;

/// Progress gained per answer, in percent.
const PROGRESS_STEP: u8 = 20;

/// Highest progress reported before completion.
const PROGRESS_CAP: u8 = 95;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Answer {
    pub question_id: String,
    pub text: String,
    pub answered_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DiagnosisSession {
    id: String,
    reasoning_session: String,
    symptoms: String,
    patient: PatientContext,

    /// Every question shown to the caller, in issue order
    issued: Vec<Question>,

    /// Unanswered questions, issued or not, next batch first
    pending: VecDeque<Question>,

    /// Ids in the most recently issued batch
    current_batch: Vec<String>,

    answers: Vec<Answer>,
    confidence: f64,
    progress: u8,
    completed: bool,
    created_at: DateTime<Utc>,
}

impl DiagnosisSession {
    pub fn new(
        id: impl Into<String>,
        reasoning_session: impl Into<String>,
        symptoms: impl Into<String>,
        patient: PatientContext,
    ) -> Self {
        let symptoms = symptoms.into();
        let pending = questions::initial_questions(&symptoms, &patient).into();
        Self {
            id: id.into(),
            reasoning_session: reasoning_session.into(),
            symptoms,
            patient,
            issued: Vec::new(),
            pending,
            current_batch: Vec::new(),
            answers: Vec::new(),
            confidence: INITIAL_CONFIDENCE,
            progress: 0,
            completed: false,
            created_at: Utc::now(),
        }
    }

    /// Issue the next batch from the front of the queue.
    ///
    /// The returned batch replaces the previous one; only its questions can
    /// be answered next.
    pub fn issue_batch(&mut self) -> Vec<Question> {
        let batch: Vec<Question> = self.pending.iter().take(BATCH_SIZE).cloned().collect();
        for question in &batch {
            if !self.issued.iter().any(|q| q.id == question.id) {
                self.issued.push(question.clone());
            }
        }
        self.current_batch = batch.iter().map(|q| q.id.clone()).collect();
        batch
    }

    /// Record an answer to a question from the current batch and queue any
    /// follow-ups it triggers.
    pub fn record_answer(
        &mut self,
        question_id: &str,
        text: &str,
    ) -> Result<Vec<Question>, DiagnosisError> {
        if self.completed {
            return Err(DiagnosisError::Completed(self.id.clone()));
        }
        if self.is_answered(question_id) {
            return Err(DiagnosisError::AlreadyAnswered(question_id.to_string()));
        }
        if !self.current_batch.iter().any(|id| id == question_id) {
            return Err(if self.issued.iter().any(|q| q.id == question_id) {
                DiagnosisError::NotInCurrentBatch(question_id.to_string())
            } else {
                DiagnosisError::UnknownQuestion(question_id.to_string())
            });
        }

        let position = self
            .pending
            .iter()
            .position(|q| q.id == question_id)
            .ok_or_else(|| DiagnosisError::UnknownQuestion(question_id.to_string()))?;
        if !self.pending[position].accepts(text) {
            return Err(DiagnosisError::InvalidAnswer {
                question_id: question_id.to_string(),
                answer: text.to_string(),
            });
        }
        self.pending.remove(position);

        self.answers.push(Answer {
            question_id: question_id.to_string(),
            text: text.trim().to_string(),
            answered_at: Utc::now(),
        });
        self.current_batch.retain(|id| id != question_id);
        self.progress = (self.progress + PROGRESS_STEP).min(PROGRESS_CAP);

        let follow = questions::follow_ups(question_id, text);
        for question in follow.iter().rev() {
            if !self.is_known(&question.id) {
                self.pending.push_front(question.clone());
            }
        }
        tracing::debug!(
            session = %self.id,
            question = question_id,
            follow_ups = follow.len(),
            "Answer recorded"
        );
        Ok(follow)
    }

    /// Store the reasoner's updated confidence.
    pub fn update_confidence(&mut self, confidence: f64) {
        self.confidence = confidence.clamp(0.0, 1.0);
    }

    /// Mark the session finished; progress jumps to 100.
    pub fn finish(&mut self) {
        self.completed = true;
        self.progress = 100;
        self.current_batch.clear();
    }

    fn is_answered(&self, question_id: &str) -> bool {
        self.answers.iter().any(|a| a.question_id == question_id)
    }

    fn is_known(&self, question_id: &str) -> bool {
        self.is_answered(question_id) || self.pending.iter().any(|q| q.id == question_id)
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn reasoning_session(&self) -> &str {
        &self.reasoning_session
    }

    pub fn symptoms(&self) -> &str {
        &self.symptoms
    }

    pub fn patient(&self) -> &PatientContext {
        &self.patient
    }

    pub fn issued(&self) -> &[Question] {
        &self.issued
    }

    pub fn current_batch(&self) -> &[String] {
        &self.current_batch
    }

    pub fn answers(&self) -> &[Answer] {
        &self.answers
    }

    pub fn pending_count(&self) -> usize {
        self.pending.len()
    }

    pub fn confidence(&self) -> f64 {
        self.confidence
    }

    pub fn progress(&self) -> u8 {
        self.progress
    }

    pub fn is_completed(&self) -> bool {
        self.completed
    }

    pub fn created_at(&self) -> DateTime<Utc> {
        self.created_at
    }

    pub fn time_remaining_label(&self) -> &'static str {
        match self.progress {
            p if p >= 100 => "Complete",
            p if p >= 90 => "Less than 1 minute",
            p if p >= 70 => "1-2 minutes",
            p if p >= 50 => "2-3 minutes",
            _ => "3-5 minutes",
        }
    }

    /// Risk factors visible in the answers so far.
    pub fn insights(&self) -> Vec<String> {
        let mut insights = Vec::new();
        for answer in &self.answers {
            let score = answer.text.parse::<u8>().ok();
            if let Some(location) = answer.question_id.strip_prefix("pain_severity_") {
                if let Some(score) = score.filter(|s| *s >= 7) {
                    insights.push(format!(
                        "High {} pain severity reported ({}/10)",
                        location.replace('_', " "),
                        score
                    ));
                }
            } else if answer.question_id == "fever_severity" {
                if let Some(score) = score.filter(|s| *s >= 8) {
                    insights.push(format!("High fever severity reported ({}/10)", score));
                }
            } else if answer.question_id == "symptom_progression"
                && answer.text.to_lowercase().contains("worse")
            {
                insights.push("Symptoms are worsening".to_string());
            }
        }
        insights
    }
}
