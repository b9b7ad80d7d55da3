//! When to stop asking questions.
//!
//! The reasoning capability reports a confidence score and a stop hint after
//! every answer. How those are combined is a policy choice, so it lives
//! behind [`StopPolicy`].

use serde::{Deserialize, Serialize};

/// Inputs available to a stop decision.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct StopContext {
    /// Latest confidence reported by the reasoner, in `[0, 1]`
    pub confidence: f64,

    /// Answers recorded so far
    pub answered: usize,

    /// Questions still queued
    pub pending: usize,

    /// The reasoner's own opinion
    pub reasoner_hint: bool,
}

pub trait StopPolicy: Send + Sync {
    fn should_stop(&self, ctx: &StopContext) -> bool;

    fn name(&self) -> &'static str;
}

/// Built-in stop rules, selectable from configuration.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum StopRule {
    /// Stop once confidence reaches `min_confidence` or `max_answers` have
    /// been collected.
    ConfidenceThreshold {
        min_confidence: f64,
        max_answers: usize,
        honor_reasoner_hint: bool,
    },

    /// Stop after a fixed number of answers regardless of confidence.
    AnswerCount { answers: usize },
}

impl Default for StopRule {
    fn default() -> Self {
        StopRule::ConfidenceThreshold {
            min_confidence: 0.7,
            max_answers: 8,
            honor_reasoner_hint: true,
        }
    }
}

impl StopPolicy for StopRule {
    fn should_stop(&self, ctx: &StopContext) -> bool {
        if ctx.pending == 0 {
            return true;
        }
        match *self {
            StopRule::ConfidenceThreshold {
                min_confidence,
                max_answers,
                honor_reasoner_hint,
            } => {
                (honor_reasoner_hint && ctx.reasoner_hint)
                    || ctx.confidence >= min_confidence
                    || ctx.answered >= max_answers
            }
            StopRule::AnswerCount { answers } => ctx.answered >= answers,
        }
    }

    fn name(&self) -> &'static str {
        match self {
            StopRule::ConfidenceThreshold { .. } => "confidence_threshold",
            StopRule::AnswerCount { .. } => "answer_count",
        }
    }
}
