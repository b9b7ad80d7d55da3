//! Interactive diagnosis: question rules, per-session state and stop policy.
//!
//! This is the deterministic half of an interactive session. Talking to the
//! reasoning capability and storing sessions happens in `medivox-runtime`.

mod policy;
pub mod questions;
mod session;

pub use policy::{StopContext, StopPolicy, StopRule};
pub use questions::{Question, QuestionKind};
pub use session::{Answer, DiagnosisSession, BATCH_SIZE, INITIAL_CONFIDENCE};

use thiserror::Error;

/// Errors raised while recording answers.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum DiagnosisError {
    #[error("question {0} was never issued")]
    UnknownQuestion(String),

    #[error("question {0} is not part of the current batch")]
    NotInCurrentBatch(String),

    #[error("question {0} was already answered")]
    AlreadyAnswered(String),

    #[error("answer {answer:?} does not fit question {question_id}")]
    InvalidAnswer { question_id: String, answer: String },

    #[error("session {0} is already complete")]
    Completed(String),
}
