//! Session storage and the interactive diagnosis service.

mod interactive;
mod store;

pub use interactive::{
    AnswerOutcome, InteractiveDiagnosisService, SessionError, SessionHandle, SessionStart,
    SessionStatus,
};
pub use store::{CacheStore, InMemoryStore, KeyedStore};
