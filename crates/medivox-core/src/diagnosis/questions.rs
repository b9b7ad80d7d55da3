//! Question templates and the rules that select them.
//!
//! Initial questions come from static templates plus symptom-triggered and
//! age-triggered rules. Follow-ups are derived from individual answers.

use crate::types::PatientContext;
use lazy_static::lazy_static;
use regex::Regex;
use serde::{Deserialize, Serialize};

lazy_static! {
    /// Fever mentions: "fever", "feverish", "temperature", "hot"
    pub static ref FEVER_TRIGGER: Regex = Regex::new(
        r"(?i)(fever|temperature|\bhot\b)"
    ).unwrap();

    /// Pain mentions: "pain", "ache", "headache", "hurts"
    pub static ref PAIN_TRIGGER: Regex = Regex::new(
        r"(?i)(pain|ache|hurt)"
    ).unwrap();

    /// Affirmative free-text answers
    pub static ref AFFIRMATIVE: Regex = Regex::new(
        r"(?i)^\s*(yes|y|true|yeah|yep)\b"
    ).unwrap();

    /// Negative free-text answers
    pub static ref NEGATIVE: Regex = Regex::new(
        r"(?i)^\s*(no|n|false|nope)\b"
    ).unwrap();
}

/// How a question expects to be answered.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum QuestionKind {
    MultipleChoice,
    Scale { min: u8, max: u8 },
    YesNo,
    Text,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Question {
    pub id: String,
    pub text: String,
    pub kind: QuestionKind,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub options: Vec<String>,
}

impl Question {
    fn new(id: impl Into<String>, text: impl Into<String>, kind: QuestionKind) -> Self {
        Self {
            id: id.into(),
            text: text.into(),
            kind,
            options: Vec::new(),
        }
    }

    fn choice(id: impl Into<String>, text: impl Into<String>, options: &[&str]) -> Self {
        Self {
            id: id.into(),
            text: text.into(),
            kind: QuestionKind::MultipleChoice,
            options: options.iter().map(|o| o.to_string()).collect(),
        }
    }

    fn scale(id: impl Into<String>, text: impl Into<String>) -> Self {
        Self::new(id, text, QuestionKind::Scale { min: 1, max: 10 })
    }

    /// Check an answer against the question's shape.
    ///
    /// Multiple-choice and free-text answers are accepted as-is; scale and
    /// yes/no answers must parse.
    pub fn accepts(&self, answer: &str) -> bool {
        if answer.trim().is_empty() {
            return false;
        }
        match self.kind {
            QuestionKind::Scale { min, max } => answer
                .trim()
                .parse::<u8>()
                .is_ok_and(|value| (min..=max).contains(&value)),
            QuestionKind::YesNo => is_affirmative(answer) || NEGATIVE.is_match(answer),
            QuestionKind::MultipleChoice | QuestionKind::Text => true,
        }
    }
}

pub fn is_affirmative(answer: &str) -> bool {
    AFFIRMATIVE.is_match(answer)
}

pub fn fever_severity() -> Question {
    Question::scale(
        "fever_severity",
        "How would you rate your fever on a scale of 1-10?",
    )
}

pub fn pain_location() -> Question {
    Question::choice(
        "pain_location",
        "Where is the pain located?",
        &["Head", "Chest", "Abdomen", "Back", "Arms", "Legs", "Other"],
    )
}

pub fn symptom_duration() -> Question {
    Question::choice(
        "symptom_duration",
        "How long have you had these symptoms?",
        &[
            "Less than 1 day",
            "1-3 days",
            "4-7 days",
            "1-2 weeks",
            "More than 2 weeks",
        ],
    )
}

pub fn symptom_progression() -> Question {
    Question::choice(
        "symptom_progression",
        "How have your symptoms changed since they started?",
        &["Getting better", "Getting worse", "Staying the same", "Fluctuating"],
    )
}

pub fn medication_taken() -> Question {
    Question::new(
        "medication_taken",
        "Have you taken any medications for these symptoms?",
        QuestionKind::YesNo,
    )
}

fn elderly_specific() -> Question {
    Question::new(
        "elderly_specific",
        "Have you experienced any falls or dizziness recently?",
        QuestionKind::YesNo,
    )
}

fn pediatric_specific() -> Question {
    Question::new(
        "pediatric_specific",
        "Has the child been eating and drinking normally?",
        QuestionKind::YesNo,
    )
}

/// Initial question queue for a new session, most specific first.
pub fn initial_questions(symptoms: &str, patient: &PatientContext) -> Vec<Question> {
    let mut questions = Vec::new();

    if FEVER_TRIGGER.is_match(symptoms) {
        questions.push(fever_severity());
    }
    if PAIN_TRIGGER.is_match(symptoms) {
        questions.push(pain_location());
    }
    if patient.is_elderly() {
        questions.push(elderly_specific());
    } else if patient.is_pediatric() {
        questions.push(pediatric_specific());
    }

    questions.push(symptom_duration());
    questions.push(symptom_progression());
    questions.push(medication_taken());
    questions
}

/// Follow-up questions triggered by one answer.
pub fn follow_ups(question_id: &str, answer: &str) -> Vec<Question> {
    let answer = answer.trim();
    match question_id {
        "pain_location" if !answer.eq_ignore_ascii_case("other") => {
            let location = answer.to_lowercase();
            let slug = location.replace(char::is_whitespace, "_");
            vec![Question::scale(
                format!("pain_severity_{}", slug),
                format!("How severe is your {} pain on a scale of 1-10?", location),
            )]
        }
        "medication_taken" if is_affirmative(answer) => vec![Question::new(
            "medications_list",
            "What medications have you taken?",
            QuestionKind::Text,
        )],
        "symptom_progression" if answer.eq_ignore_ascii_case("getting worse") => {
            vec![Question::choice(
                "worsening_rate",
                "How quickly are your symptoms getting worse?",
                &[
                    "Very rapidly (hours)",
                    "Gradually (days)",
                    "Slowly (weeks)",
                ],
            )]
        }
        _ => Vec::new(),
    }
}
