//! Domain value types shared by the consultation and diagnosis modules.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use uuid::Uuid;

/// How quickly a patient needs care.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Urgency {
    Low,
    Moderate,
    High,
    Emergency,
}

impl Urgency {
    /// Parse a reasoner-provided label. Unknown labels map to `None`.
    pub fn parse(label: &str) -> Option<Self> {
        match label.trim().to_ascii_lowercase().as_str() {
            "low" => Some(Urgency::Low),
            "moderate" | "medium" => Some(Urgency::Moderate),
            "high" | "urgent" => Some(Urgency::High),
            "emergency" | "critical" => Some(Urgency::Emergency),
            _ => None,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Urgency::Low => "low",
            Urgency::Moderate => "moderate",
            Urgency::High => "high",
            Urgency::Emergency => "emergency",
        }
    }
}

impl fmt::Display for Urgency {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Confidence bucket derived from a numeric score.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ConfidenceLevel {
    VeryLow,
    Low,
    Moderate,
    High,
    VeryHigh,
}

impl ConfidenceLevel {
    pub fn from_score(score: f64) -> Self {
        if score >= 0.9 {
            ConfidenceLevel::VeryHigh
        } else if score >= 0.7 {
            ConfidenceLevel::High
        } else if score >= 0.5 {
            ConfidenceLevel::Moderate
        } else if score >= 0.3 {
            ConfidenceLevel::Low
        } else {
            ConfidenceLevel::VeryLow
        }
    }
}

/// Patient details forwarded to the reasoning capability.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct PatientContext {
    pub patient_id: Option<String>,
    pub age: Option<u32>,
    #[serde(default)]
    pub medications: Vec<String>,
    #[serde(default)]
    pub conditions: Vec<String>,
}

impl PatientContext {
    pub fn with_age(age: u32) -> Self {
        Self {
            age: Some(age),
            ..Default::default()
        }
    }

    pub fn is_elderly(&self) -> bool {
        self.age.is_some_and(|age| age > 65)
    }

    pub fn is_pediatric(&self) -> bool {
        self.age.is_some_and(|age| age < 18)
    }
}

/// Raw audio handed between capabilities. Samples are 16-bit PCM.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AudioClip {
    pub id: String,
    pub data: Vec<u8>,
    pub sample_rate: u32,
    pub channels: u16,
}

impl AudioClip {
    pub fn new(data: Vec<u8>, sample_rate: u32, channels: u16) -> Self {
        Self {
            id: Uuid::new_v4().to_string(),
            data,
            sample_rate,
            channels,
        }
    }

    pub fn is_empty(&self) -> bool {
        self.data.is_empty()
    }

    pub fn duration_ms(&self) -> u64 {
        let bytes_per_sec = u64::from(self.sample_rate) * u64::from(self.channels.max(1)) * 2;
        if bytes_per_sec == 0 {
            return 0;
        }
        self.data.len() as u64 * 1000 / bytes_per_sec
    }

    /// Lightweight handle kept on a consultation instead of the samples.
    pub fn reference(&self) -> AudioRef {
        AudioRef {
            id: self.id.clone(),
            bytes: self.data.len(),
            duration_ms: self.duration_ms(),
        }
    }
}

/// Handle to an audio artifact produced or consumed by a consultation.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AudioRef {
    pub id: String,
    pub bytes: usize,
    pub duration_ms: u64,
}

/// Result of a medical analysis.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MedicalResponse {
    pub diagnosis: String,

    /// Score in `[0, 1]`
    pub confidence: f64,

    pub urgency: Urgency,

    #[serde(default)]
    pub red_flags: Vec<String>,

    #[serde(default)]
    pub recommendations: Vec<String>,

    /// Ranked differential diagnoses, most likely first
    #[serde(default)]
    pub differential: Vec<String>,

    #[serde(default)]
    pub follow_up_required: bool,

    pub follow_up_days: Option<u32>,

    pub created_at: DateTime<Utc>,
}

impl MedicalResponse {
    pub fn new(diagnosis: impl Into<String>, confidence: f64, urgency: Urgency) -> Self {
        Self {
            diagnosis: diagnosis.into(),
            confidence: confidence.clamp(0.0, 1.0),
            urgency,
            red_flags: Vec::new(),
            recommendations: Vec::new(),
            differential: Vec::new(),
            follow_up_required: false,
            follow_up_days: None,
            created_at: Utc::now(),
        }
    }

    pub fn confidence_level(&self) -> ConfidenceLevel {
        ConfidenceLevel::from_score(self.confidence)
    }

    pub fn is_emergency(&self) -> bool {
        self.urgency == Urgency::Emergency
    }

    pub fn requires_immediate_attention(&self) -> bool {
        self.urgency >= Urgency::High || !self.red_flags.is_empty()
    }

    /// Returns false when the recommendation was already present.
    pub fn add_recommendation(&mut self, recommendation: impl Into<String>) -> bool {
        push_unique(&mut self.recommendations, recommendation.into())
    }

    /// Returns false when the red flag was already present.
    pub fn add_red_flag(&mut self, flag: impl Into<String>) -> bool {
        push_unique(&mut self.red_flags, flag.into())
    }

    pub fn set_follow_up(&mut self, days: u32) {
        self.follow_up_required = true;
        self.follow_up_days = Some(days);
    }

    /// Plain-language rendering handed to speech synthesis.
    pub fn patient_friendly_text(&self) -> String {
        let mut text = String::new();
        if self.is_emergency() {
            text.push_str("Please seek emergency care immediately. ");
        }
        text.push_str(&self.diagnosis);

        if !self.recommendations.is_empty() {
            text.push_str("\n\nRecommendations:");
            for rec in &self.recommendations {
                text.push_str("\n- ");
                text.push_str(rec);
            }
        }

        if !self.red_flags.is_empty() {
            text.push_str("\n\nImportant warning signs: ");
            text.push_str(&self.red_flags.join(", "));
        }

        if self.follow_up_required {
            match self.follow_up_days {
                Some(days) => text.push_str(&format!(
                    "\n\nPlease follow up with a healthcare provider within {} days.",
                    days
                )),
                None => text.push_str("\n\nPlease follow up with a healthcare provider."),
            }
        }
        text
    }

    pub fn summary(&self) -> MedicalSummary {
        MedicalSummary {
            diagnosis: self.diagnosis.clone(),
            confidence: self.confidence,
            confidence_level: self.confidence_level(),
            urgency: self.urgency,
            red_flag_count: self.red_flags.len(),
            recommendation_count: self.recommendations.len(),
            requires_immediate_attention: self.requires_immediate_attention(),
        }
    }
}

/// Compact view of a [`MedicalResponse`] used in consultation summaries.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MedicalSummary {
    pub diagnosis: String,
    pub confidence: f64,
    pub confidence_level: ConfidenceLevel,
    pub urgency: Urgency,
    pub red_flag_count: usize,
    pub recommendation_count: usize,
    pub requires_immediate_attention: bool,
}

fn push_unique(items: &mut Vec<String>, item: String) -> bool {
    if items.iter().any(|existing| existing.eq_ignore_ascii_case(&item)) {
        return false;
    }
    items.push(item);
    true
}
