//! Stage-based progress and ETA estimates.
//!
//! Each stage carries an estimated duration. Progress is the share of the
//! plan's total estimate already covered: finished stages count in full and
//! the current stage counts up to its estimate. Until the tracker is
//! completed the reported percentage never exceeds 95.

use serde::{Deserialize, Serialize};
use std::time::{Duration, Instant};

const RUNNING_CAP: f64 = 95.0;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ProgressStage {
    Initializing,
    Transcribing,
    AnalyzingSymptoms,
    CheckingDatabase,
    GeneratingQuestions,
    FindingMedications,
    GeneratingRecommendations,
    Synthesizing,
    Finalizing,
}

impl ProgressStage {
    pub fn estimated(&self) -> Duration {
        let ms = match self {
            ProgressStage::Initializing => 500,
            ProgressStage::Transcribing => 2000,
            ProgressStage::AnalyzingSymptoms => 2000,
            ProgressStage::CheckingDatabase => 1500,
            ProgressStage::GeneratingQuestions => 1000,
            ProgressStage::FindingMedications => 1200,
            ProgressStage::GeneratingRecommendations => 800,
            ProgressStage::Synthesizing => 1500,
            ProgressStage::Finalizing => 300,
        };
        Duration::from_millis(ms)
    }

    pub fn message(&self) -> &'static str {
        match self {
            ProgressStage::Initializing => "Starting consultation",
            ProgressStage::Transcribing => "Transcribing audio",
            ProgressStage::AnalyzingSymptoms => "Analyzing symptoms",
            ProgressStage::CheckingDatabase => "Checking medical database",
            ProgressStage::GeneratingQuestions => "Generating follow-up questions",
            ProgressStage::FindingMedications => "Finding medication information",
            ProgressStage::GeneratingRecommendations => "Generating recommendations",
            ProgressStage::Synthesizing => "Generating audio response",
            ProgressStage::Finalizing => "Finalizing",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ProgressState {
    Pending,
    Running,
    Completed,
    Failed,
}

/// Point-in-time view of a tracker.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ProgressSnapshot {
    pub stage: Option<ProgressStage>,
    pub message: String,
    pub percentage: f64,
    pub elapsed: Duration,
    pub eta: Duration,
    pub state: ProgressState,
}

#[derive(Debug, Clone)]
pub struct ProgressTracker {
    plan: Vec<ProgressStage>,
    started: Option<Instant>,
    current: Option<(usize, Instant)>,
    state: ProgressState,
    stopped_at: Option<Instant>,
}

impl ProgressTracker {
    /// Create a tracker for the given stage plan.
    pub fn new(plan: Vec<ProgressStage>) -> Self {
        Self {
            plan,
            started: None,
            current: None,
            state: ProgressState::Pending,
            stopped_at: None,
        }
    }

    /// Full medical analysis plan.
    pub fn analysis() -> Self {
        Self::new(vec![
            ProgressStage::Initializing,
            ProgressStage::AnalyzingSymptoms,
            ProgressStage::CheckingDatabase,
            ProgressStage::GeneratingQuestions,
            ProgressStage::FindingMedications,
            ProgressStage::GeneratingRecommendations,
            ProgressStage::Finalizing,
        ])
    }

    /// Audio in, audio out.
    pub fn voice_consultation() -> Self {
        Self::new(vec![
            ProgressStage::Initializing,
            ProgressStage::Transcribing,
            ProgressStage::AnalyzingSymptoms,
            ProgressStage::Synthesizing,
            ProgressStage::Finalizing,
        ])
    }

    /// Text in, audio out.
    pub fn text_consultation() -> Self {
        Self::new(vec![
            ProgressStage::Initializing,
            ProgressStage::AnalyzingSymptoms,
            ProgressStage::Synthesizing,
            ProgressStage::Finalizing,
        ])
    }

    pub fn plan(&self) -> &[ProgressStage] {
        &self.plan
    }

    pub fn state(&self) -> ProgressState {
        self.state
    }

    pub fn total_estimate(&self) -> Duration {
        self.plan.iter().map(ProgressStage::estimated).sum()
    }

    /// Move to `stage`. Stages skipped on the way count as finished.
    ///
    /// Returns false for stages outside the plan, for moving backwards and
    /// after the tracker has stopped.
    pub fn enter_at(&mut self, stage: ProgressStage, now: Instant) -> bool {
        if matches!(self.state, ProgressState::Completed | ProgressState::Failed) {
            return false;
        }
        let Some(index) = self.plan.iter().position(|s| *s == stage) else {
            tracing::warn!(stage = ?stage, "Stage not part of progress plan");
            return false;
        };
        if let Some((current, _)) = self.current {
            if index < current {
                return false;
            }
            if index == current {
                return true;
            }
        }

        self.started.get_or_insert(now);
        self.current = Some((index, now));
        self.state = ProgressState::Running;
        true
    }

    pub fn enter(&mut self, stage: ProgressStage) -> bool {
        self.enter_at(stage, Instant::now())
    }

    pub fn complete_at(&mut self, now: Instant) {
        self.started.get_or_insert(now);
        self.state = ProgressState::Completed;
        self.stopped_at = Some(now);
    }

    pub fn complete(&mut self) {
        self.complete_at(Instant::now());
    }

    /// Freeze progress where it is.
    pub fn fail_at(&mut self, now: Instant) {
        if self.state != ProgressState::Completed {
            self.started.get_or_insert(now);
            self.state = ProgressState::Failed;
            self.stopped_at = Some(now);
        }
    }

    pub fn fail(&mut self) {
        self.fail_at(Instant::now());
    }

    pub fn snapshot_at(&self, now: Instant) -> ProgressSnapshot {
        let total = self.total_estimate();
        let now = self.stopped_at.map_or(now, |stopped| stopped.min(now));
        let elapsed = self
            .started
            .map_or(Duration::ZERO, |started| now.saturating_duration_since(started));
        let stage = self.current.map(|(index, _)| self.plan[index]);

        if self.state == ProgressState::Completed {
            return ProgressSnapshot {
                stage,
                message: "Complete".to_string(),
                percentage: 100.0,
                elapsed,
                eta: Duration::ZERO,
                state: self.state,
            };
        }

        let covered = match self.current {
            Some((index, entered)) => {
                let finished: Duration = self.plan[..index].iter().map(ProgressStage::estimated).sum();
                let partial = now
                    .saturating_duration_since(entered)
                    .min(self.plan[index].estimated());
                finished + partial
            }
            None => Duration::ZERO,
        };

        let percentage = if total.is_zero() {
            0.0
        } else {
            (covered.as_secs_f64() / total.as_secs_f64() * 100.0).min(RUNNING_CAP)
        };

        ProgressSnapshot {
            stage,
            message: stage.map_or("Waiting to start", |s| s.message()).to_string(),
            percentage,
            elapsed,
            eta: total.saturating_sub(covered),
            state: self.state,
        }
    }

    /// Progress as of now.
    pub fn snapshot(&self) -> ProgressSnapshot {
        self.snapshot_at(Instant::now())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_pending_tracker() {
        let tracker = ProgressTracker::analysis();
        let snap = tracker.snapshot();
        assert_eq!(snap.percentage, 0.0);
        assert_eq!(snap.eta, Duration::from_millis(7300));
        assert_eq!(snap.state, ProgressState::Pending);
    }

    #[test]
    fn test_partial_stage_counts_up_to_estimate() {
        let t0 = Instant::now();
        let mut tracker = ProgressTracker::voice_consultation(); // 6300 ms total
        tracker.enter_at(ProgressStage::Initializing, t0);
        tracker.enter_at(ProgressStage::Transcribing, t0 + Duration::from_millis(500));

        // 1000 ms into a 2000 ms stage: 1500 of 6300 covered
        let snap = tracker.snapshot_at(t0 + Duration::from_millis(1500));
        assert!((snap.percentage - 1500.0 / 6300.0 * 100.0).abs() < 1e-9);
        assert_eq!(snap.eta, Duration::from_millis(4800));

        // overrunning the estimate stalls instead of advancing
        let late = tracker.snapshot_at(t0 + Duration::from_secs(60));
        assert!((late.percentage - 2500.0 / 6300.0 * 100.0).abs() < 1e-9);
    }

    #[test]
    fn test_capped_until_complete() {
        let t0 = Instant::now();
        let mut tracker = ProgressTracker::text_consultation();
        tracker.enter_at(ProgressStage::Finalizing, t0);
        let snap = tracker.snapshot_at(t0 + Duration::from_secs(5));
        assert_eq!(snap.percentage, 95.0);

        tracker.complete_at(t0 + Duration::from_secs(6));
        let snap = tracker.snapshot_at(t0 + Duration::from_secs(7));
        assert_eq!(snap.percentage, 100.0);
        assert_eq!(snap.eta, Duration::ZERO);
        assert_eq!(snap.elapsed, Duration::from_secs(6));
    }

    #[test]
    fn test_backwards_and_unknown_stages_ignored() {
        let t0 = Instant::now();
        let mut tracker = ProgressTracker::text_consultation();
        assert!(tracker.enter_at(ProgressStage::Synthesizing, t0));
        assert!(!tracker.enter_at(ProgressStage::AnalyzingSymptoms, t0));
        assert!(!tracker.enter_at(ProgressStage::Transcribing, t0));
        assert_eq!(tracker.snapshot_at(t0).stage, Some(ProgressStage::Synthesizing));
    }

    #[test]
    fn test_failed_tracker_freezes() {
        let t0 = Instant::now();
        let mut tracker = ProgressTracker::analysis();
        tracker.enter_at(ProgressStage::AnalyzingSymptoms, t0);
        tracker.fail_at(t0 + Duration::from_millis(100));

        let a = tracker.snapshot_at(t0 + Duration::from_secs(1));
        let b = tracker.snapshot_at(t0 + Duration::from_secs(10));
        assert_eq!(a, b);
        assert_eq!(a.state, ProgressState::Failed);
        assert!(!tracker.enter_at(ProgressStage::Finalizing, t0));
    }

    #[test]
    fn test_progress_is_monotonic_across_stages() {
        let t0 = Instant::now();
        let mut tracker = ProgressTracker::analysis();
        let mut last = 0.0;
        for (i, stage) in tracker.plan().to_vec().into_iter().enumerate() {
            let at = t0 + Duration::from_millis(100 * i as u64);
            tracker.enter_at(stage, at);
            let pct = tracker.snapshot_at(at + Duration::from_millis(50)).percentage;
            assert!(pct >= last);
            last = pct;
        }
    }
}
