//! Delay between retry attempts.

use crate::config::duration_str;
use rand::Rng;
use serde::{Deserialize, Serialize};
use std::time::Duration;

/// Jitter spread applied to exponential delays (±25%).
const JITTER: f64 = 0.25;

/// Maps a 1-based attempt number to the delay before the next attempt.
///
/// Pure apart from jitter; safe to share between concurrent callers.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum BackoffStrategy {
    /// `base * multiplier^(attempt-1)`, capped at `max_delay`
    Exponential {
        #[serde(with = "duration_str")]
        base: Duration,
        multiplier: f64,
        #[serde(with = "duration_str")]
        max_delay: Duration,
        #[serde(default = "default_jitter")]
        jitter: bool,
    },

    /// `base + increment*(attempt-1)`, capped at `max_delay`
    Linear {
        #[serde(with = "duration_str")]
        base: Duration,
        #[serde(with = "duration_str")]
        increment: Duration,
        #[serde(with = "duration_str")]
        max_delay: Duration,
    },

    /// Same delay every time
    Fixed {
        #[serde(with = "duration_str")]
        delay: Duration,
    },
}

fn default_jitter() -> bool {
    true
}

impl Default for BackoffStrategy {
    fn default() -> Self {
        Self::exponential(Duration::from_secs(1), Duration::from_secs(60))
    }
}

impl BackoffStrategy {
    /// Doubling backoff with jitter.
    pub fn exponential(base: Duration, max_delay: Duration) -> Self {
        BackoffStrategy::Exponential {
            base,
            multiplier: 2.0,
            max_delay,
            jitter: true,
        }
    }

    pub fn linear(base: Duration, increment: Duration, max_delay: Duration) -> Self {
        BackoffStrategy::Linear {
            base,
            increment,
            max_delay,
        }
    }

    pub fn fixed(delay: Duration) -> Self {
        BackoffStrategy::Fixed { delay }
    }

    /// Same strategy with jitter turned off.
    pub fn without_jitter(self) -> Self {
        match self {
            BackoffStrategy::Exponential {
                base,
                multiplier,
                max_delay,
                ..
            } => BackoffStrategy::Exponential {
                base,
                multiplier,
                max_delay,
                jitter: false,
            },
            other => other,
        }
    }

    /// Delay after `attempt` failed. Attempt 0 is treated as 1.
    pub fn delay(&self, attempt: u32) -> Duration {
        let delay = self.base_delay(attempt);
        match self {
            BackoffStrategy::Exponential { jitter: true, .. } => {
                let factor = rand::thread_rng().gen_range(1.0 - JITTER..=1.0 + JITTER);
                secs(delay.as_secs_f64() * factor)
            }
            _ => delay,
        }
    }

    /// Delay without jitter.
    pub fn base_delay(&self, attempt: u32) -> Duration {
        let steps = attempt.max(1) - 1;
        match *self {
            BackoffStrategy::Exponential {
                base,
                multiplier,
                max_delay,
                ..
            } => {
                let exponent = i32::try_from(steps).unwrap_or(i32::MAX);
                let raw = base.as_secs_f64() * multiplier.powi(exponent);
                secs(raw.min(max_delay.as_secs_f64()))
            }
            BackoffStrategy::Linear {
                base,
                increment,
                max_delay,
            } => increment
                .checked_mul(steps)
                .and_then(|extra| base.checked_add(extra))
                .map_or(max_delay, |delay| delay.min(max_delay)),
            BackoffStrategy::Fixed { delay } => delay,
        }
    }
}

/// Negative and non-finite delays clamp to zero.
fn secs(value: f64) -> Duration {
    Duration::try_from_secs_f64(value).unwrap_or(Duration::ZERO)
}
