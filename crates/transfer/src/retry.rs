use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::config::millis;

/// Exponential backoff for transient chunk errors.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RetryPolicy {
    /// Retries allowed per chunk after the first attempt.
    #[serde(default = "default_max_retries")]
    pub max_retries: u32,
    /// Delay before the first retry.
    #[serde(
        rename = "initial_delay_ms",
        with = "millis",
        default = "default_initial_delay"
    )]
    pub initial_delay: Duration,
    /// Backoff cap.
    #[serde(rename = "max_delay_ms", with = "millis", default = "default_max_delay")]
    pub max_delay: Duration,
    /// Multiplier for each subsequent retry.
    #[serde(default = "default_backoff_factor")]
    pub backoff_factor: f64,
}

fn default_max_retries() -> u32 {
    3
}

fn default_initial_delay() -> Duration {
    Duration::from_millis(250)
}

fn default_max_delay() -> Duration {
    Duration::from_secs(15)
}

fn default_backoff_factor() -> f64 {
    2.0
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_retries: default_max_retries(),
            initial_delay: default_initial_delay(),
            max_delay: default_max_delay(),
            backoff_factor: default_backoff_factor(),
        }
    }
}

impl RetryPolicy {
    /// Calculates the delay before retry number `attempt` (1-based).
    ///
    /// Deterministic: retries of one chunk are already spread out by the
    /// chunks around it, and tests rely on predictable timing.
    pub fn delay_for_attempt(&self, attempt: u32) -> Duration {
        let exp = attempt.saturating_sub(1).min(63) as i32;
        let secs = self.initial_delay.as_secs_f64() * self.backoff_factor.powi(exp);
        let capped = secs.min(self.max_delay.as_secs_f64());
        if capped.is_finite() && capped > 0.0 {
            Duration::from_secs_f64(capped)
        } else {
            Duration::ZERO
        }
    }

    /// Whether a chunk that has already been retried `retries` times may
    /// try again.
    pub fn allows_retry(&self, retries: u32) -> bool {
        retries < self.max_retries
    }
}
