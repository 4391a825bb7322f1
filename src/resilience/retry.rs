use std::time::Duration;

use serde::{Deserialize, Serialize};

/// Backoff schedule between retry attempts.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "strategy", rename_all = "snake_case")]
pub enum Backoff {
    /// Exponential backoff with configurable parameters.
    Exponential {
        initial_delay_ms: u64,
        max_delay_ms: u64,
        multiplier: f64,
    },
    /// Linear backoff with fixed delay.
    Linear { delay_ms: u64 },
    /// No delay between retries.
    Immediate,
}

impl Default for Backoff {
    fn default() -> Self {
        Self::Exponential {
            initial_delay_ms: 500,
            max_delay_ms: 60_000,
            multiplier: 2.0,
        }
    }
}

impl Backoff {
    /// Delay before retry number `attempt` (1-based), with ±10% jitter to
    /// avoid synchronized retries across runs.
    pub fn delay(&self, attempt: u32) -> Duration {
        let base_ms = match self {
            Backoff::Exponential {
                initial_delay_ms,
                max_delay_ms,
                multiplier,
            } => {
                let factor = multiplier.powi(attempt.saturating_sub(1) as i32);
                ((*initial_delay_ms as f64) * factor).min(*max_delay_ms as f64)
            }
            Backoff::Linear { delay_ms } => *delay_ms as f64,
            Backoff::Immediate => return Duration::ZERO,
        };
        let jitter = 1.0 + (fastrand::f64() - 0.5) * 0.2;
        Duration::from_millis((base_ms * jitter).max(0.0) as u64)
    }
}
