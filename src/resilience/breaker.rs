use std::time::{Duration, Instant};

use serde::{Deserialize, Serialize};
use tokio::sync::Mutex;
use tracing::{debug, warn};

use crate::error::{EngineError, Result};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BreakerState {
    Closed,
    Open,
    HalfOpen,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BreakerConfig {
    /// Consecutive failures before the circuit opens.
    pub failure_threshold: u32,
    /// How long the circuit stays open before allowing a single trial.
    pub cooldown_ms: u64,
}

impl Default for BreakerConfig {
    fn default() -> Self {
        Self {
            failure_threshold: 5,
            cooldown_ms: 30_000,
        }
    }
}

#[derive(Debug)]
struct BreakerInner {
    state: BreakerState,
    consecutive_failures: u32,
    opened_at: Option<Instant>,
    /// At most one trial call may be in flight while half-open.
    trial_in_flight: bool,
}

/// Circuit breaker for one external dependency, shared across runs.
///
/// Closed -> Open after `failure_threshold` consecutive failures (calls
/// fail fast, nothing is attempted) -> HalfOpen after the cooldown
/// (single trial) -> Closed on success, back to Open on failure.
#[derive(Debug)]
pub struct CircuitBreaker {
    dependency: String,
    config: BreakerConfig,
    inner: Mutex<BreakerInner>,
}

impl CircuitBreaker {
    pub fn new(dependency: &str, config: BreakerConfig) -> Self {
        Self {
            dependency: dependency.to_string(),
            config,
            inner: Mutex::new(BreakerInner {
                state: BreakerState::Closed,
                consecutive_failures: 0,
                opened_at: None,
                trial_in_flight: false,
            }),
        }
    }

    /// Gate a call. Returns `CircuitOpen` without attempting anything when
    /// the dependency is considered down.
    pub async fn check(&self) -> Result<()> {
        let mut inner = self.inner.lock().await;
        match inner.state {
            BreakerState::Closed => Ok(()),
            BreakerState::Open => {
                let elapsed = inner.opened_at.map(|t| t.elapsed()).unwrap_or_default();
                if elapsed >= Duration::from_millis(self.config.cooldown_ms) {
                    debug!(dependency = %self.dependency, "circuit half-open, allowing trial");
                    inner.state = BreakerState::HalfOpen;
                    inner.trial_in_flight = true;
                    Ok(())
                } else {
                    Err(EngineError::CircuitOpen {
                        dependency: self.dependency.clone(),
                    })
                }
            }
            BreakerState::HalfOpen => {
                if inner.trial_in_flight {
                    Err(EngineError::CircuitOpen {
                        dependency: self.dependency.clone(),
                    })
                } else {
                    inner.trial_in_flight = true;
                    Ok(())
                }
            }
        }
    }

    /// Releases a granted trial slot without recording an outcome, for
    /// attempts that abort before the dependency is actually called
    /// (rate-limit wait exhausted, cancellation). The circuit stays in
    /// its current state and the next `check` may take the trial.
    pub async fn on_trial_abandoned(&self) {
        let mut inner = self.inner.lock().await;
        inner.trial_in_flight = false;
    }

    pub async fn on_success(&self) {
        let mut inner = self.inner.lock().await;
        if inner.state != BreakerState::Closed {
            debug!(dependency = %self.dependency, "circuit closed after successful trial");
        }
        inner.state = BreakerState::Closed;
        inner.consecutive_failures = 0;
        inner.opened_at = None;
        inner.trial_in_flight = false;
    }

    pub async fn on_failure(&self) {
        let mut inner = self.inner.lock().await;
        inner.trial_in_flight = false;
        match inner.state {
            BreakerState::HalfOpen => {
                warn!(dependency = %self.dependency, "trial call failed, circuit re-opened");
                inner.state = BreakerState::Open;
                inner.opened_at = Some(Instant::now());
            }
            BreakerState::Closed => {
                inner.consecutive_failures += 1;
                if inner.consecutive_failures >= self.config.failure_threshold {
                    warn!(
                        dependency = %self.dependency,
                        failures = inner.consecutive_failures,
                        "failure threshold reached, circuit opened"
                    );
                    inner.state = BreakerState::Open;
                    inner.opened_at = Some(Instant::now());
                }
            }
            BreakerState::Open => {}
        }
    }

    pub async fn state(&self) -> BreakerState {
        self.inner.lock().await.state
    }
}
