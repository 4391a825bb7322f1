use std::time::Duration;

use serde::{Deserialize, Serialize};
use tokio::sync::Mutex;
use tracing::{info, warn};

use crate::error::{EngineError, Result};
use crate::graph::node::NodeKind;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BudgetConfig {
    /// Spend cap for the tenant. `None` disables governance.
    pub cap: Option<f64>,
    /// Fraction of the cap at which generative work degrades to a
    /// cheaper worker.
    pub degrade_at: f64,
    /// Fraction of the cap at which generative work is delayed.
    pub throttle_at: f64,
    /// Delay applied while throttled.
    pub throttle_delay_ms: u64,
}

impl Default for BudgetConfig {
    fn default() -> Self {
        Self {
            cap: None,
            degrade_at: 0.80,
            throttle_at: 0.95,
            throttle_delay_ms: 2_000,
        }
    }
}

impl BudgetConfig {
    pub fn validate(&self) -> Result<()> {
        if !(0.0..=1.0).contains(&self.degrade_at) || !(0.0..=1.0).contains(&self.throttle_at) {
            return Err(EngineError::validation_field(
                "budget thresholds must be between 0 and 1",
                "budget",
            ));
        }
        if self.degrade_at > self.throttle_at {
            return Err(EngineError::validation_field(
                "degrade_at must not exceed throttle_at",
                "budget",
            ));
        }
        Ok(())
    }
}

/// Admission decision for one node execution.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum Admission {
    Allow,
    /// Run, but signal the worker to pick a cheaper variant.
    Degrade,
    /// Run after a delay.
    Throttle(Duration),
    /// Refuse new generative work.
    Block,
}

/// Tracks cumulative spend against a cap and progressively restricts
/// generative work: allow -> degrade -> throttle -> block.
///
/// Already-committed work is never altered retroactively, and
/// non-generative nodes are always admitted, so a run can still reach a
/// terminal node through a non-generative path while generative work is
/// blocked.
#[derive(Debug)]
pub struct BudgetGovernor {
    config: BudgetConfig,
    spent: Mutex<f64>,
}

impl BudgetGovernor {
    pub fn new(config: BudgetConfig) -> Self {
        Self {
            config,
            spent: Mutex::new(0.0),
        }
    }

    pub async fn admit(&self, kind: NodeKind) -> Admission {
        if kind != NodeKind::Generative {
            return Admission::Allow;
        }
        let cap = match self.config.cap {
            Some(cap) if cap > 0.0 => cap,
            _ => return Admission::Allow,
        };
        let spent = *self.spent.lock().await;
        let fraction = spent / cap;

        if fraction >= 1.0 {
            warn!(spent, cap, "budget exhausted, blocking generative work");
            Admission::Block
        } else if fraction >= self.config.throttle_at {
            info!(spent, cap, "budget near cap, throttling generative work");
            Admission::Throttle(Duration::from_millis(self.config.throttle_delay_ms))
        } else if fraction >= self.config.degrade_at {
            Admission::Degrade
        } else {
            Admission::Allow
        }
    }

    /// Records committed spend. Called after a worker call completes,
    /// successful or not.
    pub async fn record(&self, cost: f64) {
        if cost > 0.0 {
            *self.spent.lock().await += cost;
        }
    }

    pub async fn spent(&self) -> f64 {
        *self.spent.lock().await
    }

    pub fn blocked_error(&self, spent: f64) -> EngineError {
        EngineError::BudgetBlocked {
            spent,
            cap: self.config.cap.unwrap_or(0.0),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn governor(cap: f64) -> BudgetGovernor {
        BudgetGovernor::new(BudgetConfig {
            cap: Some(cap),
            ..Default::default()
        })
    }

    #[tokio::test]
    async fn test_progressive_restriction() {
        let g = governor(100.0);
        assert_eq!(g.admit(NodeKind::Generative).await, Admission::Allow);

        g.record(85.0).await;
        assert_eq!(g.admit(NodeKind::Generative).await, Admission::Degrade);

        g.record(11.0).await; // 96%
        assert!(matches!(
            g.admit(NodeKind::Generative).await,
            Admission::Throttle(_)
        ));

        g.record(10.0).await; // over cap
        assert_eq!(g.admit(NodeKind::Generative).await, Admission::Block);
    }

    #[tokio::test]
    async fn test_non_generative_always_admitted() {
        let g = governor(10.0);
        g.record(100.0).await;
        assert_eq!(g.admit(NodeKind::Generative).await, Admission::Block);
        assert_eq!(g.admit(NodeKind::Function).await, Admission::Allow);
        assert_eq!(g.admit(NodeKind::Tool).await, Admission::Allow);
        assert_eq!(g.admit(NodeKind::HumanInput).await, Admission::Allow);
    }

    #[tokio::test]
    async fn test_no_cap_means_no_governance() {
        let g = BudgetGovernor::new(BudgetConfig::default());
        g.record(1_000_000.0).await;
        assert_eq!(g.admit(NodeKind::Generative).await, Admission::Allow);
    }
}
