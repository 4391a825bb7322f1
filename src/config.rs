use serde::{Deserialize, Serialize};

use crate::error::{EngineError, Result};
use crate::resilience::budget::BudgetConfig;
use crate::resilience::retry::Backoff;

/// Configuration for run execution behavior.
///
/// The engine holds a default config; a `GraphSpec` may carry overrides
/// which are merged over the defaults before a run starts.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RunConfig {
    /// Default retry budget for nodes that do not declare their own.
    pub max_retries: u32,
    /// Default backoff schedule between retry attempts.
    pub backoff: Backoff,
    /// Maximum number of node executions in one run (0 = unlimited).
    pub max_steps: u32,
    /// Global run deadline in seconds (None = no deadline).
    pub timeout_seconds: Option<u64>,
    /// Per-attempt worker call timeout in seconds.
    pub node_timeout_seconds: u64,
    /// Maximum number of nodes to execute in parallel.
    #[serde(default = "default_max_parallel_nodes")]
    pub max_parallel_nodes: usize,
    /// When set, client-facing pause nodes fail instead of suspending the
    /// run. Used for timer/webhook triggered runs that have no human on
    /// the other end.
    #[serde(default)]
    pub non_interactive: bool,
    /// Budget governor settings for this tenant.
    pub budget: BudgetConfig,
}

fn default_max_parallel_nodes() -> usize {
    3
}

impl Default for RunConfig {
    fn default() -> Self {
        Self {
            max_retries: 3,
            backoff: Backoff::default(),
            max_steps: 200,
            timeout_seconds: Some(3600),
            node_timeout_seconds: 120,
            max_parallel_nodes: default_max_parallel_nodes(),
            non_interactive: false,
            budget: BudgetConfig::default(),
        }
    }
}

/// Per-run overrides, applied over the session config when a run is
/// submitted or resumed.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct RunOptions {
    /// Overrides `RunConfig::non_interactive` for one run. A scheduled
    /// trigger sets this without flipping the whole session.
    pub non_interactive: Option<bool>,
}

/// Per-graph overrides; any field left `None` inherits the engine default.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct RunLimits {
    pub max_retries: Option<u32>,
    pub max_steps: Option<u32>,
    pub timeout_seconds: Option<u64>,
    pub node_timeout_seconds: Option<u64>,
    pub max_parallel_nodes: Option<usize>,
}

impl RunConfig {
    /// Validates configuration values.
    pub fn validate(&self) -> Result<()> {
        if self.max_parallel_nodes == 0 {
            return Err(EngineError::validation_field(
                "max_parallel_nodes must be greater than 0",
                "max_parallel_nodes",
            ));
        }
        if self.node_timeout_seconds == 0 {
            return Err(EngineError::validation_field(
                "node_timeout_seconds must be greater than 0",
                "node_timeout_seconds",
            ));
        }
        if let Some(timeout) = self.timeout_seconds {
            if timeout == 0 {
                return Err(EngineError::validation_field(
                    "timeout_seconds must be greater than 0",
                    "timeout_seconds",
                ));
            }
        }
        self.budget.validate()?;
        Ok(())
    }

    /// Applies per-run options over this config.
    pub fn with_options(&self, options: &RunOptions) -> Self {
        let mut config = self.clone();
        if let Some(non_interactive) = options.non_interactive {
            config.non_interactive = non_interactive;
        }
        config
    }

    /// Merges graph-level limits over this config, returning the
    /// effective configuration for a run.
    pub fn merge(&self, limits: &RunLimits) -> Result<Self> {
        let merged = Self {
            max_retries: limits.max_retries.unwrap_or(self.max_retries),
            backoff: self.backoff.clone(),
            max_steps: limits.max_steps.unwrap_or(self.max_steps),
            timeout_seconds: limits.timeout_seconds.or(self.timeout_seconds),
            node_timeout_seconds: limits
                .node_timeout_seconds
                .unwrap_or(self.node_timeout_seconds),
            max_parallel_nodes: limits.max_parallel_nodes.unwrap_or(self.max_parallel_nodes),
            non_interactive: self.non_interactive,
            budget: self.budget.clone(),
        };
        merged.validate()?;
        Ok(merged)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_is_valid() {
        RunConfig::default().validate().unwrap();
    }

    #[test]
    fn test_zero_parallelism_rejected() {
        let cfg = RunConfig {
            max_parallel_nodes: 0,
            ..Default::default()
        };
        assert!(cfg.validate().is_err());
    }

    #[test]
    fn test_merge_overrides() {
        let base = RunConfig::default();
        let limits = RunLimits {
            max_retries: Some(1),
            max_steps: Some(10),
            ..Default::default()
        };
        let merged = base.merge(&limits).unwrap();
        assert_eq!(merged.max_retries, 1);
        assert_eq!(merged.max_steps, 10);
        assert_eq!(merged.max_parallel_nodes, base.max_parallel_nodes);
    }
}
