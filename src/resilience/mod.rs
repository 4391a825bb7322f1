//! Resilience policies wrapping worker calls: retry/backoff, circuit
//! breakers, rate limiting, and budget governance.
//!
//! Breakers and limiters are scoped per external dependency and shared
//! across runs; the registry is safe under concurrent access.

pub mod breaker;
pub mod budget;
pub mod rate;
pub mod retry;

use std::sync::Arc;

use dashmap::DashMap;

use breaker::{BreakerConfig, CircuitBreaker};
use budget::{BudgetConfig, BudgetGovernor};
use rate::{RateConfig, RateLimiter};

/// Per-tenant registry of resilience state.
pub struct ResilienceLayer {
    breaker_config: BreakerConfig,
    rate_config: RateConfig,
    breakers: DashMap<String, Arc<CircuitBreaker>>,
    limiters: DashMap<String, Arc<RateLimiter>>,
    budget: Arc<BudgetGovernor>,
}

impl ResilienceLayer {
    pub fn new(
        breaker_config: BreakerConfig,
        rate_config: RateConfig,
        budget_config: BudgetConfig,
    ) -> Self {
        Self {
            breaker_config,
            rate_config,
            breakers: DashMap::new(),
            limiters: DashMap::new(),
            budget: Arc::new(BudgetGovernor::new(budget_config)),
        }
    }

    pub fn with_budget(budget_config: BudgetConfig) -> Self {
        Self::new(BreakerConfig::default(), RateConfig::default(), budget_config)
    }

    pub fn breaker(&self, dependency: &str) -> Arc<CircuitBreaker> {
        self.breakers
            .entry(dependency.to_string())
            .or_insert_with(|| {
                Arc::new(CircuitBreaker::new(dependency, self.breaker_config.clone()))
            })
            .clone()
    }

    pub fn limiter(&self, dependency: &str) -> Arc<RateLimiter> {
        self.limiters
            .entry(dependency.to_string())
            .or_insert_with(|| Arc::new(RateLimiter::new(dependency, self.rate_config.clone())))
            .clone()
    }

    pub fn budget(&self) -> &Arc<BudgetGovernor> {
        &self.budget
    }
}

impl Default for ResilienceLayer {
    fn default() -> Self {
        Self::new(
            BreakerConfig::default(),
            RateConfig::default(),
            BudgetConfig::default(),
        )
    }
}
