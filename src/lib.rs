//! Goal-driven graph execution engine.
//!
//! Workflows are explicit graphs: typed nodes joined by gated edges,
//! validated at load time and immutable afterwards. A [`Session`] hosts
//! graphs, workers, and the resilience layer; a run advances through the
//! scheduler, records every choice in a decision trail, and can pause
//! for human input and resume later from persisted state.

pub mod condition;
pub mod config;
pub mod error;
pub mod events;
pub mod executor;
pub mod graph;
pub mod memory;
pub mod recorder;
pub mod resilience;
pub mod scheduler;
pub mod session;

// Re-exports for convenience
pub use condition::{DecisionProvider, ProviderChoice};
pub use config::{RunConfig, RunLimits, RunOptions};
pub use error::{EngineError, ErrorClass, Result};
pub use events::{BufferingSink, EngineEvent, EventEnvelope, EventSink, LoggingSink};
pub use executor::{
    JsonMap, NodeExecutor, NodeMetrics, NodeResult, Worker, WorkerContext, WorkerOutput,
    WorkerRegistry,
};
pub use graph::{
    Constraint, ConstraintKind, EdgeCondition, EdgeSpec, Goal, Graph, GraphSpec, NodeKind,
    NodeSpec, RetryPolicy, SuccessCriterion,
};
pub use memory::{lookup_path, MemorySnapshot, SharedMemory};
pub use recorder::{
    Decision, DecisionOutcome, MemoryStore, Run, RunRecorder, RunStatus, RunStore, SledStore,
    Summary,
};
pub use resilience::budget::{Admission, BudgetConfig, BudgetGovernor};
pub use resilience::breaker::{BreakerConfig, BreakerState, CircuitBreaker};
pub use resilience::rate::{RateConfig, RateLimiter};
pub use resilience::retry::Backoff;
pub use resilience::ResilienceLayer;
pub use scheduler::{ExecutionState, GraphRunner, RunOutcome};
pub use session::{EscalationOutcome, Session};
