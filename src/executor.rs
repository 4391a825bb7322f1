//! Node execution: gathers inputs, dispatches to an external [`Worker`],
//! applies the resilience pipeline, and normalizes the outcome into a
//! [`NodeResult`]. Never returns an `Err`: all internal failures become a
//! failed result with an error classification.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use dashmap::DashMap;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tokio::time::timeout;
use tracing::{debug, warn};

use crate::config::RunConfig;
use crate::error::{EngineError, ErrorClass};
use crate::graph::node::{NodeSpec, RetryPolicy};
use crate::graph::spec::Graph;
use crate::memory::SharedMemory;
use crate::resilience::budget::Admission;
use crate::resilience::ResilienceLayer;

pub type JsonMap = serde_json::Map<String, Value>;

/// Per-execution metrics reported by the worker.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct NodeMetrics {
    pub duration_ms: u64,
    pub tokens: u64,
    pub cost: f64,
}

/// Classified worker failure.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WorkerFailure {
    pub class: ErrorClass,
    pub message: String,
}

/// Structured contract a worker returns. The engine never inspects
/// content beyond this shape.
#[derive(Debug, Clone)]
pub struct WorkerOutput {
    pub success: bool,
    pub outputs: JsonMap,
    pub error: Option<WorkerFailure>,
    pub metrics: NodeMetrics,
}

impl WorkerOutput {
    pub fn ok(outputs: JsonMap) -> Self {
        Self {
            success: true,
            outputs,
            error: None,
            metrics: NodeMetrics::default(),
        }
    }

    pub fn fail(class: ErrorClass, message: impl Into<String>) -> Self {
        Self {
            success: false,
            outputs: JsonMap::new(),
            error: Some(WorkerFailure {
                class,
                message: message.into(),
            }),
            metrics: NodeMetrics::default(),
        }
    }

    pub fn with_metrics(mut self, metrics: NodeMetrics) -> Self {
        self.metrics = metrics;
        self
    }
}

/// Staging area accumulator nodes write partial output into. Flushed to
/// shared memory on failure or cancellation so a later resume observes
/// correct values.
#[derive(Debug, Clone, Default)]
pub struct Accumulator {
    staged: Arc<std::sync::Mutex<JsonMap>>,
}

impl Accumulator {
    pub fn stage(&self, key: impl Into<String>, value: Value) {
        self.staged
            .lock()
            .expect("accumulator poisoned")
            .insert(key.into(), value);
    }

    pub fn drain(&self) -> JsonMap {
        std::mem::take(&mut *self.staged.lock().expect("accumulator poisoned"))
    }
}

/// Context handed to workers alongside the node payload.
#[derive(Debug, Clone)]
pub struct WorkerContext {
    pub run_id: String,
    /// Set by the budget governor: the worker should pick a cheaper
    /// variant of itself.
    pub degraded: bool,
    pub accumulator: Accumulator,
}

impl WorkerContext {
    pub fn new(run_id: &str) -> Self {
        Self {
            run_id: run_id.to_string(),
            degraded: false,
            accumulator: Accumulator::default(),
        }
    }
}

/// External work implementation, keyed by node kind or a named override.
#[async_trait]
pub trait Worker: Send + Sync {
    async fn execute(
        &self,
        node: &NodeSpec,
        inputs: JsonMap,
        ctx: &WorkerContext,
    ) -> anyhow::Result<WorkerOutput>;
}

/// Registry of workers. Lookup order: the node's named worker override,
/// then the worker registered for its kind.
#[derive(Default)]
pub struct WorkerRegistry {
    workers: DashMap<String, Arc<dyn Worker>>,
}

impl WorkerRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&self, name: &str, worker: Arc<dyn Worker>) {
        debug!(worker = name, "registered worker");
        self.workers.insert(name.to_string(), worker);
    }

    pub fn resolve(&self, node: &NodeSpec) -> Option<Arc<dyn Worker>> {
        self.workers.get(node.dependency()).map(|w| w.clone())
    }
}

/// Outcome of one node execution. Immutable once returned.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NodeResult {
    pub node_id: String,
    pub success: bool,
    pub outputs: JsonMap,
    pub error: Option<WorkerFailure>,
    pub metrics: NodeMetrics,
    /// Total worker calls made, including retries.
    pub attempts: u32,
}

impl NodeResult {
    pub fn succeeded(node_id: &str, outputs: JsonMap, metrics: NodeMetrics, attempts: u32) -> Self {
        Self {
            node_id: node_id.to_string(),
            success: true,
            outputs,
            error: None,
            metrics,
            attempts,
        }
    }

    pub fn failed(
        node_id: &str,
        class: ErrorClass,
        message: impl Into<String>,
        metrics: NodeMetrics,
        attempts: u32,
    ) -> Self {
        Self {
            node_id: node_id.to_string(),
            success: false,
            outputs: JsonMap::new(),
            error: Some(WorkerFailure {
                class,
                message: message.into(),
            }),
            metrics,
            attempts,
        }
    }

    pub fn error_class(&self) -> Option<ErrorClass> {
        self.error.as_ref().map(|e| e.class)
    }
}

/// Dispatches node work through the resilience pipeline.
pub struct NodeExecutor {
    registry: Arc<WorkerRegistry>,
    resilience: Arc<ResilienceLayer>,
}

impl NodeExecutor {
    pub fn new(registry: Arc<WorkerRegistry>, resilience: Arc<ResilienceLayer>) -> Self {
        Self {
            registry,
            resilience,
        }
    }

    pub fn resilience(&self) -> &Arc<ResilienceLayer> {
        &self.resilience
    }

    /// Executes one node. Inputs are gathered from shared memory; outputs
    /// commit atomically on success only. Accumulator nodes additionally
    /// flush staged partial output on failure.
    pub async fn execute(
        &self,
        node: &NodeSpec,
        graph: &Graph,
        memory: &SharedMemory,
        config: &RunConfig,
        ctx: &mut WorkerContext,
    ) -> NodeResult {
        // Fail fast on absent required inputs.
        let required = graph.required_input_keys(node);
        let missing = memory.missing_keys(&required).await;
        if !missing.is_empty() {
            return NodeResult::failed(
                &node.id,
                ErrorClass::InputMissing,
                EngineError::input_missing(&node.id, missing).to_string(),
                NodeMetrics::default(),
                0,
            );
        }

        let mut inputs = JsonMap::new();
        for key in &node.input_keys {
            if let Some(value) = memory.get(key).await {
                inputs.insert(key.clone(), value);
            }
        }

        let Some(worker) = self.registry.resolve(node) else {
            return NodeResult::failed(
                &node.id,
                ErrorClass::Permanent,
                format!("no worker registered for '{}'", node.dependency()),
                NodeMetrics::default(),
                0,
            );
        };

        // Budget admission happens once per node execution; committed
        // work is never altered retroactively.
        let budget = self.resilience.budget();
        match budget.admit(node.kind).await {
            Admission::Allow => {}
            Admission::Degrade => ctx.degraded = true,
            Admission::Throttle(delay) => {
                debug!(node = %node.id, ?delay, "budget throttle before execution");
                tokio::time::sleep(delay).await;
            }
            Admission::Block => {
                let spent = budget.spent().await;
                return NodeResult::failed(
                    &node.id,
                    ErrorClass::Permanent,
                    budget.blocked_error(spent).to_string(),
                    NodeMetrics::default(),
                    0,
                );
            }
        }

        let policy = node.retry.clone().unwrap_or(RetryPolicy {
            max_retries: config.max_retries,
            backoff: config.backoff.clone(),
        });
        let dependency = node.dependency().to_string();
        let breaker = self.resilience.breaker(&dependency);
        let limiter = self.resilience.limiter(&dependency);
        let attempt_timeout = Duration::from_secs(config.node_timeout_seconds);

        let mut attempts = 0u32;
        let mut metrics = NodeMetrics::default();
        let mut last_failure = WorkerFailure {
            class: ErrorClass::Permanent,
            message: "not executed".to_string(),
        };

        while attempts <= policy.max_retries {
            attempts += 1;

            let failure = match self
                .attempt(
                    node,
                    &*worker,
                    inputs.clone(),
                    ctx,
                    &breaker,
                    &limiter,
                    attempt_timeout,
                )
                .await
            {
                Ok(output) => {
                    metrics = accumulate(metrics, &output.metrics);
                    budget.record(output.metrics.cost).await;

                    if output.success {
                        // A successful call missing a required output key
                        // is itself a failure.
                        let absent: Vec<&String> = node
                            .required_output_keys()
                            .filter(|k| !output.outputs.contains_key(*k))
                            .collect();
                        if !absent.is_empty() {
                            breaker.on_failure().await;
                            WorkerFailure {
                                class: ErrorClass::IncompleteOutput,
                                message: format!(
                                    "node '{}' succeeded without required outputs {absent:?}",
                                    node.id
                                ),
                            }
                        } else {
                            breaker.on_success().await;
                            memory.commit(output.outputs.clone()).await;
                            return NodeResult::succeeded(
                                &node.id,
                                output.outputs,
                                metrics,
                                attempts,
                            );
                        }
                    } else {
                        breaker.on_failure().await;
                        output.error.unwrap_or(WorkerFailure {
                            class: ErrorClass::Permanent,
                            message: "worker reported failure without detail".to_string(),
                        })
                    }
                }
                Err(failure) => failure,
            };

            debug!(
                node = %node.id,
                attempt = attempts,
                class = %failure.class,
                "node attempt failed: {}",
                failure.message
            );
            last_failure = failure;

            if !last_failure.class.is_transient() || attempts > policy.max_retries {
                break;
            }
            tokio::time::sleep(policy.backoff.delay(attempts)).await;
        }

        warn!(
            node = %node.id,
            attempts,
            class = %last_failure.class,
            "node failed: {}",
            last_failure.message
        );

        // Accumulator nodes flush whatever partial output the worker
        // staged, so a later resume observes correct values.
        if node.accumulator {
            let staged = ctx.accumulator.drain();
            if !staged.is_empty() {
                memory.commit(staged).await;
            }
        }

        NodeResult::failed(
            &node.id,
            last_failure.class,
            last_failure.message,
            metrics,
            attempts,
        )
    }

    #[allow(clippy::too_many_arguments)]
    async fn attempt(
        &self,
        node: &NodeSpec,
        worker: &dyn Worker,
        inputs: JsonMap,
        ctx: &WorkerContext,
        breaker: &crate::resilience::breaker::CircuitBreaker,
        limiter: &crate::resilience::rate::RateLimiter,
        attempt_timeout: Duration,
    ) -> Result<WorkerOutput, WorkerFailure> {
        // Fail fast without a call while the circuit is open.
        if let Err(e) = breaker.check().await {
            return Err(WorkerFailure {
                class: ErrorClass::TransientIo,
                message: e.to_string(),
            });
        }

        if let Err(e) = limiter.acquire().await {
            // Local throttling is not a dependency failure, but a granted
            // half-open trial slot must not leak.
            breaker.on_trial_abandoned().await;
            return Err(WorkerFailure {
                class: ErrorClass::RateLimited,
                message: e.to_string(),
            });
        }

        match timeout(attempt_timeout, worker.execute(node, inputs, ctx)).await {
            Ok(Ok(output)) => Ok(output),
            Ok(Err(e)) => {
                breaker.on_failure().await;
                // Worker-internal errors are treated as transient
                // infrastructure failures; declared permanent failures
                // come back as a structured WorkerOutput instead.
                Err(WorkerFailure {
                    class: ErrorClass::TransientIo,
                    message: e.to_string(),
                })
            }
            Err(_) => {
                breaker.on_failure().await;
                Err(WorkerFailure {
                    class: ErrorClass::Timeout,
                    message: EngineError::timeout(
                        format!("worker call for node '{}'", node.id),
                        attempt_timeout.as_millis() as u64,
                    )
                    .to_string(),
                })
            }
        }
    }
}

fn accumulate(mut total: NodeMetrics, attempt: &NodeMetrics) -> NodeMetrics {
    total.duration_ms += attempt.duration_ms;
    total.tokens += attempt.tokens;
    total.cost += attempt.cost;
    total
}
