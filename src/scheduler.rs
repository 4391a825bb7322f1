//! The graph execution state machine.
//!
//! One run advances cooperatively: ready nodes whose inputs are present
//! are drawn from the frontier, provably independent nodes execute as
//! concurrent tasks bounded by a semaphore, and the condition evaluator
//! advances the frontier on each completion. Pause nodes suspend the run
//! until an explicit resume supplies the missing inputs.

use std::collections::{HashMap, HashSet, VecDeque};
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use futures::stream::{FuturesUnordered, StreamExt};
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use tokio::sync::Semaphore;
use tokio::time::Instant;
use tracing::{debug, info, warn};

use crate::condition::{eligible_edges, DecisionProvider};
use crate::config::RunConfig;
use crate::error::{EngineError, ErrorClass, Result};
use crate::events::{EngineEvent, EventEmitter, EventSink};
use crate::executor::{JsonMap, NodeExecutor, NodeResult, WorkerContext};
use crate::graph::spec::Graph;
use crate::memory::{MemorySnapshot, SharedMemory};
use crate::recorder::{Decision, RunRecorder, RunStatus, RunStore};

/// Per-run mutable state. Persisted while a run is paused; discarded
/// once the run reaches a terminal status.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ExecutionState {
    pub run_id: String,
    pub graph_id: String,
    pub goal_id: String,
    pub status: RunStatus,
    pub frontier: VecDeque<String>,
    pub visits: HashMap<String, u32>,
    pub memory: MemorySnapshot,
    /// Earliest next eligibility per node, epoch millis. Backoff/stall
    /// timers survive a pause; they are never reset by resume.
    pub not_before: HashMap<String, i64>,
    pub steps: u32,
    pub paused_node: Option<String>,
    pub missing_inputs: Vec<String>,
    pub started_at: DateTime<Utc>,
    /// Run time consumed before the last pause; counts against the
    /// global deadline after resume.
    pub elapsed_ms: u64,
}

impl ExecutionState {
    fn seed(run_id: &str, graph: &Graph, input: &JsonMap) -> Self {
        let mut memory = MemorySnapshot::new();
        for (k, v) in input {
            memory.insert(k.clone(), v.clone());
        }
        Self {
            run_id: run_id.to_string(),
            graph_id: graph.id().to_string(),
            goal_id: graph.goal_id().to_string(),
            status: RunStatus::Pending,
            frontier: graph.entry_set().into(),
            visits: HashMap::new(),
            memory,
            not_before: HashMap::new(),
            steps: 0,
            paused_node: None,
            missing_inputs: Vec::new(),
            started_at: Utc::now(),
            elapsed_ms: 0,
        }
    }
}

/// What a caller gets back when a run stops advancing.
#[derive(Debug, Clone)]
pub struct RunOutcome {
    pub run_id: String,
    pub graph_id: String,
    pub status: RunStatus,
    pub memory: MemorySnapshot,
    /// Failing node id, when the run failed because of one.
    pub failed_node: Option<String>,
    /// Error classification/reason for a failed run.
    pub failure: Option<String>,
    pub paused_node: Option<String>,
    /// Exactly the inputs a paused run is waiting for.
    pub missing_inputs: Vec<String>,
    /// Most recent decisions, for failure surfaces.
    pub recent_decisions: Vec<Decision>,
    pub anomalies: Vec<String>,
}

/// Drives one graph from its entry set to a terminal status.
pub struct GraphRunner {
    graph: Arc<Graph>,
    executor: Arc<NodeExecutor>,
    store: Arc<dyn RunStore>,
    provider: Option<Arc<dyn DecisionProvider>>,
    sink: Option<Arc<dyn EventSink>>,
    config: RunConfig,
}

struct BatchItem {
    node_id: String,
    decision_id: String,
    result: NodeResult,
}

impl GraphRunner {
    /// Builds a runner with the engine config merged under the graph's
    /// declared limits.
    pub fn new(
        graph: Arc<Graph>,
        executor: Arc<NodeExecutor>,
        store: Arc<dyn RunStore>,
        config: &RunConfig,
    ) -> Result<Self> {
        let merged = config.merge(&graph.spec().limits)?;
        Ok(Self {
            graph,
            executor,
            store,
            provider: None,
            sink: None,
            config: merged,
        })
    }

    pub fn with_provider(mut self, provider: Arc<dyn DecisionProvider>) -> Self {
        self.provider = Some(provider);
        self
    }

    pub fn with_sink(mut self, sink: Arc<dyn EventSink>) -> Self {
        self.sink = Some(sink);
        self
    }

    pub fn graph(&self) -> &Arc<Graph> {
        &self.graph
    }

    /// Starts a fresh run from the graph's entry set.
    pub async fn start(&self, input: JsonMap) -> Result<RunOutcome> {
        let run_id = cuid2::create_id();
        let state = ExecutionState::seed(&run_id, &self.graph, &input);
        let recorder = RunRecorder::new(&run_id, self.graph.goal_id(), self.graph.id());
        info!(run = %run_id, graph = %self.graph.id(), "run starting");
        self.drive(state, recorder).await
    }

    /// Re-enters a paused run with the supplied inputs.
    ///
    /// Rejected synchronously, with stored state untouched, when the run
    /// is not paused. Visit counts and backoff timers carry over from
    /// the persisted state; they are never reset.
    pub async fn resume(&self, run_id: &str, supplied: JsonMap) -> Result<RunOutcome> {
        // The claim removes the persisted state, so of any set of
        // concurrent resumes exactly one proceeds; the rest are
        // rejected here.
        let Some(mut state) = self.store.claim_state(run_id).await? else {
            let actual = match self.store.load_run(run_id).await? {
                // Pause record present but state already claimed: a
                // competing resume is in flight.
                Some(run) if run.status == RunStatus::Paused => "running".to_string(),
                Some(run) => run.status.to_string(),
                None => "unknown".to_string(),
            };
            return Err(EngineError::invalid_run_state(
                run_id.to_string(),
                RunStatus::Paused.to_string(),
                actual,
            ));
        };
        if state.status != RunStatus::Paused {
            self.store.save_state(&state).await?;
            return Err(EngineError::invalid_run_state(
                run_id.to_string(),
                RunStatus::Paused.to_string(),
                state.status.to_string(),
            ));
        }

        for (k, v) in supplied {
            state.memory.insert(k, v);
        }
        state.status = RunStatus::Running;
        let resumed_node = state.paused_node.take();
        state.missing_inputs.clear();

        // The whole prior decision trail carries into the resumed
        // segment, so outcome references stay within one run.
        let recorder = match self.store.load_run(run_id).await? {
            Some(prior) => RunRecorder::resume(
                run_id,
                &state.goal_id,
                &state.graph_id,
                prior.started_at,
                prior.decisions,
            ),
            None => RunRecorder::new(run_id, &state.goal_id, &state.graph_id),
        };

        if let Some(node_id) = &resumed_node {
            let emitter = EventEmitter::new(run_id, self.graph.id(), self.sink.clone());
            emitter.emit(EngineEvent::RunResumed {
                node_id: node_id.clone(),
            });
        }
        info!(run = %run_id, "run resuming");
        self.drive(state, recorder).await
    }

    async fn drive(&self, mut state: ExecutionState, recorder: RunRecorder) -> Result<RunOutcome> {
        let graph = &self.graph;
        let memory = SharedMemory::from_snapshot(state.memory.clone());
        let emitter = EventEmitter::new(&state.run_id, graph.id(), self.sink.clone());
        let semaphore = Arc::new(Semaphore::new(self.config.max_parallel_nodes));
        let run_started = Instant::now();
        let deadline = self.config.timeout_seconds.map(|secs| {
            run_started + Duration::from_secs(secs).saturating_sub(Duration::from_millis(state.elapsed_ms))
        });

        state.status = RunStatus::Running;

        loop {
            if self.config.max_steps > 0 && state.steps >= self.config.max_steps {
                return self
                    .finish_failed(
                        state,
                        recorder,
                        &memory,
                        &emitter,
                        run_started,
                        None,
                        format!("exceeded max_steps ({})", self.config.max_steps),
                    )
                    .await;
            }
            if let Some(deadline) = deadline {
                if Instant::now() >= deadline {
                    return self
                        .finish_failed(
                            state,
                            recorder,
                            &memory,
                            &emitter,
                            run_started,
                            None,
                            "exceeded global timeout".to_string(),
                        )
                        .await;
                }
            }

            // Scan the frontier for ready nodes, dropping nodes over
            // their visit cap.
            let now_ms = Utc::now().timestamp_millis();
            let mut ready: Vec<String> = Vec::new();
            let mut waiting_on_timer = false;
            let mut kept: VecDeque<String> = VecDeque::new();
            while let Some(node_id) = state.frontier.pop_front() {
                let Some(node) = graph.node(&node_id) else {
                    continue;
                };
                let visits = *state.visits.get(&node_id).unwrap_or(&0);
                if node.max_visits > 0 && visits >= node.max_visits {
                    debug!(node = %node_id, visits, "visit cap reached, dropping from frontier");
                    continue;
                }
                if let Some(&t) = state.not_before.get(&node_id) {
                    if now_ms < t {
                        waiting_on_timer = true;
                        kept.push_back(node_id);
                        continue;
                    }
                }
                let required = graph.required_input_keys(node);
                let missing = memory.missing_keys(&required).await;
                if missing.is_empty() || graph.is_pause(&node_id) {
                    ready.push(node_id);
                } else {
                    kept.push_back(node_id);
                }
            }
            state.frontier = kept;

            if ready.is_empty() {
                if waiting_on_timer {
                    let earliest = state
                        .not_before
                        .values()
                        .copied()
                        .min()
                        .unwrap_or(now_ms);
                    let wait = (earliest - now_ms).max(10) as u64;
                    tokio::time::sleep(Duration::from_millis(wait)).await;
                    continue;
                }
                // Frontier exhausted or permanently starved of inputs.
                let reason = if state.frontier.is_empty() {
                    "frontier exhausted without reaching a terminal node".to_string()
                } else {
                    format!(
                        "run stalled: nodes {:?} are waiting on inputs no remaining node can supply",
                        state.frontier
                    )
                };
                return self
                    .finish_failed(state, recorder, &memory, &emitter, run_started, None, reason)
                    .await;
            }

            // Pause nodes suspend before execution when input is missing.
            for node_id in &ready {
                if !graph.is_pause(node_id) {
                    continue;
                }
                let node = graph.node(node_id).expect("ready node exists");
                let required = graph.required_input_keys(node);
                let missing = memory.missing_keys(&required).await;
                if missing.is_empty() {
                    continue;
                }
                if self.config.non_interactive && node.client_facing {
                    // Timer/webhook triggered runs never block on a
                    // human; the node fails and OnFailure edges route.
                    continue;
                }
                let mut rest: VecDeque<String> =
                    ready.iter().filter(|id| *id != node_id).cloned().collect();
                rest.extend(state.frontier.drain(..));
                state.frontier = rest;
                return self
                    .finish_paused(state, recorder, &memory, &emitter, run_started, node_id, missing)
                    .await;
            }

            // Independent batch: no direct edge relation, disjoint
            // output keys, and no write/read overlap on shared keys.
            // The batch is also capped to the remaining step budget so
            // a parallel wave cannot overshoot max_steps.
            let step_budget = if self.config.max_steps > 0 {
                (self.config.max_steps - state.steps) as usize
            } else {
                usize::MAX
            };
            let mut batch: Vec<String> = Vec::new();
            for node_id in ready {
                if batch.len() >= step_budget {
                    state.frontier.push_back(node_id);
                } else if batch.is_empty()
                    || batch.iter().all(|other| self.independent(other, &node_id))
                {
                    batch.push(node_id);
                } else {
                    state.frontier.push_back(node_id);
                }
            }

            let mut in_flight = FuturesUnordered::new();
            let mut accumulators: Vec<(String, crate::executor::Accumulator)> = Vec::new();
            for node_id in batch {
                let node = graph.node(&node_id).expect("batched node exists").clone();
                let visits = *state.visits.get(&node_id).unwrap_or(&0);
                state.not_before.remove(&node_id);

                let dependency = node.dependency().to_string();
                let decision_id = recorder.decide(
                    &node_id,
                    "execute node",
                    vec![dependency.clone()],
                    &dependency,
                    &format!("inputs present, visit {}", visits + 1),
                );
                emitter.emit(EngineEvent::NodeStarted {
                    node_id: node_id.clone(),
                });

                let failed_interactive = self.config.non_interactive
                    && node.client_facing
                    && graph.is_pause(&node_id)
                    && !memory
                        .missing_keys(&graph.required_input_keys(&node))
                        .await
                        .is_empty();

                let mut ctx = WorkerContext::new(&state.run_id);
                if node.accumulator {
                    accumulators.push((node_id.clone(), ctx.accumulator.clone()));
                }
                let executor = Arc::clone(&self.executor);
                let graph = Arc::clone(graph);
                let memory = memory.clone();
                let config = self.config.clone();
                let semaphore = Arc::clone(&semaphore);
                in_flight.push(async move {
                    let _permit = semaphore
                        .acquire_owned()
                        .await
                        .expect("run semaphore closed");
                    let result = if failed_interactive {
                        NodeResult::failed(
                            &node_id,
                            ErrorClass::Permanent,
                            "interactive input unavailable in non-interactive run",
                            Default::default(),
                            0,
                        )
                    } else {
                        executor
                            .execute(&node, &graph, &memory, &config, &mut ctx)
                            .await
                    };
                    BatchItem {
                        node_id,
                        decision_id,
                        result,
                    }
                });
            }

            // Drain the batch, racing the global deadline.
            let mut terminal_reached = false;
            while !in_flight.is_empty() {
                let item = match deadline {
                    Some(deadline) => {
                        tokio::select! {
                            item = in_flight.next() => item,
                            _ = tokio::time::sleep_until(deadline) => {
                                // Cancel remaining tasks, then flush any
                                // accumulator's staged partial output.
                                // The flush commits only after the run
                                // status transition is decided, so it is
                                // never visible mid-run.
                                drop(in_flight);
                                return self
                                    .finish_timed_out(
                                        state, recorder, &memory, &emitter, run_started,
                                        accumulators,
                                    )
                                    .await;
                            }
                        }
                    }
                    None => in_flight.next().await,
                };
                let Some(item) = item else { break };

                self.settle(&mut state, &recorder, &emitter, &item);

                if item.result.success && graph.is_terminal(&item.node_id) {
                    terminal_reached = true;
                    continue;
                }

                let advanced = self
                    .advance(&mut state, &recorder, &memory, &emitter, &item)
                    .await;
                if let Some(reason) = advanced {
                    // Dead end or unrouted node failure: settle what is
                    // already in flight so sibling decisions stay
                    // paired, then fail naming the node.
                    while let Some(sibling) = in_flight.next().await {
                        self.settle(&mut state, &recorder, &emitter, &sibling);
                    }
                    return self
                        .finish_failed(
                            state,
                            recorder,
                            &memory,
                            &emitter,
                            run_started,
                            Some(item.node_id.clone()),
                            reason,
                        )
                        .await;
                }
            }

            if terminal_reached {
                return self
                    .finish_completed(state, recorder, &memory, &emitter, run_started)
                    .await;
            }
        }
    }

    /// Books one completed batch item: step and visit counters, the
    /// decision outcome, and completion events.
    fn settle(
        &self,
        state: &mut ExecutionState,
        recorder: &RunRecorder,
        emitter: &EventEmitter,
        item: &BatchItem,
    ) {
        state.steps += 1;
        *state.visits.entry(item.node_id.clone()).or_insert(0) += 1;

        let outcome_json = json!({
            "outputs": Value::Object(item.result.outputs.clone()),
            "error": item.result.error.as_ref().map(|e| e.message.clone()),
            "class": item.result.error.as_ref().map(|e| e.class.to_string()),
        });
        if let Err(e) = recorder.record_outcome(
            &item.decision_id,
            item.result.success,
            outcome_json,
            item.result.metrics.clone(),
        ) {
            warn!(run = %state.run_id, "failed to record outcome: {e}");
        }
        emitter.emit(EngineEvent::DecisionRecorded {
            decision_id: item.decision_id.clone(),
            node_id: item.node_id.clone(),
        });
        emitter.emit(EngineEvent::NodeCompleted {
            node_id: item.node_id.clone(),
            success: item.result.success,
            duration_ms: item.result.metrics.duration_ms,
        });
    }

    /// Evaluates outgoing edges for one completed node and extends the
    /// frontier. Returns a failure reason when the run cannot advance.
    async fn advance(
        &self,
        state: &mut ExecutionState,
        recorder: &RunRecorder,
        memory: &SharedMemory,
        emitter: &EventEmitter,
        item: &BatchItem,
    ) -> Option<String> {
        let graph = &self.graph;
        let snapshot = memory.snapshot().await;
        let eligible = eligible_edges(
            graph,
            &item.node_id,
            &item.result,
            &snapshot,
            self.provider.as_deref(),
        )
        .await;

        if let Some(decision) = &eligible.llm_decision {
            let decision_id = recorder.decide(
                &item.node_id,
                "choose outgoing edge",
                decision.options.clone(),
                &decision.chosen,
                &decision.reasoning,
            );
            if let Err(e) = recorder.record_outcome(
                &decision_id,
                true,
                json!({"chosen": decision.chosen}),
                Default::default(),
            ) {
                warn!(run = %state.run_id, "failed to record edge decision outcome: {e}");
            }
            emitter.emit(EngineEvent::DecisionRecorded {
                decision_id,
                node_id: item.node_id.clone(),
            });
        }

        if eligible.edges.is_empty() {
            return Some(match &item.result.error {
                Some(failure) => format!(
                    "node failed ({}) with no ON_FAILURE route: {}",
                    failure.class, failure.message
                ),
                None => EngineError::dead_end(&item.node_id).to_string(),
            });
        }

        for (_, edge) in &eligible.edges {
            emitter.emit(EngineEvent::EdgeFired {
                source: edge.source.clone(),
                target: edge.target.clone(),
            });
            // A failed node looping back onto itself backs off before
            // the next visit; the timer is persisted with the state.
            if edge.target == item.node_id && !item.result.success {
                let visits = *state.visits.get(&item.node_id).unwrap_or(&1);
                let delay = self.config.backoff.delay(visits);
                state.not_before.insert(
                    edge.target.clone(),
                    Utc::now().timestamp_millis() + delay.as_millis() as i64,
                );
            }
            if !state.frontier.contains(&edge.target) {
                state.frontier.push_back(edge.target.clone());
            }
        }
        None
    }

    fn independent(&self, a: &str, b: &str) -> bool {
        if a == b {
            return false;
        }
        let graph = &self.graph;
        if graph.edge_related(a, b) {
            return false;
        }
        let (Some(na), Some(nb)) = (graph.node(a), graph.node(b)) else {
            return false;
        };
        let writes_a: HashSet<&String> = na.output_keys.iter().collect();
        let writes_b: HashSet<&String> = nb.output_keys.iter().collect();
        if writes_a.intersection(&writes_b).next().is_some() {
            return false;
        }
        // Implicit data dependency: a writer and a reader of the same
        // key are never scheduled concurrently, edge or no edge.
        let reads_a: HashSet<&String> = na.input_keys.iter().collect();
        let reads_b: HashSet<&String> = nb.input_keys.iter().collect();
        writes_a.intersection(&reads_b).next().is_none()
            && writes_b.intersection(&reads_a).next().is_none()
    }

    async fn finish_completed(
        &self,
        mut state: ExecutionState,
        recorder: RunRecorder,
        memory: &SharedMemory,
        emitter: &EventEmitter,
        run_started: Instant,
    ) -> Result<RunOutcome> {
        state.status = RunStatus::Completed;
        emitter.emit(EngineEvent::RunCompleted);
        info!(run = %state.run_id, steps = state.steps, "run completed");
        self.seal(state, recorder, memory, run_started, None, None, None, Vec::new())
            .await
    }

    #[allow(clippy::too_many_arguments)]
    async fn finish_failed(
        &self,
        mut state: ExecutionState,
        recorder: RunRecorder,
        memory: &SharedMemory,
        emitter: &EventEmitter,
        run_started: Instant,
        failed_node: Option<String>,
        reason: String,
    ) -> Result<RunOutcome> {
        state.status = RunStatus::Failed;
        emitter.emit(EngineEvent::RunFailed {
            node_id: failed_node.clone(),
            reason: reason.clone(),
        });
        warn!(run = %state.run_id, node = ?failed_node, "run failed: {reason}");
        self.seal(
            state,
            recorder,
            memory,
            run_started,
            failed_node,
            Some(reason),
            None,
            Vec::new(),
        )
        .await
    }

    async fn finish_timed_out(
        &self,
        mut state: ExecutionState,
        recorder: RunRecorder,
        memory: &SharedMemory,
        emitter: &EventEmitter,
        run_started: Instant,
        accumulators: Vec<(String, crate::executor::Accumulator)>,
    ) -> Result<RunOutcome> {
        state.status = RunStatus::Failed;
        // Status transition first, then the atomic flush of partial
        // accumulator output, so siblings never observe it mid-run.
        let mut staged = JsonMap::new();
        for (node_id, accumulator) in accumulators {
            let partial = accumulator.drain();
            if !partial.is_empty() {
                debug!(node = %node_id, keys = partial.len(), "flushing accumulator partial output");
                staged.extend(partial);
            }
        }
        if !staged.is_empty() {
            memory.commit(staged).await;
        }
        let reason = "exceeded global timeout".to_string();
        emitter.emit(EngineEvent::RunFailed {
            node_id: None,
            reason: reason.clone(),
        });
        warn!(run = %state.run_id, "run failed: {reason}");
        self.seal(
            state,
            recorder,
            memory,
            run_started,
            None,
            Some(reason),
            None,
            Vec::new(),
        )
        .await
    }

    #[allow(clippy::too_many_arguments)]
    async fn finish_paused(
        &self,
        mut state: ExecutionState,
        recorder: RunRecorder,
        memory: &SharedMemory,
        emitter: &EventEmitter,
        run_started: Instant,
        node_id: &str,
        missing: Vec<String>,
    ) -> Result<RunOutcome> {
        state.status = RunStatus::Paused;
        state.paused_node = Some(node_id.to_string());
        state.missing_inputs = missing.clone();
        state.frontier.push_front(node_id.to_string());
        emitter.emit(EngineEvent::RunPaused {
            node_id: node_id.to_string(),
            missing_inputs: missing.clone(),
        });
        info!(run = %state.run_id, node = node_id, ?missing, "run paused for input");
        self.seal(
            state,
            recorder,
            memory,
            run_started,
            None,
            None,
            Some(node_id.to_string()),
            missing,
        )
        .await
    }

    /// Persists the final snapshot: state (kept for paused runs, removed
    /// otherwise), the full run, and its summary.
    #[allow(clippy::too_many_arguments)]
    async fn seal(
        &self,
        mut state: ExecutionState,
        recorder: RunRecorder,
        memory: &SharedMemory,
        run_started: Instant,
        failed_node: Option<String>,
        failure: Option<String>,
        paused_node: Option<String>,
        missing_inputs: Vec<String>,
    ) -> Result<RunOutcome> {
        state.memory = memory.snapshot().await;
        state.elapsed_ms += run_started.elapsed().as_millis() as u64;

        if state.status == RunStatus::Paused {
            self.store.save_state(&state).await?;
        } else {
            self.store.delete_state(&state.run_id).await?;
        }

        let (run, summary) = recorder.finalize(state.status, state.memory.clone());
        let anomalies = run.anomalies.clone();
        let recent_decisions: Vec<Decision> =
            run.decisions.iter().rev().take(5).rev().cloned().collect();
        if let Err(e) = self.store.save_run(&run).await {
            warn!(run = %state.run_id, "failed to persist run: {e}");
        }
        if let Err(e) = self.store.save_summary(&summary).await {
            warn!(run = %state.run_id, "failed to persist summary: {e}");
        }

        Ok(RunOutcome {
            run_id: state.run_id,
            graph_id: state.graph_id,
            status: state.status,
            memory: state.memory,
            failed_node,
            failure,
            paused_node,
            missing_inputs,
            recent_decisions,
            anomalies,
        })
    }
}
