//! Multi-graph host. A [`Session`] owns the worker registry, the
//! per-tenant resilience layer, the run store, and the registered
//! graphs; there are no globals. Runs on different graphs share
//! breakers, limiters, and the budget governor, and every event
//! envelope is tagged with both run id and graph id.

use std::sync::Arc;

use dashmap::DashMap;
use tracing::{info, warn};

use crate::condition::DecisionProvider;
use crate::config::{RunConfig, RunOptions};
use crate::error::{EngineError, Result};
use crate::events::EventSink;
use crate::executor::{JsonMap, NodeExecutor, Worker, WorkerRegistry};
use crate::graph::goal::Goal;
use crate::graph::spec::{Graph, GraphSpec};
use crate::recorder::{MemoryStore, RunStore};
use crate::resilience::ResilienceLayer;
use crate::scheduler::{GraphRunner, RunOutcome};

/// Result of escalating a run from one graph to another.
#[derive(Debug, Clone)]
pub struct EscalationOutcome {
    /// The target graph's run.
    pub target: RunOutcome,
    /// The source run, re-entered after the target's memory merged back.
    /// `None` when the source was not paused.
    pub source: Option<RunOutcome>,
}

pub struct Session {
    config: RunConfig,
    goals: DashMap<String, Arc<Goal>>,
    graphs: DashMap<String, Arc<Graph>>,
    registry: Arc<WorkerRegistry>,
    resilience: Arc<ResilienceLayer>,
    store: Arc<dyn RunStore>,
    provider: Option<Arc<dyn DecisionProvider>>,
    sink: Option<Arc<dyn EventSink>>,
}

impl Session {
    /// Builds a session with an in-memory store. Swap in a persistent
    /// store with [`Session::with_store`].
    pub fn new(config: RunConfig) -> Result<Self> {
        config.validate()?;
        let resilience = Arc::new(ResilienceLayer::with_budget(config.budget.clone()));
        Ok(Self {
            config,
            goals: DashMap::new(),
            graphs: DashMap::new(),
            registry: Arc::new(WorkerRegistry::new()),
            resilience,
            store: Arc::new(MemoryStore::new()),
            provider: None,
            sink: None,
        })
    }

    pub fn with_store(mut self, store: Arc<dyn RunStore>) -> Self {
        self.store = store;
        self
    }

    pub fn with_provider(mut self, provider: Arc<dyn DecisionProvider>) -> Self {
        self.provider = Some(provider);
        self
    }

    pub fn with_sink(mut self, sink: Arc<dyn EventSink>) -> Self {
        self.sink = Some(sink);
        self
    }

    pub fn register_worker(&self, name: &str, worker: Arc<dyn Worker>) {
        self.registry.register(name, worker);
    }

    pub fn resilience(&self) -> &Arc<ResilienceLayer> {
        &self.resilience
    }

    pub fn store(&self) -> &Arc<dyn RunStore> {
        &self.store
    }

    /// Registers the objective a graph exists to satisfy. Goals are
    /// descriptive; graphs reference them by id.
    pub fn add_goal(&self, goal: Goal) -> String {
        let goal_id = goal.id.clone();
        self.goals.insert(goal_id.clone(), Arc::new(goal));
        goal_id
    }

    pub fn goal(&self, goal_id: &str) -> Option<Arc<Goal>> {
        self.goals.get(goal_id).map(|g| g.clone())
    }

    /// Validates and registers a graph; returns its id. A graph naming an
    /// unregistered goal is accepted but logged.
    pub fn add_graph(&self, spec: GraphSpec) -> Result<String> {
        let graph = spec.validate()?;
        if !self.goals.contains_key(graph.goal_id()) {
            warn!(
                graph = graph.id(),
                goal = graph.goal_id(),
                "graph references an unregistered goal"
            );
        }
        let graph_id = graph.id().to_string();
        if self.graphs.contains_key(&graph_id) {
            return Err(EngineError::validation_field(
                format!("graph '{graph_id}' is already registered"),
                "id",
            ));
        }
        info!(graph = %graph_id, "graph registered");
        self.graphs.insert(graph_id.clone(), Arc::new(graph));
        Ok(graph_id)
    }

    /// Unregisters a graph. Paused runs of a removed graph can no longer
    /// resume.
    pub fn remove_graph(&self, graph_id: &str) -> bool {
        self.graphs.remove(graph_id).is_some()
    }

    pub fn graph(&self, graph_id: &str) -> Option<Arc<Graph>> {
        self.graphs.get(graph_id).map(|g| g.clone())
    }

    pub fn graph_ids(&self) -> Vec<String> {
        self.graphs.iter().map(|g| g.key().clone()).collect()
    }

    fn runner(&self, graph_id: &str, config: &RunConfig) -> Result<GraphRunner> {
        let Some(graph) = self.graph(graph_id) else {
            return Err(EngineError::validation_field(
                format!("unknown graph '{graph_id}'"),
                "graph_id",
            ));
        };
        let executor = Arc::new(NodeExecutor::new(
            Arc::clone(&self.registry),
            Arc::clone(&self.resilience),
        ));
        let mut runner = GraphRunner::new(graph, executor, Arc::clone(&self.store), config)?;
        if let Some(provider) = &self.provider {
            runner = runner.with_provider(Arc::clone(provider));
        }
        if let Some(sink) = &self.sink {
            runner = runner.with_sink(Arc::clone(sink));
        }
        Ok(runner)
    }

    /// Starts a run of a registered graph.
    pub async fn run(&self, graph_id: &str, input: JsonMap) -> Result<RunOutcome> {
        self.run_with(graph_id, input, RunOptions::default()).await
    }

    /// Starts a run with per-run options layered over the session config.
    pub async fn run_with(
        &self,
        graph_id: &str,
        input: JsonMap,
        options: RunOptions,
    ) -> Result<RunOutcome> {
        self.runner(graph_id, &self.config.with_options(&options))?
            .start(input)
            .await
    }

    /// Resumes a paused run with the supplied inputs. The owning graph is
    /// resolved from the persisted state.
    pub async fn resume(&self, run_id: &str, supplied: JsonMap) -> Result<RunOutcome> {
        self.resume_with(run_id, supplied, RunOptions::default())
            .await
    }

    /// Resumes a paused run with per-run options layered over the
    /// session config.
    pub async fn resume_with(
        &self,
        run_id: &str,
        supplied: JsonMap,
        options: RunOptions,
    ) -> Result<RunOutcome> {
        let Some(state) = self.store.load_state(run_id).await? else {
            return Err(EngineError::invalid_run_state(
                run_id.to_string(),
                "paused".to_string(),
                "unknown".to_string(),
            ));
        };
        self.runner(&state.graph_id, &self.config.with_options(&options))?
            .resume(run_id, supplied)
            .await
    }

    /// Escalates a run to another graph: the source run's latest memory
    /// snapshot seeds a run of the target graph, and once the target
    /// stops, its memory merges back into the source state. A paused
    /// source is then re-entered, which is how control returns to it.
    pub async fn escalate(&self, source_run_id: &str, target_graph_id: &str) -> Result<EscalationOutcome> {
        let source_memory = match self.store.load_state(source_run_id).await? {
            Some(state) => state.memory,
            None => match self.store.load_run(source_run_id).await? {
                Some(run) => run.final_memory,
                None => {
                    return Err(EngineError::validation_field(
                        format!("unknown run '{source_run_id}'"),
                        "run_id",
                    ))
                }
            },
        };

        info!(
            source = source_run_id,
            target = target_graph_id,
            "escalating run"
        );
        let input: JsonMap = source_memory.into_iter().collect();
        let target = self.run(target_graph_id, input).await?;

        let source = if self.store.load_state(source_run_id).await?.is_some() {
            let supplied: JsonMap = target.memory.clone().into_iter().collect();
            Some(self.resume(source_run_id, supplied).await?)
        } else {
            None
        };

        Ok(EscalationOutcome { target, source })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::RunLimits;
    use crate::graph::edge::{EdgeCondition, EdgeSpec};
    use crate::graph::node::{NodeKind, NodeSpec};
    use async_trait::async_trait;
    use crate::executor::{WorkerContext, WorkerOutput};

    struct NoopWorker;

    #[async_trait]
    impl crate::executor::Worker for NoopWorker {
        async fn execute(
            &self,
            _node: &NodeSpec,
            _inputs: JsonMap,
            _ctx: &WorkerContext,
        ) -> anyhow::Result<WorkerOutput> {
            Ok(WorkerOutput::ok(JsonMap::new()))
        }
    }

    fn two_node_spec(id: &str) -> GraphSpec {
        GraphSpec {
            id: id.to_string(),
            goal_id: "goal".to_string(),
            entry_node: "a".to_string(),
            entry_points: vec![],
            nodes: vec![
                NodeSpec::new("a", NodeKind::Function),
                NodeSpec::new("b", NodeKind::Function),
            ],
            edges: vec![EdgeSpec::new("a", "b", EdgeCondition::Always)],
            terminal_nodes: vec!["b".to_string()],
            pause_nodes: vec![],
            limits: RunLimits::default(),
        }
    }

    #[test]
    fn test_duplicate_graph_rejected() {
        let session = Session::new(RunConfig::default()).unwrap();
        session.add_graph(two_node_spec("g")).unwrap();
        assert!(session.add_graph(two_node_spec("g")).is_err());
    }

    #[test]
    fn test_remove_graph() {
        let session = Session::new(RunConfig::default()).unwrap();
        session.add_graph(two_node_spec("g")).unwrap();
        assert!(session.remove_graph("g"));
        assert!(!session.remove_graph("g"));
        assert!(session.graph_ids().is_empty());
    }

    #[tokio::test]
    async fn test_run_unknown_graph_rejected() {
        let session = Session::new(RunConfig::default()).unwrap();
        assert!(session.run("ghost", JsonMap::new()).await.is_err());
    }

    #[tokio::test]
    async fn test_run_to_completion() {
        let session = Session::new(RunConfig::default()).unwrap();
        session.register_worker("function", Arc::new(NoopWorker));
        session.add_graph(two_node_spec("g")).unwrap();

        let outcome = session.run("g", JsonMap::new()).await.unwrap();
        assert_eq!(outcome.status, crate::recorder::RunStatus::Completed);
        assert_eq!(outcome.graph_id, "g");
    }
}
