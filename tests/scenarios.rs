//! End-to-end runs through the public [`Session`] surface: happy path,
//! failure routing, pause/resume, dead ends, and budget governance.

use std::collections::BTreeMap;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use pretty_assertions::assert_eq;
use serde_json::{json, Value};

use waypoint::{
    Backoff, BudgetConfig, EdgeCondition, EdgeSpec, EngineEvent, ErrorClass, GraphSpec, JsonMap,
    NodeKind, NodeMetrics, NodeSpec, RetryPolicy, RunConfig, RunLimits, RunOptions, RunStatus,
    Session, Worker, WorkerContext, WorkerOutput,
};

/// Emits whatever the node's `config.emit` object declares, and reports
/// `config.cost` as spend. Stands in for any real worker.
struct ConfigWorker;

#[async_trait]
impl Worker for ConfigWorker {
    async fn execute(
        &self,
        node: &NodeSpec,
        _inputs: JsonMap,
        _ctx: &WorkerContext,
    ) -> anyhow::Result<WorkerOutput> {
        let mut outputs = JsonMap::new();
        if let Some(emit) = node.config.get("emit").and_then(|v| v.as_object()) {
            outputs.extend(emit.clone());
        }
        let cost = node.config.get("cost").and_then(|v| v.as_f64()).unwrap_or(0.0);
        Ok(WorkerOutput::ok(outputs).with_metrics(NodeMetrics {
            cost,
            ..Default::default()
        }))
    }
}

/// Always fails with the given class, counting calls.
struct FailingWorker {
    class: ErrorClass,
    calls: AtomicU32,
}

impl FailingWorker {
    fn new(class: ErrorClass) -> Arc<Self> {
        Arc::new(Self {
            class,
            calls: AtomicU32::new(0),
        })
    }
}

#[async_trait]
impl Worker for FailingWorker {
    async fn execute(
        &self,
        _node: &NodeSpec,
        _inputs: JsonMap,
        _ctx: &WorkerContext,
    ) -> anyhow::Result<WorkerOutput> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        Ok(WorkerOutput::fail(self.class, "simulated failure"))
    }
}

fn node(id: &str, kind: NodeKind) -> NodeSpec {
    NodeSpec::new(id, kind)
}

fn emitting(id: &str, kind: NodeKind, emit: Value) -> NodeSpec {
    let mut n = NodeSpec::new(id, kind);
    n.config = json!({ "emit": emit });
    n
}

fn graph(
    id: &str,
    entry: &str,
    nodes: Vec<NodeSpec>,
    edges: Vec<EdgeSpec>,
    terminals: &[&str],
    pauses: &[&str],
) -> GraphSpec {
    GraphSpec {
        id: id.to_string(),
        goal_id: format!("goal-{id}"),
        entry_node: entry.to_string(),
        entry_points: vec![],
        nodes,
        edges,
        terminal_nodes: terminals.iter().map(|s| s.to_string()).collect(),
        pause_nodes: pauses.iter().map(|s| s.to_string()).collect(),
        limits: RunLimits::default(),
    }
}

fn fast_config() -> RunConfig {
    let _ = tracing_subscriber::fmt().with_test_writer().try_init();
    RunConfig {
        backoff: Backoff::Immediate,
        ..Default::default()
    }
}

fn input(pairs: &[(&str, Value)]) -> JsonMap {
    pairs
        .iter()
        .map(|(k, v)| (k.to_string(), v.clone()))
        .collect()
}

#[tokio::test]
async fn scenario_a_happy_path() {
    let session = Session::new(fast_config()).unwrap();
    session.register_worker("function", Arc::new(ConfigWorker));
    session.register_worker("generative", Arc::new(ConfigWorker));

    let spec = graph(
        "triage",
        "intake",
        vec![
            emitting("intake", NodeKind::Function, json!({"normalized_text": "hello"})),
            emitting("classify", NodeKind::Generative, json!({"category": "greeting"})),
            emitting("respond", NodeKind::Generative, json!({"reply": "Hi!"})),
        ],
        vec![
            EdgeSpec::new("intake", "classify", EdgeCondition::OnSuccess),
            EdgeSpec::new("classify", "respond", EdgeCondition::OnSuccess),
        ],
        &["respond"],
        &[],
    );
    session.add_graph(spec).unwrap();

    let outcome = session
        .run("triage", input(&[("text", json!("hello"))]))
        .await
        .unwrap();

    assert_eq!(outcome.status, RunStatus::Completed);
    let expected: BTreeMap<String, Value> = [
        ("text".to_string(), json!("hello")),
        ("normalized_text".to_string(), json!("hello")),
        ("category".to_string(), json!("greeting")),
        ("reply".to_string(), json!("Hi!")),
    ]
    .into_iter()
    .collect();
    assert_eq!(outcome.memory, expected);
    assert!(outcome.anomalies.is_empty());
}

#[tokio::test]
async fn decisions_are_ordered_and_paired() {
    let session = Session::new(fast_config()).unwrap();
    session.register_worker("function", Arc::new(ConfigWorker));

    let spec = graph(
        "trail",
        "a",
        vec![
            node("a", NodeKind::Function),
            node("b", NodeKind::Function),
            node("c", NodeKind::Function),
        ],
        vec![
            EdgeSpec::new("a", "b", EdgeCondition::OnSuccess),
            EdgeSpec::new("b", "c", EdgeCondition::OnSuccess),
        ],
        &["c"],
        &[],
    );
    session.add_graph(spec).unwrap();

    let outcome = session.run("trail", JsonMap::new()).await.unwrap();
    let run = session
        .store()
        .load_run(&outcome.run_id)
        .await
        .unwrap()
        .unwrap();

    assert_eq!(run.decisions.len(), 3);
    assert!(run.decisions.iter().all(|d| d.outcome.is_some()));
    for pair in run.decisions.windows(2) {
        assert!(pair[0].decided_at <= pair[1].decided_at);
    }
    assert!(run.anomalies.is_empty());
}

#[tokio::test]
async fn scenario_b_on_failure_fallback() {
    let session = Session::new(fast_config()).unwrap();
    let validate = FailingWorker::new(ErrorClass::Timeout);
    session.register_worker("validate", validate.clone());
    session.register_worker("function", Arc::new(ConfigWorker));

    let mut validate_node = node("validate", NodeKind::Tool);
    validate_node.worker = Some("validate".to_string());
    validate_node.retry = Some(RetryPolicy {
        max_retries: 2,
        backoff: Backoff::Immediate,
    });

    let spec = graph(
        "fallbacks",
        "validate",
        vec![
            validate_node,
            emitting("fallback", NodeKind::Function, json!({"handled": true})),
        ],
        vec![
            EdgeSpec::new("validate", "fallback", EdgeCondition::OnFailure),
        ],
        &["fallback"],
        &[],
    );
    session.add_graph(spec).unwrap();

    let outcome = session.run("fallbacks", JsonMap::new()).await.unwrap();

    assert_eq!(outcome.status, RunStatus::Completed);
    // max_retries=2 means exactly three worker calls.
    assert_eq!(validate.calls.load(Ordering::SeqCst), 3);
    assert_eq!(outcome.memory.get("handled"), Some(&json!(true)));

    let run = session
        .store()
        .load_run(&outcome.run_id)
        .await
        .unwrap()
        .unwrap();
    let failed: Vec<_> = run
        .decisions
        .iter()
        .filter(|d| d.outcome.as_ref().is_some_and(|o| !o.success))
        .collect();
    assert_eq!(failed.len(), 1);
    assert_eq!(failed[0].node_id, "validate");
    assert!(run.anomalies.is_empty());
}

#[tokio::test]
async fn scenario_c_pause_and_resume() {
    let session = Session::new(fast_config()).unwrap();
    session.register_worker("function", Arc::new(ConfigWorker));
    session.register_worker("human_input", Arc::new(ConfigWorker));

    let mut approve = node("approve", NodeKind::HumanInput);
    approve.input_keys = vec!["approval".to_string()];
    approve.client_facing = true;

    let spec = graph(
        "approval-flow",
        "intake",
        vec![
            emitting("intake", NodeKind::Function, json!({"draft": "plan"})),
            approve,
            emitting("respond", NodeKind::Function, json!({"sent": true})),
        ],
        vec![
            EdgeSpec::new("intake", "approve", EdgeCondition::OnSuccess),
            EdgeSpec::new("approve", "respond", EdgeCondition::OnSuccess),
        ],
        &["respond"],
        &["approve"],
    );
    session.add_graph(spec).unwrap();

    let paused = session.run("approval-flow", JsonMap::new()).await.unwrap();
    assert_eq!(paused.status, RunStatus::Paused);
    assert_eq!(paused.paused_node.as_deref(), Some("approve"));
    assert_eq!(paused.missing_inputs, vec!["approval".to_string()]);

    let resumed = session
        .resume(&paused.run_id, input(&[("approval", json!(true))]))
        .await
        .unwrap();
    assert_eq!(resumed.run_id, paused.run_id);
    assert_eq!(resumed.status, RunStatus::Completed);
    assert_eq!(resumed.memory.get("sent"), Some(&json!(true)));
    assert_eq!(resumed.memory.get("approval"), Some(&json!(true)));

    // Terminal runs leave no resumable state behind.
    assert!(session
        .store()
        .load_state(&paused.run_id)
        .await
        .unwrap()
        .is_none());
}

#[tokio::test]
async fn resume_of_non_paused_run_is_rejected() {
    let session = Session::new(fast_config()).unwrap();
    session.register_worker("function", Arc::new(ConfigWorker));

    let spec = graph(
        "oneshot",
        "a",
        vec![node("a", NodeKind::Function), node("b", NodeKind::Function)],
        vec![EdgeSpec::new("a", "b", EdgeCondition::OnSuccess)],
        &["b"],
        &[],
    );
    session.add_graph(spec).unwrap();

    let outcome = session.run("oneshot", JsonMap::new()).await.unwrap();
    assert_eq!(outcome.status, RunStatus::Completed);

    let err = session
        .resume(&outcome.run_id, JsonMap::new())
        .await
        .unwrap_err();
    assert!(err.to_string().contains(&outcome.run_id));

    // The stored run is untouched by the rejected resume.
    let run = session
        .store()
        .load_run(&outcome.run_id)
        .await
        .unwrap()
        .unwrap();
    assert_eq!(run.status, RunStatus::Completed);
    assert!(session
        .store()
        .load_state(&outcome.run_id)
        .await
        .unwrap()
        .is_none());
}

#[tokio::test]
async fn concurrent_resume_admits_exactly_one() {
    let session = Session::new(fast_config()).unwrap();
    session.register_worker("function", Arc::new(ConfigWorker));
    session.register_worker("human_input", Arc::new(ConfigWorker));

    let mut approve = node("approve", NodeKind::HumanInput);
    approve.input_keys = vec!["approval".to_string()];
    approve.client_facing = true;

    let spec = graph(
        "race",
        "intake",
        vec![
            emitting("intake", NodeKind::Function, json!({"draft": "plan"})),
            approve,
            emitting("respond", NodeKind::Function, json!({"sent": true})),
        ],
        vec![
            EdgeSpec::new("intake", "approve", EdgeCondition::OnSuccess),
            EdgeSpec::new("approve", "respond", EdgeCondition::OnSuccess),
        ],
        &["respond"],
        &["approve"],
    );
    session.add_graph(spec).unwrap();

    let paused = session.run("race", JsonMap::new()).await.unwrap();
    assert_eq!(paused.status, RunStatus::Paused);

    let supplied = input(&[("approval", json!(true))]);
    let (first, second) = tokio::join!(
        session.resume(&paused.run_id, supplied.clone()),
        session.resume(&paused.run_id, supplied),
    );

    // Claiming the persisted state is atomic: one resume drives the run,
    // the other is rejected without touching it.
    let (winner, loser) = match (first, second) {
        (Ok(outcome), Err(e)) => (outcome, e),
        (Err(e), Ok(outcome)) => (outcome, e),
        other => panic!("expected exactly one resume to win, got {other:?}"),
    };
    assert_eq!(winner.status, RunStatus::Completed);
    assert_eq!(winner.memory.get("sent"), Some(&json!(true)));
    assert!(loser.to_string().contains(&paused.run_id));

    let run = session
        .store()
        .load_run(&paused.run_id)
        .await
        .unwrap()
        .unwrap();
    assert_eq!(run.status, RunStatus::Completed);
    assert!(run.anomalies.is_empty());
}

#[tokio::test]
async fn scenario_d_dead_end_names_the_node() {
    let session = Session::new(fast_config()).unwrap();
    session.register_worker("router", Arc::new(ConfigWorker));
    session.register_worker("function", Arc::new(ConfigWorker));

    let spec = graph(
        "routing",
        "router",
        vec![node("router", NodeKind::Router), node("end", NodeKind::Function)],
        vec![EdgeSpec::new(
            "router",
            "end",
            EdgeCondition::Conditional {
                expr: "score > 0.5".to_string(),
            },
        )],
        &["end"],
        &[],
    );
    session.add_graph(spec).unwrap();

    // `score` is never written, so the only edge evaluates false.
    let outcome = session.run("routing", JsonMap::new()).await.unwrap();
    assert_eq!(outcome.status, RunStatus::Failed);
    assert_eq!(outcome.failed_node.as_deref(), Some("router"));
    assert!(outcome.failure.unwrap().contains("router"));
}

#[tokio::test]
async fn scenario_e_budget_blocks_generative_but_run_completes() {
    let config = RunConfig {
        backoff: Backoff::Immediate,
        budget: BudgetConfig {
            cap: Some(100.0),
            throttle_delay_ms: 10,
            ..Default::default()
        },
        ..Default::default()
    };
    let session = Session::new(config).unwrap();
    session.register_worker("generative", Arc::new(ConfigWorker));
    session.register_worker("function", Arc::new(ConfigWorker));

    let mut expensive = emitting("draft", NodeKind::Generative, json!({"draft": "text"}));
    expensive.config["cost"] = json!(150.0);

    let spec = graph(
        "budgeted",
        "draft",
        vec![
            expensive,
            emitting("polish", NodeKind::Generative, json!({"polished": true})),
            emitting("finish", NodeKind::Function, json!({"done": true})),
        ],
        vec![
            EdgeSpec::new("draft", "polish", EdgeCondition::OnSuccess),
            EdgeSpec::new("polish", "finish", EdgeCondition::OnSuccess),
            // Non-generative escape hatch once the budget blocks.
            EdgeSpec::new("polish", "finish", EdgeCondition::OnFailure),
        ],
        &["finish"],
        &[],
    );
    session.add_graph(spec).unwrap();

    let outcome = session.run("budgeted", JsonMap::new()).await.unwrap();

    // `draft` pushed spend over the cap, `polish` was refused, and the
    // run still completed through the non-generative path.
    assert_eq!(outcome.status, RunStatus::Completed);
    assert_eq!(outcome.memory.get("done"), Some(&json!(true)));
    assert_eq!(outcome.memory.get("polished"), None);
    assert_eq!(session.resilience().budget().spent().await, 150.0);

    let run = session
        .store()
        .load_run(&outcome.run_id)
        .await
        .unwrap()
        .unwrap();
    let refused = run
        .decisions
        .iter()
        .find(|d| d.node_id == "polish")
        .unwrap();
    let result = &refused.outcome.as_ref().unwrap().result;
    assert!(result["error"].as_str().unwrap().contains("Budget exhausted"));
}

#[tokio::test]
async fn independent_nodes_yield_identical_memory_at_any_parallelism() {
    let mut final_memories = Vec::new();

    for parallelism in [1usize, 3] {
        let config = RunConfig {
            backoff: Backoff::Immediate,
            max_parallel_nodes: parallelism,
            ..Default::default()
        };
        let session = Session::new(config).unwrap();
        session.register_worker("function", Arc::new(ConfigWorker));

        let mut join = node("join", NodeKind::Function);
        join.input_keys = vec!["left".to_string(), "right".to_string()];

        let spec = graph(
            "fanout",
            "split",
            vec![
                node("split", NodeKind::Function),
                emitting("b", NodeKind::Function, json!({"left": 1})),
                emitting("c", NodeKind::Function, json!({"right": 2})),
                join,
            ],
            vec![
                EdgeSpec::new("split", "b", EdgeCondition::OnSuccess),
                EdgeSpec::new("split", "c", EdgeCondition::OnSuccess),
                EdgeSpec::new("b", "join", EdgeCondition::OnSuccess),
                EdgeSpec::new("c", "join", EdgeCondition::OnSuccess),
            ],
            &["join"],
            &[],
        );
        session.add_graph(spec).unwrap();

        let outcome = session.run("fanout", JsonMap::new()).await.unwrap();
        assert_eq!(outcome.status, RunStatus::Completed);
        final_memories.push(outcome.memory);
    }

    assert_eq!(final_memories[0], final_memories[1]);
    assert_eq!(final_memories[0].get("left"), Some(&json!(1)));
    assert_eq!(final_memories[0].get("right"), Some(&json!(2)));
}

#[tokio::test]
async fn step_budget_caps_a_parallel_batch() {
    struct CountingWorker {
        calls: AtomicU32,
    }

    #[async_trait]
    impl Worker for CountingWorker {
        async fn execute(
            &self,
            _node: &NodeSpec,
            _inputs: JsonMap,
            _ctx: &WorkerContext,
        ) -> anyhow::Result<WorkerOutput> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            Ok(WorkerOutput::ok(JsonMap::new()))
        }
    }

    let session = Session::new(fast_config()).unwrap();
    let worker = Arc::new(CountingWorker {
        calls: AtomicU32::new(0),
    });
    session.register_worker("function", worker.clone());

    // Three independent nodes become ready at once, but only one step of
    // budget remains after the entry node.
    let mut spec = graph(
        "fanout-capped",
        "split",
        vec![
            node("split", NodeKind::Function),
            node("b", NodeKind::Function),
            node("c", NodeKind::Function),
            node("d", NodeKind::Function),
            node("end", NodeKind::Function),
        ],
        vec![
            EdgeSpec::new("split", "b", EdgeCondition::OnSuccess),
            EdgeSpec::new("split", "c", EdgeCondition::OnSuccess),
            EdgeSpec::new("split", "d", EdgeCondition::OnSuccess),
            EdgeSpec::new("b", "end", EdgeCondition::OnSuccess),
            EdgeSpec::new("c", "end", EdgeCondition::OnSuccess),
            EdgeSpec::new("d", "end", EdgeCondition::OnSuccess),
        ],
        &["end"],
        &[],
    );
    spec.limits.max_steps = Some(2);
    session.add_graph(spec).unwrap();

    let outcome = session.run("fanout-capped", JsonMap::new()).await.unwrap();

    assert_eq!(outcome.status, RunStatus::Failed);
    assert!(outcome.failure.unwrap().contains("max_steps"));
    // Never more executions than the budget allows, even though three
    // nodes could have run in parallel.
    assert_eq!(worker.calls.load(Ordering::SeqCst), 2);
}

#[tokio::test]
async fn per_run_non_interactive_fails_client_facing_pause() {
    let session = Session::new(fast_config()).unwrap();
    session.register_worker("function", Arc::new(ConfigWorker));
    session.register_worker("human_input", Arc::new(ConfigWorker));

    let mut approve = node("approve", NodeKind::HumanInput);
    approve.input_keys = vec!["approval".to_string()];
    approve.client_facing = true;

    let spec = graph(
        "triggered",
        "intake",
        vec![
            emitting("intake", NodeKind::Function, json!({"draft": "plan"})),
            approve,
            emitting("respond", NodeKind::Function, json!({"sent": true})),
            emitting("fallback", NodeKind::Function, json!({"deferred": true})),
        ],
        vec![
            EdgeSpec::new("intake", "approve", EdgeCondition::OnSuccess),
            EdgeSpec::new("approve", "respond", EdgeCondition::OnSuccess),
            EdgeSpec::new("approve", "fallback", EdgeCondition::OnFailure),
        ],
        &["respond", "fallback"],
        &["approve"],
    );
    session.add_graph(spec).unwrap();

    // A webhook-triggered run opts out of waiting for a human without
    // flipping the whole session.
    let detached = session
        .run_with(
            "triggered",
            JsonMap::new(),
            RunOptions {
                non_interactive: Some(true),
            },
        )
        .await
        .unwrap();
    assert_eq!(detached.status, RunStatus::Completed);
    assert_eq!(detached.memory.get("deferred"), Some(&json!(true)));
    assert_eq!(detached.memory.get("sent"), None);

    // The session default is untouched: the same graph still pauses.
    let interactive = session.run("triggered", JsonMap::new()).await.unwrap();
    assert_eq!(interactive.status, RunStatus::Paused);
    assert_eq!(interactive.paused_node.as_deref(), Some("approve"));
}

#[tokio::test]
async fn batch_failure_still_records_sibling_outcomes() {
    let session = Session::new(fast_config()).unwrap();
    session.register_worker("function", Arc::new(ConfigWorker));

    // `x` and `y` run as one independent batch; `x` dead-ends while `y`
    // has a route to the terminal.
    let spec = graph(
        "half-dead",
        "split",
        vec![
            node("split", NodeKind::Function),
            emitting("x", NodeKind::Function, json!({"x_done": 1})),
            emitting("y", NodeKind::Function, json!({"y_done": 1})),
            node("end", NodeKind::Function),
        ],
        vec![
            EdgeSpec::new("split", "x", EdgeCondition::OnSuccess),
            EdgeSpec::new("split", "y", EdgeCondition::OnSuccess),
            EdgeSpec::new("y", "end", EdgeCondition::OnSuccess),
        ],
        &["end"],
        &[],
    );
    session.add_graph(spec).unwrap();

    let outcome = session.run("half-dead", JsonMap::new()).await.unwrap();
    assert_eq!(outcome.status, RunStatus::Failed);
    assert_eq!(outcome.failed_node.as_deref(), Some("x"));

    // The sibling's decision is paired before the run is failed; nothing
    // is flagged as unpaired.
    let run = session
        .store()
        .load_run(&outcome.run_id)
        .await
        .unwrap()
        .unwrap();
    assert_eq!(run.decisions.len(), 3);
    assert!(run.decisions.iter().all(|d| d.outcome.is_some()));
    assert!(run.anomalies.is_empty());
}

#[tokio::test]
async fn visit_cap_stops_self_loop_after_one_execution() {
    let session = Session::new(fast_config()).unwrap();
    let flaky = FailingWorker::new(ErrorClass::Validation);
    session.register_worker("tool", flaky.clone());
    session.register_worker("function", Arc::new(ConfigWorker));

    let mut once = node("once", NodeKind::Tool);
    once.max_visits = 1;
    once.retry = Some(RetryPolicy {
        max_retries: 0,
        backoff: Backoff::Immediate,
    });

    let spec = graph(
        "looped",
        "once",
        vec![once, node("end", NodeKind::Function)],
        vec![
            EdgeSpec::new("once", "once", EdgeCondition::OnFailure),
            EdgeSpec::new("once", "end", EdgeCondition::OnSuccess),
        ],
        &["end"],
        &[],
    );
    session.add_graph(spec).unwrap();

    let outcome = session.run("looped", JsonMap::new()).await.unwrap();
    assert_eq!(outcome.status, RunStatus::Failed);
    assert_eq!(flaky.calls.load(Ordering::SeqCst), 1);
}

#[tokio::test]
async fn events_are_tagged_with_run_and_graph() {
    let sink = Arc::new(waypoint::BufferingSink::new());
    let session = Session::new(fast_config())
        .unwrap()
        .with_sink(sink.clone());
    session.register_worker("function", Arc::new(ConfigWorker));

    let spec = graph(
        "observed",
        "a",
        vec![node("a", NodeKind::Function), node("b", NodeKind::Function)],
        vec![EdgeSpec::new("a", "b", EdgeCondition::OnSuccess)],
        &["b"],
        &[],
    );
    session.add_graph(spec).unwrap();

    let outcome = session.run("observed", JsonMap::new()).await.unwrap();
    let events = sink.events();

    assert!(!events.is_empty());
    assert!(events.iter().all(|e| e.run_id == outcome.run_id));
    assert!(events.iter().all(|e| e.graph_id == "observed"));
    assert!(events
        .iter()
        .any(|e| matches!(e.event, EngineEvent::EdgeFired { .. })));
    assert!(events
        .iter()
        .any(|e| matches!(e.event, EngineEvent::RunCompleted)));
}

#[tokio::test]
async fn escalation_seeds_target_and_returns_to_source() {
    let session = Session::new(fast_config()).unwrap();
    session.register_worker("function", Arc::new(ConfigWorker));
    session.register_worker("human_input", Arc::new(ConfigWorker));

    // Source pauses waiting for `verdict`; the specialist graph produces it.
    let mut wait = node("wait", NodeKind::HumanInput);
    wait.input_keys = vec!["verdict".to_string()];
    let source = graph(
        "frontline",
        "intake",
        vec![
            emitting("intake", NodeKind::Function, json!({"case": "c-1"})),
            wait,
            emitting("close", NodeKind::Function, json!({"closed": true})),
        ],
        vec![
            EdgeSpec::new("intake", "wait", EdgeCondition::OnSuccess),
            EdgeSpec::new("wait", "close", EdgeCondition::OnSuccess),
        ],
        &["close"],
        &["wait"],
    );
    let target = graph(
        "specialist",
        "review",
        vec![emitting("review", NodeKind::Function, json!({"verdict": "ok"}))],
        vec![],
        &["review"],
        &[],
    );
    session.add_graph(source).unwrap();
    session.add_graph(target).unwrap();

    let paused = session.run("frontline", JsonMap::new()).await.unwrap();
    assert_eq!(paused.status, RunStatus::Paused);

    let escalation = session
        .escalate(&paused.run_id, "specialist")
        .await
        .unwrap();
    assert_eq!(escalation.target.status, RunStatus::Completed);
    // The target saw the source's memory.
    assert_eq!(escalation.target.memory.get("case"), Some(&json!("c-1")));

    let source_outcome = escalation.source.unwrap();
    assert_eq!(source_outcome.status, RunStatus::Completed);
    assert_eq!(source_outcome.memory.get("verdict"), Some(&json!("ok")));
    assert_eq!(source_outcome.memory.get("closed"), Some(&json!(true)));
}
