//! Decision trail and run persistence.
//!
//! Every `decide` must be paired with exactly one `record_outcome` before
//! the run ends; unpaired decisions are flagged as anomalies on the run
//! summary, never silently dropped. Completed runs and lightweight
//! summaries are handed to an external [`RunStore`].

use std::collections::HashMap;
use std::sync::Mutex;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tracing::debug;

use crate::error::{EngineError, Result};
use crate::executor::NodeMetrics;
use crate::memory::MemorySnapshot;
use crate::scheduler::ExecutionState;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RunStatus {
    Pending,
    Running,
    Completed,
    Failed,
    Paused,
}

impl RunStatus {
    pub const ALL: [RunStatus; 5] = [
        RunStatus::Pending,
        RunStatus::Running,
        RunStatus::Completed,
        RunStatus::Failed,
        RunStatus::Paused,
    ];
}

impl std::fmt::Display for RunStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            RunStatus::Pending => "pending",
            RunStatus::Running => "running",
            RunStatus::Completed => "completed",
            RunStatus::Failed => "failed",
            RunStatus::Paused => "paused",
        };
        f.write_str(s)
    }
}

/// Audit record of one choice made during a run. Immutable once written;
/// the outcome is appended exactly once via `record_outcome`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Decision {
    pub id: String,
    pub node_id: String,
    pub intent: String,
    pub options: Vec<String>,
    pub chosen: String,
    pub reasoning: String,
    pub decided_at: DateTime<Utc>,
    pub outcome: Option<DecisionOutcome>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DecisionOutcome {
    pub success: bool,
    pub result: Value,
    pub metrics: NodeMetrics,
    pub recorded_at: DateTime<Utc>,
}

/// One full execution, finalized at COMPLETED/FAILED/PAUSED.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Run {
    pub id: String,
    pub goal_id: String,
    pub graph_id: String,
    pub status: RunStatus,
    pub decisions: Vec<Decision>,
    pub final_memory: MemorySnapshot,
    pub started_at: DateTime<Utc>,
    pub ended_at: DateTime<Utc>,
    pub anomalies: Vec<String>,
}

/// Small projection of a run for fast listing.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Summary {
    pub run_id: String,
    pub goal_id: String,
    pub graph_id: String,
    pub status: RunStatus,
    pub duration_ms: u64,
    pub decision_count: usize,
    pub success_rate: f64,
    pub top_problems: Vec<String>,
    /// Distinct node ids touched, for index lookups by node.
    pub nodes: Vec<String>,
}

/// In-run decision recorder. Safe to call from concurrently executing
/// node tasks; per-node decision pairs are totally ordered by the append
/// log.
pub struct RunRecorder {
    run_id: String,
    goal_id: String,
    graph_id: String,
    started_at: DateTime<Utc>,
    inner: Mutex<RecorderInner>,
}

#[derive(Default)]
struct RecorderInner {
    decisions: Vec<Decision>,
    index: HashMap<String, usize>,
}

impl RunRecorder {
    pub fn new(run_id: &str, goal_id: &str, graph_id: &str) -> Self {
        Self {
            run_id: run_id.to_string(),
            goal_id: goal_id.to_string(),
            graph_id: graph_id.to_string(),
            started_at: Utc::now(),
            inner: Mutex::new(RecorderInner::default()),
        }
    }

    /// Rebuilds a recorder from a paused run's persisted trail so the
    /// resumed segment appends to the same run.
    pub fn resume(
        run_id: &str,
        goal_id: &str,
        graph_id: &str,
        started_at: DateTime<Utc>,
        decisions: Vec<Decision>,
    ) -> Self {
        let index = decisions
            .iter()
            .enumerate()
            .map(|(pos, d)| (d.id.clone(), pos))
            .collect();
        Self {
            run_id: run_id.to_string(),
            goal_id: goal_id.to_string(),
            graph_id: graph_id.to_string(),
            started_at,
            inner: Mutex::new(RecorderInner { decisions, index }),
        }
    }

    pub fn run_id(&self) -> &str {
        &self.run_id
    }

    /// Records intent, options and choice for a node; returns the
    /// decision id to pair with `record_outcome`.
    pub fn decide(
        &self,
        node_id: &str,
        intent: &str,
        options: Vec<String>,
        chosen: &str,
        reasoning: &str,
    ) -> String {
        let id = cuid2::create_id();
        let decision = Decision {
            id: id.clone(),
            node_id: node_id.to_string(),
            intent: intent.to_string(),
            options,
            chosen: chosen.to_string(),
            reasoning: reasoning.to_string(),
            decided_at: Utc::now(),
            outcome: None,
        };
        let mut inner = self.inner.lock().expect("recorder poisoned");
        let pos = inner.decisions.len();
        inner.decisions.push(decision);
        inner.index.insert(id.clone(), pos);
        debug!(run = %self.run_id, node = node_id, decision = %id, "decision recorded");
        id
    }

    /// Pairs an outcome with a prior decision. Unknown ids and double
    /// recording are rejected.
    pub fn record_outcome(
        &self,
        decision_id: &str,
        success: bool,
        result: Value,
        metrics: NodeMetrics,
    ) -> Result<()> {
        let mut inner = self.inner.lock().expect("recorder poisoned");
        let pos = *inner.index.get(decision_id).ok_or_else(|| {
            EngineError::internal(format!("record_outcome for unknown decision {decision_id}"))
        })?;
        let decision = &mut inner.decisions[pos];
        if decision.outcome.is_some() {
            return Err(EngineError::internal(format!(
                "decision {decision_id} already has an outcome"
            )));
        }
        decision.outcome = Some(DecisionOutcome {
            success,
            result,
            metrics,
            recorded_at: Utc::now(),
        });
        Ok(())
    }

    /// Closes the run: unpaired decisions become anomalies, and the
    /// decision log plus final memory snapshot freeze into a [`Run`]
    /// and its [`Summary`] projection.
    pub fn finalize(&self, status: RunStatus, final_memory: MemorySnapshot) -> (Run, Summary) {
        let inner = self.inner.lock().expect("recorder poisoned");
        let decisions = inner.decisions.clone();
        drop(inner);

        let anomalies: Vec<String> = decisions
            .iter()
            .filter(|d| d.outcome.is_none())
            .map(|d| format!("unpaired_decision:{}:{}", d.id, d.node_id))
            .collect();

        let ended_at = Utc::now();
        let paired: Vec<&Decision> = decisions.iter().filter(|d| d.outcome.is_some()).collect();
        let success_rate = if paired.is_empty() {
            0.0
        } else {
            let ok = paired
                .iter()
                .filter(|d| d.outcome.as_ref().is_some_and(|o| o.success))
                .count();
            ok as f64 / paired.len() as f64
        };

        let mut failures: HashMap<String, usize> = HashMap::new();
        for d in &paired {
            if let Some(outcome) = &d.outcome {
                if !outcome.success {
                    let problem = match outcome.result.get("error").and_then(|e| e.as_str()) {
                        Some(msg) => format!("{}: {msg}", d.node_id),
                        None => d.node_id.clone(),
                    };
                    *failures.entry(problem).or_default() += 1;
                }
            }
        }
        let mut top_problems: Vec<(String, usize)> = failures.into_iter().collect();
        top_problems.sort_by(|a, b| b.1.cmp(&a.1).then_with(|| a.0.cmp(&b.0)));
        let top_problems: Vec<String> = top_problems.into_iter().take(3).map(|(p, _)| p).collect();

        let mut nodes: Vec<String> = Vec::new();
        for d in &decisions {
            if !nodes.contains(&d.node_id) {
                nodes.push(d.node_id.clone());
            }
        }

        let run = Run {
            id: self.run_id.clone(),
            goal_id: self.goal_id.clone(),
            graph_id: self.graph_id.clone(),
            status,
            decisions: decisions.clone(),
            final_memory,
            started_at: self.started_at,
            ended_at,
            anomalies,
        };
        let summary = Summary {
            run_id: self.run_id.clone(),
            goal_id: self.goal_id.clone(),
            graph_id: self.graph_id.clone(),
            status,
            duration_ms: (ended_at - self.started_at).num_milliseconds().max(0) as u64,
            decision_count: decisions.len(),
            success_rate,
            top_problems,
            nodes,
        };
        (run, summary)
    }
}

/// External storage collaborator for runs, summaries, and paused
/// execution state.
#[async_trait]
pub trait RunStore: Send + Sync {
    async fn save_run(&self, run: &Run) -> Result<()>;
    async fn load_run(&self, run_id: &str) -> Result<Option<Run>>;
    async fn save_summary(&self, summary: &Summary) -> Result<()>;
    async fn list_by_goal(&self, goal_id: &str) -> Result<Vec<Summary>>;
    async fn list_by_status(&self, status: RunStatus) -> Result<Vec<Summary>>;
    async fn list_by_node(&self, node_id: &str) -> Result<Vec<Summary>>;
    async fn save_state(&self, state: &ExecutionState) -> Result<()>;
    async fn load_state(&self, run_id: &str) -> Result<Option<ExecutionState>>;
    /// Atomically takes the paused state for a run. Exactly one of any
    /// set of concurrent callers observes `Some`; the rest get `None`.
    async fn claim_state(&self, run_id: &str) -> Result<Option<ExecutionState>>;
    async fn delete_state(&self, run_id: &str) -> Result<()>;
}

/// Sled-backed reference implementation: serde_json payloads in named
/// trees plus secondary index trees by goal, status, and node.
pub struct SledStore {
    runs: sled::Tree,
    summaries: sled::Tree,
    states: sled::Tree,
    idx_goal: sled::Tree,
    idx_status: sled::Tree,
    idx_node: sled::Tree,
}

impl SledStore {
    pub fn open(path: impl AsRef<std::path::Path>) -> Result<Self> {
        let db = sled::open(path)?;
        Ok(Self {
            runs: db.open_tree("runs")?,
            summaries: db.open_tree("summaries")?,
            states: db.open_tree("states")?,
            idx_goal: db.open_tree("idx_goal")?,
            idx_status: db.open_tree("idx_status")?,
            idx_node: db.open_tree("idx_node")?,
        })
    }

    fn index_remove(tree: &sled::Tree, key: &str, run_id: &str) -> Result<()> {
        if let Some(raw) = tree.get(key)? {
            let mut ids: Vec<String> = serde_json::from_slice(&raw)?;
            let before = ids.len();
            ids.retain(|id| id != run_id);
            if ids.len() != before {
                if ids.is_empty() {
                    tree.remove(key)?;
                } else {
                    tree.insert(key, serde_json::to_vec(&ids)?)?;
                }
            }
        }
        Ok(())
    }

    fn index_add(tree: &sled::Tree, key: &str, run_id: &str) -> Result<()> {
        let mut ids: Vec<String> = match tree.get(key)? {
            Some(raw) => serde_json::from_slice(&raw)?,
            None => Vec::new(),
        };
        if !ids.iter().any(|id| id == run_id) {
            ids.push(run_id.to_string());
            tree.insert(key, serde_json::to_vec(&ids)?)?;
        }
        Ok(())
    }

    fn lookup_index(&self, tree: &sled::Tree, key: &str) -> Result<Vec<Summary>> {
        let ids: Vec<String> = match tree.get(key)? {
            Some(raw) => serde_json::from_slice(&raw)?,
            None => return Ok(Vec::new()),
        };
        let mut summaries = Vec::with_capacity(ids.len());
        for id in ids {
            if let Some(raw) = self.summaries.get(&id)? {
                summaries.push(serde_json::from_slice(&raw)?);
            }
        }
        Ok(summaries)
    }
}

#[async_trait]
impl RunStore for SledStore {
    async fn save_run(&self, run: &Run) -> Result<()> {
        self.runs
            .insert(run.id.as_str(), serde_json::to_vec(run)?)?;
        Ok(())
    }

    async fn load_run(&self, run_id: &str) -> Result<Option<Run>> {
        match self.runs.get(run_id)? {
            Some(raw) => Ok(Some(serde_json::from_slice(&raw)?)),
            None => Ok(None),
        }
    }

    async fn save_summary(&self, summary: &Summary) -> Result<()> {
        self.summaries
            .insert(summary.run_id.as_str(), serde_json::to_vec(summary)?)?;
        Self::index_add(&self.idx_goal, &summary.goal_id, &summary.run_id)?;
        // A run moves between status buckets as it pauses and resumes;
        // drop it from the buckets it no longer belongs to.
        for status in RunStatus::ALL {
            if status != summary.status {
                Self::index_remove(&self.idx_status, &status.to_string(), &summary.run_id)?;
            }
        }
        Self::index_add(&self.idx_status, &summary.status.to_string(), &summary.run_id)?;
        for node in &summary.nodes {
            Self::index_add(&self.idx_node, node, &summary.run_id)?;
        }
        Ok(())
    }

    async fn list_by_goal(&self, goal_id: &str) -> Result<Vec<Summary>> {
        self.lookup_index(&self.idx_goal, goal_id)
    }

    async fn list_by_status(&self, status: RunStatus) -> Result<Vec<Summary>> {
        self.lookup_index(&self.idx_status, &status.to_string())
    }

    async fn list_by_node(&self, node_id: &str) -> Result<Vec<Summary>> {
        self.lookup_index(&self.idx_node, node_id)
    }

    async fn save_state(&self, state: &ExecutionState) -> Result<()> {
        self.states
            .insert(state.run_id.as_str(), serde_json::to_vec(state)?)?;
        Ok(())
    }

    async fn load_state(&self, run_id: &str) -> Result<Option<ExecutionState>> {
        match self.states.get(run_id)? {
            Some(raw) => Ok(Some(serde_json::from_slice(&raw)?)),
            None => Ok(None),
        }
    }

    async fn claim_state(&self, run_id: &str) -> Result<Option<ExecutionState>> {
        match self.states.remove(run_id)? {
            Some(raw) => Ok(Some(serde_json::from_slice(&raw)?)),
            None => Ok(None),
        }
    }

    async fn delete_state(&self, run_id: &str) -> Result<()> {
        self.states.remove(run_id)?;
        Ok(())
    }
}

/// In-memory store for tests and embedded use.
#[derive(Default)]
pub struct MemoryStore {
    runs: dashmap::DashMap<String, Run>,
    summaries: dashmap::DashMap<String, Summary>,
    states: dashmap::DashMap<String, ExecutionState>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl RunStore for MemoryStore {
    async fn save_run(&self, run: &Run) -> Result<()> {
        self.runs.insert(run.id.clone(), run.clone());
        Ok(())
    }

    async fn load_run(&self, run_id: &str) -> Result<Option<Run>> {
        Ok(self.runs.get(run_id).map(|r| r.clone()))
    }

    async fn save_summary(&self, summary: &Summary) -> Result<()> {
        self.summaries.insert(summary.run_id.clone(), summary.clone());
        Ok(())
    }

    async fn list_by_goal(&self, goal_id: &str) -> Result<Vec<Summary>> {
        Ok(self
            .summaries
            .iter()
            .filter(|s| s.goal_id == goal_id)
            .map(|s| s.clone())
            .collect())
    }

    async fn list_by_status(&self, status: RunStatus) -> Result<Vec<Summary>> {
        Ok(self
            .summaries
            .iter()
            .filter(|s| s.status == status)
            .map(|s| s.clone())
            .collect())
    }

    async fn list_by_node(&self, node_id: &str) -> Result<Vec<Summary>> {
        Ok(self
            .summaries
            .iter()
            .filter(|s| s.nodes.iter().any(|n| n == node_id))
            .map(|s| s.clone())
            .collect())
    }

    async fn save_state(&self, state: &ExecutionState) -> Result<()> {
        self.states.insert(state.run_id.clone(), state.clone());
        Ok(())
    }

    async fn load_state(&self, run_id: &str) -> Result<Option<ExecutionState>> {
        Ok(self.states.get(run_id).map(|s| s.clone()))
    }

    async fn claim_state(&self, run_id: &str) -> Result<Option<ExecutionState>> {
        Ok(self.states.remove(run_id).map(|(_, s)| s))
    }

    async fn delete_state(&self, run_id: &str) -> Result<()> {
        self.states.remove(run_id);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_decide_then_record_outcome() {
        let recorder = RunRecorder::new("run-1", "goal-1", "graph-1");
        let id = recorder.decide(
            "classify",
            "execute node",
            vec!["generative".to_string()],
            "generative",
            "only registered worker",
        );
        recorder
            .record_outcome(&id, true, json!({"category": "greeting"}), NodeMetrics::default())
            .unwrap();

        let (run, summary) = recorder.finalize(RunStatus::Completed, MemorySnapshot::new());
        assert!(run.anomalies.is_empty());
        assert_eq!(summary.decision_count, 1);
        assert_eq!(summary.success_rate, 1.0);
    }

    #[test]
    fn test_unknown_decision_rejected() {
        let recorder = RunRecorder::new("run-1", "goal-1", "graph-1");
        assert!(recorder
            .record_outcome("nope", true, json!(null), NodeMetrics::default())
            .is_err());
    }

    #[test]
    fn test_double_outcome_rejected() {
        let recorder = RunRecorder::new("run-1", "goal-1", "graph-1");
        let id = recorder.decide("n", "execute node", vec![], "w", "");
        recorder
            .record_outcome(&id, true, json!(null), NodeMetrics::default())
            .unwrap();
        assert!(recorder
            .record_outcome(&id, false, json!(null), NodeMetrics::default())
            .is_err());
    }

    #[test]
    fn test_unpaired_decision_flagged_not_dropped() {
        let recorder = RunRecorder::new("run-1", "goal-1", "graph-1");
        let id = recorder.decide("n", "execute node", vec![], "w", "");
        let (run, _) = recorder.finalize(RunStatus::Completed, MemorySnapshot::new());
        assert_eq!(run.decisions.len(), 1);
        assert_eq!(run.anomalies.len(), 1);
        assert!(run.anomalies[0].contains(&id));
    }

    #[test]
    fn test_decisions_are_time_ordered() {
        let recorder = RunRecorder::new("run-1", "goal-1", "graph-1");
        for i in 0..5 {
            let id = recorder.decide(&format!("n{i}"), "execute node", vec![], "w", "");
            recorder
                .record_outcome(&id, true, json!(null), NodeMetrics::default())
                .unwrap();
        }
        let (run, _) = recorder.finalize(RunStatus::Completed, MemorySnapshot::new());
        for pair in run.decisions.windows(2) {
            assert!(pair[0].decided_at <= pair[1].decided_at);
        }
    }

    #[tokio::test]
    async fn test_sled_store_round_trip_and_indexes() {
        let dir = tempfile::tempdir().unwrap();
        let store = SledStore::open(dir.path()).unwrap();

        let recorder = RunRecorder::new("run-1", "goal-1", "graph-1");
        let id = recorder.decide("classify", "execute node", vec![], "w", "");
        recorder
            .record_outcome(&id, false, json!({"error": "boom"}), NodeMetrics::default())
            .unwrap();
        let (run, summary) = recorder.finalize(RunStatus::Failed, MemorySnapshot::new());

        store.save_run(&run).await.unwrap();
        store.save_summary(&summary).await.unwrap();

        let loaded = store.load_run("run-1").await.unwrap().unwrap();
        assert_eq!(loaded.status, RunStatus::Failed);
        assert_eq!(loaded.decisions.len(), 1);

        assert_eq!(store.list_by_goal("goal-1").await.unwrap().len(), 1);
        assert_eq!(
            store.list_by_status(RunStatus::Failed).await.unwrap().len(),
            1
        );
        assert_eq!(store.list_by_node("classify").await.unwrap().len(), 1);
        assert!(store.list_by_goal("other").await.unwrap().is_empty());

        let problems = &store.list_by_goal("goal-1").await.unwrap()[0].top_problems;
        assert_eq!(problems, &vec!["classify: boom".to_string()]);
    }

    #[tokio::test]
    async fn test_sled_status_index_follows_run_across_statuses() {
        let dir = tempfile::tempdir().unwrap();
        let store = SledStore::open(dir.path()).unwrap();

        // The run pauses first, then finishes after a resume.
        let recorder = RunRecorder::new("run-1", "goal-1", "graph-1");
        let (_, paused) = recorder.finalize(RunStatus::Paused, MemorySnapshot::new());
        store.save_summary(&paused).await.unwrap();
        let (_, completed) = recorder.finalize(RunStatus::Completed, MemorySnapshot::new());
        store.save_summary(&completed).await.unwrap();

        assert!(store.list_by_status(RunStatus::Paused).await.unwrap().is_empty());
        let done = store.list_by_status(RunStatus::Completed).await.unwrap();
        assert_eq!(done.len(), 1);
        assert_eq!(done[0].run_id, "run-1");
    }
}
