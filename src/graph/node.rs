use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::resilience::retry::Backoff;

/// Closed set of node kinds. The worker-specific payload lives in
/// [`NodeSpec::config`], which the engine never interprets.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum NodeKind {
    /// Calls a generative model. Subject to budget governance.
    Generative,
    /// Invokes an external tool.
    Tool,
    /// Deterministic in-process function.
    Function,
    /// Chooses among outgoing edges; typically paired with CONDITIONAL
    /// or LLM_DECIDE edges.
    Router,
    /// Waits for human-supplied input (pause nodes).
    HumanInput,
}

impl NodeKind {
    /// Dependency key used to scope circuit breakers and rate limiters
    /// when a node does not name a worker explicitly.
    pub fn as_str(&self) -> &'static str {
        match self {
            NodeKind::Generative => "generative",
            NodeKind::Tool => "tool",
            NodeKind::Function => "function",
            NodeKind::Router => "router",
            NodeKind::HumanInput => "human_input",
        }
    }
}

/// Retry behavior for one node. Nodes without a policy inherit the run
/// default.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RetryPolicy {
    pub max_retries: u32,
    #[serde(default)]
    pub backoff: Backoff,
}

/// One unit of work in a graph. Built once, immutable afterwards.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NodeSpec {
    pub id: String,
    pub kind: NodeKind,
    /// Keys read from shared memory. All non-nullable keys must be
    /// present before the node may run.
    #[serde(default)]
    pub input_keys: Vec<String>,
    /// Keys written to shared memory on success.
    #[serde(default)]
    pub output_keys: Vec<String>,
    /// Output keys the worker may legitimately omit.
    #[serde(default)]
    pub nullable_output_keys: Vec<String>,
    #[serde(default)]
    pub retry: Option<RetryPolicy>,
    /// Visit cap for this node (0 = unlimited). The only loop guard for
    /// self-loop edges.
    #[serde(default)]
    pub max_visits: u32,
    /// Whether the node surfaces output directly to the client.
    #[serde(default)]
    pub client_facing: bool,
    /// Accumulator nodes may flush partial output on failure or
    /// cancellation so a later resume observes correct values.
    #[serde(default)]
    pub accumulator: bool,
    /// Named worker override; defaults to the worker registered for the
    /// node kind.
    #[serde(default)]
    pub worker: Option<String>,
    /// Worker-specific payload. Opaque to the engine.
    #[serde(default)]
    pub config: Value,
}

impl NodeSpec {
    pub fn new<S: Into<String>>(id: S, kind: NodeKind) -> Self {
        Self {
            id: id.into(),
            kind,
            input_keys: Vec::new(),
            output_keys: Vec::new(),
            nullable_output_keys: Vec::new(),
            retry: None,
            max_visits: 0,
            client_facing: false,
            accumulator: false,
            worker: None,
            config: Value::Null,
        }
    }

    /// Dependency key for resilience scoping: the named worker if any,
    /// else the node kind.
    pub fn dependency(&self) -> &str {
        self.worker.as_deref().unwrap_or(self.kind.as_str())
    }

    pub fn required_output_keys(&self) -> impl Iterator<Item = &String> {
        self.output_keys
            .iter()
            .filter(|k| !self.nullable_output_keys.contains(k))
    }
}
