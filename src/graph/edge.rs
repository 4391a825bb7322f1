use serde::{Deserialize, Serialize};

/// Gate deciding whether an edge fires after its source node completes.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum EdgeCondition {
    /// Fires unconditionally.
    Always,
    /// Fires when the source node succeeded.
    OnSuccess,
    /// Fires when the source node failed.
    OnFailure,
    /// Fires when the restricted expression evaluates truthy over shared
    /// memory. Compiled at graph validation; evaluation errors fail
    /// closed.
    Conditional { expr: String },
    /// Delegates the choice among LLM_DECIDE candidates leaving the node
    /// to an external decision provider.
    LlmDecide,
}

/// Directed transition between two nodes.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EdgeSpec {
    pub source: String,
    pub target: String,
    pub condition: EdgeCondition,
    /// Eligible edges are ordered by priority descending, then by
    /// declaration order.
    #[serde(default)]
    pub priority: i32,
}

impl EdgeSpec {
    pub fn new<S: Into<String>>(source: S, target: S, condition: EdgeCondition) -> Self {
        Self {
            source: source.into(),
            target: target.into(),
            condition,
            priority: 0,
        }
    }

    pub fn with_priority(mut self, priority: i32) -> Self {
        self.priority = priority;
        self
    }
}
