use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Declarative objective a graph exists to satisfy. Created at build
/// time, immutable afterwards.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Goal {
    pub id: String,
    pub description: String,
    #[serde(default)]
    pub success_criteria: Vec<SuccessCriterion>,
    #[serde(default)]
    pub constraints: Vec<Constraint>,
    /// Declared shape of the run input. Opaque to the engine.
    #[serde(default)]
    pub input_schema: Value,
    /// Declared shape of the run output. Opaque to the engine.
    #[serde(default)]
    pub output_schema: Value,
}

/// One weighted metric contributing to goal success.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SuccessCriterion {
    pub metric: String,
    pub weight: f64,
    pub target: Value,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ConstraintKind {
    /// Violation fails the run.
    Hard,
    /// Violation is reported but tolerated.
    Soft,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Constraint {
    pub description: String,
    pub kind: ConstraintKind,
}

impl Goal {
    pub fn from_json_str(text: &str) -> crate::error::Result<Self> {
        Ok(serde_json::from_str(text)?)
    }

    pub fn from_yaml_str(text: &str) -> crate::error::Result<Self> {
        Ok(serde_yaml::from_str(text)?)
    }
}
