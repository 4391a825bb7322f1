use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Unified error type for the engine.
#[derive(Debug, Error)]
pub enum EngineError {
    /// Graph rejected at load time. Never raised during a run.
    #[error("Validation failed: {message}")]
    Validation {
        message: String,
        field: Option<String>,
    },

    /// Required input keys absent from shared memory.
    #[error("Node {node_id} is missing required inputs: {keys:?}")]
    InputMissing { node_id: String, keys: Vec<String> },

    /// No eligible outgoing edge from a non-terminal node.
    #[error("Dead end at node {node_id}: no eligible outgoing edge")]
    DeadEnd { node_id: String },

    /// A global cap (max_steps, deadline) was exceeded.
    #[error("Resource exceeded: {resource} (current: {current}, limit: {limit})")]
    ResourceExceeded {
        resource: String,
        current: u64,
        limit: u64,
    },

    /// Circuit breaker is open for a dependency; no call was attempted.
    #[error("Circuit open for dependency {dependency}")]
    CircuitOpen { dependency: String },

    /// Rate limiter could not grant a token within the allowed wait.
    #[error("Rate limited on dependency {dependency} after waiting {waited_ms}ms")]
    RateLimited { dependency: String, waited_ms: u64 },

    /// Budget governor refused new generative work.
    #[error("Budget exhausted: spent {spent:.2} of cap {cap:.2}")]
    BudgetBlocked { spent: f64, cap: f64 },

    /// Run is not in the state an operation requires (e.g. resume on a
    /// run that is not paused).
    #[error("Run {run_id} is {actual}, expected {expected}")]
    InvalidRunState {
        run_id: String,
        expected: String,
        actual: String,
    },

    /// Storage backend failure.
    #[error("Storage operation failed: {operation}")]
    Storage {
        operation: String,
        #[source]
        source: Box<dyn std::error::Error + Send + Sync>,
    },

    /// Serialization failure.
    #[error("Serialization failed: {format}")]
    Serialization {
        format: String,
        #[source]
        source: Box<dyn std::error::Error + Send + Sync>,
    },

    #[error("Operation timed out: {operation} (timeout: {timeout_ms}ms)")]
    Timeout { operation: String, timeout_ms: u64 },

    #[error("Operation was cancelled: {operation}")]
    Cancelled { operation: String },

    #[error("Internal error: {message}")]
    Internal { message: String },
}

impl EngineError {
    pub fn validation<S: Into<String>>(message: S) -> Self {
        Self::Validation {
            message: message.into(),
            field: None,
        }
    }

    pub fn validation_field<S: Into<String>, F: Into<String>>(message: S, field: F) -> Self {
        Self::Validation {
            message: message.into(),
            field: Some(field.into()),
        }
    }

    pub fn input_missing<S: Into<String>>(node_id: S, keys: Vec<String>) -> Self {
        Self::InputMissing {
            node_id: node_id.into(),
            keys,
        }
    }

    pub fn dead_end<S: Into<String>>(node_id: S) -> Self {
        Self::DeadEnd {
            node_id: node_id.into(),
        }
    }

    pub fn resource_exceeded<S: Into<String>>(resource: S, current: u64, limit: u64) -> Self {
        Self::ResourceExceeded {
            resource: resource.into(),
            current,
            limit,
        }
    }

    pub fn invalid_run_state<S: Into<String>>(run_id: S, expected: S, actual: S) -> Self {
        Self::InvalidRunState {
            run_id: run_id.into(),
            expected: expected.into(),
            actual: actual.into(),
        }
    }

    pub fn storage<S: Into<String>, E: std::error::Error + Send + Sync + 'static>(
        operation: S,
        source: E,
    ) -> Self {
        Self::Storage {
            operation: operation.into(),
            source: Box::new(source),
        }
    }

    pub fn serialization<S: Into<String>, E: std::error::Error + Send + Sync + 'static>(
        format: S,
        source: E,
    ) -> Self {
        Self::Serialization {
            format: format.into(),
            source: Box::new(source),
        }
    }

    pub fn timeout<S: Into<String>>(operation: S, timeout_ms: u64) -> Self {
        Self::Timeout {
            operation: operation.into(),
            timeout_ms,
        }
    }

    pub fn cancelled<S: Into<String>>(operation: S) -> Self {
        Self::Cancelled {
            operation: operation.into(),
        }
    }

    pub fn internal<S: Into<String>>(message: S) -> Self {
        Self::Internal {
            message: message.into(),
        }
    }

    /// Whether retrying the failed operation could help.
    pub fn is_retryable(&self) -> bool {
        match self {
            Self::Timeout { .. } | Self::RateLimited { .. } => true,
            Self::CircuitOpen { .. } => true, // breaker may close again
            Self::Storage { .. } => true,
            Self::Validation { .. }
            | Self::InputMissing { .. }
            | Self::DeadEnd { .. }
            | Self::BudgetBlocked { .. }
            | Self::InvalidRunState { .. }
            | Self::Cancelled { .. } => false,
            _ => false,
        }
    }

    /// Error category for metrics and logging.
    pub fn category(&self) -> &'static str {
        match self {
            Self::Validation { .. } => "validation",
            Self::InputMissing { .. } => "input_missing",
            Self::DeadEnd { .. } => "dead_end",
            Self::ResourceExceeded { .. } => "resource",
            Self::CircuitOpen { .. } => "circuit_open",
            Self::RateLimited { .. } => "rate_limited",
            Self::BudgetBlocked { .. } => "budget",
            Self::InvalidRunState { .. } => "run_state",
            Self::Storage { .. } => "storage",
            Self::Serialization { .. } => "serialization",
            Self::Timeout { .. } => "timeout",
            Self::Cancelled { .. } => "cancelled",
            Self::Internal { .. } => "internal",
        }
    }
}

impl From<serde_json::Error> for EngineError {
    fn from(err: serde_json::Error) -> Self {
        Self::serialization("json", err)
    }
}

impl From<serde_yaml::Error> for EngineError {
    fn from(err: serde_yaml::Error) -> Self {
        Self::serialization("yaml", err)
    }
}

impl From<sled::Error> for EngineError {
    fn from(err: sled::Error) -> Self {
        Self::storage("sled_operation", err)
    }
}

/// Result type alias for convenience.
pub type Result<T> = std::result::Result<T, EngineError>;

/// Classification of a failed node execution. Drives the retry decision:
/// only transient classes are retried.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorClass {
    /// Worker call exceeded its per-attempt timeout.
    Timeout,
    /// Dependency reported rate limiting.
    RateLimited,
    /// Transient I/O or infrastructure failure.
    TransientIo,
    /// Input/constraint violation reported by the worker.
    Validation,
    /// Authentication/authorization failure.
    Auth,
    /// Required input keys were absent from shared memory.
    InputMissing,
    /// Worker reported success but a required output key was absent.
    IncompleteOutput,
    /// Any other permanent failure.
    Permanent,
}

impl ErrorClass {
    pub fn is_transient(&self) -> bool {
        matches!(
            self,
            ErrorClass::Timeout | ErrorClass::RateLimited | ErrorClass::TransientIo
        )
    }
}

impl std::fmt::Display for ErrorClass {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            ErrorClass::Timeout => "timeout",
            ErrorClass::RateLimited => "rate_limited",
            ErrorClass::TransientIo => "transient_io",
            ErrorClass::Validation => "validation",
            ErrorClass::Auth => "auth",
            ErrorClass::InputMissing => "input_missing",
            ErrorClass::IncompleteOutput => "incomplete_output",
            ErrorClass::Permanent => "permanent",
        };
        f.write_str(s)
    }
}
