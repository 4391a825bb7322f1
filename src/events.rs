//! Typed event stream for run observers.
//!
//! Events are delivered at-least-once; consumers dedupe on the envelope id.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use serde::{Deserialize, Serialize};

/// Runtime event types, tagged by run and graph in the envelope.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type")]
pub enum EngineEvent {
    NodeStarted {
        node_id: String,
    },
    NodeCompleted {
        node_id: String,
        success: bool,
        duration_ms: u64,
    },
    EdgeFired {
        source: String,
        target: String,
    },
    RunPaused {
        node_id: String,
        missing_inputs: Vec<String>,
    },
    RunResumed {
        node_id: String,
    },
    RunCompleted,
    RunFailed {
        node_id: Option<String>,
        reason: String,
    },
    DecisionRecorded {
        decision_id: String,
        node_id: String,
    },
}

/// Event envelope with delivery metadata.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EventEnvelope {
    pub id: String,
    pub sequence: u64,
    pub run_id: String,
    pub graph_id: String,
    pub timestamp_ms: u64,
    pub event: EngineEvent,
}

/// Event sink trait for emitting events.
pub trait EventSink: Send + Sync {
    fn emit(&self, envelope: &EventEnvelope);
}

/// A simple logging event sink.
pub struct LoggingSink;

impl EventSink for LoggingSink {
    fn emit(&self, envelope: &EventEnvelope) {
        tracing::debug!("Event: {:?}", envelope);
    }
}

/// A buffering event sink that collects events, mainly for tests and
/// in-process observers.
#[derive(Default)]
pub struct BufferingSink {
    events: Arc<std::sync::RwLock<Vec<EventEnvelope>>>,
}

impl BufferingSink {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn events(&self) -> Vec<EventEnvelope> {
        self.events.read().expect("event buffer poisoned").clone()
    }

    pub fn clear(&self) {
        self.events.write().expect("event buffer poisoned").clear();
    }
}

impl EventSink for BufferingSink {
    fn emit(&self, envelope: &EventEnvelope) {
        self.events
            .write()
            .expect("event buffer poisoned")
            .push(envelope.clone());
    }
}

static EVENT_SEQUENCE: AtomicU64 = AtomicU64::new(0);

fn next_sequence() -> u64 {
    EVENT_SEQUENCE.fetch_add(1, Ordering::SeqCst)
}

fn now_ms() -> u64 {
    chrono::Utc::now().timestamp_millis() as u64
}

/// Handle used by the scheduler to emit tagged events.
#[derive(Clone)]
pub struct EventEmitter {
    run_id: String,
    graph_id: String,
    sink: Option<Arc<dyn EventSink>>,
}

impl EventEmitter {
    pub fn new(run_id: &str, graph_id: &str, sink: Option<Arc<dyn EventSink>>) -> Self {
        Self {
            run_id: run_id.to_string(),
            graph_id: graph_id.to_string(),
            sink,
        }
    }

    pub fn emit(&self, event: EngineEvent) {
        if let Some(sink) = &self.sink {
            let envelope = EventEnvelope {
                id: cuid2::create_id(),
                sequence: next_sequence(),
                run_id: self.run_id.clone(),
                graph_id: self.graph_id.clone(),
                timestamp_ms: now_ms(),
                event,
            };
            sink.emit(&envelope);
        }
    }
}
