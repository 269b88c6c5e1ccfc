//! Telemetry event types for observable RLM execution.
//!
//! Events carry the recursion lineage (`recursion_id`,
//! `parent_recursion_id`, `depth`) required for correlation in an
//! external time-series sink. The sink itself is out of scope; this
//! module fixes the event shape it must accept.

use std::collections::HashMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Types of telemetry events emitted during execution.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum TelemetryEventKind {
    /// A reasoning level started
    LevelStart,
    /// A reasoning level returned
    LevelEnd,
    /// One model round completed
    ModelCall,
    /// Sandbox code execution completed
    CodeExec,
    /// Recursive sub-call started
    SubCallStart,
    /// Recursive sub-call completed
    SubCallEnd,
    /// An error observed at this level
    Error,
}

impl std::fmt::Display for TelemetryEventKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            Self::LevelStart => "LEVEL_START",
            Self::LevelEnd => "LEVEL_END",
            Self::ModelCall => "MODEL_CALL",
            Self::CodeExec => "CODE_EXEC",
            Self::SubCallStart => "SUB_CALL_START",
            Self::SubCallEnd => "SUB_CALL_END",
            Self::Error => "ERROR",
        };
        write!(f, "{s}")
    }
}

/// A telemetry event tagged with its recursion lineage.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TelemetryEvent {
    /// Type of the event
    pub kind: TelemetryEventKind,
    /// Unique id of the emitting invocation
    pub recursion_id: String,
    /// Id of the parent invocation; absent at the root
    #[serde(skip_serializing_if = "Option::is_none")]
    pub parent_recursion_id: Option<String>,
    /// Recursion depth (0 = root)
    pub depth: u32,
    /// Human-readable description
    pub content: String,
    /// Event-specific metadata
    #[serde(skip_serializing_if = "Option::is_none")]
    pub metadata: Option<HashMap<String, Value>>,
    /// When the event occurred
    pub timestamp: DateTime<Utc>,
}

impl TelemetryEvent {
    pub fn new(
        kind: TelemetryEventKind,
        recursion_id: impl Into<String>,
        parent_recursion_id: Option<String>,
        depth: u32,
        content: impl Into<String>,
    ) -> Self {
        Self {
            kind,
            recursion_id: recursion_id.into(),
            parent_recursion_id,
            depth,
            content: content.into(),
            metadata: None,
            timestamp: Utc::now(),
        }
    }

    /// Add metadata to the event.
    pub fn with_metadata(mut self, key: impl Into<String>, value: impl Into<Value>) -> Self {
        self.metadata
            .get_or_insert_with(HashMap::new)
            .insert(key.into(), value.into());
        self
    }
}

/// Destination for telemetry events. Implementations must be cheap and
/// non-blocking; the reasoning loop calls this inline.
pub trait TelemetrySink: Send + Sync {
    fn record(&self, event: TelemetryEvent);
}

/// Discards all events.
#[derive(Debug, Default)]
pub struct NoopSink;

impl TelemetrySink for NoopSink {
    fn record(&self, _event: TelemetryEvent) {}
}

/// Buffers events in memory; used by tests and local inspection.
#[derive(Debug, Default)]
pub struct MemorySink {
    events: std::sync::Mutex<Vec<TelemetryEvent>>,
}

impl MemorySink {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn events(&self) -> Vec<TelemetryEvent> {
        self.events.lock().expect("telemetry lock poisoned").clone()
    }
}

impl TelemetrySink for MemorySink {
    fn record(&self, event: TelemetryEvent) {
        self.events
            .lock()
            .expect("telemetry lock poisoned")
            .push(event);
    }
}
