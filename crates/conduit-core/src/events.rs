//! Event types and the sequence-numbered envelope delivered to clients.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use crate::ids::RunId;
use crate::stage::StageKind;

/// Fixed overhead added to a payload's length when estimating envelope size.
const ENVELOPE_OVERHEAD_BYTES: usize = 128;

/// Kind of lifecycle event emitted for a run.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EventType {
    /// A stage entered `running`.
    AgentStarted,
    /// A stage invoked a tool.
    ToolExecuting,
    /// A stage reported intermediate reasoning.
    AgentThinking,
    /// A stage streamed a partial result.
    PartialResult,
    /// A stage reached a terminal status (completed or failed).
    AgentCompleted,
    /// Every stage completed.
    RunCompleted,
    /// The run ended in failure or cancellation.
    RunFailed,
}

impl EventType {
    /// Wire name.
    pub fn as_str(self) -> &'static str {
        match self {
            Self::AgentStarted => "agent_started",
            Self::ToolExecuting => "tool_executing",
            Self::AgentThinking => "agent_thinking",
            Self::PartialResult => "partial_result",
            Self::AgentCompleted => "agent_completed",
            Self::RunCompleted => "run_completed",
            Self::RunFailed => "run_failed",
        }
    }

    /// Whether this is the last event of a run.
    pub fn is_terminal(self) -> bool {
        matches!(self, Self::RunCompleted | Self::RunFailed)
    }
}

/// One event of one run, as delivered to a connection.
///
/// `sequence_number` starts at 1 per run and is the only key clients need
/// for ordering and duplicate suppression.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct EventEnvelope {
    /// Event kind.
    #[serde(rename = "type")]
    pub event_type: EventType,
    /// Run the event belongs to.
    pub run_id: RunId,
    /// Event body.
    pub payload: Value,
    /// Per-run monotonic sequence number.
    pub sequence_number: u64,
    /// Emission time.
    pub timestamp: DateTime<Utc>,
}

impl EventEnvelope {
    /// Rough in-memory size, used for footprint accounting.
    pub fn approx_size(&self) -> usize {
        ENVELOPE_OVERHEAD_BYTES + self.run_id.len() + payload_size(&self.payload)
    }
}

fn payload_size(value: &Value) -> usize {
    match value {
        Value::Null | Value::Bool(_) => 8,
        Value::Number(_) => 16,
        Value::String(s) => s.len() + 8,
        Value::Array(items) => 8 + items.iter().map(payload_size).sum::<usize>(),
        Value::Object(map) => {
            8 + map
                .iter()
                .map(|(k, v)| k.len() + payload_size(v))
                .sum::<usize>()
        }
    }
}

/// Build a stage payload carrying `agent_name` and `stage_kind` plus `extra`.
///
/// Keys in `extra` override the base fields if they collide.
pub fn stage_payload(agent_name: &str, stage_kind: StageKind, extra: Value) -> Value {
    let mut map = Map::new();
    let _ = map.insert("agent_name".into(), Value::String(agent_name.to_owned()));
    let _ = map.insert(
        "stage_kind".into(),
        Value::String(stage_kind.as_str().to_owned()),
    );
    if let Value::Object(fields) = extra {
        map.extend(fields);
    }
    Value::Object(map)
}
