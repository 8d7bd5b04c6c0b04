use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;

/// One unit of work handed to a specific agent over its stream
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PendingTaskEnvelope {
    pub delivery_id: String,
    /// Handler the agent should run (e.g. "document_fetch")
    pub kind: String,
    pub payload: Value,
}

/// Outcome an agent posts back for a delivery
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TaskResult {
    pub delivery_id: String,
    pub success: bool,
    /// Handler output on success, `{"error": ..., "reason": ...}` on failure
    pub payload: Value,
}

impl TaskResult {
    /// Human-readable error carried by an unsuccessful result
    pub fn error_message(&self) -> String {
        self.payload
            .get("error")
            .and_then(Value::as_str)
            .map(str::to_string)
            .unwrap_or_else(|| format!("agent reported failure: {}", self.payload))
    }
}

/// Snapshot of a registered agent, as exposed by `GET /agents`
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AgentInfo {
    pub agent_id: String,
    pub name: String,
    pub capabilities: Vec<String>,
    pub connected: bool,
    /// Whether a stream is currently attached
    pub streaming: bool,
    pub last_heartbeat: DateTime<Utc>,
    pub registered_at: DateTime<Utc>,
    /// Envelopes waiting to be emitted on the stream
    pub queued: usize,
}
