use crate::broker::PendingTaskEnvelope;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Events sent from the broker to an agent over its stream
///
/// On the wire each event is one SSE message whose `event` field is
/// [`StreamEvent::event_name`] and whose `data` is this enum as tagged JSON.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum StreamEvent {
    /// First event of every stream
    Connected { agent_id: String },

    /// One unit of work for the agent
    Task(PendingTaskEnvelope),

    /// Keeps intermediaries from timing out an idle connection
    Heartbeat { timestamp: DateTime<Utc> },

    /// The stream is being closed because the agent lost its registration,
    /// either removed or taken over by a newer stream; the agent backs off
    /// and registers again
    Error { message: String },

    /// The broker ended the stream normally (iteration ceiling reached)
    Disconnect { reason: String },
}

impl StreamEvent {
    pub fn event_name(&self) -> &'static str {
        match self {
            StreamEvent::Connected { .. } => "connected",
            StreamEvent::Task(_) => "task",
            StreamEvent::Heartbeat { .. } => "heartbeat",
            StreamEvent::Error { .. } => "error",
            StreamEvent::Disconnect { .. } => "disconnect",
        }
    }

    /// Whether the broker closes the stream right after this event
    pub fn is_final(&self) -> bool {
        matches!(self, StreamEvent::Error { .. } | StreamEvent::Disconnect { .. })
    }
}
