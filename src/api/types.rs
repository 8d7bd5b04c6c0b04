//! Request and response bodies shared by the HTTP API and the agent client

use crate::core::TaskType;
use crate::db::{Task, TaskStep};
use serde::{Deserialize, Serialize};
use serde_json::Value;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RegisterAgentRequest {
    pub agent_id: String,
    pub name: String,
    #[serde(default)]
    pub capabilities: Vec<String>,
}

/// `{ "ok": true }` style acknowledgement
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
pub struct Ack {
    pub ok: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SubmitResultRequest {
    pub success: bool,
    #[serde(default)]
    pub payload: Value,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CreateTaskRequest {
    pub subject_id: String,
    pub task_type: TaskType,
    #[serde(default)]
    pub priority: i32,
    /// Task-type specific input, e.g. `{"url": ...}` for fetches
    #[serde(default)]
    pub metadata: Option<Value>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CreateTaskResponse {
    pub task_id: String,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct ListTasksQuery {
    pub status: Option<String>,
    pub subject_id: Option<String>,
    pub limit: Option<i64>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HealthResponse {
    pub ok: bool,
    pub agents: usize,
    pub pending_tasks: i64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StepView {
    pub step_name: String,
    pub status: String,
    pub error_message: Option<String>,
    pub result: Option<Value>,
    pub created_at: String,
    pub started_at: Option<String>,
    pub completed_at: Option<String>,
}

/// A task as returned by the API, with JSON columns decoded
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TaskView {
    pub id: String,
    pub subject_id: String,
    pub task_type: String,
    pub status: String,
    pub priority: i32,
    pub metadata: Value,
    pub progress: i32,
    pub error_message: Option<String>,
    pub error_reason: Option<String>,
    pub result: Option<Value>,
    pub created_at: String,
    pub updated_at: String,
    pub started_at: Option<String>,
    pub completed_at: Option<String>,
    /// Present on single-task lookups
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub steps: Option<Vec<StepView>>,
}

fn decode(raw: Option<String>) -> Option<Value> {
    raw.map(|text| serde_json::from_str(&text).unwrap_or(Value::String(text)))
}

impl From<TaskStep> for StepView {
    fn from(step: TaskStep) -> Self {
        StepView {
            step_name: step.step_name,
            status: step.status,
            error_message: step.error_message,
            result: decode(step.result),
            created_at: step.created_at,
            started_at: step.started_at,
            completed_at: step.completed_at,
        }
    }
}

impl TaskView {
    pub fn new(task: Task, steps: Option<Vec<TaskStep>>) -> Self {
        let metadata = task.metadata_value();
        TaskView {
            id: task.id,
            subject_id: task.subject_id,
            task_type: task.task_type,
            status: task.status,
            priority: task.priority,
            metadata,
            progress: task.progress,
            error_message: task.error_message,
            error_reason: task.error_reason,
            result: decode(task.result),
            created_at: task.created_at,
            updated_at: task.updated_at,
            started_at: task.started_at,
            completed_at: task.completed_at,
            steps: steps.map(|steps| steps.into_iter().map(StepView::from).collect()),
        }
    }
}
