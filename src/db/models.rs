use crate::core::{StepStatus, TaskStatus, TaskType};
use crate::errors::Error;
use crate::schema::{documents, task_steps, tasks};
use diesel::{Identifiable, Insertable, Queryable, Selectable};
use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Represents a task in the database
#[derive(
    Debug,
    Clone,
    Serialize,
    Deserialize,
    Queryable,
    Selectable,
    Identifiable,
    Insertable,
)]
#[diesel(table_name = tasks)]
pub struct Task {
    /// Unique identifier for the task
    pub id: String,
    /// Domain entity being processed (e.g. a paper id)
    pub subject_id: String,
    /// Storage form of [`TaskType`]
    pub task_type: String,
    /// Storage form of [`TaskStatus`]
    pub status: String,
    /// Higher runs first
    pub priority: i32,
    /// JSON object specific to `task_type`
    pub metadata: String,
    /// 0 to 100
    pub progress: i32,
    /// Human-readable failure description
    pub error_message: Option<String>,
    /// Machine-readable failure reason
    pub error_reason: Option<String>,
    /// JSON serialized task result
    pub result: Option<String>,
    pub created_at: String,
    pub updated_at: String,
    pub started_at: Option<String>,
    pub completed_at: Option<String>,
}

impl Task {
    pub fn status(&self) -> Result<TaskStatus, Error> {
        self.status.parse().map_err(Error::CorruptRecord)
    }

    pub fn task_type(&self) -> Result<TaskType, Error> {
        self.task_type.parse().map_err(Error::CorruptRecord)
    }

    pub fn metadata_value(&self) -> Value {
        serde_json::from_str(&self.metadata).unwrap_or(Value::Null)
    }
}

/// One ordered step of a task
#[derive(
    Debug, Clone, Serialize, Deserialize, Queryable, Selectable, Identifiable, Insertable,
)]
#[diesel(table_name = task_steps, primary_key(task_id, step_name))]
pub struct TaskStep {
    pub task_id: String,
    pub step_name: String,
    /// Zero-based execution order
    pub position: i32,
    pub status: String,
    pub error_message: Option<String>,
    /// JSON serialized step result
    pub result: Option<String>,
    pub created_at: String,
    pub started_at: Option<String>,
    pub completed_at: Option<String>,
}

impl TaskStep {
    pub fn status(&self) -> Result<StepStatus, Error> {
        self.status.parse().map_err(Error::CorruptRecord)
    }
}

/// Materialized fetch result for a subject, plus its analysis once available
#[derive(Debug, Clone, Serialize, Deserialize, Queryable, Selectable, Insertable)]
#[diesel(table_name = documents)]
pub struct Document {
    pub subject_id: String,
    pub source_url: Option<String>,
    pub content_type: Option<String>,
    pub content: String,
    pub fetched_at: String,
    /// JSON serialized analysis
    pub analysis: Option<String>,
    pub analyzed_at: Option<String>,
}
