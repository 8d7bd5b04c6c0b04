use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

/// Lifecycle status of a task
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TaskStatus {
    /// Created and waiting for the orchestrator to pick it up
    Pending,
    /// Picked up by the orchestrator
    InProgress,
    /// A remote fetch step is running on an agent
    Downloading,
    /// The local analysis step is running
    Analyzing,
    /// Every step finished successfully
    Completed,
    /// A step failed; see `error_message` and `error_reason`
    Failed,
    /// Cancelled by a caller; steps already running on an agent are not interrupted
    Cancelled,
}

impl TaskStatus {
    /// Statuses that block creation of another task for the same subject.
    pub const NON_TERMINAL: [TaskStatus; 4] = [
        TaskStatus::Pending,
        TaskStatus::InProgress,
        TaskStatus::Downloading,
        TaskStatus::Analyzing,
    ];

    pub const TERMINAL: [TaskStatus; 3] = [
        TaskStatus::Completed,
        TaskStatus::Failed,
        TaskStatus::Cancelled,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            TaskStatus::Pending => "pending",
            TaskStatus::InProgress => "in_progress",
            TaskStatus::Downloading => "downloading",
            TaskStatus::Analyzing => "analyzing",
            TaskStatus::Completed => "completed",
            TaskStatus::Failed => "failed",
            TaskStatus::Cancelled => "cancelled",
        }
    }

    pub fn is_terminal(&self) -> bool {
        Self::TERMINAL.contains(self)
    }

    /// String forms of [`TaskStatus::NON_TERMINAL`], for SQL filters.
    pub fn non_terminal_strs() -> Vec<&'static str> {
        Self::NON_TERMINAL.iter().map(|s| s.as_str()).collect()
    }
}

impl fmt::Display for TaskStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for TaskStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "pending" => Ok(TaskStatus::Pending),
            "in_progress" => Ok(TaskStatus::InProgress),
            "downloading" => Ok(TaskStatus::Downloading),
            "analyzing" => Ok(TaskStatus::Analyzing),
            "completed" => Ok(TaskStatus::Completed),
            "failed" => Ok(TaskStatus::Failed),
            "cancelled" => Ok(TaskStatus::Cancelled),
            other => Err(format!("unknown task status '{}'", other)),
        }
    }
}

/// Status of a single step inside a task
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StepStatus {
    Pending,
    InProgress,
    Completed,
    Failed,
    /// Never ran because an earlier step failed or the task was cancelled
    Skipped,
}

impl StepStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            StepStatus::Pending => "pending",
            StepStatus::InProgress => "in_progress",
            StepStatus::Completed => "completed",
            StepStatus::Failed => "failed",
            StepStatus::Skipped => "skipped",
        }
    }
}

impl fmt::Display for StepStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for StepStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "pending" => Ok(StepStatus::Pending),
            "in_progress" => Ok(StepStatus::InProgress),
            "completed" => Ok(StepStatus::Completed),
            "failed" => Ok(StepStatus::Failed),
            "skipped" => Ok(StepStatus::Skipped),
            other => Err(format!("unknown step status '{}'", other)),
        }
    }
}

/// Machine-readable reason recorded next to a task's human-readable error message
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FailureReason {
    /// No connected agent advertises the capability a remote step needs
    NoCapableAgent,
    /// The agent did not post a result within the remote step timeout
    Timeout,
    /// The agent reported a failure (e.g. the document is access-restricted)
    RemoteError,
    /// An analyze-only task found no fetched document for its subject
    MissingDocument,
    /// A local step (analysis, persistence) failed
    LocalError,
    /// The orchestrator stopped while the task was running
    Interrupted,
}

impl FailureReason {
    pub fn as_str(&self) -> &'static str {
        match self {
            FailureReason::NoCapableAgent => "no_capable_agent",
            FailureReason::Timeout => "timeout",
            FailureReason::RemoteError => "remote_error",
            FailureReason::MissingDocument => "missing_document",
            FailureReason::LocalError => "local_error",
            FailureReason::Interrupted => "interrupted",
        }
    }
}

impl fmt::Display for FailureReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_status_round_trips_through_storage_form() {
        for status in TaskStatus::NON_TERMINAL
            .iter()
            .chain(TaskStatus::TERMINAL.iter())
        {
            assert_eq!(status.as_str().parse::<TaskStatus>().unwrap(), *status);
        }
        assert!("In Progress".parse::<TaskStatus>().is_err());
    }

    #[test]
    fn test_terminal_partition() {
        assert!(!TaskStatus::Downloading.is_terminal());
        assert!(TaskStatus::Cancelled.is_terminal());
        assert_eq!(
            TaskStatus::non_terminal_strs(),
            vec!["pending", "in_progress", "downloading", "analyzing"]
        );
    }

    #[test]
    fn test_serde_uses_snake_case() {
        let json = serde_json::to_string(&TaskStatus::InProgress).unwrap();
        assert_eq!(json, "\"in_progress\"");
        let reason = serde_json::to_string(&FailureReason::NoCapableAgent).unwrap();
        assert_eq!(reason, "\"no_capable_agent\"");
    }
}
