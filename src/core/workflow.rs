use super::task_state::TaskStatus;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

/// Kind of work a task performs; fixes its step list at creation time
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TaskType {
    /// Fetch the subject's document through an agent and store it
    Fetch,
    /// Fetch, analyze, then save the analysis
    FetchAndAnalyze,
    /// Analyze an already-fetched document, then save the analysis
    Analyze,
}

/// A single pipeline step
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StepKind {
    FetchDocument,
    AnalyzeDocument,
    SaveRecord,
}

impl TaskType {
    pub fn as_str(&self) -> &'static str {
        match self {
            TaskType::Fetch => "fetch",
            TaskType::FetchAndAnalyze => "fetch_and_analyze",
            TaskType::Analyze => "analyze",
        }
    }

    /// Ordered steps executed for this task type
    pub fn steps(&self) -> &'static [StepKind] {
        match self {
            TaskType::Fetch => &[StepKind::FetchDocument],
            TaskType::FetchAndAnalyze => &[
                StepKind::FetchDocument,
                StepKind::AnalyzeDocument,
                StepKind::SaveRecord,
            ],
            TaskType::Analyze => &[StepKind::AnalyzeDocument, StepKind::SaveRecord],
        }
    }
}

impl fmt::Display for TaskType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for TaskType {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "fetch" => Ok(TaskType::Fetch),
            "fetch_and_analyze" => Ok(TaskType::FetchAndAnalyze),
            "analyze" => Ok(TaskType::Analyze),
            other => Err(format!("unknown task type '{}'", other)),
        }
    }
}

impl StepKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            StepKind::FetchDocument => "fetch_document",
            StepKind::AnalyzeDocument => "analyze_document",
            StepKind::SaveRecord => "save_record",
        }
    }

    /// Whether the step is delegated to an agent through the broker
    pub fn is_remote(&self) -> bool {
        matches!(self, StepKind::FetchDocument)
    }

    /// Task status shown while this step runs; `None` keeps `in_progress`
    pub fn active_status(&self) -> Option<TaskStatus> {
        if self.is_remote() {
            return Some(TaskStatus::Downloading);
        }
        match self {
            StepKind::AnalyzeDocument => Some(TaskStatus::Analyzing),
            _ => None,
        }
    }
}

impl fmt::Display for StepKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for StepKind {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "fetch_document" => Ok(StepKind::FetchDocument),
            "analyze_document" => Ok(StepKind::AnalyzeDocument),
            "save_record" => Ok(StepKind::SaveRecord),
            other => Err(format!("unknown step '{}'", other)),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_fetch_and_analyze_step_order() {
        assert_eq!(
            TaskType::FetchAndAnalyze.steps(),
            &[
                StepKind::FetchDocument,
                StepKind::AnalyzeDocument,
                StepKind::SaveRecord
            ]
        );
        assert!(TaskType::Analyze.steps().iter().all(|s| !s.is_remote()));
    }

    #[test]
    fn test_active_status_per_step() {
        assert_eq!(
            StepKind::FetchDocument.active_status(),
            Some(TaskStatus::Downloading)
        );
        assert_eq!(
            StepKind::AnalyzeDocument.active_status(),
            Some(TaskStatus::Analyzing)
        );
        assert_eq!(StepKind::SaveRecord.active_status(), None);
    }

    #[test]
    fn test_task_type_parse() {
        assert_eq!("analyze".parse::<TaskType>(), Ok(TaskType::Analyze));
        assert!("scrape".parse::<TaskType>().is_err());
    }
}
