use diesel::result::Error as DieselError;

#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("Diesel error: {0}")]
    DieselError(#[from] DieselError),
    #[error("Connection pool error: {0}")]
    PoolError(#[from] r2d2::Error),
    #[error("Serde error: {0}")]
    SerdeError(#[from] serde_json::Error),
    #[error("A non-terminal task {existing_task_id} already exists for subject {subject_id}")]
    DuplicateTask {
        subject_id: String,
        existing_task_id: String,
    },
    #[error("Task {0} not found")]
    TaskNotFound(String),
    #[error("Step {step} of task {task_id} cannot start before earlier steps complete")]
    StepOutOfOrder { task_id: String, step: String },
    #[error("Corrupt record: {0}")]
    CorruptRecord(String),
    #[error(transparent)]
    Config(#[from] crate::config::ConfigError),
}
