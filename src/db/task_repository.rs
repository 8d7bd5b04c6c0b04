use crate::core::{FailureReason, StepKind, StepStatus, TaskStatus, TaskType};
use crate::db::models::{Task, TaskStep};
use crate::errors::Error;
use crate::schema::{task_steps, tasks};
use chrono::{SecondsFormat, Utc};
use diesel::prelude::*;
use diesel::result::{DatabaseErrorKind, Error as DieselError};
use diesel::sqlite::SqliteConnection;
use serde_json::Value;
use uuid::Uuid;

/// Fixed-width UTC timestamp; lexicographic order equals chronological order.
pub fn now_string() -> String {
    Utc::now().to_rfc3339_opts(SecondsFormat::Micros, true)
}

/// Repository for task and task step records in the SQLite database
pub struct TaskRepository<'a> {
    /// Database connection
    pub conn: &'a mut SqliteConnection,
}

impl<'a> TaskRepository<'a> {
    pub fn new(conn: &'a mut SqliteConnection) -> Self {
        TaskRepository { conn }
    }

    /// Creates a task and its fixed step list, rejecting duplicates per subject
    ///
    /// The existence check and the insert run inside one `BEGIN IMMEDIATE`
    /// transaction, and the partial unique index on `tasks(subject_id)` backs it up,
    /// so two concurrent creations for the same subject cannot both succeed.
    ///
    /// # Errors
    ///
    /// Returns `Error::DuplicateTask` if a non-terminal task exists for `subject_id`,
    /// or an Error if database operations fail
    pub fn create_task(
        &mut self,
        subject_id: &str,
        task_type: TaskType,
        priority: i32,
        metadata: &Value,
    ) -> Result<Task, Error> {
        let metadata = serde_json::to_string(metadata)?;

        let outcome = self.conn.immediate_transaction::<_, Error, _>(|conn| {
            if let Some(existing) = find_active_task(conn, subject_id)? {
                return Err(Error::DuplicateTask {
                    subject_id: subject_id.to_string(),
                    existing_task_id: existing.id,
                });
            }

            let now = now_string();
            let task = Task {
                id: Uuid::new_v4().to_string(),
                subject_id: subject_id.to_string(),
                task_type: task_type.to_string(),
                status: TaskStatus::Pending.to_string(),
                priority,
                metadata,
                progress: 0,
                error_message: None,
                error_reason: None,
                result: None,
                created_at: now.clone(),
                updated_at: now.clone(),
                started_at: None,
                completed_at: None,
            };

            diesel::insert_into(tasks::table)
                .values(&task)
                .execute(conn)?;

            let steps: Vec<TaskStep> = task_type
                .steps()
                .iter()
                .enumerate()
                .map(|(position, step)| TaskStep {
                    task_id: task.id.clone(),
                    step_name: step.to_string(),
                    position: position as i32,
                    status: StepStatus::Pending.to_string(),
                    error_message: None,
                    result: None,
                    created_at: now.clone(),
                    started_at: None,
                    completed_at: None,
                })
                .collect();

            diesel::insert_into(task_steps::table)
                .values(&steps)
                .execute(conn)?;

            Ok(task)
        });

        match outcome {
            Err(Error::DieselError(DieselError::DatabaseError(
                DatabaseErrorKind::UniqueViolation,
                _,
            ))) => {
                let existing_task_id = self
                    .find_active_task_for_subject(subject_id)?
                    .map(|t| t.id)
                    .unwrap_or_default();
                Err(Error::DuplicateTask {
                    subject_id: subject_id.to_string(),
                    existing_task_id,
                })
            }
            other => other,
        }
    }

    /// Returns the non-terminal task for a subject, if any
    pub fn find_active_task_for_subject(&mut self, subject_id: &str) -> Result<Option<Task>, Error> {
        find_active_task(self.conn, subject_id)
    }

    pub fn get_task(&mut self, task_id: &str) -> Result<Option<Task>, Error> {
        let found = tasks::table
            .filter(tasks::id.eq(task_id))
            .first::<Task>(self.conn)
            .optional()?;
        Ok(found)
    }

    /// Returns the steps of a task in execution order
    pub fn get_steps(&mut self, task_id: &str) -> Result<Vec<TaskStep>, Error> {
        let steps = task_steps::table
            .filter(task_steps::task_id.eq(task_id))
            .order(task_steps::position.asc())
            .load::<TaskStep>(self.conn)?;
        Ok(steps)
    }

    /// Lists tasks newest first, optionally filtered by status and subject
    pub fn list_tasks(
        &mut self,
        status: Option<TaskStatus>,
        subject_id: Option<&str>,
        limit: i64,
    ) -> Result<Vec<Task>, Error> {
        let mut query = tasks::table.into_boxed();
        if let Some(status) = status {
            query = query.filter(tasks::status.eq(status.as_str()));
        }
        if let Some(subject_id) = subject_id {
            query = query.filter(tasks::subject_id.eq(subject_id.to_string()));
        }
        let found = query
            .order(tasks::created_at.desc())
            .limit(limit)
            .load::<Task>(self.conn)?;
        Ok(found)
    }

    /// Retrieves pending tasks ordered by priority (highest first), then age (oldest first)
    pub fn next_pending_tasks(&mut self, limit: i64) -> Result<Vec<Task>, Error> {
        let found = tasks::table
            .filter(tasks::status.eq(TaskStatus::Pending.as_str()))
            .order((tasks::priority.desc(), tasks::created_at.asc()))
            .limit(limit)
            .load::<Task>(self.conn)?;
        Ok(found)
    }

    pub fn count_by_status(&mut self, status: TaskStatus) -> Result<i64, Error> {
        let count = tasks::table
            .filter(tasks::status.eq(status.as_str()))
            .count()
            .get_result(self.conn)?;
        Ok(count)
    }

    /// Moves a pending task to `in_progress` and stamps `started_at`
    ///
    /// # Returns
    ///
    /// `false` if the task was no longer pending (e.g. cancelled meanwhile)
    pub fn mark_task_started(&mut self, task_id: &str) -> Result<bool, Error> {
        let now = now_string();
        let updated = diesel::update(
            tasks::table
                .filter(tasks::id.eq(task_id))
                .filter(tasks::status.eq(TaskStatus::Pending.as_str())),
        )
        .set((
            tasks::status.eq(TaskStatus::InProgress.as_str()),
            tasks::started_at.eq(&now),
            tasks::updated_at.eq(&now),
        ))
        .execute(self.conn)?;
        Ok(updated > 0)
    }

    /// Starts a step, optionally moving the task to a step-specific status
    ///
    /// Refuses to start a step while any earlier step is not completed.
    ///
    /// # Returns
    ///
    /// `false` if the task already reached a terminal status
    ///
    /// # Errors
    ///
    /// Returns `Error::StepOutOfOrder` if an earlier step is still open
    pub fn start_step(
        &mut self,
        task_id: &str,
        step: StepKind,
        task_status: Option<TaskStatus>,
    ) -> Result<bool, Error> {
        self.conn.immediate_transaction::<_, Error, _>(|conn| {
            let Some(task) = tasks::table
                .filter(tasks::id.eq(task_id))
                .first::<Task>(conn)
                .optional()?
            else {
                return Err(Error::TaskNotFound(task_id.to_string()));
            };
            if task.status()?.is_terminal() {
                return Ok(false);
            }

            let current: TaskStep = task_steps::table
                .filter(task_steps::task_id.eq(task_id))
                .filter(task_steps::step_name.eq(step.as_str()))
                .first(conn)?;

            let open_earlier: i64 = task_steps::table
                .filter(task_steps::task_id.eq(task_id))
                .filter(task_steps::position.lt(current.position))
                .filter(task_steps::status.ne(StepStatus::Completed.as_str()))
                .count()
                .get_result(conn)?;
            if open_earlier > 0 {
                return Err(Error::StepOutOfOrder {
                    task_id: task_id.to_string(),
                    step: step.to_string(),
                });
            }

            let now = now_string();
            diesel::update(
                task_steps::table
                    .filter(task_steps::task_id.eq(task_id))
                    .filter(task_steps::step_name.eq(step.as_str())),
            )
            .set((
                task_steps::status.eq(StepStatus::InProgress.as_str()),
                task_steps::started_at.eq(&now),
            ))
            .execute(conn)?;

            if let Some(status) = task_status {
                diesel::update(tasks::table.filter(tasks::id.eq(task_id)))
                    .set((tasks::status.eq(status.as_str()), tasks::updated_at.eq(&now)))
                    .execute(conn)?;
            }
            Ok(true)
        })
    }

    /// Marks a step completed with its result and advances the task's progress
    pub fn complete_step(
        &mut self,
        task_id: &str,
        step: StepKind,
        result: &Value,
        progress: i32,
    ) -> Result<(), Error> {
        let result = serde_json::to_string(result)?;
        self.conn.immediate_transaction::<_, Error, _>(|conn| {
            let now = now_string();
            diesel::update(
                task_steps::table
                    .filter(task_steps::task_id.eq(task_id))
                    .filter(task_steps::step_name.eq(step.as_str())),
            )
            .set((
                task_steps::status.eq(StepStatus::Completed.as_str()),
                task_steps::result.eq(Some(result)),
                task_steps::completed_at.eq(&now),
            ))
            .execute(conn)?;

            diesel::update(
                tasks::table
                    .filter(tasks::id.eq(task_id))
                    .filter(tasks::status.eq_any(TaskStatus::non_terminal_strs())),
            )
            .set((
                tasks::progress.eq(progress.clamp(0, 100)),
                tasks::updated_at.eq(&now),
            ))
            .execute(conn)?;
            Ok(())
        })
    }

    /// Fails a task, recording the message on the failing step and skipping the rest
    ///
    /// # Returns
    ///
    /// `false` if the task was already terminal (e.g. cancelled); nothing is changed
    pub fn fail_task(
        &mut self,
        task_id: &str,
        step: Option<StepKind>,
        message: &str,
        reason: FailureReason,
    ) -> Result<bool, Error> {
        self.conn.immediate_transaction::<_, Error, _>(|conn| {
            let now = now_string();
            let updated = diesel::update(
                tasks::table
                    .filter(tasks::id.eq(task_id))
                    .filter(tasks::status.eq_any(TaskStatus::non_terminal_strs())),
            )
            .set((
                tasks::status.eq(TaskStatus::Failed.as_str()),
                tasks::error_message.eq(Some(message)),
                tasks::error_reason.eq(Some(reason.as_str())),
                tasks::completed_at.eq(&now),
                tasks::updated_at.eq(&now),
            ))
            .execute(conn)?;
            if updated == 0 {
                return Ok(false);
            }

            if let Some(step) = step {
                diesel::update(
                    task_steps::table
                        .filter(task_steps::task_id.eq(task_id))
                        .filter(task_steps::step_name.eq(step.as_str())),
                )
                .set((
                    task_steps::status.eq(StepStatus::Failed.as_str()),
                    task_steps::error_message.eq(Some(message)),
                    task_steps::completed_at.eq(&now),
                ))
                .execute(conn)?;
            }
            skip_open_steps(conn, task_id)?;
            Ok(true)
        })
    }

    /// Marks a task completed with its final result
    pub fn complete_task(&mut self, task_id: &str, result: &Value) -> Result<bool, Error> {
        let result = serde_json::to_string(result)?;
        let now = now_string();
        let updated = diesel::update(
            tasks::table
                .filter(tasks::id.eq(task_id))
                .filter(tasks::status.eq_any(TaskStatus::non_terminal_strs())),
        )
        .set((
            tasks::status.eq(TaskStatus::Completed.as_str()),
            tasks::progress.eq(100),
            tasks::result.eq(Some(result)),
            tasks::completed_at.eq(&now),
            tasks::updated_at.eq(&now),
        ))
        .execute(self.conn)?;
        Ok(updated > 0)
    }

    /// Flags a task cancelled. Steps already running elsewhere are not interrupted.
    ///
    /// # Returns
    ///
    /// `true` if the task was cancelled by this call, `false` if it was already terminal
    ///
    /// # Errors
    ///
    /// Returns `Error::TaskNotFound` if no task has this id
    pub fn cancel_task(&mut self, task_id: &str) -> Result<bool, Error> {
        self.conn.immediate_transaction::<_, Error, _>(|conn| {
            let exists: i64 = tasks::table
                .filter(tasks::id.eq(task_id))
                .count()
                .get_result(conn)?;
            if exists == 0 {
                return Err(Error::TaskNotFound(task_id.to_string()));
            }

            let now = now_string();
            let updated = diesel::update(
                tasks::table
                    .filter(tasks::id.eq(task_id))
                    .filter(tasks::status.eq_any(TaskStatus::non_terminal_strs())),
            )
            .set((
                tasks::status.eq(TaskStatus::Cancelled.as_str()),
                tasks::completed_at.eq(&now),
                tasks::updated_at.eq(&now),
            ))
            .execute(conn)?;
            if updated > 0 {
                skip_open_steps(conn, task_id)?;
            }
            Ok(updated > 0)
        })
    }

    /// Current status of a task, read fresh from the database
    pub fn get_status(&mut self, task_id: &str) -> Result<TaskStatus, Error> {
        let status: String = tasks::table
            .filter(tasks::id.eq(task_id))
            .select(tasks::status)
            .first(self.conn)
            .optional()?
            .ok_or_else(|| Error::TaskNotFound(task_id.to_string()))?;
        status.parse().map_err(Error::CorruptRecord)
    }
}

fn find_active_task(conn: &mut SqliteConnection, subject_id: &str) -> Result<Option<Task>, Error> {
    let found = tasks::table
        .filter(tasks::subject_id.eq(subject_id))
        .filter(tasks::status.eq_any(TaskStatus::non_terminal_strs()))
        .first::<Task>(conn)
        .optional()?;
    Ok(found)
}

/// Steps still pending or in progress will never finish once the task is terminal.
fn skip_open_steps(conn: &mut SqliteConnection, task_id: &str) -> Result<(), Error> {
    diesel::update(
        task_steps::table
            .filter(task_steps::task_id.eq(task_id))
            .filter(task_steps::status.eq_any(vec![
                StepStatus::Pending.as_str(),
                StepStatus::InProgress.as_str(),
            ])),
    )
    .set(task_steps::status.eq(StepStatus::Skipped.as_str()))
    .execute(conn)?;
    Ok(())
}
