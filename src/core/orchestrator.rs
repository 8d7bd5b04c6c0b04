//! Background driver that turns pending tasks into finished ones
//!
//! One orchestrator runs per server. Each poll it takes pending tasks in
//! `(priority desc, created_at asc)` order and runs their steps one after the
//! other. Remote steps go through the broker and block on the result with a
//! bounded timeout; local steps run inline. Cancellation is a status flag
//! checked between steps.

use crate::broker::{BrokerError, TaskBroker};
use crate::config::OrchestratorConfig;
use crate::constants::{DOCUMENT_FETCH_KIND, ORCHESTRATOR_BATCH_SIZE};
use crate::core::analyzer::Analyzer;
use crate::core::{FailureReason, StepKind, TaskStatus};
use crate::db::{Database, DocumentRepository, Task, TaskRepository};
use crate::errors::Error;
use serde_json::{json, Map, Value};
use std::sync::Arc;
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

/// Why a step failed, as recorded on the task
#[derive(Debug)]
struct StepFailure {
    reason: FailureReason,
    message: String,
}

impl StepFailure {
    fn new(reason: FailureReason, message: impl Into<String>) -> Self {
        Self {
            reason,
            message: message.into(),
        }
    }
}

/// Values passed from one step to the next
#[derive(Debug, Default)]
struct PipelineContext {
    analysis: Option<Value>,
    results: Map<String, Value>,
}

#[derive(Debug)]
pub struct Orchestrator {
    database: Database,
    broker: Arc<TaskBroker>,
    analyzer: Arc<dyn Analyzer>,
    config: OrchestratorConfig,
    cancel: CancellationToken,
}

impl Orchestrator {
    pub fn new(
        database: Database,
        broker: Arc<TaskBroker>,
        analyzer: Arc<dyn Analyzer>,
        config: OrchestratorConfig,
        cancel: CancellationToken,
    ) -> Self {
        Self {
            database,
            broker,
            analyzer,
            config,
            cancel,
        }
    }

    /// Polls the task store every `poll_interval` until shutdown
    pub async fn run(self) {
        match self.recover_interrupted() {
            Ok(0) => {}
            Ok(n) => warn!("Marked {} interrupted task(s) as failed", n),
            Err(e) => error!("Error recovering interrupted tasks: {}", e),
        }

        info!("Orchestrator started");
        let mut interval = tokio::time::interval(self.config.poll_interval);
        interval.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                _ = self.cancel.cancelled() => break,
                _ = interval.tick() => {
                    match self.run_once().await {
                        Ok(0) => {}
                        Ok(n) => debug!("Processed {} task(s)", n),
                        Err(e) => error!("Error polling pending tasks: {}", e),
                    }
                }
            }
        }
        info!("Orchestrator stopped");
    }

    /// Fails tasks left mid-pipeline by a previous process
    ///
    /// Broker state does not survive a restart, so their remote results can
    /// never arrive.
    pub fn recover_interrupted(&self) -> Result<usize, Error> {
        let mut conn = self.database.get_conn()?;
        let mut repo = TaskRepository::new(&mut conn);
        let mut recovered = 0;
        for status in [
            TaskStatus::InProgress,
            TaskStatus::Downloading,
            TaskStatus::Analyzing,
        ] {
            for task in repo.list_tasks(Some(status), None, i64::MAX)? {
                if repo.fail_task(
                    &task.id,
                    None,
                    "interrupted by a server restart",
                    FailureReason::Interrupted,
                )? {
                    recovered += 1;
                }
            }
        }
        Ok(recovered)
    }

    /// Runs every currently pending task to a terminal status
    ///
    /// # Returns
    ///
    /// The number of tasks this call picked up
    pub async fn run_once(&self) -> Result<usize, Error> {
        let pending = {
            let mut conn = self.database.get_conn()?;
            TaskRepository::new(&mut conn).next_pending_tasks(ORCHESTRATOR_BATCH_SIZE)?
        };

        let mut processed = 0;
        for task in pending {
            if self.cancel.is_cancelled() {
                break;
            }
            let task_id = task.id.clone();
            match self.process_task(task).await {
                Ok(true) => processed += 1,
                Ok(false) => {}
                Err(e) => {
                    processed += 1;
                    error!(%task_id, "Error processing task: {}", e);
                    self.record_failure(
                        &task_id,
                        None,
                        &StepFailure::new(FailureReason::LocalError, e.to_string()),
                    );
                }
            }
        }
        Ok(processed)
    }

    /// Runs one task through its steps
    ///
    /// # Returns
    ///
    /// `false` if the task was no longer pending when picked up
    async fn process_task(&self, task: Task) -> Result<bool, Error> {
        let task_type = task.task_type()?;
        {
            let mut conn = self.database.get_conn()?;
            if !TaskRepository::new(&mut conn).mark_task_started(&task.id)? {
                debug!(task_id = %task.id, "Task no longer pending, skipping");
                return Ok(false);
            }
        }
        info!(task_id = %task.id, subject_id = %task.subject_id, %task_type, "Task started");

        let steps = task_type.steps();
        let mut context = PipelineContext::default();

        for (index, step) in steps.iter().copied().enumerate() {
            {
                let mut conn = self.database.get_conn()?;
                let mut repo = TaskRepository::new(&mut conn);
                if !repo.start_step(&task.id, step, step.active_status())? {
                    info!(task_id = %task.id, %step, "Task cancelled, stopping before step");
                    return Ok(true);
                }
            }
            debug!(task_id = %task.id, %step, remote = step.is_remote(), "Step started");

            let outcome = match step {
                StepKind::FetchDocument => self.fetch_document(&task).await,
                StepKind::AnalyzeDocument => self.analyze_document(&task, &mut context),
                StepKind::SaveRecord => self.save_record(&task, &context),
            };

            let mut conn = self.database.get_conn()?;
            let mut repo = TaskRepository::new(&mut conn);
            if repo.get_status(&task.id)?.is_terminal() {
                info!(task_id = %task.id, %step, "Task cancelled while step was running");
                return Ok(true);
            }

            match outcome {
                Ok(result) => {
                    let progress = ((index + 1) * 100 / steps.len()) as i32;
                    repo.complete_step(&task.id, step, &result, progress)?;
                    context.results.insert(step.to_string(), result);
                    debug!(task_id = %task.id, %step, progress, "Step completed");
                }
                Err(failure) => {
                    warn!(
                        task_id = %task.id,
                        %step,
                        reason = %failure.reason,
                        "Step failed: {}", failure.message
                    );
                    repo.fail_task(&task.id, Some(step), &failure.message, failure.reason)?;
                    return Ok(true);
                }
            }
        }

        let mut conn = self.database.get_conn()?;
        TaskRepository::new(&mut conn).complete_task(&task.id, &Value::Object(context.results))?;
        info!(task_id = %task.id, "Task completed");
        Ok(true)
    }

    /// Fetch step: reuse a stored document, otherwise delegate to an agent
    async fn fetch_document(&self, task: &Task) -> Result<Value, StepFailure> {
        let local = |e: Error| StepFailure::new(FailureReason::LocalError, e.to_string());

        let existing = {
            let mut conn = self.database.get_conn().map_err(local)?;
            DocumentRepository::new(&mut conn)
                .get(&task.subject_id)
                .map_err(local)?
        };
        if let Some(document) = existing {
            debug!(task_id = %task.id, "Document already stored, skipping remote fetch");
            return Ok(json!({
                "cached": true,
                "source_url": document.source_url,
                "content_type": document.content_type,
                "bytes": document.content.len(),
                "fetched_at": document.fetched_at,
            }));
        }

        let mut payload = match task.metadata_value() {
            Value::Object(map) => map,
            _ => Map::new(),
        };
        payload.insert("subject_id".to_string(), json!(task.subject_id));

        let delivery_id = self
            .broker
            .submit_task(
                DOCUMENT_FETCH_KIND,
                Value::Object(payload),
                &self.config.fetch_capability,
            )
            .map_err(|e| match e {
                BrokerError::NoCapableAgent(_) => {
                    StepFailure::new(FailureReason::NoCapableAgent, e.to_string())
                }
            })?;
        debug!(task_id = %task.id, %delivery_id, "Fetch delegated to agent");

        let waited = tokio::select! {
            _ = self.cancel.cancelled() => {
                return Err(StepFailure::new(
                    FailureReason::Interrupted,
                    "server shut down while waiting for the agent",
                ));
            }
            result = self.broker.await_result(&delivery_id, self.config.remote_step_timeout) => result,
        };
        let result = waited.ok_or_else(|| {
            StepFailure::new(
                FailureReason::Timeout,
                format!(
                    "no result from agent within {}",
                    humantime::format_duration(self.config.remote_step_timeout)
                ),
            )
        })?;
        if !result.success {
            return Err(StepFailure::new(
                FailureReason::RemoteError,
                result.error_message(),
            ));
        }

        let content = result
            .payload
            .get("content")
            .and_then(Value::as_str)
            .ok_or_else(|| {
                StepFailure::new(FailureReason::RemoteError, "agent result has no 'content'")
            })?;
        let source_url = result.payload.get("url").and_then(Value::as_str);
        let content_type = result.payload.get("content_type").and_then(Value::as_str);

        let document = {
            let mut conn = self.database.get_conn().map_err(local)?;
            DocumentRepository::new(&mut conn)
                .upsert_content(&task.subject_id, source_url, content_type, content)
                .map_err(local)?
        };
        Ok(json!({
            "cached": false,
            "delivery_id": delivery_id,
            "source_url": document.source_url,
            "content_type": document.content_type,
            "bytes": document.content.len(),
            "fetched_at": document.fetched_at,
        }))
    }

    fn analyze_document(
        &self,
        task: &Task,
        context: &mut PipelineContext,
    ) -> Result<Value, StepFailure> {
        let document = {
            let mut conn = self
                .database
                .get_conn()
                .map_err(|e| StepFailure::new(FailureReason::LocalError, e.to_string()))?;
            DocumentRepository::new(&mut conn)
                .get(&task.subject_id)
                .map_err(|e| StepFailure::new(FailureReason::LocalError, e.to_string()))?
        }
        .ok_or_else(|| {
            StepFailure::new(
                FailureReason::MissingDocument,
                format!("no fetched document for subject {}", task.subject_id),
            )
        })?;

        let analysis = self
            .analyzer
            .analyze(&document)
            .map_err(|e| StepFailure::new(FailureReason::LocalError, e.to_string()))?;
        context.analysis = Some(analysis.clone());
        Ok(analysis)
    }

    fn save_record(&self, task: &Task, context: &PipelineContext) -> Result<Value, StepFailure> {
        let local = |e: Error| StepFailure::new(FailureReason::LocalError, e.to_string());
        let analysis = context.analysis.as_ref().ok_or_else(|| {
            StepFailure::new(FailureReason::LocalError, "nothing to save: no analysis")
        })?;

        let mut conn = self.database.get_conn().map_err(local)?;
        let saved = DocumentRepository::new(&mut conn)
            .save_analysis(&task.subject_id, analysis)
            .map_err(local)?;
        if !saved {
            return Err(StepFailure::new(
                FailureReason::MissingDocument,
                format!("document for subject {} disappeared", task.subject_id),
            ));
        }
        Ok(json!({ "saved": true }))
    }

    fn record_failure(&self, task_id: &str, step: Option<StepKind>, failure: &StepFailure) {
        let recorded = self.database.get_conn().and_then(|mut conn| {
            TaskRepository::new(&mut conn).fail_task(task_id, step, &failure.message, failure.reason)
        });
        if let Err(e) = recorded {
            error!(task_id, "Could not record task failure: {}", e);
        }
    }
}
