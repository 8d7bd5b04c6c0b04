use crate::api::errors::{api_error, ApiError};
use crate::api::state::AppState;
use crate::api::types::{
    Ack, CreateTaskRequest, CreateTaskResponse, HealthResponse, ListTasksQuery,
    SubmitResultRequest, TaskView,
};
use crate::constants::{DEFAULT_TASK_LIST_LIMIT, MAX_TASK_LIST_LIMIT};
use crate::core::TaskStatus;
use crate::db::TaskRepository;
use axum::http::StatusCode;
use axum::{
    extract::{Extension, Path, Query},
    Json,
};
use serde_json::Value;
use tracing::info;

/// Creates a task for a subject
///
/// Rejected with 409 while another non-terminal task exists for the same subject.
#[axum::debug_handler]
pub async fn create_task(
    Extension(state): Extension<AppState>,
    Json(payload): Json<CreateTaskRequest>,
) -> Result<(StatusCode, Json<CreateTaskResponse>), ApiError> {
    let subject_id = payload.subject_id.trim();
    if subject_id.is_empty() {
        return Err(api_error(
            StatusCode::UNPROCESSABLE_ENTITY,
            "subject_id must not be empty",
        ));
    }
    let metadata = payload
        .metadata
        .unwrap_or_else(|| Value::Object(Default::default()));
    if !metadata.is_object() {
        return Err(api_error(
            StatusCode::UNPROCESSABLE_ENTITY,
            "metadata must be a JSON object",
        ));
    }

    let mut conn = state.database.get_conn()?;
    let task = TaskRepository::new(&mut conn).create_task(
        subject_id,
        payload.task_type,
        payload.priority,
        &metadata,
    )?;
    info!(task_id = %task.id, subject_id, task_type = %task.task_type, "Task created");

    Ok((
        StatusCode::CREATED,
        Json(CreateTaskResponse { task_id: task.id }),
    ))
}

/// Retrieves a task with its steps in execution order
#[axum::debug_handler]
pub async fn get_task(
    Path(id): Path<String>,
    Extension(state): Extension<AppState>,
) -> Result<Json<TaskView>, ApiError> {
    let mut conn = state.database.get_conn()?;
    let mut repo = TaskRepository::new(&mut conn);

    let task = repo
        .get_task(&id)?
        .ok_or_else(|| api_error(StatusCode::NOT_FOUND, "Task not found"))?;
    let steps = repo.get_steps(&id)?;
    Ok(Json(TaskView::new(task, Some(steps))))
}

/// Lists tasks, newest first
#[axum::debug_handler]
pub async fn list_tasks(
    Query(query): Query<ListTasksQuery>,
    Extension(state): Extension<AppState>,
) -> Result<Json<Vec<TaskView>>, ApiError> {
    let status = query
        .status
        .as_deref()
        .map(str::parse::<TaskStatus>)
        .transpose()
        .map_err(|e| api_error(StatusCode::UNPROCESSABLE_ENTITY, &e))?;
    let limit = query
        .limit
        .unwrap_or(DEFAULT_TASK_LIST_LIMIT)
        .clamp(1, MAX_TASK_LIST_LIMIT);

    let mut conn = state.database.get_conn()?;
    let tasks =
        TaskRepository::new(&mut conn).list_tasks(status, query.subject_id.as_deref(), limit)?;
    Ok(Json(
        tasks
            .into_iter()
            .map(|task| TaskView::new(task, None))
            .collect(),
    ))
}

/// Flags a task cancelled; `ok` is false if it had already finished
#[axum::debug_handler]
pub async fn cancel_task(
    Path(id): Path<String>,
    Extension(state): Extension<AppState>,
) -> Result<Json<Ack>, ApiError> {
    let mut conn = state.database.get_conn()?;
    let cancelled = TaskRepository::new(&mut conn).cancel_task(&id)?;
    if cancelled {
        info!(task_id = %id, "Task cancelled");
    }
    Ok(Json(Ack { ok: cancelled }))
}

/// Receives an agent's result for a delivery
///
/// `ok` is false when nobody waits for the delivery anymore; the result is dropped.
#[axum::debug_handler]
pub async fn submit_result(
    Path(delivery_id): Path<String>,
    Extension(state): Extension<AppState>,
    Json(body): Json<SubmitResultRequest>,
) -> Json<Ack> {
    let ok = state
        .broker
        .submit_result(&delivery_id, body.payload, body.success);
    Json(Ack { ok })
}

#[axum::debug_handler]
pub async fn health(Extension(state): Extension<AppState>) -> Result<Json<HealthResponse>, ApiError> {
    let pending_tasks = state
        .database
        .get_conn()
        .and_then(|mut conn| TaskRepository::new(&mut conn).count_by_status(TaskStatus::Pending))
        .map_err(|e| api_error(StatusCode::SERVICE_UNAVAILABLE, &e.to_string()))?;
    Ok(Json(HealthResponse {
        ok: true,
        agents: state.broker.agents().len(),
        pending_tasks,
    }))
}
