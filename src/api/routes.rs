//! API routes configuration module

use crate::api::agents::{agent_heartbeat, agent_stream, list_agents, register_agent};
use crate::api::handlers::{cancel_task, create_task, get_task, health, list_tasks, submit_result};
use crate::api::state::AppState;
use axum::{
    routing::{get, post},
    Extension, Router,
};
use tower_http::trace::TraceLayer;

/// Creates the API router with every endpoint and the shared state
pub fn app(state: AppState) -> Router {
    Router::new()
        .route("/health", get(health))
        .route("/agents", get(list_agents))
        .route("/agents/register", post(register_agent))
        .route("/agents/:agent_id/stream", get(agent_stream))
        .route("/agents/:agent_id/heartbeat", post(agent_heartbeat))
        .route("/tasks", post(create_task).get(list_tasks))
        .route("/tasks/:id", get(get_task))
        .route("/tasks/:id/cancel", post(cancel_task))
        .route("/tasks/deliveries/:delivery_id/result", post(submit_result))
        .layer(TraceLayer::new_for_http())
        .layer(Extension(state))
}
