use crate::api::errors::{api_error, ApiError};
use crate::api::state::AppState;
use crate::api::types::{Ack, RegisterAgentRequest};
use crate::broker::AgentInfo;
use crate::event::StreamEvent;
use axum::http::StatusCode;
use axum::response::sse::{Event, KeepAlive, Sse};
use axum::{
    extract::{Extension, Path},
    Json,
};
use futures::{Stream, StreamExt};
use std::convert::Infallible;
use std::time::Duration;
use tracing::warn;

/// Agent ids are used verbatim in the stream and heartbeat paths
fn check_agent_id(agent_id: &str) -> Result<(), ApiError> {
    if agent_id.is_empty() {
        return Err(api_error(
            StatusCode::UNPROCESSABLE_ENTITY,
            "agent_id must not be empty",
        ));
    }
    if agent_id.trim() != agent_id {
        return Err(api_error(
            StatusCode::UNPROCESSABLE_ENTITY,
            "agent_id must not have leading or trailing whitespace",
        ));
    }
    Ok(())
}

/// Registers (or re-registers) an agent
#[axum::debug_handler]
pub async fn register_agent(
    Extension(state): Extension<AppState>,
    Json(body): Json<RegisterAgentRequest>,
) -> Result<Json<Ack>, ApiError> {
    check_agent_id(&body.agent_id)?;
    state
        .broker
        .register(&body.agent_id, &body.name, &body.capabilities);
    Ok(Json(Ack { ok: true }))
}

fn to_sse(event: StreamEvent) -> Event {
    let name = event.event_name();
    match Event::default().event(name).json_data(&event) {
        Ok(sse) => sse,
        Err(e) => {
            warn!("Could not encode {} event: {}", name, e);
            Event::default().event("error").data("encoding failure")
        }
    }
}

/// Long-lived SSE stream delivering envelopes to one agent
///
/// The stream also ends when the server shuts down.
pub async fn agent_stream(
    Path(agent_id): Path<String>,
    Extension(state): Extension<AppState>,
) -> Sse<impl Stream<Item = Result<Event, Infallible>>> {
    let heartbeat = state.broker.config().stream_heartbeat_interval;
    let stream = state
        .broker
        .open_stream(&agent_id)
        .take_until(state.shutdown.clone().cancelled_owned())
        .map(|event| Ok(to_sse(event)));

    Sse::new(stream).keep_alive(
        KeepAlive::new()
            .interval(heartbeat.max(Duration::from_secs(1)))
            .text("keepalive"),
    )
}

/// Out-of-band liveness signal; 404 tells the agent to register again
#[axum::debug_handler]
pub async fn agent_heartbeat(
    Path(agent_id): Path<String>,
    Extension(state): Extension<AppState>,
) -> Result<Json<Ack>, ApiError> {
    if state.broker.update_heartbeat(&agent_id) {
        Ok(Json(Ack { ok: true }))
    } else {
        Err(api_error(StatusCode::NOT_FOUND, "Agent not registered"))
    }
}

#[axum::debug_handler]
pub async fn list_agents(Extension(state): Extension<AppState>) -> Json<Vec<AgentInfo>> {
    Json(state.broker.agents())
}
