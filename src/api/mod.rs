/// Agent registration, streaming and heartbeat handlers
pub mod agents;
/// API error types and handling
pub mod errors;
/// Task, delivery and health handlers
pub mod handlers;
/// Routes configuration and setup
pub mod routes;
/// HTTP server implementation
pub mod server;
/// Shared handler state
pub mod state;
/// Request and response bodies
pub mod types;
