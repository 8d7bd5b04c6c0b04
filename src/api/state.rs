use crate::broker::TaskBroker;
use crate::db::Database;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;

/// Shared handles every handler gets through an `Extension`
#[derive(Debug, Clone)]
pub struct AppState {
    pub database: Database,
    pub broker: Arc<TaskBroker>,
    /// Ends open agent streams on shutdown
    pub shutdown: CancellationToken,
}
