use crate::api::routes;
use crate::api::state::AppState;
use crate::broker::TaskBroker;
use crate::config::ServerConfig;
use crate::core::{Orchestrator, TextAnalyzer};
use crate::db::Database;
use chrono::Utc;
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::net::TcpListener;
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info};

pub type BoxError = Box<dyn std::error::Error + Send + Sync>;

/// Everything `serve` runs, built but not yet listening
#[derive(Debug)]
pub struct Server {
    pub state: AppState,
    pub config: ServerConfig,
}

impl Server {
    /// Validates the config, opens the database and creates a fresh broker
    pub fn new(config: ServerConfig, shutdown: CancellationToken) -> Result<Self, crate::errors::Error> {
        config.validate()?;
        let database = Database::new(&config.database_path)?;
        let broker = Arc::new(TaskBroker::new(config.broker.clone()));
        Ok(Self {
            state: AppState {
                database,
                broker,
                shutdown,
            },
            config,
        })
    }

    /// Serves the API on `listener` and runs the reaper and orchestrator
    /// until the shutdown token is cancelled
    pub async fn run(self, listener: TcpListener) -> Result<(), BoxError> {
        let shutdown = self.state.shutdown.clone();

        let reaper = tokio::spawn(reap_stale_agents(
            self.state.broker.clone(),
            shutdown.clone(),
        ));
        let orchestrator = Orchestrator::new(
            self.state.database.clone(),
            self.state.broker.clone(),
            Arc::new(TextAnalyzer::default()),
            self.config.orchestrator.clone(),
            shutdown.clone(),
        );
        let orchestrator = tokio::spawn(orchestrator.run());

        let addr = listener.local_addr()?;
        info!("API listening on {}", addr);
        let app = routes::app(self.state);
        let signal = shutdown.clone();
        axum::serve(listener, app)
            .with_graceful_shutdown(async move { signal.cancelled().await })
            .await?;

        shutdown.cancel();
        if let Err(e) = reaper.await {
            error!("Agent reaper task failed: {}", e);
        }
        if let Err(e) = orchestrator.await {
            error!("Orchestrator task failed: {}", e);
        }
        info!("Server stopped");
        Ok(())
    }
}

/// Removes agents whose heartbeat is older than `agent_timeout`
async fn reap_stale_agents(broker: Arc<TaskBroker>, shutdown: CancellationToken) {
    let mut interval = tokio::time::interval(broker.config().reap_interval);
    interval.set_missed_tick_behavior(MissedTickBehavior::Delay);
    loop {
        tokio::select! {
            _ = shutdown.cancelled() => break,
            _ = interval.tick() => {
                let removed = broker.prune_stale_agents(Utc::now());
                if !removed.is_empty() {
                    debug!(?removed, "Reaped stale agents");
                }
            }
        }
    }
}

/// Binds `config.bind` and runs the server until `shutdown` fires
pub async fn launch_server(
    config: ServerConfig,
    shutdown: CancellationToken,
) -> Result<(), BoxError> {
    let addr: SocketAddr = config.bind.parse()?;
    let listener = TcpListener::bind(addr).await?;
    Server::new(config, shutdown)?.run(listener).await
}
