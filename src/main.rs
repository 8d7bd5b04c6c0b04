//! Main entry point for the application.
//!
//! `tasklink serve` runs the broker, HTTP API and orchestrator in one process.
//! `tasklink agent` runs a remote agent that pulls document fetches from it.

use clap::Parser;
use colored::*;
use std::process::ExitCode;
use std::sync::Arc;
use tasklink::agent::{AgentRuntime, DocumentFetchHandler, FetchRetry, HandlerRegistry};
use tasklink::cli::{Cli, Command};
use tasklink::config::{load_agent_config, load_server_config};
use tasklink::{api, utils};
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

#[tokio::main]
async fn main() -> ExitCode {
    let cli = Cli::parse();
    utils::init_logging(&cli.logging_level, cli.log_dir.as_deref());

    if let Err(e) = dotenvy::dotenv() {
        warn!("Failed to load .env file: {}", e);
    }

    let shutdown = CancellationToken::new();
    tokio::spawn(utils::cancel_on_signal(shutdown.clone()));

    let outcome = match cli.command {
        Command::Serve {
            config,
            bind,
            database,
        } => serve(config, bind, database, shutdown).await,
        Command::Agent {
            config,
            server_url,
            agent_id,
            name,
        } => run_agent(config, server_url, agent_id, name, shutdown).await,
    };

    match outcome {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            error!("{}", e);
            eprintln!("{} {}", "error:".red().bold(), e);
            ExitCode::FAILURE
        }
    }
}

async fn serve(
    config_path: Option<std::path::PathBuf>,
    bind: Option<String>,
    database: Option<String>,
    shutdown: CancellationToken,
) -> Result<(), api::server::BoxError> {
    let mut config = load_server_config(config_path.as_deref())?;
    if let Some(bind) = bind {
        config.bind = bind;
    }
    if let Some(database) = database {
        config.database_path = database;
    }
    info!(bind = %config.bind, database = %config.database_path, "Starting server");
    api::server::launch_server(config, shutdown).await
}

async fn run_agent(
    config_path: Option<std::path::PathBuf>,
    server_url: Option<String>,
    agent_id: Option<String>,
    name: Option<String>,
    shutdown: CancellationToken,
) -> Result<(), api::server::BoxError> {
    let mut config = load_agent_config(config_path.as_deref())?;
    if let Some(server_url) = server_url {
        config.server_url = server_url;
    }
    if agent_id.is_some() {
        config.agent_id = agent_id;
    }
    if let Some(name) = name {
        config.name = name;
    }

    let fetch = DocumentFetchHandler::new(config.fetch_timeout).with_retry(FetchRetry {
        attempts: config.fetch_attempts,
        base_delay: config.base_retry_delay,
        max_delay: config.max_retry_delay,
    });
    let handlers = HandlerRegistry::new().with(fetch);
    let runtime = Arc::new(AgentRuntime::new(config, handlers)?.with_status_output(true));
    info!(agent_id = %runtime.agent_id(), "Starting agent");

    let token = runtime.shutdown_token();
    tokio::spawn(async move {
        shutdown.cancelled().await;
        token.cancel();
    });
    runtime.run().await?;
    Ok(())
}
