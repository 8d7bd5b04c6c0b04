use clap::{Parser, Subcommand};
use std::path::PathBuf;

/// Command line interface for the application
#[derive(Debug, Parser)]
#[command(name = "tasklink", version, about = "Task broker, orchestrator and pull-based agents")]
pub struct Cli {
    /// Sets the logging verbosity level for the application
    /// Possible values: "error", "warn", "info", "debug", "trace"
    /// Default: "info"
    #[arg(long, global = true, default_value_t = String::from("info"))]
    pub logging_level: String,

    /// Also write logs to a daily rolling file in this directory
    #[arg(long, global = true)]
    pub log_dir: Option<PathBuf>,

    #[command(subcommand)]
    pub command: Command,
}

#[derive(Debug, Subcommand)]
pub enum Command {
    /// Run the HTTP API, broker, stale-agent reaper and orchestrator
    Serve {
        /// YAML or TOML server configuration
        #[arg(short, long)]
        config: Option<PathBuf>,
        /// Address to listen on, e.g. 0.0.0.0:8080
        #[arg(long)]
        bind: Option<String>,
        /// SQLite database file
        #[arg(long)]
        database: Option<String>,
    },
    /// Run a remote agent with the built-in document fetch handler
    Agent {
        /// YAML or TOML agent configuration
        #[arg(short, long)]
        config: Option<PathBuf>,
        /// Broker base URL
        #[arg(long)]
        server_url: Option<String>,
        #[arg(long)]
        agent_id: Option<String>,
        #[arg(long)]
        name: Option<String>,
    },
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_agent_flags() {
        let cli = Cli::try_parse_from([
            "tasklink",
            "--logging-level",
            "debug",
            "agent",
            "--server-url",
            "http://broker:8080",
            "--agent-id",
            "scraper-1",
        ])
        .unwrap();
        assert_eq!(cli.logging_level, "debug");
        match cli.command {
            Command::Agent {
                server_url,
                agent_id,
                ..
            } => {
                assert_eq!(server_url.as_deref(), Some("http://broker:8080"));
                assert_eq!(agent_id.as_deref(), Some("scraper-1"));
            }
            other => panic!("unexpected command {:?}", other),
        }
    }

    #[test]
    fn test_subcommand_is_required() {
        assert!(Cli::try_parse_from(["tasklink"]).is_err());
    }
}
