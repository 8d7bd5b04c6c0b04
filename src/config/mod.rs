//! Server and agent configuration
//!
//! Every field has a default, so an empty file (or no file at all) yields a
//! working local setup. Durations are written as human strings, e.g. `"30s"`.

pub(crate) mod duration;
mod parser;

use crate::constants::{
    DEFAULT_BIND_ADDR, DEFAULT_DATABASE_PATH, DEFAULT_SERVER_URL, DOCUMENT_FETCH_CAPABILITY,
};
use serde::{Deserialize, Serialize};
use std::time::Duration;

pub use parser::{default_config_path, load_agent_config, load_config, load_server_config};

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("Failed to read config file {path}: {source}")]
    Io {
        path: String,
        #[source]
        source: std::io::Error,
    },
    #[error("Invalid YAML in {path}: {source}")]
    Yaml {
        path: String,
        #[source]
        source: serde_yaml::Error,
    },
    #[error("Invalid TOML in {path}: {source}")]
    Toml {
        path: String,
        #[source]
        source: toml::de::Error,
    },
    #[error("Unsupported config format for {0} (expected .yaml, .yml or .toml)")]
    UnsupportedFormat(String),
    #[error("Invalid configuration: {0}")]
    Invalid(String),
}

/// Everything `tasklink serve` needs
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ServerConfig {
    /// Socket address for the HTTP API
    pub bind: String,
    /// SQLite file holding tasks, steps and documents
    pub database_path: String,
    pub broker: BrokerConfig,
    pub orchestrator: OrchestratorConfig,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            bind: DEFAULT_BIND_ADDR.to_string(),
            database_path: DEFAULT_DATABASE_PATH.to_string(),
            broker: BrokerConfig::default(),
            orchestrator: OrchestratorConfig::default(),
        }
    }
}

/// Stream and liveness settings of the task broker
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct BrokerConfig {
    /// Idle time between stream iterations when no work arrives
    #[serde(with = "duration")]
    pub stream_poll_interval: Duration,
    /// Cadence of `heartbeat` events on an open stream
    #[serde(with = "duration")]
    pub stream_heartbeat_interval: Duration,
    /// Iterations after which a stream is closed and the agent must reconnect
    pub max_stream_iterations: u64,
    /// Agents silent for longer than this are removed by the reaper
    #[serde(with = "duration")]
    pub agent_timeout: Duration,
    #[serde(with = "duration")]
    pub reap_interval: Duration,
}

impl Default for BrokerConfig {
    fn default() -> Self {
        Self {
            stream_poll_interval: Duration::from_secs(1),
            stream_heartbeat_interval: Duration::from_secs(15),
            max_stream_iterations: 86_400,
            agent_timeout: Duration::from_secs(90),
            reap_interval: Duration::from_secs(30),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct OrchestratorConfig {
    /// Delay between polls of the task store when idle
    #[serde(with = "duration")]
    pub poll_interval: Duration,
    /// How long a remote step waits for its agent's result
    #[serde(with = "duration")]
    pub remote_step_timeout: Duration,
    /// Capability requested from agents for the fetch step
    pub fetch_capability: String,
}

impl Default for OrchestratorConfig {
    fn default() -> Self {
        Self {
            poll_interval: Duration::from_secs(2),
            remote_step_timeout: Duration::from_secs(300),
            fetch_capability: DOCUMENT_FETCH_CAPABILITY.to_string(),
        }
    }
}

/// Settings of a remote agent process
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct AgentConfig {
    /// Base URL of the broker, e.g. `http://127.0.0.1:8080`
    pub server_url: String,
    /// Stable id; generated at startup when absent
    pub agent_id: Option<String>,
    pub name: String,
    pub capabilities: Vec<String>,
    /// Consecutive connection failures before the agent gives up
    pub max_retries: u32,
    #[serde(with = "duration")]
    pub base_retry_delay: Duration,
    #[serde(with = "duration")]
    pub max_retry_delay: Duration,
    pub exponential_backoff: bool,
    #[serde(with = "duration")]
    pub heartbeat_interval: Duration,
    /// Stream silence after which the agent considers itself disconnected
    #[serde(with = "duration")]
    pub heartbeat_timeout: Duration,
    #[serde(with = "duration")]
    pub health_check_interval: Duration,
    /// Timeout of ordinary requests (register, heartbeat, result post)
    #[serde(with = "duration")]
    pub request_timeout: Duration,
    pub result_post_attempts: u32,
    /// Timeout of the document download performed by the fetch handler
    #[serde(with = "duration")]
    pub fetch_timeout: Duration,
    /// Download attempts per envelope; retries use the reconnect delays
    pub fetch_attempts: u32,
}

impl Default for AgentConfig {
    fn default() -> Self {
        Self {
            server_url: DEFAULT_SERVER_URL.to_string(),
            agent_id: None,
            name: "tasklink-agent".to_string(),
            capabilities: vec![DOCUMENT_FETCH_CAPABILITY.to_string()],
            max_retries: 10,
            base_retry_delay: Duration::from_secs(1),
            max_retry_delay: Duration::from_secs(30),
            exponential_backoff: true,
            heartbeat_interval: Duration::from_secs(30),
            heartbeat_timeout: Duration::from_secs(60),
            health_check_interval: Duration::from_secs(10),
            request_timeout: Duration::from_secs(30),
            result_post_attempts: 3,
            fetch_timeout: Duration::from_secs(60),
            fetch_attempts: 3,
        }
    }
}

/// Periodic timers panic on a zero period, so every interval must be positive
fn require_positive(field: &str, value: Duration) -> Result<(), ConfigError> {
    if value.is_zero() {
        return Err(ConfigError::Invalid(format!("{} must be greater than zero", field)));
    }
    Ok(())
}

impl ServerConfig {
    /// Rejects settings the broker and orchestrator loops cannot run with
    pub fn validate(&self) -> Result<(), ConfigError> {
        require_positive("broker.stream_poll_interval", self.broker.stream_poll_interval)?;
        require_positive(
            "broker.stream_heartbeat_interval",
            self.broker.stream_heartbeat_interval,
        )?;
        require_positive("broker.agent_timeout", self.broker.agent_timeout)?;
        require_positive("broker.reap_interval", self.broker.reap_interval)?;
        require_positive("orchestrator.poll_interval", self.orchestrator.poll_interval)?;
        require_positive(
            "orchestrator.remote_step_timeout",
            self.orchestrator.remote_step_timeout,
        )?;
        if self.broker.max_stream_iterations == 0 {
            return Err(ConfigError::Invalid(
                "broker.max_stream_iterations must be at least 1".into(),
            ));
        }
        if self.orchestrator.fetch_capability.trim().is_empty() {
            return Err(ConfigError::Invalid(
                "orchestrator.fetch_capability must not be empty".into(),
            ));
        }
        Ok(())
    }
}

impl AgentConfig {
    /// Rejects settings the runtime cannot work with
    pub fn validate(&self) -> Result<(), ConfigError> {
        require_positive("base_retry_delay", self.base_retry_delay)?;
        require_positive("heartbeat_interval", self.heartbeat_interval)?;
        require_positive("heartbeat_timeout", self.heartbeat_timeout)?;
        require_positive("health_check_interval", self.health_check_interval)?;
        require_positive("request_timeout", self.request_timeout)?;
        require_positive("fetch_timeout", self.fetch_timeout)?;
        if let Some(agent_id) = &self.agent_id {
            if agent_id.is_empty() || agent_id.trim() != agent_id {
                return Err(ConfigError::Invalid(format!(
                    "agent_id '{}' must be non-empty without surrounding whitespace",
                    agent_id
                )));
            }
        }
        if url::Url::parse(&self.server_url).is_err() {
            return Err(ConfigError::Invalid(format!(
                "server_url '{}' is not a valid URL",
                self.server_url
            )));
        }
        if self.max_retries == 0 {
            return Err(ConfigError::Invalid("max_retries must be at least 1".into()));
        }
        if self.fetch_attempts == 0 {
            return Err(ConfigError::Invalid("fetch_attempts must be at least 1".into()));
        }
        if self.result_post_attempts == 0 {
            return Err(ConfigError::Invalid(
                "result_post_attempts must be at least 1".into(),
            ));
        }
        if self.base_retry_delay > self.max_retry_delay {
            return Err(ConfigError::Invalid(
                "base_retry_delay must not exceed max_retry_delay".into(),
            ));
        }
        Ok(())
    }
}
