use crate::config::ConfigError;
use std::time::Duration;

#[derive(Debug, thiserror::Error)]
pub enum AgentError {
    #[error("Transport error: {0}")]
    Transport(#[from] reqwest::Error),
    #[error("Broker answered {status}: {body}")]
    Status { status: u16, body: String },
    #[error("Rate limited by broker")]
    RateLimited { retry_after: Option<Duration> },
    #[error("Invalid broker URL: {0}")]
    InvalidUrl(#[from] url::ParseError),
    #[error("Stream error: {0}")]
    Stream(String),
    #[error("Broker closed the stream: {0}")]
    Rejected(String),
    #[error("Giving up after {attempts} attempts: {last_error}")]
    RetriesExhausted { attempts: u32, last_error: String },
    #[error(transparent)]
    Config(#[from] ConfigError),
}

impl AgentError {
    /// Whether repeating the same request may succeed
    pub fn is_retryable(&self) -> bool {
        match self {
            AgentError::Transport(_) | AgentError::RateLimited { .. } | AgentError::Stream(_) => {
                true
            }
            AgentError::Status { status, .. } => *status >= 500 || *status == 408,
            _ => false,
        }
    }
}
