//! Remote worker runtime
//!
//! An agent registers with the broker, keeps an SSE stream open to pull
//! envelopes, runs each envelope on its own task and posts exactly one result
//! per envelope. Stream failures are retried with backoff until `max_retries`
//! consecutive failures, at which point the agent stops in the `Error` state.

pub mod backoff;
pub mod client;
mod error;
pub mod handlers;
pub mod monitor;

pub use client::BrokerClient;
pub use error::AgentError;
pub use handlers::{
    DocumentFetchHandler, FetchRetry, HandlerError, HandlerRegistry, TaskHandler,
};

use crate::broker::PendingTaskEnvelope;
use crate::config::AgentConfig;
use crate::event::StreamEvent;
use backoff::{retry_delay, sleep_or_cancel};
use colored::*;
use futures::StreamExt;
use monitor::Liveness;
use reqwest_eventsource::{retry::Never, Event, EventSource};
use std::fmt;
use std::sync::Arc;
use tokio::sync::watch;
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

/// Connection state of an agent
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AgentState {
    Offline,
    Connecting,
    Online,
    /// Retries exhausted; carries the last error
    Error(String),
}

impl fmt::Display for AgentState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            AgentState::Offline => write!(f, "OFFLINE"),
            AgentState::Connecting => write!(f, "CONNECTING"),
            AgentState::Online => write!(f, "ONLINE"),
            AgentState::Error(message) => write!(f, "ERROR ({})", message),
        }
    }
}

/// How one register-and-stream session ended
#[derive(Debug)]
enum SessionEnd {
    /// Shutdown was requested
    Shutdown,
    /// The broker ended the stream at its iteration ceiling
    Closed(String),
    Failed { online: bool, error: AgentError },
}

#[derive(Debug)]
pub struct AgentRuntime {
    config: AgentConfig,
    agent_id: String,
    client: BrokerClient,
    handlers: HandlerRegistry,
    liveness: Arc<Liveness>,
    state: watch::Sender<AgentState>,
    cancel: CancellationToken,
    executions: TaskTracker,
    /// Print state transitions to stdout in color
    print_status: bool,
}

impl AgentRuntime {
    /// Builds a runtime; a missing `agent_id` is replaced by a fresh UUID
    pub fn new(config: AgentConfig, handlers: HandlerRegistry) -> Result<Self, AgentError> {
        config.validate()?;
        let client = BrokerClient::new(&config.server_url, config.request_timeout)?;
        let agent_id = config
            .agent_id
            .clone()
            .unwrap_or_else(|| format!("agent-{}", Uuid::new_v4()));
        let (state, _) = watch::channel(AgentState::Offline);

        Ok(Self {
            config,
            agent_id,
            client,
            handlers,
            liveness: Arc::new(Liveness::default()),
            state,
            cancel: CancellationToken::new(),
            executions: TaskTracker::new(),
            print_status: false,
        })
    }

    /// Echo state transitions on stdout for an operator watching the terminal
    pub fn with_status_output(mut self, enabled: bool) -> Self {
        self.print_status = enabled;
        self
    }

    pub fn agent_id(&self) -> &str {
        &self.agent_id
    }

    pub fn state(&self) -> AgentState {
        self.state.borrow().clone()
    }

    pub fn subscribe(&self) -> watch::Receiver<AgentState> {
        self.state.subscribe()
    }

    pub fn is_connected(&self) -> bool {
        self.liveness.is_connected()
    }

    /// Token that stops the runtime when cancelled
    pub fn shutdown_token(&self) -> CancellationToken {
        self.cancel.clone()
    }

    pub fn shutdown(&self) {
        self.cancel.cancel();
    }

    fn set_state(&self, next: AgentState) {
        let previous = self.state.send_replace(next.clone());
        if previous == next {
            return;
        }
        match &next {
            AgentState::Error(message) => {
                error!(agent_id = %self.agent_id, %message, "Agent state {} -> ERROR", previous)
            }
            _ => info!(agent_id = %self.agent_id, "Agent state {} -> {}", previous, next),
        }
        if self.print_status {
            let label = match &next {
                AgentState::Offline => next.to_string().dimmed(),
                AgentState::Connecting => next.to_string().yellow(),
                AgentState::Online => next.to_string().green().bold(),
                AgentState::Error(_) => next.to_string().red().bold(),
            };
            println!("{} {} {}", "agent".bold().cyan(), self.agent_id, label);
        }
    }

    /// Runs until shutdown or until reconnect retries are exhausted
    ///
    /// # Errors
    ///
    /// Returns `AgentError::RetriesExhausted` when `max_retries` consecutive
    /// sessions failed; the state is then `Error`
    pub async fn run(self: Arc<Self>) -> Result<(), AgentError> {
        let background = self.cancel.child_token();
        let heartbeat = tokio::spawn(monitor::heartbeat_loop(
            self.client.clone(),
            self.agent_id.clone(),
            self.liveness.clone(),
            self.config.heartbeat_interval,
            background.clone(),
        ));
        let health = tokio::spawn(monitor::health_monitor(
            self.liveness.clone(),
            self.config.health_check_interval,
            self.config.heartbeat_timeout,
            background.clone(),
        ));

        let outcome = self.connection_loop().await;

        background.cancel();
        if let Err(e) = heartbeat.await {
            error!(agent_id = %self.agent_id, "Heartbeat task failed: {}", e);
        }
        if let Err(e) = health.await {
            error!(agent_id = %self.agent_id, "Health monitor task failed: {}", e);
        }
        self.executions.close();
        self.executions.wait().await;

        if outcome.is_ok() {
            self.set_state(AgentState::Offline);
        }
        info!(agent_id = %self.agent_id, "Agent stopped");
        outcome
    }

    async fn connection_loop(self: &Arc<Self>) -> Result<(), AgentError> {
        let mut retries: u32 = 0;
        loop {
            if self.cancel.is_cancelled() {
                return Ok(());
            }
            self.set_state(AgentState::Connecting);

            let end = self.run_session().await;
            self.liveness.set_connected(false);

            match end {
                SessionEnd::Shutdown => return Ok(()),
                SessionEnd::Closed(reason) => {
                    info!(agent_id = %self.agent_id, %reason, "Stream closed by broker, reconnecting");
                    retries = 0;
                }
                SessionEnd::Failed { online, error } => {
                    if online {
                        retries = 0;
                    }
                    retries += 1;
                    if retries >= self.config.max_retries {
                        let last_error = error.to_string();
                        self.set_state(AgentState::Error(last_error.clone()));
                        return Err(AgentError::RetriesExhausted {
                            attempts: retries,
                            last_error,
                        });
                    }

                    let delay = match &error {
                        AgentError::RateLimited {
                            retry_after: Some(retry_after),
                        } => *retry_after,
                        _ => retry_delay(
                            retries,
                            self.config.base_retry_delay,
                            self.config.max_retry_delay,
                            self.config.exponential_backoff,
                        ),
                    };
                    warn!(
                        agent_id = %self.agent_id,
                        retries,
                        error = %error,
                        "Connection failed, retrying in {:?}", delay
                    );
                    self.set_state(AgentState::Offline);
                    if !sleep_or_cancel(delay, &self.cancel).await {
                        return Ok(());
                    }
                }
            }
        }
    }

    /// Registers, then consumes the stream until it ends
    async fn run_session(self: &Arc<Self>) -> SessionEnd {
        let registered = self
            .client
            .register(&self.agent_id, &self.config.name, &self.config.capabilities);
        tokio::select! {
            _ = self.cancel.cancelled() => return SessionEnd::Shutdown,
            result = registered => {
                if let Err(error) = result {
                    return SessionEnd::Failed { online: false, error };
                }
            }
        }

        let request = match self.client.stream_request(&self.agent_id) {
            Ok(request) => request,
            Err(error) => return SessionEnd::Failed { online: false, error },
        };
        let mut source = match EventSource::new(request) {
            Ok(source) => source,
            Err(e) => {
                return SessionEnd::Failed {
                    online: false,
                    error: AgentError::Stream(e.to_string()),
                }
            }
        };
        // Reconnection is ours to drive.
        source.set_retry_policy(Box::new(Never));

        let mut online = false;
        loop {
            tokio::select! {
                _ = self.cancel.cancelled() => {
                    source.close();
                    return SessionEnd::Shutdown;
                }
                event = source.next() => match event {
                    Some(Ok(Event::Open)) => debug!(agent_id = %self.agent_id, "Stream opened"),
                    Some(Ok(Event::Message(message))) => {
                        self.liveness.touch();
                        let event = match serde_json::from_str::<StreamEvent>(&message.data) {
                            Ok(event) => event,
                            Err(e) => {
                                warn!(event = %message.event, "Ignoring malformed stream event: {}", e);
                                continue;
                            }
                        };
                        match event {
                            StreamEvent::Connected { .. } => {
                                online = true;
                                self.liveness.set_connected(true);
                                self.set_state(AgentState::Online);
                            }
                            StreamEvent::Task(envelope) => self.spawn_execution(envelope),
                            StreamEvent::Heartbeat { .. } => {
                                debug!(agent_id = %self.agent_id, "Stream heartbeat");
                            }
                            StreamEvent::Error { message } => {
                                source.close();
                                return SessionEnd::Failed {
                                    online,
                                    error: AgentError::Rejected(message),
                                };
                            }
                            StreamEvent::Disconnect { reason } => {
                                source.close();
                                return SessionEnd::Closed(reason);
                            }
                        }
                    }
                    Some(Err(e)) => {
                        source.close();
                        return SessionEnd::Failed {
                            online,
                            error: AgentError::Stream(e.to_string()),
                        };
                    }
                    None => {
                        return SessionEnd::Failed {
                            online,
                            error: AgentError::Stream("stream ended".to_string()),
                        };
                    }
                }
            }
        }
    }

    fn spawn_execution(self: &Arc<Self>, envelope: PendingTaskEnvelope) {
        let runtime = Arc::clone(self);
        self.executions.spawn(async move {
            runtime.execute(envelope).await;
        });
    }

    /// Runs one envelope and posts its single result
    async fn execute(&self, envelope: PendingTaskEnvelope) {
        let PendingTaskEnvelope {
            delivery_id,
            kind,
            payload,
        } = envelope;
        info!(agent_id = %self.agent_id, %delivery_id, %kind, "Executing task");

        let (success, payload) = match self.handlers.execute(&kind, payload).await {
            Ok(output) => (true, output),
            Err(e) => {
                warn!(%delivery_id, reason = %e.reason, "Task failed: {}", e.message);
                (false, e.to_payload())
            }
        };

        match self
            .client
            .post_result_with_retry(
                &delivery_id,
                success,
                &payload,
                self.config.result_post_attempts,
                self.config.base_retry_delay,
                self.config.max_retry_delay,
            )
            .await
        {
            Ok(true) => debug!(%delivery_id, success, "Result accepted"),
            Ok(false) => warn!(%delivery_id, "Broker discarded the result; nobody was waiting"),
            Err(e) => error!(%delivery_id, "Could not post result: {}", e),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    fn config(server_url: &str) -> AgentConfig {
        AgentConfig {
            server_url: server_url.to_string(),
            agent_id: Some("agent-test".to_string()),
            max_retries: 3,
            base_retry_delay: Duration::from_millis(10),
            max_retry_delay: Duration::from_millis(40),
            request_timeout: Duration::from_millis(500),
            ..AgentConfig::default()
        }
    }

    #[test]
    fn test_generated_agent_id() {
        let runtime = AgentRuntime::new(
            AgentConfig {
                agent_id: None,
                ..AgentConfig::default()
            },
            HandlerRegistry::new(),
        )
        .unwrap();
        assert!(runtime.agent_id().starts_with("agent-"));
        assert_eq!(runtime.state(), AgentState::Offline);
    }

    #[test]
    fn test_invalid_config_is_rejected() {
        let result = AgentRuntime::new(
            AgentConfig {
                max_retries: 0,
                ..AgentConfig::default()
            },
            HandlerRegistry::new(),
        );
        assert!(matches!(result, Err(AgentError::Config(_))));
    }

    #[tokio::test]
    async fn test_unreachable_broker_ends_in_error_state() {
        // Nothing listens on this port once the listener is dropped.
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        drop(listener);

        let runtime = Arc::new(
            AgentRuntime::new(config(&format!("http://{}", addr)), HandlerRegistry::new())
                .unwrap(),
        );
        let result = tokio::time::timeout(Duration::from_secs(10), runtime.clone().run())
            .await
            .unwrap();
        assert!(matches!(
            result,
            Err(AgentError::RetriesExhausted { attempts: 3, .. })
        ));
        assert!(matches!(runtime.state(), AgentState::Error(_)));
    }

    #[tokio::test]
    async fn test_shutdown_interrupts_backoff() {
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        drop(listener);

        let runtime = Arc::new(
            AgentRuntime::new(
                AgentConfig {
                    max_retries: 100,
                    base_retry_delay: Duration::from_secs(3600),
                    max_retry_delay: Duration::from_secs(3600),
                    ..config(&format!("http://{}", addr))
                },
                HandlerRegistry::new(),
            )
            .unwrap(),
        );
        let handle = tokio::spawn(runtime.clone().run());
        tokio::time::sleep(Duration::from_millis(200)).await;
        runtime.shutdown();

        let result = tokio::time::timeout(Duration::from_secs(5), handle)
            .await
            .unwrap()
            .unwrap();
        assert!(result.is_ok());
        assert_eq!(runtime.state(), AgentState::Offline);
    }
}
