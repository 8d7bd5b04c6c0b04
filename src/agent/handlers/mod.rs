mod document_fetch;

pub use document_fetch::{DocumentFetchHandler, FetchRetry};

use async_trait::async_trait;
use serde_json::{json, Value};
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

/// Failure of a handler, reported back to the broker as the result payload
#[derive(Debug, Clone, PartialEq, thiserror::Error)]
#[error("{message}")]
pub struct HandlerError {
    pub message: String,
    /// Machine-readable reason, e.g. `access_restricted`
    pub reason: String,
    pub retry_after: Option<Duration>,
}

impl HandlerError {
    pub fn new(reason: &str, message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
            reason: reason.to_string(),
            retry_after: None,
        }
    }

    pub fn to_payload(&self) -> Value {
        let mut payload = json!({
            "error": self.message,
            "reason": self.reason,
        });
        if let Some(retry_after) = self.retry_after {
            payload["retry_after_secs"] = json!(retry_after.as_secs());
        }
        payload
    }
}

/// Executes one kind of envelope on the agent
#[async_trait]
pub trait TaskHandler: std::fmt::Debug + Send + Sync {
    /// Envelope `kind` this handler accepts
    fn kind(&self) -> &str;
    async fn handle(&self, payload: Value) -> Result<Value, HandlerError>;
}

/// Handlers known to an agent, looked up by envelope kind
#[derive(Debug, Default, Clone)]
pub struct HandlerRegistry {
    handlers: HashMap<String, Arc<dyn TaskHandler>>,
}

impl HandlerRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with(mut self, handler: impl TaskHandler + 'static) -> Self {
        self.register(Arc::new(handler));
        self
    }

    pub fn register(&mut self, handler: Arc<dyn TaskHandler>) {
        self.handlers.insert(handler.kind().to_string(), handler);
    }

    pub fn get(&self, kind: &str) -> Option<Arc<dyn TaskHandler>> {
        self.handlers.get(kind).cloned()
    }

    pub fn kinds(&self) -> Vec<String> {
        let mut kinds: Vec<String> = self.handlers.keys().cloned().collect();
        kinds.sort();
        kinds
    }

    /// Runs the handler for `kind`, turning a missing handler into an error
    pub async fn execute(&self, kind: &str, payload: Value) -> Result<Value, HandlerError> {
        match self.get(kind) {
            Some(handler) => handler.handle(payload).await,
            None => Err(HandlerError::new(
                "unsupported_kind",
                format!("no handler for task kind '{}'", kind),
            )),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[derive(Debug)]
    struct Echo;

    #[async_trait]
    impl TaskHandler for Echo {
        fn kind(&self) -> &str {
            "echo"
        }

        async fn handle(&self, payload: Value) -> Result<Value, HandlerError> {
            Ok(payload)
        }
    }

    #[tokio::test]
    async fn test_registry_dispatches_by_kind() {
        let registry = HandlerRegistry::new().with(Echo);
        assert_eq!(registry.kinds(), vec!["echo".to_string()]);
        assert_eq!(
            registry.execute("echo", json!({"a": 1})).await.unwrap(),
            json!({"a": 1})
        );

        let err = registry.execute("render", json!({})).await.unwrap_err();
        assert_eq!(err.reason, "unsupported_kind");
    }

    #[test]
    fn test_error_payload_shape() {
        let mut err = HandlerError::new("rate_limited", "slow down");
        err.retry_after = Some(Duration::from_secs(7));
        assert_eq!(
            err.to_payload(),
            json!({"error": "slow down", "reason": "rate_limited", "retry_after_secs": 7})
        );
    }
}
