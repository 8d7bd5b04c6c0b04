use super::{HandlerError, TaskHandler};
use crate::agent::backoff::retry_delay;
use crate::agent::client::parse_retry_after;
use crate::constants::DOCUMENT_FETCH_KIND;
use async_trait::async_trait;
use reqwest::{Client, StatusCode};
use serde_json::{json, Value};
use std::time::Duration;
use tracing::{debug, info, warn};
use url::Url;

/// Bounds on repeating a failed download
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FetchRetry {
    /// Total attempts, including the first one
    pub attempts: u32,
    pub base_delay: Duration,
    /// Longest wait between attempts; a longer `Retry-After` ends the fetch
    pub max_delay: Duration,
}

impl Default for FetchRetry {
    fn default() -> Self {
        Self {
            attempts: 3,
            base_delay: Duration::from_secs(1),
            max_delay: Duration::from_secs(30),
        }
    }
}

#[derive(Debug)]
enum FetchFailure {
    /// May succeed if repeated (timeouts, connection errors, 408, 429, 5xx)
    Transient(HandlerError),
    Permanent(HandlerError),
}

/// Downloads `payload.url` and returns the body as text
#[derive(Debug, Clone)]
pub struct DocumentFetchHandler {
    client: Client,
    timeout: Duration,
    retry: FetchRetry,
}

impl DocumentFetchHandler {
    pub fn new(timeout: Duration) -> Self {
        Self {
            client: Client::new(),
            timeout,
            retry: FetchRetry::default(),
        }
    }

    pub fn with_retry(mut self, retry: FetchRetry) -> Self {
        self.retry = FetchRetry {
            attempts: retry.attempts.max(1),
            ..retry
        };
        self
    }

    fn classify_status(status: StatusCode, headers: &reqwest::header::HeaderMap) -> FetchFailure {
        match status.as_u16() {
            401 | 403 | 451 => FetchFailure::Permanent(HandlerError::new(
                "access_restricted",
                format!("access to the document was refused ({})", status),
            )),
            429 => FetchFailure::Transient(HandlerError {
                message: "the document host is rate limiting requests".to_string(),
                reason: "rate_limited".to_string(),
                retry_after: parse_retry_after(headers),
            }),
            404 | 410 => FetchFailure::Permanent(HandlerError::new(
                "not_found",
                format!("document not found ({})", status),
            )),
            code if code >= 500 || code == 408 => FetchFailure::Transient(HandlerError::new(
                "http_error",
                format!("unexpected response {}", status),
            )),
            _ => FetchFailure::Permanent(HandlerError::new(
                "http_error",
                format!("unexpected response {}", status),
            )),
        }
    }

    async fn fetch_once(&self, url: &Url) -> Result<Value, FetchFailure> {
        let response = self
            .client
            .get(url.clone())
            .timeout(self.timeout)
            .send()
            .await
            .map_err(|e| {
                FetchFailure::Transient(if e.is_timeout() {
                    HandlerError::new("timeout", format!("fetching {} timed out", url))
                } else {
                    HandlerError::new("network_error", e.to_string())
                })
            })?;

        let status = response.status();
        if !status.is_success() {
            return Err(Self::classify_status(status, response.headers()));
        }

        let final_url = response.url().to_string();
        let content_type = response
            .headers()
            .get(reqwest::header::CONTENT_TYPE)
            .and_then(|v| v.to_str().ok())
            .map(str::to_string);
        let content = response.text().await.map_err(|e| {
            FetchFailure::Transient(HandlerError::new("network_error", e.to_string()))
        })?;

        info!(%url, bytes = content.len(), "Document fetched");
        Ok(json!({
            "url": url.as_str(),
            "final_url": final_url,
            "status": status.as_u16(),
            "content_type": content_type,
            "content": content,
        }))
    }
}

#[async_trait]
impl TaskHandler for DocumentFetchHandler {
    fn kind(&self) -> &str {
        DOCUMENT_FETCH_KIND
    }

    /// Retries transient failures up to `attempts` times, waiting
    /// `min(base * 2^(n-1), max)` or the host's `Retry-After` between attempts
    async fn handle(&self, payload: Value) -> Result<Value, HandlerError> {
        let url = payload
            .get("url")
            .and_then(Value::as_str)
            .ok_or_else(|| HandlerError::new("invalid_payload", "payload has no 'url'"))?;
        let url = Url::parse(url)
            .map_err(|e| HandlerError::new("invalid_payload", format!("bad url '{}': {}", url, e)))?;

        let mut attempt = 0;
        loop {
            attempt += 1;
            debug!(%url, attempt, "Fetching document");
            let error = match self.fetch_once(&url).await {
                Ok(document) => return Ok(document),
                Err(FetchFailure::Permanent(e)) => return Err(e),
                Err(FetchFailure::Transient(e)) => e,
            };
            if attempt >= self.retry.attempts {
                return Err(error);
            }
            let delay = match error.retry_after {
                Some(after) if after > self.retry.max_delay => return Err(error),
                Some(after) => after,
                None => retry_delay(attempt, self.retry.base_delay, self.retry.max_delay, true),
            };
            warn!(
                %url,
                attempt,
                reason = %error.reason,
                "Fetch failed, retrying in {:?}: {}", delay, error.message
            );
            tokio::time::sleep(delay).await;
        }
    }
}
