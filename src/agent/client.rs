use super::backoff::retry_delay;
use super::AgentError;
use crate::api::types::{Ack, RegisterAgentRequest, SubmitResultRequest};
use reqwest::{Client, RequestBuilder, Response, StatusCode};
use serde_json::Value;
use std::time::Duration;
use tracing::{debug, warn};
use url::Url;

/// Thin HTTP client for the broker endpoints an agent calls
#[derive(Debug, Clone)]
pub struct BrokerClient {
    client: Client,
    base_url: Url,
    request_timeout: Duration,
}

/// Reads a `Retry-After` header given in seconds
pub fn parse_retry_after(headers: &reqwest::header::HeaderMap) -> Option<Duration> {
    headers
        .get(reqwest::header::RETRY_AFTER)
        .and_then(|v| v.to_str().ok())
        .and_then(|s| s.trim().parse::<u64>().ok())
        .map(Duration::from_secs)
}

impl BrokerClient {
    /// The underlying client has no overall timeout so that streams can stay
    /// open; ordinary requests get `request_timeout` individually.
    pub fn new(server_url: &str, request_timeout: Duration) -> Result<Self, AgentError> {
        let mut base_url = Url::parse(server_url)?;
        if !base_url.path().ends_with('/') {
            let path = format!("{}/", base_url.path());
            base_url.set_path(&path);
        }
        let client = Client::builder().connect_timeout(request_timeout).build()?;
        Ok(Self {
            client,
            base_url,
            request_timeout,
        })
    }

    fn url(&self, path: &str) -> Result<Url, AgentError> {
        Ok(self.base_url.join(path.trim_start_matches('/'))?)
    }

    async fn check(response: Response) -> Result<Response, AgentError> {
        let status = response.status();
        if status.is_success() {
            return Ok(response);
        }
        if status == StatusCode::TOO_MANY_REQUESTS {
            return Err(AgentError::RateLimited {
                retry_after: parse_retry_after(response.headers()),
            });
        }
        let body = response.text().await.unwrap_or_default();
        Err(AgentError::Status {
            status: status.as_u16(),
            body,
        })
    }

    pub async fn register(
        &self,
        agent_id: &str,
        name: &str,
        capabilities: &[String],
    ) -> Result<(), AgentError> {
        let body = RegisterAgentRequest {
            agent_id: agent_id.to_string(),
            name: name.to_string(),
            capabilities: capabilities.to_vec(),
        };
        let response = self
            .client
            .post(self.url("agents/register")?)
            .timeout(self.request_timeout)
            .json(&body)
            .send()
            .await?;
        Self::check(response).await?;
        debug!(agent_id, "Registered with broker");
        Ok(())
    }

    /// Sends an out-of-band liveness signal
    ///
    /// # Returns
    ///
    /// `false` if the broker no longer knows this agent
    pub async fn heartbeat(&self, agent_id: &str) -> Result<bool, AgentError> {
        let response = self
            .client
            .post(self.url(&format!("agents/{}/heartbeat", agent_id))?)
            .timeout(self.request_timeout)
            .send()
            .await?;
        if response.status() == StatusCode::NOT_FOUND {
            return Ok(false);
        }
        let ack: Ack = Self::check(response).await?.json().await?;
        Ok(ack.ok)
    }

    /// Request for the agent's event stream; handed to an `EventSource`
    pub fn stream_request(&self, agent_id: &str) -> Result<RequestBuilder, AgentError> {
        Ok(self
            .client
            .get(self.url(&format!("agents/{}/stream", agent_id))?)
            .header(reqwest::header::ACCEPT, "text/event-stream"))
    }

    /// Posts one result
    ///
    /// # Returns
    ///
    /// `false` if the broker discarded the result because nobody waits for it
    pub async fn post_result(
        &self,
        delivery_id: &str,
        success: bool,
        payload: &Value,
    ) -> Result<bool, AgentError> {
        let body = SubmitResultRequest {
            success,
            payload: payload.clone(),
        };
        let response = self
            .client
            .post(self.url(&format!("tasks/deliveries/{}/result", delivery_id))?)
            .timeout(self.request_timeout)
            .json(&body)
            .send()
            .await?;
        let ack: Ack = Self::check(response).await?.json().await?;
        Ok(ack.ok)
    }

    /// Posts a result, retrying transient failures up to `attempts` times
    ///
    /// Waits `min(base * 2^(n-1), max)` between attempts, or the broker's
    /// `Retry-After` when it answers 429.
    pub async fn post_result_with_retry(
        &self,
        delivery_id: &str,
        success: bool,
        payload: &Value,
        attempts: u32,
        base_delay: Duration,
        max_delay: Duration,
    ) -> Result<bool, AgentError> {
        let attempts = attempts.max(1);
        let mut attempt = 0;
        loop {
            attempt += 1;
            let error = match self.post_result(delivery_id, success, payload).await {
                Ok(accepted) => return Ok(accepted),
                Err(e) if !e.is_retryable() => return Err(e),
                Err(e) => e,
            };
            if attempt >= attempts {
                return Err(AgentError::RetriesExhausted {
                    attempts,
                    last_error: error.to_string(),
                });
            }
            let delay = match &error {
                AgentError::RateLimited {
                    retry_after: Some(retry_after),
                } => *retry_after,
                _ => retry_delay(attempt, base_delay, max_delay, true),
            };
            warn!(
                delivery_id,
                attempt,
                error = %error,
                "Result post failed, retrying in {:?}", delay
            );
            tokio::time::sleep(delay).await;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::extract::Path;
    use axum::http::{header, StatusCode as AxumStatus};
    use axum::response::{IntoResponse, Response};
    use axum::routing::post;
    use axum::{Json, Router};
    use reqwest::header::{HeaderMap, HeaderValue, RETRY_AFTER};
    use serde_json::json;
    use std::collections::HashMap;
    use std::sync::{Arc, Mutex};

    type Posts = Arc<Mutex<HashMap<String, usize>>>;

    /// Broker stand-in whose answer depends on the delivery id:
    /// `flaky` fails twice, `throttled` is rate limited once, `rejected`
    /// gets a 400, `down` always fails and `late` is discarded
    async fn stub_broker() -> (BrokerClient, Posts) {
        let posts: Posts = Arc::default();
        let recorded = posts.clone();
        let app = Router::new().route(
            "/tasks/deliveries/:delivery_id/result",
            post(move |Path(delivery_id): Path<String>| async move {
                let count = {
                    let mut posts = recorded.lock().unwrap();
                    let count = posts.entry(delivery_id.clone()).or_default();
                    *count += 1;
                    *count
                };
                let response: Response = match (delivery_id.as_str(), count) {
                    ("flaky", 1..=2) | ("down", _) => {
                        AxumStatus::SERVICE_UNAVAILABLE.into_response()
                    }
                    ("throttled", 1) => {
                        (AxumStatus::TOO_MANY_REQUESTS, [(header::RETRY_AFTER, "1")]).into_response()
                    }
                    ("rejected", _) => (AxumStatus::BAD_REQUEST, "bad payload").into_response(),
                    ("late", _) => Json(json!({"ok": false})).into_response(),
                    _ => Json(json!({"ok": true})).into_response(),
                };
                response
            }),
        );
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            axum::serve(listener, app).await.unwrap();
        });
        let client = BrokerClient::new(&format!("http://{}", addr), Duration::from_secs(5)).unwrap();
        (client, posts)
    }

    async fn post_with_retry(
        client: &BrokerClient,
        delivery_id: &str,
        attempts: u32,
    ) -> Result<bool, AgentError> {
        client
            .post_result_with_retry(
                delivery_id,
                true,
                &json!({"content": "text"}),
                attempts,
                Duration::from_millis(10),
                Duration::from_millis(50),
            )
            .await
    }

    #[tokio::test]
    async fn test_result_post_retries_until_accepted() {
        let (client, posts) = stub_broker().await;
        assert!(post_with_retry(&client, "flaky", 3).await.unwrap());
        assert_eq!(posts.lock().unwrap()["flaky"], 3);
    }

    #[tokio::test]
    async fn test_result_post_waits_for_retry_after() {
        let (client, posts) = stub_broker().await;
        let started = std::time::Instant::now();
        assert!(post_with_retry(&client, "throttled", 3).await.unwrap());
        assert!(started.elapsed() >= Duration::from_secs(1));
        assert_eq!(posts.lock().unwrap()["throttled"], 2);
    }

    #[tokio::test]
    async fn test_result_post_stops_on_client_error() {
        let (client, posts) = stub_broker().await;
        let err = post_with_retry(&client, "rejected", 3).await.unwrap_err();
        assert!(matches!(err, AgentError::Status { status: 400, .. }));
        assert_eq!(posts.lock().unwrap()["rejected"], 1);
    }

    #[tokio::test]
    async fn test_result_post_attempts_are_capped() {
        let (client, posts) = stub_broker().await;
        let err = post_with_retry(&client, "down", 2).await.unwrap_err();
        assert!(matches!(err, AgentError::RetriesExhausted { attempts: 2, .. }));
        assert_eq!(posts.lock().unwrap()["down"], 2);
    }

    #[tokio::test]
    async fn test_discarded_result_is_not_reposted() {
        let (client, posts) = stub_broker().await;
        assert!(!post_with_retry(&client, "late", 3).await.unwrap());
        assert_eq!(posts.lock().unwrap()["late"], 1);
    }

    #[test]
    fn test_retry_after_seconds() {
        let mut headers = HeaderMap::new();
        assert_eq!(parse_retry_after(&headers), None);
        headers.insert(RETRY_AFTER, HeaderValue::from_static("12"));
        assert_eq!(parse_retry_after(&headers), Some(Duration::from_secs(12)));
        headers.insert(
            RETRY_AFTER,
            HeaderValue::from_static("Wed, 21 Oct 2015 07:28:00 GMT"),
        );
        assert_eq!(parse_retry_after(&headers), None);
    }

    #[test]
    fn test_urls_keep_base_path() {
        let client = BrokerClient::new("http://broker:8080/api", Duration::from_secs(5)).unwrap();
        assert_eq!(
            client.url("agents/register").unwrap().as_str(),
            "http://broker:8080/api/agents/register"
        );
        assert_eq!(
            client.url("/tasks/deliveries/d-1/result").unwrap().as_str(),
            "http://broker:8080/api/tasks/deliveries/d-1/result"
        );
    }

    #[test]
    fn test_invalid_url_is_rejected() {
        assert!(matches!(
            BrokerClient::new("not a url", Duration::from_secs(5)),
            Err(AgentError::InvalidUrl(_))
        ));
    }
}
