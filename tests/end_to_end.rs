//! Runs the real server on an ephemeral port against real agent runtimes.

use async_trait::async_trait;
use axum::http::header;
use axum::routing::get;
use axum::Router;
use serde_json::{json, Value};
use std::collections::HashMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tasklink::agent::{
    AgentRuntime, AgentState, DocumentFetchHandler, HandlerError, HandlerRegistry, TaskHandler,
};
use tasklink::api::server::Server;
use tasklink::broker::TaskBroker;
use tasklink::config::{AgentConfig, BrokerConfig, OrchestratorConfig, ServerConfig};
use tempfile::TempDir;
use tokio::net::TcpListener;
use tokio_util::sync::CancellationToken;

struct TestServer {
    base_url: String,
    broker: Arc<TaskBroker>,
    shutdown: CancellationToken,
    _dir: TempDir,
}

async fn start_server() -> TestServer {
    let dir = tempfile::tempdir().unwrap();
    let config = ServerConfig {
        bind: "127.0.0.1:0".to_string(),
        database_path: dir.path().join("e2e.db").to_str().unwrap().to_string(),
        broker: BrokerConfig {
            stream_poll_interval: Duration::from_millis(50),
            stream_heartbeat_interval: Duration::from_millis(500),
            ..BrokerConfig::default()
        },
        orchestrator: OrchestratorConfig {
            poll_interval: Duration::from_millis(50),
            remote_step_timeout: Duration::from_secs(10),
            ..OrchestratorConfig::default()
        },
    };

    let shutdown = CancellationToken::new();
    let server = Server::new(config, shutdown.clone()).unwrap();
    let broker = server.state.broker.clone();
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let base_url = format!("http://{}", listener.local_addr().unwrap());
    tokio::spawn(async move {
        server.run(listener).await.unwrap();
    });

    TestServer {
        base_url,
        broker,
        shutdown,
        _dir: dir,
    }
}

/// Serves `/papers/42` as a small plain-text document
async fn start_document_host() -> String {
    let app = Router::new().route(
        "/papers/42",
        get(|| async {
            (
                [(header::CONTENT_TYPE, "text/plain")],
                "Pull-Based Dispatch\nagents pull envelopes from brokers; brokers never push",
            )
        }),
    );
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    tokio::spawn(async move {
        axum::serve(listener, app).await.unwrap();
    });
    format!("http://{}", addr)
}

fn agent_config(server_url: &str, agent_id: &str, capabilities: &[&str]) -> AgentConfig {
    AgentConfig {
        server_url: server_url.to_string(),
        agent_id: Some(agent_id.to_string()),
        capabilities: capabilities.iter().map(|c| c.to_string()).collect(),
        base_retry_delay: Duration::from_millis(200),
        max_retry_delay: Duration::from_secs(2),
        heartbeat_interval: Duration::from_millis(200),
        request_timeout: Duration::from_secs(5),
        ..AgentConfig::default()
    }
}

async fn wait_until(what: &str, timeout: Duration, mut check: impl FnMut() -> bool) {
    let deadline = tokio::time::Instant::now() + timeout;
    while !check() {
        if tokio::time::Instant::now() >= deadline {
            panic!("timed out waiting for {}", what);
        }
        tokio::time::sleep(Duration::from_millis(20)).await;
    }
}

fn is_streaming(broker: &TaskBroker, agent_id: &str) -> bool {
    broker.agent(agent_id).is_some_and(|a| a.streaming)
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_fetch_and_analyze_through_a_remote_agent() {
    let server = start_server().await;
    let document_host = start_document_host().await;
    let http = reqwest::Client::new();

    let handlers = HandlerRegistry::new().with(DocumentFetchHandler::new(Duration::from_secs(5)));
    let agent = Arc::new(
        AgentRuntime::new(
            agent_config(&server.base_url, "fetcher-1", &["document_fetch"]),
            handlers,
        )
        .unwrap(),
    );
    let agent_task = tokio::spawn(agent.clone().run());
    wait_until("agent stream", Duration::from_secs(5), || {
        is_streaming(&server.broker, "fetcher-1")
    })
    .await;
    wait_until("agent online", Duration::from_secs(5), || {
        agent.state() == AgentState::Online
    })
    .await;

    let create = json!({
        "subject_id": "42",
        "task_type": "fetch_and_analyze",
        "metadata": {"url": format!("{}/papers/42", document_host)},
    });
    let response = http
        .post(format!("{}/tasks", server.base_url))
        .json(&create)
        .send()
        .await
        .unwrap();
    assert_eq!(response.status(), 201);
    let task_id = response.json::<Value>().await.unwrap()["task_id"]
        .as_str()
        .unwrap()
        .to_string();

    // Same subject while the first task is in flight.
    let duplicate = http
        .post(format!("{}/tasks", server.base_url))
        .json(&create)
        .send()
        .await
        .unwrap();
    assert_eq!(duplicate.status(), 409);

    let mut task = Value::Null;
    for _ in 0..250 {
        task = http
            .get(format!("{}/tasks/{}", server.base_url, task_id))
            .send()
            .await
            .unwrap()
            .json()
            .await
            .unwrap();
        if task["status"] == "completed" || task["status"] == "failed" {
            break;
        }
        tokio::time::sleep(Duration::from_millis(40)).await;
    }
    assert_eq!(task["status"], "completed", "task: {}", task);
    assert_eq!(task["progress"], 100);
    let steps: Vec<&str> = task["steps"]
        .as_array()
        .unwrap()
        .iter()
        .map(|s| s["step_name"].as_str().unwrap())
        .collect();
    assert_eq!(steps, vec!["fetch_document", "analyze_document", "save_record"]);
    assert_eq!(task["result"]["analyze_document"]["title"], "Pull-Based Dispatch");

    // Once the first task is terminal the subject is free again.
    let again = http
        .post(format!("{}/tasks", server.base_url))
        .json(&create)
        .send()
        .await
        .unwrap();
    assert_eq!(again.status(), 201);

    let health: Value = http
        .get(format!("{}/health", server.base_url))
        .send()
        .await
        .unwrap()
        .json()
        .await
        .unwrap();
    assert_eq!(health["ok"], true);
    assert_eq!(health["agents"], 1);

    let agents: Value = http
        .get(format!("{}/agents", server.base_url))
        .send()
        .await
        .unwrap()
        .json()
        .await
        .unwrap();
    assert_eq!(agents[0]["agent_id"], "fetcher-1");
    assert_eq!(agents[0]["capabilities"], json!(["document_fetch"]));

    agent.shutdown();
    agent_task.await.unwrap().unwrap();
    server.shutdown.cancel();
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_task_without_agents_fails_with_capacity_reason() {
    let server = start_server().await;
    let http = reqwest::Client::new();

    let response: Value = http
        .post(format!("{}/tasks", server.base_url))
        .json(&json!({"subject_id": "7", "task_type": "fetch"}))
        .send()
        .await
        .unwrap()
        .json()
        .await
        .unwrap();
    let task_id = response["task_id"].as_str().unwrap().to_string();

    let mut task = Value::Null;
    for _ in 0..100 {
        task = http
            .get(format!("{}/tasks/{}", server.base_url, task_id))
            .send()
            .await
            .unwrap()
            .json()
            .await
            .unwrap();
        if task["status"] == "failed" {
            break;
        }
        tokio::time::sleep(Duration::from_millis(40)).await;
    }
    assert_eq!(task["status"], "failed");
    assert_eq!(task["error_reason"], "no_capable_agent");

    let cancel: Value = http
        .post(format!("{}/tasks/{}/cancel", server.base_url, task_id))
        .send()
        .await
        .unwrap()
        .json()
        .await
        .unwrap();
    assert_eq!(cancel["ok"], false);

    let missing = http
        .get(format!("{}/tasks/does-not-exist", server.base_url))
        .send()
        .await
        .unwrap();
    assert_eq!(missing.status(), 404);

    let heartbeat = http
        .post(format!("{}/agents/ghost/heartbeat", server.base_url))
        .send()
        .await
        .unwrap();
    assert_eq!(heartbeat.status(), 404);

    server.shutdown.cancel();
}

/// Records how many times each delivery was executed
#[derive(Debug, Default)]
struct CountingHandler {
    seen: Mutex<HashMap<String, usize>>,
}

#[async_trait]
impl TaskHandler for CountingHandler {
    fn kind(&self) -> &str {
        "echo"
    }

    async fn handle(&self, payload: Value) -> Result<Value, HandlerError> {
        let key = payload["n"].to_string();
        *self.seen.lock().unwrap().entry(key).or_default() += 1;
        Ok(payload)
    }
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_forced_stream_drop_reconnects_without_redelivery() {
    let server = start_server().await;
    let counter = Arc::new(CountingHandler::default());
    let mut handlers = HandlerRegistry::new();
    handlers.register(counter.clone());

    let config = agent_config(&server.base_url, "echo-1", &["echo"]);
    let base_delay = config.base_retry_delay;
    let agent = Arc::new(AgentRuntime::new(config, handlers).unwrap());
    let agent_task = tokio::spawn(agent.clone().run());
    wait_until("agent stream", Duration::from_secs(5), || {
        is_streaming(&server.broker, "echo-1")
    })
    .await;

    let broker = server.broker.clone();
    let run = |n: u32| {
        let broker = broker.clone();
        async move {
            let delivery_id = broker.submit_task("echo", json!({"n": n}), "echo").unwrap();
            let result = broker
                .await_result(&delivery_id, Duration::from_secs(5))
                .await
                .expect("agent should answer");
            assert!(result.success);
            assert_eq!(result.payload, json!({"n": n}));
        }
    };

    for n in 0..3 {
        run(n).await;
    }

    // Drop the agent on the broker side; its stream ends with an error event.
    let dropped_at = tokio::time::Instant::now();
    assert!(server.broker.unregister("echo-1"));
    wait_until("agent reconnect", Duration::from_secs(5), || {
        is_streaming(&server.broker, "echo-1")
    })
    .await;
    assert!(dropped_at.elapsed() < base_delay + Duration::from_secs(1));

    for n in 3..5 {
        run(n).await;
    }

    let seen = counter.seen.lock().unwrap().clone();
    assert_eq!(seen.len(), 5);
    assert!(seen.values().all(|count| *count == 1), "seen: {:?}", seen);

    agent.shutdown();
    agent_task.await.unwrap().unwrap();
    server.shutdown.cancel();
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_agents_sharing_an_id_back_off_between_takeovers() {
    let server = start_server().await;
    let runtimes: Vec<Arc<AgentRuntime>> = (0..2)
        .map(|_| {
            let config = AgentConfig {
                max_retries: 100,
                base_retry_delay: Duration::from_millis(300),
                max_retry_delay: Duration::from_millis(300),
                ..agent_config(&server.base_url, "dup", &["echo"])
            };
            Arc::new(AgentRuntime::new(config, HandlerRegistry::new()).unwrap())
        })
        .collect();

    // Each runtime going ONLINE is one session that took the registration.
    let sessions = Arc::new(AtomicUsize::new(0));
    for runtime in &runtimes {
        let mut states = runtime.subscribe();
        let sessions = sessions.clone();
        tokio::spawn(async move {
            while states.changed().await.is_ok() {
                if *states.borrow_and_update() == AgentState::Online {
                    sessions.fetch_add(1, Ordering::SeqCst);
                }
            }
        });
    }
    let tasks: Vec<_> = runtimes
        .iter()
        .map(|runtime| tokio::spawn(runtime.clone().run()))
        .collect();

    tokio::time::sleep(Duration::from_secs(2)).await;
    let count = sessions.load(Ordering::SeqCst);
    // A takeover costs the loser one 300ms backoff.
    assert!((2..=16).contains(&count), "sessions in 2s: {}", count);

    for runtime in &runtimes {
        runtime.shutdown();
    }
    for task in tasks {
        task.await.unwrap().unwrap();
    }
    server.shutdown.cancel();
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_zero_orchestrator_interval_is_refused_at_startup() {
    let dir = tempfile::tempdir().unwrap();
    let config = ServerConfig {
        database_path: dir.path().join("zero.db").to_str().unwrap().to_string(),
        orchestrator: OrchestratorConfig {
            poll_interval: Duration::ZERO,
            ..OrchestratorConfig::default()
        },
        ..ServerConfig::default()
    };
    let err = Server::new(config, CancellationToken::new()).unwrap_err();
    assert!(err.to_string().contains("poll_interval"), "{}", err);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_padded_agent_id_is_refused() {
    let server = start_server().await;
    let response = reqwest::Client::new()
        .post(format!("{}/agents/register", server.base_url))
        .json(&json!({"agent_id": " fetcher-1 ", "name": "padded", "capabilities": []}))
        .send()
        .await
        .unwrap();
    assert_eq!(response.status(), 422);
    assert!(server.broker.agents().is_empty());
    server.shutdown.cancel();
}
