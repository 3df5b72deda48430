#![allow(clippy::unwrap_used, clippy::expect_used)]
//! Integration tests for the HTTP surface: auth gate, queueing flow,
//! polling, and the admin routes.

use std::{net::SocketAddr, sync::Arc, time::Duration};

use {
    switchyard_common::ResponseEnvelope,
    switchyard_config::Settings,
    switchyard_failover::{FailoverConfig, FailoverManager},
    switchyard_gateway::{AppState, build_router},
    switchyard_metrics::MetricsSink,
    switchyard_providers::{KeyManager, OpenAiCompatProvider, ProviderRegistry},
    switchyard_queue::{MemoryQueue, QueueBackend},
};

const SERVER_KEY: &str = "test-server-key";

struct TestGateway {
    addr: SocketAddr,
    queue: Arc<MemoryQueue>,
    failover: Arc<FailoverManager>,
}

impl TestGateway {
    fn url(&self, path: &str) -> String {
        format!("http://{}{path}", self.addr)
    }
}

async fn start_gateway() -> TestGateway {
    let settings = Arc::new(
        Settings::from_lookup(|key| match key {
            "SERVER_API_KEY" => Some(SERVER_KEY.to_string()),
            "LLM_PROVIDER" => Some("grok".to_string()),
            "FAILOVER_PROVIDERS" => Some("openai".to_string()),
            "GROK_API_KEYS" => Some("xai-test-0001".to_string()),
            _ => None,
        })
        .unwrap(),
    );

    let queue = Arc::new(MemoryQueue::new(Duration::from_secs(3600)));
    let registry = Arc::new(
        ProviderRegistry::new()
            .with(Arc::new(OpenAiCompatProvider::grok(
                "http://127.0.0.1:1",
                "grok-3-mini",
            )))
            .with(Arc::new(OpenAiCompatProvider::openai(
                "http://127.0.0.1:1",
                "gpt-4.1",
            ))),
    );
    let failover = Arc::new(FailoverManager::new(FailoverConfig {
        primary: "grok".into(),
        backups: vec!["openai".into()],
        threshold: 3,
        recovery_time: Duration::from_secs(300),
        enabled: true,
    }));
    let keys = Arc::new(KeyManager::new(
        7,
        [("grok".to_string(), vec!["xai-test-0001".to_string()])],
    ));
    let metrics = Arc::new(MetricsSink::new(Duration::from_secs(24 * 3600)));

    let state = Arc::new(AppState {
        settings,
        queue: queue.clone() as Arc<dyn QueueBackend>,
        keys,
        failover: failover.clone(),
        metrics,
        registry,
    });

    let app = build_router(state);
    let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    tokio::spawn(async move {
        axum::serve(listener, app).await.unwrap();
    });

    TestGateway {
        addr,
        queue,
        failover,
    }
}

fn client() -> reqwest::Client {
    reqwest::Client::new()
}

fn chat_body() -> serde_json::Value {
    serde_json::json!({
        "model": "grok-3-mini",
        "messages": [{"role": "user", "content": "hello"}],
    })
}

#[tokio::test]
async fn requests_without_a_valid_bearer_token_get_401() {
    let gw = start_gateway().await;

    let missing = client()
        .post(gw.url("/v1/chat/completions"))
        .json(&chat_body())
        .send()
        .await
        .unwrap();
    assert_eq!(missing.status(), 401);

    let wrong = client()
        .get(gw.url("/v1/providers"))
        .bearer_auth("not-the-key")
        .send()
        .await
        .unwrap();
    assert_eq!(wrong.status(), 401);
}

#[tokio::test]
async fn chat_completions_queues_and_returns_a_request_id() {
    let gw = start_gateway().await;

    let response = client()
        .post(gw.url("/v1/chat/completions"))
        .bearer_auth(SERVER_KEY)
        .json(&chat_body())
        .send()
        .await
        .unwrap();
    assert_eq!(response.status(), 200);

    let body: serde_json::Value = response.json().await.unwrap();
    assert_eq!(body["status"], "queued");
    assert_eq!(body["queue_position"], 1);
    assert!(body["request_id"].as_str().unwrap().starts_with("req_"));

    assert_eq!(gw.queue.len().await.unwrap(), 1);
}

#[tokio::test]
async fn omitted_model_falls_back_to_the_primary_default() {
    let gw = start_gateway().await;

    let response = client()
        .post(gw.url("/v1/chat/completions"))
        .bearer_auth(SERVER_KEY)
        .json(&serde_json::json!({
            "messages": [{"role": "user", "content": "hello"}],
        }))
        .send()
        .await
        .unwrap();
    assert_eq!(response.status(), 200);

    let queued = gw.queue.dequeue().await.unwrap().unwrap();
    assert_eq!(queued.data.model, "grok-2-1212");
}

#[tokio::test]
async fn request_polling_reports_pending_then_the_envelope() {
    let gw = start_gateway().await;

    let pending = client()
        .get(gw.url("/v1/requests/req_unknown"))
        .bearer_auth(SERVER_KEY)
        .send()
        .await
        .unwrap();
    let body: serde_json::Value = pending.json().await.unwrap();
    assert_eq!(body["status"], "pending");

    let envelope = ResponseEnvelope::completed("grok", "grok-3-mini");
    gw.queue.store_response("req_42", &envelope).await.unwrap();

    let done = client()
        .get(gw.url("/v1/requests/req_42"))
        .bearer_auth(SERVER_KEY)
        .send()
        .await
        .unwrap();
    let body: serde_json::Value = done.json().await.unwrap();
    assert_eq!(body["status"], "completed");
    assert_eq!(body["provider"], "grok");
}

#[tokio::test]
async fn stats_includes_usage_queue_depth_and_masked_keys() {
    let gw = start_gateway().await;

    let response = client()
        .get(gw.url("/v1/stats"))
        .bearer_auth(SERVER_KEY)
        .send()
        .await
        .unwrap();
    assert_eq!(response.status(), 200);

    let body: serde_json::Value = response.json().await.unwrap();
    assert_eq!(body["current_queue_length"], 0);
    assert_eq!(body["usage_stats"]["total_requests"], 0);
    assert_eq!(body["api_keys"]["grok_0"]["key"], "xai-...0001");
}

#[tokio::test]
async fn system_status_reports_failover_state_and_metrics() {
    let gw = start_gateway().await;

    let response = client()
        .get(gw.url("/v1/system/status"))
        .bearer_auth(SERVER_KEY)
        .send()
        .await
        .unwrap();
    let body: serde_json::Value = response.json().await.unwrap();

    assert_eq!(body["failover_status"]["current_provider"], "grok");
    assert_eq!(body["failover_status"]["in_failover_mode"], false);
    assert!(body["metrics"]["providers"].is_object());
}

#[tokio::test]
async fn force_failover_switches_and_validates_the_provider() {
    let gw = start_gateway().await;

    let unknown = client()
        .post(gw.url("/v1/system/force-failover/anthropic"))
        .bearer_auth(SERVER_KEY)
        .send()
        .await
        .unwrap();
    assert_eq!(unknown.status(), 400);

    let response = client()
        .post(gw.url("/v1/system/force-failover/openai"))
        .bearer_auth(SERVER_KEY)
        .send()
        .await
        .unwrap();
    let body: serde_json::Value = response.json().await.unwrap();
    assert_eq!(body["success"], true);
    assert_eq!(body["previous_provider"], "grok");
    assert_eq!(body["current_provider"], "openai");
    assert!(gw.failover.status().await.in_failover_mode);
}

#[tokio::test]
async fn reset_provider_clears_state_and_reports_it() {
    let gw = start_gateway().await;
    gw.failover.report_failure("openai").await;

    let response = client()
        .post(gw.url("/v1/system/reset-provider/openai"))
        .bearer_auth(SERVER_KEY)
        .send()
        .await
        .unwrap();
    let body: serde_json::Value = response.json().await.unwrap();
    assert_eq!(body["success"], true);
    assert_eq!(body["provider_status"]["available"], true);
    assert_eq!(body["provider_status"]["failure_count"], 0);
}

#[tokio::test]
async fn providers_lists_model_catalogs_and_current_primary() {
    let gw = start_gateway().await;

    let response = client()
        .get(gw.url("/v1/providers"))
        .bearer_auth(SERVER_KEY)
        .send()
        .await
        .unwrap();
    let body: serde_json::Value = response.json().await.unwrap();

    let providers = body["providers"].as_array().unwrap();
    assert_eq!(providers.len(), 2);
    assert_eq!(providers[0]["name"], "grok");
    assert_eq!(providers[0]["default_model"], "grok-3-mini");
    assert!(
        providers[0]["models"]
            .as_array()
            .unwrap()
            .iter()
            .any(|m| m == "grok-3-mini")
    );
    assert_eq!(providers[1]["name"], "openai");

    assert_eq!(body["current_provider"], "grok");
    assert_eq!(body["primary_provider"], "grok");
}
