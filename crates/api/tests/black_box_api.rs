use std::time::Duration;

use fintrack_infra::config::RuntimeConfig;
use reqwest::StatusCode;
use serde_json::{json, Value};

struct TestServer {
    base_url: String,
    handle: tokio::task::JoinHandle<()>,
}

impl TestServer {
    async fn spawn() -> Self {
        let config = RuntimeConfig {
            poll_interval: Duration::from_millis(10),
            backoff_base: Duration::from_millis(10),
            ..RuntimeConfig::default()
        };
        // Same router as prod (in-memory services), bound to an ephemeral port.
        let app = fintrack_api::app::build_app(config)
            .await
            .expect("failed to build app");
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0")
            .await
            .expect("failed to bind ephemeral port");
        let addr = listener.local_addr().unwrap();
        let base_url = format!("http://{}", addr);

        let handle = tokio::spawn(async move {
            axum::serve(listener, app).await.unwrap();
        });

        Self { base_url, handle }
    }

    fn url(&self, path: &str) -> String {
        format!("{}{}", self.base_url, path)
    }
}

impl Drop for TestServer {
    fn drop(&mut self) {
        self.handle.abort();
    }
}

async fn post_json(
    client: &reqwest::Client,
    url: String,
    key: Option<&str>,
    body: &Value,
) -> reqwest::Response {
    let mut req = client.post(url).json(body);
    if let Some(key) = key {
        req = req.header("Idempotency-Key", key);
    }
    req.send().await.unwrap()
}

async fn stats_eventually(
    client: &reqwest::Client,
    srv: &TestServer,
    queue: &str,
    done: impl Fn(&Value) -> bool,
) -> Value {
    for _ in 0..100 {
        let stats: Value = client
            .get(srv.url(&format!("/admin/queues/{queue}/stats")))
            .send()
            .await
            .unwrap()
            .json()
            .await
            .unwrap();
        if done(&stats) {
            return stats;
        }
        tokio::time::sleep(Duration::from_millis(20)).await;
    }
    panic!("queue {queue} never reached the expected state");
}

#[tokio::test]
async fn health_is_public() {
    let srv = TestServer::spawn().await;
    let res = reqwest::get(srv.url("/health")).await.unwrap();
    assert_eq!(res.status(), StatusCode::OK);
}

#[tokio::test]
async fn mutating_requests_require_an_idempotency_key() {
    let srv = TestServer::spawn().await;
    let client = reqwest::Client::new();

    let res = post_json(
        &client,
        srv.url("/audit-events"),
        None,
        &json!({"action": "login", "actorId": "u1"}),
    )
    .await;
    assert_eq!(res.status(), StatusCode::BAD_REQUEST);
    let body: Value = res.json().await.unwrap();
    assert_eq!(body["error"], "missing_idempotency_key");

    let res = post_json(
        &client,
        srv.url("/audit-events"),
        Some("has spaces"),
        &json!({"action": "login", "actorId": "u1"}),
    )
    .await;
    assert_eq!(res.status(), StatusCode::BAD_REQUEST);
    let body: Value = res.json().await.unwrap();
    assert_eq!(body["error"], "invalid_idempotency_key");
}

#[tokio::test]
async fn audit_events_are_processed_by_the_worker() {
    let srv = TestServer::spawn().await;
    let client = reqwest::Client::new();

    let res = post_json(
        &client,
        srv.url("/audit-events"),
        Some("audit-1"),
        &json!({"action": "login", "actorId": "u1"}),
    )
    .await;
    assert_eq!(res.status(), StatusCode::ACCEPTED);
    let body: Value = res.json().await.unwrap();
    assert_eq!(body["queue"], "audit-log");
    assert!(body["jobId"].is_string());

    let stats = stats_eventually(&client, &srv, "audit-log", |s| s["completed"] == 1).await;
    assert_eq!(stats["failed"], 0);
}

#[tokio::test]
async fn concurrent_duplicates_execute_once() {
    let srv = TestServer::spawn().await;
    let client = reqwest::Client::new();
    let body = json!({"kind": "notification.email", "payload": {"to": "u1"}});

    let (a, b) = tokio::join!(
        post_json(&client, srv.url("/messages"), Some("k1"), &body),
        post_json(&client, srv.url("/messages"), Some("k1"), &body)
    );
    assert_eq!(a.status(), StatusCode::ACCEPTED);
    assert_eq!(b.status(), StatusCode::ACCEPTED);

    let replayed = [&a, &b]
        .iter()
        .filter(|r| r.headers().get("idempotency-replayed").is_some())
        .count();
    assert_eq!(replayed, 1);

    let a: Value = a.json().await.unwrap();
    let b: Value = b.json().await.unwrap();
    assert_eq!(a, b);

    let stats = stats_eventually(&client, &srv, "messages", |s| s["completed"] == 1).await;
    assert_eq!(stats["waiting"], 0);
    assert_eq!(stats["active"], 0);
}

#[tokio::test]
async fn reusing_a_key_for_a_different_request_conflicts() {
    let srv = TestServer::spawn().await;
    let client = reqwest::Client::new();

    let first = post_json(
        &client,
        srv.url("/messages"),
        Some("k2"),
        &json!({"kind": "notification.email", "payload": {"to": "u1"}}),
    )
    .await;
    assert_eq!(first.status(), StatusCode::ACCEPTED);

    let second = post_json(
        &client,
        srv.url("/messages"),
        Some("k2"),
        &json!({"kind": "notification.email", "payload": {"to": "u2"}}),
    )
    .await;
    assert_eq!(second.status(), StatusCode::UNPROCESSABLE_ENTITY);
    let body: Value = second.json().await.unwrap();
    assert_eq!(body["error"], "idempotency_key_conflict");
}

#[tokio::test]
async fn client_errors_are_replayed_too() {
    let srv = TestServer::spawn().await;
    let client = reqwest::Client::new();
    let body = json!({"kind": "notification.email", "queue": "nope"});

    let first = post_json(&client, srv.url("/messages"), Some("k3"), &body).await;
    assert_eq!(first.status(), StatusCode::NOT_FOUND);
    let second = post_json(&client, srv.url("/messages"), Some("k3"), &body).await;
    assert_eq!(second.status(), StatusCode::NOT_FOUND);
    assert_eq!(second.headers()["idempotency-replayed"], "true");
}

#[tokio::test]
async fn failed_jobs_can_be_inspected_and_requeued() {
    let srv = TestServer::spawn().await;
    let client = reqwest::Client::new();

    // No handler is registered for this kind, so the job fails without retries.
    let res = post_json(
        &client,
        srv.url("/messages"),
        Some("m1"),
        &json!({"kind": "invoice.render", "payload": {}}),
    )
    .await;
    let accepted: Value = res.json().await.unwrap();
    let job_id = accepted["jobId"].as_str().unwrap().to_string();

    stats_eventually(&client, &srv, "messages", |s| s["failed"] == 1).await;

    let failed: Value = client
        .get(srv.url("/admin/queues/messages/failed"))
        .send()
        .await
        .unwrap()
        .json()
        .await
        .unwrap();
    assert_eq!(failed[0]["id"], job_id.as_str());
    assert_eq!(failed[0]["attempts"], 1);
    assert!(failed[0]["lastError"].as_str().unwrap().contains("invoice.render"));

    let res = post_json(
        &client,
        srv.url(&format!("/admin/queues/messages/jobs/{job_id}/requeue")),
        Some("requeue-1"),
        &json!({"extraAttempts": 2}),
    )
    .await;
    assert_eq!(res.status(), StatusCode::OK);
    let job: Value = res.json().await.unwrap();
    assert_eq!(job["maxAttempts"], 3);

    let res = client
        .get(srv.url("/admin/queues/unknown/stats"))
        .send()
        .await
        .unwrap();
    assert_eq!(res.status(), StatusCode::NOT_FOUND);
}

#[tokio::test]
async fn config_changes_reach_the_event_stream() {
    let srv = TestServer::spawn().await;
    let client = reqwest::Client::new();

    let res = post_json(
        &client,
        srv.url("/config"),
        Some("cfg-1"),
        &json!({"key": "base_currency", "value": "EUR", "actorId": "admin"}),
    )
    .await;
    assert_eq!(res.status(), StatusCode::ACCEPTED);
    let body: Value = res.json().await.unwrap();
    assert_eq!(body["topic"], "config.base_currency");

    // The change is retained state, so a new observer gets it first.
    for _ in 0..50 {
        let mut stream = client
            .get(srv.url("/events/stream?topic=config.base_currency"))
            .send()
            .await
            .unwrap();
        assert_eq!(stream.status(), StatusCode::OK);

        if let Ok(Ok(Some(chunk))) =
            tokio::time::timeout(Duration::from_millis(100), stream.chunk()).await
        {
            let text = String::from_utf8_lossy(&chunk);
            assert!(text.contains("event: config.base_currency"));
            assert!(text.contains("EUR"));
            return;
        }
    }
    panic!("config change never reached the event stream");
}
