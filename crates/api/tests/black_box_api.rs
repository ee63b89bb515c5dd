use std::collections::HashMap;

use reqwest::StatusCode;
use rewardflow_api::app::{self, services};
use rewardflow_infra::config::EngineConfig;
use rewardflow_infra::jobs::WorkerHandle;
use serde_json::json;

struct TestServer {
    base_url: String,
    handle: tokio::task::JoinHandle<()>,
    worker: Option<WorkerHandle>,
}

impl TestServer {
    /// Same router and wiring as prod, in-memory stores and providers,
    /// bound to an ephemeral port.
    async fn spawn(with_worker: bool) -> Self {
        let env = HashMap::from([
            ("WORKER_ID", "black-box"),
            ("POLL_INTERVAL_MS", "10"),
            ("MAX_ATTEMPTS", "3"),
        ]);
        let config =
            EngineConfig::from_lookup(move |key: &str| env.get(key).map(|v| v.to_string()))
                .expect("test config");
        let engine = services::assemble(
            &config,
            services::Stores::in_memory(),
            services::Providers::in_memory(),
        );
        let worker = with_worker.then(|| engine.worker.spawn());
        let app = app::build_app(engine.services);

        let listener = tokio::net::TcpListener::bind("127.0.0.1:0")
            .await
            .expect("failed to bind ephemeral port");
        let addr = listener.local_addr().unwrap();
        let base_url = format!("http://{}", addr);

        let handle = tokio::spawn(async move {
            axum::serve(listener, app).await.unwrap();
        });

        Self {
            base_url,
            handle,
            worker,
        }
    }

    async fn stop(mut self) {
        if let Some(worker) = self.worker.take() {
            worker.shutdown().await;
        }
    }
}

impl Drop for TestServer {
    fn drop(&mut self) {
        self.handle.abort();
    }
}

fn sale(event_id: &str, resource_id: &str) -> serde_json::Value {
    json!({
        "eventId": event_id,
        "eventType": "sale.completed",
        "resourceId": resource_id,
        "tenantHint": "acme",
        "recipient": { "email": "guest@example.com" },
    })
}

async fn post_event(client: &reqwest::Client, base_url: &str, body: serde_json::Value) -> reqwest::Response {
    client
        .post(format!("{}/events", base_url))
        .json(&body)
        .send()
        .await
        .unwrap()
}

async fn status(client: &reqwest::Client, base_url: &str) -> serde_json::Value {
    let res = client
        .get(format!("{}/jobs/status?limit=5", base_url))
        .send()
        .await
        .unwrap();
    assert_eq!(res.status(), StatusCode::OK);
    res.json().await.unwrap()
}

#[tokio::test]
async fn health_is_public() {
    let srv = TestServer::spawn(false).await;
    let res = reqwest::get(format!("{}/health", srv.base_url)).await.unwrap();
    assert_eq!(res.status(), StatusCode::OK);
}

#[tokio::test]
async fn duplicate_delivery_returns_the_same_job() {
    let srv = TestServer::spawn(false).await;
    let client = reqwest::Client::new();

    let first = post_event(&client, &srv.base_url, sale("evt-1", "sale-1")).await;
    assert_eq!(first.status(), StatusCode::ACCEPTED);
    let first: serde_json::Value = first.json().await.unwrap();
    assert_eq!(first["outcome"], "accepted");

    let again: serde_json::Value = post_event(&client, &srv.base_url, sale("evt-1", "sale-1"))
        .await
        .json()
        .await
        .unwrap();
    assert_eq!(again["outcome"], "duplicate_delivery");
    assert_eq!(again["jobId"], first["jobId"]);

    let other: serde_json::Value = post_event(&client, &srv.base_url, sale("evt-2", "sale-1"))
        .await
        .json()
        .await
        .unwrap();
    assert_eq!(other["outcome"], "converged");
    assert_eq!(other["jobId"], first["jobId"]);

    let body = status(&client, &srv.base_url).await;
    assert_eq!(body["summary"]["queued"], 1);
    assert_eq!(body["summary"]["total"], 1);
    assert_eq!(body["recentQueued"][0]["correlationId"], "sale.completed:sale-1");
}

#[tokio::test]
async fn accepted_event_is_processed_to_completion() {
    let srv = TestServer::spawn(true).await;
    let client = reqwest::Client::new();

    let res = post_event(&client, &srv.base_url, sale("evt-1", "sale-1")).await;
    assert_eq!(res.status(), StatusCode::ACCEPTED);
    let accepted: serde_json::Value = res.json().await.unwrap();

    let mut completed = None;
    for _ in 0..200 {
        let body = status(&client, &srv.base_url).await;
        if body["summary"]["completed"] == 1 {
            completed = Some(body);
            break;
        }
        tokio::time::sleep(std::time::Duration::from_millis(10)).await;
    }
    let body = completed.expect("job did not complete within timeout");

    assert_eq!(body["summary"]["queued"], 0);
    assert_eq!(body["summary"]["running"], 0);
    assert_eq!(body["summary"]["error"], 0);
    let job = &body["recentCompleted"][0];
    assert_eq!(job["id"], accepted["jobId"]);
    assert_eq!(job["stage"], "done");
    assert_eq!(job["attempts"], 1);
    assert!(job["lockedAt"].is_null());

    srv.stop().await;
}

#[tokio::test]
async fn invalid_events_are_rejected() {
    let srv = TestServer::spawn(false).await;
    let client = reqwest::Client::new();

    let res = post_event(&client, &srv.base_url, sale("", "sale-1")).await;
    assert_eq!(res.status(), StatusCode::BAD_REQUEST);
    let body: serde_json::Value = res.json().await.unwrap();
    assert_eq!(body["error"], "validation_error");

    let unknown = json!({
        "eventId": "evt-1",
        "eventType": "invoice.voided",
        "resourceId": "inv-1",
    });
    let res = post_event(&client, &srv.base_url, unknown).await;
    assert_eq!(res.status(), StatusCode::UNPROCESSABLE_ENTITY);

    let body = status(&client, &srv.base_url).await;
    assert_eq!(body["summary"]["total"], 0);
}

#[tokio::test]
async fn reset_accepts_filters() {
    let srv = TestServer::spawn(false).await;
    let client = reqwest::Client::new();

    for query in [
        "",
        "?errorOnly=true",
        "?failedOnly=true",
        "?errorOnly=true&failedOnly=true",
        "?stuckOnly=true",
    ] {
        let res = client
            .post(format!("{}/jobs/reset{}", srv.base_url, query))
            .send()
            .await
            .unwrap();
        assert_eq!(res.status(), StatusCode::OK, "query {query:?}");
        let body: serde_json::Value = res.json().await.unwrap();
        assert_eq!(body, json!({ "errorReset": 0, "stuckReset": 0 }));
    }
}
