use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use recordchain_api::app::{build_app, services::Runtime};
use recordchain_infra::config::Config;
use recordchain_ledger::{Fault, InMemoryLedger};
use reqwest::StatusCode;
use serde_json::json;

const ORG1_KEY: &str = "org1-key";
const ORG2_KEY: &str = "org2-key";

struct TestServer {
    base_url: String,
    ledger: InMemoryLedger,
    handle: tokio::task::JoinHandle<()>,
}

fn config() -> Config {
    let mut vars = HashMap::new();
    vars.insert("LEDGER_ORGS".to_string(), "Org1,Org2".to_string());
    vars.insert("SUBMIT_JOB_BACKOFF_DELAY".to_string(), "20".to_string());
    vars.insert("SCHEDULER_POLL_INTERVAL_MS".to_string(), "10".to_string());
    for (org, key) in [("ORG1", ORG1_KEY), ("ORG2", ORG2_KEY)] {
        vars.insert(format!("HLF_CONNECTION_PROFILE_{org}"), r#"{"name":"test-network"}"#.to_string());
        vars.insert(format!("HLF_CERTIFICATE_{org}"), "cert".to_string());
        vars.insert(format!("HLF_PRIVATE_KEY_{org}"), "key".to_string());
        vars.insert(format!("{org}_APIKEY"), key.to_string());
    }
    Config::from_map(&vars).expect("test configuration is valid")
}

impl TestServer {
    async fn spawn() -> Self {
        // Same router as prod, bound to an ephemeral port.
        let ledger = InMemoryLedger::new();
        let runtime = Runtime::start(&config(), Arc::new(ledger.clone())).await.unwrap();
        let app = build_app(runtime.services.clone());

        let listener = tokio::net::TcpListener::bind("127.0.0.1:0")
            .await
            .expect("failed to bind ephemeral port");
        let addr = listener.local_addr().unwrap();
        let base_url = format!("http://{}", addr);

        let handle = tokio::spawn(async move {
            axum::serve(listener, app).await.unwrap();
            runtime.shutdown().await;
        });

        Self {
            base_url,
            ledger,
            handle,
        }
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

async fn submit(client: &reqwest::Client, srv: &TestServer, name: &str, args: serde_json::Value) -> String {
    let res = client
        .post(srv.url("/api/jobs"))
        .header("X-API-Key", ORG1_KEY)
        .json(&json!({ "transactionName": name, "args": args }))
        .send()
        .await
        .unwrap();
    assert_eq!(res.status(), StatusCode::ACCEPTED);

    let body: serde_json::Value = res.json().await.unwrap();
    assert_eq!(body["status"], "Accepted");
    assert!(body["timestamp"].is_string());
    body["jobId"].as_str().unwrap().to_string()
}

async fn job_eventually(client: &reqwest::Client, srv: &TestServer, job_id: &str) -> serde_json::Value {
    // Jobs run in the background; poll until one settles.
    for _ in 0..200 {
        let job: serde_json::Value = client
            .get(srv.url(&format!("/api/jobs/{job_id}")))
            .header("X-API-Key", ORG1_KEY)
            .send()
            .await
            .unwrap()
            .json()
            .await
            .unwrap();

        if job["state"] == "completed" || job["state"] == "failed" {
            return job;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }

    panic!("job {job_id} did not settle within timeout");
}

#[tokio::test]
async fn ready_needs_no_api_key() {
    let srv = TestServer::spawn().await;

    let res = reqwest::get(srv.url("/ready")).await.unwrap();
    assert_eq!(res.status(), StatusCode::OK);
}

#[tokio::test]
async fn api_routes_require_a_valid_api_key() {
    let srv = TestServer::spawn().await;
    let client = reqwest::Client::new();

    let res = client.get(srv.url("/api/jobs")).send().await.unwrap();
    assert_eq!(res.status(), StatusCode::UNAUTHORIZED);
    let body: serde_json::Value = res.json().await.unwrap();
    assert_eq!(body["status"], "Unauthorized");
    assert_eq!(body["reason"], "NO_VALID_APIKEY");
    assert!(body["timestamp"].is_string());

    let res = client
        .get(srv.url("/api/jobs"))
        .header("X-API-Key", "wrong")
        .send()
        .await
        .unwrap();
    assert_eq!(res.status(), StatusCode::UNAUTHORIZED);
}

#[tokio::test]
async fn submitted_job_completes_and_its_transaction_is_valid() {
    let srv = TestServer::spawn().await;
    let client = reqwest::Client::new();

    let job_id = submit(&client, &srv, "CreateAsset", json!(["asset1", { "Owner": "Tom" }])).await;
    let job = job_eventually(&client, &srv, &job_id).await;

    assert_eq!(job["state"], "completed");
    assert_eq!(job["attempts"], 1);
    assert_eq!(job["identity"], "Org1");
    let tx_id = job["result"]["transactionId"].as_str().unwrap().to_string();
    assert_eq!(job["transactionIds"], json!([tx_id]));
    assert_eq!(job["result"]["validationCode"], "VALID");

    let res = client
        .get(srv.url(&format!("/api/transactions/{tx_id}")))
        .header("X-API-Key", ORG2_KEY)
        .send()
        .await
        .unwrap();
    assert_eq!(res.status(), StatusCode::OK);
    let body: serde_json::Value = res.json().await.unwrap();
    assert_eq!(body, json!({ "transactionId": tx_id, "validationCode": "VALID" }));

    let res = client
        .post(srv.url("/api/evaluate"))
        .header("X-API-Key", ORG2_KEY)
        .json(&json!({ "transactionName": "ReadAsset", "args": ["asset1"] }))
        .send()
        .await
        .unwrap();
    assert_eq!(res.status(), StatusCode::OK);
    let asset: serde_json::Value = res.json().await.unwrap();
    assert_eq!(asset["Owner"], "Tom");
}

#[tokio::test]
async fn retried_job_reports_every_attempt() {
    let srv = TestServer::spawn().await;
    let client = reqwest::Client::new();
    srv.ledger.inject("CreateAsset", [Fault::Unavailable]);

    let job_id = submit(&client, &srv, "CreateAsset", json!(["asset1", "{}"])).await;
    let job = job_eventually(&client, &srv, &job_id).await;

    assert_eq!(job["state"], "completed");
    assert_eq!(job["attempts"], 2);
    assert_eq!(job["maxAttempts"], 5);
}

#[tokio::test]
async fn business_failures_are_reported_on_the_job() {
    let srv = TestServer::spawn().await;
    let client = reqwest::Client::new();

    let job_id = submit(&client, &srv, "DeleteAsset", json!(["missing"])).await;
    let job = job_eventually(&client, &srv, &job_id).await;

    assert_eq!(job["state"], "failed");
    assert_eq!(job["error"]["class"], "BUSINESS_ERROR");
    assert_eq!(job["error"]["business_kind"], "not_found");
}

#[tokio::test]
async fn unknown_things_are_not_found() {
    let srv = TestServer::spawn().await;
    let client = reqwest::Client::new();

    let res = client
        .get(srv.url("/api/jobs/0190e9a8-5c2a-7000-8000-000000000000"))
        .header("X-API-Key", ORG1_KEY)
        .send()
        .await
        .unwrap();
    assert_eq!(res.status(), StatusCode::NOT_FOUND);

    let res = client
        .post(srv.url("/api/evaluate"))
        .header("X-API-Key", ORG1_KEY)
        .json(&json!({ "transactionName": "ReadAsset", "args": ["missing"] }))
        .send()
        .await
        .unwrap();
    assert_eq!(res.status(), StatusCode::NOT_FOUND);

    let res = client
        .get(srv.url("/api/transactions/abc123"))
        .header("X-API-Key", ORG1_KEY)
        .send()
        .await
        .unwrap();
    assert_eq!(res.status(), StatusCode::NOT_FOUND);
}

#[tokio::test]
async fn empty_transaction_name_is_rejected() {
    let srv = TestServer::spawn().await;
    let client = reqwest::Client::new();

    let res = client
        .post(srv.url("/api/jobs"))
        .header("X-API-Key", ORG1_KEY)
        .json(&json!({ "transactionName": "  ", "args": [] }))
        .send()
        .await
        .unwrap();
    assert_eq!(res.status(), StatusCode::BAD_REQUEST);
}

#[tokio::test]
async fn liveness_follows_the_ledger() {
    let srv = TestServer::spawn().await;

    let res = reqwest::get(srv.url("/live")).await.unwrap();
    assert_eq!(res.status(), StatusCode::OK);

    srv.ledger.set_system_unavailable(true);
    let res = reqwest::get(srv.url("/live")).await.unwrap();
    assert_eq!(res.status(), StatusCode::SERVICE_UNAVAILABLE);
}

#[tokio::test]
async fn job_stats_count_each_state() {
    let srv = TestServer::spawn().await;
    let client = reqwest::Client::new();

    let job_id = submit(&client, &srv, "CreateAsset", json!(["asset1", "{}"])).await;
    job_eventually(&client, &srv, &job_id).await;

    let stats: serde_json::Value = client
        .get(srv.url("/api/jobs"))
        .header("X-API-Key", ORG1_KEY)
        .send()
        .await
        .unwrap()
        .json()
        .await
        .unwrap();
    assert_eq!(
        stats,
        json!({ "queued": 0, "active": 0, "delayed": 0, "completed": 1, "failed": 0 })
    );
}
