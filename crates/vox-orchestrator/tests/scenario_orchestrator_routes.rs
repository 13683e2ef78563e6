//! In-process scenario tests for vox-orchestrator HTTP endpoints.
//!
//! Drives `routes::build_router` via `tower::ServiceExt::oneshot` against an
//! in-memory Registry and a scripted mock Provider Client — no network I/O,
//! no Postgres required.

use std::sync::Arc;

use axum::http::{Request, StatusCode};
use http_body_util::BodyExt;
use tower::ServiceExt;

use async_trait::async_trait;
use vox_config::OrchestratorConfig;
use vox_engine::PersistencePort;
use vox_orchestrator::{routes, state::AppState};
use vox_provider::mock::{MockProviderClient, Scenario};
use vox_registry::InMemoryRegistry;
use vox_schemas::{BindingId, OwnerId, TransactionRecord};

#[derive(Clone)]
struct NoopPersistence;

#[async_trait]
impl PersistencePort for NoopPersistence {
    async fn upsert_transaction(&self, _record: &TransactionRecord) -> Result<(), anyhow::Error> {
        Ok(())
    }
    async fn upsert_snapshot(&self, _record: &TransactionRecord) -> Result<(), anyhow::Error> {
        Ok(())
    }
}

type TestState = AppState<Arc<InMemoryRegistry>, Arc<MockProviderClient>, NoopPersistence>;

fn config() -> OrchestratorConfig {
    OrchestratorConfig {
        worker_interval_ms_default: 50,
        max_concurrent_calls: 50,
        max_concurrent_per_server: 2,
        lock_ttl_ms: 5_000,
        heartbeat_ms: 1_000,
        otp_timeout_ms: 2_000,
        database_url: "unused-in-tests".to_string(),
    }
}

fn make_router() -> (axum::Router, Arc<TestState>) {
    let registry = Arc::new(InMemoryRegistry::new());
    let provider = Arc::new(MockProviderClient::new());
    let owner = OwnerId::new("test-host", 1, "nonce-a");
    let st = Arc::new(AppState::new(registry, provider, NoopPersistence, owner, config()));
    (routes::build_router(st.clone()), st)
}

async fn call(router: axum::Router, req: Request<axum::body::Body>) -> (StatusCode, bytes::Bytes) {
    let resp = router.oneshot(req).await.expect("oneshot failed");
    let status = resp.status();
    let body = resp.into_body().collect().await.expect("body collect failed").to_bytes();
    (status, body)
}

fn parse_json(b: bytes::Bytes) -> serde_json::Value {
    serde_json::from_slice(&b).expect("body is not valid JSON")
}

fn json_request(method: &str, uri: &str, body: serde_json::Value) -> Request<axum::body::Body> {
    Request::builder()
        .method(method)
        .uri(uri)
        .header("content-type", "application/json")
        .body(axum::body::Body::from(serde_json::to_vec(&body).unwrap()))
        .unwrap()
}

#[tokio::test]
async fn healthz_returns_200_ok_true() {
    let (router, _) = make_router();
    let req = Request::builder().method("GET").uri("/healthz").body(axum::body::Body::empty()).unwrap();
    let (status, body) = call(router, req).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(parse_json(body)["ok"], true);
}

#[tokio::test]
async fn build_info_reports_service_name() {
    let (router, _) = make_router();
    let req = Request::builder()
        .method("GET")
        .uri("/v1/orchestration/build-info")
        .body(axum::body::Body::empty())
        .unwrap();
    let (status, body) = call(router, req).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(parse_json(body)["service"], "vox-orchestrator");
}

#[tokio::test]
async fn start_then_status_reports_running() {
    let (router, st) = make_router();
    let binding = uuid::Uuid::new_v4();

    // Script a sufficient balance with no terminal status, so the spawned
    // worker's first cycle sits in the `Processing` retry loop (see
    // `EngineConfig::status_retry_delay`) long enough to be observed still
    // `running` by the assertions below, instead of racing to completion.
    st.provider.script(
        BindingId(binding),
        Scenario {
            balance: 200_000,
            trx_id: "TRX1".into(),
            status_sequence: vec![],
            otp_accepted: true,
            fail_start_transport: false,
        },
    );

    let start_body = serde_json::json!({
        "binding_ids": [binding],
        "product_id": "PULSA_10K",
        "email": "user@example.com",
        "limit_harga": 100_000,
        "interval_ms": 500,
        "max_retry_status": 2,
        "cooldown_on_error_ms": 500,
    });
    let (status, body) = call(router.clone(), json_request("POST", "/v1/orchestration/start", start_body)).await;
    assert_eq!(status, StatusCode::OK);
    let json = parse_json(body);
    assert_eq!(json["items"][0]["ok"], true);

    let status_body = serde_json::json!({"binding_ids": [binding]});
    let (status, body) = call(router, json_request("POST", "/v1/orchestration/status", status_body)).await;
    assert_eq!(status, StatusCode::OK);
    let json = parse_json(body);
    assert_eq!(json["items"][0]["state"], "running");

    // Let the locally-spawned worker's task start and register itself so the
    // drop at the end of this test doesn't race a still-initializing task.
    tokio::time::sleep(std::time::Duration::from_millis(20)).await;
    assert!(st.local_workers.lock().await.contains_key(&BindingId(binding)));
}

#[tokio::test]
async fn stop_with_no_worker_running_is_a_no_op_that_sets_stopped() {
    let (router, _) = make_router();
    let binding = uuid::Uuid::new_v4();

    let stop_body = serde_json::json!({"binding_ids": [binding], "reason": "operator_stop"});
    let (status, body) = call(router.clone(), json_request("POST", "/v1/orchestration/stop", stop_body)).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(parse_json(body)["items"][0]["ok"], true);

    let status_body = serde_json::json!({"binding_ids": [binding]});
    let (status, body) = call(router, json_request("POST", "/v1/orchestration/status", status_body)).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(parse_json(body)["items"][0]["state"], "stopped");
}

#[tokio::test]
async fn pause_is_a_no_op_when_binding_is_not_running() {
    let (router, _) = make_router();
    let binding = uuid::Uuid::new_v4();

    let pause_body = serde_json::json!({"binding_ids": [binding], "reason": null});
    let (status, body) = call(router, json_request("POST", "/v1/orchestration/pause", pause_body)).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(parse_json(body)["items"][0]["ok"], false);
}

#[tokio::test]
async fn monitor_reports_zero_totals_on_a_fresh_registry() {
    let (router, _) = make_router();
    let req = Request::builder()
        .method("GET")
        .uri("/v1/orchestration/monitor")
        .body(axum::body::Body::empty())
        .unwrap();
    let (status, body) = call(router, req).await;
    assert_eq!(status, StatusCode::OK);
    let json = parse_json(body);
    assert_eq!(json["total_workers"], 0);
    assert_eq!(json["active_workers"], 0);
}

#[tokio::test]
async fn otp_submission_is_accepted_once_then_rejected_while_pending() {
    let (router, _) = make_router();
    let binding = uuid::Uuid::new_v4();
    let body = serde_json::json!({"binding_id": binding, "otp": "123456"});

    let (status, resp_body) =
        call(router.clone(), json_request("POST", "/v1/orchestration/otp", body.clone())).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(parse_json(resp_body)["accepted"], true);

    let (status, resp_body) = call(router, json_request("POST", "/v1/orchestration/otp", body)).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(parse_json(resp_body)["accepted"], false);
}
