//! Integration tests for the HTTP API.

use std::sync::Arc;
use std::time::Duration;

use axum::body::Body;
use axum::http::{header, Request, StatusCode};
use axum::Router;
use http_body_util::BodyExt;
use serde_json::{json, Value};
use tower::ServiceExt;

use sessionbox::http_server::build_app;
use sessionbox::lock::DistributedLock;
use sessionbox::state::AppState;
use sessionbox::store::SqliteStore;

mod common;

use common::Harness;

fn app(harness: &Harness) -> Router {
    build_app(harness.app_state())
}

async fn send(app: &Router, request: Request<Body>) -> (StatusCode, Value, Option<String>) {
    let response = app.clone().oneshot(request).await.unwrap();
    let status = response.status();
    let retry_after = response
        .headers()
        .get(header::RETRY_AFTER)
        .map(|v| v.to_str().unwrap().to_string());
    let body = response.into_body().collect().await.unwrap().to_bytes();
    let json = serde_json::from_slice(&body).unwrap_or(Value::Null);
    (status, json, retry_after)
}

fn post_json(uri: &str, body: Value) -> Request<Body> {
    Request::post(uri)
        .header(header::CONTENT_TYPE, "application/json")
        .body(Body::from(body.to_string()))
        .unwrap()
}

fn put_json(uri: &str, body: Value) -> Request<Body> {
    Request::put(uri)
        .header(header::CONTENT_TYPE, "application/json")
        .body(Body::from(body.to_string()))
        .unwrap()
}

// ============================================================================
// Health
// ============================================================================

#[tokio::test]
async fn test_health() {
    let harness = Harness::new();
    let response = app(&harness)
        .oneshot(Request::get("/health").body(Body::empty()).unwrap())
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::OK);
    let body = response.into_body().collect().await.unwrap().to_bytes();
    assert_eq!(&body[..], b"OK");
}

// ============================================================================
// Sandbox lifecycle
// ============================================================================

#[tokio::test]
async fn test_create_and_terminate_sandbox() {
    let harness = Harness::new();
    let app = app(&harness);

    let (status, json, _) = send(&app, post_json("/sessions/s1/sandbox", json!({ "language": "golang" }))).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(json["session_id"], "s1");
    assert_eq!(json["language"], "go");
    assert_eq!(json["volume"], "volume-s1");
    assert_eq!(json["status"], "ready");
    let sandbox_id = json["sandbox_id"].as_str().unwrap().to_string();

    // Without a body the cached sandbox is returned.
    let request = Request::post("/sessions/s1/sandbox").body(Body::empty()).unwrap();
    let (status, json, _) = send(&app, request).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(json["sandbox_id"], sandbox_id.as_str());

    let request = Request::delete("/sessions/s1/sandbox").body(Body::empty()).unwrap();
    let (status, json, _) = send(&app, request).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(json["terminated"], true);
    assert_eq!(harness.provider.live_sandboxes(), 0);
}

#[tokio::test]
async fn test_lock_timeout_is_503_with_retry_after() {
    let harness = Harness::new();
    let mut config = harness.config.clone();
    config.timeouts.lock_wait = Duration::from_millis(50);
    let app = build_app(AppState::new(harness.manager_with(config)));

    let other = DistributedLock::new(
        Arc::new(SqliteStore::open(&harness.config.database).unwrap()),
        Duration::from_secs(60),
        Duration::from_secs(1),
        Duration::from_millis(10),
    );
    let held = other.acquire("s1").await.unwrap();

    let (status, json, retry_after) = send(&app, post_json("/sessions/s1/sandbox", json!({}))).await;
    assert_eq!(status, StatusCode::SERVICE_UNAVAILABLE);
    assert_eq!(json["error"], sessionbox::error::UNAVAILABLE_MESSAGE);
    assert_eq!(json["retryable"], true);
    assert!(retry_after.is_some());
    held.release().await;
}

#[tokio::test]
async fn test_provisioning_failure_hides_provider_details() {
    let harness = Harness::new();
    harness.provider.fail_next_creates(1);
    let app = app(&harness);

    let (status, json, retry_after) = send(&app, post_json("/sessions/s1/sandbox", json!({}))).await;
    assert_eq!(status, StatusCode::SERVICE_UNAVAILABLE);
    assert_eq!(json["error"], sessionbox::error::UNAVAILABLE_MESSAGE);
    assert!(!json.to_string().contains("injected"));
    assert!(retry_after.is_none());
}

// ============================================================================
// Commands and files
// ============================================================================

#[tokio::test]
async fn test_run_command() {
    let harness = Harness::new();
    let app = app(&harness);

    let (status, json, _) = send(&app, post_json("/sessions/s1/run", json!({ "command": "echo hello" }))).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(json["success"], true);
    assert_eq!(json["stdout"], "hello\n");
    assert_eq!(json["exit_code"], 0);

    let (status, json, _) = send(&app, post_json("/sessions/s1/run", json!({ "command": "rm -rf /" }))).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(json["success"], false);
    assert!(json["blocked"].is_string());

    let (status, _, _) = send(&app, post_json("/sessions/s1/run", json!({ "command": "  " }))).await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
}

#[tokio::test]
async fn test_write_read_and_tree() {
    let harness = Harness::new();
    let app = app(&harness);

    let (status, json, _) = send(
        &app,
        put_json("/sessions/s1/files", json!({ "path": "src/app.py", "content": "print(1)\n" })),
    )
    .await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(json["success"], true);

    let request = Request::get("/sessions/s1/files?path=/workspace/src/app.py")
        .body(Body::empty())
        .unwrap();
    let (status, json, _) = send(&app, request).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(json["content"], "print(1)\n");

    let request = Request::get("/sessions/s1/files?path=missing.txt").body(Body::empty()).unwrap();
    let (status, _, _) = send(&app, request).await;
    assert_eq!(status, StatusCode::NOT_FOUND);

    let request = Request::get("/sessions/s1/tree").body(Body::empty()).unwrap();
    let (status, json, _) = send(&app, request).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(json[0]["name"], "src");
    assert_eq!(json[0]["type"], "directory");
    assert_eq!(json[0]["children"][0]["path"], "/workspace/src/app.py");
    assert_eq!(json[0]["children"][0]["size"], 9);

    let request = Request::get("/sessions/s1/tree?root=/workspace/../etc")
        .body(Body::empty())
        .unwrap();
    let (status, json, _) = send(&app, request).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(json, json!([]));
}
