//! In-process scenario tests for apm-daemon HTTP validation paths.
//!
//! These tests spin up the Axum router **without** binding a TCP socket or
//! reaching a database: the pool is built with `connect_lazy`, and every
//! request here is rejected before the first query. Each test calls
//! `routes::build_router` and drives it via `tower::ServiceExt::oneshot`.

use std::sync::Arc;

use apm_daemon::{routes, state};
use axum::http::{Request, StatusCode};
use http_body_util::BodyExt;
use serde_json::{json, Value};
use tower::ServiceExt; // oneshot

// ---------------------------------------------------------------------------
// Helpers
// ---------------------------------------------------------------------------

/// Build a fresh in-process router over a lazy (never-connected) pool.
fn make_router() -> axum::Router {
    let pool = sqlx::postgres::PgPoolOptions::new()
        .connect_lazy("postgres://localhost/apm_never_connected")
        .expect("lazy pool");
    routes::build_router(Arc::new(state::AppState::new(pool)))
}

/// Drive the router with a single request and return (status, body_bytes).
async fn call(router: axum::Router, req: Request<axum::body::Body>) -> (StatusCode, bytes::Bytes) {
    let resp = router.oneshot(req).await.expect("oneshot failed");
    let status = resp.status();
    let body = resp
        .into_body()
        .collect()
        .await
        .expect("body collect failed")
        .to_bytes();
    (status, body)
}

fn parse_json(b: bytes::Bytes) -> Value {
    serde_json::from_slice(&b).expect("body is not valid JSON")
}

fn post_events(body: Value) -> Request<axum::body::Body> {
    Request::builder()
        .method("POST")
        .uri("/events")
        .header("content-type", "application/json")
        .body(axum::body::Body::from(body.to_string()))
        .expect("request build failed")
}

fn valid_event(event_id: &str) -> Value {
    json!({
        "event_id": event_id,
        "org_id": "o1",
        "occurred_at": "2024-06-01T10:00:00Z",
        "event_type": "run_completed",
        "session_id": "s1",
        "user_id": "u1",
        "run_id": "r1",
        "payload": {
            "status": "success",
            "duration_ms": 5000,
            "cost": "0.05",
            "input_tokens": 1000,
            "output_tokens": 500
        }
    })
}

// ---------------------------------------------------------------------------
// GET /health
// ---------------------------------------------------------------------------

#[tokio::test]
async fn health_returns_ok_and_service_name() {
    let (status, body) = call(
        make_router(),
        Request::builder()
            .method("GET")
            .uri("/health")
            .body(axum::body::Body::empty())
            .unwrap(),
    )
    .await;

    assert_eq!(status, StatusCode::OK);
    let json = parse_json(body);
    assert_eq!(json["status"], "ok");
    assert_eq!(json["service"], "apm-daemon");
}

// ---------------------------------------------------------------------------
// POST /events: batch-level rejections
// ---------------------------------------------------------------------------

#[tokio::test]
async fn batch_of_101_events_is_rejected_wholesale() {
    let events: Vec<Value> = (0..101).map(|i| valid_event(&format!("e{i}"))).collect();
    let (status, body) = call(make_router(), post_events(json!({ "events": events }))).await;

    assert_eq!(status, StatusCode::BAD_REQUEST);
    let json = parse_json(body);
    assert_eq!(json["accepted"], 0);
    assert_eq!(json["event_ids"], json!([]));
    assert!(
        json["errors"][0]["message"]
            .as_str()
            .unwrap_or("")
            .contains("exceeds limit"),
        "batch-size violation must be named: {json}"
    );
}

#[tokio::test]
async fn empty_batch_is_rejected() {
    let (status, body) = call(make_router(), post_events(json!({ "events": [] }))).await;

    assert_eq!(status, StatusCode::BAD_REQUEST);
    assert_eq!(parse_json(body)["accepted"], 0);
}

#[tokio::test]
async fn missing_events_field_is_a_400_with_our_error_shape() {
    let (status, body) = call(make_router(), post_events(json!({ "payload": [] }))).await;

    assert_eq!(status, StatusCode::BAD_REQUEST);
    let json = parse_json(body);
    assert_eq!(json["accepted"], 0);
    assert!(
        json["errors"][0]["message"]
            .as_str()
            .unwrap_or("")
            .contains("events"),
        "error must point at the missing field: {json}"
    );
}

// ---------------------------------------------------------------------------
// POST /events: single bad event rejects the batch
// ---------------------------------------------------------------------------

#[tokio::test]
async fn one_malformed_event_rejects_the_whole_batch() {
    let mut bad = valid_event("e-bad");
    bad["payload"]["cost"] = json!("-0.01");

    let (status, body) = call(
        make_router(),
        post_events(json!({ "events": [valid_event("e-good"), bad] })),
    )
    .await;

    assert_eq!(status, StatusCode::BAD_REQUEST);
    let json = parse_json(body);
    assert_eq!(json["accepted"], 0, "no partial acceptance");
    assert_eq!(json["event_ids"], json!([]));
    assert_eq!(json["errors"][0]["event_id"], "e-bad");
}

#[tokio::test]
async fn run_completed_without_run_id_is_rejected() {
    let mut bad = valid_event("e1");
    bad.as_object_mut().unwrap().remove("run_id");

    let (status, body) = call(make_router(), post_events(json!({ "events": [bad] }))).await;

    assert_eq!(status, StatusCode::BAD_REQUEST);
    let json = parse_json(body);
    assert!(
        json["errors"][0]["message"]
            .as_str()
            .unwrap_or("")
            .contains("run_id"),
        "{json}"
    );
}

// ---------------------------------------------------------------------------
// Unknown routes return 404
// ---------------------------------------------------------------------------

#[tokio::test]
async fn unknown_route_returns_404() {
    let (status, _) = call(
        make_router(),
        Request::builder()
            .method("GET")
            .uri("/does_not_exist")
            .body(axum::body::Body::empty())
            .unwrap(),
    )
    .await;
    assert_eq!(status, StatusCode::NOT_FOUND);
}
