//! Axum router and all HTTP handlers for apm-daemon.
//!
//! `build_router` is the single entry point; `main.rs` calls it and attaches
//! middleware layers.  All handlers are `pub(crate)` so the scenario tests in
//! `tests/` can compose the router directly.

use std::sync::Arc;

use axum::{
    extract::State,
    http::StatusCode,
    response::{IntoResponse, Response},
    routing::{get, post},
    Json, Router,
};
use serde_json::Value;
use tracing::{error, info};

use apm_schemas::validate_batch;

use crate::{
    api_types::{ErrorResponse, HealthResponse, IngestErrorBody, IngestResponse, StatusResponse},
    state::{uptime_secs, AppState},
};

// ---------------------------------------------------------------------------
// Router
// ---------------------------------------------------------------------------

/// Build the complete application router wired to the given shared state.
///
/// Middleware layers (tracing) are **not** applied here; `main.rs` attaches
/// them after this call so tests can use the bare router.
pub fn build_router(state: Arc<AppState>) -> Router {
    Router::new()
        .route("/events", post(ingest))
        .route("/health", get(health))
        .route("/status", get(status_handler))
        .with_state(state)
}

// ---------------------------------------------------------------------------
// POST /events
// ---------------------------------------------------------------------------

/// Accept a batch of telemetry events.
///
/// All-or-nothing: any malformed event (or a batch outside 1..=100) rejects
/// the whole batch with 400 and nothing is persisted. On 200 every returned
/// event id is durably in `events_raw` + `events_queue`; duplicates were
/// storage-level no-ops. Projection never happens synchronously here.
pub(crate) async fn ingest(State(st): State<Arc<AppState>>, Json(body): Json<Value>) -> Response {
    // The body is taken as raw JSON so a missing/ill-typed `events` field is
    // a 400 with our error shape rather than an extractor rejection.
    let Some(events) = body.get("events").and_then(Value::as_array) else {
        return validation_failure(vec![IngestErrorBody {
            event_id: None,
            message: "request body must be an object with an 'events' array".to_string(),
        }]);
    };

    let accepted = match validate_batch(events) {
        Ok(accepted) => accepted,
        Err(errors) => {
            return validation_failure(
                errors
                    .into_iter()
                    .map(|e| IngestErrorBody {
                        event_id: e.event_id,
                        message: e.error.to_string(),
                    })
                    .collect(),
            );
        }
    };

    let event_ids: Vec<String> = accepted.iter().map(|e| e.event_id.clone()).collect();

    match apm_db::enqueue_batch(&st.pool, &accepted).await {
        Ok(()) => {
            info!(events = accepted.len(), "batch enqueued");
            (
                StatusCode::OK,
                Json(IngestResponse {
                    accepted: accepted.len(),
                    event_ids,
                    errors: None,
                }),
            )
                .into_response()
        }
        Err(e) => {
            error!(error = %format!("{e:#}"), "enqueue failed");
            (
                StatusCode::INTERNAL_SERVER_ERROR,
                Json(IngestResponse {
                    accepted: 0,
                    event_ids: Vec::new(),
                    errors: Some(vec![IngestErrorBody {
                        event_id: None,
                        message: "storage failure; retry the batch".to_string(),
                    }]),
                }),
            )
                .into_response()
        }
    }
}

fn validation_failure(errors: Vec<IngestErrorBody>) -> Response {
    (
        StatusCode::BAD_REQUEST,
        Json(IngestResponse {
            accepted: 0,
            event_ids: Vec::new(),
            errors: Some(errors),
        }),
    )
        .into_response()
}

// ---------------------------------------------------------------------------
// GET /health
// ---------------------------------------------------------------------------

pub(crate) async fn health(State(st): State<Arc<AppState>>) -> impl IntoResponse {
    (
        StatusCode::OK,
        Json(HealthResponse {
            status: "ok",
            service: st.build.service,
        }),
    )
}

// ---------------------------------------------------------------------------
// GET /status
// ---------------------------------------------------------------------------

/// Operator endpoint: DB connectivity plus queue depth and retrying-row
/// count. Backed by live queries, so it is also a cheap end-to-end probe.
pub(crate) async fn status_handler(State(st): State<Arc<AppState>>) -> Response {
    let db = match apm_db::status(&st.pool).await {
        Ok(db) => db,
        Err(e) => {
            error!(error = %format!("{e:#}"), "status query failed");
            return (
                StatusCode::INTERNAL_SERVER_ERROR,
                Json(ErrorResponse {
                    error: "database unreachable".to_string(),
                }),
            )
                .into_response();
        }
    };

    let (queue_depth, errored) = match (
        apm_db::count_unprocessed(&st.pool).await,
        apm_db::count_errored(&st.pool).await,
    ) {
        (Ok(depth), Ok(errored)) => (depth, errored),
        (Err(e), _) | (_, Err(e)) => {
            error!(error = %format!("{e:#}"), "queue depth query failed");
            return (
                StatusCode::INTERNAL_SERVER_ERROR,
                Json(ErrorResponse {
                    error: "queue depth unavailable".to_string(),
                }),
            )
                .into_response();
        }
    };

    (
        StatusCode::OK,
        Json(StatusResponse {
            service: st.build.service.to_string(),
            version: st.build.version.to_string(),
            db_ok: db.ok && db.has_queue_table,
            queue_depth,
            errored,
            daemon_uptime_secs: uptime_secs(),
        }),
    )
        .into_response()
}
