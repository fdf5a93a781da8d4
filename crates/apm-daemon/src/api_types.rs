//! Request and response types for all apm-daemon HTTP endpoints.
//!
//! These types are `Serialize + Deserialize` so they can be JSON-encoded
//! by Axum and decoded by tests.  No business logic lives here.

use serde::{Deserialize, Serialize};

// ---------------------------------------------------------------------------
// POST /events
// ---------------------------------------------------------------------------

/// One validation failure, attributed to an event when its id was
/// recoverable from the raw value.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct IngestErrorBody {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub event_id: Option<String>,
    pub message: String,
}

/// Response for the ingest endpoint, on every status code.
///
/// On 200 `accepted` counts the whole batch; duplicates are silent
/// storage-level no-ops and still count. On 400/500 `accepted` is 0.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct IngestResponse {
    pub accepted: usize,
    pub event_ids: Vec<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub errors: Option<Vec<IngestErrorBody>>,
}

// ---------------------------------------------------------------------------
// GET /health
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HealthResponse {
    pub status: &'static str,
    pub service: &'static str,
}

// ---------------------------------------------------------------------------
// GET /status
// ---------------------------------------------------------------------------

/// Operator visibility: connectivity plus queue depth.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StatusResponse {
    pub service: String,
    pub version: String,
    pub db_ok: bool,
    /// Queue rows with `processed_at IS NULL`.
    pub queue_depth: i64,
    /// Unprocessed rows carrying a `last_error` (retrying).
    pub errored: i64,
    pub daemon_uptime_secs: u64,
}

/// Body for unexpected daemon-side failures on read endpoints.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ErrorResponse {
    pub error: String,
}
