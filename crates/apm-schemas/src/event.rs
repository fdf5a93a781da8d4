use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;

// ---------------------------------------------------------------------------
// Closed enums
// ---------------------------------------------------------------------------

/// The closed set of telemetry event types.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EventType {
    MessageCreated,
    RunStarted,
    RunCompleted,
    LocalHandoff,
}

impl EventType {
    pub fn as_str(&self) -> &'static str {
        match self {
            EventType::MessageCreated => "message_created",
            EventType::RunStarted => "run_started",
            EventType::RunCompleted => "run_completed",
            EventType::LocalHandoff => "local_handoff",
        }
    }

    /// `run_started` / `run_completed` require `run_id` on the envelope.
    pub fn requires_run_id(&self) -> bool {
        matches!(self, EventType::RunStarted | EventType::RunCompleted)
    }
}

/// Terminal status of a completed run.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RunStatus {
    Success,
    Fail,
    Timeout,
    Cancelled,
}

impl RunStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            RunStatus::Success => "success",
            RunStatus::Fail => "fail",
            RunStatus::Timeout => "timeout",
            RunStatus::Cancelled => "cancelled",
        }
    }

    pub fn is_success(&self) -> bool {
        matches!(self, RunStatus::Success)
    }
}

/// Failure classification attached to non-success runs.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorKind {
    ToolError,
    ModelError,
    Timeout,
    Unknown,
}

impl ErrorKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            ErrorKind::ToolError => "tool_error",
            ErrorKind::ModelError => "model_error",
            ErrorKind::Timeout => "timeout",
            ErrorKind::Unknown => "unknown",
        }
    }
}

/// How a local handoff delivered the agent's work product.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum HandoffMethod {
    Teleport,
    Download,
    CopyPatch,
    Other,
}

impl HandoffMethod {
    pub fn as_str(&self) -> &'static str {
        match self {
            HandoffMethod::Teleport => "teleport",
            HandoffMethod::Download => "download",
            HandoffMethod::CopyPatch => "copy_patch",
            HandoffMethod::Other => "other",
        }
    }
}

// ---------------------------------------------------------------------------
// Typed payloads
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MessageCreatedPayload {
    pub content: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RunCompletedPayload {
    pub status: RunStatus,
    pub duration_ms: i64,
    /// Decimal string on the wire (e.g. `"0.05"`); converted to integer
    /// micros before any arithmetic. See [`crate::money::cost_to_micros`].
    pub cost: String,
    pub input_tokens: i64,
    pub output_tokens: i64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error_type: Option<ErrorKind>,
}

impl RunCompletedPayload {
    /// Cost in integer micros (1 unit = 1_000_000 micros).
    pub fn cost_micros(&self) -> Result<i64, crate::money::MoneyError> {
        crate::money::cost_to_micros(&self.cost)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LocalHandoffPayload {
    pub method: HandoffMethod,
}

/// Typed view of an event: variant per `event_type`, each carrying its
/// payload. Projection is exhaustive matching over this enum.
#[derive(Debug, Clone)]
pub enum EventKind {
    MessageCreated(MessageCreatedPayload),
    RunStarted,
    RunCompleted(RunCompletedPayload),
    LocalHandoff(LocalHandoffPayload),
}

impl EventKind {
    pub fn event_type(&self) -> EventType {
        match self {
            EventKind::MessageCreated(_) => EventType::MessageCreated,
            EventKind::RunStarted => EventType::RunStarted,
            EventKind::RunCompleted(_) => EventType::RunCompleted,
            EventKind::LocalHandoff(_) => EventType::LocalHandoff,
        }
    }
}

// ---------------------------------------------------------------------------
// Envelope
// ---------------------------------------------------------------------------

/// One event as received on the wire, payload still untyped.
///
/// `occurred_at` must parse as an RFC 3339 instant; everything else about
/// the payload is checked by [`crate::validate::typed_payload`].
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EventWire {
    pub event_id: String,
    pub org_id: String,
    pub occurred_at: DateTime<Utc>,
    pub event_type: EventType,
    pub session_id: String,
    #[serde(default)]
    pub user_id: Option<String>,
    #[serde(default)]
    pub run_id: Option<String>,
    #[serde(default)]
    pub payload: Value,
}

/// A fully validated event, ready for durable enqueue.
///
/// Carries both the typed view (`kind`) and the raw payload exactly as
/// received: the raw value is what gets persisted into `events_raw`, and
/// the pipeline re-types it at projection time.
#[derive(Debug, Clone)]
pub struct ValidEvent {
    pub event_id: String,
    pub org_id: String,
    pub occurred_at: DateTime<Utc>,
    pub session_id: String,
    pub user_id: Option<String>,
    pub run_id: Option<String>,
    pub kind: EventKind,
    pub payload: Value,
}

impl ValidEvent {
    pub fn event_type(&self) -> EventType {
        self.kind.event_type()
    }
}
