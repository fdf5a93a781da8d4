//! Ingest batch validation.
//!
//! `validate_batch` is the single entry point used by the ingest endpoint.
//! A batch is rejected wholesale when it is empty, exceeds
//! [`MAX_BATCH_SIZE`], or contains any malformed event; there is no
//! partial acceptance. Validation never touches the database.

use std::fmt;

use serde_json::Value;

use crate::event::{EventKind, EventType, EventWire, ValidEvent};
use crate::money::MoneyError;

/// Ingest limit: a batch may carry at most this many events.
pub const MAX_BATCH_SIZE: usize = 100;

// ---------------------------------------------------------------------------
// Error types
// ---------------------------------------------------------------------------

/// Reasons a batch or a single event fails validation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ValidationError {
    /// The batch contained no events.
    BatchEmpty,
    /// The batch exceeded [`MAX_BATCH_SIZE`].
    BatchTooLarge { len: usize },
    /// The envelope itself failed to deserialize (missing/ill-typed field,
    /// unknown `event_type`, unparsable `occurred_at`).
    BadEnvelope { detail: String },
    /// A required string field was present but empty.
    EmptyField { field: &'static str },
    /// `run_started` / `run_completed` without a `run_id`.
    MissingRunId { event_type: EventType },
    /// The payload did not match the shape required by the event type.
    BadPayload {
        event_type: EventType,
        detail: String,
    },
    /// A counter field that must be >= 0 was negative.
    NegativeCounter { field: &'static str, value: i64 },
    /// The cost string failed micros conversion.
    BadCost(MoneyError),
}

impl fmt::Display for ValidationError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ValidationError::BatchEmpty => write!(f, "batch contains no events"),
            ValidationError::BatchTooLarge { len } => {
                write!(f, "batch of {len} events exceeds limit of {MAX_BATCH_SIZE}")
            }
            ValidationError::BadEnvelope { detail } => {
                write!(f, "malformed event envelope: {detail}")
            }
            ValidationError::EmptyField { field } => {
                write!(f, "field '{field}' must be a non-empty string")
            }
            ValidationError::MissingRunId { event_type } => {
                write!(f, "event_type '{}' requires run_id", event_type.as_str())
            }
            ValidationError::BadPayload { event_type, detail } => {
                write!(
                    f,
                    "invalid payload for event_type '{}': {detail}",
                    event_type.as_str()
                )
            }
            ValidationError::NegativeCounter { field, value } => {
                write!(f, "payload field '{field}' must be >= 0, got {value}")
            }
            ValidationError::BadCost(e) => write!(f, "{e}"),
        }
    }
}

impl std::error::Error for ValidationError {}

/// A validation failure attributed to a single event where possible.
///
/// `event_id` is `None` for batch-level failures (empty, oversized) and for
/// events so malformed that no id could be recovered from the raw value.
#[derive(Debug, Clone)]
pub struct EventError {
    pub event_id: Option<String>,
    pub error: ValidationError,
}

impl fmt::Display for EventError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.event_id {
            Some(id) => write!(f, "event '{id}': {}", self.error),
            None => write!(f, "{}", self.error),
        }
    }
}

// ---------------------------------------------------------------------------
// Batch validation
// ---------------------------------------------------------------------------

/// Validate a raw ingest batch.
///
/// Returns every event typed and ready for enqueue, or the full list of
/// failures. Any failure rejects the whole batch.
pub fn validate_batch(raw: &[Value]) -> Result<Vec<ValidEvent>, Vec<EventError>> {
    if raw.is_empty() {
        return Err(vec![EventError {
            event_id: None,
            error: ValidationError::BatchEmpty,
        }]);
    }
    if raw.len() > MAX_BATCH_SIZE {
        return Err(vec![EventError {
            event_id: None,
            error: ValidationError::BatchTooLarge { len: raw.len() },
        }]);
    }

    let mut accepted = Vec::with_capacity(raw.len());
    let mut errors = Vec::new();

    for value in raw {
        match validate_event(value) {
            Ok(ev) => accepted.push(ev),
            Err(error) => errors.push(EventError {
                event_id: recover_event_id(value),
                error,
            }),
        }
    }

    if errors.is_empty() {
        Ok(accepted)
    } else {
        Err(errors)
    }
}

/// Validate a single raw event value.
pub fn validate_event(raw: &Value) -> Result<ValidEvent, ValidationError> {
    let wire: EventWire = serde_json::from_value(raw.clone()).map_err(|e| {
        ValidationError::BadEnvelope {
            detail: e.to_string(),
        }
    })?;

    require_non_empty("event_id", &wire.event_id)?;
    require_non_empty("org_id", &wire.org_id)?;
    require_non_empty("session_id", &wire.session_id)?;
    if let Some(user_id) = &wire.user_id {
        require_non_empty("user_id", user_id)?;
    }
    if let Some(run_id) = &wire.run_id {
        require_non_empty("run_id", run_id)?;
    }

    if wire.event_type.requires_run_id() && wire.run_id.is_none() {
        return Err(ValidationError::MissingRunId {
            event_type: wire.event_type,
        });
    }

    let kind = typed_payload(wire.event_type, &wire.payload)?;

    Ok(ValidEvent {
        event_id: wire.event_id,
        org_id: wire.org_id,
        occurred_at: wire.occurred_at,
        session_id: wire.session_id,
        user_id: wire.user_id,
        run_id: wire.run_id,
        kind,
        payload: wire.payload,
    })
}

/// Type a raw payload against its event type.
///
/// Shared between ingest validation and the projectors: the pipeline re-types
/// the persisted payload at projection time, and a failure there is a
/// projection error for that one event.
pub fn typed_payload(event_type: EventType, payload: &Value) -> Result<EventKind, ValidationError> {
    let bad = |detail: String| ValidationError::BadPayload { event_type, detail };

    match event_type {
        EventType::MessageCreated => {
            let p: crate::event::MessageCreatedPayload =
                serde_json::from_value(payload.clone()).map_err(|e| bad(e.to_string()))?;
            Ok(EventKind::MessageCreated(p))
        }
        EventType::RunStarted => Ok(EventKind::RunStarted),
        EventType::RunCompleted => {
            let p: crate::event::RunCompletedPayload =
                serde_json::from_value(payload.clone()).map_err(|e| bad(e.to_string()))?;
            require_counter("duration_ms", p.duration_ms)?;
            require_counter("input_tokens", p.input_tokens)?;
            require_counter("output_tokens", p.output_tokens)?;
            p.cost_micros().map_err(ValidationError::BadCost)?;
            Ok(EventKind::RunCompleted(p))
        }
        EventType::LocalHandoff => {
            let p: crate::event::LocalHandoffPayload =
                serde_json::from_value(payload.clone()).map_err(|e| bad(e.to_string()))?;
            Ok(EventKind::LocalHandoff(p))
        }
    }
}

fn require_non_empty(field: &'static str, value: &str) -> Result<(), ValidationError> {
    if value.is_empty() {
        return Err(ValidationError::EmptyField { field });
    }
    Ok(())
}

fn require_counter(field: &'static str, value: i64) -> Result<(), ValidationError> {
    if value < 0 {
        return Err(ValidationError::NegativeCounter { field, value });
    }
    Ok(())
}

fn recover_event_id(raw: &Value) -> Option<String> {
    raw.get("event_id")
        .and_then(Value::as_str)
        .filter(|s| !s.is_empty())
        .map(str::to_string)
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use crate::event::{EventKind, RunStatus};
    use serde_json::json;

    fn run_completed(event_id: &str) -> Value {
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

    // --- accepted batches ---

    #[test]
    fn accepts_a_well_formed_batch_of_each_type() {
        let batch = vec![
            json!({
                "event_id": "e1", "org_id": "o1",
                "occurred_at": "2024-06-01T10:00:00Z",
                "event_type": "message_created", "session_id": "s1",
                "user_id": "u1",
                "payload": { "content": "hello" }
            }),
            json!({
                "event_id": "e2", "org_id": "o1",
                "occurred_at": "2024-06-01T10:01:00Z",
                "event_type": "run_started", "session_id": "s1",
                "user_id": "u1", "run_id": "r1",
                "payload": {}
            }),
            run_completed("e3"),
            json!({
                "event_id": "e4", "org_id": "o1",
                "occurred_at": "2024-06-01T10:06:00Z",
                "event_type": "local_handoff", "session_id": "s1",
                "user_id": "u1",
                "payload": { "method": "teleport" }
            }),
        ];

        let accepted = validate_batch(&batch).expect("batch must validate");
        assert_eq!(accepted.len(), 4);

        match &accepted[2].kind {
            EventKind::RunCompleted(p) => {
                assert_eq!(p.status, RunStatus::Success);
                assert_eq!(p.cost_micros().unwrap(), 50_000);
            }
            other => panic!("expected RunCompleted, got {other:?}"),
        }
    }

    #[test]
    fn null_user_id_is_accepted() {
        let mut ev = run_completed("e1");
        ev["user_id"] = Value::Null;
        let accepted = validate_batch(&[ev]).expect("null user_id is valid");
        assert!(accepted[0].user_id.is_none());
    }

    // --- batch-level rejection ---

    #[test]
    fn empty_batch_is_rejected() {
        let errs = validate_batch(&[]).unwrap_err();
        assert_eq!(errs.len(), 1);
        assert_eq!(errs[0].error, ValidationError::BatchEmpty);
    }

    #[test]
    fn batch_of_101_is_rejected() {
        let batch: Vec<Value> = (0..101).map(|i| run_completed(&format!("e{i}"))).collect();
        let errs = validate_batch(&batch).unwrap_err();
        assert_eq!(errs[0].error, ValidationError::BatchTooLarge { len: 101 });
    }

    #[test]
    fn one_bad_event_rejects_the_whole_batch() {
        let mut bad = run_completed("e-bad");
        bad["payload"]["input_tokens"] = json!(-5);
        let batch = vec![run_completed("e-good"), bad];

        let errs = validate_batch(&batch).unwrap_err();
        assert_eq!(errs.len(), 1);
        assert_eq!(errs[0].event_id.as_deref(), Some("e-bad"));
        assert_eq!(
            errs[0].error,
            ValidationError::NegativeCounter {
                field: "input_tokens",
                value: -5
            }
        );
    }

    // --- envelope failures ---

    #[test]
    fn unknown_event_type_is_a_bad_envelope() {
        let mut ev = run_completed("e1");
        ev["event_type"] = json!("run_exploded");
        let errs = validate_batch(&[ev]).unwrap_err();
        assert!(matches!(errs[0].error, ValidationError::BadEnvelope { .. }));
        assert_eq!(errs[0].event_id.as_deref(), Some("e1"));
    }

    #[test]
    fn unparsable_occurred_at_is_a_bad_envelope() {
        let mut ev = run_completed("e1");
        ev["occurred_at"] = json!("yesterday-ish");
        let errs = validate_batch(&[ev]).unwrap_err();
        assert!(matches!(errs[0].error, ValidationError::BadEnvelope { .. }));
    }

    #[test]
    fn missing_session_id_is_a_bad_envelope() {
        let mut ev = run_completed("e1");
        ev.as_object_mut().unwrap().remove("session_id");
        let errs = validate_batch(&[ev]).unwrap_err();
        assert!(matches!(errs[0].error, ValidationError::BadEnvelope { .. }));
    }

    #[test]
    fn empty_org_id_is_rejected() {
        let mut ev = run_completed("e1");
        ev["org_id"] = json!("");
        let errs = validate_batch(&[ev]).unwrap_err();
        assert_eq!(errs[0].error, ValidationError::EmptyField { field: "org_id" });
    }

    // --- run_id requirement ---

    #[test]
    fn run_events_require_run_id() {
        for event_type in ["run_started", "run_completed"] {
            let mut ev = run_completed("e1");
            ev["event_type"] = json!(event_type);
            ev.as_object_mut().unwrap().remove("run_id");
            let errs = validate_batch(&[ev]).unwrap_err();
            assert!(
                matches!(errs[0].error, ValidationError::MissingRunId { .. }),
                "{event_type} without run_id must be rejected"
            );
        }
    }

    #[test]
    fn message_created_does_not_require_run_id() {
        let ev = json!({
            "event_id": "e1", "org_id": "o1",
            "occurred_at": "2024-06-01T10:00:00Z",
            "event_type": "message_created", "session_id": "s1",
            "payload": { "content": "hi" }
        });
        assert!(validate_batch(&[ev]).is_ok());
    }

    // --- payload failures ---

    #[test]
    fn message_created_requires_content() {
        let ev = json!({
            "event_id": "e1", "org_id": "o1",
            "occurred_at": "2024-06-01T10:00:00Z",
            "event_type": "message_created", "session_id": "s1",
            "payload": {}
        });
        let errs = validate_batch(&[ev]).unwrap_err();
        assert!(matches!(errs[0].error, ValidationError::BadPayload { .. }));
    }

    #[test]
    fn handoff_method_outside_closed_set_is_rejected() {
        let ev = json!({
            "event_id": "e1", "org_id": "o1",
            "occurred_at": "2024-06-01T10:00:00Z",
            "event_type": "local_handoff", "session_id": "s1",
            "payload": { "method": "carrier_pigeon" }
        });
        let errs = validate_batch(&[ev]).unwrap_err();
        assert!(matches!(errs[0].error, ValidationError::BadPayload { .. }));
    }

    #[test]
    fn run_completed_rejects_bad_cost() {
        let mut ev = run_completed("e1");
        ev["payload"]["cost"] = json!("0.1234567");
        let errs = validate_batch(&[ev]).unwrap_err();
        assert!(matches!(errs[0].error, ValidationError::BadCost(_)));
    }

    #[test]
    fn run_completed_rejects_unknown_status() {
        let mut ev = run_completed("e1");
        ev["payload"]["status"] = json!("exploded");
        let errs = validate_batch(&[ev]).unwrap_err();
        assert!(matches!(errs[0].error, ValidationError::BadPayload { .. }));
    }

    #[test]
    fn run_completed_accepts_error_type_in_closed_set() {
        let mut ev = run_completed("e1");
        ev["payload"]["status"] = json!("fail");
        ev["payload"]["error_type"] = json!("timeout");
        let accepted = validate_batch(&[ev]).expect("error_type 'timeout' is valid");
        match &accepted[0].kind {
            EventKind::RunCompleted(p) => {
                assert_eq!(p.error_type, Some(crate::event::ErrorKind::Timeout));
            }
            other => panic!("expected RunCompleted, got {other:?}"),
        }
    }
}
