//! Canonical telemetry event shapes and the ingest batch validator.
//!
//! This crate defines the wire format accepted by `POST /events` and the
//! typed per-event-type payload views used by the projection pipeline.
//!
//! It does **not**:
//! - talk to the database (validation is a pure function)
//! - apply events to aggregates (that is `apm-pipeline`)

pub mod event;
pub mod money;
pub mod validate;

pub use event::{
    ErrorKind, EventKind, EventType, EventWire, HandoffMethod, LocalHandoffPayload,
    MessageCreatedPayload, RunCompletedPayload, RunStatus, ValidEvent,
};
pub use money::{cost_to_micros, MoneyError};
pub use validate::{typed_payload, validate_batch, EventError, ValidationError, MAX_BATCH_SIZE};
