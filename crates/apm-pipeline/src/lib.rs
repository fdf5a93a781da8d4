//! The projection pipeline: claim batches off the durable queue, group by
//! user, and apply each event's effects to the aggregate tables under a
//! deadlock-free lock order with per-event failure isolation.
//!
//! Layering:
//! - `plan`: collects and orders the aggregate row locks for a group
//! - `project`: one projector per event type, run after locks are held
//! - `driver`: the cooperative claim/dispatch loop workers run
//!
//! All SQL lives in `apm-db`; this crate owns the semantics.

pub mod driver;
pub mod plan;
pub mod project;

pub use driver::{group_by_user, PipelineWorker};
pub use plan::LockPlan;
pub use project::project_event;
