//! Projectors: apply one event's effects to the aggregate tables.
//!
//! Every function here runs inside the per-user transaction, after the
//! planner has acquired row locks, and under a savepoint owned by the
//! driver; returning `Err` rolls back this event only.
//!
//! At-least-once is handled by the queue, not here: projection shares its
//! transaction with the `processed_at` stamp, so a retry can only happen
//! when the previous attempt rolled back. Projector bodies therefore never
//! check "have I seen this event before".

use anyhow::{anyhow, bail, Result};
use chrono::Duration;
use sqlx::PgConnection;

use apm_db::{
    daily_add, fetch_run_facts, fetch_session_stats, insert_run_facts, insert_session_stats,
    update_run_facts, update_session_stats, ClaimedEvent, DailyDeltas, RunFactsRow,
    SessionStatsRow,
};
use apm_schemas::{typed_payload, ErrorKind, EventKind, RunCompletedPayload};

/// Re-type the persisted payload and dispatch to the matching projector.
///
/// A payload that fails re-typing here slipped past ingest validation (or
/// predates a schema change); it fails this one event and stays queued.
pub async fn project_event(conn: &mut PgConnection, ev: &ClaimedEvent) -> Result<()> {
    let kind = typed_payload(ev.event_type, &ev.payload)
        .map_err(|e| anyhow!("payload re-typing failed: {e}"))?;

    match kind {
        EventKind::MessageCreated(_) => project_message_created(conn, ev).await,
        EventKind::RunStarted => project_run_started(conn, ev).await,
        EventKind::RunCompleted(p) => project_run_completed(conn, ev, &p).await,
        EventKind::LocalHandoff(_) => project_local_handoff(conn, ev).await,
    }
}

// ---------------------------------------------------------------------------
// message_created
// ---------------------------------------------------------------------------

async fn project_message_created(conn: &mut PgConnection, ev: &ClaimedEvent) -> Result<()> {
    let mut session = ensure_session(conn, ev).await?;

    let first_message_was_unset = session.first_message_at.is_none();
    session.first_message_at = Some(match session.first_message_at {
        Some(t) => t.min(ev.occurred_at),
        None => ev.occurred_at,
    });
    session.last_event_at = session.last_event_at.max(ev.occurred_at);
    update_session_stats(conn, &session).await?;

    // A session counts once, on the event that sets first_message_at,
    // attributed to that timestamp's day.
    if first_message_was_unset {
        daily_add(
            conn,
            &ev.org_id,
            ev.user_id.as_deref(),
            ev.occurred_at.date_naive(),
            &DailyDeltas {
                sessions_count: 1,
                ..Default::default()
            },
        )
        .await?;
    }

    Ok(())
}

// ---------------------------------------------------------------------------
// run_started
// ---------------------------------------------------------------------------

async fn project_run_started(conn: &mut PgConnection, ev: &ClaimedEvent) -> Result<()> {
    let run_id = require_run_id(ev)?;

    match fetch_run_facts(&mut *conn, &ev.org_id, run_id).await? {
        None => {
            let mut row = RunFactsRow::new(
                ev.org_id.clone(),
                run_id.to_string(),
                ev.session_id.clone(),
                ev.user_id.clone(),
            );
            row.started_at = Some(ev.occurred_at);
            insert_run_facts(conn, &row).await?;
        }
        Some(mut row) => {
            // A run_completed may have arrived first; fill gaps only and
            // leave its status/completion fields alone.
            if row.started_at.is_none() {
                row.started_at = Some(ev.occurred_at);
            }
            if row.user_id.is_none() {
                row.user_id = ev.user_id.clone();
            }
            update_run_facts(conn, &row).await?;
        }
    }

    let mut session = ensure_session(conn, ev).await?;
    session.last_event_at = session.last_event_at.max(ev.occurred_at);

    // A run starting strictly after the session's last handoff is the
    // friction signal the dashboard calls "post-handoff iteration".
    let mut post_handoff_transition = false;
    if let Some(last_handoff_at) = session.last_handoff_at {
        if ev.occurred_at > last_handoff_at && !session.has_post_handoff_iteration {
            session.has_post_handoff_iteration = true;
            post_handoff_transition = true;
        }
    }
    update_session_stats(conn, &session).await?;

    if post_handoff_transition {
        daily_add(
            conn,
            &ev.org_id,
            ev.user_id.as_deref(),
            ev.occurred_at.date_naive(),
            &DailyDeltas {
                sessions_with_post_handoff: 1,
                ..Default::default()
            },
        )
        .await?;
    }

    Ok(())
}

// ---------------------------------------------------------------------------
// run_completed
// ---------------------------------------------------------------------------

async fn project_run_completed(
    conn: &mut PgConnection,
    ev: &ClaimedEvent,
    payload: &RunCompletedPayload,
) -> Result<()> {
    let run_id = require_run_id(ev)?;
    let cost_micros = payload
        .cost_micros()
        .map_err(|e| anyhow!("run '{run_id}': {e}"))?;

    match fetch_run_facts(&mut *conn, &ev.org_id, run_id).await? {
        Some(row) if row.completed_at.is_some() => {
            // Replayed completion for an already-completed run: rejected,
            // never overwritten.
            bail!("run '{run_id}' already completed; duplicate run_completed rejected");
        }
        Some(mut row) => {
            fill_completion(&mut row, ev, payload, cost_micros);
            update_run_facts(conn, &row).await?;
        }
        None => {
            let mut row = RunFactsRow::new(
                ev.org_id.clone(),
                run_id.to_string(),
                ev.session_id.clone(),
                ev.user_id.clone(),
            );
            fill_completion(&mut row, ev, payload, cost_micros);
            insert_run_facts(conn, &row).await?;
        }
    }

    let mut session = ensure_session(conn, ev).await?;
    session.runs_count += 1;
    if payload.status.is_success() {
        session.success_runs += 1;
    } else {
        session.failed_runs += 1;
    }
    session.active_agent_time_ms += payload.duration_ms;
    session.cost_total_micros += cost_micros;
    session.input_tokens_total += payload.input_tokens;
    session.output_tokens_total += payload.output_tokens;
    session.last_event_at = session.last_event_at.max(ev.occurred_at);
    update_session_stats(conn, &session).await?;

    daily_add(
        conn,
        &ev.org_id,
        ev.user_id.as_deref(),
        ev.occurred_at.date_naive(),
        &run_completed_deltas(payload, cost_micros),
    )
    .await?;

    Ok(())
}

fn fill_completion(
    row: &mut RunFactsRow,
    ev: &ClaimedEvent,
    payload: &RunCompletedPayload,
    cost_micros: i64,
) {
    row.completed_at = Some(ev.occurred_at);
    row.status = Some(payload.status.as_str().to_string());
    row.duration_ms = Some(payload.duration_ms);
    row.cost_micros = Some(cost_micros);
    row.input_tokens = Some(payload.input_tokens);
    row.output_tokens = Some(payload.output_tokens);
    row.error_type = payload.error_type.map(|e| e.as_str().to_string());

    // Out-of-order completion: derive the start from the duration.
    if row.started_at.is_none() {
        row.started_at = Some(ev.occurred_at - Duration::milliseconds(payload.duration_ms));
    }
    if row.user_id.is_none() {
        row.user_id = ev.user_id.clone();
    }
}

/// Daily-counter deltas for one completed run.
pub fn run_completed_deltas(payload: &RunCompletedPayload, cost_micros: i64) -> DailyDeltas {
    let mut d = DailyDeltas {
        runs_count: 1,
        total_duration_ms: payload.duration_ms,
        total_cost_micros: cost_micros,
        total_input_tokens: payload.input_tokens,
        total_output_tokens: payload.output_tokens,
        ..Default::default()
    };

    if payload.status.is_success() {
        d.success_runs = 1;
    } else {
        d.failed_runs = 1;
        match payload.error_type {
            Some(ErrorKind::ToolError) => d.errors_tool = 1,
            Some(ErrorKind::ModelError) => d.errors_model = 1,
            Some(ErrorKind::Timeout) => d.errors_timeout = 1,
            Some(ErrorKind::Unknown) | None => d.errors_other = 1,
        }
    }

    d
}

// ---------------------------------------------------------------------------
// local_handoff
// ---------------------------------------------------------------------------

async fn project_local_handoff(conn: &mut PgConnection, ev: &ClaimedEvent) -> Result<()> {
    let mut session = ensure_session(conn, ev).await?;

    session.handoffs_count += 1;
    let first_handoff = session.handoffs_count == 1;
    session.last_handoff_at = Some(ev.occurred_at);
    session.last_event_at = session.last_event_at.max(ev.occurred_at);
    update_session_stats(conn, &session).await?;

    if first_handoff {
        daily_add(
            conn,
            &ev.org_id,
            ev.user_id.as_deref(),
            ev.occurred_at.date_naive(),
            &DailyDeltas {
                sessions_with_handoff: 1,
                ..Default::default()
            },
        )
        .await?;
    }

    Ok(())
}

// ---------------------------------------------------------------------------
// Shared helpers
// ---------------------------------------------------------------------------

/// Fetch the session row (already locked by the planner when it existed),
/// inserting a fresh one when absent. Backfills `user_id` on rows created
/// by an earlier null-user event; the caller's update persists it.
async fn ensure_session(conn: &mut PgConnection, ev: &ClaimedEvent) -> Result<SessionStatsRow> {
    match fetch_session_stats(&mut *conn, &ev.org_id, &ev.session_id).await? {
        Some(mut row) => {
            if row.user_id.is_none() {
                row.user_id = ev.user_id.clone();
            }
            Ok(row)
        }
        None => {
            let row = SessionStatsRow::new(
                ev.org_id.clone(),
                ev.session_id.clone(),
                ev.user_id.clone(),
                ev.occurred_at,
            );
            insert_session_stats(conn, &row).await?;
            Ok(row)
        }
    }
}

fn require_run_id(ev: &ClaimedEvent) -> Result<&str> {
    ev.run_id
        .as_deref()
        .ok_or_else(|| anyhow!("{} event '{}' has no run_id", ev.event_type.as_str(), ev.event_id))
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use apm_schemas::RunStatus;

    fn completed(status: RunStatus, error_type: Option<ErrorKind>) -> RunCompletedPayload {
        RunCompletedPayload {
            status,
            duration_ms: 2000,
            cost: "0.02".to_string(),
            input_tokens: 500,
            output_tokens: 200,
            error_type,
        }
    }

    // --- error bucket mapping ---

    #[test]
    fn success_run_counts_no_error_bucket() {
        let d = run_completed_deltas(&completed(RunStatus::Success, None), 20_000);
        assert_eq!(d.runs_count, 1);
        assert_eq!(d.success_runs, 1);
        assert_eq!(d.failed_runs, 0);
        assert_eq!(
            d.errors_tool + d.errors_model + d.errors_timeout + d.errors_other,
            0
        );
        assert_eq!(d.total_duration_ms, 2000);
        assert_eq!(d.total_cost_micros, 20_000);
        assert_eq!(d.total_input_tokens, 500);
        assert_eq!(d.total_output_tokens, 200);
    }

    #[test]
    fn failed_run_maps_error_type_to_its_bucket() {
        let cases = [
            (Some(ErrorKind::ToolError), (1, 0, 0, 0)),
            (Some(ErrorKind::ModelError), (0, 1, 0, 0)),
            (Some(ErrorKind::Timeout), (0, 0, 1, 0)),
            (Some(ErrorKind::Unknown), (0, 0, 0, 1)),
            (None, (0, 0, 0, 1)),
        ];
        for (error_type, (tool, model, timeout, other)) in cases {
            let d = run_completed_deltas(&completed(RunStatus::Fail, error_type), 20_000);
            assert_eq!(d.failed_runs, 1, "{error_type:?}");
            assert_eq!(
                (d.errors_tool, d.errors_model, d.errors_timeout, d.errors_other),
                (tool, model, timeout, other),
                "{error_type:?}"
            );
        }
    }

    #[test]
    fn cancelled_and_timeout_statuses_are_failures() {
        for status in [RunStatus::Timeout, RunStatus::Cancelled] {
            let d = run_completed_deltas(&completed(status, None), 20_000);
            assert_eq!(d.success_runs, 0);
            assert_eq!(d.failed_runs, 1);
            assert_eq!(d.errors_other, 1);
        }
    }
}
