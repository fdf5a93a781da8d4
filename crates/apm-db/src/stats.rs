//! Aggregate table access: typed rows, `FOR UPDATE` lock helpers, and the
//! shared additive daily-stats upsert.
//!
//! Callers in `apm-pipeline` are expected to have acquired row locks (in
//! the planner's fixed order) before fetching or mutating session/run rows;
//! nothing here takes a lock on its own except the `lock_*` helpers.

use anyhow::{Context, Result};
use chrono::{DateTime, NaiveDate, Utc};
use sqlx::{PgConnection, Row};

// ---------------------------------------------------------------------------
// Lock helpers: one level of the planner's fixed order each
// ---------------------------------------------------------------------------
//
// A `SELECT … FOR UPDATE` on a missing row locks nothing; creation races
// collapse into the additive upserts below. Keys must arrive deduplicated
// and ascending; the planner owns that ordering contract.

pub async fn lock_org_days(conn: &mut PgConnection, keys: &[(String, NaiveDate)]) -> Result<()> {
    for (org_id, day) in keys {
        sqlx::query("select 1 from org_stats_daily where org_id = $1 and day = $2 for update")
            .bind(org_id)
            .bind(day)
            .execute(&mut *conn)
            .await
            .context("lock_org_days failed")?;
    }
    Ok(())
}

pub async fn lock_user_days(
    conn: &mut PgConnection,
    keys: &[(String, String, NaiveDate)],
) -> Result<()> {
    for (org_id, user_id, day) in keys {
        sqlx::query(
            "select 1 from user_stats_daily where org_id = $1 and user_id = $2 and day = $3 for update",
        )
        .bind(org_id)
        .bind(user_id)
        .bind(day)
        .execute(&mut *conn)
        .await
        .context("lock_user_days failed")?;
    }
    Ok(())
}

pub async fn lock_sessions(conn: &mut PgConnection, keys: &[(String, String)]) -> Result<()> {
    for (org_id, session_id) in keys {
        sqlx::query("select 1 from session_stats where org_id = $1 and session_id = $2 for update")
            .bind(org_id)
            .bind(session_id)
            .execute(&mut *conn)
            .await
            .context("lock_sessions failed")?;
    }
    Ok(())
}

pub async fn lock_runs(conn: &mut PgConnection, keys: &[(String, String)]) -> Result<()> {
    for (org_id, run_id) in keys {
        sqlx::query("select 1 from run_facts where org_id = $1 and run_id = $2 for update")
            .bind(org_id)
            .bind(run_id)
            .execute(&mut *conn)
            .await
            .context("lock_runs failed")?;
    }
    Ok(())
}

// ---------------------------------------------------------------------------
// session_stats
// ---------------------------------------------------------------------------

#[derive(Debug, Clone)]
pub struct SessionStatsRow {
    pub org_id: String,
    pub session_id: String,
    pub user_id: Option<String>,
    pub first_message_at: Option<DateTime<Utc>>,
    pub last_event_at: DateTime<Utc>,
    pub last_handoff_at: Option<DateTime<Utc>>,
    pub runs_count: i64,
    pub success_runs: i64,
    pub failed_runs: i64,
    pub handoffs_count: i64,
    pub has_post_handoff_iteration: bool,
    pub active_agent_time_ms: i64,
    pub cost_total_micros: i64,
    pub input_tokens_total: i64,
    pub output_tokens_total: i64,
}

impl SessionStatsRow {
    /// A fresh session row observed for the first time at `last_event_at`.
    pub fn new(
        org_id: impl Into<String>,
        session_id: impl Into<String>,
        user_id: Option<String>,
        last_event_at: DateTime<Utc>,
    ) -> Self {
        Self {
            org_id: org_id.into(),
            session_id: session_id.into(),
            user_id,
            first_message_at: None,
            last_event_at,
            last_handoff_at: None,
            runs_count: 0,
            success_runs: 0,
            failed_runs: 0,
            handoffs_count: 0,
            has_post_handoff_iteration: false,
            active_agent_time_ms: 0,
            cost_total_micros: 0,
            input_tokens_total: 0,
            output_tokens_total: 0,
        }
    }
}

pub async fn fetch_session_stats<'e>(
    ex: impl sqlx::PgExecutor<'e>,
    org_id: &str,
    session_id: &str,
) -> Result<Option<SessionStatsRow>> {
    let row = sqlx::query(
        r#"
        select org_id, session_id, user_id, first_message_at, last_event_at,
               last_handoff_at, runs_count, success_runs, failed_runs,
               handoffs_count, has_post_handoff_iteration, active_agent_time_ms,
               cost_total_micros, input_tokens_total, output_tokens_total
        from session_stats
        where org_id = $1 and session_id = $2
        "#,
    )
    .bind(org_id)
    .bind(session_id)
    .fetch_optional(ex)
    .await
    .context("fetch_session_stats failed")?;

    let Some(row) = row else { return Ok(None) };

    Ok(Some(SessionStatsRow {
        org_id: row.try_get("org_id")?,
        session_id: row.try_get("session_id")?,
        user_id: row.try_get("user_id")?,
        first_message_at: row.try_get("first_message_at")?,
        last_event_at: row.try_get("last_event_at")?,
        last_handoff_at: row.try_get("last_handoff_at")?,
        runs_count: row.try_get("runs_count")?,
        success_runs: row.try_get("success_runs")?,
        failed_runs: row.try_get("failed_runs")?,
        handoffs_count: row.try_get("handoffs_count")?,
        has_post_handoff_iteration: row.try_get("has_post_handoff_iteration")?,
        active_agent_time_ms: row.try_get("active_agent_time_ms")?,
        cost_total_micros: row.try_get("cost_total_micros")?,
        input_tokens_total: row.try_get("input_tokens_total")?,
        output_tokens_total: row.try_get("output_tokens_total")?,
    }))
}

pub async fn insert_session_stats(conn: &mut PgConnection, row: &SessionStatsRow) -> Result<()> {
    sqlx::query(
        r#"
        insert into session_stats (
          org_id, session_id, user_id, first_message_at, last_event_at,
          last_handoff_at, runs_count, success_runs, failed_runs,
          handoffs_count, has_post_handoff_iteration, active_agent_time_ms,
          cost_total_micros, input_tokens_total, output_tokens_total
        ) values (
          $1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12, $13, $14, $15
        )
        "#,
    )
    .bind(&row.org_id)
    .bind(&row.session_id)
    .bind(row.user_id.as_deref())
    .bind(row.first_message_at)
    .bind(row.last_event_at)
    .bind(row.last_handoff_at)
    .bind(row.runs_count)
    .bind(row.success_runs)
    .bind(row.failed_runs)
    .bind(row.handoffs_count)
    .bind(row.has_post_handoff_iteration)
    .bind(row.active_agent_time_ms)
    .bind(row.cost_total_micros)
    .bind(row.input_tokens_total)
    .bind(row.output_tokens_total)
    .execute(conn)
    .await
    .context("insert_session_stats failed")?;
    Ok(())
}

pub async fn update_session_stats(conn: &mut PgConnection, row: &SessionStatsRow) -> Result<()> {
    sqlx::query(
        r#"
        update session_stats
           set user_id                    = $3,
               first_message_at           = $4,
               last_event_at              = $5,
               last_handoff_at            = $6,
               runs_count                 = $7,
               success_runs               = $8,
               failed_runs                = $9,
               handoffs_count             = $10,
               has_post_handoff_iteration = $11,
               active_agent_time_ms       = $12,
               cost_total_micros          = $13,
               input_tokens_total         = $14,
               output_tokens_total        = $15
         where org_id = $1 and session_id = $2
        "#,
    )
    .bind(&row.org_id)
    .bind(&row.session_id)
    .bind(row.user_id.as_deref())
    .bind(row.first_message_at)
    .bind(row.last_event_at)
    .bind(row.last_handoff_at)
    .bind(row.runs_count)
    .bind(row.success_runs)
    .bind(row.failed_runs)
    .bind(row.handoffs_count)
    .bind(row.has_post_handoff_iteration)
    .bind(row.active_agent_time_ms)
    .bind(row.cost_total_micros)
    .bind(row.input_tokens_total)
    .bind(row.output_tokens_total)
    .execute(conn)
    .await
    .context("update_session_stats failed")?;
    Ok(())
}

// ---------------------------------------------------------------------------
// run_facts
// ---------------------------------------------------------------------------

#[derive(Debug, Clone)]
pub struct RunFactsRow {
    pub org_id: String,
    pub run_id: String,
    pub session_id: String,
    pub user_id: Option<String>,
    pub started_at: Option<DateTime<Utc>>,
    pub completed_at: Option<DateTime<Utc>>,
    pub status: Option<String>,
    pub duration_ms: Option<i64>,
    pub cost_micros: Option<i64>,
    pub input_tokens: Option<i64>,
    pub output_tokens: Option<i64>,
    pub error_type: Option<String>,
}

impl RunFactsRow {
    /// A run row with only identity fields set.
    pub fn new(
        org_id: impl Into<String>,
        run_id: impl Into<String>,
        session_id: impl Into<String>,
        user_id: Option<String>,
    ) -> Self {
        Self {
            org_id: org_id.into(),
            run_id: run_id.into(),
            session_id: session_id.into(),
            user_id,
            started_at: None,
            completed_at: None,
            status: None,
            duration_ms: None,
            cost_micros: None,
            input_tokens: None,
            output_tokens: None,
            error_type: None,
        }
    }
}

pub async fn fetch_run_facts<'e>(
    ex: impl sqlx::PgExecutor<'e>,
    org_id: &str,
    run_id: &str,
) -> Result<Option<RunFactsRow>> {
    let row = sqlx::query(
        r#"
        select org_id, run_id, session_id, user_id, started_at, completed_at,
               status, duration_ms, cost_micros, input_tokens, output_tokens,
               error_type
        from run_facts
        where org_id = $1 and run_id = $2
        "#,
    )
    .bind(org_id)
    .bind(run_id)
    .fetch_optional(ex)
    .await
    .context("fetch_run_facts failed")?;

    let Some(row) = row else { return Ok(None) };

    Ok(Some(RunFactsRow {
        org_id: row.try_get("org_id")?,
        run_id: row.try_get("run_id")?,
        session_id: row.try_get("session_id")?,
        user_id: row.try_get("user_id")?,
        started_at: row.try_get("started_at")?,
        completed_at: row.try_get("completed_at")?,
        status: row.try_get("status")?,
        duration_ms: row.try_get("duration_ms")?,
        cost_micros: row.try_get("cost_micros")?,
        input_tokens: row.try_get("input_tokens")?,
        output_tokens: row.try_get("output_tokens")?,
        error_type: row.try_get("error_type")?,
    }))
}

pub async fn insert_run_facts(conn: &mut PgConnection, row: &RunFactsRow) -> Result<()> {
    sqlx::query(
        r#"
        insert into run_facts (
          org_id, run_id, session_id, user_id, started_at, completed_at,
          status, duration_ms, cost_micros, input_tokens, output_tokens, error_type
        ) values (
          $1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12
        )
        "#,
    )
    .bind(&row.org_id)
    .bind(&row.run_id)
    .bind(&row.session_id)
    .bind(row.user_id.as_deref())
    .bind(row.started_at)
    .bind(row.completed_at)
    .bind(row.status.as_deref())
    .bind(row.duration_ms)
    .bind(row.cost_micros)
    .bind(row.input_tokens)
    .bind(row.output_tokens)
    .bind(row.error_type.as_deref())
    .execute(conn)
    .await
    .context("insert_run_facts failed")?;
    Ok(())
}

pub async fn update_run_facts(conn: &mut PgConnection, row: &RunFactsRow) -> Result<()> {
    sqlx::query(
        r#"
        update run_facts
           set session_id    = $3,
               user_id       = $4,
               started_at    = $5,
               completed_at  = $6,
               status        = $7,
               duration_ms   = $8,
               cost_micros   = $9,
               input_tokens  = $10,
               output_tokens = $11,
               error_type    = $12
         where org_id = $1 and run_id = $2
        "#,
    )
    .bind(&row.org_id)
    .bind(&row.run_id)
    .bind(&row.session_id)
    .bind(row.user_id.as_deref())
    .bind(row.started_at)
    .bind(row.completed_at)
    .bind(row.status.as_deref())
    .bind(row.duration_ms)
    .bind(row.cost_micros)
    .bind(row.input_tokens)
    .bind(row.output_tokens)
    .bind(row.error_type.as_deref())
    .execute(conn)
    .await
    .context("update_run_facts failed")?;
    Ok(())
}

// ---------------------------------------------------------------------------
// Daily stats: generic additive upsert
// ---------------------------------------------------------------------------

/// Additive counter deltas for one `(org, day)` / `(org, user, day)` pair.
///
/// Every field defaults to 0; omitted counters are therefore untouched by
/// the upsert (adding zero). Money is integer micros like everywhere else.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct DailyDeltas {
    pub sessions_count: i64,
    pub sessions_with_handoff: i64,
    pub sessions_with_post_handoff: i64,
    pub runs_count: i64,
    pub success_runs: i64,
    pub failed_runs: i64,
    pub errors_tool: i64,
    pub errors_model: i64,
    pub errors_timeout: i64,
    pub errors_other: i64,
    pub total_duration_ms: i64,
    pub total_cost_micros: i64,
    pub total_input_tokens: i64,
    pub total_output_tokens: i64,
}

/// Apply `deltas` to `org_stats_daily` and (when `user_id` is present)
/// `user_stats_daily`, in that order. Insert-if-missing, otherwise
/// `counter := counter + delta` per counter.
///
/// `active_users_count` on the org row gains +1 exactly when this call
/// creates the `(org_id, user_id, day)` user row. The existence check is
/// race-safe because the driver serializes each user: a claimed queue row
/// is invisible to other claimers and the user-day row lock is held for
/// the transaction.
pub async fn daily_add(
    conn: &mut PgConnection,
    org_id: &str,
    user_id: Option<&str>,
    day: NaiveDate,
    deltas: &DailyDeltas,
) -> Result<()> {
    let active_users_delta: i64 = match user_id {
        Some(uid) => {
            let existing: Option<(i32,)> = sqlx::query_as(
                "select 1 from user_stats_daily where org_id = $1 and user_id = $2 and day = $3",
            )
            .bind(org_id)
            .bind(uid)
            .bind(day)
            .fetch_optional(&mut *conn)
            .await
            .context("daily_add: user-day existence check failed")?;
            if existing.is_some() {
                0
            } else {
                1
            }
        }
        None => 0,
    };

    sqlx::query(
        r#"
        insert into org_stats_daily (
          org_id, day, sessions_count, sessions_with_handoff,
          sessions_with_post_handoff, runs_count, success_runs, failed_runs,
          errors_tool, errors_model, errors_timeout, errors_other,
          total_duration_ms, total_cost_micros, total_input_tokens,
          total_output_tokens, active_users_count
        ) values (
          $1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12, $13, $14, $15, $16, $17
        )
        on conflict (org_id, day) do update set
            sessions_count             = org_stats_daily.sessions_count             + excluded.sessions_count,
            sessions_with_handoff      = org_stats_daily.sessions_with_handoff      + excluded.sessions_with_handoff,
            sessions_with_post_handoff = org_stats_daily.sessions_with_post_handoff + excluded.sessions_with_post_handoff,
            runs_count                 = org_stats_daily.runs_count                 + excluded.runs_count,
            success_runs               = org_stats_daily.success_runs               + excluded.success_runs,
            failed_runs                = org_stats_daily.failed_runs                + excluded.failed_runs,
            errors_tool                = org_stats_daily.errors_tool                + excluded.errors_tool,
            errors_model               = org_stats_daily.errors_model               + excluded.errors_model,
            errors_timeout             = org_stats_daily.errors_timeout             + excluded.errors_timeout,
            errors_other               = org_stats_daily.errors_other               + excluded.errors_other,
            total_duration_ms          = org_stats_daily.total_duration_ms          + excluded.total_duration_ms,
            total_cost_micros          = org_stats_daily.total_cost_micros          + excluded.total_cost_micros,
            total_input_tokens         = org_stats_daily.total_input_tokens         + excluded.total_input_tokens,
            total_output_tokens        = org_stats_daily.total_output_tokens        + excluded.total_output_tokens,
            active_users_count         = org_stats_daily.active_users_count         + excluded.active_users_count
        "#,
    )
    .bind(org_id)
    .bind(day)
    .bind(deltas.sessions_count)
    .bind(deltas.sessions_with_handoff)
    .bind(deltas.sessions_with_post_handoff)
    .bind(deltas.runs_count)
    .bind(deltas.success_runs)
    .bind(deltas.failed_runs)
    .bind(deltas.errors_tool)
    .bind(deltas.errors_model)
    .bind(deltas.errors_timeout)
    .bind(deltas.errors_other)
    .bind(deltas.total_duration_ms)
    .bind(deltas.total_cost_micros)
    .bind(deltas.total_input_tokens)
    .bind(deltas.total_output_tokens)
    .bind(active_users_delta)
    .execute(&mut *conn)
    .await
    .context("daily_add: org_stats_daily upsert failed")?;

    let Some(uid) = user_id else { return Ok(()) };

    sqlx::query(
        r#"
        insert into user_stats_daily (
          org_id, user_id, day, sessions_count, sessions_with_handoff,
          sessions_with_post_handoff, runs_count, success_runs, failed_runs,
          errors_tool, errors_model, errors_timeout, errors_other,
          total_duration_ms, total_cost_micros, total_input_tokens,
          total_output_tokens
        ) values (
          $1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12, $13, $14, $15, $16, $17
        )
        on conflict (org_id, user_id, day) do update set
            sessions_count             = user_stats_daily.sessions_count             + excluded.sessions_count,
            sessions_with_handoff      = user_stats_daily.sessions_with_handoff      + excluded.sessions_with_handoff,
            sessions_with_post_handoff = user_stats_daily.sessions_with_post_handoff + excluded.sessions_with_post_handoff,
            runs_count                 = user_stats_daily.runs_count                 + excluded.runs_count,
            success_runs               = user_stats_daily.success_runs               + excluded.success_runs,
            failed_runs                = user_stats_daily.failed_runs                + excluded.failed_runs,
            errors_tool                = user_stats_daily.errors_tool                + excluded.errors_tool,
            errors_model               = user_stats_daily.errors_model               + excluded.errors_model,
            errors_timeout             = user_stats_daily.errors_timeout             + excluded.errors_timeout,
            errors_other               = user_stats_daily.errors_other               + excluded.errors_other,
            total_duration_ms          = user_stats_daily.total_duration_ms          + excluded.total_duration_ms,
            total_cost_micros          = user_stats_daily.total_cost_micros          + excluded.total_cost_micros,
            total_input_tokens         = user_stats_daily.total_input_tokens         + excluded.total_input_tokens,
            total_output_tokens        = user_stats_daily.total_output_tokens        + excluded.total_output_tokens
        "#,
    )
    .bind(org_id)
    .bind(uid)
    .bind(day)
    .bind(deltas.sessions_count)
    .bind(deltas.sessions_with_handoff)
    .bind(deltas.sessions_with_post_handoff)
    .bind(deltas.runs_count)
    .bind(deltas.success_runs)
    .bind(deltas.failed_runs)
    .bind(deltas.errors_tool)
    .bind(deltas.errors_model)
    .bind(deltas.errors_timeout)
    .bind(deltas.errors_other)
    .bind(deltas.total_duration_ms)
    .bind(deltas.total_cost_micros)
    .bind(deltas.total_input_tokens)
    .bind(deltas.total_output_tokens)
    .execute(&mut *conn)
    .await
    .context("daily_add: user_stats_daily upsert failed")?;

    Ok(())
}

// ---------------------------------------------------------------------------
// Daily row readback (operator visibility + tests)
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct OrgDailyRow {
    pub sessions_count: i64,
    pub sessions_with_handoff: i64,
    pub sessions_with_post_handoff: i64,
    pub runs_count: i64,
    pub success_runs: i64,
    pub failed_runs: i64,
    pub errors_tool: i64,
    pub errors_model: i64,
    pub errors_timeout: i64,
    pub errors_other: i64,
    pub total_duration_ms: i64,
    pub total_cost_micros: i64,
    pub total_input_tokens: i64,
    pub total_output_tokens: i64,
    pub active_users_count: i64,
}

pub async fn fetch_org_daily<'e>(
    ex: impl sqlx::PgExecutor<'e>,
    org_id: &str,
    day: NaiveDate,
) -> Result<Option<OrgDailyRow>> {
    let row = sqlx::query(
        r#"
        select sessions_count, sessions_with_handoff, sessions_with_post_handoff,
               runs_count, success_runs, failed_runs,
               errors_tool, errors_model, errors_timeout, errors_other,
               total_duration_ms, total_cost_micros, total_input_tokens,
               total_output_tokens, active_users_count
        from org_stats_daily
        where org_id = $1 and day = $2
        "#,
    )
    .bind(org_id)
    .bind(day)
    .fetch_optional(ex)
    .await
    .context("fetch_org_daily failed")?;

    let Some(row) = row else { return Ok(None) };

    Ok(Some(OrgDailyRow {
        sessions_count: row.try_get("sessions_count")?,
        sessions_with_handoff: row.try_get("sessions_with_handoff")?,
        sessions_with_post_handoff: row.try_get("sessions_with_post_handoff")?,
        runs_count: row.try_get("runs_count")?,
        success_runs: row.try_get("success_runs")?,
        failed_runs: row.try_get("failed_runs")?,
        errors_tool: row.try_get("errors_tool")?,
        errors_model: row.try_get("errors_model")?,
        errors_timeout: row.try_get("errors_timeout")?,
        errors_other: row.try_get("errors_other")?,
        total_duration_ms: row.try_get("total_duration_ms")?,
        total_cost_micros: row.try_get("total_cost_micros")?,
        total_input_tokens: row.try_get("total_input_tokens")?,
        total_output_tokens: row.try_get("total_output_tokens")?,
        active_users_count: row.try_get("active_users_count")?,
    }))
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct UserDailyRow {
    pub sessions_count: i64,
    pub sessions_with_handoff: i64,
    pub sessions_with_post_handoff: i64,
    pub runs_count: i64,
    pub success_runs: i64,
    pub failed_runs: i64,
    pub errors_tool: i64,
    pub errors_model: i64,
    pub errors_timeout: i64,
    pub errors_other: i64,
    pub total_duration_ms: i64,
    pub total_cost_micros: i64,
    pub total_input_tokens: i64,
    pub total_output_tokens: i64,
}

pub async fn fetch_user_daily<'e>(
    ex: impl sqlx::PgExecutor<'e>,
    org_id: &str,
    user_id: &str,
    day: NaiveDate,
) -> Result<Option<UserDailyRow>> {
    let row = sqlx::query(
        r#"
        select sessions_count, sessions_with_handoff, sessions_with_post_handoff,
               runs_count, success_runs, failed_runs,
               errors_tool, errors_model, errors_timeout, errors_other,
               total_duration_ms, total_cost_micros, total_input_tokens,
               total_output_tokens
        from user_stats_daily
        where org_id = $1 and user_id = $2 and day = $3
        "#,
    )
    .bind(org_id)
    .bind(user_id)
    .bind(day)
    .fetch_optional(ex)
    .await
    .context("fetch_user_daily failed")?;

    let Some(row) = row else { return Ok(None) };

    Ok(Some(UserDailyRow {
        sessions_count: row.try_get("sessions_count")?,
        sessions_with_handoff: row.try_get("sessions_with_handoff")?,
        sessions_with_post_handoff: row.try_get("sessions_with_post_handoff")?,
        runs_count: row.try_get("runs_count")?,
        success_runs: row.try_get("success_runs")?,
        failed_runs: row.try_get("failed_runs")?,
        errors_tool: row.try_get("errors_tool")?,
        errors_model: row.try_get("errors_model")?,
        errors_timeout: row.try_get("errors_timeout")?,
        errors_other: row.try_get("errors_other")?,
        total_duration_ms: row.try_get("total_duration_ms")?,
        total_cost_micros: row.try_get("total_cost_micros")?,
        total_input_tokens: row.try_get("total_input_tokens")?,
        total_output_tokens: row.try_get("total_output_tokens")?,
    }))
}
