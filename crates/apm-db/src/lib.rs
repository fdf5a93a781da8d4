// crates/apm-db/src/lib.rs
//! Postgres access for the telemetry pipeline: pool bootstrap, embedded
//! migrations, the durable event queue, and the aggregate tables the
//! projectors maintain.
//!
//! Projection *logic* lives in `apm-pipeline`; this crate owns every SQL
//! statement and the typed row shapes.

use anyhow::{Context, Result};
use sqlx::{postgres::PgPoolOptions, PgPool};

pub mod queue;
pub mod stats;

pub use queue::{
    claim_batch, count_errored, count_unprocessed, enqueue_batch, fetch_queue_row,
    lock_unprocessed, mark_processed, record_error, ClaimedEvent, EventKey, QueueRow,
};
pub use stats::{
    daily_add, fetch_org_daily, fetch_run_facts, fetch_session_stats, fetch_user_daily,
    insert_run_facts, insert_session_stats, lock_org_days, lock_runs, lock_sessions,
    lock_user_days, update_run_facts, update_session_stats, DailyDeltas, OrgDailyRow, RunFactsRow,
    SessionStatsRow, UserDailyRow,
};

/// Connect to Postgres with the pool sizing used everywhere in the system.
pub async fn connect(url: &str) -> Result<PgPool> {
    let pool = PgPoolOptions::new()
        .max_connections(10)
        .connect(url)
        .await
        .context("failed to connect to Postgres")?;

    Ok(pool)
}

/// Connect using `DATABASE_URL`.
pub async fn connect_from_env() -> Result<PgPool> {
    let url = std::env::var(apm_config::ENV_DATABASE_URL).with_context(|| {
        format!("missing env var {}", apm_config::ENV_DATABASE_URL)
    })?;
    connect(&url).await
}

/// Test helper used by integration tests:
/// - Connect using `DATABASE_URL`
/// - Ensure migrations are applied
pub async fn testkit_db_pool() -> Result<PgPool> {
    let pool = connect_from_env().await?;
    migrate(&pool).await?;
    Ok(pool)
}

/// Run embedded SQLx migrations.
pub async fn migrate(pool: &PgPool) -> Result<()> {
    sqlx::migrate!("./migrations")
        .run(pool)
        .await
        .context("db migrate failed")?;
    Ok(())
}

/// Simple status query (connectivity + schema presence).
pub async fn status(pool: &PgPool) -> Result<DbStatus> {
    let (one,): (i32,) = sqlx::query_as::<_, (i32,)>("select 1")
        .fetch_one(pool)
        .await
        .context("status connectivity query failed")?;
    let ok = one == 1;

    let (exists,): (bool,) = sqlx::query_as::<_, (bool,)>(
        r#"
        select exists (
            select 1
            from information_schema.tables
            where table_schema='public' and table_name='events_queue'
        )
        "#,
    )
    .fetch_one(pool)
    .await
    .context("status table-exists query failed")?;

    Ok(DbStatus {
        ok,
        has_queue_table: exists,
    })
}

#[derive(Debug, Clone)]
pub struct DbStatus {
    pub ok: bool,
    pub has_queue_table: bool,
}
