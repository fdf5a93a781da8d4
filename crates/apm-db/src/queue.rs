//! Durable event queue primitives.
//!
//! `events_raw` + `events_queue` are written together in one transaction by
//! [`enqueue_batch`]; claims go through a single `FOR UPDATE SKIP LOCKED`
//! statement so concurrent workers never see the same row. The claim
//! autocommits, so the `attempts` bump survives a worker crash; that is what
//! makes poison batches observable.

use anyhow::{anyhow, Context, Result};
use chrono::{DateTime, Utc};
use serde_json::Value;
use sqlx::{PgConnection, PgPool, Row};

use apm_schemas::{EventType, ValidEvent};

/// Composite identity of one event, used for batched status updates.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EventKey {
    pub org_id: String,
    pub event_id: String,
}

impl EventKey {
    pub fn new(org_id: impl Into<String>, event_id: impl Into<String>) -> Self {
        Self {
            org_id: org_id.into(),
            event_id: event_id.into(),
        }
    }
}

/// A queue row joined with its raw event, as returned by [`claim_batch`].
#[derive(Debug, Clone)]
pub struct ClaimedEvent {
    pub org_id: String,
    pub event_id: String,
    pub event_type: EventType,
    pub session_id: String,
    pub user_id: Option<String>,
    pub run_id: Option<String>,
    pub occurred_at: DateTime<Utc>,
    pub payload: Value,
    pub inserted_at: DateTime<Utc>,
    pub attempts: i32,
}

impl ClaimedEvent {
    pub fn key(&self) -> EventKey {
        EventKey::new(self.org_id.clone(), self.event_id.clone())
    }
}

fn parse_event_type(s: &str) -> Result<EventType> {
    match s {
        "message_created" => Ok(EventType::MessageCreated),
        "run_started" => Ok(EventType::RunStarted),
        "run_completed" => Ok(EventType::RunCompleted),
        "local_handoff" => Ok(EventType::LocalHandoff),
        other => Err(anyhow!("invalid event_type in events_raw: {}", other)),
    }
}

/// Durably enqueue a validated batch: raw row + queue row per event, one
/// transaction, `ON CONFLICT DO NOTHING` on both tables.
///
/// Idempotent on `(org_id, event_id)`: replaying a batch is a silent no-op
/// for every event already present.
pub async fn enqueue_batch(pool: &PgPool, events: &[ValidEvent]) -> Result<()> {
    let mut tx = pool.begin().await.context("enqueue_batch begin failed")?;

    for ev in events {
        sqlx::query(
            r#"
            insert into events_raw (
              org_id, event_id, event_type, session_id, user_id, run_id, occurred_at, payload
            ) values (
              $1, $2, $3, $4, $5, $6, $7, $8
            )
            on conflict (org_id, event_id) do nothing
            "#,
        )
        .bind(&ev.org_id)
        .bind(&ev.event_id)
        .bind(ev.event_type().as_str())
        .bind(&ev.session_id)
        .bind(ev.user_id.as_deref())
        .bind(ev.run_id.as_deref())
        .bind(ev.occurred_at)
        .bind(&ev.payload)
        .execute(&mut *tx)
        .await
        .context("enqueue_batch: insert events_raw failed")?;

        sqlx::query(
            r#"
            insert into events_queue (org_id, event_id)
            values ($1, $2)
            on conflict (org_id, event_id) do nothing
            "#,
        )
        .bind(&ev.org_id)
        .bind(&ev.event_id)
        .execute(&mut *tx)
        .await
        .context("enqueue_batch: insert events_queue failed")?;
    }

    tx.commit().await.context("enqueue_batch commit failed")?;
    Ok(())
}

/// Atomically claim up to `batch_size` unprocessed queue rows in FIFO order
/// by `inserted_at`, bump their `attempts`, and return them joined with the
/// raw event data.
///
/// Uses `FOR UPDATE SKIP LOCKED`, so concurrent claimers never return the
/// same row. The statement autocommits: the attempts increment is durable
/// before any projection work starts.
///
/// FIFO holds only within a single claim; there is no ordering guarantee
/// across concurrent claimers.
pub async fn claim_batch(pool: &PgPool, batch_size: i64) -> Result<Vec<ClaimedEvent>> {
    let rows = sqlx::query(
        r#"
        with to_claim as (
            select org_id, event_id
            from events_queue
            where processed_at is null
            order by inserted_at asc, org_id asc, event_id asc
            limit $1
            for update skip locked
        )
        update events_queue q
           set attempts = q.attempts + 1
          from to_claim c
          join events_raw r
            on r.org_id = c.org_id and r.event_id = c.event_id
         where q.org_id = c.org_id and q.event_id = c.event_id
        returning q.org_id, q.event_id, q.inserted_at, q.attempts,
                  r.event_type, r.session_id, r.user_id, r.run_id,
                  r.occurred_at, r.payload
        "#,
    )
    .bind(batch_size)
    .fetch_all(pool)
    .await
    .context("claim_batch failed")?;

    let mut out = Vec::with_capacity(rows.len());
    for row in rows {
        out.push(ClaimedEvent {
            org_id: row.try_get("org_id")?,
            event_id: row.try_get("event_id")?,
            event_type: parse_event_type(&row.try_get::<String, _>("event_type")?)?,
            session_id: row.try_get("session_id")?,
            user_id: row.try_get("user_id")?,
            run_id: row.try_get("run_id")?,
            occurred_at: row.try_get("occurred_at")?,
            payload: row.try_get("payload")?,
            inserted_at: row.try_get("inserted_at")?,
            attempts: row.try_get("attempts")?,
        });
    }

    // UPDATE … RETURNING carries no ordering guarantee; restore claim order.
    out.sort_by(|a, b| {
        (a.inserted_at, &a.org_id, &a.event_id).cmp(&(b.inserted_at, &b.org_id, &b.event_id))
    });

    Ok(out)
}

/// Re-lock claimed queue rows at the start of a processing transaction and
/// return the keys that are still unprocessed.
///
/// The claim commits before processing (so the attempts bump survives a
/// crash), which opens a small window where another worker could re-claim
/// the same rows. Taking the row locks here closes it: in-flight rows are
/// skipped by other claimers (`SKIP LOCKED`), rows another worker finished
/// in the window come back absent and must be dropped by the caller, and a
/// dead connection releases the locks, re-exposing the rows to the next
/// claimer.
pub async fn lock_unprocessed(conn: &mut PgConnection, keys: &[EventKey]) -> Result<Vec<EventKey>> {
    if keys.is_empty() {
        return Ok(Vec::new());
    }
    let (org_ids, event_ids) = split_keys(keys);

    let rows = sqlx::query(
        r#"
        select q.org_id, q.event_id
          from events_queue q
          join unnest($1::text[], $2::text[]) as k(org_id, event_id)
            on q.org_id = k.org_id and q.event_id = k.event_id
         where q.processed_at is null
         for update of q
        "#,
    )
    .bind(&org_ids)
    .bind(&event_ids)
    .fetch_all(conn)
    .await
    .context("lock_unprocessed failed")?;

    let mut out = Vec::with_capacity(rows.len());
    for row in rows {
        out.push(EventKey {
            org_id: row.try_get("org_id")?,
            event_id: row.try_get("event_id")?,
        });
    }
    Ok(out)
}

/// Terminal success: stamp `processed_at` on every key.
///
/// Runs on the caller's connection so the stamp shares the projection
/// transaction: a commit means both the aggregates and the queue status
/// moved together.
pub async fn mark_processed(conn: &mut PgConnection, keys: &[EventKey]) -> Result<()> {
    if keys.is_empty() {
        return Ok(());
    }
    let (org_ids, event_ids) = split_keys(keys);

    sqlx::query(
        r#"
        update events_queue q
           set processed_at = now()
          from unnest($1::text[], $2::text[]) as k(org_id, event_id)
         where q.org_id = k.org_id and q.event_id = k.event_id
        "#,
    )
    .bind(&org_ids)
    .bind(&event_ids)
    .execute(conn)
    .await
    .context("mark_processed failed")?;
    Ok(())
}

/// Record a failure message on every key. `processed_at` is untouched, so
/// the rows stay reclaimable.
pub async fn record_error(conn: &mut PgConnection, keys: &[EventKey], msg: &str) -> Result<()> {
    if keys.is_empty() {
        return Ok(());
    }
    let (org_ids, event_ids) = split_keys(keys);

    sqlx::query(
        r#"
        update events_queue q
           set last_error = $3
          from unnest($1::text[], $2::text[]) as k(org_id, event_id)
         where q.org_id = k.org_id and q.event_id = k.event_id
        "#,
    )
    .bind(&org_ids)
    .bind(&event_ids)
    .bind(msg)
    .execute(conn)
    .await
    .context("record_error failed")?;
    Ok(())
}

/// Queue depth: rows not yet terminally processed.
pub async fn count_unprocessed(pool: &PgPool) -> Result<i64> {
    let (n,): (i64,) = sqlx::query_as::<_, (i64,)>(
        "select count(*)::bigint from events_queue where processed_at is null",
    )
    .fetch_one(pool)
    .await
    .context("count_unprocessed failed")?;
    Ok(n)
}

/// Unprocessed rows that have recorded at least one failure.
pub async fn count_errored(pool: &PgPool) -> Result<i64> {
    let (n,): (i64,) = sqlx::query_as::<_, (i64,)>(
        "select count(*)::bigint from events_queue where processed_at is null and last_error is not null",
    )
    .fetch_one(pool)
    .await
    .context("count_errored failed")?;
    Ok(n)
}

fn split_keys(keys: &[EventKey]) -> (Vec<String>, Vec<String>) {
    let org_ids = keys.iter().map(|k| k.org_id.clone()).collect();
    let event_ids = keys.iter().map(|k| k.event_id.clone()).collect();
    (org_ids, event_ids)
}

/// One `events_queue` row as stored (operator dashboards and tests).
#[derive(Debug, Clone)]
pub struct QueueRow {
    pub org_id: String,
    pub event_id: String,
    pub inserted_at: DateTime<Utc>,
    pub attempts: i32,
    pub processed_at: Option<DateTime<Utc>>,
    pub last_error: Option<String>,
}

pub async fn fetch_queue_row<'e>(
    ex: impl sqlx::PgExecutor<'e>,
    org_id: &str,
    event_id: &str,
) -> Result<Option<QueueRow>> {
    let row = sqlx::query(
        r#"
        select org_id, event_id, inserted_at, attempts, processed_at, last_error
        from events_queue
        where org_id = $1 and event_id = $2
        "#,
    )
    .bind(org_id)
    .bind(event_id)
    .fetch_optional(ex)
    .await
    .context("fetch_queue_row failed")?;

    let Some(row) = row else { return Ok(None) };

    Ok(Some(QueueRow {
        org_id: row.try_get("org_id")?,
        event_id: row.try_get("event_id")?,
        inserted_at: row.try_get("inserted_at")?,
        attempts: row.try_get("attempts")?,
        processed_at: row.try_get("processed_at")?,
        last_error: row.try_get("last_error")?,
    }))
}
