//! The cooperative claim/dispatch loop.
//!
//! Each iteration claims a FIFO batch, splits it into per-user groups, and
//! runs one transaction per group: lock plan, projectors under savepoints,
//! then the queue-status writes, all committed together. A group failure
//! never touches another group; the failed rows stay reclaimable.
//!
//! Any number of workers may run this loop concurrently (in-process or
//! across processes); the `SKIP LOCKED` claim keeps them disjoint.

use std::collections::BTreeMap;
use std::time::Duration;

use anyhow::{Context, Result};
use sqlx::{Acquire, PgPool};
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use apm_db::{
    claim_batch, lock_unprocessed, mark_processed, record_error, ClaimedEvent, EventKey,
};

use crate::plan::LockPlan;
use crate::project::project_event;

/// One claim/project driver. Spawn as many as `WORKER_CONCURRENCY`.
pub struct PipelineWorker {
    pool: PgPool,
    batch_size: i64,
    poll_interval: Duration,
    worker_id: String,
}

impl PipelineWorker {
    pub fn new(
        pool: PgPool,
        batch_size: i64,
        poll_interval: Duration,
        worker_id: impl Into<String>,
    ) -> Self {
        Self {
            pool,
            batch_size,
            poll_interval,
            worker_id: worker_id.into(),
        }
    }

    pub fn spawn(self, shutdown: watch::Receiver<bool>) -> JoinHandle<()> {
        tokio::spawn(self.run(shutdown))
    }

    /// Run until `shutdown` flips to true. The current batch is always
    /// finished first: in-flight transactions either commit or roll back,
    /// and rolled-back claims simply become reclaimable.
    pub async fn run(self, mut shutdown: watch::Receiver<bool>) {
        info!(worker = %self.worker_id, "pipeline worker started");

        loop {
            if *shutdown.borrow() {
                break;
            }

            match self.run_once().await {
                Ok(0) => self.idle(&mut shutdown).await,
                Ok(_) => {}
                Err(e) => {
                    warn!(
                        worker = %self.worker_id,
                        error = %format!("{e:#}"),
                        "claim failed; backing off"
                    );
                    self.idle(&mut shutdown).await;
                }
            }
        }

        info!(worker = %self.worker_id, "pipeline worker stopped");
    }

    /// One driver iteration: claim a batch and process every per-user group.
    /// Returns the number of claimed events; `Err` only when the claim
    /// itself fails; group failures are absorbed (their rows stay queued).
    pub async fn run_once(&self) -> Result<usize> {
        let claimed = claim_batch(&self.pool, self.batch_size).await?;
        if claimed.is_empty() {
            return Ok(0);
        }
        let total = claimed.len();
        debug!(worker = %self.worker_id, events = total, "claimed batch");

        for (user_id, group) in group_by_user(claimed) {
            if let Err(e) = self.process_group(&group).await {
                warn!(
                    worker = %self.worker_id,
                    user = user_id.as_deref().unwrap_or("<none>"),
                    events = group.len(),
                    error = %format!("{e:#}"),
                    "group transaction failed; events remain queued"
                );
                self.record_group_failure(&group, &e).await;
            }
        }

        Ok(total)
    }

    /// One per-user transaction: re-lock the claimed queue rows, lock plan,
    /// then every event under its own savepoint, then the batched
    /// queue-status writes. Commit covers the aggregates and the
    /// `processed_at` stamps together; that shared fate is what makes
    /// at-least-once converge.
    async fn process_group(&self, group: &[ClaimedEvent]) -> Result<()> {
        let mut tx = self
            .pool
            .begin()
            .await
            .context("group transaction begin failed")?;

        // Rows another worker finished since our claim come back absent
        // here; drop them. The locks hold until commit, keeping in-flight
        // rows invisible to other claimers.
        let keys: Vec<EventKey> = group.iter().map(ClaimedEvent::key).collect();
        let live = lock_unprocessed(&mut tx, &keys).await?;
        let group: Vec<&ClaimedEvent> = group
            .iter()
            .filter(|ev| live.contains(&ev.key()))
            .collect();
        if group.is_empty() {
            tx.rollback()
                .await
                .context("empty group rollback failed")?;
            return Ok(());
        }

        LockPlan::for_events(group.iter().copied())
            .acquire(&mut tx)
            .await?;

        let mut processed: Vec<EventKey> = Vec::new();
        let mut failed: Vec<(EventKey, String)> = Vec::new();

        for ev in group {
            let mut sp = tx.begin().await.context("savepoint begin failed")?;
            match project_event(&mut sp, ev).await {
                Ok(()) => {
                    sp.commit().await.context("savepoint release failed")?;
                    processed.push(ev.key());
                }
                Err(e) => {
                    sp.rollback().await.context("savepoint rollback failed")?;
                    warn!(
                        worker = %self.worker_id,
                        org = %ev.org_id,
                        event = %ev.event_id,
                        attempts = ev.attempts,
                        error = %format!("{e:#}"),
                        "projection failed; event stays queued"
                    );
                    failed.push((ev.key(), format!("{e:#}")));
                }
            }
        }

        mark_processed(&mut tx, &processed).await?;
        for (key, msg) in &failed {
            record_error(&mut tx, std::slice::from_ref(key), msg).await?;
        }

        tx.commit().await.context("group transaction commit failed")?;
        Ok(())
    }

    /// After a whole-group failure the transaction is gone; surface the
    /// error on the queue rows in a fresh short transaction. Best-effort:
    /// if this also fails, the rows are still reclaimable as-is.
    async fn record_group_failure(&self, group: &[ClaimedEvent], err: &anyhow::Error) {
        let keys: Vec<EventKey> = group.iter().map(ClaimedEvent::key).collect();
        let msg = format!("{err:#}");

        match self.pool.acquire().await {
            Ok(mut conn) => {
                if let Err(e) = record_error(&mut conn, &keys, &msg).await {
                    warn!(
                        worker = %self.worker_id,
                        error = %format!("{e:#}"),
                        "failed to record group error; rows remain reclaimable"
                    );
                }
            }
            Err(e) => {
                warn!(
                    worker = %self.worker_id,
                    error = %format!("{e:#}"),
                    "no connection to record group error; rows remain reclaimable"
                );
            }
        }
    }

    async fn idle(&self, shutdown: &mut watch::Receiver<bool>) {
        tokio::select! {
            _ = tokio::time::sleep(self.poll_interval) => {}
            _ = shutdown.changed() => {}
        }
    }
}

/// Split a claimed batch into per-user groups, claim order preserved inside
/// each group. Events without a `user_id` form one group of their own.
pub fn group_by_user(events: Vec<ClaimedEvent>) -> Vec<(Option<String>, Vec<ClaimedEvent>)> {
    let mut groups: BTreeMap<Option<String>, Vec<ClaimedEvent>> = BTreeMap::new();
    for ev in events {
        groups.entry(ev.user_id.clone()).or_default().push(ev);
    }
    groups.into_iter().collect()
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use apm_schemas::EventType;
    use chrono::{TimeZone, Utc};
    use serde_json::json;

    fn claimed(event_id: &str, user_id: Option<&str>, minute: u32) -> ClaimedEvent {
        ClaimedEvent {
            org_id: "o".to_string(),
            event_id: event_id.to_string(),
            event_type: EventType::MessageCreated,
            session_id: "s".to_string(),
            user_id: user_id.map(str::to_string),
            run_id: None,
            occurred_at: Utc.with_ymd_and_hms(2024, 6, 1, 10, minute, 0).unwrap(),
            payload: json!({"content": "x"}),
            inserted_at: Utc.with_ymd_and_hms(2024, 6, 1, 10, minute, 0).unwrap(),
            attempts: 1,
        }
    }

    #[test]
    fn groups_split_by_user_preserving_claim_order() {
        let batch = vec![
            claimed("e1", Some("ursula"), 0),
            claimed("e2", Some("avery"), 1),
            claimed("e3", Some("ursula"), 2),
            claimed("e4", Some("avery"), 3),
        ];

        let groups = group_by_user(batch);
        assert_eq!(groups.len(), 2);

        // BTreeMap ordering: "avery" before "ursula".
        assert_eq!(groups[0].0.as_deref(), Some("avery"));
        let avery_ids: Vec<&str> = groups[0].1.iter().map(|e| e.event_id.as_str()).collect();
        assert_eq!(avery_ids, vec!["e2", "e4"]);

        assert_eq!(groups[1].0.as_deref(), Some("ursula"));
        let ursula_ids: Vec<&str> = groups[1].1.iter().map(|e| e.event_id.as_str()).collect();
        assert_eq!(ursula_ids, vec!["e1", "e3"]);
    }

    #[test]
    fn null_user_events_form_their_own_group_first() {
        let batch = vec![
            claimed("e1", Some("u1"), 0),
            claimed("e2", None, 1),
            claimed("e3", None, 2),
        ];

        let groups = group_by_user(batch);
        assert_eq!(groups.len(), 2);
        assert_eq!(groups[0].0, None);
        assert_eq!(groups[0].1.len(), 2);
    }

    #[test]
    fn empty_batch_produces_no_groups() {
        assert!(group_by_user(Vec::new()).is_empty());
    }
}
