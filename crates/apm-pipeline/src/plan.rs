//! Lock planning for a group of events.
//!
//! Before any projector runs, every aggregate row the group will touch is
//! locked in a globally fixed order. This ordering is the single source of
//! deadlock freedom; no projector takes a lock of its own.
//!
//! Order: org-day, user-day, session, run; keys deduplicated and ascending
//! within each level. `BTreeSet` gives both properties for free.

use std::collections::BTreeSet;

use anyhow::Result;
use chrono::NaiveDate;
use sqlx::PgConnection;

use apm_db::{lock_org_days, lock_runs, lock_sessions, lock_user_days, ClaimedEvent};

/// The deduplicated, ordered set of aggregate keys a group references.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct LockPlan {
    org_days: BTreeSet<(String, NaiveDate)>,
    user_days: BTreeSet<(String, String, NaiveDate)>,
    sessions: BTreeSet<(String, String)>,
    runs: BTreeSet<(String, String)>,
}

impl LockPlan {
    pub fn for_events<'a>(events: impl IntoIterator<Item = &'a ClaimedEvent>) -> Self {
        let mut plan = Self::default();
        for ev in events {
            let day = ev.occurred_at.date_naive();
            plan.org_days.insert((ev.org_id.clone(), day));
            if let Some(user_id) = &ev.user_id {
                plan.user_days
                    .insert((ev.org_id.clone(), user_id.clone(), day));
            }
            plan.sessions
                .insert((ev.org_id.clone(), ev.session_id.clone()));
            // Only run_* events touch run_facts; a stray run_id on another
            // event type is not a lock target.
            if ev.event_type.requires_run_id() {
                if let Some(run_id) = &ev.run_id {
                    plan.runs.insert((ev.org_id.clone(), run_id.clone()));
                }
            }
        }
        plan
    }

    /// Acquire every planned row lock, level by level, ascending within each
    /// level. Locks are `SELECT … FOR UPDATE` and hold until the enclosing
    /// transaction ends. A missing row locks nothing; creation races resolve
    /// at the upserts.
    pub async fn acquire(&self, conn: &mut PgConnection) -> Result<()> {
        let org_days: Vec<_> = self.org_days.iter().cloned().collect();
        lock_org_days(conn, &org_days).await?;

        let user_days: Vec<_> = self.user_days.iter().cloned().collect();
        lock_user_days(conn, &user_days).await?;

        let sessions: Vec<_> = self.sessions.iter().cloned().collect();
        lock_sessions(conn, &sessions).await?;

        let runs: Vec<_> = self.runs.iter().cloned().collect();
        lock_runs(conn, &runs).await?;

        Ok(())
    }

    pub fn org_day_keys(&self) -> Vec<(String, NaiveDate)> {
        self.org_days.iter().cloned().collect()
    }

    pub fn user_day_keys(&self) -> Vec<(String, String, NaiveDate)> {
        self.user_days.iter().cloned().collect()
    }

    pub fn session_keys(&self) -> Vec<(String, String)> {
        self.sessions.iter().cloned().collect()
    }

    pub fn run_keys(&self) -> Vec<(String, String)> {
        self.runs.iter().cloned().collect()
    }
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

    fn claimed(
        org_id: &str,
        event_id: &str,
        event_type: EventType,
        session_id: &str,
        user_id: Option<&str>,
        run_id: Option<&str>,
        occurred_at: &str,
    ) -> ClaimedEvent {
        ClaimedEvent {
            org_id: org_id.to_string(),
            event_id: event_id.to_string(),
            event_type,
            session_id: session_id.to_string(),
            user_id: user_id.map(str::to_string),
            run_id: run_id.map(str::to_string),
            occurred_at: occurred_at.parse().unwrap(),
            payload: json!({}),
            inserted_at: Utc.with_ymd_and_hms(2024, 6, 1, 0, 0, 0).unwrap(),
            attempts: 1,
        }
    }

    #[test]
    fn keys_are_deduplicated_and_ascending() {
        let events = vec![
            claimed(
                "org-b", "e1", EventType::RunCompleted, "s2", Some("u1"),
                Some("r9"), "2024-06-01T10:00:00Z",
            ),
            claimed(
                "org-a", "e2", EventType::RunStarted, "s1", Some("u1"),
                Some("r1"), "2024-06-01T11:00:00Z",
            ),
            claimed(
                "org-a", "e3", EventType::MessageCreated, "s1", Some("u1"),
                None, "2024-06-01T12:00:00Z",
            ),
            // Same org/day/session as e2: must not produce duplicate keys.
            claimed(
                "org-a", "e4", EventType::RunCompleted, "s1", Some("u1"),
                Some("r1"), "2024-06-01T13:00:00Z",
            ),
        ];

        let plan = LockPlan::for_events(&events);
        let day = "2024-06-01".parse().unwrap();

        assert_eq!(
            plan.org_day_keys(),
            vec![("org-a".to_string(), day), ("org-b".to_string(), day)]
        );
        assert_eq!(
            plan.session_keys(),
            vec![
                ("org-a".to_string(), "s1".to_string()),
                ("org-b".to_string(), "s2".to_string())
            ]
        );
        assert_eq!(
            plan.run_keys(),
            vec![
                ("org-a".to_string(), "r1".to_string()),
                ("org-b".to_string(), "r9".to_string())
            ]
        );
    }

    #[test]
    fn events_on_different_days_lock_both_day_rows() {
        let events = vec![
            claimed(
                "o", "e1", EventType::RunCompleted, "s", Some("u"),
                Some("r1"), "2024-06-01T23:59:00Z",
            ),
            claimed(
                "o", "e2", EventType::RunCompleted, "s", Some("u"),
                Some("r2"), "2024-06-02T00:01:00Z",
            ),
        ];
        let plan = LockPlan::for_events(&events);
        assert_eq!(plan.org_day_keys().len(), 2);
        assert_eq!(plan.user_day_keys().len(), 2);
    }

    #[test]
    fn null_user_events_produce_no_user_day_keys() {
        let events = vec![claimed(
            "o", "e1", EventType::MessageCreated, "s", None, None,
            "2024-06-01T10:00:00Z",
        )];
        let plan = LockPlan::for_events(&events);
        assert!(plan.user_day_keys().is_empty());
        assert_eq!(plan.session_keys().len(), 1);
    }

    #[test]
    fn run_id_on_non_run_event_is_not_a_lock_target() {
        let events = vec![claimed(
            "o", "e1", EventType::MessageCreated, "s", Some("u"),
            Some("r-stray"), "2024-06-01T10:00:00Z",
        )];
        let plan = LockPlan::for_events(&events);
        assert!(plan.run_keys().is_empty());
    }
}
