//! Durable queue storage on the `tasks` table.
//!
//! Every state change after a claim is guarded by the lease token and the
//! attempt number, so an attempt whose lease was reclaimed can no longer
//! acknowledge or fail the task.

use rusqlite::{params, OptionalExtension, Row};

use super::{Database, DatabaseError};

#[derive(Debug, Clone)]
pub struct TaskRow {
    pub id: String,
    pub job_id: String,
    pub owner_id: String,
    pub source_path: String,
    pub media_kind: String,
    pub priority: i64,
    pub attempt: i64,
    pub max_attempts: i64,
    pub backoff_kind: String,
    pub backoff_delay_ms: i64,
    pub backoff_max_ms: i64,
    pub state: String,
    pub run_at_ms: i64,
    pub lease_owner: Option<String>,
    pub lease_expires_at_ms: Option<i64>,
    pub last_error: Option<String>,
    pub created_at: String,
    pub updated_at: String,
}

impl TaskRow {
    fn from_row(row: &Row<'_>) -> Result<Self, rusqlite::Error> {
        Ok(Self {
            id: row.get("id")?,
            job_id: row.get("job_id")?,
            owner_id: row.get("owner_id")?,
            source_path: row.get("source_path")?,
            media_kind: row.get("media_kind")?,
            priority: row.get("priority")?,
            attempt: row.get("attempt")?,
            max_attempts: row.get("max_attempts")?,
            backoff_kind: row.get("backoff_kind")?,
            backoff_delay_ms: row.get("backoff_delay_ms")?,
            backoff_max_ms: row.get("backoff_max_ms")?,
            state: row.get("state")?,
            run_at_ms: row.get("run_at_ms")?,
            lease_owner: row.get("lease_owner")?,
            lease_expires_at_ms: row.get("lease_expires_at_ms")?,
            last_error: row.get("last_error")?,
            created_at: row.get("created_at")?,
            updated_at: row.get("updated_at")?,
        })
    }
}

/// Identifies one leased attempt of a task.
#[derive(Debug, Clone, Copy)]
pub struct LeaseKey<'a> {
    pub id: &'a str,
    pub lease_owner: &'a str,
    pub attempt: i64,
}

pub fn insert(db: &Database, task: &TaskRow) -> Result<(), DatabaseError> {
    db.with_conn(|conn| {
        conn.execute(
            "INSERT INTO tasks (id, job_id, owner_id, source_path, media_kind, priority, attempt,
             max_attempts, backoff_kind, backoff_delay_ms, backoff_max_ms, state, run_at_ms,
             lease_owner, lease_expires_at_ms, last_error, created_at, updated_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9,
                     ?10, ?11, ?12, ?13, ?14, ?15, ?16, ?17, ?18)",
            params![
                task.id,
                task.job_id,
                task.owner_id,
                task.source_path,
                task.media_kind,
                task.priority,
                task.attempt,
                task.max_attempts,
                task.backoff_kind,
                task.backoff_delay_ms,
                task.backoff_max_ms,
                task.state,
                task.run_at_ms,
                task.lease_owner,
                task.lease_expires_at_ms,
                task.last_error,
                task.created_at,
                task.updated_at,
            ],
        )?;
        Ok(())
    })
}

pub fn find_by_id(db: &Database, id: &str) -> Result<Option<TaskRow>, DatabaseError> {
    db.with_conn(|conn| {
        let row = conn
            .query_row(
                "SELECT * FROM tasks WHERE id = ?1",
                params![id],
                TaskRow::from_row,
            )
            .optional()?;
        Ok(row)
    })
}

/// Atomically leases the next ready task: lowest priority number first, then
/// earliest `run_at`, then insertion order. Increments `attempt`.
pub fn claim_next(
    db: &Database,
    now_ms: i64,
    lease_owner: &str,
    lease_expires_at_ms: i64,
    updated_at: &str,
) -> Result<Option<TaskRow>, DatabaseError> {
    db.with_conn(|conn| {
        let row = conn
            .query_row(
                "UPDATE tasks SET state = 'active', attempt = attempt + 1, lease_owner = ?1,
                 lease_expires_at_ms = ?2, updated_at = ?3
                 WHERE seq = (
                     SELECT seq FROM tasks
                     WHERE state = 'waiting' AND run_at_ms <= ?4
                     ORDER BY priority ASC, run_at_ms ASC, seq ASC
                     LIMIT 1
                 )
                 RETURNING *",
                params![lease_owner, lease_expires_at_ms, updated_at, now_ms],
                TaskRow::from_row,
            )
            .optional()?;
        Ok(row)
    })
}

/// Renews a lease that is still held. Returns false when the attempt no
/// longer owns the task.
pub fn extend_lease(
    db: &Database,
    key: LeaseKey<'_>,
    lease_expires_at_ms: i64,
    updated_at: &str,
) -> Result<bool, DatabaseError> {
    db.with_conn(|conn| {
        let changed = conn.execute(
            "UPDATE tasks SET lease_expires_at_ms = ?4, updated_at = ?5
             WHERE id = ?1 AND state = 'active' AND lease_owner = ?2 AND attempt = ?3",
            params![
                key.id,
                key.lease_owner,
                key.attempt,
                lease_expires_at_ms,
                updated_at
            ],
        )?;
        Ok(changed == 1)
    })
}

/// Moves a leased task to a final state (`completed` or `failed`).
pub fn finish(
    db: &Database,
    key: LeaseKey<'_>,
    state: &str,
    last_error: Option<&str>,
    updated_at: &str,
) -> Result<bool, DatabaseError> {
    db.with_conn(|conn| {
        let changed = conn.execute(
            "UPDATE tasks SET state = ?4, last_error = COALESCE(?5, last_error),
             lease_owner = NULL, lease_expires_at_ms = NULL, updated_at = ?6
             WHERE id = ?1 AND state = 'active' AND lease_owner = ?2 AND attempt = ?3",
            params![
                key.id,
                key.lease_owner,
                key.attempt,
                state,
                last_error,
                updated_at
            ],
        )?;
        Ok(changed == 1)
    })
}

/// Returns a leased task to `waiting`, eligible again at `run_at_ms`.
pub fn requeue(
    db: &Database,
    key: LeaseKey<'_>,
    run_at_ms: i64,
    last_error: &str,
    updated_at: &str,
) -> Result<bool, DatabaseError> {
    db.with_conn(|conn| {
        let changed = conn.execute(
            "UPDATE tasks SET state = 'waiting', run_at_ms = ?4, last_error = ?5,
             lease_owner = NULL, lease_expires_at_ms = NULL, updated_at = ?6
             WHERE id = ?1 AND state = 'active' AND lease_owner = ?2 AND attempt = ?3",
            params![
                key.id,
                key.lease_owner,
                key.attempt,
                run_at_ms,
                last_error,
                updated_at
            ],
        )?;
        Ok(changed == 1)
    })
}

/// Handles expired leases.
///
/// Tasks with deliveries left go back to `waiting` immediately. Tasks that
/// already used every delivery are re-leased to `lease_owner` so the caller
/// can finalize them; those are returned.
pub fn reclaim_expired(
    db: &Database,
    now_ms: i64,
    lease_owner: &str,
    lease_expires_at_ms: i64,
    updated_at: &str,
) -> Result<(usize, Vec<TaskRow>), DatabaseError> {
    db.with_tx(|tx| {
        let requeued = tx.execute(
            "UPDATE tasks SET state = 'waiting', run_at_ms = ?1,
             last_error = 'lease expired before acknowledgement',
             lease_owner = NULL, lease_expires_at_ms = NULL, updated_at = ?2
             WHERE state = 'active' AND lease_expires_at_ms < ?1 AND attempt < max_attempts",
            params![now_ms, updated_at],
        )?;

        let exhausted = {
            let mut stmt = tx.prepare(
                "UPDATE tasks SET lease_owner = ?2, lease_expires_at_ms = ?3, updated_at = ?4
                 WHERE state = 'active' AND lease_expires_at_ms < ?1 AND attempt >= max_attempts
                 RETURNING *",
            )?;
            let rows = stmt
                .query_map(
                    params![now_ms, lease_owner, lease_expires_at_ms, updated_at],
                    TaskRow::from_row,
                )?
                .collect::<Result<Vec<_>, _>>()?;
            rows
        };

        Ok((requeued, exhausted))
    })
}

/// Earliest `run_at_ms` among waiting tasks, used to size idle waits.
pub fn next_run_at(db: &Database) -> Result<Option<i64>, DatabaseError> {
    db.with_conn(|conn| {
        let next: Option<i64> = conn.query_row(
            "SELECT MIN(run_at_ms) FROM tasks WHERE state = 'waiting'",
            [],
            |r| r.get(0),
        )?;
        Ok(next)
    })
}

pub fn count_by_state(db: &Database, state: &str) -> Result<u64, DatabaseError> {
    db.with_conn(|conn| {
        let count: u64 = conn.query_row(
            "SELECT COUNT(*) FROM tasks WHERE state = ?1",
            params![state],
            |r| r.get(0),
        )?;
        Ok(count)
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    const TS: &str = "2026-01-01T00:00:00+00:00";

    fn test_db() -> Database {
        Database::open_in_memory().expect("Failed to create test database")
    }

    fn sample_task(id: &str, priority: i64, run_at_ms: i64) -> TaskRow {
        TaskRow {
            id: id.to_string(),
            job_id: format!("job-{}", id),
            owner_id: "u1".to_string(),
            source_path: "/tmp/cat.png".to_string(),
            media_kind: "image".to_string(),
            priority,
            attempt: 0,
            max_attempts: 3,
            backoff_kind: "exponential".to_string(),
            backoff_delay_ms: 2000,
            backoff_max_ms: 60_000,
            state: "waiting".to_string(),
            run_at_ms,
            lease_owner: None,
            lease_expires_at_ms: None,
            last_error: None,
            created_at: TS.to_string(),
            updated_at: TS.to_string(),
        }
    }

    #[test]
    fn test_claim_respects_priority_then_fifo() {
        let db = test_db();
        insert(&db, &sample_task("low-a", 5, 0)).unwrap();
        insert(&db, &sample_task("high", 1, 0)).unwrap();
        insert(&db, &sample_task("low-b", 5, 0)).unwrap();

        let order: Vec<String> = (0..3)
            .map(|_| {
                claim_next(&db, 10, "w", 1_000, TS)
                    .unwrap()
                    .unwrap()
                    .id
            })
            .collect();
        assert_eq!(order, vec!["high", "low-a", "low-b"]);
        assert!(claim_next(&db, 10, "w", 1_000, TS).unwrap().is_none());
    }

    #[test]
    fn test_claim_skips_delayed_tasks() {
        let db = test_db();
        insert(&db, &sample_task("later", 1, 5_000)).unwrap();

        assert!(claim_next(&db, 1_000, "w", 2_000, TS).unwrap().is_none());
        let claimed = claim_next(&db, 5_000, "w", 6_000, TS).unwrap().unwrap();
        assert_eq!(claimed.id, "later");
        assert_eq!(claimed.attempt, 1);
        assert_eq!(claimed.state, "active");
        assert_eq!(claimed.lease_owner.as_deref(), Some("w"));
    }

    #[test]
    fn test_finish_requires_matching_lease() {
        let db = test_db();
        insert(&db, &sample_task("t", 1, 0)).unwrap();
        let claimed = claim_next(&db, 0, "lease-1", 100, TS).unwrap().unwrap();

        let wrong = LeaseKey {
            id: "t",
            lease_owner: "lease-2",
            attempt: claimed.attempt,
        };
        assert!(!finish(&db, wrong, "completed", None, TS).unwrap());

        let right = LeaseKey {
            id: "t",
            lease_owner: "lease-1",
            attempt: claimed.attempt,
        };
        assert!(finish(&db, right, "completed", None, TS).unwrap());
        assert_eq!(find_by_id(&db, "t").unwrap().unwrap().state, "completed");
    }

    #[test]
    fn test_requeue_sets_run_at_and_error() {
        let db = test_db();
        insert(&db, &sample_task("t", 1, 0)).unwrap();
        claim_next(&db, 0, "lease-1", 100, TS).unwrap().unwrap();

        let key = LeaseKey {
            id: "t",
            lease_owner: "lease-1",
            attempt: 1,
        };
        assert!(requeue(&db, key, 2_000, "boom", TS).unwrap());

        let row = find_by_id(&db, "t").unwrap().unwrap();
        assert_eq!(row.state, "waiting");
        assert_eq!(row.run_at_ms, 2_000);
        assert_eq!(row.last_error.as_deref(), Some("boom"));
        assert!(row.lease_owner.is_none());
        assert_eq!(next_run_at(&db).unwrap(), Some(2_000));
    }

    #[test]
    fn test_extended_lease_is_not_reclaimed() {
        let db = test_db();
        insert(&db, &sample_task("t", 1, 0)).unwrap();
        claim_next(&db, 0, "lease-1", 100, TS).unwrap().unwrap();

        let key = LeaseKey {
            id: "t",
            lease_owner: "lease-1",
            attempt: 1,
        };
        assert!(extend_lease(&db, key, 1_000, TS).unwrap());

        let (requeued, exhausted) = reclaim_expired(&db, 500, "reaper", 1_500, TS).unwrap();
        assert_eq!(requeued, 0);
        assert!(exhausted.is_empty());
        assert_eq!(find_by_id(&db, "t").unwrap().unwrap().state, "active");

        let stranger = LeaseKey {
            lease_owner: "lease-2",
            ..key
        };
        assert!(!extend_lease(&db, stranger, 2_000, TS).unwrap());
    }

    #[test]
    fn test_reclaim_expired_splits_by_remaining_attempts() {
        let db = test_db();
        let mut spent = sample_task("spent", 1, 0);
        spent.max_attempts = 1;
        insert(&db, &spent).unwrap();
        insert(&db, &sample_task("fresh", 2, 0)).unwrap();

        claim_next(&db, 0, "dead-1", 100, TS).unwrap().unwrap();
        claim_next(&db, 0, "dead-2", 100, TS).unwrap().unwrap();

        // Not expired yet.
        let (requeued, exhausted) = reclaim_expired(&db, 50, "reaper", 500, TS).unwrap();
        assert_eq!(requeued, 0);
        assert!(exhausted.is_empty());

        let (requeued, exhausted) = reclaim_expired(&db, 200, "reaper", 500, TS).unwrap();
        assert_eq!(requeued, 1);
        assert_eq!(exhausted.len(), 1);
        assert_eq!(exhausted[0].id, "spent");
        assert_eq!(exhausted[0].lease_owner.as_deref(), Some("reaper"));

        assert_eq!(find_by_id(&db, "fresh").unwrap().unwrap().state, "waiting");
        assert_eq!(count_by_state(&db, "waiting").unwrap(), 1);
        assert_eq!(count_by_state(&db, "active").unwrap(), 1);
    }
}
