//! SQLite-backed task queue.

use std::path::PathBuf;
use std::time::Duration;

use chrono::Utc;
use crossbeam_channel::{bounded, Receiver, Sender};
use tokio::sync::broadcast;

use crate::db::task_repo::{self, LeaseKey, TaskRow};
use crate::db::Database;
use crate::error::QueueError;
use crate::job::store::format_timestamp;

use super::events::{QueueEvent, QueueEventBroadcaster, QueueEventKind};
use super::{Delivery, EnqueueOptions, FailureOutcome, TaskId, TaskPayload, TaskQueue};

/// Pending wake-ups kept for idle workers. Extra rings only cause a spurious
/// poll.
const DOORBELL_CAPACITY: usize = 64;

pub struct SqliteTaskQueue {
    db: Database,
    events: QueueEventBroadcaster,
    lease_timeout: Duration,
    doorbell_tx: Sender<()>,
    doorbell_rx: Receiver<()>,
}

impl SqliteTaskQueue {
    pub fn new(db: Database, lease_timeout: Duration) -> Self {
        Self::with_events(db, lease_timeout, QueueEventBroadcaster::default())
    }

    pub fn with_events(
        db: Database,
        lease_timeout: Duration,
        events: QueueEventBroadcaster,
    ) -> Self {
        let (doorbell_tx, doorbell_rx) = bounded(DOORBELL_CAPACITY);
        Self {
            db,
            events,
            lease_timeout,
            doorbell_tx,
            doorbell_rx,
        }
    }

    /// Number of tasks in `state` (waiting, active, completed, failed).
    pub fn count(&self, state: &str) -> Result<u64, QueueError> {
        Ok(task_repo::count_by_state(&self.db, state)?)
    }

    fn ring(&self) {
        let _ = self.doorbell_tx.try_send(());
    }

    fn lease_expiry(&self, now_ms: i64) -> i64 {
        let lease_ms = i64::try_from(self.lease_timeout.as_millis()).unwrap_or(i64::MAX);
        now_ms.saturating_add(lease_ms)
    }

    fn lease_key<'a>(delivery: &'a Delivery) -> LeaseKey<'a> {
        LeaseKey {
            id: &delivery.task_id,
            lease_owner: &delivery.lease_token,
            attempt: i64::from(delivery.attempt),
        }
    }
}

fn now_ms() -> i64 {
    Utc::now().timestamp_millis()
}

fn delivery_from_row(row: TaskRow) -> Result<Delivery, QueueError> {
    let corrupt = |reason: String| QueueError::Corrupt {
        id: row.id.clone(),
        reason,
    };

    let media_kind = row
        .media_kind
        .parse()
        .map_err(|e: crate::error::MediaError| corrupt(e.to_string()))?;
    let attempt = u32::try_from(row.attempt).map_err(|_| corrupt("bad attempt".to_string()))?;
    let max_attempts =
        u32::try_from(row.max_attempts).map_err(|_| corrupt("bad max_attempts".to_string()))?;
    let lease_token = row
        .lease_owner
        .clone()
        .ok_or_else(|| corrupt("leased task without owner".to_string()))?;

    Ok(Delivery {
        task_id: row.id,
        payload: TaskPayload {
            job_id: row.job_id,
            source_path: PathBuf::from(row.source_path),
            owner_id: row.owner_id,
            media_kind,
        },
        attempt,
        max_attempts,
        lease_token,
    })
}

impl TaskQueue for SqliteTaskQueue {
    fn enqueue(
        &self,
        payload: TaskPayload,
        options: &EnqueueOptions,
    ) -> Result<TaskId, QueueError> {
        let now = format_timestamp(Utc::now());
        let row = TaskRow {
            id: uuid::Uuid::new_v4().to_string(),
            job_id: payload.job_id,
            owner_id: payload.owner_id,
            source_path: payload.source_path.to_string_lossy().to_string(),
            media_kind: payload.media_kind.as_str().to_string(),
            priority: i64::from(options.priority),
            attempt: 0,
            max_attempts: i64::from(options.max_attempts.max(1)),
            backoff_kind: options.backoff.kind().to_string(),
            backoff_delay_ms: i64::try_from(options.backoff.base_ms()).unwrap_or(i64::MAX),
            backoff_max_ms: i64::try_from(options.backoff.max_ms()).unwrap_or(i64::MAX),
            state: "waiting".to_string(),
            run_at_ms: now_ms(),
            lease_owner: None,
            lease_expires_at_ms: None,
            last_error: None,
            created_at: now.clone(),
            updated_at: now,
        };

        task_repo::insert(&self.db, &row).map_err(|e| QueueError::Unavailable(e.to_string()))?;

        log::debug!("Enqueued task {} for job {}", row.id, row.job_id);
        self.events
            .send(QueueEvent::new(QueueEventKind::Waiting, &row.id, &row.job_id, 0));
        self.ring();
        Ok(row.id)
    }

    fn dequeue(&self, worker: &str) -> Result<Option<Delivery>, QueueError> {
        let now = now_ms();
        let token = format!("{}:{}", worker, uuid::Uuid::new_v4());
        let updated_at = format_timestamp(Utc::now());

        match task_repo::claim_next(&self.db, now, &token, self.lease_expiry(now), &updated_at)? {
            Some(row) => delivery_from_row(row).map(Some),
            None => Ok(None),
        }
    }

    fn lease_timeout(&self) -> Duration {
        self.lease_timeout
    }

    fn extend_lease(&self, delivery: &Delivery) -> Result<(), QueueError> {
        let updated_at = format_timestamp(Utc::now());
        let expires = self.lease_expiry(now_ms());
        if !task_repo::extend_lease(&self.db, Self::lease_key(delivery), expires, &updated_at)? {
            return Err(QueueError::LeaseLost(delivery.task_id.clone()));
        }
        Ok(())
    }

    fn mark_active(&self, delivery: &Delivery) -> Result<(), QueueError> {
        self.events.send(QueueEvent::new(
            QueueEventKind::Active,
            &delivery.task_id,
            &delivery.payload.job_id,
            delivery.attempt,
        ));
        Ok(())
    }

    fn complete(&self, delivery: &Delivery) -> Result<(), QueueError> {
        let updated_at = format_timestamp(Utc::now());
        if !task_repo::finish(
            &self.db,
            Self::lease_key(delivery),
            "completed",
            None,
            &updated_at,
        )? {
            return Err(QueueError::LeaseLost(delivery.task_id.clone()));
        }

        self.events.send(QueueEvent::new(
            QueueEventKind::Completed,
            &delivery.task_id,
            &delivery.payload.job_id,
            delivery.attempt,
        ));
        Ok(())
    }

    fn fail(
        &self,
        delivery: &Delivery,
        error: &str,
        retryable: bool,
    ) -> Result<FailureOutcome, QueueError> {
        let updated_at = format_timestamp(Utc::now());
        let key = Self::lease_key(delivery);

        let row = task_repo::find_by_id(&self.db, &delivery.task_id)?
            .ok_or_else(|| QueueError::LeaseLost(delivery.task_id.clone()))?;
        let backoff = super::BackoffPolicy::from_parts(
            &row.backoff_kind,
            row.backoff_delay_ms.max(0) as u64,
            row.backoff_max_ms.max(0) as u64,
        )
        .ok_or_else(|| QueueError::Corrupt {
            id: row.id.clone(),
            reason: format!("unknown backoff '{}'", row.backoff_kind),
        })?;

        let outcome = if retryable && !delivery.is_last_attempt() {
            let delay = backoff.delay_for(delivery.attempt);
            let delay_ms = i64::try_from(delay.as_millis()).unwrap_or(i64::MAX);
            let run_at = now_ms().saturating_add(delay_ms);
            if !task_repo::requeue(&self.db, key, run_at, error, &updated_at)? {
                return Err(QueueError::LeaseLost(delivery.task_id.clone()));
            }
            FailureOutcome::Retrying {
                next_attempt: delivery.attempt + 1,
                delay,
            }
        } else {
            if !task_repo::finish(&self.db, key, "failed", Some(error), &updated_at)? {
                return Err(QueueError::LeaseLost(delivery.task_id.clone()));
            }
            FailureOutcome::Exhausted
        };

        let will_retry = matches!(outcome, FailureOutcome::Retrying { .. });
        self.events.send(QueueEvent::failed(
            &delivery.task_id,
            &delivery.payload.job_id,
            delivery.attempt,
            error,
            will_retry,
        ));
        if will_retry {
            self.ring();
        }

        Ok(outcome)
    }

    fn reclaim_stalled(&self, worker: &str) -> Result<Vec<Delivery>, QueueError> {
        let now = now_ms();
        let token = format!("{}:reclaim:{}", worker, uuid::Uuid::new_v4());
        let updated_at = format_timestamp(Utc::now());

        let (requeued, exhausted) = task_repo::reclaim_expired(
            &self.db,
            now,
            &token,
            self.lease_expiry(now),
            &updated_at,
        )?;

        if requeued > 0 {
            log::warn!(
                "Reclaimed {} task(s) whose lease expired; they will be redelivered",
                requeued
            );
            self.ring();
        }

        exhausted.into_iter().map(delivery_from_row).collect()
    }

    fn subscribe(&self) -> broadcast::Receiver<QueueEvent> {
        self.events.subscribe()
    }

    fn wait_for_work(&self, timeout: Duration) {
        let wait = match task_repo::next_run_at(&self.db) {
            Ok(Some(run_at)) => {
                let until = u64::try_from(run_at - now_ms()).unwrap_or(0);
                timeout.min(Duration::from_millis(until))
            }
            Ok(None) => timeout,
            Err(e) => {
                log::warn!("Failed to inspect queue for next task: {}", e);
                timeout
            }
        };

        if wait.is_zero() {
            return;
        }
        let _ = self.doorbell_rx.recv_timeout(wait);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::media::MediaKind;
    use crate::queue::BackoffPolicy;

    fn queue(lease: Duration) -> SqliteTaskQueue {
        SqliteTaskQueue::new(Database::open_in_memory().unwrap(), lease)
    }

    fn payload(job: &str) -> TaskPayload {
        TaskPayload {
            job_id: job.to_string(),
            source_path: PathBuf::from("/uploads/cat.png"),
            owner_id: "u1".to_string(),
            media_kind: MediaKind::Image,
        }
    }

    fn options(max_attempts: u32, delay_ms: u64) -> EnqueueOptions {
        EnqueueOptions {
            priority: 1,
            max_attempts,
            backoff: BackoffPolicy::Exponential {
                delay_ms,
                max_delay_ms: 60_000,
            },
        }
    }

    #[test]
    fn test_enqueue_dequeue_complete() {
        let q = queue(Duration::from_secs(60));
        let mut events = q.subscribe();

        let task_id = q.enqueue(payload("j1"), &options(3, 10)).unwrap();
        let delivery = q.dequeue("w0").unwrap().unwrap();
        assert_eq!(delivery.task_id, task_id);
        assert_eq!(delivery.payload, payload("j1"));
        assert_eq!(delivery.attempt, 1);
        assert!(q.dequeue("w1").unwrap().is_none());

        q.mark_active(&delivery).unwrap();
        q.complete(&delivery).unwrap();
        assert_eq!(q.count("completed").unwrap(), 1);

        let kinds: Vec<_> = std::iter::from_fn(|| events.try_recv().ok())
            .map(|e| e.kind)
            .collect();
        assert_eq!(
            kinds,
            vec![
                QueueEventKind::Waiting,
                QueueEventKind::Active,
                QueueEventKind::Completed
            ]
        );
    }

    #[test]
    fn test_failure_is_retried_with_increasing_delay() {
        let q = queue(Duration::from_secs(60));

        q.enqueue(payload("j1"), &options(3, 1000)).unwrap();

        let first = q.dequeue("w0").unwrap().unwrap();
        let outcome = q.fail(&first, "decode error", true).unwrap();
        let FailureOutcome::Retrying {
            next_attempt,
            delay: first_delay,
        } = outcome
        else {
            panic!("expected retry, got {:?}", outcome);
        };
        assert_eq!(next_attempt, 2);
        assert_eq!(first_delay, Duration::from_millis(1000));

        // Backoff keeps it invisible for now.
        assert!(q.dequeue("w0").unwrap().is_none());
        assert_eq!(q.count("waiting").unwrap(), 1);
    }

    #[test]
    fn test_failure_exhausts_after_max_attempts() {
        let q = queue(Duration::from_secs(60));
        let mut events = q.subscribe();
        q.enqueue(payload("j1"), &options(3, 0)).unwrap();

        let mut delays = Vec::new();
        for attempt in 1..=3 {
            let delivery = q.dequeue("w0").unwrap().unwrap();
            assert_eq!(delivery.attempt, attempt);
            match q.fail(&delivery, "corrupt", true).unwrap() {
                FailureOutcome::Retrying { delay, .. } => delays.push(delay),
                FailureOutcome::Exhausted => assert_eq!(attempt, 3),
            }
        }

        assert_eq!(delays.len(), 2);
        assert!(q.dequeue("w0").unwrap().is_none());
        assert_eq!(q.count("failed").unwrap(), 1);

        let failed: Vec<_> = std::iter::from_fn(|| events.try_recv().ok())
            .filter(|e| e.kind == QueueEventKind::Failed)
            .map(|e| e.will_retry)
            .collect();
        assert_eq!(failed, vec![true, true, false]);
    }

    #[test]
    fn test_non_retryable_failure_is_final() {
        let q = queue(Duration::from_secs(60));
        q.enqueue(payload("j1"), &options(3, 0)).unwrap();

        let delivery = q.dequeue("w0").unwrap().unwrap();
        assert_eq!(
            q.fail(&delivery, "job record missing", false).unwrap(),
            FailureOutcome::Exhausted
        );
        assert_eq!(q.count("failed").unwrap(), 1);
    }

    #[test]
    fn test_expired_lease_is_redelivered() {
        let q = queue(Duration::from_millis(1));
        q.enqueue(payload("j1"), &options(3, 0)).unwrap();

        let crashed = q.dequeue("w0").unwrap().unwrap();
        std::thread::sleep(Duration::from_millis(20));

        assert!(q.reclaim_stalled("w1").unwrap().is_empty());
        let redelivered = q.dequeue("w1").unwrap().unwrap();
        assert_eq!(redelivered.task_id, crashed.task_id);
        assert_eq!(redelivered.attempt, 2);

        // The crashed attempt can no longer acknowledge.
        assert!(matches!(
            q.complete(&crashed),
            Err(QueueError::LeaseLost(_))
        ));
    }

    #[test]
    fn test_renewed_lease_survives_past_its_first_expiry() {
        let q = queue(Duration::from_millis(100));
        q.enqueue(payload("j1"), &options(3, 0)).unwrap();
        let delivery = q.dequeue("w0").unwrap().unwrap();

        for _ in 0..3 {
            std::thread::sleep(Duration::from_millis(50));
            q.extend_lease(&delivery).unwrap();
            assert!(q.reclaim_stalled("w1").unwrap().is_empty());
            assert!(q.dequeue("w1").unwrap().is_none());
        }

        q.complete(&delivery).unwrap();
        assert!(matches!(
            q.extend_lease(&delivery),
            Err(QueueError::LeaseLost(_))
        ));
    }

    #[test]
    fn test_stalled_task_without_attempts_left_is_handed_back() {
        let q = queue(Duration::from_millis(1));
        q.enqueue(payload("j1"), &options(1, 0)).unwrap();

        let crashed = q.dequeue("w0").unwrap().unwrap();
        std::thread::sleep(Duration::from_millis(20));

        let exhausted = q.reclaim_stalled("w1").unwrap();
        assert_eq!(exhausted.len(), 1);
        assert_eq!(exhausted[0].task_id, crashed.task_id);
        assert!(exhausted[0].is_last_attempt());

        assert_eq!(
            q.fail(&exhausted[0], "worker crashed", true).unwrap(),
            FailureOutcome::Exhausted
        );
    }

    #[test]
    fn test_wait_for_work_returns_on_enqueue() {
        let q = std::sync::Arc::new(queue(Duration::from_secs(60)));
        let waiter = {
            let q = std::sync::Arc::clone(&q);
            std::thread::spawn(move || {
                let start = std::time::Instant::now();
                q.wait_for_work(Duration::from_secs(5));
                start.elapsed()
            })
        };

        std::thread::sleep(Duration::from_millis(50));
        q.enqueue(payload("j1"), &options(1, 0)).unwrap();

        let waited = waiter.join().unwrap();
        assert!(waited < Duration::from_secs(5));
    }
}
