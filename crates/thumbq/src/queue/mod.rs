//! Durable at-least-once task queue.
//!
//! A task is leased to one worker at a time. Leases that expire without an
//! acknowledgement are reclaimed and the task is delivered again, so every
//! step a worker performs must be safe to repeat.

pub mod events;
pub mod sqlite;

use std::path::PathBuf;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tokio::sync::broadcast;

use crate::error::QueueError;
use crate::media::MediaKind;

pub use events::{QueueEvent, QueueEventBroadcaster, QueueEventKind};
pub use sqlite::SqliteTaskQueue;

pub type TaskId = String;

/// What a worker needs to process a job.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TaskPayload {
    pub job_id: String,
    pub source_path: PathBuf,
    pub owner_id: String,
    pub media_kind: MediaKind,
}

/// How long to wait before redelivering a failed task.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "lowercase")]
pub enum BackoffPolicy {
    Fixed {
        delay_ms: u64,
    },
    /// `delay_ms * 2^n` for the n-th retry (0-based), capped at `max_delay_ms`.
    Exponential {
        delay_ms: u64,
        #[serde(default = "default_max_delay_ms")]
        max_delay_ms: u64,
    },
}

fn default_max_delay_ms() -> u64 {
    60_000
}

impl BackoffPolicy {
    /// Delay before the retry that follows the failure of `attempt`
    /// (1-based delivery number).
    pub fn delay_for(&self, attempt: u32) -> Duration {
        match *self {
            BackoffPolicy::Fixed { delay_ms } => Duration::from_millis(delay_ms),
            BackoffPolicy::Exponential {
                delay_ms,
                max_delay_ms,
            } => {
                let exponent = attempt.saturating_sub(1).min(32);
                let scaled = delay_ms.saturating_mul(1u64 << exponent);
                Duration::from_millis(scaled.min(max_delay_ms))
            }
        }
    }

    pub(crate) fn kind(&self) -> &'static str {
        match self {
            BackoffPolicy::Fixed { .. } => "fixed",
            BackoffPolicy::Exponential { .. } => "exponential",
        }
    }

    pub(crate) fn base_ms(&self) -> u64 {
        match *self {
            BackoffPolicy::Fixed { delay_ms } | BackoffPolicy::Exponential { delay_ms, .. } => {
                delay_ms
            }
        }
    }

    pub(crate) fn max_ms(&self) -> u64 {
        match *self {
            BackoffPolicy::Fixed { delay_ms } => delay_ms,
            BackoffPolicy::Exponential { max_delay_ms, .. } => max_delay_ms,
        }
    }

    pub(crate) fn from_parts(kind: &str, delay_ms: u64, max_delay_ms: u64) -> Option<Self> {
        match kind {
            "fixed" => Some(BackoffPolicy::Fixed { delay_ms }),
            "exponential" => Some(BackoffPolicy::Exponential {
                delay_ms,
                max_delay_ms,
            }),
            _ => None,
        }
    }
}

impl Default for BackoffPolicy {
    fn default() -> Self {
        BackoffPolicy::Exponential {
            delay_ms: 2000,
            max_delay_ms: default_max_delay_ms(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EnqueueOptions {
    /// Lower numbers are served first.
    pub priority: i32,
    pub max_attempts: u32,
    pub backoff: BackoffPolicy,
}

impl Default for EnqueueOptions {
    fn default() -> Self {
        Self {
            priority: 1,
            max_attempts: 3,
            backoff: BackoffPolicy::default(),
        }
    }
}

/// One leased attempt of a task.
#[derive(Debug, Clone)]
pub struct Delivery {
    pub task_id: TaskId,
    pub payload: TaskPayload,
    /// 1-based delivery number.
    pub attempt: u32,
    pub max_attempts: u32,
    pub(crate) lease_token: String,
}

impl Delivery {
    pub fn is_last_attempt(&self) -> bool {
        self.attempt >= self.max_attempts
    }
}

/// What the queue did with a failed delivery.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FailureOutcome {
    Retrying { next_attempt: u32, delay: Duration },
    Exhausted,
}

pub trait TaskQueue: Send + Sync {
    fn enqueue(&self, payload: TaskPayload, options: &EnqueueOptions)
        -> Result<TaskId, QueueError>;

    /// Leases the next ready task to `worker`, if any.
    fn dequeue(&self, worker: &str) -> Result<Option<Delivery>, QueueError>;

    /// How long a lease lasts without renewal.
    fn lease_timeout(&self) -> Duration;

    /// Pushes the delivery's lease expiry a full `lease_timeout` past now.
    /// Fails with `LeaseLost` once the task was reclaimed or settled.
    fn extend_lease(&self, delivery: &Delivery) -> Result<(), QueueError>;

    /// Announces that the delivery's job is now being processed (`active`).
    fn mark_active(&self, delivery: &Delivery) -> Result<(), QueueError>;

    /// Acknowledges successful processing (`completed`).
    fn complete(&self, delivery: &Delivery) -> Result<(), QueueError>;

    /// Reports a failed attempt (`failed`) and applies the retry policy.
    fn fail(
        &self,
        delivery: &Delivery,
        error: &str,
        retryable: bool,
    ) -> Result<FailureOutcome, QueueError>;

    /// Returns expired leases to the queue. Tasks that have no deliveries
    /// left are leased to `worker` and returned so it can finalize them.
    fn reclaim_stalled(&self, worker: &str) -> Result<Vec<Delivery>, QueueError>;

    fn subscribe(&self) -> broadcast::Receiver<QueueEvent>;

    /// Blocks until work may be available or `timeout` elapses.
    fn wait_for_work(&self, timeout: Duration);
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_exponential_delay_doubles() {
        let policy = BackoffPolicy::Exponential {
            delay_ms: 2000,
            max_delay_ms: 60_000,
        };
        assert_eq!(policy.delay_for(1), Duration::from_millis(2000));
        assert_eq!(policy.delay_for(2), Duration::from_millis(4000));
        assert_eq!(policy.delay_for(3), Duration::from_millis(8000));
    }

    #[test]
    fn test_exponential_delay_is_capped() {
        let policy = BackoffPolicy::Exponential {
            delay_ms: 2000,
            max_delay_ms: 5000,
        };
        assert_eq!(policy.delay_for(10), Duration::from_millis(5000));
        assert_eq!(policy.delay_for(u32::MAX), Duration::from_millis(5000));
    }

    #[test]
    fn test_fixed_delay() {
        let policy = BackoffPolicy::Fixed { delay_ms: 750 };
        assert_eq!(policy.delay_for(1), policy.delay_for(5));
    }

    #[test]
    fn test_backoff_parts_round_trip() {
        for policy in [
            BackoffPolicy::Fixed { delay_ms: 10 },
            BackoffPolicy::Exponential {
                delay_ms: 20,
                max_delay_ms: 400,
            },
        ] {
            let rebuilt =
                BackoffPolicy::from_parts(policy.kind(), policy.base_ms(), policy.max_ms());
            assert_eq!(rebuilt, Some(policy));
        }
        assert_eq!(BackoffPolicy::from_parts("linear", 1, 1), None);
    }

    #[test]
    fn test_backoff_deserializes_tagged() {
        let policy: BackoffPolicy =
            serde_json::from_str(r#"{"type": "exponential", "delay_ms": 2000}"#).unwrap();
        assert_eq!(
            policy,
            BackoffPolicy::Exponential {
                delay_ms: 2000,
                max_delay_ms: 60_000
            }
        );
    }
}
