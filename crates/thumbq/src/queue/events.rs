//! Task lifecycle events.
//!
//! Events identify the job they concern but are not a copy of its state;
//! consumers read the job store for that.

use std::sync::Arc;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio::sync::broadcast;

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum QueueEventKind {
    /// Task is waiting for a worker (new or requeued for retry).
    Waiting,
    Active,
    Completed,
    Failed,
}

impl std::fmt::Display for QueueEventKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            QueueEventKind::Waiting => write!(f, "waiting"),
            QueueEventKind::Active => write!(f, "active"),
            QueueEventKind::Completed => write!(f, "completed"),
            QueueEventKind::Failed => write!(f, "failed"),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct QueueEvent {
    pub kind: QueueEventKind,
    pub task_id: String,
    pub job_id: String,
    pub attempt: u32,
    /// Set on `failed` events when another delivery will follow.
    #[serde(default)]
    pub will_retry: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    pub timestamp: DateTime<Utc>,
}

impl QueueEvent {
    pub fn new(kind: QueueEventKind, task_id: &str, job_id: &str, attempt: u32) -> Self {
        Self {
            kind,
            task_id: task_id.to_string(),
            job_id: job_id.to_string(),
            attempt,
            will_retry: false,
            error: None,
            timestamp: Utc::now(),
        }
    }

    pub fn failed(
        task_id: &str,
        job_id: &str,
        attempt: u32,
        error: &str,
        will_retry: bool,
    ) -> Self {
        Self {
            will_retry,
            error: Some(error.to_string()),
            ..Self::new(QueueEventKind::Failed, task_id, job_id, attempt)
        }
    }
}

/// Fans queue events out to any number of subscribers.
#[derive(Clone)]
pub struct QueueEventBroadcaster {
    sender: Arc<broadcast::Sender<QueueEvent>>,
}

impl QueueEventBroadcaster {
    pub fn new(capacity: usize) -> Self {
        let (sender, _) = broadcast::channel(capacity.max(1));
        Self {
            sender: Arc::new(sender),
        }
    }

    pub fn send(&self, event: QueueEvent) {
        log::trace!(
            "Queue event {} for task {} (job {})",
            event.kind,
            event.task_id,
            event.job_id
        );
        // No subscribers is fine.
        let _ = self.sender.send(event);
    }

    pub fn subscribe(&self) -> broadcast::Receiver<QueueEvent> {
        self.sender.subscribe()
    }
}

impl Default for QueueEventBroadcaster {
    fn default() -> Self {
        Self::new(256)
    }
}
