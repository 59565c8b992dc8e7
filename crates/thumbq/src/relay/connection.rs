//! Live client connections the relay pushes job updates to.

use chrono::{DateTime, Utc};
use crossbeam_channel::{bounded, Receiver, Sender, TrySendError};
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::job::{Job, JobStatus};

/// Job state as pushed to subscribers.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct JobMessage {
    pub id: String,
    pub owner_id: String,
    pub status: JobStatus,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub thumbnail_file: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl From<&Job> for JobMessage {
    fn from(job: &Job) -> Self {
        Self {
            id: job.id.clone(),
            owner_id: job.owner_id.clone(),
            status: job.status,
            thumbnail_file: job.thumbnail_file.clone(),
            error: job.error_message.clone(),
            created_at: job.created_at,
            updated_at: job.updated_at,
        }
    }
}

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum DeliveryError {
    /// The peer is gone; the relay forgets the connection.
    #[error("connection closed")]
    Closed,

    /// This message was lost but the connection stays registered.
    #[error("delivery failed: {0}")]
    Failed(String),
}

/// A realtime channel to one client.
pub trait Connection: Send + Sync {
    fn send(&self, message: &JobMessage) -> Result<(), DeliveryError>;
}

/// Connection backed by an in-process channel. The transport layer drains
/// the receiving end.
pub struct ChannelConnection {
    tx: Sender<JobMessage>,
}

impl ChannelConnection {
    /// Creates a connection buffering up to `capacity` undelivered messages.
    /// Messages beyond that are dropped.
    pub fn bounded(capacity: usize) -> (Self, Receiver<JobMessage>) {
        let (tx, rx) = bounded(capacity.max(1));
        (Self { tx }, rx)
    }
}

impl Connection for ChannelConnection {
    fn send(&self, message: &JobMessage) -> Result<(), DeliveryError> {
        match self.tx.try_send(message.clone()) {
            Ok(()) => Ok(()),
            Err(TrySendError::Full(_)) => Err(DeliveryError::Failed("buffer full".to_string())),
            Err(TrySendError::Disconnected(_)) => Err(DeliveryError::Closed),
        }
    }
}
