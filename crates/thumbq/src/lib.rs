//! Asynchronous thumbnail generation.
//!
//! A submitted upload becomes a [`job::Job`] in the job store and a task in
//! the durable queue. Workers lease tasks, run the media pipeline and move
//! the job to a terminal state; the event relay pushes every change to the
//! owner's live connections.

pub mod config;
pub mod db;
pub mod error;
pub mod job;
pub mod media;
pub mod pipeline;
pub mod queue;
pub mod relay;
pub mod sanitize;
pub mod service;
pub mod worker;

pub use config::{load_config, Config};
pub use error::{ConfigError, JobError, MediaError, QueueError, Result, SubmitError, ThumbqError};
pub use job::{Job, JobStatus, JobStore, SqliteJobStore};
pub use media::MediaKind;
pub use pipeline::{FfmpegCli, FrameSource, Pipeline, PipelineConfig, PipelineError};
pub use queue::{BackoffPolicy, EnqueueOptions, SqliteTaskQueue, TaskQueue};
pub use relay::{ChannelConnection, Connection, EventRelay, JobMessage, Subscription};
pub use service::{ServiceSettings, SubmitRequest, ThumbnailService};
pub use worker::{TaskProcessor, WorkerPool};
