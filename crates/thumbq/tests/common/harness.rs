//! Test harness for isolated end-to-end runs.
//!
//! The `TestHarness` owns a temp directory holding the database file and the
//! upload directory, and wires the job store, SQLite queue, event relay and
//! media pipeline the way the daemon does.

#![allow(dead_code)]

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::{Duration, Instant};

use image::{Rgb, RgbImage};
use tempfile::TempDir;

use thumbq::config::LimitsConfig;
use thumbq::db::Database;
use thumbq::job::{Job, JobStatus, JobStore, SqliteJobStore};
use thumbq::pipeline::{FrameSource, Pipeline, PipelineConfig};
use thumbq::queue::{
    BackoffPolicy, EnqueueOptions, QueueEvent, QueueEventBroadcaster, SqliteTaskQueue, TaskQueue,
};
use thumbq::relay::EventRelay;
use thumbq::service::{ServiceSettings, SubmitRequest, ThumbnailService};
use thumbq::worker::{TaskProcessor, WorkerPool};

use super::FakeFrames;

pub struct HarnessOptions {
    pub lease_timeout: Duration,
    pub enqueue: EnqueueOptions,
    pub limits: LimitsConfig,
    pub frames: Arc<FakeFrames>,
}

impl Default for HarnessOptions {
    fn default() -> Self {
        Self {
            lease_timeout: Duration::from_secs(60),
            enqueue: EnqueueOptions {
                priority: 1,
                max_attempts: 3,
                backoff: BackoffPolicy::Fixed { delay_ms: 10 },
            },
            limits: LimitsConfig::default(),
            frames: Arc::new(FakeFrames::with_duration(Duration::from_secs(90))),
        }
    }
}

pub struct TestHarness {
    temp_dir: TempDir,
    /// Where uploads are staged and thumbnails are published.
    pub upload_dir: PathBuf,
    pub store: Arc<SqliteJobStore>,
    pub queue: Arc<SqliteTaskQueue>,
    pub relay: Arc<EventRelay>,
    pub pipeline: Arc<Pipeline>,
    pub frames: Arc<FakeFrames>,
    enqueue: EnqueueOptions,
    limits: LimitsConfig,
}

impl TestHarness {
    pub fn new() -> Self {
        Self::with_options(HarnessOptions::default())
    }

    pub fn with_options(options: HarnessOptions) -> Self {
        let temp_dir = TempDir::new().expect("Failed to create temp directory");
        let upload_dir = temp_dir.path().join("uploads");

        let db =
            Database::open(&temp_dir.path().join("thumbq.db")).expect("Failed to open database");
        let store = Arc::new(SqliteJobStore::new(db.clone()));
        let queue = Arc::new(SqliteTaskQueue::with_events(
            db,
            options.lease_timeout,
            QueueEventBroadcaster::new(1024),
        ));
        let relay = Arc::new(EventRelay::new(store.clone()));

        let frames = options.frames;
        let frame_source: Arc<dyn FrameSource> = frames.clone();
        let pipeline = Pipeline::new(
            PipelineConfig {
                upload_directory: upload_dir.clone(),
                width: 128,
                height: 128,
                quality: 80,
                stale_scratch_after: Duration::from_secs(600),
            },
            frame_source,
        )
        .expect("Failed to create pipeline");

        Self {
            temp_dir,
            upload_dir,
            store,
            queue,
            relay,
            pipeline: Arc::new(pipeline),
            frames,
            enqueue: options.enqueue,
            limits: options.limits,
        }
    }

    pub fn temp_path(&self) -> &Path {
        self.temp_dir.path()
    }

    /// A service backed by the harness queue.
    pub fn service(&self) -> ThumbnailService {
        self.service_with_queue(self.queue.clone())
    }

    /// A service that enqueues into `queue` instead of the harness queue.
    pub fn service_with_queue(&self, queue: Arc<dyn TaskQueue>) -> ThumbnailService {
        ThumbnailService::new(
            self.store.clone(),
            queue,
            self.relay.clone(),
            ServiceSettings {
                upload_directory: self.upload_dir.clone(),
                enqueue: self.enqueue.clone(),
                limits: self.limits.clone(),
            },
        )
    }

    pub fn processor(&self) -> Arc<TaskProcessor> {
        Arc::new(TaskProcessor::new(
            self.store.clone(),
            self.queue.clone(),
            self.pipeline.clone(),
        ))
    }

    pub fn start_pool(&self, workers: usize) -> WorkerPool {
        WorkerPool::new(
            self.queue.clone(),
            self.processor(),
            workers,
            Duration::from_millis(20),
        )
    }

    /// Writes a PNG into the upload directory and describes it as an upload.
    pub fn png_upload(&self, owner: &str, name: &str, width: u32, height: u32) -> SubmitRequest {
        let path = self.upload_dir.join(name);
        RgbImage::from_fn(width, height, |x, y| Rgb([(x % 256) as u8, (y % 256) as u8, 128]))
            .save(&path)
            .expect("Failed to write PNG fixture");
        self.request(owner, name, "image/png", path)
    }

    /// Writes arbitrary bytes into the upload directory.
    pub fn raw_upload(
        &self,
        owner: &str,
        name: &str,
        mime_type: &str,
        bytes: &[u8],
    ) -> SubmitRequest {
        let path = self.upload_dir.join(name);
        std::fs::write(&path, bytes).expect("Failed to write upload fixture");
        self.request(owner, name, mime_type, path)
    }

    fn request(&self, owner: &str, name: &str, mime_type: &str, path: PathBuf) -> SubmitRequest {
        let size_bytes = std::fs::metadata(&path).map(|m| m.len()).unwrap_or(0);
        SubmitRequest {
            owner_id: owner.to_string(),
            source_path: path,
            original_name: name.to_string(),
            mime_type: mime_type.to_string(),
            size_bytes,
        }
    }

    /// Polls the store until the job reaches `status` or `timeout` passes.
    pub fn wait_for_status(&self, job_id: &str, status: JobStatus, timeout: Duration) -> Job {
        let deadline = Instant::now() + timeout;
        loop {
            let job = self.store.get(job_id).expect("Job disappeared");
            if job.status == status {
                return job;
            }
            assert!(
                Instant::now() < deadline,
                "job {} stuck in {} (wanted {})",
                job_id,
                job.status,
                status
            );
            std::thread::sleep(Duration::from_millis(10));
        }
    }

    /// Names of published thumbnails in the upload directory.
    pub fn thumbnails(&self) -> Vec<String> {
        let mut names: Vec<String> = std::fs::read_dir(&self.upload_dir)
            .expect("Failed to list upload directory")
            .filter_map(|e| e.ok())
            .map(|e| e.file_name().to_string_lossy().to_string())
            .filter(|n| n.starts_with("thumb-"))
            .collect();
        names.sort();
        names
    }

    /// Files left over from interrupted renders.
    pub fn scratch_files(&self) -> Vec<String> {
        std::fs::read_dir(&self.upload_dir)
            .expect("Failed to list upload directory")
            .filter_map(|e| e.ok())
            .map(|e| e.file_name().to_string_lossy().to_string())
            .filter(|n| n.starts_with(thumbq::pipeline::output::SCRATCH_PREFIX))
            .collect()
    }
}

/// Drains every event currently buffered on `rx`.
pub fn drain(rx: &mut tokio::sync::broadcast::Receiver<QueueEvent>) -> Vec<QueueEvent> {
    let mut events = Vec::new();
    while let Ok(event) = rx.try_recv() {
        events.push(event);
    }
    events
}
