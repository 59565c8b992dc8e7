//! What a worker does with one delivery.

use std::sync::Arc;
use std::time::Duration;

use crossbeam_channel::RecvTimeoutError;
use log::{debug, error, info, warn};

use crate::error::{JobError, QueueError};
use crate::job::{JobStatus, JobStore, TransitionFields};
use crate::pipeline::Pipeline;
use crate::queue::{Delivery, FailureOutcome, TaskQueue};
use crate::sanitize::{redact_path, redact_paths_in};

/// Error recorded when a worker died on the last allowed delivery.
pub const INTERRUPTED_MESSAGE: &str = "Processing was interrupted and no attempts remain";

const MISSING_JOB_MESSAGE: &str = "Job record missing";

/// Renewals per lease period while a render runs.
const RENEWALS_PER_LEASE: u32 = 3;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TaskOutcome {
    Completed { thumbnail_file: String },
    Failed { will_retry: bool },
    /// The job was already completed by an earlier delivery.
    Duplicate,
    /// The job no longer exists; the task was discarded.
    Dropped,
}

pub struct TaskProcessor {
    store: Arc<dyn JobStore>,
    queue: Arc<dyn TaskQueue>,
    pipeline: Arc<Pipeline>,
}

impl TaskProcessor {
    pub fn new(
        store: Arc<dyn JobStore>,
        queue: Arc<dyn TaskQueue>,
        pipeline: Arc<Pipeline>,
    ) -> Self {
        Self {
            store,
            queue,
            pipeline,
        }
    }

    /// Drives the job through `processing` to a terminal state and reports
    /// the result to the queue. Every step tolerates a repeated delivery.
    pub fn process(&self, delivery: &Delivery) -> TaskOutcome {
        let payload = &delivery.payload;
        let _span = tracing::info_span!(
            "worker.task",
            job_id = %payload.job_id,
            attempt = delivery.attempt,
            kind = %payload.media_kind,
            source = %redact_path(&payload.source_path)
        )
        .entered();

        match self
            .store
            .transition(&payload.job_id, JobStatus::Processing, TransitionFields::none())
        {
            Ok(_) => {}
            Err(JobError::InvalidTransition {
                from: JobStatus::Completed,
                ..
            }) => {
                info!(
                    "Job {} already completed, acknowledging duplicate delivery",
                    payload.job_id
                );
                self.acknowledge(delivery);
                return TaskOutcome::Duplicate;
            }
            Err(JobError::NotFound(_)) => {
                warn!("Job {} no longer exists, dropping task", payload.job_id);
                self.report_failure(delivery, MISSING_JOB_MESSAGE, false);
                return TaskOutcome::Dropped;
            }
            Err(e) => {
                error!("Job {} could not enter processing: {}", payload.job_id, e);
                return self.fail_job(delivery, &e.to_string());
            }
        }

        if let Err(e) = self.queue.mark_active(delivery) {
            warn!("Failed to announce job {} as active: {}", payload.job_id, e);
        }

        let rendered = self.holding_lease(delivery, || {
            self.pipeline.generate(&payload.source_path, payload.media_kind)
        });
        let thumbnail_file = match rendered {
            Ok(name) => name,
            Err(e) => {
                warn!(
                    "Thumbnail generation failed for job {} (attempt {}/{}): {}",
                    payload.job_id, delivery.attempt, delivery.max_attempts, e
                );
                return self.fail_job(delivery, &e.to_string());
            }
        };

        if let Err(e) = self.store.transition(
            &payload.job_id,
            JobStatus::Completed,
            TransitionFields::thumbnail(&thumbnail_file),
        ) {
            error!("Failed to record thumbnail for job {}: {}", payload.job_id, e);
            self.discard_thumbnail(&thumbnail_file);
            return self.fail_job(delivery, &e.to_string());
        }

        info!("Job {} completed: {}", payload.job_id, thumbnail_file);
        self.acknowledge(delivery);
        TaskOutcome::Completed { thumbnail_file }
    }

    /// Settles a stalled delivery that has no attempts left, leaving the job
    /// in a terminal state.
    pub fn finalize_stalled(&self, delivery: &Delivery) -> TaskOutcome {
        let job_id = &delivery.payload.job_id;
        warn!(
            "Task {} for job {} stalled on its last attempt",
            delivery.task_id, job_id
        );

        match self.store.get(job_id) {
            Ok(job) if job.status == JobStatus::Completed => {
                self.acknowledge(delivery);
                TaskOutcome::Duplicate
            }
            Ok(job) if job.status == JobStatus::Failed => {
                let message = job.error_message.as_deref().unwrap_or(INTERRUPTED_MESSAGE);
                self.report_failure(delivery, message, false);
                TaskOutcome::Failed { will_retry: false }
            }
            Ok(_) => {
                self.write_failed(job_id, INTERRUPTED_MESSAGE);
                self.report_failure(delivery, INTERRUPTED_MESSAGE, false);
                TaskOutcome::Failed { will_retry: false }
            }
            Err(JobError::NotFound(_)) => {
                self.report_failure(delivery, MISSING_JOB_MESSAGE, false);
                TaskOutcome::Dropped
            }
            Err(e) => {
                // Leave the lease to expire; the next reclaim tries again.
                error!("Failed to read stalled job {}: {}", job_id, e);
                TaskOutcome::Failed { will_retry: true }
            }
        }
    }

    /// Runs `work` while a heartbeat thread keeps the delivery's lease alive,
    /// so a slow render is never reclaimed and handed to a second worker.
    fn holding_lease<T>(&self, delivery: &Delivery, work: impl FnOnce() -> T) -> T {
        let period = self.queue.lease_timeout() / RENEWALS_PER_LEASE;
        let interval = period.max(Duration::from_millis(1));
        let (stop_tx, stop_rx) = crossbeam_channel::bounded::<()>(0);

        std::thread::scope(|s| {
            s.spawn(|| loop {
                match stop_rx.recv_timeout(interval) {
                    Err(RecvTimeoutError::Timeout) => {}
                    _ => break,
                }
                if let Err(e) = self.queue.extend_lease(delivery) {
                    warn!(
                        "Failed to renew lease on task {} for job {}: {}",
                        delivery.task_id, delivery.payload.job_id, e
                    );
                    if matches!(e, QueueError::LeaseLost(_)) {
                        break;
                    }
                }
            });

            let result = work();
            // Disconnecting wakes the heartbeat immediately.
            drop(stop_tx);
            result
        })
    }

    fn fail_job(&self, delivery: &Delivery, message: &str) -> TaskOutcome {
        let message = redact_paths_in(
            message,
            &[
                delivery.payload.source_path.as_path(),
                self.pipeline.upload_directory(),
            ],
        );
        self.write_failed(&delivery.payload.job_id, &message);
        let will_retry = self.report_failure(delivery, &message, true);
        TaskOutcome::Failed { will_retry }
    }

    fn write_failed(&self, job_id: &str, message: &str) {
        if let Err(e) = self
            .store
            .transition(job_id, JobStatus::Failed, TransitionFields::error(message))
        {
            error!("Failed to mark job {} as failed: {}", job_id, e);
        }
    }

    fn report_failure(&self, delivery: &Delivery, message: &str, retryable: bool) -> bool {
        match self.queue.fail(delivery, message, retryable) {
            Ok(FailureOutcome::Retrying {
                next_attempt,
                delay,
            }) => {
                info!(
                    "Job {} will be retried (attempt {}) in {:?}",
                    delivery.payload.job_id, next_attempt, delay
                );
                true
            }
            Ok(FailureOutcome::Exhausted) => {
                debug!("Task {} failed permanently", delivery.task_id);
                false
            }
            Err(e) => {
                warn!("Failed to report failure of task {}: {}", delivery.task_id, e);
                false
            }
        }
    }

    fn acknowledge(&self, delivery: &Delivery) {
        if let Err(e) = self.queue.complete(delivery) {
            warn!("Failed to acknowledge task {}: {}", delivery.task_id, e);
        }
    }

    fn discard_thumbnail(&self, name: &str) {
        let path = self.pipeline.upload_directory().join(name);
        if let Err(e) = std::fs::remove_file(&path) {
            warn!("Failed to remove orphaned thumbnail {}: {}", name, e);
        }
    }
}
