//! Entry points used by the upload, listing, download and realtime layers.

use std::path::{Component, Path, PathBuf};
use std::sync::Arc;

use crate::config::{Config, LimitsConfig};
use crate::error::{JobError, MediaError, SubmitError};
use crate::job::{Job, JobStatus, JobStore, NewJob, TransitionFields};
use crate::media::MediaKind;
use crate::queue::{EnqueueOptions, TaskPayload, TaskQueue};
use crate::relay::{Connection, EventRelay, Subscription};
use crate::sanitize::redact_path;

/// Error stored on a job whose task could not be enqueued.
pub const QUEUE_UNAVAILABLE_MESSAGE: &str = "Processing queue unavailable";

/// One uploaded file, already stored on disk.
#[derive(Debug, Clone)]
pub struct SubmitRequest {
    pub owner_id: String,
    pub source_path: PathBuf,
    pub original_name: String,
    pub mime_type: String,
    pub size_bytes: u64,
}

pub struct ServiceSettings {
    pub upload_directory: PathBuf,
    pub enqueue: EnqueueOptions,
    pub limits: LimitsConfig,
}

impl ServiceSettings {
    pub fn from_config(config: &Config) -> Self {
        Self {
            upload_directory: PathBuf::from(&config.upload_directory),
            enqueue: config.queue.enqueue_options(),
            limits: config.limits.clone(),
        }
    }
}

pub struct ThumbnailService {
    store: Arc<dyn JobStore>,
    queue: Arc<dyn TaskQueue>,
    relay: Arc<EventRelay>,
    settings: ServiceSettings,
}

impl ThumbnailService {
    pub fn new(
        store: Arc<dyn JobStore>,
        queue: Arc<dyn TaskQueue>,
        relay: Arc<EventRelay>,
        settings: ServiceSettings,
    ) -> Self {
        Self {
            store,
            queue,
            relay,
            settings,
        }
    }

    /// Records a job for the upload and queues it for processing.
    ///
    /// The returned job is `queued`, or `failed` when the queue rejected the
    /// task. Either way the owner's subscribers are told about it.
    pub fn submit(&self, request: SubmitRequest) -> Result<Job, SubmitError> {
        let media_kind = self.validate(&request)?;
        self.submit_validated(request, media_kind)
    }

    /// Submits several uploads at once. Nothing is recorded unless every
    /// file passes validation.
    pub fn submit_batch(&self, requests: Vec<SubmitRequest>) -> Result<Vec<Job>, SubmitError> {
        let max = self.settings.limits.max_files;
        if requests.is_empty() {
            return Err(MediaError::NoFiles.into());
        }
        if requests.len() > max {
            return Err(MediaError::TooManyFiles {
                count: requests.len(),
                max,
            }
            .into());
        }

        let kinds = requests
            .iter()
            .map(|r| self.validate(r))
            .collect::<Result<Vec<_>, _>>()?;

        requests
            .into_iter()
            .zip(kinds)
            .map(|(request, kind)| self.submit_validated(request, kind))
            .collect()
    }

    fn validate(&self, request: &SubmitRequest) -> Result<MediaKind, MediaError> {
        let max = self.settings.limits.max_file_bytes;
        if request.size_bytes > max {
            return Err(MediaError::TooLarge {
                size: request.size_bytes,
                max,
            });
        }
        MediaKind::resolve(&request.mime_type, Path::new(&request.original_name))
    }

    fn submit_validated(
        &self,
        request: SubmitRequest,
        media_kind: MediaKind,
    ) -> Result<Job, SubmitError> {
        let job = self.store.create(NewJob {
            owner_id: request.owner_id.clone(),
            source_path: request.source_path.to_string_lossy().to_string(),
            original_name: request.original_name,
            mime_type: request.mime_type,
            size_bytes: request.size_bytes,
            media_kind,
        })?;

        let payload = TaskPayload {
            job_id: job.id.clone(),
            source_path: request.source_path,
            owner_id: request.owner_id,
            media_kind,
        };

        let job = match self.queue.enqueue(payload, &self.settings.enqueue) {
            Ok(task_id) => {
                log::info!(
                    "Job {} queued as task {} ({})",
                    job.id,
                    task_id,
                    media_kind
                );
                job
            }
            Err(e) => {
                log::error!("Failed to enqueue job {}: {}", job.id, e);
                self.store.transition(
                    &job.id,
                    JobStatus::Failed,
                    TransitionFields::error(QUEUE_UNAVAILABLE_MESSAGE),
                )?
            }
        };

        self.relay.publish(&job.id);
        Ok(job)
    }

    pub fn get(&self, job_id: &str) -> Result<Job, JobError> {
        self.store.get(job_id)
    }

    /// The owner's jobs, newest first.
    pub fn list_by_owner(&self, owner_id: &str) -> Result<Vec<Job>, JobError> {
        self.store.list_by_owner(owner_id)
    }

    pub fn subscribe(&self, owner_id: &str, connection: Arc<dyn Connection>) -> Subscription {
        self.relay.subscribe(owner_id, connection)
    }

    /// Location of a completed job's thumbnail inside the upload directory.
    pub fn resolve_thumbnail_path(&self, job: &Job) -> Result<PathBuf, JobError> {
        if job.status != JobStatus::Completed {
            return Err(JobError::NoThumbnail(job.id.clone()));
        }
        let file = job
            .thumbnail_file
            .as_deref()
            .ok_or_else(|| JobError::NoThumbnail(job.id.clone()))?;

        if !is_plain_file_name(file) {
            log::warn!(
                "Job {} has a thumbnail name that leaves the upload directory: {}",
                job.id,
                redact_path(Path::new(file))
            );
            return Err(JobError::UnsafeThumbnailPath(job.id.clone()));
        }

        Ok(self.settings.upload_directory.join(file))
    }
}

/// True for a single normal path component, so joining it cannot escape the
/// parent directory.
fn is_plain_file_name(name: &str) -> bool {
    let mut components = Path::new(name).components();
    matches!(
        (components.next(), components.next()),
        (Some(Component::Normal(_)), None)
    )
}
