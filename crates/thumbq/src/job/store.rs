//! Job store: the authoritative record of every job.

use chrono::{DateTime, SecondsFormat, Utc};

use crate::db::job_repo::{self, JobRow, StatusUpdate};
use crate::db::Database;
use crate::error::JobError;

use super::{Job, JobStatus, NewJob, TransitionFields};

/// How many times `transition` re-reads and retries after losing a
/// compare-and-set race before giving up.
const MAX_CAS_ATTEMPTS: usize = 3;

pub trait JobStore: Send + Sync {
    /// Creates a job in the `queued` state.
    fn create(&self, new_job: NewJob) -> Result<Job, JobError>;

    /// Moves a job to `status`, writing the accompanying fields.
    fn transition(
        &self,
        id: &str,
        status: JobStatus,
        fields: TransitionFields,
    ) -> Result<Job, JobError>;

    fn get(&self, id: &str) -> Result<Job, JobError>;

    /// Jobs of one owner, newest first.
    fn list_by_owner(&self, owner_id: &str) -> Result<Vec<Job>, JobError>;

    fn count_by_status(&self, status: JobStatus) -> Result<u64, JobError>;
}

/// Formats timestamps with fixed precision so they sort lexicographically.
pub(crate) fn format_timestamp(dt: DateTime<Utc>) -> String {
    dt.to_rfc3339_opts(SecondsFormat::Micros, true)
}

fn parse_timestamp(s: &str, job_id: &str) -> Result<DateTime<Utc>, JobError> {
    DateTime::parse_from_rfc3339(s)
        .map(|dt| dt.with_timezone(&Utc))
        .map_err(|e| JobError::Corrupt {
            id: job_id.to_string(),
            reason: format!("bad timestamp '{}': {}", s, e),
        })
}

fn job_from_row(row: JobRow) -> Result<Job, JobError> {
    let corrupt = |reason: String| JobError::Corrupt {
        id: row.id.clone(),
        reason,
    };

    let status = row.status.parse::<JobStatus>().map_err(corrupt)?;
    let media_kind = row
        .media_kind
        .parse()
        .map_err(|e: crate::error::MediaError| corrupt(e.to_string()))?;
    let size_bytes = u64::try_from(row.size_bytes)
        .map_err(|_| corrupt(format!("negative size {}", row.size_bytes)))?;
    let created_at = parse_timestamp(&row.created_at, &row.id)?;
    let updated_at = parse_timestamp(&row.updated_at, &row.id)?;

    Ok(Job {
        id: row.id,
        owner_id: row.owner_id,
        source_path: row.source_path,
        original_name: row.original_name,
        mime_type: row.mime_type,
        size_bytes,
        media_kind,
        status,
        thumbnail_file: row.thumbnail_file,
        error_message: row.error_message,
        version: row.version,
        created_at,
        updated_at,
    })
}

/// Keeps `thumbnail_file` set iff completed and `error_message` set iff failed.
fn normalize_fields(
    status: JobStatus,
    fields: TransitionFields,
) -> Result<TransitionFields, JobError> {
    let non_empty = |v: Option<String>| v.filter(|s| !s.trim().is_empty());

    match status {
        JobStatus::Completed => {
            let file = non_empty(fields.thumbnail_file).ok_or(JobError::MissingField {
                status,
                field: "thumbnail_file",
            })?;
            Ok(TransitionFields::thumbnail(file))
        }
        JobStatus::Failed => {
            let message = non_empty(fields.error_message).ok_or(JobError::MissingField {
                status,
                field: "error_message",
            })?;
            Ok(TransitionFields::error(message))
        }
        _ => Ok(TransitionFields::none()),
    }
}

/// SQLite-backed job store.
#[derive(Clone)]
pub struct SqliteJobStore {
    db: Database,
}

impl SqliteJobStore {
    pub fn new(db: Database) -> Self {
        Self { db }
    }
}

impl JobStore for SqliteJobStore {
    fn create(&self, new_job: NewJob) -> Result<Job, JobError> {
        let now = format_timestamp(Utc::now());
        let size_bytes = i64::try_from(new_job.size_bytes).unwrap_or(i64::MAX);
        let row = JobRow {
            id: uuid::Uuid::new_v4().to_string(),
            owner_id: new_job.owner_id,
            source_path: new_job.source_path,
            original_name: new_job.original_name,
            mime_type: new_job.mime_type,
            size_bytes,
            media_kind: new_job.media_kind.as_str().to_string(),
            status: JobStatus::Queued.as_str().to_string(),
            thumbnail_file: None,
            error_message: None,
            version: 0,
            created_at: now.clone(),
            updated_at: now,
        };

        job_repo::insert(&self.db, &row)?;
        log::debug!("Created job {} for owner {}", row.id, row.owner_id);
        job_from_row(row)
    }

    fn transition(
        &self,
        id: &str,
        status: JobStatus,
        fields: TransitionFields,
    ) -> Result<Job, JobError> {
        let fields = normalize_fields(status, fields)?;

        for _ in 0..MAX_CAS_ATTEMPTS {
            let current = self.get(id)?;
            if !current.status.can_transition_to(status) {
                return Err(JobError::InvalidTransition {
                    id: id.to_string(),
                    from: current.status,
                    to: status,
                });
            }

            let updated_at = format_timestamp(Utc::now());
            let update = StatusUpdate {
                status: status.as_str(),
                thumbnail_file: fields.thumbnail_file.as_deref(),
                error_message: fields.error_message.as_deref(),
                updated_at: &updated_at,
            };

            if job_repo::compare_and_set_status(&self.db, id, current.version, &update)? {
                log::debug!("Job {}: {} -> {}", id, current.status, status);
                return self.get(id);
            }

            log::debug!(
                "Job {} changed underneath transition to {}, retrying",
                id,
                status
            );
        }

        Err(JobError::VersionConflict(id.to_string()))
    }

    fn get(&self, id: &str) -> Result<Job, JobError> {
        let row = job_repo::find_by_id(&self.db, id)?
            .ok_or_else(|| JobError::NotFound(id.to_string()))?;
        job_from_row(row)
    }

    fn list_by_owner(&self, owner_id: &str) -> Result<Vec<Job>, JobError> {
        job_repo::list_by_owner(&self.db, owner_id)?
            .into_iter()
            .map(job_from_row)
            .collect()
    }

    fn count_by_status(&self, status: JobStatus) -> Result<u64, JobError> {
        Ok(job_repo::count_by_status(&self.db, status.as_str())?)
    }
}
