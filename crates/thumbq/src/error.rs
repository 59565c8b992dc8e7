use std::path::PathBuf;
use thiserror::Error;

use crate::job::JobStatus;

#[derive(Error, Debug)]
pub enum ThumbqError {
    #[error("Configuration error: {0}")]
    Config(#[from] ConfigError),

    #[error("Job error: {0}")]
    Job(#[from] JobError),

    #[error("Queue error: {0}")]
    Queue(#[from] QueueError),

    #[error("Media error: {0}")]
    Media(#[from] MediaError),

    #[error("Pipeline error: {0}")]
    Pipeline(#[from] crate::pipeline::PipelineError),

    #[error("Database error: {0}")]
    Database(#[from] crate::db::DatabaseError),

    #[error("Submit failed: {0}")]
    Submit(#[from] SubmitError),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("Failed to read config file '{path}': {source}")]
    ReadFile {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("Failed to parse config JSON: {0}")]
    ParseJson(#[from] serde_json::Error),

    #[error("Config validation failed: {message}")]
    Validation { message: String },

    #[error("Schema validation failed: {errors}")]
    SchemaValidation { errors: String },
}

/// Rejected before a job or task exists.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum MediaError {
    #[error("Unsupported file type: {0}")]
    Unsupported(String),

    #[error("File too large: {size} bytes exceeds the {max} byte limit")]
    TooLarge { size: u64, max: u64 },

    #[error("Too many files: {count} exceeds the limit of {max}")]
    TooManyFiles { count: usize, max: usize },

    #[error("No files uploaded")]
    NoFiles,
}

#[derive(Error, Debug)]
pub enum JobError {
    #[error("Job not found: {0}")]
    NotFound(String),

    #[error("Invalid transition for job {id}: {from} -> {to}")]
    InvalidTransition {
        id: String,
        from: JobStatus,
        to: JobStatus,
    },

    #[error("Transition to {status} requires {field}")]
    MissingField {
        status: JobStatus,
        field: &'static str,
    },

    #[error("Job {0} was modified concurrently")]
    VersionConflict(String),

    #[error("Job {0} has no thumbnail")]
    NoThumbnail(String),

    #[error("Thumbnail path for job {0} escapes the upload directory")]
    UnsafeThumbnailPath(String),

    #[error("Corrupt job record {id}: {reason}")]
    Corrupt { id: String, reason: String },

    #[error("Database error: {0}")]
    Database(#[from] crate::db::DatabaseError),
}

impl JobError {
    /// Text safe to show to end users. Infrastructure details stay in the logs.
    pub fn public_message(&self) -> String {
        match self {
            JobError::NotFound(_) => "Job not found".to_string(),
            JobError::NoThumbnail(_) | JobError::UnsafeThumbnailPath(_) => {
                "Thumbnail not available".to_string()
            }
            _ => "Internal server error".to_string(),
        }
    }
}

#[derive(Error, Debug)]
pub enum QueueError {
    #[error("Queue backend unavailable: {0}")]
    Unavailable(String),

    #[error("Task {0} is not leased by this delivery")]
    LeaseLost(String),

    #[error("Corrupt task record {id}: {reason}")]
    Corrupt { id: String, reason: String },

    #[error("Database error: {0}")]
    Database(#[from] crate::db::DatabaseError),
}

/// Errors returned by `ThumbnailService::submit`.
#[derive(Error, Debug)]
pub enum SubmitError {
    #[error(transparent)]
    Validation(#[from] MediaError),

    #[error(transparent)]
    Job(#[from] JobError),
}

impl SubmitError {
    pub fn public_message(&self) -> String {
        match self {
            SubmitError::Validation(e) => e.to_string(),
            SubmitError::Job(e) => e.public_message(),
        }
    }
}

pub type Result<T> = std::result::Result<T, ThumbqError>;
