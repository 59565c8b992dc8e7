use std::path::PathBuf;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::queue::{BackoffPolicy, EnqueueOptions};

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    pub version: String,
    #[serde(default = "default_upload_directory")]
    pub upload_directory: String,
    /// Falls back to `~/.thumbq/data/thumbq.db`.
    #[serde(default)]
    pub database_path: Option<String>,
    #[serde(default = "default_worker_count")]
    pub worker_count: usize,
    #[serde(default)]
    pub queue: QueueConfig,
    #[serde(default)]
    pub thumbnail: ThumbnailConfig,
    #[serde(default)]
    pub ffmpeg: FfmpegConfig,
    #[serde(default)]
    pub events: EventsConfig,
    #[serde(default)]
    pub limits: LimitsConfig,
}

fn default_upload_directory() -> String {
    "uploads".to_string()
}

fn default_worker_count() -> usize {
    num_cpus::get()
}

impl Default for Config {
    fn default() -> Self {
        Self {
            version: "1.0".to_string(),
            upload_directory: default_upload_directory(),
            database_path: None,
            worker_count: default_worker_count(),
            queue: QueueConfig::default(),
            thumbnail: ThumbnailConfig::default(),
            ffmpeg: FfmpegConfig::default(),
            events: EventsConfig::default(),
            limits: LimitsConfig::default(),
        }
    }
}

impl Config {
    pub fn database_path(&self) -> Option<PathBuf> {
        match &self.database_path {
            Some(path) => Some(PathBuf::from(path)),
            None => crate::db::default_database_path(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct QueueConfig {
    #[serde(default = "default_priority")]
    pub priority: i32,
    #[serde(default = "default_max_attempts")]
    pub max_attempts: u32,
    #[serde(default)]
    pub backoff: BackoffPolicy,
    /// How long a worker may hold a task before it is redelivered.
    #[serde(default = "default_lease_timeout_secs")]
    pub lease_timeout_secs: u64,
    #[serde(default = "default_poll_interval_ms")]
    pub poll_interval_ms: u64,
}

fn default_priority() -> i32 {
    1
}

fn default_max_attempts() -> u32 {
    3
}

fn default_lease_timeout_secs() -> u64 {
    600
}

fn default_poll_interval_ms() -> u64 {
    500
}

impl Default for QueueConfig {
    fn default() -> Self {
        Self {
            priority: default_priority(),
            max_attempts: default_max_attempts(),
            backoff: BackoffPolicy::default(),
            lease_timeout_secs: default_lease_timeout_secs(),
            poll_interval_ms: default_poll_interval_ms(),
        }
    }
}

impl QueueConfig {
    pub fn enqueue_options(&self) -> EnqueueOptions {
        EnqueueOptions {
            priority: self.priority,
            max_attempts: self.max_attempts,
            backoff: self.backoff,
        }
    }

    pub fn lease_timeout(&self) -> Duration {
        Duration::from_secs(self.lease_timeout_secs)
    }

    pub fn poll_interval(&self) -> Duration {
        Duration::from_millis(self.poll_interval_ms)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ThumbnailConfig {
    #[serde(default = "default_dimension")]
    pub width: u32,
    #[serde(default = "default_dimension")]
    pub height: u32,
    /// JPEG quality, 1-100.
    #[serde(default = "default_quality")]
    pub quality: u8,
}

fn default_dimension() -> u32 {
    128
}

fn default_quality() -> u8 {
    80
}

impl Default for ThumbnailConfig {
    fn default() -> Self {
        Self {
            width: default_dimension(),
            height: default_dimension(),
            quality: default_quality(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FfmpegConfig {
    #[serde(default = "default_ffmpeg_binary")]
    pub binary: String,
}

fn default_ffmpeg_binary() -> String {
    "ffmpeg".to_string()
}

impl Default for FfmpegConfig {
    fn default() -> Self {
        Self {
            binary: default_ffmpeg_binary(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EventsConfig {
    /// Queue events buffered per subscriber before it starts lagging.
    #[serde(default = "default_event_capacity")]
    pub capacity: usize,
}

fn default_event_capacity() -> usize {
    256
}

impl Default for EventsConfig {
    fn default() -> Self {
        Self {
            capacity: default_event_capacity(),
        }
    }
}

/// Upload limits enforced by `submit`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LimitsConfig {
    #[serde(default = "default_max_file_bytes")]
    pub max_file_bytes: u64,
    #[serde(default = "default_max_files")]
    pub max_files: usize,
}

fn default_max_file_bytes() -> u64 {
    100 * 1024 * 1024
}

fn default_max_files() -> usize {
    10
}

impl Default for LimitsConfig {
    fn default() -> Self {
        Self {
            max_file_bytes: default_max_file_bytes(),
            max_files: default_max_files(),
        }
    }
}
