use std::path::PathBuf;
use std::time::Duration;

use crate::config::Config;

pub struct PipelineConfig {
    pub upload_directory: PathBuf,
    pub width: u32,
    pub height: u32,
    pub quality: u8,
    /// Scratch files older than this are treated as abandoned at startup.
    pub stale_scratch_after: Duration,
}

impl PipelineConfig {
    pub fn from_config(config: &Config) -> Self {
        Self {
            upload_directory: PathBuf::from(&config.upload_directory),
            width: config.thumbnail.width,
            height: config.thumbnail.height,
            quality: config.thumbnail.quality,
            // A render holds its lease for its whole run, so a scratch file
            // older than one lease period outlived the worker that made it.
            stale_scratch_after: config.queue.lease_timeout(),
        }
    }
}
