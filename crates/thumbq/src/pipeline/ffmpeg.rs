//! Video frame extraction through an external decoder.

use std::path::{Path, PathBuf};
use std::process::{Command, Stdio};
use std::sync::LazyLock;
use std::time::Duration;

use regex::Regex;

use super::error::{diagnostics, PipelineError};
use crate::sanitize::{redact_path, redact_paths_in};

static RE_DURATION: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"Duration:\s*(\d+):(\d{2}):(\d{2}(?:\.\d+)?)").unwrap());

/// Reads video metadata and single frames.
pub trait FrameSource: Send + Sync {
    fn probe_duration(&self, source: &Path) -> Result<Duration, PipelineError>;

    /// Writes the frame at `at` to `dest` as an image file.
    fn extract_frame(&self, source: &Path, at: Duration, dest: &Path)
        -> Result<(), PipelineError>;
}

/// `FrameSource` backed by the `ffmpeg` command line tool.
pub struct FfmpegCli {
    binary: PathBuf,
}

impl FfmpegCli {
    pub fn new(binary: impl Into<PathBuf>) -> Self {
        Self {
            binary: binary.into(),
        }
    }

    fn tool_name(&self) -> String {
        redact_path(&self.binary)
    }

    fn command(&self) -> Command {
        let mut cmd = Command::new(&self.binary);
        cmd.arg("-hide_banner").stdin(Stdio::null());
        cmd
    }
}

impl Default for FfmpegCli {
    fn default() -> Self {
        Self::new("ffmpeg")
    }
}

impl FrameSource for FfmpegCli {
    fn probe_duration(&self, source: &Path) -> Result<Duration, PipelineError> {
        // Without an output file ffmpeg exits non-zero, but it still prints
        // the container header to stderr.
        let output = self
            .command()
            .arg("-i")
            .arg(source)
            .output()
            .map_err(|e| PipelineError::Spawn {
                tool: self.tool_name(),
                source: e,
            })?;

        let stderr = String::from_utf8_lossy(&output.stderr);
        parse_duration(&stderr).ok_or_else(|| PipelineError::DurationUnparsable {
            diagnostics: diagnostics(redact_paths_in(&stderr, &[source]).as_bytes()),
        })
    }

    fn extract_frame(
        &self,
        source: &Path,
        at: Duration,
        dest: &Path,
    ) -> Result<(), PipelineError> {
        let output = self
            .command()
            .args(["-loglevel", "error", "-ss"])
            .arg(format_seek(at))
            .arg("-i")
            .arg(source)
            .args(["-frames:v", "1", "-q:v", "2", "-y"])
            .arg(dest)
            .output()
            .map_err(|e| PipelineError::Spawn {
                tool: self.tool_name(),
                source: e,
            })?;

        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr);
            return Err(PipelineError::ToolFailed {
                tool: self.tool_name(),
                status: output.status.to_string(),
                diagnostics: diagnostics(redact_paths_in(&stderr, &[source, dest]).as_bytes()),
            });
        }

        let written = std::fs::metadata(dest).map(|m| m.len()).unwrap_or(0);
        if written == 0 {
            return Err(PipelineError::OutputMissing {
                tool: self.tool_name(),
                path: dest.to_path_buf(),
            });
        }

        Ok(())
    }
}

/// Extracts `Duration: HH:MM:SS.ss` from ffmpeg's banner. A zero duration
/// has no midpoint to sample and counts as unparsable.
pub fn parse_duration(stderr: &str) -> Option<Duration> {
    let caps = RE_DURATION.captures(stderr)?;
    let hours: u64 = caps[1].parse().ok()?;
    let minutes: u64 = caps[2].parse().ok()?;
    let seconds: f64 = caps[3].parse().ok()?;

    let whole = hours * 3600 + minutes * 60;
    let duration = Duration::from_secs(whole) + Duration::from_secs_f64(seconds);
    (!duration.is_zero()).then_some(duration)
}

fn format_seek(at: Duration) -> String {
    format!("{:.3}", at.as_secs_f64())
}
