//! Scratch files and collision-free publication of thumbnails.

use std::io::ErrorKind;
use std::path::{Path, PathBuf};
use std::time::{Duration, SystemTime};

use super::error::PipelineError;

/// Prefix of every scratch file the pipeline creates.
pub const SCRATCH_PREFIX: &str = ".thumbq-";

/// Gives up after this many names for the same millisecond.
const MAX_NAME_ATTEMPTS: u32 = 1000;

/// Temporary file that is deleted when the guard is dropped, including on
/// early return and unwinding.
pub struct ScratchFile {
    path: PathBuf,
}

impl ScratchFile {
    pub fn new_in(dir: &Path, extension: &str) -> Self {
        let name = format!("{}{}.{}", SCRATCH_PREFIX, uuid::Uuid::new_v4(), extension);
        Self {
            path: dir.join(name),
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

impl Drop for ScratchFile {
    fn drop(&mut self) {
        match std::fs::remove_file(&self.path) {
            Ok(()) => {}
            Err(e) if e.kind() == ErrorKind::NotFound => {}
            Err(e) => log::warn!("Failed to clean up scratch file: {}", e),
        }
    }
}

fn thumbnail_name(timestamp_ms: i64, n: u32) -> String {
    if n <= 1 {
        format!("thumb-{}.jpg", timestamp_ms)
    } else {
        format!("thumb-{}-{}.jpg", timestamp_ms, n)
    }
}

/// Links a finished scratch file into `dir` under the first free
/// `thumb-<ts>[-n].jpg` name and returns that name.
///
/// Hard links never replace an existing file, so two workers finishing in
/// the same millisecond cannot clobber each other, and readers never see a
/// partially written thumbnail.
pub fn publish(
    scratch: &ScratchFile,
    dir: &Path,
    timestamp_ms: i64,
) -> Result<String, PipelineError> {
    for n in 1..=MAX_NAME_ATTEMPTS {
        let name = thumbnail_name(timestamp_ms, n);
        let dest = dir.join(&name);
        match std::fs::hard_link(scratch.path(), &dest) {
            Ok(()) => return Ok(name),
            Err(e) if e.kind() == ErrorKind::AlreadyExists => continue,
            Err(e) => return Err(PipelineError::io(dest, e)),
        }
    }

    Err(PipelineError::io(
        dir.join(thumbnail_name(timestamp_ms, MAX_NAME_ATTEMPTS)),
        std::io::Error::new(ErrorKind::AlreadyExists, "no free thumbnail name"),
    ))
}

/// Removes scratch files left behind by a process that died mid-task.
///
/// Only files untouched for `older_than` are removed. Other processes may
/// share the directory, and their renders in flight keep fresh scratch files.
pub fn sweep_scratch(dir: &Path, older_than: Duration) -> Result<usize, PipelineError> {
    let entries = std::fs::read_dir(dir).map_err(|e| PipelineError::io(dir, e))?;
    let now = SystemTime::now();

    let mut removed = 0;
    for entry in entries.flatten() {
        let is_scratch = entry
            .file_name()
            .to_str()
            .is_some_and(|name| name.starts_with(SCRATCH_PREFIX));
        if !is_scratch || !is_stale(&entry, now, older_than) {
            continue;
        }
        match std::fs::remove_file(entry.path()) {
            Ok(()) => removed += 1,
            Err(e) if e.kind() == ErrorKind::NotFound => {}
            Err(e) => log::warn!("Failed to remove stale scratch file: {}", e),
        }
    }

    Ok(removed)
}

fn is_stale(entry: &std::fs::DirEntry, now: SystemTime, older_than: Duration) -> bool {
    // A clock that runs backwards or a missing mtime counts as fresh.
    entry
        .metadata()
        .and_then(|m| m.modified())
        .ok()
        .and_then(|modified| now.duration_since(modified).ok())
        .is_some_and(|age| age >= older_than)
}
