use std::path::PathBuf;

use thiserror::Error;

/// Longest tool output kept in an error message.
const MAX_DIAGNOSTIC_CHARS: usize = 2000;

#[derive(Error, Debug)]
pub enum PipelineError {
    #[error("Source file not found: {}", .0.display())]
    SourceMissing(PathBuf),

    #[error("Could not determine video duration: {diagnostics}")]
    DurationUnparsable { diagnostics: String },

    #[error("Failed to start {tool}: {source}")]
    Spawn {
        tool: String,
        #[source]
        source: std::io::Error,
    },

    #[error("{tool} exited with {status}: {diagnostics}")]
    ToolFailed {
        tool: String,
        status: String,
        diagnostics: String,
    },

    #[error("{tool} produced no output at '{}'", path.display())]
    OutputMissing { tool: String, path: PathBuf },

    #[error("Failed to decode image: {0}")]
    Decode(String),

    #[error("Failed to encode thumbnail: {0}")]
    Encode(String),

    #[error("I/O error on '{}': {source}", path.display())]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
}

impl PipelineError {
    pub(crate) fn io(path: impl Into<PathBuf>, source: std::io::Error) -> Self {
        PipelineError::Io {
            path: path.into(),
            source,
        }
    }
}

/// Trims tool output to something fit for an error message. Tools print the
/// relevant failure last, so the tail is kept.
pub(crate) fn diagnostics(raw: &[u8]) -> String {
    let text = String::from_utf8_lossy(raw);
    let text = text.trim();
    let count = text.chars().count();
    if count <= MAX_DIAGNOSTIC_CHARS {
        return text.to_string();
    }
    let tail: String = text.chars().skip(count - MAX_DIAGNOSTIC_CHARS).collect();
    format!("...{}", tail)
}
