//! Media kind resolution.
//!
//! The kind is decided once, when a job is submitted, and travels with the
//! task so workers never re-inspect file names.

use std::fmt;
use std::path::Path;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

use crate::error::MediaError;

const VIDEO_EXTENSIONS: &[&str] = &["mp4", "mov", "avi", "mkv", "webm"];

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MediaKind {
    Image,
    Video,
}

impl MediaKind {
    /// Resolves the kind from the declared MIME type, falling back to the
    /// file extension when the MIME type is missing or generic.
    pub fn resolve(mime_type: &str, file_name: &Path) -> Result<Self, MediaError> {
        if let Some(kind) = Self::from_mime(mime_type) {
            return Ok(kind);
        }

        let extension = file_name
            .extension()
            .and_then(|e| e.to_str())
            .map(|e| e.to_ascii_lowercase())
            .unwrap_or_default();

        if VIDEO_EXTENSIONS.contains(&extension.as_str()) {
            return Ok(MediaKind::Video);
        }

        mime_guess::from_path(file_name)
            .iter()
            .find_map(|m| Self::from_mime(m.essence_str()))
            .ok_or_else(|| {
                let shown = if mime_type.is_empty() {
                    extension
                } else {
                    mime_type.to_string()
                };
                MediaError::Unsupported(shown)
            })
    }

    fn from_mime(mime_type: &str) -> Option<Self> {
        let mime_type = mime_type.trim().to_ascii_lowercase();
        if mime_type.starts_with("image/") {
            Some(MediaKind::Image)
        } else if mime_type.starts_with("video/") {
            Some(MediaKind::Video)
        } else {
            None
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            MediaKind::Image => "image",
            MediaKind::Video => "video",
        }
    }
}

impl fmt::Display for MediaKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for MediaKind {
    type Err = MediaError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "image" => Ok(MediaKind::Image),
            "video" => Ok(MediaKind::Video),
            other => Err(MediaError::Unsupported(other.to_string())),
        }
    }
}
