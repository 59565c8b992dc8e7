use std::path::Path;
use std::sync::Arc;

use image::DynamicImage;

use super::error::PipelineError;
use super::ffmpeg::FrameSource;
use super::image::decode_file;
use super::output::ScratchFile;
use super::ThumbnailStrategy;
use crate::media::MediaKind;

/// Samples the frame halfway through the video.
pub struct VideoStrategy {
    frames: Arc<dyn FrameSource>,
}

impl VideoStrategy {
    pub fn new(frames: Arc<dyn FrameSource>) -> Self {
        Self { frames }
    }
}

impl ThumbnailStrategy for VideoStrategy {
    fn supports(&self, kind: MediaKind) -> bool {
        kind == MediaKind::Video
    }

    fn render(&self, source: &Path, scratch_dir: &Path) -> Result<DynamicImage, PipelineError> {
        let _span = tracing::info_span!(
            "pipeline.video",
            source = %crate::sanitize::redact_path(source)
        )
        .entered();

        let duration = self.frames.probe_duration(source)?;
        let midpoint = duration / 2;
        if midpoint.is_zero() {
            return Err(PipelineError::DurationUnparsable {
                diagnostics: format!("reported duration {:?} has no midpoint", duration),
            });
        }
        log::debug!("Sampling video at {:?} of {:?}", midpoint, duration);

        let frame = ScratchFile::new_in(scratch_dir, "jpg");
        self.frames.extract_frame(source, midpoint, frame.path())?;
        decode_file(frame.path())
    }
}
