//! Turns an uploaded image or video into a fixed-size JPEG thumbnail.

pub mod config;
pub mod error;
pub mod ffmpeg;
pub mod image;
pub mod output;
pub mod video;

use std::path::Path;
use std::sync::Arc;

use ::image::DynamicImage;
use chrono::Utc;

use crate::media::MediaKind;
use crate::sanitize::redact_path;

pub use config::PipelineConfig;
pub use error::PipelineError;
pub use ffmpeg::{FfmpegCli, FrameSource};
pub use output::ScratchFile;

/// Media-specific step that produces the full-size frame a thumbnail is cut
/// from.
pub trait ThumbnailStrategy: Send + Sync {
    fn supports(&self, kind: MediaKind) -> bool;

    /// `scratch_dir` is where intermediate files may be written; they must be
    /// gone when this returns.
    fn render(&self, source: &Path, scratch_dir: &Path) -> Result<DynamicImage, PipelineError>;
}

pub struct Pipeline {
    config: PipelineConfig,
    strategies: Vec<Box<dyn ThumbnailStrategy>>,
}

impl Pipeline {
    /// Creates the upload directory if needed and removes scratch files a
    /// dead process left behind.
    pub fn new(
        config: PipelineConfig,
        frames: Arc<dyn FrameSource>,
    ) -> Result<Self, PipelineError> {
        std::fs::create_dir_all(&config.upload_directory)
            .map_err(|e| PipelineError::io(&config.upload_directory, e))?;

        let swept = output::sweep_scratch(&config.upload_directory, config.stale_scratch_after)?;
        if swept > 0 {
            log::info!("Removed {} stale scratch file(s)", swept);
        }

        Ok(Self {
            config,
            strategies: vec![
                Box::new(image::ImageStrategy),
                Box::new(video::VideoStrategy::new(frames)),
            ],
        })
    }

    pub fn upload_directory(&self) -> &Path {
        &self.config.upload_directory
    }

    /// Generates a thumbnail for `source` and returns its file name inside
    /// the upload directory. Safe to call again for the same source; each
    /// call produces a new file.
    pub fn generate(&self, source: &Path, kind: MediaKind) -> Result<String, PipelineError> {
        let _span = tracing::info_span!(
            "pipeline.generate",
            kind = %kind,
            source = %redact_path(source)
        )
        .entered();

        if !source.is_file() {
            return Err(PipelineError::SourceMissing(source.to_path_buf()));
        }

        let dir = &self.config.upload_directory;
        let strategy = self
            .strategies
            .iter()
            .find(|s| s.supports(kind))
            .ok_or_else(|| PipelineError::Decode(format!("no strategy for {}", kind)))?;

        let frame = strategy.render(source, dir)?;
        let bytes = image::encode_thumbnail(
            &frame,
            self.config.width,
            self.config.height,
            self.config.quality,
        )?;

        let scratch = ScratchFile::new_in(dir, "jpg");
        std::fs::write(scratch.path(), &bytes).map_err(|e| PipelineError::io(scratch.path(), e))?;
        let name = output::publish(&scratch, dir, Utc::now().timestamp_millis())?;

        log::info!(
            "Generated thumbnail {} from {} ({} bytes)",
            name,
            redact_path(source),
            bytes.len()
        );
        Ok(name)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    use ::image::{GenericImageView, RgbImage};
    use tempfile::TempDir;

    struct NoVideo;

    impl FrameSource for NoVideo {
        fn probe_duration(&self, _source: &Path) -> Result<Duration, PipelineError> {
            Err(PipelineError::DurationUnparsable {
                diagnostics: String::new(),
            })
        }

        fn extract_frame(&self, _: &Path, _: Duration, _: &Path) -> Result<(), PipelineError> {
            unreachable!()
        }
    }

    fn pipeline(dir: &Path) -> Pipeline {
        let config = PipelineConfig {
            upload_directory: dir.join("uploads"),
            width: 128,
            height: 128,
            quality: 80,
            stale_scratch_after: Duration::from_secs(60),
        };
        Pipeline::new(config, Arc::new(NoVideo)).unwrap()
    }

    #[test]
    fn test_generates_one_thumbnail_at_configured_size() {
        let tmp = TempDir::new().unwrap();
        let pipeline = pipeline(tmp.path());
        let source = tmp.path().join("photo.png");
        RgbImage::from_pixel(640, 480, ::image::Rgb([30, 60, 90]))
            .save(&source)
            .unwrap();

        let name = pipeline.generate(&source, MediaKind::Image).unwrap();

        assert!(name.starts_with("thumb-") && name.ends_with(".jpg"), "{}", name);
        let files: Vec<_> = std::fs::read_dir(pipeline.upload_directory())
            .unwrap()
            .map(|e| e.unwrap().file_name())
            .collect();
        assert_eq!(files, vec![std::ffi::OsString::from(&name)]);

        let thumb = ::image::open(pipeline.upload_directory().join(&name)).unwrap();
        assert_eq!(thumb.dimensions(), (128, 128));
    }

    #[test]
    fn test_missing_source() {
        let tmp = TempDir::new().unwrap();
        let pipeline = pipeline(tmp.path());

        let err = pipeline
            .generate(&tmp.path().join("gone.png"), MediaKind::Image)
            .unwrap_err();
        assert!(matches!(err, PipelineError::SourceMissing(_)));
    }

    #[test]
    fn test_failure_leaves_no_files() {
        let tmp = TempDir::new().unwrap();
        let pipeline = pipeline(tmp.path());
        let source = tmp.path().join("clip.mp4");
        std::fs::write(&source, b"not really a video").unwrap();

        assert!(pipeline.generate(&source, MediaKind::Video).is_err());
        assert_eq!(
            std::fs::read_dir(pipeline.upload_directory()).unwrap().count(),
            0
        );
    }

    #[test]
    fn test_startup_sweeps_abandoned_scratch_files() {
        let tmp = TempDir::new().unwrap();
        let uploads = tmp.path().join("uploads");
        std::fs::create_dir_all(&uploads).unwrap();
        let crashed = uploads.join(".thumbq-crashed.jpg");
        std::fs::write(&crashed, b"x").unwrap();
        std::fs::File::options()
            .write(true)
            .open(&crashed)
            .unwrap()
            .set_modified(std::time::SystemTime::now() - Duration::from_secs(3600))
            .unwrap();

        let _pipeline = pipeline(tmp.path());
        assert!(!crashed.exists());
    }

    #[test]
    fn test_second_pipeline_leaves_renders_in_flight_alone() {
        let tmp = TempDir::new().unwrap();
        let first = pipeline(tmp.path());
        let in_flight = ScratchFile::new_in(first.upload_directory(), "jpg");
        std::fs::write(in_flight.path(), b"half a frame").unwrap();

        let _second = pipeline(tmp.path());
        assert!(in_flight.path().exists());
    }
}
