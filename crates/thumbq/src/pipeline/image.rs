use std::path::Path;

use image::codecs::jpeg::JpegEncoder;
use image::imageops::FilterType;
use image::{DynamicImage, ImageReader};

use super::error::PipelineError;
use super::ThumbnailStrategy;
use crate::media::MediaKind;

/// Decodes still images directly.
pub struct ImageStrategy;

impl ThumbnailStrategy for ImageStrategy {
    fn supports(&self, kind: MediaKind) -> bool {
        kind == MediaKind::Image
    }

    fn render(&self, source: &Path, _scratch_dir: &Path) -> Result<DynamicImage, PipelineError> {
        let _span = tracing::info_span!(
            "pipeline.image",
            source = %crate::sanitize::redact_path(source)
        )
        .entered();

        decode_file(source)
    }
}

/// Decodes an image, detecting the format from content. Uploads are often
/// stored without an extension.
pub(crate) fn decode_file(path: &Path) -> Result<DynamicImage, PipelineError> {
    let reader = ImageReader::open(path)
        .and_then(|r| r.with_guessed_format())
        .map_err(|e| PipelineError::io(path, e))?;

    reader
        .decode()
        .map_err(|e| PipelineError::Decode(e.to_string()))
}

/// Crops `frame` to fill `width`x`height` and encodes it as JPEG.
pub fn encode_thumbnail(
    frame: &DynamicImage,
    width: u32,
    height: u32,
    quality: u8,
) -> Result<Vec<u8>, PipelineError> {
    let thumb = frame.resize_to_fill(width, height, FilterType::Lanczos3);
    let rgb = thumb.to_rgb8();

    let mut buffer = Vec::new();
    let mut encoder = JpegEncoder::new_with_quality(&mut buffer, quality);
    encoder
        .encode_image(&rgb)
        .map_err(|e| PipelineError::Encode(e.to_string()))?;

    Ok(buffer)
}
