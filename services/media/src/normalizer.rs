//! Image normalization for uploaded step photos.
//!
//! Every accepted image is flattened onto white, scaled to fit a fixed
//! bounding box with its aspect ratio kept, and re-encoded as JPEG. The
//! output format does not depend on the input format.

use crate::config::MediaConfig;
use image::codecs::jpeg::JpegEncoder;
use image::imageops::{self, FilterType};
use image::{DynamicImage, RgbImage};
use thiserror::Error;
use tracing::debug;

/// Extension given to every normalized image
pub const NORMALIZED_EXTENSION: &str = "jpg";

/// Errors that can occur during image normalization.
#[derive(Debug, Error)]
pub enum ProcessingError {
    #[error("Invalid image data: {0}")]
    Decode(String),

    #[error("Image processing error: {0}")]
    Encode(String),
}

/// Resizes and re-encodes images to the canonical geometry and encoding.
#[derive(Debug, Clone, Copy)]
pub struct ImageNormalizer {
    target_width: u32,
    target_height: u32,
    quality: u8,
}

impl ImageNormalizer {
    pub fn new(target_width: u32, target_height: u32, quality: u8) -> Self {
        Self {
            target_width: target_width.max(1),
            target_height: target_height.max(1),
            quality: quality.clamp(1, 100),
        }
    }

    pub fn from_config(config: &MediaConfig) -> Self {
        Self::new(config.target_width, config.target_height, config.jpeg_quality)
    }

    pub fn normalize(&self, bytes: &[u8]) -> Result<Vec<u8>, ProcessingError> {
        normalize(bytes, self.target_width, self.target_height, self.quality)
    }
}

/// Decode `bytes`, flatten transparency onto white, fit the result inside
/// `target_width` x `target_height` and encode it as JPEG at `quality`.
pub fn normalize(
    bytes: &[u8],
    target_width: u32,
    target_height: u32,
    quality: u8,
) -> Result<Vec<u8>, ProcessingError> {
    let decoded =
        image::load_from_memory(bytes).map_err(|e| ProcessingError::Decode(e.to_string()))?;

    let (source_width, source_height) = (decoded.width(), decoded.height());
    if source_width == 0 || source_height == 0 {
        return Err(ProcessingError::Decode("image has no pixels".to_string()));
    }

    let flattened = flatten_onto_white(decoded);
    let (width, height) = fit_dimensions(source_width, source_height, target_width, target_height);
    let resized = imageops::resize(&flattened, width, height, FilterType::Lanczos3);

    let mut output = Vec::new();
    let mut encoder = JpegEncoder::new_with_quality(&mut output, quality.clamp(1, 100));
    encoder
        .encode_image(&resized)
        .map_err(|e| ProcessingError::Encode(e.to_string()))?;

    debug!(
        source_width,
        source_height,
        width,
        height,
        input_bytes = bytes.len(),
        output_bytes = output.len(),
        "Image normalized"
    );

    Ok(output)
}

/// Largest size with the source aspect ratio that fits the target box.
///
/// The constrained side always equals its bound; the other side is rounded
/// to the nearest pixel and never drops below one.
pub fn fit_dimensions(
    width: u32,
    height: u32,
    target_width: u32,
    target_height: u32,
) -> (u32, u32) {
    let (w, h) = (u64::from(width.max(1)), u64::from(height.max(1)));
    let (tw, th) = (u64::from(target_width), u64::from(target_height));

    // w/h > tw/th, compared without floating point
    if w * th > tw * h {
        let fitted = (2 * tw * h + w) / (2 * w);
        (target_width, fitted.clamp(1, th) as u32)
    } else {
        let fitted = (2 * th * w + h) / (2 * h);
        (fitted.clamp(1, tw) as u32, target_height)
    }
}

/// Composite any alpha channel onto an opaque white background.
fn flatten_onto_white(image: DynamicImage) -> RgbImage {
    if !image.color().has_alpha() {
        return image.into_rgb8();
    }

    let rgba = image.into_rgba8();
    let (width, height) = rgba.dimensions();
    let mut flattened = RgbImage::new(width, height);

    for (dst, src) in flattened.pixels_mut().zip(rgba.pixels()) {
        let alpha = u32::from(src[3]);
        for channel in 0..3 {
            let blended = u32::from(src[channel]) * alpha + 255 * (255 - alpha);
            dst[channel] = ((blended + 127) / 255) as u8;
        }
    }

    flattened
}
