//! Image transformation pipeline.
//!
//! Stages run in a fixed order, each one skipped when its parameter is
//! absent:
//!
//! 1. resize (Lanczos3, exact dimensions)
//! 2. crop (must lie inside the current image)
//! 3. rotate (counter-clockwise degrees)
//! 4. flip (vertical)
//! 5. mirror (horizontal)
//! 6. filters: grayscale, sepia, blur, sharpen
//! 7. watermark
//! 8. encode
//!
//! The order is part of the cache key's meaning: changing it requires
//! bumping [`crate::cache_key::KEY_VERSION`].
//!
//! All work is synchronous and CPU bound. Callers on an async runtime run
//! it on the blocking pool.

pub mod encoder;
pub mod filters;
mod font;
pub mod geometry;
pub mod watermark;

use std::fmt::Display;
use std::io::Cursor;

use image::io::Reader as ImageReader;
use image::{ImageFormat, RgbaImage};
use thiserror::Error;

use crate::config::PipelineConfig;
use crate::model::{OutputFormat, ParamLimits, ParamsError, TransformParams};
pub use encoder::{EncodedImage, EncoderFactory, EncoderQuality, ImageEncoder};
pub use watermark::WatermarkFont;

#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum PipelineError {
    #[error("invalid parameter '{field}': {reason}")]
    InvalidParams { field: String, reason: String },

    #[error("failed to decode image: {0}")]
    Decode(String),

    #[error("failed to encode image: {0}")]
    Encode(String),

    #[error("unsupported image format: {0}")]
    UnsupportedFormat(String),
}

impl PipelineError {
    pub fn invalid_params(field: impl Into<String>, reason: impl Into<String>) -> Self {
        PipelineError::InvalidParams {
            field: field.into(),
            reason: reason.into(),
        }
    }

    pub fn encode_failed(format: &str, err: impl Display) -> Self {
        PipelineError::Encode(format!("{}: {}", format, err))
    }
}

impl From<ParamsError> for PipelineError {
    fn from(err: ParamsError) -> Self {
        match err {
            ParamsError::Invalid { field, reason } => PipelineError::invalid_params(field, reason),
            ParamsError::Malformed(reason) => PipelineError::invalid_params("request", reason),
        }
    }
}

/// Produces a derived image from source bytes.
///
/// Implementations must be deterministic: the same source and parameters
/// always yield equivalent output.
pub trait Transformer: Send + Sync {
    /// `source_format` is a hint used when the bytes do not identify their
    /// own format
    fn apply(
        &self,
        source: &[u8],
        source_format: Option<OutputFormat>,
        params: &TransformParams,
    ) -> Result<EncodedImage, PipelineError>;
}

/// Production [`Transformer`]
#[derive(Debug)]
pub struct TransformPipeline {
    max_pixels: u64,
    limits: ParamLimits,
    font: WatermarkFont,
}

impl Default for TransformPipeline {
    fn default() -> Self {
        Self {
            max_pixels: crate::constants::DEFAULT_MAX_PIXELS,
            limits: ParamLimits::default(),
            font: WatermarkFont::Bitmap,
        }
    }
}

impl TransformPipeline {
    pub fn new(config: &PipelineConfig) -> Result<Self, PipelineError> {
        let font = match &config.watermark_font {
            Some(path) => WatermarkFont::load(path)?,
            None => WatermarkFont::Bitmap,
        };
        Ok(Self {
            max_pixels: config.max_pixels,
            limits: config.limits,
            font,
        })
    }

    fn check_pixels(&self, stage: &str, width: u32, height: u32) -> Result<(), PipelineError> {
        let pixels = width as u64 * height as u64;
        if pixels > self.max_pixels {
            return Err(PipelineError::invalid_params(
                stage,
                format!(
                    "{}x{} ({} pixels) exceeds limit of {} pixels",
                    width, height, pixels, self.max_pixels
                ),
            ));
        }
        Ok(())
    }

    /// Decode the source, refusing oversized images before allocating them
    fn decode(&self, source: &[u8]) -> Result<(RgbaImage, Option<OutputFormat>), PipelineError> {
        let detected = detect_format(source);

        let reader = ImageReader::new(Cursor::new(source))
            .with_guessed_format()
            .map_err(|e| PipelineError::Decode(e.to_string()))?;
        if reader.format().is_none() {
            return Err(PipelineError::UnsupportedFormat(
                "unrecognized image data".to_string(),
            ));
        }

        let (width, height) = reader.into_dimensions().map_err(map_image_error)?;
        self.check_pixels("source", width, height)?;

        let decoded = image::load_from_memory(source).map_err(map_image_error)?;
        Ok((decoded.to_rgba8(), detected))
    }
}

impl Transformer for TransformPipeline {
    fn apply(
        &self,
        source: &[u8],
        source_format: Option<OutputFormat>,
        params: &TransformParams,
    ) -> Result<EncodedImage, PipelineError> {
        params.validate(&self.limits)?;

        let (mut image, detected) = self.decode(source)?;

        if let Some(resize) = &params.resize {
            self.check_pixels("resize", resize.width, resize.height)?;
            image = geometry::resize(&image, resize);
        }

        if let Some(crop) = &params.crop {
            image = geometry::crop(&image, crop)?;
        }

        if let Some(degrees) = params.rotate {
            let (w, h) = geometry::rotated_dimensions(image.width(), image.height(), degrees);
            self.check_pixels("rotate", w, h)?;
            image = geometry::rotate(&image, degrees);
        }

        if params.flip_enabled() {
            image = geometry::flip(&image);
        }

        if params.mirror_enabled() {
            image = geometry::mirror(&image);
        }

        if let Some(active) = params.active_filters() {
            image = filters::apply(image, active);
        }

        if let Some(watermark) = &params.watermark {
            self.font.draw(&mut image, watermark);
        }

        let format = params
            .format
            .or(detected)
            .or(source_format)
            .unwrap_or(OutputFormat::Jpeg);
        let quality = EncoderQuality::from_request(params.quality);
        let (width, height) = image.dimensions();

        EncoderFactory::create(format).encode(image.as_raw(), width, height, quality)
    }
}

/// Identify a supported format from the leading bytes
pub fn detect_format(data: &[u8]) -> Option<OutputFormat> {
    match image::guess_format(data).ok()? {
        ImageFormat::Jpeg => Some(OutputFormat::Jpeg),
        ImageFormat::Png => Some(OutputFormat::Png),
        ImageFormat::Gif => Some(OutputFormat::Gif),
        ImageFormat::WebP => Some(OutputFormat::WebP),
        _ => None,
    }
}

fn map_image_error(err: image::ImageError) -> PipelineError {
    match err {
        image::ImageError::Unsupported(e) => PipelineError::UnsupportedFormat(e.to_string()),
        other => PipelineError::Decode(other.to_string()),
    }
}
