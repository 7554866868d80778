//! Output encoders
//!
//! Every encoder takes straight RGBA8 pixels. Formats without an alpha
//! channel flatten the image over black before encoding.

use std::io::Cursor;

use super::PipelineError;
use crate::constants::DEFAULT_QUALITY;
use crate::model::OutputFormat;

/// Quality setting for lossy encoders (1-100, where 100 is best quality)
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct EncoderQuality(u8);

impl Default for EncoderQuality {
    fn default() -> Self {
        Self(DEFAULT_QUALITY)
    }
}

impl EncoderQuality {
    pub fn new(quality: u8) -> Self {
        Self(quality.clamp(1, 100))
    }

    /// Requested quality, or the default when the request omits it
    pub fn from_request(quality: Option<u8>) -> Self {
        quality.map(Self::new).unwrap_or_default()
    }

    pub fn value(&self) -> u8 {
        self.0
    }
}

/// Result of encoding an image
#[derive(Debug, Clone, PartialEq)]
pub struct EncodedImage {
    pub data: Vec<u8>,
    pub format: OutputFormat,
    pub width: u32,
    pub height: u32,
}

impl EncodedImage {
    pub fn new(data: Vec<u8>, format: OutputFormat, width: u32, height: u32) -> Self {
        Self {
            data,
            format,
            width,
            height,
        }
    }

    pub fn content_type(&self) -> &'static str {
        self.format.content_type()
    }
}

/// Encodes raw RGBA pixels into one output format
pub trait ImageEncoder: Send + Sync {
    fn format(&self) -> OutputFormat;

    /// Encode `data` (RGBA, 4 bytes per pixel) of the given dimensions
    fn encode(
        &self,
        data: &[u8],
        width: u32,
        height: u32,
        quality: EncoderQuality,
    ) -> Result<EncodedImage, PipelineError>;
}

pub struct JpegEncoder;

impl ImageEncoder for JpegEncoder {
    fn format(&self) -> OutputFormat {
        OutputFormat::Jpeg
    }

    fn encode(
        &self,
        data: &[u8],
        width: u32,
        height: u32,
        quality: EncoderQuality,
    ) -> Result<EncodedImage, PipelineError> {
        use image::codecs::jpeg::JpegEncoder as ImageJpegEncoder;
        use image::ImageEncoder as _;

        let rgb_data = flatten_to_rgb(data);

        let mut output = Cursor::new(Vec::new());
        ImageJpegEncoder::new_with_quality(&mut output, quality.value())
            .write_image(&rgb_data, width, height, image::ColorType::Rgb8)
            .map_err(|e| PipelineError::encode_failed("jpeg", e))?;

        Ok(EncodedImage::new(output.into_inner(), OutputFormat::Jpeg, width, height))
    }
}

pub struct PngEncoder;

impl ImageEncoder for PngEncoder {
    fn format(&self) -> OutputFormat {
        OutputFormat::Png
    }

    fn encode(
        &self,
        data: &[u8],
        width: u32,
        height: u32,
        _quality: EncoderQuality,
    ) -> Result<EncodedImage, PipelineError> {
        use image::codecs::png::PngEncoder as ImagePngEncoder;
        use image::ImageEncoder as _;

        let mut output = Cursor::new(Vec::new());
        ImagePngEncoder::new(&mut output)
            .write_image(data, width, height, image::ColorType::Rgba8)
            .map_err(|e| PipelineError::encode_failed("png", e))?;

        Ok(EncodedImage::new(output.into_inner(), OutputFormat::Png, width, height))
    }
}

/// Single-frame GIF; colors are quantized to a 256-entry palette
pub struct GifEncoder;

impl ImageEncoder for GifEncoder {
    fn format(&self) -> OutputFormat {
        OutputFormat::Gif
    }

    fn encode(
        &self,
        data: &[u8],
        width: u32,
        height: u32,
        _quality: EncoderQuality,
    ) -> Result<EncodedImage, PipelineError> {
        use image::codecs::gif::GifEncoder as ImageGifEncoder;

        let mut output = Vec::new();
        {
            // The trailer is written when the encoder is dropped
            let mut encoder = ImageGifEncoder::new(&mut output);
            encoder
                .encode(data, width, height, image::ColorType::Rgba8)
                .map_err(|e| PipelineError::encode_failed("gif", e))?;
        }

        Ok(EncodedImage::new(output, OutputFormat::Gif, width, height))
    }
}

/// Lossy WebP via libwebp
pub struct WebPEncoder;

impl ImageEncoder for WebPEncoder {
    fn format(&self) -> OutputFormat {
        OutputFormat::WebP
    }

    fn encode(
        &self,
        data: &[u8],
        width: u32,
        height: u32,
        quality: EncoderQuality,
    ) -> Result<EncodedImage, PipelineError> {
        if width == 0 || height == 0 || width > 16383 || height > 16383 {
            return Err(PipelineError::encode_failed(
                "webp",
                format!("{}x{} exceeds WebP dimension limits", width, height),
            ));
        }

        let encoded = webp::Encoder::from_rgba(data, width, height).encode(quality.value() as f32);
        if encoded.is_empty() {
            return Err(PipelineError::encode_failed("webp", "encoder produced no output"));
        }

        Ok(EncodedImage::new(encoded.to_vec(), OutputFormat::WebP, width, height))
    }
}

/// Factory for creating encoders based on output format
pub struct EncoderFactory;

impl EncoderFactory {
    pub fn create(format: OutputFormat) -> Box<dyn ImageEncoder> {
        match format {
            OutputFormat::Jpeg => Box::new(JpegEncoder),
            OutputFormat::Png => Box::new(PngEncoder),
            OutputFormat::Gif => Box::new(GifEncoder),
            OutputFormat::WebP => Box::new(WebPEncoder),
        }
    }
}

/// Drop the alpha channel by compositing over black
fn flatten_to_rgb(rgba: &[u8]) -> Vec<u8> {
    let mut rgb = Vec::with_capacity(rgba.len() / 4 * 3);
    for px in rgba.chunks_exact(4) {
        let alpha = px[3] as u32;
        for &channel in &px[..3] {
            rgb.push(((channel as u32 * alpha + 127) / 255) as u8);
        }
    }
    rgb
}
