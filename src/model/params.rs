//! Transformation request parameters
//!
//! A request is a set of independently optional stages. Absence of a field
//! means "skip that stage". The JSON shape is the one accepted by the public
//! API:
//!
//! ```text
//! {
//!   "resize": {"width": 400, "height": 300},
//!   "crop": {"x": 0, "y": 0, "width": 200, "height": 200},
//!   "rotate": 90,
//!   "flip": true,
//!   "mirror": false,
//!   "filters": {"grayscale": true, "sepia": false, "blur": 1.5},
//!   "watermark": {"text": "(c) me", "x": 10, "y": 10, "opacity": 0.5, "font_size": 13},
//!   "format": "png",
//!   "quality": 80
//! }
//! ```

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Default watermark glyph height in pixels
pub const DEFAULT_FONT_SIZE: f64 = 13.0;

/// Default watermark opacity
pub const DEFAULT_WATERMARK_OPACITY: f64 = 0.5;

/// Parameter validation errors
#[derive(Debug, Clone, Error, PartialEq)]
pub enum ParamsError {
    /// A field is present but out of range
    #[error("invalid parameter '{field}': {reason}")]
    Invalid { field: &'static str, reason: String },

    /// The request body could not be parsed at all
    #[error("malformed transformation request: {0}")]
    Malformed(String),
}

impl ParamsError {
    pub fn invalid(field: &'static str, reason: impl Into<String>) -> Self {
        ParamsError::Invalid {
            field,
            reason: reason.into(),
        }
    }
}

/// Encodings the pipeline can produce
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum OutputFormat {
    #[serde(alias = "jpg")]
    Jpeg,
    Png,
    Gif,
    #[serde(rename = "webp")]
    WebP,
}

impl OutputFormat {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Jpeg => "jpeg",
            Self::Png => "png",
            Self::Gif => "gif",
            Self::WebP => "webp",
        }
    }

    pub fn content_type(&self) -> &'static str {
        match self {
            Self::Jpeg => "image/jpeg",
            Self::Png => "image/png",
            Self::Gif => "image/gif",
            Self::WebP => "image/webp",
        }
    }

    pub fn extension(&self) -> &'static str {
        match self {
            Self::Jpeg => "jpg",
            Self::Png => "png",
            Self::Gif => "gif",
            Self::WebP => "webp",
        }
    }

    /// Whether the `quality` parameter has any effect on this encoding
    pub fn is_lossy(&self) -> bool {
        matches!(self, Self::Jpeg | Self::WebP)
    }

    pub fn supports_transparency(&self) -> bool {
        !matches!(self, Self::Jpeg)
    }

    /// Map a MIME type (as stored on an uploaded image) to a format
    pub fn from_content_type(content_type: &str) -> Option<Self> {
        let essence = content_type
            .split(';')
            .next()
            .unwrap_or_default()
            .trim()
            .to_ascii_lowercase();
        match essence.as_str() {
            "image/jpeg" | "image/jpg" | "image/pjpeg" => Some(Self::Jpeg),
            "image/png" => Some(Self::Png),
            "image/gif" => Some(Self::Gif),
            "image/webp" => Some(Self::WebP),
            _ => None,
        }
    }

    /// Map a file extension (with or without the leading dot) to a format
    pub fn from_extension(ext: &str) -> Option<Self> {
        ext.trim_start_matches('.').parse().ok()
    }
}

impl fmt::Display for OutputFormat {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for OutputFormat {
    type Err = ParamsError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "jpeg" | "jpg" => Ok(OutputFormat::Jpeg),
            "png" => Ok(OutputFormat::Png),
            "gif" => Ok(OutputFormat::Gif),
            "webp" => Ok(OutputFormat::WebP),
            _ => Err(ParamsError::invalid(
                "format",
                format!("unknown format: {}", s),
            )),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct ResizeParams {
    pub width: u32,
    pub height: u32,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct CropParams {
    #[serde(default)]
    pub x: u32,
    #[serde(default)]
    pub y: u32,
    pub width: u32,
    pub height: u32,
}

#[derive(Debug, Clone, Copy, PartialEq, Default, Serialize, Deserialize)]
pub struct FilterParams {
    #[serde(default)]
    pub grayscale: bool,
    #[serde(default)]
    pub sepia: bool,
    /// Gaussian blur sigma
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub blur: Option<f64>,
    /// Unsharp-mask sigma
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub sharpen: Option<f64>,
}

impl FilterParams {
    /// True when no filter would change the image
    pub fn is_noop(&self) -> bool {
        !self.grayscale && !self.sepia && self.blur.is_none() && self.sharpen.is_none()
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WatermarkParams {
    pub text: String,
    /// Left edge of the text box
    #[serde(default)]
    pub x: u32,
    /// Top edge of the text box
    #[serde(default)]
    pub y: u32,
    #[serde(default = "default_opacity")]
    pub opacity: f64,
    #[serde(default = "default_font_size")]
    pub font_size: f64,
}

fn default_opacity() -> f64 {
    DEFAULT_WATERMARK_OPACITY
}

fn default_font_size() -> f64 {
    DEFAULT_FONT_SIZE
}

/// Upper bounds applied during validation
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct ParamLimits {
    #[serde(default = "default_max_dimension")]
    pub max_dimension: u32,
    #[serde(default = "default_max_sigma")]
    pub max_sigma: f64,
    #[serde(default = "default_max_watermark_chars")]
    pub max_watermark_chars: usize,
    #[serde(default = "default_max_font_size")]
    pub max_font_size: f64,
}

fn default_max_dimension() -> u32 {
    10_000
}

fn default_max_sigma() -> f64 {
    100.0
}

fn default_max_watermark_chars() -> usize {
    256
}

fn default_max_font_size() -> f64 {
    512.0
}

impl Default for ParamLimits {
    fn default() -> Self {
        Self {
            max_dimension: default_max_dimension(),
            max_sigma: default_max_sigma(),
            max_watermark_chars: default_max_watermark_chars(),
            max_font_size: default_max_font_size(),
        }
    }
}

/// A complete transformation request
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct TransformParams {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub resize: Option<ResizeParams>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub crop: Option<CropParams>,
    /// Counter-clockwise rotation in degrees
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub rotate: Option<f64>,
    /// Vertical flip
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub flip: Option<bool>,
    /// Horizontal flip
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub mirror: Option<bool>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub filters: Option<FilterParams>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub watermark: Option<WatermarkParams>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub format: Option<OutputFormat>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub quality: Option<u8>,
}

impl TransformParams {
    /// Parse a JSON request body
    pub fn from_json(json: &str) -> Result<Self, ParamsError> {
        serde_json::from_str(json).map_err(|e| ParamsError::Malformed(e.to_string()))
    }

    pub fn flip_enabled(&self) -> bool {
        self.flip.unwrap_or(false)
    }

    pub fn mirror_enabled(&self) -> bool {
        self.mirror.unwrap_or(false)
    }

    /// Filters that would actually change the image, if any
    pub fn active_filters(&self) -> Option<&FilterParams> {
        self.filters.as_ref().filter(|f| !f.is_noop())
    }

    /// Check every present field against the configured limits.
    ///
    /// Bounds that depend on the source image (crop rectangle) are checked
    /// by the pipeline once the image is decoded.
    pub fn validate(&self, limits: &ParamLimits) -> Result<(), ParamsError> {
        if let Some(resize) = &self.resize {
            check_dimension("resize.width", resize.width, limits)?;
            check_dimension("resize.height", resize.height, limits)?;
        }

        if let Some(crop) = &self.crop {
            check_dimension("crop.width", crop.width, limits)?;
            check_dimension("crop.height", crop.height, limits)?;
        }

        if let Some(degrees) = self.rotate {
            if !degrees.is_finite() || degrees.abs() > 360.0 {
                return Err(ParamsError::invalid(
                    "rotate",
                    format!("must be between -360 and 360 degrees, got {}", degrees),
                ));
            }
        }

        if let Some(filters) = &self.filters {
            if let Some(sigma) = filters.blur {
                check_sigma("filters.blur", sigma, limits)?;
            }
            if let Some(sigma) = filters.sharpen {
                check_sigma("filters.sharpen", sigma, limits)?;
            }
        }

        if let Some(watermark) = &self.watermark {
            if watermark.text.trim().is_empty() {
                return Err(ParamsError::invalid("watermark.text", "must not be empty"));
            }
            let chars = watermark.text.chars().count();
            if chars > limits.max_watermark_chars {
                return Err(ParamsError::invalid(
                    "watermark.text",
                    format!(
                        "{} characters exceeds limit of {}",
                        chars, limits.max_watermark_chars
                    ),
                ));
            }
            if !watermark.opacity.is_finite() || !(0.0..=1.0).contains(&watermark.opacity) {
                return Err(ParamsError::invalid(
                    "watermark.opacity",
                    format!("must be between 0 and 1, got {}", watermark.opacity),
                ));
            }
            if !watermark.font_size.is_finite()
                || watermark.font_size <= 0.0
                || watermark.font_size > limits.max_font_size
            {
                return Err(ParamsError::invalid(
                    "watermark.font_size",
                    format!(
                        "must be in (0, {}], got {}",
                        limits.max_font_size, watermark.font_size
                    ),
                ));
            }
        }

        if let Some(quality) = self.quality {
            if !(1..=100).contains(&quality) {
                return Err(ParamsError::invalid(
                    "quality",
                    format!("must be 1-100, got {}", quality),
                ));
            }
        }

        Ok(())
    }
}

fn check_dimension(field: &'static str, value: u32, limits: &ParamLimits) -> Result<(), ParamsError> {
    if value == 0 {
        return Err(ParamsError::invalid(field, "must be greater than 0"));
    }
    if value > limits.max_dimension {
        return Err(ParamsError::invalid(
            field,
            format!("{} exceeds limit of {}", value, limits.max_dimension),
        ));
    }
    Ok(())
}

fn check_sigma(field: &'static str, sigma: f64, limits: &ParamLimits) -> Result<(), ParamsError> {
    if !sigma.is_finite() || sigma <= 0.0 || sigma > limits.max_sigma {
        return Err(ParamsError::invalid(
            field,
            format!("must be in (0, {}], got {}", limits.max_sigma, sigma),
        ));
    }
    Ok(())
}
