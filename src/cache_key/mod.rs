//! Cache key derivation for transformation requests.
//!
//! A [`CacheKey`] is the lowercase hex SHA-256 of a versioned canonical
//! serialization of [`TransformParams`]. Two requests that differ only in
//! field order, omitted no-op fields or `-0.0` vs `0.0` produce the same key.
//!
//! # Canonical form
//!
//! Compact JSON with a fixed field order:
//! `resize, crop, rotate, flip, mirror, filters, watermark, format, quality`.
//! `false` booleans are dropped, as is a `filters` object with nothing
//! enabled. Floats use the shortest round-trip rendering.
//!
//! Bump [`KEY_VERSION`] whenever pipeline stage order or stage semantics
//! change, otherwise stale artifacts would be served for new semantics.
//! Hash collisions are not handled.

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

use crate::model::{CropParams, FilterParams, OutputFormat, ResizeParams, TransformParams};

/// Version tag mixed into every digest
pub const KEY_VERSION: &str = "chayachitr-transform:v1";

/// Content-addressed identity of a transformation request
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct CacheKey(String);

impl CacheKey {
    /// Derive the key for a parameter set. Pure and stable across restarts.
    pub fn derive(params: &TransformParams) -> Self {
        let mut hasher = Sha256::new();
        hasher.update(KEY_VERSION.as_bytes());
        hasher.update(b"\n");
        hasher.update(canonical_bytes(params));
        CacheKey(hex::encode(hasher.finalize()))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// First 12 hex chars, for log lines
    pub fn short(&self) -> &str {
        &self.0[..12.min(self.0.len())]
    }
}

impl fmt::Display for CacheKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Error parsing a key that was not produced by [`CacheKey::derive`]
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("invalid cache key: expected 64 lowercase hex characters")]
pub struct InvalidCacheKey;

impl FromStr for CacheKey {
    type Err = InvalidCacheKey;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let well_formed = s.len() == 64
            && s
                .bytes()
                .all(|b| b.is_ascii_digit() || (b'a'..=b'f').contains(&b));
        if well_formed {
            Ok(CacheKey(s.to_string()))
        } else {
            Err(InvalidCacheKey)
        }
    }
}

#[derive(Serialize)]
struct Canonical<'a> {
    #[serde(skip_serializing_if = "Option::is_none")]
    resize: Option<&'a ResizeParams>,
    #[serde(skip_serializing_if = "Option::is_none")]
    crop: Option<&'a CropParams>,
    #[serde(skip_serializing_if = "Option::is_none")]
    rotate: Option<f64>,
    #[serde(skip_serializing_if = "is_false")]
    flip: bool,
    #[serde(skip_serializing_if = "is_false")]
    mirror: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    filters: Option<CanonicalFilters>,
    #[serde(skip_serializing_if = "Option::is_none")]
    watermark: Option<CanonicalWatermark<'a>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    format: Option<OutputFormat>,
    #[serde(skip_serializing_if = "Option::is_none")]
    quality: Option<u8>,
}

#[derive(Serialize)]
struct CanonicalFilters {
    #[serde(skip_serializing_if = "is_false")]
    grayscale: bool,
    #[serde(skip_serializing_if = "is_false")]
    sepia: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    blur: Option<f64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    sharpen: Option<f64>,
}

#[derive(Serialize)]
struct CanonicalWatermark<'a> {
    text: &'a str,
    x: u32,
    y: u32,
    opacity: f64,
    font_size: f64,
}

fn is_false(value: &bool) -> bool {
    !*value
}

/// Collapse negative zero so `-0.0` and `0.0` hash the same
fn normalize(value: f64) -> f64 {
    if value == 0.0 {
        0.0
    } else {
        value
    }
}

fn canonical_filters(filters: &FilterParams) -> Option<CanonicalFilters> {
    if filters.is_noop() {
        return None;
    }
    Some(CanonicalFilters {
        grayscale: filters.grayscale,
        sepia: filters.sepia,
        blur: filters.blur.map(normalize),
        sharpen: filters.sharpen.map(normalize),
    })
}

/// Canonical serialization hashed by [`CacheKey::derive`]
pub fn canonical_bytes(params: &TransformParams) -> Vec<u8> {
    let canonical = Canonical {
        resize: params.resize.as_ref(),
        crop: params.crop.as_ref(),
        rotate: params.rotate.map(normalize),
        flip: params.flip_enabled(),
        mirror: params.mirror_enabled(),
        filters: params.filters.as_ref().and_then(canonical_filters),
        watermark: params.watermark.as_ref().map(|w| CanonicalWatermark {
            text: &w.text,
            x: w.x,
            y: w.y,
            opacity: normalize(w.opacity),
            font_size: normalize(w.font_size),
        }),
        format: params.format,
        quality: params.quality,
    };

    serde_json::to_vec(&canonical)
        .expect("canonical params hold only strings, numbers and string-keyed structs")
}
