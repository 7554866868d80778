//! Domain records: users, images and transformations.

pub mod params;

use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::cache_key::CacheKey;
pub use params::{
    CropParams, FilterParams, OutputFormat, ParamLimits, ParamsError, ResizeParams,
    TransformParams, WatermarkParams,
};

/// Authenticated user identity, compared by equality only
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct UserId(String);

impl UserId {
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for UserId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

macro_rules! uuid_id {
    ($name:ident) => {
        #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
        #[serde(transparent)]
        pub struct $name(Uuid);

        impl $name {
            pub fn new() -> Self {
                Self(Uuid::new_v4())
            }
        }

        impl Default for $name {
            fn default() -> Self {
                Self::new()
            }
        }

        impl fmt::Display for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                self.0.hyphenated().fmt(f)
            }
        }

        impl FromStr for $name {
            type Err = uuid::Error;

            fn from_str(s: &str) -> Result<Self, Self::Err> {
                Uuid::parse_str(s).map(Self)
            }
        }
    };
}

uuid_id!(ImageId);
uuid_id!(TransformationId);

/// An uploaded original image
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Image {
    pub id: ImageId,
    pub user_id: UserId,
    pub filename: String,
    /// Storage key of the original bytes; never changes after upload
    pub object_key: String,
    pub content_type: String,
    pub size: u64,
    /// Denormalized view of the ledger, maintained best-effort
    #[serde(default)]
    pub transformations: Vec<Transformation>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl Image {
    pub fn new(
        user_id: UserId,
        filename: impl Into<String>,
        object_key: impl Into<String>,
        content_type: impl Into<String>,
        size: u64,
    ) -> Self {
        let now = Utc::now();
        Self {
            id: ImageId::new(),
            user_id,
            filename: filename.into(),
            object_key: object_key.into(),
            content_type: content_type.into(),
            size,
            transformations: Vec::new(),
            created_at: now,
            updated_at: now,
        }
    }

    pub fn is_owned_by(&self, user_id: &UserId) -> bool {
        &self.user_id == user_id
    }

    /// Format of the original, from its recorded content type
    pub fn source_format(&self) -> Option<OutputFormat> {
        OutputFormat::from_content_type(&self.content_type)
    }
}

/// A materialized derivative of an image
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Transformation {
    pub id: TransformationId,
    pub image_id: ImageId,
    pub object_key: String,
    pub params: TransformParams,
    pub digest: CacheKey,
    pub content_type: String,
    pub created_at: DateTime<Utc>,
}

impl Transformation {
    pub fn new(
        image_id: ImageId,
        object_key: impl Into<String>,
        params: TransformParams,
        digest: CacheKey,
        content_type: impl Into<String>,
    ) -> Self {
        Self {
            id: TransformationId::new(),
            image_id,
            object_key: object_key.into(),
            params,
            digest,
            content_type: content_type.into(),
            created_at: Utc::now(),
        }
    }
}
