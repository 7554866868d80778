//! Persistent record of images and materialized transformations.
//!
//! The [`TransformationLedger`] is the correctness boundary of the cache:
//! at most one [`Transformation`] exists per `(ImageId, CacheKey)`, enforced
//! by an atomic insert-if-absent in the backing store. The per-image list on
//! [`Image`] is a projection that may lag behind and is healed from
//! [`TransformationLedger::list_for_image`].
//!
//! Backends:
//! - [`RedisLedger`]: shared across service instances
//! - [`MemoryLedger`]: single process only, for tests and local runs

pub mod memory;
pub mod redis;
mod serialization;

use std::sync::Arc;

use async_trait::async_trait;
use thiserror::Error;

use crate::cache_key::CacheKey;
use crate::config::{LedgerBackend, LedgerConfig};
use crate::model::{Image, ImageId, Transformation, UserId};

pub use memory::MemoryLedger;
pub use self::redis::RedisLedger;

#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum LedgerError {
    #[error("ledger backend unavailable: {0}")]
    Unavailable(String),

    #[error("ledger record serialization failed: {0}")]
    Serialization(String),

    #[error("unsupported ledger record version: {found} (expected: {expected})")]
    UnsupportedVersion { found: u8, expected: u8 },
}

/// Result of [`TransformationLedger::record_if_absent`]
#[derive(Debug, Clone, PartialEq)]
pub struct RecordOutcome {
    /// The record now stored for the key: ours when `created`, else the winner's
    pub transformation: Transformation,
    /// False when another writer got there first
    pub created: bool,
}

#[async_trait]
pub trait TransformationLedger: Send + Sync {
    /// Look up the transformation recorded for `(image_id, digest)`
    async fn find(
        &self,
        image_id: &ImageId,
        digest: &CacheKey,
    ) -> Result<Option<Transformation>, LedgerError>;

    /// Atomically insert unless a record for the same `(image_id, digest)`
    /// exists. Every concurrent caller observes the same stored record.
    async fn record_if_absent(
        &self,
        transformation: Transformation,
    ) -> Result<RecordOutcome, LedgerError>;

    /// Best-effort append to the image's projected transformation list.
    /// Duplicates are tolerated.
    async fn append_to_image(
        &self,
        image_id: &ImageId,
        transformation: &Transformation,
    ) -> Result<(), LedgerError>;

    /// Every transformation recorded for an image, oldest first
    async fn list_for_image(&self, image_id: &ImageId) -> Result<Vec<Transformation>, LedgerError>;

    fn backend_name(&self) -> &'static str;
}

/// Metadata store for uploaded images
#[async_trait]
pub trait ImageCatalog: Send + Sync {
    async fn insert_image(&self, image: Image) -> Result<(), LedgerError>;

    async fn get_image(&self, image_id: &ImageId) -> Result<Option<Image>, LedgerError>;

    /// One page of a user's images, newest first, with the total count
    async fn list_images(
        &self,
        user_id: &UserId,
        offset: usize,
        limit: usize,
    ) -> Result<(Vec<Image>, u64), LedgerError>;
}

/// Ledger and catalog sharing one backend
#[derive(Clone)]
pub struct MetadataBackends {
    pub ledger: Arc<dyn TransformationLedger>,
    pub catalog: Arc<dyn ImageCatalog>,
}

impl MetadataBackends {
    pub fn from_backend<B>(backend: Arc<B>) -> Self
    where
        B: TransformationLedger + ImageCatalog + 'static,
    {
        Self {
            ledger: backend.clone(),
            catalog: backend,
        }
    }
}

/// Build the configured backend
pub async fn build_metadata_backends(config: &LedgerConfig) -> Result<MetadataBackends, LedgerError> {
    match config.backend {
        LedgerBackend::Memory => {
            tracing::warn!("Using in-memory ledger; records are lost on restart and not shared");
            Ok(MetadataBackends::from_backend(Arc::new(MemoryLedger::new())))
        }
        LedgerBackend::Redis => {
            let redis_config = config.redis.clone().unwrap_or_default();
            let ledger = RedisLedger::connect(redis_config).await?;
            Ok(MetadataBackends::from_backend(Arc::new(ledger)))
        }
    }
}

/// Merge two transformation lists, keeping the first record seen per digest,
/// ordered by creation time
pub(crate) fn merge_transformations(
    primary: Vec<Transformation>,
    extra: Vec<Transformation>,
) -> Vec<Transformation> {
    let mut seen = std::collections::HashSet::new();
    let mut merged: Vec<Transformation> = primary
        .into_iter()
        .chain(extra)
        .filter(|t| seen.insert(t.digest.clone()))
        .collect();
    merged.sort_by(|a, b| a.created_at.cmp(&b.created_at).then(a.id.cmp(&b.id)));
    merged
}
