//! Object storage abstraction.
//!
//! Originals and derived artifacts live in a blob store addressed by string
//! keys. Two backends are provided:
//!
//! - [`S3Store`]: AWS S3 or any S3-compatible endpoint (MinIO)
//! - [`FilesystemStore`]: a local directory with HMAC-signed URLs
//!
//! The backend is chosen at startup from [`StorageConfig`] and shared as
//! `Arc<dyn ObjectStore>`.

pub mod filesystem;
pub mod s3;

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;
use thiserror::Error;

use crate::cache_key::CacheKey;
use crate::config::{StorageBackend, StorageConfig};

pub use filesystem::FilesystemStore;
pub use s3::S3Store;

/// Errors returned by object store operations
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum StorageError {
    #[error("object not found: {0}")]
    NotFound(String),

    #[error("storage unavailable: {0}")]
    Unavailable(String),

    #[error("storage quota exceeded: {0}")]
    QuotaExceeded(String),

    #[error("invalid object key: {0}")]
    InvalidKey(String),
}

/// Blob store holding originals and derived images
#[async_trait]
pub trait ObjectStore: Send + Sync {
    /// Store bytes under `key`, overwriting any existing object.
    /// Returns the key that was written.
    async fn put(&self, key: &str, data: Bytes, content_type: &str) -> Result<String, StorageError>;

    /// Fetch the object stored under `key`
    async fn get(&self, key: &str) -> Result<Bytes, StorageError>;

    /// Time-limited URL for reading `key`. Called on every read, so it
    /// must not perform network round trips.
    async fn url_for(&self, key: &str, ttl: Duration) -> Result<String, StorageError>;

    /// Remove the object. Deleting a missing key returns `NotFound` or `Ok`
    /// depending on the backend; callers treat both as success.
    async fn delete(&self, key: &str) -> Result<(), StorageError>;

    /// Short backend name for logs
    fn backend_name(&self) -> &'static str;

    /// Key under which the derivative of `original_key` for `digest` is
    /// stored: `{stem}_{digest}{ext}`
    fn derive_key(&self, original_key: &str, digest: &CacheKey) -> String {
        derive_key(original_key, digest)
    }
}

/// Split `key` into stem and extension (with the dot). Only the last path
/// segment is considered, and a leading dot does not start an extension.
fn split_extension(key: &str) -> (&str, &str) {
    let segment_start = key.rfind('/').map(|i| i + 1).unwrap_or(0);
    match key[segment_start..].rfind('.') {
        Some(pos) if pos > 0 => key.split_at(segment_start + pos),
        _ => (key, ""),
    }
}

/// See [`ObjectStore::derive_key`]
pub fn derive_key(original_key: &str, digest: &CacheKey) -> String {
    let (stem, ext) = split_extension(original_key);
    format!("{}_{}{}", stem, digest, ext)
}

/// Build the configured backend
pub async fn build_object_store(config: &StorageConfig) -> Result<Arc<dyn ObjectStore>, StorageError> {
    match config.backend {
        StorageBackend::S3 => {
            let s3_config = config.s3.as_ref().ok_or_else(|| {
                StorageError::Unavailable("storage.s3 section is required for the s3 backend".into())
            })?;
            let store = S3Store::connect(s3_config).await?;
            if s3_config.create_bucket {
                store.ensure_bucket().await?;
            }
            Ok(Arc::new(store))
        }
        StorageBackend::Filesystem => {
            let fs_config = config.filesystem.as_ref().ok_or_else(|| {
                StorageError::Unavailable(
                    "storage.filesystem section is required for the filesystem backend".into(),
                )
            })?;
            Ok(Arc::new(FilesystemStore::open(fs_config).await?))
        }
    }
}
