//! Object storage configuration types.

use std::path::PathBuf;

use serde::{Deserialize, Serialize};

use crate::constants::DEFAULT_URL_TTL_SECS;

/// Which object store backend to construct
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum StorageBackend {
    S3,
    #[default]
    Filesystem,
}

fn default_url_ttl_secs() -> u64 {
    DEFAULT_URL_TTL_SECS
}

/// `storage:` section
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StorageConfig {
    #[serde(default)]
    pub backend: StorageBackend,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub s3: Option<S3StoreConfig>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub filesystem: Option<FilesystemStoreConfig>,

    /// Lifetime of URLs handed back to callers (default: 24 hours)
    #[serde(default = "default_url_ttl_secs")]
    pub url_ttl_secs: u64,
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self {
            backend: StorageBackend::default(),
            s3: None,
            filesystem: None,
            url_ttl_secs: default_url_ttl_secs(),
        }
    }
}

fn default_region() -> String {
    "us-east-1".to_string()
}

/// S3 or S3-compatible (MinIO) bucket settings
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct S3StoreConfig {
    pub bucket: String,

    #[serde(default = "default_region")]
    pub region: String,

    /// Custom endpoint, e.g. `http://minio:9000`
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub endpoint: Option<String>,

    /// Static credentials; the default AWS provider chain is used when absent
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub access_key: Option<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub secret_key: Option<String>,

    /// Path-style addressing, required by MinIO
    #[serde(default)]
    pub force_path_style: bool,

    /// Create the bucket at startup when it does not exist
    #[serde(default)]
    pub create_bucket: bool,
}

/// Local directory store settings
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FilesystemStoreConfig {
    /// Directory holding the objects
    pub root: PathBuf,

    /// Base of generated URLs, e.g. `https://cdn.example.com/blobs`
    pub public_base_url: String,

    /// HMAC key for signing URLs
    pub signing_key: String,

    /// Maximum total bytes stored; unlimited when absent
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub quota_bytes: Option<u64>,
}
