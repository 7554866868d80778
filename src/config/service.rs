//! Service, pipeline and logging configuration types.

use std::path::PathBuf;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::constants::{
    DEFAULT_MAX_PIXELS, DEFAULT_MAX_UPLOAD_BYTES, DEFAULT_METADATA_TIMEOUT_SECS,
    DEFAULT_PIPELINE_TIMEOUT_SECS, DEFAULT_STORAGE_TIMEOUT_SECS,
};
use crate::model::ParamLimits;

fn default_metadata_timeout_secs() -> u64 {
    DEFAULT_METADATA_TIMEOUT_SECS
}

fn default_storage_timeout_secs() -> u64 {
    DEFAULT_STORAGE_TIMEOUT_SECS
}

fn default_pipeline_timeout_secs() -> u64 {
    DEFAULT_PIPELINE_TIMEOUT_SECS
}

fn default_max_upload_bytes() -> u64 {
    DEFAULT_MAX_UPLOAD_BYTES
}

fn default_coalescing() -> bool {
    true
}

/// `service:` section
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServiceConfig {
    /// Timeout for catalog and ledger calls (default: 10)
    #[serde(default = "default_metadata_timeout_secs")]
    pub metadata_timeout_secs: u64,

    /// Timeout for object store get/put (default: 30)
    #[serde(default = "default_storage_timeout_secs")]
    pub storage_timeout_secs: u64,

    /// Timeout for one pipeline run (default: 120)
    #[serde(default = "default_pipeline_timeout_secs")]
    pub pipeline_timeout_secs: u64,

    /// Largest accepted upload (default: 10 MiB)
    #[serde(default = "default_max_upload_bytes")]
    pub max_upload_bytes: u64,

    /// Collapse concurrent identical requests inside this process
    #[serde(default = "default_coalescing")]
    pub coalescing: bool,
}

impl ServiceConfig {
    pub fn metadata_timeout(&self) -> Duration {
        Duration::from_secs(self.metadata_timeout_secs)
    }

    pub fn storage_timeout(&self) -> Duration {
        Duration::from_secs(self.storage_timeout_secs)
    }

    pub fn pipeline_timeout(&self) -> Duration {
        Duration::from_secs(self.pipeline_timeout_secs)
    }
}

impl Default for ServiceConfig {
    fn default() -> Self {
        Self {
            metadata_timeout_secs: default_metadata_timeout_secs(),
            storage_timeout_secs: default_storage_timeout_secs(),
            pipeline_timeout_secs: default_pipeline_timeout_secs(),
            max_upload_bytes: default_max_upload_bytes(),
            coalescing: default_coalescing(),
        }
    }
}

fn default_max_pixels() -> u64 {
    DEFAULT_MAX_PIXELS
}

/// `pipeline:` section
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PipelineConfig {
    /// Largest decoded or intermediate image, in pixels (default: 100 MP)
    #[serde(default = "default_max_pixels")]
    pub max_pixels: u64,

    #[serde(default)]
    pub limits: ParamLimits,

    /// TrueType font for watermarks; the built-in bitmap font is used when absent
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub watermark_font: Option<PathBuf>,
}

impl Default for PipelineConfig {
    fn default() -> Self {
        Self {
            max_pixels: default_max_pixels(),
            limits: ParamLimits::default(),
            watermark_font: None,
        }
    }
}

/// Log output encoding
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LogFormat {
    #[default]
    Json,
    Pretty,
}

fn default_log_level() -> String {
    "info".to_string()
}

/// `logging:` section
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LoggingConfig {
    /// Filter directive used when RUST_LOG is unset (default: "info")
    #[serde(default = "default_log_level")]
    pub level: String,

    #[serde(default)]
    pub format: LogFormat,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: default_log_level(),
            format: LogFormat::default(),
        }
    }
}
