// Configuration module

mod ledger;
mod service;
mod storage;

use regex::Regex;
use serde::{Deserialize, Serialize};
use std::path::Path;

pub use ledger::{LedgerBackend, LedgerConfig, RedisLedgerConfig};
pub use service::{LogFormat, LoggingConfig, PipelineConfig, ServiceConfig};
pub use storage::{FilesystemStoreConfig, S3StoreConfig, StorageBackend, StorageConfig};

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Config {
    #[serde(default)]
    pub storage: StorageConfig,
    #[serde(default)]
    pub ledger: LedgerConfig,
    #[serde(default)]
    pub service: ServiceConfig,
    #[serde(default)]
    pub pipeline: PipelineConfig,
    #[serde(default)]
    pub logging: LoggingConfig,
}

impl Config {
    pub fn from_yaml_with_env(yaml: &str) -> Result<Self, String> {
        // Replace ${VAR_NAME} with environment variable values
        let re = Regex::new(r"\$\{([A-Z_][A-Z0-9_]*)\}").map_err(|e| e.to_string())?;

        // Comments are copied through untouched so they may mention ${VAR}
        let mut missing = Vec::new();
        let mut substituted = String::with_capacity(yaml.len());
        for line in yaml.split_inclusive('\n') {
            let (content, comment) = line.split_at(comment_start(line).unwrap_or(line.len()));
            let replaced = re.replace_all(content, |caps: &regex::Captures| {
                let var_name = &caps[1];
                std::env::var(var_name).unwrap_or_else(|_| {
                    missing.push(var_name.to_string());
                    String::new()
                })
            });
            substituted.push_str(&replaced);
            substituted.push_str(comment);
        }

        if let Some(var_name) = missing.first() {
            return Err(format!(
                "Environment variable '{}' is referenced but not set",
                var_name
            ));
        }

        serde_yaml::from_str(&substituted).map_err(|e| e.to_string())
    }

    pub fn from_file<P: AsRef<Path>>(path: P) -> Result<Self, String> {
        let yaml = std::fs::read_to_string(path)
            .map_err(|e| format!("Failed to read config file: {}", e))?;
        Self::from_yaml_with_env(&yaml)
    }

    pub fn validate(&self) -> Result<(), String> {
        match self.storage.backend {
            StorageBackend::S3 => {
                let s3 = self
                    .storage
                    .s3
                    .as_ref()
                    .ok_or("storage.backend is 's3' but the storage.s3 section is missing")?;
                if s3.bucket.is_empty() {
                    return Err("storage.s3.bucket cannot be empty".to_string());
                }
                if s3.access_key.is_some() != s3.secret_key.is_some() {
                    return Err(
                        "storage.s3.access_key and storage.s3.secret_key must be set together"
                            .to_string(),
                    );
                }
                if let Some(endpoint) = &s3.endpoint {
                    if !endpoint.starts_with("http://") && !endpoint.starts_with("https://") {
                        return Err(format!(
                            "storage.s3.endpoint '{}' must start with http:// or https://",
                            endpoint
                        ));
                    }
                }
            }
            StorageBackend::Filesystem => {
                let fs = self.storage.filesystem.as_ref().ok_or(
                    "storage.backend is 'filesystem' but the storage.filesystem section is missing",
                )?;
                if fs.signing_key.len() < 16 {
                    return Err(
                        "storage.filesystem.signing_key must be at least 16 characters".to_string(),
                    );
                }
                if fs.public_base_url.is_empty() {
                    return Err("storage.filesystem.public_base_url cannot be empty".to_string());
                }
                if fs.quota_bytes == Some(0) {
                    return Err("storage.filesystem.quota_bytes must be greater than 0".to_string());
                }
            }
        }

        if self.storage.url_ttl_secs == 0 {
            return Err("storage.url_ttl_secs must be greater than 0".to_string());
        }
        // S3 presigned URLs cannot outlive one week
        if self.storage.backend == StorageBackend::S3 && self.storage.url_ttl_secs > 604_800 {
            return Err("storage.url_ttl_secs cannot exceed 604800 for s3".to_string());
        }

        if self.ledger.backend == LedgerBackend::Redis {
            let redis = self
                .ledger
                .redis
                .as_ref()
                .ok_or("ledger.backend is 'redis' but the ledger.redis section is missing")?;
            if !redis.url.starts_with("redis://") && !redis.url.starts_with("rediss://") {
                return Err(format!(
                    "ledger.redis.url '{}' must start with redis:// or rediss://",
                    redis.url
                ));
            }
            if redis.key_prefix.is_empty() {
                return Err("ledger.redis.key_prefix cannot be empty".to_string());
            }
        }

        let service = &self.service;
        if service.metadata_timeout_secs == 0
            || service.storage_timeout_secs == 0
            || service.pipeline_timeout_secs == 0
        {
            return Err("service timeouts must be greater than 0".to_string());
        }
        if service.max_upload_bytes == 0 {
            return Err("service.max_upload_bytes must be greater than 0".to_string());
        }

        let pipeline = &self.pipeline;
        if pipeline.max_pixels == 0 {
            return Err("pipeline.max_pixels must be greater than 0".to_string());
        }
        if pipeline.limits.max_dimension == 0 {
            return Err("pipeline.limits.max_dimension must be greater than 0".to_string());
        }
        if !(pipeline.limits.max_sigma > 0.0) || !(pipeline.limits.max_font_size > 0.0) {
            return Err("pipeline.limits sigma and font size bounds must be positive".to_string());
        }
        if let Some(font) = &pipeline.watermark_font {
            if !font.exists() {
                return Err(format!(
                    "pipeline.watermark_font '{}' does not exist",
                    font.display()
                ));
            }
        }

        tracing_subscriber::EnvFilter::try_new(&self.logging.level)
            .map_err(|e| format!("logging.level '{}' is invalid: {}", self.logging.level, e))?;

        Ok(())
    }
}

/// Byte offset of the `#` opening a YAML comment on `line`. A `#` only
/// starts a comment at line start or after whitespace, outside quotes.
fn comment_start(line: &str) -> Option<usize> {
    let mut quote = None;
    let mut after_space = true;
    for (i, c) in line.char_indices() {
        match quote {
            Some(q) if c == q => quote = None,
            Some(_) => {}
            None if (c == '"' || c == '\'') && after_space => quote = Some(c),
            None if c == '#' && after_space => return Some(i),
            None => {}
        }
        after_space = c.is_whitespace();
    }
    None
}
