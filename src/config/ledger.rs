//! Transformation ledger configuration types.

use serde::{Deserialize, Serialize};

/// Which ledger backend to construct
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LedgerBackend {
    Redis,
    /// Process-local map; only correct for a single service instance
    #[default]
    Memory,
}

/// `ledger:` section
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct LedgerConfig {
    #[serde(default)]
    pub backend: LedgerBackend,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub redis: Option<RedisLedgerConfig>,
}

/// Redis connection settings for the ledger
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RedisLedgerConfig {
    /// Redis connection URL (e.g., "redis://localhost:6379")
    #[serde(default = "default_redis_url")]
    pub url: String,

    /// Prefix for every key written by the ledger (default: "chayachitr")
    #[serde(default = "default_key_prefix")]
    pub key_prefix: String,

    /// Connection timeout in milliseconds (default: 5000 = 5 seconds)
    #[serde(default = "default_connection_timeout_ms")]
    pub connection_timeout_ms: u64,
}

impl Default for RedisLedgerConfig {
    fn default() -> Self {
        Self {
            url: default_redis_url(),
            key_prefix: default_key_prefix(),
            connection_timeout_ms: default_connection_timeout_ms(),
        }
    }
}

fn default_redis_url() -> String {
    "redis://127.0.0.1:6379".to_string()
}

fn default_key_prefix() -> String {
    "chayachitr".to_string()
}

fn default_connection_timeout_ms() -> u64 {
    5000 // 5 seconds
}
