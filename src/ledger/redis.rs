// Redis-backed ledger
//
// Key layout (all under the configured prefix):
//   {prefix}:tx:{image_id}:{digest}         transformation record
//   {prefix}:tx-index:{image_id}            set of recorded digests
//   {prefix}:image:{image_id}               image record
//   {prefix}:image:{image_id}:transformations  projected list (may lag)
//   {prefix}:user:{user_id}:images          sorted set of image ids by created_at

use std::time::Duration;

use async_trait::async_trait;
use redis::aio::ConnectionManager;
use redis::{Client, Script};

use super::serialization::{decode, encode};
use super::{merge_transformations, ImageCatalog, LedgerError, RecordOutcome, TransformationLedger};
use crate::cache_key::CacheKey;
use crate::config::RedisLedgerConfig;
use crate::model::{Image, ImageId, Transformation, UserId};

/// Insert the record and index its digest in one step, or return the
/// record already stored.
const RECORD_IF_ABSENT_SCRIPT: &str = r#"
if redis.call('SET', KEYS[1], ARGV[1], 'NX') then
  redis.call('SADD', KEYS[2], ARGV[2])
  return {1, ARGV[1]}
end
return {0, redis.call('GET', KEYS[1])}
"#;

pub struct RedisLedger {
    /// Redis connection manager (async, multiplexed, reconnecting)
    connection: ConnectionManager,
    key_prefix: String,
    record_script: Script,
}

impl RedisLedger {
    /// Connect to Redis. Fails when the server cannot be reached within
    /// the configured connection timeout.
    pub async fn connect(config: RedisLedgerConfig) -> Result<Self, LedgerError> {
        let client = Client::open(config.url.as_str())
            .map_err(|e| LedgerError::Unavailable(format!("Invalid Redis URL: {}", e)))?;

        let timeout = Duration::from_millis(config.connection_timeout_ms);
        let connection = tokio::time::timeout(timeout, ConnectionManager::new(client))
            .await
            .map_err(|_| {
                LedgerError::Unavailable(format!(
                    "Timed out connecting to Redis after {}ms",
                    config.connection_timeout_ms
                ))
            })?
            .map_err(|e| LedgerError::Unavailable(format!("Failed to connect to Redis: {}", e)))?;

        tracing::info!(key_prefix = %config.key_prefix, "Connected Redis ledger");

        Ok(Self {
            connection,
            key_prefix: config.key_prefix,
            record_script: Script::new(RECORD_IF_ABSENT_SCRIPT),
        })
    }

    fn tx_key(&self, image_id: &ImageId, digest: &CacheKey) -> String {
        format!("{}:tx:{}:{}", self.key_prefix, image_id, digest)
    }

    fn tx_index_key(&self, image_id: &ImageId) -> String {
        format!("{}:tx-index:{}", self.key_prefix, image_id)
    }

    fn image_key(&self, image_id: &ImageId) -> String {
        format!("{}:image:{}", self.key_prefix, image_id)
    }

    fn projection_key(&self, image_id: &ImageId) -> String {
        format!("{}:image:{}:transformations", self.key_prefix, image_id)
    }

    fn user_images_key(&self, user_id: &UserId) -> String {
        format!("{}:user:{}:images", self.key_prefix, user_id)
    }

    /// Checks that Redis answers PING
    pub async fn health_check(&self) -> bool {
        let mut conn = self.connection.clone();
        redis::cmd("PING")
            .query_async::<String>(&mut conn)
            .await
            .map(|reply| reply == "PONG")
            .unwrap_or(false)
    }

    async fn projection(&self, image_id: &ImageId) -> Result<Vec<Transformation>, LedgerError> {
        let mut conn = self.connection.clone();
        let raw: Vec<Vec<u8>> = redis::cmd("LRANGE")
            .arg(self.projection_key(image_id))
            .arg(0)
            .arg(-1)
            .query_async(&mut conn)
            .await
            .map_err(unavailable)?;
        decode_all(&raw)
    }
}

fn unavailable(err: redis::RedisError) -> LedgerError {
    LedgerError::Unavailable(err.to_string())
}

fn decode_all<T: serde::de::DeserializeOwned>(raw: &[Vec<u8>]) -> Result<Vec<T>, LedgerError> {
    raw.iter().map(|bytes| decode(bytes)).collect()
}

#[async_trait]
impl TransformationLedger for RedisLedger {
    async fn find(
        &self,
        image_id: &ImageId,
        digest: &CacheKey,
    ) -> Result<Option<Transformation>, LedgerError> {
        let mut conn = self.connection.clone();
        let raw: Option<Vec<u8>> = redis::cmd("GET")
            .arg(self.tx_key(image_id, digest))
            .query_async(&mut conn)
            .await
            .map_err(unavailable)?;
        raw.map(|bytes| decode(&bytes)).transpose()
    }

    async fn record_if_absent(
        &self,
        transformation: Transformation,
    ) -> Result<RecordOutcome, LedgerError> {
        let encoded = encode(&transformation)?;
        let mut conn = self.connection.clone();

        let (created, stored): (i64, Vec<u8>) = self
            .record_script
            .key(self.tx_key(&transformation.image_id, &transformation.digest))
            .key(self.tx_index_key(&transformation.image_id))
            .arg(encoded)
            .arg(transformation.digest.as_str())
            .invoke_async(&mut conn)
            .await
            .map_err(unavailable)?;

        if created == 1 {
            Ok(RecordOutcome {
                transformation,
                created: true,
            })
        } else {
            Ok(RecordOutcome {
                transformation: decode(&stored)?,
                created: false,
            })
        }
    }

    async fn append_to_image(
        &self,
        image_id: &ImageId,
        transformation: &Transformation,
    ) -> Result<(), LedgerError> {
        let encoded = encode(transformation)?;
        let mut conn = self.connection.clone();
        redis::cmd("RPUSH")
            .arg(self.projection_key(image_id))
            .arg(encoded)
            .query_async::<i64>(&mut conn)
            .await
            .map_err(unavailable)?;
        Ok(())
    }

    async fn list_for_image(&self, image_id: &ImageId) -> Result<Vec<Transformation>, LedgerError> {
        let mut conn = self.connection.clone();
        let digests: Vec<String> = redis::cmd("SMEMBERS")
            .arg(self.tx_index_key(image_id))
            .query_async(&mut conn)
            .await
            .map_err(unavailable)?;
        if digests.is_empty() {
            return Ok(Vec::new());
        }

        let keys: Vec<String> = digests
            .iter()
            .map(|digest| format!("{}:tx:{}:{}", self.key_prefix, image_id, digest))
            .collect();
        let raw: Vec<Option<Vec<u8>>> = redis::cmd("MGET")
            .arg(&keys)
            .query_async(&mut conn)
            .await
            .map_err(unavailable)?;

        let records = raw
            .into_iter()
            .flatten()
            .map(|bytes| decode(&bytes))
            .collect::<Result<Vec<Transformation>, _>>()?;
        Ok(merge_transformations(records, Vec::new()))
    }

    fn backend_name(&self) -> &'static str {
        "redis"
    }
}

#[async_trait]
impl ImageCatalog for RedisLedger {
    async fn insert_image(&self, image: Image) -> Result<(), LedgerError> {
        let encoded = encode(&image)?;
        let mut conn = self.connection.clone();
        redis::pipe()
            .atomic()
            .cmd("SET")
            .arg(self.image_key(&image.id))
            .arg(encoded)
            .ignore()
            .cmd("ZADD")
            .arg(self.user_images_key(&image.user_id))
            .arg(image.created_at.timestamp_millis())
            .arg(image.id.to_string())
            .ignore()
            .query_async::<()>(&mut conn)
            .await
            .map_err(unavailable)?;
        Ok(())
    }

    async fn get_image(&self, image_id: &ImageId) -> Result<Option<Image>, LedgerError> {
        let mut conn = self.connection.clone();
        let raw: Option<Vec<u8>> = redis::cmd("GET")
            .arg(self.image_key(image_id))
            .query_async(&mut conn)
            .await
            .map_err(unavailable)?;
        let Some(bytes) = raw else {
            return Ok(None);
        };

        let mut image: Image = decode(&bytes)?;
        let projected = self.projection(image_id).await?;
        image.transformations =
            merge_transformations(std::mem::take(&mut image.transformations), projected);
        Ok(Some(image))
    }

    async fn list_images(
        &self,
        user_id: &UserId,
        offset: usize,
        limit: usize,
    ) -> Result<(Vec<Image>, u64), LedgerError> {
        let index_key = self.user_images_key(user_id);
        let mut conn = self.connection.clone();

        let total: u64 = redis::cmd("ZCARD")
            .arg(&index_key)
            .query_async(&mut conn)
            .await
            .map_err(unavailable)?;
        if limit == 0 || offset as u64 >= total {
            return Ok((Vec::new(), total));
        }

        let ids: Vec<String> = redis::cmd("ZREVRANGE")
            .arg(&index_key)
            .arg(offset)
            .arg(offset + limit - 1)
            .query_async(&mut conn)
            .await
            .map_err(unavailable)?;

        let mut images = Vec::with_capacity(ids.len());
        for id in ids {
            let Ok(image_id) = id.parse::<ImageId>() else {
                tracing::warn!(image_id = %id, "Skipping malformed image id in user index");
                continue;
            };
            if let Some(image) = self.get_image(&image_id).await? {
                images.push(image);
            }
        }
        Ok((images, total))
    }
}

// Verify Send + Sync bounds (required for async trait)
fn _assert_send_sync() {
    fn assert_send<T: Send>() {}
    fn assert_sync<T: Sync>() {}

    assert_send::<RedisLedger>();
    assert_sync::<RedisLedger>();
}
