//! S3 / MinIO object store.

use std::time::Duration;

use async_trait::async_trait;
use aws_sdk_s3::config::http::HttpResponse;
use aws_sdk_s3::error::{ProvideErrorMetadata, SdkError};
use aws_sdk_s3::presigning::PresigningConfig;
use aws_sdk_s3::primitives::ByteStream;
use aws_sdk_s3::types::{BucketLocationConstraint, CreateBucketConfiguration};
use aws_sdk_s3::Client as S3Client;
use bytes::Bytes;

use super::{ObjectStore, StorageError};
use crate::config::S3StoreConfig;

/// Error codes S3-compatible servers use when an account or bucket is full
const QUOTA_ERROR_CODES: &[&str] = &[
    "QuotaExceeded",
    "XMinioStorageFull",
    "XMinioAdminBucketQuotaExceeded",
    "EntityTooLarge",
];

/// Object store talking to AWS S3 or an S3-compatible endpoint
pub struct S3Store {
    client: S3Client,
    bucket: String,
    region: String,
}

impl S3Store {
    /// Build a client from configuration. No request is made.
    pub async fn connect(config: &S3StoreConfig) -> Result<Self, StorageError> {
        let mut loader = aws_config::defaults(aws_config::BehaviorVersion::latest())
            .region(aws_config::Region::new(config.region.clone()));

        if let Some(endpoint) = &config.endpoint {
            loader = loader.endpoint_url(endpoint);
        }
        if let (Some(access_key), Some(secret_key)) = (&config.access_key, &config.secret_key) {
            loader = loader.credentials_provider(aws_credential_types::Credentials::new(
                access_key.clone(),
                secret_key.clone(),
                None,
                None,
                "chayachitr-config",
            ));
        }

        let sdk_config = loader.load().await;
        let s3_config = aws_sdk_s3::config::Builder::from(&sdk_config)
            .force_path_style(config.force_path_style)
            .build();

        tracing::info!(
            bucket = %config.bucket,
            region = %config.region,
            endpoint = ?config.endpoint,
            force_path_style = config.force_path_style,
            "Configured S3 object store"
        );

        Ok(Self::from_client(
            S3Client::from_conf(s3_config),
            config.bucket.clone(),
            config.region.clone(),
        ))
    }

    pub fn from_client(client: S3Client, bucket: String, region: String) -> Self {
        Self {
            client,
            bucket,
            region,
        }
    }

    pub fn bucket(&self) -> &str {
        &self.bucket
    }

    /// Create the bucket if it does not exist yet
    pub async fn ensure_bucket(&self) -> Result<(), StorageError> {
        match self.client.head_bucket().bucket(&self.bucket).send().await {
            Ok(_) => return Ok(()),
            Err(err) if http_status(&err) == Some(404) => {}
            Err(err) => return Err(map_sdk_error(&self.bucket, err)),
        }

        let mut request = self.client.create_bucket().bucket(&self.bucket);
        // us-east-1 rejects an explicit location constraint
        if self.region != "us-east-1" {
            request = request.create_bucket_configuration(
                CreateBucketConfiguration::builder()
                    .location_constraint(BucketLocationConstraint::from(self.region.as_str()))
                    .build(),
            );
        }

        match request.send().await {
            Ok(_) => {
                tracing::info!(bucket = %self.bucket, "Created S3 bucket");
                Ok(())
            }
            Err(err) => {
                let code = err.as_service_error().and_then(|e| e.code()).unwrap_or("");
                if code == "BucketAlreadyOwnedByYou" || code == "BucketAlreadyExists" {
                    Ok(())
                } else {
                    Err(map_sdk_error(&self.bucket, err))
                }
            }
        }
    }
}

#[async_trait]
impl ObjectStore for S3Store {
    async fn put(&self, key: &str, data: Bytes, content_type: &str) -> Result<String, StorageError> {
        let size = data.len();
        self.client
            .put_object()
            .bucket(&self.bucket)
            .key(key)
            .body(ByteStream::from(data))
            .content_type(content_type)
            .send()
            .await
            .map_err(|e| map_sdk_error(key, e))?;

        tracing::debug!(bucket = %self.bucket, key = %key, bytes = size, "Stored object in S3");
        Ok(key.to_string())
    }

    async fn get(&self, key: &str) -> Result<Bytes, StorageError> {
        let response = self
            .client
            .get_object()
            .bucket(&self.bucket)
            .key(key)
            .send()
            .await
            .map_err(|e| {
                let missing = e
                    .as_service_error()
                    .map(|service_err| service_err.is_no_such_key())
                    .unwrap_or(false);
                if missing {
                    StorageError::NotFound(key.to_string())
                } else {
                    map_sdk_error(key, e)
                }
            })?;

        let body = response.body.collect().await.map_err(|e| {
            StorageError::Unavailable(format!("failed to read body of {}: {}", key, e))
        })?;
        Ok(body.into_bytes())
    }

    async fn url_for(&self, key: &str, ttl: Duration) -> Result<String, StorageError> {
        let presigning = PresigningConfig::expires_in(ttl)
            .map_err(|e| StorageError::Unavailable(format!("invalid URL lifetime: {}", e)))?;

        // Presigning is computed locally; no request is sent
        let request = self
            .client
            .get_object()
            .bucket(&self.bucket)
            .key(key)
            .presigned(presigning)
            .await
            .map_err(|e| map_sdk_error(key, e))?;

        Ok(request.uri().to_string())
    }

    async fn delete(&self, key: &str) -> Result<(), StorageError> {
        self.client
            .delete_object()
            .bucket(&self.bucket)
            .key(key)
            .send()
            .await
            .map_err(|e| map_sdk_error(key, e))?;
        Ok(())
    }

    fn backend_name(&self) -> &'static str {
        "s3"
    }
}

fn http_status<E>(err: &SdkError<E, HttpResponse>) -> Option<u16> {
    err.raw_response().map(|response| response.status().as_u16())
}

fn map_sdk_error<E>(key: &str, err: SdkError<E, HttpResponse>) -> StorageError
where
    E: ProvideErrorMetadata + std::error::Error + 'static,
{
    let status = http_status(&err);
    let code = err
        .as_service_error()
        .and_then(|e| e.code())
        .map(str::to_string);
    classify_failure(key, status, code.as_deref(), || err.to_string())
}

/// Map an HTTP status and S3 error code onto a storage error. `detail`
/// describes failures that carry no error code.
fn classify_failure(
    key: &str,
    status: Option<u16>,
    code: Option<&str>,
    detail: impl FnOnce() -> String,
) -> StorageError {
    match (status, code) {
        (Some(404), _) | (_, Some("NoSuchKey")) | (_, Some("NotFound")) => {
            StorageError::NotFound(key.to_string())
        }
        (_, Some(code)) if QUOTA_ERROR_CODES.contains(&code) => {
            StorageError::QuotaExceeded(format!("{}: {}", key, code))
        }
        (Some(507), _) => StorageError::QuotaExceeded(format!("{}: insufficient storage", key)),
        (_, Some(code)) => StorageError::Unavailable(format!("{}: {}", key, code)),
        (_, None) => StorageError::Unavailable(format!("{}: {}", key, detail())),
    }
}
