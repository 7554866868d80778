// S3 object store against LocalStack (testcontainers)

use std::time::Duration;

use bytes::Bytes;
use chayachitr::config::S3StoreConfig;
use chayachitr::storage::{ObjectStore, S3Store, StorageError};
use testcontainers::{clients::Cli, Container, RunnableImage};
use testcontainers_modules::localstack::LocalStack;

fn start_localstack(docker: &Cli) -> (Container<'_, LocalStack>, String) {
    let image = RunnableImage::from(LocalStack::default()).with_env_var(("SERVICES", "s3"));
    let container = docker.run(image);
    let endpoint = format!("http://127.0.0.1:{}", container.get_host_port_ipv4(4566));
    (container, endpoint)
}

fn s3_config(endpoint: &str, bucket: &str) -> S3StoreConfig {
    S3StoreConfig {
        bucket: bucket.to_string(),
        region: "us-east-1".to_string(),
        endpoint: Some(endpoint.to_string()),
        access_key: Some("test".to_string()),
        secret_key: Some("test".to_string()),
        force_path_style: true,
        create_bucket: true,
    }
}

#[tokio::test]
#[ignore] // Requires Docker
async fn test_ensure_bucket_is_idempotent() {
    let docker = Cli::default();
    let (_container, endpoint) = start_localstack(&docker);

    let store = S3Store::connect(&s3_config(&endpoint, "bootstrap")).await.unwrap();
    store.ensure_bucket().await.unwrap();
    store.ensure_bucket().await.unwrap();
}

#[tokio::test]
#[ignore] // Requires Docker
async fn test_put_get_delete_round_trip() {
    let docker = Cli::default();
    let (_container, endpoint) = start_localstack(&docker);
    let store = S3Store::connect(&s3_config(&endpoint, "objects")).await.unwrap();
    store.ensure_bucket().await.unwrap();

    let key = "uploads/abc.png";
    let written = store
        .put(key, Bytes::from_static(b"first"), "image/png")
        .await
        .unwrap();
    assert_eq!(written, key);

    // Overwrite is allowed
    store
        .put(key, Bytes::from_static(b"second"), "image/png")
        .await
        .unwrap();
    assert_eq!(store.get(key).await.unwrap(), Bytes::from_static(b"second"));

    store.delete(key).await.unwrap();
    assert!(matches!(store.get(key).await, Err(StorageError::NotFound(_))));
}

#[tokio::test]
#[ignore] // Requires Docker
async fn test_presigned_url_serves_object() {
    let docker = Cli::default();
    let (_container, endpoint) = start_localstack(&docker);
    let store = S3Store::connect(&s3_config(&endpoint, "signed")).await.unwrap();
    store.ensure_bucket().await.unwrap();

    store
        .put("a/b.jpg", Bytes::from_static(b"jpeg bytes"), "image/jpeg")
        .await
        .unwrap();
    let url = store
        .url_for("a/b.jpg", Duration::from_secs(600))
        .await
        .unwrap();
    assert!(url.starts_with(&endpoint));
    assert!(url.contains("/signed/a/b.jpg"));
    assert!(url.contains("X-Amz-Signature="));
}

#[tokio::test]
#[ignore] // Requires Docker
async fn test_missing_bucket_is_unavailable() {
    let docker = Cli::default();
    let (_container, endpoint) = start_localstack(&docker);
    let mut config = s3_config(&endpoint, "never-created");
    config.create_bucket = false;
    let store = S3Store::connect(&config).await.unwrap();

    let err = store
        .put("k", Bytes::from_static(b"x"), "image/png")
        .await
        .unwrap_err();
    assert!(matches!(err, StorageError::Unavailable(_) | StorageError::NotFound(_)));
}
