// Configuration loading against the shipped example file

use chayachitr::config::*;

const EXAMPLE: &str = include_str!("../../config.example.yaml");

#[test]
fn test_example_config_loads_and_validates() {
    std::env::set_var("CHAYACHITR_SIGNING_KEY", "example-signing-key-0123456789");
    let config = Config::from_yaml_with_env(EXAMPLE).expect("example config should parse");
    config.validate().expect("example config should validate");

    assert_eq!(config.storage.backend, StorageBackend::Filesystem);
    let fs = config.storage.filesystem.as_ref().unwrap();
    assert_eq!(fs.signing_key, "example-signing-key-0123456789");
    assert_eq!(fs.quota_bytes, Some(10 * 1024 * 1024 * 1024));

    assert_eq!(config.ledger.backend, LedgerBackend::Redis);
    assert_eq!(config.ledger.redis.as_ref().unwrap().key_prefix, "chayachitr");
    assert_eq!(config.service.pipeline_timeout_secs, 120);
    assert_eq!(config.pipeline.limits.max_dimension, 10_000);
    assert_eq!(config.logging.format, LogFormat::Json);
}

#[test]
fn test_empty_document_uses_defaults() {
    let config = Config::from_yaml_with_env("{}").unwrap();
    assert_eq!(config.storage.backend, StorageBackend::Filesystem);
    assert_eq!(config.ledger.backend, LedgerBackend::Memory);
    assert_eq!(config.storage.url_ttl_secs, 86_400);
    assert!(config.service.coalescing);

    // Filesystem backend without its section cannot start
    assert!(config.validate().is_err());
}

#[test]
fn test_minimal_memory_deployment() {
    let yaml = r#"
storage:
  filesystem:
    root: /tmp/chayachitr
    public_base_url: http://localhost:8080/blobs
    signing_key: "0123456789abcdef"
logging:
  format: pretty
"#;
    let config = Config::from_yaml_with_env(yaml).unwrap();
    config.validate().unwrap();
    assert_eq!(config.logging.format, LogFormat::Pretty);
    assert_eq!(config.storage.filesystem.unwrap().quota_bytes, None);
}

#[test]
fn test_s3_deployment_with_minio() {
    std::env::set_var("CHAYACHITR_TEST_MINIO_SECRET", "minio-secret");
    let yaml = r#"
storage:
  backend: s3
  url_ttl_secs: 3600
  s3:
    bucket: images
    endpoint: http://localhost:9000
    access_key: minio
    secret_key: ${CHAYACHITR_TEST_MINIO_SECRET}
    force_path_style: true
"#;
    let config = Config::from_yaml_with_env(yaml).unwrap();
    config.validate().unwrap();
    let s3 = config.storage.s3.unwrap();
    assert_eq!(s3.region, "us-east-1");
    assert_eq!(s3.secret_key.as_deref(), Some("minio-secret"));
    assert!(s3.force_path_style);
    assert!(!s3.create_bucket);
}

#[test]
fn test_s3_url_ttl_cannot_exceed_a_week() {
    let yaml = r#"
storage:
  backend: s3
  url_ttl_secs: 700000
  s3:
    bucket: images
"#;
    let config = Config::from_yaml_with_env(yaml).unwrap();
    let err = config.validate().unwrap_err();
    assert!(err.contains("url_ttl_secs"), "{}", err);
}

#[test]
fn test_unknown_backend_is_a_parse_error() {
    let yaml = "storage:\n  backend: ftp\n";
    assert!(Config::from_yaml_with_env(yaml).is_err());
}
