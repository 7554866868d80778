// Two service instances sharing one Redis ledger and one blob directory,
// as two replicas would in production.

use std::io::Cursor;
use std::sync::Arc;

use bytes::Bytes;
use chayachitr::config::{FilesystemStoreConfig, RedisLedgerConfig, ServiceConfig};
use chayachitr::ledger::{MetadataBackends, RedisLedger, TransformationLedger};
use chayachitr::model::{FilterParams, OutputFormat, ResizeParams, TransformParams, UserId};
use chayachitr::pipeline::TransformPipeline;
use chayachitr::storage::FilesystemStore;
use chayachitr::TransformationService;
use futures::future::join;
use testcontainers::{clients::Cli, RunnableImage};
use testcontainers_modules::redis::Redis;

async fn instance(root: &std::path::Path, redis_port: u16) -> (TransformationService, Arc<RedisLedger>) {
    let store = Arc::new(
        FilesystemStore::open(&FilesystemStoreConfig {
            root: root.to_path_buf(),
            public_base_url: "https://blobs.test".to_string(),
            signing_key: "shared-signing-key-0123".to_string(),
            quota_bytes: None,
        })
        .await
        .unwrap(),
    );
    let ledger = Arc::new(
        RedisLedger::connect(RedisLedgerConfig {
            url: format!("redis://127.0.0.1:{}", redis_port),
            key_prefix: "e2e".to_string(),
            connection_timeout_ms: 5000,
        })
        .await
        .unwrap(),
    );
    let service = TransformationService::new(
        store,
        MetadataBackends::from_backend(ledger.clone()),
        Arc::new(TransformPipeline::default()),
        ServiceConfig::default(),
    );
    (service, ledger)
}

fn sample_png() -> Vec<u8> {
    let image = image::RgbaImage::from_fn(120, 80, |x, y| {
        image::Rgba([(x * 2) as u8, (y * 3) as u8, 90, 255])
    });
    let mut out = Cursor::new(Vec::new());
    image::DynamicImage::ImageRgba8(image)
        .write_to(&mut out, image::ImageFormat::Png)
        .unwrap();
    out.into_inner()
}

#[tokio::test]
#[ignore] // Requires Docker
async fn test_replicas_agree_on_one_transformation() {
    let docker = Cli::default();
    let container = docker.run(RunnableImage::from(Redis::default()));
    let port = container.get_host_port_ipv4(6379);
    let dir = tempfile::tempdir().unwrap();

    let (a, ledger) = instance(dir.path(), port).await;
    let (b, _) = instance(dir.path(), port).await;

    let alice = UserId::new("alice");
    let image = a
        .upload(&alice, "sample.png", "image/png", Bytes::from(sample_png()))
        .await
        .unwrap()
        .image;

    let params = TransformParams {
        resize: Some(ResizeParams {
            width: 60,
            height: 40,
        }),
        filters: Some(FilterParams {
            sepia: true,
            ..Default::default()
        }),
        format: Some(OutputFormat::WebP),
        quality: Some(70),
        ..Default::default()
    };

    // Coalescing is per process, so both replicas may run the pipeline
    let (from_a, from_b) = join(
        a.transform(&alice, &image.id, params.clone()),
        b.transform(&alice, &image.id, params.clone()),
    )
    .await;
    let (from_a, from_b) = (from_a.unwrap(), from_b.unwrap());

    assert_eq!(from_a.transformation, from_b.transformation);
    assert_eq!(from_a.content_type, "image/webp");
    assert_eq!(ledger.list_for_image(&image.id).await.unwrap().len(), 1);

    // Image registered on one replica is visible from the other
    let view = b.get_image(&alice, &image.id).await.unwrap();
    assert_eq!(view.image.transformations, vec![from_a.transformation.clone()]);

    let repeat = b.transform(&alice, &image.id, params).await.unwrap();
    assert!(repeat.cache_hit);
}
