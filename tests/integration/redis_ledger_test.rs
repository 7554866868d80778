// Redis ledger against a real server (testcontainers)

use std::sync::Arc;

use chayachitr::config::RedisLedgerConfig;
use chayachitr::ledger::{ImageCatalog, RedisLedger, TransformationLedger};
use chayachitr::model::{Image, ImageId, TransformParams, Transformation, UserId};
use chayachitr::CacheKey;
use futures::future::join_all;
use testcontainers::{clients::Cli, RunnableImage};
use testcontainers_modules::redis::Redis;

fn config(port: u16, prefix: &str) -> RedisLedgerConfig {
    RedisLedgerConfig {
        url: format!("redis://127.0.0.1:{}", port),
        key_prefix: prefix.to_string(),
        connection_timeout_ms: 5000,
    }
}

fn transformation(image_id: ImageId, rotate: f64, key: &str) -> Transformation {
    let params = TransformParams {
        rotate: Some(rotate),
        ..Default::default()
    };
    let digest = CacheKey::derive(&params);
    Transformation::new(image_id, key, params, digest, "image/png")
}

#[tokio::test]
#[ignore] // Requires Docker
async fn test_connect_and_health_check() {
    let docker = Cli::default();
    let container = docker.run(RunnableImage::from(Redis::default()));
    let port = container.get_host_port_ipv4(6379);

    let ledger = RedisLedger::connect(config(port, "health")).await.unwrap();
    assert!(ledger.health_check().await);
    assert_eq!(ledger.backend_name(), "redis");
}

#[tokio::test]
#[ignore] // Requires Docker
async fn test_record_if_absent_keeps_first_writer() {
    let docker = Cli::default();
    let container = docker.run(RunnableImage::from(Redis::default()));
    let ledger = RedisLedger::connect(config(container.get_host_port_ipv4(6379), "first"))
        .await
        .unwrap();

    let image_id = ImageId::new();
    let first = transformation(image_id, 90.0, "a.png");
    let second = transformation(image_id, 90.0, "b.png");

    let outcome = ledger.record_if_absent(first.clone()).await.unwrap();
    assert!(outcome.created);
    assert_eq!(outcome.transformation, first);

    let outcome = ledger.record_if_absent(second).await.unwrap();
    assert!(!outcome.created);
    assert_eq!(outcome.transformation, first);

    let found = ledger.find(&image_id, &first.digest).await.unwrap();
    assert_eq!(found, Some(first.clone()));
    assert_eq!(ledger.list_for_image(&image_id).await.unwrap(), vec![first]);
}

#[tokio::test]
#[ignore] // Requires Docker
async fn test_concurrent_record_if_absent_has_one_winner() {
    let docker = Cli::default();
    let container = docker.run(RunnableImage::from(Redis::default()));
    let ledger = Arc::new(
        RedisLedger::connect(config(container.get_host_port_ipv4(6379), "race"))
            .await
            .unwrap(),
    );

    let image_id = ImageId::new();
    let attempts = (0..32).map(|i| {
        let ledger = ledger.clone();
        let candidate = transformation(image_id, 45.0, &format!("k{}.png", i));
        tokio::spawn(async move { ledger.record_if_absent(candidate).await.unwrap() })
    });
    let outcomes: Vec<_> = join_all(attempts)
        .await
        .into_iter()
        .map(Result::unwrap)
        .collect();

    assert_eq!(outcomes.iter().filter(|o| o.created).count(), 1);
    let winner = &outcomes.iter().find(|o| o.created).unwrap().transformation;
    assert!(outcomes.iter().all(|o| &o.transformation == winner));
    assert_eq!(ledger.list_for_image(&image_id).await.unwrap().len(), 1);
}

#[tokio::test]
#[ignore] // Requires Docker
async fn test_image_catalog_and_projection() {
    let docker = Cli::default();
    let container = docker.run(RunnableImage::from(Redis::default()));
    let ledger = RedisLedger::connect(config(container.get_host_port_ipv4(6379), "catalog"))
        .await
        .unwrap();

    let alice = UserId::new("alice");
    let mut ids = Vec::new();
    for i in 0..3 {
        let image = Image::new(alice.clone(), format!("{}.png", i), format!("uploads/{}.png", i), "image/png", 10);
        ids.push(image.id);
        ledger.insert_image(image).await.unwrap();
        tokio::time::sleep(std::time::Duration::from_millis(5)).await;
    }
    ledger
        .insert_image(Image::new(UserId::new("bob"), "b.png", "uploads/b.png", "image/png", 1))
        .await
        .unwrap();

    let (page, total) = ledger.list_images(&alice, 0, 2).await.unwrap();
    assert_eq!(total, 3);
    assert_eq!(page.iter().map(|i| i.id).collect::<Vec<_>>(), vec![ids[2], ids[1]]);

    let t = transformation(ids[0], 180.0, "uploads/0_x.png");
    ledger.record_if_absent(t.clone()).await.unwrap();
    ledger.append_to_image(&ids[0], &t).await.unwrap();
    // Duplicate appends are tolerated and collapsed on read
    ledger.append_to_image(&ids[0], &t).await.unwrap();

    let image = ledger.get_image(&ids[0]).await.unwrap().unwrap();
    assert_eq!(image.transformations, vec![t]);
    assert!(ledger.get_image(&ImageId::new()).await.unwrap().is_none());
}

#[tokio::test]
#[ignore] // Requires Docker
async fn test_records_survive_reconnect() {
    let docker = Cli::default();
    let container = docker.run(RunnableImage::from(Redis::default()));
    let port = container.get_host_port_ipv4(6379);

    let image_id = ImageId::new();
    let t = transformation(image_id, 30.0, "persist.png");
    {
        let ledger = RedisLedger::connect(config(port, "persist")).await.unwrap();
        ledger.record_if_absent(t.clone()).await.unwrap();
    }

    let ledger = RedisLedger::connect(config(port, "persist")).await.unwrap();
    assert_eq!(ledger.find(&image_id, &t.digest).await.unwrap(), Some(t));

    // Prefixes isolate deployments sharing one server
    let other = RedisLedger::connect(config(port, "other")).await.unwrap();
    assert!(other.list_for_image(&image_id).await.unwrap().is_empty());
}
