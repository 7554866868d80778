// TransformationService behaviour: idempotence, at-most-one
// materialization, ownership and error mapping.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;
use chayachitr::config::ServiceConfig;
use chayachitr::ledger::{
    ImageCatalog, LedgerError, MemoryLedger, MetadataBackends, RecordOutcome, TransformationLedger,
};
use chayachitr::storage::{ObjectStore, StorageError};
use chayachitr::model::{
    CropParams, FilterParams, Image, ImageId, OutputFormat, ResizeParams, TransformParams,
    Transformation,
};
use chayachitr::{CacheKey, ServiceError};
use futures::future::join_all;
use tokio::sync::Notify;

use super::harness::{user, Harness};

fn grayscale_png() -> TransformParams {
    TransformParams {
        resize: Some(ResizeParams {
            width: 400,
            height: 300,
        }),
        filters: Some(FilterParams {
            grayscale: true,
            ..Default::default()
        }),
        format: Some(OutputFormat::Png),
        ..Default::default()
    }
}

#[tokio::test]
async fn test_sequential_requests_run_pipeline_once() {
    let h = Harness::new().await;
    let alice = user("alice");
    let image = h.upload_png(&alice, 64, 48).await;
    let params = TransformParams {
        rotate: Some(90.0),
        ..Default::default()
    };

    let first = h
        .service
        .transform(&alice, &image.id, params.clone())
        .await
        .unwrap();
    let second = h.service.transform(&alice, &image.id, params).await.unwrap();

    assert!(!first.cache_hit);
    assert!(second.cache_hit);
    assert_eq!(first.object_key, second.object_key);
    assert_eq!(first.digest, second.digest);
    assert_eq!(first.transformation.id, second.transformation.id);
    assert_eq!(h.pipeline_runs(), 1);
}

#[tokio::test]
async fn test_end_to_end_resize_grayscale_png() {
    let h = Harness::new().await;
    let alice = user("alice");
    let image = h.upload_jpeg(&alice, 800, 600).await;

    let outcome = h
        .service
        .transform(&alice, &image.id, grayscale_png())
        .await
        .unwrap();
    assert_eq!(outcome.content_type, "image/png");
    assert_eq!(
        outcome.object_key,
        format!(
            "{}_{}.jpg",
            image.object_key.trim_end_matches(".jpg"),
            outcome.digest
        )
    );

    let stored = h.store_bytes(&outcome.object_key).await;
    assert_eq!(
        image::guess_format(&stored).unwrap(),
        image::ImageFormat::Png
    );
    let decoded = image::load_from_memory(&stored).unwrap().to_rgba8();
    assert_eq!(decoded.dimensions(), (400, 300));
    assert!(decoded.pixels().all(|p| p[0] == p[1] && p[1] == p[2]));

    // Same request again is served from the ledger
    let again = h
        .service
        .transform(&alice, &image.id, grayscale_png())
        .await
        .unwrap();
    assert!(again.cache_hit);
    assert_eq!(again.object_key, outcome.object_key);
    assert_eq!(h.pipeline_runs(), 1);

    // Any parameter change is a different transformation
    let with_quality = TransformParams {
        quality: Some(80),
        ..grayscale_png()
    };
    let third = h
        .service
        .transform(&alice, &image.id, with_quality)
        .await
        .unwrap();
    assert_ne!(third.digest, outcome.digest);
    assert_ne!(third.object_key, outcome.object_key);
    assert!(!third.cache_hit);
    assert_eq!(h.pipeline_runs(), 2);
}

#[tokio::test]
async fn test_concurrent_identical_requests_record_once() {
    let h = Harness::with_options(ServiceConfig::default(), Duration::from_millis(100)).await;
    let alice = user("alice");
    let image = h.upload_png(&alice, 32, 32).await;
    let params = TransformParams {
        mirror: Some(true),
        ..Default::default()
    };

    let outcomes = join_all(
        (0..16).map(|_| h.service.transform(&alice, &image.id, params.clone())),
    )
    .await;

    let outcomes: Vec<_> = outcomes.into_iter().map(Result::unwrap).collect();
    let first = &outcomes[0];
    assert!(outcomes
        .iter()
        .all(|o| o.object_key == first.object_key && o.transformation.id == first.transformation.id));
    assert_eq!(outcomes.iter().filter(|o| !o.cache_hit).count(), 1);
    assert_eq!(h.ledger.transformation_count(), 1);
    assert_eq!(h.pipeline_runs(), 1);
}

#[tokio::test]
async fn test_concurrent_requests_without_coalescing_still_record_once() {
    let config = ServiceConfig {
        coalescing: false,
        ..Default::default()
    };
    let h = Harness::with_options(config, Duration::from_millis(50)).await;
    let alice = user("alice");
    let image = h.upload_png(&alice, 32, 32).await;
    let params = TransformParams {
        flip: Some(true),
        ..Default::default()
    };

    let handles: Vec<_> = (0..8)
        .map(|_| h.service.transform(&alice, &image.id, params.clone()))
        .collect();
    let outcomes: Vec<_> = join_all(handles)
        .await
        .into_iter()
        .map(Result::unwrap)
        .collect();

    let winner = &outcomes[0].transformation;
    assert!(outcomes.iter().all(|o| &o.transformation == winner));
    assert_eq!(h.ledger.transformation_count(), 1);
    assert!(h.pipeline_runs() >= 1);
    // Every call that ran the pipeline reports a miss, race losers included
    assert_eq!(
        outcomes.iter().filter(|o| !o.cache_hit).count(),
        h.pipeline_runs()
    );

    let listed = h.ledger.list_for_image(&image.id).await.unwrap();
    assert_eq!(listed, vec![winner.clone()]);
}

#[tokio::test]
async fn test_equivalent_params_share_a_transformation() {
    let h = Harness::new().await;
    let alice = user("alice");
    let image = h.upload_png(&alice, 16, 16).await;

    let plain = TransformParams {
        rotate: Some(180.0),
        ..Default::default()
    };
    let with_noise = TransformParams {
        rotate: Some(180.0),
        flip: Some(false),
        mirror: Some(false),
        filters: Some(FilterParams::default()),
        ..Default::default()
    };

    let a = h.service.transform(&alice, &image.id, plain).await.unwrap();
    let b = h
        .service
        .transform(&alice, &image.id, with_noise)
        .await
        .unwrap();
    assert_eq!(a.digest, b.digest);
    assert!(b.cache_hit);
    assert_eq!(h.pipeline_runs(), 1);
}

#[tokio::test]
async fn test_crop_outside_image_is_rejected() {
    let h = Harness::new().await;
    let alice = user("alice");
    let image = h.upload_png(&alice, 100, 100).await;

    let params = TransformParams {
        crop: Some(CropParams {
            x: 50,
            y: 50,
            width: 100,
            height: 10,
        }),
        ..Default::default()
    };
    let err = h
        .service
        .transform(&alice, &image.id, params)
        .await
        .unwrap_err();

    assert!(matches!(err, ServiceError::InvalidTransformParams { ref field, .. } if field == "crop"));
    assert_eq!(err.to_http_status(), 400);
    assert_eq!(h.ledger.transformation_count(), 0);
}

#[tokio::test]
async fn test_invalid_params_fail_before_any_lookup() {
    let h = Harness::new().await;
    let params = TransformParams {
        quality: Some(101),
        ..Default::default()
    };
    // The image does not exist, yet validation reports first
    let err = h
        .service
        .transform(&user("alice"), &ImageId::new(), params)
        .await
        .unwrap_err();
    assert!(matches!(err, ServiceError::InvalidTransformParams { ref field, .. } if field == "quality"));
}

#[tokio::test]
async fn test_other_users_image_is_not_owned() {
    let h = Harness::new().await;
    let image = h.upload_png(&user("alice"), 8, 8).await;

    let err = h
        .service
        .transform(&user("mallory"), &image.id, TransformParams::default())
        .await
        .unwrap_err();
    assert!(matches!(err, ServiceError::NotOwned(_)));
    assert_eq!(err.to_http_status(), 404);

    let err = h
        .service
        .get_image(&user("mallory"), &image.id)
        .await
        .unwrap_err();
    assert!(matches!(err, ServiceError::NotOwned(_)));
    assert_eq!(h.pipeline_runs(), 0);
}

#[tokio::test]
async fn test_unknown_image_is_not_found() {
    let h = Harness::new().await;
    let err = h
        .service
        .transform(&user("alice"), &ImageId::new(), TransformParams::default())
        .await
        .unwrap_err();
    assert!(matches!(err, ServiceError::ImageNotFound(_)));
    assert_eq!(err.to_http_status(), 404);
}

#[tokio::test]
async fn test_corrupt_original_maps_to_pipeline_error() {
    let h = Harness::new().await;
    let alice = user("alice");

    // Bypass upload validation to plant garbage bytes
    let key = "uploads/corrupt.png";
    h.put_raw(key, b"this is not a png").await;
    let image = Image::new(alice.clone(), "corrupt.png", key, "image/png", 17);
    h.ledger.insert_image(image.clone()).await.unwrap();

    let err = h
        .service
        .transform(&alice, &image.id, TransformParams::default())
        .await
        .unwrap_err();
    assert!(matches!(err, ServiceError::UnsupportedFormat(_)));
    assert_eq!(err.to_http_status(), 415);
    assert!(!err.is_retryable());
    assert_eq!(h.ledger.transformation_count(), 0);
}

#[tokio::test]
async fn test_missing_original_is_object_not_found() {
    let h = Harness::new().await;
    let alice = user("alice");
    let image = Image::new(alice.clone(), "gone.png", "uploads/gone.png", "image/png", 10);
    h.ledger.insert_image(image.clone()).await.unwrap();

    let err = h
        .service
        .transform(&alice, &image.id, TransformParams::default())
        .await
        .unwrap_err();
    assert!(matches!(err, ServiceError::ObjectNotFound(_)));
}

#[tokio::test]
async fn test_artifact_url_is_signed_for_object_key() {
    let h = Harness::new().await;
    let alice = user("alice");
    let image = h.upload_png(&alice, 20, 10).await;

    let outcome = h
        .service
        .transform(
            &alice,
            &image.id,
            TransformParams {
                format: Some(OutputFormat::Gif),
                ..Default::default()
            },
        )
        .await
        .unwrap();

    assert_eq!(outcome.content_type, "image/gif");
    assert_eq!(
        h.store.verify_url(&outcome.artifact_url),
        Some(outcome.object_key.clone())
    );
}

#[tokio::test]
async fn test_get_image_lists_ledger_records_missing_from_projection() {
    let h = Harness::new().await;
    let alice = user("alice");
    let image = h.upload_png(&alice, 16, 16).await;

    let via_service = h
        .service
        .transform(
            &alice,
            &image.id,
            TransformParams {
                rotate: Some(90.0),
                ..Default::default()
            },
        )
        .await
        .unwrap();

    // Recorded but never appended to the image projection
    let params = TransformParams {
        rotate: Some(270.0),
        ..Default::default()
    };
    let digest = CacheKey::derive(&params);
    let orphan = Transformation::new(image.id, "uploads/manual.png", params, digest, "image/png");
    h.ledger.record_if_absent(orphan.clone()).await.unwrap();

    let view = h.service.get_image(&alice, &image.id).await.unwrap();
    let ids: Vec<_> = view.image.transformations.iter().map(|t| t.id).collect();
    assert_eq!(view.image.transformations.len(), 2);
    assert!(ids.contains(&via_service.transformation.id));
    assert!(ids.contains(&orphan.id));
    assert_eq!(h.store.verify_url(&view.url), Some(image.object_key.clone()));
}

#[tokio::test]
async fn test_failed_leader_lets_follower_retry() {
    let h = Harness::new().await;
    let alice = user("alice");

    let key = "uploads/late.png";
    let image = Image::new(alice.clone(), "late.png", key, "image/png", 0);
    h.ledger.insert_image(image.clone()).await.unwrap();

    // Original missing: the first attempt fails and records nothing
    assert!(h
        .service
        .transform(&alice, &image.id, TransformParams::default())
        .await
        .is_err());

    // Once the bytes exist the same request succeeds
    h.put_raw(
        key,
        &super::harness::encode(&super::harness::gradient(4, 4), image::ImageFormat::Png),
    )
    .await;
    let outcome = h
        .service
        .transform(&alice, &image.id, TransformParams::default())
        .await
        .unwrap();
    assert!(!outcome.cache_hit);
    assert_eq!(h.ledger.transformation_count(), 1);
}

/// Ledger whose first missing lookup, once it has read the state, waits
/// until the test releases it
struct StallingLedger {
    inner: Arc<MemoryLedger>,
    armed: AtomicBool,
    stalled: Arc<Notify>,
    release: Arc<Notify>,
}

#[async_trait]
impl TransformationLedger for StallingLedger {
    async fn find(
        &self,
        image_id: &ImageId,
        digest: &CacheKey,
    ) -> Result<Option<Transformation>, LedgerError> {
        let found = self.inner.find(image_id, digest).await?;
        if found.is_none() && self.armed.swap(false, Ordering::SeqCst) {
            self.stalled.notify_one();
            self.release.notified().await;
        }
        Ok(found)
    }

    async fn record_if_absent(
        &self,
        transformation: Transformation,
    ) -> Result<RecordOutcome, LedgerError> {
        self.inner.record_if_absent(transformation).await
    }

    async fn append_to_image(
        &self,
        image_id: &ImageId,
        transformation: &Transformation,
    ) -> Result<(), LedgerError> {
        self.inner.append_to_image(image_id, transformation).await
    }

    async fn list_for_image(&self, image_id: &ImageId) -> Result<Vec<Transformation>, LedgerError> {
        self.inner.list_for_image(image_id).await
    }

    fn backend_name(&self) -> &'static str {
        "stalling"
    }
}

#[tokio::test]
async fn test_stale_miss_reuses_result_recorded_before_it_took_the_slot() {
    let stalled = Arc::new(Notify::new());
    let release = Arc::new(Notify::new());
    let (on_stall, on_release) = (stalled.clone(), release.clone());
    let h = Harness::with_backends(ServiceConfig::default(), Duration::ZERO, move |ledger| {
        MetadataBackends {
            ledger: Arc::new(StallingLedger {
                inner: ledger.clone(),
                armed: AtomicBool::new(true),
                stalled: on_stall,
                release: on_release,
            }),
            catalog: ledger,
        }
    })
    .await;
    let alice = user("alice");
    let image = h.upload_png(&alice, 16, 16).await;
    let params = TransformParams {
        mirror: Some(true),
        ..Default::default()
    };

    // `late` misses, then stalls until `prompt` has led, recorded and
    // released its slot
    let late = h.service.transform(&alice, &image.id, params.clone());
    let prompt = async {
        stalled.notified().await;
        let outcome = h.service.transform(&alice, &image.id, params.clone()).await;
        release.notify_one();
        outcome
    };
    let (late, prompt) = tokio::join!(late, prompt);
    let (late, prompt) = (late.unwrap(), prompt.unwrap());

    assert!(!prompt.cache_hit);
    assert!(late.cache_hit);
    assert_eq!(late.object_key, prompt.object_key);
    assert_eq!(late.transformation, prompt.transformation);
    assert_eq!(h.pipeline_runs(), 1);
    assert_eq!(h.ledger.transformation_count(), 1);
}

#[tokio::test]
async fn test_pipeline_timeout_stores_and_records_nothing() {
    let config = ServiceConfig {
        pipeline_timeout_secs: 1,
        ..Default::default()
    };
    let h = Harness::with_options(config, Duration::from_millis(1500)).await;
    let alice = user("alice");
    let image = h.upload_png(&alice, 16, 16).await;
    let params = TransformParams {
        flip: Some(true),
        ..Default::default()
    };

    let err = h
        .service
        .transform(&alice, &image.id, params.clone())
        .await
        .unwrap_err();
    assert!(matches!(err, ServiceError::ProcessingTimeout(1)), "got {:?}", err);
    assert_eq!(err.to_http_status(), 504);
    assert!(err.is_retryable());

    // The abandoned run finishes on the blocking pool; its output is dropped
    tokio::time::sleep(Duration::from_millis(800)).await;
    assert_eq!(h.pipeline_runs(), 1);
    assert_eq!(h.ledger.transformation_count(), 0);
    assert!(h.ledger.list_for_image(&image.id).await.unwrap().is_empty());
    let derived = h
        .store
        .derive_key(&image.object_key, &CacheKey::derive(&params));
    assert!(matches!(
        h.store.get(&derived).await,
        Err(StorageError::NotFound(_))
    ));
}

impl Harness {
    async fn store_bytes(&self, key: &str) -> Bytes {
        self.store.get(key).await.unwrap()
    }

    async fn put_raw(&self, key: &str, data: &[u8]) {
        self.store
            .put(key, Bytes::copy_from_slice(data), "application/octet-stream")
            .await
            .unwrap();
    }
}
