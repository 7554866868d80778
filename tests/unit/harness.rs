// Shared fixtures: a service over a temporary filesystem store and the
// in-memory ledger, with a transformer that counts its runs.

use std::io::Cursor;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;
use image::{ImageFormat, Rgba, RgbaImage};
use tempfile::TempDir;

use chayachitr::config::{FilesystemStoreConfig, ServiceConfig};
use chayachitr::ledger::{MemoryLedger, MetadataBackends};
use chayachitr::model::{Image, OutputFormat, TransformParams, UserId};
use chayachitr::pipeline::{EncodedImage, PipelineError, TransformPipeline, Transformer};
use chayachitr::storage::FilesystemStore;
use chayachitr::TransformationService;

pub const SIGNING_KEY: &str = "test-signing-key-0123456789";

/// Wraps the real pipeline and counts invocations
pub struct CountingTransformer {
    inner: TransformPipeline,
    runs: Arc<AtomicUsize>,
    delay: Duration,
}

impl Transformer for CountingTransformer {
    fn apply(
        &self,
        source: &[u8],
        source_format: Option<OutputFormat>,
        params: &TransformParams,
    ) -> Result<EncodedImage, PipelineError> {
        self.runs.fetch_add(1, Ordering::SeqCst);
        if !self.delay.is_zero() {
            std::thread::sleep(self.delay);
        }
        self.inner.apply(source, source_format, params)
    }
}

pub struct Harness {
    pub service: TransformationService,
    pub store: Arc<FilesystemStore>,
    pub ledger: Arc<MemoryLedger>,
    runs: Arc<AtomicUsize>,
    _dir: TempDir,
}

impl Harness {
    pub async fn new() -> Self {
        Self::with_options(ServiceConfig::default(), Duration::ZERO).await
    }

    /// `delay` holds every pipeline run open, widening race windows
    pub async fn with_options(config: ServiceConfig, delay: Duration) -> Self {
        Self::with_backends(config, delay, |ledger| MetadataBackends::from_backend(ledger)).await
    }

    /// Like [`Harness::with_options`], letting the test wrap the ledger
    /// the service talks to
    pub async fn with_backends<F>(config: ServiceConfig, delay: Duration, backends: F) -> Self
    where
        F: FnOnce(Arc<MemoryLedger>) -> MetadataBackends,
    {
        let dir = TempDir::new().unwrap();
        let store = Arc::new(
            FilesystemStore::open(&FilesystemStoreConfig {
                root: dir.path().join("blobs"),
                public_base_url: "https://blobs.test".to_string(),
                signing_key: SIGNING_KEY.to_string(),
                quota_bytes: None,
            })
            .await
            .unwrap(),
        );
        let ledger = Arc::new(MemoryLedger::new());
        let runs = Arc::new(AtomicUsize::new(0));
        let transformer = Arc::new(CountingTransformer {
            inner: TransformPipeline::default(),
            runs: runs.clone(),
            delay,
        });

        let service = TransformationService::new(
            store.clone(),
            backends(ledger.clone()),
            transformer,
            config,
        );

        Self {
            service,
            store,
            ledger,
            runs,
            _dir: dir,
        }
    }

    pub fn pipeline_runs(&self) -> usize {
        self.runs.load(Ordering::SeqCst)
    }

    pub async fn upload_jpeg(&self, user: &UserId, width: u32, height: u32) -> Image {
        self.service
            .upload(
                user,
                "photo.jpg",
                "image/jpeg",
                Bytes::from(encode(&gradient(width, height), ImageFormat::Jpeg)),
            )
            .await
            .unwrap()
            .image
    }

    pub async fn upload_png(&self, user: &UserId, width: u32, height: u32) -> Image {
        self.service
            .upload(
                user,
                "picture.png",
                "image/png",
                Bytes::from(encode(&gradient(width, height), ImageFormat::Png)),
            )
            .await
            .unwrap()
            .image
    }
}

pub fn gradient(width: u32, height: u32) -> RgbaImage {
    RgbaImage::from_fn(width, height, |x, y| {
        Rgba([(x % 256) as u8, (y % 256) as u8, ((x * 3 + y) % 256) as u8, 255])
    })
}

pub fn encode(image: &RgbaImage, format: ImageFormat) -> Vec<u8> {
    let mut out = Cursor::new(Vec::new());
    let dynamic = image::DynamicImage::ImageRgba8(image.clone());
    match format {
        // JPEG has no alpha channel
        ImageFormat::Jpeg => dynamic.to_rgb8().write_to(&mut out, format).unwrap(),
        _ => dynamic.write_to(&mut out, format).unwrap(),
    }
    out.into_inner()
}

pub fn user(name: &str) -> UserId {
    UserId::new(name)
}
