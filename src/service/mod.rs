//! Transformation orchestration.
//!
//! [`TransformationService::transform`] resolves a request to a stored
//! artifact, running the pipeline at most once per `(image, digest)`:
//!
//! ```text
//! KeyDerived -> LedgerChecked -> CacheHit  -> Resolved
//!                             -> CacheMiss -> SourceFetched -> Pipelined
//!                                          -> Stored -> Recorded -> Resolved
//! ```
//!
//! Any failure ends in `Failed(kind)`. The ledger's conditional insert is
//! the only correctness boundary; in-process coalescing merely saves work.

mod images;

use std::fmt;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;
use serde::Serialize;

use crate::cache_key::CacheKey;
use crate::coalescing::{CoalescingSlot, TransformCoalescer};
use crate::config::{Config, ServiceConfig};
use crate::constants::DEFAULT_URL_TTL_SECS;
use crate::error::ServiceError;
use crate::ledger::{build_metadata_backends, ImageCatalog, MetadataBackends, TransformationLedger};
use crate::metrics::TransformMetrics;
use crate::model::{Image, ImageId, ParamLimits, TransformParams, Transformation, UserId};
use crate::pipeline::{TransformPipeline, Transformer};
use crate::storage::{build_object_store, ObjectStore};

pub use images::{ImagePage, ImageView};

/// Progress of one `transform` call, logged on every transition
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransformStage {
    KeyDerived,
    LedgerChecked,
    CacheHit,
    CacheMiss,
    SourceFetched,
    Pipelined,
    Stored,
    Recorded,
    Resolved,
    Failed(&'static str),
}

impl fmt::Display for TransformStage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            TransformStage::KeyDerived => f.write_str("key_derived"),
            TransformStage::LedgerChecked => f.write_str("ledger_checked"),
            TransformStage::CacheHit => f.write_str("cache_hit"),
            TransformStage::CacheMiss => f.write_str("cache_miss"),
            TransformStage::SourceFetched => f.write_str("source_fetched"),
            TransformStage::Pipelined => f.write_str("pipelined"),
            TransformStage::Stored => f.write_str("stored"),
            TransformStage::Recorded => f.write_str("recorded"),
            TransformStage::Resolved => f.write_str("resolved"),
            TransformStage::Failed(kind) => write!(f, "failed({})", kind),
        }
    }
}

fn enter(stage: TransformStage, image_id: &ImageId, digest: &CacheKey) {
    tracing::debug!(
        stage = %stage,
        image_id = %image_id,
        digest = %digest.short(),
        "Transform stage"
    );
}

/// Result of [`TransformationService::transform`]
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct TransformOutcome {
    /// Time-limited URL of the derived image
    pub artifact_url: String,
    pub object_key: String,
    pub content_type: String,
    pub digest: CacheKey,
    /// True when no pipeline run was needed for this call
    pub cache_hit: bool,
    pub transformation: Transformation,
}

/// Entry point for uploads, lookups and transformations
pub struct TransformationService {
    store: Arc<dyn ObjectStore>,
    ledger: Arc<dyn TransformationLedger>,
    catalog: Arc<dyn ImageCatalog>,
    transformer: Arc<dyn Transformer>,
    coalescer: TransformCoalescer,
    config: ServiceConfig,
    limits: ParamLimits,
    url_ttl: Duration,
}

impl TransformationService {
    pub fn new(
        store: Arc<dyn ObjectStore>,
        backends: MetadataBackends,
        transformer: Arc<dyn Transformer>,
        config: ServiceConfig,
    ) -> Self {
        Self {
            store,
            ledger: backends.ledger,
            catalog: backends.catalog,
            transformer,
            coalescer: TransformCoalescer::new(),
            config,
            limits: ParamLimits::default(),
            url_ttl: Duration::from_secs(DEFAULT_URL_TTL_SECS),
        }
    }

    pub fn with_limits(mut self, limits: ParamLimits) -> Self {
        self.limits = limits;
        self
    }

    pub fn with_url_ttl(mut self, ttl: Duration) -> Self {
        self.url_ttl = ttl;
        self
    }

    /// Connect every configured backend and build the service
    pub async fn from_config(config: &Config) -> Result<Self, ServiceError> {
        let store = build_object_store(&config.storage).await?;
        let backends = build_metadata_backends(&config.ledger).await?;
        let pipeline = TransformPipeline::new(&config.pipeline)?;

        tracing::info!(
            storage = store.backend_name(),
            ledger = backends.ledger.backend_name(),
            coalescing = config.service.coalescing,
            "Transformation service ready"
        );

        Ok(Self::new(store, backends, Arc::new(pipeline), config.service.clone())
            .with_limits(config.pipeline.limits)
            .with_url_ttl(Duration::from_secs(config.storage.url_ttl_secs)))
    }

    /// Resolve `params` applied to `image_id` to a stored artifact,
    /// computing it if no identical request was recorded before
    pub async fn transform(
        &self,
        user_id: &UserId,
        image_id: &ImageId,
        params: TransformParams,
    ) -> Result<TransformOutcome, ServiceError> {
        let metrics = TransformMetrics::global();
        let _timer = metrics.start_request_timer("transform");

        let result = self.transform_inner(user_id, image_id, params).await;
        match &result {
            // Followers served by a leader count as hits
            Ok(outcome) if outcome.cache_hit => metrics.cache_hits.inc(),
            Ok(_) => metrics.cache_misses.inc(),
            Err(e) => {
                metrics.record_error(e.kind());
                tracing::warn!(
                    stage = %TransformStage::Failed(e.kind()),
                    image_id = %image_id,
                    error = %e,
                    "Transformation failed"
                );
            }
        }
        result
    }

    async fn transform_inner(
        &self,
        user_id: &UserId,
        image_id: &ImageId,
        params: TransformParams,
    ) -> Result<TransformOutcome, ServiceError> {
        params.validate(&self.limits)?;
        let digest = CacheKey::derive(&params);
        enter(TransformStage::KeyDerived, image_id, &digest);

        let image = self.load_owned_image(user_id, image_id).await?;

        let existing = self.find(image_id, &digest).await?;
        enter(TransformStage::LedgerChecked, image_id, &digest);
        if let Some(transformation) = existing {
            return self.serve_recorded(transformation).await;
        }

        let _slot = if self.config.coalescing {
            let slot = self.coalescer.acquire(image_id, &digest).await;
            // A leader may have recorded the result between our first lookup
            // and acquiring the slot, whether we waited on it or not
            if let Some(transformation) = self.find(image_id, &digest).await? {
                tracing::debug!(
                    image_id = %image_id,
                    digest = %digest.short(),
                    leader = slot.is_leader(),
                    "Coalesced onto concurrent transformation"
                );
                return self.serve_recorded(transformation).await;
            }
            match slot {
                // The leader failed; compute without a slot
                CoalescingSlot::Follower => None,
                leader => Some(leader),
            }
        } else {
            None
        };

        enter(TransformStage::CacheMiss, image_id, &digest);

        let transformation = self.materialize(&image, params, digest).await?;
        self.resolve(transformation, false).await
    }

    async fn serve_recorded(
        &self,
        transformation: Transformation,
    ) -> Result<TransformOutcome, ServiceError> {
        enter(
            TransformStage::CacheHit,
            &transformation.image_id,
            &transformation.digest,
        );
        self.resolve(transformation, true).await
    }

    /// Run the pipeline, store the result and record it. Returns the record
    /// now in the ledger, which is the winner's when we lost a race.
    async fn materialize(
        &self,
        image: &Image,
        params: TransformParams,
        digest: CacheKey,
    ) -> Result<Transformation, ServiceError> {
        let metrics = TransformMetrics::global();

        let source = self
            .with_storage_timeout(self.store.get(&image.object_key))
            .await?;
        enter(TransformStage::SourceFetched, &image.id, &digest);

        let encoded = self.run_pipeline(source, image, &params).await?;
        enter(TransformStage::Pipelined, &image.id, &digest);

        let object_key = self.store.derive_key(&image.object_key, &digest);
        let content_type = encoded.content_type();
        self.with_storage_timeout(
            self.store
                .put(&object_key, Bytes::from(encoded.data), content_type),
        )
        .await?;
        enter(TransformStage::Stored, &image.id, &digest);

        let candidate = Transformation::new(image.id, object_key, params, digest, content_type);
        let outcome = self
            .with_metadata_timeout(self.ledger.record_if_absent(candidate.clone()))
            .await?;
        enter(TransformStage::Recorded, &image.id, &candidate.digest);

        if outcome.created {
            if let Err(e) = self
                .with_metadata_timeout(self.ledger.append_to_image(&image.id, &candidate))
                .await
            {
                tracing::warn!(
                    image_id = %image.id,
                    digest = %candidate.digest.short(),
                    error = %e,
                    "Failed to update image projection; ledger stays authoritative"
                );
            }
            tracing::info!(
                image_id = %image.id,
                digest = %candidate.digest.short(),
                object_key = %candidate.object_key,
                "Recorded new transformation"
            );
        } else {
            metrics.race_losses.inc();
            self.discard_loser(&candidate, &outcome.transformation).await;
        }

        Ok(outcome.transformation)
    }

    /// A concurrent writer recorded first. Our object is only garbage when
    /// it does not share the winner's key.
    async fn discard_loser(&self, ours: &Transformation, winner: &Transformation) {
        tracing::info!(
            image_id = %ours.image_id,
            digest = %ours.digest.short(),
            winner = %winner.id,
            "Lost record race; using existing transformation"
        );
        if ours.object_key == winner.object_key {
            return;
        }
        match self
            .with_storage_timeout(self.store.delete(&ours.object_key))
            .await
        {
            Ok(()) | Err(ServiceError::ObjectNotFound(_)) => {
                TransformMetrics::global().orphan_deletions.inc();
            }
            Err(e) => {
                tracing::warn!(
                    object_key = %ours.object_key,
                    error = %e,
                    "Failed to delete unrecorded object"
                );
            }
        }
    }

    async fn run_pipeline(
        &self,
        source: Bytes,
        image: &Image,
        params: &TransformParams,
    ) -> Result<crate::pipeline::EncodedImage, ServiceError> {
        let metrics = TransformMetrics::global();
        metrics.pipeline_runs.inc();

        let format_label = params
            .format
            .or_else(|| image.source_format())
            .map(|f| f.as_str())
            .unwrap_or("auto");
        let _timer = metrics.start_pipeline_timer(format_label);

        let transformer = Arc::clone(&self.transformer);
        let hint = image.source_format();
        let params = params.clone();
        let task =
            tokio::task::spawn_blocking(move || transformer.apply(&source, hint, &params));

        let limit = self.config.pipeline_timeout();
        match tokio::time::timeout(limit, task).await {
            Ok(Ok(result)) => Ok(result?),
            Ok(Err(join_error)) => Err(ServiceError::EncodeFailure(format!(
                "pipeline task aborted: {}",
                join_error
            ))),
            Err(_) => Err(ServiceError::ProcessingTimeout(limit.as_secs())),
        }
    }

    async fn resolve(
        &self,
        transformation: Transformation,
        cache_hit: bool,
    ) -> Result<TransformOutcome, ServiceError> {
        let artifact_url = self.url_for(&transformation.object_key).await?;
        enter(
            TransformStage::Resolved,
            &transformation.image_id,
            &transformation.digest,
        );
        Ok(TransformOutcome {
            artifact_url,
            object_key: transformation.object_key.clone(),
            content_type: transformation.content_type.clone(),
            digest: transformation.digest.clone(),
            cache_hit,
            transformation,
        })
    }

    async fn find(
        &self,
        image_id: &ImageId,
        digest: &CacheKey,
    ) -> Result<Option<Transformation>, ServiceError> {
        self.with_metadata_timeout(self.ledger.find(image_id, digest))
            .await
    }

    async fn url_for(&self, key: &str) -> Result<String, ServiceError> {
        self.with_storage_timeout(self.store.url_for(key, self.url_ttl))
            .await
    }

    /// Fetch an image, hiding other users' images behind `NotOwned`
    async fn load_owned_image(
        &self,
        user_id: &UserId,
        image_id: &ImageId,
    ) -> Result<Image, ServiceError> {
        let image = self
            .with_metadata_timeout(self.catalog.get_image(image_id))
            .await?
            .ok_or_else(|| ServiceError::ImageNotFound(image_id.to_string()))?;
        if !image.is_owned_by(user_id) {
            return Err(ServiceError::NotOwned(image_id.to_string()));
        }
        Ok(image)
    }

    async fn with_metadata_timeout<T, E>(
        &self,
        fut: impl Future<Output = Result<T, E>>,
    ) -> Result<T, ServiceError>
    where
        ServiceError: From<E>,
    {
        with_timeout(self.config.metadata_timeout(), "metadata", fut).await
    }

    async fn with_storage_timeout<T, E>(
        &self,
        fut: impl Future<Output = Result<T, E>>,
    ) -> Result<T, ServiceError>
    where
        ServiceError: From<E>,
    {
        with_timeout(self.config.storage_timeout(), "storage", fut).await
    }
}

/// Bound a backend call. Timeouts surface as `StorageUnavailable` so callers
/// can retry.
async fn with_timeout<T, E>(
    limit: Duration,
    what: &str,
    fut: impl Future<Output = Result<T, E>>,
) -> Result<T, ServiceError>
where
    ServiceError: From<E>,
{
    match tokio::time::timeout(limit, fut).await {
        Ok(result) => result.map_err(ServiceError::from),
        Err(_) => Err(ServiceError::StorageUnavailable(format!(
            "{} call timed out after {:?}",
            what, limit
        ))),
    }
}
