//! Process-local ledger.
//!
//! Atomicity comes from holding the write lock for the whole
//! check-and-insert. Nothing awaits while a lock is held. Records do not
//! survive a restart and are not shared between processes.

use std::collections::HashMap;

use async_trait::async_trait;
use parking_lot::RwLock;

use super::{merge_transformations, ImageCatalog, LedgerError, RecordOutcome, TransformationLedger};
use crate::cache_key::CacheKey;
use crate::model::{Image, ImageId, Transformation, UserId};

#[derive(Default)]
struct State {
    transformations: HashMap<(ImageId, CacheKey), Transformation>,
    images: HashMap<ImageId, Image>,
}

#[derive(Default)]
pub struct MemoryLedger {
    state: RwLock<State>,
}

impl MemoryLedger {
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of recorded transformations across all images
    pub fn transformation_count(&self) -> usize {
        self.state.read().transformations.len()
    }
}

#[async_trait]
impl TransformationLedger for MemoryLedger {
    async fn find(
        &self,
        image_id: &ImageId,
        digest: &CacheKey,
    ) -> Result<Option<Transformation>, LedgerError> {
        let state = self.state.read();
        Ok(state
            .transformations
            .get(&(*image_id, digest.clone()))
            .cloned())
    }

    async fn record_if_absent(
        &self,
        transformation: Transformation,
    ) -> Result<RecordOutcome, LedgerError> {
        let mut state = self.state.write();
        let key = (transformation.image_id, transformation.digest.clone());
        if let Some(existing) = state.transformations.get(&key) {
            return Ok(RecordOutcome {
                transformation: existing.clone(),
                created: false,
            });
        }
        state.transformations.insert(key, transformation.clone());
        Ok(RecordOutcome {
            transformation,
            created: true,
        })
    }

    async fn append_to_image(
        &self,
        image_id: &ImageId,
        transformation: &Transformation,
    ) -> Result<(), LedgerError> {
        let mut state = self.state.write();
        if let Some(image) = state.images.get_mut(image_id) {
            image.transformations.push(transformation.clone());
            image.updated_at = chrono::Utc::now();
        }
        Ok(())
    }

    async fn list_for_image(&self, image_id: &ImageId) -> Result<Vec<Transformation>, LedgerError> {
        let state = self.state.read();
        let recorded = state
            .transformations
            .values()
            .filter(|t| &t.image_id == image_id)
            .cloned()
            .collect();
        Ok(merge_transformations(recorded, Vec::new()))
    }

    fn backend_name(&self) -> &'static str {
        "memory"
    }
}

#[async_trait]
impl ImageCatalog for MemoryLedger {
    async fn insert_image(&self, image: Image) -> Result<(), LedgerError> {
        self.state.write().images.insert(image.id, image);
        Ok(())
    }

    async fn get_image(&self, image_id: &ImageId) -> Result<Option<Image>, LedgerError> {
        Ok(self.state.read().images.get(image_id).cloned())
    }

    async fn list_images(
        &self,
        user_id: &UserId,
        offset: usize,
        limit: usize,
    ) -> Result<(Vec<Image>, u64), LedgerError> {
        let state = self.state.read();
        let mut owned: Vec<&Image> = state
            .images
            .values()
            .filter(|image| &image.user_id == user_id)
            .collect();
        owned.sort_by(|a, b| b.created_at.cmp(&a.created_at).then(b.id.cmp(&a.id)));

        let total = owned.len() as u64;
        let page = owned.into_iter().skip(offset).take(limit).cloned().collect();
        Ok((page, total))
    }
}
