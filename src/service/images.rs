//! Upload, lookup and listing of original images.

use bytes::Bytes;
use futures::future::try_join_all;
use serde::Serialize;
use uuid::Uuid;

use super::TransformationService;
use crate::constants::{ALLOWED_UPLOAD_TYPES, DEFAULT_PAGE_LIMIT, MAX_PAGE_LIMIT, UPLOAD_KEY_PREFIX};
use crate::error::ServiceError;
use crate::ledger::merge_transformations;
use crate::metrics::TransformMetrics;
use crate::model::{Image, ImageId, OutputFormat, UserId};
use crate::pipeline::detect_format;

/// An image together with a fresh URL for its original
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ImageView {
    #[serde(flatten)]
    pub image: Image,
    pub url: String,
}

/// One page of a user's images, newest first
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ImagePage {
    pub images: Vec<ImageView>,
    pub page: u32,
    pub limit: u32,
    pub total_count: u64,
    pub total_pages: u64,
}

/// Lowercased media type without parameters
fn normalize_content_type(content_type: &str) -> String {
    content_type
        .split(';')
        .next()
        .unwrap_or_default()
        .trim()
        .to_ascii_lowercase()
}

/// Lowercased extension of the last path segment, without the dot
fn file_extension(filename: &str) -> Option<String> {
    let name = filename.rsplit(['/', '\\']).next().unwrap_or(filename);
    match name.rfind('.') {
        Some(pos) if pos > 0 && pos + 1 < name.len() => Some(name[pos + 1..].to_ascii_lowercase()),
        _ => None,
    }
}

impl TransformationService {
    /// Store a new original and register it for `user_id`.
    ///
    /// The declared content type, the filename's extension and the bytes
    /// themselves must all agree on one supported format.
    pub async fn upload(
        &self,
        user_id: &UserId,
        filename: &str,
        content_type: &str,
        data: Bytes,
    ) -> Result<ImageView, ServiceError> {
        let metrics = TransformMetrics::global();
        let _timer = metrics.start_request_timer("upload");

        let result = self.upload_inner(user_id, filename, content_type, data).await;
        if let Err(e) = &result {
            metrics.record_error(e.kind());
            tracing::warn!(user_id = %user_id, filename = %filename, error = %e, "Upload rejected");
        }
        result
    }

    async fn upload_inner(
        &self,
        user_id: &UserId,
        filename: &str,
        content_type: &str,
        data: Bytes,
    ) -> Result<ImageView, ServiceError> {
        let format = self.validate_upload(filename, content_type, &data)?;

        let extension = file_extension(filename).unwrap_or_else(|| format.extension().to_string());
        let object_key = format!(
            "{}{}.{}",
            UPLOAD_KEY_PREFIX,
            Uuid::new_v4().simple(),
            extension
        );
        let size = data.len() as u64;

        self.with_storage_timeout(self.store.put(&object_key, data, format.content_type()))
            .await?;

        let image = Image::new(
            user_id.clone(),
            filename,
            object_key.clone(),
            format.content_type(),
            size,
        );
        if let Err(e) = self
            .with_metadata_timeout(self.catalog.insert_image(image.clone()))
            .await
        {
            // Unregistered originals are unreachable; drop the bytes
            if let Err(delete_err) = self.store.delete(&object_key).await {
                tracing::warn!(object_key = %object_key, error = %delete_err, "Failed to delete unregistered upload");
            }
            return Err(e);
        }

        TransformMetrics::global().uploads.inc();
        tracing::info!(
            image_id = %image.id,
            user_id = %user_id,
            object_key = %object_key,
            size = size,
            "Image uploaded"
        );

        let url = self.url_for(&image.object_key).await?;
        Ok(ImageView { image, url })
    }

    fn validate_upload(
        &self,
        filename: &str,
        content_type: &str,
        data: &[u8],
    ) -> Result<OutputFormat, ServiceError> {
        if data.is_empty() {
            return Err(ServiceError::InvalidUpload("file is empty".to_string()));
        }
        if data.len() as u64 > self.config.max_upload_bytes {
            return Err(ServiceError::InvalidUpload(format!(
                "file is {} bytes, limit is {} bytes",
                data.len(),
                self.config.max_upload_bytes
            )));
        }

        let media_type = normalize_content_type(content_type);
        if !ALLOWED_UPLOAD_TYPES.contains(&media_type.as_str()) {
            return Err(ServiceError::InvalidUpload(format!(
                "content type '{}' is not allowed",
                content_type
            )));
        }
        let declared = OutputFormat::from_content_type(&media_type).ok_or_else(|| {
            ServiceError::InvalidUpload(format!("content type '{}' is not allowed", content_type))
        })?;

        let extension = file_extension(filename).ok_or_else(|| {
            ServiceError::InvalidUpload(format!("filename '{}' has no extension", filename))
        })?;
        if OutputFormat::from_extension(&extension) != Some(declared) {
            return Err(ServiceError::InvalidUpload(format!(
                "extension '.{}' does not match content type '{}'",
                extension, media_type
            )));
        }

        match detect_format(data) {
            Some(detected) if detected == declared => Ok(declared),
            Some(detected) => Err(ServiceError::InvalidUpload(format!(
                "content is {} but was declared as {}",
                detected, declared
            ))),
            None => Err(ServiceError::InvalidUpload(
                "content is not a supported image".to_string(),
            )),
        }
    }

    /// Fetch one of `user_id`'s images with a fresh URL. The transformation
    /// list is rebuilt from the ledger, so entries missing from the
    /// projection still show up.
    pub async fn get_image(
        &self,
        user_id: &UserId,
        image_id: &ImageId,
    ) -> Result<ImageView, ServiceError> {
        let _timer = TransformMetrics::global().start_request_timer("get_image");

        let mut image = self.load_owned_image(user_id, image_id).await?;
        let recorded = self
            .with_metadata_timeout(self.ledger.list_for_image(image_id))
            .await?;
        let projected = std::mem::take(&mut image.transformations);
        image.transformations = merge_transformations(recorded, projected);

        let url = self.url_for(&image.object_key).await?;
        Ok(ImageView { image, url })
    }

    /// Page through `user_id`'s images, newest first.
    ///
    /// `page` starts at 1 (default 1); `limit` is 1..=100 (default 10).
    pub async fn list_images(
        &self,
        user_id: &UserId,
        page: Option<u32>,
        limit: Option<u32>,
    ) -> Result<ImagePage, ServiceError> {
        let _timer = TransformMetrics::global().start_request_timer("list_images");

        let page = page.unwrap_or(1);
        let limit = limit.unwrap_or(DEFAULT_PAGE_LIMIT);
        if page == 0 {
            return Err(ServiceError::invalid_params("page", "must be at least 1"));
        }
        if limit == 0 || limit > MAX_PAGE_LIMIT {
            return Err(ServiceError::invalid_params(
                "limit",
                format!("must be between 1 and {}", MAX_PAGE_LIMIT),
            ));
        }

        let offset = (page as usize - 1) * limit as usize;
        let (images, total_count) = self
            .with_metadata_timeout(self.catalog.list_images(user_id, offset, limit as usize))
            .await?;

        let urls = try_join_all(images.iter().map(|image| self.url_for(&image.object_key))).await?;
        let views = images
            .into_iter()
            .zip(urls)
            .map(|(image, url)| ImageView { image, url })
            .collect();

        Ok(ImagePage {
            images: views,
            page,
            limit,
            total_count,
            total_pages: total_count.div_ceil(limit as u64),
        })
    }
}
