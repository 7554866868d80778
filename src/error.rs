// Error types module

use thiserror::Error;

use crate::ledger::LedgerError;
use crate::model::ParamsError;
use crate::pipeline::PipelineError;
use crate::storage::StorageError;

/// Errors surfaced by [`crate::service::TransformationService`]
///
/// Every module error folds into one of these kinds. The HTTP mapping lives
/// here so any front end renders the same status for the same failure.
#[derive(Debug, Clone, Error, PartialEq)]
pub enum ServiceError {
    #[error("invalid transformation parameter '{field}': {reason}")]
    InvalidTransformParams { field: String, reason: String },

    #[error("image not found: {0}")]
    ImageNotFound(String),

    /// The image exists but belongs to another user
    #[error("image not found: {0}")]
    NotOwned(String),

    #[error("failed to decode source image: {0}")]
    DecodeFailure(String),

    #[error("failed to encode output image: {0}")]
    EncodeFailure(String),

    #[error("unsupported format: {0}")]
    UnsupportedFormat(String),

    #[error("processing timed out after {0} seconds")]
    ProcessingTimeout(u64),

    #[error("object storage unavailable: {0}")]
    StorageUnavailable(String),

    #[error("object storage quota exceeded: {0}")]
    StorageQuotaExceeded(String),

    #[error("stored object not found: {0}")]
    ObjectNotFound(String),

    #[error("invalid upload: {0}")]
    InvalidUpload(String),

    #[error("transformation ledger unavailable: {0}")]
    LedgerUnavailable(String),
}

impl ServiceError {
    pub fn invalid_params(field: impl Into<String>, reason: impl Into<String>) -> Self {
        ServiceError::InvalidTransformParams {
            field: field.into(),
            reason: reason.into(),
        }
    }

    pub fn to_http_status(&self) -> u16 {
        match self {
            ServiceError::InvalidTransformParams { .. } => 400,
            ServiceError::ImageNotFound(_) => 404,
            ServiceError::NotOwned(_) => 404,
            ServiceError::DecodeFailure(_) => 422,
            ServiceError::EncodeFailure(_) => 500,
            ServiceError::UnsupportedFormat(_) => 415,
            ServiceError::ProcessingTimeout(_) => 504,
            ServiceError::StorageUnavailable(_) => 503,
            ServiceError::StorageQuotaExceeded(_) => 507,
            ServiceError::ObjectNotFound(_) => 404,
            ServiceError::InvalidUpload(_) => 400,
            ServiceError::LedgerUnavailable(_) => 503,
        }
    }

    /// Transient failures a caller may retry unchanged
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            ServiceError::StorageUnavailable(_)
                | ServiceError::LedgerUnavailable(_)
                | ServiceError::ProcessingTimeout(_)
        )
    }

    /// Stable label for logs and metrics
    pub fn kind(&self) -> &'static str {
        match self {
            ServiceError::InvalidTransformParams { .. } => "invalid_transform_params",
            ServiceError::ImageNotFound(_) => "image_not_found",
            ServiceError::NotOwned(_) => "not_owned",
            ServiceError::DecodeFailure(_) => "decode_failure",
            ServiceError::EncodeFailure(_) => "encode_failure",
            ServiceError::UnsupportedFormat(_) => "unsupported_format",
            ServiceError::ProcessingTimeout(_) => "processing_timeout",
            ServiceError::StorageUnavailable(_) => "storage_unavailable",
            ServiceError::StorageQuotaExceeded(_) => "storage_quota_exceeded",
            ServiceError::ObjectNotFound(_) => "object_not_found",
            ServiceError::InvalidUpload(_) => "invalid_upload",
            ServiceError::LedgerUnavailable(_) => "ledger_unavailable",
        }
    }
}

impl From<ParamsError> for ServiceError {
    fn from(err: ParamsError) -> Self {
        match err {
            ParamsError::Invalid { field, reason } => ServiceError::invalid_params(field, reason),
            ParamsError::Malformed(reason) => ServiceError::invalid_params("request", reason),
        }
    }
}

impl From<StorageError> for ServiceError {
    fn from(err: StorageError) -> Self {
        match err {
            StorageError::NotFound(key) => ServiceError::ObjectNotFound(key),
            StorageError::QuotaExceeded(msg) => ServiceError::StorageQuotaExceeded(msg),
            StorageError::Unavailable(msg) => ServiceError::StorageUnavailable(msg),
            StorageError::InvalidKey(key) => {
                ServiceError::StorageUnavailable(format!("rejected object key: {}", key))
            }
        }
    }
}

impl From<LedgerError> for ServiceError {
    fn from(err: LedgerError) -> Self {
        ServiceError::LedgerUnavailable(err.to_string())
    }
}

impl From<PipelineError> for ServiceError {
    fn from(err: PipelineError) -> Self {
        match err {
            PipelineError::InvalidParams { field, reason } => {
                ServiceError::InvalidTransformParams { field, reason }
            }
            PipelineError::Decode(msg) => ServiceError::DecodeFailure(msg),
            PipelineError::Encode(msg) => ServiceError::EncodeFailure(msg),
            PipelineError::UnsupportedFormat(msg) => ServiceError::UnsupportedFormat(msg),
        }
    }
}
