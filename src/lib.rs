// Chayachitr image transformation cache

pub mod cache_key;
pub mod coalescing;
pub mod config;
pub mod constants;
pub mod error;
pub mod ledger;
pub mod logging;
pub mod metrics;
pub mod model;
pub mod pipeline;
pub mod service;
pub mod storage;

pub use cache_key::CacheKey;
pub use error::ServiceError;
pub use model::{Image, ImageId, TransformParams, Transformation, TransformationId, UserId};
pub use service::{TransformOutcome, TransformationService};
