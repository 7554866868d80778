// Constants module - centralized default values for configuration

// =============================================================================
// Service timeouts
// =============================================================================

/// Default timeout for catalog and ledger calls in seconds
pub const DEFAULT_METADATA_TIMEOUT_SECS: u64 = 10;

/// Default timeout for object store get/put in seconds
pub const DEFAULT_STORAGE_TIMEOUT_SECS: u64 = 30;

/// Default timeout for one pipeline run in seconds
pub const DEFAULT_PIPELINE_TIMEOUT_SECS: u64 = 120;

// =============================================================================
// Upload defaults
// =============================================================================

/// Default maximum upload size (10 MB)
pub const DEFAULT_MAX_UPLOAD_BYTES: u64 = 10 * 1024 * 1024;

/// Default lifetime of URLs handed back to callers (24 hours)
pub const DEFAULT_URL_TTL_SECS: u64 = 24 * 60 * 60;

/// Prefix under which originals are stored
pub const UPLOAD_KEY_PREFIX: &str = "uploads/";

/// Content types accepted on upload
pub const ALLOWED_UPLOAD_TYPES: &[&str] = &["image/jpeg", "image/png", "image/gif", "image/webp"];

// =============================================================================
// Pipeline defaults
// =============================================================================

/// Default largest decoded image (100 megapixels)
pub const DEFAULT_MAX_PIXELS: u64 = 100_000_000;

/// Quality used for lossy encodings when the request omits it
pub const DEFAULT_QUALITY: u8 = 80;

// =============================================================================
// Listing defaults
// =============================================================================

/// Default page size for image listings
pub const DEFAULT_PAGE_LIMIT: u32 = 10;

/// Largest accepted page size for image listings
pub const MAX_PAGE_LIMIT: u32 = 100;
