// Structured logging via tracing
//
// RUST_LOG takes precedence over the configured level.

use tracing_subscriber::EnvFilter;

use crate::config::{LogFormat, LoggingConfig};

#[derive(Debug, thiserror::Error)]
pub enum LoggingError {
    #[error("invalid log filter '{0}': {1}")]
    InvalidFilter(String, String),

    #[error("failed to install subscriber: {0}")]
    Init(String),
}

/// Build the filter from RUST_LOG, falling back to `level`
pub fn build_filter(level: &str) -> Result<EnvFilter, LoggingError> {
    match EnvFilter::try_from_default_env() {
        Ok(filter) => Ok(filter),
        Err(_) => EnvFilter::try_new(level)
            .map_err(|e| LoggingError::InvalidFilter(level.to_string(), e.to_string())),
    }
}

/// Install the global tracing subscriber.
///
/// JSON output goes to stdout for log aggregation. The pretty format is
/// meant for terminals. Fails if a subscriber is already installed.
///
/// ```no_run
/// use chayachitr::config::LoggingConfig;
/// use chayachitr::logging::init_subscriber;
///
/// init_subscriber(&LoggingConfig::default()).expect("Failed to initialize logging");
/// tracing::info!("Application started");
/// ```
pub fn init_subscriber(config: &LoggingConfig) -> Result<(), LoggingError> {
    let filter = build_filter(&config.level)?;
    let builder = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(true);

    let result = match config.format {
        LogFormat::Json => builder.json().with_current_span(false).try_init(),
        LogFormat::Pretty => builder.pretty().try_init(),
    };
    result.map_err(|e| LoggingError::Init(e.to_string()))
}
