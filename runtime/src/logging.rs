//! `tracing` subscriber setup.
//!
//! `RUST_LOG` takes precedence; otherwise the filter passed in (usually
//! [`AppConfig::log_filter`](event_router_core::AppConfig)) is used.

use event_router_core::AppConfig;
use thiserror::Error;
use tracing_subscriber::filter::ParseError;
use tracing_subscriber::util::TryInitError;
use tracing_subscriber::{EnvFilter, layer::SubscriberExt, util::SubscriberInitExt};

/// Errors from [`init`].
#[derive(Error, Debug)]
pub enum LoggingError {
    /// The fallback filter directive is malformed
    #[error("Invalid log filter: {0}")]
    Filter(#[from] ParseError),

    /// A global subscriber is already installed
    #[error("Failed to install subscriber: {0}")]
    Init(#[from] TryInitError),
}

/// Build the filter: `RUST_LOG` if set and valid, else `default_filter`.
///
/// # Errors
///
/// Returns [`LoggingError::Filter`] if `default_filter` is needed and
/// cannot be parsed.
pub fn filter(default_filter: &str) -> Result<EnvFilter, LoggingError> {
    match EnvFilter::try_from_default_env() {
        Ok(filter) => Ok(filter),
        Err(_) => Ok(EnvFilter::try_new(default_filter)?),
    }
}

/// Install a global fmt subscriber.
///
/// # Errors
///
/// Returns [`LoggingError`] if the filter is invalid or a subscriber is
/// already installed.
pub fn init(default_filter: &str) -> Result<(), LoggingError> {
    tracing_subscriber::registry()
        .with(filter(default_filter)?)
        .with(tracing_subscriber::fmt::layer().with_target(false))
        .try_init()?;
    Ok(())
}

/// [`init`] with the configuration's `log_filter`.
///
/// # Errors
///
/// Same as [`init`].
pub fn init_from_config(config: &AppConfig) -> Result<(), LoggingError> {
    init(&config.log_filter)
}
