use tracing_subscriber::EnvFilter;

use crate::error::{AppError, AppResult};

/// Default filter when `RUST_LOG` is not provided.
pub const DEFAULT_LOG_LEVEL: &str = "info";

/// Install the global tracing subscriber.
///
/// # Errors
///
/// Returns an error if another subscriber was already installed.
pub fn init_logging() -> AppResult<()> {
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(DEFAULT_LOG_LEVEL));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .try_init()
        .map_err(|error| AppError::Logging(error.to_string()))
}
