use seedpace_client::ClientError;
use seedpace_config::ConfigError;

/// Top-level application failures.
#[derive(Debug, thiserror::Error)]
pub enum AppError {
    /// Configuration could not be loaded or validated.
    #[error("configuration error: {0}")]
    Config(#[from] ConfigError),
    /// A client binding could not be constructed.
    #[error("client setup error: {0}")]
    Client(#[from] ClientError),
    /// Engine construction or startup failed.
    #[error("engine error: {0}")]
    Engine(#[from] anyhow::Error),
    /// The tracing subscriber could not be installed.
    #[error("logging init failed: {0}")]
    Logging(String),
    /// Shutdown signal handling failed.
    #[error("signal handling failed: {0}")]
    Signal(#[from] std::io::Error),
}

/// Result alias for the application boot path.
pub type AppResult<T> = Result<T, AppError>;
