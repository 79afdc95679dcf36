#![forbid(unsafe_code)]
#![deny(rustdoc::broken_intra_doc_links, rustdoc::bare_urls)]
#![allow(clippy::module_name_repetitions)]

//! Configuration for the seedpace supervisor.
//!
//! A single JSON file describes the client instances to supervise, the
//! tracker sites, the speed rules, and the engine tunables. The engine never
//! reads the file directly: it pulls [`RulesSnapshot`]s from a
//! [`ConfigService`], which re-reads the file at most once per ten seconds.

mod model;
mod service;

pub use model::{AppConfig, ClientConfig, EngineSettings, SiteConfig, SpeedRule};
pub use service::{ConfigService, RulesSnapshot};

use std::path::Path;

/// Errors raised while loading or validating configuration.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    /// The configuration file could not be read.
    #[error("failed to read config at {path}: {source}")]
    Io {
        /// Offending path.
        path: String,
        /// Underlying I/O error.
        #[source]
        source: std::io::Error,
    },
    /// The configuration file is not valid JSON for [`AppConfig`].
    #[error("failed to parse config at {path}: {source}")]
    Parse {
        /// Offending path.
        path: String,
        /// Underlying decode error.
        #[source]
        source: serde_json::Error,
    },
    /// The configuration is structurally valid but semantically broken.
    #[error("invalid config: {0}")]
    Validation(String),
}

/// Load and validate an [`AppConfig`] from a JSON file.
///
/// # Errors
///
/// Returns [`ConfigError`] when the file cannot be read, parsed, or fails
/// validation.
pub fn load(path: impl AsRef<Path>) -> Result<AppConfig, ConfigError> {
    let path = path.as_ref();
    let raw = std::fs::read_to_string(path).map_err(|source| ConfigError::Io {
        path: path.display().to_string(),
        source,
    })?;
    let config: AppConfig = serde_json::from_str(&raw).map_err(|source| ConfigError::Parse {
        path: path.display().to_string(),
        source,
    })?;
    config.validate()?;
    Ok(config)
}
