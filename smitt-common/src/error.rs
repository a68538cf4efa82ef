//! Common error types for smittvarnings

use std::path::PathBuf;
use thiserror::Error;

/// Common result type for smittvarnings operations
pub type Result<T> = std::result::Result<T, Error>;

/// Errors raised while resolving settings; all are fatal at startup
#[derive(Error, Debug)]
pub enum Error {
    /// Invalid setting value, from the environment or after validation
    #[error("Configuration error: {0}")]
    Config(String),

    /// Config file could not be read
    #[error("Failed to read config file {}: {source}", .path.display())]
    ConfigRead {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    /// Config file is not valid TOML for the settings schema
    #[error("Failed to parse config file {}: {source}", .path.display())]
    ConfigParse {
        path: PathBuf,
        #[source]
        source: toml::de::Error,
    },
}

impl Error {
    /// Whether the error comes from configuration the operator supplied
    pub fn is_config(&self) -> bool {
        matches!(
            self,
            Error::Config(_) | Error::ConfigRead { .. } | Error::ConfigParse { .. }
        )
    }
}
