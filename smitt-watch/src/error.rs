//! Error types for smitt-watch

use smitt_common::LockError;
use thiserror::Error;

/// Main error type for the watcher library
#[derive(Error, Debug)]
pub enum Error {
    /// Configuration errors detected while building a stage
    #[error("Configuration error: {0}")]
    Config(String),

    /// Inputs exist but are not complete yet; retried on the next poll
    #[error("Not ready: {0}")]
    NotReady(String),

    /// File I/O errors
    #[error("File I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// Reference dataset lock could not be taken
    #[error(transparent)]
    Lock(#[from] LockError),

    /// smitt-common error
    #[error(transparent)]
    Common(#[from] smitt_common::Error),
}

/// Convenience Result type using the smitt-watch Error
pub type Result<T> = std::result::Result<T, Error>;
