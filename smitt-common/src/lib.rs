//! # smittvarnings common library
//!
//! Shared code for the smittvarnings pipeline binaries:
//! - Error types
//! - Configuration loading (TOML file, environment, compiled defaults)
//! - Directory lock guarding the shared reference dataset
//! - Known-set ledgers used for at-most-once processing
//! - Timestamp utilities

pub mod config;
pub mod error;
pub mod ledger;
pub mod lock;
pub mod time;

pub use error::{Error, Result};
pub use ledger::{Ledger, MemoryLedger};
pub use lock::{DirLock, Lease, LockError, LockGuard};
