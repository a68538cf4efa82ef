//! Directory lock for the shared reference dataset
//!
//! The lock is a sibling directory `<resource>.lock`. Creating a directory is
//! atomic on every filesystem the pipeline runs on (including NFS and
//! container bind mounts), so whoever creates it holds the lock. An
//! `owner.json` file inside records who took it and when.
//!
//! Rules:
//! - A marker whose age is at most the TTL is held: acquisition fails with
//!   [`LockError::Busy`] and the caller must not spin on it.
//! - A marker older than the TTL is stale. It is only removed when the caller
//!   passes `force`; otherwise acquisition fails with
//!   [`LockError::StaleRequiresForce`].
//! - Releasing a lock that does not exist is not an error.
//!
//! The lock is advisory. Every process that touches the reference dataset
//! goes through [`DirLock`].

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::ffi::OsString;
use std::fs;
use std::io::ErrorKind;
use std::path::{Path, PathBuf};
use std::time::{Duration, SystemTime};
use thiserror::Error;
use tracing::{debug, info, warn};

/// Name of the ownership record inside the marker directory
pub const OWNER_FILE: &str = "owner.json";

/// Lock acquisition errors
#[derive(Debug, Error)]
pub enum LockError {
    /// Another process holds the lock and it is within its TTL
    #[error("Lock {} is held (age {age_secs}s){}", .path.display(), owner_suffix(.owner))]
    Busy {
        path: PathBuf,
        age_secs: u64,
        owner: Option<OwnerInfo>,
    },

    /// Lock is older than its TTL; removing it needs an explicit override
    #[error(
        "Lock {} is stale (age {age_secs}s > ttl {ttl_secs}s); use --force to override",
        .path.display()
    )]
    StaleRequiresForce {
        path: PathBuf,
        age_secs: u64,
        ttl_secs: u64,
    },

    /// Filesystem error other than contention
    #[error("Lock I/O error on {}: {source}", .path.display())]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
}

fn owner_suffix(owner: &Option<OwnerInfo>) -> String {
    match owner {
        Some(o) => format!(", owner pid {} since {}", o.pid, o.acquired_at.to_rfc3339()),
        None => String::new(),
    }
}

/// Ownership record written into the marker directory
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct OwnerInfo {
    pub pid: u32,
    pub acquired_at: DateTime<Utc>,
}

impl OwnerInfo {
    fn current() -> Self {
        Self {
            pid: std::process::id(),
            acquired_at: Utc::now(),
        }
    }
}

/// Whether a marker of age `age` has outlived `ttl`
///
/// A marker exactly at the TTL is still held.
pub fn is_expired(age: Duration, ttl: Duration) -> bool {
    age > ttl
}

/// Mutual-exclusion capability over a shared resource
///
/// Callers depend on this trait rather than on the directory representation,
/// so the backing mechanism can change without touching them.
pub trait Lease {
    /// Try once to take the lock
    fn acquire(&self, ttl: Duration, force: bool) -> Result<LockGuard, LockError>;

    /// Drop the lock regardless of owner. Idempotent.
    fn release(&self) -> Result<(), LockError>;

    /// Whether a lock is present and older than `ttl`
    fn is_stale(&self, ttl: Duration) -> Result<bool, LockError>;
}

/// Directory-presence lock over `<resource>.lock`
#[derive(Debug, Clone)]
pub struct DirLock {
    marker: PathBuf,
}

impl DirLock {
    /// Lock guarding `resource_dir`
    pub fn new(resource_dir: impl AsRef<Path>) -> Self {
        // Collecting components drops a trailing separator, so "ref/" locks
        // "ref.lock" and not "ref/.lock".
        let normalized: PathBuf = resource_dir.as_ref().components().collect();
        let mut marker: OsString = normalized.into_os_string();
        marker.push(".lock");
        Self {
            marker: PathBuf::from(marker),
        }
    }

    /// Path of the marker directory
    pub fn marker_path(&self) -> &Path {
        &self.marker
    }

    /// Read the ownership record, if present and parseable
    pub fn owner(&self) -> Option<OwnerInfo> {
        let content = fs::read_to_string(self.marker.join(OWNER_FILE)).ok()?;
        serde_json::from_str(&content).ok()
    }

    /// Acquire against an explicit clock reading
    ///
    /// [`Lease::acquire`] calls this with `SystemTime::now()`.
    pub fn acquire_at(
        &self,
        ttl: Duration,
        force: bool,
        now: SystemTime,
    ) -> Result<LockGuard, LockError> {
        let mut took_over = false;
        let mut vanished = false;

        loop {
            match fs::create_dir(&self.marker) {
                Ok(()) => {
                    self.write_owner()?;
                    info!(lock = %self.marker.display(), pid = std::process::id(), "Lock acquired");
                    return Ok(LockGuard {
                        lock: self.clone(),
                        armed: true,
                    });
                }
                Err(e) if e.kind() == ErrorKind::AlreadyExists => {}
                Err(e) => return Err(self.io_error(e)),
            }

            let age = match self.age_at(now) {
                Ok(age) => age,
                // Holder released between our mkdir and stat
                Err(e) if e.kind() == ErrorKind::NotFound && !vanished => {
                    vanished = true;
                    continue;
                }
                Err(e) => return Err(self.io_error(e)),
            };

            if !is_expired(age, ttl) || took_over {
                return Err(LockError::Busy {
                    path: self.marker.clone(),
                    age_secs: age.as_secs(),
                    owner: self.owner(),
                });
            }

            if !force {
                return Err(LockError::StaleRequiresForce {
                    path: self.marker.clone(),
                    age_secs: age.as_secs(),
                    ttl_secs: ttl.as_secs(),
                });
            }

            warn!(
                lock = %self.marker.display(),
                age_secs = age.as_secs(),
                ttl_secs = ttl.as_secs(),
                owner = ?self.owner(),
                "Stale lock found, force specified: removing"
            );
            self.remove_marker()?;
            took_over = true;
        }
    }

    fn age_at(&self, now: SystemTime) -> std::io::Result<Duration> {
        let modified = fs::metadata(&self.marker)?.modified()?;
        Ok(crate::time::age_at(modified, now))
    }

    fn write_owner(&self) -> Result<(), LockError> {
        let owner = OwnerInfo::current();
        let written = serde_json::to_vec(&owner)
            .map_err(std::io::Error::from)
            .and_then(|bytes| fs::write(self.marker.join(OWNER_FILE), bytes));

        if let Err(e) = written {
            // Do not leave a marker behind that nobody owns
            let _ = fs::remove_dir_all(&self.marker);
            return Err(self.io_error(e));
        }
        Ok(())
    }

    fn remove_marker(&self) -> Result<(), LockError> {
        match fs::remove_dir_all(&self.marker) {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == ErrorKind::NotFound => Ok(()),
            Err(e) => Err(self.io_error(e)),
        }
    }

    fn io_error(&self, source: std::io::Error) -> LockError {
        LockError::Io {
            path: self.marker.clone(),
            source,
        }
    }
}

impl Lease for DirLock {
    fn acquire(&self, ttl: Duration, force: bool) -> Result<LockGuard, LockError> {
        self.acquire_at(ttl, force, SystemTime::now())
    }

    fn release(&self) -> Result<(), LockError> {
        self.remove_marker()?;
        debug!(lock = %self.marker.display(), "Lock released");
        Ok(())
    }

    fn is_stale(&self, ttl: Duration) -> Result<bool, LockError> {
        match self.age_at(SystemTime::now()) {
            Ok(age) => Ok(is_expired(age, ttl)),
            Err(e) if e.kind() == ErrorKind::NotFound => Ok(false),
            Err(e) => Err(self.io_error(e)),
        }
    }
}

/// Held lock; released when dropped
///
/// Dropping covers normal completion, early returns and unwinding panics.
#[derive(Debug)]
pub struct LockGuard {
    lock: DirLock,
    armed: bool,
}

impl LockGuard {
    /// Path of the held marker directory
    pub fn marker_path(&self) -> &Path {
        self.lock.marker_path()
    }

    /// Release now and report any error instead of logging it
    pub fn release(mut self) -> Result<(), LockError> {
        self.armed = false;
        self.lock.release()
    }
}

impl Drop for LockGuard {
    fn drop(&mut self) {
        if !self.armed {
            return;
        }
        if let Err(e) = self.lock.release() {
            warn!(error = %e, "Failed to remove lock directory");
        }
    }
}
