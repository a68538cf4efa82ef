//! Lock-guarded reference dataset maintenance
//!
//! The reference dataset is a directory shared by every pipeline instance on
//! the host. The numeric work is done by Python scripts; this module builds
//! their command lines and makes sure each one runs while holding the
//! dataset's [`DirLock`].

use crate::error::{Error, Result};
use crate::runner::{self, exit_zero, CommandSpec, RunOutcome};
use clap::ValueEnum;
use smitt_common::config::Settings;
use smitt_common::{DirLock, Lease, LockError, LockGuard};
use std::fmt;
use std::path::{Path, PathBuf};
use std::time::Duration;
use tracing::{info, warn};

const STAGE: &str = "reference";

/// Operation on the reference dataset
#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
pub enum RefAction {
    /// Add new profiles to the dataset
    Append,
    /// Recreate the dataset from a set of inputs
    Rebuild,
    /// Compare new profiles against the dataset (read only)
    Compare,
}

impl RefAction {
    fn script(self) -> &'static str {
        match self {
            RefAction::Append => "append_profiles_to_npy.py",
            RefAction::Rebuild => "rebuild_profiles.py",
            RefAction::Compare => "compare_new_to_ref.py",
        }
    }
}

impl fmt::Display for RefAction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            RefAction::Append => "append",
            RefAction::Rebuild => "rebuild",
            RefAction::Compare => "compare",
        };
        f.write_str(name)
    }
}

/// Result of a compare-then-append pass
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ChainReport {
    pub compare: RunOutcome,
    /// Comparator stdout, one entry per line
    pub compare_output: Vec<String>,
    /// `None` when the comparison failed and the append was skipped
    pub append: Option<RunOutcome>,
}

impl ChainReport {
    /// Whether the profile reached the dataset
    pub fn appended(&self) -> bool {
        matches!(self.append, Some(RunOutcome::Succeeded))
    }
}

/// Builds and runs reference tool invocations
#[derive(Debug, Clone)]
pub struct ReferenceManager {
    python: String,
    scripts_dir: PathBuf,
    ttl: Duration,
    force: bool,
}

impl ReferenceManager {
    pub fn new(python: impl Into<String>, scripts_dir: impl Into<PathBuf>, ttl: Duration, force: bool) -> Self {
        Self {
            python: python.into(),
            scripts_dir: scripts_dir.into(),
            ttl,
            force,
        }
    }

    pub fn from_settings(settings: &Settings) -> Self {
        Self::new(
            settings.reference.python.clone(),
            settings.reference.scripts_dir.clone(),
            settings.lock_ttl(),
            settings.reference.force,
        )
    }

    /// Command line for `action`
    ///
    /// `new_data` is a single path, or for `rebuild` a comma-separated list
    /// of inputs. Empty input is a configuration error.
    pub fn command(
        &self,
        action: RefAction,
        ref_dir: &Path,
        new_data: &str,
        threshold: u32,
    ) -> Result<CommandSpec> {
        let inputs: Vec<&str> = new_data
            .split(',')
            .map(str::trim)
            .filter(|s| !s.is_empty())
            .collect();
        if inputs.is_empty() {
            return Err(Error::Config(format!("--new is required for {}", action)));
        }
        if action != RefAction::Rebuild && inputs.len() > 1 {
            return Err(Error::Config(format!("{} takes a single --new path", action)));
        }

        let spec = CommandSpec::new(&self.python, action.to_string())
            .arg(self.scripts_dir.join(action.script()));
        let spec = match action {
            RefAction::Append => spec
                .arg("--ref-dir")
                .arg(ref_dir)
                .arg("--new")
                .arg(inputs[0]),
            RefAction::Rebuild => spec
                .arg("--inputs")
                .args(inputs)
                .arg("--out-dir")
                .arg(ref_dir),
            RefAction::Compare => spec
                .arg("--ref-dir")
                .arg(ref_dir)
                .arg("--new")
                .arg(inputs[0])
                .arg("--threshold")
                .arg(threshold.to_string()),
        };
        Ok(spec)
    }

    /// Take the dataset lock; never waits
    pub fn lock(&self, ref_dir: &Path) -> std::result::Result<LockGuard, LockError> {
        let guard = DirLock::new(ref_dir).acquire(self.ttl, self.force)?;
        info!(lock = %guard.marker_path().display(), "Reference lock acquired");
        Ok(guard)
    }

    /// Run one action under the lock
    pub async fn run(
        &self,
        action: RefAction,
        ref_dir: &Path,
        new_data: &str,
        threshold: u32,
    ) -> Result<RunOutcome> {
        let spec = self.command(action, ref_dir, new_data, threshold)?;
        let guard = self.lock(ref_dir)?;
        let outcome = runner::run(STAGE, &spec, exit_zero).await;
        guard.release()?;
        Ok(outcome)
    }

    /// Compare `profile` against the dataset and append it when the
    /// comparison succeeds, holding the lock across both steps
    ///
    /// The comparator's stdout is returned for match reporting.
    pub async fn compare_then_append(
        &self,
        ref_dir: &Path,
        profile: &Path,
        threshold: u32,
    ) -> Result<ChainReport> {
        let new_data = profile.to_string_lossy();
        let compare = self.command(RefAction::Compare, ref_dir, &new_data, threshold)?;
        let append = self.command(RefAction::Append, ref_dir, &new_data, threshold)?;

        let guard = self.lock(ref_dir)?;
        let (compare_outcome, compare_output) = runner::run_captured(STAGE, &compare, exit_zero).await;
        let append_outcome = if compare_outcome.is_success() {
            Some(runner::run(STAGE, &append, exit_zero).await)
        } else {
            warn!(profile = %profile.display(), "Comparison failed; profile not appended");
            None
        };
        guard.release()?;

        Ok(ChainReport {
            compare: compare_outcome,
            compare_output,
            append: append_outcome,
        })
    }
}
