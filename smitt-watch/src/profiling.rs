//! Profiling stage: raw JSON batches to allele profiles
//!
//! New JSON files are grouped by batch subfolder and handed to the profiling
//! tool in one call per batch:
//!
//! ```text
//! <program> [args...] <results_base> <batch>_<YYYY-MM-DD>_<seq> <file...>
//! ```
//!
//! The tool writes `cgmlst.profile.<label>` and `metadata.tsv.<label>` into
//! `<results_base>/<batch>/`, where the clustering stage picks them up.

use crate::alert::{self, AlertSink};
use crate::error::{Error, Result};
use crate::pairing::{self, PROFILE_PREFIX};
use crate::reference::ReferenceManager;
use crate::runner::CommandSpec;
use crate::scanner::FileSource;
use crate::stage::{FollowUp, Grouping, Invocation, Stage, WorkGroup};
use async_trait::async_trait;
use smitt_common::config::Settings;
use smitt_common::{time, LockError};
use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::{Mutex, MutexGuard};
use tracing::{error, info, warn};

pub const STAGE_NAME: &str = "profiles";

/// Builds the profiling tool command for one batch
pub struct ProfileInvocation {
    program: String,
    args: Vec<String>,
    results_base: PathBuf,
    /// Last sequence number handed out per (batch, date)
    issued: Mutex<HashMap<(String, String), u64>>,
}

impl ProfileInvocation {
    pub fn new(program: impl Into<String>, args: Vec<String>, results_base: impl Into<PathBuf>) -> Self {
        Self {
            program: program.into(),
            args,
            results_base: results_base.into(),
            issued: Mutex::new(HashMap::new()),
        }
    }

    /// Next run label for `subfolder` on `date`
    ///
    /// The sequence number continues from the highest profile already on
    /// disk, so a restarted watcher never reuses a label. Labels issued for
    /// runs that have not written their profile yet are remembered too.
    pub fn next_label(&self, subfolder: &str, date: &str) -> String {
        let on_disk = pairing::max_sequence(&self.results_base.join(subfolder), subfolder, date).unwrap_or(0);

        let mut issued = self.issued.lock().unwrap_or_else(|e| e.into_inner());
        let last = issued.entry((subfolder.to_string(), date.to_string())).or_insert(0);
        *last = (*last).max(on_disk) + 1;
        format!("{}_{}_{}", subfolder, date, last)
    }
}

impl Invocation for ProfileInvocation {
    fn prepare(&self, group: &WorkGroup) -> Result<CommandSpec> {
        let label = self.next_label(&group.subfolder, &time::today_label());
        if pairing::ProfileName::parse(&format!("{}{}", PROFILE_PREFIX, label)).is_none() {
            warn!(
                subfolder = %group.subfolder,
                label = %label,
                "Batch name has characters outside [A-Za-z0-9_]; its profiles will not be paired for clustering"
            );
        }
        info!(
            subfolder = %group.subfolder,
            label = %label,
            files = group.units.len(),
            "New input files found"
        );

        let mut spec = CommandSpec::new(&self.program, label.clone())
            .args(&self.args)
            .arg(&self.results_base)
            .arg(&label)
            .args(group.paths());
        // Profiling tools misbehave without a timezone on hosts without systemd
        if std::env::var_os("TZ").is_none() {
            spec = spec.env("TZ", "UTC");
        }
        Ok(spec)
    }
}

/// A profile waiting for its reference update
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PendingUpdate {
    pub profile: PathBuf,
    /// Run label, used to name the matches table
    pub label: String,
}

enum Update {
    Done,
    Retry,
}

/// Hands each new profile to the reference dataset: compare, then append
///
/// Comparator matches are written as a matches table under `alerts_dir` and
/// raised through the alert sinks. Profiles that could not take the
/// reference lock are queued and retried on later polls.
pub struct ReferenceChain {
    manager: ReferenceManager,
    ref_dir: PathBuf,
    results_base: PathBuf,
    alerts_dir: PathBuf,
    threshold: u32,
    sinks: Vec<Box<dyn AlertSink>>,
    pending: Mutex<Vec<PendingUpdate>>,
}

impl ReferenceChain {
    pub fn new(
        manager: ReferenceManager,
        ref_dir: PathBuf,
        results_base: PathBuf,
        alerts_dir: PathBuf,
        threshold: u32,
        sinks: Vec<Box<dyn AlertSink>>,
    ) -> Self {
        Self {
            manager,
            ref_dir,
            results_base,
            alerts_dir,
            threshold,
            sinks,
            pending: Mutex::new(Vec::new()),
        }
    }

    /// Profiles queued for a retry
    pub fn pending(&self) -> Vec<PendingUpdate> {
        self.queue().clone()
    }

    fn queue(&self) -> MutexGuard<'_, Vec<PendingUpdate>> {
        self.pending.lock().unwrap_or_else(|e| e.into_inner())
    }

    async fn update(&self, item: &PendingUpdate) -> Update {
        let profile = item.profile.display();
        match self
            .manager
            .compare_then_append(&self.ref_dir, &item.profile, self.threshold)
            .await
        {
            Ok(report) => {
                if report.compare.is_success() {
                    self.raise_matches(item, &report.compare_output).await;
                }
                match &report.append {
                    Some(outcome) if outcome.is_success() => {
                        info!(profile = %profile, "Reference dataset updated");
                    }
                    Some(outcome) => {
                        warn!(profile = %profile, code = outcome.exit_code(), "Reference append failed");
                    }
                    None => {
                        warn!(profile = %profile, code = report.compare.exit_code(), "Reference comparison failed");
                    }
                }
                Update::Done
            }
            Err(Error::Lock(LockError::Busy { .. })) => {
                warn!(profile = %profile, "Reference dataset busy; update queued for retry");
                Update::Retry
            }
            Err(Error::Lock(e @ LockError::StaleRequiresForce { .. })) => {
                error!(
                    profile = %profile,
                    "{}; remove the lock or set REF_LOCK_FORCE, update queued for retry",
                    e
                );
                Update::Retry
            }
            Err(Error::Lock(e)) => {
                warn!(profile = %profile, error = %e, "Reference lock unavailable; update queued for retry");
                Update::Retry
            }
            Err(e) => {
                error!(profile = %profile, error = %e, "Reference update not possible");
                Update::Done
            }
        }
    }

    async fn raise_matches(&self, item: &PendingUpdate, output: &[String]) {
        let rows = alert::match_rows(output);
        if rows.is_empty() {
            info!(profile = %item.profile.display(), "No reference matches within threshold");
            return;
        }

        let source = match alert::write_matches(&self.alerts_dir, &item.label, &rows) {
            Ok(path) => {
                info!(matches = rows.len(), path = %path.display(), "Reference matches saved");
                path
            }
            Err(e) => {
                warn!(dir = %self.alerts_dir.display(), error = %e, "Failed to save reference matches");
                item.profile.clone()
            }
        };
        let alerts = alert::match_alerts(&rows, self.threshold, &source);
        alert::dispatch(&alerts, &self.sinks).await;
    }
}

#[async_trait]
impl FollowUp for ReferenceChain {
    async fn on_success(&self, group: &WorkGroup, spec: &CommandSpec) {
        let profile = self
            .results_base
            .join(&group.subfolder)
            .join(format!("{}{}", PROFILE_PREFIX, spec.label));
        if !pairing::is_likely_tsv(&profile) {
            warn!(profile = %profile.display(), "Profiling succeeded but no profile table was written");
            return;
        }

        let item = PendingUpdate {
            profile,
            label: spec.label.clone(),
        };
        if let Update::Retry = self.update(&item).await {
            self.queue().push(item);
        }
    }

    fn has_pending(&self) -> bool {
        !self.queue().is_empty()
    }

    /// Oldest first; stops at the first profile that still cannot proceed
    async fn retry_pending(&self) {
        let queued = std::mem::take(&mut *self.queue());
        let mut rest = queued.into_iter();
        while let Some(item) = rest.next() {
            if let Update::Retry = self.update(&item).await {
                let mut queue = self.queue();
                let newer = std::mem::take(&mut *queue);
                queue.push(item);
                queue.extend(rest);
                queue.extend(newer);
                break;
            }
        }
    }
}

/// Profiling stage from settings; chains reference updates when a
/// reference directory is configured
pub fn profile_stage(settings: &Settings, sinks: Vec<Box<dyn AlertSink>>) -> Stage {
    let invocation = ProfileInvocation::new(
        settings.profiler.program.clone(),
        settings.profiler.args.clone(),
        settings.results_base.clone(),
    );
    let stage = Stage::new(
        STAGE_NAME,
        Box::new(FileSource::new(&settings.watch_dir, &settings.profiler.input_suffix)),
        Grouping::BySubfolder,
        Box::new(invocation),
    );

    match &settings.reference.ref_dir {
        Some(ref_dir) => stage.with_follow_up(Box::new(ReferenceChain::new(
            ReferenceManager::from_settings(settings),
            ref_dir.clone(),
            settings.results_base.clone(),
            settings.alerts.alerts_dir.clone(),
            settings.cluster_threshold,
            sinks,
        ))),
        None => stage,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::stage::WorkUnit;
    use serial_test::serial;
    use std::ffi::OsString;
    use std::fs;
    use tempfile::TempDir;

    fn group(sub: &str, files: &[&str]) -> WorkGroup {
        WorkGroup {
            subfolder: sub.to_string(),
            units: files
                .iter()
                .map(|f| WorkUnit {
                    key: format!("/in/{}/{}", sub, f),
                    subfolder: sub.to_string(),
                    label: f.to_string(),
                    path: PathBuf::from(format!("/in/{}/{}", sub, f)),
                    companion: None,
                })
                .collect(),
        }
    }

    #[test]
    fn test_sequence_continues_from_disk() {
        let tmp = TempDir::new().unwrap();
        let batch = tmp.path().join("labA");
        fs::create_dir(&batch).unwrap();
        fs::write(batch.join("cgmlst.profile.labA_2024-01-01_1"), "a\tb\n").unwrap();
        fs::write(batch.join("cgmlst.profile.labA_2024-01-01_4"), "a\tb\n").unwrap();
        fs::write(batch.join("cgmlst.profile.labA_2024-01-02_9"), "a\tb\n").unwrap();

        let inv = ProfileInvocation::new("Rscript", vec![], tmp.path());
        assert_eq!(inv.next_label("labA", "2024-01-01"), "labA_2024-01-01_5");
        // Not written to disk yet, still not reused
        assert_eq!(inv.next_label("labA", "2024-01-01"), "labA_2024-01-01_6");
        assert_eq!(inv.next_label("labB", "2024-01-01"), "labB_2024-01-01_1");
    }

    #[test]
    fn test_prepare_argument_order() {
        let tmp = TempDir::new().unwrap();
        let inv = ProfileInvocation::new("Rscript", vec!["R/process_json.R".into()], tmp.path());
        let spec = inv.prepare(&group("b1", &["s1.json", "s2.json"])).unwrap();

        let args = spec.args_lossy();
        assert_eq!(args[0], "R/process_json.R");
        assert_eq!(args[1], tmp.path().to_string_lossy());
        assert_eq!(args[2], spec.label);
        assert!(spec.label.starts_with("b1_") && spec.label.ends_with("_1"));
        assert_eq!(&args[3..], ["/in/b1/s1.json", "/in/b1/s2.json"]);
    }

    #[test]
    #[serial]
    fn test_timezone_defaults_to_utc() {
        let inv = ProfileInvocation::new("Rscript", vec![], "/results");
        let saved = std::env::var_os("TZ");

        std::env::remove_var("TZ");
        let spec = inv.prepare(&group("b1", &["s1.json"])).unwrap();
        assert_eq!(spec.env, vec![(OsString::from("TZ"), OsString::from("UTC"))]);

        std::env::set_var("TZ", "Europe/Stockholm");
        let spec = inv.prepare(&group("b1", &["s1.json"])).unwrap();
        assert!(spec.env.is_empty());

        match saved {
            Some(tz) => std::env::set_var("TZ", tz),
            None => std::env::remove_var("TZ"),
        }
    }
}
