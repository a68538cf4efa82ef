//! Test Helper Utilities
//!
//! Shared fixtures for smitt-watch integration tests

#![allow(dead_code)]

use smitt_watch::alert::{Alert, AlertSink};
use smitt_watch::stage::{FollowUp, Invocation, WorkGroup};
use smitt_watch::{CommandSpec, Error, Result};
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};

/// Create `<root>/<batch>/<name>` with `content`
pub fn write_file(root: &Path, batch: &str, name: &str, content: &str) {
    let dir = root.join(batch);
    fs::create_dir_all(&dir).unwrap();
    fs::write(dir.join(name), content).unwrap();
}

/// Minimal TSV table that passes the readiness gate
pub const TSV: &str = "sample\tlocus_1\tlocus_2\nS1\t1\t2\n";

/// Invocation running `sh -c <script> sh <files...>`, recording every
/// group it was asked to prepare
#[derive(Clone)]
pub struct ShellInvocation {
    script: String,
    pub prepared: Arc<Mutex<Vec<(String, Vec<String>)>>>,
}

impl ShellInvocation {
    pub fn new(script: &str) -> Self {
        Self {
            script: script.to_string(),
            prepared: Arc::new(Mutex::new(Vec::new())),
        }
    }

    pub fn prepared(&self) -> Vec<(String, Vec<String>)> {
        self.prepared.lock().unwrap().clone()
    }
}

impl Invocation for ShellInvocation {
    fn prepare(&self, group: &WorkGroup) -> Result<CommandSpec> {
        let labels = group.units.iter().map(|u| u.label.clone()).collect();
        self.prepared
            .lock()
            .unwrap()
            .push((group.subfolder.clone(), labels));

        Ok(CommandSpec::new("sh", group.subfolder.clone())
            .args(["-c", self.script.as_str(), "sh"])
            .args(group.paths()))
    }
}

/// Invocation that never has its inputs ready
pub struct NeverReady;

impl Invocation for NeverReady {
    fn prepare(&self, group: &WorkGroup) -> Result<CommandSpec> {
        Err(Error::NotReady(format!("{} not ready", group.subfolder)))
    }
}

/// Follow-up counting how often it ran
#[derive(Clone, Default)]
pub struct CountingFollowUp {
    pub calls: Arc<AtomicUsize>,
}

impl CountingFollowUp {
    pub fn count(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }
}

#[async_trait::async_trait]
impl FollowUp for CountingFollowUp {
    async fn on_success(&self, _group: &WorkGroup, _spec: &CommandSpec) {
        self.calls.fetch_add(1, Ordering::SeqCst);
    }
}

/// Stand-in comparator: reports one match within the threshold
///
/// Reference scripts run as `sh <script> --ref-dir <dir> --new <path> ...`,
/// so `$2` is the reference directory and `$4` the new profile.
pub const COMPARE_WITH_MATCH: &str = r#"
printf 'sampleA\tsampleB\tdiffs\tcompared_loci\tpct_diff\n'
printf 'S1\tREF1\t2\t3000\t0.07\n'
"#;

/// Stand-in appender: records the appended profile in `<ref_dir>/appended`
pub const APPEND_RECORDING: &str = "echo \"$4\" >> \"$2/appended\"\n";

/// Write compare and append stand-ins into a fresh scripts folder
pub fn write_ref_scripts(root: &Path, compare: &str, append: &str) -> PathBuf {
    let scripts = root.join("scripts");
    fs::create_dir_all(&scripts).unwrap();
    fs::write(scripts.join("compare_new_to_ref.py"), compare).unwrap();
    fs::write(scripts.join("append_profiles_to_npy.py"), append).unwrap();
    scripts
}

/// Lines recorded by [`APPEND_RECORDING`]
pub fn appended(ref_dir: &Path) -> Vec<String> {
    fs::read_to_string(ref_dir.join("appended"))
        .map(|s| s.lines().map(str::to_string).collect())
        .unwrap_or_default()
}

/// Alert sink keeping every delivered alert
#[derive(Clone, Default)]
pub struct RecordingSink {
    pub alerts: Arc<Mutex<Vec<Alert>>>,
}

impl RecordingSink {
    pub fn delivered(&self) -> Vec<Alert> {
        self.alerts.lock().unwrap().clone()
    }
}

#[async_trait::async_trait]
impl AlertSink for RecordingSink {
    async fn deliver(&self, alert: &Alert) {
        self.alerts.lock().unwrap().push(alert.clone());
    }
}
