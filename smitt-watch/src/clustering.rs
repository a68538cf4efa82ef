//! Clustering stage: profile/metadata pairs to ReporTree clusters
//!
//! Each ready pair gets one containerized ReporTree run. The intermediate
//! directory is mounted as `/data`, so host paths under it are rewritten to
//! container paths. ReporTree writes `<label>_clusterComposition.tsv` and
//! `<label>_partitions.tsv` into `<cluster_base>/<batch>/`.
//!
//! In additional-samples mode the newest partitions file of the batch is
//! passed as nomenclature, so existing cluster names stay stable. A batch
//! with no partitions yet is deferred until an initial run has produced one.

use crate::alert::{self, AlertSink};
use crate::error::{Error, Result};
use crate::pairing::{self, PairSource};
use crate::runner::CommandSpec;
use crate::stage::{FollowUp, Grouping, Invocation, Stage, WorkGroup};
use async_trait::async_trait;
use clap::ValueEnum;
use smitt_common::config::{ClusteringSettings, Settings};
use std::path::{Path, PathBuf};
use tracing::info;

pub const STAGE_NAME: &str = "clusters";

/// Mount point of the intermediate directory inside the container
const CONTAINER_ROOT: &str = "/data";

/// Clustering mode
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, ValueEnum)]
pub enum ClusterMode {
    /// Cluster each pair from scratch
    #[default]
    Initial,
    /// Reuse the batch's latest partitions as nomenclature
    Additional,
}

/// Builds the `docker run ... reportree.py` command for one pair
#[derive(Debug, Clone)]
pub struct ReportreeInvocation {
    mode: ClusterMode,
    tool: ClusteringSettings,
    intermediate_dir: PathBuf,
    /// Host path mounted as `/data`
    mount_source: PathBuf,
    cluster_base: PathBuf,
    threshold: u32,
    user: Option<String>,
}

impl ReportreeInvocation {
    /// Fails when the results or cluster tree is outside the intermediate
    /// directory, since the container could not see it
    pub fn from_settings(settings: &Settings, mode: ClusterMode) -> Result<Self> {
        for (name, path) in [
            ("results_base", &settings.results_base),
            ("cluster_base", &settings.cluster_base),
        ] {
            if !path.starts_with(&settings.intermediate_dir) {
                return Err(Error::Config(format!(
                    "{} {} is not inside intermediate_dir {}",
                    name,
                    path.display(),
                    settings.intermediate_dir.display()
                )));
            }
        }

        let mount_source = settings
            .host_intermediate_dir
            .clone()
            .unwrap_or_else(|| absolute(&settings.intermediate_dir));
        let user = settings
            .clustering
            .container_user
            .clone()
            .or_else(|| owner_of(&settings.intermediate_dir));

        Ok(Self {
            mode,
            tool: settings.clustering.clone(),
            intermediate_dir: settings.intermediate_dir.clone(),
            mount_source,
            cluster_base: settings.cluster_base.clone(),
            threshold: settings.cluster_threshold,
            user,
        })
    }

    /// Container view of a host path under the intermediate directory
    fn container_path(&self, host: &Path) -> Result<String> {
        let relative = host.strip_prefix(&self.intermediate_dir).map_err(|_| {
            Error::Config(format!(
                "{} is not inside intermediate_dir {}",
                host.display(),
                self.intermediate_dir.display()
            ))
        })?;
        let mut path = PathBuf::from(CONTAINER_ROOT);
        path.push(relative);
        Ok(path.to_string_lossy().into_owned())
    }
}

impl Invocation for ReportreeInvocation {
    fn prepare(&self, group: &WorkGroup) -> Result<CommandSpec> {
        let unit = group
            .units
            .first()
            .ok_or_else(|| Error::NotReady("empty work group".to_string()))?;
        let meta = unit
            .companion
            .as_deref()
            .ok_or_else(|| Error::NotReady(format!("{} has no metadata", unit.path.display())))?;

        let cluster_dir = self.cluster_base.join(&group.subfolder);
        let partitions = match self.mode {
            ClusterMode::Initial => None,
            ClusterMode::Additional => Some(pairing::latest_partitions(&cluster_dir).ok_or_else(|| {
                Error::NotReady(format!(
                    "no existing partitions for {}; additional-samples mode needs an initial run",
                    group.subfolder
                ))
            })?),
        };
        std::fs::create_dir_all(&cluster_dir)?;

        let mut spec = CommandSpec::new(&self.tool.docker, unit.label.clone())
            .args(["run", "--rm", "-v"])
            .arg(format!("{}:{}", self.mount_source.display(), CONTAINER_ROOT))
            .args(["-w", CONTAINER_ROOT]);
        if let Some(user) = &self.user {
            spec = spec.arg("--user").arg(user);
        }
        spec = spec
            .arg(&self.tool.image)
            .arg("reportree.py")
            .arg("-m")
            .arg(self.container_path(meta)?)
            .arg("-a")
            .arg(self.container_path(&unit.path)?);
        if let Some(partitions) = &partitions {
            spec = spec
                .arg("--nomenclature-file")
                .arg(self.container_path(partitions)?);
        }
        spec = spec
            .arg("--columns_summary_report")
            .arg(&self.tool.columns_summary_report)
            .arg("-out")
            .arg(self.container_path(&cluster_dir.join(&unit.label))?)
            .arg("--analysis")
            .arg(&self.tool.analysis)
            .arg("--method")
            .arg(&self.tool.method)
            .arg("-thr")
            .arg(self.threshold.to_string());

        info!(
            subfolder = %group.subfolder,
            label = %unit.label,
            mode = ?self.mode,
            "Pair ready for clustering"
        );
        Ok(spec)
    }
}

/// Scans the run's own composition file and raises alerts
pub struct ClusterAlertFollowUp {
    cluster_base: PathBuf,
    threshold: u32,
    sinks: Vec<Box<dyn AlertSink>>,
}

impl ClusterAlertFollowUp {
    pub fn new(cluster_base: PathBuf, threshold: u32, sinks: Vec<Box<dyn AlertSink>>) -> Self {
        Self {
            cluster_base,
            threshold,
            sinks,
        }
    }
}

#[async_trait]
impl FollowUp for ClusterAlertFollowUp {
    async fn on_success(&self, group: &WorkGroup, spec: &CommandSpec) {
        let dir = self.cluster_base.join(&group.subfolder);
        let files = alert::composition_files(&dir, Some(&spec.label));
        if files.is_empty() {
            info!(subfolder = %group.subfolder, label = %spec.label, "No cluster composition written");
            return;
        }

        let alerts = alert::scan_files(&files, self.threshold);
        info!(
            subfolder = %group.subfolder,
            label = %spec.label,
            alerts = alerts.len(),
            "Finished scanning clusters"
        );
        alert::dispatch(&alerts, &self.sinks).await;
    }
}

/// Clustering stage from settings, alerting through `sinks`
pub fn cluster_stage(settings: &Settings, mode: ClusterMode, sinks: Vec<Box<dyn AlertSink>>) -> Result<Stage> {
    let invocation = ReportreeInvocation::from_settings(settings, mode)?;
    let name = match mode {
        ClusterMode::Initial => STAGE_NAME.to_string(),
        ClusterMode::Additional => format!("{}-additional", STAGE_NAME),
    };

    Ok(Stage::new(
        name,
        Box::new(PairSource::new(&settings.results_base)),
        Grouping::PerUnit,
        Box::new(invocation),
    )
    .with_follow_up(Box::new(ClusterAlertFollowUp::new(
        settings.cluster_base.clone(),
        settings.cluster_threshold,
        sinks,
    ))))
}

fn absolute(path: &Path) -> PathBuf {
    if path.is_absolute() {
        return path.to_path_buf();
    }
    std::env::current_dir()
        .map(|cwd| cwd.join(path))
        .unwrap_or_else(|_| path.to_path_buf())
}

/// `uid:gid` owning `path`, so container output stays writable for the host user
#[cfg(unix)]
fn owner_of(path: &Path) -> Option<String> {
    use std::os::unix::fs::MetadataExt;
    let meta = std::fs::metadata(path).ok()?;
    Some(format!("{}:{}", meta.uid(), meta.gid()))
}

#[cfg(not(unix))]
fn owner_of(_path: &Path) -> Option<String> {
    None
}
