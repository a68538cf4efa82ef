//! Configuration loading
//!
//! Settings are resolved per field in this priority order:
//! 1. Command-line argument (applied by each binary after loading)
//! 2. Environment variable
//! 3. TOML config file
//! 4. Compiled default
//!
//! A missing config file is not an error: a warning is logged and the
//! compiled defaults are used.

use crate::{Error, Result};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::str::FromStr;
use std::time::Duration;
use tracing::{info, warn};

/// Directory name used under the platform config dir and /etc
const APP_DIR: &str = "smittvarnings";

// ============================================================================
// Settings
// ============================================================================

/// Complete pipeline configuration
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct Settings {
    /// Root watched for raw JSON batches (`WATCH_DIR`)
    pub watch_dir: PathBuf,
    /// Parent of the profile and cluster trees; mounted into the clustering
    /// container as `/data`
    pub intermediate_dir: PathBuf,
    /// Profile/metadata output tree (`RESULTS_BASE`)
    pub results_base: PathBuf,
    /// Clustering output tree (`CLUSTER_BASE`)
    pub cluster_base: PathBuf,
    /// Host-side path of `intermediate_dir` when running inside a container
    /// that starts sibling containers (`HOST_RESULTS_BASE`)
    pub host_intermediate_dir: Option<PathBuf>,
    /// Seconds between polls (`POLL_INTERVAL_SECS`)
    pub poll_interval_secs: u64,
    /// Allelic distance threshold for clustering and alerts (`CLUSTER_THRESHOLD`)
    pub cluster_threshold: u32,
    pub profiler: ProfilerSettings,
    pub clustering: ClusteringSettings,
    pub reference: ReferenceSettings,
    pub alerts: AlertSettings,
}

impl Default for Settings {
    fn default() -> Self {
        let intermediate_dir = PathBuf::from("intermediate_files");
        Self {
            watch_dir: PathBuf::from("jasen_out"),
            results_base: intermediate_dir.join("profiles_for_reportree"),
            cluster_base: intermediate_dir.join("clusters"),
            intermediate_dir,
            host_intermediate_dir: None,
            poll_interval_secs: 30,
            cluster_threshold: 10,
            profiler: ProfilerSettings::default(),
            clustering: ClusteringSettings::default(),
            reference: ReferenceSettings::default(),
            alerts: AlertSettings::default(),
        }
    }
}

/// External profiling tool invoked per batch of new JSON files
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ProfilerSettings {
    pub program: String,
    /// Arguments placed before `<results_base> <label> <files...>`
    pub args: Vec<String>,
    /// Case-insensitive suffix of raw input files
    pub input_suffix: String,
}

impl Default for ProfilerSettings {
    fn default() -> Self {
        Self {
            program: "Rscript".to_string(),
            args: vec!["R/process_json.R".to_string()],
            input_suffix: ".json".to_string(),
        }
    }
}

/// Containerized ReporTree invocation
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ClusteringSettings {
    pub docker: String,
    pub image: String,
    pub method: String,
    pub analysis: String,
    pub columns_summary_report: String,
    /// `uid:gid` for `docker --user`; defaults to the owner of `intermediate_dir`
    pub container_user: Option<String>,
}

impl Default for ClusteringSettings {
    fn default() -> Self {
        Self {
            docker: "docker".to_string(),
            image: "insapathogenomics/reportree".to_string(),
            method: "MSTreeV2".to_string(),
            analysis: "grapetree".to_string(),
            columns_summary_report: "Region,n_Region".to_string(),
            container_user: None,
        }
    }
}

/// Reference dataset maintenance
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ReferenceSettings {
    /// Reference dataset directory (`REF_DIR`); reference chaining is off when unset
    pub ref_dir: Option<PathBuf>,
    /// Lock time-to-live in seconds (`REF_LOCK_TTL`)
    pub lock_ttl_secs: u64,
    /// Remove stale locks (`REF_LOCK_FORCE`)
    pub force: bool,
    /// Interpreter for the reference scripts (`PYTHON`)
    pub python: String,
    /// Directory holding append/rebuild/compare scripts
    pub scripts_dir: PathBuf,
}

impl Default for ReferenceSettings {
    fn default() -> Self {
        Self {
            ref_dir: None,
            lock_ttl_secs: 3600,
            force: false,
            python: "python3".to_string(),
            scripts_dir: PathBuf::from("fast_profiles"),
        }
    }
}

/// Alert delivery
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct AlertSettings {
    /// Desktop notifier invoked as `<command...> <title> <body>`; empty disables it
    pub notify_command: Vec<String>,
    /// Where reference match tables are written (`ALERTS_DIR`)
    pub alerts_dir: PathBuf,
}

impl Default for AlertSettings {
    fn default() -> Self {
        Self {
            notify_command: vec!["notify-send".to_string()],
            alerts_dir: PathBuf::from("fast_profiles").join("alerts"),
        }
    }
}

// ============================================================================
// Resolution
// ============================================================================

impl Settings {
    /// Load settings: TOML file (explicit path or platform default), then
    /// environment overrides, then validation.
    ///
    /// An explicit `config_path` that does not exist is a configuration error;
    /// a missing default config file is not.
    pub fn load(config_path: Option<&Path>) -> Result<Self> {
        let mut settings = match config_path {
            Some(path) => {
                if !path.exists() {
                    return Err(Error::Config(format!(
                        "Config file not found: {}",
                        path.display()
                    )));
                }
                Self::from_toml_file(path)?
            }
            None => match default_config_file() {
                Some(path) => Self::from_toml_file(&path)?,
                None => {
                    warn!("No config file found, using compiled defaults");
                    Self::default()
                }
            },
        };

        settings.apply_env()?;
        settings.validate()?;
        Ok(settings)
    }

    /// Parse a TOML config file; absent fields take compiled defaults
    pub fn from_toml_file(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path).map_err(|source| Error::ConfigRead {
            path: path.to_path_buf(),
            source,
        })?;
        let settings = toml::from_str(&content).map_err(|source| Error::ConfigParse {
            path: path.to_path_buf(),
            source,
        })?;
        info!("Loaded config file: {}", path.display());
        Ok(settings)
    }

    /// Override fields from environment variables
    pub fn apply_env(&mut self) -> Result<()> {
        if let Some(v) = env_path("WATCH_DIR") {
            self.watch_dir = v;
        }
        if let Some(v) = env_path("RESULTS_BASE") {
            self.results_base = v;
        }
        if let Some(v) = env_path("CLUSTER_BASE") {
            self.cluster_base = v;
        }
        if let Some(v) = env_path("HOST_RESULTS_BASE") {
            self.host_intermediate_dir = Some(v);
        }
        if let Some(v) = env_parse("POLL_INTERVAL_SECS")? {
            self.poll_interval_secs = v;
        }
        if let Some(v) = env_parse("CLUSTER_THRESHOLD")? {
            self.cluster_threshold = v;
        }
        if let Some(v) = env_path("ALERTS_DIR") {
            self.alerts.alerts_dir = v;
        }
        if let Some(v) = env_path("REF_DIR") {
            self.reference.ref_dir = Some(v);
        }
        if let Some(v) = env_parse("REF_LOCK_TTL")? {
            self.reference.lock_ttl_secs = v;
        }
        if let Some(v) = env_bool("REF_LOCK_FORCE")? {
            self.reference.force = v;
        }
        if let Ok(v) = std::env::var("PYTHON") {
            if !v.trim().is_empty() {
                self.reference.python = v;
            }
        }
        Ok(())
    }

    /// Reject values no pipeline stage can run with
    pub fn validate(&self) -> Result<()> {
        if self.poll_interval_secs == 0 {
            return Err(Error::Config("poll_interval_secs must be greater than 0".to_string()));
        }
        if self.cluster_threshold == 0 {
            return Err(Error::Config("cluster_threshold must be greater than 0".to_string()));
        }
        if self.profiler.program.trim().is_empty() {
            return Err(Error::Config("profiler.program must not be empty".to_string()));
        }
        if self.profiler.input_suffix.is_empty() {
            return Err(Error::Config("profiler.input_suffix must not be empty".to_string()));
        }
        Ok(())
    }

    pub fn poll_interval(&self) -> Duration {
        Duration::from_secs(self.poll_interval_secs)
    }

    pub fn lock_ttl(&self) -> Duration {
        Duration::from_secs(self.reference.lock_ttl_secs)
    }
}

/// Platform config file: `<config_dir>/smittvarnings/config.toml`, then
/// `/etc/smittvarnings/config.toml` on Linux
fn default_config_file() -> Option<PathBuf> {
    let user_config = dirs::config_dir().map(|d| d.join(APP_DIR).join("config.toml"));
    if let Some(path) = user_config {
        if path.exists() {
            return Some(path);
        }
    }

    if cfg!(target_os = "linux") {
        let system_config = PathBuf::from("/etc").join(APP_DIR).join("config.toml");
        if system_config.exists() {
            return Some(system_config);
        }
    }

    None
}

fn env_path(name: &str) -> Option<PathBuf> {
    std::env::var_os(name)
        .filter(|v| !v.is_empty())
        .map(PathBuf::from)
}

fn env_parse<T: FromStr>(name: &str) -> Result<Option<T>>
where
    T::Err: std::fmt::Display,
{
    match std::env::var(name) {
        Ok(raw) if !raw.trim().is_empty() => raw
            .trim()
            .parse()
            .map(Some)
            .map_err(|e| Error::Config(format!("{}={:?}: {}", name, raw, e))),
        _ => Ok(None),
    }
}

fn env_bool(name: &str) -> Result<Option<bool>> {
    match std::env::var(name) {
        Ok(raw) => match raw.trim().to_ascii_lowercase().as_str() {
            "" => Ok(None),
            "1" | "true" | "yes" | "on" => Ok(Some(true)),
            "0" | "false" | "no" | "off" => Ok(Some(false)),
            other => Err(Error::Config(format!("{}={:?} is not a boolean", name, other))),
        },
        Err(_) => Ok(None),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults_are_valid() {
        let settings = Settings::default();
        settings.validate().unwrap();
        assert_eq!(settings.poll_interval(), Duration::from_secs(30));
        assert_eq!(settings.cluster_threshold, 10);
        assert_eq!(settings.lock_ttl(), Duration::from_secs(3600));
        assert!(settings.results_base.starts_with(&settings.intermediate_dir));
        assert!(settings.cluster_base.starts_with(&settings.intermediate_dir));
    }

    #[test]
    fn test_partial_toml_keeps_defaults() {
        let settings: Settings = toml::from_str(
            r#"
            poll_interval_secs = 5

            [reference]
            lock_ttl_secs = 60
            "#,
        )
        .unwrap();

        assert_eq!(settings.poll_interval_secs, 5);
        assert_eq!(settings.reference.lock_ttl_secs, 60);
        assert_eq!(settings.reference.python, "python3");
        assert_eq!(settings.profiler.program, "Rscript");
    }

    #[test]
    fn test_zero_interval_rejected() {
        let settings = Settings {
            poll_interval_secs: 0,
            ..Settings::default()
        };
        assert!(matches!(settings.validate(), Err(Error::Config(_))));
    }
}
