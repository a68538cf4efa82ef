//! smitt-watch - pipeline stage watchers
//!
//! Each subcommand runs one stage. Deployments start one process per stage:
//!
//! ```text
//! smitt-watch profiles                 # raw JSON -> profiles
//! smitt-watch clusters                 # profiles -> clusters + alerts
//! smitt-watch clusters --mode additional
//! smitt-watch alerts [DIR]             # one-off alert scan
//! ```

use std::path::PathBuf;
use std::process::ExitCode;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use smitt_common::config::Settings;
use smitt_watch::alert::{self, AlertSink, CommandSink, LogSink};
use smitt_watch::clustering::{self, ClusterMode};
use smitt_watch::scanner::FileScanner;
use smitt_watch::{profiling, shutdown_signal, Engine, Stage};
use tracing::{info, warn};

/// Command-line arguments for smitt-watch
#[derive(Parser, Debug)]
#[command(name = "smitt-watch")]
#[command(about = "Filesystem watchers for the smittvarnings pipeline")]
#[command(version)]
struct Args {
    /// Config file (TOML); defaults to the platform config location
    #[arg(short, long, env = "SMITT_CONFIG", global = true)]
    config: Option<PathBuf>,

    /// Poll once, wait for started tools, then exit
    #[arg(long, global = true)]
    once: bool,

    /// Seconds between polls
    #[arg(long, global = true)]
    poll_interval_secs: Option<u64>,

    /// Allelic distance threshold for clustering and alerts
    #[arg(long, global = true)]
    threshold: Option<u32>,

    /// Log alerts only; do not run the desktop notifier
    #[arg(long, global = true)]
    no_notify: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Debug, Subcommand)]
enum Commands {
    /// Profile new JSON files, one tool call per batch subfolder
    Profiles {
        /// Root holding batch subfolders of JSON files
        #[arg(long)]
        watch_dir: Option<PathBuf>,

        /// Output tree for profile and metadata tables
        #[arg(long)]
        results_base: Option<PathBuf>,
    },

    /// Cluster new profile/metadata pairs and raise alerts
    Clusters {
        #[arg(long, value_enum, default_value_t = ClusterMode::Initial)]
        mode: ClusterMode,
    },

    /// Scan cluster compositions for multi-sample clusters
    Alerts {
        /// Folder to scan; defaults to every batch folder of the cluster tree
        dir: Option<PathBuf>,
    },
}

#[tokio::main(flavor = "current_thread")]
async fn main() -> Result<ExitCode> {
    smitt_watch::init_tracing();

    let args = Args::parse();
    let mut settings = Settings::load(args.config.as_deref()).context("Failed to load configuration")?;
    if let Some(secs) = args.poll_interval_secs {
        settings.poll_interval_secs = secs;
    }
    if let Some(threshold) = args.threshold {
        settings.cluster_threshold = threshold;
    }

    let stage = match args.command {
        Commands::Profiles {
            watch_dir,
            results_base,
        } => {
            if let Some(dir) = watch_dir {
                settings.watch_dir = dir;
            }
            if let Some(dir) = results_base {
                settings.results_base = dir;
            }
            settings.validate().context("Invalid configuration")?;
            info!("Watch root: {}", settings.watch_dir.display());
            info!("Results base: {}", settings.results_base.display());
            if let Some(ref_dir) = &settings.reference.ref_dir {
                info!("Reference dataset: {}", ref_dir.display());
            }
            profiling::profile_stage(&settings, sinks(&settings, args.no_notify))
        }
        Commands::Clusters { mode } => {
            settings.validate().context("Invalid configuration")?;
            std::fs::create_dir_all(&settings.cluster_base).with_context(|| {
                format!("Failed to create {}", settings.cluster_base.display())
            })?;
            info!("Results base: {}", settings.results_base.display());
            info!("Cluster base: {}", settings.cluster_base.display());
            clustering::cluster_stage(&settings, mode, sinks(&settings, args.no_notify))
                .context("Failed to set up clustering stage")?
        }
        Commands::Alerts { dir } => {
            settings.validate().context("Invalid configuration")?;
            scan_alerts(&settings, dir, args.no_notify).await;
            return Ok(ExitCode::SUCCESS);
        }
    };

    run_stage(stage, &settings, args.once).await
}

async fn run_stage(stage: Stage, settings: &Settings, once: bool) -> Result<ExitCode> {
    let mut engine = Engine::new(stage);

    if once {
        let report = engine.run_once().await;
        info!(
            stage = engine.stage_name(),
            succeeded = report.succeeded(),
            failed = report.failed(),
            deferred = report.deferred,
            "Single pass complete"
        );
        if report.had_launch_failure() {
            return Ok(ExitCode::FAILURE);
        }
        return Ok(ExitCode::SUCCESS);
    }

    engine
        .run_forever(settings.poll_interval(), shutdown_signal())
        .await;
    Ok(ExitCode::SUCCESS)
}

fn sinks(settings: &Settings, no_notify: bool) -> Vec<Box<dyn AlertSink>> {
    let mut sinks: Vec<Box<dyn AlertSink>> = vec![Box::new(LogSink)];
    if !no_notify {
        if let Some(notifier) = CommandSink::new(settings.alerts.notify_command.clone()) {
            sinks.push(Box::new(notifier));
        }
    }
    sinks
}

async fn scan_alerts(settings: &Settings, dir: Option<PathBuf>, no_notify: bool) {
    let dirs = match dir {
        Some(dir) => vec![dir],
        None => match FileScanner::subfolders(&settings.cluster_base) {
            Ok(subs) => subs.iter().map(|s| settings.cluster_base.join(s)).collect(),
            Err(e) => {
                warn!("Cluster tree unavailable: {}", e);
                Vec::new()
            }
        },
    };

    let sinks = sinks(settings, no_notify);
    let mut total = 0;
    for dir in dirs {
        info!("Checking clusters in {}", dir.display());
        let alerts = alert::scan_clusters(&dir, settings.cluster_threshold);
        total += alerts.len();
        alert::dispatch(&alerts, &sinks).await;
    }
    info!(alerts = total, "Alert scan complete");
}
