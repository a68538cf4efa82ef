//! smitt-ref - reference dataset maintenance under the dataset lock
//!
//! Exit status:
//! - the reference tool's own exit code once it ran
//! - 2 for usage or configuration errors (the lock is not touched)
//! - 3 when another process holds the lock
//! - 4 when the lock is stale and `--force` was not given
//! - 1 when interrupted; the tool is killed before the lock is released

use std::path::PathBuf;
use std::process::ExitCode;

use clap::Parser;
use smitt_common::config::Settings;
use smitt_common::LockError;
use smitt_watch::reference::{RefAction, ReferenceManager};
use smitt_watch::runner::{classify, exit_zero, Supervised};
use smitt_watch::{shutdown_signal, Error, Result};
use tracing::{error, info, warn};

const EXIT_USAGE: u8 = 2;
const EXIT_BUSY: u8 = 3;
const EXIT_STALE: u8 = 4;
const EXIT_INTERRUPTED: u8 = 1;
const EXIT_LAUNCH_FAILED: u8 = 127;

/// Command-line arguments for smitt-ref
#[derive(Parser, Debug)]
#[command(name = "smitt-ref")]
#[command(about = "Lock-guarded maintenance of the shared reference dataset")]
#[command(version)]
struct Args {
    /// Operation to run
    #[arg(long, value_enum)]
    action: RefAction,

    /// Reference dataset directory (falls back to REF_DIR / config)
    #[arg(long)]
    ref_dir: Option<PathBuf>,

    /// New profile table; comma-separated inputs for rebuild
    #[arg(long = "new")]
    new_data: Option<String>,

    /// Allelic distance threshold for compare
    #[arg(long)]
    threshold: Option<u32>,

    /// Remove a stale lock instead of refusing
    #[arg(long)]
    force: bool,

    /// Lock time-to-live in seconds
    #[arg(long)]
    ttl: Option<u64>,

    /// Config file (TOML)
    #[arg(short, long, env = "SMITT_CONFIG")]
    config: Option<PathBuf>,
}

#[tokio::main(flavor = "current_thread")]
async fn main() -> ExitCode {
    smitt_watch::init_tracing();

    let args = Args::parse();
    match run(args).await {
        Ok(code) => ExitCode::from(code),
        Err(e) => {
            error!("{}", e);
            ExitCode::from(exit_code_for(&e))
        }
    }
}

async fn run(args: Args) -> Result<u8> {
    let mut settings = Settings::load(args.config.as_deref())?;
    if let Some(ttl) = args.ttl {
        settings.reference.lock_ttl_secs = ttl;
    }
    if args.force {
        settings.reference.force = true;
    }
    let threshold = args.threshold.unwrap_or(settings.cluster_threshold);
    let ref_dir = args
        .ref_dir
        .or_else(|| settings.reference.ref_dir.clone())
        .ok_or_else(|| Error::Config("--ref-dir is required".to_string()))?;

    let manager = ReferenceManager::from_settings(&settings);
    let spec = manager.command(
        args.action,
        &ref_dir,
        args.new_data.as_deref().unwrap_or(""),
        threshold,
    )?;

    let guard = manager.lock(&ref_dir)?;
    let mut child = match Supervised::spawn("reference", &spec) {
        Ok(child) => child,
        Err(e) => {
            error!(program = %spec.program.to_string_lossy(), error = %e, "Failed to start reference tool");
            guard.release()?;
            return Ok(EXIT_LAUNCH_FAILED);
        }
    };

    let code = tokio::select! {
        status = child.wait() => match status {
            Ok(status) => {
                let outcome = classify(status, exit_zero);
                info!(action = %args.action, code = outcome.exit_code(), "Reference tool finished");
                u8::try_from(outcome.exit_code()).unwrap_or(EXIT_INTERRUPTED)
            }
            Err(e) => {
                error!(error = %e, "Failed waiting for reference tool");
                EXIT_INTERRUPTED
            }
        },
        _ = shutdown_signal() => {
            if let Err(e) = child.kill().await {
                warn!(error = %e, "Failed to kill reference tool");
            }
            EXIT_INTERRUPTED
        }
    };

    guard.release()?;
    Ok(code)
}

fn exit_code_for(error: &Error) -> u8 {
    match error {
        Error::Lock(LockError::Busy { .. }) => EXIT_BUSY,
        Error::Lock(LockError::StaleRequiresForce { .. }) => EXIT_STALE,
        Error::Config(_) => EXIT_USAGE,
        Error::Common(e) if e.is_config() => EXIT_USAGE,
        _ => 1,
    }
}
