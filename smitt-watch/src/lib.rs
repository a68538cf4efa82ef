//! # smittvarnings watchers
//!
//! Filesystem-driven pipeline stages:
//! - **profiles**: raw JSON batches -> allele profile and metadata tables
//! - **clusters**: profile/metadata pairs -> ReporTree clusters -> alerts
//!
//! Stages never talk to each other. Each watches a directory tree on a fixed
//! interval, starts an external tool for inputs it has not processed yet,
//! and records an input as processed only when the tool exits successfully.
//! The output tree of one stage is the watch root of the next.

pub mod alert;
pub mod clustering;
pub mod engine;
pub mod error;
pub mod pairing;
pub mod profiling;
pub mod reference;
pub mod runner;
pub mod scanner;
pub mod stage;

pub use engine::{Engine, GroupReport, TickReport};
pub use error::{Error, Result};
pub use runner::{CommandSpec, RunOutcome};
pub use stage::{Grouping, Stage, WorkGroup, WorkUnit};

use tokio::signal;
use tracing::{error, info};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

/// Install the fmt subscriber; `RUST_LOG` overrides the default filter
pub fn init_tracing() {
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "smitt_watch=info,smitt_common=info,smitt_ref=info".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();
}

/// Completes on Ctrl+C or SIGTERM
///
/// If a handler cannot be installed the error is logged and that signal is
/// never reported.
pub async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = signal::ctrl_c().await {
            error!("Failed to install Ctrl+C handler: {}", e);
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match signal::unix::signal(signal::unix::SignalKind::terminate()) {
            Ok(mut stream) => {
                stream.recv().await;
            }
            Err(e) => {
                error!("Failed to install SIGTERM handler: {}", e);
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {
            info!("Received Ctrl+C, shutting down");
        },
        _ = terminate => {
            info!("Received terminate signal, shutting down");
        },
    }
}
