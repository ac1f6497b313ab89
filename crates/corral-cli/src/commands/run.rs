//! `corrald run`: serve until interrupted.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use clap::Args;
use corral_common::config::DaemonConfig;
use corral_runtime::commands::Daemon;
use corral_runtime::event::EventBus;
use corral_runtime::lock::LockManager;
use corral_runtime::registry::Registry;

/// Arguments for the `run` command.
#[derive(Args, Debug)]
pub struct RunArgs {
    /// Do not start autostart containers.
    #[arg(long)]
    pub no_autostart: bool,

    /// Restart autostart containers that are already running.
    #[arg(long, conflicts_with = "no_autostart")]
    pub force: bool,
}

/// Executes the `run` command.
///
/// Builds the registry, schedules autostart, waits for Ctrl+C or SIGTERM
/// and stops all containers before returning.
///
/// # Errors
///
/// Returns an error if the registry cannot be built, the runner is
/// missing, or the signal handler cannot be installed.
pub fn execute(cfg: &DaemonConfig, args: &RunArgs) -> anyhow::Result<()> {
    tracing::info!(version = env!("CARGO_PKG_VERSION"), "corrald starting");

    let registry = Registry::load(cfg, LockManager::new(), EventBus::new())?;
    let daemon = Daemon::from_config(cfg, registry)?;

    if args.no_autostart {
        tracing::info!("autostart disabled");
    } else {
        let queued = daemon.autostart_all(args.force);
        tracing::info!(queued, "autostart scheduled");
    }

    let running = Arc::new(AtomicBool::new(true));
    let r = Arc::clone(&running);
    ctrlc::set_handler(move || {
        r.store(false, Ordering::SeqCst);
    })
    .map_err(|e| anyhow::anyhow!("failed to set signal handler: {e}"))?;

    while running.load(Ordering::SeqCst) {
        std::thread::sleep(Duration::from_millis(250));
    }

    tracing::info!("shutting down");
    daemon.shutdown(Some("daemon shutdown"));
    tracing::info!("all pools stopped");
    Ok(())
}
