//! `corrald check`: validate the configuration.

use clap::Args;
use corral_common::config::DaemonConfig;
use corral_runtime::event::EventBus;
use corral_runtime::lock::LockManager;
use corral_runtime::registry::Registry;

use crate::output;

/// Arguments for the `check` command.
#[derive(Args, Debug)]
pub struct CheckArgs {
    /// Also list the containers of every pool.
    #[arg(short, long)]
    pub containers: bool,
}

/// Executes the `check` command.
///
/// # Errors
///
/// Returns an error if the configuration does not describe a valid set of
/// pools.
pub fn execute(cfg: &DaemonConfig, args: &CheckArgs) -> anyhow::Result<()> {
    let registry = Registry::load(cfg, LockManager::new(), EventBus::new())?;
    let pools = registry.pools();
    if pools.is_empty() {
        println!("No pools configured.");
        return Ok(());
    }

    println!("{}", output::pool_header());
    for pool in &pools {
        let containers = registry.containers_of(pool.name());
        println!("{}", output::pool_row(pool, containers.len()));
    }

    if args.containers {
        println!();
        println!("{}", output::container_header());
        for ct in registry.containers() {
            println!("{}", output::container_row(&ct));
        }
    }
    Ok(())
}
