//! CLI command definitions and dispatch.

pub mod check;
pub mod exec;
pub mod run;

use std::path::PathBuf;

use anyhow::Context;
use clap::{Parser, Subcommand};
use corral_common::config::DaemonConfig;

/// corrald: container daemon with prioritized autostart.
#[derive(Parser, Debug)]
#[command(name = "corrald", version, about, long_about = None)]
pub struct Cli {
    /// Subcommand to execute.
    #[command(subcommand)]
    pub command: Command,

    /// Path to the daemon configuration.
    #[arg(
        long,
        global = true,
        env = "CORRALD_CONFIG",
        default_value = corral_common::constants::DEFAULT_CONFIG_FILE
    )]
    pub config: PathBuf,

    /// Log level used when `RUST_LOG` is unset (trace, debug, info, warn, error).
    #[arg(long, global = true, default_value = "info")]
    pub log_level: String,
}

/// Available CLI subcommands.
#[derive(Subcommand, Debug)]
pub enum Command {
    /// Run the daemon until interrupted.
    Run(run::RunArgs),
    /// Validate the configuration and print the pools it defines.
    Check(check::CheckArgs),
    /// Execute a program inside a container as its owner.
    Exec(exec::ExecArgs),
}

/// Dispatches the parsed CLI command to its handler.
///
/// # Errors
///
/// Returns an error if the configuration cannot be loaded or the command
/// fails.
pub fn execute(cli: Cli) -> anyhow::Result<()> {
    let cfg = load_config(&cli.config)?;
    match cli.command {
        Command::Run(args) => run::execute(&cfg, &args),
        Command::Check(args) => check::execute(&cfg, &args),
        Command::Exec(args) => exec::execute(&cfg, args),
    }
}

fn load_config(path: &std::path::Path) -> anyhow::Result<DaemonConfig> {
    if path.exists() {
        DaemonConfig::load(path).with_context(|| format!("failed to load config from {}", path.display()))
    } else {
        tracing::warn!(path = %path.display(), "config file not found, using defaults");
        Ok(DaemonConfig::default())
    }
}
