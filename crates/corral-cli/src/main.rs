//! # corrald: the corral container daemon
//!
//! Loads pools from the configuration, starts autostart containers by
//! priority and stops everything on shutdown.

mod commands;
mod output;

use clap::Parser;

use crate::commands::Cli;

fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| cli.log_level.as_str().into()),
        )
        .init();

    commands::execute(cli)
}
