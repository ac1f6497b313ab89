//! `corrald exec`: run a program as a container's owner.

use clap::Args;
use corral_common::config::DaemonConfig;
use corral_runtime::commands::Daemon;
use corral_runtime::control::RunnerOptions;
use corral_runtime::event::EventBus;
use corral_runtime::lock::LockManager;
use corral_runtime::registry::Registry;

/// Arguments for the `exec` command.
#[derive(Args, Debug)]
pub struct ExecArgs {
    /// Target container as `<pool>:<id>`.
    pub container: String,

    /// Program and its arguments.
    #[arg(trailing_var_arg = true, required = true)]
    pub argv: Vec<String>,

    /// Kill the program after this many seconds.
    #[arg(long)]
    pub timeout: Option<u64>,
}

/// Executes the `exec` command and exits with the program's status.
///
/// # Errors
///
/// Returns an error if the container is unknown, busy, or the runner
/// reports a failure.
pub fn execute(cfg: &DaemonConfig, args: ExecArgs) -> anyhow::Result<()> {
    let (pool, id) = args
        .container
        .split_once(':')
        .ok_or_else(|| anyhow::anyhow!("expected <pool>:<id>, got '{}'", args.container))?;

    let registry = Registry::load(cfg, LockManager::new(), EventBus::new())?;
    let daemon = Daemon::from_config(cfg, registry)?;

    let mut opts = RunnerOptions::new();
    if let Some(secs) = args.timeout {
        opts = opts.timeout(std::time::Duration::from_secs(secs));
    }
    let result = daemon.ct_runscript(pool, id, args.argv, opts)?;
    let status = result.into_result()?;
    let code = status.as_i64().and_then(|c| i32::try_from(c).ok()).unwrap_or(1);
    tracing::debug!(pool, id, code, "program finished");
    std::process::exit(code);
}
