//! Starting and stopping containers.
//!
//! Plans and commands decide *when* a container starts or stops; a
//! [`LifecycleDriver`] decides *how*. The production driver goes through
//! the control channel as the container's owner.

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use corral_common::error::{CorralError, Result};
use corral_common::types::ContainerState;

use crate::control::{CommandId, Frontend, RunnerOptions};
use crate::entity::Container;
use crate::monitor;
use crate::registry::Registry;

/// Options of a container start.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct StartOptions {
    /// Restart the container when it is already running.
    pub force: bool,
    /// Verbose LXC logging.
    pub debug: bool,
}

/// Options of a container stop.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct StopOptions {
    /// Kill instead of shutting down cleanly.
    pub kill: bool,
    /// Time allowed for a clean shutdown.
    pub timeout: Option<Duration>,
    /// Reason logged with the stop.
    pub message: Option<String>,
}

/// Performs container starts and stops.
///
/// Implementations report every state change through
/// [`monitor::report_state`] so that waiters observe the progression.
pub trait LifecycleDriver: Send + Sync {
    /// Starts `ct`, returning once the start was initiated.
    ///
    /// # Errors
    ///
    /// Returns an error if the start could not be initiated.
    fn start(&self, registry: &Registry, ct: &Arc<Container>, opts: &StartOptions) -> Result<()>;

    /// Stops `ct`, returning once it is stopped.
    ///
    /// # Errors
    ///
    /// Returns an error if the container could not be stopped.
    fn stop(&self, registry: &Registry, ct: &Arc<Container>, opts: &StopOptions) -> Result<()>;
}

/// Drives containers with `lxc-start`/`lxc-stop` executed by the runner.
#[derive(Debug, Clone)]
pub struct LxcDriver {
    frontend: Frontend,
    cgroup_root: Option<PathBuf>,
}

impl LxcDriver {
    /// A driver using `frontend`; runners join container cgroups below
    /// `cgroup_root` when set.
    #[must_use]
    pub const fn new(frontend: Frontend, cgroup_root: Option<PathBuf>) -> Self {
        Self { frontend, cgroup_root }
    }
}

impl LifecycleDriver for LxcDriver {
    fn start(&self, registry: &Registry, ct: &Arc<Container>, opts: &StartOptions) -> Result<()> {
        if let Some(root) = &self.cgroup_root {
            corral_core::cgroup::ensure(&corral_core::cgroup::abs_path(root, &ct.entry_cgroup_path()))?;
        }
        monitor::report_state(registry, ct, ContainerState::Starting);
        let target = ct.runner_target(self.cgroup_root.as_deref());
        let result = self
            .frontend
            .exec_runner(&target, CommandId::LxcStart, RunnerOptions::new().kwarg("debug", opts.debug));
        match result.and_then(|r| r.into_result()) {
            Ok(_) => {
                monitor::report_state(registry, ct, ContainerState::Running);
                Ok(())
            }
            Err(e) => {
                tracing::warn!(pool = ct.pool(), id = ct.id(), error = %e, "container failed to start");
                monitor::report_state(registry, ct, ContainerState::Stopped);
                Err(e)
            }
        }
    }

    fn stop(&self, registry: &Registry, ct: &Arc<Container>, opts: &StopOptions) -> Result<()> {
        let previous = ct.state();
        if let Some(message) = &opts.message {
            tracing::info!(pool = ct.pool(), id = ct.id(), message = %message, "stopping container");
        }
        monitor::report_state(registry, ct, ContainerState::Stopping);
        let mut runner_opts = RunnerOptions::new().kwarg("kill", opts.kill);
        if let Some(timeout) = opts.timeout {
            runner_opts = runner_opts.kwarg("timeout", timeout.as_secs());
        }
        let target = ct.runner_target(self.cgroup_root.as_deref());
        let result = self.frontend.exec_runner(&target, CommandId::LxcStop, runner_opts);
        match result.and_then(|r| r.into_result()) {
            Ok(_) => {
                monitor::report_state(registry, ct, ContainerState::Stopped);
                Ok(())
            }
            Err(e) => {
                monitor::report_state(registry, ct, previous);
                Err(CorralError::CommandFailed {
                    message: format!("unable to stop container {}: {e}", ct.ident()),
                })
            }
        }
    }
}
