//! Privilege-separated execution of container control commands.
//!
//! The daemon never touches a container owner's LXC state with its own
//! privileges. Instead a [`Frontend`] hands the work to a runner that has
//! switched to the owner's identity, joined the container's cgroup and
//! applied its resource limits. The runner is either a freshly executed
//! `corral-ct-runner` ([`Frontend::exec_runner`]) or a forked copy of the
//! daemon ([`Frontend::fork_runner`]).

mod builtin;
mod frontend;
mod runner;
mod wire;

use std::collections::HashMap;
use std::fmt;
use std::fs::File;
use std::os::fd::{AsRawFd, RawFd};
use std::str::FromStr;
use std::sync::Arc;

use corral_common::error::{CorralError, Result};
use serde_json::{Map, Value};

pub use builtin::{Exec, Identity, LxcStart, LxcStop};
pub use frontend::{Frontend, RunnerOptions, RunnerTarget};
pub use runner::{RunnerContext, serve};
pub use wire::{CommandResult, RunnerRequest};

/// Identifier of a runner command.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum CommandId {
    /// Reports the identity the runner executes as.
    Identity,
    /// Executes an arbitrary program as the container owner.
    Exec,
    /// Starts the container with `lxc-start`.
    LxcStart,
    /// Stops the container with `lxc-stop`.
    LxcStop,
}

impl CommandId {
    /// All known commands.
    pub const ALL: [Self; 4] = [Self::Identity, Self::Exec, Self::LxcStart, Self::LxcStop];

    /// Wire name of the command.
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Identity => "identity",
            Self::Exec => "exec",
            Self::LxcStart => "lxc_start",
            Self::LxcStop => "lxc_stop",
        }
    }
}

impl fmt::Display for CommandId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for CommandId {
    type Err = CorralError;

    fn from_str(s: &str) -> Result<Self> {
        Self::ALL
            .into_iter()
            .find(|id| id.as_str() == s)
            .ok_or_else(|| CorralError::UnknownCommand { name: s.to_owned() })
    }
}

/// Code executed on the runner side of the channel.
///
/// Implementations run with the container owner's privileges, either in
/// the runner executable or in a forked child of the daemon.
pub trait Runner: Send + Sync {
    /// Executes the command and reports its outcome.
    fn execute(&self, ctx: &mut RunnerContext, args: &[Value], kwargs: &Map<String, Value>) -> CommandResult;
}

impl<F> Runner for F
where
    F: Fn(&mut RunnerContext, &[Value], &Map<String, Value>) -> CommandResult + Send + Sync,
{
    fn execute(&self, ctx: &mut RunnerContext, args: &[Value], kwargs: &Map<String, Value>) -> CommandResult {
        self(ctx, args, kwargs)
    }
}

/// Maps command identifiers to their runner implementation.
#[derive(Clone, Default)]
pub struct RunnerRegistry {
    runners: HashMap<CommandId, Arc<dyn Runner>>,
}

impl fmt::Debug for RunnerRegistry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RunnerRegistry")
            .field("commands", &self.runners.keys().collect::<Vec<_>>())
            .finish()
    }
}

impl RunnerRegistry {
    /// An empty registry.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Registry with every built-in command.
    #[must_use]
    pub fn builtin() -> Self {
        let mut registry = Self::new();
        registry
            .register(CommandId::Identity, Identity)
            .register(CommandId::Exec, Exec)
            .register(CommandId::LxcStart, LxcStart)
            .register(CommandId::LxcStop, LxcStop);
        registry
    }

    /// Registers or replaces the runner of `id`.
    pub fn register(&mut self, id: CommandId, runner: impl Runner + 'static) -> &mut Self {
        let _ = self.runners.insert(id, Arc::new(runner));
        self
    }

    /// Runner registered for `id`.
    #[must_use]
    pub fn get(&self, id: CommandId) -> Option<Arc<dyn Runner>> {
        self.runners.get(&id).cloned()
    }

    /// Resolves a wire name to its runner.
    ///
    /// # Errors
    ///
    /// Returns [`CorralError::UnknownCommand`] for names that are not known
    /// or not registered.
    pub fn resolve(&self, name: &str) -> Result<Arc<dyn Runner>> {
        let id: CommandId = name.parse()?;
        self.get(id)
            .ok_or_else(|| CorralError::UnknownCommand { name: name.to_owned() })
    }
}

/// Standard streams handed to a runner.
#[derive(Debug, Default)]
pub struct Stdio {
    /// Standard input, if redirected.
    pub stdin: Option<File>,
    /// Standard output, if redirected.
    pub stdout: Option<File>,
    /// Standard error, if redirected.
    pub stderr: Option<File>,
}

impl Stdio {
    /// Descriptors of the redirected streams.
    pub fn raw_fds(&self) -> impl Iterator<Item = RawFd> + '_ {
        [&self.stdin, &self.stdout, &self.stderr]
            .into_iter()
            .flatten()
            .map(AsRawFd::as_raw_fd)
    }
}
