//! Daemon side of the control channel.

use std::ffi::CString;
use std::fs::File;
use std::io::{ErrorKind, Read, Write};
use std::os::fd::{AsFd, AsRawFd, OwnedFd, RawFd};
use std::os::unix::process::CommandExt;
use std::path::{Path, PathBuf};
use std::process::{Child, Command, Stdio as ProcessStdio};
use std::time::{Duration, Instant};

use corral_common::constants::RUNNER_BIN_NAME;
use corral_common::error::{CorralError, Result};
use corral_common::types::{PrLimit, UserIdentity};
use corral_core::switch_user::{PrivilegeDrop, SwitchTarget, close_other_fds};
use nix::errno::Errno;
use nix::fcntl::OFlag;
use nix::poll::{PollFd, PollFlags, PollTimeout, poll};
use nix::sys::signal::{Signal, kill};
use nix::sys::wait::waitpid;
use nix::unistd::{ForkResult, Pid, fork, getegid, geteuid, pipe2};
use serde_json::{Map, Value};

use super::runner::RunnerContext;
use super::wire::{CommandResult, RunnerRequest};
use super::{CommandId, Runner, Stdio};

/// Interval between deadline checks while a timeout is armed.
const POLL_INTERVAL_MS: u16 = 1000;

/// Everything a runner needs to know about the container it acts on.
#[derive(Debug, Clone)]
pub struct RunnerTarget {
    /// Pool name.
    pub pool: String,
    /// Container ID.
    pub id: String,
    /// LXC home of the container's user/group.
    pub lxc_home: PathBuf,
    /// Container log file.
    pub log_file: PathBuf,
    /// Owner the runner switches to.
    pub user: UserIdentity,
    /// Cgroup the exec'd runner joins, absolute.
    pub cgroup: Option<PathBuf>,
    /// Resource limits applied before the switch.
    pub prlimits: Vec<PrLimit>,
}

impl RunnerTarget {
    /// Process title of a runner executing `command`.
    #[must_use]
    pub fn title(&self, command: &str) -> String {
        format!("corrald: {}:{} runner:{command}", self.pool, self.id)
    }

    fn context(&self, stdio: Stdio) -> RunnerContext {
        RunnerContext {
            pool: self.pool.clone(),
            id: self.id.clone(),
            lxc_home: self.lxc_home.clone(),
            user_home: self.user.home.clone(),
            log_file: self.log_file.clone(),
            stdio,
        }
    }

    fn switch_target(&self, switch_user: bool) -> SwitchTarget {
        let mut target = SwitchTarget::from_identity(&self.user);
        if !switch_user {
            target.uid = geteuid();
            target.gid = getegid();
        }
        target
    }
}

/// Per-invocation options of a runner.
#[derive(Debug)]
pub struct RunnerOptions {
    /// Positional arguments.
    pub args: Vec<Value>,
    /// Named arguments.
    pub kwargs: Map<String, Value>,
    /// Standard input handed to the command.
    pub stdin: Option<OwnedFd>,
    /// Standard output handed to the command.
    pub stdout: Option<OwnedFd>,
    /// Standard error handed to the command.
    pub stderr: Option<OwnedFd>,
    /// Kill the runner when no result arrived in time.
    pub timeout: Option<Duration>,
    /// Switch to the container owner; when off the runner keeps the
    /// daemon's identity.
    pub switch_user: bool,
}

impl Default for RunnerOptions {
    fn default() -> Self {
        Self {
            args: Vec::new(),
            kwargs: Map::new(),
            stdin: None,
            stdout: None,
            stderr: None,
            timeout: None,
            switch_user: true,
        }
    }
}

impl RunnerOptions {
    /// Default options.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Sets positional arguments.
    #[must_use]
    pub fn args(mut self, args: impl IntoIterator<Item = impl Into<Value>>) -> Self {
        self.args = args.into_iter().map(Into::into).collect();
        self
    }

    /// Sets one named argument.
    #[must_use]
    pub fn kwarg(mut self, key: impl Into<String>, value: impl Into<Value>) -> Self {
        let _ = self.kwargs.insert(key.into(), value.into());
        self
    }

    /// Arms a timeout.
    #[must_use]
    pub fn timeout(mut self, timeout: Duration) -> Self {
        self.timeout = Some(timeout);
        self
    }

    /// Redirects standard output.
    #[must_use]
    pub fn stdout(mut self, fd: impl Into<OwnedFd>) -> Self {
        self.stdout = Some(fd.into());
        self
    }

    /// Redirects standard input.
    #[must_use]
    pub fn stdin(mut self, fd: impl Into<OwnedFd>) -> Self {
        self.stdin = Some(fd.into());
        self
    }

    /// Redirects standard error.
    #[must_use]
    pub fn stderr(mut self, fd: impl Into<OwnedFd>) -> Self {
        self.stderr = Some(fd.into());
        self
    }

    /// Keeps the daemon's identity in the runner.
    #[must_use]
    pub fn without_switch(mut self) -> Self {
        self.switch_user = false;
        self
    }
}

/// Launches runners and collects their results.
#[derive(Debug, Clone)]
pub struct Frontend {
    runner_path: PathBuf,
    default_timeout: Option<Duration>,
}

impl Frontend {
    /// A frontend executing the runner at `runner_path`.
    #[must_use]
    pub fn new(runner_path: impl Into<PathBuf>) -> Self {
        Self {
            runner_path: runner_path.into(),
            default_timeout: None,
        }
    }

    /// Finds the runner executable.
    ///
    /// Looks at `configured` first, then next to the current executable,
    /// then in `PATH`.
    ///
    /// # Errors
    ///
    /// Returns [`CorralError::NotFound`] if no runner executable exists.
    pub fn locate(configured: Option<&Path>) -> Result<Self> {
        if let Some(path) = configured {
            if path.is_file() {
                return Ok(Self::new(path));
            }
            return Err(CorralError::NotFound {
                kind: "runner",
                id: path.display().to_string(),
            });
        }
        let sibling = std::env::current_exe()
            .ok()
            .and_then(|exe| exe.parent().map(|dir| dir.join(RUNNER_BIN_NAME)))
            .filter(|path| path.is_file());
        if let Some(path) = sibling {
            return Ok(Self::new(path));
        }
        which::which(RUNNER_BIN_NAME)
            .map(Self::new)
            .map_err(|_| CorralError::NotFound {
                kind: "runner",
                id: RUNNER_BIN_NAME.to_owned(),
            })
    }

    /// Timeout used when a call does not set its own.
    #[must_use]
    pub fn with_default_timeout(mut self, timeout: Option<Duration>) -> Self {
        self.default_timeout = timeout;
        self
    }

    /// Path of the runner executable.
    #[must_use]
    pub fn runner_path(&self) -> &Path {
        &self.runner_path
    }

    /// Runs `command` in a freshly executed runner process.
    ///
    /// The child applies the container's resource limits, joins its cgroup,
    /// switches to its owner and executes the runner, which reads the
    /// request from standard input.
    ///
    /// # Errors
    ///
    /// Returns an error if the channel cannot be set up or the runner
    /// cannot be spawned. Failures after that are reported as a flagged
    /// [`CommandResult`].
    pub fn exec_runner(&self, target: &RunnerTarget, command: CommandId, opts: RunnerOptions) -> Result<CommandResult> {
        let RunnerOptions {
            args,
            kwargs,
            stdin,
            stdout,
            stderr,
            timeout,
            switch_user,
        } = opts;
        let (cmd_r, cmd_w) = pipe2(OFlag::O_CLOEXEC).map_err(|e| CorralError::system("pipe", e))?;
        let (ret_r, ret_w) = pipe2(OFlag::O_CLOEXEC).map_err(|e| CorralError::system("pipe", e))?;

        let raw = |fd: &Option<OwnedFd>| fd.as_ref().map(AsRawFd::as_raw_fd);
        let request = RunnerRequest {
            name: command.as_str().to_owned(),
            pool: target.pool.clone(),
            id: target.id.clone(),
            lxc_home: target.lxc_home.clone(),
            user_home: target.user.home.clone(),
            log_file: target.log_file.clone(),
            args,
            kwargs,
            return_fd: ret_w.as_raw_fd(),
            stdin: raw(&stdin),
            stdout: raw(&stdout),
            stderr: raw(&stderr),
        };
        let payload = serde_json::to_vec(&request)?;
        let keep: Vec<RawFd> = [Some(request.return_fd), request.stdin, request.stdout, request.stderr]
            .into_iter()
            .flatten()
            .collect();

        let switch = target.switch_target(switch_user);
        let home = switch.home.clone();
        let privileges = PrivilegeDrop::prepare(switch, &target.prlimits, target.cgroup.as_deref())?
            .keep_fds(keep);

        let mut cmd = Command::new(&self.runner_path);
        let _ = cmd.arg0(target.title(command.as_str())).stdin(ProcessStdio::from(cmd_r));
        if switch_user {
            let _ = cmd.env("HOME", &home).env("USER", &target.user.name);
            if home.is_dir() {
                let _ = cmd.current_dir(&home);
            }
        }
        // SAFETY: `PrivilegeDrop::apply` only issues system calls on data
        // prepared in the parent; it neither allocates nor takes locks.
        unsafe {
            let _ = cmd.pre_exec(move || privileges.apply());
        }
        let child = cmd.spawn().map_err(|e| CorralError::Io {
            path: self.runner_path.clone(),
            source: e,
        })?;
        // Releases the parent's copies of the read end, the cgroup handle
        // and the caller's stdio.
        drop(cmd);
        drop((stdin, stdout, stderr, ret_w));

        tracing::debug!(
            pid = child.id(),
            command = %command,
            pool = %target.pool,
            id = %target.id,
            "runner spawned"
        );
        let mut writer = File::from(cmd_w);
        if let Err(e) = writer.write_all(&payload) {
            tracing::warn!(error = %e, command = %command, "unable to send request to runner");
        }
        drop(writer);

        Ok(collect_response(
            RunnerProcess::Spawned(child),
            File::from(ret_r),
            timeout.or(self.default_timeout),
        ))
    }

    /// Runs `runner` in a forked copy of the daemon.
    ///
    /// Unless `switch_user` is off, the child switches to the container
    /// owner before executing. The child inherits a snapshot of the daemon
    /// and must not depend on locks held by other threads.
    ///
    /// # Errors
    ///
    /// Returns an error if the channel cannot be set up or `fork` fails.
    pub fn fork_runner(
        &self,
        target: &RunnerTarget,
        name: &str,
        runner: &dyn Runner,
        opts: RunnerOptions,
    ) -> Result<CommandResult> {
        let RunnerOptions {
            args,
            kwargs,
            stdin,
            stdout,
            stderr,
            timeout,
            switch_user,
        } = opts;
        let (ret_r, ret_w) = pipe2(OFlag::O_CLOEXEC).map_err(|e| CorralError::system("pipe", e))?;
        let title = CString::new(target.title(name)).map_err(|e| CorralError::Config {
            message: format!("invalid process title: {e}"),
        })?;
        let privileges = if switch_user {
            Some(PrivilegeDrop::prepare(target.switch_target(true), &[], None)?)
        } else {
            None
        };
        let ctx = target.context(Stdio {
            stdin: stdin.map(File::from),
            stdout: stdout.map(File::from),
            stderr: stderr.map(File::from),
        });
        let mut keep: Vec<RawFd> = [0, 1, 2, ret_w.as_raw_fd()]
            .into_iter()
            .chain(ctx.stdio.raw_fds())
            .collect();
        keep.sort_unstable();
        keep.dedup();

        // SAFETY: the child only runs the runner and terminates with
        // `_exit`, never returning into the caller's stack.
        match unsafe { fork() } {
            Ok(ForkResult::Child) => {
                drop(ret_r);
                forked_child(ret_w, &keep, &title, privileges.as_ref(), runner, ctx, &args, &kwargs)
            }
            Ok(ForkResult::Parent { child }) => {
                drop(ret_w);
                drop(ctx);
                tracing::debug!(pid = child.as_raw(), runner = name, id = %target.id, "runner forked");
                Ok(collect_response(
                    RunnerProcess::Forked(child),
                    File::from(ret_r),
                    timeout.or(self.default_timeout),
                ))
            }
            Err(e) => Err(CorralError::system("fork", e)),
        }
    }
}

#[allow(clippy::too_many_arguments)]
fn forked_child(
    ret_w: OwnedFd,
    keep: &[RawFd],
    title: &CString,
    privileges: Option<&PrivilegeDrop>,
    runner: &dyn Runner,
    mut ctx: RunnerContext,
    args: &[Value],
    kwargs: &Map<String, Value>,
) -> ! {
    // Result pipes of other runners in flight must not stay open here.
    if let Err(e) = close_other_fds(keep) {
        let result = CommandResult::error(format!("unable to close inherited descriptors: {e}"));
        let mut out = File::from(ret_w);
        let _ = result.to_line().map(|line| out.write_all(line.as_bytes()));
        // SAFETY: leaves the child without running the parent's destructors.
        unsafe { libc::_exit(1) }
    }
    let _ = nix::sys::prctl::set_name(title);
    let result = match privileges.map_or(Ok(()), PrivilegeDrop::apply) {
        Ok(()) => runner.execute(&mut ctx, args, kwargs),
        Err(e) => CommandResult::error(format!("unable to switch user: {e}")),
    };
    let mut out = File::from(ret_w);
    let status = match result.to_line() {
        Ok(line) if out.write_all(line.as_bytes()).is_ok() => 0,
        _ => 1,
    };
    // SAFETY: `_exit` skips atexit handlers and destructors registered by
    // the parent, which must not run twice.
    unsafe { libc::_exit(status) }
}

/// A child process executing a runner.
enum RunnerProcess {
    Spawned(Child),
    Forked(Pid),
}

impl RunnerProcess {
    fn pid(&self) -> i32 {
        match self {
            Self::Spawned(child) => i32::try_from(child.id()).unwrap_or(-1),
            Self::Forked(pid) => pid.as_raw(),
        }
    }

    fn kill(&mut self) {
        let res = match self {
            Self::Spawned(child) => child.kill().map_err(|e| e.to_string()),
            Self::Forked(pid) => match kill(*pid, Signal::SIGKILL) {
                Ok(()) | Err(Errno::ESRCH) => Ok(()),
                Err(e) => Err(e.to_string()),
            },
        };
        if let Err(e) = res {
            tracing::warn!(pid = self.pid(), error = %e, "unable to kill runner");
        }
    }

    fn reap(&mut self) {
        let res = match self {
            Self::Spawned(child) => child.wait().map(|_| ()).map_err(|e| e.to_string()),
            Self::Forked(pid) => match waitpid(*pid, None) {
                Ok(_) | Err(Errno::ECHILD) => Ok(()),
                Err(e) => Err(e.to_string()),
            },
        };
        if let Err(e) = res {
            tracing::warn!(pid = self.pid(), error = %e, "unable to reap runner");
        }
    }
}

/// Reads one result line from `reader`, enforcing `timeout`.
///
/// The child is reaped on every path.
fn collect_response(mut process: RunnerProcess, mut reader: File, timeout: Option<Duration>) -> CommandResult {
    let deadline = timeout.map(|t| Instant::now() + t);
    let mut buffer = Vec::new();
    let mut chunk = [0u8; 4096];

    loop {
        let wait = match deadline {
            Some(deadline) if Instant::now() >= deadline => {
                drop(reader);
                process.kill();
                process.reap();
                tracing::warn!(pid = process.pid(), ?timeout, "runner timed out");
                return CommandResult::runner_timed_out();
            }
            Some(deadline) => {
                let remaining = deadline.saturating_duration_since(Instant::now()).as_millis() + 1;
                PollTimeout::from(u16::try_from(remaining).map_or(POLL_INTERVAL_MS, |ms| ms.min(POLL_INTERVAL_MS)))
            }
            None => PollTimeout::NONE,
        };

        let mut fds = [PollFd::new(reader.as_fd(), PollFlags::POLLIN)];
        match poll(&mut fds, wait) {
            Ok(0) | Err(Errno::EINTR) => continue,
            Ok(_) => {}
            Err(e) => {
                tracing::error!(error = %e, "polling runner result failed");
                process.kill();
                process.reap();
                return CommandResult::runner_failed();
            }
        }

        match reader.read(&mut chunk) {
            Ok(0) => {
                process.reap();
                tracing::warn!(pid = process.pid(), received = buffer.len(), "runner failed");
                return CommandResult::runner_failed();
            }
            Ok(n) => {
                buffer.extend_from_slice(&chunk[..n]);
                if buffer.ends_with(b"\n") {
                    break;
                }
            }
            Err(e) if matches!(e.kind(), ErrorKind::Interrupted | ErrorKind::WouldBlock) => {}
            Err(e) => {
                tracing::error!(error = %e, "reading runner result failed");
                process.kill();
                process.reap();
                return CommandResult::runner_failed();
            }
        }
    }

    drop(reader);
    process.reap();
    CommandResult::from_line(&buffer).unwrap_or_else(|e| {
        tracing::error!(error = %e, "malformed runner result");
        CommandResult::runner_failed()
    })
}
