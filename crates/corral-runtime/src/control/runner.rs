//! Runner side of the control channel.

use std::fs::File;
use std::io::{Read, Write};
use std::os::fd::{FromRawFd, RawFd};
use std::path::PathBuf;

use corral_common::error::{CorralError, Result};

use super::wire::{CommandResult, RunnerRequest};
use super::{RunnerRegistry, Stdio};

/// Environment a [`super::Runner`] executes in.
#[derive(Debug, Default)]
pub struct RunnerContext {
    /// Pool of the target container.
    pub pool: String,
    /// Container ID.
    pub id: String,
    /// LXC home of the container's user/group.
    pub lxc_home: PathBuf,
    /// Home directory of the container's user.
    pub user_home: PathBuf,
    /// Container log file.
    pub log_file: PathBuf,
    /// Streams passed by the caller.
    pub stdio: Stdio,
}

impl RunnerContext {
    /// A context with no paths and no redirected streams.
    #[must_use]
    pub fn detached(pool: impl Into<String>, id: impl Into<String>) -> Self {
        Self {
            pool: pool.into(),
            id: id.into(),
            ..Self::default()
        }
    }

    /// Adopts the descriptors named in `request`.
    ///
    /// # Safety
    ///
    /// The descriptors must be open and owned by nobody else in this
    /// process.
    unsafe fn adopt(request: &RunnerRequest) -> Self {
        let stdin = request.stdin.map(|fd| unsafe { File::from_raw_fd(fd) });
        let stdout = request.stdout.map(|fd| unsafe { File::from_raw_fd(fd) });
        // The same descriptor may serve as both output streams.
        let stderr = match (request.stderr, request.stdout, &stdout) {
            (Some(err), Some(out), Some(file)) if err == out => file.try_clone().ok(),
            (Some(err), ..) => Some(unsafe { File::from_raw_fd(err) }),
            (None, ..) => None,
        };
        Self {
            pool: request.pool.clone(),
            id: request.id.clone(),
            lxc_home: request.lxc_home.clone(),
            user_home: request.user_home.clone(),
            log_file: request.log_file.clone(),
            stdio: Stdio {
                stdin,
                stdout,
                stderr,
            },
        }
    }
}

/// Reads one request from `input`, executes it and writes the result to
/// the request's return descriptor.
///
/// Command failures are reported through the result; only channel-level
/// problems are returned as errors.
///
/// # Errors
///
/// Returns an error if the request cannot be parsed or the result cannot
/// be written.
///
/// # Safety
///
/// Takes ownership of every descriptor number the request names. The
/// caller must guarantee they were inherited for this purpose and are not
/// owned by anything else in the process.
pub unsafe fn serve(registry: &RunnerRegistry, input: impl Read) -> Result<CommandResult> {
    let request: RunnerRequest = serde_json::from_reader(input)?;
    tracing::debug!(
        command = %request.name,
        pool = %request.pool,
        id = %request.id,
        "runner received request"
    );
    let mut ret = adopt_return(request.return_fd)?;
    // SAFETY: forwarded from the caller's contract.
    let mut ctx = unsafe { RunnerContext::adopt(&request) };

    let result = match registry.resolve(&request.name) {
        Ok(runner) => runner.execute(&mut ctx, &request.args, &request.kwargs),
        Err(e) => CommandResult::error(e.to_string()),
    };
    ret.write_all(result.to_line()?.as_bytes())
        .map_err(|e| CorralError::system("write runner result", e))?;
    Ok(result)
}

fn adopt_return(fd: RawFd) -> Result<File> {
    if fd < 0 {
        return Err(CorralError::CommandFailed {
            message: format!("invalid return descriptor {fd}"),
        });
    }
    // SAFETY: the descriptor was handed over by the frontend for writing
    // the result and nothing else in the runner refers to it.
    Ok(unsafe { File::from_raw_fd(fd) })
}
