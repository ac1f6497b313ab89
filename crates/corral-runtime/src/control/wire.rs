//! Wire format between the frontend and a runner.
//!
//! The frontend writes one JSON [`RunnerRequest`] to the runner's standard
//! input and closes it. The runner answers with one JSON [`CommandResult`]
//! terminated by a newline on the result descriptor.

use std::collections::BTreeMap;
use std::os::fd::RawFd;
use std::path::PathBuf;

use corral_common::constants::USER_RUNNER_FLAG;
use corral_common::error::{CorralError, Result};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

/// A command invocation sent to the runner executable.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RunnerRequest {
    /// Runner command identifier.
    pub name: String,
    /// Pool of the target container.
    pub pool: String,
    /// Container ID.
    pub id: String,
    /// LXC home directory of the container's user/group.
    pub lxc_home: PathBuf,
    /// Home directory of the container's user.
    pub user_home: PathBuf,
    /// Container log file.
    pub log_file: PathBuf,
    /// Positional arguments.
    #[serde(default)]
    pub args: Vec<Value>,
    /// Named arguments.
    #[serde(default)]
    pub kwargs: Map<String, Value>,
    /// Descriptor the result is written to.
    #[serde(rename = "return")]
    pub return_fd: RawFd,
    /// Descriptor to use as standard input.
    #[serde(default)]
    pub stdin: Option<RawFd>,
    /// Descriptor to use as standard output.
    #[serde(default)]
    pub stdout: Option<RawFd>,
    /// Descriptor to use as standard error.
    #[serde(default)]
    pub stderr: Option<RawFd>,
}

/// Outcome of a runner command.
///
/// Immutable once constructed; a failed result always carries a message.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(from = "RawResult")]
pub struct CommandResult {
    ok: bool,
    #[serde(default)]
    data: Value,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    message: Option<String>,
    #[serde(default)]
    flags: BTreeMap<String, bool>,
}

#[derive(Deserialize)]
struct RawResult {
    ok: bool,
    #[serde(default)]
    data: Value,
    #[serde(default)]
    message: Option<String>,
    #[serde(default)]
    flags: BTreeMap<String, bool>,
}

impl From<RawResult> for CommandResult {
    fn from(raw: RawResult) -> Self {
        let message = match (raw.ok, raw.message) {
            (false, None) => Some("command failed without a message".to_owned()),
            (_, message) => message,
        };
        Self {
            ok: raw.ok,
            data: raw.data,
            message,
            flags: raw.flags,
        }
    }
}

impl CommandResult {
    /// A successful result carrying `data`.
    #[must_use]
    pub fn ok(data: impl Into<Value>) -> Self {
        Self {
            ok: true,
            data: data.into(),
            message: None,
            flags: BTreeMap::new(),
        }
    }

    /// A command-level failure.
    #[must_use]
    pub fn error(message: impl Into<String>) -> Self {
        Self {
            ok: false,
            data: Value::Null,
            message: Some(message.into()),
            flags: BTreeMap::new(),
        }
    }

    /// Synthesized when the runner exceeded its time limit and was killed.
    #[must_use]
    pub fn runner_timed_out() -> Self {
        Self::error("runner timed out").with_flag(USER_RUNNER_FLAG)
    }

    /// Synthesized when the runner exited without a complete result.
    #[must_use]
    pub fn runner_failed() -> Self {
        Self::error("runner failed").with_flag(USER_RUNNER_FLAG)
    }

    fn with_flag(mut self, flag: &str) -> Self {
        let _ = self.flags.insert(flag.to_owned(), true);
        self
    }

    /// Whether the command succeeded.
    #[must_use]
    pub const fn is_ok(&self) -> bool {
        self.ok
    }

    /// Command-specific payload.
    #[must_use]
    pub const fn data(&self) -> &Value {
        &self.data
    }

    /// Failure message, present whenever the result is not ok.
    #[must_use]
    pub fn message(&self) -> Option<&str> {
        self.message.as_deref()
    }

    /// Whether `flag` is set.
    #[must_use]
    pub fn flag(&self, flag: &str) -> bool {
        self.flags.get(flag).copied().unwrap_or(false)
    }

    /// Whether the failure was structural (runner crash or timeout) rather
    /// than reported by the command itself.
    #[must_use]
    pub fn is_runner_failure(&self) -> bool {
        !self.ok && self.flag(USER_RUNNER_FLAG)
    }

    /// Converts into the payload or a [`CorralError::CommandFailed`].
    ///
    /// # Errors
    ///
    /// Returns the failure message as an error when not ok.
    pub fn into_result(self) -> Result<Value> {
        if self.ok {
            Ok(self.data)
        } else {
            Err(CorralError::CommandFailed {
                message: self.message.unwrap_or_default(),
            })
        }
    }

    /// Serializes into a newline-terminated line.
    ///
    /// # Errors
    ///
    /// Returns an error if the payload cannot be serialized.
    pub fn to_line(&self) -> Result<String> {
        let mut line = serde_json::to_string(self)?;
        line.push('\n');
        Ok(line)
    }

    /// Parses a line produced by [`CommandResult::to_line`].
    ///
    /// # Errors
    ///
    /// Returns an error if the bytes are not a valid result.
    pub fn from_line(line: &[u8]) -> Result<Self> {
        Ok(serde_json::from_slice(line)?)
    }
}
