//! Domain primitive types used across the corral workspace.

use std::fmt;
use std::path::PathBuf;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

use crate::error::CorralError;

/// Lifecycle state of a container.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ContainerState {
    /// Being created or imported, not usable yet.
    Staged,
    /// Not running.
    Stopped,
    /// Start has been initiated.
    Starting,
    /// Init process is running.
    Running,
    /// Stop has been initiated.
    Stopping,
    /// Start is being aborted.
    Aborting,
    /// Being frozen.
    Freezing,
    /// All processes are frozen.
    Frozen,
    /// Unfrozen after a freeze.
    Thawed,
    /// State could not be determined.
    Error,
    /// Not yet determined.
    Unknown,
}

impl ContainerState {
    /// Returns the lowercase name used on the wire and in events.
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Staged => "staged",
            Self::Stopped => "stopped",
            Self::Starting => "starting",
            Self::Running => "running",
            Self::Stopping => "stopping",
            Self::Aborting => "aborting",
            Self::Freezing => "freezing",
            Self::Frozen => "frozen",
            Self::Thawed => "thawed",
            Self::Error => "error",
            Self::Unknown => "unknown",
        }
    }
}

impl fmt::Display for ContainerState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for ContainerState {
    type Err = CorralError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Ok(match s {
            "staged" => Self::Staged,
            "stopped" => Self::Stopped,
            "starting" => Self::Starting,
            "running" => Self::Running,
            "stopping" => Self::Stopping,
            "aborting" => Self::Aborting,
            "freezing" => Self::Freezing,
            "frozen" => Self::Frozen,
            "thawed" => Self::Thawed,
            "error" => Self::Error,
            "unknown" => Self::Unknown,
            other => {
                return Err(CorralError::Config {
                    message: format!("unknown container state '{other}'"),
                });
            }
        })
    }
}

/// Access mode of a resource lock.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LockMode {
    /// Concurrent read access.
    Shared,
    /// Mutual exclusion.
    Exclusive,
}

impl LockMode {
    /// Adverb used in diagnostics ("lock X exclusively").
    #[must_use]
    pub const fn adverb(self) -> &'static str {
        match self {
            Self::Shared => "inclusively",
            Self::Exclusive => "exclusively",
        }
    }
}

impl fmt::Display for LockMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Shared => f.write_str("shared"),
            Self::Exclusive => f.write_str("exclusive"),
        }
    }
}

/// Human-readable identity of a lockable entity, used only in diagnostics.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize)]
pub struct ResourceIdent {
    /// Entity type, e.g. `container`.
    pub kind: &'static str,
    /// Entity name, e.g. `tank:web`.
    pub name: String,
}

impl ResourceIdent {
    /// Creates a new resource identity.
    #[must_use]
    pub fn new(kind: &'static str, name: impl Into<String>) -> Self {
        Self {
            kind,
            name: name.into(),
        }
    }
}

impl fmt::Display for ResourceIdent {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} {}", self.kind, self.name)
    }
}

/// A process resource limit applied before a privilege drop.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PrLimit {
    /// Limit name without the `RLIMIT_` prefix, lowercase (e.g. `nofile`).
    pub name: String,
    /// Soft limit; `None` means unlimited.
    pub soft: Option<u64>,
    /// Hard limit; `None` means unlimited.
    pub hard: Option<u64>,
}

impl PrLimit {
    /// Creates a limit with both values set.
    #[must_use]
    pub fn new(name: impl Into<String>, soft: u64, hard: u64) -> Self {
        Self {
            name: name.into(),
            soft: Some(soft),
            hard: Some(hard),
        }
    }
}

/// The unprivileged principal owning a container.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct UserIdentity {
    /// System user name.
    pub name: String,
    /// User ID.
    pub uid: u32,
    /// Primary group ID.
    pub gid: u32,
    /// Home directory.
    pub home: PathBuf,
}

/// Autostart settings of a container.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct AutoStartConfig {
    /// Higher priority is started sooner.
    pub priority: i32,
    /// Seconds to keep the worker slot occupied after a successful start.
    #[serde(default)]
    pub delay_secs: u64,
}

impl Default for AutoStartConfig {
    fn default() -> Self {
        Self {
            priority: 10,
            delay_secs: 5,
        }
    }
}
