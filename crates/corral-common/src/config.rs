//! Daemon configuration model.
//!
//! Loaded from a YAML file by `corrald`. Every field has a default so that
//! an empty file yields a usable (if pool-less) daemon.

use std::collections::HashSet;
use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::constants;
use crate::error::{CorralError, Result};
use crate::types::{AutoStartConfig, PrLimit};

/// Root configuration of the daemon.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct DaemonConfig {
    /// Base directory for daemon state and container data.
    pub data_dir: PathBuf,
    /// Runtime directory.
    pub run_dir: PathBuf,
    /// Root of the cgroup hierarchy used for containers.
    pub cgroup_root: PathBuf,
    /// Explicit path of the runner executable.
    pub runner_path: Option<PathBuf>,
    /// Default number of parallel starts per pool.
    pub parallel_start: usize,
    /// Default number of parallel stops per pool.
    pub parallel_stop: usize,
    /// Seconds a start may take before it is reported as timed out.
    pub start_timeout_secs: u64,
    /// Seconds a stop may take before it is reported as timed out.
    pub stop_timeout_secs: u64,
    /// Hard limit for a single runner round-trip, unlimited when unset.
    pub runner_timeout_secs: Option<u64>,
    /// Pools managed by the daemon.
    pub pools: Vec<PoolConfig>,
}

impl Default for DaemonConfig {
    fn default() -> Self {
        Self {
            data_dir: PathBuf::from(constants::DEFAULT_DATA_DIR),
            run_dir: PathBuf::from(constants::DEFAULT_RUN_DIR),
            cgroup_root: PathBuf::from(constants::CGROUP_V2_PATH).join(constants::CGROUP_ROOT_NAME),
            runner_path: None,
            parallel_start: constants::DEFAULT_PARALLEL_START,
            parallel_stop: constants::DEFAULT_PARALLEL_STOP,
            start_timeout_secs: constants::DEFAULT_START_TIMEOUT_SECS,
            stop_timeout_secs: constants::DEFAULT_STOP_TIMEOUT_SECS,
            runner_timeout_secs: None,
            pools: Vec::new(),
        }
    }
}

impl DaemonConfig {
    /// Reads and validates a configuration file.
    ///
    /// # Errors
    ///
    /// Returns an error if the file cannot be read, is not valid YAML, or
    /// fails validation.
    pub fn load(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path).map_err(|e| CorralError::Io {
            path: path.to_path_buf(),
            source: e,
        })?;
        let config = Self::parse(&content)?;
        tracing::debug!(path = %path.display(), pools = config.pools.len(), "configuration loaded");
        Ok(config)
    }

    /// Parses and validates configuration from a YAML string.
    ///
    /// # Errors
    ///
    /// Returns an error if the input is not valid YAML or fails validation.
    pub fn parse(content: &str) -> Result<Self> {
        let config: Self = if content.trim().is_empty() {
            Self::default()
        } else {
            serde_yaml::from_str(content).map_err(|e| CorralError::Config {
                message: e.to_string(),
            })?
        };
        config.validate()?;
        Ok(config)
    }

    /// Checks cross references and numeric bounds.
    ///
    /// # Errors
    ///
    /// Returns an error describing the first invalid value found.
    pub fn validate(&self) -> Result<()> {
        if self.parallel_start == 0 || self.parallel_stop == 0 {
            return Err(CorralError::Config {
                message: "parallel_start and parallel_stop must be at least 1".into(),
            });
        }

        let mut pool_names = HashSet::new();
        for pool in &self.pools {
            if !pool_names.insert(pool.name.as_str()) {
                return Err(CorralError::Config {
                    message: format!("duplicate pool '{}'", pool.name),
                });
            }
            pool.validate()?;
        }
        Ok(())
    }

    /// Start timeout as a [`Duration`].
    #[must_use]
    pub const fn start_timeout(&self) -> Duration {
        Duration::from_secs(self.start_timeout_secs)
    }

    /// Stop timeout as a [`Duration`].
    #[must_use]
    pub const fn stop_timeout(&self) -> Duration {
        Duration::from_secs(self.stop_timeout_secs)
    }

    /// Runner timeout as a [`Duration`], if any.
    #[must_use]
    pub fn runner_timeout(&self) -> Option<Duration> {
        self.runner_timeout_secs.map(Duration::from_secs)
    }
}

/// A data pool: users, groups and containers sharing one scheduler.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PoolConfig {
    /// Pool name.
    pub name: String,
    /// Overrides [`DaemonConfig::parallel_start`].
    #[serde(default)]
    pub parallel_start: Option<usize>,
    /// Overrides [`DaemonConfig::parallel_stop`].
    #[serde(default)]
    pub parallel_stop: Option<usize>,
    /// Users owning containers in this pool.
    #[serde(default)]
    pub users: Vec<UserConfig>,
    /// Cgroup groups in this pool.
    #[serde(default)]
    pub groups: Vec<GroupConfig>,
    /// Containers in this pool.
    #[serde(default)]
    pub containers: Vec<ContainerConfig>,
}

impl PoolConfig {
    fn validate(&self) -> Result<()> {
        if matches!(self.parallel_start, Some(0)) || matches!(self.parallel_stop, Some(0)) {
            return Err(CorralError::Config {
                message: format!("pool '{}': parallelism must be at least 1", self.name),
            });
        }

        let users: HashSet<&str> = self.users.iter().map(|u| u.name.as_str()).collect();
        let groups: HashSet<&str> = self.groups.iter().map(|g| g.name.as_str()).collect();
        let mut ids = HashSet::new();

        for ct in &self.containers {
            if !ids.insert(ct.id.as_str()) {
                return Err(CorralError::Config {
                    message: format!("pool '{}': duplicate container '{}'", self.name, ct.id),
                });
            }
            if !users.contains(ct.user.as_str()) {
                return Err(CorralError::Config {
                    message: format!(
                        "container {}:{} references unknown user '{}'",
                        self.name, ct.id, ct.user
                    ),
                });
            }
            if !groups.contains(ct.group.as_str()) {
                return Err(CorralError::Config {
                    message: format!(
                        "container {}:{} references unknown group '{}'",
                        self.name, ct.id, ct.group
                    ),
                });
            }
        }
        Ok(())
    }
}

/// A system user owning containers.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct UserConfig {
    /// System user name.
    pub name: String,
    /// User ID.
    pub uid: u32,
    /// Group ID.
    pub gid: u32,
    /// Home directory.
    pub home: PathBuf,
}

/// A cgroup group.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GroupConfig {
    /// Group name.
    pub name: String,
    /// Cgroup path relative to the daemon's cgroup root.
    pub cgroup_path: PathBuf,
}

/// A container definition.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ContainerConfig {
    /// Container ID, unique within the pool.
    pub id: String,
    /// Owning user name.
    pub user: String,
    /// Group name.
    pub group: String,
    /// Autostart settings, `None` disables autostart.
    #[serde(default)]
    pub autostart: Option<AutoStartConfig>,
    /// Resource limits applied to runner processes.
    #[serde(default)]
    pub prlimits: Vec<PrLimit>,
}
