//! System-wide constants and default paths.

/// Default base directory for daemon state.
pub const DEFAULT_DATA_DIR: &str = "/var/lib/corral";

/// Default runtime directory (sockets, run configurations).
pub const DEFAULT_RUN_DIR: &str = "/run/corral";

/// Default configuration file read by `corrald`.
pub const DEFAULT_CONFIG_FILE: &str = "/etc/corral/corrald.yml";

/// Cgroups v2 unified hierarchy mount point.
pub const CGROUP_V2_PATH: &str = "/sys/fs/cgroup";

/// Cgroup subtree owned by the daemon.
pub const CGROUP_ROOT_NAME: &str = "corral";

/// File name of the runner executable.
pub const RUNNER_BIN_NAME: &str = "corral-ct-runner";

/// Default number of containers started in parallel per pool.
pub const DEFAULT_PARALLEL_START: usize = 2;

/// Default number of containers stopped in parallel per pool.
pub const DEFAULT_PARALLEL_STOP: usize = 4;

/// Default seconds to wait for a container to reach `running`.
pub const DEFAULT_START_TIMEOUT_SECS: u64 = 60;

/// Default seconds to wait for a container to reach `stopped`.
pub const DEFAULT_STOP_TIMEOUT_SECS: u64 = 300;

/// Flag set on results synthesized by the frontend for structural runner failures.
pub const USER_RUNNER_FLAG: &str = "user_runner";

/// Application name used in logs and process titles.
pub const APP_NAME: &str = "corrald";
