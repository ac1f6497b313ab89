//! Lockable daemon entities owned by a pool: users, groups and containers.

use std::fmt;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use chrono::{DateTime, Utc};
use corral_common::config::{ContainerConfig, GroupConfig, UserConfig};
use corral_common::types::{AutoStartConfig, ContainerState, PrLimit, ResourceIdent, UserIdentity};
use parking_lot::Mutex;

use crate::control::RunnerTarget;
use crate::lock::{LockManager, Lockable, ResourceLock};
use crate::manipulation::{Manipulable, Manipulation};
use crate::pool::Pool;

/// A system user owning containers.
pub struct User {
    pool: String,
    name: String,
    uid: u32,
    gid: u32,
    home: PathBuf,
    lock: ResourceLock,
    manipulation: Manipulation,
}

impl User {
    /// Creates a user of `pool`.
    #[must_use]
    pub fn new(manager: &Arc<LockManager>, pool: &str, cfg: &UserConfig) -> Self {
        Self {
            pool: pool.to_owned(),
            name: cfg.name.clone(),
            uid: cfg.uid,
            gid: cfg.gid,
            home: cfg.home.clone(),
            lock: ResourceLock::new(manager, ResourceIdent::new("user", format!("{pool}:{}", cfg.name))),
            manipulation: Manipulation::new(),
        }
    }

    /// Pool name.
    #[must_use]
    pub fn pool(&self) -> &str {
        &self.pool
    }

    /// User name.
    #[must_use]
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Identity runners switch to.
    #[must_use]
    pub fn identity(&self) -> UserIdentity {
        UserIdentity {
            name: self.name.clone(),
            uid: self.uid,
            gid: self.gid,
            home: self.home.clone(),
        }
    }
}

impl fmt::Debug for User {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("User")
            .field("pool", &self.pool)
            .field("name", &self.name)
            .field("uid", &self.uid)
            .finish_non_exhaustive()
    }
}

impl Lockable for User {
    fn resource_lock(&self) -> &ResourceLock {
        &self.lock
    }
}

impl Manipulable for User {
    fn manipulation(&self) -> &Manipulation {
        &self.manipulation
    }
}

/// A group of containers sharing a cgroup subtree.
pub struct Group {
    pool: String,
    name: String,
    cgroup_path: PathBuf,
    lock: ResourceLock,
    manipulation: Manipulation,
}

impl Group {
    /// Creates a group of `pool`.
    #[must_use]
    pub fn new(manager: &Arc<LockManager>, pool: &str, cfg: &GroupConfig) -> Self {
        Self {
            pool: pool.to_owned(),
            name: cfg.name.clone(),
            cgroup_path: cfg.cgroup_path.clone(),
            lock: ResourceLock::new(manager, ResourceIdent::new("group", format!("{pool}:{}", cfg.name))),
            manipulation: Manipulation::new(),
        }
    }

    /// Group name.
    #[must_use]
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Cgroup path relative to the daemon's cgroup root.
    #[must_use]
    pub fn cgroup_path(&self) -> &Path {
        &self.cgroup_path
    }
}

impl fmt::Debug for Group {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Group")
            .field("pool", &self.pool)
            .field("name", &self.name)
            .finish_non_exhaustive()
    }
}

impl Lockable for Group {
    fn resource_lock(&self) -> &ResourceLock {
        &self.lock
    }
}

impl Manipulable for Group {
    fn manipulation(&self) -> &Manipulation {
        &self.manipulation
    }
}

struct ContainerRuntime {
    state: ContainerState,
    started_at: Option<DateTime<Utc>>,
    autostart: Option<AutoStartConfig>,
}

/// An LXC container owned by a user and placed in a group.
pub struct Container {
    pool: String,
    id: String,
    user: Arc<User>,
    group: Arc<Group>,
    prlimits: Vec<PrLimit>,
    lxc_home: PathBuf,
    log_path: PathBuf,
    runtime: Mutex<ContainerRuntime>,
    lock: ResourceLock,
    manipulation: Manipulation,
}

impl Container {
    /// Creates a stopped container; its files live under `data_dir`.
    #[must_use]
    pub fn new(
        manager: &Arc<LockManager>,
        pool: &str,
        cfg: &ContainerConfig,
        user: Arc<User>,
        group: Arc<Group>,
        data_dir: &Path,
    ) -> Self {
        let pool_dir = data_dir.join(pool);
        Self {
            pool: pool.to_owned(),
            id: cfg.id.clone(),
            lxc_home: pool_dir.join("user").join(user.name()).join(group.name()),
            log_path: pool_dir.join("log").join("ct").join(format!("{}.log", cfg.id)),
            user,
            group,
            prlimits: cfg.prlimits.clone(),
            runtime: Mutex::new(ContainerRuntime {
                state: ContainerState::Stopped,
                started_at: None,
                autostart: cfg.autostart,
            }),
            lock: ResourceLock::new(manager, ResourceIdent::new("container", format!("{pool}:{}", cfg.id))),
            manipulation: Manipulation::new(),
        }
    }

    /// Pool name.
    #[must_use]
    pub fn pool(&self) -> &str {
        &self.pool
    }

    /// Container ID, unique within its pool.
    #[must_use]
    pub fn id(&self) -> &str {
        &self.id
    }

    /// `pool:id`.
    #[must_use]
    pub fn ident(&self) -> String {
        format!("{}:{}", self.pool, self.id)
    }

    /// Owner.
    #[must_use]
    pub const fn user(&self) -> &Arc<User> {
        &self.user
    }

    /// Group.
    #[must_use]
    pub const fn group(&self) -> &Arc<Group> {
        &self.group
    }

    /// Last reported lifecycle state.
    #[must_use]
    pub fn state(&self) -> ContainerState {
        self.runtime.lock().state
    }

    pub(crate) fn set_state(&self, state: ContainerState) {
        self.runtime.lock().state = state;
    }

    /// When the current run began, if running.
    #[must_use]
    pub fn started_at(&self) -> Option<DateTime<Utc>> {
        self.runtime.lock().started_at
    }

    /// Lifecycle callback: the container is starting.
    pub fn starting(&self) {
        self.runtime.lock().started_at = Some(Utc::now());
    }

    /// Lifecycle callback: the container has stopped.
    pub fn stopped(&self) {
        self.runtime.lock().started_at = None;
    }

    /// Autostart settings, if enabled.
    #[must_use]
    pub fn autostart(&self) -> Option<AutoStartConfig> {
        self.runtime.lock().autostart
    }

    /// Enables or disables autostart.
    pub fn set_autostart(&self, autostart: Option<AutoStartConfig>) {
        self.runtime.lock().autostart = autostart;
    }

    /// Whether the container may be started at all.
    #[must_use]
    pub fn can_start(&self, pool: &Pool) -> bool {
        !matches!(self.state(), ContainerState::Staged | ContainerState::Error) && pool.is_active()
    }

    /// Resource limits applied to runners.
    #[must_use]
    pub fn prlimits(&self) -> &[PrLimit] {
        &self.prlimits
    }

    /// LXC home directory.
    #[must_use]
    pub fn lxc_home(&self) -> &Path {
        &self.lxc_home
    }

    /// Container log file.
    #[must_use]
    pub fn log_path(&self) -> &Path {
        &self.log_path
    }

    /// `<group cgroup>/<user>/ct.<id>`, relative to the cgroup root.
    #[must_use]
    pub fn base_cgroup_path(&self) -> PathBuf {
        self.group
            .cgroup_path()
            .join(self.user.name())
            .join(format!("ct.{}", self.id))
    }

    /// Subtree delegated to the container's owner.
    #[must_use]
    pub fn cgroup_path(&self) -> PathBuf {
        self.base_cgroup_path().join("user-owned")
    }

    /// Cgroup runners join before touching the container.
    #[must_use]
    pub fn entry_cgroup_path(&self) -> PathBuf {
        self.cgroup_path().join(format!("lxc.monitor.{}", self.id))
    }

    /// Describes this container to the control channel.
    ///
    /// With `cgroup_root` set, exec'd runners join the entry cgroup below it.
    #[must_use]
    pub fn runner_target(&self, cgroup_root: Option<&Path>) -> RunnerTarget {
        RunnerTarget {
            pool: self.pool.clone(),
            id: self.id.clone(),
            lxc_home: self.lxc_home.clone(),
            log_file: self.log_path.clone(),
            user: self.user.identity(),
            cgroup: cgroup_root.map(|root| corral_core::cgroup::abs_path(root, &self.entry_cgroup_path())),
            prlimits: self.prlimits.clone(),
        }
    }
}

impl fmt::Debug for Container {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Container")
            .field("pool", &self.pool)
            .field("id", &self.id)
            .field("state", &self.state())
            .finish_non_exhaustive()
    }
}

impl Lockable for Container {
    fn resource_lock(&self) -> &ResourceLock {
        &self.lock
    }
}

impl Manipulable for Container {
    fn manipulation(&self) -> &Manipulation {
        &self.manipulation
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;

    pub(crate) fn container(manager: &Arc<LockManager>, pool: &str, id: &str) -> Container {
        let user = Arc::new(User::new(
            manager,
            pool,
            &UserConfig {
                name: "alice".into(),
                uid: nix::unistd::getuid().as_raw(),
                gid: nix::unistd::getgid().as_raw(),
                home: std::env::temp_dir(),
            },
        ));
        let group = Arc::new(Group::new(
            manager,
            pool,
            &GroupConfig {
                name: "root".into(),
                cgroup_path: "corral/tank".into(),
            },
        ));
        let cfg = ContainerConfig {
            id: id.into(),
            user: "alice".into(),
            group: "root".into(),
            autostart: None,
            prlimits: vec![PrLimit::new("nofile", 1024, 4096)],
        };
        Container::new(manager, pool, &cfg, user, group, Path::new("/var/lib/corral"))
    }

    #[test]
    fn cgroup_paths_nest() {
        let ct = container(&LockManager::new(), "tank", "web");
        assert_eq!(ct.base_cgroup_path(), PathBuf::from("corral/tank/alice/ct.web"));
        assert_eq!(ct.cgroup_path(), PathBuf::from("corral/tank/alice/ct.web/user-owned"));
        assert_eq!(
            ct.entry_cgroup_path(),
            PathBuf::from("corral/tank/alice/ct.web/user-owned/lxc.monitor.web")
        );
    }

    #[test]
    fn data_paths_follow_pool_layout() {
        let ct = container(&LockManager::new(), "tank", "web");
        assert_eq!(ct.lxc_home(), Path::new("/var/lib/corral/tank/user/alice/root"));
        assert_eq!(ct.log_path(), Path::new("/var/lib/corral/tank/log/ct/web.log"));
    }

    #[test]
    fn manipulation_resource_names_container() {
        let ct = container(&LockManager::new(), "tank", "web");
        assert_eq!(ct.manipulation_resource().to_string(), "container tank:web");
        assert_eq!(ct.ident(), "tank:web");
    }

    #[test]
    fn runner_target_resolves_cgroup() {
        let ct = container(&LockManager::new(), "tank", "web");
        let target = ct.runner_target(Some(Path::new("/sys/fs/cgroup")));
        assert_eq!(
            target.cgroup.as_deref(),
            Some(Path::new("/sys/fs/cgroup/corral/tank/alice/ct.web/user-owned/lxc.monitor.web"))
        );
        assert_eq!(target.prlimits.len(), 1);
        assert!(ct.runner_target(None).cgroup.is_none());
    }

    #[test]
    fn lifecycle_callbacks_track_start_time() {
        let ct = container(&LockManager::new(), "tank", "web");
        ct.starting();
        assert!(ct.started_at().is_some());
        ct.stopped();
        assert!(ct.started_at().is_none());
    }
}
