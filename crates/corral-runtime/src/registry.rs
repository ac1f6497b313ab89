//! The entity repository shared by commands and plans.
//!
//! Nothing in the daemon looks entities up through globals; whoever needs a
//! pool or a container is handed a [`Registry`].

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use corral_common::config::{ContainerConfig, DaemonConfig, PoolConfig};
use corral_common::error::{CorralError, Result};
use parking_lot::RwLock;

use crate::entity::{Container, Group, User};
use crate::event::{Event, EventBus, EventPayload};
use crate::lock::LockManager;
use crate::pool::Pool;

type Key = (String, String);

fn key(pool: &str, id: &str) -> Key {
    (pool.to_owned(), id.to_owned())
}

/// Pools and their users, groups and containers.
#[derive(Debug)]
pub struct Registry {
    manager: Arc<LockManager>,
    bus: Arc<EventBus>,
    data_dir: PathBuf,
    pools: RwLock<BTreeMap<String, Arc<Pool>>>,
    users: RwLock<BTreeMap<Key, Arc<User>>>,
    groups: RwLock<BTreeMap<Key, Arc<Group>>>,
    containers: RwLock<BTreeMap<Key, Arc<Container>>>,
}

impl Registry {
    /// An empty registry; container files live under `data_dir`.
    #[must_use]
    pub fn new(manager: Arc<LockManager>, bus: Arc<EventBus>, data_dir: impl Into<PathBuf>) -> Self {
        Self {
            manager,
            bus,
            data_dir: data_dir.into(),
            pools: RwLock::new(BTreeMap::new()),
            users: RwLock::new(BTreeMap::new()),
            groups: RwLock::new(BTreeMap::new()),
            containers: RwLock::new(BTreeMap::new()),
        }
    }

    /// Builds every configured pool and activates it.
    ///
    /// # Errors
    ///
    /// Returns [`CorralError::Config`] if the configuration is invalid.
    pub fn load(cfg: &DaemonConfig, manager: Arc<LockManager>, bus: Arc<EventBus>) -> Result<Arc<Self>> {
        cfg.validate()?;
        let registry = Arc::new(Self::new(manager, bus, &cfg.data_dir));
        for pool_cfg in &cfg.pools {
            let pool = registry.import_pool(pool_cfg, cfg)?;
            pool.activate();
        }
        tracing::info!(
            pools = registry.pools.read().len(),
            containers = registry.containers.read().len(),
            "registry loaded"
        );
        Ok(registry)
    }

    fn import_pool(&self, cfg: &PoolConfig, daemon: &DaemonConfig) -> Result<Arc<Pool>> {
        let pool = Arc::new(Pool::from_config(&self.manager, &self.bus, cfg, daemon));
        self.add_pool(Arc::clone(&pool))?;
        for user in &cfg.users {
            let _ = self
                .users
                .write()
                .insert(key(&cfg.name, &user.name), Arc::new(User::new(&self.manager, &cfg.name, user)));
        }
        for group in &cfg.groups {
            let _ = self
                .groups
                .write()
                .insert(key(&cfg.name, &group.name), Arc::new(Group::new(&self.manager, &cfg.name, group)));
        }
        for ct in &cfg.containers {
            let _ = self.add_container(&cfg.name, ct)?;
        }
        Ok(pool)
    }

    /// Registers a pool.
    ///
    /// # Errors
    ///
    /// Returns [`CorralError::Config`] if a pool of that name exists.
    pub fn add_pool(&self, pool: Arc<Pool>) -> Result<()> {
        let mut pools = self.pools.write();
        if pools.contains_key(pool.name()) {
            return Err(CorralError::Config {
                message: format!("pool '{}' already exists", pool.name()),
            });
        }
        tracing::debug!(pool = pool.name(), "pool added");
        let _ = pools.insert(pool.name().to_owned(), pool);
        Ok(())
    }

    /// Creates a stopped container in `pool`.
    ///
    /// # Errors
    ///
    /// Returns [`CorralError::NotFound`] for an unknown pool, user or group,
    /// and [`CorralError::Config`] for a duplicate ID.
    pub fn add_container(&self, pool: &str, cfg: &ContainerConfig) -> Result<Arc<Container>> {
        let _ = self.pool(pool)?;
        let user = self.user(pool, &cfg.user)?;
        let group = self.group(pool, &cfg.group)?;
        let ct = Arc::new(Container::new(&self.manager, pool, cfg, user, group, &self.data_dir));
        {
            let mut containers = self.containers.write();
            let k = key(pool, &cfg.id);
            if containers.contains_key(&k) {
                return Err(CorralError::Config {
                    message: format!("container {pool}:{} already exists", cfg.id),
                });
            }
            let _ = containers.insert(k, Arc::clone(&ct));
        }
        self.bus.publish(db_event(pool, &cfg.id, "add"));
        Ok(ct)
    }

    /// Forgets a container, cancelling anything its pool scheduled for it.
    ///
    /// # Errors
    ///
    /// Returns [`CorralError::NotFound`] for an unknown container.
    pub fn remove_container(&self, pool: &str, id: &str) -> Result<Arc<Container>> {
        let ct = self
            .containers
            .write()
            .remove(&key(pool, id))
            .ok_or_else(|| CorralError::NotFound {
                kind: "container",
                id: format!("{pool}:{id}"),
            })?;
        if let Ok(pool) = self.pool(pool) {
            let _ = pool.autostart_plan().remove(&ct);
            let _ = pool.autostop_plan().remove(&ct);
        }
        self.bus.publish(db_event(pool, id, "remove"));
        Ok(ct)
    }

    /// Looks up a pool.
    ///
    /// # Errors
    ///
    /// Returns [`CorralError::NotFound`] for an unknown pool.
    pub fn pool(&self, name: &str) -> Result<Arc<Pool>> {
        self.pools.read().get(name).cloned().ok_or_else(|| CorralError::NotFound {
            kind: "pool",
            id: name.to_owned(),
        })
    }

    /// All pools ordered by name.
    #[must_use]
    pub fn pools(&self) -> Vec<Arc<Pool>> {
        self.pools.read().values().cloned().collect()
    }

    /// Looks up a container.
    ///
    /// # Errors
    ///
    /// Returns [`CorralError::NotFound`] for an unknown container.
    pub fn container(&self, pool: &str, id: &str) -> Result<Arc<Container>> {
        self.containers
            .read()
            .get(&key(pool, id))
            .cloned()
            .ok_or_else(|| CorralError::NotFound {
                kind: "container",
                id: format!("{pool}:{id}"),
            })
    }

    /// All containers ordered by pool and ID.
    #[must_use]
    pub fn containers(&self) -> Vec<Arc<Container>> {
        self.containers.read().values().cloned().collect()
    }

    /// Containers of one pool ordered by ID.
    #[must_use]
    pub fn containers_of(&self, pool: &str) -> Vec<Arc<Container>> {
        self.containers
            .read()
            .iter()
            .filter(|((p, _), _)| p == pool)
            .map(|(_, ct)| Arc::clone(ct))
            .collect()
    }

    /// Looks up a user.
    ///
    /// # Errors
    ///
    /// Returns [`CorralError::NotFound`] for an unknown user.
    pub fn user(&self, pool: &str, name: &str) -> Result<Arc<User>> {
        self.users.read().get(&key(pool, name)).cloned().ok_or_else(|| CorralError::NotFound {
            kind: "user",
            id: format!("{pool}:{name}"),
        })
    }

    /// Looks up a group.
    ///
    /// # Errors
    ///
    /// Returns [`CorralError::NotFound`] for an unknown group.
    pub fn group(&self, pool: &str, name: &str) -> Result<Arc<Group>> {
        self.groups.read().get(&key(pool, name)).cloned().ok_or_else(|| CorralError::NotFound {
            kind: "group",
            id: format!("{pool}:{name}"),
        })
    }

    /// The daemon's event bus.
    #[must_use]
    pub const fn bus(&self) -> &Arc<EventBus> {
        &self.bus
    }

    /// The daemon's lock manager.
    #[must_use]
    pub const fn lock_manager(&self) -> &Arc<LockManager> {
        &self.manager
    }

    /// Root of per-pool data.
    #[must_use]
    pub fn data_dir(&self) -> &Path {
        &self.data_dir
    }
}

fn db_event(pool: &str, id: &str, action: &str) -> Event {
    Event::new(EventPayload::Db {
        object: "container".into(),
        pool: pool.into(),
        id: id.into(),
        action: action.into(),
    })
}
