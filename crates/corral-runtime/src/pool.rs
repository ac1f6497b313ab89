//! Pools: the unit owning containers and their start/stop plans.

use std::fmt;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use corral_common::config::{DaemonConfig, PoolConfig};
use corral_common::error::Result;
use corral_common::types::ResourceIdent;
use parking_lot::Mutex;
use serde::Serialize;

use crate::entity::Container;
use crate::event::EventBus;
use crate::lock::{LockManager, Lockable, ResourceLock};
use crate::manipulation::{Manipulable, Manipulation};
use crate::plan::{AutoStartPlan, AutoStopPlan, PlanContext};

/// Lifecycle of a pool.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum PoolState {
    /// Entities are being loaded.
    Importing,
    /// Containers may be started.
    Active,
    /// Containers are being stopped.
    Stopping,
    /// No longer in use.
    Disabled,
}

/// A pool of users, groups and containers sharing start/stop plans.
pub struct Pool {
    name: String,
    state: Mutex<PoolState>,
    export_aborted: AtomicBool,
    autostart_plan: AutoStartPlan,
    autostop_plan: AutoStopPlan,
    lock: ResourceLock,
    manipulation: Manipulation,
}

impl Pool {
    /// An importing pool whose plans admit `parallel_start` starts and
    /// `parallel_stop` stops at a time.
    #[must_use]
    pub fn new(
        manager: &Arc<LockManager>,
        bus: &Arc<EventBus>,
        name: &str,
        parallel_start: usize,
        parallel_stop: usize,
        entry_timeout: Duration,
    ) -> Self {
        Self {
            name: name.to_owned(),
            state: Mutex::new(PoolState::Importing),
            export_aborted: AtomicBool::new(false),
            autostart_plan: AutoStartPlan::new(name, parallel_start, entry_timeout, Arc::clone(bus)),
            autostop_plan: AutoStopPlan::new(name, parallel_stop, entry_timeout, Arc::clone(bus)),
            lock: ResourceLock::new(manager, ResourceIdent::new("pool", name)),
            manipulation: Manipulation::new(),
        }
    }

    /// A pool built from its configuration, using daemon-wide defaults for
    /// unset parallelism.
    #[must_use]
    pub fn from_config(manager: &Arc<LockManager>, bus: &Arc<EventBus>, cfg: &PoolConfig, daemon: &DaemonConfig) -> Self {
        Self::new(
            manager,
            bus,
            &cfg.name,
            cfg.parallel_start.unwrap_or(daemon.parallel_start),
            cfg.parallel_stop.unwrap_or(daemon.parallel_stop),
            daemon.start_timeout(),
        )
    }

    /// Pool name.
    #[must_use]
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Current lifecycle state.
    #[must_use]
    pub fn state(&self) -> PoolState {
        *self.state.lock()
    }

    /// Whether containers of this pool may be started.
    #[must_use]
    pub fn is_active(&self) -> bool {
        self.state() == PoolState::Active
    }

    /// Marks the pool as fully imported.
    pub fn activate(&self) {
        *self.state.lock() = PoolState::Active;
        tracing::info!(pool = %self.name, "pool active");
    }

    /// Marks the pool as no longer in use.
    pub fn disable(&self) {
        *self.state.lock() = PoolState::Disabled;
        tracing::info!(pool = %self.name, "pool disabled");
    }

    /// Start plan.
    #[must_use]
    pub const fn autostart_plan(&self) -> &AutoStartPlan {
        &self.autostart_plan
    }

    /// Stop plan.
    #[must_use]
    pub const fn autostop_plan(&self) -> &AutoStopPlan {
        &self.autostop_plan
    }

    /// Changes how many containers are started and stopped at a time.
    ///
    /// # Errors
    ///
    /// Returns a configuration error for a zero limit.
    pub fn set_parallelism(&self, start: Option<usize>, stop: Option<usize>) -> Result<()> {
        if let Some(n) = start {
            self.autostart_plan.resize(n)?;
        }
        if let Some(n) = stop {
            self.autostop_plan.resize(n)?;
        }
        Ok(())
    }

    /// Starts all autostart containers of this pool in the background.
    pub fn autostart(&self, ctx: PlanContext, force: bool) -> usize {
        let containers = ctx.registry.containers_of(&self.name);
        self.autostart_plan.start(ctx, &containers, force)
    }

    /// Stops all containers of this pool and waits for them.
    pub fn autostop_and_wait(&self, ctx: PlanContext, message: Option<&str>) {
        *self.state.lock() = PoolState::Stopping;
        let containers = ctx.registry.containers_of(&self.name);
        let _ = self.autostop_plan.start(ctx, &containers, message);
        self.autostop_plan.wait();
    }

    /// Drops the queued autostart of a container started by other means.
    pub fn fulfil_autostart(&self, ct: &Container) -> bool {
        self.autostart_plan.fulfil_start(ct)
    }

    /// See [`Plan::request_reboot`](crate::plan::Plan::request_reboot).
    pub fn request_reboot(&self, ct: &Container) -> bool {
        self.autostart_plan.request_reboot(ct)
    }

    /// See [`Plan::fulfil_reboot`](crate::plan::Plan::fulfil_reboot).
    pub fn fulfil_reboot(&self, ct: &Arc<Container>) -> bool {
        self.autostart_plan.fulfil_reboot(ct)
    }

    /// See [`Plan::cancel_reboot`](crate::plan::Plan::cancel_reboot).
    pub fn cancel_reboot(&self, ct: &Container) -> bool {
        self.autostart_plan.cancel_reboot(ct)
    }

    /// Turns off autostart of `ct` and drops it from the start plan,
    /// including a queued start and a pending reboot.
    ///
    /// # Errors
    ///
    /// Returns an error if the container's lock cannot be obtained.
    pub fn unset_autostart(&self, ct: &Container) -> Result<bool> {
        ct.exclusively(|| {
            ct.set_autostart(None);
            let dequeued = self.autostart_plan.remove(ct);
            tracing::info!(pool = %self.name, id = ct.id(), dequeued, "autostart unset");
            dequeued
        })
    }

    /// Stops admitting container starts.
    pub fn begin_stop(&self) {
        self.autostart_plan.stop();
    }

    /// Stops admitting container stops.
    pub fn all_stop(&self) {
        self.autostop_plan.stop();
    }

    /// Stops both plans.
    pub fn stop(&self) {
        self.begin_stop();
        self.all_stop();
    }

    /// Resets the abort flag before an export.
    pub fn begin_export(&self) {
        self.export_aborted.store(false, Ordering::SeqCst);
    }

    /// Aborts an export: containers not yet stopped are left running.
    pub fn abort_export(&self) {
        self.export_aborted.store(true, Ordering::SeqCst);
        self.autostop_plan.clear();
        tracing::warn!(pool = %self.name, "export aborted");
    }

    /// Whether [`abort_export`](Self::abort_export) was called since the
    /// last [`begin_export`](Self::begin_export).
    #[must_use]
    pub fn is_export_aborted(&self) -> bool {
        self.export_aborted.load(Ordering::SeqCst)
    }
}

impl fmt::Debug for Pool {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Pool")
            .field("name", &self.name)
            .field("state", &self.state())
            .finish_non_exhaustive()
    }
}

impl Lockable for Pool {
    fn resource_lock(&self) -> &ResourceLock {
        &self.lock
    }
}

impl Manipulable for Pool {
    fn manipulation(&self) -> &Manipulation {
        &self.manipulation
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::plan::PlanPhase;

    fn pool() -> Pool {
        Pool::new(&LockManager::new(), &EventBus::new(), "tank", 2, 4, Duration::from_secs(1))
    }

    #[test]
    fn lifecycle_states() {
        let pool = pool();
        assert_eq!(pool.state(), PoolState::Importing);
        assert!(!pool.is_active());
        pool.activate();
        assert!(pool.is_active());
        pool.disable();
        assert_eq!(pool.state(), PoolState::Disabled);
    }

    #[test]
    fn parallelism_resizes_plans() {
        let pool = pool();
        pool.set_parallelism(Some(5), None).unwrap();
        assert_eq!(pool.autostart_plan().limit(), 5);
        assert_eq!(pool.autostop_plan().limit(), 4);
        assert!(pool.set_parallelism(None, Some(0)).is_err());
    }

    #[test]
    fn abort_export_sets_flag() {
        let pool = pool();
        pool.begin_export();
        assert!(!pool.is_export_aborted());
        pool.abort_export();
        assert!(pool.is_export_aborted());
        assert_eq!(pool.autostop_plan().phase(), PlanPhase::Idle);
    }

    #[test]
    fn manipulation_resource_names_pool() {
        assert_eq!(pool().manipulation_resource().to_string(), "pool tank");
    }
}
