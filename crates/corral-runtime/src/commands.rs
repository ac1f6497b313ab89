//! Lock-guarded daemon commands.
//!
//! Each mutating command marks its target as manipulated, does its work
//! (often through a runner as the container owner) and reports the outcome
//! as a [`CommandResult`]. Lookup failures and lock contention are returned
//! as errors; failures of the operation itself are failed results.

use std::path::PathBuf;
use std::sync::Arc;
use std::time::{Duration, Instant};

use chrono::{DateTime, Utc};
use corral_common::config::DaemonConfig;
use corral_common::error::{CorralError, Result};
use corral_common::types::{AutoStartConfig, ContainerState};
use serde::Serialize;

use crate::control::{CommandId, CommandResult, Frontend, RunnerOptions};
use crate::driver::{LifecycleDriver, LxcDriver, StartOptions, StopOptions};
use crate::entity::Container;
use crate::event::{Event, EventPayload};
use crate::lock::Lockable;
use crate::manipulation::{Actor, Manipulable, ManipulationHandle, ManipulationInfo, ManipulationPolicy, manipulate};
use crate::plan::sequence::{StateSequence, WaitOutcome};
use crate::plan::{EntryOutcome, Operation, PlanContext, PlanEntry};
use crate::pool::{Pool, PoolState};
use crate::registry::Registry;

/// Default priority of containers started through the queue.
pub const DEFAULT_QUEUE_PRIORITY: i32 = 10;

/// Arguments of [`Daemon::ct_start`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StartRequest {
    /// Go through the pool's start plan instead of starting right away.
    pub queue: bool,
    /// Wait for the container to be running.
    pub wait: bool,
    /// Queue priority.
    pub priority: i32,
    /// Restart the container if it is already running.
    pub force: bool,
    /// Verbose LXC logging.
    pub debug: bool,
}

impl Default for StartRequest {
    fn default() -> Self {
        Self {
            queue: false,
            wait: true,
            priority: DEFAULT_QUEUE_PRIORITY,
            force: false,
            debug: false,
        }
    }
}

/// Row of [`Daemon::pool_list`].
#[derive(Debug, Clone, Serialize)]
pub struct PoolInfo {
    /// Pool name.
    pub name: String,
    /// Lifecycle state.
    pub state: PoolState,
    /// Concurrent starts.
    pub parallel_start: usize,
    /// Concurrent stops.
    pub parallel_stop: usize,
    /// Number of containers.
    pub containers: usize,
    /// Number of running containers.
    pub running: usize,
    /// Containers waiting in the start plan.
    pub queued: usize,
}

/// Result of [`Daemon::ct_show`].
#[derive(Debug, Clone, Serialize)]
pub struct ContainerInfo {
    /// Pool name.
    pub pool: String,
    /// Container ID.
    pub id: String,
    /// Owner name.
    pub user: String,
    /// Group name.
    pub group: String,
    /// Lifecycle state.
    pub state: ContainerState,
    /// Start of the current run.
    pub started_at: Option<DateTime<Utc>>,
    /// Autostart settings.
    pub autostart: Option<AutoStartConfig>,
    /// Ongoing manipulation.
    pub manipulation: Option<ManipulationInfo>,
}

/// The daemon's command handlers.
pub struct Daemon {
    registry: Arc<Registry>,
    driver: Arc<dyn LifecycleDriver>,
    frontend: Frontend,
    cgroup_root: Option<PathBuf>,
    start_timeout: Duration,
    stop_timeout: Duration,
}

impl Daemon {
    /// Handlers acting through `driver`; runner commands go through
    /// `frontend`.
    #[must_use]
    pub fn new(registry: Arc<Registry>, driver: Arc<dyn LifecycleDriver>, frontend: Frontend) -> Self {
        Self {
            registry,
            driver,
            frontend,
            cgroup_root: None,
            start_timeout: Duration::from_secs(corral_common::constants::DEFAULT_START_TIMEOUT_SECS),
            stop_timeout: Duration::from_secs(corral_common::constants::DEFAULT_STOP_TIMEOUT_SECS),
        }
    }

    /// Handlers driving containers with LXC through the runner.
    ///
    /// # Errors
    ///
    /// Returns [`CorralError::NotFound`] if the runner executable cannot be
    /// found.
    pub fn from_config(cfg: &DaemonConfig, registry: Arc<Registry>) -> Result<Self> {
        let frontend = Frontend::locate(cfg.runner_path.as_deref())?.with_default_timeout(cfg.runner_timeout());
        tracing::info!(runner = %frontend.runner_path().display(), "runner located");
        let driver = LxcDriver::new(frontend.clone(), Some(cfg.cgroup_root.clone()));
        let mut daemon = Self::new(registry, Arc::new(driver), frontend);
        daemon.cgroup_root = Some(cfg.cgroup_root.clone());
        daemon.start_timeout = cfg.start_timeout();
        daemon.stop_timeout = cfg.stop_timeout();
        Ok(daemon)
    }

    /// Overrides how long a start may take.
    #[must_use]
    pub const fn with_start_timeout(mut self, timeout: Duration) -> Self {
        self.start_timeout = timeout;
        self
    }

    /// The entity registry.
    #[must_use]
    pub const fn registry(&self) -> &Arc<Registry> {
        &self.registry
    }

    /// Context handed to plans.
    #[must_use]
    pub fn plan_context(&self) -> PlanContext {
        PlanContext {
            registry: Arc::clone(&self.registry),
            driver: Arc::clone(&self.driver),
        }
    }

    /// Starts a container.
    ///
    /// # Errors
    ///
    /// Returns an error for an unknown container, when it is being
    /// manipulated by someone else, or when its pool's plan is stopped.
    pub fn ct_start(&self, pool: &str, id: &str, req: &StartRequest) -> Result<CommandResult> {
        let ct = self.registry.container(pool, id)?;
        let pool = self.registry.pool(pool)?;
        if req.queue {
            return Self::start_queued(&pool, &ct, req, self.start_timeout);
        }

        let actor = Actor::new("ct_start");
        self.manipulated(&*ct, &actor, ManipulationPolicy::Fail, |handle| {
            self.start_now(&pool, &ct, req, handle)
        })
    }

    fn start_queued(pool: &Pool, ct: &Arc<Container>, req: &StartRequest, timeout: Duration) -> Result<CommandResult> {
        let opts = StartOptions {
            force: req.force,
            debug: req.debug,
        };
        if !req.wait {
            let queued = pool
                .autostart_plan()
                .enqueue(PlanEntry::new(Arc::clone(ct), req.priority, Operation::Start(opts)));
            return Ok(if queued {
                CommandResult::ok(serde_json::Value::Null)
            } else {
                CommandResult::error("not queued")
            });
        }
        Ok(match pool.autostart_plan().start_ct(ct, req.priority, opts, timeout)? {
            EntryOutcome::Done => CommandResult::ok(serde_json::Value::Null),
            EntryOutcome::TimedOut => CommandResult::ok("Timed out"),
            EntryOutcome::Failed(message) => CommandResult::error(message),
            EntryOutcome::Cancelled => CommandResult::error("start cancelled"),
        })
    }

    fn start_now(&self, pool: &Pool, ct: &Arc<Container>, req: &StartRequest, handle: &ManipulationHandle<'_>) -> Result<CommandResult> {
        if !ct.can_start(pool) {
            return Err(CorralError::CommandFailed {
                message: "start not available".into(),
            });
        }
        if ct.state() == ContainerState::Running {
            if !req.force {
                return Ok(CommandResult::ok(serde_json::Value::Null));
            }
            handle.progress("Stopping the container");
            self.driver.stop(&self.registry, ct, &self.stop_options(false))?;
        }

        let subscription = self.registry.bus().subscribe();
        let _ = pool.fulfil_autostart(ct);
        handle.progress("Starting container");
        let opts = StartOptions {
            force: req.force,
            debug: req.debug,
        };
        if let Err(e) = self.driver.start(&self.registry, ct, &opts) {
            return Ok(CommandResult::error(e.to_string()));
        }
        if !req.wait {
            return Ok(CommandResult::ok(serde_json::Value::Null));
        }

        handle.progress("Waiting for the container to start");
        let deadline = Instant::now() + self.start_timeout;
        Ok(match StateSequence::start().wait(&subscription, ct.pool(), ct.id(), deadline) {
            WaitOutcome::Reached => CommandResult::ok(serde_json::Value::Null),
            WaitOutcome::Failed(_) | WaitOutcome::TimedOut => CommandResult::error("container failed to start"),
        })
    }

    /// Stops a container, killing it when `kill` is set.
    ///
    /// # Errors
    ///
    /// Returns an error for an unknown container or when it is being
    /// manipulated by someone else.
    pub fn ct_stop(&self, pool: &str, id: &str, kill: bool) -> Result<CommandResult> {
        let ct = self.registry.container(pool, id)?;
        let actor = Actor::new("ct_stop");
        self.manipulated(&*ct, &actor, ManipulationPolicy::Fail, |handle| self.stop_now(&ct, kill, handle))
    }

    fn stop_now(&self, ct: &Arc<Container>, kill: bool, handle: &ManipulationHandle<'_>) -> Result<CommandResult> {
        if ct.state() == ContainerState::Stopped {
            return Ok(CommandResult::ok(serde_json::Value::Null));
        }
        handle.progress("Stopping the container");
        Ok(match self.driver.stop(&self.registry, ct, &self.stop_options(kill)) {
            Ok(()) => CommandResult::ok(serde_json::Value::Null),
            Err(e) => CommandResult::error(e.to_string()),
        })
    }

    fn stop_options(&self, kill: bool) -> StopOptions {
        StopOptions {
            kill,
            timeout: Some(self.stop_timeout),
            message: None,
        }
    }

    /// Restarts a container.
    ///
    /// A running container scheduled by its pool's running start plan is
    /// stopped and then started again by the plan, within its concurrency
    /// limit. Other containers are stopped and started right away.
    ///
    /// # Errors
    ///
    /// Returns an error for an unknown container or when it is being
    /// manipulated by someone else.
    pub fn ct_restart(&self, pool: &str, id: &str) -> Result<CommandResult> {
        let ct = self.registry.container(pool, id)?;
        let pool = self.registry.pool(pool)?;
        let actor = Actor::new("ct_restart");
        self.manipulated(&*ct, &actor, ManipulationPolicy::Fail, |handle| {
            let through_plan = ct.state() != ContainerState::Stopped
                && pool.autostart_plan().is_running()
                && pool.request_reboot(&ct);
            if through_plan {
                tracing::info!(pool = ct.pool(), id = ct.id(), "reboot through start plan");
                let stopped = self.stop_now(&ct, false, handle);
                let reached = matches!(&stopped, Ok(r) if r.is_ok()) && ct.state() == ContainerState::Stopped;
                if !reached {
                    let _ = pool.cancel_reboot(&ct);
                }
                return stopped;
            }
            let stopped = self.stop_now(&ct, false, handle)?;
            if !stopped.is_ok() {
                return Ok(stopped);
            }
            self.start_now(&pool, &ct, &StartRequest::default(), handle)
        })
    }

    /// Runs `argv` inside the container's security context.
    ///
    /// `opts` may carry stdio bindings and a timeout; the result data is
    /// the exit status.
    ///
    /// # Errors
    ///
    /// Returns an error for an unknown container, when it is being
    /// manipulated by someone else, or when the runner cannot be spawned.
    pub fn ct_runscript(&self, pool: &str, id: &str, argv: Vec<String>, opts: RunnerOptions) -> Result<CommandResult> {
        let ct = self.registry.container(pool, id)?;
        let actor = Actor::new("ct_runscript");
        self.manipulated(&*ct, &actor, ManipulationPolicy::Fail, |handle| {
            handle.progress("Executing script");
            let target = ct.runner_target(self.cgroup_root.as_deref());
            self.frontend.exec_runner(&target, CommandId::Exec, opts.args(argv))
        })
    }

    /// Lists pools without waiting for ongoing manipulations.
    ///
    /// # Errors
    ///
    /// Returns an error if a pool lock cannot be obtained.
    pub fn pool_list(&self) -> Result<Vec<PoolInfo>> {
        self.registry
            .pools()
            .iter()
            .map(|pool| {
                pool.inclusively(|| {
                    let containers = self.registry.containers_of(pool.name());
                    PoolInfo {
                        name: pool.name().to_owned(),
                        state: pool.state(),
                        parallel_start: pool.autostart_plan().limit(),
                        parallel_stop: pool.autostop_plan().limit(),
                        containers: containers.len(),
                        running: containers
                            .iter()
                            .filter(|ct| ct.state() == ContainerState::Running)
                            .count(),
                        queued: pool.autostart_plan().queue().len(),
                    }
                })
            })
            .collect()
    }

    /// Describes a container, including an ongoing manipulation.
    ///
    /// # Errors
    ///
    /// Returns an error for an unknown container or if its lock cannot be
    /// obtained.
    pub fn ct_show(&self, pool: &str, id: &str) -> Result<ContainerInfo> {
        let ct = self.registry.container(pool, id)?;
        ct.inclusively(|| ContainerInfo {
            pool: ct.pool().to_owned(),
            id: ct.id().to_owned(),
            user: ct.user().name().to_owned(),
            group: ct.group().name().to_owned(),
            state: ct.state(),
            started_at: ct.started_at(),
            autostart: ct.autostart(),
            manipulation: ct.manipulation().info(),
        })
    }

    /// Changes how many containers of `pool` start and stop at a time.
    ///
    /// # Errors
    ///
    /// Returns an error for an unknown pool or a zero limit.
    pub fn pool_set_parallelism(&self, pool: &str, start: Option<usize>, stop: Option<usize>) -> Result<()> {
        let pool = self.registry.pool(pool)?;
        pool.exclusively(|| pool.set_parallelism(start, stop))?
    }

    /// Starts the autostart plans of all active pools.
    pub fn autostart_all(&self, force: bool) -> usize {
        self.registry
            .pools()
            .iter()
            .filter(|pool| pool.is_active())
            .map(|pool| pool.autostart(self.plan_context(), force))
            .sum()
    }

    /// Stops every container of every pool and shuts the plans down.
    pub fn shutdown(&self, message: Option<&str>) {
        for pool in self.registry.pools() {
            tracing::info!(pool = pool.name(), "stopping pool");
            pool.begin_stop();
            pool.autostop_and_wait(self.plan_context(), message);
            pool.all_stop();
            pool.disable();
        }
        self.registry.bus().shutdown();
    }

    fn manipulated<R, T>(
        &self,
        resource: &R,
        actor: &Actor,
        policy: ManipulationPolicy,
        f: impl FnOnce(&ManipulationHandle<'_>) -> Result<T>,
    ) -> Result<T>
    where
        R: Manipulable + ?Sized,
    {
        let bus = self.registry.bus();
        let ident = resource.manipulation_resource().to_string();
        manipulate(resource, actor, policy, |handle| {
            bus.publish(manipulation_event(&ident, actor, true));
            let result = f(handle);
            bus.publish(manipulation_event(&ident, actor, false));
            result
        })
    }
}

impl std::fmt::Debug for Daemon {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Daemon")
            .field("frontend", &self.frontend)
            .field("start_timeout", &self.start_timeout)
            .finish_non_exhaustive()
    }
}

fn manipulation_event(resource: &str, actor: &Actor, active: bool) -> Event {
    Event::new(EventPayload::Manipulation {
        resource: resource.to_owned(),
        holder: actor.label().to_owned(),
        active,
    })
}
