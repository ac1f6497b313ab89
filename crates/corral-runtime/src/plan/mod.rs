//! Bounded-concurrency scheduling of container starts and stops.
//!
//! A [`Plan`] owns a priority queue of containers and a set of worker
//! threads, one per slot of its concurrency limit. Each admitted entry is
//! started or stopped under the container's manipulation guard; an entry's
//! failure is recorded and never stops the plan. Each pool has an
//! [`AutoStartPlan`] and an [`AutoStopPlan`].

mod auto_start;
mod auto_stop;
mod queue;
pub mod sequence;

use std::collections::{BTreeMap, HashMap, HashSet};
use std::fmt;
use std::sync::Arc;
use std::thread::JoinHandle;
use std::time::{Duration, Instant};

use corral_common::error::{CorralError, Result};
use corral_common::types::ContainerState;
use parking_lot::{Condvar, Mutex, MutexGuard};
use serde::Serialize;

pub use auto_start::AutoStartPlan;
pub use auto_stop::AutoStopPlan;
pub use queue::{Operation, PlanEntry, QueuedEntry};
use queue::EntryQueue;
use sequence::{StateSequence, WaitOutcome};

use crate::driver::{LifecycleDriver, StartOptions, StopOptions};
use crate::entity::Container;
use crate::event::EventBus;
use crate::manipulation::{Actor, ManipulationPolicy, manipulate};
use crate::registry::Registry;

/// Which operation a plan performs.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PlanKind {
    /// Starts containers.
    Start,
    /// Stops containers.
    Stop,
}

impl PlanKind {
    /// Name used in logs and as the manipulating actor.
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Start => "autostart",
            Self::Stop => "autostop",
        }
    }
}

impl fmt::Display for PlanKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// `idle → running → stopping → idle`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum PlanPhase {
    /// Not admitting entries; queued entries wait.
    Idle,
    /// Workers admit entries.
    Running,
    /// Letting in-flight work finish.
    Stopping,
}

/// How a plan entry ended.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "outcome", content = "message", rename_all = "snake_case")]
pub enum EntryOutcome {
    /// The container reached its target state.
    Done,
    /// The operation failed.
    Failed(String),
    /// The container did not reach its target state in time.
    TimedOut,
    /// Removed from the queue before admission.
    Cancelled,
}

/// What workers need to act on containers.
///
/// Held by a running plan and released when it stops.
#[derive(Clone)]
pub struct PlanContext {
    /// Entity registry.
    pub registry: Arc<Registry>,
    /// Performs the actual starts and stops.
    pub driver: Arc<dyn LifecycleDriver>,
}

impl fmt::Debug for PlanContext {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PlanContext").finish_non_exhaustive()
    }
}

#[derive(Debug, Clone, Copy)]
struct Reboot {
    priority: i32,
    delay: Duration,
}

struct PlanState {
    phase: PlanPhase,
    queue: EntryQueue,
    running: HashSet<String>,
    limit: usize,
    workers: usize,
    managed: HashMap<String, Reboot>,
    reboots: HashMap<String, Reboot>,
    outcomes: BTreeMap<String, EntryOutcome>,
    context: Option<PlanContext>,
}

impl PlanState {
    fn is_scheduled(&self, id: &str) -> bool {
        self.queue.contains(id) || self.running.contains(id)
    }

    fn is_drained(&self) -> bool {
        self.queue.is_empty() && self.running.is_empty()
    }
}

struct Shared {
    pool: String,
    kind: PlanKind,
    entry_timeout: Duration,
    bus: Arc<EventBus>,
    state: Mutex<PlanState>,
    changed: Condvar,
}

/// A per-pool scheduler of one [`PlanKind`].
pub struct Plan {
    shared: Arc<Shared>,
    handles: Mutex<Vec<JoinHandle<()>>>,
}

impl fmt::Debug for Plan {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let state = self.shared.state.lock();
        f.debug_struct("Plan")
            .field("pool", &self.shared.pool)
            .field("kind", &self.shared.kind)
            .field("phase", &state.phase)
            .field("queued", &state.queue.len())
            .field("running", &state.running.len())
            .field("limit", &state.limit)
            .finish()
    }
}

impl Plan {
    /// An idle plan admitting at most `limit` entries at a time.
    ///
    /// `entry_timeout` bounds how long a worker waits for a started
    /// container to come up.
    #[must_use]
    pub fn new(pool: impl Into<String>, kind: PlanKind, limit: usize, entry_timeout: Duration, bus: Arc<EventBus>) -> Self {
        Self {
            shared: Arc::new(Shared {
                pool: pool.into(),
                kind,
                entry_timeout,
                bus,
                state: Mutex::new(PlanState {
                    phase: PlanPhase::Idle,
                    queue: EntryQueue::default(),
                    running: HashSet::new(),
                    limit: limit.max(1),
                    workers: 0,
                    managed: HashMap::new(),
                    reboots: HashMap::new(),
                    outcomes: BTreeMap::new(),
                    context: None,
                }),
                changed: Condvar::new(),
            }),
            handles: Mutex::new(Vec::new()),
        }
    }

    /// Owning pool.
    #[must_use]
    pub fn pool(&self) -> &str {
        &self.shared.pool
    }

    /// Operation performed by this plan.
    #[must_use]
    pub fn kind(&self) -> PlanKind {
        self.shared.kind
    }

    /// Current phase.
    #[must_use]
    pub fn phase(&self) -> PlanPhase {
        self.shared.state.lock().phase
    }

    /// Whether workers admit entries.
    #[must_use]
    pub fn is_running(&self) -> bool {
        self.phase() == PlanPhase::Running
    }

    /// Concurrency limit.
    #[must_use]
    pub fn limit(&self) -> usize {
        self.shared.state.lock().limit
    }

    /// Begins admitting entries.
    pub fn start(&self, ctx: PlanContext) {
        let mut state = self.shared.state.lock();
        if state.phase != PlanPhase::Idle {
            return;
        }
        state.phase = PlanPhase::Running;
        state.context = Some(ctx);
        tracing::info!(
            pool = %self.shared.pool,
            plan = %self.shared.kind,
            limit = state.limit,
            queued = state.queue.len(),
            "plan started"
        );
        self.spawn_workers(&mut state);
        self.shared.changed.notify_all();
    }

    /// Changes the concurrency limit.
    ///
    /// Entries already running are not affected; extra workers exit after
    /// finishing their current entry.
    ///
    /// # Errors
    ///
    /// Returns [`CorralError::Config`] for a zero limit.
    pub fn resize(&self, limit: usize) -> Result<()> {
        if limit == 0 {
            return Err(CorralError::Config {
                message: format!("{} limit of pool {} must be at least 1", self.shared.kind, self.shared.pool),
            });
        }
        let mut state = self.shared.state.lock();
        tracing::info!(pool = %self.shared.pool, plan = %self.shared.kind, from = state.limit, to = limit, "plan resized");
        state.limit = limit;
        if state.phase == PlanPhase::Running {
            self.spawn_workers(&mut state);
        }
        self.shared.changed.notify_all();
        Ok(())
    }

    /// Queues `entry` without waiting for it.
    ///
    /// Returns `false` if the container is already queued or running, or
    /// the plan is stopping.
    pub fn enqueue(&self, entry: PlanEntry) -> bool {
        let mut state = self.shared.state.lock();
        self.push_entry(&mut state, entry)
    }

    fn push_entry(&self, state: &mut PlanState, entry: PlanEntry) -> bool {
        let id = entry.id().to_owned();
        if state.phase == PlanPhase::Stopping || state.is_scheduled(&id) {
            tracing::debug!(pool = %self.shared.pool, id = %id, "not queueing container");
            return false;
        }
        tracing::debug!(
            pool = %self.shared.pool,
            plan = %self.shared.kind,
            id = %id,
            priority = entry.priority,
            "container queued"
        );
        let _ = state.managed.insert(
            id.clone(),
            Reboot {
                priority: entry.priority,
                delay: entry.delay,
            },
        );
        let _ = state.outcomes.remove(&id);
        state.queue.push(entry);
        self.shared.changed.notify_all();
        true
    }

    /// Queues a start of `ct` and waits until it runs or `timeout` passes.
    ///
    /// The wait ends early when the worker reports a failure. A timeout only
    /// ends the wait; the queued or in-flight start continues.
    ///
    /// # Errors
    ///
    /// Returns [`CorralError::PlanStopped`] when the plan is not running.
    pub fn start_ct(&self, ct: &Arc<Container>, priority: i32, opts: StartOptions, timeout: Duration) -> Result<EntryOutcome> {
        let subscription = self.shared.bus.subscribe();
        let (tx, rx) = crossbeam_channel::bounded(1);
        let queued = {
            let mut state = self.shared.state.lock();
            if state.phase != PlanPhase::Running {
                return Err(CorralError::PlanStopped {
                    pool: self.shared.pool.clone(),
                });
            }
            let entry = PlanEntry::new(Arc::clone(ct), priority, Operation::Start(opts)).with_client(tx);
            self.push_entry(&mut state, entry)
        };
        // Already scheduled by someone else; rely on state events alone.
        let outcomes = if queued { rx } else { crossbeam_channel::never() };

        let deadline = Instant::now() + timeout;
        let mut sequence = StateSequence::start();
        loop {
            let remaining = deadline.saturating_duration_since(Instant::now());
            if remaining.is_zero() {
                return Ok(EntryOutcome::TimedOut);
            }
            crossbeam_channel::select! {
                recv(subscription.receiver()) -> event => {
                    let Ok(event) = event else {
                        return Ok(EntryOutcome::Cancelled);
                    };
                    let Some(state) = event.state_of(ct.pool(), ct.id()) else {
                        continue;
                    };
                    match sequence.observe(state) {
                        sequence::Step::Pending => {}
                        sequence::Step::Reached => return Ok(EntryOutcome::Done),
                        sequence::Step::Failed(state) => return Ok(unexpected_state(state)),
                    }
                }
                recv(outcomes) -> outcome => return Ok(outcome.unwrap_or(EntryOutcome::Cancelled)),
                default(remaining) => return Ok(EntryOutcome::TimedOut),
            }
        }
    }

    /// Drops the queued entry of `ct`, which was started by other means.
    pub fn fulfil_start(&self, ct: &Container) -> bool {
        let mut state = self.shared.state.lock();
        let Some(entry) = state.queue.remove(ct.id()) else {
            return false;
        };
        tracing::debug!(pool = %self.shared.pool, id = ct.id(), "queued start fulfilled");
        entry.notify(&EntryOutcome::Done);
        let _ = state.outcomes.insert(ct.id().to_owned(), EntryOutcome::Done);
        self.shared.changed.notify_all();
        true
    }

    /// Forgets `ct`: its queued entry and any pending reboot.
    pub fn remove(&self, ct: &Container) -> bool {
        let mut state = self.shared.state.lock();
        let _ = state.managed.remove(ct.id());
        let _ = state.reboots.remove(ct.id());
        let Some(entry) = state.queue.remove(ct.id()) else {
            return false;
        };
        entry.notify(&EntryOutcome::Cancelled);
        self.shared.changed.notify_all();
        true
    }

    /// Discards all queued entries without running them.
    pub fn clear(&self) {
        let mut state = self.shared.state.lock();
        Self::cancel_queued(&mut state);
        self.shared.changed.notify_all();
    }

    fn cancel_queued(state: &mut PlanState) {
        for entry in state.queue.drain() {
            entry.notify(&EntryOutcome::Cancelled);
            let _ = state.outcomes.insert(entry.id().to_owned(), EntryOutcome::Cancelled);
        }
    }

    /// Cancels queued entries, lets in-flight ones finish and returns to
    /// idle.
    pub fn stop(&self) {
        {
            let mut state = self.shared.state.lock();
            if state.phase == PlanPhase::Idle {
                return;
            }
            state.phase = PlanPhase::Stopping;
            Self::cancel_queued(&mut state);
            tracing::info!(
                pool = %self.shared.pool,
                plan = %self.shared.kind,
                in_flight = state.running.len(),
                "plan stopping"
            );
            self.shared.changed.notify_all();
        }

        let handles = std::mem::take(&mut *self.handles.lock());
        for handle in handles {
            if handle.join().is_err() {
                tracing::error!(pool = %self.shared.pool, plan = %self.shared.kind, "plan worker panicked");
            }
        }

        let mut state = self.shared.state.lock();
        state.phase = PlanPhase::Idle;
        state.context = None;
        self.shared.changed.notify_all();
        tracing::info!(pool = %self.shared.pool, plan = %self.shared.kind, "plan stopped");
    }

    /// Blocks until nothing is queued or running, or the plan stops.
    pub fn wait(&self) {
        let mut state = self.shared.state.lock();
        while state.phase == PlanPhase::Running && !state.is_drained() {
            self.shared.changed.wait(&mut state);
        }
    }

    /// Records a reboot of a managed container.
    ///
    /// Returns `false` if this plan never scheduled `ct`.
    pub fn request_reboot(&self, ct: &Container) -> bool {
        let mut state = self.shared.state.lock();
        let Some(reboot) = state.managed.get(ct.id()).copied() else {
            return false;
        };
        let _ = state.reboots.insert(ct.id().to_owned(), reboot);
        tracing::debug!(pool = %self.shared.pool, id = ct.id(), "reboot requested");
        true
    }

    /// Forgets a requested reboot that will not happen, e.g. because the
    /// stop meant to trigger it failed.
    pub fn cancel_reboot(&self, ct: &Container) -> bool {
        let cancelled = self.shared.state.lock().reboots.remove(ct.id()).is_some();
        if cancelled {
            tracing::debug!(pool = %self.shared.pool, id = ct.id(), "reboot cancelled");
        }
        cancelled
    }

    /// Re-queues a stopped container whose reboot was requested, with its
    /// original priority. A reboot is fulfilled at most once.
    pub fn fulfil_reboot(&self, ct: &Arc<Container>) -> bool {
        let mut state = self.shared.state.lock();
        let Some(reboot) = state.reboots.remove(ct.id()) else {
            return false;
        };
        if !state.is_scheduled(ct.id()) {
            let entry = PlanEntry::new(Arc::clone(ct), reboot.priority, Operation::Start(StartOptions::default()))
                .with_delay(reboot.delay);
            let _ = self.push_entry(&mut state, entry);
        }
        true
    }

    /// Queued entries in admission order.
    #[must_use]
    pub fn queue(&self) -> Vec<QueuedEntry> {
        self.shared.state.lock().queue.snapshot()
    }

    /// IDs of containers being processed.
    #[must_use]
    pub fn running(&self) -> Vec<String> {
        let mut running: Vec<String> = self.shared.state.lock().running.iter().cloned().collect();
        running.sort();
        running
    }

    /// Last outcome per container.
    #[must_use]
    pub fn outcomes(&self) -> BTreeMap<String, EntryOutcome> {
        self.shared.state.lock().outcomes.clone()
    }

    fn spawn_workers(&self, state: &mut PlanState) {
        let mut handles = self.handles.lock();
        handles.retain(|h| !h.is_finished());
        while state.workers < state.limit {
            let shared = Arc::clone(&self.shared);
            let name = format!("{}-{}-{}", self.shared.pool, self.shared.kind, state.workers);
            match std::thread::Builder::new().name(name).spawn(move || worker(&shared)) {
                Ok(handle) => {
                    state.workers += 1;
                    handles.push(handle);
                }
                Err(e) => {
                    tracing::error!(pool = %self.shared.pool, error = %e, "unable to spawn plan worker");
                    break;
                }
            }
        }
    }
}

impl Drop for Plan {
    fn drop(&mut self) {
        self.stop();
    }
}

fn worker(shared: &Shared) {
    let mut state = shared.state.lock();
    loop {
        if state.phase != PlanPhase::Running || state.workers > state.limit {
            break;
        }
        let Some(ctx) = state.context.clone() else {
            break;
        };
        let Some(entry) = state.queue.pop() else {
            shared.changed.wait(&mut state);
            continue;
        };
        let id = entry.id().to_owned();
        let _ = state.running.insert(id.clone());

        let outcome = MutexGuard::unlocked(&mut state, || {
            let outcome = execute(shared, &ctx, &entry);
            drop(ctx);
            outcome
        });

        let _ = state.running.remove(&id);
        entry.notify(&outcome);
        let _ = state.outcomes.insert(id, outcome.clone());
        shared.changed.notify_all();

        if outcome == EntryOutcome::Done && !entry.delay.is_zero() {
            let until = Instant::now() + entry.delay;
            while state.phase == PlanPhase::Running && Instant::now() < until {
                let _ = shared.changed.wait_until(&mut state, until);
            }
        }
    }
    state.workers -= 1;
    shared.changed.notify_all();
}

fn execute(shared: &Shared, ctx: &PlanContext, entry: &PlanEntry) -> EntryOutcome {
    let ct = &entry.container;
    let actor = Actor::new(shared.kind.as_str());
    tracing::info!(
        pool = %shared.pool,
        plan = %shared.kind,
        id = ct.id(),
        priority = entry.priority,
        "admitting container"
    );
    let result = match &entry.operation {
        Operation::Start(opts) => start_entry(shared, ctx, ct, opts, &actor),
        Operation::Stop(opts) => stop_entry(ctx, ct, opts, &actor),
    };
    let outcome = result.unwrap_or_else(|e| EntryOutcome::Failed(e.to_string()));
    match &outcome {
        EntryOutcome::Done => {
            tracing::info!(pool = %shared.pool, plan = %shared.kind, id = ct.id(), "container done");
        }
        other => {
            tracing::warn!(pool = %shared.pool, plan = %shared.kind, id = ct.id(), outcome = ?other, "container not done");
        }
    }
    outcome
}

fn start_entry(
    shared: &Shared,
    ctx: &PlanContext,
    ct: &Arc<Container>,
    opts: &StartOptions,
    actor: &Actor,
) -> Result<EntryOutcome> {
    manipulate(&**ct, actor, ManipulationPolicy::Wait, |handle| {
        if ct.state() == ContainerState::Running {
            if !opts.force {
                return Ok(EntryOutcome::Done);
            }
            ctx.driver.stop(&ctx.registry, ct, &StopOptions::default())?;
        }
        let subscription = shared.bus.subscribe();
        ctx.driver.start(&ctx.registry, ct, opts)?;
        handle.progress("Waiting for the container to start");
        let deadline = Instant::now() + shared.entry_timeout;
        Ok(match StateSequence::start().wait(&subscription, ct.pool(), ct.id(), deadline) {
            WaitOutcome::Reached => EntryOutcome::Done,
            WaitOutcome::Failed(state) => unexpected_state(state),
            WaitOutcome::TimedOut => EntryOutcome::TimedOut,
        })
    })
}

fn stop_entry(ctx: &PlanContext, ct: &Arc<Container>, opts: &StopOptions, actor: &Actor) -> Result<EntryOutcome> {
    manipulate(&**ct, actor, ManipulationPolicy::Wait, |handle| {
        if ct.state() == ContainerState::Stopped {
            return Ok(EntryOutcome::Done);
        }
        handle.progress("Stopping the container");
        ctx.driver.stop(&ctx.registry, ct, opts)?;
        Ok(EntryOutcome::Done)
    })
}

fn unexpected_state(state: ContainerState) -> EntryOutcome {
    EntryOutcome::Failed(format!("container entered state {state}"))
}
