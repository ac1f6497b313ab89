//! Reentrant shared/exclusive locks on daemon entities.
//!
//! All locks created from one [`LockManager`] share a single lock table so
//! that a holder about to block can walk the wait-for graph
//! (holder → wanted resource → its holders → what *they* wait for ...) and
//! fail with [`CorralError::DeadlockDetected`] instead of hanging.
//!
//! The table mutex is held only while inspecting or updating the table;
//! blocked holders park on a condition variable, so waiting on one resource
//! never stalls operations on unrelated ones.
//!
//! Waiter fairness is unspecified: a release wakes every waiter and whichever
//! compatible waiter re-checks first wins.

use std::collections::{HashMap, HashSet};
use std::fmt;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{Duration, Instant};

use corral_common::error::{CorralError, Result};
use corral_common::types::{LockMode, ResourceIdent};
use parking_lot::{Condvar, Mutex};

static NEXT_HOLDER: AtomicU64 = AtomicU64::new(1);

thread_local! {
    static CURRENT_HOLDER: Holder = Holder::new(
        std::thread::current()
            .name()
            .map_or_else(|| format!("{:?}", std::thread::current().id()), str::to_owned),
    );
}

/// An execution context that can hold locks.
///
/// Every thread has an implicit holder returned by [`Holder::current`].
#[derive(Clone)]
pub struct Holder {
    id: u64,
    label: Arc<str>,
}

impl Holder {
    /// Creates a new, distinct holder.
    #[must_use]
    pub fn new(label: impl Into<String>) -> Self {
        Self {
            id: NEXT_HOLDER.fetch_add(1, Ordering::Relaxed),
            label: Arc::from(label.into()),
        }
    }

    /// The holder bound to the calling thread.
    #[must_use]
    pub fn current() -> Self {
        CURRENT_HOLDER.with(Clone::clone)
    }

    /// Label used in diagnostics.
    #[must_use]
    pub fn label(&self) -> &str {
        &self.label
    }
}

impl PartialEq for Holder {
    fn eq(&self, other: &Self) -> bool {
        self.id == other.id
    }
}

impl Eq for Holder {}

impl fmt::Debug for Holder {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Holder({}, {})", self.id, self.label)
    }
}

impl fmt::Display for Holder {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.label)
    }
}

type ResourceId = u64;

#[derive(Default)]
struct LockEntry {
    exclusive: Option<(Holder, usize)>,
    shared: HashMap<u64, (Holder, usize)>,
}

impl LockEntry {
    fn can_grant(&self, holder: &Holder, mode: LockMode) -> bool {
        let exclusive_ok = self.exclusive.as_ref().is_none_or(|(h, _)| h == holder);
        match mode {
            LockMode::Shared => exclusive_ok,
            LockMode::Exclusive => exclusive_ok && self.shared.keys().all(|&id| id == holder.id),
        }
    }

    fn grant(&mut self, holder: &Holder, mode: LockMode) {
        match mode {
            LockMode::Shared => {
                self.shared
                    .entry(holder.id)
                    .or_insert_with(|| (holder.clone(), 0))
                    .1 += 1;
            }
            LockMode::Exclusive => match &mut self.exclusive {
                Some((_, count)) => *count += 1,
                None => self.exclusive = Some((holder.clone(), 1)),
            },
        }
    }

    fn release(&mut self, holder: &Holder, mode: LockMode) -> bool {
        match mode {
            LockMode::Shared => {
                let Some((_, count)) = self.shared.get_mut(&holder.id) else {
                    return false;
                };
                *count -= 1;
                if *count == 0 {
                    let _ = self.shared.remove(&holder.id);
                }
                true
            }
            LockMode::Exclusive => match &mut self.exclusive {
                Some((h, count)) if h == holder => {
                    *count -= 1;
                    if *count == 0 {
                        self.exclusive = None;
                    }
                    true
                }
                _ => false,
            },
        }
    }

    /// Holders that prevent `holder` from getting `mode`.
    fn blockers(&self, holder: &Holder, mode: LockMode) -> Vec<Holder> {
        let mut out = Vec::new();
        if let Some((h, _)) = &self.exclusive {
            if h != holder {
                out.push(h.clone());
            }
        }
        if mode == LockMode::Exclusive {
            out.extend(
                self.shared
                    .values()
                    .filter(|(h, _)| h != holder)
                    .map(|(h, _)| h.clone()),
            );
        }
        out
    }

    fn is_free(&self) -> bool {
        self.exclusive.is_none() && self.shared.is_empty()
    }
}

#[derive(Default)]
struct LockTable {
    entries: HashMap<ResourceId, LockEntry>,
    waiting: HashMap<u64, (ResourceId, LockMode)>,
}

impl LockTable {
    fn would_deadlock(&self, requester: &Holder, resource: ResourceId, mode: LockMode) -> bool {
        let Some(entry) = self.entries.get(&resource) else {
            return false;
        };
        let mut stack = entry.blockers(requester, mode);
        let mut seen = HashSet::new();

        while let Some(holder) = stack.pop() {
            if holder == *requester {
                return true;
            }
            if !seen.insert(holder.id) {
                continue;
            }
            if let Some(&(wanted, wanted_mode)) = self.waiting.get(&holder.id) {
                if let Some(next) = self.entries.get(&wanted) {
                    stack.extend(next.blockers(&holder, wanted_mode));
                }
            }
        }
        false
    }
}

/// Shared lock table for all entities of a daemon instance.
#[derive(Default)]
pub struct LockManager {
    table: Mutex<LockTable>,
    released: Condvar,
    next_resource: AtomicU64,
}

impl LockManager {
    /// Creates an empty lock manager.
    #[must_use]
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    /// Number of resources currently held by anyone.
    #[must_use]
    pub fn held_count(&self) -> usize {
        self.table.lock().entries.len()
    }

    fn allocate(&self) -> ResourceId {
        self.next_resource.fetch_add(1, Ordering::Relaxed)
    }
}

impl fmt::Debug for LockManager {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("LockManager")
            .field("held", &self.held_count())
            .finish_non_exhaustive()
    }
}

/// How long an acquisition may block.
#[derive(Debug, Clone, Copy)]
enum Blocking {
    No,
    Until(Instant),
    Forever,
}

/// Lock attached to one entity.
///
/// Identity is the lock object itself: two locks with equal
/// [`ResourceIdent`]s are still distinct resources.
pub struct ResourceLock {
    manager: Arc<LockManager>,
    id: ResourceId,
    ident: ResourceIdent,
}

impl ResourceLock {
    /// Creates a lock for the entity described by `ident`.
    #[must_use]
    pub fn new(manager: &Arc<LockManager>, ident: ResourceIdent) -> Self {
        Self {
            manager: Arc::clone(manager),
            id: manager.allocate(),
            ident,
        }
    }

    /// Diagnostic identity of the locked entity.
    #[must_use]
    pub const fn ident(&self) -> &ResourceIdent {
        &self.ident
    }

    /// Blocks until `holder` obtains the lock in `mode`.
    ///
    /// # Errors
    ///
    /// Returns [`CorralError::DeadlockDetected`] if blocking would close a
    /// wait-for cycle.
    pub fn acquire(&self, holder: &Holder, mode: LockMode) -> Result<()> {
        self.acquire_inner(holder, mode, Blocking::Forever)
    }

    /// Obtains the lock only if it is immediately available.
    ///
    /// # Errors
    ///
    /// Returns [`CorralError::ResourceLocked`] naming the current holder.
    pub fn try_acquire(&self, holder: &Holder, mode: LockMode) -> Result<()> {
        self.acquire_inner(holder, mode, Blocking::No)
    }

    /// Blocks for at most `timeout`.
    ///
    /// # Errors
    ///
    /// Returns [`CorralError::ResourceLocked`] on timeout and
    /// [`CorralError::DeadlockDetected`] on a wait-for cycle.
    pub fn acquire_timeout(&self, holder: &Holder, mode: LockMode, timeout: Duration) -> Result<()> {
        self.acquire_inner(holder, mode, Blocking::Until(Instant::now() + timeout))
    }

    /// Releases one acquisition of `mode` made by `holder`.
    ///
    /// Releasing a lock the holder does not own is logged and ignored.
    pub fn release(&self, holder: &Holder, mode: LockMode) {
        let mut table = self.manager.table.lock();
        let released = table
            .entries
            .get_mut(&self.id)
            .is_some_and(|entry| entry.release(holder, mode));
        if !released {
            tracing::warn!(resource = %self.ident, %holder, %mode, "release of a lock not held");
            return;
        }
        if table.entries.get(&self.id).is_some_and(LockEntry::is_free) {
            let _ = table.entries.remove(&self.id);
        }
        drop(table);
        let _ = self.manager.released.notify_all();
    }

    /// Acquires a shared lock for the calling thread.
    ///
    /// # Errors
    ///
    /// See [`ResourceLock::acquire`].
    pub fn shared(&self) -> Result<LockGuard<'_>> {
        self.guard(Holder::current(), LockMode::Shared)
    }

    /// Acquires an exclusive lock for the calling thread.
    ///
    /// # Errors
    ///
    /// See [`ResourceLock::acquire`].
    pub fn exclusive(&self) -> Result<LockGuard<'_>> {
        self.guard(Holder::current(), LockMode::Exclusive)
    }

    /// Acquires `mode` for `holder` and releases it when the guard drops.
    ///
    /// # Errors
    ///
    /// See [`ResourceLock::acquire`].
    pub fn guard(&self, holder: Holder, mode: LockMode) -> Result<LockGuard<'_>> {
        self.acquire(&holder, mode)?;
        Ok(LockGuard {
            lock: self,
            holder,
            mode,
        })
    }

    /// Whether `holder` currently holds this lock in any mode.
    #[must_use]
    pub fn is_held_by(&self, holder: &Holder) -> bool {
        let table = self.manager.table.lock();
        table.entries.get(&self.id).is_some_and(|entry| {
            entry.exclusive.as_ref().is_some_and(|(h, _)| h == holder)
                || entry.shared.contains_key(&holder.id)
        })
    }

    fn acquire_inner(&self, holder: &Holder, mode: LockMode, blocking: Blocking) -> Result<()> {
        let mut table = self.manager.table.lock();
        loop {
            let entry = table.entries.entry(self.id).or_default();
            if entry.can_grant(holder, mode) {
                entry.grant(holder, mode);
                let _ = table.waiting.remove(&holder.id);
                tracing::trace!(resource = %self.ident, %holder, %mode, "lock acquired");
                return Ok(());
            }

            if table.would_deadlock(holder, self.id, mode) {
                let _ = table.waiting.remove(&holder.id);
                tracing::warn!(resource = %self.ident, %holder, %mode, "deadlock detected");
                return Err(CorralError::DeadlockDetected {
                    resource: self.ident.to_string(),
                    mode,
                });
            }

            let timed_out = match blocking {
                Blocking::No => true,
                Blocking::Forever => {
                    let _ = table.waiting.insert(holder.id, (self.id, mode));
                    self.manager.released.wait(&mut table);
                    false
                }
                Blocking::Until(deadline) => {
                    let _ = table.waiting.insert(holder.id, (self.id, mode));
                    self.manager
                        .released
                        .wait_until(&mut table, deadline)
                        .timed_out()
                }
            };

            if timed_out {
                let _ = table.waiting.remove(&holder.id);
                let current = table
                    .entries
                    .get(&self.id)
                    .and_then(|entry| entry.blockers(holder, mode).into_iter().next());
                if let Some(current) = current {
                    return Err(CorralError::ResourceLocked {
                        resource: self.ident.to_string(),
                        holder: current.to_string(),
                    });
                }
                // Released right at the deadline; take it.
            }
        }
    }
}

impl fmt::Debug for ResourceLock {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ResourceLock")
            .field("id", &self.id)
            .field("ident", &self.ident)
            .finish_non_exhaustive()
    }
}

/// Releases its acquisition when dropped.
#[derive(Debug)]
pub struct LockGuard<'a> {
    lock: &'a ResourceLock,
    holder: Holder,
    mode: LockMode,
}

impl LockGuard<'_> {
    /// Mode held by this guard.
    #[must_use]
    pub const fn mode(&self) -> LockMode {
        self.mode
    }
}

impl Drop for LockGuard<'_> {
    fn drop(&mut self) {
        self.lock.release(&self.holder, self.mode);
    }
}

/// An entity carrying a [`ResourceLock`].
pub trait Lockable {
    /// The entity's lock.
    fn resource_lock(&self) -> &ResourceLock;

    /// Runs `f` while holding the entity exclusively.
    ///
    /// # Errors
    ///
    /// Returns an error if the lock cannot be obtained.
    fn exclusively<T>(&self, f: impl FnOnce() -> T) -> Result<T> {
        let _guard = self.resource_lock().exclusive()?;
        Ok(f())
    }

    /// Runs `f` while holding the entity in shared mode.
    ///
    /// # Errors
    ///
    /// Returns an error if the lock cannot be obtained.
    fn inclusively<T>(&self, f: impl FnOnce() -> T) -> Result<T> {
        let _guard = self.resource_lock().shared()?;
        Ok(f())
    }
}
