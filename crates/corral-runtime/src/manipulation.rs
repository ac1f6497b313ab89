//! Marking an entity as being manipulated by a long-running command.
//!
//! The exclusive [`ResourceLock`](crate::lock::ResourceLock) is held only
//! while the busy marker is set and while it is cleared. The block itself
//! runs unlocked, with the marker keeping other manipulators out, so that
//! inspection commands taking a shared lock never queue behind a start that
//! takes a minute.

use std::fmt;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};

use chrono::{DateTime, Utc};
use corral_common::error::{CorralError, Result};
use corral_common::types::ResourceIdent;
use parking_lot::{Condvar, Mutex};
use serde::Serialize;

use crate::lock::Lockable;

static NEXT_ACTOR: AtomicU64 = AtomicU64::new(1);

/// The command (or plan worker) performing a manipulation.
#[derive(Clone)]
pub struct Actor {
    id: u64,
    label: Arc<str>,
}

impl Actor {
    /// Creates a new actor; each call yields a distinct identity.
    #[must_use]
    pub fn new(label: impl Into<String>) -> Self {
        Self {
            id: NEXT_ACTOR.fetch_add(1, Ordering::Relaxed),
            label: Arc::from(label.into()),
        }
    }

    /// Label used in diagnostics, e.g. `ct_start`.
    #[must_use]
    pub fn label(&self) -> &str {
        &self.label
    }
}

impl PartialEq for Actor {
    fn eq(&self, other: &Self) -> bool {
        self.id == other.id
    }
}

impl Eq for Actor {}

impl fmt::Debug for Actor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Actor({}, {})", self.id, self.label)
    }
}

/// What to do when another actor already manipulates the entity.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum ManipulationPolicy {
    /// Fail with [`CorralError::ResourceLocked`].
    #[default]
    Fail,
    /// Block until the current manipulation ends.
    Wait,
    /// Run without marking; used by commands nested in a manipulation.
    Ignore,
}

/// One progress message reported by the manipulating actor.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ProgressEntry {
    /// When the message was reported.
    pub time: DateTime<Utc>,
    /// Free-text message.
    pub message: String,
}

/// Snapshot of an ongoing manipulation, for list/show commands.
#[derive(Debug, Clone, Serialize)]
pub struct ManipulationInfo {
    /// Label of the manipulating actor.
    pub holder: String,
    /// Progress reported so far, oldest first.
    pub progress: Vec<ProgressEntry>,
}

#[derive(Default)]
struct ManipulationState {
    holder: Option<Actor>,
    depth: usize,
    progress: Vec<ProgressEntry>,
}

/// Busy marker attached to an entity.
#[derive(Default)]
pub struct Manipulation {
    state: Mutex<ManipulationState>,
    finished: Condvar,
}

impl Manipulation {
    /// Creates an idle marker.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Whether some actor currently manipulates the entity.
    #[must_use]
    pub fn is_busy(&self) -> bool {
        self.state.lock().holder.is_some()
    }

    /// Holder and progress of the ongoing manipulation, if any.
    #[must_use]
    pub fn info(&self) -> Option<ManipulationInfo> {
        let state = self.state.lock();
        state.holder.as_ref().map(|holder| ManipulationInfo {
            holder: holder.label().to_owned(),
            progress: state.progress.clone(),
        })
    }

    /// Appends a progress message if `actor` is the current holder.
    pub fn progress(&self, actor: &Actor, message: impl Into<String>) {
        let mut state = self.state.lock();
        if state.holder.as_ref() == Some(actor) {
            let message = message.into();
            tracing::debug!(actor = actor.label(), %message, "progress");
            state.progress.push(ProgressEntry {
                time: Utc::now(),
                message,
            });
        }
    }

    /// Blocks until no actor holds the marker.
    fn wait_idle(&self) {
        let mut state = self.state.lock();
        while state.holder.is_some() {
            self.finished.wait(&mut state);
        }
    }

    fn try_mark(&self, actor: &Actor) -> std::result::Result<(), String> {
        let mut state = self.state.lock();
        match &state.holder {
            Some(holder) if holder == actor => {
                state.depth += 1;
                Ok(())
            }
            Some(holder) => Err(holder.label().to_owned()),
            None => {
                state.holder = Some(actor.clone());
                state.depth = 1;
                state.progress.clear();
                Ok(())
            }
        }
    }

    fn unmark(&self, actor: &Actor) {
        let mut state = self.state.lock();
        if state.holder.as_ref() != Some(actor) {
            return;
        }
        state.depth -= 1;
        if state.depth == 0 {
            state.holder = None;
            state.progress.clear();
            drop(state);
            let _ = self.finished.notify_all();
        }
    }
}

impl fmt::Debug for Manipulation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let state = self.state.lock();
        f.debug_struct("Manipulation")
            .field("holder", &state.holder)
            .field("depth", &state.depth)
            .finish_non_exhaustive()
    }
}

/// An entity that supports exclusive manipulation.
pub trait Manipulable: Lockable {
    /// The entity's busy marker.
    fn manipulation(&self) -> &Manipulation;

    /// Identity used in diagnostics.
    fn manipulation_resource(&self) -> ResourceIdent {
        self.resource_lock().ident().clone()
    }
}

/// Handed to the manipulation block for progress reporting.
pub struct ManipulationHandle<'a> {
    manipulation: &'a Manipulation,
    actor: &'a Actor,
}

impl ManipulationHandle<'_> {
    /// Reports a progress message visible through [`Manipulation::info`].
    pub fn progress(&self, message: impl Into<String>) {
        self.manipulation.progress(self.actor, message);
    }

    /// The manipulating actor.
    #[must_use]
    pub const fn actor(&self) -> &Actor {
        self.actor
    }
}

struct Unmark<'a, R: Manipulable + ?Sized> {
    resource: &'a R,
    actor: &'a Actor,
}

impl<R: Manipulable + ?Sized> Drop for Unmark<'_, R> {
    fn drop(&mut self) {
        let guard = self.resource.resource_lock().exclusive();
        if let Err(e) = &guard {
            tracing::warn!(
                resource = %self.resource.manipulation_resource(),
                error = %e,
                "clearing manipulation without the resource lock"
            );
        }
        self.resource.manipulation().unmark(self.actor);
    }
}

/// Runs `f` while `actor` manipulates `resource`.
///
/// The busy marker is cleared on every exit path, including errors and
/// panics inside `f`. The same actor may nest manipulations of one entity.
///
/// # Errors
///
/// Returns [`CorralError::ResourceLocked`] under [`ManipulationPolicy::Fail`]
/// when another actor is busy, lock errors, or whatever `f` returns.
pub fn manipulate<R, T, F>(resource: &R, actor: &Actor, policy: ManipulationPolicy, f: F) -> Result<T>
where
    R: Manipulable + ?Sized,
    F: FnOnce(&ManipulationHandle<'_>) -> Result<T>,
{
    let manipulation = resource.manipulation();
    let handle = ManipulationHandle {
        manipulation,
        actor,
    };

    if policy == ManipulationPolicy::Ignore {
        return f(&handle);
    }

    loop {
        let marked = {
            let _guard = resource.resource_lock().exclusive()?;
            manipulation.try_mark(actor)
        };
        match marked {
            Ok(()) => break,
            Err(holder) if policy == ManipulationPolicy::Fail => {
                return Err(CorralError::ResourceLocked {
                    resource: resource.manipulation_resource().to_string(),
                    holder,
                });
            }
            Err(holder) => {
                tracing::debug!(
                    resource = %resource.manipulation_resource(),
                    %holder,
                    actor = actor.label(),
                    "waiting for manipulation to finish"
                );
                manipulation.wait_idle();
            }
        }
    }

    let _unmark = Unmark { resource, actor };
    f(&handle)
}
