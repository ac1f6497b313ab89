//! In-process publish/subscribe of state-change notifications.
//!
//! Each subscription owns an unbounded queue; publishing never blocks. A slow
//! subscriber therefore grows its queue without bound. Subscriptions whose
//! receiving side is gone are pruned on the next publish.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Weak};
use std::time::Duration;

use chrono::{DateTime, Utc};
use corral_common::types::ContainerState;
use crossbeam_channel::{Receiver, RecvTimeoutError, Sender, TrySendError};
use parking_lot::Mutex;
use serde::Serialize;

/// Typed payload of an [`Event`].
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "type", content = "opts", rename_all = "snake_case")]
pub enum EventPayload {
    /// A container changed lifecycle state.
    State {
        /// Pool name.
        pool: String,
        /// Container ID.
        id: String,
        /// New state.
        state: ContainerState,
    },
    /// An entity was added to or removed from the registry.
    Db {
        /// Entity type, e.g. `container`.
        object: String,
        /// Pool name.
        pool: String,
        /// Entity ID.
        id: String,
        /// `add` or `remove`.
        action: String,
    },
    /// A manipulation started or ended.
    Manipulation {
        /// Manipulated resource, e.g. `container tank:web`.
        resource: String,
        /// Label of the manipulating actor.
        holder: String,
        /// `true` when started, `false` when finished.
        active: bool,
    },
}

/// An immutable notification.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Event {
    /// What happened.
    #[serde(flatten)]
    pub payload: EventPayload,
    /// When the event was created.
    pub timestamp: DateTime<Utc>,
}

impl Event {
    /// Wraps a payload with the current time.
    #[must_use]
    pub fn new(payload: EventPayload) -> Self {
        Self {
            payload,
            timestamp: Utc::now(),
        }
    }

    /// A container state change.
    #[must_use]
    pub fn state(pool: impl Into<String>, id: impl Into<String>, state: ContainerState) -> Self {
        Self::new(EventPayload::State {
            pool: pool.into(),
            id: id.into(),
            state,
        })
    }

    /// Event type name as seen by clients.
    #[must_use]
    pub const fn kind(&self) -> &'static str {
        match self.payload {
            EventPayload::State { .. } => "state",
            EventPayload::Db { .. } => "db",
            EventPayload::Manipulation { .. } => "manipulation",
        }
    }

    /// The new state if this is a state change of container `pool:id`.
    #[must_use]
    pub fn state_of(&self, pool: &str, id: &str) -> Option<ContainerState> {
        match &self.payload {
            EventPayload::State {
                pool: p,
                id: i,
                state,
            } if p == pool && i == id => Some(*state),
            _ => None,
        }
    }
}

/// Process-wide fan-out of [`Event`]s.
#[derive(Debug, Default)]
pub struct EventBus {
    subscribers: Mutex<HashMap<u64, Sender<Event>>>,
    next_id: AtomicU64,
}

impl EventBus {
    /// Creates a bus with no subscribers.
    #[must_use]
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    /// Opens a new subscription receiving every event published from now on.
    #[must_use]
    pub fn subscribe(self: &Arc<Self>) -> Subscription {
        let (tx, rx) = crossbeam_channel::unbounded();
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        let _ = self.subscribers.lock().insert(id, tx);
        tracing::trace!(subscription = id, "subscribed");
        Subscription {
            id,
            receiver: rx,
            bus: Arc::downgrade(self),
        }
    }

    /// Closes a subscription; pending events are discarded.
    pub fn unsubscribe(&self, subscription: Subscription) {
        drop(subscription);
    }

    /// Delivers `event` to every live subscription in publish order.
    pub fn publish(&self, event: Event) {
        tracing::debug!(kind = event.kind(), payload = ?event.payload, "publishing event");
        let mut subscribers = self.subscribers.lock();
        subscribers.retain(|id, tx| match tx.try_send(event.clone()) {
            Ok(()) => true,
            Err(TrySendError::Disconnected(_)) => {
                tracing::trace!(subscription = id, "pruning abandoned subscription");
                false
            }
            // Unbounded channels never report Full.
            Err(TrySendError::Full(_)) => true,
        });
    }

    /// Drops all subscriptions; blocked `pop` calls return `None`.
    pub fn shutdown(&self) {
        let mut subscribers = self.subscribers.lock();
        tracing::debug!(subscribers = subscribers.len(), "event bus shutting down");
        subscribers.clear();
    }

    /// Number of open subscriptions.
    #[must_use]
    pub fn subscriber_count(&self) -> usize {
        self.subscribers.lock().len()
    }

    fn remove(&self, id: u64) {
        let _ = self.subscribers.lock().remove(&id);
    }
}

/// A single-consumer queue of events; unsubscribes when dropped.
#[derive(Debug)]
pub struct Subscription {
    id: u64,
    receiver: Receiver<Event>,
    bus: Weak<EventBus>,
}

impl Subscription {
    /// Blocks until an event arrives or `timeout` elapses.
    ///
    /// Returns `None` on timeout or after the bus shut down.
    pub fn pop(&self, timeout: Duration) -> Option<Event> {
        match self.receiver.recv_timeout(timeout) {
            Ok(event) => Some(event),
            Err(RecvTimeoutError::Timeout | RecvTimeoutError::Disconnected) => None,
        }
    }

    /// Returns a queued event without blocking.
    pub fn try_pop(&self) -> Option<Event> {
        self.receiver.try_recv().ok()
    }

    /// Number of events waiting in the queue.
    #[must_use]
    pub fn len(&self) -> usize {
        self.receiver.len()
    }

    /// Whether the queue is empty.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.receiver.is_empty()
    }

    pub(crate) const fn receiver(&self) -> &Receiver<Event> {
        &self.receiver
    }
}

impl Drop for Subscription {
    fn drop(&mut self) {
        if let Some(bus) = self.bus.upgrade() {
            bus.remove(self.id);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn events_arrive_in_publish_order() {
        let bus = EventBus::new();
        let sub = bus.subscribe();
        for state in [ContainerState::Starting, ContainerState::Running] {
            bus.publish(Event::state("tank", "web", state));
        }
        let first = sub.pop(Duration::from_millis(10)).expect("first");
        let second = sub.pop(Duration::from_millis(10)).expect("second");
        assert_eq!(first.state_of("tank", "web"), Some(ContainerState::Starting));
        assert_eq!(second.state_of("tank", "web"), Some(ContainerState::Running));
    }

    #[test]
    fn every_subscriber_gets_a_copy() {
        let bus = EventBus::new();
        let a = bus.subscribe();
        let b = bus.subscribe();
        bus.publish(Event::state("tank", "web", ContainerState::Stopped));
        assert_eq!(a.len(), 1);
        assert_eq!(b.len(), 1);
    }

    #[test]
    fn pop_times_out_with_none() {
        let bus = EventBus::new();
        let sub = bus.subscribe();
        assert!(sub.pop(Duration::from_millis(20)).is_none());
    }

    #[test]
    fn dropped_subscription_is_removed() {
        let bus = EventBus::new();
        let sub = bus.subscribe();
        assert_eq!(bus.subscriber_count(), 1);
        bus.unsubscribe(sub);
        assert_eq!(bus.subscriber_count(), 0);
        bus.publish(Event::state("tank", "web", ContainerState::Running));
    }

    #[test]
    fn shutdown_unblocks_pop() {
        let bus = EventBus::new();
        let sub = bus.subscribe();
        bus.shutdown();
        assert!(sub.pop(Duration::from_secs(5)).is_none());
    }

    #[test]
    fn state_of_filters_identity() {
        let event = Event::state("tank", "web", ContainerState::Running);
        assert_eq!(event.state_of("tank", "db"), None);
        assert_eq!(event.state_of("other", "web"), None);
        assert_eq!(event.kind(), "state");
    }

    #[test]
    fn serializes_with_type_and_opts() {
        let event = Event::state("tank", "web", ContainerState::Running);
        let json = serde_json::to_value(&event).expect("json");
        assert_eq!(json["type"], "state");
        assert_eq!(json["opts"]["state"], "running");
        assert!(json["timestamp"].is_string());
    }
}
