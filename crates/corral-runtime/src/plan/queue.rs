//! Priority queue of plan entries.

use std::cmp::Ordering;
use std::collections::BinaryHeap;
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use crossbeam_channel::Sender;
use serde::Serialize;

use super::EntryOutcome;
use crate::driver::{StartOptions, StopOptions};
use crate::entity::Container;

/// What a plan does with a container.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Operation {
    /// Start it.
    Start(StartOptions),
    /// Stop it.
    Stop(StopOptions),
}

/// A container waiting for a worker slot.
#[derive(Debug)]
pub struct PlanEntry {
    /// The container.
    pub container: Arc<Container>,
    /// Higher is admitted sooner.
    pub priority: i32,
    /// What to do once admitted.
    pub operation: Operation,
    /// Pause of the worker slot after a successful operation.
    pub delay: Duration,
    /// When the entry was queued.
    pub enqueued_at: DateTime<Utc>,
    seq: u64,
    client: Option<Sender<EntryOutcome>>,
}

impl PlanEntry {
    /// A new entry.
    #[must_use]
    pub fn new(container: Arc<Container>, priority: i32, operation: Operation) -> Self {
        Self {
            container,
            priority,
            operation,
            delay: Duration::ZERO,
            enqueued_at: Utc::now(),
            seq: 0,
            client: None,
        }
    }

    /// Sets the pause after a successful operation.
    #[must_use]
    pub fn with_delay(mut self, delay: Duration) -> Self {
        self.delay = delay;
        self
    }

    pub(super) fn with_client(mut self, client: Sender<EntryOutcome>) -> Self {
        self.client = Some(client);
        self
    }

    /// Container ID.
    #[must_use]
    pub fn id(&self) -> &str {
        self.container.id()
    }

    /// Tells a waiting caller how the entry ended.
    pub(super) fn notify(&self, outcome: &EntryOutcome) {
        if let Some(client) = &self.client {
            let _ = client.try_send(outcome.clone());
        }
    }
}

impl PartialEq for PlanEntry {
    fn eq(&self, other: &Self) -> bool {
        self.cmp(other) == Ordering::Equal
    }
}

impl Eq for PlanEntry {}

impl PartialOrd for PlanEntry {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for PlanEntry {
    // Max-heap order: higher priority first, then earlier sequence number.
    fn cmp(&self, other: &Self) -> Ordering {
        self.priority
            .cmp(&other.priority)
            .then_with(|| other.seq.cmp(&self.seq))
    }
}

/// Introspection view of a queued entry.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct QueuedEntry {
    /// Container ID.
    pub id: String,
    /// Admission priority.
    pub priority: i32,
    /// When the entry was queued.
    pub enqueued_at: DateTime<Utc>,
}

/// Entries ordered by descending priority, FIFO within a priority.
#[derive(Debug, Default)]
pub(super) struct EntryQueue {
    heap: BinaryHeap<PlanEntry>,
    next_seq: u64,
}

impl EntryQueue {
    pub(super) fn push(&mut self, mut entry: PlanEntry) {
        entry.seq = self.next_seq;
        self.next_seq += 1;
        self.heap.push(entry);
    }

    pub(super) fn pop(&mut self) -> Option<PlanEntry> {
        self.heap.pop()
    }

    pub(super) fn contains(&self, id: &str) -> bool {
        self.heap.iter().any(|e| e.id() == id)
    }

    pub(super) fn remove(&mut self, id: &str) -> Option<PlanEntry> {
        let (mut removed, kept): (Vec<_>, Vec<_>) =
            std::mem::take(&mut self.heap).into_vec().into_iter().partition(|e| e.id() == id);
        self.heap = BinaryHeap::from(kept);
        removed.pop()
    }

    pub(super) fn drain(&mut self) -> Vec<PlanEntry> {
        std::mem::take(&mut self.heap).into_sorted_vec()
    }

    pub(super) fn snapshot(&self) -> Vec<QueuedEntry> {
        let mut entries: Vec<&PlanEntry> = self.heap.iter().collect();
        entries.sort_by(|a, b| b.cmp(a));
        entries
            .into_iter()
            .map(|e| QueuedEntry {
                id: e.id().to_owned(),
                priority: e.priority,
                enqueued_at: e.enqueued_at,
            })
            .collect()
    }

    pub(super) fn len(&self) -> usize {
        self.heap.len()
    }

    pub(super) fn is_empty(&self) -> bool {
        self.heap.is_empty()
    }
}
