//! Matching container state notifications against an expected progression.

use std::time::Instant;

use corral_common::types::ContainerState;

use crate::event::Subscription;

/// Result of feeding one state into a [`StateSequence`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Step {
    /// The state fits; keep waiting.
    Pending,
    /// The terminal state was reached.
    Reached,
    /// The state is outside the sequence or went backwards.
    Failed(ContainerState),
}

/// How a wait on a [`StateSequence`] ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WaitOutcome {
    /// The terminal state was observed.
    Reached,
    /// An unexpected state was observed.
    Failed(ContainerState),
    /// The deadline passed first.
    TimedOut,
}

/// Accepts states in non-decreasing order of an expected sequence.
///
/// Repeating the last seen state is fine; moving back to an earlier one or
/// seeing a state that is not in the sequence fails.
#[derive(Debug, Clone)]
pub struct StateSequence {
    expected: Vec<ContainerState>,
    last: Option<usize>,
}

impl StateSequence {
    /// A sequence ending in its last element.
    #[must_use]
    pub fn new(expected: impl Into<Vec<ContainerState>>) -> Self {
        Self {
            expected: expected.into(),
            last: None,
        }
    }

    /// States leading to a started container.
    ///
    /// `stopping` and `stopped` are accepted so that a restart in progress
    /// does not end the wait.
    #[must_use]
    pub fn start() -> Self {
        Self::new([
            ContainerState::Stopping,
            ContainerState::Stopped,
            ContainerState::Starting,
            ContainerState::Running,
        ])
    }

    /// States leading to a stopped container.
    #[must_use]
    pub fn stop() -> Self {
        Self::new([ContainerState::Stopping, ContainerState::Stopped])
    }

    /// Feeds the next observed state.
    pub fn observe(&mut self, state: ContainerState) -> Step {
        let Some(index) = self.expected.iter().position(|s| *s == state) else {
            return Step::Failed(state);
        };
        if self.last.is_some_and(|last| index < last) {
            return Step::Failed(state);
        }
        self.last = Some(index);
        if index + 1 == self.expected.len() {
            return Step::Reached;
        }
        Step::Pending
    }

    /// Consumes events from `subscription` until container `pool:id`
    /// completes the sequence or `deadline` passes.
    ///
    /// Events of other kinds or other containers are skipped.
    pub fn wait(&mut self, subscription: &Subscription, pool: &str, id: &str, deadline: Instant) -> WaitOutcome {
        loop {
            let now = Instant::now();
            if now >= deadline {
                return WaitOutcome::TimedOut;
            }
            let Some(event) = subscription.pop(deadline - now) else {
                return WaitOutcome::TimedOut;
            };
            let Some(state) = event.state_of(pool, id) else {
                continue;
            };
            match self.observe(state) {
                Step::Pending => {}
                Step::Reached => return WaitOutcome::Reached,
                Step::Failed(state) => return WaitOutcome::Failed(state),
            }
        }
    }
}
