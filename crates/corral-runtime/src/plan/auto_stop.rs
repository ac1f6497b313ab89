use std::ops::Deref;
use std::sync::Arc;
use std::time::Duration;

use corral_common::types::ContainerState;

use super::{Operation, Plan, PlanContext, PlanEntry, PlanKind};
use crate::driver::StopOptions;
use crate::entity::Container;
use crate::event::EventBus;

/// Stops a pool's containers in reverse autostart order.
#[derive(Debug)]
pub struct AutoStopPlan(Plan);

impl AutoStopPlan {
    /// An idle plan of `pool`.
    #[must_use]
    pub fn new(pool: impl Into<String>, limit: usize, entry_timeout: Duration, bus: Arc<EventBus>) -> Self {
        Self(Plan::new(pool, PlanKind::Stop, limit, entry_timeout, bus))
    }

    /// Queues every container that is not stopped and begins admitting
    /// them. `message` is logged with each stop.
    ///
    /// Returns the number of queued containers.
    pub fn start<'a>(
        &self,
        ctx: PlanContext,
        containers: impl IntoIterator<Item = &'a Arc<Container>>,
        message: Option<&str>,
    ) -> usize {
        let mut queued = 0;
        for ct in containers {
            if ct.state() == ContainerState::Stopped {
                continue;
            }
            let opts = StopOptions {
                message: message.map(str::to_owned),
                ..StopOptions::default()
            };
            if self.0.enqueue(PlanEntry::new(Arc::clone(ct), stop_priority(ct), Operation::Stop(opts))) {
                queued += 1;
            }
        }
        tracing::info!(pool = self.0.pool(), queued, "autostop");
        self.0.start(ctx);
        queued
    }
}

/// Containers without autostart go first; the highest autostart priority
/// goes last.
fn stop_priority(ct: &Container) -> i32 {
    ct.autostart().map_or(i32::MAX, |a| a.priority.saturating_neg())
}

impl Deref for AutoStopPlan {
    type Target = Plan;

    fn deref(&self) -> &Plan {
        &self.0
    }
}
