use std::ops::Deref;
use std::sync::Arc;
use std::time::Duration;

use corral_common::types::ContainerState;

use super::{Operation, Plan, PlanContext, PlanEntry, PlanKind};
use crate::driver::StartOptions;
use crate::entity::Container;
use crate::event::EventBus;

/// Starts a pool's autostart containers by priority.
#[derive(Debug)]
pub struct AutoStartPlan(Plan);

impl AutoStartPlan {
    /// An idle plan of `pool`.
    #[must_use]
    pub fn new(pool: impl Into<String>, limit: usize, entry_timeout: Duration, bus: Arc<EventBus>) -> Self {
        Self(Plan::new(pool, PlanKind::Start, limit, entry_timeout, bus))
    }

    /// Queues every container with autostart enabled and begins admitting
    /// them. Running containers are skipped unless `force` restarts them.
    ///
    /// Returns the number of queued containers.
    pub fn start<'a>(&self, ctx: PlanContext, containers: impl IntoIterator<Item = &'a Arc<Container>>, force: bool) -> usize {
        let mut queued = 0;
        for ct in containers {
            let Some(autostart) = ct.autostart() else {
                continue;
            };
            if ct.state() == ContainerState::Running && !force {
                continue;
            }
            let entry = PlanEntry::new(
                Arc::clone(ct),
                autostart.priority,
                Operation::Start(StartOptions { force, debug: false }),
            )
            .with_delay(Duration::from_secs(autostart.delay_secs));
            if self.0.enqueue(entry) {
                queued += 1;
            }
        }
        tracing::info!(pool = self.0.pool(), queued, force, "autostart");
        self.0.start(ctx);
        queued
    }
}

impl Deref for AutoStartPlan {
    type Target = Plan;

    fn deref(&self) -> &Plan {
        &self.0
    }
}
