//! Container state reporting.

use std::sync::Arc;

use corral_common::types::ContainerState;

use crate::entity::Container;
use crate::event::Event;
use crate::registry::Registry;

/// Records a new state of `ct` and tells everyone about it.
///
/// Runs the container's lifecycle callbacks, publishes a state event and,
/// once the container is stopped, lets its pool restart it if a reboot was
/// requested.
pub fn report_state(registry: &Registry, ct: &Arc<Container>, state: ContainerState) {
    let previous = ct.state();
    ct.set_state(state);

    match state {
        ContainerState::Starting => ct.starting(),
        ContainerState::Stopped => ct.stopped(),
        _ => {}
    }

    tracing::info!(
        pool = ct.pool(),
        id = ct.id(),
        from = %previous,
        to = %state,
        "container state changed"
    );
    registry.bus().publish(Event::state(ct.pool(), ct.id(), state));

    if state == ContainerState::Stopped {
        match registry.pool(ct.pool()) {
            Ok(pool) => {
                if pool.fulfil_reboot(ct) {
                    tracing::info!(pool = ct.pool(), id = ct.id(), "reboot scheduled");
                }
            }
            Err(e) => tracing::warn!(pool = ct.pool(), id = ct.id(), error = %e, "state of unknown pool"),
        }
    }
}
