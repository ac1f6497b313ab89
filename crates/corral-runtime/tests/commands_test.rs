//! Daemon command tests: locking, manipulation and state reporting around
//! a fake lifecycle driver.

#![allow(clippy::expect_used, clippy::unwrap_used)]

mod common;

use std::sync::Arc;
use std::sync::atomic::Ordering;
use std::time::Duration;

use common::{FakeDriver, config, setup, wait_for};
use corral_common::error::CorralError;
use corral_common::types::ContainerState;
use corral_runtime::commands::{Daemon, StartRequest};
use corral_runtime::control::Frontend;
use corral_runtime::driver::LifecycleDriver;
use corral_runtime::event::EventPayload;
use corral_runtime::registry::Registry;

fn daemon(registry: &Arc<Registry>, driver: &Arc<FakeDriver>) -> Daemon {
    Daemon::new(
        Arc::clone(registry),
        Arc::clone(driver) as Arc<dyn LifecycleDriver>,
        Frontend::new("/nonexistent/corral-ct-runner"),
    )
}

fn state(id: &str, state: ContainerState) -> EventPayload {
    EventPayload::State {
        pool: "tank".into(),
        id: id.into(),
        state,
    }
}

fn manipulation(holder: &str, active: bool) -> EventPayload {
    EventPayload::Manipulation {
        resource: "container tank:web".into(),
        holder: holder.into(),
        active,
    }
}

// ── Start and stop ───────────────────────────────────────────────────

#[test]
fn ct_start_publishes_manipulation_around_state_changes() {
    let cfg = config(1, &[("web", None)]);
    let (registry, driver, _ctx) = setup(&cfg, FakeDriver::default());
    let daemon = daemon(&registry, &driver);
    let subscription = registry.bus().subscribe();

    let result = daemon.ct_start("tank", "web", &StartRequest::default()).unwrap();

    assert!(result.is_ok());
    assert_eq!(registry.container("tank", "web").unwrap().state(), ContainerState::Running);
    let payloads: Vec<EventPayload> = std::iter::from_fn(|| subscription.try_pop())
        .map(|e| e.payload)
        .collect();
    assert_eq!(
        payloads,
        [
            manipulation("ct_start", true),
            state("web", ContainerState::Starting),
            state("web", ContainerState::Running),
            manipulation("ct_start", false),
        ]
    );
}

#[test]
fn ct_start_of_running_container_is_a_no_op() {
    let cfg = config(1, &[("web", None)]);
    let (registry, driver, _ctx) = setup(&cfg, FakeDriver::default());
    let daemon = daemon(&registry, &driver);

    assert!(daemon.ct_start("tank", "web", &StartRequest::default()).unwrap().is_ok());
    assert!(daemon.ct_start("tank", "web", &StartRequest::default()).unwrap().is_ok());
    assert_eq!(driver.starts_of("web"), 1);

    let forced = StartRequest {
        force: true,
        ..StartRequest::default()
    };
    assert!(daemon.ct_start("tank", "web", &forced).unwrap().is_ok());
    assert_eq!(driver.starts_of("web"), 2);
    assert_eq!(*driver.stopped.lock(), ["web"]);
}

#[test]
fn failed_start_is_a_failed_result() {
    let cfg = config(1, &[("web", None)]);
    let driver = FakeDriver {
        fail: Some("web"),
        ..FakeDriver::default()
    };
    let (registry, driver, _ctx) = setup(&cfg, driver);
    let daemon = daemon(&registry, &driver);

    let result = daemon.ct_start("tank", "web", &StartRequest::default()).unwrap();
    assert!(!result.is_ok());
    assert!(result.message().is_some_and(|m| m.contains("lxc-start exited")));
    assert!(daemon.ct_show("tank", "web").unwrap().manipulation.is_none());
}

#[test]
fn ct_stop_is_idempotent() {
    let cfg = config(1, &[("web", None)]);
    let (registry, driver, _ctx) = setup(&cfg, FakeDriver::default());
    let daemon = daemon(&registry, &driver);
    let _ = daemon.ct_start("tank", "web", &StartRequest::default()).unwrap();

    assert!(daemon.ct_stop("tank", "web", false).unwrap().is_ok());
    assert!(daemon.ct_stop("tank", "web", false).unwrap().is_ok());
    assert_eq!(*driver.stopped.lock(), ["web"]);
    assert_eq!(registry.container("tank", "web").unwrap().state(), ContainerState::Stopped);
}

#[test]
fn unknown_container_is_not_found() {
    let cfg = config(1, &[("web", None)]);
    let (registry, driver, _ctx) = setup(&cfg, FakeDriver::default());
    let daemon = daemon(&registry, &driver);

    let err = daemon.ct_stop("tank", "db", false).unwrap_err();
    assert!(matches!(err, CorralError::NotFound { .. }));
}

// ── Concurrent inspection ────────────────────────────────────────────

#[test]
fn inspection_proceeds_while_a_start_is_in_flight() {
    let cfg = config(1, &[("web", None)]);
    let driver = FakeDriver {
        hang: true,
        ..FakeDriver::default()
    };
    let (registry, driver, _ctx) = setup(&cfg, driver);
    let daemon = daemon(&registry, &driver).with_start_timeout(Duration::from_secs(1));

    std::thread::scope(|s| {
        let start = s.spawn(|| daemon.ct_start("tank", "web", &StartRequest::default()));

        wait_for(|| {
            daemon.ct_show("tank", "web").unwrap().manipulation.is_some_and(|m| {
                m.progress
                    .last()
                    .is_some_and(|p| p.message == "Waiting for the container to start")
            })
        });

        let info = daemon.ct_show("tank", "web").unwrap();
        assert_eq!(info.state, ContainerState::Starting);
        assert_eq!(info.manipulation.unwrap().holder, "ct_start");
        let pools = daemon.pool_list().unwrap();
        assert_eq!(pools.len(), 1);
        assert_eq!(pools[0].containers, 1);

        let err = daemon.ct_stop("tank", "web", false).unwrap_err();
        assert!(
            matches!(err, CorralError::ResourceLocked { ref resource, ref holder }
                if resource == "container tank:web" && holder == "ct_start")
        );

        let result = start.join().unwrap().unwrap();
        assert!(!result.is_ok());
        assert_eq!(result.message(), Some("container failed to start"));
    });

    assert!(daemon.ct_show("tank", "web").unwrap().manipulation.is_none());
    assert!(driver.stopped.lock().is_empty());
}

// ── Queued starts ────────────────────────────────────────────────────

#[test]
fn queued_start_waits_for_the_plan() {
    let cfg = config(1, &[("web", None)]);
    let (registry, driver, _ctx) = setup(&cfg, FakeDriver::default());
    let daemon = daemon(&registry, &driver);
    let _ = daemon.autostart_all(false);

    let req = StartRequest {
        queue: true,
        ..StartRequest::default()
    };
    assert!(daemon.ct_start("tank", "web", &req).unwrap().is_ok());
    assert_eq!(registry.container("tank", "web").unwrap().state(), ContainerState::Running);
    daemon.shutdown(None);
}

#[test]
fn duplicate_queued_start_is_reported() {
    let cfg = config(1, &[("web", None)]);
    let (registry, driver, _ctx) = setup(&cfg, FakeDriver::default());
    let daemon = daemon(&registry, &driver);

    let req = StartRequest {
        queue: true,
        wait: false,
        ..StartRequest::default()
    };
    assert!(daemon.ct_start("tank", "web", &req).unwrap().is_ok());
    let again = daemon.ct_start("tank", "web", &req).unwrap();
    assert!(!again.is_ok());
    assert_eq!(again.message(), Some("not queued"));
    assert!(driver.started.lock().is_empty());
}

// ── Restarts ─────────────────────────────────────────────────────────

#[test]
fn restart_of_managed_container_goes_through_the_plan() {
    let cfg = config(1, &[("web", Some(4))]);
    let (registry, driver, _ctx) = setup(&cfg, FakeDriver::default());
    let daemon = daemon(&registry, &driver);
    let pool = registry.pool("tank").unwrap();
    let ct = registry.container("tank", "web").unwrap();
    let _ = daemon.autostart_all(false);
    pool.autostart_plan().wait();

    assert!(daemon.ct_restart("tank", "web").unwrap().is_ok());
    wait_for(|| driver.starts_of("web") == 2 && ct.state() == ContainerState::Running);
    pool.autostart_plan().wait();
    assert_eq!(driver.starts_of("web"), 2);
    daemon.shutdown(None);
}

#[test]
fn restart_of_stopped_container_starts_it_without_a_pending_reboot() {
    let cfg = config(1, &[("web", Some(4))]);
    let (registry, driver, _ctx) = setup(&cfg, FakeDriver::default());
    let daemon = daemon(&registry, &driver);
    let pool = registry.pool("tank").unwrap();
    let ct = registry.container("tank", "web").unwrap();
    let _ = daemon.autostart_all(false);
    pool.autostart_plan().wait();
    assert!(daemon.ct_stop("tank", "web", false).unwrap().is_ok());

    assert!(daemon.ct_restart("tank", "web").unwrap().is_ok());
    assert_eq!(ct.state(), ContainerState::Running);
    assert_eq!(driver.starts_of("web"), 2);

    // A later explicit stop must stay stopped.
    assert!(daemon.ct_stop("tank", "web", false).unwrap().is_ok());
    pool.autostart_plan().wait();
    assert_eq!(ct.state(), ContainerState::Stopped);
    assert_eq!(driver.starts_of("web"), 2);
    assert!(!pool.cancel_reboot(&ct));
    daemon.shutdown(None);
}

#[test]
fn failed_restart_drops_its_reboot() {
    let cfg = config(1, &[("web", Some(4))]);
    let (registry, driver, _ctx) = setup(&cfg, FakeDriver::default());
    let daemon = daemon(&registry, &driver);
    let pool = registry.pool("tank").unwrap();
    let ct = registry.container("tank", "web").unwrap();
    let _ = daemon.autostart_all(false);
    pool.autostart_plan().wait();

    driver.fail_stop.store(true, Ordering::SeqCst);
    let result = daemon.ct_restart("tank", "web").unwrap();
    assert!(!result.is_ok());
    assert!(!pool.cancel_reboot(&ct));

    driver.fail_stop.store(false, Ordering::SeqCst);
    assert!(daemon.ct_stop("tank", "web", false).unwrap().is_ok());
    pool.autostart_plan().wait();
    assert_eq!(ct.state(), ContainerState::Stopped);
    assert_eq!(driver.starts_of("web"), 1);
    daemon.shutdown(None);
}

// ── Pools ────────────────────────────────────────────────────────────

#[test]
fn pool_parallelism_is_adjustable() {
    let cfg = config(2, &[("web", None)]);
    let (registry, driver, _ctx) = setup(&cfg, FakeDriver::default());
    let daemon = daemon(&registry, &driver);

    daemon.pool_set_parallelism("tank", Some(5), Some(3)).unwrap();
    let pools = daemon.pool_list().unwrap();
    assert_eq!((pools[0].parallel_start, pools[0].parallel_stop), (5, 3));

    assert!(matches!(
        daemon.pool_set_parallelism("tank", Some(0), None),
        Err(CorralError::Config { .. })
    ));
    assert!(matches!(
        daemon.pool_set_parallelism("ocean", Some(1), None),
        Err(CorralError::NotFound { .. })
    ));
}
