//! Scheduler integration tests.
//!
//! Plans run against a real registry and event bus with a fake lifecycle
//! driver.

#![allow(clippy::expect_used, clippy::unwrap_used)]

mod common;

use std::sync::Arc;
use std::sync::atomic::Ordering;
use std::time::{Duration, Instant};

use common::{FakeDriver, config, setup, wait_for};
use corral_common::error::CorralError;
use corral_common::types::ContainerState;
use corral_runtime::driver::{LifecycleDriver, StartOptions, StopOptions};
use corral_runtime::monitor;
use corral_runtime::plan::{EntryOutcome, Operation, Plan, PlanEntry, PlanPhase};

// ── Admission order ──────────────────────────────────────────────────

#[test]
fn autostart_admits_by_descending_priority() {
    let cfg = config(1, &[("a", Some(1)), ("b", Some(5)), ("c", Some(3)), ("plain", None)]);
    let (registry, driver, ctx) = setup(&cfg, FakeDriver::default());
    let pool = registry.pool("tank").unwrap();

    assert_eq!(pool.autostart(ctx, false), 3);
    pool.autostart_plan().wait();

    assert_eq!(*driver.started.lock(), ["b", "c", "a"]);
    assert_eq!(registry.container("tank", "plain").unwrap().state(), ContainerState::Stopped);
    assert!(
        pool.autostart_plan()
            .outcomes()
            .values()
            .all(|o| *o == EntryOutcome::Done)
    );
    pool.stop();
}

#[test]
fn equal_priorities_are_admitted_in_enqueue_order() {
    let cfg = config(1, &[("x", None), ("y", None), ("z", None)]);
    let (registry, driver, ctx) = setup(&cfg, FakeDriver::default());
    let pool = registry.pool("tank").unwrap();
    let plan = pool.autostart_plan();

    for id in ["z", "x", "y"] {
        let ct = registry.container("tank", id).unwrap();
        assert!(plan.enqueue(PlanEntry::new(ct, 7, Operation::Start(StartOptions::default()))));
    }
    Plan::start(plan, ctx);
    plan.wait();

    assert_eq!(*driver.started.lock(), ["z", "x", "y"]);
    pool.stop();
}

#[test]
fn duplicate_entries_are_rejected() {
    let cfg = config(1, &[("web", None)]);
    let (registry, _driver, _ctx) = setup(&cfg, FakeDriver::default());
    let pool = registry.pool("tank").unwrap();
    let ct = registry.container("tank", "web").unwrap();

    let entry = || PlanEntry::new(Arc::clone(&ct), 1, Operation::Start(StartOptions::default()));
    assert!(pool.autostart_plan().enqueue(entry()));
    assert!(!pool.autostart_plan().enqueue(entry()));
    assert_eq!(pool.autostart_plan().queue().len(), 1);
}

// ── Concurrency bound ────────────────────────────────────────────────

#[test]
fn running_set_never_exceeds_limit() {
    let ids = ["c1", "c2", "c3", "c4", "c5", "c6", "c7"];
    let containers: Vec<(&str, Option<i32>)> = ids.iter().map(|id| (*id, Some(1))).collect();
    let cfg = config(2, &containers);
    let (registry, driver, ctx) = setup(&cfg, FakeDriver::slow(Duration::from_millis(40)));
    let pool = registry.pool("tank").unwrap();

    let _ = pool.autostart(ctx, false);
    pool.autostart_plan().wait();

    assert_eq!(driver.started.lock().len(), ids.len());
    assert!(driver.max_in_flight.load(Ordering::SeqCst) <= 2);
    assert!(pool.autostart_plan().running().is_empty());
    pool.stop();
}

#[test]
fn resize_raises_the_limit() {
    let ids = ["c1", "c2", "c3", "c4", "c5", "c6"];
    let containers: Vec<(&str, Option<i32>)> = ids.iter().map(|id| (*id, Some(1))).collect();
    let cfg = config(1, &containers);
    let (registry, driver, ctx) = setup(&cfg, FakeDriver::slow(Duration::from_millis(50)));
    let pool = registry.pool("tank").unwrap();

    pool.set_parallelism(Some(3), None).unwrap();
    assert_eq!(pool.autostart_plan().limit(), 3);
    let _ = pool.autostart(ctx, false);
    pool.autostart_plan().wait();

    assert_eq!(driver.started.lock().len(), ids.len());
    assert!(driver.max_in_flight.load(Ordering::SeqCst) <= 3);
    assert!(pool.set_parallelism(Some(0), None).is_err());
    pool.stop();
}

#[test]
fn shrinking_the_limit_spares_running_entries() {
    let ids = ["c1", "c2", "c3", "c4", "c5", "c6"];
    let containers: Vec<(&str, Option<i32>)> = ids.iter().map(|id| (*id, Some(1))).collect();
    let cfg = config(3, &containers);
    let (registry, driver, ctx) = setup(&cfg, FakeDriver::slow(Duration::from_millis(150)));
    let pool = registry.pool("tank").unwrap();
    let plan = pool.autostart_plan();

    let _ = pool.autostart(ctx, false);
    wait_for(|| plan.running().len() == 3);
    let first = plan.running();
    plan.resize(1).unwrap();

    wait_for(|| {
        let outcomes = plan.outcomes();
        first.iter().all(|id| outcomes.contains_key(id))
    });
    let outcomes = plan.outcomes();
    assert!(first.iter().all(|id| outcomes[id] == EntryOutcome::Done));
    driver
        .max_in_flight
        .store(driver.in_flight.load(Ordering::SeqCst), Ordering::SeqCst);

    plan.wait();
    assert_eq!(driver.started.lock().len(), ids.len());
    assert!(driver.max_in_flight.load(Ordering::SeqCst) <= 1);
    pool.stop();
}

// ── Failures and cancellation ────────────────────────────────────────

#[test]
fn failed_entry_does_not_stop_the_plan() {
    let cfg = config(1, &[("bad", Some(9)), ("good", Some(1))]);
    let driver = FakeDriver {
        fail: Some("bad"),
        ..FakeDriver::default()
    };
    let (registry, driver, ctx) = setup(&cfg, driver);
    let pool = registry.pool("tank").unwrap();

    let _ = pool.autostart(ctx, false);
    pool.autostart_plan().wait();

    let outcomes = pool.autostart_plan().outcomes();
    assert!(matches!(outcomes["bad"], EntryOutcome::Failed(ref m) if m.contains("lxc-start exited")));
    assert_eq!(outcomes["good"], EntryOutcome::Done);
    assert_eq!(driver.starts_of("good"), 1);
    pool.stop();
}

#[test]
fn stop_cancels_queued_entries_and_lets_in_flight_finish() {
    let cfg = config(1, &[("a", Some(3)), ("b", Some(2)), ("c", Some(1))]);
    let (registry, driver, ctx) = setup(&cfg, FakeDriver::slow(Duration::from_millis(200)));
    let pool = registry.pool("tank").unwrap();
    let plan = pool.autostart_plan();

    let _ = pool.autostart(ctx, false);
    wait_for(|| !plan.running().is_empty());
    plan.stop();

    assert_eq!(plan.phase(), PlanPhase::Idle);
    assert_eq!(*driver.started.lock(), ["a"]);
    let outcomes = plan.outcomes();
    assert_eq!(outcomes["a"], EntryOutcome::Done);
    assert_eq!(outcomes["b"], EntryOutcome::Cancelled);
    assert_eq!(outcomes["c"], EntryOutcome::Cancelled);
    assert!(plan.queue().is_empty());
}

#[test]
fn clear_discards_without_running() {
    let cfg = config(1, &[("a", Some(1)), ("b", Some(2))]);
    let (registry, driver, _ctx) = setup(&cfg, FakeDriver::default());
    let pool = registry.pool("tank").unwrap();
    let plan = pool.autostart_plan();

    for id in ["a", "b"] {
        let ct = registry.container("tank", id).unwrap();
        let _ = plan.enqueue(PlanEntry::new(ct, 1, Operation::Start(StartOptions::default())));
    }
    plan.clear();

    assert!(plan.queue().is_empty());
    assert!(driver.started.lock().is_empty());
}

// ── Blocking starts ──────────────────────────────────────────────────

#[test]
fn start_ct_waits_for_running() {
    let cfg = config(1, &[("web", None)]);
    let (registry, _driver, ctx) = setup(&cfg, FakeDriver::slow(Duration::from_millis(50)));
    let pool = registry.pool("tank").unwrap();
    let ct = registry.container("tank", "web").unwrap();
    Plan::start(pool.autostart_plan(), ctx);

    let outcome = pool
        .autostart_plan()
        .start_ct(&ct, 1, StartOptions::default(), Duration::from_secs(5))
        .unwrap();

    assert_eq!(outcome, EntryOutcome::Done);
    assert_eq!(ct.state(), ContainerState::Running);
    pool.stop();
}

#[test]
fn start_ct_times_out_without_cancelling() {
    let cfg = config(1, &[("web", None)]);
    let driver = FakeDriver {
        hang: true,
        ..FakeDriver::default()
    };
    let (registry, driver, ctx) = setup(&cfg, driver);
    let pool = registry.pool("tank").unwrap();
    let ct = registry.container("tank", "web").unwrap();
    Plan::start(pool.autostart_plan(), ctx);

    let started = Instant::now();
    let outcome = pool
        .autostart_plan()
        .start_ct(&ct, 1, StartOptions::default(), Duration::from_millis(300))
        .unwrap();

    assert_eq!(outcome, EntryOutcome::TimedOut);
    assert!(started.elapsed() < Duration::from_secs(2));
    assert_eq!(driver.starts_of("web"), 1);
    pool.stop();
}

#[test]
fn start_ct_on_stopped_plan_fails() {
    let cfg = config(1, &[("web", None)]);
    let (registry, _driver, _ctx) = setup(&cfg, FakeDriver::default());
    let pool = registry.pool("tank").unwrap();
    let ct = registry.container("tank", "web").unwrap();

    let err = pool
        .autostart_plan()
        .start_ct(&ct, 1, StartOptions::default(), Duration::from_secs(1))
        .unwrap_err();
    assert!(matches!(err, CorralError::PlanStopped { ref pool } if pool == "tank"));
}

// ── Reboots ──────────────────────────────────────────────────────────

#[test]
fn reboot_is_re_enqueued_exactly_once() {
    let cfg = config(1, &[("web", Some(4))]);
    let (registry, driver, ctx) = setup(&cfg, FakeDriver::default());
    let pool = registry.pool("tank").unwrap();
    let ct = registry.container("tank", "web").unwrap();

    let _ = pool.autostart(ctx, false);
    pool.autostart_plan().wait();
    assert_eq!(ct.state(), ContainerState::Running);

    assert!(pool.request_reboot(&ct));
    driver.stop(&registry, &ct, &StopOptions::default()).unwrap();
    // The reboot was consumed by the first stop.
    assert!(!pool.fulfil_reboot(&ct));
    pool.autostart_plan().wait();

    assert_eq!(driver.starts_of("web"), 2);
    assert_eq!(ct.state(), ContainerState::Running);
    pool.stop();
}

#[test]
fn cancelled_reboot_is_not_fulfilled_by_a_later_stop() {
    let cfg = config(1, &[("web", Some(4))]);
    let (registry, driver, ctx) = setup(&cfg, FakeDriver::default());
    let pool = registry.pool("tank").unwrap();
    let ct = registry.container("tank", "web").unwrap();

    let _ = pool.autostart(ctx, false);
    pool.autostart_plan().wait();

    assert!(pool.request_reboot(&ct));
    assert!(pool.cancel_reboot(&ct));
    assert!(!pool.cancel_reboot(&ct));
    driver.stop(&registry, &ct, &StopOptions::default()).unwrap();
    pool.autostart_plan().wait();

    assert_eq!(driver.starts_of("web"), 1);
    assert_eq!(ct.state(), ContainerState::Stopped);
    pool.stop();
}

#[test]
fn reboot_of_unmanaged_container_is_refused() {
    let cfg = config(1, &[("web", None)]);
    let (registry, _driver, _ctx) = setup(&cfg, FakeDriver::default());
    let pool = registry.pool("tank").unwrap();
    let ct = registry.container("tank", "web").unwrap();

    assert!(!pool.request_reboot(&ct));
    assert!(!pool.fulfil_reboot(&ct));
}

#[test]
fn fulfil_start_drops_queued_entry() {
    let cfg = config(1, &[("web", Some(1))]);
    let (registry, _driver, _ctx) = setup(&cfg, FakeDriver::default());
    let pool = registry.pool("tank").unwrap();
    let ct = registry.container("tank", "web").unwrap();

    let _ = pool
        .autostart_plan()
        .enqueue(PlanEntry::new(Arc::clone(&ct), 1, Operation::Start(StartOptions::default())));
    assert!(pool.fulfil_autostart(&ct));
    assert!(!pool.fulfil_autostart(&ct));
    assert!(pool.autostart_plan().queue().is_empty());
}

#[test]
fn unset_autostart_leaves_the_plan() {
    let cfg = config(1, &[("first", Some(9)), ("later", Some(1))]);
    let (registry, driver, ctx) = setup(&cfg, FakeDriver::slow(Duration::from_millis(150)));
    let pool = registry.pool("tank").unwrap();
    let plan = pool.autostart_plan();
    let first = registry.container("tank", "first").unwrap();
    let later = registry.container("tank", "later").unwrap();

    assert_eq!(pool.autostart(ctx, false), 2);
    wait_for(|| plan.running() == ["first"]);
    assert!(pool.unset_autostart(&later).unwrap());
    assert!(later.autostart().is_none());
    plan.wait();

    assert_eq!(driver.starts_of("later"), 0);
    assert!(!pool.request_reboot(&later));

    // Already started: nothing queued, but no longer eligible for reboots.
    assert!(!pool.unset_autostart(&first).unwrap());
    assert!(!pool.request_reboot(&first));
    pool.stop();
}

// ── Autostop ─────────────────────────────────────────────────────────

#[test]
fn autostop_stops_in_reverse_start_order() {
    let cfg = config(1, &[("low", Some(1)), ("high", Some(9)), ("plain", None)]);
    let (registry, driver, ctx) = setup(&cfg, FakeDriver::default());
    let pool = registry.pool("tank").unwrap();
    for ct in registry.containers_of("tank") {
        monitor::report_state(&registry, &ct, ContainerState::Running);
    }

    pool.autostop_and_wait(ctx, Some("host shutdown"));

    assert_eq!(*driver.stopped.lock(), ["plain", "low", "high"]);
    assert!(
        registry
            .containers_of("tank")
            .iter()
            .all(|ct| ct.state() == ContainerState::Stopped)
    );
    pool.stop();
}
