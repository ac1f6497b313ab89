//! Fixtures shared by the runtime integration tests.
//!
//! [`FakeDriver`] reports states the way the LXC driver does, without
//! touching any container.

#![allow(dead_code)]

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::time::{Duration, Instant};

use corral_common::config::DaemonConfig;
use corral_common::error::{CorralError, Result};
use corral_common::types::ContainerState;
use corral_runtime::driver::{LifecycleDriver, StartOptions, StopOptions};
use corral_runtime::entity::Container;
use corral_runtime::event::EventBus;
use corral_runtime::lock::LockManager;
use corral_runtime::monitor;
use corral_runtime::plan::PlanContext;
use corral_runtime::registry::Registry;
use parking_lot::Mutex;

#[derive(Default)]
pub struct FakeDriver {
    pub started: Mutex<Vec<String>>,
    pub stopped: Mutex<Vec<String>>,
    pub in_flight: AtomicUsize,
    pub max_in_flight: AtomicUsize,
    pub start_delay: Duration,
    /// Container whose start fails after reporting `starting`.
    pub fail: Option<&'static str>,
    /// Starts never report `running`.
    pub hang: bool,
    /// Stops fail before reporting anything.
    pub fail_stop: AtomicBool,
}

impl FakeDriver {
    pub fn slow(delay: Duration) -> Self {
        Self {
            start_delay: delay,
            ..Self::default()
        }
    }

    pub fn starts_of(&self, id: &str) -> usize {
        self.started.lock().iter().filter(|s| *s == id).count()
    }
}

impl LifecycleDriver for FakeDriver {
    fn start(&self, registry: &Registry, ct: &Arc<Container>, _opts: &StartOptions) -> Result<()> {
        let now = self.in_flight.fetch_add(1, Ordering::SeqCst) + 1;
        let _ = self.max_in_flight.fetch_max(now, Ordering::SeqCst);
        monitor::report_state(registry, ct, ContainerState::Starting);
        std::thread::sleep(self.start_delay);
        self.started.lock().push(ct.id().to_owned());
        let _ = self.in_flight.fetch_sub(1, Ordering::SeqCst);

        if self.fail == Some(ct.id()) {
            monitor::report_state(registry, ct, ContainerState::Stopped);
            return Err(CorralError::CommandFailed {
                message: "lxc-start exited with 1".into(),
            });
        }
        if !self.hang {
            monitor::report_state(registry, ct, ContainerState::Running);
        }
        Ok(())
    }

    fn stop(&self, registry: &Registry, ct: &Arc<Container>, _opts: &StopOptions) -> Result<()> {
        if self.fail_stop.load(Ordering::SeqCst) {
            return Err(CorralError::CommandFailed {
                message: "lxc-stop exited with 1".into(),
            });
        }
        monitor::report_state(registry, ct, ContainerState::Stopping);
        self.stopped.lock().push(ct.id().to_owned());
        monitor::report_state(registry, ct, ContainerState::Stopped);
        Ok(())
    }
}

/// One pool `tank` with user `alice`; `None` means no autostart.
pub fn config(parallel_start: usize, containers: &[(&str, Option<i32>)]) -> DaemonConfig {
    let mut yaml = format!(
        "parallel_start: {parallel_start}\nparallel_stop: 1\nstart_timeout_secs: 2\npools:\n  - name: tank\n    users:\n      - {{ name: alice, uid: 100000, gid: 100000, home: /home/alice }}\n    groups:\n      - {{ name: root, cgroup_path: corral/tank }}\n    containers:\n"
    );
    for (id, priority) in containers {
        match priority {
            Some(p) => yaml.push_str(&format!(
                "      - {{ id: {id}, user: alice, group: root, autostart: {{ priority: {p} }} }}\n"
            )),
            None => yaml.push_str(&format!("      - {{ id: {id}, user: alice, group: root }}\n")),
        }
    }
    DaemonConfig::parse(&yaml).expect("valid config")
}

pub fn setup(cfg: &DaemonConfig, driver: FakeDriver) -> (Arc<Registry>, Arc<FakeDriver>, PlanContext) {
    let registry = Registry::load(cfg, LockManager::new(), EventBus::new()).expect("registry");
    let driver = Arc::new(driver);
    let ctx = PlanContext {
        registry: Arc::clone(&registry),
        driver: Arc::clone(&driver) as Arc<dyn LifecycleDriver>,
    };
    (registry, driver, ctx)
}

pub fn wait_for(mut cond: impl FnMut() -> bool) {
    let deadline = Instant::now() + Duration::from_secs(5);
    while !cond() {
        assert!(Instant::now() < deadline, "condition not reached in time");
        std::thread::sleep(Duration::from_millis(10));
    }
}
