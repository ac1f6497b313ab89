//! Round-trips through the real `corral-ct-runner` executable.

#![allow(clippy::expect_used, clippy::unwrap_used)]

use std::fs::File;
use std::path::Path;

use corral_common::types::UserIdentity;
use corral_runtime::control::{CommandId, Frontend, RunnerOptions, RunnerTarget};

fn frontend() -> Frontend {
    Frontend::new(env!("CARGO_BIN_EXE_corral-ct-runner"))
}

fn target(dir: &Path) -> RunnerTarget {
    RunnerTarget {
        pool: "tank".into(),
        id: "web".into(),
        lxc_home: dir.to_path_buf(),
        log_file: dir.join("web.log"),
        user: UserIdentity {
            name: "corral-test".into(),
            uid: nix::unistd::getuid().as_raw(),
            gid: nix::unistd::getgid().as_raw(),
            home: dir.to_path_buf(),
        },
        cgroup: None,
        prlimits: Vec::new(),
    }
}

// ── Identity ─────────────────────────────────────────────────────────

#[test]
fn runner_reports_its_context() {
    let dir = tempfile::tempdir().unwrap();
    let result = frontend()
        .exec_runner(&target(dir.path()), CommandId::Identity, RunnerOptions::new().args(["a", "b"]))
        .unwrap();

    let data = result.into_result().unwrap();
    assert_eq!(data["uid"], nix::unistd::getuid().as_raw());
    assert_eq!(data["pool"], "tank");
    assert_eq!(data["id"], "web");
    assert_eq!(data["args"], serde_json::json!(["a", "b"]));
    assert_eq!(data["home"], dir.path().to_str().unwrap());
}

#[test]
fn runner_carries_process_title() {
    let dir = tempfile::tempdir().unwrap();
    let result = frontend()
        .exec_runner(&target(dir.path()), CommandId::Identity, RunnerOptions::new())
        .unwrap();

    let data = result.into_result().unwrap();
    assert_eq!(data["argv0"], "corrald: tank:web runner:identity");
}

// ── Exec ─────────────────────────────────────────────────────────────

#[test]
fn exec_returns_exit_code() {
    let dir = tempfile::tempdir().unwrap();
    let result = frontend()
        .exec_runner(
            &target(dir.path()),
            CommandId::Exec,
            RunnerOptions::new().args(["sh", "-c", "exit 7"]),
        )
        .unwrap();

    assert_eq!(result.into_result().unwrap(), serde_json::Value::from(7));
}

#[test]
fn exec_writes_to_caller_stdout() {
    let dir = tempfile::tempdir().unwrap();
    let out_path = dir.path().join("out");
    let out = File::create(&out_path).unwrap();
    let result = frontend()
        .exec_runner(
            &target(dir.path()),
            CommandId::Exec,
            RunnerOptions::new().args(["echo", "hello"]).stdout(out),
        )
        .unwrap();

    assert!(result.is_ok());
    assert_eq!(std::fs::read_to_string(&out_path).unwrap(), "hello\n");
}

#[test]
fn missing_program_is_a_command_failure() {
    let dir = tempfile::tempdir().unwrap();
    let result = frontend()
        .exec_runner(
            &target(dir.path()),
            CommandId::Exec,
            RunnerOptions::new().args(["/nonexistent/corral-test"]),
        )
        .unwrap();

    assert!(!result.is_ok());
    assert!(!result.is_runner_failure());
}
