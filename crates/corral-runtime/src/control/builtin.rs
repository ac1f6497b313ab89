//! Built-in runner commands.

use std::path::Path;
use std::process::{Command, Stdio as ProcessStdio};

use serde_json::{Map, Value, json};

use super::runner::RunnerContext;
use super::wire::CommandResult;
use super::{Runner, Stdio};

/// Reports the principal and context the runner executes with.
#[derive(Debug, Clone, Copy, Default)]
pub struct Identity;

impl Runner for Identity {
    fn execute(&self, ctx: &mut RunnerContext, args: &[Value], _kwargs: &Map<String, Value>) -> CommandResult {
        CommandResult::ok(json!({
            "uid": nix::unistd::getuid().as_raw(),
            "gid": nix::unistd::getgid().as_raw(),
            "euid": nix::unistd::geteuid().as_raw(),
            "home": std::env::var("HOME").ok(),
            "pool": ctx.pool,
            "id": ctx.id,
            "lxc_home": ctx.lxc_home,
            "user_home": ctx.user_home,
            "args": args,
            "argv0": std::env::args_os().next().map(|a| a.to_string_lossy().into_owned()),
        }))
    }
}

/// Executes `args` as a program with the caller's streams.
///
/// The data of a successful result is the program's exit code.
#[derive(Debug, Clone, Copy, Default)]
pub struct Exec;

impl Runner for Exec {
    fn execute(&self, ctx: &mut RunnerContext, args: &[Value], _kwargs: &Map<String, Value>) -> CommandResult {
        let argv = match string_args(args) {
            Ok(argv) if !argv.is_empty() => argv,
            Ok(_) => return CommandResult::error("exec requires a program"),
            Err(message) => return CommandResult::error(message),
        };
        let mut command = Command::new(&argv[0]);
        let _ = command.args(&argv[1..]);
        if !ctx.user_home.as_os_str().is_empty() {
            let _ = command.env("HOME", &ctx.user_home);
        }
        attach_stdio(&mut command, &mut ctx.stdio);
        tracing::debug!(argv = ?argv, id = %ctx.id, "exec runner");
        match command.status() {
            Ok(status) => CommandResult::ok(status.code().unwrap_or(-1)),
            Err(e) => CommandResult::error(format!("unable to execute {}: {e}", argv[0])),
        }
    }
}

/// Starts the container in the background with `lxc-start`.
#[derive(Debug, Clone, Copy, Default)]
pub struct LxcStart;

impl Runner for LxcStart {
    fn execute(&self, ctx: &mut RunnerContext, _args: &[Value], kwargs: &Map<String, Value>) -> CommandResult {
        let mut command = lxc_command("lxc-start", &ctx.lxc_home, &ctx.id);
        let _ = command.arg("-o").arg(&ctx.log_file).arg("-d");
        if kwargs.get("debug").and_then(Value::as_bool).unwrap_or(false) {
            let _ = command.args(["-l", "DEBUG"]);
        }
        run_lxc(command, &mut ctx.stdio, "lxc-start")
    }
}

/// Stops the container with `lxc-stop`.
///
/// Recognized options: `kill` to skip the clean shutdown and `timeout` in
/// seconds for the clean shutdown.
#[derive(Debug, Clone, Copy, Default)]
pub struct LxcStop;

impl Runner for LxcStop {
    fn execute(&self, ctx: &mut RunnerContext, _args: &[Value], kwargs: &Map<String, Value>) -> CommandResult {
        let mut command = lxc_command("lxc-stop", &ctx.lxc_home, &ctx.id);
        if kwargs.get("kill").and_then(Value::as_bool).unwrap_or(false) {
            let _ = command.arg("-k");
        } else if let Some(timeout) = kwargs.get("timeout").and_then(Value::as_u64) {
            let _ = command.arg("-t").arg(timeout.to_string());
        }
        run_lxc(command, &mut ctx.stdio, "lxc-stop")
    }
}

fn lxc_command(program: &str, lxc_home: &Path, id: &str) -> Command {
    let mut command = Command::new(program);
    let _ = command.arg("-P").arg(lxc_home).arg("-n").arg(id);
    command
}

fn run_lxc(mut command: Command, stdio: &mut Stdio, program: &str) -> CommandResult {
    attach_stdio(&mut command, stdio);
    match command.status() {
        Ok(status) if status.success() => CommandResult::ok(Value::Null),
        Ok(status) => CommandResult::error(format!(
            "{program} exited with {}",
            status.code().map_or_else(|| "a signal".to_owned(), |c| c.to_string())
        )),
        Err(e) => CommandResult::error(format!("unable to execute {program}: {e}")),
    }
}

fn attach_stdio(command: &mut Command, stdio: &mut Stdio) {
    if let Some(stdin) = stdio.stdin.take() {
        let _ = command.stdin(ProcessStdio::from(stdin));
    }
    if let Some(stdout) = stdio.stdout.take() {
        let _ = command.stdout(ProcessStdio::from(stdout));
    }
    if let Some(stderr) = stdio.stderr.take() {
        let _ = command.stderr(ProcessStdio::from(stderr));
    }
}

fn string_args(args: &[Value]) -> Result<Vec<String>, String> {
    args.iter()
        .map(|arg| match arg {
            Value::String(s) => Ok(s.clone()),
            Value::Number(n) => Ok(n.to_string()),
            other => Err(format!("invalid program argument {other}")),
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use std::fs::File;
    use std::io::Read;

    use super::*;

    #[test]
    fn exec_reports_exit_code() {
        let mut ctx = RunnerContext::detached("tank", "web");
        let result = Exec.execute(&mut ctx, &[json!("sh"), json!("-c"), json!("exit 3")], &Map::new());
        assert!(result.is_ok());
        assert_eq!(result.data(), &json!(3));
    }

    #[test]
    fn exec_redirects_stdout() {
        let dir = tempfile::tempdir().expect("tempdir");
        let path = dir.path().join("out");
        let mut ctx = RunnerContext::detached("tank", "web");
        ctx.stdio.stdout = Some(File::create(&path).expect("create"));
        let result = Exec.execute(&mut ctx, &[json!("echo"), json!("hello")], &Map::new());
        assert!(result.is_ok());
        let mut out = String::new();
        let _ = File::open(&path).expect("open").read_to_string(&mut out).expect("read");
        assert_eq!(out, "hello\n");
    }

    #[test]
    fn exec_without_program_fails() {
        let mut ctx = RunnerContext::detached("tank", "web");
        assert!(!Exec.execute(&mut ctx, &[], &Map::new()).is_ok());
        assert!(!Exec.execute(&mut ctx, &[json!({"a": 1})], &Map::new()).is_ok());
    }

    #[test]
    fn missing_program_is_a_command_failure() {
        let mut ctx = RunnerContext::detached("tank", "web");
        let result = Exec.execute(&mut ctx, &[json!("/nonexistent/corral-test")], &Map::new());
        assert!(!result.is_ok());
        assert!(!result.is_runner_failure());
    }

    #[test]
    fn identity_echoes_arguments() {
        let mut ctx = RunnerContext::detached("tank", "web");
        let result = Identity.execute(&mut ctx, &[json!(1)], &Map::new());
        assert_eq!(result.data()["args"], json!([1]));
        assert_eq!(result.data()["pool"], "tank");
    }
}
