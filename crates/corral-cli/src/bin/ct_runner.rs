//! # corral-ct-runner
//!
//! Executed by `corrald` as a container's owner. Reads one request from
//! standard input, runs the named command and writes the result to the
//! descriptor the request names.

#![allow(unsafe_code)]

use std::process::ExitCode;

use corral_runtime::control::{RunnerRegistry, serve};

fn main() -> ExitCode {
    tracing_subscriber::fmt()
        .with_writer(std::io::stderr)
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env().unwrap_or_else(|_| "warn".into()),
        )
        .init();

    let registry = RunnerRegistry::builtin();
    // SAFETY: corrald passes the descriptors named in the request to this
    // process for the runner's exclusive use.
    match unsafe { serve(&registry, std::io::stdin().lock()) } {
        Ok(result) => {
            tracing::debug!(ok = result.is_ok(), "runner finished");
            ExitCode::SUCCESS
        }
        Err(e) => {
            tracing::error!(error = %e, "runner failed");
            ExitCode::FAILURE
        }
    }
}
