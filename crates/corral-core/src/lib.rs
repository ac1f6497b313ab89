//! # corral-core
//!
//! Low-level Linux process primitives used by the corral daemon when it
//! hands work to an unprivileged container owner.
//!
//! This crate provides safe abstractions over:
//! - **Resource limits**: `setrlimit(2)` applied before a privilege drop.
//! - **Cgroups v2**: joining a container's cgroup from a forked child.
//! - **User switching**: `setgroups/setgid/setuid` as one prepared step.
//!
//! All unsafe system calls are encapsulated in safe wrappers with
//! proper error handling and `// SAFETY:` documentation.

#![cfg_attr(test, allow(clippy::expect_used, clippy::unwrap_used))]

pub mod cgroup;
pub mod prlimit;
pub mod switch_user;
