//! Control plane of the corral container daemon.
//!
//! Mutating commands lock their target ([`lock`]), mark it as manipulated
//! ([`manipulation`]), act on the container through a privilege-separated
//! runner ([`control`]) and publish the resulting state changes
//! ([`event`]). Pools start and stop many containers at once through
//! bounded, priority-ordered [`plan`]s.

#![allow(unsafe_code)]
#![cfg_attr(test, allow(clippy::expect_used, clippy::unwrap_used))]

pub mod commands;
pub mod control;
pub mod driver;
pub mod entity;
pub mod event;
pub mod lock;
pub mod manipulation;
pub mod monitor;
pub mod plan;
pub mod pool;
pub mod registry;
