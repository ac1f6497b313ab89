//! Unified error types for the corral workspace.
//!
//! Every crate reports failures through [`CorralError`]. Binaries convert it
//! into `anyhow::Error` at the top level only.

use std::path::PathBuf;

use thiserror::Error;

use crate::types::LockMode;

/// Top-level error type shared across the workspace.
#[derive(Debug, Error)]
pub enum CorralError {
    /// An I/O operation failed.
    #[error("I/O error at {path}: {source}")]
    Io {
        /// Path where the I/O error occurred.
        path: PathBuf,
        /// Underlying I/O error.
        source: std::io::Error,
    },

    /// A configuration value is invalid.
    #[error("invalid configuration: {message}")]
    Config {
        /// Description of the invalid configuration.
        message: String,
    },

    /// A required entity was not found.
    #[error("{kind} not found: {id}")]
    NotFound {
        /// Type of the missing entity.
        kind: &'static str,
        /// Identifier of the missing entity.
        id: String,
    },

    /// A permission or capability error.
    #[error("permission denied: {message}")]
    PermissionDenied {
        /// Description of the denied operation.
        message: String,
    },

    /// Serialization or deserialization failed.
    #[error("serialization error: {source}")]
    Serialization {
        /// Underlying serialization error.
        #[from]
        source: serde_json::Error,
    },

    /// The resource is held incompatibly by another holder.
    ///
    /// Safe to retry once the holder is done.
    #[error("{resource} is held by {holder}")]
    ResourceLocked {
        /// Human-readable resource identity, e.g. `container tank:web`.
        resource: String,
        /// Human-readable identity of the current holder.
        holder: String,
    },

    /// Blocking on the lock would close a wait-for cycle.
    #[error("deadlock detected while trying to lock {resource} {}", .mode.adverb())]
    DeadlockDetected {
        /// Resource the caller tried to lock.
        resource: String,
        /// Requested lock mode.
        mode: LockMode,
    },

    /// A runner command identifier is not registered.
    #[error("unknown command: {name}")]
    UnknownCommand {
        /// The rejected identifier.
        name: String,
    },

    /// A command ran but reported failure.
    #[error("command failed: {message}")]
    CommandFailed {
        /// Reason reported by the command.
        message: String,
    },

    /// A system call or process operation failed.
    #[error("{operation} failed: {source}")]
    System {
        /// Name of the failed operation, e.g. `fork`.
        operation: &'static str,
        /// Underlying OS error.
        source: std::io::Error,
    },

    /// The scheduler plan has been stopped and accepts no more work.
    #[error("plan for pool {pool} is stopped")]
    PlanStopped {
        /// Pool owning the plan.
        pool: String,
    },
}

impl CorralError {
    /// Builds a [`CorralError::System`] from anything convertible into an OS error.
    pub fn system(operation: &'static str, source: impl Into<std::io::Error>) -> Self {
        Self::System {
            operation,
            source: source.into(),
        }
    }

    /// Returns `true` for lock contention, which callers may retry.
    #[must_use]
    pub const fn is_retryable(&self) -> bool {
        matches!(self, Self::ResourceLocked { .. })
    }
}

/// Convenience alias used throughout the workspace.
pub type Result<T> = std::result::Result<T, CorralError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn resource_locked_names_resource_and_holder() {
        let err = CorralError::ResourceLocked {
            resource: "container tank:web".into(),
            holder: "ct_start".into(),
        };
        assert_eq!(err.to_string(), "container tank:web is held by ct_start");
        assert!(err.is_retryable());
    }

    #[test]
    fn deadlock_message_mentions_mode() {
        let err = CorralError::DeadlockDetected {
            resource: "pool tank".into(),
            mode: LockMode::Exclusive,
        };
        assert_eq!(
            err.to_string(),
            "deadlock detected while trying to lock pool tank exclusively"
        );
        assert!(!err.is_retryable());
    }
}
