//! Process resource limits.
//!
//! Limits are resolved from their configured names in the parent and applied
//! in the child before privileges are dropped, so hard limits may be raised.

use corral_common::error::{CorralError, Result};
use corral_common::types::PrLimit;
use nix::sys::resource::{Resource, setrlimit};

/// A limit whose name has been mapped to a kernel resource.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ResolvedLimit {
    resource: Resource,
    soft: libc::rlim_t,
    hard: libc::rlim_t,
}

impl ResolvedLimit {
    /// Maps a configured limit onto its kernel resource.
    ///
    /// # Errors
    ///
    /// Returns an error if the name is not a known resource or the soft
    /// limit exceeds the hard limit.
    pub fn resolve(limit: &PrLimit) -> Result<Self> {
        let resource = resource_by_name(&limit.name).ok_or_else(|| CorralError::Config {
            message: format!("unknown resource limit '{}'", limit.name),
        })?;
        let soft = limit.soft.unwrap_or(libc::RLIM_INFINITY);
        let hard = limit.hard.unwrap_or(libc::RLIM_INFINITY);
        if soft > hard {
            return Err(CorralError::Config {
                message: format!(
                    "resource limit '{}': soft limit {soft} exceeds hard limit {hard}",
                    limit.name
                ),
            });
        }
        Ok(Self {
            resource,
            soft,
            hard,
        })
    }

    /// Applies the limit to the calling process.
    ///
    /// Does not allocate; safe between `fork` and `exec`.
    ///
    /// # Errors
    ///
    /// Returns the OS error of `setrlimit(2)`.
    pub fn apply(&self) -> nix::Result<()> {
        setrlimit(self.resource, self.soft, self.hard)
    }

    /// The kernel resource this limit applies to.
    #[must_use]
    pub const fn resource(&self) -> Resource {
        self.resource
    }
}

/// Resolves a list of configured limits.
///
/// # Errors
///
/// Returns an error for the first limit that cannot be resolved.
pub fn resolve_all(limits: &[PrLimit]) -> Result<Vec<ResolvedLimit>> {
    limits.iter().map(ResolvedLimit::resolve).collect()
}

fn resource_by_name(name: &str) -> Option<Resource> {
    let name = name.to_ascii_lowercase();
    let name = name.strip_prefix("rlimit_").unwrap_or(&name);
    Some(match name {
        "as" => Resource::RLIMIT_AS,
        "core" => Resource::RLIMIT_CORE,
        "cpu" => Resource::RLIMIT_CPU,
        "data" => Resource::RLIMIT_DATA,
        "fsize" => Resource::RLIMIT_FSIZE,
        "locks" => Resource::RLIMIT_LOCKS,
        "memlock" => Resource::RLIMIT_MEMLOCK,
        "msgqueue" => Resource::RLIMIT_MSGQUEUE,
        "nice" => Resource::RLIMIT_NICE,
        "nofile" => Resource::RLIMIT_NOFILE,
        "nproc" => Resource::RLIMIT_NPROC,
        "rss" => Resource::RLIMIT_RSS,
        "rtprio" => Resource::RLIMIT_RTPRIO,
        "rttime" => Resource::RLIMIT_RTTIME,
        "sigpending" => Resource::RLIMIT_SIGPENDING,
        "stack" => Resource::RLIMIT_STACK,
        _ => return None,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn resolves_known_names_case_insensitively() {
        let limit = ResolvedLimit::resolve(&PrLimit::new("NOFILE", 1024, 4096)).expect("resolve");
        assert_eq!(limit.resource(), Resource::RLIMIT_NOFILE);
        let prefixed = ResolvedLimit::resolve(&PrLimit::new("rlimit_nproc", 10, 10)).expect("resolve");
        assert_eq!(prefixed.resource(), Resource::RLIMIT_NPROC);
    }

    #[test]
    fn missing_values_mean_unlimited() {
        let limit = PrLimit {
            name: "core".into(),
            soft: None,
            hard: None,
        };
        let resolved = ResolvedLimit::resolve(&limit).expect("resolve");
        assert_eq!(resolved.soft, libc::RLIM_INFINITY);
        assert_eq!(resolved.hard, libc::RLIM_INFINITY);
    }

    #[test]
    fn rejects_unknown_name() {
        assert!(ResolvedLimit::resolve(&PrLimit::new("bogus", 1, 1)).is_err());
    }

    #[test]
    fn rejects_soft_above_hard() {
        assert!(ResolvedLimit::resolve(&PrLimit::new("nofile", 10, 5)).is_err());
    }

    #[test]
    fn resolve_all_stops_at_first_error() {
        let limits = vec![PrLimit::new("nofile", 1, 2), PrLimit::new("nope", 1, 2)];
        assert!(resolve_all(&limits).is_err());
        assert_eq!(resolve_all(&limits[..1]).expect("resolve").len(), 1);
    }
}
