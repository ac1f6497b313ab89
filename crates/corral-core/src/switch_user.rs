//! Switching a forked child to an unprivileged principal.
//!
//! Everything that needs memory allocation (path resolution, opening the
//! cgroup membership file) happens in the parent
//! through [`PrivilegeDrop::prepare`]. The child then calls
//! [`PrivilegeDrop::apply`], which only issues system calls, before it
//! executes the runner or its own runner logic.

use std::os::fd::{OwnedFd, RawFd};
use std::path::{Path, PathBuf};

use corral_common::error::Result;
use corral_common::types::{PrLimit, UserIdentity};
use nix::unistd::{Gid, Uid, getegid, geteuid, setgid, setgroups, setuid};

use crate::prlimit::{self, ResolvedLimit};

/// The principal a child process switches to.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SwitchTarget {
    /// System user name, exported as `USER`.
    pub name: String,
    /// Target user ID.
    pub uid: Uid,
    /// Target group ID, also the only supplementary group.
    pub gid: Gid,
    /// Home directory, exported as `HOME` and used as working directory.
    pub home: PathBuf,
}

impl SwitchTarget {
    /// Builds a target from a configured user identity.
    #[must_use]
    pub fn from_identity(identity: &UserIdentity) -> Self {
        Self {
            name: identity.name.clone(),
            uid: Uid::from_raw(identity.uid),
            gid: Gid::from_raw(identity.gid),
            home: identity.home.clone(),
        }
    }

    /// Whether the calling process already runs as this principal.
    #[must_use]
    pub fn is_current(&self) -> bool {
        geteuid() == self.uid && getegid() == self.gid
    }

    /// Drops supplementary groups, then switches GID and UID.
    ///
    /// A no-op when the process already runs as the target. Safe between
    /// `fork` and `exec`.
    ///
    /// # Errors
    ///
    /// Returns the OS error of the first failing call.
    pub fn switch_ids(&self) -> nix::Result<()> {
        if self.is_current() {
            return Ok(());
        }
        setgroups(&[self.gid])?;
        setgid(self.gid)?;
        setuid(self.uid)?;
        Ok(())
    }
}

/// A prepared, allocation-free privilege drop.
///
/// Applying it performs, in order: resource limits, cgroup membership,
/// inheritance of the descriptors to keep, and the UID/GID switch. There is
/// no point in between where the child has partially dropped privileges and
/// runs foreign code.
#[derive(Debug)]
pub struct PrivilegeDrop {
    target: SwitchTarget,
    limits: Vec<ResolvedLimit>,
    cgroup_procs: Option<OwnedFd>,
    keep_fds: Vec<RawFd>,
}

impl PrivilegeDrop {
    /// Resolves limits and opens the cgroup membership file.
    ///
    /// # Errors
    ///
    /// Returns an error if a limit is unknown or the cgroup cannot be opened.
    pub fn prepare(target: SwitchTarget, limits: &[PrLimit], cgroup: Option<&Path>) -> Result<Self> {
        let limits = prlimit::resolve_all(limits)?;
        let cgroup_procs = cgroup.map(crate::cgroup::open_procs).transpose()?;
        tracing::debug!(
            user = %target.name,
            uid = target.uid.as_raw(),
            gid = target.gid.as_raw(),
            limits = limits.len(),
            cgroup = ?cgroup,
            "privilege drop prepared"
        );
        Ok(Self {
            target,
            limits,
            cgroup_procs,
            keep_fds: Vec::new(),
        })
    }

    /// Descriptors that must survive `exec` in the child.
    #[must_use]
    pub fn keep_fds(mut self, fds: impl IntoIterator<Item = RawFd>) -> Self {
        self.keep_fds.extend(fds);
        self
    }

    /// The principal this drop switches to.
    #[must_use]
    pub const fn target(&self) -> &SwitchTarget {
        &self.target
    }

    /// Applies the prepared setup to the calling process.
    ///
    /// Intended to run in a freshly forked child; it does not allocate.
    ///
    /// # Errors
    ///
    /// Returns the OS error of the first failing step.
    pub fn apply(&self) -> std::io::Result<()> {
        for limit in &self.limits {
            limit.apply()?;
        }
        if let Some(procs) = &self.cgroup_procs {
            crate::cgroup::join_self(procs)?;
        }
        for &fd in &self.keep_fds {
            clear_cloexec(fd)?;
        }
        self.target.switch_ids()?;
        Ok(())
    }
}

/// Lets `fd` be inherited across `exec`.
///
/// # Errors
///
/// Returns the OS error of `fcntl(2)`.
pub fn clear_cloexec(fd: RawFd) -> std::io::Result<()> {
    // SAFETY: F_SETFD with a zero flag set only touches the descriptor flags;
    // an invalid descriptor yields EBADF which is reported.
    #[allow(unsafe_code)]
    let rc = unsafe { libc::fcntl(fd, libc::F_SETFD, 0) };
    if rc == -1 {
        return Err(std::io::Error::last_os_error());
    }
    Ok(())
}

/// Closes every descriptor of the calling process except those in `keep`.
///
/// `keep` must be sorted in ascending order. Safe between `fork` and the
/// end of the child: it only issues `close_range(2)`, falling back to
/// closing descriptors one by one on kernels without it.
///
/// # Errors
///
/// Returns the OS error of the first failing call.
pub fn close_other_fds(keep: &[RawFd]) -> std::io::Result<()> {
    let mut first: libc::c_uint = 0;
    for &fd in keep {
        let Ok(fd) = libc::c_uint::try_from(fd) else {
            continue;
        };
        if fd > first {
            close_range(first, fd - 1)?;
        }
        first = first.max(fd.saturating_add(1));
    }
    close_range(first, libc::c_uint::MAX)
}

#[allow(unsafe_code)]
fn close_range(first: libc::c_uint, last: libc::c_uint) -> std::io::Result<()> {
    let flags: libc::c_uint = 0;
    // SAFETY: close_range only releases descriptors of this process; the
    // caller owns every descriptor in the range.
    let rc = unsafe { libc::syscall(libc::SYS_close_range, first, last, flags) };
    if rc == 0 {
        return Ok(());
    }
    let err = std::io::Error::last_os_error();
    if err.raw_os_error() != Some(libc::ENOSYS) {
        return Err(err);
    }
    // SAFETY: sysconf has no side effects.
    let open_max = unsafe { libc::sysconf(libc::_SC_OPEN_MAX) };
    let end = libc::c_uint::try_from(open_max).unwrap_or(1024).min(last.saturating_add(1));
    for fd in first..end {
        let Ok(fd) = RawFd::try_from(fd) else {
            break;
        };
        // SAFETY: see above; EBADF for unused numbers is expected.
        let _ = unsafe { libc::close(fd) };
    }
    Ok(())
}
