//! Cgroups v2 attachment for runner processes.
//!
//! The daemon only needs to place spawned processes into an existing
//! container cgroup; parameter files are managed elsewhere.

use std::fs::OpenOptions;
use std::os::fd::OwnedFd;
use std::path::{Path, PathBuf};

use corral_common::error::{CorralError, Result};

/// Name of the file listing member processes of a cgroup.
pub const PROCS_FILE: &str = "cgroup.procs";

/// Resolves a cgroup path relative to the hierarchy root.
///
/// Leading slashes on `relative` are ignored so that both `"a/b"` and
/// `"/a/b"` land below `root`.
#[must_use]
pub fn abs_path(root: &Path, relative: &Path) -> PathBuf {
    let relative = relative.strip_prefix("/").unwrap_or(relative);
    root.join(relative)
}

/// Creates the cgroup directory (and parents) if missing.
///
/// # Errors
///
/// Returns an error if the directory cannot be created.
pub fn ensure(path: &Path) -> Result<()> {
    std::fs::create_dir_all(path).map_err(|e| CorralError::Io {
        path: path.to_path_buf(),
        source: e,
    })?;
    tracing::debug!(path = %path.display(), "cgroup ensured");
    Ok(())
}

/// Adds a process to the cgroup by writing its PID.
///
/// # Errors
///
/// Returns an error if writing to `cgroup.procs` fails.
pub fn attach_pid(path: &Path, pid: u32) -> Result<()> {
    let procs_path = path.join(PROCS_FILE);
    std::fs::write(&procs_path, pid.to_string()).map_err(|e| CorralError::Io {
        path: procs_path,
        source: e,
    })?;
    tracing::debug!(pid, path = %path.display(), "added process to cgroup");
    Ok(())
}

/// Opens `cgroup.procs` for writing ahead of a fork.
///
/// Writing `0` to the returned descriptor moves the writing process itself,
/// which lets a freshly forked child join the cgroup without allocating.
///
/// # Errors
///
/// Returns an error if the file cannot be opened.
pub fn open_procs(path: &Path) -> Result<OwnedFd> {
    let procs_path = path.join(PROCS_FILE);
    let file = OpenOptions::new()
        .write(true)
        .open(&procs_path)
        .map_err(|e| CorralError::Io {
            path: procs_path,
            source: e,
        })?;
    Ok(OwnedFd::from(file))
}

/// Moves the calling process into the cgroup behind `procs`.
///
/// Safe to call between `fork` and `exec`.
///
/// # Errors
///
/// Returns the OS error of the write.
pub fn join_self(procs: &OwnedFd) -> std::io::Result<()> {
    let _ = nix::unistd::write(procs, b"0")?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn abs_path_ignores_leading_slash() {
        let root = Path::new("/sys/fs/cgroup/corral");
        assert_eq!(
            abs_path(root, Path::new("/tank/ct.web")),
            PathBuf::from("/sys/fs/cgroup/corral/tank/ct.web")
        );
        assert_eq!(
            abs_path(root, Path::new("tank")),
            PathBuf::from("/sys/fs/cgroup/corral/tank")
        );
    }

    #[test]
    fn attach_pid_writes_procs_file() {
        let dir = tempfile::tempdir().expect("tempdir");
        ensure(dir.path()).expect("ensure");
        attach_pid(dir.path(), 4242).expect("attach");
        let content = std::fs::read_to_string(dir.path().join(PROCS_FILE)).expect("read");
        assert_eq!(content, "4242");
    }

    #[test]
    fn open_procs_requires_existing_file() {
        let dir = tempfile::tempdir().expect("tempdir");
        assert!(open_procs(dir.path()).is_err());
        std::fs::write(dir.path().join(PROCS_FILE), "").expect("create");
        assert!(open_procs(dir.path()).is_ok());
    }
}
