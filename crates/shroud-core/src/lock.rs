//! Session lock file.
//!
//! A well-known file holding the decimal PID of the active helper. The
//! file's existence plus liveness of the recorded PID is the source of
//! truth for "a session is active"; a file whose PID no longer answers a
//! zero-signal probe is a stale leftover from a crashed helper.

use nix::sys::signal::kill;
use nix::unistd::Pid;
use std::path::{Path, PathBuf};
use tracing::{debug, warn};

/// What a lock file at a given path currently represents.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LockProbe {
    /// No lock file exists.
    Absent,
    /// A lock file exists but its PID is dead.
    Stale(i32),
    /// A lock file exists and its PID is alive.
    Live(i32),
}

/// Held session lock. Releasing removes the file; the lock is not removed
/// on drop so that a crashed helper leaves the stale file as evidence.
#[derive(Debug)]
pub struct SessionLock {
    path: PathBuf,
}

impl SessionLock {
    /// Acquire the lock by writing our PID. The write goes to a sibling
    /// temp file first and is renamed into place, so a reader never sees
    /// a partially written PID.
    pub fn acquire(path: &Path) -> Result<Self, LockError> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let tmp = path.with_extension("tmp");
        std::fs::write(&tmp, format!("{}", std::process::id()))?;
        std::fs::rename(&tmp, path)?;
        debug!(path = %path.display(), pid = std::process::id(), "session lock acquired");
        Ok(Self {
            path: path.to_path_buf(),
        })
    }

    /// Remove the lock file.
    pub fn release(self) {
        if let Err(e) = std::fs::remove_file(&self.path) {
            warn!(path = %self.path.display(), error = %e, "failed to remove lock file");
        }
    }

    /// Read the PID recorded in a lock file, if any.
    pub fn read_owner(path: &Path) -> Option<i32> {
        let raw = std::fs::read_to_string(path).ok()?;
        raw.trim().parse::<i32>().ok()
    }

    /// Classify the lock file at `path`.
    pub fn probe(path: &Path) -> LockProbe {
        match Self::read_owner(path) {
            None => LockProbe::Absent,
            Some(pid) if pid_is_alive(pid) => LockProbe::Live(pid),
            Some(pid) => LockProbe::Stale(pid),
        }
    }

    /// True when a live helper owns the lock at `path`.
    pub fn is_live(path: &Path) -> bool {
        matches!(Self::probe(path), LockProbe::Live(_))
    }
}

/// Zero-signal probe: does `pid` answer `kill(pid, 0)`?
fn pid_is_alive(pid: i32) -> bool {
    if pid <= 0 {
        return false;
    }
    kill(Pid::from_raw(pid), None).is_ok()
}

/// Lock file errors.
#[derive(Debug, thiserror::Error)]
pub enum LockError {
    #[error("failed to write lock file: {0}")]
    Io(#[from] std::io::Error),
}
