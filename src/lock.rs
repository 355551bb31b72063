//! Host-wide exclusive lock gating backup pipeline execution.
//!
//! Backed by `flock(2)` on a well-known path. The lock is released when the
//! guard drops, or by the kernel if the process dies mid-pipeline.

use crate::utils::errors::{AgentError, Result};
use nix::errno::Errno;
use nix::fcntl::{Flock, FlockArg};
use std::fs::{File, OpenOptions};
use std::path::Path;
use tracing::debug;

pub struct ExclusiveLock {
    _guard: Flock<File>,
}

impl ExclusiveLock {
    fn open(path: &Path) -> Result<File> {
        OpenOptions::new()
            .write(true)
            .create(true)
            .truncate(false)
            .open(path)
            .map_err(AgentError::Io)
    }

    /// Acquires the lock, blocking until the current holder releases it.
    pub fn acquire(path: &Path) -> Result<Self> {
        let file = Self::open(path)?;
        debug!("Acquiring exclusive lock {}", path.display());
        let guard = Flock::lock(file, FlockArg::LockExclusive)
            .map_err(|(_, errno)| AgentError::Precondition(format!("flock failed: {}", errno)))?;
        Ok(Self { _guard: guard })
    }

    /// Attempts to acquire the lock without blocking. Returns None when
    /// another pipeline already holds it.
    pub fn try_acquire(path: &Path) -> Result<Option<Self>> {
        let file = Self::open(path)?;
        match Flock::lock(file, FlockArg::LockExclusiveNonblock) {
            Ok(guard) => Ok(Some(Self { _guard: guard })),
            Err((_, Errno::EWOULDBLOCK)) => Ok(None),
            Err((_, errno)) => Err(AgentError::Precondition(format!("flock failed: {}", errno))),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_second_holder_observes_lock_held() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("backup.lock");

        let first = ExclusiveLock::try_acquire(&path).unwrap();
        assert!(first.is_some());

        // Same host, second pipeline: must not proceed.
        let second = ExclusiveLock::try_acquire(&path).unwrap();
        assert!(second.is_none());
    }

    #[test]
    fn test_lock_released_on_drop() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("backup.lock");

        let guard = ExclusiveLock::try_acquire(&path).unwrap();
        drop(guard);

        assert!(ExclusiveLock::try_acquire(&path).unwrap().is_some());
    }

    #[test]
    fn test_blocking_acquire_when_free() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("backup.lock");
        assert!(ExclusiveLock::acquire(&path).is_ok());
    }
}
