//! Exclusive lock over the workers directory for the duration of a run.
//!
//! The lock file lives beside the directory, never inside it, so it
//! survives a complete clean.

use std::fs::{self, File, OpenOptions};

use camino::Utf8Path;
use rustix::fs::{flock, FlockOperation};
use rustix::io::Errno;
use tracing::debug;

use crate::errors::{ProvisionError, Result};

/// Held for as long as the run owns the workers directory; released on drop.
#[derive(Debug)]
pub struct RunLock {
    _file: File,
}

impl RunLock {
    /// Take the lock without blocking; a concurrent holder yields
    /// [`ProvisionError::Locked`].
    pub fn acquire(path: &Utf8Path) -> Result<Self> {
        if let Some(parent) = path.parent().filter(|p| !p.as_str().is_empty()) {
            fs::create_dir_all(parent)?;
        }
        let file = OpenOptions::new()
            .create(true)
            .truncate(false)
            .write(true)
            .open(path)?;
        match flock(&file, FlockOperation::NonBlockingLockExclusive) {
            Ok(()) => {
                debug!("Locked {path}");
                Ok(Self { _file: file })
            }
            Err(Errno::WOULDBLOCK) => Err(ProvisionError::Locked(path.as_std_path().to_path_buf())),
            Err(e) => Err(std::io::Error::from(e).into()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_second_lock_fails() {
        let td = tempfile::tempdir().unwrap();
        let path = Utf8Path::from_path(td.path()).unwrap().join(".lock");
        let held = RunLock::acquire(&path).unwrap();
        assert!(matches!(
            RunLock::acquire(&path),
            Err(ProvisionError::Locked(_))
        ));
        drop(held);
        RunLock::acquire(&path).unwrap();
    }

    #[test]
    fn test_creates_missing_parent() {
        let td = tempfile::tempdir().unwrap();
        let path = Utf8Path::from_path(td.path()).unwrap().join("srv/workers.lock");
        let _held = RunLock::acquire(&path).unwrap();
        assert!(path.is_file());
    }
}
