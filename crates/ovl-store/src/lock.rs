//! Exclusive lock over a checkout's state directory.
//!
//! Held from the start of a scan through the end of repair; released when the
//! guard drops, whether the run succeeded or not.

use fs4::FileExt;
use ovl_error::{FsckError, Result};
use std::fs::{File, OpenOptions};
use std::path::{Path, PathBuf};
use tracing::{debug, warn};

/// Lock file name inside the checkout state directory.
pub const LOCK_FILE: &str = "lock";

#[derive(Debug)]
pub struct CheckoutLock {
    file: File,
    path: PathBuf,
}

impl CheckoutLock {
    /// Take the lock without blocking.
    ///
    /// Returns [`FsckError::Locked`] if another holder (usually a live mount)
    /// has it.
    pub fn try_acquire(state_dir: &Path) -> Result<Self> {
        let path = state_dir.join(LOCK_FILE);
        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .truncate(false)
            .open(&path)?;
        match file.try_lock_exclusive() {
            Ok(()) => {
                debug!(target: "ovl::store", path = %path.display(), "checkout lock acquired");
                Ok(Self { file, path })
            }
            Err(err) if is_contended(&err) => Err(FsckError::Locked(path)),
            Err(err) => Err(FsckError::Io(err)),
        }
    }

    #[must_use]
    pub fn path(&self) -> &Path {
        &self.path
    }
}

fn is_contended(err: &std::io::Error) -> bool {
    err.kind() == std::io::ErrorKind::WouldBlock
}

impl Drop for CheckoutLock {
    fn drop(&mut self) {
        if let Err(err) = FileExt::unlock(&self.file) {
            warn!(target: "ovl::store", path = %self.path.display(), error = %err, "failed to release checkout lock");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn second_holder_is_refused_until_release() {
        let dir = tempfile::tempdir().unwrap();
        let first = CheckoutLock::try_acquire(dir.path()).unwrap();
        assert_eq!(first.path(), dir.path().join(LOCK_FILE));

        match CheckoutLock::try_acquire(dir.path()) {
            Err(FsckError::Locked(path)) => assert_eq!(path, dir.path().join(LOCK_FILE)),
            other => panic!("expected Locked, got {other:?}"),
        }

        drop(first);
        let _again = CheckoutLock::try_acquire(dir.path()).unwrap();
    }
}
