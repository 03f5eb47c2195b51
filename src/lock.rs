use crate::prelude::*;
use crate::util::{fix_file_perms, retry_interrupted};
use fs2::FileExt;
use std::fs::{File, OpenOptions};
use std::io;

// A pathname-identified advisory lock. Every acquisition opens its own
// descriptor, so independent holders within one process serialize against
// each other the same way separate processes do; flock ties the lock to the
// open file description, not the process.
//
// Creation of the lock file is open-or-create (never truncate — another
// process may already hold the lock through that inode), with permissions
// fixed after open.

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LockMode {
    Exclusive,
    Shared,
}

/// Held lock on a lock file. Dropping the guard releases it; release is
/// idempotent because the descriptor is closed exactly once.
#[derive(Debug)]
pub struct FileLock {
    file: File,
}

impl FileLock {
    pub fn acquire(path: &Path, mode: LockMode) -> io::Result<FileLock> {
        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .open(path)?;
        fix_file_perms(&file)?;
        match mode {
            LockMode::Exclusive => retry_interrupted(|| file.lock_exclusive())?,
            LockMode::Shared => retry_interrupted(|| file.lock_shared())?,
        }
        trace!(?path, ?mode, "acquired lock");
        Ok(FileLock { file })
    }

    /// Create the lock file ahead of time so later shared acquisitions never
    /// race on creation.
    pub fn ensure(path: &Path) -> io::Result<()> {
        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .open(path)?;
        fix_file_perms(&file)?;
        Ok(())
    }

    pub fn release(self) {
        // Unlock happens in Drop; this just makes release explicit at call
        // sites that want it.
    }
}

impl Drop for FileLock {
    fn drop(&mut self) {
        let _ = self.file.unlock();
    }
}
