use crate::checksum::Algorithm;
use crate::prelude::*;
use crate::util::retry_interrupted;
use fs2::FileExt;
use std::fs::{File, OpenOptions};
use std::io::{self, SeekFrom};

const BLOCKSIZE: usize = 4096;

/// A source file held under an advisory lock for as long as the value lives.
/// Readers take the shared form; scrub takes the exclusive form so nobody
/// observes an entry it is about to delete. Metadata (size, mtime, checksum)
/// is only meaningful while the lock is held, which is why it hangs off this
/// type instead of free functions.
#[derive(Debug)]
pub struct LockedSource {
    path: PathBuf,
    file: File,
}

impl LockedSource {
    /// Shared (read) lock.
    pub fn open(path: &Path) -> io::Result<LockedSource> {
        let file = File::open(path)?;
        retry_interrupted(|| file.lock_shared())?;
        Ok(LockedSource {
            path: path.to_path_buf(),
            file,
        })
    }

    /// Exclusive (read+write) lock; used by scrub before deleting.
    pub fn open_exclusive(path: &Path) -> io::Result<LockedSource> {
        let file = OpenOptions::new().read(true).write(true).open(path)?;
        retry_interrupted(|| file.lock_exclusive())?;
        Ok(LockedSource {
            path: path.to_path_buf(),
            file,
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn modified(&self) -> io::Result<Timestamp> {
        Ok(Timestamp::from_system_time(self.file.metadata()?.modified()?))
    }

    pub fn size(&self) -> io::Result<u64> {
        Ok(self.file.metadata()?.len())
    }

    /// Streams the whole file through the hasher in 4 KiB blocks, leaving the
    /// file position back at the start.
    pub fn checksum(&mut self, algorithm: Algorithm) -> io::Result<Vec<u8>> {
        let mut hasher = algorithm.hasher();
        self.file.seek(SeekFrom::Start(0))?;
        let result = (|| {
            let mut block = [0u8; BLOCKSIZE];
            loop {
                let n = self.file.read(&mut block)?;
                if n == 0 {
                    break;
                }
                hasher.update(&block[..n]);
            }
            Ok(hasher.finish())
        })();
        self.file.seek(SeekFrom::Start(0))?;
        result
    }

    pub fn handle(&mut self) -> &mut File {
        &mut self.file
    }
}

impl Drop for LockedSource {
    fn drop(&mut self) {
        let _ = self.file.unlock();
    }
}
