use crate::header::{EntryHeader, MIN_HEADER_SIZE};
use crate::prelude::*;
use crate::util::retry_interrupted;
use fs2::FileExt;
use std::fs::File;
use std::io::{self, SeekFrom};

/// One cache file, held under an exclusive advisory lock for the lifetime of
/// the value. The file is `header | payload`; reads and seeks are relative
/// to the payload region.
///
/// Opening never fails on a malformed header — a short or corrupt file just
/// comes up `inactive` (no header) and the cache rewrites it. Closing
/// touches the file's timestamps, which is what makes "oldest mtime" mean
/// "least recently used" during scrub.
#[derive(Debug)]
pub struct Entry {
    file: Option<File>,
    path: PathBuf,
    header: Option<EntryHeader>,
    payload_start: u64,
    position: u64,
}

impl Entry {
    pub fn open(mut file: File, path: PathBuf) -> io::Result<Entry> {
        retry_interrupted(|| file.lock_exclusive())?;
        let len = file.metadata()?.len();
        let mut header = None;
        let mut payload_start = 0;
        if len >= MIN_HEADER_SIZE {
            file.seek(SeekFrom::Start(0))?;
            match EntryHeader::read_from(&mut file) {
                Ok(h) => {
                    payload_start = h.encoded_len();
                    header = Some(h);
                }
                Err(HeaderError::Io(e)) => return Err(e),
                Err(_) => {
                    // Malformed header; the entry stays inactive and will be
                    // rebuilt by the next lookup.
                }
            }
        }
        Ok(Entry {
            file: Some(file),
            path,
            header,
            payload_start,
            position: 0,
        })
    }

    pub fn active(&self) -> bool {
        self.header.is_some()
    }

    pub fn header(&self) -> Option<&EntryHeader> {
        self.header.as_ref()
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    fn file(&mut self) -> &mut File {
        // unwrap rationale: `file` is only None after close(), which consumes
        // the entry.
        self.file.as_mut().unwrap()
    }

    /// Truncate the file and restart it with a fresh header. The write
    /// position lands at the start of the (now empty) payload.
    pub fn set_header(&mut self, header: EntryHeader) -> io::Result<()> {
        let file = self.file();
        file.seek(SeekFrom::Start(0))?;
        file.set_len(0)?;
        header.write_to(file)?;
        file.flush()?;
        self.payload_start = header.encoded_len();
        self.position = 0;
        self.header = Some(header);
        Ok(())
    }

    /// Seek within the payload region.
    pub fn seek_payload(&mut self, pos: u64) -> io::Result<()> {
        if self.header.is_none() {
            return Err(io::Error::new(
                io::ErrorKind::InvalidInput,
                "entry has no header to seek under",
            ));
        }
        let start = self.payload_start;
        self.file().seek(SeekFrom::Start(start + pos))?;
        self.position = pos;
        Ok(())
    }

    pub fn payload_position(&self) -> u64 {
        self.position
    }

    /// Touch the access and modification times, re-assert the lock, and
    /// close. Also runs from Drop; calling it explicitly surfaces errors.
    pub fn close(mut self) -> io::Result<()> {
        match self.file.take() {
            Some(file) => close_handle(file),
            None => Ok(()),
        }
    }
}

fn close_handle(file: File) -> io::Result<()> {
    let now = filetime::FileTime::now();
    filetime::set_file_handle_times(&file, Some(now), Some(now))?;
    // Re-asserting on an already-held descriptor is a no-op; this mirrors
    // release paths where the lock may have been dropped early.
    retry_interrupted(|| file.lock_exclusive())?;
    Ok(())
}

impl Read for Entry {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        if self.header.is_none() {
            return Err(io::Error::new(
                io::ErrorKind::InvalidInput,
                "entry has no header to read under",
            ));
        }
        let n = self.file().read(buf)?;
        self.position += n as u64;
        Ok(n)
    }
}

impl Write for Entry {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        let n = self.file().write(buf)?;
        self.position += n as u64;
        Ok(n)
    }

    fn flush(&mut self) -> io::Result<()> {
        self.file().flush()
    }
}

impl Drop for Entry {
    fn drop(&mut self) {
        if let Some(file) = self.file.take() {
            let _ = close_handle(file);
        }
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::checksum;
    use crate::header::Timestamp;
    use std::fs::OpenOptions;

    const FILE_TEXT: &[u8] = b"TEST FILE\n";

    fn checksum_of(data: &[u8]) -> Vec<u8> {
        let mut h = checksum::SHA256.hasher();
        h.update(data);
        h.finish()
    }

    fn open_entry(path: &Path) -> Entry {
        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .open(path)
            .unwrap();
        Entry::open(file, path.to_path_buf()).unwrap()
    }

    fn header_for(data: &[u8], ts: Timestamp) -> EntryHeader {
        EntryHeader::new(data.len() as u64, true, ts, checksum_of(data)).unwrap()
    }

    #[test]
    fn test_fresh_entry_is_inactive() {
        let tmp = tempfile::tempdir().unwrap();
        let entry = open_entry(&tmp.path().join("entry"));
        assert!(!entry.active());
        assert!(entry.header().is_none());
        entry.close().unwrap();
    }

    #[test]
    fn test_create_write_read() {
        let tmp = tempfile::tempdir().unwrap();
        let path = tmp.path().join("entry");
        let header = header_for(FILE_TEXT, Timestamp::now());

        let mut entry = open_entry(&path);
        entry.set_header(header.clone()).unwrap();
        assert!(entry.active());
        assert_eq!(entry.header().unwrap(), &header);
        entry.write_all(FILE_TEXT).unwrap();
        entry.seek_payload(0).unwrap();
        let mut data = Vec::new();
        entry.read_to_end(&mut data).unwrap();
        assert_eq!(data, FILE_TEXT);
        entry.close().unwrap();
    }

    #[test]
    fn test_reopen_sees_header_and_payload() {
        let tmp = tempfile::tempdir().unwrap();
        let path = tmp.path().join("entry");
        let header = header_for(FILE_TEXT, Timestamp::now());

        let mut entry = open_entry(&path);
        entry.set_header(header.clone()).unwrap();
        entry.write_all(FILE_TEXT).unwrap();
        entry.close().unwrap();

        let mut entry = open_entry(&path);
        assert!(entry.active());
        assert_eq!(entry.header().unwrap(), &header);
        let mut data = Vec::new();
        entry.read_to_end(&mut data).unwrap();
        assert_eq!(data, FILE_TEXT);
        entry.close().unwrap();
    }

    #[test]
    fn test_overwrite_replaces_payload() {
        let tmp = tempfile::tempdir().unwrap();
        let path = tmp.path().join("entry");
        let longer: Vec<u8> = FILE_TEXT.repeat(2);

        let mut entry = open_entry(&path);
        entry.set_header(header_for(FILE_TEXT, Timestamp::now())).unwrap();
        entry.write_all(FILE_TEXT).unwrap();
        entry.close().unwrap();

        let header2 = header_for(&longer, Timestamp::now() + std::time::Duration::from_secs(86400));
        let mut entry = open_entry(&path);
        assert!(entry.active());
        entry.set_header(header2.clone()).unwrap();
        entry.write_all(&longer).unwrap();
        entry.close().unwrap();

        let mut entry = open_entry(&path);
        assert_eq!(entry.header().unwrap(), &header2);
        let mut data = Vec::new();
        entry.read_to_end(&mut data).unwrap();
        assert_eq!(data, longer);
        entry.close().unwrap();
    }

    #[test]
    fn test_garbage_header_is_inactive() {
        let tmp = tempfile::tempdir().unwrap();
        let path = tmp.path().join("entry");
        std::fs::write(&path, [0x55u8; 64]).unwrap();
        let entry = open_entry(&path);
        assert!(!entry.active());
        entry.close().unwrap();
    }

    #[test]
    fn test_close_touches_mtime() {
        let tmp = tempfile::tempdir().unwrap();
        let path = tmp.path().join("entry");
        let mut entry = open_entry(&path);
        entry.set_header(header_for(FILE_TEXT, Timestamp::now())).unwrap();
        entry.write_all(FILE_TEXT).unwrap();
        entry.close().unwrap();

        let old = filetime::FileTime::from_last_modification_time(
            &std::fs::metadata(&path).unwrap(),
        );
        filetime::set_file_mtime(&path, filetime::FileTime::from_unix_time(0, 0)).unwrap();
        open_entry(&path).close().unwrap();
        let new = filetime::FileTime::from_last_modification_time(
            &std::fs::metadata(&path).unwrap(),
        );
        assert!(new >= old);
    }
}
