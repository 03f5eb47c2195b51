use crate::checksum::Algorithm;
use crate::entry::Entry;
use crate::header::EntryHeader;
use crate::lock::{FileLock, LockMode};
use crate::prelude::*;
use crate::process::{Input, Processor};
use crate::source::LockedSource;
use crate::util::{clean_rel_path, fix_dir_perms, fix_file_perms};
use crate::worker::Worker;
use std::collections::VecDeque;
use std::fs::{self, File, OpenOptions};
use std::io;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;
use walkdir::WalkDir;

// The filter cache. One file per source document, mirroring the source tree
// under the cache root; each file is an EntryHeader identifying the source
// state plus the transformed payload. Readers share the pool lock
// (`<root>/.lock`); scrub takes it exclusively, so structural sweeps never
// run while lookups are in flight. Within a key, the entry file's own
// exclusive lock serializes rebuilds, so a stale entry is transformed at
// most once no matter how many readers race to it.

pub const LOCKFILE_NAME: &str = ".lock";

#[derive(Debug, Clone, Default)]
pub struct Options {
    pub max_age: Option<Duration>,
    pub max_entries: Option<usize>,
    pub auto_scrub: bool,
}

/// Who runs scrubs: the calling thread, or a dedicated worker so lookups
/// never wait on a sweep.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ScrubMode {
    Inline,
    Dispatched,
}

/// What a lookup hands back: either a positioned cache entry, or a bypass
/// handle for content the transformer refuses to cache.
pub enum Lookup {
    Cached(Entry),
    Bypass(AutoProcess),
}

impl std::fmt::Debug for Lookup {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Lookup::Cached(entry) => f.debug_tuple("Cached").field(entry).finish(),
            Lookup::Bypass(_) => f.debug_tuple("Bypass").finish(),
        }
    }
}

/// Re-runs the transformer against the live source on demand. Returned for
/// tombstoned entries; holds no locks between invocations — each `run`
/// re-acquires the pool lock (shared) and the source lock.
pub struct AutoProcess {
    header: EntryHeader,
    lockfile: PathBuf,
    source_path: PathBuf,
    processor: Arc<dyn Processor>,
}

impl AutoProcess {
    /// Header describing the source state observed at lookup time
    /// (`cached = false`).
    pub fn header(&self) -> &EntryHeader {
        &self.header
    }

    pub fn run(&self, output: &mut dyn Write) -> Result<(), ProcessError> {
        debug!(source = %self.source_path.display(), "bypass transform");
        let _pool = FileLock::acquire(&self.lockfile, LockMode::Shared)?;
        let mut source = LockedSource::open(&self.source_path)?;
        let path = self.source_path.clone();
        let mut input = Input::new(&path, source.handle());
        self.processor.process(&mut input, output, false)
    }
}

pub struct Cache {
    shared: Arc<CacheShared>,
    scrubber: Option<Worker>,
}

struct CacheShared {
    root: PathBuf,
    source_root: PathBuf,
    checksum: Algorithm,
    processor: Arc<dyn Processor>,
    options: Options,
    // Approximate; authoritative only right after a scrub or under the pool
    // lock. Tombstones are not counted at insert time but scrub recounts
    // every file, so they still age out.
    known_entries: AtomicUsize,
}

impl Cache {
    pub fn new(
        root: &Path,
        source_root: &Path,
        checksum: Algorithm,
        processor: Arc<dyn Processor>,
        options: Options,
        scrub_mode: ScrubMode,
    ) -> Result<Cache> {
        if !source_root.is_dir() {
            bail!("not a directory: {}", source_root.display());
        }
        if let Some(max) = options.max_entries {
            if max < 2 {
                bail!("invalid maximum entry count: {max}");
            }
        }
        fs::create_dir_all(root)
            .wrap_err_with(|| format!("creating cache root {}", root.display()))?;
        fix_dir_perms(root)?;
        let shared = Arc::new(CacheShared {
            root: root.to_path_buf(),
            source_root: source_root.to_path_buf(),
            checksum,
            processor,
            options,
            known_entries: AtomicUsize::new(0),
        });
        FileLock::ensure(&shared.lockfile())?;
        // Establishes known_entries and clears out anything stale from a
        // previous run.
        shared.scrub(false)?;
        let scrubber = match scrub_mode {
            ScrubMode::Inline => None,
            ScrubMode::Dispatched => Some(Worker::spawn("cache-scrub")),
        };
        Ok(Cache { shared, scrubber })
    }

    pub fn root(&self) -> &Path {
        &self.shared.root
    }

    pub fn source_root(&self) -> &Path {
        &self.shared.source_root
    }

    pub fn options(&self) -> &Options {
        &self.shared.options
    }

    pub fn lockfile(&self) -> PathBuf {
        self.shared.lockfile()
    }

    /// Entry count as of the last scrub. Takes the pool lock exclusively;
    /// only call from outside the cache's own code paths.
    pub fn len(&self) -> Result<usize> {
        let _pool = FileLock::acquire(&self.shared.lockfile(), LockMode::Exclusive)?;
        Ok(self.shared.known_entries.load(Ordering::SeqCst))
    }

    pub fn lookup(&self, path: &str) -> Result<Lookup> {
        let rel = clean_rel_path(path)?;
        if self.shared.options.auto_scrub && self.shared.options.max_entries.is_some() {
            debug!(path, "auto-scrub check before lookup");
            self.schedule_scrub(true)?;
        }
        self.shared.lookup(&rel)
    }

    /// Inline mode runs the scrub on the calling thread; dispatched mode
    /// enqueues it and returns immediately.
    pub fn schedule_scrub(&self, tentative: bool) -> Result<()> {
        match &self.scrubber {
            None => {
                self.shared.scrub(tentative)?;
            }
            Some(worker) => {
                let shared = self.shared.clone();
                worker.schedule(move || shared.scrub(tentative).map(|_| ()));
            }
        }
        Ok(())
    }

    /// Sweep the cache: drop orphans and expired entries, then enforce the
    /// entry bound oldest-first. Returns false if a tentative scrub decided
    /// there was nothing to do.
    pub fn scrub(&self, tentative: bool) -> Result<bool> {
        self.shared.scrub(tentative)
    }

    pub fn close(mut self) {
        if let Some(mut worker) = self.scrubber.take() {
            worker.finish();
            worker.join();
        }
    }
}

impl CacheShared {
    fn lockfile(&self) -> PathBuf {
        self.root.join(LOCKFILE_NAME)
    }

    fn auto_process(&self, header: EntryHeader, source_path: PathBuf) -> AutoProcess {
        AutoProcess {
            header,
            lockfile: self.lockfile(),
            source_path,
            processor: self.processor.clone(),
        }
    }

    fn lookup(&self, rel: &Path) -> Result<Lookup> {
        let _pool = FileLock::acquire(&self.lockfile(), LockMode::Shared)?;

        let original_path = self.source_root.join(rel);
        let mut original = match LockedSource::open(&original_path) {
            Ok(source) => source,
            Err(e) if e.kind() == io::ErrorKind::NotFound => {
                return Err(CacheError::NotFound(rel.to_path_buf()).into());
            }
            Err(e) => {
                return Err(e)
                    .wrap_err_with(|| format!("opening source {}", original_path.display()));
            }
        };
        debug!(path = %rel.display(), "locked original");

        let cache_path = self.root.join(rel);
        self.ensure_parent_dirs(rel)?;
        let (handle, was_new) = open_cache_file(&cache_path)
            .wrap_err_with(|| format!("opening cache entry {}", cache_path.display()))?;
        fix_file_perms(&handle)?;
        let mut entry = Entry::open(handle, cache_path)?;

        let new_header = EntryHeader::new(
            original.size()?,
            true,
            original.modified()?,
            original.checksum(self.checksum)?,
        )?;

        if entry.header().map_or(false, |prev| !prev.cached()) {
            // Tombstone: never transform inline. Refresh the recorded source
            // state (a tombstone never compares equal, so there is nothing
            // to short-circuit on) and hand back the bypass handle. The
            // locks all release here and the handle re-acquires them per
            // invocation.
            debug!(path = %rel.display(), "tombstoned entry, returning bypass");
            entry.set_header(new_header.uncached())?;
            let header = entry.header().cloned().expect("header was just set");
            drop(entry);
            return Ok(Lookup::Bypass(self.auto_process(header, original_path)));
        }

        let hit = entry.header().map_or(false, |prev| prev == &new_header);
        if !hit {
            debug!(path = %rel.display(), "calling transformer");
            entry.set_header(new_header.clone())?;
            let source_path = original.path().to_path_buf();
            let result = {
                let mut input = Input::new(&source_path, original.handle());
                self.processor.process(&mut input, &mut entry, true)
            };
            match result {
                Ok(()) => {}
                Err(ProcessError::NoCache) => {
                    debug!(path = %rel.display(), "transformer declined caching");
                    entry.set_header(new_header.uncached())?;
                    let header = entry.header().cloned().expect("header was just set");
                    if let Err(err) = entry.close() {
                        warn!(%err, "closing tombstoned entry");
                    }
                    return Ok(Lookup::Bypass(self.auto_process(header, original_path)));
                }
                Err(ProcessError::Unsupported) => {
                    // No output for this input; keep a header-only entry so
                    // the next lookup is still a hit.
                    entry.set_header(new_header)?;
                }
                Err(err) => {
                    // Don't leave a half-written payload behind.
                    let _ = fs::remove_file(entry.path());
                    drop(entry);
                    return Err(err)
                        .wrap_err_with(|| format!("transforming {}", rel.display()));
                }
            }
        }

        entry.seek_payload(0)?;
        if was_new {
            debug!(path = %rel.display(), "new entry");
            self.known_entries.fetch_add(1, Ordering::SeqCst);
        }
        Ok(Lookup::Cached(entry))
    }

    /// Create `rel`'s parent directories under the cache root, owner-only.
    fn ensure_parent_dirs(&self, rel: &Path) -> Result<()> {
        let mut dir = self.root.clone();
        if let Some(parent) = rel.parent() {
            for comp in parent.components() {
                dir.push(comp);
                match fs::create_dir(&dir) {
                    Ok(()) => fix_dir_perms(&dir)?,
                    Err(e) if e.kind() == io::ErrorKind::AlreadyExists => {}
                    Err(e) => {
                        return Err(e)
                            .wrap_err_with(|| format!("creating {}", dir.display()));
                    }
                }
            }
        }
        Ok(())
    }

    fn scrub(&self, tentative: bool) -> Result<bool> {
        if tentative {
            if let Some(max) = self.options.max_entries {
                let _pool = FileLock::acquire(&self.lockfile(), LockMode::Shared)?;
                // Strict <: under a tentative scrub an insertion is imminent.
                if self.known_entries.load(Ordering::SeqCst) < max {
                    return Ok(false);
                }
            }
        }
        info!(root = %self.root.display(), "scrubbing cache");

        let _pool = FileLock::acquire(&self.lockfile(), LockMode::Exclusive)?;
        let cutoff = self.options.max_age.map(|age| Timestamp::now() - age);
        let mut kept: Vec<(PathBuf, Timestamp)> = Vec::new();
        for path in find_files(&self.root) {
            let path = path?;
            let locked = LockedSource::open_exclusive(&path)?;
            let rel = path
                .strip_prefix(&self.root)
                .expect("walk yields paths under the root");
            if !self.source_root.join(rel).is_file() {
                // Original is gone; so is the entry.
                fs::remove_file(&path)?;
                continue;
            }
            let modified = locked.modified()?;
            if cutoff.map_or(false, |cutoff| modified < cutoff) {
                fs::remove_file(&path)?;
                continue;
            }
            drop(locked);
            kept.push((path, modified));
        }

        let mut count = kept.len();
        if let Some(max) = self.options.max_entries {
            // Post-hoc scrubs trim down to the bound; tentative scrubs go
            // one further to leave room for the insertion that triggered
            // them.
            let threshold = if tentative { max } else { max + 1 };
            if count >= threshold {
                kept.sort_by_key(|&(_, modified)| modified);
                let mut queue: VecDeque<(PathBuf, Timestamp)> = kept.into();
                while count > 0 && count >= threshold {
                    let Some((path, seen)) = queue.pop_front() else {
                        break;
                    };
                    let locked = LockedSource::open_exclusive(&path)?;
                    let modified = locked.modified()?;
                    if modified > seen {
                        // Touched since the sweep looked at it; requeue with
                        // the fresh time so the drain still terminates.
                        queue.push_back((path, modified));
                    } else {
                        fs::remove_file(&path)?;
                        count -= 1;
                    }
                }
            }
        }

        for dir in find_dirs(&self.root)? {
            // Fails while non-empty, which is exactly the behavior we want.
            let _ = fs::remove_dir(dir);
        }

        self.known_entries.store(count, Ordering::SeqCst);
        Ok(true)
    }
}

impl Drop for Cache {
    fn drop(&mut self) {
        if let Some(mut worker) = self.scrubber.take() {
            worker.finish();
            worker.join();
        }
    }
}

fn open_cache_file(path: &Path) -> io::Result<(File, bool)> {
    match OpenOptions::new().read(true).write(true).open(path) {
        Ok(file) => Ok((file, false)),
        Err(e) if e.kind() == io::ErrorKind::NotFound => {
            let file = OpenOptions::new()
                .read(true)
                .write(true)
                .create(true)
                .open(path)?;
            Ok((file, true))
        }
        Err(e) => Err(e),
    }
}

pub(crate) fn skip_dot_names(entry: &walkdir::DirEntry) -> bool {
    entry.depth() == 0 || !entry.file_name().to_string_lossy().starts_with('.')
}

/// Regular files under `root`, skipping dot-prefixed names and subtrees.
pub fn find_files(root: &Path) -> impl Iterator<Item = Result<PathBuf>> {
    WalkDir::new(root)
        .into_iter()
        .filter_entry(skip_dot_names)
        .filter_map(|result| match result {
            Ok(entry) if entry.file_type().is_file() => Some(Ok(entry.into_path())),
            Ok(_) => None,
            Err(e) => Some(Err(e.into())),
        })
}

/// Subdirectories of `root` with children before parents, skipping
/// dot-prefixed subtrees. (Reversed pre-order: every directory appears
/// before its ancestors, which is the order rmdir wants.)
pub fn find_dirs(root: &Path) -> Result<Vec<PathBuf>> {
    let mut dirs = Vec::new();
    for result in WalkDir::new(root).into_iter().filter_entry(skip_dot_names) {
        let entry = result?;
        if entry.file_type().is_dir() && entry.depth() > 0 {
            dirs.push(entry.into_path());
        }
    }
    dirs.reverse();
    Ok(dirs)
}
