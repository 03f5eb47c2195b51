use crate::cache::{skip_dot_names, Options};
use crate::detect::{self, SNIFF_LEN};
use crate::lock::{FileLock, LockMode};
use crate::prelude::*;
use crate::source::LockedSource;
use crate::util::{fix_file_perms, lock_unpoisoned};
use crate::vars::VarStore;
use encoding_rs_io::DecodeReaderBytesBuilder;
use indexmap::IndexMap;
use std::fs::File;
use std::io::{self, BufRead, BufReader, SeekFrom};
use std::sync::{Arc, Mutex};
use walkdir::WalkDir;

// Search over the source tree: a small filter algebra with canonical string
// forms, a scanner that doubles as the LATEST_MTIME tracker, and a cache
// from filter string to the sorted scan result. The cache doesn't watch
// individual files; any write anywhere in the source tree advances the
// tree's latest mtime and invalidates every stored result on next access.
// Coarse, but correct.

fn scrub_terms(query: &str, clean: impl Fn(String) -> String) -> Result<Vec<String>> {
    let mut terms: Vec<String> = query
        .split_whitespace()
        .map(|term| clean(term.to_lowercase()))
        .filter(|term| !term.is_empty())
        .collect();
    terms.sort();
    terms.dedup();
    if terms.is_empty() {
        bail!("no usable search terms in {query:?}");
    }
    Ok(terms)
}

/// Matches when any term is a substring of the lowercased relative path.
#[derive(Debug, Clone)]
pub struct PathFilter {
    terms: Vec<String>,
    key: String,
}

impl PathFilter {
    pub fn new(query: &str) -> Result<PathFilter> {
        let terms = scrub_terms(query, |term| {
            term.replace('/', std::path::MAIN_SEPARATOR_STR)
        })?;
        let key = format!("path={}", terms.join(" "));
        Ok(PathFilter { terms, key })
    }

    fn matches(&self, rel: &str) -> bool {
        let rel = rel.to_lowercase();
        self.terms.iter().any(|term| rel.contains(term.as_str()))
    }
}

/// Matches when every term occurs somewhere in the decoded text. Binary
/// files (no detectable encoding) never match.
#[derive(Debug, Clone)]
pub struct ContentFilter {
    terms: Vec<String>,
    key: String,
}

impl ContentFilter {
    pub fn new(query: &str) -> Result<ContentFilter> {
        let terms = scrub_terms(query, |term| term)?;
        let key = format!("content={}", terms.join(" "));
        Ok(ContentFilter { terms, key })
    }

    fn matches(&self, rel: &str, root: &Path) -> Result<bool> {
        let path = root.join(rel);
        let mut source = match LockedSource::open(&path) {
            Ok(source) => source,
            // Vanished between the walk and the lock; not a match, not an
            // error.
            Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(false),
            Err(e) => {
                return Err(e).wrap_err_with(|| format!("opening {}", path.display()))
            }
        };

        let mut head = vec![0u8; SNIFF_LEN];
        let mut filled = 0;
        while filled < head.len() {
            let n = source.handle().read(&mut head[filled..])?;
            if n == 0 {
                break;
            }
            filled += n;
        }
        head.truncate(filled);
        let Some(encoding) = detect::sniff(&head).encoding else {
            return Ok(false);
        };
        source.handle().seek(SeekFrom::Start(0))?;

        let decoded = DecodeReaderBytesBuilder::new()
            .encoding(Some(encoding))
            .build(source.handle());
        let mut seen = vec![false; self.terms.len()];
        let mut remaining = self.terms.len();
        for line in BufReader::new(decoded).lines() {
            let line = line?;
            for (i, term) in self.terms.iter().enumerate() {
                if !seen[i] && line.contains(term.as_str()) {
                    seen[i] = true;
                    remaining -= 1;
                }
            }
            if remaining == 0 {
                return Ok(true);
            }
        }
        Ok(false)
    }
}

/// Conjunction of non-compound filters.
#[derive(Debug, Clone)]
pub struct CompoundFilter {
    subfilters: Vec<Filter>,
    key: String,
}

impl CompoundFilter {
    pub fn new(subfilters: Vec<Filter>) -> Result<CompoundFilter> {
        if subfilters.is_empty() {
            bail!("compound filter needs at least one subfilter");
        }
        if subfilters
            .iter()
            .any(|f| matches!(f, Filter::Compound(_)))
        {
            bail!("compound filters do not nest");
        }
        let mut keys: Vec<&str> = subfilters.iter().map(|f| f.key()).collect();
        keys.sort();
        keys.dedup();
        let key = keys.join("\t");
        Ok(CompoundFilter { subfilters, key })
    }
}

#[derive(Debug, Clone)]
pub enum Filter {
    Path(PathFilter),
    Content(ContentFilter),
    Compound(CompoundFilter),
}

impl Filter {
    /// Canonical form; equal keys mean equal filters, and the search cache
    /// is keyed by exactly this string. Never starts with `=` (reserved for
    /// the date side of the store).
    pub fn key(&self) -> &str {
        match self {
            Filter::Path(f) => &f.key,
            Filter::Content(f) => &f.key,
            Filter::Compound(f) => &f.key,
        }
    }

    pub fn matches(&self, rel: &str, root: &Path) -> Result<bool> {
        match self {
            Filter::Path(f) => Ok(f.matches(rel)),
            Filter::Content(f) => f.matches(rel, root),
            Filter::Compound(f) => {
                for sub in &f.subfilters {
                    if !sub.matches(rel, root)? {
                        return Ok(false);
                    }
                }
                Ok(true)
            }
        }
    }

    /// Build the filter for a request carrying optional path terms and
    /// optional content terms.
    pub fn compose(path: Option<&str>, content: Option<&str>) -> Result<Option<Filter>> {
        let mut filters = Vec::new();
        if let Some(query) = path {
            filters.push(Filter::Path(PathFilter::new(query)?));
        }
        if let Some(query) = content {
            filters.push(Filter::Content(ContentFilter::new(query)?));
        }
        Ok(match filters.len() {
            0 => None,
            1 => filters.pop(),
            _ => Some(Filter::Compound(CompoundFilter::new(filters)?)),
        })
    }
}

impl Display for Filter {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.key())
    }
}

/// What a search yields per matching file. Snapshot taken under the file's
/// shared lock.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FileInfo {
    pub name: String,
    pub modified: Timestamp,
    pub size: u64,
}

type ScanFn = Box<dyn Fn(&Filter) -> Result<Vec<FileInfo>> + Send + Sync>;
type MtimeFn = Box<dyn Fn(bool) -> Result<Option<Timestamp>> + Send + Sync>;

#[derive(Debug, Default, Clone, Serialize, Deserialize)]
struct Db {
    /// filter key → sorted scan result.
    entries: IndexMap<String, Vec<FileInfo>>,
    /// filter key → when the result was last written or consumed. Exactly
    /// one date per entry; scrub drops orphans on either side.
    dates: IndexMap<String, Timestamp>,
}

enum Backend {
    Memory(Mutex<Db>),
    Persistent { path: PathBuf, lockfile: PathBuf },
}

impl Backend {
    /// One locked section. The persistent store is read-modify-replace
    /// under its file lock, so cooperating processes each see the previous
    /// writer's state.
    fn with<R>(&self, f: impl FnOnce(&mut Db) -> R) -> Result<R> {
        match self {
            Backend::Memory(db) => Ok(f(&mut lock_unpoisoned(db))),
            Backend::Persistent { path, lockfile } => {
                let _lock = FileLock::acquire(lockfile, LockMode::Exclusive)?;
                let mut db = load_db(path)?;
                let result = f(&mut db);
                store_db(path, &db)?;
                Ok(result)
            }
        }
    }
}

fn load_db(path: &Path) -> Result<Db> {
    match File::open(path) {
        Ok(file) => match ciborium::de::from_reader(BufReader::new(file)) {
            Ok(db) => Ok(db),
            Err(err) => {
                warn!(path = %path.display(), %err, "search db unreadable; resetting");
                Ok(Db::default())
            }
        },
        Err(err) if err.kind() == io::ErrorKind::NotFound => Ok(Db::default()),
        Err(err) => Err(err).wrap_err_with(|| format!("opening {}", path.display())),
    }
}

fn store_db(path: &Path, db: &Db) -> Result<()> {
    // unwrap rationale: the db path always has a parent (it lives inside the
    // cache directory).
    let dir = path.parent().unwrap();
    let mut tmp = tempfile::NamedTempFile::new_in(dir)?;
    ciborium::ser::into_writer(db, &mut tmp)?;
    tmp.as_file().sync_data()?;
    let file = tmp
        .persist(path)
        .wrap_err_with(|| format!("replacing {}", path.display()))?;
    fix_file_perms(&file)?;
    Ok(())
}

/// Cache of sorted scan results keyed by filter string, invalidated by the
/// source tree's latest mtime, bounded by TTL and entry count.
pub struct SearchCache {
    backend: Backend,
    scan: ScanFn,
    mtime: MtimeFn,
    options: Options,
}

impl SearchCache {
    pub fn in_memory(scan: ScanFn, mtime: MtimeFn, options: Options) -> Result<SearchCache> {
        Self::build(Backend::Memory(Mutex::new(Db::default())), scan, mtime, options)
    }

    pub fn persistent(
        path: &Path,
        scan: ScanFn,
        mtime: MtimeFn,
        options: Options,
    ) -> Result<SearchCache> {
        // unwrap rationale: the db path always has a parent and a file name
        // (it lives inside the cache directory).
        let lockfile = path
            .parent()
            .unwrap()
            .join(format!(".lock-{}", path.file_name().unwrap().to_string_lossy()));
        FileLock::ensure(&lockfile)?;
        Self::build(
            Backend::Persistent {
                path: path.to_path_buf(),
                lockfile,
            },
            scan,
            mtime,
            options,
        )
    }

    fn build(
        backend: Backend,
        scan: ScanFn,
        mtime: MtimeFn,
        options: Options,
    ) -> Result<SearchCache> {
        if let Some(max) = options.max_entries {
            if max < 2 {
                bail!("invalid maximum entry count: {max}");
            }
        }
        let cache = SearchCache {
            backend,
            scan,
            mtime,
            options,
        };
        cache.scrub(false)?;
        Ok(cache)
    }

    pub fn len(&self) -> Result<usize> {
        self.backend.with(|db| db.entries.len())
    }

    pub fn query(&self, filter: &Filter) -> Result<Vec<FileInfo>> {
        if self.options.auto_scrub && self.options.max_entries.is_some() {
            debug!(filter = %filter, "auto-scrub check before query");
            self.scrub(true)?;
        }

        let key = filter.key().to_owned();
        debug_assert!(!key.starts_with('='));
        let mtime = (self.mtime)(false)?;

        let stored = self.backend.with(|db| {
            let stored_ts = db.dates.get(&key).copied()?;
            // A null tree mtime means there is no invalidation signal; trust
            // the stored result. Otherwise the result is only good if it was
            // written/refreshed at or after the newest source write.
            if !mtime.map_or(true, |m| stored_ts >= m) {
                return None;
            }
            let value = db.entries.get(&key).cloned();
            if value.is_some() {
                db.dates.insert(key.clone(), Timestamp::now());
            }
            value
        })?;
        if let Some(result) = stored {
            debug!(filter = %filter, "returning cached search result");
            return Ok(result);
        }

        debug!(filter = %filter, "scanning");
        // Stamped before the scan: a source write landing mid-scan then
        // compares newer than this result and invalidates it.
        let new_ts = Timestamp::now();
        let content = (self.scan)(filter)?;

        self.backend.with(|db| {
            let other_updated = db.dates.get(&key).map_or(false, |&ts| ts > new_ts);
            if !other_updated {
                db.dates.insert(key.clone(), new_ts);
                db.entries.insert(key, content.clone());
            }
        })?;
        Ok(content)
    }

    pub fn scrub(&self, tentative: bool) -> Result<bool> {
        if tentative {
            if let Some(max) = self.options.max_entries {
                // Strict <: under a tentative scrub an insertion is imminent.
                if self.backend.with(|db| db.entries.len())? < max {
                    return Ok(false);
                }
            }
        }
        info!("scrubbing search cache");
        let mtime = (self.mtime)(true)?;
        let cutoff = self.options.max_age.map(|age| Timestamp::now() - age);
        let max_entries = self.options.max_entries;

        self.backend.with(|db| {
            let keys: Vec<String> = db.entries.keys().cloned().collect();
            for key in keys {
                let stale = match (db.dates.get(&key).copied(), mtime) {
                    // Orphan value with no date partner.
                    (None, _) => true,
                    // No files left in the source tree.
                    (Some(_), None) => true,
                    (Some(ts), Some(m)) if ts < m => true,
                    (Some(ts), _) => cutoff.map_or(false, |c| ts < c),
                };
                if stale {
                    db.entries.remove(&key);
                    db.dates.remove(&key);
                }
            }
            let Db { entries, dates } = db;
            dates.retain(|key, _| entries.contains_key(key));

            if let Some(max) = max_entries {
                let threshold = if tentative { max } else { max + 1 };
                if entries.len() >= threshold {
                    let mut aged: Vec<(String, Timestamp)> = entries
                        .keys()
                        .map(|key| {
                            let ts = dates
                                .get(key)
                                .copied()
                                .unwrap_or(Timestamp::new(i64::MIN, 0));
                            (key.clone(), ts)
                        })
                        .collect();
                    aged.sort_by(|a, b| a.1.cmp(&b.1));
                    let excess = entries.len() - (threshold - 1);
                    for (key, _) in aged.into_iter().take(excess) {
                        entries.remove(&key);
                        dates.remove(&key);
                    }
                }
            }
        })?;
        Ok(true)
    }
}

/// Source-tree scanner. Doubles as the keeper of LATEST_MTIME: every walk
/// grows the recorded value, and that value is the search cache's
/// invalidation signal.
pub struct Scanner {
    source_root: PathBuf,
    vars: Arc<VarStore>,
}

impl Scanner {
    pub fn new(source_root: &Path, vars: Arc<VarStore>) -> Scanner {
        Scanner {
            source_root: source_root.to_path_buf(),
            vars,
        }
    }

    pub fn source_root(&self) -> &Path {
        &self.source_root
    }

    /// Walk the source tree (skipping dot-prefixed names), apply the filter,
    /// and snapshot each match under its shared lock. The newest mtime seen
    /// is persisted as a side effect, even when the walk fails partway.
    pub fn filter_files(&self, filter: Option<&Filter>) -> Result<Vec<FileInfo>> {
        let mut latest = self.vars.latest_mtime();
        let mut found = Vec::new();
        let walked = (|| -> Result<()> {
            for result in WalkDir::new(&self.source_root)
                .into_iter()
                .filter_entry(skip_dot_names)
            {
                let entry = result?;
                let Ok(meta) = entry.metadata() else {
                    continue;
                };
                let modified = Timestamp::from_system_time(meta.modified()?);
                if latest.map_or(true, |l| modified > l) {
                    latest = Some(modified);
                }
                if !entry.file_type().is_file() {
                    continue;
                }
                let rel = entry
                    .path()
                    .strip_prefix(&self.source_root)
                    .expect("walk yields paths under the root");
                let rel = rel.to_string_lossy().into_owned();
                let matched = match filter {
                    None => true,
                    Some(f) => f.matches(&rel, &self.source_root)?,
                };
                if matched {
                    let Ok(source) = LockedSource::open(entry.path()) else {
                        continue;
                    };
                    let info = FileInfo {
                        name: rel,
                        modified: source.modified()?,
                        size: source.size()?,
                    };
                    if latest.map_or(true, |l| info.modified > l) {
                        latest = Some(info.modified);
                    }
                    found.push(info);
                }
            }
            Ok(())
        })();
        self.vars.set_latest_mtime(latest)?;
        walked?;
        Ok(found)
    }

    pub fn sorted_scan(&self, filter: &Filter) -> Result<Vec<FileInfo>> {
        let mut found = self.filter_files(Some(filter))?;
        found.sort_by(|a, b| a.name.cmp(&b.name));
        Ok(found)
    }

    /// The search cache's invalidation signal. With nothing recorded and no
    /// refresh requested this stays cheap (returns None); once a value
    /// exists, every call re-walks so that any write anywhere in the tree
    /// advances it. `refresh` forces the walk regardless. The walk here
    /// stats everything, dotfiles included.
    pub fn latest_mtime(&self, refresh: bool) -> Result<Option<Timestamp>> {
        let mut latest = self.vars.latest_mtime();
        if !refresh && latest.is_none() {
            return Ok(None);
        }
        for result in WalkDir::new(&self.source_root) {
            let Ok(entry) = result else {
                continue;
            };
            let Ok(meta) = entry.metadata() else {
                continue;
            };
            let modified = Timestamp::from_system_time(meta.modified()?);
            if latest.map_or(true, |l| modified > l) {
                latest = Some(modified);
            }
        }
        self.vars.set_latest_mtime(latest)?;
        Ok(latest)
    }
}

/// The search subsystem: a scanner plus, optionally, the persistent cache
/// over it.
pub struct Search {
    scanner: Arc<Scanner>,
    cache: Option<SearchCache>,
}

impl Search {
    pub fn new(
        source_root: &Path,
        vars: Arc<VarStore>,
        cache_config: Option<(PathBuf, Options)>,
    ) -> Result<Search> {
        let scanner = Arc::new(Scanner::new(source_root, vars));
        let cache = match cache_config {
            None => None,
            Some((path, options)) => {
                let scan_scanner = scanner.clone();
                let mtime_scanner = scanner.clone();
                Some(SearchCache::persistent(
                    &path,
                    Box::new(move |filter| scan_scanner.sorted_scan(filter)),
                    Box::new(move |refresh| mtime_scanner.latest_mtime(refresh)),
                    options,
                )?)
            }
        };
        Ok(Search { scanner, cache })
    }

    pub fn scrub(&self) -> Result<bool> {
        match &self.cache {
            Some(cache) => {
                cache.scrub(false)?;
                Ok(true)
            }
            None => Ok(false),
        }
    }

    /// Page `[start, end)` of the sorted matches, plus whether pages exist
    /// before/after.
    pub fn find_by_path(
        &self,
        start: usize,
        end: usize,
        filter: Option<&Filter>,
    ) -> Result<(Vec<FileInfo>, bool, bool)> {
        let all = match (filter, &self.cache) {
            (Some(filter), Some(cache)) => cache.query(filter)?,
            (filter, _) => {
                debug!("searching without the cache");
                let mut found = self.scanner.filter_files(filter)?;
                found.sort_by(|a, b| a.name.cmp(&b.name));
                found
            }
        };
        let total = all.len();
        let slice: Vec<FileInfo> = all
            .into_iter()
            .skip(start)
            .take(end.saturating_sub(start))
            .collect();
        Ok((slice, start > 0, end < total.saturating_sub(1)))
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::thread;
    use std::time::Duration;

    #[test]
    fn test_scrub_terms() {
        assert_eq!(
            scrub_terms("\nFoo  bar\t", |t| t).unwrap(),
            ["bar", "foo"]
        );
        assert!(scrub_terms("   ", |t| t).is_err());
    }

    #[test]
    fn test_path_filter_matches() {
        let f = PathFilter::new("foo bAr").unwrap();
        assert!(f.matches("./foo/bar"));
        assert!(f.matches("Bar/foo"));
        assert!(f.matches("fOo"));
        assert!(f.matches("baR"));
        assert!(!f.matches("baz"));
    }

    #[test]
    fn test_canonical_keys() {
        // Same unique lowercased term set, same key.
        let a = PathFilter::new("Foo bar foo").unwrap();
        let b = PathFilter::new("BAR\tfoo").unwrap();
        assert_eq!(a.key, b.key);
        assert_eq!(a.key, "path=bar foo");

        let c = ContentFilter::new("needle").unwrap();
        assert_eq!(c.key, "content=needle");

        let compound = CompoundFilter::new(vec![
            Filter::Content(c),
            Filter::Path(a),
        ])
        .unwrap();
        assert_eq!(compound.key, "content=needle\tpath=bar foo");
        assert!(!compound.key.starts_with('='));
    }

    #[test]
    fn test_compound_rejects_nesting() {
        let path = Filter::Path(PathFilter::new("a").unwrap());
        let inner = CompoundFilter::new(vec![path.clone()]).unwrap();
        assert!(CompoundFilter::new(vec![Filter::Compound(inner), path]).is_err());
        assert!(CompoundFilter::new(vec![]).is_err());
    }

    #[test]
    fn test_content_filter() {
        let tmp = tempfile::tempdir().unwrap();
        std::fs::write(tmp.path().join("text.txt"), "first line\nneedle here\n").unwrap();
        std::fs::write(tmp.path().join("blob.bin"), b"needle\x00binary").unwrap();

        let f = ContentFilter::new("needle").unwrap();
        assert!(f.matches("text.txt", tmp.path()).unwrap());
        assert!(!f.matches("blob.bin", tmp.path()).unwrap());
        assert!(!f.matches("missing.txt", tmp.path()).unwrap());

        let all_terms = ContentFilter::new("needle first").unwrap();
        assert!(all_terms.matches("text.txt", tmp.path()).unwrap());
        let not_all = ContentFilter::new("needle absent").unwrap();
        assert!(!not_all.matches("text.txt", tmp.path()).unwrap());
    }

    const FILES: &[&str] = &["foo", "bar", "baz", "x/y/z", "x/y/a", "x/a/z", "1/4/6/12"];

    struct MockState {
        count: AtomicUsize,
        mtime: Mutex<Option<Timestamp>>,
    }

    fn mock_cache(
        state: &Arc<MockState>,
        options: Options,
    ) -> SearchCache {
        let scan_state = state.clone();
        let mtime_state = state.clone();
        SearchCache::in_memory(
            Box::new(move |filter| {
                scan_state.count.fetch_add(1, Ordering::SeqCst);
                let mut names: Vec<FileInfo> = FILES
                    .iter()
                    .filter(|name| filter.matches(name, Path::new("/")).unwrap())
                    .map(|name| FileInfo {
                        name: (*name).to_owned(),
                        modified: Timestamp::new(0, 0),
                        size: 0,
                    })
                    .collect();
                names.sort_by(|a, b| a.name.cmp(&b.name));
                Ok(names)
            }),
            Box::new(move |_refresh| Ok(*lock_unpoisoned(&mtime_state.mtime))),
            options,
        )
        .unwrap()
    }

    fn new_state() -> Arc<MockState> {
        Arc::new(MockState {
            count: AtomicUsize::new(0),
            mtime: Mutex::new(Some(Timestamp::now())),
        })
    }

    fn names(results: &[FileInfo]) -> Vec<&str> {
        results.iter().map(|info| info.name.as_str()).collect()
    }

    #[test]
    fn test_query_miss_then_hit() {
        let state = new_state();
        let cache = mock_cache(&state, Options::default());
        let filter = Filter::Path(PathFilter::new("a").unwrap());

        let results = cache.query(&filter).unwrap();
        assert_eq!(names(&results), ["bar", "baz", "x/a/z", "x/y/a"]);
        assert_eq!(state.count.load(Ordering::SeqCst), 1);
        assert_eq!(cache.len().unwrap(), 1);

        let results = cache.query(&filter).unwrap();
        assert_eq!(names(&results), ["bar", "baz", "x/a/z", "x/y/a"]);
        assert_eq!(state.count.load(Ordering::SeqCst), 1);
        assert_eq!(cache.len().unwrap(), 1);
    }

    #[test]
    fn test_query_distinct_filters_scan_separately() {
        let state = new_state();
        let cache = mock_cache(&state, Options::default());

        let a = Filter::Path(PathFilter::new("a").unwrap());
        cache.query(&a).unwrap();
        assert_eq!(state.count.load(Ordering::SeqCst), 1);

        let slash = Filter::Path(PathFilter::new("/").unwrap());
        let results = cache.query(&slash).unwrap();
        assert_eq!(names(&results), ["1/4/6/12", "x/a/z", "x/y/a", "x/y/z"]);
        assert_eq!(state.count.load(Ordering::SeqCst), 2);
        assert_eq!(cache.len().unwrap(), 2);
    }

    #[test]
    fn test_advancing_mtime_invalidates() {
        let state = new_state();
        let cache = mock_cache(&state, Options::default());
        let filter = Filter::Path(PathFilter::new("a").unwrap());

        cache.query(&filter).unwrap();
        assert_eq!(state.count.load(Ordering::SeqCst), 1);

        thread::sleep(Duration::from_millis(500));
        *lock_unpoisoned(&state.mtime) = Some(Timestamp::now());

        let results = cache.query(&filter).unwrap();
        assert_eq!(names(&results), ["bar", "baz", "x/a/z", "x/y/a"]);
        assert_eq!(state.count.load(Ordering::SeqCst), 2);

        cache.query(&filter).unwrap();
        assert_eq!(state.count.load(Ordering::SeqCst), 2);
    }

    #[test]
    fn test_advancing_mtime_then_scrub_drops_entry() {
        let state = new_state();
        let cache = mock_cache(&state, Options::default());
        let filter = Filter::Path(PathFilter::new("a").unwrap());

        cache.query(&filter).unwrap();
        assert_eq!(state.count.load(Ordering::SeqCst), 1);

        thread::sleep(Duration::from_millis(500));
        *lock_unpoisoned(&state.mtime) = Some(Timestamp::now());
        cache.scrub(false).unwrap();
        assert_eq!(cache.len().unwrap(), 0);

        cache.query(&filter).unwrap();
        assert_eq!(state.count.load(Ordering::SeqCst), 2);
    }

    #[test]
    fn test_null_mtime_trusts_stored_result_but_scrub_clears() {
        let state = new_state();
        let cache = mock_cache(&state, Options::default());
        let filter = Filter::Path(PathFilter::new("a").unwrap());

        cache.query(&filter).unwrap();
        assert_eq!(state.count.load(Ordering::SeqCst), 1);

        // No invalidation signal: queries keep the stored result...
        *lock_unpoisoned(&state.mtime) = None;
        cache.query(&filter).unwrap();
        assert_eq!(state.count.load(Ordering::SeqCst), 1);

        // ...but a scrub treats "no mtime" as "no files" and clears.
        cache.scrub(false).unwrap();
        assert_eq!(cache.len().unwrap(), 0);
        cache.query(&filter).unwrap();
        assert_eq!(state.count.load(Ordering::SeqCst), 2);
    }

    #[test]
    fn test_ttl_expiry() {
        let state = new_state();
        let cache = mock_cache(
            &state,
            Options {
                max_age: Some(Duration::from_secs(1)),
                ..Default::default()
            },
        );
        let filter = Filter::Path(PathFilter::new("a").unwrap());

        cache.query(&filter).unwrap();
        assert_eq!(state.count.load(Ordering::SeqCst), 1);

        thread::sleep(Duration::from_millis(1500));
        cache.scrub(false).unwrap();
        assert_eq!(cache.len().unwrap(), 0);

        cache.query(&filter).unwrap();
        assert_eq!(state.count.load(Ordering::SeqCst), 2);
    }

    #[test]
    fn test_lru_eviction() {
        let state = new_state();
        let cache = mock_cache(
            &state,
            Options {
                max_entries: Some(2),
                ..Default::default()
            },
        );

        for (i, terms) in ["a", "b", "c"].into_iter().enumerate() {
            let filter = Filter::Path(PathFilter::new(terms).unwrap());
            cache.query(&filter).unwrap();
            assert_eq!(state.count.load(Ordering::SeqCst), i + 1);
            thread::sleep(Duration::from_millis(50));
        }
        assert_eq!(cache.len().unwrap(), 3);

        // Post-hoc scrub trims to the bound, oldest first.
        cache.scrub(false).unwrap();
        assert_eq!(cache.len().unwrap(), 2);

        let oldest = Filter::Path(PathFilter::new("a").unwrap());
        cache.query(&oldest).unwrap();
        assert_eq!(state.count.load(Ordering::SeqCst), 4);
    }

    #[test]
    fn test_auto_scrub_on_query() {
        let state = new_state();
        let cache = mock_cache(
            &state,
            Options {
                max_entries: Some(2),
                auto_scrub: true,
                ..Default::default()
            },
        );

        for terms in ["a", "b", "c"] {
            let filter = Filter::Path(PathFilter::new(terms).unwrap());
            cache.query(&filter).unwrap();
            thread::sleep(Duration::from_millis(50));
        }
        assert_eq!(state.count.load(Ordering::SeqCst), 3);
        assert!(cache.len().unwrap() <= 2);

        let evicted = Filter::Path(PathFilter::new("a").unwrap());
        cache.query(&evicted).unwrap();
        assert_eq!(state.count.load(Ordering::SeqCst), 4);
    }

    #[test]
    fn test_persistent_backend_roundtrip() {
        let tmp = tempfile::tempdir().unwrap();
        let db_path = tmp.path().join("search");
        let filter = Filter::Path(PathFilter::new("a").unwrap());
        let fixed_mtime = Timestamp::now();

        let state = new_state();
        *lock_unpoisoned(&state.mtime) = Some(fixed_mtime);
        let make = |state: &Arc<MockState>| {
            let scan_state = state.clone();
            let mtime_state = state.clone();
            SearchCache::persistent(
                &db_path,
                Box::new(move |_f| {
                    scan_state.count.fetch_add(1, Ordering::SeqCst);
                    Ok(vec![FileInfo {
                        name: "bar".to_owned(),
                        modified: Timestamp::new(0, 0),
                        size: 3,
                    }])
                }),
                Box::new(move |_refresh| Ok(*lock_unpoisoned(&mtime_state.mtime))),
                Options::default(),
            )
            .unwrap()
        };

        let cache = make(&state);
        assert_eq!(names(&cache.query(&filter).unwrap()), ["bar"]);
        assert_eq!(state.count.load(Ordering::SeqCst), 1);
        drop(cache);
        assert!(tmp.path().join(".lock-search").is_file());

        // A second instance on the same file sees the stored result.
        let cache = make(&state);
        assert_eq!(names(&cache.query(&filter).unwrap()), ["bar"]);
        assert_eq!(state.count.load(Ordering::SeqCst), 1);
    }

    fn write_tree(root: &Path, files: &[&str]) {
        for name in files {
            let path = root.join(name);
            std::fs::create_dir_all(path.parent().unwrap()).unwrap();
            std::fs::write(path, format!("contents of {name}\n")).unwrap();
        }
    }

    #[test]
    fn test_scanner_tracks_latest_mtime() {
        let tmp = tempfile::tempdir().unwrap();
        write_tree(tmp.path(), FILES);
        let vars = Arc::new(VarStore::open(&tmp.path().join("runtime-vars")).unwrap());
        let scanner = Scanner::new(tmp.path(), vars.clone());

        assert_eq!(scanner.latest_mtime(false).unwrap(), None);
        let forced = scanner.latest_mtime(true).unwrap();
        assert!(forced.is_some());
        assert_eq!(vars.latest_mtime(), forced);
        assert_eq!(scanner.latest_mtime(false).unwrap(), forced);
    }

    #[test]
    fn test_scanner_filter_files() {
        let tmp = tempfile::tempdir().unwrap();
        write_tree(tmp.path(), FILES);
        std::fs::write(tmp.path().join(".hidden"), "skip me").unwrap();
        let vars = Arc::new(VarStore::open(&tmp.path().join("runtime-vars")).unwrap());
        let scanner = Scanner::new(tmp.path(), vars.clone());

        let filter = Filter::Path(PathFilter::new("a").unwrap());
        let found = scanner.sorted_scan(&filter).unwrap();
        assert_eq!(names(&found), ["bar", "baz", "x/a/z", "x/y/a"]);
        for info in &found {
            assert!(info.size > 0);
        }
        assert!(vars.latest_mtime().is_some());
    }

    #[test]
    fn test_find_by_path_pagination() {
        let tmp = tempfile::tempdir().unwrap();
        write_tree(tmp.path(), FILES);
        let vars = Arc::new(VarStore::open(&tmp.path().join("vars")).unwrap());
        let search = Search::new(tmp.path(), vars, None).unwrap();

        let (all, has_prev, has_more) = search.find_by_path(0, 100, None).unwrap();
        assert_eq!(
            names(&all),
            ["1/4/6/12", "bar", "baz", "foo", "x/a/z", "x/y/a", "x/y/z"]
        );
        assert!(!has_prev);
        assert!(!has_more);

        let (page, has_prev, has_more) = search.find_by_path(2, 4, None).unwrap();
        assert_eq!(names(&page), ["baz", "foo"]);
        assert!(has_prev);
        assert!(has_more);
    }

    #[test]
    fn test_search_with_cache_invalidates_on_write() {
        let tmp = tempfile::tempdir().unwrap();
        let source = tmp.path().join("source");
        std::fs::create_dir(&source).unwrap();
        write_tree(&source, FILES);
        let cache_dir = tmp.path().join("cache");
        std::fs::create_dir(&cache_dir).unwrap();
        let vars = Arc::new(VarStore::open(&cache_dir.join("runtime-vars")).unwrap());
        let search = Search::new(
            &source,
            vars,
            Some((cache_dir.join("search"), Options::default())),
        )
        .unwrap();

        let filter = Filter::Path(PathFilter::new("a").unwrap());
        let (found, _, _) = search.find_by_path(0, 100, Some(&filter)).unwrap();
        assert_eq!(names(&found), ["bar", "baz", "x/a/z", "x/y/a"]);

        // A new matching file appears; the next query must see it.
        thread::sleep(Duration::from_millis(50));
        std::fs::write(source.join("aaa"), "fresh\n").unwrap();
        let (found, _, _) = search.find_by_path(0, 100, Some(&filter)).unwrap();
        assert_eq!(names(&found), ["aaa", "bar", "baz", "x/a/z", "x/y/a"]);
    }
}
