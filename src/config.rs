use crate::cache::Options;
use crate::checksum::{self, Algorithm};
use crate::prelude::*;
use crate::process::{self, Processor, Router};
use std::collections::BTreeMap;
use std::fs;
use std::sync::Arc;
use std::time::Duration;

// Configuration file handling. The schema mirrors what the server needs at
// startup; durations come in as whole seconds.
//
//   source-dir = "pages"
//   cache-dir = "cache"
//   checksum = "sha256"
//   max-age = 86400
//   max-entries = 2048
//   auto-scrub = true
//   dispatcher-thread = true
//   worker-threads = 4
//   preview-lines = 10
//   send-etags = true
//
//   [search]
//   cache = true
//   max-age = 3600
//   max-entries = 64
//
//   [extensions]
//   "" = "copy"
//   ".txt" = "copy"

#[derive(Debug, Deserialize)]
#[serde(rename_all = "kebab-case", deny_unknown_fields)]
struct RawConfig {
    source_dir: PathBuf,
    cache_dir: PathBuf,
    #[serde(default = "default_checksum")]
    checksum: String,
    max_age: Option<u64>,
    max_entries: Option<usize>,
    #[serde(default)]
    auto_scrub: bool,
    #[serde(default)]
    dispatcher_thread: bool,
    #[serde(default = "default_worker_threads")]
    worker_threads: usize,
    preview_lines: Option<u32>,
    #[serde(default = "default_true")]
    send_etags: bool,
    #[serde(default)]
    search: RawSearch,
    #[serde(default)]
    extensions: BTreeMap<String, String>,
}

#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "kebab-case", deny_unknown_fields)]
struct RawSearch {
    #[serde(default)]
    cache: bool,
    max_age: Option<u64>,
    max_entries: Option<usize>,
    #[serde(default)]
    auto_scrub: bool,
}

fn default_checksum() -> String {
    "sha256".to_owned()
}

fn default_worker_threads() -> usize {
    4
}

fn default_true() -> bool {
    true
}

pub struct Config {
    pub source_dir: PathBuf,
    pub cache_dir: PathBuf,
    pub checksum: Algorithm,
    pub cache_options: Options,
    pub dispatcher_thread: bool,
    pub worker_threads: usize,
    /// None disables the preview cache.
    pub preview_lines: Option<u32>,
    pub send_etags: bool,
    pub search_cache: bool,
    pub search_options: Options,
    pub router: Arc<Router>,
}

pub fn load(path: &Path) -> Result<Config> {
    let text = fs::read_to_string(path)
        .wrap_err_with(|| format!("reading configuration {}", path.display()))?;
    let doc = text
        .parse::<toml_edit::Document>()
        .wrap_err_with(|| format!("parsing configuration {}", path.display()))?;
    let raw: RawConfig = toml_edit::de::from_item(doc.as_item().clone())
        .wrap_err_with(|| format!("interpreting configuration {}", path.display()))?;
    resolve(raw)
}

fn seconds(field: &str, value: Option<u64>) -> Result<Option<Duration>> {
    match value {
        Some(0) => bail!("{field} must be a positive number of seconds"),
        Some(n) => Ok(Some(Duration::from_secs(n))),
        None => Ok(None),
    }
}

fn resolve(raw: RawConfig) -> Result<Config> {
    if raw.worker_threads == 0 {
        bail!("worker-threads must be positive");
    }
    let checksum = checksum::lookup(&raw.checksum)?;

    let mut routes: Vec<(String, Arc<dyn Processor>)> = Vec::new();
    let mut default: Option<Arc<dyn Processor>> = None;
    for (extension, name) in &raw.extensions {
        let processor = process::lookup(name)?;
        if extension.is_empty() {
            default = Some(processor);
        } else {
            routes.push((extension.clone(), processor));
        }
    }
    let default = match default {
        Some(processor) => processor,
        None => {
            warn!("no transformer configured for unmatched extensions; using copy");
            process::lookup("copy")?
        }
    };

    Ok(Config {
        source_dir: raw.source_dir,
        cache_dir: raw.cache_dir,
        checksum,
        cache_options: Options {
            max_age: seconds("max-age", raw.max_age)?,
            max_entries: raw.max_entries,
            auto_scrub: raw.auto_scrub,
        },
        dispatcher_thread: raw.dispatcher_thread,
        worker_threads: raw.worker_threads,
        preview_lines: raw.preview_lines.filter(|&lines| lines > 0),
        send_etags: raw.send_etags,
        search_cache: raw.search.cache,
        search_options: Options {
            max_age: seconds("search.max-age", raw.search.max_age)?,
            max_entries: raw.search.max_entries,
            auto_scrub: raw.search.auto_scrub,
        },
        router: Arc::new(Router::new(routes, default)),
    })
}
