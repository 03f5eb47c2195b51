use crate::cache::{Cache, Lookup, ScrubMode};
use crate::config::Config;
use crate::header::EntryHeader;
use crate::prelude::*;
use crate::process::{
    read_content_header, sniff_input, write_content_header, ContentHeader, Input, Processor,
};
use crate::search::{Filter, FileInfo, Search};
use crate::util::fix_dir_perms;
use crate::vars::VarStore;
use crate::worker::{StreamJob, WorkerPool};
use data_encoding::HEXLOWER;
use encoding_rs::Encoding;
use encoding_rs_io::DecodeReaderBytesBuilder;
use std::fs;
use std::io::{self, BufRead, BufReader};
use std::sync::Arc;

// The server ties the subsystems together: the document cache (extension-
// routed transformers), the optional preview cache (first N lines of each
// document), search with its optional persistent cache, a worker pool for
// streaming bypass transforms, and the runtime-variable store they share.
// The request-handling layer owns a Server reference and calls lookup /
// find / get_preview; nothing here touches sockets.

const DOCUMENT_SUBDIR: &str = "document";
const PREVIEW_SUBDIR: &str = "preview";
const SEARCH_DB: &str = "search";
const VARS_FILE: &str = "runtime-vars";

/// Preview transformer: content header plus the first N decoded lines,
/// re-encoded in the detected encoding's output form. Binary documents have
/// no preview.
struct DocHead {
    lines: u32,
}

impl Processor for DocHead {
    fn process(
        &self,
        input: &mut Input<'_>,
        output: &mut dyn Write,
        _cached: bool,
    ) -> Result<(), ProcessError> {
        let (detected, _) = sniff_input(input)?;
        let Some(encoding) = detected.encoding else {
            return Err(ProcessError::Unsupported);
        };
        let out_encoding = encoding.output_encoding();
        write_content_header(
            output,
            &ContentHeader {
                encoding: Some(out_encoding.name().to_owned()),
                mime: detected.mime.to_string(),
            },
        )?;
        let decoded = DecodeReaderBytesBuilder::new()
            .encoding(Some(encoding))
            .build(&mut *input);
        let mut reader = BufReader::new(decoded);
        let mut line = String::new();
        for _ in 0..self.lines {
            line.clear();
            if reader.read_line(&mut line)? == 0 {
                break;
            }
            let (bytes, _, _) = out_encoding.encode(&line);
            output.write_all(&bytes)?;
        }
        Ok(())
    }
}

pub struct Server {
    vars: Arc<VarStore>,
    document: Cache,
    preview: Option<Cache>,
    search: Search,
    workers: WorkerPool,
    send_etags: bool,
}

impl Server {
    pub fn new(config: &Config) -> Result<Server> {
        fs::create_dir_all(&config.cache_dir)
            .wrap_err_with(|| format!("creating {}", config.cache_dir.display()))?;
        fix_dir_perms(&config.cache_dir)?;
        let vars = Arc::new(VarStore::open(&config.cache_dir.join(VARS_FILE))?);

        let preview_root = config.cache_dir.join(PREVIEW_SUBDIR);
        if let Some(lines) = config.preview_lines {
            if vars.preview_lines() != Some(lines) {
                // The stored payloads were built for a different line count;
                // they are all wrong now.
                info!(lines, "preview line count changed; resetting preview cache");
                match fs::remove_dir_all(&preview_root) {
                    Ok(()) => {}
                    Err(e) if e.kind() == io::ErrorKind::NotFound => {}
                    Err(e) => {
                        return Err(e)
                            .wrap_err_with(|| format!("removing {}", preview_root.display()));
                    }
                }
                vars.set_preview_lines(Some(lines))?;
            }
        }

        let scrub_mode = if config.dispatcher_thread {
            ScrubMode::Dispatched
        } else {
            ScrubMode::Inline
        };
        let document = Cache::new(
            &config.cache_dir.join(DOCUMENT_SUBDIR),
            &config.source_dir,
            config.checksum,
            config.router.clone(),
            config.cache_options.clone(),
            scrub_mode,
        )?;
        let preview = match config.preview_lines {
            Some(lines) => Some(Cache::new(
                &preview_root,
                &config.source_dir,
                config.checksum,
                Arc::new(DocHead { lines }),
                config.cache_options.clone(),
                scrub_mode,
            )?),
            None => None,
        };

        let search_config = config
            .search_cache
            .then(|| (config.cache_dir.join(SEARCH_DB), config.search_options.clone()));
        let search = Search::new(&config.source_dir, vars.clone(), search_config)?;

        Ok(Server {
            vars,
            document,
            preview,
            search,
            workers: WorkerPool::new(config.worker_threads),
            send_etags: config.send_etags,
        })
    }

    pub fn source_root(&self) -> &Path {
        self.document.source_root()
    }

    /// Transformed representation of one document.
    pub fn lookup(&self, path: &str) -> Result<Lookup> {
        self.document.lookup(path)
    }

    /// Page of the (optionally filtered) sorted file listing.
    pub fn search(
        &self,
        start: usize,
        end: usize,
        filter: Option<&Filter>,
    ) -> Result<(Vec<FileInfo>, bool, bool)> {
        self.search.find_by_path(start, end, filter)
    }

    /// Run a bypass transform on the worker pool, readable from the
    /// returned stream.
    pub fn stream(&self, auto: crate::cache::AutoProcess) -> io::Result<StreamJob> {
        self.workers
            .stream(move |out| auto.run(out).map_err(eyre::Report::from))
    }

    /// The first preview-lines of the document as decoded text, or None if
    /// previews are disabled or the document has no text preview.
    pub fn get_preview(&self, path: &str) -> Result<Option<String>> {
        let Some(preview) = &self.preview else {
            return Ok(None);
        };
        debug!(path, "fetching preview");
        match preview.lookup(path)? {
            Lookup::Cached(mut entry) => Ok(read_preview_text(&mut entry)),
            Lookup::Bypass(auto) => {
                let mut stream = self.stream(auto)?;
                let text = read_preview_text(&mut stream);
                stream.finish()?;
                Ok(text)
            }
        }
    }

    /// Entity-tag for a header, if etags are enabled and a checksum exists.
    pub fn etag(&self, header: &EntryHeader) -> Option<String> {
        if !self.send_etags || header.checksum().is_empty() {
            return None;
        }
        Some(format!("\"{}\"", HEXLOWER.encode(header.checksum())))
    }

    /// Scrub every cache this server owns, synchronously.
    pub fn scrub(&self) -> Result<()> {
        self.document.scrub(false)?;
        if let Some(preview) = &self.preview {
            preview.scrub(false)?;
        }
        self.search.scrub()?;
        Ok(())
    }

    pub fn vars(&self) -> &VarStore {
        &self.vars
    }

    pub fn close(mut self) {
        self.workers.finish();
        self.workers.join();
        if let Some(preview) = self.preview.take() {
            preview.close();
        }
    }
}

fn read_preview_text(reader: &mut impl Read) -> Option<String> {
    // A header-only entry (no preview available) shows up here as a
    // truncated content header; that's a normal "no preview" answer.
    let header = read_content_header(reader).ok()?;
    let encoding = Encoding::for_label(header.encoding?.as_bytes())?;
    let mut bytes = Vec::new();
    reader.read_to_end(&mut bytes).ok()?;
    let (text, _, _) = encoding.decode(&bytes);
    Some(text.into_owned())
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::cache::Options;
    use crate::checksum;
    use crate::process::Router;
    use crate::search::PathFilter;

    struct Fixture {
        source: tempfile::TempDir,
        cache_dir: tempfile::TempDir,
    }

    impl Fixture {
        fn new() -> Fixture {
            Fixture {
                source: tempfile::tempdir().unwrap(),
                cache_dir: tempfile::tempdir().unwrap(),
            }
        }

        fn write(&self, rel: &str, contents: &[u8]) {
            let path = self.source.path().join(rel);
            if let Some(parent) = path.parent() {
                fs::create_dir_all(parent).unwrap();
            }
            fs::write(path, contents).unwrap();
        }

        fn config(&self) -> Config {
            Config {
                source_dir: self.source.path().to_path_buf(),
                cache_dir: self.cache_dir.path().to_path_buf(),
                checksum: checksum::SHA256,
                cache_options: Options::default(),
                dispatcher_thread: false,
                worker_threads: 2,
                preview_lines: Some(2),
                send_etags: true,
                search_cache: true,
                search_options: Options::default(),
                router: Arc::new(Router::new(
                    vec![(
                        ".txt".to_owned(),
                        crate::process::lookup("copy").unwrap(),
                    )],
                    crate::process::lookup("copy").unwrap(),
                )),
            }
        }
    }

    fn read_document(server: &Server, path: &str) -> (ContentHeader, Vec<u8>) {
        match server.lookup(path).unwrap() {
            Lookup::Cached(mut entry) => {
                let header = read_content_header(&mut entry).unwrap();
                let mut body = Vec::new();
                entry.read_to_end(&mut body).unwrap();
                (header, body)
            }
            Lookup::Bypass(auto) => {
                let mut stream = server.stream(auto).unwrap();
                let header = read_content_header(&mut stream).unwrap();
                let mut body = Vec::new();
                stream.read_to_end(&mut body).unwrap();
                stream.finish().unwrap();
                (header, body)
            }
        }
    }

    #[test]
    fn test_text_document_roundtrip() {
        let fx = Fixture::new();
        fx.write("page.txt", b"hello wiki\nsecond line\n");
        let server = Server::new(&fx.config()).unwrap();

        let (header, body) = read_document(&server, "page.txt");
        assert_eq!(header.encoding.as_deref(), Some("UTF-8"));
        assert_eq!(header.mime, "text/plain");
        assert_eq!(body, b"hello wiki\nsecond line\n");

        // Cached layout mirrors the source under document/.
        assert!(fx
            .cache_dir
            .path()
            .join("document/page.txt")
            .is_file());
        server.close();
    }

    #[test]
    fn test_binary_document_streams_through() {
        let fx = Fixture::new();
        fx.write("blob.bin", b"\x00\x01\x02\x03");
        let server = Server::new(&fx.config()).unwrap();

        for _ in 0..2 {
            let (header, body) = read_document(&server, "blob.bin");
            assert_eq!(header.encoding, None);
            assert_eq!(body, b"\x00\x01\x02\x03");
        }
        server.close();
    }

    #[test]
    fn test_preview_truncates_to_configured_lines() {
        let fx = Fixture::new();
        fx.write("page.txt", b"one\ntwo\nthree\nfour\n");
        let server = Server::new(&fx.config()).unwrap();

        let preview = server.get_preview("page.txt").unwrap().unwrap();
        assert_eq!(preview, "one\ntwo\n");
        server.close();
    }

    #[test]
    fn test_preview_of_binary_is_none() {
        let fx = Fixture::new();
        fx.write("blob.bin", b"\x00\x01\x02");
        let server = Server::new(&fx.config()).unwrap();
        assert_eq!(server.get_preview("blob.bin").unwrap(), None);
        server.close();
    }

    #[test]
    fn test_preview_disabled() {
        let fx = Fixture::new();
        fx.write("page.txt", b"one\n");
        let mut config = fx.config();
        config.preview_lines = None;
        let server = Server::new(&config).unwrap();
        assert_eq!(server.get_preview("page.txt").unwrap(), None);
        assert!(!fx.cache_dir.path().join(PREVIEW_SUBDIR).exists());
        server.close();
    }

    #[test]
    fn test_preview_lines_change_resets_cache() {
        let fx = Fixture::new();
        fx.write("page.txt", b"one\ntwo\nthree\n");

        let server = Server::new(&fx.config()).unwrap();
        assert_eq!(
            server.get_preview("page.txt").unwrap().unwrap(),
            "one\ntwo\n"
        );
        server.close();
        let marker = fx.cache_dir.path().join("preview/page.txt");
        assert!(marker.is_file());

        // Same value: the cached entry survives.
        let server = Server::new(&fx.config()).unwrap();
        assert!(marker.is_file());
        server.close();

        // New value: the subtree is wiped and rebuilt with the new count.
        let mut config = fx.config();
        config.preview_lines = Some(1);
        let server = Server::new(&config).unwrap();
        assert_eq!(server.get_preview("page.txt").unwrap().unwrap(), "one\n");
        server.close();
    }

    #[test]
    fn test_find_with_filter_and_preview() {
        let fx = Fixture::new();
        fx.write("notes/alpha.txt", b"alpha doc\n");
        fx.write("notes/beta.txt", b"beta doc\n");
        fx.write("other.txt", b"other\n");
        let server = Server::new(&fx.config()).unwrap();

        let filter = Filter::Path(PathFilter::new("notes").unwrap());
        let (files, has_prev, _) = server.search(0, 100, Some(&filter)).unwrap();
        let names: Vec<_> = files.iter().map(|f| f.name.as_str()).collect();
        assert_eq!(names, ["notes/alpha.txt", "notes/beta.txt"]);
        assert!(!has_prev);

        assert_eq!(
            server.get_preview("notes/alpha.txt").unwrap().unwrap(),
            "alpha doc\n"
        );
        server.close();
    }

    #[test]
    fn test_etag() {
        let fx = Fixture::new();
        fx.write("page.txt", b"hello\n");
        let server = Server::new(&fx.config()).unwrap();

        let Lookup::Cached(entry) = server.lookup("page.txt").unwrap() else {
            panic!("expected a cached entry");
        };
        let etag = server.etag(entry.header().unwrap()).unwrap();
        assert!(etag.starts_with('"') && etag.ends_with('"'));
        assert_eq!(etag.len(), 2 + 64);
        server.close();
    }

    #[test]
    fn test_scrub_everything() {
        let fx = Fixture::new();
        fx.write("page.txt", b"hello\n");
        let server = Server::new(&fx.config()).unwrap();
        read_document(&server, "page.txt");
        fs::remove_file(fx.source.path().join("page.txt")).unwrap();
        server.scrub().unwrap();
        assert!(!fx.cache_dir.path().join("document/page.txt").exists());
        server.close();
    }
}
