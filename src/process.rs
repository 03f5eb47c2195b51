use crate::detect::{self, Detected, SNIFF_LEN};
use crate::prelude::*;
use std::fs::File;
use std::io::{self, SeekFrom};
use std::sync::Arc;

// The transformer seam. A transformer consumes a source document and writes
// the representation served over HTTP: a small content header (charset +
// mime, so the request layer can emit Content-Type without re-sniffing)
// followed by the payload bytes. `cached = true` means the output is going
// into a cache entry; a transformer that decides its output isn't worth
// storing signals `ProcessError::NoCache` instead of writing it.

/// The input side of a transformation: the locked source file plus its path
/// (extension routing needs the name, previews need to rewind).
pub struct Input<'a> {
    path: &'a Path,
    file: &'a mut File,
}

impl<'a> Input<'a> {
    pub fn new(path: &'a Path, file: &'a mut File) -> Input<'a> {
        Input { path, file }
    }

    pub fn path(&self) -> &Path {
        self.path
    }

    pub fn rewind(&mut self) -> io::Result<()> {
        self.file.seek(SeekFrom::Start(0))?;
        Ok(())
    }
}

impl Read for Input<'_> {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        self.file.read(buf)
    }
}

pub trait Processor: Send + Sync {
    fn process(
        &self,
        input: &mut Input<'_>,
        output: &mut dyn Write,
        cached: bool,
    ) -> Result<(), ProcessError>;
}

/// The charset/mime stamp a transformer writes in front of its payload:
///
///   encoding_len u8 | encoding (ASCII) | mime_len u8 | mime (ASCII)
///
/// `encoding_len = 0` means unknown/binary.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ContentHeader {
    pub encoding: Option<String>,
    pub mime: String,
}

impl ContentHeader {
    pub fn from_detected(detected: &Detected) -> ContentHeader {
        ContentHeader {
            encoding: detected.encoding.map(|e| e.name().to_owned()),
            mime: detected.mime.to_string(),
        }
    }
}

pub fn write_content_header(out: &mut dyn Write, header: &ContentHeader) -> io::Result<()> {
    let encoding = header.encoding.as_deref().unwrap_or("");
    for field in [encoding, header.mime.as_str()] {
        if field.len() > u8::MAX as usize || !field.is_ascii() {
            return Err(io::Error::new(
                io::ErrorKind::InvalidInput,
                format!("content header field not storable: {field:?}"),
            ));
        }
    }
    out.write_all(&[encoding.len() as u8])?;
    out.write_all(encoding.as_bytes())?;
    out.write_all(&[header.mime.len() as u8])?;
    out.write_all(header.mime.as_bytes())?;
    Ok(())
}

pub fn read_content_header(input: &mut dyn Read) -> Result<ContentHeader, HeaderError> {
    let mut read_field = |input: &mut dyn Read| -> Result<String, HeaderError> {
        let mut len = [0u8; 1];
        input.read_exact(&mut len).map_err(HeaderError::from_read)?;
        let mut field = vec![0u8; len[0] as usize];
        input.read_exact(&mut field).map_err(HeaderError::from_read)?;
        String::from_utf8(field).map_err(|_| HeaderError::InvalidFormat)
    };
    let encoding = read_field(&mut *input)?;
    let mime = read_field(&mut *input)?;
    Ok(ContentHeader {
        encoding: if encoding.is_empty() {
            None
        } else {
            Some(encoding)
        },
        mime,
    })
}

/// Sniff the head of the input without consuming it.
pub fn sniff_input(input: &mut Input<'_>) -> io::Result<(Detected, Vec<u8>)> {
    let mut buf = vec![0u8; SNIFF_LEN];
    let mut filled = 0;
    while filled < buf.len() {
        let n = input.read(&mut buf[filled..])?;
        if n == 0 {
            break;
        }
        filled += n;
    }
    buf.truncate(filled);
    let detected = detect::sniff(&buf);
    input.rewind()?;
    Ok((detected, buf))
}

/// Raw passthrough: detected content header, then the source bytes
/// unchanged. Binary input is not worth a cache entry that merely duplicates
/// the source file, so when the cache asks, it declines; on the bypass path
/// it streams the bytes through.
pub struct CopyProcessor;

impl Processor for CopyProcessor {
    fn process(
        &self,
        input: &mut Input<'_>,
        output: &mut dyn Write,
        cached: bool,
    ) -> Result<(), ProcessError> {
        let (detected, _) = sniff_input(input)?;
        if cached && detected.encoding.is_none() {
            return Err(ProcessError::NoCache);
        }
        write_content_header(output, &ContentHeader::from_detected(&detected))?;
        io::copy(input, output)?;
        Ok(())
    }
}

/// Resolve a configured transformer name.
pub fn lookup(name: &str) -> Result<Arc<dyn Processor>> {
    match name {
        "copy" => Ok(Arc::new(CopyProcessor)),
        _ => bail!("unknown transformer: {name:?}"),
    }
}

/// Dispatches to the transformer whose extension suffix matches the input's
/// file name; the longest matching suffix wins, and anything unmatched falls
/// through to the default.
pub struct Router {
    routes: Vec<(String, Arc<dyn Processor>)>,
    default: Arc<dyn Processor>,
}

impl Router {
    pub fn new(routes: Vec<(String, Arc<dyn Processor>)>, default: Arc<dyn Processor>) -> Router {
        Router { routes, default }
    }

    fn route(&self, path: &Path) -> &Arc<dyn Processor> {
        let name = path
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_default();
        self.routes
            .iter()
            .filter(|(suffix, _)| name.ends_with(suffix.as_str()))
            .max_by_key(|(suffix, _)| suffix.len())
            .map(|(_, processor)| processor)
            .unwrap_or(&self.default)
    }
}

impl Processor for Router {
    fn process(
        &self,
        input: &mut Input<'_>,
        output: &mut dyn Write,
        cached: bool,
    ) -> Result<(), ProcessError> {
        self.route(input.path()).process(input, output, cached)
    }
}
