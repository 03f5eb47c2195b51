use std::path::PathBuf;
use thiserror::Error;

/// Errors that `Cache::lookup` surfaces to its caller. Everything else —
/// malformed headers, stale entries, transformer bypass signals — is handled
/// internally and never escapes the cache.
#[derive(Error, Debug)]
pub enum CacheError {
    #[error("no such document: {0}")]
    NotFound(PathBuf),
    #[error("invalid path: {0:?}")]
    InvalidPath(String),
}

/// Failures while decoding an on-disk entry or content header.
///
/// `Entry` treats these as "inactive, rebuild me"; they only propagate from
/// the standalone codec functions.
#[derive(Error, Debug)]
pub enum HeaderError {
    #[error("unrecognized header magic")]
    InvalidFormat,
    #[error("header ends early")]
    Truncated,
    #[error("payload size {0} does not fit the header")]
    SizeExceeded(u64),
    #[error("checksum of {0} bytes is too long to store")]
    ChecksumTooLong(usize),
    #[error(transparent)]
    Io(#[from] std::io::Error),
}

impl HeaderError {
    /// Short reads come back from the io layer as UnexpectedEof; fold them
    /// into the Truncated variant so callers match one condition.
    pub fn from_read(err: std::io::Error) -> HeaderError {
        if err.kind() == std::io::ErrorKind::UnexpectedEof {
            HeaderError::Truncated
        } else {
            HeaderError::Io(err)
        }
    }
}

/// What a transformer may signal back to the cache.
#[derive(Error, Debug)]
pub enum ProcessError {
    /// "My output is not worth caching; stream me through on every request."
    #[error("transformer declined to cache this input")]
    NoCache,
    /// The transformer cannot produce output for this input at all; the
    /// entry is kept header-only.
    #[error("transformer cannot produce output for this input")]
    Unsupported,
    #[error(transparent)]
    Io(#[from] std::io::Error),
    #[error(transparent)]
    Other(#[from] eyre::Report),
}
