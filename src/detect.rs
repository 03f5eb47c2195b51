use encoding_rs::Encoding;
use mime::Mime;

// Content sniffing over the first couple of KiB of a document. This decides
// two things downstream: what charset/mime the content header advertises,
// and whether a document counts as text at all (binary inputs short-circuit
// content search and make the passthrough transformer decline caching).

/// How much of a file the sniffers look at.
pub const SNIFF_LEN: usize = 2048;

#[derive(Debug, Clone, PartialEq)]
pub struct Detected {
    pub mime: Mime,
    pub encoding: Option<&'static Encoding>,
}

impl Detected {
    fn text(encoding: &'static Encoding) -> Detected {
        Detected {
            mime: mime::TEXT_PLAIN,
            encoding: Some(encoding),
        }
    }

    fn binary() -> Detected {
        Detected {
            mime: mime::APPLICATION_OCTET_STREAM,
            encoding: None,
        }
    }
}

pub fn sniff(buf: &[u8]) -> Detected {
    if let Some((encoding, _bom_len)) = Encoding::for_bom(buf) {
        return Detected::text(encoding);
    }
    if buf.is_empty() {
        return Detected::text(encoding_rs::UTF_8);
    }
    if buf.contains(&0) {
        return Detected::binary();
    }
    match std::str::from_utf8(buf) {
        Ok(_) => Detected::text(encoding_rs::UTF_8),
        Err(e) if e.error_len().is_none() => {
            // Only the tail is broken; the sniff window cut a multi-byte
            // sequence in half.
            Detected::text(encoding_rs::UTF_8)
        }
        Err(_) => {
            if looks_like_single_byte_text(buf) {
                Detected::text(encoding_rs::WINDOWS_1252)
            } else {
                Detected::binary()
            }
        }
    }
}

/// Permissive heuristic for legacy single-byte text: allow anything except
/// C0 controls that never appear in text files.
fn looks_like_single_byte_text(buf: &[u8]) -> bool {
    buf.iter()
        .all(|&b| b >= 0x20 || matches!(b, b'\t' | b'\n' | b'\r' | 0x0C))
}
