//! Streaming tag scanner
//!
//! Locates `<esi:include ... />` markers in a byte stream and emits one raw
//! record per complete marker. The scanner is incremental: bytes may be fed
//! in arbitrary chunks and a marker straddling any number of chunk
//! boundaries is still found at its correct absolute offsets.

use bytes::Bytes;

/// The literal tag prefix. Matching is byte-exact; no case folding.
const TAG_PREFIX: &[u8] = b"<esi:include";

/// One located marker: the raw attribute bytes (everything between `<esi:`
/// and `/>`, so the leading `include` word is part of it) plus the absolute
/// byte range `[start, end)` of the whole marker in the scanned stream.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RawMarker {
    /// Bytes between `<esi:` and `/>`, including the `include` token and any
    /// whitespace before the closing slash
    pub raw_attributes: Bytes,
    /// Offset of the leading `<`
    pub start: usize,
    /// One past the closing `>`
    pub end: usize,
}

enum State {
    /// Searching for the tag prefix; `matched` bytes of it seen so far
    Searching { matched: usize },
    /// Inside a tag, collecting attribute bytes until an unquoted `/>`
    InTag {
        start: usize,
        buf: Vec<u8>,
        quote: Option<u8>,
        slash_pending: bool,
    },
}

/// Incremental scanner for include markers.
///
/// Feed chunks with [`TagScanner::feed`], then collect the complete markers
/// with [`TagScanner::finish`]. A tag whose closing `/>` never arrives is
/// silently dropped; that is not an error.
pub struct TagScanner {
    state: State,
    pos: usize,
    markers: Vec<RawMarker>,
}

impl Default for TagScanner {
    fn default() -> Self {
        Self::new()
    }
}

impl TagScanner {
    /// Create a scanner positioned at stream offset zero.
    pub fn new() -> Self {
        TagScanner {
            state: State::Searching { matched: 0 },
            pos: 0,
            markers: Vec::new(),
        }
    }

    /// Consume one chunk of the stream. Offsets of emitted markers are
    /// absolute across all chunks fed so far.
    pub fn feed(&mut self, chunk: &[u8]) {
        for &c in chunk {
            self.step(c);
            self.pos += 1;
        }
    }

    fn step(&mut self, c: u8) {
        match &mut self.state {
            State::Searching { matched } => {
                if c == TAG_PREFIX[*matched] {
                    *matched += 1;
                    if *matched == TAG_PREFIX.len() {
                        // The prefix ends one byte before the next position;
                        // the attribute record keeps the `include` word.
                        self.state = State::InTag {
                            start: self.pos + 1 - TAG_PREFIX.len(),
                            buf: b"include".to_vec(),
                            quote: None,
                            slash_pending: false,
                        };
                    }
                } else if c == TAG_PREFIX[0] {
                    // `<` restarts the only viable partial match.
                    *matched = 1;
                } else {
                    *matched = 0;
                }
            }
            State::InTag {
                start,
                buf,
                quote,
                slash_pending,
            } => {
                if *slash_pending {
                    *slash_pending = false;
                    if c == b'>' {
                        let marker = RawMarker {
                            raw_attributes: Bytes::from(std::mem::take(buf)),
                            start: *start,
                            end: self.pos + 1,
                        };
                        self.markers.push(marker);
                        self.state = State::Searching { matched: 0 };
                        return;
                    }
                    // The slash was ordinary content after all.
                    buf.push(b'/');
                }

                match *quote {
                    Some(q) => {
                        buf.push(c);
                        if c == q {
                            *quote = None;
                        }
                    }
                    None => {
                        if c == b'"' || c == b'\'' {
                            *quote = Some(c);
                            buf.push(c);
                        } else if c == b'/' {
                            *slash_pending = true;
                        } else {
                            buf.push(c);
                        }
                    }
                }
            }
        }
    }

    /// Finish scanning and return the complete markers in document order.
    /// An open tag without its closing `/>` is discarded.
    pub fn finish(self) -> Vec<RawMarker> {
        self.markers
    }
}

/// Scan a fully buffered body in one call.
pub fn scan(body: &[u8]) -> Vec<RawMarker> {
    let mut scanner = TagScanner::new();
    scanner.feed(body);
    scanner.finish()
}

/// Scan a readable byte stream without buffering it whole.
pub fn scan_reader<R: std::io::Read>(mut reader: R) -> crate::error::Result<Vec<RawMarker>> {
    let mut scanner = TagScanner::new();
    let mut buf = [0u8; 8 * 1024];
    loop {
        let n = reader
            .read(&mut buf)
            .map_err(|e| crate::error::EsiError::Temporary(format!("body read: {}", e)))?;
        if n == 0 {
            break;
        }
        scanner.feed(&buf[..n]);
    }
    Ok(scanner.finish())
}
