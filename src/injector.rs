//! Content injector
//!
//! Rewrites a buffered body by replacing each tag's original byte range
//! with its fetched payload. The caller streams the body in whatever
//! chunks it likes; injection state persists across calls so a marker
//! straddling any number of chunk boundaries is still replaced exactly
//! once.

use std::io::Write;

use bytes::Bytes;

use crate::error::{EsiError, Result};

/// One splice instruction: replace body bytes `[start, end)` with `data`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DataTag {
    /// Replacement payload
    pub data: Bytes,
    /// Offset of the marker's leading `<` in the original body
    pub start: usize,
    /// One past the marker's closing `>`
    pub end: usize,
}

impl DataTag {
    /// A splice instruction for the byte range of one marker.
    pub fn new(data: Bytes, start: usize, end: usize) -> Self {
        DataTag { data, start, end }
    }
}

/// An ordered set of splice instructions plus the streaming cursor.
#[derive(Debug, Default)]
pub struct DataTags {
    tags: Vec<DataTag>,
    emitted: Vec<bool>,
    cursor: usize,
    current: usize,
}

impl DataTags {
    /// Build an injector over the given tags, sorted by `start`.
    pub fn new(mut tags: Vec<DataTag>) -> Self {
        tags.sort_by_key(|t| t.start);
        let emitted = vec![false; tags.len()];
        DataTags {
            tags,
            emitted,
            cursor: 0,
            current: 0,
        }
    }

    pub fn len(&self) -> usize {
        self.tags.len()
    }

    pub fn is_empty(&self) -> bool {
        self.tags.is_empty()
    }

    /// The tags in injection order.
    pub fn iter(&self) -> impl Iterator<Item = &DataTag> {
        self.tags.iter()
    }

    /// How the body length changes once every tag is applied. The host
    /// uses this to fix up Content-Length before the real write starts.
    pub fn size_delta(&self) -> i64 {
        self.tags
            .iter()
            .map(|t| t.data.len() as i64 - (t.end as i64 - t.start as i64))
            .sum()
    }

    /// Inject into one chunk of the original body and write the result.
    ///
    /// `chunk` continues exactly where the previous call left off; the
    /// internal cursor tracks the absolute offset. Returns the number of
    /// bytes written by this call. A sink error aborts immediately with
    /// `WriteFailed` and no byte count.
    pub fn inject_content(&mut self, chunk: &[u8], sink: &mut dyn Write) -> Result<usize> {
        let abs_lo = self.cursor;
        let abs_hi = abs_lo + chunk.len();
        let mut written = 0usize;
        let mut pos = abs_lo;

        loop {
            // Tags whose range lies behind the cursor are finished.
            while self.current < self.tags.len() && self.tags[self.current].end <= pos {
                self.current += 1;
            }

            let Some(tag) = self.tags.get(self.current) else {
                written += sink_write(sink, &chunk[pos - abs_lo..])?;
                break;
            };
            if tag.start >= abs_hi {
                // The next tag starts in a future chunk.
                written += sink_write(sink, &chunk[pos - abs_lo..])?;
                break;
            }

            // Verbatim bytes up to the marker.
            if tag.start > pos {
                written += sink_write(sink, &chunk[pos - abs_lo..tag.start - abs_lo])?;
                pos = tag.start;
            }

            if abs_hi >= tag.end {
                // The whole marker is behind us now; emit its payload once.
                if !self.emitted[self.current] {
                    written += sink_write(sink, &tag.data)?;
                    self.emitted[self.current] = true;
                }
                pos = tag.end;
                self.current += 1;
            } else {
                // The closing `/>` lies in a future chunk: suppress the
                // marker bytes seen so far and wait.
                pos = abs_hi;
                break;
            }
        }

        self.cursor = abs_hi;
        Ok(written)
    }

    /// Clear all per-tag emitted flags and rewind the cursor so the same
    /// tags can replay against a fresh copy of the body.
    pub fn reset_states(&mut self) {
        self.emitted.iter_mut().for_each(|e| *e = false);
        self.cursor = 0;
        self.current = 0;
    }
}

fn sink_write(sink: &mut dyn Write, data: &[u8]) -> Result<usize> {
    if data.is_empty() {
        return Ok(0);
    }
    sink.write_all(data)
        .map_err(|e| EsiError::WriteFailed(format!("sink write of {} bytes: {}", data.len(), e)))?;
    Ok(data.len())
}
