//! Multipart frame splitter for MJPEG streams
//!
//! An MJPEG camera answers with `multipart/x-mixed-replace`. Each part
//! looks like:
//! - Boundary line (`--<token>`)
//! - Part headers, one of them `Content-Length`
//! - Empty line (CR LF CR LF ends the headers)
//! - Exactly `Content-Length` bytes of image data
//!
//! The splitter is fed arbitrary chunks and hands back whole image
//! payloads. Its output depends only on the byte sequence, never on how
//! that sequence was chunked.

use bytes::{Buf, Bytes, BytesMut};
use log::debug;

/// Sequence that ends the headers of a part
pub const HEADER_TERMINATOR: &[u8; 4] = b"\r\n\r\n";

/// Header-search size above which the splitter looks for a boundary to resync on
pub const RESYNC_THRESHOLD: usize = 1024;

/// Hard cap on the header-search buffer when no boundary ever shows up
pub const MAX_PENDING_HEADER: usize = 64 * 1024;

/// Extract the `boundary` parameter from a `Content-Type` value
pub fn extract_boundary(content_type: &str) -> Option<String> {
    content_type
        .split(';')
        .map(str::trim)
        .find_map(|param| {
            let (key, value) = param.split_once('=')?;
            key.trim()
                .eq_ignore_ascii_case("boundary")
                .then(|| value.trim().trim_matches('"').to_string())
        })
        .filter(|boundary| !boundary.is_empty())
}

/// Parse the `Content-Length` of a part header block.
///
/// Missing, unparsable and zero lengths all count as unknown.
pub fn parse_content_length(headers: &str) -> Option<usize> {
    headers
        .split('\n')
        .map(|line| line.trim_end_matches('\r'))
        .find(|line| {
            line.get(..15)
                .is_some_and(|key| key.eq_ignore_ascii_case("content-length:"))
        })
        .and_then(|line| line[15..].trim().parse::<usize>().ok())
        .filter(|&length| length > 0)
}

/// What the header-search buffer holds next
#[derive(Debug)]
enum Scan {
    /// Part headers end at `end` (terminator included)
    Header { end: usize },
    /// Boundary found; drop through `boundary_end` plus newlines before `limit`
    Resync { boundary_end: usize, limit: usize },
    /// Buffer hit the hard cap at `at` bytes
    Overflow { at: usize },
    /// Need more bytes
    Pending,
}

/// Streaming splitter for `multipart/x-mixed-replace` bodies
pub struct MultipartSplitter {
    boundary: Vec<u8>,
    buffer: BytesMut,
    /// Body length of the part being read, `None` while searching headers
    expected_length: Option<usize>,
    /// Bytes at the front of `buffer` that were already scanned
    scanned: usize,
}

impl MultipartSplitter {
    /// Create a splitter for the given boundary token (without leading dashes)
    pub fn new(boundary: &str) -> Self {
        Self {
            boundary: format!("--{}", boundary).into_bytes(),
            buffer: BytesMut::with_capacity(65536),
            expected_length: None,
            scanned: 0,
        }
    }

    /// Create a splitter from a full `Content-Type` header value
    pub fn from_content_type(content_type: &str) -> Option<Self> {
        extract_boundary(content_type).map(|boundary| Self::new(&boundary))
    }

    /// Boundary marker as it appears on the wire
    pub fn boundary(&self) -> &[u8] {
        &self.boundary
    }

    /// Add data to the buffer
    pub fn push(&mut self, data: &[u8]) {
        self.buffer.extend_from_slice(data);
    }

    /// Whether a part body is being accumulated
    pub fn in_body(&self) -> bool {
        self.expected_length.is_some()
    }

    /// Number of buffered bytes not yet handed out
    pub fn buffered(&self) -> usize {
        self.buffer.len()
    }

    /// Try to take the next complete part payload
    pub fn next_payload(&mut self) -> Option<Bytes> {
        loop {
            if let Some(length) = self.expected_length {
                if self.buffer.len() < length {
                    return None;
                }
                let payload = self.buffer.split_to(length).freeze();
                self.expected_length = None;
                self.scanned = 0;
                return Some(payload);
            }

            match self.scan() {
                Scan::Header { end } => {
                    let length = {
                        let headers = String::from_utf8_lossy(&self.buffer[..end - HEADER_TERMINATOR.len()]);
                        parse_content_length(&headers)
                    };
                    self.buffer.advance(end);
                    self.scanned = 0;
                    match length {
                        Some(length) => {
                            debug!("Part header parsed, expecting {} bytes", length);
                            self.expected_length = Some(length);
                        }
                        None => debug!("Part without usable Content-Length, waiting for resync"),
                    }
                }
                Scan::Resync { boundary_end, limit } => {
                    let mut end = boundary_end;
                    while end < limit && matches!(self.buffer[end], b'\r' | b'\n') {
                        end += 1;
                    }
                    debug!("Resynced on boundary, dropped {} bytes", end);
                    self.buffer.advance(end);
                    self.scanned = limit - end;
                }
                Scan::Overflow { at } => {
                    let keep = self.boundary.len() + HEADER_TERMINATOR.len();
                    let dropped = at.saturating_sub(keep);
                    debug!("No boundary in {} bytes, dropped {}", at, dropped);
                    self.buffer.advance(dropped);
                    self.scanned = at - dropped;
                }
                Scan::Pending => return None,
            }
        }
    }

    /// Find the earliest event in the header-search buffer.
    ///
    /// Each event fires at the buffer length where it would be noticed if
    /// bytes arrived one at a time; ties go to headers, then resync.
    fn scan(&self) -> Scan {
        let len = self.buffer.len();
        let earliest = self.scanned + 1;
        let mut best: Option<(usize, Scan)> = None;

        let mut consider = |at: usize, scan: Scan| {
            if at <= len && best.as_ref().map_or(true, |(best_at, _)| at < *best_at) {
                best = Some((at, scan));
            }
        };

        if let Some(pos) = find(&self.buffer, HEADER_TERMINATOR) {
            let end = pos + HEADER_TERMINATOR.len();
            consider(end.max(earliest), Scan::Header { end });
        }

        if let Some(pos) = find(&self.buffer, &self.boundary) {
            let boundary_end = pos + self.boundary.len();
            let limit = (boundary_end + 1).max(RESYNC_THRESHOLD + 1).max(earliest);
            consider(limit, Scan::Resync { boundary_end, limit });
        }

        let at = (MAX_PENDING_HEADER + 1).max(earliest);
        consider(at, Scan::Overflow { at });

        best.map_or(Scan::Pending, |(_, scan)| scan)
    }

    /// Clear buffer and parse state
    pub fn clear(&mut self) {
        self.buffer.clear();
        self.expected_length = None;
        self.scanned = 0;
    }
}

fn find(haystack: &[u8], needle: &[u8]) -> Option<usize> {
    if needle.is_empty() || haystack.len() < needle.len() {
        return None;
    }
    haystack.windows(needle.len()).position(|w| w == needle)
}
