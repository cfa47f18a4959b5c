//! Incremental framing of a server-sent-event body.
//!
//! The decoder owns a byte buffer so that frames split across network chunks
//! (including mid-codepoint) reassemble before any text is interpreted.

use bytes::BytesMut;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Frame {
    /// Accumulated `data:` payload of one frame.
    Data(String),
    /// A frame carrying only `:` comment lines (server keep-alive).
    Comment,
}

#[derive(Debug, Default)]
pub struct FrameDecoder {
    buf: BytesMut,
}

impl FrameDecoder {
    pub fn feed(&mut self, chunk: &[u8]) {
        self.buf.extend_from_slice(chunk);
    }

    /// Pop the next complete frame, skipping frames with no data or comment
    /// lines. Returns `None` once the buffer holds only a partial frame.
    pub fn next_frame(&mut self) -> Option<Frame> {
        loop {
            let (length, terminator) = find_boundary(&self.buf)?;
            let raw = self.buf.split_to(length + terminator);
            let text = String::from_utf8_lossy(&raw[..length]);
            if let Some(frame) = parse_frame(&text) {
                return Some(frame);
            }
        }
    }
}

// Earliest double line terminator: `\n\n` or `\r\n\r\n`, whichever comes
// first. Returns (frame length, terminator length).
fn find_boundary(buf: &[u8]) -> Option<(usize, usize)> {
    let lf = find(buf, b"\n\n");
    let crlf = find(buf, b"\r\n\r\n");
    match (lf, crlf) {
        (Some(lf), Some(crlf)) if crlf < lf => Some((crlf, 4)),
        (Some(lf), _) => Some((lf, 2)),
        (None, Some(crlf)) => Some((crlf, 4)),
        (None, None) => None,
    }
}

fn find(haystack: &[u8], needle: &[u8]) -> Option<usize> {
    haystack.windows(needle.len()).position(|window| window == needle)
}

fn parse_frame(text: &str) -> Option<Frame> {
    let mut data: Option<String> = None;
    let mut commented = false;

    for line in text.split('\n') {
        let line = line.strip_suffix('\r').unwrap_or(line);
        if line.starts_with(':') {
            commented = true;
        } else if let Some(rest) = line.strip_prefix("data:") {
            let rest = rest.strip_prefix(' ').unwrap_or(rest);
            match &mut data {
                Some(payload) => {
                    payload.push('\n');
                    payload.push_str(rest);
                }
                None => data = Some(rest.to_string()),
            }
        }
        // Field lines this client does not use (`event:`, `id:`, ...) are
        // dropped without affecting the frame's classification.
    }

    match (data, commented) {
        (Some(payload), _) => Some(Frame::Data(payload)),
        (None, true) => Some(Frame::Comment),
        (None, false) => None,
    }
}
