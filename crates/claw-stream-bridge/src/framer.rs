//! Newline-delimited JSON framing of engine output.
//!
//! [`LineFramer`] is a [`Decoder`] that turns a raw byte stream into
//! [`FrameEvent`]s. A line that is not valid JSON, or that grows past the
//! configured maximum length, becomes a [`FrameEvent::Malformed`] and framing
//! carries on with the next line.

use bytes::{Buf, BytesMut};
use serde::Serialize;
use serde_json::Value;
use tokio::io::AsyncRead;
use tokio_util::codec::{Decoder, FramedRead};

/// Longest raw-line preview carried in a parse-error event.
pub const RAW_PREVIEW_LIMIT: usize = 1024;

/// One unit of engine output as seen by clients.
#[derive(Debug, Clone, PartialEq)]
pub enum FrameEvent {
    /// A line that parsed as JSON.
    Frame(Value),
    /// A line that could not be framed as JSON.
    Malformed(ParseFailure),
}

impl FrameEvent {
    /// SSE event name for this event.
    #[must_use]
    pub const fn kind(&self) -> &'static str {
        match self {
            Self::Frame(_) => "frame",
            Self::Malformed(_) => "parse_error",
        }
    }

    /// JSON payload carried in the SSE `data:` field.
    pub fn to_data(&self) -> serde_json::Result<String> {
        match self {
            Self::Frame(value) => serde_json::to_string(value),
            Self::Malformed(failure) => serde_json::to_string(failure),
        }
    }
}

/// Details of a line that failed to frame.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ParseFailure {
    /// The offending line (lossy UTF-8, truncated to [`RAW_PREVIEW_LIMIT`] bytes).
    pub raw: String,
    /// Human readable reason.
    pub error: String,
}

impl ParseFailure {
    fn new(raw: &[u8], error: impl Into<String>) -> Self {
        let cut = raw.len().min(RAW_PREVIEW_LIMIT);
        Self {
            raw: String::from_utf8_lossy(&raw[..cut]).into_owned(),
            error: error.into(),
        }
    }
}

/// Decoder splitting bytes on `\n` and parsing each line as JSON.
#[derive(Debug, Clone)]
pub struct LineFramer {
    max_line_length: usize,
    /// Set while skipping the tail of an over-long line.
    discarding: bool,
    /// Offset up to which the buffer is known to hold no newline.
    next_index: usize,
}

impl LineFramer {
    /// Create a framer that rejects lines longer than `max_line_length` bytes.
    #[must_use]
    pub const fn new(max_line_length: usize) -> Self {
        Self {
            max_line_length,
            discarding: false,
            next_index: 0,
        }
    }

    /// Maximum accepted line length in bytes.
    #[must_use]
    pub const fn max_line_length(&self) -> usize {
        self.max_line_length
    }

    fn frame_line(line: &[u8]) -> FrameEvent {
        let line = line.strip_suffix(b"\r").unwrap_or(line);
        match serde_json::from_slice::<Value>(line) {
            Ok(value) => FrameEvent::Frame(value),
            Err(e) => FrameEvent::Malformed(ParseFailure::new(line, e.to_string())),
        }
    }

    fn too_long(&self, raw: &[u8]) -> FrameEvent {
        FrameEvent::Malformed(ParseFailure::new(
            raw,
            format!("line exceeds maximum length of {} bytes", self.max_line_length),
        ))
    }
}

impl Decoder for LineFramer {
    type Item = FrameEvent;
    type Error = std::io::Error;

    fn decode(&mut self, buf: &mut BytesMut) -> Result<Option<FrameEvent>, Self::Error> {
        loop {
            let newline = buf[self.next_index..]
                .iter()
                .position(|b| *b == b'\n')
                .map(|offset| self.next_index + offset);

            match (self.discarding, newline) {
                (true, Some(pos)) => {
                    buf.advance(pos + 1);
                    self.discarding = false;
                    self.next_index = 0;
                }
                (true, None) => {
                    buf.clear();
                    self.next_index = 0;
                    return Ok(None);
                }
                (false, Some(pos)) => {
                    let line = buf.split_to(pos + 1);
                    self.next_index = 0;
                    let line = &line[..pos];
                    if line.len() > self.max_line_length {
                        return Ok(Some(self.too_long(line)));
                    }
                    return Ok(Some(Self::frame_line(line)));
                }
                (false, None) if buf.len() > self.max_line_length => {
                    let event = self.too_long(&buf[..]);
                    buf.clear();
                    self.next_index = 0;
                    self.discarding = true;
                    return Ok(Some(event));
                }
                (false, None) => {
                    self.next_index = buf.len();
                    return Ok(None);
                }
            }
        }
    }

    fn decode_eof(&mut self, buf: &mut BytesMut) -> Result<Option<FrameEvent>, Self::Error> {
        if let Some(event) = self.decode(buf)? {
            return Ok(Some(event));
        }
        self.next_index = 0;
        if self.discarding {
            buf.clear();
            self.discarding = false;
            return Ok(None);
        }
        if buf.is_empty() {
            return Ok(None);
        }
        let line = buf.split();
        Ok(Some(Self::frame_line(&line)))
    }
}

/// Wrap an engine output stream in a [`LineFramer`].
pub fn frame_stream<R: AsyncRead>(reader: R, max_line_length: usize) -> FramedRead<R, LineFramer> {
    FramedRead::new(reader, LineFramer::new(max_line_length))
}
