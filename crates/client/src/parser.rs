//! Incremental Server-Sent-Events parser.
//!
//! Bytes may arrive split anywhere: inside a frame, inside a line, or in
//! the middle of a multi-byte UTF-8 sequence. The parser carries whatever
//! is incomplete over to the next [`StreamParser::feed`] call.

use parley_core::stream::StreamEvent;
use thiserror::Error;
use tracing::{debug, warn};

/// A frame that could not be turned into an event.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum FrameError {
    #[error("frame data is not valid JSON: {reason}")]
    InvalidJson { reason: String },

    #[error("frame has no \"type\" field")]
    MissingType,

    #[error("malformed {event_type} event: {reason}")]
    InvalidEvent { event_type: String, reason: String },

    #[error("stream ended inside a frame ({buffered} bytes unparsed)")]
    Truncated { buffered: usize },
}

/// Result of one [`StreamParser::feed`] call.
#[derive(Debug, Default, Clone, PartialEq)]
pub struct ParseBatch {
    /// Events in stream order.
    pub events: Vec<StreamEvent>,
    /// One entry per malformed frame. Never hides events of the same batch.
    pub errors: Vec<FrameError>,
}

#[derive(Debug, Default)]
pub struct StreamParser {
    /// Undecoded tail: an incomplete UTF-8 sequence.
    pending_bytes: Vec<u8>,
    /// Decoded text not yet terminated by a blank line.
    buffer: String,
    /// The last character seen was a CR, so a leading LF belongs to it.
    after_cr: bool,
    skipped: usize,
}

impl StreamParser {
    pub fn new() -> Self {
        Self::default()
    }

    /// Frames skipped because their event type is unknown.
    pub fn skipped(&self) -> usize {
        self.skipped
    }

    /// Feed one chunk of the byte stream.
    pub fn feed(&mut self, chunk: &[u8]) -> ParseBatch {
        self.pending_bytes.extend_from_slice(chunk);
        let decoded = self.decode();
        self.normalize_line_endings(&decoded);

        let mut batch = ParseBatch::default();
        while let Some(end) = self.buffer.find("\n\n") {
            let frame: String = self.buffer.drain(..end + 2).collect();
            match self.parse_frame(&frame[..end]) {
                Ok(Some(event)) => batch.events.push(event),
                Ok(None) => {}
                Err(err) => {
                    warn!(error = %err, "Malformed stream frame");
                    batch.errors.push(err);
                }
            }
        }
        batch
    }

    /// Signal the end of the byte stream. Reports leftover partial data.
    pub fn finish(&mut self) -> Result<(), FrameError> {
        let buffered = self.pending_bytes.len() + self.buffer.trim().len();
        self.pending_bytes.clear();
        self.buffer.clear();
        self.after_cr = false;
        if buffered > 0 {
            Err(FrameError::Truncated { buffered })
        } else {
            Ok(())
        }
    }

    /// Append `text` with CR and CRLF line endings turned into LF. A CRLF
    /// split across chunks still counts as one line ending.
    fn normalize_line_endings(&mut self, text: &str) {
        for c in text.chars() {
            let after_cr = std::mem::replace(&mut self.after_cr, c == '\r');
            match c {
                '\r' => self.buffer.push('\n'),
                '\n' if after_cr => {}
                c => self.buffer.push(c),
            }
        }
    }

    /// Decode as much of `pending_bytes` as forms complete UTF-8.
    fn decode(&mut self) -> String {
        let mut out = String::new();
        loop {
            match std::str::from_utf8(&self.pending_bytes) {
                Ok(text) => {
                    out.push_str(text);
                    self.pending_bytes.clear();
                    return out;
                }
                Err(err) => {
                    let valid = err.valid_up_to();
                    // The prefix was just validated, so this cannot fail
                    out.push_str(std::str::from_utf8(&self.pending_bytes[..valid]).unwrap_or_default());
                    match err.error_len() {
                        // Incomplete sequence at the end: wait for more bytes
                        None => {
                            self.pending_bytes.drain(..valid);
                            return out;
                        }
                        Some(len) => {
                            out.push(char::REPLACEMENT_CHARACTER);
                            self.pending_bytes.drain(..valid + len);
                        }
                    }
                }
            }
        }
    }

    fn parse_frame(&mut self, frame: &str) -> Result<Option<StreamEvent>, FrameError> {
        let mut data_lines = Vec::new();
        for line in frame.split('\n') {
            if line.is_empty() || line.starts_with(':') {
                continue;
            }
            let (field, value) = match line.split_once(':') {
                Some((field, value)) => (field, value.strip_prefix(' ').unwrap_or(value)),
                None => (line, ""),
            };
            // `event:`, `id:` and `retry:` carry nothing the payload doesn't
            if field == "data" {
                data_lines.push(value);
            }
        }

        if data_lines.is_empty() {
            return Ok(None);
        }
        let data = data_lines.join("\n");

        let value: serde_json::Value =
            serde_json::from_str(&data).map_err(|e| FrameError::InvalidJson { reason: e.to_string() })?;
        let event_type = value
            .get("type")
            .and_then(|t| t.as_str())
            .ok_or(FrameError::MissingType)?
            .to_string();

        if !StreamEvent::KNOWN_TYPES.contains(&event_type.as_str()) {
            self.skipped += 1;
            debug!(%event_type, "Skipping unknown event type");
            return Ok(None);
        }

        serde_json::from_value(value)
            .map(Some)
            .map_err(|e| FrameError::InvalidEvent {
                event_type,
                reason: e.to_string(),
            })
    }
}
