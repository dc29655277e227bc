//! Incremental decoder for the chat event stream.

use crate::events::{ChatEvent, EventDecodeError};

use super::ClientError;

/// Feeds arbitrary byte chunks in, gets whole events out.
///
/// Events end at a blank line. Multi-line `data:` fields are joined with
/// `\n`; comments (including keep-alives) and other fields are ignored.
#[derive(Debug, Default)]
pub struct SseDecoder {
    buffer: Vec<u8>,
    data_lines: Vec<String>,
}

impl SseDecoder {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push(&mut self, chunk: &[u8]) -> Vec<Result<ChatEvent, ClientError>> {
        self.buffer.extend_from_slice(chunk);
        let mut events = Vec::new();
        while let Some(newline_pos) = self.buffer.iter().position(|b| *b == b'\n') {
            let line_bytes: Vec<u8> = self.buffer.drain(..=newline_pos).collect();
            let line = String::from_utf8_lossy(&line_bytes);
            let line = line.trim_end_matches(['\n', '\r']);
            if let Some(event) = self.process_line(line) {
                events.push(event);
            }
        }
        events
    }

    /// Flushes an event left unterminated when the stream closed.
    pub fn finish(&mut self) -> Option<Result<ChatEvent, ClientError>> {
        if !self.buffer.is_empty() {
            let tail = String::from_utf8_lossy(&std::mem::take(&mut self.buffer)).to_string();
            if let Some(event) = self.process_line(tail.trim_end_matches('\r')) {
                return Some(event);
            }
        }
        self.dispatch()
    }

    fn process_line(&mut self, line: &str) -> Option<Result<ChatEvent, ClientError>> {
        if line.is_empty() {
            return self.dispatch();
        }
        if line.starts_with(':') {
            return None;
        }
        if let Some(value) = line.strip_prefix("data:") {
            self.data_lines
                .push(value.strip_prefix(' ').unwrap_or(value).to_string());
        }
        None
    }

    fn dispatch(&mut self) -> Option<Result<ChatEvent, ClientError>> {
        if self.data_lines.is_empty() {
            return None;
        }
        let payload = std::mem::take(&mut self.data_lines).join("\n");
        Some(decode_payload(&payload))
    }
}

fn decode_payload(payload: &str) -> Result<ChatEvent, ClientError> {
    ChatEvent::decode(payload).map_err(|e| match e {
        EventDecodeError::UnknownType(kind) => ClientError::UnknownEvent(kind),
        other => ClientError::Decode(other),
    })
}
