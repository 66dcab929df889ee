//! Server-Sent Events parsing for the chat wire protocol.
//!
//! The backend emits `data:` lines carrying JSON `StreamChunk` payloads and
//! terminates the stream with `data: [DONE]`. This module provides:
//! - `SseEvent`: one decoded SSE event
//! - `SseDecoder`: incremental, chunk-boundary-safe frame decoder
//! - `parse_chunk`: SSE event → wire `StreamChunk` (`None` for `[DONE]`)

use std::collections::VecDeque;

use crate::chat_core::error::ChatError;
use crate::chat_types::StreamChunk;

/// Stream terminator payload, sent by the backend after the last chunk.
pub const DONE_MARKER: &str = "[DONE]";

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SseEvent {
    /// Event type from the `event:` field, if any.
    pub event: Option<String>,
    /// Joined `data:` payload.
    pub data: String,
    /// Event id from the `id:` field, if any.
    pub id: Option<String>,
}

/// Incremental SSE decoder. Feed it raw byte chunks as they arrive; it
/// buffers partial lines internally and yields only complete events, so
/// chunk boundaries falling mid-line or mid-event are handled correctly.
#[derive(Debug, Default)]
pub struct SseDecoder {
    buffer: Vec<u8>,
    event: Option<String>,
    id: Option<String>,
    data: Vec<String>,
    queue: VecDeque<SseEvent>,
}

impl SseDecoder {
    pub fn new() -> Self {
        Self::default()
    }

    /// Push a byte chunk and drain any events it completed.
    pub fn push(&mut self, chunk: &[u8]) -> impl Iterator<Item = SseEvent> + '_ {
        self.buffer.extend_from_slice(chunk);
        while let Some(pos) = self.buffer.iter().position(|&b| b == b'\n') {
            let line: Vec<u8> = self.buffer.drain(..=pos).collect();
            let line = String::from_utf8_lossy(&line);
            self.take_line(line.trim_end_matches(['\n', '\r']));
        }
        self.queue.drain(..)
    }

    /// Flush any buffered event at end of stream. Some backends close the
    /// connection right after the final `data:` line without the trailing
    /// blank line; this emits that final event instead of dropping it.
    pub fn finish(&mut self) -> impl Iterator<Item = SseEvent> + '_ {
        if !self.buffer.is_empty() {
            let line: Vec<u8> = std::mem::take(&mut self.buffer);
            let line = String::from_utf8_lossy(&line);
            self.take_line(line.trim_end_matches(['\n', '\r']));
        }
        self.dispatch();
        self.queue.drain(..)
    }

    pub fn has_buffered_data(&self) -> bool {
        !self.buffer.is_empty() || !self.data.is_empty()
    }

    fn take_line(&mut self, line: &str) {
        if line.is_empty() {
            self.dispatch();
            return;
        }
        if line.starts_with(':') {
            // Comment / heartbeat line.
            return;
        }
        let (field, value) = match line.find(':') {
            Some(pos) => {
                let (field, rest) = line.split_at(pos);
                (field, rest[1..].strip_prefix(' ').unwrap_or(&rest[1..]))
            }
            None => (line, ""),
        };
        match field {
            "data" => self.data.push(value.to_string()),
            "event" => self.event = Some(value.to_string()),
            "id" => self.id = Some(value.to_string()),
            _ => {}
        }
    }

    fn dispatch(&mut self) {
        if self.data.is_empty() {
            self.event = None;
            self.id = None;
            return;
        }
        self.queue.push_back(SseEvent {
            event: self.event.take(),
            data: std::mem::take(&mut self.data).join("\n"),
            id: self.id.take(),
        });
    }
}

/// Parse a decoded SSE event into a wire chunk.
///
/// Returns `Ok(None)` for the `[DONE]` terminator. Malformed payloads are a
/// protocol failure and surface as `ChatError::Serde`.
pub fn parse_chunk(event: &SseEvent) -> Result<Option<StreamChunk>, ChatError> {
    let data = event.data.trim();
    if data == DONE_MARKER {
        return Ok(None);
    }
    let chunk: StreamChunk = serde_json::from_str(data)?;
    Ok(Some(chunk))
}

#[cfg(feature = "stream")]
pub mod stream;

#[cfg(feature = "stream")]
pub use stream::{SseStream, SseStreamExt};

#[cfg(test)]
#[path = "../tests/decoder_tests.rs"]
mod decoder_tests;
#[cfg(all(test, feature = "stream"))]
#[path = "../tests/stream_tests.rs"]
mod stream_tests;
