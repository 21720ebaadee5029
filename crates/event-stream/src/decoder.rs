//! Incremental decoder for the `data: <payload>` stream protocol
//!
//! Bytes arrive in arbitrary chunks. The decoder keeps two carry-over
//! buffers: undecoded bytes of a UTF-8 sequence split across chunks, and the
//! trailing text after the last newline. Neither is assumed empty at a chunk
//! boundary.
//!
//! Per complete line (trimmed, empty lines skipped):
//! - `data: [DONE]` completes the stream; nothing after it is decoded
//! - `data: {json}` is dispatched on its `type` field (`token`, `error`,
//!   `start`, `end`) or falls back to a `chunk`/`content`/`text` field
//! - `data:` followed by something that is not JSON is a raw text chunk,
//!   unless it looks like a truncated control frame, which is dropped
//! - any other line is a raw text chunk

use serde_json::{Map, Value};
use tracing::debug;

use crate::error::StreamError;

/// Fields consulted, in order, for frames without a recognised `type`.
const FALLBACK_CONTENT_FIELDS: &[&str] = &["chunk", "content", "text"];

/// A decoded protocol message.
#[derive(Debug, Clone, PartialEq)]
pub enum StreamEvent {
    Message(String),
    Error(StreamError),
    Complete,
}

#[derive(Debug, Default)]
pub struct SseDecoder {
    line_buffer: String,
    pending_bytes: Vec<u8>,
    completed: bool,
}

impl SseDecoder {
    pub fn new() -> Self {
        Self::default()
    }

    /// Whether `[DONE]` or an `end` frame has been seen.
    pub fn is_completed(&self) -> bool {
        self.completed
    }

    /// Incomplete trailing line carried into the next chunk.
    pub fn buffered(&self) -> &str {
        &self.line_buffer
    }

    /// Decode one chunk, returning the events of every line it completes.
    pub fn feed(&mut self, chunk: &[u8]) -> Vec<StreamEvent> {
        let mut events = Vec::new();
        if self.completed {
            return events;
        }

        let text = self.decode_utf8(chunk);
        self.line_buffer.push_str(&text);

        let buffer = std::mem::take(&mut self.line_buffer);
        let mut consumed = 0;
        while let Some(offset) = buffer[consumed..].find('\n') {
            let line = &buffer[consumed..consumed + offset];
            consumed += offset + 1;
            self.process_line(line, &mut events);
            if self.completed {
                return events;
            }
        }
        self.line_buffer = buffer[consumed..].to_string();
        events
    }

    /// Flush at end of input: the trailing fragment is processed as a final
    /// line, then the stream completes if it had not already.
    pub fn finish(&mut self) -> Vec<StreamEvent> {
        let mut events = Vec::new();
        if self.completed {
            return events;
        }

        let mut tail = std::mem::take(&mut self.line_buffer);
        if !self.pending_bytes.is_empty() {
            tail.push_str(&String::from_utf8_lossy(&self.pending_bytes));
            self.pending_bytes.clear();
        }
        self.process_line(&tail, &mut events);

        if !self.completed {
            self.completed = true;
            events.push(StreamEvent::Complete);
        }
        events
    }

    /// Decode as much of the pending bytes as forms valid UTF-8, keeping an
    /// incomplete trailing sequence for the next chunk. Invalid sequences
    /// become U+FFFD.
    fn decode_utf8(&mut self, chunk: &[u8]) -> String {
        self.pending_bytes.extend_from_slice(chunk);
        let mut out = String::new();
        loop {
            match std::str::from_utf8(&self.pending_bytes) {
                Ok(valid) => {
                    out.push_str(valid);
                    self.pending_bytes.clear();
                    return out;
                }
                Err(e) => {
                    let valid_up_to = e.valid_up_to();
                    out.push_str(&String::from_utf8_lossy(&self.pending_bytes[..valid_up_to]));
                    match e.error_len() {
                        Some(bad) => {
                            out.push(char::REPLACEMENT_CHARACTER);
                            self.pending_bytes.drain(..valid_up_to + bad);
                        }
                        None => {
                            self.pending_bytes.drain(..valid_up_to);
                            return out;
                        }
                    }
                }
            }
        }
    }

    fn process_line(&mut self, raw: &str, events: &mut Vec<StreamEvent>) {
        let line = raw.trim();
        if line.is_empty() {
            return;
        }

        let Some(rest) = line.strip_prefix("data:") else {
            events.push(StreamEvent::Message(line.to_string()));
            return;
        };

        let payload = rest.trim_start();
        if payload.is_empty() {
            return;
        }
        if payload == "[DONE]" {
            self.completed = true;
            events.push(StreamEvent::Complete);
            return;
        }

        match serde_json::from_str::<Value>(payload) {
            Ok(value) => self.process_frame(value, events),
            Err(_) if looks_like_control_frame(payload) => {
                debug!(len = payload.len(), "dropping malformed control frame");
            }
            Err(_) => events.push(StreamEvent::Message(payload.to_string())),
        }
    }

    fn process_frame(&mut self, value: Value, events: &mut Vec<StreamEvent>) {
        let Value::Object(frame) = value else {
            return;
        };

        match frame.get("type").and_then(Value::as_str) {
            Some("token") if frame.contains_key("content") => {
                if let Some(content) = text_field(&frame, "content") {
                    events.push(StreamEvent::Message(content));
                }
            }
            Some("error") => events.push(StreamEvent::Error(StreamError::from_frame(&frame))),
            Some("end") => {
                self.completed = true;
                events.push(StreamEvent::Complete);
            }
            Some("start") => {}
            _ => {
                let fallback = FALLBACK_CONTENT_FIELDS
                    .iter()
                    .find_map(|key| text_field(&frame, key));
                if let Some(content) = fallback {
                    events.push(StreamEvent::Message(content));
                }
            }
        }
    }
}

/// A payload that was meant to be a typed JSON frame but failed to parse.
fn looks_like_control_frame(payload: &str) -> bool {
    payload.starts_with('{') && payload.contains("\"type\"")
}

/// String value of a field; non-string scalars are rendered as JSON.
fn text_field(frame: &Map<String, Value>, key: &str) -> Option<String> {
    match frame.get(key)? {
        Value::Null => None,
        Value::String(s) => Some(s.clone()),
        other => Some(other.to_string()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn decode_all(chunks: &[&[u8]]) -> Vec<StreamEvent> {
        let mut decoder = SseDecoder::new();
        let mut events = Vec::new();
        for chunk in chunks {
            events.extend(decoder.feed(chunk));
        }
        events
    }

    fn msg(text: &str) -> StreamEvent {
        StreamEvent::Message(text.to_string())
    }

    #[test]
    fn token_split_across_chunks_yields_one_message() {
        let events = decode_all(&[
            br#"data: {"type":"token","content":"he"#,
            b"llo\"}\n\n",
        ]);
        assert_eq!(events, vec![msg("hello")]);
    }

    #[test]
    fn partial_line_stays_buffered() {
        let mut decoder = SseDecoder::new();
        assert!(decoder.feed(b"data: {\"type\":\"tok").is_empty());
        assert_eq!(decoder.buffered(), "data: {\"type\":\"tok");
        assert!(decoder.feed(b"en\",\"content\":\"x\"}").is_empty());
        assert_eq!(decoder.feed(b"\n"), vec![msg("x")]);
        assert_eq!(decoder.buffered(), "");
    }

    #[test]
    fn done_stops_decoding_rest_of_chunk() {
        let mut decoder = SseDecoder::new();
        let events = decoder.feed(
            b"data: {\"type\":\"token\",\"content\":\"a\"}\n\ndata: [DONE]\n\ndata: {\"type\":\"token\",\"content\":\"b\"}\n\n",
        );
        assert_eq!(events, vec![msg("a"), StreamEvent::Complete]);
        assert!(decoder.is_completed());
        assert!(decoder.feed(b"data: late\n").is_empty());
        assert!(decoder.finish().is_empty());
    }

    #[test]
    fn quota_error_frame_preserves_flag() {
        let events = decode_all(&[
            b"data: {\"type\":\"error\",\"message\":\"quota exceeded\",\"is_quota_error\":true}\n\n",
        ]);
        match events.as_slice() {
            [StreamEvent::Error(err)] => {
                assert_eq!(err.message, "quota exceeded");
                assert!(err.is_quota_error());
                assert_eq!(
                    err.metadata.get("is_quota_error"),
                    Some(&Value::Bool(true))
                );
            }
            other => panic!("expected one error event, got {other:?}"),
        }
    }

    #[test]
    fn error_frame_does_not_complete() {
        let mut decoder = SseDecoder::new();
        let events = decoder.feed(
            b"data: {\"type\":\"error\",\"message\":\"x\"}\ndata: {\"type\":\"token\",\"content\":\"y\"}\n",
        );
        assert_eq!(events.len(), 2);
        assert_eq!(events[1], msg("y"));
        assert!(!decoder.is_completed());
    }

    #[test]
    fn start_is_ignored_and_end_completes() {
        let events = decode_all(&[
            b"data: {\"type\":\"start\"}\n",
            b"data: {\"type\":\"token\",\"content\":\"hi\"}\n",
            b"data: {\"type\":\"end\"}\n",
            b"data: {\"type\":\"token\",\"content\":\"ignored\"}\n",
        ]);
        assert_eq!(events, vec![msg("hi"), StreamEvent::Complete]);
    }

    #[test]
    fn untyped_frames_use_fallback_fields() {
        let events = decode_all(&[
            b"data: {\"chunk\":\"c\"}\n",
            b"data: {\"text\":\"t\"}\n",
            b"data: {\"content\":\"k\",\"text\":\"ignored\"}\n",
            b"data: {\"type\":\"progress\",\"pct\":40}\n",
            b"data: {\"type\":\"token\",\"text\":\"via-fallback\"}\n",
        ]);
        assert_eq!(
            events,
            vec![msg("c"), msg("t"), msg("k"), msg("via-fallback")]
        );
    }

    #[test]
    fn truncated_control_frame_is_dropped() {
        let events = decode_all(&[b"data: {\"type\":\"token\",\"content\":\"unterminated\n"]);
        assert!(events.is_empty(), "got {events:?}");
    }

    #[test]
    fn non_json_payload_is_raw_text() {
        let events = decode_all(&[b"data: plain words\n", b"data: {not a frame\n"]);
        assert_eq!(events, vec![msg("plain words"), msg("{not a frame")]);
    }

    #[test]
    fn lines_without_data_prefix_are_raw_chunks() {
        let events = decode_all(&[b"  raw line  \r\n\n\n"]);
        assert_eq!(events, vec![msg("raw line")]);
    }

    #[test]
    fn empty_data_payload_is_skipped() {
        assert!(decode_all(&[b"data:\n", b"data:   \n"]).is_empty());
    }

    #[test]
    fn multibyte_character_split_across_chunks() {
        let text = "data: {\"type\":\"token\",\"content\":\"caf\u{e9} \u{1f600}\"}\n";
        let bytes = text.as_bytes();
        // Split inside the 4-byte emoji
        let split = bytes.len() - 5;
        let events = decode_all(&[&bytes[..split], &bytes[split..]]);
        assert_eq!(events, vec![msg("caf\u{e9} \u{1f600}")]);
    }

    #[test]
    fn invalid_utf8_is_replaced() {
        let events = decode_all(&[b"data: a\xffb\n"]);
        assert_eq!(events, vec![msg("a\u{fffd}b")]);
    }

    #[test]
    fn finish_flushes_trailing_line_then_completes() {
        let mut decoder = SseDecoder::new();
        assert!(decoder.feed(b"data: {\"type\":\"token\",\"content\":\"tail\"}").is_empty());
        assert_eq!(decoder.finish(), vec![msg("tail"), StreamEvent::Complete]);
        assert!(decoder.is_completed());
    }

    #[test]
    fn non_string_content_is_rendered() {
        let events = decode_all(&[b"data: {\"type\":\"token\",\"content\":42}\n"]);
        assert_eq!(events, vec![msg("42")]);
    }
}
