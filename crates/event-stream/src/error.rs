//! Stream error type delivered to `on_error`

use serde_json::{Map, Value};

/// Server metadata fields copied verbatim from `error` frames.
const PASSTHROUGH_FIELDS: &[&str] = &["error_code", "is_quota_error", "original_error"];

/// Where a stream failure came from.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StreamErrorKind {
    /// The server sent an explicit `error` frame
    Server,
    /// Opening the stream returned a non-2xx status
    Status(u16),
    /// The connection could not be established
    Connect,
    /// Reading the body failed mid-stream
    Transport,
}

/// Error delivered through `StreamHandler::on_error`.
#[derive(Debug, Clone, PartialEq, thiserror::Error)]
#[error("{message}")]
pub struct StreamError {
    pub kind: StreamErrorKind,
    pub message: String,
    /// Server-supplied metadata (`error_code`, `is_quota_error`,
    /// `original_error`), untouched
    pub metadata: Map<String, Value>,
}

impl StreamError {
    /// Build from a decoded `{"type":"error", ...}` frame.
    pub fn from_frame(frame: &Map<String, Value>) -> Self {
        let message = ["message", "content"]
            .iter()
            .find_map(|key| frame.get(*key).and_then(Value::as_str))
            .unwrap_or("stream error")
            .to_string();
        let metadata = PASSTHROUGH_FIELDS
            .iter()
            .filter_map(|key| frame.get(*key).map(|v| (key.to_string(), v.clone())))
            .collect();
        Self {
            kind: StreamErrorKind::Server,
            message,
            metadata,
        }
    }

    pub fn status(status: u16, body: &str) -> Self {
        let detail = summarize_body(body);
        let message = if detail.is_empty() {
            format!("stream request failed with status {status}")
        } else {
            format!("stream request failed with status {status}: {detail}")
        };
        Self {
            kind: StreamErrorKind::Status(status),
            message,
            metadata: Map::new(),
        }
    }

    pub fn connect(message: impl Into<String>) -> Self {
        Self {
            kind: StreamErrorKind::Connect,
            message: message.into(),
            metadata: Map::new(),
        }
    }

    pub fn transport(message: impl Into<String>) -> Self {
        Self {
            kind: StreamErrorKind::Transport,
            message: message.into(),
            metadata: Map::new(),
        }
    }

    pub fn error_code(&self) -> Option<&Value> {
        self.metadata.get("error_code")
    }

    /// `true` only when the server sent `"is_quota_error": true`.
    pub fn is_quota_error(&self) -> bool {
        self.metadata
            .get("is_quota_error")
            .and_then(Value::as_bool)
            .unwrap_or(false)
    }

    pub fn original_error(&self) -> Option<&Value> {
        self.metadata.get("original_error")
    }
}

/// Pull a human-readable message out of an error body.
fn summarize_body(body: &str) -> String {
    let trimmed = body.trim();
    if let Ok(value) = serde_json::from_str::<Value>(trimmed) {
        let found = ["detail", "message", "error"]
            .iter()
            .find_map(|key| value.get(*key).and_then(Value::as_str));
        if let Some(found) = found {
            return found.to_string();
        }
    }
    trimmed.to_string()
}
