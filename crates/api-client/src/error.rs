//! Error taxonomy surfaced by `ApiClient`

use request_queue::{ErrorClassification, Retryable, classify_status};
use serde_json::Value;

/// Failure of a unary API call.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ApiError {
    /// 4xx other than an exhausted 401/403 retry
    #[error("request rejected ({status}): {message}")]
    Client { status: u16, message: String },

    #[error("server error ({status}): {message}")]
    Server { status: u16, message: String },

    #[error("network error: {0}")]
    Network(String),

    #[error("request timed out: {0}")]
    Timeout(String),

    /// The session is gone; credentials were cleared and the user must log in
    #[error("session expired: {0}")]
    AuthExpired(String),

    #[error("CSRF token rejected: {0}")]
    CsrfRejected(String),

    #[error("failed to decode response: {0}")]
    Decode(String),

    #[error("invalid request: {0}")]
    InvalidRequest(String),

    #[error("request dispatch failed: {0}")]
    Dispatch(String),
}

/// Result alias for API calls.
pub type Result<T> = std::result::Result<T, ApiError>;

impl ApiError {
    /// Build from a non-success response status and its body.
    pub fn from_status(status: u16, body: &str) -> Self {
        let message = summarize_error_body(body);
        if (400..500).contains(&status) {
            ApiError::Client { status, message }
        } else {
            ApiError::Server { status, message }
        }
    }

    /// Map a transport failure.
    pub fn from_transport(error: reqwest::Error) -> Self {
        if error.is_timeout() {
            ApiError::Timeout(error.to_string())
        } else {
            ApiError::Network(error.to_string())
        }
    }

    /// HTTP status behind this error, if there was one.
    pub fn status(&self) -> Option<u16> {
        match self {
            ApiError::Client { status, .. } | ApiError::Server { status, .. } => Some(*status),
            ApiError::AuthExpired(_) => Some(401),
            ApiError::CsrfRejected(_) => Some(403),
            _ => None,
        }
    }

    pub fn is_auth_expired(&self) -> bool {
        matches!(self, ApiError::AuthExpired(_))
    }
}

impl Retryable for ApiError {
    fn classification(&self) -> ErrorClassification {
        match self {
            ApiError::Server { status, .. } => classify_status(*status),
            ApiError::Network(_) | ApiError::Timeout(_) => ErrorClassification::Transient,
            _ => ErrorClassification::Permanent,
        }
    }
}

impl From<session_auth::Error> for ApiError {
    fn from(error: session_auth::Error) -> Self {
        match error {
            session_auth::Error::Http(msg) => ApiError::Network(msg),
            session_auth::Error::Csrf {
                status: Some(status),
                message,
            } => {
                let message = format!("CSRF token unavailable: {message}");
                if (400..500).contains(&status) {
                    ApiError::Client { status, message }
                } else {
                    ApiError::Server { status, message }
                }
            }
            session_auth::Error::Csrf {
                status: None,
                message,
            } => ApiError::Decode(format!("CSRF token unavailable: {message}")),
            other => ApiError::AuthExpired(other.to_string()),
        }
    }
}

/// Human-readable message from an error body.
///
/// JSON bodies contribute their `message`, `detail` or `error` field (the
/// latter may itself be an object with a `message`); anything else is
/// returned trimmed.
pub fn summarize_error_body(body: &str) -> String {
    let trimmed = body.trim();
    let Ok(value) = serde_json::from_str::<Value>(trimmed) else {
        return trimmed.to_string();
    };

    for key in ["message", "detail", "error"] {
        match value.get(key) {
            Some(Value::String(s)) => return s.clone(),
            Some(Value::Object(inner)) => {
                if let Some(Value::String(s)) = inner.get("message") {
                    return s.clone();
                }
            }
            _ => {}
        }
    }
    trimmed.to_string()
}
