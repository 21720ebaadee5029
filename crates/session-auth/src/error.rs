//! Error types for credential and token operations

/// Errors from credential storage, token refresh and CSRF acquisition.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("HTTP request failed: {0}")]
    Http(String),

    #[error("token refresh failed: {0}")]
    TokenRefresh(String),

    #[error("invalid credentials: {0}")]
    InvalidCredentials(String),

    #[error("no refresh token stored")]
    MissingRefreshToken,

    /// `status` is set when the endpoint answered with a non-success code
    #[error("CSRF token request failed: {message}")]
    Csrf {
        status: Option<u16>,
        message: String,
    },

    #[error("session file parse error: {0}")]
    SessionParse(String),

    #[error("I/O error: {0}")]
    Io(String),
}

/// Result alias for auth operations.
pub type Result<T> = std::result::Result<T, Error>;
