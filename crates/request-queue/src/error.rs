//! Error types for queue operations

/// Errors raised by the dispatcher itself, never by the queued work.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("queued operation dropped before settling: {0}")]
    Dropped(String),
}

/// Result alias for queue operations.
pub type Result<T> = std::result::Result<T, Error>;
