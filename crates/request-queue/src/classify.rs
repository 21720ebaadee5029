//! Failure classification for retry decisions
//!
//! Only two outcomes matter to the retry loop: a permanent failure surfaces
//! immediately, a transient one is retried while attempts remain.

/// Whether a failed unit of work is worth retrying.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorClassification {
    /// Network failure, timeout or 5xx: retry after a delay
    Transient,
    /// Client error (4xx): the same request will fail the same way
    Permanent,
}

/// Errors that can be classified for the retry loop.
pub trait Retryable {
    fn classification(&self) -> ErrorClassification;
}

/// Classify an HTTP status code.
///
/// Everything in `[400, 500)` is permanent, including 401/403 (the auth and
/// CSRF interceptors have already had their single retry by the time such a
/// status reaches the retry loop). Every other status is transient.
pub fn classify_status(status: u16) -> ErrorClassification {
    if (400..500).contains(&status) {
        ErrorClassification::Permanent
    } else {
        ErrorClassification::Transient
    }
}
