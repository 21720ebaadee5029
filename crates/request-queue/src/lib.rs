//! Request queuing and retry for the API client
//!
//! Two independent building blocks that the facade stacks together:
//! - `Dispatcher` caps the number of unary operations in flight (15 by
//!   default) and starts queued ones in FIFO order
//! - `RetryPolicy` retries transient failures with linear backoff and
//!   surfaces permanent (4xx) failures immediately
//!
//! Neither knows anything about HTTP beyond `classify_status`; callers plug
//! their own error type in through the `Retryable` trait.

pub mod classify;
pub mod dispatcher;
pub mod error;
pub mod retry;

pub use classify::{ErrorClassification, Retryable, classify_status};
pub use dispatcher::{DEFAULT_MAX_CONCURRENCY, Dispatcher};
pub use error::{Error, Result};
pub use retry::{DEFAULT_BASE_DELAY, DEFAULT_MAX_RETRIES, RetryPolicy};
