//! Streaming response consumer
//!
//! Reads a long-lived HTTP response whose body is a sequence of
//! `data: <payload>` lines and turns it into message, error and completion
//! callbacks on a [`StreamHandler`]. Decoding is incremental: lines and
//! UTF-8 sequences may be split across network chunks.

pub mod consumer;
pub mod decoder;
pub mod error;

pub use consumer::{StreamHandle, StreamHandler, StreamState, consume, spawn};
pub use decoder::{SseDecoder, StreamEvent};
pub use error::{StreamError, StreamErrorKind};
