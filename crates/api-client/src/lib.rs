//! HTTP client core
//!
//! `ApiClient` is the one entry point collaborators use:
//! - `request()` for unary JSON calls: at most 15 in flight, transient
//!   failures retried with linear backoff, a 401 answered by one token
//!   refresh, a CSRF 403 answered by one token renewal
//! - `open_stream()` for `data:`-framed streaming responses
//! - `clear_credentials()` for logout and idle expiry
//!
//! Building blocks live in sibling crates: `session-auth` (credentials),
//! `request-queue` (dispatcher and retry) and `event-stream` (decoder).

mod auth;
mod client;
pub mod config;
mod context;
mod csrf;
pub mod error;
pub mod metrics;

pub use auth::AuthEvent;
pub use client::{ApiClient, ApiClientBuilder, REQUEST_ID_HEADER, RequestOptions};
pub use config::{ApiConfig, AuthConfig, Config, RetryConfig};
pub use context::RequestContext;
pub use error::{ApiError, Result};

pub use event_stream::{StreamError, StreamEvent, StreamHandle, StreamHandler, StreamState};
pub use reqwest::Method;
