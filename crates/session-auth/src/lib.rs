//! Session credentials for the API client
//!
//! Owns the access, refresh and CSRF tokens of one browser-style session and
//! the two endpoint calls that renew them. Nothing here knows about request
//! queuing or retries; the interceptors in `api-client` drive these pieces.
//!
//! Credential flow:
//! 1. An external login flow hands over a token pair via `CredentialStore::set_tokens()`
//! 2. Requests read the bearer token with `CredentialStore::access_snapshot()`
//! 3. On 401 the interceptor calls `token::refresh_session()` and writes the
//!    result with `CredentialStore::replace_tokens()`
//! 4. Mutating requests resolve a CSRF token via `CredentialStore::csrf_token()`
//! 5. Logout or idle expiry calls `CredentialStore::clear_all()`

pub mod constants;
pub mod credentials;
pub mod csrf;
pub mod error;
pub mod session;
pub mod token;

pub use constants::*;
pub use credentials::{AccessSnapshot, Credential, CredentialStore};
pub use csrf::{CookieSource, CsrfSource, csrf_from_cookie_header, fetch_csrf_token};
pub use error::{Error, Result};
pub use session::{PersistedSession, SessionFile, now_millis};
pub use token::{TokenPair, refresh_session};
