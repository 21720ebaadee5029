//! Wire-level constants shared with the backend
//!
//! Paths are relative to the API base URL. They are defaults only; the client
//! configuration may override the refresh path, CSRF path, cookie name and
//! the CSRF exemption list.

use std::time::Duration;

/// Refresh endpoint: exchanges a refresh token for a new token pair
pub const DEFAULT_REFRESH_PATH: &str = "/api/v1/auth/refresh";

/// Dedicated endpoint that issues a CSRF token
pub const DEFAULT_CSRF_PATH: &str = "/api/v1/auth/csrf-token";

/// Cookie the server uses to hand out a CSRF token
pub const DEFAULT_CSRF_COOKIE: &str = "csrf_token";

/// Header carrying the CSRF token on mutating requests
pub const CSRF_HEADER: &str = "x-csrf-token";

/// Path prefixes the server exempts from CSRF checking.
///
/// Bootstrap and auth endpoints run before a session (and therefore a CSRF
/// token) exists; the bulk endpoints are exempted server-side.
pub const DEFAULT_CSRF_EXEMPT_PATHS: &[&str] = &[
    "/api/v1/auth/login",
    "/api/v1/auth/register",
    "/api/v1/auth/refresh",
    "/api/v1/auth/oauth",
    "/api/v1/auth/csrf-token",
    "/api/v1/auth/forgot-password",
    "/api/v1/auth/reset-password",
    "/api/v1/bootstrap",
    "/api/v1/bulk/",
];

/// Credentials are discarded after this long without a successful request
pub const DEFAULT_IDLE_TIMEOUT: Duration = Duration::from_secs(24 * 60 * 60);
