//! Metric recording for the API client
//!
//! Emitted through the `metrics` facade; installing a recorder is the
//! embedding process's job. Without one every call here is a no-op.
//!
//! - `api_requests_total` (counter): labels `method`, `status`
//! - `api_request_duration_seconds` (histogram): label `status`
//! - `api_auth_refresh_total` (counter): label `outcome`
//! - `api_csrf_refresh_total` (counter): label `outcome`
//!
//! The dispatcher, retry loop and stream consumer record their own metrics
//! (`api_dispatcher_*`, `api_retries_total`, `api_streams_total`).

/// Histogram buckets for `api_request_duration_seconds`, 5ms to 60s.
pub const DURATION_BUCKETS: &[f64] = &[
    0.005, 0.01, 0.025, 0.05, 0.1, 0.25, 0.5, 1.0, 2.5, 5.0, 10.0, 30.0, 60.0,
];

/// Record one HTTP exchange. `status` is the response code, or `"error"`
/// when no response arrived.
pub fn record_request(method: &str, status: &str, duration_secs: f64) {
    metrics::counter!(
        "api_requests_total",
        "method" => method.to_string(),
        "status" => status.to_string()
    )
    .increment(1);
    metrics::histogram!("api_request_duration_seconds", "status" => status.to_string())
        .record(duration_secs);
}

/// Record the outcome of an access-token refresh (`success`, `failed`,
/// `reused`, `discarded`).
pub fn record_auth_refresh(outcome: &'static str) {
    metrics::counter!("api_auth_refresh_total", "outcome" => outcome).increment(1);
}

/// Record the outcome of a forced CSRF renewal (`success`, `failed`).
pub fn record_csrf_refresh(outcome: &'static str) {
    metrics::counter!("api_csrf_refresh_total", "outcome" => outcome).increment(1);
}
