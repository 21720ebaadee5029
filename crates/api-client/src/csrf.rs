//! CSRF protection for mutating requests
//!
//! POST, PUT, PATCH and DELETE carry an `X-CSRF-Token` header unless their
//! path starts with one of the exempt prefixes. A 403 on a protected call,
//! or a 403 whose body mentions CSRF, renews the token once.

use std::sync::Arc;

use common::Secret;
use reqwest::Method;
use session_auth::{CredentialStore, CsrfSource};
use tracing::{debug, warn};

use crate::error::Result;
use crate::metrics::record_csrf_refresh;

/// Lower-case fragments of a 403 body that indicate a CSRF rejection.
const CSRF_FAILURE_MARKERS: &[&str] = &["csrf", "xsrf", "token mismatch", "forgery"];

pub(crate) struct CsrfGuard {
    source: CsrfSource,
    store: Arc<CredentialStore>,
    exempt_paths: Vec<String>,
}

impl CsrfGuard {
    pub(crate) fn new(
        source: CsrfSource,
        store: Arc<CredentialStore>,
        exempt_paths: Vec<String>,
    ) -> Self {
        Self {
            source,
            store,
            exempt_paths,
        }
    }

    /// Whether a request must carry a CSRF token.
    pub(crate) fn is_protected(&self, method: &Method, path: &str) -> bool {
        is_mutating(method) && !self.is_exempt(path)
    }

    fn is_exempt(&self, path: &str) -> bool {
        let path = path.split('?').next().unwrap_or(path);
        self.exempt_paths
            .iter()
            .any(|prefix| path.starts_with(prefix.as_str()))
    }

    /// Current token: cookie, cache, or a fetch from the endpoint.
    pub(crate) async fn token(&self) -> Result<Secret<String>> {
        Ok(self.store.csrf_token(&self.source).await?)
    }

    /// Invalidate the cached token and fetch a fresh one.
    pub(crate) async fn renew(&self) -> Result<Secret<String>> {
        match self.store.renew_csrf_token(&self.source).await {
            Ok(token) => {
                debug!("CSRF token renewed");
                record_csrf_refresh("success");
                Ok(token)
            }
            Err(e) => {
                warn!(error = %e, "CSRF token renewal failed");
                record_csrf_refresh("failed");
                Err(e.into())
            }
        }
    }
}

fn is_mutating(method: &Method) -> bool {
    matches!(
        *method,
        Method::POST | Method::PUT | Method::PATCH | Method::DELETE
    )
}

/// Heuristic match on a 403 response body.
pub(crate) fn looks_like_csrf_failure(body: &str) -> bool {
    let body = body.to_ascii_lowercase();
    CSRF_FAILURE_MARKERS
        .iter()
        .any(|marker| body.contains(marker))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn guard(exempt: &[&str]) -> CsrfGuard {
        CsrfGuard::new(
            CsrfSource::new(
                reqwest::Client::new(),
                reqwest::Url::parse("http://127.0.0.1:9/csrf").unwrap(),
            ),
            Arc::new(CredentialStore::new()),
            exempt.iter().map(|p| p.to_string()).collect(),
        )
    }

    #[test]
    fn only_mutating_methods_are_protected() {
        let guard = guard(&[]);
        for method in [Method::POST, Method::PUT, Method::PATCH, Method::DELETE] {
            assert!(guard.is_protected(&method, "/api/v1/items"), "{method}");
        }
        for method in [Method::GET, Method::HEAD, Method::OPTIONS] {
            assert!(!guard.is_protected(&method, "/api/v1/items"), "{method}");
        }
    }

    #[test]
    fn exempt_prefixes_skip_protection() {
        let guard = guard(&["/api/v1/auth/login", "/api/v1/bulk/"]);
        assert!(!guard.is_protected(&Method::POST, "/api/v1/auth/login"));
        assert!(!guard.is_protected(&Method::POST, "/api/v1/bulk/import?dry=1"));
        assert!(guard.is_protected(&Method::POST, "/api/v1/bulk"));
        assert!(guard.is_protected(&Method::DELETE, "/api/v1/items/7"));
    }

    #[test]
    fn csrf_body_heuristic() {
        assert!(looks_like_csrf_failure(r#"{"detail":"CSRF token missing"}"#));
        assert!(looks_like_csrf_failure("XSRF check failed"));
        assert!(looks_like_csrf_failure("Token mismatch"));
        assert!(looks_like_csrf_failure("possible request forgery"));
        assert!(!looks_like_csrf_failure(r#"{"detail":"Insufficient permissions"}"#));
        assert!(!looks_like_csrf_failure(""));
    }
}
