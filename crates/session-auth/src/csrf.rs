//! CSRF token acquisition
//!
//! Two sources exist: a cookie the server sets (`csrf_token` by default) and a
//! dedicated GET endpoint. Resolution order lives in `CredentialStore`; this
//! module only knows how to talk to each source.

use std::sync::Arc;

use cookie::Cookie;
use reqwest::cookie::{CookieStore, Jar};
use serde::Deserialize;
use tracing::{debug, trace};

use crate::error::{Error, Result};

#[derive(Debug, Deserialize)]
struct CsrfResponse {
    #[serde(alias = "csrfToken", alias = "token")]
    csrf_token: String,
}

/// Endpoint that issues CSRF tokens, plus the client used to reach it.
#[derive(Clone)]
pub struct CsrfSource {
    client: reqwest::Client,
    endpoint: reqwest::Url,
}

impl CsrfSource {
    pub fn new(client: reqwest::Client, endpoint: reqwest::Url) -> Self {
        Self { client, endpoint }
    }

    /// Fetch a fresh token, authenticating with `bearer` when present.
    pub async fn fetch(&self, bearer: Option<&str>) -> Result<String> {
        fetch_csrf_token(&self.client, &self.endpoint, bearer).await
    }
}

/// GET a CSRF token from the dedicated endpoint.
pub async fn fetch_csrf_token(
    client: &reqwest::Client,
    endpoint: &reqwest::Url,
    bearer: Option<&str>,
) -> Result<String> {
    let mut request = client.get(endpoint.clone());
    if let Some(token) = bearer {
        request = request.bearer_auth(token);
    }

    let response = request
        .send()
        .await
        .map_err(|e| Error::Http(format!("CSRF token request failed: {e}")))?;

    let status = response.status();
    if !status.is_success() {
        let body = response
            .text()
            .await
            .unwrap_or_else(|_| String::from("<no body>"));
        return Err(Error::Csrf {
            status: Some(status.as_u16()),
            message: format!("CSRF endpoint returned {status}: {body}"),
        });
    }

    let parsed = response
        .json::<CsrfResponse>()
        .await
        .map_err(|e| Error::Csrf {
            status: None,
            message: format!("invalid CSRF response: {e}"),
        })?;

    if parsed.csrf_token.is_empty() {
        return Err(Error::Csrf {
            status: None,
            message: "CSRF endpoint returned an empty token".into(),
        });
    }
    debug!("fetched CSRF token from endpoint");
    Ok(parsed.csrf_token)
}

/// Reads the CSRF cookie for one origin out of a shared cookie jar.
#[derive(Clone)]
pub struct CookieSource {
    jar: Arc<Jar>,
    origin: reqwest::Url,
    name: String,
}

impl CookieSource {
    pub fn new(jar: Arc<Jar>, origin: reqwest::Url, name: impl Into<String>) -> Self {
        Self {
            jar,
            origin,
            name: name.into(),
        }
    }

    /// Current cookie value, if the server has set one.
    pub fn csrf_token(&self) -> Option<String> {
        let header = self.jar.cookies(&self.origin)?;
        let header = header.to_str().ok()?;
        csrf_from_cookie_header(header, &self.name)
    }
}

/// Extract a named cookie from a `Cookie:` header value (`a=1; b=2`).
///
/// Surrounding double quotes are stripped. Empty values count as absent.
pub fn csrf_from_cookie_header(header: &str, name: &str) -> Option<String> {
    Cookie::split_parse(header)
        .filter_map(|parsed| match parsed {
            Ok(cookie) => Some(cookie),
            Err(e) => {
                trace!(error = %e, "skipping unparsable cookie pair");
                None
            }
        })
        .find(|cookie| cookie.name() == name)
        .map(|cookie| cookie.value_trimmed().to_string())
        .filter(|value| !value.is_empty())
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::Json;
    use axum::http::{HeaderMap, StatusCode};
    use axum::routing::get;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use tokio::net::TcpListener;

    #[test]
    fn cookie_header_lookup() {
        let header = "session=abc; csrf_token=tok123; theme=dark";
        assert_eq!(
            csrf_from_cookie_header(header, "csrf_token").as_deref(),
            Some("tok123")
        );
        assert_eq!(csrf_from_cookie_header(header, "missing"), None);
    }

    #[test]
    fn cookie_header_strips_quotes_and_ignores_empty() {
        assert_eq!(
            csrf_from_cookie_header("csrf_token=\"q\"", "csrf_token").as_deref(),
            Some("q")
        );
        assert_eq!(csrf_from_cookie_header("csrf_token=", "csrf_token"), None);
        assert_eq!(csrf_from_cookie_header("", "csrf_token"), None);
    }

    #[test]
    fn cookie_name_must_match_exactly() {
        assert_eq!(
            csrf_from_cookie_header("xcsrf_token=nope; csrf_token=yes", "csrf_token").as_deref(),
            Some("yes")
        );
    }

    #[test]
    fn malformed_pairs_do_not_hide_the_token() {
        let header = "=orphan; flag; csrf_token=ok; theme=dark";
        assert_eq!(
            csrf_from_cookie_header(header, "csrf_token").as_deref(),
            Some("ok")
        );
    }

    #[test]
    fn cookie_source_reads_jar() {
        let jar = Arc::new(Jar::default());
        let origin: reqwest::Url = "http://app.test/".parse().unwrap();
        jar.add_cookie_str("csrf_token=from-cookie; Path=/", &origin);

        let source = CookieSource::new(jar, origin, "csrf_token");
        assert_eq!(source.csrf_token().as_deref(), Some("from-cookie"));
    }

    #[test]
    fn cookie_source_empty_jar() {
        let source = CookieSource::new(
            Arc::new(Jar::default()),
            "http://app.test/".parse().unwrap(),
            "csrf_token",
        );
        assert_eq!(source.csrf_token(), None);
    }

    #[tokio::test]
    async fn fetch_sends_bearer_and_parses_token() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let hits = Arc::new(AtomicUsize::new(0));
        let hits_server = hits.clone();
        tokio::spawn(async move {
            let app = axum::Router::new().route(
                "/csrf",
                get(move |headers: HeaderMap| {
                    let hits = hits_server.clone();
                    async move {
                        hits.fetch_add(1, Ordering::SeqCst);
                        let auth = headers
                            .get("authorization")
                            .and_then(|v| v.to_str().ok())
                            .unwrap_or("")
                            .to_string();
                        if auth != "Bearer at_1" {
                            return (StatusCode::UNAUTHORIZED, Json(serde_json::json!({})));
                        }
                        (StatusCode::OK, Json(serde_json::json!({"csrfToken": "c1"})))
                    }
                }),
            );
            axum::serve(listener, app).await.unwrap();
        });

        let source = CsrfSource::new(
            reqwest::Client::new(),
            format!("http://{addr}/csrf").parse().unwrap(),
        );
        assert_eq!(source.fetch(Some("at_1")).await.unwrap(), "c1");
        assert!(matches!(
            source.fetch(None).await.unwrap_err(),
            Error::Csrf {
                status: Some(401),
                ..
            }
        ));
        assert_eq!(hits.load(Ordering::SeqCst), 2);
    }
}
