//! `ApiClient` facade
//!
//! Unary calls flow through three layers, outermost first:
//! 1. the `Dispatcher`, which admits at most `max_concurrency` calls at once
//! 2. the `RetryPolicy`, which retries transient failures with linear backoff
//! 3. one attempt, which attaches bearer and CSRF tokens and recovers once
//!    from a 401 (token refresh) and once from a CSRF 403 (token renewal)
//!
//! The `RequestContext` recording those one-shot recoveries is threaded
//! through every attempt of a call, so a transient retry never re-arms them.
//! Streams skip the dispatcher, the retry loop and CSRF entirely.

use std::path::PathBuf;
use std::sync::Arc;
use std::time::{Duration, Instant};

use common::Secret;
use event_stream::{StreamError, StreamEvent, StreamHandle, StreamHandler};
use request_queue::{DEFAULT_MAX_CONCURRENCY, Dispatcher, RetryPolicy};
use reqwest::cookie::Jar;
use reqwest::header::{ACCEPT, CONTENT_TYPE, HeaderMap};
use reqwest::{Method, StatusCode, Url};
use serde::de::DeserializeOwned;
use serde_json::Value;
use session_auth::{
    CSRF_HEADER, CookieSource, CredentialStore, CsrfSource, DEFAULT_CSRF_COOKIE,
    DEFAULT_CSRF_EXEMPT_PATHS, DEFAULT_CSRF_PATH, DEFAULT_IDLE_TIMEOUT, DEFAULT_REFRESH_PATH,
    SessionFile,
};
use tokio::sync::{broadcast, mpsc};
use tracing::{debug, info, instrument, warn};

use crate::auth::{AuthEvent, AuthRefresher};
use crate::config::Config;
use crate::context::RequestContext;
use crate::csrf::{CsrfGuard, looks_like_csrf_failure};
use crate::error::{ApiError, Result, summarize_error_body};
use crate::metrics::record_request;

/// Header carrying the per-call correlation id.
pub const REQUEST_ID_HEADER: &str = "x-request-id";

const AUTH_EVENT_CAPACITY: usize = 16;

/// Per-call extras.
#[derive(Debug, Clone, Default)]
pub struct RequestOptions {
    pub headers: HeaderMap,
    /// Overrides the client-wide timeout for this call
    pub timeout: Option<Duration>,
    pub query: Vec<(String, String)>,
}

/// One logical unary call, shared by all of its attempts.
struct Call {
    method: Method,
    path: String,
    url: Url,
    body: Option<Value>,
    headers: HeaderMap,
    timeout: Option<Duration>,
    request_id: String,
    protected: bool,
}

struct Inner {
    http: reqwest::Client,
    /// Same cookie jar as `http`, without a total-request timeout
    stream_http: reqwest::Client,
    base_url: Url,
    dispatcher: Dispatcher,
    retry: RetryPolicy,
    store: Arc<CredentialStore>,
    auth: AuthRefresher,
    csrf: CsrfGuard,
    events: broadcast::Sender<AuthEvent>,
    idle_timeout: Duration,
}

/// HTTP client for one server and one user session.
///
/// Cheap to clone; clones share the queue, the credentials and the
/// connection pool.
#[derive(Clone)]
pub struct ApiClient {
    inner: Arc<Inner>,
}

impl ApiClient {
    pub fn builder(base_url: impl Into<String>) -> ApiClientBuilder {
        ApiClientBuilder::new(base_url)
    }

    /// Build a client from loaded configuration.
    pub async fn from_config(config: &Config) -> common::Result<Self> {
        let mut builder = Self::builder(config.api.base_url.clone())
            .timeout(Duration::from_secs(config.api.timeout_secs))
            .max_concurrency(config.api.max_concurrency)
            .retry_policy(config.retry.policy())
            .refresh_path(config.auth.refresh_path.clone())
            .csrf_path(config.auth.csrf_path.clone())
            .csrf_cookie(config.auth.csrf_cookie.clone())
            .csrf_exempt_paths(config.auth.csrf_exempt_paths.clone())
            .idle_timeout(config.auth.idle_timeout());
        if let Some(path) = &config.auth.session_file {
            builder = builder.session_file(path.clone());
        }
        builder.build().await
    }

    /// Issue a unary call: queued, retried, and auth/CSRF protected.
    ///
    /// An empty response body decodes as JSON `null`.
    pub async fn request<T: DeserializeOwned>(
        &self,
        method: Method,
        path: &str,
        body: Option<Value>,
        options: RequestOptions,
    ) -> Result<T> {
        let call = Arc::new(self.inner.prepare(method, path, body, options)?);
        let inner = Arc::clone(&self.inner);
        let value = self
            .inner
            .dispatcher
            .enqueue(move || inner.execute(call))
            .await
            .map_err(|e| ApiError::Dispatch(e.to_string()))??;
        serde_json::from_value(value).map_err(|e| ApiError::Decode(e.to_string()))
    }

    pub async fn get<T: DeserializeOwned>(&self, path: &str) -> Result<T> {
        self.request(Method::GET, path, None, RequestOptions::default())
            .await
    }

    pub async fn post<T: DeserializeOwned>(&self, path: &str, body: Value) -> Result<T> {
        self.request(Method::POST, path, Some(body), RequestOptions::default())
            .await
    }

    /// Open a stream and deliver its events to `handler` on a background task.
    ///
    /// With a body the stream is opened with POST, otherwise with GET. Only
    /// the bearer token is attached; the call is neither queued nor retried.
    pub fn open_stream<H: StreamHandler>(
        &self,
        path: &str,
        body: Option<Value>,
        handler: H,
    ) -> Result<StreamHandle> {
        let url = self.inner.url_for(&normalize_path(path), &[])?;
        let inner = Arc::clone(&self.inner);
        let connect = async move {
            let method = if body.is_some() { Method::POST } else { Method::GET };
            let mut request = inner
                .stream_http
                .request(method, url)
                .header(ACCEPT, "text/event-stream");
            if let Some(token) = inner.store.access_token().await {
                request = request.bearer_auth(token.expose());
            }
            if let Some(body) = &body {
                request = request.json(body);
            }
            request
                .send()
                .await
                .map_err(|e| StreamError::connect(format!("failed to open stream: {e}")))
        };
        debug!(path, "opening stream");
        Ok(event_stream::spawn(connect, handler))
    }

    /// Like [`open_stream`](Self::open_stream), delivering events on a channel.
    pub fn open_stream_events(
        &self,
        path: &str,
        body: Option<Value>,
    ) -> Result<(StreamHandle, mpsc::UnboundedReceiver<StreamEvent>)> {
        let (tx, rx) = mpsc::unbounded_channel();
        let handle = self.open_stream(path, body, tx)?;
        Ok((handle, rx))
    }

    /// Drop every credential (logout). Any refresh still in flight is
    /// discarded when it resolves.
    pub async fn clear_credentials(&self) {
        self.inner.store.clear_all().await;
        let _ = self.inner.events.send(AuthEvent::CredentialsCleared);
        info!("credentials cleared by request");
    }

    /// Clear credentials if the session has been idle for at least
    /// `max_idle`. Returns whether it expired.
    pub async fn expire_if_idle(&self, max_idle: Duration) -> bool {
        let store = &self.inner.store;
        if !store.is_authenticated().await {
            return false;
        }
        match store.idle_for().await {
            Some(idle) if idle >= max_idle => {
                info!(idle_secs = idle.as_secs(), "session idle, expiring");
                store.clear_all().await;
                let _ = self.inner.events.send(AuthEvent::CredentialsCleared);
                true
            }
            _ => false,
        }
    }

    /// Configured inactivity limit for [`expire_if_idle`](Self::expire_if_idle).
    pub fn idle_timeout(&self) -> Duration {
        self.inner.idle_timeout
    }

    /// Install a token pair obtained by a login flow.
    pub async fn set_tokens(&self, access: impl Into<String>, refresh: impl Into<String>) {
        self.inner
            .store
            .set_tokens(Secret::new(access.into()), Secret::new(refresh.into()))
            .await;
    }

    pub async fn is_authenticated(&self) -> bool {
        self.inner.store.is_authenticated().await
    }

    /// Session lifecycle notifications.
    pub fn subscribe(&self) -> broadcast::Receiver<AuthEvent> {
        self.inner.events.subscribe()
    }

    pub fn store(&self) -> &Arc<CredentialStore> {
        &self.inner.store
    }

    pub fn dispatcher(&self) -> &Dispatcher {
        &self.inner.dispatcher
    }

    pub fn base_url(&self) -> &Url {
        &self.inner.base_url
    }
}

impl Inner {
    fn prepare(
        &self,
        method: Method,
        path: &str,
        body: Option<Value>,
        options: RequestOptions,
    ) -> Result<Call> {
        let path = normalize_path(path);
        let url = self.url_for(&path, &options.query)?;
        let protected = self.csrf.is_protected(&method, &path);
        Ok(Call {
            method,
            path,
            url,
            body,
            headers: options.headers,
            timeout: options.timeout,
            request_id: format!("req_{}", uuid::Uuid::new_v4().simple()),
            protected,
        })
    }

    fn url_for(&self, path: &str, query: &[(String, String)]) -> Result<Url> {
        let target = path.split(['?', '#']).next().unwrap_or(path);
        if target.contains("://") {
            return Err(ApiError::InvalidRequest(format!(
                "expected a path relative to the base URL, got {path}"
            )));
        }
        let joined = format!("{}{}", self.base_url.as_str().trim_end_matches('/'), path);
        let mut url = Url::parse(&joined)
            .map_err(|e| ApiError::InvalidRequest(format!("invalid path {path}: {e}")))?;
        if !query.is_empty() {
            url.query_pairs_mut().extend_pairs(query.iter());
        }
        Ok(url)
    }

    #[instrument(
        skip_all,
        fields(request_id = %call.request_id, method = %call.method, path = %call.path)
    )]
    async fn execute(self: Arc<Self>, call: Arc<Call>) -> Result<Value> {
        let inner = &self;
        self.retry
            .run_with(RequestContext::default(), |ctx| {
                let inner = Arc::clone(inner);
                let call = Arc::clone(&call);
                async move { inner.attempt(&call, ctx).await }
            })
            .await
    }

    /// One retry-loop attempt, including its 401 and 403 recoveries.
    async fn attempt(
        &self,
        call: &Call,
        mut ctx: RequestContext,
    ) -> (RequestContext, Result<Value>) {
        let mut renewed_csrf: Option<Secret<String>> = None;
        loop {
            let access = self.store.access_snapshot().await;
            let csrf = match &renewed_csrf {
                Some(token) => Some(token.clone()),
                None if call.protected => match self.csrf.token().await {
                    Ok(token) => Some(token),
                    // The CSRF endpoint wants a live session too
                    Err(ApiError::Client { status: 401, .. }) => {
                        match self.recover_unauthorized(&mut ctx, access.version).await {
                            Ok(()) => continue,
                            Err(e) => return (ctx, Err(e)),
                        }
                    }
                    Err(e) => return (ctx, Err(e)),
                },
                None => None,
            };

            let response = match self.send(call, access.token.as_ref(), csrf.as_ref()).await {
                Ok(response) => response,
                Err(e) => return (ctx, Err(e)),
            };
            let status = response.status();

            if status == StatusCode::UNAUTHORIZED {
                match self.recover_unauthorized(&mut ctx, access.version).await {
                    Ok(()) => continue,
                    Err(e) => return (ctx, Err(e)),
                }
            }

            if status == StatusCode::FORBIDDEN {
                let body = response.text().await.unwrap_or_default();
                let csrf_failure = call.protected || looks_like_csrf_failure(&body);
                if !ctx.attempted_csrf_refresh && csrf_failure {
                    ctx = ctx.with_csrf_refresh();
                    info!("request forbidden, renewing CSRF token");
                    match self.csrf.renew().await {
                        Ok(token) => {
                            renewed_csrf = Some(token);
                            continue;
                        }
                        Err(ApiError::Client { status: 401, .. }) => {
                            match self.recover_unauthorized(&mut ctx, access.version).await {
                                Ok(()) => continue,
                                Err(e) => return (ctx, Err(e)),
                            }
                        }
                        Err(e) => return (ctx, Err(e)),
                    }
                }
                let error = if ctx.attempted_csrf_refresh {
                    ApiError::CsrfRejected(summarize_error_body(&body))
                } else {
                    ApiError::from_status(status.as_u16(), &body)
                };
                return (ctx, Err(error));
            }

            if !status.is_success() {
                let body = response.text().await.unwrap_or_default();
                return (ctx, Err(ApiError::from_status(status.as_u16(), &body)));
            }

            self.store.touch().await;
            return (ctx, decode_body(response).await);
        }
    }

    /// Refresh once per logical call; a second 401 ends the session.
    async fn recover_unauthorized(
        &self,
        ctx: &mut RequestContext,
        stale_version: u64,
    ) -> Result<()> {
        if ctx.attempted_auth_refresh {
            return Err(self.auth.expire("unauthorized after token refresh").await);
        }
        *ctx = ctx.with_auth_refresh();
        info!("access token rejected, refreshing");
        self.auth.refresh(stale_version).await
    }

    async fn send(
        &self,
        call: &Call,
        bearer: Option<&Secret<String>>,
        csrf: Option<&Secret<String>>,
    ) -> Result<reqwest::Response> {
        let mut request = self
            .http
            .request(call.method.clone(), call.url.clone())
            .headers(call.headers.clone())
            .header(REQUEST_ID_HEADER, call.request_id.as_str());
        if let Some(timeout) = call.timeout {
            request = request.timeout(timeout);
        }
        if let Some(token) = bearer {
            request = request.bearer_auth(token.expose());
        }
        if let Some(token) = csrf {
            request = request.header(CSRF_HEADER, token.expose().as_str());
        }
        if let Some(body) = &call.body {
            request = request.json(body);
        }

        let started = Instant::now();
        match request.send().await {
            Ok(response) => {
                let status = response.status();
                record_request(
                    call.method.as_str(),
                    status.as_str(),
                    started.elapsed().as_secs_f64(),
                );
                debug!(status = status.as_u16(), "response received");
                Ok(response)
            }
            Err(e) => {
                record_request(call.method.as_str(), "error", started.elapsed().as_secs_f64());
                warn!(error = %e, "request failed");
                Err(ApiError::from_transport(e))
            }
        }
    }
}

/// Decode a success body. Empty bodies are `null`; non-JSON bodies served
/// without a JSON content type come back as a string.
async fn decode_body(response: reqwest::Response) -> Result<Value> {
    let is_json = response
        .headers()
        .get(CONTENT_TYPE)
        .and_then(|v| v.to_str().ok())
        .is_some_and(|v| v.contains("json"));
    let bytes = response.bytes().await.map_err(ApiError::from_transport)?;
    if bytes.iter().all(u8::is_ascii_whitespace) {
        return Ok(Value::Null);
    }
    match serde_json::from_slice(&bytes) {
        Ok(value) => Ok(value),
        Err(_) if !is_json => Ok(Value::String(String::from_utf8_lossy(&bytes).into_owned())),
        Err(e) => Err(ApiError::Decode(e.to_string())),
    }
}

fn normalize_path(path: &str) -> String {
    if path.starts_with('/') {
        path.to_string()
    } else {
        format!("/{path}")
    }
}

/// Builder for [`ApiClient`].
pub struct ApiClientBuilder {
    base_url: String,
    timeout: Duration,
    max_concurrency: usize,
    retry: RetryPolicy,
    refresh_path: String,
    csrf_path: String,
    csrf_cookie: String,
    csrf_exempt_paths: Vec<String>,
    session_file: Option<PathBuf>,
    idle_timeout: Duration,
}

impl ApiClientBuilder {
    pub fn new(base_url: impl Into<String>) -> Self {
        Self {
            base_url: base_url.into(),
            timeout: Duration::from_secs(30),
            max_concurrency: DEFAULT_MAX_CONCURRENCY,
            retry: RetryPolicy::default(),
            refresh_path: DEFAULT_REFRESH_PATH.to_string(),
            csrf_path: DEFAULT_CSRF_PATH.to_string(),
            csrf_cookie: DEFAULT_CSRF_COOKIE.to_string(),
            csrf_exempt_paths: DEFAULT_CSRF_EXEMPT_PATHS
                .iter()
                .map(|p| p.to_string())
                .collect(),
            session_file: None,
            idle_timeout: DEFAULT_IDLE_TIMEOUT,
        }
    }

    pub fn timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    pub fn max_concurrency(mut self, max_concurrency: usize) -> Self {
        self.max_concurrency = max_concurrency;
        self
    }

    pub fn retry_policy(mut self, retry: RetryPolicy) -> Self {
        self.retry = retry;
        self
    }

    pub fn refresh_path(mut self, path: impl Into<String>) -> Self {
        self.refresh_path = path.into();
        self
    }

    pub fn csrf_path(mut self, path: impl Into<String>) -> Self {
        self.csrf_path = path.into();
        self
    }

    pub fn csrf_cookie(mut self, name: impl Into<String>) -> Self {
        self.csrf_cookie = name.into();
        self
    }

    pub fn csrf_exempt_paths(mut self, paths: Vec<String>) -> Self {
        self.csrf_exempt_paths = paths;
        self
    }

    pub fn session_file(mut self, path: impl Into<PathBuf>) -> Self {
        self.session_file = Some(path.into());
        self
    }

    pub fn idle_timeout(mut self, idle_timeout: Duration) -> Self {
        self.idle_timeout = idle_timeout;
        self
    }

    /// Wire up the client, loading the session file if one is configured.
    pub async fn build(self) -> common::Result<ApiClient> {
        let base_url = Url::parse(&self.base_url).map_err(|e| common::Error::InvalidUrl {
            url: self.base_url.clone(),
            reason: e.to_string(),
        })?;
        let endpoint = |path: &str| {
            let joined = format!("{}{}", base_url.as_str().trim_end_matches('/'), path);
            Url::parse(&joined).map_err(|e| common::Error::InvalidUrl {
                url: joined.clone(),
                reason: e.to_string(),
            })
        };
        let refresh_url = endpoint(&self.refresh_path)?;
        let csrf_url = endpoint(&self.csrf_path)?;

        let jar = Arc::new(Jar::default());
        let http = reqwest::Client::builder()
            .cookie_provider(Arc::clone(&jar))
            .timeout(self.timeout)
            .build()
            .map_err(|e| common::Error::Config(format!("failed to build HTTP client: {e}")))?;
        let stream_http = reqwest::Client::builder()
            .cookie_provider(Arc::clone(&jar))
            .connect_timeout(self.timeout)
            .build()
            .map_err(|e| common::Error::Config(format!("failed to build HTTP client: {e}")))?;

        let store = match self.session_file {
            Some(path) => CredentialStore::load(SessionFile::new(path))
                .await
                .map_err(|e| common::Error::Config(format!("failed to load session: {e}")))?,
            None => CredentialStore::new(),
        };
        let store = Arc::new(store.with_cookies(CookieSource::new(
            jar,
            base_url.clone(),
            self.csrf_cookie,
        )));

        let (events, _) = broadcast::channel(AUTH_EVENT_CAPACITY);
        let auth = AuthRefresher::new(
            http.clone(),
            refresh_url,
            Arc::clone(&store),
            events.clone(),
        );
        let csrf = CsrfGuard::new(
            CsrfSource::new(http.clone(), csrf_url),
            Arc::clone(&store),
            self.csrf_exempt_paths,
        );

        info!(
            base_url = %base_url,
            max_concurrency = self.max_concurrency,
            max_retries = self.retry.max_retries(),
            "API client ready"
        );

        Ok(ApiClient {
            inner: Arc::new(Inner {
                http,
                stream_http,
                base_url,
                dispatcher: Dispatcher::new(self.max_concurrency),
                retry: self.retry,
                store,
                auth,
                csrf,
                events,
                idle_timeout: self.idle_timeout,
            }),
        })
    }
}
