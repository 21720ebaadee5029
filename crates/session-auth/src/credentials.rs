//! In-process credential store
//!
//! Holds the access token, refresh token and CSRF token for one session. A
//! tokio Mutex serializes every read and write, so a logout racing a token
//! refresh always resolves deterministically.
//!
//! Two counters drive the concurrency rules:
//! - `version` increments whenever the access token changes. Callers that saw
//!   a 401 compare versions to find out whether someone else already refreshed.
//! - `epoch` increments on `clear_all()`. A refresh captures the epoch before
//!   its network call and its write is dropped if the epoch has since moved,
//!   so a refresh that resolves after logout can never repopulate the store.

use std::time::Duration;

use common::Secret;
use tokio::sync::Mutex;
use tracing::{debug, info, warn};

use crate::csrf::{CookieSource, CsrfSource};
use crate::error::Result;
use crate::session::{PersistedSession, SessionFile, now_millis};

/// Minimum spacing between last-activity writes to the session file.
const ACTIVITY_PERSIST_INTERVAL_MS: u64 = 60_000;

/// The credentials of a single session.
///
/// `issued_at` is the unix millisecond timestamp at which the current access
/// token was stored.
#[derive(Debug, Clone, Default)]
pub struct Credential {
    pub access_token: Option<Secret<String>>,
    pub issued_at: Option<u64>,
    pub refresh_token: Option<Secret<String>>,
    pub csrf_token: Option<Secret<String>>,
}

/// Access token together with the version it was read at.
#[derive(Debug, Clone)]
pub struct AccessSnapshot {
    pub token: Option<Secret<String>>,
    pub version: u64,
}

#[derive(Default)]
struct State {
    credential: Credential,
    version: u64,
    epoch: u64,
    last_activity: Option<u64>,
    last_persisted_activity: Option<u64>,
}

impl State {
    fn persisted(&self) -> PersistedSession {
        PersistedSession {
            access_token: self
                .credential
                .access_token
                .as_ref()
                .map(|t| t.expose().clone()),
            refresh_token: self
                .credential
                .refresh_token
                .as_ref()
                .map(|t| t.expose().clone()),
            issued_at: self.credential.issued_at,
            last_activity: self.last_activity,
        }
    }

    fn store_access(&mut self, token: Secret<String>) {
        self.credential.access_token = Some(token);
        self.credential.issued_at = Some(now_millis());
        self.version += 1;
    }
}

/// Shared, serialized credential state for one API client.
///
/// Construct one per client and hand it around by `Arc`; independent stores
/// never share state, which keeps tests isolated.
pub struct CredentialStore {
    state: Mutex<State>,
    csrf_fetch: Mutex<()>,
    cookies: Option<CookieSource>,
    session_file: Option<SessionFile>,
}

impl Default for CredentialStore {
    fn default() -> Self {
        Self::new()
    }
}

impl CredentialStore {
    /// Empty, memory-only store.
    pub fn new() -> Self {
        Self {
            state: Mutex::new(State::default()),
            csrf_fetch: Mutex::new(()),
            cookies: None,
            session_file: None,
        }
    }

    /// Load a store backed by a session file.
    ///
    /// A missing file yields an empty store; the file is created on the
    /// first write.
    pub async fn load(file: SessionFile) -> Result<Self> {
        let mut state = State::default();
        if let Some(session) = file.load().await? {
            let has_access = session.access_token.is_some();
            state.credential.access_token = session.access_token.map(Secret::new);
            state.credential.refresh_token = session.refresh_token.map(Secret::new);
            state.credential.issued_at = session.issued_at;
            state.last_activity = session.last_activity;
            state.last_persisted_activity = session.last_activity;
            if has_access {
                state.version = 1;
            }
            info!(path = %file.path().display(), authenticated = has_access, "loaded session");
        }
        Ok(Self {
            state: Mutex::new(state),
            csrf_fetch: Mutex::new(()),
            cookies: None,
            session_file: Some(file),
        })
    }

    /// Consult a cookie jar for the CSRF token before the cache.
    pub fn with_cookies(mut self, cookies: CookieSource) -> Self {
        self.cookies = Some(cookies);
        self
    }

    pub async fn access_token(&self) -> Option<Secret<String>> {
        self.state.lock().await.credential.access_token.clone()
    }

    pub async fn access_snapshot(&self) -> AccessSnapshot {
        let state = self.state.lock().await;
        AccessSnapshot {
            token: state.credential.access_token.clone(),
            version: state.version,
        }
    }

    pub async fn set_access_token(&self, token: impl Into<Secret<String>>) {
        let mut state = self.state.lock().await;
        state.store_access(token.into());
        debug!(version = state.version, "stored access token");
        self.persist(&state).await;
    }

    /// Stored refresh token; an empty one counts as absent.
    pub async fn refresh_token(&self) -> Option<Secret<String>> {
        self.state
            .lock()
            .await
            .credential
            .refresh_token
            .clone()
            .filter(|token| !token.is_empty())
    }

    pub async fn set_refresh_token(&self, token: impl Into<Secret<String>>) {
        let mut state = self.state.lock().await;
        state.credential.refresh_token = Some(token.into());
        self.persist(&state).await;
    }

    /// Install a freshly issued token pair (login hand-off).
    pub async fn set_tokens(
        &self,
        access: impl Into<Secret<String>>,
        refresh: impl Into<Secret<String>>,
    ) {
        let mut state = self.state.lock().await;
        state.store_access(access.into());
        state.credential.refresh_token = Some(refresh.into());
        state.last_activity = Some(now_millis());
        info!(version = state.version, "session credentials installed");
        self.persist(&state).await;
    }

    /// Current clear epoch; capture it before starting a refresh.
    pub async fn epoch(&self) -> u64 {
        self.state.lock().await.epoch
    }

    /// Write a refreshed token pair unless the store was cleared since
    /// `epoch` was read. Returns whether the write happened.
    ///
    /// `refresh` of `None` keeps the existing refresh token.
    pub async fn replace_tokens(
        &self,
        epoch: u64,
        access: String,
        refresh: Option<String>,
    ) -> bool {
        let mut state = self.state.lock().await;
        if state.epoch != epoch {
            warn!(
                expected = epoch,
                current = state.epoch,
                "credentials cleared during refresh, discarding new tokens"
            );
            return false;
        }
        state.store_access(Secret::new(access));
        if let Some(refresh) = refresh {
            state.credential.refresh_token = Some(Secret::new(refresh));
        }
        debug!(version = state.version, "refreshed tokens stored");
        self.persist(&state).await;
        true
    }

    /// Resolve the CSRF token: server cookie, then cache, then the endpoint.
    ///
    /// The cookie always wins over the cache. Concurrent callers that all
    /// miss the cache share a single endpoint fetch.
    pub async fn csrf_token(&self, source: &CsrfSource) -> Result<Secret<String>> {
        if let Some(token) = self.cached_csrf_token().await {
            return Ok(token);
        }

        let _fetching = self.csrf_fetch.lock().await;
        // Another caller may have filled the cache while we waited
        if let Some(token) = self.cached_csrf_token().await {
            return Ok(token);
        }
        self.fetch_csrf(source).await
    }

    /// Drop the cached CSRF token and fetch a new one from the endpoint,
    /// bypassing both cookie and cache.
    pub async fn renew_csrf_token(&self, source: &CsrfSource) -> Result<Secret<String>> {
        let _fetching = self.csrf_fetch.lock().await;
        self.invalidate_csrf().await;
        self.fetch_csrf(source).await
    }

    /// CSRF token from cookie or cache, without touching the network.
    pub async fn cached_csrf_token(&self) -> Option<Secret<String>> {
        if let Some(token) = self.cookies.as_ref().and_then(CookieSource::csrf_token) {
            return Some(Secret::new(token));
        }
        self.state.lock().await.credential.csrf_token.clone()
    }

    pub async fn set_csrf_token(&self, token: impl Into<Secret<String>>) {
        self.state.lock().await.credential.csrf_token = Some(token.into());
    }

    pub async fn invalidate_csrf(&self) {
        self.state.lock().await.credential.csrf_token = None;
        debug!("CSRF token invalidated");
    }

    /// Remove every credential. Dominates any refresh still in flight.
    pub async fn clear_all(&self) {
        let mut state = self.state.lock().await;
        state.credential = Credential::default();
        state.epoch += 1;
        state.version += 1;
        state.last_activity = None;
        state.last_persisted_activity = None;
        info!(epoch = state.epoch, "credentials cleared");
        self.persist(&state).await;
    }

    /// Record a successful authenticated exchange.
    pub async fn touch(&self) {
        let mut state = self.state.lock().await;
        let now = now_millis();
        state.last_activity = Some(now);
        let stale = state
            .last_persisted_activity
            .is_none_or(|at| now.saturating_sub(at) >= ACTIVITY_PERSIST_INTERVAL_MS);
        if stale && state.credential.access_token.is_some() {
            state.last_persisted_activity = Some(now);
            self.persist(&state).await;
        }
    }

    /// Unix millisecond timestamp of the last recorded activity.
    pub async fn last_activity(&self) -> Option<u64> {
        self.state.lock().await.last_activity
    }

    /// Time since the last activity, or `None` if nothing was recorded.
    pub async fn idle_for(&self) -> Option<Duration> {
        let last = self.last_activity().await?;
        Some(Duration::from_millis(now_millis().saturating_sub(last)))
    }

    pub async fn is_authenticated(&self) -> bool {
        self.state
            .lock()
            .await
            .credential
            .access_token
            .as_ref()
            .is_some_and(|token| !token.is_empty())
    }

    /// Copy of the current credentials.
    pub async fn snapshot(&self) -> Credential {
        self.state.lock().await.credential.clone()
    }

    async fn fetch_csrf(&self, source: &CsrfSource) -> Result<Secret<String>> {
        let (bearer, epoch) = {
            let state = self.state.lock().await;
            (state.credential.access_token.clone(), state.epoch)
        };
        let token = source
            .fetch(bearer.as_ref().map(|t| t.expose().as_str()))
            .await?;

        let mut state = self.state.lock().await;
        if state.epoch == epoch {
            state.credential.csrf_token = Some(Secret::new(token.clone()));
        }
        Ok(Secret::new(token))
    }

    /// Mirror the session to disk. Failures are logged, never propagated:
    /// an unwritable session file must not fail the request in progress.
    async fn persist(&self, state: &State) {
        let Some(file) = &self.session_file else {
            return;
        };
        if let Err(e) = file.save(&state.persisted()).await {
            warn!(path = %file.path().display(), error = %e, "failed to persist session");
        }
    }
}
