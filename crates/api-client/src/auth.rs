//! Access-token refresh on 401
//!
//! Refreshes are single-flight: callers queue on one mutex, and a caller
//! that gets the lock after someone else already stored a newer token
//! reuses it instead of hitting the endpoint again. The refresh call goes
//! straight to the HTTP client; routing it through the bounded dispatcher
//! could deadlock a queue full of requests waiting on this very refresh.

use std::sync::Arc;

use session_auth::{CredentialStore, refresh_session};
use tokio::sync::{Mutex, broadcast};
use tracing::{debug, info, warn};

use crate::error::{ApiError, Result};
use crate::metrics::record_auth_refresh;

/// Session lifecycle notifications for collaborators (e.g. redirect to login).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AuthEvent {
    /// Refresh failed or was rejected; credentials were cleared
    SessionExpired,
    /// Credentials were cleared on request (logout or idle expiry)
    CredentialsCleared,
}

pub(crate) struct AuthRefresher {
    client: reqwest::Client,
    endpoint: reqwest::Url,
    store: Arc<CredentialStore>,
    events: broadcast::Sender<AuthEvent>,
    in_flight: Mutex<()>,
}

impl AuthRefresher {
    pub(crate) fn new(
        client: reqwest::Client,
        endpoint: reqwest::Url,
        store: Arc<CredentialStore>,
        events: broadcast::Sender<AuthEvent>,
    ) -> Self {
        Self {
            client,
            endpoint,
            store,
            events,
            in_flight: Mutex::new(()),
        }
    }

    /// Obtain a token newer than `stale_version`.
    ///
    /// On failure the store has been cleared and the returned error is
    /// `AuthExpired`.
    pub(crate) async fn refresh(&self, stale_version: u64) -> Result<()> {
        let _guard = self.in_flight.lock().await;

        let current = self.store.access_snapshot().await;
        if current.version != stale_version && current.token.is_some() {
            debug!(
                stale_version,
                version = current.version,
                "token already refreshed by another request"
            );
            record_auth_refresh("reused");
            return Ok(());
        }

        let Some(refresh_token) = self.store.refresh_token().await else {
            record_auth_refresh("failed");
            let reason = session_auth::Error::MissingRefreshToken.to_string();
            return Err(self.expire(&reason).await);
        };

        let epoch = self.store.epoch().await;
        match refresh_session(&self.client, &self.endpoint, refresh_token.expose()).await {
            Ok(pair) => {
                if self
                    .store
                    .replace_tokens(epoch, pair.access_token, pair.refresh_token)
                    .await
                {
                    info!("access token refreshed");
                    record_auth_refresh("success");
                    Ok(())
                } else {
                    record_auth_refresh("discarded");
                    Err(ApiError::AuthExpired(
                        "credentials cleared during refresh".into(),
                    ))
                }
            }
            Err(e) => {
                record_auth_refresh("failed");
                Err(self.expire(&e.to_string()).await)
            }
        }
    }

    /// Clear the session and tell subscribers it expired.
    pub(crate) async fn expire(&self, reason: &str) -> ApiError {
        warn!(reason, "session expired, clearing credentials");
        self.store.clear_all().await;
        // No subscribers is fine
        let _ = self.events.send(AuthEvent::SessionExpired);
        ApiError::AuthExpired(reason.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::Json;
    use axum::Router;
    use axum::http::StatusCode;
    use axum::routing::post;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::time::Duration;

    async fn refresh_server(status: StatusCode, delay: Duration) -> (String, Arc<AtomicUsize>) {
        let calls = Arc::new(AtomicUsize::new(0));
        let counter = calls.clone();
        let app = Router::new().route(
            "/refresh",
            post(move || {
                let counter = counter.clone();
                async move {
                    let n = counter.fetch_add(1, Ordering::SeqCst) + 1;
                    tokio::time::sleep(delay).await;
                    (
                        status,
                        Json(serde_json::json!({
                            "access_token": format!("access-{n}"),
                            "refresh_token": format!("refresh-{n}")
                        })),
                    )
                }
            }),
        );
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move { axum::serve(listener, app).await.unwrap() });
        (format!("http://{addr}/refresh"), calls)
    }

    fn refresher(
        url: &str,
        store: Arc<CredentialStore>,
    ) -> (AuthRefresher, broadcast::Receiver<AuthEvent>) {
        let (events, rx) = broadcast::channel(8);
        let refresher = AuthRefresher::new(
            reqwest::Client::new(),
            reqwest::Url::parse(url).unwrap(),
            store,
            events,
        );
        (refresher, rx)
    }

    #[tokio::test]
    async fn successful_refresh_stores_new_pair() {
        let (url, calls) = refresh_server(StatusCode::OK, Duration::ZERO).await;
        let store = Arc::new(CredentialStore::new());
        store.set_tokens("old-access", "old-refresh").await;
        let (refresher, _rx) = refresher(&url, store.clone());

        let stale = store.access_snapshot().await.version;
        refresher.refresh(stale).await.unwrap();

        assert_eq!(calls.load(Ordering::SeqCst), 1);
        assert_eq!(store.access_token().await.unwrap().expose(), "access-1");
        assert_eq!(store.refresh_token().await.unwrap().expose(), "refresh-1");
    }

    #[tokio::test]
    async fn concurrent_refreshes_coalesce() {
        let (url, calls) = refresh_server(StatusCode::OK, Duration::from_millis(50)).await;
        let store = Arc::new(CredentialStore::new());
        store.set_tokens("old-access", "old-refresh").await;
        let (refresher, _rx) = refresher(&url, store.clone());
        let refresher = Arc::new(refresher);

        let stale = store.access_snapshot().await.version;
        let tasks: Vec<_> = (0..5)
            .map(|_| {
                let refresher = refresher.clone();
                tokio::spawn(async move { refresher.refresh(stale).await })
            })
            .collect();
        for task in tasks {
            task.await.unwrap().unwrap();
        }

        assert_eq!(calls.load(Ordering::SeqCst), 1);
        assert_eq!(store.access_token().await.unwrap().expose(), "access-1");
    }

    #[tokio::test]
    async fn rejected_refresh_clears_and_notifies() {
        let (url, _calls) = refresh_server(StatusCode::UNAUTHORIZED, Duration::ZERO).await;
        let store = Arc::new(CredentialStore::new());
        store.set_tokens("old-access", "old-refresh").await;
        let (refresher, mut rx) = refresher(&url, store.clone());

        let stale = store.access_snapshot().await.version;
        let err = refresher.refresh(stale).await.unwrap_err();

        assert!(err.is_auth_expired());
        assert!(!store.is_authenticated().await);
        assert!(store.refresh_token().await.is_none());
        assert_eq!(rx.recv().await.unwrap(), AuthEvent::SessionExpired);
    }

    #[tokio::test]
    async fn missing_refresh_token_fails_without_network() {
        let (url, calls) = refresh_server(StatusCode::OK, Duration::ZERO).await;
        let store = Arc::new(CredentialStore::new());
        store.set_access_token("only-access").await;
        let (refresher, _rx) = refresher(&url, store.clone());

        let stale = store.access_snapshot().await.version;
        assert_eq!(
            refresher.refresh(stale).await.unwrap_err(),
            ApiError::AuthExpired("no refresh token stored".into())
        );
        assert_eq!(calls.load(Ordering::SeqCst), 0);
        assert!(!store.is_authenticated().await);
    }

    #[tokio::test]
    async fn clear_during_refresh_wins() {
        let (url, calls) = refresh_server(StatusCode::OK, Duration::from_millis(100)).await;
        let store = Arc::new(CredentialStore::new());
        store.set_tokens("old-access", "old-refresh").await;
        let (refresher, _rx) = refresher(&url, store.clone());

        let stale = store.access_snapshot().await.version;
        let clearing = {
            let store = store.clone();
            async move {
                tokio::time::sleep(Duration::from_millis(20)).await;
                store.clear_all().await;
            }
        };
        let (result, ()) = tokio::join!(refresher.refresh(stale), clearing);

        assert_eq!(calls.load(Ordering::SeqCst), 1);
        assert!(result.unwrap_err().is_auth_expired());
        let snapshot = store.snapshot().await;
        assert!(snapshot.access_token.is_none());
        assert!(snapshot.refresh_token.is_none());
    }
}
