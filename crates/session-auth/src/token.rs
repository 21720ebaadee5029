//! Refresh-token exchange
//!
//! POSTs the stored refresh token to the refresh endpoint and returns the new
//! token pair. Callers issue this directly against the HTTP client, never
//! through the request queue: a saturated queue whose slots are all waiting
//! on this refresh would otherwise never drain.

use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};

/// Response from the refresh endpoint.
///
/// Servers that do not rotate refresh tokens omit `refresh_token`; the caller
/// keeps the existing one in that case.
#[derive(Debug, Deserialize, Serialize)]
pub struct TokenPair {
    pub access_token: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub refresh_token: Option<String>,
}

#[derive(Serialize)]
struct RefreshRequest<'a> {
    refresh_token: &'a str,
}

/// Exchange a refresh token for a new access token.
pub async fn refresh_session(
    client: &reqwest::Client,
    endpoint: &reqwest::Url,
    refresh: &str,
) -> Result<TokenPair> {
    let response = client
        .post(endpoint.clone())
        .json(&RefreshRequest {
            refresh_token: refresh,
        })
        .send()
        .await
        .map_err(|e| Error::Http(format!("token refresh request failed: {e}")))?;

    let status = response.status();
    if !status.is_success() {
        let body = response
            .text()
            .await
            .unwrap_or_else(|_| String::from("<no body>"));

        // 401/403 means the refresh token is revoked or expired
        if status.as_u16() == 401 || status.as_u16() == 403 {
            return Err(Error::InvalidCredentials(format!(
                "refresh token rejected ({status}): {body}"
            )));
        }

        return Err(Error::TokenRefresh(format!(
            "refresh endpoint returned {status}: {body}"
        )));
    }

    let pair = response
        .json::<TokenPair>()
        .await
        .map_err(|e| Error::TokenRefresh(format!("invalid refresh response: {e}")))?;

    if pair.access_token.is_empty() {
        return Err(Error::TokenRefresh(
            "refresh response carried an empty access token".into(),
        ));
    }
    Ok(pair)
}
