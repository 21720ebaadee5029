//! On-disk session persistence
//!
//! Keeps the access token, refresh token and last-activity timestamp across
//! process restarts. All writes use atomic temp-file + rename so a crash
//! mid-write never leaves a truncated file behind. The CSRF token is never
//! persisted: it is cheap to refetch and tied to the server-side session.

use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::error::{Error, Result};

/// Persisted form of a session. Timestamps are unix milliseconds.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct PersistedSession {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub access_token: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub refresh_token: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub issued_at: Option<u64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_activity: Option<u64>,
}

/// JSON file holding one `PersistedSession`.
#[derive(Debug, Clone)]
pub struct SessionFile {
    path: PathBuf,
}

impl SessionFile {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Read the session, or `None` when the file does not exist yet.
    pub async fn load(&self) -> Result<Option<PersistedSession>> {
        if !self.path.exists() {
            debug!(path = %self.path.display(), "session file not found");
            return Ok(None);
        }
        let contents = tokio::fs::read_to_string(&self.path)
            .await
            .map_err(|e| Error::Io(format!("reading session file: {e}")))?;
        if contents.trim().is_empty() {
            return Ok(None);
        }
        let session = serde_json::from_str(&contents)
            .map_err(|e| Error::SessionParse(format!("parsing session file: {e}")))?;
        Ok(Some(session))
    }

    /// Persist the session atomically with owner-only permissions.
    pub async fn save(&self, session: &PersistedSession) -> Result<()> {
        write_atomic(&self.path, session).await
    }
}

/// Write the session to a file atomically.
///
/// Writes to a temporary file in the same directory, then renames it over
/// the target. Permissions are 0600 since the file contains bearer tokens.
async fn write_atomic(path: &Path, session: &PersistedSession) -> Result<()> {
    let json = serde_json::to_string_pretty(session)
        .map_err(|e| Error::SessionParse(format!("serializing session: {e}")))?;

    let dir = path
        .parent()
        .ok_or_else(|| Error::Io("session path has no parent directory".into()))?;

    let tmp_path = dir.join(format!(".session.tmp.{}", std::process::id()));

    tokio::fs::write(&tmp_path, json.as_bytes())
        .await
        .map_err(|e| Error::Io(format!("writing temp session file: {e}")))?;

    #[cfg(unix)]
    {
        use std::os::unix::fs::PermissionsExt;
        let perms = std::fs::Permissions::from_mode(0o600);
        tokio::fs::set_permissions(&tmp_path, perms)
            .await
            .map_err(|e| Error::Io(format!("setting session file permissions: {e}")))?;
    }

    tokio::fs::rename(&tmp_path, path)
        .await
        .map_err(|e| Error::Io(format!("renaming temp session file: {e}")))?;

    debug!(path = %path.display(), "persisted session");
    Ok(())
}

/// Current wall-clock time as unix milliseconds.
pub fn now_millis() -> u64 {
    std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .unwrap_or_default()
        .as_millis() as u64
}
