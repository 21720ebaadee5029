//! Configuration types and loading
//!
//! Config precedence: env vars > config file > defaults. Only `[api]` with a
//! `base_url` is required; `API_BASE_URL` overrides it.

use std::path::{Path, PathBuf};
use std::time::Duration;

use request_queue::RetryPolicy;
use serde::Deserialize;
use session_auth::{
    DEFAULT_CSRF_COOKIE, DEFAULT_CSRF_EXEMPT_PATHS, DEFAULT_CSRF_PATH, DEFAULT_IDLE_TIMEOUT,
    DEFAULT_REFRESH_PATH,
};

/// Root configuration
#[derive(Debug, Clone, Deserialize)]
pub struct Config {
    pub api: ApiConfig,
    #[serde(default)]
    pub retry: RetryConfig,
    #[serde(default)]
    pub auth: AuthConfig,
}

/// Server location and request limits
#[derive(Debug, Clone, Deserialize)]
pub struct ApiConfig {
    pub base_url: String,
    #[serde(default = "default_timeout")]
    pub timeout_secs: u64,
    #[serde(default = "default_max_concurrency")]
    pub max_concurrency: usize,
}

/// Linear backoff for transient failures
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct RetryConfig {
    pub max_retries: u32,
    pub base_delay_ms: u64,
    /// Upper bound of random delay added to each backoff; 0 disables jitter
    pub jitter_ms: u64,
}

/// Session endpoints and CSRF handling
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct AuthConfig {
    pub refresh_path: String,
    pub csrf_path: String,
    pub csrf_cookie: String,
    /// Path prefixes the server exempts from CSRF checking
    pub csrf_exempt_paths: Vec<String>,
    /// Where to persist tokens between runs; memory-only when unset
    pub session_file: Option<PathBuf>,
    pub idle_timeout_secs: u64,
}

fn default_timeout() -> u64 {
    30
}

fn default_max_concurrency() -> usize {
    request_queue::DEFAULT_MAX_CONCURRENCY
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_retries: request_queue::DEFAULT_MAX_RETRIES,
            base_delay_ms: request_queue::DEFAULT_BASE_DELAY.as_millis() as u64,
            jitter_ms: 250,
        }
    }
}

impl RetryConfig {
    pub fn policy(&self) -> RetryPolicy {
        RetryPolicy::new(self.max_retries, Duration::from_millis(self.base_delay_ms))
            .with_jitter(Duration::from_millis(self.jitter_ms))
    }
}

impl Default for AuthConfig {
    fn default() -> Self {
        Self {
            refresh_path: DEFAULT_REFRESH_PATH.to_string(),
            csrf_path: DEFAULT_CSRF_PATH.to_string(),
            csrf_cookie: DEFAULT_CSRF_COOKIE.to_string(),
            csrf_exempt_paths: DEFAULT_CSRF_EXEMPT_PATHS
                .iter()
                .map(|p| p.to_string())
                .collect(),
            session_file: None,
            idle_timeout_secs: DEFAULT_IDLE_TIMEOUT.as_secs(),
        }
    }
}

impl AuthConfig {
    pub fn idle_timeout(&self) -> Duration {
        Duration::from_secs(self.idle_timeout_secs)
    }
}

impl Config {
    /// Load configuration from a TOML file, then overlay environment variables.
    pub fn load(path: &Path) -> common::Result<Self> {
        let contents = std::fs::read_to_string(path)?;
        let mut config: Config = toml::from_str(&contents)?;

        if let Ok(url) = std::env::var("API_BASE_URL") {
            config.api.base_url = url;
        }

        config.validate()?;
        Ok(config)
    }

    fn validate(&self) -> common::Result<()> {
        if !self.api.base_url.starts_with("http://") && !self.api.base_url.starts_with("https://")
        {
            return Err(common::Error::Config(format!(
                "base_url must start with http:// or https://, got: {}",
                self.api.base_url
            )));
        }

        if self.api.timeout_secs == 0 {
            return Err(common::Error::Config(
                "timeout_secs must be greater than 0".into(),
            ));
        }

        if self.api.max_concurrency == 0 {
            return Err(common::Error::Config(
                "max_concurrency must be greater than 0".into(),
            ));
        }

        if self.auth.idle_timeout_secs == 0 {
            return Err(common::Error::Config(
                "idle_timeout_secs must be greater than 0".into(),
            ));
        }

        for (name, path) in [
            ("refresh_path", &self.auth.refresh_path),
            ("csrf_path", &self.auth.csrf_path),
        ] {
            if !path.starts_with('/') {
                return Err(common::Error::Config(format!(
                    "{name} must start with '/', got: {path}"
                )));
            }
        }

        Ok(())
    }

    /// Resolve config file path from CLI arg or CONFIG_PATH env var.
    pub fn resolve_path(cli_path: Option<&str>) -> PathBuf {
        if let Some(p) = cli_path {
            return PathBuf::from(p);
        }
        if let Ok(p) = std::env::var("CONFIG_PATH") {
            return PathBuf::from(p);
        }
        PathBuf::from("api-client.toml")
    }
}
