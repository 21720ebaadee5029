//! API command-line client
//!
//! Thin collaborator around `ApiClient`:
//! 1. Loads configuration and the persisted session
//! 2. Expires the session if it has been idle too long
//! 3. Runs one unary request, one stream, or a logout
//!
//! Logs go to stderr as JSON; command output goes to stdout.

mod cli;
mod metrics;

use std::io::Write;

use anyhow::{Context, Result};
use api_client::{ApiClient, Config, RequestOptions, StreamError, StreamHandler, StreamState};
use serde_json::Value;
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use crate::cli::{Cli, Command};

/// Writes stream output to stdout as it arrives.
struct Printer;

impl StreamHandler for Printer {
    fn on_message(&mut self, text: String) {
        let mut stdout = std::io::stdout();
        let _ = stdout.write_all(text.as_bytes());
        let _ = stdout.flush();
    }

    fn on_error(&mut self, error: StreamError) {
        if error.is_quota_error() {
            eprintln!("\nquota exceeded: {error}");
        } else {
            eprintln!("\nstream error: {error}");
        }
    }

    fn on_complete(&mut self) {
        println!();
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    // Initialize tracing with JSON output and LOG_LEVEL / RUST_LOG support
    tracing_subscriber::registry()
        .with(
            EnvFilter::try_from_env("LOG_LEVEL")
                .or_else(|_| EnvFilter::try_from_default_env())
                .unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .with(
            tracing_subscriber::fmt::layer()
                .json()
                .with_writer(std::io::stderr),
        )
        .init();

    // Install Prometheus metrics recorder before any metrics are emitted
    let prometheus_handle = metrics::install_recorder();

    let args: Vec<String> = std::env::args().skip(1).collect();
    let cli = Cli::parse(&args)?;

    let config_path = Config::resolve_path(cli.config.as_deref());
    info!(path = %config_path.display(), "loading configuration");

    let config = Config::load(&config_path)
        .with_context(|| format!("failed to load config from {}", config_path.display()))?;

    info!(
        base_url = %config.api.base_url,
        max_concurrency = config.api.max_concurrency,
        max_retries = config.retry.max_retries,
        session_file = ?config.auth.session_file,
        "configuration loaded"
    );

    let client = ApiClient::from_config(&config)
        .await
        .context("failed to build API client")?;

    seed_tokens(&client).await;
    if client.expire_if_idle(client.idle_timeout()).await {
        warn!("session expired after inactivity, log in again");
    }

    let outcome = run(&client, cli.command).await;

    if cli.metrics {
        print!("{}", prometheus_handle.render());
    }
    outcome
}

/// Install tokens handed over by an external login flow, if any.
async fn seed_tokens(client: &ApiClient) {
    if let (Ok(access), Ok(refresh)) = (
        std::env::var("API_ACCESS_TOKEN"),
        std::env::var("API_REFRESH_TOKEN"),
    ) {
        client.set_tokens(access, refresh).await;
        info!("session tokens loaded from environment");
    }
}

async fn run(client: &ApiClient, command: Command) -> Result<()> {
    match command {
        Command::Request { method, path, body } => {
            let value: Value = client
                .request(method.clone(), &path, body, RequestOptions::default())
                .await
                .with_context(|| format!("{method} {path} failed"))?;
            println!("{}", serde_json::to_string_pretty(&value)?);
            Ok(())
        }
        Command::Stream { path, body } => {
            let handle = client
                .open_stream(&path, body, Printer)
                .with_context(|| format!("failed to open stream {path}"))?;
            let cancel = handle.cancellation_token();
            let finished = handle.finished();
            tokio::pin!(finished);

            let state = tokio::select! {
                state = &mut finished => state,
                _ = tokio::signal::ctrl_c() => {
                    info!("interrupted, cancelling stream");
                    cancel.cancel();
                    finished.await
                }
            };

            match state {
                StreamState::Completed | StreamState::Cancelled => Ok(()),
                StreamState::Errored => anyhow::bail!("stream {path} ended with an error"),
            }
        }
        Command::Logout => {
            client.clear_credentials().await;
            println!("logged out");
            Ok(())
        }
    }
}
