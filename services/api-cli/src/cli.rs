//! Command-line parsing
//!
//! ```text
//! api-cli [--config PATH] [--metrics] request <METHOD> <PATH> [JSON]
//! api-cli [--config PATH] [--metrics] stream <PATH> [JSON]
//! api-cli [--config PATH] [--metrics] logout
//! ```

use anyhow::{Context, Result, bail};
use api_client::Method;
use serde_json::Value;

pub const USAGE: &str = "usage: api-cli [--config PATH] [--metrics] \
    <request METHOD PATH [JSON] | stream PATH [JSON] | logout>";

#[derive(Debug, PartialEq)]
pub struct Cli {
    pub config: Option<String>,
    /// Print the Prometheus exposition after the command
    pub metrics: bool,
    pub command: Command,
}

#[derive(Debug, PartialEq)]
pub enum Command {
    Request {
        method: Method,
        path: String,
        body: Option<Value>,
    },
    Stream {
        path: String,
        body: Option<Value>,
    },
    Logout,
}

impl Cli {
    /// Parse arguments, excluding the program name.
    pub fn parse(args: &[String]) -> Result<Self> {
        let mut config = None;
        let mut metrics = false;
        let mut positional = Vec::new();

        let mut iter = args.iter();
        while let Some(arg) = iter.next() {
            match arg.as_str() {
                "--config" => {
                    let path = iter.next().context("--config requires a path")?;
                    config = Some(path.clone());
                }
                "--metrics" => metrics = true,
                flag if flag.starts_with("--") => bail!("unknown flag {flag}\n{USAGE}"),
                _ => positional.push(arg.as_str()),
            }
        }

        let command = match positional.as_slice() {
            ["request", method, path, rest @ ..] => Command::Request {
                method: parse_method(method)?,
                path: path.to_string(),
                body: parse_body(rest)?,
            },
            ["stream", path, rest @ ..] => Command::Stream {
                path: path.to_string(),
                body: parse_body(rest)?,
            },
            ["logout"] => Command::Logout,
            [] => bail!("missing command\n{USAGE}"),
            other => bail!("unrecognised command {:?}\n{USAGE}", other.join(" ")),
        };

        Ok(Self {
            config,
            metrics,
            command,
        })
    }
}

fn parse_method(raw: &str) -> Result<Method> {
    Method::from_bytes(raw.to_ascii_uppercase().as_bytes())
        .with_context(|| format!("invalid HTTP method {raw}"))
}

fn parse_body(rest: &[&str]) -> Result<Option<Value>> {
    match rest {
        [] => Ok(None),
        [json] => serde_json::from_str(json)
            .map(Some)
            .context("request body must be valid JSON"),
        _ => bail!("expected at most one JSON body argument\n{USAGE}"),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn parse(args: &[&str]) -> Result<Cli> {
        let args: Vec<String> = args.iter().map(|s| s.to_string()).collect();
        Cli::parse(&args)
    }

    #[test]
    fn request_with_body_and_flags() {
        let cli = parse(&[
            "--config",
            "/etc/api.toml",
            "request",
            "post",
            "/api/v1/items",
            r#"{"name":"x"}"#,
            "--metrics",
        ])
        .unwrap();
        assert_eq!(cli.config.as_deref(), Some("/etc/api.toml"));
        assert!(cli.metrics);
        assert_eq!(
            cli.command,
            Command::Request {
                method: Method::POST,
                path: "/api/v1/items".into(),
                body: Some(serde_json::json!({"name": "x"})),
            }
        );
    }

    #[test]
    fn stream_and_logout() {
        assert_eq!(
            parse(&["stream", "/api/v1/chat"]).unwrap().command,
            Command::Stream {
                path: "/api/v1/chat".into(),
                body: None
            }
        );
        let cli = parse(&["logout"]).unwrap();
        assert_eq!(cli.command, Command::Logout);
        assert!(cli.config.is_none());
        assert!(!cli.metrics);
    }

    #[test]
    fn bad_input_is_rejected() {
        assert!(parse(&[]).is_err());
        assert!(parse(&["--config"]).is_err());
        assert!(parse(&["--verbose", "logout"]).is_err());
        assert!(parse(&["request", "GET"]).is_err());
        assert!(parse(&["request", "GE T", "/x"]).is_err());
        assert!(parse(&["request", "POST", "/x", "{not json"]).is_err());
        assert!(parse(&["stream", "/x", "{}", "{}"]).is_err());
        assert!(parse(&["logout", "now"]).is_err());
    }
}
