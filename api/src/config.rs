/// Environment configuration for the relay server.
use std::path::PathBuf;
use std::time::Duration;

use anyhow::Context;
use tracing::warn;
use url::Url;

pub const DEFAULT_UPSTREAM_URL: &str = "https://ytdlp.online";
pub const DEFAULT_DOWNLOAD_TIMEOUT: u64 = 300;
pub const DEFAULT_HOST: &str = "0.0.0.0";
pub const DEFAULT_PORT: u16 = 8000;
pub const DEFAULT_LOG_FILE: &str = "logs/app.log";

#[derive(Debug, Clone)]
pub struct Config {
    /// Base URL of the remote yt-dlp service.
    pub upstream_url: String,
    /// Base URL used when rewriting download links (defaults to `upstream_url`).
    pub download_base_url: String,
    /// Sync timeout and stream idle timeout, in seconds.
    pub download_timeout: u64,
    /// `["*"]` or an explicit origin list.
    pub cors_origins: Vec<String>,
    pub host: String,
    pub port: u16,
}

impl Config {
    /// Read configuration from the process environment.
    pub fn from_env() -> anyhow::Result<Self> {
        Self::from_vars(|key| std::env::var(key).ok())
    }

    /// Read configuration through `var`, which maps a variable name to its value.
    pub fn from_vars(var: impl Fn(&str) -> Option<String>) -> anyhow::Result<Self> {
        let upstream_url = var("YTDLP_ONLINE_URL")
            .filter(|v| !v.trim().is_empty())
            .unwrap_or_else(|| DEFAULT_UPSTREAM_URL.to_string());
        let upstream_url = normalize_base_url(&upstream_url)
            .with_context(|| format!("YTDLP_ONLINE_URL is not a valid URL: {}", upstream_url))?;

        let download_base_url = match var("DOWNLOAD_BASE_URL").filter(|v| !v.trim().is_empty()) {
            Some(custom) => normalize_base_url(&custom)
                .with_context(|| format!("DOWNLOAD_BASE_URL is not a valid URL: {}", custom))?,
            None => upstream_url.clone(),
        };

        let download_timeout = parse_or(&var, "DOWNLOAD_TIMEOUT", DEFAULT_DOWNLOAD_TIMEOUT);
        let download_timeout = if download_timeout == 0 {
            warn!("DOWNLOAD_TIMEOUT must be positive, using {}", DEFAULT_DOWNLOAD_TIMEOUT);
            DEFAULT_DOWNLOAD_TIMEOUT
        } else {
            download_timeout
        };

        let cors_origins = parse_origins(&var("CORS_ORIGINS").unwrap_or_else(|| "*".to_string()));
        let host = var("HOST").unwrap_or_else(|| DEFAULT_HOST.to_string());
        let port = parse_or(&var, "PORT", DEFAULT_PORT);

        Ok(Self {
            upstream_url,
            download_base_url,
            download_timeout,
            cors_origins,
            host,
            port,
        })
    }

    pub fn timeout(&self) -> Duration {
        Duration::from_secs(self.download_timeout)
    }

    pub fn allows_any_origin(&self) -> bool {
        self.cors_origins.iter().any(|o| o == "*")
    }

    pub fn bind_addr(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }
}

/// Logging settings. Read before the subscriber exists, so nothing here logs.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LogConfig {
    /// Directive applied to this service's targets when `RUST_LOG` is unset.
    pub level: &'static str,
    /// Append log output here as well, when file logging is enabled.
    pub file: Option<PathBuf>,
}

impl LogConfig {
    pub fn from_env() -> Self {
        Self::from_vars(|key| std::env::var(key).ok())
    }

    /// `LOG_LEVEL` (DEBUG, INFO, WARNING, ERROR, CRITICAL; default INFO),
    /// `ENABLE_LOG_FILE` and `LOG_FILE`.
    pub fn from_vars(var: impl Fn(&str) -> Option<String>) -> Self {
        let level = var("LOG_LEVEL").map_or("info", |raw| level_directive(&raw));
        let file = var("ENABLE_LOG_FILE")
            .filter(|raw| is_enabled(raw))
            .map(|_| {
                var("LOG_FILE")
                    .filter(|v| !v.trim().is_empty())
                    .unwrap_or_else(|| DEFAULT_LOG_FILE.to_string())
            })
            .map(PathBuf::from);
        Self { level, file }
    }

    /// Filter used when `RUST_LOG` is unset.
    pub fn default_filter(&self) -> String {
        format!(
            "dlrelay_api={0},dlrelay_shared={0},tower_http={0}",
            self.level
        )
    }
}

fn level_directive(raw: &str) -> &'static str {
    match raw.trim().to_ascii_uppercase().as_str() {
        "TRACE" => "trace",
        "DEBUG" => "debug",
        "WARN" | "WARNING" => "warn",
        "ERROR" | "CRITICAL" => "error",
        _ => "info",
    }
}

fn is_enabled(raw: &str) -> bool {
    matches!(
        raw.trim().to_ascii_lowercase().as_str(),
        "1" | "true" | "yes" | "on"
    )
}

fn normalize_base_url(raw: &str) -> anyhow::Result<String> {
    let trimmed = raw.trim().trim_end_matches('/');
    let parsed = Url::parse(trimmed)?;
    if !matches!(parsed.scheme(), "http" | "https") {
        anyhow::bail!("unsupported scheme {}", parsed.scheme());
    }
    Ok(trimmed.to_string())
}

fn parse_origins(raw: &str) -> Vec<String> {
    let origins: Vec<String> = raw
        .split(',')
        .map(|o| o.trim().trim_end_matches('/').to_string())
        .filter(|o| !o.is_empty())
        .collect();
    if origins.is_empty() {
        vec!["*".to_string()]
    } else {
        origins
    }
}

fn parse_or<T: std::str::FromStr + std::fmt::Display + Copy>(
    var: &impl Fn(&str) -> Option<String>,
    key: &str,
    default: T,
) -> T {
    match var(key) {
        Some(raw) => raw.trim().parse().unwrap_or_else(|_| {
            warn!("Invalid {}={:?}, using {}", key, raw, default);
            default
        }),
        None => default,
    }
}
