//! Configuration module for treesync.
//!
//! Provides typed configuration structs that map to the YAML configuration file,
//! with loading, validation and defaults. Command-line flags are applied on top
//! of the loaded values by the binary.

use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};
use url::Url;

use crate::error::DomainError;
use crate::ignore::PathIgnorer;

/// URL path of the synchronization endpoint on the server.
pub const SYNC_ENDPOINT_PATH: &str = "/sync";

// ---------------------------------------------------------------------------
// Config struct with sub-sections
// ---------------------------------------------------------------------------

/// Top-level configuration for treesync.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    pub server: ServerConfig,
    pub client: ClientConfig,
    /// Ignore patterns shared by both sides.
    pub ignore: Vec<String>,
    pub logging: LoggingConfig,
}

/// Settings for `treesync serve`.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ServerConfig {
    /// Interface to listen on.
    pub bind: String,
    /// TCP port to listen on.
    pub port: u16,
    /// Directory whose contents are served and kept authoritative.
    pub directory: PathBuf,
    /// Capacity of the serialized apply queue.
    pub queue_capacity: usize,
}

/// Settings for `treesync client`.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ClientConfig {
    /// Server address (`host:port` or a `ws://` / `http://` URL).
    pub server: String,
    /// Local directory mirrored against the server.
    pub directory: PathBuf,
    /// Delete local files that the server does not have during initial sync.
    pub delete: bool,
    /// Report the initial reconciliation plan without executing it.
    pub dry_run: bool,
    /// Seconds to wait between connection attempts.
    pub reconnect_backoff_secs: u64,
    /// Milliseconds during which events for a just-applied path are treated as echoes.
    pub echo_grace_ms: u64,
}

/// Logging / tracing settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LoggingConfig {
    /// Log level: `trace`, `debug`, `info`, `warn`, or `error`.
    pub level: String,
    /// Output format: `human` or `json`.
    pub format: String,
}

// ---------------------------------------------------------------------------
// Config::load()
// ---------------------------------------------------------------------------

impl Config {
    /// Load configuration from a YAML file at `path`.
    pub fn load(path: &Path) -> anyhow::Result<Self> {
        let content = std::fs::read_to_string(path)?;
        let config: Config = serde_yaml::from_str(&content)?;
        Ok(config)
    }

    /// Try to load from `path`; fall back to [`Config::default`] on any error.
    pub fn load_or_default(path: &Path) -> Self {
        Self::load(path).unwrap_or_default()
    }

    /// Platform-appropriate default path for the configuration file.
    ///
    /// Typically `$XDG_CONFIG_HOME/treesync/config.yaml` on Linux.
    pub fn default_path() -> PathBuf {
        dirs::config_dir()
            .unwrap_or_else(|| PathBuf::from("~/.config"))
            .join("treesync")
            .join("config.yaml")
    }

    /// Compiles the configured ignore patterns.
    pub fn ignorer(&self) -> PathIgnorer {
        PathIgnorer::new(&self.ignore)
    }
}

// ---------------------------------------------------------------------------
// Defaults
// ---------------------------------------------------------------------------

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            bind: "0.0.0.0".to_string(),
            port: 8080,
            directory: PathBuf::from("./sync"),
            queue_capacity: 100,
        }
    }
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self {
            server: "ws://127.0.0.1:8080".to_string(),
            directory: PathBuf::from("./sync"),
            delete: true,
            dry_run: false,
            reconnect_backoff_secs: 5,
            echo_grace_ms: 1500,
        }
    }
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
            format: "human".to_string(),
        }
    }
}

impl ServerConfig {
    /// `bind:port` string suitable for `TcpListener::bind`.
    pub fn listen_address(&self) -> String {
        format!("{}:{}", self.bind, self.port)
    }
}

impl ClientConfig {
    /// Fully-qualified WebSocket URL of the server's sync endpoint.
    pub fn endpoint(&self) -> Result<Url, DomainError> {
        endpoint_url(&self.server)
    }

    pub fn reconnect_backoff(&self) -> Duration {
        Duration::from_secs(self.reconnect_backoff_secs)
    }

    pub fn echo_grace(&self) -> Duration {
        Duration::from_millis(self.echo_grace_ms)
    }
}

/// Turns a user-supplied server address into the sync endpoint URL.
///
/// Accepts `host:port`, `ws://`, `wss://`, `http://` (mapped to `ws`) and
/// `https://` (mapped to `wss`). When the URL has no path, `/sync` is appended.
///
/// # Errors
/// Returns [`DomainError::InvalidEndpoint`] when the address cannot be parsed,
/// uses another scheme, or has no host.
pub fn endpoint_url(address: &str) -> Result<Url, DomainError> {
    let invalid = |reason: String| DomainError::InvalidEndpoint {
        address: address.to_string(),
        reason,
    };

    let trimmed = address.trim();
    if trimmed.is_empty() {
        return Err(invalid("address is empty".to_string()));
    }

    let with_scheme = if trimmed.contains("://") {
        trimmed.to_string()
    } else {
        format!("ws://{trimmed}")
    };

    let mut url = Url::parse(&with_scheme).map_err(|e| invalid(e.to_string()))?;

    let scheme = match url.scheme() {
        "ws" | "http" => "ws",
        "wss" | "https" => "wss",
        other => return Err(invalid(format!("unsupported scheme '{other}'"))),
    };
    if url.scheme() != scheme {
        // Url::set_scheme refuses special→non-special changes, so rebuild instead.
        let rest = &with_scheme[with_scheme.find("://").map_or(0, |i| i + 3)..];
        url = Url::parse(&format!("{scheme}://{rest}")).map_err(|e| invalid(e.to_string()))?;
    }

    if url.host_str().map_or(true, str::is_empty) {
        return Err(invalid("missing host".to_string()));
    }

    if url.path().is_empty() || url.path() == "/" {
        url.set_path(SYNC_ENDPOINT_PATH);
    }

    Ok(url)
}

// ---------------------------------------------------------------------------
// Config::validate()
// ---------------------------------------------------------------------------

/// A single validation error found in the configuration.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ValidationError {
    /// Dotted path to the offending field, e.g. `"server.port"`.
    pub field: String,
    /// Human-readable explanation.
    pub message: String,
}

impl std::fmt::Display for ValidationError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}: {}", self.field, self.message)
    }
}

/// Valid values for `logging.level`.
const VALID_LOG_LEVELS: &[&str] = &["trace", "debug", "info", "warn", "error"];

/// Valid values for `logging.format`.
const VALID_LOG_FORMATS: &[&str] = &["human", "json"];

impl Config {
    /// Validate the configuration and return all errors found.
    ///
    /// An empty vector means the configuration is valid.
    pub fn validate(&self) -> Vec<ValidationError> {
        let mut errors = Vec::new();

        // --- server ---
        if self.server.port == 0 {
            errors.push(ValidationError {
                field: "server.port".into(),
                message: "must be greater than 0".into(),
            });
        }
        if self.server.queue_capacity == 0 {
            errors.push(ValidationError {
                field: "server.queue_capacity".into(),
                message: "must be greater than 0".into(),
            });
        }
        if self.server.directory.as_os_str().is_empty() {
            errors.push(ValidationError {
                field: "server.directory".into(),
                message: "must not be empty".into(),
            });
        }

        // --- client ---
        if let Err(e) = self.client.endpoint() {
            errors.push(ValidationError {
                field: "client.server".into(),
                message: e.to_string(),
            });
        }
        if self.client.directory.as_os_str().is_empty() {
            errors.push(ValidationError {
                field: "client.directory".into(),
                message: "must not be empty".into(),
            });
        }
        if self.client.reconnect_backoff_secs == 0 {
            errors.push(ValidationError {
                field: "client.reconnect_backoff_secs".into(),
                message: "must be greater than 0".into(),
            });
        }

        // --- logging ---
        if !VALID_LOG_LEVELS.contains(&self.logging.level.as_str()) {
            errors.push(ValidationError {
                field: "logging.level".into(),
                message: format!(
                    "invalid level '{}'; valid options: {}",
                    self.logging.level,
                    VALID_LOG_LEVELS.join(", ")
                ),
            });
        }
        if !VALID_LOG_FORMATS.contains(&self.logging.format.as_str()) {
            errors.push(ValidationError {
                field: "logging.format".into(),
                message: format!(
                    "invalid format '{}'; valid options: {}",
                    self.logging.format,
                    VALID_LOG_FORMATS.join(", ")
                ),
            });
        }

        errors
    }
}
