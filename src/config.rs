//! Configuration loading and defaults.
//!
//! Configuration is resolved in order of precedence (highest wins):
//!
//! 1. **Command-line flags** — applied by `main` on top of the loaded value
//! 2. **Environment variables** — `QBEE_EMAIL`/`QBEE_USERNAME`,
//!    `QBEE_PASSWORD`, `QBEE_API_TOKEN`, `QBEE_BASEURL`, `QBEE_TOKEN`,
//!    `QBEE_LISTEN_PORT`, `QBEE_REMOTE_HOST`, `QBEE_REMOTE_PORT`,
//!    `QBEE_REMOTE_PROTOCOL`
//! 3. **Settings file** — path via `--settings <path>`, or `qbee-connect.toml`
//!    in CWD
//! 4. **Compiled defaults** — see each field's default value below
//!
//! The TOML file mirrors the struct hierarchy:
//!
//! ```toml
//! [api]
//! base_url = "https://www.app.qbee.io"
//! email = "ops@example.com"
//! password = "secret"
//! # token = "pre-issued bearer token"   # skips the login call
//!
//! [connect]
//! retries = 1                  # 0 = retry forever
//! backoff_base_secs = 5
//! backoff_max_secs = 60
//! connect_timeout_secs = 15
//!
//! [broker]
//! listen_port = 8081
//! remote_host = "localhost"
//! remote_port = 80
//! remote_protocol = "http"
//! auth_token = "shared-secret"  # omit to disable authentication
//! tunnel_ttl_secs = 300
//! gc_interval_secs = 60
//! reauth_interval_secs = 600
//! ready_timeout_secs = 30
//! session_ttl_secs = 900
//!
//! [logging]
//! level = "info"
//! ```

use std::path::Path;
use std::time::Duration;

use serde::Deserialize;

use crate::api::client::{Credentials, DEFAULT_BASE_URL};
use crate::error::ConfigError;
use crate::supervisor::RetryPolicy;
use crate::target::DeviceConnection;

/// Settings file looked up in the working directory when none is given.
pub const DEFAULT_SETTINGS_FILE: &str = "qbee-connect.toml";

/// Top-level configuration, deserialized from TOML.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct Config {
    #[serde(default)]
    pub api: ApiConfig,
    #[serde(default)]
    pub connect: ConnectConfig,
    #[serde(default)]
    pub broker: BrokerConfig,
    #[serde(default)]
    pub logging: LoggingConfig,
}

/// Management API endpoint and credentials.
#[derive(Debug, Clone, Deserialize)]
pub struct ApiConfig {
    /// API base URL. Override with `QBEE_BASEURL`.
    #[serde(default = "default_base_url")]
    pub base_url: String,
    /// Login email. Override with `QBEE_EMAIL` or `QBEE_USERNAME`.
    pub email: Option<String>,
    /// Login password. Override with `QBEE_PASSWORD`.
    pub password: Option<String>,
    /// Pre-issued bearer token. Override with `QBEE_API_TOKEN`.
    pub token: Option<String>,
}

/// Reconnect behaviour of `connect`.
#[derive(Debug, Clone, Deserialize)]
pub struct ConnectConfig {
    /// Connect attempts per device before giving up (default 1). 0 retries
    /// forever.
    #[serde(default = "default_retries")]
    pub retries: u32,
    /// Initial backoff in seconds (default 5).
    #[serde(default = "default_backoff_base")]
    pub backoff_base_secs: u64,
    /// Backoff ceiling in seconds (default 60).
    #[serde(default = "default_backoff_max")]
    pub backoff_max_secs: u64,
    /// Edge handshake timeout in seconds (default 15).
    #[serde(default = "default_connect_timeout")]
    pub connect_timeout_secs: u64,
}

/// HTTP broker settings.
#[derive(Debug, Clone, Deserialize)]
pub struct BrokerConfig {
    /// Port the broker listens on (default 8081). Override with `QBEE_LISTEN_PORT`.
    #[serde(default = "default_listen_port")]
    pub listen_port: u16,
    /// Host on the device side that requests are forwarded to (default
    /// `localhost`). Override with `QBEE_REMOTE_HOST`.
    #[serde(default = "default_remote_host")]
    pub remote_host: String,
    /// Device port used when a request carries no `X-Qbee-Device-Port`
    /// (default 80). Override with `QBEE_REMOTE_PORT`.
    #[serde(default = "default_remote_port")]
    pub remote_port: u16,
    /// Scheme spoken to the device (default `http`). Override with
    /// `QBEE_REMOTE_PROTOCOL`.
    #[serde(default = "default_remote_protocol")]
    pub remote_protocol: String,
    /// Shared secret required in `X-Qbee-Authorization`. Override with
    /// `QBEE_TOKEN`. Unset disables authentication and logs a warning.
    pub auth_token: Option<String>,
    /// Idle seconds before a cached tunnel is torn down (default 300).
    #[serde(default = "default_tunnel_ttl")]
    pub tunnel_ttl_secs: u64,
    /// Seconds between cache sweeps (default 60).
    #[serde(default = "default_gc_interval")]
    pub gc_interval_secs: u64,
    /// Seconds between management API re-authentications (default 600).
    #[serde(default = "default_reauth_interval")]
    pub reauth_interval_secs: u64,
    /// Seconds to wait for a new tunnel's local port (default 30).
    #[serde(default = "default_ready_timeout")]
    pub ready_timeout_secs: u64,
    /// Lifetime of a browser session cookie in seconds (default 900).
    #[serde(default = "default_session_ttl")]
    pub session_ttl_secs: u64,
}

/// Logging configuration.
#[derive(Debug, Clone, Deserialize)]
pub struct LoggingConfig {
    /// tracing filter level (default `info`). Overridden by `RUST_LOG` env var.
    #[serde(default = "default_log_level")]
    pub level: String,
}

fn default_base_url() -> String {
    DEFAULT_BASE_URL.to_string()
}
fn default_retries() -> u32 {
    1
}
fn default_backoff_base() -> u64 {
    5
}
fn default_backoff_max() -> u64 {
    60
}
fn default_connect_timeout() -> u64 {
    15
}
fn default_listen_port() -> u16 {
    8081
}
fn default_remote_host() -> String {
    "localhost".to_string()
}
fn default_remote_port() -> u16 {
    80
}
fn default_remote_protocol() -> String {
    "http".to_string()
}
fn default_tunnel_ttl() -> u64 {
    300
}
fn default_gc_interval() -> u64 {
    60
}
fn default_reauth_interval() -> u64 {
    600
}
fn default_ready_timeout() -> u64 {
    30
}
fn default_session_ttl() -> u64 {
    900
}
fn default_log_level() -> String {
    "info".to_string()
}

impl Default for ApiConfig {
    fn default() -> Self {
        Self {
            base_url: default_base_url(),
            email: None,
            password: None,
            token: None,
        }
    }
}

impl Default for ConnectConfig {
    fn default() -> Self {
        Self {
            retries: default_retries(),
            backoff_base_secs: default_backoff_base(),
            backoff_max_secs: default_backoff_max(),
            connect_timeout_secs: default_connect_timeout(),
        }
    }
}

impl Default for BrokerConfig {
    fn default() -> Self {
        Self {
            listen_port: default_listen_port(),
            remote_host: default_remote_host(),
            remote_port: default_remote_port(),
            remote_protocol: default_remote_protocol(),
            auth_token: None,
            tunnel_ttl_secs: default_tunnel_ttl(),
            gc_interval_secs: default_gc_interval(),
            reauth_interval_secs: default_reauth_interval(),
            ready_timeout_secs: default_ready_timeout(),
            session_ttl_secs: default_session_ttl(),
        }
    }
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: default_log_level(),
        }
    }
}

impl ApiConfig {
    pub fn credentials(&self) -> Credentials {
        Credentials {
            email: self.email.clone(),
            password: self.password.clone(),
            token: self.token.clone(),
        }
    }
}

impl ConnectConfig {
    pub fn retry_policy(&self) -> RetryPolicy {
        RetryPolicy {
            retries: self.retries,
            base: Duration::from_secs(self.backoff_base_secs),
            max: Duration::from_secs(self.backoff_max_secs),
        }
    }

    pub fn connect_timeout(&self) -> Duration {
        Duration::from_secs(self.connect_timeout_secs)
    }
}

impl BrokerConfig {
    pub fn tunnel_ttl(&self) -> Duration {
        Duration::from_secs(self.tunnel_ttl_secs)
    }

    pub fn gc_interval(&self) -> Duration {
        Duration::from_secs(self.gc_interval_secs)
    }

    pub fn reauth_interval(&self) -> Duration {
        Duration::from_secs(self.reauth_interval_secs)
    }

    pub fn ready_timeout(&self) -> Duration {
        Duration::from_secs(self.ready_timeout_secs)
    }

    pub fn session_ttl(&self) -> Duration {
        Duration::from_secs(self.session_ttl_secs)
    }
}

impl Config {
    /// Load configuration with the precedence chain: env vars > file > defaults.
    ///
    /// If `path` is `Some`, that file must exist. Otherwise `qbee-connect.toml`
    /// in the current directory is used when present.
    pub fn load(path: Option<&str>) -> Result<Self, ConfigError> {
        let mut config = match path {
            Some(p) => Self::from_file(p)?,
            None if Path::new(DEFAULT_SETTINGS_FILE).exists() => Self::from_file(DEFAULT_SETTINGS_FILE)?,
            None => Self::default(),
        };
        config.apply_env(|key| std::env::var(key).ok())?;
        config.validate()?;
        Ok(config)
    }

    fn from_file(path: &str) -> Result<Self, ConfigError> {
        let content = std::fs::read_to_string(path).map_err(|source| ConfigError::Read {
            path: path.to_string(),
            source,
        })?;
        toml::from_str(&content).map_err(|e| ConfigError::Parse {
            path: path.to_string(),
            message: e.to_string(),
        })
    }

    /// Apply environment overrides read through `var`.
    pub fn apply_env<F>(&mut self, var: F) -> Result<(), ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let get = |key: &str| var(key).filter(|v| !v.is_empty());

        if let Some(url) = get("QBEE_BASEURL") {
            self.api.base_url = url;
        }
        if let Some(email) = get("QBEE_EMAIL").or_else(|| get("QBEE_USERNAME")) {
            self.api.email = Some(email);
        }
        if let Some(password) = get("QBEE_PASSWORD") {
            self.api.password = Some(password);
        }
        if let Some(token) = get("QBEE_API_TOKEN") {
            self.api.token = Some(token);
        }
        if let Some(token) = get("QBEE_TOKEN") {
            self.broker.auth_token = Some(token);
        }
        if let Some(host) = get("QBEE_REMOTE_HOST") {
            self.broker.remote_host = host;
        }
        if let Some(protocol) = get("QBEE_REMOTE_PROTOCOL") {
            self.broker.remote_protocol = protocol;
        }
        if let Some(port) = get("QBEE_REMOTE_PORT") {
            self.broker.remote_port = parse_port_var("QBEE_REMOTE_PORT", &port)?;
        }
        if let Some(port) = get("QBEE_LISTEN_PORT") {
            self.broker.listen_port = parse_port_var("QBEE_LISTEN_PORT", &port)?;
        }
        Ok(())
    }

    /// Reject settings the broker cannot serve.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.broker.remote_protocol != "http" {
            return Err(ConfigError::Invalid(format!(
                "unsupported remote protocol {:?}: only http is supported",
                self.broker.remote_protocol
            )));
        }
        if self.broker.gc_interval_secs == 0 || self.broker.reauth_interval_secs == 0 {
            return Err(ConfigError::Invalid(
                "broker intervals must be at least one second".to_string(),
            ));
        }
        Ok(())
    }
}

/// Read a JSON connect file: an array of `{"device_id", "targets"}` objects.
pub fn load_connections(path: &str) -> Result<Vec<DeviceConnection>, ConfigError> {
    let content = std::fs::read_to_string(path).map_err(|source| ConfigError::Read {
        path: path.to_string(),
        source,
    })?;
    serde_json::from_str(&content).map_err(|e| ConfigError::Parse {
        path: path.to_string(),
        message: e.to_string(),
    })
}

fn parse_port_var(name: &str, value: &str) -> Result<u16, ConfigError> {
    value
        .parse()
        .map_err(|_| ConfigError::Invalid(format!("{name}: invalid port {value:?}")))
}
