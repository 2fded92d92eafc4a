//! Client configuration.
//!
//! Every field has a production default; `from_env()` overrides them from
//! `NAKUPAK_*` environment variables so the agent binary can be configured
//! without a config file.

use reqwest::Url;
use std::path::PathBuf;
use std::time::Duration;

/// Default delay before the realtime channel redials after a close.
pub const DEFAULT_RECONNECT_DELAY: Duration = Duration::from_secs(3);

/// Client configuration.
#[derive(Debug, Clone)]
pub struct ClientConfig {
    /// Base URL of the REST API, e.g. `https://nakupak.example.com`
    pub api_base: String,
    /// Path of the realtime endpoint on the API host
    pub ws_path: String,
    /// Directory holding the offline queue and session snapshots
    pub data_dir: PathBuf,
    /// Fixed delay before an automatic reconnect (default: 3s)
    pub reconnect_delay: Duration,
    /// Per-request timeout for the HTTP client (None = transport default)
    pub request_timeout: Option<Duration>,
    /// How often the network monitor checks that the API host is reachable (default: 5s)
    pub check_interval: Duration,
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self {
            api_base: "http://127.0.0.1:8000".to_string(),
            ws_path: "/api/ws".to_string(),
            data_dir: PathBuf::from("nakupak_data"),
            reconnect_delay: DEFAULT_RECONNECT_DELAY,
            request_timeout: None,
            check_interval: Duration::from_secs(5),
        }
    }
}

impl ClientConfig {
    /// Config for testing (short reconnect delay, caller-provided paths).
    pub fn for_testing(api_base: impl Into<String>, data_dir: impl Into<PathBuf>) -> Self {
        Self {
            api_base: api_base.into(),
            data_dir: data_dir.into(),
            reconnect_delay: Duration::from_millis(100),
            request_timeout: Some(Duration::from_secs(2)),
            check_interval: Duration::from_millis(100),
            ..Self::default()
        }
    }

    /// Build a config from `NAKUPAK_*` environment variables.
    ///
    /// Unset variables keep their defaults; set-but-invalid ones are errors.
    pub fn from_env() -> Result<Self, ConfigError> {
        let mut config = Self::default();

        if let Ok(url) = std::env::var("NAKUPAK_API_URL") {
            config.api_base = url.trim_end_matches('/').to_string();
        }
        if let Ok(dir) = std::env::var("NAKUPAK_DATA_DIR") {
            config.data_dir = PathBuf::from(dir);
        }
        if let Some(ms) = env_millis("NAKUPAK_RECONNECT_MS")? {
            config.reconnect_delay = ms;
        }
        if let Some(ms) = env_millis("NAKUPAK_TIMEOUT_MS")? {
            config.request_timeout = Some(ms);
        }
        if let Some(ms) = env_millis("NAKUPAK_CHECK_MS")? {
            config.check_interval = ms;
        }

        config.validate()?;
        Ok(config)
    }

    /// Check that the API base parses and uses an HTTP scheme.
    pub fn validate(&self) -> Result<(), ConfigError> {
        let url = Url::parse(&self.api_base)
            .map_err(|e| ConfigError::InvalidUrl(format!("{}: {e}", self.api_base)))?;
        match url.scheme() {
            "http" | "https" => Ok(()),
            other => Err(ConfigError::InvalidUrl(format!(
                "unsupported scheme '{other}' in {}",
                self.api_base
            ))),
        }
    }

    /// Realtime endpoint URL carrying `token` as a query parameter.
    ///
    /// `http` becomes `ws` and `https` becomes `wss`.
    pub fn ws_url(&self, token: &str) -> Result<Url, ConfigError> {
        let base = self.api_base.trim_end_matches('/');
        let ws_base = base.replacen("http", "ws", 1);
        Url::parse_with_params(&format!("{ws_base}{}", self.ws_path), &[("token", token)])
            .map_err(|e| ConfigError::InvalidUrl(format!("{ws_base}: {e}")))
    }

    /// Host and port of the API, used by the network monitor.
    pub fn api_host_port(&self) -> Result<(String, u16), ConfigError> {
        let url = Url::parse(&self.api_base)
            .map_err(|e| ConfigError::InvalidUrl(format!("{}: {e}", self.api_base)))?;
        let host = url
            .host_str()
            .ok_or_else(|| ConfigError::InvalidUrl(format!("no host in {}", self.api_base)))?
            .to_string();
        let port = url
            .port_or_known_default()
            .ok_or_else(|| ConfigError::InvalidUrl(format!("no port in {}", self.api_base)))?;
        Ok((host, port))
    }
}

fn env_millis(key: &str) -> Result<Option<Duration>, ConfigError> {
    match std::env::var(key) {
        Ok(raw) => raw
            .trim()
            .parse::<u64>()
            .map(|ms| Some(Duration::from_millis(ms)))
            .map_err(|_| ConfigError::InvalidValue {
                key: key.to_string(),
                value: raw,
            }),
        Err(_) => Ok(None),
    }
}

/// Configuration errors.
#[derive(Debug, Clone)]
pub enum ConfigError {
    /// URL could not be parsed or has the wrong scheme
    InvalidUrl(String),
    /// Environment variable holds an unparseable value
    InvalidValue { key: String, value: String },
}

impl std::fmt::Display for ConfigError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ConfigError::InvalidUrl(e) => write!(f, "Invalid URL: {e}"),
            ConfigError::InvalidValue { key, value } => {
                write!(f, "Invalid value for {key}: '{value}'")
            }
        }
    }
}

impl std::error::Error for ConfigError {}
