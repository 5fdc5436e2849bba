use std::{env, time::Duration};

use thiserror::Error;
use tracing::debug;
use url::Url;

use crate::api::{DEFAULT_API_PREFIX, TunnelApiConfig};
use crate::payment::ReconnectPolicy;

pub const DEFAULT_BASE_URL: &str = "http://127.0.0.1:5000";
pub const DEFAULT_PING_INTERVAL_SECS: u64 = 60;
pub const WS_PATH: &str = "/api/v1/ws";

pub const ENV_BASE_URL: &str = "TUNNEL_ME_OUT_BASE_URL";
pub const ENV_API_KEY: &str = "TUNNEL_ME_OUT_API_KEY";
pub const ENV_WS_BASE: &str = "TUNNEL_ME_OUT_WS_BASE";
pub const ENV_CONFIRM_MODE: &str = "TUNNEL_ME_OUT_CONFIRM_MODE";
pub const ENV_TIMEOUT_MS: &str = "TUNNEL_ME_OUT_TIMEOUT_MS";
pub const ENV_PING_INTERVAL_SECS: &str = "TUNNEL_ME_OUT_PING_INTERVAL_SECS";
pub const ENV_WS_RECONNECT_ATTEMPTS: &str = "TUNNEL_ME_OUT_WS_RECONNECT_ATTEMPTS";
pub const ENV_WS_RECONNECT_BASE_MS: &str = "TUNNEL_ME_OUT_WS_RECONNECT_BASE_MS";
pub const ENV_WS_RECONNECT_MAX_MS: &str = "TUNNEL_ME_OUT_WS_RECONNECT_MAX_MS";

/// How a paid payment event is turned into authoritative tunnel state.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub enum ConfirmMode {
    /// Re-read the tunnel with `GET tunnel`.
    #[default]
    Refetch,
    /// Call `POST tunnel/confirm?payment_hash=..` and keep its response.
    ConfirmEndpoint,
}

impl ConfirmMode {
    #[must_use]
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Refetch => "refetch",
            Self::ConfirmEndpoint => "confirm",
        }
    }

    pub fn parse(raw: &str) -> Result<Self, ConfigError> {
        match raw.trim().to_ascii_lowercase().as_str() {
            "refetch" => Ok(Self::Refetch),
            "confirm" | "confirm_endpoint" => Ok(Self::ConfirmEndpoint),
            other => Err(ConfigError::InvalidConfirmMode(other.to_string())),
        }
    }
}

#[derive(Debug, Error, PartialEq, Eq)]
pub enum ConfigError {
    #[error("invalid TUNNEL_ME_OUT_BASE_URL: {0}")]
    InvalidBaseUrl(String),
    #[error("invalid TUNNEL_ME_OUT_WS_BASE: {0}")]
    InvalidWsBase(String),
    #[error("invalid TUNNEL_ME_OUT_CONFIRM_MODE: {0}")]
    InvalidConfirmMode(String),
    #[error("invalid TUNNEL_ME_OUT_TIMEOUT_MS: {0}")]
    InvalidTimeoutMs(String),
    #[error("invalid TUNNEL_ME_OUT_PING_INTERVAL_SECS: {0}")]
    InvalidPingInterval(String),
    #[error("invalid websocket reconnect setting: {0}")]
    InvalidReconnectPolicy(String),
}

#[derive(Clone, Debug)]
pub struct ClientConfig {
    pub base_url: String,
    pub api_key: Option<String>,
    pub ws_base: String,
    pub confirm_mode: ConfirmMode,
    pub timeout_ms: Option<u64>,
    pub ping_interval: Duration,
    pub ws_reconnect: ReconnectPolicy,
}

impl ClientConfig {
    /// Config pointing at `base_url` with every other setting at its default.
    pub fn new(base_url: &str) -> Result<Self, ConfigError> {
        let base_url = normalize_http_url(base_url).map_err(ConfigError::InvalidBaseUrl)?;
        let ws_base = derive_ws_base(&base_url);
        Ok(Self {
            base_url,
            api_key: None,
            ws_base,
            confirm_mode: ConfirmMode::default(),
            timeout_ms: None,
            ping_interval: Duration::from_secs(DEFAULT_PING_INTERVAL_SECS),
            ws_reconnect: ReconnectPolicy::disabled(),
        })
    }

    pub fn from_env() -> Result<Self, ConfigError> {
        let base_url = env_non_empty(ENV_BASE_URL).unwrap_or_else(|| DEFAULT_BASE_URL.to_string());
        let mut config = Self::new(&base_url)?;

        config.api_key = env_non_empty(ENV_API_KEY);
        if let Some(ws_base) = env_non_empty(ENV_WS_BASE) {
            config.ws_base = normalize_ws_url(&ws_base).map_err(ConfigError::InvalidWsBase)?;
        }
        if let Some(mode) = env_non_empty(ENV_CONFIRM_MODE) {
            config.confirm_mode = ConfirmMode::parse(&mode)?;
        }
        config.timeout_ms = env_non_empty(ENV_TIMEOUT_MS)
            .map(|raw| {
                raw.parse::<u64>()
                    .map_err(|error| ConfigError::InvalidTimeoutMs(error.to_string()))
            })
            .transpose()?;

        let ping_interval_secs = env_non_empty(ENV_PING_INTERVAL_SECS)
            .unwrap_or_else(|| DEFAULT_PING_INTERVAL_SECS.to_string())
            .parse::<u64>()
            .map_err(|error| ConfigError::InvalidPingInterval(error.to_string()))?;
        if ping_interval_secs == 0 {
            return Err(ConfigError::InvalidPingInterval(
                "must be greater than zero".to_string(),
            ));
        }
        config.ping_interval = Duration::from_secs(ping_interval_secs);

        let parse_reconnect = |key: &str, default: u64| -> Result<u64, ConfigError> {
            env_non_empty(key)
                .map_or(Ok(default), |raw| raw.parse::<u64>())
                .map_err(|error| ConfigError::InvalidReconnectPolicy(format!("{key}: {error}")))
        };
        let defaults = ReconnectPolicy::disabled();
        let max_attempts = parse_reconnect(ENV_WS_RECONNECT_ATTEMPTS, 0)?;
        let base_ms = parse_reconnect(
            ENV_WS_RECONNECT_BASE_MS,
            defaults.base_delay.as_millis() as u64,
        )?;
        let max_ms = parse_reconnect(
            ENV_WS_RECONNECT_MAX_MS,
            defaults.max_delay.as_millis() as u64,
        )?;
        if max_ms < base_ms {
            return Err(ConfigError::InvalidReconnectPolicy(format!(
                "{ENV_WS_RECONNECT_MAX_MS} ({max_ms}) is below {ENV_WS_RECONNECT_BASE_MS} ({base_ms})"
            )));
        }
        config.ws_reconnect = ReconnectPolicy {
            max_attempts: u32::try_from(max_attempts).map_err(|error| {
                ConfigError::InvalidReconnectPolicy(format!(
                    "{ENV_WS_RECONNECT_ATTEMPTS}: {error}"
                ))
            })?,
            base_delay: Duration::from_millis(base_ms),
            max_delay: Duration::from_millis(max_ms),
        };

        Ok(config)
    }

    /// Point at another backend. A websocket base that was derived from the
    /// old base URL follows the new one; an explicit one is kept.
    pub fn with_base_url(mut self, base_url: &str) -> Result<Self, ConfigError> {
        let base_url = normalize_http_url(base_url).map_err(ConfigError::InvalidBaseUrl)?;
        if self.ws_base == derive_ws_base(&self.base_url) {
            self.ws_base = derive_ws_base(&base_url);
        }
        self.base_url = base_url;
        Ok(self)
    }

    pub fn with_ws_base(mut self, ws_base: &str) -> Result<Self, ConfigError> {
        self.ws_base = normalize_ws_url(ws_base).map_err(ConfigError::InvalidWsBase)?;
        Ok(self)
    }

    #[must_use]
    pub fn api_config(&self) -> TunnelApiConfig {
        TunnelApiConfig {
            base_url: self.base_url.clone(),
            api_prefix: DEFAULT_API_PREFIX.to_string(),
            api_key: self.api_key.clone(),
            timeout_ms: self.timeout_ms,
        }
    }
}

/// `http(s)://host[:port]` becomes `ws(s)://host[:port]/api/v1/ws`.
#[must_use]
pub fn derive_ws_base(base_url: &str) -> String {
    let trimmed = base_url.trim();
    let Ok(mut url) = Url::parse(trimmed) else {
        return format!("{}{WS_PATH}", trimmed.trim_end_matches('/'));
    };
    let ws_scheme = match url.scheme() {
        "https" => "wss",
        "http" => "ws",
        other => other,
    }
    .to_string();
    if url.set_scheme(&ws_scheme).is_err() {
        debug!("keeping scheme of {} for websocket base", trimmed);
    }
    format!("{}{WS_PATH}", url.as_str().trim_end_matches('/'))
}

fn normalize_http_url(raw: &str) -> Result<String, String> {
    normalize_with_schemes(raw, &["http", "https"])
}

fn normalize_ws_url(raw: &str) -> Result<String, String> {
    normalize_with_schemes(raw, &["ws", "wss"])
}

fn normalize_with_schemes(raw: &str, schemes: &[&str]) -> Result<String, String> {
    let trimmed = raw.trim();
    if trimmed.is_empty() {
        return Err("must not be empty".to_string());
    }
    let url = Url::parse(trimmed).map_err(|error| format!("{trimmed}: {error}"))?;
    if !schemes.contains(&url.scheme()) {
        return Err(format!(
            "{trimmed} must use {}",
            schemes
                .iter()
                .map(|scheme| format!("{scheme}://"))
                .collect::<Vec<_>>()
                .join(" or ")
        ));
    }
    if url.host_str().is_none_or(str::is_empty) {
        return Err(format!("{trimmed} must include a host"));
    }
    Ok(url.as_str().trim_end_matches('/').to_string())
}

fn env_non_empty(key: &str) -> Option<String> {
    env::var(key)
        .ok()
        .map(|value| value.trim().to_string())
        .filter(|value| !value.is_empty())
}
