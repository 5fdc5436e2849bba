use std::time::Duration;

use async_trait::async_trait;
use reqwest::StatusCode;
use serde::Serialize;
use thiserror::Error;
use uuid::Uuid;

use crate::model::{CreateTunnelRequest, PingResponse, Tunnel, TunnelEnvelope};

pub const DEFAULT_API_PREFIX: &str = "/tunnel_me_out/api/v1";
pub const API_KEY_HEADER: &str = "X-Api-Key";

#[derive(Debug, Clone)]
pub struct TunnelApiConfig {
    pub base_url: String,
    pub api_prefix: String,
    pub api_key: Option<String>,
    /// No timeout when unset; a slow request just delays its handler.
    pub timeout_ms: Option<u64>,
}

impl TunnelApiConfig {
    #[must_use]
    pub fn new(base_url: impl Into<String>) -> Self {
        Self {
            base_url: base_url.into(),
            api_prefix: DEFAULT_API_PREFIX.to_string(),
            api_key: None,
            timeout_ms: None,
        }
    }
}

#[derive(Debug, Clone, Error)]
pub enum TunnelApiError {
    #[error("tunnel_api_base_url_missing")]
    BaseUrlMissing,
    #[error("tunnel_api_invalid_path")]
    InvalidPath,
    #[error("tunnel_request_failed:{message}")]
    Request { message: String },
    #[error("tunnel_read_failed:{message}")]
    Read { message: String },
    #[error("tunnel_http_{status}:{body}")]
    Http { status: StatusCode, body: String },
    #[error("tunnel_json_decode_failed:{message}")]
    Decode { message: String },
}

impl TunnelApiError {
    /// Message suitable for a user notification. FastAPI-style error bodies
    /// (`{"detail": "..."}`) contribute their detail text.
    #[must_use]
    pub fn user_message(&self) -> String {
        match self {
            Self::Http { status, body } => {
                let detail = serde_json::from_str::<serde_json::Value>(body)
                    .ok()
                    .and_then(|value| match value.get("detail") {
                        Some(serde_json::Value::String(detail)) => Some(detail.clone()),
                        Some(other) if !other.is_null() => Some(other.to_string()),
                        _ => None,
                    });
                match detail {
                    Some(detail) => detail,
                    None if body == EMPTY_BODY => format!("Request failed ({status})"),
                    None => body.clone(),
                }
            }
            Self::Request { .. } => "Could not reach the tunnel service".to_string(),
            Self::Read { .. } | Self::Decode { .. } => {
                "Unexpected response from the tunnel service".to_string()
            }
            Self::BaseUrlMissing | Self::InvalidPath => self.to_string(),
        }
    }
}

/// Transport for the tunnel backend.
#[async_trait]
pub trait TunnelApi: Send + Sync {
    async fn get_tunnel(&self) -> Result<TunnelEnvelope, TunnelApiError>;
    async fn create_tunnel(&self, request: &CreateTunnelRequest)
    -> Result<Tunnel, TunnelApiError>;
    async fn confirm_tunnel(&self, payment_hash: &str) -> Result<Tunnel, TunnelApiError>;
    async fn ping_tunnel(&self) -> Result<PingResponse, TunnelApiError>;
    async fn reconnect_tunnel(&self) -> Result<Tunnel, TunnelApiError>;
}

#[derive(Debug, Clone)]
pub struct HttpTunnelApi {
    base_url: String,
    api_key: Option<String>,
    timeout: Option<Duration>,
    http: reqwest::Client,
}

const EMPTY_BODY: &str = "<empty>";

impl HttpTunnelApi {
    pub fn new(config: TunnelApiConfig) -> Result<Self, TunnelApiError> {
        let root = normalize_base_url(&config.base_url)?;
        let prefix = config.api_prefix.trim().trim_end_matches('/');
        let base_url = if prefix.is_empty() {
            root
        } else if prefix.starts_with('/') {
            format!("{root}{prefix}")
        } else {
            format!("{root}/{prefix}")
        };
        Ok(Self {
            base_url,
            api_key: config
                .api_key
                .map(|key| key.trim().to_string())
                .filter(|key| !key.is_empty()),
            timeout: config.timeout_ms.map(Duration::from_millis),
            http: reqwest::Client::new(),
        })
    }

    #[must_use]
    pub fn endpoint(&self, path: &str) -> Option<String> {
        let trimmed = path.trim();
        if trimmed.is_empty() {
            return None;
        }
        if trimmed.starts_with('/') {
            Some(format!("{}{}", self.base_url, trimmed))
        } else {
            Some(format!("{}/{}", self.base_url, trimmed))
        }
    }

    #[must_use]
    pub fn tunnel_path() -> &'static str {
        "/tunnel"
    }

    #[must_use]
    pub fn confirm_path(payment_hash: &str) -> String {
        let encoded: String =
            url::form_urlencoded::byte_serialize(payment_hash.trim().as_bytes()).collect();
        format!("/tunnel/confirm?payment_hash={encoded}")
    }

    #[must_use]
    pub fn ping_path() -> &'static str {
        "/tunnel/ping"
    }

    #[must_use]
    pub fn reconnect_path() -> &'static str {
        "/tunnel/reconnect"
    }

    pub async fn get_json<T>(&self, path: &str) -> Result<T, TunnelApiError>
    where
        T: for<'de> serde::Deserialize<'de>,
    {
        let url = self.endpoint(path).ok_or(TunnelApiError::InvalidPath)?;
        let request = self.prepare(self.http.get(url.as_str()));
        let response = request
            .send()
            .await
            .map_err(|error| TunnelApiError::Request {
                message: error.to_string(),
            })?;
        decode_json_response(response).await
    }

    pub async fn post_json<Req, Res>(
        &self,
        path: &str,
        payload: Option<&Req>,
    ) -> Result<Res, TunnelApiError>
    where
        Req: Serialize + ?Sized,
        Res: for<'de> serde::Deserialize<'de>,
    {
        let url = self.endpoint(path).ok_or(TunnelApiError::InvalidPath)?;
        let mut request = self.prepare(self.http.post(url.as_str()));
        if let Some(payload) = payload {
            request = request.json(payload);
        }
        let response = request
            .send()
            .await
            .map_err(|error| TunnelApiError::Request {
                message: error.to_string(),
            })?;
        decode_json_response(response).await
    }

    fn prepare(&self, request: reqwest::RequestBuilder) -> reqwest::RequestBuilder {
        let mut request =
            request.header("x-request-id", format!("req_{}", Uuid::new_v4().simple()));
        if let Some(api_key) = self.api_key.as_deref() {
            request = request.header(API_KEY_HEADER, api_key);
        }
        if let Some(timeout) = self.timeout {
            request = request.timeout(timeout);
        }
        request
    }
}

#[async_trait]
impl TunnelApi for HttpTunnelApi {
    async fn get_tunnel(&self) -> Result<TunnelEnvelope, TunnelApiError> {
        self.get_json(Self::tunnel_path()).await
    }

    async fn create_tunnel(
        &self,
        request: &CreateTunnelRequest,
    ) -> Result<Tunnel, TunnelApiError> {
        self.post_json(Self::tunnel_path(), Some(request)).await
    }

    async fn confirm_tunnel(&self, payment_hash: &str) -> Result<Tunnel, TunnelApiError> {
        self.post_json::<(), _>(Self::confirm_path(payment_hash).as_str(), None)
            .await
    }

    async fn ping_tunnel(&self) -> Result<PingResponse, TunnelApiError> {
        self.get_json(Self::ping_path()).await
    }

    async fn reconnect_tunnel(&self) -> Result<Tunnel, TunnelApiError> {
        self.post_json::<(), _>(Self::reconnect_path(), None).await
    }
}

pub fn format_http_error(status: StatusCode, body: &[u8]) -> TunnelApiError {
    let text = String::from_utf8_lossy(body);
    let trimmed = text.trim();
    let body = if trimmed.is_empty() {
        EMPTY_BODY.to_string()
    } else {
        trimmed.to_string()
    };
    TunnelApiError::Http { status, body }
}

fn normalize_base_url(base_url: &str) -> Result<String, TunnelApiError> {
    let trimmed = base_url.trim();
    if trimmed.is_empty() {
        return Err(TunnelApiError::BaseUrlMissing);
    }
    Ok(trimmed.trim_end_matches('/').to_string())
}

async fn decode_json_response<T>(response: reqwest::Response) -> Result<T, TunnelApiError>
where
    T: for<'de> serde::Deserialize<'de>,
{
    let status = response.status();
    let bytes = response
        .bytes()
        .await
        .map_err(|error| TunnelApiError::Read {
            message: error.to_string(),
        })?;

    if !status.is_success() {
        return Err(format_http_error(status, &bytes));
    }

    serde_json::from_slice::<T>(&bytes).map_err(|error| TunnelApiError::Decode {
        message: error.to_string(),
    })
}
