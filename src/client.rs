//! HTTP client for metadata lookups.

use async_trait::async_trait;
use reqwest::{
    header::{HeaderMap, HeaderValue, ACCEPT, CACHE_CONTROL},
    Client, StatusCode,
};
use std::time::Duration;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum ClientError {
    #[error("HTTP request failed: {0}")]
    Request(#[from] reqwest::Error),
    #[error("Request timed out")]
    Timeout,
    #[error("Connection failed: {0}")]
    Connect(String),
    #[error("Not found")]
    NotFound,
    #[error("Server returned error status: {status}")]
    ServerError { status: StatusCode },
    #[error("Rate limited, retry after {retry_after:?}")]
    RateLimited { retry_after: Option<Duration> },
    #[error("Invalid response: {0}")]
    InvalidResponse(String),
}

impl ClientError {
    pub fn is_timeout(&self) -> bool {
        match self {
            ClientError::Timeout => true,
            ClientError::Request(e) => e.is_timeout(),
            _ => false,
        }
    }

    /// Failures that say the service or the network is unhealthy, as opposed
    /// to "this aircraft is unknown".
    pub fn is_host_level(&self) -> bool {
        match self {
            ClientError::Timeout | ClientError::Connect(_) | ClientError::RateLimited { .. } => true,
            ClientError::ServerError { status } => status.is_server_error(),
            ClientError::Request(e) => e.is_timeout() || e.is_connect(),
            ClientError::NotFound | ClientError::InvalidResponse(_) => false,
        }
    }
}

/// Anything that can GET a URL and hand back its JSON body.
#[async_trait]
pub trait MetadataFetch: Send + Sync {
    async fn fetch_json(&self, url: &str) -> Result<serde_json::Value, ClientError>;
}

/// Configuration for the HTTP client.
#[derive(Debug, Clone)]
pub struct ClientConfig {
    /// Per-request timeout
    pub timeout: Duration,
    pub user_agent: String,
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self {
            timeout: Duration::from_secs(5),
            user_agent: concat!("airlogger/", env!("CARGO_PKG_VERSION")).to_string(),
        }
    }
}

impl ClientConfig {
    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }
}

/// `reqwest`-backed metadata client.
pub struct HttpClient {
    client: Client,
}

impl HttpClient {
    pub fn new(config: ClientConfig) -> Result<Self, ClientError> {
        let mut headers = HeaderMap::new();
        headers.insert(ACCEPT, HeaderValue::from_static("application/json"));
        headers.insert(CACHE_CONTROL, HeaderValue::from_static("no-cache"));

        let client = Client::builder()
            .default_headers(headers)
            .user_agent(config.user_agent)
            .timeout(config.timeout)
            .gzip(true)
            .build()?;

        Ok(Self { client })
    }
}

#[async_trait]
impl MetadataFetch for HttpClient {
    async fn fetch_json(&self, url: &str) -> Result<serde_json::Value, ClientError> {
        tracing::debug!("Fetching: {}", url);

        let response = self.client.get(url).send().await.map_err(classify)?;

        match response.status() {
            StatusCode::OK => {
                let body = response.bytes().await.map_err(classify)?;
                serde_json::from_slice(&body).map_err(|e| ClientError::InvalidResponse(e.to_string()))
            }
            StatusCode::NOT_FOUND => Err(ClientError::NotFound),
            StatusCode::TOO_MANY_REQUESTS => {
                let retry_after = response
                    .headers()
                    .get("retry-after")
                    .and_then(|v| v.to_str().ok())
                    .and_then(|v| v.parse::<u64>().ok())
                    .map(Duration::from_secs);

                Err(ClientError::RateLimited { retry_after })
            }
            status => Err(ClientError::ServerError { status }),
        }
    }
}

fn classify(e: reqwest::Error) -> ClientError {
    if e.is_timeout() {
        ClientError::Timeout
    } else if e.is_connect() {
        ClientError::Connect(e.to_string())
    } else {
        ClientError::Request(e)
    }
}
