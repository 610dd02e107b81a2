//! GitHub REST transport backed by `reqwest`.

use super::{ApiRequest, ApiResponse, Method, Transport, TransportError};
use async_trait::async_trait;
use std::collections::BTreeMap;
use std::time::Duration;

/// Public GitHub API root.
pub const GITHUB_API_URL: &str = "https://api.github.com";

const USER_AGENT: &str = concat!("forkwatch/", env!("CARGO_PKG_VERSION"));

/// Transport that talks to the GitHub REST API.
#[derive(Debug, Clone)]
pub struct GithubTransport {
    client: reqwest::Client,
    base_url: String,
    timeout: Duration,
}

impl GithubTransport {
    /// Create a transport for the public API.
    pub fn new(timeout: Duration) -> Result<Self, TransportError> {
        let client = reqwest::Client::builder()
            .timeout(timeout)
            .user_agent(USER_AGENT)
            .build()
            .map_err(|e| TransportError::Other(e.to_string()))?;

        Ok(Self {
            client,
            base_url: GITHUB_API_URL.to_string(),
            timeout,
        })
    }

    /// Set custom base URL (GitHub Enterprise, test servers).
    pub fn with_base_url(mut self, url: impl Into<String>) -> Self {
        self.base_url = url.into().trim_end_matches('/').to_string();
        self
    }

    fn map_error(&self, err: reqwest::Error) -> TransportError {
        if err.is_timeout() {
            TransportError::Timeout(self.timeout)
        } else if err.is_connect() {
            TransportError::Connect(err.to_string())
        } else {
            TransportError::Other(err.to_string())
        }
    }
}

#[async_trait]
impl Transport for GithubTransport {
    async fn send(&self, request: ApiRequest) -> Result<ApiResponse, TransportError> {
        let url = format!("{}{}", self.base_url, request.path);
        let builder = match request.method {
            Method::Get => self.client.get(&url),
            Method::Head => self.client.head(&url),
        };

        let response = builder
            .query(&request.query)
            .header("accept", "application/vnd.github+json")
            .send()
            .await
            .map_err(|e| self.map_error(e))?;

        let status = response.status().as_u16();
        let headers: BTreeMap<String, String> = response
            .headers()
            .iter()
            .filter_map(|(name, value)| {
                value
                    .to_str()
                    .ok()
                    .map(|v| (name.as_str().to_ascii_lowercase(), v.to_string()))
            })
            .collect();

        let body = response.text().await.map_err(|e| self.map_error(e))?;

        tracing::trace!(path = %request.path, status, "github response");

        Ok(ApiResponse {
            status,
            headers,
            body,
        })
    }

    fn name(&self) -> &str {
        "github"
    }
}
