//! Transport abstraction for outbound API calls.
//!
//! The resilience layer never speaks HTTP itself. It hands an [`ApiRequest`]
//! to a [`Transport`] and gets back either a response (of any status) or a
//! transport-level error.

use async_trait::async_trait;
use forkwatch_core::ApiFailure;
use serde::de::DeserializeOwned;
use std::collections::BTreeMap;
use std::time::Duration;
use thiserror::Error;

#[cfg(feature = "github")]
mod github;

#[cfg(feature = "github")]
pub use github::{GithubTransport, GITHUB_API_URL};

/// Transport-level failures: the request never produced a response.
#[derive(Error, Debug, Clone, PartialEq)]
pub enum TransportError {
    #[error("Timeout after {0:?}")]
    Timeout(Duration),

    #[error("Connection failed: {0}")]
    Connect(String),

    #[error("Transport error: {0}")]
    Other(String),
}

impl From<TransportError> for ApiFailure {
    fn from(err: TransportError) -> Self {
        match err {
            TransportError::Timeout(after) => ApiFailure::Timeout(format!("{after:?}")),
            TransportError::Connect(msg) => ApiFailure::Connection(msg),
            TransportError::Other(msg) => ApiFailure::Other(msg),
        }
    }
}

/// HTTP method. Only what the fork traversal needs.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Method {
    Get,
    Head,
}

/// An outbound API request, relative to the transport's base URL.
#[derive(Debug, Clone, PartialEq)]
pub struct ApiRequest {
    pub method: Method,

    /// Path such as `/repos/rust-lang/rust/forks`
    pub path: String,

    /// Query parameters, in order
    pub query: Vec<(String, String)>,
}

impl ApiRequest {
    /// Create a GET request.
    pub fn get(path: impl Into<String>) -> Self {
        Self {
            method: Method::Get,
            path: path.into(),
            query: Vec::new(),
        }
    }

    /// Add a query parameter.
    pub fn query(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.query.push((key.into(), value.into()));
        self
    }
}

/// A response as returned by the transport, successful or not.
#[derive(Debug, Clone, PartialEq)]
pub struct ApiResponse {
    pub status: u16,

    /// Header names lowercased
    pub headers: BTreeMap<String, String>,

    pub body: String,
}

impl ApiResponse {
    /// Create a response with no headers.
    pub fn new(status: u16, body: impl Into<String>) -> Self {
        Self {
            status,
            headers: BTreeMap::new(),
            body: body.into(),
        }
    }

    /// Add a header (name is lowercased).
    pub fn with_header(mut self, name: &str, value: impl Into<String>) -> Self {
        self.headers.insert(name.to_ascii_lowercase(), value.into());
        self
    }

    pub fn is_success(&self) -> bool {
        (200..300).contains(&self.status)
    }

    /// Turn non-2xx responses into an [`ApiFailure`] for classification.
    pub fn into_result(self) -> Result<ApiResponse, ApiFailure> {
        if self.is_success() {
            Ok(self)
        } else {
            Err(ApiFailure::Http {
                status: self.status,
                headers: self.headers,
                body: self.body,
            })
        }
    }

    /// Parse the body as JSON.
    pub fn json<T: DeserializeOwned>(&self) -> Result<T, serde_json::Error> {
        serde_json::from_str(&self.body)
    }
}

/// The single primitive consumed from the HTTP layer.
#[async_trait]
pub trait Transport: Send + Sync {
    /// Send a request. Non-2xx statuses are `Ok` responses.
    async fn send(&self, request: ApiRequest) -> Result<ApiResponse, TransportError>;

    /// Transport name for logs.
    fn name(&self) -> &str {
        "transport"
    }
}

/// Send a request and fold transport errors and non-2xx statuses into one
/// unclassified failure type.
pub async fn send_checked<T: Transport + ?Sized>(
    transport: &T,
    request: ApiRequest,
) -> Result<ApiResponse, ApiFailure> {
    transport
        .send(request)
        .await
        .map_err(ApiFailure::from)?
        .into_result()
}
