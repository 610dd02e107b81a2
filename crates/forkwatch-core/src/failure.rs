//! Failure taxonomy for outbound GitHub API calls.

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;
use std::time::Duration;
use thiserror::Error;

/// The kind of a failed call.
///
/// Closed set: every raw error maps to exactly one of these.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FailureKind {
    /// Primary or secondary rate limit hit
    RateLimited,

    /// Timeout or connection failure
    Network,

    /// Resource missing or gone (deleted fork, renamed repo)
    NotFound,

    /// Access denied for reasons other than rate limiting
    Forbidden,

    /// 5xx from the API
    ServerError,

    /// Anything unrecognized
    Unknown,
}

impl FailureKind {
    /// All kinds, in declaration order.
    pub const ALL: [FailureKind; 6] = [
        FailureKind::RateLimited,
        FailureKind::Network,
        FailureKind::NotFound,
        FailureKind::Forbidden,
        FailureKind::ServerError,
        FailureKind::Unknown,
    ];

    /// Whether retrying the same call can plausibly succeed.
    pub fn is_transient(self) -> bool {
        matches!(
            self,
            FailureKind::RateLimited
                | FailureKind::Network
                | FailureKind::ServerError
                | FailureKind::Unknown
        )
    }

    /// Whether the failure is a property of the item rather than the API.
    pub fn is_permanent(self) -> bool {
        matches!(self, FailureKind::NotFound | FailureKind::Forbidden)
    }

    pub fn as_str(self) -> &'static str {
        match self {
            FailureKind::RateLimited => "rate_limited",
            FailureKind::Network => "network",
            FailureKind::NotFound => "not_found",
            FailureKind::Forbidden => "forbidden",
            FailureKind::ServerError => "server_error",
            FailureKind::Unknown => "unknown",
        }
    }
}

impl fmt::Display for FailureKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A classified failure.
#[derive(Error, Debug, Clone, PartialEq)]
#[error("{kind}: {message}")]
pub struct Failure {
    /// What went wrong
    pub kind: FailureKind,

    /// Server-suggested wait before retrying, if any
    pub retry_after: Option<Duration>,

    /// Raw message from the response body or transport
    pub message: String,

    /// HTTP status, when the failure came from a response
    pub status: Option<u16>,
}

impl Failure {
    /// Create a failure with no status or retry hint.
    pub fn new(kind: FailureKind, message: impl Into<String>) -> Self {
        Self {
            kind,
            retry_after: None,
            message: message.into(),
            status: None,
        }
    }

    /// Attach a retry hint.
    pub fn with_retry_after(mut self, retry_after: Duration) -> Self {
        self.retry_after = Some(retry_after);
        self
    }

    /// Attach an HTTP status.
    pub fn with_status(mut self, status: u16) -> Self {
        self.status = Some(status);
        self
    }
}

/// A raw, unclassified failure as produced by a transport.
#[derive(Debug, Clone, PartialEq)]
pub enum ApiFailure {
    /// The server answered with a non-success status.
    Http {
        status: u16,
        /// Header names are expected lowercased.
        headers: BTreeMap<String, String>,
        body: String,
    },

    /// The request did not complete in time.
    Timeout(String),

    /// The connection could not be established or was dropped.
    Connection(String),

    /// Anything else the transport could not describe.
    Other(String),
}

impl ApiFailure {
    /// Build an HTTP failure with no headers.
    pub fn http(status: u16, body: impl Into<String>) -> Self {
        ApiFailure::Http {
            status,
            headers: BTreeMap::new(),
            body: body.into(),
        }
    }

    /// Add a header to an HTTP failure. No-op for other variants.
    pub fn with_header(mut self, name: &str, value: impl Into<String>) -> Self {
        if let ApiFailure::Http { headers, .. } = &mut self {
            headers.insert(name.to_ascii_lowercase(), value.into());
        }
        self
    }

    pub fn status(&self) -> Option<u16> {
        match self {
            ApiFailure::Http { status, .. } => Some(*status),
            _ => None,
        }
    }
}

impl fmt::Display for ApiFailure {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ApiFailure::Http { status, body, .. } => write!(f, "HTTP {status}: {body}"),
            ApiFailure::Timeout(msg) => write!(f, "timeout: {msg}"),
            ApiFailure::Connection(msg) => write!(f, "connection error: {msg}"),
            ApiFailure::Other(msg) => f.write_str(msg),
        }
    }
}
