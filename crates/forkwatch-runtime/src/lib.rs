//! # forkwatch-runtime
//!
//! Resilient GitHub API access for large repository traversals.
//!
//! Walking thousands of forks hits GitHub's rate limits and the occasional
//! outage. This crate keeps such a job alive:
//!
//! - Rate limits are waited out and never count as failures
//! - Sustained real failures open a per-endpoint circuit breaker
//! - While a circuit is open, new work is deferred instead of failing
//! - Breaker tolerance scales with the repository's size
//!
//! The deterministic parts (classification, weights, profiles) live in
//! `forkwatch-core`.
//!
//! ## Example
//!
//! ```rust,ignore
//! use forkwatch_runtime::{ApiRequest, CancellationSignal, GithubTransport, ResilientClient};
//!
//! let transport = GithubTransport::new(Duration::from_secs(30))?;
//! let client = ResilientClient::builder()
//!     .transport(Arc::new(transport))
//!     .build()?;
//!
//! let requests = vec![("forks-p1".to_string(), ApiRequest::get("/repos/rust-lang/rust/forks"))];
//! let job = client
//!     .fetch_all("rust-lang/rust", requests, CancellationSignal::never())
//!     .await;
//! println!("{} of {} succeeded", job.successes(), job.reports.len());
//! ```

pub mod client;
pub mod config;
pub mod controller;
pub mod estimator;
pub mod observer;
pub mod resilience;
pub mod transport;

pub use client::{endpoint_group_for, JobReport, ResilientClient, ResilientClientBuilder};
pub use config::{RateLimitRetryConfig, ResilienceConfig, TransientRetryConfig};
pub use controller::{
    cancellation, CancellationHandle, CancellationSignal, GracefulDegradationController,
    ItemReport, Operation, Outcome, WorkItem, BREAKER_EXHAUSTED,
};
pub use estimator::{RepositorySizeEstimator, SizeEstimate};
pub use observer::{DeferReason, JobObserver, TracingObserver};
pub use resilience::{
    Admission, CircuitBreaker, CircuitState, EndpointGroup, Permit, RateLimitHandler, StateKind,
    Transition,
};
pub use transport::{ApiRequest, ApiResponse, Method, Transport, TransportError};

#[cfg(feature = "github")]
pub use transport::GithubTransport;

use forkwatch_core::{ConfigError, Failure};
use std::time::Duration;
use thiserror::Error;

/// Errors from the runtime.
#[derive(Error, Debug)]
pub enum RuntimeError {
    #[error("Transport not configured")]
    NotConfigured,

    #[error("Failed to read config: {0}")]
    Io(#[from] std::io::Error),

    #[error("Failed to parse config YAML: {0}")]
    Yaml(#[from] serde_yaml::Error),

    #[error(transparent)]
    Config(#[from] ConfigError),

    #[error("Circuit open for {group}, retry in {retry_in:?}")]
    CircuitOpen {
        group: EndpointGroup,
        retry_in: Option<Duration>,
    },

    #[error("API call failed: {0}")]
    Failed(#[from] Failure),

    #[error("Invalid response JSON: {0}")]
    Json(#[from] serde_json::Error),
}
