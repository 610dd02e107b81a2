//! Repository size estimation.
//!
//! One cheap metadata call per job decides how tolerant the breaker should be.
//! Estimation never blocks a job: any failure falls back to the smallest,
//! most conservative profile.

use forkwatch_core::{classify, BreakerProfile};
use serde_json::Value as JsonValue;
use std::sync::Arc;

use crate::transport::{send_checked, ApiRequest, Transport};

/// Result of probing a repository's scale.
#[derive(Debug, Clone, PartialEq)]
pub struct SizeEstimate {
    /// Repository the estimate is for (`owner/name`)
    pub target: String,

    /// Approximate number of items; `None` when the probe failed
    pub item_count: Option<u64>,

    /// Breaker profile derived from the count
    pub profile: BreakerProfile,

    /// True when the fallback profile is in use because probing failed
    pub degraded: bool,
}

impl SizeEstimate {
    /// Estimate from a known count.
    pub fn from_count(target: impl Into<String>, item_count: u64) -> Self {
        Self {
            target: target.into(),
            item_count: Some(item_count),
            profile: BreakerProfile::for_item_count(item_count),
            degraded: false,
        }
    }

    /// Conservative estimate used when probing fails.
    pub fn degraded(target: impl Into<String>) -> Self {
        Self {
            target: target.into(),
            item_count: None,
            profile: BreakerProfile::smallest(),
            degraded: true,
        }
    }
}

/// Probes repository metadata for an item count.
pub struct RepositorySizeEstimator {
    transport: Arc<dyn Transport>,
    count_field: String,
}

impl RepositorySizeEstimator {
    /// Create an estimator reading `forks_count`.
    pub fn new(transport: Arc<dyn Transport>) -> Self {
        Self {
            transport,
            count_field: "forks_count".to_string(),
        }
    }

    /// Read a different count field from the metadata.
    pub fn with_count_field(mut self, field: impl Into<String>) -> Self {
        self.count_field = field.into();
        self
    }

    /// Estimate the scale of `target` (`owner/name`).
    pub async fn estimate(&self, target: &str) -> SizeEstimate {
        match self.probe(target).await {
            Ok(count) => {
                let estimate = SizeEstimate::from_count(target, count);
                tracing::info!(
                    repo = target,
                    items = count,
                    threshold = estimate.profile.open_threshold,
                    "Estimated repository size"
                );
                estimate
            }
            Err(reason) => {
                tracing::warn!(
                    repo = target,
                    reason = %reason,
                    "Size estimation failed, running in degraded mode with the smallest breaker profile"
                );
                SizeEstimate::degraded(target)
            }
        }
    }

    async fn probe(&self, target: &str) -> Result<u64, String> {
        let request = ApiRequest::get(format!("/repos/{}", target.trim_matches('/')));
        let response = send_checked(self.transport.as_ref(), request)
            .await
            .map_err(|raw| classify(&raw).to_string())?;

        let metadata: JsonValue = response
            .json()
            .map_err(|e| format!("invalid metadata JSON: {e}"))?;

        metadata
            .get(&self.count_field)
            .and_then(JsonValue::as_u64)
            .ok_or_else(|| format!("metadata has no numeric '{}' field", self.count_field))
    }
}
