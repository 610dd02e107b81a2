//! Job observation hooks.
//!
//! Observers are for reporting only. Nothing they do feeds back into
//! scheduling decisions.

use std::fmt;
use std::time::Duration;

use crate::estimator::SizeEstimate;
use crate::resilience::Transition;

/// Why an item was pushed onto the retry queue.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DeferReason {
    /// The breaker denied admission
    CircuitOpen { retry_in: Option<Duration> },

    /// The call stayed rate limited after the handler's retries
    RateLimited,
}

impl fmt::Display for DeferReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            DeferReason::CircuitOpen { .. } => f.write_str("circuit_open"),
            DeferReason::RateLimited => f.write_str("rate_limited"),
        }
    }
}

/// Callbacks invoked as a job progresses.
///
/// All methods default to no-ops.
pub trait JobObserver: Send + Sync {
    /// Size estimation finished (possibly degraded).
    fn on_estimate(&self, _estimate: &SizeEstimate) {}

    /// A circuit changed state.
    fn on_breaker_transition(&self, _transition: &Transition) {}

    /// An item was deferred instead of dispatched.
    fn on_item_deferred(&self, _id: &str, _reason: DeferReason) {}

    /// A deferred item was re-admitted.
    fn on_item_retried(&self, _id: &str) {}
}

/// Observer that writes every event to `tracing`.
#[derive(Debug, Clone, Copy, Default)]
pub struct TracingObserver;

impl JobObserver for TracingObserver {
    fn on_estimate(&self, estimate: &SizeEstimate) {
        tracing::debug!(
            repo = %estimate.target,
            items = ?estimate.item_count,
            degraded = estimate.degraded,
            "size estimate"
        );
    }

    fn on_breaker_transition(&self, transition: &Transition) {
        tracing::debug!(
            group = %transition.group,
            from = %transition.from,
            to = %transition.to,
            weight = transition.accumulated_weight,
            "breaker transition"
        );
    }

    fn on_item_deferred(&self, id: &str, reason: DeferReason) {
        tracing::trace!(id, reason = %reason, "item deferred");
    }

    fn on_item_retried(&self, id: &str) {
        tracing::trace!(id, "item retried");
    }
}
