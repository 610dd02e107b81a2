//! Retry and rate-limit handling for a single call.
//!
//! One invocation of [`RateLimitHandler::execute`] yields exactly one terminal
//! result. Intermediate attempts are never reported to the circuit breaker.

use backon::{BackoffBuilder, ExponentialBuilder};
use forkwatch_core::{classify, ApiFailure, Failure, FailureKind};
use std::future::Future;
use std::time::Duration;

use crate::config::{RateLimitRetryConfig, ResilienceConfig, TransientRetryConfig};

/// Executes calls with bounded retries.
#[derive(Debug, Clone, Default)]
pub struct RateLimitHandler {
    transient: TransientRetryConfig,
    rate_limit: RateLimitRetryConfig,
}

impl RateLimitHandler {
    pub fn new(transient: TransientRetryConfig, rate_limit: RateLimitRetryConfig) -> Self {
        Self {
            transient,
            rate_limit,
        }
    }

    pub fn from_config(config: &ResilienceConfig) -> Self {
        Self::new(config.transient.clone(), config.rate_limit.clone())
    }

    /// Run `op` until it succeeds or a terminal failure is reached.
    ///
    /// - Rate limits wait for the server hint (or exponential backoff from the
    ///   seed) up to `rate_limit.max_retries` times.
    /// - Network, 5xx and unknown failures back off with jitter for at most
    ///   `transient.max_attempts` total attempts.
    /// - Not found and forbidden return immediately.
    pub async fn execute<T, F, Fut>(&self, mut op: F) -> Result<T, Failure>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<T, ApiFailure>>,
    {
        let mut transient_delays = ExponentialBuilder::default()
            .with_min_delay(self.transient.base_delay)
            .with_max_delay(self.transient.max_delay)
            .with_factor(2.0)
            .with_max_times(self.transient.max_attempts.saturating_sub(1) as usize)
            .with_jitter()
            .build();

        let mut rate_limit_delays = ExponentialBuilder::default()
            .with_min_delay(self.rate_limit.seed_delay)
            .with_max_delay(self.rate_limit.max_delay)
            .with_factor(2.0)
            .with_max_times(self.rate_limit.max_retries as usize)
            .build();

        let mut attempt: u32 = 0;
        let mut rate_limit_retries: u32 = 0;

        loop {
            attempt += 1;
            let raw = match op().await {
                Ok(value) => return Ok(value),
                Err(raw) => raw,
            };
            let failure = classify(&raw);

            let delay = match failure.kind {
                FailureKind::RateLimited => {
                    if rate_limit_retries >= self.rate_limit.max_retries {
                        None
                    } else {
                        rate_limit_retries += 1;
                        match failure.retry_after {
                            Some(hint) => Some(hint.min(self.rate_limit.max_delay)),
                            None => rate_limit_delays.next(),
                        }
                    }
                }
                FailureKind::Network | FailureKind::ServerError | FailureKind::Unknown => {
                    transient_delays.next()
                }
                FailureKind::NotFound | FailureKind::Forbidden => None,
            };

            let Some(delay) = delay else {
                if failure.kind.is_transient() {
                    tracing::debug!(
                        kind = %failure.kind,
                        attempts = attempt,
                        "Giving up after retries"
                    );
                }
                return Err(failure);
            };

            tracing::debug!(
                kind = %failure.kind,
                attempt,
                delay = ?delay,
                "Retrying after failure"
            );
            sleep(delay).await;
        }
    }
}

async fn sleep(delay: Duration) {
    if !delay.is_zero() {
        tokio::time::sleep(delay).await;
    }
}
