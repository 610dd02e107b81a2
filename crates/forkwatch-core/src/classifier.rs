//! Failure classification.
//!
//! Maps a raw [`ApiFailure`] to a [`Failure`]. Pure: no I/O, never panics,
//! unrecognized input becomes [`FailureKind::Unknown`].

use chrono::{DateTime, Utc};
use lazy_static::lazy_static;
use regex::Regex;
use std::collections::BTreeMap;
use std::time::Duration;

use crate::failure::{ApiFailure, Failure, FailureKind};

/// Header carrying the number of calls left in the current window.
pub const RATELIMIT_REMAINING_HEADER: &str = "x-ratelimit-remaining";

/// Header carrying the window reset as epoch seconds.
pub const RATELIMIT_RESET_HEADER: &str = "x-ratelimit-reset";

/// Standard retry hint, in seconds.
pub const RETRY_AFTER_HEADER: &str = "retry-after";

/// Slack added to reset-derived waits so we wake after the window rolls over.
const RESET_SLACK: Duration = Duration::from_secs(1);

lazy_static! {
    /// Phrases GitHub uses in rate limit error bodies.
    static ref RATE_LIMIT_PATTERN: Regex = Regex::new(
        r"(?i)(api rate limit exceeded|secondary rate limit|abuse detection|rate limit)"
    ).unwrap();
}

/// Classify a raw failure using the current wall clock.
pub fn classify(failure: &ApiFailure) -> Failure {
    classify_at(failure, Utc::now())
}

/// Classify a raw failure relative to `now`.
///
/// `now` is only used to turn an `x-ratelimit-reset` timestamp into a wait.
pub fn classify_at(failure: &ApiFailure, now: DateTime<Utc>) -> Failure {
    match failure {
        ApiFailure::Http {
            status,
            headers,
            body,
        } => classify_http(*status, headers, body, now),
        ApiFailure::Timeout(msg) => Failure::new(FailureKind::Network, format!("timeout: {msg}")),
        ApiFailure::Connection(msg) => Failure::new(FailureKind::Network, msg.clone()),
        ApiFailure::Other(msg) => Failure::new(FailureKind::Unknown, msg.clone()),
    }
}

fn classify_http(
    status: u16,
    headers: &BTreeMap<String, String>,
    body: &str,
    now: DateTime<Utc>,
) -> Failure {
    let message = if body.trim().is_empty() {
        format!("HTTP {status}")
    } else {
        body.to_string()
    };

    let kind = match status {
        429 => FailureKind::RateLimited,
        403 if has_rate_limit_markers(headers, body) => FailureKind::RateLimited,
        403 | 451 => FailureKind::Forbidden,
        404 | 410 => FailureKind::NotFound,
        500..=599 => FailureKind::ServerError,
        _ => {
            tracing::debug!(status, "unrecognized status, classifying as unknown");
            FailureKind::Unknown
        }
    };

    let failure = Failure::new(kind, message).with_status(status);
    match retry_after(headers, now) {
        Some(wait) if kind == FailureKind::RateLimited => failure.with_retry_after(wait),
        _ => failure,
    }
}

/// Whether a 403 is really a rate limit in disguise.
pub fn has_rate_limit_markers(headers: &BTreeMap<String, String>, body: &str) -> bool {
    let exhausted = headers
        .get(RATELIMIT_REMAINING_HEADER)
        .and_then(|v| v.trim().parse::<u64>().ok())
        == Some(0);

    exhausted || headers.contains_key(RETRY_AFTER_HEADER) || RATE_LIMIT_PATTERN.is_match(body)
}

/// Extract a wait from `retry-after`, falling back to `x-ratelimit-reset`.
pub fn retry_after(headers: &BTreeMap<String, String>, now: DateTime<Utc>) -> Option<Duration> {
    if let Some(secs) = headers
        .get(RETRY_AFTER_HEADER)
        .and_then(|v| v.trim().parse::<u64>().ok())
    {
        return Some(Duration::from_secs(secs));
    }

    let reset = headers
        .get(RATELIMIT_RESET_HEADER)
        .and_then(|v| v.trim().parse::<i64>().ok())
        .and_then(|epoch| DateTime::<Utc>::from_timestamp(epoch, 0))?;

    let wait = (reset - now).to_std().unwrap_or(Duration::ZERO);
    Some(wait + RESET_SLACK)
}
