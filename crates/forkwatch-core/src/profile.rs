//! Breaker sizing.
//!
//! A 5,000-fork traversal makes far more calls than a 50-fork one, so it sees
//! more ordinary failures. The breaker profile scales its tolerance with the
//! estimated item count using a fixed step function.

use serde::{Deserialize, Serialize};
use std::time::Duration;

use crate::ConfigError;

/// Thresholds and cooldowns for one job's circuit breaker.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct BreakerProfile {
    /// Accumulated weight at which a closed circuit opens
    pub open_threshold: f64,

    /// Cooldown between opening and the first half-open probe
    #[serde(with = "duration_secs")]
    pub half_open_after: Duration,

    /// Probes admitted per half-open window
    pub half_open_probe_count: u32,
}

mod duration_secs {
    use serde::{Deserialize, Deserializer, Serializer};
    use std::time::Duration;

    pub fn serialize<S>(duration: &Duration, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        serializer.serialize_u64(duration.as_secs())
    }

    pub fn deserialize<'de, D>(deserializer: D) -> Result<Duration, D::Error>
    where
        D: Deserializer<'de>,
    {
        let secs = u64::deserialize(deserializer)?;
        Ok(Duration::from_secs(secs))
    }
}

/// One row of the step function: applies to counts `>= min_items`.
struct Tier {
    min_items: u64,
    open_threshold: f64,
    half_open_after_secs: u64,
    probes: u32,
}

const TIERS: [Tier; 5] = [
    Tier { min_items: 0, open_threshold: 5.0, half_open_after_secs: 30, probes: 3 },
    Tier { min_items: 500, open_threshold: 10.0, half_open_after_secs: 30, probes: 3 },
    Tier { min_items: 1000, open_threshold: 18.0, half_open_after_secs: 45, probes: 4 },
    Tier { min_items: 2000, open_threshold: 30.0, half_open_after_secs: 60, probes: 5 },
    Tier { min_items: 5000, open_threshold: 45.0, half_open_after_secs: 60, probes: 5 },
];

impl BreakerProfile {
    /// Profile for a job of `item_count` items.
    pub fn for_item_count(item_count: u64) -> Self {
        let tier = TIERS
            .iter()
            .rev()
            .find(|t| item_count >= t.min_items)
            .unwrap_or(&TIERS[0]);

        Self {
            open_threshold: tier.open_threshold,
            half_open_after: Duration::from_secs(tier.half_open_after_secs),
            half_open_probe_count: tier.probes,
        }
    }

    /// The most conservative profile, used when the size is unknown.
    pub fn smallest() -> Self {
        Self::for_item_count(0)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if !self.open_threshold.is_finite() || self.open_threshold <= 0.0 {
            return Err(ConfigError::InvalidProfile(format!(
                "open_threshold must be positive, got {}",
                self.open_threshold
            )));
        }
        if self.half_open_probe_count == 0 {
            return Err(ConfigError::InvalidProfile(
                "half_open_probe_count must be at least 1".to_string(),
            ));
        }
        Ok(())
    }
}

impl Default for BreakerProfile {
    fn default() -> Self {
        Self::smallest()
    }
}
