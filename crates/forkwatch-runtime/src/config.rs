//! Runtime configuration.
//!
//! Loaded from YAML (durations as humantime strings like `"30s"` or `"2h"`)
//! or from `FORKWATCH_*` environment variables layered over the defaults.

use forkwatch_core::{BreakerProfile, ConfigError, FailureWeights};
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::Path;
use std::time::Duration;

use crate::RuntimeError;

/// Retry policy for network errors, 5xx and unrecognized failures.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct TransientRetryConfig {
    /// Total attempts, including the first
    pub max_attempts: u32,

    #[serde(with = "humantime_duration")]
    pub base_delay: Duration,

    #[serde(with = "humantime_duration")]
    pub max_delay: Duration,
}

impl Default for TransientRetryConfig {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            base_delay: Duration::from_secs(1),
            max_delay: Duration::from_secs(30),
        }
    }
}

/// Retry policy for rate limited calls.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RateLimitRetryConfig {
    /// Retries after the first attempt
    pub max_retries: u32,

    /// First wait when the response carries no reset hint
    #[serde(with = "humantime_duration")]
    pub seed_delay: Duration,

    /// Cap on any single wait, hinted or not
    #[serde(with = "humantime_duration")]
    pub max_delay: Duration,
}

impl Default for RateLimitRetryConfig {
    fn default() -> Self {
        Self {
            max_retries: 5,
            seed_delay: Duration::from_secs(60),
            max_delay: Duration::from_secs(3600),
        }
    }
}

/// Top-level configuration for a [`ResilientClient`](crate::ResilientClient).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ResilienceConfig {
    /// Maximum calls in flight per job
    pub concurrency: usize,

    /// Hard deadline for a whole job
    #[serde(with = "humantime_duration")]
    pub job_timeout: Duration,

    /// How often deferred items are re-offered to the breaker
    #[serde(with = "humantime_duration")]
    pub retry_tick: Duration,

    /// Times a still-rate-limited item may be deferred before failing
    pub max_deferrals: u32,

    pub transient: TransientRetryConfig,

    pub rate_limit: RateLimitRetryConfig,

    pub weights: FailureWeights,

    /// JSON field of the repository metadata holding the item count
    pub count_field: String,

    /// Use this profile instead of probing repository size
    pub profile_override: Option<BreakerProfile>,
}

impl Default for ResilienceConfig {
    fn default() -> Self {
        Self {
            concurrency: 8,
            job_timeout: Duration::from_secs(2 * 3600),
            retry_tick: Duration::from_secs(30),
            max_deferrals: 3,
            transient: TransientRetryConfig::default(),
            rate_limit: RateLimitRetryConfig::default(),
            weights: FailureWeights::default(),
            count_field: "forks_count".to_string(),
            profile_override: None,
        }
    }
}

impl ResilienceConfig {
    /// Parse and validate a YAML document.
    pub fn from_yaml(yaml: &str) -> Result<Self, RuntimeError> {
        let config: Self = serde_yaml::from_str(yaml)?;
        config.validate()?;
        Ok(config)
    }

    /// Load from a YAML file.
    pub fn from_yaml_file(path: impl AsRef<Path>) -> Result<Self, RuntimeError> {
        let content = fs::read_to_string(path)?;
        Self::from_yaml(&content)
    }

    /// Defaults overlaid with `FORKWATCH_*` environment variables.
    pub fn from_env() -> Result<Self, RuntimeError> {
        Self::from_vars(|name| std::env::var(name).ok())
    }

    /// Defaults overlaid with variables from `lookup`.
    ///
    /// Unparseable values are logged and ignored.
    pub fn from_vars<F>(lookup: F) -> Result<Self, RuntimeError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let mut config = Self::default();

        if let Some(v) = parse_var(&lookup, "FORKWATCH_CONCURRENCY", |s| s.parse::<usize>().ok()) {
            config.concurrency = v;
        }
        if let Some(v) = parse_var(&lookup, "FORKWATCH_JOB_TIMEOUT", parse_duration) {
            config.job_timeout = v;
        }
        if let Some(v) = parse_var(&lookup, "FORKWATCH_RETRY_TICK", parse_duration) {
            config.retry_tick = v;
        }
        if let Some(v) = parse_var(&lookup, "FORKWATCH_MAX_DEFERRALS", |s| s.parse::<u32>().ok()) {
            config.max_deferrals = v;
        }
        if let Some(v) = parse_var(&lookup, "FORKWATCH_TRANSIENT_MAX_ATTEMPTS", |s| {
            s.parse::<u32>().ok()
        }) {
            config.transient.max_attempts = v;
        }
        if let Some(v) = parse_var(&lookup, "FORKWATCH_RATE_LIMIT_MAX_RETRIES", |s| {
            s.parse::<u32>().ok()
        }) {
            config.rate_limit.max_retries = v;
        }
        if let Some(v) = parse_var(&lookup, "FORKWATCH_RATE_LIMIT_MAX_DELAY", parse_duration) {
            config.rate_limit.max_delay = v;
        }
        if let Some(v) = parse_var(&lookup, "FORKWATCH_SERVER_ERROR_WEIGHT", |s| {
            s.parse::<f64>().ok()
        }) {
            config.weights.server_error = v;
        }
        if let Some(v) = lookup("FORKWATCH_COUNT_FIELD") {
            config.count_field = v;
        }

        config.validate()?;
        Ok(config)
    }

    /// Reject settings the runtime cannot honor.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.concurrency == 0 {
            return Err(invalid("concurrency", "must be at least 1"));
        }
        if self.transient.max_attempts == 0 {
            return Err(invalid("transient.max_attempts", "must be at least 1"));
        }
        if self.retry_tick.is_zero() {
            return Err(invalid("retry_tick", "must be non-zero"));
        }
        if self.job_timeout.is_zero() {
            return Err(invalid("job_timeout", "must be non-zero"));
        }
        if self.count_field.is_empty() {
            return Err(invalid("count_field", "must not be empty"));
        }
        self.weights.validate()?;
        if let Some(profile) = &self.profile_override {
            profile.validate()?;
        }
        Ok(())
    }
}

fn invalid(field: &str, reason: &str) -> ConfigError {
    ConfigError::InvalidSetting {
        field: field.to_string(),
        reason: reason.to_string(),
    }
}

fn parse_duration(raw: &str) -> Option<Duration> {
    humantime::parse_duration(raw.trim()).ok()
}

fn parse_var<F, P, T>(lookup: &F, name: &str, parse: P) -> Option<T>
where
    F: Fn(&str) -> Option<String>,
    P: Fn(&str) -> Option<T>,
{
    let raw = lookup(name)?;
    let parsed = parse(&raw);
    if parsed.is_none() {
        tracing::warn!(var = name, value = %raw, "Ignoring unparseable environment variable");
    }
    parsed
}

mod humantime_duration {
    use serde::{Deserialize, Deserializer, Serializer};
    use std::time::Duration;

    pub fn serialize<S>(duration: &Duration, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        serializer.collect_str(&humantime::format_duration(*duration))
    }

    pub fn deserialize<'de, D>(deserializer: D) -> Result<Duration, D::Error>
    where
        D: Deserializer<'de>,
    {
        let raw = String::deserialize(deserializer)?;
        humantime::parse_duration(&raw).map_err(serde::de::Error::custom)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    #[test]
    fn test_config_default() {
        let config = ResilienceConfig::default();
        assert_eq!(config.concurrency, 8);
        assert_eq!(config.retry_tick, Duration::from_secs(30));
        assert_eq!(config.transient.max_attempts, 3);
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_from_yaml() {
        let yaml = r#"
concurrency: 16
job_timeout: "45m"
retry_tick: "10s"
transient:
  max_attempts: 4
  base_delay: "500ms"
rate_limit:
  seed_delay: "2m"
weights:
  server_error: 2.0
profile_override:
  open_threshold: 12.0
  half_open_after: 90
  half_open_probe_count: 2
"#;
        let config = ResilienceConfig::from_yaml(yaml).unwrap();
        assert_eq!(config.concurrency, 16);
        assert_eq!(config.job_timeout, Duration::from_secs(45 * 60));
        assert_eq!(config.transient.max_attempts, 4);
        assert_eq!(config.transient.base_delay, Duration::from_millis(500));
        assert_eq!(config.transient.max_delay, Duration::from_secs(30));
        assert_eq!(config.rate_limit.seed_delay, Duration::from_secs(120));
        assert_eq!(config.weights.server_error, 2.0);
        assert_eq!(config.weights.network, 1.0);
        let profile = config.profile_override.unwrap();
        assert_eq!(profile.half_open_after, Duration::from_secs(90));
    }

    #[test]
    fn test_yaml_validation_errors() {
        assert!(matches!(
            ResilienceConfig::from_yaml("concurrency: 0"),
            Err(RuntimeError::Config(ConfigError::InvalidSetting { .. }))
        ));
        assert!(matches!(
            ResilienceConfig::from_yaml("job_timeout: \"soon\""),
            Err(RuntimeError::Yaml(_))
        ));
        assert!(matches!(
            ResilienceConfig::from_yaml("weights:\n  unknown: -2.0"),
            Err(RuntimeError::Config(ConfigError::InvalidWeight { .. }))
        ));
    }

    #[test]
    fn test_from_vars_overlay() {
        let vars: HashMap<&str, &str> = [
            ("FORKWATCH_CONCURRENCY", "4"),
            ("FORKWATCH_RETRY_TICK", "5s"),
            ("FORKWATCH_MAX_DEFERRALS", "not-a-number"),
            ("FORKWATCH_SERVER_ERROR_WEIGHT", "3"),
        ]
        .into_iter()
        .collect();

        let config =
            ResilienceConfig::from_vars(|name| vars.get(name).map(|v| v.to_string())).unwrap();
        assert_eq!(config.concurrency, 4);
        assert_eq!(config.retry_tick, Duration::from_secs(5));
        assert_eq!(config.max_deferrals, 3);
        assert_eq!(config.weights.server_error, 3.0);
    }

    #[test]
    fn test_yaml_roundtrips_durations_as_strings() {
        let yaml = serde_yaml::to_string(&ResilienceConfig::default()).unwrap();
        assert!(yaml.contains("retry_tick: 30s"));
        assert_eq!(ResilienceConfig::from_yaml(&yaml).unwrap(), ResilienceConfig::default());
    }
}
