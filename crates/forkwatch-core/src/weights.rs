//! Failure weights used by the circuit breaker.
//!
//! Rate limits and missing resources always weigh zero: the former are
//! handled by backoff, the latter say nothing about API health.

use serde::{Deserialize, Serialize};

use crate::failure::FailureKind;
use crate::ConfigError;

/// Per-kind contribution to a circuit's accumulated weight.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct FailureWeights {
    pub network: f64,
    pub forbidden: f64,
    pub server_error: f64,
    pub unknown: f64,
}

impl Default for FailureWeights {
    fn default() -> Self {
        Self {
            network: 1.0,
            forbidden: 1.0,
            server_error: 1.5,
            unknown: 1.0,
        }
    }
}

impl FailureWeights {
    /// Every weighted kind contributes exactly 1.0.
    pub fn uniform() -> Self {
        Self {
            network: 1.0,
            forbidden: 1.0,
            server_error: 1.0,
            unknown: 1.0,
        }
    }

    /// Weight for a failure kind.
    pub fn weight(&self, kind: FailureKind) -> f64 {
        match kind {
            FailureKind::RateLimited | FailureKind::NotFound => 0.0,
            FailureKind::Network => self.network,
            FailureKind::Forbidden => self.forbidden,
            FailureKind::ServerError => self.server_error,
            FailureKind::Unknown => self.unknown,
        }
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        for (name, value) in [
            ("network", self.network),
            ("forbidden", self.forbidden),
            ("server_error", self.server_error),
            ("unknown", self.unknown),
        ] {
            if !value.is_finite() || value < 0.0 {
                return Err(ConfigError::InvalidWeight {
                    kind: name.to_string(),
                    value,
                });
            }
        }
        Ok(())
    }
}
