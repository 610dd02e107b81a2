//! # forkwatch-core
//!
//! Deterministic building blocks for the forkwatch API access layer.
//!
//! This crate answers, without any I/O:
//! - What kind of failure is this?
//! - How much should it count against the API's health?
//! - How tolerant should the breaker be for a job of this size?
//!
//! ## Example
//!
//! ```rust
//! use forkwatch_core::{classify, ApiFailure, BreakerProfile, FailureKind, FailureWeights};
//!
//! let failure = classify(&ApiFailure::http(502, "Bad Gateway"));
//! assert_eq!(failure.kind, FailureKind::ServerError);
//!
//! let weights = FailureWeights::default();
//! assert_eq!(weights.weight(FailureKind::RateLimited), 0.0);
//!
//! let profile = BreakerProfile::for_item_count(5_000);
//! assert!(profile.open_threshold > BreakerProfile::smallest().open_threshold);
//! ```

pub mod classifier;
pub mod failure;
pub mod profile;
pub mod weights;

pub use classifier::{classify, classify_at};
pub use failure::{ApiFailure, Failure, FailureKind};
pub use profile::BreakerProfile;
pub use weights::FailureWeights;

use thiserror::Error;

/// Errors from validating weights and profiles.
#[derive(Error, Debug, Clone, PartialEq)]
pub enum ConfigError {
    #[error("Invalid weight for {kind}: {value}")]
    InvalidWeight { kind: String, value: f64 },

    #[error("Invalid breaker profile: {0}")]
    InvalidProfile(String),

    #[error("Invalid setting {field}: {reason}")]
    InvalidSetting { field: String, reason: String },
}
