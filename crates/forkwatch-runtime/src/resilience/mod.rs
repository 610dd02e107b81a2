//! Resilience patterns for forkwatch-runtime.
//!
//! This module provides:
//! - Weighted circuit breaker with half-open probing
//! - Rate-limit aware retry with backoff
//! - FIFO retry queue for deferred work

mod circuit_breaker;
mod rate_limit;
mod retry_queue;

pub use circuit_breaker::{
    Admission, CircuitBreaker, CircuitState, Clock, EndpointGroup, Permit, StateKind, TokioClock,
    Transition, TransitionListener,
};
pub use rate_limit::RateLimitHandler;
pub use retry_queue::RetryQueue;
