//! Collaborator Reliability Module
//!
//! Per-collaborator circuit breakers and the registry that owns them.

pub mod circuit_breaker;
pub mod registry;

pub use circuit_breaker::{
    BreakerConfig, BreakerMetrics, BreakerPermit, BreakerState, BreakerTransition, CircuitBreaker,
};
pub use registry::{BreakerRegistry, HealthSummary};
