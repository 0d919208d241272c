//! Per-endpoint circuit breakers for the Switchyard dispatch core.
//!
//! - CircuitBreaker: three-state failure detector with a sliding
//!   monitoring window, per-call timeout, and automatic recovery
//! - CircuitBreakerRegistry: lazily creates one breaker per provider key,
//!   re-emits breaker events, and offers aggregate views and admin ops

pub mod breaker;
pub mod registry;

pub use breaker::{
    BreakerConfig, BreakerEvent, BreakerEventKind, BreakerStats, CircuitBreaker, CircuitState,
};
pub use registry::{CircuitBreakerRegistry, StateCounts};
