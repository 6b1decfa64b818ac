//! Reliability primitives
//!
//! The circuit breaker gating each agent and the timeout manager bounding task
//! executions and oracle calls.

pub mod circuit_breaker;
pub mod timeout_manager;

pub use circuit_breaker::{
    Admission, CircuitBreaker, CircuitBreakerConfig, CircuitBreakerState, CircuitBreakerStats,
    CircuitOpenError,
};
pub use timeout_manager::{OperationTimeoutError, TimeoutManager, TimeoutStats};
