//! Connection policy engine.
//!
//! Every resolver call can be wrapped with three independent, optional
//! sub-policies:
//!
//! - **timeout**: each attempt races a deadline
//! - **retry**: failed attempts are repeated with backoff
//! - **circuit breaker**: sustained failures make calls fail fast
//!
//! [`PolicyEngine::apply`] composes them as breaker → retry → timeout
//! (outer to inner). Policy and breaker state are process-local and kept in
//! explicit stores owned by the engine.

mod breaker;
mod config;
mod engine;
mod refresh;
mod retry;
mod store;
mod timeout;

pub use breaker::{with_circuit_breaker, CircuitBreakerRegistry, CircuitBreakerState, CircuitState};
pub use config::{
    BackoffPolicy, BackoffStrategy, CircuitBreakerPolicy, ConnectionPolicy, RetryPolicy, TimeoutPolicy,
    DEFAULT_BACKOFF_DELAY_MS, DEFAULT_BACKOFF_FACTOR, DEFAULT_CONNECT_TIMEOUT_MS, DEFAULT_FAILURE_THRESHOLD,
    DEFAULT_HALF_OPEN_MAX_ATTEMPTS, DEFAULT_MAX_ATTEMPTS, DEFAULT_MAX_DELAY_MS, DEFAULT_REQUEST_TIMEOUT_MS,
    DEFAULT_RESET_TIMEOUT_MS,
};
pub use engine::PolicyEngine;
pub use refresh::{refresh_once, PolicyRefresher, PolicySource, StaticPolicySource, DEFAULT_REFRESH_INTERVAL};
pub use retry::{calculate_delay, with_retry};
pub use store::PolicyStore;
pub use timeout::with_timeout;
