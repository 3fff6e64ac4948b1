//! Connection policy configuration.
//!
//! Policies serialize to the camelCase form used in resolver metadata:
//!
//! ```json
//! {
//!   "timeout": { "connectTimeoutMs": 5000, "requestTimeoutMs": 30000 },
//!   "retry": {
//!     "maxAttempts": 3,
//!     "backoff": { "strategy": "exponential", "delayMs": 1000, "factor": 2.0, "maxDelayMs": 30000 }
//!   },
//!   "circuitBreaker": { "failureThreshold": 5, "resetTimeoutMs": 60000, "halfOpenMaxAttempts": 1 }
//! }
//! ```
//!
//! Any sub-policy may be omitted (it is then not applied); fields missing
//! inside a present sub-policy take the defaults below.

use serde::{Deserialize, Serialize};

use crate::error::{KyroError, KyroResult};

/// Default bound on resolver activation.
pub const DEFAULT_CONNECT_TIMEOUT_MS: u64 = 5_000;
/// Default bound on one call attempt.
pub const DEFAULT_REQUEST_TIMEOUT_MS: u64 = 30_000;
/// Default total attempts, the first included.
pub const DEFAULT_MAX_ATTEMPTS: u32 = 3;
/// Default base delay between attempts.
pub const DEFAULT_BACKOFF_DELAY_MS: u64 = 1_000;
/// Default exponential growth factor.
pub const DEFAULT_BACKOFF_FACTOR: f64 = 2.0;
/// Default cap on a single delay.
pub const DEFAULT_MAX_DELAY_MS: u64 = 30_000;
/// Default consecutive failures that open a circuit.
pub const DEFAULT_FAILURE_THRESHOLD: u32 = 5;
/// Default time an open circuit waits before a trial call.
pub const DEFAULT_RESET_TIMEOUT_MS: u64 = 60_000;
/// Default concurrent trial calls while half-open.
pub const DEFAULT_HALF_OPEN_MAX_ATTEMPTS: u32 = 1;

/// Per-attempt deadlines.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct TimeoutPolicy {
    /// Bounds resolver activation (`subscribe`).
    pub connect_timeout_ms: u64,
    /// Bounds each data call attempt.
    pub request_timeout_ms: u64,
}

impl Default for TimeoutPolicy {
    fn default() -> Self {
        Self {
            connect_timeout_ms: DEFAULT_CONNECT_TIMEOUT_MS,
            request_timeout_ms: DEFAULT_REQUEST_TIMEOUT_MS,
        }
    }
}

/// How the delay grows between attempts.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum BackoffStrategy {
    /// `delay * factor^(n - 1)` before retry `n`.
    #[default]
    Exponential,
    /// `delay * n` before retry `n`.
    Linear,
    /// `delay` every time.
    Constant,
}

/// Delay between retry attempts.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct BackoffPolicy {
    /// Growth strategy.
    pub strategy: BackoffStrategy,
    /// Base delay.
    pub delay_ms: u64,
    /// Growth factor, used by the exponential strategy only.
    pub factor: f64,
    /// Upper bound on any single delay.
    pub max_delay_ms: u64,
}

impl Default for BackoffPolicy {
    fn default() -> Self {
        Self {
            strategy: BackoffStrategy::Exponential,
            delay_ms: DEFAULT_BACKOFF_DELAY_MS,
            factor: DEFAULT_BACKOFF_FACTOR,
            max_delay_ms: DEFAULT_MAX_DELAY_MS,
        }
    }
}

impl BackoffPolicy {
    /// Same delay before every retry.
    #[must_use]
    pub fn constant(delay_ms: u64) -> Self {
        Self {
            strategy: BackoffStrategy::Constant,
            delay_ms,
            ..Self::default()
        }
    }

    /// Delay growing by `delay_ms` each attempt.
    #[must_use]
    pub fn linear(delay_ms: u64) -> Self {
        Self {
            strategy: BackoffStrategy::Linear,
            delay_ms,
            ..Self::default()
        }
    }

    /// Caps each delay at `max_delay_ms`.
    #[must_use]
    pub fn with_max_delay_ms(mut self, max_delay_ms: u64) -> Self {
        self.max_delay_ms = max_delay_ms;
        self
    }
}

/// Bounded retry of transient failures.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct RetryPolicy {
    /// Total invocations, including the first.
    pub max_attempts: u32,
    /// Delay between attempts.
    pub backoff: BackoffPolicy,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: DEFAULT_MAX_ATTEMPTS,
            backoff: BackoffPolicy::default(),
        }
    }
}

impl RetryPolicy {
    /// Retry policy with an explicit attempt budget.
    #[must_use]
    pub fn new(max_attempts: u32, backoff: BackoffPolicy) -> Self {
        Self { max_attempts, backoff }
    }
}

/// Thresholds of a per-resolver circuit breaker.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct CircuitBreakerPolicy {
    /// Consecutive failures that open the circuit.
    pub failure_threshold: u32,
    /// How long an open circuit rejects calls before a trial call.
    pub reset_timeout_ms: u64,
    /// Concurrent trial calls admitted while half-open.
    pub half_open_max_attempts: u32,
}

impl Default for CircuitBreakerPolicy {
    fn default() -> Self {
        Self {
            failure_threshold: DEFAULT_FAILURE_THRESHOLD,
            reset_timeout_ms: DEFAULT_RESET_TIMEOUT_MS,
            half_open_max_attempts: DEFAULT_HALF_OPEN_MAX_ATTEMPTS,
        }
    }
}

/// Resilience configuration for one resolver.
///
/// # Examples
///
/// ```
/// use kyrostore::policy::{ConnectionPolicy, RetryPolicy};
///
/// let policy = ConnectionPolicy::default().with_retry(RetryPolicy::default());
/// let back = ConnectionPolicy::from_value(policy.to_value().unwrap()).unwrap();
/// assert_eq!(policy, back);
/// ```
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ConnectionPolicy {
    /// Per-attempt deadline.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub timeout: Option<TimeoutPolicy>,
    /// Retry of transient failures.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub retry: Option<RetryPolicy>,
    /// Fail-fast after repeated failures.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub circuit_breaker: Option<CircuitBreakerPolicy>,
}

impl ConnectionPolicy {
    /// All three sub-policies with their defaults.
    #[must_use]
    pub fn with_defaults() -> Self {
        Self {
            timeout: Some(TimeoutPolicy::default()),
            retry: Some(RetryPolicy::default()),
            circuit_breaker: Some(CircuitBreakerPolicy::default()),
        }
    }

    /// Sets the timeout sub-policy.
    #[must_use]
    pub fn with_timeout(mut self, timeout: TimeoutPolicy) -> Self {
        self.timeout = Some(timeout);
        self
    }

    /// Shorthand for a request timeout with the default connect timeout.
    #[must_use]
    pub fn with_request_timeout_ms(self, ms: u64) -> Self {
        self.with_timeout(TimeoutPolicy {
            request_timeout_ms: ms,
            ..TimeoutPolicy::default()
        })
    }

    /// Sets the retry sub-policy.
    #[must_use]
    pub fn with_retry(mut self, retry: RetryPolicy) -> Self {
        self.retry = Some(retry);
        self
    }

    /// Sets the circuit breaker sub-policy.
    #[must_use]
    pub fn with_circuit_breaker(mut self, circuit_breaker: CircuitBreakerPolicy) -> Self {
        self.circuit_breaker = Some(circuit_breaker);
        self
    }

    /// Returns true if no sub-policy is set.
    #[must_use]
    pub const fn is_noop(&self) -> bool {
        self.timeout.is_none() && self.retry.is_none() && self.circuit_breaker.is_none()
    }

    /// Serialized camelCase form.
    pub fn to_value(&self) -> KyroResult<serde_json::Value> {
        serde_json::to_value(self)
            .map_err(|e| KyroError::config(format!("cannot serialize connection policy: {e}")))
    }

    /// Parses and validates the serialized form.
    pub fn from_value(value: serde_json::Value) -> KyroResult<Self> {
        let policy: Self = serde_json::from_value(value)
            .map_err(|e| KyroError::config(format!("invalid connection policy: {e}")))?;
        policy.validate()?;
        Ok(policy)
    }

    /// # Errors
    /// `KyroError::Config` naming the first offending field.
    pub fn validate(&self) -> KyroResult<()> {
        if let Some(t) = &self.timeout {
            if t.connect_timeout_ms == 0 || t.request_timeout_ms == 0 {
                return Err(KyroError::config("timeout values must be greater than zero"));
            }
        }
        if let Some(r) = &self.retry {
            if r.max_attempts < 1 {
                return Err(KyroError::config("retry.maxAttempts must be at least 1"));
            }
            let b = &r.backoff;
            if b.strategy == BackoffStrategy::Exponential && (b.factor.is_nan() || b.factor < 1.0) {
                return Err(KyroError::config(format!(
                    "retry.backoff.factor must be >= 1 for exponential backoff, got {}",
                    b.factor
                )));
            }
        }
        if let Some(cb) = &self.circuit_breaker {
            if cb.failure_threshold < 1 {
                return Err(KyroError::config("circuitBreaker.failureThreshold must be at least 1"));
            }
            if cb.half_open_max_attempts < 1 {
                return Err(KyroError::config("circuitBreaker.halfOpenMaxAttempts must be at least 1"));
            }
        }
        Ok(())
    }
}
