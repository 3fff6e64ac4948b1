//! Per-resolver circuit breakers.
//!
//! State lives in a [`CircuitBreakerRegistry`] keyed by resolver name. Each
//! key has its own mutex, so callers on different resolvers never contend,
//! and the mutex is never held across an `.await`.

use std::collections::HashMap;
use std::future::Future;
use std::sync::{Arc, Mutex, RwLock};
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio::time::Instant;

use crate::error::{KyroError, KyroResult};

use super::config::CircuitBreakerPolicy;

/// Position of a breaker in its state machine.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum CircuitState {
    /// Calls pass through; failures are counted.
    #[default]
    Closed,
    /// Calls fail fast until the reset timeout elapses.
    Open,
    /// A bounded number of trial calls decide whether to close or reopen.
    HalfOpen,
}

/// Snapshot of one breaker, as reported to operators and tests.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CircuitBreakerState {
    /// Current state.
    pub state: CircuitState,
    /// Consecutive failures since the last success.
    pub failure_count: u32,
    /// Wall-clock time of the most recent failure.
    pub last_failure_time: Option<DateTime<Utc>>,
}

#[derive(Debug, Default)]
struct BreakerEntry {
    state: CircuitState,
    failure_count: u32,
    /// Monotonic instant of the last failure; drives the reset timeout.
    last_failure: Option<Instant>,
    last_failure_time: Option<DateTime<Utc>>,
    trials_in_flight: u32,
}

impl BreakerEntry {
    fn snapshot(&self) -> CircuitBreakerState {
        CircuitBreakerState {
            state: self.state,
            failure_count: self.failure_count,
            last_failure_time: self.last_failure_time,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Admission {
    Normal,
    Trial,
}

fn lock_err() -> KyroError {
    KyroError::internal("circuit breaker lock poisoned")
}

/// Process-local breaker state for every resolver name.
#[derive(Debug, Default)]
pub struct CircuitBreakerRegistry {
    entries: RwLock<HashMap<String, Arc<Mutex<BreakerEntry>>>>,
}

impl CircuitBreakerRegistry {
    /// Creates a registry with no breakers.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    fn entry(&self, resolver_name: &str) -> KyroResult<Arc<Mutex<BreakerEntry>>> {
        {
            let entries = self.entries.read().map_err(|_| lock_err())?;
            if let Some(e) = entries.get(resolver_name) {
                return Ok(Arc::clone(e));
            }
        }
        let mut entries = self.entries.write().map_err(|_| lock_err())?;
        Ok(Arc::clone(entries.entry(resolver_name.to_string()).or_default()))
    }

    /// Current state for `resolver_name`; `None` if it has never been used.
    pub fn state(&self, resolver_name: &str) -> KyroResult<Option<CircuitBreakerState>> {
        let entries = self.entries.read().map_err(|_| lock_err())?;
        match entries.get(resolver_name) {
            Some(e) => Ok(Some(e.lock().map_err(|_| lock_err())?.snapshot())),
            None => Ok(None),
        }
    }

    /// Forgets the state for `resolver_name`. Returns true if it existed.
    pub fn reset(&self, resolver_name: &str) -> KyroResult<bool> {
        let mut entries = self.entries.write().map_err(|_| lock_err())?;
        Ok(entries.remove(resolver_name).is_some())
    }

    /// Forgets every breaker.
    pub fn reset_all(&self) -> KyroResult<()> {
        self.entries.write().map_err(|_| lock_err())?.clear();
        Ok(())
    }
}

/// Releases a half-open trial slot, also when the call is cancelled.
struct TrialGuard {
    entry: Arc<Mutex<BreakerEntry>>,
}

impl Drop for TrialGuard {
    fn drop(&mut self) {
        if let Ok(mut e) = self.entry.lock() {
            e.trials_in_flight = e.trials_in_flight.saturating_sub(1);
        }
    }
}

fn admit(
    entry: &mut BreakerEntry,
    policy: &CircuitBreakerPolicy,
    resolver_name: &str,
    label: &str,
) -> KyroResult<Admission> {
    let rejected = || KyroError::CircuitOpen {
        resolver_name: resolver_name.to_string(),
    };

    if entry.state == CircuitState::Closed {
        return Ok(Admission::Normal);
    }

    if entry.state == CircuitState::Open {
        let reset_after = Duration::from_millis(policy.reset_timeout_ms);
        let cooling = entry.last_failure.is_some_and(|t| t.elapsed() < reset_after);
        if cooling {
            tracing::debug!(resolver = resolver_name, label, "circuit open, rejecting call");
            return Err(rejected());
        }
        tracing::debug!(resolver = resolver_name, label, "circuit half-open, admitting trial call");
        entry.state = CircuitState::HalfOpen;
        entry.trials_in_flight = 0;
    }

    if entry.trials_in_flight >= policy.half_open_max_attempts.max(1) {
        return Err(rejected());
    }
    entry.trials_in_flight += 1;
    Ok(Admission::Trial)
}

fn record(
    entry: &mut BreakerEntry,
    policy: &CircuitBreakerPolicy,
    admission: Admission,
    succeeded: bool,
    resolver_name: &str,
) {
    if succeeded {
        match (entry.state, admission) {
            (CircuitState::HalfOpen, Admission::Trial) => {
                tracing::info!(resolver = resolver_name, "circuit closed after successful trial call");
                entry.state = CircuitState::Closed;
                entry.failure_count = 0;
            }
            (CircuitState::Closed, _) => entry.failure_count = 0,
            // A call admitted before the circuit opened does not close it.
            _ => {}
        }
        return;
    }

    entry.failure_count = entry.failure_count.saturating_add(1);
    entry.last_failure = Some(Instant::now());
    entry.last_failure_time = Some(Utc::now());

    let trip = match entry.state {
        CircuitState::Closed => entry.failure_count >= policy.failure_threshold.max(1),
        CircuitState::HalfOpen => admission == Admission::Trial,
        CircuitState::Open => false,
    };
    if trip {
        tracing::warn!(
            resolver = resolver_name,
            failures = entry.failure_count,
            reset_timeout_ms = policy.reset_timeout_ms,
            "circuit opened"
        );
        entry.state = CircuitState::Open;
    }
}

/// Runs `fut` under the breaker for `resolver_name`.
///
/// An open circuit fails with `KyroError::CircuitOpen` without polling `fut`.
pub async fn with_circuit_breaker<T, F>(
    breakers: &CircuitBreakerRegistry,
    fut: F,
    policy: &CircuitBreakerPolicy,
    resolver_name: &str,
    label: &str,
) -> KyroResult<T>
where
    F: Future<Output = KyroResult<T>>,
{
    let entry = breakers.entry(resolver_name)?;
    let admission = {
        let mut e = entry.lock().map_err(|_| lock_err())?;
        admit(&mut e, policy, resolver_name, label)?
    };
    let _trial = (admission == Admission::Trial).then(|| TrialGuard {
        entry: Arc::clone(&entry),
    });

    let result = fut.await;

    {
        let mut e = entry.lock().map_err(|_| lock_err())?;
        record(&mut e, policy, admission, result.is_ok(), resolver_name);
    }
    result
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU32, Ordering};

    use crate::error::ResolverError;

    fn policy() -> CircuitBreakerPolicy {
        CircuitBreakerPolicy {
            failure_threshold: 3,
            reset_timeout_ms: 1_000,
            half_open_max_attempts: 1,
        }
    }

    async fn fail(breakers: &CircuitBreakerRegistry, calls: &AtomicU32) -> KyroResult<()> {
        with_circuit_breaker(
            breakers,
            async {
                calls.fetch_add(1, Ordering::SeqCst);
                Err(ResolverError::Connection("down".to_string()).into())
            },
            &policy(),
            "sql",
            "sql.query",
        )
        .await
    }

    async fn succeed(breakers: &CircuitBreakerRegistry, calls: &AtomicU32) -> KyroResult<()> {
        with_circuit_breaker(
            breakers,
            async {
                calls.fetch_add(1, Ordering::SeqCst);
                Ok(())
            },
            &policy(),
            "sql",
            "sql.query",
        )
        .await
    }

    fn state_of(breakers: &CircuitBreakerRegistry) -> CircuitBreakerState {
        breakers.state("sql").unwrap().unwrap_or_default()
    }

    #[tokio::test(start_paused = true)]
    async fn test_opens_after_threshold() {
        let breakers = CircuitBreakerRegistry::new();
        let calls = AtomicU32::new(0);

        for _ in 0..2 {
            assert!(fail(&breakers, &calls).await.unwrap_err().is_resolver());
        }
        assert_eq!(state_of(&breakers).state, CircuitState::Closed);
        assert_eq!(state_of(&breakers).failure_count, 2);

        fail(&breakers, &calls).await.unwrap_err();
        let s = state_of(&breakers);
        assert_eq!(s.state, CircuitState::Open);
        assert!(s.last_failure_time.is_some());

        let err = succeed(&breakers, &calls).await.unwrap_err();
        assert!(err.is_circuit_open());
        assert_eq!(calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test(start_paused = true)]
    async fn test_success_in_closed_resets_count() {
        let breakers = CircuitBreakerRegistry::new();
        let calls = AtomicU32::new(0);
        fail(&breakers, &calls).await.unwrap_err();
        fail(&breakers, &calls).await.unwrap_err();
        succeed(&breakers, &calls).await.unwrap();
        assert_eq!(state_of(&breakers).failure_count, 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_half_open_trial_closes_or_reopens() {
        let breakers = CircuitBreakerRegistry::new();
        let calls = AtomicU32::new(0);
        for _ in 0..3 {
            fail(&breakers, &calls).await.unwrap_err();
        }

        tokio::time::advance(Duration::from_millis(1_001)).await;
        assert!(fail(&breakers, &calls).await.unwrap_err().is_resolver());
        assert_eq!(state_of(&breakers).state, CircuitState::Open);
        assert!(succeed(&breakers, &calls).await.unwrap_err().is_circuit_open());

        tokio::time::advance(Duration::from_millis(1_001)).await;
        succeed(&breakers, &calls).await.unwrap();
        let s = state_of(&breakers);
        assert_eq!(s.state, CircuitState::Closed);
        assert_eq!(s.failure_count, 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_half_open_limits_concurrent_trials() {
        let breakers = CircuitBreakerRegistry::new();
        let calls = AtomicU32::new(0);
        for _ in 0..3 {
            fail(&breakers, &calls).await.unwrap_err();
        }
        tokio::time::advance(Duration::from_millis(1_001)).await;

        let trial_policy = policy();
        let slow_trial = with_circuit_breaker(
            &breakers,
            async {
                tokio::time::sleep(Duration::from_millis(50)).await;
                Ok::<_, KyroError>(())
            },
            &trial_policy,
            "sql",
            "sql.query",
        );
        let extra = async {
            tokio::task::yield_now().await;
            succeed(&breakers, &calls).await
        };
        let (trial, rejected) = tokio::join!(slow_trial, extra);
        trial.unwrap();
        assert!(rejected.unwrap_err().is_circuit_open());
        assert_eq!(state_of(&breakers).state, CircuitState::Closed);
    }

    #[tokio::test(start_paused = true)]
    async fn test_reset_clears_state() {
        let breakers = CircuitBreakerRegistry::new();
        let calls = AtomicU32::new(0);
        for _ in 0..3 {
            fail(&breakers, &calls).await.unwrap_err();
        }
        assert!(breakers.reset("sql").unwrap());
        assert!(breakers.state("sql").unwrap().is_none());
        succeed(&breakers, &calls).await.unwrap();

        breakers.reset_all().unwrap();
        assert!(breakers.state("sql").unwrap().is_none());
    }
}
