//! Policy composition.

use std::future::Future;
use std::sync::Arc;

use crate::error::KyroResult;

use super::breaker::{with_circuit_breaker, CircuitBreakerRegistry, CircuitBreakerState};
use super::config::ConnectionPolicy;
use super::retry::with_retry;
use super::store::PolicyStore;
use super::timeout::with_timeout;

/// Applies connection policies around resolver calls.
///
/// Cloning is cheap; clones share the policy cache and breaker state.
#[derive(Debug, Clone, Default)]
pub struct PolicyEngine {
    store: Arc<PolicyStore>,
    breakers: Arc<CircuitBreakerRegistry>,
}

impl PolicyEngine {
    /// Creates an engine with its own policy cache and breakers.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Creates an engine over existing state, shared with other engines.
    #[must_use]
    pub fn with_stores(store: Arc<PolicyStore>, breakers: Arc<CircuitBreakerRegistry>) -> Self {
        Self { store, breakers }
    }

    /// The policy cache, for refreshers.
    #[must_use]
    pub fn policy_store(&self) -> &Arc<PolicyStore> {
        &self.store
    }

    /// The breaker registry.
    #[must_use]
    pub fn breakers(&self) -> &Arc<CircuitBreakerRegistry> {
        &self.breakers
    }

    /// Caches `policy` under `resolver_name`, replacing any previous one.
    ///
    /// # Errors
    /// `KyroError::Config` for an invalid policy.
    pub fn register_connection_policy(&self, resolver_name: &str, policy: ConnectionPolicy) -> KyroResult<()> {
        self.store.register(resolver_name, policy)
    }

    /// The cached policy for `resolver_name`, if any.
    ///
    /// # Errors
    /// `KyroError::Internal` if the cache lock is poisoned.
    pub fn get_connection_policy(&self, resolver_name: &str) -> KyroResult<Option<ConnectionPolicy>> {
        self.store.get(resolver_name)
    }

    /// Drops every cached policy.
    ///
    /// # Errors
    /// `KyroError::Internal` if the cache lock is poisoned.
    pub fn reset_policy_cache(&self) -> KyroResult<()> {
        self.store.reset()
    }

    /// Breaker snapshot for `resolver_name`; `None` before its first guarded call.
    ///
    /// # Errors
    /// `KyroError::Internal` if a breaker lock is poisoned.
    pub fn get_circuit_breaker_state(&self, resolver_name: &str) -> KyroResult<Option<CircuitBreakerState>> {
        self.breakers.state(resolver_name)
    }

    /// Forgets the breaker of `resolver_name`. Returns true if it existed.
    ///
    /// # Errors
    /// `KyroError::Internal` if a breaker lock is poisoned.
    pub fn reset_circuit_breaker_state(&self, resolver_name: &str) -> KyroResult<bool> {
        self.breakers.reset(resolver_name)
    }

    /// Forgets every breaker.
    ///
    /// # Errors
    /// `KyroError::Internal` if a breaker lock is poisoned.
    pub fn reset_all_circuit_breaker_states(&self) -> KyroResult<()> {
        self.breakers.reset_all()
    }

    /// Runs `op` under `policy`: circuit breaker outermost, then retry, with
    /// each attempt bounded by the request timeout.
    ///
    /// The breaker only sees the outcome of the fully retried call, so
    /// failures that a retry recovers from never count against it. Missing
    /// sub-policies are skipped.
    pub async fn apply<T, F, Fut>(
        &self,
        policy: &ConnectionPolicy,
        resolver_name: &str,
        label: &str,
        op: F,
    ) -> KyroResult<T>
    where
        F: Fn() -> Fut,
        Fut: Future<Output = KyroResult<T>>,
    {
        let timeout = policy.timeout;
        let attempt = || async {
            match timeout {
                Some(t) => with_timeout(op(), t.request_timeout_ms, label).await,
                None => op().await,
            }
        };

        let retried = async {
            match &policy.retry {
                Some(r) => with_retry(attempt, r, label).await,
                None => attempt().await,
            }
        };

        match &policy.circuit_breaker {
            Some(cb) => with_circuit_breaker(&self.breakers, retried, cb, resolver_name, label).await,
            None => retried.await,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU32, Ordering};
    use std::time::Duration;

    use crate::error::{KyroError, ResolverError};
    use crate::policy::breaker::CircuitState;
    use crate::policy::config::{BackoffPolicy, CircuitBreakerPolicy, RetryPolicy, TimeoutPolicy};

    #[tokio::test(start_paused = true)]
    async fn test_noop_policy_runs_op_once() {
        let engine = PolicyEngine::new();
        let calls = AtomicU32::new(0);
        let err = engine
            .apply(&ConnectionPolicy::default(), "sql", "sql.create", || async {
                calls.fetch_add(1, Ordering::SeqCst);
                Err::<(), _>(ResolverError::Connection("down".to_string()).into())
            })
            .await
            .unwrap_err();
        assert!(err.is_resolver());
        assert_eq!(calls.load(Ordering::SeqCst), 1);
        assert!(engine.get_circuit_breaker_state("sql").unwrap().is_none());
    }

    #[tokio::test(start_paused = true)]
    async fn test_timeout_only_policy() {
        let engine = PolicyEngine::new();
        let policy = ConnectionPolicy::default().with_request_timeout_ms(50);
        let err = engine
            .apply(&policy, "slow", "slow.query", || async {
                tokio::time::sleep(Duration::from_millis(200)).await;
                Ok(())
            })
            .await
            .unwrap_err();
        assert_eq!(
            err,
            KyroError::Timeout {
                label: "slow.query".to_string(),
                ms: 50
            }
        );
    }

    #[tokio::test(start_paused = true)]
    async fn test_each_attempt_is_timeout_bounded() {
        let engine = PolicyEngine::new();
        let calls = AtomicU32::new(0);
        let policy = ConnectionPolicy::default()
            .with_timeout(TimeoutPolicy {
                connect_timeout_ms: 50,
                request_timeout_ms: 50,
            })
            .with_retry(RetryPolicy::new(3, BackoffPolicy::constant(1)));

        let out = engine
            .apply(&policy, "flaky", "flaky.query", || async {
                let n = calls.fetch_add(1, Ordering::SeqCst);
                if n == 0 {
                    tokio::time::sleep(Duration::from_millis(200)).await;
                }
                Ok(n)
            })
            .await
            .unwrap();
        assert_eq!(out, 1);
        assert_eq!(calls.load(Ordering::SeqCst), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn test_open_breaker_skips_op() {
        let engine = PolicyEngine::new();
        let calls = AtomicU32::new(0);
        let policy = ConnectionPolicy::default().with_circuit_breaker(CircuitBreakerPolicy {
            failure_threshold: 1,
            ..CircuitBreakerPolicy::default()
        });
        let op = || async {
            calls.fetch_add(1, Ordering::SeqCst);
            Err::<(), _>(ResolverError::Backend("boom".to_string()).into())
        };

        engine.apply(&policy, "sql", "sql.query", op).await.unwrap_err();
        assert_eq!(
            engine.get_circuit_breaker_state("sql").unwrap().unwrap().state,
            CircuitState::Open
        );
        let err = engine.apply(&policy, "sql", "sql.query", op).await.unwrap_err();
        assert!(err.is_circuit_open());
        assert_eq!(calls.load(Ordering::SeqCst), 1);

        engine.reset_circuit_breaker_state("sql").unwrap();
        engine.apply(&policy, "sql", "sql.query", op).await.unwrap_err();
        assert_eq!(calls.load(Ordering::SeqCst), 2);
    }
}
