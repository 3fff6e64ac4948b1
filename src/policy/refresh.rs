//! Periodic policy refresh from an external source.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;

use crate::error::{KyroError, KyroResult};

use super::config::ConnectionPolicy;
use super::store::PolicyStore;

/// Default refresh period.
pub const DEFAULT_REFRESH_INTERVAL: Duration = Duration::from_secs(300);

/// Where refreshed policies come from (metadata service, config file, ...).
#[async_trait]
pub trait PolicySource: Send + Sync {
    /// Resolver name to policy.
    async fn load_policies(&self) -> KyroResult<HashMap<String, ConnectionPolicy>>;
}

/// Serves a fixed policy map.
#[derive(Debug, Clone, Default)]
pub struct StaticPolicySource {
    policies: HashMap<String, ConnectionPolicy>,
}

impl StaticPolicySource {
    /// Serves `policies` on every load.
    #[must_use]
    pub fn new(policies: HashMap<String, ConnectionPolicy>) -> Self {
        Self { policies }
    }
}

#[async_trait]
impl PolicySource for StaticPolicySource {
    async fn load_policies(&self) -> KyroResult<HashMap<String, ConnectionPolicy>> {
        Ok(self.policies.clone())
    }
}

/// Loads `source` once and registers every policy it returns.
///
/// Policies absent from the source are left in place.
pub async fn refresh_once(store: &PolicyStore, source: &dyn PolicySource) -> KyroResult<usize> {
    let policies = source.load_policies().await?;
    let n = policies.len();
    for (name, policy) in policies {
        store.register(&name, policy)?;
    }
    Ok(n)
}

/// Owns the background refresh timer. At most one timer runs per refresher.
#[derive(Debug)]
pub struct PolicyRefresher {
    store: Arc<PolicyStore>,
    task: Mutex<Option<JoinHandle<()>>>,
}

impl PolicyRefresher {
    /// Creates a stopped refresher writing into `store`.
    #[must_use]
    pub fn new(store: Arc<PolicyStore>) -> Self {
        Self {
            store,
            task: Mutex::new(None),
        }
    }

    /// Starts polling `source` every `interval`, the first load happening
    /// immediately. A timer that is already running is replaced.
    ///
    /// # Errors
    /// `KyroError::Config` for a zero interval or outside a Tokio runtime.
    pub fn start(&self, source: Arc<dyn PolicySource>, interval: Duration) -> KyroResult<()> {
        if interval.is_zero() {
            return Err(KyroError::config("policy refresh interval must be greater than zero"));
        }
        let handle = tokio::runtime::Handle::try_current()
            .map_err(|_| KyroError::config("policy refresh requires a Tokio runtime"))?;

        let store = Arc::clone(&self.store);
        let task = handle.spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
            loop {
                ticker.tick().await;
                match refresh_once(&store, source.as_ref()).await {
                    Ok(n) => tracing::info!(policies = n, "connection policies refreshed"),
                    Err(e) => tracing::warn!(error = %e, "connection policy refresh failed"),
                }
            }
        });

        let mut slot = self
            .task
            .lock()
            .map_err(|_| KyroError::internal("policy refresher lock poisoned"))?;
        if let Some(previous) = slot.replace(task) {
            previous.abort();
        }
        Ok(())
    }

    /// Stops the timer. Returns true if one was running.
    pub fn stop(&self) -> KyroResult<bool> {
        let mut slot = self
            .task
            .lock()
            .map_err(|_| KyroError::internal("policy refresher lock poisoned"))?;
        Ok(match slot.take() {
            Some(task) => {
                task.abort();
                true
            }
            None => false,
        })
    }

    /// Returns true while the timer task is alive.
    #[must_use]
    pub fn is_running(&self) -> bool {
        self.task
            .lock()
            .map(|slot| slot.as_ref().is_some_and(|t| !t.is_finished()))
            .unwrap_or(false)
    }
}

impl Drop for PolicyRefresher {
    fn drop(&mut self) {
        if let Ok(mut slot) = self.task.lock() {
            if let Some(task) = slot.take() {
                task.abort();
            }
        }
    }
}
