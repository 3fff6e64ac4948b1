//! Policy-wrapping resolver.

use std::fmt;
use std::sync::Arc;

use async_trait::async_trait;

use crate::error::KyroResult;
use crate::instance::{Attributes, Instance};
use crate::policy::{with_timeout, ConnectionPolicy, PolicyEngine};

use super::query::Query;
use super::traits::{AuthInfo, Resolver, ResolverEnvironment, ResolverOutcome, TxnId};

/// Decorates a resolver so every data call goes through
/// [`PolicyEngine::apply`].
///
/// The policy is looked up on each call: a policy registered in the engine
/// for the resolver's name wins over the one given at construction, so
/// policies can be swapped while the resolver is in use. Transaction and
/// auth/environment calls are forwarded without policies.
pub struct PolicyResolver {
    inner: Arc<dyn Resolver>,
    policy: Option<ConnectionPolicy>,
    engine: PolicyEngine,
}

impl fmt::Debug for PolicyResolver {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PolicyResolver")
            .field("inner", &self.inner.name())
            .field("policy", &self.policy)
            .finish_non_exhaustive()
    }
}

impl PolicyResolver {
    /// Wraps `inner`; `policy` overrides the engine's cached one.
    #[must_use]
    pub fn new(inner: Arc<dyn Resolver>, policy: Option<ConnectionPolicy>, engine: PolicyEngine) -> Self {
        Self { inner, policy, engine }
    }

    /// The wrapped backend.
    #[must_use]
    pub fn inner(&self) -> &Arc<dyn Resolver> {
        &self.inner
    }

    /// The policy applied to the next call; a no-op policy when none is set.
    #[must_use]
    pub fn effective_policy(&self) -> ConnectionPolicy {
        match self.engine.get_connection_policy(self.inner.name()) {
            Ok(Some(p)) => p,
            Ok(None) => self.policy.unwrap_or_default(),
            Err(e) => {
                tracing::warn!(resolver = self.inner.name(), error = %e, "policy lookup failed, using binding policy");
                self.policy.unwrap_or_default()
            }
        }
    }

    fn label(&self, op: &str) -> String {
        format!("{}.{op}", self.inner.name())
    }
}

#[async_trait]
impl Resolver for PolicyResolver {
    fn name(&self) -> &str {
        self.inner.name()
    }

    async fn create_instance(&self, instance: &Instance) -> KyroResult<ResolverOutcome<Instance>> {
        let policy = self.effective_policy();
        self.engine
            .apply(&policy, self.name(), &self.label("create"), || {
                self.inner.create_instance(instance)
            })
            .await
    }

    async fn upsert_instance(&self, instance: &Instance) -> KyroResult<ResolverOutcome<Instance>> {
        let policy = self.effective_policy();
        self.engine
            .apply(&policy, self.name(), &self.label("upsert"), || {
                self.inner.upsert_instance(instance)
            })
            .await
    }

    async fn update_instance(
        &self,
        instance: &Instance,
        new_attributes: &Attributes,
    ) -> KyroResult<ResolverOutcome<Instance>> {
        let policy = self.effective_policy();
        self.engine
            .apply(&policy, self.name(), &self.label("update"), || {
                self.inner.update_instance(instance, new_attributes)
            })
            .await
    }

    async fn query_instances(&self, query: &Query, query_all: bool) -> KyroResult<ResolverOutcome<Vec<Instance>>> {
        let policy = self.effective_policy();
        self.engine
            .apply(&policy, self.name(), &self.label("query"), || {
                self.inner.query_instances(query, query_all)
            })
            .await
    }

    async fn delete_instances(&self, instances: &[Instance], cascade: bool) -> KyroResult<ResolverOutcome<usize>> {
        let policy = self.effective_policy();
        self.engine
            .apply(&policy, self.name(), &self.label("delete"), || {
                self.inner.delete_instances(instances, cascade)
            })
            .await
    }

    async fn purge_instances(&self, instances: &[Instance]) -> KyroResult<ResolverOutcome<usize>> {
        let policy = self.effective_policy();
        self.engine
            .apply(&policy, self.name(), &self.label("purge"), || {
                self.inner.purge_instances(instances)
            })
            .await
    }

    async fn start_transaction(&self) -> KyroResult<TxnId> {
        self.inner.start_transaction().await
    }

    async fn commit_transaction(&self, txn: TxnId) -> KyroResult<()> {
        self.inner.commit_transaction(txn).await
    }

    async fn rollback_transaction(&self, txn: TxnId) -> KyroResult<()> {
        self.inner.rollback_transaction(txn).await
    }

    /// Bounded by the connect timeout only.
    async fn subscribe(&self) -> KyroResult<ResolverOutcome<()>> {
        match self.effective_policy().timeout {
            Some(t) => with_timeout(self.inner.subscribe(), t.connect_timeout_ms, &self.label("subscribe")).await,
            None => self.inner.subscribe().await,
        }
    }

    fn set_auth_info(&self, auth: &AuthInfo) {
        self.inner.set_auth_info(auth);
    }

    fn set_environment(&self, env: &ResolverEnvironment) {
        self.inner.set_environment(env);
    }
}
