//! Resolver capability contract.
//!
//! A resolver implements any subset of the capabilities. Every method has a
//! default body returning [`ResolverOutcome::NotImplemented`], so read-only
//! or otherwise partial backends only override what they support.

use std::collections::BTreeMap;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use crate::error::{EvalError, KyroResult};
use crate::instance::{Attributes, Instance};

use super::query::Query;

/// Backend transaction handle.
pub type TxnId = u64;

/// Handle returned by backends without transaction support.
pub const DEFAULT_TXN_ID: TxnId = 1;

/// Result of a capability call: a value, or the marker that the backend
/// does not offer the capability. Distinct from an empty result.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ResolverOutcome<T> {
    /// The capability ran and produced a value.
    Done(T),
    /// The backend does not offer the capability.
    NotImplemented,
}

impl<T> ResolverOutcome<T> {
    /// Returns true for `Done`.
    #[must_use]
    pub const fn is_implemented(&self) -> bool {
        matches!(self, Self::Done(_))
    }

    /// The value, or `None` when not implemented.
    pub fn into_option(self) -> Option<T> {
        match self {
            Self::Done(v) => Some(v),
            Self::NotImplemented => None,
        }
    }

    /// Maps the value, keeping `NotImplemented`.
    pub fn map<U>(self, f: impl FnOnce(T) -> U) -> ResolverOutcome<U> {
        match self {
            Self::Done(v) => ResolverOutcome::Done(f(v)),
            Self::NotImplemented => ResolverOutcome::NotImplemented,
        }
    }

    /// Unwraps the value, turning `NotImplemented` into an evaluation error.
    pub fn require(self, resolver: &str, capability: &'static str) -> KyroResult<T> {
        match self {
            Self::Done(v) => Ok(v),
            Self::NotImplemented => Err(EvalError::NotImplemented {
                resolver: resolver.to_string(),
                capability,
            }
            .into()),
        }
    }
}

/// Identity of the caller on whose behalf a resolver acts.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AuthInfo {
    /// Acting user.
    pub user_id: String,
    /// Tenant, for multi-tenant backends.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tenant_id: Option<String>,
}

/// Free-form settings passed from the execution environment to a resolver.
pub type ResolverEnvironment = BTreeMap<String, String>;

/// A pluggable persistence backend.
#[async_trait]
pub trait Resolver: Send + Sync {
    /// Name used for policy lookup, breaker state and logging.
    fn name(&self) -> &str;

    /// Persist a new instance; returns the stored instance.
    async fn create_instance(&self, _instance: &Instance) -> KyroResult<ResolverOutcome<Instance>> {
        Ok(ResolverOutcome::NotImplemented)
    }

    /// Create or replace by identity.
    async fn upsert_instance(&self, _instance: &Instance) -> KyroResult<ResolverOutcome<Instance>> {
        Ok(ResolverOutcome::NotImplemented)
    }

    /// Apply `new_attributes` to the stored record matching `instance`'s identity.
    async fn update_instance(
        &self,
        _instance: &Instance,
        _new_attributes: &Attributes,
    ) -> KyroResult<ResolverOutcome<Instance>> {
        Ok(ResolverOutcome::NotImplemented)
    }

    /// Instances of `query.entity` matching every filter. With `query_all`
    /// the filters are ignored and the full extent is returned.
    async fn query_instances(
        &self,
        _query: &Query,
        _query_all: bool,
    ) -> KyroResult<ResolverOutcome<Vec<Instance>>> {
        Ok(ResolverOutcome::NotImplemented)
    }

    /// Delete by identity; returns how many records were removed.
    async fn delete_instances(
        &self,
        _instances: &[Instance],
        _cascade: bool,
    ) -> KyroResult<ResolverOutcome<usize>> {
        Ok(ResolverOutcome::NotImplemented)
    }

    /// Hard-remove records (link records for relationship paths).
    async fn purge_instances(&self, _instances: &[Instance]) -> KyroResult<ResolverOutcome<usize>> {
        Ok(ResolverOutcome::NotImplemented)
    }

    /// Opens a transaction and returns its handle.
    async fn start_transaction(&self) -> KyroResult<TxnId> {
        Ok(DEFAULT_TXN_ID)
    }

    /// Makes the transaction's writes permanent.
    async fn commit_transaction(&self, _txn: TxnId) -> KyroResult<()> {
        Ok(())
    }

    /// Discards the transaction's writes.
    async fn rollback_transaction(&self, _txn: TxnId) -> KyroResult<()> {
        Ok(())
    }

    /// Called once when the registry activates the resolver.
    async fn subscribe(&self) -> KyroResult<ResolverOutcome<()>> {
        Ok(ResolverOutcome::NotImplemented)
    }

    /// Caller identity for subsequent calls.
    fn set_auth_info(&self, _auth: &AuthInfo) {}

    /// Environment settings for subsequent calls.
    fn set_environment(&self, _env: &ResolverEnvironment) {}
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::KyroError;

    struct ReadOnly;

    #[async_trait]
    impl Resolver for ReadOnly {
        fn name(&self) -> &str {
            "read-only"
        }

        async fn query_instances(&self, _query: &Query, _query_all: bool) -> KyroResult<ResolverOutcome<Vec<Instance>>> {
            Ok(ResolverOutcome::Done(Vec::new()))
        }
    }

    #[tokio::test]
    async fn test_partial_resolver_reports_not_implemented() {
        let r = ReadOnly;
        let inst = Instance::new("E", "id", Attributes::new());
        assert_eq!(r.create_instance(&inst).await.unwrap(), ResolverOutcome::NotImplemented);
        assert_eq!(
            r.query_instances(&Query::new("E"), true).await.unwrap(),
            ResolverOutcome::Done(Vec::new())
        );
    }

    #[tokio::test]
    async fn test_default_transaction_is_trivial() {
        let r = ReadOnly;
        let txn = r.start_transaction().await.unwrap();
        assert_eq!(txn, DEFAULT_TXN_ID);
        r.commit_transaction(txn).await.unwrap();
        r.rollback_transaction(txn).await.unwrap();
    }

    #[test]
    fn test_require_maps_to_eval_error() {
        let err = ResolverOutcome::<()>::NotImplemented
            .require("read-only", "create")
            .unwrap_err();
        assert!(matches!(
            err,
            KyroError::Evaluation(EvalError::NotImplemented { capability: "create", .. })
        ));
        assert_eq!(ResolverOutcome::Done(2).map(|v| v * 2).into_option(), Some(4));
    }
}
