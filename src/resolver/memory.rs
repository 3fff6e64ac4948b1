//! In-memory resolver.
//!
//! Thread-safe reference backend implementing every capability. It is the
//! default resolver for unbound paths and the backend used throughout the
//! tests. Records of each entity path are kept in insertion order.

use std::collections::{BTreeMap, HashMap};
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::{Mutex, RwLock};

use async_trait::async_trait;

use crate::error::{KyroResult, ResolverError};
use crate::instance::{Attributes, Instance};

use super::query::Query;
use super::traits::{AuthInfo, Resolver, ResolverOutcome, TxnId};

fn lock_err(context: &'static str) -> ResolverError {
    ResolverError::Backend(format!("poisoned lock: {context}"))
}

fn identity_key(instance: &Instance) -> Result<String, ResolverError> {
    instance.id_key().ok_or_else(|| {
        ResolverError::Backend(format!(
            "instance of '{}' has no value for identity '{}'",
            instance.entity, instance.id_attribute
        ))
    })
}

#[derive(Debug, Clone, Default)]
struct Extent {
    next_seq: u64,
    records: BTreeMap<u64, Instance>,
    by_key: HashMap<String, u64>,
}

impl Extent {
    fn get(&self, key: &str) -> Option<&Instance> {
        self.by_key.get(key).and_then(|seq| self.records.get(seq))
    }

    fn insert(&mut self, key: String, instance: Instance) {
        if let Some(seq) = self.by_key.get(&key) {
            self.records.insert(*seq, instance);
            return;
        }
        let seq = self.next_seq;
        self.next_seq += 1;
        self.by_key.insert(key, seq);
        self.records.insert(seq, instance);
    }

    fn remove(&mut self, key: &str) -> bool {
        match self.by_key.remove(key) {
            Some(seq) => self.records.remove(&seq).is_some(),
            None => false,
        }
    }
}

#[derive(Debug, Clone, Default)]
struct MemoryState {
    extents: HashMap<String, Extent>,
}

impl MemoryState {
    fn remove_all(&mut self, instances: &[Instance]) -> Result<usize, ResolverError> {
        let mut removed = 0;
        for inst in instances {
            let key = identity_key(inst)?;
            if let Some(extent) = self.extents.get_mut(&inst.entity) {
                if extent.remove(&key) {
                    removed += 1;
                }
            }
        }
        Ok(removed)
    }
}

/// Full-capability in-memory backend.
///
/// Transactions snapshot the whole store on `start_transaction` and restore
/// it on rollback, so overlapping transactions on one instance are not
/// isolated from each other.
#[derive(Debug)]
pub struct InMemoryResolver {
    name: String,
    state: RwLock<MemoryState>,
    snapshots: Mutex<HashMap<TxnId, MemoryState>>,
    next_txn: AtomicU64,
    subscriptions: AtomicUsize,
    auth: RwLock<Option<AuthInfo>>,
}

impl Default for InMemoryResolver {
    fn default() -> Self {
        Self::new()
    }
}

impl InMemoryResolver {
    /// Creates an empty resolver named `memory`.
    #[must_use]
    pub fn new() -> Self {
        Self::with_name(super::DEFAULT_RESOLVER)
    }

    /// Creates an empty resolver reporting `name`.
    #[must_use]
    pub fn with_name(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            state: RwLock::new(MemoryState::default()),
            snapshots: Mutex::new(HashMap::new()),
            next_txn: AtomicU64::new(1),
            subscriptions: AtomicUsize::new(0),
            auth: RwLock::new(None),
        }
    }

    /// Number of stored records for `entity`.
    pub fn len(&self, entity: &str) -> KyroResult<usize> {
        let state = self.state.read().map_err(|_| lock_err("state"))?;
        Ok(state.extents.get(entity).map_or(0, |e| e.records.len()))
    }

    /// How many times `subscribe` has been called.
    #[must_use]
    pub fn subscription_count(&self) -> usize {
        self.subscriptions.load(Ordering::SeqCst)
    }

    /// The last identity passed through `set_auth_info`.
    pub fn auth_info(&self) -> KyroResult<Option<AuthInfo>> {
        Ok(self.auth.read().map_err(|_| lock_err("auth"))?.clone())
    }

    /// Number of open transactions.
    pub fn active_transactions(&self) -> KyroResult<usize> {
        Ok(self.snapshots.lock().map_err(|_| lock_err("snapshots"))?.len())
    }
}

#[async_trait]
impl Resolver for InMemoryResolver {
    fn name(&self) -> &str {
        &self.name
    }

    #[tracing::instrument(level = "trace", skip(self, instance), fields(resolver = %self.name, entity = %instance.entity))]
    async fn create_instance(&self, instance: &Instance) -> KyroResult<ResolverOutcome<Instance>> {
        let key = identity_key(instance)?;
        let stored = instance.detached();
        let mut state = self.state.write().map_err(|_| lock_err("state"))?;
        let extent = state.extents.entry(instance.entity.clone()).or_default();
        if extent.get(&key).is_some() {
            return Err(ResolverError::DuplicateKey(format!("{}/{key}", instance.entity)).into());
        }
        extent.insert(key, stored.clone());
        Ok(ResolverOutcome::Done(stored))
    }

    #[tracing::instrument(level = "trace", skip(self, instance), fields(resolver = %self.name, entity = %instance.entity))]
    async fn upsert_instance(&self, instance: &Instance) -> KyroResult<ResolverOutcome<Instance>> {
        let key = identity_key(instance)?;
        let stored = instance.detached();
        let mut state = self.state.write().map_err(|_| lock_err("state"))?;
        state
            .extents
            .entry(instance.entity.clone())
            .or_default()
            .insert(key, stored.clone());
        Ok(ResolverOutcome::Done(stored))
    }

    #[tracing::instrument(level = "trace", skip(self, instance, new_attributes), fields(resolver = %self.name, entity = %instance.entity))]
    async fn update_instance(
        &self,
        instance: &Instance,
        new_attributes: &Attributes,
    ) -> KyroResult<ResolverOutcome<Instance>> {
        let key = identity_key(instance)?;
        let mut state = self.state.write().map_err(|_| lock_err("state"))?;
        let extent = state
            .extents
            .get_mut(&instance.entity)
            .ok_or_else(|| ResolverError::NotFound(format!("{}/{key}", instance.entity)))?;
        let updated = extent
            .get(&key)
            .ok_or_else(|| ResolverError::NotFound(format!("{}/{key}", instance.entity)))?
            .merged(new_attributes);
        extent.insert(key, updated.clone());
        Ok(ResolverOutcome::Done(updated))
    }

    #[tracing::instrument(level = "trace", skip(self, query), fields(resolver = %self.name, entity = %query.entity))]
    async fn query_instances(&self, query: &Query, query_all: bool) -> KyroResult<ResolverOutcome<Vec<Instance>>> {
        let state = self.state.read().map_err(|_| lock_err("state"))?;
        let Some(extent) = state.extents.get(&query.entity) else {
            return Ok(ResolverOutcome::Done(Vec::new()));
        };
        let mut out = Vec::new();
        for inst in extent.records.values() {
            if query_all || query.matches(inst)? {
                out.push(inst.clone());
            }
        }
        Ok(ResolverOutcome::Done(out))
    }

    /// Cascading is driven by the evaluator, which knows the schema; this
    /// backend removes exactly the given records.
    async fn delete_instances(&self, instances: &[Instance], _cascade: bool) -> KyroResult<ResolverOutcome<usize>> {
        let mut state = self.state.write().map_err(|_| lock_err("state"))?;
        Ok(ResolverOutcome::Done(state.remove_all(instances)?))
    }

    async fn purge_instances(&self, instances: &[Instance]) -> KyroResult<ResolverOutcome<usize>> {
        let mut state = self.state.write().map_err(|_| lock_err("state"))?;
        Ok(ResolverOutcome::Done(state.remove_all(instances)?))
    }

    async fn start_transaction(&self) -> KyroResult<TxnId> {
        let snapshot = self.state.read().map_err(|_| lock_err("state"))?.clone();
        let txn = self.next_txn.fetch_add(1, Ordering::SeqCst);
        self.snapshots
            .lock()
            .map_err(|_| lock_err("snapshots"))?
            .insert(txn, snapshot);
        tracing::trace!(resolver = %self.name, txn, "transaction started");
        Ok(txn)
    }

    async fn commit_transaction(&self, txn: TxnId) -> KyroResult<()> {
        self.snapshots
            .lock()
            .map_err(|_| lock_err("snapshots"))?
            .remove(&txn)
            .ok_or(ResolverError::UnknownTransaction(txn))?;
        Ok(())
    }

    async fn rollback_transaction(&self, txn: TxnId) -> KyroResult<()> {
        let snapshot = self
            .snapshots
            .lock()
            .map_err(|_| lock_err("snapshots"))?
            .remove(&txn)
            .ok_or(ResolverError::UnknownTransaction(txn))?;
        *self.state.write().map_err(|_| lock_err("state"))? = snapshot;
        tracing::debug!(resolver = %self.name, txn, "transaction rolled back");
        Ok(())
    }

    async fn subscribe(&self) -> KyroResult<ResolverOutcome<()>> {
        self.subscriptions.fetch_add(1, Ordering::SeqCst);
        Ok(ResolverOutcome::Done(()))
    }

    fn set_auth_info(&self, auth: &AuthInfo) {
        if let Ok(mut slot) = self.auth.write() {
            *slot = Some(auth.clone());
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::KyroError;
    use crate::resolver::query::{CompareOp, Filter};
    use crate::value::Value;

    fn employee(id: i64, name: &str) -> Instance {
        let mut attrs = Attributes::new();
        attrs.insert("id".to_string(), Value::Int(id));
        attrs.insert("name".to_string(), Value::from(name));
        Instance::new("Employee", "id", attrs)
    }

    fn ids(instances: &[Instance]) -> Vec<i64> {
        instances.iter().filter_map(|i| i.id().and_then(Value::as_int)).collect()
    }

    #[tokio::test]
    async fn test_create_query_in_insertion_order() {
        let r = InMemoryResolver::new();
        for (id, name) in [(3, "c"), (1, "a"), (2, "b")] {
            r.create_instance(&employee(id, name)).await.unwrap();
        }
        let all = r
            .query_instances(&Query::new("Employee"), true)
            .await
            .unwrap()
            .into_option()
            .unwrap();
        assert_eq!(ids(&all), vec![3, 1, 2]);

        let q = Query::new("Employee").filter(Filter::new("id", CompareOp::Gt, 1));
        let some = r.query_instances(&q, false).await.unwrap().into_option().unwrap();
        assert_eq!(ids(&some), vec![3, 2]);

        let ignored = r.query_instances(&q, true).await.unwrap().into_option().unwrap();
        assert_eq!(ignored.len(), 3);
    }

    #[tokio::test]
    async fn test_duplicate_create_rejected() {
        let r = InMemoryResolver::new();
        r.create_instance(&employee(1, "a")).await.unwrap();
        let err = r.create_instance(&employee(1, "b")).await.unwrap_err();
        assert!(matches!(err, KyroError::Resolver(ResolverError::DuplicateKey(_))));
    }

    #[tokio::test]
    async fn test_update_and_upsert() {
        let r = InMemoryResolver::new();
        r.create_instance(&employee(1, "a")).await.unwrap();

        let mut changes = Attributes::new();
        changes.insert("name".to_string(), Value::from("z"));
        let updated = r
            .update_instance(&employee(1, "a"), &changes)
            .await
            .unwrap()
            .into_option()
            .unwrap();
        assert_eq!(updated.get("name"), Some(&Value::from("z")));

        let err = r.update_instance(&employee(9, "x"), &changes).await.unwrap_err();
        assert!(matches!(err, KyroError::Resolver(ResolverError::NotFound(_))));

        r.upsert_instance(&employee(1, "y")).await.unwrap();
        r.upsert_instance(&employee(2, "w")).await.unwrap();
        assert_eq!(r.len("Employee").unwrap(), 2);
    }

    #[tokio::test]
    async fn test_rollback_restores_snapshot() {
        let r = InMemoryResolver::new();
        r.create_instance(&employee(1, "a")).await.unwrap();

        let txn = r.start_transaction().await.unwrap();
        r.create_instance(&employee(2, "b")).await.unwrap();
        r.delete_instances(&[employee(1, "a")], false).await.unwrap();
        r.rollback_transaction(txn).await.unwrap();

        let all = r
            .query_instances(&Query::new("Employee"), true)
            .await
            .unwrap()
            .into_option()
            .unwrap();
        assert_eq!(ids(&all), vec![1]);
        assert_eq!(r.active_transactions().unwrap(), 0);

        let err = r.commit_transaction(txn).await.unwrap_err();
        assert!(matches!(err, KyroError::Resolver(ResolverError::UnknownTransaction(_))));
    }

    #[tokio::test]
    async fn test_purge_counts_removed() {
        let r = InMemoryResolver::new();
        r.create_instance(&employee(1, "a")).await.unwrap();
        let n = r
            .purge_instances(&[employee(1, "a"), employee(5, "e")])
            .await
            .unwrap();
        assert_eq!(n, ResolverOutcome::Done(1));
        assert_eq!(r.len("Employee").unwrap(), 0);
    }
}
