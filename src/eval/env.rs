//! Execution environment shared by the statements of one workflow.

use std::collections::{BTreeMap, HashMap};
use std::fmt;
use std::sync::Arc;

use crate::error::KyroResult;
use crate::instance::Instance;
use crate::resolver::{AuthInfo, Resolver, ResolverEnvironment, TxnId};
use crate::value::Value;

use super::expr::Scope;

/// One row of `@into` output: column name to value.
pub type ProjectedRow = BTreeMap<String, Value>;

/// What a name is bound to.
#[derive(Debug, Clone, PartialEq)]
pub enum Binding {
    /// A scalar.
    Value(Value),
    /// One instance.
    Instance(Instance),
    /// A query result.
    Instances(Vec<Instance>),
    /// One projected row.
    Row(ProjectedRow),
    /// Projected rows.
    Rows(Vec<ProjectedRow>),
}

impl Binding {
    /// Short name of the variant, for error messages.
    #[must_use]
    pub const fn kind(&self) -> &'static str {
        match self {
            Self::Value(_) => "value",
            Self::Instance(_) => "instance",
            Self::Instances(_) => "instances",
            Self::Row(_) => "row",
            Self::Rows(_) => "rows",
        }
    }
}

/// Result of evaluating one statement.
#[derive(Debug, Clone, PartialEq, Default)]
pub enum EvalResult {
    /// A created, updated or single instance.
    Instance(Instance),
    /// Instances from a query, delete or purge.
    Instances(Vec<Instance>),
    /// Rows produced by `@into`.
    Rows(Vec<ProjectedRow>),
    /// Value of an expression statement.
    Value(Value),
    /// Nothing, e.g. an `if` with no matching branch.
    #[default]
    Empty,
}

impl EvalResult {
    /// True for a zero-length result (what `@catch.not_found` reacts to).
    #[must_use]
    pub fn is_empty(&self) -> bool {
        match self {
            Self::Instances(v) => v.is_empty(),
            Self::Rows(v) => v.is_empty(),
            Self::Empty => true,
            Self::Instance(_) | Self::Value(_) => false,
        }
    }

    /// Number of instances or rows; 1 for a single instance or value.
    #[must_use]
    pub fn len(&self) -> usize {
        match self {
            Self::Instances(v) => v.len(),
            Self::Rows(v) => v.len(),
            Self::Empty => 0,
            Self::Instance(_) | Self::Value(_) => 1,
        }
    }

    /// Instances in the result; empty for rows and values.
    #[must_use]
    pub fn instances(&self) -> &[Instance] {
        match self {
            Self::Instance(i) => std::slice::from_ref(i),
            Self::Instances(v) => v,
            _ => &[],
        }
    }

    /// Consumes the result into its instances.
    #[must_use]
    pub fn into_instances(self) -> Vec<Instance> {
        match self {
            Self::Instance(i) => vec![i],
            Self::Instances(v) => v,
            _ => Vec::new(),
        }
    }

    /// Projected rows; empty unless the statement had `@into`.
    #[must_use]
    pub fn rows(&self) -> &[ProjectedRow] {
        match self {
            Self::Rows(v) => v,
            _ => &[],
        }
    }

    /// The whole result as one binding (`@as name`).
    #[must_use]
    pub fn to_binding(&self) -> Binding {
        match self {
            Self::Instance(i) => Binding::Instance(i.clone()),
            Self::Instances(v) => Binding::Instances(v.clone()),
            Self::Rows(v) => Binding::Rows(v.clone()),
            Self::Value(v) => Binding::Value(v.clone()),
            Self::Empty => Binding::Value(Value::Null),
        }
    }

    /// One binding per element (`@as [a, b]` and for-each).
    #[must_use]
    pub fn to_items(&self) -> Vec<Binding> {
        match self {
            Self::Instance(i) => vec![Binding::Instance(i.clone())],
            Self::Instances(v) => v.iter().cloned().map(Binding::Instance).collect(),
            Self::Rows(v) => v.iter().cloned().map(Binding::Row).collect(),
            Self::Value(Value::List(items)) => items.iter().cloned().map(Binding::Value).collect(),
            Self::Value(v) => vec![Binding::Value(v.clone())],
            Self::Empty => Vec::new(),
        }
    }
}

/// Resolvers enlisted in the active transaction, with their handles.
#[derive(Default)]
pub(crate) struct TransactionScope {
    enlisted: Vec<(Arc<dyn Resolver>, TxnId)>,
}

impl fmt::Debug for TransactionScope {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_list()
            .entries(self.enlisted.iter().map(|(r, txn)| (r.name().to_string(), *txn)))
            .finish()
    }
}

fn same_resolver(a: &Arc<dyn Resolver>, b: &Arc<dyn Resolver>) -> bool {
    std::ptr::eq(Arc::as_ptr(a).cast::<()>(), Arc::as_ptr(b).cast::<()>())
}

impl TransactionScope {
    pub(crate) fn is_enlisted(&self, resolver: &Arc<dyn Resolver>) -> bool {
        self.enlisted.iter().any(|(r, _)| same_resolver(r, resolver))
    }

    pub(crate) fn enlist(&mut self, resolver: Arc<dyn Resolver>, txn: TxnId) {
        self.enlisted.push((resolver, txn));
    }

    /// Commits every enlisted resolver in order. If one commit fails the
    /// remaining ones are rolled back.
    pub(crate) async fn commit(self) -> KyroResult<()> {
        let mut pending = self.enlisted.into_iter();
        while let Some((resolver, txn)) = pending.next() {
            if let Err(e) = resolver.commit_transaction(txn).await {
                tracing::warn!(resolver = resolver.name(), txn, error = %e, "commit failed, rolling back the rest");
                Self {
                    enlisted: pending.collect(),
                }
                .rollback()
                .await;
                return Err(e);
            }
        }
        Ok(())
    }

    /// Rolls back every enlisted resolver, most recent first.
    pub(crate) async fn rollback(self) {
        for (resolver, txn) in self.enlisted.into_iter().rev() {
            if let Err(e) = resolver.rollback_transaction(txn).await {
                tracing::warn!(resolver = resolver.name(), txn, error = %e, "rollback failed");
            }
        }
    }
}

/// Holds an environment's transaction for the length of one block.
///
/// [`Self::finish`] hands the scope back for commit or rollback. If the guard
/// is dropped first (the evaluating future was cancelled or timed out), the
/// environment leaves the transaction and the enlisted resolvers are rolled
/// back on the current Tokio runtime.
pub(crate) struct TransactionGuard<'a> {
    env: &'a mut Environment,
}

impl<'a> TransactionGuard<'a> {
    pub(crate) fn begin(env: &'a mut Environment) -> Self {
        env.transaction = Some(TransactionScope::default());
        Self { env }
    }

    pub(crate) fn env(&mut self) -> &mut Environment {
        self.env
    }

    pub(crate) fn finish(mut self) -> TransactionScope {
        self.env.transaction.take().unwrap_or_default()
    }
}

impl Drop for TransactionGuard<'_> {
    fn drop(&mut self) {
        let Some(scope) = self.env.transaction.take() else {
            return;
        };
        if scope.enlisted.is_empty() {
            return;
        }
        match tokio::runtime::Handle::try_current() {
            Ok(handle) => {
                tracing::debug!(resolvers = scope.enlisted.len(), "transaction abandoned, rolling back");
                handle.spawn(scope.rollback());
            }
            Err(_) => {
                tracing::warn!(
                    resolvers = scope.enlisted.len(),
                    "transaction abandoned outside a runtime, cannot roll back"
                );
            }
        }
    }
}

/// Alias bindings, last result, caller identity and the active transaction.
#[derive(Debug)]
pub struct Environment {
    scopes: Vec<HashMap<String, Binding>>,
    last_result: EvalResult,
    auth: Option<AuthInfo>,
    resolver_env: ResolverEnvironment,
    pub(crate) transaction: Option<TransactionScope>,
}

impl Default for Environment {
    fn default() -> Self {
        Self::new()
    }
}

impl Environment {
    /// Creates an environment with one empty scope.
    #[must_use]
    pub fn new() -> Self {
        Self {
            scopes: vec![HashMap::new()],
            last_result: EvalResult::Empty,
            auth: None,
            resolver_env: ResolverEnvironment::new(),
            transaction: None,
        }
    }

    /// Identity passed to every resolver used.
    #[must_use]
    pub fn with_auth(mut self, auth: AuthInfo) -> Self {
        self.auth = Some(auth);
        self
    }

    /// Settings passed to every resolver used.
    #[must_use]
    pub fn with_resolver_environment(mut self, env: ResolverEnvironment) -> Self {
        self.resolver_env = env;
        self
    }

    /// Binds `name` in the innermost scope.
    pub fn bind(&mut self, name: impl Into<String>, binding: Binding) {
        if let Some(scope) = self.scopes.last_mut() {
            scope.insert(name.into(), binding);
        }
    }

    /// Innermost binding of `name`.
    #[must_use]
    pub fn lookup(&self, name: &str) -> Option<&Binding> {
        self.scopes.iter().rev().find_map(|s| s.get(name))
    }

    pub(crate) fn push_scope(&mut self) {
        self.scopes.push(HashMap::new());
    }

    pub(crate) fn pop_scope(&mut self) {
        if self.scopes.len() > 1 {
            self.scopes.pop();
        }
    }

    /// Result of the most recent statement.
    #[must_use]
    pub fn last_result(&self) -> &EvalResult {
        &self.last_result
    }

    pub(crate) fn set_last_result(&mut self, result: EvalResult) {
        self.last_result = result;
    }

    /// Caller identity, if set.
    #[must_use]
    pub fn auth(&self) -> Option<&AuthInfo> {
        self.auth.as_ref()
    }

    /// Settings handed to resolvers.
    #[must_use]
    pub fn resolver_environment(&self) -> &ResolverEnvironment {
        &self.resolver_env
    }

    /// Returns true while `evaluate_in_transaction` is running.
    #[must_use]
    pub fn in_transaction(&self) -> bool {
        self.transaction.is_some()
    }
}

impl Scope for Environment {
    fn binding(&self, name: &str) -> Option<&Binding> {
        self.lookup(name)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_inner_scope_shadows_and_pops() {
        let mut env = Environment::new();
        env.bind("x", Binding::Value(Value::Int(1)));
        env.push_scope();
        env.bind("x", Binding::Value(Value::Int(2)));
        assert_eq!(env.lookup("x"), Some(&Binding::Value(Value::Int(2))));
        env.pop_scope();
        assert_eq!(env.lookup("x"), Some(&Binding::Value(Value::Int(1))));

        // The root scope is never popped.
        env.pop_scope();
        assert!(env.lookup("x").is_some());
    }

    #[test]
    fn test_result_items() {
        let rows = vec![ProjectedRow::new(), ProjectedRow::new()];
        assert_eq!(EvalResult::Rows(rows).to_items().len(), 2);
        assert!(EvalResult::Instances(Vec::new()).is_empty());
        assert!(!EvalResult::Value(Value::Null).is_empty());
        assert_eq!(EvalResult::Empty.to_binding(), Binding::Value(Value::Null));
    }
}
