//! Statement evaluator.
//!
//! The [`Evaluator`] walks one parsed [`Statement`] at a time against an
//! [`Environment`], dispatching CRUD work to the resolvers the registry
//! assigns to each entity path. Statements of a list run strictly in order,
//! since later statements may reference aliases bound by earlier ones.

use std::collections::HashMap;
use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;

use crate::error::{KyroError, KyroResult, SchemaError};
use crate::instance::{Attributes, Instance};
use crate::resolver::{CompareOp, Filter, Query, Resolver, ResolverRegistry};
use crate::schema::{Cardinality, RelationshipType, Schema};
use crate::value::Value;

use super::env::{Binding, EvalResult, Environment, TransactionGuard};
use super::modifiers;
use super::pattern::{
    Alias, AttributeMode, CrudKind, CrudPattern, ForEachPattern, Hints, IfPattern, Pattern, PurgePattern, Statement,
};

type BoxFut<'a, T> = Pin<Box<dyn Future<Output = KyroResult<T>> + Send + 'a>>;

/// Placeholder name in `@as [a, _, c]` that binds nothing.
const SKIP_BINDING: &str = "_";

/// Name under which a caught error's message is bound inside `@catch.error`.
pub const ERROR_BINDING: &str = "error";

/// The same pattern with plain `attr value` pairs read as equality filters.
///
/// Delete targets, purge ends and relationship sub-patterns of a query
/// select existing instances, so every attribute they carry is a filter.
fn as_query(pattern: &CrudPattern) -> CrudPattern {
    let mut query = pattern.clone();
    query.query_marker = true;
    for attr in &mut query.attributes {
        if attr.mode == AttributeMode::Set {
            attr.mode = AttributeMode::Query(CompareOp::Eq);
        }
    }
    query
}

fn identity_of(instance: &Instance) -> KyroResult<Value> {
    instance.id().cloned().ok_or_else(|| {
        KyroError::internal(format!(
            "instance of '{}' has no identity value '{}'",
            instance.entity, instance.id_attribute
        ))
    })
}

/// Executes statements against a schema and a resolver registry.
///
/// # Example
///
/// ```
/// use std::sync::Arc;
/// use kyrostore::eval::{CrudPattern, Environment, Evaluator, Expr, Statement};
/// use kyrostore::resolver::ResolverRegistry;
/// use kyrostore::schema::{Attribute, AttributeType, EntityType, Schema};
///
/// # tokio_test_block(async {
/// let mut builder = Schema::builder();
/// builder
///     .define_entity(EntityType::new("Employee").attribute(Attribute::new("id", AttributeType::Int).id()))
///     .unwrap();
/// let evaluator = Evaluator::new(Arc::new(builder.build()), Arc::new(ResolverRegistry::default()));
///
/// let mut env = Environment::new();
/// let create = Statement::crud(CrudPattern::new("Employee").set("id", Expr::lit(1)));
/// evaluator.evaluate(&create, &mut env).await.unwrap();
///
/// let all = evaluator
///     .evaluate(&Statement::crud(CrudPattern::query("Employee")), &mut env)
///     .await
///     .unwrap();
/// assert_eq!(all.len(), 1);
/// # });
/// # fn tokio_test_block<F: std::future::Future>(f: F) -> F::Output {
/// #     tokio::runtime::Builder::new_current_thread().enable_all().build().unwrap().block_on(f)
/// # }
/// ```
#[derive(Debug, Clone)]
pub struct Evaluator {
    schema: Arc<Schema>,
    registry: Arc<ResolverRegistry>,
}

impl Evaluator {
    /// Creates an evaluator over `schema`, sending work to `registry`'s resolvers.
    #[must_use]
    pub fn new(schema: Arc<Schema>, registry: Arc<ResolverRegistry>) -> Self {
        Self { schema, registry }
    }

    /// Schema that statements are checked against.
    #[must_use]
    pub fn schema(&self) -> &Schema {
        &self.schema
    }

    /// Registry resolving entity paths to backends.
    #[must_use]
    pub fn registry(&self) -> &ResolverRegistry {
        &self.registry
    }

    /// Evaluates one statement, updating the environment's bindings and
    /// last result.
    ///
    /// # Errors
    /// Any error not intercepted by the statement's `@catch.error` handler.
    pub async fn evaluate(&self, statement: &Statement, env: &mut Environment) -> KyroResult<EvalResult> {
        self.eval_statement(statement, env).await
    }

    /// Evaluates statements in order and returns the last result.
    #[tracing::instrument(level = "debug", skip_all, fields(statements = statements.len()))]
    pub async fn evaluate_all(&self, statements: &[Statement], env: &mut Environment) -> KyroResult<EvalResult> {
        self.eval_list(statements, env).await
    }

    /// Evaluates statements inside a transaction.
    ///
    /// Each resolver touched is enlisted on first use. All of them commit
    /// when the block succeeds and all roll back on any failure. A block
    /// nested inside an active transaction joins it. Dropping the returned
    /// future before it completes also rolls the transaction back.
    #[tracing::instrument(level = "debug", skip_all, fields(statements = statements.len()))]
    pub async fn evaluate_in_transaction(
        &self,
        statements: &[Statement],
        env: &mut Environment,
    ) -> KyroResult<EvalResult> {
        if env.in_transaction() {
            return self.eval_list(statements, env).await;
        }

        let mut guard = TransactionGuard::begin(env);
        let outcome = self.eval_list(statements, guard.env()).await;
        let scope = guard.finish();
        match outcome {
            Ok(result) => {
                scope.commit().await?;
                Ok(result)
            }
            Err(e) => {
                tracing::debug!(error = %e, "statement failed, rolling back");
                scope.rollback().await;
                Err(e)
            }
        }
    }

    fn eval_list<'a>(&'a self, statements: &'a [Statement], env: &'a mut Environment) -> BoxFut<'a, EvalResult> {
        Box::pin(async move {
            let mut last = EvalResult::Empty;
            for statement in statements {
                last = self.eval_statement(statement, env).await?;
            }
            Ok(last)
        })
    }

    fn eval_statement<'a>(&'a self, statement: &'a Statement, env: &'a mut Environment) -> BoxFut<'a, EvalResult> {
        Box::pin(async move {
            let hints = &statement.hints;
            let error_handler = hints.catch.as_ref().and_then(|c| c.error.as_ref());

            let mut result = match self.eval_pattern(statement, env).await {
                Ok(result) => result,
                Err(e) => match error_handler {
                    Some(handler) if e.is_catchable() => {
                        tracing::debug!(error = %e, "running @catch error handler");
                        env.push_scope();
                        env.bind(ERROR_BINDING, Binding::Value(Value::String(e.to_string())));
                        let handled = self.eval_list(handler, env).await;
                        env.pop_scope();
                        handled?
                    }
                    _ => return Err(e),
                },
            };

            if result.is_empty() && statement.is_query() {
                if let Some(handler) = hints.catch.as_ref().and_then(|c| c.not_found.as_ref()) {
                    result = self.eval_list(handler, env).await?;
                }
            }

            bind_alias(hints, &result, env);
            env.set_last_result(result.clone());
            Ok(result)
        })
    }

    async fn eval_pattern(&self, statement: &Statement, env: &mut Environment) -> KyroResult<EvalResult> {
        let hints = &statement.hints;
        match &statement.pattern {
            Pattern::Crud(pattern) => match pattern.kind() {
                CrudKind::Create => {
                    let instance = self.create_crud(pattern, hints.upsert, env).await?;
                    if !hints.then.is_empty() {
                        self.run_then(pattern, hints, &instance, env).await?;
                    }
                    Ok(EvalResult::Instance(instance))
                }
                CrudKind::Query => {
                    let instances = self.query_crud(pattern, Vec::new(), env).await?;
                    self.shape(&pattern.entity, instances, hints, env).await
                }
                CrudKind::QueryUpdate => self.update_crud(pattern, env).await,
            },
            Pattern::Delete(pattern) => self.delete(pattern, env).await,
            Pattern::Purge(pattern) => self.purge(pattern, env).await,
            Pattern::ForEach(pattern) => self.for_each(pattern, env).await,
            Pattern::If(pattern) => self.if_else(pattern, env).await,
            Pattern::Expr(expr) => {
                let value = expr.eval(&*env)?;
                Ok(EvalResult::Value(value))
            }
        }
    }

    /// Fetches the resolver for `path`, passes the caller identity down and
    /// enlists it in the active transaction.
    async fn resolver_for(&self, path: &str, env: &mut Environment) -> KyroResult<Arc<dyn Resolver>> {
        let resolver = self.registry.get_resolver(path)?;
        if let Some(auth) = env.auth() {
            resolver.set_auth_info(auth);
        }
        if !env.resolver_environment().is_empty() {
            resolver.set_environment(env.resolver_environment());
        }

        let needs_enlist = env.transaction.as_ref().is_some_and(|t| !t.is_enlisted(&resolver));
        if needs_enlist {
            let txn = resolver.start_transaction().await?;
            tracing::debug!(resolver = resolver.name(), txn, "enlisted in transaction");
            if let Some(scope) = env.transaction.as_mut() {
                scope.enlist(Arc::clone(&resolver), txn);
            }
        }
        Ok(resolver)
    }

    async fn run_then(
        &self,
        pattern: &CrudPattern,
        hints: &Hints,
        instance: &Instance,
        env: &mut Environment,
    ) -> KyroResult<()> {
        env.push_scope();
        env.bind(pattern.entity.clone(), Binding::Instance(instance.clone()));
        if let Some(Alias::Name(name)) = &hints.alias {
            env.bind(name.clone(), Binding::Instance(instance.clone()));
        }
        let outcome = self.eval_list(&hints.then, env).await;
        env.pop_scope();
        outcome.map(|_| ())
    }

    // ---- create ----

    fn create_crud<'a>(
        &'a self,
        pattern: &'a CrudPattern,
        upsert: bool,
        env: &'a mut Environment,
    ) -> BoxFut<'a, Instance> {
        Box::pin(async move {
            let entity_type = self.schema.lookup_entity_type(&pattern.entity)?;
            let mut attributes = Attributes::new();
            for (name, expr) in pattern.assignments() {
                let value = expr.eval(&*env)?;
                attributes.insert(name.to_string(), value);
            }
            let instance = Instance::build(entity_type, attributes)?;
            let own_id = identity_of(&instance)?;

            // Every link the statement adds is checked before anything is written.
            let mut targets: Vec<Option<Vec<Instance>>> = Vec::with_capacity(pattern.relationships.len());
            let mut fan_out: HashMap<&str, usize> = HashMap::new();
            for sub in &pattern.relationships {
                let relationship = self.schema.lookup_relationship_type(&sub.relationship)?;
                let (from, _) = relationship.traversal(&pattern.entity, &sub.pattern.entity, sub.role.as_deref())?;
                let link_resolver = self.resolver_for(&relationship.name, env).await?;

                let found = if sub.pattern.kind() == CrudKind::Create {
                    if upsert {
                        self.check_end_free(&link_resolver, relationship, from, &own_id).await?;
                    }
                    None
                } else {
                    let found = self.query_crud(&sub.pattern, Vec::new(), env).await?;
                    for other in &found {
                        let other_id = identity_of(other)?;
                        let (first, second) = if from == 0 {
                            (&own_id, &other_id)
                        } else {
                            (&other_id, &own_id)
                        };
                        self.check_cardinality(&link_resolver, relationship, first, second).await?;
                    }
                    Some(found)
                };

                let links = fan_out.entry(relationship.name.as_str()).or_default();
                *links += found.as_ref().map_or(1, Vec::len);
                check_fan_out(relationship, from, &own_id, *links)?;
                targets.push(found);
            }

            let resolver = self.resolver_for(&pattern.entity, env).await?;
            let mut created = if upsert {
                self.upsert(&resolver, &instance).await?
            } else {
                resolver
                    .create_instance(&instance)
                    .await?
                    .require(resolver.name(), "create")?
            };

            for (sub, found) in pattern.relationships.iter().zip(targets) {
                let relationship = self.schema.lookup_relationship_type(&sub.relationship)?;
                let (from, _) = relationship.traversal(&pattern.entity, &sub.pattern.entity, sub.role.as_deref())?;
                let others = match found {
                    Some(found) => found,
                    None => vec![self.create_crud(&sub.pattern, false, env).await?],
                };
                for other in &others {
                    self.link(relationship, from, &created, other, env).await?;
                }
                created = created.with_related(relationship.name.clone(), others);
            }
            Ok(created)
        })
    }

    /// Create-or-replace by identity. Backends without an upsert get a
    /// query by identity followed by an update or a create.
    async fn upsert(&self, resolver: &Arc<dyn Resolver>, instance: &Instance) -> KyroResult<Instance> {
        if let Some(stored) = resolver.upsert_instance(instance).await?.into_option() {
            return Ok(stored);
        }

        let query = Query::new(instance.entity.clone()).filter(Filter::eq(instance.id_attribute.clone(), identity_of(instance)?));
        let existing = resolver
            .query_instances(&query, false)
            .await?
            .require(resolver.name(), "query")?;
        match existing.first() {
            Some(current) => {
                let mut changes = instance.attributes.clone();
                changes.remove(&instance.id_attribute);
                resolver
                    .update_instance(current, &changes)
                    .await?
                    .require(resolver.name(), "update")
            }
            None => resolver
                .create_instance(instance)
                .await?
                .require(resolver.name(), "create"),
        }
    }

    /// Persists a link record for `relationship` between `from` (sitting at
    /// end `from_end`) and `to`, enforcing the cardinality first.
    async fn link(
        &self,
        relationship: &RelationshipType,
        from_end: usize,
        from: &Instance,
        to: &Instance,
        env: &mut Environment,
    ) -> KyroResult<Instance> {
        let (first, second) = if from_end == 0 {
            (identity_of(from)?, identity_of(to)?)
        } else {
            (identity_of(to)?, identity_of(from)?)
        };
        let resolver = self.resolver_for(&relationship.name, env).await?;
        self.check_cardinality(&resolver, relationship, &first, &second).await?;

        let record = Instance::link(relationship, first, second);
        resolver
            .create_instance(&record)
            .await?
            .require(resolver.name(), "create")
    }

    async fn check_cardinality(
        &self,
        resolver: &Arc<dyn Resolver>,
        relationship: &RelationshipType,
        first: &Value,
        second: &Value,
    ) -> KyroResult<()> {
        let first_role = relationship.end(0).role.as_str();
        let second_role = relationship.end(1).role.as_str();

        // (role, id) pairs that must not already be linked.
        let mut taken: Vec<(&str, &Value)> = Vec::new();
        match relationship.cardinality {
            Cardinality::ManyMany => return Ok(()),
            Cardinality::OneMany => taken.push((second_role, second)),
            Cardinality::OneOne => {
                taken.push((first_role, first));
                taken.push((second_role, second));
                // On a self-reference an instance holding either role is linked.
                if relationship.is_self_referencing() {
                    taken.push((second_role, first));
                    taken.push((first_role, second));
                }
            }
        }

        for (role, id) in taken {
            let existing = links_with(resolver, relationship, role, id).await?;
            if !existing.is_empty() {
                return Err(cardinality_violation(relationship, format!("'{role}' {id} is already linked")));
            }
        }
        Ok(())
    }

    /// Fails when `id`, sitting at end `end`, already holds the only link
    /// that end allows.
    async fn check_end_free(
        &self,
        resolver: &Arc<dyn Resolver>,
        relationship: &RelationshipType,
        end: usize,
        id: &Value,
    ) -> KyroResult<()> {
        if !is_exclusive_end(relationship, end) {
            return Ok(());
        }
        let mut roles = vec![relationship.end(end).role.as_str()];
        if relationship.cardinality == Cardinality::OneOne && relationship.is_self_referencing() {
            roles.push(relationship.end(1 - end).role.as_str());
        }
        for role in roles {
            if !links_with(resolver, relationship, role, id).await?.is_empty() {
                return Err(cardinality_violation(relationship, format!("'{role}' {id} is already linked")));
            }
        }
        Ok(())
    }

    // ---- query ----

    /// Runs the filters of `pattern` (plus `extra`) and resolves its
    /// relationship sub-patterns. A parent with no match through a
    /// sub-pattern is dropped from the result.
    fn query_crud<'a>(
        &'a self,
        pattern: &'a CrudPattern,
        extra: Vec<Filter>,
        env: &'a mut Environment,
    ) -> BoxFut<'a, Vec<Instance>> {
        Box::pin(async move {
            let entity_type = self.schema.lookup_entity_type(&pattern.entity)?;
            let query_all = pattern.query_all() && extra.is_empty();

            let mut query = Query::new(pattern.entity.clone());
            for (name, op, expr) in pattern.filters() {
                if entity_type.get_attribute(name).is_none() {
                    return Err(SchemaError::UnknownAttribute {
                        entity: pattern.entity.clone(),
                        attribute: name.to_string(),
                    }
                    .into());
                }
                let value = expr.eval(&*env)?;
                query = query.filter(Filter::new(name, op, value));
            }
            for filter in extra {
                query = query.filter(filter);
            }

            let resolver = self.resolver_for(&pattern.entity, env).await?;
            let mut instances = resolver
                .query_instances(&query, query_all)
                .await?
                .require(resolver.name(), "query")?;

            for sub in &pattern.relationships {
                let relationship = self.schema.lookup_relationship_type(&sub.relationship)?;
                let (from, to) = relationship.traversal(&pattern.entity, &sub.pattern.entity, sub.role.as_deref())?;
                let target_id = self.schema.lookup_entity_type(&sub.pattern.entity)?.identity_attribute().to_string();
                let nested = as_query(&sub.pattern);
                let link_resolver = self.resolver_for(&relationship.name, env).await?;

                let mut kept = Vec::with_capacity(instances.len());
                for parent in instances {
                    let links = links_with(&link_resolver, relationship, &relationship.end(from).role, &identity_of(&parent)?).await?;
                    let reached: Vec<Value> = links
                        .iter()
                        .filter_map(|l| l.get(&relationship.end(to).role).cloned())
                        .collect();
                    if reached.is_empty() {
                        continue;
                    }
                    let related = self
                        .query_crud(&nested, vec![Filter::new(target_id.clone(), CompareOp::In, Value::List(reached))], env)
                        .await?;
                    if !related.is_empty() {
                        kept.push(parent.with_related(relationship.name.clone(), related));
                    }
                }
                instances = kept;
            }
            Ok(instances)
        })
    }

    /// Applies joins and result-set modifiers to a query result.
    async fn shape(
        &self,
        entity: &str,
        instances: Vec<Instance>,
        hints: &Hints,
        env: &mut Environment,
    ) -> KyroResult<EvalResult> {
        if !hints.has_modifiers() {
            return Ok(EvalResult::Instances(instances));
        }

        let mut joined = Vec::with_capacity(hints.joins.len());
        for join in &hints.joins {
            self.schema.lookup_entity_type(&join.entity)?;
            let resolver = self.resolver_for(&join.entity, env).await?;
            let right = resolver
                .query_instances(&Query::new(join.entity.clone()), true)
                .await?
                .require(resolver.name(), "query")?;
            joined.push(right);
        }

        let mut rows = modifiers::rows_from_instances(entity, &instances);
        let mut bound = vec![entity.to_string()];
        for (join, right) in hints.joins.iter().zip(&joined) {
            rows = modifiers::join(rows, join, right, &bound, &*env)?;
            bound.push(join.key().to_string());
        }
        modifiers::apply(entity, rows, hints, &*env)
    }

    async fn update_crud(&self, pattern: &CrudPattern, env: &mut Environment) -> KyroResult<EvalResult> {
        let entity_type = self.schema.lookup_entity_type(&pattern.entity)?;
        let mut changes = Attributes::new();
        for (name, expr) in pattern.assignments() {
            let value = expr.eval(&*env)?;
            changes.insert(name.to_string(), value);
        }
        let changes = Instance::check_update(entity_type, changes)?;

        let targets = self.query_crud(pattern, Vec::new(), env).await?;
        let resolver = self.resolver_for(&pattern.entity, env).await?;
        let mut updated = Vec::with_capacity(targets.len());
        for target in &targets {
            let next = resolver
                .update_instance(&target.detached(), &changes)
                .await?
                .require(resolver.name(), "update")?;
            updated.push(next);
        }
        Ok(EvalResult::Instances(updated))
    }

    // ---- delete / purge ----

    async fn delete(&self, pattern: &CrudPattern, env: &mut Environment) -> KyroResult<EvalResult> {
        let query = as_query(pattern);
        let targets = self.query_crud(&query, Vec::new(), env).await?;
        if !targets.is_empty() {
            let removed = self.delete_cascade(&pattern.entity, &targets, env).await?;
            tracing::debug!(entity = %pattern.entity, removed, "deleted instances");
        }
        Ok(EvalResult::Instances(targets))
    }

    /// Deletes `targets`, first deleting children through containment
    /// relationships and purging every link record that references them.
    fn delete_cascade<'a>(
        &'a self,
        entity: &'a str,
        targets: &'a [Instance],
        env: &'a mut Environment,
    ) -> BoxFut<'a, usize> {
        Box::pin(async move {
            let relationships: Vec<&RelationshipType> = self.schema.relationships_of(entity).collect();
            for relationship in relationships {
                let link_resolver = self.resolver_for(&relationship.name, env).await?;
                for (index, end) in relationship.ends().iter().enumerate() {
                    if end.entity != entity {
                        continue;
                    }
                    let mut links = Vec::new();
                    for target in targets {
                        links.extend(links_with(&link_resolver, relationship, &end.role, &identity_of(target)?).await?);
                    }
                    if links.is_empty() {
                        continue;
                    }

                    if relationship.is_containment() && index == 0 {
                        let child = relationship.end(1);
                        let child_ids: Vec<Value> = links.iter().filter_map(|l| l.get(&child.role).cloned()).collect();
                        let child_id_attr = self.schema.lookup_entity_type(&child.entity)?.identity_attribute().to_string();
                        let child_query = Query::new(child.entity.clone()).filter(Filter::new(
                            child_id_attr,
                            CompareOp::In,
                            Value::List(child_ids),
                        ));
                        let child_resolver = self.resolver_for(&child.entity, env).await?;
                        let children = child_resolver
                            .query_instances(&child_query, false)
                            .await?
                            .require(child_resolver.name(), "query")?;
                        if !children.is_empty() {
                            self.delete_cascade(&child.entity, &children, env).await?;
                        }
                    }

                    remove_links(&link_resolver, &links).await?;
                }
            }

            let resolver = self.resolver_for(entity, env).await?;
            resolver
                .delete_instances(targets, true)
                .await?
                .require(resolver.name(), "delete")
        })
    }

    async fn purge(&self, pattern: &PurgePattern, env: &mut Environment) -> KyroResult<EvalResult> {
        let relationship = self.schema.lookup_relationship_type(&pattern.relationship)?;

        let mut query = Query::new(relationship.name.clone());
        for end in &pattern.ends {
            let index = match end.role.as_deref() {
                Some(role) => relationship.end_index(role).ok_or_else(|| SchemaError::UnknownRole {
                    relationship: relationship.name.clone(),
                    role: role.to_string(),
                })?,
                None if relationship.is_self_referencing() => {
                    return Err(SchemaError::MissingRoleAlias {
                        relationship: relationship.name.clone(),
                    }
                    .into())
                }
                None => relationship
                    .ends()
                    .iter()
                    .position(|e| e.entity == end.pattern.entity)
                    .ok_or_else(|| SchemaError::InvalidTraversal {
                        relationship: relationship.name.clone(),
                        entity: end.pattern.entity.clone(),
                        reason: "not an end of the relationship".to_string(),
                    })?,
            };
            if relationship.end(index).entity != end.pattern.entity {
                return Err(SchemaError::InvalidTraversal {
                    relationship: relationship.name.clone(),
                    entity: end.pattern.entity.clone(),
                    reason: format!("role '{}' belongs to '{}'", relationship.end(index).role, relationship.end(index).entity),
                }
                .into());
            }

            let matched = self.query_crud(&as_query(&end.pattern), Vec::new(), env).await?;
            if matched.is_empty() {
                return Ok(EvalResult::Instances(Vec::new()));
            }
            let ids = matched.iter().map(identity_of).collect::<KyroResult<Vec<_>>>()?;
            query = query.filter(Filter::new(relationship.end(index).role.clone(), CompareOp::In, Value::List(ids)));
        }

        let resolver = self.resolver_for(&relationship.name, env).await?;
        let links = resolver
            .query_instances(&query, pattern.ends.is_empty())
            .await?
            .require(resolver.name(), "query")?;
        if !links.is_empty() {
            remove_links(&resolver, &links).await?;
        }
        Ok(EvalResult::Instances(links))
    }

    // ---- control flow ----

    async fn for_each(&self, pattern: &ForEachPattern, env: &mut Environment) -> KyroResult<EvalResult> {
        let source = self.eval_statement(&pattern.source, env).await?;
        let mut collected = Vec::new();
        for item in source.to_items() {
            env.push_scope();
            env.bind(pattern.variable.clone(), item);
            let outcome = self.eval_list(&pattern.body, env).await;
            env.pop_scope();
            collected.extend(outcome?.into_instances());
        }
        Ok(EvalResult::Instances(collected))
    }

    async fn if_else(&self, pattern: &IfPattern, env: &mut Environment) -> KyroResult<EvalResult> {
        for (condition, body) in &pattern.branches {
            let holds = condition.eval(&*env)?.is_truthy();
            if holds {
                return self.eval_list(body, env).await;
            }
        }
        self.eval_list(&pattern.otherwise, env).await
    }
}

/// True when an instance at `end` may take part in at most one link.
fn is_exclusive_end(relationship: &RelationshipType, end: usize) -> bool {
    match relationship.cardinality {
        Cardinality::OneOne => true,
        Cardinality::OneMany => end == 1,
        Cardinality::ManyMany => false,
    }
}

/// Rejects a statement that would give `id` more than one link through an
/// exclusive end.
fn check_fan_out(relationship: &RelationshipType, end: usize, id: &Value, links: usize) -> KyroResult<()> {
    if links > 1 && is_exclusive_end(relationship, end) {
        let role = &relationship.end(end).role;
        return Err(cardinality_violation(
            relationship,
            format!("'{role}' {id} would be linked {links} times"),
        ));
    }
    Ok(())
}

fn cardinality_violation(relationship: &RelationshipType, reason: String) -> KyroError {
    KyroError::CardinalityViolation {
        relationship: relationship.name.clone(),
        cardinality: relationship.cardinality.to_string(),
        reason,
    }
}

/// Link records of `relationship` whose `role` end is `id`.
async fn links_with(
    resolver: &Arc<dyn Resolver>,
    relationship: &RelationshipType,
    role: &str,
    id: &Value,
) -> KyroResult<Vec<Instance>> {
    let query = Query::new(relationship.name.clone()).filter(Filter::eq(role, id.clone()));
    resolver
        .query_instances(&query, false)
        .await?
        .require(resolver.name(), "query")
}

/// Purges link records, deleting them when the backend has no purge.
async fn remove_links(resolver: &Arc<dyn Resolver>, links: &[Instance]) -> KyroResult<usize> {
    match resolver.purge_instances(links).await?.into_option() {
        Some(removed) => Ok(removed),
        None => resolver
            .delete_instances(links, false)
            .await?
            .require(resolver.name(), "purge"),
    }
}

fn bind_alias(hints: &Hints, result: &EvalResult, env: &mut Environment) {
    match &hints.alias {
        Some(Alias::Name(name)) => env.bind(name.clone(), result.to_binding()),
        Some(Alias::Destructure(names)) => {
            let items = result.to_items();
            for (i, name) in names.iter().enumerate() {
                if name == SKIP_BINDING {
                    continue;
                }
                let binding = items.get(i).cloned().unwrap_or(Binding::Value(Value::Null));
                env.bind(name.clone(), binding);
            }
        }
        None => {}
    }
}
