//! Wiring of schema, resolver registry, policy engine and evaluator.

use std::sync::Arc;

use crate::config::RuntimeConfig;
use crate::error::KyroResult;
use crate::eval::{Environment, EvalResult, Evaluator, Statement};
use crate::policy::{PolicyEngine, PolicyRefresher, PolicySource};
use crate::resolver::{Resolver, ResolverRegistry};
use crate::schema::Schema;

/// One configured store: everything a workflow engine needs to run
/// statements against a frozen schema.
///
/// The policy engine is shared between the registry (which wraps every
/// resolver with it) and the refresher (which updates its policy store).
#[derive(Debug)]
pub struct Runtime {
    config: RuntimeConfig,
    engine: PolicyEngine,
    registry: Arc<ResolverRegistry>,
    evaluator: Evaluator,
    refresher: PolicyRefresher,
}

impl Runtime {
    /// A runtime with the default configuration (everything in memory).
    #[must_use]
    pub fn new(schema: Schema) -> Self {
        Self::assemble(Arc::new(schema), RuntimeConfig::default())
    }

    /// # Errors
    /// `KyroError::Config` when the configuration does not validate.
    pub fn from_config(schema: Schema, config: RuntimeConfig) -> KyroResult<Self> {
        config.validate()?;
        let runtime = Self::assemble(Arc::new(schema), config);
        runtime.apply_config()?;
        Ok(runtime)
    }

    fn assemble(schema: Arc<Schema>, config: RuntimeConfig) -> Self {
        let engine = PolicyEngine::new();
        let registry = Arc::new(ResolverRegistry::new(engine.clone()));
        let evaluator = Evaluator::new(schema, Arc::clone(&registry));
        let refresher = PolicyRefresher::new(Arc::clone(engine.policy_store()));
        Self {
            config,
            engine,
            registry,
            evaluator,
            refresher,
        }
    }

    fn apply_config(&self) -> KyroResult<()> {
        self.registry.set_default_resolver(&self.config.default_resolver)?;
        for (name, policy) in &self.config.policies {
            self.engine.register_connection_policy(name, *policy)?;
        }
        for (path, binding) in &self.config.bindings {
            self.registry.bind(path, binding.clone())?;
        }
        tracing::debug!(
            default_resolver = %self.config.default_resolver,
            policies = self.config.policies.len(),
            bindings = self.config.bindings.len(),
            "runtime configured"
        );
        Ok(())
    }

    /// The validated configuration this runtime was built from.
    #[must_use]
    pub fn config(&self) -> &RuntimeConfig {
        &self.config
    }

    /// Statement evaluator over the runtime's schema and registry.
    #[must_use]
    pub fn evaluator(&self) -> &Evaluator {
        &self.evaluator
    }

    /// Resolver registry, for bindings and direct backend access.
    #[must_use]
    pub fn registry(&self) -> &Arc<ResolverRegistry> {
        &self.registry
    }

    /// Engine wrapping every resolver call made by this runtime.
    #[must_use]
    pub fn policy_engine(&self) -> &PolicyEngine {
        &self.engine
    }

    /// Registers a backend factory under `name`.
    pub fn register_resolver<F>(&self, name: &str, factory: F) -> KyroResult<()>
    where
        F: Fn(&str) -> KyroResult<Arc<dyn Resolver>> + Send + Sync + 'static,
    {
        self.registry.register_resolver(name, factory)
    }

    /// Runs one statement. See [`Evaluator::evaluate`].
    pub async fn evaluate(&self, statement: &Statement, env: &mut Environment) -> KyroResult<EvalResult> {
        self.evaluator.evaluate(statement, env).await
    }

    /// Runs statements in order. See [`Evaluator::evaluate_all`].
    pub async fn evaluate_all(&self, statements: &[Statement], env: &mut Environment) -> KyroResult<EvalResult> {
        self.evaluator.evaluate_all(statements, env).await
    }

    /// Runs statements as one unit. See [`Evaluator::evaluate_in_transaction`].
    pub async fn evaluate_in_transaction(
        &self,
        statements: &[Statement],
        env: &mut Environment,
    ) -> KyroResult<EvalResult> {
        self.evaluator.evaluate_in_transaction(statements, env).await
    }

    /// Starts (or restarts) polling `source` at the configured interval.
    ///
    /// # Errors
    /// `KyroError::Config` outside a Tokio runtime.
    pub fn start_policy_refresh(&self, source: Arc<dyn PolicySource>) -> KyroResult<()> {
        self.refresher.start(source, self.config.refresh_interval())
    }

    /// Returns true if a refresh timer was running.
    pub fn stop_policy_refresh(&self) -> KyroResult<bool> {
        self.refresher.stop()
    }

    /// Returns true while a policy refresh timer runs.
    #[must_use]
    pub fn is_refreshing(&self) -> bool {
        self.refresher.is_running()
    }

    /// Drops resolver instances, custom factories, cached policies and
    /// breaker state, then re-applies the configuration.
    pub fn reset(&self) -> KyroResult<()> {
        self.registry.reset()?;
        self.engine.reset_policy_cache()?;
        self.engine.reset_all_circuit_breaker_states()?;
        self.apply_config()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::eval::{CrudPattern, Expr};
    use crate::policy::{ConnectionPolicy, RetryPolicy};
    use crate::resolver::{InMemoryResolver, ResolverBinding};
    use crate::schema::{Attribute, AttributeType, EntityType};

    fn schema() -> Schema {
        let mut builder = Schema::builder();
        builder
            .define_entity(EntityType::new("Note").attribute(Attribute::new("text", AttributeType::String)))
            .unwrap();
        builder.build()
    }

    #[tokio::test]
    async fn test_config_bindings_and_policies_applied() {
        let mut config = RuntimeConfig::default();
        config
            .policies
            .insert("notes".to_string(), ConnectionPolicy::default().with_retry(RetryPolicy::default()));
        config.bindings.insert("Note".to_string(), ResolverBinding::new("notes"));

        let runtime = Runtime::from_config(schema(), config).unwrap();
        runtime
            .register_resolver("notes", |name| -> KyroResult<Arc<dyn Resolver>> {
                Ok(Arc::new(InMemoryResolver::with_name(name)))
            })
            .unwrap();

        let mut env = Environment::new();
        let created = runtime
            .evaluate(&Statement::crud(CrudPattern::new("Note").set("text", Expr::lit("hi"))), &mut env)
            .await
            .unwrap();
        assert_eq!(created.len(), 1);
        assert_eq!(runtime.registry().get_resolver("Note").unwrap().name(), "notes");
        assert!(runtime.policy_engine().get_connection_policy("notes").unwrap().is_some());
    }

    #[tokio::test]
    async fn test_reset_reapplies_config() {
        let mut config = RuntimeConfig::default();
        config.policies.insert("memory".to_string(), ConnectionPolicy::with_defaults());
        let runtime = Runtime::from_config(schema(), config).unwrap();

        runtime.policy_engine().reset_policy_cache().unwrap();
        assert!(runtime.policy_engine().get_connection_policy("memory").unwrap().is_none());
        runtime.reset().unwrap();
        assert!(runtime.policy_engine().get_connection_policy("memory").unwrap().is_some());
    }

    #[tokio::test]
    async fn test_refresh_lifecycle() {
        let runtime = Runtime::new(schema());
        let source = Arc::new(runtime.config().policy_source());
        runtime.start_policy_refresh(source).unwrap();
        assert!(runtime.is_refreshing());
        assert!(runtime.stop_policy_refresh().unwrap());
        assert!(!runtime.is_refreshing());
    }
}
