//! Path → resolver registry.

use std::collections::HashMap;
use std::fmt;
use std::sync::{Arc, RwLock};

use serde::{Deserialize, Serialize};

use crate::error::{KyroError, KyroResult, ResolverError};
use crate::policy::{ConnectionPolicy, PolicyEngine};

use super::memory::InMemoryResolver;
use super::policy::PolicyResolver;
use super::traits::{Resolver, ResolverOutcome};
use super::DEFAULT_RESOLVER;

/// Subscribe retries after the first attempt fails.
pub const SUBSCRIBE_MAX_RETRIES: u32 = 3;

/// Builds a resolver instance; receives the resolver name.
pub type ResolverFactory = Arc<dyn Fn(&str) -> KyroResult<Arc<dyn Resolver>> + Send + Sync>;

/// Whether paths bound to the same resolver share one instance.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Sharing {
    /// One instance per resolver name (pooled backend).
    #[default]
    Pooled,
    /// One instance per entity/relationship path.
    Isolated,
}

/// Which resolver serves a path, and how.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ResolverBinding {
    /// Registered resolver name.
    pub resolver: String,
    /// Pooled or per-path instance.
    #[serde(default)]
    pub sharing: Sharing,
    /// Policy for this path, overriding the cached one.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub policy: Option<ConnectionPolicy>,
}

impl ResolverBinding {
    /// Pooled binding with no policy override.
    #[must_use]
    pub fn new(resolver: impl Into<String>) -> Self {
        Self {
            resolver: resolver.into(),
            sharing: Sharing::Pooled,
            policy: None,
        }
    }

    /// Gives the path its own instance.
    #[must_use]
    pub fn isolated(mut self) -> Self {
        self.sharing = Sharing::Isolated;
        self
    }

    /// Applies `policy` to calls on this path.
    #[must_use]
    pub fn with_policy(mut self, policy: ConnectionPolicy) -> Self {
        self.policy = Some(policy);
        self
    }

    fn memo_key(&self, path: &str) -> String {
        match self.sharing {
            Sharing::Pooled => format!("pool:{}", self.resolver),
            Sharing::Isolated => format!("path:{path}"),
        }
    }
}

struct RegistryState {
    default_resolver: String,
    factories: HashMap<String, ResolverFactory>,
    bindings: HashMap<String, ResolverBinding>,
    instances: HashMap<String, Arc<dyn Resolver>>,
}

impl RegistryState {
    fn fresh() -> Self {
        let memory: ResolverFactory = Arc::new(|name: &str| -> KyroResult<Arc<dyn Resolver>> {
            Ok(Arc::new(InMemoryResolver::with_name(name)))
        });
        let mut factories = HashMap::new();
        factories.insert(DEFAULT_RESOLVER.to_string(), memory);
        Self {
            default_resolver: DEFAULT_RESOLVER.to_string(),
            factories,
            bindings: HashMap::new(),
            instances: HashMap::new(),
        }
    }
}

fn lock_err() -> KyroError {
    KyroError::internal("resolver registry lock poisoned")
}

/// Maps entity and relationship paths to resolver instances.
///
/// Instances are created lazily by their factory, memoized, and always
/// wrapped in a [`PolicyResolver`] so that policies registered later still
/// apply. The `memory` factory is always available.
pub struct ResolverRegistry {
    engine: PolicyEngine,
    state: RwLock<RegistryState>,
}

impl fmt::Debug for ResolverRegistry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut d = f.debug_struct("ResolverRegistry");
        if let Ok(state) = self.state.read() {
            d.field("default_resolver", &state.default_resolver)
                .field("bindings", &state.bindings)
                .field("instances", &state.instances.len());
        }
        d.finish_non_exhaustive()
    }
}

impl Default for ResolverRegistry {
    fn default() -> Self {
        Self::new(PolicyEngine::new())
    }
}

impl ResolverRegistry {
    /// Creates a registry with the built-in `memory` resolver as default.
    #[must_use]
    pub fn new(engine: PolicyEngine) -> Self {
        Self {
            engine,
            state: RwLock::new(RegistryState::fresh()),
        }
    }

    /// Engine wrapping every resolver this registry builds.
    #[must_use]
    pub fn policy_engine(&self) -> &PolicyEngine {
        &self.engine
    }

    /// Registers a factory under `name`, dropping any instance it built before.
    pub fn register_resolver<F>(&self, name: &str, factory: F) -> KyroResult<()>
    where
        F: Fn(&str) -> KyroResult<Arc<dyn Resolver>> + Send + Sync + 'static,
    {
        let mut state = self.state.write().map_err(|_| lock_err())?;
        state.factories.insert(name.to_string(), Arc::new(factory));
        let bound_paths: Vec<String> = state
            .bindings
            .iter()
            .filter(|(_, b)| b.resolver == name)
            .map(|(p, _)| format!("path:{p}"))
            .collect();
        state.instances.remove(&format!("pool:{name}"));
        for key in bound_paths {
            state.instances.remove(&key);
        }
        Ok(())
    }

    /// Binds `path` to the resolver registered as `name`.
    pub fn set_resolver(&self, path: &str, name: &str) -> KyroResult<()> {
        self.bind(path, ResolverBinding::new(name))
    }

    /// Binds `path` with explicit sharing and policy.
    ///
    /// # Errors
    /// `KyroError::Config` for an invalid policy.
    pub fn bind(&self, path: &str, binding: ResolverBinding) -> KyroResult<()> {
        if let Some(policy) = &binding.policy {
            policy.validate()?;
        }
        let mut state = self.state.write().map_err(|_| lock_err())?;
        state.instances.remove(&format!("path:{path}"));
        state.bindings.insert(path.to_string(), binding);
        Ok(())
    }

    /// Resolver used for paths without a binding.
    pub fn set_default_resolver(&self, name: &str) -> KyroResult<()> {
        self.state.write().map_err(|_| lock_err())?.default_resolver = name.to_string();
        Ok(())
    }

    /// Name used for paths without a binding.
    #[must_use]
    pub fn default_resolver(&self) -> String {
        self.state
            .read()
            .map(|s| s.default_resolver.clone())
            .unwrap_or_else(|_| DEFAULT_RESOLVER.to_string())
    }

    /// The binding that applies to `path`, explicit or default.
    pub fn binding_for(&self, path: &str) -> KyroResult<ResolverBinding> {
        let state = self.state.read().map_err(|_| lock_err())?;
        Ok(state
            .bindings
            .get(path)
            .cloned()
            .unwrap_or_else(|| ResolverBinding::new(state.default_resolver.clone())))
    }

    /// Returns the resolver for `path`, instantiating it on first use.
    ///
    /// A newly built resolver is activated (`subscribe`) in the background
    /// when called inside a Tokio runtime.
    ///
    /// # Errors
    /// `ResolverError::UnknownResolver` when no factory has the bound name.
    pub fn get_resolver(&self, path: &str) -> KyroResult<Arc<dyn Resolver>> {
        let binding = self.binding_for(path)?;
        let key = binding.memo_key(path);

        let factory = {
            let state = self.state.read().map_err(|_| lock_err())?;
            if let Some(existing) = state.instances.get(&key) {
                return Ok(Arc::clone(existing));
            }
            state
                .factories
                .get(&binding.resolver)
                .cloned()
                .ok_or_else(|| ResolverError::UnknownResolver(binding.resolver.clone()))?
        };

        let inner = factory(&binding.resolver)?;
        let wrapped: Arc<dyn Resolver> = Arc::new(PolicyResolver::new(inner, binding.policy, self.engine.clone()));

        let (resolver, created) = {
            let mut state = self.state.write().map_err(|_| lock_err())?;
            match state.instances.get(&key) {
                Some(existing) => (Arc::clone(existing), false),
                None => {
                    state.instances.insert(key, Arc::clone(&wrapped));
                    (wrapped, true)
                }
            }
        };

        if created {
            tracing::debug!(path, resolver = %binding.resolver, "resolver instantiated");
            if let Ok(handle) = tokio::runtime::Handle::try_current() {
                let r = Arc::clone(&resolver);
                handle.spawn(async move {
                    activate(r.as_ref()).await;
                });
            }
        }
        Ok(resolver)
    }

    /// Drops all bindings, instances and custom factories.
    pub fn reset(&self) -> KyroResult<()> {
        *self.state.write().map_err(|_| lock_err())? = RegistryState::fresh();
        Ok(())
    }
}

/// Subscribes `resolver`, retrying up to [`SUBSCRIBE_MAX_RETRIES`] times
/// without delay. Returns false when every attempt failed.
pub async fn activate(resolver: &dyn Resolver) -> bool {
    for attempt in 0..=SUBSCRIBE_MAX_RETRIES {
        match resolver.subscribe().await {
            Ok(ResolverOutcome::Done(())) => {
                tracing::debug!(resolver = resolver.name(), attempt, "resolver subscribed");
                return true;
            }
            Ok(ResolverOutcome::NotImplemented) => return true,
            Err(e) => {
                tracing::debug!(resolver = resolver.name(), attempt, error = %e, "subscribe failed");
            }
        }
    }
    tracing::warn!(
        resolver = resolver.name(),
        retries = SUBSCRIBE_MAX_RETRIES,
        "subscription abandoned"
    );
    false
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU32, Ordering};

    use async_trait::async_trait;

    struct Unsubscribable {
        attempts: AtomicU32,
    }

    #[async_trait]
    impl Resolver for Unsubscribable {
        fn name(&self) -> &str {
            "broken"
        }

        async fn subscribe(&self) -> KyroResult<ResolverOutcome<()>> {
            self.attempts.fetch_add(1, Ordering::SeqCst);
            Err(ResolverError::Connection("no broker".to_string()).into())
        }
    }

    fn ptr(r: &Arc<dyn Resolver>) -> *const () {
        Arc::as_ptr(r).cast::<()>()
    }

    #[test]
    fn test_unbound_path_uses_default() {
        let registry = ResolverRegistry::default();
        let r = registry.get_resolver("Employee").unwrap();
        assert_eq!(r.name(), "memory");
        assert_eq!(ptr(&r), ptr(&registry.get_resolver("Dept").unwrap()));
    }

    #[test]
    fn test_isolated_binding_gets_own_instance() {
        let registry = ResolverRegistry::default();
        registry.bind("Audit", ResolverBinding::new("memory").isolated()).unwrap();
        let pooled = registry.get_resolver("Employee").unwrap();
        let isolated = registry.get_resolver("Audit").unwrap();
        assert_ne!(ptr(&pooled), ptr(&isolated));
        assert_eq!(ptr(&isolated), ptr(&registry.get_resolver("Audit").unwrap()));
    }

    #[test]
    fn test_unknown_resolver_and_reset() {
        let registry = ResolverRegistry::default();
        registry.set_resolver("Employee", "sql").unwrap();
        let err = registry.get_resolver("Employee").err().unwrap();
        assert!(matches!(err, KyroError::Resolver(ResolverError::UnknownResolver(_))));

        registry
            .register_resolver("sql", |name| Ok(Arc::new(InMemoryResolver::with_name(name)) as Arc<dyn Resolver>))
            .unwrap();
        assert_eq!(registry.get_resolver("Employee").unwrap().name(), "sql");

        registry.reset().unwrap();
        assert_eq!(registry.get_resolver("Employee").unwrap().name(), "memory");
    }

    #[tokio::test]
    async fn test_activation_gives_up_after_retries() {
        let r = Unsubscribable {
            attempts: AtomicU32::new(0),
        };
        assert!(!activate(&r).await);
        assert_eq!(r.attempts.load(Ordering::SeqCst), SUBSCRIBE_MAX_RETRIES + 1);
    }

    #[tokio::test]
    async fn test_instantiation_subscribes_once() {
        let registry = ResolverRegistry::default();
        let shared = Arc::new(InMemoryResolver::with_name("tracked"));
        let handle = Arc::clone(&shared);
        registry
            .register_resolver("tracked", move |_| Ok(Arc::clone(&handle) as Arc<dyn Resolver>))
            .unwrap();
        registry.set_resolver("Employee", "tracked").unwrap();
        registry.set_resolver("Dept", "tracked").unwrap();

        registry.get_resolver("Employee").unwrap();
        registry.get_resolver("Dept").unwrap();
        for _ in 0..10 {
            if shared.subscription_count() > 0 {
                break;
            }
            tokio::task::yield_now().await;
        }
        assert_eq!(shared.subscription_count(), 1);
    }
}
