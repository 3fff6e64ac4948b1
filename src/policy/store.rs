//! Hot-swappable connection policy cache keyed by resolver name.

use std::collections::HashMap;
use std::sync::RwLock;

use crate::error::{KyroError, KyroResult};

use super::config::ConnectionPolicy;

fn lock_err() -> KyroError {
    KyroError::internal("policy store lock poisoned")
}

/// Connection policies by resolver name.
#[derive(Debug, Default)]
pub struct PolicyStore {
    policies: RwLock<HashMap<String, ConnectionPolicy>>,
}

impl PolicyStore {
    /// Creates an empty store.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers (or replaces) the policy for `resolver_name`.
    pub fn register(&self, resolver_name: &str, policy: ConnectionPolicy) -> KyroResult<()> {
        policy.validate()?;
        self.policies
            .write()
            .map_err(|_| lock_err())?
            .insert(resolver_name.to_string(), policy);
        Ok(())
    }

    /// The policy for `resolver_name`, if one is registered.
    pub fn get(&self, resolver_name: &str) -> KyroResult<Option<ConnectionPolicy>> {
        Ok(self.policies.read().map_err(|_| lock_err())?.get(resolver_name).copied())
    }

    /// Removes and returns the policy for `resolver_name`.
    pub fn remove(&self, resolver_name: &str) -> KyroResult<Option<ConnectionPolicy>> {
        Ok(self.policies.write().map_err(|_| lock_err())?.remove(resolver_name))
    }

    /// Drops every policy.
    pub fn reset(&self) -> KyroResult<()> {
        self.policies.write().map_err(|_| lock_err())?.clear();
        Ok(())
    }

    /// Number of registered policies.
    pub fn len(&self) -> KyroResult<usize> {
        Ok(self.policies.read().map_err(|_| lock_err())?.len())
    }

    /// Returns true when no policy is registered.
    pub fn is_empty(&self) -> KyroResult<bool> {
        Ok(self.len()? == 0)
    }
}
