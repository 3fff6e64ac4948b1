//! Runtime configuration.
//!
//! A [`RuntimeConfig`] is usually read from JSON metadata:
//!
//! ```json
//! {
//!   "defaultResolver": "memory",
//!   "policyRefreshIntervalSecs": 300,
//!   "policies": { "sql": { "retry": { "maxAttempts": 5 } } },
//!   "bindings": { "Employee": { "resolver": "sql", "sharing": "isolated" } }
//! }
//! ```
//!
//! Every key is optional.

use std::collections::{BTreeMap, HashMap};
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::{KyroError, KyroResult};
use crate::policy::{ConnectionPolicy, StaticPolicySource, DEFAULT_REFRESH_INTERVAL};
use crate::resolver::{ResolverBinding, DEFAULT_RESOLVER};

/// Wiring for a [`crate::runtime::Runtime`].
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct RuntimeConfig {
    /// Resolver used for paths without a binding.
    pub default_resolver: String,

    /// Period of the background policy refresh.
    pub policy_refresh_interval_secs: u64,

    /// Connection policies keyed by resolver name.
    pub policies: BTreeMap<String, ConnectionPolicy>,

    /// Entity or relationship path to resolver binding.
    pub bindings: BTreeMap<String, ResolverBinding>,
}

impl Default for RuntimeConfig {
    fn default() -> Self {
        Self {
            default_resolver: DEFAULT_RESOLVER.to_string(),
            policy_refresh_interval_secs: DEFAULT_REFRESH_INTERVAL.as_secs(),
            policies: BTreeMap::new(),
            bindings: BTreeMap::new(),
        }
    }
}

impl RuntimeConfig {
    /// Parses and validates a JSON document.
    ///
    /// # Errors
    /// `KyroError::Config` for malformed JSON or invalid values.
    pub fn from_json_str(json: &str) -> KyroResult<Self> {
        let config: Self =
            serde_json::from_str(json).map_err(|e| KyroError::config(format!("invalid runtime config: {e}")))?;
        config.validate()?;
        Ok(config)
    }

    /// Same as [`Self::from_json_str`] for an already parsed value.
    pub fn from_value(value: serde_json::Value) -> KyroResult<Self> {
        let config: Self =
            serde_json::from_value(value).map_err(|e| KyroError::config(format!("invalid runtime config: {e}")))?;
        config.validate()?;
        Ok(config)
    }

    /// # Errors
    /// `KyroError::Config` naming the first offending field.
    pub fn validate(&self) -> KyroResult<()> {
        if self.default_resolver.trim().is_empty() {
            return Err(KyroError::config("defaultResolver cannot be empty"));
        }
        if self.policy_refresh_interval_secs == 0 {
            return Err(KyroError::config("policyRefreshIntervalSecs must be greater than zero"));
        }
        for (name, policy) in &self.policies {
            if name.trim().is_empty() {
                return Err(KyroError::config("policy resolver names cannot be empty"));
            }
            policy
                .validate()
                .map_err(|e| KyroError::config(format!("policies.{name}: {e}")))?;
        }
        for (path, binding) in &self.bindings {
            if path.trim().is_empty() || binding.resolver.trim().is_empty() {
                return Err(KyroError::config(format!(
                    "binding '{path}' needs a non-empty path and resolver name"
                )));
            }
            if let Some(policy) = &binding.policy {
                policy
                    .validate()
                    .map_err(|e| KyroError::config(format!("bindings.{path}.policy: {e}")))?;
            }
        }
        Ok(())
    }

    /// Period between policy refreshes.
    #[must_use]
    pub fn refresh_interval(&self) -> Duration {
        Duration::from_secs(self.policy_refresh_interval_secs)
    }

    /// A refresh source serving this config's policies.
    #[must_use]
    pub fn policy_source(&self) -> StaticPolicySource {
        let policies: HashMap<String, ConnectionPolicy> =
            self.policies.iter().map(|(k, v)| (k.clone(), *v)).collect();
        StaticPolicySource::new(policies)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::resolver::Sharing;

    #[test]
    fn test_empty_document_uses_defaults() {
        let config = RuntimeConfig::from_json_str("{}").unwrap();
        assert_eq!(config, RuntimeConfig::default());
        assert_eq!(config.refresh_interval(), Duration::from_secs(300));
    }

    #[test]
    fn test_full_document() {
        let config = RuntimeConfig::from_json_str(
            r#"{
                "defaultResolver": "sql",
                "policyRefreshIntervalSecs": 60,
                "policies": { "sql": { "retry": { "maxAttempts": 5 } } },
                "bindings": { "Employee": { "resolver": "memory", "sharing": "isolated" } }
            }"#,
        )
        .unwrap();
        assert_eq!(config.default_resolver, "sql");
        assert_eq!(config.policies["sql"].retry.map(|r| r.max_attempts), Some(5));
        assert_eq!(config.bindings["Employee"].sharing, Sharing::Isolated);
    }

    #[test]
    fn test_invalid_values_rejected() {
        let err = RuntimeConfig::from_json_str(r#"{"policyRefreshIntervalSecs": 0}"#).unwrap_err();
        assert!(matches!(err, KyroError::Config { .. }));

        let err = RuntimeConfig::from_json_str(r#"{"policies": {"sql": {"retry": {"maxAttempts": 0}}}}"#).unwrap_err();
        assert!(err.to_string().contains("policies.sql"));

        assert!(RuntimeConfig::from_json_str("not json").is_err());
    }
}
