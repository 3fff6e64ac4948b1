//! Error types for kyrostore.
//!
//! All errors are strongly typed using thiserror. Schema and cardinality
//! errors describe configuration mistakes and are never retried; timeout and
//! backend errors are transient and go through the retry policy.

use thiserror::Error;

/// Errors raised while defining or looking up entity/relationship schemas.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum SchemaError {
    /// Lookup of an entity type that was never defined.
    #[error("Entity type '{name}' is not defined")]
    UndefinedEntity {
        /// Requested entity name.
        name: String,
    },

    /// Lookup of a relationship that was never defined.
    #[error("Relationship '{name}' is not defined")]
    UndefinedRelationship {
        /// Requested relationship name.
        name: String,
    },

    /// Entity and relationship names share one namespace.
    #[error("'{name}' is already defined")]
    DuplicateDefinition {
        /// The clashing name.
        name: String,
    },

    /// Blank entity, attribute or role name.
    #[error("Name cannot be empty ({context})")]
    EmptyName {
        /// What was being named.
        context: &'static str,
    },

    /// More than one attribute flagged as identity.
    #[error("Entity '{entity}' declares more than one identity attribute")]
    MultipleIdentities {
        /// Offending entity.
        entity: String,
    },

    /// Attribute not declared on the entity.
    #[error("Attribute '{attribute}' is not defined on '{entity}'")]
    UnknownAttribute {
        /// Entity that was searched.
        entity: String,
        /// Missing attribute.
        attribute: String,
    },

    /// A self-referencing relationship used or defined without roles.
    #[error("Self-referencing relationship '{relationship}' requires distinct role aliases on both ends")]
    MissingRoleAlias {
        /// Offending relationship.
        relationship: String,
    },

    /// Role alias that names neither end.
    #[error("Relationship '{relationship}' has no end with role '{role}'")]
    UnknownRole {
        /// Relationship that was searched.
        relationship: String,
        /// Unmatched role.
        role: String,
    },

    /// The entity does not sit at the end the traversal starts from.
    #[error("Relationship '{relationship}' cannot be traversed from '{entity}': {reason}")]
    InvalidTraversal {
        /// Traversed relationship.
        relationship: String,
        /// Entity the traversal started from.
        entity: String,
        /// Why the ends do not line up.
        reason: String,
    },

    /// Cardinality that the relationship kind does not allow.
    #[error("Relationship '{relationship}' has an invalid cardinality: {reason}")]
    InvalidCardinality {
        /// Offending relationship.
        relationship: String,
        /// Why it was rejected.
        reason: String,
    },
}

/// Errors reported by resolver backends.
///
/// The policy engine passes these through unchanged so callers can match on
/// the backend's own failure.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ResolverError {
    /// Record not found.
    #[error("Record not found: {0}")]
    NotFound(String),

    /// Key already exists.
    #[error("Duplicate key: {0}")]
    DuplicateKey(String),

    /// Backend error.
    #[error("Resolver backend error: {0}")]
    Backend(String),

    /// Connection failed.
    #[error("Connection error: {0}")]
    Connection(String),

    /// Serialization failed.
    #[error("Serialization error: {0}")]
    Serialization(String),

    /// No factory registered under this name.
    #[error("Unknown resolver: {0}")]
    UnknownResolver(String),

    /// Commit/rollback for a transaction the backend does not know.
    #[error("Transaction {0} is not active")]
    UnknownTransaction(u64),
}

impl ResolverError {
    /// Returns true for failures that may succeed when attempted again.
    ///
    /// A duplicate key stays a duplicate and an unregistered resolver name
    /// stays unregistered; every other backend failure is worth a retry.
    #[must_use]
    pub const fn is_transient(&self) -> bool {
        !matches!(self, Self::DuplicateKey(_) | Self::UnknownResolver(_))
    }
}

/// Errors raised by the pattern evaluator itself.
#[derive(Debug, Clone, PartialEq, Error)]
pub enum EvalError {
    /// Alias or `Entity.attr` path with nothing bound to it.
    #[error("Reference '{name}' is not bound")]
    UnboundReference {
        /// The unresolved path.
        name: String,
    },

    /// Value of the wrong type for an attribute or operator.
    #[error("Type mismatch for '{context}': expected {expected}, found {actual}")]
    TypeMismatch {
        /// Attribute or operator being checked.
        context: String,
        /// Type that was required.
        expected: String,
        /// Type that was supplied.
        actual: String,
    },

    /// Required attribute with no value and no default.
    #[error("Attribute '{attribute}' of '{entity}' is required")]
    MissingAttribute {
        /// Entity being built.
        entity: String,
        /// The missing attribute.
        attribute: String,
    },

    /// The resolver does not offer the capability the pattern needs.
    #[error("Resolver '{resolver}' does not implement {capability}")]
    NotImplemented {
        /// Resolver name.
        resolver: String,
        /// Capability such as `create` or `query`.
        capability: &'static str,
    },

    /// Integer or float division by zero.
    #[error("Division by zero")]
    DivisionByZero,

    /// Statement shape the evaluator cannot run.
    #[error("Invalid pattern: {reason}")]
    InvalidPattern {
        /// What is wrong with it.
        reason: String,
    },
}

/// Top-level error type for kyrostore.
#[derive(Debug, Clone, PartialEq, Error)]
pub enum KyroError {
    /// Schema definition or lookup failure.
    #[error("Schema error: {0}")]
    Schema(#[from] SchemaError),

    /// A link would exceed the relationship's cardinality.
    #[error("Cardinality violation on '{relationship}' ({cardinality}): {reason}")]
    CardinalityViolation {
        /// Relationship being linked.
        relationship: String,
        /// Its cardinality, e.g. `one_many`.
        cardinality: String,
        /// Which end is over its limit.
        reason: String,
    },

    /// A single attempt exceeded its request timeout.
    #[error("Operation '{label}' timed out after {ms}ms")]
    Timeout {
        /// Operation label, `<resolver>.<method>`.
        label: String,
        /// The deadline that expired.
        ms: u64,
    },

    /// Call rejected by an open circuit breaker.
    #[error("Circuit breaker is open for resolver '{resolver_name}'")]
    CircuitOpen {
        /// Resolver whose circuit is open.
        resolver_name: String,
    },

    /// Failure reported by a resolver backend.
    #[error("Resolver error: {0}")]
    Resolver(#[from] ResolverError),

    /// Failure inside the evaluator.
    #[error("Evaluation error: {0}")]
    Evaluation(#[from] EvalError),

    /// Invalid runtime or policy configuration.
    #[error("Configuration error: {message}")]
    Config {
        /// What was wrong.
        message: String,
    },

    /// Broken invariant or poisoned lock.
    #[error("Internal error: {message}")]
    Internal {
        /// Details.
        message: String,
    },
}

impl KyroError {
    /// Creates an internal error.
    #[must_use]
    pub fn internal(message: impl Into<String>) -> Self {
        Self::Internal {
            message: message.into(),
        }
    }

    /// Creates a configuration error.
    #[must_use]
    pub fn config(message: impl Into<String>) -> Self {
        Self::Config {
            message: message.into(),
        }
    }

    /// Returns true if this is a schema error.
    #[must_use]
    pub const fn is_schema(&self) -> bool {
        matches!(self, Self::Schema(_))
    }

    /// Returns true if this is a cardinality violation.
    #[must_use]
    pub const fn is_cardinality_violation(&self) -> bool {
        matches!(self, Self::CardinalityViolation { .. })
    }

    /// Returns true if a single attempt exceeded its deadline.
    #[must_use]
    pub const fn is_timeout(&self) -> bool {
        matches!(self, Self::Timeout { .. })
    }

    /// Returns true if the call was short-circuited by an open breaker.
    #[must_use]
    pub const fn is_circuit_open(&self) -> bool {
        matches!(self, Self::CircuitOpen { .. })
    }

    /// Returns true if this error came from a resolver backend.
    #[must_use]
    pub const fn is_resolver(&self) -> bool {
        matches!(self, Self::Resolver(_))
    }

    /// Returns true if this error is retryable.
    #[must_use]
    pub const fn is_retryable(&self) -> bool {
        match self {
            Self::Timeout { .. } => true,
            Self::Resolver(e) => e.is_transient(),
            Self::Schema(_)
            | Self::CardinalityViolation { .. }
            | Self::CircuitOpen { .. }
            | Self::Evaluation(_)
            | Self::Config { .. }
            | Self::Internal { .. } => false,
        }
    }

    /// Returns true if a `@catch` error handler may intercept this error.
    ///
    /// Open breakers, schema errors and cardinality violations always
    /// propagate as statement failures.
    #[must_use]
    pub const fn is_catchable(&self) -> bool {
        !matches!(
            self,
            Self::Schema(_) | Self::CardinalityViolation { .. } | Self::CircuitOpen { .. }
        )
    }
}

/// Result type alias for kyrostore operations.
pub type KyroResult<T> = Result<T, KyroError>;
