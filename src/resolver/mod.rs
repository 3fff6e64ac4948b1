//! Resolver abstraction and registry.
//!
//! A resolver is a pluggable persistence backend. The registry maps entity
//! and relationship paths to resolver instances and wraps each one with the
//! connection policy engine.

mod memory;
mod policy;
mod query;
mod registry;
mod traits;

/// Name of the built-in in-memory resolver.
pub const DEFAULT_RESOLVER: &str = "memory";

pub use memory::InMemoryResolver;
pub use policy::PolicyResolver;
pub use query::{CompareOp, Filter, Query};
pub use registry::{activate, ResolverBinding, ResolverFactory, ResolverRegistry, Sharing, SUBSCRIBE_MAX_RETRIES};
pub use traits::{AuthInfo, Resolver, ResolverEnvironment, ResolverOutcome, TxnId, DEFAULT_TXN_ID};
