//! # kyrostore - persistence and resilience core for declarative workflows
//!
//! kyrostore executes CRUD patterns over an entity/relationship model and
//! sends the resulting work to pluggable persistence backends (resolvers).
//! Every resolver call goes through a connection policy engine that adds
//! timeouts, retry with backoff and a circuit breaker.
//!
//! ## Core Concepts
//!
//! - **Schema**: entity types and the relationships between them
//!   (containment or association, with cardinality and role aliases)
//! - **Resolver**: a backend offering any subset of create, query, update,
//!   delete, purge, transactions and subscription
//! - **ConnectionPolicy**: optional timeout, retry and circuit breaker
//!   settings per resolver, hot-swappable at runtime
//! - **Evaluator**: runs parsed statements against an environment of alias
//!   bindings, returning instances or projected rows
//!
//! ## Usage
//!
//! ```rust
//! use kyrostore::eval::{CrudPattern, Environment, Expr, Statement};
//! use kyrostore::schema::{Attribute, AttributeType, EntityType, Schema};
//! use kyrostore::Runtime;
//!
//! # tokio::runtime::Builder::new_current_thread().enable_all().build().unwrap().block_on(async {
//! let mut schema = Schema::builder();
//! schema.define_entity(
//!     EntityType::new("Employee")
//!         .attribute(Attribute::new("id", AttributeType::Int).id())
//!         .attribute(Attribute::new("name", AttributeType::String)),
//! )?;
//! let runtime = Runtime::new(schema.build());
//!
//! let mut env = Environment::new();
//! let create = Statement::crud(
//!     CrudPattern::new("Employee")
//!         .set("id", Expr::lit(1))
//!         .set("name", Expr::lit("Ada")),
//! );
//! runtime.evaluate(&create, &mut env).await?;
//!
//! let query = Statement::crud(CrudPattern::query("Employee").filter("name", Expr::lit("Ada")));
//! let found = runtime.evaluate(&query, &mut env).await?;
//! assert_eq!(found.len(), 1);
//! # Ok::<(), kyrostore::KyroError>(())
//! # }).unwrap();
//! ```

#![warn(missing_docs)]
#![warn(clippy::all)]
#![warn(clippy::pedantic)]
#![allow(clippy::module_name_repetitions)]

pub mod error;
pub mod instance;
pub mod schema;
pub mod value;

pub mod eval;
pub mod policy;
pub mod resolver;

pub mod config;
pub mod runtime;

// Re-export primary types at crate root for convenience
pub use config::RuntimeConfig;
pub use error::{EvalError, KyroError, KyroResult, ResolverError, SchemaError};
pub use eval::{Environment, EvalResult, Evaluator, Statement};
pub use instance::{Attributes, Instance};
pub use policy::{ConnectionPolicy, PolicyEngine};
pub use resolver::{InMemoryResolver, Resolver, ResolverOutcome, ResolverRegistry};
pub use runtime::Runtime;
pub use schema::{Schema, SchemaBuilder};
pub use value::Value;
