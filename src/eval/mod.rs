//! CRUD pattern evaluation.
//!
//! Statements arrive as already-parsed trees ([`Statement`]): a [`Pattern`]
//! plus its `@` hints. The [`Evaluator`] runs them one at a time against an
//! [`Environment`] that carries alias bindings, the last result, the caller
//! identity and the active transaction.

mod env;
mod evaluator;
mod expr;
mod modifiers;
mod pattern;

pub use env::{Binding, Environment, EvalResult, ProjectedRow};
pub use evaluator::{Evaluator, ERROR_BINDING};
pub use expr::{AggregateFn, BinaryOp, Expr, Scope};
pub use pattern::{
    Alias, AttributeMode, AttributePattern, CatchHandlers, CrudKind, CrudPattern, ForEachPattern, Hints, IfPattern,
    Join, JoinKind, OrderBy, Pattern, Projection, PurgeEnd, PurgePattern, RelationshipPattern, Statement,
};
