//! Entity/relationship data model.
//!
//! Schemas are registered once (usually at startup) and read-only afterwards.

mod entity;
mod registry;
mod relationship;

pub use entity::{Attribute, AttributeType, EntityType, SURROGATE_ID};
pub use registry::{Schema, SchemaBuilder};
pub use relationship::{Cardinality, RelationshipEnd, RelationshipKind, RelationshipType};
