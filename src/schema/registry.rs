//! Schema registration.
//!
//! Definitions are collected in a [`SchemaBuilder`] and frozen into an
//! immutable [`Schema`], which is shared (`Arc<Schema>`) by the evaluator.

use std::collections::BTreeMap;

use crate::error::SchemaError;

use super::entity::EntityType;
use super::relationship::{RelationshipEnd, RelationshipType};

/// Collects entity and relationship definitions.
#[derive(Debug, Default)]
pub struct SchemaBuilder {
    entities: BTreeMap<String, EntityType>,
    relationships: BTreeMap<String, RelationshipType>,
}

impl SchemaBuilder {
    /// Creates an empty builder.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers an entity type.
    ///
    /// # Errors
    /// `DuplicateDefinition` when the name is taken by an entity or a
    /// relationship; `MultipleIdentities` / `EmptyName` for malformed types.
    pub fn define_entity(&mut self, entity: EntityType) -> Result<&mut Self, SchemaError> {
        let entity = entity.normalized()?;
        self.ensure_unused(&entity.name)?;
        self.entities.insert(entity.name.clone(), entity);
        Ok(self)
    }

    /// Registers a relationship type. Both end entities must already be defined.
    ///
    /// # Errors
    /// `UndefinedEntity` for unknown ends, `MissingRoleAlias` when roles
    /// collide, `InvalidCardinality` when the cardinality does not fit the ends.
    pub fn define_relationship(&mut self, relationship: RelationshipType) -> Result<&mut Self, SchemaError> {
        relationship.validate()?;
        for end in relationship.ends() {
            if !self.entities.contains_key(&end.entity) {
                return Err(SchemaError::UndefinedEntity {
                    name: end.entity.clone(),
                });
            }
        }
        self.ensure_unused(&relationship.name)?;
        self.relationships.insert(relationship.name.clone(), relationship);
        Ok(self)
    }

    fn ensure_unused(&self, name: &str) -> Result<(), SchemaError> {
        if self.entities.contains_key(name) || self.relationships.contains_key(name) {
            return Err(SchemaError::DuplicateDefinition {
                name: name.to_string(),
            });
        }
        Ok(())
    }

    /// Freezes the definitions.
    #[must_use]
    pub fn build(self) -> Schema {
        Schema {
            entities: self.entities,
            relationships: self.relationships,
        }
    }
}

/// Immutable set of entity and relationship definitions.
#[derive(Debug, Clone, Default)]
pub struct Schema {
    entities: BTreeMap<String, EntityType>,
    relationships: BTreeMap<String, RelationshipType>,
}

impl Schema {
    /// Starts a new [`SchemaBuilder`].
    #[must_use]
    pub fn builder() -> SchemaBuilder {
        SchemaBuilder::new()
    }

    /// Looks up an entity type by path.
    ///
    /// # Errors
    /// `UndefinedEntity` when no entity has that name.
    pub fn lookup_entity_type(&self, name: &str) -> Result<&EntityType, SchemaError> {
        self.entities.get(name).ok_or_else(|| SchemaError::UndefinedEntity {
            name: name.to_string(),
        })
    }

    /// Looks up a relationship type by name.
    ///
    /// # Errors
    /// `UndefinedRelationship` when no relationship has that name.
    pub fn lookup_relationship_type(&self, name: &str) -> Result<&RelationshipType, SchemaError> {
        self.relationships
            .get(name)
            .ok_or_else(|| SchemaError::UndefinedRelationship {
                name: name.to_string(),
            })
    }

    /// Returns true when both ends of `relationship` are the same entity.
    ///
    /// # Errors
    /// `UndefinedRelationship` for an unknown name.
    pub fn is_self_referencing(&self, relationship: &str) -> Result<bool, SchemaError> {
        Ok(self.lookup_relationship_type(relationship)?.is_self_referencing())
    }

    /// The two ends of `relationship`.
    ///
    /// # Errors
    /// `UndefinedRelationship` for an unknown name.
    pub fn ends_of(&self, relationship: &str) -> Result<&[RelationshipEnd], SchemaError> {
        Ok(self.lookup_relationship_type(relationship)?.ends())
    }

    /// All entity types, ordered by name.
    pub fn entity_types(&self) -> impl Iterator<Item = &EntityType> {
        self.entities.values()
    }

    /// All relationship types, ordered by name.
    pub fn relationship_types(&self) -> impl Iterator<Item = &RelationshipType> {
        self.relationships.values()
    }

    /// Relationships that have `entity` on at least one end.
    pub fn relationships_of<'a>(&'a self, entity: &'a str) -> impl Iterator<Item = &'a RelationshipType> + 'a {
        self.relationships.values().filter(move |r| r.touches(entity))
    }

    /// Returns true if `entity` is the parent end of some containment.
    #[must_use]
    pub fn is_container(&self, entity: &str) -> bool {
        self.relationships
            .values()
            .any(|r| r.is_containment() && r.end(0).entity == entity)
    }
}
