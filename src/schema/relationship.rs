//! Relationship type definitions.
//!
//! A relationship connects two ends. Containment makes the first end the
//! parent and the second the child; a between-relationship is an association
//! with its own link records and a cardinality. Both kinds persist links as
//! records keyed by the relationship name whose attributes are the two role
//! names.

use std::fmt;

use serde::{Deserialize, Serialize};

use crate::error::SchemaError;

/// Link uniqueness constraint of a relationship.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Cardinality {
    /// Each end may take part in at most one link.
    OneOne,
    /// The second ("many") end may take part in at most one link.
    OneMany,
    /// No limit on either end.
    #[default]
    ManyMany,
}

impl fmt::Display for Cardinality {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::OneOne => write!(f, "one_one"),
            Self::OneMany => write!(f, "one_many"),
            Self::ManyMany => write!(f, "many_many"),
        }
    }
}

/// How a relationship ties its ends together.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RelationshipKind {
    /// Parent owns child; deleting the parent deletes the child.
    Containment,
    /// Association between peers.
    Between,
}

/// One end of a relationship.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RelationshipEnd {
    /// Role alias, also the attribute name in link records.
    pub role: String,
    /// Entity path at this end.
    pub entity: String,
}

impl RelationshipEnd {
    /// An end whose role defaults to the entity's local name
    /// (`hr/Employee` plays role `Employee`).
    #[must_use]
    pub fn new(entity: impl Into<String>) -> Self {
        let entity = entity.into();
        let role = entity.rsplit('/').next().unwrap_or(&entity).to_string();
        Self { role, entity }
    }

    /// An end with an explicit role alias.
    #[must_use]
    pub fn aliased(entity: impl Into<String>, role: impl Into<String>) -> Self {
        Self {
            role: role.into(),
            entity: entity.into(),
        }
    }
}

/// A relationship between two entity types.
///
/// # Examples
///
/// ```
/// use kyrostore::schema::{Cardinality, RelationshipEnd, RelationshipType};
///
/// let reports_to = RelationshipType::between(
///     "ReportsTo",
///     RelationshipEnd::aliased("Employee", "manager"),
///     RelationshipEnd::aliased("Employee", "report"),
/// )
/// .with_cardinality(Cardinality::OneMany);
/// assert!(reports_to.is_self_referencing());
/// ```
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RelationshipType {
    /// Relationship name, also the path of its link records.
    pub name: String,
    /// Containment or association.
    pub kind: RelationshipKind,
    /// Link limit enforced when links are created.
    #[serde(default)]
    pub cardinality: Cardinality,
    ends: Vec<RelationshipEnd>,
}

impl RelationshipType {
    /// Generic constructor; shape is checked when the relationship is defined.
    #[must_use]
    pub fn new(
        name: impl Into<String>,
        kind: RelationshipKind,
        ends: Vec<RelationshipEnd>,
        cardinality: Cardinality,
    ) -> Self {
        Self {
            name: name.into(),
            kind,
            cardinality,
            ends,
        }
    }

    /// A containment relationship: `parent` owns `child`.
    #[must_use]
    pub fn contains(name: impl Into<String>, parent: RelationshipEnd, child: RelationshipEnd) -> Self {
        Self::new(name, RelationshipKind::Containment, vec![parent, child], Cardinality::OneMany)
    }

    /// An association with the default `many_many` cardinality.
    #[must_use]
    pub fn between(name: impl Into<String>, first: RelationshipEnd, second: RelationshipEnd) -> Self {
        Self::new(name, RelationshipKind::Between, vec![first, second], Cardinality::ManyMany)
    }

    /// Overrides the cardinality.
    #[must_use]
    pub fn with_cardinality(mut self, cardinality: Cardinality) -> Self {
        self.cardinality = cardinality;
        self
    }

    /// The `(role, entity)` ends, in declaration order.
    #[must_use]
    pub fn ends(&self) -> &[RelationshipEnd] {
        &self.ends
    }

    /// End at `index` (0 or 1).
    ///
    /// # Panics
    /// When `index` is not an end of the relationship.
    #[must_use]
    pub fn end(&self, index: usize) -> &RelationshipEnd {
        &self.ends[index]
    }

    /// Returns true for a parent/child relationship.
    #[must_use]
    pub fn is_containment(&self) -> bool {
        self.kind == RelationshipKind::Containment
    }

    /// Returns true when both ends are the same entity.
    #[must_use]
    pub fn is_self_referencing(&self) -> bool {
        self.ends.len() == 2 && self.ends[0].entity == self.ends[1].entity
    }

    /// Index of the end playing `role`.
    #[must_use]
    pub fn end_index(&self, role: &str) -> Option<usize> {
        self.ends.iter().position(|e| e.role == role)
    }

    /// Returns true if `entity` is one of the ends.
    #[must_use]
    pub fn touches(&self, entity: &str) -> bool {
        self.ends.iter().any(|e| e.entity == entity)
    }

    /// Works out the direction of a traversal from an instance of `from_entity`
    /// to instances of `to_entity`, returning `(from_index, to_index)`.
    ///
    /// `to_role` names the end being reached. It is required when both ends
    /// share an entity type, since the direction cannot be read off the types.
    pub fn traversal(
        &self,
        from_entity: &str,
        to_entity: &str,
        to_role: Option<&str>,
    ) -> Result<(usize, usize), SchemaError> {
        let to = match to_role {
            Some(role) => self.end_index(role).ok_or_else(|| SchemaError::UnknownRole {
                relationship: self.name.clone(),
                role: role.to_string(),
            })?,
            None if self.is_self_referencing() => {
                return Err(SchemaError::MissingRoleAlias {
                    relationship: self.name.clone(),
                })
            }
            None => self
                .ends
                .iter()
                .position(|e| e.entity == to_entity)
                .ok_or_else(|| self.traversal_error(from_entity, format!("'{to_entity}' is not an end")))?,
        };
        let from = 1 - to;

        if self.ends[from].entity != from_entity {
            return Err(self.traversal_error(
                from_entity,
                format!("role '{}' belongs to '{}'", self.ends[from].role, self.ends[from].entity),
            ));
        }
        if self.ends[to].entity != to_entity {
            return Err(self.traversal_error(
                from_entity,
                format!("role '{}' reaches '{}', not '{to_entity}'", self.ends[to].role, self.ends[to].entity),
            ));
        }
        Ok((from, to))
    }

    fn traversal_error(&self, entity: &str, reason: String) -> SchemaError {
        SchemaError::InvalidTraversal {
            relationship: self.name.clone(),
            entity: entity.to_string(),
            reason,
        }
    }

    /// Checks the shape of the definition (entity existence is checked by
    /// the schema builder).
    pub(crate) fn validate(&self) -> Result<(), SchemaError> {
        if self.name.trim().is_empty() {
            return Err(SchemaError::EmptyName { context: "relationship" });
        }
        if self.ends.len() != 2 {
            return Err(SchemaError::InvalidCardinality {
                relationship: self.name.clone(),
                reason: format!("{} requires exactly two ends, found {}", self.cardinality, self.ends.len()),
            });
        }
        if self.ends.iter().any(|e| e.role.trim().is_empty()) {
            return Err(SchemaError::EmptyName { context: "relationship role" });
        }
        if self.ends[0].role == self.ends[1].role {
            return Err(SchemaError::MissingRoleAlias {
                relationship: self.name.clone(),
            });
        }
        if self.is_containment() && self.cardinality != Cardinality::OneMany {
            return Err(SchemaError::InvalidCardinality {
                relationship: self.name.clone(),
                reason: format!("containment is one_many, not {}", self.cardinality),
            });
        }
        Ok(())
    }
}
