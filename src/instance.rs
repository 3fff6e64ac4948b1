//! Materialized entity records.
//!
//! An [`Instance`] is an immutable snapshot produced by the evaluator from
//! resolver results. It is cloned, never shared mutably, between statements.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::error::{EvalError, KyroResult, SchemaError};
use crate::schema::{EntityType, RelationshipType, SURROGATE_ID};
use crate::value::Value;

/// Attribute name to value.
pub type Attributes = BTreeMap<String, Value>;

/// A stored record of an entity type (or a relationship link record).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Instance {
    /// Entity path (or relationship name for link records).
    pub entity: String,

    /// Name of the identity attribute.
    pub id_attribute: String,

    /// Attribute values, identity included.
    pub attributes: Attributes,

    /// Instances reached through relationship traversal, keyed by
    /// relationship name.
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub related: BTreeMap<String, Vec<Instance>>,
}

impl Instance {
    /// Wraps already-validated attributes.
    #[must_use]
    pub fn new(entity: impl Into<String>, id_attribute: impl Into<String>, attributes: Attributes) -> Self {
        Self {
            entity: entity.into(),
            id_attribute: id_attribute.into(),
            attributes,
            related: BTreeMap::new(),
        }
    }

    /// Builds a validated instance of `entity_type` from evaluated attributes.
    ///
    /// Values are coerced to the declared types, defaults fill in missing
    /// attributes, and a surrogate identity gets a fresh UUID.
    ///
    /// # Errors
    /// - `UnknownAttribute` for attributes the entity does not declare
    /// - `TypeMismatch` when a value cannot be coerced
    /// - `MissingAttribute` when a required attribute has no value
    pub fn build(entity_type: &EntityType, mut attributes: Attributes) -> KyroResult<Self> {
        let mut out = Attributes::new();
        for attr in entity_type.attributes() {
            let value = match attributes.remove(&attr.name) {
                Some(Value::Null) if attr.optional => Value::Null,
                Some(value) => coerce(entity_type, &attr.name, attr.ty, value)?,
                None if attr.name == SURROGATE_ID => Value::Uuid(Uuid::new_v4()),
                None => match &attr.default {
                    Some(default) => default.clone(),
                    None if attr.optional => continue,
                    None => {
                        return Err(EvalError::MissingAttribute {
                            entity: entity_type.name.clone(),
                            attribute: attr.name.clone(),
                        }
                        .into())
                    }
                },
            };
            out.insert(attr.name.clone(), value);
        }

        if let Some(unknown) = attributes.into_keys().next() {
            return Err(SchemaError::UnknownAttribute {
                entity: entity_type.name.clone(),
                attribute: unknown,
            }
            .into());
        }

        Ok(Self::new(
            entity_type.name.clone(),
            entity_type.identity_attribute(),
            out,
        ))
    }

    /// Validates and coerces a set of new attribute values for an update.
    pub(crate) fn check_update(entity_type: &EntityType, attributes: Attributes) -> KyroResult<Attributes> {
        let mut out = Attributes::new();
        for (name, value) in attributes {
            let attr = entity_type
                .get_attribute(&name)
                .ok_or_else(|| SchemaError::UnknownAttribute {
                    entity: entity_type.name.clone(),
                    attribute: name.clone(),
                })?;
            if attr.identity {
                return Err(EvalError::InvalidPattern {
                    reason: format!("identity attribute '{name}' of '{}' cannot be updated", entity_type.name),
                }
                .into());
            }
            let value = if value.is_null() && attr.optional {
                value
            } else {
                coerce(entity_type, &name, attr.ty, value)?
            };
            out.insert(name, value);
        }
        Ok(out)
    }

    /// Builds a link record for `relationship` between `first` (end 0) and
    /// `second` (end 1).
    #[must_use]
    pub fn link(relationship: &RelationshipType, first: Value, second: Value) -> Self {
        let mut attributes = Attributes::new();
        attributes.insert(relationship.end(0).role.clone(), first);
        attributes.insert(relationship.end(1).role.clone(), second);
        attributes.insert(SURROGATE_ID.to_string(), Value::Uuid(Uuid::new_v4()));
        Self::new(relationship.name.clone(), SURROGATE_ID, attributes)
    }

    /// The identity value, if present.
    #[must_use]
    pub fn id(&self) -> Option<&Value> {
        self.attributes.get(&self.id_attribute)
    }

    /// Canonical key of the identity value.
    #[must_use]
    pub fn id_key(&self) -> Option<String> {
        self.id().map(Value::key)
    }

    /// Value of `attribute`, if set.
    #[must_use]
    pub fn get(&self, attribute: &str) -> Option<&Value> {
        self.attributes.get(attribute)
    }

    /// Instances reached through `relationship`; empty when not traversed.
    #[must_use]
    pub fn related(&self, relationship: &str) -> &[Instance] {
        self.related.get(relationship).map_or(&[], Vec::as_slice)
    }

    /// Attaches the instances reached through `relationship`.
    #[must_use]
    pub fn with_related(mut self, relationship: impl Into<String>, instances: Vec<Instance>) -> Self {
        self.related.insert(relationship.into(), instances);
        self
    }

    /// A copy with `new_attributes` applied on top of the current values.
    #[must_use]
    pub fn merged(&self, new_attributes: &Attributes) -> Self {
        let mut next = self.clone();
        next.related.clear();
        for (k, v) in new_attributes {
            next.attributes.insert(k.clone(), v.clone());
        }
        next
    }

    /// A copy without traversal results, as a backend stores it.
    #[must_use]
    pub fn detached(&self) -> Self {
        let mut copy = self.clone();
        copy.related.clear();
        copy
    }
}

fn coerce(
    entity_type: &EntityType,
    name: &str,
    ty: crate::schema::AttributeType,
    value: Value,
) -> KyroResult<Value> {
    let actual = value.type_name();
    ty.coerce(value).ok_or_else(|| {
        EvalError::TypeMismatch {
            context: format!("{}.{name}", entity_type.name),
            expected: ty.to_string(),
            actual: actual.to_string(),
        }
        .into()
    })
}
