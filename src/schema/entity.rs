//! Entity type definitions.

use std::fmt;

use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::error::SchemaError;
use crate::value::Value;

/// Name of the synthesized identity attribute for entities without `@id`.
pub const SURROGATE_ID: &str = "__id";

/// Semantic type of an attribute.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AttributeType {
    /// Text.
    String,
    /// Integer.
    Int,
    /// Float; integers are widened.
    Float,
    /// Boolean.
    Bool,
    /// UUID; canonical strings are parsed.
    Uuid,
    /// UTC timestamp.
    DateTime,
    /// List of any values.
    List,
    /// Accepts any value.
    Any,
}

impl AttributeType {
    /// Coerces `value` into this type, or returns `None` when it does not fit.
    ///
    /// Integers widen to floats, and strings holding a UUID convert to `Uuid`.
    #[must_use]
    pub fn coerce(self, value: Value) -> Option<Value> {
        match (self, value) {
            (Self::Any, v) => Some(v),
            (Self::String, v @ Value::String(_))
            | (Self::Int, v @ Value::Int(_))
            | (Self::Float, v @ Value::Float(_))
            | (Self::Bool, v @ Value::Bool(_))
            | (Self::Uuid, v @ Value::Uuid(_))
            | (Self::DateTime, v @ Value::DateTime(_))
            | (Self::List, v @ Value::List(_)) => Some(v),
            #[allow(clippy::cast_precision_loss)]
            (Self::Float, Value::Int(i)) => Some(Value::Float(i as f64)),
            (Self::Uuid, Value::String(s)) => Uuid::parse_str(&s).ok().map(Value::Uuid),
            _ => None,
        }
    }
}

impl fmt::Display for AttributeType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::String => "string",
            Self::Int => "int",
            Self::Float => "float",
            Self::Bool => "bool",
            Self::Uuid => "uuid",
            Self::DateTime => "datetime",
            Self::List => "list",
            Self::Any => "any",
        };
        write!(f, "{name}")
    }
}

/// A named, typed attribute of an entity.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Attribute {
    /// Attribute name, unique within the entity.
    pub name: String,

    /// Declared type values are coerced to.
    #[serde(rename = "type")]
    pub ty: AttributeType,

    /// The `@id` annotation.
    #[serde(default)]
    pub identity: bool,

    /// Whether the attribute may be left unset.
    #[serde(default)]
    pub optional: bool,

    /// Value used when none is supplied.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub default: Option<Value>,
}

impl Attribute {
    /// Creates a required attribute.
    #[must_use]
    pub fn new(name: impl Into<String>, ty: AttributeType) -> Self {
        Self {
            name: name.into(),
            ty,
            identity: false,
            optional: false,
            default: None,
        }
    }

    /// Marks this attribute as the entity's identity (`@id`).
    #[must_use]
    pub fn id(mut self) -> Self {
        self.identity = true;
        self
    }

    /// Allows the attribute to stay unset.
    #[must_use]
    pub fn optional(mut self) -> Self {
        self.optional = true;
        self
    }

    /// Sets the value used when none is supplied.
    #[must_use]
    pub fn with_default(mut self, value: impl Into<Value>) -> Self {
        self.default = Some(value.into());
        self
    }
}

/// A named record schema.
///
/// # Examples
///
/// ```
/// use kyrostore::schema::{Attribute, AttributeType, EntityType};
///
/// let employee = EntityType::new("Employee")
///     .attribute(Attribute::new("id", AttributeType::Int).id())
///     .attribute(Attribute::new("name", AttributeType::String));
/// assert_eq!(employee.identity_attribute(), "id");
/// ```
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EntityType {
    /// Entity path, unique across the schema.
    pub name: String,
    attributes: Vec<Attribute>,
}

impl EntityType {
    /// Creates an entity with no attributes.
    #[must_use]
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            attributes: Vec::new(),
        }
    }

    /// Adds an attribute.
    #[must_use]
    pub fn attribute(mut self, attribute: Attribute) -> Self {
        self.attributes.push(attribute);
        self
    }

    /// Attributes in declaration order.
    #[must_use]
    pub fn attributes(&self) -> &[Attribute] {
        &self.attributes
    }

    /// Looks up an attribute by name.
    #[must_use]
    pub fn get_attribute(&self, name: &str) -> Option<&Attribute> {
        self.attributes.iter().find(|a| a.name == name)
    }

    /// Name of the identity attribute: the `@id` attribute, or the surrogate.
    #[must_use]
    pub fn identity_attribute(&self) -> &str {
        self.attributes
            .iter()
            .find(|a| a.identity)
            .map_or(SURROGATE_ID, |a| a.name.as_str())
    }

    /// Returns true if the identity is synthesized rather than declared.
    #[must_use]
    pub fn has_surrogate_identity(&self) -> bool {
        self.identity_attribute() == SURROGATE_ID
    }

    /// Validates the definition and appends the surrogate identity when no
    /// attribute carries `@id`.
    pub(crate) fn normalized(mut self) -> Result<Self, SchemaError> {
        if self.name.trim().is_empty() {
            return Err(SchemaError::EmptyName { context: "entity" });
        }

        let mut seen = std::collections::HashSet::with_capacity(self.attributes.len());
        for attr in &self.attributes {
            if attr.name.trim().is_empty() {
                return Err(SchemaError::EmptyName { context: "attribute" });
            }
            if attr.name == SURROGATE_ID || !seen.insert(attr.name.as_str()) {
                return Err(SchemaError::DuplicateDefinition {
                    name: format!("{}.{}", self.name, attr.name),
                });
            }
        }

        match self.attributes.iter().filter(|a| a.identity).count() {
            0 => {
                self.attributes
                    .push(Attribute::new(SURROGATE_ID, AttributeType::Uuid).id());
            }
            1 => {}
            _ => {
                return Err(SchemaError::MultipleIdentities {
                    entity: self.name.clone(),
                })
            }
        }

        Ok(self)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_surrogate_identity_is_synthesized() {
        let e = EntityType::new("Note")
            .attribute(Attribute::new("text", AttributeType::String))
            .normalized()
            .unwrap();
        assert_eq!(e.identity_attribute(), SURROGATE_ID);
        assert!(e.has_surrogate_identity());
        assert_eq!(e.get_attribute(SURROGATE_ID).unwrap().ty, AttributeType::Uuid);
    }

    #[test]
    fn test_multiple_identities_rejected() {
        let err = EntityType::new("Bad")
            .attribute(Attribute::new("a", AttributeType::Int).id())
            .attribute(Attribute::new("b", AttributeType::Int).id())
            .normalized()
            .unwrap_err();
        assert!(matches!(err, SchemaError::MultipleIdentities { .. }));
    }

    #[test]
    fn test_duplicate_attribute_rejected() {
        let err = EntityType::new("Dup")
            .attribute(Attribute::new("a", AttributeType::Int))
            .attribute(Attribute::new("a", AttributeType::String))
            .normalized()
            .unwrap_err();
        assert!(matches!(err, SchemaError::DuplicateDefinition { .. }));
    }

    #[test]
    fn test_coerce() {
        assert_eq!(AttributeType::Float.coerce(Value::Int(2)), Some(Value::Float(2.0)));
        assert_eq!(AttributeType::Int.coerce(Value::from("x")), None);
        let id = Uuid::new_v4();
        assert_eq!(
            AttributeType::Uuid.coerce(Value::from(id.to_string())),
            Some(Value::Uuid(id))
        );
        assert_eq!(AttributeType::Any.coerce(Value::Null), Some(Value::Null));
    }
}
