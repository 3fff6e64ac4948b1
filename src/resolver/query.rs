//! Query predicates passed to resolvers.

use std::collections::HashMap;
use std::sync::{OnceLock, RwLock};

use serde::{Deserialize, Serialize};

use crate::error::{EvalError, KyroError, KyroResult};
use crate::instance::Instance;
use crate::value::Value;

const REGEX_CACHE_MAX: usize = 1024;

static LIKE_CACHE: OnceLock<RwLock<HashMap<String, regex::Regex>>> = OnceLock::new();

/// Compiles a SQL `LIKE` pattern (`%` any run, `_` any single char).
fn like_regex(pattern: &str) -> KyroResult<regex::Regex> {
    let cache = LIKE_CACHE.get_or_init(|| RwLock::new(HashMap::new()));

    {
        let guard = cache
            .read()
            .map_err(|_| KyroError::internal("like cache lock poisoned"))?;
        if let Some(re) = guard.get(pattern) {
            return Ok(re.clone());
        }
    }

    let mut source = String::with_capacity(pattern.len() + 8);
    source.push_str("(?s)^");
    for ch in pattern.chars() {
        match ch {
            '%' => source.push_str(".*"),
            '_' => source.push('.'),
            c => source.push_str(&regex::escape(c.encode_utf8(&mut [0u8; 4]))),
        }
    }
    source.push('$');

    let compiled = regex::Regex::new(&source).map_err(|e| EvalError::InvalidPattern {
        reason: format!("invalid like pattern '{pattern}': {e}"),
    })?;

    let mut guard = cache
        .write()
        .map_err(|_| KyroError::internal("like cache lock poisoned"))?;
    if guard.len() >= REGEX_CACHE_MAX {
        guard.clear();
    }
    guard
        .entry(pattern.to_string())
        .or_insert_with(|| compiled.clone());
    Ok(compiled)
}

/// Comparison operator of a filter or `@where` condition.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CompareOp {
    /// Equal; `Int` and `Float` compare by value.
    Eq,
    /// Not equal.
    Ne,
    /// Less than.
    Lt,
    /// Less than or equal.
    Le,
    /// Greater than.
    Gt,
    /// Greater than or equal.
    Ge,
    /// SQL-style wildcard match on strings.
    Like,
    /// Membership in a list value.
    In,
}

impl CompareOp {
    /// Applies the operator. Ordering comparisons between incomparable
    /// kinds (or against `Null`) are false rather than an error.
    pub fn apply(self, lhs: &Value, rhs: &Value) -> KyroResult<bool> {
        use std::cmp::Ordering;

        let ordered = |pred: fn(Ordering) -> bool| {
            if lhs.is_null() || rhs.is_null() {
                return false;
            }
            lhs.compare(rhs).is_some_and(pred)
        };

        Ok(match self {
            Self::Eq => lhs.loosely_equals(rhs),
            Self::Ne => !lhs.loosely_equals(rhs),
            Self::Lt => ordered(Ordering::is_lt),
            Self::Le => ordered(Ordering::is_le),
            Self::Gt => ordered(Ordering::is_gt),
            Self::Ge => ordered(Ordering::is_ge),
            Self::Like => match (lhs, rhs) {
                (Value::String(s), Value::String(p)) => like_regex(p)?.is_match(s),
                (_, Value::String(_)) => false,
                (_, other) => {
                    return Err(EvalError::TypeMismatch {
                        context: "like".to_string(),
                        expected: "string".to_string(),
                        actual: other.type_name().to_string(),
                    }
                    .into())
                }
            },
            Self::In => match rhs {
                Value::List(items) => items.iter().any(|v| lhs.loosely_equals(v)),
                other => {
                    return Err(EvalError::TypeMismatch {
                        context: "in".to_string(),
                        expected: "list".to_string(),
                        actual: other.type_name().to_string(),
                    }
                    .into())
                }
            },
        })
    }
}

/// A single `attr? op value` predicate.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Filter {
    /// Attribute the predicate reads.
    pub attribute: String,
    /// Comparison applied.
    pub op: CompareOp,
    /// Right-hand operand.
    pub value: Value,
}

impl Filter {
    /// Creates a predicate.
    #[must_use]
    pub fn new(attribute: impl Into<String>, op: CompareOp, value: impl Into<Value>) -> Self {
        Self {
            attribute: attribute.into(),
            op,
            value: value.into(),
        }
    }

    /// Equality predicate.
    #[must_use]
    pub fn eq(attribute: impl Into<String>, value: impl Into<Value>) -> Self {
        Self::new(attribute, CompareOp::Eq, value)
    }

    /// Evaluates the predicate; a missing attribute reads as `Null`.
    pub fn matches(&self, instance: &Instance) -> KyroResult<bool> {
        let lhs = instance.get(&self.attribute).unwrap_or(&Value::Null);
        self.op.apply(lhs, &self.value)
    }
}

/// The query instance handed to `Resolver::query_instances`: an entity
/// path and a conjunction of filters.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Query {
    /// Entity path to search.
    pub entity: String,
    /// Predicates, all of which must hold.
    #[serde(default)]
    pub filters: Vec<Filter>,
}

impl Query {
    /// Unfiltered query of `entity`.
    #[must_use]
    pub fn new(entity: impl Into<String>) -> Self {
        Self {
            entity: entity.into(),
            filters: Vec::new(),
        }
    }

    /// Adds a predicate.
    #[must_use]
    pub fn filter(mut self, filter: Filter) -> Self {
        self.filters.push(filter);
        self
    }

    /// Returns true if every filter accepts `instance`.
    pub fn matches(&self, instance: &Instance) -> KyroResult<bool> {
        for f in &self.filters {
            if !f.matches(instance)? {
                return Ok(false);
            }
        }
        Ok(true)
    }
}
