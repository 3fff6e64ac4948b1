//! Parsed statement trees.
//!
//! These types are what a surface parser produces. They can also be built
//! directly with the constructors below, or deserialized from JSON.

use serde::{Deserialize, Serialize};

use crate::resolver::CompareOp;

use super::expr::Expr;

/// How an attribute takes part in a CRUD pattern.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AttributeMode {
    /// `attr value`: assigned on create, the new value on query-update.
    Set,
    /// `attr? value`: a filter.
    Query(CompareOp),
}

/// One `attr value` or `attr? value` entry.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AttributePattern {
    /// Attribute name.
    pub name: String,
    /// Assignment or filter.
    pub mode: AttributeMode,
    /// Value, evaluated against the environment.
    pub value: Expr,
}

/// A relationship sub-pattern nested under a CRUD pattern.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RelationshipPattern {
    /// Relationship traversed.
    pub relationship: String,
    /// Role of the end the nested pattern stands for. Required when the
    /// relationship is self-referencing.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub role: Option<String>,
    /// Pattern for the instances at the other end.
    pub pattern: Box<CrudPattern>,
}

/// What a [`CrudPattern`] does, derived from its attribute modes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CrudKind {
    /// No filters and no `?` marker: creates an instance.
    Create,
    /// Filters or the `?` marker, no assignments: returns matches.
    Query,
    /// A query with assignments: updates matches.
    QueryUpdate,
}

/// `{Entity {attr value, attr? value, ...}, Rel {...}}`
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CrudPattern {
    /// Entity path.
    pub entity: String,
    /// The `Entity?` suffix.
    #[serde(default)]
    pub query_marker: bool,
    /// Assignments and filters, in source order.
    #[serde(default)]
    pub attributes: Vec<AttributePattern>,
    /// Nested relationship sub-patterns.
    #[serde(default)]
    pub relationships: Vec<RelationshipPattern>,
}

impl CrudPattern {
    /// A create pattern (no filters yet).
    #[must_use]
    pub fn new(entity: impl Into<String>) -> Self {
        Self {
            entity: entity.into(),
            query_marker: false,
            attributes: Vec::new(),
            relationships: Vec::new(),
        }
    }

    /// `Entity? {}`: a query over the whole extent until filters are added.
    #[must_use]
    pub fn query(entity: impl Into<String>) -> Self {
        Self {
            query_marker: true,
            ..Self::new(entity)
        }
    }

    /// `attr value`: an assignment.
    #[must_use]
    pub fn set(mut self, name: impl Into<String>, value: Expr) -> Self {
        self.attributes.push(AttributePattern {
            name: name.into(),
            mode: AttributeMode::Set,
            value,
        });
        self
    }

    /// `attr? value` with equality.
    #[must_use]
    pub fn filter(self, name: impl Into<String>, value: Expr) -> Self {
        self.filter_op(name, CompareOp::Eq, value)
    }

    /// `attr? value` with any comparison.
    #[must_use]
    pub fn filter_op(mut self, name: impl Into<String>, op: CompareOp, value: Expr) -> Self {
        self.attributes.push(AttributePattern {
            name: name.into(),
            mode: AttributeMode::Query(op),
            value,
        });
        self
    }

    /// Nests `pattern` under `relationship`; `role` names the end it stands for.
    #[must_use]
    pub fn related(mut self, relationship: impl Into<String>, role: Option<&str>, pattern: CrudPattern) -> Self {
        self.relationships.push(RelationshipPattern {
            relationship: relationship.into(),
            role: role.map(str::to_string),
            pattern: Box::new(pattern),
        });
        self
    }

    fn has_filters(&self) -> bool {
        self.attributes
            .iter()
            .any(|a| matches!(a.mode, AttributeMode::Query(_)))
    }

    /// Create, query or query-update.
    #[must_use]
    pub fn kind(&self) -> CrudKind {
        let sets = self.attributes.iter().any(|a| a.mode == AttributeMode::Set);
        match (self.query_marker || self.has_filters(), sets) {
            (false, _) => CrudKind::Create,
            (true, false) => CrudKind::Query,
            (true, true) => CrudKind::QueryUpdate,
        }
    }

    /// A query without filter predicates reads the full extent.
    #[must_use]
    pub fn query_all(&self) -> bool {
        !self.has_filters()
    }

    pub(crate) fn filters(&self) -> impl Iterator<Item = (&str, CompareOp, &Expr)> {
        self.attributes.iter().filter_map(|a| match a.mode {
            AttributeMode::Query(op) => Some((a.name.as_str(), op, &a.value)),
            AttributeMode::Set => None,
        })
    }

    pub(crate) fn assignments(&self) -> impl Iterator<Item = (&str, &Expr)> {
        self.attributes
            .iter()
            .filter(|a| a.mode == AttributeMode::Set)
            .map(|a| (a.name.as_str(), &a.value))
    }
}

/// One end filter of a purge.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PurgeEnd {
    /// Defaults to the end whose entity matches the pattern; required for
    /// self-referencing relationships.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub role: Option<String>,
    /// Query selecting the instances at this end.
    pub pattern: CrudPattern,
}

/// Removes link records of `relationship` whose ends match every given
/// end filter. The linked instances themselves are kept.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PurgePattern {
    /// Relationship whose links are removed.
    pub relationship: String,
    /// End filters; none removes every link.
    #[serde(default)]
    pub ends: Vec<PurgeEnd>,
}

impl PurgePattern {
    /// Purge of every link of `relationship`.
    #[must_use]
    pub fn new(relationship: impl Into<String>) -> Self {
        Self {
            relationship: relationship.into(),
            ends: Vec::new(),
        }
    }

    /// Restricts the purge to links whose `role` end matches `pattern`.
    #[must_use]
    pub fn end(mut self, role: Option<&str>, pattern: CrudPattern) -> Self {
        self.ends.push(PurgeEnd {
            role: role.map(str::to_string),
            pattern,
        });
        self
    }
}

/// `for each var in source { body }`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ForEachPattern {
    /// Name bound to each item.
    pub variable: String,
    /// Statement whose result is iterated.
    pub source: Box<Statement>,
    /// Statements run per item.
    pub body: Vec<Statement>,
}

/// `if / else if / else`; an empty `otherwise` means no else branch.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct IfPattern {
    /// Condition and body pairs, tried in order.
    pub branches: Vec<(Expr, Vec<Statement>)>,
    /// Else body.
    #[serde(default)]
    pub otherwise: Vec<Statement>,
}

/// The body of a statement.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Pattern {
    /// Create, query or query-update.
    Crud(CrudPattern),
    /// Delete of the matching instances.
    Delete(CrudPattern),
    /// Removal of relationship links.
    Purge(PurgePattern),
    /// Loop over a result.
    ForEach(ForEachPattern),
    /// Conditional.
    If(IfPattern),
    /// A bare expression.
    Expr(Expr),
}

/// Target of `@as`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Alias {
    /// `@as name`: the whole result.
    Name(String),
    /// `@as [a, b, _]`; `_` skips a position.
    Destructure(Vec<String>),
}

/// `@catch` handlers.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CatchHandlers {
    /// Runs when the result is empty.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub not_found: Option<Vec<Statement>>,
    /// Runs when the statement fails with a catchable error.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<Vec<Statement>>,
}

/// Join flavour.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum JoinKind {
    /// Matching pairs only.
    Inner,
    /// Every left row, padded when unmatched.
    Left,
    /// Every right instance, padded when unmatched.
    Right,
    /// Both sides, padded when unmatched.
    Full,
}

/// `@join` of another entity into the rows.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Join {
    /// Join flavour.
    pub kind: JoinKind,
    /// Entity joined in.
    pub entity: String,
    /// Row key of the joined instance; defaults to the entity name.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub alias: Option<String>,
    /// Join condition.
    pub on: Expr,
}

impl Join {
    /// Row key of the joined instance.
    #[must_use]
    pub fn key(&self) -> &str {
        self.alias.as_deref().unwrap_or(&self.entity)
    }
}

/// One `@order_by` key.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OrderBy {
    /// Sort key.
    pub expr: Expr,
    /// Sort high to low.
    #[serde(default)]
    pub descending: bool,
}

/// One `@into` column.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Projection {
    /// Column name in the output row.
    pub column: String,
    /// Column value.
    pub expr: Expr,
}

/// The `@...` annotations of a statement.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct Hints {
    /// `@as`.
    pub alias: Option<Alias>,
    /// `@then`, run per produced instance.
    pub then: Vec<Statement>,
    /// `@catch`.
    pub catch: Option<CatchHandlers>,
    /// `@upsert`: create-or-replace.
    pub upsert: bool,
    /// `@into` projection.
    pub into: Vec<Projection>,
    /// `@where` row filter.
    #[serde(rename = "where")]
    pub where_clause: Option<Expr>,
    /// `@join` clauses, in order.
    pub joins: Vec<Join>,
    /// `@group_by` keys.
    pub group_by: Vec<Expr>,
    /// `@order_by` keys, most significant first.
    pub order_by: Vec<OrderBy>,
    /// `@distinct`.
    pub distinct: bool,
    /// `@limit`.
    pub limit: Option<usize>,
    /// `@offset`.
    pub offset: Option<usize>,
}

impl Hints {
    /// Returns true if any result-set modifier is present.
    #[must_use]
    pub fn has_modifiers(&self) -> bool {
        !self.into.is_empty()
            || self.where_clause.is_some()
            || !self.joins.is_empty()
            || !self.group_by.is_empty()
            || !self.order_by.is_empty()
            || self.distinct
            || self.limit.is_some()
            || self.offset.is_some()
    }
}

/// A pattern plus its hints.
///
/// # Examples
///
/// ```
/// use kyrostore::eval::{CrudPattern, Expr, Statement};
///
/// let stmt = Statement::crud(CrudPattern::query("Employee").filter("id", Expr::lit(1)))
///     .alias("boss");
/// assert!(stmt.is_query());
/// ```
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Statement {
    /// What the statement does.
    pub pattern: Pattern,
    /// Its annotations.
    #[serde(default)]
    pub hints: Hints,
}

impl Statement {
    /// Statement with no hints.
    #[must_use]
    pub fn new(pattern: Pattern) -> Self {
        Self {
            pattern,
            hints: Hints::default(),
        }
    }

    /// Create, query or query-update statement.
    #[must_use]
    pub fn crud(pattern: CrudPattern) -> Self {
        Self::new(Pattern::Crud(pattern))
    }

    /// Delete statement.
    #[must_use]
    pub fn delete(pattern: CrudPattern) -> Self {
        Self::new(Pattern::Delete(pattern))
    }

    /// Purge statement.
    #[must_use]
    pub fn purge(pattern: PurgePattern) -> Self {
        Self::new(Pattern::Purge(pattern))
    }

    /// Loop binding `variable` to each item of `source`.
    #[must_use]
    pub fn for_each(variable: impl Into<String>, source: Statement, body: Vec<Statement>) -> Self {
        Self::new(Pattern::ForEach(ForEachPattern {
            variable: variable.into(),
            source: Box::new(source),
            body,
        }))
    }

    /// Conditional.
    #[must_use]
    pub fn if_else(branches: Vec<(Expr, Vec<Statement>)>, otherwise: Vec<Statement>) -> Self {
        Self::new(Pattern::If(IfPattern { branches, otherwise }))
    }

    /// Expression statement.
    #[must_use]
    pub fn expr(expr: Expr) -> Self {
        Self::new(Pattern::Expr(expr))
    }

    /// Returns true for query and query-update patterns.
    #[must_use]
    pub fn is_query(&self) -> bool {
        matches!(&self.pattern, Pattern::Crud(p) if p.kind() != CrudKind::Create)
    }

    /// `@as name`.
    #[must_use]
    pub fn alias(mut self, name: impl Into<String>) -> Self {
        self.hints.alias = Some(Alias::Name(name.into()));
        self
    }

    /// `@as [a, b, ...]`.
    #[must_use]
    pub fn destructure(mut self, names: &[&str]) -> Self {
        self.hints.alias = Some(Alias::Destructure(names.iter().map(|n| (*n).to_string()).collect()));
        self
    }

    /// `@then { body }`.
    #[must_use]
    pub fn then(mut self, body: Vec<Statement>) -> Self {
        self.hints.then = body;
        self
    }

    /// `@catch.not_found { handler }`.
    #[must_use]
    pub fn catch_not_found(mut self, handler: Vec<Statement>) -> Self {
        self.hints.catch.get_or_insert_with(CatchHandlers::default).not_found = Some(handler);
        self
    }

    /// `@catch.error { handler }`.
    #[must_use]
    pub fn catch_error(mut self, handler: Vec<Statement>) -> Self {
        self.hints.catch.get_or_insert_with(CatchHandlers::default).error = Some(handler);
        self
    }

    /// `@upsert`.
    #[must_use]
    pub fn upsert(mut self) -> Self {
        self.hints.upsert = true;
        self
    }

    /// Adds an `@into` column.
    #[must_use]
    pub fn into_column(mut self, column: impl Into<String>, expr: Expr) -> Self {
        self.hints.into.push(Projection {
            column: column.into(),
            expr,
        });
        self
    }

    /// `@where condition`.
    #[must_use]
    pub fn where_(mut self, condition: Expr) -> Self {
        self.hints.where_clause = Some(condition);
        self
    }

    /// Adds an `@join`; `alias` defaults to the entity name.
    #[must_use]
    pub fn join(mut self, kind: JoinKind, entity: impl Into<String>, alias: Option<&str>, on: Expr) -> Self {
        self.hints.joins.push(Join {
            kind,
            entity: entity.into(),
            alias: alias.map(str::to_string),
            on,
        });
        self
    }

    /// Adds a `@group_by` key.
    #[must_use]
    pub fn group_by(mut self, expr: Expr) -> Self {
        self.hints.group_by.push(expr);
        self
    }

    /// Adds an `@order_by` key.
    #[must_use]
    pub fn order_by(mut self, expr: Expr, descending: bool) -> Self {
        self.hints.order_by.push(OrderBy { expr, descending });
        self
    }

    /// `@distinct`.
    #[must_use]
    pub fn distinct(mut self) -> Self {
        self.hints.distinct = true;
        self
    }

    /// `@limit n`.
    #[must_use]
    pub fn limit(mut self, n: usize) -> Self {
        self.hints.limit = Some(n);
        self
    }

    /// `@offset n`.
    #[must_use]
    pub fn offset(mut self, n: usize) -> Self {
        self.hints.offset = Some(n);
        self
    }
}
