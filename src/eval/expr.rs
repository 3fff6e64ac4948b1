//! Expressions used in attribute values, conditions and projections.

use serde::{Deserialize, Serialize};

use crate::error::{EvalError, KyroResult};
use crate::resolver::CompareOp;
use crate::value::Value;

use super::env::Binding;

/// Arithmetic operator.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BinaryOp {
    /// Sum; also concatenates strings.
    Add,
    /// Difference.
    Sub,
    /// Product.
    Mul,
    /// Quotient; zero divisors are an error.
    Div,
}

/// Aggregate function of an `@into` projection.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AggregateFn {
    /// Rows in the group, or non-null values of the argument.
    Count,
    /// Sum of numeric values.
    Sum,
    /// Mean of numeric values.
    Avg,
    /// Smallest value.
    Min,
    /// Largest value.
    Max,
}

/// An expression tree.
///
/// References are dotted paths: `name` is the bound value (an instance
/// reads as its identity) and `name.attr` an attribute of a bound instance.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Expr {
    /// A constant.
    Literal(Value),
    /// A dotted reference path.
    Ref(String),
    /// A list built from element expressions.
    List(Vec<Expr>),
    /// Arithmetic.
    Binary {
        /// Operator.
        op: BinaryOp,
        /// Left operand.
        lhs: Box<Expr>,
        /// Right operand.
        rhs: Box<Expr>,
    },
    /// Comparison yielding a boolean.
    Compare {
        /// Operator.
        op: CompareOp,
        /// Left operand.
        lhs: Box<Expr>,
        /// Right operand.
        rhs: Box<Expr>,
    },
    /// True when every operand is; stops at the first false one.
    And(Vec<Expr>),
    /// True when any operand is; stops at the first true one.
    Or(Vec<Expr>),
    /// Negation.
    Not(Box<Expr>),
    /// Only valid inside `@into` projections.
    Aggregate {
        /// Function applied over the group.
        func: AggregateFn,
        /// Per-row argument; `None` for `count()`.
        arg: Option<Box<Expr>>,
    },
}

/// Name lookup for expression evaluation.
pub trait Scope {
    /// Value bound to `name`, innermost scope first.
    fn binding(&self, name: &str) -> Option<&Binding>;
}

impl Expr {
    /// A literal.
    #[must_use]
    pub fn lit(value: impl Into<Value>) -> Self {
        Self::Literal(value.into())
    }

    /// A reference to `path`, such as `e.salary`.
    #[must_use]
    pub fn reference(path: impl Into<String>) -> Self {
        Self::Ref(path.into())
    }

    /// An arithmetic expression.
    #[must_use]
    pub fn binary(op: BinaryOp, lhs: Self, rhs: Self) -> Self {
        Self::Binary {
            op,
            lhs: Box::new(lhs),
            rhs: Box::new(rhs),
        }
    }

    /// A comparison.
    #[must_use]
    pub fn compare(op: CompareOp, lhs: Self, rhs: Self) -> Self {
        Self::Compare {
            op,
            lhs: Box::new(lhs),
            rhs: Box::new(rhs),
        }
    }

    /// Shorthand for an `Eq` comparison.
    #[must_use]
    pub fn eq(lhs: Self, rhs: Self) -> Self {
        Self::compare(CompareOp::Eq, lhs, rhs)
    }

    /// An aggregate over `arg`.
    #[must_use]
    pub fn aggregate(func: AggregateFn, arg: Self) -> Self {
        Self::Aggregate {
            func,
            arg: Some(Box::new(arg)),
        }
    }

    /// `count()` over all rows of a group.
    #[must_use]
    pub fn count() -> Self {
        Self::Aggregate {
            func: AggregateFn::Count,
            arg: None,
        }
    }

    /// Returns true if an aggregate appears anywhere in the tree.
    #[must_use]
    pub fn contains_aggregate(&self) -> bool {
        match self {
            Self::Aggregate { .. } => true,
            Self::Literal(_) | Self::Ref(_) => false,
            Self::List(items) | Self::And(items) | Self::Or(items) => items.iter().any(Self::contains_aggregate),
            Self::Binary { lhs, rhs, .. } | Self::Compare { lhs, rhs, .. } => {
                lhs.contains_aggregate() || rhs.contains_aggregate()
            }
            Self::Not(inner) => inner.contains_aggregate(),
        }
    }

    /// Evaluates against `scope`.
    ///
    /// # Errors
    /// `UnboundReference` for unknown paths, `TypeMismatch` for bad operands,
    /// `DivisionByZero`, and `InvalidPattern` for an aggregate outside `@into`.
    pub fn eval(&self, scope: &dyn Scope) -> KyroResult<Value> {
        match self {
            Self::Literal(v) => Ok(v.clone()),
            Self::Ref(path) => resolve_ref(scope, path),
            Self::List(items) => Ok(Value::List(
                items.iter().map(|e| e.eval(scope)).collect::<KyroResult<_>>()?,
            )),
            Self::Binary { op, lhs, rhs } => arithmetic(*op, &lhs.eval(scope)?, &rhs.eval(scope)?),
            Self::Compare { op, lhs, rhs } => Ok(Value::Bool(op.apply(&lhs.eval(scope)?, &rhs.eval(scope)?)?)),
            Self::And(items) => {
                for e in items {
                    if !e.eval(scope)?.is_truthy() {
                        return Ok(Value::Bool(false));
                    }
                }
                Ok(Value::Bool(true))
            }
            Self::Or(items) => {
                for e in items {
                    if e.eval(scope)?.is_truthy() {
                        return Ok(Value::Bool(true));
                    }
                }
                Ok(Value::Bool(false))
            }
            Self::Not(inner) => Ok(Value::Bool(!inner.eval(scope)?.is_truthy())),
            Self::Aggregate { .. } => Err(EvalError::InvalidPattern {
                reason: "aggregate functions are only allowed in @into".to_string(),
            }
            .into()),
        }
    }
}

fn resolve_ref(scope: &dyn Scope, path: &str) -> KyroResult<Value> {
    let (head, attr) = match path.split_once('.') {
        Some((h, a)) => (h, Some(a)),
        None => (path, None),
    };
    let binding = scope.binding(head).ok_or_else(|| EvalError::UnboundReference {
        name: path.to_string(),
    })?;

    match (binding, attr) {
        (Binding::Value(v), None) => Ok(v.clone()),
        (Binding::Value(Value::Null), Some(_)) => Ok(Value::Null),
        (Binding::Instance(inst), None) => Ok(inst.id().cloned().unwrap_or(Value::Null)),
        (Binding::Instance(inst), Some(a)) => Ok(inst.get(a).cloned().unwrap_or(Value::Null)),
        (Binding::Instances(list), attr) => Ok(Value::List(
            list.iter()
                .map(|i| match attr {
                    Some(a) => i.get(a).cloned().unwrap_or(Value::Null),
                    None => i.id().cloned().unwrap_or(Value::Null),
                })
                .collect(),
        )),
        (Binding::Row(row), Some(col)) => Ok(row.get(col).cloned().unwrap_or(Value::Null)),
        (Binding::Rows(rows), Some(col)) => Ok(Value::List(
            rows.iter()
                .map(|r| r.get(col).cloned().unwrap_or(Value::Null))
                .collect(),
        )),
        (other, _) => Err(EvalError::TypeMismatch {
            context: path.to_string(),
            expected: if attr.is_some() { "instance" } else { "value" }.to_string(),
            actual: other.kind().to_string(),
        }
        .into()),
    }
}

fn arithmetic(op: BinaryOp, lhs: &Value, rhs: &Value) -> KyroResult<Value> {
    if lhs.is_null() || rhs.is_null() {
        return Ok(Value::Null);
    }

    if let (BinaryOp::Add, Value::String(a), Value::String(b)) = (op, lhs, rhs) {
        return Ok(Value::String(format!("{a}{b}")));
    }

    let mismatch = |v: &Value| EvalError::TypeMismatch {
        context: format!("{op:?}").to_lowercase(),
        expected: "number".to_string(),
        actual: v.type_name().to_string(),
    };
    if !lhs.is_numeric() {
        return Err(mismatch(lhs).into());
    }
    if !rhs.is_numeric() {
        return Err(mismatch(rhs).into());
    }

    if let (Value::Int(a), Value::Int(b)) = (lhs, rhs) {
        let overflow = || EvalError::InvalidPattern {
            reason: format!("integer overflow in {a} {op:?} {b}"),
        };
        return Ok(Value::Int(match op {
            BinaryOp::Add => a.checked_add(*b).ok_or_else(overflow)?,
            BinaryOp::Sub => a.checked_sub(*b).ok_or_else(overflow)?,
            BinaryOp::Mul => a.checked_mul(*b).ok_or_else(overflow)?,
            BinaryOp::Div => {
                if *b == 0 {
                    return Err(EvalError::DivisionByZero.into());
                }
                match a.checked_rem(*b) {
                    Some(0) => a.checked_div(*b).ok_or_else(overflow)?,
                    Some(_) => {
                        #[allow(clippy::cast_precision_loss)]
                        let quotient = *a as f64 / *b as f64;
                        return Ok(Value::Float(quotient));
                    }
                    None => return Err(overflow().into()),
                }
            }
        }));
    }

    let (a, b) = match (lhs.as_float(), rhs.as_float()) {
        (Some(a), Some(b)) => (a, b),
        _ => return Err(mismatch(lhs).into()),
    };
    Ok(Value::Float(match op {
        BinaryOp::Add => a + b,
        BinaryOp::Sub => a - b,
        BinaryOp::Mul => a * b,
        BinaryOp::Div => {
            if b == 0.0 {
                return Err(EvalError::DivisionByZero.into());
            }
            a / b
        }
    }))
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    use crate::error::KyroError;
    use crate::instance::{Attributes, Instance};

    struct MapScope(HashMap<String, Binding>);

    impl Scope for MapScope {
        fn binding(&self, name: &str) -> Option<&Binding> {
            self.0.get(name)
        }
    }

    fn scope() -> MapScope {
        let mut attrs = Attributes::new();
        attrs.insert("id".to_string(), Value::Int(7));
        attrs.insert("salary".to_string(), Value::Float(1500.0));
        let mut map = HashMap::new();
        map.insert("e".to_string(), Binding::Instance(Instance::new("Employee", "id", attrs)));
        map.insert("n".to_string(), Binding::Value(Value::Int(3)));
        map.insert("nothing".to_string(), Binding::Value(Value::Null));
        MapScope(map)
    }

    #[test]
    fn test_references() {
        let s = scope();
        assert_eq!(Expr::reference("e").eval(&s).unwrap(), Value::Int(7));
        assert_eq!(Expr::reference("e.salary").eval(&s).unwrap(), Value::Float(1500.0));
        assert_eq!(Expr::reference("e.missing").eval(&s).unwrap(), Value::Null);
        assert_eq!(Expr::reference("nothing.name").eval(&s).unwrap(), Value::Null);
        let err = Expr::reference("ghost").eval(&s).unwrap_err();
        assert!(matches!(err, KyroError::Evaluation(EvalError::UnboundReference { .. })));
    }

    #[test]
    fn test_arithmetic() {
        let s = scope();
        let e = Expr::binary(BinaryOp::Mul, Expr::reference("e.salary"), Expr::reference("n"));
        assert_eq!(e.eval(&s).unwrap(), Value::Float(4500.0));
        assert_eq!(
            Expr::binary(BinaryOp::Div, Expr::lit(7), Expr::lit(2)).eval(&s).unwrap(),
            Value::Float(3.5)
        );
        assert_eq!(
            Expr::binary(BinaryOp::Div, Expr::lit(8), Expr::lit(2)).eval(&s).unwrap(),
            Value::Int(4)
        );
        assert_eq!(
            Expr::binary(BinaryOp::Add, Expr::lit("a"), Expr::lit("b")).eval(&s).unwrap(),
            Value::from("ab")
        );
        let err = Expr::binary(BinaryOp::Div, Expr::lit(1), Expr::lit(0)).eval(&s).unwrap_err();
        assert_eq!(err, KyroError::Evaluation(EvalError::DivisionByZero));
    }

    #[test]
    fn test_logic_short_circuits() {
        let s = scope();
        let cond = Expr::And(vec![
            Expr::compare(CompareOp::Gt, Expr::reference("n"), Expr::lit(1)),
            Expr::Not(Box::new(Expr::eq(Expr::reference("e"), Expr::lit(8)))),
        ]);
        assert_eq!(cond.eval(&s).unwrap(), Value::Bool(true));
        // The unbound right side is never evaluated.
        let or = Expr::Or(vec![Expr::lit(true), Expr::reference("ghost")]);
        assert_eq!(or.eval(&s).unwrap(), Value::Bool(true));
    }

    #[test]
    fn test_aggregate_outside_projection() {
        assert!(Expr::count().contains_aggregate());
        assert!(Expr::count().eval(&scope()).is_err());
    }
}
