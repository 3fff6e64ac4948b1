//! In-process result-set modifiers: `@where`, joins, `@groupBy`,
//! `@into`, `@distinct`, `@orderBy`, `@offset` and `@limit`.
//!
//! A query result is first flattened into rows. Each row binds the queried
//! entity name to one instance, each traversed relationship name to one
//! related instance, and each join key to the joined instance. Modifiers run
//! in a fixed order: where, project (with grouping), distinct, order,
//! offset, limit.

use std::cmp::Ordering;
use std::collections::{BTreeMap, HashMap, HashSet};

use crate::error::{EvalError, KyroResult};
use crate::instance::Instance;
use crate::value::Value;

use super::env::{Binding, EvalResult, ProjectedRow};
use super::expr::{AggregateFn, Expr, Scope};
use super::pattern::{Hints, Join, JoinKind, OrderBy};

/// Row of bindings seen by modifier expressions.
pub(crate) type Row = BTreeMap<String, Binding>;

/// Row bindings layered over the statement environment.
struct RowScope<'a> {
    row: &'a Row,
    outer: &'a dyn Scope,
}

impl Scope for RowScope<'_> {
    fn binding(&self, name: &str) -> Option<&Binding> {
        self.row.get(name).or_else(|| self.outer.binding(name))
    }
}

fn eval_in(expr: &Expr, row: &Row, outer: &dyn Scope) -> KyroResult<Value> {
    expr.eval(&RowScope { row, outer })
}

/// One row per instance and combination of related instances. A
/// relationship with no related instances binds `Null`.
pub(crate) fn rows_from_instances(entity: &str, instances: &[Instance]) -> Vec<Row> {
    let mut rows = Vec::with_capacity(instances.len());
    for inst in instances {
        let mut expanded = vec![Row::from([(entity.to_string(), Binding::Instance(inst.clone()))])];
        for (rel, related) in &inst.related {
            if related.is_empty() {
                for row in &mut expanded {
                    row.insert(rel.clone(), Binding::Value(Value::Null));
                }
                continue;
            }
            expanded = expanded
                .into_iter()
                .flat_map(|row| {
                    related.iter().map(move |r| {
                        let mut next = row.clone();
                        next.insert(rel.clone(), Binding::Instance(r.clone()));
                        next
                    })
                })
                .collect();
        }
        rows.extend(expanded);
    }
    rows
}

/// Joins `right` instances onto `rows`, binding each under the join key.
/// Unmatched sides of outer joins are bound to `Null`; `bound` names the
/// left-side keys to pad even when `rows` is empty.
pub(crate) fn join(
    rows: Vec<Row>,
    clause: &Join,
    right: &[Instance],
    bound: &[String],
    outer: &dyn Scope,
) -> KyroResult<Vec<Row>> {
    let key = clause.key().to_string();
    let mut left_keys: Vec<String> = bound.to_vec();
    if let Some(first) = rows.first() {
        left_keys.extend(first.keys().filter(|k| !bound.contains(k)).cloned());
    }
    let mut right_matched = vec![false; right.len()];
    let mut out = Vec::new();

    for row in rows {
        let mut matched = false;
        for (i, inst) in right.iter().enumerate() {
            let mut candidate = row.clone();
            candidate.insert(key.clone(), Binding::Instance(inst.clone()));
            if eval_in(&clause.on, &candidate, outer)?.is_truthy() {
                matched = true;
                right_matched[i] = true;
                out.push(candidate);
            }
        }
        if !matched && matches!(clause.kind, JoinKind::Left | JoinKind::Full) {
            let mut padded = row;
            padded.insert(key.clone(), Binding::Value(Value::Null));
            out.push(padded);
        }
    }

    if matches!(clause.kind, JoinKind::Right | JoinKind::Full) {
        for (inst, _) in right.iter().zip(&right_matched).filter(|(_, m)| !**m) {
            let mut padded: Row = left_keys
                .iter()
                .map(|k| (k.clone(), Binding::Value(Value::Null)))
                .collect();
            padded.insert(key.clone(), Binding::Instance(inst.clone()));
            out.push(padded);
        }
    }
    Ok(out)
}

/// Applies the non-join modifiers of `hints` to `rows`.
///
/// With `@into` the result is projected rows. Without it the rows collapse
/// back to the distinct `entity` instances they came from, which is only
/// meaningful when no join or grouping reshaped them.
pub(crate) fn apply(entity: &str, rows: Vec<Row>, hints: &Hints, outer: &dyn Scope) -> KyroResult<EvalResult> {
    let mut kept = Vec::with_capacity(rows.len());
    for row in rows {
        let keep = match &hints.where_clause {
            Some(cond) => eval_in(cond, &row, outer)?.is_truthy(),
            None => true,
        };
        if keep {
            kept.push(row);
        }
    }

    if hints.into.is_empty() {
        if !hints.joins.is_empty() || !hints.group_by.is_empty() {
            return Err(EvalError::InvalidPattern {
                reason: "@join and @groupBy require an @into projection".to_string(),
            }
            .into());
        }
        let ordered = order(kept, &hints.order_by, |row| row, outer)?;
        let instances = collapse(entity, ordered);
        return Ok(EvalResult::Instances(paginate(instances, hints)));
    }

    let mut projected = project(kept, hints, outer)?;
    if hints.distinct {
        let mut seen = HashSet::new();
        projected.retain(|(p, _)| seen.insert(row_key(p)));
    }
    let ordered = order(projected, &hints.order_by, |(_, scope_row)| scope_row, outer)?;
    let rows = ordered.into_iter().map(|(p, _)| p).collect();
    Ok(EvalResult::Rows(paginate(rows, hints)))
}

fn paginate<T>(items: Vec<T>, hints: &Hints) -> Vec<T> {
    let skip = hints.offset.unwrap_or(0);
    let take = hints.limit.unwrap_or(usize::MAX);
    items.into_iter().skip(skip).take(take).collect()
}

fn collapse(entity: &str, rows: Vec<Row>) -> Vec<Instance> {
    let mut seen = HashSet::new();
    let mut out = Vec::new();
    for row in rows {
        if let Some(Binding::Instance(inst)) = row.get(entity) {
            let key = inst.id_key().unwrap_or_default();
            if seen.insert(key) {
                out.push(inst.clone());
            }
        }
    }
    out
}

fn row_key(row: &ProjectedRow) -> String {
    row.iter()
        .map(|(k, v)| format!("{k}={}:{}", v.type_name(), v.key()))
        .collect::<Vec<_>>()
        .join("\u{1f}")
}

/// Stable sort by the `@orderBy` keys, evaluated once per item.
fn order<T>(
    items: Vec<T>,
    keys: &[OrderBy],
    row_of: impl Fn(&T) -> &Row,
    outer: &dyn Scope,
) -> KyroResult<Vec<T>> {
    if keys.is_empty() {
        return Ok(items);
    }
    let mut keyed = Vec::with_capacity(items.len());
    for item in items {
        let values = keys
            .iter()
            .map(|k| eval_in(&k.expr, row_of(&item), outer))
            .collect::<KyroResult<Vec<_>>>()?;
        keyed.push((values, item));
    }
    keyed.sort_by(|(a, _), (b, _)| {
        for (i, key) in keys.iter().enumerate() {
            let ord = a[i].sort_cmp(&b[i]);
            let ord = if key.descending { ord.reverse() } else { ord };
            if ord != Ordering::Equal {
                return ord;
            }
        }
        Ordering::Equal
    });
    Ok(keyed.into_iter().map(|(_, item)| item).collect())
}

/// Projects rows into `@into` columns. Each output row is paired with the
/// row `@orderBy` is evaluated against: the source row (the first of its
/// group) with the projected columns bound on top.
fn project(rows: Vec<Row>, hints: &Hints, outer: &dyn Scope) -> KyroResult<Vec<(ProjectedRow, Row)>> {
    let grouped = !hints.group_by.is_empty() || hints.into.iter().any(|p| p.expr.contains_aggregate());

    let groups: Vec<Vec<Row>> = if grouped {
        let mut order: Vec<String> = Vec::new();
        let mut buckets: HashMap<String, Vec<Row>> = HashMap::new();
        for row in rows {
            let key = hints
                .group_by
                .iter()
                .map(|e| eval_in(e, &row, outer).map(|v| format!("{}:{}", v.type_name(), v.key())))
                .collect::<KyroResult<Vec<_>>>()?
                .join("\u{1f}");
            let bucket = buckets.entry(key.clone()).or_insert_with(|| {
                order.push(key);
                Vec::new()
            });
            bucket.push(row);
        }
        let mut groups: Vec<Vec<Row>> = order.iter().filter_map(|k| buckets.remove(k)).collect();
        // Aggregates without grouping always yield one row, even over nothing.
        if groups.is_empty() && hints.group_by.is_empty() {
            groups.push(Vec::new());
        }
        groups
    } else {
        rows.into_iter().map(|r| vec![r]).collect()
    };

    let empty = Row::new();
    let mut out = Vec::with_capacity(groups.len());
    for group in &groups {
        let first = group.first().unwrap_or(&empty);
        let mut projected = ProjectedRow::new();
        for column in &hints.into {
            let expr = if grouped {
                substitute_aggregates(&column.expr, group, outer)?
            } else {
                column.expr.clone()
            };
            projected.insert(column.column.clone(), eval_in(&expr, first, outer)?);
        }
        let mut scope_row = first.clone();
        for (k, v) in &projected {
            scope_row.insert(k.clone(), Binding::Value(v.clone()));
        }
        out.push((projected, scope_row));
    }
    Ok(out)
}

fn substitute_aggregates(expr: &Expr, group: &[Row], outer: &dyn Scope) -> KyroResult<Expr> {
    let sub = |e: &Expr| substitute_aggregates(e, group, outer);
    Ok(match expr {
        Expr::Aggregate { func, arg } => Expr::Literal(aggregate(*func, arg.as_deref(), group, outer)?),
        Expr::Literal(_) | Expr::Ref(_) => expr.clone(),
        Expr::List(items) => Expr::List(items.iter().map(sub).collect::<KyroResult<_>>()?),
        Expr::And(items) => Expr::And(items.iter().map(sub).collect::<KyroResult<_>>()?),
        Expr::Or(items) => Expr::Or(items.iter().map(sub).collect::<KyroResult<_>>()?),
        Expr::Not(inner) => Expr::Not(Box::new(sub(inner)?)),
        Expr::Binary { op, lhs, rhs } => Expr::binary(*op, sub(lhs)?, sub(rhs)?),
        Expr::Compare { op, lhs, rhs } => Expr::compare(*op, sub(lhs)?, sub(rhs)?),
    })
}

fn aggregate(func: AggregateFn, arg: Option<&Expr>, group: &[Row], outer: &dyn Scope) -> KyroResult<Value> {
    let Some(arg) = arg else {
        return match func {
            AggregateFn::Count => Ok(Value::Int(i64::try_from(group.len()).unwrap_or(i64::MAX))),
            _ => Err(EvalError::InvalidPattern {
                reason: format!("{func:?} requires an argument").to_lowercase(),
            }
            .into()),
        };
    };

    let mut values = Vec::with_capacity(group.len());
    for row in group {
        let v = eval_in(arg, row, outer)?;
        if !v.is_null() {
            values.push(v);
        }
    }

    match func {
        AggregateFn::Count => Ok(Value::Int(i64::try_from(values.len()).unwrap_or(i64::MAX))),
        AggregateFn::Sum => sum(&values),
        AggregateFn::Avg => {
            if values.is_empty() {
                return Ok(Value::Null);
            }
            let total = sum(&values)?.as_float().unwrap_or(0.0);
            #[allow(clippy::cast_precision_loss)]
            let n = values.len() as f64;
            Ok(Value::Float(total / n))
        }
        AggregateFn::Min => Ok(values.into_iter().min_by(Value::sort_cmp).unwrap_or(Value::Null)),
        AggregateFn::Max => Ok(values.into_iter().max_by(Value::sort_cmp).unwrap_or(Value::Null)),
    }
}

fn sum(values: &[Value]) -> KyroResult<Value> {
    if values.is_empty() {
        return Ok(Value::Null);
    }
    if let Some(bad) = values.iter().find(|v| !v.is_numeric()) {
        return Err(EvalError::TypeMismatch {
            context: "sum".to_string(),
            expected: "number".to_string(),
            actual: bad.type_name().to_string(),
        }
        .into());
    }
    if values.iter().all(Value::is_int) {
        let mut total: i64 = 0;
        for v in values {
            total = total
                .checked_add(v.as_int().unwrap_or(0))
                .ok_or_else(|| EvalError::InvalidPattern {
                    reason: "integer overflow in sum".to_string(),
                })?;
        }
        return Ok(Value::Int(total));
    }
    Ok(Value::Float(values.iter().filter_map(Value::as_float).sum()))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::instance::Attributes;
    use crate::resolver::CompareOp;

    use crate::eval::Projection;

    struct Empty;

    impl Scope for Empty {
        fn binding(&self, _name: &str) -> Option<&Binding> {
            None
        }
    }

    fn emp(id: i64, dept: &str, salary: i64) -> Instance {
        let mut attrs = Attributes::new();
        attrs.insert("id".to_string(), Value::Int(id));
        attrs.insert("dept".to_string(), Value::from(dept));
        attrs.insert("salary".to_string(), Value::Int(salary));
        Instance::new("Employee", "id", attrs)
    }

    fn dept(name: &str, floor: i64) -> Instance {
        let mut attrs = Attributes::new();
        attrs.insert("name".to_string(), Value::from(name));
        attrs.insert("floor".to_string(), Value::Int(floor));
        Instance::new("Dept", "name", attrs)
    }

    fn staff() -> Vec<Instance> {
        vec![emp(1, "eng", 100), emp(2, "ops", 80), emp(3, "eng", 120), emp(4, "hr", 90)]
    }

    fn ids(result: &EvalResult) -> Vec<i64> {
        result.instances().iter().filter_map(|i| i.id().and_then(Value::as_int)).collect()
    }

    #[test]
    fn test_where_order_limit_without_projection() {
        let hints = Hints {
            where_clause: Some(Expr::compare(CompareOp::Ge, Expr::reference("Employee.salary"), Expr::lit(90))),
            order_by: vec![OrderBy {
                expr: Expr::reference("Employee.salary"),
                descending: true,
            }],
            limit: Some(2),
            ..Hints::default()
        };
        let rows = rows_from_instances("Employee", &staff());
        let result = apply("Employee", rows, &hints, &Empty).unwrap();
        assert_eq!(ids(&result), vec![3, 1]);
    }

    #[test]
    fn test_group_by_with_aggregates() {
        let hints = Hints {
            into: vec![
                Projection {
                    column: "dept".to_string(),
                    expr: Expr::reference("Employee.dept"),
                },
                Projection {
                    column: "headcount".to_string(),
                    expr: Expr::count(),
                },
                Projection {
                    column: "total".to_string(),
                    expr: Expr::aggregate(AggregateFn::Sum, Expr::reference("Employee.salary")),
                },
            ],
            group_by: vec![Expr::reference("Employee.dept")],
            order_by: vec![OrderBy {
                expr: Expr::reference("total"),
                descending: true,
            }],
            ..Hints::default()
        };
        let rows = rows_from_instances("Employee", &staff());
        let result = apply("Employee", rows, &hints, &Empty).unwrap();
        let rows = result.rows();
        assert_eq!(rows.len(), 3);
        assert_eq!(rows[0]["dept"], Value::from("eng"));
        assert_eq!(rows[0]["headcount"], Value::Int(2));
        assert_eq!(rows[0]["total"], Value::Int(220));
        assert_eq!(rows[2]["dept"], Value::from("ops"));
    }

    #[test]
    fn test_aggregate_over_nothing_yields_one_row() {
        let hints = Hints {
            into: vec![
                Projection {
                    column: "n".to_string(),
                    expr: Expr::count(),
                },
                Projection {
                    column: "avg".to_string(),
                    expr: Expr::aggregate(AggregateFn::Avg, Expr::reference("Employee.salary")),
                },
            ],
            ..Hints::default()
        };
        let result = apply("Employee", Vec::new(), &hints, &Empty).unwrap();
        assert_eq!(result.rows().len(), 1);
        assert_eq!(result.rows()[0]["n"], Value::Int(0));
        assert_eq!(result.rows()[0]["avg"], Value::Null);
    }

    #[test]
    fn test_left_and_right_joins() {
        let on = Expr::eq(Expr::reference("Employee.dept"), Expr::reference("Dept.name"));
        let depts = vec![dept("eng", 3), dept("ops", 1), dept("legal", 9)];

        let left = Join {
            kind: JoinKind::Left,
            entity: "Dept".to_string(),
            alias: None,
            on: on.clone(),
        };
        let rows = join(rows_from_instances("Employee", &staff()), &left, &depts, &[], &Empty).unwrap();
        assert_eq!(rows.len(), 4);
        let hr = rows
            .iter()
            .find(|r| matches!(r.get("Dept"), Some(Binding::Value(Value::Null))))
            .unwrap();
        assert!(matches!(hr.get("Employee"), Some(Binding::Instance(i)) if i.get("dept") == Some(&Value::from("hr"))));

        let right = Join {
            kind: JoinKind::Right,
            ..left.clone()
        };
        let rows = join(rows_from_instances("Employee", &staff()), &right, &depts, &[], &Empty).unwrap();
        // eng x2, ops x1, plus the unmatched legal department.
        assert_eq!(rows.len(), 4);
        assert!(rows
            .iter()
            .any(|r| matches!(r.get("Employee"), Some(Binding::Value(Value::Null)))));

        let inner = Join {
            kind: JoinKind::Inner,
            ..left
        };
        let rows = join(rows_from_instances("Employee", &staff()), &inner, &depts, &[], &Empty).unwrap();
        assert_eq!(rows.len(), 3);
    }

    #[test]
    fn test_distinct_projection_and_offset() {
        let hints = Hints {
            into: vec![Projection {
                column: "dept".to_string(),
                expr: Expr::reference("Employee.dept"),
            }],
            distinct: true,
            order_by: vec![OrderBy {
                expr: Expr::reference("dept"),
                descending: false,
            }],
            offset: Some(1),
            ..Hints::default()
        };
        let result = apply("Employee", rows_from_instances("Employee", &staff()), &hints, &Empty).unwrap();
        let depts: Vec<_> = result.rows().iter().map(|r| r["dept"].clone()).collect();
        assert_eq!(depts, vec![Value::from("hr"), Value::from("ops")]);
    }

    #[test]
    fn test_group_by_without_projection_rejected() {
        let hints = Hints {
            group_by: vec![Expr::reference("Employee.dept")],
            ..Hints::default()
        };
        assert!(apply("Employee", Vec::new(), &hints, &Empty).is_err());
    }

    #[test]
    fn test_related_instances_expand_rows() {
        let manager = emp(1, "eng", 100).with_related("ReportsTo", vec![emp(2, "eng", 50), emp(3, "eng", 60)]);
        let loner = emp(4, "hr", 90).with_related("ReportsTo", Vec::new());
        let rows = rows_from_instances("Employee", &[manager, loner]);
        assert_eq!(rows.len(), 3);
        assert!(matches!(rows[2].get("ReportsTo"), Some(Binding::Value(Value::Null))));
    }
}
