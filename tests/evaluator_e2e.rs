use kyrostore::eval::{AggregateFn, BinaryOp, CrudPattern, Environment, Expr, JoinKind, Statement};
use kyrostore::resolver::CompareOp;
use kyrostore::schema::{Attribute, AttributeType, EntityType, Schema};
use kyrostore::{EvalError, EvalResult, KyroError, Runtime, Value};

fn staff_runtime() -> Runtime {
    let mut builder = Schema::builder();
    builder
        .define_entity(
            EntityType::new("Dept")
                .attribute(Attribute::new("name", AttributeType::String).id())
                .attribute(Attribute::new("floor", AttributeType::Int)),
        )
        .unwrap()
        .define_entity(
            EntityType::new("Employee")
                .attribute(Attribute::new("id", AttributeType::Int).id())
                .attribute(Attribute::new("name", AttributeType::String))
                .attribute(Attribute::new("dept", AttributeType::String))
                .attribute(Attribute::new("salary", AttributeType::Float)),
        )
        .unwrap();
    Runtime::new(builder.build())
}

fn employee(id: i64, name: &str, dept: &str, salary: f64) -> Statement {
    Statement::crud(
        CrudPattern::new("Employee")
            .set("id", Expr::lit(id))
            .set("name", Expr::lit(name))
            .set("dept", Expr::lit(dept))
            .set("salary", Expr::lit(salary)),
    )
}

fn dept(name: &str, floor: i64) -> Statement {
    Statement::crud(
        CrudPattern::new("Dept")
            .set("name", Expr::lit(name))
            .set("floor", Expr::lit(floor)),
    )
}

async fn seeded() -> (Runtime, Environment) {
    let runtime = staff_runtime();
    let mut env = Environment::new();
    runtime
        .evaluate_all(
            &[
                dept("eng", 3),
                dept("hr", 1),
                employee(1, "ada", "eng", 100.0),
                employee(2, "bob", "eng", 80.0),
                employee(3, "cy", "ops", 50.0),
            ],
            &mut env,
        )
        .await
        .unwrap();
    (runtime, env)
}

fn all_employees() -> Statement {
    Statement::crud(CrudPattern::query("Employee"))
}

fn names(result: &EvalResult) -> Vec<Value> {
    result.rows().iter().map(|r| r["name"].clone()).collect()
}

#[tokio::test]
async fn group_by_aggregates_and_orders_by_projection() {
    let (runtime, mut env) = seeded().await;
    let stmt = all_employees()
        .group_by(Expr::reference("Employee.dept"))
        .into_column("dept", Expr::reference("Employee.dept"))
        .into_column("headcount", Expr::count())
        .into_column("payroll", Expr::aggregate(AggregateFn::Sum, Expr::reference("Employee.salary")))
        .order_by(Expr::reference("payroll"), true);

    let result = runtime.evaluate(&stmt, &mut env).await.unwrap();
    let rows = result.rows();
    assert_eq!(rows.len(), 2);
    assert_eq!(rows[0]["dept"], Value::from("eng"));
    assert_eq!(rows[0]["headcount"], Value::Int(2));
    assert_eq!(rows[0]["payroll"], Value::Float(180.0));
    assert_eq!(rows[1]["dept"], Value::from("ops"));
    assert_eq!(rows[1]["headcount"], Value::Int(1));
}

#[tokio::test]
async fn aggregates_over_nothing_yield_one_row() {
    let runtime = staff_runtime();
    let mut env = Environment::new();
    let stmt = all_employees()
        .into_column("headcount", Expr::count())
        .into_column("top", Expr::aggregate(AggregateFn::Max, Expr::reference("Employee.salary")));

    let result = runtime.evaluate(&stmt, &mut env).await.unwrap();
    assert_eq!(result.rows().len(), 1);
    assert_eq!(result.rows()[0]["headcount"], Value::Int(0));
    assert_eq!(result.rows()[0]["top"], Value::Null);
}

#[tokio::test]
async fn outer_joins_pad_the_missing_side() {
    let (runtime, mut env) = seeded().await;
    let on = Expr::eq(Expr::reference("Employee.dept"), Expr::reference("d.name"));
    let project = |stmt: Statement| {
        stmt.into_column("name", Expr::reference("Employee.name"))
            .into_column("floor", Expr::reference("d.floor"))
            .order_by(Expr::reference("name"), false)
    };

    let inner = project(all_employees().join(JoinKind::Inner, "Dept", Some("d"), on.clone()));
    let result = runtime.evaluate(&inner, &mut env).await.unwrap();
    assert_eq!(names(&result), vec![Value::from("ada"), Value::from("bob")]);
    assert!(result.rows().iter().all(|r| r["floor"] == Value::Int(3)));

    let left = project(all_employees().join(JoinKind::Left, "Dept", Some("d"), on.clone()));
    let result = runtime.evaluate(&left, &mut env).await.unwrap();
    assert_eq!(result.len(), 3);
    assert_eq!(result.rows()[2]["name"], Value::from("cy"));
    assert_eq!(result.rows()[2]["floor"], Value::Null);

    // hr has nobody; it shows up with a null employee side.
    let full = project(all_employees().join(JoinKind::Full, "Dept", Some("d"), on));
    let result = runtime.evaluate(&full, &mut env).await.unwrap();
    assert_eq!(result.len(), 4);
    assert_eq!(result.rows()[0]["name"], Value::Null);
    assert_eq!(result.rows()[0]["floor"], Value::Int(1));
}

#[tokio::test]
async fn join_without_projection_is_rejected() {
    let (runtime, mut env) = seeded().await;
    let stmt = all_employees().join(
        JoinKind::Inner,
        "Dept",
        None,
        Expr::eq(Expr::reference("Employee.dept"), Expr::reference("Dept.name")),
    );
    let err = runtime.evaluate(&stmt, &mut env).await.unwrap_err();
    assert!(matches!(err, KyroError::Evaluation(EvalError::InvalidPattern { .. })));
}

#[tokio::test]
async fn where_order_and_pagination_keep_instances() {
    let (runtime, mut env) = seeded().await;
    let stmt = all_employees()
        .where_(Expr::compare(
            CompareOp::Gt,
            Expr::reference("Employee.salary"),
            Expr::lit(60.0),
        ))
        .order_by(Expr::reference("Employee.salary"), true)
        .offset(1)
        .limit(1);

    let result = runtime.evaluate(&stmt, &mut env).await.unwrap();
    assert_eq!(result.len(), 1);
    assert_eq!(result.instances()[0].get("name"), Some(&Value::from("bob")));
}

#[tokio::test]
async fn distinct_collapses_equal_rows() {
    let (runtime, mut env) = seeded().await;
    let stmt = all_employees()
        .into_column("dept", Expr::reference("Employee.dept"))
        .distinct()
        .order_by(Expr::reference("dept"), false);

    let result = runtime.evaluate(&stmt, &mut env).await.unwrap();
    let depts: Vec<Value> = result.rows().iter().map(|r| r["dept"].clone()).collect();
    assert_eq!(depts, vec![Value::from("eng"), Value::from("ops")]);
}

#[tokio::test]
async fn upsert_replaces_instead_of_duplicating() {
    let (runtime, mut env) = seeded().await;

    let err = runtime
        .evaluate(&employee(2, "bob", "ops", 90.0), &mut env)
        .await
        .unwrap_err();
    assert!(err.is_resolver());

    runtime
        .evaluate(&employee(2, "bob", "ops", 90.0).upsert(), &mut env)
        .await
        .unwrap();
    let bob = runtime
        .evaluate(
            &Statement::crud(CrudPattern::query("Employee").filter("id", Expr::lit(2))),
            &mut env,
        )
        .await
        .unwrap();
    assert_eq!(bob.len(), 1);
    assert_eq!(bob.instances()[0].get("dept"), Some(&Value::from("ops")));
    assert_eq!(runtime.evaluate(&all_employees(), &mut env).await.unwrap().len(), 3);
}

#[tokio::test]
async fn for_each_updates_every_match() {
    let (runtime, mut env) = seeded().await;
    let raise = Statement::crud(
        CrudPattern::query("Employee")
            .filter("id", Expr::reference("e.id"))
            .set(
                "salary",
                Expr::binary(BinaryOp::Mul, Expr::reference("e.salary"), Expr::lit(2.0)),
            ),
    );
    let engineers = Statement::crud(CrudPattern::query("Employee").filter("dept", Expr::lit("eng")));

    let raised = runtime
        .evaluate(&Statement::for_each("e", engineers, vec![raise]), &mut env)
        .await
        .unwrap();
    assert_eq!(raised.len(), 2);

    let stmt = all_employees()
        .into_column("payroll", Expr::aggregate(AggregateFn::Sum, Expr::reference("Employee.salary")));
    let result = runtime.evaluate(&stmt, &mut env).await.unwrap();
    assert_eq!(result.rows()[0]["payroll"], Value::Float(410.0));
}

#[tokio::test]
async fn failed_block_leaves_no_trace() {
    let (runtime, mut env) = seeded().await;
    let block = [
        employee(4, "dee", "hr", 70.0),
        Statement::crud(CrudPattern::query("Employee").filter("id", Expr::reference("nobody"))),
    ];

    let err = runtime.evaluate_in_transaction(&block, &mut env).await.unwrap_err();
    assert!(matches!(err, KyroError::Evaluation(EvalError::UnboundReference { .. })));
    assert!(!env.in_transaction());
    assert_eq!(runtime.evaluate(&all_employees(), &mut env).await.unwrap().len(), 3);

    let ok = [employee(4, "dee", "hr", 70.0)];
    runtime.evaluate_in_transaction(&ok, &mut env).await.unwrap();
    assert_eq!(runtime.evaluate(&all_employees(), &mut env).await.unwrap().len(), 4);
}

#[tokio::test]
async fn not_found_handler_supplies_a_default() {
    let (runtime, mut env) = seeded().await;
    let lookup = Statement::crud(CrudPattern::query("Employee").filter("name", Expr::lit("zed")))
        .catch_not_found(vec![Statement::expr(Expr::lit("vacant"))])
        .alias("who");

    let result = runtime.evaluate(&lookup, &mut env).await.unwrap();
    assert_eq!(result, EvalResult::Value(Value::from("vacant")));
    assert!(env.lookup("who").is_some());
}
