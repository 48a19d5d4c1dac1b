use deriva::database::Database;
use deriva::diff::Diff;
use deriva::error::DerivaError;
use deriva::fact::{Fact, Value};
use deriva::query::{CalcFn, Query, Term};

fn setup() -> Database {
    let db = Database::default();
    let mut diff = Diff::new();
    diff.add(
        "person",
        Fact::new().with("name", "Alice").with("age", 42).with("city", "berlin"),
    );
    diff.add(
        "person",
        Fact::new().with("name", "Bob").with("age", 17).with("city", "lisbon"),
    );
    diff.add(
        "city",
        Fact::new().with("name", "berlin").with("country", "germany"),
    );
    diff.add(
        "city",
        Fact::new().with("name", "lisbon").with("country", "portugal"),
    );
    db.apply_diff(diff).unwrap();
    db
}

#[test]
fn join_binds_fields_across_stages() {
    let db = setup();
    let mut q = Query::new("located");
    q.select("p", "person", vec![])
        .select("c", "city", vec![("name", Term::bound("p", "city"))]);
    let out = db.exec_query(&mut q).unwrap();
    assert_eq!(out.unprojected.len(), 2);
    let alice = out
        .unprojected
        .iter()
        .find(|r| r.bound("p", "name") == Some(&Value::from("Alice")))
        .expect("a binding path for Alice");
    assert_eq!(alice.bound("c", "country"), Some(&Value::from("germany")));
}

#[test]
fn constant_constraints_narrow_the_join() {
    let db = setup();
    let mut q = Query::new("berliners");
    q.select("p", "person", vec![("city", Term::value("berlin"))]);
    let out = db.exec_query(&mut q).unwrap();
    assert_eq!(out.unprojected.len(), 1);
    assert_eq!(
        out.unprojected[0].bound("p", "name"),
        Some(&Value::from("Alice"))
    );
}

#[test]
fn calculations_bind_named_results() {
    let db = setup();
    let mut q = Query::new("next_year");
    q.select("p", "person", vec![("name", Term::value("Alice"))])
        .calculate(
            "next_age",
            CalcFn::Add,
            vec![Term::bound("p", "age"), Term::value(1)],
        );
    let out = db.exec_query(&mut q).unwrap();
    assert_eq!(out.unprojected.len(), 1);
    assert_eq!(out.unprojected[0].named("next_age"), Some(&Value::from(43)));
}

#[test]
fn filters_gate_binding_paths() {
    let db = setup();
    let mut q = Query::new("grown");
    q.select("p", "person", vec![]).calculate(
        "of_age",
        CalcFn::Gte,
        vec![Term::bound("p", "age"), Term::value(18)],
    );
    let out = db.exec_query(&mut q).unwrap();
    assert_eq!(out.unprojected.len(), 1);
    assert_eq!(
        out.unprojected[0].bound("p", "name"),
        Some(&Value::from("Alice"))
    );
}

#[test]
fn remainder_overflow_fails_the_path() {
    let db = Database::default();
    let mut diff = Diff::new();
    diff.add("sample", Fact::new().with("a", i64::MIN).with("b", -1));
    diff.add("sample", Fact::new().with("a", 7).with("b", 3));
    diff.add("sample", Fact::new().with("a", 7).with("b", 0));
    db.apply_diff(diff).unwrap();
    let mut q = Query::new("rem");
    q.select("s", "sample", vec![]).calculate(
        "r",
        CalcFn::Remainder,
        vec![Term::bound("s", "a"), Term::bound("s", "b")],
    );
    // i64::MIN % -1 overflows and % 0 is undefined; both paths drop.
    let out = db.exec_query(&mut q).unwrap();
    assert_eq!(out.unprojected.len(), 1);
    assert_eq!(out.unprojected[0].named("r"), Some(&Value::from(1)));
}

#[test]
fn negated_filter_is_the_logical_inverse() {
    let db = setup();
    let mut q = Query::new("minors");
    q.select("p", "person", vec![]).calculate_negated(
        "of_age",
        CalcFn::Gte,
        vec![Term::bound("p", "age"), Term::value(18)],
    );
    let out = db.exec_query(&mut q).unwrap();
    assert_eq!(out.unprojected.len(), 1);
    assert_eq!(
        out.unprojected[0].bound("p", "name"),
        Some(&Value::from("Bob"))
    );
}

#[test]
fn projection_dedups_by_content() {
    let db = setup();
    // Both people project down to a single constant row.
    let mut q = Query::new("constant");
    q.select("p", "person", vec![])
        .project(vec![("kind", Term::value("human"))]);
    let out = db.exec_query(&mut q).unwrap();
    assert_eq!(out.unprojected.len(), 2);
    assert_eq!(out.results.len(), 1, "set semantics over projected rows");
}

#[test]
fn unknown_alias_is_rejected_at_compile() {
    let db = setup();
    let mut q = Query::new("broken");
    q.select("p", "person", vec![])
        .select("c", "city", vec![("name", Term::bound("q", "city"))]);
    match db.exec_query(&mut q) {
        Err(DerivaError::UnknownAlias { alias }) => assert_eq!(alias, "q"),
        other => panic!("expected UnknownAlias, got {:?}", other.map(|o| o.results)),
    }
}

#[test]
fn forward_references_are_unbound() {
    let db = setup();
    let mut q = Query::new("broken");
    q.select("p", "person", vec![("city", Term::bound("c", "name"))])
        .select("c", "city", vec![]);
    assert!(matches!(
        db.exec_query(&mut q),
        Err(DerivaError::UnboundVariable { .. })
    ));
}

#[test]
fn negated_aliases_bind_nothing() {
    let db = setup();
    let mut q = Query::new("broken");
    q.select("p", "person", vec![])
        .deselect("c", "city", vec![("name", Term::bound("p", "city"))])
        .calculate(
            "echo",
            CalcFn::Concat,
            vec![Term::bound("c", "country")],
        );
    assert!(matches!(
        db.exec_query(&mut q),
        Err(DerivaError::UnboundVariable { .. })
    ));
}

#[test]
fn schema_violations_name_the_field() {
    let db = setup();
    db.add_table("typed", Some(vec!["a".to_owned()])).unwrap();
    let mut q = Query::new("broken");
    q.select("t", "typed", vec![("b", Term::value(1))]);
    match db.exec_query(&mut q) {
        Err(DerivaError::SchemaField { table, field }) => {
            assert_eq!(table, "typed");
            assert_eq!(field, "b");
        }
        other => panic!("expected SchemaField, got {:?}", other.map(|o| o.results)),
    }

    let mut diff = Diff::new();
    diff.add("typed", Fact::new().with("b", 1));
    assert!(matches!(
        db.apply_diff(diff),
        Err(DerivaError::SchemaField { .. })
    ));
}

#[test]
fn empty_sort_and_group_are_invalid() {
    let db = setup();
    let mut q = Query::new("broken");
    q.select("p", "person", vec![]).sort(vec![]);
    assert!(matches!(
        db.exec_query(&mut q),
        Err(DerivaError::InvalidQuery(_))
    ));

    let mut q = Query::new("broken");
    q.select("p", "person", vec![]).group(vec![]);
    assert!(matches!(
        db.exec_query(&mut q),
        Err(DerivaError::InvalidQuery(_))
    ));
}

#[test]
fn per_group_limits_require_groups() {
    let db = setup();
    let mut q = Query::new("broken");
    q.select("p", "person", vec![]).limit_per_group(1);
    assert!(matches!(
        db.exec_query(&mut q),
        Err(DerivaError::InvalidQuery(_))
    ));
}

#[test]
fn non_filter_calculations_cannot_be_negated() {
    let db = setup();
    let mut q = Query::new("broken");
    q.select("p", "person", vec![]).calculate_negated(
        "sum",
        CalcFn::Add,
        vec![Term::bound("p", "age"), Term::value(1)],
    );
    assert!(matches!(
        db.exec_query(&mut q),
        Err(DerivaError::InvalidQuery(_))
    ));
}
