use deriva::database::Database;
use deriva::diff::Diff;
use deriva::fact::{Fact, Value};
use deriva::query::{AggregateFn, Query, SortKey, Term};

fn person(name: &str, department: &str, hours: i64) -> Fact {
    Fact::new()
        .with("name", name)
        .with("department", department)
        .with("hours", hours)
}

fn seed(db: &Database, order: &[(&str, &str, i64)]) {
    let mut diff = Diff::new();
    for (name, department, hours) in order {
        diff.add("person", person(name, department, *hours));
    }
    db.apply_diff(diff).unwrap();
}

fn headcount_query() -> Query {
    let mut q = Query::new("headcount");
    q.select("p", "person", vec![])
        .group(vec![Term::bound("p", "department")])
        .aggregate("people", AggregateFn::Count, None)
        .aggregate(
            "total",
            AggregateFn::Sum,
            Some(Term::bound("p", "hours")),
        )
        .aggregate(
            "average",
            AggregateFn::Average,
            Some(Term::bound("p", "hours")),
        );
    q
}

const STAFF: [(&str, &str, i64); 5] = [
    ("Alice", "research", 10),
    ("Bob", "research", 20),
    ("Carl", "research", 30),
    ("Dana", "sales", 5),
    ("Erin", "sales", 15),
];

#[test]
fn grouped_aggregates_fold_each_group() {
    let db = Database::default();
    seed(&db, &STAFF);
    let out = db.exec_query(&mut headcount_query()).unwrap();
    assert_eq!(out.unprojected.len(), 2, "one row per department");

    let research = &out.unprojected[0];
    assert_eq!(research.bound("p", "department"), Some(&Value::from("research")));
    assert_eq!(research.named("people"), Some(&Value::from(3)));
    assert_eq!(research.named("total"), Some(&Value::from(60)));
    assert_eq!(research.named("average"), Some(&Value::from(20.0)));

    let sales = &out.unprojected[1];
    assert_eq!(sales.bound("p", "department"), Some(&Value::from("sales")));
    assert_eq!(sales.named("people"), Some(&Value::from(2)));
    assert_eq!(sales.named("total"), Some(&Value::from(20)));
    assert_eq!(sales.named("average"), Some(&Value::from(10.0)));
}

#[test]
fn aggregation_ignores_insertion_order() {
    let forward = Database::default();
    seed(&forward, &STAFF);
    let mut reversed_staff = STAFF;
    reversed_staff.reverse();
    let backward = Database::default();
    seed(&backward, &reversed_staff);

    let a = forward.exec_query(&mut headcount_query()).unwrap();
    let b = backward.exec_query(&mut headcount_query()).unwrap();
    assert_eq!(a.unprojected.len(), b.unprojected.len());
    for (x, y) in a.unprojected.iter().zip(b.unprojected.iter()) {
        assert_eq!(x.bound("p", "department"), y.bound("p", "department"));
        assert_eq!(x.named("people"), y.named("people"));
        assert_eq!(x.named("total"), y.named("total"));
    }
}

#[test]
fn sort_limit_offset_and_ordinal() {
    let db = Database::default();
    seed(&db, &STAFF);
    let mut q = Query::new("busiest");
    q.select("p", "person", vec![])
        .sort(vec![SortKey {
            term: Term::bound("p", "hours"),
            descending: true,
        }])
        .offset(1)
        .limit(2)
        .ordinal("rank");
    let out = db.exec_query(&mut q).unwrap();
    assert_eq!(out.unprojected.len(), 2);
    // Hours desc are 30, 20, 15, 10, 5; offset 1 and limit 2 keep 20 and 15.
    assert_eq!(out.unprojected[0].bound("p", "hours"), Some(&Value::from(20)));
    assert_eq!(out.unprojected[1].bound("p", "hours"), Some(&Value::from(15)));
    assert_eq!(out.unprojected[0].named("rank"), Some(&Value::from(1)));
    assert_eq!(out.unprojected[1].named("rank"), Some(&Value::from(2)));
}

#[test]
fn per_group_limit_caps_each_group() {
    let db = Database::default();
    seed(&db, &STAFF);
    let mut q = Query::new("top_per_department");
    q.select("p", "person", vec![])
        .group(vec![Term::bound("p", "department")])
        .sort(vec![SortKey {
            term: Term::bound("p", "hours"),
            descending: true,
        }])
        .limit_per_group(1);
    let out = db.exec_query(&mut q).unwrap();
    assert_eq!(out.unprojected.len(), 2);
    assert_eq!(out.unprojected[0].bound("p", "hours"), Some(&Value::from(30)));
    assert_eq!(out.unprojected[1].bound("p", "hours"), Some(&Value::from(15)));
}

#[test]
fn per_group_limit_bounds_the_fold() {
    let db = Database::default();
    seed(&db, &STAFF);
    let mut q = Query::new("capped_headcount");
    q.select("p", "person", vec![])
        .group(vec![Term::bound("p", "department")])
        .aggregate("people", AggregateFn::Count, None)
        .limit_per_group(2);
    let out = db.exec_query(&mut q).unwrap();
    assert_eq!(out.unprojected.len(), 2);
    assert_eq!(out.unprojected[0].named("people"), Some(&Value::from(2)));
    assert_eq!(out.unprojected[1].named("people"), Some(&Value::from(2)));
}

#[test]
fn group_offset_and_limit_count_groups_when_aggregating() {
    let db = Database::default();
    seed(&db, &STAFF);
    let mut q = Query::new("second_department");
    q.select("p", "person", vec![])
        .group(vec![Term::bound("p", "department")])
        .aggregate("people", AggregateFn::Count, None)
        .offset(1);
    let out = db.exec_query(&mut q).unwrap();
    assert_eq!(out.unprojected.len(), 1);
    assert_eq!(out.unprojected[0].bound("p", "department"), Some(&Value::from("sales")));
}

#[test]
fn unfoldable_groups_drop_out_without_failing_the_diff() {
    let db = Database::default();
    seed(&db, &STAFF);
    let mut q = Query::new("hours_by_department");
    q.select("p", "person", vec![])
        .group(vec![Term::bound("p", "department")])
        .aggregate("total", AggregateFn::Sum, Some(Term::bound("p", "hours")))
        .project(vec![
            ("department", Term::bound("p", "department")),
            ("total", Term::named("total")),
        ]);
    db.as_view(q).unwrap();
    assert_eq!(db.len("hours_by_department").unwrap(), 2);

    // Valid fact, but its hours cannot be summed.
    let mut diff = Diff::new();
    diff.add(
        "person",
        Fact::new()
            .with("name", "Fred")
            .with("department", "sales")
            .with("hours", "n/a"),
    );
    db.apply_diff(diff).unwrap();
    assert_eq!(db.len("person").unwrap(), 6);

    let rows = db.rows("hours_by_department").unwrap();
    assert_eq!(rows.len(), 1, "the unsummable group emits no row");
    assert_eq!(rows[0].get("department"), Some(&Value::from("research")));
    assert_eq!(rows[0].get("total"), Some(&Value::from(60)));
}

#[test]
fn custom_aggregates_run_in_direct_execution() {
    let db = Database::default();
    seed(&db, &STAFF);
    let spread = AggregateFn::Custom {
        label: "spread".to_owned(),
        fold: std::sync::Arc::new(|values: &[Value]| {
            let hours: Vec<i64> = values
                .iter()
                .filter_map(|v| match v {
                    Value::Int(i) => Some(*i),
                    _ => None,
                })
                .collect();
            let max = hours.iter().max().copied().unwrap_or(0);
            let min = hours.iter().min().copied().unwrap_or(0);
            Value::Int(max - min)
        }),
    };
    let mut q = Query::new("hour_spread");
    q.select("p", "person", vec![])
        .group(vec![Term::bound("p", "department")])
        .aggregate("spread", spread, Some(Term::bound("p", "hours")));
    let out = db.exec_query(&mut q).unwrap();
    assert_eq!(out.unprojected[0].named("spread"), Some(&Value::from(20)));
    assert_eq!(out.unprojected[1].named("spread"), Some(&Value::from(10)));
}
