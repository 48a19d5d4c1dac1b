use deriva::database::Database;
use deriva::diff::Diff;
use deriva::fact::Fact;
use deriva::query::{Query, Term};

fn person(name: &str, department: &str) -> Fact {
    Fact::new().with("name", name).with("department", department)
}

/// Projects people down to their departments, so several source rows
/// support the same derived row.
fn department_view() -> Query {
    let mut q = Query::new("department");
    q.select("p", "person", vec![])
        .project(vec![("name", Term::bound("p", "department"))]);
    q
}

#[test]
fn support_counts_every_derivation() {
    let db = Database::default();
    let mut diff = Diff::new();
    diff.add("person", person("Alice", "research"));
    diff.add("person", person("Bob", "research"));
    db.apply_diff(diff).unwrap();
    db.as_view(department_view()).unwrap();

    let research = Fact::new().with("name", "research").id();
    assert_eq!(db.len("department").unwrap(), 1);
    assert_eq!(db.support("department", research).unwrap(), 2);
}

#[test]
fn rows_survive_until_the_last_support_goes() {
    let db = Database::default();
    db.as_view(department_view()).unwrap();
    let mut diff = Diff::new();
    diff.add("person", person("Alice", "research"));
    diff.add("person", person("Bob", "research"));
    db.apply_diff(diff).unwrap();

    let research = Fact::new().with("name", "research").id();

    let mut diff = Diff::new();
    diff.remove_fact("person", person("Alice", "research"));
    db.apply_diff(diff).unwrap();
    assert_eq!(db.len("department").unwrap(), 1, "Bob still supports it");
    assert_eq!(db.support("department", research).unwrap(), 1);

    let mut diff = Diff::new();
    diff.remove_fact("person", person("Bob", "research"));
    db.apply_diff(diff).unwrap();
    assert_eq!(db.len("department").unwrap(), 0);
}

#[test]
fn retraction_cascades_through_chained_views() {
    let db = Database::default();
    db.as_view(department_view()).unwrap();
    let mut tagged = Query::new("tagged");
    tagged
        .select("d", "department", vec![])
        .project(vec![
            ("name", Term::bound("d", "name")),
            ("tag", Term::value("unit")),
        ]);
    db.as_view(tagged).unwrap();

    let mut diff = Diff::new();
    diff.add("person", person("Alice", "research"));
    db.apply_diff(diff).unwrap();
    assert_eq!(db.len("tagged").unwrap(), 1);

    let mut diff = Diff::new();
    diff.remove_fact("person", person("Alice", "research"));
    db.apply_diff(diff).unwrap();
    assert_eq!(db.len("department").unwrap(), 0);
    assert_eq!(db.len("tagged").unwrap(), 0);
}

#[test]
fn transitive_support_reaches_base_tables() {
    let db = Database::default();
    db.as_view(department_view()).unwrap();
    let mut diff = Diff::new();
    diff.add("person", person("Alice", "research"));
    db.apply_diff(diff).unwrap();

    let research = Fact::new().with("name", "research").id();
    let alice = person("Alice", "research").id();
    assert!(db.is_supported("person", alice).unwrap(), "base rows are axioms");
    assert!(db.is_supported("department", research).unwrap());

    let mut diff = Diff::new();
    diff.remove_fact("person", person("Alice", "research"));
    db.apply_diff(diff).unwrap();
    assert!(!db.is_supported("department", research).unwrap());
}

#[test]
fn join_provenance_names_every_source_row() {
    let db = Database::default();
    let mut diff = Diff::new();
    diff.add("person", person("Alice", "research"));
    diff.add(
        "department_info",
        Fact::new().with("department", "research").with("floor", 3),
    );
    db.apply_diff(diff).unwrap();

    let mut q = Query::new("located");
    q.select("p", "person", vec![])
        .select(
            "i",
            "department_info",
            vec![("department", Term::bound("p", "department"))],
        )
        .project(vec![
            ("name", Term::bound("p", "name")),
            ("floor", Term::bound("i", "floor")),
        ]);
    let out = db.exec_query(&mut q).unwrap();
    assert_eq!(out.results.len(), 1);
    assert_eq!(out.provenance.len(), 2, "one edge per joined source row");
    let tables: Vec<&str> = out
        .provenance
        .iter()
        .map(|e| e.source_table.as_str())
        .collect();
    assert!(tables.contains(&"person"));
    assert!(tables.contains(&"department_info"));
}
