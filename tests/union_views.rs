use deriva::database::Database;
use deriva::diff::Diff;
use deriva::fact::{Fact, Value};
use deriva::union::{MappingTerm, Union};

fn animal_union() -> Union {
    let mut u = Union::new("animal");
    u.source("cat", vec![("name", MappingTerm::field("name"))])
        .source("dog", vec![("name", MappingTerm::field("name"))]);
    u
}

fn setup() -> Database {
    let db = Database::default();
    let mut diff = Diff::new();
    diff.add("cat", Fact::new().with("name", "whiskers"));
    diff.add("dog", Fact::new().with("name", "rex"));
    diff.add("dog", Fact::new().with("name", "whiskers"));
    db.apply_diff(diff).unwrap();
    db
}

#[test]
fn union_coalesces_identical_mapped_rows() {
    let db = setup();
    let out = db.exec_union(&mut animal_union()).unwrap();
    assert_eq!(out.results.len(), 2, "whiskers appears once");
    // The coalesced row carries one provenance instance per source row.
    let whiskers = Fact::new().with("name", "whiskers").id();
    let edges: Vec<_> = out.provenance.iter().filter(|e| e.row == whiskers).collect();
    assert_eq!(edges.len(), 2);
}

#[test]
fn constant_mappings_tag_each_branch() {
    let db = setup();
    let mut u = Union::new("animal");
    u.source(
        "cat",
        vec![
            ("name", MappingTerm::field("name")),
            ("species", MappingTerm::value("cat")),
        ],
    )
    .source(
        "dog",
        vec![
            ("name", MappingTerm::field("name")),
            ("species", MappingTerm::value("dog")),
        ],
    );
    let out = db.exec_union(&mut u).unwrap();
    assert_eq!(out.results.len(), 3, "species keeps the branches apart");
}

#[test]
fn union_views_share_support_across_branches() {
    let db = setup();
    db.union_as_view(animal_union()).unwrap();
    assert_eq!(db.len("animal").unwrap(), 2);

    let whiskers = Fact::new().with("name", "whiskers").id();
    assert_eq!(db.support("animal", whiskers).unwrap(), 2);

    // Losing one source keeps the row alive on the other branch.
    let mut diff = Diff::new();
    diff.remove_fact("cat", Fact::new().with("name", "whiskers"));
    db.apply_diff(diff).unwrap();
    assert_eq!(db.len("animal").unwrap(), 2);
    assert_eq!(db.support("animal", whiskers).unwrap(), 1);

    // Losing the last source retracts it.
    let mut diff = Diff::new();
    diff.remove_fact("dog", Fact::new().with("name", "whiskers"));
    db.apply_diff(diff).unwrap();
    assert_eq!(db.len("animal").unwrap(), 1);
    assert_eq!(db.support("animal", whiskers).unwrap(), 0);
}

#[test]
fn union_views_grow_incrementally() {
    let db = setup();
    db.union_as_view(animal_union()).unwrap();

    let mut diff = Diff::new();
    diff.add("cat", Fact::new().with("name", "misha"));
    db.apply_diff(diff).unwrap();
    let rows = db.rows("animal").unwrap();
    assert_eq!(rows.len(), 3);
    assert!(rows
        .iter()
        .any(|f| f.get("name") == Some(&Value::from("misha"))));
}

#[test]
fn empty_unions_are_rejected() {
    let db = Database::default();
    assert!(db.union_as_view(Union::new("empty")).is_err());
}
