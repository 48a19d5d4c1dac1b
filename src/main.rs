use deriva::database::Database;
use deriva::diff::Diff;
use deriva::error::Result;
use deriva::fact::Fact;
use deriva::query::{AggregateFn, CalcFn, Query, Term};
use deriva::settings::Settings;
use tracing::info;
use tracing_subscriber::EnvFilter;

/// A small walk-through: base facts in, a filtered view and an aggregate
/// view over it, then a removal to show retraction rippling through.
fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .init();
    let settings = Settings::load().unwrap_or_default();
    let db = Database::new(settings);

    let mut people = Diff::new();
    people
        .add(
            "person",
            Fact::new()
                .with("name", "Alice")
                .with("age", 42)
                .with("department", "research"),
        )
        .add(
            "person",
            Fact::new()
                .with("name", "Bob")
                .with("age", 17)
                .with("department", "research"),
        )
        .add(
            "person",
            Fact::new()
                .with("name", "Carol")
                .with("age", 35)
                .with("department", "sales"),
        );
    db.apply_diff(people)?;

    let mut adults = Query::new("adult");
    adults
        .select("p", "person", vec![])
        .calculate(
            "of_age",
            CalcFn::Gte,
            vec![Term::bound("p", "age"), Term::value(18)],
        )
        .project(vec![
            ("name", Term::bound("p", "name")),
            ("department", Term::bound("p", "department")),
        ]);
    db.as_view(adults)?;

    let mut headcount = Query::new("headcount");
    headcount
        .select("a", "adult", vec![])
        .group(vec![Term::bound("a", "department")])
        .aggregate("people", AggregateFn::Count, None)
        .project(vec![
            ("department", Term::bound("a", "department")),
            ("people", Term::named("people")),
        ]);
    db.as_view(headcount)?;

    info!("initial derivation");
    for fact in db.rows("headcount")? {
        println!("headcount: {}", fact);
    }

    let mut departure = Diff::new();
    departure.remove("person", Fact::new().with("name", "Carol"));
    db.apply_diff(departure)?;

    info!("after Carol left");
    for fact in db.rows("headcount")? {
        println!("headcount: {}", fact);
    }

    db.save_snapshot()?;
    Ok(())
}
