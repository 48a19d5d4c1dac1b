//! Deriva – a miniature incrementally-maintained deductive database.
//!
//! Deriva centers on the *fact* concept: an immutable bag of named values
//! whose identity is a content hash, so the same content is always the
//! same row. Facts live in tables, tables feed declarative queries and
//! unions, and registered views are kept current by a trigger scheduler
//! whenever a [`diff::Diff`] of additions and removals is applied.
//!
//! * A [`fact::Fact`] is an immutable map of field names to
//!   [`fact::Value`]s; its [`fact::FactId`] is derived from its content.
//! * A [`table::Table`] holds facts and builds secondary indexes lazily,
//!   keyed by the field combinations queries actually join on.
//! * A [`diff::Diff`] batches proposed additions and removals; diffs
//!   merge and reverse, and are reconciled against current membership
//!   when applied.
//! * A [`query::Query`] is a pipeline of joins (including anti-joins),
//!   calculations and filters, aggregation with grouping, sorting,
//!   limits, ordinals and a final projection.
//! * A [`union::Union`] maps several source tables into one shape with
//!   set semantics.
//! * The [`provenance::ProvenanceLedger`] remembers which source rows
//!   justify every derived row, so removals retract exactly the rows
//!   that lose all support, transitively.
//!
//! These parts are owned by "keeper" structures and wired together by
//! [`database::Database`], which schedules view maintenance in rounds
//! until a fixpoint. Views defined over views work because a view's
//! output rows are ordinary table changes to the next round.
//!
//! ## Views are facts too
//! `as_view` stores the definition as a fact in the reserved `view`
//! table. The scheduler watches that table like any other, so creating
//! and removing views flows through the same diff mechanism as data,
//! and a snapshot of the base tables alone can rebuild every view.
//!
//! ## Modules
//! * [`fact`] – values, content-addressed facts, derivation instance ids.
//! * [`table`] – tables, lazy indexes, and the table keeper.
//! * [`diff`] – mergeable, reversible change batches.
//! * [`query`] – the declarative pipeline: compile and execute.
//! * [`union`] – mapped set unions over several sources.
//! * [`provenance`] – support-counted derivation bookkeeping.
//! * [`trigger`] – view triggers, per-round change sets, the scheduler's
//!   wake list.
//! * [`database`] – the database itself: diffs in, maintained views out.
//! * [`settings`] – runtime configuration (execution strategy, round
//!   cap, snapshot location).
//! * [`error`] – the crate-wide error type.
//!
//! ## Quick Start
//! ```
//! use deriva::database::Database;
//! use deriva::diff::Diff;
//! use deriva::fact::Fact;
//! use deriva::query::{Query, Term};
//!
//! let db = Database::default();
//! let mut diff = Diff::new();
//! diff.add("person", Fact::new().with("name", "Alice").with("age", 42));
//! diff.add("person", Fact::new().with("name", "Bob").with("age", 17));
//! db.apply_diff(diff).unwrap();
//!
//! let mut by_age = Query::new("by_age");
//! by_age.select("p", "person", vec![("age", Term::value(42))]);
//! let out = db.exec_query(&mut by_age).unwrap();
//! assert_eq!(out.unprojected.len(), 1);
//! ```

pub mod database;
pub mod diff;
pub mod error;
pub mod fact;
pub mod provenance;
pub mod query;
pub mod settings;
pub mod table;
pub mod trigger;
pub mod union;
