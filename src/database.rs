use std::collections::{HashMap, HashSet};
use std::fs;
use std::sync::{Arc, Mutex, MutexGuard};

use chrono::{DateTime, Utc};
use lazy_static::lazy_static;
use serde::{Deserialize, Serialize};
use tracing::{debug, error, info};

use crate::diff::Diff;
use crate::error::{DerivaError, Result};
use crate::fact::{Fact, FactId, IdHasher, Value};
use crate::provenance::ProvenanceLedger;
use crate::query::{ExecOutput, Query};
use crate::settings::{ExecutionStrategy, Settings};
use crate::table::TableKeeper;
use crate::trigger::{TableChanges, TriggerKeeper, ViewTrigger};
use crate::union::Union;

/// The reserved table holding view definitions as ordinary facts.
pub const VIEW_TABLE: &str = "view";

lazy_static! {
    static ref RESERVED_TABLES: HashSet<&'static str> = [VIEW_TABLE].iter().copied().collect();
}

fn lock<T>(mutex: &Mutex<T>) -> Result<MutexGuard<'_, T>> {
    mutex.lock().map_err(|e| DerivaError::Lock(e.to_string()))
}

/// The in-memory deductive database: base tables, registered views kept
/// current by a trigger scheduler, and the provenance ledger tying every
/// derived row to the source rows justifying it.
///
/// View definitions are themselves facts in the reserved `view` table, so
/// a snapshot of the base tables is enough to rebuild every view.
pub struct Database {
    tables: Arc<Mutex<TableKeeper>>,
    triggers: Arc<Mutex<TriggerKeeper>>,
    provenance: Arc<Mutex<ProvenanceLedger>>,
    settings: Settings,
}

impl Default for Database {
    fn default() -> Self {
        Self::new(Settings::default())
    }
}

impl Database {
    pub fn new(settings: Settings) -> Self {
        let mut tables = TableKeeper::new();
        tables.keep(
            VIEW_TABLE,
            Some(vec![
                "definition".to_owned(),
                "kind".to_owned(),
                "name".to_owned(),
            ]),
        );
        info!(strategy = ?settings.execution_strategy, "database created");
        Self {
            tables: Arc::new(Mutex::new(tables)),
            triggers: Arc::new(Mutex::new(TriggerKeeper::new())),
            provenance: Arc::new(Mutex::new(ProvenanceLedger::new())),
            settings,
        }
    }

    pub fn settings(&self) -> &Settings {
        &self.settings
    }

    // ------------- tables -------------
    /// Declares a table, optionally with a fixed schema. Declaring an
    /// existing table is a no-op; its schema is not rewritten.
    pub fn add_table(&self, name: &str, fields: Option<Vec<String>>) -> Result<()> {
        if RESERVED_TABLES.contains(name) {
            return Err(DerivaError::InvalidQuery(format!(
                "table name {:?} is reserved",
                name
            )));
        }
        let mut tables = lock(&self.tables)?;
        tables.keep(name, fields);
        Ok(())
    }
    pub fn contains_table(&self, name: &str) -> Result<bool> {
        Ok(lock(&self.tables)?.contains(name))
    }
    pub fn table_names(&self) -> Result<Vec<String>> {
        let tables = lock(&self.tables)?;
        let mut names: Vec<String> = tables.names().cloned().collect();
        names.sort();
        Ok(names)
    }
    pub fn len(&self, table: &str) -> Result<usize> {
        Ok(lock(&self.tables)?.get(table).map(|t| t.len()).unwrap_or(0))
    }
    pub fn fields(&self, table: &str) -> Result<Option<Vec<String>>> {
        Ok(lock(&self.tables)?
            .get(table)
            .and_then(|t| t.fields().map(|f| f.to_vec())))
    }
    pub fn rows(&self, table: &str) -> Result<Vec<Arc<Fact>>> {
        Ok(lock(&self.tables)?
            .get(table)
            .map(|t| t.rows().cloned().collect())
            .unwrap_or_default())
    }
    /// Resolves a field-value pattern against a table's current rows.
    pub fn find(&self, table: &str, pattern: &Fact) -> Result<Vec<Arc<Fact>>> {
        let mut tables = lock(&self.tables)?;
        Ok(tables
            .get_mut(table)
            .map(|t| t.find(pattern))
            .unwrap_or_default())
    }
    pub fn find_one(&self, table: &str, pattern: &Fact) -> Result<Option<Arc<Fact>>> {
        Ok(self.find(table, pattern)?.into_iter().next())
    }
    /// Pre-builds the secondary index over `keys`; the same index is
    /// otherwise built lazily on first matching lookup.
    pub fn index(&self, table: &str, keys: &[&str]) -> Result<()> {
        let mut tables = lock(&self.tables)?;
        let keys: Vec<String> = keys.iter().map(|k| (*k).to_owned()).collect();
        tables.keep(table, None).ensure_index(&keys);
        Ok(())
    }

    // ------------- queries -------------
    /// Compiles (when dirty) and runs a query against current state,
    /// without registering it.
    pub fn exec_query(&self, query: &mut Query) -> Result<ExecOutput> {
        let mut tables = lock(&self.tables)?;
        query.compile(&tables)?;
        query.plan()?.execute(&query.name, &mut tables, None)
    }
    /// Runs a union against current state, without registering it.
    pub fn exec_union(&self, union: &mut Union) -> Result<ExecOutput> {
        let mut tables = lock(&self.tables)?;
        union.compile(&tables)?;
        union.execute(&mut tables, None)
    }

    // ------------- views -------------
    /// Registers a query as a maintained view. The definition is stored
    /// as a fact in the reserved `view` table and the view is derived by
    /// the same scheduler that keeps it current afterwards.
    pub fn as_view(&self, query: Query) -> Result<()> {
        if !query.has_projection() {
            return Err(DerivaError::InvalidQuery(format!(
                "view {:?} needs a projection",
                query.name
            )));
        }
        self.register_view(ViewTrigger::Query(query))
    }
    pub fn union_as_view(&self, union: Union) -> Result<()> {
        self.register_view(ViewTrigger::Union(union))
    }

    fn register_view(&self, mut trigger: ViewTrigger) -> Result<()> {
        let name = trigger.view().to_owned();
        if RESERVED_TABLES.contains(name.as_str()) {
            return Err(DerivaError::InvalidQuery(format!(
                "view name {:?} is reserved",
                name
            )));
        }
        {
            let mut tables = lock(&self.tables)?;
            let provenance = lock(&self.provenance)?;
            if occupied_by_base_table(&tables, &provenance, &name) {
                return Err(DerivaError::InvalidQuery(format!(
                    "table {:?} already exists and is not a view",
                    name
                )));
            }
            // Surface definition errors to the caller instead of leaving
            // them for the recompiler to log.
            for source in trigger.declared_sources() {
                tables.keep(&source, None);
            }
            trigger.compile(&tables)?;
        }
        let definition = trigger.definition_value()?;
        let kind = match &trigger {
            ViewTrigger::Query(_) => "query",
            ViewTrigger::Union(_) => "union",
        };
        let fact = Fact::new()
            .with("name", name.as_str())
            .with("kind", kind)
            .with("definition", definition.to_string());
        let mut diff = Diff::new();
        diff.remove(VIEW_TABLE, Fact::new().with("name", name.as_str()));
        diff.add(VIEW_TABLE, fact);
        self.apply_diff(diff)
    }

    /// Unregisters a view: its definition fact is removed, its rows are
    /// retracted, and dependents cascade.
    pub fn remove_view(&self, name: &str) -> Result<()> {
        let mut diff = Diff::new();
        diff.remove(VIEW_TABLE, Fact::new().with("name", name));
        self.apply_diff(diff)
    }
    pub fn views(&self) -> Result<Vec<String>> {
        let triggers = lock(&self.triggers)?;
        Ok(triggers.names().cloned().collect())
    }
    pub fn is_view(&self, name: &str) -> Result<bool> {
        Ok(lock(&self.provenance)?.is_view(name))
    }

    // ------------- provenance -------------
    /// Number of derivation instances currently supporting a derived row.
    pub fn support(&self, view: &str, row: FactId) -> Result<usize> {
        Ok(lock(&self.provenance)?.support(view, row))
    }
    /// Transitive support check down to base tables.
    pub fn is_supported(&self, table: &str, row: FactId) -> Result<bool> {
        Ok(lock(&self.provenance)?.is_supported(table, row))
    }

    // ------------- diffs -------------
    /// A fresh, empty diff to fill and apply.
    pub fn diff(&self) -> Diff {
        Diff::new()
    }
    pub fn apply_diff(&self, diff: Diff) -> Result<()> {
        self.apply(diff, self.settings.execution_strategy)
    }
    pub fn apply_diff_full(&self, diff: Diff) -> Result<()> {
        self.apply(diff, ExecutionStrategy::Full)
    }
    pub fn apply_diff_incremental(&self, diff: Diff) -> Result<()> {
        self.apply(diff, ExecutionStrategy::Incremental)
    }

    /// The scheduler: applies the diff, then wakes affected views in
    /// rounds until no table changes, re-feeding each round's view output
    /// as the next round's diff. Rounds are capped so cyclic definitions
    /// that never settle fail instead of spinning.
    fn apply(&self, diff: Diff, strategy: ExecutionStrategy) -> Result<()> {
        let mut tables = lock(&self.tables)?;
        let mut triggers = lock(&self.triggers)?;
        let mut ledger = lock(&self.provenance)?;

        let mut pending = diff;
        let mut round: u64 = 0;
        while !pending.is_empty() {
            round += 1;
            if self.settings.round_cap != 0 && round > self.settings.round_cap {
                return Err(DerivaError::NonConvergence {
                    rounds: self.settings.round_cap,
                });
            }
            debug!(round, strategy = ?strategy, "scheduler round");

            let mut changes = TableChanges::new();
            let removed =
                reconcile_apply(&mut tables, std::mem::take(&mut pending), &mut changes)?;
            if strategy == ExecutionStrategy::Incremental {
                cascade_retractions(&mut tables, &mut ledger, &mut changes, removed);
            }
            if changes.is_empty() {
                break;
            }

            let (force_full, dropped) =
                recompile_views(&mut tables, &mut triggers, &mut ledger, &mut changes)?;
            if strategy == ExecutionStrategy::Incremental && !dropped.is_empty() {
                cascade_retractions(&mut tables, &mut ledger, &mut changes, dropped);
            }

            let mut wake = triggers.affected_by(&changes);
            for view in &force_full {
                if !wake.contains(view) {
                    wake.push(view.clone());
                }
            }
            wake.sort();

            let mut next = Diff::new();
            for view in wake {
                let trigger = match triggers.get_mut(&view) {
                    Some(trigger) => trigger,
                    None => continue,
                };
                for source in trigger.declared_sources() {
                    tables.keep(&source, None);
                }
                trigger.compile(&tables)?;
                let forced = force_full.contains(&view);
                if strategy == ExecutionStrategy::Incremental && !forced {
                    match trigger.incremental_exec(&mut tables, &changes)? {
                        Some(output) => {
                            ledger.record(output.provenance);
                            for fact in output.results {
                                next.add(&view, (*fact).clone());
                            }
                        }
                        None => run_full_for(&view, trigger, &mut tables, &mut ledger, &mut next)?,
                    }
                } else {
                    run_full_for(&view, trigger, &mut tables, &mut ledger, &mut next)?;
                }
            }
            pending = next;
        }
        Ok(())
    }

    // ------------- snapshots -------------
    /// Serializes the base tables (view definitions included, derived
    /// rows excluded) with a timestamp.
    pub fn snapshot_json(&self) -> Result<String> {
        let tables = lock(&self.tables)?;
        let ledger = lock(&self.provenance)?;
        let mut snapshot = Snapshot {
            taken_at: Utc::now(),
            tables: std::collections::BTreeMap::new(),
        };
        for name in tables.names() {
            if ledger.is_view(name) {
                continue;
            }
            let table = match tables.get(name) {
                Some(table) => table,
                None => continue,
            };
            let mut rows: Vec<Fact> = table.rows().map(|f| (**f).clone()).collect();
            rows.sort_by_key(|f| f.id());
            snapshot.tables.insert(
                name.clone(),
                SnapshotTable {
                    fields: table.fields().map(|f| f.to_vec()),
                    rows,
                },
            );
        }
        serde_json::to_string_pretty(&snapshot).map_err(|e| DerivaError::Snapshot(e.to_string()))
    }

    pub fn save_snapshot(&self) -> Result<()> {
        let json = self.snapshot_json()?;
        fs::write(&self.settings.snapshot_file, json)
            .map_err(|e| DerivaError::Snapshot(e.to_string()))?;
        info!(file = %self.settings.snapshot_file, "snapshot written");
        Ok(())
    }

    /// Rebuilds a database from a snapshot: base facts are re-applied as
    /// one diff, and the view definitions inside it re-register and
    /// re-derive every view.
    pub fn restore_json(json: &str, settings: Settings) -> Result<Database> {
        let snapshot: Snapshot =
            serde_json::from_str(json).map_err(|e| DerivaError::Snapshot(e.to_string()))?;
        info!(taken_at = %snapshot.taken_at, tables = snapshot.tables.len(), "restoring snapshot");
        let database = Database::new(settings);
        let mut diff = Diff::new();
        for (name, table) in snapshot.tables {
            if !RESERVED_TABLES.contains(name.as_str()) {
                database.add_table(&name, table.fields)?;
            }
            diff.add_many(&name, table.rows);
        }
        database.apply_diff(diff)?;
        Ok(database)
    }

    pub fn load_snapshot(settings: Settings) -> Result<Database> {
        let json = fs::read_to_string(&settings.snapshot_file)
            .map_err(|e| DerivaError::Snapshot(e.to_string()))?;
        Database::restore_json(&json, settings)
    }
}

#[derive(Serialize, Deserialize)]
struct Snapshot {
    taken_at: DateTime<Utc>,
    tables: std::collections::BTreeMap<String, SnapshotTable>,
}

#[derive(Serialize, Deserialize)]
struct SnapshotTable {
    fields: Option<Vec<String>>,
    rows: Vec<Fact>,
}

/// Reconciles one diff against current membership and applies the net
/// effect: removal patterns resolve to concrete rows, duplicate adds
/// collapse, an add and a remove of the same fact cancel, and no-op adds
/// and removes (already present, already absent) record no change.
/// Returns the removed rows for the retraction cascade.
fn reconcile_apply(
    tables: &mut TableKeeper,
    diff: Diff,
    changes: &mut TableChanges,
) -> Result<Vec<(String, FactId)>> {
    let mut removed_rows = Vec::new();
    for (name, table_diff) in diff.into_tables() {
        let table = tables.keep(&name, None);
        for fact in &table_diff.adds {
            for (field, _) in fact.fields() {
                if !table.admits_field(field) {
                    return Err(DerivaError::SchemaField {
                        table: name.clone(),
                        field: field.clone(),
                    });
                }
            }
        }
        let mut removes: HashMap<FactId, Fact, IdHasher> = HashMap::default();
        for pattern in &table_diff.remove_patterns {
            for fact in table.find(pattern) {
                removes.insert(fact.id(), (*fact).clone());
            }
        }
        for fact in table_diff.removes {
            removes.insert(fact.id(), fact);
        }
        let mut adds: Vec<(FactId, Fact)> = Vec::new();
        let mut seen: HashSet<FactId, IdHasher> = HashSet::default();
        for fact in table_diff.adds {
            let id = fact.id();
            if seen.insert(id) {
                adds.push((id, fact));
            }
        }
        adds.retain(|(id, _)| {
            if removes.contains_key(id) {
                removes.remove(id);
                false
            } else {
                true
            }
        });
        for (id, _) in removes {
            if let Some(fact) = table.remove(id) {
                changes.record_remove(&name, fact);
                removed_rows.push((name.clone(), id));
            }
        }
        for (_, fact) in adds {
            let fact = Arc::new(fact);
            if table.insert(fact.clone()) {
                changes.record_add(&name, fact);
            }
        }
    }
    Ok(removed_rows)
}

/// Deletes every derived row whose support drops to zero once the seed
/// rows are gone, transitively. Support counting lives in the ledger;
/// this walks its answers into the tables and the change set.
fn cascade_retractions(
    tables: &mut TableKeeper,
    ledger: &mut ProvenanceLedger,
    changes: &mut TableChanges,
    seeds: Vec<(String, FactId)>,
) {
    let mut queue = seeds;
    while let Some((table_name, row)) = queue.pop() {
        for (view, derived_row) in ledger.retract_source(&table_name, row) {
            if let Some(table) = tables.get_mut(&view) {
                if let Some(fact) = table.remove(derived_row) {
                    debug!(view = %view, row = derived_row, "derived row retracted");
                    changes.record_remove(&view, fact);
                    queue.push((view, derived_row));
                }
            }
        }
    }
}

/// The reserved step of every round: reacts to changes in the `view`
/// table by dropping and registering triggers. A definition that fails to
/// parse or compile is logged and deleted instead of poisoning the
/// database. Returns the views needing an initial full derivation and
/// the rows of dropped views for the retraction cascade.
fn recompile_views(
    tables: &mut TableKeeper,
    triggers: &mut TriggerKeeper,
    ledger: &mut ProvenanceLedger,
    changes: &mut TableChanges,
) -> Result<(Vec<String>, Vec<(String, FactId)>)> {
    let view_changes = match changes.get(VIEW_TABLE) {
        Some(view_changes) => view_changes.clone(),
        None => return Ok((Vec::new(), Vec::new())),
    };
    let mut force_full = Vec::new();
    let mut dropped_rows = Vec::new();

    for fact in &view_changes.removed {
        let name = match fact.get("name") {
            Some(Value::String(name)) => name.clone(),
            _ => continue,
        };
        if triggers.remove(&name).is_some() {
            debug!(view = %name, "view definition removed, dropping view");
            ledger.remove_view(&name);
            if let Some(table) = tables.remove(&name) {
                for row in table.rows() {
                    changes.record_remove(&name, row.clone());
                    dropped_rows.push((name.clone(), row.id()));
                }
            }
        }
    }

    for fact in &view_changes.added {
        let mut trigger = match parse_definition(fact) {
            Ok(trigger) => trigger,
            Err(e) => {
                error!(error = %e, "malformed view definition dropped");
                drop_definition_fact(tables, changes, fact.id());
                continue;
            }
        };
        let name = trigger.view().to_owned();
        if RESERVED_TABLES.contains(name.as_str())
            || occupied_by_base_table(tables, ledger, &name)
        {
            error!(view = %name, "view name collides with an existing table, definition dropped");
            drop_definition_fact(tables, changes, fact.id());
            continue;
        }
        for source in trigger.declared_sources() {
            tables.keep(&source, None);
        }
        if let Err(e) = trigger.compile(tables) {
            error!(view = %name, error = %e, "view definition failed to compile, dropped");
            drop_definition_fact(tables, changes, fact.id());
            continue;
        }
        debug!(view = %name, "view registered");
        tables.keep(&name, None);
        ledger.register_view(&name);
        triggers.keep(trigger);
        force_full.push(name);
    }

    Ok((force_full, dropped_rows))
}

/// A name is taken when a base table with rows already uses it. Empty
/// tables (typically auto-vivified as a forward reference to a view not
/// yet defined) may still become views, which is what makes mutually
/// recursive view definitions possible to register one at a time.
fn occupied_by_base_table(
    tables: &TableKeeper,
    ledger: &ProvenanceLedger,
    name: &str,
) -> bool {
    if ledger.is_view(name) {
        return false;
    }
    tables.get(name).map(|t| !t.is_empty()).unwrap_or(false)
}

fn drop_definition_fact(tables: &mut TableKeeper, changes: &mut TableChanges, id: FactId) {
    if let Some(table) = tables.get_mut(VIEW_TABLE) {
        if let Some(removed) = table.remove(id) {
            changes.record_remove(VIEW_TABLE, removed);
        }
    }
}

fn parse_definition(fact: &Fact) -> Result<ViewTrigger> {
    let name = match fact.get("name") {
        Some(Value::String(name)) => name.clone(),
        _ => {
            return Err(DerivaError::MalformedViewDefinition {
                view: String::new(),
                reason: "missing name".to_owned(),
            })
        }
    };
    let malformed = |reason: String| DerivaError::MalformedViewDefinition {
        view: name.clone(),
        reason,
    };
    let definition = match fact.get("definition") {
        Some(Value::String(definition)) => definition,
        _ => return Err(malformed("missing definition".to_owned())),
    };
    match fact.get("kind") {
        Some(Value::String(kind)) if kind == "query" => {
            let query: Query =
                serde_json::from_str(definition).map_err(|e| malformed(e.to_string()))?;
            if query.name != name {
                return Err(malformed("definition name mismatch".to_owned()));
            }
            if !query.has_projection() {
                return Err(malformed("query view needs a projection".to_owned()));
            }
            Ok(ViewTrigger::Query(query))
        }
        Some(Value::String(kind)) if kind == "union" => {
            let union: Union =
                serde_json::from_str(definition).map_err(|e| malformed(e.to_string()))?;
            if union.name != name {
                return Err(malformed("definition name mismatch".to_owned()));
            }
            Ok(ViewTrigger::Union(union))
        }
        _ => Err(malformed("unknown kind".to_owned())),
    }
}

/// Full re-derivation of one view: replace its provenance wholesale and
/// emit the row delta against its current table into the next round.
fn run_full_for(
    view: &str,
    trigger: &ViewTrigger,
    tables: &mut TableKeeper,
    ledger: &mut ProvenanceLedger,
    next: &mut Diff,
) -> Result<()> {
    let output = trigger.full_exec(tables)?;
    ledger.replace_view(view, output.provenance);
    let mut desired: HashMap<FactId, Arc<Fact>, IdHasher> = HashMap::default();
    for fact in output.results {
        desired.insert(fact.id(), fact);
    }
    let table = tables.keep(view, None);
    let current: Vec<FactId> = table.row_ids().collect();
    for id in &current {
        if !desired.contains_key(id) {
            if let Some(fact) = table.row(*id) {
                next.remove_fact(view, (**fact).clone());
            }
        }
    }
    for (id, fact) in desired {
        if !table.contains(id) {
            next.add(view, (*fact).clone());
        }
    }
    Ok(())
}
