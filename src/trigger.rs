use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;

use roaring::RoaringTreemap;
use tracing::{debug, trace};

use crate::error::Result;
use crate::fact::{Fact, OtherHasher};
use crate::query::{ExecOutput, Query};
use crate::table::TableKeeper;
use crate::union::Union;

/// The rows added to and removed from each table during one scheduler
/// round; the delta the next round's triggers react to.
#[derive(Debug, Clone, Default)]
pub struct TableChanges {
    tables: HashMap<String, ChangeSet, OtherHasher>,
}

#[derive(Debug, Clone, Default)]
pub struct ChangeSet {
    pub added: Vec<Arc<Fact>>,
    pub removed: Vec<Arc<Fact>>,
}

impl TableChanges {
    pub fn new() -> Self {
        Self::default()
    }
    pub fn record_add(&mut self, table: &str, fact: Arc<Fact>) {
        self.tables.entry(table.to_owned()).or_default().added.push(fact);
    }
    pub fn record_remove(&mut self, table: &str, fact: Arc<Fact>) {
        self.tables
            .entry(table.to_owned())
            .or_default()
            .removed
            .push(fact);
    }
    pub fn get(&self, table: &str) -> Option<&ChangeSet> {
        self.tables.get(table)
    }
    pub fn touched(&self) -> impl Iterator<Item = &String> {
        self.tables.keys()
    }
    pub fn is_empty(&self) -> bool {
        self.tables
            .values()
            .all(|c| c.added.is_empty() && c.removed.is_empty())
    }
    pub fn merge(&mut self, other: TableChanges) {
        for (table, changes) in other.tables {
            let entry = self.tables.entry(table).or_default();
            entry.added.extend(changes.added);
            entry.removed.extend(changes.removed);
        }
    }
}

/// A registered view: the pipeline re-run whenever one of its sources
/// changes. Either a query or a union, with a shared scheduling surface.
#[derive(Debug, Clone)]
pub enum ViewTrigger {
    Query(Query),
    Union(Union),
}

impl ViewTrigger {
    pub fn view(&self) -> &str {
        match self {
            ViewTrigger::Query(q) => &q.name,
            ViewTrigger::Union(u) => &u.name,
        }
    }

    /// The tables this view reads; changes to any of them wake the
    /// trigger.
    pub fn sources(&self) -> Vec<String> {
        match self {
            ViewTrigger::Query(q) => q
                .plan()
                .map(|p| p.source_tables())
                .unwrap_or_default(),
            ViewTrigger::Union(u) => u.source_tables(),
        }
    }

    /// Source tables as declared, available before compilation; used to
    /// auto-vivify them.
    pub fn declared_sources(&self) -> Vec<String> {
        match self {
            ViewTrigger::Query(q) => q.join_sources().iter().map(|s| (*s).to_owned()).collect(),
            ViewTrigger::Union(u) => u.source_tables(),
        }
    }

    pub fn compile(&mut self, tables: &TableKeeper) -> Result<()> {
        match self {
            ViewTrigger::Query(q) => q.compile(tables),
            ViewTrigger::Union(u) => u.compile(tables),
        }
    }

    pub fn definition_value(&self) -> Result<serde_json::Value> {
        match self {
            ViewTrigger::Query(q) => q.definition_value(),
            ViewTrigger::Union(u) => u.definition_value(),
        }
    }

    /// Re-derives the view from the whole of its sources.
    pub fn full_exec(&self, tables: &mut TableKeeper) -> Result<ExecOutput> {
        match self {
            ViewTrigger::Query(q) => q.plan()?.execute(&q.name, tables, None),
            ViewTrigger::Union(u) => u.execute(tables, None),
        }
    }

    /// Derives only what the given delta can newly produce. Returns None
    /// when the delta cannot be handled incrementally and the caller must
    /// fall back to `full_exec`:
    ///   - the pipeline is order dependent (aggregates, limits, ordinals),
    ///   - a changed table feeds a negated join (removals there can create
    ///     rows, additions can retract them).
    /// Removals from positive sources are not handled here at all; the
    /// provenance ledger retracts their dependents.
    pub fn incremental_exec(
        &self,
        tables: &mut TableKeeper,
        changes: &TableChanges,
    ) -> Result<Option<ExecOutput>> {
        match self {
            ViewTrigger::Query(query) => {
                let plan = query.plan()?;
                if query.order_dependent() {
                    debug!(view = %query.name, "order-dependent pipeline, full re-run");
                    return Ok(None);
                }
                for negated in plan.negated_sources() {
                    if changes.get(negated).map(|c| !c.added.is_empty() || !c.removed.is_empty())
                        == Some(true)
                    {
                        debug!(view = %query.name, source = negated, "negated source changed, full re-run");
                        return Ok(None);
                    }
                }
                let mut output = ExecOutput::default();
                for (stage_no, stage) in plan.joins.iter().enumerate() {
                    if stage.negated {
                        continue;
                    }
                    let added = match changes.get(&stage.source) {
                        Some(c) if !c.added.is_empty() => &c.added,
                        _ => continue,
                    };
                    let mut candidates = RoaringTreemap::new();
                    for fact in added {
                        candidates.insert(fact.id());
                    }
                    trace!(view = %query.name, stage = stage_no, candidates = candidates.len(), "delta pass");
                    let delta =
                        plan.execute(&query.name, tables, Some((stage_no, &candidates)))?;
                    output.results.extend(delta.results);
                    output.unprojected.extend(delta.unprojected);
                    output.provenance.extend(delta.provenance);
                }
                Ok(Some(output))
            }
            ViewTrigger::Union(union) => {
                let mut candidates: HashMap<String, RoaringTreemap> = HashMap::new();
                for branch in union.source_tables() {
                    if let Some(change) = changes.get(&branch) {
                        if !change.added.is_empty() {
                            let ids = candidates.entry(branch).or_default();
                            for fact in &change.added {
                                ids.insert(fact.id());
                            }
                        }
                    }
                }
                if candidates.is_empty() {
                    return Ok(Some(ExecOutput::default()));
                }
                Ok(Some(union.execute(tables, Some(&candidates))?))
            }
        }
    }
}

/// The registered triggers, keyed and iterated by view name so every
/// round wakes them in the same deterministic order.
#[derive(Debug, Default)]
pub struct TriggerKeeper {
    kept: BTreeMap<String, ViewTrigger>,
}

impl TriggerKeeper {
    pub fn new() -> Self {
        Self::default()
    }
    /// Registers or replaces the trigger for its view.
    pub fn keep(&mut self, trigger: ViewTrigger) {
        self.kept.insert(trigger.view().to_owned(), trigger);
    }
    pub fn get(&self, view: &str) -> Option<&ViewTrigger> {
        self.kept.get(view)
    }
    pub fn get_mut(&mut self, view: &str) -> Option<&mut ViewTrigger> {
        self.kept.get_mut(view)
    }
    pub fn remove(&mut self, view: &str) -> Option<ViewTrigger> {
        self.kept.remove(view)
    }
    pub fn contains(&self, view: &str) -> bool {
        self.kept.contains_key(view)
    }
    pub fn names(&self) -> impl Iterator<Item = &String> {
        self.kept.keys()
    }
    pub fn len(&self) -> usize {
        self.kept.len()
    }
    pub fn is_empty(&self) -> bool {
        self.kept.is_empty()
    }
    /// Views whose sources intersect the changed tables, in name order.
    pub fn affected_by(&self, changes: &TableChanges) -> Vec<String> {
        self.kept
            .iter()
            .filter(|(_, trigger)| {
                trigger
                    .sources()
                    .iter()
                    .any(|source| changes.get(source).is_some())
            })
            .map(|(name, _)| name.clone())
            .collect()
    }
}
