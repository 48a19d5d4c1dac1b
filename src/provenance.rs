use std::collections::{HashMap, HashSet};

use tracing::debug;

use crate::fact::{FactId, IdHasher, OtherHasher};

/// One support edge: the derivation instance `instance` of `row` in `view`
/// was justified by `source_row` of `source_table`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProvenanceEdge {
    pub view: String,
    pub row: FactId,
    pub instance: u64,
    pub source_table: String,
    pub source_row: FactId,
}

/// The ledger of every derivation instance currently supporting derived
/// rows. Rows are support-counted: a derived row survives as long as at
/// least one of its instances survives, and an instance survives as long
/// as every one of its source rows does.
#[derive(Debug, Default)]
pub struct ProvenanceLedger {
    /// instance id -> the edges of that derivation instance.
    instances: HashMap<u64, Vec<ProvenanceEdge>, IdHasher>,
    /// (source table, source row) -> instances leaning on it.
    by_source: HashMap<(String, FactId), HashSet<u64, IdHasher>, OtherHasher>,
    /// (view, derived row) -> the instances supporting it.
    by_row: HashMap<(String, FactId), HashSet<u64, IdHasher>, OtherHasher>,
    /// Names of registered derived tables; everything else is base.
    views: HashSet<String, OtherHasher>,
}

impl ProvenanceLedger {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register_view(&mut self, view: &str) {
        self.views.insert(view.to_owned());
    }
    pub fn is_view(&self, name: &str) -> bool {
        self.views.contains(name)
    }
    pub fn view_names(&self) -> impl Iterator<Item = &String> {
        self.views.iter()
    }

    /// Records a batch of edges, grouped by derivation instance. Instances
    /// already in the ledger are skipped, so rediscovering a derivation
    /// (e.g. from overlapping delta passes) is harmless.
    pub fn record(&mut self, edges: Vec<ProvenanceEdge>) {
        let mut grouped: HashMap<u64, Vec<ProvenanceEdge>, IdHasher> = HashMap::default();
        for edge in edges {
            grouped.entry(edge.instance).or_default().push(edge);
        }
        for (instance, group) in grouped {
            if self.instances.contains_key(&instance) {
                continue;
            }
            for edge in &group {
                self.by_source
                    .entry((edge.source_table.clone(), edge.source_row))
                    .or_default()
                    .insert(instance);
                self.by_row
                    .entry((edge.view.clone(), edge.row))
                    .or_default()
                    .insert(instance);
            }
            self.instances.insert(instance, group);
        }
    }

    /// Drops every instance of `view` and replaces them with `edges`; the
    /// reconciliation step after a full re-execution of the view.
    pub fn replace_view(&mut self, view: &str, edges: Vec<ProvenanceEdge>) {
        let stale: Vec<u64> = self
            .instances
            .iter()
            .filter(|(_, edges)| edges.first().map(|e| e.view == view).unwrap_or(false))
            .map(|(id, _)| *id)
            .collect();
        for instance in stale {
            self.drop_instance(instance);
        }
        self.record(edges);
    }

    /// Forgets a removed view entirely: its registration and every
    /// instance it owned.
    pub fn remove_view(&mut self, view: &str) {
        self.replace_view(view, Vec::new());
        self.views.remove(view);
    }

    /// A source row disappeared: every instance leaning on it dies, and
    /// the derived rows whose support drops to zero are returned for
    /// retraction.
    pub fn retract_source(&mut self, table: &str, row: FactId) -> Vec<(String, FactId)> {
        let doomed = match self.by_source.remove(&(table.to_owned(), row)) {
            Some(instances) => instances,
            None => return Vec::new(),
        };
        let mut retracted = Vec::new();
        for instance in doomed {
            if let Some((view, derived_row)) = self.drop_instance(instance) {
                let key = (view.clone(), derived_row);
                let unsupported = self
                    .by_row
                    .get(&key)
                    .map(|support| support.is_empty())
                    .unwrap_or(true);
                if unsupported {
                    self.by_row.remove(&key);
                    if !retracted.contains(&key) {
                        debug!(view = %key.0, row = key.1, "derived row lost all support");
                        retracted.push(key);
                    }
                }
            }
        }
        retracted
    }

    fn drop_instance(&mut self, instance: u64) -> Option<(String, FactId)> {
        let edges = self.instances.remove(&instance)?;
        let mut derived = None;
        for edge in edges {
            if let Some(set) = self
                .by_source
                .get_mut(&(edge.source_table.clone(), edge.source_row))
            {
                set.remove(&instance);
                if set.is_empty() {
                    self.by_source.remove(&(edge.source_table, edge.source_row));
                }
            }
            let key = (edge.view, edge.row);
            if let Some(set) = self.by_row.get_mut(&key) {
                set.remove(&instance);
            }
            derived = Some(key);
        }
        derived
    }

    /// Support instances currently recorded for a derived row.
    pub fn support(&self, view: &str, row: FactId) -> usize {
        self.by_row
            .get(&(view.to_owned(), row))
            .map(|s| s.len())
            .unwrap_or(0)
    }

    pub fn edges_of(&self, view: &str, row: FactId) -> Vec<&ProvenanceEdge> {
        match self.by_row.get(&(view.to_owned(), row)) {
            Some(instances) => instances
                .iter()
                .filter_map(|i| self.instances.get(i))
                .flatten()
                .collect(),
            None => Vec::new(),
        }
    }

    /// Transitive support check: base rows support themselves, a derived
    /// row is supported iff some instance has every source transitively
    /// supported. Guards against cyclic view definitions.
    pub fn is_supported(&self, table: &str, row: FactId) -> bool {
        let mut visiting = HashSet::default();
        self.supported_inner(table, row, &mut visiting)
    }

    fn supported_inner(
        &self,
        table: &str,
        row: FactId,
        visiting: &mut HashSet<(String, FactId), OtherHasher>,
    ) -> bool {
        if !self.is_view(table) {
            return true;
        }
        let key = (table.to_owned(), row);
        if !visiting.insert(key.clone()) {
            // Already on the walk: cyclic support does not count.
            return false;
        }
        let supported = match self.by_row.get(&key) {
            Some(instances) => instances.iter().any(|instance| {
                self.instances
                    .get(instance)
                    .map(|edges| {
                        edges.iter().all(|edge| {
                            self.supported_inner(&edge.source_table, edge.source_row, visiting)
                        })
                    })
                    .unwrap_or(false)
            }),
            None => false,
        };
        visiting.remove(&key);
        supported
    }

    pub fn instance_count(&self) -> usize {
        self.instances.len()
    }
}
