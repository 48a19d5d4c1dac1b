use std::collections::{HashMap, HashSet};
use std::sync::Arc;

use roaring::RoaringTreemap;
use serde::{Deserialize, Serialize};
use tracing::trace;

use crate::error::{DerivaError, Result};
use crate::fact::{instance_id, Fact, FactId, OtherHasher, Value};
use crate::provenance::ProvenanceEdge;
use crate::query::ExecOutput;
use crate::table::TableKeeper;

/// How one output field of a union branch is produced: a constant or a
/// field copied from the branch's source rows.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum MappingTerm {
    Value { value: Value },
    Field { field: String },
}

impl MappingTerm {
    pub fn value(v: impl Into<Value>) -> MappingTerm {
        MappingTerm::Value { value: v.into() }
    }
    pub fn field(field: &str) -> MappingTerm {
        MappingTerm::Field {
            field: field.to_owned(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct UnionSource {
    pub source: String,
    pub mapping: Vec<(String, MappingTerm)>,
}

/// A set union over mapped source tables. Each branch maps its source's
/// rows into the common output shape; rows that map to the same content
/// coalesce into one output row carrying provenance from every
/// contributing source row.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Union {
    pub name: String,
    sources: Vec<UnionSource>,
    #[serde(skip)]
    dirty: bool,
    #[serde(skip)]
    compiled: bool,
}

impl Union {
    pub fn new(name: &str) -> Self {
        Self {
            name: name.to_owned(),
            sources: Vec::new(),
            dirty: true,
            compiled: false,
        }
    }

    pub fn source(&mut self, source: &str, mapping: Vec<(&str, MappingTerm)>) -> &mut Self {
        self.sources.push(UnionSource {
            source: source.to_owned(),
            mapping: mapping
                .into_iter()
                .map(|(f, t)| (f.to_owned(), t))
                .collect(),
        });
        self.dirty = true;
        self.compiled = false;
        self
    }

    pub fn is_dirty(&self) -> bool {
        self.dirty || !self.compiled
    }
    pub(crate) fn branches(&self) -> &[UnionSource] {
        &self.sources
    }
    pub fn source_tables(&self) -> Vec<String> {
        let mut tables = Vec::new();
        for branch in &self.sources {
            if !tables.contains(&branch.source) {
                tables.push(branch.source.clone());
            }
        }
        tables
    }
    pub fn definition_value(&self) -> Result<serde_json::Value> {
        serde_json::to_value(self).map_err(|e| DerivaError::MalformedViewDefinition {
            view: self.name.clone(),
            reason: e.to_string(),
        })
    }

    /// Validates every branch against the known schemas.
    pub fn compile(&mut self, tables: &TableKeeper) -> Result<()> {
        if !self.is_dirty() {
            return Ok(());
        }
        if self.sources.is_empty() {
            return Err(DerivaError::InvalidQuery(format!(
                "union {:?} has no sources",
                self.name
            )));
        }
        for branch in &self.sources {
            let table = tables.expect(&branch.source)?;
            for (_, term) in &branch.mapping {
                if let MappingTerm::Field { field } = term {
                    if !table.admits_field(field) {
                        return Err(DerivaError::SchemaField {
                            table: branch.source.clone(),
                            field: field.clone(),
                        });
                    }
                }
            }
        }
        self.dirty = false;
        self.compiled = true;
        Ok(())
    }

    /// Maps every branch over its source rows. When `candidates` is given,
    /// each branch iterates only the listed row ids of its source and
    /// sources absent from the map are skipped (the incremental path).
    pub(crate) fn execute(
        &self,
        tables: &mut TableKeeper,
        candidates: Option<&HashMap<String, RoaringTreemap>>,
    ) -> Result<ExecOutput> {
        let mut results: Vec<Arc<Fact>> = Vec::new();
        let mut provenance: Vec<ProvenanceEdge> = Vec::new();
        let mut seen_rows: HashSet<FactId, OtherHasher> = HashSet::default();
        let mut seen_instances: HashSet<u64, OtherHasher> = HashSet::default();

        for branch in &self.sources {
            let restrict = match candidates {
                Some(map) => match map.get(&branch.source) {
                    Some(ids) => Some(ids),
                    None => continue,
                },
                None => None,
            };
            let table = tables.keep(&branch.source, None);
            let ids: Vec<FactId> = match restrict {
                Some(ids) => ids.iter().collect(),
                None => table.row_ids().collect(),
            };
            for id in ids {
                let source_fact = match table.row(id) {
                    Some(fact) => fact,
                    None => continue,
                };
                let mut fact = Fact::new();
                let mut complete = true;
                for (field, term) in &branch.mapping {
                    match term {
                        MappingTerm::Value { value } => fact.set(field, value.clone()),
                        MappingTerm::Field { field: source_field } => {
                            match source_fact.get(source_field) {
                                Some(value) => fact.set(field, value.clone()),
                                None => {
                                    complete = false;
                                    break;
                                }
                            }
                        }
                    }
                }
                if !complete {
                    continue;
                }
                let fact = Arc::new(fact);
                let row_id = fact.id();
                let sources = vec![(branch.source.clone(), id)];
                let instance = instance_id(&self.name, row_id, &sources);
                if seen_instances.insert(instance) {
                    provenance.push(ProvenanceEdge {
                        view: self.name.clone(),
                        row: row_id,
                        instance,
                        source_table: branch.source.clone(),
                        source_row: id,
                    });
                }
                if seen_rows.insert(row_id) {
                    results.push(fact);
                }
            }
        }
        trace!(union = %self.name, rows = results.len(), "union executed");

        Ok(ExecOutput {
            results,
            unprojected: Vec::new(),
            provenance,
        })
    }
}
