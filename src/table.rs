use std::collections::hash_map::Entry;
use std::collections::{HashMap, HashSet};
use std::sync::Arc;

use tracing::trace;

use crate::error::{DerivaError, Result};
use crate::fact::{Fact, FactId, IdHasher, OtherHasher, Value};

// ------------- Index -------------
/// A lazily-built secondary index: rows grouped by the values of a fixed
/// tuple of fields. Maintained incrementally on every applied diff, never
/// rebuilt wholesale except on creation.
#[derive(Debug)]
pub struct Index {
    keys: Vec<String>,
    groups: HashMap<Vec<Value>, HashSet<FactId, IdHasher>, OtherHasher>,
}

impl Index {
    /// Builds the index over the current rows. `keys` must be sorted; the
    /// keeper sorts them before lookup so equal key sets share one index.
    fn build<'a>(keys: Vec<String>, rows: impl Iterator<Item = &'a Arc<Fact>>) -> Self {
        let mut index = Self {
            keys,
            groups: HashMap::default(),
        };
        for fact in rows {
            index.insert(fact);
        }
        index
    }
    fn key_of(&self, fact: &Fact) -> Option<Vec<Value>> {
        self.keys
            .iter()
            .map(|k| fact.get(k).cloned())
            .collect::<Option<Vec<Value>>>()
    }
    fn insert(&mut self, fact: &Arc<Fact>) {
        // A fact missing one of the key fields can never answer a lookup
        // on this index, so it is simply not entered.
        if let Some(key) = self.key_of(fact) {
            self.groups
                .entry(key)
                .or_insert_with(HashSet::default)
                .insert(fact.id());
        }
    }
    fn remove(&mut self, fact: &Fact) {
        if let Some(key) = self.key_of(fact) {
            if let Entry::Occupied(mut e) = self.groups.entry(key) {
                e.get_mut().remove(&fact.id());
                if e.get().is_empty() {
                    e.remove();
                }
            }
        }
    }
    pub fn lookup(&self, key: &[Value]) -> Option<&HashSet<FactId, IdHasher>> {
        self.groups.get(key)
    }
    pub fn keys(&self) -> &[String] {
        &self.keys
    }
}

// ------------- Table -------------
/// A named set of facts. The schema is either declared up front or inferred
/// from the first inserted fact; rows exactly reflect the net adds and
/// removes ever applied.
#[derive(Debug)]
pub struct Table {
    name: String,
    fields: Option<Vec<String>>,
    rows: HashMap<FactId, Arc<Fact>, IdHasher>,
    indexes: HashMap<Vec<String>, Index, OtherHasher>,
}

impl Table {
    pub fn new(name: &str, fields: Option<Vec<String>>) -> Self {
        Self {
            name: name.to_owned(),
            fields,
            rows: HashMap::default(),
            indexes: HashMap::default(),
        }
    }
    pub fn name(&self) -> &str {
        &self.name
    }
    pub fn fields(&self) -> Option<&[String]> {
        self.fields.as_deref()
    }
    /// True when the field is part of the known schema, or when no schema
    /// is known yet (validation is deferred until one is).
    pub fn admits_field(&self, field: &str) -> bool {
        match &self.fields {
            Some(fields) => fields.iter().any(|f| f == field),
            None => true,
        }
    }
    pub fn len(&self) -> usize {
        self.rows.len()
    }
    pub fn is_empty(&self) -> bool {
        self.rows.is_empty()
    }
    pub fn contains(&self, id: FactId) -> bool {
        self.rows.contains_key(&id)
    }
    pub fn row(&self, id: FactId) -> Option<&Arc<Fact>> {
        self.rows.get(&id)
    }
    pub fn rows(&self) -> impl Iterator<Item = &Arc<Fact>> {
        self.rows.values()
    }
    pub fn row_ids(&self) -> impl Iterator<Item = FactId> + '_ {
        self.rows.keys().copied()
    }

    /// Inserts a fact, returning false when it was already present.
    /// All registered indexes are maintained in the same step.
    pub fn insert(&mut self, fact: Arc<Fact>) -> bool {
        let id = fact.id();
        if self.rows.contains_key(&id) {
            return false;
        }
        if self.fields.is_none() {
            self.fields = Some(fact.field_names());
            trace!(table = %self.name, fields = ?self.fields, "schema inferred");
        }
        for index in self.indexes.values_mut() {
            index.insert(&fact);
        }
        self.rows.insert(id, fact);
        true
    }

    /// Removes a fact by identity, returning it when it was present.
    pub fn remove(&mut self, id: FactId) -> Option<Arc<Fact>> {
        let fact = self.rows.remove(&id)?;
        for index in self.indexes.values_mut() {
            index.remove(&fact);
        }
        Some(fact)
    }

    /// Returns the index over `keys`, building it on first use.
    pub fn ensure_index(&mut self, keys: &[String]) -> &Index {
        let mut sorted: Vec<String> = keys.to_vec();
        sorted.sort();
        sorted.dedup();
        let Self { name, rows, indexes, .. } = self;
        match indexes.entry(sorted) {
            Entry::Occupied(e) => e.into_mut(),
            Entry::Vacant(e) => {
                trace!(table = %name, keys = ?e.key(), "building index");
                let index = Index::build(e.key().clone(), rows.values());
                e.insert(index)
            }
        }
    }

    /// Resolves a field-value pattern to matching facts: the full row set
    /// for the empty pattern, an index lookup otherwise.
    pub fn find(&mut self, pattern: &Fact) -> Vec<Arc<Fact>> {
        if pattern.is_empty() {
            return self.rows.values().cloned().collect();
        }
        let keys = pattern.field_names();
        let ids: Vec<FactId> = {
            let index = self.ensure_index(&keys);
            // ensure_index sorts and dedups, and pattern fields are already
            // in canonical order, so index.keys() aligns with pattern values.
            let key: Vec<Value> = index
                .keys()
                .iter()
                .filter_map(|k| pattern.get(k).cloned())
                .collect();
            match index.lookup(&key) {
                Some(ids) => ids.iter().copied().collect(),
                None => Vec::new(),
            }
        };
        ids.iter()
            .filter_map(|id| self.rows.get(id).cloned())
            .collect()
    }
}

// ------------- TableKeeper -------------
/// Owns every table by name, auto-vivifying on access.
#[derive(Debug, Default)]
pub struct TableKeeper {
    kept: HashMap<String, Table, OtherHasher>,
}

impl TableKeeper {
    pub fn new() -> Self {
        Self {
            kept: HashMap::default(),
        }
    }
    pub fn keep(&mut self, name: &str, fields: Option<Vec<String>>) -> &mut Table {
        self.kept
            .entry(name.to_owned())
            .or_insert_with(|| Table::new(name, fields))
    }
    pub fn get(&self, name: &str) -> Option<&Table> {
        self.kept.get(name)
    }
    pub fn get_mut(&mut self, name: &str) -> Option<&mut Table> {
        self.kept.get_mut(name)
    }
    /// Fails when the table does not exist; used by the query compiler,
    /// which must not vivify source tables by accident.
    pub fn expect(&self, name: &str) -> Result<&Table> {
        self.kept
            .get(name)
            .ok_or_else(|| DerivaError::InvalidQuery(format!("unknown source table {:?}", name)))
    }
    pub fn contains(&self, name: &str) -> bool {
        self.kept.contains_key(name)
    }
    pub fn remove(&mut self, name: &str) -> Option<Table> {
        self.kept.remove(name)
    }
    pub fn names(&self) -> impl Iterator<Item = &String> {
        self.kept.keys()
    }
    pub fn len(&self) -> usize {
        self.kept.len()
    }
}
