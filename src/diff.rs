use std::collections::BTreeMap;

use tracing::warn;

use crate::fact::Fact;

/// The proposed adds and removes for one table. Removals come in two forms:
/// concrete facts and patterns, the latter resolved against the current rows
/// when the diff is applied.
#[derive(Debug, Clone, Default)]
pub struct TableDiff {
    pub adds: Vec<Fact>,
    pub removes: Vec<Fact>,
    pub remove_patterns: Vec<Fact>,
}

impl TableDiff {
    fn is_empty(&self) -> bool {
        self.adds.is_empty() && self.removes.is_empty() && self.remove_patterns.is_empty()
    }
}

/// A batch of proposed fact additions and removals across tables.
///
/// A diff carries raw proposals: duplicates and add/remove pairs of the same
/// fact are allowed here and reconciled against current table membership at
/// apply time, which makes `merge` associative and commutative with respect
/// to the final net effect.
#[derive(Debug, Clone, Default)]
pub struct Diff {
    tables: BTreeMap<String, TableDiff>,
}

impl Diff {
    pub fn new() -> Self {
        Self::default()
    }
    pub fn add(&mut self, table: &str, fact: Fact) -> &mut Self {
        self.entry(table).adds.push(fact);
        self
    }
    pub fn add_many(&mut self, table: &str, facts: impl IntoIterator<Item = Fact>) -> &mut Self {
        self.entry(table).adds.extend(facts);
        self
    }
    /// Schedules removal of every current fact matching the pattern.
    /// Resolution happens when the diff is applied, not here.
    pub fn remove(&mut self, table: &str, pattern: Fact) -> &mut Self {
        self.entry(table).remove_patterns.push(pattern);
        self
    }
    pub fn remove_fact(&mut self, table: &str, fact: Fact) -> &mut Self {
        self.entry(table).removes.push(fact);
        self
    }
    pub fn remove_facts(&mut self, table: &str, facts: impl IntoIterator<Item = Fact>) -> &mut Self {
        self.entry(table).removes.extend(facts);
        self
    }
    /// Concatenates the other diff's proposals per table.
    pub fn merge(&mut self, other: Diff) -> &mut Self {
        for (table, diff) in other.tables {
            let entry = self.entry(&table);
            entry.adds.extend(diff.adds);
            entry.removes.extend(diff.removes);
            entry.remove_patterns.extend(diff.remove_patterns);
        }
        self
    }
    /// Swaps adds and removes per table, turning the diff into its own
    /// undo. Unresolved removal patterns have no fact to assert and are
    /// dropped.
    pub fn reverse(self) -> Diff {
        let mut reversed = Diff::new();
        for (table, diff) in self.tables {
            if !diff.remove_patterns.is_empty() {
                warn!(
                    table = %table,
                    count = diff.remove_patterns.len(),
                    "dropping unresolved removal patterns on reverse"
                );
            }
            let entry = reversed.entry(&table);
            entry.adds = diff.removes;
            entry.removes = diff.adds;
        }
        reversed
    }
    pub fn is_empty(&self) -> bool {
        self.tables.values().all(TableDiff::is_empty)
    }
    pub fn tables(&self) -> impl Iterator<Item = (&String, &TableDiff)> {
        self.tables.iter()
    }
    pub(crate) fn into_tables(self) -> BTreeMap<String, TableDiff> {
        self.tables
    }
    fn entry(&mut self, table: &str) -> &mut TableDiff {
        self.tables.entry(table.to_owned()).or_default()
    }
}
