use std::cmp::Ordering;
use std::collections::btree_map::Iter;
use std::collections::BTreeMap;
use std::fmt;
use std::hash::{BuildHasherDefault, Hash, Hasher};

use seahash::SeaHasher;
use serde::{Deserialize, Serialize};

// ------------- FactId -------------
/// Content-derived identity of a fact, stable across processes.
/// Two facts with equal fields carry the same id, which is what makes
/// tables sets rather than multisets.
pub type FactId = u64;

pub type IdHasher = BuildHasherDefault<SeaHasher>;
pub type OtherHasher = BuildHasherDefault<SeaHasher>;

// ------------- Value -------------
/// A scalar field value. Facts are flat: no nesting, no references.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(untagged)]
pub enum Value {
    Bool(bool),
    Int(i64),
    Float(f64),
    String(String),
}

impl Value {
    /// Stable one-byte tag fed into the identity hash ahead of the payload,
    /// so e.g. Int(1) and Bool(true) can never collide structurally.
    fn tag(&self) -> u8 {
        match self {
            Value::Bool(_) => 1,
            Value::Int(_) => 2,
            Value::Float(_) => 3,
            Value::String(_) => 4,
        }
    }
    pub(crate) fn hash_into(&self, hasher: &mut blake3::Hasher) {
        hasher.update(&[self.tag()]);
        match self {
            Value::Bool(b) => {
                hasher.update(&[*b as u8]);
            }
            Value::Int(i) => {
                hasher.update(&i.to_le_bytes());
            }
            Value::Float(f) => {
                hasher.update(&f.to_bits().to_le_bytes());
            }
            Value::String(s) => {
                hasher.update(&(s.len() as u64).to_le_bytes());
                hasher.update(s.as_bytes());
            }
        }
    }
    /// Comparison used by filter calculations. Unlike [`Ord`], which must
    /// stay consistent with [`Eq`], this treats Int(1) and Float(1.0) as
    /// equal. Returns None when the two values are not comparable, in which
    /// case the filter path fails.
    pub fn compare(&self, other: &Value) -> Option<Ordering> {
        match (self, other) {
            (Value::Bool(a), Value::Bool(b)) => Some(a.cmp(b)),
            (Value::Int(a), Value::Int(b)) => Some(a.cmp(b)),
            (Value::Float(a), Value::Float(b)) => Some(a.total_cmp(b)),
            (Value::Int(a), Value::Float(b)) => Some((*a as f64).total_cmp(b)),
            (Value::Float(a), Value::Int(b)) => Some(a.total_cmp(&(*b as f64))),
            (Value::String(a), Value::String(b)) => Some(a.cmp(b)),
            (_, _) => None,
        }
    }
    pub fn as_f64(&self) -> Option<f64> {
        match self {
            Value::Int(i) => Some(*i as f64),
            Value::Float(f) => Some(*f),
            _ => None,
        }
    }
}

impl PartialEq for Value {
    fn eq(&self, other: &Self) -> bool {
        match (self, other) {
            (Value::Bool(a), Value::Bool(b)) => a == b,
            (Value::Int(a), Value::Int(b)) => a == b,
            (Value::Float(a), Value::Float(b)) => a.to_bits() == b.to_bits(),
            (Value::String(a), Value::String(b)) => a == b,
            (_, _) => false,
        }
    }
}
impl Eq for Value {}
impl Hash for Value {
    fn hash<H: Hasher>(&self, state: &mut H) {
        state.write_u8(self.tag());
        match self {
            Value::Bool(b) => b.hash(state),
            Value::Int(i) => i.hash(state),
            Value::Float(f) => state.write_u64(f.to_bits()),
            Value::String(s) => s.hash(state),
        }
    }
}
impl Ord for Value {
    fn cmp(&self, other: &Self) -> Ordering {
        // Numeric variants compare numerically, with the variant rank as a
        // tie-break so that Ord never calls distinct values equal.
        fn rank(v: &Value) -> u8 {
            v.tag()
        }
        match (self, other) {
            (Value::Bool(a), Value::Bool(b)) => a.cmp(b),
            (Value::Int(a), Value::Int(b)) => a.cmp(b),
            (Value::Float(a), Value::Float(b)) => a.total_cmp(b),
            (Value::String(a), Value::String(b)) => a.cmp(b),
            (Value::Int(a), Value::Float(b)) => match (*a as f64).total_cmp(b) {
                Ordering::Equal => Ordering::Less,
                o => o,
            },
            (Value::Float(a), Value::Int(b)) => match a.total_cmp(&(*b as f64)) {
                Ordering::Equal => Ordering::Greater,
                o => o,
            },
            (a, b) => rank(a).cmp(&rank(b)),
        }
    }
}
impl PartialOrd for Value {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}
impl fmt::Display for Value {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self {
            Value::Bool(b) => write!(f, "{}", b),
            Value::Int(i) => write!(f, "{}", i),
            Value::Float(x) => write!(f, "{}", x),
            Value::String(s) => write!(f, "{}", s),
        }
    }
}

impl From<bool> for Value {
    fn from(b: bool) -> Self {
        Value::Bool(b)
    }
}
impl From<i64> for Value {
    fn from(i: i64) -> Self {
        Value::Int(i)
    }
}
impl From<i32> for Value {
    fn from(i: i32) -> Self {
        Value::Int(i as i64)
    }
}
impl From<f64> for Value {
    fn from(f: f64) -> Self {
        Value::Float(f)
    }
}
impl From<&str> for Value {
    fn from(s: &str) -> Self {
        Value::String(s.to_owned())
    }
}
impl From<String> for Value {
    fn from(s: String) -> Self {
        Value::String(s)
    }
}

// ------------- Fact -------------
/// An ordered mapping of field name to scalar value. Field order is
/// canonical (sorted by name), so the identity hash is independent of
/// insertion order.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Fact {
    fields: BTreeMap<String, Value>,
}

impl Fact {
    pub fn new() -> Self {
        Self {
            fields: BTreeMap::new(),
        }
    }
    /// Builder-style field setter: `Fact::new().with("name", "Alice")`.
    pub fn with(mut self, field: &str, value: impl Into<Value>) -> Self {
        self.fields.insert(field.to_owned(), value.into());
        self
    }
    pub fn set(&mut self, field: &str, value: impl Into<Value>) {
        self.fields.insert(field.to_owned(), value.into());
    }
    pub fn get(&self, field: &str) -> Option<&Value> {
        self.fields.get(field)
    }
    pub fn fields(&self) -> Iter<'_, String, Value> {
        self.fields.iter()
    }
    pub fn field_names(&self) -> Vec<String> {
        self.fields.keys().cloned().collect()
    }
    pub fn len(&self) -> usize {
        self.fields.len()
    }
    pub fn is_empty(&self) -> bool {
        self.fields.is_empty()
    }
    /// Content-derived identity: a structural blake3 hash over the ordered
    /// (name, value) sequence, truncated to 64 bits.
    pub fn id(&self) -> FactId {
        let mut hasher = blake3::Hasher::new();
        for (name, value) in &self.fields {
            hasher.update(&(name.len() as u64).to_le_bytes());
            hasher.update(name.as_bytes());
            value.hash_into(&mut hasher);
        }
        let digest = hasher.finalize();
        let mut bytes = [0u8; 8];
        bytes.copy_from_slice(&digest.as_bytes()[..8]);
        u64::from_le_bytes(bytes)
    }
    /// A pattern matches when every one of its fields is present with an
    /// equal value. The empty pattern matches everything.
    pub fn matches(&self, pattern: &Fact) -> bool {
        pattern
            .fields
            .iter()
            .all(|(name, value)| self.fields.get(name) == Some(value))
    }
}

impl Hash for Fact {
    fn hash<H: Hasher>(&self, state: &mut H) {
        state.write_u64(self.id());
    }
}
impl fmt::Display for Fact {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        let mut s = String::new();
        for (name, value) in &self.fields {
            s += &format!("{}: {}, ", name, value);
        }
        s.pop();
        s.pop();
        write!(f, "{{{}}}", s)
    }
}

/// Hash a (view, derived row, source rows) combination into the identifier
/// of one derivation instance. The source list is sorted first so the
/// instance id does not depend on join order.
pub fn instance_id(view: &str, row: FactId, sources: &[(String, FactId)]) -> u64 {
    let mut sorted: Vec<&(String, FactId)> = sources.iter().collect();
    sorted.sort();
    let mut hasher = blake3::Hasher::new();
    hasher.update(&(view.len() as u64).to_le_bytes());
    hasher.update(view.as_bytes());
    hasher.update(&row.to_le_bytes());
    for (table, id) in sorted {
        hasher.update(&(table.len() as u64).to_le_bytes());
        hasher.update(table.as_bytes());
        hasher.update(&id.to_le_bytes());
    }
    let digest = hasher.finalize();
    let mut bytes = [0u8; 8];
    bytes.copy_from_slice(&digest.as_bytes()[..8]);
    u64::from_le_bytes(bytes)
}
