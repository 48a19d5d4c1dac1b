use std::cmp::Ordering;
use std::collections::{HashMap, HashSet};
use std::fmt;
use std::sync::Arc;

use roaring::RoaringTreemap;
use serde::{Deserialize, Serialize};
use tracing::{debug, trace};

use crate::database::Database;
use crate::error::{DerivaError, Result};
use crate::fact::{instance_id, Fact, FactId, OtherHasher, Value};
use crate::provenance::ProvenanceEdge;
use crate::table::TableKeeper;

// ------------- Term -------------
/// A reference to a bound value: a constant, a field bound by an earlier
/// join stage, or the named output of a calculation, aggregate or ordinal.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum Term {
    Value { value: Value },
    Bound { alias: String, field: String },
    Named { name: String },
}

impl Term {
    pub fn value(v: impl Into<Value>) -> Term {
        Term::Value { value: v.into() }
    }
    pub fn bound(alias: &str, field: &str) -> Term {
        Term::Bound {
            alias: alias.to_owned(),
            field: field.to_owned(),
        }
    }
    pub fn named(name: &str) -> Term {
        Term::Named {
            name: name.to_owned(),
        }
    }
}

// ------------- Join -------------
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Join {
    pub alias: String,
    pub source: String,
    pub constraints: Vec<(String, Term)>,
    pub negated: bool,
}

// ------------- Calculation -------------
/// The named pure functions available to `calculate`. Comparison functions
/// are filters: they gate the binding path instead of producing a value,
/// and each has an inverse so a negated filter can be compiled to its
/// logical complement.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CalcFn {
    Add,
    Subtract,
    Multiply,
    Divide,
    Remainder,
    Concat,
    Uppercase,
    Lowercase,
    Length,
    Eq,
    Neq,
    Lt,
    Lte,
    Gt,
    Gte,
}

impl CalcFn {
    pub fn is_filter(self) -> bool {
        matches!(
            self,
            CalcFn::Eq | CalcFn::Neq | CalcFn::Lt | CalcFn::Lte | CalcFn::Gt | CalcFn::Gte
        )
    }
    pub fn inverse(self) -> Option<CalcFn> {
        match self {
            CalcFn::Eq => Some(CalcFn::Neq),
            CalcFn::Neq => Some(CalcFn::Eq),
            CalcFn::Lt => Some(CalcFn::Gte),
            CalcFn::Lte => Some(CalcFn::Gt),
            CalcFn::Gt => Some(CalcFn::Lte),
            CalcFn::Gte => Some(CalcFn::Lt),
            _ => None,
        }
    }
    /// Evaluates a filter. None means the arguments were not comparable,
    /// which fails the binding path like a failing comparison does.
    fn passes(self, args: &[Value]) -> Option<bool> {
        if args.len() != 2 {
            return None;
        }
        let ordering = args[0].compare(&args[1])?;
        Some(match self {
            CalcFn::Eq => ordering == Ordering::Equal,
            CalcFn::Neq => ordering != Ordering::Equal,
            CalcFn::Lt => ordering == Ordering::Less,
            CalcFn::Lte => ordering != Ordering::Greater,
            CalcFn::Gt => ordering == Ordering::Greater,
            CalcFn::Gte => ordering != Ordering::Less,
            _ => return None,
        })
    }
    /// Evaluates a non-filter function. None aborts the binding path
    /// (type mismatch or arity misuse), producing no output row.
    fn apply(self, args: &[Value]) -> Option<Value> {
        match self {
            CalcFn::Add | CalcFn::Multiply => {
                if args.is_empty() {
                    return None;
                }
                let all_int = args.iter().all(|v| matches!(v, Value::Int(_)));
                if all_int {
                    let mut acc = match self {
                        CalcFn::Add => 0i64,
                        _ => 1i64,
                    };
                    for v in args {
                        if let Value::Int(i) = v {
                            acc = match self {
                                CalcFn::Add => acc.checked_add(*i)?,
                                _ => acc.checked_mul(*i)?,
                            };
                        }
                    }
                    Some(Value::Int(acc))
                } else {
                    let mut acc = match self {
                        CalcFn::Add => 0f64,
                        _ => 1f64,
                    };
                    for v in args {
                        let f = v.as_f64()?;
                        acc = match self {
                            CalcFn::Add => acc + f,
                            _ => acc * f,
                        };
                    }
                    Some(Value::Float(acc))
                }
            }
            CalcFn::Subtract => match args {
                [Value::Int(a), Value::Int(b)] => Some(Value::Int(a.checked_sub(*b)?)),
                [a, b] => Some(Value::Float(a.as_f64()? - b.as_f64()?)),
                _ => None,
            },
            CalcFn::Divide => match args {
                [a, b] => {
                    let divisor = b.as_f64()?;
                    if divisor == 0.0 {
                        None
                    } else {
                        Some(Value::Float(a.as_f64()? / divisor))
                    }
                }
                _ => None,
            },
            CalcFn::Remainder => match args {
                [Value::Int(a), Value::Int(b)] => Some(Value::Int(a.checked_rem(*b)?)),
                _ => None,
            },
            CalcFn::Concat => {
                let mut s = String::new();
                for v in args {
                    s += &v.to_string();
                }
                Some(Value::String(s))
            }
            CalcFn::Uppercase => match args {
                [Value::String(s)] => Some(Value::String(s.to_uppercase())),
                _ => None,
            },
            CalcFn::Lowercase => match args {
                [Value::String(s)] => Some(Value::String(s.to_lowercase())),
                _ => None,
            },
            CalcFn::Length => match args {
                [Value::String(s)] => Some(Value::Int(s.chars().count() as i64)),
                _ => None,
            },
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Calculation {
    pub name: String,
    pub function: CalcFn,
    pub args: Vec<Term>,
    pub negated: bool,
}

// ------------- Aggregate -------------
/// A stateful reducer folded over each run of rows sharing group-key
/// values. Caller-defined folds exist but cannot be stored as view
/// definition facts, so `as_view` rejects them.
#[derive(Clone)]
pub enum AggregateFn {
    Count,
    Sum,
    Average,
    Custom {
        label: String,
        fold: Arc<dyn Fn(&[Value]) -> Value + Send + Sync>,
    },
}

impl AggregateFn {
    fn builtin_name(&self) -> Option<&'static str> {
        match self {
            AggregateFn::Count => Some("count"),
            AggregateFn::Sum => Some("sum"),
            AggregateFn::Average => Some("average"),
            AggregateFn::Custom { .. } => None,
        }
    }
    fn from_builtin(name: &str) -> Option<Self> {
        match name {
            "count" => Some(AggregateFn::Count),
            "sum" => Some(AggregateFn::Sum),
            "average" => Some(AggregateFn::Average),
            _ => None,
        }
    }
    fn fold(&self, values: &[Value], rows_in_group: usize) -> Option<Value> {
        match self {
            AggregateFn::Count => Some(Value::Int(rows_in_group as i64)),
            AggregateFn::Sum => {
                let all_int = values.iter().all(|v| matches!(v, Value::Int(_)));
                if all_int {
                    let mut acc = 0i64;
                    for v in values {
                        if let Value::Int(i) = v {
                            acc = acc.checked_add(*i)?;
                        }
                    }
                    Some(Value::Int(acc))
                } else {
                    let mut acc = 0f64;
                    for v in values {
                        acc += v.as_f64()?;
                    }
                    Some(Value::Float(acc))
                }
            }
            AggregateFn::Average => {
                if values.is_empty() {
                    return None;
                }
                let mut acc = 0f64;
                for v in values {
                    acc += v.as_f64()?;
                }
                Some(Value::Float(acc / values.len() as f64))
            }
            AggregateFn::Custom { fold, .. } => Some(fold(values)),
        }
    }
}

impl fmt::Debug for AggregateFn {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self {
            AggregateFn::Custom { label, .. } => write!(f, "Custom({})", label),
            other => write!(f, "{}", other.builtin_name().unwrap_or("?")),
        }
    }
}

impl Serialize for AggregateFn {
    fn serialize<S: serde::Serializer>(&self, s: S) -> std::result::Result<S::Ok, S::Error> {
        match self.builtin_name() {
            Some(name) => s.serialize_str(name),
            None => Err(serde::ser::Error::custom(
                "caller-defined aggregate cannot be serialized",
            )),
        }
    }
}
impl<'de> Deserialize<'de> for AggregateFn {
    fn deserialize<D: serde::Deserializer<'de>>(d: D) -> std::result::Result<Self, D::Error> {
        let name = String::deserialize(d)?;
        AggregateFn::from_builtin(&name)
            .ok_or_else(|| serde::de::Error::custom(format!("unknown aggregate {:?}", name)))
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Aggregate {
    pub name: String,
    pub function: AggregateFn,
    pub arg: Option<Term>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SortKey {
    pub term: Term,
    pub descending: bool,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Limit {
    pub count: Option<usize>,
    pub per_group: Option<usize>,
    pub offset: usize,
}

// ------------- Query -------------
/// A declarative join -> calculate -> aggregate -> sort/group/limit ->
/// project pipeline. Mutating calls mark the query dirty; `compile` is
/// memoized until the next mutation.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Query {
    pub name: String,
    joins: Vec<Join>,
    calculations: Vec<Calculation>,
    aggregates: Vec<Aggregate>,
    sorts: Vec<SortKey>,
    groups: Vec<Term>,
    limit: Option<Limit>,
    ordinal: Option<String>,
    projection: Option<Vec<(String, Term)>>,
    #[serde(skip)]
    misuse: Option<String>,
    #[serde(skip)]
    dirty: bool,
    #[serde(skip)]
    plan: Option<Plan>,
}

impl Query {
    pub fn new(name: &str) -> Self {
        Self {
            name: name.to_owned(),
            joins: Vec::new(),
            calculations: Vec::new(),
            aggregates: Vec::new(),
            sorts: Vec::new(),
            groups: Vec::new(),
            limit: None,
            ordinal: None,
            projection: None,
            misuse: None,
            dirty: true,
            plan: None,
        }
    }

    /// Joins a table or view under `alias`, constrained by equality on
    /// constants and on fields bound by earlier stages.
    pub fn select(&mut self, alias: &str, source: &str, constraints: Vec<(&str, Term)>) -> &mut Self {
        self.push_join(alias, source, constraints, false)
    }
    /// Anti-join: passes the current bindings through iff the match set is
    /// empty. Binds nothing.
    pub fn deselect(&mut self, alias: &str, source: &str, constraints: Vec<(&str, Term)>) -> &mut Self {
        self.push_join(alias, source, constraints, true)
    }
    fn push_join(
        &mut self,
        alias: &str,
        source: &str,
        constraints: Vec<(&str, Term)>,
        negated: bool,
    ) -> &mut Self {
        self.joins.push(Join {
            alias: alias.to_owned(),
            source: source.to_owned(),
            constraints: constraints
                .into_iter()
                .map(|(f, t)| (f.to_owned(), t))
                .collect(),
            negated,
        });
        self.touch()
    }
    pub fn calculate(&mut self, name: &str, function: CalcFn, args: Vec<Term>) -> &mut Self {
        self.calculations.push(Calculation {
            name: name.to_owned(),
            function,
            args,
            negated: false,
        });
        self.touch()
    }
    /// A negated filter; compiles to the function's logical complement.
    pub fn calculate_negated(&mut self, name: &str, function: CalcFn, args: Vec<Term>) -> &mut Self {
        self.calculations.push(Calculation {
            name: name.to_owned(),
            function,
            args,
            negated: true,
        });
        self.touch()
    }
    pub fn aggregate(&mut self, name: &str, function: AggregateFn, arg: Option<Term>) -> &mut Self {
        self.aggregates.push(Aggregate {
            name: name.to_owned(),
            function,
            arg,
        });
        self.touch()
    }
    pub fn sort(&mut self, keys: Vec<SortKey>) -> &mut Self {
        if keys.is_empty() {
            self.misuse = Some("sort called with no mappings".to_owned());
        }
        self.sorts.extend(keys);
        self.touch()
    }
    pub fn group(&mut self, terms: Vec<Term>) -> &mut Self {
        if terms.is_empty() {
            self.misuse = Some("group called with no mappings".to_owned());
        }
        self.groups.extend(terms);
        self.touch()
    }
    pub fn limit(&mut self, count: usize) -> &mut Self {
        self.limit.get_or_insert_with(Limit::default).count = Some(count);
        self.touch()
    }
    pub fn limit_per_group(&mut self, count: usize) -> &mut Self {
        self.limit.get_or_insert_with(Limit::default).per_group = Some(count);
        self.touch()
    }
    pub fn offset(&mut self, offset: usize) -> &mut Self {
        self.limit.get_or_insert_with(Limit::default).offset = offset;
        self.touch()
    }
    /// Names a per-row sequence number assigned after sort/group/limit.
    pub fn ordinal(&mut self, name: &str) -> &mut Self {
        self.ordinal = Some(name.to_owned());
        self.touch()
    }
    pub fn project(&mut self, mapping: Vec<(&str, Term)>) -> &mut Self {
        self.projection = Some(
            mapping
                .into_iter()
                .map(|(f, t)| (f.to_owned(), t))
                .collect(),
        );
        self.touch()
    }
    fn touch(&mut self) -> &mut Self {
        self.dirty = true;
        self.plan = None;
        self
    }

    pub fn is_dirty(&self) -> bool {
        self.dirty || self.plan.is_none()
    }
    /// Source tables named by the declared joins, before compilation.
    pub fn join_sources(&self) -> Vec<&str> {
        let mut sources = Vec::new();
        for join in &self.joins {
            if !sources.contains(&join.source.as_str()) {
                sources.push(join.source.as_str());
            }
        }
        sources
    }
    pub fn has_projection(&self) -> bool {
        self.projection.is_some()
    }
    /// True when the pipeline's output depends on emission order or on the
    /// whole input (aggregates, limits, ordinals); such queries are always
    /// evaluated in full.
    pub fn order_dependent(&self) -> bool {
        !self.aggregates.is_empty() || self.limit.is_some() || self.ordinal.is_some()
    }
    /// The stored-definition form of this query, rejected when it holds a
    /// caller-defined aggregate fold.
    pub fn definition_value(&self) -> Result<serde_json::Value> {
        serde_json::to_value(self).map_err(|e| DerivaError::MalformedViewDefinition {
            view: self.name.clone(),
            reason: e.to_string(),
        })
    }

    /// Compiles and memoizes the executable plan, validating every field,
    /// alias and variable reference against the known schemas.
    pub fn compile(&mut self, tables: &TableKeeper) -> Result<()> {
        if !self.is_dirty() {
            return Ok(());
        }
        if let Some(misuse) = &self.misuse {
            return Err(DerivaError::InvalidQuery(misuse.clone()));
        }
        let plan = Plan::compile(self, tables)?;
        self.plan = Some(plan);
        self.dirty = false;
        Ok(())
    }
    pub(crate) fn plan(&self) -> Result<&Plan> {
        self.plan
            .as_ref()
            .ok_or_else(|| DerivaError::InvalidQuery(format!("query {:?} is not compiled", self.name)))
    }

    /// Compiles (when dirty) and executes the full pipeline over current
    /// table state.
    pub fn exec(&mut self, database: &Database) -> Result<ExecOutput> {
        database.exec_query(self)
    }
}

// ------------- Plan -------------
/// The compiled, interpreted form of a query: no runtime code synthesis,
/// just resolved stages walked by the executor.
#[derive(Debug, Clone)]
pub(crate) struct Plan {
    pub(crate) joins: Vec<JoinStage>,
    pub(crate) calcs: Vec<Calculation>,
    pub(crate) aggregates: Vec<Aggregate>,
    pub(crate) sorts: Vec<SortKey>,
    pub(crate) groups: Vec<Term>,
    pub(crate) limit: Option<Limit>,
    pub(crate) ordinal: Option<String>,
    pub(crate) projection: Option<Vec<(String, Term)>>,
}

#[derive(Debug, Clone)]
pub(crate) struct JoinStage {
    pub(crate) alias: String,
    pub(crate) source: String,
    /// Sorted, deduplicated constraint fields; the index key of the stage.
    pub(crate) key_fields: Vec<String>,
    /// Constraint terms aligned with `key_fields`.
    pub(crate) key_terms: Vec<Term>,
    pub(crate) negated: bool,
}

impl Plan {
    fn compile(query: &Query, tables: &TableKeeper) -> Result<Plan> {
        let mut seen_aliases: Vec<(&str, bool)> = Vec::new(); // (alias, negated)
        let mut joins = Vec::new();
        for join in &query.joins {
            if seen_aliases.iter().any(|(a, _)| *a == join.alias) {
                return Err(DerivaError::InvalidQuery(format!(
                    "duplicate join alias {:?}",
                    join.alias
                )));
            }
            let table = tables.expect(&join.source)?;
            let mut pairs: Vec<(String, Term)> = Vec::new();
            for (field, term) in &join.constraints {
                if !table.admits_field(field) {
                    return Err(DerivaError::SchemaField {
                        table: join.source.clone(),
                        field: field.clone(),
                    });
                }
                validate_term(term, &seen_aliases, &[], tables, &query.joins)?;
                pairs.push((field.clone(), term.clone()));
            }
            pairs.sort_by(|a, b| a.0.cmp(&b.0));
            pairs.dedup_by(|a, b| a.0 == b.0 && a.1 == b.1);
            if pairs.windows(2).any(|w| w[0].0 == w[1].0) {
                return Err(DerivaError::InvalidQuery(format!(
                    "conflicting constraints on one field in join {:?}",
                    join.alias
                )));
            }
            let (key_fields, key_terms): (Vec<String>, Vec<Term>) = pairs.into_iter().unzip();
            joins.push(JoinStage {
                alias: join.alias.clone(),
                source: join.source.clone(),
                key_fields,
                key_terms,
                negated: join.negated,
            });
            seen_aliases.push((join.alias.as_str(), join.negated));
        }

        let mut names: Vec<&str> = Vec::new();
        let mut calcs = Vec::new();
        for calc in &query.calculations {
            for arg in &calc.args {
                validate_term(arg, &seen_aliases, &names, tables, &query.joins)?;
            }
            if names.contains(&calc.name.as_str()) {
                return Err(DerivaError::InvalidQuery(format!(
                    "duplicate result name {:?}",
                    calc.name
                )));
            }
            let mut compiled = calc.clone();
            if calc.negated {
                compiled.function = calc.function.inverse().ok_or_else(|| {
                    DerivaError::InvalidQuery(format!(
                        "calculation {:?} is not a filter and cannot be negated",
                        calc.name
                    ))
                })?;
                compiled.negated = false;
            }
            if !compiled.function.is_filter() {
                names.push(calc.name.as_str());
            }
            calcs.push(compiled);
        }

        for term in query.groups.iter().chain(query.sorts.iter().map(|s| &s.term)) {
            validate_term(term, &seen_aliases, &names, tables, &query.joins)?;
        }

        if let Some(limit) = &query.limit {
            if limit.per_group.is_some() && query.groups.is_empty() {
                return Err(DerivaError::InvalidQuery(
                    "per-group limit without group terms".to_owned(),
                ));
            }
        }

        for aggregate in &query.aggregates {
            if let Some(arg) = &aggregate.arg {
                validate_term(arg, &seen_aliases, &names, tables, &query.joins)?;
            } else if !matches!(aggregate.function, AggregateFn::Count) {
                return Err(DerivaError::InvalidQuery(format!(
                    "aggregate {:?} requires an argument",
                    aggregate.name
                )));
            }
            if names.contains(&aggregate.name.as_str()) {
                return Err(DerivaError::InvalidQuery(format!(
                    "duplicate result name {:?}",
                    aggregate.name
                )));
            }
            names.push(aggregate.name.as_str());
        }
        if let Some(ordinal) = &query.ordinal {
            names.push(ordinal.as_str());
        }

        if let Some(projection) = &query.projection {
            for (_, term) in projection {
                validate_term(term, &seen_aliases, &names, tables, &query.joins)?;
            }
        }

        Ok(Plan {
            joins,
            calcs,
            aggregates: query.aggregates.clone(),
            sorts: query.sorts.clone(),
            groups: query.groups.clone(),
            limit: query.limit.clone(),
            ordinal: query.ordinal.clone(),
            projection: query.projection.clone(),
        })
    }

    /// Distinct source tables, positives first.
    pub(crate) fn source_tables(&self) -> Vec<String> {
        let mut sources = Vec::new();
        for stage in &self.joins {
            if !sources.contains(&stage.source) {
                sources.push(stage.source.clone());
            }
        }
        sources
    }
    pub(crate) fn negated_sources(&self) -> Vec<&str> {
        self.joins
            .iter()
            .filter(|s| s.negated)
            .map(|s| s.source.as_str())
            .collect()
    }

    /// Runs the pipeline. When `restrict` is given, the named join stage
    /// iterates only those row ids; the incremental path runs one such
    /// delta pass per changed stage.
    pub(crate) fn execute(
        &self,
        view: &str,
        tables: &mut TableKeeper,
        restrict: Option<(usize, &RoaringTreemap)>,
    ) -> Result<ExecOutput> {
        let mut paths = vec![ResultRow::default()];

        for (stage_no, stage) in self.joins.iter().enumerate() {
            let mut next = Vec::new();
            let table = tables.keep(&stage.source, None);
            if !stage.key_fields.is_empty() {
                table.ensure_index(&stage.key_fields);
            }
            for row in &paths {
                let mut key = Vec::with_capacity(stage.key_terms.len());
                let mut resolvable = true;
                for term in &stage.key_terms {
                    match row.resolve(term) {
                        Some(v) => key.push(v),
                        None => {
                            resolvable = false;
                            break;
                        }
                    }
                }
                let ids: Vec<FactId> = if !resolvable {
                    Vec::new()
                } else if stage.key_fields.is_empty() {
                    table.row_ids().collect()
                } else {
                    let index = table.ensure_index(&stage.key_fields);
                    match index.lookup(&key) {
                        Some(ids) => ids.iter().copied().collect(),
                        None => Vec::new(),
                    }
                };
                if stage.negated {
                    if ids.is_empty() {
                        next.push(row.clone());
                    }
                    continue;
                }
                for id in ids {
                    if let Some((restricted_stage, candidates)) = restrict {
                        if stage_no == restricted_stage && !candidates.contains(id) {
                            continue;
                        }
                    }
                    if let Some(fact) = table.row(id) {
                        next.push(row.extend(&stage.alias, &stage.source, fact));
                    }
                }
            }
            trace!(view, stage = stage_no, paths = next.len(), "join stage");
            paths = next;
            if paths.is_empty() {
                break;
            }
        }

        for calc in &self.calcs {
            let mut next = Vec::with_capacity(paths.len());
            for mut row in paths {
                let args: Option<Vec<Value>> = calc.args.iter().map(|t| row.resolve(t)).collect();
                let args = match args {
                    Some(args) => args,
                    None => continue,
                };
                if calc.function.is_filter() {
                    if calc.function.passes(&args) == Some(true) {
                        next.push(row);
                    }
                } else if let Some(value) = calc.function.apply(&args) {
                    row.named.insert(calc.name.clone(), value);
                    next.push(row);
                }
            }
            paths = next;
        }

        // Aggregation requires group-then-sort order; plain sorts want it
        // too, so any of them triggers the stable sort.
        if !self.groups.is_empty() || !self.sorts.is_empty() || !self.aggregates.is_empty() {
            paths = self.sorted(paths);
        }

        if !self.aggregates.is_empty() {
            paths = self.aggregated(paths);
        } else if let Some(limit) = &self.limit {
            paths = apply_row_limit(paths, limit, &self.groups);
        }

        if let Some(ordinal) = &self.ordinal {
            // 1-based, assigned after sorting and limiting.
            for (i, row) in paths.iter_mut().enumerate() {
                row.named.insert(ordinal.clone(), Value::Int(i as i64 + 1));
            }
        }

        let mut results: Vec<Arc<Fact>> = Vec::new();
        let mut provenance: Vec<ProvenanceEdge> = Vec::new();
        if let Some(projection) = &self.projection {
            let mut seen_rows: HashSet<FactId, OtherHasher> = HashSet::default();
            let mut seen_instances: HashSet<u64, OtherHasher> = HashSet::default();
            for row in &paths {
                let mut fact = Fact::new();
                let mut complete = true;
                for (field, term) in projection {
                    match row.resolve(term) {
                        Some(value) => fact.set(field, value),
                        None => {
                            complete = false;
                            break;
                        }
                    }
                }
                if !complete {
                    continue;
                }
                let fact = Arc::new(fact);
                let row_id = fact.id();
                let instance = instance_id(view, row_id, &row.sources);
                if seen_instances.insert(instance) {
                    for (source_table, source_row) in &row.sources {
                        provenance.push(ProvenanceEdge {
                            view: view.to_owned(),
                            row: row_id,
                            instance,
                            source_table: source_table.clone(),
                            source_row: *source_row,
                        });
                    }
                }
                if seen_rows.insert(row_id) {
                    results.push(fact);
                }
            }
        }

        Ok(ExecOutput {
            results,
            unprojected: paths,
            provenance,
        })
    }

    fn sorted(&self, paths: Vec<ResultRow>) -> Vec<ResultRow> {
        let mut decorated: Vec<(Vec<Option<Value>>, ResultRow)> = paths
            .into_iter()
            .map(|row| {
                let mut keys = Vec::with_capacity(self.groups.len() + self.sorts.len());
                for term in &self.groups {
                    keys.push(row.resolve(term));
                }
                for sort in &self.sorts {
                    keys.push(row.resolve(&sort.term));
                }
                (keys, row)
            })
            .collect();
        let groups = self.groups.len();
        let sorts = &self.sorts;
        decorated.sort_by(|(a, _), (b, _)| {
            for (i, (x, y)) in a.iter().zip(b.iter()).enumerate() {
                let mut ordering = cmp_opt(x, y);
                if i >= groups && sorts[i - groups].descending {
                    ordering = ordering.reverse();
                }
                if ordering != Ordering::Equal {
                    return ordering;
                }
            }
            Ordering::Equal
        });
        decorated.into_iter().map(|(_, row)| row).collect()
    }

    /// Folds each maximal run of rows with identical group keys into one
    /// result row; global limit/offset count groups and are applied while
    /// walking, the per-group limit caps the rows folded per group. A group
    /// whose fold is undefined over its inputs (non-numeric data, integer
    /// overflow) emits no row, like a failed calculation path.
    fn aggregated(&self, paths: Vec<ResultRow>) -> Vec<ResultRow> {
        let mut emitted = Vec::new();
        let limit = self.limit.clone().unwrap_or_default();
        let mut skipped = 0usize;
        let mut i = 0;
        while i < paths.len() {
            let key: Vec<Option<Value>> =
                self.groups.iter().map(|t| paths[i].resolve(t)).collect();
            let mut j = i + 1;
            while j < paths.len() {
                let other: Vec<Option<Value>> =
                    self.groups.iter().map(|t| paths[j].resolve(t)).collect();
                if other != key {
                    break;
                }
                j += 1;
            }
            let mut end = j;
            if let Some(per_group) = limit.per_group {
                end = end.min(i + per_group);
            }
            let group = &paths[i..end];
            i = j;
            if group.is_empty() {
                // A zero per-group cap folds nothing for this group.
                continue;
            }

            if skipped < limit.offset {
                skipped += 1;
                continue;
            }
            if let Some(count) = limit.count {
                if emitted.len() >= count {
                    break;
                }
            }

            let mut row = group[0].clone();
            for member in &group[1..] {
                for source in &member.sources {
                    if !row.sources.contains(source) {
                        row.sources.push(source.clone());
                    }
                }
            }
            let mut complete = true;
            for aggregate in &self.aggregates {
                let values: Vec<Value> = match &aggregate.arg {
                    Some(term) => group.iter().filter_map(|r| r.resolve(term)).collect(),
                    None => Vec::new(),
                };
                match aggregate.function.fold(&values, group.len()) {
                    Some(folded) => {
                        row.named.insert(aggregate.name.clone(), folded);
                    }
                    None => {
                        debug!(
                            aggregate = %aggregate.name,
                            "fold not defined over its inputs, group emits no row"
                        );
                        complete = false;
                        break;
                    }
                }
            }
            if complete {
                emitted.push(row);
            }
        }
        emitted
    }
}

fn apply_row_limit(paths: Vec<ResultRow>, limit: &Limit, groups: &[Term]) -> Vec<ResultRow> {
    let mut rows = paths;
    if let Some(per_group) = limit.per_group {
        if !groups.is_empty() {
            let mut capped = Vec::with_capacity(rows.len());
            let mut current: Option<Vec<Option<Value>>> = None;
            let mut run = 0usize;
            for row in rows {
                let key: Vec<Option<Value>> = groups.iter().map(|t| row.resolve(t)).collect();
                if current.as_ref() != Some(&key) {
                    current = Some(key);
                    run = 0;
                }
                if run < per_group {
                    capped.push(row);
                }
                run += 1;
            }
            rows = capped;
        }
    }
    let offset = limit.offset.min(rows.len());
    let mut rows: Vec<ResultRow> = rows.split_off(offset);
    if let Some(count) = limit.count {
        rows.truncate(count);
    }
    rows
}

fn cmp_opt(a: &Option<Value>, b: &Option<Value>) -> Ordering {
    match (a, b) {
        (None, None) => Ordering::Equal,
        (None, Some(_)) => Ordering::Less,
        (Some(_), None) => Ordering::Greater,
        (Some(x), Some(y)) => x.cmp(y),
    }
}

/// Checks a term reference against the joins declared so far and the
/// result names bound so far.
fn validate_term(
    term: &Term,
    seen_aliases: &[(&str, bool)],
    names: &[&str],
    tables: &TableKeeper,
    all_joins: &[Join],
) -> Result<()> {
    match term {
        Term::Value { .. } => Ok(()),
        Term::Bound { alias, field } => {
            if let Some((_, negated)) = seen_aliases.iter().find(|(a, _)| *a == alias.as_str()) {
                if *negated {
                    return Err(DerivaError::UnboundVariable {
                        name: format!("{}.{}", alias, field),
                    });
                }
                let join = match all_joins.iter().find(|j| &j.alias == alias) {
                    Some(join) => join,
                    None => {
                        return Err(DerivaError::UnknownAlias {
                            alias: alias.clone(),
                        })
                    }
                };
                let table = tables.expect(&join.source)?;
                if !table.admits_field(field) {
                    return Err(DerivaError::SchemaField {
                        table: join.source.clone(),
                        field: field.clone(),
                    });
                }
                Ok(())
            } else if all_joins.iter().any(|j| &j.alias == alias) {
                // Declared, but by a later stage.
                Err(DerivaError::UnboundVariable {
                    name: format!("{}.{}", alias, field),
                })
            } else {
                Err(DerivaError::UnknownAlias {
                    alias: alias.clone(),
                })
            }
        }
        Term::Named { name } => {
            if names.contains(&name.as_str()) {
                Ok(())
            } else {
                Err(DerivaError::UnboundVariable { name: name.clone() })
            }
        }
    }
}

// ------------- Execution output -------------
/// One accumulated binding path: values bound per join alias, named
/// calculation/aggregate results, and the source rows that justified it.
#[derive(Debug, Clone, Default)]
pub struct ResultRow {
    bound: HashMap<(String, String), Value, OtherHasher>,
    named: HashMap<String, Value, OtherHasher>,
    sources: Vec<(String, FactId)>,
}

impl ResultRow {
    fn extend(&self, alias: &str, source: &str, fact: &Arc<Fact>) -> ResultRow {
        let mut row = self.clone();
        for (field, value) in fact.fields() {
            row.bound
                .insert((alias.to_owned(), field.clone()), value.clone());
        }
        row.sources.push((source.to_owned(), fact.id()));
        row
    }
    pub(crate) fn resolve(&self, term: &Term) -> Option<Value> {
        match term {
            Term::Value { value } => Some(value.clone()),
            Term::Bound { alias, field } => {
                self.bound.get(&(alias.clone(), field.clone())).cloned()
            }
            Term::Named { name } => self.named.get(name).cloned(),
        }
    }
    pub fn bound(&self, alias: &str, field: &str) -> Option<&Value> {
        self.bound.get(&(alias.to_owned(), field.to_owned()))
    }
    pub fn named(&self, name: &str) -> Option<&Value> {
        self.named.get(name)
    }
    pub fn sources(&self) -> &[(String, FactId)] {
        &self.sources
    }
}

/// The output of one plan execution: the projected result set, the
/// unprojected binding rows, and the provenance edges recorded while
/// projecting.
#[derive(Debug, Clone, Default)]
pub struct ExecOutput {
    pub results: Vec<Arc<Fact>>,
    pub unprojected: Vec<ResultRow>,
    pub provenance: Vec<ProvenanceEdge>,
}
