use thiserror::Error;

#[derive(Error, Debug)]
pub enum DerivaError {
    #[error("Config error: {0}")]
    Config(String),
    #[error("Unknown field {field:?} on table {table:?}")]
    SchemaField { table: String, field: String },
    #[error("Unbound variable {name:?} referenced")]
    UnboundVariable { name: String },
    #[error("Unknown join alias {alias:?} referenced")]
    UnknownAlias { alias: String },
    #[error("Malformed view definition for {view:?}: {reason}")]
    MalformedViewDefinition { view: String, reason: String },
    #[error("Invalid query: {0}")]
    InvalidQuery(String),
    #[error("Fixpoint did not converge within {rounds} rounds")]
    NonConvergence { rounds: u64 },
    #[error("Snapshot error: {0}")]
    Snapshot(String),
    #[error("Lock poisoned: {0}")]
    Lock(String),
}

pub type Result<T> = std::result::Result<T, DerivaError>;

// Helper conversions
impl From<config::ConfigError> for DerivaError {
    fn from(e: config::ConfigError) -> Self {
        Self::Config(e.to_string())
    }
}
