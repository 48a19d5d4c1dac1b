use config::{Config, Environment, File, FileFormat};
use serde::Deserialize;

use crate::error::Result;

/// How `apply_diff` maintains registered views: re-derive each affected
/// view from scratch, or propagate only the delta (with documented
/// fallbacks to a full re-run).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ExecutionStrategy {
    Full,
    Incremental,
}

/// Runtime configuration, layered from defaults, an optional
/// `deriva.toml`, and `DERIVA_*` environment variables.
#[derive(Debug, Clone, Deserialize)]
pub struct Settings {
    pub execution_strategy: ExecutionStrategy,
    /// Maximum scheduler rounds per `apply_diff` before giving up with a
    /// non-convergence error. 0 disables the cap.
    pub round_cap: u64,
    pub snapshot_file: String,
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            execution_strategy: ExecutionStrategy::Incremental,
            round_cap: 10_000,
            snapshot_file: "deriva.snapshot.json".to_owned(),
        }
    }
}

impl Settings {
    pub fn load() -> Result<Settings> {
        let config = Config::builder()
            .set_default("execution_strategy", "incremental")?
            .set_default("round_cap", 10_000i64)?
            .set_default("snapshot_file", "deriva.snapshot.json")?
            .add_source(File::new("deriva", FileFormat::Toml).required(false))
            .add_source(Environment::with_prefix("DERIVA"))
            .build()?;
        Ok(config.try_deserialize()?)
    }
}
