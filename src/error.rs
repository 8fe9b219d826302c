// 🚨 Harmonizer Errors - configuration and data errors that abort a run
//
// Everything here is fatal. Non-blocking data-quality problems are recorded
// as flag columns (see data_quality.rs) instead of errors.

use std::path::PathBuf;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum HarmonizeError {
    /// A configured input path does not exist
    #[error("required input file not found: {}", .0.display())]
    MissingFile(PathBuf),

    /// A parsed table lacks columns the harmonizer needs
    #[error("table '{table}' is missing required column(s): {}", .columns.join(", "))]
    MissingColumns { table: String, columns: Vec<String> },

    /// Nothing to harmonize
    #[error("no sources configured: provide the input paths for at least one registry")]
    NoSourcesEnabled,

    #[error("alpha must be within [0, 1], got {0}")]
    AlphaOutOfRange(f64),

    /// Entities reference cohorts that have no known aggregate total
    #[error("no cohort total for cohort(s): {}", .cohorts.join(", "))]
    MissingCohortTotals { cohorts: Vec<String> },

    #[error("benchmark intensity for cohort '{cohort}' must be finite and positive, got {value}")]
    InvalidBenchmark { cohort: String, value: f64 },

    /// A join that must be many-to-one found repeated keys on the lookup side
    #[error("table '{table}' has duplicate key(s): {}", .keys.join(", "))]
    DuplicateKey { table: String, keys: Vec<String> },

    /// A batch directory where not a single file could be parsed
    #[error("no parseable files in {}: {last_error}", .dir.display())]
    NoParseableFiles { dir: PathBuf, last_error: String },

    #[error("invalid sector pattern '{pattern}': {message}")]
    InvalidPattern { pattern: String, message: String },

    #[error("invalid configuration: {0}")]
    InvalidConfig(String),
}

impl HarmonizeError {
    pub fn missing_columns(table: impl Into<String>, columns: &[&str]) -> Self {
        HarmonizeError::MissingColumns {
            table: table.into(),
            columns: columns.iter().map(|c| c.to_string()).collect(),
        }
    }

    /// True for errors caused by how the run was configured (paths, columns, alpha, totals)
    pub fn is_configuration_error(&self) -> bool {
        !matches!(self, HarmonizeError::NoParseableFiles { .. })
    }
}
