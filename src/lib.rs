// ETS Harmonizer - Core Library
// Exposes all modules for use in the CLI and tests

pub mod error;
pub mod config;
pub mod cli;
pub mod parser;
pub mod schema;
pub mod concordance;
pub mod rules;          // Pattern rules: free-text sector labels -> allocation sectors
pub mod allocation;     // Option 3 weighted allocation engine
pub mod reconciliation; // Conservation check against cohort totals
pub mod data_quality;   // Non-blocking validation flags
pub mod harmonizers;    // EU ETS, UK ETS, California, Washington
pub mod aggregate;
pub mod pipeline;
pub mod output;

// Re-export commonly used types
pub use error::HarmonizeError;
pub use config::Config;
pub use parser::RawTable;
pub use schema::{AllocationMetric, FacilityYear, SectorYear, SystemId};
pub use concordance::{Concordance, ConcordanceMatch, ConcordanceRule};
pub use rules::{SectorRule, SectorRuleSet};
pub use allocation::{allocate, Alpha, Option3, WeightSignal};
pub use reconciliation::{ConservationEngine, ConservationReport, ConservationSummary};
pub use data_quality::{DataQualityEngine, QualityReport};
pub use harmonizers::{
    AllocationSettings, Harmonized, Harmonizer,
    CaliforniaHarmonizer, EuEtsHarmonizer, UkEtsHarmonizer, WashingtonHarmonizer,
};
pub use aggregate::{aggregate, rollup, SecondarySectorYear};
pub use pipeline::{run, PipelineOutput, RunStats};
pub use output::Manifest;

/// Library version
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
