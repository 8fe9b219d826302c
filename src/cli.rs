// 🖥️ Command Line - clap surface for the orchestrator and each component
//
// `run` drives the whole pipeline from a TOML file and/or path flags. The
// per-registry subcommands run one harmonizer and write its facility CSV,
// which is handy when adding a new data drop.

use clap::{Args, Parser, Subcommand};
use std::path::PathBuf;
use tracing::Level;

/// ets-harmonize - harmonize ETS registry data and reconstruct free allocation
#[derive(Parser, Debug)]
#[command(name = "ets-harmonize")]
#[command(author, version, about, long_about = None)]
pub struct Cli {
    #[command(subcommand)]
    pub command: Command,

    /// Enable verbose (debug) logging
    #[arg(short, long, global = true)]
    pub verbose: bool,

    /// Only log warnings and errors
    #[arg(short, long, global = true, conflicts_with = "verbose")]
    pub quiet: bool,
}

impl Cli {
    pub fn parse_args() -> Self {
        Self::parse()
    }

    pub fn log_level(&self) -> Level {
        if self.verbose {
            Level::DEBUG
        } else if self.quiet {
            Level::WARN
        } else {
            Level::INFO
        }
    }
}

#[derive(Subcommand, Debug)]
pub enum Command {
    /// Run every configured harmonizer, aggregate, and write outputs
    Run(RunArgs),

    /// Harmonize an extracted EUTL directory
    Euets(EuEtsArgs),

    /// Harmonize UK ETS allocation and compliance tables
    Ukets(UkEtsArgs),

    /// Harmonize CARB MRR data and reconstruct free allocation
    California(CaliforniaArgs),

    /// Harmonize Washington emissions data and reconstruct free allocation
    Washington(WashingtonArgs),

    /// Aggregate a facility-year CSV into sector-year rows for one metric
    Aggregate(AggregateArgs),

    /// Map a code column of a CSV through a concordance
    MapCodes(MapCodesArgs),

    /// Print a default configuration file
    InitConfig {
        /// Write to this file instead of stdout
        #[arg(short, long)]
        output: Option<PathBuf>,
    },
}

/// Alpha overrides shared by every harmonizing subcommand
#[derive(Args, Debug, Clone, Default)]
pub struct AlphaArgs {
    /// Intensity exponent for the reconstructed metric (0-1)
    #[arg(long)]
    pub alpha: Option<f64>,

    /// Intensity exponent for the counterfactual metric (0-1)
    #[arg(long)]
    pub counterfactual_alpha: Option<f64>,
}

#[derive(Args, Debug, Clone, Default)]
pub struct RunArgs {
    /// Path to a TOML configuration file
    #[arg(short, long, env = "ETS_HARMONIZE_CONFIG")]
    pub config: Option<PathBuf>,

    /// Extracted EUTL directory (compliance.csv, installation.csv, nace_code.csv)
    #[arg(long)]
    pub eu_dir: Option<PathBuf>,

    /// UK ETS allocation table (long form)
    #[arg(long, requires = "uk_compliance")]
    pub uk_allocation: Option<PathBuf>,

    /// UK ETS compliance table (long form)
    #[arg(long, requires = "uk_allocation")]
    pub uk_compliance: Option<PathBuf>,

    /// UK permit -> NACE crosswalk
    #[arg(long)]
    pub uk_crosswalk: Option<PathBuf>,

    /// CARB MRR CSV file or directory of yearly files
    #[arg(long, requires = "ca_sector_totals")]
    pub ca_mrr: Option<PathBuf>,

    /// CARB allocation totals by sector and vintage
    #[arg(long, requires = "ca_mrr")]
    pub ca_sector_totals: Option<PathBuf>,

    /// Washington GHG reporting export
    #[arg(long, requires = "wa_subsector_totals")]
    pub wa_emissions: Option<PathBuf>,

    /// Washington EITE subsector allowance totals
    #[arg(long, requires = "wa_emissions")]
    pub wa_subsector_totals: Option<PathBuf>,

    /// NAICS -> NACE concordance CSV (built-in table when omitted)
    #[arg(long)]
    pub naics_concordance: Option<PathBuf>,

    /// Concordance for the secondary-code rollup
    #[arg(long)]
    pub secondary_concordance: Option<PathBuf>,

    #[command(flatten)]
    pub alphas: AlphaArgs,

    /// Facility-year output CSV
    #[arg(long)]
    pub out_facility: Option<PathBuf>,

    /// Sector-year output CSV
    #[arg(long)]
    pub out_sector: Option<PathBuf>,

    /// Secondary-code sector output CSV
    #[arg(long)]
    pub out_secondary: Option<PathBuf>,

    /// JSON run manifest
    #[arg(long)]
    pub manifest: Option<PathBuf>,
}

#[derive(Args, Debug, Clone)]
pub struct EuEtsArgs {
    /// Extracted EUTL directory
    pub dir: PathBuf,

    /// Keep rows of this reportedInSystem_id ("" keeps every system in the
    /// sector table; facility rows are EU ETS only)
    #[arg(long, default_value = "euets")]
    pub system_filter: String,

    #[command(flatten)]
    pub alphas: AlphaArgs,

    /// Facility-year output CSV
    #[arg(short, long, default_value = "output/euets_facility_year.csv")]
    pub output: PathBuf,
}

#[derive(Args, Debug, Clone)]
pub struct UkEtsArgs {
    /// Allocation table (long form)
    pub allocation: PathBuf,

    /// Compliance table (long form)
    pub compliance: PathBuf,

    /// Permit -> NACE crosswalk
    #[arg(long)]
    pub crosswalk: Option<PathBuf>,

    /// Rename a source column, e.g. --column "permit_id=Permit ID" (repeatable).
    /// Fields: permit_id, year, allocation_total, installation_id,
    /// installation_name, operator_name, recorded_emissions,
    /// allowances_surrendered, nace_code, nace_description, isic4_code
    #[arg(long = "column", value_name = "FIELD=NAME", value_parser = parse_column_override)]
    pub columns: Vec<(String, String)>,

    #[command(flatten)]
    pub alphas: AlphaArgs,

    #[arg(short, long, default_value = "output/ukets_facility_year.csv")]
    pub output: PathBuf,
}

#[derive(Args, Debug, Clone)]
pub struct CaliforniaArgs {
    /// MRR CSV file or directory of yearly files
    pub mrr: PathBuf,

    /// Allocation totals by sector and vintage
    pub sector_totals: PathBuf,

    /// Sector pattern rules CSV (built-in rules when omitted)
    #[arg(long)]
    pub rules: Option<PathBuf>,

    /// Benchmark intensities by sector
    #[arg(long)]
    pub benchmarks: Option<PathBuf>,

    /// Assistance factors by year and sector
    #[arg(long)]
    pub assistance_factors: Option<PathBuf>,

    /// One row per reporting obligation instead of one per ARB ID
    #[arg(long)]
    pub obligation_fanout: bool,

    /// Observed-intensity column in the MRR table
    #[arg(long)]
    pub intensity_column: Option<String>,

    /// NAICS -> NACE concordance CSV
    #[arg(long)]
    pub naics_concordance: Option<PathBuf>,

    #[command(flatten)]
    pub alphas: AlphaArgs,

    #[arg(short, long, default_value = "output/california_facility_year.csv")]
    pub output: PathBuf,
}

#[derive(Args, Debug, Clone)]
pub struct WashingtonArgs {
    /// GHG reporting export
    pub emissions: PathBuf,

    /// EITE subsector allowance totals
    pub subsector_totals: PathBuf,

    /// Keep reporters whatever their CCA status
    #[arg(long)]
    pub include_uncovered: bool,

    /// NAICS -> NACE concordance CSV
    #[arg(long)]
    pub naics_concordance: Option<PathBuf>,

    /// NAICS -> EITE subsector concordance CSV
    #[arg(long)]
    pub subsector_concordance: Option<PathBuf>,

    #[command(flatten)]
    pub alphas: AlphaArgs,

    #[arg(short, long, default_value = "output/washington_facility_year.csv")]
    pub output: PathBuf,
}

#[derive(Args, Debug, Clone)]
pub struct AggregateArgs {
    /// Facility-year CSV written by this tool
    pub facility: PathBuf,

    /// observed, reconstructed or counterfactual
    #[arg(short, long, default_value = "observed")]
    pub metric: String,

    #[arg(short, long, default_value = "output/sector_year.csv")]
    pub output: PathBuf,
}

#[derive(Args, Debug, Clone)]
pub struct MapCodesArgs {
    /// Input CSV
    pub input: PathBuf,

    /// Column holding the codes to map
    #[arg(short, long)]
    pub column: String,

    /// Source taxonomy of the codes
    #[arg(short, long, default_value = "NAICS")]
    pub taxonomy: String,

    /// Concordance CSV (built-in NAICS table when omitted)
    #[arg(long)]
    pub concordance: Option<PathBuf>,

    #[arg(short, long, default_value = "output/mapped_codes.csv")]
    pub output: PathBuf,
}

fn parse_column_override(s: &str) -> Result<(String, String), String> {
    match s.split_once('=') {
        Some((field, name)) if !field.trim().is_empty() && !name.trim().is_empty() => {
            Ok((field.trim().to_string(), name.trim().to_string()))
        }
        _ => Err(format!("expected FIELD=NAME, got '{}'", s)),
    }
}

// ============================================================================
// TESTS
// ============================================================================
