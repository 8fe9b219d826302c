// ⚙️ Pipeline Configuration - TOML file + CLI overrides
//
// A source is enabled by the presence of its `[sources.<name>]` table (or the
// matching path flags). Every other setting has a default, so an empty file
// is a valid configuration that enables nothing.

use crate::allocation::Alpha;
use crate::cli::RunArgs;
use crate::error::HarmonizeError;
use crate::harmonizers::california::CaliforniaColumns;
use crate::harmonizers::{AllocationSettings, CaliforniaOptions, EuEtsOptions, UkEtsColumns, WashingtonOptions};
use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

/// Root configuration structure
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Config {
    #[serde(default)]
    pub allocation: AllocationConfig,

    #[serde(default)]
    pub concordance: ConcordanceConfig,

    #[serde(default)]
    pub output: OutputConfig,

    #[serde(default)]
    pub sources: SourcesConfig,
}

// ============================================================================
// SECTIONS
// ============================================================================

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AllocationConfig {
    /// Intensity exponent for the reconstructed metric
    #[serde(default = "default_hybrid_alpha")]
    pub hybrid_alpha: f64,

    /// Intensity exponent for the counterfactual metric
    #[serde(default)]
    pub counterfactual_alpha: f64,
}

impl Default for AllocationConfig {
    fn default() -> Self {
        Self {
            hybrid_alpha: default_hybrid_alpha(),
            counterfactual_alpha: 0.0,
        }
    }
}

fn default_hybrid_alpha() -> f64 {
    0.5
}

/// Concordance files; built-in tables are used when a path is absent
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ConcordanceConfig {
    pub naics: Option<PathBuf>,
    pub wa_subsectors: Option<PathBuf>,
    /// Enables the secondary-code rollup
    pub secondary: Option<PathBuf>,
    #[serde(default = "default_secondary_taxonomy")]
    pub secondary_taxonomy: String,
}

impl Default for ConcordanceConfig {
    fn default() -> Self {
        Self {
            naics: None,
            wa_subsectors: None,
            secondary: None,
            secondary_taxonomy: default_secondary_taxonomy(),
        }
    }
}

fn default_secondary_taxonomy() -> String {
    "ISIC4".to_string()
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OutputConfig {
    #[serde(default = "default_facility_output")]
    pub facility: PathBuf,

    #[serde(default = "default_sector_output")]
    pub sector: PathBuf,

    #[serde(default)]
    pub secondary: Option<PathBuf>,

    #[serde(default)]
    pub manifest: Option<PathBuf>,
}

impl Default for OutputConfig {
    fn default() -> Self {
        Self {
            facility: default_facility_output(),
            sector: default_sector_output(),
            secondary: None,
            manifest: None,
        }
    }
}

fn default_facility_output() -> PathBuf {
    PathBuf::from("output/facility_year.csv")
}

fn default_sector_output() -> PathBuf {
    PathBuf::from("output/sector_year.csv")
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct SourcesConfig {
    pub euets: Option<EuEtsSource>,
    pub ukets: Option<UkEtsSource>,
    pub california: Option<CaliforniaSource>,
    pub washington: Option<WashingtonSource>,
}

impl SourcesConfig {
    pub fn enabled_count(&self) -> usize {
        [
            self.euets.is_some(),
            self.ukets.is_some(),
            self.california.is_some(),
            self.washington.is_some(),
        ]
        .iter()
        .filter(|on| **on)
        .count()
    }
}

// ============================================================================
// SOURCES
// ============================================================================

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EuEtsSource {
    pub dir: PathBuf,

    /// Keep rows of this reportedInSystem_id; empty keeps every system in
    /// the sector table. Facility rows are EU ETS only.
    #[serde(default = "default_system_filter")]
    pub system_filter: String,
}

fn default_system_filter() -> String {
    "euets".to_string()
}

impl EuEtsSource {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self {
            dir: dir.into(),
            system_filter: default_system_filter(),
        }
    }

    pub fn options(&self) -> EuEtsOptions {
        EuEtsOptions {
            system_filter: Some(self.system_filter.trim().to_string()).filter(|s| !s.is_empty()),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct UkEtsSource {
    pub allocation: PathBuf,
    pub compliance: PathBuf,
    #[serde(default)]
    pub crosswalk: Option<PathBuf>,
    #[serde(default)]
    pub columns: UkEtsColumns,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CaliforniaSource {
    /// MRR CSV file or a directory of yearly CSVs
    pub mrr: PathBuf,
    pub sector_totals: PathBuf,
    #[serde(default)]
    pub rules: Option<PathBuf>,
    #[serde(default)]
    pub benchmarks: Option<PathBuf>,
    #[serde(default)]
    pub assistance_factors: Option<PathBuf>,
    #[serde(default)]
    pub obligation_fanout: bool,
    #[serde(default)]
    pub intensity_column: Option<String>,
    #[serde(default)]
    pub columns: CaliforniaColumns,
}

impl CaliforniaSource {
    pub fn new(mrr: impl Into<PathBuf>, sector_totals: impl Into<PathBuf>) -> Self {
        Self {
            mrr: mrr.into(),
            sector_totals: sector_totals.into(),
            rules: None,
            benchmarks: None,
            assistance_factors: None,
            obligation_fanout: false,
            intensity_column: None,
            columns: CaliforniaColumns::default(),
        }
    }

    pub fn options(&self) -> CaliforniaOptions {
        CaliforniaOptions {
            columns: self.columns.clone(),
            obligation_fanout: self.obligation_fanout,
            intensity_column: self.intensity_column.clone(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WashingtonSource {
    pub emissions: PathBuf,
    pub subsector_totals: PathBuf,
    #[serde(default = "default_keep_only_covered")]
    pub keep_only_covered: bool,
}

fn default_keep_only_covered() -> bool {
    true
}

impl WashingtonSource {
    pub fn options(&self) -> WashingtonOptions {
        WashingtonOptions {
            keep_only_covered: self.keep_only_covered,
        }
    }
}

// ============================================================================
// LOAD / MERGE / VALIDATE
// ============================================================================

impl Config {
    /// Load configuration from a TOML file
    pub fn load(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read config file: {}", path.display()))?;

        let config: Config = toml::from_str(&content)
            .with_context(|| format!("Failed to parse config file: {}", path.display()))?;

        Ok(config)
    }

    /// Apply `run` flags on top of the file. Flags only override what they set.
    pub fn merge_with_args(&mut self, args: &RunArgs) {
        if let Some(alpha) = args.alphas.alpha {
            self.allocation.hybrid_alpha = alpha;
        }
        if let Some(alpha) = args.alphas.counterfactual_alpha {
            self.allocation.counterfactual_alpha = alpha;
        }

        if let Some(dir) = &args.eu_dir {
            match &mut self.sources.euets {
                Some(eu) => eu.dir = dir.clone(),
                None => self.sources.euets = Some(EuEtsSource::new(dir.clone())),
            }
        }

        if let (Some(allocation), Some(compliance)) = (&args.uk_allocation, &args.uk_compliance) {
            let columns = self
                .sources
                .ukets
                .as_ref()
                .map(|uk| uk.columns.clone())
                .unwrap_or_default();
            let crosswalk = args
                .uk_crosswalk
                .clone()
                .or_else(|| self.sources.ukets.as_ref().and_then(|uk| uk.crosswalk.clone()));
            self.sources.ukets = Some(UkEtsSource {
                allocation: allocation.clone(),
                compliance: compliance.clone(),
                crosswalk,
                columns,
            });
        } else if let (Some(crosswalk), Some(uk)) = (&args.uk_crosswalk, &mut self.sources.ukets) {
            uk.crosswalk = Some(crosswalk.clone());
        }

        if let (Some(mrr), Some(totals)) = (&args.ca_mrr, &args.ca_sector_totals) {
            match &mut self.sources.california {
                Some(ca) => {
                    ca.mrr = mrr.clone();
                    ca.sector_totals = totals.clone();
                }
                None => self.sources.california = Some(CaliforniaSource::new(mrr.clone(), totals.clone())),
            }
        }

        if let (Some(emissions), Some(totals)) = (&args.wa_emissions, &args.wa_subsector_totals) {
            let keep_only_covered = self
                .sources
                .washington
                .as_ref()
                .map_or_else(default_keep_only_covered, |wa| wa.keep_only_covered);
            self.sources.washington = Some(WashingtonSource {
                emissions: emissions.clone(),
                subsector_totals: totals.clone(),
                keep_only_covered,
            });
        }

        if let Some(path) = &args.naics_concordance {
            self.concordance.naics = Some(path.clone());
        }
        if let Some(path) = &args.secondary_concordance {
            self.concordance.secondary = Some(path.clone());
        }

        if let Some(path) = &args.out_facility {
            self.output.facility = path.clone();
        }
        if let Some(path) = &args.out_sector {
            self.output.sector = path.clone();
        }
        if let Some(path) = &args.out_secondary {
            self.output.secondary = Some(path.clone());
        }
        if let Some(path) = &args.manifest {
            self.output.manifest = Some(path.clone());
        }
    }

    /// Both alphas as validated engine settings
    pub fn settings(&self) -> Result<AllocationSettings, HarmonizeError> {
        Ok(AllocationSettings {
            hybrid_alpha: Alpha::new(self.allocation.hybrid_alpha)?,
            counterfactual_alpha: Alpha::new(self.allocation.counterfactual_alpha)?,
        })
    }

    /// Every input path the configuration references
    pub fn input_paths(&self) -> Vec<&Path> {
        let mut paths: Vec<&Path> = Vec::new();
        let c = &self.concordance;
        paths.extend([&c.naics, &c.wa_subsectors, &c.secondary].into_iter().flatten().map(|p| p.as_path()));

        let s = &self.sources;
        if let Some(eu) = &s.euets {
            paths.push(&eu.dir);
        }
        if let Some(uk) = &s.ukets {
            paths.push(&uk.allocation);
            paths.push(&uk.compliance);
            paths.extend(uk.crosswalk.as_deref());
        }
        if let Some(ca) = &s.california {
            paths.push(&ca.mrr);
            paths.push(&ca.sector_totals);
            paths.extend([&ca.rules, &ca.benchmarks, &ca.assistance_factors].into_iter().flatten().map(|p| p.as_path()));
        }
        if let Some(wa) = &s.washington {
            paths.push(&wa.emissions);
            paths.push(&wa.subsector_totals);
        }
        paths
    }

    /// Fail fast on settings that would abort the run halfway
    pub fn validate(&self) -> Result<(), HarmonizeError> {
        self.settings()?;

        if self.sources.enabled_count() == 0 {
            return Err(HarmonizeError::NoSourcesEnabled);
        }
        if self.output.secondary.is_some() && self.concordance.secondary.is_none() {
            return Err(HarmonizeError::InvalidConfig(
                "output.secondary is set but concordance.secondary is not".to_string(),
            ));
        }
        if let Some(path) = self.input_paths().into_iter().find(|p| !p.exists()) {
            return Err(HarmonizeError::MissingFile(path.to_path_buf()));
        }
        Ok(())
    }

    /// Generate a default configuration file content
    pub fn default_toml() -> String {
        let config = Config::default();
        toml::to_string_pretty(&config).unwrap_or_else(|_| String::new())
    }
}

// ============================================================================
// TESTS
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config() {
        let config = Config::default();
        assert_eq!(config.allocation.hybrid_alpha, 0.5);
        assert_eq!(config.allocation.counterfactual_alpha, 0.0);
        assert_eq!(config.concordance.secondary_taxonomy, "ISIC4");
        assert_eq!(config.output.facility, PathBuf::from("output/facility_year.csv"));
        assert_eq!(config.sources.enabled_count(), 0);
    }

    #[test]
    fn test_parse_config() {
        let toml_content = r#"
[allocation]
hybrid_alpha = 0.3

[output]
sector = "out/sector.csv"
manifest = "out/manifest.json"

[sources.euets]
dir = "data/eutl"

[sources.ukets]
allocation = "data/uk/allocation.csv"
compliance = "data/uk/compliance.csv"

[sources.ukets.columns]
permit_id = "Permit ID"

[sources.california]
mrr = "data/carb/mrr"
sector_totals = "data/carb/totals.csv"
obligation_fanout = true

[sources.washington]
emissions = "data/wa/emissions.csv"
subsector_totals = "data/wa/totals.csv"
keep_only_covered = false
"#;

        let config: Config = toml::from_str(toml_content).unwrap();
        assert_eq!(config.allocation.hybrid_alpha, 0.3);
        assert_eq!(config.allocation.counterfactual_alpha, 0.0);
        assert_eq!(config.output.facility, PathBuf::from("output/facility_year.csv"));
        assert_eq!(config.output.sector, PathBuf::from("out/sector.csv"));
        assert_eq!(config.sources.enabled_count(), 4);

        let eu = config.sources.euets.as_ref().unwrap();
        assert_eq!(eu.options().system_filter.as_deref(), Some("euets"));

        let uk = config.sources.ukets.as_ref().unwrap();
        assert_eq!(uk.columns.permit_id, "Permit ID");
        assert_eq!(uk.columns.year, "year");

        let ca = config.sources.california.as_ref().unwrap();
        assert!(ca.options().obligation_fanout);
        assert_eq!(ca.columns.arb_id, "arb_id");

        assert!(!config.sources.washington.as_ref().unwrap().options().keep_only_covered);
        println!("✅ TOML configuration parsed with defaults filled in");
    }

    #[test]
    fn test_empty_system_filter_keeps_all() {
        let mut eu = EuEtsSource::new("data/eutl");
        eu.system_filter = "  ".to_string();
        assert_eq!(eu.options().system_filter, None);
    }

    #[test]
    fn test_merge_with_args() {
        let mut config = Config::default();
        config.sources.washington = Some(WashingtonSource {
            emissions: PathBuf::from("old.csv"),
            subsector_totals: PathBuf::from("old_totals.csv"),
            keep_only_covered: false,
        });

        let mut args = RunArgs::default();
        args.alphas.counterfactual_alpha = Some(0.2);
        args.ca_mrr = Some(PathBuf::from("mrr.csv"));
        args.ca_sector_totals = Some(PathBuf::from("totals.csv"));
        args.wa_emissions = Some(PathBuf::from("wa.csv"));
        args.wa_subsector_totals = Some(PathBuf::from("wa_totals.csv"));
        args.manifest = Some(PathBuf::from("manifest.json"));
        config.merge_with_args(&args);

        assert_eq!(config.allocation.hybrid_alpha, 0.5);
        assert_eq!(config.allocation.counterfactual_alpha, 0.2);
        assert_eq!(config.sources.california.as_ref().unwrap().mrr, PathBuf::from("mrr.csv"));
        let wa = config.sources.washington.as_ref().unwrap();
        assert_eq!(wa.emissions, PathBuf::from("wa.csv"));
        assert!(!wa.keep_only_covered);
        assert_eq!(config.output.manifest, Some(PathBuf::from("manifest.json")));
        assert!(config.sources.euets.is_none());
    }

    #[test]
    fn test_validate_rejects_bad_alpha() {
        let mut config = Config::default();
        config.sources.euets = Some(EuEtsSource::new("."));
        config.allocation.hybrid_alpha = 1.5;

        let err = config.validate().unwrap_err();
        assert!(matches!(err, HarmonizeError::AlphaOutOfRange(a) if a == 1.5));
    }

    #[test]
    fn test_validate_requires_a_source() {
        let err = Config::default().validate().unwrap_err();
        assert!(matches!(err, HarmonizeError::NoSourcesEnabled));
    }

    #[test]
    fn test_validate_reports_missing_path() {
        let dir = tempfile::tempdir().unwrap();
        let mut config = Config::default();
        config.sources.euets = Some(EuEtsSource::new(dir.path()));
        assert!(config.validate().is_ok());

        config.concordance.naics = Some(dir.path().join("missing.csv"));
        match config.validate().unwrap_err() {
            HarmonizeError::MissingFile(path) => assert!(path.ends_with("missing.csv")),
            other => panic!("expected MissingFile, got {other}"),
        }
    }

    #[test]
    fn test_default_toml_round_trips() {
        let content = Config::default_toml();
        assert!(content.contains("hybrid_alpha = 0.5"));
        let parsed: Config = toml::from_str(&content).unwrap();
        assert_eq!(parsed, Config::default());
    }
}
