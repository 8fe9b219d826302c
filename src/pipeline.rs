// 🚀 Pipeline Orchestrator - configured sources in, facility/sector tables out
//
// 1. Build a harmonizer for every enabled source
// 2. Harmonize and concatenate facility-years, then flag data-quality issues
// 3. Aggregate to sector-years once per allocation metric
// 4. Optionally roll sectors up to a secondary classification
// 5. Write CSVs and the run manifest

use crate::aggregate::{aggregate, rollup, SecondarySectorYear, SECONDARY_COLUMNS};
use crate::concordance::Concordance;
use crate::config::Config;
use crate::data_quality::{apply_flags, QualityReport};
use crate::error::HarmonizeError;
use crate::harmonizers::{
    CaliforniaHarmonizer, EuEtsHarmonizer, Harmonizer, UkEtsHarmonizer, WashingtonHarmonizer,
};
use crate::output::{write_csv, Manifest, OutputFile};
use crate::parser::RawTable;
use crate::reconciliation::ConservationSummary;
use crate::rules::{SectorRuleSet, DEFAULT_SECTOR};
use crate::schema::{AllocationMetric, FacilityYear, SectorYear, SystemId, FACILITY_COLUMNS, SECTOR_COLUMNS};
use anyhow::{Context, Result};
use std::collections::BTreeMap;
use std::ops::Range;
use std::path::Path;
use tracing::{info, warn};

// ============================================================================
// RESULTS
// ============================================================================

/// Counters describing one run
#[derive(Debug, Clone, Default)]
pub struct RunStats {
    /// Facility rows per system code
    pub systems: BTreeMap<String, usize>,
    pub conservation: ConservationSummary,
    pub quality: QualityReport,
    pub concordance_version: String,
}

/// Facility rows of every enabled source, before aggregation
pub struct HarmonizedSources {
    pub facility: Vec<FacilityYear>,
    pub stats: RunStats,
    slices: Vec<SystemSlice>,
}

/// Where one system's rows sit in the concatenated facility table
struct SystemSlice {
    rows: Range<usize>,
    native_sector: Option<Vec<SectorYear>>,
}

pub struct PipelineOutput {
    pub facility: Vec<FacilityYear>,
    pub sector: Vec<SectorYear>,
    pub secondary: Option<Vec<SecondarySectorYear>>,
    pub stats: RunStats,
}

// ============================================================================
// BUILD
// ============================================================================

/// NAICS concordance from the configured file, or the built-in table
pub fn naics_concordance(config: &Config) -> Result<Concordance> {
    match &config.concordance.naics {
        Some(path) => Concordance::from_csv_path(path, None),
        None => Concordance::naics_default(),
    }
}

fn optional_table(path: Option<&Path>) -> Result<Option<RawTable>> {
    path.map(RawTable::from_csv_path).transpose()
}

/// One harmonizer per enabled source, in EU, UK, California, Washington order
pub fn build_harmonizers(config: &Config) -> Result<Vec<Box<dyn Harmonizer>>> {
    let settings = config.settings()?;
    let sources = &config.sources;
    let mut harmonizers: Vec<Box<dyn Harmonizer>> = Vec::new();

    if let Some(eu) = &sources.euets {
        harmonizers.push(Box::new(EuEtsHarmonizer::from_dir(&eu.dir, eu.options(), settings)?));
    }

    if let Some(uk) = &sources.ukets {
        harmonizers.push(Box::new(UkEtsHarmonizer::from_paths(
            &uk.allocation,
            &uk.compliance,
            uk.crosswalk.as_deref(),
            uk.columns.clone(),
            settings,
        )?));
    }

    if let Some(ca) = &sources.california {
        let options = ca.options();
        let rules = match &ca.rules {
            Some(path) => SectorRuleSet::from_csv_path(path, DEFAULT_SECTOR)?,
            None => SectorRuleSet::carb_default()?,
        };
        let harmonizer = CaliforniaHarmonizer::new(
            CaliforniaHarmonizer::load_mrr(&ca.mrr, &options)?,
            RawTable::from_csv_path(&ca.sector_totals)?,
            rules,
            naics_concordance(config)?,
            options,
            settings,
        )
        .with_benchmarks(optional_table(ca.benchmarks.as_deref())?)
        .with_assistance_factors(optional_table(ca.assistance_factors.as_deref())?);
        harmonizers.push(Box::new(harmonizer));
    }

    if let Some(wa) = &sources.washington {
        let subsectors = match &config.concordance.wa_subsectors {
            Some(path) => Concordance::from_csv_path(path, None)?,
            None => Concordance::wa_subsectors_default()?,
        };
        harmonizers.push(Box::new(WashingtonHarmonizer::from_paths(
            &wa.emissions,
            &wa.subsector_totals,
            subsectors,
            naics_concordance(config)?,
            wa.options(),
            settings,
        )?));
    }

    if harmonizers.is_empty() {
        return Err(HarmonizeError::NoSourcesEnabled.into());
    }
    Ok(harmonizers)
}

// ============================================================================
// RUN
// ============================================================================

/// Run every enabled harmonizer and flag the concatenated facility rows
pub fn harmonize(config: &Config) -> Result<HarmonizedSources> {
    let harmonizers = build_harmonizers(config)?;
    let mut facility = Vec::new();
    let mut slices = Vec::new();
    let mut stats = RunStats {
        concordance_version: naics_concordance(config)?.version().to_string(),
        ..RunStats::default()
    };

    for h in &harmonizers {
        let system = h.system();
        let out = h
            .harmonize()
            .with_context(|| format!("{} harmonizer failed", system.name()))?;
        let native_sector = h
            .native_sector()
            .with_context(|| format!("{} sector aggregation failed", system.name()))?;

        let conservation = ConservationSummary::from(&out.conservation);
        if conservation.discrepancies > 0 {
            warn!(system = %system.code(), cohorts = conservation.discrepancies, "allocations do not add up to cohort totals");
        }
        stats.conservation.add(conservation);
        *stats.systems.entry(system.code().to_string()).or_insert(0) += out.rows.len();

        let start = facility.len();
        facility.extend(out.rows);
        slices.push(SystemSlice {
            rows: start..facility.len(),
            native_sector,
        });
    }

    stats.quality = apply_flags(&mut facility);
    info!("✅ {}", stats.quality.summary());

    Ok(HarmonizedSources {
        facility,
        stats,
        slices,
    })
}

/// Sector rows for every metric, observed then reconstructed then counterfactual
fn sector_rows(sources: &HarmonizedSources) -> Vec<SectorYear> {
    let mut sector = Vec::new();
    for metric in AllocationMetric::ALL {
        for slice in &sources.slices {
            match (&slice.native_sector, metric) {
                (Some(native), AllocationMetric::Observed) => sector.extend(native.iter().cloned()),
                _ => sector.extend(aggregate(&sources.facility[slice.rows.clone()], metric)),
            }
        }
    }
    sector
}

/// Full run: harmonize, aggregate, roll up
pub fn run(config: &Config) -> Result<PipelineOutput> {
    config.validate()?;
    let sources = harmonize(config)?;
    let sector = sector_rows(&sources);
    info!(facility = sources.facility.len(), sector = sector.len(), "📊 sector tables built");

    let secondary = match &config.concordance.secondary {
        Some(path) => {
            let concordance = Concordance::from_csv_path(path, None)?;
            Some(rollup(&sector, &concordance, &config.concordance.secondary_taxonomy))
        }
        None => None,
    };

    Ok(PipelineOutput {
        facility: sources.facility,
        sector,
        secondary,
        stats: sources.stats,
    })
}

/// Write every configured output; returns what was written
pub fn write_outputs(config: &Config, output: &PipelineOutput) -> Result<Vec<OutputFile>> {
    let out = &config.output;
    let mut written = Vec::new();

    let rows = write_csv(&out.facility, &output.facility, FACILITY_COLUMNS)?;
    written.push(OutputFile::describe(&out.facility, rows)?);

    let rows = write_csv(&out.sector, &output.sector, SECTOR_COLUMNS)?;
    written.push(OutputFile::describe(&out.sector, rows)?);

    if let (Some(path), Some(secondary)) = (&out.secondary, &output.secondary) {
        let rows = write_csv(path, secondary, SECONDARY_COLUMNS)?;
        written.push(OutputFile::describe(path, rows)?);
    }

    if let Some(path) = &out.manifest {
        let mut manifest = Manifest::new(
            config.allocation.hybrid_alpha,
            config.allocation.counterfactual_alpha,
            output.stats.concordance_version.clone(),
        );
        manifest.systems = output.stats.systems.clone();
        manifest.conservation = output.stats.conservation;
        manifest.quality = output.stats.quality;
        manifest.outputs = written.clone();
        manifest.write(path)?;
        info!(path = %path.display(), "🧾 run manifest written");
    }

    Ok(written)
}

/// Systems that produced rows, for display
pub fn system_names(stats: &RunStats) -> Vec<&'static str> {
    [SystemId::EuEts, SystemId::UkEts, SystemId::California, SystemId::Washington]
        .into_iter()
        .filter(|s| stats.systems.contains_key(s.code()))
        .map(|s| s.name())
        .collect()
}

// ============================================================================
// TESTS
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{UkEtsSource, WashingtonSource};
    use crate::harmonizers::UkEtsColumns;
    use std::path::PathBuf;

    const UK_ALLOCATION: &str = "\
permit_id,year,allocation_total
UK-1,2022,600
UK-2,2022,400
UK-3,2022,50
";

    const UK_COMPLIANCE: &str = "\
permit_id,year,recorded_emissions,allowances_surrendered,nace_code,isic4_code
UK-1,2022,1000,1000,24.1,241
UK-2,2022,3000,2900,24.1,241
UK-3,2022,70,70,,
";

    const WA_EMISSIONS: &str = "\
Reporter,Year,Sector,Subsector,Primary NAICS Code,City,County,Jurisdiction,Reported Emissions (MTCO2e),CCA Status
Acme Refining,2023,Industrial,Refinery,324110,Anacortes,Skagit,Anacortes,1500,Covered Entity
Cement Co,2023,Industrial,Cement,327310,Seattle,King,Seattle,300,Covered Entity
Gas Utility,2023,Utility,Natural gas,221210,Spokane,Spokane,Spokane,9000,Covered Entity
";

    const WA_TOTALS: &str = "\
allocation_year,subsector,total_allowances
2023,Petroleum Refining and Chemical Manufacturing,1200
2023,\"Pulp, Paper and Cement Manufacturing\",250
";

    fn fixture_config(dir: &Path) -> Config {
        let write = |name: &str, content: &str| -> PathBuf {
            let path = dir.join(name);
            std::fs::write(&path, content).unwrap();
            path
        };

        let mut config = Config::default();
        config.sources.ukets = Some(UkEtsSource {
            allocation: write("uk_allocation.csv", UK_ALLOCATION),
            compliance: write("uk_compliance.csv", UK_COMPLIANCE),
            crosswalk: None,
            columns: UkEtsColumns::default(),
        });
        config.sources.washington = Some(WashingtonSource {
            emissions: write("wa_emissions.csv", WA_EMISSIONS),
            subsector_totals: write("wa_totals.csv", WA_TOTALS),
            keep_only_covered: true,
        });
        config.output.facility = dir.join("out/facility_year.csv");
        config.output.sector = dir.join("out/sector_year.csv");
        config.output.manifest = Some(dir.join("out/manifest.json"));
        config
    }

    #[test]
    fn test_no_sources_is_fatal() {
        let err = build_harmonizers(&Config::default()).err().unwrap();
        assert!(matches!(
            err.downcast_ref::<HarmonizeError>(),
            Some(HarmonizeError::NoSourcesEnabled)
        ));

        let err = run(&Config::default()).err().unwrap();
        assert!(matches!(
            err.downcast_ref::<HarmonizeError>(),
            Some(HarmonizeError::NoSourcesEnabled)
        ));
    }

    #[test]
    fn test_missing_input_is_fatal() {
        let dir = tempfile::tempdir().unwrap();
        let mut config = fixture_config(dir.path());
        if let Some(uk) = config.sources.ukets.as_mut() {
            uk.compliance = dir.path().join("absent.csv");
        }

        let err = run(&config).err().unwrap();
        assert!(matches!(
            err.downcast_ref::<HarmonizeError>(),
            Some(HarmonizeError::MissingFile(_))
        ));
    }

    #[test]
    fn test_end_to_end_run() {
        let dir = tempfile::tempdir().unwrap();
        let config = fixture_config(dir.path());

        let output = run(&config).unwrap();

        // 3 UK permits + 3 covered WA reporters
        assert_eq!(output.facility.len(), 6);
        assert_eq!(output.stats.systems.get("ukets"), Some(&3));
        assert_eq!(output.stats.systems.get("washington_cca"), Some(&3));
        assert_eq!(output.stats.concordance_version, "naics-nace-first-pass-v1");
        assert_eq!(output.stats.conservation.discrepancies, 0);
        assert_eq!(system_names(&output.stats), vec!["UK ETS", "Washington Cap-and-Invest"]);

        // UK counterfactual spreads observed cohort totals by emissions (alpha = 0)
        let uk2 = output.facility.iter().find(|f| f.facility_id == "UK-2").unwrap();
        assert!((uk2.allocation_counterfactual_free.unwrap() - 750.0).abs() < 1e-9);

        // WA: single-member cohorts receive the whole subsector total
        let acme = output
            .facility
            .iter()
            .find(|f| f.facility_name.as_deref() == Some("Acme Refining"))
            .unwrap();
        assert!((acme.allocation_reconstructed_free.unwrap() - 1200.0).abs() < 1e-9);
        let utility = output
            .facility
            .iter()
            .find(|f| f.facility_name.as_deref() == Some("Gas Utility"))
            .unwrap();
        assert_eq!(utility.allocation_reconstructed_free, None);

        // Every metric is present in the sector table
        for metric in AllocationMetric::ALL {
            assert!(output.sector.iter().any(|s| s.allocation_metric == metric));
        }
        let uk_steel = output
            .sector
            .iter()
            .find(|s| {
                s.system_id == "ukets"
                    && s.allocation_metric == AllocationMetric::Observed
                    && s.nace_code.as_deref() == Some("24.1")
            })
            .unwrap();
        assert_eq!(uk_steel.allocated_free, Some(1000.0));
        assert_eq!(uk_steel.verified, Some(4000.0));
        assert_eq!(uk_steel.free_share, Some(0.25));
        assert!(output.secondary.is_none());

        let written = write_outputs(&config, &output).unwrap();
        assert_eq!(written.len(), 2);
        assert_eq!(written[0].rows, 6);
        assert_eq!(written[0].sha256.len(), 64);
        assert!(dir.path().join("out/manifest.json").exists());

        let back = crate::output::read_facility_csv(&config.output.facility).unwrap();
        assert_eq!(back.len(), 6);
        println!("✅ Pipeline ran end to end on UK and WA fixtures");
    }

    #[test]
    fn test_secondary_rollup() {
        let dir = tempfile::tempdir().unwrap();
        let mut config = fixture_config(dir.path());
        let secondary = dir.path().join("isic4_to_isic3.csv");
        std::fs::write(
            &secondary,
            "source_taxonomy,source_prefix,target_code,target_description\nISIC4,24,27,Basic metals\n",
        )
        .unwrap();
        config.concordance.secondary = Some(secondary);
        config.output.secondary = Some(dir.path().join("out/secondary.csv"));

        let output = run(&config).unwrap();
        let rolled = output.secondary.as_ref().unwrap();
        let metals = rolled
            .iter()
            .find(|r| r.allocation_metric == AllocationMetric::Observed && r.secondary_code.as_deref() == Some("27"))
            .unwrap();
        assert_eq!(metals.allocated_free, Some(1000.0));

        let written = write_outputs(&config, &output).unwrap();
        assert_eq!(written.len(), 3);
    }
}
