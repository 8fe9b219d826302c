// 🌲 Washington Harmonizer - GHG reporting export + EITE subsector totals
//
// Ecology publishes no-cost allowances only as totals for a handful of
// emissions-intensive, trade-exposed (EITE) subsectors. Reporters are mapped
// to a subsector from their primary NAICS code and the subsector totals are
// spread over them; reporters outside every EITE subsector get no allocation.
//
// The emissions export is per reporter, not per installation. Rows sharing a
// reporter, jurisdiction and city in the same year are merged.
//
// Newer exports carry covered emissions next to reported emissions. When a
// row has them, covered emissions weight the allocation; reported emissions
// stay the verified figure.

use super::{allocate_cohorts, option3_source, AllocationSettings, Harmonized, Harmonizer, MissingTotals};
use crate::allocation::WeightSignal;
use crate::concordance::{Concordance, NAICS};
use crate::parser::RawTable;
use crate::reconciliation::ConservationReport;
use crate::schema::{FacilityYear, SystemId};
use anyhow::Result;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::path::Path;
use tracing::{info, warn};

pub const TOTALS_BASIS: &str = "Ecology EITE subsector totals";
pub const COVERED_ENTITY: &str = "Covered Entity";

const REQUIRED_COLUMNS: [&str; 6] = [
    "Reporter",
    "Year",
    "Primary NAICS Code",
    "City",
    "Jurisdiction",
    "Reported Emissions (MTCO2e)",
];

const COVERED_COLUMNS: [&str; 2] = ["Covered Emissions (MTCO2e)", "Covered Emissions (MT CO2e)"];

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct WashingtonOptions {
    /// Keep only rows whose CCA Status is "Covered Entity" (when the column exists)
    pub keep_only_covered: bool,
}

impl Default for WashingtonOptions {
    fn default() -> Self {
        WashingtonOptions {
            keep_only_covered: true,
        }
    }
}

/// Stable id for a reporter location: "wa_" + 12 hex chars of SHA-256
pub fn facility_id(reporter: &str, jurisdiction: Option<&str>, city: Option<&str>) -> String {
    let key = [Some(reporter), jurisdiction, city]
        .iter()
        .map(|p| p.unwrap_or("").trim().to_lowercase())
        .collect::<Vec<_>>()
        .join("|");
    let mut hasher = Sha256::new();
    hasher.update(key.as_bytes());
    let digest = format!("{:x}", hasher.finalize());
    format!("wa_{}", &digest[..12])
}

// ============================================================================
// HARMONIZER
// ============================================================================

pub struct WashingtonHarmonizer {
    emissions: RawTable,
    subsector_totals: RawTable,
    subsectors: Concordance,
    concordance: Concordance,
    options: WashingtonOptions,
    settings: AllocationSettings,
}

impl WashingtonHarmonizer {
    pub fn new(
        emissions: RawTable,
        subsector_totals: RawTable,
        subsectors: Concordance,
        concordance: Concordance,
        options: WashingtonOptions,
        settings: AllocationSettings,
    ) -> Self {
        WashingtonHarmonizer {
            emissions,
            subsector_totals,
            subsectors,
            concordance,
            options,
            settings,
        }
    }

    pub fn from_paths(
        emissions: &Path,
        subsector_totals: &Path,
        subsectors: Concordance,
        concordance: Concordance,
        options: WashingtonOptions,
        settings: AllocationSettings,
    ) -> Result<Self> {
        Ok(Self::new(
            RawTable::from_csv_path(emissions)?,
            RawTable::from_csv_path(subsector_totals)?,
            subsectors,
            concordance,
            options,
            settings,
        ))
    }

    /// "year|subsector" -> total allowances
    fn totals(&self) -> Result<BTreeMap<String, f64>> {
        let t = &self.subsector_totals;
        let cols = t.require(&["allocation_year", "subsector", "total_allowances"])?;
        let mut totals = BTreeMap::new();
        for row in 0..t.len() {
            if let (Some(year), Some(subsector), Some(total)) = (
                t.year(row, Some(cols[0])),
                t.text(row, Some(cols[1])),
                t.number(row, Some(cols[2])),
            ) {
                *totals.entry(cohort(year, &subsector)).or_insert(0.0) += total;
            }
        }
        Ok(totals)
    }

    /// Facility rows, one per (facility id, year), in first-seen order,
    /// each paired with its covered emissions when the export has them
    fn facility_rows(&self) -> Result<(Vec<FacilityYear>, Vec<Option<f64>>)> {
        let t = &self.emissions;
        let cols = t.require(&REQUIRED_COLUMNS)?;
        let col = |i: usize| Some(cols[i]);
        let status_col = t.column("CCA Status");
        let covered_col = t.column_any(&COVERED_COLUMNS);

        let mut rows: Vec<FacilityYear> = Vec::new();
        let mut covered: Vec<Option<f64>> = Vec::new();
        let mut seen: HashMap<(String, i32), usize> = HashMap::new();
        let mut merged = 0usize;
        let mut excluded = 0usize;

        for row in 0..t.len() {
            if self.options.keep_only_covered && status_col.is_some() {
                let covered = t
                    .get(row, status_col)
                    .map(|s| s.eq_ignore_ascii_case(COVERED_ENTITY))
                    .unwrap_or(false);
                if !covered {
                    excluded += 1;
                    continue;
                }
            }

            let (Some(reporter), Some(year)) = (t.text(row, col(0)), t.year(row, col(1))) else {
                continue;
            };
            let jurisdiction = t.get(row, col(4));
            let city = t.get(row, col(3));
            let id = facility_id(&reporter, jurisdiction, city);
            let reported = t.number(row, col(5));
            let covered_emissions = t.number(row, covered_col);
            let emissions = reported.or(covered_emissions);

            if let Some(&existing) = seen.get(&(id.clone(), year)) {
                let f = &mut rows[existing];
                f.emissions_verified = sum_present(f.emissions_verified, emissions);
                covered[existing] = sum_present(covered[existing], covered_emissions);
                merged += 1;
                continue;
            }

            let mut f = FacilityYear::new(SystemId::Washington, year, id.clone());
            f.facility_name = Some(reporter);
            f.native_code = t.text(row, col(2));
            f.emissions_verified = emissions;
            seen.insert((id, year), rows.len());
            rows.push(f);
            covered.push(covered_emissions);
        }

        if excluded > 0 {
            info!(rows = excluded, "WA rows outside CCA coverage excluded");
        }
        if merged > 0 {
            warn!(
                rows = merged,
                "WA reporter rows sharing a facility id and year were merged (emissions summed)"
            );
        }
        if covered_col.is_some() {
            info!("WA covered emissions present, used as allocation weights");
        }
        Ok((rows, covered))
    }
}

fn sum_present(a: Option<f64>, b: Option<f64>) -> Option<f64> {
    match (a, b) {
        (Some(a), Some(b)) => Some(a + b),
        (a, b) => a.or(b),
    }
}

fn cohort(year: i32, subsector: &str) -> String {
    format!("{}|{}", year, subsector.trim())
}

impl Harmonizer for WashingtonHarmonizer {
    fn system(&self) -> SystemId {
        SystemId::Washington
    }

    fn harmonize(&self) -> Result<Harmonized> {
        let (mut rows, covered) = self.facility_rows()?;
        let totals = self.totals()?;
        let published_years: BTreeSet<i32> = totals
            .keys()
            .filter_map(|k| k.split('|').next()?.parse().ok())
            .collect();

        let subsectors = self
            .subsectors
            .map(rows.iter().map(|f| f.native_code.as_deref()), NAICS);

        let mut unpublished = BTreeSet::new();
        let entities: Vec<Option<WeightSignal>> = rows
            .iter()
            .zip(&subsectors)
            .zip(&covered)
            .map(|((f, m), covered)| {
                let subsector = m.target_code.as_deref()?;
                if !published_years.contains(&f.year) {
                    unpublished.insert(f.year);
                    return None;
                }
                let weight = covered.or(f.emissions_verified);
                Some(WeightSignal::new(cohort(f.year, subsector), weight))
            })
            .collect();

        for year in &unpublished {
            warn!(year, "no WA subsector totals for this year, allocations left empty");
        }

        let reconstructed = allocate_cohorts(
            &entities,
            &totals,
            &BTreeMap::new(),
            self.settings.hybrid_alpha,
            MissingTotals::Fail,
        )?;
        let counterfactual = allocate_cohorts(
            &entities,
            &totals,
            &BTreeMap::new(),
            self.settings.counterfactual_alpha,
            MissingTotals::Fail,
        )?;

        let nace = self
            .concordance
            .map(rows.iter().map(|f| f.native_code.as_deref()), NAICS);

        let reconstructed_source = option3_source(self.settings.hybrid_alpha, TOTALS_BASIS);
        let counterfactual_source = option3_source(self.settings.counterfactual_alpha, TOTALS_BASIS);

        for (((f, m), rec), cf) in rows
            .iter_mut()
            .zip(nace)
            .zip(reconstructed.values)
            .zip(counterfactual.values)
        {
            f.nace_code = m.target_code;
            f.nace_description = m.target_description;
            f.isic4_code = m.secondary_code;
            f.allocation_reconstructed_free = rec;
            f.allocation_counterfactual_free = cf;
            f.allocation_reconstructed_source = rec.map(|_| reconstructed_source.clone());
            f.allocation_counterfactual_source = cf.map(|_| counterfactual_source.clone());
        }

        let mut conservation = ConservationReport::default();
        conservation.merge(reconstructed.report);
        conservation.merge(counterfactual.report);

        info!(rows = rows.len(), "🌲 Washington facility-years harmonized");
        Ok(Harmonized {
            system: SystemId::Washington,
            rows,
            conservation,
        })
    }
}

// ============================================================================
// TESTS
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::HarmonizeError;

    const EMISSIONS: &str = "\
Reporter,Year,Sector,Subsector,Primary NAICS Code,City,County,Jurisdiction,Reported Emissions (MTCO2e),CCA Status
Acme Refining,2023,Industrial,Refinery,324110,Anacortes,Skagit,Anacortes,1000,Covered Entity
Acme Refining,2023,Industrial,Refinery,324110,Anacortes,Skagit,Anacortes,500,Covered Entity
Cement Co,2023,Industrial,Cement,327310,Seattle,King,Seattle,300,Covered Entity
Gas Utility,2023,Utility,Natural gas,221210,Spokane,Spokane,Spokane,9000,Covered Entity
Small Farm,2023,Agriculture,Dairy,112120,Lynden,Whatcom,Lynden,20,Not Covered
Acme Refining,2022,Industrial,Refinery,324110,Anacortes,Skagit,Anacortes,1100,Covered Entity
";

    const TOTALS: &str = "\
allocation_year,subsector,total_allowances
2023,Petroleum Refining and Chemical Manufacturing,1200
2023,\"Pulp, Paper and Cement Manufacturing\",250
";

    fn harmonizer(emissions: &str, options: WashingtonOptions) -> WashingtonHarmonizer {
        WashingtonHarmonizer::new(
            RawTable::from_csv_str("wa_emissions.csv", emissions).unwrap(),
            RawTable::from_csv_str("wa_totals.csv", TOTALS).unwrap(),
            Concordance::wa_subsectors_default().unwrap(),
            Concordance::naics_default().unwrap(),
            options,
            AllocationSettings::default(),
        )
    }

    #[test]
    fn test_facility_id_is_stable_hash() {
        assert_eq!(
            facility_id("Acme Refining", Some("Anacortes"), Some("Anacortes")),
            "wa_ba92e34f9ce0"
        );
        assert_eq!(
            facility_id("  CEMENT CO ", Some("Seattle"), Some("seattle")),
            "wa_01e8221f9179"
        );
    }

    #[test]
    fn test_covered_filter_and_merge() {
        let out = harmonizer(EMISSIONS, WashingtonOptions::default()).harmonize().unwrap();

        // Small Farm excluded, the two 2023 Acme rows merged
        assert_eq!(out.rows.len(), 4);
        let acme = &out.rows[0];
        assert_eq!(acme.facility_id, "wa_ba92e34f9ce0");
        assert_eq!(acme.emissions_verified, Some(1500.0));
        assert_eq!(acme.country_id.as_deref(), Some("US-WA"));
        assert_eq!(acme.facility_name.as_deref(), Some("Acme Refining"));
        assert_eq!(acme.nace_code.as_deref(), Some("19.2"));

        let all = harmonizer(EMISSIONS, WashingtonOptions { keep_only_covered: false })
            .harmonize()
            .unwrap();
        assert_eq!(all.rows.len(), 5);
        println!("✅ WA covered entities filtered and merged");
    }

    #[test]
    fn test_subsector_allocation() {
        let out = harmonizer(EMISSIONS, WashingtonOptions::default()).harmonize().unwrap();
        let rows = &out.rows;

        // Sole member of each published cohort receives its total
        assert_eq!(rows[0].allocation_reconstructed_free, Some(1200.0));
        assert_eq!(rows[0].allocation_counterfactual_free, Some(1200.0));
        assert_eq!(rows[1].allocation_reconstructed_free, Some(250.0));
        // Gas utility is not EITE
        assert_eq!(rows[2].allocation_reconstructed_free, None);
        // 2022 has no published totals
        assert_eq!(rows[3].year, 2022);
        assert_eq!(rows[3].allocation_reconstructed_free, None);
        assert_eq!(
            rows[0].allocation_counterfactual_source.as_deref(),
            Some("Option3(alpha=0) on Ecology EITE subsector totals")
        );
        assert!(out.conservation.is_conserved());
    }

    #[test]
    fn test_missing_subsector_total_is_fatal() {
        let totals = "allocation_year,subsector,total_allowances\n2023,Petroleum Refining and Chemical Manufacturing,1200\n";
        let h = WashingtonHarmonizer::new(
            RawTable::from_csv_str("wa_emissions.csv", EMISSIONS).unwrap(),
            RawTable::from_csv_str("wa_totals.csv", totals).unwrap(),
            Concordance::wa_subsectors_default().unwrap(),
            Concordance::naics_default().unwrap(),
            WashingtonOptions::default(),
            AllocationSettings::default(),
        );
        let err = h.harmonize().unwrap_err();
        assert!(matches!(
            err.downcast_ref::<HarmonizeError>(),
            Some(HarmonizeError::MissingCohortTotals { .. })
        ));
    }

    #[test]
    fn test_covered_emissions_weight_allocation() {
        let with_covered = "\
Reporter,Year,Primary NAICS Code,City,Jurisdiction,Reported Emissions (MTCO2e),Covered Emissions (MT CO2e)
Refinery A,2023,324110,Anacortes,Anacortes,1000,900
Refinery B,2023,324110,Ferndale,Ferndale,1000,300
";
        let out = harmonizer(with_covered, WashingtonOptions::default()).harmonize().unwrap();
        let cf: Vec<f64> = out
            .rows
            .iter()
            .map(|f| f.allocation_counterfactual_free.unwrap())
            .collect();
        assert!((cf[0] - 900.0).abs() < 1e-6);
        assert!((cf[1] - 300.0).abs() < 1e-6);
        // Verified stays the reported figure
        assert_eq!(out.rows[0].emissions_verified, Some(1000.0));

        let without_covered = "\
Reporter,Year,Primary NAICS Code,City,Jurisdiction,Reported Emissions (MTCO2e)
Refinery A,2023,324110,Anacortes,Anacortes,1000
Refinery B,2023,324110,Ferndale,Ferndale,1000
";
        let out = harmonizer(without_covered, WashingtonOptions::default()).harmonize().unwrap();
        for f in &out.rows {
            assert!((f.allocation_counterfactual_free.unwrap() - 600.0).abs() < 1e-6);
        }
        println!("✅ WA covered emissions weight the subsector split when present");
    }

    #[test]
    fn test_covered_emissions_summed_on_merge() {
        let data = "\
Reporter,Year,Primary NAICS Code,City,Jurisdiction,Reported Emissions (MTCO2e),Covered Emissions (MTCO2e)
Refinery A,2023,324110,Anacortes,Anacortes,1000,400
Refinery A,2023,324110,Anacortes,Anacortes,500,500
Refinery B,2023,324110,Ferndale,Ferndale,1000,300
";
        let out = harmonizer(data, WashingtonOptions::default()).harmonize().unwrap();
        assert_eq!(out.rows.len(), 2);
        assert_eq!(out.rows[0].emissions_verified, Some(1500.0));
        let a = out.rows[0].allocation_counterfactual_free.unwrap();
        assert!((a - 900.0).abs() < 1e-6);
    }

    #[test]
    fn test_descriptive_columns_are_optional() {
        let data = "\
Reporter,Year,Primary NAICS Code,City,Jurisdiction,Reported Emissions (MTCO2e)
Cement Co,2023,327310,Seattle,Seattle,300
";
        let out = harmonizer(data, WashingtonOptions::default()).harmonize().unwrap();
        assert_eq!(out.rows.len(), 1);
        assert_eq!(out.rows[0].allocation_reconstructed_free, Some(250.0));
        println!("✅ WA export without Sector, Subsector or County harmonizes");
    }

    #[test]
    fn test_sources_only_on_allocated_rows() {
        let out = harmonizer(EMISSIONS, WashingtonOptions::default()).harmonize().unwrap();
        let gas = &out.rows[2];
        assert_eq!(gas.allocation_reconstructed_free, None);
        assert_eq!(gas.allocation_reconstructed_source, None);
        assert_eq!(gas.allocation_counterfactual_source, None);
        assert!(out.rows[0].allocation_reconstructed_source.is_some());
        println!("✅ WA rows without an estimate carry no provenance");
    }

    #[test]
    fn test_required_columns() {
        let err = harmonizer("Reporter,Year\nA,2023\n", WashingtonOptions::default())
            .harmonize()
            .unwrap_err();
        let msg = err.to_string();
        assert!(msg.contains("Primary NAICS Code"));
        assert!(msg.contains("Reported Emissions (MTCO2e)"));
    }
}
