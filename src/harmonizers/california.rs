// 🌴 California Harmonizer - CARB MRR emissions + sector allocation totals
//
// CARB does not publish facility-level free allocation. It publishes MRR
// emissions per ARB ID and allocation totals per allocation sector and
// vintage. Both estimated metrics spread those sector totals over the
// facilities of each (year, sector) cohort; there is no observed metric.

use super::{allocate_cohorts, option3_source, AllocationSettings, Harmonized, Harmonizer, MissingTotals};
use crate::allocation::WeightSignal;
use crate::concordance::{Concordance, NAICS};
use crate::parser::{read_batch, RawTable};
use crate::reconciliation::ConservationReport;
use crate::rules::SectorRuleSet;
use crate::schema::{FacilityYear, SystemId};
use anyhow::Result;
use regex::Regex;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::path::Path;
use std::sync::OnceLock;
use tracing::{debug, info, warn};

pub const TOTALS_BASIS: &str = "CARB sector totals";

// ============================================================================
// COLUMNS & OPTIONS
// ============================================================================

/// MRR column names. Each field is tried first, then the label CARB uses in
/// its published spreadsheets.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct CaliforniaColumns {
    pub arb_id: String,
    pub report_year: String,
    pub facility_name: String,
    pub industry_sector: String,
    pub naics: String,
    pub total_covered_emissions: String,
    pub emitter_covered_emissions: String,
    pub fuel_supplier_covered_emissions: String,
    pub electricity_importer_covered_emissions: String,
}

impl Default for CaliforniaColumns {
    fn default() -> Self {
        CaliforniaColumns {
            arb_id: "arb_id".to_string(),
            report_year: "report_year".to_string(),
            facility_name: "facility_name".to_string(),
            industry_sector: "industry_sector".to_string(),
            naics: "naics".to_string(),
            total_covered_emissions: "total_covered_emissions".to_string(),
            emitter_covered_emissions: "emitter_covered_emissions".to_string(),
            fuel_supplier_covered_emissions: "fuel_supplier_covered_emissions".to_string(),
            electricity_importer_covered_emissions: "electricity_importer_covered_emissions".to_string(),
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct CaliforniaOptions {
    pub columns: CaliforniaColumns,
    /// One row per reporting obligation instead of one per ARB ID
    pub obligation_fanout: bool,
    /// Optional observed-intensity column in the MRR table
    pub intensity_column: Option<String>,
}

/// Resolved column positions for one MRR table
struct MrrColumns {
    arb_id: Option<usize>,
    year: Option<usize>,
    name: Option<usize>,
    sector: Option<usize>,
    naics: Option<usize>,
    total: Option<usize>,
    emitter: Option<usize>,
    fuel_supplier: Option<usize>,
    electricity_importer: Option<usize>,
    intensity: Option<usize>,
}

impl MrrColumns {
    fn resolve(table: &RawTable, options: &CaliforniaOptions) -> Result<Self> {
        let c = &options.columns;
        let arb_id = table.column_any(&[c.arb_id.as_str(), "ARB ID"]);
        if arb_id.is_none() {
            return Err(crate::error::HarmonizeError::missing_columns(table.name.clone(), &[c.arb_id.as_str()]).into());
        }
        Ok(MrrColumns {
            arb_id,
            year: table.column_any(&[c.report_year.as_str(), "Report Year", "Year"]),
            name: table.column_any(&[c.facility_name.as_str(), "Facility Name"]),
            sector: table.column_any(&[c.industry_sector.as_str(), "Industry Sector"]),
            naics: table.column_any(&[
                c.naics.as_str(),
                "North American Industry Classification System (NAICS) Code and Description",
                "NAICS",
            ]),
            total: table.column_any(&[c.total_covered_emissions.as_str(), "Total Covered Emissions"]),
            emitter: table.column_any(&[c.emitter_covered_emissions.as_str(), "Emitter Covered Emissions"]),
            fuel_supplier: table.column_any(&[
                c.fuel_supplier_covered_emissions.as_str(),
                "Fuel Supplier Covered Emissions",
            ]),
            electricity_importer: table.column_any(&[
                c.electricity_importer_covered_emissions.as_str(),
                "Electricity Importer Covered Emissions",
            ]),
            intensity: options.intensity_column.as_deref().and_then(|n| table.column(n)),
        })
    }
}

/// 4-digit year embedded in a file name ("2023-ghg-emissions.csv" -> 2023)
pub fn year_from_file_name(path: &Path) -> Option<i32> {
    static YEAR: OnceLock<Regex> = OnceLock::new();
    let re = YEAR.get_or_init(|| Regex::new(r"(19\d{2}|20\d{2})").unwrap());
    let stem = path.file_stem()?.to_str()?;
    re.find(stem)?.as_str().parse().ok()
}

/// ARB IDs are integers; spreadsheets often export them as "101.0"
fn arb_id(raw: &str) -> Option<String> {
    let value = crate::parser::parse_number(raw)?;
    if value.fract() != 0.0 {
        return None;
    }
    Some(format!("{}", value as i64))
}

// ============================================================================
// MRR RECORDS
// ============================================================================

/// One MRR row with the fields the harmonizer uses
#[derive(Debug, Clone)]
struct MrrRecord {
    arb_id: String,
    year: i32,
    facility_name: Option<String>,
    industry_sector: Option<String>,
    naics: Option<String>,
    total: Option<f64>,
    emitter: Option<f64>,
    fuel_supplier: Option<f64>,
    electricity_importer: Option<f64>,
    intensity: Option<f64>,
}

/// An MRR table and the year its file name implies
#[derive(Debug, Clone)]
pub struct MrrTable {
    pub table: RawTable,
    pub file_year: Option<i32>,
}

// ============================================================================
// HARMONIZER
// ============================================================================

pub struct CaliforniaHarmonizer {
    mrr: Vec<MrrTable>,
    sector_totals: RawTable,
    benchmarks: Option<RawTable>,
    assistance_factors: Option<RawTable>,
    rules: SectorRuleSet,
    concordance: Concordance,
    options: CaliforniaOptions,
    settings: AllocationSettings,
}

impl CaliforniaHarmonizer {
    pub fn new(
        mrr: Vec<MrrTable>,
        sector_totals: RawTable,
        rules: SectorRuleSet,
        concordance: Concordance,
        options: CaliforniaOptions,
        settings: AllocationSettings,
    ) -> Self {
        CaliforniaHarmonizer {
            mrr,
            sector_totals,
            benchmarks: None,
            assistance_factors: None,
            rules,
            concordance,
            options,
            settings,
        }
    }

    pub fn with_benchmarks(mut self, benchmarks: Option<RawTable>) -> Self {
        self.benchmarks = benchmarks;
        self
    }

    pub fn with_assistance_factors(mut self, factors: Option<RawTable>) -> Self {
        self.assistance_factors = factors;
        self
    }

    /// Load a single MRR table, or every `*.csv` in a directory
    pub fn load_mrr(path: &Path, options: &CaliforniaOptions) -> Result<Vec<MrrTable>> {
        if path.is_dir() {
            let parsed = read_batch(path, "csv", |file| {
                let table = RawTable::from_csv_path(file)?;
                MrrColumns::resolve(&table, options)?;
                Ok(table)
            })?;
            info!(files = parsed.len(), dir = %path.display(), "CARB MRR batch loaded");
            Ok(parsed
                .into_iter()
                .map(|(file, table)| MrrTable {
                    file_year: year_from_file_name(&file),
                    table,
                })
                .collect())
        } else {
            let table = RawTable::from_csv_path(path)?;
            MrrColumns::resolve(&table, options)?;
            Ok(vec![MrrTable {
                file_year: year_from_file_name(path),
                table,
            }])
        }
    }

    /// MRR records across every table. An (ARB ID, year) already read from
    /// an earlier file is skipped, so overlapping batch files count once.
    fn records(&self) -> Result<Vec<MrrRecord>> {
        let mut records = Vec::new();
        let mut no_year = 0usize;
        let mut first_table: HashMap<(String, i32), usize> = HashMap::new();
        let mut duplicates: Vec<(String, i32)> = Vec::new();
        for (table_index, mrr) in self.mrr.iter().enumerate() {
            let t = &mrr.table;
            let cols = MrrColumns::resolve(t, &self.options)?;
            for row in 0..t.len() {
                let Some(id) = t.get(row, cols.arb_id).and_then(arb_id) else { continue };
                let Some(year) = t.year(row, cols.year).or(mrr.file_year) else {
                    no_year += 1;
                    continue;
                };
                let seen_in = *first_table.entry((id.clone(), year)).or_insert(table_index);
                if seen_in != table_index {
                    duplicates.push((id, year));
                    continue;
                }
                records.push(MrrRecord {
                    arb_id: id,
                    year,
                    facility_name: t.text(row, cols.name),
                    industry_sector: t.text(row, cols.sector),
                    naics: t.text(row, cols.naics),
                    total: t.number(row, cols.total),
                    emitter: t.number(row, cols.emitter),
                    fuel_supplier: t.number(row, cols.fuel_supplier),
                    electricity_importer: t.number(row, cols.electricity_importer),
                    intensity: t.number(row, cols.intensity),
                });
            }
        }
        if no_year > 0 {
            warn!(rows = no_year, "CARB MRR rows without a report year dropped");
        }
        if let Some((id, year)) = duplicates.first() {
            warn!(
                duplicates = duplicates.len(),
                example = %format!("{} {}", id, year),
                "CARB MRR files repeat ARB ID/year keys, keeping the first file's rows"
            );
        }
        Ok(records)
    }

    /// "year|sector" -> allocated + true-up, summed over repeated rows
    fn totals(&self) -> Result<BTreeMap<String, f64>> {
        let t = &self.sector_totals;
        let cols = t.require(&["Sector", "Vintage", "Allocated Allowances", "True-Up Value"])?;
        let (sector_col, vintage_col, alloc_col, true_up_col) =
            (Some(cols[0]), Some(cols[1]), Some(cols[2]), Some(cols[3]));

        let mut totals = BTreeMap::new();
        for row in 0..t.len() {
            let (Some(sector), Some(year)) = (t.text(row, sector_col), t.year(row, vintage_col)) else {
                continue;
            };
            let total = t.number(row, alloc_col).unwrap_or(0.0) + t.number(row, true_up_col).unwrap_or(0.0);
            *totals.entry(cohort(year, &sector)).or_insert(0.0) += total;
        }
        Ok(totals)
    }

    /// Per-sector benchmark intensities, applied to every year's cohort
    fn benchmarks(&self, years: &BTreeSet<i32>) -> Result<BTreeMap<String, f64>> {
        let Some(t) = &self.benchmarks else {
            return Ok(BTreeMap::new());
        };
        let cols = t.require(&["sector", "benchmark_intensity"])?;
        let mut out = BTreeMap::new();
        for row in 0..t.len() {
            let (Some(sector), Some(value)) = (t.text(row, Some(cols[0])), t.number(row, Some(cols[1]))) else {
                continue;
            };
            for year in years {
                out.insert(cohort(*year, &sector), value);
            }
        }
        Ok(out)
    }

    fn assistance_factors(&self) -> Result<HashMap<String, f64>> {
        let Some(t) = &self.assistance_factors else {
            return Ok(HashMap::new());
        };
        let cols = t.require(&["year", "sector", "assistance_factor"])?;
        let mut out = HashMap::new();
        for row in 0..t.len() {
            if let (Some(year), Some(sector), Some(af)) = (
                t.year(row, Some(cols[0])),
                t.text(row, Some(cols[1])),
                t.number(row, Some(cols[2])),
            ) {
                out.insert(cohort(year, &sector), af);
            }
        }
        Ok(out)
    }

    /// Expand MRR records into facility rows (one per ARB ID, or one per obligation)
    fn facility_rows(&self, records: &[MrrRecord]) -> Vec<(FacilityYear, Option<f64>, String)> {
        let mut out = Vec::new();
        for r in records {
            let sector = self.rules.classify(r.industry_sector.as_deref());
            let base = {
                let mut f = FacilityYear::new(SystemId::California, r.year, r.arb_id.clone());
                f.installation_id = Some(r.arb_id.clone());
                f.facility_name = r.facility_name.clone();
                f.native_code = r.naics.clone();
                f
            };

            if self.options.obligation_fanout {
                let obligations = [
                    ("emitter", r.emitter),
                    ("fuel_supplier", r.fuel_supplier),
                    ("electricity_importer", r.electricity_importer),
                ];
                let mut any = false;
                for (name, value) in obligations {
                    let Some(value) = value else { continue };
                    any = true;
                    let mut f = base.clone();
                    f.installation_id = Some(format!("{}:{}", r.arb_id, name));
                    f.emissions_verified = Some(value);
                    out.push((f, r.intensity, sector.clone()));
                }
                if any {
                    continue;
                }
            }

            let mut f = base;
            f.emissions_verified = r.emitter.or(r.total);
            out.push((f, r.intensity, sector));
        }
        out
    }
}

fn cohort(year: i32, sector: &str) -> String {
    format!("{}|{}", year, sector.trim())
}

impl Harmonizer for CaliforniaHarmonizer {
    fn system(&self) -> SystemId {
        SystemId::California
    }

    fn harmonize(&self) -> Result<Harmonized> {
        let records = self.records()?;
        let totals = self.totals()?;
        let published_years: BTreeSet<i32> = totals
            .keys()
            .filter_map(|k| k.split('|').next()?.parse().ok())
            .collect();
        let benchmarks = self.benchmarks(&published_years)?;
        let factors = self.assistance_factors()?;

        let expanded = self.facility_rows(&records);

        let mut unpublished = BTreeSet::new();
        let entities: Vec<Option<WeightSignal>> = expanded
            .iter()
            .map(|(f, intensity, sector)| {
                if !published_years.contains(&f.year) {
                    unpublished.insert(f.year);
                    return None;
                }
                let key = cohort(f.year, sector);
                let af = factors.get(&key).copied();
                Some(
                    WeightSignal::new(key, f.emissions_verified)
                        .with_assistance_factor(af)
                        .with_intensity(*intensity),
                )
            })
            .collect();

        for year in &unpublished {
            warn!(year, "no CARB sector totals for this year, allocations left empty");
        }

        let reconstructed = allocate_cohorts(
            &entities,
            &totals,
            &benchmarks,
            self.settings.hybrid_alpha,
            MissingTotals::Fail,
        )?;
        let counterfactual = allocate_cohorts(
            &entities,
            &totals,
            &benchmarks,
            self.settings.counterfactual_alpha,
            MissingTotals::Fail,
        )?;

        let matches = self
            .concordance
            .map(expanded.iter().map(|(f, _, _)| f.native_code.as_deref()), NAICS);

        let reconstructed_source = option3_source(self.settings.hybrid_alpha, TOTALS_BASIS);
        let counterfactual_source = option3_source(self.settings.counterfactual_alpha, TOTALS_BASIS);

        let rows: Vec<FacilityYear> = expanded
            .into_iter()
            .zip(matches)
            .zip(reconstructed.values.into_iter().zip(counterfactual.values))
            .map(|(((mut f, _, _), m), (rec, cf))| {
                f.nace_code = m.target_code;
                f.nace_description = m.target_description;
                f.isic4_code = m.secondary_code;
                f.allocation_reconstructed_free = rec;
                f.allocation_counterfactual_free = cf;
                f.allocation_reconstructed_source = rec.map(|_| reconstructed_source.clone());
                f.allocation_counterfactual_source = cf.map(|_| counterfactual_source.clone());
                f
            })
            .collect();

        let mut conservation = ConservationReport::default();
        conservation.merge(reconstructed.report);
        conservation.merge(counterfactual.report);
        debug!("{}", conservation.summary());

        info!(rows = rows.len(), "🌴 California facility-years harmonized");
        Ok(Harmonized {
            system: SystemId::California,
            rows,
            conservation,
        })
    }
}

// ============================================================================
// TESTS
// ============================================================================
