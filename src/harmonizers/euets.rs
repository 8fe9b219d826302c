// 🇪🇺 EU ETS Harmonizer - EUTL compliance + installation tables
//
// The EUTL publishes installation-level free allocation, so the observed
// metric comes straight from `allocatedFree`. The counterfactual metric
// re-spreads each (year, country, NACE) cohort's observed total with the
// Option 3 weights. There is no reconstructed metric for the EU.

use super::{cohort_key, counterfactual_from_observed, AllocationSettings, Harmonized, Harmonizer};
use crate::aggregate::accumulate;
use crate::error::HarmonizeError;
use crate::parser::{parse_number, RawTable};
use crate::schema::{free_share, AllocationMetric, FacilityYear, SectorYear, SystemId};
use anyhow::Result;
use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::path::Path;
use tracing::{info, warn};

pub const OBSERVED_SOURCE: &str = "EUTL compliance.csv:allocatedFree";

/// Quantity columns summed into the native sector table, in schema order
const QUANTITY_COLUMNS: [&str; 8] = [
    "allocatedFree",
    "allocatedNewEntrance",
    "allocatedTotal",
    "allocated10c",
    "verified",
    "surrendered",
    "balance",
    "penalty",
];

/// EUTL `nace_id` values to NACE Rev.2 codes ("6.2" -> "06.2", "51.0" -> "51")
pub fn format_nace_rev2(raw: &str) -> Option<String> {
    let s = raw.trim();
    if s.is_empty() {
        return None;
    }

    let s = match s.parse::<f64>() {
        Ok(f) if f.is_finite() => {
            let fixed = format!("{:.3}", f);
            fixed.trim_end_matches('0').trim_end_matches('.').to_string()
        }
        _ => s.to_string(),
    };

    let mut parts: Vec<String> = s.split('.').map(|p| p.to_string()).collect();
    if parts[0].len() == 1 && parts[0].chars().all(|c| c.is_ascii_digit()) {
        parts[0] = format!("0{}", parts[0]);
    }
    Some(parts.join("."))
}

// ============================================================================
// OPTIONS
// ============================================================================

#[derive(Debug, Clone)]
pub struct EuEtsOptions {
    /// Keep only rows whose `reportedInSystem_id` equals this; None keeps all.
    ///
    /// Only the native sector table carries other systems. Facility rows are
    /// always `euets`, so rows reported in another system never reach them.
    pub system_filter: Option<String>,
}

impl Default for EuEtsOptions {
    fn default() -> Self {
        EuEtsOptions {
            system_filter: Some("euets".to_string()),
        }
    }
}

// ============================================================================
// LOOKUP TABLES
// ============================================================================

#[derive(Debug, Clone, Default)]
struct InstallationInfo {
    country_id: Option<String>,
    nace_code: Option<String>,
}

#[derive(Debug, Clone, Default)]
struct NaceInfo {
    level: Option<u8>,
    description: Option<String>,
    isic4_code: Option<String>,
}

/// installation id -> country/NACE; repeated ids make the join ambiguous
fn installation_index(table: &RawTable) -> Result<HashMap<String, InstallationInfo>> {
    let cols = table.require(&["id", "country_id", "nace_id"])?;
    let (id_col, country_col, nace_col) = (Some(cols[0]), Some(cols[1]), Some(cols[2]));

    let mut index = HashMap::new();
    let mut duplicates = BTreeSet::new();
    for row in 0..table.len() {
        let Some(id) = table.text(row, id_col) else { continue };
        let info = InstallationInfo {
            country_id: table.text(row, country_col),
            nace_code: table.get(row, nace_col).and_then(format_nace_rev2),
        };
        if index.insert(id.clone(), info).is_some() {
            duplicates.insert(id);
        }
    }

    if !duplicates.is_empty() {
        return Err(HarmonizeError::DuplicateKey {
            table: table.name.clone(),
            keys: duplicates.into_iter().collect(),
        }
        .into());
    }
    Ok(index)
}

fn nace_index(table: &RawTable) -> Result<HashMap<String, NaceInfo>> {
    let cols = table.require(&["id"])?;
    let id_col = Some(cols[0]);
    let level_col = table.column("level");
    let desc_col = table.column("description");
    let isic_col = table.column("isic4_id");

    let mut index = HashMap::new();
    for row in 0..table.len() {
        let Some(code) = table.get(row, id_col).and_then(format_nace_rev2) else { continue };
        index.entry(code).or_insert_with(|| NaceInfo {
            level: table
                .number(row, level_col)
                .filter(|l| l.fract() == 0.0 && (0.0..=u8::MAX as f64).contains(l))
                .map(|l| l as u8),
            description: table.text(row, desc_col),
            isic4_code: table.text(row, isic_col),
        });
    }
    Ok(index)
}

// ============================================================================
// HARMONIZER
// ============================================================================

pub struct EuEtsHarmonizer {
    compliance: RawTable,
    installations: RawTable,
    nace_codes: Option<RawTable>,
    options: EuEtsOptions,
    settings: AllocationSettings,
}

impl EuEtsHarmonizer {
    pub fn new(
        compliance: RawTable,
        installations: RawTable,
        nace_codes: Option<RawTable>,
        options: EuEtsOptions,
        settings: AllocationSettings,
    ) -> Self {
        EuEtsHarmonizer {
            compliance,
            installations,
            nace_codes,
            options,
            settings,
        }
    }

    /// Load `compliance.csv`, `installation.csv` and (if present) `nace_code.csv`
    /// from an extracted EUTL directory.
    pub fn from_dir(dir: &Path, options: EuEtsOptions, settings: AllocationSettings) -> Result<Self> {
        let compliance = RawTable::from_csv_path(&dir.join("compliance.csv"))?;
        let installations = RawTable::from_csv_path(&dir.join("installation.csv"))?;
        let nace_path = dir.join("nace_code.csv");
        let nace_codes = if nace_path.exists() {
            Some(RawTable::from_csv_path(&nace_path)?)
        } else {
            None
        };
        Ok(Self::new(compliance, installations, nace_codes, options, settings))
    }

    fn nace_lookup(&self) -> Result<HashMap<String, NaceInfo>> {
        match &self.nace_codes {
            Some(table) => nace_index(table),
            None => Ok(HashMap::new()),
        }
    }

    /// Compliance row indices that pass the system filter
    fn selected_rows(&self) -> Vec<usize> {
        let system_col = self.compliance.column("reportedInSystem_id");
        (0..self.compliance.len())
            .filter(|&row| match (&self.options.system_filter, system_col) {
                (Some(wanted), Some(_)) => self.compliance.get(row, system_col) == Some(wanted.as_str()),
                _ => true,
            })
            .collect()
    }
}

impl Harmonizer for EuEtsHarmonizer {
    fn system(&self) -> SystemId {
        SystemId::EuEts
    }

    fn harmonize(&self) -> Result<Harmonized> {
        let table = &self.compliance;
        let cols = table.require(&["installation_id", "year", "verified", "allocatedFree"])?;
        let (id_col, year_col, verified_col, free_col) =
            (Some(cols[0]), Some(cols[1]), Some(cols[2]), Some(cols[3]));
        let surrendered_col = table.column("surrendered");
        let system_col = table.column("reportedInSystem_id");
        let name_col = table.column("installation_name");
        let operator_col = table.column("operator_name");

        let installations = installation_index(&self.installations)?;
        let nace = self.nace_lookup()?;

        let mut rows = Vec::new();
        let mut unmatched = 0usize;
        let mut skipped = 0usize;
        let mut foreign = 0usize;
        for row in self.selected_rows() {
            if table.get(row, system_col).is_some_and(|s| s != SystemId::EuEts.code()) {
                foreign += 1;
                continue;
            }
            let (Some(id), Some(year)) = (table.text(row, id_col), table.year(row, year_col)) else {
                skipped += 1;
                continue;
            };

            let info = match installations.get(&id) {
                Some(info) => info.clone(),
                None => {
                    unmatched += 1;
                    InstallationInfo::default()
                }
            };

            let mut f = FacilityYear::new(SystemId::EuEts, year, id.clone());
            f.installation_id = Some(id);
            f.country_id = info.country_id;
            f.facility_name = table.text(row, name_col);
            f.operator_name = table.text(row, operator_col);
            if let Some(meta) = info.nace_code.as_ref().and_then(|c| nace.get(c)) {
                f.nace_description = meta.description.clone();
                f.isic4_code = meta.isic4_code.clone();
            }
            f.native_code = info.nace_code.clone();
            f.nace_code = info.nace_code;
            f.emissions_verified = table.number(row, verified_col);
            f.allowances_surrendered = table.number(row, surrendered_col);
            f.allocation_observed_free = table.number(row, free_col);
            f.allocation_observed_source = f.allocation_observed_free.map(|_| OBSERVED_SOURCE.to_string());
            rows.push(f);
        }

        if foreign > 0 {
            warn!(
                rows = foreign,
                "compliance rows reported in other systems left out of EU ETS facility-years"
            );
        }
        if skipped > 0 {
            warn!(rows = skipped, "EU ETS compliance rows without installation id or year skipped");
        }
        if unmatched > 0 {
            warn!(rows = unmatched, "EU ETS compliance rows reference unknown installations");
        }

        let cohorts: Vec<String> = rows
            .iter()
            .map(|f| {
                cohort_key(&[
                    Some(f.year.to_string().as_str()),
                    f.country_id.as_deref(),
                    f.nace_code.as_deref(),
                ])
            })
            .collect();
        let conservation = counterfactual_from_observed(
            &mut rows,
            &cohorts,
            self.settings.counterfactual_alpha,
            "NACE totals",
        )?;

        info!(rows = rows.len(), "🇪🇺 EU ETS facility-years harmonized");
        Ok(Harmonized {
            system: SystemId::EuEts,
            rows,
            conservation,
        })
    }

    /// EU sector table with all eight EUTL quantities summed per
    /// (system, year, country, NACE).
    fn native_sector(&self) -> Result<Option<Vec<SectorYear>>> {
        let table = &self.compliance;
        let cols = table.require(&["installation_id", "year"])?;
        let (id_col, year_col) = (Some(cols[0]), Some(cols[1]));
        let system_col = table.column("reportedInSystem_id");
        let quantity_cols: Vec<Option<usize>> =
            QUANTITY_COLUMNS.iter().map(|c| table.column(c)).collect();

        let installations = installation_index(&self.installations)?;
        let nace = self.nace_lookup()?;

        type Key = (String, i32, Option<String>, Option<String>);
        let mut groups: BTreeMap<Key, [Option<f64>; 8]> = BTreeMap::new();

        for row in self.selected_rows() {
            let Some(year) = table.year(row, year_col) else { continue };
            let info = table
                .get(row, id_col)
                .and_then(|id| installations.get(id))
                .cloned()
                .unwrap_or_default();
            let system = table
                .text(row, system_col)
                .unwrap_or_else(|| SystemId::EuEts.code().to_string());

            let sums = groups
                .entry((system, year, info.country_id, info.nace_code))
                .or_insert([None; 8]);
            for (sum, col) in sums.iter_mut().zip(&quantity_cols) {
                accumulate(sum, table.get(row, *col).and_then(parse_number));
            }
        }

        let sector = groups
            .into_iter()
            .map(|((system, year, country, nace_code), q)| {
                let meta = nace_code.as_ref().and_then(|c| nace.get(c));
                let mut s = SectorYear::new(system, year, country, nace_code, AllocationMetric::Observed);
                s.allocated_free = q[0];
                s.allocated_new_entrance = q[1];
                s.allocated_total = q[2];
                s.allocated_10c = q[3];
                s.verified = q[4];
                s.surrendered = q[5];
                s.balance = q[6];
                s.penalty = q[7];
                s.free_share = free_share(q[0], q[4]);
                if let Some(meta) = meta {
                    s.nace_level = meta.level.or(s.nace_level);
                    s.nace_description = meta.description.clone();
                    s.isic4_code = meta.isic4_code.clone();
                }
                s
            })
            .collect::<Vec<_>>();

        info!(rows = sector.len(), "🇪🇺 EU ETS native sector table built");
        Ok(Some(sector))
    }
}

// ============================================================================
// TESTS
// ============================================================================
