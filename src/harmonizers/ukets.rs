// 🇬🇧 UK ETS Harmonizer - allocation table + compliance report
//
// GOV.UK publishes installation allocations per permit and year; the
// registry compliance report carries emissions and surrenders. Both arrive
// here already in long form (one row per permit and year). Neither reliably
// carries NACE codes, so an optional permit -> NACE crosswalk fills them.

use super::{cohort_key, counterfactual_from_observed, AllocationSettings, Harmonized, Harmonizer};
use crate::error::HarmonizeError;
use crate::parser::RawTable;
use crate::schema::{FacilityYear, SystemId};
use anyhow::Result;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::path::Path;
use tracing::{info, warn};

pub const OBSERVED_SOURCE: &str = "GOV.UK allocation table";

// ============================================================================
// COLUMN NAMES
// ============================================================================

/// Source column names; every field can be overridden from the config file
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct UkEtsColumns {
    pub permit_id: String,
    pub year: String,
    pub allocation_total: String,
    pub installation_id: String,
    pub installation_name: String,
    pub operator_name: String,
    pub recorded_emissions: String,
    pub allowances_surrendered: String,
    pub nace_code: String,
    pub nace_description: String,
    pub isic4_code: String,
}

impl Default for UkEtsColumns {
    fn default() -> Self {
        UkEtsColumns {
            permit_id: "permit_id".to_string(),
            year: "year".to_string(),
            allocation_total: "allocation_total".to_string(),
            installation_id: "installation_id".to_string(),
            installation_name: "installation_name".to_string(),
            operator_name: "operator_name".to_string(),
            recorded_emissions: "recorded_emissions".to_string(),
            allowances_surrendered: "allowances_surrendered".to_string(),
            nace_code: "nace_code".to_string(),
            nace_description: "nace_description".to_string(),
            isic4_code: "isic4_code".to_string(),
        }
    }
}

impl UkEtsColumns {
    /// Rename one source column by its field name ("permit_id", "year", ...)
    pub fn set(&mut self, field: &str, name: &str) -> Result<(), HarmonizeError> {
        let slot = match field.trim() {
            "permit_id" => &mut self.permit_id,
            "year" => &mut self.year,
            "allocation_total" => &mut self.allocation_total,
            "installation_id" => &mut self.installation_id,
            "installation_name" => &mut self.installation_name,
            "operator_name" => &mut self.operator_name,
            "recorded_emissions" => &mut self.recorded_emissions,
            "allowances_surrendered" => &mut self.allowances_surrendered,
            "nace_code" => &mut self.nace_code,
            "nace_description" => &mut self.nace_description,
            "isic4_code" => &mut self.isic4_code,
            other => {
                return Err(HarmonizeError::InvalidConfig(format!(
                    "unknown UK ETS column field '{}'",
                    other
                )))
            }
        };
        *slot = name.trim().to_string();
        Ok(())
    }
}

fn permit(table: &RawTable, row: usize, col: Option<usize>) -> Option<String> {
    table.get(row, col).map(|p| p.trim().to_string())
}

// ============================================================================
// HARMONIZER
// ============================================================================

pub struct UkEtsHarmonizer {
    allocation: RawTable,
    compliance: RawTable,
    crosswalk: Option<RawTable>,
    columns: UkEtsColumns,
    settings: AllocationSettings,
}

impl UkEtsHarmonizer {
    pub fn new(
        allocation: RawTable,
        compliance: RawTable,
        crosswalk: Option<RawTable>,
        columns: UkEtsColumns,
        settings: AllocationSettings,
    ) -> Self {
        UkEtsHarmonizer {
            allocation,
            compliance,
            crosswalk,
            columns,
            settings,
        }
    }

    pub fn from_paths(
        allocation: &Path,
        compliance: &Path,
        crosswalk: Option<&Path>,
        columns: UkEtsColumns,
        settings: AllocationSettings,
    ) -> Result<Self> {
        let crosswalk = crosswalk.map(RawTable::from_csv_path).transpose()?;
        Ok(Self::new(
            RawTable::from_csv_path(allocation)?,
            RawTable::from_csv_path(compliance)?,
            crosswalk,
            columns,
            settings,
        ))
    }

    /// (permit, year) -> first compliance row
    fn compliance_index(&self) -> Result<HashMap<(String, i32), usize>> {
        let c = &self.columns;
        let table = &self.compliance;
        let cols = table.require(&[c.permit_id.as_str(), c.year.as_str(), c.recorded_emissions.as_str()])?;
        let (permit_col, year_col) = (Some(cols[0]), Some(cols[1]));

        let mut index = HashMap::new();
        let mut duplicates = Vec::new();
        for row in 0..table.len() {
            let (Some(p), Some(year)) = (permit(table, row, permit_col), table.year(row, year_col)) else {
                continue;
            };
            let key = (p, year);
            if index.contains_key(&key) {
                duplicates.push(key);
            } else {
                index.insert(key, row);
            }
        }

        if let Some((p, year)) = duplicates.first() {
            warn!(
                duplicates = duplicates.len(),
                example = %format!("{} {}", p, year),
                "UK compliance report repeats permit/year keys, keeping the first row"
            );
        }
        Ok(index)
    }

    /// permit -> first crosswalk row
    fn crosswalk_index(&self) -> Result<HashMap<String, usize>> {
        let Some(table) = &self.crosswalk else {
            return Ok(HashMap::new());
        };
        let c = &self.columns;
        let cols = table.require(&[c.permit_id.as_str(), c.nace_code.as_str()])?;
        let permit_col = Some(cols[0]);

        let mut index = HashMap::new();
        for row in 0..table.len() {
            if let Some(p) = permit(table, row, permit_col) {
                index.entry(p).or_insert(row);
            }
        }
        Ok(index)
    }
}

impl Harmonizer for UkEtsHarmonizer {
    fn system(&self) -> SystemId {
        SystemId::UkEts
    }

    fn harmonize(&self) -> Result<Harmonized> {
        let c = &self.columns;
        let alloc = &self.allocation;
        let cols = alloc.require(&[c.permit_id.as_str(), c.year.as_str(), c.allocation_total.as_str()])?;
        let (permit_col, year_col, total_col) = (Some(cols[0]), Some(cols[1]), Some(cols[2]));
        let a_installation = alloc.column(&c.installation_id);
        let a_name = alloc.column(&c.installation_name);
        let a_operator = alloc.column(&c.operator_name);

        let comp = &self.compliance;
        let comp_index = self.compliance_index()?;
        let k_emissions = comp.column(&c.recorded_emissions);
        let k_surrendered = comp.column(&c.allowances_surrendered);
        let k_name = comp.column(&c.installation_name);
        let k_operator = comp.column(&c.operator_name);
        let k_nace = comp.column(&c.nace_code);
        let k_nace_desc = comp.column(&c.nace_description);
        let k_isic = comp.column(&c.isic4_code);

        let crosswalk_index = self.crosswalk_index()?;
        let (x_nace, x_desc, x_isic) = match &self.crosswalk {
            Some(x) => (
                x.column(&c.nace_code),
                x.column(&c.nace_description),
                x.column(&c.isic4_code),
            ),
            None => (None, None, None),
        };

        let mut rows = Vec::new();
        let mut dropped = 0usize;
        for row in 0..alloc.len() {
            let (Some(p), Some(year), Some(total)) = (
                permit(alloc, row, permit_col),
                alloc.year(row, year_col),
                alloc.number(row, total_col),
            ) else {
                dropped += 1;
                continue;
            };

            let mut f = FacilityYear::new(SystemId::UkEts, year, p.clone());
            f.installation_id = alloc.text(row, a_installation);
            f.facility_name = alloc.text(row, a_name);
            f.operator_name = alloc.text(row, a_operator);
            f.allocation_observed_free = Some(total);
            f.allocation_observed_source = Some(OBSERVED_SOURCE.to_string());

            if let Some(&k) = comp_index.get(&(p.clone(), year)) {
                f.emissions_verified = comp.number(k, k_emissions);
                f.allowances_surrendered = comp.number(k, k_surrendered);
                if f.facility_name.is_none() {
                    f.facility_name = comp.text(k, k_name);
                }
                if f.operator_name.is_none() {
                    f.operator_name = comp.text(k, k_operator);
                }
                f.native_code = comp.text(k, k_nace);
                f.nace_code = f.native_code.clone();
                f.nace_description = comp.text(k, k_nace_desc);
                f.isic4_code = comp.text(k, k_isic);
            }

            if let (Some(x), Some(&r)) = (&self.crosswalk, crosswalk_index.get(&p)) {
                if let Some(code) = x.text(r, x_nace) {
                    f.nace_code = Some(code);
                }
                if let Some(desc) = x.text(r, x_desc) {
                    f.nace_description = Some(desc);
                }
                if let Some(isic) = x.text(r, x_isic) {
                    f.isic4_code = Some(isic);
                }
            }

            rows.push(f);
        }

        if dropped > 0 {
            warn!(rows = dropped, "UK allocation rows without permit, year or allocation dropped");
        }

        let cohorts: Vec<String> = rows
            .iter()
            .map(|f| cohort_key(&[Some(f.year.to_string().as_str()), f.nace_code.as_deref()]))
            .collect();
        let conservation = counterfactual_from_observed(
            &mut rows,
            &cohorts,
            self.settings.counterfactual_alpha,
            "NACE totals",
        )?;

        info!(rows = rows.len(), "🇬🇧 UK ETS facility-years harmonized");
        Ok(Harmonized {
            system: SystemId::UkEts,
            rows,
            conservation,
        })
    }
}

// ============================================================================
// TESTS
// ============================================================================
