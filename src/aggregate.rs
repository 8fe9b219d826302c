// 📊 Sector Aggregator - facility-years to sector-years
//
// Groups facility rows by (system, year, jurisdiction, NACE code) and sums
// their quantities. Sums follow "all missing stays missing": a group where
// nobody reported a value gets an empty cell, not a zero.

use crate::concordance::Concordance;
use crate::schema::{free_share, AllocationMetric, FacilityYear, SectorYear};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

/// Add `value` into `acc`; `acc` stays None until something non-missing arrives
pub fn accumulate(acc: &mut Option<f64>, value: Option<f64>) {
    if let Some(v) = value {
        *acc = Some(acc.unwrap_or(0.0) + v);
    }
}

fn first_present(slot: &mut Option<String>, value: &Option<String>) {
    if slot.is_none() {
        slot.clone_from(value);
    }
}

// ============================================================================
// FACILITY -> SECTOR
// ============================================================================

type SectorKey = (String, i32, Option<String>, Option<String>);

/// Sector-year rows for one allocation metric, in (system, year, country, NACE) order
pub fn aggregate(facility: &[FacilityYear], metric: AllocationMetric) -> Vec<SectorYear> {
    let mut groups: BTreeMap<SectorKey, SectorYear> = BTreeMap::new();

    for f in facility {
        let key = (
            f.system_id.code().to_string(),
            f.year,
            f.country_id.clone(),
            f.nace_code.clone(),
        );
        let entry = groups.entry(key).or_insert_with(|| {
            SectorYear::new(
                f.system_id.code(),
                f.year,
                f.country_id.clone(),
                f.nace_code.clone(),
                metric,
            )
        });

        accumulate(&mut entry.allocated_free, f.allocation(metric));
        accumulate(&mut entry.verified, f.emissions_verified);
        accumulate(&mut entry.surrendered, f.allowances_surrendered);
        first_present(&mut entry.nace_description, &f.nace_description);
        first_present(&mut entry.isic4_code, &f.isic4_code);
    }

    groups
        .into_values()
        .map(|mut s| {
            s.allocated_total = s.allocated_free;
            s.balance = match (s.allocated_total, s.surrendered) {
                (Some(total), Some(surrendered)) => Some(total - surrendered),
                _ => None,
            };
            s.free_share = free_share(s.allocated_free, s.verified);
            s
        })
        .collect()
}

// ============================================================================
// SECONDARY TAXONOMY ROLLUP
// ============================================================================

/// Sector-year regrouped on a secondary classification
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SecondarySectorYear {
    #[serde(rename = "reportedInSystem_id")]
    pub system_id: String,
    pub year: i32,
    pub country_id: Option<String>,
    pub secondary_code: Option<String>,
    pub secondary_description: Option<String>,
    #[serde(rename = "allocatedFree")]
    pub allocated_free: Option<f64>,
    #[serde(rename = "allocatedTotal")]
    pub allocated_total: Option<f64>,
    pub verified: Option<f64>,
    pub surrendered: Option<f64>,
    pub balance: Option<f64>,
    pub free_share: Option<f64>,
    pub allocation_metric: AllocationMetric,
}

pub const SECONDARY_COLUMNS: &[&str] = &[
    "reportedInSystem_id",
    "year",
    "country_id",
    "secondary_code",
    "secondary_description",
    "allocatedFree",
    "allocatedTotal",
    "verified",
    "surrendered",
    "balance",
    "free_share",
    "allocation_metric",
];

type SecondaryKey = (AllocationMetric, String, i32, Option<String>, Option<String>);

/// Regroup sector rows by the concordance target of their ISIC4 code.
///
/// Rows whose ISIC4 code is missing or unmapped land in a group with no
/// secondary code.
pub fn rollup(
    sector: &[SectorYear],
    concordance: &Concordance,
    taxonomy: &str,
) -> Vec<SecondarySectorYear> {
    let matches = concordance.map(sector.iter().map(|s| s.isic4_code.as_deref()), taxonomy);
    let mut groups: BTreeMap<SecondaryKey, SecondarySectorYear> = BTreeMap::new();

    for (s, m) in sector.iter().zip(matches) {
        let key = (
            s.allocation_metric,
            s.system_id.clone(),
            s.year,
            s.country_id.clone(),
            m.target_code.clone(),
        );
        let entry = groups.entry(key).or_insert_with(|| SecondarySectorYear {
            system_id: s.system_id.clone(),
            year: s.year,
            country_id: s.country_id.clone(),
            secondary_code: m.target_code.clone(),
            secondary_description: m.target_description.clone(),
            allocated_free: None,
            allocated_total: None,
            verified: None,
            surrendered: None,
            balance: None,
            free_share: None,
            allocation_metric: s.allocation_metric,
        });

        accumulate(&mut entry.allocated_free, s.allocated_free);
        accumulate(&mut entry.allocated_total, s.allocated_total);
        accumulate(&mut entry.verified, s.verified);
        accumulate(&mut entry.surrendered, s.surrendered);
        accumulate(&mut entry.balance, s.balance);
    }

    groups
        .into_values()
        .map(|mut r| {
            r.free_share = free_share(r.allocated_free, r.verified);
            r
        })
        .collect()
}

// ============================================================================
// TESTS
// ============================================================================
