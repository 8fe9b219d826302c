// 📐 Canonical Schemas - facility-year and sector-year column contracts
//
// Every quantity is Option<f64>: None is "not known", 0.0 is a real zero.
// Both structs serialize with every column present, so a CSV written from
// them always carries the full contract even when a source never fills a
// field.

use serde::{Deserialize, Serialize};
use std::fmt;

// ============================================================================
// SYSTEM IDENTIFIER
// ============================================================================

/// Which registry a record came from
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub enum SystemId {
    #[serde(rename = "euets")]
    EuEts,
    #[serde(rename = "ukets")]
    UkEts,
    #[serde(rename = "caccat")]
    California,
    #[serde(rename = "washington_cca")]
    Washington,
}

impl SystemId {
    /// Human-readable name for display
    pub fn name(&self) -> &'static str {
        match self {
            SystemId::EuEts => "EU ETS",
            SystemId::UkEts => "UK ETS",
            SystemId::California => "California Cap-and-Trade",
            SystemId::Washington => "Washington Cap-and-Invest",
        }
    }

    /// Identifier written to the system_id column
    pub fn code(&self) -> &'static str {
        match self {
            SystemId::EuEts => "euets",
            SystemId::UkEts => "ukets",
            SystemId::California => "caccat",
            SystemId::Washington => "washington_cca",
        }
    }

    /// Fixed jurisdiction for single-jurisdiction systems
    pub fn fixed_jurisdiction(&self) -> Option<&'static str> {
        match self {
            SystemId::EuEts => None,
            SystemId::UkEts => Some("GB"),
            SystemId::California => Some("US-CA"),
            SystemId::Washington => Some("US-WA"),
        }
    }
}

impl fmt::Display for SystemId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.code())
    }
}

// ============================================================================
// ALLOCATION METRIC
// ============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum AllocationMetric {
    /// Published by the registry
    Observed,
    /// Best estimate from published aggregates (hybrid weighting)
    Reconstructed,
    /// Fixed-method baseline for cross-system comparison
    Counterfactual,
}

impl AllocationMetric {
    pub const ALL: [AllocationMetric; 3] = [
        AllocationMetric::Observed,
        AllocationMetric::Reconstructed,
        AllocationMetric::Counterfactual,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            AllocationMetric::Observed => "observed",
            AllocationMetric::Reconstructed => "reconstructed",
            AllocationMetric::Counterfactual => "counterfactual",
        }
    }

    /// The facility column this metric reads from
    pub fn facility_column(&self) -> &'static str {
        match self {
            AllocationMetric::Observed => "allocation_observed_free",
            AllocationMetric::Reconstructed => "allocation_reconstructed_free",
            AllocationMetric::Counterfactual => "allocation_counterfactual_free",
        }
    }
}

impl fmt::Display for AllocationMetric {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl std::str::FromStr for AllocationMetric {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_lowercase().as_str() {
            "observed" => Ok(AllocationMetric::Observed),
            "reconstructed" => Ok(AllocationMetric::Reconstructed),
            "counterfactual" => Ok(AllocationMetric::Counterfactual),
            other => Err(format!(
                "unknown allocation metric '{}' (expected observed, reconstructed or counterfactual)",
                other
            )),
        }
    }
}

// ============================================================================
// FACILITY-YEAR
// ============================================================================

/// One regulated facility in one compliance period
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FacilityYear {
    pub system_id: SystemId,
    pub country_id: Option<String>,
    pub year: i32,
    pub facility_id: String,
    pub installation_id: Option<String>,
    pub facility_name: Option<String>,
    pub operator_name: Option<String>,

    // Classification: harmonized (NACE), secondary (ISIC4), source-native
    pub nace_code: Option<String>,
    pub nace_description: Option<String>,
    pub isic4_code: Option<String>,
    pub native_code: Option<String>,

    pub emissions_verified: Option<f64>,
    pub allowances_surrendered: Option<f64>,

    pub allocation_observed_free: Option<f64>,
    pub allocation_reconstructed_free: Option<f64>,
    pub allocation_counterfactual_free: Option<f64>,

    pub allocation_observed_source: Option<String>,
    pub allocation_reconstructed_source: Option<String>,
    pub allocation_counterfactual_source: Option<String>,

    // Validation flags (see data_quality.rs); false until flagged
    #[serde(default)]
    pub flag_allocation_observed_free_negative: bool,
    #[serde(default)]
    pub flag_allocation_reconstructed_free_negative: bool,
    #[serde(default)]
    pub flag_allocation_counterfactual_free_negative: bool,
    #[serde(default)]
    pub flag_surrender_lt_emissions: bool,
    #[serde(default)]
    pub flag_surrender_gt_emissions: bool,
}

impl FacilityYear {
    /// New record with every optional column missing
    pub fn new(system_id: SystemId, year: i32, facility_id: impl Into<String>) -> Self {
        FacilityYear {
            system_id,
            country_id: system_id.fixed_jurisdiction().map(|c| c.to_string()),
            year,
            facility_id: facility_id.into(),
            installation_id: None,
            facility_name: None,
            operator_name: None,
            nace_code: None,
            nace_description: None,
            isic4_code: None,
            native_code: None,
            emissions_verified: None,
            allowances_surrendered: None,
            allocation_observed_free: None,
            allocation_reconstructed_free: None,
            allocation_counterfactual_free: None,
            allocation_observed_source: None,
            allocation_reconstructed_source: None,
            allocation_counterfactual_source: None,
            flag_allocation_observed_free_negative: false,
            flag_allocation_reconstructed_free_negative: false,
            flag_allocation_counterfactual_free_negative: false,
            flag_surrender_lt_emissions: false,
            flag_surrender_gt_emissions: false,
        }
    }

    /// Allocation value for a metric
    pub fn allocation(&self, metric: AllocationMetric) -> Option<f64> {
        match metric {
            AllocationMetric::Observed => self.allocation_observed_free,
            AllocationMetric::Reconstructed => self.allocation_reconstructed_free,
            AllocationMetric::Counterfactual => self.allocation_counterfactual_free,
        }
    }
}

/// Canonical facility-year columns, in output order
pub const FACILITY_COLUMNS: &[&str] = &[
    "system_id",
    "country_id",
    "year",
    "facility_id",
    "installation_id",
    "facility_name",
    "operator_name",
    "nace_code",
    "nace_description",
    "isic4_code",
    "native_code",
    "emissions_verified",
    "allowances_surrendered",
    "allocation_observed_free",
    "allocation_reconstructed_free",
    "allocation_counterfactual_free",
    "allocation_observed_source",
    "allocation_reconstructed_source",
    "allocation_counterfactual_source",
    "flag_allocation_observed_free_negative",
    "flag_allocation_reconstructed_free_negative",
    "flag_allocation_counterfactual_free_negative",
    "flag_surrender_lt_emissions",
    "flag_surrender_gt_emissions",
];

// ============================================================================
// SECTOR-YEAR
// ============================================================================

/// Aggregate over all facilities sharing system, year, jurisdiction and NACE code.
/// Column names follow the EU ETS sector aggregation schema.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SectorYear {
    #[serde(rename = "reportedInSystem_id")]
    pub system_id: String,
    pub year: i32,
    pub country_id: Option<String>,
    pub nace_code: Option<String>,
    #[serde(rename = "allocatedFree")]
    pub allocated_free: Option<f64>,
    #[serde(rename = "allocatedNewEntrance")]
    pub allocated_new_entrance: Option<f64>,
    #[serde(rename = "allocatedTotal")]
    pub allocated_total: Option<f64>,
    #[serde(rename = "allocated10c")]
    pub allocated_10c: Option<f64>,
    pub verified: Option<f64>,
    pub surrendered: Option<f64>,
    pub balance: Option<f64>,
    pub penalty: Option<f64>,
    pub free_share: Option<f64>,
    pub nace_level: Option<u8>,
    pub nace_description: Option<String>,
    pub isic4_code: Option<String>,
    pub allocation_metric: AllocationMetric,
}

impl SectorYear {
    pub fn new(
        system_id: impl Into<String>,
        year: i32,
        country_id: Option<String>,
        nace_code: Option<String>,
        metric: AllocationMetric,
    ) -> Self {
        let nace_level = nace_code.as_deref().and_then(nace_level);
        SectorYear {
            system_id: system_id.into(),
            year,
            country_id,
            nace_code,
            allocated_free: None,
            allocated_new_entrance: None,
            allocated_total: None,
            allocated_10c: None,
            verified: None,
            surrendered: None,
            balance: None,
            penalty: None,
            free_share: None,
            nace_level,
            nace_description: None,
            isic4_code: None,
            allocation_metric: metric,
        }
    }
}

/// Canonical sector-year columns, in output order
pub const SECTOR_COLUMNS: &[&str] = &[
    "reportedInSystem_id",
    "year",
    "country_id",
    "nace_code",
    "allocatedFree",
    "allocatedNewEntrance",
    "allocatedTotal",
    "allocated10c",
    "verified",
    "surrendered",
    "balance",
    "penalty",
    "free_share",
    "nace_level",
    "nace_description",
    "isic4_code",
    "allocation_metric",
];

/// Ratio allocation / emissions; absent when either side is missing or emissions is zero
pub fn free_share(allocated: Option<f64>, verified: Option<f64>) -> Option<f64> {
    match (allocated, verified) {
        (Some(a), Some(v)) if v != 0.0 => Some(a / v).filter(|r| r.is_finite()),
        _ => None,
    }
}

/// NACE Rev.2 hierarchy level of a code: 1 section letter, 2 division ("35"),
/// 3 group ("35.1"), 4 class ("35.11").
pub fn nace_level(code: &str) -> Option<u8> {
    let code = code.trim();
    if code.len() == 1 && code.chars().all(|c| c.is_ascii_alphabetic()) {
        return Some(1);
    }
    let digits = code.chars().filter(|c| c.is_ascii_digit()).count();
    match digits {
        2..=4 => Some(digits as u8),
        _ => None,
    }
}

// ============================================================================
// TESTS
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_system_codes() {
        assert_eq!(SystemId::California.code(), "caccat");
        assert_eq!(SystemId::UkEts.fixed_jurisdiction(), Some("GB"));
        assert_eq!(SystemId::EuEts.fixed_jurisdiction(), None);
        assert_eq!(SystemId::Washington.to_string(), "washington_cca");
    }

    #[test]
    fn test_metric_parsing() {
        assert_eq!("Observed".parse::<AllocationMetric>(), Ok(AllocationMetric::Observed));
        assert_eq!(
            "counterfactual".parse::<AllocationMetric>(),
            Ok(AllocationMetric::Counterfactual)
        );
        assert!("total".parse::<AllocationMetric>().is_err());
    }

    #[test]
    fn test_new_facility_fills_fixed_jurisdiction() {
        let f = FacilityYear::new(SystemId::California, 2022, "101");
        assert_eq!(f.country_id.as_deref(), Some("US-CA"));
        assert_eq!(f.allocation(AllocationMetric::Observed), None);

        let eu = FacilityYear::new(SystemId::EuEts, 2022, "DE_1");
        assert_eq!(eu.country_id, None);
    }

    #[test]
    fn test_free_share() {
        assert_eq!(free_share(Some(50.0), Some(100.0)), Some(0.5));
        assert_eq!(free_share(Some(50.0), Some(0.0)), None);
        assert_eq!(free_share(None, Some(100.0)), None);
        assert_eq!(free_share(Some(50.0), None), None);
    }

    #[test]
    fn test_nace_level() {
        assert_eq!(nace_level("D"), Some(1));
        assert_eq!(nace_level("35"), Some(2));
        assert_eq!(nace_level("35.1"), Some(3));
        assert_eq!(nace_level("23.51"), Some(4));
        assert_eq!(nace_level(""), None);
    }

    #[test]
    fn test_facility_csv_header_matches_contract() {
        let mut writer = csv::Writer::from_writer(vec![]);
        writer
            .serialize(FacilityYear::new(SystemId::UkEts, 2021, "UK-E-IN-1"))
            .unwrap();
        let data = String::from_utf8(writer.into_inner().unwrap()).unwrap();
        let header = data.lines().next().unwrap();

        assert_eq!(header, FACILITY_COLUMNS.join(","));
    }

    #[test]
    fn test_sector_csv_header_matches_contract() {
        let mut writer = csv::Writer::from_writer(vec![]);
        writer
            .serialize(SectorYear::new("ukets", 2021, None, None, AllocationMetric::Observed))
            .unwrap();
        let data = String::from_utf8(writer.into_inner().unwrap()).unwrap();
        let mut lines = data.lines();

        assert_eq!(lines.next().unwrap(), SECTOR_COLUMNS.join(","));
        // Missing values are written as empty cells, never dropped
        assert_eq!(lines.next().unwrap().split(',').count(), SECTOR_COLUMNS.len());
    }
}
