// ✅ Data Quality Flags - non-blocking checks on facility-year rows
//
// Nothing here rejects a row. Suspicious values are marked in the flag
// columns and counted so a run can report how much of its output deserves a
// second look.

use crate::schema::{AllocationMetric, FacilityYear};
use serde::{Deserialize, Serialize};

/// Slack used when comparing surrendered allowances with verified emissions
pub const SURRENDER_TOLERANCE: f64 = 1e-6;

// ============================================================================
// QUALITY REPORT
// ============================================================================

#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize)]
pub struct QualityReport {
    pub rows: usize,
    pub negative_observed: usize,
    pub negative_reconstructed: usize,
    pub negative_counterfactual: usize,
    pub surrender_lt_emissions: usize,
    pub surrender_gt_emissions: usize,
}

impl QualityReport {
    pub fn flagged_negative(&self) -> usize {
        self.negative_observed + self.negative_reconstructed + self.negative_counterfactual
    }

    pub fn summary(&self) -> String {
        format!(
            "{} rows: {} negative allocations, {} under-surrendered, {} over-surrendered",
            self.rows,
            self.flagged_negative(),
            self.surrender_lt_emissions,
            self.surrender_gt_emissions
        )
    }
}

// ============================================================================
// DATA QUALITY ENGINE
// ============================================================================

pub struct DataQualityEngine {
    pub surrender_tolerance: f64,
}

impl DataQualityEngine {
    pub fn new() -> Self {
        DataQualityEngine {
            surrender_tolerance: SURRENDER_TOLERANCE,
        }
    }

    /// Set every flag column on one row from its current values
    pub fn flag(&self, row: &mut FacilityYear) {
        row.flag_allocation_observed_free_negative =
            is_negative(row.allocation(AllocationMetric::Observed));
        row.flag_allocation_reconstructed_free_negative =
            is_negative(row.allocation(AllocationMetric::Reconstructed));
        row.flag_allocation_counterfactual_free_negative =
            is_negative(row.allocation(AllocationMetric::Counterfactual));

        let (lt, gt) = match (row.allowances_surrendered, row.emissions_verified) {
            (Some(surrendered), Some(emissions)) => (
                surrendered + self.surrender_tolerance < emissions,
                surrendered > emissions + self.surrender_tolerance,
            ),
            _ => (false, false),
        };
        row.flag_surrender_lt_emissions = lt;
        row.flag_surrender_gt_emissions = gt;
    }

    pub fn apply(&self, rows: &mut [FacilityYear]) -> QualityReport {
        let mut report = QualityReport {
            rows: rows.len(),
            ..QualityReport::default()
        };
        for row in rows.iter_mut() {
            self.flag(row);
            report.negative_observed += row.flag_allocation_observed_free_negative as usize;
            report.negative_reconstructed +=
                row.flag_allocation_reconstructed_free_negative as usize;
            report.negative_counterfactual +=
                row.flag_allocation_counterfactual_free_negative as usize;
            report.surrender_lt_emissions += row.flag_surrender_lt_emissions as usize;
            report.surrender_gt_emissions += row.flag_surrender_gt_emissions as usize;
        }
        report
    }
}

impl Default for DataQualityEngine {
    fn default() -> Self {
        Self::new()
    }
}

/// Flag rows with the default tolerance
pub fn apply_flags(rows: &mut [FacilityYear]) -> QualityReport {
    DataQualityEngine::new().apply(rows)
}

fn is_negative(value: Option<f64>) -> bool {
    matches!(value, Some(v) if v < 0.0)
}

// ============================================================================
// TESTS
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use crate::schema::SystemId;

    fn row(emissions: Option<f64>, surrendered: Option<f64>) -> FacilityYear {
        let mut f = FacilityYear::new(SystemId::UkEts, 2022, "UK-1");
        f.emissions_verified = emissions;
        f.allowances_surrendered = surrendered;
        f
    }

    #[test]
    fn test_surrender_flags() {
        let mut rows = vec![
            row(Some(100.0), Some(90.0)),
            row(Some(100.0), Some(100.0 - 1e-9)),
            row(Some(100.0), Some(120.0)),
            row(None, Some(120.0)),
        ];
        let report = apply_flags(&mut rows);

        assert!(rows[0].flag_surrender_lt_emissions);
        assert!(!rows[1].flag_surrender_lt_emissions);
        assert!(!rows[1].flag_surrender_gt_emissions);
        assert!(rows[2].flag_surrender_gt_emissions);
        assert!(!rows[3].flag_surrender_lt_emissions && !rows[3].flag_surrender_gt_emissions);
        assert_eq!(report.surrender_lt_emissions, 1);
        assert_eq!(report.surrender_gt_emissions, 1);
        println!("✅ {}", report.summary());
    }

    #[test]
    fn test_negative_allocation_flags() {
        let mut r = row(Some(1.0), None);
        r.allocation_observed_free = Some(-5.0);
        r.allocation_reconstructed_free = Some(0.0);
        r.allocation_counterfactual_free = None;
        let mut rows = vec![r];

        let report = apply_flags(&mut rows);
        assert!(rows[0].flag_allocation_observed_free_negative);
        assert!(!rows[0].flag_allocation_reconstructed_free_negative);
        assert!(!rows[0].flag_allocation_counterfactual_free_negative);
        assert_eq!(report.flagged_negative(), 1);
    }

    #[test]
    fn test_flags_are_recomputed() {
        let mut r = row(Some(10.0), Some(5.0));
        let engine = DataQualityEngine::new();
        engine.flag(&mut r);
        assert!(r.flag_surrender_lt_emissions);

        r.allowances_surrendered = Some(10.0);
        engine.flag(&mut r);
        assert!(!r.flag_surrender_lt_emissions);
    }
}
