// ⚖️ Conservation Check - allocated shares must add back up to cohort totals
//
// For every cohort:
//
//     sum(allocated_i) == T_s     (within a relative tolerance)
//
// unless every member has zero weight, in which case the whole cohort gets
// zero and the total is reported as unallocated. Anything else means the
// engine or the inputs are broken and the run should say so.

use crate::allocation::WeightSignal;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

// ============================================================================
// COHORT RESULT
// ============================================================================

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum CohortResult {
    /// Allocated sum equals the total
    Balanced,

    /// Every member had zero weight; nothing was allocated
    ZeroWeight { unallocated: f64 },

    /// Allocated sum differs from the total by more than the tolerance
    Discrepancy { difference: f64 },
}

impl CohortResult {
    pub fn is_balanced(&self) -> bool {
        matches!(self, CohortResult::Balanced)
    }

    pub fn difference(&self) -> f64 {
        match self {
            CohortResult::Balanced => 0.0,
            CohortResult::ZeroWeight { unallocated } => *unallocated,
            CohortResult::Discrepancy { difference } => *difference,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CohortBalance {
    pub cohort: String,
    pub members: usize,
    pub expected: f64,
    pub allocated: f64,
    pub result: CohortResult,
}

// ============================================================================
// CONSERVATION REPORT
// ============================================================================

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ConservationReport {
    pub cohorts: Vec<CohortBalance>,
}

impl ConservationReport {
    pub fn balanced_count(&self) -> usize {
        self.cohorts.iter().filter(|c| c.result.is_balanced()).count()
    }

    pub fn zero_weight_count(&self) -> usize {
        self.cohorts
            .iter()
            .filter(|c| matches!(c.result, CohortResult::ZeroWeight { .. }))
            .count()
    }

    pub fn discrepancies(&self) -> impl Iterator<Item = &CohortBalance> {
        self.cohorts
            .iter()
            .filter(|c| matches!(c.result, CohortResult::Discrepancy { .. }))
    }

    pub fn is_conserved(&self) -> bool {
        self.discrepancies().next().is_none()
    }

    pub fn summary(&self) -> String {
        format!(
            "{} cohorts: {} balanced, {} zero-weight, {} discrepancies",
            self.cohorts.len(),
            self.balanced_count(),
            self.zero_weight_count(),
            self.discrepancies().count()
        )
    }

    pub fn merge(&mut self, other: ConservationReport) {
        self.cohorts.extend(other.cohorts);
    }
}

/// Run-level counters written to the manifest
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize)]
pub struct ConservationSummary {
    pub cohorts: usize,
    pub balanced: usize,
    pub zero_weight: usize,
    pub discrepancies: usize,
}

impl From<&ConservationReport> for ConservationSummary {
    fn from(report: &ConservationReport) -> Self {
        ConservationSummary {
            cohorts: report.cohorts.len(),
            balanced: report.balanced_count(),
            zero_weight: report.zero_weight_count(),
            discrepancies: report.discrepancies().count(),
        }
    }
}

impl ConservationSummary {
    pub fn add(&mut self, other: ConservationSummary) {
        self.cohorts += other.cohorts;
        self.balanced += other.balanced;
        self.zero_weight += other.zero_weight;
        self.discrepancies += other.discrepancies;
    }
}

// ============================================================================
// CONSERVATION ENGINE
// ============================================================================

pub struct ConservationEngine {
    /// Relative tolerance on |allocated - expected| / max(|expected|, 1)
    pub tolerance: f64,
}

impl ConservationEngine {
    pub fn new() -> Self {
        ConservationEngine { tolerance: 1e-6 }
    }

    pub fn with_tolerance(tolerance: f64) -> Self {
        ConservationEngine { tolerance }
    }

    /// Compare per-cohort allocated sums with their totals.
    ///
    /// `allocated` is row-aligned with `entities`. Cohorts without a total
    /// are ignored here; the allocation engine already rejects them.
    pub fn check(
        &self,
        entities: &[WeightSignal],
        allocated: &[f64],
        totals: &BTreeMap<String, f64>,
    ) -> ConservationReport {
        let mut sums: BTreeMap<&str, (usize, f64)> = BTreeMap::new();
        for (entity, value) in entities.iter().zip(allocated) {
            let entry = sums.entry(entity.cohort.as_str()).or_insert((0, 0.0));
            entry.0 += 1;
            entry.1 += value;
        }

        let cohorts = sums
            .into_iter()
            .filter_map(|(cohort, (members, sum))| {
                let expected = *totals.get(cohort)?;
                Some(CohortBalance {
                    cohort: cohort.to_string(),
                    members,
                    expected,
                    allocated: sum,
                    result: self.classify(expected, sum),
                })
            })
            .collect();

        ConservationReport { cohorts }
    }

    fn classify(&self, expected: f64, allocated: f64) -> CohortResult {
        let difference = expected - allocated;
        if difference.abs() <= self.tolerance * expected.abs().max(1.0) {
            CohortResult::Balanced
        } else if allocated == 0.0 {
            CohortResult::ZeroWeight {
                unallocated: expected,
            }
        } else {
            CohortResult::Discrepancy { difference }
        }
    }
}

impl Default for ConservationEngine {
    fn default() -> Self {
        Self::new()
    }
}

// ============================================================================
// TESTS
// ============================================================================
