// 🧩 Harmonizers - one adapter per registry, one facility-year schema out
//
// Each registry publishes different tables with different gaps. A
// harmonizer joins its source tables, attaches classification codes and
// fills the three allocation metrics, so everything downstream sees the same
// FacilityYear rows regardless of where they came from.

pub mod california;
pub mod euets;
pub mod ukets;
pub mod washington;

pub use california::{CaliforniaHarmonizer, CaliforniaOptions};
pub use euets::{EuEtsHarmonizer, EuEtsOptions};
pub use ukets::{UkEtsHarmonizer, UkEtsColumns};
pub use washington::{WashingtonHarmonizer, WashingtonOptions};

use crate::allocation::{Alpha, Option3, WeightSignal};
use crate::error::HarmonizeError;
use crate::reconciliation::{ConservationEngine, ConservationReport};
use crate::schema::{FacilityYear, SectorYear, SystemId};
use anyhow::Result;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet};
use tracing::{debug, warn};

// ============================================================================
// CORE TRAIT
// ============================================================================

/// Harmonizer - turns one registry's source tables into facility-year rows
pub trait Harmonizer: Send + Sync {
    /// Registry this harmonizer reads
    fn system(&self) -> SystemId;

    /// Build facility-year rows with every allocation metric filled where knowable
    fn harmonize(&self) -> Result<Harmonized>;

    /// Registry-native sector table, for systems that publish one
    fn native_sector(&self) -> Result<Option<Vec<SectorYear>>> {
        Ok(None)
    }
}

/// Output of one harmonizer run
#[derive(Debug, Clone)]
pub struct Harmonized {
    pub system: SystemId,
    pub rows: Vec<FacilityYear>,
    pub conservation: ConservationReport,
}

impl Harmonized {
    pub fn new(system: SystemId, rows: Vec<FacilityYear>) -> Self {
        Harmonized {
            system,
            rows,
            conservation: ConservationReport::default(),
        }
    }
}

// ============================================================================
// ALLOCATION SETTINGS
// ============================================================================

/// Alphas used for the two estimated metrics
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct AllocationSettings {
    /// Reconstructed metric (registries without facility-level allocations)
    pub hybrid_alpha: Alpha,
    /// Counterfactual metric, shared by every registry
    pub counterfactual_alpha: Alpha,
}

impl Default for AllocationSettings {
    fn default() -> Self {
        AllocationSettings {
            hybrid_alpha: Alpha::new(0.5).unwrap_or(Alpha::PROPORTIONAL),
            counterfactual_alpha: Alpha::PROPORTIONAL,
        }
    }
}

/// Provenance string for an estimated metric
pub fn option3_source(alpha: Alpha, basis: &str) -> String {
    format!("Option3(alpha={}) on {}", alpha, basis)
}

// ============================================================================
// COHORT ALLOCATION
// ============================================================================

/// What to do with entities whose cohort has no total
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MissingTotals {
    /// Leave their allocation absent
    Skip,
    /// Abort with MissingCohortTotals
    Fail,
}

/// Row-aligned allocation result plus its conservation check
#[derive(Debug, Clone)]
pub struct CohortAllocation {
    pub values: Vec<Option<f64>>,
    pub report: ConservationReport,
}

/// Allocate cohort totals over entities.
///
/// `entities` is row-aligned with the output; `None` entries have no
/// knowable cohort and always get an absent allocation.
pub fn allocate_cohorts(
    entities: &[Option<WeightSignal>],
    totals: &BTreeMap<String, f64>,
    benchmarks: &BTreeMap<String, f64>,
    alpha: Alpha,
    missing: MissingTotals,
) -> Result<CohortAllocation, HarmonizeError> {
    let mut positions = Vec::new();
    let mut signals = Vec::new();
    let mut skipped: BTreeSet<&str> = BTreeSet::new();

    for (i, entity) in entities.iter().enumerate() {
        let Some(signal) = entity else { continue };
        if missing == MissingTotals::Skip && !totals.contains_key(&signal.cohort) {
            skipped.insert(signal.cohort.as_str());
            continue;
        }
        positions.push(i);
        signals.push(signal.clone());
    }

    if !skipped.is_empty() {
        debug!(cohorts = skipped.len(), "cohorts without a total left unallocated");
    }

    let shares = Option3::new(alpha).allocate(&signals, totals, benchmarks)?;
    let allocated: Vec<f64> = shares.iter().map(|s| s.allocated).collect();

    let report = ConservationEngine::new().check(&signals, &allocated, totals);
    for bad in report.discrepancies() {
        warn!(
            cohort = %bad.cohort,
            expected = bad.expected,
            allocated = bad.allocated,
            "allocation does not conserve the cohort total"
        );
    }
    debug!(alpha = %alpha, "{}", report.summary());

    let mut values = vec![None; entities.len()];
    for (pos, value) in positions.into_iter().zip(allocated) {
        values[pos] = Some(value);
    }

    Ok(CohortAllocation { values, report })
}

/// Sum of non-missing values per cohort; cohorts with no values get no total
pub fn observed_totals<'a, I>(pairs: I) -> BTreeMap<String, f64>
where
    I: IntoIterator<Item = (&'a str, Option<f64>)>,
{
    let mut totals = BTreeMap::new();
    for (cohort, value) in pairs {
        if let Some(v) = value {
            *totals.entry(cohort.to_string()).or_insert(0.0) += v;
        }
    }
    totals
}

/// Emissions per unit of observed allocation; 0/0 and other non-finite ratios are missing
pub fn intensity_proxy(emissions: Option<f64>, observed: Option<f64>) -> Option<f64> {
    match (emissions, observed) {
        (Some(e), Some(o)) => {
            let ratio = e / o;
            if ratio.is_nan() {
                None
            } else {
                Some(ratio)
            }
        }
        _ => None,
    }
}

/// Cohort key from its parts; missing parts are kept as empty segments
pub fn cohort_key(parts: &[Option<&str>]) -> String {
    parts
        .iter()
        .map(|p| p.unwrap_or(""))
        .collect::<Vec<_>>()
        .join("|")
}

/// Fill the counterfactual metric for registries that publish observed allocations.
///
/// Totals are the observed sums within each cohort; intensity is the
/// emissions/observed proxy.
pub fn counterfactual_from_observed(
    rows: &mut [FacilityYear],
    cohorts: &[String],
    alpha: Alpha,
    basis: &str,
) -> Result<ConservationReport, HarmonizeError> {
    let totals = observed_totals(
        cohorts
            .iter()
            .zip(rows.iter())
            .map(|(c, r)| (c.as_str(), r.allocation_observed_free)),
    );

    let entities: Vec<Option<WeightSignal>> = cohorts
        .iter()
        .zip(rows.iter())
        .map(|(cohort, row)| {
            Some(
                WeightSignal::new(cohort.clone(), row.emissions_verified).with_intensity(
                    intensity_proxy(row.emissions_verified, row.allocation_observed_free),
                ),
            )
        })
        .collect();

    let result = allocate_cohorts(&entities, &totals, &BTreeMap::new(), alpha, MissingTotals::Skip)?;

    let source = option3_source(alpha, basis);
    for (row, value) in rows.iter_mut().zip(result.values) {
        row.allocation_counterfactual_free = value;
        row.allocation_counterfactual_source = value.map(|_| source.clone());
    }
    Ok(result.report)
}

// ============================================================================
// TESTS
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;

    fn totals(pairs: &[(&str, f64)]) -> BTreeMap<String, f64> {
        pairs.iter().map(|(k, v)| (k.to_string(), *v)).collect()
    }

    #[test]
    fn test_allocate_cohorts_skip_policy() {
        let entities = vec![
            Some(WeightSignal::new("A", Some(1.0))),
            None,
            Some(WeightSignal::new("B", Some(3.0))),
            Some(WeightSignal::new("A", Some(3.0))),
        ];
        let out = allocate_cohorts(
            &entities,
            &totals(&[("A", 8.0)]),
            &BTreeMap::new(),
            Alpha::PROPORTIONAL,
            MissingTotals::Skip,
        )
        .unwrap();

        assert_eq!(out.values, vec![Some(2.0), None, None, Some(6.0)]);
        assert!(out.report.is_conserved());
        println!("✅ Cohort without total left absent");
    }

    #[test]
    fn test_allocate_cohorts_fail_policy() {
        let entities = vec![Some(WeightSignal::new("B", Some(3.0)))];
        let err = allocate_cohorts(
            &entities,
            &totals(&[("A", 8.0)]),
            &BTreeMap::new(),
            Alpha::PROPORTIONAL,
            MissingTotals::Fail,
        )
        .unwrap_err();
        assert!(matches!(err, HarmonizeError::MissingCohortTotals { .. }));
    }

    #[test]
    fn test_observed_totals_min_count() {
        let t = observed_totals(vec![
            ("A", Some(1.0)),
            ("A", None),
            ("A", Some(2.0)),
            ("B", None),
        ]);
        assert_eq!(t.get("A"), Some(&3.0));
        assert_eq!(t.get("B"), None);
    }

    #[test]
    fn test_intensity_proxy() {
        assert_eq!(intensity_proxy(Some(10.0), Some(5.0)), Some(2.0));
        assert_eq!(intensity_proxy(Some(0.0), Some(0.0)), None);
        assert_eq!(intensity_proxy(Some(10.0), Some(0.0)), Some(f64::INFINITY));
        assert_eq!(intensity_proxy(None, Some(5.0)), None);
    }

    #[test]
    fn test_cohort_key_keeps_missing_segments() {
        assert_eq!(cohort_key(&[Some("2022"), None, Some("24.1")]), "2022||24.1");
    }

    #[test]
    fn test_counterfactual_from_observed() {
        let mut a = FacilityYear::new(SystemId::UkEts, 2022, "P1");
        a.emissions_verified = Some(10.0);
        a.allocation_observed_free = Some(40.0);
        let mut b = FacilityYear::new(SystemId::UkEts, 2022, "P2");
        b.emissions_verified = Some(30.0);
        b.allocation_observed_free = Some(60.0);
        let mut c = FacilityYear::new(SystemId::UkEts, 2022, "P3");
        c.emissions_verified = Some(5.0);

        let mut rows = vec![a, b, c];
        let cohorts = vec!["2022|24".to_string(), "2022|24".to_string(), "2022|".to_string()];
        let report =
            counterfactual_from_observed(&mut rows, &cohorts, Alpha::PROPORTIONAL, "NACE totals")
                .unwrap();

        assert_eq!(rows[0].allocation_counterfactual_free, Some(25.0));
        assert_eq!(rows[1].allocation_counterfactual_free, Some(75.0));
        // The third cohort has no observed value at all
        assert_eq!(rows[2].allocation_counterfactual_free, None);
        assert_eq!(
            rows[0].allocation_counterfactual_source.as_deref(),
            Some("Option3(alpha=0) on NACE totals")
        );
        assert_eq!(rows[2].allocation_counterfactual_source, None);
        assert!(report.is_conserved());
        println!("✅ Counterfactual provenance only where a value was estimated");
    }
}
