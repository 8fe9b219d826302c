// ⚖️ Option 3 Allocation Engine - distribute cohort totals across members
//
// Weight per entity i in cohort s:
//
//     w_i = E_i * AF_i * (B_s / I_i)^alpha
//
// and the allocated quantity is T_s * w_i / sum_j(w_j). Shares sum to the
// cohort total by construction. alpha = 0 reduces to plain
// emissions-proportional allocation, the counterfactual baseline used for
// every registry.

use crate::error::HarmonizeError;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet};
use std::fmt;

/// Upper bound on B_s / I_i; near-zero intensities would otherwise dominate a cohort
pub const RATIO_CEILING: f64 = 1000.0;

// ============================================================================
// ALPHA
// ============================================================================

/// Intensity-adjustment strength, always within [0, 1]
#[derive(Debug, Clone, Copy, PartialEq, PartialOrd, Serialize, Deserialize)]
#[serde(try_from = "f64", into = "f64")]
pub struct Alpha(f64);

impl Alpha {
    pub const PROPORTIONAL: Alpha = Alpha(0.0);

    pub fn new(value: f64) -> Result<Self, HarmonizeError> {
        if value.is_finite() && (0.0..=1.0).contains(&value) {
            Ok(Alpha(value))
        } else {
            Err(HarmonizeError::AlphaOutOfRange(value))
        }
    }

    pub fn value(&self) -> f64 {
        self.0
    }
}

impl TryFrom<f64> for Alpha {
    type Error = HarmonizeError;

    fn try_from(value: f64) -> Result<Self, Self::Error> {
        Alpha::new(value)
    }
}

impl From<Alpha> for f64 {
    fn from(alpha: Alpha) -> f64 {
        alpha.0
    }
}

impl fmt::Display for Alpha {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

// ============================================================================
// INPUT / OUTPUT
// ============================================================================

/// Per-entity weight inputs
#[derive(Debug, Clone, PartialEq)]
pub struct WeightSignal {
    pub cohort: String,
    /// E_i; missing counts as zero emissions
    pub emissions: Option<f64>,
    /// AF_i; missing means 1
    pub assistance_factor: Option<f64>,
    /// I_i; missing means "same as the cohort benchmark"
    pub intensity: Option<f64>,
}

impl WeightSignal {
    pub fn new(cohort: impl Into<String>, emissions: Option<f64>) -> Self {
        WeightSignal {
            cohort: cohort.into(),
            emissions,
            assistance_factor: None,
            intensity: None,
        }
    }

    pub fn with_intensity(mut self, intensity: Option<f64>) -> Self {
        self.intensity = intensity;
        self
    }

    pub fn with_assistance_factor(mut self, factor: Option<f64>) -> Self {
        self.assistance_factor = factor;
        self
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub struct AllocatedShare {
    pub weight: f64,
    /// Fraction of the cohort total, 0 for zero-weight cohorts
    pub share: f64,
    pub allocated: f64,
}

// ============================================================================
// ENGINE
// ============================================================================

#[derive(Debug, Clone, Copy)]
pub struct Option3 {
    pub alpha: Alpha,
    pub ratio_ceiling: f64,
}

impl Option3 {
    pub fn new(alpha: Alpha) -> Self {
        Option3 {
            alpha,
            ratio_ceiling: RATIO_CEILING,
        }
    }

    /// Pure emissions-proportional allocation (alpha = 0)
    pub fn proportional() -> Self {
        Self::new(Alpha::PROPORTIONAL)
    }

    /// Intensity ratio B / I, clamped to [0, ratio_ceiling]
    pub fn intensity_ratio(&self, benchmark: f64, intensity: Option<f64>) -> f64 {
        let intensity = match intensity {
            Some(i) if !i.is_nan() => i,
            _ => return 1.0,
        };
        let ratio = benchmark / intensity;
        if ratio.is_nan() {
            1.0
        } else {
            ratio.clamp(0.0, self.ratio_ceiling)
        }
    }

    pub fn weight(&self, signal: &WeightSignal, benchmark: f64) -> f64 {
        let emissions = signal.emissions.filter(|e| e.is_finite()).unwrap_or(0.0);
        let assistance = signal
            .assistance_factor
            .filter(|a| a.is_finite())
            .unwrap_or(1.0);
        let ratio = self.intensity_ratio(benchmark, signal.intensity);
        emissions * assistance * ratio.powf(self.alpha.value())
    }

    /// Allocate each cohort's total across its members.
    ///
    /// Output is row-aligned with `entities`. Every cohort referenced by an
    /// entity must have a total; all missing cohorts are reported together.
    /// Benchmarks are optional per cohort and default to 1.
    pub fn allocate(
        &self,
        entities: &[WeightSignal],
        cohort_totals: &BTreeMap<String, f64>,
        benchmarks: &BTreeMap<String, f64>,
    ) -> Result<Vec<AllocatedShare>, HarmonizeError> {
        let missing: BTreeSet<&str> = entities
            .iter()
            .map(|e| e.cohort.as_str())
            .filter(|c| !cohort_totals.contains_key(*c))
            .collect();
        if !missing.is_empty() {
            return Err(HarmonizeError::MissingCohortTotals {
                cohorts: missing.into_iter().map(|c| c.to_string()).collect(),
            });
        }

        for (cohort, value) in benchmarks {
            if !(value.is_finite() && *value > 0.0) {
                return Err(HarmonizeError::InvalidBenchmark {
                    cohort: cohort.clone(),
                    value: *value,
                });
            }
        }

        let weights: Vec<f64> = entities
            .iter()
            .map(|e| {
                let benchmark = benchmarks.get(&e.cohort).copied().unwrap_or(1.0);
                self.weight(e, benchmark)
            })
            .collect();

        let mut weight_sums: BTreeMap<&str, f64> = BTreeMap::new();
        for (entity, weight) in entities.iter().zip(&weights) {
            *weight_sums.entry(entity.cohort.as_str()).or_insert(0.0) += weight;
        }

        let shares = entities
            .iter()
            .zip(&weights)
            .map(|(entity, &weight)| {
                let total = cohort_totals[&entity.cohort];
                let sum = weight_sums[entity.cohort.as_str()];
                if sum == 0.0 || !sum.is_finite() {
                    return AllocatedShare {
                        weight,
                        share: 0.0,
                        allocated: 0.0,
                    };
                }
                let share = weight / sum;
                AllocatedShare {
                    weight,
                    share,
                    allocated: total * share,
                }
            })
            .collect();

        Ok(shares)
    }
}

/// Convenience wrapper returning only the allocated quantities
pub fn allocate(
    entities: &[WeightSignal],
    cohort_totals: &BTreeMap<String, f64>,
    alpha: Alpha,
) -> Result<Vec<f64>, HarmonizeError> {
    Ok(Option3::new(alpha)
        .allocate(entities, cohort_totals, &BTreeMap::new())?
        .into_iter()
        .map(|s| s.allocated)
        .collect())
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

    fn assert_close(a: f64, b: f64) {
        assert!((a - b).abs() <= 1e-6 * b.abs().max(1.0), "{a} != {b}");
    }

    #[test]
    fn test_proportional_example() {
        let entities = vec![
            WeightSignal::new("X", Some(10.0)),
            WeightSignal::new("X", Some(30.0)),
        ];
        let out = allocate(&entities, &totals(&[("X", 100.0)]), Alpha::PROPORTIONAL).unwrap();

        assert_close(out[0], 25.0);
        assert_close(out[1], 75.0);
        assert_close(out.iter().sum(), 100.0);
        println!("✅ A=25, B=75");
    }

    #[test]
    fn test_intensity_adjusted_example() {
        let entities = vec![
            WeightSignal::new("X", Some(10.0)).with_intensity(Some(0.5)),
            WeightSignal::new("X", Some(30.0)).with_intensity(Some(2.0)),
        ];
        let engine = Option3::new(Alpha::new(1.0).unwrap());
        let out = engine
            .allocate(&entities, &totals(&[("X", 100.0)]), &totals(&[("X", 1.0)]))
            .unwrap();

        assert_close(out[0].weight, 20.0);
        assert_close(out[1].weight, 15.0);
        assert_close(out[0].allocated, 100.0 * 20.0 / 35.0);
        assert_close(out[1].allocated, 100.0 * 15.0 / 35.0);
        assert_close(out[0].allocated + out[1].allocated, 100.0);
    }

    #[test]
    fn test_alpha_zero_ignores_intensity_and_benchmark() {
        let plain = vec![
            WeightSignal::new("X", Some(10.0)),
            WeightSignal::new("X", Some(30.0)),
            WeightSignal::new("X", Some(60.0)),
        ];
        let with_intensity = vec![
            WeightSignal::new("X", Some(10.0)).with_intensity(Some(0.0)),
            WeightSignal::new("X", Some(30.0)).with_intensity(Some(7.5)),
            WeightSignal::new("X", Some(60.0)).with_intensity(Some(f64::INFINITY)),
        ];
        let t = totals(&[("X", 250.0)]);
        let engine = Option3::proportional();

        let a = engine.allocate(&plain, &t, &BTreeMap::new()).unwrap();
        let b = engine.allocate(&with_intensity, &t, &totals(&[("X", 3.0)])).unwrap();

        for (x, y) in a.iter().zip(&b) {
            assert_close(x.allocated, y.allocated);
        }
        assert_close(a[2].allocated, 150.0);
    }

    #[test]
    fn test_conservation_across_alphas_and_cohorts() {
        let entities = vec![
            WeightSignal::new("A", Some(5.0)).with_intensity(Some(0.2)),
            WeightSignal::new("A", Some(12.0)).with_intensity(Some(1.7)),
            WeightSignal::new("A", None),
            WeightSignal::new("B", Some(1000.0)).with_assistance_factor(Some(0.8)),
            WeightSignal::new("B", Some(3.0)).with_intensity(Some(0.0001)),
        ];
        let t = totals(&[("A", 1234.5), ("B", 99.0)]);
        let b = totals(&[("A", 0.9)]);

        for alpha in [0.0, 0.25, 0.5, 0.75, 1.0] {
            let engine = Option3::new(Alpha::new(alpha).unwrap());
            let out = engine.allocate(&entities, &t, &b).unwrap();
            let sum_a: f64 = out[..3].iter().map(|s| s.allocated).sum();
            let sum_b: f64 = out[3..].iter().map(|s| s.allocated).sum();
            assert_close(sum_a, 1234.5);
            assert_close(sum_b, 99.0);
            // Missing emissions never receive anything
            assert_eq!(out[2].allocated, 0.0);
        }
    }

    #[test]
    fn test_zero_weight_cohort_gets_zeros() {
        let entities = vec![
            WeightSignal::new("Z", Some(0.0)),
            WeightSignal::new("Z", None),
            WeightSignal::new("Y", Some(4.0)),
        ];
        let out = Option3::proportional()
            .allocate(&entities, &totals(&[("Z", 500.0), ("Y", 8.0)]), &BTreeMap::new())
            .unwrap();

        assert_eq!(out[0].allocated, 0.0);
        assert_eq!(out[1].allocated, 0.0);
        assert!(out.iter().all(|s| s.allocated.is_finite()));
        assert_close(out[2].allocated, 8.0);
    }

    #[test]
    fn test_missing_cohort_total_fails_with_keys() {
        let entities = vec![
            WeightSignal::new("known", Some(1.0)),
            WeightSignal::new("2023|Other", Some(1.0)),
            WeightSignal::new("2023|Cement", Some(1.0)),
            WeightSignal::new("2023|Other", Some(2.0)),
        ];
        let err = allocate(&entities, &totals(&[("known", 1.0)]), Alpha::PROPORTIONAL).unwrap_err();

        match err {
            HarmonizeError::MissingCohortTotals { cohorts } => {
                assert_eq!(cohorts, vec!["2023|Cement".to_string(), "2023|Other".to_string()]);
            }
            other => panic!("unexpected error: {other}"),
        }
    }

    #[test]
    fn test_alpha_range() {
        assert!(Alpha::new(0.0).is_ok());
        assert!(Alpha::new(1.0).is_ok());
        assert!(matches!(Alpha::new(1.5), Err(HarmonizeError::AlphaOutOfRange(_))));
        assert!(Alpha::new(-0.1).is_err());
        assert!(Alpha::new(f64::NAN).is_err());
    }

    #[test]
    fn test_intensity_ratio_clamping() {
        let engine = Option3::new(Alpha::new(1.0).unwrap());
        assert_eq!(engine.intensity_ratio(1.0, None), 1.0);
        assert_eq!(engine.intensity_ratio(1.0, Some(f64::NAN)), 1.0);
        assert_eq!(engine.intensity_ratio(1.0, Some(0.0)), RATIO_CEILING);
        assert_eq!(engine.intensity_ratio(1.0, Some(1e-9)), RATIO_CEILING);
        assert_eq!(engine.intensity_ratio(1.0, Some(f64::INFINITY)), 0.0);
        assert_eq!(engine.intensity_ratio(1.0, Some(-2.0)), 0.0);
        assert_eq!(engine.intensity_ratio(2.0, Some(4.0)), 0.5);
    }

    #[test]
    fn test_monotone_in_intensity_advantage() {
        // Lower intensity (more efficient) earns a larger share as alpha grows
        let entities = vec![
            WeightSignal::new("X", Some(10.0)).with_intensity(Some(0.5)),
            WeightSignal::new("X", Some(10.0)).with_intensity(Some(2.0)),
        ];
        let t = totals(&[("X", 100.0)]);
        let mut previous = 0.0;
        for alpha in [0.0, 0.5, 1.0] {
            let out = Option3::new(Alpha::new(alpha).unwrap())
                .allocate(&entities, &t, &BTreeMap::new())
                .unwrap();
            assert!(out[0].allocated >= previous);
            previous = out[0].allocated;
        }
        assert!(previous > 50.0);
    }

    #[test]
    fn test_invalid_benchmark_rejected() {
        let entities = vec![WeightSignal::new("X", Some(1.0))];
        let err = Option3::proportional()
            .allocate(&entities, &totals(&[("X", 1.0)]), &totals(&[("X", 0.0)]))
            .unwrap_err();
        assert!(matches!(err, HarmonizeError::InvalidBenchmark { .. }));
    }

    #[test]
    fn test_alpha_deserializes_with_validation() {
        #[derive(Deserialize)]
        struct Holder {
            alpha: Alpha,
        }
        let ok: Holder = toml::from_str("alpha = 0.5").unwrap();
        assert_eq!(ok.alpha.value(), 0.5);
        assert!(toml::from_str::<Holder>("alpha = 2.0").is_err());
    }
}
