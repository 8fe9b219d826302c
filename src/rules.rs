// 🏷️ Sector Rules - free-text industry labels to allocation sectors
//
// CARB publishes its allocation totals by a handful of allocation sectors,
// while the MRR emissions data carries a free-text "Industry Sector" label.
// Rules are applied in declaration order and a later match overrides an
// earlier one; labels nothing matches fall into the default sector.

use crate::error::HarmonizeError;
use anyhow::{Context, Result};
use regex::{Regex, RegexBuilder};
use serde::{Deserialize, Serialize};
use std::path::Path;

const CA_ALLOCATION_SECTORS_CSV: &str = include_str!("../data/rules/ca_allocation_sectors.csv");

pub const DEFAULT_SECTOR: &str = "Other";

// ============================================================================
// RULE DEFINITION
// ============================================================================

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SectorRuleDef {
    /// Case-insensitive regular expression searched in the label
    pub pattern: String,

    /// Allocation sector assigned on match
    pub sector: String,
}

#[derive(Debug, Clone)]
pub struct SectorRule {
    pub pattern: String,
    pub sector: String,
    regex: Regex,
}

impl SectorRule {
    pub fn new(pattern: &str, sector: &str) -> Result<Self, HarmonizeError> {
        let regex = RegexBuilder::new(pattern)
            .case_insensitive(true)
            .build()
            .map_err(|e| HarmonizeError::InvalidPattern {
                pattern: pattern.to_string(),
                message: e.to_string(),
            })?;
        Ok(SectorRule {
            pattern: pattern.to_string(),
            sector: sector.to_string(),
            regex,
        })
    }

    pub fn matches(&self, label: &str) -> bool {
        self.regex.is_match(label)
    }
}

// ============================================================================
// RULE SET
// ============================================================================

#[derive(Debug, Clone)]
pub struct SectorRuleSet {
    rules: Vec<SectorRule>,
    default_sector: String,
}

impl SectorRuleSet {
    pub fn new(rules: Vec<SectorRule>, default_sector: impl Into<String>) -> Self {
        SectorRuleSet {
            rules,
            default_sector: default_sector.into(),
        }
    }

    pub fn from_defs(defs: Vec<SectorRuleDef>, default_sector: &str) -> Result<Self> {
        let rules = defs
            .iter()
            .map(|d| SectorRule::new(&d.pattern, &d.sector))
            .collect::<Result<Vec<_>, _>>()?;
        Ok(SectorRuleSet::new(rules, default_sector))
    }

    /// Load `pattern,sector` rules from CSV
    pub fn from_csv_str(content: &str, default_sector: &str) -> Result<Self> {
        let mut reader = csv::ReaderBuilder::new()
            .has_headers(true)
            .trim(csv::Trim::All)
            .from_reader(content.as_bytes());
        let defs = reader
            .deserialize::<SectorRuleDef>()
            .collect::<Result<Vec<_>, _>>()
            .context("Failed to parse sector rules")?;
        Self::from_defs(defs, default_sector)
    }

    pub fn from_csv_path(path: &Path, default_sector: &str) -> Result<Self> {
        if !path.exists() {
            return Err(HarmonizeError::MissingFile(path.to_path_buf()).into());
        }
        let content = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read sector rules: {}", path.display()))?;
        Self::from_csv_str(&content, default_sector)
            .with_context(|| format!("Invalid sector rules in {}", path.display()))
    }

    /// Default CARB allocation-sector rules
    pub fn carb_default() -> Result<Self> {
        Self::from_csv_str(CA_ALLOCATION_SECTORS_CSV, DEFAULT_SECTOR)
    }

    /// Allocation sector for a label; missing labels get the default sector
    pub fn classify(&self, label: Option<&str>) -> String {
        let label = label.unwrap_or("");
        self.rules
            .iter()
            .rev()
            .find(|r| r.matches(label))
            .map(|r| r.sector.clone())
            .unwrap_or_else(|| self.default_sector.clone())
    }

    pub fn rule_count(&self) -> usize {
        self.rules.len()
    }

    pub fn default_sector(&self) -> &str {
        &self.default_sector
    }
}

// ============================================================================
// TESTS
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_carb_rules() {
        let rules = SectorRuleSet::carb_default().unwrap();
        assert_eq!(rules.rule_count(), 4);

        assert_eq!(
            rules.classify(Some("Petroleum Refineries")),
            "Refining and Hydrogen Production"
        );
        assert_eq!(
            rules.classify(Some("Hydrogen Plants")),
            "Refining and Hydrogen Production"
        );
        assert_eq!(rules.classify(Some("CEMENT PLANTS")), "Cement, Lime, Clay, Gypsum");
        assert_eq!(rules.classify(Some("Oil and Gas Extraction")), "Oil and Gas Production");
        assert_eq!(rules.classify(Some("Electricity Importers")), "Other");
        assert_eq!(rules.classify(None), "Other");
    }

    #[test]
    fn test_later_rule_overrides_earlier() {
        let rules = SectorRuleSet::new(
            vec![
                SectorRule::new("refin", "Refining").unwrap(),
                SectorRule::new("production", "Production").unwrap(),
            ],
            "Other",
        );

        // Both patterns match; the later rule decides
        assert_eq!(rules.classify(Some("Refinery production")), "Production");
        assert_eq!(rules.classify(Some("Refinery")), "Refining");
    }

    #[test]
    fn test_invalid_pattern_is_reported() {
        let err = SectorRule::new("cement(", "Cement").unwrap_err();
        match err {
            HarmonizeError::InvalidPattern { pattern, .. } => assert_eq!(pattern, "cement("),
            other => panic!("unexpected error: {other}"),
        }
    }
}
