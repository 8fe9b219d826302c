// 🔀 Concordance Mapper - translate industry codes between taxonomies
//
// Rules are data: each one maps a source-code prefix to a target code. The
// longest matching prefix wins; among equal lengths the rule declared first
// wins. Crosswalk tables ship as versioned CSV files under data/concordance
// and can be replaced at run time without touching code.

use crate::error::HarmonizeError;
use crate::parser::RawTable;
use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::path::Path;

const NAICS_TO_NACE_CSV: &str = include_str!("../data/concordance/naics_to_nace.csv");
const WA_EITE_SUBSECTORS_CSV: &str = include_str!("../data/concordance/wa_eite_subsectors.csv");

pub const NAICS: &str = "NAICS";

// ============================================================================
// RULE DEFINITION
// ============================================================================

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ConcordanceRule {
    /// Taxonomy of the input codes (e.g. "NAICS", "ISIC4")
    pub source_taxonomy: String,

    /// Digit prefix matched against the normalized input code
    pub source_prefix: String,

    /// Harmonized target code (e.g. NACE "24.1")
    pub target_code: String,

    #[serde(default)]
    pub target_description: Option<String>,

    /// Secondary target code (e.g. ISIC Rev.4 division)
    #[serde(default)]
    pub secondary_code: Option<String>,
}

impl ConcordanceRule {
    pub fn new(
        source_taxonomy: &str,
        source_prefix: &str,
        target_code: &str,
        target_description: Option<&str>,
        secondary_code: Option<&str>,
    ) -> Self {
        ConcordanceRule {
            source_taxonomy: source_taxonomy.to_string(),
            source_prefix: source_prefix.to_string(),
            target_code: target_code.to_string(),
            target_description: target_description.map(|s| s.to_string()),
            secondary_code: secondary_code.map(|s| s.to_string()),
        }
    }

    fn applies_to(&self, taxonomy: &str) -> bool {
        self.source_taxonomy.trim().eq_ignore_ascii_case(taxonomy.trim())
    }
}

// ============================================================================
// MATCH RESULT
// ============================================================================

/// Output row of the mapper; all fields absent when nothing matched
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ConcordanceMatch {
    pub target_code: Option<String>,
    pub target_description: Option<String>,
    pub secondary_code: Option<String>,
}

impl ConcordanceMatch {
    pub fn is_match(&self) -> bool {
        self.target_code.is_some()
    }
}

impl From<&ConcordanceRule> for ConcordanceMatch {
    fn from(rule: &ConcordanceRule) -> Self {
        ConcordanceMatch {
            target_code: Some(rule.target_code.clone()),
            target_description: rule.target_description.clone(),
            secondary_code: rule.secondary_code.clone(),
        }
    }
}

/// One row of a mapped code listing (the `map-codes` command output)
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct MappedCode {
    pub source_code: Option<String>,
    pub target_code: Option<String>,
    pub target_description: Option<String>,
    pub secondary_code: Option<String>,
}

// ============================================================================
// CODE NORMALIZATION
// ============================================================================

/// Digit-only form of a raw classification string.
///
/// Leading labels and trailing descriptions are dropped
/// ("NAICS 32411 - Petroleum Refineries" -> "32411"), as is the ".0" that
/// spreadsheet exports append to integer codes ("324110.0" -> "324110").
/// Separators inside the code are ignored ("331-110" -> "331110").
pub fn normalize_code(raw: &str) -> String {
    let Some(start) = raw.find(|c: char| c.is_ascii_digit()) else {
        return String::new();
    };
    // The code part runs up to the first letter of a trailing description
    let rest = &raw[start..];
    let end = rest.find(|c: char| c.is_alphabetic()).unwrap_or(rest.len());
    let code = rest[..end].trim_end_matches(|c: char| !c.is_ascii_digit());

    let code = match code.split_once('.') {
        Some((int_part, frac))
            if int_part.len() >= 3
                && int_part.chars().all(|c| c.is_ascii_digit())
                && frac.chars().all(|c| c == '0') =>
        {
            int_part
        }
        _ => code,
    };

    code.chars().filter(|c| c.is_ascii_digit()).collect()
}

// ============================================================================
// CONCORDANCE
// ============================================================================

#[derive(Debug, Clone)]
pub struct Concordance {
    version: String,
    /// Sorted by prefix length, longest first; ties keep declaration order
    rules: Vec<ConcordanceRule>,
}

impl Concordance {
    pub fn new(version: impl Into<String>, mut rules: Vec<ConcordanceRule>) -> Self {
        // sort_by is stable, which is what keeps first-declared-wins for ties
        rules.sort_by(|a, b| b.source_prefix.len().cmp(&a.source_prefix.len()));
        Concordance {
            version: version.into(),
            rules,
        }
    }

    /// Load rules from a CSV file; the version label defaults to the file stem.
    pub fn from_csv_path(path: &Path, version: Option<&str>) -> Result<Self> {
        if !path.exists() {
            return Err(crate::error::HarmonizeError::MissingFile(path.to_path_buf()).into());
        }
        let content = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read concordance file: {}", path.display()))?;
        let version = version.map(|v| v.to_string()).unwrap_or_else(|| {
            path.file_stem()
                .and_then(|s| s.to_str())
                .unwrap_or("custom")
                .to_string()
        });
        Self::from_csv_str(&version, &content)
            .with_context(|| format!("Failed to parse concordance file: {}", path.display()))
    }

    pub fn from_csv_str(version: &str, content: &str) -> Result<Self> {
        let mut reader = csv::ReaderBuilder::new()
            .has_headers(true)
            .trim(csv::Trim::All)
            .from_reader(content.as_bytes());

        let mut rules = Vec::new();
        for (line_num, result) in reader.deserialize::<ConcordanceRule>().enumerate() {
            let mut rule = result
                .with_context(|| format!("Invalid concordance rule on line {}", line_num + 2))?;
            rule.source_prefix = normalize_code(&rule.source_prefix);
            if rule.source_prefix.is_empty() {
                anyhow::bail!("Concordance rule on line {} has no digit prefix", line_num + 2);
            }
            rule.target_description = rule.target_description.filter(|s| !s.is_empty());
            rule.secondary_code = rule.secondary_code.filter(|s| !s.is_empty());
            rules.push(rule);
        }
        Ok(Concordance::new(version, rules))
    }

    /// First-pass NAICS -> NACE Rev.2 / ISIC Rev.4 crosswalk for ETS-heavy sectors
    pub fn naics_default() -> Result<Self> {
        Self::from_csv_str("naics-nace-first-pass-v1", NAICS_TO_NACE_CSV)
    }

    /// NAICS -> Washington EITE allocation subsectors
    pub fn wa_subsectors_default() -> Result<Self> {
        Self::from_csv_str("wa-eite-subsectors-2023", WA_EITE_SUBSECTORS_CSV)
    }

    pub fn version(&self) -> &str {
        &self.version
    }

    pub fn rule_count(&self) -> usize {
        self.rules.len()
    }

    pub fn rules(&self) -> &[ConcordanceRule] {
        &self.rules
    }

    /// Best rule for a single raw code, if any
    pub fn lookup(&self, raw_code: &str, taxonomy: &str) -> Option<&ConcordanceRule> {
        let code = normalize_code(raw_code);
        if code.is_empty() {
            return None;
        }
        self.rules
            .iter()
            .filter(|r| r.applies_to(taxonomy))
            .find(|r| code.starts_with(&r.source_prefix))
    }

    /// Map a sequence of raw codes; output is row-aligned with the input.
    pub fn map<I, S>(&self, codes: I, taxonomy: &str) -> Vec<ConcordanceMatch>
    where
        I: IntoIterator<Item = Option<S>>,
        S: AsRef<str>,
    {
        codes
            .into_iter()
            .map(|code| match code {
                Some(code) => self
                    .lookup(code.as_ref(), taxonomy)
                    .map(ConcordanceMatch::from)
                    .unwrap_or_default(),
                None => ConcordanceMatch::default(),
            })
            .collect()
    }

    /// Map one column of a table, keeping the raw code next to its match
    pub fn map_column(
        &self,
        table: &RawTable,
        column: &str,
        taxonomy: &str,
    ) -> Result<Vec<MappedCode>, HarmonizeError> {
        let col = table.require(&[column])?[0];
        let codes: Vec<Option<String>> = (0..table.len()).map(|row| table.text(row, Some(col))).collect();
        let matches = self.map(codes.iter().map(|c| c.as_deref()), taxonomy);

        Ok(codes
            .into_iter()
            .zip(matches)
            .map(|(source_code, m)| MappedCode {
                source_code,
                target_code: m.target_code,
                target_description: m.target_description,
                secondary_code: m.secondary_code,
            })
            .collect())
    }
}

// ============================================================================
// TESTS
// ============================================================================
