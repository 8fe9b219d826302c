// 💾 Output - CSV writers and the JSON run manifest
//
// Every written file is hashed into the manifest so a downstream analysis can
// prove which run produced the tables it read.

use crate::data_quality::QualityReport;
use crate::reconciliation::ConservationSummary;
use crate::schema::FacilityYear;
use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

fn create_parent(path: &Path) -> Result<()> {
    if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
        std::fs::create_dir_all(parent)
            .with_context(|| format!("Failed to create output directory: {}", parent.display()))?;
    }
    Ok(())
}

/// Write rows as CSV. `headers` is written on its own when there are no rows,
/// so an empty result still carries the column contract.
pub fn write_csv<T: Serialize>(path: &Path, rows: &[T], headers: &[&str]) -> Result<usize> {
    create_parent(path)?;
    let mut writer = csv::Writer::from_path(path)
        .with_context(|| format!("Failed to create CSV file: {}", path.display()))?;

    if rows.is_empty() {
        writer.write_record(headers)?;
    }
    for row in rows {
        writer
            .serialize(row)
            .with_context(|| format!("Failed to write row to {}", path.display()))?;
    }
    writer
        .flush()
        .with_context(|| format!("Failed to flush CSV file: {}", path.display()))?;
    Ok(rows.len())
}

/// Read a facility-year CSV previously written by `write_csv`
pub fn read_facility_csv(path: &Path) -> Result<Vec<FacilityYear>> {
    if !path.exists() {
        return Err(crate::error::HarmonizeError::MissingFile(path.to_path_buf()).into());
    }
    let mut reader = csv::Reader::from_path(path)
        .with_context(|| format!("Failed to open CSV file: {}", path.display()))?;

    let mut rows = Vec::new();
    for (line_num, result) in reader.deserialize::<FacilityYear>().enumerate() {
        let row = result.with_context(|| {
            format!("Invalid facility row on line {} of {}", line_num + 2, path.display())
        })?;
        rows.push(row);
    }
    Ok(rows)
}

/// Hex SHA-256 of a file's bytes
pub fn sha256_file(path: &Path) -> Result<String> {
    let bytes = std::fs::read(path)
        .with_context(|| format!("Failed to read file for hashing: {}", path.display()))?;
    let mut hasher = Sha256::new();
    hasher.update(&bytes);
    Ok(format!("{:x}", hasher.finalize()))
}

// ============================================================================
// MANIFEST
// ============================================================================

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OutputFile {
    pub path: PathBuf,
    pub rows: usize,
    pub sha256: String,
}

impl OutputFile {
    /// Describe a file that has just been written
    pub fn describe(path: &Path, rows: usize) -> Result<Self> {
        Ok(OutputFile {
            path: path.to_path_buf(),
            rows,
            sha256: sha256_file(path)?,
        })
    }
}

/// Provenance record for one pipeline run
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Manifest {
    pub run_id: String,
    pub generated_at: DateTime<Utc>,
    pub tool_version: String,
    pub hybrid_alpha: f64,
    pub counterfactual_alpha: f64,
    pub concordance_version: String,
    /// Facility rows per system code
    pub systems: BTreeMap<String, usize>,
    pub conservation: ConservationSummary,
    pub quality: QualityReport,
    pub outputs: Vec<OutputFile>,
}

impl Manifest {
    pub fn new(hybrid_alpha: f64, counterfactual_alpha: f64, concordance_version: impl Into<String>) -> Self {
        Manifest {
            run_id: uuid::Uuid::new_v4().to_string(),
            generated_at: Utc::now(),
            tool_version: crate::VERSION.to_string(),
            hybrid_alpha,
            counterfactual_alpha,
            concordance_version: concordance_version.into(),
            systems: BTreeMap::new(),
            conservation: ConservationSummary::default(),
            quality: QualityReport::default(),
            outputs: Vec::new(),
        }
    }

    pub fn write(&self, path: &Path) -> Result<()> {
        create_parent(path)?;
        let json = serde_json::to_string_pretty(self).context("Failed to serialize run manifest")?;
        std::fs::write(path, json)
            .with_context(|| format!("Failed to write manifest: {}", path.display()))?;
        Ok(())
    }
}

// ============================================================================
// TESTS
// ============================================================================
