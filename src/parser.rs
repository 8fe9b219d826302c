// 🏗️ Raw Table Loading - parsed row/column tables for the harmonizers
//
// Upstream adapters (spreadsheet exporters, PDF table extraction) hand us
// plain CSV. Everything a harmonizer reads goes through RawTable so column
// lookup, missing-cell handling and number parsing behave the same for every
// registry.

use crate::error::HarmonizeError;
use anyhow::{Context, Result};
use csv::ReaderBuilder;
use std::collections::HashMap;
use std::fs::File;
use std::io::Read;
use std::path::{Path, PathBuf};
use tracing::{debug, warn};

// ============================================================================
// RAW TABLE
// ============================================================================

/// A fully materialized table of string cells with a header row.
#[derive(Debug, Clone)]
pub struct RawTable {
    /// Name used in error messages (usually the file name)
    pub name: String,
    headers: Vec<String>,
    index: HashMap<String, usize>,
    rows: Vec<Vec<String>>,
}

/// Column names are compared after collapsing whitespace and lowercasing,
/// so "Report\nYear" and "report year" are the same column.
pub fn normalize_header(header: &str) -> String {
    header
        .trim_start_matches('\u{feff}')
        .split_whitespace()
        .collect::<Vec<_>>()
        .join(" ")
        .to_lowercase()
}

impl RawTable {
    pub fn new(name: impl Into<String>, headers: Vec<String>, rows: Vec<Vec<String>>) -> Self {
        let mut index = HashMap::new();
        for (i, h) in headers.iter().enumerate() {
            // First occurrence wins for repeated headers
            index.entry(normalize_header(h)).or_insert(i);
        }
        RawTable {
            name: name.into(),
            headers,
            index,
            rows,
        }
    }

    /// Load a CSV file with a header row.
    pub fn from_csv_path(path: &Path) -> Result<Self> {
        if !path.exists() {
            return Err(HarmonizeError::MissingFile(path.to_path_buf()).into());
        }
        let file = File::open(path)
            .with_context(|| format!("Failed to open file: {}", path.display()))?;
        let name = path
            .file_name()
            .and_then(|n| n.to_str())
            .unwrap_or("unknown.csv")
            .to_string();
        Self::from_reader(name, file)
    }

    /// Load CSV content from any reader (used for in-memory tables in tests).
    pub fn from_reader<R: Read>(name: impl Into<String>, reader: R) -> Result<Self> {
        let name = name.into();
        let mut reader = ReaderBuilder::new()
            .has_headers(true)
            .flexible(true)
            .from_reader(reader);

        let headers: Vec<String> = reader
            .headers()
            .with_context(|| format!("Failed to read header row of {}", name))?
            .iter()
            .map(|h| h.trim_start_matches('\u{feff}').trim().to_string())
            .collect();

        let mut rows = Vec::new();
        for (line_num, result) in reader.records().enumerate() {
            let record = result.with_context(|| {
                format!("Failed to parse CSV line {} in {}", line_num + 2, name)
            })?;
            let mut row: Vec<String> = record.iter().map(|c| c.to_string()).collect();
            row.resize(headers.len(), String::new());
            rows.push(row);
        }

        debug!(table = %name, rows = rows.len(), "loaded table");
        Ok(RawTable::new(name, headers, rows))
    }

    pub fn from_csv_str(name: &str, content: &str) -> Result<Self> {
        Self::from_reader(name, content.as_bytes())
    }

    pub fn len(&self) -> usize {
        self.rows.len()
    }

    pub fn is_empty(&self) -> bool {
        self.rows.is_empty()
    }

    pub fn headers(&self) -> &[String] {
        &self.headers
    }

    /// Position of a column, if present
    pub fn column(&self, name: &str) -> Option<usize> {
        self.index.get(&normalize_header(name)).copied()
    }

    /// First present column among several candidate names
    pub fn column_any(&self, names: &[&str]) -> Option<usize> {
        names.iter().find_map(|n| self.column(n))
    }

    /// Positions of required columns; fails naming every absent one.
    pub fn require(&self, names: &[&str]) -> Result<Vec<usize>, HarmonizeError> {
        let missing: Vec<&str> = names
            .iter()
            .copied()
            .filter(|n| self.column(n).is_none())
            .collect();
        if !missing.is_empty() {
            return Err(HarmonizeError::missing_columns(self.name.clone(), &missing));
        }
        Ok(names.iter().filter_map(|n| self.column(n)).collect())
    }

    /// Cell content, or None for blank and declared-missing markers
    pub fn get(&self, row: usize, col: Option<usize>) -> Option<&str> {
        let value = self.rows.get(row)?.get(col?)?.trim();
        if is_missing_marker(value) {
            None
        } else {
            Some(value)
        }
    }

    pub fn text(&self, row: usize, col: Option<usize>) -> Option<String> {
        self.get(row, col).map(|s| s.to_string())
    }

    pub fn number(&self, row: usize, col: Option<usize>) -> Option<f64> {
        self.get(row, col).and_then(parse_number)
    }

    pub fn year(&self, row: usize, col: Option<usize>) -> Option<i32> {
        self.get(row, col).and_then(parse_year)
    }
}

// ============================================================================
// CELL PARSING
// ============================================================================

fn is_missing_marker(value: &str) -> bool {
    value.is_empty()
        || value.eq_ignore_ascii_case("nan")
        || value.eq_ignore_ascii_case("na")
        || value.eq_ignore_ascii_case("n/a")
        || value.eq_ignore_ascii_case("none")
        || value.eq_ignore_ascii_case("null")
}

/// Parse a published number: thousands separators and surrounding spaces are
/// tolerated, anything else unparseable is missing.
pub fn parse_number(raw: &str) -> Option<f64> {
    let cleaned: String = raw
        .trim()
        .chars()
        .filter(|c| *c != ',' && !c.is_whitespace())
        .collect();
    if is_missing_marker(&cleaned) {
        return None;
    }
    cleaned.parse::<f64>().ok().filter(|v| v.is_finite())
}

/// Parse an integer year that may have been exported as a float ("2023.0").
pub fn parse_year(raw: &str) -> Option<i32> {
    let value = parse_number(raw)?;
    if value.fract() != 0.0 || !(1900.0..=2200.0).contains(&value) {
        return None;
    }
    Some(value as i32)
}

// ============================================================================
// BATCH READING
// ============================================================================

/// Files in `dir` with the given extension (case-insensitive), sorted by name.
pub fn discover_files(dir: &Path, extension: &str) -> Result<Vec<PathBuf>> {
    if !dir.is_dir() {
        return Err(HarmonizeError::MissingFile(dir.to_path_buf()).into());
    }
    let mut files: Vec<PathBuf> = std::fs::read_dir(dir)
        .with_context(|| format!("Failed to list directory: {}", dir.display()))?
        .filter_map(|entry| entry.ok().map(|e| e.path()))
        .filter(|p| {
            p.is_file()
                && p.extension()
                    .and_then(|e| e.to_str())
                    .map(|e| e.eq_ignore_ascii_case(extension))
                    .unwrap_or(false)
        })
        .collect();
    files.sort();
    Ok(files)
}

/// Parse every file in a directory, skipping the ones that fail.
///
/// Individual failures are logged and skipped; the batch fails only when
/// nothing at all could be parsed.
pub fn read_batch<T, F>(dir: &Path, extension: &str, mut parse: F) -> Result<Vec<(PathBuf, T)>>
where
    F: FnMut(&Path) -> Result<T>,
{
    let files = discover_files(dir, extension)?;
    let mut parsed = Vec::new();
    let mut failed: Vec<(String, String)> = Vec::new();

    for file in files {
        match parse(&file) {
            Ok(value) => parsed.push((file, value)),
            Err(e) => {
                let name = file.display().to_string();
                warn!(file = %name, error = %e, "skipping file that could not be parsed");
                failed.push((name, format!("{:#}", e)));
            }
        }
    }

    if parsed.is_empty() {
        let last_error = failed
            .last()
            .map(|(f, e)| format!("{}: {}", f, e))
            .unwrap_or_else(|| format!("no .{} files", extension));
        return Err(HarmonizeError::NoParseableFiles {
            dir: dir.to_path_buf(),
            last_error,
        }
        .into());
    }

    if !failed.is_empty() {
        warn!(
            skipped = failed.len(),
            example = %failed[0].0,
            "some files in the batch were skipped"
        );
    }

    Ok(parsed)
}

// ============================================================================
// TESTS
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn test_column_lookup_is_whitespace_and_case_insensitive() {
        let table = RawTable::from_csv_str(
            "mrr.csv",
            "ARB ID,\"Report\nYear\",Facility Name\n101,2022,Plant A\n",
        )
        .unwrap();

        assert_eq!(table.column("arb id"), Some(0));
        assert_eq!(table.column("Report Year"), Some(1));
        assert_eq!(table.column_any(&["Year", "report year"]), Some(1));
        assert_eq!(table.column("naics"), None);
    }

    #[test]
    fn test_require_reports_all_missing_columns() {
        let table = RawTable::from_csv_str("t.csv", "a,b\n1,2\n").unwrap();
        let err = table.require(&["a", "year", "verified"]).unwrap_err();

        match err {
            HarmonizeError::MissingColumns { table, columns } => {
                assert_eq!(table, "t.csv");
                assert_eq!(columns, vec!["year".to_string(), "verified".to_string()]);
            }
            other => panic!("unexpected error: {other}"),
        }
    }

    #[test]
    fn test_missing_markers_and_numbers() {
        let table = RawTable::from_csv_str(
            "t.csv",
            "name,value,year\nA,\"1,250.5\",2023.0\nB,nan,\nC,,n/a\n",
        )
        .unwrap();

        assert_eq!(table.number(0, Some(1)), Some(1250.5));
        assert_eq!(table.year(0, Some(2)), Some(2023));
        assert_eq!(table.number(1, Some(1)), None);
        assert_eq!(table.year(1, Some(2)), None);
        assert_eq!(table.get(2, Some(1)), None);
        assert_eq!(table.get(2, Some(2)), None);
        assert_eq!(table.text(2, Some(0)), Some("C".to_string()));
        assert_eq!(table.get(0, None), None);
    }

    #[test]
    fn test_parse_number_rejects_garbage() {
        assert_eq!(parse_number(" 42 "), Some(42.0));
        assert_eq!(parse_number("-3.5"), Some(-3.5));
        assert_eq!(parse_number("abc"), None);
        assert_eq!(parse_number("inf"), None);
        assert_eq!(parse_year("2023.5"), None);
    }

    #[test]
    fn test_short_rows_are_padded() {
        let table = RawTable::from_csv_str("t.csv", "a,b,c\n1,2\n").unwrap();
        assert_eq!(table.len(), 1);
        assert_eq!(table.get(0, Some(2)), None);
    }

    #[test]
    fn test_missing_file_is_configuration_error() {
        let err = RawTable::from_csv_path(Path::new("/definitely/not/here.csv")).unwrap_err();
        let typed = err.downcast_ref::<HarmonizeError>().unwrap();
        assert!(matches!(typed, HarmonizeError::MissingFile(_)));
    }

    #[test]
    fn test_read_batch_skips_bad_files() {
        let dir = tempfile::tempdir().unwrap();
        let mut good = File::create(dir.path().join("2022.csv")).unwrap();
        writeln!(good, "arb_id,value\n1,2").unwrap();
        let mut bad = File::create(dir.path().join("2023.csv")).unwrap();
        writeln!(bad, "other\nx").unwrap();

        let parsed = read_batch(dir.path(), "csv", |p| {
            let table = RawTable::from_csv_path(p)?;
            table.require(&["arb_id"])?;
            Ok(table.len())
        })
        .unwrap();

        assert_eq!(parsed.len(), 1);
        assert!(parsed[0].0.ends_with("2022.csv"));
        println!("✅ Batch read skipped the unparseable file");
    }

    #[test]
    fn test_read_batch_fails_when_nothing_parses() {
        let dir = tempfile::tempdir().unwrap();
        let mut bad = File::create(dir.path().join("2023.csv")).unwrap();
        writeln!(bad, "other\nx").unwrap();

        let err = read_batch(dir.path(), "csv", |p| {
            let table = RawTable::from_csv_path(p)?;
            table.require(&["arb_id"])?;
            Ok(())
        })
        .unwrap_err();

        let typed = err.downcast_ref::<HarmonizeError>().unwrap();
        assert!(matches!(typed, HarmonizeError::NoParseableFiles { .. }));
        assert!(err.to_string().contains("arb_id"));
    }
}
