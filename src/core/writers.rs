//! CSV writers for the derived tables.
//!
//! Every table is written through the `csv` crate with a header row:
//! - per-subject and combined analysis tables
//! - linear trend tables (`parameter,slope,intercept`)
//! - metric/value summaries
//! - any other `Serialize` row type via [`write_records`]

use std::fs::{self, File};
use std::io::BufWriter;
use std::path::Path;

use serde::Serialize;
use thiserror::Error;

use super::loaders::AnalysisRecord;
use super::stats::LinearTrend;

/// Errors that can occur during write operations.
#[derive(Error, Debug)]
pub enum WriteError {
    /// Failed to create parent directories.
    #[error("failed to create parent directories for '{path}': {source}")]
    CreateDirectory {
        path: String,
        #[source]
        source: std::io::Error,
    },

    /// Failed to create or open file for writing.
    #[error("failed to create file '{path}': {source}")]
    CreateFile {
        path: String,
        #[source]
        source: std::io::Error,
    },

    /// Failed to write data to file.
    #[error("failed to write to file '{path}': {source}")]
    WriteFile {
        path: String,
        #[source]
        source: std::io::Error,
    },

    /// CSV writing error.
    #[error("CSV write error for '{path}': {source}")]
    CsvError {
        path: String,
        #[source]
        source: csv::Error,
    },

    /// Nothing to write.
    #[error("no rows to write to '{0}'")]
    NoRows(String),
}

/// Result type for write operations.
pub type Result<T> = std::result::Result<T, WriteError>;

/// One row of a trend table.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct TrendRow {
    pub parameter: String,
    pub slope: f64,
    pub intercept: f64,
}

impl TrendRow {
    pub fn new(parameter: impl Into<String>, trend: LinearTrend) -> Self {
        Self {
            parameter: parameter.into(),
            slope: trend.slope,
            intercept: trend.intercept,
        }
    }
}

/// One row of a metric summary.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct MetricRow {
    pub metric: String,
    pub value: f64,
}

/// Creates parent directories for a file path if they don't exist.
fn ensure_parent_dirs(path: &Path) -> Result<()> {
    if let Some(parent) = path.parent() {
        if !parent.as_os_str().is_empty() && !parent.exists() {
            fs::create_dir_all(parent).map_err(|e| WriteError::CreateDirectory {
                path: parent.display().to_string(),
                source: e,
            })?;
        }
    }
    Ok(())
}

/// Write serializable rows to a CSV file with a header.
///
/// Column names come from the row type's field names (or serde renames).
///
/// # Errors
///
/// Returns an error if `rows` is empty, if parent directories cannot be
/// created, or if the file cannot be written.
pub fn write_records<T: Serialize>(path: &Path, rows: &[T]) -> Result<()> {
    let path_str = path.display().to_string();
    if rows.is_empty() {
        return Err(WriteError::NoRows(path_str));
    }

    ensure_parent_dirs(path)?;

    let file = File::create(path).map_err(|e| WriteError::CreateFile {
        path: path_str.clone(),
        source: e,
    })?;
    let mut csv_writer = csv::Writer::from_writer(BufWriter::new(file));

    for row in rows {
        csv_writer.serialize(row).map_err(|e| WriteError::CsvError {
            path: path_str.clone(),
            source: e,
        })?;
    }

    csv_writer.flush().map_err(|e| WriteError::WriteFile {
        path: path_str,
        source: e,
    })?;

    Ok(())
}

/// Write analysis records (per-subject or combined).
///
/// The `Dataset` column is emitted only when the records carry a dataset,
/// so all records of one table must agree on it.
pub fn write_analysis_csv(path: &Path, records: &[AnalysisRecord]) -> Result<()> {
    write_records(path, records)
}

/// Write a `parameter,slope,intercept` table.
pub fn write_trends_csv(path: &Path, rows: &[TrendRow]) -> Result<()> {
    write_records(path, rows)
}

/// Write a `metric,value` table.
pub fn write_metrics_csv(path: &Path, metrics: &[(&str, f64)]) -> Result<()> {
    let rows: Vec<MetricRow> = metrics
        .iter()
        .map(|(name, value)| MetricRow {
            metric: name.to_string(),
            value: *value,
        })
        .collect();
    write_records(path, &rows)
}
