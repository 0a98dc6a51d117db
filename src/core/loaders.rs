//! Loaders for the tabular files produced and consumed by the pipeline.
//!
//! This module provides parsers for:
//! - Motion parameter tables written by the registration tool
//! - Framewise displacement tables
//! - JSON scan sidecars (repetition time, echo time)
//! - Per-subject analysis rows and their combined cross-subject table
//! - Scan lists pairing image files with receiver gain values

use std::collections::HashMap;
use std::fs::File;
use std::io::BufReader;
use std::path::{Path, PathBuf};

use csv::ReaderBuilder;
use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Errors that can occur during file loading.
#[derive(Error, Debug)]
pub enum LoaderError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("CSV parsing error: {0}")]
    Csv(#[from] csv::Error),

    #[error("JSON parsing error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("Empty file: {0}")]
    EmptyFile(PathBuf),

    #[error("Missing required columns: {0}")]
    MissingColumns(String),

    #[error("Parse error: {0}")]
    ParseError(String),
}

/// Result type for loader operations.
pub type Result<T> = std::result::Result<T, LoaderError>;

/// The six rigid-body parameters, in table order.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum MotionAxis {
    RotationX,
    RotationY,
    RotationZ,
    TranslationX,
    TranslationY,
    TranslationZ,
}

impl MotionAxis {
    /// All axes in column order.
    pub const ALL: [MotionAxis; 6] = [
        MotionAxis::RotationX,
        MotionAxis::RotationY,
        MotionAxis::RotationZ,
        MotionAxis::TranslationX,
        MotionAxis::TranslationY,
        MotionAxis::TranslationZ,
    ];

    /// Column index inside a motion parameter row.
    #[inline]
    pub fn index(self) -> usize {
        self as usize
    }

    /// Human readable name, e.g. "Rotation X".
    pub fn label(self) -> &'static str {
        match self {
            MotionAxis::RotationX => "Rotation X",
            MotionAxis::RotationY => "Rotation Y",
            MotionAxis::RotationZ => "Rotation Z",
            MotionAxis::TranslationX => "Translation X",
            MotionAxis::TranslationY => "Translation Y",
            MotionAxis::TranslationZ => "Translation Z",
        }
    }

    /// True for the three rotation axes.
    pub fn is_rotation(self) -> bool {
        self.index() < 3
    }
}

/// Per-frame rigid motion relative to the reference frame.
///
/// Each row holds rotations X/Y/Z (radians) followed by translations
/// X/Y/Z (mm).
#[derive(Debug, Clone, Default, PartialEq)]
pub struct MotionParameters {
    pub frames: Vec<[f64; 6]>,
}

impl MotionParameters {
    /// Number of frames.
    #[inline]
    pub fn len(&self) -> usize {
        self.frames.len()
    }

    /// Returns true if no frame was loaded.
    #[inline]
    pub fn is_empty(&self) -> bool {
        self.frames.is_empty()
    }

    /// Values of one parameter across all frames.
    pub fn series(&self, axis: MotionAxis) -> Vec<f64> {
        self.frames.iter().map(|row| row[axis.index()]).collect()
    }
}

/// Scan timing read from a BIDS JSON sidecar.
#[derive(Debug, Clone, Default, PartialEq, Deserialize)]
pub struct ScanSidecar {
    #[serde(rename = "RepetitionTime", default)]
    pub repetition_time: Option<f64>,

    #[serde(rename = "EchoTime", default)]
    pub echo_time: Option<f64>,
}

/// One subject's row of quality metrics.
///
/// Serialized with the exact column names of the per-subject and combined
/// tables; `dataset` is only present in the combined table.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AnalysisRecord {
    #[serde(rename = "Subject ID")]
    pub subject_id: String,

    #[serde(rename = "Pixel Volume (mm^3)")]
    pub voxel_volume: f64,

    #[serde(rename = "Repetition Time (s)")]
    pub repetition_time: f64,

    #[serde(rename = "Echo Time (s)")]
    pub echo_time: Option<f64>,

    #[serde(rename = "Drift Rotation X")]
    pub drift_rotation_x: f64,

    #[serde(rename = "Drift Rotation Y")]
    pub drift_rotation_y: f64,

    #[serde(rename = "Drift Rotation Z")]
    pub drift_rotation_z: f64,

    #[serde(rename = "Drift Translation X")]
    pub drift_translation_x: f64,

    #[serde(rename = "Drift Translation Y")]
    pub drift_translation_y: f64,

    #[serde(rename = "Drift Translation Z")]
    pub drift_translation_z: f64,

    #[serde(rename = "Drift Framewise")]
    pub drift_framewise: f64,

    #[serde(rename = "Framewise Displacement STD")]
    pub framewise_std: f64,

    #[serde(rename = "Mean of STD Difference")]
    pub mean_std_difference: f64,

    #[serde(rename = "Algorithm Version")]
    pub algorithm_version: String,

    #[serde(rename = "Dataset", default, skip_serializing_if = "Option::is_none")]
    pub dataset: Option<String>,
}

impl AnalysisRecord {
    /// The three rotation drift slopes.
    pub fn rotation_drifts(&self) -> [f64; 3] {
        [
            self.drift_rotation_x,
            self.drift_rotation_y,
            self.drift_rotation_z,
        ]
    }

    /// The three translation drift slopes.
    pub fn translation_drifts(&self) -> [f64; 3] {
        [
            self.drift_translation_x,
            self.drift_translation_y,
            self.drift_translation_z,
        ]
    }
}

/// An image file and the receiver gain it was acquired with.
#[derive(Debug, Clone, PartialEq, Deserialize)]
pub struct ScanListEntry {
    pub file_name: PathBuf,
    pub rg_value: f64,
}

fn open_csv(path: &Path) -> Result<csv::Reader<BufReader<File>>> {
    let file = File::open(path)?;
    Ok(ReaderBuilder::new()
        .has_headers(true)
        .flexible(true)
        .trim(csv::Trim::All)
        .from_reader(BufReader::new(file)))
}

fn parse_field(value: Option<&str>, what: &str, row: usize) -> Result<f64> {
    let raw = value.ok_or_else(|| LoaderError::ParseError(format!("row {}: missing {}", row, what)))?;
    raw.parse::<f64>()
        .map_err(|_| LoaderError::ParseError(format!("row {}: invalid {} value '{}'", row, what, raw)))
}

/// Load the motion parameter table written by the registration tool.
///
/// Columns named `MOCOparam0` .. `MOCOparam5` are used when the header has
/// them; otherwise the last six columns of every row are taken as
/// rotation X/Y/Z followed by translation X/Y/Z.
///
/// # Errors
///
/// Returns an error if the file cannot be read, has fewer than six columns,
/// contains non-numeric values or has no data rows.
pub fn load_motion_parameters<P: AsRef<Path>>(path: P) -> Result<MotionParameters> {
    let path = path.as_ref();
    let mut reader = open_csv(path)?;

    let headers = reader.headers()?.clone();
    let col_map: HashMap<&str, usize> = headers
        .iter()
        .enumerate()
        .map(|(i, name)| (name, i))
        .collect();

    let named: Option<Vec<usize>> = (0..6)
        .map(|i| col_map.get(format!("MOCOparam{}", i).as_str()).copied())
        .collect();

    let columns: Vec<usize> = match named {
        Some(cols) => cols,
        None => {
            if headers.len() < 6 {
                return Err(LoaderError::MissingColumns(format!(
                    "{} has {} columns, need 6 motion parameters",
                    path.display(),
                    headers.len()
                )));
            }
            (headers.len() - 6..headers.len()).collect()
        }
    };

    let mut params = MotionParameters {
        frames: Vec::with_capacity(512),
    };

    for (row_idx, result) in reader.records().enumerate() {
        let record = result?;
        if record.iter().all(|f| f.is_empty()) {
            continue;
        }

        let mut row = [0.0f64; 6];
        for (slot, &col) in row.iter_mut().zip(columns.iter()) {
            *slot = parse_field(record.get(col), "motion parameter", row_idx + 1)?;
        }
        params.frames.push(row);
    }

    if params.is_empty() {
        return Err(LoaderError::EmptyFile(path.to_path_buf()));
    }

    Ok(params)
}

/// Load a framewise displacement table.
///
/// Uses the column named `Mean` (case-insensitive) when present, otherwise
/// the first column.
pub fn load_framewise_displacement<P: AsRef<Path>>(path: P) -> Result<Vec<f64>> {
    let path = path.as_ref();
    let mut reader = open_csv(path)?;

    let col = reader
        .headers()?
        .iter()
        .position(|h| h.eq_ignore_ascii_case("mean"))
        .unwrap_or(0);

    let mut values = Vec::with_capacity(512);
    for (row_idx, result) in reader.records().enumerate() {
        let record = result?;
        if record.iter().all(|f| f.is_empty()) {
            continue;
        }
        values.push(parse_field(record.get(col), "framewise displacement", row_idx + 1)?);
    }

    if values.is_empty() {
        return Err(LoaderError::EmptyFile(path.to_path_buf()));
    }

    Ok(values)
}

/// Load the repetition and echo time from a JSON scan sidecar.
pub fn load_scan_sidecar<P: AsRef<Path>>(path: P) -> Result<ScanSidecar> {
    let file = File::open(path.as_ref())?;
    let sidecar = serde_json::from_reader(BufReader::new(file))?;
    Ok(sidecar)
}

/// Load the first data row of a per-subject analysis table.
pub fn load_analysis_row<P: AsRef<Path>>(path: P) -> Result<AnalysisRecord> {
    let path = path.as_ref();
    let mut reader = open_csv(path)?;

    match reader.deserialize::<AnalysisRecord>().next() {
        Some(record) => Ok(record?),
        None => Err(LoaderError::EmptyFile(path.to_path_buf())),
    }
}

/// Load every row of a combined analysis table.
pub fn load_analysis_table<P: AsRef<Path>>(path: P) -> Result<Vec<AnalysisRecord>> {
    let path = path.as_ref();
    let mut reader = open_csv(path)?;

    let records = reader
        .deserialize::<AnalysisRecord>()
        .collect::<std::result::Result<Vec<_>, _>>()?;

    if records.is_empty() {
        return Err(LoaderError::EmptyFile(path.to_path_buf()));
    }

    Ok(records)
}

/// Load a `file_name,rg_value` scan list.
///
/// Relative file names are resolved against the list's directory.
pub fn load_scan_list<P: AsRef<Path>>(path: P) -> Result<Vec<ScanListEntry>> {
    let path = path.as_ref();
    let base = path.parent().unwrap_or_else(|| Path::new(""));
    let mut reader = open_csv(path)?;

    let mut entries = Vec::new();
    for result in reader.deserialize::<ScanListEntry>() {
        let mut entry = result?;
        if entry.file_name.is_relative() {
            entry.file_name = base.join(&entry.file_name);
        }
        entries.push(entry);
    }

    if entries.is_empty() {
        return Err(LoaderError::EmptyFile(path.to_path_buf()));
    }

    Ok(entries)
}

/// Load a headerless time × voxel matrix, one frame per row.
///
/// All rows must have the same number of values.
pub fn load_series_matrix<P: AsRef<Path>>(path: P) -> Result<Vec<Vec<f32>>> {
    let path = path.as_ref();
    let file = File::open(path)?;
    let mut reader = ReaderBuilder::new()
        .has_headers(false)
        .trim(csv::Trim::All)
        .from_reader(BufReader::new(file));

    let mut rows: Vec<Vec<f32>> = Vec::new();
    for (row_idx, result) in reader.records().enumerate() {
        let record = result?;
        let row = record
            .iter()
            .map(|v| {
                v.parse::<f32>().map_err(|_| {
                    LoaderError::ParseError(format!("row {}: invalid value '{}'", row_idx + 1, v))
                })
            })
            .collect::<Result<Vec<f32>>>()?;
        rows.push(row);
    }

    if rows.is_empty() {
        return Err(LoaderError::EmptyFile(path.to_path_buf()));
    }

    Ok(rows)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;
    use tempfile::NamedTempFile;

    fn write_temp(lines: &[&str]) -> NamedTempFile {
        let mut file = NamedTempFile::new().unwrap();
        for line in lines {
            writeln!(file, "{}", line).unwrap();
        }
        file.flush().unwrap();
        file
    }

    #[test]
    fn test_load_motion_parameters_named_columns() -> Result<()> {
        let file = write_temp(&[
            "MetricPre,MetricPost,MOCOparam0,MOCOparam1,MOCOparam2,MOCOparam3,MOCOparam4,MOCOparam5",
            "-0.5,-0.6,0.001,0.002,0.003,0.1,0.2,0.3",
            "-0.5,-0.7,0.004,0.005,0.006,0.4,0.5,0.6",
        ]);

        let params = load_motion_parameters(file.path())?;
        assert_eq!(params.len(), 2);
        assert_eq!(params.frames[0], [0.001, 0.002, 0.003, 0.1, 0.2, 0.3]);
        assert_eq!(params.series(MotionAxis::TranslationZ), vec![0.3, 0.6]);

        Ok(())
    }

    #[test]
    fn test_load_motion_parameters_trailing_columns() -> Result<()> {
        let file = write_temp(&[
            "frame,a,b,c,d,e,f",
            "0,1,2,3,4,5,6",
        ]);

        let params = load_motion_parameters(file.path())?;
        assert_eq!(params.frames[0], [1.0, 2.0, 3.0, 4.0, 5.0, 6.0]);

        Ok(())
    }

    #[test]
    fn test_load_motion_parameters_errors() {
        let narrow = write_temp(&["a,b,c", "1,2,3"]);
        assert!(matches!(
            load_motion_parameters(narrow.path()),
            Err(LoaderError::MissingColumns(_))
        ));

        let empty = write_temp(&["a,b,c,d,e,f"]);
        assert!(matches!(
            load_motion_parameters(empty.path()),
            Err(LoaderError::EmptyFile(_))
        ));

        let garbage = write_temp(&["a,b,c,d,e,f", "1,2,x,4,5,6"]);
        assert!(matches!(
            load_motion_parameters(garbage.path()),
            Err(LoaderError::ParseError(_))
        ));
    }

    #[test]
    fn test_load_framewise_displacement() -> Result<()> {
        let file = write_temp(&["Max,Mean", "0.3,0.1", "0.6,0.2"]);
        assert_eq!(load_framewise_displacement(file.path())?, vec![0.1, 0.2]);

        let plain = write_temp(&["fd", "0.5"]);
        assert_eq!(load_framewise_displacement(plain.path())?, vec![0.5]);

        Ok(())
    }

    #[test]
    fn test_load_scan_sidecar() -> Result<()> {
        let file = write_temp(&[r#"{"RepetitionTime": 1.0, "EchoTime": 0.015, "FlipAngle": 60}"#]);
        let sidecar = load_scan_sidecar(file.path())?;
        assert_eq!(sidecar.repetition_time, Some(1.0));
        assert_eq!(sidecar.echo_time, Some(0.015));

        let partial = write_temp(&[r#"{"RepetitionTime": 1.5}"#]);
        assert_eq!(load_scan_sidecar(partial.path())?.echo_time, None);

        Ok(())
    }

    #[test]
    fn test_load_analysis_row() -> Result<()> {
        let file = write_temp(&[
            "Subject ID,Pixel Volume (mm^3),Repetition Time (s),Echo Time (s),Drift Rotation X,Drift Rotation Y,Drift Rotation Z,Drift Translation X,Drift Translation Y,Drift Translation Z,Drift Framewise,Framewise Displacement STD,Mean of STD Difference,Algorithm Version",
            "001,0.125,1.0,,0.1,0.2,0.3,0.4,0.5,0.6,0.01,0.02,3.5,old",
        ]);

        let record = load_analysis_row(file.path())?;
        assert_eq!(record.subject_id, "001");
        assert_eq!(record.echo_time, None);
        assert_eq!(record.translation_drifts(), [0.4, 0.5, 0.6]);
        assert_eq!(record.algorithm_version, "old");
        assert_eq!(record.dataset, None);

        Ok(())
    }

    #[test]
    fn test_load_series_matrix() -> Result<()> {
        let file = write_temp(&["0.5,-1.0,2", "1,1,1"]);
        let rows = load_series_matrix(file.path())?;
        assert_eq!(rows, vec![vec![0.5, -1.0, 2.0], vec![1.0, 1.0, 1.0]]);

        let ragged = write_temp(&["1,2", "3"]);
        assert!(load_series_matrix(ragged.path()).is_err());

        Ok(())
    }

    #[test]
    fn test_load_scan_list_resolves_relative_paths() -> Result<()> {
        let file = write_temp(&["file_name,rg_value", "scan_a.nii.gz,101", "/abs/scan_b.nii.gz,50.8"]);
        let entries = load_scan_list(file.path())?;
        let base = file.path().parent().unwrap();

        assert_eq!(entries.len(), 2);
        assert_eq!(entries[0].file_name, base.join("scan_a.nii.gz"));
        assert_eq!(entries[1].file_name, PathBuf::from("/abs/scan_b.nii.gz"));
        assert_eq!(entries[1].rg_value, 50.8);

        Ok(())
    }
}
