//! Cross-dataset aggregation of per-subject analyses and comparison charts.

use std::collections::{BTreeMap, BTreeSet};
use std::fs;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use log::{info, warn};
use thiserror::Error;

use super::analysis::ANALYSIS_FILE;
use super::discovery;
use crate::config::PipelineConfig;
use crate::core::loaders::{self, AnalysisRecord};
use crate::core::writers;
use crate::visualization::{self, ComparisonLabels};

/// Combined table of every subject.
pub const COMBINED_FILE: &str = "combined_bold_scan_params.csv";

/// Errors specific to aggregation.
#[derive(Debug, Error)]
pub enum AggregateError {
    #[error("No {file} files found under {root}")]
    NoResults { file: &'static str, root: PathBuf },
}

/// Collect every per-subject analysis below `input_dir` into one table.
///
/// The dataset of each row is the path component `dataset_depth` positions
/// from the end of its file path. Unreadable files and files too shallow
/// to name a dataset are skipped with a warning. The table is written to
/// `output_dir/combined_bold_scan_params.csv`.
pub fn combine_results(
    input_dir: &Path,
    output_dir: &Path,
    config: &PipelineConfig,
) -> Result<Vec<AnalysisRecord>> {
    info!("Looking for analysis results under {}", input_dir.display());

    let files = discovery::find_files_named(input_dir, ANALYSIS_FILE);
    let mut records = Vec::with_capacity(files.len());

    for path in &files {
        let Some(dataset) = discovery::dataset_label(path, config.datasets.dataset_depth) else {
            warn!("Cannot name the dataset of {}, skipping", path.display());
            continue;
        };
        match loaders::load_analysis_row(path) {
            Ok(mut record) => {
                record.dataset = Some(dataset);
                records.push(record);
            }
            Err(e) => warn!("Skipping {}: {}", path.display(), e),
        }
    }

    if records.is_empty() {
        return Err(AggregateError::NoResults {
            file: ANALYSIS_FILE,
            root: input_dir.to_path_buf(),
        }
        .into());
    }

    let combined = output_dir.join(COMBINED_FILE);
    writers::write_analysis_csv(&combined, &records)
        .with_context(|| format!("Failed to write {}", combined.display()))?;
    info!("Combined {} subjects into {}", records.len(), combined.display());

    Ok(records)
}

/// Algorithm versions present in `records`, sorted.
pub fn versions(records: &[AnalysisRecord]) -> Vec<String> {
    records
        .iter()
        .map(|r| r.algorithm_version.clone())
        .collect::<BTreeSet<_>>()
        .into_iter()
        .collect()
}

/// Values of one metric grouped by algorithm version, for the records
/// accepted by `keep`. Versions without values are left out.
pub fn group_by_version<K, V>(records: &[AnalysisRecord], keep: K, value: V) -> Vec<(String, Vec<f64>)>
where
    K: Fn(&AnalysisRecord) -> bool,
    V: Fn(&AnalysisRecord) -> f64,
{
    let mut groups: BTreeMap<String, Vec<f64>> = BTreeMap::new();
    for record in records {
        if !keep(record) {
            continue;
        }
        let v = value(record);
        if v.is_finite() {
            groups.entry(record.algorithm_version.clone()).or_default().push(v);
        }
    }
    groups.into_iter().collect()
}

/// `tag` reduced to characters safe in a file name.
fn file_tag(tag: &str) -> String {
    tag.chars()
        .map(|c| {
            if c.is_ascii_alphanumeric() || matches!(c, '_' | '.' | '-') {
                c
            } else {
                '_'
            }
        })
        .collect()
}

fn in_dataset(record: &AnalysisRecord, names: &[String]) -> bool {
    record
        .dataset
        .as_deref()
        .map(|d| names.iter().any(|n| n == d))
        .unwrap_or(false)
}

struct Comparison<'a> {
    file: &'static str,
    datasets: Vec<String>,
    value: fn(&AnalysisRecord) -> f64,
    labels: ComparisonLabels<'a>,
}

/// Render every comparison chart of the combined table into `output_dir`.
///
/// Returns the charts written. Charts whose selection is empty are
/// skipped with a warning.
pub fn present_analysis(
    records: &[AnalysisRecord],
    output_dir: &Path,
    config: &PipelineConfig,
) -> Result<Vec<PathBuf>> {
    fs::create_dir_all(output_dir)
        .with_context(|| format!("Failed to create {}", output_dir.display()))?;

    let size = (config.plots.panel_width, config.plots.panel_height);
    let colors = &config.datasets.colors;
    let drift_datasets = &config.datasets.drift_datasets;
    let mut written = Vec::new();

    let overview = output_dir.join("drift_plots.png");
    visualization::plot_drift_overview(&overview, records, colors, size)?;
    written.push(overview);

    for version in versions(records) {
        let selected: Vec<AnalysisRecord> = records
            .iter()
            .filter(|r| r.algorithm_version == version && in_dataset(r, drift_datasets))
            .cloned()
            .collect();
        if selected.is_empty() {
            warn!(
                "No drift dataset results for version '{}', skipping its drift grid",
                version
            );
            continue;
        }

        let path = output_dir.join(format!("drift_plots_{}_ants.png", file_tag(&version)));
        visualization::plot_drift_grid(&path, &selected, drift_datasets, colors, size)?;
        written.push(path);
    }

    let comparisons = [
        Comparison {
            file: "drift_comparison.png",
            datasets: drift_datasets.clone(),
            value: |r| r.drift_framewise,
            labels: ComparisonLabels {
                metric: "Framewise displacement drift",
                subject: "across subjects according to the ANTs version",
            },
        },
        Comparison {
            file: "real_motion_comparison.png",
            datasets: vec![config.datasets.real_motion_dataset.clone()],
            value: |r| r.mean_std_difference,
            labels: ComparisonLabels {
                metric: "Mean for the difference in STD",
                subject: "between pre and post correction scans according to the ANTs version",
            },
        },
        Comparison {
            file: "fake_high_motion_comparison.png",
            datasets: vec![config.datasets.fake_high_motion_dataset.clone()],
            value: |r| r.framewise_std,
            labels: ComparisonLabels {
                metric: "Framewise displacement spread",
                subject: "across subjects according to the ANTs version",
            },
        },
    ];

    for comparison in &comparisons {
        let groups = group_by_version(
            records,
            |r| in_dataset(r, &comparison.datasets),
            comparison.value,
        );
        if groups.is_empty() {
            warn!(
                "No results for {:?}, skipping {}",
                comparison.datasets, comparison.file
            );
            continue;
        }

        let path = output_dir.join(comparison.file);
        visualization::plot_version_comparison(
            &path,
            &groups,
            comparison.labels,
            config.plots.histogram_bins,
            size,
        )?;
        written.push(path);
    }

    Ok(written)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs;
    use tempfile::TempDir;

    fn record(subject: &str, version: &str, drift: f64) -> AnalysisRecord {
        AnalysisRecord {
            subject_id: subject.to_string(),
            voxel_volume: 0.125,
            repetition_time: 1.0,
            echo_time: Some(0.015),
            drift_rotation_x: drift,
            drift_rotation_y: drift * 2.0,
            drift_rotation_z: drift * 3.0,
            drift_translation_x: -drift,
            drift_translation_y: 0.0,
            drift_translation_z: drift,
            drift_framewise: drift,
            framewise_std: drift / 2.0,
            mean_std_difference: 1.0 + drift,
            algorithm_version: version.to_string(),
            dataset: None,
        }
    }

    fn write_result(root: &Path, dataset: &str, subject: &str, record: &AnalysisRecord) {
        let path = root.join(dataset).join("hmc").join(subject).join(ANALYSIS_FILE);
        writers::write_analysis_csv(&path, std::slice::from_ref(record)).unwrap();
    }

    #[test]
    fn test_combine_results_adds_dataset() {
        let temp_dir = TempDir::new().unwrap();
        let input = temp_dir.path().join("results");
        write_result(&input, "rabies_7_Cryo_med_f1", "sub-001", &record("001", "new", 0.1));
        write_result(&input, "rabies_7_RT_halo_v", "sub-002", &record("002", "old", 0.2));
        let output = temp_dir.path().join("combined");

        let records = combine_results(&input, &output, &PipelineConfig::default()).unwrap();
        assert_eq!(records.len(), 2);
        assert_eq!(records[0].dataset.as_deref(), Some("rabies_7_Cryo_med_f1"));
        assert_eq!(records[1].dataset.as_deref(), Some("rabies_7_RT_halo_v"));

        let content = fs::read_to_string(output.join(COMBINED_FILE)).unwrap();
        let lines: Vec<&str> = content.lines().collect();
        assert_eq!(lines.len(), 3);
        assert!(lines[0].ends_with("Algorithm Version,Dataset"));
        assert!(lines[1].starts_with("001,"));
        assert!(lines[1].ends_with(",new,rabies_7_Cryo_med_f1"));

        let reloaded = loaders::load_analysis_table(output.join(COMBINED_FILE)).unwrap();
        assert_eq!(reloaded, records);
    }

    #[test]
    fn test_combine_results_empty() {
        let temp_dir = TempDir::new().unwrap();
        let err = combine_results(temp_dir.path(), temp_dir.path(), &PipelineConfig::default())
            .unwrap_err();
        assert!(matches!(
            err.downcast_ref::<AggregateError>(),
            Some(AggregateError::NoResults { .. })
        ));
    }

    #[test]
    fn test_group_by_version() {
        let mut records = vec![
            record("1", "old", 0.3),
            record("2", "new", 0.1),
            record("3", "new", 0.2),
            record("4", "new", f64::NAN),
        ];
        records[0].dataset = Some("a".to_string());
        records[1].dataset = Some("a".to_string());
        records[2].dataset = Some("b".to_string());
        records[3].dataset = Some("a".to_string());

        let groups = group_by_version(
            &records,
            |r| r.dataset.as_deref() == Some("a"),
            |r| r.drift_framewise,
        );
        assert_eq!(
            groups,
            vec![("new".to_string(), vec![0.1]), ("old".to_string(), vec![0.3])]
        );
        assert_eq!(versions(&records), vec!["new".to_string(), "old".to_string()]);
    }

    #[test]
    fn test_present_analysis_creates_output_dir() {
        let temp_dir = TempDir::new().unwrap();
        let mut records = vec![record("1", "new", 0.1)];
        records[0].dataset = Some("rabies_7_Cryo_med_f1".to_string());
        let output = temp_dir.path().join("charts").join("round_1");

        let written = present_analysis(&records, &output, &PipelineConfig::default()).unwrap();
        assert!(!written.is_empty());
        assert!(written.iter().all(|p| p.starts_with(&output) && p.exists()));
    }

    #[test]
    fn test_version_tag_stays_inside_output_dir() {
        assert_eq!(file_tag("ants-2.4.3"), "ants-2.4.3");
        assert_eq!(file_tag("../v1/new"), ".._v1_new");

        let temp_dir = TempDir::new().unwrap();
        let mut records = vec![record("1", "nightly/2023 build", 0.1)];
        records[0].dataset = Some("rabies_7_Cryo_med_f1".to_string());
        let output = temp_dir.path().join("charts");

        let written = present_analysis(&records, &output, &PipelineConfig::default()).unwrap();
        let grid = output.join("drift_plots_nightly_2023_build_ants.png");
        assert!(written.contains(&grid));
        assert!(written.iter().all(|p| p.parent() == Some(output.as_path())));
    }

    #[test]
    fn test_present_analysis_skips_empty_charts() {
        let temp_dir = TempDir::new().unwrap();
        let mut records = vec![
            record("1", "new", 0.1),
            record("2", "new", 0.2),
            record("3", "old", 0.4),
        ];
        records[0].dataset = Some("rabies_7_Cryo_med_f1".to_string());
        records[1].dataset = Some("rabies_7_Cryo_med_f2".to_string());
        records[2].dataset = Some("rabies_7_Cryo_aw_f".to_string());

        let written = present_analysis(&records, temp_dir.path(), &PipelineConfig::default()).unwrap();
        let names: Vec<String> = written
            .iter()
            .map(|p| p.file_name().unwrap().to_string_lossy().into_owned())
            .collect();

        assert_eq!(
            names,
            vec![
                "drift_plots.png",
                "drift_plots_new_ants.png",
                "drift_comparison.png",
                "real_motion_comparison.png",
            ]
        );
        assert!(written.iter().all(|p| p.exists()));
    }
}
