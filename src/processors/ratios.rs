//! Receiver gain intensity ratios.
//!
//! Scans of the same phantom or subject acquired at different receiver
//! gains are averaged per gain, masked to the brain, and the masked mean
//! of the reference gain is divided by that of every other gain.
//!
//! Output layout below the output directory:
//!
//! ```text
//! nifti_files/PDw_RG_<gain>.nii.gz   per-gain averages ('.' written as '_')
//! minc_files/                        scratch space of the segmentation script
//! masks/                             masks written by the segmentation script
//! rg_ratios.csv                      one row per non-reference gain
//! ```

use std::fs;
use std::path::{Path, PathBuf};
use std::process::Command;

use anyhow::{Context, Result};
use log::{debug, info, warn};
use ndarray::ArrayD;
use serde::Serialize;
use thiserror::Error;

use super::external;
use crate::config::RatioConfig;
use crate::core::imaging;
use crate::core::loaders::{self, ScanListEntry};
use crate::core::stats;
use crate::core::writers;

/// Ratio table written by [`find_ratios`].
pub const RATIO_FILE: &str = "rg_ratios.csv";

/// Errors specific to the gain ratio computation.
#[derive(Debug, Error)]
pub enum RatioError {
    #[error("{path} has shape {found:?}, expected {expected:?}")]
    ShapeMismatch {
        path: PathBuf,
        expected: Vec<usize>,
        found: Vec<usize>,
    },

    #[error("No mask found for receiver gain {0}")]
    MissingMask(f64),

    #[error("Reference gain {0} is not in the scan list")]
    MissingReference(f64),

    #[error("Masked mean of gain {0} is zero")]
    ZeroMean(f64),
}

/// Scans sharing one receiver gain, averaged voxelwise.
#[derive(Debug, Clone)]
pub struct GainAverage {
    pub gain: f64,
    pub scans: usize,
    pub average: imaging::Volume,
}

/// One line of the ratio table.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct GainRatio {
    pub reference_gain: f64,
    pub gain: f64,
    pub reference_mean: f64,
    pub gain_mean: f64,
    pub ratio: f64,
}

/// Everything produced by one ratio run.
#[derive(Debug, Clone)]
pub struct RatioReport {
    pub averages: Vec<PathBuf>,
    pub ratios: Vec<GainRatio>,
    pub table: PathBuf,
}

/// File name tag of a gain: `101` for 101.0, `50_8` for 50.8.
pub fn gain_tag(gain: f64) -> String {
    format!("{}", gain).replace('.', "_")
}

/// Average the scans of every gain, highest gain first.
pub fn average_by_gain(entries: &[ScanListEntry]) -> Result<Vec<GainAverage>> {
    let mut gains: Vec<f64> = Vec::new();
    for entry in entries {
        if !gains.contains(&entry.rg_value) {
            gains.push(entry.rg_value);
        }
    }
    gains.sort_by(|a, b| b.total_cmp(a));

    let mut expected: Option<Vec<usize>> = None;
    let mut averages = Vec::with_capacity(gains.len());

    for gain in gains {
        let mut sum: Option<ArrayD<f32>> = None;
        let mut header = None;
        let mut scans = 0usize;

        for entry in entries.iter().filter(|e| e.rg_value == gain) {
            let volume = imaging::load_volume(&entry.file_name)?;
            let shape = volume.shape().to_vec();
            match &expected {
                Some(exp) if *exp != shape => {
                    return Err(RatioError::ShapeMismatch {
                        path: entry.file_name.clone(),
                        expected: exp.clone(),
                        found: shape,
                    }
                    .into());
                }
                Some(_) => {}
                None => expected = Some(shape),
            }

            match sum.as_mut() {
                Some(acc) => *acc += &volume.data,
                None => sum = Some(volume.data),
            }
            // latest header wins
            header = Some(volume.header);
            scans += 1;
        }

        if let (Some(mut data), Some(header)) = (sum, header) {
            let n = scans as f32;
            data.mapv_inplace(|v| v / n);
            debug!("Averaged {} scans at gain {}", scans, gain);
            averages.push(GainAverage {
                gain,
                scans,
                average: imaging::Volume { header, data },
            });
        }
    }

    Ok(averages)
}

/// Pick the mask of every gain from the files in `mask_dir`.
///
/// A file belongs to the gain whose tag it contains; when several tags
/// match, the longest wins. Files matching no gain are reported and
/// ignored.
pub fn match_masks(mask_dir: &Path, gains: &[f64]) -> Result<Vec<(f64, PathBuf)>> {
    let mut files: Vec<PathBuf> = fs::read_dir(mask_dir)
        .with_context(|| format!("Failed to list masks in {}", mask_dir.display()))?
        .filter_map(|entry| entry.ok())
        .map(|entry| entry.path())
        .filter(|path| path.is_file())
        .collect();
    files.sort();

    let tags: Vec<(f64, String)> = gains.iter().map(|&g| (g, gain_tag(g))).collect();
    let mut matched: Vec<(f64, PathBuf)> = Vec::new();

    for path in files {
        let name = path
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_default();
        let best = tags
            .iter()
            .filter(|(_, tag)| name.contains(tag.as_str()))
            .max_by_key(|(_, tag)| tag.len());

        match best {
            Some(&(gain, _)) => {
                if matched.iter().any(|(g, _)| *g == gain) {
                    warn!("Several masks for gain {}, keeping the first", gain);
                } else {
                    matched.push((gain, path));
                }
            }
            None => warn!("Failed to identify the RG of this mask file: {}", path.display()),
        }
    }

    Ok(matched)
}

/// Reference mean divided by the mean of every other gain.
pub fn compute_ratios(means: &[(f64, f64)], reference_gain: f64) -> Result<Vec<GainRatio>> {
    let reference_mean = means
        .iter()
        .find(|(g, _)| *g == reference_gain)
        .map(|&(_, m)| m)
        .ok_or(RatioError::MissingReference(reference_gain))?;

    means
        .iter()
        .filter(|(g, _)| *g != reference_gain)
        .map(|&(gain, gain_mean)| {
            if gain_mean == 0.0 {
                return Err(RatioError::ZeroMean(gain).into());
            }
            Ok(GainRatio {
                reference_gain,
                gain,
                reference_mean,
                gain_mean,
                ratio: reference_mean / gain_mean,
            })
        })
        .collect()
}

/// Boxed text table of the ratios, one column per gain.
///
/// Columns are at least 12 characters wide and grow to fit their header
/// or value.
pub fn format_ratio_table(ratios: &[GainRatio]) -> String {
    let cells: Vec<(String, String)> = ratios
        .iter()
        .map(|r| (format!("{}/{}", r.reference_gain, r.gain), format!("{:.8}", r.ratio)))
        .collect();
    let widths: Vec<usize> = cells
        .iter()
        .map(|(h, v)| h.chars().count().max(v.chars().count()).max(12))
        .collect();

    let border: String = std::iter::once("+".to_string())
        .chain(widths.iter().map(|&w| format!("{}+", "-".repeat(w + 2))))
        .collect();
    let header: String = cells
        .iter()
        .zip(&widths)
        .map(|((h, _), &w)| format!(" {:^w$} |", h, w = w))
        .collect();
    let values: String = cells
        .iter()
        .zip(&widths)
        .map(|((_, v), &w)| format!(" {:^w$} |", v, w = w))
        .collect();

    format!("{border}\n|{header}\n{border}\n|{values}\n{border}")
}

/// Run the segmentation script on the averaged scans.
fn segment(config: &RatioConfig, nifti_dir: &Path, minc_dir: &Path, output_dir: &Path) -> Result<()> {
    let mut command = Command::new(&config.segmentation_script);
    command.arg(nifti_dir).arg(minc_dir).arg(output_dir);
    external::run_streaming(command)
        .with_context(|| format!("Segmentation with {} failed", config.segmentation_script))?;
    Ok(())
}

/// Compute receiver gain ratios for the scans listed in `scan_list`.
///
/// With `mask` every gain is measured inside that mask; otherwise the
/// segmentation script is run and its per-gain masks are used.
pub fn find_ratios(
    scan_list: &Path,
    output_dir: &Path,
    mask: Option<&Path>,
    config: &RatioConfig,
) -> Result<RatioReport> {
    let entries = loaders::load_scan_list(scan_list)
        .with_context(|| format!("Failed to read scan list {}", scan_list.display()))?;
    info!("Loaded {} scans from {}", entries.len(), scan_list.display());

    let averages = average_by_gain(&entries)?;

    let nifti_dir = output_dir.join("nifti_files");
    let minc_dir = output_dir.join("minc_files");
    let mask_dir = output_dir.join("masks");
    for dir in [&nifti_dir, &minc_dir, &mask_dir] {
        fs::create_dir_all(dir).with_context(|| format!("Failed to create {}", dir.display()))?;
    }

    let mut saved = Vec::with_capacity(averages.len());
    for avg in &averages {
        let path = nifti_dir.join(format!("PDw_RG_{}.nii.gz", gain_tag(avg.gain)));
        imaging::save_volume(&path, &avg.average.data, &avg.average.header)?;
        info!("Gain {}: {} scans averaged -> {}", avg.gain, avg.scans, path.display());
        saved.push(path);
    }

    let gains: Vec<f64> = averages.iter().map(|a| a.gain).collect();
    let masks: Vec<(f64, PathBuf)> = match mask {
        Some(path) => gains.iter().map(|&g| (g, path.to_path_buf())).collect(),
        None => {
            segment(config, &nifti_dir, &minc_dir, output_dir)?;
            match_masks(&mask_dir, &gains)?
        }
    };

    let mut means = Vec::with_capacity(averages.len());
    for avg in &averages {
        let mask_path = masks
            .iter()
            .find(|(g, _)| *g == avg.gain)
            .map(|(_, p)| p)
            .ok_or(RatioError::MissingMask(avg.gain))?;
        let mask = imaging::load_volume(mask_path)?;
        if mask.shape() != avg.average.shape() {
            return Err(RatioError::ShapeMismatch {
                path: mask_path.clone(),
                expected: avg.average.shape().to_vec(),
                found: mask.shape().to_vec(),
            }
            .into());
        }

        let mean = stats::masked_mean(avg.average.data.view(), mask.data.view())?;
        debug!("Gain {}: masked mean {}", avg.gain, mean);
        means.push((avg.gain, mean));
    }

    let ratios = compute_ratios(&means, config.reference_gain)?;
    let table = output_dir.join(RATIO_FILE);
    writers::write_records(&table, &ratios)?;

    Ok(RatioReport {
        averages: saved,
        ratios,
        table,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use ndarray::IxDyn;
    use nifti::NiftiHeader;
    use tempfile::TempDir;

    fn header() -> NiftiHeader {
        let mut header = NiftiHeader::default();
        header.pixdim = [1.0, 1.0, 1.0, 1.0, 0.0, 0.0, 0.0, 0.0];
        header.scl_slope = 1.0;
        header
    }

    fn write_volume(path: &Path, value: f32, shape: &[usize]) {
        imaging::save_volume(path, &ArrayD::from_elem(IxDyn(shape), value), &header()).unwrap();
    }

    /// Two scans at gain 101 (4 and 6) and one at 50.8 (2.5).
    fn write_scans(dir: &Path) -> PathBuf {
        write_volume(&dir.join("a.nii.gz"), 4.0, &[2, 2, 1]);
        write_volume(&dir.join("b.nii.gz"), 6.0, &[2, 2, 1]);
        write_volume(&dir.join("c.nii.gz"), 2.5, &[2, 2, 1]);
        let list = dir.join("scans.csv");
        fs::write(
            &list,
            "file_name,rg_value\na.nii.gz,101\nc.nii.gz,50.8\nb.nii.gz,101\n",
        )
        .unwrap();
        list
    }

    #[test]
    fn test_gain_tag() {
        assert_eq!(gain_tag(101.0), "101");
        assert_eq!(gain_tag(50.8), "50_8");
    }

    #[test]
    fn test_average_by_gain() {
        let temp_dir = TempDir::new().unwrap();
        let list = write_scans(temp_dir.path());
        let entries = loaders::load_scan_list(&list).unwrap();

        let averages = average_by_gain(&entries).unwrap();
        assert_eq!(averages.len(), 2);
        assert_eq!(averages[0].gain, 101.0);
        assert_eq!(averages[0].scans, 2);
        assert!(averages[0].average.data.iter().all(|&v| (v - 5.0).abs() < 1e-6));
        assert_eq!(averages[1].gain, 50.8);
    }

    #[test]
    fn test_average_rejects_mismatched_shapes() {
        let temp_dir = TempDir::new().unwrap();
        write_volume(&temp_dir.path().join("a.nii.gz"), 1.0, &[2, 2, 1]);
        write_volume(&temp_dir.path().join("b.nii.gz"), 1.0, &[2, 2, 2]);
        let list = temp_dir.path().join("scans.csv");
        fs::write(&list, "file_name,rg_value\na.nii.gz,101\nb.nii.gz,101\n").unwrap();
        let entries = loaders::load_scan_list(&list).unwrap();

        let err = average_by_gain(&entries).unwrap_err();
        assert!(matches!(
            err.downcast_ref::<RatioError>(),
            Some(RatioError::ShapeMismatch { .. })
        ));
    }

    #[test]
    fn test_find_ratios_with_mask() {
        let temp_dir = TempDir::new().unwrap();
        let list = write_scans(temp_dir.path());
        let mask = temp_dir.path().join("mask.nii.gz");
        write_volume(&mask, 1.0, &[2, 2, 1]);
        let output = temp_dir.path().join("output");

        let report = find_ratios(&list, &output, Some(&mask), &RatioConfig::default()).unwrap();

        assert_eq!(report.ratios.len(), 1);
        let ratio = &report.ratios[0];
        assert_eq!(ratio.gain, 50.8);
        assert!((ratio.reference_mean - 5.0).abs() < 1e-6);
        assert!((ratio.ratio - 2.0).abs() < 1e-6);

        assert!(output.join("nifti_files").join("PDw_RG_101.nii.gz").exists());
        assert!(output.join("nifti_files").join("PDw_RG_50_8.nii.gz").exists());
        let table = fs::read_to_string(&report.table).unwrap();
        assert!(table.starts_with("reference_gain,gain,reference_mean,gain_mean,ratio"));
    }

    #[cfg(unix)]
    #[test]
    fn test_find_ratios_with_segmentation_script() {
        use std::os::unix::fs::PermissionsExt;

        let temp_dir = TempDir::new().unwrap();
        let list = write_scans(temp_dir.path());
        let prepared = temp_dir.path().join("prepared");
        fs::create_dir_all(&prepared).unwrap();
        write_volume(&prepared.join("PDw_RG_101_mask.nii.gz"), 1.0, &[2, 2, 1]);
        write_volume(&prepared.join("PDw_RG_50_8_mask.nii.gz"), 1.0, &[2, 2, 1]);

        // stands in for the segmentation pipeline: copies ready-made masks
        let script = temp_dir.path().join("segment.sh");
        fs::write(
            &script,
            format!("#!/bin/sh\ncp {}/*.nii.gz \"$3/masks/\"\n", prepared.display()),
        )
        .unwrap();
        fs::set_permissions(&script, fs::Permissions::from_mode(0o755)).unwrap();

        let config = RatioConfig {
            segmentation_script: script.display().to_string(),
            ..Default::default()
        };
        let output = temp_dir.path().join("output");
        let report = find_ratios(&list, &output, None, &config).unwrap();

        assert!((report.ratios[0].ratio - 2.0).abs() < 1e-6);
    }

    #[test]
    fn test_match_masks() {
        let temp_dir = TempDir::new().unwrap();
        for name in ["mask_101.nii.gz", "mask_50_8.nii.gz", "mask_other.nii.gz"] {
            fs::write(temp_dir.path().join(name), b"").unwrap();
        }

        let masks = match_masks(temp_dir.path(), &[101.0, 50.8, 64.0]).unwrap();
        assert_eq!(masks.len(), 2);
        assert!(masks.iter().any(|(g, p)| *g == 101.0 && p.ends_with("mask_101.nii.gz")));
        assert!(masks.iter().any(|(g, p)| *g == 50.8 && p.ends_with("mask_50_8.nii.gz")));
    }

    #[test]
    fn test_compute_ratios() {
        let ratios = compute_ratios(&[(101.0, 10.0), (50.8, 4.0), (64.0, 5.0)], 101.0).unwrap();
        assert_eq!(ratios.len(), 2);
        assert_eq!(ratios[0].ratio, 2.5);
        assert_eq!(ratios[1].ratio, 2.0);

        let missing = compute_ratios(&[(50.8, 4.0)], 101.0).unwrap_err();
        assert!(matches!(
            missing.downcast_ref::<RatioError>(),
            Some(RatioError::MissingReference(_))
        ));

        assert!(compute_ratios(&[(101.0, 1.0), (50.8, 0.0)], 101.0).is_err());
    }

    #[test]
    fn test_format_ratio_table() {
        let ratios = compute_ratios(&[(101.0, 10.0), (50.8, 4.0)], 101.0).unwrap();
        let table = format_ratio_table(&ratios);
        let lines: Vec<&str> = table.lines().collect();
        assert_eq!(lines.len(), 5);
        assert_eq!(lines[0], "+--------------+");
        assert!(lines[1].contains("101/50.8"));
        assert!(lines[3].contains("2.50000000"));
    }

    #[test]
    fn test_format_ratio_table_wide_values() {
        let ratios = compute_ratios(&[(101.0, 123456.0), (50.8, 0.5), (64.0, 50.0)], 101.0).unwrap();
        let table = format_ratio_table(&ratios);
        let lines: Vec<&str> = table.lines().collect();

        assert!(lines[3].contains("246912.00000000"));
        let width = lines[0].chars().count();
        assert!(lines.iter().all(|l| l.chars().count() == width));
        // column separators line up with the border corners
        let corners: Vec<usize> = lines[0].match_indices('+').map(|(i, _)| i).collect();
        let bars: Vec<usize> = lines[3].match_indices('|').map(|(i, _)| i).collect();
        assert_eq!(corners, bars);
    }

    #[test]
    fn test_find_ratios_rejects_mismatched_mask() {
        let temp_dir = TempDir::new().unwrap();
        let list = write_scans(temp_dir.path());
        let mask = temp_dir.path().join("mask.nii.gz");
        write_volume(&mask, 1.0, &[2, 2, 2]);
        let output = temp_dir.path().join("output");

        let err = find_ratios(&list, &output, Some(&mask), &RatioConfig::default()).unwrap_err();
        match err.downcast_ref::<RatioError>() {
            Some(RatioError::ShapeMismatch { path, expected, found }) => {
                assert_eq!(path, &mask);
                assert_eq!(expected, &vec![2, 2, 1]);
                assert_eq!(found, &vec![2, 2, 2]);
            }
            other => panic!("unexpected error: {:?}", other),
        }
    }
}
