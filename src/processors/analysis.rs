//! Per-subject head motion correction analysis.
//!
//! For one corrected scan this computes the drift of every rigid-body
//! parameter and of the framewise displacement (least-squares slope over
//! frames), the spread of the framewise displacement, and how much the
//! correction reduced the voxelwise temporal standard deviation inside the
//! brain. Results are written next to the correction outputs:
//!
//! ```text
//! analysis_data.csv       one AnalysisRecord row
//! motion_trends.csv       parameter,slope,intercept
//! signal_summary.csv      metric,value
//! motion_parameters.png   traces with fitted trends
//! ```

use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use log::{debug, error, info, warn};
use ndarray::{ArrayD, IxDyn};
use thiserror::Error;

use super::discovery::{self, Subject, SubjectFiles};
use super::motion_correction::{self, CorrectionStatus, MotionCorrectionOutputs};
use crate::config::PipelineConfig;
use crate::core::imaging::{self, Volume};
use crate::core::loaders::{self, AnalysisRecord, MotionAxis, MotionParameters};
use crate::core::stats;
use crate::core::writers::{self, TrendRow};
use crate::visualization;

/// Per-subject analysis table.
pub const ANALYSIS_FILE: &str = "analysis_data.csv";
/// Per-parameter trend table.
pub const TRENDS_FILE: &str = "motion_trends.csv";
/// Signal quality summary.
pub const SIGNAL_FILE: &str = "signal_summary.csv";
/// Motion trace chart.
pub const MOTION_PLOT_FILE: &str = "motion_parameters.png";

/// Errors specific to the subject analysis.
#[derive(Debug, Error)]
pub enum AnalysisError {
    #[error("Motion table has {params} frames but the framewise displacement table has {fd}")]
    FrameCountMismatch { params: usize, fd: usize },

    #[error("Cannot fit a trend to {0}: {1}")]
    Trend(String, stats::StatsError),

    #[error("Framewise displacement is empty")]
    EmptyDisplacement,
}

/// Files needed to analyse one subject.
#[derive(Debug, Clone)]
pub struct SubjectInputs {
    /// Identifier written to the `Subject ID` column
    pub subject_id: String,
    /// Uncorrected 4D series
    pub moving: PathBuf,
    /// JSON sidecar of the series
    pub scan_info: PathBuf,
    /// Folder holding the correction outputs, also receives the results
    pub output_dir: PathBuf,
    /// Brain mask; the non-zero voxels of the corrected average when absent
    pub mask: Option<PathBuf>,
}

/// Voxelwise signal quality before and after correction.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct SignalSummary {
    pub tsnr_pre: f64,
    pub tsnr_post: f64,
    pub mean_std_difference: f64,
}

/// Drift trends of the six parameters followed by the framewise displacement.
pub fn fit_trends(params: &MotionParameters, framewise: &[f64]) -> Result<Vec<TrendRow>> {
    let mut rows = Vec::with_capacity(7);
    for axis in MotionAxis::ALL {
        let trend = stats::linear_fit(&params.series(axis))
            .map_err(|e| AnalysisError::Trend(axis.label().to_string(), e))?;
        rows.push(TrendRow::new(axis.label(), trend));
    }
    let trend = stats::linear_fit(framewise)
        .map_err(|e| AnalysisError::Trend("Framewise".to_string(), e))?;
    rows.push(TrendRow::new("Framewise", trend));
    Ok(rows)
}

/// Framewise displacement from the external table when present, otherwise
/// derived from the motion parameters.
pub fn framewise_displacement(
    params: &MotionParameters,
    fd_table: &Path,
    head_radius_mm: f64,
) -> Result<Vec<f64>> {
    if !fd_table.is_file() {
        debug!(
            "{} not found, deriving framewise displacement from motion parameters",
            fd_table.display()
        );
        return Ok(stats::framewise_displacement(params, head_radius_mm));
    }

    let fd = loaders::load_framewise_displacement(fd_table)
        .with_context(|| format!("Failed to read {}", fd_table.display()))?;
    if fd.len() != params.len() {
        return Err(AnalysisError::FrameCountMismatch {
            params: params.len(),
            fd: fd.len(),
        }
        .into());
    }
    Ok(fd)
}

fn tsnr(mean: &ArrayD<f32>, std: &ArrayD<f32>) -> Result<ArrayD<f32>> {
    let means: Vec<f32> = mean.iter().copied().collect();
    let stds: Vec<f32> = std.iter().copied().collect();
    let snr = stats::snr_map(&means, &stds);
    Ok(ArrayD::from_shape_vec(IxDyn(mean.shape()), snr)?)
}

/// Compare the temporal spread of the series before and after correction.
///
/// `mask` selects the voxels the means are taken over.
pub fn signal_summary(moving: &Volume, warped: &Volume, mask: &ArrayD<f32>) -> Result<SignalSummary> {
    imaging::ensure_same_shape(moving.shape(), warped.shape())
        .context("Corrected series does not match the moving series")?;

    let std_pre = imaging::temporal_std(moving.data.view())?;
    let std_post = imaging::temporal_std(warped.data.view())?;
    imaging::ensure_same_shape(std_pre.shape(), mask.shape()).context("Mask does not match the series")?;

    let mean_pre = imaging::temporal_mean(moving.data.view())?;
    let mean_post = imaging::temporal_mean(warped.data.view())?;

    let difference = &std_pre - &std_post;

    Ok(SignalSummary {
        tsnr_pre: stats::masked_mean(tsnr(&mean_pre, &std_pre)?.view(), mask.view())?,
        tsnr_post: stats::masked_mean(tsnr(&mean_post, &std_post)?.view(), mask.view())?,
        mean_std_difference: stats::masked_mean(difference.view(), mask.view())?,
    })
}

/// Analyse one corrected scan and write its result files.
pub fn analyze_subject(inputs: &SubjectInputs, config: &PipelineConfig) -> Result<AnalysisRecord> {
    info!(
        "Analysing subject {}: moving = {}, scan info = {}, output = {}",
        inputs.subject_id,
        inputs.moving.display(),
        inputs.scan_info.display(),
        inputs.output_dir.display()
    );

    let outputs =
        MotionCorrectionOutputs::with_prefix(&inputs.output_dir, &config.motion_correction.output_prefix);

    let params = loaders::load_motion_parameters(&outputs.parameters)
        .with_context(|| format!("Failed to read {}", outputs.parameters.display()))?;
    let framewise = framewise_displacement(
        &params,
        &inputs.output_dir.join(&config.analysis.fd_file_name),
        config.analysis.head_radius_mm,
    )?;
    let framewise_std = stats::std(&framewise).ok_or(AnalysisError::EmptyDisplacement)?;

    let info = imaging::read_image_info(&inputs.moving)?;
    let sidecar = loaders::load_scan_sidecar(&inputs.scan_info)
        .with_context(|| format!("Failed to read {}", inputs.scan_info.display()))?;
    let repetition_time = sidecar.repetition_time.unwrap_or(info.frame_interval);
    if info.frames() != params.len() {
        warn!(
            "{} has {} frames but the motion table has {}",
            inputs.moving.display(),
            info.frames(),
            params.len()
        );
    }

    let trends = fit_trends(&params, &framewise)?;
    let slope = |i: usize| trends[i].slope;

    let moving = imaging::load_volume(&inputs.moving)?;
    let warped = imaging::load_volume(&outputs.warped)?;
    let mask = match &inputs.mask {
        Some(path) => imaging::load_volume(path)?.data,
        None => imaging::nonzero_mask(imaging::load_volume(&outputs.average)?.data.view()),
    };
    let signal = signal_summary(&moving, &warped, &mask)?;

    let record = AnalysisRecord {
        subject_id: inputs.subject_id.clone(),
        voxel_volume: info.voxel_volume(),
        repetition_time,
        echo_time: sidecar.echo_time,
        drift_rotation_x: slope(0),
        drift_rotation_y: slope(1),
        drift_rotation_z: slope(2),
        drift_translation_x: slope(3),
        drift_translation_y: slope(4),
        drift_translation_z: slope(5),
        drift_framewise: slope(6),
        framewise_std,
        mean_std_difference: signal.mean_std_difference,
        algorithm_version: config.analysis.algorithm_version.clone(),
        dataset: None,
    };

    let dir = &inputs.output_dir;
    writers::write_analysis_csv(&dir.join(ANALYSIS_FILE), std::slice::from_ref(&record))?;
    writers::write_trends_csv(&dir.join(TRENDS_FILE), &trends)?;
    writers::write_metrics_csv(
        &dir.join(SIGNAL_FILE),
        &[
            ("tsnr_pre", signal.tsnr_pre),
            ("tsnr_post", signal.tsnr_post),
            ("mean_std_difference", signal.mean_std_difference),
        ],
    )?;
    visualization::plot_motion_parameters(
        &dir.join(MOTION_PLOT_FILE),
        &params,
        &framewise,
        (config.plots.panel_width, config.plots.panel_height),
    )?;

    info!(
        "Subject {}: framewise drift {:.6}, FD std {:.6}, mean STD difference {:.6}",
        record.subject_id, record.drift_framewise, record.framewise_std, record.mean_std_difference
    );

    Ok(record)
}

/// What to do for every subject of a dataset.
#[derive(Debug, Clone, Default)]
pub struct BatchOptions {
    /// Run motion correction before the analysis
    pub correct: bool,
    /// Brain mask shared by every subject
    pub mask: Option<PathBuf>,
}

/// Outcome of a dataset run.
#[derive(Debug, Clone, Default)]
pub struct BatchSummary {
    /// Subjects found
    pub subjects: usize,
    /// Subjects whose correction ran in this invocation
    pub corrected: usize,
    /// Subjects whose earlier correction outputs were reused
    pub reused: usize,
    /// Records of the analysed subjects
    pub records: Vec<AnalysisRecord>,
    /// Subjects that failed, with the reason
    pub failures: Vec<(String, String)>,
}

/// Correct (optionally) and analyse one subject.
pub fn process_subject(
    subject: &Subject,
    output_root: &Path,
    config: &PipelineConfig,
    options: &BatchOptions,
) -> Result<(AnalysisRecord, Option<CorrectionStatus>)> {
    let session = &config.analysis.session;
    let files = SubjectFiles::locate(subject, session)?;
    let output_dir = output_root.join(&subject.name);

    let status = if options.correct {
        let outputs =
            MotionCorrectionOutputs::with_prefix(&output_dir, &config.motion_correction.output_prefix);
        let status = if outputs.is_complete() {
            info!(
                "Output files already present in {}, skipping motion correction",
                output_dir.display()
            );
            CorrectionStatus::AlreadyCorrected
        } else {
            let reference = discovery::find_reference_image(subject, session)?;
            motion_correction::run_motion_correction(
                &files.moving,
                &reference,
                &output_dir,
                &config.motion_correction,
            )?
            .1
        };
        Some(status)
    } else {
        None
    };

    let inputs = SubjectInputs {
        subject_id: subject.label.clone(),
        moving: files.moving,
        scan_info: files.scan_info,
        output_dir,
        mask: options.mask.clone(),
    };

    Ok((analyze_subject(&inputs, config)?, status))
}

/// Process every `sub-*` folder of `input_dir`, one subject at a time.
///
/// A failing subject is logged and skipped; the rest still run.
pub fn process_dataset(
    input_dir: &Path,
    output_dir: &Path,
    config: &PipelineConfig,
    options: &BatchOptions,
) -> Result<BatchSummary> {
    let subjects = discovery::find_subjects(input_dir)?;
    let mut summary = BatchSummary {
        subjects: subjects.len(),
        ..Default::default()
    };

    for subject in &subjects {
        info!("+ Processing subject {}", subject.label);

        match process_subject(subject, output_dir, config, options) {
            Ok((record, status)) => {
                match status {
                    Some(CorrectionStatus::Corrected) => summary.corrected += 1,
                    Some(CorrectionStatus::AlreadyCorrected) => summary.reused += 1,
                    None => {}
                }
                summary.records.push(record);
            }
            Err(e) => {
                error!("Subject {} failed: {:#}", subject.name, e);
                summary.failures.push((subject.name.clone(), format!("{:#}", e)));
            }
        }
    }

    Ok(summary)
}
