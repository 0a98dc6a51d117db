//! Rigid head motion correction with `antsMotionCorr`.

use std::ffi::OsString;
use std::fs;
use std::path::{Path, PathBuf};
use std::process::Command;

use log::info;
use thiserror::Error;

use super::external::{self, ExternalError};
use crate::config::MotionCorrectionConfig;
use crate::core::imaging::{self, NiftiError};

/// Errors that can occur during motion correction.
#[derive(Debug, Error)]
pub enum MotionCorrectionError {
    #[error("Failed to create output directory {path}: {source}")]
    CreateDirectory {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("Cannot read moving image header: {0}")]
    Header(#[from] NiftiError),

    #[error(transparent)]
    Tool(#[from] ExternalError),

    #[error("Motion correction finished but {0} was not written")]
    MissingOutput(PathBuf),
}

/// Result type for motion correction.
pub type Result<T> = std::result::Result<T, MotionCorrectionError>;

/// Files written by one motion correction run.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MotionCorrectionOutputs {
    /// Output prefix handed to the tool
    pub prefix: PathBuf,
    /// Per-frame motion parameter table
    pub parameters: PathBuf,
    /// Corrected 4D series
    pub warped: PathBuf,
    /// Temporal average of the corrected series
    pub average: PathBuf,
}

impl MotionCorrectionOutputs {
    /// Output names inside `dir` for the given prefix.
    pub fn with_prefix(dir: &Path, prefix: &str) -> Self {
        Self {
            prefix: dir.join(prefix),
            parameters: dir.join(format!("{}MOCOparams.csv", prefix)),
            warped: dir.join(format!("{}_warped.nii.gz", prefix)),
            average: dir.join(format!("{}_avg.nii.gz", prefix)),
        }
    }

    /// Output names inside `dir` with the standard `motcorr` prefix.
    pub fn in_dir(dir: &Path) -> Self {
        Self::with_prefix(dir, "motcorr")
    }

    /// Whether a previous run already produced the parameter table.
    pub fn is_complete(&self) -> bool {
        self.parameters.is_file()
    }
}

/// What a call to [`run_motion_correction`] did.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CorrectionStatus {
    /// The tool ran and wrote its outputs
    Corrected,
    /// Outputs from an earlier run were found and kept
    AlreadyCorrected,
}

/// Build the `antsMotionCorr` invocation for one series.
///
/// `frames` is the number of frames in the moving series; the number of
/// frames averaged for the initial template is capped by
/// `config.averaging_frames_cap`.
pub fn build_command(
    moving: &Path,
    reference: &Path,
    outputs: &MotionCorrectionOutputs,
    frames: usize,
    config: &MotionCorrectionConfig,
) -> Command {
    let averaged = frames.min(config.averaging_frames_cap).max(1);

    let output_spec = format!(
        "[{},{},{}]",
        outputs.prefix.display(),
        outputs.warped.display(),
        outputs.average.display()
    );
    let metric = format!(
        "MI[{},{},1,{},{},{}]",
        reference.display(),
        moving.display(),
        config.metric_bins,
        config.sampling_strategy,
        config.sampling_percentage
    );
    let transform = format!("Rigid[{}]", config.gradient_step);

    let args: Vec<OsString> = [
        "-d".to_string(),
        "3".to_string(),
        "-o".to_string(),
        output_spec,
        "-m".to_string(),
        metric,
        "-t".to_string(),
        transform,
        "-i".to_string(),
        config.iterations.clone(),
        "-s".to_string(),
        config.smoothing_sigmas.clone(),
        "-f".to_string(),
        config.shrink_factors.clone(),
        "-u".to_string(),
        "1".to_string(),
        "-e".to_string(),
        "1".to_string(),
        "-l".to_string(),
        "1".to_string(),
        "-n".to_string(),
        averaged.to_string(),
        "-v".to_string(),
        "1".to_string(),
    ]
    .into_iter()
    .map(OsString::from)
    .collect();

    let mut command = Command::new(&config.executable);
    command.args(args);
    command
}

/// Correct `moving` against `reference`, writing into `output_dir`.
///
/// Nothing is run when the parameter table from an earlier run exists.
pub fn run_motion_correction(
    moving: &Path,
    reference: &Path,
    output_dir: &Path,
    config: &MotionCorrectionConfig,
) -> Result<(MotionCorrectionOutputs, CorrectionStatus)> {
    let outputs = MotionCorrectionOutputs::with_prefix(output_dir, &config.output_prefix);

    if outputs.is_complete() {
        info!(
            "Motion correction already done for {}, skipping",
            output_dir.display()
        );
        return Ok((outputs, CorrectionStatus::AlreadyCorrected));
    }

    fs::create_dir_all(output_dir).map_err(|e| MotionCorrectionError::CreateDirectory {
        path: output_dir.to_path_buf(),
        source: e,
    })?;

    let frames = imaging::read_image_info(moving)?.frames();
    info!(
        "Correcting {} ({} frames) against {}",
        moving.display(),
        frames,
        reference.display()
    );

    let command = build_command(moving, reference, &outputs, frames, config);
    external::run_streaming(command)?;

    if !outputs.is_complete() {
        return Err(MotionCorrectionError::MissingOutput(outputs.parameters));
    }

    Ok((outputs, CorrectionStatus::Corrected))
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn args_of(command: &Command) -> Vec<String> {
        command
            .get_args()
            .map(|a| a.to_string_lossy().into_owned())
            .collect()
    }

    #[test]
    fn test_output_names() {
        let outputs = MotionCorrectionOutputs::in_dir(Path::new("/out/sub-001"));
        assert_eq!(outputs.prefix, PathBuf::from("/out/sub-001/motcorr"));
        assert_eq!(
            outputs.parameters,
            PathBuf::from("/out/sub-001/motcorrMOCOparams.csv")
        );
        assert_eq!(
            outputs.warped,
            PathBuf::from("/out/sub-001/motcorr_warped.nii.gz")
        );
        assert_eq!(outputs.average, PathBuf::from("/out/sub-001/motcorr_avg.nii.gz"));
    }

    #[test]
    fn test_build_command_arguments() {
        let outputs = MotionCorrectionOutputs::in_dir(Path::new("out"));
        let config = MotionCorrectionConfig::default();
        let command = build_command(
            Path::new("bold.nii.gz"),
            Path::new("ref.nii.gz"),
            &outputs,
            150,
            &config,
        );

        assert_eq!(command.get_program(), "antsMotionCorr");
        let expected = vec![
            "-d",
            "3",
            "-o",
            "[out/motcorr,out/motcorr_warped.nii.gz,out/motcorr_avg.nii.gz]",
            "-m",
            "MI[ref.nii.gz,bold.nii.gz,1,20,regular,0.2]",
            "-t",
            "Rigid[0.25]",
            "-i",
            "50x20",
            "-s",
            "1x0",
            "-f",
            "2x1",
            "-u",
            "1",
            "-e",
            "1",
            "-l",
            "1",
            "-n",
            "10",
            "-v",
            "1",
        ];
        assert_eq!(args_of(&command), expected);
    }

    #[test]
    fn test_build_command_short_series() {
        let outputs = MotionCorrectionOutputs::in_dir(Path::new("out"));
        let command = build_command(
            Path::new("bold.nii.gz"),
            Path::new("ref.nii.gz"),
            &outputs,
            4,
            &MotionCorrectionConfig::default(),
        );
        let args = args_of(&command);
        let n = args.iter().position(|a| a == "-n").unwrap();
        assert_eq!(args[n + 1], "4");
    }

    #[test]
    fn test_skips_existing_results() {
        let temp_dir = TempDir::new().unwrap();
        let params = temp_dir.path().join("motcorrMOCOparams.csv");
        fs::write(&params, "MOCOparam0\n0\n").unwrap();

        let config = MotionCorrectionConfig {
            executable: "definitely-not-a-real-program-xyz".to_string(),
            ..Default::default()
        };
        let (outputs, status) = run_motion_correction(
            Path::new("missing.nii.gz"),
            Path::new("missing_ref.nii.gz"),
            temp_dir.path(),
            &config,
        )
        .unwrap();

        assert_eq!(status, CorrectionStatus::AlreadyCorrected);
        assert_eq!(outputs.parameters, params);
    }

    #[test]
    fn test_missing_moving_image_is_error() {
        let temp_dir = TempDir::new().unwrap();
        let result = run_motion_correction(
            &temp_dir.path().join("missing.nii.gz"),
            Path::new("ref.nii.gz"),
            &temp_dir.path().join("out"),
            &MotionCorrectionConfig::default(),
        );
        assert!(matches!(result, Err(MotionCorrectionError::Header(_))));
    }
}
