//! Configuration types for the motion correction analysis pipeline.

use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::path::Path;

/// Parameters of the `antsMotionCorr` invocation.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MotionCorrectionConfig {
    /// Executable name or path of the registration tool
    #[serde(default = "default_executable")]
    pub executable: String,

    /// Prefix for every file the tool writes
    #[serde(default = "default_output_prefix")]
    pub output_prefix: String,

    /// Number of histogram bins of the mutual information metric
    #[serde(default = "default_metric_bins")]
    pub metric_bins: u32,

    /// Sampling strategy of the metric ("regular", "random", "none")
    #[serde(default = "default_sampling_strategy")]
    pub sampling_strategy: String,

    /// Fraction of voxels sampled by the metric
    #[serde(default = "default_sampling_percentage")]
    pub sampling_percentage: f64,

    /// Gradient step of the rigid transform
    #[serde(default = "default_gradient_step")]
    pub gradient_step: f64,

    /// Iterations per level (e.g. "50x20")
    #[serde(default = "default_iterations")]
    pub iterations: String,

    /// Smoothing sigmas per level
    #[serde(default = "default_smoothing")]
    pub smoothing_sigmas: String,

    /// Shrink factors per level
    #[serde(default = "default_shrink")]
    pub shrink_factors: String,

    /// Upper bound on the number of frames averaged into the template
    #[serde(default = "default_averaging_frames_cap")]
    pub averaging_frames_cap: usize,
}

fn default_executable() -> String {
    "antsMotionCorr".to_string()
}

fn default_output_prefix() -> String {
    "motcorr".to_string()
}

fn default_metric_bins() -> u32 {
    20
}

fn default_sampling_strategy() -> String {
    "regular".to_string()
}

fn default_sampling_percentage() -> f64 {
    0.2
}

fn default_gradient_step() -> f64 {
    0.25
}

fn default_iterations() -> String {
    "50x20".to_string()
}

fn default_smoothing() -> String {
    "1x0".to_string()
}

fn default_shrink() -> String {
    "2x1".to_string()
}

fn default_averaging_frames_cap() -> usize {
    10
}

impl Default for MotionCorrectionConfig {
    fn default() -> Self {
        Self {
            executable: default_executable(),
            output_prefix: default_output_prefix(),
            metric_bins: default_metric_bins(),
            sampling_strategy: default_sampling_strategy(),
            sampling_percentage: default_sampling_percentage(),
            gradient_step: default_gradient_step(),
            iterations: default_iterations(),
            smoothing_sigmas: default_smoothing(),
            shrink_factors: default_shrink(),
            averaging_frames_cap: default_averaging_frames_cap(),
        }
    }
}

/// Configuration for the per-subject analysis.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AnalysisConfig {
    /// Session folder searched inside each subject
    #[serde(default = "default_session")]
    pub session: String,

    /// Tag written to the "Algorithm Version" column
    #[serde(default = "default_algorithm_version")]
    pub algorithm_version: String,

    /// Head radius used to turn rotations into displacements
    #[serde(default = "default_head_radius")]
    pub head_radius_mm: f64,

    /// Externally produced framewise displacement table, if any
    #[serde(default = "default_fd_file_name")]
    pub fd_file_name: String,
}

fn default_session() -> String {
    "ses-1".to_string()
}

fn default_algorithm_version() -> String {
    "new".to_string()
}

fn default_head_radius() -> f64 {
    50.0
}

fn default_fd_file_name() -> String {
    "motcorr_FD.csv".to_string()
}

impl Default for AnalysisConfig {
    fn default() -> Self {
        Self {
            session: default_session(),
            algorithm_version: default_algorithm_version(),
            head_radius_mm: default_head_radius(),
            fd_file_name: default_fd_file_name(),
        }
    }
}

/// Dataset roles and colors for the cross-subject charts.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DatasetConfig {
    /// RGB color per dataset label
    #[serde(default = "default_dataset_colors")]
    pub colors: HashMap<String, [u8; 3]>,

    /// Datasets where drift is expected to show
    #[serde(default = "default_drift_datasets")]
    pub drift_datasets: Vec<String>,

    /// Dataset with genuine subject motion
    #[serde(default = "default_real_motion_dataset")]
    pub real_motion_dataset: String,

    /// Dataset with simulated high motion
    #[serde(default = "default_fake_high_motion_dataset")]
    pub fake_high_motion_dataset: String,

    /// Position of the dataset folder counted from the end of a result path
    #[serde(default = "default_dataset_depth")]
    pub dataset_depth: usize,
}

fn default_dataset_colors() -> HashMap<String, [u8; 3]> {
    let mut colors = HashMap::new();
    colors.insert("rabies_7_Cryo_aw_f".to_string(), [255, 0, 0]); // red
    colors.insert("rabies_7_Cryo_med_f1".to_string(), [0, 0, 255]); // blue
    colors.insert("rabies_7_Cryo_med_f2".to_string(), [0, 128, 0]); // green
    colors.insert("rabies_7_RT_halo_v".to_string(), [0, 0, 0]); // black
    colors.insert("rabies_7_RT_med_f".to_string(), [255, 165, 0]); // orange
    colors.insert("rabies_94_RT_iso_v".to_string(), [128, 0, 128]); // purple
    colors
}

fn default_drift_datasets() -> Vec<String> {
    vec![
        "rabies_7_Cryo_med_f1".to_string(),
        "rabies_7_Cryo_med_f2".to_string(),
    ]
}

fn default_real_motion_dataset() -> String {
    "rabies_7_Cryo_aw_f".to_string()
}

fn default_fake_high_motion_dataset() -> String {
    "rabies_7_RT_halo_v".to_string()
}

fn default_dataset_depth() -> usize {
    4
}

impl Default for DatasetConfig {
    fn default() -> Self {
        Self {
            colors: default_dataset_colors(),
            drift_datasets: default_drift_datasets(),
            real_motion_dataset: default_real_motion_dataset(),
            fake_high_motion_dataset: default_fake_high_motion_dataset(),
            dataset_depth: default_dataset_depth(),
        }
    }
}

/// Chart rendering settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PlotConfig {
    /// Width of a single chart panel in pixels
    #[serde(default = "default_panel_width")]
    pub panel_width: u32,

    /// Height of a single chart panel in pixels
    #[serde(default = "default_panel_height")]
    pub panel_height: u32,

    /// Bins of the comparison histograms
    #[serde(default = "default_histogram_bins")]
    pub histogram_bins: usize,
}

fn default_panel_width() -> u32 {
    640
}

fn default_panel_height() -> u32 {
    400
}

fn default_histogram_bins() -> usize {
    30
}

impl Default for PlotConfig {
    fn default() -> Self {
        Self {
            panel_width: default_panel_width(),
            panel_height: default_panel_height(),
            histogram_bins: default_histogram_bins(),
        }
    }
}

/// Configuration for receiver gain ratio measurements.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RatioConfig {
    /// Brain segmentation script producing masks
    #[serde(default = "default_segmentation_script")]
    pub segmentation_script: String,

    /// Gain every other gain is compared against
    #[serde(default = "default_reference_gain")]
    pub reference_gain: f64,
}

fn default_segmentation_script() -> String {
    "./segmentBrain.sh".to_string()
}

fn default_reference_gain() -> f64 {
    101.0
}

impl Default for RatioConfig {
    fn default() -> Self {
        Self {
            segmentation_script: default_segmentation_script(),
            reference_gain: default_reference_gain(),
        }
    }
}

/// Configuration for slice animations.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AnimationConfig {
    /// Coronal slice index (y axis)
    #[serde(default = "default_slice_index")]
    pub slice_index: usize,

    /// Number of frames rendered
    #[serde(default = "default_frames")]
    pub frames: usize,

    /// Delay between frames in milliseconds
    #[serde(default = "default_frame_delay")]
    pub frame_delay_ms: u32,

    /// Pixel size of one voxel in the output
    #[serde(default = "default_voxel_scale")]
    pub voxel_scale: u32,
}

fn default_slice_index() -> usize {
    40
}

fn default_frames() -> usize {
    10
}

fn default_frame_delay() -> u32 {
    500
}

fn default_voxel_scale() -> u32 {
    8
}

impl Default for AnimationConfig {
    fn default() -> Self {
        Self {
            slice_index: default_slice_index(),
            frames: default_frames(),
            frame_delay_ms: default_frame_delay(),
            voxel_scale: default_voxel_scale(),
        }
    }
}

/// Main pipeline configuration combining all sub-configs.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct PipelineConfig {
    #[serde(default)]
    pub motion_correction: MotionCorrectionConfig,

    #[serde(default)]
    pub analysis: AnalysisConfig,

    #[serde(default)]
    pub datasets: DatasetConfig,

    #[serde(default)]
    pub plots: PlotConfig,

    #[serde(default)]
    pub ratios: RatioConfig,

    #[serde(default)]
    pub animation: AnimationConfig,
}

impl PipelineConfig {
    /// Load configuration from a YAML file.
    pub fn from_yaml<P: AsRef<Path>>(path: P) -> Result<Self, Box<dyn std::error::Error>> {
        let content = std::fs::read_to_string(path)?;
        let config: PipelineConfig = serde_yaml::from_str(&content)?;
        Ok(config)
    }

    /// Save configuration to a YAML file.
    pub fn to_yaml<P: AsRef<Path>>(&self, path: P) -> Result<(), Box<dyn std::error::Error>> {
        let content = serde_yaml::to_string(self)?;
        std::fs::write(path, content)?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[test]
    fn test_default_motion_correction_config() {
        let config = MotionCorrectionConfig::default();
        assert_eq!(config.executable, "antsMotionCorr");
        assert_eq!(config.averaging_frames_cap, 10);
        assert_eq!(config.iterations, "50x20");
    }

    #[test]
    fn test_default_dataset_config() {
        let config = DatasetConfig::default();
        assert_eq!(config.drift_datasets.len(), 2);
        assert_eq!(config.colors.get("rabies_7_Cryo_aw_f"), Some(&[255, 0, 0]));
        assert_eq!(config.dataset_depth, 4);
    }

    #[test]
    fn test_partial_yaml_uses_defaults() {
        let yaml = "analysis:\n  algorithm_version: old\nplots:\n  histogram_bins: 12\n";
        let config: PipelineConfig = serde_yaml::from_str(yaml).unwrap();
        assert_eq!(config.analysis.algorithm_version, "old");
        assert_eq!(config.analysis.session, "ses-1");
        assert_eq!(config.plots.histogram_bins, 12);
        assert_eq!(config.ratios.reference_gain, 101.0);
    }

    #[test]
    fn test_yaml_file_roundtrip() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("config.yaml");
        let mut config = PipelineConfig::default();
        config.animation.frames = 4;
        config.to_yaml(&path).unwrap();

        let loaded = PipelineConfig::from_yaml(&path).unwrap();
        assert_eq!(loaded.animation.frames, 4);
        assert_eq!(loaded.motion_correction.metric_bins, 20);
    }
}
