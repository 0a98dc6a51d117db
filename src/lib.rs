//! Head motion correction analysis for fMRI datasets.
//!
//! This crate provides tools for:
//! - Running ANTs motion correction over BIDS-like subject folders
//! - Measuring parameter drift, framewise displacement and signal spread
//! - Combining per-subject results and charting version comparisons
//! - Computing receiver gain intensity ratios
//! - Animating a coronal slice of a 4D series
//!
//! # Example
//!
//! ```no_run
//! use hmc_analysis::{core::loaders::load_motion_parameters, core::stats::framewise_displacement};
//!
//! let params = load_motion_parameters("motcorrMOCOparams.csv").unwrap();
//! let fd = framewise_displacement(&params, 50.0);
//! ```

pub mod cli;
pub mod config;
pub mod core;
pub mod processors;
pub mod visualization;

pub use config::{
    AnalysisConfig, AnimationConfig, DatasetConfig, MotionCorrectionConfig, PipelineConfig,
    PlotConfig, RatioConfig,
};
pub use core::loaders::{AnalysisRecord, MotionParameters};

/// Crate version
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
