//! Core data types, statistics and I/O operations.

pub mod imaging;
pub mod loaders;
pub mod stats;
pub mod writers;

pub use loaders::{AnalysisRecord, MotionAxis, MotionParameters, ScanSidecar};
pub use stats::LinearTrend;
pub use writers::{write_analysis_csv, write_records, write_trends_csv, WriteError};
