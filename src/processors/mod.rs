//! Data processing modules.

pub mod aggregate;
pub mod analysis;
pub mod discovery;
pub mod external;
pub mod motion_correction;
pub mod ratios;

// Re-export key types for convenience
pub use aggregate::{combine_results, present_analysis, AggregateError};
pub use analysis::{
    analyze_subject, process_dataset, BatchOptions, BatchSummary, SubjectInputs, AnalysisError,
};
pub use discovery::{find_subjects, DiscoveryError, Subject, SubjectFiles};
pub use external::ExternalError;
pub use motion_correction::{
    run_motion_correction, CorrectionStatus, MotionCorrectionError, MotionCorrectionOutputs,
};
pub use ratios::{find_ratios, GainRatio, RatioError, RatioReport};
