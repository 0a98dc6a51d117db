//! Command-line interface for the head motion correction analysis.

use clap::{Parser, Subcommand};
use indicatif::{ProgressBar, ProgressStyle};
use log::{error, info, warn};
use std::path::{Path, PathBuf};
use std::time::Instant;

use crate::processors::analysis::BatchOptions;
use crate::PipelineConfig;

#[derive(Parser)]
#[command(name = "hmc-analysis")]
#[command(about = "fMRI head motion correction analysis", version)]
pub struct Cli {
    /// Path to YAML config file
    #[arg(short, long, global = true)]
    config: Option<PathBuf>,

    /// Increase verbosity
    #[arg(short, long, action = clap::ArgAction::Count, global = true)]
    verbose: u8,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Run motion correction on every subject, then analyse it
    Correct {
        /// Dataset directory containing sub-* folders
        input_dir: PathBuf,
        /// Output directory, one folder per subject
        output_dir: PathBuf,
        /// Brain mask used for the signal summary
        #[arg(short, long)]
        mask: Option<PathBuf>,
        /// Algorithm version tag written to the results
        #[arg(long)]
        version_tag: Option<String>,
    },

    /// Analyse subjects whose correction outputs already exist
    Analyze {
        /// Dataset directory containing sub-* folders
        input_dir: PathBuf,
        /// Directory holding the per-subject correction outputs
        output_dir: PathBuf,
        /// Brain mask used for the signal summary
        #[arg(short, long)]
        mask: Option<PathBuf>,
        /// Algorithm version tag written to the results
        #[arg(long)]
        version_tag: Option<String>,
    },

    /// Combine analysis results across datasets and render comparison charts
    Aggregate {
        /// Directory searched recursively for analysis_data.csv files
        input_dir: PathBuf,
        /// Output directory for the combined table and charts
        output_dir: PathBuf,
        /// Use an existing combined table instead of searching input_dir
        #[arg(long)]
        table: Option<PathBuf>,
    },

    /// Compute receiver gain intensity ratios
    Ratios {
        /// CSV scan list with file_name and rg_value columns
        scan_list: PathBuf,
        /// Output directory
        #[arg(short, long, default_value = "output")]
        output_dir: PathBuf,
        /// Brain mask applied to every gain (skips segmentation)
        #[arg(short, long)]
        mask: Option<PathBuf>,
        /// Gain the others are compared against
        #[arg(long)]
        reference_gain: Option<f64>,
    },

    /// Animate a coronal slice of a 4D series as a GIF
    Animate {
        /// 4D NIfTI series, or a headerless CSV time x voxel matrix with --mask
        input: PathBuf,
        /// Output GIF file path (defaults to the input name with .gif)
        #[arg(short, long)]
        output: Option<PathBuf>,
        /// Mask selecting the voxels of a CSV matrix
        #[arg(short, long)]
        mask: Option<PathBuf>,
        /// Coronal slice index
        #[arg(long)]
        slice: Option<usize>,
        /// Number of frames to render
        #[arg(long)]
        frames: Option<usize>,
        /// Delay between frames in milliseconds
        #[arg(long)]
        delay: Option<u32>,
    },
}

/// Create a spinner for indeterminate operations
fn create_spinner(message: &str) -> ProgressBar {
    let pb = ProgressBar::new_spinner();
    pb.set_style(
        ProgressStyle::default_spinner()
            .template("{spinner:.green} {msg}")
            .unwrap(),
    );
    pb.set_message(message.to_string());
    pb.enable_steady_tick(std::time::Duration::from_millis(100));
    pb
}

/// Print a summary box
fn print_summary(title: &str, items: &[(&str, String)]) {
    println!();
    println!("╔══════════════════════════════════════════════════════════════╗");
    println!("║ {:<62} ║", title);
    println!("╠══════════════════════════════════════════════════════════════╣");
    for (key, value) in items {
        let display_value = if value.chars().count() > 39 {
            let head: String = value.chars().take(36).collect();
            format!("{}...", head)
        } else {
            value.clone()
        };
        println!("║ {:<20}: {:<39} ║", key, display_value);
    }
    println!("╚══════════════════════════════════════════════════════════════╝");
    println!();
}

pub fn run() {
    let cli = Cli::parse();

    // Initialize logging based on verbosity (must come first)
    env_logger::Builder::new()
        .filter_level(match cli.verbose {
            0 => log::LevelFilter::Warn,
            1 => log::LevelFilter::Info,
            _ => log::LevelFilter::Debug,
        })
        .format_timestamp_secs()
        .init();

    // Load config
    let mut config = match &cli.config {
        Some(path) => match PipelineConfig::from_yaml(path) {
            Ok(cfg) => {
                info!("Loaded config from: {}", path.display());
                cfg
            }
            Err(e) => {
                warn!("Failed to load config from {}: {}, using defaults", path.display(), e);
                PipelineConfig::default()
            }
        },
        None => PipelineConfig::default(),
    };

    // Dispatch to subcommands
    match cli.command {
        Commands::Correct { input_dir, output_dir, mask, version_tag } => {
            if let Some(tag) = version_tag {
                config.analysis.algorithm_version = tag;
            }
            cmd_process(&input_dir, &output_dir, BatchOptions { correct: true, mask }, &config);
        }
        Commands::Analyze { input_dir, output_dir, mask, version_tag } => {
            if let Some(tag) = version_tag {
                config.analysis.algorithm_version = tag;
            }
            cmd_process(&input_dir, &output_dir, BatchOptions { correct: false, mask }, &config);
        }
        Commands::Aggregate { input_dir, output_dir, table } => {
            cmd_aggregate(&input_dir, &output_dir, table, &config);
        }
        Commands::Ratios { scan_list, output_dir, mask, reference_gain } => {
            if let Some(gain) = reference_gain {
                config.ratios.reference_gain = gain;
            }
            cmd_ratios(&scan_list, &output_dir, mask, &config);
        }
        Commands::Animate { input, output, mask, slice, frames, delay } => {
            if let Some(slice) = slice {
                config.animation.slice_index = slice;
            }
            if let Some(frames) = frames {
                config.animation.frames = frames;
            }
            if let Some(delay) = delay {
                config.animation.frame_delay_ms = delay;
            }
            cmd_animate(&input, output, mask, &config);
        }
    }
}

fn cmd_process(input_dir: &Path, output_dir: &Path, options: BatchOptions, config: &PipelineConfig) {
    use crate::processors::analysis;

    let start = Instant::now();

    println!(
        "{} subjects...",
        if options.correct { "Correcting and analysing" } else { "Analysing" }
    );
    println!("Input directory: {}", input_dir.display());
    println!("Output directory: {}", output_dir.display());
    println!("Algorithm version: {}", config.analysis.algorithm_version);
    if let Some(mask) = &options.mask {
        println!("Mask: {}", mask.display());
    }

    let spinner = create_spinner("Processing subjects...");

    match analysis::process_dataset(input_dir, output_dir, config, &options) {
        Ok(summary) => {
            spinner.finish_and_clear();

            for (subject, reason) in &summary.failures {
                println!("  {} failed: {}", subject, reason);
            }

            let mut items = vec![
                ("Input directory", input_dir.display().to_string()),
                ("Subjects found", summary.subjects.to_string()),
                ("Analysed", summary.records.len().to_string()),
                ("Failed", summary.failures.len().to_string()),
            ];
            if options.correct {
                items.push(("Corrected", summary.corrected.to_string()));
                items.push(("Reused outputs", summary.reused.to_string()));
            }
            items.push(("Duration", format!("{:.2?}", start.elapsed())));

            print_summary("Head Motion Analysis Complete", &items);

            if summary.records.is_empty() && summary.subjects > 0 {
                error!("No subject could be analysed");
                std::process::exit(1);
            }
        }
        Err(e) => {
            spinner.finish_and_clear();
            error!("Processing failed: {:#}", e);
            std::process::exit(1);
        }
    }
}

fn cmd_aggregate(input_dir: &Path, output_dir: &Path, table: Option<PathBuf>, config: &PipelineConfig) {
    use crate::core::loaders;
    use crate::processors::aggregate;

    let start = Instant::now();

    println!("Aggregating analysis results...");
    println!("Input directory: {}", input_dir.display());
    println!("Output directory: {}", output_dir.display());

    let spinner = create_spinner("Collecting results...");

    let records = match &table {
        Some(path) => loaders::load_analysis_table(path)
            .map_err(|e| anyhow::anyhow!("Failed to read {}: {}", path.display(), e)),
        None => aggregate::combine_results(input_dir, output_dir, config),
    };
    let records = match records {
        Ok(r) => r,
        Err(e) => {
            spinner.finish_and_clear();
            error!("Aggregation failed: {:#}", e);
            std::process::exit(1);
        }
    };

    spinner.set_message("Rendering charts...");

    match aggregate::present_analysis(&records, output_dir, config) {
        Ok(charts) => {
            spinner.finish_and_clear();

            let chart_names: Vec<String> = charts
                .iter()
                .filter_map(|p| p.file_name().map(|n| n.to_string_lossy().into_owned()))
                .collect();

            print_summary(
                "Aggregation Complete",
                &[
                    ("Subjects", records.len().to_string()),
                    ("Versions", aggregate::versions(&records).join(", ")),
                    ("Charts written", charts.len().to_string()),
                    ("Charts", chart_names.join(", ")),
                    ("Output directory", output_dir.display().to_string()),
                    ("Duration", format!("{:.2?}", start.elapsed())),
                ],
            );
        }
        Err(e) => {
            spinner.finish_and_clear();
            error!("Rendering failed: {:#}", e);
            std::process::exit(1);
        }
    }
}

fn cmd_ratios(scan_list: &Path, output_dir: &Path, mask: Option<PathBuf>, config: &PipelineConfig) {
    use crate::processors::ratios;

    let start = Instant::now();

    println!("Computing receiver gain ratios...");
    println!("Scan list: {}", scan_list.display());
    println!("Output directory: {}", output_dir.display());
    println!("Reference gain: {}", config.ratios.reference_gain);
    match &mask {
        Some(path) => println!("Mask: {}", path.display()),
        None => println!("Segmentation script: {}", config.ratios.segmentation_script),
    }

    let spinner = create_spinner("Averaging scans per gain...");

    match ratios::find_ratios(scan_list, output_dir, mask.as_deref(), &config.ratios) {
        Ok(report) => {
            spinner.finish_and_clear();

            println!("{}", ratios::format_ratio_table(&report.ratios));

            print_summary(
                "Gain Ratios Complete",
                &[
                    ("Averaged volumes", report.averages.len().to_string()),
                    ("Ratios", report.ratios.len().to_string()),
                    ("Ratio table", report.table.display().to_string()),
                    ("Duration", format!("{:.2?}", start.elapsed())),
                ],
            );
        }
        Err(e) => {
            spinner.finish_and_clear();
            error!("Ratio computation failed: {:#}", e);
            std::process::exit(1);
        }
    }
}

fn load_series(input: &Path, mask: Option<&Path>) -> anyhow::Result<ndarray::ArrayD<f32>> {
    use crate::core::{imaging, loaders};
    use anyhow::Context;

    match mask {
        Some(mask_path) => {
            let rows = loaders::load_series_matrix(input)
                .with_context(|| format!("Failed to read {}", input.display()))?;
            let mask = imaging::load_volume(mask_path)?;
            Ok(imaging::unmask_series(&rows, mask.data.view())?)
        }
        None => Ok(imaging::load_volume(input)?.data),
    }
}

fn cmd_animate(input: &Path, output: Option<PathBuf>, mask: Option<PathBuf>, config: &PipelineConfig) {
    use crate::visualization::animation;

    let start = Instant::now();
    let settings = &config.animation;

    // Default output next to the input
    let output_path = output.unwrap_or_else(|| {
        let name = input
            .file_name()
            .map(|n| n.to_string_lossy().to_string())
            .unwrap_or_else(|| "series".to_string());
        let stem = name.trim_end_matches(".gz").trim_end_matches(".nii").trim_end_matches(".csv");
        input.with_file_name(format!("{}.gif", stem))
    });

    println!("Animating coronal slice...");
    println!("Input: {}", input.display());
    println!("Output: {}", output_path.display());
    println!("Slice: {}", settings.slice_index);
    println!("Frames: {}", settings.frames);

    let spinner = create_spinner("Loading series...");

    let series = match load_series(input, mask.as_deref()) {
        Ok(s) => s,
        Err(e) => {
            spinner.finish_and_clear();
            error!("Failed to load series: {:#}", e);
            std::process::exit(1);
        }
    };

    spinner.set_message("Rendering frames...");

    match animation::render_coronal_animation(
        &output_path,
        series.view(),
        settings.slice_index,
        settings.frames,
        settings.frame_delay_ms,
        settings.voxel_scale,
    ) {
        Ok(frames) => {
            spinner.finish_and_clear();

            print_summary(
                "Animation Complete",
                &[
                    ("Input file", input.display().to_string()),
                    ("Output GIF", output_path.display().to_string()),
                    ("Series shape", format!("{:?}", series.shape())),
                    ("Frames written", frames.to_string()),
                    ("Duration", format!("{:.2?}", start.elapsed())),
                ],
            );
        }
        Err(e) => {
            spinner.finish_and_clear();
            error!("Animation failed: {}", e);
            std::process::exit(1);
        }
    }
}
