//! Chart rendering for motion and drift analyses.
//!
//! All charts are PNG files drawn with plotters on a bitmap backend:
//! per-subject motion traces, drift scatter panels across datasets and
//! histogram/box-plot comparisons between algorithm versions.

pub mod animation;

use std::collections::{BTreeMap, HashMap};
use std::path::Path;

use plotters::coord::Shift;
use plotters::prelude::*;
use plotters_bitmap::BitMapBackend;
use thiserror::Error;

use crate::core::loaders::{AnalysisRecord, MotionAxis, MotionParameters};
use crate::core::stats;

/// Errors that can occur during visualization.
#[derive(Error, Debug)]
pub enum VisualizationError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Plotting error: {0}")]
    PlottingError(String),

    #[error("Nothing to plot: {0}")]
    EmptyData(String),

    #[error("Invalid input: {0}")]
    InvalidInput(String),
}

/// Result type for visualization operations.
pub type Result<T> = std::result::Result<T, VisualizationError>;

type Panel<'a> = DrawingArea<BitMapBackend<'a>, Shift>;

fn plotting_error<E: std::fmt::Display>(e: E) -> VisualizationError {
    VisualizationError::PlottingError(e.to_string())
}

/// Scan property used as the abscissa of drift scatter plots.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ScanProperty {
    VoxelVolume,
    RepetitionTime,
    EchoTime,
}

impl ScanProperty {
    pub const ALL: [ScanProperty; 3] = [
        ScanProperty::VoxelVolume,
        ScanProperty::RepetitionTime,
        ScanProperty::EchoTime,
    ];

    /// Axis title.
    pub fn label(self) -> &'static str {
        match self {
            ScanProperty::VoxelVolume => "Pixel Volume (mm^3)",
            ScanProperty::RepetitionTime => "Repetition Time (s)",
            ScanProperty::EchoTime => "Echo Time (s)",
        }
    }

    fn caption_name(self) -> &'static str {
        match self {
            ScanProperty::VoxelVolume => "pixel volume",
            ScanProperty::RepetitionTime => "repetition time",
            ScanProperty::EchoTime => "echo time",
        }
    }

    /// Value of the property for one subject, `None` when unknown.
    pub fn value(self, record: &AnalysisRecord) -> Option<f64> {
        let v = match self {
            ScanProperty::VoxelVolume => Some(record.voxel_volume),
            ScanProperty::RepetitionTime => Some(record.repetition_time),
            ScanProperty::EchoTime => record.echo_time,
        };
        v.filter(|x| x.is_finite())
    }
}

/// Points of one legend entry in a scatter panel.
#[derive(Debug, Clone)]
pub struct ScatterSeries {
    pub label: String,
    pub color: RGBColor,
    pub points: Vec<(f64, f64)>,
}

/// Colour of `name`, taken from `colors` or from the palette by `index`.
pub fn series_color(colors: &HashMap<String, [u8; 3]>, name: &str, index: usize) -> RGBColor {
    match colors.get(name) {
        Some(&[r, g, b]) => RGBColor(r, g, b),
        None => {
            let c = Palette99::pick(index).to_rgba();
            RGBColor(c.0, c.1, c.2)
        }
    }
}

/// Padded axis range of the values, (0, 1) when there are none.
fn padded_range(values: &[f64]) -> (f64, f64) {
    match stats::shared_range(&[values]) {
        Some((lo, hi)) => {
            let pad = (hi - lo) * 0.05;
            (lo - pad, hi + pad)
        }
        None => (0.0, 1.0),
    }
}

fn draw_scatter_panel(
    area: &Panel<'_>,
    caption: &str,
    x_desc: &str,
    y_desc: &str,
    series: &[ScatterSeries],
) -> Result<()> {
    let xs: Vec<f64> = series.iter().flat_map(|s| s.points.iter().map(|p| p.0)).collect();
    let ys: Vec<f64> = series.iter().flat_map(|s| s.points.iter().map(|p| p.1)).collect();
    let (x_min, x_max) = padded_range(&xs);
    let (y_min, y_max) = padded_range(&ys);

    let mut chart = ChartBuilder::on(area)
        .caption(caption, ("sans-serif", 16))
        .margin(10)
        .x_label_area_size(40)
        .y_label_area_size(60)
        .build_cartesian_2d(x_min..x_max, y_min..y_max)
        .map_err(plotting_error)?;

    chart
        .configure_mesh()
        .x_desc(x_desc)
        .y_desc(y_desc)
        .draw()
        .map_err(plotting_error)?;

    for s in series {
        let color = s.color;
        chart
            .draw_series(
                s.points
                    .iter()
                    .filter(|(x, y)| x.is_finite() && y.is_finite())
                    .map(|&(x, y)| Circle::new((x, y), 4, color.filled())),
            )
            .map_err(plotting_error)?
            .label(s.label.clone())
            .legend(move |(x, y)| Circle::new((x, y), 4, color.filled()));
    }

    if !series.is_empty() {
        chart
            .configure_series_labels()
            .background_style(WHITE.mix(0.8))
            .border_style(BLACK)
            .draw()
            .map_err(plotting_error)?;
    }

    Ok(())
}

fn draw_trace_panel(
    area: &Panel<'_>,
    caption: &str,
    y_desc: &str,
    traces: &[(&str, &[f64])],
) -> Result<()> {
    let frames = traces.iter().map(|(_, v)| v.len()).max().unwrap_or(0);
    let all: Vec<f64> = traces.iter().flat_map(|(_, v)| v.iter().copied()).collect();
    let (y_min, y_max) = padded_range(&all);
    let x_max = (frames.max(2) - 1) as f64;

    let mut chart = ChartBuilder::on(area)
        .caption(caption, ("sans-serif", 16))
        .margin(10)
        .x_label_area_size(40)
        .y_label_area_size(60)
        .build_cartesian_2d(0.0..x_max, y_min..y_max)
        .map_err(plotting_error)?;

    chart
        .configure_mesh()
        .x_desc("Frame")
        .y_desc(y_desc)
        .draw()
        .map_err(plotting_error)?;

    for (i, (label, values)) in traces.iter().enumerate() {
        let color = Palette99::pick(i).mix(0.9);
        chart
            .draw_series(LineSeries::new(
                values.iter().enumerate().map(|(t, &v)| (t as f64, v)),
                &color,
            ))
            .map_err(plotting_error)?
            .label(label.to_string())
            .legend(move |(x, y)| PathElement::new(vec![(x, y), (x + 20, y)], color));

        // fitted trend over the same frames
        if let Ok(trend) = stats::linear_fit(values) {
            let end = (values.len() - 1) as f64;
            chart
                .draw_series(std::iter::once(PathElement::new(
                    vec![(0.0, trend.at(0.0)), (end, trend.at(end))],
                    color.mix(0.4).stroke_width(2),
                )))
                .map_err(plotting_error)?;
        }
    }

    chart
        .configure_series_labels()
        .background_style(WHITE.mix(0.8))
        .border_style(BLACK)
        .draw()
        .map_err(plotting_error)?;

    Ok(())
}

/// Plot one subject's motion parameters and framewise displacement.
///
/// Three stacked panels (rotations, translations, framewise displacement),
/// each trace overlaid with its least-squares trend line.
pub fn plot_motion_parameters(
    output_path: &Path,
    params: &MotionParameters,
    framewise: &[f64],
    size: (u32, u32),
) -> Result<()> {
    if params.is_empty() {
        return Err(VisualizationError::EmptyData("motion parameters".to_string()));
    }

    let series: Vec<(MotionAxis, Vec<f64>)> = MotionAxis::ALL
        .iter()
        .map(|&axis| (axis, params.series(axis)))
        .collect();
    let rotations: Vec<(&str, &[f64])> = series
        .iter()
        .filter(|(axis, _)| axis.is_rotation())
        .map(|(axis, v)| (axis.label(), v.as_slice()))
        .collect();
    let translations: Vec<(&str, &[f64])> = series
        .iter()
        .filter(|(axis, _)| !axis.is_rotation())
        .map(|(axis, v)| (axis.label(), v.as_slice()))
        .collect();

    let root = BitMapBackend::new(output_path, (size.0, size.1 * 3)).into_drawing_area();
    root.fill(&WHITE).map_err(plotting_error)?;
    let panels = root.split_evenly((3, 1));

    draw_trace_panel(&panels[0], "Rotation", "Rotation (rad)", &rotations)?;
    draw_trace_panel(&panels[1], "Translation", "Translation (mm)", &translations)?;
    draw_trace_panel(
        &panels[2],
        "Framewise displacement",
        "Displacement (mm)",
        &[("Framewise", framewise)],
    )?;

    root.present().map_err(plotting_error)?;
    Ok(())
}

/// Group records by dataset, in name order.
fn by_dataset<'a>(records: &'a [AnalysisRecord]) -> BTreeMap<&'a str, Vec<&'a AnalysisRecord>> {
    let mut groups: BTreeMap<&str, Vec<&AnalysisRecord>> = BTreeMap::new();
    for record in records {
        let name = record.dataset.as_deref().unwrap_or("unknown");
        groups.entry(name).or_default().push(record);
    }
    groups
}

/// Drift of every axis against every scan property, all datasets pooled.
///
/// One row of three panels; each subject contributes one point per axis.
pub fn plot_drift_overview(
    output_path: &Path,
    records: &[AnalysisRecord],
    colors: &HashMap<String, [u8; 3]>,
    size: (u32, u32),
) -> Result<()> {
    if records.is_empty() {
        return Err(VisualizationError::EmptyData("drift overview".to_string()));
    }
    let groups = by_dataset(records);

    let root = BitMapBackend::new(output_path, (size.0 * 3, size.1)).into_drawing_area();
    root.fill(&WHITE).map_err(plotting_error)?;
    let panels = root.split_evenly((1, 3));

    for (panel, property) in panels.iter().zip(ScanProperty::ALL) {
        let series: Vec<ScatterSeries> = groups
            .iter()
            .enumerate()
            .map(|(i, (name, group))| ScatterSeries {
                label: name.to_string(),
                color: series_color(colors, name, i),
                points: group
                    .iter()
                    .filter_map(|r| property.value(r).map(|x| (x, r)))
                    .flat_map(|(x, r)| {
                        r.rotation_drifts()
                            .into_iter()
                            .chain(r.translation_drifts())
                            .map(move |d| (x, d))
                    })
                    .collect(),
            })
            .collect();

        draw_scatter_panel(
            panel,
            &format!("Estimated drift according to {}", property.caption_name()),
            property.label(),
            "Drift Magnitude",
            &series,
        )?;
    }

    root.present().map_err(plotting_error)?;
    Ok(())
}

/// Rotation and translation drift against each scan property.
///
/// A 2×3 grid: rows are rotation and translation, columns the scan
/// properties. Only the listed `datasets` are drawn, one series each.
pub fn plot_drift_grid(
    output_path: &Path,
    records: &[AnalysisRecord],
    datasets: &[String],
    colors: &HashMap<String, [u8; 3]>,
    size: (u32, u32),
) -> Result<()> {
    if records.is_empty() {
        return Err(VisualizationError::EmptyData("drift grid".to_string()));
    }

    let root = BitMapBackend::new(output_path, (size.0 * 3, size.1 * 2)).into_drawing_area();
    root.fill(&WHITE).map_err(plotting_error)?;
    let panels = root.split_evenly((2, 3));

    let kinds: [(&str, fn(&AnalysisRecord) -> [f64; 3]); 2] = [
        ("Rotation", AnalysisRecord::rotation_drifts),
        ("Translation", AnalysisRecord::translation_drifts),
    ];

    for (row, (kind, drifts)) in kinds.iter().enumerate() {
        for (col, property) in ScanProperty::ALL.iter().enumerate() {
            let series: Vec<ScatterSeries> = datasets
                .iter()
                .enumerate()
                .map(|(i, name)| ScatterSeries {
                    label: name.clone(),
                    color: series_color(colors, name, i),
                    points: records
                        .iter()
                        .filter(|r| r.dataset.as_deref() == Some(name.as_str()))
                        .filter_map(|r| property.value(r).map(|x| (x, drifts(r))))
                        .flat_map(|(x, d)| d.into_iter().map(move |v| (x, v)))
                        .collect(),
                })
                .collect();

            draw_scatter_panel(
                &panels[row * 3 + col],
                &format!(
                    "Estimated {} drift according to {}",
                    kind,
                    property.caption_name()
                ),
                property.label(),
                &format!("{} Drift Magnitude", kind),
                &series,
            )?;
        }
    }

    root.present().map_err(plotting_error)?;
    Ok(())
}

/// Titles of a version comparison chart.
#[derive(Debug, Clone, Copy)]
pub struct ComparisonLabels<'a> {
    /// Quantity being compared, e.g. "Framewise displacement drift"
    pub metric: &'a str,
    /// Population description used in the captions
    pub subject: &'a str,
}

/// Histogram and box plot of one metric for every algorithm version.
///
/// Histograms share one bin range so the versions overlay directly.
pub fn plot_version_comparison(
    output_path: &Path,
    groups: &[(String, Vec<f64>)],
    labels: ComparisonLabels<'_>,
    bins: usize,
    size: (u32, u32),
) -> Result<()> {
    let slices: Vec<&[f64]> = groups.iter().map(|(_, v)| v.as_slice()).collect();
    let range = stats::shared_range(&slices)
        .ok_or_else(|| VisualizationError::EmptyData(labels.metric.to_string()))?;

    let root = BitMapBackend::new(output_path, (size.0 * 2, size.1)).into_drawing_area();
    root.fill(&WHITE).map_err(plotting_error)?;
    let panels = root.split_evenly((1, 2));

    draw_histogram_panel(&panels[0], groups, labels, bins, range)?;
    draw_box_panel(&panels[1], groups, labels, range)?;

    root.present().map_err(plotting_error)?;
    Ok(())
}

fn draw_histogram_panel(
    area: &Panel<'_>,
    groups: &[(String, Vec<f64>)],
    labels: ComparisonLabels<'_>,
    bins: usize,
    range: (f64, f64),
) -> Result<()> {
    let bins = bins.max(1);
    let counts: Vec<Vec<usize>> = groups
        .iter()
        .map(|(_, v)| stats::histogram(v, bins, range))
        .collect();
    let y_max = counts.iter().flatten().copied().max().unwrap_or(0).max(1) as f64;
    let width = (range.1 - range.0) / bins as f64;

    let mut chart = ChartBuilder::on(area)
        .caption(
            format!("Distribution of {} {}", labels.metric.to_lowercase(), labels.subject),
            ("sans-serif", 16),
        )
        .margin(10)
        .x_label_area_size(40)
        .y_label_area_size(60)
        .build_cartesian_2d(range.0..range.1, 0.0..(y_max * 1.1))
        .map_err(plotting_error)?;

    chart
        .configure_mesh()
        .x_desc(labels.metric)
        .y_desc("Count")
        .draw()
        .map_err(plotting_error)?;

    for (i, ((name, _), hist)) in groups.iter().zip(counts.iter()).enumerate() {
        let color = Palette99::pick(i).mix(0.5);
        chart
            .draw_series(hist.iter().enumerate().filter(|(_, c)| **c > 0).map(|(b, &c)| {
                let x0 = range.0 + b as f64 * width;
                Rectangle::new([(x0, 0.0), (x0 + width, c as f64)], color.filled())
            }))
            .map_err(plotting_error)?
            .label(name.clone())
            .legend(move |(x, y)| Rectangle::new([(x, y - 5), (x + 15, y + 5)], color.filled()));
    }

    chart
        .configure_series_labels()
        .background_style(WHITE.mix(0.8))
        .border_style(BLACK)
        .draw()
        .map_err(plotting_error)?;

    Ok(())
}

fn draw_box_panel(
    area: &Panel<'_>,
    groups: &[(String, Vec<f64>)],
    labels: ComparisonLabels<'_>,
    range: (f64, f64),
) -> Result<()> {
    let pad = (range.1 - range.0) * 0.1;
    let (y_min, y_max) = (range.0 - pad, range.1 + pad);
    let n = groups.len().max(1) as f64;

    let mut chart = ChartBuilder::on(area)
        .caption(
            format!("Boxplot of {} {}", labels.metric.to_lowercase(), labels.subject),
            ("sans-serif", 16),
        )
        .margin(10)
        .x_label_area_size(40)
        .y_label_area_size(60)
        .build_cartesian_2d(-0.5..(n - 0.5), y_min..y_max)
        .map_err(plotting_error)?;

    chart
        .configure_mesh()
        .disable_x_mesh()
        .x_labels(0)
        .x_desc("Algorithm version")
        .y_desc(labels.metric)
        .draw()
        .map_err(plotting_error)?;

    for (i, (name, values)) in groups.iter().enumerate() {
        let Some(summary) = stats::box_summary(values) else {
            continue;
        };
        let x = i as f64;
        let color = Palette99::pick(i);

        chart
            .draw_series([
                Rectangle::new([(x - 0.25, summary.q1), (x + 0.25, summary.q3)], color.mix(0.3).filled()),
                Rectangle::new([(x - 0.25, summary.q1), (x + 0.25, summary.q3)], BLACK.stroke_width(1)),
            ])
            .map_err(plotting_error)?;

        chart
            .draw_series([
                PathElement::new(vec![(x - 0.25, summary.median), (x + 0.25, summary.median)], BLACK.stroke_width(2)),
                PathElement::new(vec![(x, summary.q3), (x, summary.upper_whisker)], BLACK.stroke_width(1)),
                PathElement::new(vec![(x, summary.q1), (x, summary.lower_whisker)], BLACK.stroke_width(1)),
                PathElement::new(
                    vec![(x - 0.1, summary.upper_whisker), (x + 0.1, summary.upper_whisker)],
                    BLACK.stroke_width(1),
                ),
                PathElement::new(
                    vec![(x - 0.1, summary.lower_whisker), (x + 0.1, summary.lower_whisker)],
                    BLACK.stroke_width(1),
                ),
            ])
            .map_err(plotting_error)?;

        // outliers beyond the whiskers
        chart
            .draw_series(
                values
                    .iter()
                    .filter(|&&v| v < summary.lower_whisker || v > summary.upper_whisker)
                    .map(|&v| Circle::new((x, v), 3, BLACK.stroke_width(1))),
            )
            .map_err(plotting_error)?;

        chart
            .draw_series(std::iter::once(Text::new(
                name.clone(),
                (x - 0.1, y_min + pad * 0.3),
                ("sans-serif", 15).into_font(),
            )))
            .map_err(plotting_error)?;
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn record(dataset: &str, version: &str, drift: f64) -> AnalysisRecord {
        AnalysisRecord {
            subject_id: "001".to_string(),
            voxel_volume: 0.125,
            repetition_time: 1.0,
            echo_time: None,
            drift_rotation_x: drift,
            drift_rotation_y: drift,
            drift_rotation_z: drift,
            drift_translation_x: drift,
            drift_translation_y: drift,
            drift_translation_z: drift,
            drift_framewise: drift,
            framewise_std: 0.1,
            mean_std_difference: 2.0,
            algorithm_version: version.to_string(),
            dataset: Some(dataset.to_string()),
        }
    }

    #[test]
    fn test_scan_property_values() {
        let r = record("a", "new", 0.5);
        assert_eq!(ScanProperty::VoxelVolume.value(&r), Some(0.125));
        assert_eq!(ScanProperty::RepetitionTime.value(&r), Some(1.0));
        assert_eq!(ScanProperty::EchoTime.value(&r), None);
    }

    #[test]
    fn test_series_color_fallback() {
        let mut colors = HashMap::new();
        colors.insert("a".to_string(), [255, 0, 0]);
        assert_eq!(series_color(&colors, "a", 3), RGBColor(255, 0, 0));
        let c = Palette99::pick(1).to_rgba();
        assert_eq!(series_color(&colors, "b", 1), RGBColor(c.0, c.1, c.2));
    }

    #[test]
    fn test_plot_motion_parameters_writes_png() {
        let temp_dir = TempDir::new().unwrap();
        let path = temp_dir.path().join("motion.png");
        let params = MotionParameters {
            frames: (0..20)
                .map(|i| {
                    let v = i as f64 * 0.01;
                    [v, -v, 0.0, v * 10.0, 0.0, -v * 5.0]
                })
                .collect(),
        };
        let fd = stats::framewise_displacement(&params, 50.0);

        plot_motion_parameters(&path, &params, &fd, (320, 200)).unwrap();
        assert!(path.exists());
    }

    #[test]
    fn test_plot_drift_charts_write_png() {
        let temp_dir = TempDir::new().unwrap();
        let records = vec![
            record("rabies_7_Cryo_med_f1", "new", 0.1),
            record("rabies_7_Cryo_med_f2", "new", 0.3),
        ];
        let colors = HashMap::new();

        let overview = temp_dir.path().join("overview.png");
        plot_drift_overview(&overview, &records, &colors, (320, 200)).unwrap();
        assert!(overview.exists());

        let grid = temp_dir.path().join("grid.png");
        let datasets = vec![
            "rabies_7_Cryo_med_f1".to_string(),
            "rabies_7_Cryo_med_f2".to_string(),
        ];
        plot_drift_grid(&grid, &records, &datasets, &colors, (320, 200)).unwrap();
        assert!(grid.exists());
    }

    #[test]
    fn test_plot_version_comparison() {
        let temp_dir = TempDir::new().unwrap();
        let path = temp_dir.path().join("comparison.png");
        let groups = vec![
            ("new".to_string(), vec![0.1, 0.2, 0.25, 0.4]),
            ("old".to_string(), vec![0.3, 0.35, 0.5, 0.9]),
        ];
        let labels = ComparisonLabels {
            metric: "Framewise displacement drift",
            subject: "across subjects",
        };

        plot_version_comparison(&path, &groups, labels, 30, (320, 200)).unwrap();
        assert!(path.exists());
    }

    #[test]
    fn test_plot_version_comparison_empty() {
        let temp_dir = TempDir::new().unwrap();
        let path = temp_dir.path().join("empty.png");
        let labels = ComparisonLabels {
            metric: "Framewise displacement drift",
            subject: "across subjects",
        };

        assert!(matches!(
            plot_version_comparison(&path, &[], labels, 30, (320, 200)),
            Err(VisualizationError::EmptyData(_))
        ));
        assert!(!path.exists());
    }
}
