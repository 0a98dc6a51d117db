//! Summary statistics for motion parameter and intensity analysis.
//!
//! Everything here is a plain reduction over slices or ndarray views:
//! ordinary least squares against the frame index, population mean and
//! standard deviation, framewise displacement, histogram binning and
//! mask-restricted voxel means.

use ndarray::ArrayViewD;
use rayon::prelude::*;
use thiserror::Error;

use super::loaders::MotionParameters;

/// Errors raised by the statistics helpers.
#[derive(Error, Debug, Clone, PartialEq)]
pub enum StatsError {
    #[error("need at least {required} samples, got {found}")]
    InsufficientSamples { required: usize, found: usize },

    #[error("length mismatch: x has {x_len} values, y has {y_len}")]
    LengthMismatch { x_len: usize, y_len: usize },

    #[error("abscissa is constant, slope is undefined")]
    DegenerateAbscissa,

    #[error("non-finite value at index {0}")]
    NonFinite(usize),

    #[error("shape mismatch: values {values:?}, mask {mask:?}")]
    ShapeMismatch { values: Vec<usize>, mask: Vec<usize> },

    #[error("mask selects no voxels")]
    EmptyMask,
}

/// Result type for statistics operations.
pub type Result<T> = std::result::Result<T, StatsError>;

/// Slope/intercept pair of a least-squares line.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct LinearTrend {
    pub slope: f64,
    pub intercept: f64,
}

impl LinearTrend {
    /// Value of the fitted line at `x`.
    #[inline]
    pub fn at(&self, x: f64) -> f64 {
        self.slope * x + self.intercept
    }
}

/// Ordinary least-squares fit of `y` against `x`.
pub fn linear_fit_xy(x: &[f64], y: &[f64]) -> Result<LinearTrend> {
    if x.len() != y.len() {
        return Err(StatsError::LengthMismatch {
            x_len: x.len(),
            y_len: y.len(),
        });
    }
    if y.len() < 2 {
        return Err(StatsError::InsufficientSamples {
            required: 2,
            found: y.len(),
        });
    }
    if let Some(idx) = x
        .iter()
        .zip(y.iter())
        .position(|(a, b)| !a.is_finite() || !b.is_finite())
    {
        return Err(StatsError::NonFinite(idx));
    }

    let n = y.len() as f64;
    let mean_x = x.iter().sum::<f64>() / n;
    let mean_y = y.iter().sum::<f64>() / n;

    let mut sxx = 0.0;
    let mut sxy = 0.0;
    for (&xi, &yi) in x.iter().zip(y.iter()) {
        let dx = xi - mean_x;
        sxx += dx * dx;
        sxy += dx * (yi - mean_y);
    }

    if sxx == 0.0 {
        return Err(StatsError::DegenerateAbscissa);
    }

    let slope = sxy / sxx;
    Ok(LinearTrend {
        slope,
        intercept: mean_y - slope * mean_x,
    })
}

/// Least-squares fit of a per-frame series against the frame index `0..n`.
pub fn linear_fit(y: &[f64]) -> Result<LinearTrend> {
    let x: Vec<f64> = (0..y.len()).map(|i| i as f64).collect();
    linear_fit_xy(&x, y)
}

/// Arithmetic mean, `None` for an empty slice.
pub fn mean(values: &[f64]) -> Option<f64> {
    if values.is_empty() {
        return None;
    }
    Some(values.iter().sum::<f64>() / values.len() as f64)
}

/// Population standard deviation (ddof = 0), `None` for an empty slice.
pub fn std(values: &[f64]) -> Option<f64> {
    mean_std(values).map(|(_, s)| s)
}

/// Mean and population standard deviation.
pub fn mean_std(values: &[f64]) -> Option<(f64, f64)> {
    let m = mean(values)?;
    let var = values.iter().map(|v| (v - m) * (v - m)).sum::<f64>() / values.len() as f64;
    Some((m, var.sqrt()))
}

/// Framewise displacement of every frame.
///
/// Sum of absolute translation differences plus `head_radius_mm` times the
/// sum of absolute rotation differences (radians) between consecutive
/// frames. The first frame has no predecessor and gets 0.
pub fn framewise_displacement(params: &MotionParameters, head_radius_mm: f64) -> Vec<f64> {
    let frames = &params.frames;
    let mut fd = Vec::with_capacity(frames.len());
    if frames.is_empty() {
        return fd;
    }
    fd.push(0.0);

    for pair in frames.windows(2) {
        let (prev, cur) = (&pair[0], &pair[1]);
        let rot: f64 = (0..3).map(|i| (cur[i] - prev[i]).abs()).sum();
        let trans: f64 = (3..6).map(|i| (cur[i] - prev[i]).abs()).sum();
        fd.push(trans + head_radius_mm * rot);
    }

    fd
}

/// Smallest range covering every finite value of every series.
///
/// A zero-width range is widened by 0.5 on each side.
pub fn shared_range(series: &[&[f64]]) -> Option<(f64, f64)> {
    let mut lo = f64::INFINITY;
    let mut hi = f64::NEG_INFINITY;
    for s in series {
        for &v in s.iter().filter(|v| v.is_finite()) {
            lo = lo.min(v);
            hi = hi.max(v);
        }
    }
    if !lo.is_finite() || !hi.is_finite() {
        return None;
    }
    if hi - lo == 0.0 {
        lo -= 0.5;
        hi += 0.5;
    }
    Some((lo, hi))
}

/// Count samples into `bins` equal-width bins spanning `range`.
///
/// The last bin is closed on the right; samples outside the range and
/// non-finite samples are ignored.
pub fn histogram(samples: &[f64], bins: usize, range: (f64, f64)) -> Vec<usize> {
    let mut counts = vec![0usize; bins];
    let (lo, hi) = range;
    if bins == 0 || !(hi > lo) {
        return counts;
    }
    let width = (hi - lo) / bins as f64;

    for &v in samples {
        if !v.is_finite() || v < lo || v > hi {
            continue;
        }
        let idx = (((v - lo) / width) as usize).min(bins - 1);
        counts[idx] += 1;
    }

    counts
}

/// Five-number summary drawn as a box plot.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct BoxSummary {
    pub lower_whisker: f64,
    pub q1: f64,
    pub median: f64,
    pub q3: f64,
    pub upper_whisker: f64,
}

/// Linearly interpolated percentile of already sorted values, `q` in [0, 1].
fn percentile_sorted(sorted: &[f64], q: f64) -> f64 {
    let pos = q * (sorted.len() - 1) as f64;
    let lo = pos.floor() as usize;
    let hi = pos.ceil() as usize;
    sorted[lo] + (sorted[hi] - sorted[lo]) * (pos - lo as f64)
}

/// Quartiles and whiskers of the finite `values`.
///
/// Whiskers reach the most extreme samples within 1.5 IQR of the box.
pub fn box_summary(values: &[f64]) -> Option<BoxSummary> {
    let mut sorted: Vec<f64> = values.iter().copied().filter(|v| v.is_finite()).collect();
    if sorted.is_empty() {
        return None;
    }
    sorted.sort_by(|a, b| a.total_cmp(b));

    let q1 = percentile_sorted(&sorted, 0.25);
    let median = percentile_sorted(&sorted, 0.5);
    let q3 = percentile_sorted(&sorted, 0.75);
    let reach = 1.5 * (q3 - q1);

    let lower_whisker = sorted
        .iter()
        .copied()
        .find(|&v| v >= q1 - reach)
        .unwrap_or(q1);
    let upper_whisker = sorted
        .iter()
        .rev()
        .copied()
        .find(|&v| v <= q3 + reach)
        .unwrap_or(q3);

    Some(BoxSummary {
        lower_whisker,
        q1,
        median,
        q3,
        upper_whisker,
    })
}

/// Mean of `values` over the voxels where `mask` is non-zero.
pub fn masked_mean(values: ArrayViewD<'_, f32>, mask: ArrayViewD<'_, f32>) -> Result<f64> {
    if values.shape() != mask.shape() {
        return Err(StatsError::ShapeMismatch {
            values: values.shape().to_vec(),
            mask: mask.shape().to_vec(),
        });
    }

    let (sum, count) = values
        .iter()
        .zip(mask.iter())
        .filter(|&(_, &m)| m != 0.0)
        .fold((0.0f64, 0usize), |(s, c), (&v, _)| (s + v as f64, c + 1));

    if count == 0 {
        return Err(StatsError::EmptyMask);
    }

    Ok(sum / count as f64)
}

/// Per-voxel ratio of mean to standard deviation (temporal SNR).
///
/// Voxels with zero spread get 0.
pub fn snr_map(means: &[f32], stds: &[f32]) -> Vec<f32> {
    means
        .par_iter()
        .zip(stds.par_iter())
        .map(|(&m, &s)| if s > 0.0 { m / s } else { 0.0 })
        .collect()
}
