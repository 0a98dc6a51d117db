//! Animated coronal views of a 4D series.

use std::path::Path;

use ndarray::ArrayViewD;
use plotters::prelude::*;
use plotters_bitmap::BitMapBackend;

use super::{plotting_error, Result, VisualizationError};

/// Diverging colour for `t` in [-1, 1].
///
/// Black at 0, through red and yellow to white at +1, through blue and
/// cyan to white at -1. Values outside the interval are clamped.
pub fn cold_hot(t: f64) -> RGBColor {
    let t = if t.is_finite() { t.clamp(-1.0, 1.0) } else { 0.0 };
    let s = t.abs();
    let channel = |offset: f64| ((3.0 * s - offset).clamp(0.0, 1.0) * 255.0).round() as u8;
    let (first, second, third) = (channel(0.0), channel(1.0), channel(2.0));

    if t >= 0.0 {
        RGBColor(first, second, third)
    } else {
        RGBColor(third, second, first)
    }
}

/// Largest absolute value, 1.0 when the data is all zero.
fn symmetric_limit(data: &ArrayViewD<'_, f32>) -> f64 {
    let vmax = data
        .iter()
        .filter(|v| v.is_finite())
        .fold(0.0f32, |acc, v| acc.max(v.abs())) as f64;
    if vmax > 0.0 {
        vmax
    } else {
        1.0
    }
}

/// Write an animated GIF of one coronal slice over time.
///
/// `series` has shape `[x, y, z, t]`; `slice` indexes y. Each frame shows
/// x left to right and z bottom to top, coloured with [`cold_hot`] on the
/// symmetric range `[-vmax, vmax]`, `vmax` being the largest absolute
/// value of the whole series. Every voxel is drawn as a `scale`-sized
/// square. Returns the number of frames written.
pub fn render_coronal_animation(
    output_path: &Path,
    series: ArrayViewD<'_, f32>,
    slice: usize,
    frames: usize,
    delay_ms: u32,
    scale: u32,
) -> Result<usize> {
    if series.ndim() != 4 {
        return Err(VisualizationError::InvalidInput(format!(
            "expected a 4D series, got shape {:?}",
            series.shape()
        )));
    }
    let (nx, ny, nz, nt) = (
        series.shape()[0],
        series.shape()[1],
        series.shape()[2],
        series.shape()[3],
    );
    if slice >= ny {
        return Err(VisualizationError::InvalidInput(format!(
            "coronal slice {} is outside 0..{}",
            slice, ny
        )));
    }
    let frames = frames.min(nt);
    if frames == 0 || nx == 0 || nz == 0 {
        return Err(VisualizationError::EmptyData("series has no frames".to_string()));
    }

    let scale = scale.max(1);
    let vmax = symmetric_limit(&series);
    let size = (nx as u32 * scale, nz as u32 * scale);

    let root = BitMapBackend::gif(output_path, size, delay_ms)
        .map_err(plotting_error)?
        .into_drawing_area();

    for t in 0..frames {
        root.fill(&BLACK).map_err(plotting_error)?;

        for x in 0..nx {
            for z in 0..nz {
                let value = series[[x, slice, z, t]] as f64;
                let color = cold_hot(value / vmax);
                // superior up
                let row = (nz - 1 - z) as i32 * scale as i32;
                let col = x as i32 * scale as i32;
                root.draw(&Rectangle::new(
                    [(col, row), (col + scale as i32, row + scale as i32)],
                    color.filled(),
                ))
                .map_err(plotting_error)?;
            }
        }

        root.present().map_err(plotting_error)?;
    }

    log::info!("Wrote {} frames to {}", frames, output_path.display());
    Ok(frames)
}

#[cfg(test)]
mod tests {
    use super::*;
    use ndarray::{ArrayD, IxDyn};
    use tempfile::TempDir;

    #[test]
    fn test_cold_hot_endpoints() {
        assert_eq!(cold_hot(0.0), RGBColor(0, 0, 0));
        assert_eq!(cold_hot(1.0), RGBColor(255, 255, 255));
        assert_eq!(cold_hot(-1.0), RGBColor(255, 255, 255));
        assert_eq!(cold_hot(1.0 / 3.0), RGBColor(255, 0, 0));
        assert_eq!(cold_hot(-1.0 / 3.0), RGBColor(0, 0, 255));
        assert_eq!(cold_hot(5.0), cold_hot(1.0));
        assert_eq!(cold_hot(f64::NAN), RGBColor(0, 0, 0));
    }

    #[test]
    fn test_render_coronal_animation() {
        let temp_dir = TempDir::new().unwrap();
        let path = temp_dir.path().join("coronal.gif");
        let series = ArrayD::from_shape_fn(IxDyn(&[4, 3, 5, 12]), |idx| {
            (idx[0] as f32 - idx[2] as f32) * (idx[3] as f32 + 1.0)
        });

        let written = render_coronal_animation(&path, series.view(), 1, 10, 500, 2).unwrap();
        assert_eq!(written, 10);
        assert!(path.exists());
    }

    #[test]
    fn test_render_rejects_bad_slice() {
        let temp_dir = TempDir::new().unwrap();
        let path = temp_dir.path().join("coronal.gif");
        let series = ArrayD::<f32>::zeros(IxDyn(&[2, 2, 2, 2]));

        assert!(matches!(
            render_coronal_animation(&path, series.view(), 40, 10, 500, 2),
            Err(VisualizationError::InvalidInput(_))
        ));

        let volume = ArrayD::<f32>::zeros(IxDyn(&[2, 2, 2]));
        assert!(render_coronal_animation(&path, volume.view(), 0, 10, 500, 2).is_err());
    }
}
