//! NIfTI image access.
//!
//! Thin layer over the `nifti` crate: header metadata for scan parameters,
//! whole-volume loading into `ndarray`, saving derived volumes with a
//! reference header, and the voxelwise temporal reductions used by the
//! motion and gain analyses.

use std::path::{Path, PathBuf};

use ndarray::{ArrayD, ArrayViewD, Axis, IxDyn};
use nifti::writer::WriterOptions;
use nifti::{IntoNdArray, NiftiHeader, NiftiObject, ReaderOptions};
use thiserror::Error;

/// Errors raised while reading or writing images.
#[derive(Error, Debug)]
pub enum NiftiError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("failed to read '{path}': {source}")]
    Read {
        path: PathBuf,
        #[source]
        source: nifti::NiftiError,
    },

    #[error("failed to write '{path}': {source}")]
    Write {
        path: PathBuf,
        #[source]
        source: nifti::NiftiError,
    },

    #[error("expected a {expected}D image, got shape {shape:?}")]
    Dimensionality { expected: usize, shape: Vec<usize> },

    #[error("shape mismatch: {left:?} vs {right:?}")]
    ShapeMismatch { left: Vec<usize>, right: Vec<usize> },

    #[error("series has {series} voxels per frame but the mask selects {mask}")]
    MaskCount { series: usize, mask: usize },
}

/// Result type for image operations.
pub type Result<T> = std::result::Result<T, NiftiError>;

/// Geometry and timing read from an image header.
#[derive(Debug, Clone, PartialEq)]
pub struct ImageInfo {
    /// Size of every dimension, without the leading rank entry
    pub dims: Vec<usize>,
    /// Voxel size along x, y, z in mm
    pub voxel_size: [f64; 3],
    /// Time between frames as stored in the header
    pub frame_interval: f64,
}

impl ImageInfo {
    fn from_header(header: &NiftiHeader) -> Self {
        let rank = (header.dim[0] as usize).min(7);
        let dims = (1..=rank).map(|i| header.dim[i] as usize).collect();
        Self {
            dims,
            voxel_size: [
                header.pixdim[1] as f64,
                header.pixdim[2] as f64,
                header.pixdim[3] as f64,
            ],
            frame_interval: header.pixdim[4] as f64,
        }
    }

    /// Volume of one voxel in mm^3.
    pub fn voxel_volume(&self) -> f64 {
        self.voxel_size.iter().product()
    }

    /// Number of frames (1 for a 3D image).
    pub fn frames(&self) -> usize {
        if self.dims.len() >= 4 {
            self.dims[3].max(1)
        } else {
            1
        }
    }
}

/// A loaded image with its header.
#[derive(Debug, Clone)]
pub struct Volume {
    pub header: NiftiHeader,
    pub data: ArrayD<f32>,
}

impl Volume {
    /// Shape of the voxel array.
    pub fn shape(&self) -> &[usize] {
        self.data.shape()
    }
}

/// Read only the header of an image.
pub fn read_image_info<P: AsRef<Path>>(path: P) -> Result<ImageInfo> {
    let path = path.as_ref();
    let header = NiftiHeader::from_file(path).map_err(|e| NiftiError::Read {
        path: path.to_path_buf(),
        source: e,
    })?;
    Ok(ImageInfo::from_header(&header))
}

/// Load a `.nii` or `.nii.gz` image as `f32` voxels.
pub fn load_volume<P: AsRef<Path>>(path: P) -> Result<Volume> {
    let path = path.as_ref();
    let read_err = |e: nifti::NiftiError| NiftiError::Read {
        path: path.to_path_buf(),
        source: e,
    };

    let obj = ReaderOptions::new().read_file(path).map_err(read_err)?;
    let header = obj.header().clone();
    let data = obj.into_volume().into_ndarray::<f32>().map_err(read_err)?;

    log::debug!("Loaded {} with shape {:?}", path.display(), data.shape());

    Ok(Volume { header, data })
}

/// Save voxels using `reference` for geometry and metadata.
pub fn save_volume<P: AsRef<Path>>(path: P, data: &ArrayD<f32>, reference: &NiftiHeader) -> Result<()> {
    let path = path.as_ref();
    if let Some(parent) = path.parent() {
        if !parent.as_os_str().is_empty() {
            std::fs::create_dir_all(parent)?;
        }
    }

    WriterOptions::new(path)
        .reference_header(reference)
        .write_nifti(data)
        .map_err(|e| NiftiError::Write {
            path: path.to_path_buf(),
            source: e,
        })
}

fn require_4d(data: &ArrayViewD<'_, f32>) -> Result<()> {
    if data.ndim() != 4 {
        return Err(NiftiError::Dimensionality {
            expected: 4,
            shape: data.shape().to_vec(),
        });
    }
    Ok(())
}

/// Voxelwise mean over the time axis of a 4D series.
pub fn temporal_mean(data: ArrayViewD<'_, f32>) -> Result<ArrayD<f32>> {
    require_4d(&data)?;
    data.mean_axis(Axis(3)).ok_or_else(|| NiftiError::Dimensionality {
        expected: 4,
        shape: data.shape().to_vec(),
    })
}

/// Voxelwise population standard deviation over the time axis of a 4D series.
pub fn temporal_std(data: ArrayViewD<'_, f32>) -> Result<ArrayD<f32>> {
    require_4d(&data)?;
    Ok(data.std_axis(Axis(3), 0.0))
}

/// Fail unless both arrays have the same shape.
pub fn ensure_same_shape(left: &[usize], right: &[usize]) -> Result<()> {
    if left != right {
        return Err(NiftiError::ShapeMismatch {
            left: left.to_vec(),
            right: right.to_vec(),
        });
    }
    Ok(())
}

/// Indicator array (1.0 / 0.0) of the non-zero voxels.
pub fn nonzero_mask(data: ArrayViewD<'_, f32>) -> ArrayD<f32> {
    data.mapv(|v| if v != 0.0 { 1.0 } else { 0.0 })
}

/// Rebuild a 4D series from a frames × in-mask-voxels matrix.
///
/// Row `t` holds the values of the voxels selected by `mask`, in row-major
/// (x, y, z) order. Voxels outside the mask are zero. The result has shape
/// `[x, y, z, t]`.
pub fn unmask_series(rows: &[Vec<f32>], mask: ArrayViewD<'_, f32>) -> Result<ArrayD<f32>> {
    if mask.ndim() != 3 {
        return Err(NiftiError::Dimensionality {
            expected: 3,
            shape: mask.shape().to_vec(),
        });
    }

    let selected: Vec<usize> = mask
        .iter()
        .enumerate()
        .filter(|&(_, &m)| m != 0.0)
        .map(|(i, _)| i)
        .collect();

    if let Some(row) = rows.iter().find(|r| r.len() != selected.len()) {
        return Err(NiftiError::MaskCount {
            series: row.len(),
            mask: selected.len(),
        });
    }

    let shape = mask.shape();
    let (nx, ny, nz) = (shape[0], shape[1], shape[2]);
    let mut out = ArrayD::<f32>::zeros(IxDyn(&[nx, ny, nz, rows.len()]));

    for (t, row) in rows.iter().enumerate() {
        for (&flat, &value) in selected.iter().zip(row.iter()) {
            let x = flat / (ny * nz);
            let y = (flat / nz) % ny;
            let z = flat % nz;
            out[[x, y, z, t]] = value;
        }
    }

    Ok(out)
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    fn ramp_series() -> ArrayD<f32> {
        // 2x1x1 voxels, 4 frames: one constant, one alternating
        ArrayD::from_shape_vec(
            IxDyn(&[2, 1, 1, 4]),
            vec![5.0, 5.0, 5.0, 5.0, 1.0, 3.0, 1.0, 3.0],
        )
        .unwrap()
    }

    #[test]
    fn test_temporal_reductions() {
        let series = ramp_series();
        let mean = temporal_mean(series.view()).unwrap();
        let std = temporal_std(series.view()).unwrap();

        assert_eq!(mean.shape(), &[2, 1, 1]);
        assert_eq!(mean[[0, 0, 0]], 5.0);
        assert_eq!(mean[[1, 0, 0]], 2.0);
        assert_eq!(std[[0, 0, 0]], 0.0);
        assert!((std[[1, 0, 0]] - 1.0).abs() < 1e-6);
    }

    #[test]
    fn test_temporal_reduction_requires_4d() {
        let volume = ArrayD::<f32>::zeros(IxDyn(&[2, 2, 2]));
        assert!(matches!(
            temporal_std(volume.view()),
            Err(NiftiError::Dimensionality { expected: 4, .. })
        ));
    }

    #[test]
    fn test_image_info_from_header() {
        let header = NiftiHeader {
            dim: [4, 64, 64, 20, 120, 1, 1, 1],
            pixdim: [1.0, 0.2, 0.2, 0.5, 1.5, 0.0, 0.0, 0.0],
            ..Default::default()
        };
        let info = ImageInfo::from_header(&header);

        assert_eq!(info.dims, vec![64, 64, 20, 120]);
        assert_eq!(info.frames(), 120);
        assert!((info.voxel_volume() - 0.02).abs() < 1e-6);
        assert!((info.frame_interval - 1.5).abs() < 1e-6);
    }

    #[test]
    fn test_unmask_series() {
        let mask = ArrayD::from_shape_vec(
            IxDyn(&[2, 2, 1]),
            vec![1.0f32, 0.0, 0.0, 1.0],
        )
        .unwrap();
        let rows = vec![vec![1.0, 2.0], vec![3.0, 4.0], vec![5.0, 6.0]];

        let out = unmask_series(&rows, mask.view()).unwrap();
        assert_eq!(out.shape(), &[2, 2, 1, 3]);
        assert_eq!(out[[0, 0, 0, 1]], 3.0);
        assert_eq!(out[[1, 1, 0, 2]], 6.0);
        assert_eq!(out[[0, 1, 0, 0]], 0.0);
    }

    #[test]
    fn test_unmask_series_count_mismatch() {
        let mask = ArrayD::from_elem(IxDyn(&[1, 1, 2]), 1.0f32);
        let rows = vec![vec![1.0]];
        assert!(matches!(
            unmask_series(&rows, mask.view()),
            Err(NiftiError::MaskCount { series: 1, mask: 2 })
        ));
    }

    #[test]
    fn test_nonzero_mask_and_shape_check() {
        let data = ArrayD::from_shape_vec(IxDyn(&[3]), vec![0.0f32, -2.0, 4.0]).unwrap();
        let mask = nonzero_mask(data.view());
        assert_eq!(mask.as_slice().unwrap(), &[0.0, 1.0, 1.0]);

        assert!(ensure_same_shape(&[2, 2], &[2, 2]).is_ok());
        assert!(ensure_same_shape(&[2, 2], &[2, 3]).is_err());
    }

    #[test]
    fn test_save_and_load_volume() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("nested").join("avg.nii.gz");
        let data = ArrayD::from_shape_vec(
            IxDyn(&[2, 2, 2]),
            (0..8).map(|v| v as f32).collect(),
        )
        .unwrap();

        let mut header = NiftiHeader::default();
        header.pixdim = [1.0, 0.5, 0.5, 1.0, 0.0, 0.0, 0.0, 0.0];
        header.scl_slope = 1.0;
        save_volume(&path, &data, &header).unwrap();

        let loaded = load_volume(&path).unwrap();
        assert_eq!(loaded.shape(), &[2, 2, 2]);
        assert_eq!(loaded.data[[1, 0, 1]], data[[1, 0, 1]]);

        let info = read_image_info(&path).unwrap();
        assert_eq!(info.dims, vec![2, 2, 2]);
        assert!((info.voxel_volume() - 0.25).abs() < 1e-6);
    }
}
