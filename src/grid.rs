//! Target sampling grids.
//!
//! A [`SamplingGrid`] is the read-only description of the space a series is
//! resampled into: a voxel shape, a voxel→physical affine and an optional
//! binary field-of-view mask. It is constructed once per target space and
//! shared (immutably) by every volume of a run.

use nalgebra::Vector3;
use ndarray::{Array2, Array3};

use crate::affine::{apply_affine, invert_affine, Affine4};
use crate::error::{Result, VolXfmError};

/// A regular 3D sampling grid in physical RAS+ space.
#[derive(Debug, Clone)]
pub struct SamplingGrid {
    shape: [usize; 3],
    affine: Affine4,
    inverse: Affine4,
    fov_mask: Option<Array3<bool>>,
}

impl SamplingGrid {
    /// Create a new sampling grid from a voxel shape and voxel→physical
    /// affine.
    pub fn new(shape: [usize; 3], affine: Affine4) -> Result<Self> {
        if shape.iter().any(|&s| s == 0) {
            return Err(VolXfmError::Geometry(format!(
                "sampling grid has empty shape {:?}",
                shape
            )));
        }
        let inverse = invert_affine(&affine)?;
        Ok(SamplingGrid {
            shape,
            affine,
            inverse,
            fov_mask: None,
        })
    }

    /// Attach a binary field-of-view mask, which must match the grid shape.
    pub fn with_fov_mask(mut self, mask: Array3<bool>) -> Result<Self> {
        if mask.shape() != self.shape {
            return Err(VolXfmError::Geometry(format!(
                "field-of-view mask shape {:?} does not match grid shape {:?}",
                mask.shape(),
                self.shape
            )));
        }
        self.fov_mask = Some(mask);
        Ok(self)
    }

    /// The voxel shape of the grid.
    pub fn shape(&self) -> [usize; 3] {
        self.shape
    }

    /// The number of voxels in the grid.
    pub fn num_voxels(&self) -> usize {
        self.shape.iter().product()
    }

    /// The voxel→physical affine.
    pub fn affine(&self) -> &Affine4 {
        &self.affine
    }

    /// The physical→voxel affine.
    pub fn inverse_affine(&self) -> &Affine4 {
        &self.inverse
    }

    /// The field-of-view mask, if one was supplied.
    pub fn fov_mask(&self) -> Option<&Array3<bool>> {
        self.fov_mask.as_ref()
    }

    /// Physical coordinate of a (continuous) voxel index.
    pub fn voxel_to_physical(&self, voxel: &Vector3<f64>) -> Vector3<f64> {
        apply_affine(&self.affine, voxel)
    }

    /// Continuous voxel index of a physical coordinate.
    pub fn physical_to_voxel(&self, point: &Vector3<f64>) -> Vector3<f64> {
        apply_affine(&self.inverse, point)
    }

    /// Enumerate the physical coordinates of every voxel as an `(N, 3)`
    /// array, with the first voxel axis varying fastest. The row order is
    /// the flat order used by every grid-shaped array in this crate.
    pub fn ndcoords(&self) -> Array2<f64> {
        let [nx, ny, nz] = self.shape;
        let mut coords = Array2::zeros((self.num_voxels(), 3));
        let mut row = 0;
        for k in 0..nz {
            for j in 0..ny {
                for i in 0..nx {
                    let p = self.voxel_to_physical(&Vector3::new(i as f64, j as f64, k as f64));
                    coords[(row, 0)] = p.x;
                    coords[(row, 1)] = p.y;
                    coords[(row, 2)] = p.z;
                    row += 1;
                }
            }
        }
        coords
    }

    /// Flat row index of a voxel, consistent with [`SamplingGrid::ndcoords`].
    #[inline]
    pub fn flat_index(&self, i: usize, j: usize, k: usize) -> usize {
        i + self.shape[0] * (j + self.shape[1] * k)
    }

    /// Whether two grids describe the same sampling, within tolerance.
    pub fn same_geometry(&self, other: &SamplingGrid, epsilon: f64) -> bool {
        use approx::AbsDiffEq;
        self.shape == other.shape && self.affine.abs_diff_eq(&other.affine, epsilon)
    }
}
