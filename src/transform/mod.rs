//! Canonical in-memory transforms.
//!
//! Every coordinate mapping handled by this crate is normalized into a
//! [`TransformRecord`] at read time: either a 4×4 affine or a dense
//! displacement field with its sampling grid, always expressed in physical
//! RAS+ millimetres. Format-specific axis conventions are resolved by the
//! readers in [`crate::io`]; nothing here knows about on-disk layouts.

pub mod chain;

pub use self::chain::{GridMapping, TransformChain};

use nalgebra::Vector3;
use ndarray::Array4;

use crate::affine::{apply_affine, invert_affine, Affine4};
use crate::error::{Result, VolXfmError};

/// Convergence tolerance (in millimetres) of the fixed-point inversion of a
/// displacement field.
pub const FIELD_INVERSION_TOLERANCE: f64 = 1e-3;

/// Iteration cap for the fixed-point inversion of a displacement field.
const FIELD_INVERSION_MAX_ITER: usize = 25;

/// One coordinate mapping in canonical RAS+ form.
#[derive(Debug, Clone)]
pub enum TransformRecord {
    /// A 4×4 affine over physical coordinates.
    Affine(Affine4),
    /// A dense displacement field over physical coordinates.
    Field(DisplacementField),
}

impl TransformRecord {
    /// Map a physical point through this transform.
    pub fn map_point(&self, point: &Vector3<f64>) -> Vector3<f64> {
        match self {
            TransformRecord::Affine(affine) => apply_affine(affine, point),
            TransformRecord::Field(field) => field.map_point(point),
        }
    }

    /// Invert this transform.
    ///
    /// Affines are inverted in closed form. Displacement fields have no
    /// closed-form inverse; a resampling-based numerical inverse is computed
    /// instead, accurate to [`FIELD_INVERSION_TOLERANCE`] for displacements
    /// well within the field's grid.
    pub fn invert(&self) -> Result<TransformRecord> {
        match self {
            TransformRecord::Affine(affine) => Ok(TransformRecord::Affine(invert_affine(affine)?)),
            TransformRecord::Field(field) => Ok(TransformRecord::Field(field.invert()?)),
        }
    }

    /// Whether this record is an affine.
    pub fn is_affine(&self) -> bool {
        matches!(self, TransformRecord::Affine(_))
    }
}

/// A dense displacement field on a regular grid.
///
/// `field` has shape `(X, Y, Z, 3)` and holds, for each grid voxel, the
/// RAS+ displacement (in millimetres) added to the physical position of that
/// voxel. `affine` is the voxel→physical mapping of the field's own grid.
#[derive(Debug, Clone)]
pub struct DisplacementField {
    field: Array4<f64>,
    affine: Affine4,
    inverse: Affine4,
}

impl DisplacementField {
    /// Create a displacement field, validating its vector axis and grid.
    pub fn new(field: Array4<f64>, affine: Affine4) -> Result<Self> {
        let shape = field.shape();
        if shape[3] != 3 {
            return Err(VolXfmError::Geometry(format!(
                "displacement field must be vector-valued with 3 components, got {}",
                shape[3]
            )));
        }
        if shape[..3].iter().any(|&s| s == 0) {
            return Err(VolXfmError::Geometry(format!(
                "displacement field has empty grid {:?}",
                &shape[..3]
            )));
        }
        let inverse = invert_affine(&affine)?;
        Ok(DisplacementField {
            field,
            affine,
            inverse,
        })
    }

    /// The raw `(X, Y, Z, 3)` displacement array.
    pub fn field(&self) -> &Array4<f64> {
        &self.field
    }

    /// The voxel→physical affine of the field's grid.
    pub fn affine(&self) -> &Affine4 {
        &self.affine
    }

    /// Grid shape of the field.
    pub fn grid_shape(&self) -> [usize; 3] {
        let s = self.field.shape();
        [s[0], s[1], s[2]]
    }

    /// Displacement at a physical point, by trilinear interpolation of the
    /// field. Points outside the field's grid get zero displacement.
    pub fn displacement_at(&self, point: &Vector3<f64>) -> Vector3<f64> {
        let v = apply_affine(&self.inverse, point);
        let [nx, ny, nz] = self.grid_shape();
        if v.x < 0.0
            || v.y < 0.0
            || v.z < 0.0
            || v.x > (nx - 1) as f64
            || v.y > (ny - 1) as f64
            || v.z > (nz - 1) as f64
        {
            return Vector3::zeros();
        }
        let i0 = (v.x.floor() as usize).min(nx - 1);
        let j0 = (v.y.floor() as usize).min(ny - 1);
        let k0 = (v.z.floor() as usize).min(nz - 1);
        let i1 = (i0 + 1).min(nx - 1);
        let j1 = (j0 + 1).min(ny - 1);
        let k1 = (k0 + 1).min(nz - 1);
        let fx = v.x - i0 as f64;
        let fy = v.y - j0 as f64;
        let fz = v.z - k0 as f64;

        let mut out = Vector3::zeros();
        for c in 0..3 {
            let c000 = self.field[(i0, j0, k0, c)];
            let c100 = self.field[(i1, j0, k0, c)];
            let c010 = self.field[(i0, j1, k0, c)];
            let c110 = self.field[(i1, j1, k0, c)];
            let c001 = self.field[(i0, j0, k1, c)];
            let c101 = self.field[(i1, j0, k1, c)];
            let c011 = self.field[(i0, j1, k1, c)];
            let c111 = self.field[(i1, j1, k1, c)];
            let c00 = c000 * (1.0 - fx) + c100 * fx;
            let c10 = c010 * (1.0 - fx) + c110 * fx;
            let c01 = c001 * (1.0 - fx) + c101 * fx;
            let c11 = c011 * (1.0 - fx) + c111 * fx;
            let c0 = c00 * (1.0 - fy) + c10 * fy;
            let c1 = c01 * (1.0 - fy) + c11 * fy;
            out[c] = c0 * (1.0 - fz) + c1 * fz;
        }
        out
    }

    /// Map a physical point: `p + d(p)`.
    pub fn map_point(&self, point: &Vector3<f64>) -> Vector3<f64> {
        point + self.displacement_at(point)
    }

    /// Numerical inverse of the field on its own grid.
    ///
    /// Solves `d_inv(x) = -d(x + d_inv(x))` by fixed-point iteration at
    /// every grid voxel, stopping once the largest per-voxel update falls
    /// below [`FIELD_INVERSION_TOLERANCE`].
    pub fn invert(&self) -> Result<DisplacementField> {
        let [nx, ny, nz] = self.grid_shape();
        let mut inv = Array4::<f64>::zeros((nx, ny, nz, 3));
        for k in 0..nz {
            for j in 0..ny {
                for i in 0..nx {
                    let x = apply_affine(
                        &self.affine,
                        &Vector3::new(i as f64, j as f64, k as f64),
                    );
                    let mut d = Vector3::zeros();
                    for _ in 0..FIELD_INVERSION_MAX_ITER {
                        let next = -self.displacement_at(&(x + d));
                        let delta = (next - d).norm();
                        d = next;
                        if delta < FIELD_INVERSION_TOLERANCE {
                            break;
                        }
                    }
                    inv[(i, j, k, 0)] = d.x;
                    inv[(i, j, k, 1)] = d.y;
                    inv[(i, j, k, 2)] = d.z;
                }
            }
        }
        DisplacementField::new(inv, self.affine)
    }
}
