//! Homogeneous 4×4 affine helpers.
//!
//! All affines in this crate map physical RAS+ coordinates (millimetres) and
//! are kept in `f64`. Readers for formats expressed in other conventions
//! (such as LPS-based ones) canonicalize to RAS+ at construction time via
//! [`lps_to_ras`]; nothing downstream of a constructed transform is expected
//! to deal with handedness again.

use nalgebra::{Matrix4, Vector3, Vector4};

use crate::error::{Result, VolXfmError};

/// A 4×4 homogeneous affine over physical coordinates.
pub type Affine4 = Matrix4<f64>;

/// Apply an affine to a 3D point.
#[inline]
pub fn apply_affine(affine: &Affine4, point: &Vector3<f64>) -> Vector3<f64> {
    let h = affine * Vector4::new(point.x, point.y, point.z, 1.0);
    Vector3::new(h.x, h.y, h.z)
}

/// Invert an affine, failing on singular matrices.
pub fn invert_affine(affine: &Affine4) -> Result<Affine4> {
    affine
        .try_inverse()
        .ok_or_else(|| VolXfmError::Geometry("affine matrix is singular".into()))
}

/// Convert an affine mapping LPS coordinates to LPS coordinates into the
/// equivalent RAS+ to RAS+ mapping.
///
/// LPS and RAS differ by a sign flip on the first two axes, so the
/// conversion conjugates by `diag(-1, -1, 1, 1)`.
pub fn lps_to_ras(affine: &Affine4) -> Affine4 {
    let f = ras_flip();
    f * affine * f
}

/// Convert a voxel→LPS grid affine into a voxel→RAS+ one.
///
/// Only the output side of the mapping changes convention, so the flip is
/// applied on the left alone.
pub fn grid_lps_to_ras(affine: &Affine4) -> Affine4 {
    ras_flip() * affine
}

/// The involution exchanging LPS and RAS physical coordinates.
#[inline]
pub fn ras_flip() -> Affine4 {
    Affine4::from_diagonal(&Vector4::new(-1.0, -1.0, 1.0, 1.0))
}

/// Build a voxel→physical affine from an origin, per-axis spacing and a
/// row-major 3×3 direction-cosine matrix.
pub fn from_parameters(origin: [f64; 3], spacing: [f64; 3], direction: [f64; 9]) -> Affine4 {
    let mut affine = Affine4::identity();
    for i in 0..3 {
        for j in 0..3 {
            affine[(i, j)] = direction[i * 3 + j] * spacing[j];
        }
        affine[(i, 3)] = origin[i];
    }
    affine
}

/// Per-axis voxel sizes implied by an affine (norms of its spatial columns).
pub fn voxel_sizes(affine: &Affine4) -> [f64; 3] {
    let mut zooms = [0.0; 3];
    for (j, zoom) in zooms.iter_mut().enumerate() {
        let col = affine.fixed_view::<3, 1>(0, j);
        *zoom = col.norm();
    }
    zooms
}
