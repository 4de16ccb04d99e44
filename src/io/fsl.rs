//! FLIRT `.mat` affines.
//!
//! FLIRT matrices map *scaled-voxel* coordinates of the moving image to
//! scaled-voxel coordinates of the reference image: voxel indices scaled by
//! the voxel sizes, with the first axis mirrored whenever the image affine
//! has a positive determinant. The file itself carries no geometry, so both
//! image geometries must be supplied to recover the physical RAS+ mapping:
//!
//! `R = A_ref · S_ref⁻¹ · M · S_mov · A_mov⁻¹`
//!
//! where `S` is the scaled-voxel adaptor of each space.

use std::fs;
use std::path::Path;

use crate::affine::{invert_affine, voxel_sizes, Affine4};
use crate::error::Result;
use crate::io::VolumeGeometry;
use crate::transform::TransformRecord;

/// Read a FLIRT matrix as a physical RAS+ mapping from the moving to the
/// reference space.
pub fn load(path: &Path, moving: &VolumeGeometry, reference: &VolumeGeometry) -> Result<TransformRecord> {
    let text = fs::read_to_string(path)?;
    let mat = super::ras::parse_matrix(&text, path)?;

    let s_mov = scaled_voxel_adaptor(moving);
    let s_ref = scaled_voxel_adaptor(reference);
    let ras = reference.affine
        * invert_affine(&s_ref)?
        * mat
        * s_mov
        * invert_affine(&moving.affine)?;
    Ok(TransformRecord::Affine(ras))
}

/// Voxel→scaled-voxel adaptor of a space, including FSL's x-mirror for
/// positively-oriented affines.
fn scaled_voxel_adaptor(geometry: &VolumeGeometry) -> Affine4 {
    let zooms = voxel_sizes(&geometry.affine);
    let mut adaptor = Affine4::identity();
    for (i, zoom) in zooms.iter().enumerate() {
        adaptor[(i, i)] = *zoom;
    }
    let det = geometry
        .affine
        .fixed_view::<3, 3>(0, 0)
        .determinant();
    if det > 0.0 {
        adaptor[(0, 0)] = -zooms[0];
        adaptor[(0, 3)] = (geometry.shape[0] as f64 - 1.0) * zooms[0];
    }
    adaptor
}
