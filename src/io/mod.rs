//! Readers for on-disk transform formats.
//!
//! Four affine serializations and one composite container are supported,
//! one reader per format, each producing canonical RAS+
//! [`TransformRecord`]s:
//!
//! * [`ras`] — plain-text 4×4 matrix already in RAS+.
//! * [`itk`] — Insight Transform File text affines (LPS convention).
//! * [`fsl`] — FLIRT `.mat` matrices in FSL's scaled-voxel convention,
//!   which need the source and reference image geometries to recover a
//!   physical mapping.
//! * [`lta`] — Linear Transform Array files carrying their own source and
//!   destination voxel geometries.
//! * [`composite`] — a binary container bundling an affine and a dense
//!   displacement field.
//!
//! [`load`] dispatches on file extension, sniffing the content of the
//! ambiguous `.txt` case; an explicit hint on the [`TransformSpec`] wins
//! over both. [`load_chain`] assembles whole chains with per-transform
//! inverse flags.

pub mod composite;
pub mod fsl;
pub mod itk;
pub mod lta;
pub mod ras;

use std::fs::File;
use std::io::{BufRead, BufReader};
use std::path::{Path, PathBuf};

use log::debug;

use crate::affine::Affine4;
use crate::error::{Result, VolXfmError};
use crate::transform::{TransformChain, TransformRecord};

/// Voxel geometry of an image, as needed to interpret voxel-based transform
/// conventions.
#[derive(Debug, Clone)]
pub struct VolumeGeometry {
    /// Voxel shape.
    pub shape: [usize; 3],
    /// Voxel→physical RAS+ affine.
    pub affine: Affine4,
}

/// The supported on-disk transform formats.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransformFormat {
    /// Plain-text 4×4 RAS+ affine.
    RasText,
    /// Insight Transform File text affine (LPS).
    Itk,
    /// FLIRT `.mat` affine (scaled-voxel convention).
    Fsl,
    /// Linear transform array with embedded volume geometries.
    Lta,
    /// Binary composite container (affine + displacement field).
    Composite,
}

impl TransformFormat {
    /// Guess the format from a path's extension.
    ///
    /// `.txt` is ambiguous between the plain RAS matrix and the Insight
    /// text format and is resolved by content sniffing in [`load`]; this
    /// function maps it to `Itk` provisionally.
    pub fn from_path(path: &Path) -> Option<TransformFormat> {
        let name = path.file_name()?.to_str()?.to_ascii_lowercase();
        let stem = name.strip_suffix(".gz").unwrap_or(&name);
        let ext = stem.rsplit('.').next()?;
        match ext {
            "lta" => Some(TransformFormat::Lta),
            "mat" => Some(TransformFormat::Fsl),
            "txt" | "tfm" => Some(TransformFormat::Itk),
            "cxfm" => Some(TransformFormat::Composite),
            _ => None,
        }
    }
}

/// A path plus everything needed to interpret it unambiguously.
#[derive(Debug, Clone)]
pub struct TransformSpec {
    /// Path of the transform file.
    pub path: PathBuf,
    /// Explicit format, overriding extension-based detection.
    pub format: Option<TransformFormat>,
    /// Geometry of the moving (source) image; required by FSL matrices.
    pub moving: Option<VolumeGeometry>,
    /// Geometry of the reference (destination) image; required by FSL
    /// matrices.
    pub reference: Option<VolumeGeometry>,
}

impl TransformSpec {
    /// Spec for a self-describing transform file.
    pub fn new<P: Into<PathBuf>>(path: P) -> Self {
        TransformSpec {
            path: path.into(),
            format: None,
            moving: None,
            reference: None,
        }
    }

    /// Force a specific format.
    pub fn with_format(mut self, format: TransformFormat) -> Self {
        self.format = Some(format);
        self
    }

    /// Attach the moving and reference geometries (FSL matrices).
    pub fn with_geometries(mut self, moving: VolumeGeometry, reference: VolumeGeometry) -> Self {
        self.moving = Some(moving);
        self.reference = Some(reference);
        self
    }
}

/// Load one transform file as its ordered records.
///
/// Affine formats produce one record; the composite container produces its
/// sub-transforms in application order.
pub fn load(spec: &TransformSpec) -> Result<Vec<TransformRecord>> {
    let format = match spec.format {
        Some(f) => f,
        None => detect_format(&spec.path)?,
    };
    debug!("loading {:?} transform from {}", format, spec.path.display());
    match format {
        TransformFormat::RasText => Ok(vec![ras::load(&spec.path)?]),
        TransformFormat::Itk => Ok(vec![itk::load(&spec.path)?]),
        TransformFormat::Fsl => {
            let (moving, reference) = match (&spec.moving, &spec.reference) {
                (Some(m), Some(r)) => (m, r),
                _ => {
                    return Err(VolXfmError::Configuration(format!(
                        "FSL matrix {} requires moving and reference geometries",
                        spec.path.display()
                    )))
                }
            };
            Ok(vec![fsl::load(&spec.path, moving, reference)?])
        }
        TransformFormat::Lta => Ok(vec![lta::load(&spec.path)?]),
        TransformFormat::Composite => composite::load(&spec.path),
    }
}

/// Load a series of transform files as one [`TransformChain`].
///
/// `specs` are listed closest-to-source first and applied last, matching
/// the order transforms are handed around by estimation tools. `inverse`
/// must have one flag per spec, or a single flag broadcast over all of
/// them; any other length is a configuration error. An empty spec list
/// yields the identity chain.
pub fn load_chain(specs: &[TransformSpec], inverse: &[bool]) -> Result<TransformChain> {
    let flags: Vec<bool> = if inverse.len() == 1 {
        vec![inverse[0]; specs.len()]
    } else if inverse.len() == specs.len() {
        inverse.to_vec()
    } else {
        return Err(VolXfmError::Configuration(format!(
            "mismatched number of transforms ({}) and inverse flags ({})",
            specs.len(),
            inverse.len()
        )));
    };

    let mut chain = TransformChain::identity();
    for (spec, &inv) in specs.iter().rev().zip(flags.iter().rev()) {
        let records = load(spec)?;
        if inv {
            // Inverting a file's sub-chain reverses its order too.
            for record in records.iter().rev() {
                chain.push(record.invert()?);
            }
        } else {
            for record in records {
                chain.push(record);
            }
        }
    }
    Ok(chain)
}

fn detect_format(path: &Path) -> Result<TransformFormat> {
    let format = TransformFormat::from_path(path).ok_or_else(|| {
        VolXfmError::format(path, "unrecognized transform file extension")
    })?;
    if format == TransformFormat::Itk {
        // `.txt` may be either an Insight file or a bare RAS matrix.
        let file = BufReader::new(File::open(path)?);
        let first = file
            .lines()
            .next()
            .transpose()?
            .unwrap_or_default();
        if !first.starts_with("#Insight Transform File") {
            return Ok(TransformFormat::RasText);
        }
    }
    Ok(format)
}
