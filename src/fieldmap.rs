//! Susceptibility distortion: fieldmap reconstruction and parameters.
//!
//! Fieldmap estimators deliver their result as cubic B-spline coefficient
//! grids (values in Hz) rather than a dense field, so the field can be
//! evaluated on any grid without an extra resampling step. This module
//! selects an estimator by identifier, evaluates its tensor-product spline
//! at every point of a target grid (mapped through the fieldmap
//! registration chain), and converts the Hz values into a physical
//! displacement along the phase-encode axis.

use std::str::FromStr;

use log::debug;
use nalgebra::Vector3;
use ndarray::{Array3, Array4, Zip};

use crate::affine::{apply_affine, invert_affine, Affine4};
use crate::error::{Result, VolXfmError};
use crate::grid::SamplingGrid;
use crate::transform::{DisplacementField, TransformChain};

/// The phase-encode axis of an EPI acquisition, with polarity.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PhaseEncodeAxis {
    /// First voxel axis, positive readout polarity.
    I,
    /// First voxel axis, reversed polarity.
    IReversed,
    /// Second voxel axis, positive polarity.
    J,
    /// Second voxel axis, reversed polarity.
    JReversed,
    /// Third voxel axis, positive polarity.
    K,
    /// Third voxel axis, reversed polarity.
    KReversed,
}

impl PhaseEncodeAxis {
    /// Index of the encoded voxel axis.
    pub fn axis(self) -> usize {
        match self {
            PhaseEncodeAxis::I | PhaseEncodeAxis::IReversed => 0,
            PhaseEncodeAxis::J | PhaseEncodeAxis::JReversed => 1,
            PhaseEncodeAxis::K | PhaseEncodeAxis::KReversed => 2,
        }
    }

    /// Sign of the displacement along the encoded axis.
    pub fn sign(self) -> f64 {
        match self {
            PhaseEncodeAxis::IReversed
            | PhaseEncodeAxis::JReversed
            | PhaseEncodeAxis::KReversed => -1.0,
            _ => 1.0,
        }
    }
}

impl FromStr for PhaseEncodeAxis {
    type Err = VolXfmError;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "i" => Ok(PhaseEncodeAxis::I),
            "i-" => Ok(PhaseEncodeAxis::IReversed),
            "j" => Ok(PhaseEncodeAxis::J),
            "j-" => Ok(PhaseEncodeAxis::JReversed),
            "k" => Ok(PhaseEncodeAxis::K),
            "k-" => Ok(PhaseEncodeAxis::KReversed),
            other => Err(VolXfmError::Configuration(format!(
                "unrecognized phase-encoding direction {:?}",
                other
            ))),
        }
    }
}

/// Per-series acquisition metadata, as delivered by the metadata
/// collaborator.
#[derive(Debug, Clone, Default)]
pub struct AcquisitionMetadata {
    /// BIDS-style phase-encoding direction (`i`, `j-`, …).
    pub phase_encoding_direction: Option<String>,
    /// Total readout time in seconds, if stated directly.
    pub total_readout_time: Option<f64>,
    /// Effective echo spacing in seconds, for the fallback computation.
    pub effective_echo_spacing: Option<f64>,
}

/// Readout time and phase-encode axis of one series.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct DistortionParameters {
    /// Total readout time in seconds.
    pub readout_time: f64,
    /// Signed phase-encode axis.
    pub pe_dir: PhaseEncodeAxis,
}

impl DistortionParameters {
    /// Derive the parameters from acquisition metadata.
    ///
    /// The readout time is taken directly when stated, and otherwise
    /// recovered as `effective_echo_spacing * (pe_len - 1)` where `pe_len`
    /// is the matrix size along the encoded axis. Missing either source is
    /// a configuration error, surfaced before any resampling starts.
    pub fn from_metadata(metadata: &AcquisitionMetadata, pe_len: usize) -> Result<Self> {
        let pe_dir = metadata
            .phase_encoding_direction
            .as_deref()
            .ok_or_else(|| {
                VolXfmError::Configuration("missing phase-encoding direction".into())
            })?
            .parse::<PhaseEncodeAxis>()?;
        let readout_time = match (metadata.total_readout_time, metadata.effective_echo_spacing) {
            (Some(trt), _) => trt,
            (None, Some(ees)) => ees * (pe_len.saturating_sub(1)) as f64,
            (None, None) => {
                return Err(VolXfmError::Configuration(
                    "missing total readout time and effective echo spacing".into(),
                ))
            }
        };
        if readout_time <= 0.0 {
            return Err(VolXfmError::Configuration(format!(
                "non-positive readout time {}",
                readout_time
            )));
        }
        Ok(DistortionParameters {
            readout_time,
            pe_dir,
        })
    }
}

/// A cubic B-spline coefficient grid (control points in Hz) with its
/// voxel→physical affine. The knot spacing is the grid's voxel spacing.
#[derive(Debug, Clone)]
pub struct SplineCoefficients {
    coeffs: Array3<f64>,
    inverse: Affine4,
}

impl SplineCoefficients {
    /// Create a coefficient level.
    pub fn new(coeffs: Array3<f64>, affine: Affine4) -> Result<Self> {
        if coeffs.is_empty() {
            return Err(VolXfmError::Geometry(
                "empty spline coefficient grid".into(),
            ));
        }
        let inverse = invert_affine(&affine)?;
        Ok(SplineCoefficients { coeffs, inverse })
    }

    /// Evaluate the tensor-product cubic B-spline at a physical point.
    pub fn evaluate(&self, point: &Vector3<f64>) -> f64 {
        let v = apply_affine(&self.inverse, point);
        let shape = self.coeffs.shape();
        let mut value = 0.0;
        // Each axis contributes at most 4 supporting control points.
        let lo = |x: f64| (x - 2.0).ceil().max(0.0) as usize;
        let hi = |x: f64, n: usize| ((x + 2.0).floor() as isize).min(n as isize - 1);
        let (ilo, ihi) = (lo(v.x), hi(v.x, shape[0]));
        let (jlo, jhi) = (lo(v.y), hi(v.y, shape[1]));
        let (klo, khi) = (lo(v.z), hi(v.z, shape[2]));
        let mut k = klo as isize;
        while k <= khi {
            let wz = bspline3(v.z - k as f64);
            let mut j = jlo as isize;
            while j <= jhi {
                let wyz = wz * bspline3(v.y - j as f64);
                let mut i = ilo as isize;
                while i <= ihi {
                    value += wyz
                        * bspline3(v.x - i as f64)
                        * self.coeffs[(i as usize, j as usize, k as usize)];
                    i += 1;
                }
                j += 1;
            }
            k += 1;
        }
        value
    }
}

/// The cubic B-spline basis function.
fn bspline3(t: f64) -> f64 {
    let t = t.abs();
    if t < 1.0 {
        (4.0 - 6.0 * t * t + 3.0 * t * t * t) / 6.0
    } else if t < 2.0 {
        let u = 2.0 - t;
        u * u * u / 6.0
    } else {
        0.0
    }
}

/// One fieldmap estimate: an identifier plus one or more coefficient
/// levels whose contributions add up.
#[derive(Debug, Clone)]
pub struct FieldmapEstimator {
    id: String,
    levels: Vec<SplineCoefficients>,
}

impl FieldmapEstimator {
    /// Create an estimator from its identifier and coefficient levels.
    pub fn new<S: Into<String>>(id: S, levels: Vec<SplineCoefficients>) -> Self {
        FieldmapEstimator {
            id: id.into(),
            levels,
        }
    }

    /// The estimator's identifier.
    pub fn id(&self) -> &str {
        &self.id
    }

    /// Field value in Hz at a physical point in fieldmap space.
    pub fn field_at(&self, point: &Vector3<f64>) -> f64 {
        self.levels.iter().map(|l| l.evaluate(point)).sum()
    }
}

/// The set of fieldmap estimators available to a run, selected strictly by
/// identifier.
#[derive(Debug, Clone, Default)]
pub struct FieldmapRegistry {
    estimators: Vec<FieldmapEstimator>,
}

impl FieldmapRegistry {
    /// Empty registry.
    pub fn new() -> Self {
        FieldmapRegistry::default()
    }

    /// Register an estimator.
    pub fn insert(&mut self, estimator: FieldmapEstimator) {
        self.estimators.push(estimator);
    }

    /// Select an estimator by identifier.
    ///
    /// An unknown identifier is a configuration error; another fieldmap is
    /// never substituted.
    pub fn select(&self, id: &str) -> Result<&FieldmapEstimator> {
        self.estimators.iter().find(|e| e.id == id).ok_or_else(|| {
            let known: Vec<&str> = self.estimators.iter().map(|e| e.id.as_str()).collect();
            VolXfmError::Configuration(format!(
                "fieldmap {:?} not found among estimators {:?}",
                id, known
            ))
        })
    }
}

/// Evaluate an estimator's field on a target grid.
///
/// Every target voxel's physical coordinate is mapped through `chain`
/// (target space → fieldmap space) and the spline evaluated there; the
/// result is a grid-shaped array of Hz values.
pub fn reconstruct_fieldmap(
    estimator: &FieldmapEstimator,
    target: &SamplingGrid,
    chain: &TransformChain,
) -> Array3<f64> {
    debug!(
        "reconstructing fieldmap {:?} on {:?} grid",
        estimator.id(),
        target.shape()
    );
    let [nx, ny, nz] = target.shape();
    let mut hz = Array3::zeros((nx, ny, nz));
    Zip::indexed(&mut hz).par_for_each(|(i, j, k), value| {
        let p = target.voxel_to_physical(&Vector3::new(i as f64, j as f64, k as f64));
        *value = estimator.field_at(&chain.map_point(&p));
    });
    hz
}

/// Convert a reconstructed Hz field into a physical displacement field on
/// the target grid.
///
/// `hz * readout_time` (signed by polarity) is a shift in source voxels
/// along the phase-encode axis; scaling it by the source affine's
/// phase-encode column turns it into the equivalent RAS+ millimetre
/// displacement, so the record carries the same units as every other
/// displacement field in the crate.
pub fn to_displacement(
    hz: &Array3<f64>,
    target: &SamplingGrid,
    params: &DistortionParameters,
    source_affine: &Affine4,
) -> Result<DisplacementField> {
    let [nx, ny, nz] = target.shape();
    if hz.shape() != [nx, ny, nz] {
        return Err(VolXfmError::Geometry(format!(
            "fieldmap shape {:?} does not match target grid {:?}",
            hz.shape(),
            target.shape()
        )));
    }
    let axis = params.pe_dir.axis();
    let scale = params.readout_time * params.pe_dir.sign();
    let column = source_affine.fixed_view::<3, 1>(0, axis).into_owned();
    let mut field = Array4::zeros((nx, ny, nz, 3));
    Zip::indexed(hz).for_each(|(i, j, k), &value| {
        let d = column * (value * scale);
        field[(i, j, k, 0)] = d.x;
        field[(i, j, k, 1)] = d.y;
        field[(i, j, k, 2)] = d.z;
    });
    DisplacementField::new(field, *target.affine())
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_abs_diff_eq;

    #[test]
    fn pe_axis_parsing() {
        assert_eq!("j".parse::<PhaseEncodeAxis>().unwrap(), PhaseEncodeAxis::J);
        assert_eq!(
            "i-".parse::<PhaseEncodeAxis>().unwrap(),
            PhaseEncodeAxis::IReversed
        );
        assert!("q".parse::<PhaseEncodeAxis>().is_err());
        assert_eq!(PhaseEncodeAxis::KReversed.axis(), 2);
        assert_eq!(PhaseEncodeAxis::KReversed.sign(), -1.0);
    }

    #[test]
    fn parameters_from_metadata() {
        let meta = AcquisitionMetadata {
            phase_encoding_direction: Some("j-".into()),
            total_readout_time: Some(0.05),
            effective_echo_spacing: None,
        };
        let params = DistortionParameters::from_metadata(&meta, 64).unwrap();
        assert_abs_diff_eq!(params.readout_time, 0.05);
        assert_eq!(params.pe_dir, PhaseEncodeAxis::JReversed);
    }

    #[test]
    fn echo_spacing_fallback() {
        let meta = AcquisitionMetadata {
            phase_encoding_direction: Some("j".into()),
            total_readout_time: None,
            effective_echo_spacing: Some(0.001),
        };
        let params = DistortionParameters::from_metadata(&meta, 65).unwrap();
        assert_abs_diff_eq!(params.readout_time, 0.064);
    }

    #[test]
    fn missing_metadata_is_a_configuration_error() {
        let err = DistortionParameters::from_metadata(&AcquisitionMetadata::default(), 64)
            .unwrap_err();
        assert!(matches!(err, VolXfmError::Configuration(_)));
    }

    #[test]
    fn bspline_basis_partitions_unity() {
        // Sum of shifted basis functions is 1 everywhere.
        for &x in &[0.0, 0.25, 0.5, 0.9] {
            let total: f64 = (-2..=2).map(|k| bspline3(x - k as f64)).sum();
            assert_abs_diff_eq!(total, 1.0, epsilon = 1e-12);
        }
    }

    #[test]
    fn constant_coefficients_yield_constant_field() {
        let coeffs = Array3::from_elem((8, 8, 8), 10.0);
        let level = SplineCoefficients::new(coeffs, Affine4::identity()).unwrap();
        // Away from the grid edges, a constant coefficient field evaluates
        // to the constant.
        for &p in &[(3.0, 3.5, 4.0), (2.25, 5.0, 3.75)] {
            let v = level.evaluate(&Vector3::new(p.0, p.1, p.2));
            assert_abs_diff_eq!(v, 10.0, epsilon = 1e-9);
        }
    }

    #[test]
    fn registry_selects_by_identifier_only() {
        let coeffs = Array3::from_elem((4, 4, 4), 1.0);
        let level = SplineCoefficients::new(coeffs, Affine4::identity()).unwrap();
        let mut registry = FieldmapRegistry::new();
        registry.insert(FieldmapEstimator::new("auto_00000", vec![level]));

        assert!(registry.select("auto_00000").is_ok());
        let err = registry.select("auto_00001").unwrap_err();
        assert!(matches!(err, VolXfmError::Configuration(_)));
    }

    #[test]
    fn displacement_follows_readout_time_and_axis() {
        // 10 Hz over 0.02 s along j must move 0.2 along j and nothing else.
        let target = SamplingGrid::new([2, 2, 2], Affine4::identity()).unwrap();
        let mut hz = Array3::zeros((2, 2, 2));
        hz[(1, 1, 1)] = 10.0;
        let params = DistortionParameters {
            readout_time: 0.02,
            pe_dir: PhaseEncodeAxis::J,
        };
        let field = to_displacement(&hz, &target, &params, &Affine4::identity()).unwrap();
        assert_abs_diff_eq!(field.field()[(0, 0, 0, 1)], 0.0);
        assert_abs_diff_eq!(field.field()[(1, 1, 1, 1)], 0.2, epsilon = 1e-12);
        assert_abs_diff_eq!(field.field()[(1, 1, 1, 0)], 0.0);
        assert_abs_diff_eq!(field.field()[(1, 1, 1, 2)], 0.0);
    }

    #[test]
    fn displacement_scales_with_source_voxel_size() {
        // On a 2 mm source grid the same 0.2-voxel shift is 0.4 mm.
        let target = SamplingGrid::new([2, 2, 2], Affine4::identity()).unwrap();
        let hz = Array3::from_elem((2, 2, 2), 10.0);
        let params = DistortionParameters {
            readout_time: 0.02,
            pe_dir: PhaseEncodeAxis::J,
        };
        let mut source = Affine4::identity();
        source[(0, 0)] = 2.0;
        source[(1, 1)] = 2.0;
        source[(2, 2)] = 2.0;
        let field = to_displacement(&hz, &target, &params, &source).unwrap();
        assert_abs_diff_eq!(field.field()[(1, 1, 1, 1)], 0.4, epsilon = 1e-12);
        assert_abs_diff_eq!(field.field()[(1, 1, 1, 0)], 0.0);
    }
}
