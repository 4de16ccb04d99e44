//! End-to-end resampling plans.
//!
//! A [`ResamplePlan`] ties the pieces together the way a preprocessing
//! pipeline hands them over: a target grid, the stack of registration
//! files from the series reference towards the target space, and an
//! optional susceptibility-correction request naming a fieldmap estimator.
//!
//! Registration files are listed closest-to-source first (reference→anat,
//! anat→template, …). The fieldmap evaluation chain reuses the same stack
//! prefixed with the inverted reference→fieldmap registration, so the
//! fieldmap is evaluated exactly where each output voxel samples the
//! distorted space. Configuration problems (unknown fieldmap identifier,
//! missing metadata, missing geometries) surface before any volume is
//! touched.

use log::{debug, info};

use crate::error::{Result, VolXfmError};
use crate::fieldmap::{
    reconstruct_fieldmap, to_displacement, AcquisitionMetadata, DistortionParameters,
    FieldmapRegistry, PhaseEncodeAxis,
};
use crate::grid::SamplingGrid;
use crate::interp::Interpolation;
use crate::io::{load_chain, TransformSpec};
use crate::resample::{DistortionCorrection, ResampleEngine, ResampleOutput};
use crate::series::BoldSeries;

/// A request to correct susceptibility distortion with a named estimator.
#[derive(Debug, Clone)]
pub struct FieldmapRequest {
    /// Identifier of the fieldmap estimator to use.
    pub id: String,
    /// Registration from the series reference to the fieldmap space, if
    /// the fieldmap was estimated in its own space. Inverted when the
    /// fieldmap evaluation chain is assembled.
    pub boldref2fmap: Option<TransformSpec>,
    /// Acquisition metadata of the series being corrected.
    pub metadata: AcquisitionMetadata,
    /// Whether to apply Jacobian intensity weighting.
    pub jacobian: bool,
}

/// Everything needed to resample one series into one target space.
#[derive(Debug, Clone)]
pub struct ResamplePlan {
    target: SamplingGrid,
    boldref2target: Vec<TransformSpec>,
    fieldmap: Option<FieldmapRequest>,
    interpolation: Interpolation,
    fill_value: f32,
}

impl ResamplePlan {
    /// Plan a resampling into `target`.
    pub fn new(target: SamplingGrid) -> Self {
        ResamplePlan {
            target,
            boldref2target: Vec::new(),
            fieldmap: None,
            interpolation: Interpolation::default(),
            fill_value: 0.0,
        }
    }

    /// Append a registration step on the way from the series reference to
    /// the target space.
    pub fn through(mut self, spec: TransformSpec) -> Self {
        self.boldref2target.push(spec);
        self
    }

    /// Request susceptibility correction.
    pub fn with_fieldmap(mut self, request: FieldmapRequest) -> Self {
        self.fieldmap = Some(request);
        self
    }

    /// Select the interpolation method.
    pub fn with_interpolation(mut self, interpolation: Interpolation) -> Self {
        self.interpolation = interpolation;
        self
    }

    /// Value written to out-of-view output voxels.
    pub fn with_fill_value(mut self, fill_value: f32) -> Self {
        self.fill_value = fill_value;
        self
    }

    /// Run the plan over a series.
    ///
    /// `registry` must be given whenever the plan requests a fieldmap; the
    /// requested identifier must match a registered estimator exactly.
    pub fn execute(
        &self,
        series: &BoldSeries,
        registry: Option<&FieldmapRegistry>,
    ) -> Result<ResampleOutput> {
        // Resolve the configuration-sensitive pieces up front.
        let distortion = match &self.fieldmap {
            Some(request) => Some(self.prepare_distortion(request, series, registry)?),
            None => None,
        };

        let chain = load_chain(&self.boldref2target, &[false])?;
        info!(
            "resampling {} volumes through {} transform(s) onto {:?}",
            series.num_volumes(),
            chain.len(),
            self.target.shape()
        );

        let mut engine = ResampleEngine::new(self.target.clone(), &chain)
            .with_interpolation(self.interpolation)
            .with_fill_value(self.fill_value);
        if let Some(correction) = distortion {
            engine = engine.with_distortion(correction)?;
        }
        engine.resample(series)
    }

    fn prepare_distortion(
        &self,
        request: &FieldmapRequest,
        series: &BoldSeries,
        registry: Option<&FieldmapRegistry>,
    ) -> Result<DistortionCorrection> {
        let registry = registry.ok_or_else(|| {
            VolXfmError::Configuration(format!(
                "fieldmap {:?} requested but no estimator registry was given",
                request.id
            ))
        })?;
        let estimator = registry.select(&request.id)?;

        let pe_dir = request
            .metadata
            .phase_encoding_direction
            .as_deref()
            .ok_or_else(|| {
                VolXfmError::Configuration("missing phase-encoding direction".into())
            })?
            .parse::<PhaseEncodeAxis>()?;
        let pe_len = series.volume_shape()[pe_dir.axis()];
        let params = DistortionParameters::from_metadata(&request.metadata, pe_len)?;

        // The fieldmap chain is the target chain prefixed with the
        // inverted fieldmap registration, so target voxels land in the
        // estimator's own space.
        let mut specs = Vec::new();
        let mut inverse = Vec::new();
        if let Some(spec) = &request.boldref2fmap {
            specs.push(spec.clone());
            inverse.push(true);
        }
        specs.extend(self.boldref2target.iter().cloned());
        inverse.resize(specs.len(), false);
        let fmap_chain = load_chain(&specs, &inverse)?;

        debug!(
            "evaluating fieldmap {:?} through {} transform(s)",
            request.id,
            fmap_chain.len()
        );
        let hz = reconstruct_fieldmap(estimator, &self.target, &fmap_chain);
        let field = to_displacement(&hz, &self.target, &params, series.affine())?;
        DistortionCorrection::from_field(&field, &params, series.affine(), request.jacobian)
    }
}
