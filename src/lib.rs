//! Geometric transform composition and one-shot resampling of 4-D
//! functional MRI series.
//!
//! The crate reads registration transforms from the formats estimation
//! tools write (Insight text affines, FLIRT matrices, linear transform
//! arrays, plain RAS matrices and a binary composite container),
//! normalizes them into physical RAS+ mappings, composes them into a
//! single chain, and resamples every volume of a series through that
//! chain in one interpolation pass. Head motion is applied per volume and
//! susceptibility distortion is corrected from B-spline fieldmap
//! coefficients along the phase-encode axis.
//!
//! ```no_run
//! use volxfm::{BoldSeries, Interpolation, ResamplePlan, TransformSpec};
//! # fn run(series: BoldSeries) -> volxfm::Result<()> {
//! let out = ResamplePlan::new(series.grid()?)
//!     .through(TransformSpec::new("boldref2anat.txt"))
//!     .through(TransformSpec::new("anat2std.cxfm"))
//!     .with_interpolation(Interpolation::BSpline3)
//!     .execute(&series, None)?;
//! # let _ = out; Ok(())
//! # }
//! ```
#![deny(missing_debug_implementations)]
#![warn(missing_docs, unused_extern_crates, trivial_casts)]

#[macro_use]
extern crate quick_error;

pub mod affine;
pub mod error;
pub mod fieldmap;
pub mod grid;
pub mod interp;
pub mod io;
pub mod resample;
pub mod series;
pub mod transform;
pub mod wiring;

pub use affine::Affine4;
pub use error::{Result, VolXfmError};
pub use fieldmap::{
    to_displacement, AcquisitionMetadata, DistortionParameters, FieldmapRegistry, PhaseEncodeAxis,
};
pub use grid::SamplingGrid;
pub use interp::Interpolation;
pub use io::{TransformFormat, TransformSpec, VolumeGeometry};
pub use resample::{DistortionCorrection, ResampleEngine, ResampleOutput};
pub use series::BoldSeries;
pub use transform::{DisplacementField, TransformChain, TransformRecord};
pub use wiring::{FieldmapRequest, ResamplePlan};
