//! Ordered, composable, invertible transform chains.
//!
//! A [`TransformChain`] holds records `[T_1, …, T_n]`; applying the chain to
//! a point `p` computes `T_n(T_{n-1}(…T_1(p)))`, so the first record is the
//! first one applied. An empty chain is the identity map.
//!
//! Chains exist so that an arbitrary stack of corrections can be collapsed
//! into *one* mapping per voxel and the series interpolated exactly once.
//! [`TransformChain::apply_to_grid`] evaluates the chain at every physical
//! coordinate of a target grid and returns the result as a [`GridMapping`],
//! which callers cache per target grid; the per-volume (motion) variation is
//! then applied to the cached coordinates as a plain affine, never through
//! the expensive non-linear segment again.

use nalgebra::Vector3;
use ndarray::Array2;

use crate::affine::{apply_affine, Affine4};
use crate::error::Result;
use crate::grid::SamplingGrid;
use crate::transform::{DisplacementField, TransformRecord};

/// An ordered sequence of transforms applied first-to-last.
#[derive(Debug, Clone, Default)]
pub struct TransformChain {
    records: Vec<TransformRecord>,
}

impl TransformChain {
    /// The identity chain.
    pub fn identity() -> Self {
        TransformChain::default()
    }

    /// Build a chain from records in application order.
    pub fn from_records(records: Vec<TransformRecord>) -> Self {
        TransformChain { records }
    }

    /// Append a record to be applied after the current last one.
    pub fn push(&mut self, record: TransformRecord) {
        self.records.push(record);
    }

    /// Concatenate: `self` applied first, then `other`.
    pub fn then(mut self, other: TransformChain) -> Self {
        self.records.extend(other.records);
        self
    }

    /// The records, in application order.
    pub fn records(&self) -> &[TransformRecord] {
        &self.records
    }

    /// Number of records in the chain.
    pub fn len(&self) -> usize {
        self.records.len()
    }

    /// Whether the chain is the (empty) identity.
    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }

    /// Map a physical point through the whole chain.
    pub fn map_point(&self, point: &Vector3<f64>) -> Vector3<f64> {
        self.records
            .iter()
            .fold(*point, |p, record| record.map_point(&p))
    }

    /// Invert the chain: `[inv(T_n), …, inv(T_1)]`.
    pub fn invert(&self) -> Result<TransformChain> {
        let mut records = Vec::with_capacity(self.records.len());
        for record in self.records.iter().rev() {
            records.push(record.invert()?);
        }
        Ok(TransformChain { records })
    }

    /// Collapse runs of consecutive affines into single matrices.
    ///
    /// Displacement fields break the runs; the segment sequence is
    /// equivalent to the original chain.
    fn segments(&self) -> Vec<Segment<'_>> {
        let mut segments: Vec<Segment<'_>> = Vec::new();
        for record in &self.records {
            match record {
                TransformRecord::Affine(a) => match segments.last_mut() {
                    Some(Segment::Affine(acc)) => *acc = a * *acc,
                    _ => segments.push(Segment::Affine(*a)),
                },
                TransformRecord::Field(f) => segments.push(Segment::Field(f)),
            }
        }
        segments
    }

    /// Evaluate the chain at every physical coordinate of `grid`.
    ///
    /// The result maps each grid voxel (in [`SamplingGrid::ndcoords`] row
    /// order) to its chained physical coordinate. This is the expensive,
    /// shareable part of resampling; callers evaluate it once per target
    /// grid and reuse it across volumes.
    pub fn apply_to_grid(&self, grid: &SamplingGrid) -> GridMapping {
        let mut coords = grid.ndcoords();
        for segment in self.segments() {
            match segment {
                Segment::Affine(a) => map_rows_affine(&mut coords, &a),
                Segment::Field(f) => {
                    for mut row in coords.rows_mut() {
                        let p = Vector3::new(row[0], row[1], row[2]);
                        let q = f.map_point(&p);
                        row[0] = q.x;
                        row[1] = q.y;
                        row[2] = q.z;
                    }
                }
            }
        }
        GridMapping {
            shape: grid.shape(),
            coords,
        }
    }
}

enum Segment<'a> {
    Affine(Affine4),
    Field(&'a DisplacementField),
}

/// The evaluation of a chain on a target grid: one mapped physical
/// coordinate per voxel, in `ndcoords` row order.
///
/// A `GridMapping` is write-once, read-many shared state. The per-volume
/// refinement ([`GridMapping::compose_affine`]) allocates a fresh coordinate
/// array, leaving the cached mapping untouched for the next volume.
#[derive(Debug, Clone)]
pub struct GridMapping {
    shape: [usize; 3],
    coords: Array2<f64>,
}

impl GridMapping {
    /// Shape of the grid this mapping was evaluated on.
    pub fn shape(&self) -> [usize; 3] {
        self.shape
    }

    /// The `(N, 3)` mapped physical coordinates.
    pub fn coords(&self) -> &Array2<f64> {
        &self.coords
    }

    /// Apply a further affine to every mapped coordinate, returning the new
    /// coordinate array. This is the cheap, per-volume step.
    pub fn compose_affine(&self, affine: &Affine4) -> Array2<f64> {
        let mut coords = self.coords.clone();
        map_rows_affine(&mut coords, affine);
        coords
    }
}

fn map_rows_affine(coords: &mut Array2<f64>, affine: &Affine4) {
    for mut row in coords.rows_mut() {
        let p = apply_affine(affine, &Vector3::new(row[0], row[1], row[2]));
        row[0] = p.x;
        row[1] = p.y;
        row[2] = p.z;
    }
}
