//! 4-D BOLD series data.

use ndarray::Array4;

use crate::affine::Affine4;
use crate::error::{Result, VolXfmError};
use crate::grid::SamplingGrid;

/// A 4-D functional series: a stack of 3-D volumes sharing one grid,
/// with optional per-volume motion transforms.
#[derive(Debug, Clone)]
pub struct BoldSeries {
    data: Array4<f32>,
    affine: Affine4,
    motion: Option<Vec<Affine4>>,
    frame_times: Option<Vec<f64>>,
}

impl BoldSeries {
    /// Create a series from its data (x, y, z, t) and voxel→physical
    /// affine.
    pub fn new(data: Array4<f32>, affine: Affine4) -> Result<Self> {
        let shape = data.shape();
        if shape.iter().any(|&n| n == 0) {
            return Err(VolXfmError::Geometry(format!(
                "empty series shape {:?}",
                shape
            )));
        }
        Ok(BoldSeries {
            data,
            affine,
            motion: None,
            frame_times: None,
        })
    }

    /// Attach per-volume motion transforms: head-motion estimates mapping
    /// reference-space coordinates into each volume's own space, the
    /// direction registration tools write them in.
    ///
    /// The number of transforms must equal the number of volumes.
    pub fn with_motion(mut self, motion: Vec<Affine4>) -> Result<Self> {
        if motion.len() != self.num_volumes() {
            return Err(VolXfmError::Configuration(format!(
                "{} motion transforms for {} volumes",
                motion.len(),
                self.num_volumes()
            )));
        }
        self.motion = Some(motion);
        Ok(self)
    }

    /// Attach per-volume acquisition times in seconds.
    pub fn with_frame_times(mut self, frame_times: Vec<f64>) -> Result<Self> {
        if frame_times.len() != self.num_volumes() {
            return Err(VolXfmError::Configuration(format!(
                "{} frame times for {} volumes",
                frame_times.len(),
                self.num_volumes()
            )));
        }
        self.frame_times = Some(frame_times);
        Ok(self)
    }

    /// The voxel data, indexed (x, y, z, t).
    pub fn data(&self) -> &Array4<f32> {
        &self.data
    }

    /// Voxel→physical affine of the series grid.
    pub fn affine(&self) -> &Affine4 {
        &self.affine
    }

    /// Spatial shape of each volume.
    pub fn volume_shape(&self) -> [usize; 3] {
        let s = self.data.shape();
        [s[0], s[1], s[2]]
    }

    /// Number of volumes in the series.
    pub fn num_volumes(&self) -> usize {
        self.data.shape()[3]
    }

    /// Per-volume motion transforms, if attached.
    pub fn motion(&self) -> Option<&[Affine4]> {
        self.motion.as_deref()
    }

    /// Per-volume acquisition times, if attached.
    pub fn frame_times(&self) -> Option<&[f64]> {
        self.frame_times.as_deref()
    }

    /// The series' spatial grid.
    pub fn grid(&self) -> Result<SamplingGrid> {
        SamplingGrid::new(self.volume_shape(), self.affine)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use ndarray::Array4;

    #[test]
    fn motion_count_must_match_volumes() {
        let series = BoldSeries::new(Array4::zeros((2, 2, 2, 3)), Affine4::identity()).unwrap();
        let err = series
            .clone()
            .with_motion(vec![Affine4::identity(); 2])
            .unwrap_err();
        assert!(matches!(err, VolXfmError::Configuration(_)));
        assert!(series.with_motion(vec![Affine4::identity(); 3]).is_ok());
    }

    #[test]
    fn frame_time_count_must_match_volumes() {
        let series = BoldSeries::new(Array4::zeros((2, 2, 2, 3)), Affine4::identity()).unwrap();
        assert!(series.clone().with_frame_times(vec![0.0, 2.0]).is_err());
        let series = series.with_frame_times(vec![0.0, 2.0, 4.0]).unwrap();
        assert_eq!(series.frame_times().unwrap().len(), 3);
    }

    #[test]
    fn empty_series_is_rejected() {
        assert!(BoldSeries::new(Array4::zeros((2, 2, 0, 3)), Affine4::identity()).is_err());
    }
}
