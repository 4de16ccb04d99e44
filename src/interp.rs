//! Scalar volume interpolation.
//!
//! A [`VolumeSampler`] wraps one 3-D volume and evaluates it at arbitrary
//! voxel coordinates. Cubic B-spline interpolation runs the standard
//! recursive prefilter over the volume once, so that interpolation at
//! integer coordinates reproduces the original samples; nearest and
//! trilinear sampling use the raw values.
//!
//! Coordinates outside `[0, n-1]` on any axis are out of view and sample
//! to `None`; in-bounds coordinates clamp their edge taps.

use ndarray::{Array3, ArrayView3, Axis};
use num_traits::ToPrimitive;

/// Pole of the cubic B-spline prefilter.
const BSPLINE3_POLE: f64 = -0.267_949_192_431_122_7; // sqrt(3) - 2
/// Overall prefilter gain for the cubic pole.
const BSPLINE3_GAIN: f64 = 6.0;

/// Interpolation method for volume resampling.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Interpolation {
    /// Nearest-neighbour lookup.
    Nearest,
    /// Trilinear interpolation.
    Linear,
    /// Cubic B-spline interpolation with prefiltering.
    BSpline3,
}

impl Default for Interpolation {
    fn default() -> Self {
        Interpolation::BSpline3
    }
}

/// A single volume prepared for repeated point evaluation.
#[derive(Debug, Clone)]
pub struct VolumeSampler {
    method: Interpolation,
    /// Raw samples, or spline coefficients for [`Interpolation::BSpline3`].
    values: Array3<f64>,
}

impl VolumeSampler {
    /// Prepare a volume for sampling, prefiltering if the method needs it.
    pub fn new<T>(volume: ArrayView3<T>, method: Interpolation) -> Self
    where
        T: ToPrimitive + Copy,
    {
        let mut values = volume.mapv(|v| v.to_f64().unwrap_or_default());
        if method == Interpolation::BSpline3 {
            prefilter(&mut values);
        }
        VolumeSampler { method, values }
    }

    /// Evaluate the volume at a voxel coordinate.
    ///
    /// Returns `None` when the coordinate falls outside the volume extent
    /// on any axis.
    pub fn sample(&self, x: f64, y: f64, z: f64) -> Option<f64> {
        let shape = self.values.shape();
        if !in_extent(x, shape[0]) || !in_extent(y, shape[1]) || !in_extent(z, shape[2]) {
            return None;
        }
        let value = match self.method {
            Interpolation::Nearest => {
                let i = nearest_index(x, shape[0]);
                let j = nearest_index(y, shape[1]);
                let k = nearest_index(z, shape[2]);
                self.values[(i, j, k)]
            }
            Interpolation::Linear => self.linear(x, y, z),
            Interpolation::BSpline3 => self.bspline3(x, y, z),
        };
        Some(value)
    }

    fn linear(&self, x: f64, y: f64, z: f64) -> f64 {
        let shape = self.values.shape();
        let (i0, fx) = split(x);
        let (j0, fy) = split(y);
        let (k0, fz) = split(z);
        let mut value = 0.0;
        for dk in 0..2 {
            let wz = if dk == 0 { 1.0 - fz } else { fz };
            for dj in 0..2 {
                let wy = if dj == 0 { 1.0 - fy } else { fy };
                for di in 0..2 {
                    let wx = if di == 0 { 1.0 - fx } else { fx };
                    let i = clamp_index(i0 + di, shape[0]);
                    let j = clamp_index(j0 + dj, shape[1]);
                    let k = clamp_index(k0 + dk, shape[2]);
                    value += wx * wy * wz * self.values[(i, j, k)];
                }
            }
        }
        value
    }

    fn bspline3(&self, x: f64, y: f64, z: f64) -> f64 {
        let shape = self.values.shape();
        let (wx, ix) = taps(x);
        let (wy, jy) = taps(y);
        let (wz, kz) = taps(z);
        let mut value = 0.0;
        for (dk, &wk) in wz.iter().enumerate() {
            let k = clamp_index(kz + dk as isize, shape[2]);
            for (dj, &wj) in wy.iter().enumerate() {
                let j = clamp_index(jy + dj as isize, shape[1]);
                let wjk = wj * wk;
                for (di, &wi) in wx.iter().enumerate() {
                    let i = clamp_index(ix + di as isize, shape[0]);
                    value += wi * wjk * self.values[(i, j, k)];
                }
            }
        }
        value
    }
}

fn in_extent(coord: f64, len: usize) -> bool {
    coord >= 0.0 && coord <= (len - 1) as f64
}

fn nearest_index(coord: f64, len: usize) -> usize {
    (coord.round() as usize).min(len - 1)
}

fn clamp_index(index: isize, len: usize) -> usize {
    index.max(0).min(len as isize - 1) as usize
}

fn split(coord: f64) -> (isize, f64) {
    let base = coord.floor();
    (base as isize, coord - base)
}

/// Cubic B-spline weights for the four taps starting at `floor(coord) - 1`.
fn taps(coord: f64) -> ([f64; 4], isize) {
    let (base, t) = split(coord);
    let u = 1.0 - t;
    let weights = [
        u * u * u / 6.0,
        (4.0 - 6.0 * t * t + 3.0 * t * t * t) / 6.0,
        (4.0 - 6.0 * u * u + 3.0 * u * u * u) / 6.0,
        t * t * t / 6.0,
    ];
    (weights, base - 1)
}

/// In-place recursive prefilter turning samples into B-spline coefficients.
fn prefilter(values: &mut Array3<f64>) {
    for axis in 0..3 {
        for mut lane in values.lanes_mut(Axis(axis)) {
            if let Some(slice) = lane.as_slice_mut() {
                filter_line(slice);
            } else {
                let mut buf: Vec<f64> = lane.iter().copied().collect();
                filter_line(&mut buf);
                for (dst, src) in lane.iter_mut().zip(&buf) {
                    *dst = *src;
                }
            }
        }
    }
}

fn filter_line(line: &mut [f64]) {
    let n = line.len();
    if n < 2 {
        return;
    }
    let z = BSPLINE3_POLE;
    for v in line.iter_mut() {
        *v *= BSPLINE3_GAIN;
    }
    // Causal pass, initialized under mirror boundary conditions.
    line[0] = initial_causal(line, z);
    for i in 1..n {
        line[i] += z * line[i - 1];
    }
    // Anticausal pass.
    line[n - 1] = (z / (z * z - 1.0)) * (line[n - 1] + z * line[n - 2]);
    for i in (0..n - 1).rev() {
        line[i] = z * (line[i + 1] - line[i]);
    }
}

fn initial_causal(line: &[f64], z: f64) -> f64 {
    // Truncate the geometric series once terms drop below 1e-10.
    let horizon = ((1e-10f64).ln() / z.abs().ln()).ceil() as usize;
    let horizon = horizon.min(line.len());
    let mut sum = line[0];
    let mut zn = z;
    for &v in line.iter().take(horizon).skip(1) {
        sum += zn * v;
        zn *= z;
    }
    sum
}
