//! Insight Transform File text affines.
//!
//! These files store a linear transform as twelve parameters (a row-major
//! 3×3 matrix followed by a translation) plus a center of rotation in the
//! fixed parameters, all in LPS coordinates:
//!
//! ```text
//! #Insight Transform File V1.0
//! #Transform 0
//! Transform: MatrixOffsetTransformBase_double_3_3
//! Parameters: <9 matrix entries> <3 translation entries>
//! FixedParameters: <3 center entries>
//! ```
//!
//! The stored mapping is `y = A (x - c) + t + c`; the reader folds the
//! center into the translation and converts the result to RAS+ on the spot.
//! Files may hold several `#Transform` blocks (per-volume motion transform
//! arrays); [`load_array`] reads them all in order.

use std::fs;
use std::path::Path;

use nalgebra::Vector3;

use crate::affine::{lps_to_ras, Affine4};
use crate::error::{Result, VolXfmError};
use crate::transform::TransformRecord;

/// Linear transform type tags accepted by this reader.
const LINEAR_TRANSFORM_TYPES: &[&str] = &[
    "MatrixOffsetTransformBase",
    "AffineTransform",
    "Euler3DTransform",
    "Rigid3DTransform",
];

/// Read a single-transform Insight text file.
pub fn load(path: &Path) -> Result<TransformRecord> {
    let transforms = load_array(path)?;
    match transforms.len() {
        1 => Ok(transforms.into_iter().next().unwrap()),
        n => Err(VolXfmError::format(
            path,
            format!("expected a single transform, found {}", n),
        )),
    }
}

/// Read every transform block of an Insight text file, in file order.
pub fn load_array(path: &Path) -> Result<Vec<TransformRecord>> {
    let text = fs::read_to_string(path)?;
    let mut lines = text.lines();
    match lines.next() {
        Some(first) if first.starts_with("#Insight Transform File") => {}
        _ => {
            return Err(VolXfmError::format(
                path,
                "missing '#Insight Transform File' header",
            ))
        }
    }

    let mut transforms = Vec::new();
    let mut current: Option<PendingTransform> = None;
    for line in lines {
        let line = line.trim();
        if let Some(value) = strip_key(line, "Transform:") {
            if let Some(pending) = current.take() {
                transforms.push(pending.finish(path)?);
            }
            if !LINEAR_TRANSFORM_TYPES
                .iter()
                .any(|t| value.starts_with(t))
            {
                return Err(VolXfmError::format(
                    path,
                    format!("unsupported transform type {:?}", value),
                ));
            }
            current = Some(PendingTransform::default());
        } else if let Some(value) = strip_key(line, "Parameters:") {
            match current.as_mut() {
                Some(pending) => pending.parameters = parse_floats(value, path)?,
                None => {
                    return Err(VolXfmError::format(
                        path,
                        "Parameters before any Transform line",
                    ))
                }
            }
        } else if let Some(value) = strip_key(line, "FixedParameters:") {
            match current.as_mut() {
                Some(pending) => pending.fixed = parse_floats(value, path)?,
                None => {
                    return Err(VolXfmError::format(
                        path,
                        "FixedParameters before any Transform line",
                    ))
                }
            }
        }
    }
    if let Some(pending) = current.take() {
        transforms.push(pending.finish(path)?);
    }
    if transforms.is_empty() {
        return Err(VolXfmError::format(path, "no transform blocks found"));
    }
    Ok(transforms)
}

#[derive(Debug, Default)]
struct PendingTransform {
    parameters: Vec<f64>,
    fixed: Vec<f64>,
}

impl PendingTransform {
    fn finish(self, path: &Path) -> Result<TransformRecord> {
        if self.parameters.len() != 12 {
            return Err(VolXfmError::format(
                path,
                format!(
                    "expected 12 linear transform parameters, found {}",
                    self.parameters.len()
                ),
            ));
        }
        let center = match self.fixed.len() {
            0 => Vector3::zeros(),
            3 => Vector3::new(self.fixed[0], self.fixed[1], self.fixed[2]),
            n => {
                return Err(VolXfmError::format(
                    path,
                    format!("expected 3 fixed parameters, found {}", n),
                ))
            }
        };

        Ok(TransformRecord::Affine(linear_from_parameters(
            &self.parameters,
            &center,
        )))
    }
}

/// Build a RAS+ affine from the twelve LPS linear parameters and a center
/// of rotation, folding the center into the translation column.
pub(crate) fn linear_from_parameters(parameters: &[f64], center: &Vector3<f64>) -> Affine4 {
    let mut lps = Affine4::identity();
    for i in 0..3 {
        for j in 0..3 {
            lps[(i, j)] = parameters[i * 3 + j];
        }
    }
    let translation = Vector3::new(parameters[9], parameters[10], parameters[11]);
    let linear = lps.fixed_view::<3, 3>(0, 0).into_owned();
    let offset = translation + center - linear * center;
    lps[(0, 3)] = offset.x;
    lps[(1, 3)] = offset.y;
    lps[(2, 3)] = offset.z;
    lps_to_ras(&lps)
}

fn strip_key<'a>(line: &'a str, key: &str) -> Option<&'a str> {
    line.strip_prefix(key).map(str::trim)
}

fn parse_floats(text: &str, path: &Path) -> Result<Vec<f64>> {
    text.split_whitespace()
        .map(|tok| {
            tok.parse::<f64>()
                .map_err(|_| VolXfmError::format(path, format!("not a number: {:?}", tok)))
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_abs_diff_eq;
    use std::io::Write;

    fn write_file(body: &str) -> (tempfile::TempDir, std::path::PathBuf) {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("xfm.txt");
        let mut f = std::fs::File::create(&path).unwrap();
        write!(f, "{}", body).unwrap();
        (dir, path)
    }

    #[test]
    fn pure_translation_flips_into_ras() {
        let (_dir, path) = write_file(
            "#Insight Transform File V1.0\n\
             #Transform 0\n\
             Transform: MatrixOffsetTransformBase_double_3_3\n\
             Parameters: 1 0 0 0 1 0 0 0 1 2 3 4\n\
             FixedParameters: 0 0 0\n",
        );
        let record = load(&path).unwrap();
        let affine = match record {
            TransformRecord::Affine(a) => a,
            _ => panic!("expected an affine"),
        };
        // An LPS translation of (2, 3, 4) is (-2, -3, 4) in RAS+.
        assert_abs_diff_eq!(affine[(0, 3)], -2.0);
        assert_abs_diff_eq!(affine[(1, 3)], -3.0);
        assert_abs_diff_eq!(affine[(2, 3)], 4.0);
    }

    #[test]
    fn center_of_rotation_is_folded_in() {
        // 90 degree rotation about z around center (1, 0, 0), identity-free
        // check: y = A(x - c) + t + c.
        let (_dir, path) = write_file(
            "#Insight Transform File V1.0\n\
             #Transform 0\n\
             Transform: AffineTransform_double_3_3\n\
             Parameters: 0 -1 0 1 0 0 0 0 1 0 0 0\n\
             FixedParameters: 1 0 0\n",
        );
        let record = load(&path).unwrap();
        let affine = match record {
            TransformRecord::Affine(a) => a,
            _ => panic!("expected an affine"),
        };
        // In LPS: x = (1, 0, 0) (the center) maps to itself.
        // Converted to RAS that fixed point is (-1, 0, 0).
        let p = nalgebra::Vector3::new(-1.0, 0.0, 0.0);
        let q = crate::affine::apply_affine(&affine, &p);
        assert_abs_diff_eq!(q, p, epsilon = 1e-12);
    }

    #[test]
    fn motion_arrays_preserve_order() {
        let (_dir, path) = write_file(
            "#Insight Transform File V1.0\n\
             #Transform 0\n\
             Transform: Euler3DTransform_double_3_3\n\
             Parameters: 1 0 0 0 1 0 0 0 1 1 0 0\n\
             FixedParameters: 0 0 0\n\
             #Transform 1\n\
             Transform: Euler3DTransform_double_3_3\n\
             Parameters: 1 0 0 0 1 0 0 0 1 2 0 0\n\
             FixedParameters: 0 0 0\n",
        );
        let records = load_array(&path).unwrap();
        assert_eq!(records.len(), 2);
        let t = |r: &TransformRecord| match r {
            TransformRecord::Affine(a) => a[(0, 3)],
            _ => panic!("expected an affine"),
        };
        assert_abs_diff_eq!(t(&records[0]), -1.0);
        assert_abs_diff_eq!(t(&records[1]), -2.0);
    }

    #[test]
    fn unsupported_type_is_a_format_error() {
        let (_dir, path) = write_file(
            "#Insight Transform File V1.0\n\
             Transform: BSplineTransform_double_3_3\n\
             Parameters: 0\n",
        );
        let err = load(&path).unwrap_err();
        assert!(matches!(err, VolXfmError::Format(..)));
    }

    #[test]
    fn missing_header_is_a_format_error() {
        let (_dir, path) = write_file("Transform: AffineTransform_double_3_3\n");
        assert!(load(&path).is_err());
    }
}
