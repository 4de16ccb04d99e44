//! Plain-text RAS+ affine files.
//!
//! The simplest serialization: four whitespace-separated rows of four
//! numbers, already mapping physical RAS+ to physical RAS+. Lines starting
//! with `#` are ignored.

use std::fs;
use std::path::Path;

use crate::affine::Affine4;
use crate::error::{Result, VolXfmError};
use crate::transform::TransformRecord;

/// Read a plain-text 4×4 RAS+ affine.
pub fn load(path: &Path) -> Result<TransformRecord> {
    let text = fs::read_to_string(path)?;
    Ok(TransformRecord::Affine(parse_matrix(&text, path)?))
}

pub(crate) fn parse_matrix(text: &str, path: &Path) -> Result<Affine4> {
    let values: Vec<f64> = text
        .lines()
        .filter(|line| !line.trim_start().starts_with('#'))
        .flat_map(str::split_whitespace)
        .map(|tok| {
            tok.parse::<f64>()
                .map_err(|_| VolXfmError::format(path, format!("not a number: {:?}", tok)))
        })
        .collect::<Result<_>>()?;
    if values.len() != 16 {
        return Err(VolXfmError::format(
            path,
            format!("expected 16 matrix entries, found {}", values.len()),
        ));
    }
    let mut affine = Affine4::zeros();
    for i in 0..4 {
        for j in 0..4 {
            affine[(i, j)] = values[i * 4 + j];
        }
    }
    Ok(affine)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn reads_a_matrix_with_comments() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("xfm.txt");
        let mut f = std::fs::File::create(&path).unwrap();
        writeln!(f, "# boldref to anat").unwrap();
        writeln!(f, "1 0 0 2.5").unwrap();
        writeln!(f, "0 1 0 -3.0").unwrap();
        writeln!(f, "0 0 1 0.0").unwrap();
        writeln!(f, "0 0 0 1").unwrap();

        let record = load(&path).unwrap();
        match record {
            TransformRecord::Affine(a) => {
                assert_eq!(a[(0, 3)], 2.5);
                assert_eq!(a[(1, 3)], -3.0);
            }
            _ => panic!("expected an affine"),
        }
    }

    #[test]
    fn truncated_matrix_is_a_format_error() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("xfm.txt");
        std::fs::write(&path, "1 0 0\n0 1 0\n").unwrap();
        let err = load(&path).unwrap_err();
        assert!(matches!(err, VolXfmError::Format(..)));
    }

    #[test]
    fn garbage_token_is_a_format_error() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("xfm.txt");
        std::fs::write(&path, "1 0 0 0\n0 one 0 0\n0 0 1 0\n0 0 0 1\n").unwrap();
        assert!(load(&path).is_err());
    }
}
