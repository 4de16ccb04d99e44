//! Binary composite transform containers (`.cxfm`, optionally gzipped).
//!
//! A composite container bundles the ordered sub-transforms produced by a
//! non-linear registration: one global affine followed by one dense
//! displacement field. Each sub-transform is stored as a type tag, a
//! fixed-parameter block (`f64`) and a flat parameter buffer (`f32`), in
//! the registration tool's native LPS convention; the reader canonicalizes
//! everything to RAS+ and returns the records in application order.
//!
//! On-disk layout, after a 6-byte preamble of magic (`CXFM`), format
//! version and endianness tag:
//!
//! ```text
//! u32  number of sub-transforms
//! per sub-transform:
//!     u16  tag length, followed by that many ASCII bytes
//!     u32  fixed-parameter count, followed by that many f64
//!     u64  parameter count, followed by that many f32
//! ```
//!
//! For displacement fields the fixed parameters are the grid shape (3),
//! origin (3), spacing (3) and row-major direction cosines (9) — the
//! declared grid is authoritative and nothing about it is assumed; a
//! parameter buffer that disagrees with the declared shape is a geometry
//! error.

use std::fs::File;
use std::io::{BufReader, BufWriter, Read, Write};
use std::path::Path;

use byteordered::{ByteOrdered, Endianness};
use flate2::read::GzDecoder;
use flate2::write::GzEncoder;
use flate2::Compression;
use nalgebra::Vector3;
use ndarray::Array4;

use crate::affine::{grid_lps_to_ras, lps_to_ras, ras_flip, voxel_sizes, Affine4};
use crate::error::{Result, VolXfmError};
use crate::transform::{DisplacementField, TransformRecord};

const MAGIC: &[u8; 4] = b"CXFM";
const VERSION: u8 = 1;

/// Type tag of the affine sub-transform.
pub const AFFINE_TAG: &str = "AffineTransform_float_3_3";
/// Type tag of the displacement-field sub-transform.
pub const FIELD_TAG: &str = "DisplacementFieldTransform_float_3_3";

struct SubTransform {
    tag: String,
    fixed: Vec<f64>,
    parameters: Vec<f32>,
}

/// Read a composite container as its ordered records: `[affine, field]`.
pub fn load(path: &Path) -> Result<Vec<TransformRecord>> {
    let file = File::open(path)?;
    let reader: Box<dyn Read> = if is_gz_file(path) {
        Box::new(GzDecoder::new(file))
    } else {
        Box::new(file)
    };
    let mut reader = BufReader::new(reader);

    let mut preamble = [0u8; 6];
    reader
        .read_exact(&mut preamble)
        .map_err(|_| VolXfmError::format(path, "truncated container preamble"))?;
    if &preamble[..4] != MAGIC {
        return Err(VolXfmError::format(path, "not a composite transform container"));
    }
    if preamble[4] != VERSION {
        return Err(VolXfmError::format(
            path,
            format!("unsupported container version {}", preamble[4]),
        ));
    }
    let endianness = match preamble[5] {
        b'L' => Endianness::Little,
        b'B' => Endianness::Big,
        other => {
            return Err(VolXfmError::format(
                path,
                format!("bad endianness tag 0x{:02x}", other),
            ))
        }
    };

    let mut reader = ByteOrdered::runtime(reader, endianness);
    let count = reader
        .read_u32()
        .map_err(|_| VolXfmError::format(path, "truncated container header"))?;
    let mut subs = Vec::new();
    for _ in 0..count {
        subs.push(read_sub(&mut reader, path)?);
    }

    // Locate the sub-transforms by type tag; anything unrecognized is a
    // geometry error, not silently skipped.
    let mut records = Vec::with_capacity(subs.len());
    for sub in &subs {
        if sub.tag.starts_with("AffineTransform") || sub.tag.starts_with("MatrixOffsetTransformBase")
        {
            records.push(affine_record(sub, path)?);
        } else if sub.tag == FIELD_TAG {
            records.push(field_record(sub, path)?);
        } else {
            return Err(VolXfmError::Geometry(format!(
                "unsupported transform type tag {:?} in container {}",
                sub.tag,
                path.display()
            )));
        }
    }
    if !records.iter().any(|r| !r.is_affine()) {
        return Err(VolXfmError::format(
            path,
            "container holds no displacement field",
        ));
    }
    Ok(records)
}

/// Read one sub-transform record.
///
/// Declared counts are only trusted as far as the stream can back them:
/// values are read one at a time, so a malicious count surfaces as a
/// truncation error rather than a huge up-front allocation.
fn read_sub<R: Read>(
    reader: &mut ByteOrdered<R, Endianness>,
    path: &Path,
) -> Result<SubTransform> {
    let truncated = || VolXfmError::format(path, "truncated sub-transform record");

    let tag_len = reader.read_u16().map_err(|_| truncated())? as usize;
    let mut tag = vec![0u8; tag_len];
    reader.read_exact(&mut tag).map_err(|_| truncated())?;
    let tag = String::from_utf8(tag)
        .map_err(|_| VolXfmError::format(path, "non-UTF8 transform type tag"))?;

    let n_fixed = reader.read_u32().map_err(|_| truncated())? as usize;
    let mut fixed = Vec::new();
    for _ in 0..n_fixed {
        fixed.push(reader.read_f64().map_err(|_| truncated())?);
    }

    let n_params = reader.read_u64().map_err(|_| truncated())? as usize;
    let mut parameters = Vec::new();
    for _ in 0..n_params {
        parameters.push(reader.read_f32().map_err(|_| truncated())?);
    }
    Ok(SubTransform {
        tag,
        fixed,
        parameters,
    })
}

fn affine_record(sub: &SubTransform, path: &Path) -> Result<TransformRecord> {
    if sub.parameters.len() != 12 {
        return Err(VolXfmError::format(
            path,
            format!(
                "affine sub-transform has {} parameters, expected 12",
                sub.parameters.len()
            ),
        ));
    }
    let params: Vec<f64> = sub.parameters.iter().map(|&v| f64::from(v)).collect();
    let center = match sub.fixed.len() {
        0 => Vector3::zeros(),
        3 => Vector3::new(sub.fixed[0], sub.fixed[1], sub.fixed[2]),
        n => {
            return Err(VolXfmError::format(
                path,
                format!("affine sub-transform has {} fixed parameters, expected 3", n),
            ))
        }
    };
    Ok(TransformRecord::Affine(super::itk::linear_from_parameters(
        &params, &center,
    )))
}

fn field_record(sub: &SubTransform, path: &Path) -> Result<TransformRecord> {
    // shape + origin + spacing + direction cosines
    if sub.fixed.len() != 18 {
        return Err(VolXfmError::Geometry(format!(
            "displacement field in {} declares {} fixed parameters, expected 18",
            path.display(),
            sub.fixed.len()
        )));
    }
    let shape: Vec<usize> = sub.fixed[..3]
        .iter()
        .map(|&v| {
            if v.fract() == 0.0 && v > 0.0 {
                Ok(v as usize)
            } else {
                Err(VolXfmError::Geometry(format!(
                    "bad displacement grid dimension {} in {}",
                    v,
                    path.display()
                )))
            }
        })
        .collect::<Result<_>>()?;
    let (nx, ny, nz) = (shape[0], shape[1], shape[2]);
    let expected = nx
        .checked_mul(ny)
        .and_then(|n| n.checked_mul(nz))
        .and_then(|n| n.checked_mul(3))
        .ok_or_else(|| {
            VolXfmError::Geometry(format!(
                "displacement grid {:?} in {} is too large",
                &shape,
                path.display()
            ))
        })?;
    if sub.parameters.len() != expected {
        return Err(VolXfmError::Geometry(format!(
            "displacement field in {} declares grid {:?} ({} values) but carries {}",
            path.display(),
            &shape,
            expected,
            sub.parameters.len()
        )));
    }

    let origin = [sub.fixed[3], sub.fixed[4], sub.fixed[5]];
    let spacing = [sub.fixed[6], sub.fixed[7], sub.fixed[8]];
    let mut direction = [0.0; 9];
    direction.copy_from_slice(&sub.fixed[9..18]);
    let grid_lps = crate::affine::from_parameters(origin, spacing, direction);
    let grid_ras = grid_lps_to_ras(&grid_lps);

    // Buffer order: vector component fastest, then x, y, z slowest.
    // LPS vectors become RAS by negating the first two components.
    let mut field = Array4::<f64>::zeros((nx, ny, nz, 3));
    let mut next = 0;
    for k in 0..nz {
        for j in 0..ny {
            for i in 0..nx {
                for (c, sign) in [-1.0, -1.0, 1.0].iter().enumerate() {
                    field[(i, j, k, c)] = sign * f64::from(sub.parameters[next]);
                    next += 1;
                }
            }
        }
    }

    Ok(TransformRecord::Field(DisplacementField::new(
        field, grid_ras,
    )?))
}

/// Write a composite container from canonical RAS+ records.
///
/// The inverse of [`load`]: the affine and field are converted back to the
/// container's LPS convention. Mostly useful to produce fixtures and to
/// round-trip containers in tests.
pub fn write(path: &Path, affine: &Affine4, field: &DisplacementField) -> Result<()> {
    let file = File::create(path)?;
    let writer: Box<dyn Write> = if is_gz_file(path) {
        Box::new(GzEncoder::new(file, Compression::default()))
    } else {
        Box::new(file)
    };
    let mut writer = ByteOrdered::le(BufWriter::new(writer));

    writer.write_all(MAGIC)?;
    writer.write_u8(VERSION)?;
    writer.write_u8(b'L')?;
    writer.write_u32(2)?;

    // Affine sub-transform, RAS -> LPS.
    let lps = lps_to_ras(affine); // involution: same conversion both ways
    writer.write_u16(AFFINE_TAG.len() as u16)?;
    writer.write_all(AFFINE_TAG.as_bytes())?;
    writer.write_u32(3)?;
    for _ in 0..3 {
        writer.write_f64(0.0)?;
    }
    writer.write_u64(12)?;
    for i in 0..3 {
        for j in 0..3 {
            writer.write_f32(lps[(i, j)] as f32)?;
        }
    }
    for i in 0..3 {
        writer.write_f32(lps[(i, 3)] as f32)?;
    }

    // Displacement field sub-transform.
    let [nx, ny, nz] = field.grid_shape();
    let grid_lps = ras_flip() * field.affine();
    let spacing = voxel_sizes(&grid_lps);
    writer.write_u16(FIELD_TAG.len() as u16)?;
    writer.write_all(FIELD_TAG.as_bytes())?;
    writer.write_u32(18)?;
    for &n in &[nx, ny, nz] {
        writer.write_f64(n as f64)?;
    }
    for i in 0..3 {
        writer.write_f64(grid_lps[(i, 3)])?;
    }
    for &s in &spacing {
        writer.write_f64(s)?;
    }
    for i in 0..3 {
        for j in 0..3 {
            writer.write_f64(grid_lps[(i, j)] / spacing[j])?;
        }
    }
    writer.write_u64((nx * ny * nz * 3) as u64)?;
    for k in 0..nz {
        for j in 0..ny {
            for i in 0..nx {
                for (c, sign) in [-1.0, -1.0, 1.0].iter().enumerate() {
                    writer.write_f32((sign * field.field()[(i, j, k, c)]) as f32)?;
                }
            }
        }
    }
    writer.into_inner().flush()?;
    Ok(())
}

pub(crate) fn is_gz_file(path: &Path) -> bool {
    path.file_name()
        .and_then(|n| n.to_str())
        .map(|n| n.ends_with(".gz"))
        .unwrap_or(false)
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_abs_diff_eq;
    use byteordered::ByteOrdered;

    fn small_field() -> DisplacementField {
        let mut data = Array4::zeros((4, 4, 4, 3));
        for k in 0..4 {
            for j in 0..4 {
                for i in 0..4 {
                    data[(i, j, k, 0)] = 0.1 * i as f64;
                    data[(i, j, k, 1)] = -0.2 * j as f64;
                    data[(i, j, k, 2)] = 0.05 * k as f64;
                }
            }
        }
        let mut affine = Affine4::identity();
        affine[(0, 3)] = -4.0;
        DisplacementField::new(data, affine).unwrap()
    }

    #[test]
    fn roundtrip_preserves_affine_and_field() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("warp.cxfm");
        let mut affine = Affine4::identity();
        affine[(0, 3)] = 3.0;
        affine[(1, 3)] = -2.0;
        let field = small_field();
        write(&path, &affine, &field).unwrap();

        let records = load(&path).unwrap();
        assert_eq!(records.len(), 2);
        match &records[0] {
            TransformRecord::Affine(a) => {
                assert_abs_diff_eq!(a[(0, 3)], 3.0, epsilon = 1e-6);
                assert_abs_diff_eq!(a[(1, 3)], -2.0, epsilon = 1e-6);
            }
            _ => panic!("expected the affine first"),
        }
        match &records[1] {
            TransformRecord::Field(f) => {
                assert_eq!(f.grid_shape(), [4, 4, 4]);
                assert_abs_diff_eq!(f.affine()[(0, 3)], -4.0, epsilon = 1e-12);
                assert_abs_diff_eq!(f.field()[(3, 2, 1, 0)], 0.3, epsilon = 1e-6);
                assert_abs_diff_eq!(f.field()[(3, 2, 1, 1)], -0.4, epsilon = 1e-6);
            }
            _ => panic!("expected the field second"),
        }
    }

    #[test]
    fn gzipped_containers_are_transparent() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("warp.cxfm.gz");
        write(&path, &Affine4::identity(), &small_field()).unwrap();
        let records = load(&path).unwrap();
        assert_eq!(records.len(), 2);
    }

    #[test]
    fn declared_grid_must_match_buffer_length() {
        // A (4, 4, 4) declaration over a 100-value buffer is a geometry
        // error, not a format error: the file structure is fine, the
        // geometry is contradictory.
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("bad.cxfm");
        let file = File::create(&path).unwrap();
        let mut w = ByteOrdered::le(std::io::BufWriter::new(file));
        w.write_all(MAGIC).unwrap();
        w.write_u8(VERSION).unwrap();
        w.write_u8(b'L').unwrap();
        w.write_u32(1).unwrap();
        w.write_u16(FIELD_TAG.len() as u16).unwrap();
        w.write_all(FIELD_TAG.as_bytes()).unwrap();
        w.write_u32(18).unwrap();
        for v in &[
            4.0, 4.0, 4.0, // declared shape
            0.0, 0.0, 0.0, // origin
            1.0, 1.0, 1.0, // spacing
            -1.0, 0.0, 0.0, 0.0, -1.0, 0.0, 0.0, 0.0, 1.0, // direction
        ] {
            w.write_f64(*v).unwrap();
        }
        w.write_u64(100).unwrap();
        for _ in 0..100 {
            w.write_f32(0.0).unwrap();
        }
        drop(w);

        let err = load(&path).unwrap_err();
        assert!(matches!(err, VolXfmError::Geometry(_)));
    }

    #[test]
    fn truncated_buffer_is_a_format_error_naming_the_path() {
        // Declares 100 values but carries 2.
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("trunc.cxfm");
        let file = File::create(&path).unwrap();
        let mut w = ByteOrdered::le(std::io::BufWriter::new(file));
        w.write_all(MAGIC).unwrap();
        w.write_u8(VERSION).unwrap();
        w.write_u8(b'L').unwrap();
        w.write_u32(1).unwrap();
        w.write_u16(AFFINE_TAG.len() as u16).unwrap();
        w.write_all(AFFINE_TAG.as_bytes()).unwrap();
        w.write_u32(0).unwrap();
        w.write_u64(100).unwrap();
        w.write_f32(1.0).unwrap();
        w.write_f32(2.0).unwrap();
        drop(w);

        let err = load(&path).unwrap_err();
        assert!(matches!(err, VolXfmError::Format(..)));
        assert!(err.to_string().contains("trunc.cxfm"));
    }

    #[test]
    fn absurd_declared_counts_do_not_panic() {
        // A tiny file claiming u64::MAX parameters must fail as a
        // truncated format, never allocate for the declared count.
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("huge.cxfm");
        let file = File::create(&path).unwrap();
        let mut w = ByteOrdered::le(std::io::BufWriter::new(file));
        w.write_all(MAGIC).unwrap();
        w.write_u8(VERSION).unwrap();
        w.write_u8(b'L').unwrap();
        w.write_u32(1).unwrap();
        w.write_u16(AFFINE_TAG.len() as u16).unwrap();
        w.write_all(AFFINE_TAG.as_bytes()).unwrap();
        w.write_u32(0).unwrap();
        w.write_u64(u64::MAX).unwrap();
        drop(w);
        let err = load(&path).unwrap_err();
        assert!(matches!(err, VolXfmError::Format(..)));

        // Same for the sub-transform count and the fixed-parameter count.
        let path = dir.path().join("huge2.cxfm");
        let file = File::create(&path).unwrap();
        let mut w = ByteOrdered::le(std::io::BufWriter::new(file));
        w.write_all(MAGIC).unwrap();
        w.write_u8(VERSION).unwrap();
        w.write_u8(b'L').unwrap();
        w.write_u32(u32::MAX).unwrap();
        w.write_u16(AFFINE_TAG.len() as u16).unwrap();
        w.write_all(AFFINE_TAG.as_bytes()).unwrap();
        w.write_u32(u32::MAX).unwrap();
        drop(w);
        let err = load(&path).unwrap_err();
        assert!(matches!(err, VolXfmError::Format(..)));
    }

    #[test]
    fn unknown_tag_is_a_geometry_error() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("odd.cxfm");
        let file = File::create(&path).unwrap();
        let mut w = ByteOrdered::le(std::io::BufWriter::new(file));
        w.write_all(MAGIC).unwrap();
        w.write_u8(VERSION).unwrap();
        w.write_u8(b'L').unwrap();
        w.write_u32(1).unwrap();
        let tag = "BSplineTransform_float_3_3";
        w.write_u16(tag.len() as u16).unwrap();
        w.write_all(tag.as_bytes()).unwrap();
        w.write_u32(0).unwrap();
        w.write_u64(0).unwrap();
        drop(w);

        let err = load(&path).unwrap_err();
        assert!(matches!(err, VolXfmError::Geometry(_)));
    }

    #[test]
    fn bad_magic_is_a_format_error() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("junk.cxfm");
        std::fs::write(&path, b"NOPE\x01L\x00\x00\x00\x00").unwrap();
        let err = load(&path).unwrap_err();
        assert!(matches!(err, VolXfmError::Format(..)));
    }

    #[test]
    fn template_grid_geometry_is_read_not_assumed() {
        // A container declaring the common (193, 229, 193) template grid
        // with LPS origin (96, 132, -78) and diag(-1, -1, 1) direction
        // must come out with the equivalent RAS grid affine. Shrunk here to
        // (19, 22, 19) to keep the fixture small; the declared block is
        // still the only source of geometry.
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("tpl.cxfm");
        let (nx, ny, nz) = (19usize, 22usize, 19usize);
        let file = File::create(&path).unwrap();
        let mut w = ByteOrdered::le(std::io::BufWriter::new(file));
        w.write_all(MAGIC).unwrap();
        w.write_u8(VERSION).unwrap();
        w.write_u8(b'L').unwrap();
        w.write_u32(1).unwrap();
        w.write_u16(FIELD_TAG.len() as u16).unwrap();
        w.write_all(FIELD_TAG.as_bytes()).unwrap();
        w.write_u32(18).unwrap();
        for v in &[
            nx as f64, ny as f64, nz as f64,
            96.0, 132.0, -78.0,
            1.0, 1.0, 1.0,
            -1.0, 0.0, 0.0, 0.0, -1.0, 0.0, 0.0, 0.0, 1.0,
        ] {
            w.write_f64(*v).unwrap();
        }
        w.write_u64((nx * ny * nz * 3) as u64).unwrap();
        for _ in 0..nx * ny * nz * 3 {
            w.write_f32(0.0).unwrap();
        }
        drop(w);

        let records = load(&path).unwrap();
        match &records[0] {
            TransformRecord::Field(f) => {
                assert_eq!(f.grid_shape(), [nx, ny, nz]);
                let a = f.affine();
                assert_abs_diff_eq!(a[(0, 0)], 1.0, epsilon = 1e-12);
                assert_abs_diff_eq!(a[(1, 1)], 1.0, epsilon = 1e-12);
                assert_abs_diff_eq!(a[(2, 2)], 1.0, epsilon = 1e-12);
                assert_abs_diff_eq!(a[(0, 3)], -96.0, epsilon = 1e-12);
                assert_abs_diff_eq!(a[(1, 3)], -132.0, epsilon = 1e-12);
                assert_abs_diff_eq!(a[(2, 3)], -78.0, epsilon = 1e-12);
            }
            _ => panic!("expected a displacement field"),
        }
    }
}
