//! Linear Transform Array (LTA) text files.
//!
//! An LTA carries one 4×4 matrix plus the full voxel geometry of both the
//! source and destination images, so the physical mapping can always be
//! reconstructed regardless of whether the matrix was written in voxel or
//! physical coordinates:
//!
//! * `type = 0` (VOX2VOX): the matrix maps source voxel indices to
//!   destination voxel indices and is composed with both images'
//!   voxel→physical affines.
//! * `type = 1` (RAS2RAS): the matrix already maps physical coordinates and
//!   is used directly (the format's physical convention coincides with
//!   RAS+).
//!
//! Each geometry block gives shape, voxel sizes, direction cosines and the
//! physical coordinate of the volume center.

use std::fs;
use std::path::Path;

use nalgebra::Vector3;

use crate::affine::{apply_affine, invert_affine, Affine4};
use crate::error::{Result, VolXfmError};
use crate::transform::TransformRecord;

const LINEAR_VOX2VOX: i64 = 0;
const LINEAR_RAS2RAS: i64 = 1;

/// Read an LTA file as a physical RAS+ mapping from source to destination.
pub fn load(path: &Path) -> Result<TransformRecord> {
    let text = fs::read_to_string(path)?;
    let parsed = Parser::new(&text, path).parse()?;

    let affine = match parsed.kind {
        LINEAR_RAS2RAS => parsed.matrix,
        LINEAR_VOX2VOX => {
            let src = parsed.src.vox2ras();
            let dst = parsed.dst.vox2ras();
            dst * parsed.matrix * invert_affine(&src)?
        }
        other => {
            return Err(VolXfmError::format(
                path,
                format!("unsupported LTA type {}", other),
            ))
        }
    };
    Ok(TransformRecord::Affine(affine))
}

struct ParsedLta {
    kind: i64,
    matrix: Affine4,
    src: GeometryBlock,
    dst: GeometryBlock,
}

#[derive(Debug, Default, Clone)]
struct GeometryBlock {
    volume: [f64; 3],
    voxelsize: [f64; 3],
    xras: [f64; 3],
    yras: [f64; 3],
    zras: [f64; 3],
    cras: [f64; 3],
}

impl GeometryBlock {
    /// FreeSurfer scanner vox2ras: direction cosines scaled by voxel size,
    /// with the translation chosen so that the volume center lands on
    /// `cras`.
    fn vox2ras(&self) -> Affine4 {
        let mut affine = Affine4::identity();
        let cols = [self.xras, self.yras, self.zras];
        for (j, col) in cols.iter().enumerate() {
            for i in 0..3 {
                affine[(i, j)] = col[i] * self.voxelsize[j];
            }
        }
        let center = Vector3::new(
            self.volume[0] / 2.0,
            self.volume[1] / 2.0,
            self.volume[2] / 2.0,
        );
        let mut linear_only = affine;
        linear_only[(0, 3)] = 0.0;
        linear_only[(1, 3)] = 0.0;
        linear_only[(2, 3)] = 0.0;
        let rotated = apply_affine(&linear_only, &center);
        affine[(0, 3)] = self.cras[0] - rotated.x;
        affine[(1, 3)] = self.cras[1] - rotated.y;
        affine[(2, 3)] = self.cras[2] - rotated.z;
        affine
    }
}

struct Parser<'a> {
    lines: Vec<&'a str>,
    pos: usize,
    path: &'a Path,
}

impl<'a> Parser<'a> {
    fn new(text: &'a str, path: &'a Path) -> Self {
        let lines = text
            .lines()
            .map(|l| l.split('#').next().unwrap_or("").trim())
            .collect();
        Parser {
            lines,
            pos: 0,
            path,
        }
    }

    fn parse(mut self) -> Result<ParsedLta> {
        let kind = self.expect_key_int("type")?;
        let nxforms = self.expect_key_int("nxforms")?;
        if nxforms != 1 {
            return Err(VolXfmError::format(
                self.path,
                format!("expected a single transform, found nxforms = {}", nxforms),
            ));
        }
        // mean/sigma and the "1 4 4" dims line are skipped by the matrix
        // scan below.
        let matrix = self.read_matrix()?;
        self.seek_line("src volume info")?;
        let src = self.read_geometry()?;
        self.seek_line("dst volume info")?;
        let dst = self.read_geometry()?;
        Ok(ParsedLta {
            kind,
            matrix,
            src,
            dst,
        })
    }

    fn next_line(&mut self) -> Option<&'a str> {
        while self.pos < self.lines.len() {
            let line = self.lines[self.pos];
            self.pos += 1;
            if !line.is_empty() {
                return Some(line);
            }
        }
        None
    }

    fn expect_key_int(&mut self, key: &str) -> Result<i64> {
        loop {
            let line = self.next_line().ok_or_else(|| {
                VolXfmError::format(self.path, format!("missing '{}' line", key))
            })?;
            if let Some(value) = key_value(line, key) {
                return value.parse::<i64>().map_err(|_| {
                    VolXfmError::format(self.path, format!("bad '{}' value: {:?}", key, value))
                });
            }
        }
    }

    fn seek_line(&mut self, needle: &str) -> Result<()> {
        while let Some(line) = self.next_line() {
            if line.starts_with(needle) {
                return Ok(());
            }
        }
        Err(VolXfmError::format(
            self.path,
            format!("missing '{}' section", needle),
        ))
    }

    /// Scan forward collecting 16 numbers from all-numeric rows, skipping
    /// the dims line preceding the matrix.
    fn read_matrix(&mut self) -> Result<Affine4> {
        let mut values: Vec<f64> = Vec::with_capacity(16);
        while values.len() < 16 {
            let line = self
                .next_line()
                .ok_or_else(|| VolXfmError::format(self.path, "truncated matrix"))?;
            let row: Option<Vec<f64>> = line
                .split_whitespace()
                .map(|tok| tok.parse::<f64>().ok())
                .collect();
            match row {
                Some(row) if row.len() == 4 => values.extend(row),
                // dims line ("1 4 4") and key-value lines are skipped
                _ => continue,
            }
        }
        let mut affine = Affine4::zeros();
        for i in 0..4 {
            for j in 0..4 {
                affine[(i, j)] = values[i * 4 + j];
            }
        }
        Ok(affine)
    }

    fn read_geometry(&mut self) -> Result<GeometryBlock> {
        let mut block = GeometryBlock::default();
        let mut seen = 0;
        while seen < 6 {
            let line = self.next_line().ok_or_else(|| {
                VolXfmError::format(self.path, "truncated volume geometry block")
            })?;
            let target = if let Some(v) = key_value(line, "volume") {
                block.volume = self.parse_triple(v)?;
                true
            } else if let Some(v) = key_value(line, "voxelsize") {
                block.voxelsize = self.parse_triple(v)?;
                true
            } else if let Some(v) = key_value(line, "xras") {
                block.xras = self.parse_triple(v)?;
                true
            } else if let Some(v) = key_value(line, "yras") {
                block.yras = self.parse_triple(v)?;
                true
            } else if let Some(v) = key_value(line, "zras") {
                block.zras = self.parse_triple(v)?;
                true
            } else if let Some(v) = key_value(line, "cras") {
                block.cras = self.parse_triple(v)?;
                true
            } else {
                false
            };
            if target {
                seen += 1;
            }
        }
        Ok(block)
    }

    fn parse_triple(&self, text: &str) -> Result<[f64; 3]> {
        let values: Vec<f64> = text
            .split_whitespace()
            .map(|tok| {
                tok.parse::<f64>().map_err(|_| {
                    VolXfmError::format(self.path, format!("not a number: {:?}", tok))
                })
            })
            .collect::<Result<_>>()?;
        if values.len() != 3 {
            return Err(VolXfmError::format(
                self.path,
                format!("expected 3 values, found {}", values.len()),
            ));
        }
        Ok([values[0], values[1], values[2]])
    }
}

fn key_value<'a>(line: &'a str, key: &str) -> Option<&'a str> {
    let rest = line.strip_prefix(key)?;
    let rest = rest.trim_start();
    rest.strip_prefix('=').map(str::trim)
}
