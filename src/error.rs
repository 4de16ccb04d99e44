//! Crate error types.
//!
//! Everything that can go wrong while reading, composing or applying
//! transforms surfaces as a [`VolXfmError`]. The taxonomy is deliberately
//! small: malformed files, inconsistent configuration, and geometric
//! contradictions inside a file. Out-of-field-of-view voxels are *not* an
//! error; they are handled by the background-fill policy of the resampler.

use std::io::Error as IoError;
use std::path::PathBuf;

quick_error! {
    /// Error type for all operations in this crate.
    #[derive(Debug)]
    pub enum VolXfmError {
        /// A transform file was unreadable, truncated, or structurally
        /// unrecognized. Carries the offending path.
        Format(path: PathBuf, reason: String) {
            display("invalid transform file {}: {}", path.display(), reason)
        }
        /// The requested operation is inconsistent with the supplied inputs:
        /// mismatched transform/inverse-flag counts, an unknown fieldmap
        /// identifier, missing acquisition metadata, and the like.
        /// Raised before any resampling work begins.
        Configuration(reason: String) {
            display("configuration error: {}", reason)
        }
        /// A file's declared geometry contradicts its actual contents, or a
        /// container holds a sub-transform of an unsupported type.
        Geometry(reason: String) {
            display("geometry error: {}", reason)
        }
        /// I/O error
        Io(err: IoError) {
            from()
            source(err)
            display("I/O error: {}", err)
        }
    }
}

impl VolXfmError {
    /// Build a `Format` error for the given path.
    pub fn format<P, S>(path: P, reason: S) -> Self
    where
        P: Into<PathBuf>,
        S: Into<String>,
    {
        VolXfmError::Format(path.into(), reason.into())
    }
}

/// Alias type for results originated from this crate.
pub type Result<T> = ::std::result::Result<T, VolXfmError>;
