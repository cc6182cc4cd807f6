//! The per-call conversion request.
//!
//! A [`ConversionRequest`] is what the (external) HTTP layer hands over:
//! which engine to use, the playback parameters, and the uploaded document
//! already saved to disk. It is validated once at construction and never
//! mutated afterwards.

use crate::backend::Backend;
use crate::error::ConversionError;
use serde::Serialize;
use std::ops::RangeInclusive;
use std::path::{Path, PathBuf};

/// Accepted tempo range in beats per minute.
pub const TEMPO_RANGE: RangeInclusive<u32> = 40..=240;
/// Accepted transposition range in semitones (±1 octave).
pub const TRANSPOSE_RANGE: RangeInclusive<i8> = -12..=12;

pub const DEFAULT_TEMPO: u32 = 120;

/// One conversion: document + engine + playback parameters.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ConversionRequest {
    source: PathBuf,
    backend: Backend,
    tempo_bpm: u32,
    transpose: i8,
}

impl ConversionRequest {
    /// Validate and build a request.
    ///
    /// # Errors
    /// [`ConversionError::InvalidRequest`] when `tempo_bpm` is outside
    /// [`TEMPO_RANGE`] or `transpose` outside [`TRANSPOSE_RANGE`].
    pub fn new(
        source: impl Into<PathBuf>,
        backend: Backend,
        tempo_bpm: u32,
        transpose: i8,
    ) -> Result<Self, ConversionError> {
        if !TEMPO_RANGE.contains(&tempo_bpm) {
            return Err(ConversionError::InvalidRequest(format!(
                "tempo must be {}–{} BPM, got {}",
                TEMPO_RANGE.start(),
                TEMPO_RANGE.end(),
                tempo_bpm
            )));
        }
        if !TRANSPOSE_RANGE.contains(&transpose) {
            return Err(ConversionError::InvalidRequest(format!(
                "transpose must be {}..={} semitones, got {}",
                TRANSPOSE_RANGE.start(),
                TRANSPOSE_RANGE.end(),
                transpose
            )));
        }
        Ok(Self {
            source: source.into(),
            backend,
            tempo_bpm,
            transpose,
        })
    }

    /// Request with the default tempo and no transposition.
    pub fn with_defaults(
        source: impl Into<PathBuf>,
        backend: Backend,
    ) -> Result<Self, ConversionError> {
        Self::new(source, backend, DEFAULT_TEMPO, 0)
    }

    pub fn source(&self) -> &Path {
        &self.source
    }

    pub fn backend(&self) -> Backend {
        self.backend
    }

    pub fn tempo_bpm(&self) -> u32 {
        self.tempo_bpm
    }

    pub fn transpose(&self) -> i8 {
        self.transpose
    }

    /// File stem used to name the merged output, e.g. `sonata` for `sonata.pdf`.
    pub fn output_stem(&self) -> String {
        self.source
            .file_stem()
            .map(|s| s.to_string_lossy().into_owned())
            .filter(|s| !s.is_empty())
            .unwrap_or_else(|| "score".to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn accepts_bounds() {
        assert!(ConversionRequest::new("a.pdf", Backend::Oemer, 40, -12).is_ok());
        assert!(ConversionRequest::new("a.pdf", Backend::Oemer, 240, 12).is_ok());
    }

    #[test]
    fn rejects_out_of_range_tempo() {
        let err = ConversionRequest::new("a.pdf", Backend::Homr, 39, 0).unwrap_err();
        assert!(err.to_string().contains("tempo"), "got: {err}");
        assert!(ConversionRequest::new("a.pdf", Backend::Homr, 241, 0).is_err());
    }

    #[test]
    fn rejects_out_of_range_transpose() {
        let err = ConversionRequest::new("a.pdf", Backend::Homr, 120, 13).unwrap_err();
        assert!(err.to_string().contains("transpose"), "got: {err}");
        assert!(ConversionRequest::new("a.pdf", Backend::Homr, 120, -13).is_err());
    }

    #[test]
    fn output_stem_falls_back() {
        let r = ConversionRequest::with_defaults("/uploads/moonlight.pdf", Backend::Oemer).unwrap();
        assert_eq!(r.output_stem(), "moonlight");
        assert_eq!(r.tempo_bpm(), DEFAULT_TEMPO);
        let r = ConversionRequest::with_defaults("/", Backend::Oemer).unwrap();
        assert_eq!(r.output_stem(), "score");
    }
}
