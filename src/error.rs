//! Error types for the score2audio library.
//!
//! Two distinct error types reflect two distinct failure modes:
//!
//! * [`ConversionError`] (**fatal**): the run cannot produce a merged track
//!   (unreadable document, bad configuration, every page dropped). Returned as
//!   `Err(ConversionError)` from [`crate::convert::ConversionPipeline::run`].
//!
//! * [`PageError`] (**non-fatal**): a single page was dropped at one stage
//!   (engine crash, pathological score, synthesiser failure) while the other
//!   pages carry on. Stored inside [`crate::output::PageReport`] so callers can
//!   see which pages are missing from the merged audio.
//!
//! [`ProcessError`] is the internal failure of one external program
//! invocation; the stage that ran it wraps it into the matching [`PageError`].

use std::path::PathBuf;
use thiserror::Error;

/// All fatal errors returned by the score2audio library.
#[derive(Debug, Error)]
pub enum ConversionError {
    // ── Input errors ──────────────────────────────────────────────────────
    /// Input file was not found at the given path.
    #[error("Source document not found: '{path}'\nCheck the path exists and is readable.")]
    FileNotFound { path: PathBuf },

    /// Process does not have read permission on the file.
    #[error("Permission denied reading '{path}'\nTry: chmod +r {path:?}")]
    PermissionDenied { path: PathBuf },

    /// The file is neither a PDF nor a decodable image.
    #[error("Unsupported document '{path}': expected a PDF or a PNG/JPEG image (first bytes: {magic:?})")]
    UnsupportedFormat { path: PathBuf, magic: [u8; 4] },

    /// The document was recognised but could not be opened or decoded.
    #[error("Document '{path}' is corrupt: {detail}")]
    CorruptDocument { path: PathBuf, detail: String },

    /// Could not bind to a pdfium library.
    #[error(
        "Failed to bind to pdfium library: {0}\n\
Install libpdfium or pass --pdfium-lib-path <DIR> pointing at the directory that contains it."
    )]
    PdfiumBindingFailed(String),

    /// A page could not be rasterised or written to the working directory.
    #[error("Page extraction failed for page {page}: {detail}")]
    ExtractionFailed { page: usize, detail: String },

    // ── Run errors ────────────────────────────────────────────────────────
    /// The working directory could not be reset or written.
    #[error("Working directory '{path}' is unusable: {detail}")]
    WorkDir { path: PathBuf, detail: String },

    /// Every page failed recognition; nothing left to render.
    #[error("No page out of {total} was recognised.\nFirst error: {first_error}")]
    NoPagesRecognized { total: usize, first_error: String },

    /// No page survived to the merge step.
    #[error("No audio track was rendered ({dropped} of {total} pages dropped).\nFirst error: {first_error}")]
    NoTracksRendered {
        total: usize,
        dropped: usize,
        first_error: String,
    },

    /// The concatenation step itself failed.
    #[error("Merging {tracks} tracks failed: {detail}")]
    MergeFailed { tracks: usize, detail: String },

    // ── I/O errors ────────────────────────────────────────────────────────
    /// Could not write the requested output file.
    #[error("Failed to write output file '{path}': {source}")]
    OutputWriteFailed {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    // ── Request / config errors ───────────────────────────────────────────
    /// Tempo or transpose outside the accepted range.
    #[error("Invalid conversion request: {0}")]
    InvalidRequest(String),

    /// Builder validation failed.
    #[error("Invalid configuration: {0}")]
    InvalidConfig(String),

    // ── Catch-all ─────────────────────────────────────────────────────────
    /// Unexpected internal error.
    #[error("Internal error: {0}")]
    Internal(String),
}

/// A non-fatal error for a single page.
///
/// The page is excluded from every later stage; the run continues unless no
/// page survives.
#[derive(Debug, Clone, PartialEq, Error, serde::Serialize, serde::Deserialize)]
pub enum PageError {
    /// The OMR engine exited non-zero, timed out, or left no score behind.
    #[error("Page {page}: recognition failed: {detail}")]
    Recognition { page: usize, detail: String },

    /// The recognised score has no playable content or is pathologically long.
    #[error("Page {page}: score rejected: {detail}")]
    Sanitization { page: usize, detail: String },

    /// Synthesis or encoding failed.
    #[error("Page {page}: audio rendering failed: {detail}")]
    Render { page: usize, detail: String },
}

impl PageError {
    /// Page index the error belongs to.
    pub fn page(&self) -> usize {
        match self {
            PageError::Recognition { page, .. }
            | PageError::Sanitization { page, .. }
            | PageError::Render { page, .. } => *page,
        }
    }
}

/// Failure of a single external program invocation.
#[derive(Debug, Error)]
pub enum ProcessError {
    #[error("could not start '{program}': {source}")]
    Spawn {
        program: String,
        #[source]
        source: std::io::Error,
    },

    #[error("'{program}' exited with {status}: {stderr}")]
    ExitStatus {
        program: String,
        status: String,
        stderr: String,
    },

    #[error("'{program}' timed out after {secs}s and was killed")]
    Timeout { program: String, secs: u64 },

    #[error("'{program}' succeeded but produced no '{}'", .expected.display())]
    MissingOutput { program: String, expected: PathBuf },
}
