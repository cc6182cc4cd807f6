//! Recognition backends and their static, informational metadata.
//!
//! The set of engines is closed, so a backend is a plain enum. What differs
//! between engines is captured as data: the command line (see
//! [`crate::pipeline::recognize`]), whether the engine tolerates concurrent
//! invocation ([`ConcurrencyPolicy`]), and the descriptive [`BackendInfo`]
//! attached to every result.

use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

/// The OMR engine used for a conversion.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Backend {
    /// oemer: deep-learning OMR, good with phone photos of simple scores.
    #[default]
    Oemer,
    /// homr: handwritten and informal lead sheets. Not safe to run concurrently.
    Homr,
    /// Audiveris: clean printed scores, multi-page books.
    Audiveris,
}

/// How pages may be dispatched to a backend.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConcurrencyPolicy {
    /// One page at a time, in page order.
    Sequential,
    /// Up to `recognition_workers` pages at once.
    Parallel,
}

impl Backend {
    pub const ALL: [Backend; 3] = [Backend::Oemer, Backend::Homr, Backend::Audiveris];

    /// Lower-case identifier used on the command line and in logs.
    pub fn name(self) -> &'static str {
        match self {
            Backend::Oemer => "oemer",
            Backend::Homr => "homr",
            Backend::Audiveris => "audiveris",
        }
    }

    /// homr deadlocks when several instances share the model cache, so it is
    /// always driven sequentially.
    pub fn concurrency(self) -> ConcurrencyPolicy {
        match self {
            Backend::Homr => ConcurrencyPolicy::Sequential,
            Backend::Oemer | Backend::Audiveris => ConcurrencyPolicy::Parallel,
        }
    }

    /// Static description of the engine. Not measured at runtime.
    pub fn info(self) -> BackendInfo {
        match self {
            Backend::Oemer => BackendInfo {
                note: "OEMER is best with scanned pages or mobile photos of simple sheet music.",
                processing_time: "~160–170 sec/image",
                accuracy: "60–70%",
                pros: &[
                    "Uses smart AI to read music directly from images",
                    "Works well with clean scans or phone pictures",
                ],
                cons: &[
                    "May skip over advanced music symbols",
                    "Works better with simple, single-instrument music",
                    "Slower than other tools for large or messy files",
                    "Unclear or low-quality sheet music can introduce extra noise or timing discrepancies in the output",
                ],
            },
            Backend::Homr => BackendInfo {
                note: "HOMR is best with handwritten notes, sketches, or informal lead sheets.",
                processing_time: "~60–80 sec/image",
                accuracy: "70–85%",
                pros: &[
                    "Great for handwritten music sheets",
                    "Fast and easy to try out",
                    "Doesn't need big software installations",
                ],
                cons: &[
                    "Might miss some musical details",
                    "Still in testing, not for professional use yet",
                ],
            },
            Backend::Audiveris => BackendInfo {
                note: "Audiveris is best with clean, printed PDFs. Not recommended for handwriting or phone pictures.",
                processing_time: "~18–20 sec/page",
                accuracy: "85–95%",
                pros: &[
                    "Works great with clean, printed sheet music",
                    "Can handle full-length music books or multiple pages",
                    "Keeps details like lyrics, notes, and rhythms",
                ],
                cons: &[
                    "Takes more time than some tools",
                    "Needs good quality PDFs for best results",
                    "May be tricky to set up without help",
                ],
            },
        }
    }
}

impl fmt::Display for Backend {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

impl FromStr for Backend {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "oemer" => Ok(Backend::Oemer),
            "homr" => Ok(Backend::Homr),
            "audiveris" => Ok(Backend::Audiveris),
            other => Err(format!(
                "unknown backend '{other}' (expected oemer, homr or audiveris)"
            )),
        }
    }
}

/// Descriptive metadata for a backend, returned alongside every result.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct BackendInfo {
    pub note: &'static str,
    pub processing_time: &'static str,
    pub accuracy: &'static str,
    pub pros: &'static [&'static str],
    pub cons: &'static [&'static str],
}

impl BackendInfo {
    /// Compact `{"processingTime": …, "accuracy": …}` object suitable for a
    /// response header.
    pub fn header_meta(&self) -> String {
        serde_json::json!({
            "processingTime": self.processing_time,
            "accuracy": self.accuracy,
        })
        .to_string()
    }
}
