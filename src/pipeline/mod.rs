//! Pipeline stages for sheet-music-to-audio conversion.
//!
//! Each submodule implements one transformation step and can be tested on
//! its own; [`crate::convert`] wires them together.
//!
//! ## Data Flow
//!
//! ```text
//! extract ──▶ recognize ──▶ sanitize ──▶ render ──▶ merge
//! (pdfium)    (OMR engine)  (score)      (midi,     (ffmpeg
//!                                         fluidsynth, concat)
//!                                         ffmpeg)
//! ```
//!
//! 1. [`extract`] split the document into `images/page_NNNN.png`; runs
//!    in `spawn_blocking` because pdfium is not async-safe
//! 2. [`recognize`] run the selected OMR engine per page, sequentially or
//!    pooled depending on the engine
//! 3. [`sanitize`] parse the MusicXML ([`score`]) and bound it: tempo,
//!    transpose, clamp, trim, ceiling
//! 4. [`render`] write a MIDI file ([`midi`]), synthesise, encode
//! 5. [`merge`] concatenate the surviving tracks in page order
//!
//! [`workdir`] owns the directory layout and page naming; [`process`] runs
//! every external program with a timeout.

pub mod extract;
pub mod merge;
pub mod midi;
pub mod process;
pub mod recognize;
pub mod render;
pub mod sanitize;
pub mod score;
pub mod workdir;
