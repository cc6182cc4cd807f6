//! # score2audio
//!
//! Turn a scanned or photographed music score into a single playable audio
//! track.
//!
//! ## Pipeline Overview
//!
//! ```text
//! PDF / image
//!  │
//!  ├─ 1. Extract    split into page images (pdfium, 300 DPI)
//!  ├─ 2. Recognise  page image → MusicXML via oemer, homr or Audiveris
//!  ├─ 3. Sanitise   apply tempo/transpose, flatten, clamp, trim, bound
//!  ├─ 4. Render     MIDI → fluidsynth → WAV → ffmpeg → MP3 per page
//!  └─ 5. Merge      concatenate surviving pages in page order
//! ```
//!
//! A page that fails at any stage is dropped and reported; the run only
//! fails when no page makes it to the merge.
//!
//! ## Quick Start
//!
//! ```rust,no_run
//! use score2audio::{Backend, ConversionPipeline, ConversionRequest, PipelineConfig};
//!
//! #[tokio::main]
//! async fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     let config = PipelineConfig::builder()
//!         .soundfont("/usr/share/sounds/sf2/FluidR3_GM.sf2")
//!         .work_dir("/tmp/score2audio")
//!         .build()?;
//!     let request = ConversionRequest::new("sonata.pdf", Backend::Homr, 96, -2)?;
//!
//!     let result = ConversionPipeline::new(config).run(&request).await?;
//!     println!("{}", result.output_path.display());
//!     eprintln!(
//!         "{} of {} pages merged",
//!         result.stats.merged_pages, result.stats.total_pages
//!     );
//!     Ok(())
//! }
//! ```
//!
//! ## External Tools
//!
//! The OMR engines, `fluidsynth` and `ffmpeg` are invoked as child
//! processes; their command lines are configurable through
//! [`config::ToolCommands`]. pdfium is loaded at runtime and only needed for
//! PDF input.
//!
//! ## Feature Flags
//!
//! | Feature | Default | Description |
//! |---------|---------|-------------|
//! | `cli`   | on      | Enables the `score2audio` binary (clap + anyhow + indicatif + tracing-subscriber) |

// ── Modules ──────────────────────────────────────────────────────────────

pub mod backend;
pub mod config;
pub mod convert;
pub mod error;
pub mod output;
pub mod pipeline;
pub mod progress;
pub mod request;

// ── Re-exports ───────────────────────────────────────────────────────────

pub use backend::{Backend, BackendInfo, ConcurrencyPolicy};
pub use config::{CommandSpec, PipelineConfig, PipelineConfigBuilder, ToolCommands};
pub use convert::{convert, convert_sync, convert_to_file, inspect, ConversionPipeline};
pub use error::{ConversionError, PageError};
pub use output::{
    ConversionResponse, ConversionResult, ConversionStats, PageReport, PageStage, PageState,
};
pub use pipeline::extract::{DocumentFormat, SourceDocument};
pub use progress::{ConversionProgressCallback, NoopProgressCallback, ProgressCallback};
pub use request::ConversionRequest;
