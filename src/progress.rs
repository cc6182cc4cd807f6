//! Progress-callback trait for per-page pipeline events.
//!
//! Inject an [`Arc<dyn ConversionProgressCallback>`] via
//! [`crate::config::PipelineConfigBuilder::progress_callback`] to follow each
//! page through `Extracted → Recognized → Sanitized → Rendered → Merged`, or
//! see where it was dropped.
//!
//! Events from the parallel stages arrive in completion order and may be
//! delivered from different threads at once.
//!
//! # Example
//!
//! ```rust
//! use score2audio::{ConversionProgressCallback, PageStage, PipelineConfig};
//! use std::sync::{Arc, atomic::{AtomicUsize, Ordering}};
//!
//! struct Rendered(AtomicUsize);
//!
//! impl ConversionProgressCallback for Rendered {
//!     fn on_page_stage(&self, page: usize, stage: PageStage) {
//!         if stage == PageStage::Rendered {
//!             let n = self.0.fetch_add(1, Ordering::SeqCst) + 1;
//!             eprintln!("page {page} rendered ({n} so far)");
//!         }
//!     }
//! }
//!
//! let config = PipelineConfig::builder()
//!     .soundfont("piano.sf2")
//!     .progress_callback(Arc::new(Rendered(AtomicUsize::new(0))))
//!     .build()
//!     .unwrap();
//! ```

use crate::error::PageError;
use crate::output::PageStage;
use std::sync::Arc;

/// Called by the pipeline as pages move through the stages.
///
/// All methods have default no-op implementations so callers only override
/// what they care about.
pub trait ConversionProgressCallback: Send + Sync {
    /// Called once after extraction, before any page is recognised.
    fn on_conversion_start(&self, total_pages: usize) {
        let _ = total_pages;
    }

    /// Called when a page reaches `stage`.
    fn on_page_stage(&self, page: usize, stage: PageStage) {
        let _ = (page, stage);
    }

    /// Called when a page is dropped while attempting `stage`.
    fn on_page_dropped(&self, page: usize, stage: PageStage, error: &PageError) {
        let _ = (page, stage, error);
    }

    /// Called once after the merge, or after the run failed.
    fn on_conversion_complete(&self, total_pages: usize, merged_pages: usize) {
        let _ = (total_pages, merged_pages);
    }
}

/// A no-op implementation for callers that don't need progress events.
pub struct NoopProgressCallback;

impl ConversionProgressCallback for NoopProgressCallback {}

/// Convenience alias matching the type stored in [`crate::config::PipelineConfig`].
pub type ProgressCallback = Arc<dyn ConversionProgressCallback>;

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Mutex;

    #[derive(Default)]
    struct Recorder {
        events: Mutex<Vec<String>>,
    }

    impl ConversionProgressCallback for Recorder {
        fn on_page_stage(&self, page: usize, stage: PageStage) {
            self.events.lock().unwrap().push(format!("{page}:{stage:?}"));
        }

        fn on_page_dropped(&self, page: usize, stage: PageStage, _error: &PageError) {
            self.events.lock().unwrap().push(format!("{page}:drop@{stage:?}"));
        }
    }

    #[test]
    fn noop_callback_does_not_panic() {
        let cb = NoopProgressCallback;
        cb.on_conversion_start(3);
        cb.on_page_stage(1, PageStage::Recognized);
        cb.on_page_dropped(
            2,
            PageStage::Recognized,
            &PageError::Recognition {
                page: 2,
                detail: "exit 1".into(),
            },
        );
        cb.on_conversion_complete(3, 2);
    }

    #[test]
    fn recorder_sees_events_through_arc_dyn() {
        let rec = Arc::new(Recorder::default());
        let cb: ProgressCallback = rec.clone();
        cb.on_page_stage(1, PageStage::Rendered);
        cb.on_page_dropped(
            2,
            PageStage::Sanitized,
            &PageError::Sanitization {
                page: 2,
                detail: "empty".into(),
            },
        );
        let events = rec.events.lock().unwrap().clone();
        assert_eq!(events, vec!["1:Rendered", "2:drop@Sanitized"]);
    }
}
