//! Conversion entry points.
//!
//! [`ConversionPipeline`] owns the configuration and runs one request at a
//! time through the stages. The free functions ([`convert`],
//! [`convert_to_file`], [`convert_sync`], [`inspect`]) wrap it for callers
//! that do not need to keep a pipeline around.

use crate::config::PipelineConfig;
use crate::error::{ConversionError, PageError};
use crate::output::{ConversionResult, ConversionStats, PageReport, PageStage, PageState};
use crate::pipeline::extract::{self, ExtractOptions, SourceDocument};
use crate::pipeline::merge;
use crate::pipeline::recognize::{self, RecognizedScore};
use crate::pipeline::render::{AudioRenderer, RenderedTrack};
use crate::pipeline::sanitize::{self, SanitizeError, SanitizeOptions};
use crate::pipeline::workdir::{self, Page, PageIndex, SCORES_DIR};
use crate::progress::{ConversionProgressCallback, NoopProgressCallback};
use crate::request::ConversionRequest;
use futures::stream::{self, StreamExt};
use std::collections::BTreeMap;
use std::path::Path;
use std::time::Instant;
use tracing::{debug, info, warn};

static NOOP_PROGRESS: NoopProgressCallback = NoopProgressCallback;

/// Where and why a page left the pipeline.
type Dropped = BTreeMap<PageIndex, (PageStage, PageError)>;

/// Runs conversion requests against one configuration.
///
/// A pipeline owns its working directory: running two requests concurrently
/// on the same pipeline (or on two pipelines sharing `work_dir`) is not
/// supported.
#[derive(Debug, Clone)]
pub struct ConversionPipeline {
    config: PipelineConfig,
}

impl ConversionPipeline {
    pub fn new(config: PipelineConfig) -> Self {
        Self { config }
    }

    pub fn config(&self) -> &PipelineConfig {
        &self.config
    }

    /// Convert a document end to end.
    ///
    /// Resets the working directory, splits the document into pages, and
    /// hands them to [`Self::convert_pages`].
    ///
    /// # Errors
    /// Only for fatal conditions: unreadable or unsupported document, an
    /// unusable working directory, no page recognised, no track rendered, or
    /// a failed merge. Individual page failures are reported in
    /// [`ConversionStats::pages`] instead.
    pub async fn run(&self, request: &ConversionRequest) -> Result<ConversionResult, ConversionError> {
        let total_start = Instant::now();
        info!(
            "Starting conversion: {} (engine {}, {} bpm, transpose {:+})",
            request.source().display(),
            request.backend(),
            request.tempo_bpm(),
            request.transpose()
        );

        if source_inside(request.source(), &self.config.work_dir).await {
            return Err(ConversionError::InvalidRequest(format!(
                "'{}' is inside the working directory '{}', which is wiped on every run",
                request.source().display(),
                self.config.work_dir.display()
            )));
        }
        workdir::reset(&self.config.work_dir).await?;

        // ── Extract ──────────────────────────────────────────────────────
        let extract_start = Instant::now();
        let doc = extract::ingest(request.source(), self.config.pdfium_lib_path.as_deref()).await?;
        info!("{} has {} page(s)", doc.path.display(), doc.page_count);
        let pages = extract::extract_pages(&doc, &self.config.work_dir, &self.extract_options()).await?;
        let extract_duration_ms = extract_start.elapsed().as_millis() as u64;

        let mut result = self.convert_pages(request, pages).await?;
        result.stats.extract_duration_ms = extract_duration_ms;
        result.stats.total_duration_ms = total_start.elapsed().as_millis() as u64;
        Ok(result)
    }

    /// Convert already-extracted page images.
    ///
    /// The images must follow the `page_NNNN` naming convention (see
    /// [`Page::from_image`]). The working directory is not reset; its
    /// `scores/` sub-directory is created if missing.
    pub async fn convert_pages(
        &self,
        request: &ConversionRequest,
        mut pages: Vec<Page>,
    ) -> Result<ConversionResult, ConversionError> {
        let start = Instant::now();
        let progress = self.progress();
        let scores_dir = self.config.work_dir.join(SCORES_DIR);
        tokio::fs::create_dir_all(&scores_dir)
            .await
            .map_err(|e| ConversionError::WorkDir {
                path: scores_dir.clone(),
                detail: e.to_string(),
            })?;

        pages.sort_by_key(|p| p.index);
        pages.dedup_by_key(|p| p.index);
        let total = pages.len();
        if total == 0 {
            return Err(ConversionError::NoPagesRecognized {
                total: 0,
                first_error: "document produced no pages".into(),
            });
        }

        progress.on_conversion_start(total);
        for page in &pages {
            progress.on_page_stage(page.index.get(), PageStage::Extracted);
        }

        let mut dropped = Dropped::new();

        // ── Recognise ────────────────────────────────────────────────────
        let recognition_start = Instant::now();
        let engine = recognize::engine_for(request.backend(), &self.config.tools);
        let on_recognized = |index: PageIndex, res: &Result<RecognizedScore, PageError>| match res {
            Ok(_) => progress.on_page_stage(index.get(), PageStage::Recognized),
            Err(e) => progress.on_page_dropped(index.get(), PageStage::Recognized, e),
        };
        let recognized = recognize::recognize_pages(
            engine.as_ref(),
            &pages,
            &scores_dir,
            self.config.recognition_workers,
            self.config.recognition_timeout(),
            &on_recognized,
        )
        .await;
        let recognition_duration_ms = recognition_start.elapsed().as_millis() as u64;

        let mut scores = Vec::with_capacity(recognized.len());
        for (index, res) in recognized {
            match res {
                Ok(score) => scores.push(score),
                Err(e) => {
                    dropped.insert(index, (PageStage::Recognized, e));
                }
            }
        }
        let recognized_pages = scores.len();
        info!(
            "Recognised {}/{} page(s) in {}ms",
            recognized_pages, total, recognition_duration_ms
        );

        if scores.is_empty() {
            progress.on_conversion_complete(total, 0);
            return Err(ConversionError::NoPagesRecognized {
                total,
                first_error: first_error(&dropped),
            });
        }

        // ── Sanitise + render ────────────────────────────────────────────
        let render_start = Instant::now();
        let renderer = AudioRenderer::new(
            &self.config.soundfont,
            &self.config.tools,
            self.config.render_timeout(),
        );
        let options = SanitizeOptions {
            tempo_bpm: request.tempo_bpm(),
            transpose: request.transpose(),
        };
        let outcomes: Vec<(PageIndex, Result<RenderedTrack, (PageStage, PageError)>)> =
            stream::iter(scores.into_iter().map(|score| {
                let renderer = &renderer;
                let scores_dir = scores_dir.as_path();
                async move {
                    let index = score.index;
                    let outcome = self
                        .sanitize_and_render(score, options, renderer, scores_dir, progress)
                        .await;
                    (index, outcome)
                }
            }))
            .buffer_unordered(self.config.render_workers.max(1))
            .collect()
            .await;
        let render_duration_ms = render_start.elapsed().as_millis() as u64;

        let mut tracks = Vec::with_capacity(outcomes.len());
        for (index, outcome) in outcomes {
            match outcome {
                Ok(track) => tracks.push(track),
                Err(reason) => {
                    dropped.insert(index, reason);
                }
            }
        }
        tracks.sort_by_key(|t| t.index);
        let rendered_pages = tracks.len();
        info!(
            "Rendered {}/{} track(s) in {}ms",
            rendered_pages, recognized_pages, render_duration_ms
        );

        if tracks.is_empty() {
            progress.on_conversion_complete(total, 0);
            return Err(ConversionError::NoTracksRendered {
                total,
                dropped: dropped.len(),
                first_error: first_error(&dropped),
            });
        }

        // ── Merge ────────────────────────────────────────────────────────
        let merge_start = Instant::now();
        let output = self
            .config
            .work_dir
            .join(format!("{}_merged.mp3", request.output_stem()));
        if let Err(e) = merge::merge_tracks(
            &tracks,
            &output,
            &self.config.tools.ffmpeg,
            self.config.merge_timeout(),
        )
        .await
        {
            progress.on_conversion_complete(total, 0);
            return Err(e);
        }
        let merge_duration_ms = merge_start.elapsed().as_millis() as u64;
        for track in &tracks {
            progress.on_page_stage(track.index.get(), PageStage::Merged);
        }

        let reports = page_reports(&pages, dropped);
        let stats = ConversionStats {
            total_pages: total,
            recognized_pages,
            rendered_pages,
            merged_pages: tracks.len(),
            pages: reports,
            extract_duration_ms: 0,
            recognition_duration_ms,
            render_duration_ms,
            merge_duration_ms,
            total_duration_ms: start.elapsed().as_millis() as u64,
        };

        info!(
            "Conversion complete: {}/{} page(s) merged into {} ({}ms)",
            stats.merged_pages,
            total,
            output.display(),
            stats.total_duration_ms
        );
        progress.on_conversion_complete(total, stats.merged_pages);

        Ok(ConversionResult {
            output_path: output,
            backend: request.backend(),
            info: request.backend().info(),
            stats,
        })
    }

    /// Sanitise one recognised score and render it to a track.
    async fn sanitize_and_render(
        &self,
        score: RecognizedScore,
        options: SanitizeOptions,
        renderer: &AudioRenderer,
        out_dir: &Path,
        progress: &dyn ConversionProgressCallback,
    ) -> Result<RenderedTrack, (PageStage, PageError)> {
        let index = score.index;
        let page = index.get();

        // Parsing and sanitising are CPU-bound.
        let sanitized = tokio::task::spawn_blocking(move || {
            sanitize::load_and_sanitize(&score.path, index, options)
        })
        .await
        .map_err(|e| format!("sanitiser task panicked: {e}"))
        .and_then(|res| {
            res.map_err(|e| {
                match &e {
                    SanitizeError::Empty => info!("Page {}: no playable notes, skipping", index),
                    other => warn!("Page {}: score rejected: {}", index, other),
                }
                e.to_string()
            })
        });

        let sanitized = match sanitized {
            Ok(s) => s,
            Err(detail) => {
                let err = PageError::Sanitization { page, detail };
                progress.on_page_dropped(page, PageStage::Sanitized, &err);
                return Err((PageStage::Sanitized, err));
            }
        };
        debug!(
            "Page {}: sanitised to {} note(s), {:.1} quarters",
            index,
            sanitized.notes.len(),
            sanitized.highest_time
        );
        progress.on_page_stage(page, PageStage::Sanitized);

        match renderer.render(&sanitized, out_dir).await {
            Ok(track) => {
                progress.on_page_stage(page, PageStage::Rendered);
                Ok(track)
            }
            Err(err) => {
                warn!("{err}");
                progress.on_page_dropped(page, PageStage::Rendered, &err);
                Err((PageStage::Rendered, err))
            }
        }
    }

    fn progress(&self) -> &dyn ConversionProgressCallback {
        match &self.config.progress_callback {
            Some(cb) => cb.as_ref(),
            None => &NOOP_PROGRESS,
        }
    }

    fn extract_options(&self) -> ExtractOptions {
        ExtractOptions {
            dpi: self.config.dpi,
            max_page_pixels: self.config.max_page_pixels,
            pdfium_lib_path: self.config.pdfium_lib_path.clone(),
        }
    }
}

fn first_error(dropped: &Dropped) -> String {
    dropped
        .values()
        .next()
        .map(|(_, e)| e.to_string())
        .unwrap_or_else(|| "Unknown error".to_string())
}

/// Whether `source` lives under `work_dir`. Paths that do not resolve are
/// left for ingest to report.
async fn source_inside(source: &Path, work_dir: &Path) -> bool {
    match (
        tokio::fs::canonicalize(source).await,
        tokio::fs::canonicalize(work_dir).await,
    ) {
        (Ok(source), Ok(work_dir)) => source.starts_with(work_dir),
        _ => false,
    }
}

fn page_reports(pages: &[Page], mut dropped: Dropped) -> Vec<PageReport> {
    pages
        .iter()
        .map(|p| PageReport {
            page: p.index.get(),
            state: match dropped.remove(&p.index) {
                Some((stage, error)) => PageState::Dropped { stage, error },
                None => PageState::Merged,
            },
        })
        .collect()
}

// ── Convenience wrappers ─────────────────────────────────────────────────

/// Convert a document with a one-off pipeline.
pub async fn convert(
    request: &ConversionRequest,
    config: &PipelineConfig,
) -> Result<ConversionResult, ConversionError> {
    ConversionPipeline::new(config.clone()).run(request).await
}

/// Convert and copy the merged track to `output_path`.
///
/// Uses atomic write (temp file + rename) so a reader never sees a partial
/// file. The returned result points at `output_path`.
pub async fn convert_to_file(
    request: &ConversionRequest,
    output_path: impl AsRef<Path>,
    config: &PipelineConfig,
) -> Result<ConversionResult, ConversionError> {
    let mut result = convert(request, config).await?;
    let path = output_path.as_ref();
    let write_err = |e: std::io::Error| ConversionError::OutputWriteFailed {
        path: path.to_path_buf(),
        source: e,
    };

    if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
        tokio::fs::create_dir_all(parent).await.map_err(write_err)?;
    }

    let tmp_path = path.with_extension("mp3.tmp");
    tokio::fs::copy(&result.output_path, &tmp_path)
        .await
        .map_err(write_err)?;
    tokio::fs::rename(&tmp_path, path).await.map_err(write_err)?;

    result.output_path = path.to_path_buf();
    Ok(result)
}

/// Synchronous wrapper around [`convert`].
///
/// Creates a temporary tokio runtime internally.
pub fn convert_sync(
    request: &ConversionRequest,
    config: &PipelineConfig,
) -> Result<ConversionResult, ConversionError> {
    tokio::runtime::Runtime::new()
        .map_err(|e| ConversionError::Internal(format!("Failed to create tokio runtime: {}", e)))?
        .block_on(convert(request, config))
}

/// Detect the format and page count of a document without converting it.
///
/// Needs neither OMR engines nor a soundfont.
pub async fn inspect(
    path: impl AsRef<Path>,
    pdfium_lib_path: Option<&Path>,
) -> Result<SourceDocument, ConversionError> {
    extract::ingest(path.as_ref(), pdfium_lib_path).await
}
