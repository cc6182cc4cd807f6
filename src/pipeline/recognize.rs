//! Optical music recognition: page image → MusicXML, via an external engine.
//!
//! Each engine implements [`OmrEngine`], which only knows how to build its
//! command line and where its output will appear. Running the command,
//! checking the output, and deciding between sequential and pooled
//! dispatch is shared ([`recognize_pages`]), driven by
//! [`Backend::concurrency`].
//!
//! A failed page never aborts the stage: it comes back as a
//! [`PageError::Recognition`] next to the pages that succeeded.

use crate::backend::{Backend, ConcurrencyPolicy};
use crate::config::{CommandSpec, ToolCommands};
use crate::error::PageError;
use crate::pipeline::process::ExternalCommand;
use crate::pipeline::workdir::{Page, PageIndex};
use futures::stream::{self, StreamExt};
use std::path::{Path, PathBuf};
use std::time::Duration;
use tracing::{info, warn};

/// A page-scoped symbolic score produced by an engine.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RecognizedScore {
    pub index: PageIndex,
    pub path: PathBuf,
}

/// Invocation contract of one OMR engine.
pub trait OmrEngine: Send + Sync {
    fn backend(&self) -> Backend;

    /// Command that recognises `image`, writing into `out_dir` where the
    /// engine supports choosing it.
    fn command(&self, image: &Path, out_dir: &Path) -> ExternalCommand;

    /// Where the score for `image` appears after a successful run.
    fn output_path(&self, image: &Path, out_dir: &Path) -> PathBuf;
}

/// `oemer <image> -o <out_dir>` → `<out_dir>/<stem>.musicxml`
pub struct Oemer {
    spec: CommandSpec,
}

impl OmrEngine for Oemer {
    fn backend(&self) -> Backend {
        Backend::Oemer
    }

    fn command(&self, image: &Path, out_dir: &Path) -> ExternalCommand {
        ExternalCommand::from_spec(&self.spec)
            .arg(image)
            .arg("-o")
            .arg(out_dir)
    }

    fn output_path(&self, image: &Path, out_dir: &Path) -> PathBuf {
        out_dir.join(stem(image)).with_extension("musicxml")
    }
}

/// `python3 -m homr.main <image>` → `<image_dir>/<stem>.musicxml`
///
/// homr has no output flag; it writes next to the image. GPU use is
/// disabled because concurrent CUDA initialisation is what hangs it.
pub struct Homr {
    spec: CommandSpec,
}

impl OmrEngine for Homr {
    fn backend(&self) -> Backend {
        Backend::Homr
    }

    fn command(&self, image: &Path, _out_dir: &Path) -> ExternalCommand {
        ExternalCommand::from_spec(&self.spec)
            .arg(image)
            .env("CUDA_VISIBLE_DEVICES", "")
    }

    fn output_path(&self, image: &Path, _out_dir: &Path) -> PathBuf {
        image.with_extension("musicxml")
    }
}

/// `audiveris -batch -export -option …useCompression=false -output <out_dir> <image>`
/// → `<out_dir>/<stem>/<stem>.xml`
///
/// Audiveris exports each book into its own folder named after the input.
pub struct Audiveris {
    spec: CommandSpec,
}

impl OmrEngine for Audiveris {
    fn backend(&self) -> Backend {
        Backend::Audiveris
    }

    fn command(&self, image: &Path, out_dir: &Path) -> ExternalCommand {
        ExternalCommand::from_spec(&self.spec)
            .arg("-batch")
            .arg("-export")
            .arg("-option")
            .arg("org.audiveris.omr.sheet.BookManager.useCompression=false")
            .arg("-output")
            .arg(out_dir)
            .arg("--")
            .arg(image)
    }

    fn output_path(&self, image: &Path, out_dir: &Path) -> PathBuf {
        let stem = stem(image);
        out_dir.join(&stem).join(stem).with_extension("xml")
    }
}

fn stem(image: &Path) -> PathBuf {
    image.file_stem().map(PathBuf::from).unwrap_or_default()
}

/// Instantiate the engine for `backend` with the configured command line.
pub fn engine_for(backend: Backend, tools: &ToolCommands) -> Box<dyn OmrEngine> {
    match backend {
        Backend::Oemer => Box::new(Oemer {
            spec: tools.oemer.clone(),
        }),
        Backend::Homr => Box::new(Homr {
            spec: tools.homr.clone(),
        }),
        Backend::Audiveris => Box::new(Audiveris {
            spec: tools.audiveris.clone(),
        }),
    }
}

/// Recognise a single page.
pub async fn recognize_page(
    engine: &dyn OmrEngine,
    page: &Page,
    out_dir: &Path,
    timeout: Duration,
) -> Result<RecognizedScore, PageError> {
    let expected = engine.output_path(&page.image, out_dir);
    engine
        .command(&page.image, out_dir)
        .run_expecting(timeout, &expected)
        .await
        .map(|path| RecognizedScore {
            index: page.index,
            path,
        })
        .map_err(|e| PageError::Recognition {
            page: page.index.get(),
            detail: e.to_string(),
        })
}

/// Recognise every page, honouring the engine's concurrency policy.
///
/// Results come back in page order regardless of completion order.
pub async fn recognize_pages(
    engine: &dyn OmrEngine,
    pages: &[Page],
    out_dir: &Path,
    workers: usize,
    timeout: Duration,
    on_done: &(dyn Fn(PageIndex, &Result<RecognizedScore, PageError>) + Sync),
) -> Vec<(PageIndex, Result<RecognizedScore, PageError>)> {
    let policy = engine.backend().concurrency();
    info!(
        "Recognising {} page(s) with {} ({:?})",
        pages.len(),
        engine.backend(),
        policy
    );

    let mut results: Vec<(PageIndex, Result<RecognizedScore, PageError>)> = match policy {
        ConcurrencyPolicy::Sequential => {
            let mut out = Vec::with_capacity(pages.len());
            for page in pages {
                let res = recognize_page(engine, page, out_dir, timeout).await;
                log_outcome(page.index, &res);
                on_done(page.index, &res);
                out.push((page.index, res));
            }
            out
        }
        ConcurrencyPolicy::Parallel => {
            stream::iter(pages.iter().map(|page| async move {
                let res = recognize_page(engine, page, out_dir, timeout).await;
                log_outcome(page.index, &res);
                on_done(page.index, &res);
                (page.index, res)
            }))
            .buffer_unordered(workers.max(1))
            .collect()
            .await
        }
    };

    results.sort_by_key(|(index, _)| *index);
    results
}

fn log_outcome(index: PageIndex, res: &Result<RecognizedScore, PageError>) {
    match res {
        Ok(score) => info!("Page {}: recognised → {}", index, score.path.display()),
        Err(e) => warn!("{e}"),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn args(cmd: &ExternalCommand) -> Vec<String> {
        cmd.args()
            .iter()
            .map(|a| a.to_string_lossy().into_owned())
            .collect()
    }

    #[test]
    fn oemer_contract() {
        let engine = engine_for(Backend::Oemer, &ToolCommands::default());
        let img = Path::new("/w/images/page_0002.png");
        let out = Path::new("/w/scores");
        let cmd = engine.command(img, out);
        assert_eq!(cmd.program(), "oemer");
        assert_eq!(args(&cmd), vec!["/w/images/page_0002.png", "-o", "/w/scores"]);
        assert_eq!(
            engine.output_path(img, out),
            PathBuf::from("/w/scores/page_0002.musicxml")
        );
    }

    #[test]
    fn homr_writes_next_to_image() {
        let engine = engine_for(Backend::Homr, &ToolCommands::default());
        let img = Path::new("/w/images/page_0003.png");
        let cmd = engine.command(img, Path::new("/w/scores"));
        assert_eq!(cmd.program(), "python3");
        assert_eq!(args(&cmd), vec!["-m", "homr.main", "/w/images/page_0003.png"]);
        assert_eq!(
            engine.output_path(img, Path::new("/w/scores")),
            PathBuf::from("/w/images/page_0003.musicxml")
        );
    }

    #[test]
    fn audiveris_exports_uncompressed() {
        let engine = engine_for(Backend::Audiveris, &ToolCommands::default());
        let img = Path::new("/w/images/page_0001.png");
        let out = Path::new("/w/scores");
        let a = args(&engine.command(img, out));
        assert!(a.contains(&"-export".to_string()));
        assert!(a.iter().any(|x| x.ends_with("useCompression=false")));
        assert_eq!(a.last().map(String::as_str), Some("/w/images/page_0001.png"));
        assert_eq!(
            engine.output_path(img, out),
            PathBuf::from("/w/scores/page_0001/page_0001.xml")
        );
    }

    #[test]
    fn engine_reports_its_backend() {
        for b in Backend::ALL {
            assert_eq!(engine_for(b, &ToolCommands::default()).backend(), b);
        }
    }
}
