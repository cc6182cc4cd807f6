//! Page extraction: split a source document into numbered page images.
//!
//! PDFs are rasterised through pdfium at the configured DPI; a single image
//! (PNG/JPEG photo or scan) becomes page 1. Either way the pages land in the
//! working directory as `images/page_NNNN.png`, so OMR engines that write
//! their output next to the input never touch the caller's files.
//!
//! pdfium keeps thread-local state and rasterisation is CPU-bound, so all of
//! it runs inside `spawn_blocking`.

use crate::error::ConversionError;
use crate::pipeline::workdir::{Page, PageIndex, IMAGES_DIR};
use image::{DynamicImage, ImageFormat};
use pdfium_render::prelude::*;
use serde::Serialize;
use std::io::Read;
use std::path::{Path, PathBuf};
use tracing::{debug, info};

/// Kind of source document.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum DocumentFormat {
    /// Multi-page PDF.
    Pdf,
    /// A single raster image.
    Image,
}

/// An ingested source document. Immutable once ingested.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct SourceDocument {
    pub path: PathBuf,
    pub format: DocumentFormat,
    pub page_count: usize,
}

/// Rasterisation settings.
#[derive(Debug, Clone)]
pub struct ExtractOptions {
    pub dpi: u32,
    pub max_page_pixels: u32,
    pub pdfium_lib_path: Option<PathBuf>,
}

/// Validate the document, detect its format and count its pages.
pub async fn ingest(
    path: &Path,
    pdfium_lib_path: Option<&Path>,
) -> Result<SourceDocument, ConversionError> {
    let path = path.to_path_buf();
    let lib = pdfium_lib_path.map(Path::to_path_buf);
    tokio::task::spawn_blocking(move || ingest_blocking(&path, lib.as_deref()))
        .await
        .map_err(|e| ConversionError::Internal(format!("Ingest task panicked: {e}")))?
}

fn ingest_blocking(
    path: &Path,
    pdfium_lib_path: Option<&Path>,
) -> Result<SourceDocument, ConversionError> {
    let format = detect_format(path)?;
    let page_count = match format {
        DocumentFormat::Pdf => {
            let pdfium = bind_pdfium(pdfium_lib_path)?;
            let document = load_pdf(&pdfium, path)?;
            document.pages().len() as usize
        }
        DocumentFormat::Image => {
            // Decode the header now so a truncated upload fails here, not in the engine.
            image::image_dimensions(path).map_err(|e| ConversionError::CorruptDocument {
                path: path.to_path_buf(),
                detail: e.to_string(),
            })?;
            1
        }
    };

    if page_count == 0 {
        return Err(ConversionError::CorruptDocument {
            path: path.to_path_buf(),
            detail: "document has no pages".into(),
        });
    }

    debug!("Ingested {} ({:?}, {} pages)", path.display(), format, page_count);
    Ok(SourceDocument {
        path: path.to_path_buf(),
        format,
        page_count,
    })
}

/// Sniff the document type from its first bytes.
pub fn detect_format(path: &Path) -> Result<DocumentFormat, ConversionError> {
    if !path.exists() {
        return Err(ConversionError::FileNotFound {
            path: path.to_path_buf(),
        });
    }

    let mut header = [0u8; 16];
    let n = match std::fs::File::open(path) {
        Ok(mut f) => f.read(&mut header).map_err(|e| ConversionError::CorruptDocument {
            path: path.to_path_buf(),
            detail: e.to_string(),
        })?,
        Err(e) if e.kind() == std::io::ErrorKind::PermissionDenied => {
            return Err(ConversionError::PermissionDenied {
                path: path.to_path_buf(),
            });
        }
        Err(_) => {
            return Err(ConversionError::FileNotFound {
                path: path.to_path_buf(),
            });
        }
    };
    let header = &header[..n];

    if header.starts_with(b"%PDF") {
        return Ok(DocumentFormat::Pdf);
    }
    match image::guess_format(header) {
        Ok(ImageFormat::Png) | Ok(ImageFormat::Jpeg) => Ok(DocumentFormat::Image),
        _ => {
            let mut magic = [0u8; 4];
            let len = header.len().min(4);
            magic[..len].copy_from_slice(&header[..len]);
            Err(ConversionError::UnsupportedFormat {
                path: path.to_path_buf(),
                magic,
            })
        }
    }
}

/// Write every page of `doc` to `<work_dir>/images/page_NNNN.png`.
///
/// Any failure is fatal: a document that cannot be split has no pages to
/// process.
pub async fn extract_pages(
    doc: &SourceDocument,
    work_dir: &Path,
    options: &ExtractOptions,
) -> Result<Vec<Page>, ConversionError> {
    let doc = doc.clone();
    let out_dir = work_dir.join(IMAGES_DIR);
    let options = options.clone();

    let pages = tokio::task::spawn_blocking(move || match doc.format {
        DocumentFormat::Pdf => rasterise_pdf(&doc.path, &out_dir, &options),
        DocumentFormat::Image => normalise_image(&doc.path, &out_dir).map(|p| vec![p]),
    })
    .await
    .map_err(|e| ConversionError::Internal(format!("Extraction task panicked: {e}")))??;

    info!("Extracted {} page image(s)", pages.len());
    Ok(pages)
}

fn rasterise_pdf(
    pdf_path: &Path,
    out_dir: &Path,
    options: &ExtractOptions,
) -> Result<Vec<Page>, ConversionError> {
    let pdfium = bind_pdfium(options.pdfium_lib_path.as_deref())?;
    let document = load_pdf(&pdfium, pdf_path)?;

    let scale = options.dpi as f32 / 72.0;
    let render_config = PdfRenderConfig::new()
        .scale_page_by_factor(scale)
        .set_maximum_width(options.max_page_pixels as i32)
        .set_maximum_height(options.max_page_pixels as i32);

    let mut pages = Vec::new();
    for (i, page) in document.pages().iter().enumerate() {
        let index = PageIndex::new(i + 1);
        let bitmap = page
            .render_with_config(&render_config)
            .map_err(|e| ConversionError::ExtractionFailed {
                page: index.get(),
                detail: format!("{e:?}"),
            })?;
        let image = bitmap.as_image();
        let path = index.artifact(out_dir, "png");
        save_png(&image, &path, index)?;
        debug!(
            "Rendered page {} → {}x{} px",
            index,
            image.width(),
            image.height()
        );
        pages.push(Page::new(index, path));
    }
    Ok(pages)
}

/// Re-encode a single uploaded image as page 1.
fn normalise_image(src: &Path, out_dir: &Path) -> Result<Page, ConversionError> {
    let index = PageIndex::new(1);
    let image = image::open(src).map_err(|e| ConversionError::CorruptDocument {
        path: src.to_path_buf(),
        detail: e.to_string(),
    })?;
    let path = index.artifact(out_dir, "png");
    save_png(&image, &path, index)?;
    Ok(Page::new(index, path))
}

fn save_png(image: &DynamicImage, path: &Path, index: PageIndex) -> Result<(), ConversionError> {
    image
        .save_with_format(path, ImageFormat::Png)
        .map_err(|e| ConversionError::ExtractionFailed {
            page: index.get(),
            detail: format!("cannot write {}: {e}", path.display()),
        })
}

fn bind_pdfium(lib_dir: Option<&Path>) -> Result<Pdfium, ConversionError> {
    let bindings = match lib_dir {
        Some(dir) => Pdfium::bind_to_library(Pdfium::pdfium_platform_library_name_at_path(dir)),
        None => Pdfium::bind_to_system_library(),
    }
    .map_err(|e| ConversionError::PdfiumBindingFailed(format!("{e:?}")))?;
    Ok(Pdfium::new(bindings))
}

fn load_pdf<'a>(pdfium: &'a Pdfium, path: &Path) -> Result<PdfDocument<'a>, ConversionError> {
    pdfium
        .load_pdf_from_file(path, None)
        .map_err(|e| ConversionError::CorruptDocument {
            path: path.to_path_buf(),
            detail: format!("{e:?}"),
        })
}
