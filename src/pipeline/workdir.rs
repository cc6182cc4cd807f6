//! Working directory lifecycle and the page naming convention.
//!
//! Every artifact of page `n` is named `page_NNNN.<ext>`; the zero padding
//! makes lexical and numeric order agree, and [`PageIndex::from_path`] lets
//! any stage recover the index from a file name alone. Pages therefore own
//! disjoint filename namespaces inside the shared directory and need no
//! locking.

use crate::error::ConversionError;
use once_cell::sync::Lazy;
use regex::Regex;
use std::fmt;
use std::path::{Path, PathBuf};
use tracing::{debug, info};

/// 1-based page index; the permanent identity of a page within a run.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct PageIndex(usize);

static RE_PAGE_STEM: Lazy<Regex> = Lazy::new(|| Regex::new(r"^page_(\d+)$").unwrap());

impl PageIndex {
    /// # Panics
    /// When `n` is zero; page indices start at 1.
    pub fn new(n: usize) -> Self {
        assert!(n >= 1, "page indices are 1-based");
        Self(n)
    }

    pub fn get(self) -> usize {
        self.0
    }

    /// `page_0007`
    pub fn stem(self) -> String {
        format!("page_{:04}", self.0)
    }

    /// `<dir>/page_0007.<ext>`
    pub fn artifact(self, dir: &Path, ext: &str) -> PathBuf {
        dir.join(format!("{}.{}", self.stem(), ext))
    }

    /// Recover the index from any artifact path following the convention.
    pub fn from_path(path: &Path) -> Option<Self> {
        let stem = path.file_stem()?.to_str()?;
        let caps = RE_PAGE_STEM.captures(stem)?;
        caps[1].parse::<usize>().ok().filter(|&n| n >= 1).map(Self)
    }
}

impl fmt::Display for PageIndex {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// An extracted page image.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Page {
    pub index: PageIndex,
    pub image: PathBuf,
}

impl Page {
    pub fn new(index: PageIndex, image: impl Into<PathBuf>) -> Self {
        Self {
            index,
            image: image.into(),
        }
    }

    /// Rebuild a page from an image that follows the naming convention.
    pub fn from_image(image: impl Into<PathBuf>) -> Option<Self> {
        let image = image.into();
        PageIndex::from_path(&image).map(|index| Self { index, image })
    }
}

/// Sub-directory holding page images.
pub const IMAGES_DIR: &str = "images";
/// Sub-directory holding recognised scores and rendered tracks.
pub const SCORES_DIR: &str = "scores";

/// Destructively reset the run directory and recreate its layout.
///
/// Everything under `dir` from a previous run is removed.
pub async fn reset(dir: &Path) -> Result<(), ConversionError> {
    let err = |e: std::io::Error| ConversionError::WorkDir {
        path: dir.to_path_buf(),
        detail: e.to_string(),
    };

    match tokio::fs::remove_dir_all(dir).await {
        Ok(()) => debug!("Cleared previous run in {}", dir.display()),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
        Err(e) => return Err(err(e)),
    }
    tokio::fs::create_dir_all(dir.join(IMAGES_DIR)).await.map_err(err)?;
    tokio::fs::create_dir_all(dir.join(SCORES_DIR)).await.map_err(err)?;
    info!("Working directory ready: {}", dir.display());
    Ok(())
}
