//! Result types: the merged track, per-page outcomes, and run statistics.

use crate::backend::{Backend, BackendInfo};
use crate::error::{ConversionError, PageError};
use base64::{engine::general_purpose::STANDARD, Engine as _};
use serde::{Deserialize, Serialize};
use std::path::PathBuf;

/// Stages of the per-page lifecycle, in order.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub enum PageStage {
    Extracted,
    Recognized,
    Sanitized,
    Rendered,
    Merged,
}

/// Terminal state of one page.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "state", rename_all = "lowercase")]
pub enum PageState {
    /// The page's track is part of the merged output.
    Merged,
    /// The page failed while being brought to `stage`.
    Dropped { stage: PageStage, error: PageError },
}

/// Outcome of one page of the source document.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PageReport {
    /// 1-based page index.
    pub page: usize,
    #[serde(flatten)]
    pub state: PageState,
}

impl PageReport {
    pub fn is_merged(&self) -> bool {
        matches!(self.state, PageState::Merged)
    }
}

/// Statistics for one run.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ConversionStats {
    pub total_pages: usize,
    pub recognized_pages: usize,
    pub rendered_pages: usize,
    pub merged_pages: usize,
    /// One entry per page, ascending page order.
    pub pages: Vec<PageReport>,
    pub extract_duration_ms: u64,
    pub recognition_duration_ms: u64,
    pub render_duration_ms: u64,
    pub merge_duration_ms: u64,
    pub total_duration_ms: u64,
}

impl ConversionStats {
    pub fn dropped_pages(&self) -> usize {
        self.pages.iter().filter(|p| !p.is_merged()).count()
    }

    /// Pages whose tracks made it into the merge, ascending.
    pub fn merged_page_indices(&self) -> Vec<usize> {
        self.pages
            .iter()
            .filter(|p| p.is_merged())
            .map(|p| p.page)
            .collect()
    }
}

/// A successful conversion.
#[derive(Debug, Clone, Serialize)]
pub struct ConversionResult {
    /// The merged compressed-audio file inside the working directory.
    pub output_path: PathBuf,
    pub backend: Backend,
    pub info: BackendInfo,
    pub stats: ConversionStats,
}

impl ConversionResult {
    /// Read the merged track into memory.
    pub async fn read_audio(&self) -> Result<Vec<u8>, ConversionError> {
        tokio::fs::read(&self.output_path)
            .await
            .map_err(|e| ConversionError::Internal(format!(
                "cannot read merged track '{}': {e}",
                self.output_path.display()
            )))
    }

    /// Build a serialisable response, optionally carrying the audio as base64.
    pub async fn to_response(&self, embed_audio: bool) -> Result<ConversionResponse, ConversionError> {
        let bytes = self.read_audio().await?;
        Ok(ConversionResponse {
            filename: self
                .output_path
                .file_name()
                .map(|n| n.to_string_lossy().into_owned()),
            size_bytes: bytes.len() as u64,
            tool: self.backend,
            meta: self.info.clone(),
            dropped_pages: self.stats.dropped_pages(),
            pages: self.stats.pages.clone(),
            mp3_base64: embed_audio.then(|| STANDARD.encode(&bytes)),
        })
    }
}

/// JSON shape handed to whatever serves the result.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ConversionResponse {
    pub filename: Option<String>,
    pub size_bytes: u64,
    pub tool: Backend,
    pub meta: BackendInfo,
    pub dropped_pages: usize,
    pub pages: Vec<PageReport>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub mp3_base64: Option<String>,
}

#[cfg(test)]
mod tests {
    use super::*;

    fn stats() -> ConversionStats {
        ConversionStats {
            total_pages: 3,
            pages: vec![
                PageReport { page: 1, state: PageState::Merged },
                PageReport {
                    page: 2,
                    state: PageState::Dropped {
                        stage: PageStage::Recognized,
                        error: PageError::Recognition {
                            page: 2,
                            detail: "exit status 1".into(),
                        },
                    },
                },
                PageReport { page: 3, state: PageState::Merged },
            ],
            ..Default::default()
        }
    }

    #[test]
    fn merged_indices_skip_dropped() {
        let s = stats();
        assert_eq!(s.merged_page_indices(), vec![1, 3]);
        assert_eq!(s.dropped_pages(), 1);
    }

    #[test]
    fn page_report_json_shape() {
        let json = serde_json::to_value(&stats().pages[1]).unwrap();
        assert_eq!(json["page"], 2);
        assert_eq!(json["state"], "dropped");
        assert_eq!(json["stage"], "Recognized");
    }

    #[test]
    fn stages_are_ordered() {
        assert!(PageStage::Extracted < PageStage::Recognized);
        assert!(PageStage::Rendered < PageStage::Merged);
    }

    #[tokio::test]
    async fn response_embeds_audio_on_request() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("tune_merged.mp3");
        std::fs::write(&path, b"ID3abc").unwrap();
        let result = ConversionResult {
            output_path: path,
            backend: Backend::Homr,
            info: Backend::Homr.info(),
            stats: stats(),
        };

        let plain = result.to_response(false).await.unwrap();
        assert_eq!(plain.size_bytes, 6);
        assert!(plain.mp3_base64.is_none());
        assert_eq!(plain.filename.as_deref(), Some("tune_merged.mp3"));

        let embedded = result.to_response(true).await.unwrap();
        assert_eq!(embedded.mp3_base64.as_deref(), Some("SUQzYWJj"));
        assert_eq!(embedded.dropped_pages, 1);
    }
}
