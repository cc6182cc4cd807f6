//! Audio rendering: sanitised score → MIDI → WAV → MP3, one page at a time.
//!
//! The MIDI and WAV files are intermediates. They live in the page's
//! namespace (`page_NNNN.*`) as [`tempfile::TempPath`]s, so they are removed
//! when this function returns, on success and failure alike. Only the MP3
//! track survives, and a half-written one is deleted if encoding fails.

use crate::config::{CommandSpec, ToolCommands};
use crate::error::PageError;
use crate::pipeline::midi;
use crate::pipeline::process::ExternalCommand;
use crate::pipeline::sanitize::SanitizedScore;
use crate::pipeline::workdir::PageIndex;
use std::path::{Path, PathBuf};
use std::time::Duration;
use tempfile::TempPath;
use tracing::{debug, info};

/// A page's encoded audio track.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RenderedTrack {
    pub index: PageIndex,
    pub path: PathBuf,
}

/// Drives the synthesiser and encoder for one run.
#[derive(Debug, Clone)]
pub struct AudioRenderer {
    soundfont: PathBuf,
    fluidsynth: CommandSpec,
    ffmpeg: CommandSpec,
    timeout: Duration,
}

impl AudioRenderer {
    pub fn new(soundfont: impl Into<PathBuf>, tools: &ToolCommands, timeout: Duration) -> Self {
        Self {
            soundfont: soundfont.into(),
            fluidsynth: tools.fluidsynth.clone(),
            ffmpeg: tools.ffmpeg.clone(),
            timeout,
        }
    }

    /// `fluidsynth -ni <soundfont> <midi> -F <wav>`
    pub fn synth_command(&self, midi: &Path, wav: &Path) -> ExternalCommand {
        ExternalCommand::from_spec(&self.fluidsynth)
            .arg("-ni")
            .arg(&self.soundfont)
            .arg(midi)
            .arg("-F")
            .arg(wav)
    }

    /// `ffmpeg -y -i <wav> <mp3>`
    pub fn encode_command(&self, wav: &Path, mp3: &Path) -> ExternalCommand {
        ExternalCommand::from_spec(&self.ffmpeg)
            .arg("-hide_banner")
            .arg("-loglevel")
            .arg("error")
            .arg("-y")
            .arg("-i")
            .arg(wav)
            .arg(mp3)
    }

    /// Render `score` into `<out_dir>/page_NNNN.mp3`.
    pub async fn render(
        &self,
        score: &SanitizedScore,
        out_dir: &Path,
    ) -> Result<RenderedTrack, PageError> {
        let index = score.index;
        let fail = |detail: String| PageError::Render {
            page: index.get(),
            detail,
        };

        let bytes = midi::to_smf_bytes(score).map_err(fail)?;
        let midi_path = temp_artifact(out_dir, index, ".mid").map_err(|e| fail(e.to_string()))?;
        tokio::fs::write(&midi_path, &bytes)
            .await
            .map_err(|e| fail(format!("cannot write MIDI: {e}")))?;
        debug!("Page {}: MIDI {} bytes", index, bytes.len());

        let wav_path = temp_artifact(out_dir, index, ".wav").map_err(|e| fail(e.to_string()))?;
        self.synth_command(&midi_path, &wav_path)
            .run_expecting(self.timeout, &wav_path)
            .await
            .map_err(|e| fail(e.to_string()))?;

        let mp3 = index.artifact(out_dir, "mp3");
        if let Err(e) = self
            .encode_command(&wav_path, &mp3)
            .run_expecting(self.timeout, &mp3)
            .await
        {
            remove_partial(&mp3).await;
            return Err(fail(e.to_string()));
        }

        info!("Page {}: rendered → {}", index, mp3.display());
        Ok(RenderedTrack { index, path: mp3 })
    }
}

/// An empty, uniquely-named `page_NNNN.<random><suffix>` removed on drop.
fn temp_artifact(dir: &Path, index: PageIndex, suffix: &str) -> std::io::Result<TempPath> {
    let prefix = format!("{}.", index.stem());
    Ok(tempfile::Builder::new()
        .prefix(&prefix)
        .suffix(suffix)
        .tempfile_in(dir)?
        .into_temp_path())
}

pub(crate) async fn remove_partial(path: &Path) {
    match tokio::fs::remove_file(path).await {
        Ok(()) => debug!("Removed partial output {}", path.display()),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
        Err(e) => tracing::warn!("Could not remove partial output {}: {e}", path.display()),
    }
}

#[cfg(all(test, unix))]
mod tests {
    use super::*;
    use crate::pipeline::score::NoteEvent;

    const FAKE_FLUIDSYNTH: &str =
        r#"while [ $# -gt 0 ]; do if [ "$1" = "-F" ]; then shift; printf 'RIFF' > "$1"; fi; shift; done"#;
    const FAKE_FFMPEG: &str = r#"for a; do out=$a; done; printf 'ID3' > "$out""#;
    const BROKEN_FFMPEG: &str = r#"for a; do out=$a; done; printf 'ID' > "$out"; exit 1"#;

    fn sh(script: &str, name: &str) -> CommandSpec {
        CommandSpec::new("sh").with_args(["-c", script, name])
    }

    fn renderer(ffmpeg: &str) -> AudioRenderer {
        let tools = ToolCommands {
            fluidsynth: sh(FAKE_FLUIDSYNTH, "fluidsynth"),
            ffmpeg: sh(ffmpeg, "ffmpeg"),
            ..ToolCommands::default()
        };
        AudioRenderer::new("/sf/piano.sf2", &tools, Duration::from_secs(10))
    }

    fn page(n: usize) -> SanitizedScore {
        SanitizedScore {
            index: PageIndex::new(n),
            tempo_bpm: 120,
            notes: vec![NoteEvent {
                onset: 0.0,
                duration: 1.0,
                pitch: 60,
                velocity: 80,
                voice: 1,
            }],
            highest_time: 1.0,
        }
    }

    fn dir_entries(dir: &Path) -> Vec<String> {
        let mut v: Vec<String> = std::fs::read_dir(dir)
            .unwrap()
            .map(|e| e.unwrap().file_name().to_string_lossy().into_owned())
            .collect();
        v.sort();
        v
    }

    #[test]
    fn synth_command_shape() {
        let r = AudioRenderer::new("/sf/piano.sf2", &ToolCommands::default(), Duration::from_secs(1));
        let cmd = r.synth_command(Path::new("a.mid"), Path::new("a.wav"));
        let args: Vec<String> = cmd.args().iter().map(|a| a.to_string_lossy().into_owned()).collect();
        assert_eq!(cmd.program(), "fluidsynth");
        assert_eq!(args, vec!["-ni", "/sf/piano.sf2", "a.mid", "-F", "a.wav"]);
    }

    #[tokio::test]
    async fn renders_track_and_cleans_intermediates() {
        let tmp = tempfile::tempdir().unwrap();
        let track = renderer(FAKE_FFMPEG).render(&page(3), tmp.path()).await.unwrap();
        assert_eq!(track.path, tmp.path().join("page_0003.mp3"));
        assert_eq!(std::fs::read(&track.path).unwrap(), b"ID3");
        assert_eq!(dir_entries(tmp.path()), vec!["page_0003.mp3"]);
    }

    #[tokio::test]
    async fn failed_encode_leaves_nothing_behind() {
        let tmp = tempfile::tempdir().unwrap();
        let err = renderer(BROKEN_FFMPEG).render(&page(2), tmp.path()).await.unwrap_err();
        assert_eq!(err.page(), 2);
        assert!(matches!(err, PageError::Render { .. }));
        assert!(dir_entries(tmp.path()).is_empty());
    }

    #[tokio::test]
    async fn synth_that_writes_nothing_fails() {
        let tmp = tempfile::tempdir().unwrap();
        let tools = ToolCommands {
            fluidsynth: sh("exit 0", "fluidsynth"),
            ffmpeg: sh(FAKE_FFMPEG, "ffmpeg"),
            ..ToolCommands::default()
        };
        let r = AudioRenderer::new("/sf/piano.sf2", &tools, Duration::from_secs(10));
        let err = r.render(&page(1), tmp.path()).await.unwrap_err();
        assert!(err.to_string().contains("fluidsynth") || err.to_string().contains("sh"));
        assert!(dir_entries(tmp.path()).is_empty());
    }
}
