//! Configuration for the conversion pipeline.
//!
//! Everything that used to be a process-wide constant (working directory,
//! soundfont, pool sizes, tool locations) lives in [`PipelineConfig`], built
//! once via [`PipelineConfigBuilder`] and passed into
//! [`crate::convert::ConversionPipeline::new`]. Per-call parameters (engine,
//! tempo, transpose) live in [`crate::request::ConversionRequest`] instead.

use crate::error::ConversionError;
use crate::progress::ProgressCallback;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::path::{Path, PathBuf};
use std::time::Duration;

/// Configuration for a conversion pipeline.
///
/// # Example
/// ```rust
/// use score2audio::PipelineConfig;
///
/// let config = PipelineConfig::builder()
///     .work_dir("/tmp/score2audio")
///     .soundfont("/usr/share/sounds/sf2/FluidR3_GM.sf2")
///     .render_workers(8)
///     .build()
///     .unwrap();
/// ```
#[derive(Clone)]
pub struct PipelineConfig {
    /// Working directory for one run. Wiped at the start of every run. Default: `./output`.
    ///
    /// Every page artifact is written here under a page-qualified name, so
    /// concurrent page tasks never collide. Two runs must not share it.
    pub work_dir: PathBuf,

    /// SoundFont (`.sf2`) used by the synthesiser. Required.
    pub soundfont: PathBuf,

    /// Rasterisation DPI for PDF pages. Range: 72–600. Default: 300.
    ///
    /// OMR engines are trained on 300 DPI scans; lower values lose stems and
    /// ledger lines.
    pub dpi: u32,

    /// Cap on either rendered page dimension in pixels. Default: 6000.
    pub max_page_pixels: u32,

    /// Concurrent recognition invocations for engines that allow it.
    /// Default: available parallelism.
    pub recognition_workers: usize,

    /// Concurrent sanitize + synthesise + encode tasks. Default: 4.
    pub render_workers: usize,

    /// Per-page recognition timeout in seconds. Default: 900.
    pub recognition_timeout_secs: u64,

    /// Timeout for each synthesis or encoding call in seconds. Default: 300.
    pub render_timeout_secs: u64,

    /// Timeout for the final merge in seconds. Default: 300.
    pub merge_timeout_secs: u64,

    /// External program command lines.
    pub tools: ToolCommands,

    /// Directory containing the pdfium shared library. `None` uses the
    /// system library search path.
    pub pdfium_lib_path: Option<PathBuf>,

    /// Optional per-page progress events.
    pub progress_callback: Option<ProgressCallback>,
}

impl Default for PipelineConfig {
    fn default() -> Self {
        Self {
            work_dir: PathBuf::from("output"),
            soundfont: PathBuf::new(),
            dpi: 300,
            max_page_pixels: 6000,
            recognition_workers: default_workers(),
            render_workers: 4,
            recognition_timeout_secs: 900,
            render_timeout_secs: 300,
            merge_timeout_secs: 300,
            tools: ToolCommands::default(),
            pdfium_lib_path: None,
            progress_callback: None,
        }
    }
}

impl fmt::Debug for PipelineConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PipelineConfig")
            .field("work_dir", &self.work_dir)
            .field("soundfont", &self.soundfont)
            .field("dpi", &self.dpi)
            .field("max_page_pixels", &self.max_page_pixels)
            .field("recognition_workers", &self.recognition_workers)
            .field("render_workers", &self.render_workers)
            .field("recognition_timeout_secs", &self.recognition_timeout_secs)
            .field("render_timeout_secs", &self.render_timeout_secs)
            .field("merge_timeout_secs", &self.merge_timeout_secs)
            .field("tools", &self.tools)
            .field("pdfium_lib_path", &self.pdfium_lib_path)
            .field(
                "progress_callback",
                &self.progress_callback.as_ref().map(|_| "<dyn ConversionProgressCallback>"),
            )
            .finish()
    }
}

impl PipelineConfig {
    /// Create a new builder for `PipelineConfig`.
    pub fn builder() -> PipelineConfigBuilder {
        PipelineConfigBuilder {
            config: Self::default(),
        }
    }

    pub fn recognition_timeout(&self) -> Duration {
        Duration::from_secs(self.recognition_timeout_secs)
    }

    pub fn render_timeout(&self) -> Duration {
        Duration::from_secs(self.render_timeout_secs)
    }

    pub fn merge_timeout(&self) -> Duration {
        Duration::from_secs(self.merge_timeout_secs)
    }
}

fn default_workers() -> usize {
    std::thread::available_parallelism()
        .map(|n| n.get())
        .unwrap_or(4)
}

/// Builder for [`PipelineConfig`].
#[derive(Debug)]
pub struct PipelineConfigBuilder {
    config: PipelineConfig,
}

impl PipelineConfigBuilder {
    pub fn work_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.config.work_dir = dir.into();
        self
    }

    pub fn soundfont(mut self, path: impl Into<PathBuf>) -> Self {
        self.config.soundfont = path.into();
        self
    }

    pub fn dpi(mut self, dpi: u32) -> Self {
        self.config.dpi = dpi.clamp(72, 600);
        self
    }

    pub fn max_page_pixels(mut self, px: u32) -> Self {
        self.config.max_page_pixels = px.max(500);
        self
    }

    pub fn recognition_workers(mut self, n: usize) -> Self {
        self.config.recognition_workers = n.max(1);
        self
    }

    pub fn render_workers(mut self, n: usize) -> Self {
        self.config.render_workers = n.max(1);
        self
    }

    pub fn recognition_timeout_secs(mut self, secs: u64) -> Self {
        self.config.recognition_timeout_secs = secs;
        self
    }

    pub fn render_timeout_secs(mut self, secs: u64) -> Self {
        self.config.render_timeout_secs = secs;
        self
    }

    pub fn merge_timeout_secs(mut self, secs: u64) -> Self {
        self.config.merge_timeout_secs = secs;
        self
    }

    pub fn tools(mut self, tools: ToolCommands) -> Self {
        self.config.tools = tools;
        self
    }

    pub fn pdfium_lib_path(mut self, dir: impl Into<PathBuf>) -> Self {
        self.config.pdfium_lib_path = Some(dir.into());
        self
    }

    pub fn progress_callback(mut self, cb: ProgressCallback) -> Self {
        self.config.progress_callback = Some(cb);
        self
    }

    /// Build the configuration, validating constraints.
    pub fn build(self) -> Result<PipelineConfig, ConversionError> {
        let c = &self.config;
        if c.soundfont.as_os_str().is_empty() {
            return Err(ConversionError::InvalidConfig(
                "a soundfont (.sf2) path is required".into(),
            ));
        }
        if is_unsafe_work_dir(&c.work_dir) {
            return Err(ConversionError::InvalidConfig(format!(
                "refusing to use '{}' as a working directory: it is wiped on every run",
                c.work_dir.display()
            )));
        }
        if c.recognition_workers == 0 || c.render_workers == 0 {
            return Err(ConversionError::InvalidConfig(
                "worker counts must be ≥ 1".into(),
            ));
        }
        for (what, secs) in [
            ("recognition", c.recognition_timeout_secs),
            ("render", c.render_timeout_secs),
            ("merge", c.merge_timeout_secs),
        ] {
            if secs == 0 {
                return Err(ConversionError::InvalidConfig(format!(
                    "{what} timeout must be ≥ 1 second"
                )));
            }
        }
        Ok(self.config)
    }
}

/// The working directory is deleted recursively on every run; never accept a
/// filesystem root or the current directory itself.
fn is_unsafe_work_dir(dir: &Path) -> bool {
    let s = dir.as_os_str();
    s.is_empty() || dir.parent().is_none() || dir == Path::new(".") || dir == Path::new("..")
}

// ── External tools ───────────────────────────────────────────────────────

/// Program plus fixed leading arguments.
///
/// Per-call arguments are appended after `args`, which lets a backend be a
/// module invocation (`python3 -m homr.main`) or a wrapper script.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CommandSpec {
    pub program: String,
    #[serde(default)]
    pub args: Vec<String>,
}

impl CommandSpec {
    pub fn new(program: impl Into<String>) -> Self {
        Self {
            program: program.into(),
            args: Vec::new(),
        }
    }

    pub fn with_args<I, S>(mut self, args: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.args = args.into_iter().map(Into::into).collect();
        self
    }

    /// Parse a whitespace-separated command line such as `"python3 -m homr.main"`.
    pub fn parse(line: &str) -> Option<Self> {
        let mut parts = line.split_whitespace();
        let program = parts.next()?;
        Some(Self::new(program).with_args(parts))
    }
}

/// Command lines for every external program the pipeline runs.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ToolCommands {
    pub oemer: CommandSpec,
    pub homr: CommandSpec,
    pub audiveris: CommandSpec,
    pub fluidsynth: CommandSpec,
    pub ffmpeg: CommandSpec,
}

impl Default for ToolCommands {
    fn default() -> Self {
        Self {
            oemer: CommandSpec::new("oemer"),
            homr: CommandSpec::new("python3").with_args(["-m", "homr.main"]),
            audiveris: CommandSpec::new("audiveris"),
            fluidsynth: CommandSpec::new("fluidsynth"),
            ffmpeg: CommandSpec::new("ffmpeg"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn build_requires_soundfont() {
        let err = PipelineConfig::builder().build().unwrap_err();
        assert!(err.to_string().contains("soundfont"), "got: {err}");
    }

    #[test]
    fn builder_clamps() {
        let c = PipelineConfig::builder()
            .soundfont("piano.sf2")
            .dpi(10)
            .recognition_workers(0)
            .render_workers(0)
            .build()
            .unwrap();
        assert_eq!(c.dpi, 72);
        assert_eq!(c.recognition_workers, 1);
        assert_eq!(c.render_workers, 1);
    }

    #[test]
    fn rejects_root_work_dir() {
        for dir in ["/", ".", ""] {
            let res = PipelineConfig::builder()
                .soundfont("piano.sf2")
                .work_dir(dir)
                .build();
            assert!(res.is_err(), "{dir:?} should be rejected");
        }
    }

    #[test]
    fn rejects_zero_timeout() {
        let res = PipelineConfig::builder()
            .soundfont("piano.sf2")
            .render_timeout_secs(0)
            .build();
        assert!(res.is_err());
    }

    #[test]
    fn command_spec_parse() {
        let spec = CommandSpec::parse("python3 -m homr.main").unwrap();
        assert_eq!(spec.program, "python3");
        assert_eq!(spec.args, vec!["-m", "homr.main"]);
        assert!(CommandSpec::parse("   ").is_none());
    }

    #[test]
    fn default_tools() {
        let t = ToolCommands::default();
        assert_eq!(t.homr.args, vec!["-m", "homr.main"]);
        assert_eq!(t.ffmpeg.program, "ffmpeg");
    }
}
