//! CLI binary for score2audio.
//!
//! A thin shim over the library crate that maps CLI flags to
//! `PipelineConfig` + `ConversionRequest` and prints results.

use anyhow::{bail, Context, Result};
use clap::Parser;
use score2audio::{
    convert, convert_to_file, inspect, Backend, CommandSpec, ConversionProgressCallback,
    ConversionRequest, PageError, PageStage, PageState, PipelineConfig, ProgressCallback,
    ToolCommands,
};
use indicatif::{ProgressBar, ProgressStyle};
use std::collections::HashMap;
use std::io;
use std::path::PathBuf;
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};
use tracing_subscriber::EnvFilter;

// ── ANSI colour helpers (no extra deps) ──────────────────────────────────────

fn green(s: &str) -> String {
    format!("\x1b[32m{s}\x1b[0m")
}
fn red(s: &str) -> String {
    format!("\x1b[31m{s}\x1b[0m")
}
fn dim(s: &str) -> String {
    format!("\x1b[2m{s}\x1b[0m")
}
fn bold(s: &str) -> String {
    format!("\x1b[1m{s}\x1b[0m")
}
fn cyan(s: &str) -> String {
    format!("\x1b[36m{s}\x1b[0m")
}

const TICKS: &[&str] = &["⠋", "⠙", "⠹", "⠸", "⠼", "⠴", "⠦", "⠧", "⠇", "⠏", "⠿"];

// ── CLI progress callback using indicatif ────────────────────────────────────

/// Terminal progress: one bar over pages, advanced when a page either
/// finishes rendering or is dropped. Pages finish out of order.
struct CliProgressCallback {
    bar: ProgressBar,
    /// First time each page was seen, for elapsed reporting.
    start_times: Mutex<HashMap<usize, Instant>>,
}

impl CliProgressCallback {
    fn new_dynamic() -> Arc<Self> {
        let bar = ProgressBar::new(0);
        let spinner_style = ProgressStyle::with_template("{spinner:.cyan} {prefix:.bold}  {msg}")
            .unwrap_or_else(|_| ProgressStyle::default_spinner())
            .tick_strings(TICKS);
        bar.set_style(spinner_style);
        bar.set_prefix("Preparing");
        bar.set_message("Splitting document into pages…");
        bar.enable_steady_tick(Duration::from_millis(80));

        Arc::new(Self {
            bar,
            start_times: Mutex::new(HashMap::new()),
        })
    }

    fn activate_bar(&self, total: usize) {
        let style = ProgressStyle::with_template(
            "{spinner:.cyan} {prefix:.bold}  \
             [{bar:42.green/238}] {pos:>3}/{len} pages  \
             ⏱ {elapsed_precise}  {msg}",
        )
        .unwrap_or_else(|_| ProgressStyle::default_bar())
        .progress_chars("█▉▊▋▌▍▎▏  ")
        .tick_strings(TICKS);

        self.bar.set_length(total as u64);
        self.bar.set_style(style);
        self.bar.set_prefix("Converting");
        self.bar.reset_eta();
    }

    fn elapsed(&self, page: usize) -> String {
        let secs = self
            .start_times
            .lock()
            .ok()
            .and_then(|t| t.get(&page).map(|s| s.elapsed().as_secs_f64()))
            .unwrap_or(0.0);
        dim(&format!("{secs:.1}s"))
    }
}

impl ConversionProgressCallback for CliProgressCallback {
    fn on_conversion_start(&self, total_pages: usize) {
        self.activate_bar(total_pages);
        self.bar.println(format!(
            "{} {}",
            cyan("◆"),
            bold(&format!("Converting {total_pages} page(s)…"))
        ));
    }

    fn on_page_stage(&self, page: usize, stage: PageStage) {
        match stage {
            PageStage::Extracted => {
                if let Ok(mut t) = self.start_times.lock() {
                    t.insert(page, Instant::now());
                }
            }
            PageStage::Recognized => self.bar.set_message(format!("page {page} recognised")),
            PageStage::Sanitized => {}
            PageStage::Rendered => {
                self.bar.println(format!(
                    "  {} Page {:>3}  rendered  {}",
                    green("✓"),
                    page,
                    self.elapsed(page)
                ));
                self.bar.inc(1);
            }
            PageStage::Merged => {}
        }
    }

    fn on_page_dropped(&self, page: usize, stage: PageStage, error: &PageError) {
        let text = error.to_string();
        let msg = match text.char_indices().nth(100) {
            Some((cut, _)) => format!("{}…", &text[..cut]),
            None => text,
        };
        self.bar.println(format!(
            "  {} Page {:>3}  dropped at {:?}: {}  {}",
            red("✗"),
            page,
            stage,
            red(&msg),
            self.elapsed(page)
        ));
        self.bar.inc(1);
    }

    fn on_conversion_complete(&self, total_pages: usize, merged_pages: usize) {
        self.bar.finish_and_clear();
        let dropped = total_pages.saturating_sub(merged_pages);
        if dropped == 0 {
            eprintln!(
                "{} {} page(s) merged",
                green("✔"),
                bold(&merged_pages.to_string())
            );
        } else {
            eprintln!(
                "{} {}/{} page(s) merged  ({} dropped)",
                if merged_pages == 0 { red("✘") } else { cyan("⚠") },
                bold(&merged_pages.to_string()),
                total_pages,
                red(&dropped.to_string()),
            );
        }
    }
}

const AFTER_HELP: &str = r#"EXAMPLES:
  # Default engine (oemer), 120 BPM
  score2audio --soundfont FluidR3_GM.sf2 sonata.pdf

  # Faster, sequential engine; slower tempo, down a tone
  score2audio --backend homr --tempo 80 --transpose -2 --soundfont piano.sf2 etude.png

  # Copy the merged track somewhere else
  score2audio --backend audiveris --soundfont piano.sf2 score.pdf -o ~/Music/score.mp3

  # Machine-readable result with per-page outcomes
  score2audio --json --soundfont piano.sf2 score.pdf > result.json

  # What each engine trades off
  score2audio --backend-info --json

  # Page count only, no engines needed
  score2audio --inspect-only score.pdf

EXTERNAL TOOLS:
  oemer, homr (python3 -m homr.main), audiveris   optical music recognition
  fluidsynth                                       MIDI → WAV
  ffmpeg                                           WAV → MP3, concatenation
  libpdfium                                        PDF rasterisation

  Override any command line with --<tool>-cmd or SCORE2AUDIO_<TOOL>_CMD,
  e.g. SCORE2AUDIO_OEMER_CMD="/opt/venv/bin/oemer".

ENVIRONMENT VARIABLES:
  RUST_LOG                 tracing filter (overrides -v / -q)
  SCORE2AUDIO_*            every flag below has an env equivalent
"#;

/// Convert scanned sheet music into a playable MP3.
#[derive(Parser, Debug)]
#[command(
    name = "score2audio",
    version,
    about = "Convert scanned sheet music (PDF or image) into a playable MP3",
    long_about = "Recognise each page of a score with an optical music recognition engine, \
render the recognised music through a SoundFont synthesiser, and merge the pages into one \
audio track. Pages that fail are dropped and reported; the run fails only when none survive.",
    arg_required_else_help = true,
    color = clap::ColorChoice::Auto,
    after_long_help = AFTER_HELP
)]
struct Cli {
    /// Score to convert: a PDF, or a PNG/JPEG photo or scan.
    #[arg(required_unless_present = "backend_info")]
    input: Option<PathBuf>,

    /// OMR engine: oemer, homr, audiveris.
    #[arg(short, long, env = "SCORE2AUDIO_BACKEND", default_value = "oemer",
          value_parser = parse_backend)]
    backend: Backend,

    /// Playback tempo in BPM (40–240).
    #[arg(long, env = "SCORE2AUDIO_TEMPO", default_value_t = 120,
          value_parser = clap::value_parser!(u32).range(40..=240))]
    tempo: u32,

    /// Transposition in semitones (−12..12).
    #[arg(long, env = "SCORE2AUDIO_TRANSPOSE", default_value_t = 0, allow_hyphen_values = true,
          value_parser = clap::value_parser!(i8).range(-12..=12))]
    transpose: i8,

    /// SoundFont (.sf2) used for synthesis.
    #[arg(long, env = "SCORE2AUDIO_SOUNDFONT")]
    soundfont: Option<PathBuf>,

    /// Copy the merged MP3 to this path.
    #[arg(short, long, env = "SCORE2AUDIO_OUTPUT")]
    output: Option<PathBuf>,

    /// Working directory; wiped at the start of every run.
    #[arg(long, env = "SCORE2AUDIO_WORK_DIR", default_value = "output")]
    work_dir: PathBuf,

    /// PDF rasterisation DPI (72–600).
    #[arg(long, env = "SCORE2AUDIO_DPI", default_value_t = 300,
          value_parser = clap::value_parser!(u32).range(72..=600))]
    dpi: u32,

    /// Concurrent recognitions for engines that allow it. Default: CPU count.
    #[arg(short = 'j', long, env = "SCORE2AUDIO_WORKERS")]
    workers: Option<usize>,

    /// Concurrent sanitise + synthesise + encode tasks.
    #[arg(long, env = "SCORE2AUDIO_RENDER_WORKERS", default_value_t = 4)]
    render_workers: usize,

    /// Per-page recognition timeout in seconds.
    #[arg(long, env = "SCORE2AUDIO_RECOGNITION_TIMEOUT", default_value_t = 900)]
    recognition_timeout: u64,

    /// Per-call synthesis / encoding timeout in seconds.
    #[arg(long, env = "SCORE2AUDIO_RENDER_TIMEOUT", default_value_t = 300)]
    render_timeout: u64,

    /// Merge timeout in seconds.
    #[arg(long, env = "SCORE2AUDIO_MERGE_TIMEOUT", default_value_t = 300)]
    merge_timeout: u64,

    /// Directory containing the pdfium shared library.
    #[arg(long, env = "SCORE2AUDIO_PDFIUM_LIB_PATH")]
    pdfium_lib_path: Option<PathBuf>,

    /// Command line for oemer.
    #[arg(long, env = "SCORE2AUDIO_OEMER_CMD")]
    oemer_cmd: Option<String>,

    /// Command line for homr.
    #[arg(long, env = "SCORE2AUDIO_HOMR_CMD")]
    homr_cmd: Option<String>,

    /// Command line for Audiveris.
    #[arg(long, env = "SCORE2AUDIO_AUDIVERIS_CMD")]
    audiveris_cmd: Option<String>,

    /// Command line for fluidsynth.
    #[arg(long, env = "SCORE2AUDIO_FLUIDSYNTH_CMD")]
    fluidsynth_cmd: Option<String>,

    /// Command line for ffmpeg.
    #[arg(long, env = "SCORE2AUDIO_FFMPEG_CMD")]
    ffmpeg_cmd: Option<String>,

    /// Print the result as JSON instead of a summary.
    #[arg(long, env = "SCORE2AUDIO_JSON")]
    json: bool,

    /// With --json, include the merged MP3 as base64.
    #[arg(long, requires = "json")]
    embed_audio: bool,

    /// Print what each engine trades off and exit.
    #[arg(long)]
    backend_info: bool,

    /// Print document format and page count only.
    #[arg(long)]
    inspect_only: bool,

    /// Disable the progress bar.
    #[arg(long, env = "SCORE2AUDIO_NO_PROGRESS")]
    no_progress: bool,

    /// Enable DEBUG-level tracing logs.
    #[arg(short, long, env = "SCORE2AUDIO_VERBOSE")]
    verbose: bool,

    /// Suppress all output except errors.
    #[arg(short, long, env = "SCORE2AUDIO_QUIET")]
    quiet: bool,
}

fn parse_backend(s: &str) -> Result<Backend, String> {
    s.parse()
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    // ── Logging setup ────────────────────────────────────────────────────
    // The progress bar covers INFO-level feedback; keep the log quiet under it.
    let show_progress = !cli.quiet && !cli.no_progress && !cli.json;
    let filter = if cli.verbose {
        "debug"
    } else if cli.quiet || show_progress {
        "error"
    } else {
        "info"
    };
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(filter)),
        )
        .with_writer(io::stderr)
        .init();

    // ── Backend info ─────────────────────────────────────────────────────
    if cli.backend_info {
        print_backend_info(&cli)?;
        return Ok(());
    }

    let input = cli
        .input
        .clone()
        .context("an input document is required")?;

    // ── Inspect-only mode ────────────────────────────────────────────────
    if cli.inspect_only {
        let doc = inspect(&input, cli.pdfium_lib_path.as_deref())
            .await
            .context("Failed to inspect document")?;
        if cli.json {
            println!(
                "{}",
                serde_json::to_string_pretty(&doc).context("Failed to serialise document info")?
            );
        } else {
            println!("File:    {}", doc.path.display());
            println!("Format:  {:?}", doc.format);
            println!("Pages:   {}", doc.page_count);
        }
        return Ok(());
    }

    // ── Build config ─────────────────────────────────────────────────────
    let progress_cb: Option<ProgressCallback> = if show_progress {
        let cb = CliProgressCallback::new_dynamic();
        Some(cb as Arc<dyn ConversionProgressCallback>)
    } else {
        None
    };
    let config = build_config(&cli, progress_cb)?;
    let request = ConversionRequest::new(&input, cli.backend, cli.tempo, cli.transpose)
        .context("Invalid request")?;

    // ── Run conversion ───────────────────────────────────────────────────
    // Engines run in their own process groups, so Ctrl-C from the terminal
    // does not reach them; dropping the conversion kills them instead.
    let conversion = async {
        match cli.output {
            Some(ref output_path) => convert_to_file(&request, output_path, &config).await,
            None => convert(&request, &config).await,
        }
    };
    let result = tokio::select! {
        result = conversion => result.context("Conversion failed")?,
        _ = tokio::signal::ctrl_c() => bail!("Interrupted"),
    };

    if cli.json {
        let response = result
            .to_response(cli.embed_audio)
            .await
            .context("Failed to read merged track")?;
        println!(
            "{}",
            serde_json::to_string_pretty(&response).context("Failed to serialise result")?
        );
        return Ok(());
    }

    if !cli.quiet {
        let stats = &result.stats;
        eprintln!(
            "{}  {}/{} pages  {}ms  →  {}",
            if stats.dropped_pages() == 0 {
                green("✔")
            } else {
                cyan("⚠")
            },
            stats.merged_pages,
            stats.total_pages,
            stats.total_duration_ms,
            bold(&result.output_path.display().to_string()),
        );
        eprintln!(
            "   {}",
            dim(&format!(
                "{} · {} bpm · transpose {:+} · {}",
                result.backend,
                request.tempo_bpm(),
                request.transpose(),
                result.info.header_meta()
            ))
        );
        for report in stats.pages.iter().filter(|p| !p.is_merged()) {
            if let PageState::Dropped { stage, error } = &report.state {
                eprintln!("   {} page {} ({:?}): {}", red("✗"), report.page, stage, error);
            }
        }
    }
    println!("{}", result.output_path.display());

    Ok(())
}

/// Map CLI args to `PipelineConfig`.
fn build_config(cli: &Cli, progress: Option<ProgressCallback>) -> Result<PipelineConfig> {
    let Some(soundfont) = cli.soundfont.clone() else {
        bail!("--soundfont (or SCORE2AUDIO_SOUNDFONT) is required for conversion");
    };
    if !soundfont.is_file() {
        bail!("soundfont '{}' does not exist", soundfont.display());
    }

    let mut tools = ToolCommands::default();
    for (slot, flag, value) in [
        (&mut tools.oemer, "--oemer-cmd", &cli.oemer_cmd),
        (&mut tools.homr, "--homr-cmd", &cli.homr_cmd),
        (&mut tools.audiveris, "--audiveris-cmd", &cli.audiveris_cmd),
        (&mut tools.fluidsynth, "--fluidsynth-cmd", &cli.fluidsynth_cmd),
        (&mut tools.ffmpeg, "--ffmpeg-cmd", &cli.ffmpeg_cmd),
    ] {
        if let Some(line) = value {
            *slot = CommandSpec::parse(line).with_context(|| format!("{flag} is empty"))?;
        }
    }

    let mut builder = PipelineConfig::builder()
        .work_dir(&cli.work_dir)
        .soundfont(soundfont)
        .dpi(cli.dpi)
        .render_workers(cli.render_workers)
        .recognition_timeout_secs(cli.recognition_timeout)
        .render_timeout_secs(cli.render_timeout)
        .merge_timeout_secs(cli.merge_timeout)
        .tools(tools);
    if let Some(n) = cli.workers {
        builder = builder.recognition_workers(n);
    }
    if let Some(ref dir) = cli.pdfium_lib_path {
        builder = builder.pdfium_lib_path(dir);
    }
    if let Some(cb) = progress {
        builder = builder.progress_callback(cb);
    }
    builder.build().context("Invalid configuration")
}

fn print_backend_info(cli: &Cli) -> Result<()> {
    if cli.json {
        let all: Vec<_> = Backend::ALL
            .iter()
            .map(|b| serde_json::json!({ "backend": b, "info": b.info() }))
            .collect();
        println!(
            "{}",
            serde_json::to_string_pretty(&all).context("Failed to serialise backend info")?
        );
        return Ok(());
    }
    for backend in Backend::ALL {
        let info = backend.info();
        println!(
            "{}  {}",
            bold(backend.name()),
            dim(&format!("{:?} recognition", backend.concurrency()))
        );
        println!("  {}", info.note);
        println!("  time: {}   accuracy: {}", info.processing_time, info.accuracy);
        for pro in info.pros {
            println!("  {} {}", green("+"), pro);
        }
        for con in info.cons {
            println!("  {} {}", red("-"), con);
        }
        println!();
    }
    Ok(())
}
