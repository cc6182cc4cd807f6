//! Track merging: concatenate page tracks, in page order, into one file.
//!
//! Uses ffmpeg's concat demuxer with stream copy, so tracks are joined
//! without re-encoding. The manifest is a temporary file next to the output
//! and is removed whether or not the merge succeeds.

use crate::config::CommandSpec;
use crate::error::ConversionError;
use crate::pipeline::process::ExternalCommand;
use crate::pipeline::render::{remove_partial, RenderedTrack};
use std::path::{Path, PathBuf};
use std::time::Duration;
use tracing::{debug, info};

/// One concat-demuxer line: `file '<path>'`, with `'` escaped as `'\''`.
pub fn manifest_line(path: &Path) -> String {
    let quoted = path.to_string_lossy().replace('\'', r"'\''");
    format!("file '{quoted}'")
}

/// `ffmpeg -y -f concat -safe 0 -i <manifest> -c copy <output>`
pub fn concat_command(ffmpeg: &CommandSpec, manifest: &Path, output: &Path) -> ExternalCommand {
    ExternalCommand::from_spec(ffmpeg)
        .arg("-hide_banner")
        .arg("-loglevel")
        .arg("error")
        .arg("-y")
        .arg("-f")
        .arg("concat")
        .arg("-safe")
        .arg("0")
        .arg("-i")
        .arg(manifest)
        .arg("-c")
        .arg("copy")
        .arg(output)
}

/// Concatenate `tracks` in ascending page order into `output`.
pub async fn merge_tracks(
    tracks: &[RenderedTrack],
    output: &Path,
    ffmpeg: &CommandSpec,
    timeout: Duration,
) -> Result<PathBuf, ConversionError> {
    let fail = |detail: String| ConversionError::MergeFailed {
        tracks: tracks.len(),
        detail,
    };
    if tracks.is_empty() {
        return Err(fail("no tracks to merge".into()));
    }

    let mut ordered: Vec<&RenderedTrack> = tracks.iter().collect();
    ordered.sort_by_key(|t| t.index);

    // The demuxer resolves relative entries against the manifest, not our cwd.
    let mut body = String::new();
    for track in &ordered {
        let abs = tokio::fs::canonicalize(&track.path)
            .await
            .map_err(|e| fail(format!("track {} unavailable: {e}", track.path.display())))?;
        body.push_str(&manifest_line(&abs));
        body.push('\n');
    }

    let dir = match output.parent() {
        Some(p) if !p.as_os_str().is_empty() => p.to_path_buf(),
        _ => PathBuf::from("."),
    };
    let manifest = tempfile::Builder::new()
        .prefix("concat.")
        .suffix(".txt")
        .tempfile_in(&dir)
        .map_err(|e| fail(format!("cannot create manifest in {}: {e}", dir.display())))?
        .into_temp_path();
    tokio::fs::write(&manifest, body)
        .await
        .map_err(|e| fail(format!("cannot write manifest: {e}")))?;
    debug!("Concat manifest {} ({} entries)", manifest.display(), ordered.len());

    if let Err(e) = concat_command(ffmpeg, &manifest, output)
        .run_expecting(timeout, output)
        .await
    {
        remove_partial(output).await;
        return Err(fail(e.to_string()));
    }

    info!("Merged {} track(s) → {}", ordered.len(), output.display());
    Ok(output.to_path_buf())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::pipeline::workdir::PageIndex;

    #[test]
    fn manifest_line_escapes_quotes() {
        assert_eq!(
            manifest_line(Path::new("/w/scores/page_0001.mp3")),
            "file '/w/scores/page_0001.mp3'"
        );
        assert_eq!(
            manifest_line(Path::new("/w/bach's/page_0001.mp3")),
            r"file '/w/bach'\''s/page_0001.mp3'"
        );
    }

    #[test]
    fn concat_uses_stream_copy() {
        let cmd = concat_command(
            &CommandSpec::new("ffmpeg"),
            Path::new("list.txt"),
            Path::new("out.mp3"),
        );
        let args: Vec<String> = cmd.args().iter().map(|a| a.to_string_lossy().into_owned()).collect();
        let joined = args.join(" ");
        assert!(joined.contains("-f concat -safe 0 -i list.txt -c copy out.mp3"), "{joined}");
    }

    #[cfg(unix)]
    mod with_fake_ffmpeg {
        use super::*;

        /// Appends every `file '…'` entry of the manifest to the output.
        const FAKE_CONCAT: &str = r#"
prev=""; for a; do [ "$prev" = "-i" ] && list=$a; prev=$a; out=$a; done
: > "$out"
sed -n "s/^file '\(.*\)'\$/\1/p" "$list" | while IFS= read -r f; do cat "$f" >> "$out"; done
"#;

        fn ffmpeg(script: &str) -> CommandSpec {
            CommandSpec::new("sh").with_args(["-c", script, "ffmpeg"])
        }

        fn track(dir: &Path, n: usize, body: &str) -> RenderedTrack {
            let index = PageIndex::new(n);
            let path = index.artifact(dir, "mp3");
            std::fs::write(&path, body).unwrap();
            RenderedTrack { index, path }
        }

        #[tokio::test]
        async fn concatenates_in_page_order() {
            let tmp = tempfile::tempdir().unwrap();
            let tracks = vec![
                track(tmp.path(), 3, "three"),
                track(tmp.path(), 1, "one"),
                track(tmp.path(), 2, "two"),
            ];
            let out = tmp.path().join("score_merged.mp3");
            merge_tracks(&tracks, &out, &ffmpeg(FAKE_CONCAT), Duration::from_secs(10))
                .await
                .unwrap();
            assert_eq!(std::fs::read_to_string(&out).unwrap(), "onetwothree");

            let leftovers: Vec<_> = std::fs::read_dir(tmp.path())
                .unwrap()
                .filter_map(|e| e.ok())
                .filter(|e| e.path().extension().is_some_and(|x| x == "txt"))
                .collect();
            assert!(leftovers.is_empty(), "manifest not removed");
        }

        #[tokio::test]
        async fn failed_merge_removes_partial_output() {
            let tmp = tempfile::tempdir().unwrap();
            let tracks = vec![track(tmp.path(), 1, "one")];
            let out = tmp.path().join("score_merged.mp3");
            let script = r#"for a; do out=$a; done; printf 'half' > "$out"; exit 1"#;
            let err = merge_tracks(&tracks, &out, &ffmpeg(script), Duration::from_secs(10))
                .await
                .unwrap_err();
            assert!(matches!(err, ConversionError::MergeFailed { tracks: 1, .. }));
            assert!(!out.exists());
        }

        #[tokio::test]
        async fn nothing_to_merge() {
            let tmp = tempfile::tempdir().unwrap();
            let out = tmp.path().join("x.mp3");
            let err = merge_tracks(&[], &out, &ffmpeg(FAKE_CONCAT), Duration::from_secs(1))
                .await
                .unwrap_err();
            assert!(matches!(err, ConversionError::MergeFailed { tracks: 0, .. }));
        }
    }
}
