//! Score sanitisation: turn raw OMR output into something safe to play.
//!
//! OMR engines routinely emit scores with absurd note lengths (a misread
//! rhythm dot becomes a 4000-quarter whole note), long silent lead-ins and
//! tails, or a page worth of music strung out over an hour. A synthesiser
//! will happily render all of that. The steps below run in a fixed order
//! and each one assumes the ones before it have run:
//!
//! 1. replace every tempo mark with the requested tempo
//! 2. transpose (notes leaving the MIDI range are dropped)
//! 3. flatten all parts into one timeline ordered by onset
//! 4. find the first and last note onsets; no notes means an empty page
//! 5. clamp implausibly long durations
//! 6. trim to `[first, last + TRIM_PADDING]` and shift to start at zero
//! 7. reject scores still longer than [`ABSOLUTE_CEILING`]
//! 8. window anything longer than [`HARD_CEILING`] down to it
//!
//! On success `0 < highest_time <= HARD_CEILING`.

use crate::pipeline::score::{self, NoteEvent, Score, ScoreError};
use crate::pipeline::workdir::PageIndex;
use std::path::Path;
use thiserror::Error;
use tracing::debug;

/// Durations above this many quarters are treated as recognition errors.
pub const CLAMP_THRESHOLD: f64 = 100.0;
/// Replacement duration for clamped notes.
pub const CLAMPED_DURATION: f64 = 1.0;
/// Quarters kept after the last note onset.
pub const TRIM_PADDING: f64 = 10.0;
/// Maximum length of a sanitised score, in quarters.
pub const HARD_CEILING: f64 = 600.0;
/// Trimmed scores longer than this are dropped rather than windowed.
pub const ABSOLUTE_CEILING: f64 = 1000.0;

#[derive(Debug, Error)]
pub enum SanitizeError {
    #[error(transparent)]
    Score(#[from] ScoreError),
    #[error("score contains no playable notes")]
    Empty,
    #[error("score spans {duration:.1} quarters after trimming (limit {limit})")]
    TooLong { duration: f64, limit: f64 },
}

/// Per-request sanitiser settings.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct SanitizeOptions {
    pub tempo_bpm: u32,
    pub transpose: i8,
}

/// A flattened, bounded, playable page.
#[derive(Debug, Clone, PartialEq)]
pub struct SanitizedScore {
    pub index: PageIndex,
    pub tempo_bpm: u32,
    /// Sorted by onset, then pitch. Every pitch is within 0–127.
    pub notes: Vec<NoteEvent>,
    pub highest_time: f64,
}

/// Counters describing what the sanitiser changed; logged per page.
#[derive(Debug, Clone, Copy, Default, PartialEq)]
pub struct SanitizeReport {
    pub out_of_range: usize,
    pub clamped: usize,
    pub trimmed: usize,
    pub windowed: usize,
}

/// Parse a MusicXML file and sanitise it.
pub fn load_and_sanitize(
    path: &Path,
    index: PageIndex,
    options: SanitizeOptions,
) -> Result<SanitizedScore, SanitizeError> {
    let score = score::load_musicxml(path)?;
    sanitize(score, index, options)
}

/// Run the full sanitisation sequence on a parsed score.
pub fn sanitize(
    mut score: Score,
    index: PageIndex,
    options: SanitizeOptions,
) -> Result<SanitizedScore, SanitizeError> {
    let mut report = SanitizeReport::default();

    set_tempo(&mut score, options.tempo_bpm);
    report.out_of_range = transpose(&mut score, options.transpose);
    let mut notes = flatten(score);

    let (first, last) = onset_bounds(&notes).ok_or(SanitizeError::Empty)?;
    report.clamped = clamp_durations(&mut notes);
    report.trimmed = trim(&mut notes, first, last + TRIM_PADDING);

    let trimmed_len = score::highest_time(notes.iter());
    if trimmed_len > ABSOLUTE_CEILING {
        return Err(SanitizeError::TooLong {
            duration: trimmed_len,
            limit: ABSOLUTE_CEILING,
        });
    }
    if trimmed_len > HARD_CEILING {
        report.windowed = window(&mut notes, HARD_CEILING);
    }

    let highest_time = score::highest_time(notes.iter());
    if notes.is_empty() || highest_time <= 0.0 {
        return Err(SanitizeError::Empty);
    }

    debug!(
        "Page {}: {} notes, {:.1} quarters at {} bpm ({:?})",
        index,
        notes.len(),
        highest_time,
        options.tempo_bpm,
        report
    );

    Ok(SanitizedScore {
        index,
        tempo_bpm: options.tempo_bpm,
        notes,
        highest_time,
    })
}

// ── Steps ─────────────────────────────────────────────────────────────────

/// Drop every tempo mark and insert a single one at offset zero.
pub fn set_tempo(score: &mut Score, bpm: u32) {
    score.tempos.clear();
    score.tempos.push(score::TempoMark {
        offset: 0.0,
        bpm: f64::from(bpm),
    });
}

/// Shift every pitch by `semitones`. Returns how many notes were dropped
/// for leaving the MIDI key range.
pub fn transpose(score: &mut Score, semitones: i8) -> usize {
    if semitones == 0 {
        return 0;
    }
    let mut dropped = 0;
    for part in &mut score.parts {
        let before = part.notes.len();
        part.notes.retain_mut(|n| {
            n.pitch += i16::from(semitones);
            (0..=127).contains(&n.pitch)
        });
        dropped += before - part.notes.len();
    }
    dropped
}

/// Merge all parts into one timeline, ordered by onset then pitch.
pub fn flatten(score: Score) -> Vec<NoteEvent> {
    let mut notes: Vec<NoteEvent> = score.parts.into_iter().flat_map(|p| p.notes).collect();
    notes.sort_by(|a, b| a.onset.total_cmp(&b.onset).then(a.pitch.cmp(&b.pitch)));
    notes
}

/// Earliest and latest note onsets.
pub fn onset_bounds(notes: &[NoteEvent]) -> Option<(f64, f64)> {
    let first = notes.first()?.onset;
    let last = notes.iter().map(|n| n.onset).fold(first, f64::max);
    Some((first, last))
}

/// Replace durations above [`CLAMP_THRESHOLD`] with [`CLAMPED_DURATION`].
pub fn clamp_durations(notes: &mut [NoteEvent]) -> usize {
    let mut clamped = 0;
    for n in notes.iter_mut().filter(|n| n.duration > CLAMP_THRESHOLD) {
        n.duration = CLAMPED_DURATION;
        clamped += 1;
    }
    clamped
}

/// Keep notes with onset in `[start, end]`, re-based so `start` becomes 0.
pub fn trim(notes: &mut Vec<NoteEvent>, start: f64, end: f64) -> usize {
    let before = notes.len();
    notes.retain(|n| n.onset >= start && n.onset <= end);
    for n in notes.iter_mut() {
        n.onset -= start;
    }
    before - notes.len()
}

/// Keep notes starting before `ceiling`, cutting any that ring past it.
pub fn window(notes: &mut Vec<NoteEvent>, ceiling: f64) -> usize {
    let before = notes.len();
    notes.retain(|n| n.onset < ceiling);
    for n in notes.iter_mut() {
        n.duration = n.duration.min(ceiling - n.onset);
    }
    before - notes.len()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::pipeline::score::{tests::partwise, Part, TempoMark};

    fn ev(onset: f64, duration: f64, pitch: i16) -> NoteEvent {
        NoteEvent {
            onset,
            duration,
            pitch,
            velocity: 80,
            voice: 1,
        }
    }

    fn one_part(notes: Vec<NoteEvent>) -> Score {
        Score {
            parts: vec![Part {
                id: "P1".into(),
                name: "P1".into(),
                notes,
            }],
            tempos: vec![TempoMark {
                offset: 0.0,
                bpm: 72.0,
            }],
        }
    }

    fn opts(tempo_bpm: u32, transpose: i8) -> SanitizeOptions {
        SanitizeOptions {
            tempo_bpm,
            transpose,
        }
    }

    fn page() -> PageIndex {
        PageIndex::new(1)
    }

    #[test]
    fn transposes_up_a_fourth() {
        // C4 E4 G4 + 5 → F4 A4 C5
        let xml = partwise(&[&format!(
            "<attributes><divisions>1</divisions></attributes>{}{}{}",
            score::tests::note("C", 4, 1),
            score::tests::note("E", 4, 1),
            score::tests::note("G", 4, 1),
        )]);
        let parsed = score::parse_musicxml(&xml).unwrap();
        let s = sanitize(parsed, page(), opts(120, 5)).unwrap();
        let pitches: Vec<i16> = s.notes.iter().map(|n| n.pitch).collect();
        assert_eq!(pitches, vec![65, 69, 72]);
        assert_eq!(s.tempo_bpm, 120);
    }

    #[test]
    fn pitches_leaving_midi_range_are_dropped() {
        let mut score = one_part(vec![ev(0.0, 1.0, 125), ev(1.0, 1.0, 60)]);
        assert_eq!(transpose(&mut score, 5), 1);
        assert_eq!(score.parts[0].notes[0].pitch, 65);
    }

    #[test]
    fn tempo_replaced_by_request() {
        let mut score = one_part(vec![ev(0.0, 1.0, 60)]);
        score.tempos.push(TempoMark {
            offset: 8.0,
            bpm: 200.0,
        });
        set_tempo(&mut score, 96);
        assert_eq!(
            score.tempos,
            vec![TempoMark {
                offset: 0.0,
                bpm: 96.0
            }]
        );
    }

    #[test]
    fn flatten_interleaves_parts() {
        let mut score = one_part(vec![ev(0.0, 1.0, 72), ev(2.0, 1.0, 74)]);
        score.parts.push(Part {
            id: "P2".into(),
            name: "P2".into(),
            notes: vec![ev(1.0, 1.0, 48), ev(0.0, 2.0, 36)],
        });
        let onsets: Vec<(f64, i16)> = flatten(score).iter().map(|n| (n.onset, n.pitch)).collect();
        assert_eq!(onsets, vec![(0.0, 36), (0.0, 72), (1.0, 48), (2.0, 74)]);
    }

    #[test]
    fn absurd_durations_are_clamped() {
        let score = one_part(vec![ev(0.0, 4000.0, 60), ev(1.0, 100.0, 62), ev(2.0, 2.0, 64)]);
        let s = sanitize(score, page(), opts(120, 0)).unwrap();
        let durations: Vec<f64> = s.notes.iter().map(|n| n.duration).collect();
        assert_eq!(durations, vec![1.0, 100.0, 2.0]);
        assert!(s.notes.iter().all(|n| n.duration <= CLAMP_THRESHOLD));
    }

    #[test]
    fn leading_silence_trimmed() {
        let score = one_part(vec![ev(32.0, 1.0, 60), ev(33.0, 2.0, 62)]);
        let s = sanitize(score, page(), opts(120, 0)).unwrap();
        assert_eq!(s.notes[0].onset, 0.0);
        assert_eq!(s.highest_time, 3.0);
    }

    #[test]
    fn long_score_windowed_to_ceiling() {
        // 800 quarters of crotchets: over the hard ceiling, under the absolute one.
        let notes = (0..800).map(|i| ev(f64::from(i), 1.5, 60)).collect();
        let s = sanitize(one_part(notes), page(), opts(120, 0)).unwrap();
        assert!(s.highest_time <= HARD_CEILING);
        assert!(s.highest_time > 0.0);
        assert!(s.notes.iter().all(|n| n.onset < HARD_CEILING));
        assert_eq!(s.notes.len(), 600);
    }

    #[test]
    fn overlong_score_rejected() {
        let notes = (0..1200).map(|i| ev(f64::from(i), 1.0, 60)).collect();
        match sanitize(one_part(notes), page(), opts(120, 0)) {
            Err(SanitizeError::TooLong { duration, limit }) => {
                assert!(duration > ABSOLUTE_CEILING);
                assert_eq!(limit, ABSOLUTE_CEILING);
            }
            other => panic!("expected TooLong, got {other:?}"),
        }
    }

    #[test]
    fn no_notes_is_empty() {
        let err = sanitize(one_part(vec![]), page(), opts(120, 0)).unwrap_err();
        assert!(matches!(err, SanitizeError::Empty));

        let rests_only = partwise(&["<note><rest/><duration>4</duration></note>"]);
        let parsed = score::parse_musicxml(&rests_only).unwrap();
        assert!(matches!(
            sanitize(parsed, page(), opts(120, 0)),
            Err(SanitizeError::Empty)
        ));
    }

    #[test]
    fn everything_transposed_away_is_empty() {
        let score = one_part(vec![ev(0.0, 1.0, 2)]);
        assert!(matches!(
            sanitize(score, page(), opts(120, -12)),
            Err(SanitizeError::Empty)
        ));
    }

    #[test]
    fn trim_keeps_padding_window() {
        let mut notes = vec![ev(5.0, 1.0, 60), ev(9.0, 1.0, 62), ev(25.0, 1.0, 64)];
        let dropped = trim(&mut notes, 5.0, 19.0);
        assert_eq!(dropped, 1);
        assert_eq!(notes.iter().map(|n| n.onset).collect::<Vec<_>>(), vec![0.0, 4.0]);
    }

    #[test]
    fn bounds_hold_for_many_shapes() {
        for (count, step, dur) in [(1, 1.0, 0.25), (50, 3.0, 250.0), (700, 0.5, 1.0), (400, 2.0, 90.0)] {
            let notes = (0..count).map(|i| ev(f64::from(i) * step, dur, 64)).collect();
            if let Ok(s) = sanitize(one_part(notes), page(), opts(120, 0)) {
                assert!(s.highest_time > 0.0 && s.highest_time <= HARD_CEILING);
                assert!(s.notes.iter().all(|n| n.duration <= CLAMP_THRESHOLD));
                assert!(s.notes.windows(2).all(|w| w[0].onset <= w[1].onset));
            }
        }
    }
}
