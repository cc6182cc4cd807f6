//! Standard MIDI File writer for sanitised pages.
//!
//! One track (format 0), one tempo event, one channel, General MIDI program
//! 0. The soundfont picks the timbre; the score only supplies notes.

use crate::pipeline::sanitize::SanitizedScore;
use midly::{Format, Header, MetaMessage, MidiMessage, Smf, Timing, TrackEvent, TrackEventKind};

/// Ticks per quarter note.
pub const TICKS_PER_QUARTER: u16 = 480;

const CHANNEL: u8 = 0;
const PROGRAM: u8 = 0;

/// Encode `score` as SMF bytes.
pub fn to_smf_bytes(score: &SanitizedScore) -> Result<Vec<u8>, String> {
    let mut events: Vec<TrackEvent<'static>> = Vec::with_capacity(score.notes.len() * 2 + 3);

    let micros_per_quarter = 60_000_000 / score.tempo_bpm.max(1);
    events.push(TrackEvent {
        delta: 0.into(),
        kind: TrackEventKind::Meta(MetaMessage::Tempo(micros_per_quarter.into())),
    });
    events.push(TrackEvent {
        delta: 0.into(),
        kind: TrackEventKind::Midi {
            channel: CHANNEL.into(),
            message: MidiMessage::ProgramChange {
                program: PROGRAM.into(),
            },
        },
    });

    // (absolute tick, note-off first at equal ticks, event)
    let mut timed: Vec<(u32, bool, TrackEvent<'static>)> = Vec::with_capacity(score.notes.len() * 2);
    for note in &score.notes {
        let Ok(key) = u8::try_from(note.pitch) else {
            continue;
        };
        if key > 127 {
            continue;
        }
        let start = to_ticks(note.onset);
        let end = to_ticks(note.onset + note.duration).max(start + 1);
        let vel = note.velocity.clamp(1, 127);

        timed.push((
            start,
            false,
            TrackEvent {
                delta: start.into(),
                kind: TrackEventKind::Midi {
                    channel: CHANNEL.into(),
                    message: MidiMessage::NoteOn {
                        key: key.into(),
                        vel: vel.into(),
                    },
                },
            },
        ));
        timed.push((
            end,
            true,
            TrackEvent {
                delta: end.into(),
                kind: TrackEventKind::Midi {
                    channel: CHANNEL.into(),
                    message: MidiMessage::NoteOff {
                        key: key.into(),
                        vel: 0.into(),
                    },
                },
            },
        ));
    }
    timed.sort_by_key(|(tick, is_off, _)| (*tick, !*is_off));
    events.extend(timed.into_iter().map(|(_, _, ev)| ev));

    convert_to_delta_times(&mut events);
    events.push(TrackEvent {
        delta: 0.into(),
        kind: TrackEventKind::Meta(MetaMessage::EndOfTrack),
    });

    let smf = Smf {
        header: Header {
            format: Format::SingleTrack,
            timing: Timing::Metrical(TICKS_PER_QUARTER.into()),
        },
        tracks: vec![events],
    };

    let mut out = Vec::new();
    smf.write(&mut out)
        .map_err(|e| format!("failed to encode MIDI: {e}"))?;
    Ok(out)
}

fn to_ticks(quarters: f64) -> u32 {
    (quarters.max(0.0) * f64::from(TICKS_PER_QUARTER)).round() as u32
}

/// Absolute ticks → deltas, in place.
fn convert_to_delta_times(events: &mut [TrackEvent]) {
    let mut prev = 0u32;
    for event in events.iter_mut() {
        let now = event.delta.as_int();
        event.delta = now.saturating_sub(prev).into();
        prev = now;
    }
}
