//! Symbolic score model and MusicXML reader.
//!
//! This is an export-oriented model, not a notation model: just the note
//! events and tempo marks needed to produce something playable. Times are
//! in quarter notes (MusicXML `<duration>` divided by the current
//! `<divisions>`), pitches are MIDI key numbers kept as `i16` so that
//! transposition can step outside 0–127 before the sanitiser drops those
//! notes.
//!
//! Only `score-partwise` documents are read; every OMR engine we drive
//! emits that form.

use roxmltree::Node;
use std::collections::HashMap;
use std::path::Path;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum ScoreError {
    #[error("cannot read score '{path}': {source}")]
    Io {
        path: String,
        #[source]
        source: std::io::Error,
    },
    #[error("xml parse error: {0}")]
    Xml(String),
    #[error("unsupported score: {0}")]
    Unsupported(String),
}

/// A sounding note.
#[derive(Debug, Clone, PartialEq)]
pub struct NoteEvent {
    /// Onset in quarter notes from the start of the score.
    pub onset: f64,
    /// Duration in quarter notes.
    pub duration: f64,
    /// MIDI key number (60 = C4).
    pub pitch: i16,
    pub velocity: u8,
    pub voice: u8,
}

impl NoteEvent {
    pub fn end(&self) -> f64 {
        self.onset + self.duration
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct TempoMark {
    pub offset: f64,
    pub bpm: f64,
}

#[derive(Debug, Clone, PartialEq)]
pub struct Part {
    pub id: String,
    pub name: String,
    pub notes: Vec<NoteEvent>,
}

/// A parsed score: parts with their own note lists, plus tempo marks.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Score {
    pub parts: Vec<Part>,
    pub tempos: Vec<TempoMark>,
}

impl Score {
    /// Iterator over every note of every part.
    pub fn notes(&self) -> impl Iterator<Item = &NoteEvent> {
        self.parts.iter().flat_map(|p| p.notes.iter())
    }

    /// End of the last sounding note.
    pub fn highest_time(&self) -> f64 {
        highest_time(self.notes())
    }
}

pub(crate) fn highest_time<'a>(notes: impl Iterator<Item = &'a NoteEvent>) -> f64 {
    notes.map(NoteEvent::end).fold(0.0, f64::max)
}

/// Default MIDI velocity when the score has no `dynamics` attribute.
const DEFAULT_VELOCITY: u8 = 80;

/// Read and parse a MusicXML file.
pub fn load_musicxml(path: &Path) -> Result<Score, ScoreError> {
    let text = std::fs::read_to_string(path).map_err(|source| ScoreError::Io {
        path: path.display().to_string(),
        source,
    })?;
    parse_musicxml(&text)
}

/// Parse a `score-partwise` MusicXML document.
pub fn parse_musicxml(xml: &str) -> Result<Score, ScoreError> {
    let doc = roxmltree::Document::parse_with_options(
        xml,
        roxmltree::ParsingOptions {
            allow_dtd: true,
            ..Default::default()
        },
    )
    .map_err(|e| ScoreError::Xml(e.to_string()))?;

    let root = doc.root_element();
    match root.tag_name().name() {
        "score-partwise" => {}
        "score-timewise" => {
            return Err(ScoreError::Unsupported("score-timewise layout".into()));
        }
        other => {
            return Err(ScoreError::Unsupported(format!(
                "root element <{other}> is not a MusicXML score"
            )));
        }
    }

    let names = part_names(root);
    let mut score = Score::default();

    for (i, part_node) in children(root, "part").enumerate() {
        let id = part_node
            .attribute("id")
            .map(str::to_string)
            .unwrap_or_else(|| format!("P{}", i + 1));
        let name = names.get(&id).cloned().unwrap_or_else(|| id.clone());
        let mut reader = PartReader::default();
        for measure in children(part_node, "measure") {
            reader.measure(measure, &mut score.tempos);
        }
        score.parts.push(Part {
            id,
            name,
            notes: reader.notes,
        });
    }

    score
        .tempos
        .sort_by(|a, b| a.offset.total_cmp(&b.offset));
    Ok(score)
}

fn part_names(root: Node) -> HashMap<String, String> {
    children(root, "part-list")
        .flat_map(|list| children(list, "score-part"))
        .filter_map(|sp| {
            let id = sp.attribute("id")?.to_string();
            let name = child_text(sp, "part-name").unwrap_or_default().to_string();
            Some((id, name))
        })
        .collect()
}

/// Per-part cursor state while walking measures.
struct PartReader {
    divisions: f64,
    cursor: f64,
    /// Onset of the previous non-chord note, for `<chord/>` members.
    last_onset: f64,
    notes: Vec<NoteEvent>,
    /// (pitch, voice) → index into `notes` of a note awaiting its tie stop.
    open_ties: HashMap<(i16, u8), usize>,
}

impl Default for PartReader {
    fn default() -> Self {
        Self {
            divisions: 1.0,
            cursor: 0.0,
            last_onset: 0.0,
            notes: Vec::new(),
            open_ties: HashMap::new(),
        }
    }
}

impl PartReader {
    fn measure(&mut self, measure: Node, tempos: &mut Vec<TempoMark>) {
        let start = self.cursor;
        let mut furthest = start;

        for el in measure.children().filter(Node::is_element) {
            match el.tag_name().name() {
                "attributes" => {
                    if let Some(d) = child_number(el, "divisions").filter(|d| *d > 0.0) {
                        self.divisions = d;
                    }
                }
                "note" => self.note(el),
                "backup" => {
                    let d = self.duration_of(el);
                    self.cursor = (self.cursor - d).max(start);
                }
                "forward" => self.cursor += self.duration_of(el),
                "direction" => {
                    let offset = self.cursor
                        + child_number(el, "offset").unwrap_or(0.0) / self.divisions;
                    if let Some(bpm) = direction_tempo(el) {
                        tempos.push(TempoMark { offset, bpm });
                    }
                }
                "sound" => {
                    if let Some(bpm) = sound_tempo(el) {
                        tempos.push(TempoMark {
                            offset: self.cursor,
                            bpm,
                        });
                    }
                }
                _ => {}
            }
            furthest = furthest.max(self.cursor);
        }

        self.cursor = furthest;
    }

    fn duration_of(&self, el: Node) -> f64 {
        child_number(el, "duration").unwrap_or(0.0).max(0.0) / self.divisions
    }

    fn note(&mut self, el: Node) {
        // Grace notes take no time; cue notes are not played.
        if has_child(el, "grace") || has_child(el, "cue") {
            return;
        }

        let duration = self.duration_of(el);
        let is_chord = has_child(el, "chord");
        let onset = if is_chord { self.last_onset } else { self.cursor };
        if !is_chord {
            self.last_onset = onset;
            self.cursor += duration;
        }

        let Some(pitch) = children(el, "pitch").next().and_then(parse_pitch) else {
            // Rest or unpitched percussion.
            return;
        };
        let voice = child_number(el, "voice").map_or(1, |v| v.clamp(0.0, 255.0) as u8);
        let velocity = el
            .attribute("dynamics")
            .and_then(|d| d.parse::<f64>().ok())
            .map_or(DEFAULT_VELOCITY, |d| (d * 0.9).round().clamp(1.0, 127.0) as u8);

        let ties: Vec<&str> = children(el, "tie")
            .filter_map(|t| t.attribute("type"))
            .collect();
        let tie_start = ties.contains(&"start");
        let tie_stop = ties.contains(&"stop");
        let key = (pitch, voice);

        if tie_stop {
            if let Some(&idx) = self.open_ties.get(&key) {
                let held = &mut self.notes[idx];
                held.duration = (onset + duration - held.onset).max(held.duration);
                if !tie_start {
                    self.open_ties.remove(&key);
                }
                return;
            }
        }

        self.notes.push(NoteEvent {
            onset,
            duration,
            pitch,
            velocity,
            voice,
        });
        if tie_start {
            self.open_ties.insert(key, self.notes.len() - 1);
        }
    }
}

/// `<pitch><step/><alter/><octave/></pitch>` → MIDI key number.
fn parse_pitch(pitch: Node) -> Option<i16> {
    let base: i16 = match child_text(pitch, "step")?.trim() {
        "C" => 0,
        "D" => 2,
        "E" => 4,
        "F" => 5,
        "G" => 7,
        "A" => 9,
        "B" => 11,
        _ => return None,
    };
    let alter = child_number(pitch, "alter").unwrap_or(0.0).clamp(-2.0, 2.0).round() as i16;
    // MusicXML octaves are 0..=9; anything else is recognition noise.
    let octave = child_number(pitch, "octave").filter(|o| (0.0..=9.0).contains(o))? as i16;
    Some(base + alter + (octave + 1) * 12)
}

fn sound_tempo(sound: Node) -> Option<f64> {
    sound
        .attribute("tempo")
        .and_then(|t| t.trim().parse::<f64>().ok())
        .filter(|bpm| *bpm > 0.0)
}

/// Tempo from `<direction>`: a `<sound tempo>` child wins over a metronome mark.
fn direction_tempo(direction: Node) -> Option<f64> {
    if let Some(bpm) = children(direction, "sound").find_map(sound_tempo) {
        return Some(bpm);
    }
    let metronome = direction
        .descendants()
        .find(|n| n.has_tag_name("metronome"))?;
    let per_minute: f64 = child_text(metronome, "per-minute")?.trim().parse().ok()?;
    let mut quarters = match child_text(metronome, "beat-unit")?.trim() {
        "whole" => 4.0,
        "half" => 2.0,
        "quarter" => 1.0,
        "eighth" => 0.5,
        "16th" => 0.25,
        _ => return None,
    };
    if has_child(metronome, "beat-unit-dot") {
        quarters *= 1.5;
    }
    Some(per_minute * quarters).filter(|bpm| *bpm > 0.0)
}

// ── roxmltree helpers ─────────────────────────────────────────────────────

fn children<'a, 'input: 'a>(
    node: Node<'a, 'input>,
    name: &'static str,
) -> impl Iterator<Item = Node<'a, 'input>> {
    node.children().filter(move |n| n.has_tag_name(name))
}

fn has_child(node: Node, name: &'static str) -> bool {
    children(node, name).next().is_some()
}

fn child_text<'a>(node: Node<'a, '_>, name: &'static str) -> Option<&'a str> {
    children(node, name).next().and_then(|n| n.text())
}

fn child_number(node: Node, name: &'static str) -> Option<f64> {
    child_text(node, name).and_then(|t| t.trim().parse::<f64>().ok())
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;

    /// Wrap `<measure>` bodies for part P1 into a full document.
    pub(crate) fn partwise(measures: &[&str]) -> String {
        let body: String = measures
            .iter()
            .enumerate()
            .map(|(i, m)| format!("<measure number=\"{}\">{}</measure>", i + 1, m))
            .collect();
        format!(
            r#"<?xml version="1.0" encoding="UTF-8"?>
<score-partwise version="3.1">
  <part-list><score-part id="P1"><part-name>Piano</part-name></score-part></part-list>
  <part id="P1">{body}</part>
</score-partwise>"#
        )
    }

    pub(crate) fn note(step: &str, octave: i32, duration: u32) -> String {
        format!(
            "<note><pitch><step>{step}</step><octave>{octave}</octave></pitch><duration>{duration}</duration></note>"
        )
    }

    #[test]
    fn simple_melody_onsets() {
        let m = format!(
            "<attributes><divisions>2</divisions></attributes>{}{}{}",
            note("C", 4, 2),
            note("D", 4, 1),
            note("E", 4, 4)
        );
        let score = parse_musicxml(&partwise(&[&m])).unwrap();
        let notes = &score.parts[0].notes;
        assert_eq!(score.parts[0].name, "Piano");
        assert_eq!(notes.len(), 3);
        assert_eq!(notes.iter().map(|n| n.pitch).collect::<Vec<_>>(), vec![60, 62, 64]);
        assert_eq!(notes.iter().map(|n| n.onset).collect::<Vec<_>>(), vec![0.0, 1.0, 1.5]);
        assert_eq!(notes[2].duration, 2.0);
        assert_eq!(score.highest_time(), 3.5);
    }

    #[test]
    fn alter_and_rests() {
        let m = "<attributes><divisions>1</divisions></attributes>\
            <note><rest/><duration>1</duration></note>\
            <note><pitch><step>F</step><alter>1</alter><octave>3</octave></pitch><duration>1</duration></note>";
        let score = parse_musicxml(&partwise(&[m])).unwrap();
        let notes = &score.parts[0].notes;
        assert_eq!(notes.len(), 1);
        assert_eq!(notes[0].pitch, 54);
        assert_eq!(notes[0].onset, 1.0);
    }

    #[test]
    fn absurd_octave_is_treated_as_unpitched() {
        let m = format!(
            "<attributes><divisions>1</divisions></attributes>{}{}{}{}",
            note("C", 3000, 1),
            note("D", -40, 1),
            "<note><pitch><step>E</step><alter>9999</alter><octave>4</octave></pitch><duration>1</duration></note>",
            note("G", 9, 1)
        );
        let score = parse_musicxml(&partwise(&[&m])).unwrap();
        let notes = &score.parts[0].notes;
        assert_eq!(
            notes.iter().map(|n| (n.onset, n.pitch)).collect::<Vec<_>>(),
            vec![(2.0, 66), (3.0, 127)]
        );
    }

    #[test]
    fn chords_share_onset() {
        let m = format!(
            "<attributes><divisions>1</divisions></attributes>{}\
             <note><chord/><pitch><step>E</step><octave>4</octave></pitch><duration>2</duration></note>{}",
            note("C", 4, 2),
            note("G", 4, 1)
        );
        let score = parse_musicxml(&partwise(&[&m])).unwrap();
        let onsets: Vec<f64> = score.parts[0].notes.iter().map(|n| n.onset).collect();
        assert_eq!(onsets, vec![0.0, 0.0, 2.0]);
    }

    #[test]
    fn backup_starts_second_voice_at_measure_start() {
        let m = format!(
            "<attributes><divisions>1</divisions></attributes>{}{}<backup><duration>4</duration></backup>\
             <note><pitch><step>C</step><octave>3</octave></pitch><duration>4</duration><voice>2</voice></note>",
            note("E", 4, 2),
            note("F", 4, 2)
        );
        let second = note("G", 4, 4);
        let score = parse_musicxml(&partwise(&[&m, &second])).unwrap();
        let notes = &score.parts[0].notes;
        let bass = notes.iter().find(|n| n.pitch == 48).unwrap();
        assert_eq!(bass.onset, 0.0);
        assert_eq!(bass.voice, 2);
        // Next measure begins after the longest voice.
        assert_eq!(notes.iter().find(|n| n.pitch == 67).unwrap().onset, 4.0);
    }

    #[test]
    fn tied_notes_merge() {
        let m1 = "<attributes><divisions>1</divisions></attributes>\
            <note><pitch><step>A</step><octave>4</octave></pitch><duration>4</duration><tie type=\"start\"/></note>";
        let m2 = "<note><pitch><step>A</step><octave>4</octave></pitch><duration>2</duration><tie type=\"stop\"/></note>";
        let score = parse_musicxml(&partwise(&[m1, m2])).unwrap();
        let notes = &score.parts[0].notes;
        assert_eq!(notes.len(), 1);
        assert_eq!(notes[0].duration, 6.0);
    }

    #[test]
    fn grace_notes_take_no_time() {
        let m = format!(
            "<attributes><divisions>1</divisions></attributes>\
             <note><grace/><pitch><step>B</step><octave>4</octave></pitch></note>{}",
            note("C", 5, 1)
        );
        let score = parse_musicxml(&partwise(&[&m])).unwrap();
        let notes = &score.parts[0].notes;
        assert_eq!(notes.len(), 1);
        assert_eq!(notes[0].onset, 0.0);
    }

    #[test]
    fn tempo_marks_collected() {
        let m1 = "<attributes><divisions>1</divisions></attributes>\
            <direction><direction-type><metronome><beat-unit>half</beat-unit><per-minute>50</per-minute></metronome></direction-type></direction>\
            <note><pitch><step>C</step><octave>4</octave></pitch><duration>4</duration></note>";
        let m2 = "<sound tempo=\"90\"/><note><pitch><step>C</step><octave>4</octave></pitch><duration>4</duration></note>";
        let score = parse_musicxml(&partwise(&[m1, m2])).unwrap();
        assert_eq!(
            score.tempos,
            vec![
                TempoMark { offset: 0.0, bpm: 100.0 },
                TempoMark { offset: 4.0, bpm: 90.0 },
            ]
        );
    }

    #[test]
    fn multiple_parts_kept_separate() {
        let xml = r#"<score-partwise>
  <part-list>
    <score-part id="P1"><part-name>RH</part-name></score-part>
    <score-part id="P2"><part-name>LH</part-name></score-part>
  </part-list>
  <part id="P1"><measure><note><pitch><step>C</step><octave>5</octave></pitch><duration>1</duration></note></measure></part>
  <part id="P2"><measure><note><pitch><step>C</step><octave>3</octave></pitch><duration>1</duration></note></measure></part>
</score-partwise>"#;
        let score = parse_musicxml(xml).unwrap();
        assert_eq!(score.parts.len(), 2);
        assert_eq!(score.parts[1].name, "LH");
        assert_eq!(score.parts[1].notes[0].onset, 0.0);
    }

    #[test]
    fn rejects_non_scores() {
        assert!(matches!(parse_musicxml("<html/>"), Err(ScoreError::Unsupported(_))));
        assert!(matches!(parse_musicxml("<score-timewise/>"), Err(ScoreError::Unsupported(_))));
        assert!(matches!(parse_musicxml("<score-partwise>"), Err(ScoreError::Xml(_))));
    }

    #[test]
    fn doctype_is_accepted() {
        let xml = r#"<?xml version="1.0" encoding="UTF-8" standalone="no"?>
<!DOCTYPE score-partwise PUBLIC "-//Recordare//DTD MusicXML 3.1 Partwise//EN" "http://www.musicxml.org/dtds/partwise.dtd">
<score-partwise version="3.1"><part-list/><part id="P1"><measure number="1"/></part></score-partwise>"#;
        let score = parse_musicxml(xml).unwrap();
        assert_eq!(score.parts.len(), 1);
        assert!(score.parts[0].notes.is_empty());
    }
}
