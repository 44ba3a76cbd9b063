//! Music theory: pitch/frequency conversion, consonance scoring, chord matching
//!
//! Everything here is a pure function except [`Key`], which only holds the
//! current root note. Relative chords are always resolved against the key
//! root at evaluation time, never the root at authoring time.

use std::collections::BTreeSet;

use serde::{Deserialize, Serialize};

use crate::consts::NEUTRAL_HARMONY;

/// Concert pitch reference
pub const A4_HZ: f32 = 440.0;
/// MIDI note number of A4
pub const A4_NOTE: i32 = 69;
/// MIDI note number of middle C, the root of a key in octave 4
pub const C4_NOTE: i32 = 60;

/// Consonance per semitone distance (0..=12), 0 = harsh, 10 = pure
const INTERVAL_SCORES: [u8; 13] = [
    10, // unison
    1,  // minor second
    3,  // major second
    7,  // minor third
    8,  // major third
    9,  // perfect fourth
    2,  // tritone
    10, // perfect fifth
    7,  // minor sixth
    8,  // major sixth
    4,  // minor seventh
    2,  // major seventh
    10, // octave
];

const NOTE_NAMES: [&str; 12] = [
    "C", "C#", "D", "D#", "E", "F", "F#", "G", "G#", "A", "A#", "B",
];

/// Frequency (Hz) of a MIDI note number
#[inline]
pub fn frequency_of(note: i32) -> f32 {
    A4_HZ * 2f32.powf((note - A4_NOTE) as f32 / 12.0)
}

/// Nearest MIDI note for a frequency; `None` for non-positive or non-finite input
pub fn note_of(frequency: f32) -> Option<i32> {
    if !frequency.is_finite() || frequency <= 0.0 {
        return None;
    }
    Some((12.0 * (frequency / A4_HZ).log2()).round() as i32 + A4_NOTE)
}

/// Octave-independent note identity (0..12)
#[inline]
pub fn pitch_class(note: i32) -> u8 {
    note.rem_euclid(12) as u8
}

/// Consonance (0..=10) of a semitone distance; anything outside 0..=12 scores 0
pub fn interval_score(semitones: i32) -> u8 {
    usize::try_from(semitones)
        .ok()
        .and_then(|i| INTERVAL_SCORES.get(i).copied())
        .unwrap_or(0)
}

/// Aggregate harmony of a set of sounding notes, normalized to [0, 1]
///
/// Zero or one note is neither penalized nor rewarded and yields
/// [`NEUTRAL_HARMONY`]. Otherwise this is the mean pairwise interval score
/// (distance reduced mod 12) divided by 10.
pub fn aggregate_harmony(notes: &[i32]) -> f32 {
    if notes.len() < 2 {
        return NEUTRAL_HARMONY;
    }

    let mut total = 0u32;
    let mut pairs = 0u32;
    for (i, a) in notes.iter().enumerate() {
        for b in &notes[i + 1..] {
            total += u32::from(interval_score((a - b).abs() % 12));
            pairs += 1;
        }
    }

    (total as f32 / pairs as f32 / 10.0).clamp(0.0, 1.0)
}

/// Dissonance of a set of notes (`1 - harmony`), exactly 0 below two notes
pub fn dissonance(notes: &[i32]) -> f32 {
    if notes.len() < 2 {
        return 0.0;
    }
    1.0 - aggregate_harmony(notes)
}

/// Check whether the present notes cover every required pitch class
///
/// `required` is read as intervals above `root` when `relative` is set, or
/// as absolute notes otherwise. An empty requirement is always satisfied.
pub fn chord_matches(current: &[i32], required: &[i32], relative: bool, root: i32) -> bool {
    let required: BTreeSet<u8> = required
        .iter()
        .map(|&n| required_pitch_class(n, relative, root))
        .collect();
    if required.is_empty() {
        return true;
    }

    let present: BTreeSet<u8> = current.iter().map(|&n| pitch_class(n)).collect();
    required.is_subset(&present)
}

/// Pitch class a chord entry asks for. Operands are reduced first so any
/// `i32` is accepted.
pub fn required_pitch_class(n: i32, relative: bool, root: i32) -> u8 {
    if relative {
        pitch_class(root.rem_euclid(12) + n.rem_euclid(12))
    } else {
        pitch_class(n)
    }
}

/// Human-readable note name (e.g. "C#")
pub fn note_name(note: i32) -> &'static str {
    NOTE_NAMES[pitch_class(note) as usize]
}

/// Label a chord requirement as note names under the given root
pub fn chord_label(required: &[i32], relative: bool, root: i32) -> String {
    required
        .iter()
        .map(|&n| NOTE_NAMES[required_pitch_class(n, relative, root) as usize])
        .collect::<Vec<_>>()
        .join(" ")
}

/// Parse a key name ("C", "F#", "Bb", "eb") into a pitch class
pub fn parse_key_name(name: &str) -> Option<u8> {
    let mut chars = name.trim().chars();
    let letter = chars.next()?.to_ascii_uppercase();
    let base: i32 = match letter {
        'C' => 0,
        'D' => 2,
        'E' => 4,
        'F' => 5,
        'G' => 7,
        'A' => 9,
        'B' => 11,
        _ => return None,
    };
    let accidental: i32 = match chars.as_str() {
        "" => 0,
        "#" | "♯" => 1,
        "b" | "♭" => -1,
        _ => return None,
    };
    Some(pitch_class(base + accidental))
}

/// Scale mode
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Mode {
    #[default]
    Major,
    Minor,
}

impl Mode {
    /// Semitone offsets of the scale degrees above the root
    pub fn degrees(&self) -> &'static [i32] {
        match self {
            Mode::Major => &[0, 2, 4, 5, 7, 9, 11],
            Mode::Minor => &[0, 2, 3, 5, 7, 8, 10],
        }
    }
}

/// Current musical key (the only music-theory state)
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Key {
    /// Root note (MIDI number)
    pub root: i32,
    pub mode: Mode,
}

impl Default for Key {
    fn default() -> Self {
        Self {
            root: C4_NOTE,
            mode: Mode::Major,
        }
    }
}

impl Key {
    /// Set key from a name; unknown names keep the current root
    pub fn set(&mut self, name: &str, mode: Mode) {
        match parse_key_name(name) {
            Some(pc) => self.root = C4_NOTE + i32::from(pc),
            None => log::warn!("Unknown key name {:?}, keeping root {}", name, self.root),
        }
        self.mode = mode;
    }

    /// Transpose the key root by `semitones`
    pub fn shift(&mut self, semitones: i32) {
        self.root += semitones;
    }

    /// Note of a scale degree (wraps into higher/lower octaves)
    pub fn scale_note(&self, degree: i32) -> i32 {
        let degrees = self.mode.degrees();
        let len = degrees.len() as i32;
        let octave = degree.div_euclid(len);
        self.root + octave * 12 + degrees[degree.rem_euclid(len) as usize]
    }
}
