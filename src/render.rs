//! Renderer and HUD collaborator contracts
//!
//! The simulation only announces what exists and what changed; drawing and
//! widgets are somebody else's job.

use glam::Vec2;
use serde::{Deserialize, Serialize};

use crate::Rect;
use crate::sim::{EntityId, GamePhase, MechanicId, Variant};

/// Packed 0xRRGGBB color
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Color(pub u32);

/// One color per pitch class
const PITCH_CLASS_PALETTE: [u32; 12] = [
    0xFF3B30, // C
    0xFF6F2C, // C#
    0xFF9F0A, // D
    0xFFD60A, // D#
    0xC7E02A, // E
    0x34C759, // F
    0x2AD4A8, // F#
    0x30B0C7, // G
    0x0A84FF, // G#
    0x5E5CE6, // A
    0xAF52DE, // A#
    0xFF2D92, // B
];

/// Default color for a pitch class (0..12, wraps)
pub fn pitch_class_color(pitch_class: u8) -> Color {
    Color(PITCH_CLASS_PALETTE[(pitch_class % 12) as usize])
}

/// Key under which a displayable is registered
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum DisplayKey {
    Entity(EntityId),
    Mechanic(MechanicId),
}

/// What to draw
#[derive(Debug, Clone, PartialEq)]
pub enum Displayable {
    Harmonoid {
        center: Vec2,
        radius: f32,
        variant: Variant,
        color: Color,
        selected: bool,
    },
    Region {
        rect: Rect,
        label: &'static str,
        color: Color,
        solid: bool,
    },
}

/// Drawing collaborator
pub trait Renderer {
    /// Add a displayable, replacing any previous one under the same key
    fn add(&mut self, key: DisplayKey, displayable: Displayable);
    fn remove(&mut self, key: DisplayKey);
    fn color_for_pitch_class(&self, pitch_class: u8) -> Color {
        pitch_class_color(pitch_class)
    }
}

/// Session counters shown on the HUD
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct HudStats {
    pub saved: u32,
    pub lost: u32,
    pub total_spawned: u32,
    pub selected_count: usize,
}

/// Per-mechanic display state
#[derive(Debug, Clone, PartialEq)]
pub enum MechanicDisplay {
    Gate { chord: String, open: bool },
    Bridge { chord: String, solid: bool },
    DissonanceZone { score: f32 },
    Portal { linked: bool, cooling: bool },
}

/// Heads-up display collaborator. Called on change, never every tick.
pub trait Hud {
    fn update_stats(&mut self, stats: &HudStats);
    fn update_resonance_fields(&mut self, left: u32, max: u32);
    fn update_tempo(&mut self, tempo: f32);
    fn update_phase(&mut self, phase: GamePhase);
    fn update_mechanic(&mut self, id: MechanicId, display: &MechanicDisplay);
    fn update_quantize(&mut self, _enabled: bool) {}
}

/// Renderer that draws nothing (headless runs)
#[derive(Debug, Default)]
pub struct NullRenderer;

impl Renderer for NullRenderer {
    fn add(&mut self, _key: DisplayKey, _displayable: Displayable) {}
    fn remove(&mut self, _key: DisplayKey) {}
}

/// HUD that logs at debug level (headless runs)
#[derive(Debug, Default)]
pub struct LogHud;

impl Hud for LogHud {
    fn update_stats(&mut self, stats: &HudStats) {
        log::debug!(
            "HUD stats: saved={} lost={} spawned={} selected={}",
            stats.saved,
            stats.lost,
            stats.total_spawned,
            stats.selected_count
        );
    }
    fn update_resonance_fields(&mut self, left: u32, max: u32) {
        log::debug!("HUD resonance fields: {}/{}", left, max);
    }
    fn update_tempo(&mut self, tempo: f32) {
        log::debug!("HUD tempo: {:.2}x", tempo);
    }
    fn update_phase(&mut self, phase: GamePhase) {
        log::debug!("HUD phase: {:?}", phase);
    }
    fn update_mechanic(&mut self, id: MechanicId, display: &MechanicDisplay) {
        log::debug!("HUD mechanic {:?}: {:?}", id, display);
    }
}


#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_palette_wraps_and_is_distinct() {
        assert_eq!(pitch_class_color(0), pitch_class_color(12));
        let mut colors: Vec<u32> = (0..12).map(|pc| pitch_class_color(pc).0).collect();
        colors.sort_unstable();
        colors.dedup();
        assert_eq!(colors.len(), 12);
    }

    #[test]
    fn test_default_renderer_color_lookup() {
        let renderer = NullRenderer;
        assert_eq!(renderer.color_for_pitch_class(7), pitch_class_color(7));
    }
}
