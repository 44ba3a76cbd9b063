//! Harmonoids - a musical puzzle simulation
//!
//! Core modules:
//! - `music`: Pitch/frequency conversion, consonance scoring, chord matching
//! - `sim`: Tick-based world (entities, mechanics, controller, arcade physics)
//! - `audio`: Audio sink contract and the voice-limited mixer
//! - `render`: Renderer/HUD collaborator contracts
//! - `settings`: Data-driven session configuration

pub mod audio;
pub mod music;
pub mod render;
pub mod settings;
pub mod sim;

pub use settings::{ConfigError, Settings};

use glam::Vec2;
use serde::{Deserialize, Serialize};

/// Game configuration constants
pub mod consts {
    /// Fixed simulation timestep used by the headless runner (120 Hz)
    pub const SIM_DT: f32 = 1.0 / 120.0;

    /// Default world dimensions (y grows downward)
    pub const WORLD_WIDTH: f32 = 1280.0;
    pub const WORLD_HEIGHT: f32 = 720.0;
    /// Thickness of the invisible boundary walls
    pub const BOUNDS_THICKNESS: f32 = 50.0;
    /// Entities further than this outside the world are lost
    pub const OUT_OF_BOUNDS_MARGIN: f32 = 50.0;
    pub const OUT_OF_BOUNDS_TOP: f32 = 100.0;

    /// Gravity (units/s²)
    pub const GRAVITY: f32 = 980.0;
    /// Upper bound on a single frame delta to prevent spiral of death
    pub const MAX_FRAME_DT: f32 = 0.1;

    /// Harmonoid body radius
    pub const HARMONOID_RADIUS: f32 = 12.0;
    pub const DEFAULT_VOLUME: f32 = 0.5;

    /// Walking: target speed, drive acceleration and the side-normal that turns a walker
    pub const WALK_SPEED: f32 = 70.0;
    pub const WALK_ACCEL: f32 = 300.0;
    pub const WALL_NORMAL_X: f32 = 0.7;

    /// Glissoid pitch glide: fraction of the remaining gap closed per tick
    pub const GLIDE_RATE: f32 = 0.1;
    /// Glide stops once within this many Hz of the target
    pub const GLIDE_EPSILON_HZ: f32 = 0.5;
    /// Slope assist acceleration for grounded, moving Glissoids
    pub const SLOPE_ASSIST_ACCEL: f32 = 60.0;
    /// Vertical speed below which an entity counts as grounded
    pub const GROUNDED_SPEED: f32 = 8.0;

    /// Bassoid: minimum impact speed for a vibration pulse
    pub const BASSOID_IMPACT_SPEED: f32 = 250.0;
    pub const BASSOID_PULSE_RADIUS: f32 = 150.0;
    /// Velocity change imparted to a plate, divided by its distance
    pub const BASSOID_PULSE_STRENGTH: f32 = 30_000.0;
    /// Distances below this are treated as this (avoids huge kicks)
    pub const BASSOID_PULSE_MIN_DISTANCE: f32 = 40.0;
    pub const BASSOID_PULSE_DURATION: f64 = 0.3;

    /// Percussoid: minimum landing speed and debounce window
    pub const PERCUSSOID_IMPACT_SPEED: f32 = 120.0;
    pub const PERCUSSOID_DEBOUNCE: f64 = 0.5;
    pub const PERCUSSOID_TRIGGER_RADIUS: f32 = 100.0;
    /// Contact normal y-component above which a collision counts as a landing
    pub const LANDING_NORMAL_Y: f32 = 0.5;

    /// Length of a one-shot (percussive/echo) voice
    pub const ONE_SHOT_DURATION: f64 = 0.3;

    /// Harmony signal for zero or one audible note
    pub const NEUTRAL_HARMONY: f32 = 0.75;

    /// HarmonicGate listens this far beyond its barrier
    pub const GATE_LISTEN_MARGIN: f32 = 60.0;

    /// DissonanceZone jitter
    pub const DISSONANCE_THRESHOLD: f32 = 0.7;
    pub const DISSONANCE_JITTER_CHANCE: f64 = 0.3;
    pub const DISSONANCE_JITTER_ACCEL: f32 = 400.0;

    /// ResonanceField pull toward its center
    pub const RESONANCE_PULL_ACCEL: f32 = 150.0;

    /// FrequencyBridge sensor extends this far above the platform
    pub const BRIDGE_SENSOR_HEIGHT: f32 = 80.0;

    /// AmplitudeFan capture height above the fan, activation threshold and gain
    pub const FAN_CAPTURE_HEIGHT: f32 = 200.0;
    pub const FAN_AMPLITUDE_THRESHOLD: f32 = 0.1;
    pub const FAN_LIFT_PER_AMPLITUDE: f32 = 1200.0;
    pub const FAN_DEFAULT_MAX_LIFT: f32 = 1600.0;

    /// Portal exit clearance above the destination portal
    pub const PORTAL_EXIT_CLEARANCE: f32 = 4.0;

    /// EchoChamber defaults
    pub const ECHO_MAX_QUEUE: usize = 5;
    pub const ECHO_VOLUME_SCALE: f32 = 0.7;
    /// Same-source echoes closer together than this are not re-queued
    pub const ECHO_DEDUP_WINDOW: f64 = 0.1;

    /// Quantize grid (sixteenth notes at 120 BPM)
    pub const QUANTIZE_STEP: f64 = 0.125;

    /// Largest physics substep; tempo-scaled frames are split into these
    pub const MAX_PHYSICS_STEP: f32 = 1.0 / 60.0;
}

/// Axis-aligned rectangle in world units (y grows downward)
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Rect {
    /// Top-left corner
    pub min: Vec2,
    pub size: Vec2,
}

impl Rect {
    pub fn new(x: f32, y: f32, width: f32, height: f32) -> Self {
        Self {
            min: Vec2::new(x, y),
            size: Vec2::new(width, height),
        }
    }

    pub fn from_center(center: Vec2, size: Vec2) -> Self {
        Self {
            min: center - size * 0.5,
            size,
        }
    }

    #[inline]
    pub fn max(&self) -> Vec2 {
        self.min + self.size
    }

    #[inline]
    pub fn center(&self) -> Vec2 {
        self.min + self.size * 0.5
    }

    #[inline]
    pub fn half_extents(&self) -> Vec2 {
        self.size * 0.5
    }

    #[inline]
    pub fn top(&self) -> f32 {
        self.min.y
    }

    /// Point containment (edges inclusive)
    pub fn contains(&self, p: Vec2) -> bool {
        let max = self.max();
        p.x >= self.min.x && p.x <= max.x && p.y >= self.min.y && p.y <= max.y
    }

    /// Grow by `margin` on every side
    pub fn inflate(&self, margin: f32) -> Self {
        Self {
            min: self.min - Vec2::splat(margin),
            size: self.size + Vec2::splat(margin * 2.0),
        }
    }

    /// Extend the top edge upward by `height`
    pub fn extend_up(&self, height: f32) -> Self {
        Self {
            min: Vec2::new(self.min.x, self.min.y - height),
            size: Vec2::new(self.size.x, self.size.y + height),
        }
    }

    /// The band of `height` directly above this rectangle
    pub fn band_above(&self, height: f32) -> Self {
        Self::new(self.min.x, self.min.y - height, self.size.x, height)
    }

    /// Whether a circle touches or overlaps this rectangle
    pub fn overlaps_circle(&self, center: Vec2, radius: f32) -> bool {
        let closest = center.clamp(self.min, self.max());
        closest.distance_squared(center) <= radius * radius
    }

    pub fn is_valid(&self) -> bool {
        self.size.x > 0.0 && self.size.y > 0.0 && self.min.is_finite() && self.size.is_finite()
    }
}
