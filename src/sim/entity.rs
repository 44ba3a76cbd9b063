//! Harmonoids and their variant behaviors
//!
//! Shared musical state lives on [`Harmonoid`]; variant-specific state and
//! behavior is a tagged union dispatched with `match`. Position and velocity
//! belong to the physics world and are only read through the body handle.

use glam::Vec2;
use serde::{Deserialize, Serialize};

use super::physics::{BodyHandle, Physics};
use crate::audio::{Mixer, VoiceId, VoiceRequest, VoiceUpdate, Waveform};
use crate::consts::*;
use crate::music::frequency_of;

/// Unique entity identifier (also the id of its sustained voice)
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct EntityId(pub u32);

impl EntityId {
    pub fn voice(self) -> VoiceId {
        VoiceId(u64::from(self.0))
    }
}

/// Harmonoid kind
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Variant {
    #[default]
    Standard,
    Bassoid,
    Glissoid,
    Percussoid,
    Droneoid,
}

impl Variant {
    /// Octave placement relative to the chosen scale note
    pub fn note_shift(&self) -> i32 {
        match self {
            Variant::Bassoid => -24,
            Variant::Droneoid => -12,
            _ => 0,
        }
    }

    pub fn waveform(&self) -> Waveform {
        match self {
            Variant::Standard | Variant::Glissoid => Waveform::Sine,
            Variant::Bassoid => Waveform::Sawtooth,
            Variant::Percussoid => Waveform::Square,
            Variant::Droneoid => Waveform::Triangle,
        }
    }

    pub fn volume(&self) -> f32 {
        match self {
            Variant::Bassoid => 0.6,
            Variant::Droneoid => 0.4,
            _ => DEFAULT_VOLUME,
        }
    }

    pub fn mass(&self) -> f32 {
        match self {
            Variant::Bassoid => 2.0,
            Variant::Droneoid => 1.5,
            _ => 1.0,
        }
    }

    /// Glissoids slide, everything else grips
    pub fn friction(&self) -> f32 {
        match self {
            Variant::Glissoid => 0.05,
            _ => 0.5,
        }
    }

    /// Whether the variant holds a continuous tone
    pub fn sustains(&self) -> bool {
        !matches!(self, Variant::Percussoid)
    }

    pub fn label(&self) -> &'static str {
        match self {
            Variant::Standard => "standard",
            Variant::Bassoid => "bassoid",
            Variant::Glissoid => "glissoid",
            Variant::Percussoid => "percussoid",
            Variant::Droneoid => "droneoid",
        }
    }
}

/// Per-variant runtime state
#[derive(Debug, Clone, PartialEq)]
enum VariantState {
    Standard,
    Bassoid {
        /// Visual/logical pulse lasts until this clock time
        pulse_until: f64,
    },
    Glissoid {
        current_hz: f32,
        target_hz: f32,
        gliding: bool,
    },
    Percussoid {
        last_trigger: Option<f64>,
    },
    Droneoid {
        hovering: bool,
    },
}

impl VariantState {
    fn new(variant: Variant, note: i32) -> Self {
        match variant {
            Variant::Standard => VariantState::Standard,
            Variant::Bassoid => VariantState::Bassoid {
                pulse_until: f64::NEG_INFINITY,
            },
            Variant::Glissoid => {
                let hz = frequency_of(note);
                VariantState::Glissoid {
                    current_hz: hz,
                    target_hz: hz,
                    gliding: false,
                }
            }
            Variant::Percussoid => VariantState::Percussoid { last_trigger: None },
            Variant::Droneoid => VariantState::Droneoid { hovering: false },
        }
    }
}

/// A collision as seen by the entity
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Impact {
    /// Unit normal from the entity toward what it hit
    pub normal: Vec2,
    pub speed: f32,
    /// The other body is level furniture (platform or obstacle)
    pub surface: bool,
}

impl Impact {
    /// The other body is below the entity
    pub fn is_landing(&self) -> bool {
        self.normal.y > LANDING_NORMAL_Y
    }
}

/// Variant reaction to an impact, carried out by the controller
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Reaction {
    /// Bassoid vibration pulse toward nearby low-frequency plates
    Pulse,
    /// Percussoid hit: trigger nearby rhythm pads
    Percussion,
}

/// A musical creature walking the level
#[derive(Debug, Clone)]
pub struct Harmonoid {
    pub id: EntityId,
    pub body: BodyHandle,
    variant: Variant,
    /// Scale note chosen at spawn (MIDI number)
    pub base_note: i32,
    /// Player adjustment in semitones
    pub pitch_offset: i32,
    /// Transient arpeggio sweep offset
    pub arpeggio_offset: i32,
    pub waveform: Waveform,
    pub volume: f32,
    pub is_muted: bool,
    pub is_soloed: bool,
    pub is_implicitly_muted: bool,
    pub is_playing_sound: bool,
    pub selected: bool,
    /// Walking direction (+1 right, -1 left)
    pub facing: f32,
    state: VariantState,
}

impl Harmonoid {
    pub fn new(id: EntityId, variant: Variant, base_note: i32, body: BodyHandle) -> Self {
        Self {
            id,
            body,
            variant,
            base_note,
            pitch_offset: 0,
            arpeggio_offset: 0,
            waveform: variant.waveform(),
            volume: variant.volume(),
            is_muted: false,
            is_soloed: false,
            is_implicitly_muted: false,
            is_playing_sound: false,
            selected: false,
            facing: 1.0,
            state: VariantState::new(variant, base_note),
        }
    }

    #[inline]
    pub fn variant(&self) -> Variant {
        self.variant
    }

    /// Note the entity is asking for
    #[inline]
    pub fn current_note(&self) -> i32 {
        self.base_note + self.pitch_offset + self.arpeggio_offset
    }

    /// Frequency actually sounding (Glissoids lag behind their note)
    pub fn frequency(&self) -> f32 {
        match self.state {
            VariantState::Glissoid { current_hz, .. } => current_hz,
            _ => frequency_of(self.current_note()),
        }
    }

    #[inline]
    pub fn audible(&self) -> bool {
        !self.is_muted && !self.is_implicitly_muted
    }

    /// Audible and holding a tone right now
    #[inline]
    pub fn sounding(&self) -> bool {
        self.audible() && self.is_playing_sound
    }

    pub fn is_hovering(&self) -> bool {
        matches!(self.state, VariantState::Droneoid { hovering: true })
    }

    pub fn is_gliding(&self) -> bool {
        matches!(self.state, VariantState::Glissoid { gliding: true, .. })
    }

    pub fn is_pulsing(&self, now: f64) -> bool {
        matches!(self.state, VariantState::Bassoid { pulse_until } if now < pulse_until)
    }

    fn voice_request(&self) -> VoiceRequest {
        VoiceRequest {
            frequency: self.frequency(),
            waveform: self.waveform,
            volume: self.volume,
            percussive: !self.variant.sustains(),
            detuned: self.variant == Variant::Droneoid,
        }
    }

    // === Voice lifecycle ===

    /// Start the sustained voice if the entity should be heard
    pub fn start_sound(&mut self, mixer: &mut Mixer) {
        if self.is_playing_sound || !self.audible() || !self.variant.sustains() {
            return;
        }
        self.is_playing_sound = mixer.play(self.id.voice(), &self.voice_request());
    }

    pub fn stop_sound(&mut self, mixer: &mut Mixer) {
        if self.is_playing_sound {
            mixer.stop(self.id.voice());
            self.is_playing_sound = false;
        }
    }

    /// Bring the voice in line with the playback flags
    pub fn refresh_sound(&mut self, mixer: &mut Mixer) {
        if self.audible() {
            self.start_sound(mixer);
        } else {
            self.stop_sound(mixer);
        }
    }

    pub fn mute(&mut self, mixer: &mut Mixer) {
        self.is_muted = true;
        self.stop_sound(mixer);
    }

    pub fn unmute(&mut self, mixer: &mut Mixer) {
        self.is_muted = false;
        if !self.is_implicitly_muted {
            self.start_sound(mixer);
        }
    }

    /// Set or clear implicit mute. A soloed entity is never implicitly muted.
    pub fn set_implicitly_muted(&mut self, muted: bool, mixer: &mut Mixer) {
        self.is_implicitly_muted = muted && !self.is_soloed;
        self.refresh_sound(mixer);
    }

    pub fn set_soloed(&mut self, soloed: bool) {
        self.is_soloed = soloed;
        if soloed {
            self.is_implicitly_muted = false;
        }
    }

    // === Pitch ===

    pub fn shift_pitch(&mut self, semitones: i32, mixer: &mut Mixer) {
        self.pitch_offset += semitones;
        self.retune(mixer);
    }

    pub fn set_arpeggio_offset(&mut self, offset: i32, mixer: &mut Mixer) {
        if self.arpeggio_offset != offset {
            self.arpeggio_offset = offset;
            self.retune(mixer);
        }
    }

    /// Move the base note (global key change)
    pub fn transpose(&mut self, semitones: i32, mixer: &mut Mixer) {
        self.base_note += semitones;
        self.retune(mixer);
    }

    pub fn set_waveform(&mut self, waveform: Waveform, mixer: &mut Mixer) {
        self.waveform = waveform;
        if self.is_playing_sound {
            mixer.update(
                self.id.voice(),
                &VoiceUpdate {
                    waveform: Some(waveform),
                    ..Default::default()
                },
            );
        }
    }

    /// Push the new note to the voice. Glissoids only retarget their glide.
    fn retune(&mut self, mixer: &mut Mixer) {
        let target = frequency_of(self.current_note());
        if let VariantState::Glissoid {
            current_hz,
            target_hz,
            gliding,
        } = &mut self.state
        {
            *target_hz = target;
            *gliding = (target - *current_hz).abs() > GLIDE_EPSILON_HZ;
            return;
        }
        if self.is_playing_sound {
            mixer.update(
                self.id.voice(),
                &VoiceUpdate {
                    frequency: Some(target),
                    ..Default::default()
                },
            );
        }
    }

    // === Per-tick behavior ===

    /// Behavior run once per tick, before physics
    pub fn on_tick(&mut self, physics: &mut dyn Physics, mixer: &mut Mixer) {
        let Some(vel) = physics.velocity(self.body) else {
            return;
        };
        let grounded = vel.y.abs() < GROUNDED_SPEED;
        let mass = physics.mass(self.body);

        // March toward the exit while on the ground
        if grounded && !self.is_hovering() && vel.x * self.facing < WALK_SPEED {
            physics.apply_force(self.body, Vec2::new(self.facing * WALK_ACCEL * mass, 0.0));
        }

        let VariantState::Glissoid {
            current_hz,
            target_hz,
            gliding,
        } = &mut self.state
        else {
            return;
        };

        if *gliding {
            *current_hz += (*target_hz - *current_hz) * GLIDE_RATE;
            if (*target_hz - *current_hz).abs() < GLIDE_EPSILON_HZ {
                *current_hz = *target_hz;
                *gliding = false;
            }
            if self.is_playing_sound {
                mixer.update(
                    self.id.voice(),
                    &VoiceUpdate {
                        frequency: Some(*current_hz),
                        ..Default::default()
                    },
                );
            }
        }

        // Slope assist keeps grounded glissoids rolling
        if grounded && vel.x.abs() > 1.0 {
            physics.apply_force(self.body, Vec2::new(vel.x.signum() * SLOPE_ASSIST_ACCEL * mass, 0.0));
        }
    }

    /// Variant response to a collision start
    pub fn on_collision(&mut self, impact: Impact, now: f64, mixer: &mut Mixer) -> Option<Reaction> {
        // Turn around at walls
        if impact.normal.x * self.facing > WALL_NORMAL_X {
            self.facing = -self.facing;
        }

        match &mut self.state {
            VariantState::Bassoid { pulse_until } => {
                if impact.surface && impact.is_landing() && impact.speed >= BASSOID_IMPACT_SPEED {
                    *pulse_until = now + BASSOID_PULSE_DURATION;
                    return Some(Reaction::Pulse);
                }
                None
            }
            VariantState::Percussoid { last_trigger } => {
                if !impact.is_landing() || impact.speed < PERCUSSOID_IMPACT_SPEED {
                    return None;
                }
                if last_trigger.is_some_and(|t| now - t < PERCUSSOID_DEBOUNCE) {
                    return None;
                }
                *last_trigger = Some(now);
                if self.is_muted || self.is_implicitly_muted {
                    return None;
                }
                let request = self.voice_request();
                mixer.play_one_shot(&request, now);
                Some(Reaction::Percussion)
            }
            _ => None,
        }
    }

    /// Re-evaluate Droneoid hover after a mute/solo change.
    ///
    /// Returns true if the hover state flipped.
    pub fn update_hover(&mut self, physics: &mut dyn Physics) -> bool {
        let want = self.is_soloed && self.is_muted;
        let VariantState::Droneoid { hovering } = &mut self.state else {
            return false;
        };
        if *hovering == want {
            return false;
        }
        *hovering = want;
        physics.set_static(self.body, want);
        if !want {
            physics.set_velocity(self.body, Vec2::ZERO);
        }
        log::debug!("Droneoid {:?} hover {}", self.id, if want { "on" } else { "off" });
        true
    }

    /// Silence and release the body. Consumes the entity.
    pub fn destroy(mut self, physics: &mut dyn Physics, mixer: &mut Mixer) {
        self.stop_sound(mixer);
        physics.remove_body(self.body);
    }
}
