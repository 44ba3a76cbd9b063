//! Fixed-order simulation tick
//!
//! Advances a [`Simulation`] by one frame. Stages always run in the same
//! order: procession spawns, entity behavior, out-of-bounds removal,
//! mechanic updates, physics and collision dispatch, harmony, membership
//! interactions, end condition.

use glam::Vec2;

use super::controller::{BodyOwner, Simulation};
use super::entity::{EntityId, Impact, Reaction};
use super::level::LevelSource;
use super::mechanics::{Context, MechanicId, MechanicKind, ObstacleKind, Occupant, try_teleport};
use super::physics::BodyHandle;
use super::state::{Fate, GameEvent, GameMode, GamePhase};
use crate::Rect;
use crate::audio::Waveform;
use crate::consts::*;
use crate::music::{Mode, aggregate_harmony};

/// A player or host command, applied at the start of a tick
#[derive(Debug, Clone)]
pub enum Command {
    /// Start from pending, or reload a finished level
    Start,
    TogglePause,
    Restart,
    Load(LevelSource),
    /// Select (or place an armed resonance field) at a world point
    Click { point: Vec2, extend: bool },
    ClearSelection,
    /// Semitones, applied to the selection
    ShiftPitch(i32),
    ToggleMute,
    ToggleSolo,
    SetWaveform(Waveform),
    SetArpeggio(i32),
    SetTempo(f32),
    ShiftKey(i32),
    SetKey { name: String, mode: Mode },
    ToggleQuantize,
    ToggleMode,
    ManualDrop,
    ArmResonanceField,
    PlaceResonanceField(Vec2),
}

/// Input commands for a single tick
#[derive(Debug, Clone, Default)]
pub struct TickInput {
    pub commands: Vec<Command>,
}

impl TickInput {
    pub fn with(command: Command) -> Self {
        Self {
            commands: vec![command],
        }
    }
}

/// What an entity touched
enum Touch {
    Exit,
    Portal,
    Solid,
    Passable,
}

/// Advance the simulation by one frame of `dt` real seconds
pub fn tick(sim: &mut Simulation, input: &TickInput, dt: f32) {
    for command in &input.commands {
        sim.apply_command(command);
    }

    if sim.session.phase != GamePhase::Playing {
        sim.push_hud();
        return;
    }

    // Clamp first, then scale: tempo speeds up game time, not the clamp
    let dt = dt.clamp(0.0, sim.settings.max_frame_dt) * sim.session.tempo;
    if dt <= 0.0 {
        sim.push_hud();
        return;
    }
    sim.clock += f64::from(dt);

    sim.advance_procession(dt);
    sim.update_entities();
    sim.remove_out_of_bounds();
    if sim.session.phase == GamePhase::Playing {
        sim.update_mechanics(dt);
        sim.step_physics(dt);
    }
    if sim.session.phase == GamePhase::Playing {
        sim.update_harmony();
        sim.run_interactions(dt);
        sim.check_end_condition();
    }
    sim.mixer.expire(sim.clock);
    sim.retry_voices();
    sim.sync_entity_displays();
    sim.push_hud();
}

impl Simulation {
    pub fn apply_command(&mut self, command: &Command) {
        match command {
            Command::Start => self.start(),
            Command::TogglePause => self.toggle_pause(),
            Command::Restart => self.restart(),
            Command::Load(source) => self.load(source),
            Command::Click { point, extend } => self.click(*point, *extend),
            Command::ClearSelection => self.clear_selection(),
            Command::ShiftPitch(semitones) => self.shift_pitch_selection(*semitones),
            Command::ToggleMute => self.toggle_mute_selection(),
            Command::ToggleSolo => self.toggle_solo_selection(),
            Command::SetWaveform(waveform) => self.set_waveform_selection(*waveform),
            Command::SetArpeggio(offset) => self.set_arpeggio_selection(*offset),
            Command::SetTempo(tempo) => self.set_tempo(*tempo),
            Command::ShiftKey(semitones) => self.shift_key(*semitones),
            Command::SetKey { name, mode } => self.set_key(name, *mode),
            Command::ToggleQuantize => self.toggle_quantize(),
            Command::ToggleMode => self.toggle_mode(),
            Command::ManualDrop => {
                self.manual_drop();
            }
            Command::ArmResonanceField => {
                self.arm_resonance_field();
            }
            Command::PlaceResonanceField(point) => {
                self.place_resonance_field(*point);
            }
        }
    }

    /// Snapshots of every entity touching `region`
    pub fn entities_overlapping(&self, region: Rect) -> Vec<Occupant> {
        self.entities
            .iter()
            .filter_map(|h| Occupant::of(h, self.physics.as_ref()))
            .filter(|o| region.overlaps_circle(o.position, HARMONOID_RADIUS))
            .collect()
    }

    /// Spawn every procession entry that has come due. The timer is never
    /// reset, so a long frame spawns several entries without drift.
    fn advance_procession(&mut self, dt: f32) {
        if self.session.mode != GameMode::Procession {
            return;
        }
        self.procession_timer += f64::from(dt);
        loop {
            let Some(entry) = self
                .level
                .as_ref()
                .and_then(|l| l.procession_spawns.get(self.next_spawn))
                .cloned()
            else {
                break;
            };
            if entry.time > self.procession_timer {
                break;
            }
            self.next_spawn += 1;
            let position = (entry.x.is_some() || entry.y.is_some()).then(|| {
                Vec2::new(
                    entry.x.unwrap_or(self.spawn_point.x),
                    entry.y.unwrap_or(self.spawn_point.y),
                )
            });
            self.spawn(entry.variant, position);
        }
    }

    fn update_entities(&mut self) {
        for h in &mut self.entities {
            h.on_tick(self.physics.as_mut(), &mut self.mixer);
        }
    }

    fn remove_out_of_bounds(&mut self) {
        let (w, h) = (self.settings.world_width, self.settings.world_height);
        let outside = |p: Vec2| {
            p.x < -OUT_OF_BOUNDS_MARGIN
                || p.x > w + OUT_OF_BOUNDS_MARGIN
                || p.y > h + OUT_OF_BOUNDS_MARGIN
                || p.y < -OUT_OF_BOUNDS_TOP
        };
        let gone: Vec<EntityId> = self
            .entities
            .iter()
            .filter(|e| self.physics.position(e.body).is_some_and(outside))
            .map(|e| e.id)
            .collect();
        for id in gone {
            log::debug!("Harmonoid {:?} left the world", id);
            self.mark(id, Fate::Lost);
        }
        self.apply_fates();
    }

    fn update_mechanics(&mut self, dt: f32) {
        let occupants: Vec<Vec<Occupant>> = self
            .mechanics
            .iter()
            .map(|m| self.entities_overlapping(m.interaction_region()))
            .collect();
        let mut effects = Vec::new();
        let mut ctx = Context {
            now: self.clock,
            dt,
            root: self.key.root,
            quantize: self.session.quantize,
            gate_interval: self.settings.gate_check_interval,
            physics: self.physics.as_mut(),
            rng: &mut self.rng,
        };
        for (m, occupants) in self.mechanics.iter_mut().zip(&occupants) {
            m.update(occupants, &mut ctx, &mut effects);
        }
        self.apply_effects(effects);
    }

    /// Step in bounded substeps, then route collision starts to their owners
    fn step_physics(&mut self, dt: f32) {
        let steps = (dt / MAX_PHYSICS_STEP).ceil().max(1.0) as u32;
        let step = dt / steps as f32;
        for _ in 0..steps {
            self.physics.step(step);
        }

        for event in self.physics.drain_collisions() {
            for body in [event.a, event.b] {
                let Some(BodyOwner::Entity(id)) = self.owners.get(&body).copied() else {
                    continue;
                };
                if let Some((other, normal)) = event.seen_from(body) {
                    self.entity_contact(id, other, normal, event.relative_speed);
                }
            }
        }
        self.apply_fates();
    }

    fn entity_contact(&mut self, id: EntityId, other: BodyHandle, normal: Vec2, speed: f32) {
        if self.is_marked(id) {
            return;
        }
        let surface = match self.owners.get(&other).copied() {
            None => return,
            Some(BodyOwner::KillZone) => {
                self.mark(id, Fate::Lost);
                return;
            }
            Some(BodyOwner::Wall) | Some(BodyOwner::Entity(_)) => false,
            Some(BodyOwner::Mechanic(mechanic)) => match self.touch(mechanic, other) {
                Touch::Exit => {
                    self.mark(id, Fate::Saved);
                    return;
                }
                Touch::Portal => {
                    self.enter_portal(id, mechanic);
                    return;
                }
                Touch::Solid => true,
                Touch::Passable => return,
            },
        };

        let now = self.clock;
        let Some(h) = self.entities.iter_mut().find(|h| h.id == id) else {
            return;
        };
        let impact = Impact { normal, speed, surface };
        match h.on_collision(impact, now, &mut self.mixer) {
            Some(Reaction::Pulse) => self.bassoid_pulse(id),
            Some(Reaction::Percussion) => self.trigger_rhythm_pads(id),
            None => {}
        }
    }

    /// Classify a contact with one of a mechanic's bodies. Touching a gate
    /// asks it to listen.
    fn touch(&mut self, mechanic: MechanicId, body: BodyHandle) -> Touch {
        let Some(m) = self.mechanics.iter_mut().find(|m| m.id == mechanic) else {
            return Touch::Passable;
        };
        if let MechanicKind::HarmonicGate(g) = &mut m.kind {
            g.request_check();
        }
        match &m.kind {
            MechanicKind::ExitZone { .. } => Touch::Exit,
            MechanicKind::PhaseShiftPortal(_) => Touch::Portal,
            // The bridge sensor band is never something to land on
            MechanicKind::FrequencyBridge(b) if body != b.platform => Touch::Passable,
            _ if m.is_surface() => Touch::Solid,
            _ => Touch::Passable,
        }
    }

    fn enter_portal(&mut self, id: EntityId, portal: MechanicId) {
        let Some(occupant) = self.entity(id).and_then(|h| Occupant::of(h, self.physics.as_ref())) else {
            return;
        };
        let cooldown = self.settings.portal_cooldown;
        if let Some(effect) = try_teleport(&mut self.mechanics, portal, &occupant, self.clock, cooldown) {
            self.apply_effects(vec![effect]);
        }
    }

    /// Kick nearby low-frequency plates outward and upward
    fn bassoid_pulse(&mut self, id: EntityId) {
        let Some(origin) = self.entity_position(id) else {
            return;
        };
        let plates: Vec<BodyHandle> = self
            .mechanics
            .iter()
            .filter_map(|m| match &m.kind {
                MechanicKind::Obstacle(o) if o.kind == ObstacleKind::LowFreqPlate => Some(o.body),
                _ => None,
            })
            .collect();

        let mut shaken = 0;
        for body in plates {
            let (Some(pos), Some(vel)) = (self.physics.position(body), self.physics.velocity(body)) else {
                continue;
            };
            let offset = pos - origin;
            let distance = offset.length();
            if distance > BASSOID_PULSE_RADIUS {
                continue;
            }
            let dir = Vec2::new(offset.normalize_or_zero().x, -1.0).normalize();
            let kick = BASSOID_PULSE_STRENGTH / distance.max(BASSOID_PULSE_MIN_DISTANCE);
            self.physics.set_velocity(body, vel + dir * kick);
            shaken += 1;
        }
        log::debug!("Bassoid {:?} pulse shook {} plate(s)", id, shaken);
        self.emit(GameEvent::BassoidPulse {
            entity: id,
            plates: shaken,
        });
    }

    fn trigger_rhythm_pads(&mut self, id: EntityId) {
        let Some(origin) = self.entity_position(id) else {
            return;
        };
        let mut triggered = Vec::new();
        for m in &mut self.mechanics {
            if let MechanicKind::Obstacle(o) = &mut m.kind {
                if o.kind == ObstacleKind::RhythmPad && m.region.overlaps_circle(origin, PERCUSSOID_TRIGGER_RADIUS) {
                    o.hits += 1;
                    triggered.push(m.id);
                }
            }
        }
        for pad in triggered {
            log::debug!("Rhythm pad {:?} triggered by {:?}", pad, id);
            self.emit(GameEvent::RhythmPadTriggered { pad, by: id });
        }
    }

    /// Sustained voices refused at the ceiling get another go once there is room
    fn retry_voices(&mut self) {
        for h in &mut self.entities {
            if !self.mixer.has_free_voice() {
                break;
            }
            if h.audible() && !h.is_playing_sound && h.variant().sustains() {
                h.start_sound(&mut self.mixer);
            }
        }
    }

    fn update_harmony(&mut self) {
        let notes: Vec<i32> = self
            .entities
            .iter()
            .filter(|h| h.audible())
            .map(|h| h.current_note())
            .collect();
        self.harmony = aggregate_harmony(&notes);
        self.mixer.set_harmony_mix(self.harmony);
    }

    fn run_interactions(&mut self, dt: f32) {
        let occupants: Vec<Vec<Occupant>> = self
            .mechanics
            .iter()
            .map(|m| self.entities_overlapping(m.interaction_region()))
            .collect();
        let mut effects = Vec::new();
        let mut ctx = Context {
            now: self.clock,
            dt,
            root: self.key.root,
            quantize: self.session.quantize,
            gate_interval: self.settings.gate_check_interval,
            physics: self.physics.as_mut(),
            rng: &mut self.rng,
        };
        for (m, occupants) in self.mechanics.iter_mut().zip(&occupants) {
            m.interact(occupants, &mut ctx, &mut effects);
        }
        self.apply_effects(effects);
    }
}
