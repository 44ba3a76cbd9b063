//! Simulation controller
//!
//! Owns the physics world, the mixer, every entity and mechanic, and the
//! session. Everything else refers to entities and mechanics by id; physics
//! bodies map back to their owner through a single lookup table.

use std::collections::BTreeMap;

use glam::Vec2;
use rand::Rng;
use rand_pcg::Pcg32;

use super::entity::{EntityId, Harmonoid, Variant};
use super::level::{Level, LevelSource};
use super::mechanics::{Effect, Mechanic, MechanicId, MechanicKind};
use super::physics::{BodyHandle, BodyOptions, Physics};
use super::state::{Fate, GameEvent, GameMode, GamePhase, RngState, Session, evaluate_outcome};
use crate::audio::{Mixer, Waveform};
use crate::consts::*;
use crate::music::{Key, Mode, pitch_class};
use crate::render::{DisplayKey, Displayable, Hud, HudStats, LogHud, MechanicDisplay, NullRenderer, Renderer};
use crate::{Rect, Settings};

/// Extra pick radius around a Harmonoid for selection clicks
const SELECT_TOLERANCE: f32 = 4.0;

/// Who a physics body belongs to
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BodyOwner {
    Entity(EntityId),
    Mechanic(MechanicId),
    Wall,
    /// Bottom boundary: touching it loses the entity
    KillZone,
}

/// Last values pushed to the HUD
#[derive(Debug, Default)]
struct HudCache {
    stats: Option<HudStats>,
    fields: Option<(u32, u32)>,
    tempo: Option<f32>,
    phase: Option<GamePhase>,
    quantize: Option<bool>,
    mechanics: BTreeMap<MechanicId, MechanicDisplay>,
}

/// A running level session
pub struct Simulation {
    pub(super) settings: Settings,
    pub(super) physics: Box<dyn Physics>,
    pub(super) mixer: Mixer,
    pub(super) renderer: Box<dyn Renderer>,
    pub(super) hud: Box<dyn Hud>,
    pub(super) rng: Pcg32,
    pub(super) key: Key,
    pub(super) level: Option<Level>,
    pub(super) session: Session,
    /// Tempo-scaled game time (seconds)
    pub(super) clock: f64,
    pub(super) procession_timer: f64,
    /// Index of the next procession entry
    pub(super) next_spawn: usize,
    /// Live entities, ordered by id
    pub(super) entities: Vec<Harmonoid>,
    pub(super) mechanics: Vec<Mechanic>,
    pub(super) owners: BTreeMap<BodyHandle, BodyOwner>,
    pub(super) harmony: f32,
    next_entity: u32,
    next_mechanic: u32,
    pub(super) spawn_point: Vec2,
    /// Removals collected during a pass; the first fate recorded wins
    fates: Vec<(EntityId, Fate)>,
    events: Vec<GameEvent>,
    hud_cache: HudCache,
}

impl Simulation {
    /// Empty simulation; call [`Simulation::load`] before starting
    pub fn new(settings: Settings, physics: Box<dyn Physics>, mut mixer: Mixer) -> Self {
        mixer.set_master_volume(settings.master_volume);
        let rng = RngState::new(settings.seed).to_rng();
        let session = Session::new(settings.resonance_fields);
        Self {
            settings,
            physics,
            mixer,
            renderer: Box::new(NullRenderer),
            hud: Box::new(LogHud),
            rng,
            key: Key::default(),
            level: None,
            session,
            clock: 0.0,
            procession_timer: 0.0,
            next_spawn: 0,
            entities: Vec::new(),
            mechanics: Vec::new(),
            owners: BTreeMap::new(),
            harmony: NEUTRAL_HARMONY,
            next_entity: 1,
            next_mechanic: 1,
            spawn_point: Vec2::ZERO,
            fates: Vec::new(),
            events: Vec::new(),
            hud_cache: HudCache::default(),
        }
    }

    pub fn with_renderer(mut self, renderer: Box<dyn Renderer>) -> Self {
        self.renderer = renderer;
        self
    }

    pub fn with_hud(mut self, hud: Box<dyn Hud>) -> Self {
        self.hud = hud;
        self
    }

    // === Queries ===

    pub fn phase(&self) -> GamePhase {
        self.session.phase
    }

    pub fn session(&self) -> &Session {
        &self.session
    }

    pub fn settings(&self) -> &Settings {
        &self.settings
    }

    pub fn level(&self) -> Option<&Level> {
        self.level.as_ref()
    }

    pub fn key(&self) -> Key {
        self.key
    }

    pub fn clock(&self) -> f64 {
        self.clock
    }

    /// Aggregate harmony of every audible entity, as of the last tick
    pub fn harmony(&self) -> f32 {
        self.harmony
    }

    pub fn entities(&self) -> &[Harmonoid] {
        &self.entities
    }

    pub fn entity(&self, id: EntityId) -> Option<&Harmonoid> {
        self.entities.iter().find(|h| h.id == id)
    }

    pub fn mechanics(&self) -> &[Mechanic] {
        &self.mechanics
    }

    pub fn mechanic(&self, id: MechanicId) -> Option<&Mechanic> {
        self.mechanics.iter().find(|m| m.id == id)
    }

    pub fn physics(&self) -> &dyn Physics {
        self.physics.as_ref()
    }

    pub fn mixer(&self) -> &Mixer {
        &self.mixer
    }

    pub fn body_owner(&self, body: BodyHandle) -> Option<BodyOwner> {
        self.owners.get(&body).copied()
    }

    pub fn entity_position(&self, id: EntityId) -> Option<Vec2> {
        self.physics.position(self.entity(id)?.body)
    }

    /// Take every event emitted since the last call
    pub fn drain_events(&mut self) -> Vec<GameEvent> {
        std::mem::take(&mut self.events)
    }

    pub(super) fn emit(&mut self, event: GameEvent) {
        self.events.push(event);
    }

    // === Level lifecycle ===

    /// Replace the current level. The source is resolved first, so a bad
    /// document falls back to the bundled level instead of leaving a
    /// half-built world.
    pub fn load(&mut self, source: &LevelSource) {
        let level = source.resolve_or_bundled();
        self.teardown();
        self.build(level);
    }

    /// Reload the current level (the bundled one if none is loaded)
    pub fn reload(&mut self) {
        let source = match self.level.take() {
            Some(level) => LevelSource::Document(Box::new(level)),
            None => LevelSource::Bundled,
        };
        self.load(&source);
    }

    fn teardown(&mut self) {
        for h in std::mem::take(&mut self.entities) {
            self.renderer.remove(DisplayKey::Entity(h.id));
            h.destroy(self.physics.as_mut(), &mut self.mixer);
        }
        for m in std::mem::take(&mut self.mechanics) {
            self.renderer.remove(DisplayKey::Mechanic(m.id));
            m.release(self.physics.as_mut());
        }
        self.physics.clear();
        self.mixer.stop_all();
        self.owners.clear();
        self.fates.clear();
    }

    fn build(&mut self, level: Level) {
        let mut key = Key::default();
        key.set(&level.key, level.mode);
        self.key = key;
        self.session = Session::new(self.settings.resonance_fields);
        self.rng = RngState::new(self.settings.seed).to_rng();
        self.clock = 0.0;
        self.procession_timer = 0.0;
        self.next_spawn = 0;
        self.harmony = NEUTRAL_HARMONY;
        self.hud_cache = HudCache::default();

        self.build_bounds();

        for r in &level.platforms {
            let rect = r.rect();
            self.add_mechanic(|id, p| Mechanic::platform(id, rect, p));
        }
        for o in &level.obstacles {
            self.add_mechanic(|id, p| Mechanic::obstacle(id, o.rect.rect(), o.kind, p));
        }
        let start = level.start_zone.rect();
        self.add_mechanic(|id, _| Mechanic::start_zone(id, start));
        self.add_mechanic(|id, p| Mechanic::exit_zone(id, level.exit_zone.rect(), p));
        for g in &level.harmonic_gates {
            self.add_mechanic(|id, p| {
                Mechanic::harmonic_gate(
                    id,
                    g.rect.rect(),
                    g.required_chord_notes.clone(),
                    g.options.is_relative_chord,
                    p,
                )
            });
        }
        for z in &level.dissonance_zones {
            self.add_mechanic(|id, p| Mechanic::dissonance_zone(id, z.rect(), p));
        }
        for b in &level.frequency_bridges {
            self.add_mechanic(|id, p| {
                Mechanic::frequency_bridge(id, b.rect.rect(), b.required_triad.clone(), b.is_relative_chord, p)
            });
        }
        for f in &level.amplitude_fans {
            self.add_mechanic(|id, p| Mechanic::amplitude_fan(id, f.rect.rect(), f.lift_force, p));
        }
        for pair in &level.phase_shift_portals {
            let freq = pair.teleport_target_frequency;
            let a = self.add_mechanic(|id, p| Mechanic::portal(id, pair.portal_a.rect(), pair.id.as_str(), freq, p));
            let b = self.add_mechanic(|id, p| Mechanic::portal(id, pair.portal_b.rect(), pair.id.as_str(), freq, p));
            self.link_portals(a, b);
        }
        for e in &level.echo_chambers {
            self.add_mechanic(|id, p| {
                Mechanic::echo_chamber(id, e.rect.rect(), e.delay_time, e.feedback, e.max_echoes, p)
            });
        }

        self.spawn_point = start.center();
        log::info!(
            "Loaded level {:?}: {} mechanics, {} scheduled spawns, key root {}",
            level.name,
            self.mechanics.len(),
            level.procession_spawns.len(),
            self.key.root
        );
        self.emit(GameEvent::LevelLoaded {
            name: level.name.clone(),
        });
        self.level = Some(level);
        self.push_hud();
    }

    fn build_bounds(&mut self) {
        let (w, h, t) = (self.settings.world_width, self.settings.world_height, BOUNDS_THICKNESS);
        let walls = [
            Rect::new(-t, -t, t, h + 2.0 * t),
            Rect::new(w, -t, t, h + 2.0 * t),
            Rect::new(0.0, -t, w, t),
        ];
        for rect in walls {
            let body = self.physics.add_static_body(rect, BodyOptions::default());
            self.owners.insert(body, BodyOwner::Wall);
        }
        let floor = self
            .physics
            .add_static_body(Rect::new(-t, h, w + 2.0 * t, t), BodyOptions::sensor());
        self.owners.insert(floor, BodyOwner::KillZone);
    }

    fn link_portals(&mut self, a: MechanicId, b: MechanicId) {
        for (from, to) in [(a, b), (b, a)] {
            if let Some(Mechanic {
                kind: MechanicKind::PhaseShiftPortal(p),
                ..
            }) = self.mechanics.iter_mut().find(|m| m.id == from)
            {
                p.link = Some(to);
            }
        }
    }

    pub(super) fn add_mechanic(&mut self, build: impl FnOnce(MechanicId, &mut dyn Physics) -> Mechanic) -> MechanicId {
        let id = MechanicId(self.next_mechanic);
        self.next_mechanic += 1;
        let mechanic = build(id, self.physics.as_mut());
        for body in mechanic.bodies() {
            self.owners.insert(body, BodyOwner::Mechanic(id));
        }
        let shown = mechanic.displayable(self.renderer.as_ref(), self.key.root);
        self.renderer.add(DisplayKey::Mechanic(id), shown);
        self.mechanics.push(mechanic);
        id
    }

    pub(super) fn remove_mechanic(&mut self, id: MechanicId) {
        let Some(index) = self.mechanics.iter().position(|m| m.id == id) else {
            return;
        };
        let mechanic = self.mechanics.remove(index);
        for body in mechanic.bodies() {
            self.owners.remove(&body);
        }
        self.renderer.remove(DisplayKey::Mechanic(id));
        self.hud_cache.mechanics.remove(&id);
        mechanic.release(self.physics.as_mut());
    }

    /// Re-announce a mechanic whose drawable state changed
    pub(super) fn refresh_mechanic(&mut self, id: MechanicId) {
        if let Some(m) = self.mechanic(id) {
            let shown = m.displayable(self.renderer.as_ref(), self.key.root);
            self.renderer.add(DisplayKey::Mechanic(id), shown);
        }
    }

    // === Entities ===

    /// Create a Harmonoid at `position` (the start zone center by default).
    ///
    /// Returns `None` when the live entity ceiling is reached.
    pub fn spawn(&mut self, variant: Variant, position: Option<Vec2>) -> Option<EntityId> {
        if self.entities.len() >= self.settings.max_entities {
            log::warn!(
                "Max entity count ({}) reached, refusing {}",
                self.settings.max_entities,
                variant.label()
            );
            self.session.rejected += 1;
            self.emit(GameEvent::SpawnRejected { variant });
            return None;
        }

        let position = position.unwrap_or(self.spawn_point);
        let degree = self.rng.random_range(0..7);
        let note = self.key.scale_note(degree) + variant.note_shift();
        let body = self.physics.add_dynamic_circle(
            position,
            HARMONOID_RADIUS,
            BodyOptions {
                sensor: false,
                mass: variant.mass(),
                friction: variant.friction(),
            },
        );
        let id = EntityId(self.next_entity);
        self.next_entity += 1;
        self.owners.insert(body, BodyOwner::Entity(id));

        let mut h = Harmonoid::new(id, variant, note, body);
        // Newcomers join a running solo as implicitly muted
        let soloing = self.entities.iter().any(|e| e.is_soloed);
        h.set_implicitly_muted(soloing, &mut self.mixer);
        self.entities.push(h);
        self.session.total_spawned += 1;
        self.refresh_entity(id);

        log::debug!("Spawned {} {:?} at {:?}, note {}", variant.label(), id, position, note);
        self.emit(GameEvent::Spawned { id, variant });
        Some(id)
    }

    fn entity_displayable(&self, h: &Harmonoid) -> Option<Displayable> {
        Some(Displayable::Harmonoid {
            center: self.physics.position(h.body)?,
            radius: HARMONOID_RADIUS,
            variant: h.variant(),
            color: self.renderer.color_for_pitch_class(pitch_class(h.current_note())),
            selected: h.selected,
        })
    }

    fn refresh_entity(&mut self, id: EntityId) {
        let shown = self.entity(id).and_then(|h| self.entity_displayable(h));
        if let Some(shown) = shown {
            self.renderer.add(DisplayKey::Entity(id), shown);
        }
    }

    /// Push every entity's current position and color to the renderer
    pub(super) fn sync_entity_displays(&mut self) {
        let shown: Vec<(EntityId, Displayable)> = self
            .entities
            .iter()
            .filter_map(|h| Some((h.id, self.entity_displayable(h)?)))
            .collect();
        for (id, d) in shown {
            self.renderer.add(DisplayKey::Entity(id), d);
        }
    }

    /// Schedule an entity for removal at the end of the current pass
    pub(super) fn mark(&mut self, id: EntityId, fate: Fate) {
        if !self.is_marked(id) {
            self.fates.push((id, fate));
        }
    }

    pub(super) fn is_marked(&self, id: EntityId) -> bool {
        self.fates.iter().any(|(e, _)| *e == id)
    }

    /// Remove every marked entity, then evaluate the end condition
    pub(super) fn apply_fates(&mut self) {
        if self.fates.is_empty() {
            return;
        }
        let mut solo_released = false;
        for (id, fate) in std::mem::take(&mut self.fates) {
            let Some(index) = self.entities.iter().position(|h| h.id == id) else {
                continue;
            };
            let h = self.entities.remove(index);
            solo_released |= h.is_soloed;
            self.owners.remove(&h.body);
            self.session.selection.remove(&id);
            self.renderer.remove(DisplayKey::Entity(id));
            h.destroy(self.physics.as_mut(), &mut self.mixer);

            match fate {
                Fate::Saved => {
                    self.session.saved += 1;
                    log::info!("Harmonoid {:?} saved ({} so far)", id, self.session.saved);
                    self.emit(GameEvent::Saved(id));
                }
                Fate::Lost => {
                    self.session.lost += 1;
                    log::info!("Harmonoid {:?} lost ({} so far)", id, self.session.lost);
                    self.emit(GameEvent::Lost(id));
                }
            }
        }
        if solo_released {
            self.sync_implicit_mutes();
        }
        self.check_end_condition();
    }

    pub(super) fn check_end_condition(&mut self) {
        if self.session.phase != GamePhase::Playing {
            return;
        }
        let Some(level) = &self.level else {
            return;
        };
        let exhausted = self.next_spawn >= level.procession_spawns.len();
        let attempted = self.session.total_spawned + self.session.rejected;
        if !exhausted || !self.entities.is_empty() || attempted == 0 {
            return;
        }
        let target = level.rescue_target_percentage;
        let outcome = evaluate_outcome(self.session.saved, self.session.total_spawned, target);
        log::info!(
            "Level over: {}/{} saved, target {:.0}%",
            self.session.saved,
            self.session.total_spawned,
            target * 100.0
        );
        self.set_phase(outcome);
    }

    pub(super) fn set_phase(&mut self, phase: GamePhase) {
        if self.session.phase == phase {
            return;
        }
        log::info!("Phase {:?} -> {:?}", self.session.phase, phase);
        self.session.phase = phase;
        self.emit(GameEvent::PhaseChanged(phase));
    }

    // === Phase control ===

    /// Begin play; from a finished level this reloads it first
    pub fn start(&mut self) {
        match self.session.phase {
            GamePhase::Pending => {}
            GamePhase::LevelComplete | GamePhase::GameOver => self.reload(),
            GamePhase::Playing | GamePhase::Paused => return,
        }
        self.mixer.resume();
        self.set_phase(GamePhase::Playing);
    }

    pub fn toggle_pause(&mut self) {
        match self.session.phase {
            GamePhase::Playing => {
                self.mixer.suspend();
                self.set_phase(GamePhase::Paused);
            }
            GamePhase::Paused => {
                self.mixer.resume();
                self.set_phase(GamePhase::Playing);
            }
            _ => {}
        }
    }

    /// Reload the current level and start playing it
    pub fn restart(&mut self) {
        self.reload();
        self.mixer.resume();
        self.set_phase(GamePhase::Playing);
    }

    // === Mute / solo ===

    /// Solo `targets`; every other non-soloed entity becomes implicitly muted
    pub fn apply_solo(&mut self, targets: &[EntityId]) {
        for h in self.entities.iter_mut().filter(|h| targets.contains(&h.id)) {
            h.set_soloed(true);
        }
        self.sync_implicit_mutes();
    }

    /// Unsolo `targets`; implicit mutes clear once nobody is soloed
    pub fn apply_unsolo(&mut self, targets: &[EntityId]) {
        for h in self.entities.iter_mut().filter(|h| targets.contains(&h.id)) {
            h.set_soloed(false);
        }
        self.sync_implicit_mutes();
    }

    fn sync_implicit_mutes(&mut self) {
        let soloing = self.entities.iter().any(|h| h.is_soloed);
        for h in &mut self.entities {
            h.set_implicitly_muted(soloing, &mut self.mixer);
            h.update_hover(self.physics.as_mut());
        }
    }

    pub fn set_muted(&mut self, targets: &[EntityId], muted: bool) {
        for h in self.entities.iter_mut().filter(|h| targets.contains(&h.id)) {
            if muted {
                h.mute(&mut self.mixer);
            } else {
                h.unmute(&mut self.mixer);
            }
            h.update_hover(self.physics.as_mut());
        }
    }

    /// Mute the selection unless all of it is already muted
    pub fn toggle_mute_selection(&mut self) {
        let ids = self.selected_ids();
        let mute = self.entities.iter().any(|h| ids.contains(&h.id) && !h.is_muted);
        self.set_muted(&ids, mute);
    }

    /// Solo the selection unless all of it is already soloed
    pub fn toggle_solo_selection(&mut self) {
        let ids = self.selected_ids();
        if self.entities.iter().any(|h| ids.contains(&h.id) && !h.is_soloed) {
            self.apply_solo(&ids);
        } else {
            self.apply_unsolo(&ids);
        }
    }

    // === Selection ===

    fn selected_ids(&self) -> Vec<EntityId> {
        self.session.selection.iter().copied().collect()
    }

    /// Closest entity whose body covers `point`
    pub fn entity_at(&self, point: Vec2) -> Option<EntityId> {
        self.entities
            .iter()
            .filter_map(|h| Some((h.id, self.physics.position(h.body)?.distance(point))))
            .filter(|(_, d)| *d <= HARMONOID_RADIUS + SELECT_TOLERANCE)
            .min_by(|a, b| a.1.total_cmp(&b.1))
            .map(|(id, _)| id)
    }

    /// Click at `point`. Places an armed resonance field, otherwise selects;
    /// `extend` toggles membership instead of replacing the selection.
    pub fn click(&mut self, point: Vec2, extend: bool) {
        if self.session.placing_field {
            self.session.placing_field = false;
            self.place_resonance_field(point);
            return;
        }
        match (self.entity_at(point), extend) {
            (Some(id), true) => {
                if !self.session.selection.remove(&id) {
                    self.session.selection.insert(id);
                }
            }
            (Some(id), false) => {
                self.session.selection.clear();
                self.session.selection.insert(id);
            }
            (None, true) => {}
            (None, false) => self.session.selection.clear(),
        }
        self.sync_selection();
    }

    /// Replace the selection
    pub fn select(&mut self, ids: &[EntityId]) {
        self.session.selection = ids
            .iter()
            .copied()
            .filter(|id| self.entities.iter().any(|h| h.id == *id))
            .collect();
        self.sync_selection();
    }

    pub fn clear_selection(&mut self) {
        self.session.selection.clear();
        self.sync_selection();
    }

    fn sync_selection(&mut self) {
        for h in &mut self.entities {
            h.selected = self.session.selection.contains(&h.id);
        }
        self.sync_entity_displays();
    }

    // === Musical actions ===

    pub fn shift_pitch_selection(&mut self, semitones: i32) {
        for h in self.entities.iter_mut().filter(|h| h.selected) {
            h.shift_pitch(semitones, &mut self.mixer);
        }
        self.request_gate_checks();
        self.sync_entity_displays();
    }

    pub fn set_arpeggio_selection(&mut self, offset: i32) {
        for h in self.entities.iter_mut().filter(|h| h.selected) {
            h.set_arpeggio_offset(offset, &mut self.mixer);
        }
        self.request_gate_checks();
        self.sync_entity_displays();
    }

    pub fn set_waveform_selection(&mut self, waveform: Waveform) {
        for h in self.entities.iter_mut().filter(|h| h.selected) {
            h.set_waveform(waveform, &mut self.mixer);
        }
    }

    pub fn set_tempo(&mut self, tempo: f32) {
        self.session.tempo = self.settings.clamp_tempo(tempo);
    }

    /// Transpose the key and every live entity
    pub fn shift_key(&mut self, semitones: i32) {
        if semitones == 0 {
            return;
        }
        self.key.shift(semitones);
        for h in &mut self.entities {
            h.transpose(semitones, &mut self.mixer);
        }
        log::info!("Key root now {}", self.key.root);
        self.request_gate_checks();
        let ids: Vec<MechanicId> = self.mechanics.iter().map(|m| m.id).collect();
        for id in ids {
            self.refresh_mechanic(id);
        }
        self.sync_entity_displays();
    }

    /// Change key by name; live entities move by the root difference
    pub fn set_key(&mut self, name: &str, mode: Mode) {
        let mut target = self.key;
        target.set(name, mode);
        self.key.mode = target.mode;
        self.shift_key(target.root - self.key.root);
    }

    pub fn toggle_quantize(&mut self) {
        self.session.quantize = !self.session.quantize;
    }

    pub fn toggle_mode(&mut self) {
        self.session.mode = match self.session.mode {
            GameMode::Procession => GameMode::Manual,
            GameMode::Manual => GameMode::Procession,
        };
        log::info!("Spawn mode {:?}", self.session.mode);
    }

    /// Drop a standard Harmonoid at the start zone (manual mode, while playing)
    pub fn manual_drop(&mut self) -> Option<EntityId> {
        if self.session.mode != GameMode::Manual || self.session.phase != GamePhase::Playing {
            log::debug!("Manual drop ignored in {:?} / {:?}", self.session.mode, self.session.phase);
            return None;
        }
        self.spawn(Variant::Standard, None)
    }

    fn request_gate_checks(&mut self) {
        for m in &mut self.mechanics {
            if let MechanicKind::HarmonicGate(g) = &mut m.kind {
                g.request_check();
            }
        }
    }

    // === Resonance fields ===

    /// Arm field placement for the next click
    pub fn arm_resonance_field(&mut self) -> bool {
        if self.session.fields_left == 0 {
            log::warn!("No resonance fields left to place");
            return false;
        }
        self.session.placing_field = true;
        true
    }

    pub fn place_resonance_field(&mut self, center: Vec2) -> Option<MechanicId> {
        if self.session.fields_left == 0 {
            log::warn!("No resonance fields left to place");
            return None;
        }
        self.session.fields_left -= 1;
        let rect = Rect::from_center(
            center,
            Vec2::new(self.settings.resonance_field_width, self.settings.resonance_field_height),
        );
        let lifetime = self.settings.resonance_field_lifetime;
        let id = self.add_mechanic(|id, p| Mechanic::resonance_field(id, rect, lifetime, p));
        log::info!(
            "Resonance field {:?} placed at {:?} ({} left)",
            id,
            center,
            self.session.fields_left
        );
        self.emit(GameEvent::FieldPlaced(id));
        Some(id)
    }

    // === Effects ===

    /// Carry out what a mechanic pass asked for
    pub(super) fn apply_effects(&mut self, effects: Vec<Effect>) {
        for effect in effects {
            match effect {
                Effect::Push { body, force } => self.physics.apply_force(body, force),
                Effect::Teleport {
                    entity,
                    body,
                    from,
                    to,
                    position,
                } => {
                    self.physics.set_position(body, position);
                    self.physics.set_velocity(body, Vec2::ZERO);
                    log::info!("Harmonoid {:?} teleported {:?} -> {:?}", entity, from, to);
                    self.emit(GameEvent::Teleported { entity, from, to });
                }
                Effect::Echo {
                    chamber,
                    source,
                    request,
                } => {
                    if self.mixer.play_one_shot(&request, self.clock).is_some() {
                        self.emit(GameEvent::EchoFired { chamber, source });
                    }
                }
                Effect::GateToggled { gate, open } => {
                    self.refresh_mechanic(gate);
                    self.emit(GameEvent::GateToggled { gate, open });
                }
                Effect::BridgeToggled { bridge, solid } => {
                    self.refresh_mechanic(bridge);
                    self.emit(GameEvent::BridgeToggled { bridge, solid });
                }
                Effect::FieldExpired { field } => {
                    log::info!("Resonance field {:?} expired", field);
                    self.remove_mechanic(field);
                    self.emit(GameEvent::FieldExpired(field));
                }
                Effect::DisplayChanged(id) => self.refresh_mechanic(id),
            }
        }
    }

    // === HUD ===

    /// Push whatever changed since the last push
    pub(super) fn push_hud(&mut self) {
        let stats = self.session.hud_stats();
        if self.hud_cache.stats != Some(stats) {
            self.hud.update_stats(&stats);
            self.hud_cache.stats = Some(stats);
        }
        let fields = (self.session.fields_left, self.session.fields_max);
        if self.hud_cache.fields != Some(fields) {
            self.hud.update_resonance_fields(fields.0, fields.1);
            self.hud_cache.fields = Some(fields);
        }
        if self.hud_cache.tempo != Some(self.session.tempo) {
            self.hud.update_tempo(self.session.tempo);
            self.hud_cache.tempo = Some(self.session.tempo);
        }
        if self.hud_cache.phase != Some(self.session.phase) {
            self.hud.update_phase(self.session.phase);
            self.hud_cache.phase = Some(self.session.phase);
        }
        if self.hud_cache.quantize != Some(self.session.quantize) {
            self.hud.update_quantize(self.session.quantize);
            self.hud_cache.quantize = Some(self.session.quantize);
        }
        for m in &self.mechanics {
            let Some(display) = m.display(self.key.root, self.clock) else {
                continue;
            };
            if self.hud_cache.mechanics.get(&m.id) != Some(&display) {
                self.hud.update_mechanic(m.id, &display);
                self.hud_cache.mechanics.insert(m.id, display);
            }
        }
    }
}

/// Test rig shared by the controller and tick tests
#[cfg(test)]
pub(crate) mod testing {
    use super::*;
    use crate::audio::testing::RecordingSink;
    use crate::render::testing::{RecordingHud, RecordingRenderer};
    use crate::sim::ArcadePhysics;

    pub struct Rig {
        pub sim: Simulation,
        pub sink: RecordingSink,
        pub hud: RecordingHud,
        pub renderer: RecordingRenderer,
    }

    pub fn rig_with(settings: Settings, level: Level) -> Rig {
        let sink = RecordingSink::default();
        let hud = RecordingHud::default();
        let renderer = RecordingRenderer::default();
        let physics = ArcadePhysics::new(settings.gravity);
        let mixer = Mixer::new(Box::new(sink.clone()), settings.max_voices, 1.0);
        let mut sim = Simulation::new(settings, Box::new(physics), mixer)
            .with_renderer(Box::new(renderer.clone()))
            .with_hud(Box::new(hud.clone()));
        sim.load(&LevelSource::Document(Box::new(level)));
        Rig {
            sim,
            sink,
            hud,
            renderer,
        }
    }

    pub fn rig(level: Level) -> Rig {
        rig_with(Settings::default(), level)
    }

    /// Fallback geometry with no scheduled spawns
    pub fn empty_level() -> Level {
        Level {
            procession_spawns: Vec::new(),
            ..Level::fallback()
        }
    }
}

#[cfg(test)]
mod tests {
    use super::testing::{empty_level, rig, rig_with};
    use super::*;
    use crate::audio::testing::SinkCall;
    use crate::sim::level::{GateDef, GateOptions, SpawnDef};

    #[test]
    fn test_load_builds_every_mechanic() {
        let r = rig(Level::bundled());
        let level = r.sim.level().unwrap();
        let expected = level.platforms.len()
            + level.obstacles.len()
            + 2
            + level.harmonic_gates.len()
            + level.dissonance_zones.len()
            + level.frequency_bridges.len()
            + level.amplitude_fans.len()
            + level.phase_shift_portals.len() * 2
            + level.echo_chambers.len();
        assert_eq!(r.sim.mechanics().len(), expected);
        assert_eq!(r.renderer.shown.borrow().len(), expected);
        assert_eq!(r.sim.phase(), GamePhase::Pending);
        assert_eq!(r.hud.phases.borrow().as_slice(), &[GamePhase::Pending]);

        // Portals come pre-linked in pairs
        let portals: Vec<&Mechanic> = r.sim.mechanics().iter().filter(|m| m.as_portal().is_some()).collect();
        assert_eq!(portals[0].as_portal().unwrap().link, Some(portals[1].id));
        assert_eq!(portals[1].as_portal().unwrap().link, Some(portals[0].id));
    }

    #[test]
    fn test_reload_replaces_world_atomically() {
        let mut r = rig(Level::bundled());
        r.sim.spawn(Variant::Standard, None);
        r.sim.load(&LevelSource::ShareCode("%%%".to_string()));
        // Broken share code falls back to the bundled level, fully rebuilt
        assert_eq!(r.sim.level().unwrap().name, Level::bundled().name);
        assert!(r.sim.entities().is_empty());
        assert_eq!(r.sim.session().total_spawned, 0);
        assert_eq!(r.sim.mixer().active_voices(), 0);
        let mechanic_keys = r
            .renderer
            .shown
            .borrow()
            .keys()
            .filter(|k| matches!(k, DisplayKey::Mechanic(_)))
            .count();
        assert_eq!(mechanic_keys, r.sim.mechanics().len());
        assert!(r.renderer.shown.borrow().keys().all(|k| matches!(k, DisplayKey::Mechanic(_))));
    }

    #[test]
    fn test_share_code_with_huge_chord_note_falls_back() {
        let hostile = Level {
            harmonic_gates: vec![GateDef {
                rect: Rect::new(300.0, 500.0, 20.0, 100.0).into(),
                required_chord_notes: vec![i32::MAX],
                options: GateOptions::default(),
            }],
            ..Level::fallback()
        };
        let code = hostile.to_share_code().unwrap();
        let mut r = rig(empty_level());
        r.sim.load(&LevelSource::ShareCode(code));
        let bundled = Level::bundled();
        assert_eq!(r.sim.level().unwrap().name, bundled.name);
        assert_eq!(
            r.sim.level().unwrap().harmonic_gates.len(),
            bundled.harmonic_gates.len()
        );
    }

    #[test]
    fn test_master_volume_comes_from_settings() {
        let settings = Settings {
            master_volume: 0.5,
            ..Settings::default()
        };
        let mut r = rig_with(settings, empty_level());
        let id = r.sim.spawn(Variant::Standard, None).unwrap();
        let volume = r.sim.entity(id).unwrap().volume;
        assert!((r.sink.plays()[0].1.volume - volume * 0.5).abs() < 1e-6);
    }

    #[test]
    fn test_spawn_uses_scale_notes_and_voices() {
        let mut r = rig(empty_level());
        let id = r.sim.spawn(Variant::Standard, None).unwrap();
        let h = r.sim.entity(id).unwrap();
        let offset = (h.current_note() - r.sim.key().root).rem_euclid(12);
        assert!(r.sim.key().mode.degrees().contains(&offset));
        assert!(h.is_playing_sound);
        assert_eq!(r.sink.plays().len(), 1);
        assert_eq!(r.sim.entity_position(id), Some(Level::fallback().start_zone.rect().center()));

        let bass = r.sim.spawn(Variant::Bassoid, None).unwrap();
        assert!(r.sim.entity(bass).unwrap().current_note() < r.sim.key().root - 12);
    }

    #[test]
    fn test_entity_ceiling_rejects_without_counting() {
        let settings = Settings {
            max_entities: 2,
            ..Settings::default()
        };
        let mut r = rig_with(settings, empty_level());
        assert!(r.sim.spawn(Variant::Standard, None).is_some());
        assert!(r.sim.spawn(Variant::Standard, None).is_some());
        assert!(r.sim.spawn(Variant::Droneoid, None).is_none());
        assert_eq!(r.sim.entities().len(), 2);
        assert_eq!(r.sim.session().total_spawned, 2);
        assert!(r.sim.drain_events().contains(&GameEvent::SpawnRejected {
            variant: Variant::Droneoid
        }));
    }

    #[test]
    fn test_solo_mutes_others_and_unsolo_restores() {
        let mut r = rig(empty_level());
        let a = r.sim.spawn(Variant::Standard, None).unwrap();
        let b = r.sim.spawn(Variant::Standard, None).unwrap();
        let c = r.sim.spawn(Variant::Standard, None).unwrap();

        r.sim.apply_solo(&[a]);
        assert!(r.sim.entity(a).unwrap().audible());
        assert!(r.sim.entity(b).unwrap().is_implicitly_muted);
        assert!(!r.sim.mixer().is_active(c.voice()));

        // Late arrivals join muted
        let d = r.sim.spawn(Variant::Standard, None).unwrap();
        assert!(r.sim.entity(d).unwrap().is_implicitly_muted);

        r.sim.apply_solo(&[b]);
        r.sim.apply_unsolo(&[a]);
        // b is still soloed, so a falls silent
        assert!(r.sim.entity(a).unwrap().is_implicitly_muted);
        assert!(r.sim.entity(b).unwrap().audible());

        r.sim.apply_unsolo(&[b]);
        for h in r.sim.entities() {
            assert!(h.audible());
            assert!(h.is_playing_sound);
        }
    }

    #[test]
    fn test_explicit_mute_survives_unsolo() {
        let mut r = rig(empty_level());
        let a = r.sim.spawn(Variant::Standard, None).unwrap();
        let b = r.sim.spawn(Variant::Standard, None).unwrap();
        r.sim.set_muted(&[b], true);
        r.sim.apply_solo(&[a]);
        r.sim.apply_unsolo(&[a]);
        let hb = r.sim.entity(b).unwrap();
        assert!(!hb.is_implicitly_muted);
        assert!(hb.is_muted);
        assert!(!hb.is_playing_sound);
    }

    #[test]
    fn test_droneoid_hovers_through_controller() {
        let mut r = rig(empty_level());
        let d = r.sim.spawn(Variant::Droneoid, None).unwrap();
        r.sim.select(&[d]);
        r.sim.toggle_solo_selection();
        r.sim.toggle_mute_selection();
        assert!(r.sim.entity(d).unwrap().is_hovering());
        r.sim.toggle_solo_selection();
        assert!(!r.sim.entity(d).unwrap().is_hovering());
    }

    #[test]
    fn test_click_selection() {
        let mut r = rig(empty_level());
        let a = r.sim.spawn(Variant::Standard, Some(Vec2::new(100.0, 100.0))).unwrap();
        let b = r.sim.spawn(Variant::Standard, Some(Vec2::new(300.0, 100.0))).unwrap();

        r.sim.click(Vec2::new(102.0, 98.0), false);
        assert!(r.sim.entity(a).unwrap().selected);
        r.sim.click(Vec2::new(300.0, 100.0), true);
        assert_eq!(r.sim.session().selection.len(), 2);
        r.sim.click(Vec2::new(300.0, 100.0), true);
        assert!(!r.sim.entity(b).unwrap().selected);
        r.sim.click(Vec2::new(600.0, 600.0), false);
        assert!(r.sim.session().selection.is_empty());

        let shown = r.renderer.shown.borrow();
        assert!(matches!(
            shown.get(&DisplayKey::Entity(a)),
            Some(Displayable::Harmonoid { selected: false, .. })
        ));
    }

    #[test]
    fn test_pitch_shift_applies_to_selection_only() {
        let mut r = rig(empty_level());
        let a = r.sim.spawn(Variant::Standard, Some(Vec2::new(100.0, 100.0))).unwrap();
        let b = r.sim.spawn(Variant::Standard, Some(Vec2::new(300.0, 100.0))).unwrap();
        let before_b = r.sim.entity(b).unwrap().current_note();
        let before_a = r.sim.entity(a).unwrap().current_note();
        r.sim.select(&[a]);
        r.sim.shift_pitch_selection(3);
        assert_eq!(r.sim.entity(a).unwrap().current_note(), before_a + 3);
        assert_eq!(r.sim.entity(b).unwrap().current_note(), before_b);

        r.sim.set_waveform_selection(Waveform::Square);
        assert_eq!(r.sim.entity(a).unwrap().waveform, Waveform::Square);
        assert!(r.sink.calls.borrow().iter().any(|c| matches!(
            c,
            SinkCall::Update(v, u) if *v == a.voice() && u.waveform == Some(Waveform::Square)
        )));
    }

    #[test]
    fn test_key_shift_transposes_everyone() {
        let mut r = rig(empty_level());
        let a = r.sim.spawn(Variant::Standard, None).unwrap();
        let before = r.sim.entity(a).unwrap().current_note();
        let root = r.sim.key().root;
        r.sim.shift_key(2);
        assert_eq!(r.sim.key().root, root + 2);
        assert_eq!(r.sim.entity(a).unwrap().current_note(), before + 2);

        r.sim.set_key("A", Mode::Minor);
        assert_eq!(r.sim.key().root, 69);
        assert_eq!(r.sim.key().mode, Mode::Minor);
        assert_eq!(r.sim.entity(a).unwrap().current_note(), before + 9);
    }

    #[test]
    fn test_resonance_field_budget() {
        let mut r = rig(empty_level());
        for _ in 0..3 {
            assert!(r.sim.place_resonance_field(Vec2::new(400.0, 300.0)).is_some());
        }
        assert!(r.sim.place_resonance_field(Vec2::new(400.0, 300.0)).is_none());
        assert!(!r.sim.arm_resonance_field());
        assert_eq!(r.sim.session().fields_left, 0);
        let fields = r
            .sim
            .mechanics()
            .iter()
            .filter(|m| matches!(m.kind, MechanicKind::ResonanceField(_)))
            .count();
        assert_eq!(fields, 3);
    }

    #[test]
    fn test_armed_click_places_field() {
        let mut r = rig(empty_level());
        assert!(r.sim.arm_resonance_field());
        r.sim.click(Vec2::new(500.0, 200.0), false);
        assert!(!r.sim.session().placing_field);
        assert_eq!(r.sim.session().fields_left, 2);
        let field = r.sim.mechanics().last().unwrap();
        assert_eq!(field.region.center(), Vec2::new(500.0, 200.0));
    }

    #[test]
    fn test_first_fate_wins_and_solo_is_released() {
        let level = Level {
            procession_spawns: vec![SpawnDef {
                time: 0.0,
                x: None,
                y: None,
                variant: Variant::Standard,
            }],
            ..Level::fallback()
        };
        let mut r = rig(level);
        r.sim.start();
        r.sim.next_spawn = 1;
        let a = r.sim.spawn(Variant::Standard, None).unwrap();
        let b = r.sim.spawn(Variant::Standard, None).unwrap();
        r.sim.apply_solo(&[a]);
        r.sim.mark(a, Fate::Saved);
        r.sim.mark(a, Fate::Lost);
        r.sim.apply_fates();

        assert_eq!(r.sim.session().saved, 1);
        assert_eq!(r.sim.session().lost, 0);
        assert!(r.sim.entity(b).unwrap().audible());
        assert!(r.renderer.removals.borrow().contains(&DisplayKey::Entity(a)));
        assert_eq!(r.sim.phase(), GamePhase::Playing);

        r.sim.mark(b, Fate::Lost);
        r.sim.apply_fates();
        // 1 of 2 saved meets the 50% target
        assert_eq!(r.sim.phase(), GamePhase::LevelComplete);
    }

    #[test]
    fn test_pause_and_start_transitions() {
        let mut r = rig(empty_level());
        r.sim.toggle_pause();
        assert_eq!(r.sim.phase(), GamePhase::Pending);
        r.sim.start();
        assert_eq!(r.sim.phase(), GamePhase::Playing);
        r.sim.toggle_pause();
        assert_eq!(r.sim.phase(), GamePhase::Paused);
        assert!(r.sink.calls.borrow().contains(&SinkCall::Suspend));
        r.sim.toggle_pause();
        assert_eq!(r.sim.phase(), GamePhase::Playing);

        r.sim.set_phase(GamePhase::GameOver);
        r.sim.session.saved = 3;
        r.sim.start();
        assert_eq!(r.sim.phase(), GamePhase::Playing);
        assert_eq!(r.sim.session().saved, 0);
    }

    #[test]
    fn test_manual_drop_requires_manual_mode() {
        let mut r = rig(empty_level());
        r.sim.start();
        assert!(r.sim.manual_drop().is_none());
        r.sim.toggle_mode();
        assert!(r.sim.manual_drop().is_some());
    }

    #[test]
    fn test_hud_pushes_only_on_change() {
        let mut r = rig(Level::bundled());
        let gates_reported = r.hud.mechanics.borrow().len();
        assert!(gates_reported > 0);
        r.sim.push_hud();
        r.sim.push_hud();
        assert_eq!(r.hud.stats.borrow().len(), 1);
        assert_eq!(r.hud.mechanics.borrow().len(), gates_reported);

        r.sim.set_tempo(10.0);
        r.sim.push_hud();
        assert_eq!(r.hud.tempos.borrow().last(), Some(&4.0));
    }
}
