//! Level furniture and musical obstacles
//!
//! Every mechanic owns a region and its own physics bodies. Mechanics never
//! own or mutate entities: they read [`Occupant`] snapshots and push
//! [`Effect`]s that the controller applies after the pass.

use std::collections::{BTreeMap, VecDeque};
use std::f32::consts::TAU;

use glam::Vec2;
use rand::Rng;
use rand_pcg::Pcg32;
use serde::{Deserialize, Serialize};

use super::entity::{EntityId, Harmonoid};
use super::physics::{BodyHandle, BodyOptions, Physics};
use crate::Rect;
use crate::audio::{VoiceRequest, Waveform};
use crate::consts::*;
use crate::music::{chord_label, chord_matches, dissonance, note_of, pitch_class, required_pitch_class};
use crate::render::{Color, Displayable, MechanicDisplay, Renderer};

/// Unique mechanic identifier
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct MechanicId(pub u32);

/// Snapshot of an entity taken for one evaluation
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Occupant {
    pub id: EntityId,
    pub body: BodyHandle,
    pub position: Vec2,
    pub note: i32,
    pub frequency: f32,
    pub waveform: Waveform,
    pub volume: f32,
    pub audible: bool,
    /// Audible and holding a sustained tone
    pub sounding: bool,
    pub mass: f32,
}

impl Occupant {
    pub fn of(h: &Harmonoid, physics: &dyn Physics) -> Option<Self> {
        let position = physics.position(h.body)?;
        Some(Self {
            id: h.id,
            body: h.body,
            position,
            note: h.current_note(),
            frequency: h.frequency(),
            waveform: h.waveform,
            volume: h.volume,
            audible: h.audible(),
            sounding: h.sounding(),
            mass: physics.mass(h.body),
        })
    }
}

fn audible_notes(occupants: &[Occupant]) -> Vec<i32> {
    occupants.iter().filter(|o| o.audible).map(|o| o.note).collect()
}

/// Outcome of a mechanic evaluation, applied by the controller
#[derive(Debug, Clone, PartialEq)]
pub enum Effect {
    /// Force on an entity body for the coming physics step
    Push { body: BodyHandle, force: Vec2 },
    Teleport {
        entity: EntityId,
        body: BodyHandle,
        from: MechanicId,
        to: MechanicId,
        position: Vec2,
    },
    /// Fire a delayed copy of a note as a one-shot voice
    Echo {
        chamber: MechanicId,
        source: EntityId,
        request: VoiceRequest,
    },
    GateToggled { gate: MechanicId, open: bool },
    BridgeToggled { bridge: MechanicId, solid: bool },
    FieldExpired { field: MechanicId },
    /// HUD-visible state changed
    DisplayChanged(MechanicId),
}

/// Shared inputs for one evaluation pass
pub struct Context<'a> {
    /// Simulation clock (seconds)
    pub now: f64,
    /// Tempo-scaled step
    pub dt: f32,
    /// Current key root for relative chords
    pub root: i32,
    pub quantize: bool,
    pub gate_interval: f64,
    pub physics: &'a mut dyn Physics,
    pub rng: &'a mut Pcg32,
}

/// Kind tag for static obstacles
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum ObstacleKind {
    /// Heavy plate shaken by Bassoid pulses
    LowFreqPlate,
    /// Pad triggered by Percussoid landings
    RhythmPad,
    #[default]
    #[serde(other)]
    Generic,
}

#[derive(Debug, Clone, PartialEq)]
pub struct Obstacle {
    pub body: BodyHandle,
    pub kind: ObstacleKind,
    /// Times a rhythm pad has been triggered
    pub hits: u32,
}

#[derive(Debug, Clone, PartialEq)]
pub struct HarmonicGate {
    pub barrier: BodyHandle,
    pub required: Vec<i32>,
    pub relative: bool,
    pub open: bool,
    next_check: f64,
    recheck: bool,
}

impl HarmonicGate {
    /// Ask for an evaluation on the next update regardless of the throttle
    pub fn request_check(&mut self) {
        self.recheck = true;
    }

    pub fn update(&mut self, id: MechanicId, occupants: &[Occupant], ctx: &mut Context, effects: &mut Vec<Effect>) {
        if !self.recheck && ctx.now < self.next_check {
            return;
        }
        self.recheck = false;
        self.next_check = ctx.now + ctx.gate_interval;

        let notes = audible_notes(occupants);
        let open = chord_matches(&notes, &self.required, self.relative, ctx.root);
        if open != self.open {
            self.open = open;
            ctx.physics.set_sensor(self.barrier, open);
            log::info!("Gate {:?} {}", id, if open { "opened" } else { "closed" });
            effects.push(Effect::GateToggled { gate: id, open });
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct DissonanceZone {
    pub body: BodyHandle,
    /// 0 (consonant) to 1 (dissonant)
    pub score: f32,
}

impl DissonanceZone {
    pub fn update(&mut self, id: MechanicId, occupants: &[Occupant], rng: &mut Pcg32, effects: &mut Vec<Effect>) {
        let score = dissonance(&audible_notes(occupants));
        if (score - self.score).abs() > 0.005 {
            effects.push(Effect::DisplayChanged(id));
        }
        self.score = score;
        if score <= DISSONANCE_THRESHOLD {
            return;
        }

        for o in occupants {
            if rng.random_bool(DISSONANCE_JITTER_CHANCE) {
                let dir = Vec2::from_angle(rng.random_range(0.0..TAU));
                effects.push(Effect::Push {
                    body: o.body,
                    force: dir * DISSONANCE_JITTER_ACCEL * o.mass,
                });
            }
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct ResonanceField {
    pub body: BodyHandle,
    /// Seconds of game time left
    pub remaining: f32,
}

impl ResonanceField {
    pub fn update(
        &mut self,
        id: MechanicId,
        center: Vec2,
        occupants: &[Occupant],
        dt: f32,
        effects: &mut Vec<Effect>,
    ) {
        self.remaining -= dt;
        if self.remaining <= 0.0 {
            effects.push(Effect::FieldExpired { field: id });
            return;
        }
        for o in occupants.iter().filter(|o| o.audible) {
            let dir = (center - o.position).normalize_or_zero();
            effects.push(Effect::Push {
                body: o.body,
                force: dir * RESONANCE_PULL_ACCEL * o.mass,
            });
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct FrequencyBridge {
    /// Listens in the band above the platform
    pub sensor: BodyHandle,
    pub platform: BodyHandle,
    pub required: Vec<i32>,
    pub relative: bool,
    pub solid: bool,
}

impl FrequencyBridge {
    pub fn update(&mut self, id: MechanicId, occupants: &[Occupant], ctx: &mut Context, effects: &mut Vec<Effect>) {
        let notes = audible_notes(occupants);
        let solid = chord_matches(&notes, &self.required, self.relative, ctx.root);
        if solid != self.solid {
            self.solid = solid;
            // Sensor flips force the physics world to drop stale contacts
            ctx.physics.set_sensor(self.platform, !solid);
            log::info!("Bridge {:?} {}", id, if solid { "solid" } else { "passable" });
            effects.push(Effect::BridgeToggled { bridge: id, solid });
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct AmplitudeFan {
    pub body: BodyHandle,
    /// Cap on the upward acceleration
    pub max_lift: f32,
    pub active: bool,
}

impl AmplitudeFan {
    pub fn update(&mut self, occupants: &[Occupant], effects: &mut Vec<Effect>) {
        let amplitude: f32 = occupants.iter().filter(|o| o.sounding).map(|o| o.volume).sum();
        self.active = amplitude > FAN_AMPLITUDE_THRESHOLD;
        if !self.active {
            return;
        }
        let lift = (amplitude * FAN_LIFT_PER_AMPLITUDE).min(self.max_lift);
        for o in occupants {
            effects.push(Effect::Push {
                body: o.body,
                force: Vec2::new(0.0, -lift * o.mass),
            });
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct PhaseShiftPortal {
    pub body: BodyHandle,
    /// Pair name from the level document
    pub pair: String,
    pub target_frequency: f32,
    pub link: Option<MechanicId>,
    pub cooldown_until: f64,
}

impl PhaseShiftPortal {
    pub fn target_pitch_class(&self) -> Option<u8> {
        note_of(self.target_frequency).map(pitch_class)
    }

    fn links_with(&self, other: &PhaseShiftPortal) -> bool {
        (self.target_frequency - other.target_frequency).abs() < 1e-3
    }
}

/// A scheduled echo
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Echo {
    pub source: EntityId,
    pub fire_at: f64,
    pub frequency: f32,
    pub waveform: Waveform,
    pub volume: f32,
}

/// Echoes quieter than this are dropped instead of re-queued
const MIN_ECHO_VOLUME: f32 = 0.01;

#[derive(Debug, Clone, PartialEq)]
pub struct EchoChamber {
    pub body: BodyHandle,
    pub delay: f64,
    pub feedback: f32,
    pub max_echoes: usize,
    queue: VecDeque<Echo>,
    last_enqueued: BTreeMap<EntityId, f64>,
}

fn quantize_up(t: f64) -> f64 {
    (t / QUANTIZE_STEP).ceil() * QUANTIZE_STEP
}

impl EchoChamber {
    pub fn queued(&self) -> usize {
        self.queue.len()
    }

    pub fn pending(&self) -> impl Iterator<Item = &Echo> {
        self.queue.iter()
    }

    fn schedule(&self, now: f64, quantize: bool) -> f64 {
        let at = now + self.delay;
        if quantize { quantize_up(at) } else { at }
    }

    /// Queue echoes of everything sounding inside the chamber
    pub fn listen(&mut self, occupants: &[Occupant], now: f64, quantize: bool) {
        self.last_enqueued.retain(|_, t| now - *t < ECHO_DEDUP_WINDOW);
        for o in occupants.iter().filter(|o| o.sounding) {
            if self.queue.len() >= self.max_echoes {
                log::debug!("Echo queue full, ignoring {:?}", o.id);
                break;
            }
            if self.last_enqueued.contains_key(&o.id) {
                continue;
            }
            self.last_enqueued.insert(o.id, now);
            let fire_at = self.schedule(now, quantize);
            self.queue.push_back(Echo {
                source: o.id,
                fire_at,
                frequency: o.frequency,
                waveform: o.waveform,
                volume: o.volume * ECHO_VOLUME_SCALE,
            });
        }
    }

    /// Fire every echo whose time has come; feedback may re-queue a quieter copy
    pub fn fire_due(&mut self, id: MechanicId, ctx: &mut Context, effects: &mut Vec<Effect>) {
        let now = ctx.now;
        let mut due = Vec::new();
        self.queue.retain(|e| {
            if e.fire_at <= now {
                due.push(*e);
                false
            } else {
                true
            }
        });

        for echo in due {
            effects.push(Effect::Echo {
                chamber: id,
                source: echo.source,
                request: VoiceRequest {
                    frequency: echo.frequency,
                    waveform: echo.waveform,
                    volume: echo.volume,
                    percussive: true,
                    detuned: false,
                },
            });
            let repeat = ctx.rng.random::<f32>() < self.feedback;
            let volume = echo.volume * self.feedback;
            if repeat && volume >= MIN_ECHO_VOLUME && self.queue.len() < self.max_echoes {
                let fire_at = self.schedule(now, ctx.quantize);
                self.queue.push_back(Echo { fire_at, volume, ..echo });
            }
        }
    }
}

/// Kind-specific state
#[derive(Debug, Clone, PartialEq)]
pub enum MechanicKind {
    Platform { body: BodyHandle },
    Obstacle(Obstacle),
    StartZone,
    ExitZone { body: BodyHandle },
    HarmonicGate(HarmonicGate),
    DissonanceZone(DissonanceZone),
    ResonanceField(ResonanceField),
    FrequencyBridge(FrequencyBridge),
    AmplitudeFan(AmplitudeFan),
    PhaseShiftPortal(PhaseShiftPortal),
    EchoChamber(EchoChamber),
}

/// A placed mechanic
#[derive(Debug, Clone, PartialEq)]
pub struct Mechanic {
    pub id: MechanicId,
    /// World-space footprint (the platform itself for bridges)
    pub region: Rect,
    pub kind: MechanicKind,
}

impl Mechanic {
    // === Construction ===

    pub fn platform(id: MechanicId, rect: Rect, physics: &mut dyn Physics) -> Self {
        let body = physics.add_static_body(rect, BodyOptions::default());
        Self {
            id,
            region: rect,
            kind: MechanicKind::Platform { body },
        }
    }

    pub fn obstacle(id: MechanicId, rect: Rect, kind: ObstacleKind, physics: &mut dyn Physics) -> Self {
        let body = match kind {
            ObstacleKind::LowFreqPlate => physics.add_dynamic_rect(
                rect,
                BodyOptions {
                    mass: 3.0,
                    friction: 0.8,
                    ..Default::default()
                },
            ),
            _ => physics.add_static_body(rect, BodyOptions::default()),
        };
        Self {
            id,
            region: rect,
            kind: MechanicKind::Obstacle(Obstacle { body, kind, hits: 0 }),
        }
    }

    pub fn start_zone(id: MechanicId, rect: Rect) -> Self {
        Self {
            id,
            region: rect,
            kind: MechanicKind::StartZone,
        }
    }

    pub fn exit_zone(id: MechanicId, rect: Rect, physics: &mut dyn Physics) -> Self {
        let body = physics.add_static_body(rect, BodyOptions::sensor());
        Self {
            id,
            region: rect,
            kind: MechanicKind::ExitZone { body },
        }
    }

    /// Gate starts closed (solid barrier) and is evaluated on the first update
    pub fn harmonic_gate(
        id: MechanicId,
        rect: Rect,
        required: Vec<i32>,
        relative: bool,
        physics: &mut dyn Physics,
    ) -> Self {
        let barrier = physics.add_static_body(rect, BodyOptions::default());
        Self {
            id,
            region: rect,
            kind: MechanicKind::HarmonicGate(HarmonicGate {
                barrier,
                required,
                relative,
                open: false,
                next_check: f64::NEG_INFINITY,
                recheck: false,
            }),
        }
    }

    pub fn dissonance_zone(id: MechanicId, rect: Rect, physics: &mut dyn Physics) -> Self {
        let body = physics.add_static_body(rect, BodyOptions::sensor());
        Self {
            id,
            region: rect,
            kind: MechanicKind::DissonanceZone(DissonanceZone { body, score: 0.0 }),
        }
    }

    pub fn resonance_field(id: MechanicId, rect: Rect, lifetime: f32, physics: &mut dyn Physics) -> Self {
        let body = physics.add_static_body(rect, BodyOptions::sensor());
        Self {
            id,
            region: rect,
            kind: MechanicKind::ResonanceField(ResonanceField {
                body,
                remaining: lifetime,
            }),
        }
    }

    /// Bridge starts passable
    pub fn frequency_bridge(
        id: MechanicId,
        rect: Rect,
        required: Vec<i32>,
        relative: bool,
        physics: &mut dyn Physics,
    ) -> Self {
        let platform = physics.add_static_body(rect, BodyOptions::sensor());
        let sensor = physics.add_static_body(rect.extend_up(BRIDGE_SENSOR_HEIGHT), BodyOptions::sensor());
        Self {
            id,
            region: rect,
            kind: MechanicKind::FrequencyBridge(FrequencyBridge {
                sensor,
                platform,
                required,
                relative,
                solid: false,
            }),
        }
    }

    /// The fan housing is a sensor; entities pass through while being pushed
    pub fn amplitude_fan(id: MechanicId, rect: Rect, max_lift: f32, physics: &mut dyn Physics) -> Self {
        let body = physics.add_static_body(rect, BodyOptions::sensor());
        Self {
            id,
            region: rect,
            kind: MechanicKind::AmplitudeFan(AmplitudeFan {
                body,
                max_lift,
                active: false,
            }),
        }
    }

    pub fn portal(
        id: MechanicId,
        rect: Rect,
        pair: impl Into<String>,
        target_frequency: f32,
        physics: &mut dyn Physics,
    ) -> Self {
        let body = physics.add_static_body(rect, BodyOptions::sensor());
        Self {
            id,
            region: rect,
            kind: MechanicKind::PhaseShiftPortal(PhaseShiftPortal {
                body,
                pair: pair.into(),
                target_frequency,
                link: None,
                cooldown_until: f64::NEG_INFINITY,
            }),
        }
    }

    pub fn echo_chamber(
        id: MechanicId,
        rect: Rect,
        delay: f64,
        feedback: f32,
        max_echoes: usize,
        physics: &mut dyn Physics,
    ) -> Self {
        let body = physics.add_static_body(rect, BodyOptions::sensor());
        Self {
            id,
            region: rect,
            kind: MechanicKind::EchoChamber(EchoChamber {
                body,
                delay: delay.max(0.0),
                feedback: feedback.clamp(0.0, 1.0),
                max_echoes,
                queue: VecDeque::new(),
                last_enqueued: BTreeMap::new(),
            }),
        }
    }

    // === Queries ===

    /// Physics bodies owned by this mechanic
    pub fn bodies(&self) -> Vec<BodyHandle> {
        match &self.kind {
            MechanicKind::Platform { body } | MechanicKind::ExitZone { body } => vec![*body],
            MechanicKind::Obstacle(o) => vec![o.body],
            MechanicKind::StartZone => Vec::new(),
            MechanicKind::HarmonicGate(g) => vec![g.barrier],
            MechanicKind::DissonanceZone(z) => vec![z.body],
            MechanicKind::ResonanceField(f) => vec![f.body],
            MechanicKind::FrequencyBridge(b) => vec![b.platform, b.sensor],
            MechanicKind::AmplitudeFan(f) => vec![f.body],
            MechanicKind::PhaseShiftPortal(p) => vec![p.body],
            MechanicKind::EchoChamber(c) => vec![c.body],
        }
    }

    /// Region whose occupants this mechanic evaluates
    pub fn interaction_region(&self) -> Rect {
        match &self.kind {
            MechanicKind::HarmonicGate(_) => self.region.inflate(GATE_LISTEN_MARGIN),
            MechanicKind::FrequencyBridge(_) => self.region.extend_up(BRIDGE_SENSOR_HEIGHT),
            MechanicKind::AmplitudeFan(_) => self.region.band_above(FAN_CAPTURE_HEIGHT),
            _ => self.region,
        }
    }

    /// Furniture an entity can stand on or bump into
    pub fn is_surface(&self) -> bool {
        match &self.kind {
            MechanicKind::Platform { .. } | MechanicKind::Obstacle(_) => true,
            MechanicKind::HarmonicGate(g) => !g.open,
            MechanicKind::FrequencyBridge(b) => b.solid,
            _ => false,
        }
    }

    pub fn label(&self) -> &'static str {
        match &self.kind {
            MechanicKind::Platform { .. } => "platform",
            MechanicKind::Obstacle(o) => match o.kind {
                ObstacleKind::LowFreqPlate => "low-frequency plate",
                ObstacleKind::RhythmPad => "rhythm pad",
                ObstacleKind::Generic => "obstacle",
            },
            MechanicKind::StartZone => "start",
            MechanicKind::ExitZone { .. } => "exit",
            MechanicKind::HarmonicGate(_) => "harmonic gate",
            MechanicKind::DissonanceZone(_) => "dissonance zone",
            MechanicKind::ResonanceField(_) => "resonance field",
            MechanicKind::FrequencyBridge(_) => "frequency bridge",
            MechanicKind::AmplitudeFan(_) => "amplitude fan",
            MechanicKind::PhaseShiftPortal(_) => "phase portal",
            MechanicKind::EchoChamber(_) => "echo chamber",
        }
    }

    /// HUD state, for the kinds that have any
    pub fn display(&self, root: i32, now: f64) -> Option<MechanicDisplay> {
        match &self.kind {
            MechanicKind::HarmonicGate(g) => Some(MechanicDisplay::Gate {
                chord: chord_label(&g.required, g.relative, root),
                open: g.open,
            }),
            MechanicKind::FrequencyBridge(b) => Some(MechanicDisplay::Bridge {
                chord: chord_label(&b.required, b.relative, root),
                solid: b.solid,
            }),
            MechanicKind::DissonanceZone(z) => Some(MechanicDisplay::DissonanceZone { score: z.score }),
            MechanicKind::PhaseShiftPortal(p) => Some(MechanicDisplay::Portal {
                linked: p.link.is_some(),
                cooling: now < p.cooldown_until,
            }),
            _ => None,
        }
    }

    pub fn displayable(&self, renderer: &dyn Renderer, root: i32) -> Displayable {
        let chord_color = |required: &[i32], relative: bool| {
            required
                .first()
                .map(|&n| renderer.color_for_pitch_class(required_pitch_class(n, relative, root)))
                .unwrap_or(Color(0xFFFFFF))
        };
        let (color, solid) = match &self.kind {
            MechanicKind::Platform { .. } => (Color(0x8E8E93), true),
            MechanicKind::Obstacle(o) => match o.kind {
                ObstacleKind::LowFreqPlate => (Color(0x5856D6), true),
                ObstacleKind::RhythmPad => (Color(0xFF9500), true),
                ObstacleKind::Generic => (Color(0x636366), true),
            },
            MechanicKind::StartZone => (Color(0x34C759), false),
            MechanicKind::ExitZone { .. } => (Color(0xFFD60A), false),
            MechanicKind::HarmonicGate(g) => (chord_color(&g.required, g.relative), !g.open),
            MechanicKind::DissonanceZone(_) => (Color(0xFF453A), false),
            MechanicKind::ResonanceField(_) => (Color(0x64D2FF), false),
            MechanicKind::FrequencyBridge(b) => (chord_color(&b.required, b.relative), b.solid),
            MechanicKind::AmplitudeFan(_) => (Color(0xAEAEB2), false),
            MechanicKind::PhaseShiftPortal(p) => (
                p.target_pitch_class()
                    .map(|pc| renderer.color_for_pitch_class(pc))
                    .unwrap_or(Color(0xFFFFFF)),
                false,
            ),
            MechanicKind::EchoChamber(_) => (Color(0xBF5AF2), false),
        };
        Displayable::Region {
            rect: self.region,
            label: self.label(),
            color,
            solid,
        }
    }

    pub fn as_portal(&self) -> Option<&PhaseShiftPortal> {
        match &self.kind {
            MechanicKind::PhaseShiftPortal(p) => Some(p),
            _ => None,
        }
    }

    fn as_portal_mut(&mut self) -> Option<&mut PhaseShiftPortal> {
        match &mut self.kind {
            MechanicKind::PhaseShiftPortal(p) => Some(p),
            _ => None,
        }
    }

    // === Evaluation ===

    /// Per-tick rule, run before the physics step
    pub fn update(&mut self, occupants: &[Occupant], ctx: &mut Context, effects: &mut Vec<Effect>) {
        let id = self.id;
        let center = self.region.center();
        match &mut self.kind {
            MechanicKind::HarmonicGate(g) => g.update(id, occupants, ctx, effects),
            MechanicKind::ResonanceField(f) => f.update(id, center, occupants, ctx.dt, effects),
            MechanicKind::EchoChamber(c) => c.fire_due(id, ctx, effects),
            _ => {}
        }
    }

    /// Membership rule, run after the physics step
    pub fn interact(&mut self, occupants: &[Occupant], ctx: &mut Context, effects: &mut Vec<Effect>) {
        let id = self.id;
        match &mut self.kind {
            MechanicKind::DissonanceZone(z) => z.update(id, occupants, ctx.rng, effects),
            MechanicKind::AmplitudeFan(f) => f.update(occupants, effects),
            MechanicKind::FrequencyBridge(b) => b.update(id, occupants, ctx, effects),
            MechanicKind::EchoChamber(c) => c.listen(occupants, ctx.now, ctx.quantize),
            _ => {}
        }
    }

    /// Release every body this mechanic owns
    pub fn release(self, physics: &mut dyn Physics) {
        for body in self.bodies() {
            physics.remove_body(body);
        }
    }
}

/// Find the partner of portal `index`, linking the pair on first use
fn resolve_link(mechanics: &mut [Mechanic], index: usize) -> Option<usize> {
    let this_id = mechanics[index].id;
    let this = mechanics[index].as_portal()?.clone();
    if let Some(link) = this.link {
        return mechanics.iter().position(|m| m.id == link);
    }

    let partner = mechanics.iter().position(|m| {
        m.id != this_id
            && m.as_portal()
                .is_some_and(|p| this.links_with(p) && p.link.is_none_or(|l| l == this_id))
    })?;
    let partner_id = mechanics[partner].id;
    if let Some(p) = mechanics[index].as_portal_mut() {
        p.link = Some(partner_id);
    }
    if let Some(p) = mechanics[partner].as_portal_mut() {
        p.link = Some(this_id);
    }
    log::debug!("Portal {:?} linked to {:?}", this_id, partner_id);
    Some(partner)
}

/// Teleport an occupant touching `portal`, if it qualifies.
///
/// Requires an audible entity whose pitch class matches the portal's target
/// and both ends of the pair out of cooldown. Starts the cooldown on both.
pub fn try_teleport(
    mechanics: &mut [Mechanic],
    portal: MechanicId,
    occupant: &Occupant,
    now: f64,
    cooldown: f64,
) -> Option<Effect> {
    let index = mechanics.iter().position(|m| m.id == portal)?;
    let partner = resolve_link(mechanics, index)?;

    let (target_pc, here_cd) = {
        let p = mechanics[index].as_portal()?;
        (p.target_pitch_class()?, p.cooldown_until)
    };
    let there_cd = mechanics[partner].as_portal()?.cooldown_until;

    if !occupant.audible || pitch_class(occupant.note) != target_pc {
        return None;
    }
    if now < here_cd || now < there_cd {
        return None;
    }

    for i in [index, partner] {
        if let Some(p) = mechanics[i].as_portal_mut() {
            p.cooldown_until = now + cooldown;
        }
    }
    let dest = mechanics[partner].region;
    let position = Vec2::new(dest.center().x, dest.top() - HARMONOID_RADIUS - PORTAL_EXIT_CLEARANCE);
    Some(Effect::Teleport {
        entity: occupant.id,
        body: occupant.body,
        from: portal,
        to: mechanics[partner].id,
        position,
    })
}
