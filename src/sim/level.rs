//! Level documents
//!
//! A level is plain data: geometry and parameters for every mechanic plus a
//! procession schedule. Documents come from JSON, from a base64 share code,
//! or from the bundled default level.

use base64::Engine;
use base64::engine::general_purpose::STANDARD;
use serde::{Deserialize, Serialize};
use thiserror::Error;

use super::entity::Variant;
use super::mechanics::ObstacleKind;
use crate::Rect;
use crate::consts::*;
use crate::music::Mode;

/// Bundled default level
const LEVEL_01: &str = include_str!("../../levels/level01.json");

/// Largest chord entry (absolute MIDI note or interval) a level may name
const MAX_CHORD_NOTE: i32 = 127;

/// Level loading errors
#[derive(Debug, Error)]
pub enum LevelError {
    #[error("malformed level document: {0}")]
    Parse(#[from] serde_json::Error),
    #[error("share code is not valid base64: {0}")]
    Decode(#[from] base64::DecodeError),
    #[error("share code is not UTF-8: {0}")]
    Utf8(#[from] std::string::FromUtf8Error),
    #[error("invalid level: {0}")]
    Invalid(String),
}

/// Rectangle as written in level documents (top-left corner)
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct RectDef {
    pub x: f32,
    pub y: f32,
    pub width: f32,
    pub height: f32,
}

impl RectDef {
    pub fn rect(&self) -> Rect {
        Rect::new(self.x, self.y, self.width, self.height)
    }
}

impl From<Rect> for RectDef {
    fn from(r: Rect) -> Self {
        Self {
            x: r.min.x,
            y: r.min.y,
            width: r.size.x,
            height: r.size.y,
        }
    }
}

fn yes() -> bool {
    true
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct GateOptions {
    #[serde(default = "yes")]
    pub is_relative_chord: bool,
}

impl Default for GateOptions {
    fn default() -> Self {
        Self {
            is_relative_chord: true,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct GateDef {
    #[serde(flatten)]
    pub rect: RectDef,
    #[serde(default)]
    pub required_chord_notes: Vec<i32>,
    #[serde(default)]
    pub options: GateOptions,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct BridgeDef {
    #[serde(flatten)]
    pub rect: RectDef,
    #[serde(default)]
    pub required_triad: Vec<i32>,
    #[serde(default = "yes")]
    pub is_relative_chord: bool,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct FanDef {
    #[serde(flatten)]
    pub rect: RectDef,
    #[serde(default = "default_lift")]
    pub lift_force: f32,
}

fn default_lift() -> f32 {
    FAN_DEFAULT_MAX_LIFT
}

/// A linked pair of portals sharing one target frequency
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PortalPairDef {
    pub id: String,
    pub teleport_target_frequency: f32,
    pub portal_a: RectDef,
    pub portal_b: RectDef,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct EchoDef {
    #[serde(flatten)]
    pub rect: RectDef,
    #[serde(default = "default_delay")]
    pub delay_time: f64,
    #[serde(default = "default_feedback")]
    pub feedback: f32,
    #[serde(default = "default_max_echoes")]
    pub max_echoes: usize,
}

fn default_delay() -> f64 {
    0.5
}

fn default_feedback() -> f32 {
    0.4
}

fn default_max_echoes() -> usize {
    ECHO_MAX_QUEUE
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ObstacleDef {
    #[serde(flatten)]
    pub rect: RectDef,
    #[serde(rename = "type", default)]
    pub kind: ObstacleKind,
}

/// One procession entry. Missing coordinates mean the start zone center.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SpawnDef {
    pub time: f64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub x: Option<f32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub y: Option<f32>,
    #[serde(rename = "type", alias = "variant", default)]
    pub variant: Variant,
}

fn default_key() -> String {
    "C".to_string()
}

fn default_rescue_target() -> f32 {
    0.5
}

/// Immutable level descriptor
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Level {
    #[serde(default)]
    pub name: String,
    #[serde(default = "default_key")]
    pub key: String,
    #[serde(default)]
    pub mode: Mode,
    /// Fraction of spawned Harmonoids that must be saved
    #[serde(default = "default_rescue_target")]
    pub rescue_target_percentage: f32,
    pub start_zone: RectDef,
    pub exit_zone: RectDef,
    #[serde(default)]
    pub platforms: Vec<RectDef>,
    #[serde(default)]
    pub harmonic_gates: Vec<GateDef>,
    #[serde(default)]
    pub dissonance_zones: Vec<RectDef>,
    #[serde(default)]
    pub frequency_bridges: Vec<BridgeDef>,
    #[serde(default)]
    pub amplitude_fans: Vec<FanDef>,
    #[serde(default)]
    pub phase_shift_portals: Vec<PortalPairDef>,
    #[serde(default)]
    pub echo_chambers: Vec<EchoDef>,
    #[serde(default)]
    pub obstacles: Vec<ObstacleDef>,
    #[serde(default)]
    pub procession_spawns: Vec<SpawnDef>,
}

impl Level {
    /// Parse and validate a JSON document. Spawns are ordered by time.
    pub fn from_json(json: &str) -> Result<Self, LevelError> {
        let mut level: Level = serde_json::from_str(json)?;
        level.validate()?;
        level
            .procession_spawns
            .sort_by(|a, b| a.time.total_cmp(&b.time));
        Ok(level)
    }

    pub fn to_json(&self) -> Result<String, LevelError> {
        Ok(serde_json::to_string(self)?)
    }

    /// Decode a share code (base64 of the JSON document, optional leading '#')
    pub fn from_share_code(code: &str) -> Result<Self, LevelError> {
        let code = code.trim();
        let code = code.strip_prefix('#').unwrap_or(code);
        let bytes = STANDARD.decode(code)?;
        let json = String::from_utf8(bytes)?;
        Self::from_json(&json)
    }

    pub fn to_share_code(&self) -> Result<String, LevelError> {
        Ok(STANDARD.encode(self.to_json()?))
    }

    /// The bundled default level
    pub fn bundled() -> Self {
        match Self::from_json(LEVEL_01) {
            Ok(level) => level,
            Err(e) => {
                log::error!("Bundled level is broken ({}), using built-in fallback", e);
                Self::fallback()
            }
        }
    }

    /// Minimal level: one floor, a start and an exit
    pub fn fallback() -> Self {
        Self {
            name: "Fallback".to_string(),
            key: default_key(),
            mode: Mode::Major,
            rescue_target_percentage: default_rescue_target(),
            start_zone: Rect::new(40.0, 500.0, 120.0, 60.0).into(),
            exit_zone: Rect::new(WORLD_WIDTH - 140.0, 560.0, 100.0, 100.0).into(),
            platforms: vec![Rect::new(0.0, 660.0, WORLD_WIDTH, 20.0).into()],
            harmonic_gates: Vec::new(),
            dissonance_zones: Vec::new(),
            frequency_bridges: Vec::new(),
            amplitude_fans: Vec::new(),
            phase_shift_portals: Vec::new(),
            echo_chambers: Vec::new(),
            obstacles: Vec::new(),
            procession_spawns: (0..5)
                .map(|i| SpawnDef {
                    time: 1.0 + 2.0 * f64::from(i),
                    x: None,
                    y: None,
                    variant: Variant::Standard,
                })
                .collect(),
        }
    }

    pub fn validate(&self) -> Result<(), LevelError> {
        let invalid = |what: String| Err(LevelError::Invalid(what));

        if !(0.0..=1.0).contains(&self.rescue_target_percentage) {
            return invalid(format!(
                "rescueTargetPercentage {} outside 0..1",
                self.rescue_target_percentage
            ));
        }

        let mut rects: Vec<(&str, RectDef)> = vec![("startZone", self.start_zone), ("exitZone", self.exit_zone)];
        rects.extend(self.platforms.iter().map(|r| ("platforms", *r)));
        rects.extend(self.harmonic_gates.iter().map(|g| ("harmonicGates", g.rect)));
        rects.extend(self.dissonance_zones.iter().map(|r| ("dissonanceZones", *r)));
        rects.extend(self.frequency_bridges.iter().map(|b| ("frequencyBridges", b.rect)));
        rects.extend(self.amplitude_fans.iter().map(|f| ("amplitudeFans", f.rect)));
        rects.extend(
            self.phase_shift_portals
                .iter()
                .flat_map(|p| [("phaseShiftPortals", p.portal_a), ("phaseShiftPortals", p.portal_b)]),
        );
        rects.extend(self.echo_chambers.iter().map(|e| ("echoChambers", e.rect)));
        rects.extend(self.obstacles.iter().map(|o| ("obstacles", o.rect)));
        if let Some((what, r)) = rects.iter().find(|(_, r)| !r.rect().is_valid()) {
            return invalid(format!("{} has a degenerate rectangle {:?}", what, r));
        }

        let chords = self
            .harmonic_gates
            .iter()
            .map(|g| &g.required_chord_notes)
            .chain(self.frequency_bridges.iter().map(|b| &b.required_triad));
        if let Some(n) = chords.flatten().find(|n| !(-MAX_CHORD_NOTE..=MAX_CHORD_NOTE).contains(*n)) {
            return invalid(format!("chord note {} outside ±{}", n, MAX_CHORD_NOTE));
        }

        if let Some(p) = self
            .phase_shift_portals
            .iter()
            .find(|p| !(p.teleport_target_frequency.is_finite() && p.teleport_target_frequency > 0.0))
        {
            return invalid(format!("portal {} has no usable target frequency", p.id));
        }
        if let Some(e) = self
            .echo_chambers
            .iter()
            .find(|e| !(e.delay_time.is_finite() && e.delay_time >= 0.0) || !(0.0..=1.0).contains(&e.feedback))
        {
            return invalid(format!(
                "echo chamber delay {} / feedback {} out of range",
                e.delay_time, e.feedback
            ));
        }
        if let Some(s) = self
            .procession_spawns
            .iter()
            .find(|s| !(s.time.is_finite() && s.time >= 0.0))
        {
            return invalid(format!("procession spawn at time {}", s.time));
        }
        Ok(())
    }
}

/// Where a level comes from
#[derive(Debug, Clone)]
pub enum LevelSource {
    Bundled,
    Json(String),
    ShareCode(String),
    Document(Box<Level>),
}

impl LevelSource {
    pub fn resolve(&self) -> Result<Level, LevelError> {
        match self {
            LevelSource::Bundled => Ok(Level::bundled()),
            LevelSource::Json(json) => Level::from_json(json),
            LevelSource::ShareCode(code) => Level::from_share_code(code),
            LevelSource::Document(level) => {
                level.validate()?;
                let mut level = level.as_ref().clone();
                level
                    .procession_spawns
                    .sort_by(|a, b| a.time.total_cmp(&b.time));
                Ok(level)
            }
        }
    }

    /// Resolve, falling back to the bundled level on any failure
    pub fn resolve_or_bundled(&self) -> Level {
        match self.resolve() {
            Ok(level) => level,
            Err(e) => {
                log::error!("Failed to load level ({}), falling back to the default level", e);
                Level::bundled()
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_bundled_level_is_valid() {
        let level = Level::from_json(LEVEL_01).unwrap();
        assert_eq!(level.name, "First Harmony");
        assert_eq!(level.harmonic_gates[0].required_chord_notes, vec![0, 4, 7]);
        assert_eq!(level.obstacles[0].kind, ObstacleKind::LowFreqPlate);
        assert_eq!(level.procession_spawns[2].variant, Variant::Bassoid);
        assert!(level.procession_spawns.windows(2).all(|w| w[0].time <= w[1].time));
        assert!(Level::fallback().validate().is_ok());
    }

    #[test]
    fn test_defaults_and_aliases() {
        let json = r#"{
            "startZone": {"x": 0, "y": 0, "width": 10, "height": 10},
            "exitZone": {"x": 100, "y": 0, "width": 10, "height": 10},
            "harmonicGates": [{"x": 1, "y": 1, "width": 5, "height": 5, "requiredChordNotes": [60, 64]}],
            "obstacles": [{"x": 1, "y": 1, "width": 5, "height": 5, "type": "spikes"}],
            "processionSpawns": [
                {"time": 4.0, "variant": "glissoid"},
                {"time": 2.0, "x": 50, "y": 20}
            ]
        }"#;
        let level = Level::from_json(json).unwrap();
        assert_eq!(level.key, "C");
        assert_eq!(level.mode, Mode::Major);
        assert_eq!(level.rescue_target_percentage, 0.5);
        assert!(level.harmonic_gates[0].options.is_relative_chord);
        assert_eq!(level.obstacles[0].kind, ObstacleKind::Generic);
        // Ordered by time
        assert_eq!(level.procession_spawns[0].x, Some(50.0));
        assert_eq!(level.procession_spawns[0].variant, Variant::Standard);
        assert_eq!(level.procession_spawns[1].variant, Variant::Glissoid);
    }

    #[test]
    fn test_share_code() {
        let level = Level::bundled();
        let code = level.to_share_code().unwrap();
        assert_eq!(Level::from_share_code(&format!("#{}", code)).unwrap(), level);

        assert!(matches!(Level::from_share_code("not base64!!"), Err(LevelError::Decode(_))));
        let garbage = STANDARD.encode("{\"key\": ");
        assert!(matches!(Level::from_share_code(&garbage), Err(LevelError::Parse(_))));
    }

    #[test]
    fn test_invalid_documents_rejected() {
        let mut level = Level::fallback();
        level.rescue_target_percentage = 1.5;
        assert!(matches!(level.validate(), Err(LevelError::Invalid(_))));

        let mut level = Level::fallback();
        level.platforms.push(RectDef {
            x: 0.0,
            y: 0.0,
            width: 0.0,
            height: 10.0,
        });
        assert!(matches!(level.validate(), Err(LevelError::Invalid(_))));

        let mut level = Level::fallback();
        level.procession_spawns[0].time = f64::NAN;
        assert!(level.validate().is_err());
    }

    #[test]
    fn test_out_of_range_chord_notes_rejected() {
        let json = r#"{
            "startZone": {"x": 0, "y": 0, "width": 10, "height": 10},
            "exitZone": {"x": 100, "y": 0, "width": 10, "height": 10},
            "harmonicGates": [{"x": 1, "y": 1, "width": 5, "height": 5, "requiredChordNotes": [2147483647]}]
        }"#;
        assert!(matches!(Level::from_json(json), Err(LevelError::Invalid(_))));
        assert_eq!(LevelSource::Json(json.into()).resolve_or_bundled(), Level::bundled());

        let mut level = Level::fallback();
        level.frequency_bridges.push(BridgeDef {
            rect: Rect::new(10.0, 10.0, 50.0, 10.0).into(),
            required_triad: vec![0, -128, 7],
            is_relative_chord: true,
        });
        assert!(level.validate().is_err());
        level.frequency_bridges[0].required_triad = vec![0, -12, 127];
        assert!(level.validate().is_ok());
    }

    #[test]
    fn test_bad_source_falls_back_to_bundled() {
        let level = LevelSource::ShareCode("%%%".into()).resolve_or_bundled();
        assert_eq!(level, Level::bundled());
        let level = LevelSource::Json("{}".into()).resolve_or_bundled();
        assert_eq!(level, Level::bundled());
    }
}
