//! Session settings
//!
//! Data-driven limits and tuning for a simulation session. Loaded from an
//! optional JSON file; any missing field takes its default.

use std::path::Path;

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::consts::*;

/// Settings file errors
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("failed to read settings file: {0}")]
    Io(#[from] std::io::Error),
    #[error("invalid settings document: {0}")]
    Parse(#[from] serde_json::Error),
    #[error("invalid setting {field}: {reason}")]
    Invalid { field: &'static str, reason: String },
}

/// Session settings
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct Settings {
    // === World ===
    pub world_width: f32,
    pub world_height: f32,
    pub gravity: f32,

    // === Timing ===
    /// Frame delta is clamped to this before scaling by tempo
    pub max_frame_dt: f32,
    pub min_tempo: f32,
    pub max_tempo: f32,
    /// Seconds of game time between HarmonicGate evaluations
    pub gate_check_interval: f64,
    /// Seconds a portal pair stays cold after a teleport
    pub portal_cooldown: f64,

    // === Resource ceilings ===
    pub max_entities: usize,
    pub max_voices: usize,

    // === Player resources ===
    pub resonance_fields: u32,
    pub resonance_field_width: f32,
    pub resonance_field_height: f32,
    pub resonance_field_lifetime: f32,

    // === Audio ===
    /// Master volume (0.0 - 1.0) applied to every voice
    pub master_volume: f32,

    /// RNG seed for reproducible sessions
    pub seed: u64,
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            world_width: WORLD_WIDTH,
            world_height: WORLD_HEIGHT,
            gravity: GRAVITY,

            max_frame_dt: MAX_FRAME_DT,
            min_tempo: 0.25,
            max_tempo: 4.0,
            gate_check_interval: 0.5,
            portal_cooldown: 2.0,

            max_entities: 128,
            max_voices: 128,

            resonance_fields: 3,
            resonance_field_width: 150.0,
            resonance_field_height: 50.0,
            resonance_field_lifetime: 10.0,

            master_volume: 0.8,

            seed: 0x4841_524d,
        }
    }
}

impl Settings {
    /// Parse settings from a JSON document
    pub fn from_json(json: &str) -> Result<Self, ConfigError> {
        let settings: Settings = serde_json::from_str(json)?;
        settings.validate()?;
        Ok(settings)
    }

    /// Load settings from a JSON file
    pub fn load(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let json = std::fs::read_to_string(path)?;
        Self::from_json(&json)
    }

    /// Load settings, falling back to defaults on any failure
    pub fn load_or_default(path: impl AsRef<Path>) -> Self {
        let path = path.as_ref();
        match Self::load(path) {
            Ok(settings) => {
                log::info!("Loaded settings from {}", path.display());
                settings
            }
            Err(e) => {
                log::warn!("{} ({}); using default settings", e, path.display());
                Self::default()
            }
        }
    }

    /// Reject settings the simulation cannot run with
    pub fn validate(&self) -> Result<(), ConfigError> {
        if !(self.world_width > 0.0 && self.world_height > 0.0) {
            return Err(ConfigError::Invalid {
                field: "worldWidth/worldHeight",
                reason: "must be positive".into(),
            });
        }
        if !(self.max_frame_dt > 0.0) {
            return Err(ConfigError::Invalid {
                field: "maxFrameDt",
                reason: "must be positive".into(),
            });
        }
        if !(self.min_tempo > 0.0 && self.min_tempo <= self.max_tempo) {
            return Err(ConfigError::Invalid {
                field: "minTempo/maxTempo",
                reason: format!("bad range {}..{}", self.min_tempo, self.max_tempo),
            });
        }
        if !(0.0..=1.0).contains(&self.master_volume) {
            return Err(ConfigError::Invalid {
                field: "masterVolume",
                reason: format!("{} outside 0..1", self.master_volume),
            });
        }
        Ok(())
    }

    /// Clamp a tempo multiplier into the allowed range
    pub fn clamp_tempo(&self, tempo: f32) -> f32 {
        tempo.clamp(self.min_tempo, self.max_tempo)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_partial_document_keeps_defaults() {
        let s = Settings::from_json(r#"{ "maxEntities": 4, "seed": 7 }"#).unwrap();
        assert_eq!(s.max_entities, 4);
        assert_eq!(s.seed, 7);
        assert_eq!(s.max_voices, 128);
        assert_eq!(s.resonance_fields, 3);
    }

    #[test]
    fn test_invalid_settings_rejected() {
        assert!(matches!(
            Settings::from_json(r#"{ "minTempo": 5.0, "maxTempo": 1.0 }"#),
            Err(ConfigError::Invalid { .. })
        ));
        assert!(matches!(
            Settings::from_json("not json"),
            Err(ConfigError::Parse(_))
        ));
    }

    #[test]
    fn test_missing_file_falls_back() {
        let s = Settings::load_or_default("/definitely/not/here.json");
        assert_eq!(s.max_entities, Settings::default().max_entities);
    }

    #[test]
    fn test_clamp_tempo() {
        let s = Settings::default();
        assert_eq!(s.clamp_tempo(10.0), 4.0);
        assert_eq!(s.clamp_tempo(0.0), 0.25);
    }
}
