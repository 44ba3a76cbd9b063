//! Deterministic simulation module
//!
//! All gameplay logic lives here. This module must be pure and deterministic:
//! - Tick-driven only (the host supplies the frame delta)
//! - Seeded RNG only
//! - Stable iteration order (by entity and mechanic ID)
//! - Audio, drawing and HUD reached only through collaborator traits

pub mod arcade;
pub mod collision;
pub mod controller;
pub mod entity;
pub mod level;
pub mod mechanics;
pub mod physics;
pub mod state;
pub mod tick;

pub use arcade::ArcadePhysics;
pub use controller::{BodyOwner, Simulation};
pub use entity::{EntityId, Harmonoid, Impact, Reaction, Variant};
pub use level::{Level, LevelError, LevelSource};
pub use mechanics::{Effect, Mechanic, MechanicId, MechanicKind, ObstacleKind, Occupant};
pub use physics::{BodyHandle, BodyOptions, CollisionEvent, Physics};
pub use state::{Fate, GameEvent, GameMode, GamePhase, RngState, Session, evaluate_outcome};
pub use tick::{Command, TickInput, tick};
