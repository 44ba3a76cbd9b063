//! Physics collaborator contract
//!
//! Rigid-body integration is external to the simulation. Positions and
//! velocities are owned here, never duplicated on entities.

use glam::Vec2;
use serde::{Deserialize, Serialize};

use crate::Rect;

/// Opaque handle into the physics body table
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct BodyHandle(pub u32);

/// Creation options for a body
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct BodyOptions {
    /// Sensors report contacts but never push anything
    pub sensor: bool,
    pub mass: f32,
    /// Tangential damping while in contact (0 = ice)
    pub friction: f32,
}

impl Default for BodyOptions {
    fn default() -> Self {
        Self {
            sensor: false,
            mass: 1.0,
            friction: 0.5,
        }
    }
}

impl BodyOptions {
    pub fn sensor() -> Self {
        Self {
            sensor: true,
            ..Default::default()
        }
    }
}

/// Start of contact between two bodies
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct CollisionEvent {
    pub a: BodyHandle,
    pub b: BodyHandle,
    /// Unit contact normal pointing from `a` toward `b`
    pub normal: Vec2,
    /// Closing speed along the normal at first contact
    pub relative_speed: f32,
}

impl CollisionEvent {
    /// The other body and the normal oriented away from `body`
    pub fn seen_from(&self, body: BodyHandle) -> Option<(BodyHandle, Vec2)> {
        if body == self.a {
            Some((self.b, self.normal))
        } else if body == self.b {
            Some((self.a, -self.normal))
        } else {
            None
        }
    }
}

/// Rigid-body world used by the simulation
pub trait Physics {
    fn add_static_body(&mut self, rect: Rect, options: BodyOptions) -> BodyHandle;
    fn add_dynamic_circle(&mut self, center: Vec2, radius: f32, options: BodyOptions) -> BodyHandle;
    fn add_dynamic_rect(&mut self, rect: Rect, options: BodyOptions) -> BodyHandle;
    fn remove_body(&mut self, body: BodyHandle);

    /// Accumulate a force for the next step
    fn apply_force(&mut self, body: BodyHandle, force: Vec2);
    fn set_velocity(&mut self, body: BodyHandle, velocity: Vec2);
    fn set_position(&mut self, body: BodyHandle, position: Vec2);
    /// Freeze (static) or release (dynamic) a body
    fn set_static(&mut self, body: BodyHandle, is_static: bool);
    /// Switch between sensor and solid. Existing contacts of the body must be
    /// re-evaluated so the change takes effect immediately.
    fn set_sensor(&mut self, body: BodyHandle, sensor: bool);

    fn position(&self, body: BodyHandle) -> Option<Vec2>;
    fn velocity(&self, body: BodyHandle) -> Option<Vec2>;
    fn mass(&self, body: BodyHandle) -> f32;
    fn are_touching(&self, a: BodyHandle, b: BodyHandle) -> bool;

    fn step(&mut self, dt: f32);
    /// Collision-start events produced since the last drain
    fn drain_collisions(&mut self) -> Vec<CollisionEvent>;
    /// Remove every body
    fn clear(&mut self);
}
