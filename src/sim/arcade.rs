//! Arcade physics world
//!
//! A small deterministic integrator implementing [`Physics`]: explicit Euler
//! with gravity and accumulated forces, positional push-out against solid
//! bodies, sensors, and collision-start events. Iteration order is by body
//! handle so identical inputs give identical worlds.

use std::collections::{BTreeMap, BTreeSet};

use glam::Vec2;

use super::collision::{Contact, Shape, shape_contact};
use super::physics::{BodyHandle, BodyOptions, CollisionEvent, Physics};
use crate::Rect;

/// Resting contacts within this distance still count as touching
const CONTACT_SKIN: f32 = 0.5;

#[derive(Debug, Clone)]
struct Body {
    shape: Shape,
    pos: Vec2,
    vel: Vec2,
    force: Vec2,
    mass: f32,
    friction: f32,
    is_static: bool,
    sensor: bool,
}

impl Body {
    fn new(shape: Shape, pos: Vec2, options: BodyOptions, is_static: bool) -> Self {
        Self {
            shape,
            pos,
            vel: Vec2::ZERO,
            force: Vec2::ZERO,
            mass: options.mass.max(1e-3),
            friction: options.friction.clamp(0.0, 1.0),
            is_static,
            sensor: options.sensor,
        }
    }
}

/// Default physics world
#[derive(Debug, Clone)]
pub struct ArcadePhysics {
    gravity: Vec2,
    bodies: BTreeMap<BodyHandle, Body>,
    next_handle: u32,
    /// Pairs currently in contact, smaller handle first
    contacts: BTreeSet<(BodyHandle, BodyHandle)>,
    events: Vec<CollisionEvent>,
}

impl ArcadePhysics {
    pub fn new(gravity: f32) -> Self {
        Self {
            gravity: Vec2::new(0.0, gravity),
            bodies: BTreeMap::new(),
            next_handle: 1,
            contacts: BTreeSet::new(),
            events: Vec::new(),
        }
    }

    pub fn body_count(&self) -> usize {
        self.bodies.len()
    }

    pub fn is_static(&self, body: BodyHandle) -> Option<bool> {
        self.bodies.get(&body).map(|b| b.is_static)
    }

    pub fn is_sensor(&self, body: BodyHandle) -> Option<bool> {
        self.bodies.get(&body).map(|b| b.sensor)
    }

    fn insert(&mut self, body: Body) -> BodyHandle {
        let handle = BodyHandle(self.next_handle);
        self.next_handle += 1;
        self.bodies.insert(handle, body);
        handle
    }

    fn forget_contacts(&mut self, body: BodyHandle) {
        self.contacts.retain(|(a, b)| *a != body && *b != body);
    }

    fn integrate(&mut self, dt: f32) {
        for body in self.bodies.values_mut() {
            if body.is_static {
                body.force = Vec2::ZERO;
                continue;
            }
            let accel = self.gravity + body.force / body.mass;
            body.vel += accel * dt;
            body.pos += body.vel * dt;
            body.force = Vec2::ZERO;
        }
    }

    /// Push overlapping solid bodies apart and cancel closing velocity
    fn resolve(&mut self, a: BodyHandle, b: BodyHandle, contact: Contact, dt: f32) {
        let (Some(ba), Some(bb)) = (self.bodies.get(&a), self.bodies.get(&b)) else {
            return;
        };
        let n = contact.normal;
        let depth = contact.penetration.max(0.0);
        let inv_a = if ba.is_static { 0.0 } else { 1.0 / ba.mass };
        let inv_b = if bb.is_static { 0.0 } else { 1.0 / bb.mass };
        let inv_sum = inv_a + inv_b;
        if inv_sum <= 0.0 {
            return;
        }

        let closing = (bb.vel - ba.vel).dot(n);
        let impulse = if closing < 0.0 { -closing / inv_sum } else { 0.0 };
        let friction = ba.friction.max(bb.friction);
        let damping = (1.0 - friction * dt * 5.0).max(0.0);

        if let Some(body) = self.bodies.get_mut(&a) {
            if !body.is_static {
                body.pos -= n * depth * (inv_a / inv_sum);
                body.vel -= n * impulse * inv_a;
                let tangential = body.vel - n * body.vel.dot(n);
                body.vel -= tangential * (1.0 - damping);
            }
        }
        if let Some(body) = self.bodies.get_mut(&b) {
            if !body.is_static {
                body.pos += n * depth * (inv_b / inv_sum);
                body.vel += n * impulse * inv_b;
                let tangential = body.vel - n * body.vel.dot(n);
                body.vel -= tangential * (1.0 - damping);
            }
        }
    }
}

impl Physics for ArcadePhysics {
    fn add_static_body(&mut self, rect: Rect, options: BodyOptions) -> BodyHandle {
        let shape = Shape::Box {
            half: rect.half_extents(),
        };
        self.insert(Body::new(shape, rect.center(), options, true))
    }

    fn add_dynamic_circle(&mut self, center: Vec2, radius: f32, options: BodyOptions) -> BodyHandle {
        self.insert(Body::new(Shape::Circle { radius }, center, options, false))
    }

    fn add_dynamic_rect(&mut self, rect: Rect, options: BodyOptions) -> BodyHandle {
        let shape = Shape::Box {
            half: rect.half_extents(),
        };
        self.insert(Body::new(shape, rect.center(), options, false))
    }

    fn remove_body(&mut self, body: BodyHandle) {
        if self.bodies.remove(&body).is_none() {
            log::warn!("remove_body: unknown body {:?}", body);
        }
        self.forget_contacts(body);
    }

    fn apply_force(&mut self, body: BodyHandle, force: Vec2) {
        if let Some(b) = self.bodies.get_mut(&body) {
            b.force += force;
        }
    }

    fn set_velocity(&mut self, body: BodyHandle, velocity: Vec2) {
        if let Some(b) = self.bodies.get_mut(&body) {
            b.vel = velocity;
        }
    }

    fn set_position(&mut self, body: BodyHandle, position: Vec2) {
        if let Some(b) = self.bodies.get_mut(&body) {
            b.pos = position;
        }
        // Teleports start fresh contacts at the destination
        self.forget_contacts(body);
    }

    fn set_static(&mut self, body: BodyHandle, is_static: bool) {
        if let Some(b) = self.bodies.get_mut(&body) {
            b.is_static = is_static;
            if is_static {
                b.vel = Vec2::ZERO;
            }
        }
    }

    fn set_sensor(&mut self, body: BodyHandle, sensor: bool) {
        if let Some(b) = self.bodies.get_mut(&body) {
            b.sensor = sensor;
        }
        self.forget_contacts(body);
    }

    fn position(&self, body: BodyHandle) -> Option<Vec2> {
        self.bodies.get(&body).map(|b| b.pos)
    }

    fn velocity(&self, body: BodyHandle) -> Option<Vec2> {
        self.bodies.get(&body).map(|b| b.vel)
    }

    fn mass(&self, body: BodyHandle) -> f32 {
        self.bodies.get(&body).map(|b| b.mass).unwrap_or(0.0)
    }

    fn are_touching(&self, a: BodyHandle, b: BodyHandle) -> bool {
        let key = if a < b { (a, b) } else { (b, a) };
        self.contacts.contains(&key)
    }

    fn step(&mut self, dt: f32) {
        if dt <= 0.0 {
            return;
        }
        self.integrate(dt);

        let handles: Vec<BodyHandle> = self.bodies.keys().copied().collect();
        let mut touching = BTreeSet::new();

        for (i, &a) in handles.iter().enumerate() {
            for &b in &handles[i + 1..] {
                let (Some(ba), Some(bb)) = (self.bodies.get(&a), self.bodies.get(&b)) else {
                    continue;
                };
                // Two immovable bodies never interact
                if ba.is_static && bb.is_static {
                    continue;
                }
                let Some(contact) = shape_contact(ba.shape, ba.pos, bb.shape, bb.pos, CONTACT_SKIN)
                else {
                    continue;
                };

                if !self.contacts.contains(&(a, b)) {
                    self.events.push(CollisionEvent {
                        a,
                        b,
                        normal: contact.normal,
                        relative_speed: (ba.vel - bb.vel).dot(contact.normal).abs(),
                    });
                }
                touching.insert((a, b));

                let solid = !ba.sensor && !bb.sensor;
                if solid && contact.penetration > 0.0 {
                    self.resolve(a, b, contact, dt);
                }
            }
        }

        self.contacts = touching;
    }

    fn drain_collisions(&mut self) -> Vec<CollisionEvent> {
        std::mem::take(&mut self.events)
    }

    fn clear(&mut self) {
        self.bodies.clear();
        self.contacts.clear();
        self.events.clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::consts::SIM_DT;

    fn floor(world: &mut ArcadePhysics) -> BodyHandle {
        world.add_static_body(Rect::new(-500.0, 100.0, 1000.0, 20.0), BodyOptions::default())
    }

    #[test]
    fn test_ball_falls_and_lands() {
        let mut world = ArcadePhysics::new(980.0);
        let ground = floor(&mut world);
        let ball = world.add_dynamic_circle(Vec2::new(0.0, 0.0), 10.0, BodyOptions::default());

        let mut landed = None;
        for _ in 0..240 {
            world.step(SIM_DT);
            for event in world.drain_collisions() {
                if let Some((other, normal)) = event.seen_from(ball) {
                    assert_eq!(other, ground);
                    landed = Some((normal, event.relative_speed));
                }
            }
        }

        let (normal, speed) = landed.expect("ball should land");
        assert!(normal.y > 0.9, "ground is below the ball");
        assert!(speed > 100.0);
        let pos = world.position(ball).unwrap();
        assert!((pos.y - 90.0).abs() < 2.0, "resting on floor top, got {pos}");
        assert!(world.are_touching(ball, ground));
        assert!(world.velocity(ball).unwrap().y.abs() < 20.0);
    }

    #[test]
    fn test_sensor_reports_but_does_not_block() {
        let mut world = ArcadePhysics::new(980.0);
        let sensor = world.add_static_body(Rect::new(-50.0, 40.0, 100.0, 20.0), BodyOptions::sensor());
        let ball = world.add_dynamic_circle(Vec2::ZERO, 10.0, BodyOptions::default());

        let mut hits = 0;
        for _ in 0..120 {
            world.step(SIM_DT);
            hits += world
                .drain_collisions()
                .iter()
                .filter(|e| e.seen_from(sensor).is_some())
                .count();
        }
        assert_eq!(hits, 1, "one collision-start per contact");
        assert!(world.position(ball).unwrap().y > 100.0, "fell through the sensor");
    }

    #[test]
    fn test_set_sensor_reevaluates_contacts() {
        let mut world = ArcadePhysics::new(0.0);
        let plate = world.add_static_body(Rect::new(-50.0, 0.0, 100.0, 20.0), BodyOptions::sensor());
        let ball = world.add_dynamic_circle(Vec2::new(0.0, 5.0), 10.0, BodyOptions::default());
        world.step(SIM_DT);
        assert_eq!(world.drain_collisions().len(), 1);
        assert!(world.are_touching(plate, ball));

        world.set_sensor(plate, false);
        assert!(!world.are_touching(plate, ball));
        world.step(SIM_DT);
        assert_eq!(world.drain_collisions().len(), 1, "contact starts again");
        // Solid now: ball pushed out of the plate
        let pos = world.position(ball).unwrap();
        let inside = Rect::new(-50.0, 0.0, 100.0, 20.0).contains(pos);
        assert!(!inside);
    }

    #[test]
    fn test_static_toggle_freezes_body() {
        let mut world = ArcadePhysics::new(980.0);
        let ball = world.add_dynamic_circle(Vec2::ZERO, 10.0, BodyOptions::default());
        world.set_velocity(ball, Vec2::new(50.0, 50.0));
        world.set_static(ball, true);
        world.step(SIM_DT);
        assert_eq!(world.position(ball), Some(Vec2::ZERO));
        assert_eq!(world.velocity(ball), Some(Vec2::ZERO));

        world.set_static(ball, false);
        world.step(SIM_DT);
        assert!(world.position(ball).unwrap().y > 0.0);
    }

    #[test]
    fn test_force_accelerates_by_mass() {
        let mut world = ArcadePhysics::new(0.0);
        let heavy = world.add_dynamic_circle(
            Vec2::ZERO,
            10.0,
            BodyOptions {
                mass: 4.0,
                ..Default::default()
            },
        );
        world.apply_force(heavy, Vec2::new(400.0, 0.0));
        world.step(0.5);
        assert!((world.velocity(heavy).unwrap().x - 50.0).abs() < 1e-3);
        // Forces do not persist
        world.step(0.5);
        assert!((world.velocity(heavy).unwrap().x - 50.0).abs() < 1e-3);
    }

    #[test]
    fn test_remove_body_and_clear() {
        let mut world = ArcadePhysics::new(980.0);
        let a = world.add_dynamic_circle(Vec2::ZERO, 10.0, BodyOptions::default());
        floor(&mut world);
        world.remove_body(a);
        assert_eq!(world.position(a), None);
        assert_eq!(world.body_count(), 1);
        world.clear();
        assert_eq!(world.body_count(), 0);
    }
}
