//! Contact detection for the arcade physics world
//!
//! Circles (Harmonoids) and axis-aligned boxes (everything else). Normals
//! always point from the first shape toward the second.

use glam::Vec2;

/// Shapes understood by the arcade world
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum Shape {
    Circle { radius: f32 },
    Box { half: Vec2 },
}

impl Shape {
    /// Half extents of the bounding box
    pub fn half_extents(&self) -> Vec2 {
        match *self {
            Shape::Circle { radius } => Vec2::splat(radius),
            Shape::Box { half } => half,
        }
    }
}

/// Result of a contact query
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Contact {
    /// Unit normal from the first shape toward the second
    pub normal: Vec2,
    /// Overlap depth; slightly negative while merely touching within the skin
    pub penetration: f32,
}

/// Contact between two positioned shapes, counting anything within `skin` as touching
pub fn shape_contact(a: Shape, a_pos: Vec2, b: Shape, b_pos: Vec2, skin: f32) -> Option<Contact> {
    match (a, b) {
        (Shape::Box { half: ha }, Shape::Box { half: hb }) => box_box(a_pos, ha, b_pos, hb, skin),
        (Shape::Circle { radius }, Shape::Box { half }) => {
            circle_box(a_pos, radius, b_pos, half, skin)
        }
        (Shape::Box { half }, Shape::Circle { radius }) => {
            circle_box(b_pos, radius, a_pos, half, skin).map(|c| Contact {
                normal: -c.normal,
                ..c
            })
        }
        (Shape::Circle { radius: ra }, Shape::Circle { radius: rb }) => {
            circle_circle(a_pos, ra, b_pos, rb, skin)
        }
    }
}

#[inline]
fn sign_or_one(v: f32) -> f32 {
    if v < 0.0 { -1.0 } else { 1.0 }
}

fn box_box(a_pos: Vec2, ha: Vec2, b_pos: Vec2, hb: Vec2, skin: f32) -> Option<Contact> {
    let d = b_pos - a_pos;
    let px = ha.x + hb.x - d.x.abs();
    let py = ha.y + hb.y - d.y.abs();
    if px <= -skin || py <= -skin {
        return None;
    }

    // Separate along the axis of least overlap
    if px < py {
        Some(Contact {
            normal: Vec2::new(sign_or_one(d.x), 0.0),
            penetration: px,
        })
    } else {
        Some(Contact {
            normal: Vec2::new(0.0, sign_or_one(d.y)),
            penetration: py,
        })
    }
}

fn circle_box(c_pos: Vec2, radius: f32, b_pos: Vec2, half: Vec2, skin: f32) -> Option<Contact> {
    let min = b_pos - half;
    let max = b_pos + half;
    let closest = c_pos.clamp(min, max);
    let to_box = closest - c_pos;
    let dist = to_box.length();

    if dist > 1e-4 {
        let penetration = radius - dist;
        if penetration <= -skin {
            return None;
        }
        return Some(Contact {
            normal: to_box / dist,
            penetration,
        });
    }

    // Center inside the box: leave through the nearest face
    let faces = [
        (c_pos.x - min.x, Vec2::new(1.0, 0.0)),
        (max.x - c_pos.x, Vec2::new(-1.0, 0.0)),
        (c_pos.y - min.y, Vec2::new(0.0, 1.0)),
        (max.y - c_pos.y, Vec2::new(0.0, -1.0)),
    ];
    let (depth, normal) = faces
        .into_iter()
        .min_by(|a, b| a.0.partial_cmp(&b.0).unwrap_or(std::cmp::Ordering::Equal))
        .unwrap_or((0.0, Vec2::Y));
    Some(Contact {
        normal,
        penetration: radius + depth,
    })
}

fn circle_circle(a_pos: Vec2, ra: f32, b_pos: Vec2, rb: f32, skin: f32) -> Option<Contact> {
    let d = b_pos - a_pos;
    let dist = d.length();
    let penetration = ra + rb - dist;
    if penetration <= -skin {
        return None;
    }
    let normal = if dist > 1e-4 { d / dist } else { Vec2::Y };
    Some(Contact {
        normal,
        penetration,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_circle_resting_on_box() {
        let floor = Shape::Box {
            half: Vec2::new(100.0, 10.0),
        };
        let ball = Shape::Circle { radius: 12.0 };
        // Ball bottom 2 units into the floor top
        let contact = shape_contact(ball, Vec2::new(0.0, -20.0), floor, Vec2::ZERO, 0.5).unwrap();
        assert!((contact.penetration - 2.0).abs() < 1e-4);
        // Floor is below the ball (y down)
        assert!(contact.normal.y > 0.99);

        let flipped = shape_contact(floor, Vec2::ZERO, ball, Vec2::new(0.0, -20.0), 0.5).unwrap();
        assert!(flipped.normal.y < -0.99);
    }

    #[test]
    fn test_circle_inside_box_uses_nearest_face() {
        let b = Shape::Box {
            half: Vec2::new(50.0, 50.0),
        };
        let c = Shape::Circle { radius: 5.0 };
        let contact = shape_contact(c, Vec2::new(45.0, 0.0), b, Vec2::ZERO, 0.0).unwrap();
        // Box lies toward -x from a center near its right face
        assert_eq!(contact.normal, Vec2::new(-1.0, 0.0));
        assert!((contact.penetration - 10.0).abs() < 1e-4);
    }

    #[test]
    fn test_skin_counts_as_touching_but_not_beyond() {
        let a = Shape::Circle { radius: 10.0 };
        let b = Shape::Circle { radius: 10.0 };
        assert!(shape_contact(a, Vec2::ZERO, b, Vec2::new(20.3, 0.0), 0.5).is_some());
        assert!(shape_contact(a, Vec2::ZERO, b, Vec2::new(21.0, 0.0), 0.5).is_none());
    }

    #[test]
    fn test_box_box_least_axis() {
        let a = Shape::Box {
            half: Vec2::new(10.0, 10.0),
        };
        let contact = shape_contact(a, Vec2::ZERO, a, Vec2::new(5.0, 18.0), 0.0).unwrap();
        assert_eq!(contact.normal, Vec2::new(0.0, 1.0));
        assert!((contact.penetration - 2.0).abs() < 1e-4);
    }
}
