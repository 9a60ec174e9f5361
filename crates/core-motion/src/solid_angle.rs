//! Solid-angle query threshold and the membership predicate.
//!
//! A query with threshold `theta` matches an object when the object's bounding
//! radius subtends at least `theta` from the query position:
//!
//! ```text
//! radius / distance >= sin(theta / 2)
//! ```
//!
//! Edge cases are part of the contract, not incidental float behavior:
//! * distance 0 matches unconditionally (the observer is inside the object);
//! * radius 0 matches only a zero threshold.
//!
//! Handlers that prune by node must use `max_subtendable`, which bounds the
//! ratio any descendant could achieve; it is exact at the node boundary so
//! pruning never drops a matching leaf.

use serde::{Deserialize, Serialize};
use std::fmt;

/// Minimum angular size threshold of a proximity query, in radians.
#[derive(Debug, Clone, Copy, PartialEq, PartialOrd, Serialize, Deserialize)]
pub struct SolidAngle(f32);

impl SolidAngle {
    pub const MIN: SolidAngle = SolidAngle(0.0);
    /// Full half-sphere aperture; nothing subtends more than this under the
    /// sine test.
    pub const MAX: SolidAngle = SolidAngle(std::f32::consts::PI);

    /// Construct a threshold, clamped into `[MIN, MAX]`.
    pub fn new(radians: f32) -> Self {
        Self(radians.clamp(0.0, std::f32::consts::PI))
    }

    pub fn radians(&self) -> f32 {
        self.0
    }

    /// Sine of the half angle, the precomputable constant the predicate
    /// compares against.
    pub fn min_ratio(&self) -> f32 {
        (self.0 / 2.0).sin()
    }

    /// Does a sphere of `radius` at `distance` subtend at least this
    /// threshold?
    pub fn subtended_by(&self, radius: f32, distance: f32) -> bool {
        if distance <= 0.0 {
            return true;
        }
        if radius <= 0.0 {
            return self.0 == 0.0;
        }
        radius / distance >= self.min_ratio()
    }
}

impl Default for SolidAngle {
    fn default() -> Self {
        SolidAngle::MIN
    }
}

impl fmt::Display for SolidAngle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}rad", self.0)
    }
}

/// Upper bound on the subtended ratio any object inside a node could achieve
/// from a viewpoint at `dist_to_node_center`, for a node bounding sphere of
/// `node_radius` whose members have radius at most `max_member_radius`.
///
/// The closest a member center can sit to the viewpoint is
/// `dist - node_radius` (zero when the viewpoint is inside the node, which
/// makes the bound infinite and forces descent).
pub fn max_subtendable(
    dist_to_node_center: f32,
    node_radius: f32,
    max_member_radius: f32,
) -> f32 {
    let min_dist = dist_to_node_center - node_radius;
    if min_dist <= 0.0 {
        return f32::INFINITY;
    }
    max_member_radius / min_dist
}
