//! Bounding volumes: spheres and the aggregate bounding info carried by every
//! presence record.
//!
//! `AggregateBoundingInfo` describes both plain objects and aggregates with
//! one shape: an offset from the (extrapolated) location to the bounds center,
//! a radius bounding all member *centers*, and the largest member radius. A
//! plain object is the degenerate case `center_bounds_radius == 0`, so
//! `max_object_radius` is its own radius.

use crate::vector::Vector3;
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, PartialEq, Default, Serialize, Deserialize)]
pub struct BoundingSphere {
    pub center: Vector3,
    pub radius: f32,
}

impl BoundingSphere {
    pub const fn new(center: Vector3, radius: f32) -> Self {
        Self { center, radius }
    }

    pub fn contains(&self, other: &BoundingSphere) -> bool {
        self.center.distance(other.center) + other.radius <= self.radius + 1e-4
    }

    /// Smallest sphere enclosing both. Degenerate inputs (one sphere inside
    /// the other) return the enclosing sphere unchanged.
    pub fn merged(&self, other: &BoundingSphere) -> BoundingSphere {
        let d = self.center.distance(other.center);
        if d + other.radius <= self.radius {
            return *self;
        }
        if d + self.radius <= other.radius {
            return *other;
        }
        let radius = (d + self.radius + other.radius) / 2.0;
        let dir = (other.center - self.center).normalized();
        let center = self.center + dir * (radius - self.radius);
        BoundingSphere::new(center, radius)
    }
}

/// Bounding description of a presence: offset of the bounds center from the
/// object's location, a sphere radius bounding member centers, and the
/// largest radius of any member.
#[derive(Debug, Clone, Copy, PartialEq, Default, Serialize, Deserialize)]
pub struct AggregateBoundingInfo {
    pub center_offset: Vector3,
    pub center_bounds_radius: f32,
    pub max_object_radius: f32,
}

impl AggregateBoundingInfo {
    pub const fn new(
        center_offset: Vector3,
        center_bounds_radius: f32,
        max_object_radius: f32,
    ) -> Self {
        Self {
            center_offset,
            center_bounds_radius,
            max_object_radius,
        }
    }

    /// Bounds of a single, non-aggregate object with the given radius.
    pub const fn single(radius: f32) -> Self {
        Self {
            center_offset: Vector3::zero(),
            center_bounds_radius: 0.0,
            max_object_radius: radius,
        }
    }

    /// Sphere bounding member centers, positioned relative to the object
    /// location (add the extrapolated position to get world coordinates).
    pub fn center_bounds(&self) -> BoundingSphere {
        BoundingSphere::new(self.center_offset, self.center_bounds_radius)
    }

    /// Radius of the sphere bounding every member entirely.
    pub fn full_radius(&self) -> f32 {
        self.center_bounds_radius + self.max_object_radius
    }

    pub fn is_single(&self) -> bool {
        self.center_bounds_radius == 0.0
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn merged_contains_both() {
        let a = BoundingSphere::new(Vector3::new(0.0, 0.0, 0.0), 1.0);
        let b = BoundingSphere::new(Vector3::new(4.0, 0.0, 0.0), 2.0);
        let m = a.merged(&b);
        assert!(m.contains(&a));
        assert!(m.contains(&b));
    }

    #[test]
    fn merged_with_contained_sphere_is_identity() {
        let big = BoundingSphere::new(Vector3::zero(), 10.0);
        let small = BoundingSphere::new(Vector3::new(1.0, 0.0, 0.0), 1.0);
        assert_eq!(big.merged(&small), big);
        assert_eq!(small.merged(&big), big);
    }

    #[test]
    fn single_object_bounds() {
        let b = AggregateBoundingInfo::single(2.5);
        assert!(b.is_single());
        assert_eq!(b.full_radius(), 2.5);
        assert_eq!(b.center_bounds().radius, 0.0);
    }
}
