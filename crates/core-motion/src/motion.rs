//! Timed motion records.
//!
//! A timed motion value pairs a reference time with a first-order motion
//! (value + velocity). Readers extrapolate to any later instant without
//! mutating the record; writers replace the whole record. This is the unit of
//! exchange for the location attribute end to end: ingress wire records,
//! store state, cache snapshots, and outbound updates all carry it intact.

use crate::time::Time;
use crate::vector::{Quaternion, Vector3};
use serde::{Deserialize, Serialize};

/// First-order linear motion: a position and a velocity in units per second.
#[derive(Debug, Clone, Copy, PartialEq, Default, Serialize, Deserialize)]
pub struct MotionVector3 {
    pub position: Vector3,
    pub velocity: Vector3,
}

impl MotionVector3 {
    pub const fn new(position: Vector3, velocity: Vector3) -> Self {
        Self { position, velocity }
    }

    pub const fn stationary(position: Vector3) -> Self {
        Self {
            position,
            velocity: Vector3::zero(),
        }
    }
}

/// A `MotionVector3` anchored at a reference time.
#[derive(Debug, Clone, Copy, PartialEq, Default, Serialize, Deserialize)]
pub struct TimedMotionVector3 {
    pub time: Time,
    pub value: MotionVector3,
}

impl TimedMotionVector3 {
    pub const fn new(time: Time, value: MotionVector3) -> Self {
        Self { time, value }
    }

    /// Position extrapolated to `t`. Times before the reference time clamp to
    /// the reference position; the record is authoritative for its own past.
    pub fn position_at(&self, t: Time) -> Vector3 {
        let dt = t.seconds_since(self.time);
        self.value.position + self.value.velocity * dt
    }

    pub fn velocity(&self) -> Vector3 {
        self.value.velocity
    }
}

/// Orientation with angular velocity, anchored at a reference time.
///
/// The core treats this as sequenced opaque state: `orientation_at` holds the
/// stored orientation rather than integrating the angular rate, because no
/// consumer inside the server interprets orientation geometrically. Clients
/// integrate on their side with the velocity term.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct TimedMotionQuaternion {
    pub time: Time,
    pub position: Quaternion,
    pub velocity: Quaternion,
}

impl TimedMotionQuaternion {
    pub const fn new(time: Time, position: Quaternion, velocity: Quaternion) -> Self {
        Self {
            time,
            position,
            velocity,
        }
    }

    pub fn orientation_at(&self, _t: Time) -> Quaternion {
        self.position
    }
}

impl Default for TimedMotionQuaternion {
    fn default() -> Self {
        Self {
            time: Time::null(),
            position: Quaternion::identity(),
            velocity: Quaternion::identity(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn extrapolates_linearly() {
        let m = TimedMotionVector3::new(
            Time::from_secs(10),
            MotionVector3::new(Vector3::new(1.0, 0.0, 0.0), Vector3::new(2.0, 0.0, 0.0)),
        );
        let p = m.position_at(Time::from_secs(12));
        assert_eq!(p, Vector3::new(5.0, 0.0, 0.0));
    }

    #[test]
    fn clamps_before_reference_time() {
        let m = TimedMotionVector3::new(
            Time::from_secs(10),
            MotionVector3::new(Vector3::new(1.0, 0.0, 0.0), Vector3::new(2.0, 0.0, 0.0)),
        );
        let p = m.position_at(Time::from_secs(5));
        assert_eq!(p, Vector3::new(1.0, 0.0, 0.0));
    }

    #[test]
    fn stationary_never_moves() {
        let m = TimedMotionVector3::new(
            Time::null(),
            MotionVector3::stationary(Vector3::new(3.0, 3.0, 3.0)),
        );
        assert_eq!(m.position_at(Time::from_secs(100)), Vector3::new(3.0, 3.0, 3.0));
    }
}
