//! Simulation clock.
//!
//! A `Time` is microseconds since the space's epoch. Wall-clock anchoring is
//! the transport layer's problem; inside the core only differences and
//! ordering matter. `Time::null()` (zero) is the reference time of records
//! that have never been updated and sorts before every live timestamp.

use serde::{Deserialize, Serialize};
use std::fmt;
use std::ops::{Add, Sub};
use std::time::Duration;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Default, Serialize, Deserialize)]
pub struct Time {
    micros: u64,
}

impl Time {
    pub const fn null() -> Self {
        Self { micros: 0 }
    }

    pub const fn from_micros(micros: u64) -> Self {
        Self { micros }
    }

    pub const fn from_millis(millis: u64) -> Self {
        Self {
            micros: millis * 1_000,
        }
    }

    pub const fn from_secs(secs: u64) -> Self {
        Self {
            micros: secs * 1_000_000,
        }
    }

    pub const fn as_micros(&self) -> u64 {
        self.micros
    }

    /// Seconds elapsed since `earlier`, saturating at zero when `earlier` is
    /// in the future (clock skew between producers is tolerated, never
    /// propagated as negative dt).
    pub fn seconds_since(&self, earlier: Time) -> f32 {
        self.micros.saturating_sub(earlier.micros) as f32 / 1_000_000.0
    }
}

impl Add<Duration> for Time {
    type Output = Time;
    fn add(self, rhs: Duration) -> Time {
        Time {
            micros: self.micros.saturating_add(rhs.as_micros() as u64),
        }
    }
}

impl Sub<Time> for Time {
    type Output = Duration;
    fn sub(self, rhs: Time) -> Duration {
        Duration::from_micros(self.micros.saturating_sub(rhs.micros))
    }
}

impl fmt::Display for Time {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "t+{}us", self.micros)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn null_sorts_first() {
        assert!(Time::null() < Time::from_micros(1));
    }

    #[test]
    fn seconds_since_saturates() {
        let a = Time::from_secs(5);
        let b = Time::from_secs(7);
        assert_eq!(b.seconds_since(a), 2.0);
        assert_eq!(a.seconds_since(b), 0.0);
    }

    #[test]
    fn add_duration() {
        let t = Time::from_millis(10) + Duration::from_millis(5);
        assert_eq!(t.as_micros(), 15_000);
    }
}
