//! Foundational value types for the space server: opaque identifiers, the
//! simulation clock, timed motion records, aggregate bounding info, and the
//! solid-angle predicate every proximity query evaluates.
//!
//! Design constraints:
//! * This crate is a leaf: every other crate in the workspace depends on it,
//!   so it carries plain data types only: no I/O, no channels, no logging.
//! * All types are `Copy` where the representation allows it; motion records
//!   are tiny and flow through listener fan-out constantly, so cloning must
//!   stay trivial.
//! * Extrapolation is pure: `TimedMotionVector3::position_at` never mutates,
//!   which keeps the store's snapshot semantics honest (readers extrapolate,
//!   writers replace).
//!
//! Invariants:
//! * `Time` is monotonic per producer; `Time::null()` sorts before every real
//!   timestamp and is the reference time of freshly constructed records.
//! * `SeqNo` ordering is total and wraps are not handled; a u64 per
//!   (object, attribute) outlives any plausible session.

pub mod bounds;
pub mod ids;
pub mod motion;
pub mod seqno;
pub mod solid_angle;
pub mod time;
pub mod vector;

pub use bounds::{AggregateBoundingInfo, BoundingSphere};
pub use ids::{ObjectId, OhNodeId, ProxIndexId, ServerId};
pub use motion::{MotionVector3, TimedMotionQuaternion, TimedMotionVector3};
pub use seqno::{SeqNo, SeqNoPtr, SeqNoSource};
pub use solid_angle::SolidAngle;
pub use time::Time;
pub use vector::{Quaternion, Vector3};
