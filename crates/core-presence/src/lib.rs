//! Authoritative sequenced presence store.
//!
//! One record per world-resident object: timed motion, orientation, bounds,
//! mesh/physics/zernike strings, and an optional parent; each attribute
//! paired with an independent monotonic sequence number. The store is the
//! single authority for accept/reject decisions: a write whose seqno does not
//! strictly exceed the stored one is dropped per attribute, silently, and the
//! rest of the batch still lands.
//!
//! Mutations return `StoreEvent`s instead of invoking callbacks. The owning
//! service routes events to its listener set (filtered by the aggregate
//! opt-in), to the location cache, and to the update policy, keeping all
//! fan-out on the strand and the store free of observer cycles.
//!
//! Invariants:
//! * Local and replica id sets are disjoint; `add_local` on a replica id (or
//!   vice versa) is rejected with a warning, never a silent overwrite.
//! * Per-(object, attribute) seqnos never decrease.
//! * Aggregate records are ordinary local records with the aggregate flag
//!   set; visibility filtering happens at the listener set, not here.

pub mod adapter;
pub mod attrs;
pub mod cell;
pub mod store;
pub mod update;

pub use adapter::{LocUpdateView, PresenceLocUpdate, PresenceLocUpdateWithEpoch};
pub use attrs::{AttrMask, AttrPart};
pub use cell::PropertyCell;
pub use store::{Locality, PresenceStore, SequencedPresence, StoreEvent};
pub use update::PresenceUpdate;
