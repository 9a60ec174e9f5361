//! Location service: subscription dispatch and the strand-facing facade.
//!
//! This crate assembles the core: the sequenced presence store, the
//! location cache feeding the spatial query handlers, the update policy
//! that coalesces attribute deltas per subscriber, and the session/command
//! surfaces. The strand model is inherited from `core-events`: one bounded
//! channel, one consumer ([`runtime::ServiceRuntime`]), producers post.
//!
//! Ordering guarantees carried end to end:
//! * per (object, attribute): delivered seqnos never decrease; stale writes
//!   are dropped at the store, never reordered;
//! * per (subscriber, object) per flush: one outbound message with all dirty
//!   attributes;
//! * add precedes updates, remove is final.

pub mod policy;
pub mod runtime;
pub mod service;
pub mod transport;

pub use policy::{FlushStats, LocationUpdatePolicy};
pub use runtime::ServiceRuntime;
pub use service::{IngestOutcome, ListenerId, LocationListener, LocationService};
pub use transport::{
    ChannelSink, EnqueueError, LocMessageSink, OutboundLocMessage, RecordingSink, SubscriberId,
    TransportSinks,
};
