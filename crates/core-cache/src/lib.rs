//! Liveness-tracking snapshot caches consulted by the spatial index.
//!
//! Two flavours share one shape:
//! * [`loc::LocationCache`]: per-object view over the presence store, the
//!   surface every query handler indexes. Entries are pinned by opaque
//!   cursors into a generational slot table; logical removal defers physical
//!   reaping until the last pin drops.
//! * [`pinto::PintoCache`]: per-peer-server view used for top-level
//!   routing. Same tracking semantics keyed by `ServerId`, but guarded by a
//!   mutex because the top-level query workers read it off-strand.
//!
//! Both emit old/new pairs on every geometric change; the spatial index
//! updates bounding volumes incrementally and needs the delta, not just the
//! new value.

pub mod loc;
pub mod pinto;

pub use loc::{
    CacheEntry, CacheEvent, Cursor, LocationCache, LocationCacheListener, dispatch_cache_events,
};
pub use pinto::{PintoCache, PintoCacheListener};
