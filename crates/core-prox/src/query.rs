//! Query registration surface shared by every handler.

use ahash::AHashSet;
use core_cache::{LocationCache, LocationCacheListener};
use core_motion::{ObjectId, SolidAngle, Time, Vector3};
use std::fmt;

/// Handle naming one registered query within a handler.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct QueryId(pub u64);

impl fmt::Display for QueryId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "query-{}", self.0)
    }
}

/// A standing solid-angle query: a viewpoint and an angular threshold.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Query {
    pub id: QueryId,
    pub position: Vector3,
    pub angle: SolidAngle,
}

impl Query {
    pub fn new(id: QueryId, position: Vector3, angle: SolidAngle) -> Self {
        Self {
            id,
            position,
            angle,
        }
    }
}

/// Result-stream event delivered to one query.
///
/// `Removed` means the object left the predicate; `PermanentlyRemoved` means
/// it left the world (cache disconnect) and will never return under this
/// identity. Node events describe cut movement through the tree and only
/// fire for the cut handlers.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum QueryEvent {
    Added { object: ObjectId },
    Removed { object: ObjectId },
    PermanentlyRemoved { object: ObjectId },
    NodeEntered { node: ObjectId },
    NodeExited { node: ObjectId },
}

/// Exported registration of one query: everything a peer handler needs to
/// adopt it without replaying its history. Transferring `results` is what
/// makes a rebuild swap silent: the adopting handler diffs against it
/// instead of starting from empty.
#[derive(Debug, Clone)]
pub struct QueryState {
    pub query: Query,
    pub results: AHashSet<ObjectId>,
    pub pending: Vec<QueryEvent>,
}

/// The unified handler interface. All mutation happens on the strand; a
/// handler is fed cache deltas through its `LocationCacheListener` impl and
/// re-evaluates on `tick`. `Send` because the strand task owning a handler
/// may itself migrate across runtime threads between events.
pub trait QueryHandler: LocationCacheListener + Send {
    /// Stable tag reported by the admin surface (`brute`, `rtree`, ...).
    fn handler_type(&self) -> &'static str;

    /// Register a fresh query with an empty result history. Its first tick
    /// emits `Added` for everything currently matching.
    fn register_query(&mut self, cache: &LocationCache, query: Query);

    /// Adopt a query exported from another handler instance, inheriting its
    /// last known result set so the handoff emits nothing spurious.
    fn import_query(&mut self, cache: &LocationCache, state: QueryState);

    /// Remove a query, returning its exported state. `None` when unknown.
    fn unregister_query(&mut self, id: QueryId) -> Option<QueryState>;

    /// Reposition a query (and optionally retune its threshold).
    fn move_query(&mut self, id: QueryId, position: Vector3, angle: SolidAngle);

    /// Re-evaluate all queries at `now`, buffering result-stream events.
    fn tick(&mut self, cache: &LocationCache, now: Time);

    /// One-shot drain of a query's buffered events.
    fn drain_events(&mut self, id: QueryId) -> Vec<QueryEvent>;

    fn contains_query(&self, id: QueryId) -> bool;
    fn query_ids(&self) -> Vec<QueryId>;
    fn query_count(&self) -> usize;

    /// Number of objects currently indexed (admin/properties surface).
    fn object_count(&self) -> usize;

    /// Current result set of a query, if registered.
    fn results(&self, id: QueryId) -> Option<&AHashSet<ObjectId>>;
}
