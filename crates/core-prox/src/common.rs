//! Bookkeeping shared by every handler implementation: per-handler object
//! mirrors, per-query registration state, and the result-set differ that
//! turns set transitions into a consistent event stream.

use crate::query::{Query, QueryEvent, QueryId, QueryState};
use ahash::{AHashMap, AHashSet};
use core_cache::{CacheEntry, LocationCache};
use core_motion::{ObjectId, SolidAngle, Time, TimedMotionVector3, Vector3};

/// A handler's private mirror of one indexed object. Handlers copy the
/// geometric fields they evaluate instead of pinning cache entries, so cache
/// reaping never races a descent.
#[derive(Debug, Clone, PartialEq)]
pub struct ObjState {
    pub loc: TimedMotionVector3,
    pub center_offset: Vector3,
    pub center_bounds_radius: f32,
    pub max_size: f32,
}

impl ObjState {
    pub fn from_entry(entry: &CacheEntry) -> Self {
        Self {
            loc: entry.location,
            center_offset: entry.center_offset,
            center_bounds_radius: entry.center_bounds_radius,
            max_size: entry.max_size,
        }
    }

    /// World-space bounds center at `t`.
    pub fn center_at(&self, t: Time) -> Vector3 {
        self.loc.position_at(t) + self.center_offset
    }

    /// Radius used by the solid-angle predicate: the full bounding radius.
    pub fn radius(&self) -> f32 {
        self.center_bounds_radius + self.max_size
    }

    /// Predicate evaluation against one query.
    pub fn matches(&self, position: Vector3, angle: SolidAngle, t: Time) -> bool {
        let distance = self.center_at(t).distance(position);
        angle.subtended_by(self.radius(), distance)
    }
}

/// Registration record: the query, its last delivered result set, and the
/// events buffered since the last drain.
#[derive(Debug, Clone)]
pub struct QueryData {
    pub query: Query,
    pub results: AHashSet<ObjectId>,
    pub pending: Vec<QueryEvent>,
}

impl QueryData {
    pub fn fresh(query: Query) -> Self {
        Self {
            query,
            results: AHashSet::new(),
            pending: Vec::new(),
        }
    }

    pub fn from_state(state: QueryState) -> Self {
        Self {
            query: state.query,
            results: state.results,
            pending: state.pending,
        }
    }

    pub fn into_state(self) -> QueryState {
        QueryState {
            query: self.query,
            results: self.results,
            pending: self.pending,
        }
    }

    /// Replace the result set with `new`, buffering `Removed` for departures
    /// and `Added` for arrivals. Emission order (removes first) keeps the
    /// per-object stream alternating under any interleaving of moves.
    pub fn commit_results(&mut self, new: AHashSet<ObjectId>) {
        for gone in self.results.iter() {
            if !new.contains(gone) {
                self.pending.push(QueryEvent::Removed { object: *gone });
            }
        }
        for fresh in new.iter() {
            if !self.results.contains(fresh) {
                self.pending.push(QueryEvent::Added { object: *fresh });
            }
        }
        self.results = new;
    }

    /// Force-remove one object with a permanent-removal event. Used when the
    /// world deletes an object that is currently in the result set.
    pub fn evict(&mut self, object: ObjectId) {
        if self.results.remove(&object) {
            self.pending
                .push(QueryEvent::PermanentlyRemoved { object });
        }
    }
}

/// Map of registered queries; shared by every handler implementation.
#[derive(Debug, Default)]
pub struct QueryRegistry {
    queries: AHashMap<QueryId, QueryData>,
}

impl QueryRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&mut self, data: QueryData) {
        self.queries.insert(data.query.id, data);
    }

    pub fn remove(&mut self, id: QueryId) -> Option<QueryData> {
        self.queries.remove(&id)
    }

    pub fn get(&self, id: QueryId) -> Option<&QueryData> {
        self.queries.get(&id)
    }

    pub fn get_mut(&mut self, id: QueryId) -> Option<&mut QueryData> {
        self.queries.get_mut(&id)
    }

    pub fn contains(&self, id: QueryId) -> bool {
        self.queries.contains_key(&id)
    }

    pub fn ids(&self) -> Vec<QueryId> {
        self.queries.keys().copied().collect()
    }

    pub fn len(&self) -> usize {
        self.queries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.queries.is_empty()
    }

    pub fn iter_mut(&mut self) -> impl Iterator<Item = &mut QueryData> {
        self.queries.values_mut()
    }

    pub fn drain_events(&mut self, id: QueryId) -> Vec<QueryEvent> {
        self.queries
            .get_mut(&id)
            .map(|q| std::mem::take(&mut q.pending))
            .unwrap_or_default()
    }

    pub fn evict_object(&mut self, object: ObjectId) {
        for q in self.queries.values_mut() {
            q.evict(object);
        }
    }
}

/// Mirror map maintained from cache deltas; shared by the scan-based
/// handlers (the tree handlers keep structure on top of it).
#[derive(Debug, Default)]
pub struct ObjectMirror {
    objects: AHashMap<ObjectId, ObjState>,
}

impl ObjectMirror {
    pub fn new() -> Self {
        Self::default()
    }

    /// Seed from the cache's current live entries; used when a rebuild
    /// replays the world into a fresh handler. Aggregate imposters are the
    /// query processor's own creations and are not indexed.
    pub fn seed(&mut self, cache: &LocationCache) {
        for entry in cache.iter() {
            if !entry.aggregate {
                self.objects.insert(entry.id, ObjState::from_entry(entry));
            }
        }
    }

    pub fn insert(&mut self, id: ObjectId, state: ObjState) {
        self.objects.insert(id, state);
    }

    pub fn remove(&mut self, id: ObjectId) -> Option<ObjState> {
        self.objects.remove(&id)
    }

    pub fn get(&self, id: ObjectId) -> Option<&ObjState> {
        self.objects.get(&id)
    }

    pub fn get_mut(&mut self, id: ObjectId) -> Option<&mut ObjState> {
        self.objects.get_mut(&id)
    }

    pub fn len(&self) -> usize {
        self.objects.len()
    }

    pub fn iter(&self) -> impl Iterator<Item = (ObjectId, &ObjState)> {
        self.objects.iter().map(|(id, st)| (*id, st))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::query::QueryId;
    use core_motion::MotionVector3;

    fn obj(x: f32, radius: f32) -> ObjState {
        ObjState {
            loc: TimedMotionVector3::new(
                Time::null(),
                MotionVector3::stationary(Vector3::new(x, 0.0, 0.0)),
            ),
            center_offset: Vector3::zero(),
            center_bounds_radius: 0.0,
            max_size: radius,
        }
    }

    #[test]
    fn commit_results_diffs_cleanly() {
        let q = Query::new(QueryId(1), Vector3::zero(), SolidAngle::new(0.1));
        let mut data = QueryData::fresh(q);

        let a = ObjectId::from_index(1);
        let b = ObjectId::from_index(2);

        let mut first = AHashSet::new();
        first.insert(a);
        data.commit_results(first.clone());
        assert_eq!(data.pending, vec![QueryEvent::Added { object: a }]);
        data.pending.clear();

        let mut second = AHashSet::new();
        second.insert(b);
        data.commit_results(second);
        assert_eq!(
            data.pending,
            vec![
                QueryEvent::Removed { object: a },
                QueryEvent::Added { object: b }
            ]
        );
    }

    #[test]
    fn evict_only_fires_for_members() {
        let q = Query::new(QueryId(1), Vector3::zero(), SolidAngle::new(0.1));
        let mut data = QueryData::fresh(q);
        let a = ObjectId::from_index(1);
        data.evict(a);
        assert!(data.pending.is_empty());

        let mut set = AHashSet::new();
        set.insert(a);
        data.commit_results(set);
        data.pending.clear();
        data.evict(a);
        assert_eq!(
            data.pending,
            vec![QueryEvent::PermanentlyRemoved { object: a }]
        );
    }

    #[test]
    fn predicate_uses_full_radius() {
        // center_bounds_radius + max_size = 2 at distance 20 => ratio 0.1.
        let mut st = obj(20.0, 1.0);
        st.center_bounds_radius = 1.0;
        assert!(st.matches(Vector3::zero(), SolidAngle::new(0.19), Time::null()));
        assert!(!st.matches(Vector3::zero(), SolidAngle::new(0.25), Time::null()));
    }
}
