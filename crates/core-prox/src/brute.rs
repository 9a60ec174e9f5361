//! Brute-force handler: linear scan per query per tick.
//!
//! No auxiliary structure, no pruning. Quadratic and proud of it: this is
//! the semantic baseline every tree variant is tested against, and for small
//! worlds it wins outright.

use crate::common::{ObjState, ObjectMirror, QueryData, QueryRegistry};
use crate::query::{Query, QueryEvent, QueryHandler, QueryId, QueryState};
use ahash::AHashSet;
use core_cache::{LocationCache, LocationCacheListener};
use core_motion::{BoundingSphere, ObjectId, SolidAngle, Time, TimedMotionVector3, Vector3};

#[derive(Debug, Default)]
pub struct BruteForceHandler {
    objects: ObjectMirror,
    queries: QueryRegistry,
}

impl BruteForceHandler {
    pub fn new() -> Self {
        Self::default()
    }

    /// Fresh instance seeded from the cache's current world. Used by the
    /// rebuilding wrapper.
    pub fn seeded(cache: &LocationCache) -> Self {
        let mut handler = Self::new();
        handler.objects.seed(cache);
        handler
    }

    fn evaluate(objects: &ObjectMirror, query: &Query, now: Time) -> AHashSet<ObjectId> {
        objects
            .iter()
            .filter(|(_, st)| st.matches(query.position, query.angle, now))
            .map(|(id, _)| id)
            .collect()
    }
}

impl LocationCacheListener for BruteForceHandler {
    fn location_connected(
        &mut self,
        cache: &LocationCache,
        id: ObjectId,
        aggregate: bool,
        _local: bool,
    ) {
        if aggregate {
            return;
        }
        if let Some(entry) = cache.get(id) {
            self.objects.insert(id, ObjState::from_entry(entry));
        }
    }

    fn location_disconnected(&mut self, id: ObjectId) {
        if self.objects.remove(id).is_some() {
            self.queries.evict_object(id);
        }
    }

    fn location_position_updated(
        &mut self,
        _cache: &LocationCache,
        id: ObjectId,
        _old: TimedMotionVector3,
        new: TimedMotionVector3,
    ) {
        if let Some(st) = self.objects.get_mut(id) {
            st.loc = new;
        }
    }

    fn location_region_updated(
        &mut self,
        _cache: &LocationCache,
        id: ObjectId,
        _old: BoundingSphere,
        new: BoundingSphere,
    ) {
        if let Some(st) = self.objects.get_mut(id) {
            st.center_offset = new.center;
            st.center_bounds_radius = new.radius;
        }
    }

    fn location_max_size_updated(
        &mut self,
        _cache: &LocationCache,
        id: ObjectId,
        _old: f32,
        new: f32,
    ) {
        if let Some(st) = self.objects.get_mut(id) {
            st.max_size = new;
        }
    }
}

impl QueryHandler for BruteForceHandler {
    fn handler_type(&self) -> &'static str {
        "brute"
    }

    fn register_query(&mut self, _cache: &LocationCache, query: Query) {
        self.queries.insert(QueryData::fresh(query));
    }

    fn import_query(&mut self, _cache: &LocationCache, state: QueryState) {
        self.queries.insert(QueryData::from_state(state));
    }

    fn unregister_query(&mut self, id: QueryId) -> Option<QueryState> {
        self.queries.remove(id).map(QueryData::into_state)
    }

    fn move_query(&mut self, id: QueryId, position: Vector3, angle: SolidAngle) {
        if let Some(data) = self.queries.get_mut(id) {
            data.query.position = position;
            data.query.angle = angle;
        }
    }

    fn tick(&mut self, _cache: &LocationCache, now: Time) {
        let objects = &self.objects;
        for data in self.queries.iter_mut() {
            let new = Self::evaluate(objects, &data.query, now);
            data.commit_results(new);
        }
    }

    fn drain_events(&mut self, id: QueryId) -> Vec<QueryEvent> {
        self.queries.drain_events(id)
    }

    fn contains_query(&self, id: QueryId) -> bool {
        self.queries.contains(id)
    }

    fn query_ids(&self) -> Vec<QueryId> {
        self.queries.ids()
    }

    fn query_count(&self) -> usize {
        self.queries.len()
    }

    fn object_count(&self) -> usize {
        self.objects.len()
    }

    fn results(&self, id: QueryId) -> Option<&AHashSet<ObjectId>> {
        self.queries.get(id).map(|d| &d.results)
    }
}
