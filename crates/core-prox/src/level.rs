//! Level-partitioned handler.
//!
//! Objects are bucketed by a size-derived level number
//! (`floor(log2(radius))`, clamped), the intuition being that same-sized
//! objects stop mattering at similar distances. Each bucket keeps a bound
//! over member centers and its actual largest radius, so a whole level is
//! skipped with one test when even its biggest member could not subtend the
//! threshold from the query position. Matching levels fall back to a member
//! scan.

use crate::common::{ObjState, ObjectMirror, QueryData, QueryRegistry};
use crate::query::{Query, QueryEvent, QueryHandler, QueryId, QueryState};
use ahash::{AHashMap, AHashSet};
use core_cache::{LocationCache, LocationCacheListener};
use core_motion::solid_angle::max_subtendable;
use core_motion::{BoundingSphere, ObjectId, SolidAngle, Time, TimedMotionVector3, Vector3};

const LEVEL_MIN: i32 = -16;
const LEVEL_MAX: i32 = 47;
const RADIUS_FLOOR: f32 = 1e-3;

/// Size-derived level. Radius-zero objects share the lowest level; per the
/// predicate they only ever match a zero threshold anyway.
fn level_of(radius: f32) -> i32 {
    (radius.max(RADIUS_FLOOR).log2().floor() as i32).clamp(LEVEL_MIN, LEVEL_MAX)
}

#[derive(Debug, Default)]
struct LevelBucket {
    members: AHashSet<ObjectId>,
    // Refreshed per tick.
    bound: BoundingSphere,
    max_radius: f32,
}

#[derive(Debug, Default)]
pub struct LevelHandler {
    objects: ObjectMirror,
    level_of_obj: AHashMap<ObjectId, i32>,
    levels: AHashMap<i32, LevelBucket>,
    queries: QueryRegistry,
}

impl LevelHandler {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn seeded(cache: &LocationCache) -> Self {
        let mut handler = Self::new();
        handler.objects.seed(cache);
        let ids: Vec<(ObjectId, f32)> = handler
            .objects
            .iter()
            .map(|(id, st)| (id, st.radius()))
            .collect();
        for (id, radius) in ids {
            handler.bucket(id, radius);
        }
        handler
    }

    fn bucket(&mut self, id: ObjectId, radius: f32) {
        let level = level_of(radius);
        self.level_of_obj.insert(id, level);
        self.levels.entry(level).or_default().members.insert(id);
    }

    fn unbucket(&mut self, id: ObjectId) {
        if let Some(level) = self.level_of_obj.remove(&id) {
            if let Some(bucket) = self.levels.get_mut(&level) {
                bucket.members.remove(&id);
                if bucket.members.is_empty() {
                    self.levels.remove(&level);
                }
            }
        }
    }

    /// Radius may have crossed a level boundary; re-bucket if so.
    fn rebucket(&mut self, id: ObjectId) {
        let Some(radius) = self.objects.get(id).map(|st| st.radius()) else {
            return;
        };
        let level = level_of(radius);
        if self.level_of_obj.get(&id) != Some(&level) {
            self.unbucket(id);
            self.bucket(id, radius);
        }
    }

    fn refresh_buckets(&mut self, now: Time) {
        for bucket in self.levels.values_mut() {
            let mut bound: Option<BoundingSphere> = None;
            let mut max_radius = 0.0f32;
            for m in bucket.members.iter() {
                if let Some(st) = self.objects.get(*m) {
                    let point = BoundingSphere::new(st.center_at(now), 0.0);
                    bound = Some(match bound {
                        None => point,
                        Some(b) => b.merged(&point),
                    });
                    max_radius = max_radius.max(st.radius());
                }
            }
            let b = bound.unwrap_or_default();
            // Absorb accumulated float error from sphere merging; level
            // pruning must stay conservative at the boundary.
            bucket.bound = BoundingSphere::new(b.center, b.radius + b.radius * 1e-5 + 1e-4);
            bucket.max_radius = max_radius;
        }
    }

    fn evaluate(
        objects: &ObjectMirror,
        levels: &AHashMap<i32, LevelBucket>,
        query: &Query,
        now: Time,
    ) -> AHashSet<ObjectId> {
        let mut out = AHashSet::new();
        for bucket in levels.values() {
            let dist = query.position.distance(bucket.bound.center);
            if max_subtendable(dist, bucket.bound.radius, bucket.max_radius)
                < query.angle.min_ratio()
            {
                continue;
            }
            for m in bucket.members.iter() {
                if let Some(st) = objects.get(*m) {
                    if st.matches(query.position, query.angle, now) {
                        out.insert(*m);
                    }
                }
            }
        }
        out
    }
}

impl LocationCacheListener for LevelHandler {
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
            let st = ObjState::from_entry(entry);
            let radius = st.radius();
            self.objects.insert(id, st);
            self.bucket(id, radius);
        }
    }

    fn location_disconnected(&mut self, id: ObjectId) {
        self.unbucket(id);
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
            self.rebucket(id);
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
            self.rebucket(id);
        }
    }
}

impl QueryHandler for LevelHandler {
    fn handler_type(&self) -> &'static str {
        "level"
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
        self.refresh_buckets(now);
        let Self {
            objects,
            levels,
            queries,
            ..
        } = self;
        for data in queries.iter_mut() {
            let new = Self::evaluate(objects, levels, &data.query, now);
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

#[cfg(test)]
mod tests {
    use super::*;
    use core_cache::CacheEntry;
    use core_motion::MotionVector3;

    #[test]
    fn level_function_is_monotonic_and_clamped() {
        assert_eq!(level_of(1.0), 0);
        assert_eq!(level_of(2.0), 1);
        assert_eq!(level_of(3.9), 1);
        assert_eq!(level_of(0.5), -1);
        assert_eq!(level_of(0.0), level_of(RADIUS_FLOOR));
        assert!(level_of(f32::MAX) <= LEVEL_MAX);
        assert!(level_of(1e-30) >= LEVEL_MIN);
    }

    fn connect(cache: &mut LocationCache, h: &mut LevelHandler, id: u64, pos: Vector3, r: f32) {
        let oid = ObjectId::from_index(id);
        cache.connect(CacheEntry {
            id: oid,
            location: TimedMotionVector3::new(Time::null(), MotionVector3::stationary(pos)),
            center_offset: Vector3::zero(),
            center_bounds_radius: 0.0,
            max_size: r,
            mesh: String::new(),
            zernike: None,
            aggregate: false,
            local: true,
        });
        h.location_connected(cache, oid, false, true);
    }

    #[test]
    fn matches_linear_scan_across_mixed_sizes() {
        let mut cache = LocationCache::new();
        let mut h = LevelHandler::new();
        for i in 0..60u64 {
            let x = ((i * 37) % 89) as f32 / 89.0 * 400.0;
            let y = ((i * 53) % 89) as f32 / 89.0 * 400.0;
            let r = [0.1f32, 0.8, 3.0, 20.0][(i % 4) as usize];
            connect(&mut cache, &mut h, i, Vector3::new(x, y, 0.0), r);
        }

        let q = Query::new(QueryId(1), Vector3::new(200.0, 200.0, 0.0), SolidAngle::new(0.08));
        h.register_query(&cache, q);
        h.tick(&cache, Time::null());

        let expected: AHashSet<ObjectId> = h
            .objects
            .iter()
            .filter(|(_, st)| st.matches(q.position, q.angle, Time::null()))
            .map(|(id, _)| id)
            .collect();
        assert_eq!(*h.results(QueryId(1)).unwrap(), expected);
        assert!(!expected.is_empty());
    }

    #[test]
    fn size_change_rebuckets() {
        let mut cache = LocationCache::new();
        let mut h = LevelHandler::new();
        connect(&mut cache, &mut h, 1, Vector3::zero(), 1.0);
        assert_eq!(h.level_of_obj[&ObjectId::from_index(1)], 0);

        cache.update_bounds(ObjectId::from_index(1), Vector3::zero(), 0.0, 10.0);
        h.location_max_size_updated(&cache, ObjectId::from_index(1), 1.0, 10.0);
        assert_eq!(h.level_of_obj[&ObjectId::from_index(1)], 3);
        assert_eq!(h.levels.len(), 1);
    }
}
