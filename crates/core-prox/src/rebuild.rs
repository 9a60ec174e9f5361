//! Rebuilding wrapper: amortized reconstruction of any handler.
//!
//! Incremental maintenance degrades spatial structures over time; a full
//! rebuild is periodically cheaper than repair. Rebuilding everything in one
//! tick would stall the strand, so the wrapper keeps two instances: the
//! *primary* serving queries, and during a cycle a *rebuild* instance,
//! freshly constructed from the cache's current world. Each tick at most
//! `batch` queries migrate across, carrying their registration and last
//! known result set; the adopting instance diffs against the transferred
//! set, so a static world migrates in silence. When the primary is empty it
//! is dropped and the rebuild instance takes over.
//!
//! New queries registered mid-cycle land on the rebuild instance; the
//! migration therefore always terminates. Cache deltas are fed to both
//! instances while both exist.

use crate::factory::HandlerCtor;
use crate::query::{Query, QueryEvent, QueryHandler, QueryId, QueryState};
use ahash::AHashSet;
use core_cache::{LocationCache, LocationCacheListener};
use core_motion::{BoundingSphere, ObjectId, SolidAngle, Time, TimedMotionVector3, Vector3};
use std::time::Duration;
use tracing::debug;

pub const DEFAULT_REBUILD_BATCH: usize = 10;
pub const DEFAULT_REBUILD_PERIOD: Duration = Duration::from_secs(10);

pub struct RebuildingHandler {
    ctor: HandlerCtor,
    primary: Box<dyn QueryHandler>,
    rebuild: Option<Box<dyn QueryHandler>>,
    batch: usize,
    period: Duration,
    /// End of the last completed cycle (or first observation), the clock the
    /// periodic trigger runs against.
    cycle_mark: Option<Time>,
}

impl RebuildingHandler {
    pub fn new(ctor: HandlerCtor, batch: usize, period: Duration) -> Self {
        let primary = ctor(&LocationCache::new());
        Self {
            ctor,
            primary,
            rebuild: None,
            batch: batch.max(1),
            period,
            cycle_mark: None,
        }
    }

    /// Begin a cycle now: construct the rebuild instance and replay the
    /// cache's current world into it. No-op when a cycle is already running.
    pub fn trigger_rebuild(&mut self, cache: &LocationCache) {
        if self.rebuild.is_some() {
            return;
        }
        debug!(
            target: "prox.rebuild",
            queries = self.primary.query_count(),
            objects = cache.len(),
            "starting rebuild cycle"
        );
        self.rebuild = Some((self.ctor)(cache));
    }

    pub fn is_migrating(&self) -> bool {
        self.rebuild.is_some()
    }

    pub fn primary_query_count(&self) -> usize {
        self.primary.query_count()
    }

    fn migrate_batch(&mut self, cache: &LocationCache) {
        let Some(rebuild) = self.rebuild.as_mut() else {
            return;
        };
        let mut ids = self.primary.query_ids();
        ids.sort(); // deterministic migration order
        for id in ids.into_iter().take(self.batch) {
            if let Some(state) = self.primary.unregister_query(id) {
                rebuild.import_query(cache, state);
            }
        }
        if self.primary.query_count() == 0 {
            let fresh = self.rebuild.take().expect("checked above");
            self.primary = fresh;
            debug!(target: "prox.rebuild", "rebuild cycle complete, primary swapped");
        }
    }
}

impl LocationCacheListener for RebuildingHandler {
    fn location_connected(
        &mut self,
        cache: &LocationCache,
        id: ObjectId,
        aggregate: bool,
        local: bool,
    ) {
        self.primary.location_connected(cache, id, aggregate, local);
        if let Some(rb) = self.rebuild.as_mut() {
            rb.location_connected(cache, id, aggregate, local);
        }
    }

    fn location_disconnected(&mut self, id: ObjectId) {
        self.primary.location_disconnected(id);
        if let Some(rb) = self.rebuild.as_mut() {
            rb.location_disconnected(id);
        }
    }

    fn location_position_updated(
        &mut self,
        cache: &LocationCache,
        id: ObjectId,
        old: TimedMotionVector3,
        new: TimedMotionVector3,
    ) {
        self.primary.location_position_updated(cache, id, old, new);
        if let Some(rb) = self.rebuild.as_mut() {
            rb.location_position_updated(cache, id, old, new);
        }
    }

    fn location_region_updated(
        &mut self,
        cache: &LocationCache,
        id: ObjectId,
        old: BoundingSphere,
        new: BoundingSphere,
    ) {
        self.primary.location_region_updated(cache, id, old, new);
        if let Some(rb) = self.rebuild.as_mut() {
            rb.location_region_updated(cache, id, old, new);
        }
    }

    fn location_max_size_updated(
        &mut self,
        cache: &LocationCache,
        id: ObjectId,
        old: f32,
        new: f32,
    ) {
        self.primary.location_max_size_updated(cache, id, old, new);
        if let Some(rb) = self.rebuild.as_mut() {
            rb.location_max_size_updated(cache, id, old, new);
        }
    }
}

impl QueryHandler for RebuildingHandler {
    fn handler_type(&self) -> &'static str {
        self.primary.handler_type()
    }

    fn register_query(&mut self, cache: &LocationCache, query: Query) {
        // Mid-cycle registrations join the new generation so migration
        // terminates.
        match self.rebuild.as_mut() {
            Some(rb) => rb.register_query(cache, query),
            None => self.primary.register_query(cache, query),
        }
    }

    fn import_query(&mut self, cache: &LocationCache, state: QueryState) {
        match self.rebuild.as_mut() {
            Some(rb) => rb.import_query(cache, state),
            None => self.primary.import_query(cache, state),
        }
    }

    fn unregister_query(&mut self, id: QueryId) -> Option<QueryState> {
        self.primary
            .unregister_query(id)
            .or_else(|| self.rebuild.as_mut().and_then(|rb| rb.unregister_query(id)))
    }

    fn move_query(&mut self, id: QueryId, position: Vector3, angle: SolidAngle) {
        if self.primary.contains_query(id) {
            self.primary.move_query(id, position, angle);
        } else if let Some(rb) = self.rebuild.as_mut() {
            rb.move_query(id, position, angle);
        }
    }

    fn tick(&mut self, cache: &LocationCache, now: Time) {
        if self.rebuild.is_none() {
            match self.cycle_mark {
                None => self.cycle_mark = Some(now),
                Some(mark) if now - mark >= self.period => self.trigger_rebuild(cache),
                _ => {}
            }
        }
        if self.rebuild.is_some() {
            self.migrate_batch(cache);
            if self.rebuild.is_none() {
                // Cycle finished this tick; restart the period clock.
                self.cycle_mark = Some(now);
            }
        }
        self.primary.tick(cache, now);
        if let Some(rb) = self.rebuild.as_mut() {
            rb.tick(cache, now);
        }
    }

    fn drain_events(&mut self, id: QueryId) -> Vec<QueryEvent> {
        if self.primary.contains_query(id) {
            self.primary.drain_events(id)
        } else if let Some(rb) = self.rebuild.as_mut() {
            rb.drain_events(id)
        } else {
            Vec::new()
        }
    }

    fn contains_query(&self, id: QueryId) -> bool {
        self.primary.contains_query(id)
            || self
                .rebuild
                .as_ref()
                .map(|rb| rb.contains_query(id))
                .unwrap_or(false)
    }

    fn query_ids(&self) -> Vec<QueryId> {
        let mut ids = self.primary.query_ids();
        if let Some(rb) = self.rebuild.as_ref() {
            ids.extend(rb.query_ids());
        }
        ids
    }

    fn query_count(&self) -> usize {
        self.primary.query_count()
            + self
                .rebuild
                .as_ref()
                .map(|rb| rb.query_count())
                .unwrap_or(0)
    }

    fn object_count(&self) -> usize {
        self.primary.object_count()
    }

    fn results(&self, id: QueryId) -> Option<&AHashSet<ObjectId>> {
        if self.primary.contains_query(id) {
            self.primary.results(id)
        } else {
            self.rebuild.as_ref().and_then(|rb| rb.results(id))
        }
    }
}
