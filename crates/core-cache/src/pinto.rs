//! Inter-server ("pinto") location cache.
//!
//! Keyed by peer server id and consulted by the top-level query processor for
//! coarse routing: which servers' regions could intersect a query. Unlike the
//! per-object cache this one is read from the pinto service's worker threads
//! as well as the strand, so one mutex covers the server map and the listener
//! set together. Listeners run with the lock held and must not call back into
//! the cache.
//!
//! Aggregates here are inserted explicitly by the query processor, are
//! invisible to listeners, and can only leave via `remove_aggregate`, which
//! asserts nothing is tracking them, because nothing is ever told about them.

use ahash::AHashMap;
use core_motion::{AggregateBoundingInfo, BoundingSphere, ObjectId, ServerId, TimedMotionVector3, Vector3};
use std::sync::Mutex;
use tracing::debug;

/// Listener surface; same shape as the per-object cache, keyed by server.
pub trait PintoCacheListener: Send {
    fn location_connected(
        &mut self,
        server: ServerId,
        location: TimedMotionVector3,
        region: BoundingSphere,
        max_size: f32,
    );
    fn location_disconnected(&mut self, server: ServerId);
    fn location_position_updated(
        &mut self,
        server: ServerId,
        old: TimedMotionVector3,
        new: TimedMotionVector3,
    );
    fn location_region_updated(&mut self, server: ServerId, old: BoundingSphere, new: BoundingSphere);
    fn location_max_size_updated(&mut self, server: ServerId, old: f32, new: f32);
}

#[derive(Debug, Clone, Default)]
struct SpaceServerData {
    location: TimedMotionVector3,
    region: BoundingSphere,
    max_size: f32,
    aggregate: bool,
    tracking: u32,
    removable: bool,
}

#[derive(Default)]
struct Inner {
    servers: AHashMap<ServerId, SpaceServerData>,
    listeners: Vec<Box<dyn PintoCacheListener>>,
}

#[derive(Default)]
pub struct PintoCache {
    inner: Mutex<Inner>,
}

impl PintoCache {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add_listener(&self, listener: Box<dyn PintoCacheListener>) {
        let inner = &mut *self.inner.lock().expect("pinto cache poisoned");
        inner.listeners.push(listener);
    }

    /// Admit or refresh a concrete server. A fresh admission notifies
    /// `location_connected`; a refresh fans out the three update callbacks
    /// with old/new pairs.
    pub fn add_space_server(
        &self,
        server: ServerId,
        location: TimedMotionVector3,
        region: BoundingSphere,
        max_size: f32,
    ) {
        let inner = &mut *self.inner.lock().expect("pinto cache poisoned");
        let existing = inner.servers.get(&server).cloned();
        let data = inner.servers.entry(server).or_default();
        data.location = location;
        data.region = region;
        data.max_size = max_size;
        data.aggregate = false;
        match existing {
            None => {
                data.tracking = 0;
                data.removable = true;
                for l in inner.listeners.iter_mut() {
                    l.location_connected(server, location, region, max_size);
                }
            }
            Some(old) => {
                for l in inner.listeners.iter_mut() {
                    l.location_position_updated(server, old.location, location);
                    l.location_region_updated(server, old.region, region);
                    l.location_max_size_updated(server, old.max_size, max_size);
                }
            }
        }
    }

    pub fn update_location(&self, server: ServerId, location: TimedMotionVector3) {
        let inner = &mut *self.inner.lock().expect("pinto cache poisoned");
        let data = inner
            .servers
            .get_mut(&server)
            .unwrap_or_else(|| panic!("pinto cache: update of unknown {server}"));
        let old = data.location;
        data.location = location;
        for l in inner.listeners.iter_mut() {
            l.location_position_updated(server, old, location);
        }
    }

    pub fn update_region(&self, server: ServerId, region: BoundingSphere) {
        let inner = &mut *self.inner.lock().expect("pinto cache poisoned");
        let data = inner
            .servers
            .get_mut(&server)
            .unwrap_or_else(|| panic!("pinto cache: update of unknown {server}"));
        let old = data.region;
        data.region = region;
        for l in inner.listeners.iter_mut() {
            l.location_region_updated(server, old, region);
        }
    }

    pub fn update_max_size(&self, server: ServerId, max_size: f32) {
        let inner = &mut *self.inner.lock().expect("pinto cache poisoned");
        let data = inner
            .servers
            .get_mut(&server)
            .unwrap_or_else(|| panic!("pinto cache: update of unknown {server}"));
        let old = data.max_size;
        data.max_size = max_size;
        for l in inner.listeners.iter_mut() {
            l.location_max_size_updated(server, old, max_size);
        }
    }

    /// Remove a concrete server. Deferred while tracked; the reap happens in
    /// the `stop_tracking` that drops the last reference.
    pub fn remove_space_server(&self, server: ServerId) {
        let inner = &mut *self.inner.lock().expect("pinto cache poisoned");
        let data = inner
            .servers
            .get_mut(&server)
            .unwrap_or_else(|| panic!("pinto cache: remove of unknown {server}"));
        if data.tracking > 0 {
            data.removable = true;
            debug!(target: "pinto.cache", %server, "removal deferred until tracking releases");
            return;
        }
        inner.servers.remove(&server);
        for l in inner.listeners.iter_mut() {
            l.location_disconnected(server);
        }
    }

    /// Insert an aggregate placeholder. Dummy geometry; updates follow from
    /// the query processor. Not removable except via `remove_aggregate`.
    pub fn add_aggregate(&self, server: ServerId) {
        let inner = &mut *self.inner.lock().expect("pinto cache poisoned");
        assert!(
            !inner.servers.contains_key(&server),
            "pinto cache: aggregate id {server} already present"
        );
        inner.servers.insert(
            server,
            SpaceServerData {
                aggregate: true,
                removable: false,
                ..Default::default()
            },
        );
    }

    pub fn update_aggregate_location(&self, server: ServerId, location: TimedMotionVector3) {
        let inner = &mut *self.inner.lock().expect("pinto cache poisoned");
        let data = inner
            .servers
            .get_mut(&server)
            .unwrap_or_else(|| panic!("pinto cache: update of unknown aggregate {server}"));
        data.location = location;
    }

    pub fn update_aggregate_bounds(&self, server: ServerId, bounds: AggregateBoundingInfo) {
        let inner = &mut *self.inner.lock().expect("pinto cache poisoned");
        let data = inner
            .servers
            .get_mut(&server)
            .unwrap_or_else(|| panic!("pinto cache: update of unknown aggregate {server}"));
        data.region = BoundingSphere::new(Vector3::zero(), bounds.center_bounds_radius);
        data.max_size = bounds.max_object_radius;
    }

    /// Remove an aggregate. Nothing may be tracking it; aggregates are
    /// private to the query processor, so live tracking means a bookkeeping
    /// bug and the process aborts.
    pub fn remove_aggregate(&self, server: ServerId) {
        let inner = &mut *self.inner.lock().expect("pinto cache poisoned");
        let data = inner
            .servers
            .get(&server)
            .unwrap_or_else(|| panic!("pinto cache: remove of unknown aggregate {server}"));
        assert_eq!(
            data.tracking, 0,
            "pinto cache: aggregate {server} removed while tracked"
        );
        inner.servers.remove(&server);
    }

    pub fn start_tracking(&self, server: ServerId) -> bool {
        let inner = &mut *self.inner.lock().expect("pinto cache poisoned");
        match inner.servers.get_mut(&server) {
            Some(data) if !data.removable => {
                data.tracking += 1;
                true
            }
            _ => false,
        }
    }

    pub fn stop_tracking(&self, server: ServerId) {
        let inner = &mut *self.inner.lock().expect("pinto cache poisoned");
        let data = inner
            .servers
            .get_mut(&server)
            .unwrap_or_else(|| panic!("pinto cache: untracked release of {server}"));
        assert!(data.tracking > 0, "pinto cache: unbalanced stop_tracking");
        data.tracking -= 1;
        if data.tracking == 0 && data.removable {
            inner.servers.remove(&server);
            for l in inner.listeners.iter_mut() {
                l.location_disconnected(server);
            }
        }
    }

    pub fn contains(&self, server: ServerId) -> bool {
        self.inner
            .lock()
            .expect("pinto cache poisoned")
            .servers
            .contains_key(&server)
    }

    pub fn location(&self, server: ServerId) -> Option<TimedMotionVector3> {
        self.inner
            .lock()
            .expect("pinto cache poisoned")
            .servers
            .get(&server)
            .map(|d| d.location)
    }

    pub fn region(&self, server: ServerId) -> Option<BoundingSphere> {
        self.inner
            .lock()
            .expect("pinto cache poisoned")
            .servers
            .get(&server)
            .map(|d| d.region)
    }

    pub fn max_size(&self, server: ServerId) -> Option<f32> {
        self.inner
            .lock()
            .expect("pinto cache poisoned")
            .servers
            .get(&server)
            .map(|d| d.max_size)
    }

    pub fn is_aggregate(&self, server: ServerId) -> Option<bool> {
        self.inner
            .lock()
            .expect("pinto cache poisoned")
            .servers
            .get(&server)
            .map(|d| d.aggregate)
    }

    /// Placeholder-imposter ingress; accepted and ignored, same as the
    /// per-object cache.
    pub fn add_placeholder_imposter(
        &self,
        _id: ObjectId,
        _center_offset: Vector3,
        _center_bounds_radius: f32,
        _max_size: f32,
        _zernike: Option<String>,
        _mesh: String,
    ) {
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use core_motion::{MotionVector3, Time};
    use std::sync::Arc;
    use std::sync::atomic::{AtomicUsize, Ordering};

    fn loc(x: f32) -> TimedMotionVector3 {
        TimedMotionVector3::new(
            Time::null(),
            MotionVector3::stationary(Vector3::new(x, 0.0, 0.0)),
        )
    }

    #[derive(Default)]
    struct CountingListener {
        connects: Arc<AtomicUsize>,
        disconnects: Arc<AtomicUsize>,
        updates: Arc<AtomicUsize>,
    }

    impl PintoCacheListener for CountingListener {
        fn location_connected(
            &mut self,
            _server: ServerId,
            _location: TimedMotionVector3,
            _region: BoundingSphere,
            _max_size: f32,
        ) {
            self.connects.fetch_add(1, Ordering::Relaxed);
        }
        fn location_disconnected(&mut self, _server: ServerId) {
            self.disconnects.fetch_add(1, Ordering::Relaxed);
        }
        fn location_position_updated(
            &mut self,
            _server: ServerId,
            _old: TimedMotionVector3,
            _new: TimedMotionVector3,
        ) {
            self.updates.fetch_add(1, Ordering::Relaxed);
        }
        fn location_region_updated(
            &mut self,
            _server: ServerId,
            _old: BoundingSphere,
            _new: BoundingSphere,
        ) {
            self.updates.fetch_add(1, Ordering::Relaxed);
        }
        fn location_max_size_updated(&mut self, _server: ServerId, _old: f32, _new: f32) {
            self.updates.fetch_add(1, Ordering::Relaxed);
        }
    }

    #[test]
    fn fresh_admission_connects_refresh_updates() {
        let cache = PintoCache::new();
        let connects = Arc::new(AtomicUsize::new(0));
        let updates = Arc::new(AtomicUsize::new(0));
        cache.add_listener(Box::new(CountingListener {
            connects: connects.clone(),
            updates: updates.clone(),
            ..Default::default()
        }));

        let sid = ServerId(7);
        cache.add_space_server(sid, loc(1.0), BoundingSphere::default(), 2.0);
        assert_eq!(connects.load(Ordering::Relaxed), 1);
        assert_eq!(updates.load(Ordering::Relaxed), 0);

        cache.add_space_server(sid, loc(2.0), BoundingSphere::default(), 3.0);
        assert_eq!(connects.load(Ordering::Relaxed), 1);
        assert_eq!(updates.load(Ordering::Relaxed), 3);
    }

    #[test]
    fn tracked_server_removal_is_deferred() {
        let cache = PintoCache::new();
        let disconnects = Arc::new(AtomicUsize::new(0));
        cache.add_listener(Box::new(CountingListener {
            disconnects: disconnects.clone(),
            ..Default::default()
        }));

        let sid = ServerId(3);
        cache.add_space_server(sid, loc(0.0), BoundingSphere::default(), 1.0);
        assert!(cache.start_tracking(sid));
        cache.remove_space_server(sid);
        assert!(cache.contains(sid));
        assert_eq!(disconnects.load(Ordering::Relaxed), 0);

        cache.stop_tracking(sid);
        assert!(!cache.contains(sid));
        assert_eq!(disconnects.load(Ordering::Relaxed), 1);
    }

    #[test]
    fn aggregates_are_silent_and_explicitly_removed() {
        let cache = PintoCache::new();
        let connects = Arc::new(AtomicUsize::new(0));
        cache.add_listener(Box::new(CountingListener {
            connects: connects.clone(),
            ..Default::default()
        }));

        let agg = ServerId(100);
        cache.add_aggregate(agg);
        assert_eq!(connects.load(Ordering::Relaxed), 0);
        assert_eq!(cache.is_aggregate(agg), Some(true));

        cache.update_aggregate_bounds(
            agg,
            AggregateBoundingInfo::new(Vector3::zero(), 5.0, 2.0),
        );
        assert_eq!(cache.region(agg).unwrap().radius, 5.0);
        assert_eq!(cache.max_size(agg), Some(2.0));

        cache.remove_aggregate(agg);
        assert!(!cache.contains(agg));
    }

    #[test]
    #[should_panic(expected = "removed while tracked")]
    fn tracked_aggregate_removal_panics() {
        let cache = PintoCache::new();
        let agg = ServerId(9);
        cache.add_aggregate(agg);
        assert!(cache.start_tracking(agg));
        cache.remove_aggregate(agg);
    }
}
