//! Per-object location cache with pinned-entry lifetime management.
//!
//! The spatial index holds references to entries across ticks; the world can
//! logically remove an object at any moment. The cache reconciles the two
//! with a generational slot table: a `Cursor` is `(slot, generation)`, pins
//! keep the slot alive, and a removable slot is physically reaped, with a
//! disconnect event, only when its pin count reaches zero.
//!
//! Invariants:
//! * A cursor obtained from `start_tracking` stays readable until the
//!   matching `stop_tracking`, even across logical removal.
//! * No new cursor can be opened on a logically removed entry.
//! * Generation mismatch on access is a programmer error (a cursor outlived
//!   its release) and panics with a diagnostic.

use ahash::AHashMap;
use core_motion::{BoundingSphere, ObjectId, TimedMotionVector3, Vector3};
use tracing::debug;

/// Snapshot of one object as the spatial index sees it.
#[derive(Debug, Clone, PartialEq)]
pub struct CacheEntry {
    pub id: ObjectId,
    pub location: TimedMotionVector3,
    pub center_offset: Vector3,
    pub center_bounds_radius: f32,
    pub max_size: f32,
    pub mesh: String,
    pub zernike: Option<String>,
    pub aggregate: bool,
    pub local: bool,
}

impl CacheEntry {
    /// Sphere bounding member centers, in coordinates relative to the
    /// extrapolated object position.
    pub fn region(&self) -> BoundingSphere {
        BoundingSphere::new(self.center_offset, self.center_bounds_radius)
    }
}

/// Opaque pinned-entry handle. Copyable; each copy still represents the one
/// pin taken at `start_tracking`; release exactly once.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Cursor {
    slot: usize,
    generation: u32,
}

#[derive(Debug)]
struct Slot {
    generation: u32,
    pins: u32,
    removable: bool,
    entry: CacheEntry,
}

/// Change notification. Geometric updates carry the old value because the
/// index repairs aggregate bounds incrementally.
#[derive(Debug, Clone, PartialEq)]
pub enum CacheEvent {
    Connected {
        id: ObjectId,
        aggregate: bool,
        local: bool,
    },
    Disconnected {
        id: ObjectId,
    },
    PositionUpdated {
        id: ObjectId,
        old: TimedMotionVector3,
        new: TimedMotionVector3,
    },
    RegionUpdated {
        id: ObjectId,
        old: BoundingSphere,
        new: BoundingSphere,
    },
    MaxSizeUpdated {
        id: ObjectId,
        old: f32,
        new: f32,
    },
}

/// Listener surface mirroring `CacheEvent`, for consumers that prefer
/// callbacks over event vectors (the query handlers implement this).
pub trait LocationCacheListener {
    fn location_connected(
        &mut self,
        cache: &LocationCache,
        id: ObjectId,
        aggregate: bool,
        local: bool,
    );
    fn location_disconnected(&mut self, id: ObjectId);
    fn location_position_updated(
        &mut self,
        cache: &LocationCache,
        id: ObjectId,
        old: TimedMotionVector3,
        new: TimedMotionVector3,
    );
    fn location_region_updated(
        &mut self,
        cache: &LocationCache,
        id: ObjectId,
        old: BoundingSphere,
        new: BoundingSphere,
    );
    fn location_max_size_updated(
        &mut self,
        cache: &LocationCache,
        id: ObjectId,
        old: f32,
        new: f32,
    );
}

/// Replay a batch of cache events into a listener.
pub fn dispatch_cache_events<L: LocationCacheListener + ?Sized>(
    cache: &LocationCache,
    events: &[CacheEvent],
    listener: &mut L,
) {
    for ev in events {
        match ev {
            CacheEvent::Connected {
                id,
                aggregate,
                local,
            } => listener.location_connected(cache, *id, *aggregate, *local),
            CacheEvent::Disconnected { id } => listener.location_disconnected(*id),
            CacheEvent::PositionUpdated { id, old, new } => {
                listener.location_position_updated(cache, *id, *old, *new)
            }
            CacheEvent::RegionUpdated { id, old, new } => {
                listener.location_region_updated(cache, *id, *old, *new)
            }
            CacheEvent::MaxSizeUpdated { id, old, new } => {
                listener.location_max_size_updated(cache, *id, *old, *new)
            }
        }
    }
}

#[derive(Debug, Default)]
pub struct LocationCache {
    slots: Vec<Option<Slot>>,
    free: Vec<usize>,
    index: AHashMap<ObjectId, usize>,
    next_generation: u32,
}

impl LocationCache {
    pub fn new() -> Self {
        Self::default()
    }

    /// Admit an entry. Re-connecting a live id is a programmer error (the
    /// store already rejects duplicate admissions).
    pub fn connect(&mut self, entry: CacheEntry) -> CacheEvent {
        assert!(
            !self.index.contains_key(&entry.id),
            "location cache: connect of live entry {}",
            entry.id
        );
        let id = entry.id;
        let aggregate = entry.aggregate;
        let local = entry.local;
        self.next_generation = self.next_generation.wrapping_add(1);
        let slot = Slot {
            generation: self.next_generation,
            pins: 0,
            removable: false,
            entry,
        };
        let idx = match self.free.pop() {
            Some(idx) => {
                self.slots[idx] = Some(slot);
                idx
            }
            None => {
                self.slots.push(Some(slot));
                self.slots.len() - 1
            }
        };
        self.index.insert(id, idx);
        CacheEvent::Connected {
            id,
            aggregate,
            local,
        }
    }

    /// Logical removal. Reaps immediately when unpinned; otherwise flags the
    /// slot removable and defers to the last `stop_tracking`.
    pub fn disconnect(&mut self, id: ObjectId) -> Option<CacheEvent> {
        let idx = *self.index.get(&id)?;
        let slot = self.slots[idx].as_mut().expect("indexed slot is live");
        if slot.pins > 0 {
            slot.removable = true;
            debug!(target: "loc.cache", %id, pins = slot.pins, "disconnect deferred until pins release");
            return None;
        }
        self.reap(idx);
        Some(CacheEvent::Disconnected { id })
    }

    fn reap(&mut self, idx: usize) {
        let slot = self.slots[idx].take().expect("reaping live slot");
        self.index.remove(&slot.entry.id);
        self.free.push(idx);
    }

    fn live_slot_mut(&mut self, id: ObjectId) -> Option<&mut Slot> {
        let idx = *self.index.get(&id)?;
        let slot = self.slots[idx].as_mut().expect("indexed slot is live");
        if slot.removable { None } else { Some(slot) }
    }

    pub fn update_location(
        &mut self,
        id: ObjectId,
        new: TimedMotionVector3,
    ) -> Option<CacheEvent> {
        let slot = self.live_slot_mut(id)?;
        let old = slot.entry.location;
        slot.entry.location = new;
        Some(CacheEvent::PositionUpdated { id, old, new })
    }

    /// Bounds changes fan out as up to two events: a region delta and a
    /// max-size delta, each emitted only when the component actually moved.
    pub fn update_bounds(
        &mut self,
        id: ObjectId,
        center_offset: Vector3,
        center_bounds_radius: f32,
        max_size: f32,
    ) -> Vec<CacheEvent> {
        let Some(slot) = self.live_slot_mut(id) else {
            return Vec::new();
        };
        let mut events = Vec::with_capacity(2);
        let old_region = slot.entry.region();
        let new_region = BoundingSphere::new(center_offset, center_bounds_radius);
        if old_region != new_region {
            slot.entry.center_offset = center_offset;
            slot.entry.center_bounds_radius = center_bounds_radius;
            events.push(CacheEvent::RegionUpdated {
                id,
                old: old_region,
                new: new_region,
            });
        }
        if slot.entry.max_size != max_size {
            let old = slot.entry.max_size;
            slot.entry.max_size = max_size;
            events.push(CacheEvent::MaxSizeUpdated {
                id,
                old,
                new: max_size,
            });
        }
        events
    }

    /// Mesh and zernike are carried for consumers of the cache view but are
    /// not geometric: no event, silent refresh.
    pub fn update_mesh(&mut self, id: ObjectId, mesh: String) {
        if let Some(slot) = self.live_slot_mut(id) {
            slot.entry.mesh = mesh;
        }
    }

    pub fn update_zernike(&mut self, id: ObjectId, zernike: Option<String>) {
        if let Some(slot) = self.live_slot_mut(id) {
            slot.entry.zernike = zernike;
        }
    }

    /// Placeholder-imposter ingress. Aggregate listeners may feed imposters
    /// here; this cache derives everything it needs from the store, so the
    /// call is accepted and ignored.
    pub fn add_placeholder_imposter(
        &mut self,
        _id: ObjectId,
        _center_offset: Vector3,
        _center_bounds_radius: f32,
        _max_size: f32,
        _zernike: Option<String>,
        _mesh: String,
    ) {
    }

    /// Pin an entry, returning a cursor for O(1) access. `None` when the id
    /// is unknown or already logically removed (no new cursors after
    /// removal).
    pub fn start_tracking(&mut self, id: ObjectId) -> Option<Cursor> {
        let idx = *self.index.get(&id)?;
        let slot = self.slots[idx].as_mut().expect("indexed slot is live");
        if slot.removable {
            debug!(target: "loc.cache", %id, "refusing cursor on removed entry");
            return None;
        }
        slot.pins += 1;
        Some(Cursor {
            slot: idx,
            generation: slot.generation,
        })
    }

    /// Release a pin. Returns the disconnect event when this release reaps a
    /// removable entry.
    pub fn stop_tracking(&mut self, cursor: Cursor) -> Option<CacheEvent> {
        let slot = self.slot_for(cursor);
        assert!(slot.pins > 0, "location cache: unbalanced stop_tracking");
        slot.pins -= 1;
        let id = slot.entry.id;
        if slot.pins == 0 && slot.removable {
            self.reap(cursor.slot);
            return Some(CacheEvent::Disconnected { id });
        }
        None
    }

    /// Refcount flavour of tracking for holders that do not keep the cursor.
    pub fn start_refcount_tracking(&mut self, id: ObjectId) -> bool {
        self.start_tracking(id).is_some()
    }

    pub fn stop_refcount_tracking(&mut self, id: ObjectId) -> Option<CacheEvent> {
        let idx = *self
            .index
            .get(&id)
            .unwrap_or_else(|| panic!("location cache: refcount release of unknown {id}"));
        let generation = self.slots[idx]
            .as_ref()
            .expect("indexed slot is live")
            .generation;
        self.stop_tracking(Cursor {
            slot: idx,
            generation,
        })
    }

    /// Is the entry currently pinned by anyone?
    pub fn tracking(&self, id: ObjectId) -> bool {
        self.index
            .get(&id)
            .map(|&idx| {
                self.slots[idx]
                    .as_ref()
                    .expect("indexed slot is live")
                    .pins
                    > 0
            })
            .unwrap_or(false)
    }

    fn slot_for(&mut self, cursor: Cursor) -> &mut Slot {
        let slot = self.slots[cursor.slot]
            .as_mut()
            .expect("location cache: cursor references reaped slot");
        assert_eq!(
            slot.generation, cursor.generation,
            "location cache: stale cursor generation"
        );
        slot
    }

    /// Entry behind a cursor. Valid until the pin is released, including
    /// after logical removal.
    pub fn entry(&self, cursor: Cursor) -> &CacheEntry {
        let slot = self.slots[cursor.slot]
            .as_ref()
            .expect("location cache: cursor references reaped slot");
        assert_eq!(
            slot.generation, cursor.generation,
            "location cache: stale cursor generation"
        );
        &slot.entry
    }

    /// Entry by id; `None` once logically removed.
    pub fn get(&self, id: ObjectId) -> Option<&CacheEntry> {
        let idx = *self.index.get(&id)?;
        let slot = self.slots[idx].as_ref().expect("indexed slot is live");
        if slot.removable { None } else { Some(&slot.entry) }
    }

    pub fn contains(&self, id: ObjectId) -> bool {
        self.get(id).is_some()
    }

    pub fn len(&self) -> usize {
        self.index.len()
    }

    pub fn is_empty(&self) -> bool {
        self.index.is_empty()
    }

    /// Iterate live (not logically removed) entries.
    pub fn iter(&self) -> impl Iterator<Item = &CacheEntry> {
        self.slots
            .iter()
            .filter_map(|s| s.as_ref())
            .filter(|s| !s.removable)
            .map(|s| &s.entry)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use core_motion::{MotionVector3, Time};

    fn entry(id: u64, x: f32, radius: f32) -> CacheEntry {
        CacheEntry {
            id: ObjectId::from_index(id),
            location: TimedMotionVector3::new(
                Time::null(),
                MotionVector3::stationary(Vector3::new(x, 0.0, 0.0)),
            ),
            center_offset: Vector3::zero(),
            center_bounds_radius: 0.0,
            max_size: radius,
            mesh: String::new(),
            zernike: None,
            aggregate: false,
            local: true,
        }
    }

    #[test]
    fn tracked_removal_defers_reap_and_disconnect() {
        let mut cache = LocationCache::new();
        let id = ObjectId::from_index(1);
        cache.connect(entry(1, 3.0, 1.0));

        let cursor = cache.start_tracking(id).unwrap();
        assert!(cache.disconnect(id).is_none(), "pinned entry must not reap");

        // Cursor still reads the last values.
        assert_eq!(cache.entry(cursor).max_size, 1.0);
        // No new cursors after logical removal.
        assert!(cache.start_tracking(id).is_none());
        assert!(cache.get(id).is_none());

        let ev = cache.stop_tracking(cursor);
        assert_eq!(ev, Some(CacheEvent::Disconnected { id }));
        assert!(!cache.tracking(id));
        assert_eq!(cache.len(), 0);
    }

    #[test]
    fn unpinned_disconnect_reaps_immediately() {
        let mut cache = LocationCache::new();
        let id = ObjectId::from_index(1);
        cache.connect(entry(1, 0.0, 1.0));
        assert_eq!(cache.disconnect(id), Some(CacheEvent::Disconnected { id }));
        assert!(!cache.contains(id));
    }

    #[test]
    fn multiple_pins_release_in_any_order() {
        let mut cache = LocationCache::new();
        let id = ObjectId::from_index(1);
        cache.connect(entry(1, 0.0, 1.0));
        let a = cache.start_tracking(id).unwrap();
        assert!(cache.start_refcount_tracking(id));
        cache.disconnect(id);

        assert!(cache.stop_refcount_tracking(id).is_none());
        assert_eq!(cache.stop_tracking(a), Some(CacheEvent::Disconnected { id }));
    }

    #[test]
    fn slot_reuse_bumps_generation() {
        let mut cache = LocationCache::new();
        let id1 = ObjectId::from_index(1);
        cache.connect(entry(1, 0.0, 1.0));
        let c1 = cache.start_tracking(id1).unwrap();
        cache.disconnect(id1);
        cache.stop_tracking(c1);

        // The freed slot is reused by the next connect with a fresh
        // generation, so the old cursor can never alias the new entry.
        cache.connect(entry(2, 0.0, 1.0));
        let c2 = cache.start_tracking(ObjectId::from_index(2)).unwrap();
        assert_ne!(c1, c2);
        cache.stop_tracking(c2);
    }

    #[test]
    fn geometric_updates_carry_old_and_new() {
        let mut cache = LocationCache::new();
        let id = ObjectId::from_index(1);
        cache.connect(entry(1, 1.0, 2.0));

        let new_loc = TimedMotionVector3::new(
            Time::from_secs(5),
            MotionVector3::stationary(Vector3::new(9.0, 0.0, 0.0)),
        );
        match cache.update_location(id, new_loc) {
            Some(CacheEvent::PositionUpdated { old, new, .. }) => {
                assert_eq!(old.position_at(Time::null()).x, 1.0);
                assert_eq!(new.position_at(Time::from_secs(5)).x, 9.0);
            }
            other => panic!("unexpected event {other:?}"),
        }

        let events = cache.update_bounds(id, Vector3::zero(), 4.0, 3.0);
        assert_eq!(events.len(), 2);
        assert!(matches!(
            events[0],
            CacheEvent::RegionUpdated { old, new, .. }
                if old.radius == 0.0 && new.radius == 4.0
        ));
        assert!(matches!(
            events[1],
            CacheEvent::MaxSizeUpdated { old: 2.0, new: 3.0, .. }
        ));
    }

    #[test]
    fn updates_after_logical_removal_are_ignored() {
        let mut cache = LocationCache::new();
        let id = ObjectId::from_index(1);
        cache.connect(entry(1, 0.0, 1.0));
        let c = cache.start_tracking(id).unwrap();
        cache.disconnect(id);
        assert!(cache.update_location(id, TimedMotionVector3::default()).is_none());
        assert!(cache.update_bounds(id, Vector3::zero(), 1.0, 1.0).is_empty());
        cache.stop_tracking(c);
    }
}
