//! The sequenced presence store proper.

use crate::attrs::{AttrMask, AttrPart};
use crate::update::PresenceUpdate;
use ahash::AHashMap;
use core_motion::{
    AggregateBoundingInfo, ObjectId, SeqNo, TimedMotionQuaternion, TimedMotionVector3,
};
use tracing::{debug, warn};

/// Where the authority for a record lives.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Locality {
    /// This server owns the object; updates arrive from its session.
    Local,
    /// Authoritative on another server; updates arrive over the peer stream.
    Replica,
}

/// Sequenced attribute set of one presence. Every attribute carries the seqno
/// of the write that produced it; `apply` is the only mutation path.
#[derive(Debug, Clone, PartialEq)]
pub struct SequencedPresence {
    location: TimedMotionVector3,
    orientation: TimedMotionQuaternion,
    bounds: AggregateBoundingInfo,
    mesh: String,
    physics: String,
    parent: Option<ObjectId>,
    zernike: Option<String>,
    seqnos: [SeqNo; AttrPart::COUNT],
    epoch: Option<u64>,
}

impl Default for SequencedPresence {
    fn default() -> Self {
        Self {
            location: TimedMotionVector3::default(),
            orientation: TimedMotionQuaternion::default(),
            bounds: AggregateBoundingInfo::default(),
            mesh: String::new(),
            physics: String::new(),
            parent: None,
            zernike: None,
            seqnos: [SeqNo::zero(); AttrPart::COUNT],
            epoch: None,
        }
    }
}

impl SequencedPresence {
    /// Initial state for a freshly admitted object. Seeds every attribute at
    /// the given seqno so a replayed admission does not regress later writes.
    pub fn initial(
        location: TimedMotionVector3,
        orientation: TimedMotionQuaternion,
        bounds: AggregateBoundingInfo,
        mesh: String,
        physics: String,
        zernike: Option<String>,
        seqno: SeqNo,
    ) -> Self {
        Self {
            location,
            orientation,
            bounds,
            mesh,
            physics,
            parent: None,
            zernike,
            seqnos: [seqno; AttrPart::COUNT],
            epoch: None,
        }
    }

    pub fn location(&self) -> TimedMotionVector3 {
        self.location
    }

    pub fn orientation(&self) -> TimedMotionQuaternion {
        self.orientation
    }

    pub fn bounds(&self) -> AggregateBoundingInfo {
        self.bounds
    }

    pub fn mesh(&self) -> &str {
        &self.mesh
    }

    pub fn physics(&self) -> &str {
        &self.physics
    }

    pub fn parent(&self) -> Option<ObjectId> {
        self.parent
    }

    pub fn zernike(&self) -> Option<&str> {
        self.zernike.as_deref()
    }

    pub fn seqno(&self, part: AttrPart) -> SeqNo {
        self.seqnos[part.index()]
    }

    pub fn epoch(&self) -> Option<u64> {
        self.epoch
    }

    /// Apply a batch, accepting each attribute independently. Returns the
    /// mask of attributes that actually landed. An attribute whose proposed
    /// seqno does not strictly exceed the stored one is dropped; the rest of
    /// the batch is unaffected.
    pub fn apply(&mut self, update: &PresenceUpdate) -> AttrMask {
        let mut accepted = AttrMask::empty();

        if let Some((value, seqno)) = update.location {
            if seqno.supersedes(self.seqno(AttrPart::Location)) {
                self.location = value;
                self.seqnos[AttrPart::Location.index()] = seqno;
                accepted |= AttrPart::Location.mask();
            }
        }
        if let Some((value, seqno)) = update.orientation {
            if seqno.supersedes(self.seqno(AttrPart::Orientation)) {
                self.orientation = value;
                self.seqnos[AttrPart::Orientation.index()] = seqno;
                accepted |= AttrPart::Orientation.mask();
            }
        }
        if let Some((value, seqno)) = update.bounds {
            if seqno.supersedes(self.seqno(AttrPart::Bounds)) {
                self.bounds = value;
                self.seqnos[AttrPart::Bounds.index()] = seqno;
                accepted |= AttrPart::Bounds.mask();
            }
        }
        if let Some((ref value, seqno)) = update.mesh {
            if seqno.supersedes(self.seqno(AttrPart::Mesh)) {
                self.mesh = value.clone();
                self.seqnos[AttrPart::Mesh.index()] = seqno;
                accepted |= AttrPart::Mesh.mask();
            }
        }
        if let Some((ref value, seqno)) = update.physics {
            if seqno.supersedes(self.seqno(AttrPart::Physics)) {
                self.physics = value.clone();
                self.seqnos[AttrPart::Physics.index()] = seqno;
                accepted |= AttrPart::Physics.mask();
            }
        }
        if let Some((value, seqno)) = update.parent {
            if seqno.supersedes(self.seqno(AttrPart::Parent)) {
                self.parent = value;
                self.seqnos[AttrPart::Parent.index()] = seqno;
                accepted |= AttrPart::Parent.mask();
            }
        }
        if let Some((ref value, seqno)) = update.zernike {
            if seqno.supersedes(self.seqno(AttrPart::Zernike)) {
                self.zernike = value.clone();
                self.seqnos[AttrPart::Zernike.index()] = seqno;
                accepted |= AttrPart::Zernike.mask();
            }
        }

        if !accepted.is_empty() {
            if let Some(epoch) = update.epoch {
                self.epoch = Some(epoch);
            }
        }

        accepted
    }
}

#[derive(Debug, Clone)]
struct PresenceRecord {
    props: SequencedPresence,
    locality: Locality,
    aggregate: bool,
}

/// Fine-grained mutation notification. One `AttributeUpdated` per accepted
/// attribute, in slot order; `Added`/`Removed` bracket the record lifetime.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StoreEvent {
    Added {
        id: ObjectId,
        locality: Locality,
        aggregate: bool,
    },
    Removed {
        id: ObjectId,
        locality: Locality,
        aggregate: bool,
    },
    AttributeUpdated {
        id: ObjectId,
        locality: Locality,
        aggregate: bool,
        part: AttrPart,
    },
}

impl StoreEvent {
    pub fn id(&self) -> ObjectId {
        match *self {
            StoreEvent::Added { id, .. }
            | StoreEvent::Removed { id, .. }
            | StoreEvent::AttributeUpdated { id, .. } => id,
        }
    }

    pub fn is_aggregate(&self) -> bool {
        match *self {
            StoreEvent::Added { aggregate, .. }
            | StoreEvent::Removed { aggregate, .. }
            | StoreEvent::AttributeUpdated { aggregate, .. } => aggregate,
        }
    }
}

/// Map from object id to presence record, plus the counters the admin
/// surface reports. All mutation happens on the strand; the store has no
/// interior locking.
#[derive(Debug, Default)]
pub struct PresenceStore {
    records: AHashMap<ObjectId, PresenceRecord>,
    local_count: usize,
    replica_count: usize,
    aggregate_count: usize,
}

impl PresenceStore {
    pub fn new() -> Self {
        Self::default()
    }

    fn admit(
        &mut self,
        id: ObjectId,
        props: SequencedPresence,
        locality: Locality,
        aggregate: bool,
    ) -> Option<StoreEvent> {
        if let Some(existing) = self.records.get(&id) {
            warn!(
                target: "loc.store",
                %id,
                existing = ?existing.locality,
                requested = ?locality,
                "ignoring re-admission of live object"
            );
            return None;
        }
        self.records.insert(
            id,
            PresenceRecord {
                props,
                locality,
                aggregate,
            },
        );
        match locality {
            Locality::Local => self.local_count += 1,
            Locality::Replica => self.replica_count += 1,
        }
        if aggregate {
            self.aggregate_count += 1;
        }
        Some(StoreEvent::Added {
            id,
            locality,
            aggregate,
        })
    }

    pub fn add_local(&mut self, id: ObjectId, props: SequencedPresence) -> Option<StoreEvent> {
        self.admit(id, props, Locality::Local, false)
    }

    pub fn add_replica(&mut self, id: ObjectId, props: SequencedPresence) -> Option<StoreEvent> {
        self.admit(id, props, Locality::Replica, false)
    }

    /// Aggregates are local records visible only to listeners that opted in.
    pub fn add_aggregate(&mut self, id: ObjectId, props: SequencedPresence) -> Option<StoreEvent> {
        self.admit(id, props, Locality::Local, true)
    }

    fn evict(&mut self, id: ObjectId, expect: Locality) -> Option<StoreEvent> {
        match self.records.get(&id) {
            Some(rec) if rec.locality == expect => {}
            Some(rec) => {
                warn!(
                    target: "loc.store",
                    %id,
                    actual = ?rec.locality,
                    expected = ?expect,
                    "remove with mismatched locality ignored"
                );
                return None;
            }
            None => {
                debug!(target: "loc.store", %id, "remove of unknown object ignored");
                return None;
            }
        }
        let rec = self.records.remove(&id).expect("checked above");
        match rec.locality {
            Locality::Local => self.local_count -= 1,
            Locality::Replica => self.replica_count -= 1,
        }
        if rec.aggregate {
            self.aggregate_count -= 1;
        }
        Some(StoreEvent::Removed {
            id,
            locality: rec.locality,
            aggregate: rec.aggregate,
        })
    }

    pub fn remove_local(&mut self, id: ObjectId) -> Option<StoreEvent> {
        self.evict(id, Locality::Local)
    }

    pub fn remove_replica(&mut self, id: ObjectId) -> Option<StoreEvent> {
        self.evict(id, Locality::Replica)
    }

    /// Apply a batch to a live record. Unknown ids drop the whole update with
    /// a debug log (the caller may have an orphan subscription waiting, but
    /// updates never create records). Returns one event per accepted
    /// attribute, in slot order.
    pub fn apply(&mut self, id: ObjectId, update: &PresenceUpdate) -> Vec<StoreEvent> {
        let Some(rec) = self.records.get_mut(&id) else {
            debug!(target: "loc.store", %id, "update for unknown object dropped");
            return Vec::new();
        };
        let requested = update.mask();
        let accepted = rec.props.apply(update);
        let rejected = requested - accepted;
        if !rejected.is_empty() {
            debug!(
                target: "loc.store",
                %id,
                rejected = ?rejected,
                "stale attributes dropped"
            );
        }
        let locality = rec.locality;
        let aggregate = rec.aggregate;
        accepted
            .parts()
            .map(|part| StoreEvent::AttributeUpdated {
                id,
                locality,
                aggregate,
                part,
            })
            .collect()
    }

    pub fn contains(&self, id: ObjectId) -> bool {
        self.records.contains_key(&id)
    }

    pub fn locality(&self, id: ObjectId) -> Option<Locality> {
        self.records.get(&id).map(|r| r.locality)
    }

    pub fn is_local(&self, id: ObjectId) -> bool {
        matches!(self.locality(id), Some(Locality::Local))
    }

    pub fn is_aggregate(&self, id: ObjectId) -> bool {
        self.records.get(&id).map(|r| r.aggregate).unwrap_or(false)
    }

    pub fn props(&self, id: ObjectId) -> Option<&SequencedPresence> {
        self.records.get(&id).map(|r| &r.props)
    }

    pub fn len(&self) -> usize {
        self.records.len()
    }

    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }

    pub fn local_count(&self) -> usize {
        self.local_count
    }

    pub fn replica_count(&self) -> usize {
        self.replica_count
    }

    pub fn aggregate_count(&self) -> usize {
        self.aggregate_count
    }

    /// Iterate every live record. Used to replay the world into a freshly
    /// built query handler and to seed the location cache.
    pub fn iter(&self) -> impl Iterator<Item = (ObjectId, &SequencedPresence, Locality, bool)> {
        self.records
            .iter()
            .map(|(id, rec)| (*id, &rec.props, rec.locality, rec.aggregate))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use core_motion::{MotionVector3, Time, Vector3};

    fn mv(x: f32) -> TimedMotionVector3 {
        TimedMotionVector3::new(
            Time::from_secs(1),
            MotionVector3::stationary(Vector3::new(x, 0.0, 0.0)),
        )
    }

    fn seeded(id: u64) -> (ObjectId, SequencedPresence) {
        (ObjectId::from_index(id), SequencedPresence::default())
    }

    #[test]
    fn stale_location_write_is_dropped() {
        let mut store = PresenceStore::new();
        let (id, props) = seeded(1);
        store.add_local(id, props);

        let up5 = PresenceUpdate::default().with_location(mv(5.0), SeqNo(5));
        let up3 = PresenceUpdate::default().with_location(mv(3.0), SeqNo(3));
        assert_eq!(store.apply(id, &up5).len(), 1);
        assert_eq!(store.apply(id, &up3).len(), 0);

        let props = store.props(id).unwrap();
        assert_eq!(props.seqno(AttrPart::Location), SeqNo(5));
        assert_eq!(
            props.location().position_at(Time::from_secs(1)),
            Vector3::new(5.0, 0.0, 0.0)
        );
    }

    #[test]
    fn identical_seqno_first_write_wins() {
        let mut store = PresenceStore::new();
        let (id, props) = seeded(1);
        store.add_local(id, props);

        let first = PresenceUpdate::default().with_mesh("meerkat:///a.dae", SeqNo(2));
        let second = PresenceUpdate::default().with_mesh("meerkat:///b.dae", SeqNo(2));
        assert_eq!(store.apply(id, &first).len(), 1);
        assert_eq!(store.apply(id, &second).len(), 0);
        assert_eq!(store.props(id).unwrap().mesh(), "meerkat:///a.dae");
    }

    #[test]
    fn duplicate_batch_is_idempotent() {
        let mut store = PresenceStore::new();
        let (id, props) = seeded(1);
        store.add_local(id, props);

        let up = PresenceUpdate::default()
            .with_location(mv(1.0), SeqNo(4))
            .with_physics("rigid", SeqNo(4));
        assert_eq!(store.apply(id, &up).len(), 2);
        assert_eq!(store.apply(id, &up).len(), 0);
    }

    #[test]
    fn partial_staleness_accepts_fresh_attributes() {
        let mut store = PresenceStore::new();
        let (id, props) = seeded(1);
        store.add_local(id, props);

        store.apply(id, &PresenceUpdate::default().with_location(mv(1.0), SeqNo(9)));
        let mixed = PresenceUpdate::default()
            .with_location(mv(2.0), SeqNo(3)) // stale
            .with_mesh("meerkat:///m.dae", SeqNo(1)); // fresh
        let events = store.apply(id, &mixed);
        assert_eq!(events.len(), 1);
        assert!(matches!(
            events[0],
            StoreEvent::AttributeUpdated {
                part: AttrPart::Mesh,
                ..
            }
        ));
    }

    #[test]
    fn update_for_unknown_object_is_dropped() {
        let mut store = PresenceStore::new();
        let events = store.apply(
            ObjectId::from_index(42),
            &PresenceUpdate::default().with_location(mv(0.0), SeqNo(1)),
        );
        assert!(events.is_empty());
    }

    #[test]
    fn local_and_replica_sets_stay_disjoint() {
        let mut store = PresenceStore::new();
        let (id, props) = seeded(1);
        assert!(store.add_local(id, props.clone()).is_some());
        assert!(store.add_replica(id, props).is_none());
        assert_eq!(store.local_count(), 1);
        assert_eq!(store.replica_count(), 0);
    }

    #[test]
    fn counters_follow_lifecycle() {
        let mut store = PresenceStore::new();
        store.add_local(ObjectId::from_index(1), SequencedPresence::default());
        store.add_replica(ObjectId::from_index(2), SequencedPresence::default());
        store.add_aggregate(ObjectId::from_index(3), SequencedPresence::default());
        assert_eq!(
            (store.local_count(), store.replica_count(), store.aggregate_count()),
            (2, 1, 1)
        );
        store.remove_local(ObjectId::from_index(3));
        assert_eq!(store.aggregate_count(), 0);
        assert_eq!(store.local_count(), 1);
    }

    #[test]
    fn remove_with_wrong_locality_is_ignored() {
        let mut store = PresenceStore::new();
        let (id, props) = seeded(1);
        store.add_local(id, props);
        assert!(store.remove_replica(id).is_none());
        assert!(store.contains(id));
        assert!(store.remove_local(id).is_some());
        assert!(!store.contains(id));
    }

    #[test]
    fn epoch_recorded_only_on_accepted_writes() {
        let mut store = PresenceStore::new();
        let (id, props) = seeded(1);
        store.add_local(id, props);

        store.apply(
            id,
            &PresenceUpdate::default()
                .with_location(mv(1.0), SeqNo(5))
                .with_epoch(77),
        );
        assert_eq!(store.props(id).unwrap().epoch(), Some(77));

        // Entirely stale batch must not disturb the recorded epoch.
        store.apply(
            id,
            &PresenceUpdate::default()
                .with_location(mv(2.0), SeqNo(5))
                .with_epoch(99),
        );
        assert_eq!(store.props(id).unwrap().epoch(), Some(77));
    }
}
