//! Location update policy: the subscription registry and the coalescing
//! flush.
//!
//! One subscription per `(subscriber, object, optional index)`. Store
//! notifications mark bits in a pending attribute mask; the periodic flush
//! turns every dirty subscription into exactly one outbound message carrying
//! only the masked attributes, each stamped with its current store seqno.
//! A failed enqueue restores the mask, so the next flush retries with
//! whatever has accumulated since; dropped transports delay updates, they
//! never lose the latest state.
//!
//! Subscribing to an object the store does not know yet is allowed: the
//! subscription is held as an *orphan* and drained with a synthetic
//! full-attribute add the moment the record arrives.

use crate::transport::{SubscriberId, TransportSinks};
use ahash::{AHashMap, AHashSet};
use core_motion::{ObjectId, ProxIndexId, SeqNoPtr};
use core_presence::{AttrMask, PresenceLocUpdateWithEpoch, PresenceStore, StoreEvent};
use core_wire::LocUpdateRecord;
use std::sync::atomic::AtomicU64;
use tracing::{debug, trace, warn};

// Flush telemetry, mirroring the channel counters in core-events.
pub static FLUSH_MESSAGES: AtomicU64 = AtomicU64::new(0);
pub static FLUSH_FAILURES: AtomicU64 = AtomicU64::new(0);

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
struct SubKey {
    subscriber: SubscriberId,
    object: ObjectId,
    index: Option<ProxIndexId>,
}

#[derive(Debug)]
struct Subscription {
    seqno_ptr: SeqNoPtr,
    pending: AttrMask,
    /// Object not yet admitted; held until the record arrives.
    orphan: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct FlushStats {
    pub sent: usize,
    pub failed: usize,
}

#[derive(Default)]
pub struct LocationUpdatePolicy {
    subs: AHashMap<SubKey, Subscription>,
    by_object: AHashMap<ObjectId, AHashSet<SubKey>>,
    by_subscriber: AHashMap<SubscriberId, AHashSet<SubKey>>,
    started: bool,
}

impl LocationUpdatePolicy {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn start(&mut self) {
        self.started = true;
    }

    /// Stop discards every subscription without delivering residual pending
    /// deltas.
    pub fn stop(&mut self) {
        self.started = false;
        self.subs.clear();
        self.by_object.clear();
        self.by_subscriber.clear();
    }

    pub fn is_started(&self) -> bool {
        self.started
    }

    pub fn subscription_count(&self) -> usize {
        self.subs.len()
    }

    pub fn subscribe(
        &mut self,
        subscriber: SubscriberId,
        object: ObjectId,
        index: Option<ProxIndexId>,
        seqno_ptr: SeqNoPtr,
        store: &PresenceStore,
    ) {
        let key = SubKey {
            subscriber,
            object,
            index,
        };
        let orphan = !store.contains(object);
        if orphan {
            debug!(target: "loc.policy", %subscriber, %object, "orphan subscription held");
        }
        self.subs.insert(
            key,
            Subscription {
                seqno_ptr,
                pending: AttrMask::empty(),
                orphan,
            },
        );
        self.by_object.entry(object).or_default().insert(key);
        self.by_subscriber.entry(subscriber).or_default().insert(key);
    }

    pub fn unsubscribe(
        &mut self,
        subscriber: SubscriberId,
        object: ObjectId,
        index: Option<ProxIndexId>,
    ) {
        let key = SubKey {
            subscriber,
            object,
            index,
        };
        self.remove_key(key);
    }

    /// Bulk removal of every subscription held by one subscriber; used on
    /// session close.
    pub fn unsubscribe_all(&mut self, subscriber: SubscriberId) {
        let keys: Vec<SubKey> = self
            .by_subscriber
            .get(&subscriber)
            .map(|set| set.iter().copied().collect())
            .unwrap_or_default();
        for key in keys {
            self.remove_key(key);
        }
    }

    fn remove_key(&mut self, key: SubKey) {
        if self.subs.remove(&key).is_none() {
            return;
        }
        if let Some(set) = self.by_object.get_mut(&key.object) {
            set.remove(&key);
            if set.is_empty() {
                self.by_object.remove(&key.object);
            }
        }
        if let Some(set) = self.by_subscriber.get_mut(&key.subscriber) {
            set.remove(&key);
            if set.is_empty() {
                self.by_subscriber.remove(&key.subscriber);
            }
        }
    }

    /// Mark every attribute pending on one live subscription, so the next
    /// flush delivers a full-attribute add. Used when a query match first
    /// surfaces an object to a subscriber.
    pub fn prime(
        &mut self,
        subscriber: SubscriberId,
        object: ObjectId,
        index: Option<ProxIndexId>,
    ) {
        if let Some(sub) = self.subs.get_mut(&SubKey {
            subscriber,
            object,
            index,
        }) {
            if !sub.orphan {
                sub.pending = AttrMask::all();
            }
        }
    }

    /// The shared seqno pointer of one subscription (producers feeding the
    /// same subscriber reuse it for membership events).
    pub fn seqno_ptr(
        &self,
        subscriber: SubscriberId,
        object: ObjectId,
        index: Option<ProxIndexId>,
    ) -> Option<SeqNoPtr> {
        self.subs
            .get(&SubKey {
                subscriber,
                object,
                index,
            })
            .map(|s| s.seqno_ptr.clone())
    }

    /// Mark pending bits from one store notification.
    pub fn on_store_event(&mut self, event: &StoreEvent) {
        match *event {
            StoreEvent::Added { id, .. } => {
                // Drain orphans with a synthetic full add.
                if let Some(keys) = self.by_object.get(&id) {
                    for key in keys.iter() {
                        let sub = self.subs.get_mut(key).expect("index consistent");
                        if sub.orphan {
                            sub.orphan = false;
                            sub.pending = AttrMask::all();
                            trace!(target: "loc.policy", object = %id, subscriber = %key.subscriber, "orphan drained");
                        }
                    }
                }
            }
            StoreEvent::Removed { id, .. } => {
                // Remove is final for (object, subscriber); a re-add carries
                // a new identity.
                let keys: Vec<SubKey> = self
                    .by_object
                    .get(&id)
                    .map(|set| set.iter().copied().collect())
                    .unwrap_or_default();
                for key in keys {
                    self.remove_key(key);
                }
            }
            StoreEvent::AttributeUpdated { id, part, .. } => {
                if let Some(keys) = self.by_object.get(&id) {
                    for key in keys.iter() {
                        let sub = self.subs.get_mut(key).expect("index consistent");
                        if !sub.orphan {
                            sub.pending |= part.mask();
                        }
                    }
                }
            }
        }
    }

    /// Deliver every pending delta: one message per dirty subscription,
    /// masked attributes only, current seqnos from the store. Failed
    /// enqueues keep their mask for the next flush.
    pub fn flush(&mut self, store: &PresenceStore, sinks: &mut TransportSinks) -> FlushStats {
        use std::sync::atomic::Ordering::Relaxed;
        let mut stats = FlushStats::default();
        if !self.started {
            return stats;
        }
        for (key, sub) in self.subs.iter_mut() {
            if sub.orphan || sub.pending.is_empty() {
                continue;
            }
            let Some(props) = store.props(key.object) else {
                // Object vanished between mark and flush; the Removed event
                // also dropped the subscription, so this key is already on
                // its way out. Clear and move on.
                sub.pending = AttrMask::empty();
                continue;
            };
            let view = PresenceLocUpdateWithEpoch::new(key.object, props, props.epoch());
            let record = LocUpdateRecord::from_view(&view, sub.pending);
            let msg = crate::transport::OutboundLocMessage {
                subscriber: key.subscriber,
                record,
            };
            match sinks.sink_for(key.subscriber).try_enqueue(msg) {
                Ok(()) => {
                    sub.pending = AttrMask::empty();
                    stats.sent += 1;
                    FLUSH_MESSAGES.fetch_add(1, Relaxed);
                }
                Err(err) => {
                    // Mask stays set; next flush retries with the union of
                    // everything dirty by then.
                    stats.failed += 1;
                    FLUSH_FAILURES.fetch_add(1, Relaxed);
                    warn!(
                        target: "loc.policy",
                        subscriber = %key.subscriber,
                        object = %key.object,
                        %err,
                        "outbound enqueue failed, delta retained"
                    );
                }
            }
        }
        stats
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::transport::SubscriberId;
    use core_motion::{MotionVector3, SeqNo, SeqNoSource, ServerId, Time, TimedMotionVector3, Vector3};
    use core_presence::{AttrPart, PresenceUpdate, SequencedPresence};

    fn mv(x: f32) -> TimedMotionVector3 {
        TimedMotionVector3::new(
            Time::from_secs(1),
            MotionVector3::stationary(Vector3::new(x, 0.0, 0.0)),
        )
    }

    fn setup() -> (PresenceStore, LocationUpdatePolicy) {
        let mut store = PresenceStore::new();
        store.add_local(ObjectId::from_index(1), SequencedPresence::default());
        let mut policy = LocationUpdatePolicy::new();
        policy.start();
        (store, policy)
    }

    #[test]
    fn marked_bits_flush_once() {
        let (mut store, mut policy) = setup();
        let (mut sinks, server, _oh, _obj) = TransportSinks::recording();
        let sub = SubscriberId::Server(ServerId(9));
        policy.subscribe(sub, ObjectId::from_index(1), None, SeqNoSource::new(), &store);

        let events = store.apply(
            ObjectId::from_index(1),
            &PresenceUpdate::default().with_location(mv(5.0), SeqNo(5)),
        );
        for ev in &events {
            policy.on_store_event(ev);
        }

        let stats = policy.flush(&store, &mut sinks);
        assert_eq!(stats.sent, 1);
        let sent = server.take();
        assert_eq!(sent.len(), 1);
        let record = &sent[0].record;
        assert_eq!(record.object, ObjectId::from_index(1));
        assert_eq!(record.update.location.unwrap().1, SeqNo(5));
        assert!(record.update.mesh.is_none(), "unmasked attributes excluded");

        // Nothing pending: second flush is silent.
        assert_eq!(policy.flush(&store, &mut sinks).sent, 0);
        assert!(server.is_empty());
    }

    #[test]
    fn attributes_coalesce_into_one_message() {
        let (mut store, mut policy) = setup();
        let (mut sinks, server, _oh, _obj) = TransportSinks::recording();
        let sub = SubscriberId::Server(ServerId(9));
        policy.subscribe(sub, ObjectId::from_index(1), None, SeqNoSource::new(), &store);

        for ev in store.apply(
            ObjectId::from_index(1),
            &PresenceUpdate::default()
                .with_location(mv(1.0), SeqNo(2))
                .with_mesh("meerkat:///a.dae", SeqNo(3)),
        ) {
            policy.on_store_event(&ev);
        }
        for ev in store.apply(
            ObjectId::from_index(1),
            &PresenceUpdate::default().with_location(mv(2.0), SeqNo(4)),
        ) {
            policy.on_store_event(&ev);
        }

        assert_eq!(policy.flush(&store, &mut sinks).sent, 1);
        let sent = server.take();
        assert_eq!(sent.len(), 1, "coalesced into one message");
        let record = &sent[0].record;
        // Latest values with their current seqnos.
        assert_eq!(record.update.location.unwrap().1, SeqNo(4));
        assert_eq!(record.update.mesh.as_ref().unwrap().1, SeqNo(3));
    }

    #[test]
    fn transport_down_restores_the_mask() {
        let (mut store, mut policy) = setup();
        let (mut sinks, server, _oh, _obj) = TransportSinks::recording();
        let sub = SubscriberId::Server(ServerId(9));
        policy.subscribe(sub, ObjectId::from_index(1), None, SeqNoSource::new(), &store);

        for ev in store.apply(
            ObjectId::from_index(1),
            &PresenceUpdate::default().with_location(mv(1.0), SeqNo(2)),
        ) {
            policy.on_store_event(&ev);
        }

        server.set_reject(true);
        let stats = policy.flush(&store, &mut sinks);
        assert_eq!((stats.sent, stats.failed), (0, 1));

        server.set_reject(false);
        let stats = policy.flush(&store, &mut sinks);
        assert_eq!((stats.sent, stats.failed), (1, 0));
        assert_eq!(server.take().len(), 1);
    }

    #[test]
    fn orphan_subscription_drains_on_add() {
        let mut store = PresenceStore::new();
        let mut policy = LocationUpdatePolicy::new();
        policy.start();
        let (mut sinks, _server, _oh, object_bus) = TransportSinks::recording();

        let watcher = SubscriberId::Object(ObjectId::from_index(50));
        let unknown = ObjectId::from_index(1);
        policy.subscribe(watcher, unknown, None, SeqNoSource::new(), &store);

        // Nothing to send while orphaned.
        assert_eq!(policy.flush(&store, &mut sinks).sent, 0);

        let mut props = SequencedPresence::default();
        props.apply(&PresenceUpdate::default().with_location(mv(3.0), SeqNo(1)));
        let added = store.add_local(unknown, props).unwrap();
        policy.on_store_event(&added);

        assert_eq!(policy.flush(&store, &mut sinks).sent, 1);
        let sent = object_bus.take();
        assert_eq!(sent.len(), 1, "exactly one synthetic add");
        let record = &sent[0].record;
        assert_eq!(record.update.location.unwrap().1, SeqNo(1));
        assert!(record.update.mesh.is_some(), "synthetic add carries all attributes");
    }

    #[test]
    fn unsubscribe_stops_delivery_immediately() {
        let (mut store, mut policy) = setup();
        let (mut sinks, server, _oh, _obj) = TransportSinks::recording();
        let sub = SubscriberId::Server(ServerId(9));
        policy.subscribe(sub, ObjectId::from_index(1), None, SeqNoSource::new(), &store);

        for ev in store.apply(
            ObjectId::from_index(1),
            &PresenceUpdate::default().with_location(mv(1.0), SeqNo(2)),
        ) {
            policy.on_store_event(&ev);
        }
        policy.unsubscribe(sub, ObjectId::from_index(1), None);
        assert_eq!(policy.flush(&store, &mut sinks).sent, 0);
        assert!(server.is_empty());
    }

    #[test]
    fn bulk_unsubscribe_covers_all_objects() {
        let (mut store, mut policy) = setup();
        store.add_local(ObjectId::from_index(2), SequencedPresence::default());
        let sub = SubscriberId::OhNode(core_motion::OhNodeId(4));
        policy.subscribe(sub, ObjectId::from_index(1), None, SeqNoSource::new(), &store);
        policy.subscribe(
            sub,
            ObjectId::from_index(2),
            Some(ProxIndexId(1)),
            SeqNoSource::new(),
            &store,
        );
        assert_eq!(policy.subscription_count(), 2);
        policy.unsubscribe_all(sub);
        assert_eq!(policy.subscription_count(), 0);
    }

    #[test]
    fn object_removal_finalizes_subscriptions() {
        let (mut store, mut policy) = setup();
        let sub = SubscriberId::Server(ServerId(2));
        policy.subscribe(sub, ObjectId::from_index(1), None, SeqNoSource::new(), &store);
        let removed = store.remove_local(ObjectId::from_index(1)).unwrap();
        policy.on_store_event(&removed);
        assert_eq!(policy.subscription_count(), 0);
    }

    #[test]
    fn stop_discards_residual_deltas() {
        let (mut store, mut policy) = setup();
        let (mut sinks, server, _oh, _obj) = TransportSinks::recording();
        let sub = SubscriberId::Server(ServerId(9));
        policy.subscribe(sub, ObjectId::from_index(1), None, SeqNoSource::new(), &store);
        for ev in store.apply(
            ObjectId::from_index(1),
            &PresenceUpdate::default().with_location(mv(1.0), SeqNo(2)),
        ) {
            policy.on_store_event(&ev);
        }
        policy.stop();
        assert_eq!(policy.flush(&store, &mut sinks).sent, 0);
        assert!(server.is_empty());
        assert_eq!(policy.subscription_count(), 0);
    }

    #[test]
    fn attribute_seqnos_in_messages_never_regress() {
        let (mut store, mut policy) = setup();
        let (mut sinks, server, _oh, _obj) = TransportSinks::recording();
        let sub = SubscriberId::Server(ServerId(9));
        policy.subscribe(sub, ObjectId::from_index(1), None, SeqNoSource::new(), &store);

        let mut last = SeqNo::zero();
        for s in [2u64, 5, 3, 9, 9, 11] {
            for ev in store.apply(
                ObjectId::from_index(1),
                &PresenceUpdate::default().with_location(mv(s as f32), SeqNo(s)),
            ) {
                policy.on_store_event(&ev);
            }
            policy.flush(&store, &mut sinks);
            for msg in server.take() {
                let (_, seqno) = msg.record.update.location.unwrap();
                assert!(seqno >= last, "delivered seqno regressed");
                last = seqno;
            }
        }
        assert_eq!(last, SeqNo(11));
    }
}
