//! The location service facade.
//!
//! Owns the store, the location cache, the query handler, the update policy,
//! and the outbound sinks; every public method runs on the strand. Mutations
//! flow one way:
//!
//! ```text
//! ingress (session bytes / peer updates / admin ops)
//!   -> store (seqno-gated apply, StoreEvents out)
//!     -> listener fan-out (aggregate-filtered)
//!     -> location cache (CacheEvents out) -> query handler
//!     -> update policy (pending masks)
//!     -> property cells (snapshot publish)
//! ```
//!
//! The periodic poll ticks the handler, converts query events into
//! subscriptions, and flushes the policy. Session ingest follows the
//! buffer-and-parse contract: keep concatenating substream bytes until the
//! parser consumes full records, then the flight is complete and the
//! substream closes from our side.

use crate::policy::LocationUpdatePolicy;
use crate::transport::{SubscriberId, TransportSinks};
use ahash::AHashMap;
use core_events::SubstreamId;
use core_motion::{
    ObjectId, ProxIndexId, SeqNoPtr, SeqNoSource, ServerId, SolidAngle, Time, Vector3,
};
use core_presence::{
    AttrPart, Locality, PresenceStore, PropertyCell, SequencedPresence, StoreEvent,
};
use core_cache::{CacheEntry, CacheEvent, LocationCache, dispatch_cache_events};
use core_prox::{Query, QueryEvent, QueryHandler, QueryId};
use core_prox::rtree::is_node_object_id;
use core_wire::{LocUpdateRecord, UpdateStreamBuffer};
use serde_json::json;
use std::sync::Arc;
use tracing::{debug, info, warn};

/// Listener surface over the store's lifecycle and per-attribute mutations,
/// tagged with locality and the aggregate flag. Registration chooses whether
/// aggregate records are visible.
#[allow(unused_variables)]
pub trait LocationListener: Send {
    fn object_added(
        &mut self,
        id: ObjectId,
        locality: Locality,
        aggregate: bool,
        props: &SequencedPresence,
    ) {
    }
    fn object_removed(&mut self, id: ObjectId, locality: Locality, aggregate: bool) {}
    fn location_updated(&mut self, id: ObjectId, locality: Locality, aggregate: bool, props: &SequencedPresence) {}
    fn orientation_updated(&mut self, id: ObjectId, locality: Locality, aggregate: bool, props: &SequencedPresence) {}
    fn bounds_updated(&mut self, id: ObjectId, locality: Locality, aggregate: bool, props: &SequencedPresence) {}
    fn mesh_updated(&mut self, id: ObjectId, locality: Locality, aggregate: bool, props: &SequencedPresence) {}
    fn physics_updated(&mut self, id: ObjectId, locality: Locality, aggregate: bool, props: &SequencedPresence) {}
    fn parent_updated(&mut self, id: ObjectId, locality: Locality, aggregate: bool, props: &SequencedPresence) {}
    fn zernike_updated(&mut self, id: ObjectId, locality: Locality, aggregate: bool, props: &SequencedPresence) {}
    /// Raw peer update pass-through, before seqno gating.
    fn location_update_from_server(&mut self, from: ServerId, record: &LocUpdateRecord) {}
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ListenerId(u64);

struct ListenerEntry {
    id: ListenerId,
    want_aggregates: bool,
    listener: Box<dyn LocationListener>,
}

#[derive(Default)]
struct Session {
    streams: AHashMap<SubstreamId, UpdateStreamBuffer>,
}

struct QueryBinding {
    subscriber: SubscriberId,
    seqno_ptr: SeqNoPtr,
}

/// Outcome of feeding substream bytes (or re-applying a buffered payload).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IngestOutcome {
    /// Records applied. `complete` means the buffer fully drained: the
    /// flight is over and the substream closes from the server side.
    Applied { records: usize, complete: bool },
    /// No full record yet; keep the substream open and keep buffering.
    Buffering,
    /// An apply delay is configured; the runner re-posts `ApplyBuffered`
    /// after the delay.
    Deferred,
    /// Syntactically invalid payload. The substream is closed; the object
    /// session stays up.
    Failed,
}

pub struct LocationService {
    store: PresenceStore,
    cache: LocationCache,
    policy: LocationUpdatePolicy,
    sinks: TransportSinks,
    handler: Option<Box<dyn QueryHandler>>,
    listeners: Vec<ListenerEntry>,
    next_listener: u64,
    sessions: AHashMap<ObjectId, Session>,
    queries: AHashMap<QueryId, QueryBinding>,
    next_query: u64,
    cells: AHashMap<ObjectId, Arc<PropertyCell>>,
    started: bool,
}

impl LocationService {
    pub fn new(handler: Option<Box<dyn QueryHandler>>, sinks: TransportSinks) -> Self {
        Self {
            store: PresenceStore::new(),
            cache: LocationCache::new(),
            policy: LocationUpdatePolicy::new(),
            sinks,
            handler,
            listeners: Vec::new(),
            next_listener: 0,
            sessions: AHashMap::new(),
            queries: AHashMap::new(),
            next_query: 0,
            cells: AHashMap::new(),
            started: false,
        }
    }

    /// Idempotent start; cascades to the policy.
    pub fn start(&mut self) {
        if self.started {
            return;
        }
        self.started = true;
        self.policy.start();
        info!(target: "loc.service", "location service started");
    }

    /// Idempotent stop. Policy first (subscriptions dropped, residual deltas
    /// discarded), then the handler is released. Messages already handed to
    /// a transport may still be sent.
    pub fn stop(&mut self) {
        if !self.started {
            return;
        }
        self.policy.stop();
        self.handler = None;
        self.queries.clear();
        self.sessions.clear();
        self.started = false;
        info!(target: "loc.service", "location service stopped");
    }

    pub fn is_started(&self) -> bool {
        self.started
    }

    pub fn handler_type(&self) -> &'static str {
        self.handler
            .as_ref()
            .map(|h| h.handler_type())
            .unwrap_or("none")
    }

    // ---------------------------------------------------------------------
    // Listener registration
    // ---------------------------------------------------------------------

    pub fn add_listener(
        &mut self,
        listener: Box<dyn LocationListener>,
        want_aggregates: bool,
    ) -> ListenerId {
        self.next_listener += 1;
        let id = ListenerId(self.next_listener);
        self.listeners.push(ListenerEntry {
            id,
            want_aggregates,
            listener,
        });
        id
    }

    pub fn remove_listener(&mut self, id: ListenerId) {
        self.listeners.retain(|e| e.id != id);
    }

    // ---------------------------------------------------------------------
    // Admission and removal
    // ---------------------------------------------------------------------

    pub fn add_local_object(&mut self, id: ObjectId, props: SequencedPresence) {
        if let Some(ev) = self.store.add_local(id, props) {
            self.route_event(ev);
        }
    }

    pub fn add_replica_object(&mut self, id: ObjectId, props: SequencedPresence) {
        if let Some(ev) = self.store.add_replica(id, props) {
            self.route_event(ev);
        }
    }

    pub fn add_aggregate(&mut self, id: ObjectId, props: SequencedPresence) {
        if let Some(ev) = self.store.add_aggregate(id, props) {
            self.route_event(ev);
        }
    }

    pub fn remove_local_object(&mut self, id: ObjectId) {
        if let Some(ev) = self.store.remove_local(id) {
            self.route_event(ev);
        }
    }

    pub fn remove_replica_object(&mut self, id: ObjectId) {
        if let Some(ev) = self.store.remove_replica(id) {
            self.route_event(ev);
        }
    }

    pub fn remove_aggregate(&mut self, id: ObjectId) {
        if !self.store.is_aggregate(id) {
            warn!(target: "loc.service", %id, "remove_aggregate on non-aggregate ignored");
            return;
        }
        if let Some(ev) = self.store.remove_local(id) {
            self.route_event(ev);
        }
    }

    /// Aggregate refresh from the aggregate manager; plain sequenced apply.
    pub fn update_aggregate(&mut self, id: ObjectId, update: &core_presence::PresenceUpdate) {
        if !self.store.is_aggregate(id) {
            debug!(target: "loc.service", %id, "aggregate update for non-aggregate dropped");
            return;
        }
        for ev in self.store.apply(id, update) {
            self.route_event(ev);
        }
    }

    // ---------------------------------------------------------------------
    // Update ingress
    // ---------------------------------------------------------------------

    /// Peer server update for a replica record. Unknown objects are dropped
    /// (debug log); replication admits records through
    /// `add_replica_object`, not through the update path.
    pub fn receive_server_update(&mut self, from: ServerId, record: &LocUpdateRecord) {
        let Self { listeners, .. } = self;
        for entry in listeners.iter_mut() {
            entry.listener.location_update_from_server(from, record);
        }
        match self.store.locality(record.object) {
            Some(Locality::Replica) => {
                for ev in self.store.apply(record.object, &record.update) {
                    self.route_event(ev);
                }
            }
            Some(Locality::Local) => {
                warn!(
                    target: "loc.service",
                    object = %record.object,
                    %from,
                    "peer update for locally owned object dropped"
                );
            }
            None => {
                debug!(
                    target: "loc.service",
                    object = %record.object,
                    %from,
                    "peer update for unknown object dropped"
                );
            }
        }
    }

    // ---------------------------------------------------------------------
    // Object sessions and the location substream
    // ---------------------------------------------------------------------

    pub fn session_opened(&mut self, object: ObjectId) {
        debug!(target: "loc.service", %object, "object session opened, listening for location substream");
        self.sessions.entry(object).or_default();
    }

    /// Session closed: buffered substreams are dropped and every
    /// subscription held by the object goes with them.
    pub fn session_closed(&mut self, object: ObjectId) {
        self.sessions.remove(&object);
        self.policy.unsubscribe_all(SubscriberId::Object(object));
        let owned: Vec<QueryId> = self
            .queries
            .iter()
            .filter(|(_, b)| b.subscriber == SubscriberId::Object(object))
            .map(|(id, _)| *id)
            .collect();
        for qid in owned {
            self.unregister_query(qid);
        }
        debug!(target: "loc.service", %object, "object session closed");
    }

    /// Feed substream bytes. With an apply delay configured the caller
    /// re-posts `ApplyBuffered` after the delay; otherwise the buffer is
    /// parsed immediately.
    pub fn ingest_substream(
        &mut self,
        source: ObjectId,
        stream: SubstreamId,
        bytes: &[u8],
        defer: bool,
    ) -> IngestOutcome {
        let session = self.sessions.entry(source).or_insert_with(|| {
            debug!(target: "loc.service", %source, "substream data before session open, admitting session");
            Session::default()
        });
        session
            .streams
            .entry(stream)
            .or_insert_with(UpdateStreamBuffer::new)
            .push(bytes);
        if defer {
            return IngestOutcome::Deferred;
        }
        self.apply_buffered(source, stream)
    }

    /// Parse-and-apply whatever the substream buffer holds. Greedy: all
    /// complete records apply; an empty result keeps buffering; a parse
    /// error closes the substream and leaves the session alone.
    pub fn apply_buffered(&mut self, source: ObjectId, stream: SubstreamId) -> IngestOutcome {
        let Some(session) = self.sessions.get_mut(&source) else {
            debug!(target: "loc.service", %source, "apply for closed session dropped");
            return IngestOutcome::Failed;
        };
        let Some(buffer) = session.streams.get_mut(&stream) else {
            debug!(target: "loc.service", %source, %stream, "apply for closed substream dropped");
            return IngestOutcome::Failed;
        };

        let records = match buffer.drain_records() {
            Ok(records) => records,
            Err(err) => {
                warn!(
                    target: "loc.service",
                    %source, %stream, %err,
                    "malformed location update, closing substream"
                );
                session.streams.remove(&stream);
                return IngestOutcome::Failed;
            }
        };
        if records.is_empty() {
            return IngestOutcome::Buffering;
        }
        let complete = buffer.is_empty();
        if complete {
            session.streams.remove(&stream);
        }

        let mut applied = 0;
        for record in records {
            if record.object != source {
                warn!(
                    target: "loc.service",
                    %source,
                    object = %record.object,
                    "session update for foreign object dropped"
                );
                continue;
            }
            if !self.store.is_local(record.object) {
                debug!(
                    target: "loc.service",
                    object = %record.object,
                    "session update for unknown object dropped"
                );
                continue;
            }
            applied += 1;
            for ev in self.store.apply(record.object, &record.update) {
                self.route_event(ev);
            }
        }
        IngestOutcome::Applied {
            records: applied,
            complete,
        }
    }

    // ---------------------------------------------------------------------
    // Subscriptions (three namespaces, mirrored onto the policy)
    // ---------------------------------------------------------------------

    pub fn subscribe(
        &mut self,
        subscriber: SubscriberId,
        object: ObjectId,
        index: Option<ProxIndexId>,
        seqno_ptr: SeqNoPtr,
    ) {
        self.policy
            .subscribe(subscriber, object, index, seqno_ptr, &self.store);
    }

    pub fn unsubscribe(
        &mut self,
        subscriber: SubscriberId,
        object: ObjectId,
        index: Option<ProxIndexId>,
    ) {
        self.policy.unsubscribe(subscriber, object, index);
    }

    pub fn unsubscribe_all(&mut self, subscriber: SubscriberId) {
        self.policy.unsubscribe_all(subscriber);
    }

    // ---------------------------------------------------------------------
    // Observer queries
    // ---------------------------------------------------------------------

    /// Register a standing solid-angle query on behalf of a subscriber.
    /// Matching objects are auto-subscribed; the first flush after a match
    /// delivers a full-attribute add.
    pub fn register_query(
        &mut self,
        subscriber: SubscriberId,
        position: Vector3,
        angle: SolidAngle,
    ) -> Option<QueryId> {
        let handler = self.handler.as_mut()?;
        self.next_query += 1;
        let id = QueryId(self.next_query);
        handler.register_query(&self.cache, Query::new(id, position, angle));
        self.queries.insert(
            id,
            QueryBinding {
                subscriber,
                seqno_ptr: SeqNoSource::new(),
            },
        );
        Some(id)
    }

    pub fn move_query(&mut self, id: QueryId, position: Vector3, angle: SolidAngle) {
        if let Some(handler) = self.handler.as_mut() {
            handler.move_query(id, position, angle);
        }
    }

    pub fn unregister_query(&mut self, id: QueryId) {
        let Some(binding) = self.queries.remove(&id) else {
            return;
        };
        if let Some(handler) = self.handler.as_mut() {
            if let Some(state) = handler.unregister_query(id) {
                for object in state.results {
                    if !is_node_object_id(object) {
                        self.policy.unsubscribe(binding.subscriber, object, None);
                    }
                }
            }
        }
    }

    /// Periodic service work: tick the handler, translate query events into
    /// subscription changes, flush the policy.
    pub fn poll(&mut self, now: Time) {
        if !self.started {
            return;
        }
        if let Some(handler) = self.handler.as_mut() {
            handler.tick(&self.cache, now);
            let ids: Vec<QueryId> = self.queries.keys().copied().collect();
            for qid in ids {
                let events = self
                    .handler
                    .as_mut()
                    .expect("handler present")
                    .drain_events(qid);
                if events.is_empty() {
                    continue;
                }
                let binding = self.queries.get(&qid).expect("binding for live query");
                let subscriber = binding.subscriber;
                let seqno_ptr = binding.seqno_ptr.clone();
                for ev in events {
                    match ev {
                        QueryEvent::Added { object } => {
                            if is_node_object_id(object) {
                                continue;
                            }
                            self.policy.subscribe(
                                subscriber,
                                object,
                                None,
                                seqno_ptr.clone(),
                                &self.store,
                            );
                            self.policy.prime(subscriber, object, None);
                        }
                        QueryEvent::Removed { object }
                        | QueryEvent::PermanentlyRemoved { object } => {
                            if is_node_object_id(object) {
                                continue;
                            }
                            self.policy.unsubscribe(subscriber, object, None);
                        }
                        QueryEvent::NodeEntered { .. } | QueryEvent::NodeExited { .. } => {}
                    }
                }
            }
        }
        self.policy.flush(&self.store, &mut self.sinks);
    }

    // ---------------------------------------------------------------------
    // Reads
    // ---------------------------------------------------------------------

    pub fn store(&self) -> &PresenceStore {
        &self.store
    }

    pub fn cache(&self) -> &LocationCache {
        &self.cache
    }

    /// Copy-on-read property cell for a live object. The returned handle is
    /// safe to read from any thread.
    pub fn property_cell(&self, id: ObjectId) -> Option<Arc<PropertyCell>> {
        self.cells.get(&id).cloned()
    }

    // ---------------------------------------------------------------------
    // Administrative commands (dispatched on the strand)
    // ---------------------------------------------------------------------

    pub fn handle_command(&mut self, name: &str, arg: &serde_json::Value) -> serde_json::Value {
        match name {
            "space.loc.properties" => self.command_properties(),
            "space.loc.object" => self.command_object_properties(arg),
            other => json!({ "error": format!("unknown command '{other}'") }),
        }
    }

    fn command_properties(&self) -> serde_json::Value {
        json!({
            "type": self.handler_type(),
            "count": self.store.len(),
            "local_count": self.store.local_count(),
            "replica_count": self.store.replica_count(),
            "aggregate_count": self.store.aggregate_count(),
        })
    }

    fn command_object_properties(&self, arg: &serde_json::Value) -> serde_json::Value {
        let Some(raw) = arg.get("object").and_then(|v| v.as_str()) else {
            return json!({ "error": "missing 'object' argument" });
        };
        let Some(id) = ObjectId::from_hex(raw) else {
            return json!({ "error": format!("invalid object id '{raw}'") });
        };
        let Some(props) = self.store.props(id) else {
            return json!({ "error": format!("unknown object '{raw}'") });
        };
        let loc = props.location();
        let pos = loc.value.position;
        let vel = loc.value.velocity;
        let orient = props.orientation();
        let bounds = props.bounds();
        let mut out = json!({
            "id": id.to_string(),
            "has_location": true,
            "location": {
                "time_us": loc.time.as_micros(),
                "position": [pos.x, pos.y, pos.z],
                "velocity": [vel.x, vel.y, vel.z],
            },
            "location_seqno": props.seqno(AttrPart::Location).0,
            "has_orientation": true,
            "orientation": {
                "time_us": orient.time.as_micros(),
                "value": [orient.position.x, orient.position.y, orient.position.z, orient.position.w],
            },
            "orientation_seqno": props.seqno(AttrPart::Orientation).0,
            "has_bounds": true,
            "bounds": {
                "center_offset": [bounds.center_offset.x, bounds.center_offset.y, bounds.center_offset.z],
                "center_bounds_radius": bounds.center_bounds_radius,
                "max_object_radius": bounds.max_object_radius,
            },
            "bounds_seqno": props.seqno(AttrPart::Bounds).0,
            "has_mesh": true,
            "mesh": props.mesh(),
            "mesh_seqno": props.seqno(AttrPart::Mesh).0,
            "has_physics": true,
            "physics": props.physics(),
            "physics_seqno": props.seqno(AttrPart::Physics).0,
            "parent": props.parent().map(|p| p.to_string()),
            "parent_seqno": props.seqno(AttrPart::Parent).0,
            "zernike": props.zernike(),
            "zernike_seqno": props.seqno(AttrPart::Zernike).0,
        });
        if let Some(epoch) = props.epoch() {
            out["epoch"] = json!(epoch);
        }
        out
    }

    // ---------------------------------------------------------------------
    // Event routing
    // ---------------------------------------------------------------------

    fn route_event(&mut self, ev: StoreEvent) {
        self.notify_listeners(&ev);
        let cache_events = self.update_cache(&ev);
        if let Some(handler) = self.handler.as_mut() {
            dispatch_cache_events(&self.cache, &cache_events, handler.as_mut());
        }
        self.policy.on_store_event(&ev);
        self.update_cells(&ev);
    }

    fn notify_listeners(&mut self, ev: &StoreEvent) {
        let Self {
            listeners, store, ..
        } = self;
        for entry in listeners.iter_mut() {
            if ev.is_aggregate() && !entry.want_aggregates {
                continue;
            }
            match *ev {
                StoreEvent::Added {
                    id,
                    locality,
                    aggregate,
                } => {
                    if let Some(props) = store.props(id) {
                        entry.listener.object_added(id, locality, aggregate, props);
                    }
                }
                StoreEvent::Removed {
                    id,
                    locality,
                    aggregate,
                } => entry.listener.object_removed(id, locality, aggregate),
                StoreEvent::AttributeUpdated {
                    id,
                    locality,
                    aggregate,
                    part,
                } => {
                    let Some(props) = store.props(id) else {
                        continue;
                    };
                    let l = &mut entry.listener;
                    match part {
                        AttrPart::Location => l.location_updated(id, locality, aggregate, props),
                        AttrPart::Orientation => {
                            l.orientation_updated(id, locality, aggregate, props)
                        }
                        AttrPart::Bounds => l.bounds_updated(id, locality, aggregate, props),
                        AttrPart::Mesh => l.mesh_updated(id, locality, aggregate, props),
                        AttrPart::Physics => l.physics_updated(id, locality, aggregate, props),
                        AttrPart::Parent => l.parent_updated(id, locality, aggregate, props),
                        AttrPart::Zernike => l.zernike_updated(id, locality, aggregate, props),
                    }
                }
            }
        }
    }

    fn update_cache(&mut self, ev: &StoreEvent) -> Vec<CacheEvent> {
        match *ev {
            StoreEvent::Added {
                id,
                locality,
                aggregate,
            } => {
                let props = self.store.props(id).expect("added record exists");
                let bounds = props.bounds();
                vec![self.cache.connect(CacheEntry {
                    id,
                    location: props.location(),
                    center_offset: bounds.center_offset,
                    center_bounds_radius: bounds.center_bounds_radius,
                    max_size: bounds.max_object_radius,
                    mesh: props.mesh().to_owned(),
                    zernike: props.zernike().map(str::to_owned),
                    aggregate,
                    local: locality == Locality::Local,
                })]
            }
            StoreEvent::Removed { id, .. } => self.cache.disconnect(id).into_iter().collect(),
            StoreEvent::AttributeUpdated { id, part, .. } => {
                let Some(props) = self.store.props(id) else {
                    return Vec::new();
                };
                match part {
                    AttrPart::Location => self
                        .cache
                        .update_location(id, props.location())
                        .into_iter()
                        .collect(),
                    AttrPart::Bounds => {
                        let b = props.bounds();
                        self.cache.update_bounds(
                            id,
                            b.center_offset,
                            b.center_bounds_radius,
                            b.max_object_radius,
                        )
                    }
                    AttrPart::Mesh => {
                        let mesh = props.mesh().to_owned();
                        self.cache.update_mesh(id, mesh);
                        Vec::new()
                    }
                    AttrPart::Zernike => {
                        let z = props.zernike().map(str::to_owned);
                        self.cache.update_zernike(id, z);
                        Vec::new()
                    }
                    // Orientation, physics, and parent are not part of the
                    // spatial snapshot.
                    AttrPart::Orientation | AttrPart::Physics | AttrPart::Parent => Vec::new(),
                }
            }
        }
    }

    fn update_cells(&mut self, ev: &StoreEvent) {
        match *ev {
            StoreEvent::Added { id, .. } => {
                let props = self.store.props(id).expect("added record exists");
                self.cells
                    .insert(id, Arc::new(PropertyCell::new(props.clone())));
            }
            StoreEvent::Removed { id, .. } => {
                self.cells.remove(&id);
            }
            StoreEvent::AttributeUpdated { id, .. } => {
                if let (Some(cell), Some(props)) = (self.cells.get(&id), self.store.props(id)) {
                    cell.publish(props.clone());
                }
            }
        }
    }
}
