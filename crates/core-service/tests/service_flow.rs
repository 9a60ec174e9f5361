//! End-to-end service flows on the strand: session ingest, query-driven
//! subscription fan-out, listener filtering, and the admin surface.

use core_events::SubstreamId;
use core_motion::{
    AggregateBoundingInfo, MotionVector3, ObjectId, OhNodeId, SeqNo, SolidAngle, Time,
    TimedMotionVector3, Vector3,
};
use core_presence::{Locality, PresenceUpdate, SequencedPresence};
use core_prox::{QueryHandlerOptions, query_handler_factory};
use core_service::{
    IngestOutcome, LocationListener, LocationService, RecordingSink, SubscriberId, TransportSinks,
};
use core_wire::{LocUpdateRecord, encode_record};
use bytes::BytesMut;
use std::sync::{Arc, Mutex};

fn mv(x: f32) -> TimedMotionVector3 {
    TimedMotionVector3::new(
        Time::from_secs(1),
        MotionVector3::stationary(Vector3::new(x, 0.0, 0.0)),
    )
}

fn props_at(x: f32, radius: f32, seqno: u64) -> SequencedPresence {
    SequencedPresence::initial(
        mv(x),
        Default::default(),
        AggregateBoundingInfo::single(radius),
        String::from("meerkat:///seed.dae"),
        String::new(),
        None,
        SeqNo(seqno),
    )
}

fn service_with_brute() -> (LocationService, RecordingSink, RecordingSink, RecordingSink) {
    let (sinks, server, oh, object) = TransportSinks::recording();
    let handler = query_handler_factory("brute", false, &QueryHandlerOptions::default());
    let mut service = LocationService::new(handler, sinks);
    service.start();
    (service, server, oh, object)
}

fn encode(record: &LocUpdateRecord) -> Vec<u8> {
    let mut buf = BytesMut::new();
    encode_record(record, &mut buf);
    buf.to_vec()
}

#[test]
fn session_ingest_applies_and_completes_flight() {
    let (mut service, _server, _oh, _object) = service_with_brute();
    let a = ObjectId::from_index(1);
    service.add_local_object(a, props_at(0.0, 1.0, 1));
    service.session_opened(a);

    let record = LocUpdateRecord::new(
        a,
        PresenceUpdate::default()
            .with_location(mv(5.0), SeqNo(5))
            .with_epoch(3),
    );
    let bytes = encode(&record);
    let stream = SubstreamId(1);

    // Split delivery: first half buffers, second half completes the flight.
    let mid = bytes.len() / 2;
    assert_eq!(
        service.ingest_substream(a, stream, &bytes[..mid], false),
        IngestOutcome::Buffering
    );
    assert_eq!(
        service.ingest_substream(a, stream, &bytes[mid..], false),
        IngestOutcome::Applied {
            records: 1,
            complete: true
        }
    );

    let props = service.store().props(a).unwrap();
    assert_eq!(props.seqno(core_presence::AttrPart::Location), SeqNo(5));
    assert_eq!(props.epoch(), Some(3));
    // The cache view tracked the move.
    assert_eq!(
        service
            .cache()
            .get(a)
            .unwrap()
            .location
            .position_at(Time::from_secs(1))
            .x,
        5.0
    );
}

#[test]
fn stale_wire_update_is_dropped_at_the_store() {
    let (mut service, _server, _oh, _object) = service_with_brute();
    let a = ObjectId::from_index(1);
    service.add_local_object(a, props_at(0.0, 1.0, 1));
    service.session_opened(a);

    let stream = SubstreamId(1);
    let up5 = encode(&LocUpdateRecord::new(
        a,
        PresenceUpdate::default().with_location(mv(5.0), SeqNo(5)),
    ));
    let up3 = encode(&LocUpdateRecord::new(
        a,
        PresenceUpdate::default().with_location(mv(3.0), SeqNo(3)),
    ));
    service.ingest_substream(a, stream, &up5, false);
    service.ingest_substream(a, SubstreamId(2), &up3, false);

    let props = service.store().props(a).unwrap();
    assert_eq!(props.seqno(core_presence::AttrPart::Location), SeqNo(5));
    assert_eq!(props.location().position_at(Time::from_secs(1)).x, 5.0);
}

#[test]
fn foreign_object_records_are_rejected() {
    let (mut service, _server, _oh, _object) = service_with_brute();
    let a = ObjectId::from_index(1);
    let b = ObjectId::from_index(2);
    service.add_local_object(a, props_at(0.0, 1.0, 1));
    service.add_local_object(b, props_at(10.0, 1.0, 1));
    service.session_opened(a);

    // A's session tries to move B.
    let bytes = encode(&LocUpdateRecord::new(
        b,
        PresenceUpdate::default().with_location(mv(99.0), SeqNo(9)),
    ));
    assert_eq!(
        service.ingest_substream(a, SubstreamId(1), &bytes, false),
        IngestOutcome::Applied {
            records: 0,
            complete: true
        }
    );
    assert_eq!(
        service.store().props(b).unwrap().location().position_at(Time::from_secs(1)).x,
        10.0
    );
}

#[test]
fn malformed_payload_closes_substream_but_not_session() {
    let (mut service, _server, _oh, _object) = service_with_brute();
    let a = ObjectId::from_index(1);
    service.add_local_object(a, props_at(0.0, 1.0, 1));
    service.session_opened(a);

    // A frame claiming a payload far beyond the cap.
    let garbage = [0xFF, 0xFF, 0xFF, 0xFF, 1, 2, 3];
    assert_eq!(
        service.ingest_substream(a, SubstreamId(1), &garbage, false),
        IngestOutcome::Failed
    );

    // The session still accepts a fresh substream.
    let bytes = encode(&LocUpdateRecord::new(
        a,
        PresenceUpdate::default().with_location(mv(2.0), SeqNo(2)),
    ));
    assert_eq!(
        service.ingest_substream(a, SubstreamId(2), &bytes, false),
        IngestOutcome::Applied {
            records: 1,
            complete: true
        }
    );
}

#[test]
fn query_match_subscribes_and_delivers_full_add() {
    let (mut service, _server, oh, _object) = service_with_brute();
    let a = ObjectId::from_index(1);
    service.add_local_object(a, props_at(0.0, 1.0, 7));

    let watcher = SubscriberId::OhNode(OhNodeId(5));
    let qid = service
        .register_query(watcher, Vector3::new(10.0, 0.0, 0.0), SolidAngle::new(0.2))
        .expect("handler configured");

    service.poll(Time::from_secs(2));
    let msgs = oh.take();
    assert_eq!(msgs.len(), 1, "one synthetic add for the match");
    assert_eq!(msgs[0].subscriber, watcher);
    let record = &msgs[0].record;
    assert_eq!(record.object, a);
    assert_eq!(record.update.location.unwrap().1, SeqNo(7));
    assert!(record.update.mesh.is_some(), "full add carries every attribute");

    // Steady state: no repeat messages.
    service.poll(Time::from_secs(3));
    assert!(oh.is_empty());

    // Object moves out of range: subscription ends, no further messages.
    service.session_opened(a);
    let bytes = encode(&LocUpdateRecord::new(
        a,
        PresenceUpdate::default().with_location(mv(500.0), SeqNo(8)),
    ));
    service.ingest_substream(a, SubstreamId(1), &bytes, false);
    service.poll(Time::from_secs(4));
    // The position change was pending before the removal landed in the same
    // poll; at most one final update may flush, then silence.
    oh.take();
    service.ingest_substream(
        a,
        SubstreamId(2),
        &encode(&LocUpdateRecord::new(
            a,
            PresenceUpdate::default().with_location(mv(501.0), SeqNo(9)),
        )),
        false,
    );
    service.poll(Time::from_secs(5));
    assert!(oh.is_empty(), "no messages after unsubscribe");
    let _ = qid;
}

#[test]
fn aggregate_visibility_follows_listener_opt_in() {
    #[derive(Default)]
    struct Recorder {
        added: Arc<Mutex<Vec<(ObjectId, bool)>>>,
    }
    impl LocationListener for Recorder {
        fn object_added(
            &mut self,
            id: ObjectId,
            _locality: Locality,
            aggregate: bool,
            _props: &SequencedPresence,
        ) {
            self.added.lock().unwrap().push((id, aggregate));
        }
    }

    let (mut service, _server, _oh, _object) = service_with_brute();
    let plain = Arc::new(Mutex::new(Vec::new()));
    let with_aggs = Arc::new(Mutex::new(Vec::new()));
    service.add_listener(
        Box::new(Recorder {
            added: plain.clone(),
        }),
        false,
    );
    service.add_listener(
        Box::new(Recorder {
            added: with_aggs.clone(),
        }),
        true,
    );

    let obj = ObjectId::from_index(1);
    let agg = ObjectId::from_index(2);
    service.add_local_object(obj, props_at(0.0, 1.0, 1));
    service.add_aggregate(agg, props_at(50.0, 10.0, 1));

    assert_eq!(*plain.lock().unwrap(), vec![(obj, false)]);
    assert_eq!(
        *with_aggs.lock().unwrap(),
        vec![(obj, false), (agg, true)]
    );
}

#[test]
fn replica_updates_come_only_from_peers() {
    let (mut service, _server, _oh, _object) = service_with_brute();
    let r = ObjectId::from_index(1);
    service.add_replica_object(r, props_at(0.0, 1.0, 1));

    service.receive_server_update(
        core_motion::ServerId(2),
        &LocUpdateRecord::new(
            r,
            PresenceUpdate::default().with_location(mv(8.0), SeqNo(4)),
        ),
    );
    assert_eq!(
        service.store().props(r).unwrap().location().position_at(Time::from_secs(1)).x,
        8.0
    );

    // Unknown object: dropped.
    service.receive_server_update(
        core_motion::ServerId(2),
        &LocUpdateRecord::new(
            ObjectId::from_index(9),
            PresenceUpdate::default().with_location(mv(1.0), SeqNo(1)),
        ),
    );
    assert!(service.store().props(ObjectId::from_index(9)).is_none());
}

#[test]
fn orphan_subscription_drains_through_the_service() {
    let (mut service, server, _oh, _object) = service_with_brute();
    let watcher = SubscriberId::Server(core_motion::ServerId(3));
    let unknown = ObjectId::from_index(1);
    service.subscribe(watcher, unknown, None, core_motion::SeqNoSource::new());

    service.poll(Time::from_secs(1));
    assert!(server.is_empty(), "nothing while orphaned");

    service.add_local_object(unknown, props_at(1.0, 1.0, 1));
    service.poll(Time::from_secs(2));
    let msgs = server.take();
    assert_eq!(msgs.len(), 1, "exactly one synthetic add");
    assert_eq!(msgs[0].record.update.location.unwrap().1, SeqNo(1));
}

#[test]
fn property_cells_publish_snapshots() {
    let (mut service, _server, _oh, _object) = service_with_brute();
    let a = ObjectId::from_index(1);
    service.add_local_object(a, props_at(0.0, 1.0, 1));

    let cell = service.property_cell(a).expect("cell for live object");
    let before = cell.read();

    service.session_opened(a);
    let bytes = encode(&LocUpdateRecord::new(
        a,
        PresenceUpdate::default().with_physics("rigid", SeqNo(2)),
    ));
    service.ingest_substream(a, SubstreamId(1), &bytes, false);

    assert_eq!(before.physics(), "");
    assert_eq!(cell.read().physics(), "rigid");

    service.remove_local_object(a);
    assert!(service.property_cell(a).is_none());
    // Held snapshots stay readable after removal.
    assert_eq!(cell.read().physics(), "rigid");
}

#[test]
fn admin_commands_report_counts_and_object_state() {
    let (mut service, _server, _oh, _object) = service_with_brute();
    let a = ObjectId::from_index(1);
    service.add_local_object(a, props_at(2.0, 1.0, 6));
    service.add_replica_object(ObjectId::from_index(2), props_at(5.0, 1.0, 1));
    service.add_aggregate(ObjectId::from_index(3), props_at(9.0, 4.0, 1));

    let props = service.handle_command("space.loc.properties", &serde_json::json!({}));
    assert_eq!(props["type"], "brute");
    assert_eq!(props["count"], 3);
    assert_eq!(props["local_count"], 2);
    assert_eq!(props["replica_count"], 1);
    assert_eq!(props["aggregate_count"], 1);

    let obj = service.handle_command(
        "space.loc.object",
        &serde_json::json!({ "object": a.to_string() }),
    );
    assert_eq!(obj["id"], a.to_string());
    assert_eq!(obj["has_location"], true);
    assert_eq!(obj["location_seqno"], 6);
    assert_eq!(obj["mesh"], "meerkat:///seed.dae");
    assert!(obj.get("epoch").is_none());

    let missing = service.handle_command(
        "space.loc.object",
        &serde_json::json!({ "object": ObjectId::from_index(99).to_string() }),
    );
    assert!(missing["error"].as_str().unwrap().contains("unknown object"));

    let bogus = service.handle_command("space.loc.wat", &serde_json::json!({}));
    assert!(bogus["error"].as_str().unwrap().contains("unknown command"));
}

#[test]
fn start_stop_are_idempotent_and_stop_discards_state() {
    let (mut service, server, _oh, _object) = service_with_brute();
    service.start();
    service.start();
    assert!(service.is_started());

    let a = ObjectId::from_index(1);
    service.add_local_object(a, props_at(0.0, 1.0, 1));
    service.subscribe(
        SubscriberId::Server(core_motion::ServerId(1)),
        a,
        None,
        core_motion::SeqNoSource::new(),
    );

    service.stop();
    service.stop();
    assert!(!service.is_started());
    assert_eq!(service.handler_type(), "none", "handler released on stop");

    // Poll after stop is a no-op: no flush, no messages.
    service.poll(Time::from_secs(10));
    assert!(server.is_empty());
}
