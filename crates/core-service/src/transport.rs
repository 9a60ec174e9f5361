//! Outbound transport seams.
//!
//! The policy posts one message per (subscriber, object) per flush to the
//! transport owning the subscriber's namespace: the server-to-server router,
//! the object-host dispatcher, or the local object bus. Enqueue is always
//! immediate: queued or failed, never blocking the strand. A failed enqueue
//! leaves redelivery to the caller (the policy restores its pending mask).

use core_motion::{ObjectId, OhNodeId, ServerId};
use core_wire::LocUpdateRecord;
use std::fmt;
use std::sync::{Arc, Mutex};
use thiserror::Error;

/// A subscriber address in one of the three disjoint namespaces.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum SubscriberId {
    /// Peer space server.
    Server(ServerId),
    /// Object-host node.
    OhNode(OhNodeId),
    /// Locally connected object.
    Object(ObjectId),
}

impl fmt::Display for SubscriberId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SubscriberId::Server(id) => write!(f, "{id}"),
            SubscriberId::OhNode(id) => write!(f, "{id}"),
            SubscriberId::Object(id) => write!(f, "object-{id}"),
        }
    }
}

/// One coalesced location update addressed to one subscriber.
#[derive(Debug, Clone, PartialEq)]
pub struct OutboundLocMessage {
    pub subscriber: SubscriberId,
    pub record: LocUpdateRecord,
}

#[derive(Debug, Error, PartialEq, Eq)]
pub enum EnqueueError {
    #[error("transport queue full")]
    Full,
    #[error("transport closed")]
    Closed,
}

/// Queue-or-fail outbound sink. Implementations must not block.
pub trait LocMessageSink: Send {
    fn try_enqueue(&mut self, msg: OutboundLocMessage) -> Result<(), EnqueueError>;
}

/// Sink backed by a bounded tokio channel; the transport task drains the
/// receiver.
pub struct ChannelSink {
    tx: tokio::sync::mpsc::Sender<OutboundLocMessage>,
}

impl ChannelSink {
    pub fn new(tx: tokio::sync::mpsc::Sender<OutboundLocMessage>) -> Self {
        Self { tx }
    }
}

impl LocMessageSink for ChannelSink {
    fn try_enqueue(&mut self, msg: OutboundLocMessage) -> Result<(), EnqueueError> {
        use tokio::sync::mpsc::error::TrySendError;
        self.tx.try_send(msg).map_err(|e| match e {
            TrySendError::Full(_) => EnqueueError::Full,
            TrySendError::Closed(_) => EnqueueError::Closed,
        })
    }
}

/// In-memory sink recording everything it accepts. Used by tests and by the
/// standalone binary when a transport is not wired up.
#[derive(Clone, Default)]
pub struct RecordingSink {
    messages: Arc<Mutex<Vec<OutboundLocMessage>>>,
    /// When set, every enqueue fails with `Full`, for exercising the
    /// restore-and-retry path.
    pub reject: Arc<Mutex<bool>>,
}

impl RecordingSink {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn take(&self) -> Vec<OutboundLocMessage> {
        std::mem::take(&mut self.messages.lock().expect("sink poisoned"))
    }

    pub fn len(&self) -> usize {
        self.messages.lock().expect("sink poisoned").len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn set_reject(&self, reject: bool) {
        *self.reject.lock().expect("sink poisoned") = reject;
    }
}

impl LocMessageSink for RecordingSink {
    fn try_enqueue(&mut self, msg: OutboundLocMessage) -> Result<(), EnqueueError> {
        if *self.reject.lock().expect("sink poisoned") {
            return Err(EnqueueError::Full);
        }
        self.messages.lock().expect("sink poisoned").push(msg);
        Ok(())
    }
}

/// The three per-namespace sinks the policy routes across.
pub struct TransportSinks {
    pub server_router: Box<dyn LocMessageSink>,
    pub oh_dispatcher: Box<dyn LocMessageSink>,
    pub object_bus: Box<dyn LocMessageSink>,
}

impl TransportSinks {
    pub fn recording() -> (Self, RecordingSink, RecordingSink, RecordingSink) {
        let server = RecordingSink::new();
        let oh = RecordingSink::new();
        let object = RecordingSink::new();
        (
            Self {
                server_router: Box::new(server.clone()),
                oh_dispatcher: Box::new(oh.clone()),
                object_bus: Box::new(object.clone()),
            },
            server,
            oh,
            object,
        )
    }

    pub fn sink_for(&mut self, subscriber: SubscriberId) -> &mut dyn LocMessageSink {
        match subscriber {
            SubscriberId::Server(_) => self.server_router.as_mut(),
            SubscriberId::OhNode(_) => self.oh_dispatcher.as_mut(),
            SubscriberId::Object(_) => self.object_bus.as_mut(),
        }
    }
}
