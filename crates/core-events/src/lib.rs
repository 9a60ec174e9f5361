//! Main-strand event types and channel helpers.
//!
//! The server serializes every mutation of the location store, caches, query
//! handlers, and update policy onto one *strand*: a single consumer draining
//! a bounded mpsc channel. Transport tasks, session readers, and timers are
//! producers; they post events and never touch shared state directly.

use core_motion::ObjectId;
use std::fmt;
use std::sync::atomic::AtomicU64;
use tokio::sync::mpsc::Sender;
use tokio::sync::oneshot;
use tokio::task::JoinHandle;

// -------------------------------------------------------------------------------------------------
// Channel Policy
// -------------------------------------------------------------------------------------------------
// The strand uses a bounded mpsc channel sized by `EVENT_CHANNEL_CAP` to provide memory safety and
// natural producer backpressure. Session readers use `send(..).await`, which parks the producing
// task until space is available rather than dropping updates: with per-object producers and a
// single consumer, latency stays low and update fidelity is preferred over lossy drop strategies.
// The one exception is outbound transport enqueue, which is try-send with explicit failure so the
// flush path can restore its pending state (see core-service). Telemetry counters record send
// failures (closed channel) for inspection in tests and periodic logs.
// -------------------------------------------------------------------------------------------------
pub const EVENT_CHANNEL_CAP: usize = 8192;

// -------------------------------------------------------------------------------------------------
// Telemetry
// -------------------------------------------------------------------------------------------------
// Simple atomic counters (no locking, fetch_add relaxed). Intentionally minimal; a metrics crate
// integration can export them later via structured events. For now they can be inspected in unit
// tests or periodically logged.
// -------------------------------------------------------------------------------------------------
pub static CHANNEL_SEND_FAILURES: AtomicU64 = AtomicU64::new(0);
pub static SUBSTREAM_BYTES: AtomicU64 = AtomicU64::new(0); // total ingress bytes across all location substreams
pub static SUBSTREAM_SEGMENTS: AtomicU64 = AtomicU64::new(0); // number of SubstreamData events emitted
pub static SESSIONS_OPENED: AtomicU64 = AtomicU64::new(0);
pub static SESSIONS_CLOSED: AtomicU64 = AtomicU64::new(0);
pub static TICKS_EMITTED: AtomicU64 = AtomicU64::new(0);

/// Identifier of one location substream within an object session. Allocated
/// by the session layer; unique per (object, flight of updates).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct SubstreamId(pub u64);

impl fmt::Display for SubstreamId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "substream-{}", self.0)
    }
}

/// Reply channel for administrative commands. Commands are posted to the
/// strand and answered with a JSON payload; a dropped receiver just discards
/// the answer.
pub type CommandReply = oneshot::Sender<serde_json::Value>;

/// Top-level event enum consumed by the strand's event loop.
#[derive(Debug)]
pub enum Event {
    /// New object session admitted; the service starts listening for a
    /// location substream from this object.
    SessionOpened { object: ObjectId },
    /// Object session closed; subscriptions held by the object are dropped.
    SessionClosed { object: ObjectId },
    /// Bytes arrived on a location substream. Concatenated by the service
    /// until the parser consumes a full flight of update records.
    SubstreamData {
        source: ObjectId,
        stream: SubstreamId,
        bytes: Vec<u8>,
    },
    /// Re-posted apply of an already-buffered substream payload, used when a
    /// configured apply delay is active.
    ApplyBuffered {
        source: ObjectId,
        stream: SubstreamId,
    },
    /// Periodic monotonic tick driving the service poll (policy flush, query
    /// handler ticks, rebuild migration) without busy polling.
    Tick,
    /// Administrative command dispatched on the strand.
    Command {
        name: String,
        arg: serde_json::Value,
        reply: CommandReply,
    },
    Shutdown,
}

// -------------------------------------------------------------------------------------------------
// Event Transform Hooks (no-op scaffolding)
// -------------------------------------------------------------------------------------------------
/// Optional hooks that can observe or transform events at the loop boundary.
///
/// The default implementation is a no-op; consumers can provide their own
/// impls in higher layers. Kept minimal to avoid cross-crate coupling. These
/// hooks must not block.
pub trait EventHooks: Send + Sync + 'static {
    fn pre_handle(&self, _event: &Event) {}
    fn post_handle(&self, _event: &Event) {}
}

/// Default no-op hooks implementation.
pub struct NoopEventHooks;

impl EventHooks for NoopEventHooks {}

// -------------------------------------------------------------------------------------------------
// Async Event Sources
// -------------------------------------------------------------------------------------------------
// Each async producer (timers, transport acceptors, session readers) registers uniformly through
// one trait and is responsible for its own task lifecycle; on channel send failure (consumer
// dropped) it must terminate promptly. Backpressure: the bounded channel already provides flow
// control; prioritization (e.g. shedding motion bursts under load) can layer on later without
// changing this API.

/// Trait implemented by any async event producer. Implementors usually hold configuration and
/// spawn one background task that pushes `Event`s into the shared channel.
pub trait AsyncEventSource: Send + 'static {
    /// Human-readable stable identifier (used for logging / diagnostics).
    fn name(&self) -> &'static str;
    /// Consume self and spawn the background task, returning a JoinHandle. Implementors should
    /// stop when `tx.send(..).await` returns Err (channel closed) or on their own internal stop
    /// condition. They should avoid busy loops by awaiting timers or external IO futures.
    fn spawn(self: Box<Self>, tx: Sender<Event>) -> JoinHandle<()>;
}

/// Registry of event sources: stores boxed trait objects and spawns them all at startup.
pub struct EventSourceRegistry {
    sources: Vec<Box<dyn AsyncEventSource>>,
}

impl Default for EventSourceRegistry {
    fn default() -> Self {
        Self::new()
    }
}

impl EventSourceRegistry {
    pub fn new() -> Self {
        Self {
            sources: Vec::new(),
        }
    }

    pub fn register<S: AsyncEventSource>(&mut self, src: S) {
        self.sources.push(Box::new(src));
    }

    /// Spawn all registered sources, returning their JoinHandles. The supplied `Sender`
    /// reference stays owned by the caller; each source receives its own clone so no
    /// additional strong references linger inside the registry once this call returns.
    ///
    /// Ordering guarantee: call this after constructing the primary runtime channel and
    /// before the event loop begins consuming events. During shutdown the caller should
    /// drop its final `Sender` clone before awaiting the returned handles so the sources
    /// observe the closed channel and exit cooperatively.
    pub fn spawn_all(&mut self, tx: &Sender<Event>) -> Vec<JoinHandle<()>> {
        // Take ownership so duplicate spawns are prevented if called twice.
        let mut out = Vec::with_capacity(self.sources.len());
        for src in self.sources.drain(..) {
            let name = src.name();
            tracing::info!(target: "runtime.events", source = name, "spawning event source");
            out.push(src.spawn(tx.clone()));
        }
        out
    }
}

/// Built-in monotonic tick source. Emits `Event::Tick` every configured
/// interval; the service's 10 ms poll hangs off this.
pub struct TickEventSource {
    interval: std::time::Duration,
}

impl TickEventSource {
    pub fn new(interval: std::time::Duration) -> Self {
        Self { interval }
    }
}

impl AsyncEventSource for TickEventSource {
    fn name(&self) -> &'static str {
        "tick"
    }

    fn spawn(self: Box<Self>, tx: Sender<Event>) -> JoinHandle<()> {
        tokio::spawn(async move {
            let mut interval = tokio::time::interval(self.interval);
            interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
            loop {
                interval.tick().await;
                TICKS_EMITTED.fetch_add(1, std::sync::atomic::Ordering::Relaxed);
                if tx.send(Event::Tick).await.is_err() {
                    CHANNEL_SEND_FAILURES.fetch_add(1, std::sync::atomic::Ordering::Relaxed);
                    break;
                }
            }
        })
    }
}
