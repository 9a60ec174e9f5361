//! Strand runtime: the single consumer of the event channel.
//!
//! Everything that mutates the service happens inside `handle_event`, in
//! arrival order. Producers (session readers, the tick source, admin
//! frontends) hold `Sender<Event>` clones and never touch the service
//! directly. The optional apply delay re-posts buffered substream applies
//! through the channel, so even delayed applies retain strand ordering.

use crate::service::{IngestOutcome, LocationService};
use core_events::{Event, EventHooks, SUBSTREAM_BYTES, SUBSTREAM_SEGMENTS, SESSIONS_CLOSED, SESSIONS_OPENED};
use core_motion::Time;
use std::sync::atomic::Ordering::Relaxed;
use std::time::{Duration, Instant};
use tokio::sync::mpsc::{Receiver, Sender, WeakSender};
use tracing::{debug, info, trace};

pub struct ServiceRuntime {
    service: LocationService,
    hooks: Box<dyn EventHooks>,
    apply_delay: Option<Duration>,
    started_at: Instant,
}

impl ServiceRuntime {
    pub fn new(
        service: LocationService,
        hooks: Box<dyn EventHooks>,
        apply_delay: Option<Duration>,
    ) -> Self {
        Self {
            service,
            hooks,
            apply_delay: apply_delay.filter(|d| !d.is_zero()),
            started_at: Instant::now(),
        }
    }

    pub fn service(&self) -> &LocationService {
        &self.service
    }

    pub fn service_mut(&mut self) -> &mut LocationService {
        &mut self.service
    }

    /// Monotonic service time, anchored at runtime construction.
    pub fn now(&self) -> Time {
        Time::from_micros(self.started_at.elapsed().as_micros() as u64)
    }

    /// Process one event. Returns `false` when the loop should stop. The
    /// sender is held weakly so the loop can still observe channel closure.
    pub fn handle_event(&mut self, event: Event, tx: &WeakSender<Event>) -> bool {
        self.hooks.pre_handle(&event);
        let keep_running = match event {
            Event::SessionOpened { object } => {
                SESSIONS_OPENED.fetch_add(1, Relaxed);
                self.service.session_opened(object);
                true
            }
            Event::SessionClosed { object } => {
                SESSIONS_CLOSED.fetch_add(1, Relaxed);
                self.service.session_closed(object);
                true
            }
            Event::SubstreamData {
                source,
                stream,
                bytes,
            } => {
                SUBSTREAM_SEGMENTS.fetch_add(1, Relaxed);
                SUBSTREAM_BYTES.fetch_add(bytes.len() as u64, Relaxed);
                let defer = self.apply_delay.is_some();
                match self.service.ingest_substream(source, stream, &bytes, defer) {
                    IngestOutcome::Deferred => {
                        let delay = self.apply_delay.expect("defer implies delay");
                        match tx.upgrade() {
                            Some(tx) => {
                                tokio::spawn(async move {
                                    tokio::time::sleep(delay).await;
                                    let _ =
                                        tx.send(Event::ApplyBuffered { source, stream }).await;
                                });
                            }
                            None => {
                                debug!(target: "loc.service", %source, %stream, "channel closing, deferred apply dropped");
                            }
                        }
                    }
                    outcome => {
                        trace!(target: "loc.service", %source, %stream, ?outcome, "substream ingest");
                    }
                }
                true
            }
            Event::ApplyBuffered { source, stream } => {
                let outcome = self.service.apply_buffered(source, stream);
                trace!(target: "loc.service", %source, %stream, ?outcome, "delayed apply");
                true
            }
            Event::Tick => {
                let now = self.now();
                self.service.poll(now);
                true
            }
            Event::Command { name, arg, reply } => {
                debug!(target: "loc.service", command = %name, "admin command");
                let result = self.service.handle_command(&name, &arg);
                // A dropped receiver just discards the answer.
                let _ = reply.send(result);
                true
            }
            Event::Shutdown => {
                info!(target: "loc.service", "shutdown event received");
                self.service.stop();
                false
            }
        };
        keep_running
    }

    /// Drain the channel until shutdown (or every sender is gone), then
    /// return the stopped service for inspection. The sender handed in is
    /// downgraded immediately: the loop must not keep its own channel
    /// alive, or external shutdown-by-drop would never be observed.
    pub async fn run(mut self, mut rx: Receiver<Event>, tx: Sender<Event>) -> LocationService {
        let weak = tx.downgrade();
        drop(tx);
        self.service.start();
        while let Some(event) = rx.recv().await {
            if !self.handle_event(event, &weak) {
                break;
            }
        }
        self.service.stop();
        self.service
    }
}
