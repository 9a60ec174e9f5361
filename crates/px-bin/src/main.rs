//! Parallax entrypoint.
//!
//! Builds the location service from configuration, wires the strand channel
//! and outbound transports, spawns the periodic tick source, and drains the
//! event loop until ctrl-c.

use anyhow::{Result, anyhow};
use clap::Parser;
use core_config::Config;
use core_events::{
    EVENT_CHANNEL_CAP, Event, EventSourceRegistry, NoopEventHooks, TickEventSource,
};
use core_prox::{QueryHandlerOptions, query_handler_factory};
use core_service::{ChannelSink, LocationService, OutboundLocMessage, ServiceRuntime, TransportSinks};
use std::path::PathBuf;
use std::time::Duration;
use tokio::sync::mpsc;
use tracing::{info, trace, warn};
use tracing_appender::non_blocking::WorkerGuard;
use tracing_subscriber::EnvFilter;

/// CLI arguments.
#[derive(Parser, Debug)]
#[command(name = "parallax", version, about = "Parallax space-server location core")] // minimal metadata
struct Args {
    /// Optional configuration file path (overrides discovery of
    /// `parallax.toml`).
    #[arg(long = "config")]
    pub config: Option<PathBuf>,
    /// Directory for rotating log files. Logs go to stderr when omitted.
    #[arg(long = "log-dir")]
    pub log_dir: Option<PathBuf>,
}

fn init_tracing(log_dir: Option<&PathBuf>) -> Option<WorkerGuard> {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    match log_dir {
        Some(dir) => {
            let appender = tracing_appender::rolling::daily(dir, "parallax.log");
            let (writer, guard) = tracing_appender::non_blocking(appender);
            tracing_subscriber::fmt()
                .with_env_filter(filter)
                .with_writer(writer)
                .with_ansi(false)
                .init();
            Some(guard)
        }
        None => {
            tracing_subscriber::fmt()
                .with_env_filter(filter)
                .with_writer(std::io::stderr)
                .init();
            None
        }
    }
}

/// One bounded queue plus a draining task per outbound namespace. Real
/// deployments replace the drain task with the wire transport; the sink
/// contract (queue-or-fail) is identical either way.
fn spawn_transport(label: &'static str) -> ChannelSink {
    let (tx, mut rx) = mpsc::channel::<OutboundLocMessage>(1024);
    tokio::spawn(async move {
        while let Some(msg) = rx.recv().await {
            trace!(
                target: "loc.transport",
                transport = label,
                subscriber = %msg.subscriber,
                object = %msg.record.object,
                "outbound location update"
            );
        }
    });
    ChannelSink::new(tx)
}

fn build_service(config: &Config) -> Result<LocationService> {
    let opts = QueryHandlerOptions {
        branching: config.prox.branching as usize,
        rebuild_batch_size: config.prox.rebuild_batch_size as usize,
        rebuild_period: Duration::from_secs(config.prox.rebuild_period_secs),
    };
    let handler = query_handler_factory(&config.prox.handler, config.prox.rebuilding, &opts)
        .ok_or_else(|| anyhow!("unknown query handler type '{}'", config.prox.handler))?;
    let sinks = TransportSinks {
        server_router: Box::new(spawn_transport("server-router")),
        oh_dispatcher: Box::new(spawn_transport("oh-dispatcher")),
        object_bus: Box::new(spawn_transport("object-bus")),
    };
    Ok(LocationService::new(Some(handler), sinks))
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();
    let _log_guard = init_tracing(args.log_dir.as_ref());

    let config = core_config::load_or_default(args.config.as_deref())?;
    info!(
        target: "startup",
        handler = %config.prox.handler,
        rebuilding = config.prox.rebuilding,
        poll_interval_ms = config.service.poll_interval_ms,
        "parallax starting"
    );

    let service = build_service(&config)?;
    let apply_delay = match config.service.delay_apply_loc_update_secs {
        0 => None,
        secs => {
            warn!(target: "startup", secs, "artificial apply delay active");
            Some(Duration::from_secs(secs))
        }
    };

    let (tx, rx) = mpsc::channel::<Event>(EVENT_CHANNEL_CAP);
    let mut registry = EventSourceRegistry::new();
    registry.register(TickEventSource::new(Duration::from_millis(
        config.service.poll_interval_ms,
    )));
    let source_handles = registry.spawn_all(&tx);

    // ctrl-c posts a shutdown event onto the strand.
    {
        let tx = tx.clone();
        tokio::spawn(async move {
            if tokio::signal::ctrl_c().await.is_ok() {
                info!(target: "runtime", "ctrl-c, requesting shutdown");
                let _ = tx.send(Event::Shutdown).await;
            }
        });
    }

    let runtime = ServiceRuntime::new(service, Box::new(NoopEventHooks), apply_delay);
    let service = runtime.run(rx, tx).await;

    info!(
        target: "shutdown",
        objects = service.store().len(),
        "parallax stopped"
    );
    for handle in source_handles {
        handle.abort();
    }
    Ok(())
}
