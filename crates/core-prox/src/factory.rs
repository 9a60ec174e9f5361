//! Query-handler construction from a configured type string.
//!
//! Mirrors the options surface the server exposes: a handler type
//! (`brute`, `rtree`, `rtreedist`/`dist`, `rtreecut`, `rtreecutagg`,
//! `level`), an options block with `branching` and `rebuild-batch-size`
//! (both default 10), and a `rebuilding` toggle (default on) that wraps the
//! chosen handler in the migrating rebuilder. Unknown type strings produce
//! no handler.

use crate::brute::BruteForceHandler;
use crate::level::LevelHandler;
use crate::query::QueryHandler;
use crate::rebuild::{DEFAULT_REBUILD_BATCH, DEFAULT_REBUILD_PERIOD, RebuildingHandler};
use crate::rtree::{DEFAULT_BRANCHING, PruneKind, RTreeHandler};
use crate::rtree_cut::RTreeCutHandler;
use core_cache::LocationCache;
use std::time::Duration;
use tracing::warn;

/// Constructor for a fresh handler instance seeded from the cache's current
/// world. The rebuilding wrapper re-invokes it at the start of every cycle.
pub type HandlerCtor = Box<dyn Fn(&LocationCache) -> Box<dyn QueryHandler> + Send>;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct QueryHandlerOptions {
    pub branching: usize,
    pub rebuild_batch_size: usize,
    pub rebuild_period: Duration,
}

impl Default for QueryHandlerOptions {
    fn default() -> Self {
        Self {
            branching: DEFAULT_BRANCHING,
            rebuild_batch_size: DEFAULT_REBUILD_BATCH,
            rebuild_period: DEFAULT_REBUILD_PERIOD,
        }
    }
}

impl QueryHandlerOptions {
    /// Parse a whitespace-separated `key=value` argument string
    /// (`"branching=16 rebuild-batch-size=5"`). Unknown keys warn and are
    /// skipped; unparsable values keep the default.
    pub fn parse_args(args: &str) -> Self {
        let mut opts = Self::default();
        for pair in args.split_whitespace() {
            let Some((key, value)) = pair.split_once('=') else {
                warn!(target: "prox.factory", pair, "malformed handler option, expected key=value");
                continue;
            };
            match key {
                "branching" => match value.parse::<usize>() {
                    Ok(v) if v >= 2 => opts.branching = v,
                    _ => warn!(target: "prox.factory", value, "invalid branching, keeping default"),
                },
                "rebuild-batch-size" => match value.parse::<usize>() {
                    Ok(v) if v >= 1 => opts.rebuild_batch_size = v,
                    _ => warn!(
                        target: "prox.factory",
                        value, "invalid rebuild-batch-size, keeping default"
                    ),
                },
                "rebuild-period-secs" => match value.parse::<u64>() {
                    Ok(v) => opts.rebuild_period = Duration::from_secs(v),
                    _ => warn!(
                        target: "prox.factory",
                        value, "invalid rebuild-period-secs, keeping default"
                    ),
                },
                _ => warn!(target: "prox.factory", key, "unknown handler option"),
            }
        }
        opts
    }
}

fn ctor_for(handler_type: &str, opts: &QueryHandlerOptions) -> Option<HandlerCtor> {
    let branching = opts.branching;
    let ctor: HandlerCtor = match handler_type {
        "brute" => Box::new(|cache| Box::new(BruteForceHandler::seeded(cache))),
        "rtree" => Box::new(move |cache| {
            Box::new(RTreeHandler::seeded(cache, branching, PruneKind::Angle))
        }),
        "rtreedist" | "dist" => Box::new(move |cache| {
            Box::new(RTreeHandler::seeded(cache, branching, PruneKind::Distance))
        }),
        "rtreecut" => {
            Box::new(move |cache| Box::new(RTreeCutHandler::seeded(cache, branching, false)))
        }
        "rtreecutagg" => {
            Box::new(move |cache| Box::new(RTreeCutHandler::seeded(cache, branching, true)))
        }
        "level" => Box::new(|cache| Box::new(LevelHandler::seeded(cache))),
        other => {
            warn!(target: "prox.factory", handler_type = other, "unknown query handler type");
            return None;
        }
    };
    Some(ctor)
}

/// Build a handler from its configured type string. `None` for unknown
/// types.
pub fn query_handler_factory(
    handler_type: &str,
    rebuilding: bool,
    opts: &QueryHandlerOptions,
) -> Option<Box<dyn QueryHandler>> {
    let ctor = ctor_for(handler_type, opts)?;
    if rebuilding {
        Some(Box::new(RebuildingHandler::new(
            ctor,
            opts.rebuild_batch_size,
            opts.rebuild_period,
        )))
    } else {
        Some(ctor(&LocationCache::new()))
    }
}
