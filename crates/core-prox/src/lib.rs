//! Solid-angle proximity query handlers.
//!
//! Every handler indexes the live entries of a [`core_cache::LocationCache`]
//! and evaluates registered queries whose predicate is a minimum angular
//! size: an object is in a query's result set when its bounding radius
//! subtends at least the query's threshold from the query position.
//!
//! Five backing strategies share one interface:
//! * `brute`: linear scan, no auxiliary structure. The reference
//!   implementation the others must agree with.
//! * `rtree`: hierarchical index pruned by each node's maximum possible
//!   subtended angle.
//! * `rtreedist`: same tree, pure distance pruning.
//! * `rtreecut` / `rtreecutagg`: per-query cuts through the tree that slide
//!   incrementally as the world and the query move; the `agg` flavour also
//!   surfaces interior nodes as imposter results.
//! * `level`: partitions objects into size-derived levels with per-level
//!   bounds for whole-level pruning.
//!
//! Handlers buffer per-query events (`Added`/`Removed`/… ) between ticks;
//! `drain_events` is one-shot consumption. Event streams per (query, object)
//! always read `Added (… ) Removed`; a diff against the previous result set
//! produces them, so no object is added twice or removed before being added.
//!
//! The [`rebuild::RebuildingHandler`] wraps any of the above and migrates
//! queries to a freshly built instance in bounded batches, keeping tail
//! latency flat even when incremental maintenance has degraded the
//! structure.

pub mod brute;
pub mod common;
pub mod factory;
pub mod level;
pub mod query;
pub mod rebuild;
pub mod rtree;
pub mod rtree_cut;

pub use factory::{HandlerCtor, QueryHandlerOptions, query_handler_factory};
pub use query::{Query, QueryEvent, QueryHandler, QueryId, QueryState};
pub use rebuild::RebuildingHandler;
