//! Per-attribute sequence numbers and the shared per-subscriber counter.
//!
//! `SeqNo` orders writes to one (object, attribute) slot: a proposed write
//! wins only when strictly greater than the stored value. `SeqNoSource` is
//! the shared monotonic counter a subscriber hands to every producer feeding
//! it, so membership events from distinct indices interleave in one
//! monotonic stream.

use serde::{Deserialize, Serialize};
use std::fmt;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Default, Serialize, Deserialize)]
pub struct SeqNo(pub u64);

impl SeqNo {
    pub const fn zero() -> Self {
        Self(0)
    }

    /// Does a write stamped `self` supersede a slot holding `stored`?
    /// Equal seqnos lose: first write wins, the duplicate is dropped.
    pub fn supersedes(&self, stored: SeqNo) -> bool {
        self.0 > stored.0
    }
}

impl fmt::Display for SeqNo {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "#{}", self.0)
    }
}

/// Shared monotonic counter. Cloning the `SeqNoPtr` alias shares the counter;
/// `next` is safe from any thread (relaxed ordering suffices; consumers
/// only compare values produced through the same pointer).
#[derive(Debug, Default)]
pub struct SeqNoSource {
    next: AtomicU64,
}

pub type SeqNoPtr = Arc<SeqNoSource>;

impl SeqNoSource {
    pub fn new() -> SeqNoPtr {
        Arc::new(Self {
            next: AtomicU64::new(1),
        })
    }

    pub fn next(&self) -> SeqNo {
        SeqNo(self.next.fetch_add(1, Ordering::Relaxed))
    }

    pub fn current(&self) -> SeqNo {
        SeqNo(self.next.load(Ordering::Relaxed))
    }
}
