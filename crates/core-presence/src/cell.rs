//! Copy-on-read presence property cells.
//!
//! Simulated objects (object-host side) read presence properties from
//! arbitrary threads while the strand writes them. Instead of a shared
//! rwlock, each cell holds an `ArcSwap` of an immutable snapshot: readers
//! grab the current `Arc` without blocking, writers publish a replacement
//! with a single atomic pointer swap. Readers never block writers and
//! writers never block readers; a reader simply keeps the snapshot it
//! loaded.

use crate::store::SequencedPresence;
use arc_swap::ArcSwap;
use std::sync::Arc;

#[derive(Debug, Default)]
pub struct PropertyCell {
    snapshot: ArcSwap<SequencedPresence>,
}

impl PropertyCell {
    pub fn new(initial: SequencedPresence) -> Self {
        Self {
            snapshot: ArcSwap::from_pointee(initial),
        }
    }

    /// Current snapshot. The returned `Arc` stays valid regardless of later
    /// writes; callers wanting freshness re-read.
    pub fn read(&self) -> Arc<SequencedPresence> {
        self.snapshot.load_full()
    }

    /// Publish a new snapshot. Strand-only by convention; concurrent writers
    /// would race on last-write-wins, which the single-writer model rules
    /// out.
    pub fn publish(&self, next: SequencedPresence) {
        self.snapshot.store(Arc::new(next));
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::attrs::AttrPart;
    use crate::update::PresenceUpdate;
    use core_motion::SeqNo;

    #[test]
    fn readers_keep_their_snapshot() {
        let cell = PropertyCell::new(SequencedPresence::default());
        let before = cell.read();

        let mut next = (*before).clone();
        next.apply(&PresenceUpdate::default().with_physics("static", SeqNo(1)));
        cell.publish(next);

        // The old guard still reads the pre-write state.
        assert_eq!(before.seqno(AttrPart::Physics), SeqNo::zero());
        assert_eq!(cell.read().seqno(AttrPart::Physics), SeqNo(1));
    }

    #[test]
    fn publish_is_visible_across_threads() {
        let cell = Arc::new(PropertyCell::new(SequencedPresence::default()));
        let mut next = (*cell.read()).clone();
        next.apply(&PresenceUpdate::default().with_mesh("meerkat:///m.dae", SeqNo(3)));
        cell.publish(next);

        let reader = {
            let cell = cell.clone();
            std::thread::spawn(move || cell.read().mesh().to_owned())
        };
        assert_eq!(reader.join().unwrap(), "meerkat:///m.dae");
    }
}
