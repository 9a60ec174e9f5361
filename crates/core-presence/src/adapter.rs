//! Read-only projections of a store record into the canonical update shape
//! consumed by subscribers.
//!
//! The policy and the peer-forwarding paths both speak `LocUpdateView`; the
//! two concrete adapters differ only in epoch handling. Both borrow the
//! record; lifetimes guarantee an adapter cannot outlive the properties it
//! projects.

use crate::attrs::AttrPart;
use crate::store::SequencedPresence;
use core_motion::{
    AggregateBoundingInfo, ObjectId, SeqNo, TimedMotionQuaternion, TimedMotionVector3,
};

/// Per-attribute `has_X() / X() / X_seqno()` view over one object's state.
pub trait LocUpdateView {
    fn object(&self) -> ObjectId;

    fn has_epoch(&self) -> bool {
        false
    }
    fn epoch(&self) -> u64 {
        0
    }

    fn has_location(&self) -> bool;
    fn location(&self) -> TimedMotionVector3;
    fn location_seqno(&self) -> SeqNo;

    fn has_orientation(&self) -> bool;
    fn orientation(&self) -> TimedMotionQuaternion;
    fn orientation_seqno(&self) -> SeqNo;

    fn has_bounds(&self) -> bool;
    fn bounds(&self) -> AggregateBoundingInfo;
    fn bounds_seqno(&self) -> SeqNo;

    fn has_mesh(&self) -> bool;
    fn mesh(&self) -> &str;
    fn mesh_seqno(&self) -> SeqNo;

    fn has_physics(&self) -> bool;
    fn physics(&self) -> &str;
    fn physics_seqno(&self) -> SeqNo;

    fn has_parent(&self) -> bool;
    fn parent(&self) -> Option<ObjectId>;
    fn parent_seqno(&self) -> SeqNo;

    fn has_zernike(&self) -> bool;
    fn zernike(&self) -> Option<&str>;
    fn zernike_seqno(&self) -> SeqNo;
}

/// Plain adapter: projects stored properties, reports no epoch. Used on
/// paths where updates are synthesized from the store (orphan drains, cache
/// replication) and no client command is being correlated.
pub struct PresenceLocUpdate<'a> {
    object: ObjectId,
    props: &'a SequencedPresence,
}

impl<'a> PresenceLocUpdate<'a> {
    pub fn new(object: ObjectId, props: &'a SequencedPresence) -> Self {
        Self { object, props }
    }
}

impl LocUpdateView for PresenceLocUpdate<'_> {
    fn object(&self) -> ObjectId {
        self.object
    }

    fn has_location(&self) -> bool {
        true
    }
    fn location(&self) -> TimedMotionVector3 {
        self.props.location()
    }
    fn location_seqno(&self) -> SeqNo {
        self.props.seqno(AttrPart::Location)
    }

    fn has_orientation(&self) -> bool {
        true
    }
    fn orientation(&self) -> TimedMotionQuaternion {
        self.props.orientation()
    }
    fn orientation_seqno(&self) -> SeqNo {
        self.props.seqno(AttrPart::Orientation)
    }

    fn has_bounds(&self) -> bool {
        true
    }
    fn bounds(&self) -> AggregateBoundingInfo {
        self.props.bounds()
    }
    fn bounds_seqno(&self) -> SeqNo {
        self.props.seqno(AttrPart::Bounds)
    }

    fn has_mesh(&self) -> bool {
        true
    }
    fn mesh(&self) -> &str {
        self.props.mesh()
    }
    fn mesh_seqno(&self) -> SeqNo {
        self.props.seqno(AttrPart::Mesh)
    }

    fn has_physics(&self) -> bool {
        true
    }
    fn physics(&self) -> &str {
        self.props.physics()
    }
    fn physics_seqno(&self) -> SeqNo {
        self.props.seqno(AttrPart::Physics)
    }

    fn has_parent(&self) -> bool {
        self.props.parent().is_some()
    }
    fn parent(&self) -> Option<ObjectId> {
        self.props.parent()
    }
    fn parent_seqno(&self) -> SeqNo {
        self.props.seqno(AttrPart::Parent)
    }

    fn has_zernike(&self) -> bool {
        self.props.zernike().is_some()
    }
    fn zernike(&self) -> Option<&str> {
        self.props.zernike()
    }
    fn zernike_seqno(&self) -> SeqNo {
        self.props.seqno(AttrPart::Zernike)
    }
}

/// Adapter that additionally stamps an epoch, for paths where an external
/// producer correlates the update with a client command.
pub struct PresenceLocUpdateWithEpoch<'a> {
    inner: PresenceLocUpdate<'a>,
    epoch: Option<u64>,
}

impl<'a> PresenceLocUpdateWithEpoch<'a> {
    pub fn new(object: ObjectId, props: &'a SequencedPresence, epoch: Option<u64>) -> Self {
        Self {
            inner: PresenceLocUpdate::new(object, props),
            epoch,
        }
    }
}

impl LocUpdateView for PresenceLocUpdateWithEpoch<'_> {
    fn object(&self) -> ObjectId {
        self.inner.object()
    }

    fn has_epoch(&self) -> bool {
        self.epoch.is_some()
    }
    fn epoch(&self) -> u64 {
        self.epoch.unwrap_or(0)
    }

    fn has_location(&self) -> bool {
        self.inner.has_location()
    }
    fn location(&self) -> TimedMotionVector3 {
        self.inner.location()
    }
    fn location_seqno(&self) -> SeqNo {
        self.inner.location_seqno()
    }

    fn has_orientation(&self) -> bool {
        self.inner.has_orientation()
    }
    fn orientation(&self) -> TimedMotionQuaternion {
        self.inner.orientation()
    }
    fn orientation_seqno(&self) -> SeqNo {
        self.inner.orientation_seqno()
    }

    fn has_bounds(&self) -> bool {
        self.inner.has_bounds()
    }
    fn bounds(&self) -> AggregateBoundingInfo {
        self.inner.bounds()
    }
    fn bounds_seqno(&self) -> SeqNo {
        self.inner.bounds_seqno()
    }

    fn has_mesh(&self) -> bool {
        self.inner.has_mesh()
    }
    fn mesh(&self) -> &str {
        self.inner.mesh()
    }
    fn mesh_seqno(&self) -> SeqNo {
        self.inner.mesh_seqno()
    }

    fn has_physics(&self) -> bool {
        self.inner.has_physics()
    }
    fn physics(&self) -> &str {
        self.inner.physics()
    }
    fn physics_seqno(&self) -> SeqNo {
        self.inner.physics_seqno()
    }

    fn has_parent(&self) -> bool {
        self.inner.has_parent()
    }
    fn parent(&self) -> Option<ObjectId> {
        self.inner.parent()
    }
    fn parent_seqno(&self) -> SeqNo {
        self.inner.parent_seqno()
    }

    fn has_zernike(&self) -> bool {
        self.inner.has_zernike()
    }
    fn zernike(&self) -> Option<&str> {
        self.inner.zernike()
    }
    fn zernike_seqno(&self) -> SeqNo {
        self.inner.zernike_seqno()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::update::PresenceUpdate;
    use core_motion::{MotionVector3, Time, Vector3};

    #[test]
    fn adapter_reflects_store_values_and_seqnos() {
        let mut props = SequencedPresence::default();
        props.apply(
            &PresenceUpdate::default()
                .with_location(
                    TimedMotionVector3::new(
                        Time::from_secs(2),
                        MotionVector3::stationary(Vector3::new(1.0, 2.0, 3.0)),
                    ),
                    SeqNo(7),
                )
                .with_mesh("meerkat:///x.dae", SeqNo(4)),
        );
        let id = ObjectId::from_index(9);
        let view = PresenceLocUpdate::new(id, &props);
        assert_eq!(view.object(), id);
        assert_eq!(view.location_seqno(), SeqNo(7));
        assert_eq!(view.mesh(), "meerkat:///x.dae");
        assert_eq!(view.mesh_seqno(), SeqNo(4));
        assert!(!view.has_epoch());
        assert!(!view.has_parent());
    }

    #[test]
    fn epoch_flavour_stamps_epoch() {
        let props = SequencedPresence::default();
        let id = ObjectId::from_index(1);
        let with = PresenceLocUpdateWithEpoch::new(id, &props, Some(12));
        assert!(with.has_epoch());
        assert_eq!(with.epoch(), 12);
        let without = PresenceLocUpdateWithEpoch::new(id, &props, None);
        assert!(!without.has_epoch());
    }
}
