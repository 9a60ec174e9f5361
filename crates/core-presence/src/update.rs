//! Multi-attribute update batch applied to the store.
//!
//! Each present attribute carries its own proposed seqno; the store decides
//! acceptance per attribute. The mask is derived, not stored: an attribute
//! is "in" the update iff its field is `Some`.

use crate::attrs::{AttrMask, AttrPart};
use core_motion::{
    AggregateBoundingInfo, ObjectId, SeqNo, TimedMotionQuaternion, TimedMotionVector3,
};

#[derive(Debug, Clone, Default, PartialEq)]
pub struct PresenceUpdate {
    pub location: Option<(TimedMotionVector3, SeqNo)>,
    pub orientation: Option<(TimedMotionQuaternion, SeqNo)>,
    pub bounds: Option<(AggregateBoundingInfo, SeqNo)>,
    pub mesh: Option<(String, SeqNo)>,
    pub physics: Option<(String, SeqNo)>,
    /// `None` in the inner position clears the parent link.
    pub parent: Option<(Option<ObjectId>, SeqNo)>,
    pub zernike: Option<(Option<String>, SeqNo)>,
    /// Client-command correlation epoch, recorded on the record when present.
    pub epoch: Option<u64>,
}

impl PresenceUpdate {
    pub fn mask(&self) -> AttrMask {
        let mut m = AttrMask::empty();
        if self.location.is_some() {
            m |= AttrPart::Location.mask();
        }
        if self.orientation.is_some() {
            m |= AttrPart::Orientation.mask();
        }
        if self.bounds.is_some() {
            m |= AttrPart::Bounds.mask();
        }
        if self.mesh.is_some() {
            m |= AttrPart::Mesh.mask();
        }
        if self.physics.is_some() {
            m |= AttrPart::Physics.mask();
        }
        if self.parent.is_some() {
            m |= AttrPart::Parent.mask();
        }
        if self.zernike.is_some() {
            m |= AttrPart::Zernike.mask();
        }
        m
    }

    pub fn is_empty(&self) -> bool {
        self.mask().is_empty()
    }

    // Builder-style helpers keep test and ingress code readable.

    pub fn with_location(mut self, value: TimedMotionVector3, seqno: SeqNo) -> Self {
        self.location = Some((value, seqno));
        self
    }

    pub fn with_orientation(mut self, value: TimedMotionQuaternion, seqno: SeqNo) -> Self {
        self.orientation = Some((value, seqno));
        self
    }

    pub fn with_bounds(mut self, value: AggregateBoundingInfo, seqno: SeqNo) -> Self {
        self.bounds = Some((value, seqno));
        self
    }

    pub fn with_mesh(mut self, value: impl Into<String>, seqno: SeqNo) -> Self {
        self.mesh = Some((value.into(), seqno));
        self
    }

    pub fn with_physics(mut self, value: impl Into<String>, seqno: SeqNo) -> Self {
        self.physics = Some((value.into(), seqno));
        self
    }

    pub fn with_parent(mut self, value: Option<ObjectId>, seqno: SeqNo) -> Self {
        self.parent = Some((value, seqno));
        self
    }

    pub fn with_zernike(mut self, value: Option<String>, seqno: SeqNo) -> Self {
        self.zernike = Some((value, seqno));
        self
    }

    pub fn with_epoch(mut self, epoch: u64) -> Self {
        self.epoch = Some(epoch);
        self
    }
}
