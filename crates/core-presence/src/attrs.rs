//! Attribute identification: the seven sequenced parts of a presence record
//! and the wire-visible mask selecting a subset of them.

use bitflags::bitflags;

/// Index of one sequenced attribute. Doubles as the slot index into the
/// per-record seqno array, so the discriminants are load-bearing.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum AttrPart {
    Location = 0,
    Orientation = 1,
    Bounds = 2,
    Mesh = 3,
    Physics = 4,
    Parent = 5,
    Zernike = 6,
}

impl AttrPart {
    pub const COUNT: usize = 7;

    pub const ALL: [AttrPart; AttrPart::COUNT] = [
        AttrPart::Location,
        AttrPart::Orientation,
        AttrPart::Bounds,
        AttrPart::Mesh,
        AttrPart::Physics,
        AttrPart::Parent,
        AttrPart::Zernike,
    ];

    pub const fn index(self) -> usize {
        self as usize
    }

    pub const fn mask(self) -> AttrMask {
        AttrMask::from_bits_truncate(1 << (self as u8))
    }

    pub const fn name(self) -> &'static str {
        match self {
            AttrPart::Location => "location",
            AttrPart::Orientation => "orientation",
            AttrPart::Bounds => "bounds",
            AttrPart::Mesh => "mesh",
            AttrPart::Physics => "physics",
            AttrPart::Parent => "parent",
            AttrPart::Zernike => "zernike",
        }
    }
}

bitflags! {
    /// Which attributes an update carries (ingress) or has pending (egress
    /// coalescing). One bit per `AttrPart`.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
    pub struct AttrMask: u8 {
        const LOCATION    = 1 << 0;
        const ORIENTATION = 1 << 1;
        const BOUNDS      = 1 << 2;
        const MESH        = 1 << 3;
        const PHYSICS     = 1 << 4;
        const PARENT      = 1 << 5;
        const ZERNIKE     = 1 << 6;
    }
}

impl AttrMask {
    /// Iterate the parts whose bit is set, in slot order.
    pub fn parts(self) -> impl Iterator<Item = AttrPart> {
        AttrPart::ALL.into_iter().filter(move |p| self.contains(p.mask()))
    }
}
