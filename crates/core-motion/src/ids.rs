//! Opaque identifiers for the three addressable namespaces plus proximity
//! index handles.
//!
//! The namespaces are disjoint by construction (distinct types), which is what
//! lets the subscription registry key per-namespace maps without tagging.

use serde::{Deserialize, Serialize};
use std::fmt;

/// Opaque 128-bit object identifier.
///
/// Displayed as 32 lowercase hex digits. The server never interprets the
/// bytes; equality and hashing are all that matter.
#[derive(Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct ObjectId(pub [u8; 16]);

impl ObjectId {
    pub const fn from_bytes(bytes: [u8; 16]) -> Self {
        Self(bytes)
    }

    /// The all-zero id. Used as the "no parent" sentinel on the wire; inside
    /// the store `Option<ObjectId>` carries that meaning instead.
    pub const fn null() -> Self {
        Self([0u8; 16])
    }

    pub const fn is_null(&self) -> bool {
        let mut i = 0;
        while i < 16 {
            if self.0[i] != 0 {
                return false;
            }
            i += 1;
        }
        true
    }

    pub const fn as_bytes(&self) -> &[u8; 16] {
        &self.0
    }

    /// Parse the 32-hex-digit form produced by `Display`.
    pub fn from_hex(s: &str) -> Option<Self> {
        let s = s.trim();
        if s.len() != 32 || !s.is_ascii() {
            return None;
        }
        let mut b = [0u8; 16];
        for (i, chunk) in s.as_bytes().chunks_exact(2).enumerate() {
            let hi = (chunk[0] as char).to_digit(16)?;
            let lo = (chunk[1] as char).to_digit(16)?;
            b[i] = ((hi << 4) | lo) as u8;
        }
        Some(Self(b))
    }

    /// Deterministic id for tests and tooling: the index in big-endian in the
    /// low 8 bytes. Not random on purpose; reproducible traces beat entropy
    /// in every debugging session.
    pub const fn from_index(idx: u64) -> Self {
        let mut b = [0u8; 16];
        let be = idx.to_be_bytes();
        let mut i = 0;
        while i < 8 {
            b[8 + i] = be[i];
            i += 1;
        }
        Self(b)
    }
}

impl fmt::Display for ObjectId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for byte in self.0.iter() {
            write!(f, "{byte:02x}")?;
        }
        Ok(())
    }
}

impl fmt::Debug for ObjectId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "ObjectId({self})")
    }
}

/// Identifier of a peer space server.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct ServerId(pub u32);

impl ServerId {
    /// Reserved "no server" value, never assigned to a live peer.
    pub const fn null() -> Self {
        Self(0)
    }
}

impl fmt::Display for ServerId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "server-{}", self.0)
    }
}

/// Identifier of an object-host node (the process hosting simulated objects).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct OhNodeId(pub u64);

impl fmt::Display for OhNodeId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "oh-{}", self.0)
    }
}

/// Handle naming one proximity index inside a query processor. Subscriptions
/// may be scoped to a single index or cover the whole object.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct ProxIndexId(pub u32);

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn object_id_display_is_hex() {
        let id = ObjectId::from_bytes([
            0x00, 0x01, 0x02, 0x03, 0x04, 0x05, 0x06, 0x07, 0x08, 0x09, 0x0a, 0x0b, 0x0c, 0x0d,
            0x0e, 0xff,
        ]);
        assert_eq!(id.to_string(), "000102030405060708090a0b0c0d0eff");
    }

    #[test]
    fn null_is_null() {
        assert!(ObjectId::null().is_null());
        assert!(!ObjectId::from_index(1).is_null());
    }

    #[test]
    fn from_index_is_stable_and_distinct() {
        assert_eq!(ObjectId::from_index(7), ObjectId::from_index(7));
        assert_ne!(ObjectId::from_index(7), ObjectId::from_index(8));
    }

    #[test]
    fn hex_round_trip() {
        let id = ObjectId::from_index(0xdead_beef);
        assert_eq!(ObjectId::from_hex(&id.to_string()), Some(id));
        assert_eq!(ObjectId::from_hex("xyz"), None);
        assert_eq!(ObjectId::from_hex(""), None);
        assert_eq!(
            ObjectId::from_hex("0000000000000000000000000000000g"),
            None
        );
    }
}
