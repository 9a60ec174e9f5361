//! Serialized location-update records.
//!
//! A location substream carries a sequence of self-delimiting frames, each
//! one update record: object id, attribute mask, the masked attribute
//! values, their per-attribute seqnos, and an optional request epoch. The
//! reader consumes greedily: decode as many complete frames as the buffer
//! holds, keep the remainder buffered. An incomplete tail is not an error;
//! a syntactically broken frame is, and the caller closes the substream.
//!
//! Frame layout (all integers big-endian):
//!
//! ```text
//! u32  payload length (bytes after this field)
//! [16] object id
//! u8   attribute mask
//! u8   epoch flag      \ u64 epoch when flag = 1
//! ...  per attribute in slot order, when its mask bit is set:
//!      u64 seqno, then the attribute encoding
//! ```
//!
//! Attribute encodings: location = u64 time + 6 × f32 (position, velocity);
//! orientation = u64 time + 8 × f32 (orientation, angular velocity);
//! bounds = 5 × f32; mesh/physics = u32 length + UTF-8; parent = u8 flag
//! [+ 16-byte id]; zernike = u8 flag [+ u32 length + UTF-8].

use bytes::{Buf, BufMut, BytesMut};
use core_motion::{
    AggregateBoundingInfo, MotionVector3, ObjectId, Quaternion, SeqNo, Time,
    TimedMotionQuaternion, TimedMotionVector3, Vector3,
};
use core_presence::{AttrMask, AttrPart, LocUpdateView, PresenceUpdate};
use thiserror::Error;

/// Upper bound on one frame's payload. Keeps a malformed or hostile length
/// prefix from pinning the session buffer.
pub const MAX_RECORD_LEN: usize = 1 << 20;

#[derive(Debug, Error, PartialEq, Eq)]
pub enum WireError {
    #[error("malformed update record: {0}")]
    Malformed(&'static str),
    #[error("update record of {len} bytes exceeds the {cap} byte cap")]
    Oversized { len: usize, cap: usize },
    #[error("invalid utf-8 in {0}")]
    InvalidUtf8(&'static str),
}

/// One decoded update record.
#[derive(Debug, Clone, PartialEq)]
pub struct LocUpdateRecord {
    pub object: ObjectId,
    pub update: PresenceUpdate,
}

impl LocUpdateRecord {
    pub fn new(object: ObjectId, update: PresenceUpdate) -> Self {
        Self { object, update }
    }

    /// Project a store view into a record carrying only the masked
    /// attributes. This is the outbound path: the policy masks the pending
    /// delta, the adapter supplies values and seqnos.
    pub fn from_view(view: &dyn LocUpdateView, mask: AttrMask) -> Self {
        let mut update = PresenceUpdate::default();
        if mask.contains(AttrPart::Location.mask()) && view.has_location() {
            update.location = Some((view.location(), view.location_seqno()));
        }
        if mask.contains(AttrPart::Orientation.mask()) && view.has_orientation() {
            update.orientation = Some((view.orientation(), view.orientation_seqno()));
        }
        if mask.contains(AttrPart::Bounds.mask()) && view.has_bounds() {
            update.bounds = Some((view.bounds(), view.bounds_seqno()));
        }
        if mask.contains(AttrPart::Mesh.mask()) && view.has_mesh() {
            update.mesh = Some((view.mesh().to_owned(), view.mesh_seqno()));
        }
        if mask.contains(AttrPart::Physics.mask()) && view.has_physics() {
            update.physics = Some((view.physics().to_owned(), view.physics_seqno()));
        }
        if mask.contains(AttrPart::Parent.mask()) {
            update.parent = Some((view.parent(), view.parent_seqno()));
        }
        if mask.contains(AttrPart::Zernike.mask()) {
            update.zernike = Some((view.zernike().map(str::to_owned), view.zernike_seqno()));
        }
        if view.has_epoch() {
            update.epoch = Some(view.epoch());
        }
        Self {
            object: view.object(),
            update,
        }
    }
}

fn put_vector3(dst: &mut BytesMut, v: Vector3) {
    dst.put_f32(v.x);
    dst.put_f32(v.y);
    dst.put_f32(v.z);
}

fn put_quaternion(dst: &mut BytesMut, q: Quaternion) {
    dst.put_f32(q.x);
    dst.put_f32(q.y);
    dst.put_f32(q.z);
    dst.put_f32(q.w);
}

fn put_string(dst: &mut BytesMut, s: &str) {
    dst.put_u32(s.len() as u32);
    dst.put_slice(s.as_bytes());
}

/// Append one encoded frame to `dst`.
pub fn encode_record(record: &LocUpdateRecord, dst: &mut BytesMut) {
    let mut body = BytesMut::with_capacity(64);
    body.put_slice(record.object.as_bytes());
    let mask = record.update.mask();
    body.put_u8(mask.bits());
    match record.update.epoch {
        Some(epoch) => {
            body.put_u8(1);
            body.put_u64(epoch);
        }
        None => body.put_u8(0),
    }

    if let Some((value, seqno)) = record.update.location {
        body.put_u64(seqno.0);
        body.put_u64(value.time.as_micros());
        put_vector3(&mut body, value.value.position);
        put_vector3(&mut body, value.value.velocity);
    }
    if let Some((value, seqno)) = record.update.orientation {
        body.put_u64(seqno.0);
        body.put_u64(value.time.as_micros());
        put_quaternion(&mut body, value.position);
        put_quaternion(&mut body, value.velocity);
    }
    if let Some((value, seqno)) = record.update.bounds {
        body.put_u64(seqno.0);
        put_vector3(&mut body, value.center_offset);
        body.put_f32(value.center_bounds_radius);
        body.put_f32(value.max_object_radius);
    }
    if let Some((ref value, seqno)) = record.update.mesh {
        body.put_u64(seqno.0);
        put_string(&mut body, value);
    }
    if let Some((ref value, seqno)) = record.update.physics {
        body.put_u64(seqno.0);
        put_string(&mut body, value);
    }
    if let Some((value, seqno)) = record.update.parent {
        body.put_u64(seqno.0);
        match value {
            Some(parent) => {
                body.put_u8(1);
                body.put_slice(parent.as_bytes());
            }
            None => body.put_u8(0),
        }
    }
    if let Some((ref value, seqno)) = record.update.zernike {
        body.put_u64(seqno.0);
        match value {
            Some(z) => {
                body.put_u8(1);
                put_string(&mut body, z);
            }
            None => body.put_u8(0),
        }
    }

    dst.put_u32(body.len() as u32);
    dst.extend_from_slice(&body);
}

struct Reader<'a> {
    buf: &'a [u8],
}

impl<'a> Reader<'a> {
    fn need(&self, n: usize, what: &'static str) -> Result<(), WireError> {
        if self.buf.remaining() < n {
            return Err(WireError::Malformed(what));
        }
        Ok(())
    }

    fn u8(&mut self, what: &'static str) -> Result<u8, WireError> {
        self.need(1, what)?;
        Ok(self.buf.get_u8())
    }

    fn u32(&mut self, what: &'static str) -> Result<u32, WireError> {
        self.need(4, what)?;
        Ok(self.buf.get_u32())
    }

    fn u64(&mut self, what: &'static str) -> Result<u64, WireError> {
        self.need(8, what)?;
        Ok(self.buf.get_u64())
    }

    fn f32(&mut self, what: &'static str) -> Result<f32, WireError> {
        self.need(4, what)?;
        Ok(self.buf.get_f32())
    }

    fn object_id(&mut self, what: &'static str) -> Result<ObjectId, WireError> {
        self.need(16, what)?;
        let mut bytes = [0u8; 16];
        self.buf.copy_to_slice(&mut bytes);
        Ok(ObjectId::from_bytes(bytes))
    }

    fn vector3(&mut self, what: &'static str) -> Result<Vector3, WireError> {
        Ok(Vector3::new(self.f32(what)?, self.f32(what)?, self.f32(what)?))
    }

    fn quaternion(&mut self, what: &'static str) -> Result<Quaternion, WireError> {
        Ok(Quaternion::new(
            self.f32(what)?,
            self.f32(what)?,
            self.f32(what)?,
            self.f32(what)?,
        ))
    }

    fn string(&mut self, what: &'static str) -> Result<String, WireError> {
        let len = self.u32(what)? as usize;
        if len > MAX_RECORD_LEN {
            return Err(WireError::Oversized {
                len,
                cap: MAX_RECORD_LEN,
            });
        }
        self.need(len, what)?;
        let mut bytes = vec![0u8; len];
        self.buf.copy_to_slice(&mut bytes);
        String::from_utf8(bytes).map_err(|_| WireError::InvalidUtf8(what))
    }
}

/// Decode one frame from the front of `src`. `Ok(None)` when the buffer does
/// not yet hold a complete frame (keep buffering); `Ok(Some((record,
/// consumed)))` on success.
pub fn decode_record(src: &[u8]) -> Result<Option<(LocUpdateRecord, usize)>, WireError> {
    if src.len() < 4 {
        return Ok(None);
    }
    let payload_len = u32::from_be_bytes([src[0], src[1], src[2], src[3]]) as usize;
    if payload_len > MAX_RECORD_LEN {
        return Err(WireError::Oversized {
            len: payload_len,
            cap: MAX_RECORD_LEN,
        });
    }
    if src.len() < 4 + payload_len {
        return Ok(None);
    }

    let mut r = Reader {
        buf: &src[4..4 + payload_len],
    };
    let object = r.object_id("object id")?;
    let mask =
        AttrMask::from_bits(r.u8("attribute mask")?).ok_or(WireError::Malformed("unknown mask bits"))?;
    let mut update = PresenceUpdate::default();
    match r.u8("epoch flag")? {
        0 => {}
        1 => update.epoch = Some(r.u64("epoch")?),
        _ => return Err(WireError::Malformed("epoch flag")),
    }

    if mask.contains(AttrPart::Location.mask()) {
        let seqno = SeqNo(r.u64("location seqno")?);
        let time = Time::from_micros(r.u64("location time")?);
        let position = r.vector3("location position")?;
        let velocity = r.vector3("location velocity")?;
        update.location = Some((
            TimedMotionVector3::new(time, MotionVector3::new(position, velocity)),
            seqno,
        ));
    }
    if mask.contains(AttrPart::Orientation.mask()) {
        let seqno = SeqNo(r.u64("orientation seqno")?);
        let time = Time::from_micros(r.u64("orientation time")?);
        let orientation = r.quaternion("orientation value")?;
        let velocity = r.quaternion("orientation velocity")?;
        update.orientation = Some((
            TimedMotionQuaternion::new(time, orientation, velocity),
            seqno,
        ));
    }
    if mask.contains(AttrPart::Bounds.mask()) {
        let seqno = SeqNo(r.u64("bounds seqno")?);
        let center_offset = r.vector3("bounds offset")?;
        let center_bounds_radius = r.f32("bounds radius")?;
        let max_object_radius = r.f32("bounds max size")?;
        update.bounds = Some((
            AggregateBoundingInfo::new(center_offset, center_bounds_radius, max_object_radius),
            seqno,
        ));
    }
    if mask.contains(AttrPart::Mesh.mask()) {
        let seqno = SeqNo(r.u64("mesh seqno")?);
        update.mesh = Some((r.string("mesh")?, seqno));
    }
    if mask.contains(AttrPart::Physics.mask()) {
        let seqno = SeqNo(r.u64("physics seqno")?);
        update.physics = Some((r.string("physics")?, seqno));
    }
    if mask.contains(AttrPart::Parent.mask()) {
        let seqno = SeqNo(r.u64("parent seqno")?);
        let parent = match r.u8("parent flag")? {
            0 => None,
            1 => Some(r.object_id("parent id")?),
            _ => return Err(WireError::Malformed("parent flag")),
        };
        update.parent = Some((parent, seqno));
    }
    if mask.contains(AttrPart::Zernike.mask()) {
        let seqno = SeqNo(r.u64("zernike seqno")?);
        let zernike = match r.u8("zernike flag")? {
            0 => None,
            1 => Some(r.string("zernike")?),
            _ => return Err(WireError::Malformed("zernike flag")),
        };
        update.zernike = Some((zernike, seqno));
    }

    if !r.buf.is_empty() {
        return Err(WireError::Malformed("trailing bytes in frame"));
    }

    Ok(Some((LocUpdateRecord { object, update }, 4 + payload_len)))
}

/// Accumulating reader for one substream: push bytes as they arrive, drain
/// complete records greedily.
#[derive(Debug, Default)]
pub struct UpdateStreamBuffer {
    buf: BytesMut,
}

impl UpdateStreamBuffer {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push(&mut self, bytes: &[u8]) {
        self.buf.extend_from_slice(bytes);
    }

    /// Decode every complete frame at the front of the buffer. The
    /// remainder stays buffered for the next push. An error poisons the
    /// stream: the caller closes the substream and drops this buffer.
    pub fn drain_records(&mut self) -> Result<Vec<LocUpdateRecord>, WireError> {
        let mut out = Vec::new();
        loop {
            match decode_record(&self.buf)? {
                Some((record, consumed)) => {
                    self.buf.advance(consumed);
                    out.push(record);
                }
                None => break,
            }
        }
        Ok(out)
    }

    /// Bytes still waiting for completion.
    pub fn pending_len(&self) -> usize {
        self.buf.len()
    }

    pub fn is_empty(&self) -> bool {
        self.buf.is_empty()
    }
}
