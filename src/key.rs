//! Internal key encoding and the temporal comparator.
//!
//! Every record in the store is keyed by (propertyId, entityId, startTime).
//! The comparator orders propertyId ascending, entityId ascending and
//! startTime *descending*, so within one entity the newest version of a
//! property comes first. The same total order is used by the memtable, the
//! block builder, the merging iterators and the on-disk tables.

use std::cmp::Ordering;
use std::io;

use byteorder::{BigEndian, ByteOrder};

use crate::error::{Error, Result};

/// Encoded size of an internal key: u32 + u64 + i32 + kind byte.
pub const ENCODED_LEN: usize = 17;

/// Marks a record as a live value or an invalidation of earlier versions.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum ValueKind {
    Invalid,
    Value,
}

impl ValueKind {
    fn as_u8(self) -> u8 {
        match self {
            ValueKind::Invalid => 0,
            ValueKind::Value => 1,
        }
    }

    fn from_u8(byte: u8) -> Result<Self> {
        match byte {
            0 => Ok(ValueKind::Invalid),
            1 => Ok(ValueKind::Value),
            other => Err(Error::Decode(
                "value kind",
                io::Error::new(
                    io::ErrorKind::InvalidData,
                    format!("unknown kind byte {other}"),
                ),
            )),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct InternalKey {
    pub property_id: u32,
    pub entity_id: u64,
    pub start_time: i32,
    pub kind: ValueKind,
}

impl InternalKey {
    pub fn new(property_id: u32, entity_id: u64, start_time: i32) -> Self {
        Self {
            property_id,
            entity_id,
            start_time,
            kind: ValueKind::Value,
        }
    }

    pub fn encode(&self) -> Vec<u8> {
        let mut buf = Vec::with_capacity(ENCODED_LEN);
        self.encode_into(&mut buf);
        buf
    }

    pub fn encode_into(&self, buf: &mut Vec<u8>) {
        let mut fixed = [0u8; ENCODED_LEN];
        BigEndian::write_u32(&mut fixed[0..4], self.property_id);
        BigEndian::write_u64(&mut fixed[4..12], self.entity_id);
        BigEndian::write_i32(&mut fixed[12..16], self.start_time);
        fixed[16] = self.kind.as_u8();
        buf.extend_from_slice(&fixed);
    }

    pub fn decode(buf: &[u8]) -> Result<Self> {
        if buf.len() != ENCODED_LEN {
            return Err(Error::Decode(
                "internal key",
                io::Error::new(
                    io::ErrorKind::UnexpectedEof,
                    format!("expected {ENCODED_LEN} bytes, got {}", buf.len()),
                ),
            ));
        }
        Ok(Self {
            property_id: BigEndian::read_u32(&buf[0..4]),
            entity_id: BigEndian::read_u64(&buf[4..12]),
            start_time: BigEndian::read_i32(&buf[12..16]),
            kind: ValueKind::from_u8(buf[16])?,
        })
    }
}

impl Ord for InternalKey {
    fn cmp(&self, other: &Self) -> Ordering {
        self.property_id
            .cmp(&other.property_id)
            .then_with(|| self.entity_id.cmp(&other.entity_id))
            // Newer versions sort first within an entity.
            .then_with(|| other.start_time.cmp(&self.start_time))
            .then_with(|| self.kind.cmp(&other.kind))
    }
}

impl PartialOrd for InternalKey {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

/// Compares two encoded internal keys with the temporal order.
///
/// Malformed keys (wrong length) fall back to plain byte order so the
/// comparison stays total; decoding paths report the corruption separately.
pub fn compare_keys(a: &[u8], b: &[u8]) -> Ordering {
    if a.len() != ENCODED_LEN || b.len() != ENCODED_LEN {
        return a.cmp(b);
    }
    BigEndian::read_u32(&a[0..4])
        .cmp(&BigEndian::read_u32(&b[0..4]))
        .then_with(|| BigEndian::read_u64(&a[4..12]).cmp(&BigEndian::read_u64(&b[4..12])))
        .then_with(|| BigEndian::read_i32(&b[12..16]).cmp(&BigEndian::read_i32(&a[12..16])))
        .then_with(|| a[16].cmp(&b[16]))
}
