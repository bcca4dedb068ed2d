//! Tagged field blocks (KIP-482).
//!
//! Every structure in a flexible message version ends with a block of
//! optional fields identified by tag. The block is an unsigned varint count
//! followed by `(tag, size, payload)` triples, tags strictly increasing.
//! Fields this client does not interpret are carried as raw bytes so a
//! decoded message re-encodes byte-for-byte.

use bytes::{BufMut, Bytes, BytesMut};
use std::io::Cursor;

use super::codec::{get_raw, get_unsigned_varint, put_unsigned_varint, CodecError, Result};

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TaggedField {
    pub tag: u32,
    pub data: Bytes,
}

/// An ordered set of tagged fields.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct TaggedFields {
    fields: Vec<TaggedField>,
}

impl TaggedFields {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn is_empty(&self) -> bool {
        self.fields.is_empty()
    }

    pub fn len(&self) -> usize {
        self.fields.len()
    }

    /// Appends a field.
    ///
    /// # Panics
    ///
    /// Panics if `tag` is not greater than the last tag pushed. Tag order is
    /// fixed by the message schema, so a violation is a programming error.
    pub fn push(&mut self, tag: u32, data: impl Into<Bytes>) {
        if let Some(last) = self.fields.last() {
            assert!(
                tag > last.tag,
                "tagged field {} written after tag {}; tags must be strictly increasing",
                tag,
                last.tag
            );
        }
        self.fields.push(TaggedField {
            tag,
            data: data.into(),
        });
    }

    pub fn get(&self, tag: u32) -> Option<&Bytes> {
        self.fields
            .binary_search_by_key(&tag, |f| f.tag)
            .ok()
            .map(|i| &self.fields[i].data)
    }

    pub fn iter(&self) -> impl Iterator<Item = &TaggedField> {
        self.fields.iter()
    }

    pub fn encode(&self, buf: &mut BytesMut) {
        put_unsigned_varint(buf, self.fields.len() as u32);
        let mut previous: Option<u32> = None;
        for field in &self.fields {
            if let Some(prev) = previous {
                assert!(
                    field.tag > prev,
                    "tagged field {} encoded after tag {}",
                    field.tag,
                    prev
                );
            }
            previous = Some(field.tag);
            put_unsigned_varint(buf, field.tag);
            put_unsigned_varint(buf, field.data.len() as u32);
            buf.put_slice(&field.data);
        }
    }

    pub fn decode(cursor: &mut Cursor<&[u8]>) -> Result<Self> {
        let count = get_unsigned_varint(cursor)? as usize;
        let mut fields = Vec::with_capacity(count.min(16));
        let mut previous: Option<u32> = None;
        for _ in 0..count {
            let tag = get_unsigned_varint(cursor)?;
            if previous.is_some_and(|prev| tag <= prev) {
                return Err(CodecError::malformed(format!(
                    "Tagged field {} out of order after {}",
                    tag,
                    previous.unwrap_or_default()
                )));
            }
            previous = Some(tag);
            let size = get_unsigned_varint(cursor)? as usize;
            let data = get_raw(cursor, size)?;
            fields.push(TaggedField { tag, data });
        }
        Ok(Self { fields })
    }
}

/// Writes an empty tagged-field block.
pub fn put_empty_tagged_fields(buf: &mut BytesMut) {
    put_unsigned_varint(buf, 0);
}
