use bytes::{BufMut, BytesMut};
use std::io::Cursor;

use super::{get_tagged, put_tagged};
use crate::protocol::kafka::codec::{get_i16, get_i32, get_nullable_string, put_nullable_string, Result};
use crate::protocol::kafka::tagged_fields::TaggedFields;

#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct RequestHeader {
    pub api_key: i16,
    pub api_version: i16,
    pub correlation_id: i32,
    pub client_id: Option<String>,
    pub unknown_tagged_fields: TaggedFields,
}

impl RequestHeader {
    /// `header_version` is 1 or 2. The client id keeps its legacy int16
    /// string form even in header v2.
    pub fn encode(&self, buf: &mut BytesMut, header_version: i16) -> Result<()> {
        buf.put_i16(self.api_key);
        buf.put_i16(self.api_version);
        buf.put_i32(self.correlation_id);
        put_nullable_string(buf, self.client_id.as_deref(), false)?;
        put_tagged(buf, &self.unknown_tagged_fields, header_version >= 2);
        Ok(())
    }

    pub fn decode(cursor: &mut Cursor<&[u8]>, header_version: i16) -> Result<Self> {
        Ok(Self {
            api_key: get_i16(cursor)?,
            api_version: get_i16(cursor)?,
            correlation_id: get_i32(cursor)?,
            client_id: get_nullable_string(cursor, false)?,
            unknown_tagged_fields: get_tagged(cursor, header_version >= 2)?,
        })
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct ResponseHeader {
    pub correlation_id: i32,
    pub unknown_tagged_fields: TaggedFields,
}

impl ResponseHeader {
    pub fn encode(&self, buf: &mut BytesMut, header_version: i16) -> Result<()> {
        buf.put_i32(self.correlation_id);
        put_tagged(buf, &self.unknown_tagged_fields, header_version >= 1);
        Ok(())
    }

    pub fn decode(cursor: &mut Cursor<&[u8]>, header_version: i16) -> Result<Self> {
        Ok(Self {
            correlation_id: get_i32(cursor)?,
            unknown_tagged_fields: get_tagged(cursor, header_version >= 1)?,
        })
    }
}
