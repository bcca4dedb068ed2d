use bytes::{BufMut, BytesMut};
use std::io::Cursor;

use super::{get_tagged, put_tagged};
use crate::protocol::kafka::codec::{
    get_bool, get_i16, get_i32, get_i64, get_string, put_bool, put_string, Result,
};
use crate::protocol::kafka::tagged_fields::TaggedFields;
use crate::protocol::kafka::{ApiRequest, Decodable, Encodable, VersionRange, API_KEY_END_TXN};

#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct EndTxnRequest {
    pub transactional_id: String,
    pub producer_id: i64,
    pub producer_epoch: i16,
    /// `true` commits, `false` aborts.
    pub committed: bool,
    pub unknown_tagged_fields: TaggedFields,
}

impl ApiRequest for EndTxnRequest {
    const API_KEY: i16 = API_KEY_END_TXN;
    const NAME: &'static str = "EndTxn";
    const VERSIONS: VersionRange = VersionRange::new(0, 3);
    const FLEXIBLE_VERSIONS: VersionRange = VersionRange::open(3);
    type Response = EndTxnResponse;
}

impl Encodable for EndTxnRequest {
    fn encode(&self, buf: &mut BytesMut, version: i16) -> Result<()> {
        let flexible = Self::is_flexible(version);
        put_string(buf, &self.transactional_id, flexible)?;
        buf.put_i64(self.producer_id);
        buf.put_i16(self.producer_epoch);
        put_bool(buf, self.committed);
        put_tagged(buf, &self.unknown_tagged_fields, flexible);
        Ok(())
    }
}

impl Decodable for EndTxnRequest {
    fn decode(cursor: &mut Cursor<&[u8]>, version: i16) -> Result<Self> {
        let flexible = Self::is_flexible(version);
        Ok(Self {
            transactional_id: get_string(cursor, flexible)?,
            producer_id: get_i64(cursor)?,
            producer_epoch: get_i16(cursor)?,
            committed: get_bool(cursor)?,
            unknown_tagged_fields: get_tagged(cursor, flexible)?,
        })
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct EndTxnResponse {
    pub throttle_time_ms: i32,
    pub error_code: i16,
    pub unknown_tagged_fields: TaggedFields,
}

impl Encodable for EndTxnResponse {
    fn encode(&self, buf: &mut BytesMut, version: i16) -> Result<()> {
        buf.put_i32(self.throttle_time_ms);
        buf.put_i16(self.error_code);
        put_tagged(
            buf,
            &self.unknown_tagged_fields,
            EndTxnRequest::is_flexible(version),
        );
        Ok(())
    }
}

impl Decodable for EndTxnResponse {
    fn decode(cursor: &mut Cursor<&[u8]>, version: i16) -> Result<Self> {
        Ok(Self {
            throttle_time_ms: get_i32(cursor)?,
            error_code: get_i16(cursor)?,
            unknown_tagged_fields: get_tagged(cursor, EndTxnRequest::is_flexible(version))?,
        })
    }
}
