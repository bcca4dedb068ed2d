use bytes::{BufMut, BytesMut};
use std::io::Cursor;

use super::{get_tagged, put_tagged};
use crate::protocol::kafka::codec::{
    get_i16, get_i32, get_i64, get_nullable_string, put_nullable_string, Result,
};
use crate::protocol::kafka::records::{NO_PRODUCER_EPOCH, NO_PRODUCER_ID};
use crate::protocol::kafka::tagged_fields::TaggedFields;
use crate::protocol::kafka::{
    ApiRequest, Decodable, Encodable, VersionRange, API_KEY_INIT_PRODUCER_ID,
};

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct InitProducerIdRequest {
    /// `None` for an idempotent-only producer.
    pub transactional_id: Option<String>,
    pub transaction_timeout_ms: i32,
    /// v3+: the current identity when re-initialising, else -1.
    pub producer_id: i64,
    pub producer_epoch: i16,
    pub unknown_tagged_fields: TaggedFields,
}

impl Default for InitProducerIdRequest {
    fn default() -> Self {
        Self {
            transactional_id: None,
            transaction_timeout_ms: 60_000,
            producer_id: NO_PRODUCER_ID,
            producer_epoch: NO_PRODUCER_EPOCH,
            unknown_tagged_fields: TaggedFields::new(),
        }
    }
}

impl ApiRequest for InitProducerIdRequest {
    const API_KEY: i16 = API_KEY_INIT_PRODUCER_ID;
    const NAME: &'static str = "InitProducerId";
    const VERSIONS: VersionRange = VersionRange::new(0, 4);
    const FLEXIBLE_VERSIONS: VersionRange = VersionRange::open(2);
    type Response = InitProducerIdResponse;
}

impl Encodable for InitProducerIdRequest {
    fn encode(&self, buf: &mut BytesMut, version: i16) -> Result<()> {
        let flexible = Self::is_flexible(version);
        put_nullable_string(buf, self.transactional_id.as_deref(), flexible)?;
        buf.put_i32(self.transaction_timeout_ms);
        if version >= 3 {
            buf.put_i64(self.producer_id);
            buf.put_i16(self.producer_epoch);
        }
        put_tagged(buf, &self.unknown_tagged_fields, flexible);
        Ok(())
    }
}

impl Decodable for InitProducerIdRequest {
    fn decode(cursor: &mut Cursor<&[u8]>, version: i16) -> Result<Self> {
        let flexible = Self::is_flexible(version);
        let mut request = InitProducerIdRequest {
            transactional_id: get_nullable_string(cursor, flexible)?,
            transaction_timeout_ms: get_i32(cursor)?,
            ..Default::default()
        };
        if version >= 3 {
            request.producer_id = get_i64(cursor)?;
            request.producer_epoch = get_i16(cursor)?;
        }
        request.unknown_tagged_fields = get_tagged(cursor, flexible)?;
        Ok(request)
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct InitProducerIdResponse {
    pub throttle_time_ms: i32,
    pub error_code: i16,
    pub producer_id: i64,
    pub producer_epoch: i16,
    pub unknown_tagged_fields: TaggedFields,
}

impl Default for InitProducerIdResponse {
    fn default() -> Self {
        Self {
            throttle_time_ms: 0,
            error_code: 0,
            producer_id: NO_PRODUCER_ID,
            producer_epoch: NO_PRODUCER_EPOCH,
            unknown_tagged_fields: TaggedFields::new(),
        }
    }
}

impl Encodable for InitProducerIdResponse {
    fn encode(&self, buf: &mut BytesMut, version: i16) -> Result<()> {
        buf.put_i32(self.throttle_time_ms);
        buf.put_i16(self.error_code);
        buf.put_i64(self.producer_id);
        buf.put_i16(self.producer_epoch);
        put_tagged(
            buf,
            &self.unknown_tagged_fields,
            InitProducerIdRequest::is_flexible(version),
        );
        Ok(())
    }
}

impl Decodable for InitProducerIdResponse {
    fn decode(cursor: &mut Cursor<&[u8]>, version: i16) -> Result<Self> {
        Ok(Self {
            throttle_time_ms: get_i32(cursor)?,
            error_code: get_i16(cursor)?,
            producer_id: get_i64(cursor)?,
            producer_epoch: get_i16(cursor)?,
            unknown_tagged_fields: get_tagged(
                cursor,
                InitProducerIdRequest::is_flexible(version),
            )?,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::super::test_util::roundtrip;
    use super::*;

    #[test]
    fn test_request_roundtrip_all_versions() {
        for version in 0..=4 {
            let request = InitProducerIdRequest {
                transactional_id: Some("txn".to_string()),
                transaction_timeout_ms: 30_000,
                producer_id: if version >= 3 { 12 } else { NO_PRODUCER_ID },
                producer_epoch: if version >= 3 { 2 } else { NO_PRODUCER_EPOCH },
                unknown_tagged_fields: TaggedFields::new(),
            };
            assert_eq!(roundtrip(&request, version), request, "v{}", version);
        }
    }

    #[test]
    fn test_idempotent_request_v2_bytes() {
        let mut buf = BytesMut::new();
        InitProducerIdRequest::default().encode(&mut buf, 2).unwrap();
        // null compact string, timeout 60000, no tags
        assert_eq!(buf.as_ref(), &[0x00, 0x00, 0x00, 0xEA, 0x60, 0x00]);
    }

    #[test]
    fn test_response_roundtrip_all_versions() {
        for version in 0..=4 {
            let response = InitProducerIdResponse {
                throttle_time_ms: 0,
                error_code: 0,
                producer_id: 4000,
                producer_epoch: 0,
                unknown_tagged_fields: TaggedFields::new(),
            };
            assert_eq!(roundtrip(&response, version), response);
        }
    }
}
