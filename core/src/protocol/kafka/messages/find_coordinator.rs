use bytes::{BufMut, BytesMut};
use std::io::Cursor;

use super::{get_array, get_tagged, put_array, put_tagged};
use crate::protocol::kafka::codec::{
    get_i16, get_i32, get_i8, get_nullable_string, get_string, put_nullable_string, put_string,
    Result,
};
use crate::protocol::kafka::tagged_fields::TaggedFields;
use crate::protocol::kafka::{
    ApiRequest, Decodable, Encodable, VersionRange, API_KEY_FIND_COORDINATOR,
};

/// Coordinator kinds understood by FindCoordinator v1+.
pub mod coordinator_type {
    pub const GROUP: i8 = 0;
    pub const TRANSACTION: i8 = 1;
}

#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct FindCoordinatorRequest {
    /// v0-3 single key.
    pub key: String,
    pub key_type: i8,
    /// v4+ batched keys.
    pub coordinator_keys: Vec<String>,
    pub unknown_tagged_fields: TaggedFields,
}

impl FindCoordinatorRequest {
    /// Looks up the transaction coordinator for `transactional_id`; fills
    /// both the single-key and batched forms so any version can be sent.
    pub fn transaction(transactional_id: impl Into<String>) -> Self {
        let key = transactional_id.into();
        Self {
            coordinator_keys: vec![key.clone()],
            key,
            key_type: coordinator_type::TRANSACTION,
            unknown_tagged_fields: TaggedFields::new(),
        }
    }
}

impl ApiRequest for FindCoordinatorRequest {
    const API_KEY: i16 = API_KEY_FIND_COORDINATOR;
    const NAME: &'static str = "FindCoordinator";
    const VERSIONS: VersionRange = VersionRange::new(0, 4);
    const FLEXIBLE_VERSIONS: VersionRange = VersionRange::open(3);
    type Response = FindCoordinatorResponse;
}

impl Encodable for FindCoordinatorRequest {
    fn encode(&self, buf: &mut BytesMut, version: i16) -> Result<()> {
        let flexible = Self::is_flexible(version);
        if version <= 3 {
            put_string(buf, &self.key, flexible)?;
        }
        if version >= 1 {
            buf.put_i8(self.key_type);
        }
        if version >= 4 {
            put_array(buf, &self.coordinator_keys, flexible, |buf, key| {
                put_string(buf, key, flexible)
            })?;
        }
        put_tagged(buf, &self.unknown_tagged_fields, flexible);
        Ok(())
    }
}

impl Decodable for FindCoordinatorRequest {
    fn decode(cursor: &mut Cursor<&[u8]>, version: i16) -> Result<Self> {
        let flexible = Self::is_flexible(version);
        let mut request = FindCoordinatorRequest::default();
        if version <= 3 {
            request.key = get_string(cursor, flexible)?;
        }
        if version >= 1 {
            request.key_type = get_i8(cursor)?;
        }
        if version >= 4 {
            request.coordinator_keys = get_array(cursor, flexible, |c| get_string(c, flexible))?;
        }
        request.unknown_tagged_fields = get_tagged(cursor, flexible)?;
        Ok(request)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct Coordinator {
    pub key: String,
    pub node_id: i32,
    pub host: String,
    pub port: i32,
    pub error_code: i16,
    pub error_message: Option<String>,
    pub unknown_tagged_fields: TaggedFields,
}

#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct FindCoordinatorResponse {
    pub throttle_time_ms: i32,
    /// v0-3 single-key result fields.
    pub error_code: i16,
    pub error_message: Option<String>,
    pub node_id: i32,
    pub host: String,
    pub port: i32,
    /// v4+ per-key results.
    pub coordinators: Vec<Coordinator>,
    pub unknown_tagged_fields: TaggedFields,
}

impl FindCoordinatorResponse {
    /// The result for `key`, whichever layout the broker answered with.
    pub fn coordinator_for(&self, key: &str) -> Option<Coordinator> {
        if self.coordinators.is_empty() {
            return Some(Coordinator {
                key: key.to_string(),
                node_id: self.node_id,
                host: self.host.clone(),
                port: self.port,
                error_code: self.error_code,
                error_message: self.error_message.clone(),
                unknown_tagged_fields: TaggedFields::new(),
            });
        }
        self.coordinators.iter().find(|c| c.key == key).cloned()
    }
}

impl Encodable for FindCoordinatorResponse {
    fn encode(&self, buf: &mut BytesMut, version: i16) -> Result<()> {
        let flexible = FindCoordinatorRequest::is_flexible(version);
        if version >= 1 {
            buf.put_i32(self.throttle_time_ms);
        }
        if version <= 3 {
            buf.put_i16(self.error_code);
            if version >= 1 {
                put_nullable_string(buf, self.error_message.as_deref(), flexible)?;
            }
            buf.put_i32(self.node_id);
            put_string(buf, &self.host, flexible)?;
            buf.put_i32(self.port);
        } else {
            put_array(buf, &self.coordinators, flexible, |buf, c| {
                put_string(buf, &c.key, flexible)?;
                buf.put_i32(c.node_id);
                put_string(buf, &c.host, flexible)?;
                buf.put_i32(c.port);
                buf.put_i16(c.error_code);
                put_nullable_string(buf, c.error_message.as_deref(), flexible)?;
                put_tagged(buf, &c.unknown_tagged_fields, flexible);
                Ok(())
            })?;
        }
        put_tagged(buf, &self.unknown_tagged_fields, flexible);
        Ok(())
    }
}

impl Decodable for FindCoordinatorResponse {
    fn decode(cursor: &mut Cursor<&[u8]>, version: i16) -> Result<Self> {
        let flexible = FindCoordinatorRequest::is_flexible(version);
        let mut response = FindCoordinatorResponse::default();
        if version >= 1 {
            response.throttle_time_ms = get_i32(cursor)?;
        }
        if version <= 3 {
            response.error_code = get_i16(cursor)?;
            if version >= 1 {
                response.error_message = get_nullable_string(cursor, flexible)?;
            }
            response.node_id = get_i32(cursor)?;
            response.host = get_string(cursor, flexible)?;
            response.port = get_i32(cursor)?;
        } else {
            response.coordinators = get_array(cursor, flexible, |cursor| {
                Ok(Coordinator {
                    key: get_string(cursor, flexible)?,
                    node_id: get_i32(cursor)?,
                    host: get_string(cursor, flexible)?,
                    port: get_i32(cursor)?,
                    error_code: get_i16(cursor)?,
                    error_message: get_nullable_string(cursor, flexible)?,
                    unknown_tagged_fields: get_tagged(cursor, flexible)?,
                })
            })?;
        }
        response.unknown_tagged_fields = get_tagged(cursor, flexible)?;
        Ok(response)
    }
}

#[cfg(test)]
mod tests {
    use super::super::test_util::roundtrip;
    use super::*;

    #[test]
    fn test_request_roundtrip_all_versions() {
        for version in 0..=4 {
            let full = FindCoordinatorRequest::transaction("txn-a");
            let decoded = roundtrip(&full, version);
            if version <= 3 {
                assert_eq!(decoded.key, "txn-a");
                assert!(decoded.coordinator_keys.is_empty());
            } else {
                assert_eq!(decoded.coordinator_keys, vec!["txn-a".to_string()]);
            }
            let expected_type = if version >= 1 { coordinator_type::TRANSACTION } else { 0 };
            assert_eq!(decoded.key_type, expected_type);
        }
    }

    #[test]
    fn test_v3_request_is_compact() {
        let mut buf = BytesMut::new();
        FindCoordinatorRequest::transaction("t")
            .encode(&mut buf, 3)
            .unwrap();
        // compact "t", key_type, empty tagged fields
        assert_eq!(buf.as_ref(), &[0x02, b't', 0x01, 0x00]);
    }

    #[test]
    fn test_response_roundtrip_single_key_versions() {
        for version in 0..=3 {
            let response = FindCoordinatorResponse {
                throttle_time_ms: if version >= 1 { 3 } else { 0 },
                error_code: 0,
                error_message: if version >= 1 { Some("ok".to_string()) } else { None },
                node_id: 2,
                host: "broker-2".to_string(),
                port: 9093,
                ..Default::default()
            };
            assert_eq!(roundtrip(&response, version), response, "v{}", version);

            let coordinator = response.coordinator_for("txn").unwrap();
            assert_eq!(coordinator.node_id, 2);
            assert_eq!(coordinator.port, 9093);
        }
    }

    #[test]
    fn test_response_roundtrip_v4() {
        let response = FindCoordinatorResponse {
            throttle_time_ms: 1,
            coordinators: vec![
                Coordinator {
                    key: "a".to_string(),
                    node_id: 1,
                    host: "h1".to_string(),
                    port: 1,
                    ..Default::default()
                },
                Coordinator {
                    key: "b".to_string(),
                    node_id: -1,
                    error_code: 15,
                    error_message: Some("not available".to_string()),
                    ..Default::default()
                },
            ],
            ..Default::default()
        };
        let decoded = roundtrip(&response, 4);
        assert_eq!(decoded, response);
        assert_eq!(decoded.coordinator_for("b").unwrap().error_code, 15);
        assert!(decoded.coordinator_for("c").is_none());
    }
}
