//! Kafka API Version Support
//!
//! The ApiVersions request/response pair and the per-connection table of
//! negotiated versions built from the broker's answer.

use bytes::{BufMut, BytesMut};
use std::collections::HashMap;
use std::io::Cursor;

use super::codec::{get_i16, get_i32, get_string, put_string, CodecError, Result};
use super::messages::{get_array, get_tagged, put_array, put_tagged};
use super::tagged_fields::TaggedFields;
use super::{
    AddPartitionsToTxnRequest, ApiRequest, Decodable, Encodable, EndTxnRequest,
    FindCoordinatorRequest, InitProducerIdRequest, MetadataRequest, ProduceRequest, VersionRange,
    API_KEY_API_VERSIONS,
};

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ApiVersionsRequest {
    /// v3+
    pub client_software_name: String,
    /// v3+
    pub client_software_version: String,
    pub unknown_tagged_fields: TaggedFields,
}

impl Default for ApiVersionsRequest {
    fn default() -> Self {
        Self {
            client_software_name: "kestrel".to_string(),
            client_software_version: env!("CARGO_PKG_VERSION").to_string(),
            unknown_tagged_fields: TaggedFields::new(),
        }
    }
}

impl ApiRequest for ApiVersionsRequest {
    const API_KEY: i16 = API_KEY_API_VERSIONS;
    const NAME: &'static str = "ApiVersions";
    const VERSIONS: VersionRange = VersionRange::new(0, 3);
    const FLEXIBLE_VERSIONS: VersionRange = VersionRange::open(3);
    type Response = ApiVersionsResponse;

    /// A broker may answer with a version lower than asked for, so the
    /// response header never carries tagged fields.
    fn response_header_version(_version: i16) -> i16 {
        0
    }
}

impl Encodable for ApiVersionsRequest {
    fn encode(&self, buf: &mut BytesMut, version: i16) -> Result<()> {
        if version >= 3 {
            put_string(buf, &self.client_software_name, true)?;
            put_string(buf, &self.client_software_version, true)?;
            self.unknown_tagged_fields.encode(buf);
        }
        Ok(())
    }
}

impl Decodable for ApiVersionsRequest {
    fn decode(cursor: &mut Cursor<&[u8]>, version: i16) -> Result<Self> {
        if version < 3 {
            return Ok(Self {
                client_software_name: String::new(),
                client_software_version: String::new(),
                unknown_tagged_fields: TaggedFields::new(),
            });
        }
        Ok(Self {
            client_software_name: get_string(cursor, true)?,
            client_software_version: get_string(cursor, true)?,
            unknown_tagged_fields: TaggedFields::decode(cursor)?,
        })
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct ApiVersionKey {
    pub api_key: i16,
    pub min_version: i16,
    pub max_version: i16,
    pub unknown_tagged_fields: TaggedFields,
}

#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct ApiVersionsResponse {
    pub error_code: i16,
    pub api_keys: Vec<ApiVersionKey>,
    /// v1+
    pub throttle_time_ms: i32,
    /// v3+; supported/finalized feature tags are kept here unparsed.
    pub unknown_tagged_fields: TaggedFields,
}

impl Encodable for ApiVersionsResponse {
    fn encode(&self, buf: &mut BytesMut, version: i16) -> Result<()> {
        let flexible = ApiVersionsRequest::is_flexible(version);
        buf.put_i16(self.error_code);
        put_array(buf, &self.api_keys, flexible, |buf, key| {
            buf.put_i16(key.api_key);
            buf.put_i16(key.min_version);
            buf.put_i16(key.max_version);
            put_tagged(buf, &key.unknown_tagged_fields, flexible);
            Ok(())
        })?;
        if version >= 1 {
            buf.put_i32(self.throttle_time_ms);
        }
        put_tagged(buf, &self.unknown_tagged_fields, flexible);
        Ok(())
    }
}

impl Decodable for ApiVersionsResponse {
    fn decode(cursor: &mut Cursor<&[u8]>, version: i16) -> Result<Self> {
        let flexible = ApiVersionsRequest::is_flexible(version);
        let error_code = get_i16(cursor)?;
        let api_keys = get_array(cursor, flexible, |cursor| {
            Ok(ApiVersionKey {
                api_key: get_i16(cursor)?,
                min_version: get_i16(cursor)?,
                max_version: get_i16(cursor)?,
                unknown_tagged_fields: get_tagged(cursor, flexible)?,
            })
        })?;
        Ok(Self {
            error_code,
            api_keys,
            throttle_time_ms: if version >= 1 { get_i32(cursor)? } else { 0 },
            unknown_tagged_fields: get_tagged(cursor, flexible)?,
        })
    }
}

/// Every API this client speaks, with the versions it implements.
pub fn supported_apis() -> [(i16, &'static str, VersionRange); 7] {
    fn entry<R: ApiRequest>() -> (i16, &'static str, VersionRange) {
        (R::API_KEY, R::NAME, R::VERSIONS)
    }
    [
        entry::<ProduceRequest>(),
        entry::<MetadataRequest>(),
        entry::<FindCoordinatorRequest>(),
        entry::<ApiVersionsRequest>(),
        entry::<InitProducerIdRequest>(),
        entry::<AddPartitionsToTxnRequest>(),
        entry::<EndTxnRequest>(),
    ]
}

/// Highest mutually supported version per API for one broker connection.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ApiVersionTable {
    versions: HashMap<i16, i16>,
}

impl ApiVersionTable {
    /// Intersects the broker's advertised ranges with ours. APIs with no
    /// overlap are left out and fail later lookups.
    pub fn negotiate(broker: &ApiVersionsResponse) -> Self {
        let advertised: HashMap<i16, VersionRange> = broker
            .api_keys
            .iter()
            .map(|k| (k.api_key, VersionRange::new(k.min_version, k.max_version)))
            .collect();

        let versions = supported_apis()
            .iter()
            .filter_map(|(api_key, _, ours)| {
                let theirs = advertised.get(api_key)?;
                ours.intersect(theirs).map(|range| (*api_key, range.max))
            })
            .collect();
        Self { versions }
    }

    /// Builds a table that uses our highest version everywhere; for tests
    /// and brokers known to be current.
    pub fn latest() -> Self {
        Self {
            versions: supported_apis()
                .iter()
                .map(|(api_key, _, range)| (*api_key, range.max))
                .collect(),
        }
    }

    pub fn get(&self, api_key: i16) -> Option<i16> {
        self.versions.get(&api_key).copied()
    }

    /// Negotiated version for `R`, or `UnsupportedVersion` when the broker
    /// shares no version of it with us.
    pub fn version_for<R: ApiRequest>(&self) -> Result<i16> {
        self.get(R::API_KEY).ok_or(CodecError::UnsupportedVersion {
            api_key: R::API_KEY,
            version: -1,
        })
    }

    /// Fails unless every API in `required` was negotiated.
    pub fn require(&self, required: &[i16]) -> Result<()> {
        match required.iter().find(|key| !self.versions.contains_key(key)) {
            Some(&api_key) => Err(CodecError::UnsupportedVersion {
                api_key,
                version: -1,
            }),
            None => Ok(()),
        }
    }
}
