//! Kafka Wire Protocol Implementation
//!
//! Client-side encoders and decoders for the subset of the Kafka protocol a
//! producer needs.
//!
//! ## Protocol Structure
//!
//! ```text
//! RequestMessage  => MessageSize RequestHeader RequestBody
//! ResponseMessage => MessageSize ResponseHeader ResponseBody
//! MessageSize     => int32
//! RequestHeader   => api_key api_version correlation_id client_id [tagged_fields]
//! ResponseHeader  => correlation_id [tagged_fields]
//! ```
//!
//! Tagged fields in the headers exist only in flexible versions (request
//! header v2, response header v1). ApiVersions responses always use response
//! header v0 so that a client can parse them before it knows what the broker
//! supports.
//!
//! ## Supported APIs
//!
//! | Key | API | Versions | Flexible from |
//! |----:|-----|----------|---------------|
//! | 0 | Produce | 3-9 | 9 |
//! | 3 | Metadata | 0-12 | 9 |
//! | 10 | FindCoordinator | 0-4 | 3 |
//! | 18 | ApiVersions | 0-3 | 3 |
//! | 22 | InitProducerId | 0-4 | 2 |
//! | 24 | AddPartitionsToTxn | 0-3 | 3 |
//! | 26 | EndTxn | 0-3 | 3 |

pub mod api_versions;
pub mod codec;
pub mod errors;
pub mod messages;
pub mod records;
pub mod tagged_fields;

pub use api_versions::*;
pub use codec::{CodecError, KafkaFrameCodec, Result};
pub use errors::ErrorCode;
pub use messages::*;
pub use records::{Record, RecordBatch, RecordBatchHeader, RecordHeader};
pub use tagged_fields::{TaggedField, TaggedFields};

use bytes::BytesMut;
use std::io::Cursor;
use std::marker::PhantomData;

pub const API_KEY_PRODUCE: i16 = 0;
pub const API_KEY_METADATA: i16 = 3;
pub const API_KEY_FIND_COORDINATOR: i16 = 10;
pub const API_KEY_API_VERSIONS: i16 = 18;
pub const API_KEY_INIT_PRODUCER_ID: i16 = 22;
pub const API_KEY_ADD_PARTITIONS_TO_TXN: i16 = 24;
pub const API_KEY_END_TXN: i16 = 26;

/// Inclusive range of protocol versions.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct VersionRange {
    pub min: i16,
    pub max: i16,
}

impl VersionRange {
    pub const fn new(min: i16, max: i16) -> Self {
        Self { min, max }
    }

    /// Range starting at `min` with no upper bound.
    pub const fn open(min: i16) -> Self {
        Self { min, max: i16::MAX }
    }

    pub fn contains(&self, version: i16) -> bool {
        version >= self.min && version <= self.max
    }

    /// Versions both sides accept, if any.
    pub fn intersect(&self, other: &VersionRange) -> Option<VersionRange> {
        let min = self.min.max(other.min);
        let max = self.max.min(other.max);
        (min <= max).then_some(VersionRange { min, max })
    }
}

impl std::fmt::Display for VersionRange {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}-{}", self.min, self.max)
    }
}

pub trait Encodable {
    fn encode(&self, buf: &mut BytesMut, version: i16) -> Result<()>;
}

pub trait Decodable: Sized {
    fn decode(cursor: &mut Cursor<&[u8]>, version: i16) -> Result<Self>;
}

/// A request body together with the schema facts needed to put it on the
/// wire: its key, the versions this client implements, and where the
/// flexible encoding starts.
pub trait ApiRequest: Encodable + Decodable + Send + Sync + 'static {
    const API_KEY: i16;
    const NAME: &'static str;
    const VERSIONS: VersionRange;
    const FLEXIBLE_VERSIONS: VersionRange;

    type Response: Encodable + Decodable + Send + 'static;

    fn is_flexible(version: i16) -> bool {
        Self::FLEXIBLE_VERSIONS.contains(version)
    }

    fn request_header_version(version: i16) -> i16 {
        if Self::is_flexible(version) {
            2
        } else {
            1
        }
    }

    fn response_header_version(version: i16) -> i16 {
        if Self::is_flexible(version) {
            1
        } else {
            0
        }
    }
}

/// Encoder/decoder for one request type pinned to a negotiated version.
///
/// Construction is where an unsupported version is rejected; once built the
/// codec never fails on version grounds.
#[derive(Debug)]
pub struct RequestCodec<R> {
    version: i16,
    _request: PhantomData<fn() -> R>,
}

impl<R> Clone for RequestCodec<R> {
    fn clone(&self) -> Self {
        *self
    }
}

impl<R> Copy for RequestCodec<R> {}

impl<R: ApiRequest> RequestCodec<R> {
    pub fn new(version: i16) -> Result<Self> {
        if !R::VERSIONS.contains(version) {
            return Err(CodecError::UnsupportedVersion {
                api_key: R::API_KEY,
                version,
            });
        }
        Ok(Self {
            version,
            _request: PhantomData,
        })
    }

    pub fn version(&self) -> i16 {
        self.version
    }

    /// Writes header and body of a request, without the frame length prefix.
    pub fn encode_request(
        &self,
        correlation_id: i32,
        client_id: Option<&str>,
        request: &R,
        buf: &mut BytesMut,
    ) -> Result<()> {
        let header = RequestHeader {
            api_key: R::API_KEY,
            api_version: self.version,
            correlation_id,
            client_id: client_id.map(str::to_owned),
            unknown_tagged_fields: TaggedFields::new(),
        };
        header.encode(buf, R::request_header_version(self.version))?;
        request.encode(buf, self.version)
    }

    /// Parses a request frame. Brokers and test doubles use this side.
    pub fn decode_request(&self, frame: &[u8]) -> Result<(RequestHeader, R)> {
        let mut cursor = Cursor::new(frame);
        let header = RequestHeader::decode(&mut cursor, R::request_header_version(self.version))?;
        let request = R::decode(&mut cursor, self.version)?;
        Ok((header, request))
    }

    pub fn encode_response(
        &self,
        correlation_id: i32,
        response: &R::Response,
        buf: &mut BytesMut,
    ) -> Result<()> {
        let header = ResponseHeader {
            correlation_id,
            unknown_tagged_fields: TaggedFields::new(),
        };
        header.encode(buf, R::response_header_version(self.version))?;
        response.encode(buf, self.version)
    }

    /// Parses a response frame, returning its correlation id and body.
    pub fn decode_response(&self, frame: &[u8]) -> Result<(i32, R::Response)> {
        let mut cursor = Cursor::new(frame);
        let header =
            ResponseHeader::decode(&mut cursor, R::response_header_version(self.version))?;
        let response = R::Response::decode(&mut cursor, self.version)?;
        Ok((header.correlation_id, response))
    }
}

/// Reads the correlation id that starts every response header.
pub fn peek_correlation_id(frame: &[u8]) -> Result<i32> {
    codec::get_i32(&mut Cursor::new(frame))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_version_range() {
        let ours = VersionRange::new(3, 9);
        assert!(ours.contains(3));
        assert!(ours.contains(9));
        assert!(!ours.contains(10));

        assert_eq!(
            ours.intersect(&VersionRange::new(0, 7)),
            Some(VersionRange::new(3, 7))
        );
        assert_eq!(ours.intersect(&VersionRange::new(10, 12)), None);
        assert!(VersionRange::open(9).contains(i16::MAX));
    }

    #[test]
    fn test_codec_rejects_unsupported_version() {
        let err = RequestCodec::<ProduceRequest>::new(2).unwrap_err();
        assert!(matches!(
            err,
            CodecError::UnsupportedVersion {
                api_key: API_KEY_PRODUCE,
                version: 2
            }
        ));
        assert!(RequestCodec::<ProduceRequest>::new(10).is_err());
        assert!(RequestCodec::<ProduceRequest>::new(9).is_ok());
    }

    #[test]
    fn test_api_versions_response_uses_header_v0() {
        assert_eq!(ApiVersionsRequest::response_header_version(3), 0);
        assert_eq!(ApiVersionsRequest::request_header_version(3), 2);
        assert_eq!(MetadataRequest::response_header_version(9), 1);
        assert_eq!(MetadataRequest::response_header_version(8), 0);
    }

    #[test]
    fn test_request_frame_roundtrip() {
        let codec = RequestCodec::<EndTxnRequest>::new(3).unwrap();
        let request = EndTxnRequest {
            transactional_id: "txn-1".to_string(),
            producer_id: 7,
            producer_epoch: 1,
            committed: true,
            ..Default::default()
        };

        let mut buf = BytesMut::new();
        codec
            .encode_request(11, Some("client"), &request, &mut buf)
            .unwrap();
        let (header, decoded) = codec.decode_request(&buf).unwrap();
        assert_eq!(header.api_key, API_KEY_END_TXN);
        assert_eq!(header.api_version, 3);
        assert_eq!(header.correlation_id, 11);
        assert_eq!(header.client_id.as_deref(), Some("client"));
        assert_eq!(decoded, request);

        let response = EndTxnResponse {
            throttle_time_ms: 5,
            error_code: 0,
            ..Default::default()
        };
        let mut buf = BytesMut::new();
        codec.encode_response(11, &response, &mut buf).unwrap();
        assert_eq!(peek_correlation_id(&buf).unwrap(), 11);
        let (correlation_id, decoded) = codec.decode_response(&buf).unwrap();
        assert_eq!(correlation_id, 11);
        assert_eq!(decoded, response);
    }
}
