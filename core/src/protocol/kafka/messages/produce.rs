use bytes::{BufMut, Bytes, BytesMut};
use std::io::Cursor;

use super::{get_array, get_tagged, put_array, put_tagged};
use crate::protocol::kafka::codec::{
    get_i16, get_i32, get_i64, get_nullable_bytes, get_nullable_string, get_string,
    put_nullable_bytes, put_nullable_string, put_string, Result,
};
use crate::protocol::kafka::tagged_fields::TaggedFields;
use crate::protocol::kafka::{ApiRequest, Decodable, Encodable, VersionRange, API_KEY_PRODUCE};

#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct PartitionProduceData {
    pub index: i32,
    /// Encoded record batches.
    pub records: Option<Bytes>,
    pub unknown_tagged_fields: TaggedFields,
}

#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct TopicProduceData {
    pub name: String,
    pub partition_data: Vec<PartitionProduceData>,
    pub unknown_tagged_fields: TaggedFields,
}

#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct ProduceRequest {
    pub transactional_id: Option<String>,
    /// 0 = no response, 1 = leader only, -1 = full ISR.
    pub acks: i16,
    pub timeout_ms: i32,
    pub topic_data: Vec<TopicProduceData>,
    pub unknown_tagged_fields: TaggedFields,
}

impl ApiRequest for ProduceRequest {
    const API_KEY: i16 = API_KEY_PRODUCE;
    const NAME: &'static str = "Produce";
    // v3 is the first version carrying record batch v2.
    const VERSIONS: VersionRange = VersionRange::new(3, 9);
    const FLEXIBLE_VERSIONS: VersionRange = VersionRange::open(9);
    type Response = ProduceResponse;
}

impl Encodable for ProduceRequest {
    fn encode(&self, buf: &mut BytesMut, version: i16) -> Result<()> {
        let flexible = Self::is_flexible(version);
        put_nullable_string(buf, self.transactional_id.as_deref(), flexible)?;
        buf.put_i16(self.acks);
        buf.put_i32(self.timeout_ms);
        put_array(buf, &self.topic_data, flexible, |buf, topic| {
            put_string(buf, &topic.name, flexible)?;
            put_array(buf, &topic.partition_data, flexible, |buf, partition| {
                buf.put_i32(partition.index);
                put_nullable_bytes(buf, partition.records.as_deref(), flexible)?;
                put_tagged(buf, &partition.unknown_tagged_fields, flexible);
                Ok(())
            })?;
            put_tagged(buf, &topic.unknown_tagged_fields, flexible);
            Ok(())
        })?;
        put_tagged(buf, &self.unknown_tagged_fields, flexible);
        Ok(())
    }
}

impl Decodable for ProduceRequest {
    fn decode(cursor: &mut Cursor<&[u8]>, version: i16) -> Result<Self> {
        let flexible = Self::is_flexible(version);
        Ok(Self {
            transactional_id: get_nullable_string(cursor, flexible)?,
            acks: get_i16(cursor)?,
            timeout_ms: get_i32(cursor)?,
            topic_data: get_array(cursor, flexible, |cursor| {
                Ok(TopicProduceData {
                    name: get_string(cursor, flexible)?,
                    partition_data: get_array(cursor, flexible, |cursor| {
                        Ok(PartitionProduceData {
                            index: get_i32(cursor)?,
                            records: get_nullable_bytes(cursor, flexible)?,
                            unknown_tagged_fields: get_tagged(cursor, flexible)?,
                        })
                    })?,
                    unknown_tagged_fields: get_tagged(cursor, flexible)?,
                })
            })?,
            unknown_tagged_fields: get_tagged(cursor, flexible)?,
        })
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct BatchIndexAndErrorMessage {
    pub batch_index: i32,
    pub batch_index_error_message: Option<String>,
    pub unknown_tagged_fields: TaggedFields,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PartitionProduceResponse {
    pub index: i32,
    pub error_code: i16,
    pub base_offset: i64,
    pub log_append_time_ms: i64,
    /// v5+
    pub log_start_offset: i64,
    /// v8+
    pub record_errors: Vec<BatchIndexAndErrorMessage>,
    /// v8+
    pub error_message: Option<String>,
    pub unknown_tagged_fields: TaggedFields,
}

impl Default for PartitionProduceResponse {
    fn default() -> Self {
        Self {
            index: 0,
            error_code: 0,
            base_offset: -1,
            log_append_time_ms: -1,
            log_start_offset: -1,
            record_errors: Vec::new(),
            error_message: None,
            unknown_tagged_fields: TaggedFields::new(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct TopicProduceResponse {
    pub name: String,
    pub partition_responses: Vec<PartitionProduceResponse>,
    pub unknown_tagged_fields: TaggedFields,
}

#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct ProduceResponse {
    pub responses: Vec<TopicProduceResponse>,
    pub throttle_time_ms: i32,
    pub unknown_tagged_fields: TaggedFields,
}

impl ProduceResponse {
    pub fn partition(&self, topic: &str, index: i32) -> Option<&PartitionProduceResponse> {
        self.responses
            .iter()
            .filter(|t| t.name == topic)
            .flat_map(|t| t.partition_responses.iter())
            .find(|p| p.index == index)
    }
}

impl Encodable for ProduceResponse {
    fn encode(&self, buf: &mut BytesMut, version: i16) -> Result<()> {
        let flexible = ProduceRequest::is_flexible(version);
        put_array(buf, &self.responses, flexible, |buf, topic| {
            put_string(buf, &topic.name, flexible)?;
            put_array(buf, &topic.partition_responses, flexible, |buf, p| {
                buf.put_i32(p.index);
                buf.put_i16(p.error_code);
                buf.put_i64(p.base_offset);
                buf.put_i64(p.log_append_time_ms);
                if version >= 5 {
                    buf.put_i64(p.log_start_offset);
                }
                if version >= 8 {
                    put_array(buf, &p.record_errors, flexible, |buf, e| {
                        buf.put_i32(e.batch_index);
                        put_nullable_string(buf, e.batch_index_error_message.as_deref(), flexible)?;
                        put_tagged(buf, &e.unknown_tagged_fields, flexible);
                        Ok(())
                    })?;
                    put_nullable_string(buf, p.error_message.as_deref(), flexible)?;
                }
                put_tagged(buf, &p.unknown_tagged_fields, flexible);
                Ok(())
            })?;
            put_tagged(buf, &topic.unknown_tagged_fields, flexible);
            Ok(())
        })?;
        buf.put_i32(self.throttle_time_ms);
        put_tagged(buf, &self.unknown_tagged_fields, flexible);
        Ok(())
    }
}

impl Decodable for ProduceResponse {
    fn decode(cursor: &mut Cursor<&[u8]>, version: i16) -> Result<Self> {
        let flexible = ProduceRequest::is_flexible(version);
        let responses = get_array(cursor, flexible, |cursor| {
            Ok(TopicProduceResponse {
                name: get_string(cursor, flexible)?,
                partition_responses: get_array(cursor, flexible, |cursor| {
                    let mut p = PartitionProduceResponse {
                        index: get_i32(cursor)?,
                        error_code: get_i16(cursor)?,
                        base_offset: get_i64(cursor)?,
                        log_append_time_ms: get_i64(cursor)?,
                        ..Default::default()
                    };
                    if version >= 5 {
                        p.log_start_offset = get_i64(cursor)?;
                    }
                    if version >= 8 {
                        p.record_errors = get_array(cursor, flexible, |cursor| {
                            Ok(BatchIndexAndErrorMessage {
                                batch_index: get_i32(cursor)?,
                                batch_index_error_message: get_nullable_string(cursor, flexible)?,
                                unknown_tagged_fields: get_tagged(cursor, flexible)?,
                            })
                        })?;
                        p.error_message = get_nullable_string(cursor, flexible)?;
                    }
                    p.unknown_tagged_fields = get_tagged(cursor, flexible)?;
                    Ok(p)
                })?,
                unknown_tagged_fields: get_tagged(cursor, flexible)?,
            })
        })?;
        Ok(Self {
            responses,
            throttle_time_ms: get_i32(cursor)?,
            unknown_tagged_fields: get_tagged(cursor, flexible)?,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::super::test_util::roundtrip;
    use super::*;
    use crate::protocol::kafka::records::{Record, RecordBatch};
    use proptest::prelude::*;

    fn sample_request(batch: Bytes) -> ProduceRequest {
        ProduceRequest {
            transactional_id: Some("txn".to_string()),
            acks: -1,
            timeout_ms: 30_000,
            topic_data: vec![TopicProduceData {
                name: "orders".to_string(),
                partition_data: vec![
                    PartitionProduceData {
                        index: 0,
                        records: Some(batch),
                        unknown_tagged_fields: TaggedFields::new(),
                    },
                    PartitionProduceData {
                        index: 1,
                        records: None,
                        unknown_tagged_fields: TaggedFields::new(),
                    },
                ],
                unknown_tagged_fields: TaggedFields::new(),
            }],
            unknown_tagged_fields: TaggedFields::new(),
        }
    }

    #[test]
    fn test_request_carries_record_batch() {
        let batch = RecordBatch {
            records: vec![Record {
                value: Some(Bytes::from_static(b"hello")),
                ..Default::default()
            }],
            ..Default::default()
        };
        let mut encoded = BytesMut::new();
        batch.encode(&mut encoded).unwrap();
        let request = sample_request(encoded.freeze());

        for version in 3..=9 {
            let decoded = roundtrip(&request, version);
            assert_eq!(decoded, request, "v{}", version);
            let records = decoded.topic_data[0].partition_data[0].records.clone().unwrap();
            let batch = RecordBatch::decode(&mut Cursor::new(records.as_ref())).unwrap();
            assert_eq!(batch.records[0].value.as_deref(), Some(&b"hello"[..]));
        }
    }

    #[test]
    fn test_response_roundtrip_all_versions() {
        for version in 3..=9 {
            let response = ProduceResponse {
                responses: vec![TopicProduceResponse {
                    name: "orders".to_string(),
                    partition_responses: vec![PartitionProduceResponse {
                        index: 2,
                        error_code: if version >= 8 { 87 } else { 0 },
                        base_offset: 100,
                        log_append_time_ms: -1,
                        log_start_offset: if version >= 5 { 10 } else { -1 },
                        record_errors: if version >= 8 {
                            vec![BatchIndexAndErrorMessage {
                                batch_index: 1,
                                batch_index_error_message: Some("bad".to_string()),
                                unknown_tagged_fields: TaggedFields::new(),
                            }]
                        } else {
                            vec![]
                        },
                        error_message: if version >= 8 { Some("invalid".to_string()) } else { None },
                        unknown_tagged_fields: TaggedFields::new(),
                    }],
                    unknown_tagged_fields: TaggedFields::new(),
                }],
                throttle_time_ms: 4,
                unknown_tagged_fields: TaggedFields::new(),
            };
            let decoded = roundtrip(&response, version);
            assert_eq!(decoded, response, "v{}", version);
            assert_eq!(decoded.partition("orders", 2).map(|p| p.base_offset), Some(100));
            assert!(decoded.partition("orders", 3).is_none());
        }
    }

    proptest! {
        #[test]
        fn prop_request_roundtrip(
            version in 3i16..=9,
            acks in prop::sample::select(vec![-1i16, 0, 1]),
            timeout_ms in 0i32..120_000,
            name in "[a-z][a-z0-9._-]{0,40}",
            partitions in prop::collection::vec(
                (0i32..1000, prop::option::of(prop::collection::vec(any::<u8>(), 0..64))),
                0..6,
            ),
        ) {
            let request = ProduceRequest {
                transactional_id: None,
                acks,
                timeout_ms,
                topic_data: vec![TopicProduceData {
                    name,
                    partition_data: partitions
                        .into_iter()
                        .map(|(index, records)| PartitionProduceData {
                            index,
                            records: records.map(Bytes::from),
                            unknown_tagged_fields: TaggedFields::new(),
                        })
                        .collect(),
                    unknown_tagged_fields: TaggedFields::new(),
                }],
                unknown_tagged_fields: TaggedFields::new(),
            };
            prop_assert_eq!(roundtrip(&request, version), request);
        }
    }
}
