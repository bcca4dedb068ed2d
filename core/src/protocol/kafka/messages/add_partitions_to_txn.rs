use bytes::{BufMut, BytesMut};
use std::io::Cursor;

use super::{get_array, get_tagged, put_array, put_tagged};
use crate::protocol::kafka::codec::{
    get_i16, get_i32, get_i32_array, get_i64, get_string, put_i32_array, put_string, Result,
};
use crate::protocol::kafka::tagged_fields::TaggedFields;
use crate::protocol::kafka::{
    ApiRequest, Decodable, Encodable, VersionRange, API_KEY_ADD_PARTITIONS_TO_TXN,
};

#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct AddPartitionsToTxnTopic {
    pub name: String,
    pub partitions: Vec<i32>,
    pub unknown_tagged_fields: TaggedFields,
}

#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct AddPartitionsToTxnRequest {
    pub transactional_id: String,
    pub producer_id: i64,
    pub producer_epoch: i16,
    pub topics: Vec<AddPartitionsToTxnTopic>,
    pub unknown_tagged_fields: TaggedFields,
}

impl ApiRequest for AddPartitionsToTxnRequest {
    const API_KEY: i16 = API_KEY_ADD_PARTITIONS_TO_TXN;
    const NAME: &'static str = "AddPartitionsToTxn";
    // v4+ batches several transactions per request; a producer never needs it.
    const VERSIONS: VersionRange = VersionRange::new(0, 3);
    const FLEXIBLE_VERSIONS: VersionRange = VersionRange::open(3);
    type Response = AddPartitionsToTxnResponse;
}

impl Encodable for AddPartitionsToTxnRequest {
    fn encode(&self, buf: &mut BytesMut, version: i16) -> Result<()> {
        let flexible = Self::is_flexible(version);
        put_string(buf, &self.transactional_id, flexible)?;
        buf.put_i64(self.producer_id);
        buf.put_i16(self.producer_epoch);
        put_array(buf, &self.topics, flexible, |buf, topic| {
            put_string(buf, &topic.name, flexible)?;
            put_i32_array(buf, &topic.partitions, flexible)?;
            put_tagged(buf, &topic.unknown_tagged_fields, flexible);
            Ok(())
        })?;
        put_tagged(buf, &self.unknown_tagged_fields, flexible);
        Ok(())
    }
}

impl Decodable for AddPartitionsToTxnRequest {
    fn decode(cursor: &mut Cursor<&[u8]>, version: i16) -> Result<Self> {
        let flexible = Self::is_flexible(version);
        Ok(Self {
            transactional_id: get_string(cursor, flexible)?,
            producer_id: get_i64(cursor)?,
            producer_epoch: get_i16(cursor)?,
            topics: get_array(cursor, flexible, |cursor| {
                Ok(AddPartitionsToTxnTopic {
                    name: get_string(cursor, flexible)?,
                    partitions: get_i32_array(cursor, flexible)?,
                    unknown_tagged_fields: get_tagged(cursor, flexible)?,
                })
            })?,
            unknown_tagged_fields: get_tagged(cursor, flexible)?,
        })
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct AddPartitionsToTxnPartitionResult {
    pub partition_index: i32,
    pub partition_error_code: i16,
    pub unknown_tagged_fields: TaggedFields,
}

#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct AddPartitionsToTxnTopicResult {
    pub name: String,
    pub results: Vec<AddPartitionsToTxnPartitionResult>,
    pub unknown_tagged_fields: TaggedFields,
}

#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct AddPartitionsToTxnResponse {
    pub throttle_time_ms: i32,
    pub results: Vec<AddPartitionsToTxnTopicResult>,
    pub unknown_tagged_fields: TaggedFields,
}

impl AddPartitionsToTxnResponse {
    /// `(topic, partition, error_code)` for every partition that failed.
    pub fn errors(&self) -> impl Iterator<Item = (&str, i32, i16)> {
        self.results.iter().flat_map(|topic| {
            topic
                .results
                .iter()
                .filter(|p| p.partition_error_code != 0)
                .map(move |p| (topic.name.as_str(), p.partition_index, p.partition_error_code))
        })
    }
}

impl Encodable for AddPartitionsToTxnResponse {
    fn encode(&self, buf: &mut BytesMut, version: i16) -> Result<()> {
        let flexible = AddPartitionsToTxnRequest::is_flexible(version);
        buf.put_i32(self.throttle_time_ms);
        put_array(buf, &self.results, flexible, |buf, topic| {
            put_string(buf, &topic.name, flexible)?;
            put_array(buf, &topic.results, flexible, |buf, partition| {
                buf.put_i32(partition.partition_index);
                buf.put_i16(partition.partition_error_code);
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

impl Decodable for AddPartitionsToTxnResponse {
    fn decode(cursor: &mut Cursor<&[u8]>, version: i16) -> Result<Self> {
        let flexible = AddPartitionsToTxnRequest::is_flexible(version);
        Ok(Self {
            throttle_time_ms: get_i32(cursor)?,
            results: get_array(cursor, flexible, |cursor| {
                Ok(AddPartitionsToTxnTopicResult {
                    name: get_string(cursor, flexible)?,
                    results: get_array(cursor, flexible, |cursor| {
                        Ok(AddPartitionsToTxnPartitionResult {
                            partition_index: get_i32(cursor)?,
                            partition_error_code: get_i16(cursor)?,
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

#[cfg(test)]
mod tests {
    use super::super::test_util::roundtrip;
    use super::*;

    #[test]
    fn test_roundtrip_all_versions() {
        let request = AddPartitionsToTxnRequest {
            transactional_id: "txn".to_string(),
            producer_id: 9,
            producer_epoch: 1,
            topics: vec![AddPartitionsToTxnTopic {
                name: "orders".to_string(),
                partitions: vec![0, 3],
                unknown_tagged_fields: TaggedFields::new(),
            }],
            unknown_tagged_fields: TaggedFields::new(),
        };
        let response = AddPartitionsToTxnResponse {
            throttle_time_ms: 0,
            results: vec![AddPartitionsToTxnTopicResult {
                name: "orders".to_string(),
                results: vec![
                    AddPartitionsToTxnPartitionResult {
                        partition_index: 0,
                        partition_error_code: 0,
                        ..Default::default()
                    },
                    AddPartitionsToTxnPartitionResult {
                        partition_index: 3,
                        partition_error_code: 51,
                        ..Default::default()
                    },
                ],
                unknown_tagged_fields: TaggedFields::new(),
            }],
            unknown_tagged_fields: TaggedFields::new(),
        };
        for version in 0..=3 {
            assert_eq!(roundtrip(&request, version), request);
            assert_eq!(roundtrip(&response, version), response);
        }
        assert_eq!(response.errors().collect::<Vec<_>>(), vec![("orders", 3, 51)]);
    }
}
