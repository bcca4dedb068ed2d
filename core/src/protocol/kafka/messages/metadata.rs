use bytes::{BufMut, BytesMut};
use std::io::Cursor;
use uuid::Uuid;

use super::{get_array, get_nullable_array, get_tagged, put_array, put_tagged};
use crate::protocol::kafka::codec::{
    get_bool, get_i16, get_i32, get_i32_array, get_nullable_string, get_string, get_uuid,
    put_array_len, put_bool, put_i32_array, put_nullable_string, put_string, put_uuid, CodecError,
    Result,
};
use crate::protocol::kafka::tagged_fields::TaggedFields;
use crate::protocol::kafka::{ApiRequest, Decodable, Encodable, VersionRange, API_KEY_METADATA};

/// Sentinel for "authorized operations not requested".
pub const AUTHORIZED_OPERATIONS_OMITTED: i32 = i32::MIN;

#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct MetadataRequestTopic {
    /// v10+; nil when addressing by name.
    pub topic_id: Uuid,
    /// Nullable from v10 when addressing by id.
    pub name: Option<String>,
    pub unknown_tagged_fields: TaggedFields,
}

impl MetadataRequestTopic {
    pub fn named(name: impl Into<String>) -> Self {
        Self {
            name: Some(name.into()),
            ..Default::default()
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MetadataRequest {
    /// `None` requests every topic. v0 has no null array; an empty one means
    /// "all topics" there instead.
    pub topics: Option<Vec<MetadataRequestTopic>>,
    pub allow_auto_topic_creation: bool,
    pub include_cluster_authorized_operations: bool,
    pub include_topic_authorized_operations: bool,
    pub unknown_tagged_fields: TaggedFields,
}

impl Default for MetadataRequest {
    fn default() -> Self {
        Self {
            topics: Some(Vec::new()),
            allow_auto_topic_creation: true,
            include_cluster_authorized_operations: false,
            include_topic_authorized_operations: false,
            unknown_tagged_fields: TaggedFields::new(),
        }
    }
}

impl MetadataRequest {
    pub fn for_topics<I, S>(names: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            topics: Some(names.into_iter().map(MetadataRequestTopic::named).collect()),
            ..Default::default()
        }
    }

    pub fn all_topics() -> Self {
        Self {
            topics: None,
            ..Default::default()
        }
    }
}

impl ApiRequest for MetadataRequest {
    const API_KEY: i16 = API_KEY_METADATA;
    const NAME: &'static str = "Metadata";
    const VERSIONS: VersionRange = VersionRange::new(0, 12);
    const FLEXIBLE_VERSIONS: VersionRange = VersionRange::open(9);
    type Response = MetadataResponse;
}

impl Encodable for MetadataRequest {
    fn encode(&self, buf: &mut BytesMut, version: i16) -> Result<()> {
        let flexible = Self::is_flexible(version);
        match &self.topics {
            None if version == 0 => put_array_len(buf, Some(0), false)?,
            None => put_array_len(buf, None, flexible)?,
            Some(topics) => put_array(buf, topics, flexible, |buf, topic| {
                if version >= 10 {
                    put_uuid(buf, &topic.topic_id);
                    put_nullable_string(buf, topic.name.as_deref(), flexible)?;
                } else {
                    let name = topic.name.as_deref().ok_or_else(|| {
                        CodecError::malformed(format!(
                            "Metadata v{} requires topic names",
                            version
                        ))
                    })?;
                    put_string(buf, name, flexible)?;
                }
                put_tagged(buf, &topic.unknown_tagged_fields, flexible);
                Ok(())
            })?,
        }
        if version >= 4 {
            put_bool(buf, self.allow_auto_topic_creation);
        }
        if (8..=10).contains(&version) {
            put_bool(buf, self.include_cluster_authorized_operations);
        }
        if version >= 8 {
            put_bool(buf, self.include_topic_authorized_operations);
        }
        put_tagged(buf, &self.unknown_tagged_fields, flexible);
        Ok(())
    }
}

impl Decodable for MetadataRequest {
    fn decode(cursor: &mut Cursor<&[u8]>, version: i16) -> Result<Self> {
        let flexible = Self::is_flexible(version);
        let topics = get_nullable_array(cursor, flexible, |cursor| {
            let (topic_id, name) = if version >= 10 {
                (get_uuid(cursor)?, get_nullable_string(cursor, flexible)?)
            } else {
                (Uuid::nil(), Some(get_string(cursor, flexible)?))
            };
            Ok(MetadataRequestTopic {
                topic_id,
                name,
                unknown_tagged_fields: get_tagged(cursor, flexible)?,
            })
        })?;
        let topics = match topics {
            Some(t) if version == 0 && t.is_empty() => None,
            other => other,
        };
        Ok(Self {
            topics,
            allow_auto_topic_creation: version < 4 || get_bool(cursor)?,
            include_cluster_authorized_operations: (8..=10).contains(&version)
                && get_bool(cursor)?,
            include_topic_authorized_operations: version >= 8 && get_bool(cursor)?,
            unknown_tagged_fields: get_tagged(cursor, flexible)?,
        })
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct MetadataResponseBroker {
    pub node_id: i32,
    pub host: String,
    pub port: i32,
    pub rack: Option<String>,
    pub unknown_tagged_fields: TaggedFields,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MetadataResponsePartition {
    pub error_code: i16,
    pub partition_index: i32,
    pub leader_id: i32,
    pub leader_epoch: i32,
    pub replica_nodes: Vec<i32>,
    pub isr_nodes: Vec<i32>,
    pub offline_replicas: Vec<i32>,
    pub unknown_tagged_fields: TaggedFields,
}

impl Default for MetadataResponsePartition {
    fn default() -> Self {
        Self {
            error_code: 0,
            partition_index: 0,
            leader_id: -1,
            leader_epoch: -1,
            replica_nodes: Vec::new(),
            isr_nodes: Vec::new(),
            offline_replicas: Vec::new(),
            unknown_tagged_fields: TaggedFields::new(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MetadataResponseTopic {
    pub error_code: i16,
    /// Null only in v12+ responses to id-addressed requests.
    pub name: Option<String>,
    pub topic_id: Uuid,
    pub is_internal: bool,
    pub partitions: Vec<MetadataResponsePartition>,
    pub topic_authorized_operations: i32,
    pub unknown_tagged_fields: TaggedFields,
}

impl Default for MetadataResponseTopic {
    fn default() -> Self {
        Self {
            error_code: 0,
            name: None,
            topic_id: Uuid::nil(),
            is_internal: false,
            partitions: Vec::new(),
            topic_authorized_operations: AUTHORIZED_OPERATIONS_OMITTED,
            unknown_tagged_fields: TaggedFields::new(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MetadataResponse {
    pub throttle_time_ms: i32,
    pub brokers: Vec<MetadataResponseBroker>,
    pub cluster_id: Option<String>,
    pub controller_id: i32,
    pub topics: Vec<MetadataResponseTopic>,
    pub cluster_authorized_operations: i32,
    pub unknown_tagged_fields: TaggedFields,
}

impl Default for MetadataResponse {
    fn default() -> Self {
        Self {
            throttle_time_ms: 0,
            brokers: Vec::new(),
            cluster_id: None,
            controller_id: -1,
            topics: Vec::new(),
            cluster_authorized_operations: AUTHORIZED_OPERATIONS_OMITTED,
            unknown_tagged_fields: TaggedFields::new(),
        }
    }
}

impl MetadataResponse {
    pub fn broker(&self, node_id: i32) -> Option<&MetadataResponseBroker> {
        self.brokers.iter().find(|b| b.node_id == node_id)
    }

    pub fn topic(&self, name: &str) -> Option<&MetadataResponseTopic> {
        self.topics.iter().find(|t| t.name.as_deref() == Some(name))
    }
}

impl Encodable for MetadataResponse {
    fn encode(&self, buf: &mut BytesMut, version: i16) -> Result<()> {
        let flexible = MetadataRequest::is_flexible(version);
        if version >= 3 {
            buf.put_i32(self.throttle_time_ms);
        }
        put_array(buf, &self.brokers, flexible, |buf, broker| {
            buf.put_i32(broker.node_id);
            put_string(buf, &broker.host, flexible)?;
            buf.put_i32(broker.port);
            if version >= 1 {
                put_nullable_string(buf, broker.rack.as_deref(), flexible)?;
            }
            put_tagged(buf, &broker.unknown_tagged_fields, flexible);
            Ok(())
        })?;
        if version >= 2 {
            put_nullable_string(buf, self.cluster_id.as_deref(), flexible)?;
        }
        if version >= 1 {
            buf.put_i32(self.controller_id);
        }
        put_array(buf, &self.topics, flexible, |buf, topic| {
            buf.put_i16(topic.error_code);
            if version >= 12 {
                put_nullable_string(buf, topic.name.as_deref(), flexible)?;
            } else {
                put_string(buf, topic.name.as_deref().unwrap_or_default(), flexible)?;
            }
            if version >= 10 {
                put_uuid(buf, &topic.topic_id);
            }
            if version >= 1 {
                put_bool(buf, topic.is_internal);
            }
            put_array(buf, &topic.partitions, flexible, |buf, partition| {
                buf.put_i16(partition.error_code);
                buf.put_i32(partition.partition_index);
                buf.put_i32(partition.leader_id);
                if version >= 7 {
                    buf.put_i32(partition.leader_epoch);
                }
                put_i32_array(buf, &partition.replica_nodes, flexible)?;
                put_i32_array(buf, &partition.isr_nodes, flexible)?;
                if version >= 5 {
                    put_i32_array(buf, &partition.offline_replicas, flexible)?;
                }
                put_tagged(buf, &partition.unknown_tagged_fields, flexible);
                Ok(())
            })?;
            if version >= 8 {
                buf.put_i32(topic.topic_authorized_operations);
            }
            put_tagged(buf, &topic.unknown_tagged_fields, flexible);
            Ok(())
        })?;
        if (8..=10).contains(&version) {
            buf.put_i32(self.cluster_authorized_operations);
        }
        put_tagged(buf, &self.unknown_tagged_fields, flexible);
        Ok(())
    }
}

impl Decodable for MetadataResponse {
    fn decode(cursor: &mut Cursor<&[u8]>, version: i16) -> Result<Self> {
        let flexible = MetadataRequest::is_flexible(version);
        let mut response = MetadataResponse::default();
        if version >= 3 {
            response.throttle_time_ms = get_i32(cursor)?;
        }
        response.brokers = get_array(cursor, flexible, |cursor| {
            Ok(MetadataResponseBroker {
                node_id: get_i32(cursor)?,
                host: get_string(cursor, flexible)?,
                port: get_i32(cursor)?,
                rack: if version >= 1 {
                    get_nullable_string(cursor, flexible)?
                } else {
                    None
                },
                unknown_tagged_fields: get_tagged(cursor, flexible)?,
            })
        })?;
        if version >= 2 {
            response.cluster_id = get_nullable_string(cursor, flexible)?;
        }
        if version >= 1 {
            response.controller_id = get_i32(cursor)?;
        }
        response.topics = get_array(cursor, flexible, |cursor| {
            let mut topic = MetadataResponseTopic {
                error_code: get_i16(cursor)?,
                ..Default::default()
            };
            topic.name = if version >= 12 {
                get_nullable_string(cursor, flexible)?
            } else {
                Some(get_string(cursor, flexible)?)
            };
            if version >= 10 {
                topic.topic_id = get_uuid(cursor)?;
            }
            if version >= 1 {
                topic.is_internal = get_bool(cursor)?;
            }
            topic.partitions = get_array(cursor, flexible, |cursor| {
                let mut partition = MetadataResponsePartition {
                    error_code: get_i16(cursor)?,
                    partition_index: get_i32(cursor)?,
                    leader_id: get_i32(cursor)?,
                    ..Default::default()
                };
                if version >= 7 {
                    partition.leader_epoch = get_i32(cursor)?;
                }
                partition.replica_nodes = get_i32_array(cursor, flexible)?;
                partition.isr_nodes = get_i32_array(cursor, flexible)?;
                if version >= 5 {
                    partition.offline_replicas = get_i32_array(cursor, flexible)?;
                }
                partition.unknown_tagged_fields = get_tagged(cursor, flexible)?;
                Ok(partition)
            })?;
            if version >= 8 {
                topic.topic_authorized_operations = get_i32(cursor)?;
            }
            topic.unknown_tagged_fields = get_tagged(cursor, flexible)?;
            Ok(topic)
        })?;
        if (8..=10).contains(&version) {
            response.cluster_authorized_operations = get_i32(cursor)?;
        }
        response.unknown_tagged_fields = get_tagged(cursor, flexible)?;
        Ok(response)
    }
}
