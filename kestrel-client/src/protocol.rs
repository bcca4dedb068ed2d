//! Record and addressing types shared by the write pipeline

use bytes::Bytes;
use kestrel::records::{NO_PRODUCER_EPOCH, NO_PRODUCER_ID};
use kestrel::RecordHeader;
use std::cmp::Ordering;
use std::fmt;
use std::hash::{Hash, Hasher};
use std::time::{SystemTime, UNIX_EPOCH};
use uuid::Uuid;

use crate::error::ClientError;
use crate::Result;

pub type NodeId = i32;

/// A topic, known by name and optionally by id.
///
/// Equality, ordering and hashing use the name only, so a topic learned from
/// metadata (with id) and one typed by a caller (without) are the same key.
#[derive(Debug, Clone)]
pub struct Topic {
    pub topic_id: Uuid,
    pub name: String,
}

impl Topic {
    pub fn new<S: Into<String>>(name: S) -> Self {
        Self {
            topic_id: Uuid::nil(),
            name: name.into(),
        }
    }

    pub fn with_id<S: Into<String>>(topic_id: Uuid, name: S) -> Self {
        Self {
            topic_id,
            name: name.into(),
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }
}

impl PartialEq for Topic {
    fn eq(&self, other: &Self) -> bool {
        self.name == other.name
    }
}

impl Eq for Topic {}

impl Hash for Topic {
    fn hash<H: Hasher>(&self, state: &mut H) {
        self.name.hash(state);
    }
}

impl PartialOrd for Topic {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for Topic {
    fn cmp(&self, other: &Self) -> Ordering {
        self.name.cmp(&other.name)
    }
}

impl fmt::Display for Topic {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.name)
    }
}

impl From<&str> for Topic {
    fn from(name: &str) -> Self {
        Topic::new(name)
    }
}

impl From<String> for Topic {
    fn from(name: String) -> Self {
        Topic::new(name)
    }
}

/// Topic partition identifier, ordered by topic then partition
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct TopicPartition {
    pub topic: Topic,
    pub partition: i32,
}

impl TopicPartition {
    pub fn new<T: Into<Topic>>(topic: T, partition: i32) -> Self {
        Self {
            topic: topic.into(),
            partition,
        }
    }
}

impl fmt::Display for TopicPartition {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}-{}", self.topic, self.partition)
    }
}

/// One record addressed to a partition
#[derive(Debug, Clone, PartialEq)]
pub struct ProduceRecord {
    pub topic_partition: TopicPartition,
    /// Create time in milliseconds since the epoch
    pub timestamp_ms: i64,
    pub key: Option<Bytes>,
    pub value: Option<Bytes>,
    pub headers: Vec<RecordHeader>,
}

impl ProduceRecord {
    pub fn builder() -> ProduceRecordBuilder {
        ProduceRecordBuilder::new()
    }

    /// A record stamped with the current wall-clock time
    pub fn new<V: Into<Bytes>>(topic_partition: TopicPartition, value: V) -> Self {
        Self {
            topic_partition,
            timestamp_ms: now_ms(),
            key: None,
            value: Some(value.into()),
            headers: Vec::new(),
        }
    }

    pub fn with_key<K: Into<Bytes>>(mut self, key: K) -> Self {
        self.key = Some(key.into());
        self
    }

    pub fn with_header<K: Into<String>, V: Into<Bytes>>(mut self, key: K, value: V) -> Self {
        self.headers.push(RecordHeader::new(key, Some(value.into())));
        self
    }

    pub fn with_timestamp(mut self, timestamp_ms: i64) -> Self {
        self.timestamp_ms = timestamp_ms;
        self
    }
}

/// Builder for ProduceRecord
#[derive(Debug, Default)]
pub struct ProduceRecordBuilder {
    topic: Option<Topic>,
    partition: Option<i32>,
    key: Option<Bytes>,
    value: Option<Bytes>,
    headers: Vec<RecordHeader>,
    timestamp_ms: Option<i64>,
}

impl ProduceRecordBuilder {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn topic<T: Into<Topic>>(mut self, topic: T) -> Self {
        self.topic = Some(topic.into());
        self
    }

    pub fn partition(mut self, partition: i32) -> Self {
        self.partition = Some(partition);
        self
    }

    pub fn key<K: Into<Bytes>>(mut self, key: K) -> Self {
        self.key = Some(key.into());
        self
    }

    pub fn value<V: Into<Bytes>>(mut self, value: V) -> Self {
        self.value = Some(value.into());
        self
    }

    pub fn header<K: Into<String>>(mut self, key: K, value: Option<Bytes>) -> Self {
        self.headers.push(RecordHeader::new(key, value));
        self
    }

    pub fn timestamp(mut self, timestamp_ms: i64) -> Self {
        self.timestamp_ms = Some(timestamp_ms);
        self
    }

    /// Fails when topic or partition is missing or the partition is negative.
    pub fn build(self) -> Result<ProduceRecord> {
        let topic = self
            .topic
            .ok_or_else(|| ClientError::config("Record topic is required"))?;
        let partition = match self.partition {
            Some(p) if p >= 0 => p,
            Some(p) => return Err(ClientError::partition_not_found(topic.name, p)),
            None => return Err(ClientError::config("Record partition is required")),
        };
        Ok(ProduceRecord {
            topic_partition: TopicPartition { topic, partition },
            timestamp_ms: self.timestamp_ms.unwrap_or_else(now_ms),
            key: self.key,
            value: self.value,
            headers: self.headers,
        })
    }
}

/// Where an acknowledged record landed
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProduceResult {
    pub topic_partition: TopicPartition,
    /// Assigned offset, -1 when the broker was not asked to acknowledge
    pub offset: i64,
    pub timestamp_ms: i64,
}

/// Producer id and epoch handed out by InitProducerId
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ProducerIdentity {
    pub producer_id: i64,
    pub producer_epoch: i16,
}

impl ProducerIdentity {
    pub const NONE: ProducerIdentity = ProducerIdentity {
        producer_id: NO_PRODUCER_ID,
        producer_epoch: NO_PRODUCER_EPOCH,
    };

    pub fn is_assigned(&self) -> bool {
        self.producer_id >= 0
    }
}

impl Default for ProducerIdentity {
    fn default() -> Self {
        Self::NONE
    }
}

pub(crate) fn now_ms() -> i64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis() as i64)
        .unwrap_or(0)
}
