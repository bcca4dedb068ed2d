//! Partition selection
//!
//! [`DefaultPartitioner`] matches Kafka's default for keyed records
//! (`toPositive(murmur2(key)) % partitions`, using the `murmur2` crate with
//! `KAFKA_SEED`) and spreads keyless records round-robin.
//! [`Writer`] binds a write stream to one topic and picks the partition for
//! every record it writes.

use bytes::Bytes;
use kestrel::RecordHeader;
use murmur2::{murmur2, KAFKA_SEED};
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;
use tokio_util::sync::CancellationToken;

use crate::error::ClientError;
use crate::protocol::{now_ms, ProduceRecord, ProduceResult, TopicPartition};
use crate::write_stream::WriteStream;
use crate::Result;

/// Chooses the partition a record goes to.
pub trait Partitioner: Send + Sync {
    /// `partition_count` is always positive.
    fn partition(&self, topic: &str, key: Option<&[u8]>, partition_count: i32) -> i32;
}

#[derive(Debug, Default)]
pub struct DefaultPartitioner {
    counter: AtomicU32,
}

impl DefaultPartitioner {
    pub fn new() -> Self {
        Self::default()
    }
}

impl Partitioner for DefaultPartitioner {
    fn partition(&self, _topic: &str, key: Option<&[u8]>, partition_count: i32) -> i32 {
        match key {
            Some(key) => {
                let hash = murmur2(key, KAFKA_SEED);
                ((hash & 0x7fffffff) as i32) % partition_count
            }
            None => {
                let next = self.counter.fetch_add(1, Ordering::Relaxed);
                (next % partition_count as u32) as i32
            }
        }
    }
}

/// Writes to one topic, choosing partitions with a [`Partitioner`].
#[derive(Clone)]
pub struct Writer {
    stream: WriteStream,
    topic: String,
    partitioner: Arc<dyn Partitioner>,
}

impl Writer {
    pub(crate) fn new(stream: WriteStream, topic: String, partitioner: Arc<dyn Partitioner>) -> Self {
        Self {
            stream,
            topic,
            partitioner,
        }
    }

    pub fn topic(&self) -> &str {
        &self.topic
    }

    /// Writes a record stamped with the current time.
    pub async fn write(
        &self,
        key: Option<Bytes>,
        value: Option<Bytes>,
        cancel: &CancellationToken,
    ) -> Result<ProduceResult> {
        self.write_with(key, value, Vec::new(), None, cancel).await
    }

    /// Writes a record with headers; `timestamp_ms` defaults to now.
    pub async fn write_with(
        &self,
        key: Option<Bytes>,
        value: Option<Bytes>,
        headers: Vec<RecordHeader>,
        timestamp_ms: Option<i64>,
        cancel: &CancellationToken,
    ) -> Result<ProduceResult> {
        let metadata = self.stream.metadata_for_topic(&self.topic, cancel).await?;
        let partition_count = metadata.partition_count();
        if partition_count <= 0 {
            return Err(ClientError::topic_not_found(self.topic.clone()));
        }
        let partition = self
            .partitioner
            .partition(&self.topic, key.as_deref(), partition_count);

        let record = ProduceRecord {
            topic_partition: TopicPartition::new(metadata.topic.clone(), partition),
            timestamp_ms: timestamp_ms.unwrap_or_else(now_ms),
            key,
            value,
            headers,
        };
        self.stream.write(record, cancel).await
    }
}
