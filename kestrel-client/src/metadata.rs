//! Topic metadata cache
//!
//! Partition-to-leader maps per topic, loaded from the controller on first
//! use and replaced wholesale once older than the configured age. Concurrent
//! misses share one refresh.

use dashmap::DashMap;
use kestrel::{ErrorCode, MetadataRequest, MetadataResponse};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::Mutex;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use crate::connection::Cluster;
use crate::error::ClientError;
use crate::protocol::{NodeId, Topic};
use crate::retry::RetryPolicy;
use crate::Result;

/// Leader of one partition
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PartitionMetadata {
    pub partition: i32,
    /// -1 while the partition has no leader
    pub leader_id: NodeId,
    pub leader_epoch: i32,
    pub leader_host: String,
    pub leader_port: i32,
}

impl PartitionMetadata {
    pub fn has_leader(&self) -> bool {
        self.leader_id >= 0
    }
}

/// Snapshot of one topic's partitions. Never mutated after creation.
#[derive(Debug, Clone)]
pub struct ProducerTopicMetadata {
    pub topic: Topic,
    /// Ordered by partition index
    pub partitions: Vec<PartitionMetadata>,
    pub expires_at: Instant,
}

impl ProducerTopicMetadata {
    pub fn partition_count(&self) -> i32 {
        self.partitions.len() as i32
    }

    pub fn partition(&self, partition: i32) -> Option<&PartitionMetadata> {
        self.partitions
            .binary_search_by_key(&partition, |p| p.partition)
            .ok()
            .map(|i| &self.partitions[i])
    }

    pub fn is_expired(&self, now: Instant) -> bool {
        now >= self.expires_at
    }

    /// Builds the snapshot for `topic` from a metadata response.
    pub fn from_response(topic: &str, response: &MetadataResponse, ttl: Duration) -> Result<Self> {
        let entry = response
            .topic(topic)
            .ok_or_else(|| ClientError::topic_not_found(topic))?;
        match ErrorCode::from(entry.error_code) {
            ErrorCode::NoError => {}
            ErrorCode::UnknownTopicOrPartition | ErrorCode::UnknownTopicId => {
                return Err(ClientError::topic_not_found(topic))
            }
            _ => return Err(ClientError::api(entry.error_code, None)),
        }

        let mut partitions: Vec<PartitionMetadata> = entry
            .partitions
            .iter()
            .map(|p| {
                let leader = response.broker(p.leader_id);
                PartitionMetadata {
                    partition: p.partition_index,
                    leader_id: if leader.is_some() { p.leader_id } else { -1 },
                    leader_epoch: p.leader_epoch,
                    leader_host: leader.map(|b| b.host.clone()).unwrap_or_default(),
                    leader_port: leader.map(|b| b.port).unwrap_or(-1),
                }
            })
            .collect();
        partitions.sort_by_key(|p| p.partition);

        Ok(Self {
            topic: Topic::with_id(entry.topic_id, topic),
            partitions,
            expires_at: Instant::now() + ttl,
        })
    }
}

/// Cache of [`ProducerTopicMetadata`] keyed by topic name
pub struct MetadataCache {
    cluster: Arc<dyn Cluster>,
    ttl: Duration,
    retry: RetryPolicy,
    topics: DashMap<String, Arc<ProducerTopicMetadata>>,
    refresh: Mutex<()>,
}

impl MetadataCache {
    pub fn new(cluster: Arc<dyn Cluster>, ttl: Duration, retry: RetryPolicy) -> Self {
        Self {
            cluster,
            ttl,
            retry,
            topics: DashMap::new(),
            refresh: Mutex::new(()),
        }
    }

    fn fresh(&self, topic: &str) -> Option<Arc<ProducerTopicMetadata>> {
        let entry = self.topics.get(topic)?;
        if entry.is_expired(Instant::now()) {
            None
        } else {
            Some(entry.clone())
        }
    }

    /// Cached metadata for `topic`, loading it when missing or expired.
    pub async fn get(
        &self,
        topic: &str,
        cancel: &CancellationToken,
    ) -> Result<Arc<ProducerTopicMetadata>> {
        if let Some(metadata) = self.fresh(topic) {
            return Ok(metadata);
        }

        let _guard = tokio::select! {
            biased;
            _ = cancel.cancelled() => return Err(ClientError::Cancelled),
            guard = self.refresh.lock() => guard,
        };
        // Another caller may have loaded it while we waited.
        if let Some(metadata) = self.fresh(topic) {
            return Ok(metadata);
        }
        self.topics.remove(topic);

        let metadata = Arc::new(self.load(topic, cancel).await?);
        self.topics.insert(topic.to_string(), metadata.clone());
        Ok(metadata)
    }

    /// Drops the cached entry and loads a new one.
    pub async fn refresh(
        &self,
        topic: &str,
        cancel: &CancellationToken,
    ) -> Result<Arc<ProducerTopicMetadata>> {
        self.invalidate(topic);
        self.get(topic, cancel).await
    }

    pub fn invalidate(&self, topic: &str) {
        self.topics.remove(topic);
    }

    async fn load(&self, topic: &str, cancel: &CancellationToken) -> Result<ProducerTopicMetadata> {
        self.retry
            .run(cancel, || async move {
                let controller = self.cluster.controller(cancel).await?;
                let mut request = MetadataRequest::for_topics([topic]);
                request.allow_auto_topic_creation = false;
                let response = controller.metadata(request, cancel).await?;
                let metadata = ProducerTopicMetadata::from_response(topic, &response, self.ttl)?;
                if metadata.partitions.iter().any(|p| !p.has_leader()) {
                    warn!("Topic {} has partitions without a leader", topic);
                }
                debug!(
                    "Loaded metadata for {}: {} partitions",
                    topic,
                    metadata.partition_count()
                );
                Ok(metadata)
            })
            .await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use kestrel::{MetadataResponseBroker, MetadataResponsePartition, MetadataResponseTopic};

    fn response(topic_error: i16) -> MetadataResponse {
        MetadataResponse {
            brokers: vec![
                MetadataResponseBroker {
                    node_id: 1,
                    host: "b1".to_string(),
                    port: 9092,
                    ..Default::default()
                },
                MetadataResponseBroker {
                    node_id: 2,
                    host: "b2".to_string(),
                    port: 9093,
                    ..Default::default()
                },
            ],
            topics: vec![MetadataResponseTopic {
                error_code: topic_error,
                name: Some("orders".to_string()),
                partitions: [(2, 2), (0, 1), (1, 7)]
                    .into_iter()
                    .map(|(index, leader)| MetadataResponsePartition {
                        partition_index: index,
                        leader_id: leader,
                        ..Default::default()
                    })
                    .collect(),
                ..Default::default()
            }],
            ..Default::default()
        }
    }

    #[test]
    fn test_from_response_orders_partitions() {
        let metadata =
            ProducerTopicMetadata::from_response("orders", &response(0), Duration::from_secs(10))
                .unwrap();
        assert_eq!(metadata.partition_count(), 3);
        let leaders: Vec<(i32, NodeId)> = metadata
            .partitions
            .iter()
            .map(|p| (p.partition, p.leader_id))
            .collect();
        // node 7 is not in the broker list
        assert_eq!(leaders, vec![(0, 1), (1, -1), (2, 2)]);
        assert_eq!(metadata.partition(2).unwrap().leader_host, "b2");
        assert_eq!(metadata.partition(2).unwrap().leader_port, 9093);
        assert!(metadata.partition(3).is_none());
        assert!(!metadata.is_expired(Instant::now()));
    }

    #[test]
    fn test_from_response_errors() {
        let ttl = Duration::from_secs(10);
        assert!(matches!(
            ProducerTopicMetadata::from_response("orders", &response(3), ttl),
            Err(ClientError::TopicNotFound { .. })
        ));
        assert!(matches!(
            ProducerTopicMetadata::from_response("payments", &response(0), ttl),
            Err(ClientError::TopicNotFound { .. })
        ));
        assert!(matches!(
            ProducerTopicMetadata::from_response("orders", &response(29), ttl),
            Err(ClientError::Api { code: 29, .. })
        ));
    }

    #[test]
    fn test_expiry() {
        let metadata =
            ProducerTopicMetadata::from_response("orders", &response(0), Duration::ZERO).unwrap();
        assert!(metadata.is_expired(Instant::now()));
    }
}
