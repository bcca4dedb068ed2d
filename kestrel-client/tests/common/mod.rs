//! In-memory cluster used by the integration tests.
//!
//! Brokers keep a log per partition, decode every produce payload and answer
//! the way a real broker would: not-leader for partitions they do not lead,
//! duplicate-sequence for a resend of the last batch, plus whatever errors,
//! dropped connections and delays a test scripts up front.

#![allow(dead_code)]

use async_trait::async_trait;
use kestrel::{
    AddPartitionsToTxnPartitionResult, AddPartitionsToTxnRequest, AddPartitionsToTxnResponse,
    AddPartitionsToTxnTopicResult, EndTxnRequest, EndTxnResponse, FindCoordinatorRequest,
    FindCoordinatorResponse, InitProducerIdRequest, InitProducerIdResponse, MetadataRequest,
    MetadataResponse, MetadataResponseBroker, MetadataResponsePartition, MetadataResponseTopic,
    PartitionProduceResponse, ProduceRequest, ProduceResponse, RecordBatch, TopicProduceResponse,
};
use kestrel_client::{ClientError, Cluster, NodeId, NodeLink, Result, WriteStream, WriteStreamConfig};
use parking_lot::Mutex;
use std::collections::{HashMap, HashSet, VecDeque};
use std::io::Cursor;
use std::sync::{Arc, Weak};
use std::time::Duration;
use tokio_util::sync::CancellationToken;

pub const BROKERS: [NodeId; 3] = [1, 2, 3];
pub const COORDINATOR: NodeId = 1;
pub const PRODUCER_ID: i64 = 4000;

pub fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .with_test_writer()
        .try_init();
}

/// One partition batch as a broker received it
#[derive(Debug, Clone)]
pub struct ReceivedBatch {
    pub node_id: NodeId,
    pub topic: String,
    pub partition: i32,
    pub transactional_id: Option<String>,
    pub batch: RecordBatch,
}

#[derive(Debug, Default)]
struct PartitionLog {
    next_offset: i64,
    last_sequence: Option<(i32, i64)>,
}

#[derive(Default)]
pub struct ClusterState {
    /// Leader per partition index
    topics: HashMap<String, Vec<NodeId>>,
    logs: HashMap<(String, i32), PartitionLog>,
    /// Error codes returned (without appending) for the next produces
    produce_errors: HashMap<(String, i32), VecDeque<i16>>,
    /// Partitions whose next produce is appended but answered with a timeout
    lost_acks: HashSet<(String, i32)>,
    pub received: Vec<ReceivedBatch>,
    pub produce_requests: usize,
    pub metadata_requests: usize,
    pub init_producer_calls: usize,
    pub find_coordinator_calls: usize,
    pub added_partitions: Vec<(String, i32)>,
    /// Error code for the next registration of a partition
    add_partition_errors: HashMap<(String, i32), i16>,
    /// Every EndTxn received, including ones whose answer was lost
    pub end_txns: Vec<bool>,
    end_txn_errors: VecDeque<i16>,
    /// Connection failures for the next EndTxn and InitProducerId calls
    end_txn_resets: usize,
    init_resets: usize,
    pub init_delay: Duration,
    pub produce_delay: Duration,
    /// Overrides `produce_delay` for one broker
    node_delays: HashMap<NodeId, Duration>,
}

/// A scripted cluster shared by every link it hands out.
pub struct FakeCluster {
    this: Weak<FakeCluster>,
    state: Mutex<ClusterState>,
}

impl FakeCluster {
    pub fn new() -> Arc<Self> {
        Arc::new_cyclic(|this| FakeCluster {
            this: this.clone(),
            state: Mutex::new(ClusterState::default()),
        })
    }

    pub fn with_topic(self: Arc<Self>, topic: &str, leaders: &[NodeId]) -> Arc<Self> {
        self.set_leaders(topic, leaders);
        self
    }

    pub fn set_leaders(&self, topic: &str, leaders: &[NodeId]) {
        self.state
            .lock()
            .topics
            .insert(topic.to_string(), leaders.to_vec());
    }

    pub fn fail_produce(&self, topic: &str, partition: i32, codes: &[i16]) {
        self.state
            .lock()
            .produce_errors
            .entry((topic.to_string(), partition))
            .or_default()
            .extend(codes.iter().copied());
    }

    pub fn lose_next_ack(&self, topic: &str, partition: i32) {
        self.state
            .lock()
            .lost_acks
            .insert((topic.to_string(), partition));
    }

    pub fn fail_end_txn(&self, code: i16) {
        self.state.lock().end_txn_errors.push_back(code);
    }

    /// The next EndTxn reaches the coordinator, then the connection drops.
    pub fn reset_next_end_txn(&self) {
        self.state.lock().end_txn_resets += 1;
    }

    /// The next InitProducerId reaches the coordinator, then the connection
    /// drops.
    pub fn reset_next_init(&self) {
        self.state.lock().init_resets += 1;
    }

    pub fn fail_add_partition(&self, topic: &str, partition: i32, code: i16) {
        self.state
            .lock()
            .add_partition_errors
            .insert((topic.to_string(), partition), code);
    }

    pub fn set_produce_delay(&self, delay: Duration) {
        self.state.lock().produce_delay = delay;
    }

    pub fn set_node_delay(&self, node_id: NodeId, delay: Duration) {
        self.state.lock().node_delays.insert(node_id, delay);
    }

    pub fn set_init_delay(&self, delay: Duration) {
        self.state.lock().init_delay = delay;
    }

    pub fn state(&self) -> parking_lot::MutexGuard<'_, ClusterState> {
        self.state.lock()
    }

    /// Batches received for one partition, in arrival order
    pub fn batches_for(&self, topic: &str, partition: i32) -> Vec<ReceivedBatch> {
        self.state
            .lock()
            .received
            .iter()
            .filter(|b| b.topic == topic && b.partition == partition)
            .cloned()
            .collect()
    }

    fn link(&self, node_id: NodeId) -> Arc<dyn NodeLink> {
        Arc::new(FakeLink {
            node_id,
            cluster: self.this.clone(),
        })
    }

    fn metadata_response(&self, request: &MetadataRequest) -> MetadataResponse {
        let mut state = self.state.lock();
        state.metadata_requests += 1;
        let names: Vec<String> = request
            .topics
            .iter()
            .flatten()
            .filter_map(|t| t.name.clone())
            .collect();
        let topics = names
            .into_iter()
            .map(|name| match state.topics.get(&name) {
                Some(leaders) => MetadataResponseTopic {
                    name: Some(name.clone()),
                    partitions: leaders
                        .iter()
                        .enumerate()
                        .map(|(index, leader)| MetadataResponsePartition {
                            partition_index: index as i32,
                            leader_id: *leader,
                            leader_epoch: 0,
                            ..Default::default()
                        })
                        .collect(),
                    ..Default::default()
                },
                None => MetadataResponseTopic {
                    error_code: 3,
                    name: Some(name),
                    ..Default::default()
                },
            })
            .collect();
        MetadataResponse {
            brokers: BROKERS
                .iter()
                .map(|id| MetadataResponseBroker {
                    node_id: *id,
                    host: format!("broker-{}", id),
                    port: 9092,
                    ..Default::default()
                })
                .collect(),
            controller_id: COORDINATOR,
            topics,
            ..Default::default()
        }
    }

    fn produce_response(&self, node_id: NodeId, request: &ProduceRequest) -> Result<ProduceResponse> {
        let mut guard = self.state.lock();
        let state = &mut *guard;
        state.produce_requests += 1;
        let mut responses = Vec::new();

        for topic in &request.topic_data {
            let mut partition_responses = Vec::new();
            for data in &topic.partition_data {
                let key = (topic.name.clone(), data.index);
                let payload = data
                    .records
                    .clone()
                    .ok_or_else(|| ClientError::corruption("produce without records"))?;
                let batch = RecordBatch::decode(&mut Cursor::new(payload.as_ref()))?;
                state.received.push(ReceivedBatch {
                    node_id,
                    topic: topic.name.clone(),
                    partition: data.index,
                    transactional_id: request.transactional_id.clone(),
                    batch: batch.clone(),
                });

                let leader = state
                    .topics
                    .get(&topic.name)
                    .and_then(|leaders| leaders.get(data.index as usize))
                    .copied();
                let scripted = state
                    .produce_errors
                    .get_mut(&key)
                    .and_then(|codes| codes.pop_front());

                let mut response = PartitionProduceResponse {
                    index: data.index,
                    ..Default::default()
                };
                if leader != Some(node_id) {
                    response.error_code = 6;
                } else if let Some(code) = scripted {
                    response.error_code = code;
                } else {
                    let sequence = batch.header.base_sequence;
                    let log = state.logs.entry(key.clone()).or_default();
                    match log.last_sequence {
                        Some((last, offset)) if sequence >= 0 && last == sequence => {
                            response.error_code = 46;
                            response.base_offset = offset;
                        }
                        _ => {
                            response.base_offset = log.next_offset;
                            log.last_sequence = Some((sequence, log.next_offset));
                            log.next_offset += batch.records.len() as i64;
                            if state.lost_acks.remove(&key) {
                                response.error_code = 7;
                                response.base_offset = -1;
                            }
                        }
                    }
                }
                partition_responses.push(response);
            }
            responses.push(TopicProduceResponse {
                name: topic.name.clone(),
                partition_responses,
                ..Default::default()
            });
        }

        Ok(ProduceResponse {
            responses,
            ..Default::default()
        })
    }
}

#[async_trait]
impl Cluster for FakeCluster {
    async fn connection(
        &self,
        node_id: NodeId,
        cancel: &CancellationToken,
    ) -> Result<Arc<dyn NodeLink>> {
        if cancel.is_cancelled() {
            return Err(ClientError::Cancelled);
        }
        if !BROKERS.contains(&node_id) {
            return Err(ClientError::transport(format!("Unknown broker node {}", node_id)));
        }
        Ok(self.link(node_id))
    }

    async fn controller(&self, cancel: &CancellationToken) -> Result<Arc<dyn NodeLink>> {
        if cancel.is_cancelled() {
            return Err(ClientError::Cancelled);
        }
        Ok(self.link(COORDINATOR))
    }
}

struct FakeLink {
    node_id: NodeId,
    cluster: Weak<FakeCluster>,
}

impl FakeLink {
    fn cluster(&self) -> Result<Arc<FakeCluster>> {
        self.cluster
            .upgrade()
            .ok_or_else(|| ClientError::transport("cluster is gone"))
    }
}

#[async_trait]
impl NodeLink for FakeLink {
    fn node_id(&self) -> NodeId {
        self.node_id
    }

    async fn metadata(
        &self,
        request: MetadataRequest,
        _cancel: &CancellationToken,
    ) -> Result<MetadataResponse> {
        Ok(self.cluster()?.metadata_response(&request))
    }

    async fn find_coordinator(
        &self,
        _request: FindCoordinatorRequest,
        _cancel: &CancellationToken,
    ) -> Result<FindCoordinatorResponse> {
        let cluster = self.cluster()?;
        cluster.state().find_coordinator_calls += 1;
        Ok(FindCoordinatorResponse {
            node_id: COORDINATOR,
            host: format!("broker-{}", COORDINATOR),
            port: 9092,
            ..Default::default()
        })
    }

    async fn init_producer_id(
        &self,
        _request: InitProducerIdRequest,
        _cancel: &CancellationToken,
    ) -> Result<InitProducerIdResponse> {
        let cluster = self.cluster()?;
        let (delay, reset) = {
            let mut state = cluster.state();
            state.init_producer_calls += 1;
            let reset = state.init_resets > 0;
            if reset {
                state.init_resets -= 1;
            }
            (state.init_delay, reset)
        };
        tokio::time::sleep(delay).await;
        if reset {
            return Err(ClientError::transport("connection reset by peer"));
        }
        Ok(InitProducerIdResponse {
            throttle_time_ms: 0,
            error_code: 0,
            producer_id: PRODUCER_ID,
            producer_epoch: 0,
            unknown_tagged_fields: Default::default(),
        })
    }

    async fn add_partitions_to_txn(
        &self,
        request: AddPartitionsToTxnRequest,
        _cancel: &CancellationToken,
    ) -> Result<AddPartitionsToTxnResponse> {
        let cluster = self.cluster()?;
        let mut state = cluster.state();
        let mut results = Vec::new();
        for topic in &request.topics {
            let mut partitions = Vec::new();
            for partition in &topic.partitions {
                let key = (topic.name.clone(), *partition);
                let code = state.add_partition_errors.remove(&key).unwrap_or(0);
                if code == 0 {
                    state.added_partitions.push(key);
                }
                partitions.push(AddPartitionsToTxnPartitionResult {
                    partition_index: *partition,
                    partition_error_code: code,
                    ..Default::default()
                });
            }
            results.push(AddPartitionsToTxnTopicResult {
                name: topic.name.clone(),
                results: partitions,
                ..Default::default()
            });
        }
        Ok(AddPartitionsToTxnResponse {
            results,
            ..Default::default()
        })
    }

    async fn end_txn(
        &self,
        request: EndTxnRequest,
        _cancel: &CancellationToken,
    ) -> Result<EndTxnResponse> {
        let cluster = self.cluster()?;
        let mut state = cluster.state();
        state.end_txns.push(request.committed);
        if state.end_txn_resets > 0 {
            state.end_txn_resets -= 1;
            return Err(ClientError::transport("connection reset by peer"));
        }
        Ok(EndTxnResponse {
            error_code: state.end_txn_errors.pop_front().unwrap_or(0),
            ..Default::default()
        })
    }

    async fn produce(
        &self,
        request: ProduceRequest,
        cancel: &CancellationToken,
    ) -> Result<Option<ProduceResponse>> {
        let cluster = self.cluster()?;
        let delay = {
            let state = cluster.state();
            state
                .node_delays
                .get(&self.node_id)
                .copied()
                .unwrap_or(state.produce_delay)
        };
        if !delay.is_zero() {
            tokio::select! {
                biased;
                _ = cancel.cancelled() => return Err(ClientError::Cancelled),
                _ = tokio::time::sleep(delay) => {}
            }
        }
        let response = cluster.produce_response(self.node_id, &request)?;
        Ok((request.acks != 0).then_some(response))
    }
}

/// Config tuned for fast tests: short linger and backoff
pub fn test_config() -> kestrel_client::WriteStreamConfigBuilder {
    WriteStreamConfig::builder()
        .bootstrap_servers(["broker-1:9092"])
        .linger(Duration::from_millis(5))
        .retry_backoff(Duration::from_millis(1))
}

pub fn stream(cluster: &Arc<FakeCluster>, config: WriteStreamConfig) -> WriteStream {
    WriteStream::new(cluster.clone(), config).unwrap()
}
