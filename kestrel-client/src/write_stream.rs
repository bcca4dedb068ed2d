//! Write stream orchestrator
//!
//! [`WriteStream`] is the producer entry point. It initializes the producer
//! identity on first use, resolves each record's leader through the metadata
//! cache, keeps one [`WriteChannel`] per leader broker and drives the
//! transaction protocol (coordinator lookup, partition registration, EndTxn).
//!
//! Each partition is routed to exactly one channel at a time. When its
//! leader moves, the partition's unsent batches travel to the new leader's
//! channel in order, ahead of anything written after the move.
//!
//! InitProducerId, AddPartitionsToTxn and EndTxn are not idempotent, so they
//! are sent once. Only a coordinator that answers that it moved or is still
//! loading gets the request again.

use async_trait::async_trait;
use dashmap::DashMap;
use kestrel::{
    AddPartitionsToTxnRequest, AddPartitionsToTxnTopic, EndTxnRequest, FindCoordinatorRequest,
    InitProducerIdRequest,
};
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Weak};
use tokio::sync::{
    oneshot, Mutex, OnceCell, OwnedSemaphorePermit, RwLock, RwLockReadGuard, RwLockWriteGuard,
};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, trace, warn};

use crate::batch::{ProduceCommand, ProduceRecords};
use crate::channel::{ChannelContext, LeaderRouter, SequenceTable, WriteChannel};
use crate::config::WriteStreamConfig;
use crate::connection::{Cluster, ClusterConnections, NodeLink};
use crate::error::ClientError;
use crate::metadata::{MetadataCache, ProducerTopicMetadata};
use crate::metrics::ClientMetrics;
use crate::partitioner::{DefaultPartitioner, Partitioner, Writer};
use crate::pending::PendingRecords;
use crate::protocol::{NodeId, ProduceRecord, ProduceResult, ProducerIdentity, TopicPartition};
use crate::retry::RetryPolicy;
use crate::Result;

struct Shared {
    this: Weak<Shared>,
    config: Arc<WriteStreamConfig>,
    cluster: Arc<dyn Cluster>,
    metadata: MetadataCache,
    metrics: Arc<ClientMetrics>,
    retry: RetryPolicy,
    identity: OnceCell<ProducerIdentity>,
    coordinator: Mutex<Option<NodeId>>,
    /// Writers hold it shared from partition registration until their record
    /// is queued; begin and end hold it exclusively.
    txn_gate: RwLock<()>,
    txn_active: AtomicBool,
    /// Partitions of the open transaction. A cell is set once the
    /// coordinator accepted its partition.
    members: DashMap<TopicPartition, Arc<OnceCell<()>>>,
    /// Channel each partition's records go to
    routes: parking_lot::Mutex<HashMap<TopicPartition, NodeId>>,
    channels: DashMap<NodeId, Arc<WriteChannel>>,
    sequences: Arc<SequenceTable>,
    pending: Arc<PendingRecords>,
    closed: CancellationToken,
}

/// Asynchronous producer writing records to partition leaders.
///
/// Cloning is cheap; all clones share one session.
#[derive(Clone)]
pub struct WriteStream {
    shared: Arc<Shared>,
}

impl WriteStream {
    /// Validates `config` and creates a write stream over an existing
    /// connection directory.
    pub fn new(cluster: Arc<dyn Cluster>, config: WriteStreamConfig) -> Result<Self> {
        Self::with_metrics(cluster, config, Arc::new(ClientMetrics::default()))
    }

    /// Like [`WriteStream::new`], reporting into `metrics`.
    pub fn with_metrics(
        cluster: Arc<dyn Cluster>,
        config: WriteStreamConfig,
        metrics: Arc<ClientMetrics>,
    ) -> Result<Self> {
        let config = config.validate()?;
        info!(
            "Write stream configured: bootstrap={:?} acks={} linger={:?} batch_size={} \
             idempotence={} transactional_id={:?}",
            config.bootstrap_servers,
            config.acks,
            config.linger,
            config.batch_size,
            config.enable_idempotence,
            config.transactional_id
        );
        let config = Arc::new(config);
        let retry = RetryPolicy::from_config(&config);
        let shared = Arc::new_cyclic(|this| Shared {
            this: this.clone(),
            metadata: MetadataCache::new(cluster.clone(), config.metadata_max_age, retry),
            config,
            cluster,
            metrics,
            retry,
            identity: OnceCell::new(),
            coordinator: Mutex::new(None),
            txn_gate: RwLock::new(()),
            txn_active: AtomicBool::new(false),
            members: DashMap::new(),
            routes: parking_lot::Mutex::new(HashMap::new()),
            channels: DashMap::new(),
            sequences: Arc::new(SequenceTable::default()),
            pending: PendingRecords::new(),
            closed: CancellationToken::new(),
        });
        Ok(Self { shared })
    }

    /// Validates `config` and connects to the bootstrap servers over TCP.
    pub async fn connect(config: WriteStreamConfig, cancel: &CancellationToken) -> Result<Self> {
        let config = config.validate()?;
        let metrics = Arc::new(ClientMetrics::default());
        let cluster = Arc::new(ClusterConnections::new(&config, metrics.clone()));
        cluster.controller(cancel).await?;
        Self::with_metrics(cluster, config, metrics)
    }

    pub fn config(&self) -> &WriteStreamConfig {
        &self.shared.config
    }

    pub fn metrics(&self) -> &Arc<ClientMetrics> {
        &self.shared.metrics
    }

    /// Writes one record and waits for the broker's acknowledgement.
    ///
    /// Waits for room when the leader's channel already holds
    /// `buffer_records` unfinished records. Inside an open transaction the
    /// record's partition is registered with the coordinator before the
    /// record is queued.
    pub async fn write(
        &self,
        record: ProduceRecord,
        cancel: &CancellationToken,
    ) -> Result<ProduceResult> {
        self.shared.write(record, cancel).await
    }

    /// Starts a transaction. Everything written before is flushed first.
    pub async fn begin_transaction(&self, cancel: &CancellationToken) -> Result<Transaction> {
        self.shared.begin_transaction(cancel).await?;
        Ok(Transaction {
            stream: self.clone(),
            completed: false,
        })
    }

    /// Sends every collected record and waits for all in-flight sends.
    pub async fn flush(&self, cancel: &CancellationToken) -> Result<()> {
        self.shared.flush_channels(cancel).await
    }

    /// Closes every channel and the broker connections. Records still
    /// waiting for queue capacity fail with [`ClientError::Closed`].
    pub async fn close(&self, cancel: &CancellationToken) -> Result<()> {
        self.shared.close(cancel).await
    }

    /// Current metadata for `topic`, loading it if needed.
    pub async fn metadata_for_topic(
        &self,
        topic: &str,
        cancel: &CancellationToken,
    ) -> Result<Arc<ProducerTopicMetadata>> {
        self.shared.metadata.get(topic, cancel).await
    }

    /// A writer for `topic` using the default partitioner.
    pub fn writer<S: Into<String>>(&self, topic: S) -> Writer {
        self.writer_with(topic, Arc::new(DefaultPartitioner::new()))
    }

    pub fn writer_with<S: Into<String>>(
        &self,
        topic: S,
        partitioner: Arc<dyn Partitioner>,
    ) -> Writer {
        Writer::new(self.clone(), topic.into(), partitioner)
    }
}

/// An open transaction.
///
/// Finish it with [`Transaction::commit`] or [`Transaction::abort`]; the
/// session stays transactional until one of them is called.
pub struct Transaction {
    stream: WriteStream,
    completed: bool,
}

impl Transaction {
    pub async fn commit(mut self, cancel: &CancellationToken) -> Result<()> {
        self.completed = true;
        self.stream.shared.end_transaction(true, cancel).await
    }

    pub async fn abort(mut self, cancel: &CancellationToken) -> Result<()> {
        self.completed = true;
        self.stream.shared.end_transaction(false, cancel).await
    }
}

impl Drop for Transaction {
    fn drop(&mut self) {
        if !self.completed {
            warn!(
                "Transaction {:?} dropped without commit or abort",
                self.stream.shared.config.transactional_id
            );
        }
    }
}

impl Shared {
    async fn write(&self, record: ProduceRecord, cancel: &CancellationToken) -> Result<ProduceResult> {
        if self.closed.is_cancelled() {
            return Err(ClientError::Closed);
        }
        let identity = self.ensure_producer(cancel).await?;

        let completion = if self.config.is_transactional() {
            let _gate = self.read_gate(cancel).await?;
            let transactional = self.txn_active.load(Ordering::Acquire);
            if transactional {
                self.join_transaction(&record.topic_partition, identity, cancel)
                    .await?;
            }
            self.enqueue(record, transactional, cancel).await?
        } else {
            self.enqueue(record, false, cancel).await?
        };

        tokio::select! {
            biased;
            _ = cancel.cancelled() => Err(ClientError::Cancelled),
            result = completion => result.map_err(|_| ClientError::Closed)?,
        }
    }

    /// Queues `record` on the channel its partition is routed to.
    async fn enqueue(
        &self,
        record: ProduceRecord,
        transactional: bool,
        cancel: &CancellationToken,
    ) -> Result<oneshot::Receiver<Result<ProduceResult>>> {
        let topic_partition = record.topic_partition.clone();
        let (mut command, completion) = ProduceCommand::new(record, transactional);
        loop {
            let routed = self.routes.lock().get(&topic_partition).copied();
            let node_id = match routed {
                Some(node_id) => node_id,
                None => self.leader_for(&topic_partition, cancel, false).await?,
            };
            let channel = self.channel(node_id)?;
            let permit = channel.reserve(cancel).await?;
            match self.try_submit(&channel, command, permit) {
                None => return Ok(completion),
                Some(returned) => {
                    trace!(
                        "Route of {} changed while waiting for node {}",
                        topic_partition, node_id
                    );
                    command = returned;
                }
            }
        }
    }

    /// Submits under the route table lock so that a partition move cannot
    /// interleave. Hands the command back when the partition is routed to
    /// another channel by now.
    fn try_submit(
        &self,
        channel: &WriteChannel,
        mut command: ProduceCommand,
        permit: OwnedSemaphorePermit,
    ) -> Option<ProduceCommand> {
        let mut routes = self.routes.lock();
        let owner = *routes
            .entry(command.record.topic_partition.clone())
            .or_insert(channel.node_id());
        if owner != channel.node_id() {
            return Some(command);
        }
        command.admit(permit, self.pending.register());
        channel.submit(command);
        None
    }

    async fn read_gate(&self, cancel: &CancellationToken) -> Result<RwLockReadGuard<'_, ()>> {
        tokio::select! {
            biased;
            _ = cancel.cancelled() => Err(ClientError::Cancelled),
            guard = self.txn_gate.read() => Ok(guard),
        }
    }

    async fn write_gate(&self, cancel: &CancellationToken) -> Result<RwLockWriteGuard<'_, ()>> {
        tokio::select! {
            biased;
            _ = cancel.cancelled() => Err(ClientError::Cancelled),
            guard = self.txn_gate.write() => Ok(guard),
        }
    }

    fn transactional_id(&self) -> Result<&str> {
        self.config
            .transactional_id
            .as_deref()
            .ok_or_else(|| ClientError::config("No transactional.id configured"))
    }

    /// Producer identity, fetched once. Concurrent first writers share the
    /// request; a failed attempt leaves the next caller to try again.
    async fn ensure_producer(&self, cancel: &CancellationToken) -> Result<ProducerIdentity> {
        if !self.config.enable_idempotence {
            return Ok(ProducerIdentity::NONE);
        }
        self.identity
            .get_or_try_init(|| self.init_producer(cancel))
            .await
            .copied()
    }

    async fn init_producer(&self, cancel: &CancellationToken) -> Result<ProducerIdentity> {
        let identity = self
            .retry
            .run_if(cancel, ClientError::is_coordinator_busy, || async move {
                let link = match self.config.transactional_id {
                    Some(_) => self.coordinator_link(cancel).await?,
                    None => self.cluster.controller(cancel).await?,
                };
                let request = InitProducerIdRequest {
                    transactional_id: self.config.transactional_id.clone(),
                    transaction_timeout_ms: self.config.transaction_timeout_ms(),
                    ..Default::default()
                };
                let response = link.init_producer_id(request, cancel).await?;
                self.check_coordinator_error(response.error_code).await?;
                Ok(ProducerIdentity {
                    producer_id: response.producer_id,
                    producer_epoch: response.producer_epoch,
                })
            })
            .await?;
        info!(
            "Producer instance initialized: producer_id={} epoch={}",
            identity.producer_id, identity.producer_epoch
        );
        Ok(identity)
    }

    /// Link to the transaction coordinator, looked up once and cached until
    /// a request reports that it moved.
    async fn coordinator_link(&self, cancel: &CancellationToken) -> Result<Arc<dyn NodeLink>> {
        let mut coordinator = tokio::select! {
            biased;
            _ = cancel.cancelled() => return Err(ClientError::Cancelled),
            guard = self.coordinator.lock() => guard,
        };
        if let Some(node_id) = *coordinator {
            return self.cluster.connection(node_id, cancel).await;
        }

        let transactional_id = self.transactional_id()?;
        let node_id = self
            .retry
            .run(cancel, || async move {
                let controller = self.cluster.controller(cancel).await?;
                let response = controller
                    .find_coordinator(FindCoordinatorRequest::transaction(transactional_id), cancel)
                    .await?;
                let found = response
                    .coordinator_for(transactional_id)
                    .ok_or_else(|| ClientError::api(15, None))?;
                if let Some(e) = ClientError::from_code(found.error_code) {
                    return Err(e);
                }
                Ok(found.node_id)
            })
            .await?;
        info!(
            "Transaction coordinator found for {}: node {}",
            transactional_id, node_id
        );
        *coordinator = Some(node_id);
        drop(coordinator);
        self.cluster.connection(node_id, cancel).await
    }

    /// Turns a coordinator response code into an error, forgetting the
    /// cached coordinator when it moved.
    async fn check_coordinator_error(&self, code: i16) -> Result<()> {
        match ClientError::from_code(code) {
            None => Ok(()),
            Some(e) => {
                if e.requires_coordinator_refresh() {
                    debug!("Transaction coordinator moved: {}", e);
                    *self.coordinator.lock().await = None;
                }
                Err(e)
            }
        }
    }

    /// Makes `topic_partition` part of the open transaction. Writers to the
    /// same partition share one registration; a refused partition stays out
    /// and the next writer tries again.
    async fn join_transaction(
        &self,
        topic_partition: &TopicPartition,
        identity: ProducerIdentity,
        cancel: &CancellationToken,
    ) -> Result<()> {
        let member = self
            .members
            .entry(topic_partition.clone())
            .or_default()
            .clone();
        member
            .get_or_try_init(|| self.register_partition(topic_partition, identity, cancel))
            .await?;
        Ok(())
    }

    async fn register_partition(
        &self,
        topic_partition: &TopicPartition,
        identity: ProducerIdentity,
        cancel: &CancellationToken,
    ) -> Result<()> {
        let transactional_id = self.transactional_id()?;
        self.retry
            .run_if(cancel, ClientError::is_coordinator_busy, || async move {
                let link = self.coordinator_link(cancel).await?;
                let request = AddPartitionsToTxnRequest {
                    transactional_id: transactional_id.to_string(),
                    producer_id: identity.producer_id,
                    producer_epoch: identity.producer_epoch,
                    topics: vec![AddPartitionsToTxnTopic {
                        name: topic_partition.topic.name.clone(),
                        partitions: vec![topic_partition.partition],
                        ..Default::default()
                    }],
                    ..Default::default()
                };
                let response = link.add_partitions_to_txn(request, cancel).await?;
                let code = response.errors().next().map(|(_, _, code)| code).unwrap_or(0);
                self.check_coordinator_error(code).await
            })
            .await?;
        debug!(
            "Added partition {} to transaction {}",
            topic_partition, transactional_id
        );
        Ok(())
    }

    async fn begin_transaction(&self, cancel: &CancellationToken) -> Result<()> {
        let transactional_id = self.transactional_id()?;
        if self.closed.is_cancelled() {
            return Err(ClientError::Closed);
        }
        self.ensure_producer(cancel).await?;

        let _gate = self.write_gate(cancel).await?;
        if self.txn_active.load(Ordering::Acquire) {
            return Err(ClientError::config(format!(
                "Transaction {} is already in progress",
                transactional_id
            )));
        }
        self.flush_channels(cancel).await?;
        self.txn_active.store(true, Ordering::Release);
        debug!("Transaction {} begun", transactional_id);
        Ok(())
    }

    /// Flushes, then commits or aborts. Membership and the active flag are
    /// cleared whatever the outcome.
    async fn end_transaction(&self, committed: bool, cancel: &CancellationToken) -> Result<()> {
        let transactional_id = self.transactional_id()?;
        let gate = self.write_gate(cancel).await?;
        if !self.txn_active.load(Ordering::Acquire) {
            return Err(ClientError::config(format!(
                "No transaction in progress for {}",
                transactional_id
            )));
        }

        let result = self.finish_transaction(committed, cancel).await;
        self.members.clear();
        self.txn_active.store(false, Ordering::Release);
        drop(gate);
        self.metrics.record_transaction_end(committed, result.is_ok());

        let outcome = if committed { "committed" } else { "aborted" };
        match &result {
            Ok(()) => debug!("Transaction {} {}", transactional_id, outcome),
            Err(e) => warn!(
                "Transaction {} could not be {}: {}",
                transactional_id, outcome, e
            ),
        }
        result
    }

    async fn finish_transaction(&self, committed: bool, cancel: &CancellationToken) -> Result<()> {
        let transactional_id = self.transactional_id()?;
        self.flush_channels(cancel).await?;
        // The coordinator only knows transactions that registered a partition.
        if !self.has_members() {
            return Ok(());
        }
        let identity = self.ensure_producer(cancel).await?;
        self.retry
            .run_if(cancel, ClientError::is_coordinator_busy, || async move {
                let link = self.coordinator_link(cancel).await?;
                let request = EndTxnRequest {
                    transactional_id: transactional_id.to_string(),
                    producer_id: identity.producer_id,
                    producer_epoch: identity.producer_epoch,
                    committed,
                    ..Default::default()
                };
                let response = link.end_txn(request, cancel).await?;
                self.check_coordinator_error(response.error_code).await
            })
            .await
    }

    fn has_members(&self) -> bool {
        self.members
            .iter()
            .any(|member| member.value().initialized())
    }

    fn open_channels(&self) -> Vec<Arc<WriteChannel>> {
        self.channels
            .iter()
            .map(|entry| entry.value().clone())
            .collect()
    }

    /// Sends every open batch and waits until each record submitted so far
    /// has completed, including records that moved to another channel.
    async fn flush_channels(&self, cancel: &CancellationToken) -> Result<()> {
        let mark = self.seal_all();
        self.pending.wait_for(mark, cancel).await
    }

    /// Seals every open batch. Returns the mark of the first record that
    /// was not yet submitted.
    fn seal_all(&self) -> u64 {
        let _routes = self.routes.lock();
        for channel in self.open_channels() {
            channel.seal_open();
        }
        self.pending.mark()
    }

    async fn close(&self, cancel: &CancellationToken) -> Result<()> {
        if self.closed.is_cancelled() {
            return Ok(());
        }
        self.closed.cancel();
        info!(
            "Closing write stream with {} records in flight",
            self.pending.outstanding()
        );

        let channels = self.open_channels();
        self.channels.clear();
        let results =
            futures::future::join_all(channels.iter().map(|channel| channel.close(cancel))).await;
        if cancel.is_cancelled() {
            return Err(ClientError::Cancelled);
        }
        for (channel, result) in channels.iter().zip(results) {
            if let Err(e) = result {
                warn!("Write channel {} did not close cleanly: {}", channel.node_id(), e);
            }
        }
        self.cluster.shutdown().await;
        Ok(())
    }

    async fn leader_for(
        &self,
        topic_partition: &TopicPartition,
        cancel: &CancellationToken,
        refresh: bool,
    ) -> Result<NodeId> {
        let topic = topic_partition.topic.name();
        let metadata = if refresh {
            self.metadata.refresh(topic, cancel).await?
        } else {
            self.metadata.get(topic, cancel).await?
        };
        let partition = metadata
            .partition(topic_partition.partition)
            .ok_or_else(|| ClientError::partition_not_found(topic, topic_partition.partition))?;
        if !partition.has_leader() {
            return Err(ClientError::api(5, None));
        }
        Ok(partition.leader_id)
    }

    fn channel(&self, node_id: NodeId) -> Result<Arc<WriteChannel>> {
        if self.closed.is_cancelled() {
            return Err(ClientError::Closed);
        }
        Ok(self
            .channels
            .entry(node_id)
            .or_insert_with(|| Arc::new(WriteChannel::spawn(node_id, self.channel_context())))
            .clone())
    }

    /// Moves `batch`, then every later batch of its partition still on
    /// `from`, to the head of `target` and routes the partition there.
    /// Returns how many batches moved.
    fn move_partition(&self, batch: ProduceRecords, from: NodeId, target: &WriteChannel) -> usize {
        let source = self.channels.get(&from).map(|entry| entry.value().clone());
        let mut routes = self.routes.lock();
        let topic_partition = batch.topic_partition().clone();
        let mut moved = vec![batch];
        if let Some(source) = source {
            moved.extend(source.release(&topic_partition));
        }
        let count = moved.len();
        routes.insert(topic_partition, target.node_id());
        target.adopt(moved);
        count
    }

    fn channel_context(&self) -> ChannelContext {
        let router: Weak<dyn LeaderRouter> = self.this.clone();
        ChannelContext {
            config: self.config.clone(),
            cluster: self.cluster.clone(),
            metrics: self.metrics.clone(),
            sequences: self.sequences.clone(),
            identity: self.identity.get().copied().unwrap_or_default(),
            router,
        }
    }
}

#[async_trait]
impl LeaderRouter for Shared {
    async fn reroute(
        &self,
        batch: ProduceRecords,
        from: NodeId,
        cancel: &CancellationToken,
    ) -> Option<ProduceRecords> {
        let topic_partition = batch.topic_partition().clone();
        let leader = match self.leader_for(&topic_partition, cancel, true).await {
            Ok(leader) => leader,
            // Still electing, or the refresh itself hit a transient error.
            Err(e) if e.is_retryable() => return Some(batch),
            Err(e) => {
                warn!("Cannot reroute {}: {}", topic_partition, e);
                batch.fail(&e);
                return None;
            }
        };
        if leader == from {
            return Some(batch);
        }
        let target = match self.channel(leader) {
            Ok(target) => target,
            Err(_) => return Some(batch),
        };
        let moved = self.move_partition(batch, from, &target);
        debug!(
            "Leader of {} moved from node {} to node {}, moving {} batches",
            topic_partition, from, leader, moved
        );
        None
    }
}
