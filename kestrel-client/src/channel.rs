//! Per-broker write channel
//!
//! Every leader broker gets one [`WriteChannel`]. Submitting a record packs
//! it into its partition's open batch right away, sealing the batch on size,
//! record count or a transaction flag change. Two tasks do the rest:
//!
//! - the **collector** seals batches whose linger expired;
//! - the **dispatcher** sends sealed batches with a single produce request
//!   in flight, completes the waiting writers and hands batches whose leader
//!   moved back to the [`LeaderRouter`].
//!
//! Each channel admits at most `buffer_records` records at a time; a writer
//! waits in [`WriteChannel::reserve`] until one completes.
//!
//! Batches of one partition leave the dispatcher in the order they were
//! sealed. A request carries at most one batch per partition, and a batch
//! that is retried in place goes back to the head of the queue.

use async_trait::async_trait;
use dashmap::DashMap;
use kestrel::records::NO_SEQUENCE;
use kestrel::{ErrorCode, PartitionProduceData, ProduceRequest, ProduceResponse, TopicProduceData};
use parking_lot::Mutex;
use std::collections::{HashMap, HashSet, VecDeque};
use std::sync::{Arc, Weak};
use std::time::Duration;
use tokio::sync::{Notify, OwnedSemaphorePermit, Semaphore};
use tokio::task::JoinHandle;
use tokio::time::{sleep_until, Instant};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, trace, warn};

use crate::batch::{increment_sequence, AddRecordResult, ProduceCommand, ProduceRecords};
use crate::config::WriteStreamConfig;
use crate::connection::Cluster;
use crate::error::ClientError;
use crate::metrics::{ClientMetrics, Timer};
use crate::protocol::{NodeId, ProducerIdentity, TopicPartition};
use crate::retry::RetryPolicy;
use crate::Result;

/// Routes a batch whose leader may have moved.
#[async_trait]
pub(crate) trait LeaderRouter: Send + Sync {
    /// Refreshes the partition's metadata and moves the batch, followed by
    /// every later batch of its partition still on `from`, to the head of
    /// the current leader's channel. Gives the batch back when the leader
    /// is still `from` (or unknown) so the caller can retry it in place.
    async fn reroute(
        &self,
        batch: ProduceRecords,
        from: NodeId,
        cancel: &CancellationToken,
    ) -> Option<ProduceRecords>;
}

/// Next base sequence per partition for the idempotent producer.
#[derive(Debug, Default)]
pub(crate) struct SequenceTable {
    next: DashMap<TopicPartition, i32>,
}

impl SequenceTable {
    /// Reserves `count` sequences for `topic_partition`, returning the first.
    pub fn reserve(&self, topic_partition: &TopicPartition, count: i32) -> i32 {
        let mut next = self.next.entry(topic_partition.clone()).or_insert(0);
        let base = *next;
        *next = increment_sequence(base, count);
        base
    }
}

/// Everything a channel's tasks share with the write stream.
#[derive(Clone)]
pub(crate) struct ChannelContext {
    pub config: Arc<WriteStreamConfig>,
    pub cluster: Arc<dyn Cluster>,
    pub metrics: Arc<ClientMetrics>,
    pub sequences: Arc<SequenceTable>,
    pub identity: ProducerIdentity,
    pub router: Weak<dyn LeaderRouter>,
}

impl ChannelContext {
    fn retry(&self) -> RetryPolicy {
        RetryPolicy::from_config(&self.config)
    }
}

/// Why a batch was sealed
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum BatchCollectReason {
    Size,
    Count,
    Linger,
    Flush,
    Transaction,
    LeaderMoved,
    Close,
}

/// Open batches and the send queue of one channel
struct ChannelState {
    node_id: NodeId,
    config: Arc<WriteStreamConfig>,
    identity: ProducerIdentity,
    open: HashMap<TopicPartition, ProduceRecords>,
    /// Sealed batches in send order
    queue: VecDeque<ProduceRecords>,
    /// No more records are collected
    closing: bool,
    /// The dispatcher is gone; batches arriving now fail
    drained: bool,
}

impl ChannelState {
    fn collect(&mut self, command: ProduceCommand) {
        if self.closing {
            command.complete(Err(ClientError::Closed));
            return;
        }
        if command.is_abandoned() {
            trace!(
                "Write channel {} - skipping abandoned record for {}",
                self.node_id,
                command.record.topic_partition
            );
            return;
        }

        let topic_partition = command.record.topic_partition.clone();
        let flag_changed = self
            .open
            .get(&topic_partition)
            .map(|batch| batch.is_transactional() != command.transactional)
            .unwrap_or(false);
        if flag_changed {
            self.seal(&topic_partition, BatchCollectReason::Transaction);
        }

        let node_id = self.node_id;
        let max_size = self.config.batch_size;
        let batch = self.open_batch(&topic_partition, &command);
        let command = match batch.try_add(command, max_size) {
            AddRecordResult::Added(_) => None,
            AddRecordResult::Full { command, required } => {
                trace!(
                    "Write channel {} - {} is full ({} + {} > {} bytes)",
                    node_id,
                    topic_partition,
                    batch.encoded_size(),
                    required,
                    max_size
                );
                Some(command)
            }
        };
        if let Some(command) = command {
            self.seal(&topic_partition, BatchCollectReason::Size);
            let batch = self.open_batch(&topic_partition, &command);
            // An empty batch takes any record.
            let _ = batch.try_add(command, max_size);
        }

        if let Some(batch) = self.open.get(&topic_partition) {
            if batch.len() >= self.config.batch_max_records {
                self.seal(&topic_partition, BatchCollectReason::Count);
            } else if batch.encoded_size() >= max_size {
                self.seal(&topic_partition, BatchCollectReason::Size);
            }
        }
    }

    fn open_batch(
        &mut self,
        topic_partition: &TopicPartition,
        command: &ProduceCommand,
    ) -> &mut ProduceRecords {
        let identity = self.identity;
        self.open
            .entry(topic_partition.clone())
            .or_insert_with(|| {
                ProduceRecords::new(
                    topic_partition.clone(),
                    command.transactional,
                    command.record.timestamp_ms,
                    identity,
                )
            })
    }

    fn next_deadline(&self) -> Option<Instant> {
        self.open
            .values()
            .map(|batch| batch.created_at())
            .min()
            .map(|created| Instant::from_std(created + self.config.linger))
    }

    /// Returns true when something was sealed.
    fn seal_expired(&mut self) -> bool {
        let now = std::time::Instant::now();
        let linger = self.config.linger;
        let expired: Vec<TopicPartition> = self
            .open
            .iter()
            .filter(|(_, batch)| batch.created_at() + linger <= now)
            .map(|(tp, _)| tp.clone())
            .collect();
        for topic_partition in &expired {
            self.seal(topic_partition, BatchCollectReason::Linger);
        }
        !expired.is_empty()
    }

    fn seal_all(&mut self, reason: BatchCollectReason) {
        let mut open: Vec<ProduceRecords> = self.open.drain().map(|(_, batch)| batch).collect();
        open.sort_by_key(|batch| batch.created_at());
        for batch in open {
            self.enqueue(batch, reason);
        }
    }

    fn seal(&mut self, topic_partition: &TopicPartition, reason: BatchCollectReason) {
        if let Some(batch) = self.open.remove(topic_partition) {
            self.enqueue(batch, reason);
        }
    }

    fn enqueue(&mut self, batch: ProduceRecords, reason: BatchCollectReason) {
        trace!(
            "Write channel {} - collected batch for {}: {} records, {} bytes ({:?})",
            self.node_id,
            batch.topic_partition(),
            batch.len(),
            batch.encoded_size(),
            reason
        );
        if self.drained {
            batch.fail(&ClientError::Closed);
        } else {
            self.queue.push_back(batch);
        }
    }

    /// Takes the oldest queued batch of each partition.
    fn next_request(&mut self) -> Vec<ProduceRecords> {
        let mut taken = Vec::new();
        let mut partitions = HashSet::new();
        let mut rest = VecDeque::with_capacity(self.queue.len());

        for batch in self.queue.drain(..) {
            if partitions.insert(batch.topic_partition().clone()) {
                taken.push(batch);
            } else {
                rest.push_back(batch);
            }
        }
        self.queue = rest;
        taken
    }

    /// Removes every batch of `topic_partition`, queued ones first, then
    /// the open one, keeping their order.
    fn release(&mut self, topic_partition: &TopicPartition) -> Vec<ProduceRecords> {
        let mut released = Vec::new();
        let mut rest = VecDeque::with_capacity(self.queue.len());
        for batch in self.queue.drain(..) {
            if batch.topic_partition() == topic_partition {
                released.push(batch);
            } else {
                rest.push_back(batch);
            }
        }
        self.queue = rest;
        if let Some(batch) = self.open.remove(topic_partition) {
            trace!(
                "Write channel {} - sealed batch for {}: {} records ({:?})",
                self.node_id,
                topic_partition,
                batch.len(),
                BatchCollectReason::LeaderMoved
            );
            released.push(batch);
        }
        released
    }

    /// Puts `batches` ahead of everything queued, in the given order.
    fn push_front(&mut self, batches: Vec<ProduceRecords>) {
        for batch in batches.into_iter().rev() {
            if self.drained {
                batch.fail(&ClientError::Closed);
            } else {
                self.queue.push_front(batch);
            }
        }
    }

    /// Marks the dispatcher gone and hands back whatever is left.
    fn drain(&mut self) -> Vec<ProduceRecords> {
        self.closing = true;
        self.drained = true;
        let mut left: Vec<ProduceRecords> = self.queue.drain(..).collect();
        left.extend(self.open.drain().map(|(_, batch)| batch));
        left
    }
}

/// State shared by a channel handle and its two tasks
struct ChannelShared {
    state: Mutex<ChannelState>,
    /// Wakes the dispatcher when a batch is queued
    sealed: Notify,
    /// Wakes the collector when a batch opens
    opened: Notify,
}

impl ChannelShared {
    /// The next request's batches. `None` once the channel is closing and
    /// nothing is left to send.
    fn take_request(&self) -> Option<Vec<ProduceRecords>> {
        let mut state = self.state.lock();
        let batches = state.next_request();
        if batches.is_empty() && state.closing {
            return None;
        }
        Some(batches)
    }
}

/// Write path to one broker
pub(crate) struct WriteChannel {
    node_id: NodeId,
    shared: Arc<ChannelShared>,
    /// One permit per record between submission and completion
    capacity: Arc<Semaphore>,
    closing: CancellationToken,
    abort: CancellationToken,
    tasks: Mutex<Vec<JoinHandle<()>>>,
}

impl WriteChannel {
    /// Starts the collector and dispatcher for `node_id`.
    pub fn spawn(node_id: NodeId, context: ChannelContext) -> Self {
        let abort = CancellationToken::new();
        let closing = abort.child_token();
        let capacity = Arc::new(Semaphore::new(context.config.buffer_records.max(1)));
        let shared = Arc::new(ChannelShared {
            state: Mutex::new(ChannelState {
                node_id,
                config: context.config.clone(),
                identity: context.identity,
                open: HashMap::new(),
                queue: VecDeque::new(),
                closing: false,
                drained: false,
            }),
            sealed: Notify::new(),
            opened: Notify::new(),
        });

        let collector = Collector {
            node_id,
            shared: shared.clone(),
            closing: closing.clone(),
        };
        let dispatcher = Dispatcher {
            node_id,
            shared: shared.clone(),
            retry: context.retry(),
            context,
            abort: abort.clone(),
        };

        let tasks = vec![
            tokio::spawn(collector.run()),
            tokio::spawn(dispatcher.run()),
        ];

        Self {
            node_id,
            shared,
            capacity,
            closing,
            abort,
            tasks: Mutex::new(tasks),
        }
    }

    pub fn node_id(&self) -> NodeId {
        self.node_id
    }

    /// Waits for room for one more record unless cancelled. The permit is
    /// given back when the record's writer is answered.
    pub async fn reserve(&self, cancel: &CancellationToken) -> Result<OwnedSemaphorePermit> {
        tokio::select! {
            biased;
            _ = cancel.cancelled() => Err(ClientError::Cancelled),
            permit = self.capacity.clone().acquire_owned() => {
                permit.map_err(|_| ClientError::Closed)
            }
        }
    }

    /// Adds a record to its partition's open batch.
    pub fn submit(&self, command: ProduceCommand) {
        let (opened, sealed) = {
            let mut state = self.shared.state.lock();
            let (open, queued) = (state.open.len(), state.queue.len());
            state.collect(command);
            (state.open.len() > open, state.queue.len() > queued)
        };
        if opened {
            self.shared.opened.notify_one();
        }
        if sealed {
            self.shared.sealed.notify_one();
        }
    }

    /// Seals every open batch without waiting for it to be sent.
    pub fn seal_open(&self) {
        self.shared.state.lock().seal_all(BatchCollectReason::Flush);
        self.shared.sealed.notify_one();
    }

    /// Takes every batch of `topic_partition` off this channel, in order.
    pub fn release(&self, topic_partition: &TopicPartition) -> Vec<ProduceRecords> {
        self.shared.state.lock().release(topic_partition)
    }

    /// Queues batches moved here from another channel ahead of anything
    /// collected locally.
    pub fn adopt(&self, batches: Vec<ProduceRecords>) {
        self.shared.state.lock().push_front(batches);
        self.shared.sealed.notify_one();
    }

    /// Stops accepting records, sends what was collected and waits for the
    /// dispatcher to drain. Cancelling aborts in-flight sends.
    pub async fn close(&self, cancel: &CancellationToken) -> Result<()> {
        self.closing.cancel();
        self.capacity.close();
        let tasks: Vec<JoinHandle<()>> = std::mem::take(&mut *self.tasks.lock());
        let joined = futures::future::join_all(tasks);
        tokio::select! {
            biased;
            _ = cancel.cancelled() => {
                self.abort.cancel();
                Err(ClientError::Cancelled)
            }
            _ = joined => Ok(()),
        }
    }
}

impl Drop for WriteChannel {
    fn drop(&mut self) {
        self.abort.cancel();
    }
}

/// Seals batches whose linger expired
struct Collector {
    node_id: NodeId,
    shared: Arc<ChannelShared>,
    closing: CancellationToken,
}

impl Collector {
    async fn run(self) {
        info!("Write channel {} - batch collector started", self.node_id);

        loop {
            let deadline = self.shared.state.lock().next_deadline();
            tokio::select! {
                biased;
                _ = self.closing.cancelled() => break,
                _ = sleep_until(deadline.unwrap_or_else(Instant::now)), if deadline.is_some() => {
                    if self.shared.state.lock().seal_expired() {
                        self.shared.sealed.notify_one();
                    }
                }
                _ = self.shared.opened.notified() => {}
            }
        }

        {
            let mut state = self.shared.state.lock();
            state.closing = true;
            state.seal_all(BatchCollectReason::Close);
        }
        self.shared.sealed.notify_one();

        info!("Write channel {} - batch collector stopped", self.node_id);
    }
}

/// What to do with a batch after a failed send
enum Recovery {
    InPlace(ProduceRecords),
    Reroute(ProduceRecords),
}

struct Dispatcher {
    node_id: NodeId,
    shared: Arc<ChannelShared>,
    context: ChannelContext,
    retry: RetryPolicy,
    abort: CancellationToken,
}

impl Dispatcher {
    async fn run(mut self) {
        info!("Write channel {} - batch dispatcher started", self.node_id);

        while let Some(batches) = self.shared.take_request() {
            if batches.is_empty() {
                tokio::select! {
                    biased;
                    _ = self.abort.cancelled() => break,
                    _ = self.shared.sealed.notified() => continue,
                }
            }
            trace!(
                "Write channel {} - dequeued {} batches",
                self.node_id,
                batches.len()
            );
            self.dispatch(batches).await;

            if self.abort.is_cancelled() {
                break;
            }
        }

        let left = self.shared.state.lock().drain();
        for batch in left {
            batch.fail(&ClientError::Closed);
        }

        info!("Write channel {} - batch dispatcher stopped", self.node_id);
    }

    async fn dispatch(&mut self, mut batches: Vec<ProduceRecords>) {
        let config = self.context.config.clone();
        let mut payloads = Vec::with_capacity(batches.len());
        let mut sendable = Vec::with_capacity(batches.len());

        for mut batch in batches.drain(..) {
            if config.enable_idempotence && batch.base_sequence() == NO_SEQUENCE {
                let base = self
                    .context
                    .sequences
                    .reserve(batch.topic_partition(), batch.len() as i32);
                batch.set_base_sequence(base);
            }
            match batch.encode() {
                Ok(bytes) => {
                    payloads.push(bytes);
                    sendable.push(batch);
                }
                Err(e) => {
                    warn!(
                        "Write channel {} - failed to encode batch for {}: {}",
                        self.node_id,
                        batch.topic_partition(),
                        e
                    );
                    self.context.metrics.record_send_error();
                    batch.fail(&e);
                }
            }
        }
        if sendable.is_empty() {
            return;
        }

        let transactional = sendable.iter().any(|b| b.is_transactional());
        let mut topic_data: Vec<TopicProduceData> = Vec::new();
        for (batch, records) in sendable.iter().zip(payloads) {
            let tp = batch.topic_partition();
            let partition = PartitionProduceData {
                index: tp.partition,
                records: Some(records),
                ..Default::default()
            };
            match topic_data.iter_mut().find(|t| t.name == tp.topic.name) {
                Some(topic) => topic.partition_data.push(partition),
                None => topic_data.push(TopicProduceData {
                    name: tp.topic.name.clone(),
                    partition_data: vec![partition],
                    ..Default::default()
                }),
            }
        }
        let request = ProduceRequest {
            transactional_id: if transactional {
                config.transactional_id.clone()
            } else {
                None
            },
            acks: config.acks.as_i16(),
            timeout_ms: config.request_timeout_ms(),
            topic_data,
            ..Default::default()
        };

        let timer = Timer::start();
        let response = match self.context.cluster.connection(self.node_id, &self.abort).await {
            Ok(link) => link.produce(request, &self.abort).await,
            Err(e) => Err(e),
        };
        let latency = timer.elapsed();

        let mut recoveries = Vec::new();
        match response {
            Ok(None) => {
                for batch in sendable {
                    self.record_sent(&batch, latency);
                    batch.complete(-1, -1);
                }
            }
            Ok(Some(response)) => {
                for batch in sendable {
                    if let Some(recovery) = self.settle(batch, &response, latency) {
                        recoveries.push(recovery);
                    }
                }
            }
            Err(e) => {
                if !e.is_cancelled() {
                    warn!(
                        "Write channel {} - produce request failed: {}",
                        self.node_id, e
                    );
                }
                for batch in sendable {
                    if let Some(recovery) = self.on_failure(batch, &e) {
                        recoveries.push(recovery);
                    }
                }
            }
        }

        if !recoveries.is_empty() {
            self.recover(recoveries).await;
        }
    }

    /// Completes or fails one batch from the broker's answer.
    fn settle(
        &mut self,
        batch: ProduceRecords,
        response: &ProduceResponse,
        latency: Duration,
    ) -> Option<Recovery> {
        let tp = batch.topic_partition();
        let Some(partition) = response.partition(&tp.topic.name, tp.partition) else {
            let error = ClientError::transport(format!("No produce response for {}", tp));
            return self.on_failure(batch, &error);
        };

        match ErrorCode::from(partition.error_code) {
            ErrorCode::NoError => {
                self.record_sent(&batch, latency);
                batch.complete(partition.base_offset, partition.log_append_time_ms);
                None
            }
            // An earlier attempt was written; the broker already has it.
            ErrorCode::DuplicateSequenceNumber if batch.attempts > 0 => {
                debug!(
                    "Write channel {} - duplicate sequence for {} treated as success",
                    self.node_id, tp
                );
                self.record_sent(&batch, latency);
                batch.complete(partition.base_offset, partition.log_append_time_ms);
                None
            }
            _ => {
                let error = ClientError::api(partition.error_code, partition.error_message.clone());
                warn!(
                    "Write channel {} - partition {} failed: {}",
                    self.node_id, tp, error
                );
                self.on_failure(batch, &error)
            }
        }
    }

    fn on_failure(&mut self, mut batch: ProduceRecords, error: &ClientError) -> Option<Recovery> {
        if error.is_cancelled() || self.abort.is_cancelled() {
            batch.fail(&ClientError::Closed);
            return None;
        }
        if error.is_retryable() && batch.attempts < self.retry.retries {
            batch.attempts += 1;
            self.context.metrics.record_retry();
            debug!(
                "Write channel {} - retrying {} (attempt {}): {}",
                self.node_id,
                batch.topic_partition(),
                batch.attempts,
                error
            );
            return Some(if error.requires_metadata_refresh() {
                Recovery::Reroute(batch)
            } else {
                Recovery::InPlace(batch)
            });
        }
        self.context.metrics.record_send_error();
        batch.fail(error);
        None
    }

    /// Waits one backoff, then queues retries ahead of everything else and
    /// hands moved partitions to the router.
    async fn recover(&mut self, recoveries: Vec<Recovery>) {
        if self.retry.backoff(&self.abort).await.is_err() {
            for recovery in recoveries {
                match recovery {
                    Recovery::InPlace(batch) | Recovery::Reroute(batch) => {
                        batch.fail(&ClientError::Closed)
                    }
                }
            }
            return;
        }

        let router = self.context.router.upgrade();
        let mut in_place = Vec::new();
        for recovery in recoveries {
            match (recovery, router.as_ref()) {
                (Recovery::InPlace(batch), _) => in_place.push(batch),
                (Recovery::Reroute(batch), Some(router)) => {
                    self.context.metrics.record_reroute();
                    if let Some(batch) = router.reroute(batch, self.node_id, &self.abort).await {
                        in_place.push(batch);
                    }
                }
                (Recovery::Reroute(batch), None) => batch.fail(&ClientError::Closed),
            }
        }
        if !in_place.is_empty() {
            self.shared.state.lock().push_front(in_place);
        }
    }

    fn record_sent(&self, batch: &ProduceRecords, latency: Duration) {
        self.context
            .metrics
            .record_send(batch.len() as u64, batch.encoded_size() as u64, latency);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::{ProduceRecord, ProduceResult};
    use tokio::sync::oneshot;

    fn state(batch_max_records: usize) -> ChannelState {
        let config = WriteStreamConfig {
            batch_max_records,
            linger: Duration::from_secs(60),
            ..Default::default()
        };
        ChannelState {
            node_id: 1,
            config: Arc::new(config),
            identity: ProducerIdentity::NONE,
            open: HashMap::new(),
            queue: VecDeque::new(),
            closing: false,
            drained: false,
        }
    }

    /// Writers stay waiting while the receivers are held.
    type Waiting = Vec<oneshot::Receiver<Result<ProduceResult>>>;

    fn collect(
        state: &mut ChannelState,
        waiting: &mut Waiting,
        topic_partition: &TopicPartition,
        value: &'static str,
    ) {
        let record = ProduceRecord::new(topic_partition.clone(), value);
        let (command, rx) = ProduceCommand::new(record, false);
        waiting.push(rx);
        state.collect(command);
    }

    fn values(batches: &[ProduceRecords]) -> Vec<Vec<String>> {
        batches
            .iter()
            .map(|batch| {
                batch
                    .records()
                    .map(|r| {
                        let value = r.command.record.value.as_deref().unwrap_or_default();
                        String::from_utf8_lossy(value).into_owned()
                    })
                    .collect()
            })
            .collect()
    }

    #[test]
    fn test_release_keeps_partition_order() {
        let mut state = state(2);
        let mut waiting = Waiting::new();
        let moved = TopicPartition::new("orders", 0);
        let other = TopicPartition::new("orders", 1);
        collect(&mut state, &mut waiting, &moved, "a");
        collect(&mut state, &mut waiting, &moved, "b");
        collect(&mut state, &mut waiting, &other, "x");
        collect(&mut state, &mut waiting, &other, "y");
        collect(&mut state, &mut waiting, &moved, "c");
        collect(&mut state, &mut waiting, &moved, "d");
        collect(&mut state, &mut waiting, &moved, "e");
        assert_eq!(state.queue.len(), 3);

        let released = state.release(&moved);
        assert_eq!(
            values(&released),
            vec![vec!["a", "b"], vec!["c", "d"], vec!["e"]]
        );
        assert_eq!(state.queue.len(), 1);
        assert!(state.open.is_empty());
    }

    #[test]
    fn test_adopted_batches_go_first() {
        let mut source = state(1);
        let mut target = state(1);
        let mut waiting = Waiting::new();
        let tp = TopicPartition::new("orders", 0);
        let local = TopicPartition::new("orders", 1);
        collect(&mut source, &mut waiting, &tp, "first");
        collect(&mut source, &mut waiting, &tp, "second");
        collect(&mut target, &mut waiting, &local, "local");

        target.push_front(source.release(&tp));
        let request = target.next_request();
        assert_eq!(values(&request), vec![vec!["first"], vec!["local"]]);
        let request = target.next_request();
        assert_eq!(values(&request), vec![vec!["second"]]);
    }

    #[test]
    fn test_one_batch_per_partition_per_request() {
        let mut state = state(1);
        let mut waiting = Waiting::new();
        let p0 = TopicPartition::new("orders", 0);
        let p1 = TopicPartition::new("orders", 1);
        collect(&mut state, &mut waiting, &p0, "a");
        collect(&mut state, &mut waiting, &p0, "b");
        collect(&mut state, &mut waiting, &p1, "c");

        assert_eq!(values(&state.next_request()), vec![vec!["a"], vec!["c"]]);
        assert_eq!(values(&state.next_request()), vec![vec!["b"]]);
        assert!(state.next_request().is_empty());
    }

    #[test]
    fn test_closing_rejects_records() {
        let mut state = state(10);
        state.closing = true;
        let tp = TopicPartition::new("orders", 0);
        let (command, mut rx) = ProduceCommand::new(ProduceRecord::new(tp, "late"), false);
        state.collect(command);
        assert!(state.open.is_empty());
        assert!(matches!(rx.try_recv(), Ok(Err(ClientError::Closed))));
    }

    #[test]
    fn test_sequence_table_reserves_ranges() {
        let table = SequenceTable::default();
        let p0 = TopicPartition::new("orders", 0);
        let p1 = TopicPartition::new("orders", 1);
        assert_eq!(table.reserve(&p0, 3), 0);
        assert_eq!(table.reserve(&p0, 2), 3);
        assert_eq!(table.reserve(&p1, 4), 0);
        assert_eq!(table.reserve(&p0, 1), 5);
    }

    #[test]
    fn test_sequence_table_wraps() {
        let table = SequenceTable::default();
        let tp = TopicPartition::new("orders", 0);
        table.next.insert(tp.clone(), i32::MAX - 1);
        assert_eq!(table.reserve(&tp, 3), i32::MAX - 1);
        assert_eq!(table.reserve(&tp, 1), 1);
    }
}
