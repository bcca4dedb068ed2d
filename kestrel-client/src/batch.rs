//! Record batch builder
//!
//! Packs produce commands for one partition into a v2 record batch under a
//! byte ceiling. Sizes are computed exactly up front, so a batch that has
//! been accepted encodes to precisely [`ProduceRecords::encoded_size`] bytes.

use bytes::{Bytes, BytesMut};
use kestrel::records::{
    attributes, encode_record_batch, put_record, record_body_size, record_size,
    NO_PARTITION_LEADER_EPOCH, NO_SEQUENCE, RECORD_BATCH_OVERHEAD,
};
use kestrel::RecordBatchHeader;
use std::time::Instant;
use tokio::sync::{oneshot, OwnedSemaphorePermit};

use crate::error::ClientError;
use crate::pending::PendingTicket;
use crate::protocol::{ProduceRecord, ProduceResult, ProducerIdentity, TopicPartition};
use crate::Result;

/// A record plus the handle its writer is waiting on.
#[derive(Debug)]
pub(crate) struct ProduceCommand {
    pub record: ProduceRecord,
    /// Whether the record belongs to the open transaction
    pub transactional: bool,
    pub completion: oneshot::Sender<Result<ProduceResult>>,
    /// Channel capacity and flush bookkeeping, both released with the command
    admission: Option<(OwnedSemaphorePermit, PendingTicket)>,
}

impl ProduceCommand {
    pub fn new(
        record: ProduceRecord,
        transactional: bool,
    ) -> (Self, oneshot::Receiver<Result<ProduceResult>>) {
        let (completion, rx) = oneshot::channel();
        (
            Self {
                record,
                transactional,
                completion,
                admission: None,
            },
            rx,
        )
    }

    pub fn admit(&mut self, permit: OwnedSemaphorePermit, ticket: PendingTicket) {
        self.admission = Some((permit, ticket));
    }

    /// The writer stopped waiting.
    pub fn is_abandoned(&self) -> bool {
        self.completion.is_closed()
    }

    pub fn complete(self, result: Result<ProduceResult>) {
        let _ = self.completion.send(result);
    }
}

/// A record with its batch-relative fields fixed at insertion.
#[derive(Debug)]
pub(crate) struct PackedRecord {
    /// Body length, without the length prefix
    pub length: usize,
    pub timestamp_delta: i64,
    pub offset_delta: i32,
    pub command: ProduceCommand,
}

/// Outcome of [`ProduceRecords::try_add`]
#[derive(Debug)]
pub(crate) enum AddRecordResult {
    /// Accepted; carries the bytes the record takes in the batch
    Added(usize),
    /// Rejected without touching the batch
    Full {
        command: ProduceCommand,
        required: usize,
    },
}

/// Records for one partition on their way into a single record batch.
#[derive(Debug)]
pub(crate) struct ProduceRecords {
    topic_partition: TopicPartition,
    attributes: i16,
    base_timestamp: i64,
    max_timestamp: i64,
    identity: ProducerIdentity,
    base_sequence: i32,
    batch_size: usize,
    records: Vec<PackedRecord>,
    created_at: Instant,
    /// Number of times the batch was sent and failed
    pub attempts: u32,
    encoded: Option<Bytes>,
}

impl ProduceRecords {
    pub fn new(
        topic_partition: TopicPartition,
        transactional: bool,
        base_timestamp: i64,
        identity: ProducerIdentity,
    ) -> Self {
        Self {
            topic_partition,
            attributes: if transactional {
                attributes::TRANSACTIONAL
            } else {
                0
            },
            base_timestamp,
            max_timestamp: base_timestamp,
            identity,
            base_sequence: NO_SEQUENCE,
            batch_size: 0,
            records: Vec::new(),
            created_at: Instant::now(),
            attempts: 0,
            encoded: None,
        }
    }

    /// Adds a command unless doing so would push the encoded batch past
    /// `max_size`. The first record is always accepted.
    pub fn try_add(&mut self, command: ProduceCommand, max_size: usize) -> AddRecordResult {
        let record = &command.record;
        let timestamp_delta = record.timestamp_ms - self.base_timestamp;
        let offset_delta = self.records.len() as i32;
        let length = record_body_size(
            timestamp_delta,
            offset_delta,
            record.key.as_deref(),
            record.value.as_deref(),
            &record.headers,
        );
        let required = record_size(length);
        if !self.records.is_empty() && self.encoded_size() + required > max_size {
            return AddRecordResult::Full { command, required };
        }

        self.max_timestamp = self.max_timestamp.max(record.timestamp_ms);
        self.batch_size += required;
        self.records.push(PackedRecord {
            length,
            timestamp_delta,
            offset_delta,
            command,
        });
        AddRecordResult::Added(required)
    }

    pub fn topic_partition(&self) -> &TopicPartition {
        &self.topic_partition
    }

    pub fn is_transactional(&self) -> bool {
        self.attributes & attributes::TRANSACTIONAL != 0
    }

    pub fn len(&self) -> usize {
        self.records.len()
    }

    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }

    /// Bytes taken by the packed records alone
    pub fn batch_size(&self) -> usize {
        self.batch_size
    }

    /// Bytes of the whole batch on the wire
    pub fn encoded_size(&self) -> usize {
        RECORD_BATCH_OVERHEAD + self.batch_size
    }

    pub fn created_at(&self) -> Instant {
        self.created_at
    }

    pub fn records(&self) -> impl Iterator<Item = &PackedRecord> {
        self.records.iter()
    }

    pub fn base_sequence(&self) -> i32 {
        self.base_sequence
    }

    /// Fixed once; later calls are ignored so that retries resend the
    /// sequence the broker may already have seen.
    pub fn set_base_sequence(&mut self, base_sequence: i32) {
        if self.base_sequence == NO_SEQUENCE {
            self.base_sequence = base_sequence;
            self.encoded = None;
        }
    }

    pub fn header(&self) -> RecordBatchHeader {
        RecordBatchHeader {
            base_offset: 0,
            partition_leader_epoch: NO_PARTITION_LEADER_EPOCH,
            attributes: self.attributes,
            last_offset_delta: self.records.len() as i32 - 1,
            base_timestamp: self.base_timestamp,
            max_timestamp: self.max_timestamp,
            producer_id: self.identity.producer_id,
            producer_epoch: self.identity.producer_epoch,
            base_sequence: self.base_sequence,
            record_count: self.records.len() as i32,
        }
    }

    /// Wire bytes of the batch. Encoded on first use and reused afterwards,
    /// so every resend is byte-identical.
    pub fn encode(&mut self) -> Result<Bytes> {
        if let Some(encoded) = &self.encoded {
            return Ok(encoded.clone());
        }
        let mut buf = BytesMut::with_capacity(self.encoded_size());
        let header = self.header();
        encode_record_batch(&mut buf, &header, |buf| {
            for packed in &self.records {
                let record = &packed.command.record;
                put_record(
                    buf,
                    packed.timestamp_delta,
                    packed.offset_delta,
                    record.key.as_deref(),
                    record.value.as_deref(),
                    &record.headers,
                );
            }
            Ok(())
        })?;
        let encoded = buf.freeze();
        self.encoded = Some(encoded.clone());
        Ok(encoded)
    }

    /// Completes every command in offset-delta order. A negative
    /// `base_offset` means the broker did not report one.
    pub fn complete(self, base_offset: i64, log_append_time_ms: i64) {
        let topic_partition = self.topic_partition;
        for packed in self.records {
            let offset = if base_offset < 0 {
                -1
            } else {
                base_offset + packed.offset_delta as i64
            };
            let timestamp_ms = if log_append_time_ms >= 0 {
                log_append_time_ms
            } else {
                packed.command.record.timestamp_ms
            };
            packed.command.complete(Ok(ProduceResult {
                topic_partition: topic_partition.clone(),
                offset,
                timestamp_ms,
            }));
        }
    }

    pub fn fail(self, error: &ClientError) {
        for packed in self.records {
            packed.command.complete(Err(error.clone()));
        }
    }
}

/// Next sequence after `count` records, wrapping at `i32::MAX` as brokers do.
pub(crate) fn increment_sequence(sequence: i32, count: i32) -> i32 {
    if sequence > i32::MAX - count {
        count - (i32::MAX - sequence) - 1
    } else {
        sequence + count
    }
}
