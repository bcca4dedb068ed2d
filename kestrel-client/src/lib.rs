//! # Kestrel Client Library
//!
//! An async Kafka producer speaking the Kafka wire protocol directly.
//!
//! ## Features
//!
//! - **Per-broker pipelines**: one write channel per leader broker, batching
//!   records per partition with a single produce request in flight
//! - **Idempotence**: producer id, epoch and per-partition sequences, reused
//!   unchanged on retry
//! - **Transactions**: coordinator discovery, partition registration and
//!   commit/abort
//! - **Leader tracking**: metadata cache with automatic rerouting when a
//!   partition's leader moves
//! - **Cancellation**: every suspending call takes a `CancellationToken`
//! - **Observability**: `tracing` events and [`ClientMetrics`] counters
//!
//! ## Quick Start
//!
//! ```rust,no_run
//! use kestrel_client::*;
//! use tokio_util::sync::CancellationToken;
//!
//! #[tokio::main]
//! async fn main() -> Result<()> {
//!     let cancel = CancellationToken::new();
//!     let config = WriteStreamConfig::builder()
//!         .bootstrap_servers(["localhost:9092"])
//!         .enable_idempotence(true)
//!         .build()?;
//!     let stream = WriteStream::connect(config, &cancel).await?;
//!
//!     let record = ProduceRecord::builder()
//!         .topic("my-topic")
//!         .partition(0)
//!         .key("user-123")
//!         .value("Hello Kestrel!")
//!         .build()?;
//!     let result = stream.write(record, &cancel).await?;
//!     println!("Written to {} at offset {}", result.topic_partition, result.offset);
//!
//!     // Let the default partitioner choose
//!     let writer = stream.writer("my-topic");
//!     writer.write(Some("user-7".into()), Some("hi".into()), &cancel).await?;
//!
//!     stream.close(&cancel).await
//! }
//! ```
//!
//! ### Transactions
//!
//! ```rust,no_run
//! use kestrel_client::*;
//! use tokio_util::sync::CancellationToken;
//!
//! # async fn run(stream: WriteStream) -> Result<()> {
//! let cancel = CancellationToken::new();
//! let txn = stream.begin_transaction(&cancel).await?;
//! stream
//!     .write(ProduceRecord::new(TopicPartition::new("orders", 0), "a"), &cancel)
//!     .await?;
//! txn.commit(&cancel).await?;
//! # Ok(())
//! # }
//! ```

mod batch;
mod channel;
mod pending;
pub mod config;
pub mod connection;
pub mod error;
pub mod metadata;
pub mod metrics;
pub mod partitioner;
pub mod protocol;
pub mod retry;
pub mod write_stream;

pub use config::{Acks, WriteStreamConfig, WriteStreamConfigBuilder};
pub use connection::{Cluster, ClusterConnections, NodeLink, UNKNOWN_NODE};
pub use error::ClientError;
pub use metadata::{MetadataCache, PartitionMetadata, ProducerTopicMetadata};
pub use metrics::{ClientMetrics, MetricsSnapshot};
pub use partitioner::{DefaultPartitioner, Partitioner, Writer};
pub use protocol::{
    NodeId, ProduceRecord, ProduceRecordBuilder, ProduceResult, ProducerIdentity, Topic,
    TopicPartition,
};
pub use write_stream::{Transaction, WriteStream};

/// Client library result type
pub type Result<T> = std::result::Result<T, ClientError>;

/// Client library version
pub const VERSION: &str = env!("CARGO_PKG_VERSION");

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_version() {
        assert!(!VERSION.is_empty());
    }
}
