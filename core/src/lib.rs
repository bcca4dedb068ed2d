//! # Kestrel Protocol Library
//!
//! Binary codec for the Kafka wire protocol as spoken by a producer client.
//!
//! ## Features
//!
//! - **Primitives**: big-endian integers, zigzag varints, legacy and compact
//!   strings/bytes/arrays, UUIDs
//! - **Flexible versions (KIP-482)**: compact encodings and tagged-field
//!   blocks; unknown tags survive a decode/encode cycle untouched
//! - **Record batch v2**: CRC32C-checked batches with per-record deltas
//! - **Versioned messages**: ApiVersions, Metadata, FindCoordinator,
//!   InitProducerId, AddPartitionsToTxn, EndTxn and Produce, each encodable
//!   and decodable at every version listed in [`protocol::kafka`]
//! - **Negotiation**: [`ApiVersionTable`] picks the highest version both sides
//!   share, and [`RequestCodec`] pins a request type to it
//!
//! ## Example
//!
//! ```rust
//! use bytes::BytesMut;
//! use kestrel::{EndTxnRequest, RequestCodec};
//!
//! let codec = RequestCodec::<EndTxnRequest>::new(3)?;
//! let request = EndTxnRequest {
//!     transactional_id: "payments".to_string(),
//!     producer_id: 4000,
//!     producer_epoch: 0,
//!     committed: true,
//!     ..Default::default()
//! };
//!
//! let mut frame = BytesMut::new();
//! codec.encode_request(1, Some("kestrel"), &request, &mut frame)?;
//! # Ok::<(), kestrel::CodecError>(())
//! ```

pub mod protocol;

pub use protocol::kafka::*;
