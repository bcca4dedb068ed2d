//! # Kestrel Protocol Module
//!
//! ## Modules
//!
//! - [`kafka`] - Kafka wire protocol: primitives, record batches, message
//!   types and version negotiation

pub mod kafka;
