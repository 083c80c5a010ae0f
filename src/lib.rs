//! Low-allocation asynchronous producer for Kafka 0.8 compatible brokers.
//!
//! Each [`Producer`] is bound to one topic and one partitioning key and
//! batches opaque byte payloads into fixed, pooled message-set buffers. A
//! single sender task frames, optionally compresses, and transmits batches
//! to the partition leader, refreshing metadata and retrying on failure.
//! Once a producer is running, the hot path performs no allocations.

pub mod buffer;
pub mod compression;
pub mod config;
pub mod connection;
pub mod error;
pub mod metadata;
pub mod metrics;
mod producer;
pub mod protocol;

pub use config::{CompressionCodec, ProducerConfig};
pub use error::{Error, Result};
pub use metrics::MetricsRegistry;
pub use producer::{Producer, ProducerBuilder};
