//! Kafka 0.8 wire protocol.
//!
//! Everything on the wire is big-endian. Requests are framed by a 4-byte
//! size prefix that excludes itself; produce requests additionally carry
//! interior length and CRC fields that are only known after the payload has
//! been written, so the encoder works on a cursor with explicit position
//! save/restore ([`wire::WireBuf`]).
//!
//! # References
//! - <https://cwiki.apache.org/confluence/display/KAFKA/A+Guide+To+The+Kafka+Protocol>

pub mod metadata;
pub mod produce;
pub mod wire;

pub const API_KEY_PRODUCE: i16 = 0;
pub const API_KEY_METADATA: i16 = 3;

/// All requests here are the original 0.8 shapes.
pub const API_VERSION: i16 = 0;

/// Message format v0.
pub const MAGIC_BYTE: i8 = 0;

/// Codec marker stored in the message attributes byte.
pub const NO_COMPRESSION: i8 = 0;
pub const GZIP_COMPRESSION: i8 = 1;
pub const SNAPPY_COMPRESSION: i8 = 2;
