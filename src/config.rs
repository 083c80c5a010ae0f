//! Producer configuration.
//!
//! Parsing configuration from files or the environment is the host's
//! business; this module only provides the typed parameters the producer
//! consumes.

use std::str::FromStr;

use crate::error::Error;

/// Compression applied to each outgoing message set.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum CompressionCodec {
    #[default]
    None,
    Gzip,
    Snappy,
}

impl FromStr for CompressionCodec {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "none" => Ok(Self::None),
            "gzip" => Ok(Self::Gzip),
            "snappy" => Ok(Self::Snappy),
            other => Err(Error::UnknownCompressionCodec(other.to_owned())),
        }
    }
}

/// Parameters for a [`Producer`](crate::Producer).
///
/// All fields are plain data; an instance is cheap to clone and is consumed
/// at construction time. Defaults match a conservative production setup:
/// leader acks, ten-second broker timeout, 1 MiB message buffers.
#[derive(Debug, Clone)]
pub struct ProducerConfig {
    /// Seed brokers used for metadata discovery, as `host:port` strings.
    pub metadata_broker_list: Vec<String>,

    /// Required acks code sent on every produce request: 0 = fire and
    /// forget, 1 = leader ack, -1 = full ISR ack.
    pub request_required_acks: i16,

    /// Broker-side timeout written into each request, also the base for the
    /// socket read deadline (`request_timeout_ms + 1000`).
    pub request_timeout_ms: i32,

    /// How many times a failed produce request is retried before its batch
    /// is dropped.
    pub message_send_max_retries: u32,

    /// Sleep between retries.
    pub retry_backoff_ms: u64,

    pub compression_codec: CompressionCodec,

    /// Level passed to the gzip encoder. Ignored by other codecs.
    pub compression_level: u32,

    /// Capacity of the send buffer holding one assembled request, and the
    /// socket send-buffer hint. Must exceed `message_buffer_size` plus the
    /// request header overhead when not compressing.
    pub send_buffer_size: usize,

    /// Capacity of each message-set buffer.
    pub message_buffer_size: usize,

    /// Number of message-set buffers in the pool.
    pub num_buffers: usize,

    /// Use one process-wide buffer pool instead of a per-instance pool.
    pub use_shared_buffers: bool,

    /// How long `send` waits for a free buffer: `-1` blocks indefinitely,
    /// `0` never blocks, a positive value is a timeout in milliseconds.
    pub queue_enqueue_timeout_ms: i64,

    /// Period of the flush tick that bounds batch latency.
    pub queue_buffering_max_ms: u64,

    /// Time-based metadata refresh cadence. Negative disables time-based
    /// refreshes.
    pub topic_metadata_refresh_interval_ms: i64,
}

impl Default for ProducerConfig {
    fn default() -> Self {
        Self {
            metadata_broker_list: vec![],
            request_required_acks: 1,
            request_timeout_ms: 10_000,
            message_send_max_retries: 3,
            retry_backoff_ms: 100,
            compression_codec: CompressionCodec::None,
            compression_level: 6,
            send_buffer_size: (1 << 20) + 1024,
            message_buffer_size: 1 << 20,
            num_buffers: 2,
            use_shared_buffers: false,
            queue_enqueue_timeout_ms: -1,
            queue_buffering_max_ms: 5_000,
            topic_metadata_refresh_interval_ms: 600_000,
        }
    }
}

impl ProducerConfig {
    pub(crate) fn validate(&self) -> Result<(), Error> {
        if self.num_buffers == 0 {
            return Err(Error::InvalidConfig("num_buffers must be at least 1".into()));
        }
        if self.message_buffer_size <= crate::buffer::RECORD_OVERHEAD {
            return Err(Error::InvalidConfig(format!(
                "message_buffer_size {} cannot hold a single record header",
                self.message_buffer_size
            )));
        }
        if self.send_buffer_size < 64 {
            return Err(Error::InvalidConfig(format!(
                "send_buffer_size {} cannot hold a request header",
                self.send_buffer_size
            )));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    use assert_matches::assert_matches;

    #[test]
    fn test_codec_from_str() {
        assert_eq!("none".parse::<CompressionCodec>().unwrap(), CompressionCodec::None);
        assert_eq!("gzip".parse::<CompressionCodec>().unwrap(), CompressionCodec::Gzip);
        assert_eq!("snappy".parse::<CompressionCodec>().unwrap(), CompressionCodec::Snappy);

        let err = "lz4".parse::<CompressionCodec>().unwrap_err();
        assert_matches!(err, Error::UnknownCompressionCodec(_));
        assert_eq!(err.to_string(), "unknown compression codec: lz4");
    }

    #[test]
    fn test_validate() {
        let config = ProducerConfig::default();
        config.validate().unwrap();

        let config = ProducerConfig {
            num_buffers: 0,
            ..ProducerConfig::default()
        };
        assert_matches!(config.validate(), Err(Error::InvalidConfig(_)));

        let config = ProducerConfig {
            message_buffer_size: 10,
            ..ProducerConfig::default()
        };
        assert_matches!(config.validate(), Err(Error::InvalidConfig(_)));
    }
}
