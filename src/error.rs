use thiserror::Error;

#[derive(Error, Debug)]
#[non_exhaustive]
pub enum Error {
    #[error("unknown compression codec: {0}")]
    UnknownCompressionCodec(String),

    #[error("invalid configuration: {0}")]
    InvalidConfig(String),

    #[error("record of {size} bytes cannot fit an empty buffer of {capacity} bytes")]
    RecordTooLarge { size: usize, capacity: usize },

    #[error("destination buffer too small for compressed data")]
    CompressOverflow,

    #[error("produce request does not fit the send buffer")]
    SendBufferOverflow,

    #[error("cannot read/write data: {0}")]
    SocketIo(#[from] std::io::Error),

    #[error("correlation id mismatch: expected {expected}, got {actual}")]
    ProtocolDesync { expected: i32, actual: i32 },

    #[error("broker returned error code {0}")]
    BrokerError(i16),

    #[error("malformed response: {0}")]
    MalformedResponse(String),

    #[error("metadata unavailable: {0}")]
    Metadata(String),
}

pub type Result<T, E = Error> = std::result::Result<T, E>;
