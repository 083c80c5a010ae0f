//! Pluggable message-set compression.
//!
//! Codecs write into a caller-provided destination slice so the send path
//! stays allocation-free; a destination that is too small is reported as
//! [`Error::CompressOverflow`] and the batch is dropped rather than retried.

use std::io::{Cursor, Write};

use flate2::write::GzEncoder;

use crate::config::CompressionCodec;
use crate::error::{Error, Result};
use crate::protocol::{GZIP_COMPRESSION, SNAPPY_COMPRESSION};

pub trait Compressor: Send {
    /// Codec marker for the message attributes byte.
    fn attribute_byte(&self) -> i8;

    /// Compress `src` into `dst`, returning the number of bytes written.
    fn compress(&mut self, src: &[u8], dst: &mut [u8]) -> Result<usize>;
}

/// Build the configured codec, or `None` for the uncompressed path.
pub fn make_compressor(codec: CompressionCodec, level: u32) -> Option<Box<dyn Compressor>> {
    match codec {
        CompressionCodec::None => None,
        CompressionCodec::Gzip => Some(Box::new(GzipCompressor::new(level))),
        CompressionCodec::Snappy => Some(Box::new(SnappyCompressor::new())),
    }
}

pub struct GzipCompressor {
    level: flate2::Compression,
}

impl GzipCompressor {
    pub fn new(level: u32) -> Self {
        Self {
            level: flate2::Compression::new(level.min(9)),
        }
    }
}

impl Compressor for GzipCompressor {
    fn attribute_byte(&self) -> i8 {
        GZIP_COMPRESSION
    }

    fn compress(&mut self, src: &[u8], dst: &mut [u8]) -> Result<usize> {
        let mut cursor = Cursor::new(dst);
        let mut encoder = GzEncoder::new(&mut cursor, self.level);
        encoder.write_all(src).map_err(map_write_err)?;
        encoder.finish().map_err(map_write_err)?;
        Ok(cursor.position() as usize)
    }
}

fn map_write_err(e: std::io::Error) -> Error {
    // a full fixed-size destination surfaces as WriteZero
    if e.kind() == std::io::ErrorKind::WriteZero {
        Error::CompressOverflow
    } else {
        Error::SocketIo(e)
    }
}

pub struct SnappyCompressor {
    encoder: snap::raw::Encoder,
}

impl SnappyCompressor {
    pub fn new() -> Self {
        Self {
            encoder: snap::raw::Encoder::new(),
        }
    }
}

impl Default for SnappyCompressor {
    fn default() -> Self {
        Self::new()
    }
}

impl Compressor for SnappyCompressor {
    fn attribute_byte(&self) -> i8 {
        SNAPPY_COMPRESSION
    }

    fn compress(&mut self, src: &[u8], dst: &mut [u8]) -> Result<usize> {
        match self.encoder.compress(src, dst) {
            Ok(n) => Ok(n),
            Err(snap::Error::BufferTooSmall { .. }) => Err(Error::CompressOverflow),
            Err(e) => Err(Error::MalformedResponse(format!("snappy failure: {e}"))),
        }
    }
}
