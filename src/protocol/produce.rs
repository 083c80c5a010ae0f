//! Produce request encoder and response decoder.
//!
//! One request carries exactly one topic and one partition. The request is
//! assembled in place inside the reusable send buffer; the total size, the
//! message-set size, and (on the compressed path) the outer message size and
//! CRC are patched after the payload is written.

use crate::compression::Compressor;
use crate::error::{Error, Result};
use crate::protocol::wire::{WireBuf, WireReader};
use crate::protocol::{API_KEY_PRODUCE, API_VERSION, MAGIC_BYTE};

/// Per-instance constants of every produce request.
#[derive(Debug, Clone)]
pub struct RequestTemplate {
    pub client_id: Vec<u8>,
    pub topic: Vec<u8>,
    pub key: Vec<u8>,
    pub required_acks: i16,
    pub timeout_ms: i32,
}

/// Assemble one produce request into `buf`.
///
/// With a compressor, the accumulated message set becomes the value of a
/// single outer record whose attributes byte names the codec. Back-patch
/// order: compressed value, value length, outer message size, outer CRC
/// (magic byte to end), message-set size, total request size.
pub fn encode_produce_request<'a>(
    buf: &mut WireBuf,
    template: &RequestTemplate,
    correlation_id: i32,
    partition: i32,
    message_set: &[u8],
    compressor: Option<&'a mut (dyn Compressor + 'a)>,
) -> Result<()> {
    buf.clear();
    buf.reserve_i32()?; // total size, patched last

    buf.put_i16(API_KEY_PRODUCE)?;
    buf.put_i16(API_VERSION)?;
    buf.put_i32(correlation_id)?;
    buf.put_i16(template.client_id.len() as i16)?;
    buf.put_slice(&template.client_id)?;
    buf.put_i16(template.required_acks)?;
    buf.put_i32(template.timeout_ms)?;
    buf.put_i32(1)?; // topic count
    buf.put_i16(template.topic.len() as i16)?;
    buf.put_slice(&template.topic)?;
    buf.put_i32(1)?; // partition count
    buf.put_i32(partition)?;

    match compressor {
        None => {
            buf.put_i32(message_set.len() as i32)?;
            buf.put_slice(message_set)?;
        }
        Some(compressor) => {
            let set_size_pos = buf.reserve_i32()?;

            buf.put_i64(0)?; // outer offset
            let message_size_pos = buf.reserve(8)?; // message size + crc
            buf.put_i8(MAGIC_BYTE)?;
            buf.put_i8(compressor.attribute_byte())?;
            buf.put_i32(template.key.len() as i32)?;
            buf.put_slice(&template.key)?;

            let value_size_pos = buf.reserve_i32()?;
            let compressed = compressor.compress(message_set, buf.tail_mut())?;
            buf.advance(compressed);
            buf.patch_i32(value_size_pos, compressed as i32);

            buf.patch_i32(
                message_size_pos,
                (buf.position() - (message_size_pos + 4)) as i32,
            );

            let mut crc = crc32fast::Hasher::new();
            crc.update(buf.slice(message_size_pos + 8, buf.position()));
            buf.patch_i32(message_size_pos + 4, crc.finalize() as i32);

            buf.patch_i32(set_size_pos, (buf.position() - (set_size_pos + 4)) as i32);
        }
    }

    buf.patch_i32(0, (buf.position() - 4) as i32);
    Ok(())
}

/// Decode a produce response body (the bytes after the size prefix).
///
/// Validates the echoed correlation id and the partition error code, and
/// returns the assigned base offset.
pub fn decode_produce_response(body: &[u8], expected_correlation_id: i32) -> Result<i64> {
    let mut reader = WireReader::new(body);

    let correlation_id = reader.get_i32()?;
    if correlation_id != expected_correlation_id {
        return Err(Error::ProtocolDesync {
            expected: expected_correlation_id,
            actual: correlation_id,
        });
    }

    let _topic_count = reader.get_i32()?;
    let topic_len = reader.get_i16()?;
    let topic_len = usize::try_from(topic_len)
        .map_err(|_| Error::MalformedResponse(format!("negative topic length {topic_len}")))?;
    reader.skip(topic_len)?;
    let _partition_count = reader.get_i32()?;
    let _partition = reader.get_i32()?;

    let error_code = reader.get_i16()?;
    if error_code != 0 {
        return Err(Error::BrokerError(error_code));
    }

    reader.get_i64()
}
