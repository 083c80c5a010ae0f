//! Topic metadata request and response (api key 3, version 0).

use std::collections::HashMap;

use crate::error::{Error, Result};
use crate::metadata::{BrokerEndpoint, MetadataSnapshot, TopicMetadata};
use crate::protocol::wire::{WireBuf, WireReader};
use crate::protocol::{API_KEY_METADATA, API_VERSION};

/// Encode a metadata request for a single topic.
pub fn encode_metadata_request(
    buf: &mut WireBuf,
    correlation_id: i32,
    client_id: &[u8],
    topic: &[u8],
) -> Result<()> {
    buf.clear();
    let size_pos = buf.reserve_i32()?;

    buf.put_i16(API_KEY_METADATA)?;
    buf.put_i16(API_VERSION)?;
    buf.put_i32(correlation_id)?;
    buf.put_i16(client_id.len() as i16)?;
    buf.put_slice(client_id)?;
    buf.put_i32(1)?; // topic count
    buf.put_i16(topic.len() as i16)?;
    buf.put_slice(topic)?;

    buf.patch_i32(size_pos, (buf.position() - 4) as i32);
    Ok(())
}

/// Decode a metadata response body into a snapshot.
///
/// A nonzero topic-level error code fails the fetch. Partitions without a
/// live leader (`leader == -1`) are simply absent from the snapshot; the
/// partition count still includes them.
pub fn decode_metadata_response(
    body: &[u8],
    expected_correlation_id: i32,
) -> Result<MetadataSnapshot> {
    let mut reader = WireReader::new(body);

    let correlation_id = reader.get_i32()?;
    if correlation_id != expected_correlation_id {
        return Err(Error::ProtocolDesync {
            expected: expected_correlation_id,
            actual: correlation_id,
        });
    }

    let broker_count = read_count(&mut reader, "broker")?;
    let mut brokers = HashMap::with_capacity(broker_count);
    for _ in 0..broker_count {
        let node_id = reader.get_i32()?;
        let host = reader.get_string()?;
        let port = reader.get_i32()?;
        brokers.insert(node_id, BrokerEndpoint { host, port });
    }

    let topic_count = read_count(&mut reader, "topic")?;
    let mut topics = HashMap::with_capacity(topic_count);
    for _ in 0..topic_count {
        let error_code = reader.get_i16()?;
        let name = reader.get_string()?;
        if error_code != 0 {
            return Err(Error::BrokerError(error_code));
        }

        let partition_count = read_count(&mut reader, "partition")?;
        let mut leaders = HashMap::with_capacity(partition_count);
        for _ in 0..partition_count {
            let _error_code = reader.get_i16()?;
            let partition = reader.get_i32()?;
            let leader = reader.get_i32()?;
            if leader >= 0 {
                leaders.insert(partition, leader);
            }
            for _ in 0..read_count(&mut reader, "replica")? {
                reader.get_i32()?;
            }
            for _ in 0..read_count(&mut reader, "isr")? {
                reader.get_i32()?;
            }
        }

        topics.insert(
            name,
            TopicMetadata {
                num_partitions: partition_count,
                leaders,
            },
        );
    }

    Ok(MetadataSnapshot { brokers, topics })
}

fn read_count(reader: &mut WireReader<'_>, what: &str) -> Result<usize> {
    let count = reader.get_i32()?;
    usize::try_from(count)
        .map_err(|_| Error::MalformedResponse(format!("negative {what} count {count}")))
}
