//! Topic metadata: who leads which partition.
//!
//! The producer only ever asks two questions of a snapshot: how many
//! partitions does my topic have (and who leads each), and where does a
//! given broker id live. How a snapshot is obtained is behind the
//! [`MetadataFetcher`] seam; the default implementation walks the seed
//! broker list with a real metadata request.

use std::collections::HashMap;
use std::sync::atomic::{AtomicI32, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpStream;
use tracing::{debug, warn};

use crate::error::{Error, Result};
use crate::protocol::metadata::{decode_metadata_response, encode_metadata_request};
use crate::protocol::wire::WireBuf;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BrokerEndpoint {
    pub host: String,
    pub port: i32,
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct TopicMetadata {
    pub num_partitions: usize,

    /// Partition index to leader broker id. Leaderless partitions are
    /// absent.
    pub leaders: HashMap<i32, i32>,
}

impl TopicMetadata {
    pub fn num_partitions(&self) -> usize {
        self.num_partitions
    }

    pub fn leader(&self, partition: i32) -> Option<i32> {
        self.leaders.get(&partition).copied()
    }
}

/// One observation of the cluster: topic layouts plus broker endpoints.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct MetadataSnapshot {
    pub brokers: HashMap<i32, BrokerEndpoint>,
    pub topics: HashMap<String, TopicMetadata>,
}

impl MetadataSnapshot {
    pub fn topic(&self, name: &str) -> Option<&TopicMetadata> {
        self.topics.get(name)
    }

    pub fn broker(&self, id: i32) -> Option<&BrokerEndpoint> {
        self.brokers.get(&id)
    }
}

#[async_trait]
pub trait MetadataFetcher: Send + Sync {
    async fn fetch(&self, topic: &str) -> Result<MetadataSnapshot>;
}

/// Fetches metadata over the wire from the first seed broker that answers.
#[derive(Debug)]
pub struct WireMetadataFetcher {
    seed_brokers: Vec<String>,
    client_id: Vec<u8>,
    correlation_id: AtomicI32,
    timeout: Duration,
}

impl WireMetadataFetcher {
    pub fn new(seed_brokers: Vec<String>, client_id: &str, timeout: Duration) -> Self {
        Self {
            seed_brokers,
            client_id: client_id.as_bytes().to_vec(),
            correlation_id: AtomicI32::new(0),
            timeout,
        }
    }

    async fn fetch_from(&self, broker: &str, topic: &str) -> Result<MetadataSnapshot> {
        let correlation_id = self.correlation_id.fetch_add(1, Ordering::Relaxed);

        let mut request = WireBuf::with_capacity(64 + self.client_id.len() + topic.len());
        encode_metadata_request(&mut request, correlation_id, &self.client_id, topic.as_bytes())?;

        let io = async {
            let mut stream = TcpStream::connect(broker).await?;
            stream.write_all(request.bytes()).await?;

            let mut size = [0u8; 4];
            stream.read_exact(&mut size).await?;
            let size = i32::from_be_bytes(size);
            let size = usize::try_from(size)
                .map_err(|_| Error::MalformedResponse(format!("negative frame size {size}")))?;

            let mut body = vec![0u8; size];
            stream.read_exact(&mut body).await?;
            Ok::<_, Error>(body)
        };

        let body = tokio::time::timeout(self.timeout, io).await.map_err(|_| {
            Error::SocketIo(std::io::Error::new(
                std::io::ErrorKind::TimedOut,
                "metadata request timed out",
            ))
        })??;

        decode_metadata_response(&body, correlation_id)
    }
}

#[async_trait]
impl MetadataFetcher for WireMetadataFetcher {
    async fn fetch(&self, topic: &str) -> Result<MetadataSnapshot> {
        for broker in &self.seed_brokers {
            match self.fetch_from(broker, topic).await {
                Ok(snapshot) => {
                    debug!(broker, topic, "fetched metadata");
                    return Ok(snapshot);
                }
                Err(e) => {
                    warn!(broker, topic, error = %e, "metadata fetch failed, trying next seed");
                }
            }
        }
        Err(Error::Metadata(format!(
            "no seed broker returned metadata for topic '{topic}'"
        )))
    }
}
