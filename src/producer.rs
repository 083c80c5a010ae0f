//! The producer itself: ingest path, sender task, periodic tasks.
//!
//! One [`Producer`] is bound to a single (topic, partitioning key) pair and
//! ships opaque payloads as batched produce requests to the partition
//! leader. Payloads accumulate into fixed message-set buffers drawn from a
//! bounded pool; full buffers travel through a FIFO ready queue to a single
//! sender task that frames, optionally compresses, and transmits them, then
//! returns the buffer to the pool. Steady state allocates nothing.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use parking_lot::Mutex as SyncMutex;
use tokio::sync::mpsc;
use tokio::sync::Mutex as AsyncMutex;
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

use crate::buffer::{shared_pool, BufferPool, MessageSetBuffer, RECORD_OVERHEAD};
use crate::compression::{make_compressor, Compressor};
use crate::config::{CompressionCodec, ProducerConfig};
use crate::connection::Connection;
use crate::error::{Error, Result};
use crate::metadata::{MetadataFetcher, MetadataSnapshot, WireMetadataFetcher};
use crate::metrics::{Meter, MetricsRegistry};
use crate::protocol::produce::{decode_produce_response, encode_produce_request, RequestTemplate};
use crate::protocol::wire::WireBuf;

/// How long the sender waits on the ready queue before rechecking the
/// closed flag.
const READY_POLL_INTERVAL: Duration = Duration::from_secs(1);

/// How often the supervisor checks on the sender task.
const SUPERVISOR_INTERVAL: Duration = Duration::from_secs(60);

/// Minimum spacing between quick-rotate metadata refreshes.
const QUICK_ROTATE_REFRESH_FLOOR: Duration = Duration::from_secs(30);

struct Meters {
    received: Meter,
    received_total: Meter,
    sent: Meter,
    sent_total: Meter,
    dropped_queue_full: Meter,
    dropped_queue_full_total: Meter,
    dropped_send_fail: Meter,
    dropped_send_fail_total: Meter,
}

impl Meters {
    fn new(registry: &MetricsRegistry, topic: &str) -> Self {
        let topic_meter = |what: &str| registry.meter(&format!("producer:topics:{topic}:messages {what}"));
        let total_meter = |what: &str| registry.meter(&format!("producer:total:messages {what}"));
        Self {
            received: topic_meter("received"),
            received_total: total_meter("received"),
            sent: topic_meter("sent"),
            sent_total: total_meter("sent"),
            dropped_queue_full: topic_meter("dropped (queue full)"),
            dropped_queue_full_total: total_meter("dropped (queue full)"),
            dropped_send_fail: topic_meter("dropped (send failure)"),
            dropped_send_fail_total: total_meter("dropped (send failure)"),
        }
    }
}

struct IngestState {
    active: Option<MessageSetBuffer>,
}

/// State shared between the caller-facing handle, the sender task, and the
/// periodic tasks.
struct Core {
    topic: String,
    template: RequestTemplate,
    key_hash: u32,

    codec: CompressionCodec,
    compression_level: u32,
    required_acks: i16,
    retries: u32,
    retry_backoff: Duration,
    send_buffer_size: usize,
    message_buffer_size: usize,
    queue_enqueue_timeout_ms: i64,
    metadata_refresh_interval_ms: i64,
    read_timeout: Duration,

    rotate_partitions: bool,
    quick_rotate: bool,
    quick_rotate_message_blocks: i64,

    pool: Arc<BufferPool>,
    use_shared_buffers: bool,
    free_buffer_gauge: Option<String>,

    ready_tx: mpsc::Sender<MessageSetBuffer>,
    ready_rx: AsyncMutex<mpsc::Receiver<MessageSetBuffer>>,
    ingest: AsyncMutex<IngestState>,

    fetcher: Arc<dyn MetadataFetcher>,
    metrics: MetricsRegistry,
    meters: Meters,

    closed: AtomicBool,
    sender_handle: SyncMutex<Option<JoinHandle<()>>>,
}

impl Core {
    /// The ingest path. `None` is the flush hint.
    ///
    /// Serialized by the ingest lock; at most one call makes progress at a
    /// time. Never blocks the caller beyond the configured enqueue timeout.
    async fn ingest(&self, payload: Option<&[u8]>) -> Result<()> {
        if self.closed.load(Ordering::SeqCst) {
            warn!(topic = %self.topic, "send on a closed producer");
            return Ok(());
        }

        let mut state = self.ingest.lock().await;

        let Some(payload) = payload else {
            if state.active.as_ref().is_some_and(|b| !b.is_empty()) {
                if let Some(buffer) = state.active.take() {
                    self.enqueue(buffer).await;
                }
            }
            return Ok(());
        };

        let required = payload.len() + self.template.key.len() + RECORD_OVERHEAD;
        if required > self.message_buffer_size {
            return Err(Error::RecordTooLarge {
                size: required,
                capacity: self.message_buffer_size,
            });
        }

        // every payload that enters the pipeline counts as received, so
        // received = sent + dropped + in flight holds at all times
        self.meters.received.mark();
        self.meters.received_total.mark();

        if state.active.is_none() {
            match self.pool.take(self.queue_enqueue_timeout_ms).await {
                Some(buffer) => state.active = Some(buffer),
                None => {
                    self.mark_dropped_queue_full();
                    return Ok(());
                }
            }
        }

        if state.active.as_ref().is_some_and(|b| b.remaining() < required) {
            if let Some(full) = state.active.take() {
                self.enqueue(full).await;
            }
            match self.pool.take(self.queue_enqueue_timeout_ms).await {
                Some(buffer) => state.active = Some(buffer),
                None => {
                    self.mark_dropped_queue_full();
                    return Ok(());
                }
            }
        }

        if let Some(buffer) = state.active.as_mut() {
            buffer.append_record(&self.template.key, payload)?;
        }
        Ok(())
    }

    async fn enqueue(&self, buffer: MessageSetBuffer) {
        // queue capacity equals the pool size, so this cannot block for long
        if self.ready_tx.send(buffer).await.is_err() {
            error!(topic = %self.topic, "ready queue closed, batch lost");
        }
    }

    fn mark_dropped_queue_full(&self) {
        self.meters.dropped_queue_full.mark();
        self.meters.dropped_queue_full_total.mark();
    }

    fn mark_dropped_send_fail(&self, batch: usize) {
        self.meters.dropped_send_fail.mark_n(batch as u64);
        self.meters.dropped_send_fail_total.mark_n(batch as u64);
    }
}

/// Everything the sender task owns exclusively: the reusable send and
/// response buffers, the broker connection, the metadata snapshot, and the
/// correlation/rotation counters.
struct SendWorker {
    core: Arc<Core>,
    send_buf: WireBuf,
    response: Vec<u8>,
    compressor: Option<Box<dyn Compressor>>,
    conn: Option<Connection>,
    metadata: Option<MetadataSnapshot>,
    partition: i32,
    partition_modifier: u32,
    correlation_id: i32,
    last_correlation_id: i32,
    last_refresh: Instant,
}

impl SendWorker {
    fn new(core: Arc<Core>) -> Self {
        let send_buf = WireBuf::with_capacity(core.send_buffer_size);
        let compressor = make_compressor(core.codec, core.compression_level);
        Self {
            core,
            send_buf,
            // seeded with room for the size prefix, grows to fit the
            // largest response seen, never shrinks
            response: vec![0; 4],
            compressor,
            conn: None,
            metadata: None,
            partition: 0,
            partition_modifier: 0,
            correlation_id: 0,
            last_correlation_id: 0,
            last_refresh: Instant::now(),
        }
    }

    async fn run(mut self) {
        let core = Arc::clone(&self.core);
        debug!(topic = %core.topic, "sender task running");

        loop {
            let polled = {
                let mut rx = core.ready_rx.lock().await;
                tokio::time::timeout(READY_POLL_INTERVAL, rx.recv()).await
            };

            match polled {
                Ok(Some(buffer)) => {
                    self.process(&buffer).await;
                    core.pool.release(buffer);
                }
                Ok(None) => break,
                Err(_) => {
                    if core.closed.load(Ordering::SeqCst) {
                        // drain whatever close() enqueued, then exit
                        loop {
                            let leftover = core.ready_rx.lock().await.try_recv();
                            match leftover {
                                Ok(buffer) => {
                                    self.process(&buffer).await;
                                    core.pool.release(buffer);
                                }
                                Err(_) => break,
                            }
                        }
                        break;
                    }
                }
            }
        }

        debug!(topic = %core.topic, "sender task exiting");
    }

    async fn process(&mut self, buffer: &MessageSetBuffer) {
        // close() enqueues the active buffer even when empty
        if buffer.is_empty() {
            return;
        }
        self.send_message(buffer).await;
    }

    fn encode_current_request(&mut self, core: &Arc<Core>, buffer: &MessageSetBuffer) -> Result<()> {
        let compressor: Option<&mut (dyn Compressor + '_)> = match &mut self.compressor {
            Some(c) => Some(c.as_mut()),
            None => None,
        };
        encode_produce_request(
            &mut self.send_buf,
            &core.template,
            self.correlation_id,
            self.partition,
            buffer.bytes(),
            compressor,
        )
    }

    /// Frame and transmit one batch, retrying on failure, then account for
    /// the outcome and run the periodic metadata refresh triggers.
    async fn send_message(&mut self, buffer: &MessageSetBuffer) {
        let core = Arc::clone(&self.core);
        let batch = buffer.batch_count();

        self.correlation_id = self.correlation_id.wrapping_add(1);

        // the partition must be resolved before the request is framed
        if self.metadata.is_none() || self.conn.is_none() {
            if let Err(e) = self.update_metadata_and_connection(true).await {
                warn!(topic = %core.topic, error = %e, "metadata unavailable before send, will retry");
            }
        }

        if let Err(e) = self.encode_current_request(&core, buffer) {
            error!(topic = %core.topic, batch, error = %e, "could not frame produce request, dropping batch");
            core.mark_dropped_send_fail(batch);
            self.send_buf.clear();
            return;
        }

        let mut failures = 0;
        loop {
            match self.try_send_once().await {
                Ok(()) => {
                    core.meters.sent.mark_n(batch as u64);
                    core.meters.sent_total.mark_n(batch as u64);
                    break;
                }
                Err(e) => {
                    // next attempt refetches metadata and reconnects
                    self.metadata = None;

                    failures += 1;
                    if failures <= core.retries {
                        warn!(
                            topic = %core.topic,
                            error = %e,
                            attempts_left = core.retries - failures + 1,
                            "produce request failed, backing off"
                        );
                        tokio::time::sleep(core.retry_backoff).await;
                    } else {
                        error!(topic = %core.topic, error = %e, batch, "produce request failed, no retries left, dropping batch");
                        core.mark_dropped_send_fail(batch);
                        break;
                    }
                }
            }
        }

        self.send_buf.clear();

        if self.should_refresh() {
            if let Err(e) = self.update_metadata_and_connection(false).await {
                error!(topic = %core.topic, error = %e, "periodic metadata refresh failed");
            }
        }
    }

    async fn try_send_once(&mut self) -> Result<()> {
        if self.metadata.is_none() || self.conn.is_none() {
            self.update_metadata_and_connection(true).await?;
        }
        let conn = self
            .conn
            .as_mut()
            .ok_or_else(|| Error::Metadata("no broker connection".to_owned()))?;

        conn.write_all(self.send_buf.bytes()).await?;

        if self.core.required_acks != 0 {
            conn.read_exact(&mut self.response[..4]).await?;
            let size = i32::from_be_bytes([
                self.response[0],
                self.response[1],
                self.response[2],
                self.response[3],
            ]);
            let size = usize::try_from(size).map_err(|_| {
                Error::MalformedResponse(format!("negative response size {size}"))
            })?;
            if self.response.len() < size {
                self.response.resize(size, 0);
            }

            conn.read_exact(&mut self.response[..size]).await?;
            decode_produce_response(&self.response[..size], self.correlation_id)?;
            conn.drain();
        }

        Ok(())
    }

    /// Refetch metadata, reselect the partition (advancing the rotation
    /// modifier on non-forced refreshes), and reconnect if the leader
    /// address changed or `force` is set.
    async fn update_metadata_and_connection(&mut self, force: bool) -> Result<()> {
        let core = Arc::clone(&self.core);
        info!(topic = %core.topic, force, "updating metadata");

        let snapshot = core.fetcher.fetch(&core.topic).await?;
        let topic = snapshot
            .topic(&core.topic)
            .ok_or_else(|| Error::Metadata(format!("topic '{}' missing from metadata", core.topic)))?;
        let num_partitions = topic.num_partitions() as u32;
        if num_partitions == 0 {
            return Err(Error::Metadata(format!(
                "topic '{}' has no partitions",
                core.topic
            )));
        }

        if core.rotate_partitions && !force {
            self.partition_modifier = (self.partition_modifier + 1) % num_partitions;
            self.last_correlation_id = self.correlation_id;
        }
        self.partition = ((core.key_hash.wrapping_add(self.partition_modifier)) % num_partitions) as i32;

        let leader = topic.leader(self.partition).ok_or_else(|| {
            Error::Metadata(format!(
                "partition {} of '{}' has no leader",
                self.partition, core.topic
            ))
        })?;
        let endpoint = snapshot
            .broker(leader)
            .ok_or_else(|| Error::Metadata(format!("broker {leader} missing from metadata")))?;
        let addr = format!("{}:{}", endpoint.host, endpoint.port);

        let reconnect = force || self.conn.as_ref().map(|c| c.addr() != addr).unwrap_or(true);
        if reconnect {
            info!(topic = %core.topic, partition = self.partition, %addr, "connecting to partition leader");
            self.conn =
                Some(Connection::connect(&addr, core.send_buffer_size, core.read_timeout).await?);
        }

        self.metadata = Some(snapshot);
        self.last_refresh = Instant::now();
        Ok(())
    }

    fn should_refresh(&self) -> bool {
        let core = &self.core;
        let elapsed = self.last_refresh.elapsed();

        let time_based = core.metadata_refresh_interval_ms >= 0
            && elapsed >= Duration::from_millis(core.metadata_refresh_interval_ms as u64);
        let quick = core.quick_rotate
            && i64::from(self.correlation_id.wrapping_sub(self.last_correlation_id))
                > core.quick_rotate_message_blocks
            && elapsed > QUICK_ROTATE_REFRESH_FLOOR;

        time_based || quick
    }
}

fn spawn_sender(core: &Arc<Core>) -> JoinHandle<()> {
    let worker = SendWorker::new(Arc::clone(core));
    tokio::spawn(worker.run())
}

fn spawn_flush_tick(core: &Arc<Core>, period: Duration) -> JoinHandle<()> {
    let core = Arc::clone(core);
    tokio::spawn(async move {
        let start = tokio::time::Instant::now() + period;
        let mut tick = tokio::time::interval_at(start, period);
        loop {
            tick.tick().await;
            if core.closed.load(Ordering::SeqCst) {
                break;
            }
            if let Err(e) = core.ingest(None).await {
                debug!(topic = %core.topic, error = %e, "flush tick failed");
            }
        }
    })
}

fn spawn_supervisor(core: &Arc<Core>) -> JoinHandle<()> {
    let core = Arc::clone(core);
    tokio::spawn(async move {
        let start = tokio::time::Instant::now() + SUPERVISOR_INTERVAL;
        let mut tick = tokio::time::interval_at(start, SUPERVISOR_INTERVAL);
        loop {
            tick.tick().await;
            if core.closed.load(Ordering::SeqCst) {
                break;
            }
            let dead = core
                .sender_handle
                .lock()
                .as_ref()
                .map(|h| h.is_finished())
                .unwrap_or(true);
            if dead {
                error!(topic = %core.topic, "sender task is dead, restarting it");
                let handle = spawn_sender(&core);
                *core.sender_handle.lock() = Some(handle);
            }
        }
    })
}

/// A stable in-process hash of the partitioning key.
fn stable_key_hash(key: &[u8]) -> u32 {
    use std::hash::Hasher;
    let mut hasher = std::collections::hash_map::DefaultHasher::new();
    hasher.write(key);
    (hasher.finish() & 0x7fff_ffff) as u32
}

/// Asynchronous producer for a single (topic, key) pair.
///
/// Construct with [`Producer::builder`] from inside a tokio runtime; the
/// builder spawns the sender task and the periodic flush/supervisor tasks.
///
/// ```no_run
/// # async fn example() -> lofka::Result<()> {
/// use lofka::{Producer, ProducerConfig};
///
/// let config = ProducerConfig {
///     metadata_broker_list: vec!["broker-1:9092".to_owned()],
///     ..ProducerConfig::default()
/// };
/// let producer = Producer::builder(config, "my-service", "events", "my-key").build()?;
///
/// producer.send(b"hello").await?;
/// producer.close().await;
/// # Ok(())
/// # }
/// ```
pub struct Producer {
    core: Arc<Core>,
    flush_task: SyncMutex<Option<JoinHandle<()>>>,
    supervisor_task: SyncMutex<Option<JoinHandle<()>>>,
}

pub struct ProducerBuilder {
    config: ProducerConfig,
    client_id: String,
    topic: String,
    key: String,
    rotate_partitions: bool,
    quick_rotate: bool,
    quick_rotate_message_blocks: i64,
    metrics: Option<MetricsRegistry>,
    fetcher: Option<Arc<dyn MetadataFetcher>>,
}

impl ProducerBuilder {
    /// Advance to the next partition on every non-forced metadata refresh.
    pub fn rotate_partitions(mut self, rotate: bool) -> Self {
        self.rotate_partitions = rotate;
        self
    }

    /// Additionally trigger refreshes after `message_blocks` requests
    /// (floored at thirty seconds apart).
    pub fn quick_rotate(mut self, message_blocks: i64) -> Self {
        self.quick_rotate = true;
        self.quick_rotate_message_blocks = message_blocks;
        self
    }

    /// Report into `registry` instead of the process default.
    pub fn metrics(mut self, registry: MetricsRegistry) -> Self {
        self.metrics = Some(registry);
        self
    }

    /// Replace the wire metadata fetcher, e.g. with a fixture in tests.
    pub fn metadata_fetcher(mut self, fetcher: Arc<dyn MetadataFetcher>) -> Self {
        self.fetcher = Some(fetcher);
        self
    }

    pub fn build(self) -> Result<Producer> {
        self.config.validate()?;
        if self.client_id.len() > i16::MAX as usize {
            return Err(Error::InvalidConfig("client id too long".into()));
        }
        if self.topic.is_empty() || self.topic.len() > i16::MAX as usize {
            return Err(Error::InvalidConfig("topic must be 1..=32767 bytes".into()));
        }
        info!(topic = %self.topic, key = %self.key, "creating producer");

        let config = self.config;
        let metrics = self.metrics.unwrap_or_else(|| MetricsRegistry::global().clone());
        let meters = Meters::new(&metrics, &self.topic);

        let read_timeout = Duration::from_millis(config.request_timeout_ms.max(0) as u64 + 1000);

        let (pool, free_buffer_gauge) = if config.use_shared_buffers {
            let pool = shared_pool(config.num_buffers, config.message_buffer_size, &metrics);
            (pool, None)
        } else {
            let pool = BufferPool::new(config.num_buffers, config.message_buffer_size);
            let gauge_name = format!("producer:topics:{}:free buffers", self.topic);
            let gauge_pool = Arc::clone(&pool);
            metrics.register_gauge(&gauge_name, Box::new(move || gauge_pool.free_count() as u64));
            (pool, Some(gauge_name))
        };

        let (ready_tx, ready_rx) = mpsc::channel(config.num_buffers);

        let fetcher = self.fetcher.unwrap_or_else(|| {
            Arc::new(WireMetadataFetcher::new(
                config.metadata_broker_list.clone(),
                &self.client_id,
                read_timeout,
            ))
        });

        let key_hash = stable_key_hash(self.key.as_bytes());
        let template = RequestTemplate {
            client_id: self.client_id.into_bytes(),
            topic: self.topic.clone().into_bytes(),
            key: self.key.into_bytes(),
            required_acks: config.request_required_acks,
            timeout_ms: config.request_timeout_ms,
        };

        let core = Arc::new(Core {
            topic: self.topic,
            template,
            key_hash,
            codec: config.compression_codec,
            compression_level: config.compression_level,
            required_acks: config.request_required_acks,
            retries: config.message_send_max_retries,
            retry_backoff: Duration::from_millis(config.retry_backoff_ms),
            send_buffer_size: config.send_buffer_size,
            message_buffer_size: config.message_buffer_size,
            queue_enqueue_timeout_ms: config.queue_enqueue_timeout_ms,
            metadata_refresh_interval_ms: config.topic_metadata_refresh_interval_ms,
            read_timeout,
            rotate_partitions: self.rotate_partitions,
            quick_rotate: self.quick_rotate,
            quick_rotate_message_blocks: self.quick_rotate_message_blocks,
            pool,
            use_shared_buffers: config.use_shared_buffers,
            free_buffer_gauge,
            ready_tx,
            ready_rx: AsyncMutex::new(ready_rx),
            ingest: AsyncMutex::new(IngestState { active: None }),
            fetcher,
            metrics,
            meters,
            closed: AtomicBool::new(false),
            sender_handle: SyncMutex::new(None),
        });

        *core.sender_handle.lock() = Some(spawn_sender(&core));
        let flush_period = Duration::from_millis(config.queue_buffering_max_ms.max(1));
        let flush_task = spawn_flush_tick(&core, flush_period);
        let supervisor_task = spawn_supervisor(&core);

        Ok(Producer {
            core,
            flush_task: SyncMutex::new(Some(flush_task)),
            supervisor_task: SyncMutex::new(Some(supervisor_task)),
        })
    }
}

impl Producer {
    pub fn builder(
        config: ProducerConfig,
        client_id: impl Into<String>,
        topic: impl Into<String>,
        key: impl Into<String>,
    ) -> ProducerBuilder {
        ProducerBuilder {
            config,
            client_id: client_id.into(),
            topic: topic.into(),
            key: key.into(),
            rotate_partitions: false,
            quick_rotate: false,
            quick_rotate_message_blocks: 0,
            metrics: None,
            fetcher: None,
        }
    }

    /// Append `payload` to the current batch.
    ///
    /// Returns once the payload is buffered (or dropped: a full pool past
    /// the enqueue timeout drops the payload and bumps the queue-full
    /// meter). The only error a caller sees is a payload too large to ever
    /// fit a buffer. Sending on a closed producer is a logged no-op.
    pub async fn send(&self, payload: &[u8]) -> Result<()> {
        self.core.ingest(Some(payload)).await
    }

    /// Hand the current batch to the sender even if it is not full.
    pub async fn flush(&self) -> Result<()> {
        self.core.ingest(None).await
    }

    /// Close the producer: stop accepting payloads, flush the active
    /// buffer, and wait for the sender to drain.
    pub async fn close(&self) {
        info!(topic = %self.core.topic, "closing producer");
        self.core.closed.store(true, Ordering::SeqCst);

        {
            let mut state = self.core.ingest.lock().await;
            if let Some(buffer) = state.active.take() {
                // enqueued even when empty so the sender drains and exits
                self.core.enqueue(buffer).await;
            }
        }

        for task in [self.flush_task.lock().take(), self.supervisor_task.lock().take()]
            .into_iter()
            .flatten()
        {
            task.abort();
        }

        let sender = self.core.sender_handle.lock().take();
        if let Some(handle) = sender {
            if let Err(e) = handle.await {
                if !e.is_cancelled() {
                    error!(topic = %self.core.topic, error = %e, "sender task failed during close");
                }
            }
        }

        if !self.core.use_shared_buffers {
            if let Some(name) = &self.core.free_buffer_gauge {
                self.core.metrics.unregister(name);
            }
        }
    }

    /// The registry this producer reports into.
    pub fn metrics(&self) -> &MetricsRegistry {
        &self.core.metrics
    }
}

impl Drop for Producer {
    fn drop(&mut self) {
        for task in [
            self.flush_task.lock().take(),
            self.supervisor_task.lock().take(),
            self.core.sender_handle.lock().take(),
        ]
        .into_iter()
        .flatten()
        {
            task.abort();
        }
    }
}

impl std::fmt::Debug for Producer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Producer")
            .field("topic", &self.core.topic)
            .field("closed", &self.core.closed.load(Ordering::SeqCst))
            .finish_non_exhaustive()
    }
}
