//! End-to-end producer scenarios against an in-process broker.
//!
//! The broker speaks just enough of the 0.8 wire protocol to answer
//! metadata requests (pointing the producer back at itself) and to capture,
//! verify, and acknowledge produce requests.

use std::io::Read;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};

use lofka::{CompressionCodec, MetricsRegistry, Producer, ProducerConfig};

const TOPIC: &str = "events";
const KEY: &[u8] = b"key";

/// key/value/attributes triple of one decoded record.
type Record = (Vec<u8>, Vec<u8>, i8);

#[derive(Debug, Clone)]
struct ProduceCapture {
    correlation_id: i32,
    partition: i32,
    acks: i16,
    records: Vec<Record>,
}

#[derive(Debug, Clone, Copy, Default)]
struct Behavior {
    /// Close the connection after reading this many produce requests,
    /// without replying.
    drop_first_produces: usize,
    /// Never reply to produce requests, keeping the connection open.
    hang_produces: bool,
    /// Reply with a correlation id that does not match.
    stale_correlation: bool,
}

#[derive(Debug, Default)]
struct BrokerState {
    behavior: Behavior,
    produce_requests: Mutex<Vec<ProduceCapture>>,
    produces_seen: AtomicUsize,
}

impl BrokerState {
    fn captures(&self) -> Vec<ProduceCapture> {
        self.produce_requests.lock().unwrap().clone()
    }
}

async fn spawn_broker(behavior: Behavior) -> (String, Arc<BrokerState>) {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    let state = Arc::new(BrokerState {
        behavior,
        ..BrokerState::default()
    });

    let accept_state = Arc::clone(&state);
    tokio::spawn(async move {
        loop {
            let (socket, _) = match listener.accept().await {
                Ok(conn) => conn,
                Err(_) => return,
            };
            tokio::spawn(serve_connection(
                socket,
                Arc::clone(&accept_state),
                addr.ip().to_string(),
                addr.port() as i32,
            ));
        }
    });

    (addr.to_string(), state)
}

async fn serve_connection(
    mut socket: TcpStream,
    state: Arc<BrokerState>,
    host: String,
    port: i32,
) {
    loop {
        let mut size = [0u8; 4];
        if socket.read_exact(&mut size).await.is_err() {
            return;
        }
        let size = i32::from_be_bytes(size) as usize;
        let mut body = vec![0u8; size];
        if socket.read_exact(&mut body).await.is_err() {
            return;
        }

        let api_key = i16::from_be_bytes([body[0], body[1]]);
        match api_key {
            3 => {
                let (correlation_id, topic) = parse_metadata_request(&body);
                let response = metadata_response(correlation_id, &topic, &host, port);
                if socket.write_all(&frame(response)).await.is_err() {
                    return;
                }
            }
            0 => {
                let capture = parse_produce_request(&body);
                state.produce_requests.lock().unwrap().push(capture.clone());
                let seen = state.produces_seen.fetch_add(1, Ordering::SeqCst);

                if seen < state.behavior.drop_first_produces {
                    return;
                }
                if state.behavior.hang_produces {
                    tokio::time::sleep(Duration::from_secs(3600)).await;
                    return;
                }
                if capture.acks != 0 {
                    let correlation_id = if state.behavior.stale_correlation {
                        capture.correlation_id - 100
                    } else {
                        capture.correlation_id
                    };
                    let response = produce_response(correlation_id, TOPIC, capture.partition);
                    if socket.write_all(&frame(response)).await.is_err() {
                        return;
                    }
                }
            }
            other => panic!("unexpected api key {other}"),
        }
    }
}

// --- wire helpers -----------------------------------------------------------

struct Cursor<'a> {
    buf: &'a [u8],
    pos: usize,
}

impl<'a> Cursor<'a> {
    fn new(buf: &'a [u8]) -> Self {
        Self { buf, pos: 0 }
    }

    fn bytes(&mut self, n: usize) -> &'a [u8] {
        let slice = &self.buf[self.pos..self.pos + n];
        self.pos += n;
        slice
    }

    fn i8(&mut self) -> i8 {
        self.bytes(1)[0] as i8
    }

    fn i16(&mut self) -> i16 {
        i16::from_be_bytes(self.bytes(2).try_into().unwrap())
    }

    fn i32(&mut self) -> i32 {
        i32::from_be_bytes(self.bytes(4).try_into().unwrap())
    }

    fn i64(&mut self) -> i64 {
        i64::from_be_bytes(self.bytes(8).try_into().unwrap())
    }

    fn string(&mut self) -> String {
        let len = self.i16() as usize;
        String::from_utf8(self.bytes(len).to_vec()).unwrap()
    }

    fn remaining(&self) -> usize {
        self.buf.len() - self.pos
    }
}

fn put_i16(out: &mut Vec<u8>, v: i16) {
    out.extend_from_slice(&v.to_be_bytes());
}

fn put_i32(out: &mut Vec<u8>, v: i32) {
    out.extend_from_slice(&v.to_be_bytes());
}

fn put_i64(out: &mut Vec<u8>, v: i64) {
    out.extend_from_slice(&v.to_be_bytes());
}

fn put_string(out: &mut Vec<u8>, s: &str) {
    put_i16(out, s.len() as i16);
    out.extend_from_slice(s.as_bytes());
}

fn frame(body: Vec<u8>) -> Vec<u8> {
    let mut framed = Vec::with_capacity(body.len() + 4);
    put_i32(&mut framed, body.len() as i32);
    framed.extend_from_slice(&body);
    framed
}

fn parse_metadata_request(body: &[u8]) -> (i32, String) {
    let mut cur = Cursor::new(body);
    assert_eq!(cur.i16(), 3); // api key
    assert_eq!(cur.i16(), 0); // api version
    let correlation_id = cur.i32();
    let _client_id = cur.string();
    assert_eq!(cur.i32(), 1); // topic count
    let topic = cur.string();
    (correlation_id, topic)
}

/// One broker (this one), one topic, one partition led by it.
fn metadata_response(correlation_id: i32, topic: &str, host: &str, port: i32) -> Vec<u8> {
    let mut out = vec![];
    put_i32(&mut out, correlation_id);
    put_i32(&mut out, 1); // brokers
    put_i32(&mut out, 0); // node id
    put_string(&mut out, host);
    put_i32(&mut out, port);
    put_i32(&mut out, 1); // topics
    put_i16(&mut out, 0); // topic error
    put_string(&mut out, topic);
    put_i32(&mut out, 1); // partitions
    put_i16(&mut out, 0); // partition error
    put_i32(&mut out, 0); // partition id
    put_i32(&mut out, 0); // leader
    put_i32(&mut out, 1); // replicas
    put_i32(&mut out, 0);
    put_i32(&mut out, 1); // isr
    put_i32(&mut out, 0);
    out
}

fn produce_response(correlation_id: i32, topic: &str, partition: i32) -> Vec<u8> {
    let mut out = vec![];
    put_i32(&mut out, correlation_id);
    put_i32(&mut out, 1);
    put_string(&mut out, topic);
    put_i32(&mut out, 1);
    put_i32(&mut out, partition);
    put_i16(&mut out, 0); // error code
    put_i64(&mut out, 0); // base offset
    out
}

fn parse_produce_request(body: &[u8]) -> ProduceCapture {
    let mut cur = Cursor::new(body);
    assert_eq!(cur.i16(), 0); // api key
    assert_eq!(cur.i16(), 0); // api version
    let correlation_id = cur.i32();
    let _client_id = cur.string();
    let acks = cur.i16();
    let _timeout = cur.i32();
    assert_eq!(cur.i32(), 1); // topic count
    assert_eq!(cur.string(), TOPIC);
    assert_eq!(cur.i32(), 1); // partition count
    let partition = cur.i32();
    let set_size = cur.i32() as usize;
    let set = cur.bytes(set_size);
    assert_eq!(cur.remaining(), 0, "trailing request bytes");

    ProduceCapture {
        correlation_id,
        partition,
        acks,
        records: parse_message_set(set),
    }
}

/// Decode a message set, verifying every stored CRC. Compressed outer
/// records are unwrapped and their inner sets inlined.
fn parse_message_set(set: &[u8]) -> Vec<Record> {
    let mut records = vec![];
    let mut cur = Cursor::new(set);
    while cur.remaining() > 0 {
        let _offset = cur.i64();
        let size = cur.i32() as usize;
        let record = cur.bytes(size);

        let stored_crc = u32::from_be_bytes(record[0..4].try_into().unwrap());
        assert_eq!(stored_crc, crc32fast::hash(&record[4..]), "record crc");

        let mut rec = Cursor::new(&record[4..]);
        let magic = rec.i8();
        assert_eq!(magic, 0);
        let attrs = rec.i8();
        let key_len = rec.i32() as usize;
        let key = rec.bytes(key_len).to_vec();
        let value_len = rec.i32() as usize;
        let value = rec.bytes(value_len).to_vec();

        match attrs {
            0 => records.push((key, value, 0)),
            1 => {
                let mut inner = vec![];
                flate2::read::GzDecoder::new(value.as_slice())
                    .read_to_end(&mut inner)
                    .unwrap();
                for (k, v, _) in parse_message_set(&inner) {
                    records.push((k, v, 1));
                }
            }
            other => panic!("unexpected attributes byte {other}"),
        }
    }
    records
}

// --- scenarios --------------------------------------------------------------

fn base_config(addr: &str) -> ProducerConfig {
    ProducerConfig {
        metadata_broker_list: vec![addr.to_owned()],
        request_timeout_ms: 10_000,
        message_send_max_retries: 2,
        retry_backoff_ms: 50,
        send_buffer_size: 8192,
        message_buffer_size: 4096,
        num_buffers: 2,
        queue_enqueue_timeout_ms: -1,
        // keep the periodic machinery quiet unless a test wants it
        queue_buffering_max_ms: 60_000,
        topic_metadata_refresh_interval_ms: 600_000,
        ..ProducerConfig::default()
    }
}

fn meter(registry: &MetricsRegistry, what: &str) -> u64 {
    registry.meter(&format!("producer:topics:{TOPIC}:messages {what}")).count()
}

async fn wait_until(what: &str, mut cond: impl FnMut() -> bool) {
    let deadline = Duration::from_secs(10);
    let start = Instant::now();
    while !cond() {
        assert!(start.elapsed() < deadline, "timed out waiting for {what}");
        tokio::time::sleep(Duration::from_millis(20)).await;
    }
}

/// Size of one framed record with the test key.
fn record_size(value_len: usize) -> usize {
    value_len + KEY.len() + 26
}

#[tokio::test]
async fn test_single_record_acks_one() {
    let (addr, broker) = spawn_broker(Behavior::default()).await;
    let registry = MetricsRegistry::new();

    let producer = Producer::builder(base_config(&addr), "client", TOPIC, "key")
        .metrics(registry.clone())
        .build()
        .unwrap();

    producer.send(b"hello").await.unwrap();
    producer.flush().await.unwrap();

    wait_until("one produce request", || broker.captures().len() == 1).await;
    let capture = &broker.captures()[0];
    assert_eq!(capture.partition, 0);
    assert_eq!(capture.acks, 1);
    assert_eq!(capture.records, vec![(KEY.to_vec(), b"hello".to_vec(), 0)]);

    wait_until("sent meter", || meter(&registry, "sent") == 1).await;
    assert_eq!(meter(&registry, "received"), 1);
    assert_eq!(meter(&registry, "dropped (send failure)"), 0);

    producer.close().await;
}

#[tokio::test]
async fn test_batching_by_capacity() {
    let (addr, broker) = spawn_broker(Behavior::default()).await;
    let registry = MetricsRegistry::new();

    // room for exactly three "hello" records
    let config = ProducerConfig {
        message_buffer_size: 3 * record_size(5),
        ..base_config(&addr)
    };
    let producer = Producer::builder(config, "client", TOPIC, "key")
        .metrics(registry.clone())
        .build()
        .unwrap();

    for _ in 0..4 {
        producer.send(b"hello").await.unwrap();
    }
    producer.flush().await.unwrap();

    wait_until("two produce requests", || broker.captures().len() == 2).await;
    let captures = broker.captures();
    assert_eq!(captures[0].records.len(), 3);
    assert_eq!(captures[1].records.len(), 1);

    wait_until("sent meter", || meter(&registry, "sent") == 4).await;
    assert_eq!(meter(&registry, "received"), 4);

    producer.close().await;
}

#[tokio::test]
async fn test_queue_full_drops_when_sender_stalled() {
    let (addr, _broker) = spawn_broker(Behavior {
        hang_produces: true,
        ..Behavior::default()
    })
    .await;
    let registry = MetricsRegistry::new();

    let config = ProducerConfig {
        message_buffer_size: record_size(5),
        num_buffers: 1,
        queue_enqueue_timeout_ms: 0,
        ..base_config(&addr)
    };
    let producer = Producer::builder(config, "client", TOPIC, "key")
        .metrics(registry.clone())
        .build()
        .unwrap();

    // fills the only buffer
    producer.send(b"hello").await.unwrap();
    // rotates it out; no free buffer is left, so this one drops
    producer.send(b"hello").await.unwrap();
    // and so does everything after it while the sender hangs
    producer.send(b"hello").await.unwrap();

    assert_eq!(meter(&registry, "received"), 3);
    assert_eq!(meter(&registry, "dropped (queue full)"), 2);
    assert_eq!(meter(&registry, "sent"), 0);

    // the sender is wedged mid-request; drop instead of close
    drop(producer);
}

#[tokio::test]
async fn test_retry_after_transient_failure() {
    let (addr, broker) = spawn_broker(Behavior {
        drop_first_produces: 1,
        ..Behavior::default()
    })
    .await;
    let registry = MetricsRegistry::new();

    let producer = Producer::builder(base_config(&addr), "client", TOPIC, "key")
        .metrics(registry.clone())
        .build()
        .unwrap();

    producer.send(b"hello").await.unwrap();
    producer.flush().await.unwrap();

    wait_until("retried send", || meter(&registry, "sent") == 1).await;
    assert_eq!(broker.produces_seen.load(Ordering::SeqCst), 2);
    assert_eq!(meter(&registry, "dropped (send failure)"), 0);

    // both attempts carried the same batch
    let captures = broker.captures();
    assert_eq!(captures[0].records, captures[1].records);
    assert_eq!(captures[0].correlation_id, captures[1].correlation_id);

    producer.close().await;
}

#[tokio::test]
async fn test_correlation_mismatch_drops_batch() {
    let (addr, broker) = spawn_broker(Behavior {
        stale_correlation: true,
        ..Behavior::default()
    })
    .await;
    let registry = MetricsRegistry::new();

    let config = ProducerConfig {
        message_send_max_retries: 1,
        retry_backoff_ms: 20,
        ..base_config(&addr)
    };
    let producer = Producer::builder(config, "client", TOPIC, "key")
        .metrics(registry.clone())
        .build()
        .unwrap();

    producer.send(b"hello").await.unwrap();
    producer.flush().await.unwrap();

    wait_until("batch dropped", || meter(&registry, "dropped (send failure)") == 1).await;
    // initial attempt plus one retry
    assert_eq!(broker.produces_seen.load(Ordering::SeqCst), 2);
    assert_eq!(meter(&registry, "sent"), 0);

    producer.close().await;
}

#[tokio::test]
async fn test_flush_tick_bounds_latency() {
    let (addr, broker) = spawn_broker(Behavior::default()).await;
    let registry = MetricsRegistry::new();

    let config = ProducerConfig {
        queue_buffering_max_ms: 100,
        ..base_config(&addr)
    };
    let producer = Producer::builder(config, "client", TOPIC, "key")
        .metrics(registry.clone())
        .build()
        .unwrap();

    // no explicit flush; the timer must move the batch along
    producer.send(b"hello").await.unwrap();

    wait_until("flushed by timer", || broker.captures().len() == 1).await;
    assert_eq!(broker.captures()[0].records.len(), 1);

    producer.close().await;
}

#[tokio::test]
async fn test_gzip_end_to_end() {
    let (addr, broker) = spawn_broker(Behavior::default()).await;
    let registry = MetricsRegistry::new();

    let config = ProducerConfig {
        compression_codec: CompressionCodec::Gzip,
        compression_level: 6,
        ..base_config(&addr)
    };
    let producer = Producer::builder(config, "client", TOPIC, "key")
        .metrics(registry.clone())
        .build()
        .unwrap();

    producer.send(b"hello").await.unwrap();
    producer.send(b"world").await.unwrap();
    producer.flush().await.unwrap();

    wait_until("compressed produce request", || broker.captures().len() == 1).await;
    let capture = &broker.captures()[0];
    assert_eq!(
        capture.records,
        vec![
            (KEY.to_vec(), b"hello".to_vec(), 1),
            (KEY.to_vec(), b"world".to_vec(), 1),
        ]
    );

    wait_until("sent meter", || meter(&registry, "sent") == 2).await;
    producer.close().await;
}

#[tokio::test]
async fn test_acks_zero_skips_response_path() {
    let (addr, broker) = spawn_broker(Behavior::default()).await;
    let registry = MetricsRegistry::new();

    let config = ProducerConfig {
        request_required_acks: 0,
        ..base_config(&addr)
    };
    let producer = Producer::builder(config, "client", TOPIC, "key")
        .metrics(registry.clone())
        .build()
        .unwrap();

    producer.send(b"hello").await.unwrap();
    producer.flush().await.unwrap();

    // the broker never replies to acks=0, yet the batch counts as sent
    wait_until("sent meter", || meter(&registry, "sent") == 1).await;
    wait_until("request observed", || broker.captures().len() == 1).await;
    assert_eq!(broker.captures()[0].acks, 0);

    producer.close().await;
}

#[tokio::test]
async fn test_close_flushes_active_batch() {
    let (addr, broker) = spawn_broker(Behavior::default()).await;
    let registry = MetricsRegistry::new();

    let producer = Producer::builder(base_config(&addr), "client", TOPIC, "key")
        .metrics(registry.clone())
        .build()
        .unwrap();

    producer.send(b"hello").await.unwrap();
    producer.close().await;

    // close() hands the active buffer to the sender and waits for it
    assert_eq!(broker.captures().len(), 1);
    assert_eq!(meter(&registry, "sent"), 1);
}
