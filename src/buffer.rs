//! Message-set buffers and the bounded pool that owns them.
//!
//! Every buffer is allocated once, at pool construction, and afterwards
//! only moves between four owners: the free pool, the ingest path (as the
//! active buffer), the ready queue, and the sender. Returning a buffer to
//! the pool resets its cursor and batch counter.

use std::sync::{Arc, OnceLock};
use std::time::Duration;

use parking_lot::Mutex;
use tokio::sync::Semaphore;

use crate::error::Result;
use crate::metrics::MetricsRegistry;
use crate::protocol::wire::WireBuf;
use crate::protocol::{MAGIC_BYTE, NO_COMPRESSION};

/// Bytes of framing around each record: 8 offset + 4 size + 4 crc + 1 magic
/// + 1 attributes + 4 key length + 4 value length.
pub const RECORD_OVERHEAD: usize = 26;

/// Gauge name for the process-shared pool.
pub const SHARED_FREE_BUFFERS_GAUGE: &str = "producer:shared free buffers";

/// A fixed byte region accumulating framed records until it is sent.
#[derive(Debug)]
pub struct MessageSetBuffer {
    buf: WireBuf,
    batch_count: usize,
}

impl MessageSetBuffer {
    pub fn new(capacity: usize) -> Self {
        Self {
            buf: WireBuf::with_capacity(capacity),
            batch_count: 0,
        }
    }

    pub fn capacity(&self) -> usize {
        self.buf.capacity()
    }

    pub fn remaining(&self) -> usize {
        self.buf.remaining()
    }

    /// Bytes accumulated so far.
    pub fn len(&self) -> usize {
        self.buf.position()
    }

    pub fn is_empty(&self) -> bool {
        self.batch_count == 0
    }

    /// Number of records appended since the last reset.
    pub fn batch_count(&self) -> usize {
        self.batch_count
    }

    pub fn bytes(&self) -> &[u8] {
        self.buf.bytes()
    }

    pub fn reset(&mut self) {
        self.buf.clear();
        self.batch_count = 0;
    }

    /// Append one v0-framed record. The caller must have checked capacity:
    /// `value.len() + key.len() + RECORD_OVERHEAD <= remaining()`.
    pub fn append_record(&mut self, key: &[u8], value: &[u8]) -> Result<()> {
        let buf = &mut self.buf;

        buf.put_i64(0)?;
        buf.put_i32((value.len() + key.len() + 14) as i32)?;

        let crc_pos = buf.reserve_i32()?;
        buf.put_i8(MAGIC_BYTE)?;
        buf.put_i8(NO_COMPRESSION)?;
        buf.put_i32(key.len() as i32)?;
        buf.put_slice(key)?;
        buf.put_i32(value.len() as i32)?;
        buf.put_slice(value)?;

        let mut crc = crc32fast::Hasher::new();
        crc.update(buf.slice(crc_pos + 4, buf.position()));
        buf.patch_i32(crc_pos, crc.finalize() as i32);

        self.batch_count += 1;
        Ok(())
    }
}

/// Bounded pool of free [`MessageSetBuffer`]s.
///
/// `take` suspends until a buffer is free or the enqueue timeout elapses;
/// `release` resets the buffer and hands it back. The free count is exposed
/// for the free-buffer gauges.
#[derive(Debug)]
pub struct BufferPool {
    slots: Mutex<Vec<MessageSetBuffer>>,
    free: Semaphore,
}

impl BufferPool {
    pub fn new(num_buffers: usize, buffer_capacity: usize) -> Arc<Self> {
        let slots = (0..num_buffers)
            .map(|_| MessageSetBuffer::new(buffer_capacity))
            .collect();
        Arc::new(Self {
            slots: Mutex::new(slots),
            free: Semaphore::new(num_buffers),
        })
    }

    /// Take a free buffer.
    ///
    /// `timeout_ms < 0` blocks until one is free, `0` never blocks, a
    /// positive value waits at most that long. Returns `None` on timeout.
    pub async fn take(&self, timeout_ms: i64) -> Option<MessageSetBuffer> {
        let permit = if timeout_ms < 0 {
            self.free.acquire().await.ok()?
        } else if timeout_ms == 0 {
            self.free.try_acquire().ok()?
        } else {
            tokio::time::timeout(
                Duration::from_millis(timeout_ms as u64),
                self.free.acquire(),
            )
            .await
            .ok()?
            .ok()?
        };
        permit.forget();

        Some(self.slots.lock().pop().expect("pool permit without a slot"))
    }

    pub fn release(&self, mut buffer: MessageSetBuffer) {
        buffer.reset();
        self.slots.lock().push(buffer);
        self.free.add_permits(1);
    }

    pub fn free_count(&self) -> usize {
        self.slots.lock().len()
    }
}

/// The process-shared pool, lazily created by the first producer configured
/// with `use_shared_buffers`. That producer's sizing wins and its registry
/// receives the shared free-buffer gauge.
pub fn shared_pool(
    num_buffers: usize,
    buffer_capacity: usize,
    registry: &MetricsRegistry,
) -> Arc<BufferPool> {
    static SHARED: OnceLock<Arc<BufferPool>> = OnceLock::new();

    Arc::clone(SHARED.get_or_init(|| {
        let pool = BufferPool::new(num_buffers, buffer_capacity);
        let gauge_pool = Arc::clone(&pool);
        registry.register_gauge(
            SHARED_FREE_BUFFERS_GAUGE,
            Box::new(move || gauge_pool.free_count() as u64),
        );
        pool
    }))
}
