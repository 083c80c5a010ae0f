//! Lightweight metrics sink.
//!
//! The producer reports meters (monotonic counters) and gauges (sampled
//! suppliers) into a [`MetricsRegistry`]. Hosts that already carry their own
//! registry can keep a handle and read the counters out; everyone else gets
//! the process-wide default.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, OnceLock};

use parking_lot::Mutex;
use tracing::warn;

pub type GaugeFn = Box<dyn Fn() -> u64 + Send + Sync>;

/// A monotonic event counter. Cloning yields another handle onto the same
/// counter.
#[derive(Debug, Clone, Default)]
pub struct Meter(Arc<AtomicU64>);

impl Meter {
    pub fn mark(&self) {
        self.mark_n(1);
    }

    pub fn mark_n(&self, n: u64) {
        self.0.fetch_add(n, Ordering::Relaxed);
    }

    pub fn count(&self) -> u64 {
        self.0.load(Ordering::Relaxed)
    }
}

#[derive(Default)]
struct Inner {
    meters: Mutex<HashMap<String, Meter>>,
    gauges: Mutex<HashMap<String, GaugeFn>>,
}

/// Registry of named meters and gauges. Cheap to clone; all clones share
/// state.
#[derive(Clone, Default)]
pub struct MetricsRegistry {
    inner: Arc<Inner>,
}

impl MetricsRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// The process-wide registry used when a producer is built without an
    /// explicit one.
    pub fn global() -> &'static MetricsRegistry {
        static GLOBAL: OnceLock<MetricsRegistry> = OnceLock::new();
        GLOBAL.get_or_init(MetricsRegistry::new)
    }

    /// Get or create the meter registered under `name`.
    pub fn meter(&self, name: &str) -> Meter {
        let mut meters = self.inner.meters.lock();
        if let Some(meter) = meters.get(name) {
            return meter.clone();
        }
        let meter = Meter::default();
        meters.insert(name.to_owned(), meter.clone());
        meter
    }

    /// Register a gauge supplier under `name`. If the name is taken the
    /// existing gauge is kept.
    pub fn register_gauge(&self, name: &str, supplier: GaugeFn) {
        let mut gauges = self.inner.gauges.lock();
        if gauges.contains_key(name) {
            warn!(name, "gauge already exists, keeping the registered one");
            return;
        }
        gauges.insert(name.to_owned(), supplier);
    }

    /// Sample the gauge registered under `name`.
    pub fn gauge_value(&self, name: &str) -> Option<u64> {
        self.inner.gauges.lock().get(name).map(|supplier| supplier())
    }

    /// Remove the meter and/or gauge registered under `name`.
    pub fn unregister(&self, name: &str) {
        self.inner.meters.lock().remove(name);
        self.inner.gauges.lock().remove(name);
    }
}

impl std::fmt::Debug for MetricsRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MetricsRegistry")
            .field("meters", &self.inner.meters.lock().len())
            .field("gauges", &self.inner.gauges.lock().len())
            .finish()
    }
}
