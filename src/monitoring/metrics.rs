// Metric registry.
//
// Counters are monotonic; gauges are set/adjusted. Everything is an atomic
// integer behind a concurrent map, so recording from executor workers and
// lock waiters never blocks. Snapshots come out as structured records for
// the external monitoring shell.

use std::sync::atomic::{AtomicI64, AtomicU64, Ordering};
use std::sync::Arc;

use dashmap::DashMap;
use once_cell::sync::Lazy;
use serde::{Deserialize, Serialize};

// Counter names used by the engine. Gathered here so dashboards and tests
// reference one spelling.
pub mod names {
    pub const WAL_WRITES: &str = "wal.writes";
    pub const WAL_ERRORS: &str = "wal.errors";
    pub const WAL_SYNCS: &str = "wal.syncs";
    pub const WAL_SYNC_MICROS: &str = "wal.sync_micros";
    pub const WAL_ROTATIONS: &str = "wal.rotations";
    pub const TXN_STARTED: &str = "txn.started";
    pub const TXN_COMMITTED: &str = "txn.committed";
    pub const TXN_ABORTED: &str = "txn.aborted";
    pub const LOCK_TIMEOUTS: &str = "lock.deadlock_timeouts";
    pub const LOCK_WAIT_MICROS: &str = "lock.wait_micros";
    pub const CORRUPTION_EVENTS: &str = "corruption.events";
    pub const RECOVERY_ATTEMPTS: &str = "recovery.attempts";
    pub const RECOVERY_FAILURES: &str = "recovery.failures";
    pub const PLAN_CACHE_HITS: &str = "plan_cache.hits";
    pub const PLAN_CACHE_MISSES: &str = "plan_cache.misses";
    pub const STATEMENTS_EXECUTED: &str = "engine.statements";
    pub const DTXN_COMMITTED: &str = "dtxn.committed";
    pub const DTXN_ABORTED: &str = "dtxn.aborted";
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum MetricKind {
    Counter,
    Gauge,
}

/// One structured metric record, as consumed by external monitoring.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MetricRecord {
    pub name: String,
    pub kind: MetricKind,
    pub value: i64,
}

pub struct MetricsRegistry {
    counters: DashMap<String, Arc<AtomicU64>>,
    gauges: DashMap<String, Arc<AtomicI64>>,
}

impl MetricsRegistry {
    pub fn new() -> Self {
        Self {
            counters: DashMap::new(),
            gauges: DashMap::new(),
        }
    }

    fn counter(&self, name: &str) -> Arc<AtomicU64> {
        if let Some(c) = self.counters.get(name) {
            return Arc::clone(&c);
        }
        self.counters
            .entry(name.to_string())
            .or_insert_with(|| Arc::new(AtomicU64::new(0)))
            .clone()
    }

    pub fn incr(&self, name: &str) {
        self.counter(name).fetch_add(1, Ordering::Relaxed);
    }

    pub fn incr_by(&self, name: &str, delta: u64) {
        self.counter(name).fetch_add(delta, Ordering::Relaxed);
    }

    pub fn get(&self, name: &str) -> u64 {
        self.counters
            .get(name)
            .map(|c| c.load(Ordering::Relaxed))
            .unwrap_or(0)
    }

    pub fn gauge_set(&self, name: &str, value: i64) {
        if let Some(g) = self.gauges.get(name) {
            g.store(value, Ordering::Relaxed);
            return;
        }
        self.gauges
            .entry(name.to_string())
            .or_insert_with(|| Arc::new(AtomicI64::new(0)))
            .store(value, Ordering::Relaxed);
    }

    pub fn gauge(&self, name: &str) -> i64 {
        self.gauges
            .get(name)
            .map(|g| g.load(Ordering::Relaxed))
            .unwrap_or(0)
    }

    /// Structured snapshot of every metric, sorted by name.
    pub fn snapshot(&self) -> Vec<MetricRecord> {
        let mut records: Vec<MetricRecord> = self
            .counters
            .iter()
            .map(|e| MetricRecord {
                name: e.key().clone(),
                kind: MetricKind::Counter,
                value: e.value().load(Ordering::Relaxed) as i64,
            })
            .chain(self.gauges.iter().map(|e| MetricRecord {
                name: e.key().clone(),
                kind: MetricKind::Gauge,
                value: e.value().load(Ordering::Relaxed),
            }))
            .collect();
        records.sort_by(|a, b| a.name.cmp(&b.name));
        records
    }
}

impl Default for MetricsRegistry {
    fn default() -> Self {
        Self::new()
    }
}

static REGISTRY: Lazy<MetricsRegistry> = Lazy::new(MetricsRegistry::new);

/// Process-wide registry.
pub fn metrics() -> &'static MetricsRegistry {
    &REGISTRY
}
