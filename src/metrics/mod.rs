//! Metrics for the synchronization core
//!
//! A small in-process registry of counters, gauges and latency histograms.
//! The orchestrator and the reconciliation worker record into it; embedders
//! export it as JSON or Prometheus text.

use std::collections::BTreeMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use tokio::sync::RwLock;

/// Metric registry shared by every component of one deployment
pub struct MetricsRegistry {
    counters: RwLock<BTreeMap<String, Arc<AtomicU64>>>,
    gauges: RwLock<BTreeMap<String, Arc<AtomicU64>>>,
    histograms: RwLock<BTreeMap<String, Arc<Histogram>>>,
    start_time: Instant,
}

impl MetricsRegistry {
    pub fn new() -> Self {
        Self {
            counters: RwLock::new(BTreeMap::new()),
            gauges: RwLock::new(BTreeMap::new()),
            histograms: RwLock::new(BTreeMap::new()),
            start_time: Instant::now(),
        }
    }

    pub async fn inc_counter(&self, name: &str) {
        self.add_counter(name, 1).await;
    }

    pub async fn add_counter(&self, name: &str, value: u64) {
        if let Some(counter) = self.counters.read().await.get(name) {
            counter.fetch_add(value, Ordering::Relaxed);
            return;
        }
        self.counters
            .write()
            .await
            .entry(name.to_string())
            .or_insert_with(|| Arc::new(AtomicU64::new(0)))
            .fetch_add(value, Ordering::Relaxed);
    }

    pub async fn get_counter(&self, name: &str) -> u64 {
        self.counters
            .read()
            .await
            .get(name)
            .map(|c| c.load(Ordering::Relaxed))
            .unwrap_or(0)
    }

    pub async fn set_gauge(&self, name: &str, value: u64) {
        if let Some(gauge) = self.gauges.read().await.get(name) {
            gauge.store(value, Ordering::Relaxed);
            return;
        }
        self.gauges
            .write()
            .await
            .insert(name.to_string(), Arc::new(AtomicU64::new(value)));
    }

    pub async fn get_gauge(&self, name: &str) -> u64 {
        self.gauges
            .read()
            .await
            .get(name)
            .map(|g| g.load(Ordering::Relaxed))
            .unwrap_or(0)
    }

    /// Record a latency observation
    pub async fn observe_duration(&self, name: &str, elapsed: Duration) {
        if let Some(histogram) = self.histograms.read().await.get(name) {
            histogram.observe(elapsed);
            return;
        }
        self.histograms
            .write()
            .await
            .entry(name.to_string())
            .or_insert_with(|| Arc::new(Histogram::default()))
            .observe(elapsed);
    }

    pub fn uptime_seconds(&self) -> u64 {
        self.start_time.elapsed().as_secs()
    }

    /// All metrics as JSON
    pub async fn to_json(&self) -> serde_json::Value {
        let counters: BTreeMap<String, u64> = self
            .counters
            .read()
            .await
            .iter()
            .map(|(k, v)| (k.clone(), v.load(Ordering::Relaxed)))
            .collect();
        let gauges: BTreeMap<String, u64> = self
            .gauges
            .read()
            .await
            .iter()
            .map(|(k, v)| (k.clone(), v.load(Ordering::Relaxed)))
            .collect();
        let histograms: BTreeMap<String, serde_json::Value> = self
            .histograms
            .read()
            .await
            .iter()
            .map(|(k, h)| (k.clone(), h.to_json()))
            .collect();

        serde_json::json!({
            "uptime_seconds": self.uptime_seconds(),
            "counters": counters,
            "gauges": gauges,
            "histograms": histograms,
        })
    }

    /// Prometheus text exposition
    pub async fn to_prometheus(&self) -> String {
        let mut output = String::new();
        output.push_str("# TYPE ledger_sync_uptime_seconds gauge\n");
        output.push_str(&format!(
            "ledger_sync_uptime_seconds {}\n",
            self.uptime_seconds()
        ));

        for (name, counter) in self.counters.read().await.iter() {
            let name = prometheus_name(name);
            output.push_str(&format!("# TYPE {} counter\n", name));
            output.push_str(&format!("{} {}\n", name, counter.load(Ordering::Relaxed)));
        }
        for (name, gauge) in self.gauges.read().await.iter() {
            let name = prometheus_name(name);
            output.push_str(&format!("# TYPE {} gauge\n", name));
            output.push_str(&format!("{} {}\n", name, gauge.load(Ordering::Relaxed)));
        }
        for (name, histogram) in self.histograms.read().await.iter() {
            output.push_str(&histogram.to_prometheus(&prometheus_name(name)));
        }
        output
    }
}

impl Default for MetricsRegistry {
    fn default() -> Self {
        Self::new()
    }
}

fn prometheus_name(name: &str) -> String {
    name.replace(['.', '-'], "_")
}

/// Fixed-bucket latency histogram
pub struct Histogram {
    /// Upper bounds in seconds
    buckets: Vec<f64>,
    counts: Vec<AtomicU64>,
    sum_micros: AtomicU64,
    count: AtomicU64,
}

impl Histogram {
    pub fn new(buckets: Vec<f64>) -> Self {
        let counts = buckets.iter().map(|_| AtomicU64::new(0)).collect();
        Self {
            buckets,
            counts,
            sum_micros: AtomicU64::new(0),
            count: AtomicU64::new(0),
        }
    }

    pub fn observe(&self, elapsed: Duration) {
        let micros = elapsed.as_micros().min(u64::MAX as u128) as u64;
        self.sum_micros.fetch_add(micros, Ordering::Relaxed);
        self.count.fetch_add(1, Ordering::Relaxed);

        let secs = elapsed.as_secs_f64();
        if let Some(i) = self.buckets.iter().position(|bound| secs <= *bound) {
            self.counts[i].fetch_add(1, Ordering::Relaxed);
        }
    }

    pub fn count(&self) -> u64 {
        self.count.load(Ordering::Relaxed)
    }

    fn sum_seconds(&self) -> f64 {
        self.sum_micros.load(Ordering::Relaxed) as f64 / 1_000_000.0
    }

    pub fn to_json(&self) -> serde_json::Value {
        let counts: Vec<u64> = self
            .counts
            .iter()
            .map(|c| c.load(Ordering::Relaxed))
            .collect();
        serde_json::json!({
            "buckets": self.buckets,
            "counts": counts,
            "sum": self.sum_seconds(),
            "count": self.count(),
        })
    }

    fn to_prometheus(&self, name: &str) -> String {
        let mut output = format!("# TYPE {} histogram\n", name);
        let mut cumulative = 0u64;
        for (bound, count) in self.buckets.iter().zip(&self.counts) {
            cumulative += count.load(Ordering::Relaxed);
            output.push_str(&format!("{}_bucket{{le=\"{}\"}} {}\n", name, bound, cumulative));
        }
        output.push_str(&format!("{}_bucket{{le=\"+Inf\"}} {}\n", name, self.count()));
        output.push_str(&format!("{}_sum {}\n", name, self.sum_seconds()));
        output.push_str(&format!("{}_count {}\n", name, self.count()));
        output
    }
}

impl Default for Histogram {
    fn default() -> Self {
        // Remote accounting APIs: tens of ms to tens of seconds
        Self::new(vec![
            0.01, 0.05, 0.1, 0.25, 0.5, 1.0, 2.5, 5.0, 10.0, 30.0,
        ])
    }
}

/// Predefined metric names
pub mod metric_names {
    // Reads
    pub const READS_CACHED: &str = "ledger_sync.reads.cached";
    pub const READS_REFRESHED: &str = "ledger_sync.reads.refreshed";
    pub const READS_DEGRADED: &str = "ledger_sync.reads.degraded";
    pub const READS_NOT_AVAILABLE: &str = "ledger_sync.reads.not_available";
    pub const LEASE_CONTENTION: &str = "ledger_sync.reads.lease_contention";
    pub const LEASE_LOST: &str = "ledger_sync.reads.lease_lost";

    // Writes
    pub const WRITES_EXECUTED: &str = "ledger_sync.writes.executed";
    pub const WRITES_REPLAYED: &str = "ledger_sync.writes.replayed";
    pub const WRITES_FAILED: &str = "ledger_sync.writes.failed";
    pub const IDEMPOTENCY_CONFLICTS: &str = "ledger_sync.writes.idempotency_conflicts";
    pub const WRITES_IN_DOUBT: &str = "ledger_sync.writes.in_doubt";

    // Remote calls
    pub const REMOTE_CALLS: &str = "ledger_sync.remote.calls";
    pub const REMOTE_RETRIES: &str = "ledger_sync.remote.retries";
    pub const REMOTE_LATENCY: &str = "ledger_sync.remote.latency_seconds";

    // Reconciliation
    pub const RECONCILE_PASSES: &str = "ledger_sync.reconcile.passes";
    pub const RECONCILE_EXAMINED: &str = "ledger_sync.reconcile.examined";
    pub const RECONCILE_DRIFT: &str = "ledger_sync.reconcile.drift_detected";
    pub const RECONCILE_FAILED: &str = "ledger_sync.reconcile.failed";
}
