use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicI64, AtomicU64, Ordering};

use chrono::{DateTime, Utc};
use parking_lot::{Mutex, RwLock};
use serde::{Deserialize, Serialize};

/// Metric names recorded by the runtime.
pub mod names {
    pub const AGENT_CALLS_TOTAL: &str = "agent.calls.total";
    pub const AGENT_ERRORS_TOTAL: &str = "agent.errors.total";
    pub const AGENT_CALL_DURATION_MS: &str = "agent.call.duration_ms";
    pub const AGENT_HEARTBEATS_MISSED: &str = "agent.heartbeats.missed";
    pub const SESSION_TURNS_ACCEPTED: &str = "session.turns.accepted";
    pub const SESSION_TURNS_FAILED: &str = "session.turns.failed";
    pub const SESSION_TURNS_CANCELED: &str = "session.turns.canceled";
    pub const SESSION_TURNS_COMPLETED: &str = "session.turns.completed";
    pub const BUS_MESSAGES_PUBLISHED: &str = "bus.messages.published";
    pub const BUS_DISPATCH_FAILURES: &str = "bus.dispatch.failures";
    pub const BUS_QUEUE_DEPTH: &str = "bus.queue.depth";
}

/// Observations kept per histogram. Older ones are discarded first.
const HISTOGRAM_WINDOW: usize = 4096;

#[derive(Clone, Copy, Debug, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum MetricType {
    Counter,
    Gauge,
    Histogram,
}

/// Point-in-time value of one metric.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct MetricSample {
    pub timestamp: DateTime<Utc>,
    pub name: String,
    pub value: f64,
    #[serde(skip_serializing_if = "HashMap::is_empty", default)]
    pub labels: HashMap<String, String>,
    pub metric_type: MetricType,
}

/// Monotonically increasing.
struct Counter {
    value: AtomicU64,
}

impl Counter {
    fn new() -> Self {
        Self {
            value: AtomicU64::new(0),
        }
    }
    fn increment(&self, n: u64) {
        let _ = self.value.fetch_add(n, Ordering::Relaxed);
    }
    fn get(&self) -> u64 {
        self.value.load(Ordering::Relaxed)
    }
}

/// Can go up or down. Stored as f64 bits.
struct Gauge {
    value: AtomicI64,
}

impl Gauge {
    fn new() -> Self {
        Self {
            value: AtomicI64::new(0f64.to_bits() as i64),
        }
    }
    fn set(&self, v: f64) {
        self.value.store(v.to_bits() as i64, Ordering::Relaxed);
    }
    fn increment(&self, delta: f64) {
        loop {
            let current = self.value.load(Ordering::Relaxed);
            let next = f64::from_bits(current as u64) + delta;
            if self
                .value
                .compare_exchange_weak(
                    current,
                    next.to_bits() as i64,
                    Ordering::Relaxed,
                    Ordering::Relaxed,
                )
                .is_ok()
            {
                break;
            }
        }
    }
    fn get(&self) -> f64 {
        f64::from_bits(self.value.load(Ordering::Relaxed) as u64)
    }
}

/// Sliding window of observations for percentile computation.
struct Histogram {
    observations: Mutex<VecDeque<f64>>,
}

impl Histogram {
    fn new() -> Self {
        Self {
            observations: Mutex::new(VecDeque::new()),
        }
    }
    fn observe(&self, value: f64) {
        let mut obs = self.observations.lock();
        if obs.len() == HISTOGRAM_WINDOW {
            let _ = obs.pop_front();
        }
        obs.push_back(value);
    }
    fn summary(&self) -> HistogramSummary {
        let mut sorted: Vec<f64> = self.observations.lock().iter().copied().collect();
        if sorted.is_empty() {
            return HistogramSummary::default();
        }
        sorted.sort_by(|a, b| a.partial_cmp(b).unwrap_or(std::cmp::Ordering::Equal));
        let count = sorted.len();
        let at = |q: f64| sorted[((count as f64 * q) as usize).min(count - 1)];
        HistogramSummary {
            count: count as u64,
            sum: sorted.iter().sum(),
            p50: sorted[count / 2],
            p95: at(0.95),
            p99: at(0.99),
        }
    }
}

#[derive(Clone, Debug, Default, Serialize, Deserialize)]
pub struct HistogramSummary {
    pub count: u64,
    pub sum: f64,
    pub p50: f64,
    pub p95: f64,
    pub p99: f64,
}

/// Name plus labels sorted by key, so label order never matters.
#[derive(Clone, Debug, Hash, PartialEq, Eq)]
struct MetricKey {
    name: String,
    labels: Vec<(String, String)>,
}

impl MetricKey {
    fn new(name: impl Into<String>, labels: &[(&str, &str)]) -> Self {
        let mut sorted: Vec<(String, String)> = labels
            .iter()
            .map(|(k, v)| ((*k).to_string(), (*v).to_string()))
            .collect();
        sorted.sort_by(|a, b| a.0.cmp(&b.0));
        Self {
            name: name.into(),
            labels: sorted,
        }
    }

    fn label_map(&self) -> HashMap<String, String> {
        self.labels.iter().cloned().collect()
    }
}

/// Thread-safe in-memory metrics recorder.
#[derive(Default)]
pub struct MetricsRecorder {
    counters: RwLock<HashMap<MetricKey, Counter>>,
    gauges: RwLock<HashMap<MetricKey, Gauge>>,
    histograms: RwLock<HashMap<MetricKey, Histogram>>,
}

impl MetricsRecorder {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn counter_inc(&self, name: &str, labels: &[(&str, &str)], n: u64) {
        let key = MetricKey::new(name, labels);
        let counters = self.counters.read();
        if let Some(c) = counters.get(&key) {
            c.increment(n);
            return;
        }
        drop(counters);
        let mut counters = self.counters.write();
        counters.entry(key).or_insert_with(Counter::new).increment(n);
    }

    pub fn gauge_set(&self, name: &str, labels: &[(&str, &str)], value: f64) {
        let key = MetricKey::new(name, labels);
        let gauges = self.gauges.read();
        if let Some(g) = gauges.get(&key) {
            g.set(value);
            return;
        }
        drop(gauges);
        let mut gauges = self.gauges.write();
        gauges.entry(key).or_insert_with(Gauge::new).set(value);
    }

    pub fn gauge_inc(&self, name: &str, labels: &[(&str, &str)], delta: f64) {
        let key = MetricKey::new(name, labels);
        let gauges = self.gauges.read();
        if let Some(g) = gauges.get(&key) {
            g.increment(delta);
            return;
        }
        drop(gauges);
        let mut gauges = self.gauges.write();
        gauges.entry(key).or_insert_with(Gauge::new).increment(delta);
    }

    pub fn histogram_observe(&self, name: &str, labels: &[(&str, &str)], value: f64) {
        let key = MetricKey::new(name, labels);
        let histograms = self.histograms.read();
        if let Some(h) = histograms.get(&key) {
            h.observe(value);
            return;
        }
        drop(histograms);
        let mut histograms = self.histograms.write();
        histograms.entry(key).or_insert_with(Histogram::new).observe(value);
    }

    pub fn histogram_summary(&self, name: &str, labels: &[(&str, &str)]) -> HistogramSummary {
        let key = MetricKey::new(name, labels);
        self.histograms
            .read()
            .get(&key)
            .map(Histogram::summary)
            .unwrap_or_default()
    }

    pub fn counter_get(&self, name: &str, labels: &[(&str, &str)]) -> u64 {
        let key = MetricKey::new(name, labels);
        self.counters.read().get(&key).map_or(0, Counter::get)
    }

    pub fn gauge_get(&self, name: &str, labels: &[(&str, &str)]) -> f64 {
        let key = MetricKey::new(name, labels);
        self.gauges.read().get(&key).map_or(0.0, Gauge::get)
    }

    /// Current value of every metric. Histograms report their p50.
    pub fn snapshot(&self) -> Vec<MetricSample> {
        let now = Utc::now();
        let mut out = Vec::new();

        for (key, counter) in self.counters.read().iter() {
            out.push(MetricSample {
                timestamp: now,
                name: key.name.clone(),
                value: counter.get() as f64,
                labels: key.label_map(),
                metric_type: MetricType::Counter,
            });
        }
        for (key, gauge) in self.gauges.read().iter() {
            out.push(MetricSample {
                timestamp: now,
                name: key.name.clone(),
                value: gauge.get(),
                labels: key.label_map(),
                metric_type: MetricType::Gauge,
            });
        }
        for (key, histogram) in self.histograms.read().iter() {
            out.push(MetricSample {
                timestamp: now,
                name: key.name.clone(),
                value: histogram.summary().p50,
                labels: key.label_map(),
                metric_type: MetricType::Histogram,
            });
        }

        out.sort_by(|a, b| a.name.cmp(&b.name));
        out
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn counter_basic() {
        let recorder = MetricsRecorder::new();
        recorder.counter_inc(names::AGENT_CALLS_TOTAL, &[("agent_id", "a")], 1);
        recorder.counter_inc(names::AGENT_CALLS_TOTAL, &[("agent_id", "a")], 1);
        recorder.counter_inc(names::AGENT_CALLS_TOTAL, &[("agent_id", "b")], 1);

        assert_eq!(recorder.counter_get(names::AGENT_CALLS_TOTAL, &[("agent_id", "a")]), 2);
        assert_eq!(recorder.counter_get(names::AGENT_CALLS_TOTAL, &[("agent_id", "b")]), 1);
        assert_eq!(recorder.counter_get(names::AGENT_CALLS_TOTAL, &[("agent_id", "c")]), 0);
    }

    #[test]
    fn gauge_set_and_increment() {
        let recorder = MetricsRecorder::new();
        recorder.gauge_set(names::BUS_QUEUE_DEPTH, &[], 10.0);
        recorder.gauge_inc(names::BUS_QUEUE_DEPTH, &[], 5.0);
        recorder.gauge_inc(names::BUS_QUEUE_DEPTH, &[], -3.0);
        assert_eq!(recorder.gauge_get(names::BUS_QUEUE_DEPTH, &[]), 12.0);
    }

    #[test]
    fn histogram_observations() {
        let recorder = MetricsRecorder::new();
        for v in [10.0, 20.0, 30.0, 40.0, 50.0, 60.0, 70.0, 80.0, 90.0, 100.0] {
            recorder.histogram_observe(names::AGENT_CALL_DURATION_MS, &[], v);
        }
        let summary = recorder.histogram_summary(names::AGENT_CALL_DURATION_MS, &[]);
        assert_eq!(summary.count, 10);
        assert_eq!(summary.sum, 550.0);
        assert!(summary.p50 >= 50.0 && summary.p50 <= 60.0);
        assert!(summary.p95 >= 90.0);
    }

    #[test]
    fn histogram_window_is_bounded() {
        let recorder = MetricsRecorder::new();
        for i in 0..(HISTOGRAM_WINDOW + 10) {
            recorder.histogram_observe("h", &[], i as f64);
        }
        assert_eq!(recorder.histogram_summary("h", &[]).count, HISTOGRAM_WINDOW as u64);
    }

    #[test]
    fn histogram_empty() {
        let summary = MetricsRecorder::new().histogram_summary("nonexistent", &[]);
        assert_eq!(summary.count, 0);
    }

    #[test]
    fn label_ordering_independent() {
        let recorder = MetricsRecorder::new();
        recorder.counter_inc("test", &[("a", "1"), ("b", "2")], 1);
        recorder.counter_inc("test", &[("b", "2"), ("a", "1")], 1);
        assert_eq!(recorder.counter_get("test", &[("a", "1"), ("b", "2")]), 2);
    }

    #[test]
    fn snapshot_lists_every_metric() {
        let recorder = MetricsRecorder::new();
        recorder.counter_inc(names::SESSION_TURNS_ACCEPTED, &[], 3);
        recorder.gauge_set(names::BUS_QUEUE_DEPTH, &[], 1.0);
        recorder.histogram_observe(names::AGENT_CALL_DURATION_MS, &[("agent_id", "a")], 7.0);

        let samples = recorder.snapshot();
        assert_eq!(samples.len(), 3);
        let accepted = samples
            .iter()
            .find(|s| s.name == names::SESSION_TURNS_ACCEPTED)
            .unwrap();
        assert_eq!(accepted.value, 3.0);
        assert_eq!(accepted.metric_type, MetricType::Counter);
        let hist = samples
            .iter()
            .find(|s| s.metric_type == MetricType::Histogram)
            .unwrap();
        assert_eq!(hist.labels.get("agent_id").map(String::as_str), Some("a"));
    }

    #[test]
    fn concurrent_counter_increments() {
        use std::sync::Arc;
        use std::thread;

        let recorder = Arc::new(MetricsRecorder::new());
        let handles: Vec<_> = (0..10)
            .map(|_| {
                let r = recorder.clone();
                thread::spawn(move || {
                    for _ in 0..1000 {
                        r.counter_inc("concurrent.test", &[], 1);
                    }
                })
            })
            .collect();
        for h in handles {
            h.join().unwrap();
        }
        assert_eq!(recorder.counter_get("concurrent.test", &[]), 10_000);
    }
}
