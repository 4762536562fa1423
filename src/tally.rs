//! In-process metrics recorder for the demo
//!
//! Keeps running totals of every counter and histogram the engine emits
//! and logs them once at shutdown.

use std::collections::BTreeMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use metrics::{
    Counter, Gauge, Histogram, HistogramFn, Key, KeyName, Metadata, Recorder, SharedString, Unit,
};
use tracing::info;

#[derive(Default)]
struct Summary {
    count: AtomicU64,
    sum: Mutex<f64>,
}

impl HistogramFn for Summary {
    fn record(&self, value: f64) {
        self.count.fetch_add(1, Ordering::Relaxed);
        *lock(&self.sum) += value;
    }
}

#[derive(Default)]
struct Registry {
    counters: Mutex<BTreeMap<String, Arc<AtomicU64>>>,
    histograms: Mutex<BTreeMap<String, Arc<Summary>>>,
}

#[derive(Clone, Default)]
pub struct Tally {
    registry: Arc<Registry>,
}

fn lock<T>(m: &Mutex<T>) -> MutexGuard<'_, T> {
    m.lock().unwrap_or_else(PoisonError::into_inner)
}

fn render(key: &Key) -> String {
    let labels: Vec<String> = key
        .labels()
        .map(|l| format!("{}={}", l.key(), l.value()))
        .collect();
    if labels.is_empty() {
        key.name().to_string()
    } else {
        format!("{}{{{}}}", key.name(), labels.join(","))
    }
}

impl Tally {
    pub fn log_summary(&self) {
        for (name, value) in lock(&self.registry.counters).iter() {
            info!(metric = %name, value = value.load(Ordering::Relaxed), "counter");
        }
        for (name, summary) in lock(&self.registry.histograms).iter() {
            let count = summary.count.load(Ordering::Relaxed);
            let sum = *lock(&summary.sum);
            let mean = if count == 0 { 0.0 } else { sum / count as f64 };
            info!(metric = %name, count, mean, "histogram");
        }
    }
}

impl Recorder for Tally {
    fn describe_counter(&self, _: KeyName, _: Option<Unit>, _: SharedString) {}

    fn describe_gauge(&self, _: KeyName, _: Option<Unit>, _: SharedString) {}

    fn describe_histogram(&self, _: KeyName, _: Option<Unit>, _: SharedString) {}

    fn register_counter(&self, key: &Key, _: &Metadata<'_>) -> Counter {
        let counter = lock(&self.registry.counters)
            .entry(render(key))
            .or_default()
            .clone();
        Counter::from_arc(counter)
    }

    fn register_gauge(&self, _: &Key, _: &Metadata<'_>) -> Gauge {
        Gauge::noop()
    }

    fn register_histogram(&self, key: &Key, _: &Metadata<'_>) -> Histogram {
        let summary = lock(&self.registry.histograms)
            .entry(render(key))
            .or_default()
            .clone();
        Histogram::from_arc(summary)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn totals_accumulate_per_label_set() {
        let tally = Tally::default();
        metrics::with_local_recorder(&tally, || {
            metrics::counter!("pool_flushes_total", "hard" => "true").increment(2);
            metrics::counter!("pool_flushes_total", "hard" => "true").increment(1);
            metrics::counter!("pool_flushes_total", "hard" => "false").increment(1);
            metrics::histogram!("snapshot_latency_ms").record(4.0);
            metrics::histogram!("snapshot_latency_ms").record(2.0);
        });

        let counters = lock(&tally.registry.counters);
        assert_eq!(counters["pool_flushes_total{hard=true}"].load(Ordering::Relaxed), 3);
        assert_eq!(counters["pool_flushes_total{hard=false}"].load(Ordering::Relaxed), 1);
        let histograms = lock(&tally.registry.histograms);
        let latency = &histograms["snapshot_latency_ms"];
        assert_eq!(latency.count.load(Ordering::Relaxed), 2);
        assert_eq!(*lock(&latency.sum), 6.0);
    }
}
