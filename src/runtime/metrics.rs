use std::{collections::HashMap, sync::Mutex};

/// Pluggable counter/histogram sink. The engine only emits tuples; the
/// experiment tracker (or any other backend) lives behind this seam.
pub trait MetricSink: Send + Sync {
    fn counter(&self, name: &str, value: u64, labels: &[(&str, &str)]);
    fn histogram(&self, name: &str, value: f64, labels: &[(&str, &str)]);
}

/// Discards everything.
pub struct NoopSink;

impl MetricSink for NoopSink {
    fn counter(&self, _name: &str, _value: u64, _labels: &[(&str, &str)]) {}
    fn histogram(&self, _name: &str, _value: f64, _labels: &[(&str, &str)]) {}
}

/// Keeps everything; used by tests and the reporter.
#[derive(Default)]
pub struct MemorySink {
    counters: Mutex<HashMap<String, u64>>,
    histograms: Mutex<HashMap<String, Vec<f64>>>,
}

impl MemorySink {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn counter_value(&self, name: &str, labels: &[(&str, &str)]) -> u64 {
        let key = metric_key(name, labels);
        *self.counters.lock().expect("metric lock").get(&key).unwrap_or(&0)
    }

    pub fn histogram_values(&self, name: &str, labels: &[(&str, &str)]) -> Vec<f64> {
        let key = metric_key(name, labels);
        self.histograms
            .lock()
            .expect("metric lock")
            .get(&key)
            .cloned()
            .unwrap_or_default()
    }
}

impl MetricSink for MemorySink {
    fn counter(&self, name: &str, value: u64, labels: &[(&str, &str)]) {
        let key = metric_key(name, labels);
        *self.counters.lock().expect("metric lock").entry(key).or_insert(0) += value;
    }

    fn histogram(&self, name: &str, value: f64, labels: &[(&str, &str)]) {
        let key = metric_key(name, labels);
        self.histograms
            .lock()
            .expect("metric lock")
            .entry(key)
            .or_default()
            .push(value);
    }
}

fn metric_key(name: &str, labels: &[(&str, &str)]) -> String {
    let mut sorted: Vec<_> = labels.to_vec();
    sorted.sort();
    let labels: Vec<String> = sorted.iter().map(|(k, v)| format!("{k}={v}")).collect();
    format!("{name}{{{}}}", labels.join(","))
}
