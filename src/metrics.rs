//! Metrics surface.
//!
//! The dispatcher emits named counters and gauges through an injected sink
//! and never aggregates anything itself. Event names follow the
//! `augmentation.*` / `augmentor.<name>.*` /
//! `augmentor.<name>.instances.<addr>.*` convention.

use std::collections::BTreeMap;

use parking_lot::Mutex;

/// Destination for dispatcher counters and gauges.
///
/// Implementations must be cheap: hits fire on the hot path for every
/// auction and every worker frame.
pub trait EventSink: Send + Sync {
    /// Increment the named counter by one.
    fn record_hit(&self, name: &str);

    /// Record the current value of the named gauge.
    fn record_level(&self, name: &str, value: f64);

    /// Record one observation of the named distribution (latency, size).
    fn record_outcome(&self, name: &str, value: f64);
}

/// Sink that drops everything.
#[derive(Debug, Default, Clone, Copy)]
pub struct NullSink;

impl EventSink for NullSink {
    fn record_hit(&self, _name: &str) {}
    fn record_level(&self, _name: &str, _value: f64) {}
    fn record_outcome(&self, _name: &str, _value: f64) {}
}

/// In-memory sink that keeps per-name aggregates.
///
/// Used by the test suite to assert on emitted events; also handy when
/// embedding the loop without a real metrics backend.
#[derive(Debug, Default)]
pub struct CountingSink {
    counters: Mutex<BTreeMap<String, u64>>,
    levels: Mutex<BTreeMap<String, f64>>,
    outcomes: Mutex<BTreeMap<String, Vec<f64>>>,
}

impl CountingSink {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Current value of a counter (0 if never hit).
    #[must_use]
    pub fn counter(&self, name: &str) -> u64 {
        self.counters.lock().get(name).copied().unwrap_or(0)
    }

    /// Last recorded value of a gauge.
    #[must_use]
    pub fn level(&self, name: &str) -> Option<f64> {
        self.levels.lock().get(name).copied()
    }

    /// Number of observations recorded for a distribution.
    #[must_use]
    pub fn outcome_count(&self, name: &str) -> usize {
        self.outcomes.lock().get(name).map_or(0, Vec::len)
    }

    /// Snapshot of all counters, sorted by name.
    #[must_use]
    pub fn counters(&self) -> BTreeMap<String, u64> {
        self.counters.lock().clone()
    }
}

impl EventSink for CountingSink {
    fn record_hit(&self, name: &str) {
        *self.counters.lock().entry(name.to_string()).or_insert(0) += 1;
    }

    fn record_level(&self, name: &str, value: f64) {
        self.levels.lock().insert(name.to_string(), value);
    }

    fn record_outcome(&self, name: &str, value: f64) {
        self.outcomes
            .lock()
            .entry(name.to_string())
            .or_default()
            .push(value);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn counting_sink_aggregates() {
        let sink = CountingSink::new();
        sink.record_hit("augmentation.request");
        sink.record_hit("augmentation.request");
        sink.record_hit("duplicateAuction");
        sink.record_level("augmentor.geo.numInFlight", 3.0);
        sink.record_outcome("augmentor.geo.timeTakenMs", 12.5);
        sink.record_outcome("augmentor.geo.timeTakenMs", 14.0);

        assert_eq!(sink.counter("augmentation.request"), 2);
        assert_eq!(sink.counter("duplicateAuction"), 1);
        assert_eq!(sink.counter("never.seen"), 0);
        assert_eq!(sink.level("augmentor.geo.numInFlight"), Some(3.0));
        assert_eq!(sink.outcome_count("augmentor.geo.timeTakenMs"), 2);
    }
}
