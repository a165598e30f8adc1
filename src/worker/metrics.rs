use std::collections::HashMap;

use hdrhistogram::Histogram;
use serde::Serialize;

use crate::error::{PilotError, Result};
use crate::scenario::MetricKind;

/// Significant figures kept by histogram units.
const HISTOGRAM_SIGFIG: u8 = 3;

#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize)]
pub struct HistogramSummary {
    pub count: u64,
    pub min: u64,
    pub max: u64,
    pub mean: f64,
    pub stddev: f64,
    pub p50: u64,
    pub p95: u64,
    pub p99: u64,
}

impl HistogramSummary {
    fn from_histogram(histogram: &Histogram<u64>) -> Self {
        if histogram.is_empty() {
            return Self::default();
        }
        Self {
            count: histogram.len(),
            min: histogram.min(),
            max: histogram.max(),
            mean: histogram.mean(),
            stddev: histogram.stdev(),
            p50: histogram.value_at_quantile(0.50),
            p95: histogram.value_at_quantile(0.95),
            p99: histogram.value_at_quantile(0.99),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub enum SnapshotValue {
    Counter(i64),
    Histogram(HistogramSummary),
    Gauge(i64),
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct UnitSnapshot {
    pub title: String,
    pub value: SnapshotValue,
}

impl UnitSnapshot {
    pub fn kind(&self) -> MetricKind {
        match self.value {
            SnapshotValue::Counter(_) => MetricKind::Counter,
            SnapshotValue::Histogram(_) => MetricKind::Histogram,
            SnapshotValue::Gauge(_) => MetricKind::Gauge,
        }
    }
}

#[derive(Debug, Clone)]
enum Aggregator {
    Counter(i64),
    Histogram(Box<Histogram<u64>>),
    Gauge(i64),
}

/// A named measurement tracked during a run.
#[derive(Debug, Clone)]
pub struct MetricUnit {
    title: String,
    aggregator: Aggregator,
}

impl MetricUnit {
    pub fn new(title: impl Into<String>, kind: MetricKind) -> Result<Self> {
        let title = title.into();
        let aggregator = match kind {
            MetricKind::Counter => Aggregator::Counter(0),
            MetricKind::Gauge => Aggregator::Gauge(0),
            MetricKind::Histogram => {
                let histogram = Histogram::<u64>::new(HISTOGRAM_SIGFIG).map_err(|e| {
                    PilotError::Internal(format!("create histogram {}: {}", title, e))
                })?;
                Aggregator::Histogram(Box::new(histogram))
            }
        };
        Ok(Self { title, aggregator })
    }

    pub fn title(&self) -> &str {
        &self.title
    }

    pub fn kind(&self) -> MetricKind {
        match self.aggregator {
            Aggregator::Counter(_) => MetricKind::Counter,
            Aggregator::Histogram(_) => MetricKind::Histogram,
            Aggregator::Gauge(_) => MetricKind::Gauge,
        }
    }

    /// Counter: add `value`. Histogram: record a sample. Gauge: set `value`.
    pub fn update(&mut self, value: i64) -> Result<()> {
        match &mut self.aggregator {
            Aggregator::Counter(count) => {
                *count = count
                    .checked_add(value)
                    .ok_or_else(|| PilotError::InvalidSample {
                        title: self.title.clone(),
                        value,
                    })?;
            }
            Aggregator::Gauge(current) => *current = value,
            Aggregator::Histogram(histogram) => {
                let sample = u64::try_from(value).map_err(|_| PilotError::InvalidSample {
                    title: self.title.clone(),
                    value,
                })?;
                histogram
                    .record(sample)
                    .map_err(|_| PilotError::InvalidSample {
                        title: self.title.clone(),
                        value,
                    })?;
            }
        }
        Ok(())
    }

    pub fn snapshot(&self) -> UnitSnapshot {
        let value = match &self.aggregator {
            Aggregator::Counter(count) => SnapshotValue::Counter(*count),
            Aggregator::Gauge(current) => SnapshotValue::Gauge(*current),
            Aggregator::Histogram(histogram) => {
                SnapshotValue::Histogram(HistogramSummary::from_histogram(histogram))
            }
        };
        UnitSnapshot {
            title: self.title.clone(),
            value,
        }
    }
}

/// Metric units keyed by title. Not synchronised; the worker runtime owns the lock.
#[derive(Debug, Default)]
pub struct MetricsRegistry {
    units: HashMap<String, MetricUnit>,
}

impl MetricsRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a unit. Returns `false` when the title already exists; the first
    /// registration is kept.
    pub fn register(&mut self, title: &str, kind: MetricKind) -> Result<bool> {
        if self.units.contains_key(title) {
            return Ok(false);
        }
        let unit = MetricUnit::new(title, kind)?;
        self.units.insert(title.to_string(), unit);
        Ok(true)
    }

    pub fn notify(&mut self, title: &str, value: i64) -> Result<()> {
        self.units
            .get_mut(title)
            .ok_or_else(|| PilotError::IdNotFound(title.to_string()))?
            .update(value)
    }

    pub fn get(&self, title: &str) -> Option<&MetricUnit> {
        self.units.get(title)
    }

    /// Snapshot of every unit, sorted by title.
    pub fn snapshot(&self) -> Vec<UnitSnapshot> {
        let mut units: Vec<UnitSnapshot> = self.units.values().map(MetricUnit::snapshot).collect();
        units.sort_by(|a, b| a.title.cmp(&b.title));
        units
    }

    pub fn len(&self) -> usize {
        self.units.len()
    }

    pub fn is_empty(&self) -> bool {
        self.units.is_empty()
    }

    pub fn clear(&mut self) {
        self.units.clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn counter_accumulates_values() {
        let mut registry = MetricsRegistry::new();
        registry.register("reqs", MetricKind::Counter).unwrap();
        registry.notify("reqs", 1).unwrap();
        registry.notify("reqs", 4).unwrap();
        assert_eq!(
            registry.get("reqs").unwrap().snapshot().value,
            SnapshotValue::Counter(5)
        );
    }

    #[test]
    fn counter_overflow_is_rejected_without_mutation() {
        let mut registry = MetricsRegistry::new();
        registry.register("bytes", MetricKind::Counter).unwrap();
        registry.notify("bytes", i64::MAX - 1).unwrap();

        let err = registry.notify("bytes", 2).unwrap_err();
        assert!(matches!(err, PilotError::InvalidSample { value: 2, .. }));
        assert_eq!(
            registry.get("bytes").unwrap().snapshot().value,
            SnapshotValue::Counter(i64::MAX - 1)
        );
        registry.notify("bytes", 1).unwrap();
    }

    #[test]
    fn gauge_keeps_last_value() {
        let mut registry = MetricsRegistry::new();
        registry.register("inflight", MetricKind::Gauge).unwrap();
        registry.notify("inflight", 7).unwrap();
        registry.notify("inflight", -2).unwrap();
        assert_eq!(
            registry.get("inflight").unwrap().snapshot().value,
            SnapshotValue::Gauge(-2)
        );
    }

    #[test]
    fn histogram_summarises_samples() {
        let mut registry = MetricsRegistry::new();
        registry.register("latency", MetricKind::Histogram).unwrap();
        for v in 1..=100 {
            registry.notify("latency", v).unwrap();
        }
        let SnapshotValue::Histogram(summary) = registry.get("latency").unwrap().snapshot().value
        else {
            panic!("expected histogram snapshot");
        };
        assert_eq!(summary.count, 100);
        assert_eq!(summary.min, 1);
        assert_eq!(summary.max, 100);
        assert!((summary.mean - 50.5).abs() < 0.5);
        assert!(summary.p50 >= 49 && summary.p50 <= 51);
    }

    #[test]
    fn empty_histogram_has_zero_summary() {
        let unit = MetricUnit::new("latency", MetricKind::Histogram).unwrap();
        assert_eq!(
            unit.snapshot().value,
            SnapshotValue::Histogram(HistogramSummary::default())
        );
    }

    #[test]
    fn negative_histogram_sample_is_rejected_without_mutation() {
        let mut registry = MetricsRegistry::new();
        registry.register("latency", MetricKind::Histogram).unwrap();
        let err = registry.notify("latency", -1).unwrap_err();
        assert!(matches!(err, PilotError::InvalidSample { value: -1, .. }));
        let SnapshotValue::Histogram(summary) = registry.get("latency").unwrap().snapshot().value
        else {
            panic!("expected histogram snapshot");
        };
        assert_eq!(summary.count, 0);
    }

    #[test]
    fn duplicate_registration_keeps_first_kind() {
        let mut registry = MetricsRegistry::new();
        assert!(registry.register("m", MetricKind::Counter).unwrap());
        assert!(!registry.register("m", MetricKind::Gauge).unwrap());
        assert_eq!(registry.len(), 1);
        assert_eq!(registry.get("m").unwrap().kind(), MetricKind::Counter);
    }

    #[test]
    fn notify_unknown_title_fails() {
        let mut registry = MetricsRegistry::new();
        registry.register("reqs", MetricKind::Counter).unwrap();
        let err = registry.notify("missing", 1).unwrap_err();
        assert!(matches!(err, PilotError::IdNotFound(ref t) if t == "missing"));
        assert_eq!(
            registry.get("reqs").unwrap().snapshot().value,
            SnapshotValue::Counter(0)
        );
    }

    #[test]
    fn snapshot_is_sorted_by_title() {
        let mut registry = MetricsRegistry::new();
        registry.register("b", MetricKind::Counter).unwrap();
        registry.register("a", MetricKind::Gauge).unwrap();
        let titles: Vec<_> = registry.snapshot().into_iter().map(|u| u.title).collect();
        assert_eq!(titles, vec!["a", "b"]);
    }
}
