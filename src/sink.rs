//! Metric sinks.
//!
//! Recording is best-effort: a sink has no way to fail a training run.

use crate::data::Split;
use crate::metrics::{MetricKind, MetricSet};

/// Receiver of scalar metric series.
pub trait MetricsSink {
    /// Record `value` for `series` at `step`.
    fn record(&mut self, series: &str, value: f64, step: usize);
}

/// Series name for one metric of one annotator in one split.
///
/// ```rust
/// use latent_truth_rs::{data::Split, metrics::MetricKind, sink::series_name};
///
/// assert_eq!(
///     series_name(MetricKind::F1, "alice", Split::Validation),
///     "F1 score/Annotator alice/validation"
/// );
/// ```
pub fn series_name(kind: MetricKind, annotator: &str, split: Split) -> String {
    format!("{}/Annotator {annotator}/{split}", kind.series_label())
}

/// Record all five metrics of a set.
pub fn record_set(
    sink: &mut dyn MetricsSink,
    set: &MetricSet,
    annotator: &str,
    split: Split,
    step: usize,
) {
    for kind in MetricKind::ALL {
        sink.record(&series_name(kind, annotator, split), set.score(kind), step);
    }
}

/// Discards everything.
#[derive(Debug, Default, Clone, Copy)]
pub struct NoopSink;

impl MetricsSink for NoopSink {
    fn record(&mut self, _series: &str, _value: f64, _step: usize) {}
}

/// Emits every record as a `tracing` event.
#[derive(Debug, Default, Clone, Copy)]
pub struct TracingSink;

impl MetricsSink for TracingSink {
    fn record(&mut self, series: &str, value: f64, step: usize) {
        tracing::info!(series, value, step, "metric");
    }
}

/// Keeps every record in memory.
#[derive(Debug, Default, Clone)]
pub struct MemorySink {
    records: Vec<(String, f64, usize)>,
}

impl MemorySink {
    /// Create an empty sink.
    pub fn new() -> Self {
        Self::default()
    }

    /// All `(series, value, step)` records in arrival order.
    pub fn records(&self) -> &[(String, f64, usize)] {
        &self.records
    }

    /// `(step, value)` points of one series.
    pub fn series(&self, name: &str) -> Vec<(usize, f64)> {
        self.records
            .iter()
            .filter(|(series, _, _)| series == name)
            .map(|(_, value, step)| (*step, *value))
            .collect()
    }
}

impl MetricsSink for MemorySink {
    fn record(&mut self, series: &str, value: f64, step: usize) {
        self.records.push((series.to_string(), value, step));
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::metrics::BatchMeasures;

    #[test]
    fn test_series_name_format() {
        assert_eq!(
            series_name(MetricKind::Loss, "b", Split::Train),
            "Loss/Annotator b/train"
        );
    }

    #[test]
    fn test_record_set_writes_five_series() {
        let mut sink = MemorySink::new();
        let mut set = MetricSet::new();
        set.update(
            &BatchMeasures {
                loss: 0.5,
                ..Default::default()
            },
            4,
        );
        record_set(&mut sink, &set, "a", Split::Validation, 3);
        assert_eq!(sink.records().len(), 5);
        assert_eq!(sink.series("Loss/Annotator a/validation"), vec![(3, 0.5)]);
    }

    #[test]
    fn test_noop_sink_accepts_records() {
        let mut sink = NoopSink;
        sink.record("Loss/Annotator a/train", 1.0, 0);
    }
}
