//! Running metrics and classification scores.
//!
//! Every tracked value is a sample-weighted running mean. Batches of
//! different sizes therefore contribute in proportion to their row counts,
//! and a batch with zero rows contributes nothing.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

use crate::config::AveragingMethod;
use crate::error::{LatentTruthError, Result};

/// Fold one weighted observation into a running mean.
///
/// Returns `previous_score` unchanged when `batch_size` is zero (or the
/// combined weight is zero).
///
/// ```rust
/// use latent_truth_rs::metrics::weighted_update;
///
/// let score = weighted_update(0.5, 2.0, 1.0, 2.0);
/// assert!((score - 0.75).abs() < 1e-12);
/// assert_eq!(weighted_update(0.5, 2.0, 9.0, 0.0), 0.5);
/// ```
pub fn weighted_update(
    previous_score: f64,
    previous_samples: f64,
    batch_value: f64,
    batch_size: f64,
) -> f64 {
    let total = previous_samples + batch_size;
    if batch_size == 0.0 || total == 0.0 {
        return previous_score;
    }
    (previous_score * previous_samples + batch_value * batch_size) / total
}

/// A sample-weighted running mean.
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize)]
pub struct RunningMetric {
    score: f64,
    samples: f64,
}

impl RunningMetric {
    /// Create an empty metric.
    pub fn new() -> Self {
        Self::default()
    }

    /// Add a batch value observed over `batch_size` samples.
    pub fn update(&mut self, value: f64, batch_size: f64) -> f64 {
        self.score = weighted_update(self.score, self.samples, value, batch_size);
        self.samples += batch_size;
        self.score
    }

    /// Current weighted mean.
    pub fn score(&self) -> f64 {
        self.score
    }

    /// Total sample weight accumulated so far.
    pub fn samples(&self) -> f64 {
        self.samples
    }

    /// Whether no sample weight has been accumulated.
    pub fn is_empty(&self) -> bool {
        self.samples == 0.0
    }
}

/// The five tracked quantities.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub enum MetricKind {
    /// Loss of the primary labels.
    Loss,
    /// Accuracy.
    Accuracy,
    /// Precision.
    Precision,
    /// Recall.
    Recall,
    /// F1 score.
    F1,
}

impl MetricKind {
    /// All kinds in reporting order.
    pub const ALL: [MetricKind; 5] = [
        MetricKind::Loss,
        MetricKind::Accuracy,
        MetricKind::Precision,
        MetricKind::Recall,
        MetricKind::F1,
    ];

    /// Prefix of the sink series name.
    pub fn series_label(self) -> &'static str {
        match self {
            Self::Loss => "Loss",
            Self::Accuracy => "Accuracy",
            Self::Precision => "Precision",
            Self::Recall => "Recall",
            Self::F1 => "F1 score",
        }
    }
}

/// Accuracy, precision, recall and F1 of one set of predictions.
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize)]
pub struct ClassificationScores {
    /// Fraction of correct predictions.
    pub accuracy: f64,
    /// Averaged precision.
    pub precision: f64,
    /// Averaged recall.
    pub recall: f64,
    /// Averaged F1.
    pub f1: f64,
}

/// Per-batch values fed into a [`MetricSet`].
#[derive(Debug, Clone, Copy, Default, PartialEq)]
pub struct BatchMeasures {
    /// Mean primary loss over the batch rows.
    pub loss: f64,
    /// Classification scores over the batch rows.
    pub scores: ClassificationScores,
}

impl BatchMeasures {
    /// Value of one metric kind.
    pub fn get(&self, kind: MetricKind) -> f64 {
        match kind {
            MetricKind::Loss => self.loss,
            MetricKind::Accuracy => self.scores.accuracy,
            MetricKind::Precision => self.scores.precision,
            MetricKind::Recall => self.scores.recall,
            MetricKind::F1 => self.scores.f1,
        }
    }
}

/// Running means of all five metric kinds for one subject.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct MetricSet {
    metrics: BTreeMap<MetricKind, RunningMetric>,
}

impl MetricSet {
    /// Create an empty set.
    pub fn new() -> Self {
        Self::default()
    }

    /// Fold one batch into every metric.
    pub fn update(&mut self, measures: &BatchMeasures, batch_size: usize) {
        for kind in MetricKind::ALL {
            self.metrics
                .entry(kind)
                .or_default()
                .update(measures.get(kind), batch_size as f64);
        }
    }

    /// Current mean of one metric kind (0.0 before any update).
    pub fn score(&self, kind: MetricKind) -> f64 {
        self.metrics.get(&kind).map_or(0.0, RunningMetric::score)
    }

    /// Accumulated sample weight.
    pub fn samples(&self) -> f64 {
        self.metrics
            .get(&MetricKind::Loss)
            .map_or(0.0, RunningMetric::samples)
    }

    /// Whether nothing was recorded.
    pub fn is_empty(&self) -> bool {
        self.samples() == 0.0
    }
}

/// One [`MetricSet`] per annotator, in first-seen order.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct AnnotatorMetrics {
    entries: Vec<(String, MetricSet)>,
}

impl AnnotatorMetrics {
    /// Create an empty tracker.
    pub fn new() -> Self {
        Self::default()
    }

    /// Metric set of `annotator`, created on first access.
    pub fn entry(&mut self, annotator: &str) -> &mut MetricSet {
        let idx = match self.entries.iter().position(|(a, _)| a == annotator) {
            Some(idx) => idx,
            None => {
                self.entries.push((annotator.to_string(), MetricSet::new()));
                self.entries.len() - 1
            }
        };
        &mut self.entries[idx].1
    }

    /// Insert or replace the set of one annotator.
    pub fn insert(&mut self, annotator: &str, set: MetricSet) {
        *self.entry(annotator) = set;
    }

    /// Metric set of `annotator`, if any batch touched it.
    pub fn get(&self, annotator: &str) -> Option<&MetricSet> {
        self.entries
            .iter()
            .find(|(a, _)| a == annotator)
            .map(|(_, set)| set)
    }

    /// Iterate `(annotator, set)` pairs.
    pub fn iter(&self) -> impl Iterator<Item = (&str, &MetricSet)> {
        self.entries.iter().map(|(a, set)| (a.as_str(), set))
    }

    /// Number of annotators tracked.
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    /// Whether no annotator is tracked.
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Total sample weight across annotators.
    pub fn samples(&self) -> f64 {
        self.entries.iter().map(|(_, set)| set.samples()).sum()
    }

    /// Sample-weighted mean of one metric across annotators.
    ///
    /// Returns `None` when no annotator has accumulated any weight.
    pub fn weighted_mean(&self, kind: MetricKind) -> Option<f64> {
        let mut total = RunningMetric::new();
        for (_, set) in &self.entries {
            total.update(set.score(kind), set.samples());
        }
        (!total.is_empty()).then(|| total.score())
    }
}

#[derive(Debug, Default, Clone, Copy)]
struct ClassCounts {
    tp: f64,
    fp: f64,
    fn_: f64,
    support: f64,
}

fn ratio(num: f64, den: f64) -> f64 {
    if den == 0.0 {
        0.0
    } else {
        num / den
    }
}

fn precision_recall_f1(c: &ClassCounts) -> (f64, f64, f64) {
    (
        ratio(c.tp, c.tp + c.fp),
        ratio(c.tp, c.tp + c.fn_),
        ratio(2.0 * c.tp, 2.0 * c.tp + c.fp + c.fn_),
    )
}

/// Accuracy, precision, recall and F1 of `predictions` against `labels`.
///
/// Undefined ratios (no predicted or no true instances of a class) count
/// as 0. Macro and weighted averages run over the classes that occur in
/// either `labels` or `predictions`. `Binary` reports class 1 and rejects
/// labels above 1.
pub fn performance_measures(
    predictions: &[u32],
    labels: &[u32],
    averaging: AveragingMethod,
) -> Result<ClassificationScores> {
    if predictions.len() != labels.len() {
        return Err(LatentTruthError::Evaluation(format!(
            "{} predictions for {} labels",
            predictions.len(),
            labels.len()
        )));
    }
    if labels.is_empty() {
        return Err(LatentTruthError::Evaluation(
            "cannot score an empty set of predictions".into(),
        ));
    }

    let mut counts: BTreeMap<u32, ClassCounts> = BTreeMap::new();
    let mut correct = 0usize;
    for (&pred, &label) in predictions.iter().zip(labels) {
        counts.entry(label).or_default().support += 1.0;
        if pred == label {
            correct += 1;
            counts.entry(label).or_default().tp += 1.0;
        } else {
            counts.entry(pred).or_default().fp += 1.0;
            counts.entry(label).or_default().fn_ += 1.0;
        }
    }
    let accuracy = correct as f64 / labels.len() as f64;

    let (precision, recall, f1) = match averaging {
        AveragingMethod::Binary => {
            if let Some(label) = counts.keys().find(|&&c| c > 1) {
                return Err(LatentTruthError::Evaluation(format!(
                    "binary averaging with class {label}"
                )));
            }
            precision_recall_f1(&counts.get(&1).copied().unwrap_or_default())
        }
        AveragingMethod::Micro => {
            let total = counts.values().fold(ClassCounts::default(), |acc, c| ClassCounts {
                tp: acc.tp + c.tp,
                fp: acc.fp + c.fp,
                fn_: acc.fn_ + c.fn_,
                support: acc.support + c.support,
            });
            precision_recall_f1(&total)
        }
        AveragingMethod::Macro => {
            let n = counts.len() as f64;
            let (p, r, f) = counts.values().map(precision_recall_f1).fold(
                (0.0, 0.0, 0.0),
                |(p, r, f), (cp, cr, cf)| (p + cp, r + cr, f + cf),
            );
            (p / n, r / n, f / n)
        }
        AveragingMethod::Weighted => {
            let support: f64 = counts.values().map(|c| c.support).sum();
            let (p, r, f) = counts.values().fold((0.0, 0.0, 0.0), |(p, r, f), c| {
                let (cp, cr, cf) = precision_recall_f1(c);
                (p + cp * c.support, r + cr * c.support, f + cf * c.support)
            });
            (ratio(p, support), ratio(r, support), ratio(f, support))
        }
    };

    Ok(ClassificationScores {
        accuracy,
        precision,
        recall,
        f1,
    })
}
