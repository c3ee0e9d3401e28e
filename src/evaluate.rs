//! Read-only evaluation of trained models.
//!
//! [`Evaluator`] borrows a model and never touches parameters or optimizer
//! state. It does move the dataset's mode and annotator filter; both are
//! left at the evaluated split with the filter cleared.

use std::collections::BTreeMap;
use std::fmt::Write as _;
use std::path::Path;

use candle_core::{DType, Tensor, D};
use serde::{Deserialize, Serialize};

use crate::config::AveragingMethod;
use crate::data::{collate_batch, AnnotatorDataset, Sample, Split};
use crate::error::{LatentTruthError, Result};
use crate::loss::Criterion;
use crate::metrics::{performance_measures, RunningMetric};
use crate::model::{AnnotatorModel, HeadSelection};

const EVAL_BATCH: usize = 256;
const DISAGREEMENT_POINTS: usize = 5;

/// How many labels each evaluated sample carries.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum LabelingScheme {
    /// Score the latent truth against every label of the split.
    #[default]
    Single,
    /// Score each annotator's head on that annotator's samples.
    Multi,
}

impl std::str::FromStr for LabelingScheme {
    type Err = LatentTruthError;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "single" => Ok(Self::Single),
            "multi" => Ok(Self::Multi),
            other => Err(LatentTruthError::config(format!(
                "unknown labeling scheme '{other}' (expected single or multi)"
            ))),
        }
    }
}

/// Resolves disagreeing labels of one item into a single label.
pub trait TruthEstimator {
    /// Map every item id to its estimated true class.
    fn estimate(
        &self,
        votes: &BTreeMap<u64, Vec<(String, u32)>>,
        num_classes: usize,
    ) -> Result<BTreeMap<u64, u32>>;
}

/// Most frequent label per item; ties go to the lowest class.
#[derive(Debug, Default, Clone, Copy)]
pub struct MajorityVote;

impl TruthEstimator for MajorityVote {
    fn estimate(
        &self,
        votes: &BTreeMap<u64, Vec<(String, u32)>>,
        num_classes: usize,
    ) -> Result<BTreeMap<u64, u32>> {
        let mut truth = BTreeMap::new();
        for (&id, item_votes) in votes {
            let mut counts = vec![0usize; num_classes];
            for (annotator, label) in item_votes {
                let slot = counts.get_mut(*label as usize).ok_or_else(|| {
                    LatentTruthError::evaluation(format!(
                        "item {id}: label {label} from {annotator} exceeds {num_classes} classes"
                    ))
                })?;
                *slot += 1;
            }
            let best = counts
                .iter()
                .enumerate()
                .fold((0, 0), |best, (class, &n)| if n > best.1 { (class, n) } else { best });
            if best.1 > 0 {
                truth.insert(id, best.0 as u32);
            }
        }
        Ok(truth)
    }
}

/// Accuracy and F1 of a model, with an optional baseline.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SimpleEvaluation {
    /// Accuracy of the evaluated model.
    pub accuracy: f64,
    /// F1 of the evaluated model.
    pub f1: f64,
    /// Accuracy of the baseline model.
    pub baseline_accuracy: Option<f64>,
    /// F1 of the baseline model.
    pub baseline_f1: Option<f64>,
    /// Samples scored.
    pub samples: usize,
}

/// Per-annotator section of an [`EvaluationReport`].
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AnnotatorReport {
    /// Annotator id.
    pub annotator: String,
    /// Samples labeled by this annotator in the split.
    pub samples: usize,
    /// Mean loss of this annotator's head (or the single output).
    pub mean_loss: Option<f64>,
    /// Row-normalized confusion of label (rows) vs latent truth (columns).
    pub confusion: Vec<Vec<f64>>,
    /// Learned bias matrix of this annotator's head.
    pub bias_matrix: Option<Vec<Vec<f32>>>,
    /// Samples each head predicted correctly, in ordering order.
    pub correct_by_head: Vec<(String, usize)>,
    /// Samples on which the heads disagree.
    pub disagreements: usize,
    /// First disagreeing points (1-based within the annotator).
    pub disagreement_points: Vec<usize>,
}

/// One evaluated sample.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SamplePrediction {
    /// Producing annotator.
    pub annotator: String,
    /// Position within the annotator's samples, 1-based.
    pub point: usize,
    /// Sample id.
    pub id: u64,
    /// Annotator label.
    pub label: u32,
    /// Latent-truth scores.
    pub latent_truth: Vec<f32>,
    /// Scores of every head, in ordering order.
    pub heads: Vec<Vec<f32>>,
}

/// Full evaluation report.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EvaluationReport {
    /// Evaluated split.
    pub split: Split,
    /// Mean over annotators of their mean losses.
    pub mean_loss: Option<f64>,
    /// Per-annotator sections.
    pub annotators: Vec<AnnotatorReport>,
    /// Samples predicted correctly by the producing annotator's head.
    pub overall_correct: usize,
    /// Samples scored.
    pub overall_total: usize,
    /// Baseline samples predicted correctly.
    pub baseline_correct: Option<usize>,
    /// Per-sample listing.
    pub samples: Vec<SamplePrediction>,
    /// Class names.
    pub labels: Option<Vec<String>>,
}

impl EvaluationReport {
    /// Overall accuracy.
    pub fn overall_accuracy(&self) -> f64 {
        ratio(self.overall_correct, self.overall_total)
    }

    /// Baseline accuracy.
    pub fn baseline_accuracy(&self) -> Option<f64> {
        self.baseline_correct
            .map(|correct| ratio(correct, self.overall_total))
    }

    /// Human-readable rendering.
    pub fn render(&self) -> String {
        let mut out = String::new();
        let has_heads = self.annotators.iter().any(|a| a.bias_matrix.is_some());

        let _ = writeln!(out, "Overall accuracies\n");
        let _ = writeln!(
            out,
            "Accuracy{} on {}: {} / {} ({:.5})",
            if has_heads { " with bias matrices" } else { "" },
            self.split,
            self.overall_correct,
            self.overall_total,
            self.overall_accuracy()
        );
        if let (Some(correct), Some(acc)) = (self.baseline_correct, self.baseline_accuracy()) {
            let _ = writeln!(
                out,
                "Accuracy of baseline model: {correct} / {} ({acc:.5})",
                self.overall_total
            );
        }
        let _ = writeln!(out);

        if let Some(mean) = self.mean_loss {
            let _ = writeln!(out, "Mean loss (over annotators and samples): {mean:.5}");
            for annotator in &self.annotators {
                if let Some(loss) = annotator.mean_loss {
                    let _ = write!(out, "Annotator {}: {loss:.5}    ", annotator.annotator);
                }
            }
            let _ = writeln!(out, "\n");
        }

        if has_heads {
            let _ = writeln!(out, "Annotation bias and confusion matrices\n");
            for annotator in &self.annotators {
                let _ = writeln!(out, "Annotator {}", annotator.annotator);
                if let Some(bias) = &annotator.bias_matrix {
                    self.render_matrix(&mut out, "Output\\LatentTruth", bias.iter().map(|row| {
                        row.iter().map(|&v| f64::from(v)).collect()
                    }));
                }
                self.render_matrix(
                    &mut out,
                    "Label\\LatentTruth",
                    annotator.confusion.iter().cloned(),
                );
                let _ = writeln!(out);
            }

            for annotator in &self.annotators {
                let _ = writeln!(out, "{0}   Annotator {1}   {0}", "-".repeat(25), annotator.annotator);
                let _ = writeln!(
                    out,
                    "Different answers given by bias matrices {} / {} times",
                    annotator.disagreements, annotator.samples
                );
                let _ = writeln!(out, "Different answers at points: {:?}", annotator.disagreement_points);
                let _ = writeln!(out, "Accuracies of samples labeled by {}:", annotator.annotator);
                for (head, correct) in &annotator.correct_by_head {
                    let _ = write!(out, "Annotator {head}: {correct} / {}     ", annotator.samples);
                }
                let _ = writeln!(out, "\n");
            }
        }

        for sample in &self.samples {
            let _ = write!(
                out,
                "Point {} - Label by {}: {} - Latent truth {:?}",
                sample.point, sample.annotator, sample.label, sample.latent_truth
            );
            for (annotator, scores) in self.annotators.iter().zip(&sample.heads) {
                let _ = write!(out, " - Annotator {} {scores:?}", annotator.annotator);
            }
            let _ = writeln!(out);
        }
        out
    }

    fn render_matrix(&self, out: &mut String, title: &str, rows: impl Iterator<Item = Vec<f64>>) {
        let _ = write!(out, "{title:<20}");
        if let Some(labels) = &self.labels {
            for label in labels {
                let _ = write!(out, "{label:>12}");
            }
        }
        let _ = writeln!(out);
        for (j, row) in rows.enumerate() {
            let name = self
                .labels
                .as_ref()
                .and_then(|labels| labels.get(j).cloned())
                .unwrap_or_else(|| j.to_string());
            let _ = write!(out, "{name:<20}");
            for value in row {
                let _ = write!(out, "{value:>12.4}");
            }
            let _ = writeln!(out);
        }
    }
}

fn ratio(num: usize, den: usize) -> f64 {
    if den == 0 {
        0.0
    } else {
        num as f64 / den as f64
    }
}

fn argmax_rows(scores: &Tensor) -> Result<Vec<u32>> {
    Ok(scores.argmax(D::Minus1)?.to_vec1::<u32>()?)
}

fn rows_f32(scores: &Tensor) -> Result<Vec<Vec<f32>>> {
    Ok(scores.to_dtype(DType::F32)?.to_vec2::<f32>()?)
}

/// Evaluates one model, optionally against a baseline.
pub struct Evaluator<'a, M: AnnotatorModel + ?Sized> {
    model: &'a M,
    criterion: Criterion,
    averaging: AveragingMethod,
    baseline: Option<&'a dyn AnnotatorModel>,
}

impl<'a, M: AnnotatorModel + ?Sized> Evaluator<'a, M> {
    /// Create an evaluator.
    pub fn new(model: &'a M, criterion: Criterion) -> Self {
        Self {
            model,
            criterion,
            averaging: AveragingMethod::default(),
            baseline: None,
        }
    }

    /// Set the F1 averaging.
    pub fn with_averaging(mut self, averaging: AveragingMethod) -> Self {
        self.averaging = averaging;
        self
    }

    /// Compare against `baseline`, typically a pretrained basic network.
    pub fn with_baseline(mut self, baseline: &'a dyn AnnotatorModel) -> Self {
        self.baseline = Some(baseline);
        self
    }

    fn head(&self, idx: usize) -> HeadSelection {
        if self.model.head_count() == 0 {
            HeadSelection::Direct
        } else {
            HeadSelection::Index(idx)
        }
    }

    /// Build the full report for `split`.
    ///
    /// `labels`, when given, names the classes and must have one entry per
    /// class.
    pub fn report<DS: AnnotatorDataset + ?Sized>(
        &self,
        dataset: &mut DS,
        split: Split,
        labels: Option<&[String]>,
    ) -> Result<EvaluationReport> {
        let num_classes = self.criterion.num_classes();
        if let Some(labels) = labels {
            if labels.len() != num_classes {
                return Err(LatentTruthError::config(format!(
                    "{} class names for {num_classes} classes",
                    labels.len()
                )));
            }
        }
        let device = self.model.device().clone();
        let heads = self.model.head_count();
        let ordering = dataset.annotators().to_vec();
        dataset.set_mode(split);

        let mut report = EvaluationReport {
            split,
            mean_loss: None,
            annotators: Vec::with_capacity(ordering.len()),
            overall_correct: 0,
            overall_total: 0,
            baseline_correct: self.baseline.map(|_| 0),
            samples: Vec::new(),
            labels: labels.map(<[String]>::to_vec),
        };
        let mut loss_over_annotators = RunningMetric::new();

        for (idx, annotator) in ordering.iter().enumerate() {
            dataset.set_annotator_filter(annotator)?;
            let samples = dataset.samples();
            let mut section = AnnotatorReport {
                annotator: annotator.clone(),
                samples: samples.len(),
                mean_loss: None,
                confusion: vec![vec![0.0; num_classes]; num_classes],
                bias_matrix: if heads > 0 {
                    Some(rows_f32(&self.model.bias_matrix(idx)?)?)
                } else {
                    None
                },
                correct_by_head: ordering.iter().take(heads).map(|a| (a.clone(), 0)).collect(),
                disagreements: 0,
                disagreement_points: Vec::new(),
            };
            let mut loss = RunningMetric::new();
            let mut point = 0;

            for chunk in samples.chunks(EVAL_BATCH) {
                let batch = collate_batch(chunk, &device)?;
                let output = self.model.forward(&batch.input)?;
                let scores = output.select(self.head(idx))?;
                let batch_loss = self
                    .criterion
                    .loss(scores, &batch.target)?
                    .to_dtype(DType::F32)?
                    .to_scalar::<f32>()?;
                loss.update(f64::from(batch_loss), chunk.len() as f64);

                let targets = batch.target.to_vec1::<u32>()?;
                let latent = self.model.latent_truth(&batch.input)?;
                let latent_pred = argmax_rows(&latent)?;
                let latent_rows = rows_f32(&latent)?;
                let own_pred = argmax_rows(scores)?;
                let mut head_preds = Vec::with_capacity(heads);
                let mut head_rows = Vec::with_capacity(heads);
                for h in 0..heads {
                    let head_scores = output.select(HeadSelection::Index(h))?;
                    head_preds.push(argmax_rows(head_scores)?);
                    head_rows.push(rows_f32(head_scores)?);
                }
                let baseline_pred = match self.baseline {
                    Some(baseline) => Some(argmax_rows(&baseline.latent_truth(&batch.input)?)?),
                    None => None,
                };

                for (row, sample) in chunk.iter().enumerate() {
                    point += 1;
                    let label = targets[row];
                    if let Some(cell) = section
                        .confusion
                        .get_mut(label as usize)
                        .and_then(|r| r.get_mut(latent_pred[row] as usize))
                    {
                        *cell += 1.0;
                    }
                    for (h, preds) in head_preds.iter().enumerate() {
                        if preds[row] == label {
                            section.correct_by_head[h].1 += 1;
                        }
                    }
                    if heads > 1 && head_preds.iter().any(|p| p[row] != head_preds[0][row]) {
                        section.disagreements += 1;
                        if section.disagreement_points.len() < DISAGREEMENT_POINTS {
                            section.disagreement_points.push(point);
                        }
                    }
                    if own_pred[row] == label {
                        report.overall_correct += 1;
                    }
                    if let (Some(preds), Some(correct)) =
                        (&baseline_pred, report.baseline_correct.as_mut())
                    {
                        if preds[row] == label {
                            *correct += 1;
                        }
                    }
                    report.samples.push(SamplePrediction {
                        annotator: annotator.clone(),
                        point,
                        id: sample.id,
                        label,
                        latent_truth: latent_rows[row].clone(),
                        heads: head_rows.iter().map(|rows| rows[row].clone()).collect(),
                    });
                }
            }

            for row in &mut section.confusion {
                let total: f64 = row.iter().sum();
                if total > 0.0 {
                    row.iter_mut().for_each(|v| *v /= total);
                }
            }
            if !loss.is_empty() {
                section.mean_loss = Some(loss.score());
                loss_over_annotators.update(loss.score(), 1.0);
            }
            report.overall_total += section.samples;
            report.annotators.push(section);
        }
        dataset.clear_annotator_filter();

        if !loss_over_annotators.is_empty() {
            report.mean_loss = Some(loss_over_annotators.score());
        }
        Ok(report)
    }

    /// Build the report for `split` and write its rendering to `path`.
    pub fn write_report<DS: AnnotatorDataset + ?Sized>(
        &self,
        dataset: &mut DS,
        path: &Path,
        split: Split,
        labels: Option<&[String]>,
    ) -> Result<EvaluationReport> {
        let report = self.report(dataset, split, labels)?;
        if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
            std::fs::create_dir_all(parent)?;
        }
        std::fs::write(path, report.render())?;
        tracing::info!("Wrote evaluation report to: {}", path.display());
        Ok(report)
    }

    /// Accuracy and F1 on `split` under `scheme`.
    pub fn evaluate_simple<DS: AnnotatorDataset + ?Sized>(
        &self,
        dataset: &mut DS,
        scheme: LabelingScheme,
        split: Split,
    ) -> Result<SimpleEvaluation> {
        dataset.set_mode(split);
        let device = self.model.device().clone();
        match scheme {
            LabelingScheme::Single => {
                dataset.clear_annotator_filter();
                let samples = dataset.samples();
                let labels: Vec<u32> = samples.iter().map(|s| s.target).collect();
                let predictions = self.predict(&samples, &device, |input| {
                    self.model.latent_truth(input)
                })?;
                let baseline = self.baseline_predictions(&samples, &device)?;
                self.score(&predictions, baseline.as_deref(), &labels)
            }
            LabelingScheme::Multi => {
                let ordering = dataset.annotators().to_vec();
                let mut accuracy = RunningMetric::new();
                let mut f1 = RunningMetric::new();
                let mut baseline_accuracy = RunningMetric::new();
                let mut baseline_f1 = RunningMetric::new();
                for (idx, annotator) in ordering.iter().enumerate() {
                    dataset.set_annotator_filter(annotator)?;
                    let samples = dataset.samples();
                    if samples.is_empty() {
                        continue;
                    }
                    let labels: Vec<u32> = samples.iter().map(|s| s.target).collect();
                    let head = self.head(idx);
                    let predictions = self.predict(&samples, &device, |input| {
                        Ok(self.model.forward(input)?.select(head)?.clone())
                    })?;
                    let baseline = self.baseline_predictions(&samples, &device)?;
                    let scores = self.score(&predictions, baseline.as_deref(), &labels)?;

                    let weight = samples.len() as f64;
                    accuracy.update(scores.accuracy, weight);
                    f1.update(scores.f1, weight);
                    if let (Some(acc), Some(bf1)) = (scores.baseline_accuracy, scores.baseline_f1) {
                        baseline_accuracy.update(acc, weight);
                        baseline_f1.update(bf1, weight);
                    }
                }
                dataset.clear_annotator_filter();
                if accuracy.is_empty() {
                    return Err(LatentTruthError::evaluation(format!(
                        "no samples to evaluate in the {split} split"
                    )));
                }
                Ok(SimpleEvaluation {
                    accuracy: accuracy.score(),
                    f1: f1.score(),
                    baseline_accuracy: (!baseline_accuracy.is_empty())
                        .then(|| baseline_accuracy.score()),
                    baseline_f1: (!baseline_f1.is_empty()).then(|| baseline_f1.score()),
                    samples: accuracy.samples() as usize,
                })
            }
        }
    }

    /// Accuracy and F1 of the latent truth against labels resolved per item
    /// by `estimator`.
    pub fn evaluate_consensus<DS: AnnotatorDataset + ?Sized>(
        &self,
        dataset: &mut DS,
        estimator: &dyn TruthEstimator,
        split: Split,
    ) -> Result<SimpleEvaluation> {
        dataset.set_mode(split);
        dataset.clear_annotator_filter();
        let samples = dataset.samples();

        let mut votes: BTreeMap<u64, Vec<(String, u32)>> = BTreeMap::new();
        let mut items: BTreeMap<u64, &Sample> = BTreeMap::new();
        for sample in &samples {
            votes
                .entry(sample.id)
                .or_default()
                .push((sample.annotator.clone(), sample.target));
            items.entry(sample.id).or_insert(sample);
        }
        let truth = estimator.estimate(&votes, self.criterion.num_classes())?;

        let mut resolved = Vec::with_capacity(truth.len());
        let mut labels = Vec::with_capacity(truth.len());
        for (id, label) in &truth {
            if let Some(sample) = items.get(id) {
                resolved.push(*sample);
                labels.push(*label);
            }
        }
        let device = self.model.device().clone();
        let predictions =
            self.predict(&resolved, &device, |input| self.model.latent_truth(input))?;
        let baseline = self.baseline_predictions(&resolved, &device)?;
        self.score(&predictions, baseline.as_deref(), &labels)
    }

    fn predict(
        &self,
        samples: &[&Sample],
        device: &candle_core::Device,
        scores: impl Fn(&Tensor) -> Result<Tensor>,
    ) -> Result<Vec<u32>> {
        let mut predictions = Vec::with_capacity(samples.len());
        for chunk in samples.chunks(EVAL_BATCH) {
            let batch = collate_batch(chunk, device)?;
            predictions.extend(argmax_rows(&scores(&batch.input)?)?);
        }
        Ok(predictions)
    }

    fn baseline_predictions(
        &self,
        samples: &[&Sample],
        device: &candle_core::Device,
    ) -> Result<Option<Vec<u32>>> {
        match self.baseline {
            Some(baseline) => Ok(Some(
                self.predict(samples, device, |input| baseline.latent_truth(input))?,
            )),
            None => Ok(None),
        }
    }

    fn score(
        &self,
        predictions: &[u32],
        baseline: Option<&[u32]>,
        labels: &[u32],
    ) -> Result<SimpleEvaluation> {
        let scores = performance_measures(predictions, labels, self.averaging)?;
        let baseline = baseline
            .map(|preds| performance_measures(preds, labels, self.averaging))
            .transpose()?;
        Ok(SimpleEvaluation {
            accuracy: scores.accuracy,
            f1: scores.f1,
            baseline_accuracy: baseline.as_ref().map(|s| s.accuracy),
            baseline_f1: baseline.as_ref().map(|s| s.f1),
            samples: labels.len(),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{LossKind, ModelConfig};
    use crate::data::InMemoryDataset;
    use crate::model::{BasicNetwork, LatentTruthNetwork, OutputNormalization};
    use candle_core::Device;

    fn config() -> ModelConfig {
        ModelConfig {
            embedding_dim: 2,
            hidden_dim: 3,
            label_dim: 2,
            ..Default::default()
        }
    }

    fn dataset() -> InMemoryDataset {
        let sample = |id: u64, target: u32, annotator: &str| {
            Sample::new(id, vec![id as f32, 1.0], target, annotator)
        };
        InMemoryDataset::from_splits(
            vec!["a".into(), "b".into()],
            Vec::new(),
            Vec::new(),
            vec![
                sample(0, 0, "a"),
                sample(0, 1, "b"),
                sample(1, 1, "a"),
                sample(1, 1, "b"),
                sample(2, 0, "a"),
            ],
        )
        .unwrap()
    }

    fn criterion() -> Criterion {
        Criterion::new(LossKind::CrossEntropy, 2)
    }

    #[test]
    fn test_majority_vote_breaks_ties_low() {
        let mut votes = BTreeMap::new();
        votes.insert(0, vec![("a".to_string(), 1), ("b".to_string(), 0)]);
        votes.insert(1, vec![("a".to_string(), 1), ("b".to_string(), 1), ("c".to_string(), 0)]);
        let truth = MajorityVote.estimate(&votes, 2).unwrap();
        assert_eq!(truth[&0], 0);
        assert_eq!(truth[&1], 1);
    }

    #[test]
    fn test_majority_vote_rejects_out_of_range_labels() {
        let mut votes = BTreeMap::new();
        votes.insert(0, vec![("a".to_string(), 4)]);
        assert!(MajorityVote.estimate(&votes, 2).is_err());
    }

    #[test]
    fn test_report_covers_every_annotator() {
        let model =
            LatentTruthNetwork::new(&config(), 2, OutputNormalization::Softmax, &Device::Cpu)
                .unwrap();
        let mut ds = dataset();
        let labels = vec!["neg".to_string(), "pos".to_string()];
        let report = Evaluator::new(&model, criterion())
            .report(&mut ds, Split::Test, Some(&labels))
            .unwrap();

        assert_eq!(report.overall_total, 5);
        assert_eq!(report.samples.len(), 5);
        assert_eq!(report.annotators.len(), 2);
        let a = &report.annotators[0];
        assert_eq!(a.samples, 3);
        // identity-initialized heads agree with each other
        assert_eq!(a.disagreements, 0);
        assert_eq!(a.bias_matrix.as_ref().unwrap().len(), 2);
        for row in &a.confusion {
            let total: f64 = row.iter().sum();
            assert!(total == 0.0 || (total - 1.0).abs() < 1e-9);
        }
        assert!(report.mean_loss.is_some());
        assert!(report.render().contains("Annotator a"));
        assert!(ds.annotator_filter().is_none());
    }

    #[test]
    fn test_report_rejects_wrong_label_count() {
        let model = BasicNetwork::new(&config(), OutputNormalization::Softmax, &Device::Cpu).unwrap();
        let mut ds = dataset();
        let labels = vec!["only".to_string()];
        assert!(Evaluator::new(&model, criterion())
            .report(&mut ds, Split::Test, Some(&labels))
            .is_err());
    }

    #[test]
    fn test_write_report_creates_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("reports/eval.txt");
        let model = BasicNetwork::new(&config(), OutputNormalization::Softmax, &Device::Cpu).unwrap();
        let mut ds = dataset();
        let report = Evaluator::new(&model, criterion())
            .write_report(&mut ds, &path, Split::Test, None)
            .unwrap();
        assert!(report.annotators.iter().all(|a| a.bias_matrix.is_none()));
        let text = std::fs::read_to_string(&path).unwrap();
        assert!(text.contains("Overall accuracies"));
    }

    #[test]
    fn test_simple_schemes_and_baseline() {
        let model =
            LatentTruthNetwork::new(&config(), 2, OutputNormalization::Softmax, &Device::Cpu)
                .unwrap();
        let baseline =
            BasicNetwork::new(&config(), OutputNormalization::Softmax, &Device::Cpu).unwrap();
        let mut ds = dataset();
        let evaluator = Evaluator::new(&model, criterion()).with_baseline(&baseline);

        let single = evaluator
            .evaluate_simple(&mut ds, LabelingScheme::Single, Split::Test)
            .unwrap();
        assert_eq!(single.samples, 5);
        assert!(single.baseline_accuracy.is_some());

        let multi = evaluator
            .evaluate_simple(&mut ds, LabelingScheme::Multi, Split::Test)
            .unwrap();
        assert_eq!(multi.samples, 5);
        assert!((0.0..=1.0).contains(&multi.accuracy));
    }

    #[test]
    fn test_consensus_scores_one_label_per_item() {
        let model = BasicNetwork::new(&config(), OutputNormalization::Softmax, &Device::Cpu).unwrap();
        let mut ds = dataset();
        let result = Evaluator::new(&model, criterion())
            .evaluate_consensus(&mut ds, &MajorityVote, Split::Test)
            .unwrap();
        assert_eq!(result.samples, 3);
        assert!(result.baseline_f1.is_none());
    }

    #[test]
    fn test_labeling_scheme_from_str() {
        assert_eq!("multi".parse::<LabelingScheme>().unwrap(), LabelingScheme::Multi);
        assert!("mutli".parse::<LabelingScheme>().is_err());
    }
}
