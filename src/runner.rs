//! One data pass under one training regime.
//!
//! - [`EpochRunner::run_sequential`] - one annotator's samples, whole batches
//! - [`EpochRunner::run_mixed`] - mixed-annotator batches, one masked
//!   objective and one optimizer step per annotator per batch
//! - [`EpochRunner::run_mixed_basic`] - mixed batches on a single-output
//!   model, one combined objective per batch
//!
//! Validation passes never step the optimizer, and fall back to the train
//! split when the validation view is empty. Reported metrics only ever use
//! primary labels; pseudo-label terms feed gradients only.

use candle_core::{DType, Tensor, D};
use indicatif::{ProgressBar, ProgressStyle};

use crate::config::AveragingMethod;
use crate::data::{AnnotatorDataset, Batch, Split};
use crate::error::Result;
use crate::loss::{combine, combine_terms, Criterion};
use crate::masking::{primary_rows, pseudo_rows, select, select_pseudo};
use crate::metrics::{performance_measures, AnnotatorMetrics, BatchMeasures, MetricKind};
use crate::model::{AnnotatorModel, HeadSelection, ModelOutput};
use crate::optimizer::SolverOptimizer;
use crate::sink::{record_set, MetricsSink};

/// Metric label of passes that are not tied to one annotator.
pub const ALL_ANNOTATORS: &str = "all";

/// Outcome of one pass.
#[derive(Debug, Clone, Default)]
pub struct PassSummary {
    /// Primary-label metrics per annotator.
    pub metrics: AnnotatorMetrics,
    /// Batches drawn from the loader.
    pub batches: usize,
    /// Optimizer steps taken.
    pub optimizer_steps: usize,
    /// Loss terms computed (primary and pseudo).
    pub loss_evaluations: usize,
    /// Annotator/batch pairs without any rows for that annotator.
    pub skipped: usize,
    /// The validation view was empty and the train split was used.
    pub used_fallback_split: bool,
}

impl PassSummary {
    /// Sample-weighted mean of one metric across annotators.
    pub fn mean(&self, kind: MetricKind) -> Option<f64> {
        self.metrics.weighted_mean(kind)
    }

    /// Total primary samples scored.
    pub fn samples(&self) -> f64 {
        self.metrics.samples()
    }

    /// Fold another pass into this one.
    pub fn absorb(&mut self, other: PassSummary) {
        for (annotator, set) in other.metrics.iter() {
            self.metrics.insert(annotator, set.clone());
        }
        self.batches += other.batches;
        self.optimizer_steps += other.optimizer_steps;
        self.loss_evaluations += other.loss_evaluations;
        self.skipped += other.skipped;
        self.used_fallback_split |= other.used_fallback_split;
    }
}

/// Where pseudo-label terms are read from in whole-batch passes.
#[derive(Debug, Clone, Copy)]
enum PseudoSource<'o> {
    /// No pseudo terms.
    Ignore,
    /// Each pseudo annotator's own head, indexed by the annotator ordering.
    Heads(&'o [String]),
    /// The single model output.
    Shared,
}

/// Runs passes over borrowed model and optimizer state.
pub struct EpochRunner<'a, M: AnnotatorModel + ?Sized> {
    model: &'a M,
    optimizer: &'a mut SolverOptimizer,
    criterion: Criterion,
    averaging: AveragingMethod,
    batch_size: usize,
    sink: &'a mut dyn MetricsSink,
    loss_history: &'a mut Vec<f64>,
    show_progress: bool,
}

impl<'a, M: AnnotatorModel + ?Sized> EpochRunner<'a, M> {
    /// Create a runner.
    pub fn new(
        model: &'a M,
        optimizer: &'a mut SolverOptimizer,
        criterion: Criterion,
        sink: &'a mut dyn MetricsSink,
        loss_history: &'a mut Vec<f64>,
    ) -> Self {
        Self {
            model,
            optimizer,
            criterion,
            averaging: AveragingMethod::default(),
            batch_size: 64,
            sink,
            loss_history,
            show_progress: false,
        }
    }

    /// Set the mini-batch size.
    pub fn with_batch_size(mut self, batch_size: usize) -> Self {
        self.batch_size = batch_size;
        self
    }

    /// Set the averaging of precision, recall and F1.
    pub fn with_averaging(mut self, averaging: AveragingMethod) -> Self {
        self.averaging = averaging;
        self
    }

    /// Draw a progress bar per pass.
    pub fn with_progress(mut self, show_progress: bool) -> Self {
        self.show_progress = show_progress;
        self
    }

    /// Train or validate on one annotator's samples in stored order.
    ///
    /// `annotator == None` runs over every annotator's samples with the
    /// filter cleared. With `HeadSelection::Index`, pseudo-labels in a batch
    /// add one term per pseudo annotator, scored on that annotator's head.
    pub fn run_sequential<DS: AnnotatorDataset + ?Sized>(
        &mut self,
        dataset: &mut DS,
        annotator: Option<&str>,
        head: HeadSelection,
        epoch: usize,
        mode: Split,
    ) -> Result<PassSummary> {
        match annotator {
            Some(a) => dataset.set_annotator_filter(a)?,
            None => dataset.clear_annotator_filter(),
        }
        let ordering = dataset.annotators().to_vec();
        let pseudo = match head {
            HeadSelection::Index(_) => PseudoSource::Heads(&ordering),
            HeadSelection::Direct => PseudoSource::Ignore,
        };
        let label = annotator.unwrap_or(ALL_ANNOTATORS);
        self.run_whole_batches(dataset, label, head, pseudo, false, epoch, mode)
    }

    /// Train or validate on a single-output model over mixed batches.
    ///
    /// Uses the dataset's current annotator filter. Pseudo-labels of every
    /// annotator are scored on the single output and summed into the batch
    /// objective.
    pub fn run_mixed_basic<DS: AnnotatorDataset + ?Sized>(
        &mut self,
        dataset: &mut DS,
        epoch: usize,
        mode: Split,
    ) -> Result<PassSummary> {
        let label = dataset
            .annotator_filter()
            .unwrap_or(ALL_ANNOTATORS)
            .to_string();
        self.run_whole_batches(
            dataset,
            &label,
            HeadSelection::Direct,
            PseudoSource::Shared,
            true,
            epoch,
            mode,
        )
    }

    /// Train or validate over mixed batches with per-annotator masking.
    ///
    /// `annotators` pairs each annotator with its head. In training, every
    /// annotator with rows in a batch gets a fresh forward pass, its own
    /// objective and its own optimizer step, in the given order.
    pub fn run_mixed<DS: AnnotatorDataset + ?Sized>(
        &mut self,
        dataset: &mut DS,
        annotators: &[(String, HeadSelection)],
        epoch: usize,
        mode: Split,
    ) -> Result<PassSummary> {
        let mut summary = PassSummary {
            used_fallback_split: prepare_split(dataset, mode),
            ..Default::default()
        };
        let device = self.model.device().clone();
        let loader = dataset.loader(self.batch_size, true, &device)?;
        let pb = self.progress_bar(loader.len(), format!("Epoch {epoch} {mode}"))?;
        let train = mode == Split::Train;

        for batch in loader {
            let batch = batch?;
            summary.batches += 1;
            let shared = if train {
                None
            } else {
                Some(self.model.forward(&batch.input)?)
            };

            for (annotator, head) in annotators {
                let has_primary = !primary_rows(&batch, annotator).is_empty();
                let has_pseudo = train && !pseudo_rows(&batch, annotator).is_empty();
                if !has_primary && !has_pseudo {
                    summary.skipped += 1;
                    tracing::debug!(annotator = %annotator, epoch, "no rows in batch; skipping");
                    continue;
                }

                let fresh;
                let output = match &shared {
                    Some(output) => output,
                    None => {
                        fresh = self.model.forward(&batch.input)?;
                        &fresh
                    }
                };
                let scores = output.select(*head)?;

                let primary = select(&batch, scores, annotator)?;
                let primary_loss = match &primary {
                    Some(sel) => {
                        summary.loss_evaluations += 1;
                        Some(self.criterion.loss(&sel.outputs, &sel.targets)?)
                    }
                    None => None,
                };
                let pseudo_loss = if train {
                    match select_pseudo(&batch, scores, annotator)? {
                        Some(sel) => {
                            summary.loss_evaluations += 1;
                            Some(self.criterion.loss(&sel.outputs, &sel.targets)?)
                        }
                        None => None,
                    }
                } else {
                    None
                };

                if let (Some(sel), Some(loss)) = (&primary, &primary_loss) {
                    let measures = self.measure(&sel.outputs, &sel.targets, loss)?;
                    summary.metrics.entry(annotator).update(&measures, sel.len());
                    self.loss_history.push(measures.loss);
                }

                let Some(objective) = combine(primary_loss, pseudo_loss)? else {
                    summary.skipped += 1;
                    continue;
                };
                if train {
                    self.optimizer.backward_step(&objective)?;
                    summary.optimizer_steps += 1;
                }
            }
            pb.inc(1);
        }
        pb.finish_and_clear();

        self.finish_pass(&summary, epoch, mode);
        Ok(summary)
    }

    #[allow(clippy::too_many_arguments)]
    fn run_whole_batches<DS: AnnotatorDataset + ?Sized>(
        &mut self,
        dataset: &mut DS,
        label: &str,
        head: HeadSelection,
        pseudo: PseudoSource<'_>,
        shuffle: bool,
        epoch: usize,
        mode: Split,
    ) -> Result<PassSummary> {
        let mut summary = PassSummary {
            used_fallback_split: prepare_split(dataset, mode),
            ..Default::default()
        };
        let device = self.model.device().clone();
        let loader = dataset.loader(self.batch_size, shuffle, &device)?;
        let pb = self.progress_bar(loader.len(), format!("Annotator {label} - Epoch {epoch}"))?;
        let train = mode == Split::Train;

        for batch in loader {
            let batch = batch?;
            summary.batches += 1;

            let output = self.model.forward(&batch.input)?;
            let scores = output.select(head)?;
            let loss = self.criterion.loss(scores, &batch.target)?;
            summary.loss_evaluations += 1;

            let measures = self.measure(scores, &batch.target, &loss)?;
            summary.metrics.entry(label).update(&measures, batch.len());
            self.loss_history.push(measures.loss);

            if train {
                let auxiliary = self.pseudo_terms(&batch, &output, pseudo)?;
                summary.loss_evaluations += auxiliary.len();
                if let Some(objective) = combine_terms(Some(loss), auxiliary)? {
                    self.optimizer.backward_step(&objective)?;
                    summary.optimizer_steps += 1;
                }
            }
            pb.inc(1);
        }
        pb.finish_and_clear();

        self.finish_pass(&summary, epoch, mode);
        Ok(summary)
    }

    fn pseudo_terms(
        &self,
        batch: &Batch,
        output: &ModelOutput,
        source: PseudoSource<'_>,
    ) -> Result<Vec<Tensor>> {
        let mut terms = Vec::new();
        if matches!(source, PseudoSource::Ignore) {
            return Ok(terms);
        }
        for annotator in batch.pseudo_annotators() {
            let selection = match source {
                PseudoSource::Ignore | PseudoSource::Shared => HeadSelection::Direct,
                PseudoSource::Heads(ordering) => {
                    match ordering.iter().position(|a| a == annotator) {
                        Some(idx) => HeadSelection::Index(idx),
                        None => {
                            tracing::debug!(annotator, "pseudo annotator has no head; skipping");
                            continue;
                        }
                    }
                }
            };
            let scores = output.select(selection)?;
            if let Some(sel) = select_pseudo(batch, scores, annotator)? {
                terms.push(self.criterion.loss(&sel.outputs, &sel.targets)?);
            }
        }
        Ok(terms)
    }

    fn measure(&self, outputs: &Tensor, targets: &Tensor, loss: &Tensor) -> Result<BatchMeasures> {
        let predictions = outputs.argmax(D::Minus1)?.to_vec1::<u32>()?;
        let labels = targets.to_vec1::<u32>()?;
        Ok(BatchMeasures {
            loss: f64::from(loss.to_dtype(DType::F32)?.to_scalar::<f32>()?),
            scores: performance_measures(&predictions, &labels, self.averaging)?,
        })
    }

    fn finish_pass(&mut self, summary: &PassSummary, epoch: usize, mode: Split) {
        for (annotator, set) in summary.metrics.iter() {
            record_set(&mut *self.sink, set, annotator, mode, epoch);
            tracing::debug!(
                annotator,
                epoch,
                split = %mode,
                loss = set.score(MetricKind::Loss),
                f1 = set.score(MetricKind::F1),
                "pass finished"
            );
        }
    }

    fn progress_bar(&self, len: usize, message: String) -> Result<ProgressBar> {
        if !self.show_progress {
            return Ok(ProgressBar::hidden());
        }
        let pb = ProgressBar::new(len as u64);
        pb.set_style(
            ProgressStyle::default_bar()
                .template("{spinner:.green} [{elapsed_precise}] [{wide_bar:.cyan/blue}] {pos:>7}/{len:7} {msg}")?
                .progress_chars("#>-"),
        );
        pb.set_message(message);
        Ok(pb)
    }
}

/// Switch to `mode`, falling back to the train split when a validation
/// view is empty. Returns whether the fallback fired.
fn prepare_split<DS: AnnotatorDataset + ?Sized>(dataset: &mut DS, mode: Split) -> bool {
    dataset.set_mode(mode);
    if mode == Split::Validation && dataset.is_empty() {
        tracing::debug!(
            filter = dataset.annotator_filter().unwrap_or(ALL_ANNOTATORS),
            "validation split empty; using train split"
        );
        dataset.set_mode(Split::Train);
        return true;
    }
    false
}
