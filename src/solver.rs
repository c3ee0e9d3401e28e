//! Training orchestration.
//!
//! [`Solver`] owns the configuration, the dataset and the checkpoint policy.
//! [`Solver::fit`] builds the model, validates the regime against the
//! dataset's annotator ordering, then runs epochs until the epoch budget is
//! spent or the validation loss plateaus.

use std::path::PathBuf;

use candle_core::Device;

use crate::checkpoint::{CheckpointPolicy, ModelPathFn, SaveParams};
use crate::config::{FitOptions, SolverConfig};
use crate::data::{AnnotatorDataset, Split};
use crate::early_stopping::{PlateauStopping, StoppingDecision};
use crate::error::{LatentTruthError, Result};
use crate::loss::Criterion;
use crate::metrics::MetricKind;
use crate::model::{AnnotatorModel, ClassifierModel, HeadSelection, ParamGroup};
use crate::optimizer::{OptimizerSettings, SolverOptimizer};
use crate::pseudo::attach_pseudo_labels;
use crate::runner::{EpochRunner, PassSummary};
use crate::sink::{MetricsSink, NoopSink};

/// Where a run stands.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum RunState {
    /// Epochs remain.
    Running,
    /// The validation loss plateaued.
    EarlyStopped {
        /// Epoch the check fired at.
        epoch: usize,
        /// Trailing mean validation loss.
        mean_loss: f64,
    },
    /// Every epoch ran.
    Completed,
}

/// Result of [`Solver::fit`].
#[derive(Debug)]
pub struct FitOutcome<M> {
    /// Trained model.
    pub model: M,
    /// Aggregated validation F1 of the last epoch, when requested.
    pub f1: Option<f64>,
    /// Final run state.
    pub state: RunState,
    /// Epochs executed.
    pub epochs_run: usize,
    /// Primary loss of every scored batch, train and validation.
    pub loss_history: Vec<f64>,
    /// Aggregated validation loss per epoch.
    pub validation_losses: Vec<f64>,
    /// Checkpoints written.
    pub checkpoints: Vec<PathBuf>,
    /// Optimizer steps taken.
    pub optimizer_steps: usize,
    /// Loss terms computed, primary and pseudo.
    pub loss_evaluations: usize,
}

/// What one epoch runs, fixed before the first epoch.
#[derive(Debug, Clone)]
enum Regime {
    /// One whole-batch pass per entry, train then validation.
    Sequential(Vec<(Option<String>, HeadSelection)>),
    /// Mixed batches masked per annotator.
    Mixed {
        filter: Option<String>,
        annotators: Vec<(String, HeadSelection)>,
    },
    /// Mixed batches on a single-output model.
    MixedBasic { filter: Option<String> },
}

/// Training orchestrator.
pub struct Solver<DS: AnnotatorDataset> {
    config: SolverConfig,
    dataset: DS,
    device: Device,
    checkpoints: CheckpointPolicy,
    sink: Box<dyn MetricsSink>,
}

impl<DS: AnnotatorDataset> Solver<DS> {
    /// Validate `config`, attach pseudo-labels when configured and check
    /// every label against `model.label_dim`.
    pub fn new(config: SolverConfig, dataset: DS) -> Result<Self> {
        config.validate()?;
        let device = config.device.to_device();
        let checkpoints = CheckpointPolicy::new(
            config.checkpoint.save_root.clone(),
            config.checkpoint.save_at.clone(),
            Some(SaveParams::new(
                config.checkpoint.stem.clone(),
                config.hyperparams(),
            )),
        );

        let mut solver = Self {
            config,
            dataset,
            device,
            checkpoints,
            sink: Box::new(NoopSink),
        };
        solver.attach_pseudo_labels()?;
        let label_dim = solver.config.model.label_dim;
        solver.dataset.check_label_range(label_dim)?;
        Ok(solver)
    }

    fn attach_pseudo_labels(&mut self) -> Result<()> {
        let Some(pseudo) = &self.config.pseudo_labels else {
            return Ok(());
        };
        let attached = attach_pseudo_labels(
            &mut self.dataset,
            pseudo,
            &self.config.model,
            self.config.training.loss,
            &self.device,
        )?;
        tracing::info!("Pseudo-labels attached: {attached}");
        Ok(())
    }

    /// Send per-pass metrics to `sink`.
    pub fn with_sink(mut self, sink: Box<dyn MetricsSink>) -> Self {
        self.sink = sink;
        self
    }

    /// Override the configured device.
    pub fn with_device(mut self, device: Device) -> Self {
        self.device = device;
        self
    }

    /// Replace the run identity used in checkpoint names.
    pub fn with_checkpoint_params(mut self, params: SaveParams) -> Self {
        self.checkpoints = self.checkpoints.with_params(params);
        self
    }

    /// Replace the checkpoint base path builder.
    pub fn with_path_fn(mut self, path_fn: ModelPathFn) -> Self {
        self.checkpoints = self.checkpoints.with_path_fn(path_fn);
        self
    }

    /// Configuration.
    pub fn config(&self) -> &SolverConfig {
        &self.config
    }

    /// Dataset.
    pub fn dataset(&self) -> &DS {
        &self.dataset
    }

    /// Mutable dataset, e.g. for evaluation after training.
    pub fn dataset_mut(&mut self) -> &mut DS {
        &mut self.dataset
    }

    /// Device models are built on.
    pub fn device(&self) -> &Device {
        &self.device
    }

    /// Criterion of the configured loss.
    pub fn criterion(&self) -> Criterion {
        Criterion::new(self.config.training.loss, self.config.model.label_dim)
    }

    /// Build the model `options` asks for and load configured weights.
    pub fn build_model(&self, options: &FitOptions) -> Result<ClassifierModel> {
        let heads = if options.basic_only {
            None
        } else {
            Some(self.dataset.annotators().len())
        };
        let model = ClassifierModel::build(
            &self.config.model,
            self.config.training.loss,
            heads,
            &self.device,
        )?;

        if let Some(path) = &self.config.model.weights_path {
            let loaded = if options.pretrained_basic && heads.is_some() {
                model.load_basic(path)?
            } else {
                model.load(path, true)?
            };
            tracing::info!("Loaded {loaded} tensors from {}", path.display());
        }
        Ok(model)
    }

    /// Build a model for `options` and train it.
    pub fn fit(&mut self, options: &FitOptions) -> Result<FitOutcome<ClassifierModel>> {
        self.check_ordering()?;
        let model = self.build_model(options)?;
        self.fit_model(model, options)
    }

    /// Train a caller-supplied model, reporting to the solver's sink.
    pub fn fit_model<M: AnnotatorModel>(
        &mut self,
        model: M,
        options: &FitOptions,
    ) -> Result<FitOutcome<M>> {
        let mut sink = std::mem::replace(&mut self.sink, Box::new(NoopSink));
        let outcome = self.fit_model_with_sink(model, options, sink.as_mut());
        self.sink = sink;
        outcome
    }

    /// Train a caller-supplied model, reporting to `sink`.
    pub fn fit_model_with_sink<M: AnnotatorModel>(
        &mut self,
        model: M,
        options: &FitOptions,
        sink: &mut dyn MetricsSink,
    ) -> Result<FitOutcome<M>> {
        options.validate()?;
        let regime = self.plan(&model, options)?;

        let group = if options.fix_base {
            ParamGroup::BiasHeads
        } else {
            ParamGroup::All
        };
        let training = &self.config.training;
        let mut optimizer = SolverOptimizer::new(
            training.optimizer,
            model.trainable_vars(group)?,
            &OptimizerSettings::from_training(training),
        )?;
        let criterion = self.criterion();
        let (batch_size, averaging, show_progress) =
            (training.batch_size, training.averaging, training.show_progress);
        let mut stopping =
            PlateauStopping::new(options.early_stopping_interval, training.early_stopping_margin);

        tracing::info!(
            "Starting training: {} epochs, {} heads, {} optimizer, {} loss",
            options.epochs,
            model.head_count(),
            training.optimizer.as_str(),
            training.loss
        );

        let mut loss_history = Vec::new();
        let mut validation_losses = Vec::new();
        let mut checkpoints = Vec::new();
        let mut optimizer_steps = 0;
        let mut loss_evaluations = 0;
        let mut f1 = None;
        let mut state = RunState::Running;
        let mut epochs_run = 0;

        for epoch in 0..options.epochs {
            let (train, validation) = {
                let mut runner = EpochRunner::new(
                    &model,
                    &mut optimizer,
                    criterion,
                    &mut *sink,
                    &mut loss_history,
                )
                .with_batch_size(batch_size)
                .with_averaging(averaging)
                .with_progress(show_progress);
                run_epoch(&mut runner, &mut self.dataset, &regime, epoch)?
            };
            epochs_run = epoch + 1;
            optimizer_steps += train.optimizer_steps + validation.optimizer_steps;
            loss_evaluations += train.loss_evaluations + validation.loss_evaluations;

            let validation_loss = validation.mean(MetricKind::Loss);
            let validation_f1 = validation.mean(MetricKind::F1);
            if options.return_f1 {
                f1 = validation_f1;
            }
            tracing::info!(
                "Epoch {epoch}: train loss {:.4}, validation loss {:.4}, validation F1 {:.4}",
                train.mean(MetricKind::Loss).unwrap_or(f64::NAN),
                validation_loss.unwrap_or(f64::NAN),
                validation_f1.unwrap_or(f64::NAN)
            );

            let score = options.return_f1.then(|| f1.unwrap_or(0.0));
            if let Some(path) = self.checkpoints.save(&model, epoch, score, false)? {
                checkpoints.push(path);
            }

            let Some(validation_loss) = validation_loss else {
                tracing::warn!("Epoch {epoch} scored no validation samples");
                continue;
            };
            validation_losses.push(validation_loss);
            if let StoppingDecision::Stop {
                reference,
                mean_loss,
            } = stopping.check(validation_loss)
            {
                tracing::info!(
                    "Early stopping at epoch {epoch}: mean loss {mean_loss:.6} within margin of {reference:.6}"
                );
                if let Some(path) = self.checkpoints.save(&model, epoch, score, true)? {
                    checkpoints.push(path);
                }
                state = RunState::EarlyStopped { epoch, mean_loss };
                break;
            }
        }
        if state == RunState::Running {
            state = RunState::Completed;
        }

        tracing::info!("Training finished after {epochs_run} epochs ({optimizer_steps} steps)");
        Ok(FitOutcome {
            model,
            f1: if options.return_f1 { f1 } else { None },
            state,
            epochs_run,
            loss_history,
            validation_losses,
            checkpoints,
            optimizer_steps,
            loss_evaluations,
        })
    }

    fn check_ordering(&self) -> Result<()> {
        let ordering = self.dataset.annotators();
        if ordering.is_empty() {
            return Err(LatentTruthError::config(
                "dataset provides no annotator ordering",
            ));
        }
        if let Some(expected) = self.config.model.annotator_dim {
            if expected != ordering.len() {
                return Err(LatentTruthError::config(format!(
                    "model.annotator_dim is {expected} but the dataset orders {} annotators",
                    ordering.len()
                )));
            }
        }
        Ok(())
    }

    /// Check `model` and `options` against the annotator ordering and fix
    /// the passes of every epoch.
    fn plan<M: AnnotatorModel>(&self, model: &M, options: &FitOptions) -> Result<Regime> {
        self.check_ordering()?;
        let ordering = self.dataset.annotators();
        let heads = model.head_count();

        if heads > 0 && heads != ordering.len() {
            return Err(LatentTruthError::config(format!(
                "model has {heads} annotator heads but the dataset orders {} annotators",
                ordering.len()
            )));
        }
        if options.fix_base && heads == 0 {
            return Err(LatentTruthError::config(
                "fix_base requires a model with annotator heads",
            ));
        }
        if options.basic_only && heads > 0 {
            return Err(LatentTruthError::config(
                "basic_only requires a single-output model",
            ));
        }
        let single = match options.single_annotator.as_deref() {
            Some(annotator) => {
                let idx = ordering.iter().position(|a| a == annotator).ok_or_else(|| {
                    LatentTruthError::config(format!(
                        "single_annotator '{annotator}' is not in the dataset ordering"
                    ))
                })?;
                Some((annotator.to_string(), idx))
            }
            None => None,
        };

        let head_of = |idx: usize| {
            if heads == 0 {
                HeadSelection::Direct
            } else {
                HeadSelection::Index(idx)
            }
        };
        let regime = if options.deep_randomization {
            let filter = single.as_ref().map(|(a, _)| a.clone());
            if heads == 0 {
                Regime::MixedBasic { filter }
            } else {
                let annotators = match &single {
                    Some((a, idx)) => vec![(a.clone(), head_of(*idx))],
                    None => ordering
                        .iter()
                        .enumerate()
                        .map(|(idx, a)| (a.clone(), head_of(idx)))
                        .collect(),
                };
                Regime::Mixed { filter, annotators }
            }
        } else {
            let passes = match (&single, heads) {
                (Some((a, idx)), _) => vec![(Some(a.clone()), head_of(*idx))],
                (None, 0) => vec![(None, HeadSelection::Direct)],
                (None, _) => ordering
                    .iter()
                    .enumerate()
                    .map(|(idx, a)| (Some(a.clone()), head_of(idx)))
                    .collect(),
            };
            Regime::Sequential(passes)
        };
        tracing::debug!(?regime, "training regime");
        Ok(regime)
    }
}

/// One training pass and one validation pass under `regime`.
fn run_epoch<M, DS>(
    runner: &mut EpochRunner<'_, M>,
    dataset: &mut DS,
    regime: &Regime,
    epoch: usize,
) -> Result<(PassSummary, PassSummary)>
where
    M: AnnotatorModel + ?Sized,
    DS: AnnotatorDataset + ?Sized,
{
    match regime {
        Regime::Sequential(passes) => {
            let mut train = PassSummary::default();
            let mut validation = PassSummary::default();
            for (annotator, head) in passes {
                let annotator = annotator.as_deref();
                train.absorb(runner.run_sequential(dataset, annotator, *head, epoch, Split::Train)?);
                validation.absorb(runner.run_sequential(
                    dataset,
                    annotator,
                    *head,
                    epoch,
                    Split::Validation,
                )?);
            }
            Ok((train, validation))
        }
        Regime::Mixed { filter, annotators } => {
            apply_filter(dataset, filter.as_deref())?;
            dataset.reshuffle_splits();
            let train = runner.run_mixed(dataset, annotators, epoch, Split::Train)?;
            let validation = runner.run_mixed(dataset, annotators, epoch, Split::Validation)?;
            Ok((train, validation))
        }
        Regime::MixedBasic { filter } => {
            apply_filter(dataset, filter.as_deref())?;
            dataset.reshuffle_splits();
            let train = runner.run_mixed_basic(dataset, epoch, Split::Train)?;
            let validation = runner.run_mixed_basic(dataset, epoch, Split::Validation)?;
            Ok((train, validation))
        }
    }
}

fn apply_filter<DS: AnnotatorDataset + ?Sized>(dataset: &mut DS, filter: Option<&str>) -> Result<()> {
    match filter {
        Some(annotator) => dataset.set_annotator_filter(annotator),
        None => {
            dataset.clear_annotator_filter();
            Ok(())
        }
    }
}
