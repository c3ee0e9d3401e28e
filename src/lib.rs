//! # latent-truth-rs
//!
//! Trains classifiers from labels produced by several annotators, each with
//! its own bias. A shared network predicts the annotator-independent latent
//! truth; one learned bias matrix per annotator maps it to what that
//! annotator would say.
//!
//! ## Features
//!
//! - **Two regimes** - sequential per-annotator passes, or mixed batches
//!   masked per annotator with one optimizer step per annotator
//! - **Pseudo-labels** - weak supervision from other annotators' models
//! - **Plateau early stopping** and epoch-listed checkpoints
//! - **Evaluation reports** with confusion and bias matrices
//!
//! ## Quick Start (CLI)
//!
//! ```bash
//! # Write a sample configuration
//! latent-truth init config.yaml --preset binary-sentiment
//!
//! # Validate and train
//! latent-truth validate config.yaml
//! latent-truth train config.yaml
//! ```
//!
//! ## Quick Start (Library)
//!
//! ```no_run
//! use latent_truth_rs::{InMemoryDataset, Solver, SolverConfig};
//!
//! # fn main() -> latent_truth_rs::Result<()> {
//! let config = SolverConfig::from_file("config.yaml")?;
//! let dataset = InMemoryDataset::from_jsonl("train.jsonl", 0.1, 0.1, 42)?;
//!
//! let options = config.fit.clone();
//! let mut solver = Solver::new(config, dataset)?;
//! let outcome = solver.fit(&options)?;
//! println!("stopped after {} epochs: {:?}", outcome.epochs_run, outcome.state);
//! # Ok(())
//! # }
//! ```

#![warn(missing_docs)]

pub mod checkpoint;
pub mod config;
pub mod data;
pub mod early_stopping;
pub mod error;
pub mod evaluate;
pub mod loss;
pub mod masking;
pub mod metrics;
pub mod model;
pub mod optimizer;
pub mod pseudo;
pub mod runner;
pub mod sink;
pub mod solver;

pub use config::{FitOptions, SolverConfig};
pub use data::{AnnotatorDataset, InMemoryDataset, Sample, Split};
pub use error::{LatentTruthError, Result};
pub use evaluate::{Evaluator, LabelingScheme, MajorityVote};
pub use model::{AnnotatorModel, ClassifierModel};
pub use solver::{FitOutcome, RunState, Solver};

/// Common imports.
pub mod prelude {
    pub use crate::checkpoint::{CheckpointPolicy, SaveParams};
    pub use crate::config::{FitOptions, LossKind, OptimizerKind, SolverConfig};
    pub use crate::data::{AnnotatorDataset, InMemoryDataset, Sample, Split};
    pub use crate::error::{LatentTruthError, Result};
    pub use crate::evaluate::{Evaluator, LabelingScheme, MajorityVote, TruthEstimator};
    pub use crate::model::{AnnotatorModel, ClassifierModel, HeadSelection, ModelOutput};
    pub use crate::sink::{MemorySink, MetricsSink, NoopSink, TracingSink};
    pub use crate::solver::{FitOutcome, RunState, Solver};
}
