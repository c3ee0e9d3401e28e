//! CLI entry point for latent-truth-rs.

use std::path::{Path, PathBuf};

use clap::{Parser, Subcommand};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use latent_truth_rs::config::SolverConfig;
use latent_truth_rs::data::{InMemoryDataset, Split};
use latent_truth_rs::error::{LatentTruthError, Result};
use latent_truth_rs::evaluate::{Evaluator, LabelingScheme};
use latent_truth_rs::model::{AnnotatorModel, ClassifierModel};
use latent_truth_rs::sink::TracingSink;
use latent_truth_rs::solver::Solver;
use latent_truth_rs::AnnotatorDataset;

#[derive(Parser)]
#[command(name = "latent-truth")]
#[command(about = "Multi-annotator classifier training with per-annotator bias heads")]
#[command(version)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Validate a configuration file
    Validate {
        /// Path to configuration file
        config: PathBuf,
    },
    /// Generate a sample configuration file
    Init {
        /// Output path for config file
        #[arg(default_value = "config.yaml")]
        output: PathBuf,
        /// Preset (binary-sentiment, multiclass)
        #[arg(long, default_value = "binary-sentiment")]
        preset: String,
    },
    /// Train a model
    Train {
        /// Path to configuration file
        config: PathBuf,
        /// Override the dataset path
        #[arg(long)]
        data: Option<PathBuf>,
        /// Override the number of epochs
        #[arg(long)]
        epochs: Option<usize>,
        /// Write the final weights here
        #[arg(long)]
        output: Option<PathBuf>,
    },
    /// Evaluate trained weights and write a report
    Evaluate {
        /// Path to configuration file
        config: PathBuf,
        /// Weights to evaluate
        #[arg(long)]
        weights: PathBuf,
        /// Report output path
        #[arg(long)]
        report: PathBuf,
        /// Split to evaluate (train, validation, test)
        #[arg(long, default_value = "test")]
        split: String,
        /// Labeling scheme (single, multi)
        #[arg(long, default_value = "single")]
        scheme: String,
        /// Comma-separated class names
        #[arg(long, value_delimiter = ',')]
        labels: Option<Vec<String>>,
        /// Baseline basic-network weights to compare against
        #[arg(long)]
        baseline: Option<PathBuf>,
        /// Evaluate a single-output model
        #[arg(long)]
        basic_only: bool,
    },
}

fn load_dataset(config: &SolverConfig) -> Result<InMemoryDataset> {
    let path = config
        .data
        .path
        .as_ref()
        .ok_or_else(|| LatentTruthError::config("data.path is not set"))?;
    InMemoryDataset::from_jsonl(
        path,
        config.data.validation_ratio,
        config.data.test_ratio,
        config.data.seed,
    )
}

fn load_model(
    config: &SolverConfig,
    heads: Option<usize>,
    weights: &Path,
) -> Result<ClassifierModel> {
    let model = ClassifierModel::build(
        &config.model,
        config.training.loss,
        heads,
        &config.device.to_device(),
    )?;
    model.load(weights, true)?;
    Ok(model)
}

fn main() -> Result<()> {
    // Initialize logging
    tracing_subscriber::registry()
        .with(tracing_subscriber::fmt::layer())
        .with(tracing_subscriber::EnvFilter::from_default_env())
        .init();

    let cli = Cli::parse();

    match cli.command {
        Commands::Validate { config } => {
            tracing::info!("Validating configuration: {}", config.display());
            let config = SolverConfig::from_file(&config)?;
            config.validate()?;
            println!("✓ Configuration is valid");
            println!("  Loss: {}", config.training.loss);
            println!("  Optimizer: {}", config.training.optimizer.as_str());
            println!("  Classes: {}", config.model.label_dim);
            if let Some(path) = &config.data.path {
                println!("  Dataset: {}", path.display());
            }
        }
        Commands::Init { output, preset } => {
            tracing::info!("Generating config for preset: {}", preset);
            let config = SolverConfig::from_preset(&preset)?;
            config.to_file(&output)?;
            println!("✓ Configuration written to: {}", output.display());
        }
        Commands::Train {
            config,
            data,
            epochs,
            output,
        } => {
            tracing::info!("Starting training with config: {}", config.display());
            let mut config = SolverConfig::from_file(&config)?;
            if let Some(data) = data {
                config.data.path = Some(data);
            }
            if let Some(epochs) = epochs {
                config.fit.epochs = epochs;
            }
            config.validate()?;

            let dataset = load_dataset(&config)?;
            let options = config.fit.clone();
            let mut solver = Solver::new(config, dataset)?.with_sink(Box::new(TracingSink));
            let outcome = solver.fit(&options)?;

            println!("✓ Training finished after {} epochs ({:?})", outcome.epochs_run, outcome.state);
            if let Some(f1) = outcome.f1 {
                println!("  Validation F1: {f1:.4}");
            }
            for path in &outcome.checkpoints {
                println!("  Checkpoint: {}", path.display());
            }
            if let Some(output) = output {
                outcome.model.save(&output)?;
                println!("✓ Final weights saved to: {}", output.display());
            }
        }
        Commands::Evaluate {
            config,
            weights,
            report,
            split,
            scheme,
            labels,
            baseline,
            basic_only,
        } => {
            tracing::info!("Evaluating {}", weights.display());
            let config = SolverConfig::from_file(&config)?;
            config.validate()?;
            let split: Split = split.parse()?;
            let scheme: LabelingScheme = scheme.parse()?;

            let mut dataset = load_dataset(&config)?;
            let heads = (!basic_only).then(|| dataset.annotators().len());
            let model = load_model(&config, heads, &weights)?;
            let baseline = match &baseline {
                Some(path) => Some(load_model(&config, None, path)?),
                None => None,
            };

            let criterion =
                latent_truth_rs::loss::Criterion::new(config.training.loss, config.model.label_dim);
            let mut evaluator =
                Evaluator::new(&model, criterion).with_averaging(config.training.averaging);
            if let Some(baseline) = &baseline {
                evaluator = evaluator.with_baseline(baseline);
            }

            let full = evaluator.write_report(&mut dataset, &report, split, labels.as_deref())?;
            let simple = evaluator.evaluate_simple(&mut dataset, scheme, split)?;
            println!("✓ Report written to: {}", report.display());
            println!(
                "  Accuracy: {:.4} ({} / {})",
                full.overall_accuracy(),
                full.overall_correct,
                full.overall_total
            );
            println!("  {scheme:?} accuracy: {:.4}, F1: {:.4}", simple.accuracy, simple.f1);
            if let (Some(acc), Some(f1)) = (simple.baseline_accuracy, simple.baseline_f1) {
                println!("  Baseline accuracy: {acc:.4}, F1: {f1:.4}");
            }
        }
    }

    Ok(())
}
