//! Configuration parsing and validation.
//!
//! Loss and optimizer selection are closed enums: an unknown tag in a YAML
//! file is a parse error, and an unknown tag passed on the command line is
//! rejected by [`FromStr`].

use std::collections::BTreeSet;
use std::fmt;
use std::path::{Path, PathBuf};
use std::str::FromStr;

use candle_core::Device;
use serde::{Deserialize, Serialize};

use crate::error::{LatentTruthError, Result};

/// Main configuration for a training run.
///
/// # Example
///
/// ```rust
/// use latent_truth_rs::SolverConfig;
///
/// # fn main() -> latent_truth_rs::Result<()> {
/// let mut config = SolverConfig::from_preset("binary-sentiment")?;
/// config.training.batch_size = 16;
/// config.validate()?;
/// # Ok(())
/// # }
/// ```
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SolverConfig {
    /// Model construction parameters.
    #[serde(default)]
    pub model: ModelConfig,

    /// Optimization hyperparameters.
    #[serde(default)]
    pub training: TrainingConfig,

    /// Checkpoint policy.
    #[serde(default)]
    pub checkpoint: CheckpointConfig,

    /// Pseudo-label generation (optional).
    #[serde(default)]
    pub pseudo_labels: Option<PseudoLabelConfig>,

    /// Dataset location and split ratios.
    #[serde(default)]
    pub data: DataConfig,

    /// Options for `Solver::fit`.
    #[serde(default)]
    pub fit: FitOptions,

    /// Compute device.
    #[serde(default)]
    pub device: DeviceKind,
}

/// Loss function family.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub enum LossKind {
    /// Categorical cross-entropy on class scores.
    #[default]
    #[serde(rename = "cross")]
    CrossEntropy,
    /// Binary cross-entropy on probabilities with one-hot targets.
    #[serde(rename = "bce")]
    Bce,
    /// Negative log-likelihood on pre-softmaxed outputs.
    #[serde(rename = "nll")]
    Nll,
    /// Negative log-likelihood on log-probabilities produced by the model.
    #[serde(rename = "nll_log")]
    NllLog,
}

impl LossKind {
    /// Tag used in configuration files.
    pub fn as_str(self) -> &'static str {
        match self {
            Self::CrossEntropy => "cross",
            Self::Bce => "bce",
            Self::Nll => "nll",
            Self::NllLog => "nll_log",
        }
    }

    /// Whether targets must be one-hot encoded before the loss is computed.
    pub fn requires_one_hot(self) -> bool {
        matches!(self, Self::Bce)
    }
}

impl fmt::Display for LossKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for LossKind {
    type Err = LatentTruthError;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "cross" => Ok(Self::CrossEntropy),
            "bce" => Ok(Self::Bce),
            "nll" => Ok(Self::Nll),
            "nll_log" => Ok(Self::NllLog),
            other => Err(LatentTruthError::config(format!(
                "unknown loss kind '{other}' (expected cross, bce, nll or nll_log)"
            ))),
        }
    }
}

/// Optimizer family.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum OptimizerKind {
    /// AdamW with decoupled weight decay.
    #[default]
    Adam,
    /// SGD with momentum and L2 weight decay.
    Sgd,
}

impl OptimizerKind {
    /// Tag used in configuration files.
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Adam => "adam",
            Self::Sgd => "sgd",
        }
    }
}

impl fmt::Display for OptimizerKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for OptimizerKind {
    type Err = LatentTruthError;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "adam" => Ok(Self::Adam),
            "sgd" => Ok(Self::Sgd),
            other => Err(LatentTruthError::config(format!(
                "unknown optimizer '{other}' (expected adam or sgd)"
            ))),
        }
    }
}

/// Averaging used for multi-class precision, recall and F1.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum AveragingMethod {
    /// Unweighted mean over classes present in labels or predictions.
    #[default]
    Macro,
    /// Global counts of true/false positives.
    Micro,
    /// Mean over classes weighted by label support.
    Weighted,
    /// Scores of class 1 only.
    Binary,
}

/// Compute device selection.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DeviceKind {
    /// CPU.
    #[default]
    Cpu,
    /// First CUDA device, falling back to CPU when unavailable.
    Cuda,
}

impl DeviceKind {
    /// Resolve to a candle device.
    pub fn to_device(self) -> Device {
        match self {
            Self::Cpu => Device::Cpu,
            Self::Cuda => match Device::cuda_if_available(0) {
                Ok(device @ Device::Cuda(_)) => {
                    tracing::info!("Training device: CUDA (device 0)");
                    device
                }
                Ok(_) => {
                    tracing::warn!("CUDA not available; falling back to CPU");
                    Device::Cpu
                }
                Err(err) => {
                    tracing::warn!("CUDA init failed ({err}); falling back to CPU");
                    Device::Cpu
                }
            },
        }
    }
}

/// Model construction parameters.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ModelConfig {
    /// Input feature dimension.
    #[serde(default = "default_embedding_dim")]
    pub embedding_dim: usize,

    /// Hidden layer width of the basic network.
    #[serde(default = "default_hidden_dim")]
    pub hidden_dim: usize,

    /// Number of classes.
    #[serde(default = "default_label_dim")]
    pub label_dim: usize,

    /// Expected number of annotator heads; must match the dataset ordering when set.
    #[serde(default)]
    pub annotator_dim: Option<usize>,

    /// Apply softmax to the model outputs.
    #[serde(default = "default_true")]
    pub use_softmax: bool,

    /// Weights to load before training or evaluation.
    #[serde(default)]
    pub weights_path: Option<PathBuf>,
}

fn default_embedding_dim() -> usize {
    50
}
fn default_hidden_dim() -> usize {
    32
}
fn default_label_dim() -> usize {
    2
}
fn default_true() -> bool {
    true
}

impl Default for ModelConfig {
    fn default() -> Self {
        Self {
            embedding_dim: default_embedding_dim(),
            hidden_dim: default_hidden_dim(),
            label_dim: default_label_dim(),
            annotator_dim: None,
            use_softmax: true,
            weights_path: None,
        }
    }
}

/// Optimization hyperparameters.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TrainingConfig {
    /// Learning rate.
    #[serde(default = "default_lr")]
    pub learning_rate: f64,

    /// Mini-batch size.
    #[serde(default = "default_batch_size")]
    pub batch_size: usize,

    /// Momentum for SGD.
    #[serde(default = "default_momentum")]
    pub momentum: f64,

    /// Weight decay; defaults to 0.01 for AdamW and 5e-4 for SGD.
    #[serde(default)]
    pub weight_decay: Option<f64>,

    /// Loss function.
    #[serde(default)]
    pub loss: LossKind,

    /// Optimizer.
    #[serde(default)]
    pub optimizer: OptimizerKind,

    /// Averaging for precision, recall and F1.
    #[serde(default)]
    pub averaging: AveragingMethod,

    /// Relative band around the reference loss used by early stopping.
    #[serde(default = "default_margin")]
    pub early_stopping_margin: f64,

    /// Draw a progress bar for every pass.
    #[serde(default)]
    pub show_progress: bool,
}

fn default_lr() -> f64 {
    1e-3
}
fn default_batch_size() -> usize {
    64
}
fn default_momentum() -> f64 {
    0.9
}
fn default_margin() -> f64 {
    1e-4
}

impl Default for TrainingConfig {
    fn default() -> Self {
        Self {
            learning_rate: default_lr(),
            batch_size: default_batch_size(),
            momentum: default_momentum(),
            weight_decay: None,
            loss: LossKind::default(),
            optimizer: OptimizerKind::default(),
            averaging: AveragingMethod::default(),
            early_stopping_margin: default_margin(),
            show_progress: false,
        }
    }
}

impl TrainingConfig {
    /// Short descriptor of the hyperparameters, used in checkpoint names.
    pub fn descriptor(&self) -> String {
        format!(
            "lr{}_bs{}_{}_{}",
            self.learning_rate, self.batch_size, self.loss, self.optimizer
        )
    }
}

/// Checkpoint policy.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CheckpointConfig {
    /// Directory checkpoints are written to; checkpointing is off when unset.
    #[serde(default)]
    pub save_root: Option<PathBuf>,

    /// Epochs (zero-based) at which the model is saved.
    #[serde(default)]
    pub save_at: BTreeSet<usize>,

    /// Run identifier.
    #[serde(default = "default_stem")]
    pub stem: String,

    /// Hyperparameter descriptor; derived from the training config when unset.
    #[serde(default)]
    pub hyperparams: Option<String>,
}

fn default_stem() -> String {
    "latent_truth".into()
}

impl Default for CheckpointConfig {
    fn default() -> Self {
        Self {
            save_root: None,
            save_at: BTreeSet::new(),
            stem: default_stem(),
            hyperparams: None,
        }
    }
}

/// Pseudo-label generation settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PseudoLabelConfig {
    /// Annotators whose trained basic networks produce pseudo-labels.
    pub annotators: Vec<String>,

    /// Weights path with an `{annotator}` placeholder.
    pub model_path_template: String,
}

impl PseudoLabelConfig {
    /// Weights path for one pseudo annotator.
    pub fn model_path(&self, annotator: &str) -> PathBuf {
        PathBuf::from(self.model_path_template.replace("{annotator}", annotator))
    }
}

/// Dataset location and split ratios.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DataConfig {
    /// JSONL file with one sample per line.
    #[serde(default)]
    pub path: Option<PathBuf>,

    /// Fraction of each annotator's samples used for validation.
    #[serde(default = "default_validation_ratio")]
    pub validation_ratio: f64,

    /// Fraction of each annotator's samples used for testing.
    #[serde(default = "default_test_ratio")]
    pub test_ratio: f64,

    /// Seed for split and batch shuffling.
    #[serde(default = "default_seed")]
    pub seed: u64,
}

fn default_validation_ratio() -> f64 {
    0.1
}
fn default_test_ratio() -> f64 {
    0.1
}
fn default_seed() -> u64 {
    42
}

impl Default for DataConfig {
    fn default() -> Self {
        Self {
            path: None,
            validation_ratio: default_validation_ratio(),
            test_ratio: default_test_ratio(),
            seed: default_seed(),
        }
    }
}

/// Options controlling one call to `Solver::fit`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FitOptions {
    /// Number of epochs.
    #[serde(default = "default_epochs")]
    pub epochs: usize,

    /// Report the aggregated validation F1 and put it into checkpoint names.
    #[serde(default)]
    pub return_f1: bool,

    /// Train on a single annotator only.
    #[serde(default)]
    pub single_annotator: Option<String>,

    /// Train the basic network without bias heads.
    #[serde(default)]
    pub basic_only: bool,

    /// Only optimize the bias heads.
    #[serde(default)]
    pub fix_base: bool,

    /// `model.weights_path` holds basic-network weights only.
    #[serde(default)]
    pub pretrained_basic: bool,

    /// Mixed-annotator batches with per-row masking.
    #[serde(default)]
    pub deep_randomization: bool,

    /// Plateau window length in epochs; 0 disables early stopping.
    #[serde(default)]
    pub early_stopping_interval: usize,
}

fn default_epochs() -> usize {
    10
}

impl Default for FitOptions {
    fn default() -> Self {
        Self {
            epochs: default_epochs(),
            return_f1: false,
            single_annotator: None,
            basic_only: false,
            fix_base: false,
            pretrained_basic: false,
            deep_randomization: false,
            early_stopping_interval: 0,
        }
    }
}

impl FitOptions {
    /// Validate option combinations.
    pub fn validate(&self) -> Result<()> {
        if self.fix_base && self.basic_only {
            return Err(LatentTruthError::config(
                "fix_base requires bias heads but basic_only disables them",
            ));
        }
        if matches!(self.single_annotator.as_deref(), Some("")) {
            return Err(LatentTruthError::config("single_annotator must not be empty"));
        }
        Ok(())
    }
}

impl SolverConfig {
    /// Load configuration from a YAML file.
    pub fn from_file<P: AsRef<Path>>(path: P) -> Result<Self> {
        let content = std::fs::read_to_string(path)?;
        let config: Self = serde_yaml::from_str(&content)?;
        Ok(config)
    }

    /// Save configuration to a YAML file.
    pub fn to_file<P: AsRef<Path>>(&self, path: P) -> Result<()> {
        let content = serde_yaml::to_string(self)?;
        std::fs::write(path, content)?;
        Ok(())
    }

    /// Create a configuration from a preset.
    ///
    /// Available presets:
    /// - `"binary-sentiment"` - 50-dim embeddings, two classes, AdamW
    /// - `"multiclass"` - 300-dim embeddings, five classes, momentum SGD
    pub fn from_preset(preset: &str) -> Result<Self> {
        match preset {
            "binary-sentiment" => Ok(Self::binary_sentiment_preset()),
            "multiclass" => Ok(Self::multiclass_preset()),
            _ => Err(LatentTruthError::config(format!("Unknown preset: {preset}"))),
        }
    }

    /// Two-class sentiment preset.
    #[must_use]
    pub fn binary_sentiment_preset() -> Self {
        Self {
            model: ModelConfig::default(),
            training: TrainingConfig::default(),
            checkpoint: CheckpointConfig {
                save_root: Some("./models".into()),
                stem: "sentiment".into(),
                ..Default::default()
            },
            pseudo_labels: None,
            data: DataConfig {
                path: Some("./data/train.jsonl".into()),
                ..Default::default()
            },
            fit: FitOptions {
                early_stopping_interval: 5,
                return_f1: true,
                ..Default::default()
            },
            device: DeviceKind::Cpu,
        }
    }

    /// Five-class preset trained with momentum SGD.
    #[must_use]
    pub fn multiclass_preset() -> Self {
        Self {
            model: ModelConfig {
                embedding_dim: 300,
                hidden_dim: 128,
                label_dim: 5,
                ..Default::default()
            },
            training: TrainingConfig {
                learning_rate: 1e-2,
                batch_size: 32,
                optimizer: OptimizerKind::Sgd,
                ..Default::default()
            },
            checkpoint: CheckpointConfig {
                save_root: Some("./models".into()),
                stem: "multiclass".into(),
                ..Default::default()
            },
            pseudo_labels: None,
            data: DataConfig {
                path: Some("./data/train.jsonl".into()),
                ..Default::default()
            },
            fit: FitOptions {
                epochs: 30,
                deep_randomization: true,
                early_stopping_interval: 5,
                ..Default::default()
            },
            device: DeviceKind::Cpu,
        }
    }

    /// Validate the configuration.
    pub fn validate(&self) -> Result<()> {
        if self.model.embedding_dim == 0 {
            return Err(LatentTruthError::config("model.embedding_dim must be > 0"));
        }
        if self.model.hidden_dim == 0 {
            return Err(LatentTruthError::config("model.hidden_dim must be > 0"));
        }
        if self.model.label_dim < 2 {
            return Err(LatentTruthError::config("model.label_dim must be >= 2"));
        }
        if self.training.batch_size == 0 {
            return Err(LatentTruthError::config("training.batch_size must be > 0"));
        }
        if !self.training.learning_rate.is_finite() || self.training.learning_rate < 0.0 {
            return Err(LatentTruthError::config(
                "training.learning_rate must be a finite, non-negative number",
            ));
        }
        if !(0.0..1.0).contains(&self.training.early_stopping_margin) {
            return Err(LatentTruthError::config(
                "training.early_stopping_margin must be in [0, 1)",
            ));
        }
        match self.training.loss {
            LossKind::Bce | LossKind::Nll if !self.model.use_softmax => {
                return Err(LatentTruthError::config(format!(
                    "loss '{}' needs probabilities; set model.use_softmax",
                    self.training.loss
                )));
            }
            _ => {}
        }
        let ratios = self.data.validation_ratio + self.data.test_ratio;
        if self.data.validation_ratio < 0.0 || self.data.test_ratio < 0.0 || ratios >= 1.0 {
            return Err(LatentTruthError::config(
                "data.validation_ratio and data.test_ratio must be non-negative and sum to < 1",
            ));
        }
        if let Some(pseudo) = &self.pseudo_labels {
            if !pseudo.model_path_template.contains("{annotator}") {
                return Err(LatentTruthError::config(
                    "pseudo_labels.model_path_template must contain '{annotator}'",
                ));
            }
        }
        self.fit.validate()
    }

    /// Hyperparameter descriptor used in checkpoint names.
    pub fn hyperparams(&self) -> String {
        self.checkpoint
            .hyperparams
            .clone()
            .unwrap_or_else(|| self.training.descriptor())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;
    use tempfile::NamedTempFile;

    #[test]
    fn test_config_serialization() {
        let config = SolverConfig::multiclass_preset();
        let yaml = serde_yaml::to_string(&config).unwrap();
        let restored: SolverConfig = serde_yaml::from_str(&yaml).unwrap();
        assert_eq!(restored.model.label_dim, 5);
        assert_eq!(restored.training.optimizer, OptimizerKind::Sgd);
    }

    #[test]
    fn test_presets() {
        assert!(SolverConfig::from_preset("binary-sentiment").is_ok());
        assert!(SolverConfig::from_preset("multiclass").is_ok());
        assert!(SolverConfig::from_preset("invalid").is_err());
    }

    #[test]
    fn test_minimal_yaml_uses_defaults() {
        let config: SolverConfig = serde_yaml::from_str("training:\n  loss: nll_log\n").unwrap();
        assert_eq!(config.training.loss, LossKind::NllLog);
        assert_eq!(config.training.batch_size, 64);
        assert_eq!(config.model.label_dim, 2);
        assert_eq!(config.fit.early_stopping_interval, 0);
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_unknown_loss_tag_fails_to_parse() {
        let result = serde_yaml::from_str::<SolverConfig>("training:\n  loss: hinge\n");
        assert!(result.is_err());
    }

    #[test]
    fn test_unknown_optimizer_tag_fails_to_parse() {
        let result = serde_yaml::from_str::<SolverConfig>("training:\n  optimizer: rmsprop\n");
        assert!(result.is_err());
    }

    #[test]
    fn test_loss_kind_from_str() {
        assert_eq!("cross".parse::<LossKind>().unwrap(), LossKind::CrossEntropy);
        assert_eq!("bce".parse::<LossKind>().unwrap(), LossKind::Bce);
        assert_eq!("nll".parse::<LossKind>().unwrap(), LossKind::Nll);
        assert_eq!("nll_log".parse::<LossKind>().unwrap(), LossKind::NllLog);
        assert!("mse".parse::<LossKind>().is_err());
        assert!(LossKind::Bce.requires_one_hot());
        assert!(!LossKind::CrossEntropy.requires_one_hot());
    }

    #[test]
    fn test_optimizer_kind_from_str() {
        assert_eq!("adam".parse::<OptimizerKind>().unwrap(), OptimizerKind::Adam);
        assert_eq!("sgd".parse::<OptimizerKind>().unwrap(), OptimizerKind::Sgd);
        assert!("lbfgs".parse::<OptimizerKind>().is_err());
    }

    #[test]
    fn test_validation_rejects_bce_on_logits() {
        let mut config = SolverConfig::binary_sentiment_preset();
        config.training.loss = LossKind::Bce;
        config.model.use_softmax = false;
        assert!(config.validate().is_err());

        config.model.use_softmax = true;
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_validation_rejects_bad_ratios() {
        let mut config = SolverConfig::binary_sentiment_preset();
        config.data.validation_ratio = 0.6;
        config.data.test_ratio = 0.4;
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_validation_rejects_fix_base_with_basic_only() {
        let mut config = SolverConfig::binary_sentiment_preset();
        config.fit.fix_base = true;
        config.fit.basic_only = true;
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_pseudo_label_template() {
        let pseudo = PseudoLabelConfig {
            annotators: vec!["alice".into()],
            model_path_template: "models/{annotator}_basic.safetensors".into(),
        };
        assert_eq!(
            pseudo.model_path("alice"),
            PathBuf::from("models/alice_basic.safetensors")
        );

        let mut config = SolverConfig::binary_sentiment_preset();
        config.pseudo_labels = Some(PseudoLabelConfig {
            model_path_template: "models/basic.safetensors".into(),
            ..pseudo
        });
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_hyperparams_descriptor() {
        let mut config = SolverConfig::binary_sentiment_preset();
        assert_eq!(config.hyperparams(), "lr0.001_bs64_cross_adam");

        config.checkpoint.hyperparams = Some("custom".into());
        assert_eq!(config.hyperparams(), "custom");
    }

    #[test]
    fn test_load_config_from_file() {
        let mut file = NamedTempFile::new().unwrap();
        writeln!(
            file,
            "model:\n  embedding_dim: 8\n  label_dim: 3\nfit:\n  epochs: 2\n  deep_randomization: true\n"
        )
        .unwrap();

        let config = SolverConfig::from_file(file.path()).unwrap();
        assert_eq!(config.model.embedding_dim, 8);
        assert_eq!(config.fit.epochs, 2);
        assert!(config.fit.deep_randomization);
    }

    #[test]
    fn test_load_config_missing_file() {
        assert!(SolverConfig::from_file("/nonexistent/config.yaml").is_err());
    }
}
