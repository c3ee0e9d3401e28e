//! Classifier networks.
//!
//! [`BasicNetwork`] is a two-layer MLP producing one class-score vector per
//! sample. [`LatentTruthNetwork`] wraps the same MLP and applies one learned
//! `label_dim x label_dim` bias matrix per annotator on top of its output,
//! the "latent truth". Both keep their parameters in a single
//! [`VarMap`], so saving and loading is a safetensors file keyed by
//! parameter name.

use std::collections::HashMap;
use std::path::Path;
use std::sync::MutexGuard;

use candle_core::{DType, Device, Module, Tensor, Var, D};
use candle_nn::{linear, linear_no_bias, Linear, VarBuilder, VarMap};

use crate::config::{LossKind, ModelConfig};
use crate::error::{LatentTruthError, Result};

/// Parameter name prefix of the shared network.
pub const BASIC_PREFIX: &str = "basic.";

/// Parameter name prefix of the bias heads.
pub const BIAS_PREFIX: &str = "bias_matrices.";

/// Parameter snapshot keyed by name.
pub type ModelState = HashMap<String, Tensor>;

/// How a forward pass picks the tensor to score against.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HeadSelection {
    /// Use the single output as is.
    Direct,
    /// Use the head at this index.
    Index(usize),
}

/// Result of a forward pass.
#[derive(Debug, Clone)]
pub enum ModelOutput {
    /// One score vector per sample `[N, C]`.
    Single(Tensor),
    /// One `[N, C]` tensor per annotator head, in dataset annotator order.
    PerAnnotator(Vec<Tensor>),
}

impl ModelOutput {
    /// Pick the output tensor for `selection`.
    ///
    /// `Direct` on a per-annotator output is accepted only when there is
    /// exactly one head.
    pub fn select(&self, selection: HeadSelection) -> Result<&Tensor> {
        match (self, selection) {
            (Self::Single(t), HeadSelection::Direct) => Ok(t),
            (Self::PerAnnotator(heads), HeadSelection::Index(idx)) => {
                heads.get(idx).ok_or_else(|| {
                    LatentTruthError::model(format!(
                        "head {idx} requested from a model with {} heads",
                        heads.len()
                    ))
                })
            }
            (Self::PerAnnotator(heads), HeadSelection::Direct) if heads.len() == 1 => Ok(&heads[0]),
            (Self::PerAnnotator(heads), HeadSelection::Direct) => Err(LatentTruthError::model(
                format!("direct output requested from a model with {} heads", heads.len()),
            )),
            (Self::Single(_), HeadSelection::Index(idx)) => Err(LatentTruthError::model(format!(
                "head {idx} requested from a single-output model"
            ))),
        }
    }

    /// Number of annotator heads (0 for a single output).
    pub fn head_count(&self) -> usize {
        match self {
            Self::Single(_) => 0,
            Self::PerAnnotator(heads) => heads.len(),
        }
    }
}

/// Which parameters an optimizer updates.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ParamGroup {
    /// Every parameter.
    All,
    /// Only the per-annotator bias matrices.
    BiasHeads,
}

/// Normalization applied to the model outputs.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OutputNormalization {
    /// Class probabilities.
    Softmax,
    /// Raw scores.
    Logits,
    /// Log-probabilities.
    LogSoftmax,
}

impl OutputNormalization {
    /// Normalization for a softmax flag and a loss kind. `nll_log` always
    /// gets log-probabilities.
    pub fn from_settings(use_softmax: bool, loss: LossKind) -> Self {
        match (loss, use_softmax) {
            (LossKind::NllLog, _) => Self::LogSoftmax,
            (_, true) => Self::Softmax,
            (_, false) => Self::Logits,
        }
    }
}

/// A classifier trained from annotator labels.
pub trait AnnotatorModel {
    /// Forward pass over `[N, D]` inputs.
    fn forward(&self, input: &Tensor) -> Result<ModelOutput>;

    /// Annotator-independent prediction `[N, C]`.
    fn latent_truth(&self, input: &Tensor) -> Result<Tensor>;

    /// Number of annotator heads (0 for a single-output model).
    fn head_count(&self) -> usize;

    /// Learned bias matrix of one head.
    fn bias_matrix(&self, idx: usize) -> Result<Tensor>;

    /// Parameter store.
    fn var_map(&self) -> &VarMap;

    /// Device the parameters live on.
    fn device(&self) -> &Device;

    /// Parameters of `group`.
    fn trainable_vars(&self, group: ParamGroup) -> Result<Vec<Var>> {
        match group {
            ParamGroup::All => Ok(self.var_map().all_vars()),
            ParamGroup::BiasHeads => {
                if self.head_count() == 0 {
                    return Err(LatentTruthError::config(
                        "model has no bias heads to train",
                    ));
                }
                let data = lock_vars(self.var_map())?;
                Ok(data
                    .iter()
                    .filter(|(name, _)| name.starts_with(BIAS_PREFIX))
                    .map(|(_, var)| var.clone())
                    .collect())
            }
        }
    }

    /// Copy of every parameter.
    fn state(&self) -> Result<ModelState> {
        let data = lock_vars(self.var_map())?;
        let mut state = ModelState::with_capacity(data.len());
        for (name, var) in data.iter() {
            state.insert(name.clone(), var.as_tensor().copy()?);
        }
        Ok(state)
    }

    /// Overwrite parameters from `state`. With `strict`, every parameter
    /// must be present in `state`. Returns the number of parameters set.
    fn load_state(&self, state: &ModelState, strict: bool) -> Result<usize> {
        load_prefixed(self.var_map(), state, "", strict)
    }

    /// Write every parameter to a safetensors file.
    fn save(&self, path: &Path) -> Result<()> {
        self.var_map().save(path)?;
        Ok(())
    }

    /// Load parameters from a safetensors file.
    fn load(&self, path: &Path, strict: bool) -> Result<usize> {
        let state = candle_core::safetensors::load(path, self.device())?;
        self.load_state(&state, strict)
    }

    /// Load only the shared network from a file written by a
    /// [`BasicNetwork`]. Every shared parameter must be present.
    fn load_basic(&self, path: &Path) -> Result<usize> {
        let state = candle_core::safetensors::load(path, self.device())?;
        load_prefixed(self.var_map(), &state, BASIC_PREFIX, true)
    }
}

fn lock_vars(var_map: &VarMap) -> Result<MutexGuard<'_, HashMap<String, Var>>> {
    var_map
        .data()
        .lock()
        .map_err(|_| LatentTruthError::model("parameter store lock poisoned"))
}

fn load_prefixed(var_map: &VarMap, state: &ModelState, prefix: &str, strict: bool) -> Result<usize> {
    let data = lock_vars(var_map)?;
    let mut loaded = 0;
    for (name, var) in data.iter().filter(|(name, _)| name.starts_with(prefix)) {
        match state.get(name) {
            Some(tensor) => {
                let tensor = tensor.to_dtype(var.dtype())?.to_device(var.device())?;
                var.set(&tensor)?;
                loaded += 1;
            }
            None if strict => {
                return Err(LatentTruthError::model(format!(
                    "parameter '{name}' missing from state"
                )));
            }
            None => {}
        }
    }
    Ok(loaded)
}

/// The shared MLP `embedding_dim -> hidden_dim -> label_dim`.
#[derive(Debug, Clone)]
struct Mlp {
    fc1: Linear,
    fc2: Linear,
}

impl Mlp {
    fn new(config: &ModelConfig, vb: VarBuilder) -> Result<Self> {
        let vb = vb.pp("basic");
        Ok(Self {
            fc1: linear(config.embedding_dim, config.hidden_dim, vb.pp("fc1"))?,
            fc2: linear(config.hidden_dim, config.label_dim, vb.pp("fc2"))?,
        })
    }

    fn logits(&self, x: &Tensor) -> Result<Tensor> {
        let hidden = self.fc1.forward(x)?.relu()?;
        Ok(self.fc2.forward(&hidden)?)
    }
}

fn normalize(scores: &Tensor, normalization: OutputNormalization) -> Result<Tensor> {
    Ok(match normalization {
        OutputNormalization::Softmax => candle_nn::ops::softmax(scores, D::Minus1)?,
        OutputNormalization::Logits => scores.clone(),
        OutputNormalization::LogSoftmax => candle_nn::ops::log_softmax(scores, D::Minus1)?,
    })
}

/// Single-output classifier.
pub struct BasicNetwork {
    mlp: Mlp,
    normalization: OutputNormalization,
    var_map: VarMap,
    device: Device,
}

impl BasicNetwork {
    /// Create a randomly initialized network.
    pub fn new(
        config: &ModelConfig,
        normalization: OutputNormalization,
        device: &Device,
    ) -> Result<Self> {
        let var_map = VarMap::new();
        let vb = VarBuilder::from_varmap(&var_map, DType::F32, device);
        let mlp = Mlp::new(config, vb)?;
        Ok(Self {
            mlp,
            normalization,
            var_map,
            device: device.clone(),
        })
    }

    /// Output normalization.
    pub fn normalization(&self) -> OutputNormalization {
        self.normalization
    }
}

impl AnnotatorModel for BasicNetwork {
    fn forward(&self, input: &Tensor) -> Result<ModelOutput> {
        let logits = self.mlp.logits(input)?;
        Ok(ModelOutput::Single(normalize(&logits, self.normalization)?))
    }

    fn latent_truth(&self, input: &Tensor) -> Result<Tensor> {
        let logits = self.mlp.logits(input)?;
        normalize(&logits, self.normalization)
    }

    fn head_count(&self) -> usize {
        0
    }

    fn bias_matrix(&self, idx: usize) -> Result<Tensor> {
        Err(LatentTruthError::model(format!(
            "basic network has no bias matrix {idx}"
        )))
    }

    fn var_map(&self) -> &VarMap {
        &self.var_map
    }

    fn device(&self) -> &Device {
        &self.device
    }
}

/// Shared network plus one bias matrix per annotator.
pub struct LatentTruthNetwork {
    mlp: Mlp,
    heads: Vec<Linear>,
    normalization: OutputNormalization,
    var_map: VarMap,
    device: Device,
}

impl LatentTruthNetwork {
    /// Create a network with `annotator_count` heads initialized to identity.
    pub fn new(
        config: &ModelConfig,
        annotator_count: usize,
        normalization: OutputNormalization,
        device: &Device,
    ) -> Result<Self> {
        if annotator_count == 0 {
            return Err(LatentTruthError::config(
                "latent truth network needs at least one annotator head",
            ));
        }
        let var_map = VarMap::new();
        let vb = VarBuilder::from_varmap(&var_map, DType::F32, device);
        let mlp = Mlp::new(config, vb.clone())?;

        let label_dim = config.label_dim;
        let heads_vb = vb.pp("bias_matrices");
        let heads = (0..annotator_count)
            .map(|i| linear_no_bias(label_dim, label_dim, heads_vb.pp(i.to_string())))
            .collect::<candle_core::Result<Vec<_>>>()?;

        let eye = Tensor::eye(label_dim, DType::F32, device)?;
        {
            let data = lock_vars(&var_map)?;
            for (name, var) in data.iter().filter(|(n, _)| n.starts_with(BIAS_PREFIX)) {
                var.set(&eye).map_err(|e| {
                    LatentTruthError::model(format!("failed to initialize {name}: {e}"))
                })?;
            }
        }

        Ok(Self {
            mlp,
            heads,
            normalization,
            var_map,
            device: device.clone(),
        })
    }

    /// Output normalization.
    pub fn normalization(&self) -> OutputNormalization {
        self.normalization
    }

    fn latent(&self, input: &Tensor) -> Result<Tensor> {
        let logits = self.mlp.logits(input)?;
        match self.normalization {
            OutputNormalization::Logits => Ok(logits),
            _ => Ok(candle_nn::ops::softmax(&logits, D::Minus1)?),
        }
    }
}

impl AnnotatorModel for LatentTruthNetwork {
    fn forward(&self, input: &Tensor) -> Result<ModelOutput> {
        let latent = self.latent(input)?;
        let heads = self
            .heads
            .iter()
            .map(|head| {
                let out = head.forward(&latent)?;
                match self.normalization {
                    OutputNormalization::LogSoftmax => Ok(out.clamp(1e-7f32, 1f32)?.log()?),
                    _ => Ok(out),
                }
            })
            .collect::<Result<Vec<_>>>()?;
        Ok(ModelOutput::PerAnnotator(heads))
    }

    fn latent_truth(&self, input: &Tensor) -> Result<Tensor> {
        self.latent(input)
    }

    fn head_count(&self) -> usize {
        self.heads.len()
    }

    fn bias_matrix(&self, idx: usize) -> Result<Tensor> {
        self.heads
            .get(idx)
            .map(|head| head.weight().clone())
            .ok_or_else(|| LatentTruthError::model(format!("no bias matrix {idx}")))
    }

    fn var_map(&self) -> &VarMap {
        &self.var_map
    }

    fn device(&self) -> &Device {
        &self.device
    }
}

impl std::fmt::Debug for BasicNetwork {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("BasicNetwork")
            .field("mlp", &self.mlp)
            .field("normalization", &self.normalization)
            .field("device", &self.device)
            .finish_non_exhaustive()
    }
}

impl std::fmt::Debug for LatentTruthNetwork {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("LatentTruthNetwork")
            .field("mlp", &self.mlp)
            .field("heads", &self.heads)
            .field("normalization", &self.normalization)
            .field("device", &self.device)
            .finish_non_exhaustive()
    }
}

/// Either network, chosen at run time.
#[derive(Debug)]
pub enum ClassifierModel {
    /// Single-output network.
    Basic(BasicNetwork),
    /// Network with annotator heads.
    LatentTruth(LatentTruthNetwork),
}

impl ClassifierModel {
    /// Build a basic network when `annotator_count` is `None`, otherwise a
    /// latent-truth network with that many heads.
    pub fn build(
        config: &ModelConfig,
        loss: LossKind,
        annotator_count: Option<usize>,
        device: &Device,
    ) -> Result<Self> {
        let normalization = OutputNormalization::from_settings(config.use_softmax, loss);
        match annotator_count {
            None => Ok(Self::Basic(BasicNetwork::new(config, normalization, device)?)),
            Some(n) => Ok(Self::LatentTruth(LatentTruthNetwork::new(
                config,
                n,
                normalization,
                device,
            )?)),
        }
    }

    fn inner(&self) -> &dyn AnnotatorModel {
        match self {
            Self::Basic(m) => m,
            Self::LatentTruth(m) => m,
        }
    }
}

impl AnnotatorModel for ClassifierModel {
    fn forward(&self, input: &Tensor) -> Result<ModelOutput> {
        self.inner().forward(input)
    }

    fn latent_truth(&self, input: &Tensor) -> Result<Tensor> {
        self.inner().latent_truth(input)
    }

    fn head_count(&self) -> usize {
        self.inner().head_count()
    }

    fn bias_matrix(&self, idx: usize) -> Result<Tensor> {
        self.inner().bias_matrix(idx)
    }

    fn var_map(&self) -> &VarMap {
        self.inner().var_map()
    }

    fn device(&self) -> &Device {
        self.inner().device()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn small_config() -> ModelConfig {
        ModelConfig {
            embedding_dim: 4,
            hidden_dim: 8,
            label_dim: 3,
            ..Default::default()
        }
    }

    fn input(rows: usize) -> Tensor {
        Tensor::randn(0f32, 1f32, (rows, 4), &Device::Cpu).unwrap()
    }

    #[test]
    fn test_normalization_from_settings() {
        use OutputNormalization::*;
        assert_eq!(OutputNormalization::from_settings(true, LossKind::NllLog), LogSoftmax);
        assert_eq!(OutputNormalization::from_settings(false, LossKind::NllLog), LogSoftmax);
        assert_eq!(OutputNormalization::from_settings(true, LossKind::CrossEntropy), Softmax);
        assert_eq!(OutputNormalization::from_settings(false, LossKind::CrossEntropy), Logits);
    }

    #[test]
    fn test_basic_forward_is_single_distribution() {
        let net = BasicNetwork::new(&small_config(), OutputNormalization::Softmax, &Device::Cpu)
            .unwrap();
        let out = net.forward(&input(5)).unwrap();
        assert_eq!(out.head_count(), 0);
        let probs = out.select(HeadSelection::Direct).unwrap();
        assert_eq!(probs.dims(), &[5, 3]);
        let sums = probs.sum(1).unwrap().to_vec1::<f32>().unwrap();
        assert!(sums.iter().all(|s| (s - 1.0).abs() < 1e-5));
        assert!(out.select(HeadSelection::Index(0)).is_err());
    }

    #[test]
    fn test_latent_truth_heads_start_at_identity() {
        let net = LatentTruthNetwork::new(
            &small_config(),
            2,
            OutputNormalization::Softmax,
            &Device::Cpu,
        )
        .unwrap();
        let x = input(3);
        let latent = net.latent_truth(&x).unwrap().to_vec2::<f32>().unwrap();
        let out = net.forward(&x).unwrap();
        assert_eq!(out.head_count(), 2);
        for idx in 0..2 {
            let head = out
                .select(HeadSelection::Index(idx))
                .unwrap()
                .to_vec2::<f32>()
                .unwrap();
            for (a, b) in head.iter().flatten().zip(latent.iter().flatten()) {
                assert!((a - b).abs() < 1e-6);
            }
        }
        let bias = net.bias_matrix(1).unwrap().to_vec2::<f32>().unwrap();
        assert_eq!(bias[0], vec![1.0, 0.0, 0.0]);
        assert!(net.bias_matrix(2).is_err());
        assert!(out.select(HeadSelection::Direct).is_err());
    }

    #[test]
    fn test_log_softmax_heads_are_log_probabilities() {
        let net = LatentTruthNetwork::new(
            &small_config(),
            1,
            OutputNormalization::LogSoftmax,
            &Device::Cpu,
        )
        .unwrap();
        let out = net.forward(&input(2)).unwrap();
        let logp = out.select(HeadSelection::Direct).unwrap();
        let sums = logp.exp().unwrap().sum(1).unwrap().to_vec1::<f32>().unwrap();
        assert!(sums.iter().all(|s| (s - 1.0).abs() < 1e-4));
    }

    #[test]
    fn test_trainable_groups() {
        let net = LatentTruthNetwork::new(
            &small_config(),
            3,
            OutputNormalization::Softmax,
            &Device::Cpu,
        )
        .unwrap();
        assert_eq!(net.trainable_vars(ParamGroup::All).unwrap().len(), 4 + 3);
        assert_eq!(net.trainable_vars(ParamGroup::BiasHeads).unwrap().len(), 3);

        let basic =
            BasicNetwork::new(&small_config(), OutputNormalization::Softmax, &Device::Cpu).unwrap();
        assert!(basic.trainable_vars(ParamGroup::BiasHeads).is_err());
    }

    #[test]
    fn test_state_round_trip_through_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("model.safetensors");
        let config = small_config();
        let a = ClassifierModel::build(&config, LossKind::CrossEntropy, Some(2), &Device::Cpu)
            .unwrap();
        a.save(&path).unwrap();

        let b = ClassifierModel::build(&config, LossKind::CrossEntropy, Some(2), &Device::Cpu)
            .unwrap();
        assert_eq!(b.load(&path, true).unwrap(), 6);

        let x = input(4);
        let la = a.latent_truth(&x).unwrap().to_vec2::<f32>().unwrap();
        let lb = b.latent_truth(&x).unwrap().to_vec2::<f32>().unwrap();
        assert_eq!(la, lb);
    }

    #[test]
    fn test_state_is_a_copy() {
        let net =
            BasicNetwork::new(&small_config(), OutputNormalization::Softmax, &Device::Cpu).unwrap();
        let before = net.state().unwrap();
        for var in net.trainable_vars(ParamGroup::All).unwrap() {
            var.set(&var.as_tensor().zeros_like().unwrap()).unwrap();
        }
        assert_eq!(net.load_state(&before, true).unwrap(), 4);
        let w = net.state().unwrap()["basic.fc1.weight"]
            .flatten_all()
            .unwrap()
            .to_vec1::<f32>()
            .unwrap();
        assert!(w.iter().any(|v| *v != 0.0));
    }

    #[test]
    fn test_load_basic_into_latent_network() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("basic.safetensors");
        let config = small_config();
        let basic = BasicNetwork::new(&config, OutputNormalization::Softmax, &Device::Cpu).unwrap();
        basic.save(&path).unwrap();

        let latent =
            LatentTruthNetwork::new(&config, 2, OutputNormalization::Softmax, &Device::Cpu)
                .unwrap();
        assert_eq!(latent.load_basic(&path).unwrap(), 4);
        assert!(latent.load(&path, true).is_err());

        let x = input(3);
        let expected = basic.latent_truth(&x).unwrap().to_vec2::<f32>().unwrap();
        let got = latent.latent_truth(&x).unwrap().to_vec2::<f32>().unwrap();
        assert_eq!(expected, got);
    }
    #[test]
    fn test_softmax_heads_pass_gradients_to_the_shared_network() {
        let net = LatentTruthNetwork::new(
            &small_config(),
            2,
            OutputNormalization::Softmax,
            &Device::Cpu,
        )
        .unwrap();
        let out = net.forward(&input(4)).unwrap();
        let head = out.select(HeadSelection::Index(1)).unwrap();
        let loss = head.narrow(1, 0, 1).unwrap().log().unwrap().sum_all().unwrap();
        let grads = loss.backward().unwrap();

        let vars = lock_vars(net.var_map()).unwrap();
        for name in ["basic.fc1.weight", "basic.fc2.weight", "bias_matrices.1.weight"] {
            let grad = grads
                .get(vars[name].as_tensor())
                .unwrap_or_else(|| panic!("no gradient for {name}"));
            let norm = grad.sqr().unwrap().sum_all().unwrap().to_scalar::<f32>().unwrap();
            assert!(norm > 0.0, "{name} gradient is zero");
        }
        assert!(grads.get(vars["bias_matrices.0.weight"].as_tensor()).is_none());
    }
}
