//! Optimizers (AdamW, momentum SGD).

use candle_core::backprop::GradStore;
use candle_core::{Tensor, Var};
use candle_nn::{Optimizer, ParamsAdamW};

use crate::config::{OptimizerKind, TrainingConfig};
use crate::error::{LatentTruthError, Result};

/// Default AdamW weight decay.
pub const ADAMW_WEIGHT_DECAY: f64 = 0.01;

/// Default SGD weight decay.
pub const SGD_WEIGHT_DECAY: f64 = 5e-4;

/// Optimizer hyperparameters.
#[derive(Debug, Clone)]
pub struct OptimizerSettings {
    /// Learning rate
    pub learning_rate: f64,
    /// Momentum for SGD
    pub momentum: f64,
    /// Weight decay
    pub weight_decay: f64,
    /// Beta1 for AdamW
    pub beta1: f64,
    /// Beta2 for AdamW
    pub beta2: f64,
    /// Epsilon for numerical stability
    pub eps: f64,
}

impl OptimizerSettings {
    /// Settings from the training section, filling in the per-kind weight decay.
    pub fn from_training(training: &TrainingConfig) -> Self {
        let weight_decay = training.weight_decay.unwrap_or(match training.optimizer {
            OptimizerKind::Adam => ADAMW_WEIGHT_DECAY,
            OptimizerKind::Sgd => SGD_WEIGHT_DECAY,
        });
        Self {
            learning_rate: training.learning_rate,
            momentum: training.momentum,
            weight_decay,
            beta1: 0.9,
            beta2: 0.999,
            eps: 1e-8,
        }
    }
}

/// Parameters of [`MomentumSgd`].
#[derive(Debug, Clone, Copy)]
pub struct ParamsSgd {
    /// Learning rate
    pub lr: f64,
    /// Momentum factor
    pub momentum: f64,
    /// L2 penalty added to the gradient
    pub weight_decay: f64,
}

/// SGD with heavy-ball momentum and L2 weight decay.
///
/// Per parameter: `g = grad + wd * w`, `v = momentum * v + g` (`v = g` on
/// the first step), `w = w - lr * v`.
#[derive(Debug)]
pub struct MomentumSgd {
    vars: Vec<Var>,
    velocity: Vec<Option<Tensor>>,
    params: ParamsSgd,
}

impl Optimizer for MomentumSgd {
    type Config = ParamsSgd;

    fn new(vars: Vec<Var>, params: ParamsSgd) -> candle_core::Result<Self> {
        let vars: Vec<Var> = vars.into_iter().filter(|v| v.dtype().is_float()).collect();
        let velocity = vec![None; vars.len()];
        Ok(Self {
            vars,
            velocity,
            params,
        })
    }

    fn step(&mut self, grads: &GradStore) -> candle_core::Result<()> {
        let ParamsSgd {
            lr,
            momentum,
            weight_decay,
        } = self.params;
        for (var, velocity) in self.vars.iter().zip(self.velocity.iter_mut()) {
            let Some(grad) = grads.get(var) else {
                continue;
            };
            let grad = if weight_decay != 0.0 {
                grad.add(&var.affine(weight_decay, 0.0)?)?
            } else {
                grad.clone()
            };
            let update = match velocity.as_ref() {
                Some(v) if momentum != 0.0 => v.affine(momentum, 0.0)?.add(&grad)?,
                _ => grad,
            };
            var.set(&var.sub(&update.affine(lr, 0.0)?)?)?;
            *velocity = Some(update.detach());
        }
        Ok(())
    }

    fn learning_rate(&self) -> f64 {
        self.params.lr
    }

    fn set_learning_rate(&mut self, lr: f64) {
        self.params.lr = lr;
    }
}

/// The optimizer of one fit.
pub enum SolverOptimizer {
    /// AdamW
    AdamW(candle_nn::AdamW),
    /// Momentum SGD
    Sgd(MomentumSgd),
}

impl SolverOptimizer {
    /// Build an optimizer of `kind` over `vars`.
    ///
    /// # Errors
    ///
    /// Returns an error if the optimizer cannot be created.
    pub fn new(kind: OptimizerKind, vars: Vec<Var>, settings: &OptimizerSettings) -> Result<Self> {
        match kind {
            OptimizerKind::Adam => {
                let params = ParamsAdamW {
                    lr: settings.learning_rate,
                    beta1: settings.beta1,
                    beta2: settings.beta2,
                    eps: settings.eps,
                    weight_decay: settings.weight_decay,
                };
                let opt = candle_nn::AdamW::new(vars, params).map_err(|e| {
                    LatentTruthError::training(format!("Failed to create AdamW: {e}"))
                })?;
                Ok(Self::AdamW(opt))
            }
            OptimizerKind::Sgd => {
                let params = ParamsSgd {
                    lr: settings.learning_rate,
                    momentum: settings.momentum,
                    weight_decay: settings.weight_decay,
                };
                Ok(Self::Sgd(MomentumSgd::new(vars, params)?))
            }
        }
    }

    /// Compute gradients of `loss` and apply one update.
    ///
    /// Every call starts from a fresh gradient store, so nothing accumulated
    /// for an earlier objective leaks into this step.
    ///
    /// # Errors
    ///
    /// Returns an error if the step fails.
    pub fn backward_step(&mut self, loss: &Tensor) -> Result<()> {
        let result = match self {
            Self::AdamW(opt) => opt.backward_step(loss),
            Self::Sgd(opt) => opt.backward_step(loss),
        };
        result.map_err(|e| LatentTruthError::training(format!("Optimizer step failed: {e}")))
    }

    /// Current learning rate.
    pub fn learning_rate(&self) -> f64 {
        match self {
            Self::AdamW(opt) => opt.learning_rate(),
            Self::Sgd(opt) => opt.learning_rate(),
        }
    }
}
