//! Loss functions and loss combination.

use candle_core::{DType, Tensor};

use crate::config::LossKind;
use crate::error::Result;

const PROB_EPS: f32 = 1e-7;

/// Loss function selected by [`LossKind`].
#[derive(Debug, Clone, Copy)]
pub struct Criterion {
    kind: LossKind,
    num_classes: usize,
}

impl Criterion {
    /// Create a criterion for `num_classes` classes.
    pub fn new(kind: LossKind, num_classes: usize) -> Self {
        Self { kind, num_classes }
    }

    /// Loss kind.
    pub fn kind(&self) -> LossKind {
        self.kind
    }

    /// Number of classes.
    pub fn num_classes(&self) -> usize {
        self.num_classes
    }

    /// Mean loss of `outputs` `[N, C]` against u32 `targets` `[N]`.
    ///
    /// - `cross`: cross-entropy treating outputs as scores
    /// - `bce`: binary cross-entropy on probabilities against one-hot targets
    /// - `nll` / `nll_log`: negative log-likelihood of the target entry
    pub fn loss(&self, outputs: &Tensor, targets: &Tensor) -> Result<Tensor> {
        let loss = match self.kind {
            LossKind::CrossEntropy => candle_nn::loss::cross_entropy(outputs, targets)?,
            LossKind::Nll | LossKind::NllLog => candle_nn::loss::nll(outputs, targets)?,
            LossKind::Bce => {
                let one_hot = one_hot(targets, self.num_classes, outputs.dtype())?;
                let p = outputs.clamp(PROB_EPS, 1.0 - PROB_EPS)?;
                let pos = one_hot.mul(&p.log()?)?;
                let neg = one_hot
                    .affine(-1.0, 1.0)?
                    .mul(&p.affine(-1.0, 1.0)?.log()?)?;
                pos.add(&neg)?.neg()?.mean_all()?
            }
        };
        Ok(loss)
    }
}

/// One-hot encoding `[N, C]` of u32 class indices `[N]`.
pub fn one_hot(targets: &Tensor, num_classes: usize, dtype: DType) -> Result<Tensor> {
    let eye = Tensor::eye(num_classes, dtype, targets.device())?;
    Ok(eye.index_select(targets, 0)?)
}

/// Objective of one annotator in one batch from a primary and a pseudo term.
///
/// Both present gives their exact sum, one present passes through, none
/// gives `None` and no optimizer step must follow.
pub fn combine(primary: Option<Tensor>, pseudo: Option<Tensor>) -> Result<Option<Tensor>> {
    Ok(match (primary, pseudo) {
        (Some(p), Some(q)) => Some(p.add(&q)?),
        (Some(p), None) => Some(p),
        (None, Some(q)) => Some(q),
        (None, None) => None,
    })
}

/// Sum a primary term and any number of auxiliary terms into one objective.
pub fn combine_terms(
    primary: Option<Tensor>,
    auxiliary: impl IntoIterator<Item = Tensor>,
) -> Result<Option<Tensor>> {
    let mut total = primary;
    for term in auxiliary {
        total = combine(total, Some(term))?;
    }
    Ok(total)
}
