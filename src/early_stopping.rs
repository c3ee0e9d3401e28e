//! Plateau-based early stopping on the validation loss.
//!
//! Every epoch appends its validation loss to an append-only window. Once
//! more than `interval` losses precede the current one, the reference is the
//! loss exactly `interval` epochs before the current epoch and training stops
//! when the mean of the last `interval` losses lies strictly inside
//! `reference * (1 - margin) .. reference * (1 + margin)`. This fires on
//! stagnation, not on divergence.
//!
//! # Example
//!
//! ```
//! use latent_truth_rs::early_stopping::{PlateauStopping, StoppingDecision};
//!
//! let mut stopping = PlateauStopping::new(3, 1e-4);
//! let decisions: Vec<_> = (0..5).map(|_| stopping.check(1.0)).collect();
//! assert!(decisions[..4].iter().all(|d| *d == StoppingDecision::Continue));
//! assert!(matches!(decisions[4], StoppingDecision::Stop { .. }));
//! ```

/// Early stopping state.
#[derive(Debug, Clone)]
pub struct PlateauStopping {
    /// Window length in epochs; 0 disables the check.
    interval: usize,
    /// Relative half-width of the band around the reference loss.
    margin: f64,
    /// Validation loss of every epoch so far.
    losses: Vec<f64>,
}

/// Result of checking one epoch's loss.
#[derive(Debug, Clone, PartialEq)]
pub enum StoppingDecision {
    /// Keep training.
    Continue,
    /// The trailing mean sits inside the band around the reference.
    Stop {
        /// Loss `interval` epochs before the current one.
        reference: f64,
        /// Mean of the last `interval` losses.
        mean_loss: f64,
    },
}

impl PlateauStopping {
    /// Create a tracker. `interval == 0` never stops.
    pub fn new(interval: usize, margin: f64) -> Self {
        Self {
            interval,
            margin,
            losses: Vec::new(),
        }
    }

    /// Whether the check can ever fire.
    pub fn is_enabled(&self) -> bool {
        self.interval > 0
    }

    /// Record the validation loss of the next epoch and decide.
    pub fn check(&mut self, loss: f64) -> StoppingDecision {
        let previous = self.losses.len();
        self.losses.push(loss);
        if !self.is_enabled() || previous <= self.interval {
            return StoppingDecision::Continue;
        }

        let current = self.losses.len() - 1;
        let reference = self.losses[current - self.interval];
        let window = &self.losses[current + 1 - self.interval..];
        let mean_loss = window.iter().sum::<f64>() / window.len() as f64;

        let low = reference * (1.0 - self.margin);
        let high = reference * (1.0 + self.margin);
        if mean_loss > low && mean_loss < high {
            StoppingDecision::Stop {
                reference,
                mean_loss,
            }
        } else {
            StoppingDecision::Continue
        }
    }

    /// Every recorded loss, oldest first.
    pub fn losses(&self) -> &[f64] {
        &self.losses
    }

    /// Window length.
    pub fn interval(&self) -> usize {
        self.interval
    }
}
