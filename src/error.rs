//! Error types for latent-truth-rs.
//!
//! Ordinary control-flow conditions (an empty validation split, an annotator
//! with no rows in a batch, a batch without pseudo-labels) are not errors and
//! never show up here. They are reported through pass summaries instead.
//!
//! # Example
//!
//! ```rust
//! use latent_truth_rs::{LatentTruthError, SolverConfig};
//!
//! # fn main() {
//! match SolverConfig::from_preset("no-such-preset") {
//!     Ok(_) => println!("Loaded config"),
//!     Err(LatentTruthError::Config(msg)) => eprintln!("Configuration error: {msg}"),
//!     Err(e) => eprintln!("Other error: {e}"),
//! }
//! # }
//! ```

use thiserror::Error;

/// Result type alias for latent-truth-rs operations.
pub type Result<T> = std::result::Result<T, LatentTruthError>;

/// Errors that can occur while configuring, training or evaluating.
#[derive(Error, Debug)]
#[non_exhaustive]
pub enum LatentTruthError {
    /// Required settings are absent or inconsistent for the selected regime.
    #[error("configuration error: {0}")]
    Config(String),

    /// Invalid configuration file.
    #[error("invalid config file: {0}")]
    ConfigParse(#[from] serde_yaml::Error),

    /// Tensor operation failed.
    #[error("candle error: {0}")]
    Candle(#[from] candle_core::Error),

    /// Dataset error.
    #[error("dataset error: {0}")]
    Dataset(String),

    /// Model construction or parameter access error.
    #[error("model error: {0}")]
    Model(String),

    /// Training error.
    #[error("training error: {0}")]
    Training(String),

    /// Checkpoint could not be written.
    #[error("checkpoint error: {0}")]
    Checkpoint(String),

    /// Evaluation error.
    #[error("evaluation error: {0}")]
    Evaluation(String),

    /// IO error.
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// Serialization error.
    #[error("serialization error: {0}")]
    Serde(#[from] serde_json::Error),

    /// Progress bar template error.
    #[error("template error: {0}")]
    Template(String),
}

impl LatentTruthError {
    /// Create a configuration error.
    pub fn config(msg: impl Into<String>) -> Self {
        Self::Config(msg.into())
    }

    /// Create a dataset error.
    pub fn dataset(msg: impl Into<String>) -> Self {
        Self::Dataset(msg.into())
    }

    /// Create a model error.
    pub fn model(msg: impl Into<String>) -> Self {
        Self::Model(msg.into())
    }

    /// Create a training error.
    pub fn training(msg: impl Into<String>) -> Self {
        Self::Training(msg.into())
    }

    /// Create a checkpoint error.
    pub fn checkpoint(msg: impl Into<String>) -> Self {
        Self::Checkpoint(msg.into())
    }

    /// Create an evaluation error.
    pub fn evaluation(msg: impl Into<String>) -> Self {
        Self::Evaluation(msg.into())
    }
}

impl From<indicatif::style::TemplateError> for LatentTruthError {
    fn from(err: indicatif::style::TemplateError) -> Self {
        LatentTruthError::Template(err.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io;

    #[test]
    fn test_config_error_creation() {
        let error = LatentTruthError::config("annotator ordering is missing");
        assert_eq!(
            error.to_string(),
            "configuration error: annotator ordering is missing"
        );
    }

    #[test]
    fn test_checkpoint_error_creation() {
        let error = LatentTruthError::checkpoint("disk full");
        assert_eq!(error.to_string(), "checkpoint error: disk full");
    }

    #[test]
    fn test_io_error_conversion() {
        let io_error = io::Error::new(io::ErrorKind::NotFound, "file not found");
        let error: LatentTruthError = io_error.into();
        assert!(error.to_string().contains("IO error"));
        assert!(error.to_string().contains("file not found"));
    }

    #[test]
    fn test_config_parse_error_conversion() {
        let yaml_error = serde_yaml::from_str::<serde_yaml::Value>("invalid: yaml: :::").unwrap_err();
        let error: LatentTruthError = yaml_error.into();
        assert!(error.to_string().contains("invalid config file"));
    }

    #[test]
    fn test_candle_error_conversion() {
        use candle_core::{DType, Device, Tensor};

        let a = Tensor::zeros((2, 3), DType::F32, &Device::Cpu).unwrap();
        let b = Tensor::zeros((3, 4), DType::F32, &Device::Cpu).unwrap();
        let candle_error = a.broadcast_add(&b).unwrap_err();
        let error: LatentTruthError = candle_error.into();
        assert!(error.to_string().contains("candle error"));
    }

    #[test]
    fn test_error_source_chain() {
        use std::error::Error;

        let error: LatentTruthError = io::Error::new(io::ErrorKind::NotFound, "x").into();
        assert!(error.source().is_some());
    }
}
