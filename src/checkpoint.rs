//! Checkpoint naming and writing.
//!
//! A checkpoint is written at every configured save epoch and once more when
//! early stopping fires. Files are never overwritten: a name collision is a
//! [`LatentTruthError::Checkpoint`].

use std::collections::BTreeSet;
use std::ffi::OsString;
use std::fs;
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};

use crate::error::{LatentTruthError, Result};
use crate::model::AnnotatorModel;

/// File extension of checkpoints.
pub const CHECKPOINT_EXTENSION: &str = ".safetensors";

/// Identity of a run, used to build checkpoint names.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SaveParams {
    /// Run identifier
    pub stem: String,
    /// Run start time
    pub current_time: String,
    /// Hyperparameter descriptor
    pub hyperparams: String,
}

impl SaveParams {
    /// Parameters stamped with the current local time.
    pub fn new(stem: impl Into<String>, hyperparams: impl Into<String>) -> Self {
        Self {
            stem: stem.into(),
            current_time: chrono::Local::now().format("%Y-%m-%d_%H-%M-%S").to_string(),
            hyperparams: hyperparams.into(),
        }
    }

    /// Replace the timestamp.
    pub fn with_time(mut self, current_time: impl Into<String>) -> Self {
        self.current_time = current_time.into();
        self
    }
}

/// Builds the base path of a checkpoint from the save root, the run identity
/// and an optional score. Epoch and early-stopping suffixes and the extension
/// are appended by [`CheckpointPolicy`].
pub type ModelPathFn = Box<dyn Fn(&Path, &SaveParams, Option<f64>) -> PathBuf + Send + Sync>;

/// `{root}/{stem}_{time}_{hyperparams}[_f1_{score:.4}]`.
pub fn default_model_path(root: &Path, params: &SaveParams, f1: Option<f64>) -> PathBuf {
    let mut name = format!(
        "{}_{}_{}",
        params.stem, params.current_time, params.hyperparams
    );
    if let Some(f1) = f1 {
        name.push_str(&format!("_f1_{f1:.4}"));
    }
    root.join(name)
}

/// When and where checkpoints are written.
pub struct CheckpointPolicy {
    root: Option<PathBuf>,
    save_at: BTreeSet<usize>,
    params: Option<SaveParams>,
    path_fn: ModelPathFn,
}

impl std::fmt::Debug for CheckpointPolicy {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CheckpointPolicy")
            .field("root", &self.root)
            .field("save_at", &self.save_at)
            .field("params", &self.params)
            .finish_non_exhaustive()
    }
}

impl Default for CheckpointPolicy {
    fn default() -> Self {
        Self::disabled()
    }
}

impl CheckpointPolicy {
    /// Policy writing below `root` at the epochs in `save_at`.
    pub fn new(root: Option<PathBuf>, save_at: BTreeSet<usize>, params: Option<SaveParams>) -> Self {
        Self {
            root,
            save_at,
            params,
            path_fn: Box::new(default_model_path),
        }
    }

    /// Policy that never writes.
    pub fn disabled() -> Self {
        Self::new(None, BTreeSet::new(), None)
    }

    /// Replace the base path builder.
    pub fn with_path_fn(mut self, path_fn: ModelPathFn) -> Self {
        self.path_fn = path_fn;
        self
    }

    /// Replace the run identity.
    pub fn with_params(mut self, params: SaveParams) -> Self {
        self.params = Some(params);
        self
    }

    /// Whether a save root and run identity are both configured.
    pub fn is_enabled(&self) -> bool {
        self.root.is_some() && self.params.is_some()
    }

    /// Whether a checkpoint is due.
    pub fn should_save(&self, epoch: usize, early_stopping: bool) -> bool {
        self.is_enabled() && (early_stopping || self.save_at.contains(&epoch))
    }

    /// Full checkpoint path, or `None` when checkpointing is off.
    pub fn path_for(&self, epoch: usize, f1: Option<f64>, early_stopping: bool) -> Option<PathBuf> {
        let (root, params) = (self.root.as_ref()?, self.params.as_ref()?);
        let mut name: OsString = (self.path_fn)(root, params, f1).into_os_string();
        name.push(format!("_epoch{epoch}"));
        if early_stopping {
            name.push("_early_stopping");
        }
        name.push(CHECKPOINT_EXTENSION);
        Some(PathBuf::from(name))
    }

    /// Write `model` if a checkpoint is due. Returns the written path.
    pub fn save(
        &self,
        model: &dyn AnnotatorModel,
        epoch: usize,
        f1: Option<f64>,
        early_stopping: bool,
    ) -> Result<Option<PathBuf>> {
        if !self.should_save(epoch, early_stopping) {
            return Ok(None);
        }
        let Some(path) = self.path_for(epoch, f1, early_stopping) else {
            return Ok(None);
        };
        if path.exists() {
            return Err(LatentTruthError::checkpoint(format!(
                "refusing to overwrite {}",
                path.display()
            )));
        }
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent).map_err(|e| {
                LatentTruthError::checkpoint(format!("cannot create {}: {e}", parent.display()))
            })?;
        }
        model.save(&path).map_err(|e| {
            LatentTruthError::checkpoint(format!("cannot write {}: {e}", path.display()))
        })?;
        tracing::info!("Saved checkpoint to: {}", path.display());
        Ok(Some(path))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::ModelConfig;
    use crate::model::{BasicNetwork, OutputNormalization};
    use candle_core::Device;
    use tempfile::TempDir;

    fn params() -> SaveParams {
        SaveParams::new("run", "lr0.1").with_time("t0")
    }

    fn model() -> BasicNetwork {
        let config = ModelConfig {
            embedding_dim: 2,
            hidden_dim: 2,
            label_dim: 2,
            ..Default::default()
        };
        BasicNetwork::new(&config, OutputNormalization::Softmax, &Device::Cpu).unwrap()
    }

    #[test]
    fn test_default_model_path() {
        let root = Path::new("/models");
        assert_eq!(
            default_model_path(root, &params(), None),
            PathBuf::from("/models/run_t0_lr0.1")
        );
        assert_eq!(
            default_model_path(root, &params(), Some(0.5)),
            PathBuf::from("/models/run_t0_lr0.1_f1_0.5000")
        );
    }

    #[test]
    fn test_path_suffixes() {
        let policy = CheckpointPolicy::new(Some("/m".into()), BTreeSet::new(), Some(params()));
        assert_eq!(
            policy.path_for(3, None, false).unwrap(),
            PathBuf::from("/m/run_t0_lr0.1_epoch3.safetensors")
        );
        assert_eq!(
            policy.path_for(3, None, true).unwrap(),
            PathBuf::from("/m/run_t0_lr0.1_epoch3_early_stopping.safetensors")
        );
    }

    #[test]
    fn test_disabled_without_root_or_params() {
        let save_at: BTreeSet<usize> = [0].into();
        let no_params = CheckpointPolicy::new(Some("/m".into()), save_at.clone(), None);
        assert!(!no_params.should_save(0, true));
        let no_root = CheckpointPolicy::new(None, save_at, Some(params()));
        assert!(!no_root.should_save(0, false));
        assert!(no_root.path_for(0, None, false).is_none());
    }

    #[test]
    fn test_save_only_at_listed_epochs_or_early_stop() {
        let dir = TempDir::new().unwrap();
        let policy = CheckpointPolicy::new(
            Some(dir.path().join("nested")),
            [1].into(),
            Some(params()),
        );
        let model = model();
        assert!(policy.save(&model, 0, None, false).unwrap().is_none());
        let saved = policy.save(&model, 1, None, false).unwrap().unwrap();
        assert!(saved.exists());
        let early = policy.save(&model, 2, None, true).unwrap().unwrap();
        assert!(early.to_string_lossy().ends_with("_epoch2_early_stopping.safetensors"));
    }

    #[test]
    fn test_save_never_overwrites() {
        let dir = TempDir::new().unwrap();
        let policy =
            CheckpointPolicy::new(Some(dir.path().to_path_buf()), [0].into(), Some(params()));
        let model = model();
        policy.save(&model, 0, None, false).unwrap();
        let err = policy.save(&model, 0, None, false).unwrap_err();
        assert!(matches!(err, LatentTruthError::Checkpoint(_)));
    }

    #[test]
    fn test_custom_path_fn() {
        let policy = CheckpointPolicy::new(Some("/m".into()), [0].into(), Some(params()))
            .with_path_fn(Box::new(|root: &Path, p: &SaveParams, _: Option<f64>| {
                root.join(format!("custom_{}", p.stem))
            }));
        assert_eq!(
            policy.path_for(0, Some(0.9), false).unwrap(),
            PathBuf::from("/m/custom_run_epoch0.safetensors")
        );
    }
}
