//! Pseudo-label generation.
//!
//! For every configured pseudo annotator `P`, a [`BasicNetwork`] trained on
//! `P`'s labels predicts what `P` would have said about every sample some
//! other annotator produced. The argmax is stored as `pseudo_targets[P]`.

use candle_core::{Device, D};

use crate::config::{LossKind, ModelConfig, PseudoLabelConfig};
use crate::data::{collate_batch, AnnotatorDataset, Sample};
use crate::error::{LatentTruthError, Result};
use crate::model::{AnnotatorModel, BasicNetwork, OutputNormalization};

const LABEL_CHUNK: usize = 1024;

/// Argmax predictions of `model` for `samples`, computed in chunks.
pub fn predict_labels(
    model: &dyn AnnotatorModel,
    samples: &[&Sample],
    device: &Device,
) -> Result<Vec<u32>> {
    let mut labels = Vec::with_capacity(samples.len());
    for chunk in samples.chunks(LABEL_CHUNK) {
        let batch = collate_batch(chunk, device)?;
        let scores = model.latent_truth(&batch.input)?;
        labels.extend(scores.argmax(D::Minus1)?.to_vec1::<u32>()?);
    }
    Ok(labels)
}

/// Attach pseudo-labels from every configured pseudo annotator's network.
///
/// Returns the total number of labels attached.
pub fn attach_pseudo_labels<DS: AnnotatorDataset + ?Sized>(
    dataset: &mut DS,
    pseudo: &PseudoLabelConfig,
    model_config: &ModelConfig,
    loss: LossKind,
    device: &Device,
) -> Result<usize> {
    let normalization = OutputNormalization::from_settings(model_config.use_softmax, loss);
    let mut total = 0;
    for annotator in &pseudo.annotators {
        if dataset.annotator_index(annotator).is_none() {
            tracing::warn!(
                "pseudo annotator '{annotator}' is not in the dataset ordering; its labels have no head"
            );
        }
        let path = pseudo.model_path(annotator);
        if !path.exists() {
            return Err(LatentTruthError::config(format!(
                "pseudo-label model for '{annotator}' not found at {}",
                path.display()
            )));
        }
        let network = BasicNetwork::new(model_config, normalization, device)?;
        network.load(&path, true)?;

        let attached = dataset.attach_pseudo_labels(annotator, &mut |rows: &[&Sample]| {
            predict_labels(&network, rows, device)
        })?;
        tracing::info!("Attached {attached} pseudo-labels for annotator {annotator}");
        total += attached;
    }
    Ok(total)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::data::{InMemoryDataset, Split};

    fn config() -> ModelConfig {
        ModelConfig {
            embedding_dim: 2,
            hidden_dim: 3,
            label_dim: 2,
            ..Default::default()
        }
    }

    #[test]
    fn test_predict_labels_matches_argmax() {
        let net = BasicNetwork::new(&config(), OutputNormalization::Softmax, &Device::Cpu).unwrap();
        let samples: Vec<Sample> = (0..5)
            .map(|i| Sample::new(i, vec![i as f32, -(i as f32)], 0, "a"))
            .collect();
        let refs: Vec<&Sample> = samples.iter().collect();
        let labels = predict_labels(&net, &refs, &Device::Cpu).unwrap();
        assert_eq!(labels.len(), 5);
        assert!(labels.iter().all(|&l| l < 2));
    }

    #[test]
    fn test_attach_from_saved_network() {
        let dir = tempfile::tempdir().unwrap();
        let net = BasicNetwork::new(&config(), OutputNormalization::Softmax, &Device::Cpu).unwrap();
        net.save(&dir.path().join("a_basic.safetensors")).unwrap();

        let mut dataset = InMemoryDataset::from_splits(
            vec!["a".into(), "b".into()],
            vec![
                Sample::new(0, vec![0.0, 1.0], 0, "a"),
                Sample::new(0, vec![0.0, 1.0], 1, "b"),
            ],
            vec![Sample::new(1, vec![1.0, 0.0], 1, "b")],
            Vec::new(),
        )
        .unwrap();
        let pseudo = PseudoLabelConfig {
            annotators: vec!["a".into()],
            model_path_template: format!("{}/{{annotator}}_basic.safetensors", dir.path().display()),
        };

        let attached = attach_pseudo_labels(
            &mut dataset,
            &pseudo,
            &config(),
            LossKind::CrossEntropy,
            &Device::Cpu,
        )
        .unwrap();
        assert_eq!(attached, 2);
        assert!(dataset.split(Split::Train)[0].pseudo_targets.is_empty());
        assert!(dataset.split(Split::Validation)[0]
            .pseudo_targets
            .contains_key("a"));
    }

    #[test]
    fn test_missing_model_is_a_config_error() {
        let mut dataset = InMemoryDataset::from_splits(
            vec!["a".into()],
            Vec::new(),
            Vec::new(),
            Vec::new(),
        )
        .unwrap();
        let pseudo = PseudoLabelConfig {
            annotators: vec!["a".into()],
            model_path_template: "/nonexistent/{annotator}.safetensors".into(),
        };
        let err = attach_pseudo_labels(
            &mut dataset,
            &pseudo,
            &config(),
            LossKind::CrossEntropy,
            &Device::Cpu,
        )
        .unwrap_err();
        assert!(matches!(err, LatentTruthError::Config(_)));
    }
}
