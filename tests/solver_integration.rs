//! End-to-end tests of the training orchestrator.

use std::collections::BTreeSet;

use latent_truth_rs::checkpoint::SaveParams;
use latent_truth_rs::config::{FitOptions, OptimizerKind, SolverConfig};
use latent_truth_rs::data::{InMemoryDataset, Sample};
use latent_truth_rs::model::{AnnotatorModel, BasicNetwork, OutputNormalization};
use latent_truth_rs::sink::MemorySink;
use latent_truth_rs::solver::{RunState, Solver};
use latent_truth_rs::LatentTruthError;
use tempfile::TempDir;

fn small_config() -> SolverConfig {
    let mut config = SolverConfig::binary_sentiment_preset();
    config.model.embedding_dim = 2;
    config.model.hidden_dim = 4;
    config.training.batch_size = 1;
    config.training.optimizer = OptimizerKind::Sgd;
    config.training.learning_rate = 0.05;
    config.checkpoint.save_root = None;
    config
}

fn sample(id: u64, annotator: &str) -> Sample {
    Sample::new(id, vec![id as f32 * 0.25, 1.0 - id as f32 * 0.1], (id % 2) as u32, annotator)
}

/// Annotator `a`: 3 train, 1 validation. Annotator `b`: 2 train, 2 validation.
fn two_annotator_dataset() -> InMemoryDataset {
    InMemoryDataset::from_splits(
        vec!["a".into(), "b".into()],
        vec![sample(0, "a"), sample(1, "a"), sample(2, "a"), sample(3, "b"), sample(4, "b")],
        vec![sample(5, "a"), sample(6, "b"), sample(7, "b")],
        Vec::new(),
    )
    .unwrap()
}

fn epochs(n: usize) -> FitOptions {
    FitOptions {
        epochs: n,
        ..Default::default()
    }
}

#[test]
fn test_sequential_epoch_counts_every_batch() {
    let mut solver = Solver::new(small_config(), two_annotator_dataset()).unwrap();
    let outcome = solver.fit(&epochs(1)).unwrap();

    // batch size 1: one loss per sample, one step per train sample
    assert_eq!(outcome.loss_evaluations, 8);
    assert_eq!(outcome.loss_history.len(), 8);
    assert_eq!(outcome.optimizer_steps, 5);
    assert_eq!(outcome.state, RunState::Completed);
    assert_eq!(outcome.validation_losses.len(), 1);
    assert!(outcome.f1.is_none());
}

#[test]
fn test_plateau_stops_and_checkpoints() {
    let dir = TempDir::new().unwrap();
    let mut config = small_config();
    config.training.learning_rate = 0.0;
    config.checkpoint.save_root = Some(dir.path().to_path_buf());
    config.checkpoint.save_at = BTreeSet::from([1, 3, 8]);

    let mut solver = Solver::new(config, two_annotator_dataset())
        .unwrap()
        .with_checkpoint_params(SaveParams::new("run", "lr0").with_time("t"));
    let options = FitOptions {
        epochs: 10,
        early_stopping_interval: 3,
        ..Default::default()
    };
    let outcome = solver.fit(&options).unwrap();

    match outcome.state {
        RunState::EarlyStopped { epoch, .. } => assert_eq!(epoch, 4),
        other => panic!("expected early stop, got {other:?}"),
    }
    assert_eq!(outcome.epochs_run, 5);
    assert_eq!(outcome.validation_losses.len(), 5);

    let names: Vec<String> = outcome
        .checkpoints
        .iter()
        .map(|p| p.file_name().unwrap().to_string_lossy().into_owned())
        .collect();
    assert_eq!(
        names,
        vec![
            "run_t_lr0_epoch1.safetensors",
            "run_t_lr0_epoch3.safetensors",
            "run_t_lr0_epoch4_early_stopping.safetensors",
        ]
    );
    assert!(outcome.checkpoints.iter().all(|p| p.exists()));
}

#[test]
fn test_f1_is_part_of_checkpoint_names() {
    let dir = TempDir::new().unwrap();
    let mut config = small_config();
    config.checkpoint.save_root = Some(dir.path().to_path_buf());
    config.checkpoint.save_at = BTreeSet::from([0]);

    let mut solver = Solver::new(config, two_annotator_dataset())
        .unwrap()
        .with_checkpoint_params(SaveParams::new("run", "hp").with_time("t"));
    let options = FitOptions {
        return_f1: true,
        ..epochs(1)
    };
    let outcome = solver.fit(&options).unwrap();

    assert!(outcome.f1.is_some());
    let name = outcome.checkpoints[0].file_name().unwrap().to_string_lossy().into_owned();
    assert!(name.starts_with("run_t_hp_f1_"), "{name}");
    assert!(name.ends_with("_epoch0.safetensors"), "{name}");
}

#[test]
fn test_mixed_regime_reports_per_annotator() {
    let mut config = small_config();
    config.training.batch_size = 4;
    let train = vec![
        sample(0, "a"),
        sample(1, "b").with_pseudo("a", 1),
        sample(2, "a").with_pseudo("b", 0),
        sample(3, "b"),
    ];
    let dataset = InMemoryDataset::from_splits(
        vec!["a".into(), "b".into()],
        train,
        vec![sample(4, "a"), sample(5, "b")],
        Vec::new(),
    )
    .unwrap();
    let mut solver = Solver::new(config, dataset).unwrap();
    let options = FitOptions {
        deep_randomization: true,
        ..epochs(2)
    };
    let model = solver.build_model(&options).unwrap();
    let mut sink = MemorySink::new();
    let outcome = solver.fit_model_with_sink(model, &options, &mut sink).unwrap();

    // one train batch per epoch, one step per annotator
    assert_eq!(outcome.optimizer_steps, 4);
    assert_eq!(sink.series("Loss/Annotator a/validation").len(), 2);
    assert_eq!(sink.series("F1 score/Annotator b/train").len(), 2);
    assert!(sink.series("Loss/Annotator all/train").is_empty());
}

#[test]
fn test_fix_base_only_moves_bias_heads() {
    let mut config = small_config();
    config.training.learning_rate = 0.5;
    let mut solver = Solver::new(config, two_annotator_dataset()).unwrap();
    let options = FitOptions {
        fix_base: true,
        ..epochs(1)
    };
    let model = solver.build_model(&options).unwrap();
    let before = model.state().unwrap();
    let outcome = solver.fit_model(model, &options).unwrap();
    let after = outcome.model.state().unwrap();

    let mut bias_moved = false;
    for (name, tensor) in &before {
        let old = tensor.flatten_all().unwrap().to_vec1::<f32>().unwrap();
        let new = after[name].flatten_all().unwrap().to_vec1::<f32>().unwrap();
        if name.starts_with("basic.") {
            assert_eq!(old, new, "{name} changed");
        } else if old != new {
            bias_moved = true;
        }
    }
    assert!(bias_moved);
}

/// Fits with `options` at a high learning rate and asserts that every
/// parameter of the shared network moved.
fn assert_shared_network_trains(options: FitOptions) {
    let mut config = small_config();
    config.model.hidden_dim = 16;
    config.training.learning_rate = 0.5;
    let mut solver = Solver::new(config, two_annotator_dataset()).unwrap();
    let model = solver.build_model(&options).unwrap();
    let before = model.state().unwrap();
    let outcome = solver.fit_model(model, &options).unwrap();
    let after = outcome.model.state().unwrap();

    let mut checked = 0;
    for (name, tensor) in before.iter().filter(|(n, _)| n.starts_with("basic.")) {
        let old = tensor.flatten_all().unwrap().to_vec1::<f32>().unwrap();
        let new = after[name].flatten_all().unwrap().to_vec1::<f32>().unwrap();
        assert_ne!(old, new, "{name} did not change");
        checked += 1;
    }
    assert_eq!(checked, 4);
}

#[test]
fn test_sequential_training_updates_shared_network() {
    assert_shared_network_trains(epochs(2));
}

#[test]
fn test_mixed_training_updates_shared_network() {
    assert_shared_network_trains(FitOptions {
        deep_randomization: true,
        ..epochs(2)
    });
}

#[test]
fn test_basic_only_training_updates_network() {
    assert_shared_network_trains(FitOptions {
        basic_only: true,
        ..epochs(2)
    });
    assert_shared_network_trains(FitOptions {
        basic_only: true,
        deep_randomization: true,
        ..epochs(2)
    });
}

#[test]
fn test_pretrained_basic_weights_are_loaded() {
    let dir = TempDir::new().unwrap();
    let path = dir.path().join("basic.safetensors");
    let mut config = small_config();
    let basic = BasicNetwork::new(
        &config.model,
        OutputNormalization::Softmax,
        &candle_core::Device::Cpu,
    )
    .unwrap();
    basic.save(&path).unwrap();
    config.model.weights_path = Some(path);

    let solver = Solver::new(config, two_annotator_dataset()).unwrap();
    let options = FitOptions {
        pretrained_basic: true,
        ..epochs(1)
    };
    let model = solver.build_model(&options).unwrap();
    assert_eq!(model.head_count(), 2);

    let expected = basic.state().unwrap();
    let loaded = model.state().unwrap();
    for (name, tensor) in expected {
        let a = tensor.flatten_all().unwrap().to_vec1::<f32>().unwrap();
        let b = loaded[&name].flatten_all().unwrap().to_vec1::<f32>().unwrap();
        assert_eq!(a, b, "{name}");
    }
}

#[test]
fn test_annotator_dim_mismatch_fails_before_training() {
    let mut config = small_config();
    config.model.annotator_dim = Some(3);
    let mut solver = Solver::new(config, two_annotator_dataset()).unwrap();
    let err = solver.fit(&epochs(1)).unwrap_err();
    assert!(matches!(err, LatentTruthError::Config(_)));
}

#[test]
fn test_single_annotator_trains_only_that_annotator() {
    let mut solver = Solver::new(small_config(), two_annotator_dataset()).unwrap();
    let options = FitOptions {
        single_annotator: Some("b".into()),
        ..epochs(1)
    };
    let outcome = solver.fit(&options).unwrap();
    assert_eq!(outcome.optimizer_steps, 2);
    assert_eq!(outcome.loss_history.len(), 4);
}

#[test]
fn test_out_of_range_target_fails_before_training() {
    let dataset = InMemoryDataset::from_splits(
        vec!["a".into()],
        vec![sample(0, "a"), Sample::new(1, vec![0.5, 0.5], 5, "a")],
        Vec::new(),
        Vec::new(),
    )
    .unwrap();
    let err = Solver::new(small_config(), dataset).err().unwrap();
    assert!(matches!(err, LatentTruthError::Dataset(_)), "{err}");
}
