//! Annotated samples, batching and the dataset contract.
//!
//! - [`Sample`] - one label given by one annotator, plus pseudo-labels
//! - [`Batch`] - samples collated into tensors via [`collate_batch`]
//! - [`AnnotatorDataset`] - mode-switchable, annotator-filterable sample store
//! - [`InMemoryDataset`] - the in-memory implementation, loadable from JSONL
//!
//! # Example
//!
//! ```rust
//! use candle_core::Device;
//! use latent_truth_rs::data::{AnnotatorDataset, InMemoryDataset, Sample, Split};
//!
//! # fn main() -> latent_truth_rs::Result<()> {
//! let samples = vec![
//!     Sample::new(0, vec![0.0, 1.0], 1, "alice"),
//!     Sample::new(0, vec![0.0, 1.0], 0, "bob"),
//! ];
//! let mut dataset = InMemoryDataset::from_splits(
//!     vec!["alice".into(), "bob".into()],
//!     samples,
//!     Vec::new(),
//!     Vec::new(),
//! )?;
//! dataset.set_mode(Split::Train);
//! dataset.set_annotator_filter("bob")?;
//! assert_eq!(dataset.len(), 1);
//!
//! for batch in dataset.loader(8, false, &Device::Cpu)? {
//!     assert_eq!(batch?.len(), 1);
//! }
//! # Ok(())
//! # }
//! ```

use std::collections::{BTreeMap, BTreeSet};
use std::fmt;
use std::fs::File;
use std::io::{BufRead, BufReader};
use std::path::Path;
use std::str::FromStr;

use candle_core::{Device, Tensor};
use rand::rngs::StdRng;
use rand::seq::SliceRandom;
use rand::SeedableRng;
use serde::{Deserialize, Serialize};

use crate::error::{LatentTruthError, Result};

/// Dataset split.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Split {
    /// Training split.
    #[default]
    Train,
    /// Validation split.
    Validation,
    /// Held-out test split.
    Test,
}

impl Split {
    fn index(self) -> usize {
        match self {
            Self::Train => 0,
            Self::Validation => 1,
            Self::Test => 2,
        }
    }
}

impl fmt::Display for Split {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Self::Train => "train",
            Self::Validation => "validation",
            Self::Test => "test",
        })
    }
}

impl FromStr for Split {
    type Err = LatentTruthError;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "train" => Ok(Self::Train),
            "validation" | "val" => Ok(Self::Validation),
            "test" => Ok(Self::Test),
            other => Err(LatentTruthError::config(format!("unknown split '{other}'"))),
        }
    }
}

/// One label produced by one annotator.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Sample {
    /// Item identifier; labels of the same item share it.
    pub id: u64,
    /// Feature vector.
    pub input: Vec<f32>,
    /// Class label.
    pub target: u32,
    /// Annotator that produced `target`.
    pub annotator: String,
    /// Labels synthesized for other annotators.
    #[serde(default)]
    pub pseudo_targets: BTreeMap<String, u32>,
}

impl Sample {
    /// Create a sample without pseudo-labels.
    pub fn new(id: u64, input: Vec<f32>, target: u32, annotator: impl Into<String>) -> Self {
        Self {
            id,
            input,
            target,
            annotator: annotator.into(),
            pseudo_targets: BTreeMap::new(),
        }
    }

    /// Add a pseudo-label attributed to `annotator`.
    pub fn with_pseudo(mut self, annotator: impl Into<String>, target: u32) -> Self {
        self.pseudo_targets.insert(annotator.into(), target);
        self
    }

    /// Check that the target and every pseudo target are valid class indices.
    pub fn check_labels(&self, label_dim: usize) -> Result<()> {
        let labels = std::iter::once((self.annotator.as_str(), self.target))
            .chain(self.pseudo_targets.iter().map(|(a, t)| (a.as_str(), *t)));
        for (annotator, label) in labels {
            if label as usize >= label_dim {
                return Err(LatentTruthError::dataset(format!(
                    "sample {} has label {label} from '{annotator}', expected < {label_dim}",
                    self.id
                )));
            }
        }
        Ok(())
    }
}

/// Samples collated into tensors.
#[derive(Debug, Clone)]
pub struct Batch {
    /// Inputs `[N, D]`.
    pub input: Tensor,
    /// Targets `[N]` (u32).
    pub target: Tensor,
    /// Producing annotator of each row.
    pub annotations: Vec<String>,
    /// Pseudo-labels of each row.
    pub pseudo_targets: Vec<BTreeMap<String, u32>>,
}

impl Batch {
    /// Number of rows.
    pub fn len(&self) -> usize {
        self.annotations.len()
    }

    /// Whether the batch has no rows.
    pub fn is_empty(&self) -> bool {
        self.annotations.is_empty()
    }

    /// Pseudo annotators that label at least one row, in sorted order.
    pub fn pseudo_annotators(&self) -> BTreeSet<&str> {
        self.pseudo_targets
            .iter()
            .flat_map(|m| m.keys().map(String::as_str))
            .collect()
    }
}

/// Collate samples into a [`Batch`] on `device`.
pub fn collate_batch(samples: &[&Sample], device: &Device) -> Result<Batch> {
    let first = samples
        .first()
        .ok_or_else(|| LatentTruthError::dataset("cannot collate an empty batch"))?;
    let dim = first.input.len();

    let mut input = Vec::with_capacity(samples.len() * dim);
    let mut target = Vec::with_capacity(samples.len());
    let mut annotations = Vec::with_capacity(samples.len());
    let mut pseudo_targets = Vec::with_capacity(samples.len());
    for sample in samples {
        if sample.input.len() != dim {
            return Err(LatentTruthError::dataset(format!(
                "sample {} has {} features, expected {dim}",
                sample.id,
                sample.input.len()
            )));
        }
        input.extend_from_slice(&sample.input);
        target.push(sample.target);
        annotations.push(sample.annotator.clone());
        pseudo_targets.push(sample.pseudo_targets.clone());
    }

    let n = samples.len();
    Ok(Batch {
        input: Tensor::from_vec(input, (n, dim), device)?,
        target: Tensor::from_vec(target, n, device)?,
        annotations,
        pseudo_targets,
    })
}

/// Iterator over the batches of one dataset view, in strict order.
#[derive(Debug)]
pub struct BatchLoader {
    samples: Vec<Sample>,
    order: Vec<usize>,
    batch_size: usize,
    cursor: usize,
    device: Device,
}

impl BatchLoader {
    /// Create a loader over owned samples.
    pub fn new(
        samples: Vec<Sample>,
        batch_size: usize,
        rng: Option<&mut StdRng>,
        device: &Device,
    ) -> Result<Self> {
        if batch_size == 0 {
            return Err(LatentTruthError::dataset("batch size must be > 0"));
        }
        let mut order: Vec<usize> = (0..samples.len()).collect();
        if let Some(rng) = rng {
            order.shuffle(rng);
        }
        Ok(Self {
            samples,
            order,
            batch_size,
            cursor: 0,
            device: device.clone(),
        })
    }

    /// Total number of batches.
    pub fn len(&self) -> usize {
        self.samples.len().div_ceil(self.batch_size)
    }

    /// Whether there are no batches at all.
    pub fn is_empty(&self) -> bool {
        self.samples.is_empty()
    }

    /// Number of samples.
    pub fn sample_count(&self) -> usize {
        self.samples.len()
    }
}

impl Iterator for BatchLoader {
    type Item = Result<Batch>;

    fn next(&mut self) -> Option<Self::Item> {
        if self.cursor >= self.order.len() {
            return None;
        }
        let end = (self.cursor + self.batch_size).min(self.order.len());
        let rows: Vec<&Sample> = self.order[self.cursor..end]
            .iter()
            .map(|&i| &self.samples[i])
            .collect();
        self.cursor = end;
        Some(collate_batch(&rows, &self.device))
    }
}

/// Labeling function used to attach pseudo-labels.
pub type Labeler<'a> = dyn FnMut(&[&Sample]) -> Result<Vec<u32>> + 'a;

/// Sample store with a current split and an optional annotator filter.
pub trait AnnotatorDataset {
    /// Select the split subsequent calls operate on.
    fn set_mode(&mut self, split: Split);

    /// Current split.
    fn mode(&self) -> Split;

    /// Restrict the view to one annotator.
    fn set_annotator_filter(&mut self, annotator: &str) -> Result<()>;

    /// Remove the annotator restriction.
    fn clear_annotator_filter(&mut self);

    /// Current annotator restriction.
    fn annotator_filter(&self) -> Option<&str>;

    /// Fixed annotator ordering; positions are model head indices.
    fn annotators(&self) -> &[String];

    /// Reshuffle the order of samples within every split.
    fn reshuffle_splits(&mut self);

    /// Samples of the current view.
    fn samples(&self) -> Vec<&Sample>;

    /// Samples in the current view.
    fn len(&self) -> usize {
        self.samples().len()
    }

    /// Whether the current view is empty.
    fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Batches of the current view.
    fn loader(&mut self, batch_size: usize, shuffle: bool, device: &Device) -> Result<BatchLoader>;

    /// Label every sample not produced by `pseudo_annotator` with `labeler`,
    /// storing the result under `pseudo_annotator`. Covers all splits and
    /// ignores the filter. Returns the number of labels attached.
    fn attach_pseudo_labels(
        &mut self,
        pseudo_annotator: &str,
        labeler: &mut Labeler<'_>,
    ) -> Result<usize>;

    /// Fail with a dataset error if any target or pseudo target in any
    /// split is not below `label_dim`. Mode and filter are restored.
    fn check_label_range(&mut self, label_dim: usize) -> Result<()> {
        let mode = self.mode();
        let filter = self.annotator_filter().map(str::to_owned);
        self.clear_annotator_filter();

        let mut outcome = Ok(());
        'splits: for split in [Split::Train, Split::Validation, Split::Test] {
            self.set_mode(split);
            for sample in self.samples() {
                if let Err(e) = sample.check_labels(label_dim) {
                    outcome = Err(e);
                    break 'splits;
                }
            }
        }

        self.set_mode(mode);
        if let Some(filter) = filter {
            self.set_annotator_filter(&filter)?;
        }
        outcome
    }

    /// Head index of `annotator`.
    fn annotator_index(&self, annotator: &str) -> Option<usize> {
        self.annotators().iter().position(|a| a == annotator)
    }
}

/// In-memory [`AnnotatorDataset`].
#[derive(Debug, Clone)]
pub struct InMemoryDataset {
    annotators: Vec<String>,
    splits: [Vec<Sample>; 3],
    mode: Split,
    filter: Option<String>,
    rng: StdRng,
}

impl InMemoryDataset {
    /// Build from explicit splits.
    ///
    /// Every sample's annotator must be listed in `annotators`.
    pub fn from_splits(
        annotators: Vec<String>,
        train: Vec<Sample>,
        validation: Vec<Sample>,
        test: Vec<Sample>,
    ) -> Result<Self> {
        let unique: BTreeSet<&String> = annotators.iter().collect();
        if unique.len() != annotators.len() {
            return Err(LatentTruthError::dataset("duplicate annotator in ordering"));
        }
        for sample in train.iter().chain(&validation).chain(&test) {
            if !unique.contains(&sample.annotator) {
                return Err(LatentTruthError::dataset(format!(
                    "sample {} is labeled by unknown annotator '{}'",
                    sample.id, sample.annotator
                )));
            }
        }
        Ok(Self {
            annotators,
            splits: [train, validation, test],
            mode: Split::Train,
            filter: None,
            rng: StdRng::seed_from_u64(0),
        })
    }

    /// Split samples per annotator into train, validation and test.
    ///
    /// The annotator ordering is the sorted set of producing annotators.
    pub fn from_samples(
        samples: Vec<Sample>,
        validation_ratio: f64,
        test_ratio: f64,
        seed: u64,
    ) -> Result<Self> {
        for (name, ratio) in [("validation", validation_ratio), ("test", test_ratio)] {
            if !(0.0..=1.0).contains(&ratio) {
                return Err(LatentTruthError::dataset(format!(
                    "{name} ratio must be in [0, 1], got {ratio}"
                )));
            }
        }
        if validation_ratio + test_ratio > 1.0 {
            return Err(LatentTruthError::dataset(format!(
                "validation and test ratios sum to {} > 1",
                validation_ratio + test_ratio
            )));
        }
        let mut rng = StdRng::seed_from_u64(seed);
        let mut by_annotator: BTreeMap<String, Vec<Sample>> = BTreeMap::new();
        for sample in samples {
            by_annotator
                .entry(sample.annotator.clone())
                .or_default()
                .push(sample);
        }

        let annotators: Vec<String> = by_annotator.keys().cloned().collect();
        let (mut train, mut validation, mut test) = (Vec::new(), Vec::new(), Vec::new());
        for (_, mut group) in by_annotator {
            group.shuffle(&mut rng);
            let n = group.len() as f64;
            let n_test = (n * test_ratio).floor() as usize;
            let n_val = (n * validation_ratio).floor() as usize;
            let mut rest = group.split_off(n_test.min(group.len()));
            test.extend(group);
            let train_part = rest.split_off(n_val.min(rest.len()));
            validation.extend(rest);
            train.extend(train_part);
        }

        Ok(Self::from_splits(annotators, train, validation, test)?.with_seed(seed))
    }

    /// Load samples from a JSONL file (one [`Sample`] per line) and split them.
    pub fn from_jsonl<P: AsRef<Path>>(
        path: P,
        validation_ratio: f64,
        test_ratio: f64,
        seed: u64,
    ) -> Result<Self> {
        let path = path.as_ref();
        let reader = BufReader::new(File::open(path)?);
        let mut samples = Vec::new();
        for (line_no, line) in reader.lines().enumerate() {
            let line = line?;
            if line.trim().is_empty() {
                continue;
            }
            let sample: Sample = serde_json::from_str(&line).map_err(|e| {
                LatentTruthError::dataset(format!(
                    "{}:{}: {e}",
                    path.display(),
                    line_no + 1
                ))
            })?;
            samples.push(sample);
        }
        tracing::info!("Loaded {} samples from {}", samples.len(), path.display());
        Self::from_samples(samples, validation_ratio, test_ratio, seed)
    }

    /// Reseed the shuffling generator.
    pub fn with_seed(mut self, seed: u64) -> Self {
        self.rng = StdRng::seed_from_u64(seed);
        self
    }

    /// Samples of one split, ignoring the filter.
    pub fn split(&self, split: Split) -> &[Sample] {
        &self.splits[split.index()]
    }

    fn view(&self) -> impl Iterator<Item = &Sample> {
        let filter = self.filter.as_deref();
        self.splits[self.mode.index()]
            .iter()
            .filter(move |s| filter.map_or(true, |f| s.annotator == f))
    }
}

impl AnnotatorDataset for InMemoryDataset {
    fn set_mode(&mut self, split: Split) {
        self.mode = split;
    }

    fn mode(&self) -> Split {
        self.mode
    }

    fn set_annotator_filter(&mut self, annotator: &str) -> Result<()> {
        if !self.annotators.iter().any(|a| a == annotator) {
            return Err(LatentTruthError::dataset(format!(
                "unknown annotator '{annotator}'"
            )));
        }
        self.filter = Some(annotator.to_string());
        Ok(())
    }

    fn clear_annotator_filter(&mut self) {
        self.filter = None;
    }

    fn annotator_filter(&self) -> Option<&str> {
        self.filter.as_deref()
    }

    fn annotators(&self) -> &[String] {
        &self.annotators
    }

    fn reshuffle_splits(&mut self) {
        for split in &mut self.splits {
            split.shuffle(&mut self.rng);
        }
    }

    fn samples(&self) -> Vec<&Sample> {
        self.view().collect()
    }

    fn len(&self) -> usize {
        self.view().count()
    }

    fn loader(&mut self, batch_size: usize, shuffle: bool, device: &Device) -> Result<BatchLoader> {
        let samples: Vec<Sample> = self.view().cloned().collect();
        let rng = if shuffle { Some(&mut self.rng) } else { None };
        BatchLoader::new(samples, batch_size, rng, device)
    }

    fn attach_pseudo_labels(
        &mut self,
        pseudo_annotator: &str,
        labeler: &mut Labeler<'_>,
    ) -> Result<usize> {
        let mut attached = 0;
        for split in &mut self.splits {
            let targets: Vec<usize> = split
                .iter()
                .enumerate()
                .filter(|(_, s)| s.annotator != pseudo_annotator)
                .map(|(i, _)| i)
                .collect();
            if targets.is_empty() {
                continue;
            }
            let rows: Vec<&Sample> = targets.iter().map(|&i| &split[i]).collect();
            let labels = labeler(&rows)?;
            if labels.len() != targets.len() {
                return Err(LatentTruthError::dataset(format!(
                    "labeler returned {} labels for {} samples",
                    labels.len(),
                    targets.len()
                )));
            }
            for (i, label) in targets.into_iter().zip(labels) {
                split[i]
                    .pseudo_targets
                    .insert(pseudo_annotator.to_string(), label);
                attached += 1;
            }
        }
        Ok(attached)
    }
}
