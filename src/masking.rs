//! Per-annotator row selection within a batch.
//!
//! A row is a primary row of annotator `A` when `A` produced its label, and
//! a pseudo row of `A` when its pseudo-label mapping has key `A`. Selections
//! with zero rows come back as `None` so callers skip that term.

use candle_core::Tensor;

use crate::data::Batch;
use crate::error::{LatentTruthError, Result};

/// Rows of `annotator`'s own labels.
pub fn primary_rows(batch: &Batch, annotator: &str) -> Vec<u32> {
    batch
        .annotations
        .iter()
        .enumerate()
        .filter(|(_, a)| *a == annotator)
        .map(|(i, _)| i as u32)
        .collect()
}

/// Rows carrying a pseudo-label for `annotator`.
pub fn pseudo_rows(batch: &Batch, annotator: &str) -> Vec<u32> {
    batch
        .pseudo_targets
        .iter()
        .enumerate()
        .filter(|(_, m)| m.contains_key(annotator))
        .map(|(i, _)| i as u32)
        .collect()
}

/// Primary rows of one annotator.
#[derive(Debug, Clone)]
pub struct PrimarySelection {
    /// Selected row indices.
    pub rows: Vec<u32>,
    /// Inputs of those rows.
    pub inputs: Tensor,
    /// Model outputs of those rows.
    pub outputs: Tensor,
    /// Targets of those rows.
    pub targets: Tensor,
}

impl PrimarySelection {
    /// Number of selected rows.
    pub fn len(&self) -> usize {
        self.rows.len()
    }

    /// Whether no rows are selected.
    pub fn is_empty(&self) -> bool {
        self.rows.is_empty()
    }
}

/// Pseudo-labeled rows of one annotator.
#[derive(Debug, Clone)]
pub struct PseudoSelection {
    /// Selected row indices.
    pub rows: Vec<u32>,
    /// Model outputs of those rows.
    pub outputs: Tensor,
    /// Pseudo-labels of those rows.
    pub targets: Tensor,
}

fn check_rows(batch: &Batch, outputs: &Tensor) -> Result<()> {
    let n = outputs.dim(0)?;
    if n != batch.len() {
        return Err(LatentTruthError::training(format!(
            "model produced {n} rows for a batch of {}",
            batch.len()
        )));
    }
    Ok(())
}

/// Primary subset of `annotator` from a batch and the output tensor
/// scored for that annotator.
pub fn select(batch: &Batch, outputs: &Tensor, annotator: &str) -> Result<Option<PrimarySelection>> {
    check_rows(batch, outputs)?;
    let rows = primary_rows(batch, annotator);
    if rows.is_empty() {
        return Ok(None);
    }
    let index = Tensor::new(rows.as_slice(), outputs.device())?;
    Ok(Some(PrimarySelection {
        inputs: batch.input.index_select(&index, 0)?,
        outputs: outputs.index_select(&index, 0)?,
        targets: batch.target.index_select(&index, 0)?,
        rows,
    }))
}

/// Pseudo subset of `annotator` with its synthesized targets.
pub fn select_pseudo(
    batch: &Batch,
    outputs: &Tensor,
    annotator: &str,
) -> Result<Option<PseudoSelection>> {
    check_rows(batch, outputs)?;
    let rows = pseudo_rows(batch, annotator);
    if rows.is_empty() {
        return Ok(None);
    }
    let targets: Vec<u32> = rows
        .iter()
        .filter_map(|&r| batch.pseudo_targets[r as usize].get(annotator).copied())
        .collect();
    let index = Tensor::new(rows.as_slice(), outputs.device())?;
    Ok(Some(PseudoSelection {
        outputs: outputs.index_select(&index, 0)?,
        targets: Tensor::new(targets.as_slice(), outputs.device())?,
        rows,
    }))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::data::{collate_batch, Sample};
    use candle_core::Device;

    fn mixed_batch() -> Batch {
        let samples = [
            Sample::new(0, vec![0.0, 0.0], 0, "a").with_pseudo("b", 1),
            Sample::new(1, vec![1.0, 1.0], 1, "b"),
            Sample::new(2, vec![2.0, 2.0], 1, "a"),
            Sample::new(3, vec![3.0, 3.0], 0, "c").with_pseudo("b", 0),
        ];
        let refs: Vec<&Sample> = samples.iter().collect();
        collate_batch(&refs, &Device::Cpu).unwrap()
    }

    fn outputs(n: usize) -> Tensor {
        Tensor::arange(0f32, (n * 2) as f32, &Device::Cpu)
            .unwrap()
            .reshape((n, 2))
            .unwrap()
    }

    #[test]
    fn test_primary_selection_matches_annotations() {
        let batch = mixed_batch();
        let sel = select(&batch, &outputs(4), "a").unwrap().unwrap();
        assert_eq!(sel.rows, vec![0, 2]);
        assert_eq!(sel.targets.to_vec1::<u32>().unwrap(), vec![0, 1]);
        assert_eq!(
            sel.inputs.to_vec2::<f32>().unwrap(),
            vec![vec![0.0, 0.0], vec![2.0, 2.0]]
        );
        assert_eq!(
            sel.outputs.to_vec2::<f32>().unwrap(),
            vec![vec![0.0, 1.0], vec![4.0, 5.0]]
        );
    }

    #[test]
    fn test_pseudo_selection_uses_mapping_keys() {
        let batch = mixed_batch();
        let sel = select_pseudo(&batch, &outputs(4), "b").unwrap().unwrap();
        assert_eq!(sel.rows, vec![0, 3]);
        assert_eq!(sel.targets.to_vec1::<u32>().unwrap(), vec![1, 0]);
    }

    #[test]
    fn test_primary_and_pseudo_rows_are_disjoint() {
        let batch = mixed_batch();
        for annotator in ["a", "b", "c"] {
            let primary = primary_rows(&batch, annotator);
            let pseudo = pseudo_rows(&batch, annotator);
            assert!(primary.iter().all(|r| !pseudo.contains(r)));
        }
    }

    #[test]
    fn test_empty_selection_is_skipped() {
        let batch = mixed_batch();
        assert!(select(&batch, &outputs(4), "zed").unwrap().is_none());
        assert!(select_pseudo(&batch, &outputs(4), "a").unwrap().is_none());
    }

    #[test]
    fn test_row_count_mismatch_is_an_error() {
        let batch = mixed_batch();
        assert!(select(&batch, &outputs(3), "a").is_err());
    }
}
