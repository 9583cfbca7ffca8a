//! Dataset abstractions: the `LabeledDataset` trait, subset/instance-weight
//! wrappers and the group-id derivation used by stratified sampling.

use std::collections::HashMap;
use std::sync::Arc;

use candle_core::{Device, Tensor};
use ndarray::{Array1, ArrayView1};

use crate::{FbError, Result};

/// A dataset whose samples can be loaded as tensors and which may carry a
/// sensitive attribute (`s`) and/or a label (`y`) per sample.
///
/// Label vectors are host-side `i64` arrays; inputs are materialized lazily,
/// one sample at a time, onto the requested device.
pub trait LabeledDataset {
    /// Number of samples.
    fn len(&self) -> usize;

    fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Per-sample sensitive-attribute values, if the dataset carries them.
    fn s(&self) -> Option<ArrayView1<'_, i64>> {
        None
    }

    /// Per-sample labels, if the dataset carries them.
    fn y(&self) -> Option<ArrayView1<'_, i64>> {
        None
    }

    /// Cardinality of the sensitive attribute (number of distinct values).
    fn card_s(&self) -> Option<usize> {
        self.s().map(num_classes)
    }

    /// Cardinality of the label.
    fn card_y(&self) -> Option<usize> {
        self.y().map(num_classes)
    }

    /// Load the input for one sample onto `device`.
    fn load_input(&self, index: usize, device: &Device) -> Result<Tensor>;

    /// Per-instance weight, when the dataset has been wrapped with
    /// [`InstanceWeighted`]. Plain datasets carry none.
    fn instance_weight(&self, _index: usize) -> Option<f32> {
        None
    }

    /// Shape of a single input, probed from the first sample.
    fn input_shape(&self) -> Result<Vec<usize>> {
        if self.is_empty() {
            return Err(FbError::Data(
                "cannot probe input shape of an empty dataset".to_string(),
            ));
        }
        Ok(self.load_input(0, &Device::Cpu)?.dims().to_vec())
    }
}

/// Number of classes implied by a zero-based label vector.
fn num_classes(labels: ArrayView1<'_, i64>) -> usize {
    labels.iter().map(|&v| v + 1).max().unwrap_or(0).max(0) as usize
}

/// Combine `s` and/or `y` into a single non-negative group id per sample.
///
/// When both are present the encoding is y-major: `group = y * card_s + s`.
/// With only one label vector available, that vector is used directly. The
/// encoding assumes zero-based contiguous values; anything negative or at or
/// above the advertised cardinality is rejected.
pub fn get_group_ids(dataset: &dyn LabeledDataset) -> Result<Vec<i64>> {
    let s = dataset.s();
    let y = dataset.y();
    match (s, y) {
        (None, None) => Err(FbError::Data(
            "unable to compute group ids: dataset carries neither 's' nor 'y' labels".to_string(),
        )),
        (Some(s), None) => {
            validate_labels(s, dataset.card_s().unwrap_or(0), "s")?;
            Ok(s.to_vec())
        }
        (None, Some(y)) => {
            validate_labels(y, dataset.card_y().unwrap_or(0), "y")?;
            Ok(y.to_vec())
        }
        (Some(s), Some(y)) => {
            let card_s = dataset.card_s().unwrap_or(0);
            validate_labels(s, card_s, "s")?;
            validate_labels(y, dataset.card_y().unwrap_or(0), "y")?;
            if s.len() != y.len() {
                return Err(FbError::Data(format!(
                    "label length mismatch: |s| = {} but |y| = {}",
                    s.len(),
                    y.len()
                )));
            }
            Ok(s.iter()
                .zip(y.iter())
                .map(|(&si, &yi)| yi * card_s as i64 + si)
                .collect())
        }
    }
}

fn validate_labels(labels: ArrayView1<'_, i64>, card: usize, name: &str) -> Result<()> {
    for &v in labels.iter() {
        if v < 0 || v >= card as i64 {
            return Err(FbError::Data(format!(
                "'{name}' value {v} outside the zero-based range [0, {card}); \
                 non-contiguous or non-zero-based encodings must be remapped upstream"
            )));
        }
    }
    Ok(())
}

/// Per-sample weights inversely proportional to the sample's group size,
/// i.e. the Kamiran & Calders reweighting input.
pub fn compute_instance_weights(dataset: &dyn LabeledDataset) -> Result<Vec<f32>> {
    let group_ids = get_group_ids(dataset)?;
    let mut counts: HashMap<i64, usize> = HashMap::new();
    for &g in &group_ids {
        *counts.entry(g).or_insert(0) += 1;
    }
    Ok(group_ids
        .iter()
        .map(|g| 1.0 / counts[g] as f32)
        .collect())
}

/// A view over a subset of another dataset's samples.
///
/// Label vectors are materialized once at construction so that the subset
/// can hand out contiguous views of its own data.
pub struct Subset {
    base: Arc<dyn LabeledDataset>,
    indices: Vec<usize>,
    s: Option<Array1<i64>>,
    y: Option<Array1<i64>>,
}

impl Subset {
    pub fn new(base: Arc<dyn LabeledDataset>, indices: Vec<usize>) -> Result<Self> {
        if let Some(&bad) = indices.iter().find(|&&i| i >= base.len()) {
            return Err(FbError::Data(format!(
                "subset index {bad} out of bounds for dataset of length {}",
                base.len()
            )));
        }
        let s = base
            .s()
            .map(|s| indices.iter().map(|&i| s[i]).collect::<Array1<i64>>());
        let y = base
            .y()
            .map(|y| indices.iter().map(|&i| y[i]).collect::<Array1<i64>>());
        Ok(Self { base, indices, s, y })
    }

    pub fn indices(&self) -> &[usize] {
        &self.indices
    }
}

impl LabeledDataset for Subset {
    fn len(&self) -> usize {
        self.indices.len()
    }

    fn s(&self) -> Option<ArrayView1<'_, i64>> {
        self.s.as_ref().map(|s| s.view())
    }

    fn y(&self) -> Option<ArrayView1<'_, i64>> {
        self.y.as_ref().map(|y| y.view())
    }

    fn card_s(&self) -> Option<usize> {
        // Cardinality comes from the base dataset: a split must not change
        // the label space even if it drops all samples of some value.
        self.base.card_s()
    }

    fn card_y(&self) -> Option<usize> {
        self.base.card_y()
    }

    fn load_input(&self, index: usize, device: &Device) -> Result<Tensor> {
        self.base.load_input(self.indices[index], device)
    }
}

/// Wrapper attaching precomputed Kamiran & Calders instance weights to a
/// dataset, surfaced to loaders through [`LabeledDataset::instance_weight`].
pub struct InstanceWeighted {
    base: Arc<dyn LabeledDataset>,
    weights: Vec<f32>,
}

impl InstanceWeighted {
    pub fn new(base: Arc<dyn LabeledDataset>) -> Result<Self> {
        let weights = compute_instance_weights(base.as_ref())?;
        Ok(Self { base, weights })
    }

    pub fn weights(&self) -> &[f32] {
        &self.weights
    }
}

impl LabeledDataset for InstanceWeighted {
    fn len(&self) -> usize {
        self.base.len()
    }

    fn s(&self) -> Option<ArrayView1<'_, i64>> {
        self.base.s()
    }

    fn y(&self) -> Option<ArrayView1<'_, i64>> {
        self.base.y()
    }

    fn card_s(&self) -> Option<usize> {
        self.base.card_s()
    }

    fn card_y(&self) -> Option<usize> {
        self.base.card_y()
    }

    fn load_input(&self, index: usize, device: &Device) -> Result<Tensor> {
        self.base.load_input(index, device)
    }

    fn instance_weight(&self, index: usize) -> Option<f32> {
        self.weights.get(index).copied()
    }
}
