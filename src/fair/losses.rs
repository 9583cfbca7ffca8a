//! Fairness-aware loss functions.

use candle_core::{DType, Tensor, D};
use candle_nn::ops;

use crate::{FbError, Result};

/// How per-instance losses are collapsed into a scalar.
#[derive(Debug, Clone, Copy, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ReductionType {
    Mean,
    Sum,
    None,
}

/// Cross-entropy over logits with optional class weights and optional
/// per-instance weights.
///
/// Instance weights are how the Kamiran & Calders baseline upweights
/// underrepresented (s, y) groups; class weights follow the usual
/// imbalanced-label convention.
pub struct CrossEntropy {
    class_weight: Option<Tensor>,
    reduction: ReductionType,
}

impl CrossEntropy {
    pub fn new(class_weight: Option<Tensor>, reduction: ReductionType) -> Self {
        Self {
            class_weight,
            reduction,
        }
    }

    /// `input` is `(N, C)` logits; `target` an integer vector of length `N`.
    pub fn forward(
        &self,
        input: &Tensor,
        target: &Tensor,
        instance_weight: Option<&Tensor>,
    ) -> Result<Tensor> {
        let (n, _c) = input.dims2()?;
        let target = target.reshape((n,))?.to_dtype(DType::U32)?;

        let log_probs = ops::log_softmax(input, D::Minus1)?;
        // negative log-likelihood at the target index, one value per sample
        let picked = log_probs
            .gather(&target.unsqueeze(1)?, 1)?
            .squeeze(1)?;
        let mut losses = picked.neg()?;

        if let Some(weight) = &self.class_weight {
            let per_sample = weight.gather(&target, 0)?.to_dtype(losses.dtype())?;
            losses = (losses * per_sample)?;
        }
        if let Some(iw) = instance_weight {
            let iw = iw.reshape((n,))?.to_dtype(losses.dtype())?;
            losses = (losses * iw)?;
        }

        Ok(match self.reduction {
            ReductionType::Mean => losses.mean_all()?,
            ReductionType::Sum => losses.sum_all()?,
            ReductionType::None => losses,
        })
    }
}

impl Default for CrossEntropy {
    fn default() -> Self {
        Self::new(None, ReductionType::Mean)
    }
}

/// Loss wrapper that balances a batch across (y, s) subgroups online.
///
/// Each sample's loss is divided by the cardinality of its subgroup within
/// the batch, then everything is summed, so a subgroup's contribution does
/// not grow with its frequency.
pub struct OnlineReweightingLoss {
    loss_fn: CrossEntropy,
}

impl OnlineReweightingLoss {
    pub fn new() -> Self {
        // the base loss must produce instance-wise values for the
        // subgroup reweighting to apply
        Self {
            loss_fn: CrossEntropy::new(None, ReductionType::None),
        }
    }

    pub fn forward(&self, logits: &Tensor, targets: &Tensor, subgroups: &Tensor) -> Result<Tensor> {
        let losses = self.loss_fn.forward(logits, targets, None)?;
        let n = losses.dim(0)?;

        let y = targets.reshape((n,))?.to_dtype(DType::I64)?.to_vec1::<i64>()?;
        let s = subgroups
            .reshape((n,))?
            .to_dtype(DType::I64)?
            .to_vec1::<i64>()?;
        if y.len() != s.len() {
            return Err(FbError::Data(format!(
                "targets ({}) and subgroups ({}) differ in length",
                y.len(),
                s.len()
            )));
        }

        let mut counts = std::collections::HashMap::new();
        for pair in y.iter().zip(s.iter()) {
            *counts.entry(pair).or_insert(0usize) += 1;
        }
        let weights: Vec<f32> = y
            .iter()
            .zip(s.iter())
            .map(|pair| 1.0 / counts[&pair] as f32)
            .collect();
        let weights = Tensor::from_slice(&weights, (n,), losses.device())?;

        Ok((losses * weights)?.sum_all()?)
    }
}

impl Default for OnlineReweightingLoss {
    fn default() -> Self {
        Self::new()
    }
}
