//! Model definitions and shared model utilities.

pub mod encoder;
pub mod erm;
pub mod memory_bank;
pub mod moco;

pub use encoder::{ConvEncoder, ConvEncoderConfig, Encoder, MlpEncoder};
pub use erm::FineTuner;
pub use memory_bank::MemoryBank;
pub use moco::{MoCoV2, MocoConfig};

use candle_core::{DType, Tensor, D};

use crate::Result;

/// Fraction of samples whose arg-max prediction matches the target.
pub fn accuracy(logits: &Tensor, targets: &Tensor) -> Result<f32> {
    let n = logits.dim(0)?;
    let preds = logits.argmax(D::Minus1)?.to_dtype(DType::I64)?.to_vec1::<i64>()?;
    let targets = targets.reshape((n,))?.to_dtype(DType::I64)?.to_vec1::<i64>()?;
    let correct = preds
        .iter()
        .zip(targets.iter())
        .filter(|(p, t)| p == t)
        .count();
    Ok(correct as f32 / n as f32)
}

/// Top-k precision for each requested k: the fraction of samples whose
/// target ranks among the k highest logits.
pub fn precision_at_k(logits: &Tensor, targets: &Tensor, top_k: &[usize]) -> Result<Vec<f32>> {
    let (n, _c) = logits.dims2()?;
    let rows = logits.to_dtype(DType::F32)?.to_vec2::<f32>()?;
    let targets = targets.reshape((n,))?.to_dtype(DType::I64)?.to_vec1::<i64>()?;

    let mut results = Vec::with_capacity(top_k.len());
    for &k in top_k {
        let mut hits = 0usize;
        for (row, &target) in rows.iter().zip(targets.iter()) {
            let target_score = row[target as usize];
            // rank = how many classes score strictly higher than the target
            let rank = row.iter().filter(|&&v| v > target_score).count();
            if rank < k {
                hits += 1;
            }
        }
        results.push(hits as f32 / n as f32);
    }
    Ok(results)
}
