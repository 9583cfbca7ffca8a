//! Linear evaluation of a frozen encoder.

use candle_core::{DType, Device, Tensor};
use candle_nn::{AdamW, Linear, Module, Optimizer, ParamsAdamW, VarBuilder, VarMap};

use crate::data::structures::TensorBatch;
use crate::fair::losses::{CrossEntropy, ReductionType};
use crate::models::encoder::Encoder;
use crate::models::accuracy;
use crate::{FbError, Result};

/// A frozen encoder with a trainable linear classification head, the
/// standard protocol for evaluating self-supervised representations.
///
/// Only the head's parameters are handed to the optimizer; the encoder's
/// features are detached so no gradient reaches it.
pub struct FineTuner<'a, E: Encoder> {
    encoder: &'a E,
    classifier: Linear,
    optimizer: AdamW,
    loss_fn: CrossEntropy,
}

impl<'a, E: Encoder> FineTuner<'a, E> {
    pub fn new(encoder: &'a E, num_classes: usize, lr: f64, device: &Device) -> Result<Self> {
        if num_classes < 2 {
            return Err(FbError::Config(
                "a classifier needs at least two classes".to_string(),
            ));
        }
        let head_vars = VarMap::new();
        let vb = VarBuilder::from_varmap(&head_vars, DType::F32, device);
        let classifier = candle_nn::linear(encoder.out_dim(), num_classes, vb.pp("clf"))?;
        let optimizer = AdamW::new(
            head_vars.all_vars(),
            ParamsAdamW {
                lr,
                ..Default::default()
            },
        )?;
        Ok(Self {
            encoder,
            classifier,
            optimizer,
            loss_fn: CrossEntropy::new(None, ReductionType::Mean),
        })
    }

    pub fn forward(&self, x: &Tensor) -> Result<Tensor> {
        let features = self.encoder.forward(x)?.detach();
        Ok(self.classifier.forward(&features)?)
    }

    /// One supervised step on the head; returns (loss, accuracy).
    pub fn training_step(&mut self, batch: &TensorBatch) -> Result<(f32, f32)> {
        let logits = self.forward(&batch.x)?;
        let loss = self.loss_fn.forward(&logits, batch.y()?, None)?;
        self.optimizer.backward_step(&loss)?;
        Ok((loss.to_scalar::<f32>()?, accuracy(&logits, batch.y()?)?))
    }

    /// Accuracy on one evaluation batch.
    pub fn eval_step(&self, batch: &TensorBatch) -> Result<f32> {
        accuracy(&self.forward(&batch.x)?, batch.y()?)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::encoder::MlpEncoder;

    #[test]
    fn test_head_learns_a_linear_task() -> Result<()> {
        let device = Device::Cpu;
        let enc_vars = VarMap::new();
        let vb = VarBuilder::from_varmap(&enc_vars, DType::F32, &device);
        let encoder = MlpEncoder::new(4, &[], 4, vb)?;

        let mut tuner = FineTuner::new(&encoder, 2, 0.05, &device)?;
        let x = Tensor::from_slice(
            &[1.0f32, 0.0, 0.0, 0.0, 0.0, 1.0, 0.0, 0.0].repeat(4),
            (8, 4),
            &device,
        )?;
        let y = Tensor::from_slice(&[0i64, 1].repeat(4), (8,), &device)?;
        let batch = TensorBatch {
            x,
            y: Some(y),
            s: None,
            iw: None,
        };

        let (first_loss, _) = tuner.training_step(&batch)?;
        let mut last = (first_loss, 0.0);
        for _ in 0..50 {
            last = tuner.training_step(&batch)?;
        }
        assert!(last.0 < first_loss, "loss should decrease: {first_loss} -> {}", last.0);
        assert!(last.1 > 0.9, "accuracy should approach 1, got {}", last.1);
        Ok(())
    }

    #[test]
    fn test_rejects_single_class() -> Result<()> {
        let device = Device::Cpu;
        let enc_vars = VarMap::new();
        let vb = VarBuilder::from_varmap(&enc_vars, DType::F32, &device);
        let encoder = MlpEncoder::new(4, &[], 4, vb)?;
        assert!(FineTuner::new(&encoder, 1, 0.05, &device).is_err());
        Ok(())
    }
}
